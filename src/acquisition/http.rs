//! Network-backed extraction sources. Each is thin: fetch, hand the markup or
//! JSON to a parser, map HTTP outcomes onto [`SourceError`].

use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::acquisition::parse::parse_offer;
use crate::acquisition::source::{Extraction, ExtractionSource, RetryPolicy, SourceError};
use crate::config::FetchConfig;
use crate::types::{EgressRoute, Target, Tier};

const USER_AGENT: &str = "Mozilla/5.0 (Macintosh; Intel Mac OS X 10_15_7) \
                          AppleWebKit/537.36 (KHTML, like Gecko) \
                          Chrome/131.0.0.0 Safari/537.36";

fn client_for(route: &EgressRoute, timeout: Duration) -> Result<reqwest::Client, SourceError> {
    let mut builder = reqwest::Client::builder()
        .timeout(timeout)
        .redirect(reqwest::redirect::Policy::limited(5))
        .user_agent(USER_AGENT);
    if let Some(url) = route.proxy_url() {
        builder = builder.proxy(reqwest::Proxy::all(url)?);
    }
    Ok(builder.build()?)
}

/// 403 and 429 mean the route is refused; anything else non-2xx is a plain failure.
fn check_status(status: reqwest::StatusCode) -> Result<(), SourceError> {
    if status.is_success() {
        return Ok(());
    }
    match status.as_u16() {
        s @ (403 | 429) => Err(SourceError::Blocked(s)),
        s => Err(SourceError::Status(s)),
    }
}

fn extraction_from_markup(html: &str) -> Extraction {
    let offer = parse_offer(html);
    Extraction {
        price: offer.price,
        in_stock: offer.available.unwrap_or(true),
        self_confidence: None,
        agrees_with_other: None,
    }
}

// ---------------------------------------------------------------------------
// Direct page fetch
// ---------------------------------------------------------------------------

/// Plain GET of the listing page.
pub struct PageSource {
    policy: RetryPolicy,
}

impl PageSource {
    pub fn new(cfg: &FetchConfig) -> Self {
        Self { policy: RetryPolicy::from_config(cfg) }
    }
}

#[async_trait]
impl ExtractionSource for PageSource {
    fn name(&self) -> &'static str {
        "page"
    }

    async fn extract(&self, target: &Target, route: &EgressRoute) -> Result<Extraction, SourceError> {
        let client = &client_for(route, self.policy.timeout)?;
        let url = target.url.as_str();
        let body = self
            .policy
            .run(move || async move {
                let resp = client.get(url).send().await?;
                check_status(resp.status())?;
                Ok::<_, SourceError>(resp.text().await?)
            })
            .await?;
        debug!(coin = %target.coin_id, vendor = %target.vendor_id, route = route.name(), bytes = body.len(), "Fetched page");
        Ok(extraction_from_markup(&body))
    }
}

// ---------------------------------------------------------------------------
// Rendering service
// ---------------------------------------------------------------------------

#[derive(Serialize)]
struct RenderRequest<'a> {
    url: &'a str,
    proxy: Option<&'a str>,
}

/// Posts the listing URL to a headless rendering service and parses the
/// rendered markup it returns.
pub struct RenderServiceSource {
    endpoint: String,
    client: reqwest::Client,
    policy: RetryPolicy,
}

impl RenderServiceSource {
    pub fn new(endpoint: &str, cfg: &FetchConfig) -> Result<Self, SourceError> {
        let policy = RetryPolicy::from_config(cfg);
        Ok(Self {
            endpoint: endpoint.to_string(),
            client: client_for(&EgressRoute::Direct, policy.timeout)?,
            policy,
        })
    }
}

#[async_trait]
impl ExtractionSource for RenderServiceSource {
    fn name(&self) -> &'static str {
        "render"
    }

    async fn extract(&self, target: &Target, route: &EgressRoute) -> Result<Extraction, SourceError> {
        let request = &RenderRequest { url: &target.url, proxy: route.proxy_url() };
        let body = self
            .policy
            .run(move || async move {
                let resp = self.client.post(&self.endpoint).json(request).send().await?;
                check_status(resp.status())?;
                Ok::<_, SourceError>(resp.text().await?)
            })
            .await?;
        if body.trim().is_empty() {
            return Err(SourceError::Parse("render service returned no content".to_string()));
        }
        Ok(extraction_from_markup(&body))
    }
}

// ---------------------------------------------------------------------------
// Visual verification service
// ---------------------------------------------------------------------------

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct VerifyRequest<'a> {
    url: &'a str,
    coin_id: &'a str,
    vendor_id: &'a str,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct VerifyResponse {
    price: Option<f64>,
    in_stock: Option<bool>,
    self_confidence: Option<String>,
    agrees_with_other: Option<bool>,
}

impl From<VerifyResponse> for Extraction {
    fn from(r: VerifyResponse) -> Self {
        Extraction {
            price: r.price.filter(|p| p.is_finite() && *p > 0.0),
            in_stock: r.in_stock.unwrap_or(true),
            self_confidence: r.self_confidence.as_deref().and_then(Tier::parse),
            agrees_with_other: r.agrees_with_other,
        }
    }
}

/// Independent reading from the visual verification service.
pub struct VerificationServiceSource {
    endpoint: String,
    client: reqwest::Client,
    policy: RetryPolicy,
}

impl VerificationServiceSource {
    pub fn new(endpoint: &str, cfg: &FetchConfig) -> Result<Self, SourceError> {
        let policy = RetryPolicy::from_config(cfg);
        Ok(Self {
            endpoint: endpoint.to_string(),
            client: client_for(&EgressRoute::Direct, policy.timeout)?,
            policy,
        })
    }
}

#[async_trait]
impl ExtractionSource for VerificationServiceSource {
    fn name(&self) -> &'static str {
        "verify"
    }

    async fn extract(&self, target: &Target, _route: &EgressRoute) -> Result<Extraction, SourceError> {
        let request = &VerifyRequest {
            url: &target.url,
            coin_id: &target.coin_id,
            vendor_id: &target.vendor_id,
        };
        let body = self
            .policy
            .run(move || async move {
                let resp = self.client.post(&self.endpoint).json(request).send().await?;
                check_status(resp.status())?;
                Ok::<_, SourceError>(resp.text().await?)
            })
            .await?;
        let parsed: VerifyResponse =
            serde_json::from_str(&body).map_err(|e| SourceError::Parse(e.to_string()))?;
        Ok(parsed.into())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn verify_response_maps_tier_and_agreement() {
        let r: VerifyResponse = serde_json::from_str(
            r#"{"price": 36.5, "inStock": true, "selfConfidence": "High", "agreesWithOther": true}"#,
        )
        .unwrap();
        let e = Extraction::from(r);
        assert_eq!(e.price, Some(36.5));
        assert!(e.in_stock);
        assert_eq!(e.self_confidence, Some(Tier::High));
        assert_eq!(e.agrees_with_other, Some(true));
    }

    #[test]
    fn verify_response_with_nothing_found() {
        let r: VerifyResponse = serde_json::from_str(r#"{"price": null, "inStock": false}"#).unwrap();
        let e = Extraction::from(r);
        assert_eq!(e.price, None);
        assert!(!e.in_stock);
        assert_eq!(e.self_confidence, None);
    }

    #[test]
    fn refused_statuses_are_blocks() {
        assert!(matches!(check_status(reqwest::StatusCode::FORBIDDEN), Err(SourceError::Blocked(403))));
        assert!(matches!(check_status(reqwest::StatusCode::TOO_MANY_REQUESTS), Err(SourceError::Blocked(429))));
        assert!(matches!(check_status(reqwest::StatusCode::BAD_GATEWAY), Err(SourceError::Status(502))));
        assert!(check_status(reqwest::StatusCode::OK).is_ok());
    }

    #[test]
    fn markup_without_availability_defaults_to_in_stock() {
        let e = extraction_from_markup(r#"<meta property="product:price:amount" content="36.10">"#);
        assert_eq!(e.price, Some(36.10));
        assert!(e.in_stock);
    }
}
