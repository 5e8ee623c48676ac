//! Vendor-agnostic offer extraction from product page markup: schema.org
//! JSON-LD first, then microdata, then OpenGraph product meta tags.

use scraper::{ElementRef, Html, Selector};
use serde_json::Value;

/// Price and availability as published by the page. Either may be missing.
#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct Offer {
    pub price: Option<f64>,
    pub available: Option<bool>,
}

impl Offer {
    fn merge(self, fallback: Offer) -> Offer {
        Offer {
            price: self.price.or(fallback.price),
            available: self.available.or(fallback.available),
        }
    }
}

pub fn parse_offer(html: &str) -> Offer {
    let document = Html::parse_document(html);
    from_jsonld(&document)
        .merge(from_microdata(&document))
        .merge(from_meta(&document))
}

// ---------------------------------------------------------------------------
// JSON-LD
// ---------------------------------------------------------------------------

fn from_jsonld(document: &Html) -> Offer {
    let Ok(sel) = Selector::parse(r#"script[type="application/ld+json"]"#) else {
        return Offer::default();
    };
    let mut found = Offer::default();
    for element in document.select(&sel) {
        let text = element.inner_html();
        let Ok(value) = serde_json::from_str::<Value>(text.trim()) else {
            continue;
        };
        let mut products = Vec::new();
        collect_products(&value, &mut products);
        for product in products {
            found = found.merge(product_offer(product));
            if found.price.is_some() && found.available.is_some() {
                return found;
            }
        }
    }
    found
}

fn collect_products<'a>(value: &'a Value, out: &mut Vec<&'a Value>) {
    match value {
        Value::Array(items) => items.iter().for_each(|v| collect_products(v, out)),
        Value::Object(map) => {
            if is_type(value, "Product") {
                out.push(value);
            }
            if let Some(graph) = map.get("@graph") {
                collect_products(graph, out);
            }
        }
        _ => {}
    }
}

fn is_type(value: &Value, wanted: &str) -> bool {
    match value.get("@type") {
        Some(Value::String(t)) => t == wanted,
        Some(Value::Array(ts)) => ts.iter().any(|t| t.as_str() == Some(wanted)),
        _ => false,
    }
}

fn product_offer(product: &Value) -> Offer {
    let offer = match product.get("offers") {
        Some(Value::Array(offers)) => offers.first(),
        other => other,
    };
    let Some(offer) = offer else {
        return Offer::default();
    };
    let price = ["price", "lowPrice"]
        .iter()
        .find_map(|key| offer.get(*key).and_then(json_price));
    let available = offer
        .get("availability")
        .and_then(Value::as_str)
        .and_then(availability);
    Offer { price, available }
}

fn json_price(v: &Value) -> Option<f64> {
    v.as_f64()
        .or_else(|| v.as_str().and_then(parse_price))
        .filter(|p| *p > 0.0)
}

// ---------------------------------------------------------------------------
// Microdata and meta tags
// ---------------------------------------------------------------------------

fn itemprop_text(el: &ElementRef<'_>) -> String {
    el.value()
        .attr("content")
        .or_else(|| el.value().attr("href"))
        .map(str::to_string)
        .unwrap_or_else(|| el.text().collect::<Vec<_>>().join(" ").trim().to_string())
}

fn first_match(document: &Html, selector: &str) -> Option<String> {
    let sel = Selector::parse(selector).ok()?;
    document.select(&sel).next().map(|el| itemprop_text(&el))
}

fn from_microdata(document: &Html) -> Offer {
    Offer {
        price: first_match(document, r#"[itemprop="price"]"#).and_then(|s| parse_price(&s)),
        available: first_match(document, r#"[itemprop="availability"]"#).and_then(|s| availability(&s)),
    }
}

fn from_meta(document: &Html) -> Offer {
    let price = first_match(document, r#"meta[property="product:price:amount"]"#)
        .or_else(|| first_match(document, r#"meta[property="og:price:amount"]"#))
        .and_then(|s| parse_price(&s));
    let available = first_match(document, r#"meta[property="product:availability"]"#)
        .or_else(|| first_match(document, r#"meta[property="og:availability"]"#))
        .and_then(|s| availability(&s));
    Offer { price, available }
}

/// `"$1,234.56"` → 1234.56.
pub fn parse_price(raw: &str) -> Option<f64> {
    let cleaned: String = raw
        .chars()
        .filter(|c| c.is_ascii_digit() || *c == '.')
        .collect();
    cleaned.parse::<f64>().ok().filter(|p| p.is_finite() && *p > 0.0)
}

/// Maps schema.org availability URLs and common meta values to in/out of stock.
pub fn availability(raw: &str) -> Option<bool> {
    let token = raw
        .rsplit('/')
        .next()
        .unwrap_or(raw)
        .trim()
        .to_ascii_lowercase()
        .replace([' ', '_', '-'], "");
    match token.as_str() {
        "instock" | "limitedavailability" | "onlineonly" | "instoreonly" | "preorder"
        | "presale" | "backorder" => Some(true),
        "outofstock" | "soldout" | "discontinued" | "oos" => Some(false),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn jsonld_product_with_offer() {
        let html = r#"<html><head>
            <script type="application/ld+json">
            {"@context":"https://schema.org","@type":"Product","name":"2026 1 oz Silver Eagle",
             "offers":{"@type":"Offer","price":"36.49","priceCurrency":"USD",
                       "availability":"https://schema.org/InStock"}}
            </script></head><body></body></html>"#;
        assert_eq!(parse_offer(html), Offer { price: Some(36.49), available: Some(true) });
    }

    #[test]
    fn jsonld_graph_and_offer_array() {
        let html = r#"<script type="application/ld+json">
            {"@graph":[{"@type":"BreadcrumbList"},
                       {"@type":["Product"],"offers":[{"lowPrice":1449.5,
                        "availability":"http://schema.org/OutOfStock"}]}]}
            </script>"#;
        assert_eq!(parse_offer(html), Offer { price: Some(1449.5), available: Some(false) });
    }

    #[test]
    fn microdata_fills_what_jsonld_lacks() {
        let html = r#"
            <script type="application/ld+json">{"@type":"Product","offers":{"price":"38.10"}}</script>
            <div itemscope itemtype="https://schema.org/Offer">
              <span itemprop="price" content="99.00">$99.00</span>
              <link itemprop="availability" href="https://schema.org/SoldOut" />
            </div>"#;
        let offer = parse_offer(html);
        assert_eq!(offer.price, Some(38.10));
        assert_eq!(offer.available, Some(false));
    }

    #[test]
    fn meta_tags_as_last_resort() {
        let html = r#"<head>
            <meta property="product:price:amount" content="1,234.56">
            <meta property="product:availability" content="in stock">
            </head>"#;
        assert_eq!(parse_offer(html), Offer { price: Some(1234.56), available: Some(true) });
    }

    #[test]
    fn page_without_offer_markup() {
        assert_eq!(parse_offer("<html><body>Just a page</body></html>"), Offer::default());
        assert_eq!(parse_offer(r#"<script type="application/ld+json">{not json</script>"#), Offer::default());
    }

    #[test]
    fn price_strings() {
        assert_eq!(parse_price("$36.49"), Some(36.49));
        assert_eq!(parse_price(" 2,049.00 USD"), Some(2049.0));
        assert_eq!(parse_price("call for price"), None);
        assert_eq!(parse_price("$0.00"), None);
    }
}
