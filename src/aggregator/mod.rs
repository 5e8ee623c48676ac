pub mod daily;
pub mod series;
pub mod window;

pub use daily::{daily_rollups, DailyRollup};
pub use series::{rolling_series, SeriesPoint};
pub use window::{floor_window, median, WindowStats};
