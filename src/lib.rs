pub mod app;
pub mod config;
pub mod errors;
pub mod messages;
pub mod pool;
pub mod stats;
pub mod worker;

/// Render a duration as days plus clock time for session log lines,
/// e.g. `0d 00:02:07.431`.
pub fn format_duration(duration: &chrono::Duration) -> String {
    format!(
        "{}d {:02}:{:02}:{:02}.{:03}",
        duration.num_days(),
        duration.num_hours() % 24,
        duration.num_minutes() % 60,
        duration.num_seconds() % 60,
        duration.num_milliseconds() % 1000,
    )
}
