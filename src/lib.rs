pub mod agent;
pub mod command;
pub mod config;
pub mod dispatch;
pub mod error;
pub mod farm;
pub mod heartbeat;
pub mod identity;
pub mod jobs;
pub mod logging;
pub mod node;
pub mod render;
pub mod shutdown;
pub mod storage;
pub mod submission;
pub mod wake;

pub use error::{FarmError, Result};

/// Wall-clock milliseconds since the Unix epoch. Persisted timestamps use
/// this everywhere; policy timers use `std::time::Instant` instead.
pub fn now_ms() -> i64 {
    chrono::Utc::now().timestamp_millis()
}
