//! Common utilities and types shared across pdkv

pub mod config;
pub mod error;
pub mod metrics;
pub mod utils;

pub use config::PdConfig;
pub use error::{CreateRegionStep, Error, Result};
pub use metrics::PdMetrics;
pub use utils::{
    parse_duration, retry_with_backoff, timestamp_now_millis, validate_key, Backoff, RetryOutcome,
};
