pub mod behaviour;
pub mod relay;
pub mod stream_protocol;

pub use relay::{METRICS_PUBLISH_INTERVAL, Relay};
