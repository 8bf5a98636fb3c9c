//! Configuration loading and validation

mod bridge_config;
mod validation;

pub use bridge_config::{
    BridgeConfig, PivotConfig, RedmineConfig, ZendeskConfig, DEFAULT_POLL_INTERVAL_SECS,
};
pub use validation::validate_config;

pub(crate) use bridge_config::resolve_env_credential;
