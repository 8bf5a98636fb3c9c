//! Configuration validation
//!
//! Missing host/credential/project settings are configuration errors, fatal
//! at startup: the affected backend adapter refuses to operate.

use super::BridgeConfig;
use crate::{BridgeError, Result};

/// Validate a loaded configuration against the active backend
pub fn validate_config(config: &BridgeConfig) -> Result<()> {
    match config.backend.as_str() {
        "redmine" => {
            let redmine = config
                .redmine
                .as_ref()
                .ok_or_else(|| missing("redmine section"))?;
            if redmine.url.trim().is_empty() {
                return Err(missing("redmine.url"));
            }
            if redmine.project_id.trim().is_empty() {
                return Err(missing("redmine.project_id"));
            }
            if redmine.page_limit == 0 {
                return Err(BridgeError::Config(
                    "redmine.page_limit must be greater than zero".to_string(),
                ));
            }
        }
        "zendesk" => {
            let zendesk = config
                .zendesk
                .as_ref()
                .ok_or_else(|| missing("zendesk section"))?;
            if zendesk.url.trim().is_empty() {
                return Err(missing("zendesk.url"));
            }
            if zendesk.group_id.trim().is_empty() {
                return Err(missing("zendesk.group_id"));
            }
        }
        "pivot" => {
            let pivot = config
                .pivot
                .as_ref()
                .ok_or_else(|| missing("pivot section"))?;
            if pivot.exchange_url.trim().is_empty() {
                return Err(missing("pivot.exchange_url"));
            }
            if pivot.academy.trim().is_empty() {
                return Err(missing("pivot.academy"));
            }
        }
        other => {
            return Err(BridgeError::Config(format!(
                "Unknown backend: {} (expected redmine, zendesk or pivot)",
                other
            )));
        }
    }

    if config.poll_interval_secs == 0 {
        return Err(BridgeError::Config(
            "poll_interval_secs must be greater than zero".to_string(),
        ));
    }

    Ok(())
}

fn missing(field: &str) -> BridgeError {
    BridgeError::Config(format!("Missing required setting: {}", field))
}
