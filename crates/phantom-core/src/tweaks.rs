//! Boolean behaviour switches stored in `phantom.json`.

use serde::Serialize;
use serde_json::Value;
use tracing::info;

use crate::context::Context;
use crate::error::{PhantomError, Result};

/// Restart the main service after client changes.
pub const RESTART_AFTER_CLIENT_CHANGE: &str = "restart_service_after_client_creation";

struct Tweak {
    name: &'static str,
    default: bool,
    description: &'static str,
}

const TWEAKS: &[Tweak] = &[Tweak {
    name: RESTART_AFTER_CLIENT_CHANGE,
    default: false,
    description: "Restart WireGuard service after adding & removing clients (causes connection drops)",
}];

fn lookup(name: &str) -> Option<&'static Tweak> {
    TWEAKS.iter().find(|t| t.name == name)
}

/// Registered default for a tweak.
#[must_use]
pub fn default_value(name: &str) -> Option<bool> {
    lookup(name).map(|t| t.default)
}

/// One tweak with its current value.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct TweakInfo {
    /// Setting key.
    pub name: String,
    /// Current value.
    pub value: bool,
    /// What the setting does.
    pub description: String,
}

/// Result of `get_tweak_settings`.
#[derive(Debug, Clone, Serialize)]
pub struct TweakSettings {
    /// All known tweaks.
    pub tweaks: Vec<TweakInfo>,
}

/// Result of `update_tweak_setting`.
#[derive(Debug, Clone, Serialize)]
pub struct TweakUpdate {
    /// Setting key.
    pub setting: String,
    /// Value before the update.
    pub old_value: bool,
    /// Value after the update.
    pub new_value: bool,
    /// What the setting does.
    pub description: String,
    /// Summary.
    pub message: String,
}

/// Reads and updates tweaks.
#[derive(Clone)]
pub struct TweakManager {
    ctx: Context,
}

impl TweakManager {
    /// Creates a manager.
    #[must_use]
    pub fn new(ctx: Context) -> Self {
        Self { ctx }
    }

    /// Lists every tweak with its value and description.
    pub fn get_tweak_settings(&self) -> Result<TweakSettings> {
        let config = self.ctx.load_config()?;
        let tweaks = TWEAKS
            .iter()
            .map(|t| TweakInfo {
                name: t.name.to_string(),
                value: config.tweak(t.name),
                description: t.description.to_string(),
            })
            .collect();
        Ok(TweakSettings { tweaks })
    }

    /// Sets a tweak. Only JSON booleans are accepted.
    pub fn update_tweak_setting(&self, setting_name: &str, value: &Value) -> Result<TweakUpdate> {
        if setting_name.is_empty() {
            return Err(PhantomError::MissingParameter("setting_name".to_string()));
        }
        let tweak = lookup(setting_name).ok_or_else(|| {
            PhantomError::validation(format!("Unknown tweak setting: {setting_name}"))
        })?;
        let Value::Bool(new_value) = *value else {
            return Err(PhantomError::validation(format!(
                "Value for {setting_name} must be a boolean, got {value}"
            )));
        };

        let mut config = self.ctx.load_config()?;
        let old_value = config.tweak(tweak.name);
        config.tweaks.insert(tweak.name.to_string(), new_value);
        self.ctx.save_config(&config)?;
        info!(setting = tweak.name, old_value, new_value, "tweak updated");

        Ok(TweakUpdate {
            setting: tweak.name.to_string(),
            old_value,
            new_value,
            description: tweak.description.to_string(),
            message: format!(
                "{} {}",
                tweak.name,
                if new_value { "enabled" } else { "disabled" }
            ),
        })
    }
}
