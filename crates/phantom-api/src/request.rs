//! Typed requests, one enum per module.
//!
//! Each enum is tagged by `action`, so `{"action": "add_client",
//! "client_name": "alice"}` decodes to [`CoreRequest::AddClient`].
//! [`Request::parse`] checks the module and action names before decoding
//! so that an unknown action and a malformed parameter fail differently.

use std::fmt;
use std::str::FromStr;

use phantom_core::PhantomError;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use thiserror::Error;

use crate::params;

/// Errors turning `(module, action, params)` into a [`Request`].
#[derive(Debug, Error, PartialEq, Eq)]
pub enum RequestError {
    /// No such module.
    #[error("Module '{0}' not found. Available modules: core, dns, ghost, multihop")]
    UnknownModule(String),

    /// The module has no such action.
    #[error("Unknown action '{action}' for module '{module}'")]
    UnknownAction {
        /// Module name.
        module: Module,
        /// Requested action.
        action: String,
    },

    /// A parameter has the wrong shape.
    #[error("Invalid parameters for {module}.{action}: {reason}")]
    InvalidParams {
        /// Module name.
        module: Module,
        /// Action name.
        action: String,
        /// Decoder message.
        reason: String,
    },
}

impl From<RequestError> for PhantomError {
    fn from(err: RequestError) -> Self {
        match err {
            RequestError::UnknownModule(_) | RequestError::UnknownAction { .. } => {
                Self::UnknownAction(err.to_string())
            }
            RequestError::InvalidParams { .. } => Self::validation(err.to_string()),
        }
    }
}

/// The four action modules.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Module {
    /// Clients, service, tweaks, subnet.
    Core,
    /// Client DNS servers.
    Dns,
    /// TLS WebSocket transport.
    Ghost,
    /// Egress through an upstream exit.
    Multihop,
}

impl Module {
    /// Catalogue order.
    pub const ALL: [Self; 4] = [Self::Core, Self::Dns, Self::Multihop, Self::Ghost];

    /// Wire name.
    #[must_use]
    pub const fn name(self) -> &'static str {
        match self {
            Self::Core => "core",
            Self::Dns => "dns",
            Self::Ghost => "ghost",
            Self::Multihop => "multihop",
        }
    }

    /// One-line description for the catalogue.
    #[must_use]
    pub const fn description(self) -> &'static str {
        match self {
            Self::Core => "Core WireGuard client and server management",
            Self::Dns => "Standard DNS server management",
            Self::Ghost => "Censorship-resistant WireGuard connections using wstunnel",
            Self::Multihop => {
                "Route traffic through external VPN providers while keeping WireGuard peer access"
            }
        }
    }

    /// Action names, in the order they are documented.
    #[must_use]
    pub const fn actions(self) -> &'static [&'static str] {
        match self {
            Self::Core => &[
                "add_client",
                "remove_client",
                "list_clients",
                "export_client",
                "latest_clients",
                "server_status",
                "service_logs",
                "restart_service",
                "get_firewall_status",
                "get_tweak_settings",
                "update_tweak_setting",
                "get_subnet_info",
                "validate_subnet_change",
                "change_subnet",
            ],
            Self::Dns => &[
                "get_dns_servers",
                "change_dns_servers",
                "test_dns_servers",
                "status",
            ],
            Self::Ghost => &["enable", "disable", "status"],
            Self::Multihop => &[
                "import_vpn_config",
                "remove_vpn_config",
                "list_exits",
                "enable_multihop",
                "disable_multihop",
                "reset_state",
                "status",
                "test_vpn",
                "get_session_log",
            ],
        }
    }

    /// Returns true if `action` belongs to this module.
    #[must_use]
    pub fn has_action(self, action: &str) -> bool {
        self.actions().contains(&action)
    }
}

impl fmt::Display for Module {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl FromStr for Module {
    type Err = RequestError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::ALL
            .into_iter()
            .find(|m| m.name() == s)
            .ok_or_else(|| RequestError::UnknownModule(s.to_string()))
    }
}

/// `core` actions.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(tag = "action", rename_all = "snake_case")]
pub enum CoreRequest {
    /// Create a client.
    AddClient {
        /// New client's name.
        #[serde(default, deserialize_with = "params::text")]
        client_name: Option<String>,
    },
    /// Delete a client.
    RemoveClient {
        /// Client to delete.
        #[serde(default, deserialize_with = "params::text")]
        client_name: Option<String>,
    },
    /// Page through clients.
    ListClients {
        /// 1-based page.
        #[serde(default, deserialize_with = "params::count")]
        page: Option<usize>,
        /// Page size.
        #[serde(default, deserialize_with = "params::count")]
        per_page: Option<usize>,
        /// Case-insensitive name filter.
        #[serde(default, deserialize_with = "params::text")]
        search: Option<String>,
    },
    /// Render a client's config.
    ExportClient {
        /// Client to export.
        #[serde(default, deserialize_with = "params::text")]
        client_name: Option<String>,
    },
    /// Newest clients.
    LatestClients {
        /// How many.
        #[serde(default, deserialize_with = "params::count")]
        count: Option<usize>,
    },
    /// Service, interface and client summary.
    ServerStatus,
    /// Journal lines of the WireGuard unit.
    ServiceLogs {
        /// How many lines.
        #[serde(default, deserialize_with = "params::count")]
        lines: Option<usize>,
    },
    /// Restart the WireGuard unit.
    RestartService,
    /// Filter rules relevant to WireGuard.
    GetFirewallStatus,
    /// All tweaks.
    GetTweakSettings,
    /// Set one tweak.
    UpdateTweakSetting {
        /// Tweak name.
        #[serde(default, deserialize_with = "params::text")]
        setting_name: Option<String>,
        /// New value; must be a JSON boolean.
        #[serde(default)]
        value: Option<Value>,
    },
    /// Subnet usage and blockers.
    GetSubnetInfo,
    /// Dry run of a subnet change.
    ValidateSubnetChange {
        /// Candidate subnet.
        #[serde(default, deserialize_with = "params::text")]
        new_subnet: Option<String>,
    },
    /// Migrate to a new subnet.
    ChangeSubnet {
        /// Target subnet.
        #[serde(default, deserialize_with = "params::text")]
        new_subnet: Option<String>,
        /// Must be true.
        #[serde(default, deserialize_with = "params::flag")]
        confirm: Option<bool>,
    },
}

/// `dns` actions.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(tag = "action", rename_all = "snake_case")]
pub enum DnsRequest {
    /// Configured resolvers.
    GetDnsServers,
    /// Replace one or both resolvers.
    ChangeDnsServers {
        /// New primary.
        #[serde(default, deserialize_with = "params::text")]
        primary: Option<String>,
        /// New secondary.
        #[serde(default, deserialize_with = "params::text")]
        secondary: Option<String>,
    },
    /// Resolve a name through each server.
    TestDnsServers {
        /// Servers to test; the configured pair when absent.
        #[serde(default, deserialize_with = "params::list")]
        servers: Option<Vec<String>>,
        /// Name to resolve.
        #[serde(default, deserialize_with = "params::text")]
        domain: Option<String>,
    },
    /// Resolvers plus health checks.
    Status,
}

/// `ghost` actions.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(tag = "action", rename_all = "snake_case")]
pub enum GhostRequest {
    /// Put WireGuard behind wstunnel on 443.
    Enable {
        /// Domain whose A record points here.
        #[serde(default, deserialize_with = "params::text")]
        domain: Option<String>,
    },
    /// Undo `enable`.
    Disable,
    /// Current state.
    Status,
}

/// `multihop` actions.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(tag = "action", rename_all = "snake_case")]
pub enum MultihopRequest {
    /// Import an exit config.
    ImportVpnConfig {
        /// Path of the WireGuard config to import.
        #[serde(default, deserialize_with = "params::text")]
        config_path: Option<String>,
        /// Name to store it under.
        #[serde(default, deserialize_with = "params::text")]
        custom_name: Option<String>,
    },
    /// Delete an exit.
    RemoveVpnConfig {
        /// Exit to delete.
        #[serde(default, deserialize_with = "params::text")]
        exit_name: Option<String>,
    },
    /// Imported exits.
    ListExits,
    /// Route clients through an exit.
    EnableMultihop {
        /// Exit to use.
        #[serde(default, deserialize_with = "params::text")]
        exit_name: Option<String>,
    },
    /// Return to direct egress.
    DisableMultihop,
    /// Remove every multihop artifact.
    ResetState,
    /// Current routing state.
    Status,
    /// Probe an exit.
    TestVpn {
        /// Exit to probe; the active one when absent.
        #[serde(default, deserialize_with = "params::text")]
        exit_name: Option<String>,
    },
    /// Tail of the monitor session log.
    GetSessionLog {
        /// How many entries.
        #[serde(default, deserialize_with = "params::count")]
        lines: Option<usize>,
    },
}

/// A decoded action.
#[derive(Debug, Clone, PartialEq)]
pub enum Request {
    /// `core`.
    Core(CoreRequest),
    /// `dns`.
    Dns(DnsRequest),
    /// `ghost`.
    Ghost(GhostRequest),
    /// `multihop`.
    Multihop(MultihopRequest),
}

impl Request {
    /// Decodes `params` as `module.action`.
    ///
    /// # Errors
    ///
    /// [`RequestError`] for unknown names or malformed parameters.
    pub fn parse(module: &str, action: &str, params: Map<String, Value>) -> Result<Self, RequestError> {
        let module: Module = module.parse()?;
        if !module.has_action(action) {
            return Err(RequestError::UnknownAction {
                module,
                action: action.to_string(),
            });
        }
        let mut body = params;
        body.insert("action".to_string(), Value::String(action.to_string()));
        let body = Value::Object(body);
        let invalid = |err: serde_json::Error| RequestError::InvalidParams {
            module,
            action: action.to_string(),
            reason: err.to_string(),
        };
        Ok(match module {
            Module::Core => Self::Core(serde_json::from_value(body).map_err(invalid)?),
            Module::Dns => Self::Dns(serde_json::from_value(body).map_err(invalid)?),
            Module::Ghost => Self::Ghost(serde_json::from_value(body).map_err(invalid)?),
            Module::Multihop => Self::Multihop(serde_json::from_value(body).map_err(invalid)?),
        })
    }

    /// Module the request belongs to.
    #[must_use]
    pub const fn module(&self) -> Module {
        match self {
            Self::Core(_) => Module::Core,
            Self::Dns(_) => Module::Dns,
            Self::Ghost(_) => Module::Ghost,
            Self::Multihop(_) => Module::Multihop,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use test_case::test_case;

    fn params(value: Value) -> Map<String, Value> {
        match value {
            Value::Object(map) => map,
            _ => Map::new(),
        }
    }

    #[test]
    fn every_listed_action_decodes() {
        for module in Module::ALL {
            for action in module.actions() {
                let request = Request::parse(module.name(), action, Map::new())
                    .unwrap_or_else(|err| unreachable!("{module}.{action}: {err}"));
                assert_eq!(request.module(), module);
            }
        }
    }

    #[test]
    fn parameters_reach_the_variant() {
        let request = Request::parse(
            "core",
            "list_clients",
            params(json!({"page": 2, "per_page": "5", "search": "ali"})),
        )
        .expect("decode");
        assert_eq!(
            request,
            Request::Core(CoreRequest::ListClients {
                page: Some(2),
                per_page: Some(5),
                search: Some("ali".to_string()),
            })
        );

        let request = Request::parse(
            "core",
            "update_tweak_setting",
            params(json!({"setting_name": "x", "value": "true"})),
        )
        .expect("decode");
        assert_eq!(
            request,
            Request::Core(CoreRequest::UpdateTweakSetting {
                setting_name: Some("x".to_string()),
                value: Some(json!("true")),
            })
        );
    }

    #[test]
    fn action_parameter_cannot_redirect() {
        let request = Request::parse("ghost", "status", params(json!({"action": "disable"})))
            .expect("decode");
        assert_eq!(request, Request::Ghost(GhostRequest::Status));
    }

    #[test_case("vpn", "status", "Module 'vpn' not found. Available modules: core, dns, ghost, multihop")]
    #[test_case("ghost", "list_exits", "Unknown action 'list_exits' for module 'ghost'")]
    #[test_case("core", "", "Unknown action '' for module 'core'")]
    fn unknown_names(module: &str, action: &str, message: &str) {
        let err = Request::parse(module, action, Map::new()).expect_err("unknown");
        assert_eq!(err.to_string(), message);
        assert_eq!(PhantomError::from(err).code(), "UNKNOWN_ACTION");
    }

    #[test]
    fn malformed_parameter_is_a_validation_error() {
        let err = Request::parse("core", "latest_clients", params(json!({"count": "many"})))
            .expect_err("bad count");
        assert!(matches!(err, RequestError::InvalidParams { .. }));
        assert_eq!(PhantomError::from(err).code(), "VALIDATION_ERROR");
    }
}
