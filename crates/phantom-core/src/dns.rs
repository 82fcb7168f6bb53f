//! Resolvers handed to clients.
//!
//! The servers live in `phantom.json`; exported client configs read them at
//! render time, so a change applies to every later export.

use std::net::Ipv4Addr;
use std::time::Instant;

use phantom_system::{Executor, SystemCommand};
use serde::Serialize;
use tracing::{info, warn};

use crate::context::Context;
use crate::error::{PhantomError, Result};
use crate::validate;

/// Domain resolved by `test_dns_servers` when none is given.
pub const DEFAULT_TEST_DOMAIN: &str = "google.com";

/// Domains resolved by `status`.
pub const HEALTH_DOMAINS: &[&str] = &["google.com", "cloudflare.com"];

/// Result of `get_dns_servers`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct DnsServers {
    /// Primary resolver.
    pub primary: Ipv4Addr,
    /// Secondary resolver.
    pub secondary: Ipv4Addr,
}

/// Result of `change_dns_servers`.
#[derive(Debug, Clone, Serialize)]
pub struct DnsChange {
    /// Always true.
    pub success: bool,
    /// New values.
    pub dns_servers: DnsServers,
    /// Values before the change.
    pub previous: DnsServers,
    /// Summary.
    pub message: String,
}

/// One server probed by `test_dns_servers`.
#[derive(Debug, Clone, Serialize)]
pub struct ServerProbe {
    /// Resolver address.
    pub server: String,
    /// The lookup succeeded.
    pub success: bool,
    /// `ok` or `failed`.
    pub status: &'static str,
    /// Wall time of the lookup.
    pub response_time_ms: Option<u64>,
    /// Domain looked up.
    pub test_domain: String,
    /// Failure reason.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

/// Result of `test_dns_servers`.
#[derive(Debug, Clone, Serialize)]
pub struct DnsTestReport {
    /// Every probe succeeded.
    pub all_passed: bool,
    /// Servers probed.
    pub servers_tested: usize,
    /// Per-server results.
    pub results: Vec<ServerProbe>,
}

/// One domain lookup in `status`.
#[derive(Debug, Clone, Serialize)]
pub struct DomainCheck {
    /// Domain looked up.
    pub domain: String,
    /// An answer came back.
    pub success: bool,
    /// First answer line.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub response: Option<String>,
}

/// All lookups against one server in `status`.
#[derive(Debug, Clone, Serialize)]
pub struct ServerHealth {
    /// Resolver address.
    pub server: String,
    /// Per-domain results.
    pub tests: Vec<DomainCheck>,
}

/// Health block of `status`.
#[derive(Debug, Clone, Serialize)]
pub struct DnsHealth {
    /// `healthy` when every lookup answered, else `degraded`.
    pub status: &'static str,
    /// Per-server results.
    pub test_results: Vec<ServerHealth>,
}

/// Result of `status`.
#[derive(Debug, Clone, Serialize)]
pub struct DnsStatus {
    /// Configured resolvers.
    pub configuration: DnsServers,
    /// Live checks.
    pub health: DnsHealth,
}

/// DNS configuration and checks.
#[derive(Clone, Debug)]
pub struct DnsManager {
    ctx: Context,
}

impl DnsManager {
    /// Creates a manager.
    #[must_use]
    pub fn new(ctx: Context) -> Self {
        Self { ctx }
    }

    /// Configured resolvers.
    pub fn get_dns_servers(&self) -> Result<DnsServers> {
        let config = self.ctx.load_config()?;
        Ok(DnsServers {
            primary: config.dns.primary,
            secondary: config.dns.secondary,
        })
    }

    /// Replaces one or both resolvers; omitted ones keep their value.
    pub fn change_dns_servers(
        &self,
        primary: Option<&str>,
        secondary: Option<&str>,
    ) -> Result<DnsChange> {
        let primary = primary.filter(|s| !s.trim().is_empty());
        let secondary = secondary.filter(|s| !s.trim().is_empty());
        if primary.is_none() && secondary.is_none() {
            return Err(PhantomError::MissingParameter("primary".to_string()));
        }

        let mut config = self.ctx.load_config()?;
        let previous = DnsServers {
            primary: config.dns.primary,
            secondary: config.dns.secondary,
        };
        if let Some(p) = primary {
            config.dns.primary = validate::ipv4(p, "primary")?;
        }
        if let Some(s) = secondary {
            config.dns.secondary = validate::ipv4(s, "secondary")?;
        }
        self.ctx.save_config(&config)?;

        let current = DnsServers {
            primary: config.dns.primary,
            secondary: config.dns.secondary,
        };
        info!(primary = %current.primary, secondary = %current.secondary, "dns servers changed");
        Ok(DnsChange {
            success: true,
            dns_servers: current,
            previous,
            message: "DNS configuration updated globally".to_string(),
        })
    }

    /// Resolves `domain` through each server with `nslookup`. Invalid
    /// addresses are skipped.
    pub async fn test_dns_servers(
        &self,
        servers: Option<&[String]>,
        domain: Option<&str>,
    ) -> Result<DnsTestReport> {
        let candidates: Vec<String> = match servers.filter(|s| !s.is_empty()) {
            Some(list) => list.to_vec(),
            None => {
                let current = self.get_dns_servers()?;
                vec![current.primary.to_string(), current.secondary.to_string()]
            }
        };
        let domain = domain.filter(|d| !d.is_empty()).unwrap_or(DEFAULT_TEST_DOMAIN);
        validate::domain(domain)?;

        let valid: Vec<Ipv4Addr> = candidates
            .iter()
            .filter_map(|s| match validate::ipv4(s, "servers") {
                Ok(ip) => Some(ip),
                Err(err) => {
                    warn!(server = %s, error = %err, "skipping invalid dns server");
                    None
                }
            })
            .collect();
        if valid.is_empty() {
            return Err(PhantomError::validation("No valid DNS servers to test"));
        }

        let mut results = Vec::with_capacity(valid.len());
        for server in &valid {
            results.push(probe(self.ctx.executor(), *server, domain).await);
        }
        Ok(DnsTestReport {
            all_passed: results.iter().all(|r| r.success),
            servers_tested: results.len(),
            results,
        })
    }

    /// Configured resolvers plus a `dig` check of each against
    /// [`HEALTH_DOMAINS`].
    pub async fn status(&self) -> Result<DnsStatus> {
        let configuration = self.get_dns_servers()?;
        let mut test_results = Vec::new();
        for server in [configuration.primary, configuration.secondary] {
            let mut tests = Vec::new();
            for domain in HEALTH_DOMAINS {
                tests.push(dig(self.ctx.executor(), server, domain).await);
            }
            test_results.push(ServerHealth {
                server: server.to_string(),
                tests,
            });
        }
        let healthy = test_results
            .iter()
            .flat_map(|s| &s.tests)
            .all(|t| t.success);
        Ok(DnsStatus {
            configuration,
            health: DnsHealth {
                status: if healthy { "healthy" } else { "degraded" },
                test_results,
            },
        })
    }
}

async fn probe(executor: &dyn Executor, server: Ipv4Addr, domain: &str) -> ServerProbe {
    let cmd = SystemCommand::new("nslookup").args([domain.to_string(), server.to_string()]);
    let started = Instant::now();
    let outcome = executor.run(&cmd).await;
    let elapsed = u64::try_from(started.elapsed().as_millis()).unwrap_or(u64::MAX);
    let error = match outcome {
        Ok(out) if out.success() && !out.stdout.contains("can't find") => None,
        Ok(out) => Some(
            Some(out.stderr.trim())
                .filter(|s| !s.is_empty())
                .unwrap_or("lookup failed")
                .to_string(),
        ),
        Err(err) => Some(err.to_string()),
    };
    ServerProbe {
        server: server.to_string(),
        success: error.is_none(),
        status: if error.is_none() { "ok" } else { "failed" },
        response_time_ms: error.is_none().then_some(elapsed),
        test_domain: domain.to_string(),
        error,
    }
}

async fn dig(executor: &dyn Executor, server: Ipv4Addr, domain: &str) -> DomainCheck {
    let cmd = SystemCommand::new("dig").args([
        format!("@{server}"),
        domain.to_string(),
        "+short".to_string(),
        "+time=2".to_string(),
        "+tries=1".to_string(),
    ]);
    let response = match executor.run(&cmd).await {
        Ok(out) if out.success() => out
            .stdout
            .lines()
            .map(str::trim)
            .find(|l| !l.is_empty())
            .map(str::to_string),
        _ => None,
    };
    DomainCheck {
        domain: domain.to_string(),
        success: response.is_some(),
        response,
    }
}
