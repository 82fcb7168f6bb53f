//! Public address discovery and A record checks.

use std::net::Ipv4Addr;

use phantom_system::{Executor, SystemCommand};
use tracing::{debug, warn};

/// Services that echo the caller's address, tried in order.
pub const PUBLIC_IP_SERVICES: &[&str] = &[
    "https://install.phantom.tc/ip",
    "https://ipinfo.io/ip",
    "https://api.ipify.org",
    "https://checkip.amazonaws.com",
];

/// Resolver queried for the A record check.
pub const CHECK_RESOLVER: &str = "8.8.8.8";

/// Asks each service in turn and returns the first well-formed IPv4 answer.
pub async fn public_ip(executor: &dyn Executor) -> Option<Ipv4Addr> {
    for url in PUBLIC_IP_SERVICES {
        let cmd = SystemCommand::new("curl").args(["-s", "--max-time", "10", url]);
        match executor.run(&cmd).await {
            Ok(out) if out.success() => {
                if let Ok(ip) = out.stdout_trimmed().parse::<Ipv4Addr>() {
                    debug!(service = url, ip = %ip, "public ip detected");
                    return Some(ip);
                }
            }
            Ok(out) => debug!(service = url, code = out.exit_code, "ip service failed"),
            Err(err) => warn!(service = url, error = %err, "curl unavailable"),
        }
    }
    None
}

/// Lookup tool and how its output proves the record.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Tool {
    Dig,
    Nslookup,
    Host,
}

impl Tool {
    const ALL: [Self; 3] = [Self::Dig, Self::Nslookup, Self::Host];

    fn command(self, domain: &str) -> SystemCommand {
        match self {
            Self::Dig => SystemCommand::new("dig").args([
                "+short".to_string(),
                domain.to_string(),
                format!("@{CHECK_RESOLVER}"),
            ]),
            Self::Nslookup => SystemCommand::new("nslookup").args([domain, CHECK_RESOLVER]),
            Self::Host => SystemCommand::new("host").args([domain, CHECK_RESOLVER]),
        }
    }

    fn confirms(self, stdout: &str, ip: Ipv4Addr) -> bool {
        let ip = ip.to_string();
        match self {
            Self::Dig => stdout.lines().any(|l| l.trim() == ip),
            Self::Nslookup => stdout
                .lines()
                // The first Address line is the resolver itself.
                .filter(|l| l.contains("Address:"))
                .any(|l| l.split_whitespace().last() == Some(ip.as_str())),
            Self::Host => stdout.contains(&format!("has address {ip}")),
        }
    }
}

/// Returns true if any lookup tool shows `domain` resolving to `ip`.
pub async fn a_record_points_to(executor: &dyn Executor, domain: &str, ip: Ipv4Addr) -> bool {
    for tool in Tool::ALL {
        let cmd = tool.command(domain);
        match executor.run(&cmd).await {
            Ok(out) if out.success() && tool.confirms(&out.stdout, ip) => {
                debug!(domain, ip = %ip, tool = ?tool, "a record confirmed");
                return true;
            }
            Ok(_) => debug!(domain, tool = ?tool, "a record not confirmed"),
            Err(err) => debug!(domain, tool = ?tool, error = %err, "lookup tool unavailable"),
        }
    }
    false
}

#[cfg(test)]
mod tests {
    use super::*;
    use phantom_system::{CommandOutput, ScriptedExecutor};
    use test_case::test_case;

    const IP: Ipv4Addr = Ipv4Addr::new(203, 0, 113, 10);

    #[tokio::test]
    async fn falls_through_broken_services() {
        let exec = ScriptedExecutor::new();
        exec.on("curl", CommandOutput::failed(6, "could not resolve host"));
        exec.on(
            "curl -s --max-time 10 https://api.ipify.org",
            CommandOutput::ok("<html>rate limited</html>"),
        );
        exec.on(
            "curl -s --max-time 10 https://checkip.amazonaws.com",
            CommandOutput::ok("203.0.113.10\n"),
        );
        assert_eq!(public_ip(&exec).await, Some(IP));
        assert_eq!(exec.calls_matching("curl").len(), 4);
    }

    #[tokio::test]
    async fn no_service_answers() {
        let exec = ScriptedExecutor::new();
        assert_eq!(public_ip(&exec).await, None);
    }

    #[test_case(Tool::Dig, "203.0.113.10\n", true; "dig answer")]
    #[test_case(Tool::Dig, "198.51.100.7\n", false; "dig other address")]
    #[test_case(Tool::Dig, "203.0.113.100\n", false; "dig prefix only")]
    #[test_case(
        Tool::Nslookup,
        "Server:\t8.8.8.8\nAddress:\t8.8.8.8#53\n\nName:\tvpn.example.com\nAddress: 203.0.113.10\n",
        true;
        "nslookup answer"
    )]
    #[test_case(
        Tool::Nslookup,
        "Server:\t8.8.8.8\nAddress:\t8.8.8.8#53\n\n** server can't find vpn.example.com: NXDOMAIN\n",
        false;
        "nslookup nxdomain"
    )]
    #[test_case(Tool::Host, "vpn.example.com has address 203.0.113.10\n", true; "host answer")]
    #[test_case(Tool::Host, "Host vpn.example.com not found: 3(NXDOMAIN)\n", false; "host nxdomain")]
    fn tool_output(tool: Tool, stdout: &str, expected: bool) {
        assert_eq!(tool.confirms(stdout, IP), expected);
    }

    #[tokio::test]
    async fn later_tool_can_confirm() {
        let exec = ScriptedExecutor::new();
        exec.on("dig", CommandOutput::failed(127, "dig: command not found"));
        exec.on(
            "host vpn.example.com",
            CommandOutput::ok("vpn.example.com has address 203.0.113.10\n"),
        );
        assert!(a_record_points_to(&exec, "vpn.example.com", IP).await);
        assert!(exec.was_called("nslookup vpn.example.com 8.8.8.8"));
    }
}
