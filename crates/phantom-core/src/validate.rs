//! Input validators shared by the action handlers.

use std::net::Ipv4Addr;

use once_cell::sync::Lazy;
use regex::Regex;

use crate::error::{PhantomError, Result};

/// Longest accepted client name.
pub const MAX_CLIENT_NAME: usize = 32;

/// Names that would collide with internal markers or feature labels.
pub const RESERVED_CLIENT_NAMES: &[&str] =
    &["server", "admin", "root", "system", "ghost", "multihop"];

static CLIENT_NAME: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"^[A-Za-z0-9_-]+$").unwrap_or_else(|_| unreachable!("static pattern"))
});

static DOMAIN_LABELS: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"^([A-Za-z0-9]([A-Za-z0-9-]{0,61}[A-Za-z0-9])?\.)+[A-Za-z]{2,63}$")
        .unwrap_or_else(|_| unreachable!("static pattern"))
});

/// Checks a client name: 1-32 characters of `[A-Za-z0-9_-]`, not reserved.
///
/// # Errors
///
/// [`PhantomError::MissingParameter`] when empty, otherwise
/// [`PhantomError::InvalidClientName`].
pub fn client_name(name: &str) -> Result<()> {
    if name.is_empty() {
        return Err(PhantomError::MissingParameter("client_name".to_string()));
    }
    if name.len() > MAX_CLIENT_NAME {
        return Err(PhantomError::InvalidClientName(format!(
            "Client name cannot exceed {MAX_CLIENT_NAME} characters"
        )));
    }
    if !CLIENT_NAME.is_match(name) {
        return Err(PhantomError::InvalidClientName(
            "Client name can only contain letters, numbers, hyphens, and underscores".to_string(),
        ));
    }
    if RESERVED_CLIENT_NAMES
        .iter()
        .any(|r| r.eq_ignore_ascii_case(name))
    {
        return Err(PhantomError::InvalidClientName(format!(
            "Client name '{name}' is reserved"
        )));
    }
    Ok(())
}

/// Checks a fully qualified domain name.
///
/// # Errors
///
/// [`PhantomError::Validation`] when malformed.
pub fn domain(domain: &str) -> Result<()> {
    if domain.len() > 253 || !DOMAIN_LABELS.is_match(domain) {
        return Err(PhantomError::validation(format!(
            "Invalid domain format: {domain}"
        )));
    }
    Ok(())
}

/// Parses a dotted-quad IPv4 address.
///
/// # Errors
///
/// [`PhantomError::Validation`] naming `field`.
pub fn ipv4(value: &str, field: &str) -> Result<Ipv4Addr> {
    value
        .trim()
        .parse()
        .map_err(|_| PhantomError::validation(format!("Invalid IP address for {field}: {value}")))
}

#[cfg(test)]
mod tests {
    use super::*;
    use test_case::test_case;

    #[test_case("alice" ; "simple")]
    #[test_case("bob_laptop-2" ; "underscore and hyphen")]
    #[test_case("abcdefghijklmnopqrstuvwxyz012345" ; "exactly 32")]
    fn valid_client_names(name: &str) {
        assert!(client_name(name).is_ok());
    }

    #[test_case("bad@name", "INVALID_CLIENT_NAME" ; "at sign")]
    #[test_case("has space", "INVALID_CLIENT_NAME" ; "space")]
    #[test_case("abcdefghijklmnopqrstuvwxyz0123456", "INVALID_CLIENT_NAME" ; "33 chars")]
    #[test_case("Server", "INVALID_CLIENT_NAME" ; "reserved")]
    #[test_case("", "MISSING_PARAMETER" ; "empty")]
    fn invalid_client_names(name: &str, code: &str) {
        assert_eq!(client_name(name).expect_err("invalid").code(), code);
    }

    #[test_case("vpn.example.com", true)]
    #[test_case("a.b.co", true)]
    #[test_case("localhost", false)]
    #[test_case("-bad.example.com", false)]
    #[test_case("exa mple.com", false)]
    fn domains(input: &str, ok: bool) {
        assert_eq!(domain(input).is_ok(), ok);
    }

    #[test]
    fn ipv4_parsing() {
        assert_eq!(ipv4(" 9.9.9.9 ", "primary").expect("ok"), Ipv4Addr::new(9, 9, 9, 9));
        let err = ipv4("9.9.9", "primary").expect_err("bad");
        assert!(err.to_string().contains("primary"));
    }
}
