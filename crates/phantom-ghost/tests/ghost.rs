//! Ghost mode lifecycle against a sandboxed host.

use phantom_core::testing::Sandbox;
use phantom_core::{Context, GhostState};
use phantom_ghost::{GhostModule, SECRET_LEN};
use phantom_system::CommandOutput;

const DOMAIN: &str = "vpn.example.com";
const PUBLIC_IP: &str = "203.0.113.10";

/// Public IP, A record, architecture, and side effects of tar and openssl.
fn script_host(sandbox: &Sandbox) {
    let exec = sandbox.exec();
    exec.on("curl -s", CommandOutput::ok(format!("{PUBLIC_IP}\n")));
    exec.on(&format!("dig +short {DOMAIN}"), CommandOutput::ok(format!("{PUBLIC_IP}\n")));
    exec.on("uname -m", CommandOutput::ok("x86_64\n"));

    let wstunnel_dir = sandbox.paths().wstunnel_dir.clone();
    exec.on_with("tar -xzf", move |_| {
        let _ = std::fs::create_dir_all(&wstunnel_dir);
        let _ = std::fs::write(wstunnel_dir.join("wstunnel"), b"\x7fELF");
        CommandOutput::ok("")
    });

    exec.on_with("openssl req", |cmd| {
        let args = cmd.arguments();
        for flag in ["-keyout", "-out"] {
            if let Some(path) = args.iter().position(|a| a == flag).and_then(|i| args.get(i + 1)) {
                let _ = std::fs::write(path, "-----BEGIN-----\n");
            }
        }
        CommandOutput::ok("")
    });
}

fn ghost(ctx: Context) -> GhostModule {
    GhostModule::new(ctx)
}

#[tokio::test]
async fn wrong_a_record_is_rejected_without_side_effects() {
    let sandbox = Sandbox::new();
    sandbox
        .exec()
        .on("curl -s", CommandOutput::ok(format!("{PUBLIC_IP}\n")));
    sandbox.exec().on("dig", CommandOutput::ok("198.51.100.20\n"));

    let err = ghost(sandbox.test_mode_ctx())
        .enable(DOMAIN)
        .await
        .expect_err("wrong A record");
    assert_eq!(err.code(), "VALIDATION_ERROR");
    assert!(err.to_string().contains(PUBLIC_IP));

    assert!(!sandbox.has_iptables_rule("--dport 443"));
    assert!(!sandbox.paths().ghost_state().exists());
    assert!(!sandbox.exec().was_called("openssl"));
    assert!(!sandbox.exec().was_called("systemctl enable wstunnel"));
}

#[tokio::test]
async fn malformed_domain_is_rejected() {
    let sandbox = Sandbox::new();
    let err = ghost(sandbox.ctx())
        .enable("not a domain")
        .await
        .expect_err("invalid");
    assert_eq!(err.code(), "VALIDATION_ERROR");
    assert!(sandbox.exec().calls().is_empty());
}

#[tokio::test]
async fn enable_status_disable() {
    let sandbox = Sandbox::new();
    script_host(&sandbox);
    let module = ghost(sandbox.test_mode_ctx());

    let enabled = module.enable(DOMAIN).await.expect("enable");
    assert_eq!(enabled.status, "active");
    assert_eq!(enabled.server_ip, PUBLIC_IP);
    assert_eq!(enabled.port, 443);
    assert_eq!(enabled.secret.len(), SECRET_LEN);
    assert!(enabled.secret.chars().all(|c| c.is_ascii_alphanumeric()));
    assert!(enabled
        .connection_command
        .ends_with(&format!("wss://{DOMAIN}:443")));

    let paths = sandbox.paths();
    let unit = std::fs::read_to_string(paths.systemd_dir.join("wstunnel.service")).expect("unit");
    assert!(unit.contains(&enabled.secret));
    assert!(paths.wstunnel_dir.join("wstunnel").is_file());
    assert!(sandbox.has_iptables_rule("-p tcp --dport 443 -j ACCEPT"));
    assert!(sandbox.has_iptables_rule("-p udp --dport 51820 -j DROP"));
    assert!(sandbox.exec().was_called("wget -q -O"));
    assert!(sandbox.exec().was_called("systemctl daemon-reload"));
    assert!(sandbox.exec().was_called("systemctl start wstunnel"));

    let state = GhostState::load(&paths.ghost_state())
        .expect("load")
        .expect("state");
    assert!(state.enabled);
    assert_eq!(state.changes.certificates_created, vec![DOMAIN.to_string()]);

    let status = module.status().await.expect("status");
    assert!(status.is_enabled());
    let json = serde_json::to_value(&status).expect("json");
    assert_eq!(json["status"], "active");
    assert_eq!(json["services"]["wstunnel"], "active");
    assert_eq!(json["secret"], format!("{}...", &enabled.secret[..10]));

    let again = module.enable(DOMAIN).await.expect_err("already active");
    assert_eq!(again.code(), "GHOST_MODE_ACTIVE");
    assert_eq!(again.details().and_then(|d| d["domain"].as_str()), Some(DOMAIN));

    let disabled = module.disable().await.expect("disable");
    assert_eq!(disabled.status, "inactive");
    assert!(!disabled.restored.is_empty());
    assert!(!sandbox.has_iptables_rule("--dport 443"));
    assert!(!sandbox.has_iptables_rule("--dport 51820"));
    assert!(!paths.systemd_dir.join("wstunnel.service").exists());
    assert!(!paths.wstunnel_dir.exists());
    assert!(!paths.letsencrypt_dir.join("live").join(DOMAIN).exists());
    assert!(!paths.ghost_state().exists());
    assert!(!module.status().await.expect("status").is_enabled());
}

#[tokio::test]
async fn failed_start_rolls_everything_back() {
    let sandbox = Sandbox::new();
    script_host(&sandbox);
    sandbox
        .exec()
        .on("systemctl is-active wstunnel", CommandOutput::ok("failed\n"));

    let err = ghost(sandbox.test_mode_ctx())
        .enable(DOMAIN)
        .await
        .expect_err("service never starts");
    assert_eq!(err.code(), "GHOST_MODE_ERROR");
    assert!(err.to_string().starts_with("Failed to enable Ghost Mode:"));

    let paths = sandbox.paths();
    assert!(!sandbox.has_iptables_rule("--dport 443"));
    assert!(!paths.systemd_dir.join("wstunnel.service").exists());
    assert!(!paths.wstunnel_dir.exists());
    assert!(!paths.letsencrypt_dir.join("live").join(DOMAIN).exists());
    assert!(!paths.ghost_state().exists());
    assert!(sandbox.exec().was_called("pkill -f wstunnel"));
}

#[tokio::test]
async fn unsupported_architecture_keeps_nothing() {
    let sandbox = Sandbox::new();
    script_host(&sandbox);
    sandbox.exec().on("uname -m", CommandOutput::ok("riscv64\n"));

    let err = ghost(sandbox.test_mode_ctx())
        .enable(DOMAIN)
        .await
        .expect_err("no release");
    assert!(err.to_string().contains("Unsupported architecture: riscv64"));
    assert!(!sandbox.exec().was_called("wget"));
    assert!(!sandbox.paths().letsencrypt_dir.join("live").join(DOMAIN).exists());
}

#[tokio::test]
async fn disable_when_inactive() {
    let sandbox = Sandbox::new();
    let result = ghost(sandbox.ctx()).disable().await.expect("disable");
    assert_eq!(result.status, "inactive");
    assert_eq!(result.message, "Ghost Mode is not active");
    assert!(result.restored.is_empty());
}

#[tokio::test]
async fn certbot_opens_port_80_only_during_challenge() {
    let sandbox = Sandbox::new();
    script_host(&sandbox);
    sandbox
        .exec()
        .on("ufw status", CommandOutput::ok("Status: active\n"));
    let le = sandbox.paths().letsencrypt_dir.clone();
    sandbox.exec().on_with("certbot certonly", move |_| {
        let live = le.join("live").join(DOMAIN);
        let _ = std::fs::create_dir_all(&live);
        let _ = std::fs::write(live.join("fullchain.pem"), "chain");
        let _ = std::fs::write(live.join("privkey.pem"), "key");
        CommandOutput::ok("")
    });

    ghost(sandbox.ctx()).enable(DOMAIN).await.expect("enable");

    let calls = sandbox.exec().calls();
    let at = |prefix: &str| calls.iter().position(|c| c.starts_with(prefix));
    let open = at("ufw allow 80/tcp").expect("port 80 opened");
    let issue = at("certbot certonly").expect("certbot ran");
    let close = at("ufw delete allow 80/tcp").expect("port 80 closed");
    assert!(open < issue && issue < close);
    assert!(!sandbox.exec().was_called("openssl"));
}
