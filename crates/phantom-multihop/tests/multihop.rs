//! Multihop session lifecycle against a sandboxed host.

use phantom_core::testing::{Sandbox, START_UNIX};
use phantom_multihop::{routing, tunnel, MultihopModule};
use phantom_system::{CancellationToken, CommandOutput};

const EXIT: &str = "[Interface]
PrivateKey = yAnz5TF+lXXJte14tji3zlMNq+hd2rYUIgJBgB3fBmk=
Address = 10.66.0.2/32
DNS = 10.66.0.1
MTU = 1380

[Peer]
PublicKey = xTIBA5rboUvnH4htodjb6e697QjLERt1NAB4mZqp8Dg=
AllowedIPs = 0.0.0.0/0
Endpoint = 198.51.100.7:51820
";

fn import(sandbox: &Sandbox, module: &MultihopModule) {
    let source = sandbox.root().join("stockholm.conf");
    std::fs::write(&source, EXIT).expect("write exit");
    let imported = module
        .import_vpn_config(&source.display().to_string(), None)
        .expect("import");
    assert_eq!(imported.config_name, "stockholm");
    assert_eq!(
        imported.optimizations,
        vec!["Added PersistentKeepalive = 5 for multihop stability"]
    );
}

/// Exit that answers handshakes.
fn reachable_exit(sandbox: &Sandbox) {
    let exec = sandbox.exec();
    exec.on(
        "wg show wg_vpn",
        CommandOutput::ok("interface: wg_vpn\n  latest handshake: 3 seconds ago\n"),
    );
    exec.on(
        "wg show wg_vpn latest-handshakes",
        CommandOutput::ok(format!("PEER=\t{}\n", START_UNIX - 3)),
    );
}

fn no_multihop_residue(sandbox: &Sandbox) {
    assert!(
        !sandbox
            .ip_rules()
            .iter()
            .any(|r| r.contains("10.8.0.0/24") || r.contains("multihop")),
        "{:?}",
        sandbox.ip_rules()
    );
    assert!(sandbox.routes("multihop").is_empty());
    assert!(!sandbox.has_iptables_rule("wg_vpn"));
    assert!(sandbox.has_iptables_rule("-s 10.8.0.0/24 -o eth0 -j MASQUERADE"));
}

#[tokio::test]
async fn enable_status_disable() {
    let sandbox = Sandbox::new();
    let module = MultihopModule::new(sandbox.ctx());
    import(&sandbox, &module);
    reachable_exit(&sandbox);

    let enabled = module.enable_multihop("stockholm").await.expect("enable");
    assert!(enabled.multihop_enabled && enabled.handshake_established);
    assert_eq!(enabled.message, "Multihop enabled successfully through stockholm");
    assert_eq!(enabled.traffic_flow, "Clients → Phantom → VPN Exit (198.51.100.7:51820)");

    let rules = sandbox.ip_rules();
    assert!(rules.contains(&"100:\tfrom 10.8.0.0/24 to 10.8.0.0/24 lookup main".to_string()));
    assert!(rules.contains(&"200:\tfrom 10.8.0.0/24 lookup multihop".to_string()));
    assert_eq!(sandbox.routes("multihop"), vec!["default dev wg_vpn"]);
    assert!(sandbox.has_iptables_rule("-t nat -A POSTROUTING -s 10.8.0.0/24 -o wg_vpn -j MASQUERADE"));
    assert!(sandbox.has_iptables_rule("-i wg_vpn -o wg_main -m state --state RELATED,ESTABLISHED -j ACCEPT"));
    assert!(sandbox.has_iptables_rule("-i wg_main -o wg_main -s 10.8.0.0/24 -d 10.8.0.0/24 -j ACCEPT"));

    let ctx = sandbox.ctx();
    let policy = std::fs::read_to_string(routing::policy_path(&ctx)).expect("policy");
    assert!(policy.contains("Name=wg_vpn"));
    let tables = std::fs::read_to_string(&sandbox.paths().rt_tables).expect("rt_tables");
    assert!(tables.contains("100 multihop"));
    let kernel = std::fs::read_to_string(tunnel::kernel_config_path(&ctx)).expect("kernel");
    assert!(!kernel.contains("MTU") && kernel.contains("PersistentKeepalive = 5"));
    assert!(sandbox.exec().was_called("sysctl -w net.ipv4.ip_forward=1"));
    assert!(sandbox.exec().was_called("systemctl start phantom-multihop-monitor"));

    let config = sandbox.config();
    assert!(config.multihop.enabled);
    assert_eq!(config.multihop.active_exit.as_deref(), Some("stockholm"));
    assert_eq!(config.multihop.vpn_interface_name.as_deref(), Some("wg_vpn"));

    let status = module.status().await.expect("status");
    assert!(status.enabled && status.vpn_interface.active);
    assert_eq!(status.available_configs, 1);
    assert_eq!(status.traffic_routing, "VPN Exit");

    let exits = module.list_exits().expect("list");
    assert!(exits.exits[0].active);

    let log = module.get_session_log(None).await.expect("log");
    assert!(log.active_session);
    let lines = log.log_lines.expect("lines");
    assert_eq!(lines.len(), 1);
    assert_eq!(lines[0].message, "SESSION STARTED - Handshake monitoring active");

    let disabled = module.disable_multihop().await.expect("disable");
    assert_eq!(disabled.previous_exit.as_deref(), Some("stockholm"));
    assert_eq!(disabled.interface_cleaned, Some(true));
    no_multihop_residue(&sandbox);
    assert!(!routing::policy_path(&ctx).exists());
    assert!(!tunnel::kernel_config_path(&ctx).exists());
    assert!(!sandbox.config().multihop.enabled);
    assert!(sandbox.exec().was_called("systemctl stop phantom-multihop-monitor"));

    let status = module.status().await.expect("status");
    assert_eq!(status.traffic_flow, "Clients -> Phantom Server -> Internet (direct)");
    let log = module.get_session_log(Some(10)).await.expect("log");
    assert!(!log.active_session);
    assert_eq!(log.message, Some("No active multihop session"));
}

#[tokio::test]
async fn handshake_timeout_rolls_back() {
    let sandbox = Sandbox::new();
    let module = MultihopModule::new(sandbox.ctx());
    import(&sandbox, &module);

    let err = module
        .enable_multihop("stockholm")
        .await
        .expect_err("exit never answers");
    assert_eq!(err.code(), "MULTIHOP_ERROR");
    assert_eq!(
        err.to_string(),
        "VPN handshake timeout - server may be unreachable or overloaded"
    );

    let status = module.status().await.expect("status");
    assert!(!status.enabled);
    assert!(status.active_exit.is_none());
    no_multihop_residue(&sandbox);
    let ctx = sandbox.ctx();
    assert!(!routing::policy_path(&ctx).exists());
    assert!(!tunnel::kernel_config_path(&ctx).exists());
    assert!(sandbox.exec().was_called("ip link del wg_vpn"));
}

#[tokio::test]
async fn missing_handshake_in_verification_rolls_back() {
    let sandbox = Sandbox::new();
    let module = MultihopModule::new(sandbox.ctx());
    import(&sandbox, &module);
    sandbox.exec().on(
        "wg show wg_vpn latest-handshakes",
        CommandOutput::ok(format!("PEER=\t{}\n", START_UNIX - 1)),
    );

    let err = module.enable_multihop("stockholm").await.expect_err("verify");
    assert_eq!(err.to_string(), "VPN connection test failed");
    assert!(err.details().is_some_and(|d| d["possible_issues"].is_array()));
    assert!(!sandbox.config().multihop.enabled);
    no_multihop_residue(&sandbox);
}

#[tokio::test]
async fn cancelled_enable_leaves_nothing() {
    let sandbox = Sandbox::new();
    import(&sandbox, &MultihopModule::new(sandbox.ctx()));
    reachable_exit(&sandbox);
    let cancel = CancellationToken::new();
    cancel.cancel();
    let module = MultihopModule::new(sandbox.ctx().with_cancellation(cancel));

    let err = module.enable_multihop("stockholm").await.expect_err("cancelled");
    assert_eq!(err.to_string(), "Multihop enable cancelled");
    assert!(!sandbox.config().multihop.enabled);
    no_multihop_residue(&sandbox);
}

#[tokio::test]
async fn unknown_exit_and_missing_name() {
    let sandbox = Sandbox::new();
    let module = MultihopModule::new(sandbox.ctx());
    let err = module.enable_multihop("nowhere").await.expect_err("unknown");
    assert_eq!(err.code(), "EXIT_NODE_ERROR");
    assert_eq!(err.to_string(), "VPN config 'nowhere' not found");
    let err = module.enable_multihop("  ").await.expect_err("empty");
    assert_eq!(err.code(), "MISSING_PARAMETER");
    assert!(sandbox.exec().calls().is_empty());
}

#[tokio::test]
async fn removing_active_exit_disables_first() {
    let sandbox = Sandbox::new();
    let module = MultihopModule::new(sandbox.ctx());
    import(&sandbox, &module);
    reachable_exit(&sandbox);
    module.enable_multihop("stockholm").await.expect("enable");

    let removed = module.remove_vpn_config("stockholm").await.expect("remove");
    assert!(removed.was_active);
    assert_eq!(removed.message, "VPN configuration 'stockholm' removed");
    assert!(!sandbox.config().multihop.enabled);
    assert_eq!(module.list_exits().expect("list").total, 0);
    no_multihop_residue(&sandbox);

    let err = module.remove_vpn_config("stockholm").await.expect_err("gone");
    assert_eq!(err.to_string(), "VPN configuration 'stockholm' not found");
}

#[tokio::test]
async fn test_vpn_probes() {
    let sandbox = Sandbox::new();
    let module = MultihopModule::new(sandbox.ctx());
    import(&sandbox, &module);

    let err = module.test_vpn(None).await.expect_err("nothing active");
    assert_eq!(err.code(), "VALIDATION_ERROR");
    assert_eq!(err.to_string(), "No active VPN to test - specify exit_name");

    sandbox
        .exec()
        .on("ping -c 3 -W 5 198.51.100.7", CommandOutput::failed(1, ""));
    let report = module.test_vpn(Some("stockholm")).await.expect("probe");
    assert!(!report.all_tests_passed);
    assert_eq!(report.message, "Some tests failed");
    assert!(report.tests.vpn_interface.is_none());

    reachable_exit(&sandbox);
    sandbox
        .exec()
        .on("ping -c 3 -W 5 198.51.100.7", CommandOutput::ok(""));
    module.enable_multihop("stockholm").await.expect("enable");
    let report = module.test_vpn(None).await.expect("probe");
    assert!(report.all_tests_passed);
    assert_eq!(
        report.tests.vpn_interface.and_then(|p| p.vpn_ip).as_deref(),
        Some("10.66.0.2")
    );
    assert!(sandbox.exec().was_called("ping -c 1 -W 2 10.66.0.2"));
}

#[tokio::test]
async fn reset_clears_stray_state() {
    let sandbox = Sandbox::new();
    let module = MultihopModule::new(sandbox.ctx());
    let ctx = sandbox.ctx();
    routing::apply_rules(ctx.executor(), "10.8.0.0/24".parse().expect("subnet"))
        .await
        .expect("stray rules");

    let reset = module.reset_state().await.expect("reset");
    assert!(reset.reset_complete && reset.cleanup_successful);
    assert_eq!(reset.cleaned_up.len(), 6);
    no_multihop_residue(&sandbox);
    assert!(sandbox.config().multihop.updated_at.is_some());

    let disabled = module.disable_multihop().await.expect("noop");
    assert_eq!(disabled.message, "Multihop is not currently enabled");
}
