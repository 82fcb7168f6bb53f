//! End-to-end actions through the dispatcher against a sandboxed host.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use phantom_api::{Dispatcher, Response};
use phantom_core::testing::{Sandbox, START_UNIX};
use phantom_system::CommandOutput;
use serde_json::{json, Map, Value};

fn params(value: Value) -> Map<String, Value> {
    match value {
        Value::Object(map) => map,
        _ => Map::new(),
    }
}

async fn call(api: &Dispatcher, module: &str, action: &str, args: Value) -> Response {
    api.execute(module, action, params(args)).await
}

async fn ok(api: &Dispatcher, module: &str, action: &str, args: Value) -> Value {
    let response = call(api, module, action, args).await;
    assert!(response.success, "{module}.{action}: {response:?}");
    response.data.unwrap_or(Value::Null)
}

fn state_files(sandbox: &Sandbox) -> Vec<Option<Vec<u8>>> {
    [
        sandbox.wg_path(),
        sandbox.paths().clients_db(),
        sandbox.paths().phantom_json(),
    ]
    .iter()
    .map(|p| sandbox.snapshot(p))
    .collect()
}

const EXIT: &str = "[Interface]
PrivateKey = yAnz5TF+lXXJte14tji3zlMNq+hd2rYUIgJBgB3fBmk=
Address = 10.66.0.2/32

[Peer]
PublicKey = xTIBA5rboUvnH4htodjb6e697QjLERt1NAB4mZqp8Dg=
AllowedIPs = 0.0.0.0/0
Endpoint = 198.51.100.7:51820
";

async fn import_exit(sandbox: &Sandbox, api: &Dispatcher) {
    let source = sandbox.root().join("stockholm.conf");
    std::fs::write(&source, EXIT).expect("write exit");
    let data = ok(
        api,
        "multihop",
        "import_vpn_config",
        json!({"config_path": source.display().to_string()}),
    )
    .await;
    assert_eq!(data["config_name"], "stockholm");
}

#[tokio::test]
async fn add_then_list() {
    let sandbox = Sandbox::new();
    let api = Dispatcher::new(sandbox.ctx());

    let added = ok(&api, "core", "add_client", json!({"client_name": "alice"})).await;
    assert_eq!(added["client"]["ip"], "10.8.0.2");
    assert!(added.get("ghost_info").is_none());

    let list = ok(&api, "core", "list_clients", json!({})).await;
    assert_eq!(list["total"], 1);
    assert_eq!(list["clients"][0]["name"], "alice");
    assert_eq!(list["clients"][0]["connected"], false);
    assert_eq!(list["clients"][0]["connection"]["status"], "offline");
    assert_eq!(list["pagination"]["total_pages"], 1);
}

#[tokio::test]
async fn duplicate_add_changes_nothing() {
    let sandbox = Sandbox::new();
    let api = Dispatcher::new(sandbox.ctx());
    ok(&api, "core", "add_client", json!({"client_name": "alice"})).await;
    let before = state_files(&sandbox);

    let response = call(&api, "core", "add_client", json!({"client_name": "alice"})).await;
    assert!(!response.success);
    assert_eq!(response.code, Some("CLIENT_EXISTS"));
    assert_eq!(response.status(), 409);
    assert_eq!(response.error.as_deref(), Some("Client 'alice' already exists"));
    assert_eq!(state_files(&sandbox), before);
}

#[tokio::test]
async fn invalid_and_missing_names() {
    let sandbox = Sandbox::new();
    let api = Dispatcher::new(sandbox.ctx());
    let before = state_files(&sandbox);

    let response = call(&api, "core", "add_client", json!({"client_name": "bad name!"})).await;
    assert_eq!(response.code, Some("INVALID_CLIENT_NAME"));
    assert_eq!(response.status(), 400);

    let response = call(&api, "core", "add_client", json!({})).await;
    assert_eq!(response.code, Some("MISSING_PARAMETER"));
    assert_eq!(
        response.error.as_deref(),
        Some("Missing required parameter: client_name")
    );
    assert_eq!(state_files(&sandbox), before);
}

#[tokio::test]
async fn remove_and_readd_reuses_the_address() {
    let sandbox = Sandbox::new();
    let api = Dispatcher::new(sandbox.ctx());
    let empty_store = sandbox.snapshot(&sandbox.paths().clients_db());

    ok(&api, "core", "add_client", json!({"client_name": "alice"})).await;
    let removed = ok(&api, "core", "remove_client", json!({"client_name": "alice"})).await;
    assert_eq!(removed["client_ip"], "10.8.0.2");
    assert_eq!(sandbox.snapshot(&sandbox.paths().clients_db()), empty_store);

    let again = ok(&api, "core", "add_client", json!({"client_name": "alice"})).await;
    assert_eq!(again["client"]["ip"], "10.8.0.2");
}

#[tokio::test]
async fn export_is_stable() {
    let sandbox = Sandbox::new();
    let api = Dispatcher::new(sandbox.ctx());
    ok(&api, "core", "add_client", json!({"client_name": "alice"})).await;

    let first = ok(&api, "core", "export_client", json!({"client_name": "alice"})).await;
    let second = ok(&api, "core", "export_client", json!({"client_name": "alice"})).await;
    assert_eq!(first, second);
    let config = first["config"].as_str().expect("config text");
    assert!(config.contains("Address = 10.8.0.2/32"));
    assert!(config.contains("PersistentKeepalive = 25"));
}

#[tokio::test]
async fn subnet_migration_and_repeat() {
    let sandbox = Sandbox::new();
    let api = Dispatcher::new(sandbox.ctx());
    for name in ["alice", "bob"] {
        ok(&api, "core", "add_client", json!({"client_name": name})).await;
    }

    let response = call(
        &api,
        "core",
        "change_subnet",
        json!({"new_subnet": "10.9.0.0/24"}),
    )
    .await;
    assert_eq!(response.code, Some("VALIDATION_ERROR"));

    let change = ok(
        &api,
        "core",
        "change_subnet",
        json!({"new_subnet": "10.9.0.0/24", "confirm": true}),
    )
    .await;
    assert_eq!(change["clients_updated"], 2);
    assert_eq!(change["ip_mapping"]["10.8.0.1"], "10.9.0.1");
    assert_eq!(change["ip_mapping"]["10.8.0.3"], "10.9.0.3");
    assert_eq!(sandbox.config().wireguard.network.to_string(), "10.9.0.0/24");
    assert!(sandbox.has_iptables_rule("-s 10.9.0.0/24 -o eth0 -j MASQUERADE"));

    let files = state_files(&sandbox);
    let repeat = ok(
        &api,
        "core",
        "change_subnet",
        json!({"new_subnet": "10.9.0.0/24", "confirm": "true"}),
    )
    .await;
    assert_eq!(repeat["clients_updated"], 0);
    assert!(repeat["backup_id"].is_null());
    assert_eq!(state_files(&sandbox), files);
}

#[tokio::test]
async fn multihop_blocks_migration() {
    let sandbox = Sandbox::new();
    let api = Dispatcher::new(sandbox.ctx());
    import_exit(&sandbox, &api).await;
    sandbox.exec().on(
        "wg show wg_vpn",
        CommandOutput::ok("interface: wg_vpn\n  latest handshake: 2 seconds ago\n"),
    );
    sandbox.exec().on(
        "wg show wg_vpn latest-handshakes",
        CommandOutput::ok(format!("PEER=\t{}\n", START_UNIX - 2)),
    );
    ok(&api, "multihop", "enable_multihop", json!({"exit_name": "stockholm"})).await;

    let info = ok(&api, "core", "get_subnet_info", json!({})).await;
    assert_eq!(info["can_change"], false);
    assert_eq!(info["blockers"]["multihop"], true);

    let before = state_files(&sandbox);
    let response = call(
        &api,
        "core",
        "change_subnet",
        json!({"new_subnet": "10.9.0.0/24", "confirm": true}),
    )
    .await;
    assert!(!response.success);
    assert_eq!(response.code, Some("VALIDATION_ERROR"));
    assert_eq!(state_files(&sandbox), before);
}

#[tokio::test]
async fn multihop_timeout_rolls_back() {
    let sandbox = Sandbox::new();
    let api = Dispatcher::new(sandbox.ctx());
    import_exit(&sandbox, &api).await;

    let response = call(
        &api,
        "multihop",
        "enable_multihop",
        json!({"exit_name": "stockholm"}),
    )
    .await;
    assert_eq!(response.code, Some("MULTIHOP_ERROR"));
    assert_eq!(response.status(), 500);
    assert_eq!(response.data.as_ref().map(|d| d["interface"].clone()), Some(json!("wg_vpn")));

    let status = ok(&api, "multihop", "status", json!({})).await;
    assert_eq!(status["enabled"], false);
    assert!(!sandbox.ip_rules().iter().any(|r| r.contains("multihop")));
    assert!(sandbox.routes("multihop").is_empty());
    assert!(!sandbox.has_iptables_rule("wg_vpn"));
}

#[tokio::test]
async fn ghost_wrong_a_record_opens_nothing() {
    let sandbox = Sandbox::new();
    let api = Dispatcher::new(sandbox.test_mode_ctx());
    sandbox
        .exec()
        .on("curl -s", CommandOutput::ok("203.0.113.10\n"));
    sandbox.exec().on("dig", CommandOutput::ok("198.51.100.20\n"));

    let response = call(&api, "ghost", "enable", json!({"domain": "vpn.example.com"})).await;
    assert!(!response.success);
    assert_eq!(response.code, Some("VALIDATION_ERROR"));
    assert!(!sandbox.has_iptables_rule("--dport 443"));
    assert!(!sandbox.paths().ghost_state().exists());

    let status = ok(&api, "ghost", "status", json!({})).await;
    assert_eq!(status["enabled"], false);
}

#[tokio::test]
async fn tweak_requires_a_real_boolean() {
    let sandbox = Sandbox::new();
    let api = Dispatcher::new(sandbox.ctx());
    let setting = "restart_service_after_client_creation";

    let response = call(
        &api,
        "core",
        "update_tweak_setting",
        json!({"setting_name": setting, "value": "true"}),
    )
    .await;
    assert_eq!(response.code, Some("VALIDATION_ERROR"));

    let updated = ok(
        &api,
        "core",
        "update_tweak_setting",
        json!({"setting_name": setting, "value": true}),
    )
    .await;
    assert_eq!(updated["old_value"], false);
    assert_eq!(updated["new_value"], true);
}

#[tokio::test]
async fn unknown_names_and_bad_parameters() {
    let sandbox = Sandbox::new();
    let api = Dispatcher::new(sandbox.ctx());

    let response = call(&api, "reset", "factory_reset", json!({})).await;
    assert_eq!(response.code, Some("UNKNOWN_ACTION"));
    assert_eq!(response.status(), 404);

    let response = call(&api, "dns", "enable", json!({})).await;
    assert_eq!(response.code, Some("UNKNOWN_ACTION"));
    assert_eq!(response.metadata.module.as_deref(), Some("dns"));

    let response = call(&api, "core", "list_clients", json!({"page": "first"})).await;
    assert_eq!(response.code, Some("VALIDATION_ERROR"));
    assert!(sandbox.exec().calls().is_empty());
}

#[tokio::test]
async fn concurrent_adds_get_distinct_addresses() {
    let sandbox = Sandbox::new();
    let api = Dispatcher::new(sandbox.ctx());
    let other = api.clone();

    let (a, b) = tokio::join!(
        call(&api, "core", "add_client", json!({"client_name": "alice"})),
        call(&other, "core", "add_client", json!({"client_name": "bob"})),
    );
    assert!(a.success && b.success);
    let mut ips: Vec<String> = [a, b]
        .iter()
        .filter_map(|r| r.data.as_ref()?["client"]["ip"].as_str().map(str::to_string))
        .collect();
    ips.sort();
    assert_eq!(ips, vec!["10.8.0.2", "10.8.0.3"]);
    assert_eq!(sandbox.store().clients().len(), 2);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn abandoned_action_keeps_the_lock_until_it_finishes() {
    let sandbox = Sandbox::new();
    let api = Dispatcher::new(sandbox.ctx());
    let order = Arc::new(Mutex::new(Vec::new()));
    let seen = Arc::clone(&order);
    sandbox.exec().on_with("wg set wg_main peer", move |cmd| {
        let line = cmd.to_string();
        if line.contains("10.8.0.2/32") {
            std::thread::sleep(Duration::from_millis(300));
            seen.lock().expect("order").push("alice");
        } else {
            seen.lock().expect("order").push("bob");
        }
        CommandOutput::default()
    });

    let abandoned = tokio::time::timeout(
        Duration::from_millis(50),
        call(&api, "core", "add_client", json!({"client_name": "alice"})),
    )
    .await;
    assert!(abandoned.is_err(), "first action should still be running");

    let bob = call(&api, "core", "add_client", json!({"client_name": "bob"})).await;
    assert!(bob.success, "{bob:?}");
    assert_eq!(*order.lock().expect("order"), vec!["alice", "bob"]);
    assert_eq!(sandbox.store().clients().len(), 2);
}

#[tokio::test]
async fn catalogue_and_health() {
    let sandbox = Sandbox::new();
    let api = Dispatcher::new(sandbox.ctx());

    let modules = api.list_modules();
    assert!(modules.success);
    let data = modules.data.expect("catalogue");
    assert_eq!(data["total"], 4);
    assert_eq!(data["modules"][0]["name"], "core");
    assert_eq!(data["modules"][0]["actions_count"], 14);

    let health = api.health();
    let data = health.data.expect("health");
    assert_eq!(data["status"], "healthy");
    assert_eq!(data["modules_loaded"], 4);
    assert_eq!(health.metadata.timestamp, "2023-11-14T22:13:20Z");
}
