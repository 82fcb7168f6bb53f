//! Sandboxed [`Context`] for tests.
//!
//! Every path lives under a temporary directory, commands go to a
//! [`ScriptedExecutor`] and time and randomness are deterministic. A few
//! commands are answered from the files in the sandbox so that the kernel
//! appears to follow the interface file:
//!
//! - `systemctl is-active` prints `active`
//! - `ip -4 -o addr show [if]` reports the interface file's `Address` plus
//!   a public `eth0`
//! - `ip route show default` routes via `eth0`
//! - `wg show <if> dump` lists the peers of the interface file
//! - `iptables`, `ip rule` and `ip route ... table <t>` act on an in-memory
//!   rule set that tests can inspect through [`Sandbox::iptables_rules`]
//!   and [`Sandbox::ip_rules`]

use std::fmt::Write as _;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use ipnet::Ipv4Net;
use parking_lot::Mutex;
use phantom_system::fs::{self as pfs, PRIVATE_MODE};
use phantom_system::{CommandOutput, ManualClock, ScriptedExecutor, SeededRandom, SystemCommand};
use phantom_wireguard::{parse_wg_config, InterfaceConfig, PrivateKey, KEY_SIZE};
use tempfile::TempDir;

use crate::config::PhantomConfig;
use crate::context::Context;
use crate::settings::{Paths, Settings, Timeouts};
use crate::store::DataStore;

/// Public address of the sandbox host.
pub const HOST_IP: &str = "203.0.113.10";

/// Unix time the sandbox clock starts at.
pub const START_UNIX: i64 = 1_700_000_000;

/// Temporary install with fakes wired in.
pub struct Sandbox {
    dir: TempDir,
    ctx: Context,
    exec: Arc<ScriptedExecutor>,
    clock: Arc<ManualClock>,
    kernel: Arc<Mutex<Kernel>>,
}

/// Simulated netfilter and policy routing state.
#[derive(Debug, Default)]
struct Kernel {
    /// `(table, chain, spec)`.
    iptables: Vec<(String, String, String)>,
    /// `(priority, selector)`, selector as `ip rule show` prints it.
    rules: Vec<(u32, String)>,
    /// `(table, route)`.
    routes: Vec<(String, String)>,
}

impl Sandbox {
    /// Fresh install with subnet `10.8.0.0/24` and no clients.
    ///
    /// # Panics
    ///
    /// Panics if the temporary directory cannot be prepared.
    #[must_use]
    #[allow(clippy::expect_used)]
    pub fn new() -> Self {
        let dir = tempfile::tempdir().expect("tempdir");
        let paths = Paths::under(dir.path());
        let mut settings = Settings::new(paths.clone());
        settings.timeouts = Timeouts::fast();

        let mut config = PhantomConfig::default();
        config.wireguard.server_ip = Some(HOST_IP.to_string());
        config.save(&paths.phantom_json()).expect("seed phantom.json");

        let server = PrivateKey::from_entropy([1; KEY_SIZE]);
        let subnet = config.wireguard.network;
        let mut wg = InterfaceConfig::new(server)
            .with_listen_port(config.wireguard.port)
            .with_address(
                Ipv4Net::new(crate::allocation::server_address(subnet), subnet.prefix_len())
                    .expect("server address")
                    .into(),
            );
        wg.post_up.push(format!(
            "iptables -t nat -A POSTROUTING -s {subnet} -o eth0 -j MASQUERADE"
        ));
        wg.post_down.push(format!(
            "iptables -t nat -D POSTROUTING -s {subnet} -o eth0 -j MASQUERADE"
        ));
        DataStore::open(&paths.clients_db(), subnet)
            .and_then(|store| store.save())
            .expect("seed store");

        let wg_path = paths.wg_config(config.interface());
        pfs::write_atomic(&wg_path, wg.render().as_bytes(), PRIVATE_MODE).expect("seed wg conf");

        let exec = Arc::new(ScriptedExecutor::new());
        let kernel = Arc::new(Mutex::new(Kernel::default()));
        kernel.lock().iptables.push((
            "nat".to_string(),
            "POSTROUTING".to_string(),
            format!("-s {subnet} -o eth0 -j MASQUERADE"),
        ));
        script_kernel(&exec, &kernel);
        script_host(&exec, &paths, config.interface());

        let clock = Arc::new(ManualClock::at_unix(START_UNIX));
        let ctx = Context::new(
            settings,
            exec.clone(),
            clock.clone(),
            Arc::new(SeededRandom::new(7)),
        );
        Self {
            dir,
            ctx,
            exec,
            clock,
            kernel,
        }
    }

    /// Context bound to the sandbox.
    #[must_use]
    pub fn ctx(&self) -> Context {
        self.ctx.clone()
    }

    /// Context that issues self-signed certificates instead of using ACME.
    #[must_use]
    pub fn test_mode_ctx(&self) -> Context {
        let mut settings = self.ctx.settings().clone();
        settings.test_mode = true;
        Context::new(
            settings,
            self.exec.clone(),
            self.clock.clone(),
            Arc::new(SeededRandom::new(7)),
        )
    }

    /// Scripted executor, for extra rules and call assertions.
    #[must_use]
    pub fn exec(&self) -> &ScriptedExecutor {
        &self.exec
    }

    /// Manual clock.
    #[must_use]
    pub fn clock(&self) -> &ManualClock {
        &self.clock
    }

    /// Sandbox root.
    #[must_use]
    pub fn root(&self) -> &Path {
        self.dir.path()
    }

    /// Filesystem layout.
    #[must_use]
    pub fn paths(&self) -> &Paths {
        self.ctx.paths()
    }

    /// Current `phantom.json`.
    ///
    /// # Panics
    ///
    /// Panics if the file is unreadable.
    #[must_use]
    #[allow(clippy::expect_used)]
    pub fn config(&self) -> PhantomConfig {
        self.ctx.load_config().expect("phantom.json")
    }

    /// Current client store.
    ///
    /// # Panics
    ///
    /// Panics if the store is unreadable.
    #[must_use]
    #[allow(clippy::expect_used)]
    pub fn store(&self) -> DataStore {
        self.ctx.open_store(&self.config()).expect("store")
    }

    /// Path of the main interface file.
    #[must_use]
    pub fn wg_path(&self) -> PathBuf {
        self.paths().wg_config(self.config().interface())
    }

    /// Parsed main interface file.
    ///
    /// # Panics
    ///
    /// Panics if the file is missing or malformed.
    #[must_use]
    #[allow(clippy::expect_used)]
    pub fn read_wg_config(&self) -> InterfaceConfig {
        let raw = std::fs::read_to_string(self.wg_path()).expect("wg conf");
        parse_wg_config(&raw).expect("parse wg conf")
    }

    /// Installed iptables rules as `-t <table> -A <chain> <spec>`.
    #[must_use]
    pub fn iptables_rules(&self) -> Vec<String> {
        self.kernel
            .lock()
            .iptables
            .iter()
            .map(|(table, chain, spec)| format!("-t {table} -A {chain} {spec}"))
            .collect()
    }

    /// Returns true if an installed iptables rule contains `fragment`.
    #[must_use]
    pub fn has_iptables_rule(&self, fragment: &str) -> bool {
        self.iptables_rules().iter().any(|r| r.contains(fragment))
    }

    /// Policy routing rules as `ip rule show` prints them.
    #[must_use]
    pub fn ip_rules(&self) -> Vec<String> {
        render_rules(&self.kernel.lock().rules)
    }

    /// Routes in `table`.
    #[must_use]
    pub fn routes(&self, table: &str) -> Vec<String> {
        self.kernel
            .lock()
            .routes
            .iter()
            .filter(|(t, _)| t == table)
            .map(|(_, r)| r.clone())
            .collect()
    }

    /// Raw bytes of a file relative to the sandbox, if present.
    #[must_use]
    pub fn snapshot(&self, path: &Path) -> Option<Vec<u8>> {
        std::fs::read(path).ok()
    }
}

impl Default for Sandbox {
    fn default() -> Self {
        Self::new()
    }
}

fn script_host(exec: &ScriptedExecutor, paths: &Paths, interface: &str) {
    exec.on("systemctl is-active", CommandOutput::ok("active\n"));
    exec.on(
        "ip route show default",
        CommandOutput::ok("default via 203.0.113.1 dev eth0 proto static\n"),
    );

    let wg_path = paths.wg_config(interface);
    let iface = interface.to_string();
    exec.on_with("ip -4 -o addr show", move |cmd| {
        let wanted = cmd.arguments().get(4).cloned();
        let mut lines = vec![
            "1: lo    inet 127.0.0.1/8 scope host lo".to_string(),
            format!("2: eth0    inet {HOST_IP}/24 brd 203.0.113.255 scope global eth0"),
        ];
        if let Some(address) = read_address(&wg_path) {
            lines.push(format!("5: {iface}    inet {address} scope global {iface}"));
        }
        let out = lines
            .into_iter()
            .filter(|l| match &wanted {
                Some(name) => l.split_whitespace().nth(1) == Some(name.as_str()),
                None => true,
            })
            .collect::<Vec<_>>()
            .join("\n");
        CommandOutput::ok(out)
    });

    let wg_path = paths.wg_config(interface);
    exec.on_with(&format!("wg show {interface} dump"), move |_| {
        let Some(config) = std::fs::read_to_string(&wg_path)
            .ok()
            .and_then(|raw| parse_wg_config(&raw).ok())
        else {
            return CommandOutput::failed(1, "Unable to access interface: No such device");
        };
        let mut out = format!(
            "{}\t{}\t{}\toff\n",
            config.private_key.to_base64(),
            config.private_key.public_key().to_base64(),
            config.listen_port.unwrap_or(0)
        );
        for peer in &config.peers {
            let allowed = peer
                .allowed_ips
                .iter()
                .map(ToString::to_string)
                .collect::<Vec<_>>()
                .join(",");
            let _ = writeln!(
                out,
                "{}\t(none)\t(none)\t{allowed}\t0\t0\t0\toff",
                peer.public_key.to_base64()
            );
        }
        CommandOutput::ok(out)
    });
}

fn script_kernel(exec: &ScriptedExecutor, kernel: &Arc<Mutex<Kernel>>) {
    let state = Arc::clone(kernel);
    exec.on_with("iptables", move |cmd| iptables(&mut state.lock(), cmd));

    let state = Arc::clone(kernel);
    exec.on_with("iptables-save", move |cmd| {
        let table = cmd.arguments().get(1).cloned().unwrap_or_else(|| "filter".to_string());
        let kernel = state.lock();
        let mut out = format!("*{table}\n");
        for (t, chain, spec) in &kernel.iptables {
            if *t == table {
                let _ = writeln!(out, "-A {chain} {spec}");
            }
        }
        out.push_str("COMMIT\n");
        CommandOutput::ok(out)
    });

    let state = Arc::clone(kernel);
    exec.on_with("ip rule", move |cmd| ip_rule(&mut state.lock(), cmd));

    let state = Arc::clone(kernel);
    exec.on_with("ip route", move |cmd| ip_route(&mut state.lock(), cmd));
}

fn iptables(kernel: &mut Kernel, cmd: &SystemCommand) -> CommandOutput {
    let args = cmd.arguments();
    let (table, rest) = match args {
        [flag, table, rest @ ..] if flag == "-t" => (table.clone(), rest),
        rest => ("filter".to_string(), rest),
    };
    let Some((op, rest)) = rest.split_first() else {
        return CommandOutput::failed(2, "no command specified");
    };
    let chain = rest.first().cloned().unwrap_or_default();
    let spec = rest.get(1..).map(|s| s.join(" ")).unwrap_or_default();
    let position = kernel
        .iptables
        .iter()
        .position(|(t, c, s)| *t == table && *c == chain && *s == spec);
    match op.as_str() {
        "-C" => match position {
            Some(_) => CommandOutput::ok(""),
            None => CommandOutput::failed(1, "Bad rule (does a matching rule exist in that chain?)."),
        },
        "-A" => {
            kernel.iptables.push((table, chain, spec));
            CommandOutput::ok("")
        }
        "-I" => {
            kernel.iptables.insert(0, (table, chain, spec));
            CommandOutput::ok("")
        }
        "-D" => match position {
            Some(i) => {
                kernel.iptables.remove(i);
                CommandOutput::ok("")
            }
            None => CommandOutput::failed(1, "Bad rule (does a matching rule exist in that chain?)."),
        },
        "-S" => {
            let mut out = String::new();
            for (t, c, s) in &kernel.iptables {
                if *t == table && (chain.is_empty() || *c == chain) {
                    let _ = writeln!(out, "-A {c} {s}");
                }
            }
            CommandOutput::ok(out)
        }
        _ => CommandOutput::ok(""),
    }
}

/// `from X to Y table T priority N` becomes `(N, "from X to Y lookup T")`.
fn parse_rule(args: &[String]) -> (Option<u32>, String) {
    let mut priority = None;
    let mut words = Vec::new();
    let mut iter = args.iter();
    while let Some(word) = iter.next() {
        match word.as_str() {
            "priority" | "pref" | "preference" => {
                priority = iter.next().and_then(|p| p.parse().ok());
            }
            "table" | "lookup" => {
                words.push("lookup".to_string());
                if let Some(t) = iter.next() {
                    words.push(t.clone());
                }
            }
            other => words.push(other.to_string()),
        }
    }
    (priority, words.join(" "))
}

fn render_rules(rules: &[(u32, String)]) -> Vec<String> {
    let mut sorted = rules.to_vec();
    sorted.sort_by_key(|(p, _)| *p);
    let mut lines = vec!["0:\tfrom all lookup local".to_string()];
    lines.extend(sorted.into_iter().map(|(p, sel)| format!("{p}:\t{sel}")));
    lines.push("32766:\tfrom all lookup main".to_string());
    lines.push("32767:\tfrom all lookup default".to_string());
    lines
}

fn ip_rule(kernel: &mut Kernel, cmd: &SystemCommand) -> CommandOutput {
    let args = cmd.arguments();
    match args.get(1).map(String::as_str) {
        Some("add") => {
            let (priority, selector) = parse_rule(&args[2..]);
            kernel.rules.push((priority.unwrap_or(32_000), selector));
            CommandOutput::ok("")
        }
        Some("del" | "delete") => {
            let (priority, selector) = parse_rule(&args[2..]);
            let found = kernel.rules.iter().position(|(p, s)| {
                priority.is_none_or(|want| *p == want) && (selector.is_empty() || *s == selector)
            });
            match found {
                Some(i) => {
                    kernel.rules.remove(i);
                    CommandOutput::ok("")
                }
                None => CommandOutput::failed(2, "RTNETLINK answers: No such file or directory"),
            }
        }
        None | Some("show" | "list") => CommandOutput::ok(render_rules(&kernel.rules).join("\n")),
        Some(_) => CommandOutput::ok(""),
    }
}

fn ip_route(kernel: &mut Kernel, cmd: &SystemCommand) -> CommandOutput {
    let args = &cmd.arguments()[1..];
    let table = args
        .iter()
        .position(|a| a == "table")
        .and_then(|i| args.get(i + 1))
        .cloned()
        .unwrap_or_else(|| "main".to_string());
    let route = args
        .iter()
        .skip(1)
        .take_while(|a| *a != "table")
        .cloned()
        .collect::<Vec<_>>()
        .join(" ");
    match args.first().map(String::as_str) {
        Some("add" | "replace") => {
            kernel.routes.retain(|(t, r)| !(t == &table && r == &route));
            kernel.routes.push((table, route));
            CommandOutput::ok("")
        }
        Some("del" | "delete") => {
            let before = kernel.routes.len();
            kernel.routes.retain(|(t, r)| !(t == &table && r == &route));
            if kernel.routes.len() == before {
                CommandOutput::failed(2, "RTNETLINK answers: No such process")
            } else {
                CommandOutput::ok("")
            }
        }
        Some("flush") => {
            kernel.routes.retain(|(t, _)| t != &table);
            CommandOutput::ok("")
        }
        _ => {
            let out = kernel
                .routes
                .iter()
                .filter(|(t, _)| *t == table)
                .map(|(_, r)| r.clone())
                .collect::<Vec<_>>()
                .join("\n");
            CommandOutput::ok(out)
        }
    }
}

fn read_address(wg_path: &Path) -> Option<String> {
    let raw = std::fs::read_to_string(wg_path).ok()?;
    let config = parse_wg_config(&raw).ok()?;
    config.ipv4_address().map(|a| a.to_string())
}
