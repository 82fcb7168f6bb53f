//! Routes requests to module handlers, one at a time.

use std::sync::Arc;

use phantom_core::{
    ClientHandler, Context, DnsManager, NetworkMigrator, PhantomError, Result, ServiceMonitor,
    TweakManager, DEFAULT_LATEST, DEFAULT_LOG_LINES, DEFAULT_PER_PAGE,
};
use phantom_ghost::GhostModule;
use phantom_multihop::MultihopModule;
use serde::Serialize;
use serde_json::{json, Map, Value};
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use crate::params::required;
use crate::request::{CoreRequest, DnsRequest, GhostRequest, Module, MultihopRequest, Request};
use crate::response::{Metadata, Response, API_VERSION};

/// Entry point for every action.
///
/// Clones share the action lock, so two clones never run actions
/// concurrently.
#[derive(Clone, Debug)]
pub struct Dispatcher {
    ctx: Context,
    lock: Arc<Mutex<()>>,
}

impl Dispatcher {
    /// Dispatcher over `ctx`.
    #[must_use]
    pub fn new(ctx: Context) -> Self {
        Self {
            ctx,
            lock: Arc::new(Mutex::new(())),
        }
    }

    /// Shared context.
    #[must_use]
    pub fn context(&self) -> &Context {
        &self.ctx
    }

    /// Runs `module.action` with `params`. Never fails: errors, including a
    /// handler panic, come back as an unsuccessful [`Response`].
    pub async fn execute(&self, module: &str, action: &str, params: Map<String, Value>) -> Response {
        let metadata = Metadata::new(Some(module), Some(action), self.ctx.clock().now());
        let request = match Request::parse(module, action, params) {
            Ok(request) => request,
            Err(err) => {
                let err = PhantomError::from(err);
                warn!(module, action, code = err.code(), error = %err, "request rejected");
                return Response::failure(&err, metadata);
            }
        };
        Response::from_result(self.dispatch(request, module, action).await, metadata)
    }

    /// Runs an already decoded request under the action lock.
    ///
    /// # Errors
    ///
    /// The handler's error, or [`PhantomError::Internal`] if it panicked.
    pub async fn dispatch(&self, request: Request, module: &str, action: &str) -> Result<Value> {
        // The guard travels with the task: an abandoned caller does not free
        // the lock while its action is still running.
        let guard = Arc::clone(&self.lock).lock_owned().await;
        debug!(module, action, "action started");
        let ctx = self.ctx.clone();
        let outcome = tokio::spawn(async move {
            let _guard = guard;
            route(ctx, request).await
        })
        .await;
        let result = outcome.unwrap_or_else(|join| {
            let reason = if join.is_panic() { "handler panicked" } else { "handler cancelled" };
            Err(PhantomError::Internal(format!(
                "Unexpected error in {module}.{action}: {reason}"
            )))
        });
        match &result {
            Ok(_) => info!(module, action, "action completed"),
            Err(err) => warn!(module, action, code = err.code(), error = %err, "action failed"),
        }
        result
    }

    /// Module catalogue.
    pub fn list_modules(&self) -> Response {
        let modules: Vec<Value> = Module::ALL
            .iter()
            .map(|m| {
                json!({
                    "name": m.name(),
                    "description": m.description(),
                    "actions_count": m.actions().len(),
                    "actions": m.actions(),
                })
            })
            .collect();
        let data = json!({ "total": modules.len(), "modules": modules });
        Response::ok(data, Metadata::new(None, Some("list_modules"), self.ctx.clock().now()))
    }

    /// Liveness report.
    pub fn health(&self) -> Response {
        let names: Vec<&str> = Module::ALL.iter().map(|m| m.name()).collect();
        let data = json!({
            "status": "healthy",
            "api_version": API_VERSION,
            "modules_loaded": names.len(),
            "modules": names,
            "install_dir": self.ctx.paths().install_dir.display().to_string(),
        });
        Response::ok(data, Metadata::new(None, Some("health"), self.ctx.clock().now()))
    }
}

fn to_json<T: Serialize>(result: Result<T>) -> Result<Value> {
    Ok(serde_json::to_value(result?)?)
}

async fn route(ctx: Context, request: Request) -> Result<Value> {
    match request {
        Request::Core(req) => core(ctx, req).await,
        Request::Dns(req) => dns(ctx, req).await,
        Request::Ghost(req) => ghost(ctx, req).await,
        Request::Multihop(req) => multihop(ctx, req).await,
    }
}

async fn core(ctx: Context, request: CoreRequest) -> Result<Value> {
    match request {
        CoreRequest::AddClient { client_name } => {
            let name = required(client_name, "client_name")?;
            to_json(ClientHandler::new(ctx).add_client(&name).await)
        }
        CoreRequest::RemoveClient { client_name } => {
            let name = required(client_name, "client_name")?;
            to_json(ClientHandler::new(ctx).remove_client(&name).await)
        }
        CoreRequest::ListClients {
            page,
            per_page,
            search,
        } => to_json(
            ClientHandler::new(ctx)
                .list_clients(
                    page.unwrap_or(1),
                    per_page.unwrap_or(DEFAULT_PER_PAGE),
                    search.as_deref(),
                )
                .await,
        ),
        CoreRequest::ExportClient { client_name } => {
            let name = required(client_name, "client_name")?;
            to_json(ClientHandler::new(ctx).export_client(&name).await)
        }
        CoreRequest::LatestClients { count } => to_json(
            ClientHandler::new(ctx)
                .latest_clients(count.unwrap_or(DEFAULT_LATEST))
                .await,
        ),
        CoreRequest::ServerStatus => to_json(ServiceMonitor::new(ctx).server_status().await),
        CoreRequest::ServiceLogs { lines } => {
            let lines = lines.map_or(DEFAULT_LOG_LINES, |n| u32::try_from(n).unwrap_or(u32::MAX));
            to_json(ServiceMonitor::new(ctx).service_logs(lines).await)
        }
        CoreRequest::RestartService => to_json(ServiceMonitor::new(ctx).restart_service().await),
        CoreRequest::GetFirewallStatus => {
            to_json(ServiceMonitor::new(ctx).get_firewall_status().await)
        }
        CoreRequest::GetTweakSettings => to_json(TweakManager::new(ctx).get_tweak_settings()),
        CoreRequest::UpdateTweakSetting {
            setting_name,
            value,
        } => {
            let name = required(setting_name, "setting_name")?;
            let value = value.ok_or_else(|| PhantomError::MissingParameter("value".to_string()))?;
            to_json(TweakManager::new(ctx).update_tweak_setting(&name, &value))
        }
        CoreRequest::GetSubnetInfo => to_json(NetworkMigrator::new(ctx).get_subnet_info().await),
        CoreRequest::ValidateSubnetChange { new_subnet } => {
            let subnet = required(new_subnet, "new_subnet")?;
            to_json(NetworkMigrator::new(ctx).validate_subnet_change(&subnet).await)
        }
        CoreRequest::ChangeSubnet {
            new_subnet,
            confirm,
        } => {
            let subnet = required(new_subnet, "new_subnet")?;
            to_json(
                NetworkMigrator::new(ctx)
                    .change_subnet(&subnet, confirm.unwrap_or(false))
                    .await,
            )
        }
    }
}

async fn dns(ctx: Context, request: DnsRequest) -> Result<Value> {
    let manager = DnsManager::new(ctx);
    match request {
        DnsRequest::GetDnsServers => to_json(manager.get_dns_servers()),
        DnsRequest::ChangeDnsServers { primary, secondary } => {
            to_json(manager.change_dns_servers(primary.as_deref(), secondary.as_deref()))
        }
        DnsRequest::TestDnsServers { servers, domain } => to_json(
            manager
                .test_dns_servers(servers.as_deref(), domain.as_deref())
                .await,
        ),
        DnsRequest::Status => to_json(manager.status().await),
    }
}

async fn ghost(ctx: Context, request: GhostRequest) -> Result<Value> {
    let module = GhostModule::new(ctx);
    match request {
        GhostRequest::Enable { domain } => {
            let domain = required(domain, "domain")?;
            to_json(module.enable(&domain).await)
        }
        GhostRequest::Disable => to_json(module.disable().await),
        GhostRequest::Status => to_json(module.status().await),
    }
}

async fn multihop(ctx: Context, request: MultihopRequest) -> Result<Value> {
    let module = MultihopModule::new(ctx);
    match request {
        MultihopRequest::ImportVpnConfig {
            config_path,
            custom_name,
        } => {
            let path = required(config_path, "config_path")?;
            to_json(module.import_vpn_config(&path, custom_name.as_deref()))
        }
        MultihopRequest::RemoveVpnConfig { exit_name } => {
            let name = required(exit_name, "exit_name")?;
            to_json(module.remove_vpn_config(&name).await)
        }
        MultihopRequest::ListExits => to_json(module.list_exits()),
        MultihopRequest::EnableMultihop { exit_name } => {
            let name = required(exit_name, "exit_name")?;
            to_json(module.enable_multihop(&name).await)
        }
        MultihopRequest::DisableMultihop => to_json(module.disable_multihop().await),
        MultihopRequest::ResetState => to_json(module.reset_state().await),
        MultihopRequest::Status => to_json(module.status().await),
        MultihopRequest::TestVpn { exit_name } => to_json(module.test_vpn(exit_name.as_deref()).await),
        MultihopRequest::GetSessionLog { lines } => to_json(module.get_session_log(lines).await),
    }
}
