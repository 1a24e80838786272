//! Owns every configured server, keeps their connections in line with the
//! latest configuration, and exposes the discovered tools under stable aliases.

use std::collections::BTreeMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, RwLock, Weak};

use serde::Serialize;
use serde_json::Value;
use tracing::{debug, warn};

use crate::core::config::McpServerConfig;
use crate::mcp::client::{McpClient, ToolCallOutcome, ToolDescriptor};
use crate::mcp::error::McpError;
use crate::mcp::registry::{RouteTable, ToolRoute};
use crate::mcp::transport::http::build_mcp_http_client;
use crate::mcp::transport::{build_transport, McpTransport};

pub mod runtime;

pub use runtime::{RuntimeState, ServerStatus, ToolInfo, SERVER_DISABLED_MESSAGE};

use runtime::ServerRuntime;

/// Creates transports for runtimes that need a fresh connection.
pub trait TransportFactory: Send + Sync {
    fn build(&self, config: &McpServerConfig) -> Result<Arc<dyn McpTransport>, McpError>;
}

/// Builds real transports, sharing one HTTP client across servers.
pub struct DefaultTransportFactory {
    http_client: reqwest::Client,
}

impl DefaultTransportFactory {
    pub fn new() -> Result<Self, McpError> {
        Ok(Self {
            http_client: build_mcp_http_client()?,
        })
    }
}

impl TransportFactory for DefaultTransportFactory {
    fn build(&self, config: &McpServerConfig) -> Result<Arc<dyn McpTransport>, McpError> {
        build_transport(config, &self.http_client)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RefreshSummary {
    pub servers: Vec<ServerStatus>,
    pub tools: Vec<ToolInfo>,
}

/// Outcome of running a tool through the manager. Never an `Err`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ToolExecution {
    pub success: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub output: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl ToolExecution {
    pub fn success(output: impl Into<String>) -> Self {
        Self {
            success: true,
            output: Some(output.into()),
            error: None,
        }
    }

    pub fn failure(error: impl Into<String>) -> Self {
        Self {
            success: false,
            output: None,
            error: Some(error.into()),
        }
    }
}

impl From<ToolCallOutcome> for ToolExecution {
    fn from(outcome: ToolCallOutcome) -> Self {
        match outcome {
            ToolCallOutcome::Success(output) => ToolExecution::success(output),
            ToolCallOutcome::Failed(error) => ToolExecution::failure(error),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ToolDefinition {
    pub name: String,
    pub description: String,
    pub parameters: Value,
}

/// An aliased tool ready to hand to a model. Holds only a weak handle on the
/// manager so outstanding registrations do not keep it alive.
#[derive(Clone)]
pub struct McpToolRegistration {
    pub definition: ToolDefinition,
    server_id: String,
    tool_name: String,
    manager: Weak<Shared>,
}

impl McpToolRegistration {
    pub fn server_id(&self) -> &str {
        &self.server_id
    }

    pub fn tool_name(&self) -> &str {
        &self.tool_name
    }

    pub async fn execute(&self, arguments: Value) -> ToolExecution {
        match self.manager.upgrade() {
            Some(shared) => {
                shared
                    .call_server_tool(&self.server_id, &self.tool_name, arguments)
                    .await
            }
            None => ToolExecution::failure("MCP manager has been disposed."),
        }
    }
}

impl std::fmt::Debug for McpToolRegistration {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("McpToolRegistration")
            .field("definition", &self.definition)
            .field("server_id", &self.server_id)
            .field("tool_name", &self.tool_name)
            .finish()
    }
}

struct Shared {
    factory: Box<dyn TransportFactory>,
    /// Serializes `set_servers`, `refresh`, and `dispose`.
    operations: tokio::sync::Mutex<()>,
    servers: Mutex<BTreeMap<String, ServerRuntime>>,
    routes: RwLock<Arc<RouteTable>>,
}

pub struct McpManager {
    shared: Arc<Shared>,
}

impl McpManager {
    pub fn new() -> Result<Self, McpError> {
        Ok(Self::with_factory(DefaultTransportFactory::new()?))
    }

    pub fn with_factory(factory: impl TransportFactory + 'static) -> Self {
        Self {
            shared: Arc::new(Shared {
                factory: Box::new(factory),
                operations: tokio::sync::Mutex::new(()),
                servers: Mutex::new(BTreeMap::new()),
                routes: RwLock::new(Arc::new(RouteTable::default())),
            }),
        }
    }

    /// Reconciles runtimes with `configs`. Servers whose normalized config
    /// is unchanged keep their live connection.
    pub async fn set_servers(&self, configs: Vec<McpServerConfig>) {
        let _operation = self.shared.operations.lock().await;

        let mut latest: BTreeMap<String, McpServerConfig> = BTreeMap::new();
        for mut config in configs {
            let id = config.id.trim().to_string();
            if id.is_empty() {
                warn!("Ignoring MCP server without an id");
                continue;
            }
            config.id = id.clone();
            latest.insert(id, config);
        }

        let mut retired = Vec::new();
        {
            let mut servers = self.shared.lock_servers();
            servers.retain(|id, runtime| {
                if latest.contains_key(id) {
                    return true;
                }
                debug!(server_id = %id, "Removing MCP server");
                retired.extend(runtime.client.take());
                false
            });

            for (id, config) in latest {
                match servers.get_mut(&id) {
                    Some(runtime) if runtime.same_config(&config) => {}
                    Some(runtime) => {
                        debug!(server_id = %id, "MCP server configuration changed");
                        retired.extend(runtime.replace_config(config));
                    }
                    None => {
                        debug!(server_id = %id, "Adding MCP server");
                        servers.insert(id, ServerRuntime::new(config));
                    }
                }
            }
        }

        for client in retired {
            client.stop().await;
        }
        self.shared.rebuild_routes();
    }

    /// Connects every enabled server in id order and rediscovers its tools.
    /// Failures are recorded per server and never abort the pass.
    pub async fn refresh(&self) -> RefreshSummary {
        let _operation = self.shared.operations.lock().await;

        let ids: Vec<String> = self.shared.lock_servers().keys().cloned().collect();
        for id in ids {
            self.shared.refresh_server(&id).await;
            self.shared.rebuild_routes();
        }

        RefreshSummary {
            servers: self.list_server_status(),
            tools: self.list_tool_info(),
        }
    }

    pub fn list_server_status(&self) -> Vec<ServerStatus> {
        self.shared
            .lock_servers()
            .values()
            .map(ServerRuntime::status)
            .collect()
    }

    pub fn list_tool_info(&self) -> Vec<ToolInfo> {
        let routes = self.shared.routes();
        let servers = self.shared.lock_servers();
        routes
            .routes()
            .iter()
            .filter_map(|route| {
                let descriptor = find_descriptor(&servers, route)?;
                Some(ToolInfo {
                    alias: route.alias.clone(),
                    server: route.server_id.clone(),
                    tool: route.tool_name.clone(),
                    description: descriptor.description.clone(),
                    input_schema: descriptor.input_schema.clone(),
                })
            })
            .collect()
    }

    pub fn registrations(&self) -> Vec<McpToolRegistration> {
        let manager = Arc::downgrade(&self.shared);
        self.list_tool_info()
            .into_iter()
            .map(|info| McpToolRegistration {
                definition: ToolDefinition {
                    name: info.alias,
                    description: info.description,
                    parameters: info.input_schema,
                },
                server_id: info.server,
                tool_name: info.tool,
                manager: manager.clone(),
            })
            .collect()
    }

    pub fn resolve_alias(&self, alias: &str) -> Option<ToolRoute> {
        self.shared.routes().resolve(alias).cloned()
    }

    pub async fn call_alias(&self, alias: &str, arguments: Value) -> ToolExecution {
        let Some(route) = self.resolve_alias(alias) else {
            return ToolExecution::failure(McpError::UnknownTool(alias.to_string()).to_string());
        };
        self.shared
            .call_server_tool(&route.server_id, &route.tool_name, arguments)
            .await
    }

    /// Stops every transport and forgets all servers and routes.
    pub async fn dispose(&self) {
        let _operation = self.shared.operations.lock().await;
        let clients: Vec<Arc<McpClient>> = {
            let mut servers = self.shared.lock_servers();
            let clients = servers
                .values_mut()
                .filter_map(|runtime| runtime.client.take())
                .collect();
            servers.clear();
            clients
        };
        for client in clients {
            client.stop().await;
        }
        self.shared.rebuild_routes();
        debug!("Disposed MCP manager");
    }
}

fn find_descriptor<'a>(
    servers: &'a BTreeMap<String, ServerRuntime>,
    route: &ToolRoute,
) -> Option<&'a ToolDescriptor> {
    servers
        .get(&route.server_id)?
        .tools
        .iter()
        .find(|tool| tool.name == route.tool_name)
}

/// Either a client ready to use or the reason there is none.
enum Checkout {
    Ready { client: Arc<McpClient>, generation: u64 },
    Unavailable(String),
}

impl Shared {
    fn lock_servers(&self) -> MutexGuard<'_, BTreeMap<String, ServerRuntime>> {
        self.servers.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn routes(&self) -> Arc<RouteTable> {
        let routes = self.routes.read().unwrap_or_else(PoisonError::into_inner);
        Arc::clone(&*routes)
    }

    fn rebuild_routes(&self) {
        let table = {
            let servers = self.lock_servers();
            RouteTable::build(
                servers
                    .values()
                    .filter(|runtime| runtime.state == RuntimeState::Connected)
                    .flat_map(|runtime| {
                        let server_id = runtime.config().id.as_str();
                        runtime
                            .tools
                            .iter()
                            .map(move |tool| (server_id, tool.name.as_str()))
                    }),
            )
        };
        debug!(tools = table.len(), "Rebuilt MCP tool routes");
        *self.routes.write().unwrap_or_else(PoisonError::into_inner) = Arc::new(table);
    }

    /// Validates the runtime and hands out its client, building one if absent.
    fn checkout(&self, server_id: &str, connecting: bool) -> Checkout {
        let mut servers = self.lock_servers();
        let Some(runtime) = servers.get_mut(server_id) else {
            return Checkout::Unavailable(format!("MCP server '{server_id}' is not configured."));
        };
        if let Some(reason) = runtime.unavailable_reason() {
            runtime.mark_unavailable(reason.clone());
            return Checkout::Unavailable(reason);
        }

        let client = match &runtime.client {
            Some(client) => Arc::clone(client),
            None => match self.factory.build(runtime.config()) {
                Ok(transport) => {
                    let client = Arc::new(McpClient::new(runtime.config().id.clone(), transport));
                    runtime.client = Some(Arc::clone(&client));
                    client
                }
                Err(err) => {
                    let message = err.to_string();
                    runtime.mark_unavailable(message.clone());
                    return Checkout::Unavailable(message);
                }
            },
        };
        if connecting {
            runtime.state = RuntimeState::Connecting;
        }
        Checkout::Ready {
            client,
            generation: runtime.generation(),
        }
    }

    /// Marks the runtime disconnected and stops `client` if it was still live.
    async fn record_failure(
        &self,
        server_id: &str,
        client: &Arc<McpClient>,
        generation: u64,
        message: String,
    ) {
        let detached = {
            let mut servers = self.lock_servers();
            match servers.get_mut(server_id) {
                Some(runtime) if runtime.generation() == generation => {
                    runtime.mark_failed(client, message)
                }
                _ => None,
            }
        };
        if let Some(detached) = detached {
            detached.stop().await;
        }
    }

    async fn refresh_server(&self, server_id: &str) {
        let (client, generation) = match self.checkout(server_id, true) {
            Checkout::Ready { client, generation } => (client, generation),
            Checkout::Unavailable(reason) => {
                debug!(server_id, reason = %reason, "Skipping MCP server");
                return;
            }
        };

        let discovered = match client.start().await {
            Ok(()) => client.list_tools(true).await,
            Err(err) => Err(err),
        };

        match discovered {
            Ok(tools) => {
                let mut servers = self.lock_servers();
                match servers.get_mut(server_id) {
                    Some(runtime) if runtime.generation() == generation => {
                        debug!(server_id, tools = tools.len(), "MCP server connected");
                        runtime.mark_connected(tools);
                    }
                    _ => debug!(server_id, "Discarding stale MCP refresh result"),
                }
            }
            Err(err) => {
                warn!(server_id, error = %err, "MCP server refresh failed");
                self.record_failure(server_id, &client, generation, err.to_string())
                    .await;
            }
        }
    }

    async fn call_server_tool(
        &self,
        server_id: &str,
        tool_name: &str,
        arguments: Value,
    ) -> ToolExecution {
        let (client, generation) = match self.checkout(server_id, false) {
            Checkout::Ready { client, generation } => (client, generation),
            Checkout::Unavailable(reason) => {
                self.rebuild_routes();
                return ToolExecution::failure(reason);
            }
        };

        match client.call_tool(tool_name, arguments).await {
            Ok(outcome) => outcome.into(),
            Err(err) => {
                warn!(server_id, tool = tool_name, error = %err, "MCP tool call failed");
                let message = err.to_string();
                self.record_failure(server_id, &client, generation, message.clone())
                    .await;
                self.rebuild_routes();
                ToolExecution::failure(message)
            }
        }
    }
}
