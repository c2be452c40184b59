//! Network manager
//!
//! Creates, persists, and resumes agent networks; tracks the live client
//! for each agent; routes inter-agent messages; and propagates
//! terminations. Agents reach back into the manager through a weak
//! [`NetworkOps`] handle, never an owning pointer.

mod model;

pub use model::{AgentMetadata, AgentNetwork, AgentStatus};

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::{Arc, Weak};

use async_trait::async_trait;
use log::{info, warn};
use tokio::sync::RwLock;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::agent_config::{
    load_agent_definitions, AgentConfig, AgentDefinition, AgentType, DEFAULT_CLI_COMMAND,
    SERVER_AGENT, SERVER_FLUTTER, SERVER_GIT, SERVER_MEMORY, SERVER_TASKS,
};
use crate::client::AgentClient;
use crate::error::{Error, Result};
use crate::events::{AgentAttribution, EventMultiplexer, NetworkEvent};
use crate::mcp::{AgentServer, FlutterRuntimeServer, GitServer, McpServer, MemoryServer, TaskServer};
use crate::permission::{PermissionBroker, PermissionResponse};
use crate::persistence::{MemoryStore, NetworkStore};
use crate::scope::RuntimeScope;
use crate::settings::SettingsStore;

/// Prefix applied to the initial prompt of a spawned agent.
fn spawned_prefix(parent_id: &str, prompt: &str) -> String {
    format!("[SPAWNED BY AGENT: {}] {}", parent_id, prompt)
}

/// Prefix applied to routed inter-agent messages.
fn routed_prefix(sender_id: &str, message: &str) -> String {
    format!("[MESSAGE FROM AGENT: {}] {}", sender_id, message)
}

/// Network operations exposed to the agents themselves (via the `agent`
/// MCP server).
#[async_trait]
pub trait NetworkOps: Send + Sync {
    async fn spawn_agent(
        &self,
        parent_id: &str,
        agent_type: AgentType,
        name: &str,
        prompt: &str,
    ) -> Result<String>;

    async fn route_message(&self, sender_id: &str, target_id: &str, message: &str) -> Result<()>;

    async fn set_agent_status(&self, agent_id: &str, status: AgentStatus) -> Result<()>;

    async fn terminate_agent(&self, agent_id: &str, reason: &str) -> Result<()>;
}

/// Servers shared by every agent in one network, reference-counted; the
/// last client to drop one stops it.
struct SharedServers {
    memory: Arc<MemoryServer>,
    tasks: Arc<TaskServer>,
    refs: usize,
}

struct NetworkInner {
    scope: RuntimeScope,
    cli_command: String,
    cli_args_override: Option<Vec<String>>,
    definitions: Vec<AgentDefinition>,
    networks: RwLock<HashMap<String, AgentNetwork>>,
    clients: RwLock<HashMap<String, Arc<AgentClient>>>,
    /// agent id -> network id
    memberships: RwLock<HashMap<String, String>>,
    stores: RwLock<HashMap<String, Arc<NetworkStore>>>,
    shared: RwLock<HashMap<String, SharedServers>>,
    current_network: parking_lot::RwLock<Option<String>>,
    mux: EventMultiplexer,
    broker: Arc<PermissionBroker>,
    cancel: CancellationToken,
    self_ref: parking_lot::RwLock<Weak<NetworkInner>>,
}

/// Configures a [`NetworkManager`].
pub struct NetworkManagerBuilder {
    scope: RuntimeScope,
    cli_command: String,
    cli_args_override: Option<Vec<String>>,
    broker: Option<Arc<PermissionBroker>>,
}

impl NetworkManagerBuilder {
    pub fn new(scope: RuntimeScope) -> Self {
        Self {
            scope,
            cli_command: DEFAULT_CLI_COMMAND.to_string(),
            cli_args_override: None,
            broker: None,
        }
    }

    /// Override the subprocess command (embedding and tests).
    pub fn cli_command(mut self, command: impl Into<String>) -> Self {
        self.cli_command = command.into();
        self
    }

    /// Replace the computed argument vector (embedding and tests).
    pub fn cli_args(mut self, args: Vec<String>) -> Self {
        self.cli_args_override = Some(args);
        self
    }

    /// Use an externally owned permission broker.
    pub fn permission_broker(mut self, broker: Arc<PermissionBroker>) -> Self {
        self.broker = Some(broker);
        self
    }

    pub async fn build(self) -> Result<NetworkManager> {
        let definitions = load_agent_definitions(&self.scope.agents_dir()).await?;
        let inner = Arc::new(NetworkInner {
            scope: self.scope,
            cli_command: self.cli_command,
            cli_args_override: self.cli_args_override,
            definitions,
            networks: RwLock::new(HashMap::new()),
            clients: RwLock::new(HashMap::new()),
            memberships: RwLock::new(HashMap::new()),
            stores: RwLock::new(HashMap::new()),
            shared: RwLock::new(HashMap::new()),
            current_network: parking_lot::RwLock::new(None),
            mux: EventMultiplexer::new(),
            broker: self.broker.unwrap_or_default(),
            cancel: CancellationToken::new(),
            self_ref: parking_lot::RwLock::new(Weak::new()),
        });
        *inner.self_ref.write() = Arc::downgrade(&inner);
        Ok(NetworkManager { inner })
    }
}

/// The manager owning every live client and persisted network.
#[derive(Clone)]
pub struct NetworkManager {
    inner: Arc<NetworkInner>,
}

impl NetworkManager {
    pub fn builder(scope: RuntimeScope) -> NetworkManagerBuilder {
        NetworkManagerBuilder::new(scope)
    }

    pub async fn new(scope: RuntimeScope) -> Result<Self> {
        Self::builder(scope).build().await
    }

    pub fn broker(&self) -> Arc<PermissionBroker> {
        self.inner.broker.clone()
    }

    pub fn events(&self) -> &EventMultiplexer {
        &self.inner.mux
    }

    pub fn current_network_id(&self) -> Option<String> {
        self.inner.current_network.read().clone()
    }

    pub async fn network(&self, network_id: &str) -> Option<AgentNetwork> {
        self.inner.networks.read().await.get(network_id).cloned()
    }

    pub async fn client(&self, agent_id: &str) -> Option<Arc<AgentClient>> {
        self.inner.clients.read().await.get(agent_id).cloned()
    }

    /// Answer a pending permission request.
    pub async fn respond_to_permission(
        &self,
        request_id: &str,
        response: PermissionResponse,
    ) -> Result<()> {
        self.inner.broker.respond(request_id, response).await
    }

    /// Create a network around an initial user message, persist it, start
    /// the main agent, and deliver the message.
    pub async fn start_new(
        &self,
        initial_message: &str,
        working_directory: Option<PathBuf>,
    ) -> Result<AgentNetwork> {
        if initial_message.trim().is_empty() {
            return Err(Error::Config("initial message must not be empty".to_string()));
        }
        let working_dir = match working_directory {
            Some(dir) => dir,
            None => self.inner.scope.resolve_working_dir()?,
        };

        let network_id = Uuid::new_v4().to_string();
        let main_agent_id = Uuid::new_v4().to_string();

        let mut network = AgentNetwork::new(
            network_id.clone(),
            initial_message.to_string(),
            Some(working_dir.clone()),
        );
        network.agents.push(AgentMetadata::new(
            main_agent_id.clone(),
            "main".to_string(),
            AgentType::Main,
        ));
        network.touch();

        let settings = Arc::new(SettingsStore::for_project(&working_dir));
        self.inner.broker.bind_settings(settings.clone());
        // Route the subprocess's pre-tool-use hook back through this
        // binary so the allow-list applies inside the CLI as well.
        if let Ok(exe) = std::env::current_exe() {
            if let Err(e) = settings
                .install_hook(&format!("{} --hook", exe.display()))
                .await
            {
                warn!("installing pre-tool-use hook failed: {}", e);
            }
        }
        self.inner
            .register_network(network.clone(), &working_dir)
            .await?;
        *self.inner.current_network.write() = Some(network_id.clone());

        let client = self
            .inner
            .build_client(&network_id, &main_agent_id, AgentType::Main, "main", false)
            .await?;
        client.send_message(initial_message).await?;
        self.inner.persist_network(&network_id).await?;

        info!("started network {} in {}", network_id, working_dir.display());
        Ok(network)
    }

    /// Rebuild clients for a persisted network, each loading its prior
    /// conversation from the CLI session file.
    pub async fn resume(&self, network: AgentNetwork) -> Result<()> {
        let working_dir = self.inner.effective_working_dir(&network)?;
        self.inner
            .broker
            .bind_settings(Arc::new(SettingsStore::for_project(&working_dir)));

        let network_id = network.id.clone();
        let agents: Vec<AgentMetadata> = network.agents.clone();
        self.inner.register_network(network, &working_dir).await?;
        *self.inner.current_network.write() = Some(network_id.clone());

        for agent in agents {
            self.inner
                .build_client(
                    &network_id,
                    &agent.id,
                    agent.agent_type.clone(),
                    &agent.name,
                    true,
                )
                .await?;
        }
        self.inner.persist_network(&network_id).await?;
        Ok(())
    }

    /// Deliver a user message to an agent (typically the main agent).
    pub async fn send_message(&self, agent_id: &str, message: &str) -> Result<()> {
        let client = self
            .client(agent_id)
            .await
            .ok_or_else(|| Error::AgentTerminated(agent_id.to_string()))?;
        client.send_message(message).await
    }

    /// Subscribe to a network's event timeline: full-state snapshot plus
    /// the live stream.
    pub async fn subscribe_events(
        &self,
        network_id: &str,
    ) -> Result<(Vec<NetworkEvent>, tokio::sync::broadcast::Receiver<NetworkEvent>)> {
        let network = self
            .network(network_id)
            .await
            .ok_or_else(|| Error::Config(format!("no network {}", network_id)))?;
        let clients = self.inner.clients.read().await;
        let conversations: Vec<(String, crate::conversation::Conversation)> = network
            .agents
            .iter()
            .filter_map(|agent| {
                clients
                    .get(&agent.id)
                    .map(|client| (agent.id.clone(), client.conversation()))
            })
            .collect();
        drop(clients);
        Ok(self.inner.mux.subscribe_with_snapshot(&conversations))
    }

    pub async fn spawn(
        &self,
        parent_id: &str,
        agent_type: AgentType,
        name: &str,
        prompt: &str,
    ) -> Result<String> {
        self.inner.spawn_agent(parent_id, agent_type, name, prompt).await
    }

    pub async fn route(&self, sender_id: &str, target_id: &str, message: &str) -> Result<()> {
        self.inner.route_message(sender_id, target_id, message).await
    }

    pub async fn set_status(&self, agent_id: &str, status: AgentStatus) -> Result<()> {
        self.inner.set_agent_status(agent_id, status).await
    }

    pub async fn terminate(&self, agent_id: &str, reason: &str) -> Result<()> {
        self.inner.terminate_agent(agent_id, reason).await
    }

    /// Cancel every client and subscriber and drop all live state.
    pub async fn shutdown(&self) {
        self.inner.cancel.cancel();
        let clients: Vec<Arc<AgentClient>> =
            self.inner.clients.write().await.drain().map(|(_, c)| c).collect();
        for client in clients {
            if let Err(e) = client.close(&[]).await {
                warn!("closing client {} failed: {}", client.id(), e);
            }
        }
        self.inner.shared.write().await.clear();
        self.inner.memberships.write().await.clear();
    }
}

impl NetworkInner {
    fn effective_working_dir(&self, network: &AgentNetwork) -> Result<PathBuf> {
        match &network.worktree_path {
            Some(path) => Ok(path.clone()),
            None => self.scope.resolve_working_dir(),
        }
    }

    async fn register_network(&self, network: AgentNetwork, working_dir: &PathBuf) -> Result<()> {
        let network_id = network.id.clone();
        self.stores.write().await.insert(
            network_id.clone(),
            Arc::new(NetworkStore::new(self.scope.networks_dir(working_dir))),
        );
        self.shared.write().await.insert(
            network_id.clone(),
            SharedServers {
                memory: Arc::new(MemoryServer::new(Arc::new(MemoryStore::new(
                    self.scope.memory_file(working_dir),
                )))),
                tasks: Arc::new(TaskServer::new()),
                refs: 0,
            },
        );
        self.networks.write().await.insert(network_id, network);
        Ok(())
    }

    async fn persist_network(&self, network_id: &str) -> Result<()> {
        let network = {
            let mut networks = self.networks.write().await;
            let Some(network) = networks.get_mut(network_id) else {
                return Ok(());
            };
            network.touch();
            network.clone()
        };
        let store = self.stores.read().await.get(network_id).cloned();
        match store {
            Some(store) => store.save(&network).await,
            None => Ok(()),
        }
    }

    /// Construct and register the client for one agent row.
    async fn build_client(
        self: &Arc<Self>,
        network_id: &str,
        agent_id: &str,
        agent_type: AgentType,
        name: &str,
        resume: bool,
    ) -> Result<Arc<AgentClient>> {
        let working_dir = {
            let networks = self.networks.read().await;
            let network = networks
                .get(network_id)
                .ok_or_else(|| Error::Config(format!("no network {}", network_id)))?;
            self.effective_working_dir(network)?
        };

        let mut config = AgentConfig::resolve(
            agent_id,
            agent_type.clone(),
            name,
            working_dir.clone(),
            &self.definitions,
        )?;
        config.cli_command = self.cli_command.clone();
        config.cli_args_override = self.cli_args_override.clone();
        if resume {
            config.session_file = self.scope.cli_session_file(&working_dir, agent_id);
        }

        let servers = self
            .servers_for(network_id, agent_id, &config, &working_dir)
            .await?;

        // The deny path aborts the client, which does not exist until
        // create returns; the handler reaches it through this slot.
        let client_slot: Arc<parking_lot::RwLock<Option<Weak<AgentClient>>>> =
            Arc::new(parking_lot::RwLock::new(None));
        let broker = self.broker.clone();
        let mux = self.mux.clone();
        let slot_for_handler = client_slot.clone();
        let handler: crate::protocol::PermissionHandler = Arc::new(move |request| {
            let broker = broker.clone();
            let mux = mux.clone();
            let slot = slot_for_handler.clone();
            Box::pin(async move {
                mux.emit_permission_request(&request);
                let response = broker.request(request).await;
                if !response.is_allowed() {
                    if let Some(client) = slot.read().clone().and_then(|weak| weak.upgrade()) {
                        tokio::spawn(async move {
                            if let Err(e) = client.abort().await {
                                warn!("abort after deny failed: {}", e);
                            }
                        });
                    }
                }
                response
            })
        });

        self.mux.register_agent(AgentAttribution {
            agent_id: agent_id.to_string(),
            agent_type,
            agent_name: name.to_string(),
            task_name: None,
        });

        let client = AgentClient::create(config, servers, None, Some(handler)).await?;
        *client_slot.write() = Some(Arc::downgrade(&client));

        self.mux
            .attach(agent_id, client.store(), self.cancel.child_token());
        self.spawn_usage_rollup(network_id, agent_id, &client);

        self.clients
            .write()
            .await
            .insert(agent_id.to_string(), client.clone());
        self.memberships
            .write()
            .await
            .insert(agent_id.to_string(), network_id.to_string());
        if let Some(shared) = self.shared.write().await.get_mut(network_id) {
            shared.refs += 1;
        }
        Ok(client)
    }

    /// Instantiate the MCP server set an agent type imports.
    async fn servers_for(
        self: &Arc<Self>,
        network_id: &str,
        agent_id: &str,
        config: &AgentConfig,
        working_dir: &PathBuf,
    ) -> Result<Vec<Arc<dyn McpServer>>> {
        let shared = self.shared.read().await;
        let shared = shared
            .get(network_id)
            .ok_or_else(|| Error::Config(format!("no network {}", network_id)))?;

        let mut servers: Vec<Arc<dyn McpServer>> = Vec::new();
        for server_name in &config.mcp_servers {
            match server_name.as_str() {
                SERVER_MEMORY => servers.push(shared.memory.clone()),
                SERVER_TASKS => servers.push(shared.tasks.clone()),
                SERVER_AGENT => {
                    let server = AgentServer::new(agent_id);
                    let ops: Weak<dyn NetworkOps> = self.self_ref.read().clone();
                    server.bind(ops);
                    servers.push(Arc::new(server));
                }
                SERVER_GIT => servers.push(Arc::new(GitServer::new(working_dir.clone()))),
                SERVER_FLUTTER => {
                    servers.push(Arc::new(FlutterRuntimeServer::new(working_dir.clone())))
                }
                other => {
                    return Err(Error::Config(format!("unknown MCP server {}", other)));
                }
            }
        }
        Ok(servers)
    }

    /// Fold each turn's conversation totals into the agent's persisted
    /// metadata row.
    fn spawn_usage_rollup(self: &Arc<Self>, network_id: &str, agent_id: &str, client: &AgentClient) {
        let inner = Arc::downgrade(self);
        let network_id = network_id.to_string();
        let agent_id = agent_id.to_string();
        let mut turns = client.on_turn_complete();
        let cancel = self.cancel.child_token();
        tokio::spawn(async move {
            loop {
                let snapshot = tokio::select! {
                    _ = cancel.cancelled() => break,
                    snapshot = turns.recv() => snapshot,
                };
                let snapshot = match snapshot {
                    Ok(snapshot) => snapshot,
                    Err(tokio::sync::broadcast::error::RecvError::Lagged(_)) => continue,
                    Err(tokio::sync::broadcast::error::RecvError::Closed) => break,
                };
                let Some(inner) = inner.upgrade() else { break };
                {
                    let mut networks = inner.networks.write().await;
                    if let Some(row) = networks
                        .get_mut(&network_id)
                        .and_then(|n| n.agent_mut(&agent_id))
                    {
                        row.total_input_tokens = snapshot.total_input_tokens;
                        row.total_output_tokens = snapshot.total_output_tokens;
                        row.total_cache_read_input_tokens = snapshot.total_cache_read_input_tokens;
                        row.total_cache_creation_input_tokens =
                            snapshot.total_cache_creation_input_tokens;
                        row.total_cost_usd = snapshot.total_cost_usd;
                    }
                }
                if let Err(e) = inner.persist_network(&network_id).await {
                    warn!("persisting usage for {} failed: {}", agent_id, e);
                }
            }
        });
    }

    async fn network_of(&self, agent_id: &str) -> Result<String> {
        self.memberships
            .read()
            .await
            .get(agent_id)
            .cloned()
            .ok_or_else(|| Error::Config(format!("no such agent: {}", agent_id)))
    }
}

#[async_trait]
impl NetworkOps for NetworkInner {
    async fn spawn_agent(
        &self,
        parent_id: &str,
        agent_type: AgentType,
        name: &str,
        prompt: &str,
    ) -> Result<String> {
        let network_id = self.network_of(parent_id).await?;
        let agent_id = Uuid::new_v4().to_string();

        {
            let mut networks = self.networks.write().await;
            let network = networks
                .get_mut(&network_id)
                .ok_or_else(|| Error::Config(format!("no network {}", network_id)))?;
            network.agents.push(AgentMetadata::new(
                agent_id.clone(),
                name.to_string(),
                agent_type.clone(),
            ));
        }

        let this = self
            .self_ref
            .read()
            .upgrade()
            .ok_or_else(|| Error::Other("network manager is shutting down".to_string()))?;
        let client = this
            .build_client(&network_id, &agent_id, agent_type, name, false)
            .await?;
        client
            .send_message(&spawned_prefix(parent_id, prompt))
            .await?;

        self.set_agent_status(parent_id, AgentStatus::WaitingForAgent)
            .await?;
        self.persist_network(&network_id).await?;
        info!("agent {} spawned {} ({})", parent_id, agent_id, name);
        Ok(agent_id)
    }

    async fn route_message(&self, sender_id: &str, target_id: &str, message: &str) -> Result<()> {
        // The target must be a known row; a row without a live client is
        // a terminated agent.
        self.network_of(target_id).await?;
        let client = self.clients.read().await.get(target_id).cloned();
        let client = client.ok_or_else(|| Error::AgentTerminated(target_id.to_string()))?;
        client.send_message(&routed_prefix(sender_id, message)).await
    }

    async fn set_agent_status(&self, agent_id: &str, status: AgentStatus) -> Result<()> {
        let network_id = self.network_of(agent_id).await?;
        {
            let mut networks = self.networks.write().await;
            let row = networks
                .get_mut(&network_id)
                .and_then(|n| n.agent_mut(agent_id))
                .ok_or_else(|| Error::Config(format!("no such agent: {}", agent_id)))?;
            row.status = status;
        }
        self.mux.emit_status(agent_id, status);
        self.persist_network(&network_id).await
    }

    async fn terminate_agent(&self, agent_id: &str, reason: &str) -> Result<()> {
        let network_id = self.network_of(agent_id).await?;
        {
            let networks = self.networks.read().await;
            let network = networks
                .get(&network_id)
                .ok_or_else(|| Error::Config(format!("no network {}", network_id)))?;
            if network.main_agent().map(|a| a.id.as_str()) == Some(agent_id) {
                return Err(Error::Config(
                    "the main agent cannot be terminated".to_string(),
                ));
            }
        }

        let client = self.clients.write().await.remove(agent_id);
        let Some(client) = client else {
            return Err(Error::AgentTerminated(agent_id.to_string()));
        };

        // Shared servers survive while other clients in the network hold
        // them; the last drop stops them.
        let keep_shared = {
            let mut shared = self.shared.write().await;
            match shared.get_mut(&network_id) {
                Some(entry) => {
                    entry.refs = entry.refs.saturating_sub(1);
                    if entry.refs > 0 {
                        vec![SERVER_MEMORY.to_string(), SERVER_TASKS.to_string()]
                    } else {
                        Vec::new()
                    }
                }
                None => Vec::new(),
            }
        };
        if let Err(e) = client.close(&keep_shared).await {
            warn!("closing terminated agent {} failed: {}", agent_id, e);
        }

        // The row and its transcript stay; only the live client detaches.
        info!("terminated agent {} ({})", agent_id, reason);
        self.persist_network(&network_id).await
    }
}
