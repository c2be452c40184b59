//! # vide-core
//!
//! A multi-agent orchestration runtime that drives a network of
//! cooperating AI coding agents against a single project workspace.
//!
//! Each agent is a long-lived CLI subprocess speaking a line-delimited
//! JSON control protocol. The core decodes its response stream into an
//! immutable [`Conversation`], hosts the in-process MCP tool servers the
//! agents import, merges every agent's output into one attributed event
//! timeline, and pauses dangerous tool calls until a surface answers the
//! permission request.
//!
//! ## Quick Start
//!
//! ```ignore
//! use vide_core::{NetworkManager, RuntimeScope};
//!
//! #[tokio::main]
//! async fn main() -> vide_core::Result<()> {
//!     let scope = RuntimeScope::interactive()?;
//!     let manager = NetworkManager::new(scope).await?;
//!
//!     let network = manager.start_new("fix the login flow", None).await?;
//!     let (snapshot, mut events) = manager.subscribe_events(&network.id).await?;
//!     for event in snapshot {
//!         println!("{}", serde_json::to_string(&event)?);
//!     }
//!     while let Ok(event) = events.recv().await {
//!         println!("{}", serde_json::to_string(&event)?);
//!     }
//!     Ok(())
//! }
//! ```
//!
//! ## Architecture
//!
//! - [`decoder`] - newline-delimited JSON frames into typed [`Response`]s
//! - [`protocol`] - the framed dialogue with one subprocess, including
//!   the permission/hook/MCP control requests it asks the core to serve
//! - [`process`] - subprocess lifecycle with idempotent startup and the
//!   interrupt/terminate/kill abort ladder
//! - [`processor`] - the pure reducer folding responses into snapshots
//! - [`client`] - one agent: process + protocol + store + MCP servers
//! - [`mcp`] - the in-process tool servers (memory, tasks, agent, git,
//!   flutter runtime)
//! - [`network`] - create/persist/resume networks, route messages,
//!   propagate terminations
//! - [`events`] - the multiplexed, attributed event timeline
//! - [`permission`] - the broker pausing tool calls for allow/deny
//! - [`persistence`] / [`settings`] - atomic JSON storage
//! - [`scope`] - dependency-injected config root and working directory

pub mod agent_config;
pub mod client;
pub mod conversation;
pub mod decoder;
pub mod error;
pub mod events;
pub mod mcp;
pub mod network;
pub mod permission;
pub mod persistence;
pub mod process;
pub mod processor;
pub mod protocol;
pub mod response;
pub mod scope;
pub mod settings;
pub mod store;
pub mod tool_call;

pub use agent_config::{
    load_agent_definitions, AgentConfig, AgentDefinition, AgentType, DEFAULT_CLI_COMMAND,
};
pub use client::{load_session_transcript, AgentClient};
pub use conversation::{Conversation, ConversationMessage, ConversationState, ContextWindow};
pub use decoder::{decode_frame, DecodedLine, FrameDecoder};
pub use error::{Error, Result};
pub use events::{AgentAttribution, EventMultiplexer, EventPayload, NetworkEvent};
pub use mcp::{
    AgentServer, FlutterRuntimeServer, GitServer, McpHost, McpServer, MemoryServer, TaskServer,
    ToolContent, ToolDefinition, ToolError,
};
pub use network::{
    AgentMetadata, AgentNetwork, AgentStatus, NetworkManager, NetworkManagerBuilder, NetworkOps,
};
pub use permission::{
    pattern_matches, PermissionBroker, PermissionDecision, PermissionRequest, PermissionResponse,
};
pub use persistence::{
    atomic_write_json, FirstRunFlag, MemoryEntry, MemoryStore, NetworkStore,
};
pub use process::{CliProcess, ProcessConfig};
pub use processor::{process, ProcessOutcome};
pub use protocol::{ControlProtocol, HookCallback, MessagePart, PermissionHandler};
pub use response::{Response, Role, StopReason, Usage};
pub use scope::{
    encode_project_path, ExplicitDirRequired, FixedDir, ProcessCwd, RuntimeScope,
    WorkingDirProvider,
};
pub use settings::{ProjectSettings, SettingsStore, HOOK_MATCHER};
pub use store::ConversationStore;
pub use tool_call::{pair_invocations, FileToolCall, ToolInvocation, ToolOutcome};
