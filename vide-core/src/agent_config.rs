//! Agent configuration
//!
//! Resolves an agent type to its system prompt and MCP server subset,
//! loads user-defined agent definitions, and computes the argument vector
//! the subprocess is launched with.

use std::collections::HashMap;
use std::fmt;
use std::path::{Path, PathBuf};
use std::str::FromStr;

use serde::de::Error as DeError;
use serde::{Deserialize, Deserializer, Serialize, Serializer};

use crate::error::{Error, Result};

/// Server names every agent type can draw from.
pub const SERVER_MEMORY: &str = "memory";
pub const SERVER_TASKS: &str = "task-management";
pub const SERVER_AGENT: &str = "agent";
pub const SERVER_GIT: &str = "git";
pub const SERVER_FLUTTER: &str = "flutter-runtime";

/// Default subprocess command.
pub const DEFAULT_CLI_COMMAND: &str = "claude";

/// The role an agent plays in a network.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum AgentType {
    Main,
    Implementation,
    Planning,
    ContextCollection,
    FlutterTester,
    UserDefined(String),
}

impl AgentType {
    /// Parse the wire form; `userDefined:<name>` selects a user definition.
    pub fn parse(raw: &str) -> Self {
        match raw {
            "main" => Self::Main,
            "implementation" => Self::Implementation,
            "planning" => Self::Planning,
            "contextCollection" => Self::ContextCollection,
            "flutterTester" => Self::FlutterTester,
            other => match other.strip_prefix("userDefined:") {
                Some(name) => Self::UserDefined(name.to_string()),
                None => Self::UserDefined(other.to_string()),
            },
        }
    }

    pub fn as_wire(&self) -> String {
        match self {
            Self::Main => "main".to_string(),
            Self::Implementation => "implementation".to_string(),
            Self::Planning => "planning".to_string(),
            Self::ContextCollection => "contextCollection".to_string(),
            Self::FlutterTester => "flutterTester".to_string(),
            Self::UserDefined(name) => format!("userDefined:{}", name),
        }
    }

    /// Built-in system prompt for this agent type.
    ///
    /// User-defined types take their prompt from the matching definition.
    pub fn system_prompt(&self, definitions: &[AgentDefinition]) -> Result<String> {
        match self {
            Self::Main => Ok("You are the main orchestrator of a network of coding agents. \
                 Break the goal into tasks, spawn specialist agents for focused work, \
                 route findings between them, and keep the shared task list current."
                .to_string()),
            Self::Implementation => Ok("You are an implementation agent. Make the code changes you were asked \
                 for, verify them, and report back to the agent that spawned you."
                .to_string()),
            Self::Planning => Ok("You are a planning agent. Study the goal, produce a concrete plan as \
                 tasks on the shared task list, and report the plan back. Do not \
                 modify code."
                .to_string()),
            Self::ContextCollection => Ok("You are a context-collection agent. Locate the code, files and \
                 facts relevant to your instructions and report them back \
                 concisely. Do not modify anything."
                .to_string()),
            Self::FlutterTester => Ok("You are a Flutter testing agent. Drive the running app through the \
                 runtime tools, observe the results, and report findings back."
                .to_string()),
            Self::UserDefined(name) => definitions
                .iter()
                .find(|d| &d.name == name)
                .map(|d| d.system_prompt.clone())
                .ok_or_else(|| Error::Config(format!("unknown agent definition: {}", name))),
        }
    }

    /// Names of the MCP servers this agent type imports.
    pub fn mcp_server_names(&self, definitions: &[AgentDefinition]) -> Result<Vec<String>> {
        let built_in = |names: &[&str]| names.iter().map(ToString::to_string).collect();
        match self {
            Self::Main => Ok(built_in(&[
                SERVER_MEMORY,
                SERVER_TASKS,
                SERVER_AGENT,
                SERVER_GIT,
                SERVER_FLUTTER,
            ])),
            Self::Implementation => Ok(built_in(&[
                SERVER_MEMORY,
                SERVER_TASKS,
                SERVER_AGENT,
                SERVER_GIT,
            ])),
            Self::Planning => Ok(built_in(&[SERVER_MEMORY, SERVER_TASKS, SERVER_AGENT])),
            Self::ContextCollection => Ok(built_in(&[SERVER_MEMORY, SERVER_AGENT])),
            Self::FlutterTester => Ok(built_in(&[SERVER_MEMORY, SERVER_AGENT, SERVER_FLUTTER])),
            Self::UserDefined(name) => {
                let definition = definitions
                    .iter()
                    .find(|d| &d.name == name)
                    .ok_or_else(|| Error::Config(format!("unknown agent definition: {}", name)))?;
                let known = [
                    SERVER_MEMORY,
                    SERVER_TASKS,
                    SERVER_AGENT,
                    SERVER_GIT,
                    SERVER_FLUTTER,
                ];
                for server in &definition.mcp_servers {
                    if !known.contains(&server.as_str()) {
                        return Err(Error::Config(format!(
                            "agent definition {} names unknown MCP server {}",
                            name, server
                        )));
                    }
                }
                Ok(definition.mcp_servers.clone())
            }
        }
    }
}

impl fmt::Display for AgentType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.as_wire())
    }
}

impl FromStr for AgentType {
    type Err = std::convert::Infallible;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        Ok(Self::parse(s))
    }
}

impl Serialize for AgentType {
    fn serialize<S: Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.as_wire())
    }
}

impl<'de> Deserialize<'de> for AgentType {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> std::result::Result<Self, D::Error> {
        let raw = String::deserialize(deserializer)?;
        if raw.is_empty() {
            return Err(D::Error::custom("agent type must not be empty"));
        }
        Ok(Self::parse(&raw))
    }
}

/// A user-supplied agent definition loaded from `<configRoot>/agents/`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AgentDefinition {
    pub name: String,
    #[serde(default)]
    pub description: String,
    pub system_prompt: String,
    #[serde(default)]
    pub mcp_servers: Vec<String>,
}

/// Load every `*.json` definition in `dir`, skipping unreadable files.
pub async fn load_agent_definitions(dir: &Path) -> Result<Vec<AgentDefinition>> {
    let mut definitions = Vec::new();
    let mut entries = match tokio::fs::read_dir(dir).await {
        Ok(entries) => entries,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(definitions),
        Err(e) => return Err(Error::Persistence(e.to_string())),
    };
    while let Some(entry) = entries
        .next_entry()
        .await
        .map_err(|e| Error::Persistence(e.to_string()))?
    {
        let path = entry.path();
        if path.extension().and_then(|e| e.to_str()) != Some("json") {
            continue;
        }
        match tokio::fs::read_to_string(&path).await {
            Ok(contents) => match serde_json::from_str::<AgentDefinition>(&contents) {
                Ok(definition) => definitions.push(definition),
                Err(e) => log::warn!(
                    "skipping invalid agent definition {}: {}",
                    path.display(),
                    e
                ),
            },
            Err(e) => log::warn!("skipping unreadable agent definition {}: {}", path.display(), e),
        }
    }
    definitions.sort_by(|a, b| a.name.cmp(&b.name));
    Ok(definitions)
}

/// Everything needed to launch one agent subprocess.
#[derive(Debug, Clone)]
pub struct AgentConfig {
    pub agent_id: String,
    pub agent_type: AgentType,
    pub name: String,
    pub working_dir: PathBuf,
    pub system_prompt: String,
    pub mcp_servers: Vec<String>,
    /// The CLI's own transcript for this session, loaded on resume.
    pub session_file: Option<PathBuf>,
    pub cli_command: String,
    /// When set, used verbatim instead of the computed argument vector.
    /// Embedders and tests use this to substitute a scripted subprocess.
    pub cli_args_override: Option<Vec<String>>,
    pub envs: HashMap<String, String>,
}

impl AgentConfig {
    /// Resolve a config for `agent_type`, validating user definitions.
    pub fn resolve(
        agent_id: impl Into<String>,
        agent_type: AgentType,
        name: impl Into<String>,
        working_dir: PathBuf,
        definitions: &[AgentDefinition],
    ) -> Result<Self> {
        let system_prompt = agent_type.system_prompt(definitions)?;
        let mcp_servers = agent_type.mcp_server_names(definitions)?;
        Ok(Self {
            agent_id: agent_id.into(),
            agent_type,
            name: name.into(),
            working_dir,
            system_prompt,
            mcp_servers,
            session_file: None,
            cli_command: DEFAULT_CLI_COMMAND.to_string(),
            cli_args_override: None,
            envs: HashMap::new(),
        })
    }

    /// The argument vector for the subprocess launch.
    pub fn build_argv(&self) -> Vec<String> {
        if let Some(args) = &self.cli_args_override {
            return args.clone();
        }
        let mcp_config = serde_json::json!({
            "mcpServers": self
                .mcp_servers
                .iter()
                .map(|name| (name.clone(), serde_json::json!({"type": "sdk"})))
                .collect::<serde_json::Map<String, serde_json::Value>>()
        });
        vec![
            "--print".to_string(),
            "--input-format".to_string(),
            "stream-json".to_string(),
            "--output-format".to_string(),
            "stream-json".to_string(),
            "--verbose".to_string(),
            "--session-id".to_string(),
            self.agent_id.clone(),
            "--append-system-prompt".to_string(),
            self.system_prompt.clone(),
            "--mcp-config".to_string(),
            mcp_config.to_string(),
        ]
    }
}
