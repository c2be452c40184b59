//! Persisted network and agent models
//!
//! An [`AgentNetwork`] is a flat list of agent rows cooperating toward a
//! goal. Rows are appended on spawn and never reordered; termination
//! detaches the live client but keeps the row and its accounting.

use std::path::PathBuf;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::agent_config::AgentType;

/// What an agent is currently doing, as reported by itself or the manager.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum AgentStatus {
    Idle,
    Working,
    WaitingForAgent,
    WaitingForUser,
}

impl AgentStatus {
    pub fn parse(raw: &str) -> Option<Self> {
        match raw {
            "idle" => Some(Self::Idle),
            "working" => Some(Self::Working),
            "waitingForAgent" => Some(Self::WaitingForAgent),
            "waitingForUser" => Some(Self::WaitingForUser),
            _ => None,
        }
    }
}

/// One agent's persisted row in a network.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AgentMetadata {
    pub id: String,
    pub name: String,
    #[serde(rename = "type")]
    pub agent_type: AgentType,
    pub status: AgentStatus,
    pub created_at: DateTime<Utc>,
    #[serde(default)]
    pub total_input_tokens: u64,
    #[serde(default)]
    pub total_output_tokens: u64,
    #[serde(default)]
    pub total_cache_read_input_tokens: u64,
    #[serde(default)]
    pub total_cache_creation_input_tokens: u64,
    #[serde(default)]
    pub total_cost_usd: f64,
}

impl AgentMetadata {
    pub fn new(id: String, name: String, agent_type: AgentType) -> Self {
        Self {
            id,
            name,
            agent_type,
            status: AgentStatus::Idle,
            created_at: Utc::now(),
            total_input_tokens: 0,
            total_output_tokens: 0,
            total_cache_read_input_tokens: 0,
            total_cache_creation_input_tokens: 0,
            total_cost_usd: 0.0,
        }
    }
}

/// A persisted network of agents sharing a goal and working directory.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AgentNetwork {
    pub id: String,
    pub goal: String,
    pub agents: Vec<AgentMetadata>,
    pub created_at: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_active_at: Option<DateTime<Utc>>,
    /// Shared filesystem root for every agent; when absent, the
    /// working-directory provider decides per process.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub worktree_path: Option<PathBuf>,
}

impl AgentNetwork {
    pub fn new(id: String, goal: String, worktree_path: Option<PathBuf>) -> Self {
        Self {
            id,
            goal,
            agents: Vec::new(),
            created_at: Utc::now(),
            last_active_at: None,
            worktree_path,
        }
    }

    pub fn agent(&self, agent_id: &str) -> Option<&AgentMetadata> {
        self.agents.iter().find(|a| a.id == agent_id)
    }

    pub fn agent_mut(&mut self, agent_id: &str) -> Option<&mut AgentMetadata> {
        self.agents.iter_mut().find(|a| a.id == agent_id)
    }

    /// The main agent is always the first row.
    pub fn main_agent(&self) -> Option<&AgentMetadata> {
        self.agents.first()
    }

    pub fn touch(&mut self) {
        self.last_active_at = Some(Utc::now());
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_agent_status_parse() {
        assert_eq!(AgentStatus::parse("idle"), Some(AgentStatus::Idle));
        assert_eq!(AgentStatus::parse("working"), Some(AgentStatus::Working));
        assert_eq!(
            AgentStatus::parse("waitingForAgent"),
            Some(AgentStatus::WaitingForAgent)
        );
        assert_eq!(
            AgentStatus::parse("waitingForUser"),
            Some(AgentStatus::WaitingForUser)
        );
        assert_eq!(AgentStatus::parse("sleeping"), None);
    }

    #[test]
    fn test_network_json_round_trip() {
        let mut network = AgentNetwork::new(
            "net-1".into(),
            "fix the login flow".into(),
            Some(PathBuf::from("/work/project")),
        );
        network
            .agents
            .push(AgentMetadata::new("a1".into(), "main".into(), AgentType::Main));
        network.agents.push(AgentMetadata::new(
            "a2".into(),
            "collector".into(),
            AgentType::ContextCollection,
        ));
        network.agents[1].status = AgentStatus::Working;
        network.agents[1].total_input_tokens = 42;
        network.touch();

        let json = serde_json::to_string(&network).unwrap();
        let parsed: AgentNetwork = serde_json::from_str(&json).unwrap();
        assert_eq!(parsed, network);
    }

    #[test]
    fn test_network_serde_field_names() {
        let network = AgentNetwork::new("n".into(), "g".into(), Some(PathBuf::from("/w")));
        let json = serde_json::to_value(&network).unwrap();
        assert!(json.get("createdAt").is_some());
        assert!(json.get("worktreePath").is_some());
        assert!(json.get("lastActiveAt").is_none());
    }

    #[test]
    fn test_agent_metadata_type_field() {
        let metadata = AgentMetadata::new("a".into(), "helper".into(), AgentType::Planning);
        let json = serde_json::to_value(&metadata).unwrap();
        assert_eq!(json["type"], "planning");
        assert_eq!(json["status"], "idle");
    }

    #[test]
    fn test_main_agent_is_first_row() {
        let mut network = AgentNetwork::new("n".into(), "g".into(), None);
        assert!(network.main_agent().is_none());
        network
            .agents
            .push(AgentMetadata::new("m".into(), "main".into(), AgentType::Main));
        network.agents.push(AgentMetadata::new(
            "w".into(),
            "worker".into(),
            AgentType::Implementation,
        ));
        assert_eq!(network.main_agent().unwrap().id, "m");
    }

    #[test]
    fn test_agent_lookup() {
        let mut network = AgentNetwork::new("n".into(), "g".into(), None);
        network
            .agents
            .push(AgentMetadata::new("a1".into(), "x".into(), AgentType::Main));
        assert!(network.agent("a1").is_some());
        assert!(network.agent("a2").is_none());
        network.agent_mut("a1").unwrap().status = AgentStatus::Working;
        assert_eq!(network.agent("a1").unwrap().status, AgentStatus::Working);
    }
}
