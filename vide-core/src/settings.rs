//! Project settings file
//!
//! The per-project `.claude/settings.local.json` holds the permission
//! allow-list and the pre-tool-use hook entries. Unknown fields written by
//! other tooling are preserved across load/save. All writes are atomic.

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use tokio::sync::Mutex;

use crate::error::{Error, Result};
use crate::persistence::atomic_write_json;

/// Matcher for the tools our pre-tool-use hook intercepts.
pub const HOOK_MATCHER: &str = "Write|Edit|Bash|MultiEdit|WebFetch|WebSearch|Read|mcp__.*";

const HOOK_TIMEOUT_SECS: u64 = 60;

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct ProjectSettings {
    pub permissions: PermissionSettings,
    pub hooks: HookSettings,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct PermissionSettings {
    pub allow: Vec<String>,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct HookSettings {
    #[serde(rename = "preToolUse")]
    pub pre_tool_use: Vec<HookMatcher>,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HookMatcher {
    pub matcher: String,
    pub hooks: Vec<HookCommand>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HookCommand {
    #[serde(rename = "type")]
    pub kind: String,
    pub command: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub timeout: Option<u64>,
}

impl HookMatcher {
    /// Whether this entry is the one we installed. Recognition is by the
    /// `--hook` flag in the command string.
    pub fn is_our_hook(&self) -> bool {
        self.hooks.iter().any(|h| h.command.contains("--hook"))
    }
}

/// Store for one project's settings file, serializing writes.
pub struct SettingsStore {
    path: PathBuf,
    lock: Mutex<()>,
}

impl SettingsStore {
    /// Store rooted at `<project_root>/.claude/settings.local.json`.
    pub fn for_project(project_root: &Path) -> Self {
        Self {
            path: project_root.join(".claude").join("settings.local.json"),
            lock: Mutex::new(()),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Load the settings; a missing file yields the default.
    pub async fn load(&self) -> Result<ProjectSettings> {
        match tokio::fs::read_to_string(&self.path).await {
            Ok(contents) if contents.trim().is_empty() => Ok(ProjectSettings::default()),
            Ok(contents) => serde_json::from_str(&contents)
                .map_err(|e| Error::Persistence(format!("invalid settings file: {}", e))),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(ProjectSettings::default()),
            Err(e) => Err(Error::Persistence(e.to_string())),
        }
    }

    pub async fn save(&self, settings: &ProjectSettings) -> Result<()> {
        let _guard = self.lock.lock().await;
        atomic_write_json(&self.path, settings).await
    }

    /// Append a pattern to the durable allow-list, deduplicating.
    pub async fn add_allow_pattern(&self, pattern: &str) -> Result<()> {
        let _guard = self.lock.lock().await;
        let mut settings = self.load().await?;
        if !settings.permissions.allow.iter().any(|p| p == pattern) {
            settings.permissions.allow.push(pattern.to_string());
            atomic_write_json(&self.path, &settings).await?;
        }
        Ok(())
    }

    /// Install or update our pre-tool-use hook entry.
    ///
    /// An existing entry recognized as ours is replaced in place; foreign
    /// entries are left untouched.
    pub async fn install_hook(&self, hook_command: &str) -> Result<()> {
        let _guard = self.lock.lock().await;
        let mut settings = self.load().await?;
        let entry = HookMatcher {
            matcher: HOOK_MATCHER.to_string(),
            hooks: vec![HookCommand {
                kind: "command".to_string(),
                command: hook_command.to_string(),
                timeout: Some(HOOK_TIMEOUT_SECS),
            }],
        };

        match settings
            .hooks
            .pre_tool_use
            .iter_mut()
            .find(|m| m.is_our_hook())
        {
            Some(existing) => *existing = entry,
            None => settings.hooks.pre_tool_use.push(entry),
        }
        atomic_write_json(&self.path, &settings).await
    }
}
