//! Dependency-injection scope
//!
//! Resolves the config root and the working directory so the terminal and
//! API surfaces can bind different policies. The interactive scope roots
//! at `~/.vide` and falls back to the process working directory; the API
//! scope roots at `~/.vide/api` and requires an explicit directory for
//! every network.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use crate::error::{Error, Result};

/// Resolves the working directory for a network when none was given.
pub trait WorkingDirProvider: Send + Sync {
    fn resolve(&self) -> Result<PathBuf>;
}

/// Terminal surface policy: the process working directory.
pub struct ProcessCwd;

impl WorkingDirProvider for ProcessCwd {
    fn resolve(&self) -> Result<PathBuf> {
        std::env::current_dir().map_err(|e| Error::Config(format!("cannot resolve cwd: {}", e)))
    }
}

/// A fixed directory, for embedding and tests.
pub struct FixedDir(pub PathBuf);

impl WorkingDirProvider for FixedDir {
    fn resolve(&self) -> Result<PathBuf> {
        Ok(self.0.clone())
    }
}

/// API surface policy: there is no ambient directory; callers must pass
/// one explicitly.
pub struct ExplicitDirRequired;

impl WorkingDirProvider for ExplicitDirRequired {
    fn resolve(&self) -> Result<PathBuf> {
        Err(Error::Config(
            "a working directory must be provided explicitly".to_string(),
        ))
    }
}

/// The resolved scope threaded through the runtime.
#[derive(Clone)]
pub struct RuntimeScope {
    config_root: PathBuf,
    working_dir: Arc<dyn WorkingDirProvider>,
}

impl RuntimeScope {
    pub fn new(config_root: PathBuf, working_dir: Arc<dyn WorkingDirProvider>) -> Self {
        Self {
            config_root,
            working_dir,
        }
    }

    /// Interactive (terminal) scope: `~/.vide`, process cwd fallback.
    pub fn interactive() -> Result<Self> {
        Ok(Self::new(default_config_root()?, Arc::new(ProcessCwd)))
    }

    /// API scope: `~/.vide/api`, explicit working directory required.
    /// The separate root gives the two surfaces total isolation.
    pub fn api() -> Result<Self> {
        Ok(Self::new(
            default_config_root()?.join("api"),
            Arc::new(ExplicitDirRequired),
        ))
    }

    pub fn config_root(&self) -> &Path {
        &self.config_root
    }

    /// Resolve the working directory via the bound provider.
    pub fn resolve_working_dir(&self) -> Result<PathBuf> {
        self.working_dir.resolve()
    }

    pub fn project_dir(&self, project_path: &Path) -> PathBuf {
        self.config_root
            .join("projects")
            .join(encode_project_path(project_path))
    }

    pub fn networks_dir(&self, project_path: &Path) -> PathBuf {
        self.project_dir(project_path).join("networks")
    }

    pub fn memory_file(&self, project_path: &Path) -> PathBuf {
        self.project_dir(project_path).join("memory.json")
    }

    pub fn agents_dir(&self) -> PathBuf {
        self.config_root.join("agents")
    }

    pub fn first_run_file(&self) -> PathBuf {
        self.config_root.join("first_run")
    }

    /// The subprocess CLI's own transcript for a session, under its config
    /// root. Read on resume; never written by the core.
    pub fn cli_session_file(&self, project_path: &Path, session_id: &str) -> Option<PathBuf> {
        let home = dirs::home_dir()?;
        Some(
            home.join(".claude")
                .join("projects")
                .join(encode_project_path(project_path))
                .join(format!("{}.jsonl", session_id)),
        )
    }
}

/// Encode an absolute project path into one path component.
pub fn encode_project_path(path: &Path) -> String {
    let raw = path.to_string_lossy();
    raw.chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() {
                c
            } else {
                '-'
            }
        })
        .collect()
}

fn default_config_root() -> Result<PathBuf> {
    dirs::home_dir()
        .map(|home| home.join(".vide"))
        .ok_or_else(|| Error::Config("cannot resolve home directory".to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_encode_project_path() {
        assert_eq!(
            encode_project_path(Path::new("/home/dev/my_project")),
            "-home-dev-my-project"
        );
        assert_eq!(encode_project_path(Path::new("/a b/c.d")), "-a-b-c-d");
    }

    #[test]
    fn test_process_cwd_resolves() {
        assert!(ProcessCwd.resolve().is_ok());
    }

    #[test]
    fn test_explicit_required_fails() {
        let err = ExplicitDirRequired.resolve().unwrap_err();
        assert!(err.to_string().contains("explicitly"));
    }

    #[test]
    fn test_fixed_dir() {
        let provider = FixedDir(PathBuf::from("/work"));
        assert_eq!(provider.resolve().unwrap(), PathBuf::from("/work"));
    }

    #[test]
    fn test_scope_paths() {
        let scope = RuntimeScope::new(PathBuf::from("/cfg"), Arc::new(FixedDir("/w".into())));
        let project = Path::new("/home/dev/proj");
        assert_eq!(
            scope.networks_dir(project),
            PathBuf::from("/cfg/projects/-home-dev-proj/networks")
        );
        assert_eq!(
            scope.memory_file(project),
            PathBuf::from("/cfg/projects/-home-dev-proj/memory.json")
        );
        assert_eq!(scope.agents_dir(), PathBuf::from("/cfg/agents"));
        assert_eq!(scope.first_run_file(), PathBuf::from("/cfg/first_run"));
    }

    #[test]
    fn test_interactive_and_api_roots_are_isolated() {
        if dirs::home_dir().is_none() {
            return;
        }
        let interactive = RuntimeScope::interactive().unwrap();
        let api = RuntimeScope::api().unwrap();
        assert_ne!(interactive.config_root(), api.config_root());
        assert!(api.config_root().starts_with(interactive.config_root()));
        assert!(api.resolve_working_dir().is_err());
    }

    #[test]
    fn test_cli_session_file_shape() {
        let scope = RuntimeScope::new(PathBuf::from("/cfg"), Arc::new(ProcessCwd));
        if let Some(path) = scope.cli_session_file(Path::new("/home/dev/proj"), "agent-1") {
            let raw = path.to_string_lossy();
            assert!(raw.contains(".claude"));
            assert!(raw.ends_with("agent-1.jsonl"));
        }
    }
}
