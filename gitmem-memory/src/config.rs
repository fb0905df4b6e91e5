//! Runtime configuration
//!
//! Built from defaults, then overridden by `GITMEM_*` environment variables.
//! Paths left unset are derived from the repository's git directory and the
//! XDG data directory when the service opens.

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::error::{MemoryError, Result};
use crate::lifecycle::LifecycleConfig;
use crate::lock::LockPolicy;
use crate::note::refs::validate_remote_name;

pub const ENV_INDEX_PATH: &str = "GITMEM_INDEX_PATH";
pub const ENV_USER_REPO: &str = "GITMEM_USER_REPO";
pub const ENV_REMOTE: &str = "GITMEM_REMOTE";
pub const ENV_LOCK_ATTEMPTS: &str = "GITMEM_LOCK_ATTEMPTS";
pub const ENV_CHUNK_SIZE: &str = "GITMEM_CHUNK_SIZE";
pub const ENV_DISABLE_USER: &str = "GITMEM_DISABLE_USER";

/// Index location relative to the git directory
const DEFAULT_INDEX_FILE: &str = "gitmem/index.db";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct MemoryConfig {
    /// Working tree of the project repository
    pub repo_path: PathBuf,
    /// SQLite index; `<git-dir>/gitmem/index.db` when unset
    pub index_path: Option<PathBuf>,
    /// Repository holding the user domain; created on first use
    pub user_repo: Option<PathBuf>,
    pub disable_user: bool,
    pub remote: String,
    /// Entries per chunk when verifying or rebuilding the index
    pub chunk_size: usize,
    pub search_limit: usize,
    pub lock: LockPolicy,
    pub lifecycle: LifecycleConfig,
}

impl Default for MemoryConfig {
    fn default() -> Self {
        Self {
            repo_path: PathBuf::from("."),
            index_path: None,
            user_repo: None,
            disable_user: false,
            remote: "origin".to_string(),
            chunk_size: 500,
            search_limit: 10,
            lock: LockPolicy::default(),
            lifecycle: LifecycleConfig::default(),
        }
    }
}

impl MemoryConfig {
    pub fn for_repo(repo_path: impl Into<PathBuf>) -> Self {
        Self {
            repo_path: repo_path.into(),
            ..Self::default()
        }
    }

    /// Defaults for `repo_path` with the process environment applied
    pub fn from_env(repo_path: impl Into<PathBuf>) -> Result<Self> {
        Self::for_repo(repo_path).apply_env(|key| std::env::var(key).ok())
    }

    /// Apply overrides from `lookup`; empty values count as unset
    pub fn apply_env<F>(mut self, lookup: F) -> Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let get = |key: &str| lookup(key).filter(|v| !v.trim().is_empty());

        if let Some(path) = get(ENV_INDEX_PATH) {
            self.index_path = Some(PathBuf::from(path));
        }
        if let Some(path) = get(ENV_USER_REPO) {
            self.user_repo = Some(PathBuf::from(path));
        }
        if let Some(remote) = get(ENV_REMOTE) {
            self.remote = remote.trim().to_string();
        }
        if let Some(attempts) = get(ENV_LOCK_ATTEMPTS) {
            self.lock.max_attempts = parse_number(ENV_LOCK_ATTEMPTS, &attempts)?;
        }
        if let Some(size) = get(ENV_CHUNK_SIZE) {
            self.chunk_size = parse_number(ENV_CHUNK_SIZE, &size)?;
        }
        if let Some(flag) = get(ENV_DISABLE_USER) {
            self.disable_user = parse_flag(ENV_DISABLE_USER, &flag)?;
        }

        if self.user_repo.is_none() {
            self.user_repo = data_home(&lookup).map(|dir| dir.join("gitmem").join("user"));
        }

        self.validate()?;
        Ok(self)
    }

    pub fn validate(&self) -> Result<()> {
        validate_remote_name(&self.remote)?;
        if self.chunk_size == 0 {
            return Err(MemoryError::validation("chunk size must be positive"));
        }
        if self.lock.max_attempts == 0 {
            return Err(MemoryError::validation("lock attempts must be positive"));
        }
        if self.lifecycle.half_life_days <= 0.0 {
            return Err(MemoryError::validation("half-life must be positive"));
        }
        Ok(())
    }

    /// Configured index path, else the default inside `git_dir`
    pub fn index_path_for(&self, git_dir: &Path) -> PathBuf {
        self.index_path
            .clone()
            .unwrap_or_else(|| git_dir.join(DEFAULT_INDEX_FILE))
    }

    /// User repository unless the user domain is disabled
    pub fn user_repo_path(&self) -> Option<&Path> {
        if self.disable_user {
            None
        } else {
            self.user_repo.as_deref()
        }
    }
}

/// `$XDG_DATA_HOME`, else `$HOME/.local/share`
fn data_home<F>(lookup: &F) -> Option<PathBuf>
where
    F: Fn(&str) -> Option<String>,
{
    let non_empty = |key: &str| lookup(key).filter(|v| !v.is_empty());
    non_empty("XDG_DATA_HOME")
        .map(PathBuf::from)
        .or_else(|| non_empty("HOME").map(|home| Path::new(&home).join(".local").join("share")))
}

fn parse_number<T: std::str::FromStr>(key: &str, value: &str) -> Result<T> {
    value
        .trim()
        .parse()
        .map_err(|_| MemoryError::validation(format!("{key}: expected a number, got {value:?}")))
}

fn parse_flag(key: &str, value: &str) -> Result<bool> {
    match value.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Ok(true),
        "0" | "false" | "no" | "off" => Ok(false),
        _ => Err(MemoryError::validation(format!(
            "{key}: expected a boolean, got {value:?}"
        ))),
    }
}
