//! Git command execution wrapper.

use std::io::Write;
use std::path::{Path, PathBuf};
use std::process::{Child, Command, Output, Stdio};

use crate::error::{MemoryError, Result};

/// Identity used when the repository has no `user.email` configured
const FALLBACK_NAME: &str = "gitmem";
const FALLBACK_EMAIL: &str = "gitmem@localhost";

/// Message of the empty commit that roots a freshly created user store
pub const USER_STORE_INIT_MESSAGE: &str = "Initialize gitmem user memory store";

/// Wrapper for executing git commands.
#[derive(Debug, Clone)]
pub struct GitExecutor {
    repo_path: PathBuf,
    fallback_identity: bool,
}

impl GitExecutor {
    /// Create a new git executor for the given repository path.
    pub fn new(repo_path: &Path) -> Result<Self> {
        // Verify git is available
        let output = Command::new("git").arg("--version").output().map_err(|e| {
            MemoryError::repository(format!("git is not available: {e}"))
        })?;
        if !output.status.success() {
            return Err(MemoryError::repository("git is not available"));
        }

        // Verify path is a git repository
        let output = Command::new("git")
            .current_dir(repo_path)
            .args(["rev-parse", "--git-dir"])
            .output()?;
        if !output.status.success() {
            return Err(MemoryError::repository(format!(
                "not a git repository: {}",
                repo_path.display()
            )));
        }

        let mut executor = Self {
            repo_path: repo_path.to_path_buf(),
            fallback_identity: false,
        };
        let email = executor.output(&["config", "user.email"])?;
        executor.fallback_identity =
            !email.status.success() || String::from_utf8_lossy(&email.stdout).trim().is_empty();
        if executor.fallback_identity {
            log::debug!(
                "No user.email in {}; committing notes as {}",
                repo_path.display(),
                FALLBACK_EMAIL
            );
        }
        Ok(executor)
    }

    /// Open the repository at `path`, creating it with an empty root commit
    /// when it does not exist yet.
    pub fn open_or_init(path: &Path) -> Result<Self> {
        if path.join(".git").exists() {
            return Self::new(path);
        }

        std::fs::create_dir_all(path)?;
        let output = Command::new("git")
            .current_dir(path)
            .args(["init", "--quiet"])
            .output()?;
        if !output.status.success() {
            return Err(MemoryError::repository(format!(
                "git init failed in {}: {}",
                path.display(),
                String::from_utf8_lossy(&output.stderr).trim()
            )));
        }

        let executor = Self::new(path)?;
        executor.run(&[
            "commit",
            "--allow-empty",
            "--quiet",
            "-m",
            USER_STORE_INIT_MESSAGE,
        ])?;
        log::info!("Created memory repository at {}", path.display());
        Ok(executor)
    }

    pub fn repo_path(&self) -> &Path {
        &self.repo_path
    }

    /// Base command: repository directory, no terminal prompts, and the
    /// fallback identity when none is configured.
    pub fn command(&self) -> Command {
        let mut cmd = Command::new("git");
        cmd.current_dir(&self.repo_path);
        cmd.env("GIT_TERMINAL_PROMPT", "0");
        if self.fallback_identity {
            cmd.args([
                "-c",
                &format!("user.name={FALLBACK_NAME}"),
                "-c",
                &format!("user.email={FALLBACK_EMAIL}"),
            ]);
        }
        cmd
    }

    /// Run and return the raw output whatever the exit status
    pub fn output(&self, args: &[&str]) -> Result<Output> {
        Ok(self.command().args(args).output()?)
    }

    /// Run and return stdout; a non-zero exit is [`MemoryError::Git`]
    pub fn run(&self, args: &[&str]) -> Result<String> {
        let output = self.output(args)?;
        Self::check(args, output)
    }

    /// Like [`run`](Self::run), feeding `input` on stdin
    pub fn run_with_input(&self, args: &[&str], input: &str) -> Result<String> {
        let mut child = self.spawn_piped(args)?;
        if let Some(mut stdin) = child.stdin.take() {
            stdin.write_all(input.as_bytes())?;
        }
        let output = child.wait_with_output()?;
        Self::check(args, output)
    }

    /// Spawn with piped stdin/stdout/stderr
    pub fn spawn_piped(&self, args: &[&str]) -> Result<Child> {
        Ok(self
            .command()
            .args(args)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn()?)
    }

    fn check(args: &[&str], output: Output) -> Result<String> {
        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(MemoryError::git(format!(
                "git {}: {}",
                args.first().copied().unwrap_or_default(),
                stderr.trim()
            )));
        }
        Ok(String::from_utf8(output.stdout)?)
    }
}
