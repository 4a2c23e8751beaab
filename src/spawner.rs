//! Process spawner that runs the configured agent command.

use crate::config::Config;
use crate::core::agent::ProcessHandle;
use crate::error::{Error, Result};
use crate::ports::{ProcessRequest, ProcessSpawner, ENV_RESUME_SESSION};
use async_trait::async_trait;
use std::collections::HashMap;
use std::path::PathBuf;
use std::process::Stdio;
use tokio::process::{Child, Command};
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

/// Starts each agent as `<command> <args...> <prompt>`.
pub struct CommandSpawner {
    base_command: Vec<String>,
    children: Mutex<HashMap<String, Child>>,
}

impl CommandSpawner {
    /// Split a shell-style command line on whitespace.
    pub fn new(command: &str) -> Self {
        Self {
            base_command: command.split_whitespace().map(String::from).collect(),
            children: Mutex::new(HashMap::new()),
        }
    }

    pub fn from_config(config: &Config) -> Self {
        Self::new(config.effective_command())
    }

    pub fn binary(&self) -> &str {
        self.base_command
            .first()
            .map(|s| s.as_str())
            .unwrap_or("claude")
    }

    pub fn is_available(&self) -> bool {
        which::which(self.binary()).is_ok()
    }

    /// Full argument vector for a prompt, binary first.
    pub fn command(&self, prompt: &str) -> Vec<String> {
        let mut cmd = self.base_command.clone();
        cmd.push(prompt.to_string());
        cmd
    }

    /// Number of tracked children still running.
    pub async fn running(&self) -> usize {
        let mut children = self.children.lock().await;
        children.retain(|_, child| matches!(child.try_wait(), Ok(None)));
        children.len()
    }

    fn resolve_binary(&self) -> Result<PathBuf> {
        which::which(self.binary())
            .map_err(|e| Error::SpawnFailed(format!("{}: {}", self.binary(), e)))
    }
}

impl Default for CommandSpawner {
    fn default() -> Self {
        Self::from_config(&Config::default())
    }
}

#[async_trait]
impl ProcessSpawner for CommandSpawner {
    async fn spawn(&self, request: ProcessRequest) -> Result<ProcessHandle> {
        let binary = self.resolve_binary()?;
        debug!(
            agent = %request.agent_id.short(),
            binary = %binary.display(),
            cwd = %request.working_dir.display(),
            "spawning agent process"
        );

        let child = Command::new(&binary)
            .args(self.base_command.iter().skip(1))
            .arg(&request.prompt)
            .envs(request.env.iter().map(|(k, v)| (k.as_str(), v.as_str())))
            .current_dir(&request.working_dir)
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .spawn()
            .map_err(|e| Error::SpawnFailed(format!("{}: {}", binary.display(), e)))?;

        let handle = match child.id() {
            Some(pid) => pid.to_string(),
            None => return Err(Error::SpawnFailed("process exited immediately".into())),
        };
        info!(agent = %request.agent_id.short(), pid = %handle, role = %request.role, "agent process started");

        self.children.lock().await.insert(handle.clone(), child);
        Ok(ProcessHandle {
            handle,
            session_id: request.env_value(ENV_RESUME_SESSION).map(String::from),
        })
    }

    async fn kill(&self, handle: &ProcessHandle) -> Result<()> {
        let child = self.children.lock().await.remove(&handle.handle);
        match child {
            Some(mut child) => {
                if let Ok(Some(status)) = child.try_wait() {
                    debug!(pid = %handle.handle, %status, "process already exited");
                    return Ok(());
                }
                child.kill().await?;
                debug!(pid = %handle.handle, "process killed");
                Ok(())
            }
            None => {
                warn!(pid = %handle.handle, "kill requested for unknown process");
                Ok(())
            }
        }
    }
}
