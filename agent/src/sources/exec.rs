//! `exec` source (§4.2, §5): runs a configured command on each tick,
//! either as a local child process or — when the source descriptor
//! carries SSH credentials — over the pooled SSH channel. A zero exit
//! code maps to `ok`; non-zero maps to `critical`; a timed-out child is
//! killed and also reported as `critical`, per §5's cancellation rule.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use agent_core::{Event, SourceError};
use async_trait::async_trait;
use serde::Deserialize;
use tokio::io::AsyncReadExt;
use tokio::process::Command;

use crate::ssh::{SshPool, SshTarget};

fn default_timeout() -> f64 {
    30.0
}

#[derive(Debug, Deserialize)]
struct ExecParams {
    cmd: String,
    #[serde(default)]
    args: Vec<String>,
    #[serde(default)]
    env: HashMap<String, String>,
    #[serde(default = "default_timeout")]
    timeout: f64,
    host: Option<String>,
    #[serde(rename = "_ssh")]
    ssh: Option<SshParams>,
}

#[derive(Debug, Deserialize)]
struct SshParams {
    username: Option<String>,
    #[serde(default = "default_ssh_port")]
    port: u16,
    keyfile: Option<String>,
    key: Option<String>,
    keypass: Option<String>,
    password: Option<String>,
    knownhosts_file: String,
}

fn default_ssh_port() -> u16 {
    22
}

pub struct ExecSource {
    service: String,
    params: ExecParams,
    ssh_pool: Arc<SshPool>,
}

impl ExecSource {
    pub fn new(service: String, params: &serde_json::Value, ssh_pool: Arc<SshPool>) -> Result<Self, String> {
        let params: ExecParams = serde_json::from_value(params.clone()).map_err(|e| format!("exec: invalid params: {e}"))?;
        if params.ssh.is_some() && params.host.is_none() {
            return Err("exec: use_ssh requires a `host` param".into());
        }
        Ok(ExecSource { service, params, ssh_pool })
    }
}

#[async_trait]
impl agent_core::Source for ExecSource {
    /// A check timeout or exec failure is a `SourceError`, but per §7
    /// the source itself is responsible for surfacing that as a
    /// `critical`-state event rather than letting the generic tick
    /// exception handling swallow it as "no event this tick".
    async fn tick(&self) -> Result<Vec<Event>, SourceError> {
        let timeout = Duration::from_secs_f64(self.params.timeout);

        let result = if let Some(ssh) = &self.params.ssh {
            let target = SshTarget {
                host: self.params.host.clone().expect("validated in new()"),
                port: ssh.port,
                username: ssh.username.clone().unwrap_or_else(whoami_fallback),
                password: ssh.password.clone(),
                key: ssh.key.clone(),
                keyfile: ssh.keyfile.clone(),
                keypass: ssh.keypass.clone(),
                known_hosts_path: PathBuf::from(&ssh.knownhosts_file),
            };
            self.ssh_pool
                .fork(&target, &self.params.cmd, &self.params.args, &self.params.env, timeout)
                .await
                .map_err(SourceError::Failed)
        } else {
            run_local(&self.params.cmd, &self.params.args, &self.params.env, timeout).await
        };

        let (state, description) = match result {
            Ok((stdout, _stderr, 0)) => ("ok", stdout),
            Ok((stdout, stderr, code)) => ("critical", format!("exit {code}: {stderr}{stdout}")),
            Err(SourceError::Timeout(d)) => ("critical", format!("check timed out after {d:?}")),
            Err(SourceError::Failed(msg)) => ("critical", msg),
        };

        let mut event = Event::metric(self.service.clone(), "", 0.0).with_description(description);
        event.metric = None;
        event.state = state.into();
        Ok(vec![event])
    }
}

fn whoami_fallback() -> String {
    std::env::var("USER").unwrap_or_else(|_| "root".into())
}

async fn run_local(
    cmd: &str,
    args: &[String],
    env: &HashMap<String, String>,
    timeout: Duration,
) -> Result<(String, String, i32), SourceError> {
    let mut child = Command::new(cmd)
        .args(args)
        .envs(env)
        .kill_on_drop(true)
        .stdout(std::process::Stdio::piped())
        .stderr(std::process::Stdio::piped())
        .spawn()
        .map_err(|e| SourceError::Failed(format!("could not spawn {cmd:?}: {e}")))?;

    let mut stdout_pipe = child.stdout.take().expect("stdout piped");
    let mut stderr_pipe = child.stderr.take().expect("stderr piped");
    let stdout_task = tokio::spawn(async move {
        let mut buf = Vec::new();
        let _ = stdout_pipe.read_to_end(&mut buf).await;
        buf
    });
    let stderr_task = tokio::spawn(async move {
        let mut buf = Vec::new();
        let _ = stderr_pipe.read_to_end(&mut buf).await;
        buf
    });

    match tokio::time::timeout(timeout, child.wait()).await {
        Ok(Ok(status)) => {
            let stdout = stdout_task.await.unwrap_or_default();
            let stderr = stderr_task.await.unwrap_or_default();
            Ok((
                String::from_utf8_lossy(&stdout).into_owned(),
                String::from_utf8_lossy(&stderr).into_owned(),
                status.code().unwrap_or(-1),
            ))
        }
        Ok(Err(err)) => Err(SourceError::Failed(format!("{cmd}: {err}"))),
        Err(_) => {
            let _ = child.kill().await;
            Err(SourceError::Timeout(timeout))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn local_success_maps_to_ok() {
        let (stdout, _stderr, code) = run_local("true", &[], &HashMap::new(), Duration::from_secs(5)).await.unwrap();
        assert_eq!(code, 0);
        assert_eq!(stdout, "");
    }

    #[tokio::test]
    async fn local_failure_maps_to_nonzero_exit() {
        let (_stdout, _stderr, code) = run_local("false", &[], &HashMap::new(), Duration::from_secs(5)).await.unwrap();
        assert_eq!(code, 1);
    }

    #[tokio::test]
    async fn timeout_kills_and_errors() {
        let err = run_local("sleep", &["5".into()], &HashMap::new(), Duration::from_millis(50))
            .await
            .unwrap_err();
        assert!(matches!(err, SourceError::Timeout(_)));
    }

    #[tokio::test]
    async fn tick_converts_timeout_to_a_critical_event() {
        use agent_core::Source as _;

        let params = serde_json::json!({
            "cmd": "sleep",
            "args": ["5"],
            "timeout": 0.05,
        });
        let source = ExecSource::new("svc".into(), &params, Arc::new(SshPool::new())).unwrap();
        let events = source.tick().await.unwrap();
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].state, "critical");
        assert!(events[0].description.contains("timed out"));
    }

    #[tokio::test]
    async fn tick_maps_nonzero_exit_to_critical() {
        use agent_core::Source as _;

        let params = serde_json::json!({ "cmd": "false" });
        let source = ExecSource::new("svc".into(), &params, Arc::new(SshPool::new())).unwrap();
        let events = source.tick().await.unwrap();
        assert_eq!(events[0].state, "critical");
    }

    #[test]
    fn ssh_without_host_is_rejected() {
        let params = serde_json::json!({
            "cmd": "uptime",
            "_ssh": { "knownhosts_file": "/tmp/kh" },
        });
        let err = ExecSource::new("svc".into(), &params, Arc::new(SshPool::new())).unwrap_err();
        assert!(err.contains("host"));
    }
}
