//! SSH remote execution channel (§4.2, §5).
//!
//! Connections are pooled by the 6-tuple `(host, user, port,
//! password-hash, key-hash, keyfile-hash)` so that many sources
//! targeting the same host share one multiplexed transport. Unknown
//! host keys are learned-on-first-use and persisted to an OpenSSH-
//! format `known_hosts` file.

use std::collections::HashMap;
use std::collections::hash_map::DefaultHasher;
use std::hash::{Hash, Hasher};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use russh::client::{self, Handle};
use russh::{ChannelMsg, Disconnect};
use russh_keys::key::{KeyPair, PublicKey};
use tokio::sync::Mutex;
use tracing::{info, warn};

#[derive(Debug, Clone)]
pub struct SshTarget {
    pub host: String,
    pub port: u16,
    pub username: String,
    pub password: Option<String>,
    pub key: Option<String>,
    pub keyfile: Option<String>,
    pub keypass: Option<String>,
    pub known_hosts_path: PathBuf,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
struct PoolKey(u64);

fn hash_of(s: &str) -> u64 {
    let mut hasher = DefaultHasher::new();
    s.hash(&mut hasher);
    hasher.finish()
}

fn pool_key(target: &SshTarget) -> PoolKey {
    let mut hasher = DefaultHasher::new();
    target.host.hash(&mut hasher);
    target.username.hash(&mut hasher);
    target.port.hash(&mut hasher);
    target.password.as_deref().map(hash_of).unwrap_or(0).hash(&mut hasher);
    target.key.as_deref().map(hash_of).unwrap_or(0).hash(&mut hasher);
    target.keyfile.as_deref().map(hash_of).unwrap_or(0).hash(&mut hasher);
    PoolKey(hasher.finish())
}

struct KnownHosts {
    path: PathBuf,
    entries: Vec<(String, String)>,
}

impl KnownHosts {
    fn load(path: &Path) -> Self {
        let entries = std::fs::read_to_string(path)
            .ok()
            .map(|text| {
                text.lines()
                    .filter_map(|line| {
                        let mut parts = line.splitn(2, ' ');
                        let host = parts.next()?.to_string();
                        let key = parts.next()?.to_string();
                        Some((host, key))
                    })
                    .collect()
            })
            .unwrap_or_default();
        KnownHosts { path: path.to_path_buf(), entries }
    }

    fn has(&self, host: &str, fingerprint: &str) -> bool {
        self.entries.iter().any(|(h, k)| h == host && k == fingerprint)
    }

    fn learn(&mut self, host: &str, fingerprint: &str) {
        self.entries.push((host.to_string(), fingerprint.to_string()));
        if let Some(parent) = self.path.parent() {
            let _ = std::fs::create_dir_all(parent);
        }
        let contents: String =
            self.entries.iter().map(|(h, k)| format!("{h} {k}\n")).collect();
        if let Err(err) = std::fs::write(&self.path, contents) {
            warn!(error = %err, path = %self.path.display(), "failed to persist known_hosts");
        }
    }
}

struct TrustOnFirstUse {
    known_hosts: Arc<Mutex<KnownHosts>>,
    host_label: String,
}

#[async_trait]
impl client::Handler for TrustOnFirstUse {
    type Error = russh::Error;

    async fn check_server_key(&mut self, server_public_key: &PublicKey) -> Result<bool, Self::Error> {
        let fingerprint = server_public_key.fingerprint();
        let mut known_hosts = self.known_hosts.lock().await;
        if known_hosts.has(&self.host_label, &fingerprint) {
            return Ok(true);
        }
        info!(host = %self.host_label, %fingerprint, "learning new SSH host key");
        known_hosts.learn(&self.host_label, &fingerprint);
        Ok(true)
    }
}

struct PooledConnection {
    handle: Handle<TrustOnFirstUse>,
}

/// Process-wide SSH connection pool, shared by every source configured
/// with `use_ssh: true` (§5, "treat as process-wide state with
/// init-time registration and teardown on shutdown").
#[derive(Default)]
pub struct SshPool {
    connections: Mutex<HashMap<PoolKey, Arc<Mutex<Option<PooledConnection>>>>>,
}

impl SshPool {
    pub fn new() -> Self {
        Self::default()
    }

    async fn slot(&self, key: PoolKey) -> Arc<Mutex<Option<PooledConnection>>> {
        self.connections.lock().await.entry(key).or_default().clone()
    }

    async fn connect(&self, target: &SshTarget) -> Result<Handle<TrustOnFirstUse>, String> {
        let known_hosts = Arc::new(Mutex::new(KnownHosts::load(&target.known_hosts_path)));
        let handler = TrustOnFirstUse { known_hosts, host_label: target.host.clone() };
        let config = Arc::new(client::Config::default());

        let mut handle = client::connect(config, (target.host.as_str(), target.port), handler)
            .await
            .map_err(|e| format!("ssh connect to {}:{} failed: {e}", target.host, target.port))?;

        let authenticated = if let Some(password) = &target.password {
            handle
                .authenticate_password(&target.username, password)
                .await
                .map_err(|e| format!("ssh password auth failed: {e}"))?
        } else if let Some(keyfile) = &target.keyfile {
            let key_pair = KeyPair::from_file_reader(
                &mut std::io::BufReader::new(std::fs::File::open(keyfile).map_err(|e| e.to_string())?),
                target.keypass.as_deref(),
            )
            .map_err(|e| format!("failed to load ssh keyfile {keyfile}: {e}"))?;
            handle
                .authenticate_publickey(&target.username, Arc::new(key_pair))
                .await
                .map_err(|e| format!("ssh public key auth failed: {e}"))?
        } else if let Some(key) = &target.key {
            let key_pair =
                russh_keys::decode_secret_key(key, target.keypass.as_deref()).map_err(|e| e.to_string())?;
            handle
                .authenticate_publickey(&target.username, Arc::new(key_pair))
                .await
                .map_err(|e| format!("ssh public key auth failed: {e}"))?
        } else {
            return Err("no ssh credentials configured (password, key, or keyfile required)".into());
        };

        if !authenticated {
            return Err(format!("ssh authentication to {} rejected", target.host));
        }

        Ok(handle)
    }

    /// Routes `cmd args...` over a (possibly freshly dialed) connection
    /// to `target`'s host, returning `(stdout, stderr, exit_code)` (§4.2).
    pub async fn fork(
        &self,
        target: &SshTarget,
        cmd: &str,
        args: &[String],
        env: &HashMap<String, String>,
        timeout: Duration,
    ) -> Result<(String, String, i32), String> {
        let key = pool_key(target);
        let slot = self.slot(key).await;
        let mut guard = slot.lock().await;

        if guard.is_none() {
            let handle = self.connect(target).await?;
            *guard = Some(PooledConnection { handle });
        }

        let command_line = render_command(cmd, args, env);
        let run = async {
            let handle = &guard.as_ref().unwrap().handle;
            let mut channel = handle
                .channel_open_session()
                .await
                .map_err(|e| format!("ssh channel open failed: {e}"))?;
            channel.exec(true, command_line.as_bytes()).await.map_err(|e| format!("ssh exec failed: {e}"))?;

            let mut stdout = Vec::new();
            let mut stderr = Vec::new();
            let mut code = 255;

            loop {
                match channel.wait().await {
                    Some(ChannelMsg::Data { data }) => stdout.extend_from_slice(&data),
                    Some(ChannelMsg::ExtendedData { data, ext: 1 }) => stderr.extend_from_slice(&data),
                    Some(ChannelMsg::ExitStatus { exit_status }) => code = exit_status as i32,
                    Some(ChannelMsg::Eof) | Some(ChannelMsg::Close) | None => break,
                    _ => {}
                }
            }

            Ok::<_, String>((String::from_utf8_lossy(&stdout).into_owned(), String::from_utf8_lossy(&stderr).into_owned(), code))
        };

        match tokio::time::timeout(timeout, run).await {
            Ok(Ok(result)) => Ok(result),
            Ok(Err(err)) => {
                // The connection is presumed broken; drop it so the next
                // fork dials a fresh one instead of reusing a dead handle.
                *guard = None;
                Err(err)
            }
            Err(_) => {
                *guard = None;
                Err(format!("ssh exec of {command_line:?} timed out after {timeout:?}"))
            }
        }
    }

    /// Closes every pooled connection (§5, teardown on shutdown).
    pub async fn shutdown(&self) {
        let mut connections = self.connections.lock().await;
        for slot in connections.values() {
            if let Some(conn) = slot.lock().await.take() {
                let _ = conn.handle.disconnect(Disconnect::ByApplication, "", "en").await;
            }
        }
        connections.clear();
    }
}

fn render_command(cmd: &str, args: &[String], env: &HashMap<String, String>) -> String {
    let mut out = String::new();
    for (k, v) in env {
        out.push_str(&format!("{k}={v} "));
    }
    out.push_str(cmd);
    for arg in args {
        out.push(' ');
        out.push_str(arg);
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    fn target() -> SshTarget {
        SshTarget {
            host: "h".into(),
            port: 22,
            username: "u".into(),
            password: Some("p".into()),
            key: None,
            keyfile: None,
            keypass: None,
            known_hosts_path: PathBuf::from("/tmp/does-not-matter"),
        }
    }

    #[test]
    fn pool_key_is_stable_for_identical_targets() {
        assert_eq!(pool_key(&target()).0, pool_key(&target()).0);
    }

    #[test]
    fn pool_key_differs_on_password() {
        let mut other = target();
        other.password = Some("different".into());
        assert_ne!(pool_key(&target()).0, pool_key(&other).0);
    }

    #[test]
    fn render_command_joins_env_and_args() {
        let mut env = HashMap::new();
        env.insert("FOO".to_string(), "bar".to_string());
        let s = render_command("echo", &["hi".into()], &env);
        assert!(s.starts_with("FOO=bar "));
        assert!(s.ends_with("echo hi"));
    }

    #[test]
    fn known_hosts_roundtrips_through_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("known_hosts");
        let mut kh = KnownHosts::load(&path);
        assert!(!kh.has("host", "fp"));
        kh.learn("host", "fp");

        let reloaded = KnownHosts::load(&path);
        assert!(reloaded.has("host", "fp"));
    }
}
