//! Configuration loading and normalization (§6, §3a).
//!
//! Loading happens in three passes: read the YAML file and any
//! `include_path` fragments and merge them at the raw-value level
//! ([`crate::yaml::merge_yaml`]), deserialize the merged value into
//! [`RawConfig`] (mirrors the YAML shape, everything optional), then
//! normalize into [`Config`] (defaults merged in, legacy output
//! bootstrapped if absent). Only the normalized form is handed to the
//! wiring step that builds runtime objects.

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use agent_core::ConfigError;
use serde::Deserialize;
use serde_yaml::Value as YamlValue;

use crate::yaml::{merge_yaml, yaml_to_json};

fn default_false() -> bool {
    false
}

#[derive(Debug, Clone, Deserialize)]
#[serde(untagged)]
pub enum RouteYaml {
    One(String),
    Many(Vec<String>),
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct SshDefaults {
    pub ssh_username: Option<String>,
    pub ssh_port: Option<u16>,
    pub ssh_keyfile: Option<String>,
    pub ssh_key: Option<String>,
    pub ssh_keypass: Option<String>,
    pub ssh_password: Option<String>,
    pub ssh_knownhosts_file: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct RawSource {
    pub source: String,
    pub service: String,
    pub interval: Option<f64>,
    pub ttl: Option<f64>,
    pub tags: Option<String>,
    pub hostname: Option<String>,
    pub route: Option<RouteYaml>,
    #[serde(default = "default_false")]
    pub watchdog: bool,
    pub start_delay: Option<f64>,
    #[serde(default = "default_false")]
    pub sync: bool,
    #[serde(default = "default_false")]
    pub use_ssh: bool,
    #[serde(flatten)]
    pub ssh: SshDefaults,
    #[serde(default)]
    pub critical: HashMap<String, String>,
    #[serde(default)]
    pub warning: HashMap<String, String>,
    #[serde(flatten)]
    pub extra: serde_yaml::Mapping,
}

#[derive(Debug, Clone, Deserialize)]
pub struct RawOutput {
    pub output: String,
    pub name: Option<String>,
    pub max_size: Option<usize>,
    pub max_rate: Option<f64>,
    pub pressure: Option<i64>,
    pub interval: Option<f64>,
    #[serde(default = "default_false")]
    pub expire: bool,
    #[serde(default = "default_false")]
    pub allow_nan: bool,
    #[serde(flatten)]
    pub extra: serde_yaml::Mapping,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct RawConfig {
    pub interval: Option<f64>,
    pub ttl: Option<f64>,
    pub stagger: Option<f64>,
    pub hostname: Option<String>,
    pub server: Option<String>,
    pub port: Option<u16>,
    pub proto: Option<String>,
    pub sources: Option<Vec<RawSource>>,
    pub outputs: Option<Vec<RawOutput>>,
    pub include_path: Option<String>,
    #[serde(flatten)]
    pub ssh_defaults: SshDefaults,
    #[serde(default = "default_false")]
    pub debug: bool,
}

/// One normalized source descriptor, still carrying raw plug-in params
/// as `serde_json::Value`; `agent-core::SourceDescriptor`s and
/// `Evaluator`s are built from these during wiring.
#[derive(Debug, Clone)]
pub struct SourceConfig {
    pub kind: String,
    pub service: String,
    pub interval: f64,
    pub ttl: f64,
    pub tags: Vec<String>,
    pub hostname: String,
    pub route: RouteSpecConfig,
    pub watchdog: bool,
    pub start_delay: f64,
    pub sync: bool,
    pub use_ssh: bool,
    pub ssh: ResolvedSsh,
    pub critical: Vec<(String, String)>,
    pub warning: Vec<(String, String)>,
    pub params: serde_json::Value,
}

#[derive(Debug, Clone)]
pub enum RouteSpecConfig {
    Default,
    One(Option<String>),
    Many(Vec<Option<String>>),
}

#[derive(Debug, Clone, Default)]
pub struct ResolvedSsh {
    pub username: Option<String>,
    pub port: u16,
    pub keyfile: Option<String>,
    pub key: Option<String>,
    pub keypass: Option<String>,
    pub password: Option<String>,
    pub knownhosts_file: String,
}

/// One normalized output descriptor.
#[derive(Debug, Clone)]
pub struct OutputConfig {
    pub kind: String,
    pub name: Option<String>,
    pub max_size: usize,
    pub max_rate: Option<f64>,
    pub pressure: Option<i64>,
    pub interval: f64,
    pub expire: bool,
    pub allow_nan: bool,
    pub params: serde_json::Value,
}

/// Fully normalized configuration. No optional fields left undefaulted;
/// building runtime objects from this should never need a fallback.
#[derive(Debug, Clone)]
pub struct Config {
    pub interval: f64,
    pub ttl: f64,
    pub stagger: f64,
    pub hostname: String,
    pub debug: bool,
    pub sources: Vec<SourceConfig>,
    pub outputs: Vec<OutputConfig>,
    pub ssh_defaults: SshDefaults,
}

const DEFAULT_KNOWNHOSTS: &str = "/var/lib/monitoring-agent/known_hosts";

/// Reads the config file at `path`, merges any `include_path` YAML
/// fragments, and normalizes the result. Every failure here is a
/// `ConfigError` and is meant to be fatal at startup (§7).
pub fn load(path: &Path) -> Result<Config, ConfigError> {
    let text = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
        path: path.display().to_string(),
        source,
    })?;

    let mut merged: YamlValue = serde_yaml::from_str(&text).map_err(|e| ConfigError::Yaml(e.to_string()))?;

    if let YamlValue::Mapping(map) = &merged {
        if let Some(YamlValue::String(include_path)) = map.get("include_path") {
            let include_path = include_path.clone();
            merge_includes(&mut merged, &include_path)?;
        }
    }

    let raw: RawConfig = serde_yaml::from_value(merged).map_err(|e| ConfigError::Yaml(e.to_string()))?;
    normalize(raw)
}

fn merge_includes(merged: &mut YamlValue, include_path: &str) -> Result<(), ConfigError> {
    let dir = Path::new(include_path);
    if !dir.exists() {
        tracing::warn!(path = include_path, "include_path does not exist");
        return Ok(());
    }

    let mut entries: Vec<PathBuf> = std::fs::read_dir(dir)
        .map_err(|source| ConfigError::Io { path: include_path.to_string(), source })?
        .filter_map(|entry| entry.ok().map(|e| e.path()))
        .filter(|p| p.extension().map(|ext| ext == "yml" || ext == "yaml").unwrap_or(false))
        .collect();
    entries.sort();

    for fragment_path in entries {
        let text = std::fs::read_to_string(&fragment_path).map_err(|source| ConfigError::Io {
            path: fragment_path.display().to_string(),
            source,
        })?;
        let fragment: YamlValue = serde_yaml::from_str(&text).map_err(|e| ConfigError::Yaml(e.to_string()))?;
        merge_yaml(merged, fragment);
        tracing::info!(file = %fragment_path.display(), "loaded additional configuration");
    }

    Ok(())
}

fn normalize(raw: RawConfig) -> Result<Config, ConfigError> {
    let interval = raw.interval.unwrap_or(60.0);
    let ttl = raw.ttl.unwrap_or(60.0);
    let stagger = raw.stagger.unwrap_or(0.2);
    let hostname = raw.hostname.clone().unwrap_or_else(local_hostname);
    let debug = raw.debug;

    let outputs = normalize_outputs(&raw)?;
    let sources = raw
        .sources
        .unwrap_or_default()
        .into_iter()
        .map(|src| normalize_source(src, interval, ttl, &raw.ssh_defaults))
        .collect::<Result<Vec<_>, _>>()?;

    Ok(Config { interval, ttl, stagger, hostname, debug, sources, outputs, ssh_defaults: raw.ssh_defaults })
}

/// Legacy output bootstrap (§9): when no `outputs` key is present,
/// synthesize one from the top-level `server`/`port`/`proto` shortcut.
/// A config-normalization pass, not a runtime branch inside the router.
fn normalize_outputs(raw: &RawConfig) -> Result<Vec<OutputConfig>, ConfigError> {
    match &raw.outputs {
        Some(outputs) => outputs.iter().cloned().map(normalize_output).collect(),
        None => {
            let server = raw.server.clone().unwrap_or_else(|| "localhost".into());
            let port = raw.port.unwrap_or(5555);
            let proto = raw.proto.clone().unwrap_or_else(|| "tcp".into());
            let kind = if proto == "udp" { "riemann_udp" } else { "riemann_tcp" };

            Ok(vec![OutputConfig {
                kind: kind.into(),
                name: None,
                max_size: 250_000,
                max_rate: None,
                pressure: None,
                interval: 1.0,
                expire: false,
                allow_nan: false,
                params: serde_json::json!({ "server": server, "port": port }),
            }])
        }
    }
}

fn normalize_output(raw: RawOutput) -> Result<OutputConfig, ConfigError> {
    Ok(OutputConfig {
        kind: raw.output,
        name: raw.name,
        max_size: raw.max_size.unwrap_or(250_000),
        max_rate: raw.max_rate,
        pressure: raw.pressure,
        interval: raw.interval.unwrap_or(1.0),
        expire: raw.expire,
        allow_nan: raw.allow_nan,
        params: yaml_to_json(YamlValue::Mapping(raw.extra)),
    })
}

fn normalize_source(
    raw: RawSource,
    default_interval: f64,
    default_ttl: f64,
    ssh_defaults: &SshDefaults,
) -> Result<SourceConfig, ConfigError> {
    let tags = raw
        .tags
        .as_deref()
        .map(|s| s.split(',').map(str::trim).filter(|s| !s.is_empty()).map(String::from).collect())
        .unwrap_or_default();

    let route = match raw.route {
        None => RouteSpecConfig::Default,
        Some(RouteYaml::One(name)) => RouteSpecConfig::One(Some(name)),
        Some(RouteYaml::Many(names)) => RouteSpecConfig::Many(names.into_iter().map(Some).collect()),
    };

    let ssh = ResolvedSsh {
        username: raw.ssh.ssh_username.or_else(|| ssh_defaults.ssh_username.clone()),
        port: raw.ssh.ssh_port.or(ssh_defaults.ssh_port).unwrap_or(22),
        keyfile: raw.ssh.ssh_keyfile.or_else(|| ssh_defaults.ssh_keyfile.clone()),
        key: raw.ssh.ssh_key.or_else(|| ssh_defaults.ssh_key.clone()),
        keypass: raw.ssh.ssh_keypass.or_else(|| ssh_defaults.ssh_keypass.clone()),
        password: raw.ssh.ssh_password.or_else(|| ssh_defaults.ssh_password.clone()),
        knownhosts_file: raw
            .ssh
            .ssh_knownhosts_file
            .or_else(|| ssh_defaults.ssh_knownhosts_file.clone())
            .unwrap_or_else(|| DEFAULT_KNOWNHOSTS.to_string()),
    };

    Ok(SourceConfig {
        kind: raw.source,
        service: raw.service,
        interval: raw.interval.unwrap_or(default_interval),
        ttl: raw.ttl.unwrap_or(default_ttl),
        tags,
        hostname: raw.hostname.unwrap_or_default(),
        route,
        watchdog: raw.watchdog,
        start_delay: raw.start_delay.unwrap_or(0.0),
        sync: raw.sync,
        use_ssh: raw.use_ssh,
        ssh,
        critical: raw.critical.into_iter().collect(),
        warning: raw.warning.into_iter().collect(),
        params: yaml_to_json(YamlValue::Mapping(raw.extra)),
    })
}

fn local_hostname() -> String {
    hostname::get().ok().and_then(|s| s.into_string().ok()).unwrap_or_else(|| "localhost".into())
}

mod hostname {
    /// Thin wrapper so the rest of the module reads like it's calling a
    /// `hostname` crate, without adding one more dependency purely to
    /// shell out to `uname -n`'s moral equivalent.
    pub fn get() -> std::io::Result<std::ffi::OsString> {
        rustix_hostname()
    }

    #[cfg(unix)]
    fn rustix_hostname() -> std::io::Result<std::ffi::OsString> {
        let output = std::process::Command::new("hostname").output()?;
        let mut s = String::from_utf8_lossy(&output.stdout).trim().to_string();
        if s.is_empty() {
            s = "localhost".into();
        }
        Ok(std::ffi::OsString::from(s))
    }

    #[cfg(not(unix))]
    fn rustix_hostname() -> std::io::Result<std::ffi::OsString> {
        Ok(std::ffi::OsString::from("localhost"))
    }
}
