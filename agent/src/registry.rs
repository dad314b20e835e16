//! Builds the compiled-in name -> constructor table (§9: "dynamic
//! plug-in loading by dotted string" replaced with a closed registry).

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use agent_core::transport::{DatagramConfig, DatagramTransport, HttpBulkConfig, HttpBulkTransport, StreamConfig, StreamTransport, TlsConfig};
use agent_core::{Registry, Source, SourceDescriptor, Stats, Transport};
use serde::Deserialize;

use crate::sources::exec::ExecSource;
use crate::sources::log_tail::LogTailSource;
use crate::sources::self_metrics::SelfMetricsSource;
use crate::ssh::SshPool;

pub fn build(stats: Arc<Stats>, ssh_pool: Arc<SshPool>, state_dir: PathBuf) -> Registry {
    let mut registry = Registry::new();

    {
        let stats = stats.clone();
        registry.register_source(
            "self_metrics",
            Arc::new(move |descriptor: &SourceDescriptor| {
                Ok(Box::new(SelfMetricsSource::new(stats.clone(), descriptor.hostname.clone())) as Box<dyn Source>)
            }),
        );
    }

    {
        let ssh_pool = ssh_pool.clone();
        registry.register_source(
            "exec",
            Arc::new(move |descriptor: &SourceDescriptor| {
                ExecSource::new(descriptor.service.clone(), &descriptor.params, ssh_pool.clone())
                    .map(|s| Box::new(s) as Box<dyn Source>)
            }),
        );
    }

    {
        let state_dir = state_dir.clone();
        registry.register_source(
            "log_tail",
            Arc::new(move |descriptor: &SourceDescriptor| {
                LogTailSource::new(descriptor.service.clone(), &state_dir, &descriptor.params)
                    .map(|s| Box::new(s) as Box<dyn Source>)
            }),
        );
    }

    registry.register_output("riemann_tcp", Arc::new(build_stream_output));
    registry.register_output("riemann_udp", Arc::new(build_datagram_output));
    registry.register_output("elasticsearch", Arc::new(build_elasticsearch_output));

    registry
}

#[derive(Debug, Deserialize)]
struct StreamParams {
    server: String,
    #[serde(default = "default_riemann_port")]
    port: u16,
    #[serde(default)]
    failover: bool,
    #[serde(default)]
    hosts: Vec<String>,
    #[serde(default)]
    tls: bool,
    cert: Option<String>,
    key: Option<String>,
}

fn default_riemann_port() -> u16 {
    5555
}

fn build_stream_output(params: &serde_json::Value) -> Result<Arc<dyn Transport>, String> {
    let params: StreamParams = serde_json::from_value(params.clone()).map_err(|e| format!("riemann_tcp: {e}"))?;

    let mut hosts: Vec<String> = params.hosts;
    if hosts.is_empty() {
        hosts.push(format!("{}:{}", params.server, params.port));
    }

    let tls = match (params.tls, params.cert, params.key) {
        (true, Some(cert_path), Some(key_path)) => Some(TlsConfig { cert_path, key_path }),
        (true, _, _) => return Err("riemann_tcp: tls requires both cert and key".into()),
        (false, _, _) => None,
    };

    Ok(Arc::new(StreamTransport::new(StreamConfig { hosts, failover: params.failover, tls, ..StreamConfig::default() })))
}

#[derive(Debug, Deserialize)]
struct DatagramParams {
    server: String,
    #[serde(default = "default_riemann_port")]
    port: u16,
}

fn build_datagram_output(params: &serde_json::Value) -> Result<Arc<dyn Transport>, String> {
    let params: DatagramParams = serde_json::from_value(params.clone()).map_err(|e| format!("riemann_udp: {e}"))?;
    Ok(Arc::new(DatagramTransport::new(DatagramConfig {
        target: format!("{}:{}", params.server, params.port),
        ..DatagramConfig::default()
    })))
}

#[derive(Debug, Deserialize)]
struct ElasticsearchParams {
    url: String,
    #[serde(default = "default_index_pattern")]
    index: String,
    user: Option<String>,
    password: Option<String>,
    #[serde(default = "default_es_timeout")]
    timeout: f64,
}

fn default_index_pattern() -> String {
    "logstash-%Y.%m.%d".into()
}

fn default_es_timeout() -> f64 {
    10.0
}

fn build_elasticsearch_output(params: &serde_json::Value) -> Result<Arc<dyn Transport>, String> {
    let params: ElasticsearchParams = serde_json::from_value(params.clone()).map_err(|e| format!("elasticsearch: {e}"))?;
    let basic_auth = match (params.user, params.password) {
        (Some(user), Some(password)) => Some((user, password)),
        _ => None,
    };

    Ok(Arc::new(HttpBulkTransport::new(HttpBulkConfig {
        endpoint: params.url,
        index_pattern: params.index,
        basic_auth,
        timeout: Duration::from_secs_f64(params.timeout),
    })))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn known_source_and_output_kinds_are_registered() {
        let registry = build(Stats::new().into(), Arc::new(SshPool::new()), PathBuf::from("/tmp"));
        let mut sources: Vec<&str> = registry.source_kinds().collect();
        sources.sort();
        assert_eq!(sources, vec!["exec", "log_tail", "self_metrics"]);

        let mut outputs: Vec<&str> = registry.output_kinds().collect();
        outputs.sort();
        assert_eq!(outputs, vec!["elasticsearch", "riemann_tcp", "riemann_udp"]);
    }

    #[test]
    fn stream_output_builds_default_single_host() {
        let registry = build(Stats::new().into(), Arc::new(SshPool::new()), PathBuf::from("/tmp"));
        let params = serde_json::json!({ "server": "riemann.example", "port": 5555 });
        assert!(registry.build_output("riemann_tcp", &params).is_ok());
    }

    #[test]
    fn stream_output_requires_cert_and_key_when_tls_enabled() {
        let registry = build(Stats::new().into(), Arc::new(SshPool::new()), PathBuf::from("/tmp"));
        let params = serde_json::json!({ "server": "riemann.example", "tls": true });
        assert!(registry.build_output("riemann_tcp", &params).is_err());
    }
}
