//! Turns a normalized [`crate::config::Config`] into a ready-to-start
//! [`agent_core::Supervisor`] (§4.7): resolve plug-in kinds against the
//! registry, compile thresholds, build descriptors and settings, wire
//! routing and self-metrics registration.

use std::path::PathBuf;
use std::sync::Arc;

use agent_core::{
    ConfigError, Evaluator, OutputRuntime, OutputSettings, Registry, Router, RouteSpec, SourceDescriptor,
    SourceRuntime, Stats, Supervisor,
};

use crate::config::{Config, OutputConfig, RouteSpecConfig, SourceConfig};

pub async fn build_supervisor(config: &Config, registry: &Registry, stats: Arc<Stats>) -> Result<Arc<Supervisor>, ConfigError> {
    let mut router = Router::new();

    for output_cfg in &config.outputs {
        let runtime = build_output(output_cfg, registry)?;
        runtime.connect().await;

        let route_name = output_cfg.name.clone();
        let stats_name = route_name.clone().unwrap_or_else(|| output_cfg.kind.clone());
        stats.register_output(stats_name, runtime.clone());
        router.register(route_name, runtime);
    }

    let supervisor = Arc::new(Supervisor::new(
        router,
        agent_core::EventCache::new(),
        stats.clone(),
        config.hostname.clone(),
    ));

    for (index, source_cfg) in config.sources.iter().enumerate() {
        let runtime = build_source(source_cfg, index, config, registry)?;
        stats.register_source(format!("{}.{}", source_cfg.kind, source_cfg.service), runtime.state().clone());
        supervisor
            .add_source(format!("{}.{}", source_cfg.kind, source_cfg.service), runtime)
            .await
            .map_err(ConfigError::Other)?;
    }

    Ok(supervisor)
}

fn build_output(cfg: &OutputConfig, registry: &Registry) -> Result<Arc<OutputRuntime>, ConfigError> {
    let transport = registry
        .build_output(&cfg.kind, &cfg.params)
        .map_err(|_| ConfigError::UnknownOutput(cfg.kind.clone()))?;

    let settings = OutputSettings {
        max_size: cfg.max_size,
        interval: cfg.interval,
        max_rate: cfg.max_rate,
        pressure_threshold: cfg.pressure,
        expire_when_unready: cfg.expire,
        allow_nan: cfg.allow_nan,
    };

    Ok(Arc::new(OutputRuntime::new(settings, transport)))
}

fn build_source(
    cfg: &SourceConfig,
    index: usize,
    config: &Config,
    registry: &Registry,
) -> Result<SourceRuntime, ConfigError> {
    let factory = registry.source_factory(&cfg.kind).map_err(|_| ConfigError::UnknownSource(cfg.kind.clone()))?;

    let evaluator = Evaluator::compile(&cfg.warning, &cfg.critical)?;

    let route = match &cfg.route {
        RouteSpecConfig::Default => RouteSpec::Default,
        RouteSpecConfig::One(name) => RouteSpec::One(name.clone()),
        RouteSpecConfig::Many(names) => RouteSpec::Many(names.clone()),
    };

    let start_delay = if cfg.start_delay > 0.0 { cfg.start_delay } else { index as f64 * config.stagger };

    let params = if cfg.use_ssh { inject_ssh(cfg.params.clone(), cfg) } else { cfg.params.clone() };

    let descriptor = SourceDescriptor {
        kind: cfg.kind.clone(),
        service: cfg.service.clone(),
        interval: cfg.interval,
        ttl: cfg.ttl,
        tags: cfg.tags.clone(),
        hostname: cfg.hostname.clone(),
        route,
        watchdog: cfg.watchdog,
        start_delay,
        sync: cfg.sync,
        params,
    };

    SourceRuntime::new(descriptor, evaluator, factory).map_err(ConfigError::Other)
}

fn inject_ssh(params: serde_json::Value, cfg: &SourceConfig) -> serde_json::Value {
    let ssh = serde_json::json!({
        "username": cfg.ssh.username,
        "port": cfg.ssh.port,
        "keyfile": cfg.ssh.keyfile,
        "key": cfg.ssh.key,
        "keypass": cfg.ssh.keypass,
        "password": cfg.ssh.password,
        "knownhosts_file": cfg.ssh.knownhosts_file,
    });

    let mut params = match params {
        serde_json::Value::Object(map) => map,
        _ => serde_json::Map::new(),
    };
    params.insert("_ssh".to_string(), ssh);
    serde_json::Value::Object(params)
}

pub fn default_state_dir() -> PathBuf {
    PathBuf::from("/var/lib/monitoring-agent")
}
