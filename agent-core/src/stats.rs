//! Self-metrics (§4.7): a snapshot of the agent's own source and output
//! runtime counters, exposed as ordinary events so the `self_metrics`
//! source can route them like anything else it collects.

use std::sync::{Arc, Mutex};

use crate::event::Event;
use crate::output::OutputRuntime;
use crate::source::SourceState;

struct SourceStat {
    name: String,
    state: Arc<SourceState>,
}

struct OutputStat {
    name: String,
    runtime: Arc<OutputRuntime>,
}

/// Registered once per configured source/output during wiring, then
/// shared by `Arc` with every component that needs to publish or read
/// counters — including the self-metrics source, which may be
/// registered (and construct its own closure capturing this `Stats`)
/// before every other entry is in place. Registration therefore goes
/// through an internal lock rather than requiring unique ownership.
#[derive(Default)]
pub struct Stats {
    sources: Mutex<Vec<SourceStat>>,
    outputs: Mutex<Vec<OutputStat>>,
}

impl Stats {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register_source(&self, name: impl Into<String>, state: Arc<SourceState>) {
        self.sources.lock().unwrap().push(SourceStat { name: name.into(), state });
    }

    pub fn register_output(&self, name: impl Into<String>, runtime: Arc<OutputRuntime>) {
        self.outputs.lock().unwrap().push(OutputStat { name: name.into(), runtime });
    }

    /// Produces one metric event per counter, named `agent.<kind>.<name>.<counter>`.
    pub async fn snapshot(&self, hostname: &str) -> Vec<Event> {
        let sources: Vec<(String, Arc<SourceState>)> = {
            let guard = self.sources.lock().unwrap();
            guard.iter().map(|s| (s.name.clone(), s.state.clone())).collect()
        };
        let outputs: Vec<(String, Arc<OutputRuntime>)> = {
            let guard = self.outputs.lock().unwrap();
            guard.iter().map(|o| (o.name.clone(), o.runtime.clone())).collect()
        };

        let mut out = Vec::with_capacity(sources.len() + outputs.len() * 3);

        for (name, state) in &sources {
            out.push(metric(format!("agent.sources.{name}.events_emitted"), hostname, state.events_emitted() as f64));
        }

        for (name, runtime) in &outputs {
            out.push(metric(format!("agent.outputs.{name}.queue_len"), hostname, runtime.queue_len().await as f64));
            out.push(metric(format!("agent.outputs.{name}.dropped"), hostname, runtime.dropped().await as f64));
            out.push(metric(format!("agent.outputs.{name}.sent"), hostname, runtime.sent() as f64));
        }

        out
    }
}

fn metric(service: String, host: &str, value: f64) -> Event {
    Event::metric(service, host, value).with_ttl(120.0)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::output::OutputSettings;
    use crate::source::{RouteSpec, SourceDescriptor};
    use crate::threshold::Evaluator;
    use crate::transport::NullTransport;
    use async_trait::async_trait;

    struct Noop;
    #[async_trait]
    impl crate::source::Source for Noop {
        async fn tick(&self) -> Result<Vec<Event>, crate::error::SourceError> {
            Ok(vec![])
        }
    }

    fn descriptor() -> SourceDescriptor {
        SourceDescriptor {
            kind: "noop".into(),
            service: "svc".into(),
            interval: 1.0,
            ttl: 60.0,
            tags: vec![],
            hostname: "localhost".into(),
            route: RouteSpec::Default,
            watchdog: false,
            start_delay: 0.0,
            sync: false,
            params: serde_json::Value::Null,
        }
    }

    #[tokio::test]
    async fn snapshot_includes_registered_counters() {
        let stats = Stats::new();
        let runtime = crate::source::SourceRuntime::new(
            descriptor(),
            Evaluator::new(),
            std::sync::Arc::new(|_d| Ok(Box::new(Noop) as Box<dyn crate::source::Source>)),
        )
        .unwrap();
        stats.register_source("noop", runtime.state().clone());

        let output = Arc::new(OutputRuntime::new(OutputSettings::default(), Arc::new(NullTransport::default())));
        stats.register_output("riemann", output);

        let events = stats.snapshot("localhost").await;
        assert_eq!(events.len(), 4);
        assert!(events.iter().any(|e| e.service == "agent.sources.noop.events_emitted"));
    }

    #[tokio::test]
    async fn registration_works_through_a_shared_arc() {
        let stats = Arc::new(Stats::new());
        let clone_for_closure = stats.clone();

        let runtime = crate::source::SourceRuntime::new(
            descriptor(),
            Evaluator::new(),
            std::sync::Arc::new(|_d| Ok(Box::new(Noop) as Box<dyn crate::source::Source>)),
        )
        .unwrap();
        // Registration happens after a clone already exists elsewhere,
        // the scenario that motivated moving to interior mutability.
        clone_for_closure.register_source("noop", runtime.state().clone());

        let events = stats.snapshot("localhost").await;
        assert_eq!(events.len(), 1);
    }
}
