//! Source runtime (§4.2): per-source timer, staggered start, the
//! `sync` at-most-one-in-flight guard, and exception containment.

use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::task::JoinHandle;
use tracing::{debug, error, warn};

use crate::error::SourceError;
use crate::event::{now_secs, Event};
use crate::threshold::Evaluator;

/// One named route or a list of named routes; `None` names mean "the
/// default (unnamed) output set".
#[derive(Debug, Clone)]
pub enum RouteSpec {
    Default,
    One(Option<String>),
    Many(Vec<Option<String>>),
}

impl RouteSpec {
    pub fn names(&self) -> Vec<Option<String>> {
        match self {
            RouteSpec::Default => vec![None],
            RouteSpec::One(name) => vec![name.clone()],
            RouteSpec::Many(names) => names.clone(),
        }
    }
}

/// Frozen per-source configuration. The watchdog reconstructs a source
/// instance from this descriptor verbatim, so it must carry everything
/// the source's factory needs.
#[derive(Debug, Clone)]
pub struct SourceDescriptor {
    pub kind: String,
    pub service: String,
    pub interval: f64,
    pub ttl: f64,
    pub tags: Vec<String>,
    pub hostname: String,
    pub route: RouteSpec,
    pub watchdog: bool,
    pub start_delay: f64,
    pub sync: bool,
    pub params: serde_json::Value,
}

/// A plug-in's per-tick contract (§4.2). Implementations may perform
/// I/O; the runtime around them enforces staggering, the `sync` guard,
/// and exception containment.
#[async_trait]
pub trait Source: Send + Sync {
    async fn tick(&self) -> Result<Vec<Event>, SourceError>;
}

pub type SourceFactory =
    Arc<dyn Fn(&SourceDescriptor) -> Result<Box<dyn Source>, String> + Send + Sync>;

/// Shared, lock-free bookkeeping the watchdog reads without touching
/// the source's own task.
#[derive(Default)]
pub struct SourceState {
    last_event_time_bits: AtomicU64,
    events_emitted: AtomicU64,
    in_flight: AtomicBool,
}

impl SourceState {
    pub fn last_event_time(&self) -> f64 {
        f64::from_bits(self.last_event_time_bits.load(Ordering::Acquire))
    }

    fn record_tick(&self, n_events: usize) {
        self.last_event_time_bits
            .store(now_secs().to_bits(), Ordering::Release);
        self.events_emitted
            .fetch_add(n_events as u64, Ordering::Relaxed);
    }

    pub fn events_emitted(&self) -> u64 {
        self.events_emitted.load(Ordering::Relaxed)
    }
}

/// Batch handed from a source tick to the supervisor's processing
/// loop, still carrying the source-derived defaults and compiled
/// threshold rules needed downstream.
pub struct SourcedBatch {
    pub descriptor: Arc<SourceDescriptor>,
    pub evaluator: Arc<Evaluator>,
    pub events: Vec<Event>,
}

pub(crate) type EmitFn = Arc<dyn Fn(SourcedBatch) + Send + Sync>;

/// Owns one configured source: its current instance, descriptor,
/// compiled thresholds, and the spawned timer task. `restart` is the
/// watchdog's hook (§4.7): stop the timer, drop the instance, build a
/// fresh one from the frozen descriptor, start again.
pub struct SourceRuntime {
    descriptor: Arc<SourceDescriptor>,
    evaluator: Arc<Evaluator>,
    factory: SourceFactory,
    state: Arc<SourceState>,
    handle: Option<JoinHandle<()>>,
}

impl SourceRuntime {
    pub fn new(
        descriptor: SourceDescriptor,
        evaluator: Evaluator,
        factory: SourceFactory,
    ) -> Result<Self, String> {
        // Validate eagerly so config errors surface at startup, not on
        // the first tick.
        factory(&descriptor)?;
        Ok(SourceRuntime {
            descriptor: Arc::new(descriptor),
            evaluator: Arc::new(evaluator),
            factory,
            state: Arc::new(SourceState::default()),
            handle: None,
        })
    }

    pub fn descriptor(&self) -> &Arc<SourceDescriptor> {
        &self.descriptor
    }

    pub fn state(&self) -> &Arc<SourceState> {
        &self.state
    }

    pub fn is_stale(&self, now: f64) -> bool {
        self.descriptor.watchdog && self.state.last_event_time() < now - 10.0 * self.descriptor.interval
    }

    /// Spawns the periodic timer task. `emit` is called with every
    /// non-empty batch the source produces.
    pub fn start(&mut self, emit: EmitFn) -> Result<(), String> {
        let instance = (self.factory)(&self.descriptor)?;
        let descriptor = self.descriptor.clone();
        let evaluator = self.evaluator.clone();
        let state = self.state.clone();

        self.handle = Some(tokio::spawn(run_timer(instance, descriptor, evaluator, state, emit)));
        Ok(())
    }

    pub fn stop(&mut self) {
        if let Some(handle) = self.handle.take() {
            handle.abort();
        }
    }

    /// Watchdog recovery (§4.7, §8 invariant 8): stop, drop, rebuild,
    /// restart. The new task is a different `JoinHandle`, i.e. a
    /// different runtime identity, as required by the invariant.
    pub fn restart(&mut self, emit: EmitFn) -> Result<(), String> {
        warn!(service = %self.descriptor.service, "restarting stale source");
        self.stop();
        self.state = Arc::new(SourceState::default());
        self.start(emit)
    }
}

fn run_timer(
    instance: Box<dyn Source>,
    descriptor: Arc<SourceDescriptor>,
    evaluator: Arc<Evaluator>,
    state: Arc<SourceState>,
    emit: EmitFn,
) -> Pin<Box<dyn Future<Output = ()> + Send>> {
    Box::pin(async move {
        if descriptor.start_delay > 0.0 {
            tokio::time::sleep(Duration::from_secs_f64(descriptor.start_delay)).await;
        }

        let mut interval = tokio::time::interval(Duration::from_secs_f64(descriptor.interval.max(0.001)));
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        loop {
            interval.tick().await;

            if descriptor.sync && state.in_flight.swap(true, Ordering::AcqRel) {
                debug!(service = %descriptor.service, "skipping tick: previous tick still in flight");
                continue;
            }

            let events = match instance.tick().await {
                Ok(events) => events,
                Err(err) => {
                    error!(service = %descriptor.service, error = %err, "source tick failed");
                    Vec::new()
                }
            };

            if descriptor.sync {
                state.in_flight.store(false, Ordering::Release);
            }

            state.record_tick(events.len());

            if events.is_empty() {
                continue;
            }

            let events = stamp_defaults(events, &descriptor);
            emit(SourcedBatch { descriptor: descriptor.clone(), evaluator: evaluator.clone(), events });
        }
    })
}

/// Stamps source-derived defaults (service prefix, ttl, tags, host)
/// onto events that did not already set them explicitly.
fn stamp_defaults(events: Vec<Event>, descriptor: &SourceDescriptor) -> Vec<Event> {
    events
        .into_iter()
        .map(|mut ev| {
            if ev.host.is_empty() {
                ev.host = descriptor.hostname.clone();
            }
            if ev.ttl <= 0.0 {
                ev.ttl = descriptor.ttl;
            }
            if ev.tags.is_empty() {
                ev.tags = descriptor.tags.clone();
            }
            if ev.service.is_empty() {
                ev.service = descriptor.service.clone();
            } else if !descriptor.service.is_empty() && !ev.service.starts_with(&descriptor.service) {
                ev.service = format!("{}.{}", descriptor.service, ev.service);
            }
            ev
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::event::Event;
    use std::sync::atomic::AtomicUsize;
    use tokio::sync::mpsc;

    struct CountingSource {
        calls: Arc<AtomicUsize>,
    }

    #[async_trait]
    impl Source for CountingSource {
        async fn tick(&self) -> Result<Vec<Event>, SourceError> {
            let n = self.calls.fetch_add(1, Ordering::SeqCst);
            Ok(vec![Event::metric("x", "", n as f64)])
        }
    }

    fn descriptor(interval: f64, sync: bool) -> SourceDescriptor {
        SourceDescriptor {
            kind: "counting".into(),
            service: "svc".into(),
            interval,
            ttl: 60.0,
            tags: vec![],
            hostname: "localhost".into(),
            route: RouteSpec::Default,
            watchdog: false,
            start_delay: 0.0,
            sync,
            params: serde_json::Value::Null,
        }
    }

    #[tokio::test(start_paused = true)]
    async fn stamps_host_and_ttl_defaults() {
        let calls = Arc::new(AtomicUsize::new(0));
        let factory: SourceFactory = {
            let calls = calls.clone();
            Arc::new(move |_d| Ok(Box::new(CountingSource { calls: calls.clone() }) as Box<dyn Source>))
        };

        let (tx, mut rx) = mpsc::unbounded_channel::<SourcedBatch>();
        let emit: EmitFn = Arc::new(move |batch| {
            let _ = tx.send(batch);
        });

        let mut runtime =
            SourceRuntime::new(descriptor(1.0, false), Evaluator::new(), factory).unwrap();
        runtime.start(emit).unwrap();

        tokio::time::advance(Duration::from_secs(1)).await;
        let batch = rx.recv().await.unwrap();
        assert_eq!(batch.events[0].host, "localhost");
        assert_eq!(batch.events[0].ttl, 60.0);
        runtime.stop();
    }
}
