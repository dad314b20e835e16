//! The top-level state machine (§5): `Init -> Configured -> Starting ->
//! Running -> Stopping -> Stopped`. Owns the configured sources, the
//! shared event cache, the router, and the watchdog that rebuilds
//! sources the runtime has judged stale (§4.7, §8 invariant 8).

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{mpsc, Mutex};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::cache::EventCache;
use crate::event::now_secs;
use crate::router::Router;
use crate::source::{SourceRuntime, SourcedBatch};
use crate::stats::Stats;

const WATCHDOG_INTERVAL: Duration = Duration::from_secs(10);
const STARTUP_STAGGER: Duration = Duration::from_millis(50);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SupervisorState {
    Init,
    Configured,
    Starting,
    Running,
    Stopping,
    Stopped,
}

struct NamedSource {
    name: String,
    runtime: SourceRuntime,
}

pub struct Supervisor {
    state: Mutex<SupervisorState>,
    sources: Mutex<Vec<NamedSource>>,
    router: Arc<Router>,
    cache: Arc<EventCache>,
    stats: Arc<Stats>,
    hostname: String,
    processing_task: Mutex<Option<JoinHandle<()>>>,
    watchdog_task: Mutex<Option<JoinHandle<()>>>,
    spare_sender: Mutex<Option<mpsc::UnboundedSender<SourcedBatch>>>,
}

impl Supervisor {
    pub fn new(router: Router, cache: EventCache, stats: impl Into<Arc<Stats>>, hostname: impl Into<String>) -> Self {
        Supervisor {
            state: Mutex::new(SupervisorState::Init),
            sources: Mutex::new(Vec::new()),
            router: Arc::new(router),
            cache: Arc::new(cache),
            stats: stats.into(),
            hostname: hostname.into(),
            processing_task: Mutex::new(None),
            watchdog_task: Mutex::new(None),
            spare_sender: Mutex::new(None),
        }
    }

    pub async fn state(&self) -> SupervisorState {
        *self.state.lock().await
    }

    pub fn stats(&self) -> &Arc<Stats> {
        &self.stats
    }

    /// Adds a built source to the managed set. Valid only before `start`
    /// (§5: sources are fixed once `Starting` begins).
    pub async fn add_source(&self, name: impl Into<String>, runtime: SourceRuntime) -> Result<(), String> {
        let state = *self.state.lock().await;
        if state != SupervisorState::Init && state != SupervisorState::Configured {
            return Err(format!("cannot add sources in state {state:?}"));
        }
        self.sources.lock().await.push(NamedSource { name: name.into(), runtime });
        *self.state.lock().await = SupervisorState::Configured;
        Ok(())
    }

    /// Starts the processing loop, every source (staggered), and the
    /// watchdog. Idempotent only in the sense that calling it twice from
    /// `Running` is rejected rather than silently ignored.
    pub async fn start(self: &Arc<Self>) -> Result<(), String> {
        {
            let mut state = self.state.lock().await;
            if *state != SupervisorState::Configured {
                return Err(format!("cannot start from state {:?}", *state));
            }
            *state = SupervisorState::Starting;
        }

        let (tx, rx) = mpsc::unbounded_channel::<SourcedBatch>();
        let processing = tokio::spawn(process_loop(rx, self.cache.clone(), self.router.clone()));
        *self.processing_task.lock().await = Some(processing);
        *self.spare_sender.lock().await = Some(tx.clone());

        {
            let mut sources = self.sources.lock().await;
            for named in sources.iter_mut() {
                let tx = tx.clone();
                let emit: crate::source::EmitFn = Arc::new(move |batch| {
                    if tx.send(batch).is_err() {
                        warn!("processing loop gone, dropping source batch");
                    }
                });
                if let Err(err) = named.runtime.start(emit) {
                    warn!(source = %named.name, error = %err, "failed to start source");
                }
                tokio::time::sleep(STARTUP_STAGGER).await;
            }
        }

        let this = self.clone();
        let watchdog = tokio::spawn(async move { this.watchdog_loop().await });
        *self.watchdog_task.lock().await = Some(watchdog);

        *self.state.lock().await = SupervisorState::Running;
        info!("supervisor running");
        Ok(())
    }

    async fn watchdog_loop(self: Arc<Self>) {
        let mut interval = tokio::time::interval(WATCHDOG_INTERVAL);
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            interval.tick().await;
            let now = now_secs();
            let mut sources = self.sources.lock().await;
            for named in sources.iter_mut() {
                if named.runtime.is_stale(now) {
                    warn!(source = %named.name, "watchdog restarting stale source");
                    let emit = self.current_emit_fn().await;
                    if let Err(err) = named.runtime.restart(emit) {
                        warn!(source = %named.name, error = %err, "watchdog restart failed");
                    }
                }
            }
        }
    }

    /// A fresh `EmitFn` bound to the same channel `start` set up, for
    /// handing to a source the watchdog is rebuilding.
    async fn current_emit_fn(&self) -> crate::source::EmitFn {
        let tx = self
            .spare_sender
            .lock()
            .await
            .clone()
            .expect("processing channel initialized at start");
        Arc::new(move |batch| {
            if tx.send(batch).is_err() {
                warn!("processing loop gone, dropping source batch");
            }
        })
    }

    pub async fn stop(&self) {
        *self.state.lock().await = SupervisorState::Stopping;

        if let Some(handle) = self.watchdog_task.lock().await.take() {
            handle.abort();
        }

        {
            let mut sources = self.sources.lock().await;
            for named in sources.iter_mut() {
                named.runtime.stop();
            }
        }

        if let Some(handle) = self.processing_task.lock().await.take() {
            handle.abort();
        }

        *self.state.lock().await = SupervisorState::Stopped;
        debug!("supervisor stopped");
    }
}

async fn process_loop(mut rx: mpsc::UnboundedReceiver<SourcedBatch>, cache: Arc<EventCache>, router: Arc<Router>) {
    while let Some(batch) = rx.recv().await {
        let mut events = cache.aggregate(batch.events).await;
        for ev in events.iter_mut() {
            batch.evaluator.apply(ev);
        }
        events.retain(|ev| ev.is_well_formed());
        router.dispatch(&batch.descriptor.route, events).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::event::Event;
    use crate::output::{OutputRuntime, OutputSettings};
    use crate::source::{RouteSpec, Source, SourceDescriptor};
    use crate::transport::NullTransport;
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicUsize, Ordering as AtomicOrdering};

    struct TickingSource {
        calls: Arc<AtomicUsize>,
    }

    #[async_trait]
    impl Source for TickingSource {
        async fn tick(&self) -> Result<Vec<Event>, crate::error::SourceError> {
            self.calls.fetch_add(1, AtomicOrdering::SeqCst);
            Ok(vec![Event::metric("cpu.load", "", 99.0)])
        }
    }

    fn descriptor() -> SourceDescriptor {
        SourceDescriptor {
            kind: "ticking".into(),
            service: "cpu".into(),
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
    async fn state_transitions_through_full_lifecycle() {
        let supervisor = Arc::new(Supervisor::new(Router::new(), EventCache::new(), Stats::new(), "localhost"));
        assert_eq!(supervisor.state().await, SupervisorState::Init);

        let calls = Arc::new(AtomicUsize::new(0));
        let factory: crate::source::SourceFactory = {
            let calls = calls.clone();
            Arc::new(move |_d| Ok(Box::new(TickingSource { calls: calls.clone() }) as Box<dyn Source>))
        };
        let runtime = SourceRuntime::new(descriptor(), crate::threshold::Evaluator::new(), factory).unwrap();
        supervisor.add_source("cpu", runtime).await.unwrap();
        assert_eq!(supervisor.state().await, SupervisorState::Configured);

        supervisor.start().await.unwrap();
        assert_eq!(supervisor.state().await, SupervisorState::Running);

        supervisor.stop().await;
        assert_eq!(supervisor.state().await, SupervisorState::Stopped);
    }

    #[tokio::test(start_paused = true)]
    async fn end_to_end_pipeline_reaches_routed_output_s1_s2_s3() {
        let mut router = Router::new();
        let output = Arc::new(OutputRuntime::new(
            OutputSettings { max_size: 100, ..OutputSettings::default() },
            Arc::new(NullTransport::default()),
        ));
        router.register(None, output.clone());

        let supervisor = Arc::new(Supervisor::new(router, EventCache::new(), Stats::new(), "localhost"));

        let evaluator =
            crate::threshold::Evaluator::compile(&[], &[("cpu\\..*".into(), "> 50".into())]).unwrap();
        let factory: crate::source::SourceFactory =
            Arc::new(|_d| Ok(Box::new(TickingSource { calls: Arc::new(AtomicUsize::new(0)) }) as Box<dyn Source>));
        let runtime = SourceRuntime::new(descriptor(), evaluator, factory).unwrap();
        supervisor.add_source("cpu", runtime).await.unwrap();

        supervisor.start().await.unwrap();
        tokio::time::advance(Duration::from_secs(1)).await;
        tokio::task::yield_now().await;

        assert_eq!(output.queue_len().await, 1);
        supervisor.stop().await;
    }
}
