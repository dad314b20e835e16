//! Output runtime (§4.6): a bounded queue, a dequeue timer, a rate
//! limiter, and a backpressure gate in front of a pluggable transport.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use crate::error::TransportError;
use crate::event::{now_secs, Event};
use crate::queue::OutputQueue;
use crate::sync::Mutex as SyncMutex;

/// A send-side transport. `pressure` is the signal the dequeue loop's
/// backpressure gate reads (§4.6 step 2); connectionless transports
/// always report zero.
#[async_trait]
pub trait Transport: Send + Sync {
    async fn connect(&self);
    async fn send(&self, batch: Vec<Event>) -> Result<(), TransportError>;
    fn is_ready(&self) -> bool;
    fn pressure(&self) -> i64;
    async fn stop(&self);
}

#[derive(Debug, Clone)]
pub struct OutputSettings {
    pub max_size: usize,
    pub interval: f64,
    pub max_rate: Option<f64>,
    pub pressure_threshold: Option<i64>,
    pub expire_when_unready: bool,
    /// Whether a NaN metric is allowed to reach the transport. Most
    /// sinks choke on NaN, so the default is to drop such events at
    /// enqueue time rather than forward them.
    pub allow_nan: bool,
}

impl Default for OutputSettings {
    fn default() -> Self {
        OutputSettings {
            max_size: 250_000,
            interval: 1.0,
            max_rate: None,
            pressure_threshold: None,
            expire_when_unready: false,
            allow_nan: false,
        }
    }
}

pub struct OutputRuntime {
    settings: OutputSettings,
    queue: SyncMutex<OutputQueue>,
    transport: Arc<dyn Transport>,
    dequeue_task: tokio::sync::Mutex<Option<JoinHandle<()>>>,
    sent: AtomicU64,
}

impl OutputRuntime {
    pub fn new(settings: OutputSettings, transport: Arc<dyn Transport>) -> Self {
        let queue = SyncMutex::new(OutputQueue::new(settings.max_size));
        OutputRuntime {
            settings,
            queue,
            transport,
            dequeue_task: tokio::sync::Mutex::new(None),
            sent: AtomicU64::new(0),
        }
    }

    /// Idempotent async bring-up; does not block the caller beyond
    /// kicking the connect attempt off and starting the dequeue timer.
    /// The transport's own `connect` may retry with backoff before it
    /// becomes ready, so it runs on its own task rather than being
    /// awaited here — wiring up several outputs must not stall on one
    /// of them being unreachable at startup.
    pub async fn connect(self: &Arc<Self>) {
        let transport = self.transport.clone();
        tokio::spawn(async move { transport.connect().await });

        let this = self.clone();
        let mut task = this.dequeue_task.lock().await;
        if task.is_none() {
            let handle = tokio::spawn(dequeue_loop(this.clone()));
            *task = Some(handle);
        }
    }

    /// Non-blocking enqueue; events past `max_size` are dropped (§4.6).
    /// A NaN metric is dropped outright unless `allow_nan` is set.
    pub async fn enqueue(&self, events: Vec<Event>) {
        if events.is_empty() {
            return;
        }
        let events = if self.settings.allow_nan {
            events
        } else {
            let before = events.len();
            let kept: Vec<Event> = events.into_iter().filter(|ev| !ev.metric.is_some_and(f64::is_nan)).collect();
            let nan_dropped = before - kept.len();
            if nan_dropped > 0 {
                warn!(nan_dropped, "dropping events with NaN metric");
            }
            kept
        };
        if events.is_empty() {
            return;
        }

        let mut queue = self.queue.lock();
        let dropped = queue.enqueue(events);
        if dropped > 0 {
            warn!(dropped, "output queue full, dropping events");
        }
    }

    pub async fn queue_len(&self) -> usize {
        self.queue.lock().len()
    }

    pub async fn dropped(&self) -> u64 {
        self.queue.lock().dropped()
    }

    pub fn sent(&self) -> u64 {
        self.sent.load(Ordering::Relaxed)
    }

    pub async fn stop(&self) {
        if let Some(handle) = self.dequeue_task.lock().await.take() {
            handle.abort();
        }
        self.transport.stop().await;
    }

    /// One dequeue tick (§4.6 steps 1-3), factored out so tests can
    /// drive it deterministically instead of waiting on the timer.
    async fn tick(&self) {
        if !self.transport.is_ready() {
            if self.settings.expire_when_unready {
                let mut queue = self.queue.lock();
                let expired = queue.expire(now_secs());
                if expired > 0 {
                    debug!(expired, "expired stale events while transport not ready");
                }
            }
            return;
        }

        if let Some(threshold) = self.settings.pressure_threshold {
            if self.transport.pressure() > threshold {
                return;
            }
        }

        let max = self
            .settings
            .max_rate
            .map(|rate| (rate * self.settings.interval).floor().max(0.0) as usize);

        let batch = {
            let mut queue = self.queue.lock();
            queue.pop_batch(max)
        };

        if batch.is_empty() {
            return;
        }

        let n = batch.len();
        if let Err(err) = self.transport.send(batch.clone()).await {
            warn!(error = %err, "transport send failed, re-queueing batch");
            let mut queue = self.queue.lock();
            let dropped = queue.requeue_front(batch);
            if dropped > 0 {
                warn!(dropped, "output queue full, dropping re-queued events");
            }
        } else {
            self.sent.fetch_add(n as u64, Ordering::Relaxed);
        }
    }
}

async fn dequeue_loop(output: Arc<OutputRuntime>) {
    let mut interval = tokio::time::interval(Duration::from_secs_f64(output.settings.interval.max(0.001)));
    interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    loop {
        interval.tick().await;
        output.tick().await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::NullTransport;

    #[tokio::test]
    async fn nan_metric_is_dropped_by_default() {
        let transport = Arc::new(NullTransport::default());
        let settings = OutputSettings { allow_nan: false, ..Default::default() };
        let runtime = OutputRuntime::new(settings, transport);

        let mut ev = Event::metric("svc".into(), "host".into(), f64::NAN);
        runtime.enqueue(vec![ev.clone()]).await;
        assert_eq!(runtime.queue.lock().len(), 0);

        ev.metric = Some(1.0);
        runtime.enqueue(vec![ev]).await;
        assert_eq!(runtime.queue.lock().len(), 1);
    }

    #[tokio::test]
    async fn nan_metric_is_kept_when_allow_nan_is_set() {
        let transport = Arc::new(NullTransport::default());
        let settings = OutputSettings { allow_nan: true, ..Default::default() };
        let runtime = OutputRuntime::new(settings, transport);

        let ev = Event::metric("svc".into(), "host".into(), f64::NAN);
        runtime.enqueue(vec![ev]).await;
        assert_eq!(runtime.queue.lock().len(), 1);
    }

    #[tokio::test]
    async fn rate_cap_limits_batch_size_invariant_4() {
        let transport = Arc::new(NullTransport::default());
        let settings = OutputSettings {
            max_size: 1000,
            interval: 1.0,
            max_rate: Some(2.0),
            pressure_threshold: None,
            expire_when_unready: false,
            allow_nan: false,
        };
        let runtime = Arc::new(OutputRuntime::new(settings, transport.clone()));
        transport.set_ready(true);

        runtime.enqueue((0..10).map(|_| Event::metric("x", "h", 1.0)).collect()).await;
        runtime.tick().await;

        assert_eq!(transport.last_batch_len(), Some(2));
        assert_eq!(runtime.queue_len().await, 8);
    }

    #[tokio::test]
    async fn backpressure_gate_skips_tick() {
        let transport = Arc::new(NullTransport::default());
        transport.set_ready(true);
        transport.set_pressure(10);

        let settings = OutputSettings { pressure_threshold: Some(5), ..OutputSettings::default() };
        let runtime = Arc::new(OutputRuntime::new(settings, transport.clone()));
        runtime.enqueue(vec![Event::metric("x", "h", 1.0)]).await;
        runtime.tick().await;

        assert_eq!(transport.last_batch_len(), None);
        assert_eq!(runtime.queue_len().await, 1);
    }

    #[tokio::test]
    async fn failed_send_requeues_the_batch() {
        let transport = Arc::new(NullTransport::default());
        transport.set_ready(true);
        transport.set_fail_sends(true);

        let runtime = Arc::new(OutputRuntime::new(OutputSettings::default(), transport.clone()));
        runtime.enqueue(vec![Event::metric("x", "h", 1.0), Event::metric("y", "h", 2.0)]).await;
        runtime.tick().await;

        assert_eq!(runtime.queue_len().await, 2);
        assert_eq!(transport.last_batch_len(), None);

        transport.set_fail_sends(false);
        runtime.tick().await;
        assert_eq!(runtime.queue_len().await, 0);
        assert_eq!(transport.last_batch_len(), Some(2));
    }

    #[tokio::test]
    async fn not_ready_expires_stale_events_when_configured() {
        let transport = Arc::new(NullTransport::default());
        let settings = OutputSettings { expire_when_unready: true, ..OutputSettings::default() };
        let runtime = Arc::new(OutputRuntime::new(settings, transport));

        let mut stale = Event::metric("x", "h", 1.0);
        stale.time = 0.0;
        stale.ttl = 1.0;
        runtime.enqueue(vec![stale]).await;
        runtime.tick().await;

        assert_eq!(runtime.queue_len().await, 0);
    }
}
