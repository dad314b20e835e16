use std::collections::HashMap;

use crate::event::Event;
use crate::sync::Mutex;

#[derive(Debug, Clone, Copy)]
struct CacheEntry {
    metric: f64,
    time: f64,
}

/// Per-`(host, service)` memory of the last raw sample, consumed by the
/// aggregation step (§4.3). Entries are never evicted by the core; size
/// is bounded by the number of distinct `(host, service)` identities the
/// configured sources produce. Guarded by the crate's plain/parking_lot
/// toggle rather than a tokio mutex: every critical section here is
/// pure bookkeeping with no `.await` inside it.
#[derive(Default)]
pub struct EventCache {
    entries: Mutex<HashMap<(String, String), CacheEntry>>,
}

impl EventCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// Runs the aggregation step over one source tick's batch, preserving
    /// order within the batch. Events without a pending aggregation pass
    /// through untouched; events undergoing aggregation are dropped on
    /// first observation or on an aggregator's "emit nothing" result.
    pub async fn aggregate(&self, events: Vec<Event>) -> Vec<Event> {
        let mut out = Vec::with_capacity(events.len());
        let mut entries = self.entries.lock();

        for mut ev in events {
            let Some(agg) = ev.aggregation else {
                out.push(ev);
                continue;
            };

            let id = ev.identity();
            let this_metric = ev.metric.unwrap_or(0.0);
            let this_time = ev.time;

            match entries.get(&id).copied() {
                None => {
                    entries.insert(id, CacheEntry { metric: this_metric, time: this_time });
                }
                Some(prev) => {
                    let delta = this_time - prev.time;
                    entries.insert(id, CacheEntry { metric: this_metric, time: this_time });

                    if delta > 0.0 {
                        if let Some(derived) = agg.apply(prev.metric, this_metric, delta) {
                            ev.metric = Some(derived);
                            ev.aggregation = None;
                            out.push(ev);
                        }
                    }
                }
            }
        }

        out
    }

    pub async fn len(&self) -> usize {
        self.entries.lock().len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::aggregator::Aggregation;

    #[tokio::test]
    async fn first_sample_is_swallowed_second_is_forwarded() {
        let cache = EventCache::new();

        let e1 = Event {
            time: 0.0,
            metric: Some(1000.0),
            ..Event::metric("if.eth0.rx_bytes", "h", 1000.0).with_aggregation(Aggregation::Counter64)
        };
        let gone = cache.aggregate(vec![e1]).await;
        assert!(gone.is_empty());

        let e2 = Event {
            time: 4.0,
            metric: Some(2000.0),
            ..Event::metric("if.eth0.rx_bytes", "h", 2000.0).with_aggregation(Aggregation::Counter64)
        };
        let forwarded = cache.aggregate(vec![e2]).await;
        assert_eq!(forwarded.len(), 1);
        assert_eq!(forwarded[0].metric, Some(250.0));
        assert!(forwarded[0].aggregation.is_none());
    }

    #[tokio::test]
    async fn passthrough_events_are_untouched() {
        let cache = EventCache::new();
        let ev = Event::metric("cpu.iowait", "h", 5.0);
        let out = cache.aggregate(vec![ev.clone()]).await;
        assert_eq!(out, vec![ev]);
    }

    #[tokio::test]
    async fn decrease_on_non_wrapping_counter_drops() {
        let cache = EventCache::new();
        let e1 = Event { time: 0.0, ..Event::metric("x", "h", 100.0).with_aggregation(Aggregation::Counter) };
        cache.aggregate(vec![e1]).await;
        let e2 = Event { time: 1.0, ..Event::metric("x", "h", 50.0).with_aggregation(Aggregation::Counter) };
        let out = cache.aggregate(vec![e2]).await;
        assert!(out.is_empty());
        assert_eq!(cache.len().await, 1);
    }
}
