//! `self_metrics` source (§4.2, §4.7): reports the supervisor's own
//! event throughput and output queue sizes. No external I/O — it just
//! reads the same `Stats` snapshot the watchdog and operators would.

use std::sync::Arc;

use agent_core::{Event, SourceError, Stats};
use async_trait::async_trait;

pub struct SelfMetricsSource {
    stats: Arc<Stats>,
    hostname: String,
}

impl SelfMetricsSource {
    pub fn new(stats: Arc<Stats>, hostname: String) -> Self {
        SelfMetricsSource { stats, hostname }
    }
}

#[async_trait]
impl agent_core::Source for SelfMetricsSource {
    async fn tick(&self) -> Result<Vec<Event>, SourceError> {
        Ok(self.stats.snapshot(&self.hostname).await)
    }
}
