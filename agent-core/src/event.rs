use std::collections::BTreeMap;
use std::time::{SystemTime, UNIX_EPOCH};

use crate::aggregator::Aggregation;

/// What kind of observation an [`Event`] carries. Metric events carry a
/// numeric `metric`; log events carry structured `description`-style
/// attributes instead and have no metric.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Kind {
    Metric,
    Log,
}

/// One observation flowing through the pipeline.
///
/// Identity for the purposes of aggregation is `(host, service)`.
/// `aggregation` is only present on events still awaiting the
/// aggregation step (§4.3); it is always cleared before an event is
/// handed to an output.
#[derive(Debug, Clone, PartialEq)]
pub struct Event {
    pub state: String,
    pub service: String,
    pub host: String,
    pub description: String,
    pub metric: Option<f64>,
    pub ttl: f64,
    pub tags: Vec<String>,
    pub attributes: BTreeMap<String, String>,
    pub time: f64,
    pub aggregation: Option<Aggregation>,
    pub kind: Kind,
}

impl Event {
    /// Builds an `ok`-state metric event stamped with the current time.
    pub fn metric(service: impl Into<String>, host: impl Into<String>, metric: f64) -> Self {
        Event {
            state: "ok".into(),
            service: service.into(),
            host: host.into(),
            description: String::new(),
            metric: Some(metric),
            ttl: 60.0,
            tags: Vec::new(),
            attributes: BTreeMap::new(),
            time: now_secs(),
            aggregation: None,
            kind: Kind::Metric,
        }
    }

    pub fn with_aggregation(mut self, agg: Aggregation) -> Self {
        self.aggregation = Some(agg);
        self
    }

    pub fn with_ttl(mut self, ttl: f64) -> Self {
        self.ttl = ttl;
        self
    }

    pub fn with_tags(mut self, tags: Vec<String>) -> Self {
        self.tags = tags;
        self
    }

    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = description.into();
        self
    }

    /// Identity used by the event cache and aggregation step: `(host, service)`.
    pub fn identity(&self) -> (String, String) {
        (self.host.clone(), self.service.clone())
    }

    pub fn is_ok(&self) -> bool {
        self.state == "ok"
    }

    pub fn has_expired(&self, now: f64) -> bool {
        self.time + self.ttl < now
    }

    /// Invariants that must hold for any event handed to an output
    /// (§8, invariant 1): no pending aggregation, finite positive time,
    /// non-empty service, positive ttl.
    pub fn is_well_formed(&self) -> bool {
        self.aggregation.is_none()
            && self.time.is_finite()
            && self.time > 0.0
            && !self.service.is_empty()
            && self.ttl > 0.0
    }
}

pub fn now_secs() -> f64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs_f64()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn well_formed_requires_cleared_aggregation() {
        let ev = Event::metric("cpu.iowait", "localhost", 1.0).with_aggregation(Aggregation::Counter);
        assert!(!ev.is_well_formed());
        let mut ev = ev;
        ev.aggregation = None;
        assert!(ev.is_well_formed());
    }

    #[test]
    fn empty_service_is_not_well_formed() {
        let ev = Event::metric("", "localhost", 1.0);
        assert!(!ev.is_well_formed());
    }

    #[test]
    fn non_positive_ttl_is_not_well_formed() {
        let ev = Event::metric("cpu.iowait", "localhost", 1.0).with_ttl(0.0);
        assert!(!ev.is_well_formed());
    }
}
