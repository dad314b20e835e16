//! Counter-derivative aggregators (§4.1).
//!
//! An aggregator is a pure function of `(previous, current, delta_seconds)`
//! that either derives a rate-like metric or signals "emit nothing this
//! tick" by returning `None`. The registry is a fixed, closed set —
//! see the Non-goals in the module spec for why `Counter` swallows
//! decreasing samples instead of re-emitting them as a (nonsensical)
//! negative rate.

const U32_MAX: f64 = 4294967295.0;
const U64_MAX: f64 = 18446744073709551615.0;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Aggregation {
    Counter,
    Counter32,
    Counter64,
}

impl Aggregation {
    pub fn apply(self, previous: f64, current: f64, delta_seconds: f64) -> Option<f64> {
        match self {
            Aggregation::Counter => counter(previous, current, delta_seconds),
            Aggregation::Counter32 => wrapping_counter(previous, current, delta_seconds, U32_MAX),
            Aggregation::Counter64 => wrapping_counter(previous, current, delta_seconds, U64_MAX),
        }
    }

    pub fn name(self) -> &'static str {
        match self {
            Aggregation::Counter => "Counter",
            Aggregation::Counter32 => "Counter32",
            Aggregation::Counter64 => "Counter64",
        }
    }

    pub fn parse(name: &str) -> Option<Self> {
        match name {
            "Counter" => Some(Aggregation::Counter),
            "Counter32" => Some(Aggregation::Counter32),
            "Counter64" => Some(Aggregation::Counter64),
            _ => None,
        }
    }
}

fn counter(previous: f64, current: f64, delta: f64) -> Option<f64> {
    if current < previous {
        return None;
    }
    Some((current - previous) / delta)
}

fn wrapping_counter(previous: f64, current: f64, delta: f64, max: f64) -> Option<f64> {
    if current < previous {
        let wrapped = max - previous;
        return Some((wrapped + current) / delta);
    }
    Some((current - previous) / delta)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn counter_rate() {
        assert_eq!(Aggregation::Counter.apply(1000.0, 2000.0, 4.0), Some(250.0));
    }

    #[test]
    fn counter_drops_on_decrease() {
        assert_eq!(Aggregation::Counter.apply(2000.0, 1000.0, 4.0), None);
    }

    #[test]
    fn counter32_wraps() {
        let a = U32_MAX - 11.0;
        let b = 5.0;
        assert_eq!(Aggregation::Counter32.apply(a, b, 4.0), Some(2.5));
    }

    #[test]
    fn counter64_wraps() {
        let a = U64_MAX - 11.0;
        let b = 5.0;
        assert_eq!(Aggregation::Counter64.apply(a, b, 4.0), Some(2.5));
    }

    #[test]
    fn parse_roundtrip() {
        for agg in [Aggregation::Counter, Aggregation::Counter32, Aggregation::Counter64] {
            assert_eq!(Aggregation::parse(agg.name()), Some(agg));
        }
        assert_eq!(Aggregation::parse("Gauge"), None);
    }
}
