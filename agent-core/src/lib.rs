//! The monitoring agent's in-process event pipeline.
//!
//! This crate owns everything that does not need to know about YAML,
//! the filesystem, or process execution: the event/aggregator data
//! model, threshold evaluation, routing, bounded output queues, the
//! reconnecting network transports, and the supervisor state machine
//! that wires them together. The binary crate is responsible for
//! config parsing and the concrete source plug-ins that do I/O.

pub mod aggregator;
pub mod cache;
pub mod error;
pub mod event;
pub mod output;
pub mod queue;
pub mod registry;
pub mod router;
pub mod source;
pub mod stats;
pub mod supervisor;
pub mod threshold;
pub mod transport;

// Plain/parking_lot toggle for the crate's non-async critical sections
// (bookkeeping that never holds the guard across an `.await`). Network
// transports hold their connection state across real I/O and use
// `tokio::sync::Mutex` directly instead — swapping those to a
// synchronous lock would be a bug, not an optimization.
#[allow(dead_code)]
pub(crate) mod sync {
    #[cfg(feature = "parking_lot")]
    pub(crate) use parking_lot::Mutex;

    #[cfg(not(feature = "parking_lot"))]
    pub(crate) use self::std_impl::Mutex;

    #[cfg(not(feature = "parking_lot"))]
    mod std_impl {
        use std::sync::{self, PoisonError};

        #[derive(Debug, Default)]
        pub(crate) struct Mutex<T: ?Sized>(sync::Mutex<T>);

        impl<T> Mutex<T> {
            pub(crate) fn new(data: T) -> Self {
                Self(sync::Mutex::new(data))
            }
        }

        impl<T: ?Sized> Mutex<T> {
            pub(crate) fn lock(&self) -> std::sync::MutexGuard<'_, T> {
                self.0.lock().unwrap_or_else(PoisonError::into_inner)
            }
        }
    }
}

pub use aggregator::Aggregation;
pub use cache::EventCache;
pub use error::{AgentError, ConfigError, SourceError, TransportError};
pub use event::{Event, Kind};
pub use output::{OutputRuntime, OutputSettings, Transport};
pub use registry::Registry;
pub use router::Router;
pub use source::{RouteSpec, Source, SourceDescriptor, SourceFactory, SourceRuntime};
pub use stats::Stats;
pub use supervisor::{Supervisor, SupervisorState};
pub use threshold::{Evaluator, ThresholdError};
