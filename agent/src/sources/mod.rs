//! Concrete source plug-ins shipped with the agent (§4.2): reference
//! implementations that exercise the `Source` contract end to end, not
//! an exhaustive catalog.

pub mod exec;
pub mod log_tail;
pub mod self_metrics;
