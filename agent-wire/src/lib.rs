//! Wire bindings for the agent's network outputs.
//!
//! The message shapes here are generated from `proto/riemann.proto` at
//! build time. The length-prefixed stream and datagram transports both
//! frame a [`Msg`] the same way: a big-endian `u32` length followed by
//! the encoded bytes. A `Msg` is either a batch of [`Event`]s (agent ->
//! sink) or a bare acknowledgement (sink -> agent, `ok` set, no events).

include!(concat!(env!("OUT_DIR"), "/agent.wire.riemann.rs"));

impl Msg {
    pub fn ack() -> Self {
        Msg {
            ok: Some(true),
            error: None,
            events: Vec::new(),
        }
    }

    pub fn batch(events: Vec<Event>) -> Self {
        Msg {
            ok: None,
            error: None,
            events,
        }
    }

    pub fn is_ack(&self) -> bool {
        self.events.is_empty() && self.ok.is_some()
    }
}
