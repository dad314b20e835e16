pub mod datagram;
pub mod http_bulk;
pub mod stream;

use std::sync::atomic::{AtomicBool, AtomicI64, Ordering};
use std::sync::Mutex;

use async_trait::async_trait;

use crate::error::TransportError;
use crate::event::Event;
use crate::output::Transport;

pub use datagram::{DatagramConfig, DatagramTransport};
pub use http_bulk::{HttpBulkConfig, HttpBulkTransport};
pub use stream::{StreamConfig, StreamTransport, TlsConfig};

/// A transport used only in tests: records the last batch handed to
/// it and lets the test drive readiness/pressure directly.
#[derive(Default)]
pub struct NullTransport {
    ready: AtomicBool,
    pressure: AtomicI64,
    last_batch_len: Mutex<Option<usize>>,
    fail_sends: AtomicBool,
}

impl NullTransport {
    pub fn set_ready(&self, ready: bool) {
        self.ready.store(ready, Ordering::SeqCst);
    }

    pub fn set_pressure(&self, pressure: i64) {
        self.pressure.store(pressure, Ordering::SeqCst);
    }

    pub fn last_batch_len(&self) -> Option<usize> {
        *self.last_batch_len.lock().unwrap()
    }

    /// Makes every subsequent `send` fail, to exercise a runtime's
    /// transport-transient handling.
    pub fn set_fail_sends(&self, fail: bool) {
        self.fail_sends.store(fail, Ordering::SeqCst);
    }
}

#[async_trait]
impl Transport for NullTransport {
    async fn connect(&self) {
        self.ready.store(true, Ordering::SeqCst);
    }

    async fn send(&self, batch: Vec<Event>) -> Result<(), TransportError> {
        if self.fail_sends.load(Ordering::SeqCst) {
            return Err(TransportError::NotReady);
        }
        *self.last_batch_len.lock().unwrap() = Some(batch.len());
        Ok(())
    }

    fn is_ready(&self) -> bool {
        self.ready.load(Ordering::SeqCst)
    }

    fn pressure(&self) -> i64 {
        self.pressure.load(Ordering::SeqCst)
    }

    async fn stop(&self) {
        self.ready.store(false, Ordering::SeqCst);
    }
}
