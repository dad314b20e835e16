//! Connectionless UDP transport (§4.6). There is no acknowledgement
//! channel so pressure is always zero and "ready" means only that the
//! socket is bound — sends are fire-and-forget, matching the wire
//! protocol's UDP mode where delivery is not confirmed.

use std::sync::atomic::{AtomicBool, Ordering};

use async_trait::async_trait;
use prost::Message as _;
use tokio::net::UdpSocket;
use tokio::sync::Mutex;
use tracing::warn;

use crate::error::TransportError;
use crate::event::Event;
use crate::output::Transport;

use super::stream::to_wire;

#[derive(Debug, Clone)]
pub struct DatagramConfig {
    pub target: String,
    pub bind: String,
}

impl Default for DatagramConfig {
    fn default() -> Self {
        DatagramConfig { target: "localhost:5555".into(), bind: "0.0.0.0:0".into() }
    }
}

pub struct DatagramTransport {
    config: DatagramConfig,
    socket: Mutex<Option<UdpSocket>>,
    ready: AtomicBool,
}

impl DatagramTransport {
    pub fn new(config: DatagramConfig) -> Self {
        DatagramTransport { config, socket: Mutex::new(None), ready: AtomicBool::new(false) }
    }
}

#[async_trait]
impl Transport for DatagramTransport {
    async fn connect(&self) {
        match UdpSocket::bind(&self.config.bind).await {
            Ok(socket) => {
                if let Err(err) = socket.connect(&self.config.target).await {
                    warn!(error = %err, target = %self.config.target, "udp connect failed");
                    return;
                }
                *self.socket.lock().await = Some(socket);
                self.ready.store(true, Ordering::SeqCst);
            }
            Err(err) => warn!(error = %err, "udp bind failed"),
        }
    }

    async fn send(&self, batch: Vec<Event>) -> Result<(), TransportError> {
        let socket_guard = self.socket.lock().await;
        let socket = socket_guard.as_ref().ok_or(TransportError::NotReady)?;

        // A datagram has no length prefix on the wire; the receiver
        // relies on the UDP frame boundary itself to delimit one `Msg`.
        for event in batch {
            let msg = agent_wire::Msg::batch(vec![to_wire(&event)]);
            let encoded = msg.encode_to_vec();
            socket.send(&encoded).await.map_err(TransportError::Io)?;
        }
        Ok(())
    }

    fn is_ready(&self) -> bool {
        self.ready.load(Ordering::SeqCst)
    }

    fn pressure(&self) -> i64 {
        0
    }

    async fn stop(&self) {
        self.ready.store(false, Ordering::SeqCst);
        *self.socket.lock().await = None;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn send_without_connect_is_not_ready() {
        let transport = DatagramTransport::new(DatagramConfig::default());
        let err = transport.send(vec![Event::metric("x", "h", 1.0)]).await.unwrap_err();
        assert!(matches!(err, TransportError::NotReady));
    }

    #[tokio::test]
    async fn pressure_is_always_zero() {
        let transport = DatagramTransport::new(DatagramConfig::default());
        assert_eq!(transport.pressure(), 0);
    }
}
