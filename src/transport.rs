//! Outbound message transport.
//!
//! The node core never touches a socket. It hands every outgoing message to a
//! [`Transport`], after releasing its lock. Sending is fire-and-forget: a
//! failure is logged by the caller and the request simply times out.
//!
//! | Implementation | Use |
//! |----------------|-----|
//! | [`UdpTransport`] | tokio UDP socket, used by [`crate::service`] |
//! | test transports | in-memory networks in integration tests |

use std::net::SocketAddr;
use std::sync::Arc;

use anyhow::{Context, Result};
use tokio::net::UdpSocket;

use crate::messages::{self, Message};

pub trait Transport: Send + Sync + 'static {
    fn send(&self, message: &Message, to: SocketAddr) -> Result<()>;
}

impl<T: Transport> Transport for Arc<T> {
    fn send(&self, message: &Message, to: SocketAddr) -> Result<()> {
        (**self).send(message, to)
    }
}

/// Non-blocking UDP sender over a shared tokio socket.
#[derive(Clone)]
pub struct UdpTransport {
    socket: Arc<UdpSocket>,
}

impl UdpTransport {
    pub fn new(socket: Arc<UdpSocket>) -> Self {
        Self { socket }
    }

    pub fn socket(&self) -> &Arc<UdpSocket> {
        &self.socket
    }

    pub fn local_addr(&self) -> Result<SocketAddr> {
        self.socket.local_addr().context("failed to read local address")
    }
}

impl Transport for UdpTransport {
    fn send(&self, message: &Message, to: SocketAddr) -> Result<()> {
        let bytes = messages::encode(message).context("failed to encode message")?;
        let sent = self
            .socket
            .try_send_to(&bytes, to)
            .with_context(|| format!("failed to send {} to {}", message.kind_name(), to))?;
        if sent != bytes.len() {
            anyhow::bail!("short send to {}: {} of {} bytes", to, sent, bytes.len());
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::messages::Dict;

    #[tokio::test]
    async fn udp_transport_delivers_encoded_message() {
        let a = Arc::new(UdpSocket::bind("127.0.0.1:0").await.unwrap());
        let b = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let transport = UdpTransport::new(a);

        let msg = Message::query(vec![0, 7], "ping", Dict::new());
        transport.send(&msg, b.local_addr().unwrap()).unwrap();

        let mut buf = vec![0u8; 2048];
        let (len, from) = b.recv_from(&mut buf).await.unwrap();
        assert_eq!(from, transport.local_addr().unwrap());
        assert_eq!(messages::decode(&buf[..len]).unwrap(), msg);
    }
}
