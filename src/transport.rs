use std::io;
use std::net::SocketAddr;
use std::sync::Arc;

use async_trait::async_trait;
use log::{debug, warn};
use tokio::net::{ToSocketAddrs, UdpSocket};
use tokio::task::JoinHandle;

use crate::error::QueryError;
use crate::message::Request;
use crate::messenger::{Messenger, Transport};
use crate::source::{SourceDecoder, SourceRequest, SourceResponse};

/// Largest UDP payload; Source servers stay under 1400 bytes but some games
/// do not.
const RECV_BUFFER: usize = 65_507;

/// One unconnected UDP socket shared by every destination server.
#[derive(Debug)]
pub struct UdpTransport {
    socket: UdpSocket,
}

impl UdpTransport {
    /// Binds `addr`; use `"0.0.0.0:0"` for any port.
    pub async fn bind<A: ToSocketAddrs>(addr: A) -> Result<Self, QueryError> {
        let socket = UdpSocket::bind(addr)
            .await
            .map_err(QueryError::FailedPortBind)?;
        Ok(UdpTransport { socket })
    }

    pub fn local_addr(&self) -> io::Result<SocketAddr> {
        self.socket.local_addr()
    }

    pub async fn recv_from(&self, buf: &mut [u8]) -> Result<(usize, SocketAddr), QueryError> {
        self.socket.recv_from(buf).await.map_err(QueryError::Receive)
    }

    /// Feeds every datagram through `decoder` into `messenger` until the
    /// messenger is closed.
    pub fn spawn_receiver(
        self: &Arc<Self>,
        messenger: Arc<Messenger<SourceRequest, SourceResponse>>,
        mut decoder: SourceDecoder,
    ) -> JoinHandle<()> {
        let transport = self.clone();
        tokio::spawn(async move {
            let mut buf = vec![0u8; RECV_BUFFER];
            loop {
                let received = tokio::select! {
                    _ = messenger.closed() => break,
                    received = transport.recv_from(&mut buf) => received,
                };
                let (len, from) = match received {
                    Ok(received) => received,
                    Err(err) => {
                        warn!("{}", err);
                        continue;
                    }
                };
                match decoder.decode(from, &buf[..len]) {
                    Ok(Some(response)) => {
                        messenger.receive(response);
                    }
                    Ok(None) => {}
                    Err(err) => warn!("discarding datagram from {}: {}", from, err),
                }
            }
            debug!("receiver stopped");
        })
    }
}

#[async_trait]
impl<R: Request> Transport<R> for UdpTransport {
    async fn send(&self, request: &R) -> io::Result<()> {
        self.socket
            .send_to(&request.encode(), request.recipient())
            .await
            .map(|_| ())
    }

    fn local_addr(&self) -> io::Result<SocketAddr> {
        self.socket.local_addr()
    }
}
