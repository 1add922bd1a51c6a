use tokio::{io::{AsyncRead, AsyncWrite}, sync::broadcast, time};
use anyhow::{Result, Context};
use async_trait::async_trait;
use std::{sync::Arc, time::Duration};
use tokio::net::{TcpListener, TcpStream, UdpSocket};
use std::net::SocketAddr;
use tracing::{debug, error, info, warn};

use crate::{backoff::BackOff, config::DEFAULT_CHANNEL_BUFFER_SIZE, error::MurmurError};

/// A bidirectional byte stream used for push-pull exchanges.
pub trait AsyncStream: AsyncRead + AsyncWrite + Unpin + Send {}

impl<T> AsyncStream for T where T: AsyncRead + AsyncWrite + Unpin + Send {}

pub type BoxedStream = Box<dyn AsyncStream>;

#[derive(Debug, Clone)]
pub struct Datagram {
    pub remote_addr: SocketAddr,
    pub data: Vec<u8>,
}

/// Network boundary of a node: unreliable datagrams for probes and gossip,
/// reliable streams for push-pull.
#[async_trait]
pub trait Transport: Send + Sync {
    /// Address peers use to reach this transport.
    fn local_addr(&self) -> Result<SocketAddr>;

    /// Subscribes to inbound datagrams. Datagrams that arrive while nobody
    /// listens are lost.
    fn incoming(&self) -> broadcast::Receiver<Datagram>;

    /// Sends one datagram. Delivery is not guaranteed.
    async fn send_to(&self, target: SocketAddr, data: &[u8]) -> Result<()>;

    /// Opens a stream to `target`, giving up after `timeout`.
    async fn dial(&self, target: SocketAddr, timeout: Duration) -> Result<BoxedStream>;

    /// Waits for the next inbound stream. Fails once the transport is shut down.
    async fn accept(&self) -> Result<(BoxedStream, SocketAddr)>;

    async fn shutdown(&self) -> Result<()>;
}

/// Default transport: a UDP socket and a TCP listener sharing one port.
pub struct NetTransport {
    datagram_tx: broadcast::Sender<Datagram>,
    udp_socket: Arc<UdpSocket>,
    tcp_listener: TcpListener,
    shutdown_signal: broadcast::Sender<()>,
}

impl NetTransport {
    /// Binds both sockets on `addr`. A zero port picks a free one, shared by
    /// UDP and TCP.
    pub async fn bind(addr: SocketAddr) -> Result<Self> {
        let udp_socket = UdpSocket::bind(addr).await
            .map_err(|e| MurmurError::Startup(format!("failed to bind UDP socket on {}: {}", addr, e)))?;
        let local_addr = udp_socket.local_addr().context("Failed to get local address")?;
        let tcp_listener = TcpListener::bind(local_addr).await
            .map_err(|e| MurmurError::Startup(format!("failed to bind TCP listener on {}: {}", local_addr, e)))?;

        let (datagram_tx, _) = broadcast::channel(DEFAULT_CHANNEL_BUFFER_SIZE);
        let (shutdown_signal, _) = broadcast::channel(1);

        let transport = Self {
            datagram_tx,
            udp_socket: Arc::new(udp_socket),
            tcp_listener,
            shutdown_signal,
        };

        if local_addr.ip().is_unspecified() {
            info!("> [MURMUR] Binding to all network interfaces on port {}", local_addr.port());
        } else {
            info!("> [MURMUR] Binding to specific IP: {}", local_addr);
        }

        transport.spawn_datagram_listener();

        Ok(transport)
    }

    fn spawn_datagram_listener(&self) {
        let socket = self.udp_socket.clone();
        let tx = self.datagram_tx.clone();
        let mut shutdown_rx = self.shutdown_signal.subscribe();
        let backoff = BackOff::new();

        tokio::spawn(async move {
            let mut buf = vec![0u8; 65535];
            loop {
                if backoff.is_circuit_open() {
                    let wait_time = backoff.time_until_close();
                    warn!("Circuit breaker is open. Waiting for {:?} before next attempt...", wait_time);

                    tokio::select! {
                        _ = time::sleep(wait_time) => {},
                        _ = shutdown_rx.recv() => break,
                    }
                    continue;
                }

                tokio::select! {
                    result = socket.recv_from(&mut buf) => {
                        match result {
                            Ok((len, src)) => {
                                backoff.record_success();
                                // No subscriber yet (or anymore) just means nobody
                                // is interested in this packet.
                                let _ = tx.send(Datagram {
                                    remote_addr: src,
                                    data: buf[..len].to_vec(),
                                });
                                continue;
                            }
                            Err(e) => {
                                let (failures, opened) = backoff.record_failure();
                                error!("Error receiving UDP datagram: {} Consecutive failures: {}", e, failures);
                                if opened {
                                    warn!("UDP listener circuit breaker opened");
                                }
                            }
                        }
                    }
                    _ = shutdown_rx.recv() => break,
                }

                let delay = backoff.calculate_delay();
                if !delay.is_zero() {
                    tokio::select! {
                        _ = time::sleep(delay) => {},
                        _ = shutdown_rx.recv() => break,
                    }
                }
            }
            debug!("UDP listener shut down");
        });
    }
}

#[async_trait]
impl Transport for NetTransport {
    fn local_addr(&self) -> Result<SocketAddr> {
        Ok(self.udp_socket.local_addr()?)
    }

    fn incoming(&self) -> broadcast::Receiver<Datagram> {
        self.datagram_tx.subscribe()
    }

    async fn send_to(&self, target: SocketAddr, data: &[u8]) -> Result<()> {
        self.udp_socket.send_to(data, target).await
            .map_err(|e| MurmurError::Transport(format!("failed to send datagram to {}: {}", target, e)))?;
        Ok(())
    }

    async fn dial(&self, target: SocketAddr, timeout: Duration) -> Result<BoxedStream> {
        let stream = time::timeout(timeout, TcpStream::connect(target)).await
            .map_err(|_| MurmurError::Transport(format!("connecting to {} timed out", target)))?
            .map_err(|e| MurmurError::Transport(format!("failed to connect to {}: {}", target, e)))?;
        stream.set_nodelay(true)?;
        Ok(Box::new(stream))
    }

    async fn accept(&self) -> Result<(BoxedStream, SocketAddr)> {
        let mut shutdown_rx = self.shutdown_signal.subscribe();
        tokio::select! {
            result = self.tcp_listener.accept() => {
                let (stream, addr) = result
                    .map_err(|e| MurmurError::Transport(format!("failed to accept stream: {}", e)))?;
                Ok((Box::new(stream) as BoxedStream, addr))
            }
            _ = shutdown_rx.recv() => Err(MurmurError::Transport("transport shut down".into()).into()),
        }
    }

    async fn shutdown(&self) -> Result<()> {
        // Err only means every listener is already gone.
        let _ = self.shutdown_signal.send(());
        Ok(())
    }
}
