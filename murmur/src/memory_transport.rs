//! In-process transport. Every [`MemoryTransport`] bound on the same
//! [`MemoryNetwork`] can reach the others; the network can kill endpoints,
//! cut single links and drop datagrams to simulate failures.

use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::sync::atomic::{AtomicBool, AtomicU16, Ordering};
use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use async_trait::async_trait;
use dashmap::{DashMap, DashSet};
use parking_lot::RwLock;
use rand::Rng;
use tokio::io::DuplexStream;
use tokio::sync::{broadcast, mpsc, Mutex};

use crate::config::DEFAULT_CHANNEL_BUFFER_SIZE;
use crate::error::MurmurError;
use crate::transport::{BoxedStream, Datagram, Transport};

const FIRST_PORT: u16 = 10_000;
const STREAM_BUFFER_SIZE: usize = 64 * 1024;

struct Endpoint {
    datagram_tx: broadcast::Sender<Datagram>,
    stream_tx: mpsc::Sender<(DuplexStream, SocketAddr)>,
    alive: Arc<AtomicBool>,
}

#[derive(Default)]
struct NetworkInner {
    endpoints: DashMap<SocketAddr, Endpoint>,
    next_port: AtomicU16,
    drop_rate: RwLock<f64>,
    // unordered address pairs that can't reach each other
    blocked: DashSet<(SocketAddr, SocketAddr)>,
}

impl NetworkInner {
    fn is_blocked(&self, a: SocketAddr, b: SocketAddr) -> bool {
        self.blocked.contains(&link(a, b))
    }
}

fn link(a: SocketAddr, b: SocketAddr) -> (SocketAddr, SocketAddr) {
    if a <= b { (a, b) } else { (b, a) }
}

#[derive(Clone, Default)]
pub struct MemoryNetwork {
    inner: Arc<NetworkInner>,
}

impl MemoryNetwork {
    pub fn new() -> Self {
        Self::default()
    }

    /// Binds a transport on the next free loopback address.
    pub fn bind(&self) -> MemoryTransport {
        let port = FIRST_PORT + self.inner.next_port.fetch_add(1, Ordering::SeqCst);
        let addr = SocketAddr::new(IpAddr::V4(Ipv4Addr::LOCALHOST), port);

        let (datagram_tx, _) = broadcast::channel(DEFAULT_CHANNEL_BUFFER_SIZE);
        let (stream_tx, stream_rx) = mpsc::channel(DEFAULT_CHANNEL_BUFFER_SIZE);
        let (shutdown_signal, _) = broadcast::channel(1);
        let alive = Arc::new(AtomicBool::new(true));

        self.inner.endpoints.insert(addr, Endpoint {
            datagram_tx: datagram_tx.clone(),
            stream_tx,
            alive: alive.clone(),
        });

        MemoryTransport {
            addr,
            network: self.inner.clone(),
            datagram_tx,
            stream_rx: Mutex::new(stream_rx),
            alive,
            shutdown_signal,
        }
    }

    /// Crashes the endpoint at `addr`: it stops sending and receiving
    /// without telling anyone.
    pub fn kill(&self, addr: SocketAddr) -> bool {
        match self.inner.endpoints.remove(&addr) {
            Some((_, endpoint)) => {
                endpoint.alive.store(false, Ordering::SeqCst);
                true
            }
            None => false,
        }
    }

    /// Probability in `[0, 1]` that any datagram is lost.
    pub fn set_drop_rate(&self, rate: f64) {
        *self.inner.drop_rate.write() = rate.clamp(0.0, 1.0);
    }

    /// Cuts the link between `a` and `b` in both directions. Both keep
    /// talking to everyone else.
    pub fn block(&self, a: SocketAddr, b: SocketAddr) {
        self.inner.blocked.insert(link(a, b));
    }

    pub fn unblock(&self, a: SocketAddr, b: SocketAddr) {
        self.inner.blocked.remove(&link(a, b));
    }

    pub fn is_alive(&self, addr: SocketAddr) -> bool {
        self.inner.endpoints.contains_key(&addr)
    }
}

pub struct MemoryTransport {
    addr: SocketAddr,
    network: Arc<NetworkInner>,
    datagram_tx: broadcast::Sender<Datagram>,
    stream_rx: Mutex<mpsc::Receiver<(DuplexStream, SocketAddr)>>,
    alive: Arc<AtomicBool>,
    shutdown_signal: broadcast::Sender<()>,
}

impl MemoryTransport {
    fn is_alive(&self) -> bool {
        self.alive.load(Ordering::SeqCst)
    }

    fn should_drop(&self) -> bool {
        let rate = *self.network.drop_rate.read();
        rate > 0.0 && rand::thread_rng().gen_bool(rate)
    }
}

#[async_trait]
impl Transport for MemoryTransport {
    fn local_addr(&self) -> Result<SocketAddr> {
        Ok(self.addr)
    }

    fn incoming(&self) -> broadcast::Receiver<Datagram> {
        self.datagram_tx.subscribe()
    }

    async fn send_to(&self, target: SocketAddr, data: &[u8]) -> Result<()> {
        if !self.is_alive() || self.network.is_blocked(self.addr, target) || self.should_drop() {
            return Ok(());
        }
        if let Some(endpoint) = self.network.endpoints.get(&target) {
            let _ = endpoint.datagram_tx.send(Datagram {
                remote_addr: self.addr,
                data: data.to_vec(),
            });
        }
        Ok(())
    }

    async fn dial(&self, target: SocketAddr, timeout: Duration) -> Result<BoxedStream> {
        let refused = || MurmurError::Transport(format!("connection to {} refused", target));
        if !self.is_alive() || self.network.is_blocked(self.addr, target) {
            return Err(refused().into());
        }
        let stream_tx = match self.network.endpoints.get(&target) {
            Some(endpoint) => endpoint.stream_tx.clone(),
            None => return Err(refused().into()),
        };

        let (client, server) = tokio::io::duplex(STREAM_BUFFER_SIZE);
        tokio::time::timeout(timeout, stream_tx.send((server, self.addr))).await
            .map_err(|_| MurmurError::Transport(format!("connecting to {} timed out", target)))?
            .map_err(|_| refused())?;
        Ok(Box::new(client))
    }

    async fn accept(&self) -> Result<(BoxedStream, SocketAddr)> {
        let mut shutdown_rx = self.shutdown_signal.subscribe();
        let mut stream_rx = self.stream_rx.lock().await;
        tokio::select! {
            accepted = stream_rx.recv() => match accepted {
                Some((stream, from)) if self.is_alive() => Ok((Box::new(stream) as BoxedStream, from)),
                _ => Err(MurmurError::Transport("transport closed".into()).into()),
            },
            _ = shutdown_rx.recv() => Err(MurmurError::Transport("transport shut down".into()).into()),
        }
    }

    async fn shutdown(&self) -> Result<()> {
        self.alive.store(false, Ordering::SeqCst);
        self.network.endpoints.remove(&self.addr);
        let _ = self.shutdown_signal.send(());
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};

    #[tokio::test]
    async fn test_datagrams_between_endpoints() -> Result<()> {
        let network = MemoryNetwork::new();
        let a = network.bind();
        let b = network.bind();
        let mut incoming = b.incoming();

        a.send_to(b.local_addr()?, b"hi").await?;
        let datagram = incoming.recv().await?;
        assert_eq!(datagram.data, b"hi");
        assert_eq!(datagram.remote_addr, a.local_addr()?);
        Ok(())
    }

    #[tokio::test]
    async fn test_killed_endpoint_is_silent() -> Result<()> {
        let network = MemoryNetwork::new();
        let a = network.bind();
        let b = network.bind();
        let mut a_incoming = a.incoming();
        assert!(network.kill(b.local_addr()?));

        // sends to the dead node vanish, dials are refused
        a.send_to(b.local_addr()?, b"lost").await?;
        assert!(a.dial(b.local_addr()?, Duration::from_millis(50)).await.is_err());

        // the dead node cannot talk either
        b.send_to(a.local_addr()?, b"ghost").await?;
        assert!(a_incoming.try_recv().is_err());
        Ok(())
    }

    #[tokio::test]
    async fn test_blocked_link_only_cuts_that_pair() -> Result<()> {
        let network = MemoryNetwork::new();
        let a = network.bind();
        let b = network.bind();
        let c = network.bind();
        let mut a_incoming = a.incoming();
        let mut b_incoming = b.incoming();
        let mut c_incoming = c.incoming();
        network.block(a.local_addr()?, c.local_addr()?);

        a.send_to(c.local_addr()?, b"cut").await?;
        c.send_to(a.local_addr()?, b"cut").await?;
        assert!(a_incoming.try_recv().is_err());
        assert!(c_incoming.try_recv().is_err());
        assert!(a.dial(c.local_addr()?, Duration::from_millis(50)).await.is_err());

        // the detour still works
        a.send_to(b.local_addr()?, b"relay").await?;
        assert_eq!(b_incoming.recv().await?.data, b"relay");
        b.send_to(c.local_addr()?, b"relay").await?;
        assert_eq!(c_incoming.recv().await?.data, b"relay");

        network.unblock(c.local_addr()?, a.local_addr()?);
        a.send_to(c.local_addr()?, b"back").await?;
        assert_eq!(c_incoming.recv().await?.data, b"back");
        Ok(())
    }

    #[tokio::test]
    async fn test_full_drop_rate_loses_everything() -> Result<()> {
        let network = MemoryNetwork::new();
        network.set_drop_rate(1.0);
        let a = network.bind();
        let b = network.bind();
        let mut incoming = b.incoming();
        a.send_to(b.local_addr()?, b"x").await?;
        assert!(incoming.try_recv().is_err());
        Ok(())
    }

    #[tokio::test]
    async fn test_dial_and_accept() -> Result<()> {
        let network = MemoryNetwork::new();
        let a = network.bind();
        let b = Arc::new(network.bind());

        let server = {
            let b = b.clone();
            tokio::spawn(async move {
                let (mut stream, from) = b.accept().await?;
                stream.write_all(b"pong").await?;
                anyhow::Ok(from)
            })
        };

        let mut stream = a.dial(b.local_addr()?, Duration::from_secs(1)).await?;
        let mut buf = [0u8; 4];
        stream.read_exact(&mut buf).await?;
        assert_eq!(&buf, b"pong");
        assert_eq!(server.await??, a.local_addr()?);
        Ok(())
    }
}
