//! GB28181 passive receive boundary.
//!
//! Single-port mode shares one listener: the first RTP packet's SSRC routes
//! the connection to its pre-registered source. Multi-port mode binds one
//! listener per expected source and tears the listener down when that
//! session ends. The PS payload is opaque here; it goes to the source's
//! demux seam untouched.

use crate::source::SourceHandle;
use bytes::Bytes;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::io::AsyncReadExt;
use tokio::net::{TcpListener, TcpStream, UdpSocket};
use tokio_util::sync::CancellationToken;

pub const RTP_HEADER_SIZE: usize = 12;

#[derive(Debug, thiserror::Error)]
pub enum Gb28181Error {
    #[error("io: {0}")]
    Io(#[from] std::io::Error),

    #[error("malformed rtp packet")]
    MalformedRtp,

    #[error("no source registered for ssrc {0:#010x}")]
    UnknownSsrc(u32),
}

/// Pull the SSRC out of an RTP header, rejecting anything that is not v2.
pub fn parse_rtp_ssrc(data: &[u8]) -> Result<u32, Gb28181Error> {
    if data.len() < RTP_HEADER_SIZE || data[0] >> 6 != 2 {
        return Err(Gb28181Error::MalformedRtp);
    }
    Ok(u32::from_be_bytes([data[8], data[9], data[10], data[11]]))
}

/// SSRC → expected source mapping.
pub trait Filter: Send + Sync {
    fn find_source(&self, ssrc: u32) -> Option<SourceHandle>;
    fn remove_source(&self, ssrc: u32);
}

/// Single-port mode: many expected sources, routed by SSRC.
pub struct SsrcFilter {
    capacity: usize,
    sources: Mutex<HashMap<u32, SourceHandle>>,
}

impl SsrcFilter {
    #[must_use]
    pub fn new(capacity: usize) -> Arc<Self> {
        Arc::new(Self {
            capacity,
            sources: Mutex::new(HashMap::new()),
        })
    }

    /// Pre-register an expected publication. Returns false when the filter
    /// is full or the SSRC is taken.
    pub fn register_source(&self, ssrc: u32, handle: SourceHandle) -> bool {
        let mut sources = self.sources.lock();
        if sources.len() >= self.capacity || sources.contains_key(&ssrc) {
            return false;
        }
        sources.insert(ssrc, handle);
        true
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.sources.lock().len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.sources.lock().is_empty()
    }
}

impl Filter for SsrcFilter {
    fn find_source(&self, ssrc: u32) -> Option<SourceHandle> {
        self.sources.lock().get(&ssrc).cloned()
    }

    fn remove_source(&self, ssrc: u32) {
        self.sources.lock().remove(&ssrc);
    }
}

/// Multi-port mode: the port already identifies the source.
pub struct SingleFilter {
    source: SourceHandle,
}

impl SingleFilter {
    #[must_use]
    pub fn new(source: SourceHandle) -> Arc<Self> {
        Arc::new(Self { source })
    }
}

impl Filter for SingleFilter {
    fn find_source(&self, _ssrc: u32) -> Option<SourceHandle> {
        Some(self.source.clone())
    }

    fn remove_source(&self, _ssrc: u32) {}
}

/// TCP receive server for 2-byte length-prefixed RTP.
pub struct TcpServer {
    local_addr: SocketAddr,
    listener: TcpListener,
    filter: Arc<dyn Filter>,
    /// Multi-port servers stop accepting once their session completes.
    single_session: bool,
    cancel: CancellationToken,
}

impl TcpServer {
    pub async fn bind(
        addr: SocketAddr,
        filter: Arc<dyn Filter>,
        single_session: bool,
    ) -> Result<Self, Gb28181Error> {
        let listener = TcpListener::bind(addr).await?;
        let local_addr = listener.local_addr()?;
        Ok(Self {
            local_addr,
            listener,
            filter,
            single_session,
            cancel: CancellationToken::new(),
        })
    }

    #[must_use]
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Token that stops the accept loop on shutdown.
    #[must_use]
    pub fn cancel_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    pub fn spawn(self) -> tokio::task::JoinHandle<()> {
        tokio::spawn(self.run())
    }

    pub async fn run(self) {
        tracing::info!(addr = %self.local_addr, "gb28181 tcp receive listening");
        loop {
            let accepted = tokio::select! {
                _ = self.cancel.cancelled() => break,
                accepted = self.listener.accept() => accepted,
            };
            let (stream, peer) = match accepted {
                Ok(conn) => conn,
                Err(err) => {
                    tracing::error!(addr = %self.local_addr, "accept: {err}");
                    break;
                }
            };
            tracing::info!(%peer, "gb28181 tcp session opened");
            let filter = self.filter.clone();
            let session = tokio::spawn(run_tcp_session(stream, filter));

            if self.single_session {
                let _ = session.await;
                tracing::info!(addr = %self.local_addr, "multi-port session done, releasing port");
                break;
            }
        }
    }
}

/// Read length-prefixed RTP off one connection, binding it to a source on
/// the first packet's SSRC. A malformed packet or a routing miss closes
/// only this session and its bound source.
async fn run_tcp_session(mut stream: TcpStream, filter: Arc<dyn Filter>) {
    let mut bound: Option<(u32, SourceHandle)> = None;

    loop {
        let frame = match read_frame(&mut stream).await {
            Ok(Some(frame)) => frame,
            Ok(None) => break,
            Err(err) => {
                tracing::error!("gb28181 tcp read: {err}");
                break;
            }
        };

        let ssrc = match parse_rtp_ssrc(&frame) {
            Ok(ssrc) => ssrc,
            Err(err) => {
                tracing::error!("gb28181 rtp parse: {err}");
                break;
            }
        };

        if bound.is_none() {
            match filter.find_source(ssrc) {
                Some(handle) => bound = Some((ssrc, handle)),
                None => {
                    tracing::error!("no source for ssrc {ssrc:#010x}");
                    break;
                }
            }
        }

        if let Some((_, handle)) = bound.as_ref() {
            if let Err(err) = handle.input(frame) {
                tracing::warn!(source = handle.id(), "gb28181 input: {err}");
                break;
            }
        }
    }

    if let Some((ssrc, handle)) = bound {
        filter.remove_source(ssrc);
        handle.close().await;
    }
}

async fn read_frame(stream: &mut TcpStream) -> Result<Option<Bytes>, Gb28181Error> {
    let mut length = [0u8; 2];
    match stream.read_exact(&mut length).await {
        Ok(_) => {}
        Err(err) if err.kind() == std::io::ErrorKind::UnexpectedEof => return Ok(None),
        Err(err) => return Err(err.into()),
    }
    let length = usize::from(u16::from_be_bytes(length));
    if length == 0 {
        return Ok(Some(Bytes::new()));
    }
    let mut frame = vec![0u8; length];
    stream.read_exact(&mut frame).await?;
    Ok(Some(Bytes::from(frame)))
}

/// UDP receive server; datagrams are raw RTP. In multi-port mode the port
/// belongs to one source, passed as `bound_source` so a poisoned stream can
/// be torn down even when no SSRC is recoverable.
pub struct UdpServer {
    local_addr: SocketAddr,
    socket: UdpSocket,
    filter: Arc<dyn Filter>,
    bound_source: Option<SourceHandle>,
    cancel: CancellationToken,
}

impl UdpServer {
    pub async fn bind(addr: SocketAddr, filter: Arc<dyn Filter>) -> Result<Self, Gb28181Error> {
        Self::bind_with_source(addr, filter, None).await
    }

    pub async fn bind_with_source(
        addr: SocketAddr,
        filter: Arc<dyn Filter>,
        bound_source: Option<SourceHandle>,
    ) -> Result<Self, Gb28181Error> {
        let socket = UdpSocket::bind(addr).await?;
        let local_addr = socket.local_addr()?;
        Ok(Self {
            local_addr,
            socket,
            filter,
            bound_source,
            cancel: CancellationToken::new(),
        })
    }

    /// Token that stops the receive loop on shutdown.
    #[must_use]
    pub fn cancel_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    #[must_use]
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    pub fn spawn(self) -> tokio::task::JoinHandle<()> {
        tokio::spawn(self.run())
    }

    pub async fn run(self) {
        tracing::info!(addr = %self.local_addr, "gb28181 udp receive listening");
        let mut buf = vec![0u8; 64 * 1024];
        loop {
            let received = tokio::select! {
                _ = self.cancel.cancelled() => break,
                received = self.socket.recv_from(&mut buf) => received,
            };
            let (n, peer) = match received {
                Ok(received) => received,
                Err(err) => {
                    tracing::error!(addr = %self.local_addr, "recv: {err}");
                    break;
                }
            };

            match parse_rtp_ssrc(&buf[..n]) {
                Ok(ssrc) => match self.filter.find_source(ssrc) {
                    Some(handle) => {
                        if let Err(err) = handle.input(Bytes::copy_from_slice(&buf[..n])) {
                            tracing::warn!(source = handle.id(), "gb28181 input: {err}");
                        }
                    }
                    None => {
                        tracing::error!(%peer, "no source for ssrc {ssrc:#010x}");
                    }
                },
                Err(err) => {
                    tracing::error!(%peer, "gb28181 rtp parse: {err}");
                    // In multi-port mode the port maps to one source; a
                    // poisoned stream tears down that source alone. With a
                    // shared port no SSRC means nothing to tear down.
                    if let Some(handle) = self.bound_source.as_ref() {
                        handle.close().await;
                    }
                }
            }
        }
    }
}
