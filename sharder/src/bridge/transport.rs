//! Named-endpoint socket transport.
//!
//! The master binds an [`IpcServer`]; each worker connects with an
//! [`IpcClient`] and introduces itself with a `Hello` frame carrying its
//! endpoint name. Both sides then run the same [`Peer`] machinery: a writer
//! task draining an outbound queue and a reader task that resolves pending
//! replies and forwards incoming messages as [`Inbound`].

use std::fmt;
use std::path::PathBuf;
use std::str::FromStr;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use dashmap::DashMap;
use futures::{SinkExt, StreamExt};
use tokio::io::{AsyncRead, AsyncWrite, ReadHalf, WriteHalf};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{mpsc, oneshot};
use tokio_util::codec::{FramedRead, FramedWrite};
use tokio_util::sync::CancellationToken;

use super::codec::FrameCodec;
use super::error::TransportError;
use super::protocol::{ErrorPayload, Frame, IpcMessage, IpcResult};

const HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(5);

/// Where the master listens.
///
/// Parsed from a string: a bare port or `host:port` is TCP, anything else is a
/// unix socket path (an optional `unix:` prefix is stripped).
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum IpcAddress {
    Unix(PathBuf),
    Tcp(String),
}

impl FromStr for IpcAddress {
    type Err = TransportError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let s = s.trim();
        if s.is_empty() {
            return Err(TransportError::Unsupported(s.to_string()));
        }
        if let Some(path) = s.strip_prefix("unix:") {
            return Ok(Self::Unix(PathBuf::from(path)));
        }
        if let Some(addr) = s.strip_prefix("tcp://") {
            return Ok(Self::Tcp(addr.to_string()));
        }
        if s.parse::<u16>().is_ok() {
            return Ok(Self::Tcp(format!("127.0.0.1:{s}")));
        }
        let looks_like_path = s.starts_with('/') || s.starts_with('.') || s.starts_with('~');
        if !looks_like_path
            && let Some((host, port)) = s.rsplit_once(':')
            && !host.is_empty()
            && port.parse::<u16>().is_ok()
        {
            return Ok(Self::Tcp(s.to_string()));
        }
        Ok(Self::Unix(PathBuf::from(s)))
    }
}

impl fmt::Display for IpcAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Unix(path) => write!(f, "unix:{}", path.display()),
            Self::Tcp(addr) => write!(f, "tcp://{addr}"),
        }
    }
}

trait IpcStream: AsyncRead + AsyncWrite + Send + Unpin {}
impl<T: AsyncRead + AsyncWrite + Send + Unpin> IpcStream for T {}

type BoxStream = Box<dyn IpcStream>;
type FrameReader = FramedRead<ReadHalf<BoxStream>, FrameCodec<Frame>>;
type FrameWriter = FramedWrite<WriteHalf<BoxStream>, FrameCodec<Frame>>;

fn framed(stream: BoxStream) -> (FrameReader, FrameWriter) {
    let (read, write) = tokio::io::split(stream);
    (
        FramedRead::new(read, FrameCodec::new()),
        FramedWrite::new(write, FrameCodec::new()),
    )
}

/// A message received from a peer, with the means to answer it.
#[derive(Debug)]
pub struct Inbound {
    /// Endpoint name of the sender.
    pub from: String,
    pub message: IpcMessage,
    pub reply: ReplyTo,
}

/// Reply slot for an inbound message. Non-receptive messages accept and drop replies.
///
/// A receptive slot dropped without [`ReplyTo::send`] (including while a
/// handler unwinds) answers with a `NoReply` error so the requester never hangs.
#[derive(Debug)]
pub struct ReplyTo(Option<(u64, mpsc::UnboundedSender<Frame>)>);

impl ReplyTo {
    pub fn is_receptive(&self) -> bool {
        self.0.is_some()
    }

    pub fn send(mut self, result: IpcResult) {
        if let Some((id, outbound)) = self.0.take() {
            deliver(id, &outbound, result);
        }
    }
}

impl Drop for ReplyTo {
    fn drop(&mut self) {
        if let Some((id, outbound)) = self.0.take() {
            tracing::warn!(id, "Request dropped without a reply");
            let error = ErrorPayload::new("NoReply", "the handler ended without replying");
            deliver(id, &outbound, IpcResult::err(error));
        }
    }
}

fn deliver(id: u64, outbound: &mpsc::UnboundedSender<Frame>, result: IpcResult) {
    if outbound.send(Frame::Reply { id, result }).is_err() {
        tracing::debug!(id, "Reply dropped, connection closed");
    }
}

struct PeerInner {
    name: String,
    outbound: mpsc::UnboundedSender<Frame>,
    pending: DashMap<u64, oneshot::Sender<IpcResult>>,
    next_id: AtomicU64,
    closed: CancellationToken,
}

/// One end of an established connection.
#[derive(Clone)]
pub struct Peer {
    inner: Arc<PeerInner>,
}

impl fmt::Debug for Peer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Peer")
            .field("name", &self.inner.name)
            .field("pending", &self.inner.pending.len())
            .field("closed", &self.inner.closed.is_cancelled())
            .finish()
    }
}

impl Peer {
    fn start(
        name: String,
        reader: FrameReader,
        writer: FrameWriter,
        inbound: mpsc::UnboundedSender<Inbound>,
    ) -> Self {
        let (outbound_tx, outbound_rx) = mpsc::unbounded_channel();
        let peer = Self {
            inner: Arc::new(PeerInner {
                name,
                outbound: outbound_tx,
                pending: DashMap::new(),
                next_id: AtomicU64::new(1),
                closed: CancellationToken::new(),
            }),
        };

        tokio::spawn(write_loop(
            writer,
            outbound_rx,
            peer.inner.closed.clone(),
            peer.inner.name.clone(),
        ));
        tokio::spawn(read_loop(reader, Arc::clone(&peer.inner), inbound));
        peer
    }

    /// Endpoint name of the remote side.
    pub fn name(&self) -> &str {
        &self.inner.name
    }

    pub fn is_closed(&self) -> bool {
        self.inner.closed.is_cancelled()
    }

    /// Resolves once the connection is gone.
    pub async fn closed(&self) {
        self.inner.closed.cancelled().await
    }

    pub fn close(&self) {
        self.inner.closed.cancel();
    }

    fn same(&self, other: &Peer) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }

    /// Send a message. Receptive sends wait for the peer's reply; the others
    /// resolve immediately with [`IpcResult::empty`].
    pub async fn send(
        &self,
        message: IpcMessage,
        receptive: bool,
    ) -> Result<IpcResult, TransportError> {
        let disconnected = || TransportError::Disconnected(self.inner.name.clone());
        if self.is_closed() {
            return Err(disconnected());
        }

        if !receptive {
            self.inner
                .outbound
                .send(Frame::Message { id: None, message })
                .map_err(|_| disconnected())?;
            return Ok(IpcResult::empty());
        }

        let id = self.inner.next_id.fetch_add(1, Ordering::Relaxed);
        let (tx, rx) = oneshot::channel();
        self.inner.pending.insert(id, tx);

        // The reader clears pending after cancelling; re-check so a late
        // insert cannot wait forever.
        if self.is_closed()
            || self
                .inner
                .outbound
                .send(Frame::Message {
                    id: Some(id),
                    message,
                })
                .is_err()
        {
            self.inner.pending.remove(&id);
            return Err(disconnected());
        }

        rx.await.map_err(|_| disconnected())
    }
}

async fn write_loop(
    mut writer: FrameWriter,
    mut outbound: mpsc::UnboundedReceiver<Frame>,
    closed: CancellationToken,
    name: String,
) {
    loop {
        tokio::select! {
            biased;
            frame = outbound.recv() => {
                let Some(frame) = frame else { break };
                if let Err(e) = writer.send(frame).await {
                    tracing::debug!(peer = %name, error = %e, "Write failed");
                    break;
                }
            }
            _ = closed.cancelled() => {
                // Flush whatever was queued before the close.
                while let Ok(frame) = outbound.try_recv() {
                    if writer.send(frame).await.is_err() {
                        break;
                    }
                }
                break;
            }
        }
    }
    let _ = writer.close().await;
    closed.cancel();
}

async fn read_loop(
    mut reader: FrameReader,
    peer: Arc<PeerInner>,
    inbound: mpsc::UnboundedSender<Inbound>,
) {
    loop {
        let next = tokio::select! {
            _ = peer.closed.cancelled() => break,
            next = reader.next() => next,
        };

        match next {
            Some(Ok(Frame::Reply { id, result })) => match peer.pending.remove(&id) {
                Some((_, tx)) => {
                    let _ = tx.send(result);
                }
                None => tracing::debug!(peer = %peer.name, id, "Reply for unknown request"),
            },
            Some(Ok(Frame::Message { id, message })) => {
                let reply = ReplyTo(id.map(|id| (id, peer.outbound.clone())));
                let item = Inbound {
                    from: peer.name.clone(),
                    message,
                    reply,
                };
                if inbound.send(item).is_err() {
                    tracing::debug!(peer = %peer.name, "Inbound receiver dropped");
                    break;
                }
            }
            Some(Ok(Frame::Hello { name })) => {
                tracing::debug!(peer = %peer.name, hello = %name, "Ignoring repeated hello");
            }
            Some(Err(e)) => {
                tracing::warn!(peer = %peer.name, error = %e, "Failed to read frame");
                break;
            }
            None => {
                tracing::debug!(peer = %peer.name, "Connection closed by peer");
                break;
            }
        }
    }

    peer.closed.cancel();
    // Dropping the senders fails every in-flight request with Disconnected.
    peer.pending.clear();
}

enum Listener {
    #[cfg(unix)]
    Unix(tokio::net::UnixListener),
    Tcp(TcpListener),
}

impl Listener {
    async fn bind(address: &IpcAddress) -> Result<(Self, IpcAddress), TransportError> {
        let bind_err = |source| TransportError::Bind {
            address: address.to_string(),
            source,
        };
        match address {
            #[cfg(unix)]
            IpcAddress::Unix(path) => {
                if path.exists() {
                    tracing::debug!(path = %path.display(), "Removing stale socket");
                    std::fs::remove_file(path).map_err(bind_err)?;
                }
                let listener = tokio::net::UnixListener::bind(path).map_err(bind_err)?;
                Ok((Self::Unix(listener), address.clone()))
            }
            #[cfg(not(unix))]
            IpcAddress::Unix(_) => Err(TransportError::Unsupported(address.to_string())),
            IpcAddress::Tcp(addr) => {
                let listener = TcpListener::bind(addr).await.map_err(bind_err)?;
                let local = listener.local_addr().map_err(bind_err)?;
                Ok((Self::Tcp(listener), IpcAddress::Tcp(local.to_string())))
            }
        }
    }

    async fn accept(&self) -> std::io::Result<BoxStream> {
        match self {
            #[cfg(unix)]
            Self::Unix(listener) => {
                let (stream, _) = listener.accept().await?;
                Ok(Box::new(stream))
            }
            Self::Tcp(listener) => {
                let (stream, _) = listener.accept().await?;
                stream.set_nodelay(true)?;
                Ok(Box::new(stream))
            }
        }
    }
}

/// Listening side: accepts named connections and routes by endpoint name.
pub struct IpcServer {
    name: String,
    address: IpcAddress,
    peers: Arc<DashMap<String, Peer>>,
    shutdown: CancellationToken,
}

impl fmt::Debug for IpcServer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("IpcServer")
            .field("name", &self.name)
            .field("address", &self.address)
            .field("peers", &self.peers.len())
            .finish()
    }
}

impl IpcServer {
    /// Bind and start accepting. Messages from every peer arrive on the receiver.
    pub async fn bind(
        address: &IpcAddress,
        name: impl Into<String>,
    ) -> Result<(Arc<Self>, mpsc::UnboundedReceiver<Inbound>), TransportError> {
        let (listener, bound) = Listener::bind(address).await?;
        let (inbound_tx, inbound_rx) = mpsc::unbounded_channel();

        let server = Arc::new(Self {
            name: name.into(),
            address: bound,
            peers: Arc::new(DashMap::new()),
            shutdown: CancellationToken::new(),
        });
        tracing::info!(endpoint = %server.name, address = %server.address, "IPC server listening");

        tokio::spawn(accept_loop(
            listener,
            Arc::clone(&server.peers),
            inbound_tx,
            server.shutdown.clone(),
        ));
        Ok((server, inbound_rx))
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Actual bound address (a TCP port of 0 is resolved).
    pub fn address(&self) -> &IpcAddress {
        &self.address
    }

    pub fn endpoints(&self) -> Vec<String> {
        let mut names: Vec<String> = self.peers.iter().map(|e| e.key().clone()).collect();
        names.sort();
        names
    }

    pub fn is_connected(&self, endpoint: &str) -> bool {
        self.peers.get(endpoint).is_some_and(|p| !p.is_closed())
    }

    pub fn peer(&self, endpoint: &str) -> Option<Peer> {
        self.peers.get(endpoint).map(|p| p.clone())
    }

    /// Send to one named endpoint.
    pub async fn send_to(
        &self,
        endpoint: &str,
        message: IpcMessage,
        receptive: bool,
    ) -> Result<IpcResult, TransportError> {
        let peer = self
            .peer(endpoint)
            .ok_or_else(|| TransportError::UnknownEndpoint(endpoint.to_string()))?;
        peer.send(message, receptive).await
    }

    /// Send to every connected endpoint accepted by `filter`, concurrently.
    pub async fn broadcast(
        &self,
        message: &IpcMessage,
        receptive: bool,
        filter: impl Fn(&str) -> bool,
    ) -> Vec<(String, Result<IpcResult, TransportError>)> {
        let targets: Vec<Peer> = self
            .peers
            .iter()
            .filter(|e| filter(e.key()))
            .map(|e| e.value().clone())
            .collect();

        futures::future::join_all(targets.into_iter().map(|peer| {
            let message = message.clone();
            async move {
                let result = peer.send(message, receptive).await;
                (peer.name().to_string(), result)
            }
        }))
        .await
    }

    /// Stop accepting and drop every connection.
    pub fn close(&self) {
        self.shutdown.cancel();
        for entry in self.peers.iter() {
            entry.value().close();
        }
        self.peers.clear();
    }
}

impl Drop for IpcServer {
    fn drop(&mut self) {
        self.close();
        if let IpcAddress::Unix(path) = &self.address
            && let Err(e) = std::fs::remove_file(path)
            && e.kind() != std::io::ErrorKind::NotFound
        {
            tracing::warn!(path = %path.display(), error = %e, "Failed to remove socket");
        }
    }
}

async fn accept_loop(
    listener: Listener,
    peers: Arc<DashMap<String, Peer>>,
    inbound: mpsc::UnboundedSender<Inbound>,
    shutdown: CancellationToken,
) {
    loop {
        let stream = tokio::select! {
            _ = shutdown.cancelled() => break,
            accepted = listener.accept() => match accepted {
                Ok(stream) => stream,
                Err(e) => {
                    tracing::warn!(error = %e, "Accept failed");
                    continue;
                }
            },
        };

        let peers = Arc::clone(&peers);
        let inbound = inbound.clone();
        tokio::spawn(async move {
            if let Err(e) = register(stream, peers, inbound).await {
                tracing::warn!(error = %e, "Rejected IPC connection");
            }
        });
    }
    tracing::debug!("IPC accept loop stopped");
}

async fn register(
    stream: BoxStream,
    peers: Arc<DashMap<String, Peer>>,
    inbound: mpsc::UnboundedSender<Inbound>,
) -> Result<(), TransportError> {
    let (mut reader, writer) = framed(stream);

    let first = tokio::time::timeout(HANDSHAKE_TIMEOUT, reader.next())
        .await
        .map_err(|_| TransportError::Handshake("timed out waiting for hello".into()))?;
    let name = match first {
        Some(Ok(Frame::Hello { name })) if !name.is_empty() => name,
        Some(Ok(other)) => {
            return Err(TransportError::Handshake(format!(
                "expected hello, got {other:?}"
            )));
        }
        Some(Err(e)) => return Err(TransportError::Handshake(e.to_string())),
        None => return Err(TransportError::Handshake("closed before hello".into())),
    };

    let peer = Peer::start(name.clone(), reader, writer, inbound);
    if let Some(previous) = peers.insert(name.clone(), peer.clone()) {
        tracing::info!(endpoint = %name, "Endpoint reconnected, replacing old connection");
        previous.close();
    }
    tracing::debug!(endpoint = %name, "Endpoint connected");

    tokio::spawn(async move {
        peer.closed().await;
        peers.remove_if(&name, |_, current| current.same(&peer));
        tracing::debug!(endpoint = %name, "Endpoint disconnected");
    });
    Ok(())
}

/// Connecting side, used by workers.
#[derive(Debug, Clone)]
pub struct IpcClient {
    peer: Peer,
}

impl IpcClient {
    /// Connect and announce `name`. Messages from the server arrive on the receiver.
    pub async fn connect(
        address: &IpcAddress,
        name: impl Into<String>,
        server_name: impl Into<String>,
    ) -> Result<(Self, mpsc::UnboundedReceiver<Inbound>), TransportError> {
        let name = name.into();
        let connect_err = |source| TransportError::Connect {
            address: address.to_string(),
            source,
        };

        let stream: BoxStream = match address {
            #[cfg(unix)]
            IpcAddress::Unix(path) => Box::new(
                tokio::net::UnixStream::connect(path)
                    .await
                    .map_err(connect_err)?,
            ),
            #[cfg(not(unix))]
            IpcAddress::Unix(_) => return Err(TransportError::Unsupported(address.to_string())),
            IpcAddress::Tcp(addr) => {
                let stream = TcpStream::connect(addr).await.map_err(connect_err)?;
                stream.set_nodelay(true).map_err(connect_err)?;
                Box::new(stream)
            }
        };

        let (reader, mut writer) = framed(stream);
        writer
            .send(Frame::Hello { name: name.clone() })
            .await
            .map_err(connect_err)?;

        let (inbound_tx, inbound_rx) = mpsc::unbounded_channel();
        let peer = Peer::start(server_name.into(), reader, writer, inbound_tx);
        tracing::debug!(endpoint = %name, address = %address, "Connected to IPC server");
        Ok((Self { peer }, inbound_rx))
    }

    pub async fn send(
        &self,
        message: IpcMessage,
        receptive: bool,
    ) -> Result<IpcResult, TransportError> {
        self.peer.send(message, receptive).await
    }

    pub fn is_connected(&self) -> bool {
        !self.peer.is_closed()
    }

    pub async fn closed(&self) {
        self.peer.closed().await
    }

    pub fn close(&self) {
        self.peer.close()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_addresses() {
        assert_eq!(
            "8191".parse::<IpcAddress>().unwrap(),
            IpcAddress::Tcp("127.0.0.1:8191".into())
        );
        assert_eq!(
            "0.0.0.0:9000".parse::<IpcAddress>().unwrap(),
            IpcAddress::Tcp("0.0.0.0:9000".into())
        );
        assert_eq!(
            "localhost:9000".parse::<IpcAddress>().unwrap(),
            IpcAddress::Tcp("localhost:9000".into())
        );
        assert_eq!(
            "/tmp/sharder.sock".parse::<IpcAddress>().unwrap(),
            IpcAddress::Unix("/tmp/sharder.sock".into())
        );
        assert_eq!(
            "unix:relative.sock".parse::<IpcAddress>().unwrap(),
            IpcAddress::Unix("relative.sock".into())
        );
        assert!("".parse::<IpcAddress>().is_err());
    }

    #[test]
    fn display_round_trips() {
        for raw in ["unix:/run/sharder.sock", "tcp://127.0.0.1:8191"] {
            let addr: IpcAddress = raw.parse().unwrap();
            assert_eq!(addr.to_string(), raw);
        }
    }

    #[test]
    fn non_receptive_reply_is_dropped() {
        let reply = ReplyTo(None);
        assert!(!reply.is_receptive());
        reply.send(IpcResult::empty());
    }

    #[test]
    fn dropped_receptive_reply_answers_with_error() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        drop(ReplyTo(Some((7, tx.clone()))));
        let Ok(Frame::Reply { id, result }) = rx.try_recv() else {
            panic!("expected a reply frame");
        };
        assert_eq!(id, 7);
        assert_eq!(result.into_outcome().unwrap_err().name, "NoReply");

        ReplyTo(Some((8, tx))).send(IpcResult::empty());
        let Ok(Frame::Reply { id, result }) = rx.try_recv() else {
            panic!("expected a reply frame");
        };
        assert_eq!(id, 8);
        assert_eq!(result, IpcResult::empty());
        assert!(rx.try_recv().is_err());
    }
}
