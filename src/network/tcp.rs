use crate::model::PeerId;
use crate::network::messages::{read_frame, write_frame, FrameError};
use crate::network::transport::{
    Link, LinkError, LinkId, Transport, TransportError, TransportEvent, TransportEventSender,
};
use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::io::AsyncWriteExt;
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{broadcast, mpsc};

// ── Constants ───────────────────────────────────────────────────────────────

/// Default TCP port for a room host.
pub const DEFAULT_PORT: u16 = 17401;

// ── Peer directory ──────────────────────────────────────────────────────────

/// Identity → listen address book. Plays the part of the signaling server:
/// dialing an identity that is not listed fails with `PeerUnavailable`.
#[derive(Debug, Clone, Default)]
pub struct PeerDirectory {
    entries: Arc<RwLock<HashMap<PeerId, SocketAddr>>>,
}

impl PeerDirectory {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&self, id: PeerId, addr: SocketAddr) {
        self.entries.write().insert(id, addr);
    }

    pub fn remove(&self, id: &PeerId) {
        self.entries.write().remove(id);
    }

    pub fn resolve(&self, id: &PeerId) -> Option<SocketAddr> {
        self.entries.read().get(id).copied()
    }
}

/// First frame on every stream: who is dialing.
#[derive(Debug, Serialize, Deserialize)]
struct Hello {
    peer: PeerId,
}

// ── TcpTransport ────────────────────────────────────────────────────────────

struct Bound {
    id: PeerId,
    events: TransportEventSender,
    local_addr: SocketAddr,
    accept_handle: tokio::task::JoinHandle<()>,
    /// Cancels per-link reader tasks on unbind.
    shutdown_tx: broadcast::Sender<()>,
}

/// Link transport over plain TCP streams with length-prefixed frames.
///
/// Must be bound from inside a tokio runtime.
pub struct TcpTransport {
    listen_addr: SocketAddr,
    directory: PeerDirectory,
    bound: Mutex<Option<Bound>>,
}

impl TcpTransport {
    pub fn new(listen_addr: SocketAddr, directory: PeerDirectory) -> Self {
        Self {
            listen_addr,
            directory,
            bound: Mutex::new(None),
        }
    }

    pub fn directory(&self) -> &PeerDirectory {
        &self.directory
    }

    /// Address actually listened on, once bound (resolves port 0).
    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.bound.lock().as_ref().map(|b| b.local_addr)
    }

    fn spawn_accept_loop(
        listener: TcpListener,
        events: TransportEventSender,
        shutdown_tx: broadcast::Sender<()>,
    ) -> tokio::task::JoinHandle<()> {
        tokio::spawn(async move {
            loop {
                let (stream, addr) = match listener.accept().await {
                    Ok(v) => v,
                    Err(e) => {
                        log::error!("TCP accept error: {e}");
                        continue;
                    }
                };
                let events = events.clone();
                let shutdown_rx = shutdown_tx.subscribe();
                tokio::spawn(async move {
                    let (mut reader, writer) = stream.into_split();
                    let hello = match read_frame(&mut reader).await {
                        Ok(frame) => serde_json::from_slice::<Hello>(&frame),
                        Err(e) => {
                            log::info!("Connection from {addr} dropped before hello: {e}");
                            return;
                        }
                    };
                    let hello = match hello {
                        Ok(h) => h,
                        Err(e) => {
                            log::warn!("Connection from {addr} sent a bad hello: {e}");
                            return;
                        }
                    };

                    log::info!("Accepted link from {} ({addr})", hello.peer);
                    let (link, commands_rx, closed) = TcpLink::new(hello.peer.clone());
                    let link_id = link.id;
                    let _ = events.send(TransportEvent::Incoming(Box::new(link)));
                    let _ = events.send(TransportEvent::Opened {
                        link: link_id,
                        peer: hello.peer.clone(),
                    });
                    run_link(
                        link_id,
                        hello.peer,
                        reader,
                        writer,
                        commands_rx,
                        closed,
                        events,
                        shutdown_rx,
                    );
                });
            }
        })
    }
}

impl Transport for TcpTransport {
    fn bind(&self, id: &PeerId, events: TransportEventSender) -> Result<(), TransportError> {
        let mut bound = self.bound.lock();
        if let Some(b) = bound.as_ref() {
            return Err(TransportError::AlreadyBound(b.id.clone()));
        }

        let std_listener = std::net::TcpListener::bind(self.listen_addr)
            .map_err(|e| TransportError::Offline(format!("bind {}: {e}", self.listen_addr)))?;
        std_listener
            .set_nonblocking(true)
            .map_err(|e| TransportError::Offline(e.to_string()))?;
        let listener =
            TcpListener::from_std(std_listener).map_err(|e| TransportError::Offline(e.to_string()))?;
        let local_addr = listener
            .local_addr()
            .map_err(|e| TransportError::Offline(e.to_string()))?;
        log::info!("TCP transport for {id} listening on {local_addr}");

        self.directory.insert(id.clone(), local_addr);
        let (shutdown_tx, _) = broadcast::channel::<()>(1);
        let accept_handle =
            Self::spawn_accept_loop(listener, events.clone(), shutdown_tx.clone());

        *bound = Some(Bound {
            id: id.clone(),
            events,
            local_addr,
            accept_handle,
            shutdown_tx,
        });
        Ok(())
    }

    fn unbind(&self, id: &PeerId) {
        let mut bound = self.bound.lock();
        if bound.as_ref().map(|b| &b.id) != Some(id) {
            return;
        }
        if let Some(b) = bound.take() {
            b.accept_handle.abort();
            let _ = b.shutdown_tx.send(());
            self.directory.remove(&b.id);
            log::info!("TCP transport for {id} stopped");
        }
    }

    fn connect(&self, local: &PeerId, remote: &PeerId) -> Result<Box<dyn Link>, TransportError> {
        let (events, shutdown_rx) = {
            let bound = self.bound.lock();
            match bound.as_ref() {
                Some(b) if &b.id == local => (b.events.clone(), b.shutdown_tx.subscribe()),
                _ => return Err(TransportError::NotBound(local.clone())),
            }
        };

        let (link, commands_rx, closed) = TcpLink::new(remote.clone());
        let link_id = link.id;
        let target = self.directory.resolve(remote);
        let local = local.clone();
        let remote = remote.clone();

        tokio::spawn(async move {
            let unavailable = |events: &TransportEventSender| {
                let _ = events.send(TransportEvent::Error {
                    link: link_id,
                    peer: remote.clone(),
                    error: LinkError::PeerUnavailable(remote.clone()),
                });
            };

            let Some(addr) = target else {
                log::info!("No address known for {remote}");
                unavailable(&events);
                return;
            };

            let mut stream = match TcpStream::connect(addr).await {
                Ok(s) => s,
                Err(e) => {
                    if !closed.load(Ordering::SeqCst) {
                        log::info!("Connect to {remote} at {addr} failed: {e}");
                        unavailable(&events);
                    }
                    return;
                }
            };
            // Closed while dialing: the remote must never see this stream.
            if closed.load(Ordering::SeqCst) {
                log::debug!("Dial of {remote} abandoned before hello");
                let _ = stream.shutdown().await;
                return;
            }
            let (reader, mut writer) = stream.into_split();

            let hello = match serde_json::to_vec(&Hello { peer: local }) {
                Ok(h) => h,
                Err(e) => {
                    log::error!("Failed to encode hello: {e}");
                    return;
                }
            };
            if let Err(e) = write_frame(&mut writer, &hello).await {
                let _ = events.send(TransportEvent::Error {
                    link: link_id,
                    peer: remote.clone(),
                    error: LinkError::Io(e.to_string()),
                });
                return;
            }

            if closed.load(Ordering::SeqCst) {
                log::debug!("Dial of {remote} abandoned after hello");
                let _ = writer.shutdown().await;
                return;
            }
            log::info!("Connected to {remote} at {addr}");
            let _ = events.send(TransportEvent::Opened {
                link: link_id,
                peer: remote.clone(),
            });
            run_link(
                link_id,
                remote,
                reader,
                writer,
                commands_rx,
                closed,
                events,
                shutdown_rx,
            );
        });

        Ok(Box::new(link))
    }
}

impl Drop for TcpTransport {
    fn drop(&mut self) {
        if let Some(b) = self.bound.lock().take() {
            b.accept_handle.abort();
            let _ = b.shutdown_tx.send(());
        }
    }
}

// ── TcpLink ─────────────────────────────────────────────────────────────────

#[derive(Debug)]
enum LinkCommand {
    Send(Vec<u8>),
    Close,
}

/// Handle to one TCP stream. Writes are queued to a writer task so `send`
/// never blocks the caller.
#[derive(Debug)]
pub struct TcpLink {
    id: LinkId,
    remote: PeerId,
    commands: mpsc::UnboundedSender<LinkCommand>,
    /// Set once we close locally; suppresses the `Closed` event for our own close.
    closed: Arc<AtomicBool>,
}

impl TcpLink {
    fn new(remote: PeerId) -> (Self, mpsc::UnboundedReceiver<LinkCommand>, Arc<AtomicBool>) {
        let (commands, commands_rx) = mpsc::unbounded_channel();
        let closed = Arc::new(AtomicBool::new(false));
        let link = Self {
            id: LinkId::next(),
            remote,
            commands,
            closed: Arc::clone(&closed),
        };
        (link, commands_rx, closed)
    }
}

impl Link for TcpLink {
    fn id(&self) -> LinkId {
        self.id
    }

    fn remote(&self) -> &PeerId {
        &self.remote
    }

    fn send(&self, bytes: Vec<u8>) -> Result<(), LinkError> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(LinkError::Closed);
        }
        self.commands
            .send(LinkCommand::Send(bytes))
            .map_err(|_| LinkError::Closed)
    }

    fn close(&self) -> Result<(), LinkError> {
        if !self.closed.swap(true, Ordering::SeqCst) {
            let _ = self.commands.send(LinkCommand::Close);
        }
        Ok(())
    }
}

/// Spawn the writer and reader tasks of one established stream.
#[allow(clippy::too_many_arguments)]
fn run_link(
    link: LinkId,
    peer: PeerId,
    mut reader: OwnedReadHalf,
    mut writer: OwnedWriteHalf,
    mut commands_rx: mpsc::UnboundedReceiver<LinkCommand>,
    closed: Arc<AtomicBool>,
    events: TransportEventSender,
    mut shutdown_rx: broadcast::Receiver<()>,
) {
    let writer_events = events.clone();
    let writer_peer = peer.clone();
    tokio::spawn(async move {
        while let Some(cmd) = commands_rx.recv().await {
            match cmd {
                LinkCommand::Send(bytes) => {
                    if let Err(e) = write_frame(&mut writer, &bytes).await {
                        log::info!("Write to {writer_peer} failed: {e}");
                        let _ = writer_events.send(TransportEvent::Error {
                            link,
                            peer: writer_peer.clone(),
                            error: LinkError::Io(e.to_string()),
                        });
                        break;
                    }
                }
                LinkCommand::Close => {
                    let _ = writer.shutdown().await;
                    break;
                }
            }
        }
        log::debug!("Writer for {link} exiting");
    });

    tokio::spawn(async move {
        loop {
            tokio::select! {
                result = read_frame(&mut reader) => {
                    match result {
                        Ok(bytes) => {
                            log::debug!("{peer}: received {} bytes", bytes.len());
                            let _ = events.send(TransportEvent::Data {
                                link,
                                peer: peer.clone(),
                                bytes,
                            });
                        }
                        Err(FrameError::Io(ref e))
                            if e.kind() == std::io::ErrorKind::UnexpectedEof =>
                        {
                            log::info!("{peer}: connection closed (EOF)");
                            break;
                        }
                        Err(e) => {
                            log::info!("{peer}: read error: {e}");
                            if !closed.load(Ordering::SeqCst) {
                                let _ = events.send(TransportEvent::Error {
                                    link,
                                    peer: peer.clone(),
                                    error: LinkError::Io(e.to_string()),
                                });
                            }
                            return;
                        }
                    }
                }
                _ = shutdown_rx.recv() => {
                    log::debug!("{peer}: shutdown signal");
                    return;
                }
            }
        }

        if !closed.swap(true, Ordering::SeqCst) {
            let _ = events.send(TransportEvent::Closed { link, peer });
        }
    });
}

// ── Tests ───────────────────────────────────────────────────────────────────
