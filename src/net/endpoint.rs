use std::{net::SocketAddr, sync::Arc};

use hashbrown::HashMap;
use tokio::{
    net::{
        tcp::{OwnedReadHalf, OwnedWriteHalf},
        TcpListener, TcpStream,
    },
    select,
    sync::{mpsc, oneshot, RwLock},
    task::{JoinHandle, JoinSet},
};
use tracing::{debug, debug_span, trace, warn, Instrument};

use super::{
    error::Error,
    frame::{FrameRecvStream, FrameSendStream},
    Address, Frame, Frames,
};

/// A message queued for a peer's writer task. `written` fires once the
/// frames have been handed to the socket.
struct Outbound {
    frames: Frames,
    written: Option<oneshot::Sender<()>>,
}

type PeerTable = HashMap<Address, mpsc::UnboundedSender<Outbound>>;
type Peers = Arc<RwLock<PeerTable>>;

/// The bind side of a channel. Every accepted connection gets a fresh
/// [`Address`] which is prepended to each message received from it, and
/// outgoing messages are delivered to the peer named by their first frame.
///
/// Dropping the router closes the listener and every connection.
pub struct Router {
    local_addr: SocketAddr,
    peers: Peers,
    inbound_rx: mpsc::UnboundedReceiver<Frames>,
    acceptor: JoinHandle<()>,
}

impl Router {
    pub async fn bind(addr: SocketAddr) -> Result<Self, Error> {
        let listener = TcpListener::bind(addr).await?;
        let local_addr = listener.local_addr()?;
        let peers: Peers = Arc::new(RwLock::new(HashMap::new()));
        let (inbound_tx, inbound_rx) = mpsc::unbounded_channel();
        let acceptor = tokio::spawn(
            Self::start_acceptor(listener, peers.clone(), inbound_tx)
                .instrument(debug_span!("router", local = %local_addr)),
        );
        Ok(Router {
            local_addr,
            peers,
            inbound_rx,
            acceptor,
        })
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Receives the next message, routing address first. Cancel safe.
    pub async fn recv(&mut self) -> Option<Frames> {
        self.inbound_rx.recv().await
    }

    /// Sends `frames[1..]` to the peer addressed by `frames[0]`. Messages for
    /// unknown or departed peers are dropped; returns whether the message was
    /// queued.
    pub async fn send(&self, frames: Frames) -> bool {
        self.enqueue(frames, None).await
    }

    /// Like [`Router::send`], but resolves only once the message has been
    /// written to the peer's socket. Returns false if it never was.
    pub async fn send_written(&self, frames: Frames) -> bool {
        let (written_tx, written_rx) = oneshot::channel();
        if !self.enqueue(frames, Some(written_tx)).await {
            return false;
        }
        written_rx.await.is_ok()
    }

    async fn enqueue(
        &self,
        mut frames: Frames,
        written: Option<oneshot::Sender<()>>,
    ) -> bool {
        if frames.is_empty() {
            return false;
        }
        let address = frames.remove(0);
        match self.peers.read().await.get(address.as_slice()) {
            Some(tx) => tx.send(Outbound { frames, written }).is_ok(),
            None => {
                debug!(
                    peer = %Address::from(address),
                    "no route to peer, dropping message"
                );
                false
            }
        }
    }

    /// Accepts connections until the router is dropped. Connection tasks live
    /// in a `JoinSet` owned by this future, so aborting it closes them all.
    async fn start_acceptor(
        listener: TcpListener,
        peers: Peers,
        inbound_tx: mpsc::UnboundedSender<Frames>,
    ) {
        let mut connections = JoinSet::new();
        loop {
            select! {
                accepted = listener.accept() => {
                    let (stream, remote) = match accepted {
                        Ok(accepted) => accepted,
                        Err(e) => {
                            warn!("failed to accept connection: {}", e);
                            continue;
                        }
                    };
                    if let Err(e) = stream.set_nodelay(true) {
                        trace!("no TCP_NODELAY for {}: {}", remote, e);
                    }
                    let (read, write) = stream.into_split();
                    let (outbound_tx, outbound_rx) = mpsc::unbounded_channel();
                    let address = {
                        let mut peers = peers.write().await;
                        let address = Self::new_address(&peers);
                        peers.insert(address.clone(), outbound_tx);
                        address
                    };
                    debug!(peer = %address, %remote, "accepted connection");

                    let span = debug_span!("peer", peer = %address);
                    let reader = Self::read_loop(
                        address,
                        read,
                        peers.clone(),
                        inbound_tx.clone(),
                    );
                    connections.spawn(reader.instrument(span.clone()));
                    connections.spawn(
                        Self::write_loop(write, outbound_rx).instrument(span),
                    );
                }
                Some(_) = connections.join_next() => {}
            }
        }
    }

    /// A zero byte followed by four random bytes, unique among current peers.
    fn new_address(peers: &PeerTable) -> Address {
        loop {
            let mut bytes = vec![0u8];
            bytes.extend_from_slice(&rand::random::<[u8; 4]>());
            let address = Address::from(bytes);
            if !peers.contains_key(&address) {
                return address;
            }
        }
    }

    async fn read_loop(
        address: Address,
        read: OwnedReadHalf,
        peers: Peers,
        inbound_tx: mpsc::UnboundedSender<Frames>,
    ) {
        let mut stream = FrameRecvStream::new(read);
        loop {
            match stream.recv().await {
                Ok(frames) => {
                    let mut routed = Vec::with_capacity(frames.len() + 1);
                    routed.push(address.as_bytes().to_vec());
                    routed.extend(frames);
                    if inbound_tx.send(routed).is_err() {
                        break;
                    }
                }
                Err(Error::ConnectionClosed) => {
                    debug!("peer disconnected");
                    break;
                }
                Err(e) => {
                    warn!("dropping peer: {}", e);
                    break;
                }
            }
        }
        // removing the sender ends the write loop
        peers.write().await.remove(&address);
    }

    async fn write_loop(
        write: OwnedWriteHalf,
        mut outbound_rx: mpsc::UnboundedReceiver<Outbound>,
    ) {
        let mut stream = FrameSendStream::new(write);
        while let Some(outbound) = outbound_rx.recv().await {
            let Outbound { frames, written } = outbound;
            if let Err(e) = stream.send(&frames).await {
                warn!("failed to write to peer: {}", e);
                break;
            }
            if let Some(written) = written {
                let _ = written.send(());
            }
        }
    }
}

impl Drop for Router {
    fn drop(&mut self) {
        self.acceptor.abort();
    }
}

/// The connect side of a channel: sends and receives bare messages over a
/// single connection. Inbound messages are read by a background task, so
/// [`Dealer::recv`] is cancel safe.
pub struct Dealer {
    remote: SocketAddr,
    send_stream: FrameSendStream<OwnedWriteHalf>,
    inbound_rx: mpsc::UnboundedReceiver<Frames>,
    reader: JoinHandle<()>,
}

impl Dealer {
    pub async fn connect(remote: SocketAddr) -> Result<Self, Error> {
        let stream = TcpStream::connect(remote).await?;
        if let Err(e) = stream.set_nodelay(true) {
            trace!("no TCP_NODELAY for {}: {}", remote, e);
        }
        let (read, write) = stream.into_split();
        let (inbound_tx, inbound_rx) = mpsc::unbounded_channel();
        let reader = tokio::spawn(
            async move {
                let mut stream = FrameRecvStream::new(read);
                loop {
                    match stream.recv().await {
                        Ok(frames) => {
                            if inbound_tx.send(frames).is_err() {
                                break;
                            }
                        }
                        Err(Error::ConnectionClosed) => {
                            debug!("connection closed by remote");
                            break;
                        }
                        Err(e) => {
                            warn!("connection failed: {}", e);
                            break;
                        }
                    }
                }
            }
            .instrument(debug_span!("dealer", %remote)),
        );
        Ok(Dealer {
            remote,
            send_stream: FrameSendStream::new(write),
            inbound_rx,
            reader,
        })
    }

    pub fn remote_addr(&self) -> SocketAddr {
        self.remote
    }

    pub async fn send(&mut self, frames: &[Frame]) -> Result<(), Error> {
        self.send_stream.send(frames).await
    }

    /// Receives the next message, or `None` once the connection is gone.
    pub async fn recv(&mut self) -> Option<Frames> {
        self.inbound_rx.recv().await
    }
}

impl Drop for Dealer {
    fn drop(&mut self) {
        self.reader.abort();
    }
}
