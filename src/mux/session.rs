//! Session: the logical multiplexed channel to one remote peer
//!
//! Owns the stream table and the accept queue, routes inbound frames to the
//! addressed stream (creating it when the peer opened a new one), and
//! coordinates shutdown through the `die` signal every blocking operation
//! observes.

use super::stream::Stream;
use super::switchboard::{Carrier, Switchboard};
use super::{Frame, MuxError, ACCEPT_BACKLOG};
use crate::obfs::Obfuscator;
use std::collections::hash_map::Entry;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::{Arc, Weak};
use tokio::sync::mpsc::error::TrySendError;
use tokio::sync::{mpsc, watch, Mutex, RwLock};
use tracing::{debug, info, trace, warn};

/// Which side of the tunnel this session is. The initiator allocates odd
/// stream ids starting at 1, the responder even ids starting at 2, so the
/// two sides never collide.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionRole {
    Initiator,
    Responder,
}

/// A multiplexed session spanning one or more carrier connections.
pub struct Session {
    id: i32,
    obfs: Arc<dyn Obfuscator>,

    streams: RwLock<HashMap<u32, Arc<Stream>>>,
    sb: Arc<Switchboard>,

    accept_tx: mpsc::Sender<Arc<Stream>>,
    accept_rx: Mutex<mpsc::Receiver<Arc<Stream>>>,

    next_stream_id: AtomicU32,

    // Guards only the closing transition; `die` does the broadcasting
    closing: Mutex<bool>,
    dying: AtomicBool,
    die_tx: watch::Sender<bool>,
    die_rx: watch::Receiver<bool>,
}

impl Session {
    /// Create a session over its first carrier. More carriers join through
    /// [`add_connection`](Self::add_connection).
    pub fn new<C: Carrier + 'static>(
        id: i32,
        role: SessionRole,
        first_carrier: C,
        obfs: Arc<dyn Obfuscator>,
    ) -> Arc<Self> {
        let (die_tx, die_rx) = watch::channel(false);
        let (accept_tx, accept_rx) = mpsc::channel(ACCEPT_BACKLOG);

        let session = Arc::new_cyclic(|weak: &Weak<Session>| {
            let sb = Switchboard::spawn(weak.clone(), obfs.clone(), die_rx.clone());
            Session {
                id,
                obfs,
                streams: RwLock::new(HashMap::new()),
                sb,
                accept_tx,
                accept_rx: Mutex::new(accept_rx),
                next_stream_id: AtomicU32::new(match role {
                    SessionRole::Initiator => 1,
                    SessionRole::Responder => 2,
                }),
                closing: Mutex::new(false),
                dying: AtomicBool::new(false),
                die_tx,
                die_rx,
            }
        });
        session.sb.add_carrier(Box::new(first_carrier));
        info!(session = id, ?role, "session created");
        session
    }

    /// Session id.
    pub fn id(&self) -> i32 {
        self.id
    }

    /// Hand another established carrier connection to the switchboard.
    pub fn add_connection<C: Carrier + 'static>(&self, conn: C) {
        self.sb.add_carrier(Box::new(conn));
    }

    /// Open a new locally initiated stream. No frame is emitted; the stream
    /// is born on the peer when its first data frame arrives.
    pub async fn open_stream(self: &Arc<Self>) -> Result<Arc<Stream>, MuxError> {
        let id = self.next_stream_id.fetch_add(2, Ordering::SeqCst);
        let stream = Stream::new(id, Arc::downgrade(self), self.die_rx.clone());
        {
            // Checked under the table lock: the close sweep sets dying
            // before draining, so nothing can slip in behind it
            let mut table = self.streams.write().await;
            if self.is_dying() {
                return Err(MuxError::BrokenSession);
            }
            table.insert(id, stream.clone());
        }
        trace!(session = self.id, stream = id, "stream opened");
        Ok(stream)
    }

    /// Wait for the next peer-initiated stream.
    pub async fn accept_stream(&self) -> Result<Arc<Stream>, MuxError> {
        let mut die = self.die_rx.clone();
        if self.is_dying() {
            return Err(MuxError::BrokenSession);
        }
        let mut rx = self.accept_rx.lock().await;
        tokio::select! {
            biased;
            _ = die.changed() => Err(MuxError::BrokenSession),
            stream = rx.recv() => stream.ok_or(MuxError::BrokenSession),
        }
    }

    /// Whether a stream id is currently in the table.
    pub async fn is_stream(&self, id: u32) -> bool {
        self.streams.read().await.contains_key(&id)
    }

    /// Look up a stream by id.
    pub async fn get_stream(&self, id: u32) -> Option<Arc<Stream>> {
        self.streams.read().await.get(&id).cloned()
    }

    /// Route one inbound frame to its stream, creating the stream if the
    /// peer just opened it.
    pub(crate) async fn inbound(self: &Arc<Self>, frame: Frame) {
        let existing = self.streams.read().await.get(&frame.stream_id).cloned();
        let stream = match existing {
            Some(stream) => stream,
            None => {
                if self.is_dying() {
                    return;
                }
                if frame.is_closing() {
                    // A close/close race leaves nothing worth materialising
                    trace!(stream = frame.stream_id, "closing frame for unknown stream");
                    return;
                }
                let mut table = self.streams.write().await;
                if self.is_dying() {
                    return;
                }
                match table.entry(frame.stream_id) {
                    Entry::Occupied(entry) => entry.get().clone(),
                    Entry::Vacant(slot) => {
                        let stream =
                            Stream::new(frame.stream_id, Arc::downgrade(self), self.die_rx.clone());
                        match self.accept_tx.try_send(stream.clone()) {
                            Ok(()) => {
                                debug!(
                                    session = self.id,
                                    stream = frame.stream_id,
                                    "peer opened stream"
                                );
                                slot.insert(stream.clone());
                                stream
                            }
                            Err(TrySendError::Full(_)) => {
                                warn!(
                                    stream = frame.stream_id,
                                    "accept queue full, dropping new stream"
                                );
                                return;
                            }
                            Err(TrySendError::Closed(_)) => return,
                        }
                    }
                }
            }
        };

        // Table locks are released here: delivery can block on the stream's
        // inbound buffer
        let eof = stream.deliver(frame).await;
        if eof {
            self.del_stream(stream.id()).await;
        }
    }

    /// Close the session: raise `die`, then tear down every stream. Errors
    /// with `RepeatClose` on the second call.
    pub async fn close(&self) -> Result<(), MuxError> {
        {
            let mut closing = self.closing.lock().await;
            if *closing {
                return Err(MuxError::RepeatClose);
            }
            *closing = true;
        }
        self.raise_die();

        // Two-phase sweep: collect the handles under the table lock, tear
        // them down after releasing it. A stream's own locks are never
        // taken while the table is held.
        let drained: Vec<Arc<Stream>> = {
            let mut table = self.streams.write().await;
            table.drain().map(|(_, stream)| stream).collect()
        };
        for stream in drained {
            stream.close_no_unmap().await;
        }
        info!(session = self.id, "session closed");
        Ok(())
    }

    /// Whether `die` has been raised.
    pub fn is_dying(&self) -> bool {
        self.dying.load(Ordering::SeqCst)
    }

    pub(crate) fn raise_die(&self) {
        if !self.dying.swap(true, Ordering::SeqCst) {
            debug!(session = self.id, "session dying");
            let _ = self.die_tx.send(true);
        }
    }

    pub(crate) async fn del_stream(&self, id: u32) {
        self.streams.write().await.remove(&id);
    }

    /// Encode one frame and hand the record to the switchboard.
    pub(crate) async fn dispatch_frame(&self, frame: &Frame) -> Result<(), MuxError> {
        let record = self.obfs.encode(frame)?;
        self.sb.dispatch(record).await
    }
}

impl Drop for Session {
    fn drop(&mut self) {
        // Stops the switchboard supervisor and any carrier readers still
        // waiting on a session that can no longer be reached
        self.raise_die();
    }
}

impl std::fmt::Debug for Session {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Session")
            .field("id", &self.id)
            .field("dying", &self.is_dying())
            .finish()
    }
}
