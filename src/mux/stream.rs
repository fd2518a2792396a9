//! One logical bidirectional byte channel within a session
//!
//! The inbound half is a bounded frame buffer fed by the session's demux
//! path; frames are re-ordered by sequence number before delivery because
//! the switchboard may have sprayed them across carriers. The outbound half
//! stamps each write with the next sequence number and hands the frame to
//! the session for dispatch.

use super::session::Session;
use super::{Frame, MuxError, INBOUND_BACKLOG, MAX_PAYLOAD_SIZE};
use bytes::{Buf, Bytes};
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use tokio::sync::{mpsc, watch, Mutex, Notify};
use tracing::{debug, trace};

/// A multiplexed stream. Handed out as `Arc<Stream>`; the session's stream
/// table holds the owning reference, readers and writers hold the rest.
pub struct Stream {
    id: u32,
    session: Weak<Session>,
    die: watch::Receiver<bool>,

    // Outbound: seq assignment and emission order are serialised together
    send_seq: Mutex<u32>,
    closed: AtomicBool,

    // Inbound: session-side delivery plus reader-side draining
    in_tx: mpsc::Sender<Bytes>,
    reader: Mutex<ReadHalf>,
    recv: Mutex<RecvState>,
    recv_eof: AtomicBool,
    eof_notify: Notify,
}

struct ReadHalf {
    rx: mpsc::Receiver<Bytes>,
    current: Bytes,
    eof: bool,
}

struct RecvState {
    next_seq: u32,
    pending: BTreeMap<u32, Frame>,
}

enum ReadEvent {
    Die,
    Chunk(Option<Bytes>),
    Eof,
}

impl Stream {
    pub(crate) fn new(id: u32, session: Weak<Session>, die: watch::Receiver<bool>) -> Arc<Self> {
        let (in_tx, in_rx) = mpsc::channel(INBOUND_BACKLOG);
        Arc::new(Self {
            id,
            session,
            die,
            send_seq: Mutex::new(0),
            closed: AtomicBool::new(false),
            in_tx,
            reader: Mutex::new(ReadHalf {
                rx: in_rx,
                current: Bytes::new(),
                eof: false,
            }),
            recv: Mutex::new(RecvState {
                next_seq: 0,
                pending: BTreeMap::new(),
            }),
            recv_eof: AtomicBool::new(false),
            eof_notify: Notify::new(),
        })
    }

    /// Stream id, unique within its session.
    pub fn id(&self) -> u32 {
        self.id
    }

    /// Read up to `buf.len()` bytes, blocking while the inbound buffer is
    /// empty. Returns 0 once the peer has closed and the buffer is drained,
    /// or after a local close. Errors with `BrokenStream` when the session
    /// dies.
    pub async fn read(&self, buf: &mut [u8]) -> Result<usize, MuxError> {
        if buf.is_empty() {
            return Ok(0);
        }
        let mut die = self.die.clone();
        let mut reader = self.reader.lock().await;
        loop {
            if !reader.current.is_empty() {
                let n = reader.current.len().min(buf.len());
                buf[..n].copy_from_slice(&reader.current[..n]);
                reader.current.advance(n);
                return Ok(n);
            }
            if reader.eof {
                return Ok(0);
            }
            if *die.borrow() {
                return Err(MuxError::BrokenStream);
            }
            // A dropped die sender means the session itself is gone, which
            // reads the same as die
            let event = tokio::select! {
                biased;
                _ = die.changed() => ReadEvent::Die,
                chunk = reader.rx.recv() => ReadEvent::Chunk(chunk),
                _ = self.eof_notify.notified() => ReadEvent::Eof,
            };
            match event {
                ReadEvent::Die => return Err(MuxError::BrokenStream),
                ReadEvent::Chunk(Some(bytes)) => reader.current = bytes,
                ReadEvent::Chunk(None) => reader.eof = true,
                ReadEvent::Eof => {
                    if self.recv_eof.load(Ordering::SeqCst) {
                        reader.eof = true;
                    }
                }
            }
        }
    }

    /// Write one frame of at most [`MAX_PAYLOAD_SIZE`] bytes, returning how
    /// many bytes were consumed. Frames are atomic: either the whole frame
    /// is handed to the switchboard or nothing is. Fails with `BrokenStream`
    /// after a local close or once the session is dying.
    pub async fn write(&self, buf: &[u8]) -> Result<usize, MuxError> {
        if buf.is_empty() {
            return Ok(0);
        }
        if self.closed.load(Ordering::SeqCst) || *self.die.borrow() {
            return Err(MuxError::BrokenStream);
        }
        let session = self.session.upgrade().ok_or(MuxError::BrokenStream)?;

        let n = buf.len().min(MAX_PAYLOAD_SIZE);
        let mut seq = self.send_seq.lock().await;
        // Re-checked under the send lock so no data frame can slip out
        // after the closing frame
        if self.closed.load(Ordering::SeqCst) {
            return Err(MuxError::BrokenStream);
        }
        let frame = Frame::data(self.id, *seq, Bytes::copy_from_slice(&buf[..n]));
        session.dispatch_frame(&frame).await?;
        *seq = seq.wrapping_add(1);
        Ok(n)
    }

    /// Write an entire buffer, spanning frames as needed.
    pub async fn write_all(&self, mut buf: &[u8]) -> Result<(), MuxError> {
        while !buf.is_empty() {
            let n = self.write(buf).await?;
            buf = &buf[n..];
        }
        Ok(())
    }

    /// Close the stream. Idempotent: the first call emits one closing frame,
    /// removes the stream from the session's table and unblocks any pending
    /// read with end-of-stream.
    pub async fn close(&self) -> Result<(), MuxError> {
        if self.closed.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        self.teardown(true).await;
        Ok(())
    }

    /// Session-shutdown variant of close: the caller already drained the
    /// stream table, so the table is left untouched. The session is dying
    /// at that point, so no closing frame goes out either.
    pub(crate) async fn close_no_unmap(&self) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        self.teardown(false).await;
    }

    async fn teardown(&self, unmap: bool) {
        if let Some(session) = self.session.upgrade() {
            if !session.is_dying() {
                let mut seq = self.send_seq.lock().await;
                let frame = Frame::closing(self.id, *seq);
                match session.dispatch_frame(&frame).await {
                    Ok(()) => *seq = seq.wrapping_add(1),
                    Err(e) => debug!(stream = self.id, "closing frame not sent: {}", e),
                }
            }
            if unmap {
                session.del_stream(self.id).await;
            }
        }
        self.recv_eof.store(true, Ordering::SeqCst);
        self.eof_notify.notify_one();
    }

    /// Demux-path delivery. Frames are applied strictly in sequence order;
    /// early arrivals park until the gap fills, stale sequence numbers are
    /// dropped (a frame retried on a second carrier can arrive twice).
    /// Returns true once the peer's closing frame has been applied.
    pub(crate) async fn deliver(&self, frame: Frame) -> bool {
        let mut die = self.die.clone();
        let mut recv = self.recv.lock().await;

        let distance = frame.seq.wrapping_sub(recv.next_seq);
        if distance > u32::MAX / 2 {
            trace!(stream = self.id, seq = frame.seq, "dropping stale frame");
            return false;
        }
        recv.pending.insert(frame.seq, frame);

        let mut eof = false;
        loop {
            let next = recv.next_seq;
            let Some(frame) = recv.pending.remove(&next) else {
                break;
            };
            recv.next_seq = recv.next_seq.wrapping_add(1);
            if frame.is_closing() {
                eof = true;
            } else if !frame.payload.is_empty() && !self.closed.load(Ordering::SeqCst) {
                if *die.borrow() {
                    break;
                }
                // Blocks when the inbound buffer is full, which is what
                // back-pressures the delivering carrier's reader. A dying
                // session unblocks it so the carrier reader can exit.
                let aborted = tokio::select! {
                    biased;
                    _ = die.changed() => true,
                    sent = self.in_tx.send(frame.payload) => sent.is_err(),
                };
                if aborted {
                    break;
                }
            }
        }
        if eof {
            self.recv_eof.store(true, Ordering::SeqCst);
            self.eof_notify.notify_one();
        }
        eof
    }
}

impl std::fmt::Debug for Stream {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Stream")
            .field("id", &self.id)
            .field("closed", &self.closed.load(Ordering::SeqCst))
            .finish()
    }
}
