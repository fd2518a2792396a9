//! Switchboard: the carrier pool
//!
//! Owns every carrier connection of a session. Outbound records are
//! dispatched round-robin; a carrier that fails a write is evicted and the
//! record retried on the next one. Each carrier gets a reader task that
//! pulls one record at a time through the obfuscator and feeds the session's
//! demux path. Once the pool has been seeded, emptying it marks the session
//! dying.

use super::session::Session;
use super::{MuxError, MAX_RECORD_SIZE};
use crate::obfs::Obfuscator;
use bytes::Bytes;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Weak};
use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt, ReadHalf, WriteHalf};
use tokio::sync::{mpsc, watch, Mutex, Notify, RwLock};
use tracing::{debug, trace, warn};

/// Anything that can carry records: one established outbound transport
/// connection. The disguise layer hands these over fully set up.
pub trait Carrier: AsyncRead + AsyncWrite + Send + Unpin {}

impl<T: AsyncRead + AsyncWrite + Send + Unpin> Carrier for T {}

/// Intake depth for carriers waiting to be moved into the active set.
const NEW_CONN_BACKLOG: usize = 16;

pub(crate) struct Switchboard {
    session: Weak<Session>,
    obfs: Arc<dyn Obfuscator>,
    active: RwLock<Vec<CarrierHandle>>,
    rr: AtomicUsize,
    next_carrier_id: AtomicU64,
    new_conn_tx: mpsc::Sender<Box<dyn Carrier>>,
    // Flips on the first install; distinguishes "not seeded yet, wait"
    // from "pool drained, give up"
    seeded: AtomicBool,
    installed: Notify,
    die: watch::Receiver<bool>,
}

#[derive(Clone)]
struct CarrierHandle {
    id: u64,
    writer: Arc<Mutex<WriteHalf<Box<dyn Carrier>>>>,
}

impl Switchboard {
    /// Create the switchboard and start its supervisor task.
    pub(crate) fn spawn(
        session: Weak<Session>,
        obfs: Arc<dyn Obfuscator>,
        die: watch::Receiver<bool>,
    ) -> Arc<Self> {
        let (new_conn_tx, new_conn_rx) = mpsc::channel(NEW_CONN_BACKLOG);
        let sb = Arc::new(Self {
            session,
            obfs,
            active: RwLock::new(Vec::new()),
            rr: AtomicUsize::new(0),
            next_carrier_id: AtomicU64::new(0),
            new_conn_tx,
            seeded: AtomicBool::new(false),
            installed: Notify::new(),
            die,
        });
        tokio::spawn(sb.clone().supervise(new_conn_rx));
        sb
    }

    /// Enqueue a new carrier; the supervisor moves it into the active set.
    pub(crate) fn add_carrier(&self, conn: Box<dyn Carrier>) {
        if self.new_conn_tx.try_send(conn).is_err() {
            warn!("carrier intake queue full, dropping connection");
        }
    }

    /// Select a carrier and write one record. Round-robin; write failure
    /// evicts the carrier and retries on the next. Waits while the pool has
    /// never held a carrier; once seeded, an empty pool marks the session
    /// dying and surfaces `NoCarriers`.
    pub(crate) async fn dispatch(&self, record: Bytes) -> Result<(), MuxError> {
        let mut die = self.die.clone();
        loop {
            let picked = {
                let active = self.active.read().await;
                if active.is_empty() {
                    None
                } else {
                    let idx = self.rr.fetch_add(1, Ordering::Relaxed) % active.len();
                    Some(active[idx].clone())
                }
            };

            let Some(handle) = picked else {
                if self.seeded.load(Ordering::SeqCst) {
                    break;
                }
                // Not seeded yet: the caller raced the supervisor. Register
                // for the install signal before re-checking, then park.
                let notified = self.installed.notified();
                tokio::pin!(notified);
                notified.as_mut().enable();
                if !self.active.read().await.is_empty() || self.seeded.load(Ordering::SeqCst) {
                    continue;
                }
                if *die.borrow() {
                    return Err(MuxError::BrokenSession);
                }
                tokio::select! {
                    biased;
                    _ = die.changed() => return Err(MuxError::BrokenSession),
                    _ = &mut notified => continue,
                }
            };

            if *die.borrow() {
                return Err(MuxError::BrokenSession);
            }

            // A dying session abandons the write rather than waiting out a
            // stalled carrier; the pool is being torn down anyway
            let res: std::io::Result<()> = tokio::select! {
                biased;
                _ = die.changed() => return Err(MuxError::BrokenSession),
                res = async {
                    let mut writer = handle.writer.lock().await;
                    writer.write_all(&record).await?;
                    writer.flush().await
                } => res,
            };

            match res {
                Ok(()) => return Ok(()),
                Err(e) => {
                    warn!(carrier = handle.id, "carrier write failed: {}", e);
                    self.evict(handle.id).await;
                }
            }
        }

        if let Some(session) = self.session.upgrade() {
            session.raise_die();
        }
        Err(MuxError::NoCarriers)
    }

    async fn supervise(self: Arc<Self>, mut new_conn_rx: mpsc::Receiver<Box<dyn Carrier>>) {
        let mut die = self.die.clone();
        loop {
            tokio::select! {
                biased;
                changed = die.changed() => {
                    if changed.is_err() || *die.borrow() {
                        self.active.write().await.clear();
                        debug!("switchboard shut down");
                        return;
                    }
                }
                conn = new_conn_rx.recv() => match conn {
                    Some(conn) => self.install(conn).await,
                    None => return,
                },
            }
        }
    }

    async fn install(self: &Arc<Self>, conn: Box<dyn Carrier>) {
        let id = self.next_carrier_id.fetch_add(1, Ordering::SeqCst);
        let (read_half, write_half) = tokio::io::split(conn);
        self.active.write().await.push(CarrierHandle {
            id,
            writer: Arc::new(Mutex::new(write_half)),
        });
        self.seeded.store(true, Ordering::SeqCst);
        self.installed.notify_waiters();
        debug!(carrier = id, "carrier added");
        tokio::spawn(self.clone().pump(id, read_half));
    }

    /// Per-carrier reader: one record per loop through the obfuscator, then
    /// into the session's demux path. Any read or decode error evicts this
    /// carrier only; the rest of the pool keeps going.
    async fn pump(self: Arc<Self>, carrier_id: u64, mut read_half: ReadHalf<Box<dyn Carrier>>) {
        let mut die = self.die.clone();
        let mut buf = vec![0u8; MAX_RECORD_SIZE];
        loop {
            if *die.borrow() {
                break;
            }
            let n = tokio::select! {
                biased;
                _ = die.changed() => break,
                res = self.obfs.read_record(&mut read_half, &mut buf) => match res {
                    Ok(n) => n,
                    Err(e) => {
                        debug!(carrier = carrier_id, "carrier read ended: {}", e);
                        break;
                    }
                }
            };

            let frame = match self.obfs.decode(&buf[..n]) {
                Ok(frame) => frame,
                Err(e) => {
                    warn!(carrier = carrier_id, "evicting carrier: {}", e);
                    break;
                }
            };
            trace!(
                carrier = carrier_id,
                stream = frame.stream_id,
                seq = frame.seq,
                "record received"
            );

            let Some(session) = self.session.upgrade() else {
                break;
            };
            session.inbound(frame).await;
        }
        self.evict(carrier_id).await;
    }

    async fn evict(&self, carrier_id: u64) {
        let emptied = {
            let mut active = self.active.write().await;
            let before = active.len();
            active.retain(|c| c.id != carrier_id);
            before > active.len() && active.is_empty()
        };
        if emptied {
            if let Some(session) = self.session.upgrade() {
                if !session.is_dying() {
                    warn!("carrier pool empty, marking session dying");
                    session.raise_die();
                }
            }
        }
    }
}
