//! Pipes: one peer connection each.
//!
//! A pipe binds a message transport to a socket. It carries a random
//! 31-bit id unique within the process, traffic counters, and an
//! idempotent close that tears the connection down on the reap thread in
//! a fixed order, so no protocol callback ever races destruction.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, OnceLock, Weak};

use log::debug;

use crate::aio::Aio;
use crate::error::Result;
use crate::reap;
use crate::socket::SocketInner;
use crate::sp::MsgStream;
use crate::stream::PropValue;

/// Pipe lifecycle notifications delivered to a socket's registered
/// callback.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PipeEvent {
    /// Negotiated, about to be added to the socket.
    AddPre,
    /// Added to the socket's active set.
    AddPost,
    /// Removed from the socket; the pipe is defunct.
    RemPost,
}

/// Traffic counters for one pipe.
#[derive(Default)]
pub struct PipeStats {
    tx_msgs: AtomicU64,
    rx_msgs: AtomicU64,
    tx_bytes: AtomicU64,
    rx_bytes: AtomicU64,
}

impl PipeStats {
    pub(crate) fn add_tx(&self, bytes: usize) {
        self.tx_msgs.fetch_add(1, Ordering::Relaxed);
        self.tx_bytes.fetch_add(bytes as u64, Ordering::Relaxed);
    }

    pub(crate) fn add_rx(&self, bytes: usize) {
        self.rx_msgs.fetch_add(1, Ordering::Relaxed);
        self.rx_bytes.fetch_add(bytes as u64, Ordering::Relaxed);
    }

    pub fn tx_msgs(&self) -> u64 {
        self.tx_msgs.load(Ordering::Relaxed)
    }

    pub fn rx_msgs(&self) -> u64 {
        self.rx_msgs.load(Ordering::Relaxed)
    }

    pub fn tx_bytes(&self) -> u64 {
        self.tx_bytes.load(Ordering::Relaxed)
    }

    pub fn rx_bytes(&self) -> u64 {
        self.rx_bytes.load(Ordering::Relaxed)
    }
}

/// The endpoint that created a pipe, notified when the pipe dies (a
/// dialer uses this to schedule its reconnect).
pub(crate) trait PipeOwner: Send + Sync {
    fn pipe_closed(self: Arc<Self>, pipe: &Pipe);
}

pub(crate) struct PipeInner {
    id: u32,
    tran: Box<dyn MsgStream>,
    socket: Weak<SocketInner>,
    owner: Weak<dyn PipeOwner>,
    closed: AtomicBool,
    stats: Arc<PipeStats>,
}

/// A handle to one peer connection. Clones share the connection.
#[derive(Clone)]
pub struct Pipe {
    inner: Arc<PipeInner>,
}

fn id_map() -> &'static Mutex<HashMap<u32, Weak<PipeInner>>> {
    static IDS: OnceLock<Mutex<HashMap<u32, Weak<PipeInner>>>> = OnceLock::new();
    IDS.get_or_init(|| Mutex::new(HashMap::new()))
}

/// Reserves a random non-zero 31-bit id not currently in use.
fn reserve_id() -> u32 {
    let mut map = id_map().lock().unwrap();
    loop {
        let id = rand::random::<u32>() & 0x7fff_ffff;
        if id != 0 && !map.contains_key(&id) {
            map.insert(id, Weak::new());
            return id;
        }
    }
}

impl Pipe {
    /// Creates a pipe over a negotiating transport, invoking the
    /// socket's protocol `pipe_init` hook. On failure the transport is
    /// torn down.
    pub(crate) fn create(
        tran: Box<dyn MsgStream>,
        socket: &Arc<SocketInner>,
        owner: Weak<dyn PipeOwner>,
    ) -> Result<Pipe> {
        let id = reserve_id();
        let stats = Arc::new(PipeStats::default());
        tran.set_stats(stats.clone());
        tran.set_recvmax(socket.recvmax());
        let pipe = Pipe {
            inner: Arc::new(PipeInner {
                id,
                tran,
                socket: Arc::downgrade(socket),
                owner,
                closed: AtomicBool::new(false),
                stats,
            }),
        };
        id_map()
            .lock()
            .unwrap()
            .insert(id, Arc::downgrade(&pipe.inner));
        if let Err(e) = socket.proto_pipe_init(&pipe) {
            pipe.close();
            return Err(e);
        }
        Ok(pipe)
    }

    /// Finds a live pipe by id.
    pub fn lookup(id: u32) -> Option<Pipe> {
        id_map()
            .lock()
            .unwrap()
            .get(&id)
            .and_then(Weak::upgrade)
            .map(|inner| Pipe { inner })
    }

    pub fn id(&self) -> u32 {
        self.inner.id
    }

    /// Sends the message attached to the AIO.
    pub fn send(&self, aio: &Aio) {
        self.inner.tran.send(aio);
    }

    /// Receives one message into the AIO's message slot.
    pub fn recv(&self, aio: &Aio) {
        self.inner.tran.recv(aio);
    }

    pub fn peer_proto(&self) -> u16 {
        self.inner.tran.peer_proto()
    }

    pub fn stats(&self) -> &PipeStats {
        &self.inner.stats
    }

    pub fn get(&self, name: &str) -> Result<PropValue> {
        self.inner.tran.get(name)
    }

    pub(crate) fn negotiate(&self, aio: &Aio) {
        self.inner.tran.negotiate(aio);
    }

    pub(crate) fn set_recvmax(&self, max: usize) {
        self.inner.tran.set_recvmax(max);
    }

    /// Closes the pipe. Idempotent; the teardown ladder runs on the reap
    /// thread.
    pub fn close(&self) {
        if self.inner.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        debug!("closing pipe {}", self.inner.id);
        let pipe = self.clone();
        reap::reap(move || pipe.reap_ladder());
    }

    pub fn is_closed(&self) -> bool {
        self.inner.closed.load(Ordering::Acquire)
    }

    /// The fixed teardown order: protocol close, transport close, the
    /// post-remove event, id-map removal, protocol stop, transport stop,
    /// socket removal, and finally the endpoint notification.
    fn reap_ladder(&self) {
        let socket = self.inner.socket.upgrade();
        if let Some(s) = &socket {
            s.proto_pipe_close(self);
        }
        self.inner.tran.close();
        if let Some(s) = &socket {
            s.pipe_event(PipeEvent::RemPost, self);
        }
        id_map().lock().unwrap().remove(&self.inner.id);
        if let Some(s) = &socket {
            s.proto_pipe_stop(self);
        }
        self.inner.tran.stop();
        if let Some(s) = &socket {
            s.remove_pipe(self.inner.id);
        }
        if let Some(owner) = self.inner.owner.upgrade() {
            owner.pipe_closed(self);
        }
    }
}

impl std::fmt::Debug for Pipe {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Pipe")
            .field("id", &self.inner.id)
            .field("closed", &self.is_closed())
            .finish()
    }
}
