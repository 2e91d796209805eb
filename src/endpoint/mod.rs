//! Endpoints: dialers and listeners.
//!
//! Both kinds share the negotiation machinery here: every stream an
//! endpoint produces is wrapped in the SP framing layer, given a pipe,
//! and driven through the 8-byte negotiation under a fixed deadline
//! before the socket ever sees it.

mod dialer;
mod listener;

pub use dialer::Dialer;
pub use listener::Listener;

use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, OnceLock, Weak};
use std::time::Duration;

use log::debug;

use crate::aio::Aio;
use crate::error::{Error, Result};
use crate::pipe::{Pipe, PipeOwner};
use crate::socket::SocketInner;
use crate::sp::framing::SpStream;
use crate::stream::Stream;
use crate::url::Url;

/// Deadline for the SP negotiation on a fresh pipe.
pub(crate) const NEGO_TIMEOUT: Duration = Duration::from_secs(10);

/// Pause before re-arming accept after resource exhaustion.
pub(crate) const ACCEPT_RETRY: Duration = Duration::from_millis(100);

pub(crate) struct NegoEntry {
    pipe: Pipe,
    aio: Aio,
}

pub(crate) struct EpSt {
    pub(crate) closed: bool,
    negopipes: Vec<NegoEntry>,
    waitpipes: VecDeque<Pipe>,
    /// Ids of live pipes this endpoint created; closing the endpoint
    /// closes them.
    pipe_ids: Vec<u32>,
}

/// State shared by both endpoint kinds.
pub(crate) struct EpCore {
    id: u32,
    url: Url,
    pub(crate) socket: Weak<SocketInner>,
    pub(crate) st: Mutex<EpSt>,
    connected: AtomicU64,
    nego_failed: AtomicU64,
}

fn next_ep_id() -> u32 {
    static NEXT: OnceLock<AtomicU64> = OnceLock::new();
    NEXT.get_or_init(|| AtomicU64::new(1))
        .fetch_add(1, Ordering::Relaxed) as u32
}

impl EpCore {
    pub(crate) fn new(url: Url, socket: &Arc<SocketInner>) -> EpCore {
        EpCore {
            id: next_ep_id(),
            url,
            socket: Arc::downgrade(socket),
            st: Mutex::new(EpSt {
                closed: false,
                negopipes: Vec::new(),
                waitpipes: VecDeque::new(),
                pipe_ids: Vec::new(),
            }),
            connected: AtomicU64::new(0),
            nego_failed: AtomicU64::new(0),
        }
    }

    pub(crate) fn id(&self) -> u32 {
        self.id
    }

    pub(crate) fn url(&self) -> &Url {
        &self.url
    }

    /// Completed connections (past negotiation and acceptance).
    pub(crate) fn connected_count(&self) -> u64 {
        self.connected.load(Ordering::Relaxed)
    }

    pub(crate) fn nego_failures(&self) -> u64 {
        self.nego_failed.load(Ordering::Relaxed)
    }

    pub(crate) fn pop_waitpipe(&self) -> Option<Pipe> {
        self.st.lock().unwrap().waitpipes.pop_front()
    }

    fn forget_pipe(&self, id: u32) {
        let mut st = self.st.lock().unwrap();
        st.pipe_ids.retain(|&p| p != id);
        st.waitpipes.retain(|p| p.id() != id);
    }

    /// Tears down everything the endpoint is tracking. The caller closes
    /// its own stream dialer/listener and AIOs around this.
    pub(crate) fn close(&self) {
        let (negos, waits, ids) = {
            let mut st = self.st.lock().unwrap();
            if st.closed {
                return;
            }
            st.closed = true;
            (
                std::mem::take(&mut st.negopipes),
                std::mem::take(&mut st.waitpipes),
                std::mem::take(&mut st.pipe_ids),
            )
        };
        for entry in negos {
            entry.aio.abort(Error::Closed);
            entry.pipe.close();
        }
        for pipe in waits {
            pipe.close();
        }
        for id in ids {
            if let Some(pipe) = Pipe::lookup(id) {
                pipe.close();
            }
        }
    }
}

/// The endpoint-kind hooks the shared negotiation path calls back into.
pub(crate) trait Endpoint: PipeOwner + Send + Sync + Sized + 'static {
    fn core(&self) -> &EpCore;
    /// Outcome of one produced connection: `Ok` once the pipe is live,
    /// `Err` when negotiation or validation killed it.
    fn nego_result(self: &Arc<Self>, res: Result<()>);
}

/// Wraps a fresh byte stream in SP framing and drives negotiation.
pub(crate) fn start_pipe<E: Endpoint>(ep: &Arc<E>, stream: Box<dyn Stream>) {
    let core = ep.core();
    let Some(socket) = core.socket.upgrade() else {
        stream.close();
        return;
    };
    let tran = Box::new(SpStream::new(stream, socket.proto_info().self_id));
    let owner = Arc::downgrade(ep) as Weak<dyn PipeOwner>;
    let pipe = match Pipe::create(tran, &socket, owner) {
        Ok(pipe) => pipe,
        Err(e) => {
            debug!("endpoint {}: pipe setup failed: {}", core.id, e);
            ep.nego_result(Err(e));
            return;
        }
    };

    let aio = {
        let weak = Arc::downgrade(ep);
        let pipe = pipe.clone();
        Aio::new(move |aio| {
            if let Some(ep) = weak.upgrade() {
                nego_done(&ep, &pipe, aio);
            }
        })
    };
    aio.set_timeout(Some(NEGO_TIMEOUT));

    {
        let mut st = core.st.lock().unwrap();
        if st.closed {
            drop(st);
            pipe.close();
            return;
        }
        st.negopipes.push(NegoEntry {
            pipe: pipe.clone(),
            aio: aio.clone(),
        });
    }
    pipe.negotiate(&aio);
}

fn nego_done<E: Endpoint>(ep: &Arc<E>, pipe: &Pipe, aio: &Aio) {
    let core = ep.core();
    {
        let mut st = core.st.lock().unwrap();
        st.negopipes.retain(|e| e.pipe.id() != pipe.id());
    }
    match aio.result() {
        Ok(()) => {
            let Some(socket) = core.socket.upgrade() else {
                pipe.close();
                return;
            };
            let park_ep = ep.clone();
            let delivered = socket.deliver_pipe(pipe.clone(), move |p| {
                let mut st = park_ep.core().st.lock().unwrap();
                if st.closed {
                    drop(st);
                    p.close();
                } else {
                    st.waitpipes.push_back(p);
                }
            });
            if delivered {
                core.connected.fetch_add(1, Ordering::Relaxed);
                let mut st = core.st.lock().unwrap();
                if st.closed {
                    drop(st);
                    pipe.close();
                } else {
                    st.pipe_ids.push(pipe.id());
                }
                ep.nego_result(Ok(()));
            } else {
                ep.nego_result(Err(Error::ProtocolError));
            }
        }
        Err(e) => {
            debug!(
                "endpoint {}: negotiation with peer failed: {}",
                core.id, e
            );
            core.nego_failed.fetch_add(1, Ordering::Relaxed);
            pipe.close();
            ep.nego_result(Err(e));
        }
    }
}

/// Shared `pipe_closed` bookkeeping; kinds layer their own reaction on
/// top (a dialer schedules its reconnect).
pub(crate) fn note_pipe_closed<E: Endpoint>(ep: &E, pipe: &Pipe) {
    ep.core().forget_pipe(pipe.id());
}
