//! Sockets: the application handle owning a protocol identity, a set of
//! endpoints, and the active pipes they produce.
//!
//! The pattern policy layers sit above this; a socket without one still
//! validates peers during negotiation and hands ready pipes out through
//! `accept_pipe`.

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, OnceLock};
use std::time::Duration;

use log::{debug, info};

use crate::aio::Aio;
use crate::endpoint::{Dialer, Listener};
use crate::error::{Error, Result};
use crate::pipe::{Pipe, PipeEvent};
use crate::sp::{Protocol, ProtocolInfo};
use crate::url::Url;

type PipeNotifyFn = Box<dyn Fn(&Pipe, PipeEvent) + Send + Sync>;

/// Default reconnect backoff bounds for dialers.
pub(crate) const RECONNECT_MIN: Duration = Duration::from_millis(10);
pub(crate) const RECONNECT_MAX: Duration = Duration::from_secs(30);

struct SockSt {
    pipes: HashMap<u32, Pipe>,
    dialers: Vec<Dialer>,
    listeners: Vec<Listener>,
    accept_aios: VecDeque<Aio>,
    closed: bool,
}

pub(crate) struct SocketInner {
    id: u32,
    info: ProtocolInfo,
    policy: Option<Box<dyn Protocol>>,
    st: Mutex<SockSt>,
    rejects: AtomicU64,
    recvmax: AtomicUsize,
    reconn: Mutex<(Duration, Duration)>,
    notify: Mutex<Option<PipeNotifyFn>>,
}

/// An SP socket handle. Clones share the socket.
#[derive(Clone)]
pub struct Socket {
    inner: Arc<SocketInner>,
}

fn next_socket_id() -> u32 {
    static NEXT: OnceLock<AtomicU64> = OnceLock::new();
    NEXT.get_or_init(|| AtomicU64::new(1))
        .fetch_add(1, Ordering::Relaxed) as u32
}

impl Socket {
    /// Creates a socket with a bare protocol identity and no policy
    /// layer; negotiated pipes are retrieved with [`Socket::accept_pipe`].
    pub fn new(info: ProtocolInfo) -> Socket {
        Socket::build(info, None)
    }

    /// Creates a socket driven by a pattern policy.
    pub fn with_protocol(policy: Box<dyn Protocol>) -> Socket {
        let info = policy.info();
        Socket::build(info, Some(policy))
    }

    fn build(info: ProtocolInfo, policy: Option<Box<dyn Protocol>>) -> Socket {
        Socket {
            inner: Arc::new(SocketInner {
                id: next_socket_id(),
                info,
                policy,
                st: Mutex::new(SockSt {
                    pipes: HashMap::new(),
                    dialers: Vec::new(),
                    listeners: Vec::new(),
                    accept_aios: VecDeque::new(),
                    closed: false,
                }),
                rejects: AtomicU64::new(0),
                recvmax: AtomicUsize::new(0),
                reconn: Mutex::new((RECONNECT_MIN, RECONNECT_MAX)),
                notify: Mutex::new(None),
            }),
        }
    }

    pub fn id(&self) -> u32 {
        self.inner.id
    }

    pub fn info(&self) -> ProtocolInfo {
        self.inner.info
    }

    /// Maximum inbound message size applied to new pipes; 0 disables the
    /// check.
    pub fn set_recvmax(&self, max: usize) {
        self.inner.recvmax.store(max, Ordering::Relaxed);
    }

    pub fn recvmax(&self) -> usize {
        self.inner.recvmax.load(Ordering::Relaxed)
    }

    /// Bounds for dialer reconnect backoff.
    pub fn set_reconnect_time(&self, min: Duration, max: Duration) -> Result<()> {
        if min.is_zero() || max < min {
            return Err(Error::InvalidArgument);
        }
        *self.inner.reconn.lock().unwrap() = (min, max);
        Ok(())
    }

    /// Installs a pipe lifecycle callback.
    pub fn pipe_notify<F>(&self, f: F)
    where
        F: Fn(&Pipe, PipeEvent) + Send + Sync + 'static,
    {
        *self.inner.notify.lock().unwrap() = Some(Box::new(f));
    }

    /// Count of pipes rejected after negotiation (peer protocol
    /// mismatch or policy refusal).
    pub fn rejects(&self) -> u64 {
        self.inner.rejects.load(Ordering::Relaxed)
    }

    pub fn pipe_count(&self) -> usize {
        self.inner.st.lock().unwrap().pipes.len()
    }

    /// Starts a dialer for `url`. The connection proceeds in the
    /// background with automatic reconnect.
    pub fn dial(&self, url: &str) -> Result<Dialer> {
        self.dial_inner(url, false)
    }

    /// Starts a dialer and waits for the first connection attempt; an
    /// error from that attempt is returned and no retry is scheduled.
    pub fn dial_sync(&self, url: &str) -> Result<Dialer> {
        self.dial_inner(url, true)
    }

    fn dial_inner(&self, url: &str, sync: bool) -> Result<Dialer> {
        let url = Url::parse(url)?;
        let dialer = Dialer::create(url, &self.inner)?;
        {
            let mut st = self.inner.st.lock().unwrap();
            if st.closed {
                return Err(Error::Closed);
            }
            st.dialers.push(dialer.clone());
        }
        info!("socket {} dialing {}", self.inner.id, dialer.url());
        dialer.start(sync)?;
        Ok(dialer)
    }

    /// Binds and starts a listener for `url`. Bind errors (notably
    /// `AddressInUse`) surface here synchronously.
    pub fn listen(&self, url: &str) -> Result<Listener> {
        let url = Url::parse(url)?;
        let listener = Listener::create(url, &self.inner)?;
        {
            let mut st = self.inner.st.lock().unwrap();
            if st.closed {
                return Err(Error::Closed);
            }
            st.listeners.push(listener.clone());
        }
        listener.listen()?;
        info!("socket {} listening on {}", self.inner.id, listener.url());
        Ok(listener)
    }

    /// Delivers the next negotiated pipe through the AIO (output slot
    /// 0). If an endpoint already holds a waiting pipe it completes
    /// immediately.
    pub fn accept_pipe(&self, aio: &Aio) {
        if !aio.begin() {
            return;
        }
        let mut st = self.inner.st.lock().unwrap();
        if st.closed {
            drop(st);
            aio.finish_error(Error::Closed);
            return;
        }
        for d in &st.dialers {
            if let Some(pipe) = d.pop_waitpipe() {
                drop(st);
                aio.set_output(0, pipe);
                aio.finish(Ok(()), 0);
                return;
            }
        }
        for l in &st.listeners {
            if let Some(pipe) = l.pop_waitpipe() {
                drop(st);
                aio.set_output(0, pipe);
                aio.finish(Ok(()), 0);
                return;
            }
        }
        let inner = self.inner.clone();
        if let Err(rv) = aio.schedule(Box::new(move |a: &Aio, res: Result<()>| {
            let err = res.err().unwrap_or(Error::Canceled);
            let found = {
                let mut st = inner.st.lock().unwrap();
                match st.accept_aios.iter().position(|q| q.same(a)) {
                    Some(pos) => {
                        st.accept_aios.remove(pos);
                        true
                    }
                    None => false,
                }
            };
            if found {
                a.finish_error(err);
            }
        })) {
            drop(st);
            aio.finish_error(rv);
            return;
        }
        st.accept_aios.push_back(aio.clone());
    }

    /// Closes the socket: endpoints first (each closes the pipes it
    /// created), then any remaining pipes and waiters.
    pub fn close(&self) {
        let (dialers, listeners, pipes, accepts) = {
            let mut st = self.inner.st.lock().unwrap();
            if st.closed {
                return;
            }
            st.closed = true;
            (
                std::mem::take(&mut st.dialers),
                std::mem::take(&mut st.listeners),
                st.pipes.drain().map(|(_, p)| p).collect::<Vec<_>>(),
                std::mem::take(&mut st.accept_aios),
            )
        };
        for d in dialers {
            d.close();
        }
        for l in listeners {
            l.close();
        }
        for p in pipes {
            p.close();
        }
        for aio in accepts {
            aio.finish_error(Error::Closed);
        }
    }
}

impl SocketInner {
    pub(crate) fn proto_info(&self) -> ProtocolInfo {
        self.info
    }

    pub(crate) fn recvmax(&self) -> usize {
        self.recvmax.load(Ordering::Relaxed)
    }

    pub(crate) fn reconnect_times(&self) -> (Duration, Duration) {
        *self.reconn.lock().unwrap()
    }

    pub(crate) fn proto_pipe_init(&self, pipe: &Pipe) -> Result<()> {
        match &self.policy {
            Some(p) => p.pipe_init(pipe),
            None => Ok(()),
        }
    }

    pub(crate) fn proto_pipe_close(&self, pipe: &Pipe) {
        if let Some(p) = &self.policy {
            p.pipe_close(pipe);
        }
    }

    pub(crate) fn proto_pipe_stop(&self, pipe: &Pipe) {
        if let Some(p) = &self.policy {
            p.pipe_stop(pipe);
        }
    }

    pub(crate) fn pipe_event(&self, event: PipeEvent, pipe: &Pipe) {
        if let Some(f) = self.notify.lock().unwrap().as_ref() {
            f(pipe, event);
        }
    }

    /// A pipe finished negotiation: validate the peer, run the policy
    /// hook, and either hand it to a waiting accept AIO or park it on
    /// its endpoint. Returns false when the pipe was rejected.
    pub(crate) fn deliver_pipe<F>(&self, pipe: Pipe, park: F) -> bool
    where
        F: FnOnce(Pipe),
    {
        let peer = pipe.peer_proto();
        if peer != self.info.peer_id {
            debug!(
                "rejecting pipe {}: peer protocol {:#06x}, expected {:#06x} ({})",
                pipe.id(),
                peer,
                self.info.peer_id,
                self.info.peer_name,
            );
            self.rejects.fetch_add(1, Ordering::Relaxed);
            pipe.close();
            return false;
        }
        if let Some(policy) = &self.policy {
            if let Err(e) = policy.pipe_start(&pipe) {
                debug!("policy refused pipe {}: {}", pipe.id(), e);
                self.rejects.fetch_add(1, Ordering::Relaxed);
                pipe.close();
                return false;
            }
        }
        self.pipe_event(PipeEvent::AddPre, &pipe);
        let waiter = {
            let mut st = self.st.lock().unwrap();
            if st.closed {
                drop(st);
                pipe.close();
                return false;
            }
            st.pipes.insert(pipe.id(), pipe.clone());
            st.accept_aios.pop_front()
        };
        match waiter {
            Some(aio) => {
                aio.set_output(0, pipe.clone());
                aio.finish(Ok(()), 0);
            }
            None => park(pipe.clone()),
        }
        self.pipe_event(PipeEvent::AddPost, &pipe);
        true
    }

    pub(crate) fn remove_pipe(&self, id: u32) {
        self.st.lock().unwrap().pipes.remove(&id);
    }
}
