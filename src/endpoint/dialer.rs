//! The dialing endpoint.
//!
//! One connection at a time: dial, negotiate, hand the pipe to the
//! socket, and when that pipe eventually dies, reconnect with bounded
//! exponential backoff and full jitter. A synchronous start waits for
//! the first attempt and reports its error without scheduling a retry.

use std::sync::{Arc, Condvar, Mutex, Weak};
use std::time::Duration;

use log::debug;

use crate::aio::Aio;
use crate::error::{Error, Result};
use crate::pipe::{Pipe, PipeOwner};
use crate::socket::SocketInner;
use crate::stream::{self, PropValue, Stream, StreamDialer};
use crate::url::Url;

use super::{note_pipe_closed, start_pipe, Endpoint, EpCore};

struct DialSt {
    started: bool,
    closed: bool,
    /// A connect or negotiation is in flight.
    connecting: bool,
    /// A backoff sleep is in flight.
    waiting: bool,
    /// The current pipe is up.
    pipe_up: bool,
    /// Next backoff interval.
    backoff: Duration,
    /// First-attempt outcome for a synchronous start.
    first: Option<Result<()>>,
    sync_wait: bool,
}

pub(crate) struct DialerInner {
    core: EpCore,
    sd: Box<dyn StreamDialer>,
    dst: Mutex<DialSt>,
    cv: Condvar,
    dial_aio: Aio,
    sleep_aio: Aio,
}

/// A dialing endpoint handle. Clones share the dialer.
#[derive(Clone)]
pub struct Dialer {
    inner: Arc<DialerInner>,
}

impl Dialer {
    pub(crate) fn create(url: Url, socket: &Arc<SocketInner>) -> Result<Dialer> {
        let sd = stream::dialer(&url)?;
        let (min, _) = socket.reconnect_times();
        let inner = Arc::new_cyclic(|weak: &Weak<DialerInner>| {
            let wd = weak.clone();
            let dial_aio = Aio::new(move |aio| {
                if let Some(d) = wd.upgrade() {
                    d.dial_done(aio);
                }
            });
            let ws = weak.clone();
            let sleep_aio = Aio::new(move |_aio| {
                if let Some(d) = ws.upgrade() {
                    d.wake();
                }
            });
            DialerInner {
                core: EpCore::new(url, socket),
                sd,
                dst: Mutex::new(DialSt {
                    started: false,
                    closed: false,
                    connecting: false,
                    waiting: false,
                    pipe_up: false,
                    backoff: min,
                    first: None,
                    sync_wait: false,
                }),
                cv: Condvar::new(),
                dial_aio,
                sleep_aio,
            }
        });
        Ok(Dialer { inner })
    }

    pub fn id(&self) -> u32 {
        self.inner.core.id()
    }

    pub fn url(&self) -> String {
        self.inner.core.url().to_string()
    }

    /// Completed connections over the dialer's lifetime.
    pub fn connected_count(&self) -> u64 {
        self.inner.core.connected_count()
    }

    pub fn nego_failures(&self) -> u64 {
        self.inner.core.nego_failures()
    }

    pub fn get(&self, name: &str) -> Result<PropValue> {
        self.inner.sd.get(name)
    }

    pub fn set(&self, name: &str, value: PropValue) -> Result<()> {
        self.inner.sd.set(name, value)
    }

    pub(crate) fn start(&self, sync: bool) -> Result<()> {
        {
            let mut dst = self.inner.dst.lock().unwrap();
            if dst.closed {
                return Err(Error::Closed);
            }
            if dst.started {
                return Err(Error::Busy);
            }
            dst.started = true;
            dst.sync_wait = sync;
        }
        self.inner.kick();
        if !sync {
            return Ok(());
        }
        let mut dst = self.inner.dst.lock().unwrap();
        while dst.first.is_none() && !dst.closed {
            dst = self.inner.cv.wait(dst).unwrap();
        }
        dst.sync_wait = false;
        match dst.first.take() {
            Some(res) => res,
            None => Err(Error::Closed),
        }
    }

    pub(crate) fn pop_waitpipe(&self) -> Option<Pipe> {
        self.inner.core.pop_waitpipe()
    }

    pub fn close(&self) {
        {
            let mut dst = self.inner.dst.lock().unwrap();
            if dst.closed {
                return;
            }
            dst.closed = true;
        }
        self.inner.cv.notify_all();
        self.inner.dial_aio.abort(Error::Closed);
        self.inner.sleep_aio.abort(Error::Closed);
        self.inner.sd.close();
        self.inner.core.close();
    }
}

impl DialerInner {
    /// Issues a connect attempt unless one is already in flight, a pipe
    /// is up, or a backoff sleep is pending.
    fn kick(self: &Arc<Self>) {
        {
            let mut dst = self.dst.lock().unwrap();
            if dst.closed || !dst.started || dst.connecting || dst.waiting || dst.pipe_up {
                return;
            }
            dst.connecting = true;
        }
        self.sd.dial(&self.dial_aio);
    }

    fn dial_done(self: &Arc<Self>, aio: &Aio) {
        match aio.result() {
            Ok(()) => match aio.take_output::<Box<dyn Stream>>(0) {
                Some(stream) => {
                    // negotiation continues the attempt; `connecting`
                    // stays set until nego_result.
                    start_pipe(self, stream);
                }
                None => self.attempt_failed(Error::ConnShutdown),
            },
            Err(e) => self.attempt_failed(e),
        }
    }

    /// Ends a failed attempt: report to a synchronous waiter, otherwise
    /// schedule the jittered backoff retry.
    fn attempt_failed(self: &Arc<Self>, err: Error) {
        debug!("dialer {}: connect failed: {}", self.core.id(), err);
        let retry = {
            let mut dst = self.dst.lock().unwrap();
            dst.connecting = false;
            if dst.closed {
                false
            } else if dst.sync_wait && dst.first.is_none() {
                dst.first = Some(Err(err));
                false
            } else {
                dst.waiting = true;
                true
            }
        };
        self.cv.notify_all();
        if retry {
            let delay = self.next_backoff();
            self.sleep_aio.sleep(delay);
        }
    }

    /// Doubles the backoff within the socket's bounds and applies full
    /// jitter to the delay actually slept.
    fn next_backoff(&self) -> Duration {
        let (min, max) = match self.core.socket.upgrade() {
            Some(s) => s.reconnect_times(),
            None => (
                crate::socket::RECONNECT_MIN,
                crate::socket::RECONNECT_MAX,
            ),
        };
        let mut dst = self.dst.lock().unwrap();
        let cur = dst.backoff.max(min);
        dst.backoff = (cur * 2).min(max);
        let millis = cur.as_millis().max(1) as u64;
        Duration::from_millis(millis / 2 + rand::random::<u64>() % (millis / 2 + 1))
    }

    fn wake(self: &Arc<Self>) {
        {
            let mut dst = self.dst.lock().unwrap();
            dst.waiting = false;
        }
        self.kick();
    }
}

impl Endpoint for DialerInner {
    fn core(&self) -> &EpCore {
        &self.core
    }

    fn nego_result(self: &Arc<Self>, res: Result<()>) {
        match res {
            Ok(()) => {
                let (min, _) = match self.core.socket.upgrade() {
                    Some(s) => s.reconnect_times(),
                    None => (crate::socket::RECONNECT_MIN, crate::socket::RECONNECT_MAX),
                };
                let mut dst = self.dst.lock().unwrap();
                dst.connecting = false;
                dst.pipe_up = true;
                dst.backoff = min;
                if dst.sync_wait && dst.first.is_none() {
                    dst.first = Some(Ok(()));
                }
                drop(dst);
                self.cv.notify_all();
            }
            Err(e) => self.attempt_failed(e),
        }
    }
}

impl PipeOwner for DialerInner {
    fn pipe_closed(self: Arc<Self>, pipe: &Pipe) {
        note_pipe_closed(&*self, pipe);
        {
            let mut dst = self.dst.lock().unwrap();
            dst.pipe_up = false;
            if dst.closed || !dst.started {
                return;
            }
        }
        debug!(
            "dialer {}: pipe {} down, reconnecting",
            self.core.id(),
            pipe.id()
        );
        self.kick();
    }
}
