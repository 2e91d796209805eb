//! The listening endpoint.
//!
//! Binds synchronously, then accepts indefinitely. Resource exhaustion
//! (out of files or memory) pauses the accept loop briefly before
//! re-arming; any other accept failure re-arms immediately.

use std::sync::{Arc, Mutex, Weak};

use log::{debug, warn};

use crate::aio::Aio;
use crate::error::{Error, Result};
use crate::pipe::{Pipe, PipeOwner};
use crate::socket::SocketInner;
use crate::stream::{self, PropValue, Stream, StreamListener};
use crate::url::Url;

use super::{note_pipe_closed, start_pipe, Endpoint, EpCore, ACCEPT_RETRY};

struct ListenSt {
    started: bool,
    closed: bool,
}

pub(crate) struct ListenerInner {
    core: EpCore,
    sl: Box<dyn StreamListener>,
    lst: Mutex<ListenSt>,
    accept_aio: Aio,
    sleep_aio: Aio,
}

/// A listening endpoint handle. Clones share the listener.
#[derive(Clone)]
pub struct Listener {
    inner: Arc<ListenerInner>,
}

impl Listener {
    pub(crate) fn create(url: Url, socket: &Arc<SocketInner>) -> Result<Listener> {
        let sl = stream::listener(&url)?;
        let inner = Arc::new_cyclic(|weak: &Weak<ListenerInner>| {
            let wa = weak.clone();
            let accept_aio = Aio::new(move |aio| {
                if let Some(l) = wa.upgrade() {
                    l.accept_done(aio);
                }
            });
            let ws = weak.clone();
            let sleep_aio = Aio::new(move |_aio| {
                if let Some(l) = ws.upgrade() {
                    l.arm_accept();
                }
            });
            ListenerInner {
                core: EpCore::new(url, socket),
                sl,
                lst: Mutex::new(ListenSt {
                    started: false,
                    closed: false,
                }),
                accept_aio,
                sleep_aio,
            }
        });
        Ok(Listener { inner })
    }

    pub fn id(&self) -> u32 {
        self.inner.core.id()
    }

    pub fn url(&self) -> String {
        self.inner.core.url().to_string()
    }

    pub fn connected_count(&self) -> u64 {
        self.inner.core.connected_count()
    }

    pub fn nego_failures(&self) -> u64 {
        self.inner.core.nego_failures()
    }

    /// The listener's transport properties; after binding,
    /// `prop::LOCAL_ADDR` reports the real (possibly ephemeral) address.
    pub fn get(&self, name: &str) -> Result<PropValue> {
        self.inner.sl.get(name)
    }

    pub fn set(&self, name: &str, value: PropValue) -> Result<()> {
        self.inner.sl.set(name, value)
    }

    /// Binds and starts accepting. Bind failures surface here and leave
    /// the endpoint unstarted.
    pub(crate) fn listen(&self) -> Result<()> {
        {
            let mut lst = self.inner.lst.lock().unwrap();
            if lst.closed {
                return Err(Error::Closed);
            }
            if lst.started {
                return Err(Error::Busy);
            }
            self.inner.sl.listen()?;
            lst.started = true;
        }
        self.inner.arm_accept();
        Ok(())
    }

    pub(crate) fn pop_waitpipe(&self) -> Option<Pipe> {
        self.inner.core.pop_waitpipe()
    }

    pub fn close(&self) {
        {
            let mut lst = self.inner.lst.lock().unwrap();
            if lst.closed {
                return;
            }
            lst.closed = true;
        }
        self.inner.accept_aio.abort(Error::Closed);
        self.inner.sleep_aio.abort(Error::Closed);
        self.inner.sl.close();
        self.inner.core.close();
    }
}

impl ListenerInner {
    fn arm_accept(self: &Arc<Self>) {
        {
            let lst = self.lst.lock().unwrap();
            if lst.closed || !lst.started {
                return;
            }
        }
        self.sl.accept(&self.accept_aio);
    }

    fn accept_done(self: &Arc<Self>, aio: &Aio) {
        match aio.result() {
            Ok(()) => {
                if let Some(stream) = aio.take_output::<Box<dyn Stream>>(0) {
                    start_pipe(self, stream);
                }
                self.arm_accept();
            }
            Err(Error::Closed) | Err(Error::Stopped) => {}
            Err(e @ Error::NoFiles) | Err(e @ Error::NoMemory) => {
                warn!(
                    "listener {}: accept failed ({}), pausing",
                    self.core.id(),
                    e
                );
                self.sleep_aio.sleep(ACCEPT_RETRY);
            }
            Err(e) => {
                debug!("listener {}: accept failed: {}", self.core.id(), e);
                self.arm_accept();
            }
        }
    }
}

impl Endpoint for ListenerInner {
    fn core(&self) -> &EpCore {
        &self.core
    }

    fn nego_result(self: &Arc<Self>, _res: Result<()>) {}
}

impl PipeOwner for ListenerInner {
    fn pipe_closed(self: Arc<Self>, pipe: &Pipe) {
        note_pipe_closed(&*self, pipe);
    }
}
