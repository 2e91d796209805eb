//! In-process stream transport.
//!
//! A dial and an accept rendezvous by name and yield the two ends of a
//! byte pipe held entirely in memory. Each direction is a bounded ring;
//! a full ring exerts back-pressure on senders exactly like a socket
//! send buffer. Completion happens inline (no poller involvement), which
//! also makes this the transport of choice for exercising the framing
//! layers in tests.

use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex, MutexGuard, OnceLock, Weak};

use crate::aio::Aio;
use crate::error::{Error, Result};
use crate::stream::{prop, PropValue, Stream, StreamDialer, StreamListener};
use crate::url::Url;

/// Per-direction buffer limit.
const RING_CAP: usize = 64 * 1024;

/// One direction of the pair: a byte ring plus the send queue feeding it
/// and the recv queue draining it.
struct Dir {
    buf: VecDeque<u8>,
    closed: bool,
    sendq: VecDeque<Aio>,
    recvq: VecDeque<Aio>,
}

impl Dir {
    fn new() -> Dir {
        Dir {
            buf: VecDeque::new(),
            closed: false,
            sendq: VecDeque::new(),
            recvq: VecDeque::new(),
        }
    }
}

struct PairInner {
    name: String,
    ab: Mutex<Dir>,
    ba: Mutex<Dir>,
}

/// Which end of the pair a stream handle is.
#[derive(Clone, Copy, PartialEq)]
enum Side {
    A,
    B,
}

pub(crate) struct InprocStream {
    pair: Arc<PairInner>,
    side: Side,
}

impl PairInner {
    fn dir(&self, side: Side, outbound: bool) -> &Mutex<Dir> {
        match (side, outbound) {
            (Side::A, true) | (Side::B, false) => &self.ab,
            _ => &self.ba,
        }
    }

    /// Moves bytes: send queue -> ring -> recv queue, until nothing
    /// further can progress. Completions fire under the direction lock;
    /// the callback itself still runs on a worker.
    fn service(dir: &mut MutexGuard<'_, Dir>) {
        loop {
            let mut progressed = false;

            if let Some(aio) = dir.sendq.front().cloned() {
                if dir.closed {
                    dir.sendq.pop_front();
                    aio.finish_error(Error::Closed);
                    progressed = true;
                } else {
                    let space = RING_CAP - dir.buf.len();
                    if space > 0 {
                        let segs = aio.tx();
                        let total: usize = segs.iter().map(|s| s.len()).sum();
                        if total == 0 {
                            dir.sendq.pop_front();
                            aio.finish(Ok(()), 0);
                            progressed = true;
                        } else {
                            let mut moved = 0;
                            for seg in segs.iter() {
                                if moved == space {
                                    break;
                                }
                                let take = seg.len().min(space - moved);
                                dir.buf.extend(&seg[..take]);
                                moved += take;
                            }
                            if moved > 0 {
                                dir.sendq.pop_front();
                                aio.finish(Ok(()), moved);
                                progressed = true;
                            }
                        }
                    }
                }
            }

            if let Some(aio) = dir.recvq.front().cloned() {
                if !dir.buf.is_empty() {
                    match aio.take_rx_full() {
                        Some((mut buf, want)) => {
                            let need = want.saturating_sub(buf.len());
                            let take = need.min(dir.buf.len());
                            if take > 0 || need == 0 {
                                buf.extend(dir.buf.drain(..take));
                                aio.set_rx(buf, want);
                                dir.recvq.pop_front();
                                aio.finish(Ok(()), take);
                                progressed = true;
                            } else {
                                aio.set_rx(buf, want);
                            }
                        }
                        None => {
                            dir.recvq.pop_front();
                            aio.finish_error(Error::InvalidArgument);
                            progressed = true;
                        }
                    }
                } else if dir.closed {
                    dir.recvq.pop_front();
                    aio.finish_error(Error::Closed);
                    progressed = true;
                }
            }

            if !progressed {
                return;
            }
        }
    }
}

impl InprocStream {
    fn pair(name: &str) -> (InprocStream, InprocStream) {
        let inner = Arc::new(PairInner {
            name: name.to_string(),
            ab: Mutex::new(Dir::new()),
            ba: Mutex::new(Dir::new()),
        });
        (
            InprocStream {
                pair: inner.clone(),
                side: Side::A,
            },
            InprocStream {
                pair: inner,
                side: Side::B,
            },
        )
    }
}

impl Stream for InprocStream {
    fn send(&self, aio: &Aio) {
        if !aio.begin() {
            return;
        }
        let dir = self.pair.dir(self.side, true);
        let mut d = dir.lock().unwrap();
        if d.closed {
            drop(d);
            aio.finish_error(Error::Closed);
            return;
        }
        let pair = self.pair.clone();
        let side = self.side;
        if let Err(rv) = aio.schedule(Box::new(move |a: &Aio, res: Result<()>| {
            let err = res.err().unwrap_or(Error::Canceled);
            let found = {
                let mut d = pair.dir(side, true).lock().unwrap();
                match d.sendq.iter().position(|q| q.same(a)) {
                    Some(pos) => {
                        d.sendq.remove(pos);
                        true
                    }
                    None => false,
                }
            };
            if found {
                a.finish_error(err);
            }
        })) {
            drop(d);
            aio.finish_error(rv);
            return;
        }
        d.sendq.push_back(aio.clone());
        PairInner::service(&mut d);
    }

    fn recv(&self, aio: &Aio) {
        if !aio.begin() {
            return;
        }
        let dir = self.pair.dir(self.side, false);
        let mut d = dir.lock().unwrap();
        if d.closed && d.buf.is_empty() {
            drop(d);
            aio.finish_error(Error::Closed);
            return;
        }
        let pair = self.pair.clone();
        let side = self.side;
        if let Err(rv) = aio.schedule(Box::new(move |a: &Aio, res: Result<()>| {
            let err = res.err().unwrap_or(Error::Canceled);
            let found = {
                let mut d = pair.dir(side, false).lock().unwrap();
                match d.recvq.iter().position(|q| q.same(a)) {
                    Some(pos) => {
                        d.recvq.remove(pos);
                        true
                    }
                    None => false,
                }
            };
            if found {
                a.finish_error(err);
            }
        })) {
            drop(d);
            aio.finish_error(rv);
            return;
        }
        d.recvq.push_back(aio.clone());
        PairInner::service(&mut d);
    }

    fn close(&self) {
        // Fixed ab-then-ba order regardless of side, so two racing
        // closes cannot deadlock.
        let (mut ab, mut ba) = (self.pair.ab.lock().unwrap(), self.pair.ba.lock().unwrap());
        for d in [&mut ab, &mut ba] {
            d.closed = true;
        }
        drop(ba);
        PairInner::service(&mut ab);
        drop(ab);
        let mut ba = self.pair.ba.lock().unwrap();
        PairInner::service(&mut ba);
    }

    fn stop(&self) {
        self.close();
    }

    fn get(&self, name: &str) -> Result<PropValue> {
        match name {
            prop::LOCAL_ADDR | prop::REMOTE_ADDR => Ok(PropValue::Str(self.pair.name.clone())),
            _ => Err(Error::NotSupported),
        }
    }

    fn set(&self, _name: &str, _value: PropValue) -> Result<()> {
        Err(Error::NotSupported)
    }
}

impl Drop for InprocStream {
    fn drop(&mut self) {
        self.close();
    }
}

// ---- rendezvous --------------------------------------------------------

struct ListenerInner {
    name: String,
    st: Mutex<ListenSt>,
}

struct ListenSt {
    listening: bool,
    closed: bool,
    acceptq: VecDeque<Aio>,
    dialq: VecDeque<Aio>,
}

fn registry() -> &'static Mutex<HashMap<String, Weak<ListenerInner>>> {
    static REGISTRY: OnceLock<Mutex<HashMap<String, Weak<ListenerInner>>>> = OnceLock::new();
    REGISTRY.get_or_init(|| Mutex::new(HashMap::new()))
}

fn lookup(name: &str) -> Option<Arc<ListenerInner>> {
    registry().lock().unwrap().get(name).and_then(Weak::upgrade)
}

/// Matches one dial AIO with one accept AIO, handing each its end of a
/// fresh pair.
fn join(name: &str, dial: Aio, accept: Aio) {
    let (a, b) = InprocStream::pair(name);
    dial.set_output(0, Box::new(a) as Box<dyn Stream>);
    accept.set_output(0, Box::new(b) as Box<dyn Stream>);
    dial.finish(Ok(()), 0);
    accept.finish(Ok(()), 0);
}

pub(crate) struct InprocDialer {
    url: Url,
}

impl InprocDialer {
    pub(crate) fn new(url: Url) -> InprocDialer {
        InprocDialer { url }
    }
}

impl StreamDialer for InprocDialer {
    fn dial(&self, aio: &Aio) {
        if !aio.begin() {
            return;
        }
        let Some(listener) = lookup(self.url.path()) else {
            aio.finish_error(Error::ConnRefused);
            return;
        };
        let mut st = listener.st.lock().unwrap();
        if st.closed || !st.listening {
            drop(st);
            aio.finish_error(Error::ConnRefused);
            return;
        }
        if let Some(accept) = st.acceptq.pop_front() {
            drop(st);
            join(self.url.path(), aio.clone(), accept);
            return;
        }
        let l = listener.clone();
        if let Err(rv) = aio.schedule(Box::new(move |a: &Aio, res: Result<()>| {
            let err = res.err().unwrap_or(Error::Canceled);
            let found = {
                let mut st = l.st.lock().unwrap();
                match st.dialq.iter().position(|q| q.same(a)) {
                    Some(pos) => {
                        st.dialq.remove(pos);
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
        st.dialq.push_back(aio.clone());
    }

    fn close(&self) {}

    fn get(&self, name: &str) -> Result<PropValue> {
        match name {
            prop::LOCAL_ADDR | prop::REMOTE_ADDR => Ok(PropValue::Str(self.url.path().to_string())),
            _ => Err(Error::NotSupported),
        }
    }

    fn set(&self, _name: &str, _value: PropValue) -> Result<()> {
        Err(Error::NotSupported)
    }
}

pub(crate) struct InprocListener {
    url: Url,
    inner: Arc<ListenerInner>,
}

impl InprocListener {
    pub(crate) fn new(url: Url) -> InprocListener {
        InprocListener {
            inner: Arc::new(ListenerInner {
                name: url.path().to_string(),
                st: Mutex::new(ListenSt {
                    listening: false,
                    closed: false,
                    acceptq: VecDeque::new(),
                    dialq: VecDeque::new(),
                }),
            }),
            url,
        }
    }
}

impl StreamListener for InprocListener {
    fn listen(&self) -> Result<()> {
        let mut reg = registry().lock().unwrap();
        if let Some(existing) = reg.get(&self.inner.name).and_then(Weak::upgrade) {
            if existing.st.lock().unwrap().listening {
                return Err(Error::AddressInUse);
            }
        }
        self.inner.st.lock().unwrap().listening = true;
        reg.insert(self.inner.name.clone(), Arc::downgrade(&self.inner));
        Ok(())
    }

    fn accept(&self, aio: &Aio) {
        if !aio.begin() {
            return;
        }
        let mut st = self.inner.st.lock().unwrap();
        if st.closed {
            drop(st);
            aio.finish_error(Error::Closed);
            return;
        }
        if !st.listening {
            drop(st);
            aio.finish_error(Error::InvalidArgument);
            return;
        }
        if let Some(dial) = st.dialq.pop_front() {
            drop(st);
            join(&self.inner.name, dial, aio.clone());
            return;
        }
        let l = self.inner.clone();
        if let Err(rv) = aio.schedule(Box::new(move |a: &Aio, res: Result<()>| {
            let err = res.err().unwrap_or(Error::Canceled);
            let found = {
                let mut st = l.st.lock().unwrap();
                match st.acceptq.iter().position(|q| q.same(a)) {
                    Some(pos) => {
                        st.acceptq.remove(pos);
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
        st.acceptq.push_back(aio.clone());
    }

    fn close(&self) {
        let (accepts, dials) = {
            let mut st = self.inner.st.lock().unwrap();
            st.closed = true;
            st.listening = false;
            (
                std::mem::take(&mut st.acceptq),
                std::mem::take(&mut st.dialq),
            )
        };
        for aio in accepts {
            aio.finish_error(Error::Closed);
        }
        for aio in dials {
            aio.finish_error(Error::ConnRefused);
        }
        let mut reg = registry().lock().unwrap();
        if let Some(w) = reg.get(&self.inner.name) {
            if w.upgrade().map(|l| Arc::ptr_eq(&l, &self.inner)) == Some(true) {
                reg.remove(&self.inner.name);
            }
        }
    }

    fn get(&self, name: &str) -> Result<PropValue> {
        match name {
            prop::LOCAL_ADDR => Ok(PropValue::Str(self.url.path().to_string())),
            _ => Err(Error::NotSupported),
        }
    }

    fn set(&self, _name: &str, _value: PropValue) -> Result<()> {
        Err(Error::NotSupported)
    }
}
