//! SP framing over byte streams.
//!
//! Two phases per connection. Negotiation exchanges exactly eight bytes
//! each way (`00 53 50 00 PH PL 00 00`); the write and the read are in
//! flight together and either may finish first. The message phase frames
//! every message with an 8-byte big-endian length covering the header
//! and body regions.
//!
//! One internal send AIO and one internal receive AIO drive the
//! underlying stream; partial transfers are resumed by advancing the
//! segment list or re-issuing the read with the same buffer.

use std::collections::VecDeque;
use std::sync::{Arc, Mutex, MutexGuard, Weak};

use bytes::{Bytes, BytesMut};
use log::{debug, warn};

use crate::aio::Aio;
use crate::error::{Error, Result};
use crate::msg::Message;
use crate::pipe::PipeStats;
use crate::stream::{advance_segs, PropValue, Stream};

use super::{neg_header, parse_neg_header, MsgStream, NEG_LEN};

/// Size of the big-endian message length prefix.
const LEN_PREFIX: usize = 8;

#[derive(Clone, Copy, PartialEq)]
enum Phase {
    Init,
    Nego,
    Ready,
    Closed,
}

enum RxPhase {
    Idle,
    Head,
    Body { want: usize },
}

struct St {
    phase: Phase,

    neg_aio: Option<Aio>,
    neg_tx: Vec<Bytes>,
    neg_tx_done: bool,
    neg_rx_done: bool,
    peer: u16,

    sendq: VecDeque<Aio>,
    tx_user: Option<Aio>,
    tx_segs: Vec<Bytes>,
    tx_len: usize,
    tx_busy: bool,

    recvq: VecDeque<Aio>,
    rx_user: Option<Aio>,
    rx_phase: RxPhase,
    rx_busy: bool,

    recvmax: usize,
    stats: Option<Arc<PipeStats>>,
}

pub(crate) struct SpStream {
    inner: Arc<SpInner>,
}

struct SpInner {
    stream: Box<dyn Stream>,
    self_proto: u16,
    st: Mutex<St>,
    tx_aio: Aio,
    rx_aio: Aio,
}

impl SpStream {
    pub(crate) fn new(stream: Box<dyn Stream>, self_proto: u16) -> SpStream {
        let inner = Arc::new_cyclic(|weak: &Weak<SpInner>| {
            let wt = weak.clone();
            let tx_aio = Aio::new(move |aio| {
                if let Some(inner) = wt.upgrade() {
                    SpInner::tx_done(&inner, aio);
                }
            });
            let wr = weak.clone();
            let rx_aio = Aio::new(move |aio| {
                if let Some(inner) = wr.upgrade() {
                    SpInner::rx_done(&inner, aio);
                }
            });
            SpInner {
                stream,
                self_proto,
                st: Mutex::new(St {
                    phase: Phase::Init,
                    neg_aio: None,
                    neg_tx: Vec::new(),
                    neg_tx_done: false,
                    neg_rx_done: false,
                    peer: 0,
                    sendq: VecDeque::new(),
                    tx_user: None,
                    tx_segs: Vec::new(),
                    tx_len: 0,
                    tx_busy: false,
                    recvq: VecDeque::new(),
                    rx_user: None,
                    rx_phase: RxPhase::Idle,
                    rx_busy: false,
                    recvmax: 0,
                    stats: None,
                }),
                tx_aio,
                rx_aio,
            }
        });
        SpStream { inner }
    }
}

impl SpInner {
    fn lock(&self) -> MutexGuard<'_, St> {
        self.st.lock().unwrap()
    }

    // ---- negotiation ----------------------------------------------------

    fn start_nego(self: &Arc<Self>, aio: &Aio) {
        if !aio.begin() {
            return;
        }
        let mut st = self.lock();
        if st.phase != Phase::Init {
            drop(st);
            aio.finish_error(Error::InvalidArgument);
            return;
        }
        let me = self.clone();
        if let Err(rv) = aio.schedule(Box::new(move |a: &Aio, res: Result<()>| {
            me.cancel_nego(a, res.err().unwrap_or(Error::Canceled));
        })) {
            drop(st);
            aio.finish_error(rv);
            return;
        }
        st.phase = Phase::Nego;
        st.neg_aio = Some(aio.clone());
        st.neg_tx = vec![Bytes::copy_from_slice(&neg_header(self.self_proto))];

        st.tx_busy = true;
        self.tx_aio.set_tx(st.neg_tx.clone());
        self.stream.send(&self.tx_aio);

        st.rx_busy = true;
        self.rx_aio.set_rx(BytesMut::with_capacity(NEG_LEN), NEG_LEN);
        self.stream.recv(&self.rx_aio);
    }

    fn cancel_nego(self: &Arc<Self>, aio: &Aio, err: Error) {
        let took = {
            let mut st = self.lock();
            match &st.neg_aio {
                Some(a) if a.same(aio) => {
                    st.neg_aio = None;
                    true
                }
                _ => false,
            }
        };
        if took {
            aio.finish_error(err);
            self.close_all();
        }
    }

    fn fail_nego(self: &Arc<Self>, st: &mut MutexGuard<'_, St>, err: Error) {
        debug!("negotiation failed: {}", err);
        let aio = st.neg_aio.take();
        if let Some(aio) = aio {
            aio.finish_error(err);
        }
        st.phase = Phase::Closed;
        self.stream.close();
    }

    fn check_nego_done(self: &Arc<Self>, st: &mut MutexGuard<'_, St>) {
        if !(st.neg_tx_done && st.neg_rx_done) {
            return;
        }
        st.phase = Phase::Ready;
        if let Some(aio) = st.neg_aio.take() {
            aio.finish(Ok(()), 0);
        }
        self.start_tx(st);
        self.start_rx(st);
    }

    // ---- send path ------------------------------------------------------

    fn submit_send(self: &Arc<Self>, aio: &Aio) {
        if !aio.begin() {
            return;
        }
        let mut st = self.lock();
        if st.phase == Phase::Closed {
            drop(st);
            aio.finish_error(Error::Closed);
            return;
        }
        let me = self.clone();
        if let Err(rv) = aio.schedule(Box::new(move |a: &Aio, res: Result<()>| {
            me.cancel_send(a, res.err().unwrap_or(Error::Canceled));
        })) {
            drop(st);
            aio.finish_error(rv);
            return;
        }
        st.sendq.push_back(aio.clone());
        if st.phase == Phase::Ready {
            self.start_tx(&mut st);
        }
    }

    /// A canceled send that is already on the wire has to fail through
    /// the underlying AIO; anything still queued is simply removed. Only
    /// the send list is searched here.
    fn cancel_send(self: &Arc<Self>, aio: &Aio, err: Error) {
        enum Found {
            Queued,
            InFlight,
            No,
        }
        let found = {
            let mut st = self.lock();
            if let Some(pos) = st.sendq.iter().position(|a| a.same(aio)) {
                st.sendq.remove(pos);
                Found::Queued
            } else if st.tx_user.as_ref().map(|a| a.same(aio)) == Some(true) {
                Found::InFlight
            } else {
                Found::No
            }
        };
        match found {
            Found::Queued => aio.finish_error(err),
            Found::InFlight => self.tx_aio.abort(err),
            Found::No => {}
        }
    }

    /// Pulls the next queued message and puts its frame on the wire.
    fn start_tx(self: &Arc<Self>, st: &mut MutexGuard<'_, St>) {
        if st.tx_user.is_some() || st.tx_busy {
            return;
        }
        let Some(aio) = st.sendq.pop_front() else {
            return;
        };
        let Some(msg) = aio.take_msg() else {
            aio.finish_error(Error::InvalidArgument);
            return self.start_tx(st);
        };
        let len = msg.len();
        let mut segs = Vec::with_capacity(3);
        segs.push(Bytes::copy_from_slice(&(len as u64).to_be_bytes()));
        let (header, body) = msg.into_segments();
        if !header.is_empty() {
            segs.push(header);
        }
        if !body.is_empty() {
            segs.push(body);
        }
        st.tx_user = Some(aio);
        st.tx_len = len;
        st.tx_segs = segs;
        self.issue_tx(st);
    }

    fn issue_tx(self: &Arc<Self>, st: &mut MutexGuard<'_, St>) {
        st.tx_busy = true;
        self.tx_aio.set_tx(st.tx_segs.clone());
        self.stream.send(&self.tx_aio);
    }

    fn tx_done(self: &Arc<Self>, aio: &Aio) {
        let res = aio.result();
        let count = aio.count();
        let mut st = self.lock();
        st.tx_busy = false;
        match st.phase {
            Phase::Closed | Phase::Init => {}
            Phase::Nego => match res {
                Ok(()) => {
                    advance_segs(&mut st.neg_tx, count);
                    if st.neg_tx.is_empty() {
                        st.neg_tx_done = true;
                        self.check_nego_done(&mut st);
                    } else {
                        st.tx_busy = true;
                        self.tx_aio.set_tx(st.neg_tx.clone());
                        self.stream.send(&self.tx_aio);
                    }
                }
                Err(e) => self.fail_nego(&mut st, e),
            },
            Phase::Ready => match res {
                Ok(()) => {
                    advance_segs(&mut st.tx_segs, count);
                    if st.tx_segs.is_empty() {
                        if let Some(user) = st.tx_user.take() {
                            if let Some(stats) = &st.stats {
                                stats.add_tx(st.tx_len);
                            }
                            user.finish(Ok(()), st.tx_len);
                        }
                        self.start_tx(&mut st);
                    } else {
                        self.issue_tx(&mut st);
                    }
                }
                Err(e) => {
                    if let Some(user) = st.tx_user.take() {
                        user.finish_error(e);
                    }
                    st.tx_segs.clear();
                    self.start_tx(&mut st);
                }
            },
        }
    }

    // ---- receive path ---------------------------------------------------

    fn submit_recv(self: &Arc<Self>, aio: &Aio) {
        if !aio.begin() {
            return;
        }
        let mut st = self.lock();
        if st.phase == Phase::Closed {
            drop(st);
            aio.finish_error(Error::Closed);
            return;
        }
        let me = self.clone();
        if let Err(rv) = aio.schedule(Box::new(move |a: &Aio, res: Result<()>| {
            me.cancel_recv(a, res.err().unwrap_or(Error::Canceled));
        })) {
            drop(st);
            aio.finish_error(rv);
            return;
        }
        st.recvq.push_back(aio.clone());
        if st.phase == Phase::Ready {
            self.start_rx(&mut st);
        }
    }

    fn cancel_recv(self: &Arc<Self>, aio: &Aio, err: Error) {
        enum Found {
            Queued,
            InFlight,
            No,
        }
        let found = {
            let mut st = self.lock();
            if let Some(pos) = st.recvq.iter().position(|a| a.same(aio)) {
                st.recvq.remove(pos);
                Found::Queued
            } else if st.rx_user.as_ref().map(|a| a.same(aio)) == Some(true) {
                Found::InFlight
            } else {
                Found::No
            }
        };
        match found {
            Found::Queued => aio.finish_error(err),
            Found::InFlight => self.rx_aio.abort(err),
            Found::No => {}
        }
    }

    /// Begins reading the next frame when a receiver is waiting.
    fn start_rx(self: &Arc<Self>, st: &mut MutexGuard<'_, St>) {
        if st.rx_user.is_some() || st.rx_busy {
            return;
        }
        let Some(aio) = st.recvq.pop_front() else {
            return;
        };
        st.rx_user = Some(aio);
        st.rx_phase = RxPhase::Head;
        st.rx_busy = true;
        self.rx_aio
            .set_rx(BytesMut::with_capacity(LEN_PREFIX), LEN_PREFIX);
        self.stream.recv(&self.rx_aio);
    }

    fn rx_done(self: &Arc<Self>, aio: &Aio) {
        let res = aio.result();
        let mut st = self.lock();
        st.rx_busy = false;
        let buf = aio.take_rx().unwrap_or_default();
        match st.phase {
            Phase::Closed | Phase::Init => {}
            Phase::Nego => match res {
                Ok(()) => {
                    if buf.len() < NEG_LEN {
                        st.rx_busy = true;
                        self.rx_aio.set_rx(buf, NEG_LEN);
                        self.stream.recv(&self.rx_aio);
                        return;
                    }
                    match parse_neg_header(&buf) {
                        Ok(peer) => {
                            st.peer = peer;
                            st.neg_rx_done = true;
                            self.check_nego_done(&mut st);
                        }
                        Err(e) => self.fail_nego(&mut st, e),
                    }
                }
                Err(e) => self.fail_nego(&mut st, e),
            },
            Phase::Ready => match res {
                Ok(()) => self.rx_advance(&mut st, buf),
                Err(e) => {
                    st.rx_phase = RxPhase::Idle;
                    if let Some(user) = st.rx_user.take() {
                        user.finish_error(e);
                    }
                    self.start_rx(&mut st);
                }
            },
        }
    }

    fn rx_advance(self: &Arc<Self>, st: &mut MutexGuard<'_, St>, buf: BytesMut) {
        match st.rx_phase {
            RxPhase::Idle => {}
            RxPhase::Head => {
                if buf.len() < LEN_PREFIX {
                    st.rx_busy = true;
                    self.rx_aio.set_rx(buf, LEN_PREFIX);
                    self.stream.recv(&self.rx_aio);
                    return;
                }
                let len = u64::from_be_bytes(buf[..LEN_PREFIX].try_into().unwrap());
                if st.recvmax > 0 && len > st.recvmax as u64 {
                    warn!("oversize message: {} bytes (limit {})", len, st.recvmax);
                    st.rx_phase = RxPhase::Idle;
                    if let Some(user) = st.rx_user.take() {
                        user.finish_error(Error::MessageTooBig);
                    }
                    // The pipe stays open; whether to drop it is the
                    // protocol layer's call.
                    self.start_rx(st);
                    return;
                }
                let want = len as usize;
                if want == 0 {
                    self.deliver(st, BytesMut::new());
                    return;
                }
                st.rx_phase = RxPhase::Body { want };
                st.rx_busy = true;
                self.rx_aio.set_rx(BytesMut::with_capacity(want), want);
                self.stream.recv(&self.rx_aio);
            }
            RxPhase::Body { want } => {
                if buf.len() < want {
                    st.rx_busy = true;
                    self.rx_aio.set_rx(buf, want);
                    self.stream.recv(&self.rx_aio);
                    return;
                }
                self.deliver(st, buf);
            }
        }
    }

    fn deliver(self: &Arc<Self>, st: &mut MutexGuard<'_, St>, body: BytesMut) {
        st.rx_phase = RxPhase::Idle;
        let msg = Message::from_recv(body);
        if let Some(stats) = &st.stats {
            stats.add_rx(msg.len());
        }
        if let Some(user) = st.rx_user.take() {
            user.finish_msg(msg);
        }
        self.start_rx(st);
    }

    // ---- teardown -------------------------------------------------------

    fn close_all(self: &Arc<Self>) {
        let pending = {
            let mut st = self.lock();
            if st.phase == Phase::Closed {
                return;
            }
            st.phase = Phase::Closed;
            let mut pending: Vec<Aio> = Vec::new();
            pending.extend(st.neg_aio.take());
            pending.extend(st.tx_user.take());
            pending.extend(st.rx_user.take());
            pending.extend(std::mem::take(&mut st.sendq));
            pending.extend(std::mem::take(&mut st.recvq));
            pending
        };
        for aio in pending {
            aio.finish_error(Error::Closed);
        }
        self.stream.close();
    }
}

impl MsgStream for SpStream {
    fn negotiate(&self, aio: &Aio) {
        self.inner.start_nego(aio);
    }

    fn send(&self, aio: &Aio) {
        self.inner.submit_send(aio);
    }

    fn recv(&self, aio: &Aio) {
        self.inner.submit_recv(aio);
    }

    fn close(&self) {
        self.inner.close_all();
    }

    fn stop(&self) {
        self.inner.close_all();
        self.inner.tx_aio.stop();
        self.inner.rx_aio.stop();
    }

    fn peer_proto(&self) -> u16 {
        self.inner.lock().peer
    }

    fn set_recvmax(&self, max: usize) {
        self.inner.lock().recvmax = max;
    }

    fn set_stats(&self, stats: Arc<PipeStats>) {
        self.inner.lock().stats = Some(stats);
    }

    fn get(&self, name: &str) -> Result<PropValue> {
        self.inner.stream.get(name)
    }
}
