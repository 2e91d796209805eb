//! The WebSocket connection.
//!
//! Drives the HTTP upgrade, then the RFC 6455 frame machine. The receive
//! side walks READ_HEAD2 → READ_EXTLEN → READ_MASK → READ_PAYLOAD →
//! dispatch; the transmit side alternates IDLE and WRITING with control
//! frames jumping the data queue. A connection runs in stream mode
//! (frame payloads feed byte-oriented receives) or message mode (whole
//! messages in and out); the SP transport layers its framing over stream
//! mode.

use std::collections::VecDeque;
use std::sync::{Arc, Mutex, MutexGuard, Weak};

use bytes::{Bytes, BytesMut};
use log::{debug, trace, warn};

use crate::aio::Aio;
use crate::error::{Error, Result};
use crate::msg::Message;
use crate::stream::{advance_segs, PropValue, Stream};

use super::frame::{
    apply_mask, close_code, close_payload, encode_frame, ext_len_bytes, parse_ext_len,
    parse_head2, FrameHeader, Opcode, MAX_CONTROL_PAYLOAD,
};
use super::handshake::{
    build_request, build_response, make_key, parse_request, parse_response, UpgradeRequest,
    UpgradeResponse, MAX_HEADERS_LEN,
};
use super::{Hook, Mode, Role, WsOpts};

#[derive(Clone, Copy, PartialEq)]
enum Phase {
    /// Client: sending the upgrade request. Server: sending the
    /// response (or a refusal).
    HsSend,
    /// Waiting for the peer's half of the upgrade.
    HsRecv,
    Open,
    Dead,
}

enum RxStage {
    Head2,
    ExtLen(usize),
    Mask,
    Payload,
}

struct Ctrl {
    data: Bytes,
    close: bool,
}

struct WsSt {
    phase: Phase,

    // upgrade
    hs_user: Option<Aio>,
    hs_out: Vec<Bytes>,
    hs_in: BytesMut,
    hs_key: String,
    hs_refused: Option<Error>,

    // receive machine
    pending: BytesMut,
    rx_stage: RxStage,
    rx_hdr: Option<FrameHeader>,
    rx_busy: bool,
    frag_op: Option<Opcode>,
    frag_buf: BytesMut,
    stream_buf: BytesMut,
    msgq: VecDeque<Message>,
    recvq: VecDeque<Aio>,

    // transmit machine
    sendq: VecDeque<Aio>,
    tx_user: Option<Aio>,
    tx_data: Bytes,
    tx_off: usize,
    tx_frame_end: usize,
    tx_user_count: usize,
    tx_busy: bool,
    tx_segs: Vec<Bytes>,
    cur_close: bool,
    ctrlq: VecDeque<Ctrl>,
    queued_close: bool,
    sent_close: bool,
    peer_closed: bool,
    user_closed: bool,
    fatal: Option<Error>,

    selected_protocol: Option<String>,
}

pub(crate) struct WsInner {
    lower: Box<dyn Stream>,
    role: Role,
    opts: WsOpts,
    hook: Option<Arc<Hook>>,
    hs_host: String,
    hs_path: String,
    st: Mutex<WsSt>,
    tx_aio: Aio,
    rx_aio: Aio,
}

/// A WebSocket connection handle; this is the `Stream` the upgrade
/// hands back.
pub(crate) struct WsConn {
    inner: Arc<WsInner>,
}

impl WsConn {
    /// Starts a client-side connection over a connected lower stream.
    /// `user` (already begun and scheduled by the dialer) completes with
    /// the connection handle once the upgrade finishes.
    pub(crate) fn client(
        lower: Box<dyn Stream>,
        host: String,
        path: String,
        opts: WsOpts,
        user: Aio,
    ) -> WsConn {
        let conn = WsConn::build(lower, Role::Client, opts, None, host, path, user);
        conn.inner.start_client();
        conn
    }

    /// Starts a server-side connection over an accepted lower stream.
    pub(crate) fn server(
        lower: Box<dyn Stream>,
        opts: WsOpts,
        hook: Option<Arc<Hook>>,
        user: Aio,
    ) -> WsConn {
        let conn = WsConn::build(
            lower,
            Role::Server,
            opts,
            hook,
            String::new(),
            String::new(),
            user,
        );
        conn.inner.start_server();
        conn
    }

    fn build(
        lower: Box<dyn Stream>,
        role: Role,
        opts: WsOpts,
        hook: Option<Arc<Hook>>,
        hs_host: String,
        hs_path: String,
        user: Aio,
    ) -> WsConn {
        let inner = Arc::new_cyclic(|weak: &Weak<WsInner>| {
            let wt = weak.clone();
            let tx_aio = Aio::new(move |aio| {
                if let Some(inner) = wt.upgrade() {
                    WsInner::tx_done(&inner, aio);
                }
            });
            let wr = weak.clone();
            let rx_aio = Aio::new(move |aio| {
                if let Some(inner) = wr.upgrade() {
                    WsInner::rx_done(&inner, aio);
                }
            });
            WsInner {
                lower,
                role,
                opts,
                hook,
                hs_host,
                hs_path,
                st: Mutex::new(WsSt {
                    phase: Phase::HsSend,
                    hs_user: Some(user),
                    hs_out: Vec::new(),
                    hs_in: BytesMut::new(),
                    hs_key: String::new(),
                    hs_refused: None,
                    pending: BytesMut::new(),
                    rx_stage: RxStage::Head2,
                    rx_hdr: None,
                    rx_busy: false,
                    frag_op: None,
                    frag_buf: BytesMut::new(),
                    stream_buf: BytesMut::new(),
                    msgq: VecDeque::new(),
                    recvq: VecDeque::new(),
                    sendq: VecDeque::new(),
                    tx_user: None,
                    tx_data: Bytes::new(),
                    tx_off: 0,
                    tx_frame_end: 0,
                    tx_user_count: 0,
                    tx_busy: false,
                    tx_segs: Vec::new(),
                    cur_close: false,
                    ctrlq: VecDeque::new(),
                    queued_close: false,
                    sent_close: false,
                    peer_closed: false,
                    user_closed: false,
                    fatal: None,
                    selected_protocol: None,
                }),
                tx_aio,
                rx_aio,
            }
        });
        WsConn { inner }
    }

    /// Tears down a connection whose upgrade the dialer canceled.
    pub(crate) fn abort_handshake(&self, err: Error) {
        self.inner.fail_handshake_ext(err);
    }
}

impl WsInner {
    fn lock(&self) -> MutexGuard<'_, WsSt> {
        self.st.lock().unwrap()
    }

    fn handle(self: &Arc<Self>) -> Box<dyn Stream> {
        Box::new(WsConn {
            inner: self.clone(),
        })
    }

    // ---- upgrade --------------------------------------------------------

    fn start_client(self: &Arc<Self>) {
        let mut st = self.lock();
        st.hs_key = make_key();
        let req = build_request(
            &self.hs_host,
            &self.hs_path,
            &st.hs_key,
            self.opts.protocol.as_deref(),
        );
        st.hs_out = vec![Bytes::from(req.into_bytes())];
        st.phase = Phase::HsSend;
        self.issue_tx(&mut st, None);
    }

    fn start_server(self: &Arc<Self>) {
        let mut st = self.lock();
        st.phase = Phase::HsRecv;
        self.issue_hs_read(&mut st);
    }

    fn issue_hs_read(self: &Arc<Self>, st: &mut MutexGuard<'_, WsSt>) {
        let have = st.hs_in.len();
        let want = (have + 2048).min(MAX_HEADERS_LEN);
        st.rx_busy = true;
        let buf = std::mem::take(&mut st.hs_in);
        self.rx_aio.set_rx(buf, want);
        self.lower.recv(&self.rx_aio);
    }

    /// Completes the upgrade: hand the user its stream handle and feed
    /// any bytes that arrived behind the headers to the frame machine.
    fn open_up(self: &Arc<Self>, st: &mut MutexGuard<'_, WsSt>) {
        st.phase = Phase::Open;
        if let Some(user) = st.hs_user.take() {
            user.set_output(0, self.handle());
            user.finish(Ok(()), 0);
        }
        self.advance_rx(st);
        self.kick_tx(st);
    }

    fn fail_handshake(self: &Arc<Self>, st: &mut MutexGuard<'_, WsSt>, err: Error) {
        debug!("websocket upgrade failed: {}", err);
        st.phase = Phase::Dead;
        if let Some(user) = st.hs_user.take() {
            user.finish_error(err);
        }
        self.lower.close();
    }

    fn fail_handshake_ext(self: &Arc<Self>, err: Error) {
        let mut st = self.lock();
        if st.phase == Phase::Open || st.phase == Phase::Dead {
            return;
        }
        self.fail_handshake(&mut st, err);
    }

    fn hs_rx(self: &Arc<Self>, st: &mut MutexGuard<'_, WsSt>) {
        if self.role == Role::Client {
            let parsed = parse_response(
                &st.hs_in,
                &st.hs_key,
                self.opts.protocol.as_deref(),
            );
            match parsed {
                Ok(None) => {
                    if st.hs_in.len() >= MAX_HEADERS_LEN {
                        self.fail_handshake(st, Error::ProtocolError);
                    } else {
                        self.issue_hs_read(st);
                    }
                }
                Ok(Some((consumed, selected))) => {
                    st.selected_protocol = selected;
                    let rest = st.hs_in.split_off(consumed);
                    st.pending = rest;
                    st.hs_in = BytesMut::new();
                    self.open_up(st);
                }
                Err(e) => self.fail_handshake(st, e),
            }
            return;
        }

        // server side
        match parse_request(&st.hs_in) {
            Ok(None) => {
                if st.hs_in.len() >= MAX_HEADERS_LEN {
                    self.refuse(st, 431, Error::ProtocolError);
                } else {
                    self.issue_hs_read(st);
                }
            }
            Ok(Some((req, consumed))) => {
                let mut resp = UpgradeResponse::accept();
                resp.protocol = self.select_protocol(&req);
                if let Some(hook) = &self.hook {
                    hook(&req, &mut resp);
                }
                st.hs_key = req.key.clone();
                st.selected_protocol = resp.protocol.clone();
                let rest = st.hs_in.split_off(consumed);
                st.pending = rest;
                st.hs_in = BytesMut::new();
                if resp.status != 101 {
                    st.hs_refused = Some(Error::ConnRefused);
                }
                st.hs_out = vec![Bytes::from(build_response(&resp, &st.hs_key).into_bytes())];
                st.phase = Phase::HsSend;
                self.issue_tx(st, None);
            }
            Err(status) => self.refuse(st, status, Error::ProtocolError),
        }
    }

    /// Answers a malformed upgrade with the HTTP status, then drops the
    /// connection.
    fn refuse(self: &Arc<Self>, st: &mut MutexGuard<'_, WsSt>, status: u16, err: Error) {
        debug!("refusing websocket upgrade: {}", status);
        let resp = UpgradeResponse {
            status,
            reason: reason_for(status).into(),
            protocol: None,
            extra_headers: Vec::new(),
        };
        st.hs_refused = Some(err);
        st.hs_out = vec![Bytes::from(build_response(&resp, "").into_bytes())];
        st.phase = Phase::HsSend;
        self.issue_tx(st, None);
    }

    /// Picks the first client-offered subprotocol this endpoint
    /// supports.
    fn select_protocol(&self, req: &UpgradeRequest) -> Option<String> {
        let supported = self.opts.protocol.as_deref()?;
        req.protocols
            .iter()
            .find(|offer| supported.split(',').any(|s| s.trim() == offer.as_str()))
            .cloned()
    }

    // ---- transmit machine ----------------------------------------------

    /// Arms the lower send with either handshake bytes or an encoded
    /// frame.
    fn issue_tx(self: &Arc<Self>, st: &mut MutexGuard<'_, WsSt>, frame: Option<Bytes>) {
        if let Some(frame) = frame {
            st.tx_segs = vec![frame];
        } else if st.phase == Phase::HsSend {
            st.tx_segs = st.hs_out.clone();
        }
        st.tx_busy = true;
        self.tx_aio.set_tx(st.tx_segs.clone());
        self.lower.send(&self.tx_aio);
    }

    fn mask_for_send(&self) -> Option<[u8; 4]> {
        match self.role {
            Role::Client => Some(rand::random()),
            Role::Server => None,
        }
    }

    /// Queues a control frame; control preempts data at the next frame
    /// boundary.
    fn queue_control(
        self: &Arc<Self>,
        st: &mut MutexGuard<'_, WsSt>,
        opcode: Opcode,
        payload: &[u8],
    ) {
        debug_assert!(payload.len() <= MAX_CONTROL_PAYLOAD);
        let frame = encode_frame(opcode, true, self.mask_for_send(), payload);
        let close = opcode == Opcode::Close;
        if close {
            st.queued_close = true;
        }
        st.ctrlq.push_back(Ctrl { data: frame, close });
    }

    fn kick_tx(self: &Arc<Self>, st: &mut MutexGuard<'_, WsSt>) {
        if st.tx_busy || st.phase != Phase::Open {
            return;
        }
        if let Some(ctrl) = st.ctrlq.pop_front() {
            st.cur_close = ctrl.close;
            self.issue_tx(st, Some(ctrl.data));
            return;
        }
        if st.sent_close || st.queued_close || st.fatal.is_some() || st.user_closed {
            return;
        }
        if st.tx_user.is_none() {
            let Some(aio) = st.sendq.pop_front() else {
                return;
            };
            match self.opts.mode {
                Mode::Message => {
                    let Some(msg) = aio.take_msg() else {
                        aio.finish_error(Error::InvalidArgument);
                        return self.kick_tx(st);
                    };
                    st.tx_user_count = msg.len();
                    let (header, body) = msg.into_segments();
                    let mut data = BytesMut::with_capacity(header.len() + body.len());
                    data.extend_from_slice(&header);
                    data.extend_from_slice(&body);
                    st.tx_data = data.freeze();
                }
                Mode::Stream => {
                    let segs = aio.tx();
                    let seg = segs.iter().find(|s| !s.is_empty()).cloned();
                    match seg {
                        Some(seg) => {
                            let take = seg.len().min(self.opts.fragsize);
                            st.tx_user_count = take;
                            st.tx_data = seg.slice(..take);
                        }
                        None => {
                            aio.finish(Ok(()), 0);
                            return self.kick_tx(st);
                        }
                    }
                }
            }
            st.tx_user = Some(aio);
            st.tx_off = 0;
        }
        // next fragment of the current message
        let len = st.tx_data.len();
        let end = (st.tx_off + self.opts.fragsize).min(len);
        let opcode = if st.tx_off == 0 {
            if self.opts.text {
                Opcode::Text
            } else {
                Opcode::Binary
            }
        } else {
            Opcode::Continuation
        };
        let fin = end == len;
        let payload = st.tx_data.slice(st.tx_off..end);
        st.tx_frame_end = end;
        trace!("ws frame out: {:?} fin={} len={}", opcode, fin, payload.len());
        let frame = encode_frame(opcode, fin, self.mask_for_send(), &payload);
        self.issue_tx(st, Some(frame));
    }

    fn tx_done(self: &Arc<Self>, aio: &Aio) {
        let res = aio.result();
        let count = aio.count();
        let mut st = self.lock();
        st.tx_busy = false;
        match st.phase {
            Phase::Dead => {}
            Phase::HsSend => match res {
                Ok(()) => {
                    advance_segs(&mut st.hs_out, count);
                    if !st.hs_out.is_empty() {
                        st.tx_segs = st.hs_out.clone();
                        st.tx_busy = true;
                        self.tx_aio.set_tx(st.tx_segs.clone());
                        self.lower.send(&self.tx_aio);
                        return;
                    }
                    match (self.role, st.hs_refused) {
                        (_, Some(err)) => self.fail_handshake(&mut st, err),
                        (Role::Client, None) => {
                            st.phase = Phase::HsRecv;
                            self.issue_hs_read(&mut st);
                        }
                        (Role::Server, None) => self.open_up(&mut st),
                    }
                }
                Err(e) => self.fail_handshake(&mut st, e),
            },
            Phase::HsRecv => {}
            Phase::Open => match res {
                Ok(()) => {
                    advance_segs(&mut st.tx_segs, count);
                    if !st.tx_segs.is_empty() {
                        st.tx_busy = true;
                        self.tx_aio.set_tx(st.tx_segs.clone());
                        self.lower.send(&self.tx_aio);
                        return;
                    }
                    if st.cur_close {
                        st.cur_close = false;
                        st.sent_close = true;
                        self.maybe_drop(&mut st);
                        if st.phase == Phase::Dead {
                            return;
                        }
                    } else if st.tx_user.is_some() {
                        st.tx_off = st.tx_frame_end;
                        if st.tx_off >= st.tx_data.len() {
                            let user = st.tx_user.take().unwrap();
                            let count = st.tx_user_count;
                            st.tx_data = Bytes::new();
                            user.finish(Ok(()), count);
                        }
                    }
                    self.kick_tx(&mut st);
                }
                Err(e) => {
                    debug!("ws lower send failed: {}", e);
                    self.conn_dead(&mut st, e);
                }
            },
        }
    }

    // ---- receive machine ------------------------------------------------

    fn rx_done(self: &Arc<Self>, aio: &Aio) {
        let res = aio.result();
        let mut st = self.lock();
        st.rx_busy = false;
        let buf = aio.take_rx().unwrap_or_default();
        match st.phase {
            Phase::Dead => {}
            Phase::HsSend => {}
            Phase::HsRecv => match res {
                Ok(()) => {
                    st.hs_in = buf;
                    self.hs_rx(&mut st);
                }
                Err(e) => self.fail_handshake(&mut st, e),
            },
            Phase::Open => match res {
                Ok(()) => {
                    st.pending = buf;
                    self.advance_rx(&mut st);
                }
                Err(e) => {
                    st.pending = buf;
                    self.conn_dead(&mut st, e);
                }
            },
        }
    }

    /// Consumes pending bytes through the frame stages until the machine
    /// stalls for input (issuing the next lower read) or pauses.
    fn advance_rx(self: &Arc<Self>, st: &mut MutexGuard<'_, WsSt>) {
        loop {
            if st.phase != Phase::Open
                || st.rx_busy
                || st.peer_closed
                || st.fatal.is_some()
            {
                return;
            }
            let need = match st.rx_stage {
                RxStage::Head2 => 2,
                RxStage::ExtLen(n) => n,
                RxStage::Mask => 4,
                RxStage::Payload => st.rx_hdr.map(|h| h.len as usize).unwrap_or(0),
            };
            if matches!(st.rx_stage, RxStage::Head2) && self.rx_paused(st) {
                return;
            }
            if st.pending.len() < need {
                let buf = std::mem::take(&mut st.pending);
                st.rx_busy = true;
                self.rx_aio.set_rx(buf, need);
                self.lower.recv(&self.rx_aio);
                return;
            }
            let chunk = st.pending.split_to(need);
            match st.rx_stage {
                RxStage::Head2 => {
                    let hdr = match parse_head2(chunk[0], chunk[1]) {
                        Ok(h) => h,
                        Err(e) => {
                            self.protocol_violation(st, e);
                            return;
                        }
                    };
                    let mask_wanted = self.role == Role::Server;
                    if hdr.masked != mask_wanted {
                        self.protocol_violation(st, Error::ProtocolError);
                        return;
                    }
                    let ext = ext_len_bytes(hdr.len);
                    st.rx_hdr = Some(hdr);
                    if ext > 0 {
                        st.rx_stage = RxStage::ExtLen(ext);
                    } else if !self.check_limits(st) {
                        return;
                    } else {
                        st.rx_stage = if hdr.masked {
                            RxStage::Mask
                        } else {
                            RxStage::Payload
                        };
                    }
                }
                RxStage::ExtLen(_) => {
                    let len = match parse_ext_len(&chunk) {
                        Ok(len) => len,
                        Err(e) => {
                            self.protocol_violation(st, e);
                            return;
                        }
                    };
                    let masked = {
                        let hdr = st.rx_hdr.as_mut().unwrap();
                        hdr.len = len;
                        hdr.masked
                    };
                    if !self.check_limits(st) {
                        return;
                    }
                    st.rx_stage = if masked {
                        RxStage::Mask
                    } else {
                        RxStage::Payload
                    };
                }
                RxStage::Mask => {
                    let hdr = st.rx_hdr.as_mut().unwrap();
                    hdr.mask.copy_from_slice(&chunk[..4]);
                    st.rx_stage = RxStage::Payload;
                }
                RxStage::Payload => {
                    let hdr = st.rx_hdr.take().unwrap();
                    let mut payload = chunk;
                    if hdr.masked {
                        apply_mask(hdr.mask, 0, &mut payload);
                    }
                    st.rx_stage = RxStage::Head2;
                    self.dispatch(st, hdr, payload);
                }
            }
        }
    }

    /// Stop reading at a frame boundary when nobody is draining what we
    /// already buffered.
    fn rx_paused(&self, st: &WsSt) -> bool {
        if !st.recvq.is_empty() || !st.pending.is_empty() {
            return false;
        }
        match self.opts.mode {
            Mode::Stream => st.stream_buf.len() >= self.opts.maxframe,
            Mode::Message => !st.msgq.is_empty(),
        }
    }

    /// Frame-size and message-size limits, applied once the real length
    /// is known. False means the connection is going down.
    fn check_limits(self: &Arc<Self>, st: &mut MutexGuard<'_, WsSt>) -> bool {
        let hdr = *st.rx_hdr.as_ref().unwrap();
        if hdr.len > self.opts.maxframe as u64 {
            warn!("inbound frame of {} bytes exceeds limit", hdr.len);
            self.limit_violation(st, Error::MessageTooBig);
            return false;
        }
        if self.opts.mode == Mode::Message
            && !hdr.opcode.is_control()
            && st.frag_buf.len() as u64 + hdr.len > self.opts.recvmax as u64
        {
            warn!("inbound message exceeds {} byte limit", self.opts.recvmax);
            self.limit_violation(st, Error::MessageTooBig);
            return false;
        }
        true
    }

    fn dispatch(self: &Arc<Self>, st: &mut MutexGuard<'_, WsSt>, hdr: FrameHeader, payload: BytesMut) {
        trace!(
            "ws frame in: {:?} fin={} len={}",
            hdr.opcode,
            hdr.fin,
            payload.len()
        );
        match hdr.opcode {
            Opcode::Ping => {
                if st.fatal.is_none() && !st.queued_close {
                    self.queue_control(st, Opcode::Pong, &payload);
                    self.kick_tx(st);
                }
            }
            Opcode::Pong => {}
            Opcode::Close => {
                st.peer_closed = true;
                if !st.queued_close {
                    self.queue_control(st, Opcode::Close, &close_payload(close_code::NORMAL, b""));
                }
                self.satisfy_recvs(st);
                let stranded: Vec<Aio> = st.recvq.drain(..).collect();
                for aio in stranded {
                    aio.finish_error(Error::Closed);
                }
                self.kick_tx(st);
                self.maybe_drop(st);
            }
            Opcode::Continuation | Opcode::Text | Opcode::Binary => {
                let cont = hdr.opcode == Opcode::Continuation;
                if cont != st.frag_op.is_some() {
                    self.protocol_violation(st, Error::ProtocolError);
                    return;
                }
                if !cont {
                    st.frag_op = Some(hdr.opcode);
                }
                match self.opts.mode {
                    Mode::Stream => {
                        st.stream_buf.extend_from_slice(&payload);
                        if hdr.fin {
                            st.frag_op = None;
                        }
                        self.satisfy_recvs(st);
                    }
                    Mode::Message => {
                        st.frag_buf.extend_from_slice(&payload);
                        if hdr.fin {
                            st.frag_op = None;
                            let body = st.frag_buf.split();
                            st.msgq.push_back(Message::from_recv(body));
                            self.satisfy_recvs(st);
                        }
                    }
                }
            }
        }
    }

    /// Hands buffered inbound data to waiting receive AIOs.
    fn satisfy_recvs(self: &Arc<Self>, st: &mut MutexGuard<'_, WsSt>) {
        loop {
            match self.opts.mode {
                Mode::Stream => {
                    if st.stream_buf.is_empty() || st.recvq.is_empty() {
                        return;
                    }
                    let aio = st.recvq.pop_front().unwrap();
                    let Some((mut buf, want)) = aio.take_rx_full() else {
                        aio.finish_error(Error::InvalidArgument);
                        continue;
                    };
                    let need = want.saturating_sub(buf.len());
                    let take = need.min(st.stream_buf.len());
                    buf.extend_from_slice(&st.stream_buf.split_to(take));
                    aio.set_rx(buf, want);
                    aio.finish(Ok(()), take);
                }
                Mode::Message => {
                    if st.msgq.is_empty() || st.recvq.is_empty() {
                        return;
                    }
                    let aio = st.recvq.pop_front().unwrap();
                    let msg = st.msgq.pop_front().unwrap();
                    aio.finish_msg(msg);
                }
            }
        }
    }

    // ---- shutdown paths -------------------------------------------------

    /// Peer broke the protocol: fail users, send close 1002, drop.
    fn protocol_violation(self: &Arc<Self>, st: &mut MutexGuard<'_, WsSt>, err: Error) {
        debug!("ws protocol violation: {}", err);
        self.go_fatal(st, close_code::PROTOCOL, err);
    }

    /// A receive limit tripped: close 1009.
    fn limit_violation(self: &Arc<Self>, st: &mut MutexGuard<'_, WsSt>, err: Error) {
        self.go_fatal(st, close_code::TOO_BIG, err);
    }

    fn go_fatal(self: &Arc<Self>, st: &mut MutexGuard<'_, WsSt>, code: u16, err: Error) {
        if st.fatal.is_some() {
            return;
        }
        st.fatal = Some(err);
        self.fail_users(st, err);
        if !st.queued_close {
            self.queue_control(st, Opcode::Close, &close_payload(code, b""));
        }
        self.kick_tx(st);
    }

    /// The lower stream died; nothing more will move.
    fn conn_dead(self: &Arc<Self>, st: &mut MutexGuard<'_, WsSt>, err: Error) {
        let err = match err {
            Error::Closed | Error::ConnShutdown => Error::Closed,
            other => other,
        };
        st.phase = Phase::Dead;
        if let Some(user) = st.hs_user.take() {
            user.finish_error(err);
        }
        self.fail_users(st, err);
        self.lower.close();
    }

    fn fail_users(self: &Arc<Self>, st: &mut MutexGuard<'_, WsSt>, err: Error) {
        let mut pending: Vec<Aio> = st.sendq.drain(..).collect();
        pending.extend(st.recvq.drain(..));
        pending.extend(st.tx_user.take());
        st.tx_data = Bytes::new();
        for aio in pending {
            aio.finish_error(err);
        }
    }

    /// Once our close frame is on the wire and the peer has spoken (or
    /// can no longer speak), drop the transport.
    fn maybe_drop(self: &Arc<Self>, st: &mut MutexGuard<'_, WsSt>) {
        if !st.sent_close {
            return;
        }
        if st.peer_closed || st.fatal.is_some() {
            st.phase = Phase::Dead;
            self.fail_users(st, Error::Closed);
            self.lower.close();
        }
    }

    // ---- user surface ---------------------------------------------------

    fn submit_send(self: &Arc<Self>, aio: &Aio) {
        if !aio.begin() {
            return;
        }
        let mut st = self.lock();
        if let Some(err) = self.reject_reason(&st) {
            drop(st);
            aio.finish_error(err);
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
        self.kick_tx(&mut st);
    }

    fn submit_recv(self: &Arc<Self>, aio: &Aio) {
        if !aio.begin() {
            return;
        }
        let mut st = self.lock();
        // buffered data survives peer close; drain it first
        let drained = match self.opts.mode {
            Mode::Stream => st.stream_buf.is_empty(),
            Mode::Message => st.msgq.is_empty(),
        };
        if let Some(err) = self.reject_reason(&st) {
            if drained {
                drop(st);
                aio.finish_error(err);
                return;
            }
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
        self.satisfy_recvs(&mut st);
        self.advance_rx(&mut st);
        // nothing buffered and nothing more coming: fail the waiters now
        if let Some(err) = self.reject_reason(&st) {
            let empty = match self.opts.mode {
                Mode::Stream => st.stream_buf.is_empty(),
                Mode::Message => st.msgq.is_empty(),
            };
            if empty {
                let stranded: Vec<Aio> = st.recvq.drain(..).collect();
                drop(st);
                for a in stranded {
                    a.finish_error(err);
                }
            }
        }
    }

    fn reject_reason(&self, st: &WsSt) -> Option<Error> {
        if st.phase == Phase::Dead || st.user_closed {
            return Some(Error::Closed);
        }
        if let Some(err) = st.fatal {
            return Some(err);
        }
        if st.peer_closed || st.queued_close {
            return Some(Error::Closed);
        }
        if st.phase != Phase::Open {
            return Some(Error::InvalidArgument);
        }
        None
    }

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

    fn cancel_recv(self: &Arc<Self>, aio: &Aio, err: Error) {
        let found = {
            let mut st = self.lock();
            match st.recvq.iter().position(|a| a.same(aio)) {
                Some(pos) => {
                    st.recvq.remove(pos);
                    true
                }
                None => false,
            }
        };
        if found {
            aio.finish_error(err);
        }
    }

    /// Begins the closing handshake: queue close(1000), drain users.
    fn user_close(self: &Arc<Self>) {
        let mut st = self.lock();
        match st.phase {
            Phase::Dead => {}
            Phase::HsSend | Phase::HsRecv => {
                self.fail_handshake(&mut st, Error::Closed);
            }
            Phase::Open => {
                if st.user_closed {
                    return;
                }
                st.user_closed = true;
                self.fail_users(&mut st, Error::Closed);
                if !st.queued_close {
                    self.queue_control(
                        &mut st,
                        Opcode::Close,
                        &close_payload(close_code::NORMAL, b""),
                    );
                }
                self.kick_tx(&mut st);
                // keep reading; the peer's reciprocal close ends things
                self.advance_rx(&mut st);
                self.maybe_drop(&mut st);
            }
        }
    }
}

impl Stream for WsConn {
    fn send(&self, aio: &Aio) {
        self.inner.submit_send(aio);
    }

    fn recv(&self, aio: &Aio) {
        self.inner.submit_recv(aio);
    }

    fn close(&self) {
        self.inner.user_close();
    }

    fn stop(&self) {
        self.inner.user_close();
        self.inner.tx_aio.stop();
        self.inner.rx_aio.stop();
    }

    fn get(&self, name: &str) -> Result<PropValue> {
        match name {
            super::PROP_PROTOCOL => {
                let st = self.inner.lock();
                st.selected_protocol
                    .clone()
                    .map(PropValue::Str)
                    .ok_or(Error::NotSupported)
            }
            _ => self.inner.lower.get(name),
        }
    }

    fn set(&self, name: &str, value: PropValue) -> Result<()> {
        self.inner.lower.set(name, value)
    }
}

impl Drop for WsConn {
    fn drop(&mut self) {
        // only the last user handle tears the connection down; internal
        // callbacks hold weak references
        if Arc::strong_count(&self.inner) == 1 {
            self.inner.user_close();
        }
    }
}

fn reason_for(status: u16) -> &'static str {
    match status {
        400 => "Bad Request",
        405 => "Method Not Allowed",
        426 => "Upgrade Required",
        431 => "Request Header Fields Too Large",
        _ => "Error",
    }
}
