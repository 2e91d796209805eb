//! WebSocket behavior: the upgrade handshake, control frames, limits,
//! fragmentation, and SP over WS. The raw-socket side of these tests
//! speaks the wire format by hand so the bytes are verified literally.

mod common;

use std::io::{BufRead, BufReader, Read, Write};
use std::net::TcpStream;
use std::time::Duration;

use braid::stream::{self, prop, PropValue};
use braid::ws::{self, WsListener};
use braid::{Aio, Error, Message, Url};

use common::{connect_pair, init_logging, recv_msg, send_msg};

fn ws_listener(maxframe: Option<usize>) -> (Box<dyn stream::StreamListener>, String) {
    let url = Url::parse("ws://127.0.0.1:0").unwrap();
    let listener = stream::listener(&url).unwrap();
    if let Some(n) = maxframe {
        listener.set(ws::PROP_MAXFRAME, PropValue::Size(n)).unwrap();
    }
    listener.listen().unwrap();
    let addr = match listener.get(prop::LOCAL_ADDR).unwrap() {
        PropValue::Addr(a) => a.to_string(),
        other => panic!("unexpected prop {:?}", other),
    };
    (listener, addr)
}

/// Performs the literal sample upgrade from the RFC against our
/// listener and returns the connected raw socket plus the accepted
/// server stream.
fn raw_upgrade(
    listener: &dyn stream::StreamListener,
    addr: &str,
) -> (TcpStream, Box<dyn stream::Stream>) {
    let accept = Aio::new(|_| {});
    listener.accept(&accept);

    let mut peer = TcpStream::connect(addr).unwrap();
    peer.set_read_timeout(Some(Duration::from_secs(5))).unwrap();
    peer.write_all(
        b"GET / HTTP/1.1\r\nHost: h\r\nUpgrade: websocket\r\nConnection: upgrade\r\n\
          Sec-WebSocket-Key: dGhlIHNhbXBsZSBub25jZQ==\r\nSec-WebSocket-Version: 13\r\n\r\n",
    )
    .unwrap();

    let mut reader = BufReader::new(peer.try_clone().unwrap());
    let mut status = String::new();
    reader.read_line(&mut status).unwrap();
    assert!(status.starts_with("HTTP/1.1 101"), "status: {}", status);
    let mut accept_hdr = None;
    loop {
        let mut line = String::new();
        reader.read_line(&mut line).unwrap();
        if line == "\r\n" {
            break;
        }
        if line.to_ascii_lowercase().starts_with("sec-websocket-accept:") {
            accept_hdr = Some(line["sec-websocket-accept:".len()..].trim().to_string());
        }
    }
    assert_eq!(accept_hdr.as_deref(), Some("s3pPLMBiTxaQ9kYGzzhZRbK+xOo="));

    accept.wait();
    accept.result().unwrap();
    let server = accept.take_output::<Box<dyn stream::Stream>>(0).unwrap();
    (peer, server)
}

fn write_client_frame(peer: &mut TcpStream, opcode: u8, payload: &[u8]) {
    let mask = [0x11u8, 0x22, 0x33, 0x44];
    let mut frame = Vec::new();
    frame.push(0x80 | opcode);
    if payload.len() < 126 {
        frame.push(0x80 | payload.len() as u8);
    } else {
        frame.push(0x80 | 126);
        frame.extend_from_slice(&(payload.len() as u16).to_be_bytes());
    }
    frame.extend_from_slice(&mask);
    for (i, b) in payload.iter().enumerate() {
        frame.push(b ^ mask[i % 4]);
    }
    peer.write_all(&frame).unwrap();
}

/// Reads one unmasked server frame; returns (opcode byte, payload).
fn read_server_frame(peer: &mut TcpStream) -> (u8, Vec<u8>) {
    let mut head = [0u8; 2];
    peer.read_exact(&mut head).unwrap();
    assert_eq!(head[1] & 0x80, 0, "server frames must not be masked");
    let len = match head[1] & 0x7f {
        126 => {
            let mut ext = [0u8; 2];
            peer.read_exact(&mut ext).unwrap();
            u16::from_be_bytes(ext) as usize
        }
        127 => {
            let mut ext = [0u8; 8];
            peer.read_exact(&mut ext).unwrap();
            u64::from_be_bytes(ext) as usize
        }
        n => n as usize,
    };
    let mut payload = vec![0u8; len];
    peer.read_exact(&mut payload).unwrap();
    (head[0], payload)
}

#[test]
fn upgrade_yields_rfc_accept_key() {
    init_logging();
    let (listener, addr) = ws_listener(None);
    let (_peer, _server) = raw_upgrade(listener.as_ref(), &addr);
}

#[test]
fn malformed_upgrade_refused_with_http_status() {
    init_logging();
    let (listener, addr) = ws_listener(None);
    let accept = Aio::new(|_| {});
    listener.accept(&accept);

    let mut peer = TcpStream::connect(&addr).unwrap();
    peer.set_read_timeout(Some(Duration::from_secs(5))).unwrap();
    // no upgrade headers at all
    peer.write_all(b"GET / HTTP/1.1\r\nHost: h\r\n\r\n").unwrap();

    let mut response = String::new();
    let mut reader = BufReader::new(peer);
    reader.read_line(&mut response).unwrap();
    assert!(response.starts_with("HTTP/1.1 400"), "got: {}", response);

    accept.wait();
    assert!(accept.result().is_err());
}

#[test]
fn ping_is_echoed_as_pong() {
    init_logging();
    let (listener, addr) = ws_listener(None);
    let (mut peer, _server) = raw_upgrade(listener.as_ref(), &addr);

    write_client_frame(&mut peer, 0x9, b"ping-payload!");
    let (op, payload) = read_server_frame(&mut peer);
    assert_eq!(op, 0x8A);
    assert_eq!(payload, b"ping-payload!");
}

#[test]
fn close_handshake_is_reciprocated() {
    init_logging();
    let (listener, addr) = ws_listener(None);
    let (mut peer, server) = raw_upgrade(listener.as_ref(), &addr);

    // a pending receive that the close must fail with Closed
    let pending = Aio::new(|_| {});
    pending.set_rx(bytes::BytesMut::with_capacity(16), 16);
    server.recv(&pending);

    // close, code 1000
    write_client_frame(&mut peer, 0x8, &[0x03, 0xE8]);

    let (op, payload) = read_server_frame(&mut peer);
    assert_eq!(op, 0x88);
    assert_eq!(&payload[..2], &[0x03, 0xE8][..]);

    pending.wait();
    assert_eq!(pending.result(), Err(Error::Closed));

    // subsequent send fails with Closed
    let send = Aio::new(|_| {});
    send.set_tx(vec![bytes::Bytes::from_static(b"late")]);
    server.send(&send);
    send.wait();
    assert_eq!(send.result(), Err(Error::Closed));

    // and the TCP connection winds down
    let mut rest = Vec::new();
    let _ = peer.read_to_end(&mut rest);
}

#[test]
fn oversize_frame_closes_with_1009() {
    init_logging();
    let (listener, addr) = ws_listener(Some(1024));
    let (mut peer, _server) = raw_upgrade(listener.as_ref(), &addr);

    // claim a 2 KiB frame against a 1 KiB limit; the length field alone
    // trips the limit, no payload ever goes out
    peer.write_all(&[0x82, 0x80 | 126, 0x08, 0x00]).unwrap();

    let (op, payload) = read_server_frame(&mut peer);
    assert_eq!(op, 0x88);
    assert_eq!(&payload[..2], &[0x03, 0xF1][..]);
}

#[test]
fn message_mode_reassembles_fragments() {
    init_logging();
    let bind = Url::parse("ws://127.0.0.1:0").unwrap();
    let listener = stream::listener(&bind).unwrap();
    listener.set(ws::PROP_MSGMODE, PropValue::Bool(true)).unwrap();
    listener.listen().unwrap();
    let addr = match listener.get(prop::LOCAL_ADDR).unwrap() {
        PropValue::Addr(a) => a.to_string(),
        other => panic!("unexpected prop {:?}", other),
    };

    let accept = Aio::new(|_| {});
    listener.accept(&accept);

    let url = Url::parse(&format!("ws://{}", addr)).unwrap();
    let dialer = stream::dialer(&url).unwrap();
    dialer.set(ws::PROP_MSGMODE, PropValue::Bool(true)).unwrap();
    // force fragmentation: 100 bytes of payload in 16-byte frames
    dialer.set(ws::PROP_FRAGSIZE, PropValue::Size(16)).unwrap();
    let client = stream::dial_wait(dialer.as_ref()).unwrap();

    accept.wait();
    accept.result().unwrap();
    let server = accept.take_output::<Box<dyn stream::Stream>>(0).unwrap();

    let body: Vec<u8> = (0..100u8).collect();
    let send = Aio::new(|_| {});
    send.set_msg(Message::from_body(&body));
    client.send(&send);
    send.wait();
    send.result().unwrap();
    assert_eq!(send.count(), 100);

    let recv = Aio::new(|_| {});
    server.recv(&recv);
    recv.wait();
    recv.result().unwrap();
    let msg = recv.take_msg().unwrap();
    assert_eq!(msg.body(), &body[..]);
}

#[test]
fn subprotocol_negotiation() {
    init_logging();
    let bind = Url::parse("ws://127.0.0.1:0").unwrap();
    let listener = stream::listener(&bind).unwrap();
    listener
        .set(ws::PROP_PROTOCOL, PropValue::Str("pair.sp,bus.sp".into()))
        .unwrap();
    listener.listen().unwrap();
    let addr = match listener.get(prop::LOCAL_ADDR).unwrap() {
        PropValue::Addr(a) => a.to_string(),
        other => panic!("unexpected prop {:?}", other),
    };

    let accept = Aio::new(|_| {});
    listener.accept(&accept);

    let url = Url::parse(&format!("ws://{}", addr)).unwrap();
    let dialer = stream::dialer(&url).unwrap();
    dialer
        .set(ws::PROP_PROTOCOL, PropValue::Str("bus.sp".into()))
        .unwrap();
    let client = stream::dial_wait(dialer.as_ref()).unwrap();
    assert_eq!(
        client.get(ws::PROP_PROTOCOL).unwrap(),
        PropValue::Str("bus.sp".into())
    );

    accept.wait();
    accept.result().unwrap();
}

#[test]
fn listener_hook_can_refuse() {
    init_logging();
    let url = Url::parse("ws://127.0.0.1:0").unwrap();
    let listener = WsListener::new(url).unwrap();
    listener.set_hook(|req, resp| {
        if !req.headers.iter().any(|(name, value)| {
            name.eq_ignore_ascii_case("x-braid-token") && value == "open-sesame"
        }) {
            resp.status = 403;
            resp.reason = "Forbidden".into();
        }
    });
    use braid::stream::StreamListener;
    listener.listen().unwrap();
    let addr = match listener.get(prop::LOCAL_ADDR).unwrap() {
        PropValue::Addr(a) => a.to_string(),
        other => panic!("unexpected prop {:?}", other),
    };

    let accept = Aio::new(|_| {});
    listener.accept(&accept);

    let mut peer = TcpStream::connect(&addr).unwrap();
    peer.set_read_timeout(Some(Duration::from_secs(5))).unwrap();
    peer.write_all(
        b"GET / HTTP/1.1\r\nHost: h\r\nUpgrade: websocket\r\nConnection: upgrade\r\n\
          Sec-WebSocket-Key: dGhlIHNhbXBsZSBub25jZQ==\r\nSec-WebSocket-Version: 13\r\n\r\n",
    )
    .unwrap();
    let mut line = String::new();
    BufReader::new(peer).read_line(&mut line).unwrap();
    assert!(line.starts_with("HTTP/1.1 403"), "got: {}", line);

    accept.wait();
    assert_eq!(accept.result(), Err(Error::ConnRefused));
}

#[test]
fn sp_over_websocket_echo() {
    init_logging();
    let pair = connect_pair("ws://127.0.0.1:0/sp").unwrap();
    send_msg(&pair.client_pipe, Message::from_body(b"through the frames")).unwrap();
    let msg = recv_msg(&pair.server_pipe).unwrap();
    assert_eq!(msg.body(), b"through the frames");

    send_msg(&pair.server_pipe, Message::from_body(b"and back")).unwrap();
    assert_eq!(recv_msg(&pair.client_pipe).unwrap().body(), b"and back");
}
