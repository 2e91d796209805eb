//! Socket, pipe, and SP framing behavior, including the bit-exact wire
//! images.

mod common;

use std::collections::HashSet;
use std::io::{Read, Write};
use std::time::{Duration, Instant};

use braid::sp::{proto_id, ProtocolInfo};
use braid::{Aio, Error, Message, Pipe, PipeEvent, Socket};

use common::{connect_pair, connect_pair_with, dial_url, init_logging, pair_info, recv_msg, send_msg};

#[test]
fn inproc_echo() {
    init_logging();
    let pair = connect_pair("inproc://sp-echo").unwrap();

    send_msg(&pair.client_pipe, Message::from_body(b"over")).unwrap();
    let msg = recv_msg(&pair.server_pipe).unwrap();
    assert_eq!(msg.body(), b"over");
    assert!(msg.header().is_empty());

    send_msg(&pair.server_pipe, Message::from_body(b"out")).unwrap();
    let msg = recv_msg(&pair.client_pipe).unwrap();
    assert_eq!(msg.body(), b"out");
}

#[test]
fn tcp_echo() {
    init_logging();
    let pair = connect_pair("tcp://127.0.0.1:0").unwrap();
    send_msg(&pair.client_pipe, Message::from_body(b"hello tcp")).unwrap();
    assert_eq!(recv_msg(&pair.server_pipe).unwrap().body(), b"hello tcp");
}

#[cfg(unix)]
#[test]
fn ipc_echo() {
    init_logging();
    let path = format!("/tmp/braid-test-{}.sock", std::process::id());
    let _ = std::fs::remove_file(&path);
    let url = format!("ipc://{}", path);
    let pair = connect_pair(&url).unwrap();
    send_msg(&pair.client_pipe, Message::from_body(b"hello ipc")).unwrap();
    assert_eq!(recv_msg(&pair.server_pipe).unwrap().body(), b"hello ipc");
    pair.listener.close();
}

#[test]
fn header_and_body_share_the_frame() {
    init_logging();
    let pair = connect_pair("inproc://sp-header").unwrap();
    let mut msg = Message::from_body(b"body");
    msg.header_append(&[0x80, 0x00, 0x00, 0x01]);
    send_msg(&pair.client_pipe, msg).unwrap();

    // the receiver sees header and body as one payload; splitting is
    // the protocol layer's job
    let got = recv_msg(&pair.server_pipe).unwrap();
    assert_eq!(got.body(), &[0x80, 0x00, 0x00, 0x01, b'b', b'o', b'd', b'y'][..]);
}

#[test]
fn fifo_order_byte_exact() {
    init_logging();
    let pair = connect_pair("inproc://sp-fifo").unwrap();
    for i in 0..50u32 {
        let mut body = i.to_be_bytes().to_vec();
        body.resize(4 + (i as usize % 13), 0xAB);
        send_msg(&pair.client_pipe, Message::from_body(&body)).unwrap();
    }
    for i in 0..50u32 {
        let msg = recv_msg(&pair.server_pipe).unwrap();
        assert_eq!(&msg.body()[..4], i.to_be_bytes());
        assert_eq!(msg.body().len(), 4 + (i as usize % 13));
        assert!(msg.body()[4..].iter().all(|&b| b == 0xAB));
    }
}

#[test]
fn recvmax_rejects_without_closing_pipe() {
    init_logging();
    let pair = connect_pair_with("inproc://sp-recvmax", |_c, s| {
        s.set_recvmax(1024);
    })
    .unwrap();

    send_msg(&pair.client_pipe, Message::from_body(vec![0u8; 4096])).unwrap();
    let err = recv_msg(&pair.server_pipe).unwrap_err();
    assert_eq!(err, Error::MessageTooBig);
    assert!(!pair.server_pipe.is_closed());
}

#[test]
fn wire_image_one_byte_echo() {
    init_logging();
    let server = Socket::new(pair_info());
    let listener = server.listen("tcp://127.0.0.1:0").unwrap();
    let url = dial_url("tcp://127.0.0.1:0", &listener);
    let addr = url.strip_prefix("tcp://").unwrap().to_string();

    let accept = Aio::new(|_| {});
    server.accept_pipe(&accept);

    let mut peer = std::net::TcpStream::connect(&addr).unwrap();
    peer.set_read_timeout(Some(Duration::from_secs(5))).unwrap();

    // negotiation: both sides exchange the literal 8-byte header
    peer.write_all(&[0x00, 0x53, 0x50, 0x00, 0x00, 0x10, 0x00, 0x00])
        .unwrap();
    let mut nego = [0u8; 8];
    peer.read_exact(&mut nego).unwrap();
    assert_eq!(nego, [0x00, 0x53, 0x50, 0x00, 0x00, 0x10, 0x00, 0x00]);

    accept.wait();
    accept.result().unwrap();
    let pipe = accept.take_output::<Pipe>(0).unwrap();

    // one-byte message from the raw side
    peer.write_all(&[0, 0, 0, 0, 0, 0, 0, 1, 0x41]).unwrap();
    let msg = recv_msg(&pipe).unwrap();
    assert_eq!(msg.body(), b"A");

    // echo it back and verify the exact bytes on the wire
    send_msg(&pipe, msg).unwrap();
    let mut echoed = [0u8; 9];
    peer.read_exact(&mut echoed).unwrap();
    assert_eq!(echoed, [0, 0, 0, 0, 0, 0, 0, 1, 0x41]);

    assert_eq!(pipe.stats().rx_msgs(), 1);
    assert_eq!(pipe.stats().tx_msgs(), 1);
    assert_eq!(pipe.stats().tx_bytes(), 1);
}

#[test]
fn negotiation_garbage_fails_pipe() {
    init_logging();
    let server = Socket::new(pair_info());
    let listener = server.listen("tcp://127.0.0.1:0").unwrap();
    let url = dial_url("tcp://127.0.0.1:0", &listener);
    let addr = url.strip_prefix("tcp://").unwrap().to_string();

    let mut peer = std::net::TcpStream::connect(&addr).unwrap();
    peer.write_all(b"GET / HT").unwrap();

    let deadline = Instant::now() + Duration::from_secs(5);
    while listener.nego_failures() == 0 {
        assert!(Instant::now() < deadline, "negotiation failure not counted");
        std::thread::sleep(Duration::from_millis(10));
    }
    assert_eq!(server.pipe_count(), 0);
}

#[test]
fn mismatched_protocols_reject_pairing() {
    init_logging();
    // REQ dials PUB; framing negotiates but the identities do not pair
    let req = Socket::new(ProtocolInfo::new(proto_id::REQ, "req", proto_id::REP, "rep"));
    let pub_ = Socket::new(ProtocolInfo::new(proto_id::PUB, "pub", proto_id::SUB, "sub"));

    let listener = pub_.listen("tcp://127.0.0.1:0").unwrap();
    let url = dial_url("tcp://127.0.0.1:0", &listener);
    let _dialer = req.dial(&url).unwrap();

    let deadline = Instant::now() + Duration::from_secs(5);
    while req.rejects() + pub_.rejects() == 0 {
        assert!(Instant::now() < deadline, "no rejection counted");
        std::thread::sleep(Duration::from_millis(10));
    }
}

#[test]
fn pipe_ids_are_unique() {
    init_logging();
    let server = Socket::new(pair_info());
    let _listener = server.listen("inproc://sp-ids").unwrap();

    let mut ids = HashSet::new();
    let mut clients = Vec::new();
    for _ in 0..20 {
        let accept = Aio::new(|_| {});
        server.accept_pipe(&accept);

        let client = Socket::new(pair_info());
        client.dial_sync("inproc://sp-ids").unwrap();

        let take = Aio::new(|_| {});
        client.accept_pipe(&take);
        take.wait();
        take.result().unwrap();
        let cpipe = take.take_output::<Pipe>(0).unwrap();

        accept.wait();
        accept.result().unwrap();
        let spipe = accept.take_output::<Pipe>(0).unwrap();

        assert_ne!(cpipe.id(), 0);
        assert!(cpipe.id() < (1 << 31));
        assert!(ids.insert(cpipe.id()), "duplicate pipe id");
        assert!(ids.insert(spipe.id()), "duplicate pipe id");
        clients.push((client, cpipe, spipe));
    }
}

#[test]
fn pipe_lookup_by_id() {
    init_logging();
    let pair = connect_pair("inproc://sp-lookup").unwrap();
    let id = pair.client_pipe.id();
    let found = Pipe::lookup(id).expect("live pipe");
    assert_eq!(found.id(), id);
    assert!(Pipe::lookup(0).is_none());
}

#[test]
fn dialer_reconnects_when_pipe_dies() {
    init_logging();
    let pair = connect_pair("tcp://127.0.0.1:0").unwrap();
    let before = pair.client.pipe_count();
    assert_eq!(before, 1);

    // the pattern layer would close a failed pipe; the dialer must then
    // come back on its own
    pair.client_pipe.close();
    pair.server_pipe.close();

    let accept = Aio::new(|_| {});
    accept.set_timeout(Some(Duration::from_secs(10)));
    pair.server.accept_pipe(&accept);
    accept.wait();
    accept.result().unwrap();
    let fresh = accept.take_output::<Pipe>(0).unwrap();
    assert_ne!(fresh.id(), pair.server_pipe.id());
}

#[test]
fn pipe_events_fire_in_order() {
    init_logging();
    use std::sync::{Arc, Mutex};
    let events: Arc<Mutex<Vec<PipeEvent>>> = Arc::new(Mutex::new(Vec::new()));
    let seen = events.clone();

    let server = Socket::new(pair_info());
    server.pipe_notify(move |_pipe, ev| {
        seen.lock().unwrap().push(ev);
    });
    let _listener = server.listen("inproc://sp-events").unwrap();

    let accept = Aio::new(|_| {});
    server.accept_pipe(&accept);
    let client = Socket::new(pair_info());
    client.dial_sync("inproc://sp-events").unwrap();
    accept.wait();
    let pipe = accept.take_output::<Pipe>(0).unwrap();

    pipe.close();
    let deadline = Instant::now() + Duration::from_secs(5);
    loop {
        let evs = events.lock().unwrap().clone();
        if evs.contains(&PipeEvent::RemPost) {
            assert_eq!(evs[0], PipeEvent::AddPre);
            assert_eq!(evs[1], PipeEvent::AddPost);
            assert_eq!(*evs.last().unwrap(), PipeEvent::RemPost);
            break;
        }
        assert!(Instant::now() < deadline, "RemPost never delivered");
        std::thread::sleep(Duration::from_millis(10));
    }
}

#[test]
fn closed_socket_fails_operations() {
    init_logging();
    let pair = connect_pair("inproc://sp-close").unwrap();
    pair.client.close();

    let aio = Aio::new(|_| {});
    pair.client.accept_pipe(&aio);
    aio.wait();
    assert_eq!(aio.result(), Err(Error::Closed));

    assert!(matches!(
        pair.client.dial("inproc://sp-close"),
        Err(Error::Closed)
    ));
}

#[test]
fn listen_address_in_use() {
    init_logging();
    let a = Socket::new(pair_info());
    let _l = a.listen("inproc://sp-in-use").unwrap();
    let b = Socket::new(pair_info());
    assert!(matches!(
        b.listen("inproc://sp-in-use"),
        Err(Error::AddressInUse)
    ));
}
