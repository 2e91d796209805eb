//! Byte-stream level behavior: the stream traits, synchronous wrappers,
//! back-pressure, and AIO plumbing against the in-process transport.

mod common;

use std::thread;
use std::time::Duration;

use braid::stream::{self, prop, PropValue};
use braid::{Aio, Error, Url};

use common::init_logging;

use braid::stream::{dial_wait, recv_exact, send_all};

fn connected(name: &str) -> (Box<dyn stream::Stream>, Box<dyn stream::Stream>) {
    let url = Url::parse(name).unwrap();
    let listener = stream::listener(&url).unwrap();
    listener.listen().unwrap();
    let accept = Aio::new(|_| {});
    listener.accept(&accept);
    let dialer = stream::dialer(&url).unwrap();
    let a = dial_wait(dialer.as_ref()).unwrap();
    accept.wait();
    accept.result().unwrap();
    let b = accept
        .take_output::<Box<dyn stream::Stream>>(0)
        .unwrap();
    (a, b)
}

#[test]
fn inproc_round_trip() {
    init_logging();
    let (a, b) = connected("inproc://stream-rt");
    send_all(a.as_ref(), b"sixteen byte blob").unwrap();
    let got = recv_exact(b.as_ref(), 17).unwrap();
    assert_eq!(&got[..], b"sixteen byte blob");
}

#[test]
fn inproc_backpressure_survives_bulk_transfer() {
    init_logging();
    let (a, b) = connected("inproc://stream-bulk");

    // four times the ring capacity; the writer must stall until the
    // reader drains
    let data: Vec<u8> = (0..256 * 1024).map(|i| (i % 251) as u8).collect();
    let expect = data.clone();
    let writer = thread::spawn(move || {
        send_all(a.as_ref(), &data).unwrap();
        a
    });
    let got = recv_exact(b.as_ref(), expect.len()).unwrap();
    assert_eq!(&got[..], &expect[..]);
    writer.join().unwrap();
}

#[test]
fn dial_without_listener_refused() {
    init_logging();
    let url = Url::parse("inproc://stream-nobody").unwrap();
    let dialer = stream::dialer(&url).unwrap();
    match dial_wait(dialer.as_ref()) {
        Err(e) => assert_eq!(e, Error::ConnRefused),
        Ok(_) => panic!("expected ConnRefused"),
    }
}

#[test]
fn tcp_dial_refused() {
    init_logging();
    // bind a listener to grab a port, close it, then dial the dead port
    let bind = Url::parse("tcp://127.0.0.1:0").unwrap();
    let listener = stream::listener(&bind).unwrap();
    listener.listen().unwrap();
    let addr = match listener.get(prop::LOCAL_ADDR).unwrap() {
        PropValue::Addr(a) => a,
        other => panic!("unexpected prop {:?}", other),
    };
    listener.close();
    thread::sleep(Duration::from_millis(50));

    let url = Url::parse(&format!("tcp://{}", addr)).unwrap();
    let dialer = stream::dialer(&url).unwrap();
    match dial_wait(dialer.as_ref()) {
        Err(e) => assert_eq!(e, Error::ConnRefused),
        Ok(_) => panic!("expected ConnRefused"),
    }
}

#[test]
fn tcp_round_trip_and_props() {
    init_logging();
    let bind = Url::parse("tcp://127.0.0.1:0").unwrap();
    let listener = stream::listener(&bind).unwrap();
    listener.listen().unwrap();
    let addr = match listener.get(prop::LOCAL_ADDR).unwrap() {
        PropValue::Addr(a) => a,
        other => panic!("unexpected prop {:?}", other),
    };

    let accept = Aio::new(|_| {});
    listener.accept(&accept);

    let url = Url::parse(&format!("tcp://{}", addr)).unwrap();
    let dialer = stream::dialer(&url).unwrap();
    let a = dial_wait(dialer.as_ref()).unwrap();
    accept.wait();
    accept.result().unwrap();
    let b = accept.take_output::<Box<dyn stream::Stream>>(0).unwrap();

    send_all(a.as_ref(), b"tcp bytes").unwrap();
    let got = recv_exact(b.as_ref(), 9).unwrap();
    assert_eq!(&got[..], b"tcp bytes");

    match a.get(prop::REMOTE_ADDR).unwrap() {
        PropValue::Addr(remote) => assert_eq!(remote, addr),
        other => panic!("unexpected prop {:?}", other),
    }
    a.set(prop::NO_DELAY, PropValue::Bool(true)).unwrap();
    assert_eq!(a.get(prop::NO_DELAY).unwrap(), PropValue::Bool(true));
}

#[test]
fn recv_on_closed_stream_fails() {
    init_logging();
    let (a, b) = connected("inproc://stream-closed");
    a.close();
    assert_eq!(recv_exact(b.as_ref(), 4).unwrap_err(), Error::Closed);
    assert_eq!(send_all(b.as_ref(), b"late").unwrap_err(), Error::Closed);
}

#[test]
fn pending_recv_aborts() {
    init_logging();
    let (_a, b) = connected("inproc://stream-abort");
    let aio = Aio::new(|_| {});
    aio.set_rx(bytes_mut(16), 16);
    b.recv(&aio);
    aio.abort(Error::Canceled);
    aio.wait();
    assert_eq!(aio.result(), Err(Error::Canceled));
}

#[test]
fn pending_recv_times_out() {
    init_logging();
    let (_a, b) = connected("inproc://stream-timeout");
    let aio = Aio::new(|_| {});
    aio.set_timeout(Some(Duration::from_millis(80)));
    aio.set_rx(bytes_mut(16), 16);
    let started = std::time::Instant::now();
    b.recv(&aio);
    aio.wait();
    assert_eq!(aio.result(), Err(Error::TimedOut));
    let elapsed = started.elapsed();
    assert!(elapsed >= Duration::from_millis(80));
    assert!(elapsed < Duration::from_secs(2));
}

#[test]
fn unknown_scheme_rejected() {
    assert_eq!(Url::parse("carrier-pigeon://x"), Err(Error::InvalidAddress));
}

fn bytes_mut(cap: usize) -> bytes::BytesMut {
    bytes::BytesMut::with_capacity(cap)
}
