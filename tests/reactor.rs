//! End-to-end reactor scenarios driving the dispatch loop on a helper
//! thread while the test thread exercises the coordination API.

use std::io::{Read, Write};
use std::os::unix::net::UnixStream;
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::Duration;

use crossbeam_channel as chan;
use demux::{IoType, Reactor};

fn spawn_reactor() -> (Arc<Reactor>, thread::JoinHandle<()>) {
    let reactor = Arc::new(Reactor::new().expect("cannot create reactor"));
    let runner = Arc::clone(&reactor);
    let handle = thread::spawn(move || runner.run());
    (reactor, handle)
}

fn socket_pair() -> (Arc<UnixStream>, UnixStream) {
    let (local, remote) = UnixStream::pair().expect("cannot create socket pair");
    local.set_nonblocking(true).expect("cannot switch socket to non-blocking");
    (Arc::new(local), remote)
}

#[test]
fn read_delivery() {
    let (reactor, handle) = spawn_reactor();
    let (local, remote) = socket_pair();

    let (byte_send, byte_recv) = chan::unbounded();
    let reader = Arc::clone(&local);
    let id = reactor.register(
        &*local,
        Some(Box::new(move || {
            let mut buf = [0u8; 1];
            (&*reader).read_exact(&mut buf).expect("cannot drain socket");
            byte_send.send(buf[0]).expect("test channel broken");
        })),
        None,
    );

    (&remote).write_all(&[0x41]).unwrap();
    assert_eq!(byte_recv.recv_timeout(Duration::from_secs(1)).unwrap(), 0x41);
    // A single write produces a single callback.
    assert!(byte_recv.recv_timeout(Duration::from_millis(100)).is_err());

    reactor.unregister(id);
    reactor.stop();
    handle.join().unwrap();
}

#[test]
fn unregister_from_own_callback() {
    let (reactor, handle) = spawn_reactor();
    let (local, remote) = socket_pair();

    let id_slot = Arc::new(Mutex::new(None));
    let (done_send, done_recv) = chan::unbounded();
    let reader = Arc::clone(&local);
    let id = reactor.register(
        &*local,
        Some(Box::new({
            let reactor = Arc::clone(&reactor);
            let id_slot = Arc::clone(&id_slot);
            move || {
                let mut buf = [0u8; 1];
                (&*reader).read_exact(&mut buf).expect("cannot drain socket");
                let id = id_slot.lock().unwrap().take().expect("callback fired after unregister");
                reactor.unregister(id);
                done_send.send(()).expect("test channel broken");
            }
        })),
        None,
    );
    *id_slot.lock().unwrap() = Some(id);

    (&remote).write_all(b"A").unwrap();
    done_recv.recv_timeout(Duration::from_secs(1)).unwrap();
    assert!(reactor.wait_for_unregistered_reactable(Duration::from_secs(1)));

    // Further traffic must not reach the callback any more.
    (&remote).write_all(b"B").unwrap();
    thread::sleep(Duration::from_millis(100));
    assert!(done_recv.try_recv().is_err());

    reactor.stop();
    handle.join().unwrap();
}

#[test]
fn unregister_during_long_callback() {
    let (reactor, handle) = spawn_reactor();
    let (local, remote) = socket_pair();

    let (entered_send, entered_recv) = chan::unbounded();
    let reader = Arc::clone(&local);
    let id = reactor.register(
        &*local,
        Some(Box::new(move || {
            let mut buf = [0u8; 1];
            (&*reader).read_exact(&mut buf).expect("cannot drain socket");
            entered_send.send(()).expect("test channel broken");
            thread::sleep(Duration::from_millis(100));
        })),
        None,
    );

    (&remote).write_all(b"A").unwrap();
    entered_recv.recv_timeout(Duration::from_secs(1)).unwrap();
    // The callback is still sleeping: destruction is deferred until it
    // returns, and waiting for it must succeed without any use-after-free.
    reactor.unregister(id);
    assert!(reactor.wait_for_unregistered_reactable(Duration::from_secs(1)));

    reactor.stop();
    handle.join().unwrap();
}

#[test]
fn write_readiness_delivery() {
    let (reactor, handle) = spawn_reactor();
    let (local, _remote) = socket_pair();

    let (ready_send, ready_recv) = chan::unbounded();
    let id = reactor.register(
        &*local,
        None,
        Some(Box::new(move || {
            ready_send.try_send(()).ok();
            // A fresh socket stays write-ready, so the callback keeps
            // firing; pace it down while the test observes the first hit.
            thread::sleep(Duration::from_millis(1));
        })),
    );

    assert!(ready_recv.recv_timeout(Duration::from_secs(1)).is_ok());

    reactor.unregister(id);
    reactor.stop();
    handle.join().unwrap();
}

#[test]
fn event_as_reactable() {
    let (reactor, handle) = spawn_reactor();
    let event = Arc::new(reactor.new_event().expect("cannot create event"));

    let (hit_send, hit_recv) = chan::unbounded();
    let source = Arc::clone(&event);
    let id = reactor.register(
        &*event,
        Some(Box::new(move || {
            assert!(source.read(), "readiness event without a pending count");
            hit_send.send(()).expect("test channel broken");
        })),
        None,
    );

    // Each notification produces exactly one callback, even when they pile
    // up between dispatch passes.
    event.notify();
    hit_recv.recv_timeout(Duration::from_secs(1)).unwrap();
    event.notify();
    hit_recv.recv_timeout(Duration::from_secs(1)).unwrap();
    assert!(hit_recv.recv_timeout(Duration::from_millis(100)).is_err());

    reactor.unregister(id);
    reactor.stop();
    handle.join().unwrap();
}

#[test]
fn modify_registration_directions() {
    let (reactor, handle) = spawn_reactor();
    let (local, remote) = socket_pair();

    let (read_send, read_recv) = chan::unbounded();
    let (write_send, write_recv) = chan::unbounded();
    let reader = Arc::clone(&local);
    let id = reactor.register(
        &*local,
        Some(Box::new(move || {
            let mut buf = [0u8; 1];
            (&*reader).read_exact(&mut buf).expect("cannot drain socket");
            read_send.send(buf[0]).expect("test channel broken");
        })),
        Some(Box::new(move || {
            write_send.try_send(()).ok();
            thread::sleep(Duration::from_millis(1));
        })),
    );

    // The socket is immediately write-ready.
    write_recv.recv_timeout(Duration::from_secs(1)).unwrap();

    reactor.modify_registration(id, IoType::read_only());
    // Let events already in flight drain, then the write side must go
    // quiet.
    thread::sleep(Duration::from_millis(50));
    while write_recv.try_recv().is_ok() {}
    thread::sleep(Duration::from_millis(100));
    assert!(write_recv.try_recv().is_err());

    // The read side keeps working.
    (&remote).write_all(&[0x42]).unwrap();
    assert_eq!(read_recv.recv_timeout(Duration::from_secs(1)).unwrap(), 0x42);

    reactor.unregister(id);
    reactor.stop();
    handle.join().unwrap();
}

#[test]
fn wait_for_idle_on_quiet_reactor() {
    let (reactor, handle) = spawn_reactor();

    assert!(reactor.wait_for_idle(Duration::from_secs(1)));

    reactor.stop();
    handle.join().unwrap();
}

#[test]
fn busy_reactor_is_never_idle() {
    let (reactor, handle) = spawn_reactor();
    let (local, remote) = socket_pair();

    // The callback never drains the socket, so in level-triggered mode the
    // descriptor fires on every dispatch pass and no readiness call can
    // come back empty.
    let id = reactor.register(
        &*local,
        Some(Box::new(|| thread::sleep(Duration::from_millis(1)))),
        None,
    );
    (&remote).write_all(b"A").unwrap();

    assert!(!reactor.wait_for_idle(Duration::from_millis(300)));

    reactor.unregister(id);
    reactor.stop();
    handle.join().unwrap();
}

#[test]
fn stop_before_run() {
    let reactor = Arc::new(Reactor::new().expect("cannot create reactor"));
    reactor.stop();

    let runner = Arc::clone(&reactor);
    let handle = thread::spawn(move || runner.run());
    // The stop command is already on the control channel: the loop exits on
    // its first pass.
    handle.join().unwrap();
}

#[test]
fn stop_is_idempotent() {
    let (reactor, handle) = spawn_reactor();

    reactor.stop();
    reactor.stop();
    handle.join().unwrap();
    // Residual commands on the control counter are absorbed when the
    // reactor is dropped.
    reactor.stop();
}
