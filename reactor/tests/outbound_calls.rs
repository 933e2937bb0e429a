//! Integration tests for outbound call dispatch.

use bytes::Bytes;
use reactor::{
    CallState, ConnectionId, Error, Messenger, MessengerBuilder, OutboundCall, OutboundCallPtr,
    Reactor, UserCredentials,
};
use std::io::Read;
use std::net::{SocketAddr, TcpListener, TcpStream};
use std::sync::{mpsc, Arc};
use std::thread;
use std::time::{Duration, Instant};

fn setup(name: &str) -> (Arc<Messenger>, Reactor) {
    let builder = MessengerBuilder::new(name)
        .coarse_timer_granularity_ms(20)
        .negotiation_threads(2);
    let messenger = Messenger::new(&builder);
    let reactor = Reactor::new(&messenger, 0, &builder).unwrap();
    (messenger, reactor)
}

fn acceptor(n: usize) -> (SocketAddr, mpsc::Receiver<TcpStream>) {
    let listener = TcpListener::bind("127.0.0.1:0").unwrap();
    let addr = listener.local_addr().unwrap();
    let (tx, rx) = mpsc::channel();
    thread::spawn(move || {
        for _ in 0..n {
            match listener.accept() {
                Ok((stream, _)) => {
                    if tx.send(stream).is_err() {
                        break;
                    }
                }
                Err(_) => break,
            }
        }
    });
    (addr, rx)
}

fn call_to(addr: SocketAddr, payload: &'static [u8]) -> OutboundCallPtr {
    OutboundCall::new(
        ConnectionId::new(addr, UserCredentials::default()),
        Bytes::from_static(payload),
        Some(Duration::from_secs(5)),
    )
}

fn wait_until(timeout: Duration, mut pred: impl FnMut() -> bool) -> bool {
    let deadline = Instant::now() + timeout;
    while Instant::now() < deadline {
        if pred() {
            return true;
        }
        thread::sleep(Duration::from_millis(10));
    }
    pred()
}

#[test]
fn test_four_calls_one_connection_one_batch() {
    let (messenger, reactor) = setup("batch");
    let (addr, _streams) = acceptor(4);

    // All four calls land in the outbound queue before the loop starts, so
    // they drain in a single batch.
    let calls: Vec<_> = (0..4).map(|_| call_to(addr, b"ping")).collect();
    for call in &calls {
        reactor.queue_outbound_call(call.clone());
    }
    reactor.init().unwrap();

    assert!(wait_until(Duration::from_secs(3), || calls
        .iter()
        .all(|call| call.finished())));
    for call in &calls {
        assert_eq!(call.state(), CallState::Sent);
    }

    let metrics = reactor.get_metrics().unwrap();
    assert_eq!(metrics.num_client_connections, 1);
    assert_eq!(metrics.num_server_connections, 0);

    let conns = reactor
        .run_on_reactor_thread(|core| Ok(core.client_connections()))
        .unwrap();
    assert_eq!(conns.len(), 1);
    let stats = conns[0].stats();
    assert_eq!(stats.calls_queued.load(std::sync::atomic::Ordering::Relaxed), 4);
    assert_eq!(
        stats
            .outbound_queued_batches
            .load(std::sync::atomic::Ordering::Relaxed),
        1
    );

    reactor.shutdown();
    reactor.join();
    messenger.shutdown();
}

#[test]
fn test_single_producer_order_is_preserved_on_the_wire() {
    let (messenger, reactor) = setup("fifo");
    let (addr, streams) = acceptor(1);

    for payload in [b"c1" as &'static [u8], b"c2", b"c3"] {
        reactor.queue_outbound_call(call_to(addr, payload));
    }
    reactor.init().unwrap();

    let mut accepted = streams.recv_timeout(Duration::from_secs(3)).unwrap();
    accepted
        .set_read_timeout(Some(Duration::from_secs(3)))
        .unwrap();
    let mut buf = [0u8; 6];
    accepted.read_exact(&mut buf).unwrap();
    assert_eq!(&buf, b"c1c2c3");

    reactor.shutdown();
    reactor.join();
    messenger.shutdown();
}

#[test]
fn test_drop_without_init_aborts_queued_calls() {
    let (messenger, reactor) = setup("never-started");
    let addr: SocketAddr = "127.0.0.1:7400".parse().unwrap();

    let calls: Vec<_> = (0..3).map(|_| call_to(addr, b"stranded")).collect();
    for call in &calls {
        reactor.queue_outbound_call(call.clone());
    }

    // No thread ever runs; dropping the reactor must still complete every
    // queued call exactly once.
    drop(reactor);
    for call in &calls {
        match call.state() {
            CallState::Aborted(status) => {
                assert!(status.is_aborted());
                assert_eq!(status.message(), "reactor is shutting down");
            }
            other => panic!("unexpected state {:?}", other),
        }
    }
    messenger.shutdown();
}

#[test]
fn test_call_without_timeout_still_dispatches() {
    let (messenger, reactor) = setup("no-timeout");
    let (addr, _streams) = acceptor(1);
    reactor.init().unwrap();

    let call = OutboundCall::new(
        ConnectionId::new(addr, UserCredentials::default()),
        Bytes::from_static(b"forever"),
        None,
    );
    reactor.queue_outbound_call(call.clone());

    assert!(wait_until(Duration::from_secs(3), || call.finished()));
    assert_eq!(call.state(), CallState::Sent);
    // The deadline was stamped as effectively-unbounded rather than left
    // uninitialized.
    assert!(call.deadline().unwrap() > Instant::now() + Duration::from_secs(3600));

    reactor.shutdown();
    reactor.join();
    messenger.shutdown();
}

#[test]
fn test_connect_refused_fails_only_the_call() {
    let (messenger, reactor) = setup("refused");
    reactor.init().unwrap();

    // Bind then drop to find a port with nothing listening.
    let addr = {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        listener.local_addr().unwrap()
    };
    let call = call_to(addr, b"nobody-home");
    reactor.queue_outbound_call(call.clone());

    assert!(wait_until(Duration::from_secs(3), || call.finished()));
    match call.state() {
        CallState::Failed(status) | CallState::Aborted(status) => {
            assert!(status.is_network(), "unexpected status {:?}", status);
        }
        other => panic!("unexpected state {:?}", other),
    }

    // The reactor itself is unharmed.
    let metrics = reactor.get_metrics().unwrap();
    assert_eq!(metrics.num_client_connections, 0);

    reactor.shutdown();
    reactor.join();
    messenger.shutdown();
}

#[test]
fn test_negotiation_pool_closed_maps_to_service_unavailable() {
    let (messenger, reactor) = setup("pool-closed");
    reactor.init().unwrap();

    // Close the negotiation pool while the reactor is still running: new
    // connections can no longer be negotiated.
    messenger.shutdown();

    let (addr, _streams) = acceptor(1);
    let (tx, rx) = mpsc::channel();
    let call = OutboundCall::with_callback(
        ConnectionId::new(addr, UserCredentials::default()),
        Bytes::from_static(b"too-late"),
        Some(Duration::from_secs(1)),
        Box::new(move |result| {
            let _ = tx.send(result);
        }),
    );
    reactor.queue_outbound_call(call);

    let result = rx.recv_timeout(Duration::from_secs(3)).unwrap();
    match result {
        Err(Error::ServiceUnavailable { message, .. }) => {
            assert_eq!(message, "Client RPC Messenger shutting down");
        }
        other => panic!("unexpected result {:?}", other),
    }

    reactor.shutdown();
    reactor.join();
}
