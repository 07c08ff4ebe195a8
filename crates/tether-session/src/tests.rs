//! Cross-module tests: two communicators linked by an in-memory frame
//! channel, exercising the full call/return/teardown paths without a real
//! socket.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use serde_json::{json, Value};
use tokio::sync::{mpsc, Notify};
use tokio::task::JoinHandle;
use tokio::time::timeout;

use tether_wire::{ErrorDesc, Frame, Invoke, SessionState};

use crate::{
    Arg, CallArgs, CommError, Communicator, FrameTransport, Provider, Pump, RemoteCallback,
    StateCell,
};

const TICK: Duration = Duration::from_secs(5);

struct ChannelTransport {
    tx: Option<mpsc::UnboundedSender<Frame>>,
    rx: mpsc::UnboundedReceiver<Frame>,
}

impl FrameTransport for ChannelTransport {
    async fn post(&mut self, frame: &Frame) -> std::io::Result<()> {
        let tx = self
            .tx
            .as_ref()
            .ok_or_else(|| std::io::Error::from(std::io::ErrorKind::BrokenPipe))?;
        tx.send(frame.clone())
            .map_err(|_| std::io::Error::from(std::io::ErrorKind::BrokenPipe))
    }

    async fn recv(&mut self) -> std::io::Result<Option<Frame>> {
        Ok(self.rx.recv().await)
    }

    async fn close(&mut self) -> std::io::Result<()> {
        self.tx = None;
        Ok(())
    }
}

fn transport_pair() -> (ChannelTransport, ChannelTransport) {
    let (tx_a, rx_b) = mpsc::unbounded_channel();
    let (tx_b, rx_a) = mpsc::unbounded_channel();
    (
        ChannelTransport {
            tx: Some(tx_a),
            rx: rx_a,
        },
        ChannelTransport {
            tx: Some(tx_b),
            rx: rx_b,
        },
    )
}

struct Endpoint {
    comm: Communicator,
    cell: Arc<StateCell>,
    pump: JoinHandle<Result<(), CommError>>,
}

fn open_endpoint(io: ChannelTransport, provider: Option<Provider>) -> Endpoint {
    let cell = Arc::new(StateCell::new());
    cell.begin_open().expect("fresh cell opens");
    cell.advance_to(SessionState::Open);
    let (comm, outgoing) = Communicator::new(cell.clone(), provider);
    let pump = Pump::new(io, comm.clone(), outgoing).spawn();
    Endpoint { comm, cell, pump }
}

/// Two OPEN communicators wired back to back.
fn linked(provider_a: Option<Provider>, provider_b: Option<Provider>) -> (Endpoint, Endpoint) {
    let (io_a, io_b) = transport_pair();
    (open_endpoint(io_a, provider_a), open_endpoint(io_b, provider_b))
}

fn calculator() -> Provider {
    Provider::object()
        .method("plus", |args: CallArgs| async move {
            let (a, b): (f64, f64) = (args.value(0)?, args.value(1)?);
            Ok(json!(a + b))
        })
        .method("minus", |args: CallArgs| async move {
            let (a, b): (f64, f64) = (args.value(0)?, args.value(1)?);
            Ok(json!(a - b))
        })
        .method("multiplies", |args: CallArgs| async move {
            let (a, b): (f64, f64) = (args.value(0)?, args.value(1)?);
            Ok(json!(a * b))
        })
        .method("raise", |_args: CallArgs| async move {
            Err::<Value, _>(ErrorDesc::new("DomainError", "bad"))
        })
        .nested(
            "scientific",
            Provider::object().method("sqrt", |args: CallArgs| async move {
                let x: f64 = args.value(0)?;
                Ok(json!(x.sqrt()))
            }),
        )
}

#[tokio::test]
async fn round_trip_and_chained_calls() {
    let (client, _server) = linked(None, Some(calculator()));
    let driver = client.comm.get_driver();

    let five: f64 = timeout(
        TICK,
        driver.call_as("plus", vec![Arg::value(&2).unwrap(), json!(3).into()]),
    )
    .await
    .unwrap()
    .unwrap();
    assert_eq!(five, 5.0);

    let twenty: f64 = timeout(
        TICK,
        driver.call_as("multiplies", vec![json!(five).into(), json!(4).into()]),
    )
    .await
    .unwrap()
    .unwrap();
    assert_eq!(twenty, 20.0);

    assert_eq!(client.comm.pending_calls(), 0);
}

#[tokio::test]
async fn nested_paths_resolve_through_the_tree() {
    let (client, _server) = linked(None, Some(calculator()));
    let driver = client.comm.get_driver();

    let via_chain: f64 = timeout(
        TICK,
        driver.get("scientific").call_as("sqrt", vec![json!(16).into()]),
    )
    .await
    .unwrap()
    .unwrap();
    assert_eq!(via_chain, 4.0);

    let via_dotted: f64 = timeout(
        TICK,
        driver.call_as("scientific.sqrt", vec![json!(16).into()]),
    )
    .await
    .unwrap()
    .unwrap();
    assert_eq!(via_dotted, 4.0);
}

#[tokio::test]
async fn remote_throw_preserves_name_and_message() {
    let (client, _server) = linked(None, Some(calculator()));
    let driver = client.comm.get_driver();

    let err = timeout(TICK, driver.call("raise", vec![]))
        .await
        .unwrap()
        .expect_err("raise should fail");
    match err {
        CommError::User(desc) => {
            assert_eq!(desc.name, "DomainError");
            assert_eq!(desc.message, "bad");
        }
        other => panic!("expected a remote error, got {other:?}"),
    }
    assert_eq!(client.comm.pending_calls(), 0);
}

#[tokio::test]
async fn unknown_listener_is_a_localised_failure() {
    let (client, _server) = linked(None, Some(calculator()));
    let driver = client.comm.get_driver();

    let err = timeout(TICK, driver.call("no.such.method", vec![]))
        .await
        .unwrap()
        .expect_err("unknown listener should fail");
    match err {
        CommError::User(desc) => assert_eq!(desc.name, "ListenerNotFound"),
        other => panic!("expected a remote error, got {other:?}"),
    }

    // The channel survives; the next call still works.
    let five: f64 = timeout(TICK, driver.call_as("plus", vec![json!(2).into(), json!(3).into()]))
        .await
        .unwrap()
        .unwrap();
    assert_eq!(five, 5.0);
}

#[tokio::test]
async fn callback_argument_round_trips_and_is_released() {
    let provider = Provider::object().method("for_each", |args: CallArgs| async move {
        let items: Vec<i64> = args.value(0)?;
        let callback = args.callback(1)?;
        for item in items {
            callback.invoke(vec![json!(item).into()]).await.map_err(|e| {
                ErrorDesc::new("CallbackError", e.to_string())
            })?;
        }
        Ok(Value::Null)
    });
    let (client, _server) = linked(None, Some(provider));
    let driver = client.comm.get_driver();

    let accum: Arc<Mutex<Vec<i64>>> = Arc::new(Mutex::new(Vec::new()));
    let sink = Arc::clone(&accum);
    let callback = Arg::callback(move |args: CallArgs| {
        let sink = Arc::clone(&sink);
        async move {
            let item: i64 = args.value(0)?;
            sink.lock().unwrap().push(item);
            Ok(Value::Null)
        }
    });

    timeout(
        TICK,
        driver.call("for_each", vec![json!([1, 2, 3]).into(), callback]),
    )
    .await
    .unwrap()
    .unwrap();

    assert_eq!(*accum.lock().unwrap(), vec![1, 2, 3]);
    // Single-use: the exported uid is gone once the return arrived.
    assert_eq!(client.comm.exported_handles(), 0);
}

/// A provider that stores the callback it was given for later use.
fn stash_provider(slot: Arc<Mutex<Option<RemoteCallback>>>) -> Provider {
    Provider::object().method("subscribe", move |args: CallArgs| {
        let slot = Arc::clone(&slot);
        async move {
            *slot.lock().unwrap() = Some(args.callback(0)?);
            Ok(Value::Null)
        }
    })
}

#[tokio::test]
async fn stored_callback_without_retain_is_dead_after_return() {
    let slot: Arc<Mutex<Option<RemoteCallback>>> = Arc::new(Mutex::new(None));
    let (client, _server) = linked(None, Some(stash_provider(Arc::clone(&slot))));
    let driver = client.comm.get_driver();

    let callback = Arg::callback(|_args: CallArgs| async move { Ok(json!("fired")) });
    timeout(TICK, driver.call("subscribe", vec![callback]))
        .await
        .unwrap()
        .unwrap();
    assert_eq!(client.comm.exported_handles(), 0);

    let stored = slot.lock().unwrap().take().expect("callback was stored");
    let err = timeout(TICK, stored.invoke(vec![]))
        .await
        .unwrap()
        .expect_err("released handle should reject");
    match err {
        CommError::User(desc) => assert_eq!(desc.name, "HandleReleased"),
        other => panic!("expected a remote error, got {other:?}"),
    }
}

#[tokio::test]
async fn retained_callback_survives_the_return() {
    let slot: Arc<Mutex<Option<RemoteCallback>>> = Arc::new(Mutex::new(None));
    let (client, _server) = linked(None, Some(stash_provider(Arc::clone(&slot))));
    let driver = client.comm.get_driver();

    let callback = Arg::retained(|_args: CallArgs| async move { Ok(json!("fired")) });
    timeout(TICK, driver.call("subscribe", vec![callback]))
        .await
        .unwrap()
        .unwrap();
    assert_eq!(client.comm.exported_handles(), 1);

    let stored = slot.lock().unwrap().take().expect("callback was stored");
    let fired = timeout(TICK, stored.invoke(vec![]))
        .await
        .unwrap()
        .expect("retained handle still lives");
    assert_eq!(fired, json!("fired"));

    // Teardown evicts retained handles too.
    client.comm.shutdown();
    assert_eq!(client.comm.exported_handles(), 0);
}

#[tokio::test]
async fn shutdown_fans_out_to_every_pending_call() {
    let gate = Arc::new(Notify::new());
    let hold = Arc::clone(&gate);
    let provider = Provider::object().method("stall", move |_args: CallArgs| {
        let hold = Arc::clone(&hold);
        async move {
            hold.notified().await;
            Ok(Value::Null)
        }
    });
    let (client, _server) = linked(None, Some(provider));
    let driver = client.comm.get_driver();

    let calls: Vec<_> = (0..4)
        .map(|_| {
            let driver = driver.clone();
            tokio::spawn(async move { driver.call("stall", vec![]).await })
        })
        .collect();

    // Let the calls register before tearing down.
    while client.comm.pending_calls() < 4 {
        tokio::time::sleep(Duration::from_millis(5)).await;
    }

    client.comm.shutdown();
    for call in calls {
        match timeout(TICK, call).await.unwrap().unwrap() {
            Err(CommError::ConnectionClosed) => {}
            other => panic!("expected ConnectionClosed, got {other:?}"),
        }
    }
    assert_eq!(client.comm.pending_calls(), 0);

    // Calls after teardown fail immediately.
    match driver.call("stall", vec![]).await {
        Err(CommError::ConnectionClosed) | Err(CommError::NotReady { .. }) => {}
        other => panic!("expected a closed-channel error, got {other:?}"),
    }
}

#[tokio::test]
async fn late_and_duplicate_returns_are_dropped() {
    let (client, _server) = linked(None, Some(calculator()));

    // A return for a uid nobody registered is silently discarded.
    client.comm.reply_data(Invoke::Return {
        uid: 424242,
        success: true,
        value: json!(1),
    });

    let driver = client.comm.get_driver();
    let five: f64 = timeout(TICK, driver.call_as("plus", vec![json!(2).into(), json!(3).into()]))
        .await
        .unwrap()
        .unwrap();
    assert_eq!(five, 5.0);

    // A duplicate of an already-completed uid is likewise discarded.
    client.comm.reply_data(Invoke::Return {
        uid: 1,
        success: false,
        value: json!({"name": "Late", "message": "ignored"}),
    });
    assert_eq!(client.comm.pending_calls(), 0);
}

#[tokio::test]
async fn driver_is_inert_before_open() {
    let (io, _peer) = transport_pair();
    let cell = Arc::new(StateCell::new());
    cell.begin_open().unwrap();
    let (comm, outgoing) = Communicator::new(cell.clone(), None);
    let _pump = Pump::new(io, comm.clone(), outgoing).spawn();

    let driver = comm.get_driver();
    match driver.invoke(vec![]).await {
        Err(CommError::NotReady {
            state: SessionState::Opening,
        }) => {}
        other => panic!("expected NotReady in OPENING, got {other:?}"),
    }
    assert_eq!(comm.pending_calls(), 0);
}

#[tokio::test]
async fn provider_swap_is_opening_only() {
    let cell = Arc::new(StateCell::new());
    cell.begin_open().unwrap();
    let (comm, _outgoing) = Communicator::new(cell.clone(), None);

    comm.set_provider(Some(calculator()))
        .expect("swap while OPENING");

    cell.advance_to(SessionState::Open);
    match comm.set_provider(None) {
        Err(CommError::NotReady {
            state: SessionState::Open,
        }) => {}
        other => panic!("expected NotReady in OPEN, got {other:?}"),
    }
}

#[tokio::test]
async fn returns_may_overtake_earlier_calls() {
    let provider = Provider::object()
        .method("slow", |_args: CallArgs| async move {
            tokio::time::sleep(Duration::from_millis(80)).await;
            Ok(json!("slow"))
        })
        .method("fast", |_args: CallArgs| async move { Ok(json!("fast")) });
    let (client, _server) = linked(None, Some(provider));
    let driver = client.comm.get_driver();

    let slow = driver.call("slow", vec![]);
    let fast = driver.call("fast", vec![]);
    let (slow, fast) = timeout(TICK, async { tokio::join!(slow, fast) })
        .await
        .unwrap();
    assert_eq!(slow.unwrap(), json!("slow"));
    assert_eq!(fast.unwrap(), json!("fast"));
}

#[tokio::test]
async fn concurrent_callers_get_their_own_answers() {
    let (client, _server) = linked(None, Some(calculator()));
    let driver = client.comm.get_driver();

    let mut workers = Vec::new();
    for caller in 0..3_i64 {
        let driver = driver.clone();
        workers.push(tokio::spawn(async move {
            for k in 0..25_i64 {
                let expected = (caller * 1000 + k) as f64;
                let got: f64 = driver
                    .call_as("plus", vec![json!(caller * 1000).into(), json!(k).into()])
                    .await
                    .expect("call should succeed");
                assert_eq!(got, expected, "caller {caller} call {k}");
            }
        }));
    }
    for worker in workers {
        timeout(TICK, worker).await.unwrap().unwrap();
    }
    assert_eq!(client.comm.pending_calls(), 0);
}

#[tokio::test]
async fn closing_sentinel_tears_down_the_peer() {
    let (client, server) = linked(None, Some(calculator()));

    client.comm.post_frame(Frame::Sentinel(SessionState::Closing)).unwrap();
    // The peer's pump exits cleanly once it saw the sentinel.
    timeout(TICK, server.pump).await.unwrap().unwrap().unwrap();
    assert_eq!(server.comm.state(), SessionState::Closed);
    assert_eq!(server.comm.pending_calls(), 0);

    // Our own side shuts down through the queue.
    client.comm.shutdown();
    client.comm.post_shutdown();
    timeout(TICK, client.pump).await.unwrap().unwrap().unwrap();
    assert_eq!(client.cell.get(), SessionState::Closed);
}

#[tokio::test]
async fn unexpected_handshake_frame_is_fatal() {
    let (client, server) = linked(None, Some(calculator()));

    client.comm.post_frame(Frame::Confirm).unwrap();
    let err = timeout(TICK, server.pump)
        .await
        .unwrap()
        .unwrap()
        .expect_err("confirm outside handshake is a protocol error");
    assert!(matches!(err, CommError::Protocol { .. }));
    assert_eq!(server.comm.state(), SessionState::Closed);
}

#[tokio::test]
async fn transport_failure_fails_pending_calls_over() {
    let gate = Arc::new(Notify::new());
    let hold = Arc::clone(&gate);
    let provider = Provider::object().method("stall", move |_args: CallArgs| {
        let hold = Arc::clone(&hold);
        async move {
            hold.notified().await;
            Ok(Value::Null)
        }
    });
    let (client, server) = linked(None, Some(provider));
    let driver = client.comm.get_driver();

    let stuck = {
        let driver = driver.clone();
        tokio::spawn(async move { driver.call("stall", vec![]).await })
    };
    while client.comm.pending_calls() < 1 {
        tokio::time::sleep(Duration::from_millis(5)).await;
    }

    // Peer drops its transport without any close protocol.
    server.pump.abort();
    drop(server.comm);
    drop(server.cell);

    match timeout(TICK, stuck).await.unwrap().unwrap() {
        Err(CommError::ConnectionClosed) => {}
        other => panic!("expected ConnectionClosed, got {other:?}"),
    }
    assert_eq!(client.comm.pending_calls(), 0);
    assert_eq!(client.comm.state(), SessionState::Closed);
}
