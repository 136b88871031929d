//! Call/reply protocol tests: two endpoints over the in-memory channel,
//! plus raw-wire cases driving one endpoint through a bare channel half.

use std::sync::Arc;
use std::time::Duration;

use parley::{
    memory_pair, CallId, Endpoint, Envelope, MemoryChannel, Message, Payload, ProtocolError,
    RawChannel, Reason, WireReason,
};
use tokio::time::timeout;

const TICK: Duration = Duration::from_millis(500);

/// Two endpoints wired back to back, both drive loops running.
fn linked_pair() -> (Arc<Endpoint<MemoryChannel>>, Arc<Endpoint<MemoryChannel>>) {
    let (main_half, worker_half) = memory_pair(64);
    let main = Arc::new(Endpoint::new("main", "worker", Arc::new(main_half)));
    let worker = Arc::new(Endpoint::new("worker", "main", Arc::new(worker_half)));
    tokio::spawn(Arc::clone(&main).run());
    tokio::spawn(Arc::clone(&worker).run());
    (main, worker)
}

#[tokio::test]
async fn call_round_trip() {
    let (main, worker) = linked_pair();
    worker.register_action("echo", |payload| async move { Ok(payload) });

    let result = timeout(TICK, main.call("echo", Payload::bytes(b"hello".to_vec())))
        .await
        .unwrap()
        .unwrap();
    assert_eq!(result.data, b"hello");
}

#[tokio::test]
async fn handler_failure_becomes_matching_error_reply() {
    let (main, worker) = linked_pair();
    worker.register_action("locked", |_payload| async move {
        Err(Reason::Password {
            message: "needs password".into(),
            code: 1,
        })
    });

    let err = timeout(TICK, main.call("locked", Payload::empty()))
        .await
        .unwrap()
        .unwrap_err();
    assert_eq!(
        err,
        Reason::Password {
            message: "needs password".into(),
            code: 1,
        }
    );
}

// A call to an unregistered action must not hang: the router answers with
// an ERROR reply whose wrapped reason is the Unknown kind.
#[tokio::test]
async fn unknown_action_with_call_id_yields_unknown_error() {
    let (main, _worker) = linked_pair();

    let err = timeout(TICK, main.call("missing", Payload::empty()))
        .await
        .unwrap()
        .unwrap_err();
    match err {
        Reason::Unknown { message, .. } => assert!(message.contains("missing"), "{message}"),
        other => panic!("expected Unknown, got {other:?}"),
    }
}

// Replies are matched by call id, not by arrival order.
#[tokio::test]
async fn out_of_order_replies_settle_independently() {
    let (main, worker) = linked_pair();
    let gate = Arc::new(tokio::sync::Notify::new());

    worker.register_action("slow", {
        let gate = Arc::clone(&gate);
        move |payload| {
            let gate = Arc::clone(&gate);
            async move {
                gate.notified().await;
                Ok(payload)
            }
        }
    });
    worker.register_action("fast", |payload| async move { Ok(payload) });

    let slow = tokio::spawn({
        let main = Arc::clone(&main);
        async move { main.call("slow", Payload::bytes(b"first".to_vec())).await }
    });
    // Make sure the slow call is issued (and its id allocated) first.
    tokio::time::sleep(Duration::from_millis(20)).await;

    let fast = timeout(TICK, main.call("fast", Payload::bytes(b"second".to_vec())))
        .await
        .unwrap()
        .unwrap();
    assert_eq!(fast.data, b"second");

    gate.notify_one();
    let slow = timeout(TICK, slow).await.unwrap().unwrap().unwrap();
    assert_eq!(slow.data, b"first");
}

#[tokio::test]
async fn fire_and_forget_reaches_handler() {
    let (main, worker) = linked_pair();
    let (seen_tx, mut seen_rx) = tokio::sync::mpsc::unbounded_channel();

    worker.register_action("note", move |payload| {
        let seen_tx = seen_tx.clone();
        async move {
            seen_tx.send(payload.data).unwrap();
            Ok(Payload::empty())
        }
    });

    main.send("note", Payload::bytes(b"ping".to_vec()))
        .await
        .unwrap();
    let seen = timeout(TICK, seen_rx.recv()).await.unwrap().unwrap();
    assert_eq!(seen, b"ping");
}

#[tokio::test]
async fn transferred_buffers_move_with_the_message() {
    let (main, worker) = linked_pair();
    worker.register_action("sum", |payload| async move {
        let total: usize = payload.transfers.iter().map(Vec::len).sum();
        Ok(Payload::bytes(vec![total as u8]))
    });

    let payload = Payload::with_transfers(Vec::new(), vec![vec![0u8; 3], vec![0u8; 4]]);
    let result = timeout(TICK, main.call("sum", payload))
        .await
        .unwrap()
        .unwrap();
    assert_eq!(result.data, vec![7]);
}

// ============================================================================
// Raw-wire cases: the test drives the endpoint through a bare channel half.
// ============================================================================

fn raw_endpoint() -> (Arc<Endpoint<MemoryChannel>>, MemoryChannel) {
    let (endpoint_half, probe_half) = memory_pair(64);
    let endpoint = Arc::new(Endpoint::new("worker", "main", Arc::new(endpoint_half)));
    (endpoint, probe_half)
}

fn action_from_main(target: &str, call_id: u64, action: &str) -> Envelope {
    Envelope {
        source: "main".into(),
        target: target.into(),
        body: Message::Action {
            action: action.into(),
            call_id: Some(CallId::new(call_id)),
            payload: Payload::empty(),
        },
    }
}

#[tokio::test]
async fn foreign_target_traffic_is_ignored() {
    let (endpoint, probe) = raw_endpoint();
    endpoint.register_action("ping", |payload| async move { Ok(payload) });
    tokio::spawn(Arc::clone(&endpoint).run());

    // Addressed to somebody else: must produce no reply at all.
    probe
        .post(action_from_main("observer", 1, "ping"))
        .await
        .unwrap();
    // Addressed to us: answered normally.
    probe
        .post(action_from_main("worker", 2, "ping"))
        .await
        .unwrap();

    let reply = timeout(TICK, probe.recv()).await.unwrap().unwrap();
    match reply.body {
        Message::Reply { call_id, result } => {
            assert_eq!(call_id, CallId::new(2));
            assert!(result.is_ok());
        }
        other => panic!("expected reply, got {other:?}"),
    }
}

#[tokio::test]
async fn stray_reply_is_connection_fatal() {
    let (endpoint, probe) = raw_endpoint();
    let drive = tokio::spawn(Arc::clone(&endpoint).run());

    probe
        .post(Envelope {
            source: "main".into(),
            target: "worker".into(),
            body: Message::Reply {
                call_id: CallId::new(99),
                result: Ok(Payload::empty()),
            },
        })
        .await
        .unwrap();

    let outcome = timeout(TICK, drive).await.unwrap().unwrap();
    assert_eq!(outcome, Err(ProtocolError::UnknownCallId(CallId::new(99))));
}

#[tokio::test]
async fn call_ids_are_unique_and_monotonic() {
    let (endpoint, probe) = raw_endpoint();
    tokio::spawn(Arc::clone(&endpoint).run());

    for _ in 0..2 {
        let endpoint = Arc::clone(&endpoint);
        tokio::spawn(async move { endpoint.call("anything", Payload::empty()).await });
    }

    let first = timeout(TICK, probe.recv()).await.unwrap().unwrap();
    let second = timeout(TICK, probe.recv()).await.unwrap().unwrap();
    let id_of = |env: &Envelope| match &env.body {
        Message::Action {
            call_id: Some(id), ..
        } => id.raw(),
        other => panic!("expected correlated action, got {other:?}"),
    };
    let (a, b) = (id_of(&first), id_of(&second));
    assert_ne!(a, b);
    assert!(b > a, "ids must increase: {a} then {b}");
}

#[tokio::test]
async fn failed_post_settles_the_outcome_immediately() {
    let (endpoint, probe) = raw_endpoint();
    drop(probe);

    let err = endpoint
        .call("echo", Payload::empty())
        .await
        .expect_err("posting on a closed channel cannot succeed");
    assert!(matches!(err, Reason::Abort(_)), "{err:?}");
}

#[tokio::test]
async fn detach_settles_pending_calls() {
    let (endpoint, _probe) = raw_endpoint();
    let drive = tokio::spawn(Arc::clone(&endpoint).run());

    let pending = tokio::spawn({
        let endpoint = Arc::clone(&endpoint);
        async move { endpoint.call("never-answered", Payload::empty()).await }
    });
    tokio::time::sleep(Duration::from_millis(20)).await;

    endpoint.detach();
    assert_eq!(timeout(TICK, drive).await.unwrap().unwrap(), Ok(()));

    let err = timeout(TICK, pending).await.unwrap().unwrap().unwrap_err();
    assert_eq!(err, Reason::Abort("endpoint detached".into()));
}

// The ERROR reply for an unknown action carries a wrapped Unknown reason on
// the wire, not a bare value.
#[tokio::test]
async fn unknown_action_reply_is_wrapped_on_the_wire() {
    let (endpoint, probe) = raw_endpoint();
    tokio::spawn(Arc::clone(&endpoint).run());

    probe
        .post(action_from_main("worker", 5, "nothing-here"))
        .await
        .unwrap();

    let reply = timeout(TICK, probe.recv()).await.unwrap().unwrap();
    match reply.body {
        Message::Reply { call_id, result } => {
            assert_eq!(call_id, CallId::new(5));
            match result {
                Err(WireReason::Wrapped { tag, .. }) => assert_eq!(tag, "UnknownError"),
                other => panic!("expected wrapped error, got {other:?}"),
            }
        }
        other => panic!("expected reply, got {other:?}"),
    }
}
