
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use serde_json::{json, Value};

use portlink::{
    connect, ConnectOptions, ConnectionRegistry, Endpoint, Payload, RelayClient, RelayOptions,
    RelayService, RpcError, RpcHost, Schema, TransferBuf,
};

async fn settle() {
    tokio::time::sleep(Duration::from_millis(30)).await;
}

fn init_tracing() {
    let _ = tracing_subscriber::fmt().with_test_writer().try_init();
}

#[tokio::test]
async fn simple_call_resolves() {
    init_tracing();
    let (host_ep, guest_ep) = Endpoint::worker_pair();
    let schema = Schema::new().method("add", |args: Vec<Value>, _ctx| async move {
        let a = args[0].as_i64().unwrap_or(0);
        let b = args[1].as_i64().unwrap_or(0);
        Ok(Payload::new(json!(a + b)))
    });
    let _host = RpcHost::listen_with_registry(host_ep, schema, ConnectionRegistry::new());

    let guest = connect(Schema::new(), ConnectOptions::new().with_host(guest_ep))
        .await
        .unwrap();
    let result = guest
        .remote()
        .call("add", vec![json!(2), json!(3)])
        .await
        .unwrap();
    assert_eq!(result, json!(5));
}

#[tokio::test]
async fn error_propagates_with_message_and_stack() {
    let (host_ep, guest_ep) = Endpoint::worker_pair();
    let schema = Schema::new().method("fail", |_args, _ctx| async move {
        Err::<Payload, _>("nope".into())
    });
    let _host = RpcHost::listen_with_registry(host_ep, schema, ConnectionRegistry::new());

    let guest = connect(Schema::new(), ConnectOptions::new().with_host(guest_ep))
        .await
        .unwrap();
    let err = guest.remote().call("fail", vec![]).await.unwrap_err();
    let RpcError::Remote(remote) = err else {
        panic!("expected a remote error");
    };
    assert_eq!(remote.message, "nope");
    assert!(!remote.stack.is_empty());
}

#[tokio::test]
async fn echo_round_trip_deep_equals() {
    let (host_ep, guest_ep) = Endpoint::worker_pair();
    let schema = Schema::new().method("echo", |args: Vec<Value>, _ctx| async move {
        Ok(Payload::new(args.into_iter().next().unwrap_or(Value::Null)))
    });
    let _host = RpcHost::listen_with_registry(host_ep, schema, ConnectionRegistry::new());
    let guest = connect(Schema::new(), ConnectOptions::new().with_host(guest_ep))
        .await
        .unwrap();

    let remote = guest.remote();
    for value in [
        json!(null),
        json!(42),
        json!("text"),
        json!([1, [2, [3]], { "k": "v" }]),
        json!({ "nested": { "deep": [true, false, null] } }),
    ] {
        let echoed = remote.call("echo", vec![value.clone()]).await.unwrap();
        assert_eq!(echoed, value);
    }
}

#[tokio::test]
async fn transferable_round_trip_detaches_sender() {
    let (host_ep, guest_ep) = Endpoint::worker_pair();
    let schema = Schema::new().method("ping", |_args, ctx| async move {
        let buf = ctx.transfers.0[0].clone();
        Ok(portlink::with_transfer(move |t| {
            let buf = t.transfer(buf);
            json!({ "len": buf.byte_len() })
        }))
    });
    let _host = RpcHost::listen_with_registry(host_ep, schema, ConnectionRegistry::new());
    let guest = connect(Schema::new(), ConnectOptions::new().with_host(guest_ep))
        .await
        .unwrap();

    let buf = TransferBuf::new(vec![0xAB; 1024]);
    let original_view = buf.clone();
    let reply = guest
        .remote()
        .call_full("ping", vec![], vec![buf])
        .await
        .unwrap();

    assert!(original_view.is_detached());
    assert_eq!(reply.value["len"], json!(1024));
    assert_eq!(reply.transfers.0[0].byte_len(), Some(1024));
}

#[tokio::test]
async fn bidirectional_double_inc() {
    let (host_ep, guest_ep) = Endpoint::worker_pair();
    let host_schema = Schema::new().method("double", |args: Vec<Value>, ctx| async move {
        let n = args[0].as_i64().unwrap_or(0);
        let inc = ctx.peer.invoke("inc", vec![json!(n)]).await?;
        Ok(Payload::new(json!(2 * inc.as_i64().unwrap_or(0))))
    });
    let _host = RpcHost::listen_with_registry(host_ep, host_schema, ConnectionRegistry::new());

    let guest_schema = Schema::new().method("inc", |args: Vec<Value>, _ctx| async move {
        Ok(Payload::new(json!(args[0].as_i64().unwrap_or(0) + 1)))
    });
    let guest = connect(guest_schema, ConnectOptions::new().with_host(guest_ep))
        .await
        .unwrap();

    assert_eq!(
        guest.remote().call("double", vec![json!(4)]).await.unwrap(),
        json!(10)
    );
}

#[tokio::test]
async fn concurrent_calls_settle_by_duration_not_issue_order() {
    let (host_ep, guest_ep) = Endpoint::worker_pair();
    let schema = Schema::new().method("slow", |args: Vec<Value>, _ctx| async move {
        let n = args[0].as_u64().unwrap_or(0);
        tokio::time::sleep(Duration::from_millis(n)).await;
        Ok(Payload::new(json!(n)))
    });
    let _host = RpcHost::listen_with_registry(host_ep, schema, ConnectionRegistry::new());
    let guest = connect(Schema::new(), ConnectOptions::new().with_host(guest_ep))
        .await
        .unwrap();

    let order = Arc::new(Mutex::new(Vec::new()));
    let mut handles = Vec::new();
    for n in [30u64, 10, 20] {
        let remote = guest.remote();
        let order = order.clone();
        handles.push(tokio::spawn(async move {
            let value = remote.call("slow", vec![json!(n)]).await.unwrap();
            assert_eq!(value, json!(n));
            order.lock().push(n);
        }));
    }
    for handle in handles {
        handle.await.unwrap();
    }
    assert_eq!(*order.lock(), vec![10, 20, 30]);
}

#[tokio::test]
async fn close_drops_late_replies_without_settling() {
    let (host_ep, guest_ep) = Endpoint::worker_pair();
    let schema = Schema::new().method("wait", |_args, _ctx| async move {
        tokio::time::sleep(Duration::from_millis(50)).await;
        Ok(Payload::new(json!("late")))
    });
    let _host = RpcHost::listen_with_registry(host_ep, schema, ConnectionRegistry::new());
    let guest = connect(Schema::new(), ConnectOptions::new().with_host(guest_ep))
        .await
        .unwrap();

    let remote = guest.remote();
    let call = tokio::spawn(async move { remote.call("wait", vec![]).await });
    tokio::time::sleep(Duration::from_millis(10)).await;
    guest.close();

    assert!(matches!(
        call.await.unwrap(),
        Err(RpcError::ConnectionClosed)
    ));
    // Let the reply arrive; the closed connection must ignore it.
    tokio::time::sleep(Duration::from_millis(60)).await;
    assert!(guest.is_closed());
}

fn counting_tab_schema(hits: Arc<AtomicUsize>) -> Schema {
    Schema::new()
        .method("inc", move |args: Vec<Value>, ctx| {
            let hits = hits.clone();
            async move {
                hits.fetch_add(1, Ordering::SeqCst);
                ctx.peer.set_state("counter", args[0].clone())?;
                Ok(Payload::new(Value::Null))
            }
        })
        .data("counter", json!(0))
}

#[tokio::test]
async fn broadcast_fans_out_to_everyone_but_sender() {
    init_tracing();
    let relay = RelayService::new();
    let hits: Vec<Arc<AtomicUsize>> = (0..3).map(|_| Arc::new(AtomicUsize::new(0))).collect();

    let mut tabs = Vec::new();
    for (i, hit) in hits.iter().enumerate() {
        let client = RelayClient::connect(
            counting_tab_schema(hit.clone()),
            RelayOptions::new()
                .with_relay(relay.connect())
                .with_channel("c")
                .with_tab_id(format!("t{}", i + 1)),
        )
        .await
        .unwrap();
        tabs.push(client);
    }

    tabs[0].remote().invoke("inc", vec![json!(5)]).await.unwrap();
    settle().await;

    for tab in &tabs {
        assert_eq!(tab.remote().get("counter"), Some(json!(5)));
    }
    // Sender ran locally exactly once; the others ran on relay delivery.
    assert_eq!(hits[0].load(Ordering::SeqCst), 1);
    assert_eq!(hits[1].load(Ordering::SeqCst), 1);
    assert_eq!(hits[2].load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn direct_message_reaches_one_tab_only() {
    let relay = RelayService::new();
    let pings: Vec<Arc<AtomicUsize>> = (0..3).map(|_| Arc::new(AtomicUsize::new(0))).collect();

    let schema = |hits: Arc<AtomicUsize>| {
        Schema::new().method("ping", move |_args: Vec<Value>, _ctx| {
            let hits = hits.clone();
            async move {
                hits.fetch_add(1, Ordering::SeqCst);
                Ok(Payload::new(json!("pong")))
            }
        })
    };

    let mut tabs = Vec::new();
    for (name, hit) in ["A", "B", "C"].iter().zip(&pings) {
        let client = RelayClient::connect(
            schema(hit.clone()),
            RelayOptions::new()
                .with_relay(relay.connect())
                .with_channel("m")
                .with_tab_id(*name),
        )
        .await
        .unwrap();
        tabs.push(client);
    }

    tabs[0]
        .remote()
        .to("B")
        .invoke("ping", vec![json!("hi")])
        .await
        .unwrap();
    settle().await;

    assert_eq!(pings[0].load(Ordering::SeqCst), 1, "sender runs locally");
    assert_eq!(pings[1].load(Ordering::SeqCst), 1, "target runs on delivery");
    assert_eq!(pings[2].load(Ordering::SeqCst), 0, "bystander sees nothing");
}

#[tokio::test]
async fn direct_message_to_unknown_tab_is_dropped() {
    let relay = RelayService::new();
    let client = RelayClient::connect(
        Schema::new().method("ping", |_args, _ctx| async move {
            Ok(Payload::new(json!("pong")))
        }),
        RelayOptions::new()
            .with_relay(relay.connect())
            .with_channel("m")
            .with_tab_id("A"),
    )
    .await
    .unwrap();

    // No negative acknowledgment; the local result still comes back.
    let result = client
        .remote()
        .to("ghost")
        .invoke("ping", vec![])
        .await
        .unwrap();
    assert_eq!(result, json!("pong"));
}

#[tokio::test]
async fn duplicate_tab_id_evicts_previous_holder() {
    let relay = RelayService::new();
    let old = RelayClient::connect(
        Schema::new(),
        RelayOptions::new()
            .with_relay(relay.connect())
            .with_channel("c")
            .with_tab_id("x"),
    )
    .await
    .unwrap();

    let new = RelayClient::connect(
        Schema::new(),
        RelayOptions::new()
            .with_relay(relay.connect())
            .with_channel("c")
            .with_tab_id("x"),
    )
    .await
    .unwrap();
    settle().await;

    assert_eq!(old.eviction().as_deref(), Some("DUPLICATE_TAB_ID"));
    assert!(old.is_closed());
    assert!(!new.is_closed());
    assert_eq!(new.connected_tabs().await.unwrap(), vec!["x"]);
}

#[tokio::test]
async fn broadcast_local_error_rethrown_but_still_broadcast() {
    let relay = RelayService::new();
    let observed = Arc::new(AtomicUsize::new(0));

    let failing = Schema::new().method("boom", |_args: Vec<Value>, _ctx| async move {
        Err::<Payload, _>("local failure".into())
    });
    let sender = RelayClient::connect(
        failing,
        RelayOptions::new()
            .with_relay(relay.connect())
            .with_channel("e")
            .with_tab_id("s"),
    )
    .await
    .unwrap();

    let observed_clone = observed.clone();
    let observer_schema = Schema::new().method("boom", move |_args: Vec<Value>, _ctx| {
        let observed = observed_clone.clone();
        async move {
            observed.fetch_add(1, Ordering::SeqCst);
            Ok(Payload::new(Value::Null))
        }
    });
    let _observer = RelayClient::connect(
        observer_schema,
        RelayOptions::new()
            .with_relay(relay.connect())
            .with_channel("e")
            .with_tab_id("o"),
    )
    .await
    .unwrap();

    let err = sender.remote().invoke("boom", vec![]).await.unwrap_err();
    assert!(matches!(err, RpcError::Remote(_)));
    settle().await;
    // The failure did not stop the envelope from reaching the peer.
    assert_eq!(observed.load(Ordering::SeqCst), 1);
}
