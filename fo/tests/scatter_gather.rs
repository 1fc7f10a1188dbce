//! Scatter-gather behavior across an in-process cluster

use std::collections::BTreeSet;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use fanout::{FanoutError, GetMessagesOptions, Identity, Messenger, RequestEnvelope};
use procbus::{LocalCluster, LocalInstance, ProcessManager};
use serde_json::{Value, json};

/// Start an instance and serve its inbox
fn spawn_node(cluster: &LocalCluster, name: &str) -> Messenger {
    let instance = cluster.spawn(name);
    let messenger = node_messenger(&instance, name);
    messenger.serve(instance.inbox);
    messenger
}

fn node_messenger(instance: &LocalInstance, name: &str) -> Messenger {
    Messenger::with_timeout(
        Identity::managed(instance.id(), name),
        instance.client.clone(),
        Duration::from_millis(1000),
    )
}

fn short(ms: u64) -> GetMessagesOptions {
    GetMessagesOptions::new().with_timeout(Duration::from_millis(ms))
}

#[tokio::test]
async fn test_ping_pong_across_two_instances() {
    let cluster = LocalCluster::new();
    let a = spawn_node(&cluster, "svc");
    let b = spawn_node(&cluster, "svc");
    a.on_message_sync("ping", |_| Ok(json!("pong"))).unwrap();
    b.on_message_sync("ping", |_| Ok(json!("pong"))).unwrap();
    a.connect().await.unwrap();

    let results = a.get_messages("ping", Value::Null).await.unwrap();
    assert_eq!(results, vec![json!("pong"), json!("pong")]);

    let metrics = a.metrics();
    assert_eq!(metrics.pending_requests, 0);
    assert_eq!(metrics.requests_completed, 1);
    assert_eq!(metrics.replies_applied, 1);
}

#[tokio::test]
async fn test_self_result_comes_first() {
    let cluster = LocalCluster::new();
    let a = spawn_node(&cluster, "svc");
    let b = spawn_node(&cluster, "svc");
    let c = spawn_node(&cluster, "svc");
    for (messenger, label) in [(&a, "a"), (&b, "b"), (&c, "c")] {
        messenger.on_message_sync("who", move |_| Ok(json!(label))).unwrap();
    }
    a.connect().await.unwrap();

    let results = a.get_messages("who", Value::Null).await.unwrap();
    assert_eq!(results.len(), 3);
    assert_eq!(results[0], json!("a"));
    let remote: BTreeSet<_> = results[1..].iter().filter_map(Value::as_str).collect();
    assert_eq!(remote, BTreeSet::from(["b", "c"]));
}

#[tokio::test]
async fn test_concurrent_calls_do_not_cross_talk() {
    let cluster = LocalCluster::new();
    let nodes: Vec<Messenger> = (0..3).map(|_| spawn_node(&cluster, "svc")).collect();
    for (id, node) in nodes.iter().enumerate() {
        node.on_message("echo", move |payload| async move {
            tokio::time::sleep(Duration::from_millis(5)).await;
            Ok(json!({"from": id, "echo": payload}))
        })
        .unwrap();
    }
    let caller = &nodes[0];
    caller.connect().await.unwrap();

    let calls = (0..10).map(|i| caller.get_messages("echo", json!(i)));
    let outcomes = futures::future::join_all(calls).await;

    for (i, outcome) in outcomes.into_iter().enumerate() {
        let results = outcome.unwrap();
        assert_eq!(results.len(), 3);
        assert!(results.iter().all(|r| r["echo"] == json!(i)), "call {} got {:?}", i, results);
    }
    assert_eq!(caller.metrics().pending_requests, 0);
    assert_eq!(caller.metrics().requests_completed, 10);
}

#[tokio::test]
async fn test_silent_instance_times_out_and_cleans_up() {
    let cluster = LocalCluster::new();
    let a = spawn_node(&cluster, "svc");
    let _b = spawn_node(&cluster, "svc");
    a.on_message_sync("ping", |_| Ok(json!("pong"))).unwrap();
    a.connect().await.unwrap();

    let started = std::time::Instant::now();
    let err = a.get_messages_with("ping", Value::Null, short(50)).await.unwrap_err();

    assert!(err.is_timeout());
    assert!(matches!(
        err,
        FanoutError::Timeout {
            timeout_ms: 50,
            outstanding: 1,
            ..
        }
    ));
    assert!(started.elapsed() >= Duration::from_millis(50));

    let metrics = a.metrics();
    assert_eq!(metrics.pending_requests, 0);
    assert_eq!(metrics.requests_timed_out, 1);
}

#[tokio::test]
async fn test_late_reply_is_dropped() {
    let cluster = LocalCluster::new();
    let a = spawn_node(&cluster, "svc");
    let b = spawn_node(&cluster, "svc");
    a.on_message_sync("slow", |_| Ok(json!("a"))).unwrap();
    b.on_message("slow", |_| async {
        tokio::time::sleep(Duration::from_millis(150)).await;
        Ok(json!("b"))
    })
    .unwrap();
    a.connect().await.unwrap();

    let err = a.get_messages_with("slow", Value::Null, short(30)).await.unwrap_err();
    assert!(err.is_timeout());

    tokio::time::sleep(Duration::from_millis(300)).await;
    let metrics = a.metrics();
    assert_eq!(metrics.pending_requests, 0);
    assert_eq!(metrics.replies_applied, 0);
    assert_eq!(metrics.replies_dropped, 1);
}

#[tokio::test]
async fn test_not_connected_fails_immediately() {
    let cluster = LocalCluster::new();
    let a = spawn_node(&cluster, "svc");
    a.on_message_sync("ping", |_| Ok(json!("pong"))).unwrap();

    let started = std::time::Instant::now();
    let err = a
        .get_messages_with("ping", Value::Null, short(5_000))
        .await
        .unwrap_err();
    assert!(matches!(err, FanoutError::NotConnected));
    assert!(started.elapsed() < Duration::from_secs(1));
    assert_eq!(a.metrics().requests_started, 0);
}

#[tokio::test]
async fn test_last_registration_wins() {
    let cluster = LocalCluster::new();
    let a = spawn_node(&cluster, "svc");
    let b = spawn_node(&cluster, "svc");
    for node in [&a, &b] {
        node.on_message_sync("version", |_| Ok(json!(1))).unwrap();
        node.on_message_sync("version", |_| Ok(json!(2))).unwrap();
    }
    a.connect().await.unwrap();

    let results = a.get_messages("version", Value::Null).await.unwrap();
    assert_eq!(results, vec![json!(2), json!(2)]);
}

#[tokio::test]
async fn test_failing_remote_handler_surfaces_as_timeout() {
    let cluster = LocalCluster::new();
    let a = spawn_node(&cluster, "svc");
    let b = spawn_node(&cluster, "svc");
    a.on_message_sync("work", |_| Ok(json!("done"))).unwrap();
    b.on_message_sync("work", |_| Err("disk full".into())).unwrap();
    a.connect().await.unwrap();

    let err = a.get_messages_with("work", Value::Null, short(100)).await.unwrap_err();
    assert!(matches!(err, FanoutError::Timeout { outstanding: 1, .. }));
}

#[tokio::test]
async fn test_failing_local_handler_fails_call() {
    let cluster = LocalCluster::new();
    let a = spawn_node(&cluster, "svc");
    a.on_message_sync("work", |_| Err("disk full".into())).unwrap();
    a.connect().await.unwrap();

    let err = a.get_messages("work", Value::Null).await.unwrap_err();
    match err {
        FanoutError::Handler { topic, source } => {
            assert_eq!(topic, "work");
            assert_eq!(source.to_string(), "disk full");
        }
        other => panic!("unexpected error: {:?}", other),
    }
}

#[tokio::test]
async fn test_missing_self_handler_sends_nothing() {
    let cluster = LocalCluster::new();
    let a = spawn_node(&cluster, "svc");
    let b = spawn_node(&cluster, "svc");
    let hits = Arc::new(AtomicUsize::new(0));
    let counter = hits.clone();
    b.on_message_sync("ping", move |_| {
        counter.fetch_add(1, Ordering::SeqCst);
        Ok(json!("pong"))
    })
    .unwrap();
    a.connect().await.unwrap();

    let err = a.get_messages("ping", Value::Null).await.unwrap_err();
    assert!(matches!(err, FanoutError::HandlerNotFound(ref topic) if topic == "ping"));

    tokio::time::sleep(Duration::from_millis(50)).await;
    assert_eq!(hits.load(Ordering::SeqCst), 0);
    let metrics = a.metrics();
    assert_eq!(metrics.requests_started, 0);
    assert_eq!(metrics.replies_dropped, 0);
}

#[tokio::test]
async fn test_delivery_failure_fails_fast() {
    let cluster = LocalCluster::new();
    let a = spawn_node(&cluster, "svc");
    let b = spawn_node(&cluster, "svc");
    a.on_message_sync("ping", |_| Ok(json!("pong"))).unwrap();
    b.on_message_sync("ping", |_| Ok(json!("pong"))).unwrap();
    a.connect().await.unwrap();
    assert!(cluster.stop(1));

    let started = std::time::Instant::now();
    let err = a
        .get_messages_with("ping", Value::Null, short(5_000))
        .await
        .unwrap_err();
    assert!(matches!(err, FanoutError::Delivery { instance_id: 1, .. }));
    assert!(started.elapsed() < Duration::from_secs(1));
    assert_eq!(a.metrics().pending_requests, 0);
}

#[tokio::test]
async fn test_discovery_failure() {
    let cluster = LocalCluster::new();
    let a = spawn_node(&cluster, "svc");
    a.on_message_sync("ping", |_| Ok(json!("pong"))).unwrap();
    a.connect().await.unwrap();
    cluster.set_reachable(false);

    let err = a.get_messages("ping", Value::Null).await.unwrap_err();
    assert!(matches!(err, FanoutError::Discovery(_)));
}

#[tokio::test]
async fn test_connect_failure_leaves_disconnected() {
    let cluster = LocalCluster::new();
    let a = spawn_node(&cluster, "svc");
    cluster.set_reachable(false);

    let err = a.connect().await.unwrap_err();
    assert!(matches!(err, FanoutError::Connection(_)));
    assert!(!a.is_connected());

    cluster.set_reachable(true);
    a.connect().await.unwrap();
    assert!(a.is_connected());
}

#[tokio::test]
async fn test_duplicate_reply_is_dropped() {
    let cluster = LocalCluster::new();
    let a = spawn_node(&cluster, "svc");
    let mut b = cluster.spawn("svc");
    let mut c = cluster.spawn("svc");
    a.on_message_sync("who", |_| Ok(json!("a"))).unwrap();
    a.connect().await.unwrap();

    async fn answer(instance: &mut LocalInstance, message: Value, times: usize) {
        let packet = instance.inbox.recv().await.unwrap();
        let request = RequestEnvelope::from_packet(packet).unwrap();
        let reply = request.reply(Some(instance.id()), message).to_packet().unwrap();
        for _ in 0..times {
            instance.client.send_to_parent(reply.clone()).await.unwrap();
        }
    }

    let responders = async {
        answer(&mut b, json!("b"), 2).await;
        answer(&mut c, json!("c"), 1).await;
    };
    let (results, ()) = tokio::join!(a.get_messages("who", Value::Null), responders);

    assert_eq!(results.unwrap(), vec![json!("a"), json!("b"), json!("c")]);
    let metrics = a.metrics();
    assert_eq!(metrics.replies_applied, 2);
    assert_eq!(metrics.replies_dropped, 1);
}

#[tokio::test]
async fn test_connect_is_idempotent() {
    let cluster = LocalCluster::new();
    let a = spawn_node(&cluster, "svc");

    a.connect().await.unwrap();
    a.connect().await.unwrap();
    assert_eq!(cluster.subscriber_count("process:0"), 1);

    a.disconnect().await.unwrap();
    assert!(!a.is_connected());
    assert_eq!(cluster.subscriber_count("process:0"), 0);

    a.connect().await.unwrap();
    assert_eq!(cluster.subscriber_count("process:0"), 1);
}

#[tokio::test]
async fn test_disconnect_mid_call_times_out() {
    let cluster = LocalCluster::new();
    let a = spawn_node(&cluster, "svc");
    let b = spawn_node(&cluster, "svc");
    a.on_message_sync("slow", |_| Ok(json!("a"))).unwrap();
    b.on_message("slow", |_| async {
        tokio::time::sleep(Duration::from_millis(50)).await;
        Ok(json!("b"))
    })
    .unwrap();
    a.connect().await.unwrap();

    let disconnect = async {
        tokio::time::sleep(Duration::from_millis(10)).await;
        a.disconnect().await.unwrap();
    };
    let (outcome, ()) = tokio::join!(a.get_messages_with("slow", Value::Null, short(200)), disconnect);

    assert!(matches!(outcome, Err(FanoutError::Timeout { outstanding: 1, .. })));
    assert_eq!(a.metrics().pending_requests, 0);
}

#[tokio::test]
async fn test_unmanaged_caller_includes_self_on_request() {
    let cluster = LocalCluster::new();
    let b = spawn_node(&cluster, "svc");
    let c = spawn_node(&cluster, "svc");
    b.on_message_sync("who", |_| Ok(json!("b"))).unwrap();
    c.on_message_sync("who", |_| Ok(json!("c"))).unwrap();

    let caller = Messenger::with_timeout(
        Identity::unmanaged(Some("svc".to_string())),
        Arc::new(cluster.client()),
        Duration::from_millis(1000),
    );
    caller.on_message_sync("who", |_| Ok(json!("me"))).unwrap();
    caller.connect().await.unwrap();
    assert_eq!(cluster.subscriber_count("process:unmanaged"), 1);

    let remote_only = caller.get_messages("who", Value::Null).await.unwrap();
    let remote_only: BTreeSet<_> = remote_only.iter().filter_map(Value::as_str).map(String::from).collect();
    assert_eq!(remote_only, BTreeSet::from(["b".to_string(), "c".to_string()]));

    let with_self = caller
        .get_messages_with("who", Value::Null, GetMessagesOptions::new().include_self_if_unmanaged(true))
        .await
        .unwrap();
    assert_eq!(with_self.len(), 3);
    assert_eq!(with_self[0], json!("me"));
}

#[tokio::test]
async fn test_custom_filter_selects_targets() {
    let cluster = LocalCluster::new();
    let api = spawn_node(&cluster, "api");
    let api2 = spawn_node(&cluster, "api");
    let worker = spawn_node(&cluster, "worker");
    for (node, label) in [(&api, "api-0"), (&api2, "api-1"), (&worker, "worker-2")] {
        node.on_message_sync("who", move |_| Ok(json!(label))).unwrap();
    }
    api.connect().await.unwrap();

    let same_name = api.get_messages("who", Value::Null).await.unwrap();
    assert_eq!(same_name.len(), 2);

    let everyone = api
        .get_messages_with("who", Value::Null, GetMessagesOptions::new().all_instances())
        .await
        .unwrap();
    assert_eq!(everyone.len(), 3);

    let workers = api
        .get_messages_with("who", Value::Null, GetMessagesOptions::new().with_filter(|p| p.name == "worker"))
        .await
        .unwrap();
    assert_eq!(workers, vec![json!("worker-2")]);
}

#[tokio::test]
async fn test_typed_results() {
    #[derive(serde::Deserialize, Debug, PartialEq)]
    struct Load {
        instance: u32,
        queued: u64,
    }

    let cluster = LocalCluster::new();
    let a = spawn_node(&cluster, "svc");
    let b = spawn_node(&cluster, "svc");
    a.on_message_sync("load", |_| Ok(json!({"instance": 0, "queued": 3}))).unwrap();
    b.on_message_sync("load", |_| Ok(json!({"instance": 1, "queued": 7}))).unwrap();
    a.connect().await.unwrap();

    let loads: Vec<Load> = a
        .get_messages_as("load", Value::Null, GetMessagesOptions::new())
        .await
        .unwrap();
    assert_eq!(loads.iter().map(|l| l.queued).sum::<u64>(), 10);
    assert_eq!(loads[0], Load { instance: 0, queued: 3 });
}
