//! End-to-end behaviour of `WsSession` against an in-process node.

mod support;

use std::time::Duration;

use serde_json::json;
use tokio::time::timeout;

use ledgerrpc_core::{Commitment, RpcError, WsConfig};
use ledgerrpc_ws::{SubscriptionKey, SubscriptionState, WsSession};

use support::{eventually, MockNode};

fn fast_config() -> WsConfig {
    let mut config = WsConfig::default();
    config.reconnect.initial_backoff_ms = 10;
    config.reconnect.max_backoff_ms = 50;
    config.request_timeout_ms = 2_000;
    config
}

async fn connect(node: &MockNode) -> WsSession {
    WsSession::connect(node.url(), fast_config()).await.unwrap()
}

// ─── Correlation ──────────────────────────────────────────────────────────────

#[tokio::test]
async fn concurrent_requests_resolve_by_id_not_arrival_order() {
    let node = MockNode::start().await;
    let session = connect(&node).await;

    let (a, b, c) = tokio::join!(
        session.request("echo", vec![json!("a"), json!(80)]),
        session.request("echo", vec![json!("b"), json!(5)]),
        session.request("echo", vec![json!("c"), json!(40)]),
    );
    assert_eq!(a.unwrap(), json!("a"));
    assert_eq!(b.unwrap(), json!("b"));
    assert_eq!(c.unwrap(), json!("c"));
    assert_eq!(session.registry().pending_len(), 0);
}

#[tokio::test]
async fn server_error_object_is_surfaced() {
    let node = MockNode::start().await;
    let session = connect(&node).await;

    match session.request("fail", vec![]).await {
        Err(RpcError::Rpc(err)) => {
            assert_eq!(err.code, -32000);
            assert_eq!(err.message, "boom");
        }
        other => panic!("expected server error, got {other:?}"),
    }
}

#[tokio::test]
async fn in_flight_request_fails_when_socket_drops() {
    let node = MockNode::start().await;
    let session = connect(&node).await;

    let pending = {
        let session = session.clone();
        tokio::spawn(async move { session.request("hang", vec![]).await })
    };
    eventually("hang request reaches node", || !node.requests_for("hang").is_empty()).await;
    node.drop_connection();

    let result = timeout(Duration::from_secs(2), pending).await.unwrap().unwrap();
    assert!(matches!(result, Err(RpcError::ConnectionLost)));

    // The session recovers on its own.
    let slot = session.request("getSlot", vec![]).await.unwrap();
    assert_eq!(slot, json!("getSlot"));
    assert_eq!(node.connections(), 2);
}

#[tokio::test]
async fn rpc_client_runs_over_the_session() {
    let node = MockNode::start().await;
    node.script(
        "getBalance",
        json!({ "context": { "slot": 1 }, "value": 5_000 }),
    );
    let session = connect(&node).await;

    let client = session.client();
    assert_eq!(client.get_balance("Vote111").await.unwrap(), 5_000);
    let health: String = client.call("getHealth", vec![]).await.unwrap();
    assert_eq!(health, "getHealth");
}

// ─── Subscriptions ────────────────────────────────────────────────────────────

#[tokio::test]
async fn subscription_survives_unclean_drop_with_new_id() {
    let node = MockNode::start().await;
    let session = connect(&node).await;
    let key = SubscriptionKey::account("Vote111", Commitment::Confirmed);

    let mut sub = session.subscribe(key.clone()).await.unwrap();
    assert_eq!(sub.state(), SubscriptionState::Active);
    assert_eq!(sub.subscription_id(), Some(1));

    node.notify("account", 1, 10, json!({ "lamports": 1 }));
    let first = timeout(Duration::from_secs(2), sub.next()).await.unwrap().unwrap();
    assert_eq!(first.slot(), 10);
    assert_eq!(first.value, json!({ "lamports": 1 }));

    node.drop_connection();
    eventually("resubscribed with a new id", || sub.subscription_id() == Some(2)).await;
    assert_eq!(sub.state(), SubscriptionState::Active);

    let subscribes = node.requests_for("accountSubscribe");
    assert_eq!(subscribes.len(), 2);
    assert_eq!(subscribes[0]["params"], subscribes[1]["params"]);
    assert_ne!(subscribes[0]["id"], subscribes[1]["id"]);

    // The stale id is dead; only the new one reaches the same handle.
    node.notify("account", 1, 11, json!({ "lamports": 2 }));
    node.notify("account", 2, 12, json!({ "lamports": 3 }));
    let next = timeout(Duration::from_secs(2), sub.next()).await.unwrap().unwrap();
    assert_eq!(next.slot(), 12);
}

#[tokio::test]
async fn handles_on_one_key_share_one_server_subscription() {
    let node = MockNode::start().await;
    let session = connect(&node).await;
    let key = SubscriptionKey::signature("SIG1", Commitment::Processed);

    let mut a = session.subscribe(key.clone()).await.unwrap();
    let mut b = session.subscribe(key.clone()).await.unwrap();
    assert_eq!(node.requests_for("signatureSubscribe").len(), 1);
    assert_eq!(session.subscriptions().len(), 1);

    node.notify("signature", 1, 7, json!({ "err": null }));
    assert_eq!(timeout(Duration::from_secs(2), a.next()).await.unwrap().unwrap().slot(), 7);
    assert_eq!(timeout(Duration::from_secs(2), b.next()).await.unwrap().unwrap().slot(), 7);

    assert!(a.unsubscribe().await.unwrap());
    assert!(node.requests_for("signatureUnsubscribe").is_empty());

    assert!(b.unsubscribe().await.unwrap());
    let unsubscribes = node.requests_for("signatureUnsubscribe");
    assert_eq!(unsubscribes.len(), 1);
    assert_eq!(unsubscribes[0]["params"], json!([1]));
    assert!(session.subscriptions().is_empty());
}

#[tokio::test]
async fn shared_key_resubscribes_once_and_both_handles_keep_receiving() {
    let node = MockNode::start().await;
    let session = connect(&node).await;
    let key = SubscriptionKey::signature("SIG1", Commitment::Confirmed);

    let mut a = session.subscribe(key.clone()).await.unwrap();
    let mut b = session.subscribe(key.clone()).await.unwrap();
    assert_eq!(a.subscription_id(), Some(1));

    node.drop_connection();
    eventually("shared key resubscribed", || a.subscription_id() == Some(2)).await;
    assert_eq!(b.subscription_id(), Some(2));
    assert_eq!(b.state(), SubscriptionState::Active);

    tokio::time::sleep(Duration::from_millis(100)).await;
    assert_eq!(node.requests_for("signatureSubscribe").len(), 2);
    assert_eq!(session.subscriptions().len(), 1);

    node.notify("signature", 2, 9, json!({ "err": null }));
    assert_eq!(timeout(Duration::from_secs(2), a.next()).await.unwrap().unwrap().slot(), 9);
    assert_eq!(timeout(Duration::from_secs(2), b.next()).await.unwrap().unwrap().slot(), 9);
}

#[tokio::test]
async fn handle_attached_to_a_failed_subscribe_is_retried() {
    let node = MockNode::start().await;
    let session = connect(&node).await;
    let key = SubscriptionKey::account("Vote111", Commitment::Confirmed);
    node.delay("accountSubscribe", 100);
    node.fail_next("accountSubscribe", 1);

    let first = {
        let session = session.clone();
        let key = key.clone();
        tokio::spawn(async move { session.subscribe(key).await })
    };
    eventually("first subscribe reaches the node", || {
        node.requests_for("accountSubscribe").len() == 1
    })
    .await;
    let mut second = session.subscribe(key.clone()).await.unwrap();
    assert_eq!(second.state(), SubscriptionState::Pending);

    let first = timeout(Duration::from_secs(2), first).await.unwrap().unwrap();
    assert!(matches!(first, Err(RpcError::Rpc(_))));

    eventually("remaining handle activated", || second.state() == SubscriptionState::Active).await;
    assert_eq!(node.requests_for("accountSubscribe").len(), 2);
    assert_eq!(second.subscription_id(), Some(1));

    node.notify("account", 1, 5, json!({ "lamports": 5 }));
    let got = timeout(Duration::from_secs(2), second.next()).await.unwrap().unwrap();
    assert_eq!(got.slot(), 5);
}

#[tokio::test]
async fn failed_resubscribe_after_reconnect_is_retried() {
    let node = MockNode::start().await;
    let session = connect(&node).await;
    let mut sub = session
        .subscribe(SubscriptionKey::account("Vote111", Commitment::Confirmed))
        .await
        .unwrap();
    assert_eq!(sub.subscription_id(), Some(1));

    node.fail_next("accountSubscribe", 2);
    node.drop_connection();
    eventually("resubscribed after two failures", || sub.subscription_id() == Some(2)).await;
    assert_eq!(sub.state(), SubscriptionState::Active);
    assert_eq!(node.requests_for("accountSubscribe").len(), 4);

    node.notify("account", 2, 8, json!({ "lamports": 8 }));
    let got = timeout(Duration::from_secs(2), sub.next()).await.unwrap().unwrap();
    assert_eq!(got.slot(), 8);
}

#[tokio::test]
async fn dropping_last_handle_unsubscribes_in_background() {
    let node = MockNode::start().await;
    let session = connect(&node).await;

    let sub = session
        .subscribe(SubscriptionKey::logs("Prog1", Commitment::Finalized))
        .await
        .unwrap();
    assert_eq!(
        node.requests_for("logsSubscribe")[0]["params"],
        json!([{ "mentions": ["Prog1"] }, { "commitment": "finalized" }])
    );
    drop(sub);

    eventually("logsUnsubscribe sent", || node.requests_for("logsUnsubscribe").len() == 1).await;
    assert!(session.subscriptions().is_empty());
}

#[tokio::test]
async fn subscribing_before_first_connect_goes_out_on_open() {
    let node = MockNode::start().await;
    let session = WsSession::start(node.url(), fast_config());

    let sub = session
        .subscribe(SubscriptionKey::program("Prog1", Commitment::Confirmed))
        .await
        .unwrap();
    eventually("subscription activated", || sub.state() == SubscriptionState::Active).await;
    assert_eq!(node.requests_for("programSubscribe").len(), 1);
}

#[tokio::test]
async fn malformed_frames_do_not_disturb_the_session() {
    let node = MockNode::start().await;
    let session = connect(&node).await;
    let mut sub = session
        .subscribe(SubscriptionKey::account("A", Commitment::Confirmed))
        .await
        .unwrap();

    node.push_raw("{{ definitely not json");
    node.push_raw(r#"[{"jsonrpc":"2.0"}]"#);
    node.notify("account", 99, 1, json!(null));
    node.notify("account", 1, 2, json!({ "lamports": 0 }));

    let got = timeout(Duration::from_secs(2), sub.next()).await.unwrap().unwrap();
    assert_eq!(got.slot(), 2);
    assert_eq!(node.connections(), 1);
}

// ─── Lifecycle ────────────────────────────────────────────────────────────────

#[tokio::test]
async fn heartbeat_sends_uncorrelated_keepalive() {
    let node = MockNode::start().await;
    let mut config = fast_config();
    config.heartbeat_interval_ms = 30;
    let session = WsSession::connect(node.url(), config).await.unwrap();

    eventually("two keepalives", || node.requests_for("ping").len() >= 2).await;
    let ping = &node.requests_for("ping")[0];
    assert!(ping["params"].is_null());
    assert!(ping["id"].is_string());
    // Replies to keepalives are dropped, never left pending.
    assert_eq!(session.registry().pending_len(), 0);
}

#[tokio::test]
async fn disconnect_is_clean_and_ends_streams() {
    let node = MockNode::start().await;
    let session = connect(&node).await;
    let mut sub = session
        .subscribe(SubscriptionKey::account("A", Commitment::Confirmed))
        .await
        .unwrap();

    session.disconnect().await;
    assert_eq!(timeout(Duration::from_secs(1), sub.next()).await.unwrap(), None);
    assert_eq!(sub.state(), SubscriptionState::Cancelled);

    tokio::time::sleep(Duration::from_millis(100)).await;
    assert_eq!(node.connections(), 1);
    assert!(matches!(
        session.request("getSlot", vec![]).await,
        Err(RpcError::Closed)
    ));
}
