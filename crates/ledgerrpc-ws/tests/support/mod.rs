//! In-process ledger node speaking JSON-RPC over WebSocket.
//!
//! Replies to every batched request frame:
//! - `<kind>Subscribe` → next integer subscription id (unique across connections)
//! - `<kind>Unsubscribe` → `true`
//! - `echo [value, delay_ms]` → `value`, after `delay_ms`
//! - `hang` → never answered
//! - `fail` → error `-32000`
//! - anything with a scripted result → that result
//! - anything else → the method name
//!
//! [`MockNode::fail_next`] turns the next calls of a method into `-32000`
//! errors and [`MockNode::delay`] holds back every reply to a method.

#![allow(dead_code)]

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use futures::{SinkExt, StreamExt};
use serde_json::{json, Value};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::WebSocketStream;

enum Command {
    Push(String),
    Drop,
}

#[derive(Default)]
struct NodeState {
    requests: Mutex<Vec<Value>>,
    scripted: Mutex<HashMap<String, Value>>,
    failures: Mutex<HashMap<String, u32>>,
    delays: Mutex<HashMap<String, u64>>,
    current: Mutex<Option<mpsc::UnboundedSender<Command>>>,
    next_subscription: AtomicU64,
    connections: AtomicU64,
}

#[derive(Clone)]
pub struct MockNode {
    url: String,
    state: Arc<NodeState>,
}

impl MockNode {
    pub async fn start() -> Self {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let url = format!("ws://{}", listener.local_addr().unwrap());
        let state = Arc::new(NodeState::default());
        let accept_state = Arc::clone(&state);
        tokio::spawn(async move {
            while let Ok((tcp, _)) = listener.accept().await {
                let state = Arc::clone(&accept_state);
                tokio::spawn(async move {
                    if let Ok(ws) = tokio_tungstenite::accept_async(tcp).await {
                        serve(state, ws).await;
                    }
                });
            }
        });
        Self { url, state }
    }

    pub fn url(&self) -> &str {
        &self.url
    }

    pub fn connections(&self) -> u64 {
        self.state.connections.load(Ordering::SeqCst)
    }

    /// Answer every future `method` call with `result`.
    pub fn script(&self, method: &str, result: Value) {
        self.state
            .scripted
            .lock()
            .unwrap()
            .insert(method.to_string(), result);
    }

    /// Answer the next `times` calls of `method` with a server error.
    pub fn fail_next(&self, method: &str, times: u32) {
        self.state
            .failures
            .lock()
            .unwrap()
            .insert(method.to_string(), times);
    }

    /// Hold every reply to `method` back for `ms` milliseconds.
    pub fn delay(&self, method: &str, ms: u64) {
        self.state
            .delays
            .lock()
            .unwrap()
            .insert(method.to_string(), ms);
    }

    /// Every request received so far for `method`, in arrival order.
    pub fn requests_for(&self, method: &str) -> Vec<Value> {
        self.state
            .requests
            .lock()
            .unwrap()
            .iter()
            .filter(|r| r["method"] == method)
            .cloned()
            .collect()
    }

    /// Push a bare `<kind>Notification` frame on the current connection.
    pub fn notify(&self, kind: &str, subscription: u64, slot: u64, value: Value) {
        let frame = json!({
            "jsonrpc": "2.0",
            "method": format!("{kind}Notification"),
            "params": {
                "subscription": subscription,
                "result": { "context": { "slot": slot }, "value": value },
            },
        });
        self.command(Command::Push(frame.to_string()));
    }

    /// Push a raw text frame on the current connection.
    pub fn push_raw(&self, frame: &str) {
        self.command(Command::Push(frame.to_string()));
    }

    /// Close the current TCP connection without a close handshake.
    pub fn drop_connection(&self) {
        self.command(Command::Drop);
    }

    fn command(&self, cmd: Command) {
        if let Some(tx) = self.state.current.lock().unwrap().as_ref() {
            let _ = tx.send(cmd);
        }
    }
}

async fn serve(state: Arc<NodeState>, ws: WebSocketStream<TcpStream>) {
    let (mut sink, mut stream) = ws.split();
    let (tx, mut rx) = mpsc::unbounded_channel();
    *state.current.lock().unwrap() = Some(tx.clone());
    state.connections.fetch_add(1, Ordering::SeqCst);

    loop {
        tokio::select! {
            cmd = rx.recv() => match cmd {
                Some(Command::Push(frame)) => {
                    if sink.send(Message::Text(frame)).await.is_err() {
                        break;
                    }
                }
                Some(Command::Drop) | None => break,
            },
            msg = stream.next() => match msg {
                Some(Ok(Message::Text(text))) => {
                    let Ok(Value::Array(batch)) = serde_json::from_str::<Value>(&text) else {
                        continue;
                    };
                    for req in batch {
                        state.requests.lock().unwrap().push(req.clone());
                        reply(&state, &tx, req);
                    }
                }
                Some(Ok(Message::Close(_))) | Some(Err(_)) | None => break,
                Some(Ok(_)) => {}
            },
        }
    }
}

fn reply(state: &NodeState, tx: &mpsc::UnboundedSender<Command>, req: Value) {
    let id = req["id"].clone();
    let method = req["method"].as_str().unwrap_or_default().to_string();
    let ok = |result: Value| json!([{ "jsonrpc": "2.0", "id": id, "result": result }]).to_string();
    let error = || {
        json!([{
            "jsonrpc": "2.0",
            "id": id,
            "error": { "code": -32000, "message": "boom" },
        }])
        .to_string()
    };

    let forced_failure = match state.failures.lock().unwrap().get_mut(&method) {
        Some(left) if *left > 0 => {
            *left -= 1;
            true
        }
        _ => false,
    };

    let frame = if forced_failure {
        error()
    } else if let Some(result) = state.scripted.lock().unwrap().get(&method).cloned() {
        ok(result)
    } else if method.ends_with("Unsubscribe") {
        ok(json!(true))
    } else if method.ends_with("Subscribe") {
        ok(json!(state.next_subscription.fetch_add(1, Ordering::SeqCst) + 1))
    } else {
        match method.as_str() {
            "hang" => return,
            "fail" => error(),
            "echo" => {
                let frame = ok(req["params"][0].clone());
                let delay = req["params"][1].as_u64().unwrap_or(0);
                push_later(tx, frame, delay);
                return;
            }
            _ => ok(json!(method)),
        }
    };

    match state.delays.lock().unwrap().get(&method).copied() {
        Some(delay) => push_later(tx, frame, delay),
        None => {
            let _ = tx.send(Command::Push(frame));
        }
    }
}

fn push_later(tx: &mpsc::UnboundedSender<Command>, frame: String, delay_ms: u64) {
    let tx = tx.clone();
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(delay_ms)).await;
        let _ = tx.send(Command::Push(frame));
    });
}

/// Poll `check` until it holds, failing the test after five seconds.
pub async fn eventually(what: &str, check: impl Fn() -> bool) {
    let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
    while !check() {
        if tokio::time::Instant::now() > deadline {
            panic!("timed out waiting for: {what}");
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}
