use async_trait::async_trait;
use futures_util::{SinkExt, StreamExt};
use helm_link::{
    CompletionSynchronizer, DispatchRequest, DispatchResponse, LinkConfig, LinkError, LinkMessage,
    TaskDispatcher, TaskOutcome, TransportLink,
};
use serde_json::{Value, json};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio_tungstenite::WebSocketStream;
use tokio_tungstenite::tungstenite::Message;

const STEP_TIMEOUT: Duration = Duration::from_secs(5);

struct NoopDispatcher;

#[async_trait]
impl TaskDispatcher for NoopDispatcher {
    async fn dispatch(&self, _request: DispatchRequest) -> Result<DispatchResponse, LinkError> {
        Ok(DispatchResponse::default())
    }
}

async fn bind() -> (TcpListener, String) {
    let listener = TcpListener::bind("127.0.0.1:0")
        .await
        .expect("listener should bind");
    let addr = listener.local_addr().expect("local addr");
    (listener, format!("ws://{addr}"))
}

async fn accept(listener: &TcpListener) -> WebSocketStream<TcpStream> {
    let (stream, _) = tokio::time::timeout(STEP_TIMEOUT, listener.accept())
        .await
        .expect("client should connect in time")
        .expect("accept should succeed");
    tokio_tungstenite::accept_async(stream)
        .await
        .expect("websocket handshake should succeed")
}

async fn next_json(socket: &mut WebSocketStream<TcpStream>) -> Value {
    loop {
        let frame = tokio::time::timeout(STEP_TIMEOUT, socket.next())
            .await
            .expect("frame should arrive in time")
            .expect("socket should stay open")
            .expect("frame should be valid");
        if let Message::Text(text) = frame {
            return serde_json::from_str(text.as_str()).expect("frame should be json");
        }
    }
}

async fn send_json(socket: &mut WebSocketStream<TcpStream>, value: Value) {
    socket
        .send(Message::Text(value.to_string().into()))
        .await
        .expect("send should succeed");
}

fn link_for(url: String, delay: Duration) -> TransportLink {
    TransportLink::new(LinkConfig {
        url,
        role: "orchestrator".to_string(),
        reconnect_delay: delay,
        ..LinkConfig::default()
    })
}

#[tokio::test(flavor = "current_thread")]
async fn link_reconnects_after_fixed_delay_and_reports_transitions() {
    let (listener, url) = bind().await;
    let delay = Duration::from_millis(200);
    let link = link_for(url, delay);

    let (status_tx, mut status_rx) = mpsc::unbounded_channel();
    link.on_status(Arc::new(move |connected: bool| {
        let _ = status_tx.send(connected);
    }));
    link.connect();

    let mut first = accept(&listener).await;
    assert_eq!(next_json(&mut first).await, json!({ "type": "hello", "role": "orchestrator" }));
    first.close(None).await.expect("close should succeed");
    drop(first);
    let closed_at = Instant::now();

    let mut second = accept(&listener).await;
    assert!(closed_at.elapsed() >= delay, "reconnect must wait the fixed delay");
    assert_eq!(next_json(&mut second).await["type"], json!("hello"));

    let mut seen = Vec::new();
    while seen.len() < 4 {
        let status = tokio::time::timeout(STEP_TIMEOUT, status_rx.recv())
            .await
            .expect("status should arrive")
            .expect("status channel open");
        seen.push(status);
    }
    assert_eq!(seen, vec![false, true, false, true]);

    link.shutdown();
    assert!(!link.is_connected());
}

#[tokio::test(flavor = "current_thread")]
async fn link_answers_ping_and_feeds_completions() {
    let (listener, url) = bind().await;
    let link = link_for(url, Duration::from_millis(50));
    let synchronizer = CompletionSynchronizer::new(Arc::new(NoopDispatcher));
    let _completion_loop = synchronizer.attach(&link);
    link.connect();

    let mut peer = accept(&listener).await;
    assert_eq!(next_json(&mut peer).await["type"], json!("hello"));

    send_json(&mut peer, json!({ "type": "ping" })).await;
    assert_eq!(next_json(&mut peer).await, json!({ "type": "pong" }));

    let waiter = synchronizer
        .await_completion("t-42", Some(STEP_TIMEOUT))
        .expect("register");
    send_json(
        &mut peer,
        json!({
            "type": "agent_event",
            "taskId": "t-42",
            "event": {
                "actor": "planner",
                "state": "step.ok",
                "data": { "step": 2, "maxSteps": 4, "details": "Found 3 open issues" }
            }
        }),
    )
    .await;
    send_json(
        &mut peer,
        json!({
            "type": "agent_event",
            "taskId": "t-42",
            "event": { "actor": "system", "state": "task.ok", "data": {} }
        }),
    )
    .await;
    send_json(&mut peer, json!({ "type": "task_result", "taskId": "t-42", "result": "dup" })).await;

    let outcome = waiter.wait().await.expect("task should settle");
    assert_eq!(
        outcome,
        TaskOutcome::Completed {
            message: "Found 3 open issues".to_string()
        }
    );

    assert!(link.send(LinkMessage::Ping));
    assert_eq!(next_json(&mut peer).await, json!({ "type": "ping" }));
    link.shutdown();
}

#[tokio::test(flavor = "current_thread")]
async fn completion_survives_an_event_burst_larger_than_the_bus() {
    let (listener, url) = bind().await;
    let link = TransportLink::new(LinkConfig {
        url,
        event_capacity: 2,
        ..LinkConfig::default()
    });
    let synchronizer = CompletionSynchronizer::new(Arc::new(NoopDispatcher));
    let _completion_loop = synchronizer.attach(&link);
    link.connect();

    let mut peer = accept(&listener).await;
    assert_eq!(next_json(&mut peer).await["type"], json!("hello"));

    let waiter = synchronizer
        .await_completion("t-9", Some(STEP_TIMEOUT))
        .expect("register");
    for step in 0..64 {
        send_json(
            &mut peer,
            json!({
                "type": "agent_event",
                "taskId": "t-9",
                "event": {
                    "actor": "navigator",
                    "state": "step.ok",
                    "data": { "step": step, "maxSteps": 64 }
                }
            }),
        )
        .await;
    }
    send_json(&mut peer, json!({ "type": "task_result", "taskId": "t-9", "result": "done" })).await;

    let outcome = waiter.wait().await.expect("task should settle");
    assert_eq!(
        outcome,
        TaskOutcome::Completed {
            message: "done".to_string()
        }
    );
    link.shutdown();
}
