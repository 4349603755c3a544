use crate::LinkError;
use crate::protocol::{LinkMessage, LinkMessageKind};
use futures_util::{SinkExt, StreamExt};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::{broadcast, mpsc};
use tokio::task::JoinHandle;
use tokio_tungstenite::tungstenite::Message;
use tracing::{debug, info, warn};

pub const DEFAULT_RECONNECT_DELAY: Duration = Duration::from_secs(5);
const DEFAULT_EVENT_CAPACITY: usize = 256;

#[derive(Clone, Debug, PartialEq)]
pub struct LinkConfig {
    pub url: String,
    pub role: String,
    pub reconnect_delay: Duration,
    pub event_capacity: usize,
}

impl Default for LinkConfig {
    fn default() -> Self {
        Self {
            url: "ws://127.0.0.1:8765".to_string(),
            role: "server".to_string(),
            reconnect_delay: DEFAULT_RECONNECT_DELAY,
            event_capacity: DEFAULT_EVENT_CAPACITY,
        }
    }
}

pub trait ConnectionObserver: Send + Sync {
    fn on_status(&self, connected: bool);
}

impl<F> ConnectionObserver for F
where
    F: Fn(bool) + Send + Sync,
{
    fn on_status(&self, connected: bool) {
        self(connected);
    }
}

pub type SharedConnectionObserver = Arc<dyn ConnectionObserver>;

/// Persistent duplex connection to the remote execution agent.
///
/// Reconnects after a fixed delay forever. Inbound messages other than
/// liveness probes are republished on a bounded broadcast bus and on every
/// unbounded kind feed opened with [`TransportLink::subscribe_kinds`].
#[derive(Clone)]
pub struct TransportLink {
    inner: Arc<LinkInner>,
}

struct LinkInner {
    config: LinkConfig,
    outbound: Mutex<Option<mpsc::UnboundedSender<LinkMessage>>>,
    status: Mutex<StatusState>,
    events: broadcast::Sender<LinkMessage>,
    feeds: Mutex<Vec<KindFeed>>,
    task: Mutex<Option<JoinHandle<()>>>,
}

struct KindFeed {
    kinds: Vec<LinkMessageKind>,
    sender: mpsc::UnboundedSender<LinkMessage>,
}

#[derive(Default)]
struct StatusState {
    connected: bool,
    observers: Vec<SharedConnectionObserver>,
}

impl TransportLink {
    pub fn new(config: LinkConfig) -> Self {
        let (events, _) = broadcast::channel(config.event_capacity.max(1));
        Self {
            inner: Arc::new(LinkInner {
                config,
                outbound: Mutex::new(None),
                status: Mutex::new(StatusState::default()),
                events,
                feeds: Mutex::new(Vec::new()),
                task: Mutex::new(None),
            }),
        }
    }

    pub fn config(&self) -> &LinkConfig {
        &self.inner.config
    }

    /// Starts the connection loop. Calling it while the loop runs is a no-op.
    pub fn connect(&self) {
        let Ok(mut task) = self.inner.task.lock() else {
            warn!("link task mutex poisoned; connect ignored");
            return;
        };
        if task.as_ref().is_some_and(|handle| !handle.is_finished()) {
            return;
        }
        let inner = self.inner.clone();
        *task = Some(tokio::spawn(run_connection_loop(inner)));
    }

    /// Stops the connection loop and drops the current connection.
    pub fn shutdown(&self) {
        let handle = match self.inner.task.lock() {
            Ok(mut task) => task.take(),
            Err(_) => None,
        };
        if let Some(handle) = handle {
            handle.abort();
        }
        self.inner.mark_disconnected();
    }

    /// Queues a message for the peer. Returns false when the link is not open.
    pub fn send(&self, message: LinkMessage) -> bool {
        let Ok(outbound) = self.inner.outbound.lock() else {
            return false;
        };
        match outbound.as_ref() {
            Some(sender) if self.is_connected() => sender.send(message).is_ok(),
            _ => false,
        }
    }

    pub fn is_connected(&self) -> bool {
        self.inner
            .status
            .lock()
            .map(|status| status.connected)
            .unwrap_or(false)
    }

    /// Registers a status observer. It is invoked immediately with the current
    /// status and again on every connected/disconnected transition.
    pub fn on_status(&self, observer: SharedConnectionObserver) {
        let current = match self.inner.status.lock() {
            Ok(mut status) => {
                status.observers.push(observer.clone());
                status.connected
            }
            Err(_) => {
                warn!("link status mutex poisoned; observer not registered");
                return;
            }
        };
        observer.on_status(current);
    }

    /// Raw receiver over every republished inbound message. Bounded by
    /// `event_capacity`; a slow reader sees `Lagged` and loses messages.
    pub fn subscribe(&self) -> broadcast::Receiver<LinkMessage> {
        self.inner.events.subscribe()
    }

    /// Unbounded feed of the given message kinds. Nothing is dropped for a
    /// slow reader, so completion bookkeeping reads from here.
    pub fn subscribe_kinds(&self, kinds: &[LinkMessageKind]) -> LinkSubscription {
        let (sender, receiver) = mpsc::unbounded_channel();
        match self.inner.feeds.lock() {
            Ok(mut feeds) => feeds.push(KindFeed {
                kinds: kinds.to_vec(),
                sender,
            }),
            Err(_) => warn!("link feed mutex poisoned; subscription will stay empty"),
        }
        LinkSubscription { receiver }
    }
}

pub struct LinkSubscription {
    receiver: mpsc::UnboundedReceiver<LinkMessage>,
}

impl LinkSubscription {
    /// Next matching message, or `None` once the link is gone.
    pub async fn recv(&mut self) -> Option<LinkMessage> {
        self.receiver.recv().await
    }
}

impl LinkInner {
    fn set_connected(&self, connected: bool) {
        let observers = match self.status.lock() {
            Ok(mut status) => {
                if status.connected == connected {
                    return;
                }
                status.connected = connected;
                status.observers.clone()
            }
            Err(_) => return,
        };
        for observer in observers {
            observer.on_status(connected);
        }
    }

    fn attach_outbound(&self, sender: mpsc::UnboundedSender<LinkMessage>) {
        if let Ok(mut outbound) = self.outbound.lock() {
            *outbound = Some(sender);
        }
        self.set_connected(true);
    }

    fn mark_disconnected(&self) {
        if let Ok(mut outbound) = self.outbound.lock() {
            *outbound = None;
        }
        self.set_connected(false);
    }

    /// Classifies one inbound text frame; returns a direct reply if one is due.
    fn handle_frame(&self, text: &str) -> Option<LinkMessage> {
        let message = match serde_json::from_str::<LinkMessage>(text) {
            Ok(message) => message,
            Err(error) => {
                debug!(%error, "dropping unparseable link frame");
                return None;
            }
        };
        match message {
            LinkMessage::Ping => Some(LinkMessage::Pong),
            LinkMessage::Pong => None,
            other => {
                if let LinkMessage::Ready { role } = &other {
                    info!(role = role.as_deref().unwrap_or("unknown"), "remote peer ready");
                }
                self.publish(other);
                None
            }
        }
    }

    fn publish(&self, message: LinkMessage) {
        let kind = message.kind();
        if let Ok(mut feeds) = self.feeds.lock() {
            feeds.retain(|feed| {
                if feed.kinds.contains(&kind) {
                    feed.sender.send(message.clone()).is_ok()
                } else {
                    !feed.sender.is_closed()
                }
            });
        }
        // An error only means nobody is subscribed right now.
        let _ = self.events.send(message);
    }
}

async fn run_connection_loop(inner: Arc<LinkInner>) {
    loop {
        match tokio_tungstenite::connect_async(inner.config.url.as_str()).await {
            Ok((stream, _response)) => {
                info!(url = %inner.config.url, "link connected");
                match serve_connection(&inner, stream).await {
                    Ok(()) => info!("link closed by peer"),
                    Err(error) => warn!(%error, "link connection failed"),
                }
            }
            Err(error) => {
                warn!(url = %inner.config.url, %error, "link connect failed");
            }
        }
        inner.mark_disconnected();
        debug!(
            delay_ms = inner.config.reconnect_delay.as_millis() as u64,
            "scheduling link reconnect"
        );
        tokio::time::sleep(inner.config.reconnect_delay).await;
    }
}

async fn serve_connection<S>(
    inner: &LinkInner,
    stream: tokio_tungstenite::WebSocketStream<S>,
) -> Result<(), LinkError>
where
    S: tokio::io::AsyncRead + tokio::io::AsyncWrite + Unpin,
{
    let (mut sink, mut frames) = stream.split();

    let hello = LinkMessage::Hello {
        role: inner.config.role.clone(),
    };
    sink.send(Message::Text(serde_json::to_string(&hello)?.into()))
        .await
        .map_err(|error| LinkError::Protocol(error.to_string()))?;

    let (sender, mut outbound) = mpsc::unbounded_channel();
    inner.attach_outbound(sender);

    loop {
        tokio::select! {
            frame = frames.next() => {
                let reply = match frame {
                    None => return Ok(()),
                    Some(Err(error)) => return Err(LinkError::Protocol(error.to_string())),
                    Some(Ok(Message::Text(text))) => inner.handle_frame(text.as_str()),
                    Some(Ok(Message::Close(_))) => return Ok(()),
                    Some(Ok(_)) => None,
                };
                if let Some(reply) = reply {
                    sink.send(Message::Text(serde_json::to_string(&reply)?.into()))
                        .await
                        .map_err(|error| LinkError::Protocol(error.to_string()))?;
                }
            }
            message = outbound.recv() => {
                let Some(message) = message else {
                    return Ok(());
                };
                sink.send(Message::Text(serde_json::to_string(&message)?.into()))
                    .await
                    .map_err(|error| LinkError::Protocol(error.to_string()))?;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::sync::Mutex as StdMutex;

    #[test]
    fn ping_frame_is_answered_and_not_republished() {
        let link = TransportLink::new(LinkConfig::default());
        let mut receiver = link.subscribe();

        let reply = link.inner.handle_frame(r#"{"type":"ping"}"#);
        assert_eq!(reply, Some(LinkMessage::Pong));
        assert!(receiver.try_recv().is_err());
    }

    #[test]
    fn task_frames_are_republished_on_the_bus() {
        let link = TransportLink::new(LinkConfig::default());
        let mut receiver = link.subscribe();

        let frame = json!({ "type": "task_result", "taskId": "t-1", "result": "done" });
        assert_eq!(link.inner.handle_frame(&frame.to_string()), None);

        let message = receiver.try_recv().expect("message should be republished");
        assert_eq!(message.kind(), LinkMessageKind::TaskResult);
        assert_eq!(message.task_id(), Some("t-1"));
    }

    #[tokio::test(flavor = "current_thread")]
    async fn kind_feed_outlasts_a_burst_the_bus_cannot_hold() {
        let link = TransportLink::new(LinkConfig {
            event_capacity: 1,
            ..LinkConfig::default()
        });
        let mut bus = link.subscribe();
        let mut feed =
            link.subscribe_kinds(&[LinkMessageKind::AgentEvent, LinkMessageKind::TaskResult]);
        let mut other = link.subscribe_kinds(&[LinkMessageKind::TaskError]);

        let event = json!({
            "type": "agent_event",
            "taskId": "t-1",
            "event": { "actor": "navigator", "state": "step.ok", "data": {} }
        });
        for _ in 0..20 {
            link.inner.handle_frame(&event.to_string());
        }
        let result = json!({ "type": "task_result", "taskId": "t-1", "result": "done" });
        link.inner.handle_frame(&result.to_string());

        assert!(matches!(
            bus.try_recv(),
            Err(broadcast::error::TryRecvError::Lagged(_))
        ));
        for _ in 0..20 {
            let message = feed.recv().await.expect("agent event");
            assert_eq!(message.kind(), LinkMessageKind::AgentEvent);
        }
        let message = feed.recv().await.expect("task result");
        assert_eq!(message.kind(), LinkMessageKind::TaskResult);
        assert!(other.receiver.try_recv().is_err());
    }

    #[test]
    fn dropped_feeds_are_pruned() {
        let link = TransportLink::new(LinkConfig::default());
        drop(link.subscribe_kinds(&[LinkMessageKind::AgentEvent]));
        let _kept = link.subscribe_kinds(&[LinkMessageKind::TaskResult]);

        link.inner.handle_frame(r#"{"type":"ready"}"#);
        assert_eq!(link.inner.feeds.lock().expect("feeds").len(), 1);
    }

    #[test]
    fn garbage_frames_are_dropped() {
        let link = TransportLink::new(LinkConfig::default());
        let mut receiver = link.subscribe();
        assert_eq!(link.inner.handle_frame("not json"), None);
        assert_eq!(link.inner.handle_frame(r#"{"type":"mystery"}"#), None);
        assert!(receiver.try_recv().is_err());
    }

    #[test]
    fn send_without_connection_returns_false() {
        let link = TransportLink::new(LinkConfig::default());
        assert!(!link.send(LinkMessage::Ping));
    }

    #[test]
    fn observer_receives_current_status_then_each_transition() {
        let link = TransportLink::new(LinkConfig::default());
        let seen = Arc::new(StdMutex::new(Vec::new()));
        let sink = seen.clone();
        link.on_status(Arc::new(move |connected: bool| {
            sink.lock().expect("mutex").push(connected);
        }));

        let (sender, _receiver) = mpsc::unbounded_channel();
        link.inner.attach_outbound(sender);
        link.inner.attach_outbound(mpsc::unbounded_channel().0);
        link.inner.mark_disconnected();

        assert_eq!(*seen.lock().expect("mutex"), vec![false, true, false]);
    }
}
