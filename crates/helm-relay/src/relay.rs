//! One upstream RFB session shared by any number of viewers.
//!
//! The upstream connection is opened when the first viewer joins and torn
//! down when the last one leaves. Faults are reported to viewers and are not
//! retried until a viewer asks with `connectRequest`.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use async_trait::async_trait;
use base64::Engine;
use base64::engine::general_purpose::STANDARD;
use serde::{Deserialize, Serialize};
use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt, WriteHalf};
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::RelayError;
use crate::control::{ControlArbiter, ControlDecision};
use crate::protocol::{ViewerCommand, ViewerEvent, ViewerId, to_absolute};
use crate::rfb::{self, ClientMessage, PixelFormat, Rect, RectPayload, ServerMessage};

pub const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(10);

/// Where a relay kind's desktop lives.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct RelayTarget {
    pub kind: String,
    pub host: String,
    pub port: u16,
    #[serde(default)]
    pub password: Option<String>,
}

pub trait UpstreamStream: AsyncRead + AsyncWrite + Unpin + Send {}

impl<T> UpstreamStream for T where T: AsyncRead + AsyncWrite + Unpin + Send {}

pub type BoxedUpstream = Box<dyn UpstreamStream>;

#[async_trait]
pub trait UpstreamConnector: Send + Sync {
    async fn connect(&self, target: &RelayTarget) -> Result<BoxedUpstream, RelayError>;
}

#[derive(Clone, Debug)]
pub struct TcpConnector {
    timeout: Duration,
}

impl Default for TcpConnector {
    fn default() -> Self {
        Self {
            timeout: DEFAULT_CONNECT_TIMEOUT,
        }
    }
}

impl TcpConnector {
    pub fn new(timeout: Duration) -> Self {
        Self { timeout }
    }
}

#[async_trait]
impl UpstreamConnector for TcpConnector {
    async fn connect(&self, target: &RelayTarget) -> Result<BoxedUpstream, RelayError> {
        let address = format!("{}:{}", target.host, target.port);
        let stream = tokio::time::timeout(self.timeout, TcpStream::connect(&address))
            .await
            .map_err(|_| RelayError::ConnectTimeout(self.timeout.as_millis() as u64))??;
        stream.set_nodelay(true)?;
        Ok(Box::new(stream))
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum UpstreamState {
    Disconnected,
    Connecting,
    Connected,
}

/// Events for one joined viewer. Closed when the viewer is detached.
pub struct ViewerHandle {
    pub id: ViewerId,
    pub events: mpsc::UnboundedReceiver<ViewerEvent>,
}

struct RelaySession {
    generation: u64,
    upstream: UpstreamState,
    width: u16,
    height: u16,
    pixel_format: Option<PixelFormat>,
    viewers: HashMap<ViewerId, mpsc::UnboundedSender<ViewerEvent>>,
    arbiter: ControlArbiter,
    button_mask: u8,
    outbound: Option<mpsc::UnboundedSender<ClientMessage>>,
    tasks: Vec<JoinHandle<()>>,
}

impl RelaySession {
    fn new() -> Self {
        Self {
            generation: 0,
            upstream: UpstreamState::Disconnected,
            width: 0,
            height: 0,
            pixel_format: None,
            viewers: HashMap::new(),
            arbiter: ControlArbiter::new(),
            button_mask: 0,
            outbound: None,
            tasks: Vec::new(),
        }
    }

    /// Sends to every viewer; returns the ones whose channel has closed.
    fn broadcast(&self, event: &ViewerEvent) -> Vec<ViewerId> {
        self.viewers
            .iter()
            .filter(|(_, sender)| sender.send(event.clone()).is_err())
            .map(|(viewer, _)| *viewer)
            .collect()
    }

    fn send_to(&self, viewer: ViewerId, event: ViewerEvent) {
        if let Some(sender) = self.viewers.get(&viewer) {
            let _ = sender.send(event);
        }
    }

    fn status_event(&self) -> ViewerEvent {
        match self.upstream {
            UpstreamState::Connected => ViewerEvent::connected(self.width, self.height),
            _ => ViewerEvent::disconnected(None),
        }
    }

    fn control_event_for(&self, viewer: ViewerId) -> ViewerEvent {
        ViewerEvent::ControlStatus {
            has_control: self.arbiter.has_control(viewer),
            viewer_id: self.arbiter.controller(),
        }
    }

    fn broadcast_control(&mut self) -> Vec<ViewerId> {
        self.button_mask = 0;
        self.viewers
            .iter()
            .filter(|(viewer, sender)| sender.send(self.control_event_for(**viewer)).is_err())
            .map(|(viewer, _)| *viewer)
            .collect()
    }

    fn forward(&self, message: ClientMessage) {
        if self.upstream != UpstreamState::Connected {
            return;
        }
        if let Some(outbound) = self.outbound.as_ref() {
            let _ = outbound.send(message);
        }
    }

    fn stop_upstream(&mut self) {
        self.upstream = UpstreamState::Disconnected;
        self.outbound = None;
        self.pixel_format = None;
        for task in self.tasks.drain(..) {
            task.abort();
        }
    }
}

#[derive(Default)]
struct HubState {
    session: Option<RelaySession>,
    next_viewer: ViewerId,
    next_generation: u64,
}

struct HubInner {
    target: RelayTarget,
    connector: Arc<dyn UpstreamConnector>,
    state: Mutex<HubState>,
}

/// Relay for one kind of desktop.
#[derive(Clone)]
pub struct RelayHub {
    inner: Arc<HubInner>,
}

impl RelayHub {
    pub fn new(target: RelayTarget, connector: Arc<dyn UpstreamConnector>) -> Self {
        Self {
            inner: Arc::new(HubInner {
                target,
                connector,
                state: Mutex::new(HubState::default()),
            }),
        }
    }

    pub fn target(&self) -> &RelayTarget {
        &self.inner.target
    }

    pub fn viewer_count(&self) -> usize {
        self.lock()
            .ok()
            .and_then(|state| state.session.as_ref().map(|session| session.viewers.len()))
            .unwrap_or(0)
    }

    pub fn upstream_state(&self) -> UpstreamState {
        self.lock()
            .ok()
            .and_then(|state| state.session.as_ref().map(|session| session.upstream))
            .unwrap_or(UpstreamState::Disconnected)
    }

    pub fn controller(&self) -> Option<ViewerId> {
        let state = self.lock().ok()?;
        state.session.as_ref()?.arbiter.controller()
    }

    /// Attaches a viewer; the first one opens the upstream connection.
    pub fn join(&self) -> Result<ViewerHandle, RelayError> {
        let (sender, events) = mpsc::unbounded_channel();
        let mut state = self.lock()?;
        state.next_viewer += 1;
        let id = state.next_viewer;
        let session = state.session.get_or_insert_with(RelaySession::new);
        session.viewers.insert(id, sender);
        session.send_to(id, session.status_event());
        session.send_to(id, session.control_event_for(id));
        let start = session.upstream == UpstreamState::Disconnected && session.viewers.len() == 1;
        let viewers = session.viewers.len();
        info!(kind = %self.inner.target.kind, viewer = id, viewers, "viewer joined");
        if start {
            self.start_upstream(&mut state);
        }
        Ok(ViewerHandle { id, events })
    }

    /// Detaches a viewer; the last one closes the upstream connection.
    /// Leaving twice is a no-op.
    pub fn leave(&self, viewer: ViewerId) {
        let Ok(mut state) = self.lock() else {
            return;
        };
        self.detach(&mut state, vec![viewer]);
    }

    /// Removes viewers that left or whose event channel closed. Control held
    /// by a removed viewer is released, and an empty session is torn down.
    fn detach(&self, state: &mut HubState, mut viewers: Vec<ViewerId>) {
        let Some(session) = state.session.as_mut() else {
            return;
        };
        let mut removed = false;
        while let Some(viewer) = viewers.pop() {
            if session.viewers.remove(&viewer).is_none() {
                continue;
            }
            removed = true;
            let remaining = session.viewers.len();
            info!(kind = %self.inner.target.kind, viewer, viewers = remaining, "viewer left");
            if session.arbiter.viewer_disconnected(viewer) {
                viewers.extend(session.broadcast_control());
            }
        }
        if removed && session.viewers.is_empty() {
            session.stop_upstream();
            state.session = None;
            info!(kind = %self.inner.target.kind, "last viewer left; relay closed");
        }
    }

    pub fn handle_command(&self, viewer: ViewerId, command: ViewerCommand) {
        if matches!(command, ViewerCommand::DisconnectRequest) {
            self.leave(viewer);
            return;
        }
        let Ok(mut state) = self.lock() else {
            return;
        };
        let Some(session) = state.session.as_mut() else {
            return;
        };
        if !session.viewers.contains_key(&viewer) {
            return;
        }

        match command {
            ViewerCommand::ConnectRequest => match session.upstream {
                UpstreamState::Disconnected => self.start_upstream(&mut state),
                UpstreamState::Connecting => {}
                UpstreamState::Connected => session.send_to(viewer, session.status_event()),
            },
            ViewerCommand::DisconnectRequest => {}
            ViewerCommand::TakeControl => match session.arbiter.request_control(viewer) {
                ControlDecision::Granted => {
                    info!(kind = %self.inner.target.kind, viewer, "control granted");
                    let closed = session.broadcast_control();
                    self.detach(&mut state, closed);
                }
                ControlDecision::AlreadyHeld => {
                    session.send_to(viewer, session.control_event_for(viewer));
                }
                ControlDecision::Denied { holder } => {
                    debug!(viewer, holder, "control denied");
                    session.send_to(
                        viewer,
                        ViewerEvent::ControlDenied {
                            viewer_id: Some(holder),
                        },
                    );
                }
            },
            ViewerCommand::ReleaseControl => {
                if session.arbiter.release_control(viewer) {
                    let closed = session.broadcast_control();
                    self.detach(&mut state, closed);
                }
            }
            ViewerCommand::PointerMove {
                relative_x,
                relative_y,
            } => {
                if !session.arbiter.has_control(viewer) {
                    return;
                }
                let message = ClientMessage::PointerEvent {
                    button_mask: session.button_mask,
                    x: to_absolute(relative_x, session.width),
                    y: to_absolute(relative_y, session.height),
                };
                session.forward(message);
            }
            ViewerCommand::PointerButton {
                relative_x,
                relative_y,
                button_mask,
                is_down,
            } => {
                if !session.arbiter.has_control(viewer) {
                    return;
                }
                if is_down {
                    session.button_mask |= button_mask;
                } else {
                    session.button_mask &= !button_mask;
                }
                let message = ClientMessage::PointerEvent {
                    button_mask: session.button_mask,
                    x: to_absolute(relative_x, session.width),
                    y: to_absolute(relative_y, session.height),
                };
                session.forward(message);
            }
            ViewerCommand::KeyEvent { keysym, is_down } => {
                if !session.arbiter.has_control(viewer) {
                    return;
                }
                session.forward(ClientMessage::KeyEvent {
                    down: is_down,
                    key: keysym,
                });
            }
        }
    }

    fn start_upstream(&self, state: &mut HubState) {
        state.next_generation += 1;
        let generation = state.next_generation;
        let Some(session) = state.session.as_mut() else {
            return;
        };
        session.stop_upstream();
        session.generation = generation;
        session.upstream = UpstreamState::Connecting;
        info!(
            kind = %self.inner.target.kind,
            host = %self.inner.target.host,
            port = self.inner.target.port,
            "connecting upstream"
        );
        let hub = self.clone();
        session
            .tasks
            .push(tokio::spawn(async move { hub.run_upstream(generation).await }));
    }

    async fn run_upstream(self, generation: u64) {
        let connection = match self.open_upstream().await {
            Ok(connection) => connection,
            Err(error) => {
                self.upstream_failed(generation, &error);
                return;
            }
        };
        let pixel_format = connection.pixel_format;
        let (mut reader, writer) = tokio::io::split(connection.stream);
        let (outbound, outbound_rx) = mpsc::unbounded_channel();

        {
            let Ok(mut state) = self.lock() else {
                return;
            };
            let Some(session) = state.session.as_mut() else {
                return;
            };
            if session.generation != generation {
                return;
            }
            session.upstream = UpstreamState::Connected;
            session.width = connection.init.width;
            session.height = connection.init.height;
            session.pixel_format = Some(pixel_format);
            session.outbound = Some(outbound);
            let hub = self.clone();
            session.tasks.push(tokio::spawn(async move {
                hub.run_writer(generation, writer, outbound_rx).await
            }));
            info!(
                kind = %self.inner.target.kind,
                width = session.width,
                height = session.height,
                "upstream connected"
            );
            let closed = session.broadcast(&session.status_event());
            self.detach(&mut state, closed);
            if state.session.is_none() {
                return;
            }
        }

        loop {
            match rfb::read_server_message(&mut reader, &pixel_format).await {
                Ok(message) => {
                    if !self.handle_server_message(generation, message, &pixel_format) {
                        return;
                    }
                }
                Err(error) => {
                    self.upstream_failed(generation, &error);
                    return;
                }
            }
        }
    }

    async fn open_upstream(&self) -> Result<rfb::RfbConnection<BoxedUpstream>, RelayError> {
        let stream = self.inner.connector.connect(&self.inner.target).await?;
        rfb::connect(stream, self.inner.target.password.as_deref()).await
    }

    async fn run_writer(
        self,
        generation: u64,
        mut writer: WriteHalf<BoxedUpstream>,
        mut outbound: mpsc::UnboundedReceiver<ClientMessage>,
    ) {
        while let Some(message) = outbound.recv().await {
            let written = match rfb::write_message(&mut writer, &message).await {
                Ok(()) => writer.flush().await.map_err(RelayError::from),
                Err(error) => Err(error),
            };
            if let Err(error) = written {
                self.upstream_failed(generation, &error);
                return;
            }
        }
    }

    /// Fans one upstream message out. Returns false once the session is gone.
    fn handle_server_message(
        &self,
        generation: u64,
        message: ServerMessage,
        pixel_format: &PixelFormat,
    ) -> bool {
        let Ok(mut state) = self.lock() else {
            return false;
        };
        let Some(session) = state.session.as_mut() else {
            return false;
        };
        if session.generation != generation {
            return false;
        }
        let ServerMessage::FramebufferUpdate(rects) = message else {
            return true;
        };
        let mut closed = Vec::new();
        for rect in rects {
            match rect_event(rect, pixel_format) {
                RectEvent::Viewer(event) => closed.extend(session.broadcast(&event)),
                RectEvent::Resize { width, height } => {
                    info!(kind = %self.inner.target.kind, width, height, "desktop resized");
                    session.width = width;
                    session.height = height;
                    closed.extend(session.broadcast(&session.status_event()));
                }
            }
        }
        self.detach(&mut state, closed);
        let Some(session) = state.session.as_mut() else {
            return false;
        };
        let request = ClientMessage::FramebufferUpdateRequest {
            incremental: true,
            x: 0,
            y: 0,
            width: session.width,
            height: session.height,
        };
        session.forward(request);
        true
    }

    fn upstream_failed(&self, generation: u64, error: &RelayError) {
        let Ok(mut state) = self.lock() else {
            return;
        };
        let Some(session) = state.session.as_mut() else {
            return;
        };
        if session.generation != generation || session.upstream == UpstreamState::Disconnected {
            return;
        }
        warn!(kind = %self.inner.target.kind, error = %error, "upstream failed");
        session.stop_upstream();
        let closed = session.broadcast(&ViewerEvent::disconnected(Some(error.to_string())));
        self.detach(&mut state, closed);
    }

    fn lock(&self) -> Result<MutexGuard<'_, HubState>, RelayError> {
        self.inner
            .state
            .lock()
            .map_err(|_| RelayError::State("relay state poisoned".to_string()))
    }
}

enum RectEvent {
    Viewer(ViewerEvent),
    Resize { width: u16, height: u16 },
}

fn rect_event(rect: Rect, pixel_format: &PixelFormat) -> RectEvent {
    match rect.payload {
        RectPayload::Raw(pixels) => RectEvent::Viewer(ViewerEvent::Frame {
            x: rect.x,
            y: rect.y,
            width: rect.width,
            height: rect.height,
            encoding: "raw".to_string(),
            bpp: pixel_format.bits_per_pixel,
            pixel_format: *pixel_format,
            data: STANDARD.encode(pixels),
        }),
        RectPayload::CopyRect { src_x, src_y } => RectEvent::Viewer(ViewerEvent::CopyRect {
            x: rect.x,
            y: rect.y,
            width: rect.width,
            height: rect.height,
            src_x,
            src_y,
        }),
        RectPayload::DesktopSize => RectEvent::Resize {
            width: rect.width,
            height: rect.height,
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn raw_rect_becomes_base64_frame() {
        let event = rect_event(
            Rect {
                x: 1,
                y: 2,
                width: 1,
                height: 1,
                payload: RectPayload::Raw(vec![0xff, 0, 0, 0]),
            },
            &PixelFormat::rgb888(),
        );
        let RectEvent::Viewer(ViewerEvent::Frame {
            encoding, bpp, data, ..
        }) = event
        else {
            panic!("expected frame event");
        };
        assert_eq!(encoding, "raw");
        assert_eq!(bpp, 32);
        assert_eq!(data, "/wAAAA==");
    }

    #[test]
    fn desktop_size_rect_is_a_resize() {
        let event = rect_event(
            Rect {
                x: 0,
                y: 0,
                width: 1280,
                height: 720,
                payload: RectPayload::DesktopSize,
            },
            &PixelFormat::rgb888(),
        );
        assert!(matches!(
            event,
            RectEvent::Resize {
                width: 1280,
                height: 720
            }
        ));
    }
}
