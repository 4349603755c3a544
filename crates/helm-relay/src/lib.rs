//! Fan-out relay for remote desktops spoken to over RFB.
//!
//! A [`RelayHub`] keeps one upstream RFB connection per desktop kind and
//! shares it with every attached viewer. Viewers talk JSON over a WebSocket
//! (see [`relay_router`]); only the viewer holding control may send input.

pub mod control;
pub mod errors;
pub mod protocol;
pub mod relay;
pub mod rfb;
pub mod server;

pub use control::{ControlArbiter, ControlDecision};
pub use errors::RelayError;
pub use protocol::{ViewerCommand, ViewerEvent, ViewerId, to_absolute};
pub use relay::{
    BoxedUpstream, DEFAULT_CONNECT_TIMEOUT, RelayHub, RelayTarget, TcpConnector,
    UpstreamConnector, UpstreamState, UpstreamStream, ViewerHandle,
};
pub use server::{RelayRegistry, relay_router};
