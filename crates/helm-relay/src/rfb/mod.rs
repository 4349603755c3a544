//! Client side of the remote framebuffer protocol (RFB 3.3, 3.7 and 3.8).
//!
//! Byte layouts live in [`codec`]; [`client`] drives them over any async
//! stream.

pub mod auth;
pub mod client;
pub mod codec;

pub use auth::vnc_auth_response;
pub use client::{
    Rect, RectPayload, RfbConnection, SUPPORTED_ENCODINGS, ServerMessage, connect,
    read_server_message, write_message,
};
pub use codec::{ClientMessage, PixelFormat, ProtocolVersion, ServerInit};
