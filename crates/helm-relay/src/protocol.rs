use serde::{Deserialize, Serialize};

use crate::rfb::PixelFormat;

pub type ViewerId = u64;

/// Server to viewer, serialized as `{"event": ..., "data": {...}}`.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "event", content = "data", rename_all = "camelCase")]
pub enum ViewerEvent {
    #[serde(rename_all = "camelCase")]
    Status {
        connected: bool,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        width: Option<u16>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        height: Option<u16>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        error: Option<String>,
    },
    #[serde(rename_all = "camelCase")]
    Frame {
        x: u16,
        y: u16,
        width: u16,
        height: u16,
        encoding: String,
        bpp: u8,
        pixel_format: PixelFormat,
        /// Base64 pixel data.
        data: String,
    },
    #[serde(rename_all = "camelCase")]
    CopyRect {
        x: u16,
        y: u16,
        width: u16,
        height: u16,
        src_x: u16,
        src_y: u16,
    },
    #[serde(rename_all = "camelCase")]
    ControlStatus {
        has_control: bool,
        viewer_id: Option<ViewerId>,
    },
    #[serde(rename_all = "camelCase")]
    ControlDenied { viewer_id: Option<ViewerId> },
}

impl ViewerEvent {
    pub fn connected(width: u16, height: u16) -> Self {
        ViewerEvent::Status {
            connected: true,
            width: Some(width),
            height: Some(height),
            error: None,
        }
    }

    pub fn disconnected(error: Option<String>) -> Self {
        ViewerEvent::Status {
            connected: false,
            width: None,
            height: None,
            error,
        }
    }
}

/// Viewer to server.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "event", content = "data", rename_all = "camelCase")]
pub enum ViewerCommand {
    ConnectRequest,
    DisconnectRequest,
    #[serde(rename_all = "camelCase")]
    PointerMove { relative_x: f64, relative_y: f64 },
    #[serde(rename_all = "camelCase")]
    PointerButton {
        relative_x: f64,
        relative_y: f64,
        button_mask: u8,
        is_down: bool,
    },
    #[serde(rename_all = "camelCase")]
    KeyEvent { keysym: u32, is_down: bool },
    TakeControl,
    ReleaseControl,
}

/// Maps a relative coordinate onto `0..dimension`.
pub fn to_absolute(relative: f64, dimension: u16) -> u16 {
    if dimension == 0 {
        return 0;
    }
    let relative = if relative.is_nan() {
        0.0
    } else {
        relative.clamp(0.0, 1.0)
    };
    let absolute = (relative * f64::from(dimension)).round() as u32;
    absolute.min(u32::from(dimension) - 1) as u16
}
