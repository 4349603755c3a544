use byteorder::{BigEndian, ByteOrder};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tracing::{debug, info};

use super::auth::{CHALLENGE_LEN, vnc_auth_response};
use super::codec::{
    ClientMessage, ENCODING_COPY_RECT, ENCODING_DESKTOP_SIZE, ENCODING_RAW, MAX_TEXT_BYTES,
    MSG_BELL, MSG_FRAMEBUFFER_UPDATE, MSG_SERVER_CUT_TEXT, MSG_SET_COLOUR_MAP_ENTRIES,
    PixelFormat, ProtocolVersion, RECT_HEADER_LEN, RectHeader, SECURITY_INVALID, SECURITY_NONE,
    SECURITY_VNC, SERVER_INIT_HEADER_LEN, ServerInit, decode_server_init_header,
};
use crate::RelayError;

/// Encodings advertised to the server, in preference order.
pub const SUPPORTED_ENCODINGS: [i32; 3] = [ENCODING_COPY_RECT, ENCODING_RAW, ENCODING_DESKTOP_SIZE];

/// An upstream session that finished the handshake and initial setup.
pub struct RfbConnection<S> {
    pub stream: S,
    pub version: ProtocolVersion,
    pub init: ServerInit,
    /// Format frames will arrive in; differs from `init` when true colour had
    /// to be requested.
    pub pixel_format: PixelFormat,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum RectPayload {
    Raw(Vec<u8>),
    CopyRect { src_x: u16, src_y: u16 },
    DesktopSize,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Rect {
    pub x: u16,
    pub y: u16,
    pub width: u16,
    pub height: u16,
    pub payload: RectPayload,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum ServerMessage {
    FramebufferUpdate(Vec<Rect>),
    SetColourMapEntries,
    Bell,
    ServerCutText(String),
}

/// Runs the client side of the handshake, then sends the pixel format (when
/// needed), the supported encodings and a full update request.
pub async fn connect<S>(
    mut stream: S,
    password: Option<&str>,
) -> Result<RfbConnection<S>, RelayError>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let mut banner = [0u8; 12];
    stream.read_exact(&mut banner).await?;
    let version = ProtocolVersion::negotiate(&banner)?;
    stream.write_all(version.banner()).await?;
    debug!(?version, "rfb version negotiated");

    let security = match version {
        ProtocolVersion::V3_3 => {
            let chosen = stream.read_u32().await?;
            if chosen == u32::from(SECURITY_INVALID) {
                return Err(RelayError::AuthFailed(read_reason(&mut stream).await?));
            }
            u8::try_from(chosen)
                .map_err(|_| RelayError::protocol(format!("invalid security type {chosen}")))?
        }
        ProtocolVersion::V3_7 | ProtocolVersion::V3_8 => {
            let count = stream.read_u8().await?;
            if count == 0 {
                return Err(RelayError::AuthFailed(read_reason(&mut stream).await?));
            }
            let mut offered = vec![0u8; usize::from(count)];
            stream.read_exact(&mut offered).await?;
            let chosen = choose_security(&offered, password.is_some())?;
            stream.write_u8(chosen).await?;
            chosen
        }
    };

    match security {
        SECURITY_NONE => {
            if version == ProtocolVersion::V3_8 {
                read_security_result(&mut stream, version).await?;
            }
        }
        SECURITY_VNC => {
            let password = password.ok_or_else(|| {
                RelayError::AuthFailed(
                    "server requires a password and none is configured".to_string(),
                )
            })?;
            let mut challenge = [0u8; CHALLENGE_LEN];
            stream.read_exact(&mut challenge).await?;
            stream
                .write_all(&vnc_auth_response(password, &challenge))
                .await?;
            read_security_result(&mut stream, version).await?;
        }
        other => {
            return Err(RelayError::Unsupported(format!("security type {other}")));
        }
    }

    // Shared session so other clients of the same desktop stay connected.
    stream.write_u8(1).await?;

    let mut header = [0u8; SERVER_INIT_HEADER_LEN];
    stream.read_exact(&mut header).await?;
    let (width, height, server_format, name_len) = decode_server_init_header(&header)?;
    let name = read_text(&mut stream, name_len).await?;
    let init = ServerInit {
        width,
        height,
        pixel_format: server_format,
        name,
    };
    info!(width, height, name = %init.name, "rfb session initialised");

    let pixel_format = if server_format.true_colour {
        server_format
    } else {
        let requested = PixelFormat::rgb888();
        write_message(&mut stream, &ClientMessage::SetPixelFormat(requested)).await?;
        requested
    };
    write_message(
        &mut stream,
        &ClientMessage::SetEncodings(SUPPORTED_ENCODINGS.to_vec()),
    )
    .await?;
    write_message(
        &mut stream,
        &ClientMessage::FramebufferUpdateRequest {
            incremental: false,
            x: 0,
            y: 0,
            width,
            height,
        },
    )
    .await?;
    stream.flush().await?;

    Ok(RfbConnection {
        stream,
        version,
        init,
        pixel_format,
    })
}

fn choose_security(offered: &[u8], has_password: bool) -> Result<u8, RelayError> {
    if offered.contains(&SECURITY_NONE) {
        return Ok(SECURITY_NONE);
    }
    if offered.contains(&SECURITY_VNC) {
        if !has_password {
            return Err(RelayError::AuthFailed(
                "server requires a password and none is configured".to_string(),
            ));
        }
        return Ok(SECURITY_VNC);
    }
    Err(RelayError::Unsupported(format!(
        "none of the offered security types {offered:?}"
    )))
}

async fn read_security_result<S>(stream: &mut S, version: ProtocolVersion) -> Result<(), RelayError>
where
    S: AsyncRead + Unpin,
{
    let result = stream.read_u32().await?;
    if result == 0 {
        return Ok(());
    }
    let reason = if version == ProtocolVersion::V3_8 {
        read_reason(stream).await?
    } else {
        "authentication rejected".to_string()
    };
    Err(RelayError::AuthFailed(reason))
}

async fn read_reason<S>(stream: &mut S) -> Result<String, RelayError>
where
    S: AsyncRead + Unpin,
{
    let len = stream.read_u32().await?;
    read_text(stream, len).await
}

async fn read_text<S>(stream: &mut S, len: u32) -> Result<String, RelayError>
where
    S: AsyncRead + Unpin,
{
    if len > MAX_TEXT_BYTES {
        return Err(RelayError::protocol(format!(
            "text of {len} bytes exceeds maximum {MAX_TEXT_BYTES}"
        )));
    }
    let mut bytes = vec![0u8; len as usize];
    stream.read_exact(&mut bytes).await?;
    Ok(String::from_utf8_lossy(&bytes).into_owned())
}

pub async fn write_message<W>(writer: &mut W, message: &ClientMessage) -> Result<(), RelayError>
where
    W: AsyncWrite + Unpin,
{
    writer.write_all(&message.to_bytes()?).await?;
    Ok(())
}

/// Reads one server-to-client message.
pub async fn read_server_message<R>(
    reader: &mut R,
    pixel_format: &PixelFormat,
) -> Result<ServerMessage, RelayError>
where
    R: AsyncRead + Unpin,
{
    let message_type = reader.read_u8().await?;
    match message_type {
        MSG_FRAMEBUFFER_UPDATE => {
            let mut header = [0u8; 3];
            reader.read_exact(&mut header).await?;
            let count = BigEndian::read_u16(&header[1..3]);
            let mut rects = Vec::with_capacity(usize::from(count));
            for _ in 0..count {
                rects.push(read_rect(reader, pixel_format).await?);
            }
            Ok(ServerMessage::FramebufferUpdate(rects))
        }
        MSG_SET_COLOUR_MAP_ENTRIES => {
            let mut header = [0u8; 5];
            reader.read_exact(&mut header).await?;
            let count = BigEndian::read_u16(&header[3..5]);
            let mut entries = vec![0u8; usize::from(count) * 6];
            reader.read_exact(&mut entries).await?;
            Ok(ServerMessage::SetColourMapEntries)
        }
        MSG_BELL => Ok(ServerMessage::Bell),
        MSG_SERVER_CUT_TEXT => {
            let mut padding = [0u8; 3];
            reader.read_exact(&mut padding).await?;
            let len = reader.read_u32().await?;
            Ok(ServerMessage::ServerCutText(read_text(reader, len).await?))
        }
        other => Err(RelayError::protocol(format!(
            "unknown server message type {other}"
        ))),
    }
}

async fn read_rect<R>(reader: &mut R, pixel_format: &PixelFormat) -> Result<Rect, RelayError>
where
    R: AsyncRead + Unpin,
{
    let mut bytes = [0u8; RECT_HEADER_LEN];
    reader.read_exact(&mut bytes).await?;
    let header = RectHeader::decode(&bytes)?;
    let payload = match header.encoding {
        ENCODING_RAW => {
            let mut pixels = vec![0u8; header.raw_len(pixel_format)?];
            reader.read_exact(&mut pixels).await?;
            RectPayload::Raw(pixels)
        }
        ENCODING_COPY_RECT => RectPayload::CopyRect {
            src_x: reader.read_u16().await?,
            src_y: reader.read_u16().await?,
        },
        ENCODING_DESKTOP_SIZE => RectPayload::DesktopSize,
        other => {
            return Err(RelayError::Unsupported(format!(
                "rectangle encoding {other}"
            )));
        }
    };
    Ok(Rect {
        x: header.x,
        y: header.y,
        width: header.width,
        height: header.height,
        payload,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::duplex;

    fn server_init_bytes(width: u16, height: u16, format: PixelFormat, name: &str) -> Vec<u8> {
        let mut bytes = Vec::new();
        bytes.extend_from_slice(&width.to_be_bytes());
        bytes.extend_from_slice(&height.to_be_bytes());
        format.write_to(&mut bytes).expect("format should encode");
        bytes.extend_from_slice(&(name.len() as u32).to_be_bytes());
        bytes.extend_from_slice(name.as_bytes());
        bytes
    }

    #[tokio::test(flavor = "current_thread")]
    async fn connect_v3_8_without_auth_sends_setup_messages() {
        let (client, mut server) = duplex(4096);
        let fake = tokio::spawn(async move {
            server.write_all(b"RFB 003.008\n").await.expect("banner");
            let mut version = [0u8; 12];
            server.read_exact(&mut version).await.expect("client version");
            assert_eq!(&version, b"RFB 003.008\n");
            server.write_all(&[2, SECURITY_VNC, SECURITY_NONE]).await.expect("types");
            assert_eq!(server.read_u8().await.expect("chosen"), SECURITY_NONE);
            server.write_u32(0).await.expect("result");
            assert_eq!(server.read_u8().await.expect("shared"), 1);
            server
                .write_all(&server_init_bytes(800, 600, PixelFormat::rgb888(), "desk"))
                .await
                .expect("server init");

            let mut encodings = [0u8; 16];
            server.read_exact(&mut encodings).await.expect("encodings");
            assert_eq!(encodings[0], 2);
            assert_eq!(&encodings[2..4], &[0, 3]);
            let mut request = [0u8; 10];
            server.read_exact(&mut request).await.expect("update request");
            assert_eq!(request, [3, 0, 0, 0, 0, 0, 0x03, 0x20, 0x02, 0x58]);
        });

        let connection = connect(client, None).await.expect("handshake should succeed");
        fake.await.expect("fake server should finish");
        assert_eq!(connection.version, ProtocolVersion::V3_8);
        assert_eq!(connection.init.width, 800);
        assert_eq!(connection.init.name, "desk");
        assert_eq!(connection.pixel_format, PixelFormat::rgb888());
    }

    #[tokio::test(flavor = "current_thread")]
    async fn connect_v3_3_with_vnc_auth_and_palette_server() {
        let (client, mut server) = duplex(4096);
        let palette = PixelFormat {
            bits_per_pixel: 8,
            depth: 8,
            big_endian: false,
            true_colour: false,
            red_max: 0,
            green_max: 0,
            blue_max: 0,
            red_shift: 0,
            green_shift: 0,
            blue_shift: 0,
        };
        let fake = tokio::spawn(async move {
            server.write_all(b"RFB 003.003\n").await.expect("banner");
            let mut version = [0u8; 12];
            server.read_exact(&mut version).await.expect("client version");
            server.write_u32(u32::from(SECURITY_VNC)).await.expect("type");
            let challenge = [9u8; CHALLENGE_LEN];
            server.write_all(&challenge).await.expect("challenge");
            let mut response = [0u8; CHALLENGE_LEN];
            server.read_exact(&mut response).await.expect("response");
            assert_eq!(response, vnc_auth_response("hunter2", &challenge));
            server.write_u32(0).await.expect("result");
            server.read_u8().await.expect("shared");
            server
                .write_all(&server_init_bytes(640, 480, palette, ""))
                .await
                .expect("server init");

            let mut set_format = [0u8; 20];
            server.read_exact(&mut set_format).await.expect("set pixel format");
            assert_eq!(set_format[0], 0);
            assert_eq!(set_format[4], 32);
        });

        let connection = connect(client, Some("hunter2"))
            .await
            .expect("handshake should succeed");
        fake.await.expect("fake server should finish");
        assert_eq!(connection.version, ProtocolVersion::V3_3);
        assert_eq!(connection.pixel_format, PixelFormat::rgb888());
        assert!(!connection.init.pixel_format.true_colour);
    }

    #[tokio::test(flavor = "current_thread")]
    async fn connect_reports_rejected_password_reason() {
        let (client, mut server) = duplex(4096);
        tokio::spawn(async move {
            server.write_all(b"RFB 003.008\n").await.expect("banner");
            let mut version = [0u8; 12];
            server.read_exact(&mut version).await.expect("client version");
            server.write_all(&[1, SECURITY_VNC]).await.expect("types");
            server.read_u8().await.expect("chosen");
            server.write_all(&[0u8; CHALLENGE_LEN]).await.expect("challenge");
            let mut response = [0u8; CHALLENGE_LEN];
            server.read_exact(&mut response).await.expect("response");
            server.write_u32(1).await.expect("result");
            server.write_u32(14).await.expect("reason len");
            server.write_all(b"wrong password").await.expect("reason");
        });

        let error = connect(client, Some("nope"))
            .await
            .err()
            .expect("handshake should fail");
        assert!(matches!(error, RelayError::AuthFailed(reason) if reason == "wrong password"));
    }

    #[test]
    fn choose_security_prefers_none_and_needs_password_for_vnc() {
        assert_eq!(
            choose_security(&[SECURITY_VNC, SECURITY_NONE], false).expect("none"),
            SECURITY_NONE
        );
        assert_eq!(
            choose_security(&[SECURITY_VNC], true).expect("vnc"),
            SECURITY_VNC
        );
        assert!(matches!(
            choose_security(&[SECURITY_VNC], false),
            Err(RelayError::AuthFailed(_))
        ));
        assert!(matches!(
            choose_security(&[16, 19], true),
            Err(RelayError::Unsupported(_))
        ));
    }

    #[tokio::test(flavor = "current_thread")]
    async fn read_server_message_decodes_update_rectangles() {
        let mut bytes = vec![MSG_FRAMEBUFFER_UPDATE, 0, 0, 3];
        bytes.extend_from_slice(&[0, 1, 0, 2, 0, 2, 0, 1, 0, 0, 0, 0]);
        bytes.extend_from_slice(&[1, 2, 3, 4, 5, 6, 7, 8]);
        bytes.extend_from_slice(&[0, 10, 0, 20, 0, 4, 0, 4, 0, 0, 0, 1, 0, 30, 0, 40]);
        bytes.extend_from_slice(&[0, 0, 0, 0, 0x04, 0, 0x03, 0, 0xff, 0xff, 0xff, 0x21]);
        let mut reader = &bytes[..];

        let message = read_server_message(&mut reader, &PixelFormat::rgb888())
            .await
            .expect("update should decode");
        let ServerMessage::FramebufferUpdate(rects) = message else {
            panic!("expected framebuffer update");
        };
        assert_eq!(rects.len(), 3);
        assert_eq!(rects[0].payload, RectPayload::Raw(vec![1, 2, 3, 4, 5, 6, 7, 8]));
        assert_eq!(
            rects[1].payload,
            RectPayload::CopyRect {
                src_x: 30,
                src_y: 40
            }
        );
        assert_eq!(rects[2].payload, RectPayload::DesktopSize);
        assert_eq!((rects[2].width, rects[2].height), (1024, 768));
    }

    #[tokio::test(flavor = "current_thread")]
    async fn read_server_message_skips_colour_map_entries() {
        let mut bytes = vec![MSG_SET_COLOUR_MAP_ENTRIES, 0, 0, 0, 0x01, 0x02];
        bytes.extend(std::iter::repeat_n(0xab, 0x0102 * 6));
        bytes.push(MSG_BELL);
        let mut reader = &bytes[..];

        let message = read_server_message(&mut reader, &PixelFormat::rgb888())
            .await
            .expect("colour map should be consumed");
        assert!(matches!(message, ServerMessage::SetColourMapEntries));
        let message = read_server_message(&mut reader, &PixelFormat::rgb888())
            .await
            .expect("bell follows");
        assert!(matches!(message, ServerMessage::Bell));
        assert!(reader.is_empty());
    }
}
