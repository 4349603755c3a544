use std::io::{Cursor, Read, Write};

use byteorder::{BigEndian, ReadBytesExt, WriteBytesExt};
use serde::{Deserialize, Serialize};

use crate::RelayError;

pub const ENCODING_RAW: i32 = 0;
pub const ENCODING_COPY_RECT: i32 = 1;
pub const ENCODING_DESKTOP_SIZE: i32 = -223;

pub const SECURITY_INVALID: u8 = 0;
pub const SECURITY_NONE: u8 = 1;
pub const SECURITY_VNC: u8 = 2;

pub const MSG_FRAMEBUFFER_UPDATE: u8 = 0;
pub const MSG_SET_COLOUR_MAP_ENTRIES: u8 = 1;
pub const MSG_BELL: u8 = 2;
pub const MSG_SERVER_CUT_TEXT: u8 = 3;

pub const MAX_RECT_BYTES: usize = 64 * 1024 * 1024; // 64 MiB
pub const MAX_TEXT_BYTES: u32 = 1024 * 1024;

pub const PIXEL_FORMAT_LEN: usize = 16;
pub const SERVER_INIT_HEADER_LEN: usize = 4 + PIXEL_FORMAT_LEN + 4;
pub const RECT_HEADER_LEN: usize = 12;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ProtocolVersion {
    V3_3,
    V3_7,
    V3_8,
}

impl ProtocolVersion {
    /// Highest version both sides speak, from the server's 12-byte banner.
    pub fn negotiate(banner: &[u8; 12]) -> Result<Self, RelayError> {
        let text = std::str::from_utf8(banner)
            .map_err(|_| RelayError::protocol("version banner is not ascii"))?;
        let Some(rest) = text.strip_prefix("RFB ").and_then(|rest| rest.strip_suffix('\n')) else {
            return Err(RelayError::protocol(format!("invalid version banner {text:?}")));
        };
        let (major, minor) = rest
            .split_once('.')
            .ok_or_else(|| RelayError::protocol(format!("invalid version banner {text:?}")))?;
        let major: u32 = major
            .parse()
            .map_err(|_| RelayError::protocol(format!("invalid major version {major:?}")))?;
        let minor: u32 = minor
            .parse()
            .map_err(|_| RelayError::protocol(format!("invalid minor version {minor:?}")))?;
        if major != 3 {
            return Err(RelayError::Unsupported(format!("rfb major version {major}")));
        }
        Ok(match minor {
            0..=6 => ProtocolVersion::V3_3,
            7 => ProtocolVersion::V3_7,
            _ => ProtocolVersion::V3_8,
        })
    }

    pub fn banner(&self) -> &'static [u8; 12] {
        match self {
            ProtocolVersion::V3_3 => b"RFB 003.003\n",
            ProtocolVersion::V3_7 => b"RFB 003.007\n",
            ProtocolVersion::V3_8 => b"RFB 003.008\n",
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PixelFormat {
    pub bits_per_pixel: u8,
    pub depth: u8,
    pub big_endian: bool,
    pub true_colour: bool,
    pub red_max: u16,
    pub green_max: u16,
    pub blue_max: u16,
    pub red_shift: u8,
    pub green_shift: u8,
    pub blue_shift: u8,
}

impl PixelFormat {
    /// 32 bpp little-endian true colour, 8 bits per channel.
    pub const fn rgb888() -> Self {
        Self {
            bits_per_pixel: 32,
            depth: 24,
            big_endian: false,
            true_colour: true,
            red_max: 255,
            green_max: 255,
            blue_max: 255,
            red_shift: 16,
            green_shift: 8,
            blue_shift: 0,
        }
    }

    pub fn bytes_per_pixel(&self) -> usize {
        usize::from(self.bits_per_pixel).div_ceil(8)
    }

    pub fn read_from<R: Read>(reader: &mut R) -> Result<Self, RelayError> {
        let format = Self {
            bits_per_pixel: reader.read_u8()?,
            depth: reader.read_u8()?,
            big_endian: reader.read_u8()? != 0,
            true_colour: reader.read_u8()? != 0,
            red_max: reader.read_u16::<BigEndian>()?,
            green_max: reader.read_u16::<BigEndian>()?,
            blue_max: reader.read_u16::<BigEndian>()?,
            red_shift: reader.read_u8()?,
            green_shift: reader.read_u8()?,
            blue_shift: reader.read_u8()?,
        };
        let mut padding = [0u8; 3];
        reader.read_exact(&mut padding)?;
        Ok(format)
    }

    pub fn write_to<W: Write>(&self, writer: &mut W) -> std::io::Result<()> {
        writer.write_u8(self.bits_per_pixel)?;
        writer.write_u8(self.depth)?;
        writer.write_u8(u8::from(self.big_endian))?;
        writer.write_u8(u8::from(self.true_colour))?;
        writer.write_u16::<BigEndian>(self.red_max)?;
        writer.write_u16::<BigEndian>(self.green_max)?;
        writer.write_u16::<BigEndian>(self.blue_max)?;
        writer.write_u8(self.red_shift)?;
        writer.write_u8(self.green_shift)?;
        writer.write_u8(self.blue_shift)?;
        writer.write_all(&[0u8; 3])
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ServerInit {
    pub width: u16,
    pub height: u16,
    pub pixel_format: PixelFormat,
    pub name: String,
}

/// Fixed part of ServerInit; the name follows with the returned length.
pub fn decode_server_init_header(
    bytes: &[u8; SERVER_INIT_HEADER_LEN],
) -> Result<(u16, u16, PixelFormat, u32), RelayError> {
    let mut cursor = Cursor::new(&bytes[..]);
    let width = cursor.read_u16::<BigEndian>()?;
    let height = cursor.read_u16::<BigEndian>()?;
    let pixel_format = PixelFormat::read_from(&mut cursor)?;
    let name_len = cursor.read_u32::<BigEndian>()?;
    Ok((width, height, pixel_format, name_len))
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct RectHeader {
    pub x: u16,
    pub y: u16,
    pub width: u16,
    pub height: u16,
    pub encoding: i32,
}

impl RectHeader {
    pub fn decode(bytes: &[u8; RECT_HEADER_LEN]) -> Result<Self, RelayError> {
        let mut cursor = Cursor::new(&bytes[..]);
        Ok(Self {
            x: cursor.read_u16::<BigEndian>()?,
            y: cursor.read_u16::<BigEndian>()?,
            width: cursor.read_u16::<BigEndian>()?,
            height: cursor.read_u16::<BigEndian>()?,
            encoding: cursor.read_i32::<BigEndian>()?,
        })
    }

    pub fn raw_len(&self, format: &PixelFormat) -> Result<usize, RelayError> {
        let len = usize::from(self.width) * usize::from(self.height) * format.bytes_per_pixel();
        if len > MAX_RECT_BYTES {
            return Err(RelayError::protocol(format!(
                "raw rectangle of {len} bytes exceeds maximum {MAX_RECT_BYTES}"
            )));
        }
        Ok(len)
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum ClientMessage {
    SetPixelFormat(PixelFormat),
    SetEncodings(Vec<i32>),
    FramebufferUpdateRequest {
        incremental: bool,
        x: u16,
        y: u16,
        width: u16,
        height: u16,
    },
    KeyEvent {
        down: bool,
        key: u32,
    },
    PointerEvent {
        button_mask: u8,
        x: u16,
        y: u16,
    },
}

impl ClientMessage {
    pub fn write_to<W: Write>(&self, writer: &mut W) -> std::io::Result<()> {
        match self {
            ClientMessage::SetPixelFormat(format) => {
                writer.write_u8(0)?;
                writer.write_all(&[0u8; 3])?;
                format.write_to(writer)
            }
            ClientMessage::SetEncodings(encodings) => {
                writer.write_u8(2)?;
                writer.write_u8(0)?;
                writer.write_u16::<BigEndian>(encodings.len() as u16)?;
                for encoding in encodings {
                    writer.write_i32::<BigEndian>(*encoding)?;
                }
                Ok(())
            }
            ClientMessage::FramebufferUpdateRequest {
                incremental,
                x,
                y,
                width,
                height,
            } => {
                writer.write_u8(3)?;
                writer.write_u8(u8::from(*incremental))?;
                writer.write_u16::<BigEndian>(*x)?;
                writer.write_u16::<BigEndian>(*y)?;
                writer.write_u16::<BigEndian>(*width)?;
                writer.write_u16::<BigEndian>(*height)
            }
            ClientMessage::KeyEvent { down, key } => {
                writer.write_u8(4)?;
                writer.write_u8(u8::from(*down))?;
                writer.write_all(&[0u8; 2])?;
                writer.write_u32::<BigEndian>(*key)
            }
            ClientMessage::PointerEvent { button_mask, x, y } => {
                writer.write_u8(5)?;
                writer.write_u8(*button_mask)?;
                writer.write_u16::<BigEndian>(*x)?;
                writer.write_u16::<BigEndian>(*y)
            }
        }
    }

    pub fn to_bytes(&self) -> Result<Vec<u8>, RelayError> {
        let mut bytes = Vec::with_capacity(20);
        self.write_to(&mut bytes)?;
        Ok(bytes)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn negotiate_caps_at_3_8_and_maps_old_minors_to_3_3() {
        assert_eq!(
            ProtocolVersion::negotiate(b"RFB 003.008\n").expect("3.8"),
            ProtocolVersion::V3_8
        );
        assert_eq!(
            ProtocolVersion::negotiate(b"RFB 003.889\n").expect("apple"),
            ProtocolVersion::V3_8
        );
        assert_eq!(
            ProtocolVersion::negotiate(b"RFB 003.007\n").expect("3.7"),
            ProtocolVersion::V3_7
        );
        assert_eq!(
            ProtocolVersion::negotiate(b"RFB 003.005\n").expect("3.5"),
            ProtocolVersion::V3_3
        );
        assert!(ProtocolVersion::negotiate(b"HTTP/1.1 200").is_err());
        assert!(matches!(
            ProtocolVersion::negotiate(b"RFB 004.000\n"),
            Err(RelayError::Unsupported(_))
        ));
    }

    #[test]
    fn pixel_format_wire_layout_is_sixteen_bytes() {
        let mut bytes = Vec::new();
        PixelFormat::rgb888()
            .write_to(&mut bytes)
            .expect("write should succeed");
        assert_eq!(
            bytes,
            vec![32, 24, 0, 1, 0, 255, 0, 255, 0, 255, 16, 8, 0, 0, 0, 0]
        );
        let decoded = PixelFormat::read_from(&mut Cursor::new(&bytes[..])).expect("decode");
        assert_eq!(decoded, PixelFormat::rgb888());
    }

    #[test]
    fn client_messages_encode_big_endian() {
        assert_eq!(
            ClientMessage::PointerEvent {
                button_mask: 1,
                x: 400,
                y: 300
            }
            .to_bytes()
            .expect("encode"),
            vec![5, 1, 0x01, 0x90, 0x01, 0x2c]
        );
        assert_eq!(
            ClientMessage::KeyEvent {
                down: true,
                key: 0xff0d
            }
            .to_bytes()
            .expect("encode"),
            vec![4, 1, 0, 0, 0, 0, 0xff, 0x0d]
        );
        assert_eq!(
            ClientMessage::SetEncodings(vec![ENCODING_COPY_RECT, ENCODING_DESKTOP_SIZE])
                .to_bytes()
                .expect("encode"),
            vec![2, 0, 0, 2, 0, 0, 0, 1, 0xff, 0xff, 0xff, 0x21]
        );
        assert_eq!(
            ClientMessage::SetPixelFormat(PixelFormat::rgb888())
                .to_bytes()
                .expect("encode")
                .len(),
            20
        );
    }

    #[test]
    fn rect_header_decodes_negative_pseudo_encoding() {
        let header = RectHeader::decode(&[0, 0, 0, 0, 0x04, 0, 0x03, 0, 0xff, 0xff, 0xff, 0x21])
            .expect("decode");
        assert_eq!(header.width, 1024);
        assert_eq!(header.height, 768);
        assert_eq!(header.encoding, ENCODING_DESKTOP_SIZE);
    }

    #[test]
    fn raw_len_rejects_oversized_rectangles() {
        let header = RectHeader {
            x: 0,
            y: 0,
            width: u16::MAX,
            height: u16::MAX,
            encoding: ENCODING_RAW,
        };
        assert!(header.raw_len(&PixelFormat::rgb888()).is_err());
    }
}
