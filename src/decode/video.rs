//! Video-image frame decoder.
//!
//! Camera-style attributes deliver frames as a fixed 32-byte big-endian
//! header followed by pixel data:
//!
//! ```text
//! magic   u32  0x5644454F ("VDEO")
//! version u16
//! mode    u16  pixel width: 0 -> u8, 1 -> u16, 2 -> u32, 3 -> u64
//! frame   i64  acquisition frame number
//! width   i32
//! height  i32
//! endian  u16  pixel byte order: 0 little, 1 big
//! hdrsize u16  offset of the first pixel byte
//! pad     u32
//! ```
//!
//! Pixels are row-major; the decoded record has shape `[height, width]`.

use super::Decoder;
use crate::error::{WriterError, WriterResult};
use crate::types::{DataRecord, NxType, ScalarValue};
use bytes::Buf;

const VIDEO_MAGIC: u32 = 0x5644_454F;
const HEADER_LEN: usize = 32;

/// Decoder for `LIMA_VIDEO_IMAGE` payloads.
pub struct VideoImageDecoder;

impl Decoder for VideoImageDecoder {
    fn encoding(&self) -> &'static str {
        "LIMA_VIDEO_IMAGE"
    }

    fn decode(&self, payload: &[u8]) -> WriterResult<DataRecord> {
        if payload.len() < HEADER_LEN {
            return Err(WriterError::Data(format!(
                "video frame of {} bytes is shorter than its header",
                payload.len()
            )));
        }
        let mut header = &payload[..HEADER_LEN];
        let magic = header.get_u32();
        if magic != VIDEO_MAGIC {
            return Err(WriterError::Data(format!(
                "bad video frame magic {:#010x}",
                magic
            )));
        }
        let _version = header.get_u16();
        let mode = header.get_u16();
        let _frame = header.get_i64();
        let width = header.get_i32();
        let height = header.get_i32();
        let big_endian = header.get_u16() == 1;
        let hdrsize = header.get_u16() as usize;

        if width < 0 || height < 0 {
            return Err(WriterError::Data(format!(
                "negative video frame dimensions {}x{}",
                width, height
            )));
        }
        let (width, height) = (width as usize, height as usize);
        let elem_size = match mode {
            0 => 1,
            1 => 2,
            2 => 4,
            3 => 8,
            other => {
                return Err(WriterError::Data(format!(
                    "unknown video pixel mode {}",
                    other
                )))
            }
        };
        let needed = width * height * elem_size;
        let pixels = payload
            .get(hdrsize..hdrsize + needed)
            .ok_or_else(|| {
                WriterError::Data(format!(
                    "video frame truncated: {} pixel bytes needed, {} present",
                    needed,
                    payload.len().saturating_sub(hdrsize)
                ))
            })?;

        let mut buf = pixels;
        let mut read_pixel = move || -> u64 {
            match (mode, big_endian) {
                (0, _) => u64::from(buf.get_u8()),
                (1, false) => u64::from(buf.get_u16_le()),
                (1, true) => u64::from(buf.get_u16()),
                (2, false) => u64::from(buf.get_u32_le()),
                (2, true) => u64::from(buf.get_u32()),
                (3, false) => buf.get_u64_le(),
                _ => buf.get_u64(),
            }
        };
        let rows: Vec<Vec<ScalarValue>> = (0..height)
            .map(|_| (0..width).map(|_| ScalarValue::UInt(read_pixel())).collect())
            .collect();
        let dtype = match mode {
            0 => NxType::UInt8,
            1 => NxType::UInt16,
            2 => NxType::UInt32,
            _ => NxType::UInt64,
        };
        let mut record = DataRecord::table(rows, dtype)?;
        record.shape = vec![height, width];
        Ok(record)
    }
}

/// Build a frame payload in the wire layout above; 16-bit little-endian
/// pixels. Used by the simulated transport and by tests.
pub fn encode_video_frame(width: u32, height: u32, frame: i64, pixels: &[u16]) -> Vec<u8> {
    let mut out = Vec::with_capacity(HEADER_LEN + pixels.len() * 2);
    out.extend_from_slice(&VIDEO_MAGIC.to_be_bytes());
    out.extend_from_slice(&1u16.to_be_bytes()); // version
    out.extend_from_slice(&1u16.to_be_bytes()); // mode: u16 pixels
    out.extend_from_slice(&frame.to_be_bytes());
    out.extend_from_slice(&(width as i32).to_be_bytes());
    out.extend_from_slice(&(height as i32).to_be_bytes());
    out.extend_from_slice(&0u16.to_be_bytes()); // little-endian pixels
    out.extend_from_slice(&(HEADER_LEN as u16).to_be_bytes());
    out.extend_from_slice(&0u32.to_be_bytes()); // pad
    for px in pixels {
        out.extend_from_slice(&px.to_le_bytes());
    }
    out
}
