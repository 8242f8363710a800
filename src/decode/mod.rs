//! Pluggable decoders for encoded device payloads.
//!
//! Remote attributes may deliver opaque byte payloads tagged with an
//! encoding name (camera frames, raw counter arrays, text). A [`Decoder`]
//! turns such a payload into a typed [`DataRecord`] with an inferred shape.
//! The [`DecoderRegistry`] maps encoding tags to decoder instances; it is
//! populated at writer construction, optionally extended by the caller, and
//! sealed before any phase runs.

use crate::error::{WriterError, WriterResult};
use crate::types::{DataRecord, NxType, ScalarValue};
use bytes::Buf;
use std::collections::HashMap;
use std::sync::Arc;

pub mod video;

pub use video::VideoImageDecoder;

/// Decodes one encoding family into typed records.
pub trait Decoder: Send + Sync {
    /// The encoding tag this decoder handles.
    fn encoding(&self) -> &'static str;

    /// Decode a payload into a typed, shaped record.
    fn decode(&self, payload: &[u8]) -> WriterResult<DataRecord>;
}

/// Registry of decoders keyed by encoding tag.
pub struct DecoderRegistry {
    decoders: HashMap<String, Arc<dyn Decoder>>,
}

impl Default for DecoderRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl DecoderRegistry {
    /// A registry with the built-in decoders.
    pub fn new() -> Self {
        let mut registry = DecoderRegistry {
            decoders: HashMap::new(),
        };
        registry.register(Arc::new(Utf8Decoder));
        registry.register(Arc::new(Uint32Decoder));
        registry.register(Arc::new(VideoImageDecoder));
        registry
    }

    /// Register (or replace) a decoder under its encoding tag.
    pub fn register(&mut self, decoder: Arc<dyn Decoder>) {
        let tag = decoder.encoding().to_string();
        if self.decoders.contains_key(&tag) {
            log::debug!("replacing decoder for encoding '{}'", tag);
        }
        self.decoders.insert(tag, decoder);
    }

    /// Look up a decoder by encoding tag.
    pub fn get(&self, encoding: &str) -> Option<Arc<dyn Decoder>> {
        self.decoders.get(encoding).cloned()
    }

    /// Decode a record's `Encoded` payload in place.
    pub fn resolve(&self, record: DataRecord) -> WriterResult<DataRecord> {
        let Some(encoding) = record.encoding.clone() else {
            return Ok(record);
        };
        let crate::types::WireData::Encoded(payload) = &record.value else {
            return Ok(record);
        };
        let decoder = self.get(&encoding).ok_or_else(|| {
            WriterError::Data(format!("no decoder registered for encoding '{}'", encoding))
        })?;
        decoder.decode(payload)
    }
}

/// Text payloads.
pub struct Utf8Decoder;

impl Decoder for Utf8Decoder {
    fn encoding(&self) -> &'static str {
        "UTF8"
    }

    fn decode(&self, payload: &[u8]) -> WriterResult<DataRecord> {
        let text = std::str::from_utf8(payload)
            .map_err(|e| WriterError::Data(format!("invalid UTF-8 payload: {}", e)))?;
        Ok(DataRecord::scalar(
            ScalarValue::Text(text.to_string()),
            NxType::Char,
        ))
    }
}

/// Raw little-endian `u32` arrays (MCA-style counters).
pub struct Uint32Decoder;

impl Decoder for Uint32Decoder {
    fn encoding(&self) -> &'static str {
        "UINT32"
    }

    fn decode(&self, payload: &[u8]) -> WriterResult<DataRecord> {
        if payload.len() % 4 != 0 {
            return Err(WriterError::Data(format!(
                "UINT32 payload of {} bytes is not a whole number of elements",
                payload.len()
            )));
        }
        let mut buf = payload;
        let mut values = Vec::with_capacity(payload.len() / 4);
        while buf.has_remaining() {
            values.push(ScalarValue::UInt(u64::from(buf.get_u32_le())));
        }
        Ok(DataRecord::list(values, NxType::UInt32))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{Rank, WireData};

    #[test]
    fn test_utf8_decoder() {
        let registry = DecoderRegistry::new();
        let rec = registry
            .get("UTF8")
            .expect("registered")
            .decode(b"hello beam")
            .expect("decode");
        assert_eq!(
            rec.value,
            WireData::Scalar(ScalarValue::Text("hello beam".to_string()))
        );
    }

    #[test]
    fn test_uint32_decoder_shape() {
        let registry = DecoderRegistry::new();
        let payload: Vec<u8> = [7u32, 9, 11]
            .iter()
            .flat_map(|v| v.to_le_bytes())
            .collect();
        let rec = registry
            .get("UINT32")
            .expect("registered")
            .decode(&payload)
            .expect("decode");
        assert_eq!(rec.rank, Rank::OneD);
        assert_eq!(rec.shape, vec![3]);
        assert_eq!(rec.dtype, NxType::UInt32);
    }

    #[test]
    fn test_resolve_unknown_encoding_is_error() {
        let registry = DecoderRegistry::new();
        let rec = DataRecord::encoded(vec![1, 2, 3], "MYSTERY");
        assert!(matches!(
            registry.resolve(rec),
            Err(WriterError::Data(_))
        ));
    }

    #[test]
    fn test_resolve_passes_plain_records_through() {
        let registry = DecoderRegistry::new();
        let rec = DataRecord::scalar(ScalarValue::Int(5), NxType::Int64);
        assert_eq!(registry.resolve(rec.clone()).expect("pass"), rec);
    }
}
