use bytes::Bytes;

use crate::{
    clock::Clock,
    errors::{
        Error,
        Result,
    },
};

/// Bidirectional value <-> bytes converter. Keys and values cross the
/// retention boundary as opaque byte strings; the codec belongs to the
/// caller.
pub trait ValueCodec: Send + Sync + 'static {
    type Value;

    fn encode(&self, value: &Self::Value) -> Result<Vec<u8>>;
    fn decode(&self, bytes: &[u8]) -> Result<Self::Value>;
}

/// UTF-8 string values.
#[derive(Clone, Copy, Debug, Default)]
pub struct Utf8Codec;

impl ValueCodec for Utf8Codec {
    type Value = String;

    fn encode(&self, value: &String) -> Result<Vec<u8>> {
        Ok(value.as_bytes().to_vec())
    }

    fn decode(&self, bytes: &[u8]) -> Result<String> {
        std::str::from_utf8(bytes)
            .map(str::to_owned)
            .map_err(|e| Error::SerializationFailure(format!("invalid utf-8 value: {e}")))
    }
}

/// Identity codec for callers that handle raw bytes themselves.
#[derive(Clone, Copy, Debug, Default)]
pub struct BytesCodec;

impl ValueCodec for BytesCodec {
    type Value = Bytes;

    fn encode(&self, value: &Bytes) -> Result<Vec<u8>> {
        Ok(value.to_vec())
    }

    fn decode(&self, bytes: &[u8]) -> Result<Bytes> {
        Ok(Bytes::copy_from_slice(bytes))
    }
}

/// Fixed-width clock values: 8 bytes per source in source-set order.
#[derive(Clone, Copy, Debug)]
pub struct ClockCodec {
    num_sources: usize,
}

impl ClockCodec {
    pub fn new(num_sources: usize) -> Self {
        Self { num_sources }
    }
}

impl ValueCodec for ClockCodec {
    type Value = Clock;

    fn encode(&self, value: &Clock) -> Result<Vec<u8>> {
        value.encode(self.num_sources)
    }

    fn decode(&self, bytes: &[u8]) -> Result<Clock> {
        Clock::decode(bytes, self.num_sources)
    }
}
