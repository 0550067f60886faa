use std::marker::PhantomData;
use serde::de::DeserializeOwned;
use serde::Serialize;
use crate::codec::Codec;
use crate::error::{CResult, Error};

/// Textual serializer backed by serde_json, for records worth inspecting on
/// disk with ordinary tools. `size` serializes once to measure, trading
/// throughput for debuggability.
pub struct JsonCodec<V> {
    _marker: PhantomData<fn() -> V>,
}

impl<V> JsonCodec<V> {
    pub fn new() -> Self {
        Self { _marker: PhantomData }
    }
}

impl<V> Default for JsonCodec<V> {
    fn default() -> Self {
        Self::new()
    }
}

impl<V> Clone for JsonCodec<V> {
    fn clone(&self) -> Self {
        Self::new()
    }
}

impl<V: Serialize + DeserializeOwned> Codec for JsonCodec<V> {
    type Value = V;

    fn size(&self, value: &V) -> CResult<usize> {
        serde_json::to_vec(value)
            .map(|bytes| bytes.len())
            .map_err(|err| Error::Internal(err.to_string()))
    }

    fn encode(&self, value: &V, buf: &mut Vec<u8>) -> CResult<()> {
        serde_json::to_writer(&mut *buf, value).map_err(|err| Error::Internal(err.to_string()))
    }

    fn decode(&self, bytes: &[u8]) -> CResult<V> {
        serde_json::from_slice(bytes).map_err(|err| Error::Corrupt(err.to_string()))
    }
}
