use std::marker::PhantomData;
use serde::de::DeserializeOwned;
use serde::Serialize;
use crate::codec::Codec;
use crate::error::{CResult, Error};

/// Binary serializer backed by bincode. `size` comes from
/// `bincode::serialized_size`, so encoding into the pre-sized buffer never
/// reallocates.
pub struct BinCodec<V> {
    _marker: PhantomData<fn() -> V>,
}

impl<V> BinCodec<V> {
    pub fn new() -> Self {
        Self { _marker: PhantomData }
    }
}

impl<V> Default for BinCodec<V> {
    fn default() -> Self {
        Self::new()
    }
}

impl<V> Clone for BinCodec<V> {
    fn clone(&self) -> Self {
        Self::new()
    }
}

impl<V: Serialize + DeserializeOwned> Codec for BinCodec<V> {
    type Value = V;

    fn size(&self, value: &V) -> CResult<usize> {
        bincode::serialized_size(value)
            .map(|size| size as usize)
            .map_err(|err| Error::Internal(err.to_string()))
    }

    fn encode(&self, value: &V, buf: &mut Vec<u8>) -> CResult<()> {
        bincode::serialize_into(&mut *buf, value).map_err(|err| Error::Internal(err.to_string()))
    }

    fn decode(&self, bytes: &[u8]) -> CResult<V> {
        bincode::deserialize(bytes).map_err(|err| Error::Corrupt(err.to_string()))
    }
}
