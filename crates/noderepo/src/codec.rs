//! Byte encodings for stored items.
//!
//! A codec is chosen per item type through [`RepositoryItem::Codec`]. It is
//! an explicit factory: decoding produces a fully formed item from bytes
//! alone.
//!
//! [`RepositoryItem::Codec`]: crate::item::RepositoryItem::Codec

use serde::de::DeserializeOwned;
use serde::Serialize;

use crate::error::CodecError;

/// Encodes items of type `T` to bytes and decodes them back.
///
/// `decode(encode(x))` must yield an item equal to `x`.
pub trait ItemCodec<T> {
    fn encode(item: &T) -> Result<Vec<u8>, CodecError>;
    fn decode(bytes: &[u8]) -> Result<T, CodecError>;
}

/// JSON text, the default node payload format.
#[derive(Clone, Copy, Debug, Default)]
pub struct JsonCodec;

impl<T: Serialize + DeserializeOwned> ItemCodec<T> for JsonCodec {
    fn encode(item: &T) -> Result<Vec<u8>, CodecError> {
        Ok(serde_json::to_vec(item)?)
    }

    fn decode(bytes: &[u8]) -> Result<T, CodecError> {
        Ok(serde_json::from_slice(bytes)?)
    }
}

/// Compact binary encoding for payload-heavy items.
#[derive(Clone, Copy, Debug, Default)]
pub struct BincodeCodec;

impl<T: Serialize + DeserializeOwned> ItemCodec<T> for BincodeCodec {
    fn encode(item: &T) -> Result<Vec<u8>, CodecError> {
        Ok(bincode::serialize(item)?)
    }

    fn decode(bytes: &[u8]) -> Result<T, CodecError> {
        Ok(bincode::deserialize(bytes)?)
    }
}
