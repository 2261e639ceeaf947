use bytes::Bytes;
use serde::de::DeserializeOwned;
use serde::Serialize;

use crate::error::Result;

/// Turns work items and reduction values into bytes for the wire.
///
/// Implementations must round-trip: decoding an encoded value yields a value
/// equal to the original.
pub trait Codec: Send + Sync + 'static {
    fn encode<T: Serialize>(&self, value: &T) -> Result<Bytes>;

    fn decode<T: DeserializeOwned>(&self, bytes: &[u8]) -> Result<T>;
}

/// JSON encoding through `serde_json`.
#[derive(Debug, Default, Clone, Copy)]
pub struct JsonCodec;

impl Codec for JsonCodec {
    fn encode<T: Serialize>(&self, value: &T) -> Result<Bytes> {
        Ok(Bytes::from(serde_json::to_vec(value)?))
    }

    fn decode<T: DeserializeOwned>(&self, bytes: &[u8]) -> Result<T> {
        Ok(serde_json::from_slice(bytes)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::DlmlError;
    use serde::Deserialize;
    use std::collections::BTreeSet;

    #[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
    struct Item {
        cells: Vec<u32>,
        row: usize,
        label: Option<String>,
    }

    #[test]
    fn struct_round_trip() {
        let item = Item {
            cells: vec![2, 4, 1, 3],
            row: 4,
            label: Some("leaf".to_string()),
        };
        let bytes = JsonCodec.encode(&item).unwrap();
        let back: Item = JsonCodec.decode(&bytes).unwrap();
        assert_eq!(back, item);
    }

    #[test]
    fn collection_round_trip() {
        let ids: BTreeSet<String> = ["a", "b", "c"].iter().map(|s| s.to_string()).collect();
        let bytes = JsonCodec.encode(&ids).unwrap();
        let back: BTreeSet<String> = JsonCodec.decode(&bytes).unwrap();
        assert_eq!(back, ids);
    }

    #[test]
    fn decoding_wrong_shape_fails() {
        let bytes = JsonCodec.encode(&"not an item").unwrap();
        let err = JsonCodec.decode::<Item>(&bytes).unwrap_err();
        assert!(matches!(err, DlmlError::Codec(_)));
    }
}
