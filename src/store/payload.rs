//! Binary payload format for persisted nodes.
//!
//! A node row's opaque payload is the bincode encoding of a
//! [`PayloadEnvelope`]: a CRC32 checksum wrapping the node's leaf flag,
//! bounding shape and entry list. The checksum detects row corruption on
//! load.

use serde::{Deserialize, Serialize};

use crate::errors::{SpatialError, SpatialResult};
use crate::node::{Entry, PageId};
use crate::shape::Region;

/// The serializable state of one node, parent linkage included: a node
/// reattached by page id alone must still find its way up the tree.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct NodePayload {
    pub leaf: bool,
    pub shape: Region,
    pub entries: Vec<Entry>,
    pub parent_id: Option<PageId>,
}

/// A payload wrapped with a CRC32 checksum for corruption detection.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct PayloadEnvelope {
    checksum: u32,
    payload: NodePayload,
}

impl PayloadEnvelope {
    pub fn new(payload: NodePayload) -> SpatialResult<PayloadEnvelope> {
        let checksum = checksum_of(&payload)?;
        Ok(PayloadEnvelope { checksum, payload })
    }

    /// Encodes the envelope into the row's opaque byte payload.
    pub fn encode(&self) -> SpatialResult<Vec<u8>> {
        bincode::serde::encode_to_vec(self, bincode::config::legacy())
            .map_err(|e| SpatialError::Serialization(e.to_string()))
    }

    /// Decodes a row payload, verifying the checksum.
    pub fn decode(bytes: &[u8]) -> SpatialResult<NodePayload> {
        let envelope: PayloadEnvelope =
            bincode::serde::decode_from_slice(bytes, bincode::config::legacy())
                .map(|(envelope, _)| envelope)
                .map_err(|e| SpatialError::Serialization(e.to_string()))?;

        let expected = checksum_of(&envelope.payload)?;
        if envelope.checksum != expected {
            return Err(SpatialError::Corrupted(format!(
                "page checksum mismatch (expected {expected:08x}, got {:08x})",
                envelope.checksum
            )));
        }
        Ok(envelope.payload)
    }
}

fn checksum_of(payload: &NodePayload) -> SpatialResult<u32> {
    let bytes = bincode::serde::encode_to_vec(payload, bincode::config::legacy())
        .map_err(|e| SpatialError::Serialization(e.to_string()))?;
    Ok(crc32(&bytes))
}

/// CRC32-MPEG2.
fn crc32(data: &[u8]) -> u32 {
    const POLY: u32 = 0x04C11DB7;
    let mut crc: u32 = 0xFFFFFFFF;

    for &byte in data {
        crc ^= (byte as u32) << 24;
        for _ in 0..8 {
            crc = if crc & 0x8000_0000 != 0 {
                (crc << 1) ^ POLY
            } else {
                crc << 1
            };
        }
    }
    crc ^ 0xFFFFFFFF
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::node::EntryData;
    use crate::shape::{Point, Shape};

    fn sample_payload() -> NodePayload {
        NodePayload {
            leaf: true,
            shape: Region::rect(0.0, 0.0, 100.0, 100.0),
            entries: vec![
                Entry::new(Shape::Point(Point::at(10.0, 10.0)), EntryData::Key(1)),
                Entry::new(Shape::Region(Region::rect(1.0, 1.0, 2.0, 2.0)), EntryData::Page(7)),
            ],
            parent_id: Some(3),
        }
    }

    #[test]
    fn test_encode_decode_round_trip() {
        let payload = sample_payload();
        let bytes = PayloadEnvelope::new(payload.clone()).unwrap().encode().unwrap();
        let decoded = PayloadEnvelope::decode(&bytes).unwrap();
        assert_eq!(decoded, payload);
    }

    #[test]
    fn test_corrupted_bytes_fail_checksum() {
        let mut bytes = PayloadEnvelope::new(sample_payload())
            .unwrap()
            .encode()
            .unwrap();
        // Flip a byte past the checksum header.
        let last = bytes.len() - 1;
        bytes[last] ^= 0xFF;

        match PayloadEnvelope::decode(&bytes) {
            Err(SpatialError::Corrupted(_)) | Err(SpatialError::Serialization(_)) => {}
            other => panic!("expected corruption error, got {other:?}"),
        }
    }

    #[test]
    fn test_garbage_bytes_fail_decode() {
        assert!(PayloadEnvelope::decode(&[0xDE, 0xAD, 0xBE, 0xEF]).is_err());
    }

    #[test]
    fn test_crc32_known_properties() {
        assert_eq!(crc32(b"abc"), crc32(b"abc"));
        assert_ne!(crc32(b"abc"), crc32(b"abd"));
        assert_ne!(crc32(b""), crc32(b"\0"));
    }
}
