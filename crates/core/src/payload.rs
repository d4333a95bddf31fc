//! JSON bodies carried by broker jobs.
//!
//! Work jobs carry a [`JobPayload`]; finished tiles travel back on the
//! result tube as a [`ResultPayload`]. Both are tagged with the scene
//! version of the process that produced them.

use serde::{Deserialize, Serialize};

use crate::error::CoreError;
use crate::types::Tile;

/// Body of a job on the work tube.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobPayload {
    pub scene_version: String,
    pub tile: Tile,
    pub seed: String,
    /// Generator-assigned priority, kept so a lease can be released
    /// without losing its place in the order.
    pub priority: u32,
}

/// Body of a job on the result tube.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResultPayload {
    pub scene_version: String,
    pub tile: Tile,
    /// Base64 PNG, see [`crate::encoding`].
    pub data: String,
}

impl JobPayload {
    pub fn to_bytes(&self) -> Result<Vec<u8>, CoreError> {
        Ok(serde_json::to_vec(self)?)
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<Self, CoreError> {
        Ok(serde_json::from_slice(bytes)?)
    }
}

impl ResultPayload {
    pub fn to_bytes(&self) -> Result<Vec<u8>, CoreError> {
        Ok(serde_json::to_vec(self)?)
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<Self, CoreError> {
        Ok(serde_json::from_slice(bytes)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn job_payload_wire_shape() {
        let payload = JobPayload {
            scene_version: "abc".into(),
            tile: Tile {
                x: 10,
                y: 20,
                width: 5,
                height: 5,
                sampling: 64,
            },
            seed: "world".into(),
            priority: 7,
        };
        let value: serde_json::Value =
            serde_json::from_slice(&payload.to_bytes().unwrap()).unwrap();
        assert_eq!(value["scene_version"], "abc");
        assert_eq!(value["tile"]["x"], 10);
        assert_eq!(value["tile"]["sampling"], 64);
        assert_eq!(value["seed"], "world");
        assert_eq!(value["priority"], 7);
    }

    #[test]
    fn malformed_body_is_a_payload_error() {
        assert!(matches!(
            ResultPayload::from_bytes(b"{\"scene_version\":1}"),
            Err(CoreError::Payload(_))
        ));
    }
}
