use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::store::{schema, Collection};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CachedArtifact {
    /// Canonical source URL
    pub key: String,
    #[serde(with = "base64_bytes")]
    pub payload: Vec<u8>,
    pub content_type: Option<String>,
    /// Lowercase hex SHA-256 of `payload`
    pub digest: String,
    pub fetched_at: DateTime<Utc>,
}

impl CachedArtifact {
    pub fn new(key: impl Into<String>, payload: Vec<u8>, content_type: Option<String>) -> Self {
        Self {
            key: key.into(),
            digest: digest_hex(&payload),
            payload,
            content_type,
            fetched_at: Utc::now(),
        }
    }

    pub fn size(&self) -> usize {
        self.payload.len()
    }

    pub fn age_minutes(&self) -> i64 {
        (Utc::now() - self.fetched_at).num_minutes()
    }

    pub fn age_display(&self) -> String {
        let minutes = self.age_minutes();
        if minutes < 1 {
            // Includes negative ages from clock skew
            "just now".to_string()
        } else if minutes < 60 {
            format!("{}m ago", minutes)
        } else if minutes < 1440 {
            format!("{}h ago", (minutes + 30) / 60)
        } else {
            format!("{}d ago", (minutes + 720) / 1440)
        }
    }
}

pub fn digest_hex(bytes: &[u8]) -> String {
    format!("{:x}", Sha256::digest(bytes))
}

pub struct ArtifactCollection;

impl Collection for ArtifactCollection {
    const NAME: &'static str = schema::ARTIFACTS;
    type Key = str;
    type Record = CachedArtifact;
}

mod base64_bytes {
    use base64::{engine::general_purpose::STANDARD, Engine};
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(bytes: &[u8], serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&STANDARD.encode(bytes))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Vec<u8>, D::Error> {
        let encoded = String::deserialize(deserializer)?;
        STANDARD.decode(encoded).map_err(serde::de::Error::custom)
    }
}
