use thiserror::Error;

#[derive(Error, Debug)]
pub enum StoreError {
    /// Storage cannot be used for this session (disk full, directory not
    /// writable, storage disabled). Callers degrade to network-only.
    #[error("Storage unavailable: {0}")]
    Unavailable(String),

    #[error("Persisted schema version {persisted} is newer than supported version {supported}")]
    SchemaDowngrade { persisted: u32, supported: u32 },

    #[error("Write attempted in a read-only transaction on '{0}'")]
    ReadOnly(&'static str),

    #[error("Unknown collection: {0}")]
    UnknownCollection(String),

    #[error("Storage I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Record serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl StoreError {
    /// Whether this error means persistence is gone for the whole session.
    pub fn is_unavailable(&self) -> bool {
        matches!(self, StoreError::Unavailable(_))
    }
}
