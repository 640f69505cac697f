use thiserror::Error;

#[derive(Error, Debug)]
pub enum AssetError {
    /// A manifest resource could not be fetched; the snapshot was discarded
    #[error("Snapshot {version} install failed at '{resource}': {reason}")]
    Install {
        version: String,
        resource: String,
        reason: String,
    },

    #[error("No complete snapshot installed for version {0}")]
    NotInstalled(String),

    #[error("Invalid snapshot version or resource name '{0}'")]
    InvalidName(String),

    #[error("Snapshot storage error: {0}")]
    Storage(#[from] std::io::Error),

    #[error("Snapshot index error: {0}")]
    Index(#[from] serde_json::Error),
}
