//! Schema versioning and additive migration.

use std::collections::HashMap;

use tokio::sync::RwLock;
use tracing::{debug, info};

use super::backend::{RawTable, SchemaManifest, StorageBackend};
use super::StoreError;

/// Collection holding writes not yet accepted by the remote store
pub const OUTBOX: &str = "outbox";

/// Collection holding downloaded artifacts keyed by source URL
pub const ARTIFACTS: &str = "artifacts";

/// Current schema version. Bump when a collection is added.
pub const SCHEMA_VERSION: u32 = 2;

/// Every collection with the schema version that introduced it.
pub const COLLECTIONS: &[(&str, u32)] = &[(OUTBOX, 1), (ARTIFACTS, 2)];

/// Loaded, migrated collections for one open store.
pub(crate) struct Tables {
    pub version: u32,
    pub collections: HashMap<&'static str, RwLock<RawTable>>,
}

/// Bring persisted storage up to `target` and load every known collection.
///
/// Only missing collections are created. Existing collections, including
/// ones this build does not know about, are left exactly as they are.
pub(crate) async fn migrate(
    backend: &dyn StorageBackend,
    target: u32,
) -> Result<Tables, StoreError> {
    backend.probe().await?;
    let _lock = backend.lock().await?;

    let mut manifest = backend.load_manifest().await?.unwrap_or_default();
    if manifest.version > target {
        return Err(StoreError::SchemaDowngrade {
            persisted: manifest.version,
            supported: target,
        });
    }

    let from_version = manifest.version;
    let mut changed = manifest.version != target;
    let mut collections = HashMap::new();

    for &(name, since) in COLLECTIONS.iter().filter(|(_, since)| *since <= target) {
        let table = match backend.load_table(name).await? {
            Some(table) => table,
            None => {
                let table = RawTable::default();
                backend.save_table(name, &table).await?;
                debug!(collection = name, since, "Created collection");
                table
            }
        };
        if manifest.collections.insert(name.to_string()) {
            changed = true;
        }
        collections.insert(name, RwLock::new(table));
    }

    if changed {
        manifest.version = target;
        backend.save_manifest(&manifest).await?;
        info!(from = from_version, to = target, "Storage schema upgraded");
    }

    Ok(Tables {
        version: manifest.version,
        collections,
    })
}

/// Manifest after a fresh open at `target`, for assertions.
#[cfg(test)]
pub(crate) fn expected_manifest(target: u32) -> SchemaManifest {
    SchemaManifest {
        version: target,
        collections: COLLECTIONS
            .iter()
            .filter(|(_, since)| *since <= target)
            .map(|(name, _)| name.to_string())
            .collect(),
    }
}
