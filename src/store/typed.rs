//! JSON helpers over the raw string store

use serde::Serialize;
use serde::de::DeserializeOwned;

use super::{CasOutcome, StateStore, StoreResult};

/// Read and deserialize a key, returning the value with its version
pub async fn load<T: DeserializeOwned>(store: &dyn StateStore, key: &str) -> StoreResult<Option<(T, u64)>> {
    match store.get(key).await? {
        Some(versioned) => {
            let value = serde_json::from_str(&versioned.value)?;
            Ok(Some((value, versioned.version)))
        }
        None => Ok(None),
    }
}

/// Serialize and conditionally write a value
pub async fn save<T: Serialize>(
    store: &dyn StateStore,
    key: &str,
    expected: Option<u64>,
    value: &T,
) -> StoreResult<CasOutcome> {
    let json = serde_json::to_string(value)?;
    store.cas_write(key, expected, Some(json)).await
}
