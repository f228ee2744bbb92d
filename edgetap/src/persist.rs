//! JSON snapshots of the in-memory stores.

use anyhow::Context as _;
use camino::Utf8Path;
use serde::Serialize;
use serde::de::DeserializeOwned;

/// Writes `value` next to `path` then renames it over `path`.
pub async fn save_json<T: Serialize>(path: &Utf8Path, value: &T) -> anyhow::Result<()> {
    let json = serde_json::to_vec(value).context("failed to serialize snapshot")?;

    if let Some(parent) = path.parent() {
        tokio::fs::create_dir_all(parent)
            .await
            .with_context(|| format!("failed to create {parent}"))?;
    }

    let tmp_path = path.with_extension("tmp");

    tokio::fs::write(&tmp_path, json)
        .await
        .with_context(|| format!("failed to write {tmp_path}"))?;

    tokio::fs::rename(&tmp_path, path)
        .await
        .with_context(|| format!("failed to move {tmp_path} to {path}"))?;

    Ok(())
}

/// Reads a snapshot; a missing file is not an error.
pub async fn load_json<T: DeserializeOwned>(path: &Utf8Path) -> anyhow::Result<Option<T>> {
    let bytes = match tokio::fs::read(path).await {
        Ok(bytes) => bytes,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
        Err(e) => return Err(anyhow::Error::new(e).context(format!("failed to read {path}"))),
    };

    serde_json::from_slice(&bytes)
        .map(Some)
        .with_context(|| format!("invalid snapshot at {path}"))
}
