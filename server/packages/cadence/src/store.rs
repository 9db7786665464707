use std::ffi::OsString;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};

use cadence_error::CadenceError;
use serde::Serialize;
use serde_json::Value;

/// Reads a JSON document, treating a missing or unparsable file as absent.
pub(crate) async fn read_json_document(path: &Path) -> Option<Value> {
    let bytes = match tokio::fs::read(path).await {
        Ok(bytes) => bytes,
        Err(err) if err.kind() == ErrorKind::NotFound => return None,
        Err(err) => {
            tracing::warn!(path = %path.display(), error = %err, "failed to read document; using defaults");
            return None;
        }
    };
    match serde_json::from_slice(&bytes) {
        Ok(value) => Some(value),
        Err(err) => {
            tracing::warn!(path = %path.display(), error = %err, "ignoring malformed document; using defaults");
            None
        }
    }
}

/// Writes `value` as pretty JSON via a sibling temp file and a rename, so the
/// target holds either the previous or the new document.
pub(crate) async fn write_json_atomic<T: Serialize + ?Sized>(
    path: &Path,
    value: &T,
) -> Result<(), CadenceError> {
    if let Some(parent) = path.parent().filter(|parent| !parent.as_os_str().is_empty()) {
        tokio::fs::create_dir_all(parent).await.map_err(|err| {
            CadenceError::persistence(format!("failed to prepare {}: {err}", parent.display()))
        })?;
    }

    let mut payload = serde_json::to_vec_pretty(value).map_err(|err| {
        CadenceError::persistence(format!("failed to encode {}: {err}", path.display()))
    })?;
    payload.push(b'\n');

    let temp_path = temp_path_for(path);
    tokio::fs::write(&temp_path, payload).await.map_err(|err| {
        CadenceError::persistence(format!("failed to write {}: {err}", temp_path.display()))
    })?;

    if let Err(err) = tokio::fs::rename(&temp_path, path).await {
        let _ = tokio::fs::remove_file(&temp_path).await;
        return Err(CadenceError::persistence(format!(
            "failed to finalize {}: {err}",
            path.display()
        )));
    }
    Ok(())
}

fn temp_path_for(path: &Path) -> PathBuf {
    let mut name = path
        .file_name()
        .map(|name| name.to_os_string())
        .unwrap_or_else(|| OsString::from("document"));
    name.push(".tmp");
    path.with_file_name(name)
}
