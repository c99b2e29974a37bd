//! Newline-delimited JSON chunk files.
//!
//! A chunk file holds one sample per line. Files are written to a temporary
//! name, synced, then renamed into place, so a reader either sees a complete
//! file or none.

use std::path::{Path, PathBuf};

use tokio::io::AsyncWriteExt;

use crate::sensor::types::Sample;
use crate::storage::error::ChunkError;

pub const EXTENSION: &str = "jsonl";

pub fn chunk_path(dir: &Path, chunk_id: &str) -> PathBuf {
    dir.join(format!("{chunk_id}.{EXTENSION}"))
}

pub fn temp_path(dir: &Path, chunk_id: &str) -> PathBuf {
    dir.join(format!("temp_{chunk_id}.{EXTENSION}"))
}

pub fn encode(samples: &[Sample]) -> Result<Vec<u8>, ChunkError> {
    let mut out = Vec::with_capacity(samples.len() * 96);
    for sample in samples {
        serde_json::to_writer(&mut out, sample)?;
        out.push(b'\n');
    }
    Ok(out)
}

/// Parse chunk contents. Blank lines are skipped; any other malformed line
/// fails with its 1-based line number.
pub fn decode(bytes: &[u8]) -> Result<Vec<Sample>, ChunkError> {
    let text = std::str::from_utf8(bytes).map_err(|e| ChunkError::Decode {
        line: 0,
        message: e.to_string(),
    })?;

    let mut samples = Vec::new();
    for (idx, line) in text.lines().enumerate() {
        if line.trim().is_empty() {
            continue;
        }
        let sample = serde_json::from_str(line).map_err(|e| ChunkError::Decode {
            line: idx + 1,
            message: e.to_string(),
        })?;
        samples.push(sample);
    }
    Ok(samples)
}

/// Write `bytes` to `final_path` atomically. Returns the file size.
///
/// Fails with [`ChunkError::AlreadySealed`] if the final path already exists;
/// sealed chunks are never overwritten. On error the temporary file is gone.
pub async fn write_atomic(
    dir: &Path,
    chunk_id: &str,
    bytes: &[u8],
) -> Result<(PathBuf, u64), ChunkError> {
    let final_path = chunk_path(dir, chunk_id);
    if tokio::fs::try_exists(&final_path)
        .await
        .map_err(|e| ChunkError::file(&final_path, e))?
    {
        return Err(ChunkError::AlreadySealed(chunk_id.to_string()));
    }

    let temp = temp_path(dir, chunk_id);
    if let Err(err) = write_synced(&temp, bytes).await {
        remove_if_present(&temp).await;
        return Err(err);
    }

    if let Err(err) = tokio::fs::rename(&temp, &final_path).await {
        remove_if_present(&temp).await;
        return Err(ChunkError::file(&final_path, err));
    }

    Ok((final_path, bytes.len() as u64))
}

async fn write_synced(path: &Path, bytes: &[u8]) -> Result<(), ChunkError> {
    let mut file = tokio::fs::File::create(path)
        .await
        .map_err(|e| ChunkError::file(path, e))?;
    file.write_all(bytes)
        .await
        .map_err(|e| ChunkError::file(path, e))?;
    file.sync_all().await.map_err(|e| ChunkError::file(path, e))?;
    Ok(())
}

pub async fn read(path: &Path) -> Result<Vec<Sample>, ChunkError> {
    let bytes = tokio::fs::read(path)
        .await
        .map_err(|e| ChunkError::file(path, e))?;
    decode(&bytes)
}

/// Best-effort removal used on cleanup paths.
pub async fn remove_if_present(path: &Path) {
    match tokio::fs::remove_file(path).await {
        Ok(()) => {}
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => {}
        Err(err) => tracing::warn!(path = %path.display(), "failed to remove file: {err}"),
    }
}
