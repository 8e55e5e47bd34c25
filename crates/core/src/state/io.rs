//! # IO Utilities
//!
//! File system helpers for the `.chatsoul` runtime directory and the report
//! output directory.

use anyhow::{Context, Result};
use std::path::{Path, PathBuf};
use tokio::fs;

/// Get the runtime directory path (.chatsoul)
///
/// Holds the checkpoint database and the optional config file.
pub fn get_runtime_path() -> PathBuf {
    if let Ok(path) = std::env::var("CHATSOUL_RUNTIME_PATH") {
        return PathBuf::from(path);
    }

    std::env::current_dir()
        .unwrap_or_else(|_| PathBuf::from("."))
        .join(".chatsoul")
}

/// Write a file, creating parent directories as needed
pub async fn write_file(path: impl AsRef<Path>, content: &str) -> Result<PathBuf> {
    let path = path.as_ref();

    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)
            .await
            .with_context(|| format!("Failed to create directory: {:?}", parent))?;
    }

    fs::write(path, content)
        .await
        .with_context(|| format!("Failed to write file: {:?}", path))?;
    Ok(path.to_path_buf())
}

/// Read a file if it exists
pub async fn read_optional(path: impl AsRef<Path>) -> Result<Option<String>> {
    let path = path.as_ref();
    match fs::read_to_string(path).await {
        Ok(content) => Ok(Some(content)),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
        Err(e) => Err(e).with_context(|| format!("Failed to read file: {:?}", path)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_get_runtime_path() {
        if std::env::var("CHATSOUL_RUNTIME_PATH").is_err() {
            assert!(get_runtime_path().ends_with(".chatsoul"));
        }
    }

    #[tokio::test]
    async fn test_file_operations() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("reports/report.md");

        assert_eq!(read_optional(&path).await.unwrap(), None);

        write_file(&path, "# Report").await.unwrap();
        assert_eq!(
            read_optional(&path).await.unwrap().as_deref(),
            Some("# Report")
        );
    }
}
