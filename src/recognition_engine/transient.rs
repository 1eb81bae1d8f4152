//! Transient image files handed to the engine process

use std::path::{Path, PathBuf};
use uuid::Uuid;

/// Image file that is deleted when dropped.
///
/// Dropping runs on every exit path of the engine call, including
/// timeouts, panics and cancellation of the owning future.
#[derive(Debug)]
pub struct TransientImage {
    path: PathBuf,
}

impl TransientImage {
    /// Write `data` to a fresh file in `dir` named after the frame id
    pub async fn write(dir: &Path, frame_id: &str, data: &[u8]) -> std::io::Result<Self> {
        let path = dir.join(file_name_for(frame_id));
        // Guard first so a partial write is still cleaned up
        let image = Self { path };
        tokio::fs::write(&image.path, data).await?;
        Ok(image)
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl Drop for TransientImage {
    fn drop(&mut self) {
        match std::fs::remove_file(&self.path) {
            Ok(()) => {
                tracing::trace!(path = %self.path.display(), "Transient image removed");
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => {
                tracing::warn!(
                    path = %self.path.display(),
                    error = %e,
                    "Failed to remove transient image"
                );
            }
        }
    }
}

/// `<sanitized frame id>-<uuid>.jpg`
///
/// Frame ids are client supplied; anything outside `[A-Za-z0-9_-]` is
/// replaced so the name can never leave the frames directory.
fn file_name_for(frame_id: &str) -> String {
    let stem: String = frame_id
        .chars()
        .take(64)
        .map(|c| {
            if c.is_ascii_alphanumeric() || c == '-' || c == '_' {
                c
            } else {
                '_'
            }
        })
        .collect();
    let stem = if stem.is_empty() { "frame".to_string() } else { stem };
    format!("{}-{}.jpg", stem, Uuid::new_v4().simple())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn test_file_name_is_sanitized() {
        let name = file_name_for("../../etc/passwd");
        assert!(name.starts_with("______etc_passwd-"));
        assert!(name.ends_with(".jpg"));
        assert!(!name.contains('/'));
    }

    #[test]
    fn test_same_frame_id_gets_distinct_names() {
        assert_ne!(file_name_for("0"), file_name_for("0"));
    }

    #[tokio::test]
    async fn test_removed_on_drop() {
        let dir = tempdir().unwrap();
        let image = TransientImage::write(dir.path(), "f1", b"jpeg").await.unwrap();
        let path = image.path().to_path_buf();
        assert!(path.exists());

        drop(image);
        assert!(!path.exists());
    }
}
