//! Attachment staging.
//!
//! Client attachments arrive inline as base64 and the agent reads files from
//! disk, so each request's attachments are decoded into a per-request
//! staging directory and the prompt gains a manifest line naming them. The
//! returned [`StagedAttachments`] owns the directory: dropping it removes
//! every staged file, so temp files cannot leak even when validation or the
//! subprocess fails mid-turn. Call [`StagedAttachments::cleanup`] on the
//! happy path to delete asynchronously instead.

use std::path::{Path, PathBuf};

use base64::Engine as _;
use base64::engine::general_purpose::STANDARD as BASE64;
use chrono::Utc;
use log::{debug, warn};
use rand::Rng;

use tether_protocol::commands::AttachmentPayload;

use crate::error::{Result, TetherError};
use crate::settings::AttachmentConfig;
use crate::validation::sanitize_file_name;

/// Staged attachment files plus their cleanup handle.
#[derive(Debug)]
pub struct StagedAttachments {
    dir: Option<PathBuf>,
    files: Vec<PathBuf>,
    cleaned: bool,
}

impl StagedAttachments {
    fn empty() -> Self {
        Self {
            dir: None,
            files: Vec::new(),
            cleaned: true,
        }
    }

    /// Paths of the staged files, in input order.
    pub fn paths(&self) -> &[PathBuf] {
        &self.files
    }

    pub fn is_empty(&self) -> bool {
        self.files.is_empty()
    }

    /// Remove the staging directory and everything in it.
    pub async fn cleanup(mut self) {
        if let Some(dir) = self.dir.take() {
            if let Err(e) = tokio::fs::remove_dir_all(&dir).await {
                warn!("Failed to remove staging dir {}: {}", dir.display(), e);
            }
        }
        self.cleaned = true;
    }
}

impl Drop for StagedAttachments {
    fn drop(&mut self) {
        if self.cleaned {
            return;
        }
        if let Some(dir) = self.dir.take() {
            if let Err(e) = std::fs::remove_dir_all(&dir) {
                warn!(
                    "Failed to remove staging dir {} on drop: {}",
                    dir.display(),
                    e
                );
            }
        }
    }
}

/// Decode attachments into a fresh per-request staging directory.
///
/// Empty input is a no-op returning an empty handle. On any failure the
/// partially populated directory is removed via the guard's `Drop`.
pub async fn stage(
    attachments: &[AttachmentPayload],
    config: &AttachmentConfig,
) -> Result<StagedAttachments> {
    if attachments.is_empty() {
        return Ok(StagedAttachments::empty());
    }

    let request_dir = config.root.join(uuid::Uuid::new_v4().to_string());
    tokio::fs::create_dir_all(&request_dir).await?;

    let mut staged = StagedAttachments {
        dir: Some(request_dir.clone()),
        files: Vec::with_capacity(attachments.len()),
        cleaned: false,
    };

    for attachment in attachments {
        let bytes =
            BASE64
                .decode(&attachment.data)
                .map_err(|source| TetherError::AttachmentDecode {
                    name: attachment.name.clone(),
                    source,
                })?;
        if bytes.len() as u64 > config.max_bytes {
            return Err(TetherError::AttachmentTooLarge {
                name: attachment.name.clone(),
                limit: config.max_bytes,
            });
        }

        let file_name = format!(
            "{}-{:08x}-{}",
            Utc::now().timestamp_millis(),
            rand::rng().random::<u32>(),
            sanitize_file_name(&attachment.name)
        );
        let path = request_dir.join(file_name);
        tokio::fs::write(&path, &bytes).await?;
        debug!(
            "Staged attachment '{}' ({} bytes) at {}",
            attachment.name,
            bytes.len(),
            path.display()
        );
        staged.files.push(path);
    }

    Ok(staged)
}

/// Append the staged-file manifest line to a prompt.
///
/// The agent only sees the filesystem, so this is how it learns the request
/// carried attachments.
pub fn prompt_with_manifest(prompt: &str, staged: &StagedAttachments) -> String {
    if staged.is_empty() {
        return prompt.to_string();
    }
    let names: Vec<&str> = staged
        .paths()
        .iter()
        .filter_map(|p| p.file_name().and_then(|n| n.to_str()))
        .collect();
    format!("{prompt}\n\nAttached files: {}", names.join(", "))
}

/// Remove leftover staging directories from a previous run.
pub async fn purge_staging_root(root: &Path) {
    match tokio::fs::remove_dir_all(root).await {
        Ok(()) => debug!("Purged attachment staging root {}", root.display()),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
        Err(e) => warn!(
            "Failed to purge attachment staging root {}: {}",
            root.display(),
            e
        ),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_config(root: &Path) -> AttachmentConfig {
        AttachmentConfig {
            root: root.to_path_buf(),
            max_bytes: 1024,
        }
    }

    fn payload(name: &str, data: &[u8]) -> AttachmentPayload {
        AttachmentPayload {
            name: name.to_string(),
            data: BASE64.encode(data),
        }
    }

    #[tokio::test]
    async fn test_empty_input_is_noop() {
        let tmp = tempfile::tempdir().unwrap();
        let staged = stage(&[], &test_config(tmp.path())).await.unwrap();
        assert!(staged.is_empty());
        // No staging dir should have been created.
        assert!(std::fs::read_dir(tmp.path()).unwrap().next().is_none());
        staged.cleanup().await;
    }

    #[tokio::test]
    async fn test_stage_and_cleanup() {
        let tmp = tempfile::tempdir().unwrap();
        let config = test_config(tmp.path());
        let staged = stage(
            &[payload("notes.txt", b"hello"), payload("img.png", b"\x89PNG")],
            &config,
        )
        .await
        .unwrap();

        assert_eq!(staged.paths().len(), 2);
        for path in staged.paths() {
            assert!(path.exists());
        }
        assert!(staged.paths()[0].to_string_lossy().contains("notes.txt"));

        staged.cleanup().await;
        assert!(std::fs::read_dir(tmp.path()).unwrap().next().is_none());
    }

    #[tokio::test]
    async fn test_drop_removes_files() {
        let tmp = tempfile::tempdir().unwrap();
        let config = test_config(tmp.path());
        let first_path = {
            let staged = stage(&[payload("a.txt", b"abc")], &config).await.unwrap();
            staged.paths()[0].clone()
        };
        assert!(!first_path.exists());
    }

    #[tokio::test]
    async fn test_oversized_attachment_rejected_and_cleaned() {
        let tmp = tempfile::tempdir().unwrap();
        let config = test_config(tmp.path());
        let big = vec![0u8; 2048];
        let err = stage(
            &[payload("ok.txt", b"fine"), payload("big.bin", &big)],
            &config,
        )
        .await
        .unwrap_err();
        assert!(matches!(err, TetherError::AttachmentTooLarge { .. }));
        // The guard dropped on the error path, taking the whole dir with it.
        assert!(std::fs::read_dir(tmp.path()).unwrap().next().is_none());
    }

    #[tokio::test]
    async fn test_bad_base64_rejected() {
        let tmp = tempfile::tempdir().unwrap();
        let config = test_config(tmp.path());
        let bad = AttachmentPayload {
            name: "x.bin".into(),
            data: "not base64!!!".into(),
        };
        let err = stage(&[bad], &config).await.unwrap_err();
        assert!(matches!(err, TetherError::AttachmentDecode { .. }));
    }

    #[tokio::test]
    async fn test_prompt_manifest() {
        let tmp = tempfile::tempdir().unwrap();
        let config = test_config(tmp.path());
        let staged = stage(&[payload("data.csv", b"1,2")], &config).await.unwrap();

        let enhanced = prompt_with_manifest("analyze this", &staged);
        assert!(enhanced.starts_with("analyze this"));
        assert!(enhanced.contains("Attached files: "));
        assert!(enhanced.contains("data.csv"));

        assert_eq!(prompt_with_manifest("plain", &StagedAttachments::empty()), "plain");
        staged.cleanup().await;
    }
}
