//! Storing a file group's description next to its contents

use std::{io::ErrorKind, path::Path};

use tokio::fs;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::{restore_mtime, DownloadFilesStats, FileGroup, FileGroupTransfer, UploadFilesStats};
use crate::error::Result;

/// Remote key the manifest of group `key` is stored under.
pub fn manifest_key(key: &str) -> String {
    format!("manifest/{}", key)
}

impl FileGroupTransfer {
    /// Upload the group's files, then its JSON manifest under `key`.
    ///
    /// The manifest is only written once every file made it, so a manifest
    /// that can be read always describes content that exists remotely.
    pub async fn upload_with_manifest(
        &self,
        group: &FileGroup,
        key: &str,
        token: &CancellationToken,
    ) -> (UploadFilesStats, Result<()>) {
        let (stats, result) = self.upload(group, token).await;
        if result.is_err() {
            return (stats, result);
        }
        let manifest = match serde_json::to_vec(group) {
            Ok(manifest) => manifest,
            Err(e) => return (stats, Err(e.into())),
        };
        debug!(key, bytes = manifest.len(), "uploading manifest");
        let result = self
            .client()
            .upload_bytes(&manifest_key(key), manifest)
            .await;
        (stats, result)
    }

    /// Fetch the manifest stored under `key` and materialize the group:
    /// directories first, then files, then symlinks, and directory mtimes
    /// last since populating a directory bumps its mtime.
    pub async fn download_from_manifest(
        &self,
        key: &str,
        token: &CancellationToken,
    ) -> (DownloadFilesStats, Result<FileGroup>) {
        let group: FileGroup = match self.client().download_bytes(&manifest_key(key)).await {
            Ok(raw) => match serde_json::from_slice(&raw) {
                Ok(group) => group,
                Err(e) => return (DownloadFilesStats::default(), Err(e.into())),
            },
            Err(e) => return (DownloadFilesStats::default(), Err(e)),
        };
        info!(
            key,
            files = group.files.len(),
            directories = group.directories.len(),
            symlinks = group.symlinks.len(),
            "restoring file group"
        );

        for dir in &group.directories {
            if let Err(e) = fs::create_dir_all(&dir.path).await {
                return (DownloadFilesStats::default(), Err(e.into()));
            }
        }

        let (stats, result) = self.download(&group, token).await;
        if let Err(e) = result {
            return (stats, Err(e));
        }

        for link in &group.symlinks {
            if let Err(e) = create_symlink(&link.target, &link.path).await {
                return (stats, Err(e));
            }
        }
        for dir in &group.directories {
            if let Err(e) = restore_mtime(&dir.path, dir.mod_time).await {
                warn!(path = %dir.path.display(), "could not restore directory mtime: {e}");
            }
        }
        (stats, Ok(group))
    }
}

async fn create_symlink(target: &Path, link: &Path) -> Result<()> {
    if let Some(parent) = link.parent() {
        fs::create_dir_all(parent).await?;
    }
    match fs::symlink_metadata(link).await {
        Ok(_) => fs::remove_file(link).await?,
        Err(e) if e.kind() == ErrorKind::NotFound => {}
        Err(e) => return Err(e.into()),
    }
    #[cfg(unix)]
    fs::symlink(target, link).await?;
    #[cfg(not(unix))]
    warn!(link = %link.display(), target = %target.display(), "symlinks are not restored on this platform");
    Ok(())
}
