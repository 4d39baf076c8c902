//! System image provisioning from a local cache.
//!
//! The emulator looks for system images under
//! `<sdk_root>/system-images/<api>/<tag>/<abi>`. Rather than downloading them,
//! [`ensure_image`] mirrors an unpacked copy from a local cache directory into
//! that location. The mirror overwrites files and creates directories but
//! never deletes anything already present in the target, so it is safe to run
//! on every setup.

use std::io;
use std::path::{Path, PathBuf};

use crate::error::OrchestratorError;

/// Where a system image comes from and where the SDK expects it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeviceImage {
    pub local_source: PathBuf,
    pub sdk_target: PathBuf,
}

impl DeviceImage {
    /// Derive the SDK target from a package id such as
    /// `system-images;android-34;google_apis;x86_64`.
    pub fn for_package(local_source: impl Into<PathBuf>, sdk_root: &Path, package_id: &str) -> Self {
        let sdk_target = package_id
            .split(';')
            .filter(|part| !part.is_empty())
            .fold(sdk_root.to_path_buf(), |path, part| path.join(part));
        Self {
            local_source: local_source.into(),
            sdk_target,
        }
    }
}

/// What a mirror pass did.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CopyStats {
    pub files_copied: usize,
    pub dirs_created: usize,
}

/// Mirror `image.local_source` into `image.sdk_target`.
///
/// # Errors
///
/// - [`OrchestratorError::ImageNotFound`] if the source is missing or not a
///   directory; nothing is written in that case
/// - [`OrchestratorError::ImageCopy`] if any file or directory cannot be copied
pub async fn ensure_image(image: &DeviceImage) -> Result<CopyStats, OrchestratorError> {
    if !image.local_source.is_dir() {
        return Err(OrchestratorError::ImageNotFound {
            path: image.local_source.clone(),
        });
    }

    tracing::info!(
        source = %image.local_source.display(),
        target = %image.sdk_target.display(),
        "provisioning system image"
    );

    let source = image.local_source.clone();
    let target = image.sdk_target.clone();
    let stats = tokio::task::spawn_blocking(move || {
        let mut stats = CopyStats::default();
        mirror_dir(&source, &target, &mut stats).map(|()| stats)
    })
    .await
    .map_err(|e| OrchestratorError::Io(io::Error::new(io::ErrorKind::Other, e)))??;

    tracing::info!(
        files = stats.files_copied,
        dirs = stats.dirs_created,
        "system image in place"
    );
    Ok(stats)
}

fn mirror_dir(source: &Path, target: &Path, stats: &mut CopyStats) -> Result<(), OrchestratorError> {
    let copy_err = |path: &Path| {
        let path = path.to_path_buf();
        move |source: io::Error| OrchestratorError::ImageCopy { path, source }
    };

    if !target.is_dir() {
        std::fs::create_dir_all(target).map_err(copy_err(target))?;
        stats.dirs_created += 1;
    }

    for entry in std::fs::read_dir(source).map_err(copy_err(source))? {
        let entry = entry.map_err(copy_err(source))?;
        let from = entry.path();
        let to = target.join(entry.file_name());
        // Follows symlinks, so linked files are copied by content.
        let metadata = std::fs::metadata(&from).map_err(copy_err(&from))?;
        if metadata.is_dir() {
            mirror_dir(&from, &to, stats)?;
        } else {
            std::fs::copy(&from, &to).map_err(copy_err(&from))?;
            stats.files_copied += 1;
        }
    }
    Ok(())
}
