use std::fs::{self, File};
use std::io::{self, Cursor, Read};
use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};

use metrics::counter;
use zip::ZipArchive;

use crate::error::CommandError;
use crate::types::ProgramName;

/// One directory per stored program under `root`. Uploads replace a program wholesale.
#[derive(Clone)]
pub struct ArchiveStore {
    root: PathBuf,
    max_extracted_bytes: u64,
}

const STAGING_PREFIX: &str = ".staging-";

fn staging_suffix() -> String {
    std::iter::repeat_with(fastrand::alphanumeric)
        .take(10)
        .collect()
}

fn store_failed(e: impl std::fmt::Display) -> CommandError {
    CommandError::StoreFailed(e.to_string())
}

impl ArchiveStore {
    pub fn new(root: impl Into<PathBuf>, max_extracted_bytes: u64) -> Self {
        Self {
            root: root.into(),
            max_extracted_bytes,
        }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn program_dir(&self, name: &ProgramName) -> PathBuf {
        self.root.join(name.as_str())
    }

    /// Unpacks a zip bundle as the new contents of `name`.
    ///
    /// The bundle is extracted into a hidden staging directory first, so a corrupt or
    /// oversized upload never becomes the program's live contents. Only a fully extracted
    /// bundle replaces the existing directory.
    pub fn store(&self, name: &ProgramName, bundle: &[u8]) -> Result<(), CommandError> {
        tracing::info!("storing archive {} ({} bytes)", name, bundle.len());

        let mut archive = ZipArchive::new(Cursor::new(bundle)).map_err(store_failed)?;

        // declared sizes are only a cheap early reject; extraction counts real bytes
        let declared = (0..archive.len())
            .map(|i| archive.by_index(i).map(|entry| entry.size()))
            .try_fold(0u64, |total, size| size.map(|size| total.saturating_add(size)))
            .map_err(store_failed)?;
        if declared > self.max_extracted_bytes {
            return Err(self.too_large(declared));
        }

        fs::create_dir_all(&self.root).map_err(store_failed)?;
        let staging = self
            .root
            .join(format!("{}{}-{}", STAGING_PREFIX, name, staging_suffix()));

        let extracted = match self.extract(&mut archive, &staging) {
            Ok(extracted) => extracted,
            Err(e) => {
                let _ = fs::remove_dir_all(&staging);
                return Err(e);
            }
        };

        let target = self.program_dir(name);
        if target.exists() {
            if let Err(e) = fs::remove_dir_all(&target) {
                let _ = fs::remove_dir_all(&staging);
                return Err(store_failed(e));
            }
        }

        if let Err(e) = fs::rename(&staging, &target) {
            let _ = fs::remove_dir_all(&staging);
            return Err(store_failed(e));
        }

        counter!("archives_stored_total").increment(1);
        tracing::info!("archive {} stored ({} bytes extracted)", name, extracted);
        Ok(())
    }

    /// Writes every entry below `staging`, stopping as soon as the bytes actually
    /// decompressed exceed the limit.
    fn extract(
        &self,
        archive: &mut ZipArchive<Cursor<&[u8]>>,
        staging: &Path,
    ) -> Result<u64, CommandError> {
        fs::create_dir_all(staging).map_err(store_failed)?;

        let mut written: u64 = 0;
        for i in 0..archive.len() {
            let mut entry = archive.by_index(i).map_err(store_failed)?;
            let Some(relative) = entry.enclosed_name() else {
                return Err(CommandError::StoreFailed(format!(
                    "entry {} escapes the archive",
                    entry.name()
                )));
            };
            let path = staging.join(relative);

            if entry.is_dir() {
                fs::create_dir_all(&path).map_err(store_failed)?;
                continue;
            }
            if let Some(parent) = path.parent() {
                fs::create_dir_all(parent).map_err(store_failed)?;
            }

            let mut out = File::create(&path).map_err(store_failed)?;
            let remaining = self.max_extracted_bytes - written;
            let copied = io::copy(&mut (&mut entry).take(remaining.saturating_add(1)), &mut out)
                .map_err(store_failed)?;
            written += copied;
            if written > self.max_extracted_bytes {
                return Err(self.too_large(written));
            }

            if let Some(mode) = entry.unix_mode() {
                fs::set_permissions(&path, fs::Permissions::from_mode(mode & 0o777))
                    .map_err(store_failed)?;
            }
        }

        Ok(written)
    }

    fn too_large(&self, bytes: u64) -> CommandError {
        CommandError::StoreFailed(format!(
            "archive expands to more than {} bytes (saw {})",
            self.max_extracted_bytes, bytes
        ))
    }

    /// Names of all stored programs, sorted.
    pub fn list(&self) -> Result<Vec<ProgramName>, CommandError> {
        let entries = match fs::read_dir(&self.root) {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(e.into()),
        };

        let mut names = Vec::new();
        for entry in entries {
            let entry = entry?;
            if !entry.file_type()?.is_dir() {
                continue;
            }
            // staging directories and anything else not a valid name are skipped
            if let Some(name) = entry
                .file_name()
                .to_str()
                .and_then(|n| ProgramName::new(n).ok())
            {
                names.push(name);
            }
        }

        names.sort();
        Ok(names)
    }
}
