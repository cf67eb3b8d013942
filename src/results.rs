use std::fs::{self, File};
use std::io::{self, Read, Write};
use std::path::{Path, PathBuf};

use metrics::counter;
use zip::ZipWriter;
use zip::write::SimpleFileOptions;

use crate::error::CommandError;
use crate::types::{ProgramName, RunId};

/// Name of the run's captured stdout/stderr inside a result bundle.
pub const LOG_ENTRY: &str = "program.log";

/// Bundles `archives/<program>/results/<run_id>/` into `data/<program>_<run_id>.zip`.
#[derive(Clone)]
pub struct ResultPackager {
    archives_dir: PathBuf,
    data_dir: PathBuf,
    max_file_bytes: u64,
}

pub fn result_dir(archives_dir: &Path, program: &ProgramName, run_id: &RunId) -> PathBuf {
    archives_dir
        .join(program.as_str())
        .join("results")
        .join(run_id.as_str())
}

pub fn log_path(data_dir: &Path, program: &ProgramName, run_id: &RunId) -> PathBuf {
    data_dir.join(format!("{}_{}.log", program, run_id))
}

impl ResultPackager {
    pub fn new(
        archives_dir: impl Into<PathBuf>,
        data_dir: impl Into<PathBuf>,
        max_file_bytes: u64,
    ) -> Self {
        Self {
            archives_dir: archives_dir.into(),
            data_dir: data_dir.into(),
            max_file_bytes,
        }
    }

    pub fn artifact_path(&self, program: &ProgramName, run_id: &RunId) -> PathBuf {
        self.data_dir.join(format!("{}_{}.zip", program, run_id))
    }

    /// Packs whatever the run has written so far. Repeated calls overwrite the artifact.
    pub fn collect(&self, program: &ProgramName, run_id: &RunId) -> Result<PathBuf, CommandError> {
        let source = result_dir(&self.archives_dir, program, run_id);
        if !source.is_dir() {
            return Err(CommandError::ResultNotFound {
                program: program.to_string(),
                run_id: run_id.to_string(),
            });
        }

        let out = self.artifact_path(program, run_id);
        let partial = out.with_extension("zip.partial");

        let log = log_path(&self.data_dir, program, run_id);
        let written = fs::create_dir_all(&self.data_dir)
            .and_then(|_| self.write_bundle(&source, &log, &partial))
            .and_then(|files| fs::rename(&partial, &out).map(|_| files));

        match written {
            Ok(files) => {
                counter!("results_collected_total").increment(1);
                tracing::info!(
                    "collected result {}:{} ({} files) into {}",
                    program,
                    run_id,
                    files,
                    out.display()
                );
                Ok(out)
            }
            Err(e) => {
                let _ = fs::remove_file(&partial);
                Err(CommandError::CollectFailed(e.to_string()))
            }
        }
    }

    fn write_bundle(&self, source: &Path, log: &Path, target: &Path) -> io::Result<usize> {
        let mut writer = ZipWriter::new(File::create(target)?);
        let options = SimpleFileOptions::default();

        let mut files = Vec::new();
        walk(source, source, &mut files)?;
        files.sort();

        for (name, path) in &files {
            writer.start_file(name.as_str(), options)?;
            self.append_capped(&mut writer, path)?;
        }

        if log.is_file() {
            writer.start_file(LOG_ENTRY, options)?;
            self.append_capped(&mut writer, log)?;
        }

        writer.finish()?.sync_all()?;
        Ok(files.len())
    }

    fn append_capped(&self, writer: &mut impl Write, path: &Path) -> io::Result<()> {
        let file = File::open(path)?;
        let size = file.metadata()?.len();
        if size > self.max_file_bytes {
            tracing::warn!(
                "truncating {} from {} to {} bytes in bundle",
                path.display(),
                size,
                self.max_file_bytes
            );
        }
        io::copy(&mut file.take(self.max_file_bytes), writer)?;
        Ok(())
    }
}

/// Collects `(entry name, path)` for every regular file below `dir`.
fn walk(root: &Path, dir: &Path, out: &mut Vec<(String, PathBuf)>) -> io::Result<()> {
    for entry in fs::read_dir(dir)? {
        let entry = entry?;
        let path = entry.path();
        let file_type = entry.file_type()?;
        if file_type.is_dir() {
            walk(root, &path, out)?;
        } else if file_type.is_file() {
            let name = path
                .strip_prefix(root)
                .map_err(io::Error::other)?
                .components()
                .map(|c| c.as_os_str().to_string_lossy())
                .collect::<Vec<_>>()
                .join("/");
            out.push((name, path));
        }
    }
    Ok(())
}
