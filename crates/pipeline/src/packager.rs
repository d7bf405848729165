//! Deterministic zip packaging of a job's stems.
//!
//! ```text
//! {output_dir}/{job_id}_stems.zip
//!   song_a/
//!     song_a_center.wav
//!     song_a_sides.wav
//!   song_c/
//!     ...
//! ```
//!
//! Entries follow input order, then artifact order, and carry a fixed
//! timestamp and mode so identical inputs produce identical bytes.

use std::fs::File;
use std::io::{self, BufReader, BufWriter};
use std::path::{Path, PathBuf};

use stemsplit_core::bundle::FileResult;
use stemsplit_core::types::JobId;
use zip::write::SimpleFileOptions;
use zip::{CompressionMethod, ZipWriter};

/// Suffix appended to the job id to form the archive name.
pub const ARCHIVE_SUFFIX: &str = "_stems.zip";

#[derive(Debug, thiserror::Error)]
pub enum PackagingError {
    #[error("Job {0} has no successful files to package")]
    NothingToPackage(JobId),

    #[error("Invalid archive name: {0}")]
    InvalidName(String),

    #[error("Archive not found: {0}")]
    NotFound(String),

    #[error("IO error: {0}")]
    Io(#[from] io::Error),

    #[error("Zip error: {0}")]
    Zip(#[from] zip::result::ZipError),
}

pub struct ResultPackager {
    output_dir: PathBuf,
}

impl ResultPackager {
    pub fn new(output_dir: impl Into<PathBuf>) -> Self {
        Self {
            output_dir: output_dir.into(),
        }
    }

    pub fn output_dir(&self) -> &Path {
        &self.output_dir
    }

    pub fn archive_name(job_id: JobId) -> String {
        format!("{job_id}{ARCHIVE_SUFFIX}")
    }

    pub fn archive_path(&self, job_id: JobId) -> PathBuf {
        self.output_dir.join(Self::archive_name(job_id))
    }

    /// Directory holding the job's per-input stem directories.
    pub fn job_dir(&self, job_id: JobId) -> PathBuf {
        self.output_dir.join(job_id.to_string())
    }

    /// Build the archive for `results` and return its final path.
    ///
    /// Failed entries are skipped. Blocking; call from the blocking pool.
    pub fn package(&self, job_id: JobId, results: &[FileResult]) -> Result<PathBuf, PackagingError> {
        let succeeded: Vec<&FileResult> = results.iter().filter(|r| r.is_success()).collect();
        if succeeded.is_empty() {
            return Err(PackagingError::NothingToPackage(job_id));
        }

        std::fs::create_dir_all(&self.output_dir)?;
        let final_path = self.archive_path(job_id);
        let tmp_path = self
            .output_dir
            .join(format!(".{}.tmp", Self::archive_name(job_id)));

        if let Err(e) = write_archive(&tmp_path, &succeeded) {
            let _ = std::fs::remove_file(&tmp_path);
            return Err(e);
        }
        std::fs::rename(&tmp_path, &final_path)?;

        tracing::info!(
            job_id = %job_id,
            files = succeeded.len(),
            path = %final_path.display(),
            "Result archive written",
        );
        Ok(final_path)
    }

    /// Read a packaged archive by name.
    ///
    /// Names containing path separators or `..` are rejected so lookups
    /// cannot leave the output directory.
    pub fn read(&self, archive_name: &str) -> Result<Vec<u8>, PackagingError> {
        if !is_safe_archive_name(archive_name) {
            return Err(PackagingError::InvalidName(archive_name.to_string()));
        }
        match std::fs::read(self.output_dir.join(archive_name)) {
            Ok(bytes) => Ok(bytes),
            Err(e) if e.kind() == io::ErrorKind::NotFound => {
                Err(PackagingError::NotFound(archive_name.to_string()))
            }
            Err(e) => Err(e.into()),
        }
    }
}

/// Whether `name` is a plain file name that cannot leave its directory.
pub fn is_safe_file_name(name: &str) -> bool {
    !name.is_empty()
        && !name.starts_with('.')
        && !name.contains(['/', '\\', '\0'])
        && !name.contains("..")
}

/// Whether `name` is a plain archive file name.
pub fn is_safe_archive_name(name: &str) -> bool {
    is_safe_file_name(name) && name.ends_with(".zip")
}

fn write_archive(path: &Path, results: &[&FileResult]) -> Result<(), PackagingError> {
    let file = File::create(path)?;
    let mut zip = ZipWriter::new(BufWriter::new(file));
    let options = SimpleFileOptions::default()
        .compression_method(CompressionMethod::Deflated)
        .last_modified_time(zip::DateTime::default())
        .unix_permissions(0o644);

    for result in results {
        zip.add_directory(format!("{}/", result.input), options)?;
        for artifact in result.artifacts() {
            zip.start_file(format!("{}/{}", result.input, artifact.file_name), options)?;
            let mut source = BufReader::new(File::open(&artifact.path)?);
            io::copy(&mut source, &mut zip)?;
        }
    }

    let writer = zip.finish()?;
    let file = writer.into_inner().map_err(|e| e.into_error())?;
    file.sync_all()?;
    Ok(())
}
