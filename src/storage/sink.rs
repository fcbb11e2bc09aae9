/// Append-only CSV log of decoded samples
use log::{error, info, warn};
use std::path::{Path, PathBuf};
use tokio::fs::{File, OpenOptions};
use tokio::io::AsyncWriteExt;
use tokio::sync::Mutex;

use crate::error::SinkError;
use crate::models::Sample;

/// Destination for decoded samples
#[allow(async_fn_in_trait)]
pub trait SampleStore {
    async fn append(&self, sample: &Sample) -> Result<(), SinkError>;
}

/// CSV sink over one session-stable file
///
/// The file is opened once in append mode and shared behind an async mutex,
/// so each record is written and flushed whole before the next one starts.
/// A failed write cuts the file back to its previous length, releases the
/// handle and leaves reopening to the next append.
pub struct CsvSampleSink {
    path: PathBuf,
    file: Mutex<Option<File>>,
}

impl CsvSampleSink {
    /// Open (or create) the log at `path`, creating parent directories as needed
    pub async fn open(path: impl AsRef<Path>) -> Result<Self, SinkError> {
        let path = path.as_ref().to_path_buf();
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            tokio::fs::create_dir_all(parent)
                .await
                .map_err(|e| io_error(&path, e))?;
        }
        let file = open_append(&path).await?;
        info!("Appending samples to {}", path.display());

        Ok(CsvSampleSink {
            path,
            file: Mutex::new(Some(file)),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl SampleStore for CsvSampleSink {
    async fn append(&self, sample: &Sample) -> Result<(), SinkError> {
        let line = sample.to_csv_line();
        let mut guard = self.file.lock().await;

        let mut file = match guard.take() {
            Some(file) => file,
            None => open_append(&self.path).await?,
        };
        // Device files have no meaningful length to restore
        let start = match file.metadata().await {
            Ok(meta) if meta.is_file() => Some(meta.len()),
            _ => None,
        };

        let written = async {
            file.write_all(line.as_bytes()).await?;
            file.flush().await
        }
        .await;

        match written {
            Ok(()) => {
                *guard = Some(file);
                Ok(())
            }
            Err(e) => {
                error!("Write to {} failed, releasing handle: {}", self.path.display(), e);
                if let Some(len) = start {
                    truncate_to(&file, len, &self.path).await;
                }
                Err(io_error(&self.path, e))
            }
        }
    }
}

async fn open_append(path: &Path) -> Result<File, SinkError> {
    OpenOptions::new()
        .create(true)
        .append(true)
        .open(path)
        .await
        .map_err(|e| io_error(path, e))
}

/// Drop a partially written record so the next one starts on a fresh line
async fn truncate_to(file: &File, len: u64, path: &Path) {
    if let Err(e) = file.set_len(len).await {
        warn!("Could not trim partial record from {}: {}", path.display(), e);
    }
}

fn io_error(path: &Path, source: std::io::Error) -> SinkError {
    SinkError::Io {
        path: path.display().to_string(),
        source,
    }
}
