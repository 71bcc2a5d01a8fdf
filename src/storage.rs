//! Where received bytes end up.

use std::{
    io::ErrorKind,
    path::{Path, PathBuf},
};

use async_trait::async_trait;
use axum::body::Bytes;
use futures::{stream::BoxStream, StreamExt};
use tokio::{
    fs::{File, OpenOptions},
    io::AsyncWriteExt,
};

use crate::{error::Result, models::FileMetadata};

pub type ByteStream = BoxStream<'static, std::io::Result<Bytes>>;

/// Called with the running total of bytes written.
pub type ProgressFn = dyn Fn(u64) + Send + Sync;

#[async_trait]
pub trait FileSink: Send + Sync {
    /// Consumes `body` into storage for `file`, returning the number of bytes
    /// written.
    async fn save(&self, file: &FileMetadata, body: ByteStream, progress: &ProgressFn)
        -> Result<u64>;
}

/// Writes each file into a directory, creating it on first use.
#[derive(Debug, Clone)]
pub struct DiskSink {
    dir: PathBuf,
}

impl DiskSink {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Only the final path component of the sender's file name is used, so a
    /// name like `../../etc/passwd` cannot escape the download directory.
    pub fn target_path(&self, file: &FileMetadata) -> PathBuf {
        let name = Path::new(&file.file_name)
            .file_name()
            .map(|n| n.to_os_string())
            .unwrap_or_else(|| file.id.clone().into());
        self.dir.join(name)
    }

    /// Creates the target file, never replacing one that exists: the second
    /// `report.txt` becomes `report (1).txt`, and so on.
    async fn create_unique(&self, file: &FileMetadata) -> std::io::Result<(PathBuf, File)> {
        let base = self.target_path(file);
        let mut path = base.clone();
        let mut n = 0u32;
        loop {
            match OpenOptions::new().write(true).create_new(true).open(&path).await {
                Ok(out) => return Ok((path, out)),
                Err(e) if e.kind() == ErrorKind::AlreadyExists => {
                    n += 1;
                    path = numbered(&base, n);
                }
                Err(e) => return Err(e),
            }
        }
    }
}

fn numbered(path: &Path, n: u32) -> PathBuf {
    let stem = path
        .file_stem()
        .map(|s| s.to_string_lossy().into_owned())
        .unwrap_or_default();
    let name = match path.extension() {
        Some(ext) => format!("{stem} ({n}).{}", ext.to_string_lossy()),
        None => format!("{stem} ({n})"),
    };
    path.with_file_name(name)
}

#[async_trait]
impl FileSink for DiskSink {
    async fn save(
        &self,
        file: &FileMetadata,
        mut body: ByteStream,
        progress: &ProgressFn,
    ) -> Result<u64> {
        tokio::fs::create_dir_all(&self.dir).await?;
        let (path, mut out) = self.create_unique(file).await?;
        let mut written = 0u64;

        let copied: std::io::Result<()> = async {
            while let Some(chunk) = body.next().await {
                let chunk = chunk?;
                out.write_all(&chunk).await?;
                written += chunk.len() as u64;
                progress(written);
            }
            out.flush().await
        }
        .await;

        if let Err(e) = copied {
            drop(out);
            if let Err(remove) = tokio::fs::remove_file(&path).await {
                log::warn!("could not remove partial file {path:?}: {remove}");
            }
            return Err(e.into());
        }

        log::info!("saved {} ({written} bytes) to {path:?}", file.file_name);
        Ok(written)
    }
}

/// Keeps received files in memory, keyed by file id.
#[cfg(test)]
#[derive(Debug, Default)]
pub(crate) struct MemorySink {
    pub files: tokio::sync::Mutex<std::collections::HashMap<String, Vec<u8>>>,
}

#[cfg(test)]
#[async_trait]
impl FileSink for MemorySink {
    async fn save(
        &self,
        file: &FileMetadata,
        mut body: ByteStream,
        progress: &ProgressFn,
    ) -> Result<u64> {
        let mut data = Vec::new();
        while let Some(chunk) = body.next().await {
            data.extend_from_slice(&chunk?);
            progress(data.len() as u64);
        }
        let written = data.len() as u64;
        self.files.lock().await.insert(file.id.clone(), data);
        Ok(written)
    }
}

/// Refuses everything, as a full disk would.
#[cfg(test)]
#[derive(Debug, Default)]
pub(crate) struct FailingSink;

#[cfg(test)]
#[async_trait]
impl FileSink for FailingSink {
    async fn save(&self, _: &FileMetadata, _: ByteStream, _: &ProgressFn) -> Result<u64> {
        Err(std::io::Error::other("no space left on device").into())
    }
}
