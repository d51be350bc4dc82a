use std::fmt::Write as _;

use anyhow::anyhow;
use log::{info, warn};
use serde::Serialize;
use sha2::{Digest, Sha256};

use crate::error::{IrrigationError, Result};

/// Where firmware images come from (HTTP(S) on the device, `file://` on the host).
pub trait FirmwareSource: Send {
    fn open(&mut self, url: &str) -> anyhow::Result<Box<dyn FirmwareStream + '_>>;
}

pub trait FirmwareStream {
    fn content_length(&self) -> Option<u64>;
    /// Returns 0 at end of stream.
    fn read(&mut self, buf: &mut [u8]) -> anyhow::Result<usize>;
}

/// The inactive boot slot.
pub trait UpdatePartition: Send {
    /// Fails when no inactive partition is available.
    fn begin(&mut self) -> anyhow::Result<Box<dyn UpdateWriter + '_>>;
}

pub trait UpdateWriter {
    fn write(&mut self, chunk: &[u8]) -> anyhow::Result<()>;
    /// Discards the session. The current boot target is untouched.
    fn abort(self: Box<Self>) -> anyhow::Result<()>;
    /// Finalizes the image and marks it as the next boot target.
    fn finalize_and_activate(self: Box<Self>) -> anyhow::Result<()>;
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct UpdateStatus {
    #[serde(rename = "inProgress")]
    pub in_progress: bool,
    #[serde(rename = "bytesWritten")]
    pub bytes_written: u64,
    #[serde(rename = "totalBytes")]
    pub total_bytes: Option<u64>,
    #[serde(rename = "lastError")]
    pub last_error: Option<String>,
    #[serde(rename = "lastSha256")]
    pub last_sha256: Option<String>,
    #[serde(rename = "lastSourceUrl")]
    pub last_source_url: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UpdateReport {
    pub bytes_written: u64,
    pub sha256: String,
}

pub struct UpdateManager {
    source: Box<dyn FirmwareSource>,
    partition: Box<dyn UpdatePartition>,
    chunk_size: usize,
}

impl UpdateManager {
    pub fn new(
        source: Box<dyn FirmwareSource>,
        partition: Box<dyn UpdatePartition>,
        chunk_size: usize,
    ) -> Self {
        Self {
            source,
            partition,
            chunk_size: chunk_size.max(1),
        }
    }

    /// Streams `url` into the inactive partition chunk by chunk and activates it.
    /// `progress` receives `(bytes_written, total_bytes)` after each chunk.
    pub fn apply(
        &mut self,
        url: &str,
        progress: &mut dyn FnMut(u64, Option<u64>),
    ) -> Result<UpdateReport> {
        let mut stream = self
            .source
            .open(url)
            .map_err(|err| IrrigationError::Network(err.context(format!("opening {url}"))))?;
        let total = stream.content_length();
        progress(0, total);

        let mut writer = self
            .partition
            .begin()
            .map_err(|err| IrrigationError::Partition(err.context("no update partition")))?;

        let mut hasher = Sha256::new();
        let mut written = 0_u64;
        let mut chunk = vec![0_u8; self.chunk_size];

        loop {
            let step = stream.read(&mut chunk).and_then(|read| {
                if read > 0 {
                    writer.write(&chunk[..read])?;
                }
                Ok(read)
            });

            let read = match step {
                Ok(0) => break,
                Ok(read) => read,
                Err(err) => {
                    if let Err(abort_err) = writer.abort() {
                        warn!("failed to abort update session: {abort_err:#}");
                    }
                    return Err(IrrigationError::Network(
                        err.context(format!("streaming image after {written} bytes")),
                    ));
                }
            };

            hasher.update(&chunk[..read]);
            written = written.saturating_add(read as u64);
            progress(written, total);
        }

        if written == 0 {
            if let Err(abort_err) = writer.abort() {
                warn!("failed to abort update session: {abort_err:#}");
            }
            return Err(IrrigationError::Network(anyhow!("firmware image is empty")));
        }

        writer
            .finalize_and_activate()
            .map_err(|err| IrrigationError::Partition(err.context("activating new image")))?;

        let mut sha256 = String::with_capacity(64);
        for byte in hasher.finalize() {
            let _ = write!(&mut sha256, "{byte:02x}");
        }

        info!("firmware image written ({written} bytes, sha256 {sha256})");
        Ok(UpdateReport {
            bytes_written: written,
            sha256,
        })
    }
}

/// Accepted update URL schemes; the host simulator additionally accepts `file://`.
pub fn validate_update_url(url: &str, allow_file: bool) -> Result<()> {
    let url = url.trim();
    if url.is_empty() {
        return Err(IrrigationError::validation(
            "url",
            "no update URL given or configured",
        ));
    }
    let accepted = url.starts_with("http://")
        || url.starts_with("https://")
        || (allow_file && url.starts_with("file://"));
    if !accepted {
        return Err(IrrigationError::validation(
            "url",
            format!("unsupported scheme in {url}"),
        ));
    }
    Ok(())
}
