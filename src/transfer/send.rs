use std::{
    collections::BTreeMap,
    net::IpAddr,
    path::{Path, PathBuf},
    time::Duration,
};

use futures::{StreamExt, TryStreamExt};
use log::{debug, info, warn};
use reqwest::{Body, Response};
use tokio_util::io::ReaderStream;

use crate::{
    discovery::Device,
    error::{LocalSendError, Result},
    models::{FileMetadata, PrepareDownloadResponse, PrepareUploadRequest, PrepareUploadResponse},
    LocalService,
};

const PREPARE_TIMEOUT: Duration = Duration::from_secs(30);
const SCAN_ROUND: Duration = Duration::from_secs(3);
const SCAN_PAUSE: Duration = Duration::from_millis(500);

/// Maps a peer's answer onto the error taxonomy.
fn check_status(response: &Response) -> Result<()> {
    match response.status().as_u16() {
        200 => Ok(()),
        401 => Err(LocalSendError::InvalidPin),
        409 => Err(LocalSendError::SessionBlocked),
        404 => Err(LocalSendError::SessionNotFound),
        403 => Err(LocalSendError::InvalidToken),
        status => Err(LocalSendError::UnexpectedStatus(status)),
    }
}

impl LocalService {
    /// Sends one file to `device`, using our own configured PIN if any.
    /// Returns the session id the peer assigned.
    pub async fn send_file(&self, device: &Device, path: impl AsRef<Path>) -> Result<String> {
        let pin = self.config.pin.clone();
        self.send_files(device, &[path.as_ref().to_path_buf()], pin.as_deref())
            .await
    }

    /// Negotiates one upload session for all of `paths` and uploads them in
    /// order. Files the peer issued no token for are skipped. If an upload
    /// fails the session is cancelled on the peer before returning the error.
    pub async fn send_files(
        &self,
        device: &Device,
        paths: &[PathBuf],
        pin: Option<&str>,
    ) -> Result<String> {
        let mut files = BTreeMap::new();
        let mut sources = BTreeMap::new();
        for path in paths {
            let file = FileMetadata::from_path(path)?;
            sources.insert(file.id.clone(), path.clone());
            files.insert(file.id.clone(), file);
        }

        let prepared = self.prepare_upload(device, files.clone(), pin).await?;
        let session_id = prepared.session_id;
        info!(
            "sending {} file(s) to {} in session {session_id}",
            prepared.files.len(),
            device.alias
        );

        for (file_id, path) in &sources {
            let Some(token) = prepared.files.get(file_id) else {
                debug!("{} declined {file_id}, skipping", device.alias);
                continue;
            };

            if let Err(e) = self.upload(device, &session_id, file_id, token, path).await {
                warn!("upload of {path:?} failed: {e}");
                if let Err(cancel) = self.cancel_transfer(device, &session_id).await {
                    debug!("could not cancel session {session_id}: {cancel}");
                }
                return Err(e);
            }
            info!("sent {path:?} to {}", device.alias);
        }

        Ok(session_id)
    }

    async fn prepare_upload(
        &self,
        device: &Device,
        files: BTreeMap<String, FileMetadata>,
        pin: Option<&str>,
    ) -> Result<PrepareUploadResponse> {
        let mut request = self
            .client()
            .post(format!("{}/prepare-upload", device.api_url()))
            .json(&PrepareUploadRequest {
                info: self.info(),
                files,
            })
            .timeout(PREPARE_TIMEOUT);
        if let Some(pin) = pin {
            request = request.query(&[("pin", pin)]);
        }

        debug!("preparing upload to {}", device.addr());
        let response = request.send().await?;
        check_status(&response)?;
        Ok(response.json().await?)
    }

    async fn upload(
        &self,
        device: &Device,
        session_id: &str,
        file_id: &str,
        token: &str,
        path: &Path,
    ) -> Result<()> {
        let file = tokio::fs::File::open(path).await?;
        let response = self
            .client()
            .post(format!("{}/upload", device.api_url()))
            .query(&[("sessionId", session_id), ("fileId", file_id), ("token", token)])
            .header(reqwest::header::CONTENT_TYPE, "application/octet-stream")
            .body(Body::wrap_stream(ReaderStream::new(file)))
            .send()
            .await?;

        check_status(&response).map_err(|e| match e {
            LocalSendError::UnexpectedStatus(_) => LocalSendError::UploadFailed,
            e => e,
        })
    }

    /// Asks `device` to drop the session with `session_id`.
    pub async fn cancel_transfer(&self, device: &Device, session_id: &str) -> Result<()> {
        let response = self
            .client()
            .post(format!("{}/cancel", device.api_url()))
            .query(&[("sessionId", session_id)])
            .send()
            .await?;

        match check_status(&response) {
            Ok(()) => Ok(()),
            Err(LocalSendError::SessionNotFound) => Err(LocalSendError::SessionNotFound),
            Err(_) => Err(LocalSendError::CancelFailed),
        }
    }

    /// Repeats HTTP scans of `ips` until a device called `alias` answers or
    /// `timeout` runs out.
    pub async fn find_device(
        &self,
        alias: &str,
        ips: &[IpAddr],
        port: u16,
        timeout: Duration,
    ) -> Result<Device> {
        info!("searching for {alias}");
        let deadline = tokio::time::Instant::now() + timeout;

        loop {
            let remaining = deadline.saturating_duration_since(tokio::time::Instant::now());
            if remaining.is_zero() {
                return Err(LocalSendError::PeerNotFound);
            }

            let devices = self.scan(ips, port, remaining.min(SCAN_ROUND)).await;
            if let Some(device) = devices.into_iter().find(|d| d.alias == alias) {
                info!("found {alias} at {}", device.addr());
                return Ok(device);
            }

            debug!("{alias} not found in this round, retrying");
            tokio::time::sleep(SCAN_PAUSE.min(remaining)).await;
        }
    }

    /// Pulls every file `device` shares into our sink. The download session
    /// is released on the peer afterwards.
    pub async fn download_files(
        &self,
        device: &Device,
        pin: Option<&str>,
    ) -> Result<Vec<FileMetadata>> {
        let mut request = self
            .client()
            .post(format!("{}/prepare-download", device.api_url()))
            .timeout(PREPARE_TIMEOUT);
        if let Some(pin) = pin {
            request = request.query(&[("pin", pin)]);
        }

        let response = request.send().await?;
        check_status(&response)?;
        let prepared: PrepareDownloadResponse = response.json().await?;
        info!(
            "downloading {} file(s) from {}",
            prepared.files.len(),
            prepared.info.alias
        );

        let result = self.download_session(device, &prepared).await;
        if let Err(e) = self.cancel_transfer(device, &prepared.session_id).await {
            debug!("could not release download session: {e}");
        }
        result
    }

    async fn download_session(
        &self,
        device: &Device,
        prepared: &PrepareDownloadResponse,
    ) -> Result<Vec<FileMetadata>> {
        let mut received = Vec::with_capacity(prepared.files.len());
        for (file_id, file) in &prepared.files {
            let response = self
                .client()
                .get(format!("{}/download", device.api_url()))
                .query(&[("sessionId", prepared.session_id.as_str()), ("fileId", file_id.as_str())])
                .send()
                .await?;
            check_status(&response)?;

            let body = response
                .bytes_stream()
                .map_err(std::io::Error::other)
                .boxed();
            let name = file.file_name.clone();
            let written = self
                .sink()
                .save(file, body, &move |n: u64| log::trace!("{name}: {n} bytes"))
                .await?;
            debug!("downloaded {} ({written} bytes)", file.file_name);
            received.push(file.clone());
        }
        Ok(received)
    }
}
