use axum::{
    body::Body,
    extract::{Query, State},
    http::header,
    response::{IntoResponse, Response},
    Json,
};
use log::info;
use serde::Deserialize;
use tokio_util::io::ReaderStream;

use super::{required, PinParams};
use crate::{
    error::{LocalSendError, Result},
    models::PrepareDownloadResponse,
    LocalService,
};

/// `POST /prepare-download`: opens a send session over the files currently
/// shared.
pub async fn handle_prepare_download(
    State(service): State<LocalService>,
    Query(params): Query<PinParams>,
) -> Result<Json<PrepareDownloadResponse>> {
    service.check_pin(params.pin.as_deref())?;

    let shared = service.shared_files().await;
    if shared.is_empty() {
        return Err(LocalSendError::NoFiles);
    }

    let session = service.send_sessions.create_session(shared).await?;
    info!(
        "download session {} opened for {} file(s)",
        session.session_id,
        session.files.len()
    );

    Ok(Json(PrepareDownloadResponse {
        info: service.info(),
        files: session
            .files
            .iter()
            .map(|(id, shared)| (id.clone(), shared.file.clone()))
            .collect(),
        session_id: session.session_id,
    }))
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DownloadParams {
    session_id: Option<String>,
    file_id: Option<String>,
}

/// `GET /download?sessionId&fileId`
///
/// Files stay in the session after being served, so a requester can fetch
/// them again until it cancels.
pub async fn handle_download(
    State(service): State<LocalService>,
    Query(params): Query<DownloadParams>,
) -> Result<Response> {
    let session_id = required(&params.session_id, "sessionId")?;
    let file_id = required(&params.file_id, "fileId")?;

    let session = service
        .send_sessions
        .get_session_by_id(session_id)
        .await
        .ok_or(LocalSendError::SessionNotFound)?;
    let shared = session
        .files
        .get(file_id)
        .ok_or(LocalSendError::FileNotFound)?;

    let file = match tokio::fs::File::open(&shared.path).await {
        Ok(file) => file,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
            log::warn!("shared file {:?} has disappeared", shared.path);
            return Err(LocalSendError::FileNotFound);
        }
        Err(e) => return Err(e.into()),
    };
    let length = file.metadata().await?.len();

    info!("serving {} ({length} bytes)", shared.file.file_name);
    let disposition = format!(
        "attachment; filename=\"{}\"",
        shared.file.file_name.replace('"', "'")
    );

    Ok((
        [
            (header::CONTENT_DISPOSITION, disposition),
            (header::CONTENT_LENGTH, length.to_string()),
            (header::CONTENT_TYPE, shared.file.file_type.clone()),
        ],
        Body::from_stream(ReaderStream::new(file)),
    )
        .into_response())
}
