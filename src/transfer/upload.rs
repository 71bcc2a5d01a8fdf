use std::net::SocketAddr;

use axum::{
    body::{Body, Bytes},
    extract::{ConnectInfo, Query, State},
    http::StatusCode,
    Json,
};
use futures::StreamExt;
use log::{error, info, trace, warn};
use serde::Deserialize;

use super::{required, PinParams};
use crate::{
    error::{LocalSendError, Result},
    models::{PrepareUploadRequest, PrepareUploadResponse},
    LocalService,
};

/// `POST /prepare-upload`
///
/// Incoming requests are always accepted once the PIN checks out; there is no
/// confirmation step.
pub async fn handle_prepare_upload(
    State(service): State<LocalService>,
    ConnectInfo(addr): ConnectInfo<SocketAddr>,
    Query(params): Query<PinParams>,
    body: Bytes,
) -> Result<Json<PrepareUploadResponse>> {
    service.check_pin(params.pin.as_deref())?;

    if service.receive_sessions.is_active().await {
        return Err(LocalSendError::SessionBlocked);
    }

    let request: PrepareUploadRequest = serde_json::from_slice(&body)?;
    info!(
        "Received upload request from {} at {addr} ({} file(s))",
        request.info.alias,
        request.files.len()
    );

    let session = service
        .receive_sessions
        .create_session(request.info, addr.ip(), request.files)
        .await?;

    let files = session
        .files
        .iter()
        .map(|(id, active)| (id.clone(), active.token.clone()))
        .collect();

    Ok(Json(PrepareUploadResponse {
        session_id: session.session_id,
        files,
    }))
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UploadParams {
    session_id: Option<String>,
    file_id: Option<String>,
    token: Option<String>,
}

/// `POST /upload?sessionId&fileId&token`
///
/// Streams the body into the sink. The file is claimed for the duration, so a
/// token cannot carry two uploads at once. If the sink fails the claim is
/// released and the sender may try again with the same token.
pub async fn handle_upload(
    State(service): State<LocalService>,
    ConnectInfo(addr): ConnectInfo<SocketAddr>,
    Query(params): Query<UploadParams>,
    body: Body,
) -> Result<StatusCode> {
    let session_id = required(&params.session_id, "sessionId")?;
    let file_id = required(&params.file_id, "fileId")?;
    let token = required(&params.token, "token")?;

    let claim = service
        .receive_sessions
        .claim_file(session_id, addr.ip(), file_id, token)
        .await?;

    let stream = body
        .into_data_stream()
        .map(|chunk| chunk.map_err(std::io::Error::other))
        .boxed();

    let name = claim.file.file_name.clone();
    let size = claim.file.size;
    let saved = service
        .sink()
        .save(&claim.file, stream, &move |n: u64| {
            trace!("{name}: {n}/{size} bytes")
        })
        .await;

    let written = match saved {
        Ok(written) => written,
        Err(e) => {
            error!("could not save {}: {e}", claim.file.file_name);
            claim.release().await;
            return Err(LocalSendError::UploadFailed);
        }
    };

    info!(
        "received {} ({written} bytes) from {}",
        claim.file.file_name, claim.sender.alias
    );
    if !claim.complete().await {
        warn!("session {session_id} ended while the file was being received");
        return Err(LocalSendError::InvalidSession);
    }

    Ok(StatusCode::OK)
}
