//! Session-gated file transfer in both directions: peers pushing files to us
//! (`prepare-upload`/`upload`) and peers pulling files we share
//! (`prepare-download`/`download`).

use axum::{
    extract::{Query, State},
    http::StatusCode,
};
use serde::Deserialize;

use crate::{
    error::{LocalSendError, Result},
    LocalService,
};

pub mod download;
pub mod send;
pub mod session;
pub mod upload;

pub use session::{
    ActiveFile, FileClaim, ReceiveSession, ReceiveSessions, SendSession, SendSessions,
    SessionManager, SharedFile,
};

#[derive(Debug, Default, Deserialize)]
pub struct PinParams {
    pin: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CancelParams {
    session_id: Option<String>,
}

/// Turns an absent or empty query value into a 400.
pub(crate) fn required<'a>(value: &'a Option<String>, name: &'static str) -> Result<&'a str> {
    value
        .as_deref()
        .filter(|v| !v.is_empty())
        .ok_or(LocalSendError::MissingParameter(name))
}

impl LocalService {
    /// Passes if no PIN is configured, or if `pin` matches it.
    pub(crate) fn check_pin(&self, pin: Option<&str>) -> Result<()> {
        match self.config.pin.as_deref() {
            Some(expected) if !expected.is_empty() && pin != Some(expected) => {
                Err(LocalSendError::InvalidPin)
            }
            _ => Ok(()),
        }
    }
}

/// `POST /cancel?sessionId`: ends whichever of our sessions has this id.
pub async fn handle_cancel(
    State(service): State<LocalService>,
    Query(params): Query<CancelParams>,
) -> Result<StatusCode> {
    let session_id = required(&params.session_id, "sessionId")?;

    if service.receive_sessions.close_session_by_id(session_id).await {
        log::info!("sender cancelled receive session {session_id}");
        return Ok(StatusCode::OK);
    }
    if service.send_sessions.close_session_by_id(session_id).await {
        log::info!("receiver cancelled download session {session_id}");
        return Ok(StatusCode::OK);
    }

    Err(LocalSendError::SessionNotFound)
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::*;
    use crate::{storage::MemorySink, test_util::test_service};

    #[tokio::test]
    async fn pin_is_only_enforced_when_configured() {
        let open = test_service(None, Arc::new(MemorySink::default())).await;
        assert!(open.check_pin(None).is_ok());
        assert!(open.check_pin(Some("anything")).is_ok());

        let locked = test_service(Some("1234"), Arc::new(MemorySink::default())).await;
        assert!(matches!(locked.check_pin(None), Err(LocalSendError::InvalidPin)));
        assert!(matches!(locked.check_pin(Some("4321")), Err(LocalSendError::InvalidPin)));
        assert!(locked.check_pin(Some("1234")).is_ok());
    }

    #[tokio::test]
    async fn cancel_closes_only_the_matching_session() {
        use std::{collections::BTreeMap, net::Ipv4Addr};

        use axum::{body::Body, http::Request};
        use tower::ServiceExt;

        use crate::{models::FileMetadata, API_V2};

        let service = test_service(None, Arc::new(MemorySink::default())).await;
        let file = FileMetadata {
            id: "f1".into(),
            file_name: "a.txt".into(),
            size: 1,
            file_type: "text/plain".into(),
            sha256: None,
            preview: None,
            metadata: None,
        };
        let session = service
            .receive_sessions
            .create_session(
                service.info(),
                Ipv4Addr::LOCALHOST.into(),
                BTreeMap::from([("f1".to_string(), file)]),
            )
            .await
            .unwrap();

        let cancel = |query: String| {
            Request::post(format!("{API_V2}/cancel{query}"))
                .body(Body::empty())
                .unwrap()
        };

        let router = service.router();
        let response = router.clone().oneshot(cancel(String::new())).await.unwrap();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);

        let response = router
            .clone()
            .oneshot(cancel("?sessionId=unknown".into()))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
        assert!(service.receive_sessions.is_active().await);

        let response = router
            .oneshot(cancel(format!("?sessionId={}", session.session_id)))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        assert!(!service.receive_sessions.is_active().await);
    }

    #[test]
    fn empty_parameters_count_as_missing() {
        assert_eq!(required(&Some("abc".into()), "sessionId").unwrap(), "abc");
        assert!(matches!(
            required(&Some(String::new()), "sessionId"),
            Err(LocalSendError::MissingParameter("sessionId"))
        ));
        assert!(required(&None, "token").is_err());
    }
}
