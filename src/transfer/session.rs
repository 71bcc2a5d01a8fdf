use std::{collections::BTreeMap, net::IpAddr, path::PathBuf, sync::Arc};

use tokio::sync::Mutex;
use uuid::Uuid;

use crate::{
    error::{LocalSendError, Result},
    models::{FileMetadata, InfoDto},
};

/// A file within a receive session, with the token the sender must present to
/// upload it.
#[derive(Debug, Clone, PartialEq)]
pub struct ActiveFile {
    pub file: FileMetadata,
    pub token: String,
    /// Set while an upload of this file is streaming.
    pub receiving: bool,
}

/// Created by `prepare-upload`: a peer pushing files to us.
#[derive(Debug, Clone, PartialEq)]
pub struct ReceiveSession {
    pub session_id: String,
    pub sender: InfoDto,
    pub sender_ip: IpAddr,
    pub files: BTreeMap<String, ActiveFile>,
}

/// A file we expose for download, and where its bytes live.
#[derive(Debug, Clone, PartialEq)]
pub struct SharedFile {
    pub file: FileMetadata,
    pub path: PathBuf,
}

/// Created by `prepare-download`: a peer pulling files from us.
#[derive(Debug, Clone, PartialEq)]
pub struct SendSession {
    pub session_id: String,
    pub files: BTreeMap<String, SharedFile>,
}

pub trait Session: Clone + Send {
    fn session_id(&self) -> &str;
    /// Returns false if there was no such file.
    fn remove_file(&mut self, file_id: &str) -> bool;
    fn is_empty(&self) -> bool;
}

impl Session for ReceiveSession {
    fn session_id(&self) -> &str {
        &self.session_id
    }

    fn remove_file(&mut self, file_id: &str) -> bool {
        self.files.remove(file_id).is_some()
    }

    fn is_empty(&self) -> bool {
        self.files.is_empty()
    }
}

impl Session for SendSession {
    fn session_id(&self) -> &str {
        &self.session_id
    }

    fn remove_file(&mut self, file_id: &str) -> bool {
        self.files.remove(file_id).is_some()
    }

    fn is_empty(&self) -> bool {
        self.files.is_empty()
    }
}

/// Holds the one session allowed per role. There is no queue: while a session
/// is active, creating another fails with [`LocalSendError::SessionBlocked`].
///
/// Each call takes the lock once, so a read followed by a mutation is not
/// atomic. Anything that must check and then change state, such as
/// [`claim_file`](SessionManager::claim_file), is its own operation.
#[derive(Debug)]
pub struct SessionManager<S> {
    current: Arc<Mutex<Option<S>>>,
}

impl<S> Clone for SessionManager<S> {
    fn clone(&self) -> Self {
        Self {
            current: self.current.clone(),
        }
    }
}

impl<S> Default for SessionManager<S> {
    fn default() -> Self {
        Self {
            current: Arc::new(Mutex::new(None)),
        }
    }
}

pub type ReceiveSessions = SessionManager<ReceiveSession>;
pub type SendSessions = SessionManager<SendSession>;

impl<S: Session> SessionManager<S> {
    pub fn new() -> Self {
        Self::default()
    }

    async fn insert_with(&self, build: impl FnOnce(String) -> S) -> Result<S> {
        let mut current = self.current.lock().await;
        if current.is_some() {
            return Err(LocalSendError::SessionBlocked);
        }
        let session = build(Uuid::new_v4().to_string());
        *current = Some(session.clone());
        Ok(session)
    }

    pub async fn get_session(&self) -> Option<S> {
        self.current.lock().await.clone()
    }

    pub async fn get_session_by_id(&self, session_id: &str) -> Option<S> {
        self.current
            .lock()
            .await
            .as_ref()
            .filter(|s| s.session_id() == session_id)
            .cloned()
    }

    pub async fn is_active(&self) -> bool {
        self.current.lock().await.is_some()
    }

    /// Drops one file from the session with this id. The session itself is
    /// closed once its last file is gone.
    pub async fn remove_file(&self, session_id: &str, file_id: &str) -> bool {
        let mut current = self.current.lock().await;
        let Some(session) = current.as_mut().filter(|s| s.session_id() == session_id) else {
            return false;
        };

        let removed = session.remove_file(file_id);
        if session.is_empty() {
            log::info!("session {session_id} complete");
            *current = None;
        }
        removed
    }

    /// Closes the session with this id, if it is the active one.
    pub async fn close_session_by_id(&self, session_id: &str) -> bool {
        let mut current = self.current.lock().await;
        if current.as_ref().is_some_and(|s| s.session_id() == session_id) {
            *current = None;
            true
        } else {
            false
        }
    }

    /// Unconditionally clears the active session.
    pub async fn close_session(&self) {
        *self.current.lock().await = None;
    }
}

impl SessionManager<ReceiveSession> {
    /// Opens a receive session for `files`, issuing a fresh token per file.
    pub async fn create_session(
        &self,
        sender: InfoDto,
        sender_ip: IpAddr,
        files: BTreeMap<String, FileMetadata>,
    ) -> Result<ReceiveSession> {
        if files.is_empty() {
            return Err(LocalSendError::NoFiles);
        }
        self.insert_with(|session_id| ReceiveSession {
            session_id,
            sender,
            sender_ip,
            files: files
                .into_iter()
                .map(|(id, file)| {
                    let token = Uuid::new_v4().to_string();
                    (
                        id,
                        ActiveFile {
                            file,
                            token,
                            receiving: false,
                        },
                    )
                })
                .collect(),
        })
        .await
    }

    /// Checks an upload against the active session and marks the file as
    /// receiving, under a single lock. While claimed, the same token is
    /// refused with [`LocalSendError::InvalidToken`].
    pub async fn claim_file(
        &self,
        session_id: &str,
        sender_ip: IpAddr,
        file_id: &str,
        token: &str,
    ) -> Result<FileClaim> {
        let mut current = self.current.lock().await;
        let session = current
            .as_mut()
            .filter(|s| s.session_id == session_id)
            .ok_or(LocalSendError::InvalidSession)?;

        if session.sender_ip != sender_ip {
            return Err(LocalSendError::IpMismatch(sender_ip));
        }

        let active = session
            .files
            .get_mut(file_id)
            .filter(|f| f.token == token && !f.receiving)
            .ok_or(LocalSendError::InvalidToken)?;
        active.receiving = true;

        Ok(FileClaim {
            sessions: self.clone(),
            session_id: session_id.to_string(),
            file_id: file_id.to_string(),
            sender: session.sender.clone(),
            file: active.file.clone(),
            settled: false,
        })
    }

    /// Makes a claimed file uploadable again.
    pub async fn release_file(&self, session_id: &str, file_id: &str) {
        let mut current = self.current.lock().await;
        if let Some(active) = current
            .as_mut()
            .filter(|s| s.session_id == session_id)
            .and_then(|s| s.files.get_mut(file_id))
        {
            active.receiving = false;
        }
    }
}

/// An upload in progress. Settle it with [`complete`](Self::complete) or
/// [`release`](Self::release); dropping it unsettled releases the file in
/// the background, so a sender whose connection broke can retry.
#[derive(Debug)]
pub struct FileClaim {
    sessions: ReceiveSessions,
    session_id: String,
    file_id: String,
    pub sender: InfoDto,
    pub file: FileMetadata,
    settled: bool,
}

impl FileClaim {
    /// Removes the file from its session. Returns false if the session ended
    /// while the file was being received.
    pub async fn complete(mut self) -> bool {
        self.settled = true;
        self.sessions
            .remove_file(&self.session_id, &self.file_id)
            .await
    }

    pub async fn release(mut self) {
        self.settled = true;
        self.sessions
            .release_file(&self.session_id, &self.file_id)
            .await;
    }
}

impl Drop for FileClaim {
    fn drop(&mut self) {
        if self.settled {
            return;
        }
        let Ok(runtime) = tokio::runtime::Handle::try_current() else {
            return;
        };
        let sessions = self.sessions.clone();
        let session_id = std::mem::take(&mut self.session_id);
        let file_id = std::mem::take(&mut self.file_id);
        runtime.spawn(async move {
            log::debug!("upload of {file_id} abandoned, releasing it");
            sessions.release_file(&session_id, &file_id).await;
        });
    }
}

impl SessionManager<SendSession> {
    /// Opens a send session exposing `files`. No tokens are issued; the
    /// requester only needs the session and file ids.
    pub async fn create_session(&self, files: BTreeMap<String, SharedFile>) -> Result<SendSession> {
        if files.is_empty() {
            return Err(LocalSendError::NoFiles);
        }
        self.insert_with(|session_id| SendSession { session_id, files })
            .await
    }
}
