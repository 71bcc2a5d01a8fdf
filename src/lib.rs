pub mod config;
pub mod discovery;
pub mod error;
pub mod models;
pub mod server;
pub mod storage;
pub mod transfer;

use std::{
    collections::BTreeMap,
    net::{IpAddr, Ipv4Addr},
    path::PathBuf,
    sync::Arc,
    time::Duration,
};

use config::{Config, SecurityContext};
use discovery::{Device, DiscoveryService, HttpProber};
use error::Result;
use models::{DiscoveryMessage, FileMetadata, InfoDto};
use storage::{DiskSink, FileSink};
use tokio::{sync::RwLock, task::JoinHandle};
use tokio_util::sync::CancellationToken;
use transfer::{ReceiveSessions, SendSessions, SharedFile};

pub const DEFAULT_PORT: u16 = 53317;
pub const MULTICAST_IP: Ipv4Addr = Ipv4Addr::new(224, 0, 0, 167);
pub const API_V1: &str = "/api/localsend/v1";
pub const API_V2: &str = "/api/localsend/v2";

/// Files exposed through `prepare-download`, keyed by file id.
pub type SharedFiles = Arc<RwLock<BTreeMap<String, SharedFile>>>;

/// One local device: discovery, both session roles and the HTTP server, all
/// sharing the same configuration and identity. Cheap to clone.
#[derive(Clone)]
pub struct LocalService {
    pub config: Arc<Config>,
    security: Arc<SecurityContext>,
    pub discovery: DiscoveryService,
    prober: HttpProber,
    pub receive_sessions: ReceiveSessions,
    pub send_sessions: SendSessions,
    sink: Arc<dyn FileSink>,
    shared_files: SharedFiles,
    client: reqwest::Client,
    cancel: CancellationToken,
}

impl LocalService {
    pub async fn new(config: Config, security: SecurityContext) -> Result<Self> {
        let discovery_config = config.discovery_config();
        let local = config.discovery_message(&security.fingerprint, true);
        let discovery = DiscoveryService::new(discovery_config.clone(), local).await?;
        let prober = HttpProber::new(
            discovery_config.probe_timeout,
            Some(security.fingerprint.clone()),
        )?;

        let client = reqwest::Client::builder()
            // peers use self-signed certificates
            .danger_accept_invalid_certs(true)
            .connect_timeout(Duration::from_secs(10))
            .build()?;

        Ok(Self {
            sink: Arc::new(DiskSink::new(config.download_dir.clone())),
            config: Arc::new(config),
            security: Arc::new(security),
            discovery,
            prober,
            receive_sessions: ReceiveSessions::new(),
            send_sessions: SendSessions::new(),
            shared_files: Default::default(),
            client,
            cancel: CancellationToken::new(),
        })
    }

    /// Replaces where received files are written.
    pub fn with_sink(mut self, sink: Arc<dyn FileSink>) -> Self {
        self.sink = sink;
        self
    }

    pub fn fingerprint(&self) -> &str {
        &self.security.fingerprint
    }

    pub fn security(&self) -> &SecurityContext {
        &self.security
    }

    pub fn prober(&self) -> &HttpProber {
        &self.prober
    }

    pub(crate) fn sink(&self) -> &dyn FileSink {
        self.sink.as_ref()
    }

    pub(crate) fn client(&self) -> &reqwest::Client {
        &self.client
    }

    pub fn discovery_message(&self) -> DiscoveryMessage {
        self.config.discovery_message(self.fingerprint(), true)
    }

    pub fn info(&self) -> InfoDto {
        self.discovery_message().to_info()
    }

    /// Starts multicast discovery and spawns the HTTP server. Everything runs
    /// until [`stop`](Self::stop) is called.
    pub async fn start(&self) -> Result<JoinHandle<()>> {
        self.discovery
            .start(&self.cancel, self.discovery_message())
            .await?;

        let service = self.clone();
        Ok(tokio::spawn(async move {
            if let Err(e) = service.start_http_server().await {
                log::error!("HTTP server error: {e}");
            }
        }))
    }

    pub async fn stop(&self) {
        log::info!("shutting down local service");
        self.cancel.cancel();
        self.discovery.stop().await;
    }

    pub fn cancellation(&self) -> &CancellationToken {
        &self.cancel
    }

    /// Probes `ips` over HTTP and records every device that answered in the
    /// registry.
    pub async fn scan(&self, ips: &[IpAddr], port: u16, within: Duration) -> Vec<Device> {
        let devices = self.prober.scan(ips, port, within).await;
        for device in &devices {
            self.discovery.registry().upsert(device.clone()).await;
        }
        devices
    }

    /// [`scan`](Self::scan) over every host of our local subnets, on our own
    /// port.
    pub async fn scan_local(&self, within: Duration) -> Result<Vec<Device>> {
        let ips = discovery::http::local_candidates()?;
        Ok(self.scan(&ips, self.config.port, within).await)
    }

    /// Introduces this device to the peer at `ip:port` through its
    /// `/register` endpoint, and records the peer from its answer.
    pub async fn register_with(&self, ip: IpAddr, port: u16) -> Result<Device> {
        let device = self
            .prober
            .register(ip, port, &self.discovery_message())
            .await?;
        self.discovery.registry().upsert(device.clone()).await;
        Ok(device)
    }

    /// Makes `paths` available to peers through `prepare-download`,
    /// replacing whatever was shared before.
    pub async fn share_files(&self, paths: Vec<PathBuf>) -> Result<Vec<FileMetadata>> {
        let mut shared = BTreeMap::new();
        for path in paths {
            // hashing large files should not stall the runtime
            let (file, path) = tokio::task::spawn_blocking(move || {
                FileMetadata::from_path(&path).map(|file| (file, path))
            })
            .await??;
            shared.insert(file.id.clone(), SharedFile { file, path });
        }

        let files = shared.values().map(|s| s.file.clone()).collect();
        *self.shared_files.write().await = shared;
        Ok(files)
    }

    /// Withdraws all shared files and ends any download session.
    pub async fn stop_sharing(&self) {
        self.shared_files.write().await.clear();
        self.send_sessions.close_session().await;
    }

    pub async fn shared_files(&self) -> BTreeMap<String, SharedFile> {
        self.shared_files.read().await.clone()
    }
}
