//! Finding peers: multicast announce/listen, HTTP probing, and the registry
//! both feed.

use std::{net::SocketAddrV4, sync::Arc, time::Duration};

use log::{debug, error, info};
use tokio::{sync::Mutex, task::JoinHandle};
use tokio_util::sync::CancellationToken;

use crate::{error::Result, models::DiscoveryMessage, DEFAULT_PORT, MULTICAST_IP};

pub mod http;
pub mod multicast;
pub mod registry;

pub use http::HttpProber;
pub use multicast::MulticastDiscovery;
pub use registry::{Device, DeviceHandler, DeviceRegistry};

#[derive(Debug, Clone, PartialEq)]
pub struct DiscoveryConfig {
    pub multicast_addr: SocketAddrV4,
    pub announce_interval: Duration,
    pub device_timeout: Duration,
    pub enable_announcement: bool,
    /// Read deadline of the multicast loop, which bounds how long it takes to
    /// notice cancellation.
    pub listen_timeout: Duration,
    pub probe_timeout: Duration,
}

impl Default for DiscoveryConfig {
    fn default() -> Self {
        Self {
            multicast_addr: SocketAddrV4::new(MULTICAST_IP, DEFAULT_PORT),
            announce_interval: Duration::from_secs(30),
            device_timeout: Duration::from_secs(120),
            enable_announcement: true,
            listen_timeout: Duration::from_secs(5),
            probe_timeout: Duration::from_secs(2),
        }
    }
}

/// Owns the device registry and drives multicast discovery on top of it.
#[derive(Clone)]
pub struct DiscoveryService {
    config: DiscoveryConfig,
    registry: DeviceRegistry,
    multicast: MulticastDiscovery,
    running: Arc<Mutex<Option<CancellationToken>>>,
}

impl DiscoveryService {
    pub async fn new(config: DiscoveryConfig, local: DiscoveryMessage) -> Result<Self> {
        let registry = DeviceRegistry::new(config.device_timeout);
        let multicast = MulticastDiscovery::new(
            config.multicast_addr,
            config.listen_timeout,
            local,
            registry.clone(),
        )
        .await?;

        Ok(Self {
            config,
            registry,
            multicast,
            running: Default::default(),
        })
    }

    pub fn registry(&self) -> &DeviceRegistry {
        &self.registry
    }

    pub fn multicast(&self) -> &MulticastDiscovery {
        &self.multicast
    }

    pub fn config(&self) -> &DiscoveryConfig {
        &self.config
    }

    /// Starts listening, announces once and, if enabled, keeps re-announcing
    /// every `announce_interval` until `cancel` fires or [`stop`] is called.
    ///
    /// Only failing to acquire the listening socket is an error.
    ///
    /// [`stop`]: DiscoveryService::stop
    pub async fn start(&self, cancel: &CancellationToken, local: DiscoveryMessage) -> Result<()> {
        let token = cancel.child_token();
        self.multicast.set_message(local).await;
        self.multicast.start_listening(token.clone()).await?;

        if let Some(previous) = self.running.lock().await.replace(token.clone()) {
            previous.cancel();
        }

        if let Err(e) = self.multicast.send_announcement().await {
            error!("failed to send initial announcement: {e}");
        }

        if self.config.enable_announcement {
            self.spawn_announcer(token);
        }

        Ok(())
    }

    /// Re-announces every `announce_interval` until `token` is cancelled. The
    /// first announcement is left to the caller.
    fn spawn_announcer(&self, token: CancellationToken) -> JoinHandle<()> {
        let multicast = self.multicast.clone();
        let interval = self.config.announce_interval;
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            // the first tick is immediate
            ticker.tick().await;
            loop {
                tokio::select! {
                    _ = token.cancelled() => break,
                    _ = ticker.tick() => {
                        if let Err(e) = multicast.send_announcement().await {
                            error!("failed to send periodic announcement: {e}");
                        }
                    }
                }
            }
            debug!("announcement loop stopped");
        })
    }

    /// One-shot scan: announces, then waits until `within` has elapsed and
    /// returns every fresh device known at that point. Finding nothing is not
    /// an error.
    ///
    /// Responses only arrive here if a listener is running ([`start`]) or
    /// another mechanism, such as the `/register` endpoint or an HTTP scan,
    /// feeds the same registry.
    ///
    /// [`start`]: DiscoveryService::start
    pub async fn discover(&self, local: DiscoveryMessage, within: Duration) -> Vec<Device> {
        info!("performing one-off discovery scan");
        self.multicast.set_message(local).await;
        if let Err(e) = self.multicast.send_announcement().await {
            error!("failed to send discovery announcement: {e}");
        }

        let deadline = tokio::time::sleep(within);
        tokio::pin!(deadline);
        loop {
            tokio::select! {
                _ = &mut deadline => break,
                _ = self.registry.device_added() => {
                    debug!("discovery scan progress: {} device(s) found so far",
                        self.registry.list_fresh().await.len());
                }
            }
        }

        let devices = self.registry.list_fresh().await;
        info!("discovery scan finished, {} device(s) found", devices.len());
        devices
    }

    /// Stops listening and the announcement loop. Calling it again is a no-op.
    pub async fn stop(&self) {
        if let Some(token) = self.running.lock().await.take() {
            info!("stopping discovery service");
            token.cancel();
        }
        self.multicast.stop().await;
    }

    pub async fn add_device_handler<F>(&self, handler: F)
    where
        F: Fn(Device) + Send + Sync + 'static,
    {
        self.registry.add_handler(Arc::new(handler)).await;
    }

    pub async fn devices(&self) -> Vec<Device> {
        self.registry.list_fresh().await
    }
}

#[cfg(test)]
mod tests {
    use std::net::{IpAddr, Ipv4Addr};

    use tokio::{net::UdpSocket, sync::mpsc};

    use super::*;
    use crate::discovery::registry::test_message;

    fn free_udp_port() -> u16 {
        std::net::UdpSocket::bind("0.0.0.0:0")
            .unwrap()
            .local_addr()
            .unwrap()
            .port()
    }

    fn test_config(port: u16) -> DiscoveryConfig {
        DiscoveryConfig {
            multicast_addr: SocketAddrV4::new(MULTICAST_IP, port),
            listen_timeout: Duration::from_millis(50),
            announce_interval: Duration::from_millis(100),
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn discover_returns_devices_seen_before_deadline() {
        let service = DiscoveryService::new(test_config(free_udp_port()), test_message("me", "Me"))
            .await
            .unwrap();

        let registry = service.registry().clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(50)).await;
            registry
                .upsert(Device::from_message(
                    &test_message("peer", "Phone"),
                    IpAddr::V4(Ipv4Addr::new(10, 0, 0, 2)),
                ))
                .await;
        });

        let started = tokio::time::Instant::now();
        let devices = service
            .discover(test_message("me", "Me"), Duration::from_millis(300))
            .await;
        assert!(started.elapsed() >= Duration::from_millis(300));
        assert_eq!(devices.len(), 1);
        assert_eq!(devices[0].fingerprint, "peer");
    }

    #[tokio::test]
    async fn discover_with_nobody_around_is_empty() {
        let service = DiscoveryService::new(test_config(free_udp_port()), test_message("me", "Me"))
            .await
            .unwrap();
        let devices = service
            .discover(test_message("me", "Me"), Duration::from_millis(100))
            .await;
        assert!(devices.is_empty());
    }

    #[tokio::test]
    async fn started_service_records_peers_and_notifies_handlers() {
        let port = free_udp_port();
        let service = DiscoveryService::new(test_config(port), test_message("me", "Me"))
            .await
            .unwrap();
        let (tx, mut rx) = mpsc::unbounded_channel();
        service
            .add_device_handler(move |d| {
                let _ = tx.send(d.alias);
            })
            .await;

        let cancel = CancellationToken::new();
        service.start(&cancel, test_message("me", "Me")).await.unwrap();

        let peer = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let msg = test_message("peer", "Phone").with_announce(false).to_json().unwrap();
        peer.send_to(msg.as_bytes(), ("127.0.0.1", port)).await.unwrap();

        let alias = tokio::time::timeout(Duration::from_secs(2), rx.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(alias, "Phone");
        assert_eq!(service.devices().await.len(), 1);

        service.stop().await;
        service.stop().await;
        assert!(!service.multicast().is_listening().await);
    }

    #[tokio::test]
    async fn announcements_repeat_until_stopped() {
        // announcements go to this socket instead of the group
        let receiver = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let config = DiscoveryConfig {
            multicast_addr: SocketAddrV4::new(
                Ipv4Addr::LOCALHOST,
                receiver.local_addr().unwrap().port(),
            ),
            ..test_config(0)
        };
        let service = DiscoveryService::new(config, test_message("me", "Me"))
            .await
            .unwrap();

        // registered the way `start` does, so `stop` reaches it
        let token = CancellationToken::new();
        *service.running.lock().await = Some(token.clone());
        let announcer = service.spawn_announcer(token);

        let mut buf = [0; 4096];
        for _ in 0..2 {
            let (size, _) =
                tokio::time::timeout(Duration::from_secs(2), receiver.recv_from(&mut buf))
                    .await
                    .unwrap()
                    .unwrap();
            let msg: DiscoveryMessage = serde_json::from_slice(&buf[..size]).unwrap();
            assert!(msg.announce);
            assert_eq!(msg.fingerprint, "me");
        }

        service.stop().await;
        tokio::time::timeout(Duration::from_secs(1), announcer)
            .await
            .unwrap()
            .unwrap();

        // drain anything sent before the loop noticed
        while let Ok(Ok(_)) =
            tokio::time::timeout(Duration::from_millis(20), receiver.recv_from(&mut buf)).await
        {}
        let silent =
            tokio::time::timeout(Duration::from_millis(300), receiver.recv_from(&mut buf)).await;
        assert!(silent.is_err(), "no announcements after stop");
    }

    #[tokio::test]
    async fn cancelling_the_parent_token_stops_listening() {
        let service = DiscoveryService::new(test_config(free_udp_port()), test_message("me", "Me"))
            .await
            .unwrap();
        let cancel = CancellationToken::new();
        service.start(&cancel, test_message("me", "Me")).await.unwrap();
        assert!(service.multicast().is_listening().await);

        cancel.cancel();
        assert!(!service.multicast().is_listening().await);
    }
}
