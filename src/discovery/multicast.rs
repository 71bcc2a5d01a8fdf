use std::{
    net::{Ipv4Addr, SocketAddr, SocketAddrV4},
    sync::Arc,
    time::Duration,
};

use log::{debug, error, trace, warn};
use tokio::{net::UdpSocket, sync::RwLock, task::JoinHandle};
use tokio_util::sync::CancellationToken;

use super::{registry::short_fingerprint, Device, DeviceRegistry};
use crate::{error::Result, models::DiscoveryMessage};

/// UDP multicast announcer and listener.
///
/// Announcements and responses go out on their own socket, so the listen
/// loop is the only user of the group socket.
#[derive(Clone)]
pub struct MulticastDiscovery {
    multicast_addr: SocketAddrV4,
    listen_timeout: Duration,
    message: Arc<RwLock<DiscoveryMessage>>,
    registry: DeviceRegistry,
    send_socket: Arc<UdpSocket>,
    listening: Arc<RwLock<Option<CancellationToken>>>,
}

impl MulticastDiscovery {
    pub async fn new(
        multicast_addr: SocketAddrV4,
        listen_timeout: Duration,
        message: DiscoveryMessage,
        registry: DeviceRegistry,
    ) -> Result<Self> {
        let send_socket = UdpSocket::bind(SocketAddrV4::new(Ipv4Addr::UNSPECIFIED, 0)).await?;
        send_socket.set_multicast_ttl_v4(255)?;
        send_socket.set_multicast_loop_v4(true)?;

        Ok(Self {
            multicast_addr,
            listen_timeout,
            message: Arc::new(RwLock::new(message)),
            registry,
            send_socket: Arc::new(send_socket),
            listening: Default::default(),
        })
    }

    pub async fn set_message(&self, message: DiscoveryMessage) {
        *self.message.write().await = message;
    }

    pub async fn message(&self) -> DiscoveryMessage {
        self.message.read().await.clone()
    }

    /// Broadcasts this device's message with `announce = true`.
    pub async fn send_announcement(&self) -> Result<()> {
        let msg = self.message().await.with_announce(true);
        self.send_socket
            .send_to(msg.to_json()?.as_bytes(), self.multicast_addr)
            .await?;
        debug!(
            "sent multicast announcement as {} ({}) to {}",
            msg.alias,
            short_fingerprint(&msg.fingerprint),
            self.multicast_addr
        );
        Ok(())
    }

    /// Sends this device's message with `announce = false` straight to `target`.
    pub async fn send_response(&self, target: SocketAddr) -> Result<()> {
        let msg = self.message().await.with_announce(false);
        self.send_socket
            .send_to(msg.to_json()?.as_bytes(), target)
            .await?;
        debug!("sent discovery response to {target}");
        Ok(())
    }

    /// Joins the multicast group and spawns the read loop. Fails only if the
    /// listening socket cannot be bound.
    pub async fn start_listening(&self, cancel: CancellationToken) -> Result<JoinHandle<()>> {
        let socket = bind_multicast(self.multicast_addr)?;

        let token = cancel.child_token();
        if let Some(previous) = self.listening.write().await.replace(token.clone()) {
            previous.cancel();
        }

        log::info!("multicast discovery listening on {}", self.multicast_addr);
        let this = self.clone();
        Ok(tokio::spawn(async move {
            this.listen(socket, token).await;
        }))
    }

    async fn listen(&self, socket: UdpSocket, cancel: CancellationToken) {
        let mut buf = [0; 65536];

        loop {
            tokio::select! {
                _ = cancel.cancelled() => {
                    debug!("stopping multicast listen");
                    break;
                }
                r = tokio::time::timeout(self.listen_timeout, socket.recv_from(&mut buf)) => {
                    match r {
                        // read deadline passed without traffic
                        Err(_) => continue,
                        Ok(Ok((size, src))) => {
                            trace!("received {size} bytes from {src}");
                            self.handle_datagram(&buf[..size], src).await;
                        }
                        Ok(Err(e)) => {
                            error!("Error receiving message: {e}");
                        }
                    }
                }
            }
        }
    }

    /// Processes one datagram: ignores our own messages, records the sender
    /// and, if it was an announcement, answers it.
    pub async fn handle_datagram(&self, data: &[u8], src: SocketAddr) {
        let msg = match serde_json::from_slice::<DiscoveryMessage>(data) {
            Ok(msg) => msg,
            Err(e) => {
                warn!("Received invalid message from {src}: {e}");
                return;
            }
        };

        if msg.fingerprint == self.message.read().await.fingerprint {
            trace!("ignoring self-announcement");
            return;
        }

        self.registry
            .upsert(Device::from_message(&msg, src.ip()))
            .await;

        // responses are never answered, or two peers would reply to each
        // other forever
        if !msg.announce {
            return;
        }

        // the sender's listener is on the group port, not the ephemeral port
        // it announced from
        let target = SocketAddr::new(src.ip(), self.multicast_addr.port());
        if let Err(e) = self.send_response(target).await {
            warn!("Error during multicast response: {e}");
        }
    }

    /// Stops the read loop. Calling it again is a no-op.
    pub async fn stop(&self) {
        if let Some(token) = self.listening.write().await.take() {
            token.cancel();
        }
    }

    pub async fn is_listening(&self) -> bool {
        self.listening
            .read()
            .await
            .as_ref()
            .is_some_and(|t| !t.is_cancelled())
    }
}

fn bind_multicast(addr: SocketAddrV4) -> Result<UdpSocket> {
    let socket = socket2::Socket::new(
        socket2::Domain::IPV4,
        socket2::Type::DGRAM,
        Some(socket2::Protocol::UDP),
    )?;

    socket.set_reuse_address(true)?;
    #[cfg(unix)]
    socket.set_reuse_port(true)?;

    socket.bind(&SocketAddrV4::new(Ipv4Addr::UNSPECIFIED, addr.port()).into())?;
    socket.set_multicast_loop_v4(true)?;
    // without a multicast-capable interface we still get unicast responses
    if let Err(e) = socket.join_multicast_v4(addr.ip(), &Ipv4Addr::UNSPECIFIED) {
        warn!("could not join multicast group {}: {e}", addr.ip());
    }
    socket.set_nonblocking(true)?;

    let std_socket: std::net::UdpSocket = socket.into();
    Ok(UdpSocket::from_std(std_socket)?)
}

#[cfg(test)]
mod tests {
    use std::{
        net::IpAddr,
        sync::atomic::{AtomicBool, Ordering},
    };

    use super::*;
    use crate::discovery::registry::test_message;

    async fn discovery_with_peer_port() -> (MulticastDiscovery, DeviceRegistry, UdpSocket) {
        // stands in for the peer's listener on the group port
        let peer = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let port = peer.local_addr().unwrap().port();

        let registry = DeviceRegistry::new(Duration::from_secs(120));
        let discovery = MulticastDiscovery::new(
            SocketAddrV4::new(crate::MULTICAST_IP, port),
            Duration::from_millis(100),
            test_message("local-fp", "Me"),
            registry.clone(),
        )
        .await
        .unwrap();
        (discovery, registry, peer)
    }

    fn src() -> SocketAddr {
        SocketAddr::new(IpAddr::V4(Ipv4Addr::LOCALHOST), 40000)
    }

    #[tokio::test]
    async fn own_announcements_are_ignored() {
        let (discovery, registry, peer) = discovery_with_peer_port().await;
        let fired = Arc::new(AtomicBool::new(false));
        {
            let fired = fired.clone();
            registry
                .add_handler(Arc::new(move |_: Device| fired.store(true, Ordering::SeqCst)))
                .await;
        }
        let data = test_message("local-fp", "Me").to_json().unwrap();

        discovery.handle_datagram(data.as_bytes(), src()).await;

        assert!(registry.list_fresh().await.is_empty());
        let mut buf = [0; 1024];
        let reply =
            tokio::time::timeout(Duration::from_millis(200), peer.recv_from(&mut buf)).await;
        assert!(reply.is_err(), "no response to ourselves");
        assert!(!fired.load(Ordering::SeqCst), "no handler for ourselves");
    }

    #[tokio::test]
    async fn announcement_is_recorded_and_answered() {
        let (discovery, registry, peer) = discovery_with_peer_port().await;
        let data = test_message("peer-fp", "Phone").to_json().unwrap();

        discovery.handle_datagram(data.as_bytes(), src()).await;

        let device = registry.get("peer-fp").await.unwrap();
        assert_eq!(device.ip, IpAddr::V4(Ipv4Addr::LOCALHOST));
        assert_eq!(device.alias, "Phone");

        let mut buf = [0; 4096];
        let (size, _) = tokio::time::timeout(Duration::from_secs(2), peer.recv_from(&mut buf))
            .await
            .unwrap()
            .unwrap();
        let reply: DiscoveryMessage = serde_json::from_slice(&buf[..size]).unwrap();
        assert_eq!(reply.fingerprint, "local-fp");
        assert!(!reply.announce);
    }

    #[tokio::test]
    async fn responses_are_recorded_but_not_answered() {
        let (discovery, registry, peer) = discovery_with_peer_port().await;
        let data = test_message("peer-fp", "Phone")
            .with_announce(false)
            .to_json()
            .unwrap();

        discovery.handle_datagram(data.as_bytes(), src()).await;

        assert!(registry.get("peer-fp").await.is_some());
        let mut buf = [0; 1024];
        let reply =
            tokio::time::timeout(Duration::from_millis(200), peer.recv_from(&mut buf)).await;
        assert!(reply.is_err());
    }

    #[tokio::test]
    async fn garbage_is_dropped() {
        let (discovery, registry, _peer) = discovery_with_peer_port().await;
        discovery.handle_datagram(b"{not json", src()).await;
        assert!(registry.list_fresh().await.is_empty());
    }

    #[tokio::test]
    async fn listener_receives_unicast_and_stops() {
        let sender = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let port = {
            let tmp = std::net::UdpSocket::bind("0.0.0.0:0").unwrap();
            tmp.local_addr().unwrap().port()
        };
        let registry = DeviceRegistry::new(Duration::from_secs(120));
        let discovery = MulticastDiscovery::new(
            SocketAddrV4::new(crate::MULTICAST_IP, port),
            Duration::from_millis(50),
            test_message("local-fp", "Me"),
            registry.clone(),
        )
        .await
        .unwrap();

        let cancel = CancellationToken::new();
        let handle = discovery.start_listening(cancel.clone()).await.unwrap();
        assert!(discovery.is_listening().await);

        let data = test_message("peer-fp", "Phone").with_announce(false).to_json().unwrap();
        sender
            .send_to(data.as_bytes(), ("127.0.0.1", port))
            .await
            .unwrap();

        tokio::time::timeout(Duration::from_secs(2), async {
            while registry.get("peer-fp").await.is_none() {
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        })
        .await
        .unwrap();

        discovery.stop().await;
        discovery.stop().await;
        tokio::time::timeout(Duration::from_secs(1), handle)
            .await
            .unwrap()
            .unwrap();
        assert!(!discovery.is_listening().await);
    }
}
