use std::{
    net::{IpAddr, Ipv4Addr, SocketAddr},
    time::Duration,
};

use axum::{
    body::Bytes,
    extract::{ConnectInfo, Query, State},
    Json,
};
use log::{debug, info};
use network_interface::{Addr, NetworkInterface, NetworkInterfaceConfig, V4IfAddr};
use serde::Deserialize;
use tokio::task::JoinSet;

use super::Device;
use crate::{
    error::{LocalSendError, Result},
    models::{DiscoveryMessage, InfoDto, Protocol},
    LocalService, API_V2,
};

/// Active discovery: asks candidate addresses for their `/info` directly, for
/// networks where multicast is blocked or slow.
#[derive(Clone, Debug)]
pub struct HttpProber {
    client: reqwest::Client,
    local_fingerprint: Option<String>,
}

impl HttpProber {
    /// `local_fingerprint` is sent along with every probe so that our own
    /// server answers 412 instead of being listed as a peer.
    pub fn new(timeout: Duration, local_fingerprint: Option<String>) -> Result<Self> {
        let client = reqwest::Client::builder()
            // discovery does not establish trust, the fingerprint does
            .danger_accept_invalid_certs(true)
            .timeout(timeout)
            .build()?;
        Ok(Self {
            client,
            local_fingerprint,
        })
    }

    /// Fetches the peer's info over HTTPS, falling back to plain HTTP on any
    /// failure.
    pub async fn fetch_info(&self, ip: IpAddr, port: u16) -> Result<Device> {
        self.exchange(ip, port, None).await
    }

    /// Announces `local` to the peer's `/register` endpoint and returns the
    /// peer as described by its answer. Same scheme fallback as
    /// [`fetch_info`](Self::fetch_info).
    pub async fn register(
        &self,
        ip: IpAddr,
        port: u16,
        local: &DiscoveryMessage,
    ) -> Result<Device> {
        self.exchange(ip, port, Some(local)).await
    }

    async fn exchange(
        &self,
        ip: IpAddr,
        port: u16,
        register: Option<&DiscoveryMessage>,
    ) -> Result<Device> {
        match self.exchange_with(ip, port, Protocol::Https, register).await {
            Ok(device) => Ok(device),
            Err(LocalSendError::SelfDiscovered) => Err(LocalSendError::SelfDiscovered),
            Err(e) => {
                debug!("https request to {ip}:{port} failed: {e}");
                self.exchange_with(ip, port, Protocol::Http, register).await
            }
        }
    }

    async fn exchange_with(
        &self,
        ip: IpAddr,
        port: u16,
        protocol: Protocol,
        register: Option<&DiscoveryMessage>,
    ) -> Result<Device> {
        let base = format!("{protocol}://{}{API_V2}", SocketAddr::new(ip, port));
        let request = match register {
            Some(local) => self.client.post(format!("{base}/register")).json(local),
            None => {
                let request = self.client.get(format!("{base}/info"));
                match &self.local_fingerprint {
                    Some(fingerprint) => request.query(&[("fingerprint", fingerprint)]),
                    None => request,
                }
            }
        };

        let response = request.send().await?;
        match response.status().as_u16() {
            200 => {}
            412 => return Err(LocalSendError::SelfDiscovered),
            status => return Err(LocalSendError::UnexpectedStatus(status)),
        }

        let info: InfoDto = response.json().await?;
        Ok(Device::from_info(&info, ip, port, protocol))
    }

    /// Probes every address concurrently and returns the devices that
    /// answered. Individual failures are skipped; once `within` has elapsed
    /// the probes still running are abandoned and whatever answered so far is
    /// returned.
    pub async fn scan(&self, ips: &[IpAddr], port: u16, within: Duration) -> Vec<Device> {
        let deadline = tokio::time::Instant::now() + within;
        let mut probes = JoinSet::new();
        for &ip in ips {
            let prober = self.clone();
            probes.spawn(async move { prober.fetch_info(ip, port).await });
        }

        debug!("scanning {} addresses on port {port}", ips.len());
        let mut devices = Vec::new();
        loop {
            tokio::select! {
                next = probes.join_next() => match next {
                    None => break,
                    Some(Ok(Ok(device))) => devices.push(device),
                    Some(Ok(Err(e))) => debug!("probe failed: {e}"),
                    Some(Err(e)) => debug!("probe task failed: {e}"),
                },
                _ = tokio::time::sleep_until(deadline) => {
                    debug!("scan deadline reached with {} probes outstanding", probes.len());
                    probes.abort_all();
                    break;
                }
            }
        }

        info!("HTTP scan found {} device(s)", devices.len());
        devices
    }
}

/// Candidate addresses for [`HttpProber::scan`]: every host of the (at most
/// /24) subnet of each non-loopback IPv4 interface, plus loopback.
pub fn local_candidates() -> Result<Vec<IpAddr>> {
    let mut ips = Vec::new();
    for addr in NetworkInterface::show()?.into_iter().flat_map(|i| i.addr) {
        let Addr::V4(V4IfAddr { ip, netmask, .. }) = addr else {
            continue;
        };
        if ip.is_loopback() {
            continue;
        }
        let prefix = netmask.map(|m| m.to_bits().leading_ones()).unwrap_or(24).max(24);
        ips.extend(subnet_hosts(ip, prefix).map(IpAddr::V4));
    }
    ips.push(IpAddr::V4(Ipv4Addr::LOCALHOST));
    ips.sort();
    ips.dedup();
    Ok(ips)
}

fn subnet_hosts(ip: Ipv4Addr, prefix: u32) -> impl Iterator<Item = Ipv4Addr> {
    let mask = u32::MAX.checked_shl(32 - prefix).unwrap_or(0);
    let network = ip.to_bits() & mask;
    let broadcast = network | !mask;
    let (first, last) = if broadcast - network < 2 {
        (network, broadcast)
    } else {
        (network + 1, broadcast - 1)
    };
    (first..=last).map(Ipv4Addr::from_bits)
}

#[derive(Deserialize)]
pub struct InfoParams {
    fingerprint: Option<String>,
}

/// `GET /info`
pub async fn handle_info(
    State(service): State<LocalService>,
    Query(params): Query<InfoParams>,
) -> Result<Json<InfoDto>> {
    if params.fingerprint.as_deref() == Some(service.fingerprint()) {
        debug!("received /info request from self");
        return Err(LocalSendError::SelfDiscovered);
    }
    Ok(Json(service.info().without_address()))
}

/// `POST /register`: a peer answering our announcement over HTTP, or probing
/// us. The peer is recorded in the registry and gets our info back.
pub async fn handle_register(
    State(service): State<LocalService>,
    ConnectInfo(addr): ConnectInfo<SocketAddr>,
    body: Bytes,
) -> Result<Json<InfoDto>> {
    let peer: DiscoveryMessage = serde_json::from_slice(&body)?;
    if peer.fingerprint == service.fingerprint() {
        debug!("received /register request from self");
        return Err(LocalSendError::SelfDiscovered);
    }

    debug!("register request from {} at {addr}", peer.alias);
    service
        .discovery
        .registry()
        .upsert(Device::from_message(&peer, addr.ip()))
        .await;

    Ok(Json(service.info().without_address()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn subnet_hosts_skip_network_and_broadcast() {
        let hosts: Vec<_> = subnet_hosts(Ipv4Addr::new(192, 168, 7, 42), 24).collect();
        assert_eq!(hosts.len(), 254);
        assert_eq!(hosts[0], Ipv4Addr::new(192, 168, 7, 1));
        assert_eq!(hosts[253], Ipv4Addr::new(192, 168, 7, 254));

        let p2p: Vec<_> = subnet_hosts(Ipv4Addr::new(10, 0, 0, 1), 31).collect();
        assert_eq!(p2p, vec![Ipv4Addr::new(10, 0, 0, 0), Ipv4Addr::new(10, 0, 0, 1)]);
    }

    #[tokio::test]
    async fn unreachable_address_fails_on_both_schemes() {
        let prober = HttpProber::new(Duration::from_millis(300), None).unwrap();
        // nothing listens on port 9 of localhost
        let result = prober.fetch_info(IpAddr::V4(Ipv4Addr::LOCALHOST), 9).await;
        assert!(result.is_err());
    }

    #[test]
    fn local_candidates_include_loopback_once() {
        let ips = local_candidates().unwrap();
        assert!(ips.contains(&IpAddr::V4(Ipv4Addr::LOCALHOST)));
        assert_eq!(ips.iter().filter(|ip| ip.is_loopback()).count(), 1);
        assert!(ips.windows(2).all(|w| w[0] < w[1]));
    }

    #[tokio::test]
    async fn scan_of_nothing_is_empty() {
        let prober = HttpProber::new(Duration::from_millis(300), None).unwrap();
        let devices = prober.scan(&[], 53317, Duration::from_secs(1)).await;
        assert!(devices.is_empty());
    }
}
