use std::{
    collections::HashMap,
    net::{IpAddr, SocketAddr},
    sync::Arc,
    time::Duration,
};

use tokio::{
    sync::{Notify, RwLock},
    time::Instant,
};

use crate::models::{DeviceType, DiscoveryMessage, InfoDto, Protocol, PROTOCOL_VERSION};

/// A peer seen on the network, keyed by its fingerprint.
#[derive(Debug, Clone, PartialEq)]
pub struct Device {
    pub ip: IpAddr,
    pub port: u16,
    pub protocol: Protocol,
    pub alias: String,
    pub device_type: DeviceType,
    pub device_model: Option<String>,
    pub version: String,
    pub fingerprint: String,
    pub download: bool,
    pub last_seen: Instant,
    pub available: bool,
}

impl Device {
    pub fn from_message(msg: &DiscoveryMessage, ip: IpAddr) -> Self {
        Self {
            ip,
            port: msg.port,
            protocol: msg.protocol,
            alias: msg.alias.clone(),
            device_type: msg.device_type.unwrap_or(DeviceType::Other),
            device_model: msg.device_model.clone(),
            version: msg.version.clone(),
            fingerprint: msg.fingerprint.clone(),
            download: msg.download,
            last_seen: Instant::now(),
            available: true,
        }
    }

    /// `port` and `protocol` are the ones that answered the probe, not
    /// whatever the info body claims.
    pub fn from_info(info: &InfoDto, ip: IpAddr, port: u16, protocol: Protocol) -> Self {
        Self {
            ip,
            port,
            protocol,
            alias: info.alias.clone(),
            device_type: info.device_type.unwrap_or(DeviceType::Other),
            device_model: info.device_model.clone(),
            version: if info.version.is_empty() {
                PROTOCOL_VERSION.to_string()
            } else {
                info.version.clone()
            },
            fingerprint: info.fingerprint.clone(),
            download: info.download,
            last_seen: Instant::now(),
            available: true,
        }
    }

    pub fn addr(&self) -> SocketAddr {
        SocketAddr::new(self.ip, self.port)
    }

    /// e.g. `https://192.168.1.4:53317/api/localsend/v2`
    pub fn api_url(&self) -> String {
        format!("{}://{}{}", self.protocol, self.addr(), crate::API_V2)
    }

    pub fn is_stale(&self, timeout: Duration) -> bool {
        self.last_seen.elapsed() > timeout
    }

    pub fn short_fingerprint(&self) -> &str {
        short_fingerprint(&self.fingerprint)
    }
}

pub(crate) fn short_fingerprint(fingerprint: &str) -> &str {
    fingerprint.get(..8).unwrap_or(fingerprint)
}

pub type DeviceHandler = Arc<dyn Fn(Device) + Send + Sync>;

/// Every device seen by any discovery mechanism.
///
/// Entries are never removed; a device that has not been refreshed within
/// `device_timeout` is simply filtered out of reads until it is seen again.
#[derive(Clone)]
pub struct DeviceRegistry {
    devices: Arc<RwLock<HashMap<String, Device>>>,
    handlers: Arc<RwLock<Vec<DeviceHandler>>>,
    added: Arc<Notify>,
    device_timeout: Duration,
}

impl DeviceRegistry {
    pub fn new(device_timeout: Duration) -> Self {
        Self {
            devices: Default::default(),
            handlers: Default::default(),
            added: Arc::new(Notify::new()),
            device_timeout,
        }
    }

    pub fn device_timeout(&self) -> Duration {
        self.device_timeout
    }

    /// Registers a callback fired once for every fingerprint the registry had
    /// never seen before. Each call runs on its own task.
    pub async fn add_handler(&self, handler: DeviceHandler) {
        self.handlers.write().await.push(handler);
    }

    /// Inserts `device`, or refreshes the existing entry with the same
    /// fingerprint. A refresh only touches `last_seen`, `available` and the
    /// address the device was last seen at; alias, type and the other identity
    /// fields keep their first-seen values.
    ///
    /// Returns `true` if the fingerprint was new.
    pub async fn upsert(&self, device: Device) -> bool {
        {
            let mut devices = self.devices.write().await;
            if let Some(existing) = devices.get_mut(&device.fingerprint) {
                existing.last_seen = device.last_seen.max(existing.last_seen);
                existing.available = true;
                existing.ip = device.ip;
                return false;
            }
            devices.insert(device.fingerprint.clone(), device.clone());
        }

        log::info!(
            "discovered {} ({}) at {}",
            device.alias,
            device.short_fingerprint(),
            device.addr()
        );
        self.added.notify_waiters();

        for handler in self.handlers.read().await.iter() {
            let handler = handler.clone();
            let device = device.clone();
            // a panicking handler only takes down its own task
            tokio::spawn(async move { handler(device) });
        }
        true
    }

    /// All devices that are not stale. Order is unspecified.
    pub async fn list_fresh(&self) -> Vec<Device> {
        self.devices
            .read()
            .await
            .values()
            .filter(|d| !d.is_stale(self.device_timeout))
            .cloned()
            .collect()
    }

    /// The device with this fingerprint, if it is known and not stale.
    pub async fn get(&self, fingerprint: &str) -> Option<Device> {
        self.devices
            .read()
            .await
            .get(fingerprint)
            .filter(|d| !d.is_stale(self.device_timeout))
            .cloned()
    }

    /// Resolves the next time a new fingerprint is inserted.
    pub async fn device_added(&self) {
        self.added.notified().await
    }
}

impl std::fmt::Debug for DeviceRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DeviceRegistry")
            .field("device_timeout", &self.device_timeout)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
pub(crate) fn test_message(fingerprint: &str, alias: &str) -> DiscoveryMessage {
    DiscoveryMessage {
        alias: alias.to_string(),
        version: PROTOCOL_VERSION.to_string(),
        device_model: Some("Pixel".to_string()),
        device_type: Some(DeviceType::Mobile),
        fingerprint: fingerprint.to_string(),
        port: 53317,
        protocol: Protocol::Https,
        download: false,
        announce: true,
    }
}
