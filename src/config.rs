use std::{
    net::{Ipv4Addr, SocketAddrV4},
    path::{Path, PathBuf},
    time::Duration,
};

use figment::{
    providers::{Env, Format, Serialized, Toml},
    Figment,
};
use rustls::pki_types::{pem::PemObject, CertificateDer};
use serde::{Deserialize, Deserializer, Serialize};

use crate::{
    discovery::DiscoveryConfig,
    error::{LocalSendError, Result},
    models::{DeviceType, DiscoveryMessage, InfoDto, Protocol, PROTOCOL_VERSION},
    DEFAULT_PORT, MULTICAST_IP,
};

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Config {
    pub alias: String,
    pub port: u16,
    pub multicast_group: Ipv4Addr,
    pub https: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub device_model: Option<String>,
    pub device_type: DeviceType,
    #[serde(
        default,
        skip_serializing_if = "Option::is_none",
        deserialize_with = "pin_from_text_or_number"
    )]
    pub pin: Option<String>,
    pub download_dir: PathBuf,
    pub data_dir: PathBuf,
    pub announce_interval_secs: u64,
    pub device_timeout_secs: u64,
    pub enable_announcement: bool,
    pub probe_timeout_secs: u64,
    pub listen_timeout_secs: u64,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            alias: hostname(),
            port: DEFAULT_PORT,
            multicast_group: MULTICAST_IP,
            https: true,
            device_model: None,
            device_type: DeviceType::Headless,
            pin: None,
            download_dir: PathBuf::from("downloads"),
            data_dir: PathBuf::from(".localsend"),
            announce_interval_secs: 30,
            device_timeout_secs: 120,
            enable_announcement: true,
            probe_timeout_secs: 2,
            listen_timeout_secs: 5,
        }
    }
}

impl Config {
    /// Resolves the platform directories, writes a default config file on
    /// first run and then loads it with [`Config::load`].
    pub fn new() -> Result<Self> {
        let dirs = directories::BaseDirs::new().ok_or(LocalSendError::NoHomeDir)?;

        let config_file = dirs.config_dir().join("localsend.toml");
        let defaults = Self {
            download_dir: dirs.home_dir().join("localsend-downloads"),
            data_dir: dirs.data_local_dir().join("localsend"),
            ..Default::default()
        };

        if !config_file.exists() {
            log::info!("creating config file at {config_file:?}");
            if let Some(parent) = config_file.parent() {
                std::fs::create_dir_all(parent)?;
            }
            std::fs::write(&config_file, toml::to_string(&defaults)?)?;
        }

        let config = Self::figment(defaults, Some(&config_file))
            .extract()
            .map_err(Box::new)?; // boxed because the error size from figment is large

        log::info!("using config: {config:?}");
        Ok(config)
    }

    /// Layers the defaults, an optional TOML file and `LOCALSEND_*`
    /// environment variables, later sources winning.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        Ok(Self::figment(Self::default(), path)
            .extract()
            .map_err(Box::new)?)
    }

    fn figment(defaults: Self, path: Option<&Path>) -> Figment {
        let mut figment = Figment::from(Serialized::defaults(defaults));
        if let Some(path) = path {
            log::debug!("reading config from {path:?}");
            figment = figment.merge(Toml::file(path));
        }
        figment = figment.merge(Env::prefixed("LOCALSEND_").ignore(&["pin"]));

        // taken verbatim, since parsing `0042` as a number would drop the zeros
        if let Ok(pin) = std::env::var("LOCALSEND_PIN") {
            figment = figment.merge(Serialized::default("pin", pin));
        }
        figment
    }

    pub fn multicast_addr(&self) -> SocketAddrV4 {
        SocketAddrV4::new(self.multicast_group, self.port)
    }

    pub fn protocol(&self) -> Protocol {
        if self.https {
            Protocol::Https
        } else {
            Protocol::Http
        }
    }

    pub fn discovery_config(&self) -> DiscoveryConfig {
        DiscoveryConfig {
            multicast_addr: self.multicast_addr(),
            announce_interval: Duration::from_secs(self.announce_interval_secs),
            device_timeout: Duration::from_secs(self.device_timeout_secs),
            enable_announcement: self.enable_announcement,
            listen_timeout: Duration::from_secs(self.listen_timeout_secs),
            probe_timeout: Duration::from_secs(self.probe_timeout_secs),
        }
    }

    /// This device's discovery message, as a response (`announce == false`).
    pub fn discovery_message(&self, fingerprint: &str, download: bool) -> DiscoveryMessage {
        DiscoveryMessage {
            alias: self.alias.clone(),
            version: PROTOCOL_VERSION.to_string(),
            device_model: self.device_model.clone(),
            device_type: Some(self.device_type),
            fingerprint: fingerprint.to_string(),
            port: self.port,
            protocol: self.protocol(),
            download,
            announce: false,
        }
    }

    pub fn info(&self, fingerprint: &str, download: bool) -> InfoDto {
        self.discovery_message(fingerprint, download).to_info()
    }

    /// Returns (key, cert) paths
    pub fn ssl(&self) -> (PathBuf, PathBuf) {
        let key = self.data_dir.join("key.pem");
        let cert = self.data_dir.join("cert.pem");
        (key, cert)
    }
}

/// The TLS identity of this device. Everything outside this module treats it
/// as opaque: a certificate, its private key, and the fingerprint peers know
/// us by.
#[derive(Clone)]
pub struct SecurityContext {
    pub certificate_pem: String,
    pub private_key_pem: String,
    pub fingerprint: String,
}

impl std::fmt::Debug for SecurityContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SecurityContext")
            .field("fingerprint", &self.fingerprint)
            .finish_non_exhaustive()
    }
}

impl SecurityContext {
    pub fn generate() -> Result<Self> {
        let cert_key = rcgen::generate_simple_self_signed(vec!["*".into()])?;
        Ok(Self {
            certificate_pem: cert_key.cert.pem(),
            private_key_pem: cert_key.key_pair.serialize_pem(),
            fingerprint: fingerprint_der(cert_key.cert.der()),
        })
    }

    pub fn from_pem(certificate_pem: String, private_key_pem: String) -> Result<Self> {
        let der = CertificateDer::from_pem_slice(certificate_pem.as_bytes())
            .map_err(|e| LocalSendError::CertificateError(format!("{e:?}")))?;
        Ok(Self {
            fingerprint: fingerprint_der(&der),
            certificate_pem,
            private_key_pem,
        })
    }

    /// Reads `cert.pem`/`key.pem` from the config's data dir, generating and
    /// storing a fresh pair if either is missing.
    pub fn load_or_generate(config: &Config) -> Result<Self> {
        let (key, cert) = config.ssl();
        if key.exists() && cert.exists() {
            let ctx = Self::from_pem(std::fs::read_to_string(cert)?, std::fs::read_to_string(key)?)?;
            log::info!("loaded security context, fingerprint {}", ctx.fingerprint);
            return Ok(ctx);
        }

        std::fs::create_dir_all(&config.data_dir)?;
        let ctx = Self::generate()?;
        if key.exists() {
            std::fs::remove_file(&key)?;
        }
        std::fs::write(&key, &ctx.private_key_pem)?;
        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            std::fs::set_permissions(&key, std::fs::Permissions::from_mode(0o400u32))?;
        }
        std::fs::write(&cert, &ctx.certificate_pem)?;
        log::info!("generated security context, fingerprint {}", ctx.fingerprint);
        Ok(ctx)
    }
}

/// PINs are digits, so `pin = 1234` in TOML is as good as `pin = "1234"`.
fn pin_from_text_or_number<'de, D>(
    deserializer: D,
) -> std::result::Result<Option<String>, D::Error>
where
    D: Deserializer<'de>,
{
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum Pin {
        Text(String),
        Number(u64),
    }

    Ok(Option::<Pin>::deserialize(deserializer)?.map(|pin| match pin {
        Pin::Text(text) => text,
        Pin::Number(number) => number.to_string(),
    }))
}

fn fingerprint_der(der: &[u8]) -> String {
    sha256::digest(der.to_vec())
}

fn hostname() -> String {
    let name = rustix::system::uname()
        .nodename()
        .to_string_lossy()
        .to_string();
    if name.is_empty() {
        "LocalSend".to_string()
    } else {
        name
    }
}
