#![allow(dead_code)]

use std::net::{IpAddr, Ipv4Addr, SocketAddr};

use localsend::{
    config::{Config, SecurityContext},
    LocalService,
};
use tempfile::TempDir;
use tokio::{net::TcpListener, task::JoinHandle};

/// A device serving plain HTTP on a loopback address.
pub struct Peer {
    pub service: LocalService,
    pub addr: SocketAddr,
    pub dir: TempDir,
    pub server: JoinHandle<localsend::error::Result<()>>,
}

impl Peer {
    pub fn download_dir(&self) -> std::path::PathBuf {
        self.dir.path().join("downloads")
    }
}

pub fn config(alias: &str, port: u16, pin: Option<&str>, dir: &TempDir) -> Config {
    Config {
        alias: alias.to_string(),
        port,
        https: false,
        pin: pin.map(str::to_string),
        download_dir: dir.path().join("downloads"),
        data_dir: dir.path().join("data"),
        probe_timeout_secs: 1,
        listen_timeout_secs: 1,
        ..Default::default()
    }
}

pub async fn spawn_peer(alias: &str, ip: Ipv4Addr, port: u16, pin: Option<&str>) -> Peer {
    let listener = TcpListener::bind((ip, port)).await.unwrap();
    let addr = listener.local_addr().unwrap();
    let dir = tempfile::tempdir().unwrap();

    let service = LocalService::new(
        config(alias, addr.port(), pin, &dir),
        SecurityContext::generate().unwrap(),
    )
    .await
    .unwrap();

    let server = {
        let service = service.clone();
        tokio::spawn(async move { service.serve(listener).await })
    };

    Peer {
        service,
        addr,
        dir,
        server,
    }
}

pub const LOCALHOST: IpAddr = IpAddr::V4(Ipv4Addr::LOCALHOST);
