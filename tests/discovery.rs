mod common;

use std::{
    net::{IpAddr, Ipv4Addr},
    time::Duration,
};

use common::{config, spawn_peer, LOCALHOST};
use localsend::{
    config::SecurityContext,
    error::LocalSendError,
    models::{DiscoveryMessage, InfoDto, Protocol},
    LocalService, API_V2,
};
use tokio::net::TcpListener;

#[tokio::test]
async fn scan_returns_only_devices_that_answer() {
    let first = spawn_peer("First", Ipv4Addr::new(127, 0, 0, 1), 0, None).await;
    let port = first.addr.port();
    let second = spawn_peer("Second", Ipv4Addr::new(127, 0, 0, 2), port, None).await;

    // accepts connections and never answers, so probes of it time out
    let silent = TcpListener::bind((Ipv4Addr::new(127, 0, 0, 3), port))
        .await
        .unwrap();
    tokio::spawn(async move {
        let mut held = Vec::new();
        while let Ok((stream, _)) = silent.accept().await {
            held.push(stream);
        }
    });

    let scanner = spawn_peer("Scanner", Ipv4Addr::LOCALHOST, 0, None).await;
    let ips = [
        IpAddr::V4(Ipv4Addr::new(127, 0, 0, 1)),
        IpAddr::V4(Ipv4Addr::new(127, 0, 0, 2)),
        IpAddr::V4(Ipv4Addr::new(127, 0, 0, 3)),
    ];

    let mut devices = scanner
        .service
        .scan(&ips, port, Duration::from_secs(10))
        .await;
    devices.sort_by(|a, b| a.alias.cmp(&b.alias));

    assert_eq!(devices.len(), 2);
    assert_eq!(devices[0].alias, "First");
    assert_eq!(devices[0].ip, ips[0]);
    assert_eq!(devices[1].alias, "Second");
    assert_eq!(devices[1].ip, ips[1]);
    assert!(devices.iter().all(|d| d.protocol == Protocol::Http));

    // the scan fed the registry
    let known = scanner.service.discovery.devices().await;
    assert_eq!(known.len(), 2);
    assert!(scanner
        .service
        .discovery
        .registry()
        .get(second.service.fingerprint())
        .await
        .is_some());
}

#[tokio::test]
async fn a_device_does_not_discover_itself() {
    let peer = spawn_peer("Lonely", Ipv4Addr::LOCALHOST, 0, None).await;

    let devices = peer
        .service
        .scan(&[LOCALHOST], peer.addr.port(), Duration::from_secs(5))
        .await;
    assert!(devices.is_empty());
    assert!(peer.service.discovery.devices().await.is_empty());

    let url = format!("http://{}{API_V2}/info", peer.addr);
    let status = reqwest::Client::new()
        .get(&url)
        .query(&[("fingerprint", peer.service.fingerprint())])
        .send()
        .await
        .unwrap()
        .status();
    assert_eq!(status.as_u16(), 412);
}

#[tokio::test]
async fn register_records_the_caller() {
    let host = spawn_peer("Host", Ipv4Addr::LOCALHOST, 0, None).await;
    let visitor = spawn_peer("Visitor", Ipv4Addr::LOCALHOST, 0, None).await;

    let message: DiscoveryMessage = visitor.service.discovery_message();
    let response = reqwest::Client::new()
        .post(format!("http://{}{API_V2}/register", host.addr))
        .json(&message)
        .send()
        .await
        .unwrap();
    assert_eq!(response.status().as_u16(), 200);
    let info: InfoDto = response.json().await.unwrap();
    assert_eq!(info.alias, "Host");

    let recorded = host
        .service
        .discovery
        .registry()
        .get(visitor.service.fingerprint())
        .await
        .unwrap();
    assert_eq!(recorded.alias, "Visitor");
    assert_eq!(recorded.ip, LOCALHOST);
    assert_eq!(recorded.port, visitor.addr.port());

    // registering as the host itself is refused
    let response = reqwest::Client::new()
        .post(format!("http://{}{API_V2}/register", host.addr))
        .json(&host.service.discovery_message())
        .send()
        .await
        .unwrap();
    assert_eq!(response.status().as_u16(), 412);
}

#[tokio::test]
async fn registering_introduces_both_sides() {
    let host = spawn_peer("Host", Ipv4Addr::LOCALHOST, 0, None).await;
    let visitor = spawn_peer("Visitor", Ipv4Addr::LOCALHOST, 0, None).await;

    let device = visitor
        .service
        .register_with(LOCALHOST, host.addr.port())
        .await
        .unwrap();
    assert_eq!(device.alias, "Host");
    assert_eq!(device.fingerprint, host.service.fingerprint());
    assert_eq!(device.port, host.addr.port());
    assert_eq!(device.protocol, Protocol::Http);

    assert!(visitor
        .service
        .discovery
        .registry()
        .get(host.service.fingerprint())
        .await
        .is_some());
    let recorded = host
        .service
        .discovery
        .registry()
        .get(visitor.service.fingerprint())
        .await
        .unwrap();
    assert_eq!(recorded.alias, "Visitor");

    let own = host
        .service
        .register_with(LOCALHOST, host.addr.port())
        .await;
    assert!(matches!(own, Err(LocalSendError::SelfDiscovered)));
    assert_eq!(host.service.discovery.devices().await.len(), 1);
}

#[tokio::test]
async fn local_scan_finds_a_peer_on_loopback() {
    let target = spawn_peer("Target", Ipv4Addr::LOCALHOST, 0, None).await;

    let dir = tempfile::tempdir().unwrap();
    let scanner = LocalService::new(
        config("Scanner", target.addr.port(), None, &dir),
        SecurityContext::generate().unwrap(),
    )
    .await
    .unwrap();

    let devices = scanner.scan_local(Duration::from_secs(3)).await.unwrap();
    assert!(devices
        .iter()
        .any(|d| d.fingerprint == target.service.fingerprint() && d.ip == LOCALHOST));
}

#[tokio::test]
async fn https_peer_is_probed_and_receives_files() {
    let dir = tempfile::tempdir().unwrap();
    let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
    listener.set_nonblocking(true).unwrap();
    let port = listener.local_addr().unwrap().port();

    let mut cfg = config("Secure", port, None, &dir);
    cfg.https = true;
    let security = SecurityContext::generate().unwrap();
    let receiver = LocalService::new(cfg, security).await.unwrap();
    {
        let receiver = receiver.clone();
        tokio::spawn(async move { receiver.serve_tls(listener).await });
    }

    let sender = spawn_peer("Sender", Ipv4Addr::LOCALHOST, 0, None).await;
    let device = tokio::time::timeout(Duration::from_secs(10), async {
        loop {
            match sender.service.prober().fetch_info(LOCALHOST, port).await {
                Ok(device) => break device,
                Err(_) => tokio::time::sleep(Duration::from_millis(100)).await,
            }
        }
    })
    .await
    .unwrap();
    assert_eq!(device.protocol, Protocol::Https);
    assert_eq!(device.fingerprint, receiver.fingerprint());

    let path = sender.dir.path().join("over-tls.txt");
    std::fs::write(&path, b"encrypted in transit").unwrap();
    sender.service.send_file(&device, &path).await.unwrap();

    let saved = std::fs::read(dir.path().join("downloads/over-tls.txt")).unwrap();
    assert_eq!(saved, b"encrypted in transit");

    receiver.stop().await;
}
