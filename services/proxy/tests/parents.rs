//! Forwarding through parent proxies.


use std::time::Duration;

use std::collections::{HashMap, HashSet};

use rstest::rstest;
use tokio::io::{AsyncReadExt, AsyncWriteExt, BufReader};
use tokio::time::timeout;

use detour_proxy::parent::AeadStream;
use detour_proxy::{ParentProxy, SessionConfig, UserMode};
use harness::{
    cipher, roundtrip, HttpOrigin, MockParent, OriginBehavior, ParentKind, ProxyHandle, ProxyOptions,
    TcpEchoServer,
};

const TEST_TIMEOUT: Duration = Duration::from_secs(5);
const PASSWORD: &str = "integration-secret";

const REQUEST: &str = "GET http://www.example.com/index.html HTTP/1.1\r\nHost: www.example.com\r\n\r\n";

async fn pinned_blocked_proxy(parents: Vec<ParentProxy>) -> ProxyHandle {
    let proxy = ProxyHandle::spawn(ProxyOptions {
        parents,
        ..ProxyOptions::default()
    })
    .await
    .unwrap();
    proxy
        .ctx
        .sitestat
        .set_user_mode("example.com", UserMode::Blocked)
        .await;
    proxy
}

#[rstest]
#[case::http_relay(ParentKind::Http, "http://www.example.com/index.html")]
#[case::socks5(ParentKind::Socks5, "www.example.com:80")]
#[case::shadowsocks(ParentKind::Shadowsocks(cipher()), "www.example.com:80")]
#[tokio::test]
async fn blocked_site_goes_through_parent(#[case] kind: ParentKind, #[case] target: &str) {
    let origin = HttpOrigin::spawn(OriginBehavior::Respond("relayed".into()))
        .await
        .unwrap();
    let parent = MockParent::spawn(kind.clone(), origin.addr).await.unwrap();
    let proxy = pinned_blocked_proxy(vec![parent.uri(&kind, PASSWORD).parse().unwrap()]).await;

    let mut client = BufReader::new(proxy.connect().await.unwrap());
    let response = timeout(TEST_TIMEOUT, roundtrip(&mut client, REQUEST))
        .await
        .unwrap()
        .unwrap();

    assert_eq!(response.status, 200);
    assert_eq!(response.body_text(), "relayed");
    assert_eq!(parent.targets().await, vec![target.to_string()]);

    let seen = origin.seen().await;
    assert_eq!(seen.len(), 1);
    assert!(seen[0].head.starts_with("GET /index.html HTTP/1.1\r\n"));

    // Parent connections are pooled like direct ones.
    let again = timeout(TEST_TIMEOUT, roundtrip(&mut client, REQUEST))
        .await
        .unwrap()
        .unwrap();
    assert_eq!(again.body_text(), "relayed");
    assert_eq!(parent.connection_count(), 1);
}

#[tokio::test]
async fn http_parent_relay_connection_serves_many_hosts() {
    let origin = HttpOrigin::spawn(OriginBehavior::Respond("relayed".into()))
        .await
        .unwrap();
    let parent = MockParent::spawn(ParentKind::Http, origin.addr).await.unwrap();
    let proxy = pinned_blocked_proxy(vec![format!("http://user:pass@{}", parent.addr).parse().unwrap()]).await;

    let mut client = BufReader::new(proxy.connect().await.unwrap());
    for host in ["www.example.com", "img.example.com"] {
        let request = format!("GET http://{host}/a.png HTTP/1.1\r\nHost: {host}\r\n\r\n");
        let response = timeout(TEST_TIMEOUT, roundtrip(&mut client, &request))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(response.body_text(), "relayed");
    }

    // Only the first request opened a parent connection; it was sent in
    // absolute form, not as a CONNECT.
    assert_eq!(parent.connection_count(), 1);
    assert_eq!(
        parent.targets().await,
        vec!["http://www.example.com/a.png".to_string()]
    );
    let seen = origin.seen().await;
    assert_eq!(seen.len(), 2);
    assert!(seen[1].head.starts_with("GET http://img.example.com/a.png HTTP/1.1\r\n"));
    assert!(!seen[0].head.contains("Proxy-Authorization"));
    assert!(seen[1].head.contains("Proxy-Authorization: Basic dXNlcjpwYXNz\r\n"));
}

/// An upstream detour behind an encrypted listener, reaching `origin`
/// under the name `www.example.com`.
async fn upstream_detour(origin: std::net::SocketAddr, session: SessionConfig) -> ProxyHandle {
    ProxyHandle::spawn(ProxyOptions {
        hosts: HashMap::from([("www.example.com".to_string(), origin.ip())]),
        session,
        encrypted: Some(cipher()),
        ..ProxyOptions::default()
    })
    .await
    .unwrap()
}

fn detour_uri(upstream: &ProxyHandle) -> ParentProxy {
    format!("detour://aes-256-gcm:{PASSWORD}@{}", upstream.addr)
        .parse()
        .unwrap()
}

#[tokio::test]
async fn chained_detour_relays_plain_requests() {
    let origin = HttpOrigin::spawn(OriginBehavior::Respond("chained".into()))
        .await
        .unwrap();
    let upstream = upstream_detour(origin.addr, SessionConfig::default()).await;
    let proxy = pinned_blocked_proxy(vec![detour_uri(&upstream)]).await;

    let mut client = BufReader::new(proxy.connect().await.unwrap());
    let request = format!(
        "GET http://www.example.com:{port}/chain HTTP/1.1\r\nHost: www.example.com:{port}\r\n\r\n",
        port = origin.addr.port()
    );
    let response = timeout(TEST_TIMEOUT, roundtrip(&mut client, &request))
        .await
        .unwrap()
        .unwrap();

    assert_eq!(response.status, 200);
    assert_eq!(response.body_text(), "chained");
    let seen = origin.seen().await;
    assert_eq!(seen.len(), 1);
    assert!(seen[0].head.starts_with("GET /chain HTTP/1.1\r\n"));
}

#[tokio::test]
async fn chained_detour_carries_tunnels() {
    let echo = TcpEchoServer::spawn().await.unwrap();
    let port = echo.addr.port();
    let allow = || SessionConfig {
        tunnel_ports: HashSet::from([port]),
        ..SessionConfig::default()
    };
    let upstream = upstream_detour(echo.addr, allow()).await;
    let proxy = ProxyHandle::spawn(ProxyOptions {
        parents: vec![detour_uri(&upstream)],
        session: allow(),
        ..ProxyOptions::default()
    })
    .await
    .unwrap();
    proxy
        .ctx
        .sitestat
        .set_user_mode("example.com", UserMode::Blocked)
        .await;

    let mut client = BufReader::new(proxy.connect().await.unwrap());
    let request = format!("CONNECT www.example.com:{port} HTTP/1.1\r\nHost: www.example.com:{port}\r\n\r\n");
    client.get_mut().write_all(request.as_bytes()).await.unwrap();
    let mut established = vec![0u8; b"HTTP/1.1 200 Connection established\r\n\r\n".len()];
    timeout(TEST_TIMEOUT, client.read_exact(&mut established))
        .await
        .unwrap()
        .unwrap();
    assert!(established.starts_with(b"HTTP/1.1 200"));

    client.get_mut().write_all(b"through two hops").await.unwrap();
    let mut buf = [0u8; 16];
    timeout(TEST_TIMEOUT, client.read_exact(&mut buf))
        .await
        .unwrap()
        .unwrap();
    assert_eq!(&buf, b"through two hops");
}

#[tokio::test]
async fn dead_parent_fails_over_to_backup() {
    let closed = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let dead_addr = closed.local_addr().unwrap();
    drop(closed);

    let origin = HttpOrigin::spawn(OriginBehavior::Respond("backup".into()))
        .await
        .unwrap();
    let backup = MockParent::spawn(ParentKind::Socks5, origin.addr).await.unwrap();

    let proxy = pinned_blocked_proxy(vec![
        format!("socks5://{dead_addr}").parse().unwrap(),
        backup.uri(&ParentKind::Socks5, "").parse().unwrap(),
    ])
    .await;

    let mut client = BufReader::new(proxy.connect().await.unwrap());
    let response = timeout(TEST_TIMEOUT, roundtrip(&mut client, REQUEST))
        .await
        .unwrap()
        .unwrap();

    assert_eq!(response.body_text(), "backup");
    assert_eq!(proxy.ctx.parents.fail_count(0), Some(1));
    assert_eq!(proxy.ctx.parents.fail_count(1), Some(0));
}

#[tokio::test]
async fn all_parents_down_gets_error_page() {
    let closed = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let dead_addr = closed.local_addr().unwrap();
    drop(closed);

    let proxy = pinned_blocked_proxy(vec![format!("http://{dead_addr}").parse().unwrap()]).await;

    let mut client = BufReader::new(proxy.connect().await.unwrap());
    let response = timeout(TEST_TIMEOUT, roundtrip(&mut client, REQUEST))
        .await
        .unwrap()
        .unwrap();

    assert_eq!(response.status, 502);
    assert!(response.body_text().contains("Connection failed"));
}

#[tokio::test]
async fn encrypted_listener_serves_http_inside_relay_stream() {
    let origin = HttpOrigin::spawn(OriginBehavior::Respond("sealed".into()))
        .await
        .unwrap();
    let proxy = ProxyHandle::spawn(ProxyOptions {
        encrypted: Some(cipher()),
        ..ProxyOptions::default()
    })
    .await
    .unwrap();

    let stream = proxy.connect().await.unwrap();
    let mut client = BufReader::new(AeadStream::new(stream, cipher()));
    let request = format!(
        "GET http://{}/ HTTP/1.1\r\nHost: {}\r\n\r\n",
        origin.addr, origin.addr
    );
    let response = timeout(TEST_TIMEOUT, roundtrip(&mut client, &request))
        .await
        .unwrap()
        .unwrap();

    assert_eq!(response.status, 200);
    assert_eq!(response.body_text(), "sealed");
}
