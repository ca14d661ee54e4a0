//! Plain HTTP forwarding and retry behavior.


use std::collections::HashMap;
use std::net::IpAddr;
use std::time::Duration;

use rstest::rstest;
use tokio::io::{AsyncReadExt, AsyncWriteExt, BufReader};
use tokio::time::timeout;

use detour_proxy::{SessionConfig, Verdict};
use detour_site::Destination;
use harness::{
    read_until_close, roundtrip, HttpOrigin, MockParent, OriginBehavior, ParentKind, ProxyHandle,
    ProxyOptions,
};

const TEST_TIMEOUT: Duration = Duration::from_secs(5);

fn localhost_override(name: &str) -> HashMap<String, IpAddr> {
    HashMap::from([(name.to_string(), IpAddr::from([127, 0, 0, 1]))])
}

#[tokio::test]
async fn request_is_rewritten_to_origin_form() {
    let origin = HttpOrigin::spawn(OriginBehavior::Respond("hello".into()))
        .await
        .unwrap();
    let proxy = ProxyHandle::spawn(ProxyOptions::default()).await.unwrap();

    let request = format!(
        "GET http://{}/path?q=1 HTTP/1.1\r\nHost: {}\r\nProxy-Connection: keep-alive\r\n\r\n",
        origin.addr, origin.addr
    );
    let mut client = BufReader::new(proxy.connect().await.unwrap());
    let response = timeout(TEST_TIMEOUT, roundtrip(&mut client, &request))
        .await
        .unwrap()
        .unwrap();

    assert_eq!(response.status, 200);
    assert_eq!(response.body_text(), "hello");

    let seen = origin.seen().await;
    assert_eq!(seen.len(), 1);
    assert!(seen[0].head.starts_with("GET /path?q=1 HTTP/1.1\r\n"));
    assert!(!seen[0].head.to_ascii_lowercase().contains("proxy-connection"));
}

#[rstest]
#[case::http10_client("HTTP/1.0", false)]
#[case::http11_client("HTTP/1.1", true)]
#[tokio::test]
async fn close_delimited_response_framing_follows_client_version(
    #[case] version: &str,
    #[case] rechunked: bool,
) {
    let origin = HttpOrigin::spawn(OriginBehavior::RespondUntilClose("until the end".into()))
        .await
        .unwrap();
    let proxy = ProxyHandle::spawn(ProxyOptions::default()).await.unwrap();

    let request = format!(
        "GET http://{}/ {version}\r\nHost: {}\r\nConnection: keep-alive\r\n\r\n",
        origin.addr, origin.addr
    );
    let mut client = BufReader::new(proxy.connect().await.unwrap());
    client.get_mut().write_all(request.as_bytes()).await.unwrap();

    if rechunked {
        let response = timeout(TEST_TIMEOUT, harness::read_client_response(&mut client))
            .await
            .unwrap()
            .unwrap();
        assert!(response.head.contains("Transfer-Encoding: chunked\r\n"));
        assert!(response.head.contains("Connection: keep-alive\r\n"));
        assert_eq!(response.body_text(), "until the end");
    } else {
        // The body arrives as is and the proxy closes the connection.
        let response = timeout(TEST_TIMEOUT, read_until_close(&mut client))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(response.status, 200);
        assert!(!response.head.contains("Transfer-Encoding"));
        assert!(response.head.contains("Connection: close\r\n"));
        assert_eq!(response.body_text(), "until the end");
    }
}

#[tokio::test]
async fn keep_alive_reuses_upstream_connection() {
    let origin = HttpOrigin::spawn(OriginBehavior::Respond("ok".into()))
        .await
        .unwrap();
    let proxy = ProxyHandle::spawn(ProxyOptions {
        hosts: localhost_override("www.example.com"),
        ..ProxyOptions::default()
    })
    .await
    .unwrap();

    let port = origin.addr.port();
    let request = format!(
        "GET http://www.example.com:{port}/ HTTP/1.1\r\nHost: www.example.com:{port}\r\n\r\n"
    );
    let mut client = BufReader::new(proxy.connect().await.unwrap());
    for _ in 0..2 {
        let response = timeout(TEST_TIMEOUT, roundtrip(&mut client, &request))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(response.body_text(), "ok");
    }

    assert_eq!(origin.seen().await.len(), 2);
    assert_eq!(origin.connection_count(), 1);

    // A direct success is counted once per connection.
    let dest = Destination::new("www.example.com", port).unwrap();
    let entry = proxy.ctx.sitestat.entry(&dest).await.unwrap();
    assert_eq!(entry.direct(), 1);
}

#[tokio::test]
async fn silent_direct_server_is_retried_through_parent() {
    let silent = HttpOrigin::spawn(OriginBehavior::Silent).await.unwrap();
    let good = HttpOrigin::spawn(OriginBehavior::Respond("via parent".into()))
        .await
        .unwrap();
    let parent = MockParent::spawn(ParentKind::Socks5, good.addr).await.unwrap();

    let proxy = ProxyHandle::spawn(ProxyOptions {
        parents: vec![parent.uri(&ParentKind::Socks5, "").parse().unwrap()],
        hosts: localhost_override("blocked.example.com"),
        timeouts: Duration::from_millis(300),
        ..ProxyOptions::default()
    })
    .await
    .unwrap();

    let port = silent.addr.port();
    let request = format!(
        "GET http://blocked.example.com:{port}/ HTTP/1.1\r\nHost: blocked.example.com:{port}\r\n\r\n"
    );
    let mut client = BufReader::new(proxy.connect().await.unwrap());
    let response = timeout(TEST_TIMEOUT, roundtrip(&mut client, &request))
        .await
        .unwrap()
        .unwrap();

    assert_eq!(response.status, 200);
    assert_eq!(response.body_text(), "via parent");
    assert_eq!(silent.connection_count(), 1);
    assert_eq!(parent.targets().await, vec![format!("blocked.example.com:{port}")]);

    let dest = Destination::new("blocked.example.com", port).unwrap();
    assert_eq!(proxy.ctx.sitestat.classify(&dest).await, Verdict::Blocked);
}

#[tokio::test]
async fn oversized_body_is_not_replayed() {
    let origin = HttpOrigin::spawn(OriginBehavior::CloseAfterRequest)
        .await
        .unwrap();
    let proxy = ProxyHandle::spawn(ProxyOptions {
        session: SessionConfig {
            replay_limit: 16,
            ..SessionConfig::default()
        },
        ..ProxyOptions::default()
    })
    .await
    .unwrap();

    let body = "x".repeat(100);
    let request = format!(
        "POST http://{}/upload HTTP/1.1\r\nHost: {}\r\nContent-Length: {}\r\n\r\n{body}",
        origin.addr,
        origin.addr,
        body.len()
    );
    let mut client = BufReader::new(proxy.connect().await.unwrap());
    let response = timeout(TEST_TIMEOUT, roundtrip(&mut client, &request))
        .await
        .unwrap()
        .unwrap();

    assert_eq!(response.status, 502);
    assert!(response.body_text().contains("Cannot retry request"));

    let seen = origin.seen().await;
    assert_eq!(seen.len(), 1);
    assert_eq!(seen[0].body.len(), 100);
}

#[tokio::test]
async fn small_body_is_replayed_until_tries_run_out() {
    let origin = HttpOrigin::spawn(OriginBehavior::CloseAfterRequest)
        .await
        .unwrap();
    let proxy = ProxyHandle::spawn(ProxyOptions::default()).await.unwrap();

    let request = format!(
        "POST http://{}/form HTTP/1.1\r\nHost: {}\r\nContent-Length: 5\r\n\r\nhello",
        origin.addr, origin.addr
    );
    let mut client = BufReader::new(proxy.connect().await.unwrap());
    let response = timeout(TEST_TIMEOUT, roundtrip(&mut client, &request))
        .await
        .unwrap()
        .unwrap();

    assert_eq!(response.status, 502);
    assert!(response.body_text().contains("Too many retries"));

    let seen = origin.seen().await;
    assert_eq!(seen.len(), 3);
    assert!(seen.iter().all(|r| r.body == b"hello"));
}

#[tokio::test]
async fn no_retry_after_response_bytes_reached_client() {
    let origin = HttpOrigin::spawn(OriginBehavior::PartialThenClose)
        .await
        .unwrap();
    let proxy = ProxyHandle::spawn(ProxyOptions::default()).await.unwrap();

    let request = format!(
        "GET http://{}/big HTTP/1.1\r\nHost: {}\r\n\r\n",
        origin.addr, origin.addr
    );
    let mut client = proxy.connect().await.unwrap();
    client.write_all(request.as_bytes()).await.unwrap();

    let mut received = Vec::new();
    let _ = timeout(TEST_TIMEOUT, client.read_to_end(&mut received))
        .await
        .unwrap();
    let received = String::from_utf8_lossy(&received);

    assert!(received.starts_with("HTTP/1.1 200 OK\r\n"));
    assert!(received.ends_with("\r\n\r\n0123456789"));
    assert_eq!(origin.seen().await.len(), 1);
}

#[tokio::test]
async fn origin_form_request_is_rejected() {
    let proxy = ProxyHandle::spawn(ProxyOptions::default()).await.unwrap();

    let mut client = BufReader::new(proxy.connect().await.unwrap());
    let response = timeout(
        TEST_TIMEOUT,
        roundtrip(&mut client, "GET /local HTTP/1.1\r\nHost: example.com\r\n\r\n"),
    )
    .await
    .unwrap()
    .unwrap();

    assert_eq!(response.status, 400);

    // The connection is closed after a bad request.
    let mut rest = Vec::new();
    let n = timeout(TEST_TIMEOUT, client.read_to_end(&mut rest))
        .await
        .unwrap()
        .unwrap();
    assert_eq!(n, 0);
}

#[tokio::test]
async fn unreachable_origin_gets_error_page() {
    // Bind then drop to get a port nothing listens on.
    let closed = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = closed.local_addr().unwrap();
    drop(closed);

    let proxy = ProxyHandle::spawn(ProxyOptions::default()).await.unwrap();
    let request = format!("GET http://{addr}/ HTTP/1.1\r\nHost: {addr}\r\n\r\n");
    let mut client = BufReader::new(proxy.connect().await.unwrap());
    let response = timeout(TEST_TIMEOUT, roundtrip(&mut client, &request))
        .await
        .unwrap()
        .unwrap();

    assert_eq!(response.status, 502);
    assert!(response.body_text().contains("Connection failed"));

    // The session stays usable after an error page.
    let next = timeout(TEST_TIMEOUT, roundtrip(&mut client, &request))
        .await
        .unwrap()
        .unwrap();
    assert_eq!(next.status, 502);
}
