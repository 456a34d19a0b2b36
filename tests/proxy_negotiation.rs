use tokio::io::{AsyncReadExt, AsyncWriteExt};
use url::Url;
use wire_flow::config::{ProxyConfig, ProxyKind};
use wire_flow::proxy::negotiate;

// A scripted SOCKS5 proxy following the exact S5 byte sequence: greeting,
// user/password sub-negotiation, CONNECT to h:443.
#[tokio::test]
async fn test_socks5_with_credentials_over_duplex() {
    let (mut client_side, mut proxy_side) = tokio::io::duplex(1024);

    let proxy_task = tokio::spawn(async move {
        let mut greeting = [0u8; 3];
        proxy_side.read_exact(&mut greeting).await.unwrap();
        assert_eq!(greeting, [0x05, 0x01, 0x02]);
        proxy_side.write_all(&[0x05, 0x02]).await.unwrap();

        let mut auth = [0u8; 5];
        proxy_side.read_exact(&mut auth).await.unwrap();
        assert_eq!(auth, [0x01, 0x01, b'u', 0x01, b'p']);
        proxy_side.write_all(&[0x01, 0x00]).await.unwrap();

        let mut request = [0u8; 8];
        proxy_side.read_exact(&mut request).await.unwrap();
        assert_eq!(request, [0x05, 0x01, 0x00, 0x03, 0x01, b'h', 0x01, 0xBB]);
        proxy_side
            .write_all(&[0x05, 0x00, 0x00, 0x01, 0, 0, 0, 0, 0, 0])
            .await
            .unwrap();
    });

    let proxy = ProxyConfig {
        kind: ProxyKind::Socks5,
        uri: Url::parse("socks5://u:p@proxy:1080").unwrap(),
    };
    let leftover = negotiate(&mut client_side, &proxy, "h", 443, None, 3)
        .await
        .unwrap();
    assert!(leftover.is_empty());
    proxy_task.await.unwrap();
}

#[tokio::test]
async fn test_http_connect_over_duplex() {
    let (mut client_side, mut proxy_side) = tokio::io::duplex(4096);

    let proxy_task = tokio::spawn(async move {
        let mut buf = vec![0u8; 1024];
        let n = proxy_side.read(&mut buf).await.unwrap();
        let head = String::from_utf8_lossy(&buf[..n]).to_string();
        assert!(head.starts_with("CONNECT example.org:443 HTTP/1.1\r\n"));
        proxy_side
            .write_all(b"HTTP/1.1 200 Connection Established\r\n\r\n")
            .await
            .unwrap();
    });

    let proxy = ProxyConfig {
        kind: ProxyKind::Http,
        uri: Url::parse("http://proxy:3128").unwrap(),
    };
    let leftover = negotiate(&mut client_side, &proxy, "example.org", 443, None, 3)
        .await
        .unwrap();
    assert!(leftover.is_empty());
    proxy_task.await.unwrap();
}

#[tokio::test]
async fn test_socks5_rejection_surfaces() {
    let (mut client_side, mut proxy_side) = tokio::io::duplex(1024);
    tokio::spawn(async move {
        let mut greeting = [0u8; 3];
        proxy_side.read_exact(&mut greeting).await.unwrap();
        // no acceptable method
        proxy_side.write_all(&[0x05, 0xff]).await.unwrap();
    });
    let proxy = ProxyConfig {
        kind: ProxyKind::Socks5,
        uri: Url::parse("socks5://proxy:1080").unwrap(),
    };
    assert!(negotiate(&mut client_side, &proxy, "h", 80, None, 3)
        .await
        .is_err());
}
