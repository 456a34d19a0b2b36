use futures::StreamExt;
use std::time::Duration;
use wire_flow::config::{AesSize, ClientConfig, Compressor, Encryption, SchemeConfig, ServerConfig};
use wire_flow::event::Event;
use wire_flow::ws::frame::CloseCode;
use wire_flow::{Message, WebClient, WebServer};

fn server_scheme(port: u16, compressors: Vec<Compressor>) -> ServerConfig {
    let mut scheme = SchemeConfig::default();
    scheme.url = format!("ws://0.0.0.0:{}/", port);
    scheme.compressors = compressors;
    ServerConfig {
        scheme,
        tls_config: None,
    }
}

fn client_config(compressors: Vec<Compressor>) -> ClientConfig {
    let mut scheme = SchemeConfig::default();
    scheme.compressors = compressors;
    scheme.timeouts.wait = Duration::from_secs(10);
    ClientConfig {
        scheme,
        ca_file: None,
    }
}

async fn free_port() -> u16 {
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    listener.local_addr().unwrap().port()
}

// Echo every message back until the peer disconnects.
fn spawn_echo(server: WebServer, mut events: wire_flow::EventStream) {
    tokio::spawn(async move {
        while let Some(event) = events.next().await {
            if let Event::Message(bid, message) = event {
                let _ = server.send(bid, message);
            }
        }
    });
}

#[tokio::test]
async fn test_ws_echo_plain() {
    let port = free_port().await;
    let (server, server_events) = WebServer::start(port, server_scheme(port, vec![]))
        .await
        .unwrap();
    spawn_echo(server, server_events);

    let mut client = WebClient::new(client_config(vec![]));
    let bid = client
        .ws_connect(&format!("ws://127.0.0.1:{}/", port))
        .await
        .unwrap();

    client
        .send(bid, Message::Text("Hello".to_string()))
        .unwrap();

    // connect event first, then the echo
    let mut received = None;
    for _ in 0..10 {
        match client.next_event().await {
            Some(Event::Message(event_bid, message)) => {
                assert_eq!(event_bid, bid);
                received = Some(message);
                break;
            }
            Some(_) => continue,
            None => break,
        }
    }
    assert_eq!(received, Some(Message::Text("Hello".to_string())));

    client.close(bid);
    // the broker winds down with a disconnect event
    let mut disconnected = false;
    for _ in 0..10 {
        match client.next_event().await {
            Some(Event::Active(event_bid, wire_flow::ActiveFlag::Disconnect))
                if event_bid == bid =>
            {
                disconnected = true;
                break;
            }
            Some(_) => continue,
            None => break,
        }
    }
    assert!(disconnected);
    client.stop();
}

#[tokio::test]
async fn test_ws_echo_permessage_deflate() {
    let port = free_port().await;
    let (server, server_events) =
        WebServer::start(port, server_scheme(port, vec![Compressor::Deflate]))
            .await
            .unwrap();
    spawn_echo(server, server_events);

    let mut client = WebClient::new(client_config(vec![Compressor::Deflate]));
    let bid = client
        .ws_connect(&format!("ws://127.0.0.1:{}/", port))
        .await
        .unwrap();

    // 100 KiB of repeating "abcd" squeezes to almost nothing on the wire and
    // must come back byte-identical
    let text = "abcd".repeat(25_600);
    client.send(bid, Message::Text(text.clone())).unwrap();

    let mut received = None;
    for _ in 0..20 {
        match client.next_event().await {
            Some(Event::Message(_, message)) => {
                received = Some(message);
                break;
            }
            Some(_) => continue,
            None => break,
        }
    }
    assert_eq!(received, Some(Message::Text(text)));
    client.close(bid);
    client.stop();
}

#[tokio::test]
async fn test_ws_echo_encrypted() {
    let encryption = Encryption {
        pass: "shared pass".to_string(),
        salt: "shared salt".to_string(),
        cipher: AesSize::Aes256,
    };
    let port = free_port().await;
    let mut server_config = server_scheme(port, vec![]);
    server_config.scheme.encryption = Some(encryption.clone());
    let (server, server_events) = WebServer::start(port, server_config).await.unwrap();
    spawn_echo(server, server_events);

    let mut config = client_config(vec![]);
    config.scheme.encryption = Some(encryption);
    let mut client = WebClient::new(config);
    let bid = client
        .ws_connect(&format!("ws://127.0.0.1:{}/", port))
        .await
        .unwrap();

    // both ends cipher: the wire carries tagged ciphertext, the echo comes
    // back as the original plaintext
    client
        .send(bid, Message::Text("keep this quiet".to_string()))
        .unwrap();
    let mut received = None;
    for _ in 0..10 {
        match client.next_event().await {
            Some(Event::Message(_, message)) => {
                received = Some(message);
                break;
            }
            Some(_) => continue,
            None => break,
        }
    }
    assert_eq!(received, Some(Message::Text("keep this quiet".to_string())));
    client.close(bid);
    client.stop();
}

#[tokio::test]
async fn test_close_code_reserved_never_on_wire() {
    // 1005/1006 are local-only by contract
    assert!(CloseCode::from_u16(1005).is_err());
    assert!(CloseCode::from_u16(1006).is_err());
}
