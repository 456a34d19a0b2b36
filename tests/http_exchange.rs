use futures::StreamExt;
use wire_flow::config::{ClientConfig, Protocol, SchemeConfig, ServerConfig};
use wire_flow::event::{Event, HttpEntity};
use wire_flow::http::model::Response;
use wire_flow::{WebClient, WebServer};

async fn free_port() -> u16 {
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    listener.local_addr().unwrap().port()
}

fn http_server(port: u16) -> ServerConfig {
    let mut scheme = SchemeConfig::default();
    scheme.url = format!("http://0.0.0.0:{}/", port);
    scheme.proto = Protocol::Http11;
    ServerConfig {
        scheme,
        tls_config: None,
    }
}

#[tokio::test]
async fn test_get_roundtrip() {
    let port = free_port().await;
    let (server, mut events) = WebServer::start(port, http_server(port)).await.unwrap();
    tokio::spawn(async move {
        while let Some(event) = events.next().await {
            if let Event::Entity(bid, HttpEntity::Request(request)) = event {
                assert_eq!(request.method, "GET");
                let mut response = Response::new(200);
                response.body = b"abcd".to_vec();
                let _ = server.respond(bid, 0, response);
            }
        }
    });

    let mut client = WebClient::new(ClientConfig::default());
    let response = client
        .get(&format!("http://127.0.0.1:{}/", port))
        .await
        .unwrap();
    assert_eq!(response.status, 200);
    assert_eq!(response.body, b"abcd");
    client.stop();
}

#[tokio::test]
async fn test_post_body_roundtrip() {
    let port = free_port().await;
    let (server, mut events) = WebServer::start(port, http_server(port)).await.unwrap();
    tokio::spawn(async move {
        while let Some(event) = events.next().await {
            if let Event::Entity(bid, HttpEntity::Request(request)) = event {
                // the server answers with the body it assembled
                let mut response = Response::new(200);
                response.body = request.body.clone();
                let _ = server.respond(bid, 0, response);
            }
        }
    });

    let mut client = WebClient::new(ClientConfig::default());
    let mut request = wire_flow::http::model::Request::new(
        "POST",
        url::Url::parse(&format!("http://127.0.0.1:{}/u", port)).unwrap(),
    );
    request.body = b"aaaabbbbcccc".to_vec();
    let response = client.fetch(request).await.unwrap();
    assert_eq!(response.status, 200);
    assert_eq!(response.body, b"aaaabbbbcccc");
    client.stop();
}
