//! CLI command tests against an in-process AJP13 container.

use std::time::Duration;

use ajplb_balancer::{Connector, ConnectorConfig};
use ajplb_cli::commands;
use ajplb_common::protocol::codes::{AJP13_WS_HEADER, JK_AJP13_CPING_REQUEST};
use ajplb_common::protocol::{ForwardRequest, MessageBuffer, ReplyPacket};
use ajplb_common::transport::TcpTransport;
use ajplb_status::StatusService;
use tokio::net::{TcpListener, TcpStream};

const TIMEOUT: Duration = Duration::from_secs(2);

/// Answers CPINGs, and requests with `200` and the request URI as body.
async fn container() -> String {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        while let Ok((sock, _)) = listener.accept().await {
            tokio::spawn(serve(sock));
        }
    });
    addr.to_string()
}

async fn serve(mut sock: TcpStream) {
    let mut msg = MessageBuffer::new(8192);
    while TcpTransport::receive_message(&mut sock, &mut msg, AJP13_WS_HEADER, None)
        .await
        .is_ok()
    {
        let packets = if msg.peek_u8().ok() == Some(JK_AJP13_CPING_REQUEST) {
            vec![ReplyPacket::CPong]
        } else {
            let Ok(request) = ForwardRequest::decode(&mut msg) else {
                return;
            };
            vec![
                ReplyPacket::SendHeaders {
                    status: 200,
                    reason: "OK".to_string(),
                    headers: vec![("X-Method".to_string(), request.method.clone())],
                },
                ReplyPacket::BodyChunk(request.uri.into_bytes()),
                ReplyPacket::EndResponse { reuse: true },
            ]
        };
        for packet in packets {
            if packet.encode(&mut msg).is_err()
                || TcpTransport::send_message(&mut sock, &mut msg, None).await.is_err()
            {
                return;
            }
        }
    }
}

fn write_config(dir: &tempfile::TempDir) -> std::path::PathBuf {
    let path = dir.path().join("ajplb.toml");
    let image = dir.path().join("ajplb.image");
    let text = format!(
        r#"
        runtime_image = "{}"

        [[worker]]
        name = "node1"
        host = "127.0.0.1"
        port = 1

        [[worker]]
        name = "node2"
        host = "127.0.0.1"
        port = 2

        [[balancer]]
        name = "lb"
        [[balancer.member]]
        worker = "node1"
        [[balancer.member]]
        worker = "node2"
        lb_factor = 3
        "#,
        image.display()
    );
    std::fs::write(&path, text).unwrap();
    path
}

#[tokio::test]
async fn test_ping_container() {
    let addr = container().await;
    let rtt = commands::ping(&addr, TIMEOUT).await.unwrap();
    assert!(rtt < TIMEOUT);
}

#[tokio::test]
async fn test_ping_refused() {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap().to_string();
    drop(listener);
    assert!(commands::ping(&addr, TIMEOUT).await.is_err());
}

#[tokio::test]
async fn test_forward_request() {
    let addr = container().await;
    let request = ForwardRequest::new("DELETE", "/items/7");
    let response = commands::forward(&addr, &request, TIMEOUT).await.unwrap();

    assert_eq!(response.status, 200);
    assert_eq!(response.header("x-method"), Some("DELETE"));
    let text = commands::format_response(&response);
    assert!(text.starts_with("200 OK\n"));
    assert!(text.ends_with("\n\n/items/7"));
}

#[test]
fn test_route_distribution_follows_factors() {
    let dir = tempfile::tempdir().unwrap();
    let connector = Connector::open(ConnectorConfig::load(write_config(&dir)).unwrap()).unwrap();

    let request = ForwardRequest::new("GET", "/");
    let counts = commands::route_distribution(&connector, "lb", &request, 40).unwrap();
    assert_eq!(counts["node1"], 10);
    assert_eq!(counts["node2"], 30);
}

#[test]
fn test_route_distribution_sticky() {
    let dir = tempfile::tempdir().unwrap();
    let connector = Connector::open(ConnectorConfig::load(write_config(&dir)).unwrap()).unwrap();

    let request = ForwardRequest::new("GET", "/").with_header("Cookie", "JSESSIONID=abc.node1");
    let counts = commands::route_distribution(&connector, "lb", &request, 5).unwrap();
    assert_eq!(counts.len(), 1);
    assert_eq!(counts["node1"], 5);

    assert!(commands::route_distribution(&connector, "nope", &request, 1).is_err());
}

#[test]
fn test_status_update_persists_image() {
    let dir = tempfile::tempdir().unwrap();
    let path = write_config(&dir);

    let connector = Connector::open(ConnectorConfig::load(&path).unwrap()).unwrap();
    StatusService::new(&connector)
        .handle_query("cmd=update&w=lb&sw=node2&vwa=STP")
        .unwrap();
    assert!(connector.persist().unwrap());
    drop(connector);

    let connector = Connector::open(ConnectorConfig::load(&path).unwrap()).unwrap();
    let body = StatusService::new(&connector)
        .handle_query("cmd=show&w=lb&sw=node2")
        .unwrap();
    let value: serde_json::Value = serde_json::from_str(&body).unwrap();
    assert_eq!(value["activation"], "STP");
}
