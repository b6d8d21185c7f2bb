//! A minimal AJP13 container for integration tests.

#![allow(dead_code)]

use std::net::SocketAddr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use ajplb_balancer::{ConnectorConfig, WorkerConfig};
use ajplb_common::protocol::codes::{AJP13_WS_HEADER, JK_AJP13_CPING_REQUEST};
use ajplb_common::protocol::{ForwardRequest, MessageBuffer, ReplyPacket};
use ajplb_common::transport::TcpTransport;
use tokio::net::{TcpListener, TcpStream};

/// How the fake container answers forwarded requests.
#[derive(Debug, Clone)]
pub enum Behavior {
    /// Reply with this status and a body naming the backend
    Respond(u16),
    /// Never answer
    Hang,
    /// Drop the connection after reading the request
    Close,
}

pub struct FakeBackend {
    pub name: String,
    pub addr: SocketAddr,
    requests: Arc<Mutex<Vec<ForwardRequest>>>,
    accepted: Arc<AtomicUsize>,
}

impl FakeBackend {
    pub async fn start(name: &str, behavior: Behavior) -> Self {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let requests = Arc::new(Mutex::new(Vec::new()));
        let accepted = Arc::new(AtomicUsize::new(0));

        let (seen, count, label) = (requests.clone(), accepted.clone(), name.to_string());
        tokio::spawn(async move {
            while let Ok((sock, _)) = listener.accept().await {
                count.fetch_add(1, Ordering::SeqCst);
                tokio::spawn(serve(sock, behavior.clone(), label.clone(), seen.clone()));
            }
        });

        Self {
            name: name.to_string(),
            addr,
            requests,
            accepted,
        }
    }

    /// A backend whose port accepts nothing.
    pub async fn unreachable(name: &str) -> Self {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        drop(listener);
        Self {
            name: name.to_string(),
            addr,
            requests: Arc::default(),
            accepted: Arc::default(),
        }
    }

    pub fn port(&self) -> u16 {
        self.addr.port()
    }

    /// Forwarded requests received so far, CPINGs excluded.
    pub fn requests(&self) -> Vec<ForwardRequest> {
        self.requests.lock().unwrap().clone()
    }

    pub fn hits(&self) -> usize {
        self.requests.lock().unwrap().len()
    }

    pub fn connections(&self) -> usize {
        self.accepted.load(Ordering::SeqCst)
    }

    pub fn worker_config(&self) -> WorkerConfig {
        WorkerConfig::new(self.name.as_str(), "127.0.0.1", self.port())
    }
}

async fn serve(
    mut sock: TcpStream,
    behavior: Behavior,
    name: String,
    seen: Arc<Mutex<Vec<ForwardRequest>>>,
) {
    let mut msg = MessageBuffer::new(65536);
    loop {
        if TcpTransport::receive_message(&mut sock, &mut msg, AJP13_WS_HEADER, None)
            .await
            .is_err()
        {
            return;
        }
        if msg.peek_u8().ok() == Some(JK_AJP13_CPING_REQUEST) {
            if send(&mut sock, &mut msg, ReplyPacket::CPong).await.is_err() {
                return;
            }
            continue;
        }
        let Ok(mut request) = ForwardRequest::decode(&mut msg) else {
            return;
        };

        let length: usize = request
            .header("content-length")
            .and_then(|v| v.parse().ok())
            .unwrap_or(0);
        if length > 0 && read_body(&mut sock, &mut msg, length, &mut request.body).await.is_err() {
            return;
        }
        seen.lock().unwrap().push(request.clone());

        match &behavior {
            Behavior::Respond(status) => {
                let body = format!("{} {} {}", name, request.method, request.uri);
                let packets = [
                    ReplyPacket::SendHeaders {
                        status: *status,
                        reason: "OK".to_string(),
                        headers: vec![
                            ("Content-Type".to_string(), "text/plain".to_string()),
                            ("X-Backend".to_string(), name.clone()),
                        ],
                    },
                    ReplyPacket::BodyChunk(body.into_bytes()),
                    ReplyPacket::EndResponse { reuse: true },
                ];
                for packet in packets {
                    if send(&mut sock, &mut msg, packet).await.is_err() {
                        return;
                    }
                }
            }
            Behavior::Hang => {
                tokio::time::sleep(Duration::from_secs(3600)).await;
                return;
            }
            Behavior::Close => return,
        }
    }
}

/// Reads the first body packet, then asks for more until `length` bytes arrived.
async fn read_body(
    sock: &mut TcpStream,
    msg: &mut MessageBuffer,
    length: usize,
    body: &mut Vec<u8>,
) -> ajplb_common::Result<()> {
    loop {
        TcpTransport::receive_message(sock, msg, AJP13_WS_HEADER, None).await?;
        if msg.payload_len() == 0 {
            return Ok(());
        }
        body.extend_from_slice(msg.read_chunk()?);
        if body.len() >= length {
            return Ok(());
        }
        send(sock, msg, ReplyPacket::GetBodyChunk(8186)).await?;
    }
}

async fn send(sock: &mut TcpStream, msg: &mut MessageBuffer, packet: ReplyPacket) -> ajplb_common::Result<()> {
    packet.encode(msg)?;
    TcpTransport::send_message(sock, msg, None).await?;
    Ok(())
}

/// Connector configuration with one worker per backend and a balancer
/// `lb` over all of them.
pub fn balanced_config(backends: &[&FakeBackend]) -> ConnectorConfig {
    let toml = format!(
        "[[balancer]]\nname = \"lb\"\nretry_interval_ms = 10\n{}",
        backends
            .iter()
            .map(|b| format!("[[balancer.member]]\nworker = \"{}\"\n", b.name))
            .collect::<String>()
    );
    let mut config: ConnectorConfig = toml::from_str(&toml).unwrap();
    config.workers = backends.iter().map(|b| b.worker_config()).collect();
    config.validate().unwrap();
    config
}
