#![allow(dead_code)]

use std::path::Path;
use std::sync::Arc;

use async_trait::async_trait;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpListener;
use tokio::sync::{Mutex, mpsc};
use tokio::task::JoinHandle;
use tokio::time::{Duration, timeout};

use trainer_agent::error::UploadError;
use trainer_agent::protocol::OutboundEvent;
use trainer_agent::session::AgentSession;
use trainer_agent::upload::ArtifactUploader;

/// Serves exactly one HTTP request with `status` and `body`, returning the raw request.
pub async fn one_shot_http(status: u16, body: &'static str) -> (String, JoinHandle<Vec<u8>>) {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let handle = tokio::spawn(async move {
        let (mut stream, _) = listener.accept().await.unwrap();
        let mut request = Vec::new();
        let mut buf = [0u8; 8192];
        loop {
            let n = stream.read(&mut buf).await.unwrap();
            if n == 0 {
                break;
            }
            request.extend_from_slice(&buf[..n]);
            if request_complete(&request) {
                break;
            }
        }
        let response = format!(
            "HTTP/1.1 {status} Status\r\nContent-Type: application/json\r\nContent-Length: {}\r\nConnection: close\r\n\r\n{body}",
            body.len()
        );
        stream.write_all(response.as_bytes()).await.unwrap();
        stream.shutdown().await.ok();
        request
    });
    (format!("http://{addr}"), handle)
}

/// Accepts connections and never answers them. Accepted sockets stay open.
pub async fn silent_http() -> (String, JoinHandle<()>) {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let handle = tokio::spawn(async move {
        let mut held = Vec::new();
        while let Ok((stream, _)) = listener.accept().await {
            held.push(stream);
        }
    });
    (format!("http://{addr}"), handle)
}

fn request_complete(request: &[u8]) -> bool {
    let Some(header_end) = find(request, b"\r\n\r\n") else {
        return false;
    };
    let head = String::from_utf8_lossy(&request[..header_end]).to_ascii_lowercase();
    let body = &request[header_end + 4..];
    for line in head.lines() {
        if let Some(value) = line.strip_prefix("content-length:") {
            let expected: usize = value.trim().parse().unwrap_or(0);
            return body.len() >= expected;
        }
    }
    if head.contains("transfer-encoding: chunked") {
        return body.ends_with(b"0\r\n\r\n");
    }
    true
}

fn find(haystack: &[u8], needle: &[u8]) -> Option<usize> {
    haystack
        .windows(needle.len())
        .position(|window| window == needle)
}

/// Attaches a channel to `session` and returns its receiving end.
pub async fn capture_events(session: &AgentSession) -> mpsc::UnboundedReceiver<OutboundEvent> {
    let (tx, rx) = mpsc::unbounded_channel();
    session.attach_outbound(tx).await;
    rx
}

/// Receives events until one is terminal for a job, returning all of them.
pub async fn events_until_terminal(
    rx: &mut mpsc::UnboundedReceiver<OutboundEvent>,
) -> Vec<OutboundEvent> {
    let mut events = Vec::new();
    loop {
        let event = timeout(Duration::from_secs(20), rx.recv())
            .await
            .expect("timed out waiting for job events")
            .expect("event channel closed");
        let terminal = matches!(
            event,
            OutboundEvent::TrainingCompleted { .. } | OutboundEvent::TrainingFailed { .. }
        );
        events.push(event);
        if terminal {
            return events;
        }
    }
}

/// Records uploads and answers with a fixed outcome.
pub struct FakeUploader {
    pub calls: Mutex<Vec<(String, String)>>,
    reply: Result<String, u16>,
}

impl FakeUploader {
    pub fn accepting(server_path: &str) -> Arc<Self> {
        Arc::new(Self {
            calls: Mutex::new(Vec::new()),
            reply: Ok(server_path.to_string()),
        })
    }

    pub fn failing(status: u16) -> Arc<Self> {
        Arc::new(Self {
            calls: Mutex::new(Vec::new()),
            reply: Err(status),
        })
    }
}

#[async_trait]
impl ArtifactUploader for FakeUploader {
    async fn upload(
        &self,
        training_id: &str,
        _local_file: &Path,
        relative_path: &str,
    ) -> Result<String, UploadError> {
        self.calls
            .lock()
            .await
            .push((training_id.to_string(), relative_path.to_string()));
        match &self.reply {
            Ok(path) => Ok(path.clone()),
            Err(status) => Err(UploadError::Status {
                status: *status,
                body: String::from("storage offline"),
            }),
        }
    }
}
