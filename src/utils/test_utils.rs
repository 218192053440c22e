//! Test doubles: a scripted provider adapter and a one-shot HTTP stub.

use std::collections::VecDeque;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use futures_util::{stream, StreamExt};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::task::JoinHandle;

use crate::api::{ChatRequest, ChatResponse};
use crate::character::Character;
use crate::core::providers::{
    Increment, IncrementStream, ProviderAdapter, ProviderConfig, ProviderError, ProviderKind,
};

pub fn test_client() -> reqwest::Client {
    reqwest::Client::builder()
        .no_proxy()
        .build()
        .expect("test client builds")
}

pub fn scripted_config(id: &str) -> ProviderConfig {
    ProviderConfig::new(id, ProviderKind::Custom, "scripted-model")
        .with_base_url("http://scripted.invalid/v1")
        .with_context_size(4096)
}

pub fn aria() -> Character {
    let mut character = Character::new("aria", "Aria", "A cheerful guide who loves {{user}}.");
    character.greeting = Some("Hello! I'm {{char}}.".to_string());
    character
}

enum Attempt {
    Reject(ProviderError),
    Stream {
        items: Vec<Result<Increment, ProviderError>>,
        stall: bool,
    },
}

/// Adapter whose responses are scripted per attempt. Every call to `send`
/// consumes the next scripted attempt.
pub struct ScriptedAdapter {
    config: ProviderConfig,
    attempts: Mutex<VecDeque<Attempt>>,
    requests: Mutex<Vec<ChatRequest>>,
}

impl ScriptedAdapter {
    pub fn new(config: ProviderConfig) -> Self {
        Self {
            config,
            attempts: Mutex::new(VecDeque::new()),
            requests: Mutex::new(Vec::new()),
        }
    }

    fn push(self, attempt: Attempt) -> Self {
        self.attempts
            .lock()
            .expect("script lock")
            .push_back(attempt);
        self
    }

    /// Stream `deltas` and finish normally.
    pub fn reply(self, deltas: &[&str]) -> Self {
        let mut items: Vec<_> = deltas.iter().map(|d| Ok(Increment::delta(*d))).collect();
        items.push(Ok(Increment::terminal("")));
        self.push(Attempt::Stream {
            items,
            stall: false,
        })
    }

    /// Fail before any increment is produced.
    pub fn fail(self, error: ProviderError) -> Self {
        self.push(Attempt::Reject(error))
    }

    /// Stream `deltas`, then fail.
    pub fn fail_after(self, deltas: &[&str], error: ProviderError) -> Self {
        let mut items: Vec<_> = deltas.iter().map(|d| Ok(Increment::delta(*d))).collect();
        items.push(Err(error));
        self.push(Attempt::Stream {
            items,
            stall: false,
        })
    }

    /// Stream `deltas`, then never produce anything again.
    pub fn stall_after(self, deltas: &[&str]) -> Self {
        let items = deltas.iter().map(|d| Ok(Increment::delta(*d))).collect();
        self.push(Attempt::Stream { items, stall: true })
    }

    pub fn requests(&self) -> Vec<ChatRequest> {
        self.requests.lock().expect("request lock").clone()
    }

    pub fn attempts_made(&self) -> usize {
        self.requests.lock().expect("request lock").len()
    }
}

#[async_trait]
impl ProviderAdapter for ScriptedAdapter {
    fn config(&self) -> &ProviderConfig {
        &self.config
    }

    async fn complete(&self, _request: &ChatRequest) -> Result<ChatResponse, ProviderError> {
        Err(ProviderError::Malformed(
            "scripted adapter only streams".into(),
        ))
    }

    async fn send(&self, request: &ChatRequest) -> Result<IncrementStream, ProviderError> {
        self.requests
            .lock()
            .expect("request lock")
            .push(request.clone());
        let attempt = self.attempts.lock().expect("script lock").pop_front();
        match attempt {
            None => Err(ProviderError::Malformed("script exhausted".into())),
            Some(Attempt::Reject(error)) => Err(error),
            Some(Attempt::Stream { items, stall }) => {
                let scripted = stream::iter(items);
                if stall {
                    Ok(Box::pin(scripted.chain(stream::pending())))
                } else {
                    Ok(Box::pin(scripted))
                }
            }
        }
    }
}

/// A canned HTTP response served by [`spawn_http_stub`].
#[derive(Debug, Clone)]
pub struct StubResponse {
    status: u16,
    content_type: &'static str,
    headers: Vec<(String, String)>,
    body: String,
}

impl StubResponse {
    pub fn json(status: u16, body: &str) -> Self {
        Self {
            status,
            content_type: "application/json",
            headers: Vec::new(),
            body: body.to_string(),
        }
    }

    /// An event stream with one `data:` line per payload.
    pub fn sse(payloads: &[&str]) -> Self {
        let body = payloads
            .iter()
            .map(|payload| format!("data: {payload}\n\n"))
            .collect();
        Self {
            status: 200,
            content_type: "text/event-stream",
            headers: Vec::new(),
            body,
        }
    }

    pub fn with_header(mut self, name: &str, value: &str) -> Self {
        self.headers.push((name.to_string(), value.to_string()));
        self
    }
}

#[derive(Debug, Clone)]
pub struct RecordedRequest {
    pub request_line: String,
    pub headers: Vec<(String, String)>,
    pub body: String,
}

impl RecordedRequest {
    pub fn header(&self, name: &str) -> Option<String> {
        self.headers
            .iter()
            .find(|(key, _)| key.eq_ignore_ascii_case(name))
            .map(|(_, value)| value.clone())
    }
}

pub struct HttpStub {
    /// Base URL ending in `/v1`.
    pub base_url: String,
    recorded: Arc<tokio::sync::Mutex<Vec<RecordedRequest>>>,
    _server: JoinHandle<()>,
}

impl HttpStub {
    pub async fn requests(&self) -> Vec<RecordedRequest> {
        self.recorded.lock().await.clone()
    }
}

/// Serve `responses` in order, one connection each, then stop listening.
pub async fn spawn_http_stub(responses: Vec<StubResponse>) -> HttpStub {
    let listener = TcpListener::bind("127.0.0.1:0")
        .await
        .expect("bind stub listener");
    let addr = listener.local_addr().expect("stub address");
    let recorded = Arc::new(tokio::sync::Mutex::new(Vec::new()));
    let recorded_for_server = Arc::clone(&recorded);

    let server = tokio::spawn(async move {
        for response in responses {
            let Ok((mut stream, _)) = listener.accept().await else {
                return;
            };
            match read_http_request(&mut stream).await {
                Ok(request) => recorded_for_server.lock().await.push(request),
                Err(_) => return,
            }
            let _ = write_response(&mut stream, &response).await;
        }
    });

    HttpStub {
        base_url: format!("http://{addr}/v1"),
        recorded,
        _server: server,
    }
}

async fn read_http_request(stream: &mut TcpStream) -> Result<RecordedRequest, String> {
    let mut buffer = Vec::new();
    let mut header_end = None;
    while header_end.is_none() {
        let mut chunk = [0_u8; 1024];
        let read = stream
            .read(&mut chunk)
            .await
            .map_err(|err| err.to_string())?;
        if read == 0 {
            return Err("Unexpected EOF while reading HTTP headers".to_string());
        }
        buffer.extend_from_slice(&chunk[..read]);
        header_end = buffer
            .windows(4)
            .position(|window| window == b"\r\n\r\n")
            .map(|index| index + 4);
    }

    let header_end = header_end.expect("header end should exist");
    let header_text =
        std::str::from_utf8(&buffer[..header_end]).map_err(|err| err.to_string())?;
    let mut lines = header_text.split("\r\n").filter(|line| !line.is_empty());
    let request_line = lines
        .next()
        .ok_or_else(|| "Missing HTTP request line".to_string())?
        .to_string();

    let mut headers = Vec::new();
    let mut content_length = 0_usize;
    for line in lines {
        let Some((name, value)) = line.split_once(':') else {
            continue;
        };
        let value = value.trim().to_string();
        if name.eq_ignore_ascii_case("content-length") {
            content_length = value.parse::<usize>().map_err(|err| err.to_string())?;
        }
        headers.push((name.to_string(), value));
    }

    let mut body = buffer[header_end..].to_vec();
    while body.len() < content_length {
        let mut chunk = vec![0_u8; content_length - body.len()];
        let read = stream
            .read(&mut chunk)
            .await
            .map_err(|err| err.to_string())?;
        if read == 0 {
            break;
        }
        body.extend_from_slice(&chunk[..read]);
    }

    Ok(RecordedRequest {
        request_line,
        headers,
        body: String::from_utf8_lossy(&body).into_owned(),
    })
}

async fn write_response(stream: &mut TcpStream, response: &StubResponse) -> std::io::Result<()> {
    let mut head = format!(
        "HTTP/1.1 {} Stub\r\nContent-Type: {}\r\nContent-Length: {}\r\nConnection: close\r\n",
        response.status,
        response.content_type,
        response.body.len()
    );
    for (name, value) in &response.headers {
        head.push_str(&format!("{name}: {value}\r\n"));
    }
    head.push_str("\r\n");

    stream.write_all(head.as_bytes()).await?;
    stream.write_all(response.body.as_bytes()).await?;
    stream.flush().await?;
    stream.shutdown().await
}
