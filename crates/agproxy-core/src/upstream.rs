//! The upstream HTTP seam.
//!
//! The dispatcher talks to this trait; the wreq-backed implementation is
//! the only place that owns sockets, which keeps the engine drivable by a
//! scripted client in tests.

use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use tokio::sync::mpsc;

pub type Headers = Vec<(String, String)>;
pub type ByteStream = mpsc::Receiver<Bytes>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HttpMethod {
    Get,
    Post,
}

#[derive(Debug)]
pub struct HttpRequest {
    pub method: HttpMethod,
    pub url: String,
    pub headers: Headers,
    pub body: Option<Bytes>,
    /// Deliver the response body incrementally instead of buffering.
    pub stream: bool,
    pub timeout: Duration,
}

#[derive(Debug)]
pub enum HttpBody {
    Bytes(Bytes),
    Stream(ByteStream),
}

#[derive(Debug)]
pub struct HttpResponse {
    pub status: u16,
    pub headers: Headers,
    pub body: HttpBody,
}

impl HttpResponse {
    pub async fn into_bytes(self) -> Bytes {
        match self.body {
            HttpBody::Bytes(bytes) => bytes,
            HttpBody::Stream(mut rx) => {
                let mut out = Vec::new();
                while let Some(chunk) = rx.recv().await {
                    out.extend_from_slice(&chunk);
                }
                Bytes::from(out)
            }
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransportErrorKind {
    Timeout,
    Connect,
    Other,
}

#[derive(Debug, Clone)]
pub struct TransportError {
    pub kind: TransportErrorKind,
    pub message: String,
}

impl std::fmt::Display for TransportError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{:?}: {}", self.kind, self.message)
    }
}

impl std::error::Error for TransportError {}

impl TransportError {
    pub fn is_timeout(&self) -> bool {
        self.kind == TransportErrorKind::Timeout
    }
}

#[async_trait]
pub trait UpstreamClient: Send + Sync {
    async fn request(&self, request: HttpRequest) -> Result<HttpResponse, TransportError>;
}

pub struct WreqClient {
    client: wreq::Client,
}

impl WreqClient {
    pub fn new(proxy: Option<&str>) -> Result<Self, TransportError> {
        let mut builder = wreq::Client::builder();
        if let Some(proxy) = proxy
            && !proxy.is_empty()
        {
            let proxy = wreq::Proxy::all(proxy).map_err(|err| TransportError {
                kind: TransportErrorKind::Other,
                message: err.to_string(),
            })?;
            builder = builder.proxy(proxy);
        }
        let client = builder.build().map_err(|err| TransportError {
            kind: TransportErrorKind::Other,
            message: err.to_string(),
        })?;
        Ok(Self { client })
    }

    fn classify(err: &wreq::Error) -> TransportErrorKind {
        if err.is_timeout() {
            TransportErrorKind::Timeout
        } else if err.is_connect() {
            TransportErrorKind::Connect
        } else {
            TransportErrorKind::Other
        }
    }
}

#[async_trait]
impl UpstreamClient for WreqClient {
    async fn request(&self, request: HttpRequest) -> Result<HttpResponse, TransportError> {
        let mut builder = match request.method {
            HttpMethod::Get => self.client.get(&request.url),
            HttpMethod::Post => self.client.post(&request.url),
        };
        for (name, value) in &request.headers {
            builder = builder.header(name, value);
        }
        if let Some(body) = request.body {
            builder = builder.body(body);
        }
        builder = builder.timeout(request.timeout);

        let response = builder.send().await.map_err(|err| TransportError {
            kind: Self::classify(&err),
            message: err.to_string(),
        })?;

        let status = response.status().as_u16();
        let headers = response
            .headers()
            .iter()
            .map(|(name, value)| {
                (
                    name.as_str().to_string(),
                    value.to_str().unwrap_or_default().to_string(),
                )
            })
            .collect();

        if request.stream && (200..300).contains(&status) {
            let (tx, rx) = mpsc::channel(32);
            tokio::spawn(async move {
                let mut body = response;
                loop {
                    match body.chunk().await {
                        Ok(Some(chunk)) => {
                            if tx.send(chunk).await.is_err() {
                                return;
                            }
                        }
                        Ok(None) => return,
                        Err(_) => return,
                    }
                }
            });
            return Ok(HttpResponse {
                status,
                headers,
                body: HttpBody::Stream(rx),
            });
        }

        let bytes = response.bytes().await.map_err(|err| TransportError {
            kind: Self::classify(&err),
            message: err.to_string(),
        })?;
        Ok(HttpResponse {
            status,
            headers,
            body: HttpBody::Bytes(bytes),
        })
    }
}
