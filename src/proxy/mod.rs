//! Intercepting forward proxy
//!
//! Tunnels allow-listed traffic unmodified, but special-cases one OAuth
//! callback host+path: that request never reaches the real upstream.
//! Instead the proxy exchanges the callback URL for a session cookie jar
//! (see `exchange`) and answers the client with a redirect to the
//! application's result URL carrying the resolved friend code.

mod exchange;

pub use exchange::SessionExchange;

use std::collections::HashSet;
use std::sync::Arc;

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use url::Url;

use crate::config::ProxyConfig;
use crate::error::AppError;

/// Upper bound on a request head; anything larger is rejected
const MAX_HEAD_BYTES: usize = 64 * 1024;

/// Parsed request line + headers of one HTTP request
#[derive(Debug, Clone)]
pub struct RequestHead {
    pub method: String,
    pub target: String,
    pub version: String,
    pub headers: Vec<(String, String)>,
}

impl RequestHead {
    /// Parse a complete head (request line + headers, no body)
    fn parse(raw: &str) -> Result<Self, AppError> {
        let mut lines = raw.split("\r\n");
        let request_line = lines
            .next()
            .ok_or_else(|| AppError::Proxy("empty request head".to_string()))?;

        let mut parts = request_line.split_whitespace();
        let method = parts
            .next()
            .ok_or_else(|| AppError::Proxy("missing method".to_string()))?
            .to_string();
        let target = parts
            .next()
            .ok_or_else(|| AppError::Proxy("missing request target".to_string()))?
            .to_string();
        let version = parts.next().unwrap_or("HTTP/1.0").to_string();

        let mut headers = Vec::new();
        for line in lines {
            if line.is_empty() {
                break;
            }
            if let Some((name, value)) = line.split_once(':') {
                headers.push((name.trim().to_ascii_lowercase(), value.trim().to_string()));
            }
        }

        Ok(Self {
            method,
            target,
            version,
            headers,
        })
    }

    pub fn header(&self, name: &str) -> Option<&str> {
        let name = name.to_ascii_lowercase();
        self.headers
            .iter()
            .find(|(header, _)| *header == name)
            .map(|(_, value)| value.as_str())
    }
}

/// Incremental request-head accumulator.
///
/// Bytes are pushed as they arrive; `push` reports the offset just past
/// the terminating blank line as soon as the head is complete, so a
/// hijack can fire without waiting for (or buffering) any body.
#[derive(Debug, Default)]
pub struct HeadBuffer {
    buf: Vec<u8>,
}

impl HeadBuffer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append bytes; returns the head-end offset once headers are complete.
    ///
    /// # Errors
    /// Fails when the accumulated head exceeds the size bound.
    pub fn push(&mut self, bytes: &[u8]) -> Result<Option<usize>, AppError> {
        self.buf.extend_from_slice(bytes);
        if self.buf.len() > MAX_HEAD_BYTES {
            return Err(AppError::Proxy("request head too large".to_string()));
        }
        Ok(find_head_end(&self.buf))
    }

    /// Parse the completed head; `head_end` comes from `push`.
    /// Returns the head and any bytes received past it.
    pub fn take(self, head_end: usize) -> Result<(RequestHead, Vec<u8>), AppError> {
        let head_text = std::str::from_utf8(&self.buf[..head_end])
            .map_err(|_| AppError::Proxy("request head is not valid UTF-8".to_string()))?;
        let head = RequestHead::parse(head_text)?;
        let leftover = self.buf[head_end..].to_vec();
        Ok((head, leftover))
    }
}

fn find_head_end(buf: &[u8]) -> Option<usize> {
    buf.windows(4)
        .position(|window| window == b"\r\n\r\n")
        .map(|pos| pos + 4)
}

/// Read one request head from `stream`, seeding with `initial` bytes
/// already pulled off the socket.
async fn read_head<S>(
    stream: &mut S,
    initial: Vec<u8>,
) -> Result<(RequestHead, Vec<u8>), AppError>
where
    S: AsyncRead + Unpin,
{
    let mut head = HeadBuffer::new();
    if let Some(end) = head.push(&initial)? {
        return head.take(end);
    }

    let mut chunk = [0u8; 4096];
    loop {
        let n = stream
            .read(&mut chunk)
            .await
            .map_err(|e| AppError::Proxy(format!("socket read failed: {}", e)))?;
        if n == 0 {
            return Err(AppError::Proxy(
                "connection closed before head completed".to_string(),
            ));
        }
        if let Some(end) = head.push(&chunk[..n])? {
            return head.take(end);
        }
    }
}

/// The intercepting proxy server
pub struct InterceptProxy {
    allow_hosts: HashSet<String>,
    callback_host: String,
    callback_path: String,
    result_url: Url,
    exchange: SessionExchange,
    relay_client: reqwest::Client,
}

impl InterceptProxy {
    pub fn new(config: &ProxyConfig, exchange: SessionExchange) -> Result<Self, AppError> {
        let result_url = Url::parse(&config.result_url)
            .map_err(|e| AppError::Config(format!("proxy.result_url is invalid: {}", e)))?;

        let relay_client = reqwest::Client::builder()
            .redirect(reqwest::redirect::Policy::none())
            .build()
            .map_err(|e| AppError::Internal(e.into()))?;

        let mut allow_hosts: HashSet<String> = config
            .allow_hosts
            .iter()
            .map(|host| host.to_ascii_lowercase())
            .collect();
        // The callback host must always be reachable through the proxy.
        allow_hosts.insert(config.callback_host.to_ascii_lowercase());

        Ok(Self {
            allow_hosts,
            callback_host: config.callback_host.to_ascii_lowercase(),
            callback_path: config.callback_path.clone(),
            result_url,
            exchange,
            relay_client,
        })
    }

    /// Accept loop; runs until the listener fails
    pub async fn run(self: Arc<Self>, listener: TcpListener) {
        loop {
            let (stream, peer) = match listener.accept().await {
                Ok(accepted) => accepted,
                Err(error) => {
                    tracing::error!(%error, "Proxy accept failed");
                    continue;
                }
            };

            let proxy = self.clone();
            tokio::spawn(async move {
                if let Err(error) = proxy.handle_connection(stream).await {
                    tracing::debug!(%peer, %error, "Proxy connection ended with error");
                }
            });
        }
    }

    async fn handle_connection(&self, mut stream: TcpStream) -> Result<(), AppError> {
        let (head, leftover) = read_head(&mut stream, Vec::new()).await?;

        if head.method.eq_ignore_ascii_case("CONNECT") {
            self.handle_connect(stream, head).await
        } else {
            self.handle_plain(stream, head, leftover).await
        }
    }

    /// CONNECT handling: hijack the callback host, relay everything else
    /// on the allow-list, refuse the rest.
    async fn handle_connect(&self, mut stream: TcpStream, head: RequestHead) -> Result<(), AppError> {
        let authority = head.target.clone();
        let host = host_of(&authority);

        if host == self.callback_host {
            stream
                .write_all(b"HTTP/1.1 200 Connection Established\r\n\r\n")
                .await
                .map_err(|e| AppError::Proxy(e.to_string()))?;

            // The tunneled request head arrives in the clear; parse it
            // incrementally and fire the hijack on headers-complete.
            let (tunneled, _leftover) = read_head(&mut stream, Vec::new()).await?;
            let scheme = if authority.ends_with(":443") { "https" } else { "http" };
            return self.hijack(stream, &tunneled, scheme, &authority).await;
        }

        if !self.is_allowed(&host) {
            stream
                .write_all(b"HTTP/1.1 403 Forbidden\r\n\r\n")
                .await
                .ok();
            return Err(AppError::Proxy(format!("host not allow-listed: {}", host)));
        }

        let mut upstream = match TcpStream::connect(&authority).await {
            Ok(upstream) => upstream,
            Err(error) => {
                stream
                    .write_all(b"HTTP/1.1 502 Bad Gateway\r\n\r\n")
                    .await
                    .ok();
                return Err(AppError::Proxy(format!(
                    "tunnel connect to {} failed: {}",
                    authority, error
                )));
            }
        };

        stream
            .write_all(b"HTTP/1.1 200 Connection Established\r\n\r\n")
            .await
            .map_err(|e| AppError::Proxy(e.to_string()))?;

        // A socket error on either leg terminates both.
        match tokio::io::copy_bidirectional(&mut stream, &mut upstream).await {
            Ok((up, down)) => {
                tracing::debug!(authority = %authority, up, down, "Tunnel closed");
            }
            Err(error) => {
                tracing::debug!(authority = %authority, %error, "Tunnel aborted");
            }
        }
        Ok(())
    }

    /// The hijack: never forward; exchange the callback for a session jar
    /// and redirect the client to the result URL.
    async fn hijack(
        &self,
        mut stream: TcpStream,
        tunneled: &RequestHead,
        scheme: &str,
        authority: &str,
    ) -> Result<(), AppError> {
        if !tunneled.target.starts_with(&self.callback_path) {
            stream
                .write_all(b"HTTP/1.1 404 Not Found\r\nConnection: close\r\n\r\n")
                .await
                .ok();
            return Ok(());
        }

        let callback_url = Url::parse(&format!("{}://{}{}", scheme, authority, tunneled.target))
            .map_err(|e| AppError::Proxy(format!("bad callback URL: {}", e)))?;

        let location = match self.exchange.exchange(&callback_url).await {
            Ok(friend_code) => {
                let mut url = self.result_url.clone();
                url.query_pairs_mut().append_pair("friend_code", &friend_code);
                url
            }
            Err(error) => {
                // A failed exchange redirects to a generic error page
                // rather than hanging the client.
                tracing::warn!(%error, "Cookie exchange failed");
                let mut url = self.result_url.clone();
                url.query_pairs_mut().append_pair("error", "exchange_failed");
                url
            }
        };

        let response = redirect_response(&location);
        stream
            .write_all(response.as_bytes())
            .await
            .map_err(|e| AppError::Proxy(e.to_string()))?;
        stream.shutdown().await.ok();
        Ok(())
    }

    /// Plain (non-CONNECT) HTTP: hijack the callback, relay the rest.
    async fn handle_plain(
        &self,
        mut stream: TcpStream,
        head: RequestHead,
        leftover: Vec<u8>,
    ) -> Result<(), AppError> {
        let url = Url::parse(&head.target)
            .map_err(|e| AppError::Proxy(format!("expected absolute-form target: {}", e)))?;
        let host = url.host_str().unwrap_or_default().to_ascii_lowercase();

        if host == self.callback_host && url.path().starts_with(&self.callback_path) {
            let location = match self.exchange.exchange(&url).await {
                Ok(friend_code) => {
                    let mut result = self.result_url.clone();
                    result.query_pairs_mut().append_pair("friend_code", &friend_code);
                    result
                }
                Err(error) => {
                    tracing::warn!(%error, "Cookie exchange failed");
                    let mut result = self.result_url.clone();
                    result.query_pairs_mut().append_pair("error", "exchange_failed");
                    result
                }
            };
            let response = redirect_response(&location);
            stream
                .write_all(response.as_bytes())
                .await
                .map_err(|e| AppError::Proxy(e.to_string()))?;
            return Ok(());
        }

        if !self.is_allowed(&host) {
            stream
                .write_all(b"HTTP/1.1 403 Forbidden\r\nConnection: close\r\n\r\n")
                .await
                .ok();
            return Err(AppError::Proxy(format!("host not allow-listed: {}", host)));
        }

        self.relay_plain(&mut stream, &head, url, leftover).await
    }

    /// Relay one plain HTTP request/response pair through the shared client
    async fn relay_plain(
        &self,
        stream: &mut TcpStream,
        head: &RequestHead,
        url: Url,
        leftover: Vec<u8>,
    ) -> Result<(), AppError> {
        let method = http::Method::from_bytes(head.method.as_bytes())
            .map_err(|_| AppError::Proxy(format!("bad method: {}", head.method)))?;

        let mut body = leftover;
        if let Some(length) = head
            .header("content-length")
            .and_then(|value| value.parse::<usize>().ok())
        {
            while body.len() < length {
                let mut chunk = vec![0u8; (length - body.len()).min(16 * 1024)];
                let n = stream
                    .read(&mut chunk)
                    .await
                    .map_err(|e| AppError::Proxy(e.to_string()))?;
                if n == 0 {
                    break;
                }
                body.extend_from_slice(&chunk[..n]);
            }
        }

        let mut builder = self.relay_client.request(method, url);
        for (name, value) in &head.headers {
            if is_hop_by_hop(name) {
                continue;
            }
            builder = builder.header(name, value);
        }
        if !body.is_empty() {
            builder = builder.body(body);
        }

        let response = builder.send().await?;

        let mut raw = format!(
            "HTTP/1.1 {} {}\r\n",
            response.status().as_u16(),
            response.status().canonical_reason().unwrap_or("")
        );
        for (name, value) in response.headers() {
            if is_hop_by_hop(name.as_str()) {
                continue;
            }
            if let Ok(value) = value.to_str() {
                raw.push_str(&format!("{}: {}\r\n", name, value));
            }
        }
        raw.push_str("Connection: close\r\n\r\n");

        let payload = response.bytes().await?;
        stream
            .write_all(raw.as_bytes())
            .await
            .map_err(|e| AppError::Proxy(e.to_string()))?;
        stream
            .write_all(&payload)
            .await
            .map_err(|e| AppError::Proxy(e.to_string()))?;
        Ok(())
    }

    fn is_allowed(&self, host: &str) -> bool {
        self.allow_hosts.contains(host)
    }
}

fn host_of(authority: &str) -> String {
    authority
        .rsplit_once(':')
        .map(|(host, _)| host)
        .unwrap_or(authority)
        .to_ascii_lowercase()
}

fn is_hop_by_hop(name: &str) -> bool {
    matches!(
        name.to_ascii_lowercase().as_str(),
        "connection"
            | "proxy-connection"
            | "keep-alive"
            | "proxy-authenticate"
            | "proxy-authorization"
            | "te"
            | "trailers"
            | "transfer-encoding"
            | "upgrade"
            | "host"
            | "content-length"
    )
}

fn redirect_response(location: &Url) -> String {
    format!(
        "HTTP/1.1 302 Found\r\nLocation: {}\r\nContent-Length: 0\r\nConnection: close\r\n\r\n",
        location
    )
}
