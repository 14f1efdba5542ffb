use std::io::{self, ErrorKind};
use std::net::TcpStream;
use std::time::Duration;

use anyhow::{Context, Result};
use reqwest::blocking::Client as HttpClient;
use reqwest::header::{HeaderMap, HeaderValue, ACCEPT, ACCEPT_LANGUAGE, CONTENT_TYPE, COOKIE, REFERER};
use serde_json::Value;
use tracing::debug;
use tungstenite::client::IntoClientRequest;
use tungstenite::error::ProtocolError;
use tungstenite::stream::MaybeTlsStream;
use tungstenite::{connect as websocket_connect, Message as WsMessage, WebSocket};

use crate::config::AuthContext;
use crate::fetch::BROWSER_USER_AGENT;

const HTTP_TIMEOUT: Duration = Duration::from_secs(30);
const CHANNEL_READ_TIMEOUT: Duration = Duration::from_millis(500);

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HttpReply {
    pub status: u16,
    pub body: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ChannelEvent {
    Frame(String),
    /// Nothing arrived within the read timeout; the channel is still open.
    Idle,
    Closed,
}

pub trait JobChannel: Send {
    fn send_json(&mut self, value: &Value) -> Result<()>;
    fn recv(&mut self) -> Result<ChannelEvent>;
    fn close(&mut self);
}

/// Raw network operations of the Midjourney web app. Status interpretation is
/// left to the job client.
pub trait MidjourneyTransport: Send + Sync {
    fn get_websocket_token(&self, url: &str, auth: &AuthContext) -> Result<HttpReply>;
    fn post_job(&self, url: &str, auth: &AuthContext, body: &Value) -> Result<HttpReply>;
    fn open_channel(&self, url: &str, auth: &AuthContext) -> Result<Box<dyn JobChannel>>;
}

/// Owns an open channel and closes it when dropped, on every exit path.
pub(crate) struct ChannelSession {
    inner: Box<dyn JobChannel>,
}

impl ChannelSession {
    pub(crate) fn new(inner: Box<dyn JobChannel>) -> Self {
        Self { inner }
    }

    pub(crate) fn send_json(&mut self, value: &Value) -> Result<()> {
        self.inner.send_json(value)
    }

    /// Abrupt drops are reported as [`ChannelEvent::Closed`] so the poll
    /// loop ends the same way it does for a clean close.
    pub(crate) fn recv(&mut self) -> Result<ChannelEvent> {
        match self.inner.recv() {
            Err(err) if is_channel_drop(&err) => {
                debug!("realtime channel dropped: {err:#}");
                Ok(ChannelEvent::Closed)
            }
            other => other,
        }
    }
}

impl Drop for ChannelSession {
    fn drop(&mut self) {
        self.inner.close();
    }
}

pub struct HttpMidjourneyTransport {
    http: HttpClient,
}

impl HttpMidjourneyTransport {
    pub fn new() -> Result<Self> {
        let http = HttpClient::builder()
            .user_agent(BROWSER_USER_AGENT)
            .timeout(HTTP_TIMEOUT)
            .build()
            .context("failed to build Midjourney HTTP client")?;
        Ok(Self { http })
    }

    fn session_headers(auth: &AuthContext) -> Result<HeaderMap> {
        let mut headers = HeaderMap::new();
        headers.insert(
            COOKIE,
            HeaderValue::from_str(&auth.cookie_header()).context("invalid Midjourney auth cookie")?,
        );
        headers.insert(
            REFERER,
            HeaderValue::from_str(&format!("https://{}/", auth.api_base))
                .context("invalid Midjourney referer")?,
        );
        headers.insert("Referrer-Policy", HeaderValue::from_static("origin-when-cross-origin"));
        headers.insert(ACCEPT, HeaderValue::from_static("*/*"));
        headers.insert(ACCEPT_LANGUAGE, HeaderValue::from_static("en-US,en;q=0.9"));
        headers.insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));
        headers.insert("priority", HeaderValue::from_static("u=1, i"));
        headers.insert("sec-fetch-dest", HeaderValue::from_static("empty"));
        headers.insert("sec-fetch-mode", HeaderValue::from_static("cors"));
        headers.insert("sec-fetch-site", HeaderValue::from_static("same-origin"));
        headers.insert("x-csrf-protection", HeaderValue::from_static("1"));
        Ok(headers)
    }

    fn reply(response: reqwest::blocking::Response, what: &str) -> Result<HttpReply> {
        let status = response.status().as_u16();
        let body = response
            .text()
            .with_context(|| format!("{what} response body read failed"))?;
        Ok(HttpReply { status, body })
    }
}

impl MidjourneyTransport for HttpMidjourneyTransport {
    fn get_websocket_token(&self, url: &str, auth: &AuthContext) -> Result<HttpReply> {
        let response = self
            .http
            .get(url)
            .headers(Self::session_headers(auth)?)
            .send()
            .with_context(|| format!("websocket token request failed ({url})"))?;
        Self::reply(response, "websocket token")
    }

    fn post_job(&self, url: &str, auth: &AuthContext, body: &Value) -> Result<HttpReply> {
        let response = self
            .http
            .post(url)
            .headers(Self::session_headers(auth)?)
            .json(body)
            .send()
            .with_context(|| format!("job submission request failed ({url})"))?;
        Self::reply(response, "job submission")
    }

    fn open_channel(&self, url: &str, auth: &AuthContext) -> Result<Box<dyn JobChannel>> {
        let mut request = url
            .into_client_request()
            .context("invalid realtime websocket request")?;
        let headers = request.headers_mut();
        headers.insert(
            "Origin",
            format!("https://{}", auth.api_base)
                .parse()
                .context("invalid realtime origin header")?,
        );
        headers.insert("Sec-WebSocket-Protocol", "graphql-ws".parse()?);
        headers.insert("User-Agent", BROWSER_USER_AGENT.parse()?);
        headers.insert("Cache-Control", "no-cache".parse()?);
        headers.insert("Pragma", "no-cache".parse()?);

        let (mut ws, _) =
            websocket_connect(request).context("failed to connect realtime websocket")?;
        set_socket_read_timeout(&mut ws, Some(CHANNEL_READ_TIMEOUT));
        Ok(Box::new(TungsteniteChannel { ws }))
    }
}

struct TungsteniteChannel {
    ws: WebSocket<MaybeTlsStream<TcpStream>>,
}

impl JobChannel for TungsteniteChannel {
    fn send_json(&mut self, value: &Value) -> Result<()> {
        let raw = serde_json::to_string(value).context("failed to serialize realtime payload")?;
        self.ws
            .send(WsMessage::Text(raw.into()))
            .context("failed to send realtime payload")
    }

    fn recv(&mut self) -> Result<ChannelEvent> {
        let message = match self.ws.read() {
            Ok(message) => message,
            Err(tungstenite::Error::Io(err))
                if matches!(err.kind(), ErrorKind::WouldBlock | ErrorKind::TimedOut) =>
            {
                return Ok(ChannelEvent::Idle);
            }
            Err(err) if is_tungstenite_drop(&err) => return Ok(ChannelEvent::Closed),
            Err(err) => return Err(err).context("realtime read failed"),
        };
        Ok(match message {
            WsMessage::Text(text) => ChannelEvent::Frame(text.to_string()),
            WsMessage::Binary(bytes) => ChannelEvent::Frame(String::from_utf8_lossy(&bytes).to_string()),
            WsMessage::Close(_) => ChannelEvent::Closed,
            _ => ChannelEvent::Idle,
        })
    }

    fn close(&mut self) {
        let _ = self.ws.close(None);
        let _ = self.ws.flush();
    }
}

fn is_channel_drop(err: &anyhow::Error) -> bool {
    err.chain().any(|cause| {
        if let Some(ws_err) = cause.downcast_ref::<tungstenite::Error>() {
            return is_tungstenite_drop(ws_err);
        }
        cause
            .downcast_ref::<io::Error>()
            .is_some_and(|io_err| is_drop_io_error_kind(io_err.kind()))
    })
}

fn is_tungstenite_drop(err: &tungstenite::Error) -> bool {
    match err {
        tungstenite::Error::ConnectionClosed | tungstenite::Error::AlreadyClosed => true,
        tungstenite::Error::Protocol(ProtocolError::ResetWithoutClosingHandshake) => true,
        tungstenite::Error::Io(io_err) => is_drop_io_error_kind(io_err.kind()),
        _ => false,
    }
}

fn is_drop_io_error_kind(kind: ErrorKind) -> bool {
    matches!(
        kind,
        ErrorKind::ConnectionReset
            | ErrorKind::ConnectionAborted
            | ErrorKind::BrokenPipe
            | ErrorKind::UnexpectedEof
            | ErrorKind::NotConnected
    )
}

fn set_socket_read_timeout(ws: &mut WebSocket<MaybeTlsStream<TcpStream>>, timeout: Option<Duration>) {
    match ws.get_mut() {
        MaybeTlsStream::Plain(stream) => {
            let _ = stream.set_read_timeout(timeout);
        }
        MaybeTlsStream::Rustls(stream) => {
            let _ = stream.get_mut().set_read_timeout(timeout);
        }
        _ => {}
    }
}

#[cfg(test)]
mod tests {
    use std::collections::VecDeque;
    use std::sync::{Arc, Mutex};

    use super::*;

    struct ScriptedChannel {
        reads: VecDeque<Result<ChannelEvent>>,
        closed: Arc<Mutex<usize>>,
    }

    impl JobChannel for ScriptedChannel {
        fn send_json(&mut self, _value: &Value) -> Result<()> {
            Ok(())
        }

        fn recv(&mut self) -> Result<ChannelEvent> {
            self.reads.pop_front().unwrap_or(Ok(ChannelEvent::Closed))
        }

        fn close(&mut self) {
            *self.closed.lock().unwrap() += 1;
        }
    }

    fn session(reads: Vec<Result<ChannelEvent>>) -> (ChannelSession, Arc<Mutex<usize>>) {
        let closed = Arc::new(Mutex::new(0));
        let channel = ScriptedChannel {
            reads: reads.into(),
            closed: Arc::clone(&closed),
        };
        (ChannelSession::new(Box::new(channel)), closed)
    }

    #[test]
    fn connection_reset_reads_as_closed() -> anyhow::Result<()> {
        let (mut session, closed) = session(vec![
            Err(anyhow::Error::new(io::Error::from(ErrorKind::ConnectionReset))),
            Err(anyhow::Error::new(tungstenite::Error::Protocol(
                ProtocolError::ResetWithoutClosingHandshake,
            ))
            .context("realtime read failed")),
            Err(anyhow::Error::new(tungstenite::Error::Io(io::Error::from(
                ErrorKind::UnexpectedEof,
            )))),
        ]);

        assert_eq!(session.recv()?, ChannelEvent::Closed);
        assert_eq!(session.recv()?, ChannelEvent::Closed);
        assert_eq!(session.recv()?, ChannelEvent::Closed);
        drop(session);
        assert_eq!(*closed.lock().unwrap(), 1);
        Ok(())
    }

    #[test]
    fn other_read_failures_still_propagate() {
        let (mut session, _closed) = session(vec![Err(anyhow::Error::new(io::Error::from(
            ErrorKind::PermissionDenied,
        )))]);
        assert!(session.recv().is_err());
    }

    #[test]
    fn drop_classification_matches_tungstenite_errors() {
        assert!(is_tungstenite_drop(&tungstenite::Error::ConnectionClosed));
        assert!(is_tungstenite_drop(&tungstenite::Error::Io(io::Error::from(
            ErrorKind::BrokenPipe
        ))));
        assert!(!is_tungstenite_drop(&tungstenite::Error::Io(io::Error::from(
            ErrorKind::WouldBlock
        ))));
        assert!(!is_tungstenite_drop(&tungstenite::Error::Utf8(String::new())));
    }
}
