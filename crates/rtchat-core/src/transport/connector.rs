use async_trait::async_trait;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpStream;
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::handshake::client::Request;
use tokio_tungstenite::tungstenite::http::HeaderValue;
use tokio_tungstenite::tungstenite::http::header::AUTHORIZATION;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream};
use tracing::debug;

use crate::config::Config;
use crate::error::TransportError;

/// Byte stream a WebSocket can run over.
pub trait Socket: AsyncRead + AsyncWrite + Unpin + Send {}

impl<T: AsyncRead + AsyncWrite + Unpin + Send> Socket for T {}

pub type BoxedSocket = Box<dyn Socket>;

pub type WsStream = WebSocketStream<MaybeTlsStream<BoxedSocket>>;

/// Opens a fresh WebSocket stream. Called for the first connection and for
/// every reconnect attempt.
#[async_trait]
pub trait Connector: Send + Sync + 'static {
    async fn connect(&self) -> Result<WsStream, TransportError>;
}

/// Dials the realtime endpoint with a bearer credential.
#[derive(Clone)]
pub struct WsConnector {
    url: String,
    credential: String,
}

impl WsConnector {
    pub fn new(url: impl Into<String>, credential: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            credential: credential.into(),
        }
    }

    pub fn from_config(config: &Config) -> Self {
        Self::new(config.endpoint_url(), config.api_key.clone())
    }

    pub fn url(&self) -> &str {
        &self.url
    }

    /// Run the WebSocket handshake over an already open socket. TLS is
    /// negotiated first for `wss://` endpoints.
    pub async fn connect_over(&self, socket: BoxedSocket) -> Result<WsStream, TransportError> {
        let request = self.request()?;
        let (stream, _response) = tokio_tungstenite::client_async_tls(request, socket)
            .await
            .map_err(|e| TransportError::Dial(e.to_string()))?;
        Ok(stream)
    }

    fn request(&self) -> Result<Request, TransportError> {
        let mut request = self
            .url
            .as_str()
            .into_client_request()
            .map_err(|e| TransportError::InvalidEndpoint(e.to_string()))?;
        let bearer = HeaderValue::from_str(&format!("Bearer {}", self.credential))
            .map_err(|e| TransportError::InvalidEndpoint(e.to_string()))?;
        request.headers_mut().insert(AUTHORIZATION, bearer);
        Ok(request)
    }
}

impl std::fmt::Debug for WsConnector {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WsConnector")
            .field("url", &self.url)
            .field("credential", &"<redacted>")
            .finish()
    }
}

#[async_trait]
impl Connector for WsConnector {
    async fn connect(&self) -> Result<WsStream, TransportError> {
        let request = self.request()?;
        let (host, port) = endpoint_addr(&request)?;
        debug!(url = %self.url, "Dialing realtime endpoint");
        let tcp = TcpStream::connect((host.as_str(), port))
            .await
            .map_err(|e| TransportError::Dial(e.to_string()))?;
        if let Err(err) = tcp.set_nodelay(true) {
            debug!(error = %err, "Could not disable Nagle");
        }
        self.connect_over(Box::new(tcp)).await
    }
}

fn endpoint_addr(request: &Request) -> Result<(String, u16), TransportError> {
    let uri = request.uri();
    let host = uri
        .host()
        .ok_or_else(|| TransportError::InvalidEndpoint(format!("no host in {uri}")))?;
    let port = match (uri.port_u16(), uri.scheme_str()) {
        (Some(port), _) => port,
        (None, Some("wss")) => 443,
        (None, Some("ws")) => 80,
        (None, _) => {
            return Err(TransportError::InvalidEndpoint(format!(
                "unsupported scheme in {uri}"
            )));
        }
    };
    let host = host.trim_start_matches('[').trim_end_matches(']');
    Ok((host.to_owned(), port))
}
