use async_trait::async_trait;
use reqwest::{Certificate, Method, StatusCode};
use std::net::{IpAddr, SocketAddr};
use std::time::Duration;
use thiserror::Error;
use tracing::debug;

use crate::config::ConfigError;

/// Limits TCP connect and request transmission.
const SEND_TIMEOUT: Duration = Duration::from_secs(60);
/// Limits each read while draining the response.
const RECV_TIMEOUT: Duration = Duration::from_secs(30);

/// Whole-exchange deadline for job API requests.
pub(crate) const API_REQUEST_TIMEOUT: Duration = Duration::from_secs(30);
/// Whole-exchange deadline for provisioning, which normally ends with the
/// server dropping the connection rather than replying.
pub(crate) const PROVISION_REQUEST_TIMEOUT: Duration = Duration::from_secs(15);

#[derive(Debug, Error)]
pub enum TransportError {
    #[error("could not set up HTTP client: {0}")]
    Setup(String),

    #[error("connection failed: {0}")]
    Connect(String),

    #[error("request timed out: {0}")]
    Timeout(String),

    #[error("connection closed before a response was received: {0}")]
    NoResponse(String),

    #[error("failed to read response body: {0}")]
    Body(String),
}

/// Where one exchange should be dialed to.
#[derive(Clone, Debug)]
pub(crate) struct Endpoint {
    pub hostname: String,
    pub port: u16,
    /// Dial this address instead of resolving the hostname. TLS server
    /// name and certificate checks still use the hostname.
    pub pin_ip: Option<IpAddr>,
    /// Bind the socket to the configured carrier interface.
    pub use_apn: bool,
    /// Plain HTTP, for exchanges against a local test server only.
    pub(crate) plain_http: bool,
}

impl Endpoint {
    pub(crate) fn new(hostname: impl Into<String>, port: u16) -> Self {
        Self {
            hostname: hostname.into(),
            port,
            pin_ip: None,
            use_apn: false,
            plain_http: false,
        }
    }
}

#[derive(Clone, Debug)]
pub(crate) struct HttpRequest {
    pub method: Method,
    /// Path and query, starting with `/`.
    pub path: String,
    pub accept: &'static str,
    /// Full `Authorization` header value.
    pub bearer: Option<String>,
    /// JSON body, sent with `Content-Type: application/json`.
    pub body: Option<String>,
    /// Ask the server to close the connection after replying.
    pub connection_close: bool,
    pub timeout: Duration,
}

#[derive(Clone, Debug)]
pub(crate) struct HttpReply {
    pub status: StatusCode,
    pub body: String,
}

/// Seam between the protocol client and the network. One call is one
/// request/response exchange on a dedicated connection; the connection is
/// gone when the call returns, whichever way it went.
#[async_trait]
pub(crate) trait Connector: Send + Sync {
    async fn exchange(
        &self,
        endpoint: &Endpoint,
        request: &HttpRequest,
    ) -> Result<HttpReply, TransportError>;
}

/// Production connector: dials a fresh TLS connection per exchange with
/// peer verification always on.
pub(crate) struct TlsConnector {
    apn: Option<String>,
    trust_anchor: Option<Certificate>,
}

impl TlsConnector {
    pub(crate) fn new(
        apn: Option<String>,
        trust_anchor_pem: Option<&str>,
    ) -> Result<Self, ConfigError> {
        let trust_anchor = trust_anchor_pem
            .map(|pem| Certificate::from_pem(pem.as_bytes()))
            .transpose()
            .map_err(|err| ConfigError::InvalidTrustAnchor(err.to_string()))?;

        Ok(Self { apn, trust_anchor })
    }
}

#[async_trait]
impl Connector for TlsConnector {
    async fn exchange(
        &self,
        endpoint: &Endpoint,
        request: &HttpRequest,
    ) -> Result<HttpReply, TransportError> {
        let mut builder = reqwest::Client::builder()
            .connect_timeout(SEND_TIMEOUT)
            .read_timeout(RECV_TIMEOUT);

        if let Some(ip) = endpoint.pin_ip {
            debug!(address = %ip, hostname = %endpoint.hostname, "dialing fixed address");
            builder = builder.resolve(&endpoint.hostname, SocketAddr::new(ip, endpoint.port));
        }

        #[cfg(any(target_os = "android", target_os = "fuchsia", target_os = "linux"))]
        if endpoint.use_apn {
            if let Some(apn) = self.apn.as_deref() {
                debug!(apn, "binding socket to carrier interface");
                builder = builder.interface(apn);
            }
        }

        if let Some(anchor) = &self.trust_anchor {
            builder = builder
                .tls_built_in_root_certs(false)
                .add_root_certificate(anchor.clone());
        }

        let client = builder
            .build()
            .map_err(|err| TransportError::Setup(err.to_string()))?;

        let scheme = if endpoint.plain_http { "http" } else { "https" };
        let url = format!(
            "{scheme}://{}:{}{}",
            endpoint.hostname, endpoint.port, request.path
        );

        let mut req = client
            .request(request.method.clone(), url)
            .timeout(request.timeout)
            .header("Accept", request.accept);
        if request.connection_close {
            req = req.header("Connection", "close");
        }
        if let Some(bearer) = &request.bearer {
            req = req.header("Authorization", bearer);
        }
        if let Some(body) = &request.body {
            req = req
                .header("Content-Type", "application/json")
                .body(body.clone());
        }

        let response = req.send().await.map_err(classify_send_error)?;
        let status = response.status();
        debug!(response = %status, "exchange complete");

        let body = response
            .text()
            .await
            .map_err(|err| TransportError::Body(err.to_string()))?;

        Ok(HttpReply { status, body })
    }
}

fn classify_send_error(err: reqwest::Error) -> TransportError {
    if err.is_connect() {
        TransportError::Connect(err.to_string())
    } else if err.is_timeout() {
        TransportError::Timeout(err.to_string())
    } else {
        // The request went out but the connection died before a complete
        // response came back
        TransportError::NoResponse(err.to_string())
    }
}
