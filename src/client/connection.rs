//! Connections to Remote Endpoints
//!
//! A [`Connection`] is a reqwest client bound to one endpoint, with the TLS
//! configuration and request timeout applied. Non-success replies are mapped
//! back into [`Error::Rpc`] so that error codes survive the hop.

use super::tls::ClientTlsConfig;
use crate::api::types::{ApiErrorResponse, HealthResponse};
use crate::error::{Error, ErrorCode, Result};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tracing::debug;

/// Default bound for dialing and for single requests
pub const DEFAULT_CONNECTION_TIMEOUT: Duration = Duration::from_secs(10);

/// Connectivity of a connection as seen by the last health check
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ConnectivityState {
    Ready,
    TransientFailure,
}

impl ConnectivityState {
    pub fn is_ready(self) -> bool {
        self == ConnectivityState::Ready
    }
}

impl std::fmt::Display for ConnectivityState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ConnectivityState::Ready => write!(f, "READY"),
            ConnectivityState::TransientFailure => write!(f, "TRANSIENT_FAILURE"),
        }
    }
}

/// Turn an endpoint as given on the command line into a base URL.
///
/// `tcp://` is accepted as an alias for `http://`, a missing scheme means
/// `http://`. Unix sockets are not supported.
pub fn endpoint_url(endpoint: &str) -> Result<String> {
    let endpoint = endpoint.trim().trim_end_matches('/');
    if endpoint.is_empty() {
        return Err(Error::InvalidArgument("empty endpoint".into()));
    }
    let url = if let Some(rest) = endpoint.strip_prefix("tcp://") {
        format!("http://{}", rest)
    } else if endpoint.starts_with("http://") || endpoint.starts_with("https://") {
        endpoint.to_string()
    } else if endpoint.contains("://") {
        return Err(Error::InvalidArgument(format!(
            "unsupported endpoint scheme: {}",
            endpoint
        )));
    } else {
        format!("http://{}", endpoint)
    };
    Ok(url)
}

/// A client bound to one endpoint
#[derive(Debug, Clone)]
pub struct Connection {
    base_url: String,
    client: reqwest::Client,
    timeout: Duration,
}

impl Connection {
    /// Build a connection without contacting the endpoint
    pub fn new(endpoint: &str, tls: &ClientTlsConfig, timeout: Duration) -> Result<Self> {
        let base_url = endpoint_url(endpoint)?;
        let builder = reqwest::Client::builder()
            .connect_timeout(timeout)
            .timeout(timeout);
        let client = tls.apply(builder)?.build()?;
        Ok(Self {
            base_url,
            client,
            timeout,
        })
    }

    /// Dial `endpoint` and wait until it answers, at most `timeout`
    pub async fn connect(endpoint: &str, tls: &ClientTlsConfig, timeout: Duration) -> Result<Self> {
        let connection = Self::new(endpoint, tls, timeout)?;
        match tokio::time::timeout(timeout, connection.check_health()).await {
            Ok(Ok(())) => Ok(connection),
            Ok(Err(e)) => Err(Error::Connection {
                endpoint: endpoint.to_string(),
                reason: e.to_string(),
            }),
            Err(_) => Err(Error::Connection {
                endpoint: endpoint.to_string(),
                reason: format!("no answer within {:?}", timeout),
            }),
        }
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    /// Liveness check against `/healthz`
    pub async fn check_health(&self) -> Result<()> {
        let health: HealthResponse = self.get("/healthz").await?;
        debug!("{} is {}", self.base_url, health.status);
        Ok(())
    }

    /// Probe the endpoint and report the outcome as a connectivity state
    pub async fn connectivity(&self) -> ConnectivityState {
        match self.check_health().await {
            Ok(()) => ConnectivityState::Ready,
            Err(e) => {
                debug!("{} not ready: {}", self.base_url, e);
                ConnectivityState::TransientFailure
            }
        }
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.base_url, path)
    }

    pub async fn get<T: DeserializeOwned>(&self, path: &str) -> Result<T> {
        let request = self.client.get(self.url(path));
        self.send(request).await
    }

    pub async fn post<B: Serialize + ?Sized, T: DeserializeOwned>(
        &self,
        path: &str,
        body: &B,
    ) -> Result<T> {
        let request = self.client.post(self.url(path)).json(body);
        self.send(request).await
    }

    pub async fn delete<T: DeserializeOwned>(&self, path: &str) -> Result<T> {
        let request = self.client.delete(self.url(path));
        self.send(request).await
    }

    async fn send<T: DeserializeOwned>(&self, request: reqwest::RequestBuilder) -> Result<T> {
        let response = request.send().await.map_err(|e| self.transport_error(e))?;
        let status = response.status();
        if status.is_success() {
            return response.json().await.map_err(|e| self.transport_error(e));
        }

        let body = response.text().await.unwrap_or_default();
        Err(match serde_json::from_str::<ApiErrorResponse>(&body) {
            Ok(reply) => Error::Rpc {
                code: reply.error,
                message: reply.message,
            },
            Err(_) => Error::Rpc {
                code: ErrorCode::from_http_status(status.as_u16()),
                message: format!("{}: {}", status, body.trim()),
            },
        })
    }

    fn transport_error(&self, err: reqwest::Error) -> Error {
        if err.is_timeout() {
            Error::Timeout(self.timeout)
        } else if err.is_connect() {
            Error::Connection {
                endpoint: self.base_url.clone(),
                reason: err.to_string(),
            }
        } else {
            Error::Http(err)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use assert_matches::assert_matches;

    #[test]
    fn test_endpoint_url() {
        assert_eq!(endpoint_url("tcp://registry:10000").unwrap(), "http://registry:10000");
        assert_eq!(endpoint_url("10.0.0.1:10001/").unwrap(), "http://10.0.0.1:10001");
        assert_eq!(
            endpoint_url("https://node-1:10001").unwrap(),
            "https://node-1:10001"
        );
        assert_matches!(endpoint_url(""), Err(Error::InvalidArgument(_)));
        assert_matches!(
            endpoint_url("unix:///run/csi.sock"),
            Err(Error::InvalidArgument(_))
        );
    }

    #[tokio::test]
    async fn test_connect_refused() {
        // bind and drop a listener to get a port nobody listens on
        let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();
        drop(listener);

        let err = Connection::connect(
            &addr.to_string(),
            &ClientTlsConfig::default(),
            Duration::from_secs(2),
        )
        .await
        .unwrap_err();
        assert_matches!(err, Error::Connection { .. });
        assert!(err.is_transient());
    }

    #[tokio::test]
    async fn test_unreachable_is_transient_failure() {
        let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();
        drop(listener);

        let connection = Connection::new(
            &addr.to_string(),
            &ClientTlsConfig::default(),
            Duration::from_secs(2),
        )
        .unwrap();
        assert_eq!(
            connection.connectivity().await,
            ConnectivityState::TransientFailure
        );
    }
}
