//! Coordinator transport.
//!
//! [`Transport`] is the seam between the node loop and the network so the
//! loop can be driven by a scripted transport in tests.

use std::future::Future;
use std::pin::Pin;
use std::time::Duration;

use bytes::Bytes;
use farm_core::{Command, Request};
use http::header::{CONTENT_TYPE, HOST, USER_AGENT};
use http::{Method, Uri};
use http_body_util::{BodyExt, Full};
use hyper_util::rt::TokioIo;
use tracing::debug;

use crate::error::TransportError;

/// Boxed future returned by [`Transport::exchange`].
pub type ExchangeFuture<'a> =
    Pin<Box<dyn Future<Output = Result<Vec<Command>, TransportError>> + Send + 'a>>;

/// Sends one request batch and returns the coordinator's commands.
pub trait Transport: Send + Sync {
    fn exchange<'a>(&'a self, batch: &'a [Request]) -> ExchangeFuture<'a>;
}

/// Plain HTTP/1.1 transport: one connection per exchange, `POST <base>/farm`.
#[derive(Debug, Clone)]
pub struct HttpTransport {
    /// `host:port` to connect to.
    addr: String,
    /// Value of the `Host` header.
    host: String,
    path: String,
    timeout: Duration,
}

impl HttpTransport {
    /// Parse a coordinator base URL such as `http://farm:8080`.
    pub fn new(server: &str, timeout: Duration) -> Result<Self, TransportError> {
        let invalid = || TransportError::InvalidUrl(server.to_string());
        let uri: Uri = server.parse().map_err(|_| invalid())?;
        if uri.scheme_str() != Some("http") {
            return Err(invalid());
        }
        let authority = uri.authority().ok_or_else(invalid)?;
        let addr = match authority.port_u16() {
            Some(port) => format!("{}:{port}", authority.host()),
            None => format!("{}:80", authority.host()),
        };
        let base = uri.path().trim_end_matches('/');

        Ok(Self {
            addr,
            host: authority.as_str().to_string(),
            path: format!("{base}/farm"),
            timeout,
        })
    }

    /// Address the transport connects to.
    pub fn addr(&self) -> &str {
        &self.addr
    }

    /// Request path, e.g. `/farm`.
    pub fn path(&self) -> &str {
        &self.path
    }

    async fn post(&self, body: Vec<u8>) -> Result<Vec<Command>, TransportError> {
        let stream = tokio::net::TcpStream::connect(&self.addr)
            .await
            .map_err(|source| TransportError::Connect {
                addr: self.addr.clone(),
                source,
            })?;

        let io = TokioIo::new(stream);
        let (mut sender, conn) = hyper::client::conn::http1::handshake(io).await?;

        // Drive the connection in the background.
        tokio::spawn(async move {
            if let Err(e) = conn.await {
                debug!(error = %e, "coordinator connection closed with error");
            }
        });

        let req = http::Request::builder()
            .method(Method::POST)
            .uri(self.path.as_str())
            .header(HOST, self.host.as_str())
            .header(CONTENT_TYPE, "application/json")
            .header(USER_AGENT, concat!("farmgrid-agent/", env!("CARGO_PKG_VERSION")))
            .body(Full::new(Bytes::from(body)))?;

        let resp = sender.send_request(req).await?;
        let status = resp.status();
        let body = resp.into_body().collect().await?.to_bytes();
        if !status.is_success() {
            debug!(%status, body = %String::from_utf8_lossy(&body), "coordinator rejected batch");
            return Err(TransportError::Status(status));
        }
        Ok(serde_json::from_slice(&body)?)
    }
}

impl Transport for HttpTransport {
    fn exchange<'a>(&'a self, batch: &'a [Request]) -> ExchangeFuture<'a> {
        Box::pin(async move {
            let body = serde_json::to_vec(batch)?;
            tokio::time::timeout(self.timeout, self.post(body))
                .await
                .map_err(|_| TransportError::Timeout)?
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::Router;
    use axum::http::StatusCode;
    use axum::routing::post;
    use farm_core::{FrameSpec, Tuning};

    #[test]
    fn parses_base_urls() {
        let t = HttpTransport::new("http://farm:8080", Duration::from_secs(1)).unwrap();
        assert_eq!(t.addr(), "farm:8080");
        assert_eq!(t.path(), "/farm");

        let t = HttpTransport::new("http://farm/render/", Duration::from_secs(1)).unwrap();
        assert_eq!(t.addr(), "farm:80");
        assert_eq!(t.path(), "/render/farm");
    }

    #[test]
    fn rejects_unsupported_urls() {
        for url in ["https://farm:8080", "farm:8080", "not a url", ""] {
            assert!(
                matches!(
                    HttpTransport::new(url, Duration::from_secs(1)),
                    Err(TransportError::InvalidUrl(_))
                ),
                "{url} should be rejected"
            );
        }
    }

    async fn serve(app: Router) -> String {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });
        format!("http://{addr}")
    }

    #[tokio::test]
    async fn exchanges_a_batch() {
        let app = Router::new().route(
            "/farm",
            post(|axum::Json(batch): axum::Json<Vec<Request>>| async move {
                assert!(matches!(batch[0], Request::Identity { .. }));
                axum::Json(vec![
                    Command::Info(Tuning::default()),
                    Command::Kill {
                        uuid: "j".into(),
                        frame: FrameSpec::Single(2),
                    },
                ])
            }),
        );
        let url = serve(app).await;

        let transport = HttpTransport::new(&url, Duration::from_secs(5)).unwrap();
        let batch = vec![Request::Identity {
            name: "n".into(),
            provides: vec![],
            version: None,
        }];
        let commands = transport.exchange(&batch).await.unwrap();
        assert_eq!(commands.len(), 2);
        assert_eq!(commands[0], Command::Info(Tuning::default()));
    }

    #[tokio::test]
    async fn error_status_is_a_failure() {
        let app = Router::new().route(
            "/farm",
            post(|| async { (StatusCode::IM_A_TEAPOT, "identity required") }),
        );
        let url = serve(app).await;

        let transport = HttpTransport::new(&url, Duration::from_secs(5)).unwrap();
        let result = transport.exchange(&[Request::Info]).await;
        assert!(matches!(
            result,
            Err(TransportError::Status(StatusCode::IM_A_TEAPOT))
        ));
    }

    #[tokio::test]
    async fn unreachable_coordinator_is_a_failure() {
        // Bind then drop to get a port nothing listens on.
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        drop(listener);

        let transport =
            HttpTransport::new(&format!("http://{addr}"), Duration::from_secs(5)).unwrap();
        let result = transport.exchange(&[Request::Info]).await;
        assert!(matches!(result, Err(TransportError::Connect { .. })));
    }
}
