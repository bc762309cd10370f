use axum::body::Body;
use axum::extract::Request;
use axum::http::uri::{Authority, Scheme, Uri};
use axum::http::{header, StatusCode};
use axum::response::{IntoResponse, Response};
use hyper_util::client::legacy::connect::HttpConnector;
use hyper_util::client::legacy::Client;
use hyper_util::rt::TokioExecutor;
use tracing::error;

use crate::error::GatekeeperError;

/// Headers that belong to the hop between caller and controller, not to the
/// forwarded request (RFC 7230 section 6.1).
const HOP_BY_HOP_HEADERS: [&str; 8] = [
    "connection",
    "keep-alive",
    "proxy-authenticate",
    "proxy-authorization",
    "te",
    "trailer",
    "transfer-encoding",
    "upgrade",
];

/// Single-target reverse proxy handler. Copies method, path, query, headers
/// and body to the configured origin and hands the upstream response back
/// unchanged apart from hop-by-hop rewriting.
pub struct Forwarder {
    scheme: Scheme,
    authority: Authority,
    client: Client<HttpConnector, Body>,
}

impl Forwarder {
    /// Parses and pins the target. Fails on an absent, unparsable, or
    /// non-http URL; a controller without a valid upstream must not start.
    pub fn new(target_url: &str) -> Result<Self, GatekeeperError> {
        let invalid = || GatekeeperError::InvalidTargetUrl(target_url.to_string());

        let uri: Uri = target_url.parse().map_err(|_| invalid())?;
        let scheme = uri.scheme().cloned().ok_or_else(invalid)?;
        let authority = uri.authority().cloned().ok_or_else(invalid)?;
        // TLS origins terminate ahead of the forwarder; the egress hop
        // itself is plain HTTP.
        if scheme != Scheme::HTTP {
            return Err(invalid());
        }

        let client = Client::builder(TokioExecutor::new()).build(HttpConnector::new());
        Ok(Self {
            scheme,
            authority,
            client,
        })
    }

    pub async fn forward(&self, mut request: Request) -> Response {
        let path_and_query = request
            .uri()
            .path_and_query()
            .map(|pq| pq.as_str())
            .unwrap_or("/")
            .to_string();

        let uri = Uri::builder()
            .scheme(self.scheme.clone())
            .authority(self.authority.clone())
            .path_and_query(path_and_query)
            .build();
        let uri = match uri {
            Ok(uri) => uri,
            Err(e) => {
                error!("failed to build upstream URI: {}", e);
                return bad_gateway();
            }
        };
        *request.uri_mut() = uri;

        let headers = request.headers_mut();
        for name in HOP_BY_HOP_HEADERS {
            headers.remove(name);
        }
        // The client derives Host from the target URI once the original is
        // gone.
        headers.remove(header::HOST);

        match self.client.request(request).await {
            Ok(response) => response.map(Body::new),
            Err(e) => {
                error!("upstream request failed: {}", e);
                bad_gateway()
            }
        }
    }
}

fn bad_gateway() -> Response {
    (StatusCode::BAD_GATEWAY, "upstream request failed").into_response()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_valid_target() {
        let forwarder = Forwarder::new("http://127.0.0.1:9000").unwrap();
        assert_eq!(forwarder.authority.as_str(), "127.0.0.1:9000");
    }

    #[test]
    fn test_empty_target_rejected() {
        assert!(matches!(
            Forwarder::new(""),
            Err(GatekeeperError::InvalidTargetUrl(_))
        ));
    }

    #[test]
    fn test_target_without_scheme_rejected() {
        assert!(Forwarder::new("127.0.0.1:9000").is_err());
        assert!(Forwarder::new("not a url").is_err());
    }

    #[test]
    fn test_https_target_rejected() {
        assert!(Forwarder::new("https://origin.example.com").is_err());
    }
}
