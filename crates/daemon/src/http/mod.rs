//! Plain HTTP port
//!
//! Answers HTTP-01 validation requests from the CA and redirects everything
//! else to HTTPS. The challenge path is never redirected, since the CA must
//! be able to fetch it before any trusted certificate exists.

use std::convert::Infallible;
use std::net::SocketAddr;

use bytes::Bytes;
use http::{header, HeaderValue, Method, Request, Response, StatusCode, Uri};
use http_body_util::Full;
use hyper::body::Incoming;
use hyper::server::conn::http1;
use hyper::service::service_fn;
use hyper_util::rt::TokioIo;
use tokio::net::TcpListener;
use tokio::sync::watch;
use tracing::{debug, error, info, trace};

use crate::acme::{ChallengeResponder, ACME_CHALLENGE_PREFIX};

/// Build the response for one request on the HTTP port
///
/// - `GET`/`HEAD /.well-known/acme-challenge/{token}`: `200 text/plain` with
///   the key authorization, or `404` when the token is unknown or empty
/// - other methods on the challenge path: `405`
/// - anything else: `301` to the same path on HTTPS
pub fn route_request(
    method: &Method,
    uri: &Uri,
    host: Option<&str>,
    challenges: &ChallengeResponder,
    public_https_port: u16,
) -> Response<Full<Bytes>> {
    let path = uri.path();

    if path.starts_with(ACME_CHALLENGE_PREFIX) {
        if method != Method::GET && method != Method::HEAD {
            return status_only(StatusCode::METHOD_NOT_ALLOWED);
        }

        let key_authorization = ChallengeResponder::extract_token(path)
            .and_then(|token| challenges.lookup(token));

        return match key_authorization {
            Some(key_authorization) => {
                trace!(path = %path, "Served HTTP-01 challenge");
                text(StatusCode::OK, key_authorization)
            }
            None => {
                debug!(path = %path, "Unknown HTTP-01 challenge token");
                status_only(StatusCode::NOT_FOUND)
            }
        };
    }

    let Some(host) = host.and_then(host_without_port) else {
        return status_only(StatusCode::BAD_REQUEST);
    };

    let path_and_query = uri.path_and_query().map(|pq| pq.as_str()).unwrap_or("/");
    let location = if public_https_port == 443 {
        format!("https://{}{}", host, path_and_query)
    } else {
        format!("https://{}:{}{}", host, public_https_port, path_and_query)
    };

    match HeaderValue::from_str(&location) {
        Ok(value) => {
            let mut response = status_only(StatusCode::MOVED_PERMANENTLY);
            response.headers_mut().insert(header::LOCATION, value);
            response
        }
        Err(_) => status_only(StatusCode::BAD_REQUEST),
    }
}

/// Host header minus any port, rejecting values that cannot be a host
fn host_without_port(host: &str) -> Option<&str> {
    let host = host.trim();
    let name = if host.starts_with('[') {
        // IPv6 literal keeps its brackets
        &host[..=host.find(']')?]
    } else {
        match host.rsplit_once(':') {
            Some((name, port)) if port.chars().all(|c| c.is_ascii_digit()) => name,
            Some(_) => return None,
            None => host,
        }
    };

    let valid = !name.is_empty()
        && name
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '.' | '-' | '[' | ']' | ':'));
    valid.then_some(name)
}

fn status_only(status: StatusCode) -> Response<Full<Bytes>> {
    let mut response = Response::new(Full::new(Bytes::new()));
    *response.status_mut() = status;
    response
}

fn text(status: StatusCode, body: String) -> Response<Full<Bytes>> {
    let mut response = Response::new(Full::new(Bytes::from(body)));
    *response.status_mut() = status;
    response.headers_mut().insert(
        header::CONTENT_TYPE,
        HeaderValue::from_static("text/plain"),
    );
    response
}

/// HTTP/1.1 server for the challenge and redirect port
pub struct ChallengeServer {
    listener: TcpListener,
    challenges: ChallengeResponder,
    public_https_port: u16,
}

impl ChallengeServer {
    pub async fn bind(
        addr: SocketAddr,
        challenges: ChallengeResponder,
        public_https_port: u16,
    ) -> std::io::Result<Self> {
        let listener = TcpListener::bind(addr).await?;
        info!(address = %listener.local_addr()?, "HTTP challenge port bound");
        Ok(Self {
            listener,
            challenges,
            public_https_port,
        })
    }

    pub fn local_addr(&self) -> std::io::Result<SocketAddr> {
        self.listener.local_addr()
    }

    /// Serve until `shutdown` flips to `true` or its sender drops
    pub async fn serve(self, mut shutdown: watch::Receiver<bool>) {
        loop {
            tokio::select! {
                accepted = self.listener.accept() => match accepted {
                    Ok((stream, peer)) => {
                        let challenges = self.challenges.clone();
                        let port = self.public_https_port;
                        tokio::spawn(async move {
                            let service = service_fn(move |request: Request<Incoming>| {
                                let challenges = challenges.clone();
                                async move {
                                    let host = request
                                        .headers()
                                        .get(header::HOST)
                                        .and_then(|value| value.to_str().ok())
                                        .or_else(|| request.uri().host());
                                    Ok::<_, Infallible>(route_request(
                                        request.method(),
                                        request.uri(),
                                        host,
                                        &challenges,
                                        port,
                                    ))
                                }
                            });

                            if let Err(e) = http1::Builder::new()
                                .serve_connection(TokioIo::new(stream), service)
                                .await
                            {
                                debug!(peer = %peer, error = %e, "HTTP connection ended with error");
                            }
                        });
                    }
                    Err(e) => {
                        error!(error = %e, "Failed to accept HTTP connection");
                    }
                },
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        break;
                    }
                }
            }
        }
        info!("HTTP challenge port stopped");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use http_body_util::BodyExt;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};

    fn get(path: &str) -> Uri {
        path.parse().unwrap()
    }

    async fn body(response: Response<Full<Bytes>>) -> String {
        let bytes = response.into_body().collect().await.unwrap().to_bytes();
        String::from_utf8(bytes.to_vec()).unwrap()
    }

    #[tokio::test]
    async fn test_registered_token_served() {
        let challenges = ChallengeResponder::new();
        challenges.register("tok-1", "tok-1.thumb");

        let response = route_request(
            &Method::GET,
            &get("/.well-known/acme-challenge/tok-1"),
            Some("example.test"),
            &challenges,
            443,
        );

        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(
            response.headers().get(header::CONTENT_TYPE).unwrap(),
            "text/plain"
        );
        assert_eq!(body(response).await, "tok-1.thumb");
    }

    #[test]
    fn test_unknown_and_empty_tokens_are_404() {
        let challenges = ChallengeResponder::new();

        for path in ["/.well-known/acme-challenge/missing", "/.well-known/acme-challenge/"] {
            let response = route_request(&Method::GET, &get(path), Some("example.test"), &challenges, 443);
            assert_eq!(response.status(), StatusCode::NOT_FOUND, "{}", path);
        }
    }

    #[test]
    fn test_challenge_path_not_redirected_without_host() {
        let challenges = ChallengeResponder::new();
        challenges.register("tok", "tok.thumb");

        let response = route_request(
            &Method::GET,
            &get("/.well-known/acme-challenge/tok"),
            None,
            &challenges,
            443,
        );
        assert_eq!(response.status(), StatusCode::OK);
    }

    #[test]
    fn test_post_to_challenge_path_rejected() {
        let challenges = ChallengeResponder::new();
        let response = route_request(
            &Method::POST,
            &get("/.well-known/acme-challenge/tok"),
            Some("example.test"),
            &challenges,
            443,
        );
        assert_eq!(response.status(), StatusCode::METHOD_NOT_ALLOWED);
    }

    #[test]
    fn test_other_paths_redirect_to_https() {
        let challenges = ChallengeResponder::new();

        let response = route_request(
            &Method::GET,
            &get("/login?next=%2Fhome"),
            Some("example.test:80"),
            &challenges,
            443,
        );
        assert_eq!(response.status(), StatusCode::MOVED_PERMANENTLY);
        assert_eq!(
            response.headers().get(header::LOCATION).unwrap(),
            "https://example.test/login?next=%2Fhome"
        );

        let response = route_request(&Method::GET, &get("/"), Some("example.test"), &challenges, 8443);
        assert_eq!(
            response.headers().get(header::LOCATION).unwrap(),
            "https://example.test:8443/"
        );
    }

    #[test]
    fn test_redirect_requires_sane_host() {
        let challenges = ChallengeResponder::new();

        let response = route_request(&Method::GET, &get("/"), None, &challenges, 443);
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);

        let response = route_request(&Method::GET, &get("/"), Some("evil.test/x"), &challenges, 443);
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    }

    #[test]
    fn test_host_without_port() {
        assert_eq!(host_without_port("example.test"), Some("example.test"));
        assert_eq!(host_without_port("example.test:8080"), Some("example.test"));
        assert_eq!(host_without_port("[::1]:80"), Some("[::1]"));
        assert_eq!(host_without_port("example.test:abc"), None);
        assert_eq!(host_without_port(""), None);
    }

    #[tokio::test]
    async fn test_server_answers_over_tcp() {
        let challenges = ChallengeResponder::new();
        challenges.register("live-token", "live-token.thumb");

        let server = ChallengeServer::bind("127.0.0.1:0".parse().unwrap(), challenges, 443)
            .await
            .unwrap();
        let addr = server.local_addr().unwrap();
        let (stop, stopped) = watch::channel(false);
        let task = tokio::spawn(server.serve(stopped));

        let mut stream = tokio::net::TcpStream::connect(addr).await.unwrap();
        stream
            .write_all(
                b"GET /.well-known/acme-challenge/live-token HTTP/1.1\r\nHost: example.test\r\nConnection: close\r\n\r\n",
            )
            .await
            .unwrap();
        let mut response = String::new();
        stream.read_to_string(&mut response).await.unwrap();

        assert!(response.starts_with("HTTP/1.1 200 OK"), "{}", response);
        assert!(response.ends_with("live-token.thumb"));

        stop.send(true).unwrap();
        task.await.unwrap();
    }
}
