//! Raw request forwarding.
//!
//! Every forward opens a fresh connection to the target, writes the captured
//! request over HTTP/1.1, reads back the complete response and renders it as
//! a text dump. Volatile headers are stripped before the dump is rendered so
//! the dump never references headers the comparison ignored.

use hyper::body::Bytes;
use hyper::header::{HeaderMap, HeaderValue, HOST};
use hyper::{Body, Method, Request, Response, Uri, Version};
use std::fmt::Write as _;
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpStream;
use tokio_rustls::rustls::pki_types::ServerName;
use tokio_rustls::TlsConnector;
use tracing::debug;

use crate::errors::ForwardError;

/// Dump and body of a failed control forward.
pub const CONTROL_SENTINEL: &str = "Error forwarding request Control";
/// Dump and body of a failed experiment forward.
pub const EXPERIMENT_SENTINEL: &str = "Error forwarding request Experiment";
/// Status code recorded for a failed forward.
pub const SENTINEL_STATUS: i32 = -1;

/// Which backend a forward was aimed at.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Side {
    Control,
    Experiment,
    Load,
}

impl Side {
    pub fn label(&self) -> &'static str {
        match self {
            Side::Control => "control",
            Side::Experiment => "experiment",
            Side::Load => "load",
        }
    }
}

/// An inbound request, fully buffered so it can be sent more than once.
#[derive(Debug, Clone)]
pub struct CapturedRequest {
    pub method: Method,
    pub uri: Uri,
    pub version: Version,
    pub headers: HeaderMap,
    pub body: Bytes,
}

impl CapturedRequest {
    /// Reads the whole request body. The body of a hyper request can only be
    /// consumed once; the buffered copy is shared by every forward.
    pub async fn capture(req: Request<Body>) -> Result<Self, hyper::Error> {
        let (parts, body) = req.into_parts();
        let body = hyper::body::to_bytes(body).await?;
        Ok(Self {
            method: parts.method,
            uri: parts.uri,
            version: parts.version,
            headers: parts.headers,
            body,
        })
    }

    fn path(&self) -> &str {
        self.uri
            .path_and_query()
            .map(|pq| pq.as_str())
            .unwrap_or("/")
    }

    /// Renders the request the way it appears on the wire.
    pub fn dump(&self) -> String {
        let mut out = format!("{} {} HTTP/1.1\r\n", self.method, self.path());
        write_headers(&mut out, &self.headers);
        out.push_str("\r\n");
        out.push_str(&String::from_utf8_lossy(&self.body));
        out
    }

    fn to_hyper(&self, target: &Target) -> Result<Request<Body>, hyper::http::Error> {
        let mut req = Request::builder()
            .method(self.method.clone())
            .uri(self.path())
            .version(Version::HTTP_11)
            .body(Body::from(self.body.clone()))?;
        *req.headers_mut() = self.headers.clone();
        if !req.headers().contains_key(HOST) {
            req.headers_mut()
                .insert(HOST, HeaderValue::from_str(&target.authority())?);
        }
        Ok(req)
    }
}

/// A response read back from a target, or a sentinel for a failed forward.
#[derive(Debug, Clone)]
pub struct ForwardedResponse {
    pub dump: String,
    pub body: Bytes,
    pub headers: HeaderMap,
    pub status: i32,
}

impl ForwardedResponse {
    /// Stand-in for a failed forward. It never compares equal to a real
    /// response (status `-1`) nor to the other side's sentinel (body).
    pub fn sentinel(side: Side) -> Self {
        let literal = match side {
            Side::Control => CONTROL_SENTINEL,
            Side::Experiment | Side::Load => EXPERIMENT_SENTINEL,
        };
        Self {
            dump: literal.to_string(),
            body: Bytes::from_static(literal.as_bytes()),
            headers: HeaderMap::new(),
            status: SENTINEL_STATUS,
        }
    }

    fn from_parts(mut response: Response<()>, body: Bytes, strip: &[String]) -> Self {
        for name in strip {
            response.headers_mut().remove(name.as_str());
        }

        let status = response.status();
        let mut dump = format!(
            "{:?} {} {}\r\n",
            response.version(),
            status.as_str(),
            status.canonical_reason().unwrap_or("")
        );
        write_headers(&mut dump, response.headers());
        dump.push_str("\r\n");
        dump.push_str(&String::from_utf8_lossy(&body));

        Self {
            dump,
            body,
            status: i32::from(status.as_u16()),
            headers: response.headers().clone(),
        }
    }
}

fn write_headers(out: &mut String, headers: &HeaderMap) {
    for (name, value) in headers {
        let _ = write!(
            out,
            "{}: {}\r\n",
            name,
            String::from_utf8_lossy(value.as_bytes())
        );
    }
}

/// A parsed `http://` or `https://` target address.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Target {
    pub secure: bool,
    pub host: String,
    pub port: u16,
}

impl Target {
    pub fn parse(url: &str) -> Result<Self, ForwardError> {
        let invalid = |message: &str| ForwardError::InvalidTarget {
            target: url.to_string(),
            message: message.to_string(),
        };

        let uri: Uri = url.parse().map_err(|_| invalid("not a valid URI"))?;
        let secure = match uri.scheme_str() {
            Some("https") => true,
            Some("http") => false,
            Some(_) => return Err(invalid("scheme must be http or https")),
            None => return Err(invalid("missing http:// or https:// scheme")),
        };
        let host = uri
            .host()
            .filter(|h| !h.is_empty())
            .ok_or_else(|| invalid("missing host"))?
            .trim_start_matches('[')
            .trim_end_matches(']')
            .to_string();
        let port = uri.port_u16().unwrap_or(if secure { 443 } else { 80 });

        Ok(Self { secure, host, port })
    }

    pub fn authority(&self) -> String {
        if self.host.contains(':') {
            format!("[{}]:{}", self.host, self.port)
        } else {
            format!("{}:{}", self.host, self.port)
        }
    }
}

/// Forwards captured requests to targets, one connection per call.
#[derive(Clone)]
pub struct Forwarder {
    tls: TlsConnector,
    timeout: Duration,
}

impl Forwarder {
    pub fn new(tls: TlsConnector, timeout: Duration) -> Self {
        Self { tls, timeout }
    }

    /// Sends `request` to `target` and returns the response with the `strip`
    /// headers removed.
    pub async fn forward(
        &self,
        request: &CapturedRequest,
        target: &str,
        strip: &[String],
    ) -> Result<ForwardedResponse, ForwardError> {
        let target = Target::parse(target)?;
        let addr = target.authority();

        let (parts, body) = tokio::time::timeout(self.timeout, self.exchange(request, &target))
            .await
            .map_err(|_| ForwardError::Timeout {
                addr: addr.clone(),
                timeout: self.timeout,
            })??;

        debug!(target = %addr, status = parts.status().as_u16(), "Forwarded request");
        Ok(ForwardedResponse::from_parts(parts, body, strip))
    }

    async fn exchange(
        &self,
        request: &CapturedRequest,
        target: &Target,
    ) -> Result<(Response<()>, Bytes), ForwardError> {
        let addr = target.authority();
        let req = request
            .to_hyper(target)
            .map_err(|source| ForwardError::Request {
                addr: addr.clone(),
                source,
            })?;

        let tcp = TcpStream::connect((target.host.as_str(), target.port))
            .await
            .map_err(|source| ForwardError::Connect {
                addr: addr.clone(),
                source,
            })?;

        if target.secure {
            let domain = ServerName::try_from(target.host.as_str())
                .map(|name| name.to_owned())
                .map_err(|e| ForwardError::InvalidTarget {
                    target: addr.clone(),
                    message: e.to_string(),
                })?;
            let tls = self
                .tls
                .connect(domain, tcp)
                .await
                .map_err(|source| ForwardError::Tls {
                    addr: addr.clone(),
                    source,
                })?;
            send(tls, req, &addr).await
        } else {
            send(tcp, req, &addr).await
        }
    }
}

async fn send<T>(
    io: T,
    req: Request<Body>,
    addr: &str,
) -> Result<(Response<()>, Bytes), ForwardError>
where
    T: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    let protocol = |source: hyper::Error| ForwardError::Protocol {
        addr: addr.to_string(),
        source,
    };

    let (mut sender, connection) = hyper::client::conn::handshake(io)
        .await
        .map_err(protocol)?;
    let connection = tokio::spawn(async move {
        if let Err(e) = connection.await {
            debug!(error = %e, "Forward connection closed with error");
        }
    });

    let response = sender.send_request(req).await.map_err(protocol)?;
    let (parts, body) = response.into_parts();
    let body = hyper::body::to_bytes(body).await.map_err(protocol)?;

    drop(sender);
    connection.abort();
    Ok((Response::from_parts(parts, ()), body))
}
