//! HTTP forwarder.
//!
//! One inbound request, one fresh outbound connection, one outbound request.
//! Method, target, and headers go across as they came in; the body is the
//! inbound [`Incoming`] stream itself, so bytes reach the backend as they
//! arrive. The backend's response comes back the same way.
//!
//! Failure has exactly two shapes:
//!
//! - the backend never produced response headers → `502 Bad Gateway`,
//!   written once, by returning it as *the* response;
//! - the backend failed after its headers went out → the response body
//!   errors, hyper aborts the connection, nothing else is written.

use std::convert::Infallible;
use std::net::SocketAddr;

use bytes::Bytes;
use http::header::{CONNECTION, CONTENT_TYPE, HOST, UPGRADE};
use http::{HeaderMap, HeaderValue, Request, Response, StatusCode, Version};
use http_body_util::combinators::BoxBody;
use http_body_util::{BodyExt, Full};
use hyper::body::Incoming;
use hyper::client::conn::http1::Builder as ClientBuilder;
use hyper_util::rt::TokioIo;
use tokio::net::TcpStream;
use tracing::{debug, warn};

use crate::error::Error;
use crate::head::has_upgrade_token;
use crate::route::Routes;
use crate::tunnel;

/// Body type of every response the proxy writes.
pub type ProxyBody = BoxBody<Bytes, hyper::Error>;

/// Forwards `req` to the backend its path routes to and returns the
/// response to write back.
///
/// Never fails: an unreachable or broken backend becomes a `502`.
pub async fn forward(
    routes: &Routes,
    mut req: Request<Incoming>,
    peer: SocketAddr,
) -> Result<Response<ProxyBody>, Infallible> {
    // An upgrade on a kept-alive connection. The first request of a
    // connection never gets here if it asks for an upgrade; see `head`.
    let on_upgrade = is_upgrade(req.headers()).then(|| hyper::upgrade::on(&mut req));

    let backend = match on_upgrade {
        Some(_) => routes.upgrade(),
        None => routes.route(target(&req)),
    };
    let addr = routes.addr(backend);

    debug!(%peer, method = %req.method(), path = target(&req), backend = backend.as_str(), "forwarding");

    let mut resp = match send(into_outbound(req), addr).await {
        Ok(resp) => resp,
        Err(e) => {
            warn!(%peer, backend = backend.as_str(), %addr, "bad gateway: {e}");
            return Ok(bad_gateway());
        }
    };

    if let Some(on_upgrade) = on_upgrade {
        if resp.status() == StatusCode::SWITCHING_PROTOCOLS {
            let backend_upgrade = hyper::upgrade::on(&mut resp);
            tokio::spawn(async move {
                match tokio::try_join!(on_upgrade, backend_upgrade) {
                    Ok((caller, backend)) => {
                        let spliced = tunnel::splice(TokioIo::new(caller), TokioIo::new(backend)).await;
                        debug!(%peer, up = spliced.upstream, down = spliced.downstream, "upgraded tunnel closed");
                    }
                    Err(e) => debug!(%peer, "upgrade failed: {e}"),
                }
            });
        }
    }

    Ok(resp.map(|body| body.boxed()))
}

/// `502 Bad Gateway` with a fixed plain-text body.
pub fn bad_gateway() -> Response<ProxyBody> {
    let mut resp = Response::new(full("Bad Gateway"));
    *resp.status_mut() = StatusCode::BAD_GATEWAY;
    resp.headers_mut()
        .insert(CONTENT_TYPE, HeaderValue::from_static("text/plain"));
    resp
}

fn full(body: &'static str) -> ProxyBody {
    Full::new(Bytes::from_static(body.as_bytes()))
        .map_err(|never| match never {})
        .boxed()
}

/// Path plus query of the request target. An absolute-form target
/// contributes only its path, so routing never looks at scheme or host.
fn target<B>(req: &Request<B>) -> &str {
    req.uri()
        .path_and_query()
        .map_or("/", |pq| pq.as_str())
}

fn is_upgrade(headers: &HeaderMap) -> bool {
    headers.contains_key(UPGRADE)
        && headers.get_all(CONNECTION)
            .iter()
            .any(|v| has_upgrade_token(v.as_bytes()))
}

/// Reuses the inbound request for the outbound leg.
///
/// Only the framing changes: origin-form target, HTTP/1.1. Headers and
/// extensions (including hyper's preserved header case) ride along. An
/// HTTP/2 caller carries its host in `:authority` only, so that becomes
/// `Host` when no `Host` header exists.
fn into_outbound(req: Request<Incoming>) -> Request<Incoming> {
    let (mut parts, body) = req.into_parts();

    if !parts.headers.contains_key(HOST) {
        if let Some(host) = parts.uri.authority().and_then(|a| HeaderValue::from_str(a.as_str()).ok()) {
            parts.headers.insert(HOST, host);
        }
    }
    if let Some(pq) = parts.uri.path_and_query().cloned() {
        parts.uri = pq.into();
    }
    parts.version = Version::HTTP_11;

    Request::from_parts(parts, body)
}

/// Opens a new connection to `addr` and sends `req` on it.
async fn send(req: Request<Incoming>, addr: SocketAddr) -> Result<Response<Incoming>, Error> {
    let stream = TcpStream::connect(addr)
        .await
        .map_err(|source| Error::Connect { addr, source })?;
    if let Err(e) = stream.set_nodelay(true) {
        debug!(%addr, "set_nodelay failed: {e}");
    }

    let (mut sender, conn) = ClientBuilder::new()
        .preserve_header_case(true)
        .handshake(TokioIo::new(stream))
        .await?;

    // The connection future drives both bodies; it ends when the exchange
    // does, or hands the socket over on `101`.
    tokio::spawn(async move {
        if let Err(e) = conn.with_upgrades().await {
            debug!(%addr, "backend connection ended: {e}");
        }
    });

    Ok(sender.send_request(req).await?)
}
