use std::net::SocketAddr;
use std::sync::Arc;

use axum::{
    extract::{ConnectInfo, State, WebSocketUpgrade},
    http::{HeaderMap, StatusCode, header},
    response::{IntoResponse, Response},
};
use axum_extra::extract::cookie::CookieJar;
use tracing::warn;

use crate::authenticator::{RequestContext, USER_COOKIE};
use crate::gateway::GatewayCore;
use crate::ws;

/// Pre-WebSocket origin header used by older browsers.
const LEGACY_ORIGIN: &str = "sec-websocket-origin";

/// Gateway WebSocket handler - checks the origin, then hands the socket to
/// the connection loop.
pub async fn websocket_handler(
    State(core): State<Arc<GatewayCore>>,
    ConnectInfo(addr): ConnectInfo<SocketAddr>,
    headers: HeaderMap,
    jar: CookieJar,
    ws: WebSocketUpgrade,
) -> Response {
    let request = match request_context(&core, &headers, &jar, addr) {
        Ok(request) => request,
        Err(status) => return status.into_response(),
    };
    ws.on_upgrade(move |socket| ws::handle_connection(socket, core, request))
}

/// Capture what authentication needs from the upgrade request, refusing
/// origins that are not allowed.
fn request_context(
    core: &GatewayCore,
    headers: &HeaderMap,
    jar: &CookieJar,
    addr: SocketAddr,
) -> Result<RequestContext, StatusCode> {
    let origin = headers
        .get(header::ORIGIN)
        .or_else(|| headers.get(LEGACY_ORIGIN))
        .and_then(|v| v.to_str().ok());
    if !core.config().server.origin_allowed(origin) {
        warn!(
            origin = origin.unwrap_or("-"),
            ip = %addr.ip(),
            "Access denied for WebSocket origin"
        );
        return Err(StatusCode::FORBIDDEN);
    }
    Ok(RequestContext {
        cookie: jar.get(USER_COOKIE).map(|c| c.value().to_string()),
        ip_address: addr.ip().to_string(),
        origin: origin.map(str::to_string),
    })
}
