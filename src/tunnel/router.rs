//! Host-based routing of public HTTP traffic.
//!
//! Requests for `<sub>.<domain>` are forwarded to the agent that registered
//! `<sub>`; everything else (the apex domain, unknown hosts, WebSocket
//! upgrades) falls through to the server's own routes.

use std::collections::HashMap;

use axum::body::{to_bytes, Body};
use axum::extract::{Request, State};
use axum::http::header::{self, HeaderMap, HeaderName, HeaderValue};
use axum::http::StatusCode;
use axum::middleware::Next;
use axum::response::{Html, IntoResponse, Response};
use tracing::{debug, warn};

use super::manager::ForwardRequest;
use super::pending::TunnelResponse;
use crate::state::AppState;

/// Headers the HTTP stack owns; never copied from an agent's response.
const FRAMING_HEADERS: [HeaderName; 3] = [
    header::CONTENT_LENGTH,
    header::TRANSFER_ENCODING,
    header::CONNECTION,
];

/// How a `Host` relates to the configured base domain.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HostKind {
    /// The base domain itself.
    Apex,
    /// `<label>.<...>.<domain>`; carries the first label.
    Subdomain(String),
    /// Not under the base domain (raw IPs, other names).
    Foreign,
}

/// Classify `host` (optionally with `:port`) against `domain`. The domain
/// comparison ignores case; the returned label keeps the caller's case.
pub fn classify_host(host: &str, domain: &str) -> HostKind {
    let name = strip_port(host).trim_end_matches('.');
    let domain = domain.trim_end_matches('.');
    if name.eq_ignore_ascii_case(domain) {
        return HostKind::Apex;
    }

    let Some(prefix_len) = name.len().checked_sub(domain.len() + 1) else {
        return HostKind::Foreign;
    };
    let (Some(prefix), Some(suffix)) = (name.get(..prefix_len), name.get(prefix_len..)) else {
        return HostKind::Foreign;
    };
    if !suffix.starts_with('.') || !suffix[1..].eq_ignore_ascii_case(domain) {
        return HostKind::Foreign;
    }

    match prefix.split('.').next() {
        Some(label) if !label.is_empty() => HostKind::Subdomain(label.to_string()),
        _ => HostKind::Foreign,
    }
}

fn strip_port(host: &str) -> &str {
    if host.starts_with('[') {
        // IPv6 literal
        return host.split_once(']').map_or(host, |(h, _)| &host[..=h.len()]);
    }
    match host.rsplit_once(':') {
        Some((name, port)) if port.bytes().all(|b| b.is_ascii_digit()) => name,
        _ => host,
    }
}

/// True for `Upgrade: websocket` requests, which are never forwarded.
pub fn is_websocket_upgrade(headers: &HeaderMap) -> bool {
    headers
        .get(header::UPGRADE)
        .and_then(|v| v.to_str().ok())
        .is_some_and(|v| v.eq_ignore_ascii_case("websocket"))
}

/// `Host` header, falling back to the URI authority.
fn request_host(req: &Request) -> Option<String> {
    req.headers()
        .get(header::HOST)
        .and_then(|v| v.to_str().ok())
        .map(str::to_string)
        .or_else(|| req.uri().authority().map(ToString::to_string))
}

/// Middleware wrapping the base router: tunnel-routes subdomain traffic and
/// passes everything else through.
pub async fn route_by_host(State(state): State<AppState>, req: Request, next: Next) -> Response {
    if is_websocket_upgrade(req.headers()) {
        return next.run(req).await;
    }
    let Some(host) = request_host(&req) else {
        return next.run(req).await;
    };
    match classify_host(&host, &state.config.tunnel.domain) {
        HostKind::Subdomain(subdomain) => forward_to_tunnel(&state, &subdomain, req).await,
        HostKind::Apex | HostKind::Foreign => next.run(req).await,
    }
}

async fn forward_to_tunnel(state: &AppState, subdomain: &str, req: Request) -> Response {
    if !state.manager.is_taken(subdomain).await {
        debug!(subdomain, "No tunnel for subdomain, serving default page");
        return default_page(state).await;
    }

    let (parts, body) = req.into_parts();
    let body = match to_bytes(body, state.config.server.max_body_bytes).await {
        Ok(bytes) => bytes.to_vec(),
        Err(e) => {
            warn!(subdomain, "Failed to read request body: {e}");
            return (StatusCode::PAYLOAD_TOO_LARGE, "Request body too large").into_response();
        }
    };

    let request = ForwardRequest {
        method: parts.method.to_string(),
        path: parts
            .uri
            .path_and_query()
            .map_or_else(|| parts.uri.path().to_string(), ToString::to_string),
        headers: flatten_headers(&parts.headers),
        body,
    };

    match state.manager.forward(subdomain, request).await {
        Ok(pending) => {
            let request_id = pending.request_id().to_string();
            let response = pending.wait().await;
            debug!(subdomain, request_id, status = response.status, "Tunnel response");
            into_http_response(response)
        }
        // Disconnected between the check and the forward.
        Err(_) => default_page(state).await,
    }
}

/// Collapse a header map into one value per name; repeated headers are
/// joined with `", "`.
fn flatten_headers(headers: &HeaderMap) -> HashMap<String, String> {
    let mut flat: HashMap<String, String> = HashMap::with_capacity(headers.keys_len());
    for (name, value) in headers {
        let Ok(value) = value.to_str() else {
            continue;
        };
        flat.entry(name.as_str().to_string())
            .and_modify(|existing| {
                existing.push_str(", ");
                existing.push_str(value);
            })
            .or_insert_with(|| value.to_string());
    }
    flat
}

/// Turn an agent's answer into the public response. Status and headers are
/// copied verbatim apart from framing headers; the connection is always
/// closed afterwards.
pub fn into_http_response(tunnel: TunnelResponse) -> Response {
    let tunnel = if (100..=599).contains(&tunnel.status) {
        tunnel
    } else {
        warn!(status = tunnel.status, "Agent returned an invalid status code");
        TunnelResponse::synthetic(502, "Invalid response from tunnel agent")
    };
    let status = StatusCode::from_u16(tunnel.status).unwrap_or(StatusCode::BAD_GATEWAY);
    let mut response =
        (status, header_map(&tunnel.headers), Body::from(tunnel.body)).into_response();
    response
        .headers_mut()
        .insert(header::CONNECTION, HeaderValue::from_static("close"));
    response
}

fn header_map(headers: &HashMap<String, String>) -> HeaderMap {
    let mut map = HeaderMap::with_capacity(headers.len());
    for (name, value) in headers {
        let (Ok(name), Ok(value)) = (
            HeaderName::from_bytes(name.as_bytes()),
            HeaderValue::from_str(value),
        ) else {
            debug!(header = %name, "Skipping unrepresentable response header");
            continue;
        };
        if FRAMING_HEADERS.contains(&name) {
            continue;
        }
        map.append(name, value);
    }
    map
}

/// Informational landing page, served for unknown subdomains and the apex
/// when no static dashboard is configured.
pub async fn default_page(state: &AppState) -> Response {
    let active = state.manager.active_count().await;
    let html = format!(
        "<html><head><title>Tunnel Server</title></head>\
         <body><h1>Tunnel Server Running</h1>\
         <p>Active tunnels: {active}</p>\
         </body></html>"
    );
    let mut response = Html(html).into_response();
    response
        .headers_mut()
        .insert(header::CONNECTION, HeaderValue::from_static("close"));
    response
}

/// Axum fallback wrapper around [`default_page`].
pub async fn default_page_handler(State(state): State<AppState>) -> Response {
    default_page(&state).await
}
