//! WebSocket tunnel.
//!
//! # Data Flow
//! ```text
//! Client ←── frames ──→ Gateway ←── frames ──→ Upstream
//!          (axum ws)              (tokio-tungstenite)
//! ```
//!
//! # Design Decisions
//! - The upstream handshake completes before the client upgrade is accepted,
//!   so a dead upstream is still reported as a plain 502
//! - Handshake headers are regenerated per hop; everything else is forwarded
//!   through the same header builder as HTTP
//! - Text, binary and close frames are relayed; ping/pong is answered per hop
//! - No message buffering, no body rewriting

use std::time::Duration;

use axum::extract::ws::{
    CloseFrame as ClientCloseFrame, Message as ClientMessage, WebSocket, WebSocketUpgrade,
};
use axum::http::header::{self, HeaderMap};
use axum::response::Response;
use futures_util::{SinkExt, StreamExt};
use tokio::net::TcpStream;
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode;
use tokio_tungstenite::tungstenite::protocol::CloseFrame as UpstreamCloseFrame;
use tokio_tungstenite::tungstenite::Message as UpstreamMessage;
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};

use crate::error::GatewayError;
use crate::http::request::ProxyContext;
use crate::negotiation::{ProtocolNegotiator, Resolution};
use crate::routing::target::{Scheme, TargetSpec};
use crate::security::headers::{build_upstream_headers, ForwardedFor, WEBSOCKET_HANDSHAKE};

type UpstreamSocket = WebSocketStream<MaybeTlsStream<TcpStream>>;

/// Open the upstream socket and hand the client upgrade to the relay.
pub async fn tunnel(
    upgrade: WebSocketUpgrade,
    negotiator: &ProtocolNegotiator,
    ctx: &ProxyContext,
    target: &TargetSpec,
    resolution: Resolution,
    inbound: &HeaderMap,
    connect_timeout: Duration,
) -> Result<Response, GatewayError> {
    let (upstream, subprotocol) = match connect(ctx, target, resolution.scheme, inbound, connect_timeout).await {
        Ok(pair) => pair,
        Err(detail) if resolution.downgradable() => {
            tracing::info!(
                request_id = %ctx.request_id,
                target = %target.authority(),
                detail,
                "wss handshake failed, retrying over ws"
            );
            negotiator.downgrade(target);
            connect(ctx, target, Scheme::Http, inbound, connect_timeout)
                .await
                .map_err(|detail| GatewayError::upstream(detail))?
        }
        Err(detail) => return Err(GatewayError::upstream(detail)),
    };

    let upgrade = match subprotocol {
        Some(protocol) => upgrade.protocols([protocol]),
        None => upgrade,
    };

    let request_id = ctx.request_id.clone();
    let authority = target.authority();
    Ok(upgrade.on_upgrade(move |client| async move {
        tracing::debug!(request_id = %request_id, target = %authority, "websocket tunnel open");
        relay(client, upstream).await;
        tracing::debug!(request_id = %request_id, target = %authority, "websocket tunnel closed");
    }))
}

async fn connect(
    ctx: &ProxyContext,
    target: &TargetSpec,
    scheme: Scheme,
    inbound: &HeaderMap,
    connect_timeout: Duration,
) -> Result<(UpstreamSocket, Option<String>), &'static str> {
    let mut request = target
        .ws_url(scheme)
        .into_client_request()
        .map_err(|e| {
            tracing::warn!(request_id = %ctx.request_id, error = %e, "invalid websocket target");
            "invalid websocket target"
        })?;

    let forwarded = build_upstream_headers(
        inbound,
        &ctx.snapshot.config.headers.skip_request,
        &ForwardedFor {
            hostname: &target.hostname,
            scheme,
            client_ip: Some(&ctx.client_ip),
            is_media: false,
        },
    );
    for (name, value) in &forwarded {
        // tungstenite sets Host to the full authority along with the handshake fields.
        if *name == header::HOST || WEBSOCKET_HANDSHAKE.contains(&name.as_str()) {
            continue;
        }
        request.headers_mut().append(name.clone(), value.clone());
    }

    let (socket, response) = match tokio::time::timeout(connect_timeout, connect_async(request)).await {
        Ok(Ok(pair)) => pair,
        Ok(Err(e)) => {
            tracing::warn!(request_id = %ctx.request_id, target = %target.authority(), error = %e, "websocket handshake failed");
            return Err("upstream connection failed");
        }
        Err(_) => return Err("upstream timed out"),
    };

    let subprotocol = response
        .headers()
        .get(header::SEC_WEBSOCKET_PROTOCOL)
        .and_then(|v| v.to_str().ok())
        .map(str::to_string);
    Ok((socket, subprotocol))
}

/// Pump frames both ways until either side closes or errors.
async fn relay(client: WebSocket, upstream: UpstreamSocket) {
    let (mut client_tx, mut client_rx) = client.split();
    let (mut upstream_tx, mut upstream_rx) = upstream.split();

    let client_to_upstream = async {
        while let Some(Ok(message)) = client_rx.next().await {
            let closing = matches!(message, ClientMessage::Close(_));
            if let Some(message) = to_upstream(message) {
                if upstream_tx.send(message).await.is_err() {
                    break;
                }
            }
            if closing {
                break;
            }
        }
        let _ = upstream_tx.close().await;
    };

    let upstream_to_client = async {
        while let Some(Ok(message)) = upstream_rx.next().await {
            let closing = message.is_close();
            if let Some(message) = to_client(message) {
                if client_tx.send(message).await.is_err() {
                    break;
                }
            }
            if closing {
                break;
            }
        }
        let _ = client_tx.close().await;
    };

    tokio::select! {
        _ = client_to_upstream => {}
        _ = upstream_to_client => {}
    }
}

fn to_upstream(message: ClientMessage) -> Option<UpstreamMessage> {
    match message {
        ClientMessage::Text(text) => Some(UpstreamMessage::Text(String::from(text.as_str()).into())),
        ClientMessage::Binary(data) => Some(UpstreamMessage::Binary(data)),
        ClientMessage::Close(frame) => Some(UpstreamMessage::Close(frame.map(|f| {
            UpstreamCloseFrame {
                code: CloseCode::from(f.code),
                reason: String::from(f.reason.as_str()).into(),
            }
        }))),
        ClientMessage::Ping(_) | ClientMessage::Pong(_) => None,
    }
}

fn to_client(message: UpstreamMessage) -> Option<ClientMessage> {
    match message {
        UpstreamMessage::Text(text) => Some(ClientMessage::Text(String::from(text.as_str()).into())),
        UpstreamMessage::Binary(data) => Some(ClientMessage::Binary(data)),
        UpstreamMessage::Close(frame) => Some(ClientMessage::Close(frame.map(|f| {
            ClientCloseFrame {
                code: u16::from(f.code),
                reason: String::from(f.reason.as_str()).into(),
            }
        }))),
        UpstreamMessage::Ping(_) | UpstreamMessage::Pong(_) | UpstreamMessage::Frame(_) => None,
    }
}
