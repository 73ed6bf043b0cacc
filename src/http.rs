//! The versioned REST surface, the metrics endpoint and the WebSocket
//! upgrade that feeds the gateway.

use std::{convert::Infallible, net::SocketAddr, sync::Arc};

use async_trait::async_trait;
use base64::{engine::general_purpose::STANDARD as BASE64, Engine as _};
use eyre::Result;
use futures::{SinkExt, StreamExt};
use prometheus::{Encoder, TextEncoder};
use serde::Deserialize;
use serde_json::json;
use tokio::sync::mpsc;
use tracing::debug;
use warp::{
    http::{HeaderMap, StatusCode},
    reject::{self, Reject, Rejection},
    reply,
    ws::{Message, WebSocket},
    Filter, Reply,
};

use crate::{
    auth,
    bus::{Link, LinkEvent},
    channel::{CreateOptions, Registry},
    config::Config,
    gateway::Gateway,
    protocol::CloseCode,
};

pub struct AppState {
    pub registry: Arc<Registry>,
    pub gateway: Arc<Gateway>,
    pub config: Arc<Config>,
    pub auth_key: Vec<u8>,
}

#[derive(Debug)]
struct ApiReject {
    status: StatusCode,
    message: String,
}

impl Reject for ApiReject {}

fn api_reject(status: StatusCode, message: impl Into<String>) -> Rejection {
    reject::custom(ApiReject {
        status,
        message: message.into(),
    })
}

#[derive(Debug, Deserialize)]
struct ChannelQuery {
    #[serde(rename = "webRTC")]
    web_rtc: Option<String>,
}

/// The full routing table: `/v1/*` + `/metrics` behind CORS and the
/// WebSocket upgrade at `/`. Callers pair it with [`handle_rejection`] so the
/// typed rejections render as the right status codes.
pub fn routes(
    state: Arc<AppState>,
) -> impl Filter<Extract = impl Reply, Error = Rejection> + Clone {
    let with_state = {
        let state = state.clone();
        warp::any().map(move || state.clone())
    };

    let noop = warp::path!("v1" / "noop")
        .and(warp::get())
        .map(|| reply::json(&json!({ "result": "ok" })));

    let stats = warp::path!("v1" / "stats")
        .and(warp::get())
        .and(with_state.clone())
        .and_then(stats_handler);

    let channel = warp::path!("v1" / "channel")
        .and(warp::get())
        .and(with_state.clone())
        .and(warp::header::optional::<String>("authorization"))
        .and(warp::query::<ChannelQuery>())
        .and(warp::addr::remote())
        .and(warp::header::headers_cloned())
        .and_then(channel_handler);

    let disconnect = warp::path!("v1" / "disconnect")
        .and(warp::post())
        .and(with_state.clone())
        .and(warp::body::bytes())
        .and(warp::addr::remote())
        .and(warp::header::headers_cloned())
        .and_then(disconnect_handler);

    let metrics = warp::path!("metrics").and(warp::get()).and_then(metrics_handler);

    let cors = warp::cors()
        .allow_any_origin()
        .allow_headers(vec!["authorization", "content-type"])
        .allow_methods(vec!["GET", "POST", "OPTIONS"]);

    let api = noop
        .or(stats)
        .or(channel)
        .or(disconnect)
        .or(metrics)
        .with(cors);

    let ws = warp::path::end()
        .and(warp::ws())
        .and(with_state)
        .and(warp::addr::remote())
        .and(warp::header::headers_cloned())
        .map(
            |ws: warp::ws::Ws,
             state: Arc<AppState>,
             addr: Option<SocketAddr>,
             headers: HeaderMap| {
                let remote = remote_address(&state.config, addr, &headers);
                ws.on_upgrade(move |socket| serve_socket(socket, state, remote))
            },
        );

    api.or(ws)
}

async fn stats_handler(state: Arc<AppState>) -> Result<impl Reply, Rejection> {
    let stats = state.registry.stats().await;
    Ok(reply::json(&stats))
}

async fn channel_handler(
    state: Arc<AppState>,
    authorization: Option<String>,
    query: ChannelQuery,
    addr: Option<SocketAddr>,
    headers: HeaderMap,
) -> Result<impl Reply, Rejection> {
    let header = authorization
        .ok_or_else(|| api_reject(StatusCode::UNAUTHORIZED, "missing authorization"))?;

    let token = match header.split_once(' ') {
        Some((scheme, token)) if scheme.eq_ignore_ascii_case("jwt") => token.trim(),
        _ => return Err(api_reject(StatusCode::UNAUTHORIZED, "expected a jwt scheme")),
    };

    let claims = auth::verify(token, &state.auth_key)
        .map_err(|e| api_reject(StatusCode::UNAUTHORIZED, e.to_string()))?;

    let issuer = claims
        .iss
        .ok_or_else(|| api_reject(StatusCode::FORBIDDEN, "token has no issuer"))?;

    let key = match claims.key {
        Some(encoded) => Some(BASE64.decode(encoded).map_err(|_| {
            api_reject(StatusCode::UNAUTHORIZED, "key claim is not base64")
        })?),
        None => None,
    };

    let use_webrtc = query
        .web_rtc
        .as_deref()
        .map_or(true, |v| !v.eq_ignore_ascii_case("false"));

    let remote = remote_address(&state.config, addr, &headers);
    let channel = state
        .registry
        .create(&remote, &issuer, CreateOptions { key, use_webrtc })
        .await
        .map_err(|e| api_reject(StatusCode::INTERNAL_SERVER_ERROR, e.to_string()))?;

    let url = format!(
        "{}://{}",
        forwarded_proto(&state.config, &headers),
        forwarded_host(&state.config, &headers)
    );

    Ok(reply::json(&json!({
        "uuid": channel.uuid(),
        "url": url,
    })))
}

async fn disconnect_handler(
    state: Arc<AppState>,
    body: warp::hyper::body::Bytes,
    addr: Option<SocketAddr>,
    headers: HeaderMap,
) -> Result<impl Reply, Rejection> {
    let unprocessable =
        |message: &str| api_reject(StatusCode::UNPROCESSABLE_ENTITY, message.to_string());

    let token = std::str::from_utf8(&body)
        .map_err(|_| unprocessable("body is not a token"))?
        .trim();

    let claims =
        auth::verify(token, &state.auth_key).map_err(|_| unprocessable("token refused"))?;

    let targets = claims
        .session_ids_by_channel
        .ok_or_else(|| unprocessable("token lists no sessions"))?;

    let remote = remote_address(&state.config, addr, &headers);
    state
        .registry
        .disconnect(&remote, &targets)
        .await
        .map_err(|_| unprocessable("disconnect failed"))?;

    Ok(reply::json(&json!({ "result": "ok" })))
}

async fn metrics_handler() -> Result<impl Reply, Rejection> {
    let mut buffer = Vec::new();
    TextEncoder::new()
        .encode(&prometheus::gather(), &mut buffer)
        .map_err(|e| api_reject(StatusCode::INTERNAL_SERVER_ERROR, e.to_string()))?;

    Ok(buffer)
}

pub async fn handle_rejection(err: Rejection) -> Result<impl Reply, Infallible> {
    let (status, message) = if let Some(api) = err.find::<ApiReject>() {
        (api.status, api.message.clone())
    } else if err.is_not_found() {
        (StatusCode::NOT_FOUND, "not found".to_string())
    } else if err.find::<reject::MethodNotAllowed>().is_some() {
        (StatusCode::METHOD_NOT_ALLOWED, "method not allowed".to_string())
    } else {
        (StatusCode::INTERNAL_SERVER_ERROR, format!("{err:?}"))
    };

    Ok(reply::with_status(
        reply::json(&json!({ "error": message })),
        status,
    ))
}

/// First-hop `x-forwarded-for` when running behind a proxy, socket address
/// otherwise.
fn remote_address(config: &Config, addr: Option<SocketAddr>, headers: &HeaderMap) -> String {
    if config.proxy {
        if let Some(forwarded) = header_str(headers, "x-forwarded-for") {
            if let Some(first) = forwarded.split(',').next() {
                return first.trim().to_string();
            }
        }
    }

    addr.map(|a| a.ip().to_string()).unwrap_or_default()
}

fn forwarded_proto(config: &Config, headers: &HeaderMap) -> String {
    if config.proxy {
        if let Some(proto) = header_str(headers, "x-forwarded-proto") {
            if let Some(first) = proto.split(',').next() {
                return first.trim().to_string();
            }
        }
    }

    "http".to_string()
}

fn forwarded_host(config: &Config, headers: &HeaderMap) -> String {
    if config.proxy {
        if let Some(host) = header_str(headers, "x-forwarded-host") {
            if let Some(first) = host.split(',').next() {
                return first.trim().to_string();
            }
        }
    }

    header_str(headers, "host")
        .map(str::to_string)
        .unwrap_or_else(|| format!("{}:{}", config.http_interface, config.port))
}

fn header_str<'a>(headers: &'a HeaderMap, name: &str) -> Option<&'a str> {
    headers.get(name).and_then(|v| v.to_str().ok())
}

// ---- WebSocket adapter ----

enum Outbound {
    Frame(String),
    Close(CloseCode),
}

/// [`Link`] over one WebSocket. Writes funnel through a single task owning
/// the sink half.
struct WsLink {
    tx: mpsc::UnboundedSender<Outbound>,
}

#[async_trait]
impl Link for WsLink {
    async fn send(&self, frame: String) -> Result<()> {
        self.tx
            .send(Outbound::Frame(frame))
            .map_err(|_| eyre::eyre!("link writer is gone"))
    }

    async fn close(&self, code: CloseCode) {
        let _result = self.tx.send(Outbound::Close(code));
    }
}

async fn serve_socket(socket: WebSocket, state: Arc<AppState>, remote: String) {
    let (mut sink, mut stream) = socket.split();

    let (out_tx, mut out_rx) = mpsc::unbounded_channel();
    tokio::spawn(async move {
        while let Some(outbound) = out_rx.recv().await {
            match outbound {
                Outbound::Frame(text) => {
                    if sink.send(Message::text(text)).await.is_err() {
                        break;
                    }
                }
                Outbound::Close(code) => {
                    let _result = sink
                        .send(Message::close_with(code.code(), code.as_ref().to_string()))
                        .await;
                    break;
                }
            }
        }
    });

    let (event_tx, event_rx) = mpsc::unbounded_channel();
    tokio::spawn(async move {
        while let Some(message) = stream.next().await {
            match message {
                Ok(message) if message.is_text() => {
                    let text = message.to_str().unwrap_or_default().to_string();
                    if event_tx.send(LinkEvent::Frame(text)).is_err() {
                        return;
                    }
                }
                Ok(message) if message.is_close() => {
                    let _result = event_tx.send(LinkEvent::Closed);
                    return;
                }
                Ok(_ping_pong_or_binary) => {}
                Err(e) => {
                    debug!("websocket error: {e}");
                    let _result = event_tx.send(LinkEvent::Error(e.to_string()));
                    return;
                }
            }
        }

        let _result = event_tx.send(LinkEvent::Closed);
    });

    let link = Arc::new(WsLink { tx: out_tx });
    state.gateway.handle_link(link, event_rx, remote).await;
}
