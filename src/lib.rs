pub mod asr;
pub mod base64box;
pub mod bridge;
pub mod codec;
pub mod config;
pub mod error;
pub mod events;
pub mod interleave;
pub mod protocol;
pub mod recording;
pub mod session;
pub mod storage;
pub mod store;

use std::sync::Arc;

use aws_config::SdkConfig;
use aws_sdk_transcribestreaming::types::LanguageCode;
use futures_util::{stream::StreamExt, SinkExt};
use poem::{
    get, handler,
    http::StatusCode,
    listener::TcpListener,
    web::{
        websocket::{Message, WebSocket},
        Data, RemoteAddr,
    },
    EndpointExt, IntoResponse, Response, Route, Server,
};
use serde_json::json;
use tokio::select;
use tokio::sync::broadcast::error::RecvError;
use tracing::{debug, error, info, span, warn, Instrument};

use crate::asr::aws::AwsTranscribe;
use crate::bridge::{BridgeConfig, CallBridge};
use crate::config::Settings;
use crate::error::BridgeError;
use crate::events::BroadcastNotifier;
use crate::storage::S3BlobStore;

/// Close status sent when a start event carries the wrong account id.
pub const AUTH_FAILURE_CLOSE_CODE: u16 = 4401;

const DEFAULT_REGION: &str = "us-east-1";

#[derive(Clone)]
pub struct Context {
    bridge: CallBridge,
    events: BroadcastNotifier,
    cpu_threshold: f64,
}

impl Context {
    pub fn new(bridge: CallBridge, events: BroadcastNotifier, cpu_threshold: f64) -> Self {
        Self {
            bridge,
            events,
            cpu_threshold,
        }
    }

    /// Production wiring: S3 for recordings, Amazon Transcribe for audio.
    pub fn from_settings(sdk_config: &SdkConfig, settings: &Settings) -> anyhow::Result<Self> {
        let region = sdk_config
            .region()
            .map(|r| r.to_string())
            .unwrap_or_else(|| DEFAULT_REGION.to_string());
        let bridge_config: BridgeConfig = settings.bridge_config(&region)?;
        let events = BroadcastNotifier::default();
        let notifier = Arc::new(events.clone());
        let transcribe = AwsTranscribe::new(
            sdk_config,
            LanguageCode::from(settings.transcribe.language_code.as_str()),
            notifier.clone(),
        );
        let bridge = CallBridge::new(
            bridge_config,
            Arc::new(S3BlobStore::new(sdk_config)),
            Arc::new(transcribe),
            notifier,
        );
        Ok(Self::new(bridge, events, settings.health.cpu_threshold))
    }

    pub fn bridge(&self) -> &CallBridge {
        &self.bridge
    }
}

#[handler]
pub async fn stream_call(
    ctx: Data<&Context>,
    remote_addr: &RemoteAddr,
    ws: WebSocket,
) -> impl IntoResponse {
    let bridge = ctx.bridge.clone();
    let peer = remote_addr.to_string();
    ws.on_upgrade(move |mut socket| async move {
        let mut connection = bridge.connect();
        let span = span!(
            tracing::Level::INFO,
            "call_stream",
            connection = %connection.id(),
            peer = %peer
        );
        debug!(parent: &span, "accepted media stream connection");

        let fut = async {
            while let Some(res) = socket.next().await {
                let msg = res.map_err(|e| BridgeError::Socket(e.to_string()))?;
                let raw = match msg {
                    Message::Text(text) => text.into_bytes(),
                    Message::Binary(bin) => bin,
                    Message::Close(_) => break,
                    _ => continue,
                };
                let Err(e) = connection.on_message(&raw).await else {
                    continue;
                };
                if e.closes_connection() {
                    error!("{e}, closing connection");
                    let _ = socket
                        .send(Message::close_with(AUTH_FAILURE_CLOSE_CODE, "unauthorized account"))
                        .await;
                    break;
                }
                error!("{e}");
            }
            Ok(()) as Result<(), BridgeError>
        };

        if let Err(e) = fut.instrument(span.clone()).await {
            warn!(parent: &span, "{e}, forcing close");
            let _ = socket.close().await;
        }
        // finalize even when the socket failed; this runs to completion
        if let Err(e) = connection.on_close().instrument(span.clone()).await {
            error!(parent: &span, "{e}");
        }
        info!(parent: &span, "media stream connection closed");
    })
}

/// Streams every call event as JSON to a monitoring client.
#[handler]
pub async fn stream_events(ctx: Data<&Context>, ws: WebSocket) -> impl IntoResponse {
    let mut events_rx = ctx.events.subscribe();
    ws.on_upgrade(|mut socket| async move {
        let fut = async {
            loop {
                select! {
                    msg = socket.next() => {
                        let Some(res) = msg else { break };
                        if res?.is_close() {
                            break
                        }
                    },
                    evt_poll = events_rx.recv() => {
                        let evt = match evt_poll {
                            Ok(evt) => evt,
                            Err(RecvError::Lagged(skipped)) => {
                                warn!("event listener lagged by {skipped} events");
                                continue
                            }
                            Err(RecvError::Closed) => break,
                        };
                        let Ok(json) = serde_json::to_string(&evt) else {
                            warn!("failed to serialize: {:?}", evt);
                            continue
                        };
                        socket.send(Message::Text(json)).await?
                    },
                }
            }
            Ok(())
        };

        let res: anyhow::Result<()> = fut.await;
        match res {
            Ok(()) => debug!("event listener closed"),
            Err(e) => warn!("event listener error: {}", e),
        }
    })
}

#[handler]
pub async fn health_check(ctx: Data<&Context>) -> Response {
    let cpu_usage = cpu_usage_percent();
    let healthy = cpu_usage.map_or(true, |usage| usage <= ctx.cpu_threshold);
    let status = if healthy {
        StatusCode::OK
    } else {
        StatusCode::SERVICE_UNAVAILABLE
    };
    let active_calls = ctx.bridge.store().len().await;
    Response::builder()
        .status(status)
        .header(
            "Cache-Control",
            "max-age=0, no-cache, no-store, must-revalidate, proxy-revalidate",
        )
        .content_type("application/json")
        .body(
            json!({
                "Http-Status": status.as_u16(),
                "Healthy": healthy,
                "CpuUsage": cpu_usage,
                "ActiveCalls": active_calls,
            })
            .to_string(),
        )
}

/// One minute load average as a percentage of available cores.
fn cpu_usage_percent() -> Option<f64> {
    let loadavg = std::fs::read_to_string("/proc/loadavg").ok()?;
    let one_minute: f64 = loadavg.split_whitespace().next()?.parse().ok()?;
    let cores = std::thread::available_parallelism().ok()?.get() as f64;
    Some(one_minute / cores * 100.0)
}

pub fn routes() -> Route {
    Route::new()
        .at("/api/v1/ws", get(stream_call))
        .at("/api/v1/events", get(stream_events))
        .at("/health/check", get(health_check))
}

pub async fn app(sdk_config: &SdkConfig, settings: &Settings) -> anyhow::Result<()> {
    let ctx = Context::from_settings(sdk_config, settings)?;
    let app = routes().data(ctx);
    let addr = format!("{}:{}", settings.server.host, settings.server.port);
    info!("listening on {addr}");
    let listener = TcpListener::bind(addr);
    let server = Server::new(listener);

    server.run(app).await?;
    Ok(())
}
