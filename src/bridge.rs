//! Per-call state machine driving the audio bridge.
//!
//! A connection moves `Idle → Active → Ending → Closed`. Messages on one
//! connection are handled strictly in order; different connections only meet
//! in the [`SessionStore`].

use std::fmt::{Debug, Formatter};
use std::ops::Deref;
use std::path::PathBuf;
use std::sync::Arc;

use tracing::{debug, error, info, warn};

use crate::asr::TranscriptionSink;
use crate::error::BridgeError;
use crate::events::{CallEventNotifier, CallMetadata};
use crate::protocol::{
    MediaEvent, ProtocolVariant, StartEvent, StopEvent, StreamEvent, TrackRoutingPolicy,
};
use crate::recording::{FinalizeReport, Finalizer, RecordingSink, UploadTarget};
use crate::session::CallSession;
use crate::storage::BlobStore;
use crate::store::{ConnectionId, SessionStore};

pub const RECORDING_CHANNELS: u16 = 2;

#[derive(Debug, Clone)]
pub struct BridgeConfig {
    pub variant: ProtocolVariant,
    pub account_id: String,
    pub sample_rate: u32,
    pub track_routing: Option<TrackRoutingPolicy>,
    pub record_calls: bool,
    pub temp_dir: PathBuf,
    pub upload: UploadTarget,
}

impl BridgeConfig {
    pub fn routing(&self) -> TrackRoutingPolicy {
        self.track_routing.unwrap_or_else(|| self.variant.default_routing())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CallState {
    Idle,
    Active,
    Ending,
    Closed,
}

pub struct InnerCallBridge {
    config: BridgeConfig,
    store: SessionStore,
    transcription: Arc<dyn TranscriptionSink>,
    notifier: Arc<dyn CallEventNotifier>,
    finalizer: Finalizer,
}

#[derive(Clone)]
pub struct CallBridge {
    inner: Arc<InnerCallBridge>,
}

impl Debug for CallBridge {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CallBridge")
            .field("variant", &self.config.variant)
            .finish()
    }
}

impl Deref for CallBridge {
    type Target = InnerCallBridge;

    fn deref(&self) -> &Self::Target {
        &self.inner
    }
}

impl CallBridge {
    pub fn new(
        config: BridgeConfig,
        blob_store: Arc<dyn BlobStore>,
        transcription: Arc<dyn TranscriptionSink>,
        notifier: Arc<dyn CallEventNotifier>,
    ) -> Self {
        let finalizer = Finalizer::new(
            blob_store,
            notifier.clone(),
            config.upload.clone(),
            RECORDING_CHANNELS,
        );
        let inner = InnerCallBridge {
            config,
            store: SessionStore::new(),
            transcription,
            notifier,
            finalizer,
        };
        CallBridge { inner: Arc::new(inner) }
    }

    pub fn store(&self) -> &SessionStore {
        &self.store
    }

    pub fn config(&self) -> &BridgeConfig {
        &self.config
    }

    /// Opens the per-connection handle for a freshly accepted socket.
    pub fn connect(&self) -> CallConnection {
        CallConnection {
            id: ConnectionId::next(),
            bridge: self.clone(),
            finished_call: None,
        }
    }
}

/// One socket's view of the bridge. Owns no audio state itself; the session
/// lives in the store under this connection's id.
pub struct CallConnection {
    id: ConnectionId,
    bridge: CallBridge,
    finished_call: Option<String>,
}

impl CallConnection {
    pub fn id(&self) -> ConnectionId {
        self.id
    }

    pub async fn state(&self) -> CallState {
        let Some(session) = self.bridge.store.get(self.id).await else {
            return match self.finished_call {
                Some(_) => CallState::Closed,
                None => CallState::Idle,
            };
        };
        let ended = session.lock().await.is_ended();
        if ended {
            CallState::Ending
        } else {
            CallState::Active
        }
    }

    /// Handles one raw wire message.
    pub async fn on_message(&mut self, raw: &[u8]) -> Result<(), BridgeError> {
        let event = self.bridge.config.variant.parse(raw)?;
        debug!(connection = %self.id, event = event.name(), "received event");
        match event {
            StreamEvent::Connected { protocol, version } => {
                info!(
                    connection = %self.id,
                    protocol = %protocol,
                    version = %version,
                    "client connected"
                );
                Ok(())
            }
            StreamEvent::Start(start) => self.on_start(start).await,
            StreamEvent::Media(media) => self.on_media(media).await,
            StreamEvent::Stop(stop) => self.on_stop(stop).await.map(|_| ()),
        }
    }

    async fn on_start(&mut self, start: StartEvent) -> Result<(), BridgeError> {
        info!(connection = %self.id, call_id = %start.call_sid, "received start event");
        let bridge = &self.bridge;
        start.authorize(&bridge.config.account_id)?;
        if bridge.store.contains(self.id).await {
            return Err(BridgeError::ProtocolOrder {
                connection: self.id,
                event: "start",
                detail: "while a call is already active",
            });
        }
        let declared_rate = start.media_format.sample_rate;
        if let Some(rate) = declared_rate.filter(|&r| r != bridge.config.sample_rate) {
            warn!(
                call_id = %start.call_sid,
                declared = rate,
                configured = bridge.config.sample_rate,
                "declared sample rate differs from the configured one"
            );
        }

        let mut metadata =
            CallMetadata::started(&start, bridge.config.sample_rate, bridge.config.record_calls);
        let mut session = CallSession::new(
            self.id,
            metadata.clone(),
            bridge.config.variant.encoding(),
            bridge.config.routing(),
        );

        if metadata.should_record_call {
            match RecordingSink::create(&bridge.config.temp_dir, &metadata.call_id, self.id).await {
                Ok(sink) => session = session.with_recording(sink),
                Err(e) => {
                    let e = BridgeError::upstream("opening recording sink", e);
                    error!(call_id = %metadata.call_id, "{e}");
                    metadata.should_record_call = false;
                }
            }
        }

        match bridge.transcription.start(&metadata).await {
            Ok(writer) => session = session.with_transcription(writer),
            Err(e) => error!(
                call_id = %metadata.call_id,
                "{}",
                BridgeError::upstream("starting transcription", e)
            ),
        }

        if bridge.store.insert(self.id, session).await.is_err() {
            return Err(BridgeError::ProtocolOrder {
                connection: self.id,
                event: "start",
                detail: "while a call is already active",
            });
        }
        self.finished_call = None;

        if let Err(e) = bridge.notifier.on_start(&metadata).await {
            let e = BridgeError::upstream("writing call start event", e);
            error!(call_id = %metadata.call_id, "{e}");
        }
        Ok(())
    }

    async fn on_media(&mut self, media: MediaEvent) -> Result<(), BridgeError> {
        let Some(session) = self.bridge.store.get(self.id).await else {
            let detail = match self.finished_call {
                Some(_) => "after the call ended",
                None => "before start",
            };
            return Err(BridgeError::ProtocolOrder {
                connection: self.id,
                event: "media",
                detail,
            });
        };
        let mut session = session.lock().await;
        session.append_media(&media).await.map(|_| ())
    }

    async fn on_stop(&mut self, stop: StopEvent) -> Result<FinalizeReport, BridgeError> {
        info!(
            connection = %self.id,
            call_id = %stop.call_sid,
            reason = ?stop.reason,
            "received stop event"
        );
        if let Some(session) = self.bridge.store.get(self.id).await {
            let session = session.lock().await;
            if session.call_id() != stop.call_sid {
                warn!(
                    call_id = %session.call_id(),
                    stop_call_id = %stop.call_sid,
                    "stop event names a different call, ending the active one"
                );
            }
        }
        self.end_call(stop.reason).await
    }

    /// Socket closed or failed. Finalizes whatever call is still active.
    pub async fn on_close(&mut self) -> Result<(), BridgeError> {
        if !self.bridge.store.contains(self.id).await {
            debug!(connection = %self.id, "connection closed without an active call");
            return Ok(());
        }
        debug!(connection = %self.id, "connection closed, ending active call");
        self.end_call(None).await.map(|_| ())
    }

    /// Shared terminal path for stop and close. Finalizes at most once.
    async fn end_call(&mut self, reason: Option<String>) -> Result<FinalizeReport, BridgeError> {
        let bridge = self.bridge.clone();
        let Some(shared) = bridge.store.get(self.id).await else {
            return Err(match self.finished_call.clone() {
                Some(call_id) => BridgeError::DuplicateEnd {
                    call_id,
                    detail: "call already finalized",
                },
                None => BridgeError::ProtocolOrder {
                    connection: self.id,
                    event: "stop",
                    detail: "before start",
                },
            });
        };

        // flip `ended` before any await below so racing media is rejected
        let ended = shared.lock().await.end(reason)?;
        let metadata = ended.metadata;
        info!(
            call_id = %metadata.call_id,
            duration_ms = ended.duration.num_milliseconds(),
            "ending call"
        );

        drop(ended.transcription);
        if let Err(e) = bridge.notifier.on_end(&metadata).await {
            let e = BridgeError::upstream("writing call end event", e);
            error!(call_id = %metadata.call_id, "{e}");
        }

        let report = match ended.recording {
            Some(recording) => bridge.finalizer.finalize(recording, &metadata).await,
            None => FinalizeReport::default(),
        };

        bridge.store.remove(self.id).await;
        self.finished_call = Some(metadata.call_id.clone());
        debug!(call_id = %metadata.call_id, connection = %self.id, "removed session from store");
        Ok(report)
    }
}
