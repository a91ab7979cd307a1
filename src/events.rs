use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::sync::broadcast;
use tracing::{debug, info};

use crate::interleave::Track;
use crate::protocol::StartEvent;

pub const DEFAULT_FROM_NUMBER: &str = "Customer Phone";
pub const DEFAULT_TO_NUMBER: &str = "System Phone";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum CallPhase {
    Start,
    End,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CallMetadata {
    pub call_event: CallPhase,
    pub call_id: String,
    pub from_number: String,
    pub to_number: String,
    pub should_record_call: bool,
    pub sampling_rate: u32,
    pub agent_id: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
    pub timestamp: DateTime<Utc>,
}

impl CallMetadata {
    pub fn started(start: &StartEvent, sampling_rate: u32, should_record_call: bool) -> Self {
        CallMetadata {
            call_event: CallPhase::Start,
            call_id: start.call_sid.clone(),
            from_number: start.from.clone().unwrap_or_else(|| DEFAULT_FROM_NUMBER.to_string()),
            to_number: start.to.clone().unwrap_or_else(|| DEFAULT_TO_NUMBER.to_string()),
            should_record_call,
            sampling_rate,
            agent_id: uuid::Uuid::new_v4().to_string(),
            reason: None,
            timestamp: Utc::now(),
        }
    }

    /// End-of-call record derived from what the session already knows.
    pub fn ended(&self, reason: Option<String>) -> Self {
        CallMetadata {
            call_event: CallPhase::End,
            reason,
            timestamp: Utc::now(),
            ..self.clone()
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RecordingAvailable {
    pub call_id: String,
    pub recording_url: String,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TranscriptSegment {
    pub call_id: String,
    pub channel: Track,
    pub segment_id: String,
    pub transcript: String,
    pub is_partial: bool,
    pub start_time: f64,
    pub end_time: f64,
}

/// Everything the bridge reports about a call to the outside world.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "eventType", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum CallEvent {
    Start(CallMetadata),
    End(CallMetadata),
    AddS3RecordingUrl(RecordingAvailable),
    AddTranscriptSegment(TranscriptSegment),
}

impl CallEvent {
    pub fn call_id(&self) -> &str {
        match self {
            CallEvent::Start(m) | CallEvent::End(m) => &m.call_id,
            CallEvent::AddS3RecordingUrl(r) => &r.call_id,
            CallEvent::AddTranscriptSegment(s) => &s.call_id,
        }
    }
}

#[async_trait]
pub trait CallEventNotifier: Send + Sync {
    async fn notify(&self, event: CallEvent) -> anyhow::Result<()>;

    async fn on_start(&self, metadata: &CallMetadata) -> anyhow::Result<()> {
        self.notify(CallEvent::Start(metadata.clone())).await
    }

    async fn on_end(&self, metadata: &CallMetadata) -> anyhow::Result<()> {
        self.notify(CallEvent::End(metadata.clone())).await
    }

    async fn on_recording_available(
        &self,
        metadata: &CallMetadata,
        url: &str,
    ) -> anyhow::Result<()> {
        self.notify(CallEvent::AddS3RecordingUrl(RecordingAvailable {
            call_id: metadata.call_id.clone(),
            recording_url: url.to_string(),
        }))
        .await
    }

    async fn on_transcript(&self, segment: TranscriptSegment) -> anyhow::Result<()> {
        self.notify(CallEvent::AddTranscriptSegment(segment)).await
    }
}

/// Logs call events and fans them out to any subscribed listeners.
#[derive(Debug, Clone)]
pub struct BroadcastNotifier {
    tx: broadcast::Sender<CallEvent>,
}

impl BroadcastNotifier {
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity);
        Self { tx }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<CallEvent> {
        self.tx.subscribe()
    }
}

impl Default for BroadcastNotifier {
    fn default() -> Self {
        Self::new(128)
    }
}

#[async_trait]
impl CallEventNotifier for BroadcastNotifier {
    async fn notify(&self, event: CallEvent) -> anyhow::Result<()> {
        match &event {
            CallEvent::AddTranscriptSegment(segment) => debug!(
                call_id = %segment.call_id,
                channel = %segment.channel,
                partial = segment.is_partial,
                "transcript: {}",
                segment.transcript
            ),
            other => info!(
                call_id = %other.call_id(),
                "call event: {}",
                serde_json::to_string(other)?
            ),
        }
        // no listeners is fine
        let _ = self.tx.send(event);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::MediaFormat;
    use std::collections::BTreeMap;

    fn start_event() -> StartEvent {
        StartEvent {
            account_sid: "AC1".into(),
            call_sid: "CA42".into(),
            stream_sid: None,
            from: None,
            to: Some("+15550100".into()),
            media_format: MediaFormat {
                encoding: "audio/x-mulaw".into(),
                sample_rate: Some(8000),
                channels: Some(1),
            },
            custom_parameters: BTreeMap::new(),
        }
    }

    #[test]
    fn start_metadata_fills_placeholders() {
        let metadata = CallMetadata::started(&start_event(), 8000, true);
        assert_eq!(metadata.from_number, DEFAULT_FROM_NUMBER);
        assert_eq!(metadata.to_number, "+15550100");
        assert_eq!(metadata.call_event, CallPhase::Start);

        let ended = metadata.ended(Some("hangup".into()));
        assert_eq!(ended.call_event, CallPhase::End);
        assert_eq!(ended.call_id, "CA42");
        assert_eq!(ended.agent_id, metadata.agent_id);
    }

    #[test]
    fn events_serialize_with_type_tag() {
        let event = CallEvent::AddS3RecordingUrl(RecordingAvailable {
            call_id: "CA42".into(),
            recording_url: "https://b.s3.us-east-1.amazonaws.com/p/CA42.wav".into(),
        });
        let json = serde_json::to_value(&event).unwrap();
        assert_eq!(json["eventType"], "ADD_S3_RECORDING_URL");
        assert_eq!(json["callId"], "CA42");

        let start = CallEvent::Start(CallMetadata::started(&start_event(), 8000, false));
        let json = serde_json::to_value(&start).unwrap();
        assert_eq!(json["eventType"], "START");
        assert_eq!(json["callEvent"], "START");
        assert_eq!(json["samplingRate"], 8000);
    }

    #[tokio::test]
    async fn broadcast_reaches_subscribers() {
        let notifier = BroadcastNotifier::new(4);
        let mut rx = notifier.subscribe();
        let metadata = CallMetadata::started(&start_event(), 8000, false);
        notifier.on_start(&metadata).await.unwrap();
        let received = rx.recv().await.unwrap();
        assert_eq!(received, CallEvent::Start(metadata));
    }
}
