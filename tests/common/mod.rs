#![allow(dead_code)]

use std::path::Path;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use serde_json::{json, Value};
use tokio::task::JoinHandle;

use voicestream_bridge::asr::{AudioWriter, TranscriptionSink};
use voicestream_bridge::base64box::Base64Box;
use voicestream_bridge::bridge::{BridgeConfig, CallBridge};
use voicestream_bridge::events::{CallEvent, CallEventNotifier, CallMetadata};
use voicestream_bridge::protocol::ProtocolVariant;
use voicestream_bridge::recording::UploadTarget;
use voicestream_bridge::storage::BlobStore;

pub const ACCOUNT: &str = "AC-test-account";
pub const BUCKET: &str = "recordings";

#[derive(Default)]
pub struct MemoryBlobStore {
    objects: Mutex<Vec<(String, String, Vec<u8>)>>,
    fail_suffix: Option<String>,
}

impl MemoryBlobStore {
    pub fn failing_on(suffix: &str) -> Self {
        Self {
            objects: Mutex::new(Vec::new()),
            fail_suffix: Some(suffix.to_string()),
        }
    }

    pub fn keys(&self) -> Vec<String> {
        self.objects.lock().unwrap().iter().map(|(_, key, _)| key.clone()).collect()
    }

    /// Every body uploaded under `key`, in upload order.
    pub fn objects(&self, key: &str) -> Vec<Vec<u8>> {
        self.objects
            .lock()
            .unwrap()
            .iter()
            .filter(|(_, k, _)| k == key)
            .map(|(_, _, body)| body.clone())
            .collect()
    }

    pub fn object(&self, key: &str) -> Option<Vec<u8>> {
        self.objects
            .lock()
            .unwrap()
            .iter()
            .find(|(_, k, _)| k == key)
            .map(|(_, _, body)| body.clone())
    }
}

#[async_trait]
impl BlobStore for MemoryBlobStore {
    async fn put(&self, bucket: &str, key: &str, body: Vec<u8>) -> anyhow::Result<()> {
        if let Some(suffix) = &self.fail_suffix {
            if key.ends_with(suffix.as_str()) {
                anyhow::bail!("simulated upload failure for {key}");
            }
        }
        self.objects
            .lock()
            .unwrap()
            .push((bucket.to_string(), key.to_string(), body));
        Ok(())
    }
}

/// Collects each call's transcription audio on a background task.
#[derive(Default)]
pub struct CapturingTranscription {
    streams: Mutex<Vec<(String, JoinHandle<Vec<u8>>)>>,
}

impl CapturingTranscription {
    pub fn started(&self) -> usize {
        self.streams.lock().unwrap().len()
    }

    /// Waits for the stream of `call_id` to end and returns everything it carried.
    pub async fn received(&self, call_id: &str) -> Vec<u8> {
        let handle = {
            let mut streams = self.streams.lock().unwrap();
            let idx = streams
                .iter()
                .position(|(id, _)| id == call_id)
                .expect("no transcription stream for call");
            streams.remove(idx).1
        };
        handle.await.unwrap()
    }
}

#[async_trait]
impl TranscriptionSink for CapturingTranscription {
    async fn start(&self, metadata: &CallMetadata) -> anyhow::Result<AudioWriter> {
        let (writer, mut rx) = AudioWriter::channel(64);
        let handle = tokio::spawn(async move {
            let mut audio = Vec::new();
            while let Some(chunk) = rx.recv().await {
                audio.extend(chunk);
            }
            audio
        });
        self.streams
            .lock()
            .unwrap()
            .push((metadata.call_id.clone(), handle));
        Ok(writer)
    }
}

#[derive(Default)]
pub struct CapturingNotifier {
    events: Mutex<Vec<CallEvent>>,
}

impl CapturingNotifier {
    pub fn events(&self) -> Vec<CallEvent> {
        self.events.lock().unwrap().clone()
    }

    pub fn count(&self, pred: impl Fn(&CallEvent) -> bool) -> usize {
        self.events.lock().unwrap().iter().filter(|e| pred(e)).count()
    }
}

#[async_trait]
impl CallEventNotifier for CapturingNotifier {
    async fn notify(&self, event: CallEvent) -> anyhow::Result<()> {
        self.events.lock().unwrap().push(event);
        Ok(())
    }
}

pub struct Harness {
    pub bridge: CallBridge,
    pub blobs: Arc<MemoryBlobStore>,
    pub transcription: Arc<CapturingTranscription>,
    pub notifier: Arc<CapturingNotifier>,
}

pub fn bridge_config(dir: &Path, variant: ProtocolVariant, record_calls: bool) -> BridgeConfig {
    BridgeConfig {
        variant,
        account_id: ACCOUNT.to_string(),
        sample_rate: 8000,
        track_routing: None,
        record_calls,
        temp_dir: dir.to_path_buf(),
        upload: UploadTarget {
            bucket: Some(BUCKET.to_string()),
            prefix: "lca-audio-wav/".to_string(),
            region: "us-east-1".to_string(),
        },
    }
}

pub fn harness_with(config: BridgeConfig, blobs: MemoryBlobStore) -> Harness {
    let blobs = Arc::new(blobs);
    let transcription = Arc::new(CapturingTranscription::default());
    let notifier = Arc::new(CapturingNotifier::default());
    let bridge = CallBridge::new(config, blobs.clone(), transcription.clone(), notifier.clone());
    Harness {
        bridge,
        blobs,
        transcription,
        notifier,
    }
}

pub fn harness(dir: &Path, variant: ProtocolVariant) -> Harness {
    harness_with(bridge_config(dir, variant, true), MemoryBlobStore::default())
}

pub fn files_in(dir: &Path) -> usize {
    std::fs::read_dir(dir).unwrap().count()
}

pub fn connected() -> Vec<u8> {
    json!({"event": "connected", "protocol": "Call", "version": "1.0.0"})
        .to_string()
        .into_bytes()
}

pub fn talkdesk_start(account: &str, call_id: &str) -> Vec<u8> {
    json!({
        "event": "start",
        "sequenceNumber": "1",
        "streamSid": "MZ-stream",
        "start": {
            "accountSid": account,
            "callSid": call_id,
            "streamSid": "MZ-stream",
            "mediaFormat": {"encoding": "audio/x-mulaw", "sampleRate": 8000, "channels": 1}
        }
    })
    .to_string()
    .into_bytes()
}

pub fn exotel_start(account: &str, call_id: &str) -> Vec<u8> {
    json!({
        "event": "start",
        "sequence_number": 1,
        "stream_sid": "exo-stream",
        "start": {
            "accountSid": account,
            "callSid": call_id,
            "from": "+919800000001",
            "to": "+919800000002",
            "mediaFormat": {"encoding": "base64", "sample_rate": "8000", "bit_rate": "128kbps"}
        }
    })
    .to_string()
    .into_bytes()
}

pub fn media(track: Option<&str>, payload: &[u8]) -> Vec<u8> {
    let mut media = json!({
        "chunk": "1",
        "timestamp": "20",
        "payload": Base64Box(payload.to_vec()),
    });
    if let Some(track) = track {
        media["track"] = Value::String(track.to_string());
    }
    json!({"event": "media", "streamSid": "MZ-stream", "media": media})
        .to_string()
        .into_bytes()
}

pub fn stop(call_id: &str) -> Vec<u8> {
    json!({
        "event": "stop",
        "stop": {"accountSid": ACCOUNT, "callSid": call_id, "reason": "callended"}
    })
    .to_string()
    .into_bytes()
}
