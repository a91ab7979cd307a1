use chrono::{DateTime, Utc};
use tracing::{debug, warn};

use crate::asr::AudioWriter;
use crate::codec::{mulaw_to_linear16, BYTES_PER_SAMPLE};
use crate::error::BridgeError;
use crate::events::CallMetadata;
use crate::interleave::{Interleaver, Track};
use crate::protocol::{AudioEncoding, MediaEvent, TrackRoutingPolicy};
use crate::recording::RecordingSink;
use crate::store::ConnectionId;

/// Server-side state of one call's audio bridge.
#[derive(Debug)]
pub struct CallSession {
    connection: ConnectionId,
    metadata: CallMetadata,
    encoding: AudioEncoding,
    routing: TrackRoutingPolicy,
    interleaver: Interleaver,
    recording: Option<RecordingSink>,
    transcription: Option<AudioWriter>,
    started_at: DateTime<Utc>,
    media_bytes: u64,
    ended: bool,
}

/// Resources handed over to finalization once a session has ended.
#[derive(Debug)]
pub struct EndedSession {
    pub metadata: CallMetadata,
    pub recording: Option<RecordingSink>,
    pub transcription: Option<AudioWriter>,
    pub duration: chrono::Duration,
}

impl CallSession {
    pub fn new(
        connection: ConnectionId,
        metadata: CallMetadata,
        encoding: AudioEncoding,
        routing: TrackRoutingPolicy,
    ) -> Self {
        Self {
            connection,
            metadata,
            encoding,
            routing,
            interleaver: Interleaver::new(BYTES_PER_SAMPLE),
            recording: None,
            transcription: None,
            started_at: Utc::now(),
            media_bytes: 0,
            ended: false,
        }
    }

    pub fn with_recording(mut self, recording: RecordingSink) -> Self {
        self.recording = Some(recording);
        self
    }

    pub fn with_transcription(mut self, writer: AudioWriter) -> Self {
        self.transcription = Some(writer);
        self
    }

    pub fn call_id(&self) -> &str {
        &self.metadata.call_id
    }

    pub fn is_ended(&self) -> bool {
        self.ended
    }

    /// Decoded PCM bytes appended to the track writers so far.
    pub fn media_bytes(&self) -> u64 {
        self.media_bytes
    }

    /// Raw PCM bytes captured by the recording sink so far.
    pub fn total_bytes_written(&self) -> u64 {
        self.recording.as_ref().map_or(0, RecordingSink::total_bytes_written)
    }

    /// Decodes one media chunk, routes it to its track(s), and forwards any
    /// completed stereo frames. Returns the number of frame bytes forwarded.
    pub async fn append_media(&mut self, media: &MediaEvent) -> Result<usize, BridgeError> {
        if self.ended {
            return Err(BridgeError::ProtocolOrder {
                connection: self.connection,
                event: "media",
                detail: "after the call ended",
            });
        }
        let pcm = match self.encoding {
            AudioEncoding::Mulaw => mulaw_to_linear16(&media.payload),
            AudioEncoding::Linear16 => media.payload.clone(),
        };

        let mut frames = Vec::new();
        match self.routing {
            TrackRoutingPolicy::Tagged => {
                let Some(track) = media.tagged_track() else {
                    warn!(
                        call_id = %self.metadata.call_id,
                        track = ?media.track,
                        "dropping media chunk with unknown track"
                    );
                    return Ok(0);
                };
                frames.extend(self.interleaver.write(track, &pcm)?);
                self.media_bytes += pcm.len() as u64;
            }
            TrackRoutingPolicy::Duplicate => {
                frames.extend(self.interleaver.write(Track::Agent, &pcm)?);
                frames.extend(self.interleaver.write(Track::Customer, &pcm)?);
                self.media_bytes += 2 * pcm.len() as u64;
            }
        }

        self.forward(&frames).await?;
        Ok(frames.len())
    }

    async fn forward(&mut self, frames: &[u8]) -> Result<(), BridgeError> {
        if frames.is_empty() {
            return Ok(());
        }
        if let Some(writer) = self.transcription.as_ref() {
            if let Err(e) = writer.write(frames.to_vec()).await {
                // the transcription stream is gone; keep recording without it
                warn!(call_id = %self.metadata.call_id, "transcription sink closed: {e}");
                self.transcription = None;
            }
        }
        if let Some(recording) = self.recording.as_mut() {
            recording
                .append(frames)
                .await
                .map_err(|e| BridgeError::upstream("appending to recording", e))?;
        }
        Ok(())
    }

    /// Marks the session ended and releases its writers.
    ///
    /// Must run before any asynchronous finalization so media arriving in the
    /// meantime is rejected. A second call reports a duplicate end.
    pub fn end(&mut self, reason: Option<String>) -> Result<EndedSession, BridgeError> {
        if self.ended {
            return Err(BridgeError::DuplicateEnd {
                call_id: self.metadata.call_id.clone(),
                detail: "finalization already in progress",
            });
        }
        self.ended = true;

        self.interleaver.close(Track::Agent);
        self.interleaver.close(Track::Customer);
        let discarded = self.interleaver.finish()?;
        if discarded > 0 {
            debug!(
                call_id = %self.metadata.call_id,
                discarded,
                "dropped unmatched trailing samples"
            );
        }

        Ok(EndedSession {
            metadata: self.metadata.ended(reason),
            recording: self.recording.take(),
            transcription: self.transcription.take(),
            duration: Utc::now() - self.started_at,
        })
    }
}
