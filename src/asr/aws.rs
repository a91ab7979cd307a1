use std::error::Error;
use std::fmt::{Display, Formatter};
use std::sync::Arc;

use async_stream::stream;
use async_trait::async_trait;
use aws_config::SdkConfig;
use aws_sdk_transcribestreaming::operation::start_stream_transcription::StartStreamTranscriptionOutput;
use aws_sdk_transcribestreaming::primitives::Blob;
use aws_sdk_transcribestreaming::types::{
    AudioEvent, AudioStream, LanguageCode, MediaEncoding, TranscriptResultStream,
};
use futures_util::TryStreamExt;
use tokio_stream::Stream;
use tracing::{info, warn};

use crate::asr::{AudioWriter, TranscriptionSink};
use crate::events::{CallEventNotifier, CallMetadata, TranscriptSegment};
use crate::interleave::Track;

const AUDIO_BUFFER: usize = 128;

/// Streams each call's stereo audio to Amazon Transcribe with channel
/// identification and publishes the resulting segments as call events.
pub struct AwsTranscribe {
    client: aws_sdk_transcribestreaming::Client,
    language_code: LanguageCode,
    notifier: Arc<dyn CallEventNotifier>,
}

impl AwsTranscribe {
    pub fn new(
        config: &SdkConfig,
        language_code: LanguageCode,
        notifier: Arc<dyn CallEventNotifier>,
    ) -> Self {
        Self {
            client: aws_sdk_transcribestreaming::Client::new(config),
            language_code,
            notifier,
        }
    }
}

#[async_trait]
impl TranscriptionSink for AwsTranscribe {
    async fn start(&self, metadata: &CallMetadata) -> anyhow::Result<AudioWriter> {
        let (writer, mut audio_rx) = AudioWriter::channel(AUDIO_BUFFER);
        let client = self.client.clone();
        let lang = self.language_code.clone();
        let notifier = self.notifier.clone();
        let call_id = metadata.call_id.clone();
        let sample_rate = metadata.sampling_rate as i32;

        tokio::spawn(async move {
            let fut = async {
                let input_stream = stream! {
                    while let Some(chunk) = audio_rx.recv().await {
                        let event = AudioEvent::builder().audio_chunk(Blob::new(chunk)).build();
                        yield Ok(AudioStream::AudioEvent(event));
                    }
                };
                let output = client
                    .start_stream_transcription()
                    .language_code(lang)
                    .media_sample_rate_hertz(sample_rate)
                    .media_encoding(MediaEncoding::Pcm)
                    .number_of_channels(2)
                    .enable_channel_identification(true)
                    .audio_stream(input_stream.into())
                    .send()
                    .await
                    .map_err(|e| StreamTranscriptionError::EstablishStreamError(Box::new(e)))?;

                to_stream(output, call_id.clone())
                    .try_for_each(|segment| {
                        let notifier = notifier.clone();
                        async move {
                            if let Err(e) = notifier.on_transcript(segment).await {
                                warn!("failed to publish transcript segment: {e}");
                            }
                            Ok(())
                        }
                    })
                    .await?;
                Ok(()) as Result<(), StreamTranscriptionError>
            };
            match fut.await {
                Ok(()) => info!(call_id = %call_id, "transcription stream closed"),
                Err(e) => warn!(call_id = %call_id, "transcription stream failed: {e}"),
            }
        });

        Ok(writer)
    }
}

fn channel_track(channel_id: Option<&str>) -> Track {
    match channel_id {
        Some("ch_1") => Track::Customer,
        _ => Track::Agent,
    }
}

fn to_stream(
    mut output: StartStreamTranscriptionOutput,
    call_id: String,
) -> impl Stream<Item = Result<TranscriptSegment, StreamTranscriptionError>> {
    stream! {
        while let Some(event) = output
            .transcript_result_stream
            .recv()
            .await
            .map_err(|e| StreamTranscriptionError::TranscriptResultStreamError(Box::new(e)))? {
            match event {
                TranscriptResultStream::TranscriptEvent(transcript_event) => {
                    let Some(transcript) = transcript_event.transcript else {
                        continue
                    };

                    for result in transcript.results.unwrap_or_default() {
                        let Some(alternatives) = result.alternatives else {
                            continue
                        };
                        let Some(first_alternative) = alternatives.first() else {
                            continue
                        };
                        let Some(text) = &first_alternative.transcript else {
                            continue
                        };
                        yield Ok(TranscriptSegment {
                            call_id: call_id.clone(),
                            channel: channel_track(result.channel_id.as_deref()),
                            segment_id: result.result_id.clone().unwrap_or_default(),
                            transcript: text.clone(),
                            is_partial: result.is_partial,
                            start_time: result.start_time,
                            end_time: result.end_time,
                        });
                    }
                }
                _ => yield Err(StreamTranscriptionError::Unknown),
            }
        }
    }
}

#[derive(Debug)]
enum StreamTranscriptionError {
    EstablishStreamError(Box<dyn Error + Send + Sync>),
    TranscriptResultStreamError(Box<dyn Error + Send + Sync>),
    Unknown,
}

impl Display for StreamTranscriptionError {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            StreamTranscriptionError::EstablishStreamError(e) => {
                write!(f, "EstablishStreamError: {}", e)
            }
            StreamTranscriptionError::TranscriptResultStreamError(e) => {
                write!(f, "TranscriptResultStreamError: {}", e)
            }
            StreamTranscriptionError::Unknown => write!(f, "Unknown"),
        }
    }
}

impl Error for StreamTranscriptionError {
    fn source(&self) -> Option<&(dyn Error + 'static)> {
        match self {
            StreamTranscriptionError::EstablishStreamError(e) => Some(e.as_ref()),
            StreamTranscriptionError::TranscriptResultStreamError(e) => Some(e.as_ref()),
            StreamTranscriptionError::Unknown => None,
        }
    }
}
