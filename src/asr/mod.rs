pub mod aws;

use async_trait::async_trait;
use tokio::sync::mpsc;

use crate::events::CallMetadata;

/// Write half of a per-call transcription stream.
///
/// Sends are bounded, so a slow consumer pushes back on the caller. Dropping
/// the writer ends the stream.
#[derive(Debug)]
pub struct AudioWriter {
    tx: mpsc::Sender<Vec<u8>>,
}

impl AudioWriter {
    pub fn channel(buffer: usize) -> (AudioWriter, mpsc::Receiver<Vec<u8>>) {
        let (tx, rx) = mpsc::channel(buffer);
        (AudioWriter { tx }, rx)
    }

    pub async fn write(&self, chunk: Vec<u8>) -> anyhow::Result<()> {
        Ok(self.tx.send(chunk).await?)
    }
}

/// Downstream consumer of a call's interleaved stereo audio.
#[async_trait]
pub trait TranscriptionSink: Send + Sync {
    async fn start(&self, metadata: &CallMetadata) -> anyhow::Result<AudioWriter>;
}
