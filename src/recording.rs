//! Local capture of a call's interleaved audio and its end-of-call
//! finalization: WAV assembly, upload, and temp file cleanup.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use tokio::fs::{self, File};
use tokio::io::{self, AsyncWriteExt, BufWriter};
use tracing::{debug, error, info, warn};

use crate::codec::{posixify_filename, wav_header};
use crate::error::BridgeError;
use crate::events::{CallEventNotifier, CallMetadata};
use crate::storage::{object_url, BlobStore};
use crate::store::ConnectionId;

/// Append-only temp file holding raw interleaved PCM for one call.
///
/// Local files are named per connection, so two sockets reporting the same
/// call id never share a file. Object keys only use the call id.
#[derive(Debug)]
pub struct RecordingSink {
    object_stem: String,
    raw_path: PathBuf,
    wav_path: PathBuf,
    writer: Option<BufWriter<File>>,
    total_bytes_written: u64,
}

impl RecordingSink {
    pub async fn create(dir: &Path, call_id: &str, connection: ConnectionId) -> io::Result<Self> {
        let object_stem = posixify_filename(call_id);
        let local_stem = format!("{object_stem}-{}", connection.as_u64());
        let raw_path = dir.join(format!("{local_stem}.raw"));
        let wav_path = dir.join(format!("{local_stem}.wav"));
        let file = File::create(&raw_path).await?;
        debug!(path = %raw_path.display(), "opened recording sink");
        Ok(Self {
            object_stem,
            raw_path,
            wav_path,
            writer: Some(BufWriter::new(file)),
            total_bytes_written: 0,
        })
    }

    pub async fn append(&mut self, bytes: &[u8]) -> io::Result<()> {
        let Some(writer) = self.writer.as_mut() else {
            return Err(io::Error::new(io::ErrorKind::BrokenPipe, "recording sink is closed"));
        };
        writer.write_all(bytes).await?;
        self.total_bytes_written += bytes.len() as u64;
        Ok(())
    }

    /// Flushes and closes the file. Closing twice is a no-op.
    pub async fn close(&mut self) -> io::Result<()> {
        if let Some(mut writer) = self.writer.take() {
            writer.flush().await?;
            writer.into_inner().sync_all().await?;
        }
        Ok(())
    }

    pub fn total_bytes_written(&self) -> u64 {
        self.total_bytes_written
    }

    fn object_name(&self, extension: &str) -> String {
        format!("{}.{extension}", self.object_stem)
    }
}

/// Where finalized recordings go.
#[derive(Debug, Clone)]
pub struct UploadTarget {
    pub bucket: Option<String>,
    pub prefix: String,
    pub region: String,
}

#[derive(Debug, Default)]
pub struct FinalizeReport {
    pub uploaded_keys: Vec<String>,
    pub deleted: Vec<PathBuf>,
    pub recording_url: Option<String>,
    pub failures: Vec<BridgeError>,
}

pub struct Finalizer {
    blob_store: Arc<dyn BlobStore>,
    notifier: Arc<dyn CallEventNotifier>,
    target: UploadTarget,
    channels: u16,
}

impl Finalizer {
    pub fn new(
        blob_store: Arc<dyn BlobStore>,
        notifier: Arc<dyn CallEventNotifier>,
        target: UploadTarget,
        channels: u16,
    ) -> Self {
        Self {
            blob_store,
            notifier,
            target,
            channels,
        }
    }

    /// Turns the raw capture into a WAV file, uploads both artifacts, and
    /// removes the temp files.
    ///
    /// Every step is attempted even if an earlier one failed; failures are
    /// logged and collected in the report.
    pub async fn finalize(
        &self,
        mut recording: RecordingSink,
        metadata: &CallMetadata,
    ) -> FinalizeReport {
        let call_id = metadata.call_id.as_str();
        let mut report = FinalizeReport::default();

        if let Err(e) = recording.close().await {
            report.fail(call_id, BridgeError::upstream("closing raw recording", e));
        }

        let data_len = recording.total_bytes_written();
        let wav_built = match self.write_wav(&recording, data_len, metadata.sampling_rate).await {
            Ok(()) => true,
            Err(e) => {
                report.fail(call_id, e);
                false
            }
        };

        let raw_key = self
            .upload(&recording.raw_path, &recording.object_name("raw"), call_id, &mut report)
            .await;
        let wav_key = if wav_built {
            self.upload(&recording.wav_path, &recording.object_name("wav"), call_id, &mut report)
                .await
        } else {
            None
        };

        // a failed wav build may still have left a partial file behind
        self.delete(&recording.raw_path, call_id, &mut report).await;
        self.delete(&recording.wav_path, call_id, &mut report).await;

        if let (Some(bucket), Some(key)) = (self.target.bucket.as_deref(), wav_key) {
            let url = object_url(bucket, &self.target.region, &key);
            if let Err(e) = self.notifier.on_recording_available(metadata, &url).await {
                report.fail(call_id, BridgeError::upstream("publishing recording url", e));
            }
            report.recording_url = Some(url);
        }

        info!(
            call_id,
            bytes = data_len,
            uploaded = report.uploaded_keys.len(),
            raw = raw_key.is_some(),
            failures = report.failures.len(),
            "recording finalized"
        );
        report
    }

    async fn write_wav(
        &self,
        recording: &RecordingSink,
        data_len: u64,
        sample_rate: u32,
    ) -> Result<(), BridgeError> {
        let header = u32::try_from(data_len)
            .ok()
            .and_then(|len| wav_header(len, sample_rate, self.channels))
            .ok_or_else(|| {
                BridgeError::upstream(
                    "sizing wav header",
                    anyhow::anyhow!("{data_len} bytes exceed the RIFF size limit"),
                )
            })?;
        let fut = async {
            let mut raw = File::open(&recording.raw_path).await?;
            let mut wav = BufWriter::new(File::create(&recording.wav_path).await?);
            wav.write_all(&header).await?;
            io::copy(&mut raw, &mut wav).await?;
            wav.flush().await?;
            Ok(()) as io::Result<()>
        };
        fut.await.map_err(|e| {
            BridgeError::upstream(format!("writing {}", recording.wav_path.display()), e)
        })
    }

    async fn upload(
        &self,
        path: &Path,
        object_name: &str,
        call_id: &str,
        report: &mut FinalizeReport,
    ) -> Option<String> {
        let Some(bucket) = self.target.bucket.as_deref() else {
            warn!(
                call_id,
                path = %path.display(),
                "no recordings bucket configured, skipping upload"
            );
            return None;
        };
        let key = format!("{}{}", self.target.prefix, object_name);
        let body = match fs::read(path).await {
            Ok(body) => body,
            Err(e) => {
                let e = BridgeError::upstream(format!("reading {}", path.display()), e);
                report.fail(call_id, e);
                return None;
            }
        };
        match self.blob_store.put(bucket, &key, body).await {
            Ok(()) => {
                debug!(call_id, bucket, key = %key, "uploaded recording artifact");
                report.uploaded_keys.push(key.clone());
                Some(key)
            }
            Err(e) => {
                report.fail(call_id, BridgeError::upstream(format!("uploading {key}"), e));
                None
            }
        }
    }

    async fn delete(&self, path: &Path, call_id: &str, report: &mut FinalizeReport) {
        match fs::remove_file(path).await {
            Ok(()) => {
                debug!(call_id, path = %path.display(), "deleted temp file");
                report.deleted.push(path.to_path_buf());
            }
            Err(e) if e.kind() == io::ErrorKind::NotFound => {}
            Err(e) => report.fail(
                call_id,
                BridgeError::upstream(format!("deleting {}", path.display()), e),
            ),
        }
    }
}

impl FinalizeReport {
    fn fail(&mut self, call_id: &str, e: BridgeError) {
        error!(call_id, "{e}");
        self.failures.push(e);
    }
}
