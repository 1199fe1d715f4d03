// ── G-code upload sessions ──
//
// A transfer is a strict publish sequence on the ingest topic:
// start → chunk 0..n-1 → end. Chunk size is chosen by this side; the
// receiver reassembles by (job_id, seq). The whole session is
// all-or-nothing: a failed or timed-out publish fails the session, there
// is no per-chunk retry. Terminal device-side outcomes (Committed,
// Failed, TimedOut) are settled by the client once the correlated result
// arrives; this module only drives the transfer itself.

use std::sync::Arc;
use std::time::Duration;

use base64::Engine as _;
use base64::engine::general_purpose::STANDARD as BASE64;
use bytes::Bytes;
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};
use uuid::Uuid;

use printrelay_proto::message::{self, IngestMessage};
use printrelay_proto::{DeviceId, QoS, TopicFamily, TopicRouter, Transport};

use crate::error::CoreError;
use crate::model::ResultOutcome;

/// Where the receiver should store the file once reassembled.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UploadTarget {
    /// Printer SD card.
    Sd,
    /// Controller-local storage.
    Local,
}

impl UploadTarget {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Sd => "sd",
            Self::Local => "local",
        }
    }
}

/// Lifecycle of one upload session. States only advance; once terminal
/// (`Committed`, `Failed`, `Cancelled`, `TimedOut`) they never change.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum UploadState {
    /// Session created, nothing published yet.
    Init,
    /// `start` accepted by the broker queue.
    Started,
    /// Mid-transfer; `next_seq` is the next chunk to publish.
    Sending { next_seq: u64 },
    /// `end` published; awaiting the device-side result.
    Ended,
    /// Device confirmed the file was stored.
    Committed,
    /// Transfer or device-side processing failed.
    Failed { reason: String },
    /// Cancelled locally between chunks; a `cancel` was published so the
    /// receiver can discard partial state.
    Cancelled,
    /// No result arrived before the deadline.
    TimedOut,
}

impl UploadState {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            Self::Committed | Self::Failed { .. } | Self::Cancelled | Self::TimedOut
        )
    }
}

/// One upload to run.
#[derive(Debug, Clone)]
pub struct UploadRequest {
    /// Correlation id; generated when `None`.
    pub job_id: Option<String>,
    pub filename: String,
    pub data: Bytes,
    pub target: UploadTarget,
    /// Per-request chunk size override.
    pub chunk_size: Option<usize>,
}

/// Final record of an upload, transfer state plus the correlated
/// device-side outcome when one arrived.
#[derive(Debug, Clone, PartialEq)]
pub struct UploadReport {
    pub job_id: String,
    pub total_chunks: u64,
    pub state: UploadState,
    pub outcome: Option<ResultOutcome>,
}

/// Runs chunked transfers over the ingest topic.
#[derive(Debug, Clone)]
pub struct UploadManager<T: Transport> {
    transport: Arc<T>,
    router: TopicRouter,
    chunk_size: usize,
    publish_timeout: Duration,
}

impl<T: Transport> UploadManager<T> {
    pub fn new(
        transport: Arc<T>,
        router: TopicRouter,
        chunk_size: usize,
        publish_timeout: Duration,
    ) -> Self {
        Self {
            transport,
            router,
            chunk_size,
            publish_timeout,
        }
    }

    /// Start a transfer in the background and return its handle.
    ///
    /// The handle observes transfer state and can cancel between chunks;
    /// it does not wait for the device-side result.
    pub fn start(&self, device: &DeviceId, request: UploadRequest) -> Result<UploadHandle, CoreError> {
        let chunk_size = request.chunk_size.unwrap_or(self.chunk_size);
        if chunk_size == 0 {
            return Err(CoreError::Validation {
                message: "chunk size must be positive".into(),
            });
        }
        if request.filename.is_empty() {
            // The receiver names the file; an empty name is suspicious
            // but not fatal.
            warn!("starting upload with empty filename");
        }

        let job_id = request
            .job_id
            .clone()
            .unwrap_or_else(|| Uuid::new_v4().to_string());
        #[allow(clippy::cast_possible_truncation)]
        let total_chunks = request.data.len().div_ceil(chunk_size) as u64;
        let topic = self.router.route(TopicFamily::GcodeIngest, device);

        let cancel = CancellationToken::new();
        let (state_tx, state_rx) = watch::channel(UploadState::Init);
        let state_tx = Arc::new(state_tx);

        debug!(
            device = %device.redacted(),
            job_id = %job_id,
            total_chunks,
            size = request.data.len(),
            target = request.target.as_str(),
            "starting upload session"
        );

        let task = TransferTask {
            transport: Arc::clone(&self.transport),
            topic,
            publish_timeout: self.publish_timeout,
            job_id: job_id.clone(),
            filename: request.filename,
            data: request.data,
            target: request.target,
            chunk_size,
            total_chunks,
            cancel: cancel.clone(),
            state: Arc::clone(&state_tx),
        };
        tokio::spawn(task.run());

        Ok(UploadHandle {
            job_id,
            total_chunks,
            cancel,
            state_tx,
            state_rx,
        })
    }

    /// Ask the controller to print an already-transferred file.
    pub async fn send_print(
        &self,
        device: &DeviceId,
        filename: &str,
        target: UploadTarget,
    ) -> Result<String, CoreError> {
        let job_id = Uuid::new_v4().to_string();
        self.send_print_as(device, filename, target, &job_id).await?;
        Ok(job_id)
    }

    /// Same as [`send_print`](Self::send_print), with a caller-chosen
    /// correlation id. Used when a result wait has to be armed before the
    /// publish goes out.
    pub async fn send_print_as(
        &self,
        device: &DeviceId,
        filename: &str,
        target: UploadTarget,
        job_id: &str,
    ) -> Result<(), CoreError> {
        let topic = self.router.route(TopicFamily::GcodeIngest, device);
        let body = IngestMessage::Print {
            filename: filename.to_owned(),
            origin: target.as_str().to_owned(),
            job_id: job_id.to_owned(),
        };
        publish_ingest(&*self.transport, &topic, &body, self.publish_timeout).await?;
        debug!(device = %device.redacted(), job_id = %job_id, "print request published");
        Ok(())
    }

    /// Tell the receiver to discard partial state for a job.
    pub async fn cancel_job(&self, device: &DeviceId, job_id: &str) -> Result<(), CoreError> {
        let topic = self.router.route(TopicFamily::GcodeIngest, device);
        let body = IngestMessage::Cancel {
            job_id: job_id.to_owned(),
        };
        publish_ingest(&*self.transport, &topic, &body, self.publish_timeout).await
    }
}

/// Observer and cancel switch for one transfer in flight.
pub struct UploadHandle {
    job_id: String,
    total_chunks: u64,
    cancel: CancellationToken,
    state_tx: Arc<watch::Sender<UploadState>>,
    state_rx: watch::Receiver<UploadState>,
}

impl UploadHandle {
    pub fn job_id(&self) -> &str {
        &self.job_id
    }

    pub fn total_chunks(&self) -> u64 {
        self.total_chunks
    }

    /// Current session state.
    pub fn state(&self) -> UploadState {
        self.state_rx.borrow().clone()
    }

    /// Request cancellation. Takes effect at the next chunk boundary;
    /// already-queued publishes are not recalled.
    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    /// Wait until the session reaches a state matching `pred`.
    pub async fn wait_for(
        &mut self,
        pred: impl FnMut(&UploadState) -> bool,
    ) -> Result<UploadState, CoreError> {
        let state = self
            .state_rx
            .wait_for(pred)
            .await
            .map_err(|_| CoreError::Closed)?;
        Ok(state.clone())
    }

    /// Wait until the transfer itself is done: `Ended` or terminal.
    pub async fn transfer_finished(&mut self) -> Result<UploadState, CoreError> {
        self.wait_for(|s| matches!(s, UploadState::Ended) || s.is_terminal())
            .await
    }

    /// Settle the device-side verdict. Only an `Ended` session can move
    /// to `Committed`/`Failed`/`TimedOut`; terminal states never change.
    pub(crate) fn settle(&self, verdict: UploadState) {
        self.state_tx.send_if_modified(|state| {
            if *state == UploadState::Ended {
                *state = verdict;
                true
            } else {
                false
            }
        });
    }
}

// ── Transfer task ────────────────────────────────────────────────────

struct TransferTask<T: Transport> {
    transport: Arc<T>,
    topic: String,
    publish_timeout: Duration,
    job_id: String,
    filename: String,
    data: Bytes,
    target: UploadTarget,
    chunk_size: usize,
    total_chunks: u64,
    cancel: CancellationToken,
    state: Arc<watch::Sender<UploadState>>,
}

impl<T: Transport> TransferTask<T> {
    async fn run(self) {
        match self.transfer().await {
            Ok(finished) => {
                let _ = self.state.send(finished);
            }
            Err(e) => {
                warn!(job_id = %self.job_id, error = %e, "upload transfer failed");
                let _ = self.state.send(UploadState::Failed {
                    reason: e.to_string(),
                });
            }
        }
    }

    async fn transfer(&self) -> Result<UploadState, CoreError> {
        self.publish(&IngestMessage::Start {
            job_id: self.job_id.clone(),
            filename: self.filename.clone(),
            total_chunks: self.total_chunks,
            upload_target: Some(self.target.as_str().to_owned()),
        })
        .await?;
        let _ = self.state.send(UploadState::Started);

        for (seq, chunk) in self.data.chunks(self.chunk_size).enumerate() {
            #[allow(clippy::cast_possible_truncation)]
            let seq = seq as u64;
            if self.cancel.is_cancelled() {
                return self.abort().await;
            }
            let _ = self.state.send(UploadState::Sending { next_seq: seq });
            self.publish(&IngestMessage::Chunk {
                job_id: self.job_id.clone(),
                seq,
                data_b64: BASE64.encode(chunk),
            })
            .await?;
        }

        if self.cancel.is_cancelled() {
            return self.abort().await;
        }

        self.publish(&IngestMessage::End {
            job_id: self.job_id.clone(),
            target: self.target.as_str().to_owned(),
        })
        .await?;
        debug!(job_id = %self.job_id, chunks = self.total_chunks, "upload transfer complete");
        Ok(UploadState::Ended)
    }

    async fn abort(&self) -> Result<UploadState, CoreError> {
        debug!(job_id = %self.job_id, "upload cancelled, notifying receiver");
        // Best effort: the receiver times partial jobs out on its own if
        // this publish is lost.
        if let Err(e) = self
            .publish(&IngestMessage::Cancel {
                job_id: self.job_id.clone(),
            })
            .await
        {
            warn!(job_id = %self.job_id, error = %e, "cancel notification failed");
        }
        Ok(UploadState::Cancelled)
    }

    async fn publish(&self, body: &IngestMessage) -> Result<(), CoreError> {
        publish_ingest(&*self.transport, &self.topic, body, self.publish_timeout).await
    }
}

async fn publish_ingest<T: Transport>(
    transport: &T,
    topic: &str,
    body: &IngestMessage,
    publish_timeout: Duration,
) -> Result<(), CoreError> {
    let payload = message::encode(body)?;
    let publish = transport.publish(topic, payload, QoS::AtLeastOnce, false);
    match tokio::time::timeout(publish_timeout, publish).await {
        Ok(result) => result.map_err(CoreError::from),
        Err(_) => Err(CoreError::Timeout {
            what: "ingest publish acknowledgment".into(),
            timeout: publish_timeout,
        }),
    }
}

// ── Tests ────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use printrelay_proto::loopback::LoopbackTransport;
    use serde_json::Value;

    const INGEST_TOPIC: &str = "gcode/8e33a6f2-0c5b-4a1d-9b77-51f10c0d5d6e";

    fn device() -> DeviceId {
        DeviceId::parse("8e33a6f2-0c5b-4a1d-9b77-51f10c0d5d6e").unwrap()
    }

    fn manager(transport: &LoopbackTransport, chunk_size: usize) -> UploadManager<LoopbackTransport> {
        UploadManager::new(
            Arc::new(transport.clone()),
            TopicRouter::default(),
            chunk_size,
            Duration::from_secs(5),
        )
    }

    fn request(data: &[u8]) -> UploadRequest {
        UploadRequest {
            job_id: Some("job-1".into()),
            filename: "part.gcode".into(),
            data: Bytes::copy_from_slice(data),
            target: UploadTarget::Sd,
            chunk_size: None,
        }
    }

    fn actions(transport: &LoopbackTransport) -> Vec<(String, Value)> {
        transport
            .published()
            .into_iter()
            .map(|p| {
                let body: Value = serde_json::from_slice(&p.payload).unwrap();
                (body["action"].as_str().unwrap().to_owned(), body)
            })
            .collect()
    }

    #[tokio::test]
    async fn chunks_split_and_reassemble() {
        let (transport, _inbound) = LoopbackTransport::new();
        let manager = manager(&transport, 256);
        let data: Vec<u8> = (0..700).map(|i| (i % 251) as u8).collect();

        let mut handle = manager.start(&device(), request(&data)).unwrap();
        assert_eq!(handle.total_chunks(), 3);
        assert_eq!(handle.transfer_finished().await.unwrap(), UploadState::Ended);

        let published = actions(&transport);
        let sequence: Vec<&str> = published.iter().map(|(a, _)| a.as_str()).collect();
        assert_eq!(sequence, ["start", "chunk", "chunk", "chunk", "end"]);
        assert!(transport
            .published()
            .iter()
            .all(|p| p.topic == INGEST_TOPIC));

        assert_eq!(published[0].1["total_chunks"], 3);
        assert_eq!(published[0].1["filename"], "part.gcode");
        assert_eq!(published[4].1["target"], "sd");

        let mut reassembled = Vec::new();
        for (i, (_, body)) in published[1..4].iter().enumerate() {
            assert_eq!(body["seq"], i as u64);
            assert_eq!(body["job_id"], "job-1");
            reassembled.extend(BASE64.decode(body["data_b64"].as_str().unwrap()).unwrap());
        }
        assert_eq!(reassembled, data);
    }

    #[tokio::test]
    async fn zero_byte_file_sends_start_then_end() {
        let (transport, _inbound) = LoopbackTransport::new();
        let manager = manager(&transport, 256);

        let mut handle = manager.start(&device(), request(b"")).unwrap();
        assert_eq!(handle.total_chunks(), 0);
        assert_eq!(handle.transfer_finished().await.unwrap(), UploadState::Ended);

        let sequence: Vec<String> = actions(&transport).into_iter().map(|(a, _)| a).collect();
        assert_eq!(sequence, ["start", "end"]);
    }

    #[tokio::test(start_paused = true)]
    async fn cancel_between_chunks_publishes_cancel() {
        let (transport, _inbound) = LoopbackTransport::new();
        transport.set_publish_delay(Duration::from_millis(100));
        let manager = manager(&transport, 4);

        let mut handle = manager
            .start(&device(), request(b"G28\nG1 X10\nG1 Y10\n"))
            .unwrap();
        // Cancelled before the task reaches its first chunk boundary.
        handle.cancel();

        assert_eq!(
            handle.transfer_finished().await.unwrap(),
            UploadState::Cancelled
        );

        let sequence: Vec<String> = actions(&transport).into_iter().map(|(a, _)| a).collect();
        assert_eq!(sequence, ["start", "cancel"]);
    }

    #[tokio::test]
    async fn publish_failure_fails_the_session() {
        let (transport, _inbound) = LoopbackTransport::new();
        // start and chunk 0 succeed, chunk 1 fails.
        transport.fail_publishes_after(2);
        let manager = manager(&transport, 4);

        let mut handle = manager.start(&device(), request(b"twelve bytes")).unwrap();
        let state = handle.transfer_finished().await.unwrap();
        assert!(matches!(state, UploadState::Failed { .. }));

        let sequence: Vec<String> = actions(&transport).into_iter().map(|(a, _)| a).collect();
        assert_eq!(sequence, ["start", "chunk"]);
    }

    #[tokio::test(start_paused = true)]
    async fn slow_broker_times_out_the_session() {
        let (transport, _inbound) = LoopbackTransport::new();
        transport.set_publish_delay(Duration::from_secs(60));
        let manager = manager(&transport, 256);

        let mut handle = manager.start(&device(), request(b"G28\n")).unwrap();
        let state = handle.transfer_finished().await.unwrap();
        let UploadState::Failed { reason } = state else {
            panic!("expected failure, got {state:?}");
        };
        assert!(reason.contains("Timed out"));
    }

    #[tokio::test]
    async fn generated_job_ids_are_unique() {
        let (transport, _inbound) = LoopbackTransport::new();
        let manager = manager(&transport, 256);

        let mut first = request(b"G28\n");
        first.job_id = None;
        let mut second = request(b"G28\n");
        second.job_id = None;

        let a = manager.start(&device(), first).unwrap();
        let b = manager.start(&device(), second).unwrap();
        assert_ne!(a.job_id(), b.job_id());
    }

    #[tokio::test]
    async fn settle_only_moves_ended_sessions() {
        let (transport, _inbound) = LoopbackTransport::new();
        let manager = manager(&transport, 256);

        let mut handle = manager.start(&device(), request(b"G28\n")).unwrap();
        handle.transfer_finished().await.unwrap();

        handle.settle(UploadState::Committed);
        assert_eq!(handle.state(), UploadState::Committed);

        // A second verdict does not overwrite a terminal state.
        handle.settle(UploadState::TimedOut);
        assert_eq!(handle.state(), UploadState::Committed);
    }

    #[tokio::test]
    async fn send_print_publishes_print_request() {
        let (transport, _inbound) = LoopbackTransport::new();
        let manager = manager(&transport, 256);

        let job_id = manager
            .send_print(&device(), "part.gcode", UploadTarget::Sd)
            .await
            .unwrap();

        let published = actions(&transport);
        assert_eq!(published.len(), 1);
        assert_eq!(published[0].1["action"], "print");
        assert_eq!(published[0].1["filename"], "part.gcode");
        assert_eq!(published[0].1["origin"], "sd");
        assert_eq!(published[0].1["job_id"], Value::from(job_id));
    }

    #[test]
    fn zero_chunk_size_is_rejected() {
        let (transport, _inbound) = LoopbackTransport::new();
        let manager = manager(&transport, 256);
        let mut req = request(b"G28\n");
        req.chunk_size = Some(0);

        // Runtime needed only for the spawn path, not the validation.
        let runtime = tokio::runtime::Builder::new_current_thread()
            .build()
            .unwrap();
        let _guard = runtime.enter();
        assert!(matches!(
            manager.start(&device(), req),
            Err(CoreError::Validation { .. })
        ));
    }
}
