// ── Relay client ──
//
// Composition root: one transport connection, one listener registry, and
// the publisher/uploader/correlator built over them. Cheap to clone; all
// clones share the connection. High-level operations here combine a
// publish with its correlated wait so callers get request/response
// semantics over a broker that has none.

use std::sync::Arc;

use tokio::sync::mpsc;
use tracing::debug;
use uuid::Uuid;

use printrelay_proto::{
    DeviceId, InboundMessage, MqttConfig, MqttTransport, QoS, TopicFamily, TopicRouter, Transport,
};

use crate::command::{CommandPublisher, ControlCommand};
use crate::config::ClientConfig;
use crate::correlate::{ResultChannel, ResultCorrelator, WaitSpec};
use crate::decode;
use crate::error::CoreError;
use crate::model::{CameraState, PrinterStatus, ProgressEvent, ResultOutcome};
use crate::registry::{ListenerRegistry, Subscription};
use crate::upload::{UploadHandle, UploadManager, UploadReport, UploadRequest, UploadState, UploadTarget};

struct Inner<T: Transport> {
    transport: Arc<T>,
    registry: ListenerRegistry,
    router: TopicRouter,
    publisher: CommandPublisher<T>,
    uploads: UploadManager<T>,
    correlator: ResultCorrelator,
    config: ClientConfig,
}

/// Client for printer controllers behind an MQTT relay.
pub struct RelayClient<T: Transport> {
    inner: Arc<Inner<T>>,
}

impl<T: Transport> Clone for RelayClient<T> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<T: Transport> RelayClient<T> {
    /// Build a client over an already-connected transport.
    pub fn new(transport: T, inbound: mpsc::Receiver<InboundMessage>, config: ClientConfig) -> Self {
        let transport = Arc::new(transport);
        let router = TopicRouter::new(config.namespace.clone());
        let registry =
            ListenerRegistry::new(Arc::clone(&transport), inbound, config.subscriber_capacity);
        let publisher = CommandPublisher::new(Arc::clone(&transport), router.clone());
        let uploads = UploadManager::new(
            Arc::clone(&transport),
            router.clone(),
            config.chunk_size,
            config.publish_timeout,
        );
        let correlator = ResultCorrelator::new(registry.clone(), router.clone());

        Self {
            inner: Arc::new(Inner {
                transport,
                registry,
                router,
                publisher,
                uploads,
                correlator,
                config,
            }),
        }
    }

    /// Stop the dispatch task. Outstanding streams and waits see their
    /// channels close.
    pub fn shutdown(&self) {
        self.inner.registry.shutdown();
    }

    // ── Control commands ─────────────────────────────────────────────

    /// Publish a control command, fire-and-forget.
    pub async fn send(&self, device: &DeviceId, command: &ControlCommand) -> Result<(), CoreError> {
        self.inner.publisher.send(device, command).await
    }

    /// Publish a control command and wait for the controller's verdict
    /// on the control result topic.
    pub async fn send_and_confirm(
        &self,
        device: &DeviceId,
        command: &ControlCommand,
    ) -> Result<ResultOutcome, CoreError> {
        let wait = self
            .inner
            .correlator
            .begin(device, ResultChannel::Control, WaitSpec {
                job_id: None,
                timeout: self.inner.config.result_timeout,
                progress: None,
            })
            .await?;
        self.inner.publisher.send(device, command).await?;
        wait.await_outcome().await
    }

    // ── Camera ───────────────────────────────────────────────────────

    pub async fn camera_start(
        &self,
        device: &DeviceId,
        options: serde_json::Value,
    ) -> Result<(), CoreError> {
        self.inner.publisher.camera_start(device, options).await
    }

    pub async fn camera_stop(&self, device: &DeviceId) -> Result<(), CoreError> {
        self.inner.publisher.camera_stop(device).await
    }

    /// Stream of normalized camera states for one device. Dropping the
    /// stream releases the subscription.
    pub async fn camera_states(
        &self,
        device: &DeviceId,
    ) -> Result<StateStream<CameraState>, CoreError> {
        let topic = self.inner.router.route(TopicFamily::CameraState, device);
        let subscription = self.inner.registry.subscribe(topic, QoS::AtLeastOnce).await?;
        Ok(StateStream {
            subscription,
            decode: |payload| Some(decode::decode_camera_state(payload)),
        })
    }

    // ── Dashboard ────────────────────────────────────────────────────

    /// Ask the device for a fresh dashboard report. Reports arrive on
    /// the stream from [`printer_statuses`](Self::printer_statuses).
    pub async fn request_dashboard(&self, device: &DeviceId) -> Result<(), CoreError> {
        self.inner.publisher.request_dashboard(device).await
    }

    /// Stream of normalized printer statuses for one device.
    ///
    /// Queries and reports share the dashboard topic; the client's own
    /// query publishes echo back on it and are filtered out before
    /// decoding, so only genuine device reports surface here.
    pub async fn printer_statuses(
        &self,
        device: &DeviceId,
    ) -> Result<StateStream<PrinterStatus>, CoreError> {
        let topic = self.inner.router.route(TopicFamily::DashboardQuery, device);
        let subscription = self.inner.registry.subscribe(topic, QoS::AtLeastOnce).await?;
        Ok(StateStream {
            subscription,
            decode: decode::decode_dashboard_report,
        })
    }

    // ── Uploads ──────────────────────────────────────────────────────

    /// Run an upload end to end: chunked transfer plus the correlated
    /// device-side result, reported as one record.
    ///
    /// The result wait is armed before the first `start` publish, so a
    /// fast device cannot answer into the void. `progress` receives
    /// non-terminal reports when given; it never affects the outcome.
    pub async fn upload(
        &self,
        device: &DeviceId,
        mut request: UploadRequest,
        progress: Option<mpsc::Sender<ProgressEvent>>,
    ) -> Result<UploadReport, CoreError> {
        let job_id = request
            .job_id
            .get_or_insert_with(|| Uuid::new_v4().to_string())
            .clone();

        let wait = self
            .inner
            .correlator
            .begin(device, ResultChannel::Gcode, WaitSpec {
                job_id: Some(job_id.clone()),
                timeout: self.inner.config.result_timeout,
                progress,
            })
            .await?;

        let mut handle = self.inner.uploads.start(device, request)?;
        let total_chunks = handle.total_chunks();

        match handle.transfer_finished().await? {
            UploadState::Ended => {
                let outcome = wait.await_outcome().await?;
                handle.settle(verdict_for(&outcome));
                debug!(
                    device = %device.redacted(),
                    job_id = %job_id,
                    success = outcome.is_success(),
                    "upload resolved"
                );
                Ok(UploadReport {
                    job_id,
                    total_chunks,
                    state: handle.state(),
                    outcome: Some(outcome),
                })
            }
            // Transfer never completed; no device-side result to wait
            // for. Dropping the wait releases its subscription.
            state => Ok(UploadReport {
                job_id,
                total_chunks,
                state,
                outcome: None,
            }),
        }
    }

    /// Start a transfer without waiting for the device-side result.
    /// The handle cancels between chunks and observes transfer state.
    pub fn start_upload(
        &self,
        device: &DeviceId,
        request: UploadRequest,
    ) -> Result<UploadHandle, CoreError> {
        self.inner.uploads.start(device, request)
    }

    /// Tell the receiver to discard partial state for a job.
    pub async fn cancel_upload(&self, device: &DeviceId, job_id: &str) -> Result<(), CoreError> {
        self.inner.uploads.cancel_job(device, job_id).await
    }

    /// Ask the controller to print an already-transferred file and wait
    /// for its verdict.
    pub async fn print_file(
        &self,
        device: &DeviceId,
        filename: &str,
        target: UploadTarget,
    ) -> Result<ResultOutcome, CoreError> {
        let job_id = Uuid::new_v4().to_string();
        let wait = self
            .inner
            .correlator
            .begin(device, ResultChannel::Gcode, WaitSpec {
                job_id: Some(job_id.clone()),
                timeout: self.inner.config.result_timeout,
                progress: None,
            })
            .await?;
        self.inner
            .uploads
            .send_print_as(device, filename, target, &job_id)
            .await?;
        wait.await_outcome().await
    }

    // ── Raw waits ────────────────────────────────────────────────────

    /// Wait on a result topic directly. Building block for flows the
    /// combined operations above do not cover.
    pub async fn wait_for_result(
        &self,
        device: &DeviceId,
        channel: ResultChannel,
        spec: WaitSpec,
    ) -> Result<ResultOutcome, CoreError> {
        self.inner.correlator.wait(device, channel, spec).await
    }
}

impl RelayClient<MqttTransport> {
    /// Connect to a broker and build the client in one step.
    pub fn connect(mqtt: MqttConfig, config: ClientConfig) -> Self {
        let (transport, inbound) = MqttTransport::connect(mqtt);
        Self::new(transport, inbound, config)
    }

    /// Stop the broker driver and the dispatch task.
    pub fn disconnect(&self) {
        self.inner.transport.shutdown();
        self.inner.registry.shutdown();
    }
}

fn verdict_for(outcome: &ResultOutcome) -> UploadState {
    match outcome {
        ResultOutcome::Accepted { .. } | ResultOutcome::Completed { .. } => UploadState::Committed,
        ResultOutcome::Rejected { message } => UploadState::Failed {
            reason: message.clone().unwrap_or_else(|| "rejected by device".into()),
        },
        ResultOutcome::Failed { error } => UploadState::Failed {
            reason: error.clone().unwrap_or_else(|| "device reported failure".into()),
        },
        ResultOutcome::TimedOut => UploadState::TimedOut,
    }
}

/// Decoded per-device state stream over one registry subscription.
///
/// The decoder may drop a payload (`None`) — e.g. the client's own query
/// echoed back on a shared topic — in which case the stream silently
/// moves on to the next message.
pub struct StateStream<S> {
    subscription: Subscription,
    decode: fn(&[u8]) -> Option<S>,
}

impl<S> StateStream<S> {
    pub fn topic(&self) -> &str {
        self.subscription.topic()
    }

    /// Next decoded state. `None` once the client shuts down.
    pub async fn next(&mut self) -> Option<S> {
        loop {
            let message = self.subscription.recv().await?;
            if let Some(state) = (self.decode)(&message.payload) {
                return Some(state);
            }
        }
    }
}

impl<S> tokio_stream::Stream for StateStream<S> {
    type Item = S;

    fn poll_next(
        mut self: std::pin::Pin<&mut Self>,
        cx: &mut std::task::Context<'_>,
    ) -> std::task::Poll<Option<S>> {
        let decode = self.decode;
        loop {
            match self.subscription.poll_recv(cx) {
                std::task::Poll::Ready(Some(message)) => {
                    if let Some(state) = decode(&message.payload) {
                        return std::task::Poll::Ready(Some(state));
                    }
                }
                std::task::Poll::Ready(None) => return std::task::Poll::Ready(None),
                std::task::Poll::Pending => return std::task::Poll::Pending,
            }
        }
    }
}

// ── Tests ────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::Bytes;
    use printrelay_proto::loopback::LoopbackTransport;
    use serde_json::json;

    fn device() -> DeviceId {
        DeviceId::parse("8e33a6f2-0c5b-4a1d-9b77-51f10c0d5d6e").unwrap()
    }

    fn client(transport: LoopbackTransport, inbound: mpsc::Receiver<InboundMessage>) -> RelayClient<LoopbackTransport> {
        RelayClient::new(transport, inbound, ClientConfig {
            chunk_size: 64,
            ..ClientConfig::default()
        })
    }

    /// Scripted peer: watches the tap for an ingest `end` and answers
    /// with an upload result.
    fn fake_device(transport: &LoopbackTransport, job_id: &str, success: bool) {
        let mut tap = transport.tap();
        let transport = transport.clone();
        let job_id = job_id.to_owned();
        tokio::spawn(async move {
            while let Ok(message) = tap.recv().await {
                let body: serde_json::Value = match serde_json::from_slice(&message.payload) {
                    Ok(body) => body,
                    Err(_) => continue,
                };
                if body["action"] == "end" {
                    let result = json!({
                        "type": "upload_result",
                        "job_id": job_id,
                        "success": success,
                        "filename": "part.gcode",
                        "target": "sd",
                        "file_size": 18,
                    });
                    transport
                        .inject(
                            "gcode/8e33a6f2-0c5b-4a1d-9b77-51f10c0d5d6e/result",
                            result.to_string().into_bytes(),
                        )
                        .await;
                    break;
                }
            }
        });
    }

    #[tokio::test]
    async fn upload_commits_on_device_success() {
        let (transport, inbound) = LoopbackTransport::new();
        let client = client(transport.clone(), inbound);
        fake_device(&transport, "job-ok", true);

        let report = client
            .upload(
                &device(),
                UploadRequest {
                    job_id: Some("job-ok".into()),
                    filename: "part.gcode".into(),
                    data: Bytes::from_static(b"G28\nG1 X10 F3000\n"),
                    target: UploadTarget::Sd,
                    chunk_size: None,
                },
                None,
            )
            .await
            .unwrap();

        assert_eq!(report.state, UploadState::Committed);
        assert!(matches!(report.outcome, Some(ResultOutcome::Completed { .. })));
        assert_eq!(report.job_id, "job-ok");
    }

    #[tokio::test]
    async fn upload_failure_reports_device_error() {
        let (transport, inbound) = LoopbackTransport::new();
        let client = client(transport.clone(), inbound);
        fake_device(&transport, "job-bad", false);

        let report = client
            .upload(
                &device(),
                UploadRequest {
                    job_id: Some("job-bad".into()),
                    filename: "part.gcode".into(),
                    data: Bytes::from_static(b"G28\n"),
                    target: UploadTarget::Sd,
                    chunk_size: None,
                },
                None,
            )
            .await
            .unwrap();

        assert!(matches!(report.state, UploadState::Failed { .. }));
        assert!(matches!(report.outcome, Some(ResultOutcome::Failed { .. })));
    }

    #[tokio::test]
    async fn send_and_confirm_resolves_on_control_result() {
        let (transport, inbound) = LoopbackTransport::new();
        let client = client(transport.clone(), inbound);

        let mut tap = transport.tap();
        let responder = transport.clone();
        tokio::spawn(async move {
            // First tapped publish is the command itself.
            let _ = tap.recv().await;
            responder
                .inject(
                    "control/8e33a6f2-0c5b-4a1d-9b77-51f10c0d5d6e/result",
                    json!({"type": "control_result", "action": "pause", "ok": true})
                        .to_string()
                        .into_bytes(),
                )
                .await;
        });

        let outcome = client
            .send_and_confirm(&device(), &ControlCommand::Pause)
            .await
            .unwrap();
        assert!(outcome.is_success());
    }

    #[tokio::test]
    async fn dashboard_query_echo_does_not_surface_as_status() {
        let (transport, inbound) = LoopbackTransport::new();
        let client = client(transport.clone(), inbound);
        let topic = "dashboard/8e33a6f2-0c5b-4a1d-9b77-51f10c0d5d6e";

        let mut statuses = client.printer_statuses(&device()).await.unwrap();
        // The query publish echoes back on the subscribed topic.
        client.request_dashboard(&device()).await.unwrap();

        // No phantom offline snapshot from the echo.
        let nothing =
            tokio::time::timeout(std::time::Duration::from_millis(20), statuses.next()).await;
        assert!(nothing.is_err());

        transport
            .inject(
                topic,
                json!({"state": "Printing", "flags": {"printing": true}})
                    .to_string()
                    .into_bytes(),
            )
            .await;
        let status = statuses.next().await.unwrap();
        assert!(status.connected);
        assert_eq!(status.state, "printing");
    }

    #[tokio::test]
    async fn camera_stream_decodes_and_unsubscribes_on_drop() {
        let (transport, inbound) = LoopbackTransport::new();
        let client = client(transport.clone(), inbound);
        let topic = "camera/8e33a6f2-0c5b-4a1d-9b77-51f10c0d5d6e/state";

        let mut stream = client.camera_states(&device()).await.unwrap();
        assert_eq!(stream.topic(), topic);

        transport
            .inject(
                topic,
                json!({"running": true, "url": "https://cam/webrtc"})
                    .to_string()
                    .into_bytes(),
            )
            .await;

        let state = stream.next().await.unwrap();
        assert!(state.running);
        assert_eq!(state.webrtc_url.as_deref(), Some("https://cam/webrtc"));

        drop(stream);
        for _ in 0..32 {
            tokio::task::yield_now().await;
        }
        assert!(!transport.is_subscribed(topic));
    }
}
