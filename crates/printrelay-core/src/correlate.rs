// ── Result correlation ──
//
// The relay gives us no request/response: results for a logical operation
// arrive later, on a different topic, tagged (usually) with the job id we
// chose. This module turns that into an await: subscribe, filter, resolve
// on the first matching terminal envelope, or resolve to TimedOut at the
// deadline. The subscription is released on every exit path -- it rides
// the `Subscription` drop, not control flow.

use std::collections::HashSet;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use chrono::{DateTime, Utc};
use tokio::sync::mpsc;
use tracing::debug;

use printrelay_proto::message::{ResultMessage, UploadProgress};
use printrelay_proto::{DeviceId, QoS, TopicFamily, TopicRouter};

use crate::error::CoreError;
use crate::model::{ProgressEvent, ResultOutcome};
use crate::registry::{ListenerRegistry, Subscription};

/// Which result topic a wait listens on.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResultChannel {
    /// `gcode/{device}/result` — upload progress and terminal results.
    Gcode,
    /// `control/{device}/result` — results of control commands.
    Control,
}

impl ResultChannel {
    fn family(self) -> TopicFamily {
        match self {
            Self::Gcode => TopicFamily::GcodeResult,
            Self::Control => TopicFamily::ControlResult,
        }
    }
}

/// Parameters of one wait.
#[derive(Debug)]
pub struct WaitSpec {
    /// Filter terminal envelopes by this correlation id. `None` matches
    /// by message shape instead (single-operation firmware).
    pub job_id: Option<String>,
    /// Hard deadline. Every wait has one; there is no automatic retry.
    pub timeout: Duration,
    /// Observer for non-terminal progress envelopes. Progress never
    /// resolves the wait.
    pub progress: Option<mpsc::Sender<ProgressEvent>>,
}

/// Bridges result topics to await-style calls.
#[derive(Clone)]
pub struct ResultCorrelator {
    registry: ListenerRegistry,
    router: TopicRouter,
    /// Keys of waits currently registered: one wait per (topic, job id).
    /// Replaying a `start` must not create a second registration.
    active: Arc<Mutex<HashSet<String>>>,
}

impl ResultCorrelator {
    pub fn new(registry: ListenerRegistry, router: TopicRouter) -> Self {
        Self {
            registry,
            router,
            active: Arc::new(Mutex::new(HashSet::new())),
        }
    }

    /// Subscribe now, resolve later.
    ///
    /// Splitting registration from resolution lets a caller arm the wait
    /// before publishing the operation that will eventually answer it,
    /// closing the race where a fast device replies before we listen.
    pub async fn begin(
        &self,
        device: &DeviceId,
        channel: ResultChannel,
        spec: WaitSpec,
    ) -> Result<PendingWait, CoreError> {
        let topic = self.router.route(channel.family(), device);
        let key = match &spec.job_id {
            Some(job_id) => format!("{topic}#{job_id}"),
            None => format!("{topic}#*"),
        };

        {
            let mut active = self.active.lock().unwrap_or_else(PoisonError::into_inner);
            if !active.insert(key.clone()) {
                return Err(CoreError::SessionState {
                    message: format!("a result wait is already registered for {key}"),
                });
            }
        }
        let guard = KeyGuard {
            active: Arc::clone(&self.active),
            key,
        };

        let subscription = self.registry.subscribe(topic, QoS::AtLeastOnce).await?;
        debug!(
            device = %device.redacted(),
            channel = ?channel,
            has_job_id = spec.job_id.is_some(),
            "result wait armed"
        );

        Ok(PendingWait {
            subscription,
            job_id: spec.job_id,
            timeout: spec.timeout,
            progress: spec.progress,
            _guard: guard,
        })
    }

    /// Arm and resolve in one call.
    pub async fn wait(
        &self,
        device: &DeviceId,
        channel: ResultChannel,
        spec: WaitSpec,
    ) -> Result<ResultOutcome, CoreError> {
        self.begin(device, channel, spec).await?.await_outcome().await
    }
}

/// Removes the wait key when the wait ends, on any path.
struct KeyGuard {
    active: Arc<Mutex<HashSet<String>>>,
    key: String,
}

impl Drop for KeyGuard {
    fn drop(&mut self) {
        self.active
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(&self.key);
    }
}

/// An armed wait. Dropping it without resolving releases the
/// subscription and the wait key.
pub struct PendingWait {
    subscription: Subscription,
    job_id: Option<String>,
    timeout: Duration,
    progress: Option<mpsc::Sender<ProgressEvent>>,
    _guard: KeyGuard,
}

impl PendingWait {
    /// Resolve on the first matching terminal envelope, or `TimedOut`.
    pub async fn await_outcome(mut self) -> Result<ResultOutcome, CoreError> {
        let deadline = tokio::time::Instant::now() + self.timeout;

        loop {
            let message = match tokio::time::timeout_at(deadline, self.subscription.recv()).await {
                Err(_) => {
                    debug!(topic = %self.subscription.topic(), "result wait timed out");
                    return Ok(ResultOutcome::TimedOut);
                }
                Ok(None) => return Err(CoreError::Closed),
                Ok(Some(message)) => message,
            };

            let parsed = match ResultMessage::parse(&message.payload) {
                Ok(parsed) => parsed,
                Err(e) => {
                    // Never let one bad payload kill the wait.
                    debug!(error = %e, topic = %message.topic, "dropping malformed result payload");
                    continue;
                }
            };

            match parsed {
                ResultMessage::Progress {
                    progress,
                    timestamp,
                } => {
                    self.route_progress(progress, timestamp);
                }
                ResultMessage::ControlResult { ok, message, .. } => {
                    // Control results carry no correlation id (legacy
                    // firmware reports SD uploads this way), so they
                    // terminate any wait on this topic.
                    return Ok(if ok {
                        ResultOutcome::Accepted { message }
                    } else {
                        ResultOutcome::Rejected { message }
                    });
                }
                ResultMessage::UploadResult {
                    job_id,
                    success,
                    filename,
                    target,
                    file_size,
                    error,
                } => {
                    if let Some(expected) = &self.job_id {
                        if *expected != job_id {
                            continue;
                        }
                    }
                    return Ok(if success {
                        ResultOutcome::Completed {
                            filename,
                            target,
                            file_size,
                        }
                    } else {
                        ResultOutcome::Failed { error }
                    });
                }
                ResultMessage::Unknown => {
                    debug!(topic = %message.topic, "dropping unrecognized result variant");
                }
            }
        }
    }

    fn route_progress(&self, progress: UploadProgress, timestamp: Option<f64>) {
        // A report tagged for a different upload is not ours to forward.
        if let (Some(expected), Some(reported)) = (&self.job_id, &progress.upload_id) {
            if expected != reported {
                return;
            }
        }
        let Some(observer) = &self.progress else {
            return;
        };
        let event = ProgressEvent {
            job_id: progress.upload_id,
            stage: progress.stage,
            name: progress.name,
            received_bytes: progress.received_bytes,
            total_bytes: progress.total_bytes,
            percent: progress.percent,
            timestamp: wire_timestamp(timestamp),
        };
        // Observers are best-effort; a full or closed channel drops the
        // event, it never blocks the wait.
        let _ = observer.try_send(event);
    }
}

fn wire_timestamp(epoch_secs: Option<f64>) -> DateTime<Utc> {
    epoch_secs
        .and_then(|secs| {
            #[allow(clippy::cast_possible_truncation)]
            let millis = (secs * 1000.0) as i64;
            DateTime::from_timestamp_millis(millis)
        })
        .unwrap_or_else(Utc::now)
}

// ── Tests ────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use printrelay_proto::loopback::LoopbackTransport;
    use serde_json::json;

    const RESULT_TOPIC: &str = "gcode/8e33a6f2-0c5b-4a1d-9b77-51f10c0d5d6e/result";

    fn device() -> DeviceId {
        DeviceId::parse("8e33a6f2-0c5b-4a1d-9b77-51f10c0d5d6e").unwrap()
    }

    fn correlator(transport: &LoopbackTransport, inbound: mpsc::Receiver<printrelay_proto::InboundMessage>) -> ResultCorrelator {
        let registry = ListenerRegistry::new(Arc::new(transport.clone()), inbound, 16);
        ResultCorrelator::new(registry, TopicRouter::default())
    }

    fn upload_result(job_id: &str, success: bool) -> Vec<u8> {
        json!({"type": "upload_result", "job_id": job_id, "success": success})
            .to_string()
            .into_bytes()
    }

    async fn settle() {
        for _ in 0..32 {
            tokio::task::yield_now().await;
        }
    }

    #[tokio::test]
    async fn resolves_only_matching_job_id() {
        let (transport, inbound) = LoopbackTransport::new();
        let correlator = correlator(&transport, inbound);
        let device = device();

        let wait_a = correlator
            .begin(&device, ResultChannel::Gcode, WaitSpec {
                job_id: Some("job-a".into()),
                timeout: Duration::from_secs(5),
                progress: None,
            })
            .await
            .unwrap();
        let wait_b = correlator
            .begin(&device, ResultChannel::Gcode, WaitSpec {
                job_id: Some("job-b".into()),
                timeout: Duration::from_secs(5),
                progress: None,
            })
            .await
            .unwrap();

        transport.inject(RESULT_TOPIC, upload_result("job-b", false)).await;
        transport.inject(RESULT_TOPIC, upload_result("job-a", true)).await;

        let outcome_a = wait_a.await_outcome().await.unwrap();
        let outcome_b = wait_b.await_outcome().await.unwrap();

        assert!(matches!(outcome_a, ResultOutcome::Completed { .. }));
        assert!(matches!(outcome_b, ResultOutcome::Failed { .. }));
    }

    #[tokio::test(start_paused = true)]
    async fn timeout_resolves_and_releases_subscription() {
        let (transport, inbound) = LoopbackTransport::new();
        let correlator = correlator(&transport, inbound);

        let started = tokio::time::Instant::now();
        let outcome = correlator
            .wait(&device(), ResultChannel::Gcode, WaitSpec {
                job_id: Some("job-x".into()),
                timeout: Duration::from_secs(7),
                progress: None,
            })
            .await
            .unwrap();

        assert_eq!(outcome, ResultOutcome::TimedOut);
        assert!(started.elapsed() >= Duration::from_secs(7));

        settle().await;
        assert_eq!(transport.unsubscribe_count(RESULT_TOPIC), 1);
        assert!(!transport.is_subscribed(RESULT_TOPIC));
    }

    #[tokio::test]
    async fn progress_is_routed_and_does_not_resolve() {
        let (transport, inbound) = LoopbackTransport::new();
        let correlator = correlator(&transport, inbound);
        let (progress_tx, mut progress_rx) = mpsc::channel(8);

        let wait = correlator
            .begin(&device(), ResultChannel::Gcode, WaitSpec {
                job_id: Some("job-p".into()),
                timeout: Duration::from_secs(5),
                progress: Some(progress_tx),
            })
            .await
            .unwrap();

        transport
            .inject(
                RESULT_TOPIC,
                json!({
                    "action": "sd_upload_progress",
                    "message": {"upload_id": "job-p", "received_bytes": 10, "total_bytes": 40, "percent": 25.0}
                })
                .to_string()
                .into_bytes(),
            )
            .await;
        transport.inject(RESULT_TOPIC, upload_result("job-p", true)).await;

        let outcome = wait.await_outcome().await.unwrap();
        assert!(matches!(outcome, ResultOutcome::Completed { .. }));

        let event = progress_rx.recv().await.unwrap();
        assert_eq!(event.percent, 25.0);
        assert_eq!(event.job_id.as_deref(), Some("job-p"));
    }

    #[tokio::test]
    async fn malformed_payload_does_not_kill_the_wait() {
        let (transport, inbound) = LoopbackTransport::new();
        let correlator = correlator(&transport, inbound);

        let wait = correlator
            .begin(&device(), ResultChannel::Gcode, WaitSpec {
                job_id: Some("job-m".into()),
                timeout: Duration::from_secs(5),
                progress: None,
            })
            .await
            .unwrap();

        transport.inject(RESULT_TOPIC, &b"}}}garbage"[..]).await;
        transport.inject(RESULT_TOPIC, upload_result("job-m", true)).await;

        assert!(matches!(
            wait.await_outcome().await.unwrap(),
            ResultOutcome::Completed { .. }
        ));
    }

    #[tokio::test]
    async fn duplicate_wait_for_same_job_is_rejected() {
        let (transport, inbound) = LoopbackTransport::new();
        let correlator = correlator(&transport, inbound);
        let device = device();

        let first = correlator
            .begin(&device, ResultChannel::Gcode, WaitSpec {
                job_id: Some("job-d".into()),
                timeout: Duration::from_secs(5),
                progress: None,
            })
            .await
            .unwrap();

        let second = correlator
            .begin(&device, ResultChannel::Gcode, WaitSpec {
                job_id: Some("job-d".into()),
                timeout: Duration::from_secs(5),
                progress: None,
            })
            .await;
        assert!(matches!(second, Err(CoreError::SessionState { .. })));

        // Once the first wait ends its key frees up again.
        drop(first);
        settle().await;
        assert!(correlator
            .begin(&device, ResultChannel::Gcode, WaitSpec {
                job_id: Some("job-d".into()),
                timeout: Duration::from_secs(5),
                progress: None,
            })
            .await
            .is_ok());
    }

    #[tokio::test]
    async fn control_result_resolves_shape_matched_wait() {
        let (transport, inbound) = LoopbackTransport::new();
        let correlator = correlator(&transport, inbound);

        let wait = correlator
            .begin(&device(), ResultChannel::Control, WaitSpec {
                job_id: None,
                timeout: Duration::from_secs(5),
                progress: None,
            })
            .await
            .unwrap();

        transport
            .inject(
                "control/8e33a6f2-0c5b-4a1d-9b77-51f10c0d5d6e/result",
                json!({"type": "control_result", "action": "sd_upload", "ok": true, "message": "stored"})
                    .to_string()
                    .into_bytes(),
            )
            .await;

        assert_eq!(
            wait.await_outcome().await.unwrap(),
            ResultOutcome::Accepted {
                message: Some("stored".into())
            }
        );
    }
}
