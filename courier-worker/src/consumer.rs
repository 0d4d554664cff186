use std::fmt;
use std::sync::{Arc, RwLock};
use std::time::{Duration, Instant};

use health::{HealthHandle, PipelineStatus};
use rdkafka::consumer::{Consumer, StreamConsumer};
use rdkafka::error::KafkaError;
use rdkafka::{ClientConfig, Message};
use serde_json::Value;
use tokio::sync::{watch, Mutex};
use tokio::task::JoinHandle;
use tracing::{error, info, warn};

use courier_common::message::NotificationRequest;

use crate::config::Config;
use crate::dispatch::{DispatchOutcome, Dispatcher};
use crate::error::{RecordError, WorkerError};

/// Lifecycle states of the pipeline.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PipelineState {
    Stopped,
    Starting,
    Running,
    Stopping,
}

impl PipelineState {
    pub fn as_str(&self) -> &'static str {
        match self {
            PipelineState::Stopped => "stopped",
            PipelineState::Starting => "starting",
            PipelineState::Running => "running",
            PipelineState::Stopping => "stopping",
        }
    }
}

/// Positional identity of one record, for log correlation only. The
/// pipeline does not deduplicate on it.
pub struct ProcessingIdentity {
    topic: String,
    partition: i32,
    offset: i64,
}

impl ProcessingIdentity {
    fn new(topic: &str, partition: i32, offset: i64) -> Self {
        Self {
            topic: topic.to_owned(),
            partition,
            offset,
        }
    }
}

impl fmt::Display for ProcessingIdentity {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{}[{}]@{}", self.topic, self.partition, self.offset)
    }
}

/// One record-intake pipeline instance: a Kafka consumer feeding the
/// dispatcher one record at a time, in partition order, plus the start/stop
/// state machine around it.
///
/// The broker connection and the mail backend session are owned here (via
/// the dispatcher), created once at start and released once at stop; there
/// is no ambient global state and no per-record connection churn.
pub struct Pipeline {
    dispatcher: Arc<Dispatcher>,
    kafka_hosts: String,
    topic: String,
    consumer_group: String,
    kafka_tls: bool,
    state: Arc<RwLock<PipelineState>>,
    shutdown: watch::Sender<bool>,
    liveness: Arc<HealthHandle>,
    started_at: Instant,
    task: Mutex<Option<JoinHandle<()>>>,
}

impl Pipeline {
    pub fn new(config: &Config, dispatcher: Dispatcher, liveness: HealthHandle) -> Self {
        let (shutdown, shutdown_rx) = watch::channel(false);
        drop(shutdown_rx);

        Self {
            dispatcher: Arc::new(dispatcher),
            kafka_hosts: config.kafka_hosts.clone(),
            topic: config.kafka_topic.as_str().to_owned(),
            consumer_group: config.kafka_consumer_group.as_str().to_owned(),
            kafka_tls: config.kafka_tls,
            state: Arc::new(RwLock::new(PipelineState::Stopped)),
            shutdown,
            liveness: Arc::new(liveness),
            started_at: Instant::now(),
            task: Mutex::new(None),
        }
    }

    /// Verify the delivery backend, subscribe to the topic and spawn the
    /// consumer loop. Returns once subscribed and ready. Any failure rolls
    /// the state back to `Stopped` with no partial start state left behind.
    pub async fn start(&self) -> Result<(), WorkerError> {
        {
            let mut state = self.state.write().expect("poisoned pipeline state lock");
            if *state != PipelineState::Stopped {
                return Err(WorkerError::AlreadyRunning);
            }
            *state = PipelineState::Starting;
        }

        if let Err(error) = self.dispatcher.verify_backend().await {
            self.set_state(PipelineState::Stopped);
            return Err(WorkerError::BackendUnavailable(error));
        }

        let consumer = match self.create_consumer() {
            Ok(consumer) => consumer,
            Err(error) => {
                self.set_state(PipelineState::Stopped);
                return Err(error.into());
            }
        };

        _ = self.shutdown.send_replace(false);
        let shutdown_rx = self.shutdown.subscribe();

        self.set_state(PipelineState::Running);
        info!(topic = self.topic, "pipeline running");

        let handle = tokio::spawn(run_consumer_loop(
            consumer,
            self.dispatcher.clone(),
            shutdown_rx,
            self.liveness.clone(),
            self.state.clone(),
            self.topic.clone(),
        ));
        *self.task.lock().await = Some(handle);

        Ok(())
    }

    /// Request shutdown and wait for the in-flight record (if any) to
    /// finish. Idempotent: calling while already stopping or stopped logs
    /// and returns without effect. Teardown failures are logged, never
    /// re-thrown, so shutdown always completes.
    pub async fn stop(&self) {
        {
            let mut state = self.state.write().expect("poisoned pipeline state lock");
            match *state {
                PipelineState::Stopping | PipelineState::Stopped => {
                    info!(
                        state = state.as_str(),
                        "stop requested but pipeline is not running, nothing to do"
                    );
                    return;
                }
                _ => *state = PipelineState::Stopping,
            }
        }

        info!("stopping pipeline, letting the in-flight record finish");
        _ = self.shutdown.send_replace(true);

        match self.task.lock().await.take() {
            Some(task) => {
                if let Err(error) = task.await {
                    error!(error = %error, "consumer task did not shut down cleanly");
                    self.set_state(PipelineState::Stopped);
                }
            }
            // stop() raced a start() that had not spawned the loop yet
            None => self.set_state(PipelineState::Stopped),
        }
    }

    pub fn state(&self) -> PipelineState {
        *self.state.read().expect("poisoned pipeline state lock")
    }

    /// Snapshot served by the worker's status route.
    pub fn status(&self) -> PipelineStatus {
        let state = self.state();
        PipelineStatus::new(
            state.as_str(),
            self.started_at,
            state == PipelineState::Running,
        )
    }

    fn set_state(&self, state: PipelineState) {
        *self.state.write().expect("poisoned pipeline state lock") = state;
    }

    fn create_consumer(&self) -> Result<StreamConsumer, KafkaError> {
        let mut client_config = ClientConfig::new();
        client_config
            .set("bootstrap.servers", &self.kafka_hosts)
            .set("group.id", &self.consumer_group)
            .set("enable.auto.offset.store", "false");

        if self.kafka_tls {
            client_config
                .set("security.protocol", "ssl")
                .set("enable.ssl.certificate.verification", "false");
        };

        let consumer: StreamConsumer = client_config.create()?;
        consumer.subscribe(&[self.topic.as_str()])?;

        info!(
            topic = self.topic,
            group = self.consumer_group,
            "kafka consumer subscribed"
        );

        Ok(consumer)
    }
}

/// The record loop: one record at a time, in the order the broker hands
/// them over. The loop blocks on dispatch and does not pick up the next
/// record until the current outcome is resolved. Record-level failures are
/// terminal per record and never halt the loop.
async fn run_consumer_loop(
    consumer: StreamConsumer,
    dispatcher: Arc<Dispatcher>,
    mut shutdown_rx: watch::Receiver<bool>,
    liveness: Arc<HealthHandle>,
    state: Arc<RwLock<PipelineState>>,
    topic: String,
) {
    let mut liveness_interval = tokio::time::interval(Duration::from_secs(10));

    loop {
        if *shutdown_rx.borrow() {
            break;
        }

        tokio::select! {
            // Shutdown only preempts waiting for a record: a record already
            // being processed in the branch below runs to completion first.
            _ = shutdown_rx.changed() => break,
            _ = liveness_interval.tick() => liveness.report_healthy().await,
            received = consumer.recv() => match received {
                Ok(message) => {
                    let identity = ProcessingIdentity::new(
                        message.topic(),
                        message.partition(),
                        message.offset(),
                    );
                    metrics::counter!("courier_records_received_total").increment(1);

                    match message.payload() {
                        Some(payload) => {
                            let result = process_payload(&dispatcher, payload).await;
                            log_outcome(&identity, payload, result);
                        }
                        None => {
                            warn!(record = %identity, "record has no payload, skipping");
                            record_skipped("empty");
                        }
                    }

                    // The record counts as processed whatever the outcome:
                    // advance past it so a restart does not replay it.
                    if let Err(error) =
                        consumer.store_offset(&topic, message.partition(), message.offset())
                    {
                        warn!(record = %identity, error = %error, "failed to store offset");
                    }
                }
                Err(error) => {
                    warn!(error = %error, "kafka recv error");
                }
            }
        }
    }

    info!("consumer loop exiting, releasing resources");
    // Dropping the consumer leaves the group and commits stored offsets.
    drop(consumer);

    *state.write().expect("poisoned pipeline state lock") = PipelineState::Stopped;
    info!("pipeline stopped");
}

/// Decode, validate and dispatch one record payload. Decode and validation
/// failures surface as `RecordError`; a delivery failure is a regular
/// `DispatchOutcome::Failed`, not an error.
async fn process_payload(
    dispatcher: &Dispatcher,
    payload: &[u8],
) -> Result<DispatchOutcome, RecordError> {
    let decoded: Value = serde_json::from_slice(payload)?;
    let request = NotificationRequest::from_value(&decoded)?;

    Ok(dispatcher.dispatch(&request).await)
}

fn log_outcome(
    identity: &ProcessingIdentity,
    payload: &[u8],
    result: Result<DispatchOutcome, RecordError>,
) {
    match result {
        Ok(DispatchOutcome::Delivered {
            delivery_id,
            attempts,
        }) => {
            info!(
                record = %identity,
                delivery_id,
                attempts,
                "notification delivered"
            );
            metrics::counter!("courier_records_delivered_total").increment(1);
        }
        Ok(DispatchOutcome::Failed { error, attempts }) => {
            // Extension point: a dead-letter sink for permanently-failed
            // records would be attached here. Until one exists the failure
            // is terminal and the record is dropped.
            error!(
                record = %identity,
                attempts,
                error = %error,
                "delivery failed after all attempts, record dropped"
            );
            metrics::counter!("courier_records_failed_total").increment(1);
        }
        Err(RecordError::Decode(error)) => {
            warn!(
                record = %identity,
                payload_bytes = payload.len(),
                snippet = payload_snippet(payload),
                error = %error,
                "payload failed to decode, record skipped"
            );
            record_skipped("decode");
        }
        Err(RecordError::Validation(error)) => {
            warn!(
                record = %identity,
                field = error.field(),
                error = %error,
                "message failed validation, record skipped"
            );
            record_skipped("validation");
        }
    }
}

fn record_skipped(reason: &'static str) {
    let labels = [("reason", reason)];
    metrics::counter!("courier_records_skipped_total", &labels).increment(1);
}

fn payload_snippet(payload: &[u8]) -> String {
    let cut = payload.len().min(64);
    String::from_utf8_lossy(&payload[..cut]).into_owned()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    use async_trait::async_trait;
    use health::HealthRegistry;

    use courier_common::message::ValidationError;
    use courier_common::retry::RetryPolicy;

    use crate::backend::{DeliveryId, MailBackend, OutboundEmail};
    use crate::config::{BackendKind, EnvMsDuration, HttpApiConfig, NonEmptyString, SmtpConfig};
    use crate::error::DeliveryError;

    struct CountingBackend {
        fail: bool,
        calls: AtomicU32,
    }

    impl CountingBackend {
        fn succeeding() -> Self {
            Self {
                fail: false,
                calls: AtomicU32::new(0),
            }
        }

        fn failing() -> Self {
            Self {
                fail: true,
                calls: AtomicU32::new(0),
            }
        }

        fn calls(&self) -> u32 {
            self.calls.load(Ordering::SeqCst)
        }
    }

    #[async_trait]
    impl MailBackend for CountingBackend {
        async fn send(&self, _email: &OutboundEmail) -> Result<DeliveryId, DeliveryError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            if self.fail {
                Err(DeliveryError::Backend("provider rejected".to_owned()))
            } else {
                Ok("delivery-1".to_owned())
            }
        }
    }

    fn dispatcher(backend: Arc<dyn MailBackend>) -> Dispatcher {
        Dispatcher::new(
            backend,
            "no-reply@example.com".to_owned(),
            3,
            Duration::from_millis(50),
            RetryPolicy::new(Duration::from_millis(1), None),
        )
    }

    fn config() -> Config {
        Config {
            host: "127.0.0.1".to_owned(),
            port: 0,
            kafka_hosts: "localhost:9092".to_owned(),
            kafka_topic: NonEmptyString("email_notifications".to_owned()),
            kafka_consumer_group: NonEmptyString("courier-worker".to_owned()),
            kafka_tls: false,
            from_address: NonEmptyString("no-reply@example.com".to_owned()),
            backend: BackendKind::Print,
            max_attempts: 3,
            attempt_timeout: EnvMsDuration(Duration::from_millis(50)),
            retry_base_interval: EnvMsDuration(Duration::from_millis(1)),
            retry_maximum_interval: None,
            smtp: SmtpConfig {
                host: "localhost".to_owned(),
                port: 587,
                username: None,
                password: None,
            },
            api: HttpApiConfig {
                endpoint: None,
                key: None,
            },
        }
    }

    async fn pipeline(backend: Arc<dyn MailBackend>) -> Pipeline {
        let registry = HealthRegistry::new("liveness");
        let liveness = registry
            .register("consumer".to_string(), time::Duration::seconds(30))
            .await;
        Pipeline::new(&config(), dispatcher(backend), liveness)
    }

    #[tokio::test]
    async fn a_valid_record_is_dispatched_once() {
        let backend = Arc::new(CountingBackend::succeeding());
        let dispatcher = dispatcher(backend.clone());

        let payload = br#"{"to":"a@b.com","subject":"Hi","message":"hello"}"#;
        match process_payload(&dispatcher, payload).await.unwrap() {
            DispatchOutcome::Delivered { attempts, .. } => assert_eq!(attempts, 1),
            other => panic!("expected Delivered, got {:?}", other),
        }
        assert_eq!(backend.calls(), 1);
    }

    #[tokio::test]
    async fn an_invalid_address_never_reaches_the_backend() {
        let backend = Arc::new(CountingBackend::succeeding());
        let dispatcher = dispatcher(backend.clone());

        let payload = br#"{"to":"not-an-email","subject":"Hi","message":"hello"}"#;
        match process_payload(&dispatcher, payload).await {
            Err(RecordError::Validation(ValidationError::InvalidAddressFormat)) => {}
            other => panic!("expected InvalidAddressFormat, got {:?}", other),
        }
        assert_eq!(backend.calls(), 0);
    }

    #[tokio::test]
    async fn a_missing_recipient_is_reported_by_name() {
        let backend = Arc::new(CountingBackend::succeeding());
        let dispatcher = dispatcher(backend.clone());

        let payload = br#"{"subject":"Hi","message":"hello"}"#;
        match process_payload(&dispatcher, payload).await {
            Err(RecordError::Validation(ValidationError::MissingField("to"))) => {}
            other => panic!("expected MissingField(to), got {:?}", other),
        }
        assert_eq!(backend.calls(), 0);
    }

    #[tokio::test]
    async fn a_malformed_payload_is_a_decode_error() {
        let backend = Arc::new(CountingBackend::succeeding());
        let dispatcher = dispatcher(backend.clone());

        match process_payload(&dispatcher, b"not json at all").await {
            Err(RecordError::Decode(_)) => {}
            other => panic!("expected Decode, got {:?}", other),
        }
        assert_eq!(backend.calls(), 0);
    }

    #[tokio::test]
    async fn exhausted_retries_resolve_as_a_failed_outcome_not_an_error() {
        let backend = Arc::new(CountingBackend::failing());
        let dispatcher = dispatcher(backend.clone());

        let payload = br#"{"to":"a@b.com","subject":"Hi","message":"hello"}"#;
        match process_payload(&dispatcher, payload).await.unwrap() {
            DispatchOutcome::Failed { attempts, .. } => assert_eq!(attempts, 3),
            other => panic!("expected Failed, got {:?}", other),
        }
        assert_eq!(backend.calls(), 3);
    }

    #[tokio::test]
    async fn a_fresh_pipeline_reports_stopped() {
        let pipeline = pipeline(Arc::new(CountingBackend::succeeding())).await;

        assert_eq!(pipeline.state(), PipelineState::Stopped);
        let status = pipeline.status();
        assert_eq!(status.status, "stopped");
        assert!(!status.is_running);
    }

    #[tokio::test]
    async fn stop_is_idempotent() {
        let pipeline = pipeline(Arc::new(CountingBackend::succeeding())).await;

        // Both calls return immediately: the pipeline never ran, so there is
        // exactly zero shutdown work and no hang waiting on a task.
        pipeline.stop().await;
        pipeline.stop().await;
        assert_eq!(pipeline.state(), PipelineState::Stopped);
    }

    #[test]
    fn processing_identity_formats_for_log_correlation() {
        let identity = ProcessingIdentity::new("email_notifications", 2, 42);
        assert_eq!(identity.to_string(), "email_notifications[2]@42");
    }

    #[test]
    fn payload_snippet_truncates_long_payloads() {
        let long = vec![b'x'; 1024];
        assert_eq!(payload_snippet(&long).len(), 64);
        assert_eq!(payload_snippet(b"short"), "short");
    }
}
