//! Consume notification records from Kafka and deliver them as email.
use std::future::ready;
use std::sync::Arc;

use axum::{routing::get, Router};
use envconfig::Envconfig;
use health::HealthRegistry;
use tokio::signal;
use tokio::task::JoinHandle;
use tracing::info;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter, Layer};

use courier_common::metrics::{serve, setup_metrics_routes};
use courier_common::retry::RetryPolicy;
use courier_worker::backend::{HttpApiBackend, MailBackend, PrintBackend, SmtpBackend};
use courier_worker::config::{BackendKind, Config};
use courier_worker::consumer::Pipeline;
use courier_worker::dispatch::Dispatcher;

fn setup_tracing() {
    let log_layer = tracing_subscriber::fmt::layer().with_filter(EnvFilter::from_default_env());
    tracing_subscriber::registry().with(log_layer).init();
}

pub async fn index() -> &'static str {
    "courier email worker"
}

fn start_status_server(
    config: &Config,
    liveness: HealthRegistry,
    pipeline: Arc<Pipeline>,
) -> JoinHandle<()> {
    let router = Router::new()
        .route("/", get(index))
        .route("/_readiness", get(index))
        .route(
            "/_liveness",
            get(move || ready(liveness.get_status())),
        )
        .route("/status", get(move || ready(pipeline.status())));
    let router = setup_metrics_routes(router);
    let bind = config.bind();

    tokio::task::spawn(async move {
        serve(router, &bind)
            .await
            .expect("failed to start serving status routes");
    })
}

async fn shutdown() {
    let mut term = signal::unix::signal(signal::unix::SignalKind::terminate())
        .expect("failed to register SIGTERM handler");

    let mut interrupt = signal::unix::signal(signal::unix::SignalKind::interrupt())
        .expect("failed to register SIGINT handler");

    tokio::select! {
        _ = term.recv() => {},
        _ = interrupt.recv() => {},
    };

    info!("shutting down gracefully...");
}

#[tokio::main]
async fn main() {
    setup_tracing();
    info!("starting up...");

    let config = Config::init_from_env().expect("Invalid configuration:");

    let backend: Arc<dyn MailBackend> = match config.backend {
        BackendKind::Smtp => {
            Arc::new(SmtpBackend::new(&config.smtp).expect("failed to configure SMTP backend"))
        }
        BackendKind::HttpApi => {
            Arc::new(HttpApiBackend::new(&config.api).expect("failed to configure API backend"))
        }
        BackendKind::Print => Arc::new(PrintBackend::default()),
    };

    let retry_policy = RetryPolicy::new(
        config.retry_base_interval.0,
        config.retry_maximum_interval.map(|interval| interval.0),
    );
    let dispatcher = Dispatcher::new(
        backend,
        config.from_address.as_str().to_owned(),
        config.max_attempts,
        config.attempt_timeout.0,
        retry_policy,
    );

    let liveness = HealthRegistry::new("liveness");
    let worker_liveness = liveness
        .register("consumer".to_string(), time::Duration::seconds(30))
        .await;

    let pipeline = Arc::new(Pipeline::new(&config, dispatcher, worker_liveness));

    start_status_server(&config, liveness, pipeline.clone());

    pipeline
        .start()
        .await
        .expect("failed to start the pipeline");

    shutdown().await;

    pipeline.stop().await;
}
