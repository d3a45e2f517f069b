//! Logging setup and best-effort forwarding of milestone events to the
//! asset store.
//!
//! Every process installs a `tracing` subscriber with an [`EnvFilter`] (from
//! `CISUG_LOG`, else `[logging].level`) and a stderr `fmt` layer. When
//! `[logging].forward` is set, a [`ForwardLayer`] also captures events that
//! carry a `stage` field and hands them to a background task that POSTs them
//! to `<api base>/<forward_path>`. Forwarding never blocks the caller: the
//! queue is bounded and records are dropped when it is full. Failures are only
//! printed to stderr. [`Telemetry::shutdown`] flushes what is still queued
//! before the process exits.

use anyhow::Result;
use serde::Serialize;
use std::fmt;
use std::time::Duration;
use tokio::sync::mpsc::{self, Receiver, Sender};
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tracing::field::{Field, Visit};
use tracing::{Event, Level, Subscriber};
use tracing_subscriber::layer::{Context, Layer};
use tracing_subscriber::prelude::*;
use tracing_subscriber::EnvFilter;
use uuid::Uuid;

use crate::config::Config;

/// Records queued for forwarding before new ones are dropped.
pub const FORWARD_QUEUE_CAPACITY: usize = 1024;

/// How long [`Telemetry::shutdown`] waits for queued records to be delivered.
pub const FORWARD_FLUSH_TIMEOUT: Duration = Duration::from_secs(10);

/// One forwarded log entry.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ForwardRecord {
    pub message: String,
    #[serde(rename = "type")]
    pub severity: String,
    pub stage: String,
    pub process_id: String,
}

/// Severity names used by the remote log endpoint.
pub fn severity(level: &Level) -> &'static str {
    match *level {
        Level::ERROR => "error",
        Level::WARN => "warning",
        Level::INFO => "info",
        _ => "debug",
    }
}

#[derive(Default)]
struct EventFields {
    message: Option<String>,
    stage: Option<String>,
}

impl Visit for EventFields {
    fn record_str(&mut self, field: &Field, value: &str) {
        match field.name() {
            "message" => self.message = Some(value.to_string()),
            "stage" => self.stage = Some(value.to_string()),
            _ => {}
        }
    }

    fn record_debug(&mut self, field: &Field, value: &dyn fmt::Debug) {
        match field.name() {
            "message" => self.message = Some(format!("{:?}", value)),
            "stage" => self.stage = Some(format!("{:?}", value).trim_matches('"').to_string()),
            _ => {}
        }
    }
}

/// Captures staged events at or above `max_level` and queues them.
pub struct ForwardLayer {
    tx: Sender<ForwardRecord>,
    max_level: Level,
    process_id: String,
}

impl ForwardLayer {
    pub fn new(tx: Sender<ForwardRecord>, max_level: Level, process_id: Uuid) -> Self {
        Self {
            tx,
            max_level,
            process_id: process_id.to_string(),
        }
    }
}

impl<S: Subscriber> Layer<S> for ForwardLayer {
    fn on_event(&self, event: &Event<'_>, _ctx: Context<'_, S>) {
        let level = event.metadata().level();
        if *level > self.max_level {
            return;
        }

        let mut fields = EventFields::default();
        event.record(&mut fields);
        let Some(stage) = fields.stage else {
            return;
        };

        // Full queue or stopped forwarder: drop the record.
        let _ = self.tx.try_send(ForwardRecord {
            message: fields.message.unwrap_or_default(),
            severity: severity(level).to_string(),
            stage,
            process_id: self.process_id.clone(),
        });
    }
}

/// Endpoint and credentials for forwarded records.
#[derive(Clone)]
pub struct ForwardTarget {
    pub url: String,
    pub username: String,
    pub password: String,
}

async fn post_record(client: &reqwest::Client, target: &ForwardTarget, record: &ForwardRecord) {
    let result = client
        .post(&target.url)
        .basic_auth(&target.username, Some(&target.password))
        .json(record)
        .send()
        .await;
    match result {
        Ok(resp) if resp.status().is_success() => {}
        Ok(resp) => eprintln!("log forwarding rejected: HTTP {}", resp.status()),
        Err(e) => eprintln!("log forwarding failed: {}", e),
    }
}

/// POST queued records until every sender is dropped or `stop` fires.
///
/// After `stop`, the queue is closed to new records and drained.
pub async fn forward_records(
    client: reqwest::Client,
    target: ForwardTarget,
    mut rx: Receiver<ForwardRecord>,
    mut stop: oneshot::Receiver<()>,
) {
    let mut draining = false;
    loop {
        tokio::select! {
            record = rx.recv() => match record {
                Some(record) => post_record(&client, &target, &record).await,
                None => break,
            },
            _ = &mut stop, if !draining => {
                draining = true;
                rx.close();
            }
        }
    }
}

/// Handle on the background forwarding task.
pub struct Forwarder {
    stop: oneshot::Sender<()>,
    task: JoinHandle<()>,
}

impl Forwarder {
    /// Spawn the forwarding task and return the layer that feeds it.
    ///
    /// Must be called from within a Tokio runtime.
    pub fn spawn(
        client: reqwest::Client,
        target: ForwardTarget,
        max_level: Level,
        process_id: Uuid,
        capacity: usize,
    ) -> (ForwardLayer, Forwarder) {
        let (tx, rx) = mpsc::channel(capacity.max(1));
        let (stop_tx, stop_rx) = oneshot::channel();
        let task = tokio::spawn(forward_records(client, target, rx, stop_rx));
        (
            ForwardLayer::new(tx, max_level, process_id),
            Forwarder {
                stop: stop_tx,
                task,
            },
        )
    }

    /// Stop accepting records and wait up to `timeout` for the queue to
    /// drain. Returns `false` if records were still pending at the deadline.
    pub async fn flush(self, timeout: Duration) -> bool {
        let _ = self.stop.send(());
        tokio::time::timeout(timeout, self.task).await.is_ok()
    }
}

/// Process-wide logging state returned by [`init`].
pub struct Telemetry {
    pub process_id: Uuid,
    forwarder: Option<Forwarder>,
}

impl Telemetry {
    /// Deliver queued forwarded records before exit.
    pub async fn shutdown(self) {
        if let Some(forwarder) = self.forwarder {
            if !forwarder.flush(FORWARD_FLUSH_TIMEOUT).await {
                eprintln!(
                    "log forwarding: gave up on queued records after {:?}",
                    FORWARD_FLUSH_TIMEOUT
                );
            }
        }
    }
}

/// Install the global subscriber and assign this process's id.
///
/// Must be called from within a Tokio runtime when forwarding is enabled.
pub fn init(config: &Config) -> Result<Telemetry> {
    let process_id = Uuid::new_v4();

    let filter = EnvFilter::try_from_env("CISUG_LOG")
        .or_else(|_| EnvFilter::try_new(&config.logging.level))
        .unwrap_or_else(|_| EnvFilter::new("info"));

    let mut forwarder = None;
    let forward = if config.logging.forward {
        match config.source.credentials() {
            Ok((username, password)) => {
                let max_level = config
                    .logging
                    .forward_level
                    .parse::<Level>()
                    .unwrap_or(Level::INFO);
                let target = ForwardTarget {
                    url: format!(
                        "{}/{}",
                        config.source.api_base(),
                        config.logging.forward_path.trim_start_matches('/')
                    ),
                    username,
                    password,
                };
                let client = reqwest::Client::builder()
                    .timeout(Duration::from_secs(config.source.timeout_secs))
                    .build()?;
                let (layer, handle) = Forwarder::spawn(
                    client,
                    target,
                    max_level,
                    process_id,
                    FORWARD_QUEUE_CAPACITY,
                );
                forwarder = Some(handle);
                Some(layer)
            }
            Err(e) => {
                eprintln!("log forwarding disabled: {:#}", e);
                None
            }
        }
    } else {
        None
    };

    tracing_subscriber::registry()
        .with(filter)
        .with(
            tracing_subscriber::fmt::layer()
                .with_writer(std::io::stderr)
                .with_target(false),
        )
        .with(forward)
        .try_init()?;

    Ok(Telemetry {
        process_id,
        forwarder,
    })
}
