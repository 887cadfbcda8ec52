use std::collections::HashMap;
use std::path::Path;
use std::sync::atomic::{AtomicU64, AtomicU8, Ordering};

use async_trait::async_trait;
use metrics::{counter, histogram};
use tracing::{debug, error, info, instrument, trace};

use crate::api::ProcessorError;
use crate::client::{build_client, BrokerClient, ClientOptions};
use crate::config::ProcessorConfig;
use crate::credentials::PUBSUB_SCOPES;
use crate::event::TrackedEvent;
use crate::format::EventFormatter;
use crate::publish::{publish, topic_path, DeliveryReceipt};

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ProcessorState {
    Uninitialized,
    Ready,
    ShuttingDown,
    Stopped,
}

impl ProcessorState {
    fn from_u8(value: u8) -> ProcessorState {
        match value {
            0 => ProcessorState::Uninitialized,
            1 => ProcessorState::Ready,
            2 => ProcessorState::ShuttingDown,
            _ => ProcessorState::Stopped,
        }
    }

    fn as_u8(self) -> u8 {
        match self {
            ProcessorState::Uninitialized => 0,
            ProcessorState::Ready => 1,
            ProcessorState::ShuttingDown => 2,
            ProcessorState::Stopped => 3,
        }
    }
}

/// Builds the broker handle during `init`.
#[async_trait]
pub trait ClientFactory: Send + Sync {
    async fn build(
        &self,
        secret_path: &Path,
        scopes: &[&str],
    ) -> Result<BrokerClient, ProcessorError>;
}

/// Loads a service-account key file and talks to the Pub/Sub REST API.
#[derive(Clone, Debug, Default)]
pub struct ServiceAccountClientFactory {
    pub options: ClientOptions,
}

#[async_trait]
impl ClientFactory for ServiceAccountClientFactory {
    async fn build(
        &self,
        secret_path: &Path,
        scopes: &[&str],
    ) -> Result<BrokerClient, ProcessorError> {
        build_client(secret_path, scopes, self.options.clone()).await
    }
}

/// Counters kept by the processor. An event counts as formatted before its
/// delivery is attempted, so `formatted_events` includes failed deliveries.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct ProcessorStats {
    pub formatted_events: u64,
    pub formatted_bytes: u64,
    pub delivered_events: u64,
    pub failed_deliveries: u64,
}

struct Pipeline {
    config: ProcessorConfig,
    formatter: EventFormatter,
    client: BrokerClient,
}

/// Formats tracked events and publishes each one to a Pub/Sub topic.
///
/// `init` must succeed before `process` can be called. `process` takes `&self`
/// and can run concurrently from any number of tasks.
pub struct PubsubProcessor {
    state: AtomicU8,
    pipeline: Option<Pipeline>,
    formatted_events: AtomicU64,
    formatted_bytes: AtomicU64,
    delivered_events: AtomicU64,
    failed_deliveries: AtomicU64,
}

impl Default for PubsubProcessor {
    fn default() -> Self {
        PubsubProcessor::new()
    }
}

impl PubsubProcessor {
    pub fn new() -> PubsubProcessor {
        PubsubProcessor {
            state: AtomicU8::new(ProcessorState::Uninitialized.as_u8()),
            pipeline: None,
            formatted_events: AtomicU64::new(0),
            formatted_bytes: AtomicU64::new(0),
            delivered_events: AtomicU64::new(0),
            failed_deliveries: AtomicU64::new(0),
        }
    }

    pub fn state(&self) -> ProcessorState {
        ProcessorState::from_u8(self.state.load(Ordering::Acquire))
    }

    /// Validate `params`, then build the formatter and the broker client.
    ///
    /// Nothing is kept when any step fails, the processor stays uninitialized.
    pub async fn init<F: ClientFactory + ?Sized>(
        &mut self,
        params: &HashMap<String, String>,
        third_party_cookies: bool,
        factory: &F,
    ) -> Result<(), ProcessorError> {
        let state = self.state();
        if state != ProcessorState::Uninitialized {
            return Err(ProcessorError::InvalidState(state));
        }

        let config = ProcessorConfig::from_params(params).map_err(|e| {
            error!("invalid processor configuration: {}", e);
            e
        })?;
        topic_path(&config.project_name, &config.topic_name)?;

        let formatter = EventFormatter::new(config.inline_rules.clone(), third_party_cookies)
            .with_escape_mode(config.escape_mode);
        let client = factory.build(&config.secret_path, PUBSUB_SCOPES).await?;

        info!(
            "publishing to topic {} of project {}",
            config.topic_name, config.project_name
        );
        self.pipeline = Some(Pipeline {
            config,
            formatter,
            client,
        });
        self.state
            .store(ProcessorState::Ready.as_u8(), Ordering::Release);
        Ok(())
    }

    #[instrument(skip_all, fields(visitor_id = %event.visitor_id))]
    pub async fn process(&self, event: &TrackedEvent) -> Result<DeliveryReceipt, ProcessorError> {
        let state = self.state();
        let pipeline = match (&self.pipeline, state) {
            (Some(pipeline), ProcessorState::Ready) => pipeline,
            _ => return Err(ProcessorError::InvalidState(state)),
        };

        trace!("processing request");
        let record = pipeline.formatter.format(event);

        self.formatted_events.fetch_add(1, Ordering::Relaxed);
        self.formatted_bytes
            .fetch_add(record.len() as u64, Ordering::Relaxed);
        counter!("capture_pubsub_events_formatted_total").increment(1);
        counter!("capture_pubsub_bytes_formatted_total").increment(record.len() as u64);
        histogram!("capture_pubsub_record_size_bytes").record(record.len() as f64);

        match publish(
            &pipeline.client,
            &pipeline.config.project_name,
            &pipeline.config.topic_name,
            &record,
        )
        .await
        {
            Ok(receipt) => {
                self.delivered_events.fetch_add(1, Ordering::Relaxed);
                counter!("capture_pubsub_events_delivered_total").increment(1);
                debug!(
                    message_id = receipt.message_id().unwrap_or_default(),
                    "event delivered"
                );
                Ok(receipt)
            }
            Err(err) => {
                self.failed_deliveries.fetch_add(1, Ordering::Relaxed);
                counter!("capture_pubsub_delivery_failures_total").increment(1);
                error!("failed to deliver event: {}", err);
                Err(err)
            }
        }
    }

    /// Delivery is synchronous, there is never anything buffered.
    pub fn flush(&self) {}

    /// Administrative hook of the hosting framework. Nothing to inspect here.
    pub fn service(&self) {}

    pub fn shutdown(&self) {
        let previous = self
            .state
            .swap(ProcessorState::ShuttingDown.as_u8(), Ordering::AcqRel);
        if ProcessorState::from_u8(previous) == ProcessorState::Stopped {
            self.state
                .store(ProcessorState::Stopped.as_u8(), Ordering::Release);
            return;
        }

        let stats = self.stats();
        info!(
            formatted_events = stats.formatted_events,
            formatted_bytes = stats.formatted_bytes,
            delivered_events = stats.delivered_events,
            failed_deliveries = stats.failed_deliveries,
            "processor stopped"
        );
        self.state
            .store(ProcessorState::Stopped.as_u8(), Ordering::Release);
    }

    pub fn stats(&self) -> ProcessorStats {
        ProcessorStats {
            formatted_events: self.formatted_events.load(Ordering::Relaxed),
            formatted_bytes: self.formatted_bytes.load(Ordering::Relaxed),
            delivered_events: self.delivered_events.load(Ordering::Relaxed),
            failed_deliveries: self.failed_deliveries.load(Ordering::Relaxed),
        }
    }
}
