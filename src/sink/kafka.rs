//! Message bus sink
//!
//! One producer per enabled message family, each bound to its own topic.
//! Delivery: required acks = all, one request in flight (the producer call
//! is synchronous), bounded retry with a fixed backoff.
//!
//! When a message exhausts its retries:
//! 1. an empty copy (`MarketDataMessage::empty_copy`) is published so
//!    consumers waiting on this height are released
//! 2. the essential digest goes to `{essential_log_dir}/{height}_{Kind}.log`
//!    for manual recovery
//! 3. `Exhausted` is returned, or `FailFast` when configured

use kafka::producer::{Producer, Record, RequiredAcks};
use std::fs;
use std::path::PathBuf;
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use super::{MarketDataSink, SinkError, timed_encode};
use crate::config::{KafkaConfig, PublicationConfig, TopicConfig};
use crate::core_types::{Height, TimestampMs};
use crate::encoder::{encode, message_key};
use crate::messages::{MarketDataMessage, MsgKind};
use crate::metrics::PublicationMetrics;

/// Synchronous keyed send to one topic
pub trait BusProducer: Send {
    fn send(&mut self, topic: &str, key: &[u8], value: &[u8]) -> Result<(), String>;
}

pub struct KafkaProducer {
    inner: Producer,
}

impl KafkaProducer {
    pub fn connect(brokers: Vec<String>, ack_timeout: Duration) -> Result<Self, SinkError> {
        let inner = Producer::from_hosts(brokers)
            .with_ack_timeout(ack_timeout)
            .with_required_acks(RequiredAcks::All)
            .create()
            .map_err(|e| SinkError::Setup(format!("create producer: {}", e)))?;
        Ok(Self { inner })
    }
}

impl BusProducer for KafkaProducer {
    fn send(&mut self, topic: &str, key: &[u8], value: &[u8]) -> Result<(), String> {
        self.inner
            .send(&Record::from_key_value(topic, key, value))
            .map_err(|e| e.to_string())
    }
}

struct TopicProducer {
    topic: String,
    producer: Box<dyn BusProducer>,
}

impl TopicProducer {
    /// Returns the number of attempts made on failure
    fn send_with_retry(
        &mut self,
        key: &str,
        value: &[u8],
        max_retries: u32,
        backoff: Duration,
    ) -> Result<(), u32> {
        let attempts = max_retries + 1;
        for attempt in 1..=attempts {
            match self.producer.send(&self.topic, key.as_bytes(), value) {
                Ok(()) => return Ok(()),
                Err(e) => {
                    tracing::warn!(topic = %self.topic, key, attempt, error = %e, "Failed to send to bus");
                    if attempt < attempts && !backoff.is_zero() {
                        thread::sleep(backoff);
                    }
                }
            }
        }
        Err(attempts)
    }
}

pub struct KafkaSink {
    topics: [Option<TopicProducer>; MsgKind::ALL.len()],
    max_retries: u32,
    retry_backoff: Duration,
    fail_fast: bool,
    essential_dir: PathBuf,
    stopped: bool,
    metrics: Option<Arc<PublicationMetrics>>,
}

impl KafkaSink {
    /// Create a producer for every family that is both published and has
    /// an enabled topic
    pub fn connect(config: &PublicationConfig) -> Result<Self, SinkError> {
        let kafka = &config.kafka;
        let families: [(MsgKind, &TopicConfig, bool); 4] = [
            (MsgKind::ExecutionResults, &kafka.order_updates, config.publish_order_updates),
            (MsgKind::Books, &kafka.order_book, config.publish_order_book),
            (MsgKind::Accounts, &kafka.account_balance, config.publish_account_balance),
            (MsgKind::BlockFee, &kafka.block_fee, config.publish_block_fee),
        ];

        let mut producers: Vec<(MsgKind, String, Box<dyn BusProducer>)> = Vec::new();
        for (kind, topic, published) in families {
            if !published || !topic.enabled {
                continue;
            }
            if topic.topic.is_empty() {
                return Err(SinkError::Setup(format!("no topic configured for {}", kind)));
            }
            let brokers = topic.broker_list();
            if brokers.is_empty() {
                return Err(SinkError::Setup(format!("no brokers configured for {}", kind)));
            }
            tracing::info!(kind = %kind, topic = %topic.topic, brokers = %topic.brokers, "Connecting bus producer");
            let producer =
                KafkaProducer::connect(brokers, Duration::from_millis(kafka.ack_timeout_ms))?;
            producers.push((kind, topic.topic.clone(), Box::new(producer)));
        }
        if producers.is_empty() {
            tracing::warn!("Bus sink enabled without any enabled topic");
        }
        Ok(Self::with_producers(kafka, producers))
    }

    /// Build over already-created producers, one per `(kind, topic)`
    pub fn with_producers(
        config: &KafkaConfig,
        producers: Vec<(MsgKind, String, Box<dyn BusProducer>)>,
    ) -> Self {
        let mut topics: [Option<TopicProducer>; MsgKind::ALL.len()] = Default::default();
        for (kind, topic, producer) in producers {
            topics[kind.index()] = Some(TopicProducer { topic, producer });
        }
        Self {
            topics,
            max_retries: config.max_retries,
            retry_backoff: Duration::from_millis(config.retry_backoff_ms),
            fail_fast: config.fail_fast,
            essential_dir: PathBuf::from(&config.essential_log_dir),
            stopped: false,
            metrics: None,
        }
    }

    fn write_essential(&self, kind: MsgKind, height: Height, content: &str) {
        let path = self.essential_dir.join(format!("{}_{}.log", height, kind.as_str()));
        let written = fs::create_dir_all(&self.essential_dir).and_then(|_| fs::write(&path, content));
        match written {
            Ok(()) => tracing::info!(path = %path.display(), "Essential message written"),
            Err(e) => tracing::error!(path = %path.display(), error = %e, content, "Failed to write essential message"),
        }
    }
}

impl MarketDataSink for KafkaSink {
    fn name(&self) -> &'static str {
        "kafka"
    }

    fn publish(
        &mut self,
        msg: &MarketDataMessage,
        kind: MsgKind,
        height: Height,
        timestamp: TimestampMs,
    ) -> Result<(), SinkError> {
        if self.stopped {
            return Err(SinkError::Stopped("kafka"));
        }
        let (max_retries, backoff) = (self.max_retries, self.retry_backoff);
        let metrics = self.metrics.clone();
        let Some(topic) = self.topics[kind.index()].as_mut() else {
            tracing::debug!(kind = %kind, height, "No topic for message kind, skipped");
            return Ok(());
        };

        let key = message_key(height, timestamp, kind);
        let value = timed_encode(metrics.as_deref(), kind, || encode(msg, kind))?;
        let Err(attempts) = topic.send_with_retry(&key, &value, max_retries, backoff) else {
            return Ok(());
        };
        tracing::error!(kind = %kind, height, attempts, msg = %msg, "Failed to publish after retries");

        if let Some(empty) = msg.empty_copy() {
            let delivered = timed_encode(metrics.as_deref(), kind, || encode(&empty, kind))
                .map_err(|e| e.to_string())
                .and_then(|bytes| {
                    topic
                        .send_with_retry(&key, &bytes, max_retries, backoff)
                        .map_err(|n| format!("not delivered after {} attempts", n))
                });
            match delivered {
                Ok(()) => tracing::warn!(kind = %kind, height, "Published empty copy in place of lost message"),
                Err(e) => tracing::error!(kind = %kind, height, error = %e, "Failed to publish empty copy"),
            }
        }
        if let Some(essential) = msg.essential_msg() {
            self.write_essential(kind, height, &essential);
        }

        if self.fail_fast {
            return Err(SinkError::FailFast(format!(
                "{} at height {} not delivered after {} attempts",
                kind, height, attempts
            )));
        }
        Err(SinkError::Exhausted {
            kind,
            height,
            attempts,
        })
    }

    fn stop(&mut self) {
        if self.stopped {
            return;
        }
        self.stopped = true;
        for slot in self.topics.iter_mut() {
            if let Some(t) = slot.take() {
                tracing::info!(topic = %t.topic, "Bus producer closed");
            }
        }
    }

    fn attach_metrics(&mut self, metrics: Arc<PublicationMetrics>) {
        self.metrics = Some(metrics);
    }
}
