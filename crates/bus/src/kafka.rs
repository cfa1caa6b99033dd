//! Kafka backend (feature `kafka`). Thin adapter over rdkafka: the retry,
//! metrics, and DLQ behavior live in [`crate::EventPublisher`] and the
//! stream processor, so this module only maps the transport.

use std::time::Duration;

use async_trait::async_trait;
use rdkafka::config::ClientConfig;
use rdkafka::consumer::{CommitMode, Consumer, StreamConsumer};
use rdkafka::message::Message;
use rdkafka::producer::{FutureProducer, FutureRecord, Producer};
use rdkafka::util::Timeout;
use tracing::info;

use cdp_core::config::BusConfig;
use cdp_core::error::{CdpError, CdpResult};

use crate::{BusBackend, BusConsumer, BusMessage};

fn client_config(config: &BusConfig) -> ClientConfig {
    let mut cc = ClientConfig::new();
    cc.set("bootstrap.servers", &config.bootstrap_servers)
        .set("security.protocol", config.security_protocol.to_lowercase());
    if config.security_protocol != "PLAINTEXT" {
        cc.set("sasl.mechanism", &config.sasl_mechanism)
            .set("sasl.username", &config.sasl_username)
            .set("sasl.password", &config.sasl_password);
    }
    cc
}

/// Producer-side transport.
pub struct KafkaBackend {
    producer: FutureProducer,
}

impl KafkaBackend {
    pub fn new(config: &BusConfig) -> CdpResult<Self> {
        let producer: FutureProducer = client_config(config)
            .set("enable.idempotence", "true")
            .create()
            .map_err(|e| CdpError::Config(format!("kafka producer: {e}")))?;
        info!(bootstrap = %config.bootstrap_servers, "kafka producer created");
        Ok(Self { producer })
    }
}

#[async_trait]
impl BusBackend for KafkaBackend {
    async fn publish(
        &self,
        topic: &str,
        key: Option<&str>,
        payload: Option<&[u8]>,
    ) -> CdpResult<()> {
        let mut record: FutureRecord<'_, str, [u8]> = FutureRecord::to(topic);
        if let Some(k) = key {
            record = record.key(k);
        }
        if let Some(p) = payload {
            record = record.payload(p);
        }
        self.producer
            .send(record, Timeout::After(Duration::from_secs(5)))
            .await
            .map_err(|(e, _)| CdpError::TransientStorage(e.to_string()))?;
        Ok(())
    }

    async fn flush(&self, timeout: Duration) -> CdpResult<()> {
        self.producer
            .flush(Timeout::After(timeout))
            .map_err(|e| CdpError::TransientStorage(e.to_string()))
    }
}

/// Consumer-side transport with manual commit.
pub struct KafkaBusConsumer {
    inner: StreamConsumer,
}

impl KafkaBusConsumer {
    pub fn new(config: &BusConfig, topic: &str, group: &str) -> CdpResult<Self> {
        let consumer: StreamConsumer = client_config(config)
            .set("group.id", group)
            .set("enable.auto.commit", "false")
            .set("auto.offset.reset", "earliest")
            .create()
            .map_err(|e| CdpError::Config(format!("kafka consumer: {e}")))?;
        consumer
            .subscribe(&[topic])
            .map_err(|e| CdpError::Config(format!("kafka subscribe: {e}")))?;
        info!(topic = topic, group = group, "kafka consumer subscribed");
        Ok(Self { inner: consumer })
    }
}

#[async_trait]
impl BusConsumer for KafkaBusConsumer {
    async fn poll_batch(&self, max: usize) -> CdpResult<Vec<BusMessage>> {
        let mut batch = Vec::new();
        while batch.len() < max.max(1) {
            match tokio::time::timeout(Duration::from_millis(100), self.inner.recv()).await {
                Err(_) => break,
                Ok(Err(e)) => return Err(CdpError::TransientStorage(e.to_string())),
                Ok(Ok(msg)) => {
                    batch.push(BusMessage {
                        topic: msg.topic().to_string(),
                        partition: msg.partition() as u32,
                        offset: msg.offset() as u64,
                        key: msg
                            .key()
                            .map(|k| String::from_utf8_lossy(k).into_owned()),
                        payload: msg.payload().map(<[u8]>::to_vec),
                    });
                }
            }
        }
        Ok(batch)
    }

    async fn commit(&self) -> CdpResult<()> {
        self.inner
            .commit_consumer_state(CommitMode::Async)
            .map_err(|e| CdpError::TransientStorage(e.to_string()))
    }
}
