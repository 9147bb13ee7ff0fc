//! Kafka-backed durable log.
//!
//! Offsets are committed manually and synchronously. Auto commit and the
//! automatic offset store are both disabled so the only way a group position
//! advances is an explicit [`LogConsumer::commit`].

use std::time::Duration;

use rdkafka::consumer::{CommitMode, Consumer as _, StreamConsumer};
use rdkafka::producer::{FutureProducer, FutureRecord};
use rdkafka::util::Timeout;
use rdkafka::{ClientConfig, Message, Offset, TopicPartitionList};
use tracing::{debug, info};

use super::{LogConsumer, LogProducer, Position, QueueError, QueuedMessage};

/// Timeout for blocking broker calls (seek, close).
const BROKER_CALL_TIMEOUT: Duration = Duration::from_secs(5);

/// Appends payloads to a Kafka topic and waits for the delivery report.
pub struct KafkaProducer {
    producer: FutureProducer,
    topic: String,
    timeout: Duration,
}

impl KafkaProducer {
    pub fn new(brokers: &[String], topic: &str, timeout: Duration) -> Result<Self, QueueError> {
        let producer: FutureProducer = ClientConfig::new()
            .set("bootstrap.servers", brokers.join(","))
            .set("message.timeout.ms", timeout.as_millis().to_string())
            .set("acks", "all")
            .create()?;

        info!(brokers = %brokers.join(","), topic, "Kafka producer created");

        Ok(Self {
            producer,
            topic: topic.to_string(),
            timeout,
        })
    }
}

impl LogProducer for KafkaProducer {
    async fn append(&self, payload: Vec<u8>) -> Result<Position, QueueError> {
        let record: FutureRecord<'_, (), [u8]> =
            FutureRecord::to(&self.topic).payload(payload.as_slice());

        match self
            .producer
            .send(record, Timeout::After(self.timeout))
            .await
        {
            Ok((partition, offset)) => Ok(Position::new(partition, offset)),
            Err((err, _)) => Err(QueueError::Kafka(err)),
        }
    }
}

/// One member of a Kafka consumer group.
pub struct KafkaConsumer {
    consumer: StreamConsumer,
    topic: String,
}

impl KafkaConsumer {
    pub fn new(brokers: &[String], topic: &str, group_id: &str) -> Result<Self, QueueError> {
        let consumer: StreamConsumer = ClientConfig::new()
            .set("bootstrap.servers", brokers.join(","))
            .set("group.id", group_id)
            .set("enable.auto.commit", "false")
            .set("enable.auto.offset.store", "false")
            .set("auto.offset.reset", "earliest")
            .set("enable.partition.eof", "false")
            .create()?;

        consumer.subscribe(&[topic])?;

        info!(
            brokers = %brokers.join(","),
            topic,
            group_id,
            "Kafka consumer subscribed"
        );

        Ok(Self {
            consumer,
            topic: topic.to_string(),
        })
    }
}

impl LogConsumer for KafkaConsumer {
    async fn fetch(&mut self) -> Result<QueuedMessage, QueueError> {
        let msg = self.consumer.recv().await?;

        Ok(QueuedMessage {
            position: Position::new(msg.partition(), msg.offset()),
            payload: msg.payload().map(<[u8]>::to_vec).unwrap_or_default(),
        })
    }

    async fn rewind(&mut self, position: Position) -> Result<(), QueueError> {
        tokio::task::block_in_place(|| {
            self.consumer.seek(
                &self.topic,
                position.partition,
                Offset::Offset(position.offset),
                BROKER_CALL_TIMEOUT,
            )
        })?;

        debug!(
            partition = position.partition,
            offset = position.offset,
            "Seeked back for redelivery"
        );

        Ok(())
    }

    async fn commit(&mut self, position: Position) -> Result<(), QueueError> {
        let mut tpl = TopicPartitionList::new();
        tpl.add_partition_offset(
            &self.topic,
            position.partition,
            Offset::Offset(position.offset + 1),
        )?;

        tokio::task::block_in_place(|| self.consumer.commit(&tpl, CommitMode::Sync))?;

        Ok(())
    }

    async fn close(&mut self) -> Result<(), QueueError> {
        self.consumer.unsubscribe();
        info!(topic = %self.topic, "Kafka consumer left group");
        Ok(())
    }
}
