use async_trait::async_trait;
use futures_util::StreamExt;
use lapin::{
    BasicProperties, Channel, Connection, ConnectionProperties, Consumer,
    message::Delivery as AmqpDelivery,
    options::{
        BasicAckOptions, BasicConsumeOptions, BasicPublishOptions, BasicQosOptions,
        BasicRejectOptions, ConfirmSelectOptions, QueueDeclareOptions,
    },
    types::{AMQPValue, FieldTable},
};
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::{
    clients::broker::{BrokerSession, DeliveryAcker, JobPublisher},
    config::{Config, dead_letter_queue},
    models::{
        delivery::{Delivery, FAILURE_REASON_HEADER, REDELIVERY_COUNT_HEADER},
        error::{BrokerError, ConnectionError, PublishError, TopologyError, WorkerError},
        job::EmailJob,
    },
};

const PERSISTENT: u8 = 2;

pub struct RabbitMqClient {
    connection: Connection,
    channel: Channel,
    queue_name: String,
    dlq_name: String,
}

impl RabbitMqClient {
    /// Opens one connection and a confirm-mode channel. A single attempt; see
    /// `utils::connect_with_retry` for the retrying wrapper.
    pub async fn connect(config: &Config) -> Result<Self, ConnectionError> {
        debug!(queue = %config.queue_name, "Connecting to RabbitMQ");

        let connection = Connection::connect(&config.rabbitmq_url, ConnectionProperties::default())
            .await
            .map_err(|e| ConnectionError::Lost(format!("connect failed: {e}")))?;

        let channel = connection
            .create_channel()
            .await
            .map_err(|e| ConnectionError::Lost(format!("channel creation failed: {e}")))?;

        channel
            .confirm_select(ConfirmSelectOptions::default())
            .await
            .map_err(|e| ConnectionError::Lost(format!("confirm mode failed: {e}")))?;

        info!("RabbitMQ connection established");

        Ok(Self {
            connection,
            channel,
            queue_name: config.queue_name.clone(),
            dlq_name: config.dlq_name(),
        })
    }

    pub fn queue_name(&self) -> &str {
        &self.queue_name
    }

    pub fn dlq_name(&self) -> &str {
        &self.dlq_name
    }

    /// Declares `queue_name` and its `_dlq` companion as durable queues.
    ///
    /// Declaring is idempotent against matching queues and never deletes
    /// anything. A queue that already exists with other parameters surfaces
    /// as [`TopologyError::Conflict`]; the broker closes the channel in that
    /// case, so the client must be discarded.
    pub async fn ensure_topology(&self, queue_name: &str) -> Result<(), TopologyError> {
        let dlq_name = dead_letter_queue(queue_name);

        self.declare_durable(queue_name).await?;
        self.declare_durable(&dlq_name).await?;

        info!(queue = %queue_name, dlq = %dlq_name, "Queue topology ready");

        Ok(())
    }

    async fn declare_durable(&self, queue_name: &str) -> Result<(), TopologyError> {
        self.channel
            .queue_declare(
                queue_name,
                QueueDeclareOptions {
                    durable: true,
                    ..Default::default()
                },
                FieldTable::default(),
            )
            .await
            .map_err(|e| classify_declare_error(queue_name, &e))?;

        debug!(queue = %queue_name, "Queue declared");

        Ok(())
    }

    /// Number of ready messages in an existing queue.
    pub async fn queue_depth(&self, queue_name: &str) -> Result<u32, TopologyError> {
        let queue = self
            .channel
            .queue_declare(
                queue_name,
                QueueDeclareOptions {
                    passive: true,
                    ..Default::default()
                },
                FieldTable::default(),
            )
            .await
            .map_err(|e| classify_declare_error(queue_name, &e))?;

        Ok(queue.message_count())
    }

    pub async fn set_prefetch(&self, prefetch_count: u16) -> Result<(), ConnectionError> {
        self.channel
            .basic_qos(prefetch_count, BasicQosOptions::default())
            .await
            .map_err(|e| ConnectionError::Lost(format!("failed to set QoS: {e}")))?;

        debug!(prefetch_count, "Prefetch count set");

        Ok(())
    }

    /// Starts a manual-ack consumer on the primary queue.
    pub async fn create_consumer(&self) -> Result<Consumer, ConnectionError> {
        let consumer_tag = format!("email_worker_{}", Uuid::new_v4());

        let consumer = self
            .channel
            .basic_consume(
                &self.queue_name,
                &consumer_tag,
                BasicConsumeOptions::default(),
                FieldTable::default(),
            )
            .await
            .map_err(|e| ConnectionError::Lost(format!("failed to create consumer: {e}")))?;

        info!(queue = %self.queue_name, consumer_tag = %consumer_tag, "Consumer created");

        Ok(consumer)
    }

    /// Publishes a raw body to `routing_key` through the default exchange and
    /// waits for the broker's confirm.
    pub async fn publish_bytes(
        &self,
        routing_key: &str,
        body: &[u8],
        properties: BasicProperties,
    ) -> Result<(), PublishError> {
        let confirm = self
            .channel
            .basic_publish(
                "",
                routing_key,
                BasicPublishOptions::default(),
                body,
                properties.with_delivery_mode(PERSISTENT),
            )
            .await
            .map_err(|e| PublishError::Rejected(e.to_string()))?
            .await
            .map_err(|e| PublishError::Rejected(e.to_string()))?;

        if confirm.is_nack() {
            return Err(PublishError::Rejected(format!(
                "broker nacked publish to '{routing_key}'"
            )));
        }

        Ok(())
    }

    pub fn is_open(&self) -> bool {
        self.connection.status().connected()
    }

    pub async fn close(&self) {
        if !self.is_open() {
            return;
        }

        match self.connection.close(200, "Normal shutdown").await {
            Ok(()) => info!("RabbitMQ connection closed"),
            Err(e) => warn!(error = %e, "Failed to close RabbitMQ connection cleanly"),
        }
    }
}

#[async_trait]
impl JobPublisher for RabbitMqClient {
    async fn publish(&self, job: &EmailJob) -> Result<(), PublishError> {
        let body = job.to_vec()?;
        let message_id = Uuid::new_v4().to_string();

        let properties = BasicProperties::default()
            .with_content_type("application/json".into())
            .with_message_id(message_id.clone().into());

        self.publish_bytes(&self.queue_name, &body, properties).await?;

        debug!(
            queue = %self.queue_name,
            message_id = %message_id,
            job_type = %job.job_type(),
            "Job published"
        );

        Ok(())
    }

    async fn is_connected(&self) -> bool {
        self.is_open()
    }
}

#[async_trait]
impl DeliveryAcker for RabbitMqClient {
    async fn ack(&self, delivery_tag: u64) -> Result<(), BrokerError> {
        self.channel
            .basic_ack(delivery_tag, BasicAckOptions::default())
            .await
            .map_err(|e| BrokerError(format!("ack failed: {e}")))
    }

    async fn reject(&self, delivery_tag: u64, requeue: bool) -> Result<(), BrokerError> {
        self.channel
            .basic_reject(delivery_tag, BasicRejectOptions { requeue })
            .await
            .map_err(|e| BrokerError(format!("reject failed: {e}")))
    }

    async fn dead_letter(
        &self,
        body: &[u8],
        reason: &str,
        redelivery_count: u32,
    ) -> Result<(), BrokerError> {
        let mut headers = FieldTable::default();
        headers.insert(
            REDELIVERY_COUNT_HEADER.into(),
            AMQPValue::LongUInt(redelivery_count),
        );
        headers.insert(FAILURE_REASON_HEADER.into(), AMQPValue::LongString(reason.into()));

        let properties = BasicProperties::default().with_headers(headers);

        self.publish_bytes(&self.dlq_name, body, properties)
            .await
            .map_err(|e| BrokerError(format!("dead-letter publish failed: {e}")))
    }
}

/// Consumer side of a RabbitMQ connection, as driven by `Worker::run`.
pub struct ConsumerSession {
    client: RabbitMqClient,
    consumer: Option<Consumer>,
}

impl ConsumerSession {
    pub async fn connect(config: &Config) -> Result<Self, ConnectionError> {
        Ok(Self {
            client: RabbitMqClient::connect(config).await?,
            consumer: None,
        })
    }

    pub fn client(&self) -> &RabbitMqClient {
        &self.client
    }
}

#[async_trait]
impl DeliveryAcker for ConsumerSession {
    async fn ack(&self, delivery_tag: u64) -> Result<(), BrokerError> {
        self.client.ack(delivery_tag).await
    }

    async fn reject(&self, delivery_tag: u64, requeue: bool) -> Result<(), BrokerError> {
        self.client.reject(delivery_tag, requeue).await
    }

    async fn dead_letter(
        &self,
        body: &[u8],
        reason: &str,
        redelivery_count: u32,
    ) -> Result<(), BrokerError> {
        self.client.dead_letter(body, reason, redelivery_count).await
    }
}

#[async_trait]
impl BrokerSession for ConsumerSession {
    async fn start(&mut self, queue_name: &str, prefetch_count: u16) -> Result<(), WorkerError> {
        self.client.ensure_topology(queue_name).await?;
        self.client.set_prefetch(prefetch_count).await?;
        self.consumer = Some(self.client.create_consumer().await?);

        Ok(())
    }

    async fn next_delivery(&mut self) -> Option<Result<Delivery, ConnectionError>> {
        let consumer = self.consumer.as_mut()?;
        let next = consumer.next().await?;

        Some(
            next.map(to_delivery)
                .map_err(|e| ConnectionError::Lost(e.to_string())),
        )
    }

    async fn close(&self) {
        self.client.close().await;
    }
}

/// Converts a lapin delivery into the pipeline's own envelope.
pub fn to_delivery(delivery: AmqpDelivery) -> Delivery {
    let properties = &delivery.properties;

    let message_id = properties
        .message_id()
        .as_ref()
        .map(|id| id.as_str().to_string());

    let redelivery_count = properties
        .headers()
        .as_ref()
        .and_then(|headers| {
            headers
                .inner()
                .iter()
                .find(|(key, _)| key.as_str() == REDELIVERY_COUNT_HEADER)
                .and_then(|(_, value)| header_as_u32(value))
        })
        .unwrap_or(0);

    Delivery {
        delivery_tag: delivery.delivery_tag,
        redelivered: delivery.redelivered,
        body: delivery.data,
        message_id,
        redelivery_count,
    }
}

fn header_as_u32(value: &AMQPValue) -> Option<u32> {
    match value {
        AMQPValue::ShortShortUInt(n) => Some(u32::from(*n)),
        AMQPValue::ShortUInt(n) => Some(u32::from(*n)),
        AMQPValue::LongUInt(n) => Some(*n),
        AMQPValue::ShortShortInt(n) => u32::try_from(*n).ok(),
        AMQPValue::ShortInt(n) => u32::try_from(*n).ok(),
        AMQPValue::LongInt(n) => u32::try_from(*n).ok(),
        AMQPValue::LongLongInt(n) => u32::try_from(*n).ok(),
        _ => None,
    }
}

/// A declare refused with PRECONDITION_FAILED means the queue exists with
/// different arguments.
fn classify_declare_error(queue_name: &str, error: &lapin::Error) -> TopologyError {
    let reason = error.to_string();

    if reason.contains("PRECONDITION") || reason.contains("inequivalent") {
        TopologyError::Conflict {
            queue: queue_name.to_string(),
            reason,
        }
    } else {
        TopologyError::Broker {
            queue: queue_name.to_string(),
            reason,
        }
    }
}
