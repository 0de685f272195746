//! Seams between the pipeline and a concrete broker.
//!
//! The consumer loop only talks to a broker through [`BrokerSession`] and
//! [`DeliveryAcker`], and the HTTP layer only publishes through
//! [`JobPublisher`], so all of them can be driven by an in-memory broker in
//! tests.

use async_trait::async_trait;

use crate::models::{
    delivery::Delivery,
    error::{BrokerError, ConnectionError, PublishError, WorkerError},
    job::EmailJob,
};

#[async_trait]
pub trait DeliveryAcker: Send + Sync {
    /// Permanently removes the delivery from the queue.
    async fn ack(&self, delivery_tag: u64) -> Result<(), BrokerError>;

    /// Hands the delivery back to the broker, optionally for redelivery.
    async fn reject(&self, delivery_tag: u64, requeue: bool) -> Result<(), BrokerError>;

    /// Copies a message body to the dead-letter queue.
    async fn dead_letter(
        &self,
        body: &[u8],
        reason: &str,
        redelivery_count: u32,
    ) -> Result<(), BrokerError>;
}

#[async_trait]
pub trait JobPublisher: Send + Sync {
    /// Publishes a persistent job to the primary queue. Returns once the
    /// broker has accepted it; consumers are not waited for.
    async fn publish(&self, job: &EmailJob) -> Result<(), PublishError>;

    async fn is_connected(&self) -> bool;
}

/// One connection's worth of consuming.
#[async_trait]
pub trait BrokerSession: DeliveryAcker {
    /// Declares the topology, applies QoS and starts the consumer.
    async fn start(&mut self, queue_name: &str, prefetch_count: u16) -> Result<(), WorkerError>;

    /// Waits for the next delivery. `None` means the broker ended the stream.
    async fn next_delivery(&mut self) -> Option<Result<Delivery, ConnectionError>>;

    async fn close(&self);
}
