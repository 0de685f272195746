use std::{
    collections::hash_map::DefaultHasher,
    hash::{Hash, Hasher},
};

pub const REDELIVERY_COUNT_HEADER: &str = "x-redelivery-count";
pub const FAILURE_REASON_HEADER: &str = "x-failure-reason";

/// One broker hand-off of a queued message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Delivery {
    /// Opaque handle used to ack or reject exactly this delivery.
    pub delivery_tag: u64,
    /// Set by the broker when this message was delivered before without an ack.
    pub redelivered: bool,
    pub body: Vec<u8>,
    pub message_id: Option<String>,
    /// Failures already recorded against this message, from `x-redelivery-count`.
    pub redelivery_count: u32,
}

impl Delivery {
    pub fn new(delivery_tag: u64, body: impl Into<Vec<u8>>) -> Self {
        Self {
            delivery_tag,
            redelivered: false,
            body: body.into(),
            message_id: None,
            redelivery_count: 0,
        }
    }

    /// Key identifying the message across redeliveries. Falls back to a hash
    /// of the body for producers that do not set a message id.
    pub fn tracking_key(&self) -> String {
        match &self.message_id {
            Some(id) => format!("id:{id}"),
            None => {
                let mut hasher = DefaultHasher::new();
                self.body.hash(&mut hasher);
                format!("body:{:016x}", hasher.finish())
            }
        }
    }
}

/// How the consumer resolved a delivery.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Disposition {
    /// Handled successfully and removed from the queue.
    Acked,
    /// Rejected with requeue for a later retry.
    Requeued,
    /// Copied to the dead-letter queue, then rejected without requeue.
    DeadLettered,
    /// Rejected without requeue after the dead-letter copy failed.
    Discarded,
}
