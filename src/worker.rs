//! Consumer loop for the email queue.
//!
//! One worker owns one connection and one channel with prefetch 1, so at most
//! a single delivery is in flight and it is always resolved (ack or reject)
//! before the next one is read. Scaling out means running more worker
//! processes; the broker arbitrates between them.

use std::{
    collections::{HashMap, VecDeque},
    future::Future,
    time::Duration,
};

use async_trait::async_trait;
use tokio::time::sleep;
use tracing::{debug, error, info, warn};

use crate::{
    clients::broker::{BrokerSession, DeliveryAcker},
    config::Config,
    models::{
        delivery::{Delivery, Disposition},
        error::{BrokerError, ConnectionError, ProcessingError, TopologyError, WorkerError},
        job::EmailJob,
    },
    utils::{PREVIEW_LIMIT, body_preview, connect_with_retry},
};

/// Messages whose failure counts are remembered at once.
pub const TRACKER_CAPACITY: usize = 1024;

/// Performs the side effect for a decoded job. Knows nothing about deliveries.
#[async_trait]
pub trait JobHandler: Send + Sync {
    async fn handle(&self, job: &EmailJob) -> Result<(), ProcessingError>;
}

/// Stand-in for a real mail transport: logs the job and waits a fixed time.
pub struct SimulatedEmailSender {
    delay: Duration,
}

impl SimulatedEmailSender {
    pub fn new(delay: Duration) -> Self {
        Self { delay }
    }
}

#[async_trait]
impl JobHandler for SimulatedEmailSender {
    async fn handle(&self, job: &EmailJob) -> Result<(), ProcessingError> {
        info!(
            user_email = %job.user_email(),
            subject = %job.subject(),
            user_name = %job.user_name(),
            job_type = %job.job_type(),
            "Sending email"
        );

        sleep(self.delay).await;

        Ok(())
    }
}

/// Handler failures per message, bounded in size. Oldest entries are evicted
/// first once the capacity is reached.
#[derive(Debug, Default)]
pub struct RedeliveryTracker {
    failures: HashMap<String, u32>,
    order: VecDeque<String>,
}

impl RedeliveryTracker {
    /// Records one more failure for `key` and returns the new total. `seed`
    /// is the count the message already carried in its headers.
    pub fn record_failure(&mut self, key: &str, seed: u32) -> u32 {
        if let Some(count) = self.failures.get_mut(key) {
            *count += 1;
            return *count;
        }

        if self.order.len() >= TRACKER_CAPACITY {
            if let Some(oldest) = self.order.pop_front() {
                self.failures.remove(&oldest);
            }
        }

        let count = seed.saturating_add(1);
        self.failures.insert(key.to_string(), count);
        self.order.push_back(key.to_string());
        count
    }

    pub fn forget(&mut self, key: &str) {
        if self.failures.remove(key).is_some() {
            self.order.retain(|tracked| tracked != key);
        }
    }

    pub fn failures(&self, key: &str) -> u32 {
        self.failures.get(key).copied().unwrap_or(0)
    }

    pub fn len(&self) -> usize {
        self.failures.len()
    }

    pub fn is_empty(&self) -> bool {
        self.failures.is_empty()
    }
}

pub struct Worker<H> {
    handler: H,
    max_redeliveries: u32,
    tracker: RedeliveryTracker,
}

impl<H: JobHandler> Worker<H> {
    pub fn new(handler: H, max_redeliveries: u32) -> Self {
        Self {
            handler,
            max_redeliveries,
            tracker: RedeliveryTracker::default(),
        }
    }

    pub fn tracker(&self) -> &RedeliveryTracker {
        &self.tracker
    }

    /// Resolves a single delivery.
    ///
    /// - undecodable body: dead-lettered, rejected without requeue, handler not called
    /// - handler success: acked
    /// - handler failure: rejected with requeue, or dead-lettered once the
    ///   message has failed `max_redeliveries` times
    ///
    /// Exactly one ack or reject is issued per call. An `Err` means the
    /// channel itself failed and the delivery is left to the broker.
    pub async fn process_delivery<A>(
        &mut self,
        acker: &A,
        delivery: Delivery,
    ) -> Result<Disposition, BrokerError>
    where
        A: DeliveryAcker + ?Sized,
    {
        let tag = delivery.delivery_tag;

        debug!(
            delivery_tag = tag,
            redelivered = delivery.redelivered,
            body_len = delivery.body.len(),
            "Delivery received"
        );

        let job = match EmailJob::from_slice(&delivery.body) {
            Ok(job) => job,
            Err(e) => {
                warn!(
                    delivery_tag = tag,
                    error = %e,
                    preview = %body_preview(&delivery.body, PREVIEW_LIMIT),
                    "Rejecting undecodable message"
                );
                return self.reject_malformed(acker, &delivery, &e.to_string()).await;
            }
        };

        let key = delivery.tracking_key();

        match self.handler.handle(&job).await {
            Ok(()) => {
                acker.ack(tag).await?;
                self.tracker.forget(&key);

                info!(
                    delivery_tag = tag,
                    user_email = %job.user_email(),
                    "Job processed"
                );

                Ok(Disposition::Acked)
            }
            Err(e) => {
                let failures = self.tracker.record_failure(&key, delivery.redelivery_count);

                if self.max_redeliveries > 0 && failures >= self.max_redeliveries {
                    error!(
                        delivery_tag = tag,
                        failures,
                        error = %e,
                        "Job keeps failing, moving it to the dead-letter queue"
                    );
                    return self.dead_letter_poison(acker, &delivery, &key, &e, failures).await;
                }

                warn!(
                    delivery_tag = tag,
                    failures,
                    error = %e,
                    "Job failed, requeueing"
                );

                acker.reject(tag, true).await?;
                Ok(Disposition::Requeued)
            }
        }
    }

    async fn reject_malformed<A>(
        &mut self,
        acker: &A,
        delivery: &Delivery,
        reason: &str,
    ) -> Result<Disposition, BrokerError>
    where
        A: DeliveryAcker + ?Sized,
    {
        let copied = match acker
            .dead_letter(&delivery.body, reason, delivery.redelivery_count)
            .await
        {
            Ok(()) => true,
            Err(e) => {
                error!(
                    delivery_tag = delivery.delivery_tag,
                    error = %e,
                    "Could not copy malformed message to the dead-letter queue, dropping it"
                );
                false
            }
        };

        acker.reject(delivery.delivery_tag, false).await?;

        Ok(if copied {
            Disposition::DeadLettered
        } else {
            Disposition::Discarded
        })
    }

    async fn dead_letter_poison<A>(
        &mut self,
        acker: &A,
        delivery: &Delivery,
        key: &str,
        failure: &ProcessingError,
        failures: u32,
    ) -> Result<Disposition, BrokerError>
    where
        A: DeliveryAcker + ?Sized,
    {
        if let Err(e) = acker
            .dead_letter(&delivery.body, &failure.to_string(), failures)
            .await
        {
            // Not in the DLQ yet, so keep it in the primary queue.
            error!(
                delivery_tag = delivery.delivery_tag,
                error = %e,
                "Dead-letter publish failed, requeueing instead"
            );
            acker.reject(delivery.delivery_tag, true).await?;
            return Ok(Disposition::Requeued);
        }

        acker.reject(delivery.delivery_tag, false).await?;
        self.tracker.forget(key);

        Ok(Disposition::DeadLettered)
    }

    /// Runs the consumer until `shutdown` resolves, opening sessions with
    /// `connect` (`ConsumerSession::connect` in production).
    ///
    /// The first connect uses the bounded policy and its exhaustion is fatal.
    /// After that, a lost connection is re-established after
    /// `reconnect_delay_ms`, forever. A topology conflict stops the worker;
    /// any other declare failure is handled like a lost connection.
    pub async fn run<C, Fut, S, F>(
        &mut self,
        config: &Config,
        mut connect: C,
        shutdown: F,
    ) -> Result<(), WorkerError>
    where
        C: FnMut() -> Fut,
        Fut: Future<Output = Result<S, ConnectionError>>,
        S: BrokerSession,
        F: Future<Output = ()>,
    {
        tokio::pin!(shutdown);

        let connect_policy = config.connect_policy();
        let reconnect_policy = config.reconnect_policy();

        let mut session = tokio::select! {
            _ = &mut shutdown => return Ok(()),
            session = connect_with_retry(&connect_policy, &mut connect) => session?,
        };

        loop {
            let outcome = tokio::select! {
                _ = &mut shutdown => None,
                result = self.consume(config, &mut session) => Some(result),
            };

            let Some(result) = outcome else {
                info!("Stopping worker");
                session.close().await;
                return Ok(());
            };

            match result {
                Err(WorkerError::Topology(e @ TopologyError::Conflict { .. })) => {
                    error!(error = %e, "Queue topology conflict, stopping worker");
                    session.close().await;
                    return Err(WorkerError::Topology(e));
                }
                Err(e) => warn!(error = %e, "Consumer interrupted"),
                Ok(()) => warn!("Consumer stream ended"),
            }

            session.close().await;

            let reconnect = async {
                sleep(config.reconnect_delay()).await;
                connect_with_retry(&reconnect_policy, &mut connect).await
            };

            session = tokio::select! {
                _ = &mut shutdown => {
                    info!("Stopping worker during reconnect");
                    return Ok(());
                }
                session = reconnect => session?,
            };
        }
    }

    /// One session's worth of consuming: topology, QoS, then deliveries
    /// until the stream ends or the channel fails.
    async fn consume<S>(&mut self, config: &Config, session: &mut S) -> Result<(), WorkerError>
    where
        S: BrokerSession,
    {
        session
            .start(&config.queue_name, config.prefetch_count)
            .await?;

        info!(
            queue = %config.queue_name,
            dlq = %config.dlq_name(),
            prefetch_count = config.prefetch_count,
            "Worker ready, waiting for jobs"
        );

        // Blocks here until the broker hands over the next delivery.
        while let Some(next) = session.next_delivery().await {
            let delivery = next?;
            let disposition = self.process_delivery(&*session, delivery).await?;

            debug!(?disposition, "Delivery resolved");
        }

        Ok(())
    }
}
