use std::{
    collections::VecDeque,
    sync::{
        Arc, Mutex,
        atomic::{AtomicBool, AtomicU32, AtomicUsize, Ordering},
    },
};

use async_trait::async_trait;
use email_queue::{
    clients::broker::{BrokerSession, DeliveryAcker, JobPublisher},
    models::{
        delivery::Delivery,
        error::{
            BrokerError, ConnectionError, ProcessingError, PublishError, TopologyError,
            WorkerError,
        },
        job::EmailJob,
    },
    worker::JobHandler,
};
use tokio::time::Instant;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeadLetter {
    pub body: Vec<u8>,
    pub reason: String,
    pub redelivery_count: u32,
}

#[derive(Default)]
struct BrokerState {
    queue: VecDeque<Delivery>,
    next_tag: u64,
    acks: Vec<u64>,
    rejects: Vec<(u64, bool)>,
    dead_letters: Vec<DeadLetter>,
}

/// In-memory broker: publishes land in a queue, consumers pop deliveries and
/// every ack, reject and dead-letter call is recorded.
pub struct FakeBroker {
    state: Mutex<BrokerState>,
    connected: AtomicBool,
    reject_publishes: AtomicBool,
    fail_dead_letters: AtomicBool,
}

impl FakeBroker {
    pub fn new() -> Self {
        Self {
            state: Mutex::new(BrokerState::default()),
            connected: AtomicBool::new(true),
            reject_publishes: AtomicBool::new(false),
            fail_dead_letters: AtomicBool::new(false),
        }
    }

    pub fn disconnected() -> Self {
        let broker = Self::new();
        broker.connected.store(false, Ordering::SeqCst);
        broker
    }

    pub fn reject_publishes(&self) {
        self.reject_publishes.store(true, Ordering::SeqCst);
    }

    pub fn fail_dead_letters(&self) {
        self.fail_dead_letters.store(true, Ordering::SeqCst);
    }

    pub fn enqueue_raw(&self, body: impl Into<Vec<u8>>) -> u64 {
        let mut state = self.state.lock().unwrap();
        state.next_tag += 1;
        let tag = state.next_tag;
        state.queue.push_back(Delivery::new(tag, body));
        tag
    }

    pub fn enqueue(&self, delivery: Delivery) {
        self.state.lock().unwrap().queue.push_back(delivery);
    }

    pub fn next_delivery(&self) -> Option<Delivery> {
        self.state.lock().unwrap().queue.pop_front()
    }

    pub fn depth(&self) -> usize {
        self.state.lock().unwrap().queue.len()
    }

    pub fn acks(&self) -> Vec<u64> {
        self.state.lock().unwrap().acks.clone()
    }

    pub fn rejects(&self) -> Vec<(u64, bool)> {
        self.state.lock().unwrap().rejects.clone()
    }

    pub fn dead_letters(&self) -> Vec<DeadLetter> {
        self.state.lock().unwrap().dead_letters.clone()
    }
}

#[async_trait]
impl JobPublisher for FakeBroker {
    async fn publish(&self, job: &EmailJob) -> Result<(), PublishError> {
        if !self.connected.load(Ordering::SeqCst) {
            return Err(PublishError::NotConnected);
        }
        if self.reject_publishes.load(Ordering::SeqCst) {
            return Err(PublishError::Rejected("queue is full".to_string()));
        }

        self.enqueue_raw(job.to_vec()?);
        Ok(())
    }

    async fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl DeliveryAcker for FakeBroker {
    async fn ack(&self, delivery_tag: u64) -> Result<(), BrokerError> {
        self.state.lock().unwrap().acks.push(delivery_tag);
        Ok(())
    }

    async fn reject(&self, delivery_tag: u64, requeue: bool) -> Result<(), BrokerError> {
        self.state.lock().unwrap().rejects.push((delivery_tag, requeue));
        Ok(())
    }

    async fn dead_letter(
        &self,
        body: &[u8],
        reason: &str,
        redelivery_count: u32,
    ) -> Result<(), BrokerError> {
        if self.fail_dead_letters.load(Ordering::SeqCst) {
            return Err(BrokerError("dlq unavailable".to_string()));
        }

        self.state.lock().unwrap().dead_letters.push(DeadLetter {
            body: body.to_vec(),
            reason: reason.to_string(),
            redelivery_count,
        });
        Ok(())
    }
}

/// How a scripted session finishes once its deliveries are used up.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionEnd {
    /// The channel fails with a lost connection.
    Lost,
    /// The broker cancels the consumer.
    Ended,
    /// Nothing more arrives until the worker shuts down.
    Idle,
}

#[derive(Debug, Clone)]
pub struct SessionScript {
    pub bodies: Vec<Vec<u8>>,
    pub end: SessionEnd,
    pub start_error: Option<TopologyError>,
}

impl SessionScript {
    pub fn new(bodies: Vec<Vec<u8>>, end: SessionEnd) -> Self {
        Self {
            bodies,
            end,
            start_error: None,
        }
    }

    pub fn failing_start(error: TopologyError) -> Self {
        Self {
            bodies: Vec::new(),
            end: SessionEnd::Ended,
            start_error: Some(error),
        }
    }
}

#[derive(Debug, Clone)]
pub enum ConnectStep {
    Refuse,
    Open(SessionScript),
}

/// Connector that plays back a list of connect outcomes, then refuses forever.
#[derive(Clone)]
pub struct ScriptedConnector {
    broker: Arc<FakeBroker>,
    steps: Arc<Mutex<VecDeque<ConnectStep>>>,
    attempt_times: Arc<Mutex<Vec<Instant>>>,
    closes: Arc<AtomicU32>,
}

impl ScriptedConnector {
    pub fn new(broker: Arc<FakeBroker>, steps: Vec<ConnectStep>) -> Self {
        Self {
            broker,
            steps: Arc::new(Mutex::new(steps.into())),
            attempt_times: Arc::new(Mutex::new(Vec::new())),
            closes: Arc::new(AtomicU32::new(0)),
        }
    }

    pub async fn connect(&self) -> Result<FakeSession, ConnectionError> {
        self.attempt_times.lock().unwrap().push(Instant::now());

        match self.steps.lock().unwrap().pop_front() {
            Some(ConnectStep::Open(script)) => Ok(FakeSession {
                broker: Arc::clone(&self.broker),
                deliveries: script
                    .bodies
                    .into_iter()
                    .enumerate()
                    .map(|(index, body)| Delivery::new(index as u64 + 1, body))
                    .collect(),
                end: script.end,
                start_error: script.start_error,
                closes: Arc::clone(&self.closes),
            }),
            _ => Err(ConnectionError::Lost("connection refused".to_string())),
        }
    }

    pub fn attempts(&self) -> usize {
        self.attempt_times.lock().unwrap().len()
    }

    pub fn attempt_times(&self) -> Vec<Instant> {
        self.attempt_times.lock().unwrap().clone()
    }

    pub fn closes(&self) -> u32 {
        self.closes.load(Ordering::SeqCst)
    }
}

pub struct FakeSession {
    broker: Arc<FakeBroker>,
    deliveries: VecDeque<Delivery>,
    end: SessionEnd,
    start_error: Option<TopologyError>,
    closes: Arc<AtomicU32>,
}

#[async_trait]
impl DeliveryAcker for FakeSession {
    async fn ack(&self, delivery_tag: u64) -> Result<(), BrokerError> {
        self.broker.ack(delivery_tag).await
    }

    async fn reject(&self, delivery_tag: u64, requeue: bool) -> Result<(), BrokerError> {
        self.broker.reject(delivery_tag, requeue).await
    }

    async fn dead_letter(
        &self,
        body: &[u8],
        reason: &str,
        redelivery_count: u32,
    ) -> Result<(), BrokerError> {
        self.broker.dead_letter(body, reason, redelivery_count).await
    }
}

#[async_trait]
impl BrokerSession for FakeSession {
    async fn start(&mut self, _queue_name: &str, _prefetch_count: u16) -> Result<(), WorkerError> {
        match self.start_error.take() {
            Some(error) => Err(WorkerError::Topology(error)),
            None => Ok(()),
        }
    }

    async fn next_delivery(&mut self) -> Option<Result<Delivery, ConnectionError>> {
        if let Some(delivery) = self.deliveries.pop_front() {
            return Some(Ok(delivery));
        }

        match self.end {
            SessionEnd::Lost => Some(Err(ConnectionError::Lost("broker restarted".to_string()))),
            SessionEnd::Ended => None,
            SessionEnd::Idle => std::future::pending().await,
        }
    }

    async fn close(&self) {
        self.closes.fetch_add(1, Ordering::SeqCst);
    }
}

/// Handler that records every job and fails the first `failures` calls.
#[derive(Clone, Default)]
pub struct RecordingHandler {
    jobs: Arc<Mutex<Vec<EmailJob>>>,
    calls: Arc<AtomicUsize>,
    failures: usize,
}

impl RecordingHandler {
    pub fn succeeding() -> Self {
        Self::default()
    }

    pub fn failing() -> Self {
        Self::failing_times(usize::MAX)
    }

    pub fn failing_times(failures: usize) -> Self {
        Self {
            failures,
            ..Self::default()
        }
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    pub fn jobs(&self) -> Vec<EmailJob> {
        self.jobs.lock().unwrap().clone()
    }
}

#[async_trait]
impl JobHandler for RecordingHandler {
    async fn handle(&self, job: &EmailJob) -> Result<(), ProcessingError> {
        let call = self.calls.fetch_add(1, Ordering::SeqCst);
        self.jobs.lock().unwrap().push(job.clone());

        if call < self.failures {
            return Err(ProcessingError::new("smtp relay unavailable"));
        }

        Ok(())
    }
}

pub fn welcome_job() -> EmailJob {
    EmailJob::new("welcome_email", "a@b.com")
        .with_user_name("A")
        .with_subject("Hi")
        .with_message("Welcome")
}
