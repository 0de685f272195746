use async_trait::async_trait;
use tokio::sync::Mutex;
use tracing::{error, info, warn};

use crate::{
    clients::{broker::JobPublisher, rbmq::RabbitMqClient},
    config::Config,
    models::{error::PublishError, job::EmailJob},
};

/// The notification service's producer handle.
///
/// Holds at most one broker connection for the life of the process. Every
/// publish takes the lock, so concurrent requests never interleave frames on
/// the shared channel. If the connection could not be made at startup the
/// publisher stays disconnected and every publish fails fast.
pub struct BrokerPublisher {
    client: Mutex<Option<RabbitMqClient>>,
}

impl BrokerPublisher {
    /// Connects and declares the primary queue. Connection failure is logged
    /// and leaves the publisher disconnected rather than failing startup.
    pub async fn connect(config: &Config) -> Self {
        let client = match RabbitMqClient::connect(config).await {
            Ok(client) => match client.ensure_topology(&config.queue_name).await {
                Ok(()) => {
                    info!(queue = %config.queue_name, "Publisher connected to RabbitMQ");
                    Some(client)
                }
                Err(e) => {
                    error!(error = %e, "Publisher could not prepare queue topology");
                    client.close().await;
                    None
                }
            },
            Err(e) => {
                error!(error = %e, "Publisher could not connect to RabbitMQ");
                None
            }
        };

        Self {
            client: Mutex::new(client),
        }
    }

    pub fn disconnected() -> Self {
        Self {
            client: Mutex::new(None),
        }
    }

    pub async fn close(&self) {
        if let Some(client) = self.client.lock().await.take() {
            client.close().await;
        }
    }
}

#[async_trait]
impl JobPublisher for BrokerPublisher {
    async fn publish(&self, job: &EmailJob) -> Result<(), PublishError> {
        let guard = self.client.lock().await;
        let client = guard.as_ref().ok_or(PublishError::NotConnected)?;

        if !client.is_open() {
            warn!("Publish attempted on a closed RabbitMQ connection");
            return Err(PublishError::NotConnected);
        }

        client.publish(job).await
    }

    async fn is_connected(&self) -> bool {
        self.client
            .lock()
            .await
            .as_ref()
            .is_some_and(|client| client.is_open())
    }
}
