use anyhow::{Error, Result};
use email_queue::{
    clients::rbmq::ConsumerSession,
    config::Config,
    utils::{init_tracing, shutdown_signal},
    worker::{SimulatedEmailSender, Worker},
};
use tracing::info;

#[tokio::main]
async fn main() -> Result<(), Error> {
    init_tracing();

    let config = Config::load()?;

    info!(
        queue = %config.queue_name,
        dlq = %config.dlq_name(),
        max_redeliveries = config.max_redeliveries,
        "Starting email worker"
    );

    let handler = SimulatedEmailSender::new(config.processing_delay());
    let mut worker = Worker::new(handler, config.max_redeliveries);

    worker
        .run(&config, || ConsumerSession::connect(&config), shutdown_signal())
        .await?;

    info!("Email worker stopped");

    Ok(())
}
