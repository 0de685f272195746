use std::sync::Arc;

use anyhow::{Error, Result};
use email_queue::{
    api::run_api_server, clients::publisher::BrokerPublisher, config::Config,
    utils::init_tracing,
};
use tracing::info;

#[tokio::main]
async fn main() -> Result<(), Error> {
    init_tracing();

    let config = Config::load()?;

    let publisher = Arc::new(BrokerPublisher::connect(&config).await);

    let served = run_api_server(&config, publisher.clone()).await;

    publisher.close().await;
    info!("Notification service stopped");

    served
}
