use std::sync::Arc;

use axum::{
    Router,
    extract::State,
    http::StatusCode,
    response::{IntoResponse, Json, Response},
    routing::{get, post},
};
use chrono::{SecondsFormat, Utc};
use tokio::net::TcpListener;
use tower_http::trace::TraceLayer;
use tracing::{error, info, warn};

use crate::{
    clients::broker::JobPublisher,
    config::Config,
    models::{
        error::PublishError,
        health::{HealthCheckResponse, HealthStatus},
        job::{EmailJob, NotifyRequest},
        response::{QueueResponse, ServiceInfo},
    },
    utils::shutdown_signal,
};

pub struct AppState {
    publisher: Arc<dyn JobPublisher>,
}

pub fn router(publisher: Arc<dyn JobPublisher>) -> Router {
    let state = Arc::new(AppState { publisher });

    Router::new()
        .route("/", get(root))
        .route("/health", get(health_check))
        .route("/notify", post(notify))
        .route("/send-test-email", post(send_test_email))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

pub async fn run_api_server(
    config: &Config,
    publisher: Arc<dyn JobPublisher>,
) -> anyhow::Result<()> {
    let addr = format!("0.0.0.0:{}", config.server_port);
    let listener = TcpListener::bind(&addr).await?;

    info!(address = %addr, "Notification service started");

    axum::serve(listener, router(publisher))
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    Ok(())
}

/// Publish failures as HTTP responses. Nothing is retried here; the caller's
/// client decides whether to try again.
pub struct ApiError(PublishError);

impl From<PublishError> for ApiError {
    fn from(err: PublishError) -> Self {
        Self(err)
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = match self.0 {
            PublishError::NotConnected => StatusCode::SERVICE_UNAVAILABLE,
            PublishError::Rejected(_) | PublishError::Serialization(_) => {
                StatusCode::INTERNAL_SERVER_ERROR
            }
        };

        (status, Json(QueueResponse::error(self.0.to_string()))).into_response()
    }
}

async fn root() -> Json<ServiceInfo> {
    Json(ServiceInfo {
        service: "Notification Service".to_string(),
        status: "running".to_string(),
    })
}

async fn health_check(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    let health = HealthCheckResponse::from_connection(state.publisher.is_connected().await);

    let status_code = match health.status {
        HealthStatus::Healthy => StatusCode::OK,
        HealthStatus::Unhealthy => StatusCode::SERVICE_UNAVAILABLE,
    };

    (status_code, Json(health))
}

async fn notify(
    State(state): State<Arc<AppState>>,
    Json(request): Json<NotifyRequest>,
) -> Result<Json<QueueResponse>, ApiError> {
    let user_email = request.user_email.clone();
    let job = EmailJob::from(request)
        .with_timestamp(Utc::now().to_rfc3339_opts(SecondsFormat::Millis, true));

    if let Err(e) = state.publisher.publish(&job).await {
        warn!(user_email = %user_email, error = %e, "Failed to queue notification");
        return Err(e.into());
    }

    info!(user_email = %user_email, job_type = %job.job_type(), "Notification queued");

    Ok(Json(
        QueueResponse::success("Notification queued for delivery").with_user_email(user_email),
    ))
}

async fn send_test_email(
    State(state): State<Arc<AppState>>,
) -> Result<Json<QueueResponse>, ApiError> {
    let job = EmailJob::test_sample();

    if let Err(e) = state.publisher.publish(&job).await {
        error!(error = %e, "Failed to queue test email");
        return Err(e.into());
    }

    info!("Test email queued");

    Ok(Json(QueueResponse::success("Test email queued")))
}
