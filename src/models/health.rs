use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum HealthStatus {
    Healthy,
    Unhealthy,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum BrokerStatus {
    Connected,
    Disconnected,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct HealthCheckResponse {
    pub status: HealthStatus,
    pub rabbitmq: BrokerStatus,
}

impl HealthCheckResponse {
    pub fn from_connection(connected: bool) -> Self {
        if connected {
            Self {
                status: HealthStatus::Healthy,
                rabbitmq: BrokerStatus::Connected,
            }
        } else {
            Self {
                status: HealthStatus::Unhealthy,
                rabbitmq: BrokerStatus::Disconnected,
            }
        }
    }
}
