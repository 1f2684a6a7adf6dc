use std::collections::HashMap;
use std::ops::Add;
use std::sync::{Arc, RwLock};

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use time::{Duration, OffsetDateTime};
use tokio::sync::mpsc;
use tracing::{debug, warn};

/// Liveness of the worker's long-running loops.
///
/// Each loop (the Kafka consumer, the history flusher) registers a component and must keep
/// reporting before its deadline. The process is live only when every registered component
/// is, and a registry with no components is not live.
#[derive(Default, Debug)]
pub struct HealthStatus {
    pub healthy: bool,
    pub components: HashMap<String, ComponentStatus>,
}

impl IntoResponse for HealthStatus {
    fn into_response(self) -> Response {
        let body = format!("{:?}", self);
        let code = if self.healthy {
            StatusCode::OK
        } else {
            StatusCode::INTERNAL_SERVER_ERROR
        };
        (code, body).into_response()
    }
}

#[derive(Debug, Clone, Eq, PartialEq)]
pub enum ComponentStatus {
    Starting,
    HealthyUntil(OffsetDateTime),
    Unhealthy,
    /// Set when a `HealthyUntil` deadline has passed.
    Stalled,
}

struct StatusUpdate {
    component: String,
    status: ComponentStatus,
}

#[derive(Clone)]
pub struct HealthHandle {
    component: String,
    deadline: Duration,
    sender: mpsc::Sender<StatusUpdate>,
}

impl HealthHandle {
    /// Must be called more often than the deadline the component registered with.
    pub async fn report_healthy(&self) {
        let until = OffsetDateTime::now_utc().add(self.deadline);
        self.report_status(ComponentStatus::HealthyUntil(until)).await
    }

    pub async fn report_status(&self, status: ComponentStatus) {
        let update = StatusUpdate {
            component: self.component.clone(),
            status,
        };
        if let Err(err) = self.sender.send(update).await {
            warn!("failed to report {} health: {}", self.component, err)
        }
    }

    /// For callers outside the async runtime, such as librdkafka callbacks.
    pub fn report_healthy_blocking(&self) {
        let update = StatusUpdate {
            component: self.component.clone(),
            status: ComponentStatus::HealthyUntil(OffsetDateTime::now_utc().add(self.deadline)),
        };
        if let Err(err) = self.sender.blocking_send(update) {
            warn!("failed to report {} health: {}", self.component, err)
        }
    }
}

#[derive(Clone)]
pub struct HealthRegistry {
    name: String,
    components: Arc<RwLock<HashMap<String, ComponentStatus>>>,
    sender: mpsc::Sender<StatusUpdate>,
}

impl HealthRegistry {
    /// Must be called from within a tokio runtime: status updates are applied by a spawned task.
    pub fn new(name: &str) -> Self {
        let (sender, mut receiver) = mpsc::channel::<StatusUpdate>(16);
        let components: Arc<RwLock<HashMap<String, ComponentStatus>>> = Default::default();

        let writer = components.clone();
        tokio::spawn(async move {
            while let Some(update) = receiver.recv().await {
                match writer.write() {
                    Ok(mut map) => {
                        map.insert(update.component, update.status);
                    }
                    Err(_) => warn!("health registry lock poisoned"),
                }
            }
        });

        Self {
            name: name.to_owned(),
            components,
            sender,
        }
    }

    pub async fn register(&self, component: &str, deadline: Duration) -> HealthHandle {
        let handle = HealthHandle {
            component: component.to_owned(),
            deadline,
            sender: self.sender.clone(),
        };
        handle.report_status(ComponentStatus::Starting).await;
        handle
    }

    /// Usable directly as an axum handler.
    pub fn get_status(&self) -> HealthStatus {
        let components = match self.components.read() {
            Ok(components) => components,
            Err(_) => {
                warn!("{} health registry lock poisoned", self.name);
                return HealthStatus::default();
            }
        };

        let now = OffsetDateTime::now_utc();
        let mut status = HealthStatus {
            healthy: !components.is_empty(),
            components: HashMap::with_capacity(components.len()),
        };
        for (name, component) in components.iter() {
            let component = match component {
                ComponentStatus::HealthyUntil(until) if *until > now => component.clone(),
                ComponentStatus::HealthyUntil(_) => ComponentStatus::Stalled,
                other => other.clone(),
            };
            if !matches!(component, ComponentStatus::HealthyUntil(_)) {
                status.healthy = false;
            }
            status.components.insert(name.clone(), component);
        }

        if status.healthy {
            debug!("{} health check ok", self.name);
        } else {
            warn!("{} health check failed: {:?}", self.name, status.components);
        }
        status
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::ops::Sub;

    async fn eventually<F: Fn() -> bool>(check: F) {
        let deadline = OffsetDateTime::now_utc().add(Duration::seconds(5));
        while !check() && OffsetDateTime::now_utc() < deadline {
            tokio::time::sleep(std::time::Duration::from_millis(50)).await;
        }
        assert!(check())
    }

    #[tokio::test]
    async fn empty_registry_is_not_live() {
        let registry = HealthRegistry::new("liveness");
        assert!(!registry.get_status().healthy);
    }

    #[tokio::test]
    async fn every_loop_must_report() {
        let registry = HealthRegistry::new("liveness");
        let consumer = registry
            .register("kafka_consumer", Duration::seconds(30))
            .await;
        let flusher = registry
            .register("history_flusher", Duration::seconds(30))
            .await;
        eventually(|| registry.get_status().components.len() == 2).await;
        assert!(!registry.get_status().healthy);

        consumer.report_healthy().await;
        flusher.report_healthy().await;
        eventually(|| registry.get_status().healthy).await;

        flusher.report_status(ComponentStatus::Unhealthy).await;
        eventually(|| !registry.get_status().healthy).await;
        assert_eq!(
            registry.get_status().components.get("history_flusher"),
            Some(&ComponentStatus::Unhealthy)
        );
    }

    #[tokio::test]
    async fn missed_deadline_stalls() {
        let registry = HealthRegistry::new("liveness");
        let consumer = registry
            .register("kafka_consumer", Duration::seconds(30))
            .await;

        consumer
            .report_status(ComponentStatus::HealthyUntil(
                OffsetDateTime::now_utc().sub(Duration::seconds(1)),
            ))
            .await;
        eventually(|| {
            registry.get_status().components.get("kafka_consumer")
                == Some(&ComponentStatus::Stalled)
        })
        .await;
        assert!(!registry.get_status().healthy);
    }

    #[test]
    fn status_maps_to_http_codes() {
        assert_eq!(
            HealthStatus::default().into_response().status(),
            StatusCode::INTERNAL_SERVER_ERROR
        );
        let live = HealthStatus {
            healthy: true,
            components: HashMap::new(),
        };
        assert_eq!(live.into_response().status(), StatusCode::OK);
    }
}
