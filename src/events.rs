//! Platform event bus and event-stream message types

use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;

use crate::db::ServiceStatus;
use crate::lifecycle::ContainerStats;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AlertLevel {
    Info,
    Warning,
    Critical,
}

/// Messages pushed to event-stream clients
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case", rename_all_fields = "camelCase")]
pub enum Event {
    /// A build or container log line
    Log { service_id: String, message: String },
    Status {
        service_id: String,
        status: ServiceStatus,
    },
    Metrics {
        service_id: String,
        stats: ContainerStats,
    },
    Alert {
        service_id: String,
        message: String,
        level: AlertLevel,
    },
    ServiceDeleted { service_id: String },
    /// Recent container output, sent only to the client that subscribed
    LogHistory {
        service_id: String,
        logs: Vec<String>,
    },
}

impl Event {
    pub fn log(service_id: &str, message: impl Into<String>) -> Self {
        Event::Log {
            service_id: service_id.to_string(),
            message: message.into(),
        }
    }

    pub fn status(service_id: &str, status: ServiceStatus) -> Self {
        Event::Status {
            service_id: service_id.to_string(),
            status,
        }
    }

    pub fn service_id(&self) -> &str {
        match self {
            Event::Log { service_id, .. }
            | Event::Status { service_id, .. }
            | Event::Metrics { service_id, .. }
            | Event::Alert { service_id, .. }
            | Event::ServiceDeleted { service_id }
            | Event::LogHistory { service_id, .. } => service_id,
        }
    }
}

/// Messages sent by event-stream clients
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case", rename_all_fields = "camelCase")]
pub enum ClientMessage {
    SubscribeLogs { service_id: String },
    UnsubscribeLogs { service_id: String },
    GetMetrics { service_id: String },
}

/// Fan-out of platform events to every connected client.
///
/// Slow receivers lose the oldest events rather than stalling publishers.
#[derive(Clone)]
pub struct EventBus {
    sender: broadcast::Sender<Event>,
}

impl EventBus {
    pub fn new() -> Self {
        let (sender, _) = broadcast::channel(256);
        Self { sender }
    }

    pub fn publish(&self, event: Event) {
        let _ = self.sender.send(event);
    }

    pub fn subscribe(&self) -> broadcast::Receiver<Event> {
        self.sender.subscribe()
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_event_wire_format() {
        let json = serde_json::to_value(Event::status("svc-1", ServiceStatus::Running)).unwrap();
        assert_eq!(json["type"], "status");
        assert_eq!(json["serviceId"], "svc-1");
        assert_eq!(json["status"], "running");

        let json = serde_json::to_value(Event::Alert {
            service_id: "svc-1".to_string(),
            message: "Memory usage at 95%".to_string(),
            level: AlertLevel::Warning,
        })
        .unwrap();
        assert_eq!(json["type"], "alert");
        assert_eq!(json["level"], "warning");

        let json = serde_json::to_value(Event::ServiceDeleted {
            service_id: "svc-2".to_string(),
        })
        .unwrap();
        assert_eq!(json["type"], "service_deleted");
    }

    #[test]
    fn test_client_message_parse() {
        let msg: ClientMessage =
            serde_json::from_str(r#"{"type":"subscribe_logs","serviceId":"abc"}"#).unwrap();
        assert_eq!(
            msg,
            ClientMessage::SubscribeLogs {
                service_id: "abc".to_string()
            }
        );
        assert!(serde_json::from_str::<ClientMessage>(r#"{"type":"reboot"}"#).is_err());
    }

    #[tokio::test]
    async fn test_bus_fan_out() {
        let bus = EventBus::new();
        let mut a = bus.subscribe();
        let mut b = bus.subscribe();

        bus.publish(Event::log("svc", "hello"));

        assert_eq!(a.recv().await.unwrap(), Event::log("svc", "hello"));
        assert_eq!(b.recv().await.unwrap().service_id(), "svc");
    }

    #[test]
    fn test_publish_without_subscribers() {
        EventBus::new().publish(Event::log("svc", "nobody listening"));
    }
}
