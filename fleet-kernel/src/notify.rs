/**
 * NOTIFICATIONS - Publication des événements de la flotte
 *
 * ROLE :
 * Diffuse les événements du kernel (fin de sweep, changement de statut,
 * config mise à jour, action de service) sur MQTT quand un broker est
 * configuré. Sans broker, les événements sont simplement ignorés.
 *
 * Topics : `<prefix>/<event>@v1`, payload JSON.
 */

use async_trait::async_trait;
use rumqttc::{AsyncClient, Event, Incoming, MqttOptions, QoS};
use serde::Serialize;
use std::time::Duration;
use time::OffsetDateTime;
use tokio::task;
use tracing::{debug, info, warn};

use crate::config::MqttConf;
use crate::health::HealthTracker;
use crate::models::HostStatus;
use crate::sweep::SweepReport;

#[derive(Debug, Clone, Serialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum FleetEvent {
    SweepCompleted {
        report: SweepReport,
    },
    StatusChanged {
        host: String,
        old_status: HostStatus,
        new_status: HostStatus,
        #[serde(with = "time::serde::rfc3339")]
        at: OffsetDateTime,
    },
    ConfigUpdated {
        host: String,
        path: String,
        backup_path: String,
    },
    ServiceAction {
        host: String,
        action: String,
        message: String,
    },
    CheckRequested {
        host: String,
        status: HostStatus,
    },
}

impl FleetEvent {
    pub fn name(&self) -> &'static str {
        match self {
            FleetEvent::SweepCompleted { .. } => "sweep_completed",
            FleetEvent::StatusChanged { .. } => "status_changed",
            FleetEvent::ConfigUpdated { .. } => "config_updated",
            FleetEvent::ServiceAction { .. } => "service_action",
            FleetEvent::CheckRequested { .. } => "check_requested",
        }
    }

    pub fn topic(&self, prefix: &str) -> String {
        format!("{}/{}@v1", prefix.trim_end_matches('/'), self.name())
    }
}

#[async_trait]
pub trait EventNotifier: Send + Sync {
    /// Best effort: delivery failures are logged, never returned.
    async fn notify(&self, event: FleetEvent);
}

/// One `status_changed` per committed transition, then `sweep_completed`.
pub async fn publish_sweep(notifier: &dyn EventNotifier, report: &SweepReport) {
    for transition in &report.transitions {
        notifier
            .notify(FleetEvent::StatusChanged {
                host: transition.host.clone(),
                old_status: transition.old_status,
                new_status: transition.new_status,
                at: transition.at,
            })
            .await;
    }
    notifier
        .notify(FleetEvent::SweepCompleted { report: report.clone() })
        .await;
}

#[derive(Debug, Clone, Copy, Default)]
pub struct NoopNotifier;

#[async_trait]
impl EventNotifier for NoopNotifier {
    async fn notify(&self, event: FleetEvent) {
        debug!("[notify] no broker configured, dropping {}", event.name());
    }
}

const REQUEST_QUEUE: usize = 32;

pub struct MqttNotifier {
    client: AsyncClient,
    topic_prefix: String,
}

impl MqttNotifier {
    /// Connects to the broker and drives its event loop on a background task.
    pub fn spawn(conf: &MqttConf, health: HealthTracker) -> Self {
        let mut opts = MqttOptions::new("fleet-kernel", &conf.host, conf.port);
        opts.set_keep_alive(Duration::from_secs(15));
        let (client, mut eventloop) = AsyncClient::new(opts, REQUEST_QUEUE);

        health.mark_mqtt_connecting();
        let broker = format!("{}:{}", conf.host, conf.port);
        task::spawn(async move {
            loop {
                match eventloop.poll().await {
                    Ok(Event::Incoming(Incoming::ConnAck(_))) => {
                        info!("[notify] connected to MQTT broker {}", broker);
                        health.mark_mqtt_connected();
                    }
                    Ok(Event::Incoming(Incoming::Disconnect)) => health.mark_mqtt_disconnected(),
                    Ok(_) => {}
                    Err(e) => {
                        warn!("[notify] MQTT error: {:?}", e);
                        health.increment_reconnects();
                        tokio::time::sleep(Duration::from_secs(2)).await;
                    }
                }
            }
        });

        Self {
            client,
            topic_prefix: conf.topic_prefix.clone(),
        }
    }
}

#[async_trait]
impl EventNotifier for MqttNotifier {
    async fn notify(&self, event: FleetEvent) {
        let topic = event.topic(&self.topic_prefix);
        let payload = match serde_json::to_vec(&event) {
            Ok(payload) => payload,
            Err(e) => {
                warn!("[notify] cannot serialize {}: {}", event.name(), e);
                return;
            }
        };
        // never wait on the request queue: it stops draining while the broker is away
        match self.client.try_publish(topic.as_str(), QoS::AtLeastOnce, false, payload) {
            Ok(()) => debug!("[notify] published {}", topic),
            Err(e) => warn!("[notify] dropped {} (broker unavailable or queue full): {}", topic, e),
        }
    }
}
