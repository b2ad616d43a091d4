/*!
Notifier enregistreur pour tests sans broker

Remplace le `MqttNotifier` : chaque `FleetEvent` est sérialisé comme il le
serait sur le fil et rangé avec son topic, pour assertions.
*/

use async_trait::async_trait;
use fleet_kernel::notify::{EventNotifier, FleetEvent};
use parking_lot::Mutex;
use serde_json::Value;
use std::sync::Arc;
use anyhow::Result;

#[derive(Debug, Clone)]
pub struct RecordedMessage {
    pub topic: String,
    pub payload: Vec<u8>,
}

#[derive(Clone)]
pub struct RecordingNotifier {
    topic_prefix: String,
    published_messages: Arc<Mutex<Vec<RecordedMessage>>>,
}

impl RecordingNotifier {
    pub fn new(topic_prefix: &str) -> Self {
        Self {
            topic_prefix: topic_prefix.to_string(),
            published_messages: Arc::new(Mutex::new(Vec::new())),
        }
    }

    pub fn get_published_messages(&self) -> Vec<RecordedMessage> {
        self.published_messages.lock().clone()
    }

    /// Trouve les messages publiés sur un topic donné
    pub fn find_messages_by_topic(&self, topic: &str) -> Vec<RecordedMessage> {
        self.published_messages
            .lock()
            .iter()
            .filter(|msg| msg.topic == topic)
            .cloned()
            .collect()
    }

    /// Parse le dernier message d'un topic en JSON
    pub fn get_last_json_message(&self, topic: &str) -> Result<Option<Value>> {
        match self.find_messages_by_topic(topic).last() {
            Some(msg) => Ok(Some(serde_json::from_slice(&msg.payload)?)),
            None => Ok(None),
        }
    }

    pub fn clear(&self) {
        self.published_messages.lock().clear();
    }
}

impl Default for RecordingNotifier {
    fn default() -> Self {
        Self::new("fleet")
    }
}

#[async_trait]
impl EventNotifier for RecordingNotifier {
    async fn notify(&self, event: FleetEvent) {
        let topic = event.topic(&self.topic_prefix);
        match serde_json::to_vec(&event) {
            Ok(payload) => {
                tracing::debug!("[mock-notify] {} ({} bytes)", topic, payload.len());
                self.published_messages.lock().push(RecordedMessage { topic, payload });
            }
            Err(e) => tracing::warn!("[mock-notify] cannot serialize {}: {}", topic, e),
        }
    }
}
