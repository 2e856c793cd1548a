use meshrelay_protocol::{ServerMessage, SessionId};
use std::collections::HashMap;
use tokio::sync::{mpsc, RwLock};

/// Outbound channel of every connected session.
///
/// Room membership lives in the room registry; callers pass the recipients
/// they got from it.
pub struct SessionTable {
    /// Map from session ID to message sender channel
    senders: RwLock<HashMap<SessionId, mpsc::UnboundedSender<String>>>,
}

impl SessionTable {
    pub fn new() -> Self {
        Self {
            senders: RwLock::new(HashMap::new()),
        }
    }

    pub async fn add_session(&self, session_id: SessionId, sender: mpsc::UnboundedSender<String>) {
        tracing::debug!("Session {} connected", session_id);
        self.senders.write().await.insert(session_id, sender);
    }

    pub async fn remove_session(&self, session_id: &SessionId) {
        if self.senders.write().await.remove(session_id).is_some() {
            tracing::debug!("Session {} removed", session_id);
        }
    }

    /// Send to each of `recipients` that is still connected
    pub async fn send_to_sessions(&self, recipients: &[SessionId], message: &ServerMessage) {
        if recipients.is_empty() {
            return;
        }

        let json = match serde_json::to_string(message) {
            Ok(j) => j,
            Err(e) => {
                tracing::error!("Failed to serialize message: {}", e);
                return;
            }
        };

        let senders = self.senders.read().await;
        tracing::debug!("Sending to {} sessions", recipients.len());
        for session_id in recipients {
            if let Some(sender) = senders.get(session_id) {
                if let Err(e) = sender.send(json.clone()) {
                    tracing::error!("Failed to send message to {}: {}", session_id, e);
                }
            }
        }
    }

    pub async fn send_to_session(&self, session_id: &SessionId, message: &ServerMessage) {
        let json = match serde_json::to_string(message) {
            Ok(j) => j,
            Err(e) => {
                tracing::error!("Failed to serialize message: {}", e);
                return;
            }
        };

        let senders = self.senders.read().await;

        match senders.get(session_id) {
            Some(sender) => {
                if let Err(e) = sender.send(json) {
                    tracing::error!("Failed to send message to {}: {}", session_id, e);
                }
            }
            None => tracing::debug!("Session {} is gone, dropping message", session_id),
        }
    }

    pub async fn session_count(&self) -> usize {
        self.senders.read().await.len()
    }
}

impl Default for SessionTable {
    fn default() -> Self {
        Self::new()
    }
}
