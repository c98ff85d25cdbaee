//! Server state management.
//!
//! One `RelayState` is built at startup and cloned into every handler.
//! It owns the presence registry and wires the dispatcher, seen-state
//! updater and message service around it and the store.

use crate::dispatch::Dispatcher;
use crate::messaging::{MessageService, DEFAULT_MAX_CONTENT_CHARS};
use crate::presence::PresenceRegistry;
use crate::seen::SeenStateUpdater;
use crate::store::Store;

/// Default interval between stale-connection sweeps, in seconds.
const DEFAULT_SWEEP_INTERVAL_SECS: u64 = 60;

/// Server configuration.
#[derive(Debug, Clone)]
pub struct RelayConfig {
    pub port: u16,
    /// SQLite file path. None keeps everything in memory.
    pub database_path: Option<String>,
    /// WebSocket URL advertised to clients by the hub-url endpoint.
    pub public_url: String,
    pub max_content_chars: usize,
    pub sweep_interval_secs: u64,
}

impl Default for RelayConfig {
    fn default() -> Self {
        Self {
            port: 8080,
            database_path: None,
            public_url: "ws://localhost:8080/ws".to_string(),
            max_content_chars: DEFAULT_MAX_CONTENT_CHARS,
            sweep_interval_secs: DEFAULT_SWEEP_INTERVAL_SECS,
        }
    }
}

/// Shared server state.
#[derive(Clone)]
pub struct RelayState {
    pub config: RelayConfig,
    pub presence: PresenceRegistry,
    pub dispatcher: Dispatcher,
    pub seen: SeenStateUpdater,
    pub messages: MessageService,
    pub store: Store,
}

impl RelayState {
    /// Create a new relay state with the given configuration and store.
    pub fn new(config: RelayConfig, store: Store) -> Self {
        let presence = PresenceRegistry::new();
        let dispatcher = Dispatcher::new(presence.clone());
        let seen = SeenStateUpdater::new(store.clone());
        let messages = MessageService::new(
            store.clone(),
            dispatcher.clone(),
            seen.clone(),
            config.max_content_chars,
        );

        Self {
            config,
            presence,
            dispatcher,
            seen,
            messages,
            store,
        }
    }

    /// Release live connections. Called once the server stopped accepting.
    pub fn shutdown(&self) {
        let dropped = self.presence.shutdown();
        tracing::info!(connections = dropped, "Relay state shut down");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use tokio::sync::mpsc;

    use crate::dispatch::DeliveryOutcome;
    use crate::messaging::SendMessageRequest;
    use crate::presence::ConnectionHandle;
    use crate::protocol::{ParticipantKey, Role};

    #[test]
    fn test_default_config() {
        let config = RelayConfig::default();
        assert_eq!(config.port, 8080);
        assert!(config.database_path.is_none());
        assert_eq!(config.max_content_chars, 1000);
        assert_eq!(config.sweep_interval_secs, 60);
    }

    #[test]
    fn test_components_share_one_registry() {
        let state = RelayState::new(RelayConfig::default(), Store::open(None).unwrap());
        let (tx, _rx) = mpsc::unbounded_channel();
        state
            .presence
            .connect(ParticipantKey::shop(5), ConnectionHandle::new(tx));

        assert!(state.dispatcher.presence().is_online(ParticipantKey::shop(5)));

        let sent = state
            .messages
            .send_message(
                Role::User,
                SendMessageRequest {
                    user_id: 1,
                    shop_id: 5,
                    content: "hello".into(),
                    conversation_id: None,
                },
            )
            .unwrap();
        assert_eq!(sent.outcome, DeliveryOutcome::Delivered);
    }

    #[test]
    fn test_shutdown_clears_presence() {
        let state = RelayState::new(RelayConfig::default(), Store::open(None).unwrap());
        let (tx, _rx) = mpsc::unbounded_channel();
        state
            .presence
            .connect(ParticipantKey::user(1), ConnectionHandle::new(tx));

        state.shutdown();
        assert_eq!(state.presence.online_count(), 0);
    }
}
