//! Lifecycle events fired by the kernel.
//!
//! Notification events are dispatched in the background. Cancellable ones
//! are awaited: any listener can veto the action they announce, and a
//! listener that doesn't answer in time vetoes it as well.

use std::{sync::Arc, time::Duration};

use tokio::sync::RwLock;

use crate::{Player, Server};

/// Event fired by the kernel.
#[derive(Debug, Clone)]
pub enum Event {
    FamilyRegister {
        family: String,
    },
    FamilyUnregister {
        family: String,
    },
    ServerRegister {
        family: String,
        server: Arc<Server>,
    },
    ServerUnregister {
        family: Option<String>,
        server: Arc<Server>,
    },
    /// The server stopped pinging and was removed.
    ServerTimeout {
        family: Option<String>,
        server: Arc<Server>,
    },
    /// Cancellable.
    ServerLock {
        server: Arc<Server>,
    },
    /// Cancellable.
    ServerUnlock {
        server: Arc<Server>,
    },
    /// Cancellable.
    FamilyPreJoin {
        family: String,
        player: Player,
    },
    FamilyPostJoin {
        family: String,
        server: Arc<Server>,
        player: Player,
    },
    /// Cancellable.
    ServerPreJoin {
        server: Arc<Server>,
        player: Player,
    },
    ServerPostJoin {
        server: Arc<Server>,
        player: Player,
    },
    NetworkJoin {
        player: Player,
    },
    NetworkLeave {
        player: Player,
    },
    ServerSwitch {
        previous: Option<Arc<Server>>,
        server: Arc<Server>,
        player: Player,
    },
    PlayerKicked {
        server: Option<Arc<Server>>,
        player: Player,
        reason: String,
    },
}

/// What a listener wants done with a cancellable event.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum EventOutcome {
    #[default]
    Continue,
    Cancel,
}

#[async_trait::async_trait]
pub trait EventListener: Send + Sync {
    /// Handles an event. The outcome is ignored for notification events.
    async fn on_event(&self, event: &Event) -> EventOutcome;
}

/// Dispatches events to registered listeners.
pub struct EventManager {
    listeners: RwLock<Vec<Arc<dyn EventListener>>>,
    timeout: parking_lot::RwLock<Duration>,
}

impl Event {
    pub fn name(&self) -> &'static str {
        match self {
            Self::FamilyRegister { .. } => "FamilyRegister",
            Self::FamilyUnregister { .. } => "FamilyUnregister",
            Self::ServerRegister { .. } => "ServerRegister",
            Self::ServerUnregister { .. } => "ServerUnregister",
            Self::ServerTimeout { .. } => "ServerTimeout",
            Self::ServerLock { .. } => "ServerLock",
            Self::ServerUnlock { .. } => "ServerUnlock",
            Self::FamilyPreJoin { .. } => "FamilyPreJoin",
            Self::FamilyPostJoin { .. } => "FamilyPostJoin",
            Self::ServerPreJoin { .. } => "ServerPreJoin",
            Self::ServerPostJoin { .. } => "ServerPostJoin",
            Self::NetworkJoin { .. } => "NetworkJoin",
            Self::NetworkLeave { .. } => "NetworkLeave",
            Self::ServerSwitch { .. } => "ServerSwitch",
            Self::PlayerKicked { .. } => "PlayerKicked",
        }
    }
}

impl EventManager {
    /// Creates an event manager.
    ///
    /// ## Arguments
    ///
    /// * `timeout` - Time cancellable events are given before failing closed
    pub fn new(timeout: Duration) -> Self {
        Self {
            listeners: RwLock::new(Vec::new()),
            timeout: parking_lot::RwLock::new(timeout),
        }
    }

    pub fn set_timeout(&self, timeout: Duration) {
        *self.timeout.write() = timeout;
    }

    pub async fn register(&self, listener: Arc<dyn EventListener>) {
        self.listeners.write().await.push(listener);
    }

    /// Fires a notification event without waiting for listeners.
    pub async fn fire(&self, event: Event) {
        let listeners = self.listeners.read().await.clone();
        if listeners.is_empty() {
            return;
        }
        log::trace!("Firing {}", event.name());
        tokio::spawn(async move {
            for listener in listeners {
                listener.on_event(&event).await;
            }
        });
    }

    /// Fires a cancellable event.
    ///
    /// Returns whether the announced action may proceed.
    pub async fn fire_cancellable(&self, event: Event) -> bool {
        let listeners = self.listeners.read().await.clone();
        if listeners.is_empty() {
            return true;
        }
        let timeout = *self.timeout.read();
        let outcome = tokio::time::timeout(timeout, async {
            for listener in listeners.iter() {
                if listener.on_event(&event).await == EventOutcome::Cancel {
                    return EventOutcome::Cancel;
                }
            }
            EventOutcome::Continue
        })
        .await;
        match outcome {
            Ok(EventOutcome::Continue) => true,
            Ok(EventOutcome::Cancel) => {
                log::debug!("{} was cancelled by a listener", event.name());
                false
            }
            Err(_) => {
                log::warn!(
                    "Listeners of {} did not answer within {:?}, cancelling it",
                    event.name(),
                    timeout
                );
                false
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use uuid::Uuid;

    use super::*;

    struct Veto;

    #[async_trait::async_trait]
    impl EventListener for Veto {
        async fn on_event(&self, event: &Event) -> EventOutcome {
            match event {
                Event::FamilyPreJoin { .. } => EventOutcome::Cancel,
                _ => EventOutcome::Continue,
            }
        }
    }

    struct Sleepy;

    #[async_trait::async_trait]
    impl EventListener for Sleepy {
        async fn on_event(&self, _: &Event) -> EventOutcome {
            tokio::time::sleep(Duration::from_secs(60)).await;
            EventOutcome::Continue
        }
    }

    fn pre_join() -> Event {
        Event::FamilyPreJoin {
            family: "lobby".into(),
            player: Player::new(Uuid::new_v4(), "Notch"),
        }
    }

    #[tokio::test]
    async fn listeners_can_cancel() {
        let events = EventManager::new(Duration::from_secs(5));
        assert!(events.fire_cancellable(pre_join()).await);
        events.register(Arc::new(Veto)).await;
        assert!(!events.fire_cancellable(pre_join()).await);
        assert!(
            events
                .fire_cancellable(Event::NetworkJoin {
                    player: Player::new(Uuid::new_v4(), "jeb_"),
                })
                .await
        );
    }

    #[tokio::test(start_paused = true)]
    async fn unanswered_events_fail_closed() {
        let events = EventManager::new(Duration::from_secs(5));
        events.register(Arc::new(Sleepy)).await;
        assert!(!events.fire_cancellable(pre_join()).await);
    }
}
