// Typing indicators — throttled outbound signals, auto-expiring inbound state

use crate::sync::{KeyedTimers, Throttle};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::{Arc, Weak};
use std::time::Duration;
use tokio::sync::broadcast;
use tracing::debug;

/// Carried as the content of a `TYPING` envelope.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TypingSignal {
    pub conversation_id: String,
    pub typing: bool,
}

impl TypingSignal {
    pub fn to_content(&self) -> String {
        serde_json::to_string(self).unwrap_or_default()
    }

    pub fn from_content(content: &str) -> Option<Self> {
        serde_json::from_str(content).ok()
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TypingEvent {
    pub user_id: String,
    pub user_name: Option<String>,
    pub conversation_id: String,
    pub is_typing: bool,
}

struct TypingInner {
    throttle: Throttle,
    debounce: Duration,
    auto_clear: Duration,
    stop_timers: KeyedTimers<String>,
    clear_timers: KeyedTimers<String>,
    active: Mutex<HashMap<String, TypingEvent>>,
    events: broadcast::Sender<TypingEvent>,
}

#[derive(Clone)]
pub struct TypingIndicators {
    inner: Arc<TypingInner>,
}

impl TypingIndicators {
    pub fn new(throttle: Duration, debounce: Duration, auto_clear: Duration) -> Self {
        let (events, _) = broadcast::channel(64);
        Self {
            inner: Arc::new(TypingInner {
                throttle: Throttle::new(throttle),
                debounce,
                auto_clear,
                stop_timers: KeyedTimers::new(),
                clear_timers: KeyedTimers::new(),
                active: Mutex::new(HashMap::new()),
                events,
            }),
        }
    }

    fn from_weak(weak: &Weak<TypingInner>) -> Option<Self> {
        weak.upgrade().map(|inner| Self { inner })
    }

    /// Whether a "typing" broadcast may go out now.
    pub fn should_broadcast(&self) -> bool {
        self.inner.throttle.try_acquire()
    }

    /// Run `stop` once the user has been idle in `conversation_id` for the
    /// debounce period. Each keystroke pushes it back.
    pub fn schedule_stop<F>(&self, conversation_id: &str, stop: F)
    where
        F: std::future::Future<Output = ()> + Send + 'static,
    {
        self.inner
            .stop_timers
            .schedule(conversation_id.to_string(), self.inner.debounce, stop);
    }

    /// Apply a typing signal received from another user.
    pub fn on_remote(&self, user_id: &str, user_name: Option<String>, signal: TypingSignal) {
        if !signal.typing {
            self.inner.clear_timers.cancel(&user_id.to_string());
            self.clear_user(user_id);
            return;
        }

        let event = TypingEvent {
            user_id: user_id.to_string(),
            user_name,
            conversation_id: signal.conversation_id,
            is_typing: true,
        };
        self.inner
            .active
            .lock()
            .insert(user_id.to_string(), event.clone());
        let _ = self.inner.events.send(event);

        // A lost stop signal must not leave the indicator on forever.
        let weak = Arc::downgrade(&self.inner);
        let user = user_id.to_string();
        self.inner
            .clear_timers
            .schedule(user_id.to_string(), self.inner.auto_clear, async move {
                if let Some(typing) = Self::from_weak(&weak) {
                    debug!("Typing indicator for {} expired", user);
                    typing.clear_user(&user);
                }
            });
    }

    fn clear_user(&self, user_id: &str) {
        let removed = self.inner.active.lock().remove(user_id);
        if let Some(mut event) = removed {
            event.is_typing = false;
            let _ = self.inner.events.send(event);
        }
    }

    pub fn is_typing(&self, user_id: &str) -> bool {
        self.inner.active.lock().contains_key(user_id)
    }

    pub fn active_count(&self) -> usize {
        self.inner.active.lock().len()
    }

    pub fn subscribe(&self) -> broadcast::Receiver<TypingEvent> {
        self.inner.events.subscribe()
    }

    /// Cancel all timers and forget remote state.
    pub fn clear(&self) {
        self.inner.stop_timers.cancel_all();
        self.inner.clear_timers.cancel_all();
        self.inner.active.lock().clear();
    }
}
