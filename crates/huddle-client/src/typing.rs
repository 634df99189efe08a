use std::collections::{BTreeMap, HashMap};
use std::time::Duration;

use tokio::time::Instant;
use uuid::Uuid;

use huddle_types::events::GatewayEvent;

/// Outgoing typing stops on its own after this much idle time.
pub const TYPING_IDLE: Duration = Duration::from_secs(3);

/// Who is typing where, from relayed `user_typing`/`user_stop_typing`.
/// The relay never expires indicators, so neither does this.
#[derive(Debug, Default)]
pub struct TypingRoster {
    chats: HashMap<Uuid, BTreeMap<Uuid, String>>,
}

impl TypingRoster {
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns whether the roster changed.
    pub fn apply(&mut self, event: &GatewayEvent) -> bool {
        match event {
            GatewayEvent::UserTyping {
                chat_id,
                user_id,
                username,
            } => {
                let names = self.chats.entry(*chat_id).or_default();
                names.insert(*user_id, username.clone()).as_ref() != Some(username)
            }
            GatewayEvent::UserStopTyping { chat_id, user_id, .. } => self.stop(*chat_id, *user_id),
            // A message from someone ends their indicator
            GatewayEvent::NewMessage(message) => self.stop(message.chat_id, message.sender_id),
            _ => false,
        }
    }

    fn stop(&mut self, chat_id: Uuid, user_id: Uuid) -> bool {
        let Some(names) = self.chats.get_mut(&chat_id) else {
            return false;
        };
        let removed = names.remove(&user_id).is_some();
        if names.is_empty() {
            self.chats.remove(&chat_id);
        }
        removed
    }

    pub fn typing_in(&self, chat_id: Uuid) -> Vec<&str> {
        self.chats
            .get(&chat_id)
            .map(|names| names.values().map(String::as_str).collect())
            .unwrap_or_default()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TypingSignal {
    Start,
    Stop,
}

/// Decides when to send `typing` and `stop_typing` for the local user.
#[derive(Debug)]
pub struct TypingEmitter {
    idle: Duration,
    last_input: Option<Instant>,
}

impl Default for TypingEmitter {
    fn default() -> Self {
        Self::new(TYPING_IDLE)
    }
}

impl TypingEmitter {
    pub fn new(idle: Duration) -> Self {
        Self { idle, last_input: None }
    }

    pub fn is_typing(&self) -> bool {
        self.last_input.is_some()
    }

    /// A keystroke. Only the first one of a burst produces `Start`.
    pub fn input(&mut self, now: Instant) -> Option<TypingSignal> {
        let started = self.last_input.is_none();
        self.last_input = Some(now);
        started.then_some(TypingSignal::Start)
    }

    /// `Stop` once the idle window has passed since the last keystroke.
    pub fn tick(&mut self, now: Instant) -> Option<TypingSignal> {
        let deadline = self.deadline()?;
        if now >= deadline {
            self.last_input = None;
            return Some(TypingSignal::Stop);
        }
        None
    }

    /// Message sent or input cleared.
    pub fn reset(&mut self) -> Option<TypingSignal> {
        self.last_input.take().map(|_| TypingSignal::Stop)
    }

    /// When `tick` will next produce `Stop`.
    pub fn deadline(&self) -> Option<Instant> {
        self.last_input.map(|at| at + self.idle)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn typing(chat_id: Uuid, user: u128, name: &str) -> GatewayEvent {
        GatewayEvent::UserTyping {
            chat_id,
            user_id: Uuid::from_u128(user),
            username: name.into(),
        }
    }

    #[test]
    fn roster_tracks_start_and_stop() {
        let mut roster = TypingRoster::new();
        let chat = Uuid::new_v4();

        assert!(roster.apply(&typing(chat, 1, "ada")));
        assert!(!roster.apply(&typing(chat, 1, "ada")));
        assert!(roster.apply(&typing(chat, 2, "bob")));
        assert_eq!(roster.typing_in(chat), vec!["ada", "bob"]);
        assert!(roster.typing_in(Uuid::new_v4()).is_empty());

        assert!(roster.apply(&GatewayEvent::UserStopTyping {
            chat_id: chat,
            user_id: Uuid::from_u128(1),
            username: "ada".into(),
        }));
        assert_eq!(roster.typing_in(chat), vec!["bob"]);
    }

    #[test]
    fn emitter_starts_once_and_stops_after_idle() {
        let mut emitter = TypingEmitter::new(Duration::from_secs(3));
        let t0 = Instant::now();

        assert_eq!(emitter.input(t0), Some(TypingSignal::Start));
        assert_eq!(emitter.input(t0 + Duration::from_secs(1)), None);
        assert_eq!(emitter.tick(t0 + Duration::from_secs(3)), None);
        assert_eq!(emitter.deadline(), Some(t0 + Duration::from_secs(4)));
        assert_eq!(emitter.tick(t0 + Duration::from_secs(4)), Some(TypingSignal::Stop));
        assert!(!emitter.is_typing());

        assert_eq!(emitter.input(t0 + Duration::from_secs(5)), Some(TypingSignal::Start));
        assert_eq!(emitter.reset(), Some(TypingSignal::Stop));
        assert_eq!(emitter.reset(), None);
    }
}
