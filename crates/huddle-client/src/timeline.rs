//! Per-chat merge of history pages, live relay events and optimistic sends.
//!
//! Entries live in an ordered map keyed by `(created_at, id)` so that pages
//! and live events can arrive in any order, with a secondary index from
//! message id (or local id, for unconfirmed sends) to that key.

use std::collections::{BTreeMap, HashMap, HashSet};

use chrono::{DateTime, Utc};
use tracing::{debug, trace};
use uuid::Uuid;

use huddle_types::api::HistoryPage;
use huddle_types::events::GatewayEvent;
use huddle_types::models::{ChatMember, MessageRecord, ReadReceipt, UserSummary};

use crate::receipts::{DeliveryHint, delivery_hint};

type Key = (DateTime<Utc>, Uuid);

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SendState {
    /// Persisted on the server.
    Confirmed { at: DateTime<Utc> },
    /// Shown optimistically under a local id until the server answers.
    Pending { client_ref: String },
    Failed { client_ref: String, reason: String },
}

#[derive(Debug, Clone)]
pub struct Entry {
    pub message: MessageRecord,
    pub state: SendState,
}

impl Entry {
    pub fn is_confirmed(&self) -> bool {
        matches!(self.state, SendState::Confirmed { .. })
    }
}

/// Where backward pagination stands.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum History {
    NotLoaded,
    /// Older messages exist before this cursor.
    More(Uuid),
    Exhausted,
}

/// Messages missing between a newest page and the entries held before it.
/// Filled backwards from `cursor` until a page reaches `floor`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct Gap {
    cursor: Uuid,
    floor: Key,
}

pub struct Timeline {
    chat_id: Uuid,
    me: UserSummary,
    entries: BTreeMap<Key, Entry>,
    index: HashMap<Uuid, Key>,
    pending: HashMap<String, Uuid>,
    removed: HashSet<Uuid>,
    directory: HashMap<Uuid, UserSummary>,
    history: History,
    gaps: Vec<Gap>,
}

impl Timeline {
    pub fn new(chat_id: Uuid, me: UserSummary) -> Self {
        let mut directory = HashMap::new();
        directory.insert(me.id, me.clone());
        Self {
            chat_id,
            me,
            entries: BTreeMap::new(),
            index: HashMap::new(),
            pending: HashMap::new(),
            removed: HashSet::new(),
            directory,
            history: History::NotLoaded,
            gaps: Vec::new(),
        }
    }

    pub fn chat_id(&self) -> Uuid {
        self.chat_id
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Entries oldest first.
    pub fn entries(&self) -> impl Iterator<Item = &Entry> {
        self.entries.values()
    }

    pub fn messages(&self) -> impl Iterator<Item = &MessageRecord> {
        self.entries.values().map(|e| &e.message)
    }

    pub fn get(&self, id: Uuid) -> Option<&Entry> {
        self.index.get(&id).and_then(|key| self.entries.get(key))
    }

    pub fn history(&self) -> History {
        self.history
    }

    /// Cursor for the next older page, if any remain. Open gaps are filled
    /// newest first, before pagination continues past the oldest entry.
    pub fn cursor(&self) -> Option<Uuid> {
        if let Some(gap) = self.gaps.last() {
            return Some(gap.cursor);
        }
        match self.history {
            History::More(cursor) => Some(cursor),
            _ => None,
        }
    }

    pub fn has_gap(&self) -> bool {
        !self.gaps.is_empty()
    }

    /// Newest persisted message. Only moves forward: entries are never
    /// dropped by page loads, so a late page cannot hide a newer live message.
    pub fn latest_id(&self) -> Option<Uuid> {
        self.entries
            .values()
            .rev()
            .find(|e| e.is_confirmed())
            .map(|e| e.message.id)
    }

    pub fn set_members(&mut self, members: &[ChatMember]) {
        for member in members {
            self.directory.insert(member.user.id, member.user.clone());
        }
    }

    /// The newest page, as returned by a history fetch without a cursor.
    /// The first load decides where backward pagination starts. A later one
    /// (reopen, reconnect) that does not reach back to the newest held
    /// message opens a gap.
    pub fn apply_latest_page(&mut self, page: HistoryPage) {
        if self.history == History::NotLoaded {
            self.history = page.next_cursor.map_or(History::Exhausted, History::More);
        } else if let Some(gap) = self.gap_before(&page) {
            debug!("Newest page for chat {} leaves a gap before {}", self.chat_id, gap.cursor);
            self.gaps.push(gap);
        }
        self.merge_page(page);
    }

    fn gap_before(&self, page: &HistoryPage) -> Option<Gap> {
        let cursor = page.next_cursor?;
        let oldest = page.messages.first()?;
        let floor = self
            .entries
            .iter()
            .rev()
            .find(|(_, e)| e.is_confirmed())
            .map(|(key, _)| *key)?;
        if self.index.contains_key(&oldest.id) || (oldest.created_at, oldest.id) <= floor {
            return None;
        }
        Some(Gap { cursor, floor })
    }

    /// An older page fetched with `cursor`. A response for a cursor that is
    /// no longer current is stale and dropped. Returns whether it was applied.
    pub fn apply_older_page(&mut self, cursor: Uuid, page: HistoryPage) -> bool {
        if let Some(gap) = self.gaps.last().copied().filter(|g| g.cursor == cursor) {
            self.gaps.pop();
            let bridged = page.messages.first().is_none_or(|m| {
                (m.created_at, m.id) <= gap.floor || self.index.contains_key(&m.id)
            });
            if !bridged {
                if let Some(next) = page.next_cursor {
                    self.gaps.push(Gap { cursor: next, floor: gap.floor });
                }
            }
            self.merge_page(page);
            return true;
        }
        if !self.gaps.is_empty() || self.history != History::More(cursor) {
            debug!("Dropping stale page for cursor {}", cursor);
            return false;
        }
        self.history = page.next_cursor.map_or(History::Exhausted, History::More);
        self.merge_page(page);
        true
    }

    fn merge_page(&mut self, page: HistoryPage) {
        for reader in page.latest_read_by {
            self.directory.entry(reader.id).or_insert(reader);
        }
        for message in page.messages {
            self.upsert(message, Source::Page);
        }
    }

    /// Show an outgoing message immediately under a local id.
    pub fn begin_send(&mut self, client_ref: &str, content: &str, now: DateTime<Utc>) -> Uuid {
        let local_id = Uuid::new_v4();
        let message = MessageRecord {
            id: local_id,
            chat_id: self.chat_id,
            sender_id: self.me.id,
            sender: self.me.clone(),
            content: content.to_string(),
            created_at: now,
            edited: false,
            attachments: Vec::new(),
            reads: Vec::new(),
            client_ref: Some(client_ref.to_string()),
        };
        let key = (now, local_id);
        self.entries.insert(
            key,
            Entry {
                message,
                state: SendState::Pending {
                    client_ref: client_ref.to_string(),
                },
            },
        );
        self.index.insert(local_id, key);
        self.pending.insert(client_ref.to_string(), local_id);
        local_id
    }

    /// Replace the optimistic entry with the server's record. Safe to call
    /// after the same record already arrived over the relay.
    pub fn confirm_send(&mut self, record: MessageRecord, now: DateTime<Utc>) {
        if let Some(client_ref) = record.client_ref.clone() {
            self.drop_pending(&client_ref);
        }
        self.upsert_with_state(record, Source::Live, SendState::Confirmed { at: now });
    }

    pub fn fail_send(&mut self, client_ref: &str, reason: &str) {
        let Some(local_id) = self.pending.remove(client_ref) else {
            return;
        };
        if let Some(entry) = self.index.get(&local_id).and_then(|key| self.entries.get_mut(key)) {
            entry.state = SendState::Failed {
                client_ref: client_ref.to_string(),
                reason: reason.to_string(),
            };
        }
    }

    /// Remove a failed optimistic entry, e.g. before retrying it.
    pub fn discard(&mut self, local_id: Uuid) {
        if let Some(key) = self.index.remove(&local_id) {
            if let Some(entry) = self.entries.remove(&key) {
                if let SendState::Pending { client_ref } | SendState::Failed { client_ref, .. } = entry.state {
                    self.pending.remove(&client_ref);
                }
            }
        }
    }

    /// Apply a relay event. Events for other chats are ignored. Returns
    /// whether the timeline changed.
    pub fn apply_event(&mut self, event: &GatewayEvent) -> bool {
        if event.chat_id() != Some(self.chat_id) {
            return false;
        }

        match event {
            GatewayEvent::NewMessage(message) => {
                if let Some(client_ref) = &message.client_ref {
                    self.drop_pending(client_ref);
                }
                self.upsert(message.clone(), Source::Live)
            }
            GatewayEvent::EditedMessage(message) => {
                if !self.index.contains_key(&message.id) {
                    trace!("Edit for unloaded message {}", message.id);
                    return false;
                }
                self.upsert(message.clone(), Source::Live)
            }
            GatewayEvent::DeletedMessage(deleted) => self.remove(deleted.id),
            GatewayEvent::MessageReadBy {
                message_id,
                reader_id,
                ..
            } => self.record_read(*message_id, *reader_id, Utc::now()),
            GatewayEvent::AddedMembers { members, .. } => {
                self.set_members(members);
                false
            }
            _ => false,
        }
    }

    /// Readers of a message other than its author, resolved against known
    /// members and senders.
    pub fn read_by(&self, message_id: Uuid) -> Vec<UserSummary> {
        let Some(entry) = self.get(message_id) else {
            return Vec::new();
        };
        entry
            .message
            .reader_ids()
            .map(|id| {
                self.directory
                    .get(&id)
                    .cloned()
                    .unwrap_or_else(|| UserSummary::placeholder(id))
            })
            .collect()
    }

    /// Status label for my own most recent message, if the newest entry is mine.
    pub fn delivery_hint(&self, now: DateTime<Utc>) -> Option<(Uuid, DeliveryHint)> {
        let entry = self.entries.values().next_back()?;
        if entry.message.sender_id != self.me.id {
            return None;
        }
        let confirmed_at = match &entry.state {
            SendState::Confirmed { at } => Some(*at),
            SendState::Pending { .. } | SendState::Failed { .. } => None,
        };
        Some((entry.message.id, delivery_hint(&entry.message, confirmed_at, now)))
    }

    fn drop_pending(&mut self, client_ref: &str) {
        if let Some(local_id) = self.pending.remove(client_ref) {
            if let Some(key) = self.index.remove(&local_id) {
                self.entries.remove(&key);
            }
        }
    }

    fn upsert(&mut self, message: MessageRecord, source: Source) -> bool {
        // The relayed echo of my own send is timed on the local clock, like
        // the REST confirmation
        let at = if source == Source::Live && message.sender_id == self.me.id {
            Utc::now()
        } else {
            message.created_at
        };
        self.upsert_with_state(message, source, SendState::Confirmed { at })
    }

    fn upsert_with_state(&mut self, mut message: MessageRecord, source: Source, state: SendState) -> bool {
        if message.chat_id != self.chat_id || self.removed.contains(&message.id) {
            return false;
        }
        message.client_ref = None;
        self.directory
            .entry(message.sender_id)
            .or_insert_with(|| message.sender.clone());

        let key = (message.created_at, message.id);
        if let Some(old_key) = self.index.get(&message.id).copied() {
            let Some(existing) = self.entries.get_mut(&old_key) else {
                return false;
            };
            merge_reads(&mut message.reads, &existing.message.reads);
            // A page fetched before an edit landed must not undo it
            if source == Source::Page && existing.message.edited && !message.edited {
                existing.message.reads = message.reads;
                return true;
            }
            let state = match (&existing.state, state) {
                (SendState::Confirmed { at }, SendState::Confirmed { .. }) => SendState::Confirmed { at: *at },
                (_, state) => state,
            };
            if existing.message == message && existing.state == state {
                return false;
            }
            self.entries.remove(&old_key);
            self.entries.insert(key, Entry { message, state });
            self.index.insert(key.1, key);
            return true;
        }

        self.index.insert(message.id, key);
        self.entries.insert(key, Entry { message, state });
        true
    }

    fn remove(&mut self, id: Uuid) -> bool {
        self.removed.insert(id);
        match self.index.remove(&id) {
            Some(key) => self.entries.remove(&key).is_some(),
            None => false,
        }
    }

    fn record_read(&mut self, message_id: Uuid, reader_id: Uuid, at: DateTime<Utc>) -> bool {
        let Some(entry) = self.index.get(&message_id).and_then(|key| self.entries.get_mut(key)) else {
            return false;
        };
        let reads = &mut entry.message.reads;
        match reads.iter_mut().find(|r| r.user_id == reader_id) {
            Some(existing) => existing.read_at = existing.read_at.max(at),
            None => reads.push(ReadReceipt {
                message_id,
                user_id: reader_id,
                read_at: at,
            }),
        }
        true
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Source {
    Page,
    Live,
}

/// Keep receipts already seen locally that a fresher copy does not carry,
/// and the later timestamp for readers present in both.
fn merge_reads(incoming: &mut Vec<ReadReceipt>, known: &[ReadReceipt]) {
    for old in known {
        match incoming.iter_mut().find(|r| r.user_id == old.user_id) {
            Some(r) => r.read_at = r.read_at.max(old.read_at),
            None => incoming.push(old.clone()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;
    use huddle_types::models::DeletedMessage;

    fn user(n: u128, name: &str) -> UserSummary {
        UserSummary {
            id: Uuid::from_u128(n),
            username: name.into(),
            image: None,
        }
    }

    fn record(chat_id: Uuid, sender: &UserSummary, minute: i64, content: &str) -> MessageRecord {
        let base = DateTime::<Utc>::from_timestamp(1_700_000_000, 0).unwrap();
        MessageRecord {
            id: Uuid::new_v4(),
            chat_id,
            sender_id: sender.id,
            sender: sender.clone(),
            content: content.into(),
            created_at: base + Duration::minutes(minute),
            edited: false,
            attachments: vec![],
            reads: vec![],
            client_ref: None,
        }
    }

    fn page(messages: Vec<MessageRecord>, next_cursor: Option<Uuid>) -> HistoryPage {
        HistoryPage {
            messages,
            next_cursor,
            latest_read_by: vec![],
            marked_read: None,
        }
    }

    fn contents(timeline: &Timeline) -> Vec<String> {
        timeline.messages().map(|m| m.content.clone()).collect()
    }

    /// Up to `limit` messages strictly older than `cursor`, the way the
    /// history endpoint pages backwards.
    fn older(all: &[MessageRecord], cursor: Uuid, limit: usize) -> HistoryPage {
        let end = all.iter().position(|m| m.id == cursor).unwrap();
        let start = end.saturating_sub(limit);
        let next = (start > 0).then(|| all[start].id);
        page(all[start..end].to_vec(), next)
    }

    fn backfill(tl: &mut Timeline, all: &[MessageRecord]) {
        while let Some(cursor) = tl.cursor() {
            assert!(tl.apply_older_page(cursor, older(all, cursor, 2)));
        }
    }

    fn setup() -> (Timeline, UserSummary, UserSummary) {
        let ada = user(1, "ada");
        let bob = user(2, "bob");
        (Timeline::new(Uuid::new_v4(), ada.clone()), ada, bob)
    }

    #[test]
    fn older_pages_prepend_in_order() {
        let (mut tl, ada, bob) = setup();
        let chat = tl.chat_id();
        let all: Vec<_> = (0..5).map(|i| record(chat, if i % 2 == 0 { &ada } else { &bob }, i, &format!("m{}", i))).collect();

        tl.apply_latest_page(page(all[3..].to_vec(), Some(all[3].id)));
        assert_eq!(tl.cursor(), Some(all[3].id));

        assert!(tl.apply_older_page(all[3].id, page(all[1..3].to_vec(), Some(all[1].id))));
        assert!(tl.apply_older_page(all[1].id, page(all[..1].to_vec(), None)));

        assert_eq!(contents(&tl), vec!["m0", "m1", "m2", "m3", "m4"]);
        assert_eq!(tl.history(), History::Exhausted);
        assert_eq!(tl.cursor(), None);
    }

    #[test]
    fn stale_older_page_is_dropped() {
        let (mut tl, ada, _) = setup();
        let chat = tl.chat_id();
        let all: Vec<_> = (0..4).map(|i| record(chat, &ada, i, &format!("m{}", i))).collect();

        tl.apply_latest_page(page(all[2..].to_vec(), Some(all[2].id)));
        assert!(tl.apply_older_page(all[2].id, page(all[..2].to_vec(), None)));
        // The same response delivered twice
        assert!(!tl.apply_older_page(all[2].id, page(all[..2].to_vec(), None)));
        assert_eq!(tl.len(), 4);
    }

    #[test]
    fn live_message_survives_late_page() {
        let (mut tl, ada, bob) = setup();
        let chat = tl.chat_id();
        let old = record(chat, &ada, 0, "old");
        let live = record(chat, &bob, 5, "live");

        assert!(tl.apply_event(&GatewayEvent::NewMessage(live.clone())));
        // A page requested before `live` existed finishes afterwards
        tl.apply_latest_page(page(vec![old.clone()], None));

        assert_eq!(contents(&tl), vec!["old", "live"]);
        assert_eq!(tl.latest_id(), Some(live.id));
    }

    #[test]
    fn page_and_live_overlap_is_deduplicated() {
        let (mut tl, _, bob) = setup();
        let chat = tl.chat_id();
        let msg = record(chat, &bob, 1, "hi");

        tl.apply_event(&GatewayEvent::NewMessage(msg.clone()));
        tl.apply_latest_page(page(vec![msg.clone()], None));
        tl.apply_event(&GatewayEvent::NewMessage(msg));
        assert_eq!(tl.len(), 1);
    }

    #[test]
    fn optimistic_send_is_replaced_in_place() {
        let (mut tl, ada, bob) = setup();
        let chat = tl.chat_id();
        let earlier = record(chat, &bob, 0, "before");
        tl.apply_latest_page(page(vec![earlier], None));

        let now = Utc::now();
        let local = tl.begin_send("ref-1", "hello", now);
        assert!(matches!(tl.get(local).unwrap().state, SendState::Pending { .. }));
        assert_eq!(tl.latest_id(), Some(tl.messages().next().unwrap().id));

        let mut confirmed = record(chat, &ada, 1, "hello");
        confirmed.client_ref = Some("ref-1".into());
        tl.confirm_send(confirmed.clone(), now);

        assert_eq!(contents(&tl), vec!["before", "hello"]);
        assert!(tl.get(local).is_none());
        assert_eq!(tl.latest_id(), Some(confirmed.id));

        // The relay echo of the same record changes nothing
        tl.apply_event(&GatewayEvent::NewMessage(confirmed));
        assert_eq!(tl.len(), 2);
    }

    #[test]
    fn relayed_copy_can_confirm_before_response() {
        let (mut tl, ada, _) = setup();
        let chat = tl.chat_id();
        tl.begin_send("ref-9", "hey", Utc::now());

        let mut echoed = record(chat, &ada, 3, "hey");
        echoed.client_ref = Some("ref-9".into());
        tl.apply_event(&GatewayEvent::NewMessage(echoed.clone()));
        tl.confirm_send(echoed, Utc::now());

        assert_eq!(tl.len(), 1);
        assert!(tl.entries().all(Entry::is_confirmed));
    }

    #[test]
    fn failed_send_stays_visible() {
        let (mut tl, _, _) = setup();
        let local = tl.begin_send("ref-2", "nope", Utc::now());
        tl.fail_send("ref-2", "network down");
        assert!(matches!(tl.get(local).unwrap().state, SendState::Failed { .. }));
        assert_eq!(tl.latest_id(), None);

        tl.discard(local);
        assert!(tl.is_empty());
    }

    #[test]
    fn deleted_messages_do_not_come_back() {
        let (mut tl, _, bob) = setup();
        let chat = tl.chat_id();
        let msg = record(chat, &bob, 0, "gone soon");
        tl.apply_latest_page(page(vec![msg.clone()], None));

        assert!(tl.apply_event(&GatewayEvent::DeletedMessage(DeletedMessage { id: msg.id, chat_id: chat })));
        tl.apply_latest_page(page(vec![msg.clone()], None));
        tl.apply_event(&GatewayEvent::NewMessage(msg));
        assert!(tl.is_empty());
    }

    #[test]
    fn stale_page_keeps_newer_edit() {
        let (mut tl, _, bob) = setup();
        let chat = tl.chat_id();
        let original = record(chat, &bob, 0, "teh");
        tl.apply_latest_page(page(vec![original.clone()], None));

        let mut edited = original.clone();
        edited.content = "the".into();
        edited.edited = true;
        assert!(tl.apply_event(&GatewayEvent::EditedMessage(edited)));

        tl.apply_latest_page(page(vec![original], None));
        assert_eq!(contents(&tl), vec!["the"]);
    }

    #[test]
    fn edits_for_unloaded_messages_are_ignored() {
        let (mut tl, _, bob) = setup();
        let chat = tl.chat_id();
        let mut stranger = record(chat, &bob, 0, "x");
        stranger.edited = true;
        assert!(!tl.apply_event(&GatewayEvent::EditedMessage(stranger)));
        assert!(tl.is_empty());
    }

    #[test]
    fn other_chats_are_ignored() {
        let (mut tl, _, bob) = setup();
        let elsewhere = record(Uuid::new_v4(), &bob, 0, "hi");
        assert!(!tl.apply_event(&GatewayEvent::NewMessage(elsewhere)));
        assert!(tl.is_empty());
    }

    #[test]
    fn readers_resolve_with_placeholder_fallback() {
        let (mut tl, ada, bob) = setup();
        let chat = tl.chat_id();
        let msg = record(chat, &ada, 0, "hi");
        tl.apply_latest_page(page(vec![msg.clone()], None));
        tl.set_members(&[ChatMember {
            chat_id: chat,
            user: bob.clone(),
            role: huddle_types::models::MemberRole::Member,
            joined_at: Utc::now(),
        }]);

        let stranger = Uuid::from_u128(99);
        for reader in [bob.id, stranger, ada.id, bob.id] {
            tl.apply_event(&GatewayEvent::MessageReadBy {
                message_id: msg.id,
                chat_id: chat,
                reader_id: reader,
            });
        }

        let readers = tl.read_by(msg.id);
        assert_eq!(readers.len(), 2);
        assert_eq!(readers[0], bob);
        assert_eq!(readers[1], UserSummary::placeholder(stranger));
    }

    #[test]
    fn delivery_hint_tracks_own_latest_message() {
        let (mut tl, ada, bob) = setup();
        let chat = tl.chat_id();
        let now = Utc::now();

        tl.begin_send("ref-3", "ping", now);
        assert!(matches!(tl.delivery_hint(now), Some((_, DeliveryHint::Sending))));

        let mut mine = record(chat, &ada, 0, "ping");
        mine.created_at = now;
        mine.client_ref = Some("ref-3".into());
        tl.confirm_send(mine.clone(), now);
        assert_eq!(tl.delivery_hint(now), Some((mine.id, DeliveryHint::Sent)));
        assert_eq!(
            tl.delivery_hint(now + Duration::seconds(1)),
            Some((mine.id, DeliveryHint::Delivered))
        );

        tl.apply_event(&GatewayEvent::MessageReadBy {
            message_id: mine.id,
            chat_id: chat,
            reader_id: bob.id,
        });
        assert_eq!(tl.delivery_hint(now), Some((mine.id, DeliveryHint::Read(1))));

        let mut reply = record(chat, &bob, 0, "pong");
        reply.created_at = now + Duration::seconds(2);
        tl.apply_event(&GatewayEvent::NewMessage(reply));
        assert_eq!(tl.delivery_hint(now), None);
    }

    #[test]
    fn reopened_chat_with_gap_backfills_everything() {
        let (mut tl, _, bob) = setup();
        let chat = tl.chat_id();
        let all: Vec<_> = (0..15).map(|i| record(chat, &bob, i, &format!("m{}", i))).collect();

        tl.apply_latest_page(page(all[8..10].to_vec(), Some(all[8].id)));
        // m10..m12 arrived while the chat was closed
        tl.apply_latest_page(page(all[13..].to_vec(), Some(all[13].id)));
        assert!(tl.has_gap());
        assert_eq!(tl.cursor(), Some(all[13].id));

        backfill(&mut tl, &all);

        let expected: Vec<String> = (0..15).map(|i| format!("m{}", i)).collect();
        assert_eq!(contents(&tl), expected);
        assert!(!tl.has_gap());
        assert_eq!(tl.history(), History::Exhausted);
    }

    #[test]
    fn gaps_from_repeated_reopens_are_all_filled() {
        let (mut tl, _, bob) = setup();
        let chat = tl.chat_id();
        let all: Vec<_> = (0..20).map(|i| record(chat, &bob, i, &format!("m{}", i))).collect();

        tl.apply_latest_page(page(all[4..6].to_vec(), Some(all[4].id)));
        tl.apply_latest_page(page(all[10..12].to_vec(), Some(all[10].id)));
        tl.apply_latest_page(page(all[18..].to_vec(), Some(all[18].id)));

        backfill(&mut tl, &all);
        assert_eq!(tl.len(), 20);
        assert_eq!(tl.history(), History::Exhausted);
    }

    #[test]
    fn overlapping_reopen_keeps_the_cursor() {
        let (mut tl, _, bob) = setup();
        let chat = tl.chat_id();
        let all: Vec<_> = (0..6).map(|i| record(chat, &bob, i, &format!("m{}", i))).collect();

        tl.apply_latest_page(page(all[2..4].to_vec(), Some(all[2].id)));
        tl.apply_latest_page(page(all[3..].to_vec(), Some(all[3].id)));

        assert!(!tl.has_gap());
        assert_eq!(tl.cursor(), Some(all[2].id));
        assert_eq!(contents(&tl), vec!["m2", "m3", "m4", "m5"]);
    }

    #[test]
    fn older_cursor_waits_for_the_gap() {
        let (mut tl, _, bob) = setup();
        let chat = tl.chat_id();
        let all: Vec<_> = (0..10).map(|i| record(chat, &bob, i, &format!("m{}", i))).collect();

        tl.apply_latest_page(page(all[4..6].to_vec(), Some(all[4].id)));
        tl.apply_latest_page(page(all[8..].to_vec(), Some(all[8].id)));

        // A page requested from the old cursor before the reopen
        assert!(!tl.apply_older_page(all[4].id, older(&all, all[4].id, 2)));
        assert!(tl.apply_older_page(all[8].id, older(&all, all[8].id, 2)));
        assert_eq!(tl.cursor(), Some(all[6].id));
        assert!(tl.apply_older_page(all[6].id, older(&all, all[6].id, 2)));
        assert!(!tl.has_gap());
        assert_eq!(tl.cursor(), Some(all[4].id));
        assert_eq!(contents(&tl), vec!["m4", "m5", "m6", "m7", "m8", "m9"]);
    }

    #[test]
    fn own_relayed_message_is_timed_locally() {
        let (mut tl, ada, _) = setup();
        let chat = tl.chat_id();
        // Sent from another device; the server clock is far behind ours
        let mine = record(chat, &ada, 0, "from my phone");
        let before = Utc::now();

        assert!(tl.apply_event(&GatewayEvent::NewMessage(mine.clone())));
        assert_eq!(tl.delivery_hint(before), Some((mine.id, DeliveryHint::Sent)));
        assert_eq!(
            tl.delivery_hint(before + Duration::seconds(1)),
            Some((mine.id, DeliveryHint::Delivered))
        );
    }
}
