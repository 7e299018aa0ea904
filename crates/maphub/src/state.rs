//! The game-state keystore: a keyed event map that collapses the incoming
//! event stream into an obsolescence-resolved snapshot, the chat history
//! log, the image directory, and the name/class indices.
//!
//! Events are stored by key so the common path (displacing stale state) is
//! cheap; the more expensive sort by sequence only happens on the
//! relatively rare full SYNC.

use std::collections::HashMap;

use mapwire::event::Event;
use tracing::info;

/// Chat message IDs start at the current wall clock minus this epoch so a
/// restarted server instance is unlikely to collide with IDs handed out by
/// an earlier run, without the numbers growing needlessly large.
pub const MESSAGE_ID_EPOCH: i64 = 1593130546;

#[derive(Debug)]
pub struct MapState {
    pub(crate) events: HashMap<String, Event>,
    pub(crate) chat: Vec<Event>,
    pub(crate) images: HashMap<(String, String), String>,
    pub(crate) id_by_name: HashMap<String, String>,
    pub(crate) class_by_id: HashMap<String, String>,
    next_sequence: u64,
    next_message_id: i64,
    pub(crate) save_needed: bool,
}

impl MapState {
    pub fn new() -> MapState {
        let now = std::time::SystemTime::now()
            .duration_since(std::time::UNIX_EPOCH)
            .unwrap_or_default()
            .as_secs() as i64;
        MapState {
            events: HashMap::new(),
            chat: Vec::new(),
            images: HashMap::new(),
            id_by_name: HashMap::new(),
            class_by_id: HashMap::new(),
            next_sequence: 0,
            next_message_id: now - MESSAGE_ID_EPOCH,
            save_needed: false,
        }
    }

    /// Admit an event: assign the next sequence number and displace any
    /// previous event with the same key. Keyless events are not tracked.
    pub fn update(&mut self, mut ev: Event) {
        if ev.key.is_empty() {
            return;
        }
        ev.sequence = self.next_sequence;
        self.next_sequence += 1;
        self.events.insert(ev.key.clone(), ev);
        self.save_needed = true;
    }

    /// Re-admit a restored event, preserving its saved sequence number and
    /// advancing the counter past it.
    pub fn insert_loaded(&mut self, ev: Event) {
        if self.next_sequence <= ev.sequence {
            self.next_sequence = ev.sequence + 1;
        }
        self.events.insert(ev.key.clone(), ev);
    }

    /// All tracked events in ascending sequence order.
    pub fn snapshot(&self) -> Vec<Event> {
        let mut events: Vec<Event> = self.events.values().cloned().collect();
        events.sort_by_key(|e| e.sequence);
        events
    }

    pub fn clear_all(&mut self) {
        self.events.clear();
        self.next_sequence = 0;
        self.id_by_name.clear();
        self.save_needed = true;
    }

    pub fn clear_by_class(&mut self, class: &str) {
        self.events.retain(|_, ev| ev.class != class);
        self.save_needed = true;
    }

    pub fn clear_by_id(&mut self, id: &str) {
        self.events.retain(|_, ev| ev.id != id);
        self.save_needed = true;
    }

    // chat ------------------------------------------------------------------

    pub fn next_message_id(&mut self) -> i64 {
        let id = self.next_message_id;
        self.next_message_id += 1;
        id
    }

    /// Append a chat event, stamping it with a fresh message id.
    pub fn append_chat(&mut self, mut ev: Event) -> Event {
        let id = self.next_message_id();
        ev.set_message_id(id);
        self.chat.push(ev.clone());
        self.save_needed = true;
        ev
    }

    /// Re-admit a restored chat event and advance the id counter past it.
    pub fn push_loaded_chat(&mut self, ev: Event, message_id: i64) {
        if self.next_message_id <= message_id {
            self.next_message_id = message_id + 1;
        }
        self.chat.push(ev);
    }

    /// Truncate the chat log. An empty target wipes it; a negative target
    /// keeps the most recent `|target|` messages; a non-negative target
    /// drops every message whose id is below it.
    pub fn clear_chat(&mut self, target: &str) -> Result<(), std::num::ParseIntError> {
        if target.is_empty() {
            self.chat.clear();
            self.save_needed = true;
            return Ok(());
        }
        let target: i64 = target.parse()?;
        if target < 0 {
            let keep = (-target) as usize;
            if self.chat.len() > keep {
                self.chat.drain(..self.chat.len() - keep);
                self.save_needed = true;
            }
        } else if !self.chat.is_empty() {
            let n = self
                .chat
                .partition_point(|ev| ev.message_id().unwrap_or(i64::MIN) < target);
            self.chat.drain(..n);
            self.save_needed = true;
        }
        Ok(())
    }

    /// The chat suffix a `SYNC CHAT [target]` replay should cover: all of
    /// it by default, the most recent `|target|` messages for a negative
    /// target, or everything after message id `target` otherwise.
    pub fn chat_suffix(&self, target: Option<i64>) -> &[Event] {
        let start = match target {
            None => 0,
            Some(t) if t < 0 => self.chat.len().saturating_sub((-t) as usize),
            Some(t) => self
                .chat
                .partition_point(|ev| ev.message_id().unwrap_or(i64::MIN) <= t),
        };
        &self.chat[start..]
    }

    // indices ---------------------------------------------------------------

    pub fn record_image(&mut self, name: &str, size: &str, location: &str) {
        self.images
            .insert((name.to_string(), size.to_string()), location.to_string());
        self.save_needed = true;
    }

    pub fn lookup_image(&self, name: &str, size: &str) -> Option<&String> {
        self.images.get(&(name.to_string(), size.to_string()))
    }

    pub fn bind_name(&mut self, name: &str, id: &str) {
        self.id_by_name.insert(name.to_string(), id.to_string());
        self.save_needed = true;
    }

    pub fn unbind_name(&mut self, name: &str) {
        self.id_by_name.remove(name);
        self.save_needed = true;
    }

    pub fn lookup_name(&self, name: &str) -> Option<&String> {
        self.id_by_name.get(name)
    }

    pub fn bind_class(&mut self, id: &str, class: &str) {
        self.class_by_id.insert(id.to_string(), class.to_string());
        self.save_needed = true;
    }

    pub fn lookup_class(&self, id: &str) -> Option<&String> {
        self.class_by_id.get(id)
    }

    /// Write a human-readable snapshot of everything we track to the log.
    pub fn log_dump(&self) {
        info!("dump of current game state:");
        info!("SEQUENCE CLS ID------------------------------ DATA----------------------------");
        for ev in self.snapshot() {
            info!("{:8} {:3} {:<32} {}", ev.sequence, ev.class, ev.id, ev.raw_text());
        }
        info!("{} chat message(s) held", self.chat.len());
        info!("IMAGE-ID------------ SIZE FILE------------------------------------------------");
        for ((name, size), location) in &self.images {
            info!("{name:20} {size:4} {location}");
        }
        info!("ID------------------------------ CLS");
        for (id, class) in &self.class_by_id {
            info!("{id:<32} {class}");
        }
        info!("NAME---------------------------- ID");
        for (name, id) in &self.id_by_name {
            info!("{name:<32} {id}");
        }
        info!("next sequence: {}", self.next_sequence);
        info!("save needed?   {}", self.save_needed);
    }
}

impl Default for MapState {
    fn default() -> Self {
        MapState::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ev(raw: &str) -> Event {
        Event::parse(raw, "", "").unwrap()
    }

    #[test]
    fn newer_events_displace_older_ones_per_key() {
        let mut st = MapState::new();
        st.update(ev("OA x {HEALTH 10}"));
        st.update(ev("OA x {HEALTH 5}"));

        let snap = st.snapshot();
        assert_eq!(snap.len(), 1);
        assert_eq!(snap[0].key, "OA:x:HEALTH");
        assert_eq!(snap[0].fields[2], "HEALTH 5");
    }

    #[test]
    fn distinct_keys_are_independent() {
        let mut st = MapState::new();
        st.update(ev("OA x {NAME Bob}"));
        st.update(ev("OA x {HEALTH 5}"));

        let snap = st.snapshot();
        assert_eq!(snap.len(), 2);
        let keys: Vec<&str> = snap.iter().map(|e| e.key.as_str()).collect();
        assert_eq!(keys, ["OA:x:NAME", "OA:x:HEALTH"]);
    }

    #[test]
    fn snapshot_is_in_admission_order() {
        let mut st = MapState::new();
        st.update(ev("AV 1 1"));
        st.update(ev("PS a c n ar sz player 0 0 5"));
        st.update(ev("AV 2 2")); // displaces the first AV but keeps its new order
        let snap = st.snapshot();
        assert_eq!(snap.len(), 2);
        assert!(snap[0].sequence < snap[1].sequence);
        assert_eq!(snap[1].fields[0], "AV");
    }

    #[test]
    fn clears_by_class_and_id() {
        let mut st = MapState::new();
        st.update(ev("PS p1 c n ar sz player 0 0 5"));
        st.update(ev("PS m1 c n ar sz monster 0 0 5"));
        st.update(ev("OA m1 {HEALTH 5}"));

        st.clear_by_class("M");
        let snap = st.snapshot();
        let ids: Vec<&str> = snap.iter().map(|e| e.id.as_str()).collect();
        assert_eq!(ids, ["p1"]);

        st.clear_by_id("p1");
        assert!(st.snapshot().is_empty());
    }

    #[test]
    fn clear_all_resets_sequence_and_names() {
        let mut st = MapState::new();
        st.update(ev("AV 1 1"));
        st.bind_name("Bob", "x");
        st.clear_all();
        assert!(st.snapshot().is_empty());
        assert!(st.lookup_name("Bob").is_none());
        st.update(ev("AV 2 2"));
        assert_eq!(st.snapshot()[0].sequence, 0);
    }

    #[test]
    fn message_ids_are_monotonic() {
        let mut st = MapState::new();
        let a = st.append_chat(ev("TO u * {one}")).message_id().unwrap();
        let b = st.append_chat(ev("TO u * {two}")).message_id().unwrap();
        assert!(a < b);
    }

    fn chat_fixture(ids: &[i64]) -> MapState {
        let mut st = MapState::new();
        for id in ids {
            let mut e = ev("TO u * {msg}");
            e.set_message_id(*id);
            st.chat.push(e);
        }
        st
    }

    #[test]
    fn chat_truncation_by_id_and_count() {
        // drop everything below id 102
        let mut st = chat_fixture(&[100, 101, 102, 103]);
        st.clear_chat("102").unwrap();
        let ids: Vec<i64> = st.chat.iter().filter_map(|e| e.message_id()).collect();
        assert_eq!(ids, [102, 103]);

        // keep the most recent two
        let mut st = chat_fixture(&[100, 101, 102, 103]);
        st.clear_chat("-2").unwrap();
        let ids: Vec<i64> = st.chat.iter().filter_map(|e| e.message_id()).collect();
        assert_eq!(ids, [102, 103]);

        // wipe
        let mut st = chat_fixture(&[100, 101]);
        st.clear_chat("").unwrap();
        assert!(st.chat.is_empty());

        assert!(chat_fixture(&[1]).clear_chat("bogus").is_err());
    }

    #[test]
    fn chat_suffix_selection() {
        let st = chat_fixture(&[100, 101, 102, 103]);
        let ids = |evs: &[Event]| -> Vec<i64> {
            evs.iter().filter_map(|e| e.message_id()).collect()
        };
        assert_eq!(ids(st.chat_suffix(None)), [100, 101, 102, 103]);
        assert_eq!(ids(st.chat_suffix(Some(-2))), [102, 103]);
        assert_eq!(ids(st.chat_suffix(Some(101))), [102, 103]);
        assert_eq!(ids(st.chat_suffix(Some(999))), Vec::<i64>::new());
        assert_eq!(ids(st.chat_suffix(Some(-99))), [100, 101, 102, 103]);
    }

    #[test]
    fn image_directory_round_trip() {
        let mut st = MapState::new();
        assert!(st.lookup_image("wizard", "2").is_none());
        st.record_image("wizard", "2", "srv/img/wizard@2");
        assert_eq!(
            st.lookup_image("wizard", "2").unwrap(),
            "srv/img/wizard@2"
        );
        assert!(st.lookup_image("wizard", "4").is_none());
    }

    #[test]
    fn loaded_events_advance_counters() {
        let mut st = MapState::new();
        let mut e = ev("AV 1 1");
        e.sequence = 41;
        st.insert_loaded(e);
        st.update(ev("CO on"));
        assert_eq!(st.snapshot().last().unwrap().sequence, 42);

        let start = st.next_message_id;
        let mut c = ev("TO u * {hi}");
        c.set_message_id(start + 100);
        st.push_loaded_chat(c, start + 100);
        let next = st.append_chat(ev("TO u * {later}")).message_id().unwrap();
        assert_eq!(next, start + 101);
    }
}
