//! The command dispatcher: one switch on the event type, turning each
//! inbound client message into zero or more outbound messages plus state
//! store updates, under the privacy and privilege rules.

use std::collections::HashMap;
use std::sync::atomic::Ordering;
use std::sync::Arc;

use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use mapwire::event::{strip_creature_base_name, Event};
use mapwire::list;
use mapwire::preset::preset_list_from_wire;
use sha2::{Digest, Sha256};
use tracing::{info, warn};

use crate::service::Service;
use crate::session::ClientSession;

/// Reader-local buffer for an in-flight multi-line block transfer.
#[derive(Debug, Default)]
pub struct Ingest {
    kind: String,
    data: Vec<String>,
}

impl Service {
    /// Act on one incoming event from a client. Most are relayed to the
    /// other clients; a few require special processing here. Whatever is
    /// left carrying a dedup key is admitted to the state store.
    pub fn execute(&self, mut ev: Event, session: &Arc<ClientSession>, ingest: &mut Ingest) {
        let etype = ev.etype().to_string();
        match etype.as_str() {
            // Pure no-op; the client is answering our keep-alive below.
            "MARCO" => return,
            "POLO" => {
                session.heard_from();
                return;
            }

            // Server-to-client messages clients may not originate.
            "AC" | "CONN" | "CONN:" | "CONN." | "DENIED" | "GRANTED" | "ROLL" | "OK"
            | "PRIV" => {
                session.send(&[
                    "//",
                    "Clients not allowed to send this command",
                    etype.as_str(),
                ]);
            }

            // Plain relays.
            "//" | "AI" | "AI:" | "AI." | "AV" | "CLR@" | "L" | "M" | "M?" | "M@" | "MARK" => {
                self.send_to_others(session, &ev.fields);
            }

            // Privileged relays: the GM's table, nobody else's.
            "CO" | "CS" | "DSM" | "I" | "IL" | "TB" => {
                let allowed = session.is_authenticated()
                    && (self.passwords.is_none() || session.is_gm());
                if !allowed {
                    warn!(client = %session.addr, command = %etype,
                        "denied privileged command to non-GM user");
                    let refusal = format!("You are not authorized to use the {etype} command");
                    session.send(&["PRIV", refusal.as_str()]);
                    return;
                }
                self.send_to_others(session, &ev.fields);
            }

            // ACCEPT <list>: restrict what this client receives; * clears.
            "ACCEPT" => {
                if ev.fields[1] == "*" {
                    session.set_accepted(None);
                } else {
                    match list::decode(&ev.fields[1]) {
                        Ok(allowed) => session.set_accepted(Some(allowed)),
                        Err(e) => {
                            warn!(client = %session.addr, err = %e,
                                "error understanding ACCEPT command");
                        }
                    }
                }
            }

            // AI? <name> <size>: answer from the image directory when we
            // can, otherwise let the other clients take the question.
            "AI?" => {
                let known = self
                    .state
                    .read()
                    .lookup_image(&ev.fields[1], &ev.fields[2])
                    .cloned();
                match known {
                    Some(location) => session.send(&[
                        "AI@",
                        ev.fields[1].as_str(),
                        ev.fields[2].as_str(),
                        location.as_str(),
                    ]),
                    None => self.send_to_others(session, &ev.fields),
                }
            }

            // AI@ <name> <size> <server_id>: learn where an image lives.
            "AI@" => {
                self.state
                    .write()
                    .record_image(&ev.fields[1], &ev.fields[2], &ev.fields[3]);
                self.send_to_others(session, &ev.fields);
            }

            // A bit late for this one to arrive now.
            "AUTH" => {
                session.send(&["//", "AUTH command after authentication step ignored."]);
            }

            "CC" => {
                self.clear_chat_command(ev, session);
                return;
            }

            "CLR" => {
                match ev.fields[1].as_str() {
                    "*" => self.state.write().clear_all(),
                    "E*" | "M*" | "P*" => {
                        self.state.write().clear_by_class(&ev.fields[1][..1])
                    }
                    selector => {
                        // creature name (possibly <image>=<name>) or plain id
                        let name = strip_creature_base_name(selector);
                        let target = self
                            .state
                            .read()
                            .lookup_name(name)
                            .cloned()
                            .unwrap_or_else(|| selector.to_string());
                        self.state.write().clear_by_id(&target);
                    }
                }
                self.send_to_others(session, &ev.fields);
            }

            "D" => {
                self.roll_dice_command(&ev, session);
            }

            "DD" | "DD+" => {
                self.define_presets_command(&ev, session, etype == "DD+");
            }

            "DD/" => {
                self.filter_presets_command(&ev, session);
            }

            "DR" => {
                if self.preset_user(session).is_none() {
                    warn!(client = %session.addr, "DR command without an authenticated user");
                    return;
                }
                let username = session.username();
                let empty = self
                    .presets
                    .read()
                    .get(&username)
                    .map_or(true, Vec::is_empty);
                if empty {
                    session.send(&["DD="]);
                    session.send(&["DD.", "0", ""]);
                    return;
                }
                self.send_presets_to(session, &username);
            }

            "LS" => {
                if !ingest.kind.is_empty() || !ingest.data.is_empty() {
                    warn!(client = %session.addr, abandoned = ingest.data.len(),
                        "LS block opened before the previous one completed");
                }
                ingest.kind = "LS".into();
                ingest.data.clear();
                return; // an incomplete block never reaches the store
            }

            "LS:" => {
                if ingest.kind != "LS" {
                    warn!(client = %session.addr, "LS: line outside an LS block (ignored)");
                    return;
                }
                ingest
                    .data
                    .push(ev.fields.get(1).cloned().unwrap_or_default());
                return;
            }

            "LS." => {
                if ingest.kind != "LS" {
                    warn!(client = %session.addr, "LS. line outside an LS block (ignored)");
                    return;
                }
                let data = std::mem::take(&mut ingest.data);
                ingest.kind.clear();
                if let Err(reason) = self.close_ls_block(&ev, session, &data) {
                    warn!(client = %session.addr, reason = %reason, "LS block rejected");
                    session.send(&["//", "LS block rejected:", reason.as_str()]);
                }
                return;
            }

            // Client opts out of receiving traffic. NO+ is an obsolete
            // synonym.
            "NO" | "NO+" => {
                session.write_only.store(true, Ordering::Relaxed);
            }

            "OA" => {
                if !self.object_attribute_command(&mut ev, session, true) {
                    return;
                }
                self.send_to_others(session, &ev.fields);
            }

            "OA+" | "OA-" => {
                if !self.object_attribute_command(&mut ev, session, false) {
                    return;
                }
                self.send_to_others(session, &ev.fields);
            }

            // PS <id> <color> <name> ...: placing a creature also binds its
            // name for later @name references.
            "PS" => {
                self.state.write().bind_name(&ev.fields[3], &ev.fields[1]);
                self.send_to_others(session, &ev.fields);
            }

            "SYNC" => {
                self.sync_command(&ev, session);
                return; // a SYNC is never part of the game state
            }

            "TO" => {
                self.chat_message_command(ev, session);
                return;
            }

            "/CONN" => {
                self.conn_response(session);
            }

            other => {
                // parse validated the type already; nothing to do
                warn!(client = %session.addr, command = other, "unhandled event type");
            }
        }

        // Anything carrying a dedup key becomes part of the tracked state.
        self.state.write().update(ev);
    }

    pub fn send_to_others<S: AsRef<str>>(&self, me: &ClientSession, values: &[S]) {
        for peer in self.all_clients() {
            if peer.addr != me.addr {
                peer.send(values);
            }
        }
    }

    /// Dice and preset errors go back to the requester as a self-addressed
    /// chat message.
    fn send_error_to(&self, session: &ClientSession, message: &str) {
        let user = session.username();
        let id = self.state.write().next_message_id().to_string();
        session.send(&["TO", user.as_str(), user.as_str(), message, id.as_str()]);
    }

    // CC [user [target [id]]]: truncate the chat log, then record and relay
    // the CC itself with a fresh message id.
    fn clear_chat_command(&self, mut ev: Event, session: &Arc<ClientSession>) {
        if ev.fields.len() < 2 {
            ev.fields.push("*".into());
        }
        if ev.fields.len() < 3 {
            ev.fields.push(String::new());
        }
        if ev.fields.len() < 4 {
            ev.fields.push("0".into());
        }

        let target = ev.fields[2].clone();
        if let Err(e) = self.state.write().clear_chat(&target) {
            let complaint = format!("CC command rejected; invalid target: {e}");
            session.send(&["//", complaint.as_str()]);
            return;
        }
        let stamped = self.state.write().append_chat(ev);
        self.send_to_others(session, &stamped.fields);
    }

    // D <recipients> <dice>: evaluate, record each structured result as a
    // ROLL chat event, and distribute per the recipient list. `%` routes to
    // the GM alone, acknowledged back to the roller.
    fn roll_dice_command(&self, ev: &Event, session: &Arc<ClientSession>) {
        let rolled = session.dice.lock().do_roll(&ev.fields[2]);
        let (title, results) = match rolled {
            Ok(r) => r,
            Err(e) => {
                self.send_error_to(session, &format!("ERROR: die roll request not accepted: {e}"));
                return;
            }
        };
        let to_list = match list::decode(&ev.fields[1]) {
            Ok(l) => l,
            Err(e) => {
                self.send_error_to(
                    session,
                    &format!("ERROR: die roll recipient list not understood: {e}"),
                );
                return;
            }
        };
        let to_all = to_list.iter().any(|r| r == "*");
        let to_gm = to_list.iter().any(|r| r == "%");
        let username = session.username();

        for result in results {
            let details: Vec<String> = result
                .details
                .iter()
                .map(|d| list::encode(&[d.kind, d.value.as_str()]))
                .collect();
            let fields = vec![
                "ROLL".to_string(),
                username.clone(),
                ev.fields[1].clone(),
                title.clone(),
                result.total.to_string(),
                list::encode(&details),
                String::new(),
            ];
            let response = match Event::from_fields(fields, "", "") {
                Ok(r) => r,
                Err(e) => {
                    warn!(err = %e, "internal error creating ROLL event");
                    return;
                }
            };
            let response = self.state.write().append_chat(response);

            if to_gm {
                // only to the GM's client(s), with an ack for the roller
                for peer in self.all_clients() {
                    if peer.write_only.load(Ordering::Relaxed) || !peer.is_authenticated() {
                        continue;
                    }
                    if peer.username() == "GM" {
                        peer.send(&response.fields);
                    } else if peer.addr == session.addr {
                        let note =
                            list::encode(&[list::encode(&["comment", "Results sent to GM"])]);
                        let mut ack = Event::from_fields(
                            vec![
                                "ROLL".to_string(),
                                username.clone(),
                                ev.fields[1].clone(),
                                title.clone(),
                                "*".to_string(),
                                note,
                                String::new(),
                            ],
                            "",
                            "",
                        )
                        .expect("ack event shape is fixed");
                        let id = self.state.write().next_message_id();
                        ack.set_message_id(id);
                        session.send(&ack.fields);
                    }
                }
            } else {
                for peer in self.all_clients() {
                    if peer.write_only.load(Ordering::Relaxed) || !peer.is_authenticated() {
                        continue;
                    }
                    if !to_all
                        && peer.addr != session.addr
                        && !to_list.iter().any(|r| *r == peer.username())
                    {
                        continue;
                    }
                    peer.send(&response.fields);
                }
            }
        }
    }

    // Die-roll presets require a username to attach them to and a place to
    // keep them.
    fn preset_user(&self, session: &ClientSession) -> Option<String> {
        if self.passwords.is_none() || !session.is_authenticated() {
            return None;
        }
        Some(session.username())
    }

    fn define_presets_command(&self, ev: &Event, session: &Arc<ClientSession>, append: bool) {
        let Some(username) = self.preset_user(session) else {
            warn!(client = %session.addr, "preset command without an authenticated user");
            return;
        };
        let Some(storage) = &self.storage else {
            self.send_error_to(
                session,
                "ERROR: die roll preset could not be stored: the system administrator has \
                 not configured persistent storage.",
            );
            return;
        };
        let mut new_set = match preset_list_from_wire(&ev.fields[1]) {
            Ok(s) => s,
            Err(e) => {
                warn!(client = %session.addr, err = %e, "bad preset list");
                self.send_error_to(session, &format!("ERROR: die roll preset not understood: {e}"));
                return;
            }
        };
        if append {
            if let Some(old) = self.presets.read().get(&username) {
                let mut merged = old.clone();
                merged.append(&mut new_set);
                new_set = merged;
            }
        }
        if let Err(e) = storage.update_presets(&username, &new_set) {
            warn!(client = %session.addr, err = %e, "preset store failed");
            self.send_error_to(
                session,
                &format!("ERROR: die roll preset could not be stored: {e}"),
            );
            return;
        }
        self.presets.write().insert(username.clone(), new_set);
        self.push_presets_to_other_sessions(session, &username);
    }

    // DD/ <regex>: drop this user's presets whose names match.
    fn filter_presets_command(&self, ev: &Event, session: &Arc<ClientSession>) {
        let Some(username) = self.preset_user(session) else {
            warn!(client = %session.addr, "preset command without an authenticated user");
            return;
        };
        let Some(storage) = &self.storage else {
            self.send_error_to(
                session,
                "ERROR: die roll preset could not be stored: the system administrator has \
                 not configured persistent storage.",
            );
            return;
        };
        let old = match self.presets.read().get(&username) {
            Some(list) if !list.is_empty() => list.clone(),
            _ => return, // nothing to filter
        };
        let pattern = match regex::Regex::new(&ev.fields[1]) {
            Ok(p) => p,
            Err(e) => {
                self.send_error_to(
                    session,
                    &format!("ERROR: die roll filter regex not understood: {e}"),
                );
                return;
            }
        };
        let new_set: Vec<_> = old
            .into_iter()
            .filter(|p| !pattern.is_match(&p.name))
            .collect();
        if let Err(e) = storage.update_presets(&username, &new_set) {
            self.send_error_to(
                session,
                &format!("ERROR: die roll filter results could not be stored: {e}"),
            );
            return;
        }
        self.presets.write().insert(username.clone(), new_set);
        self.push_presets_to_other_sessions(session, &username);
    }

    // Validate a completed LS block and repackage it into one stored event
    // per object. A block that fails validation mutates nothing.
    fn close_ls_block(
        &self,
        ev: &Event,
        session: &Arc<ClientSession>,
        data: &[String],
    ) -> Result<(), String> {
        let expected: usize = ev.fields[1]
            .parse()
            .map_err(|e| format!("count value not understood: {e}"))?;
        if data.len() != expected {
            return Err(format!(
                "received {} rows but the trailer promised {expected}",
                data.len()
            ));
        }
        match ev.fields.get(2).filter(|s| !s.is_empty()) {
            Some(cks) => {
                let expected_sum = STANDARD
                    .decode(cks)
                    .map_err(|e| format!("checksum value not understood: {e}"))?;
                let mut h = Sha256::new();
                for row in data {
                    h.update(row.as_bytes());
                }
                if h.finalize().as_slice() != expected_sum.as_slice() {
                    return Err("checksum mismatch".into());
                }
            }
            None => {
                warn!(client = %session.addr, "LS block without checksum (won't validate)");
            }
        }

        // First pass: parse and classify every row before touching any
        // state, so a bad row rejects the whole block cleanly.
        let mut data_by_id: HashMap<String, Vec<String>> = HashMap::new();
        let mut class_updates: Vec<(String, String)> = Vec::new();
        let mut name_updates: Vec<(String, String)> = Vec::new();
        for row in data {
            let item = list::decode(row).map_err(|e| format!("bad object row {row:?}: {e}"))?;
            if item.is_empty() {
                continue;
            }
            if item.len() < 2 {
                return Err(format!("bad object row {row:?}"));
            }
            match item[0].as_str() {
                // creature attribute rows: <M|P> <ATTR>:<id> <value>...
                "M" | "P" => {
                    let (attr, id) = item[1]
                        .split_once(':')
                        .ok_or_else(|| format!("bad object row {row:?}"))?;
                    data_by_id.entry(id.to_string()).or_default().push(row.clone());
                    class_updates.push((id.to_string(), item[0].clone()));
                    if attr == "NAME" {
                        let name = item
                            .get(2)
                            .ok_or_else(|| format!("bad object row {row:?}"))?;
                        name_updates
                            .push((strip_creature_base_name(name).to_string(), id.to_string()));
                    }
                }
                // file references stand alone
                "F" => {
                    data_by_id.insert(item[1].clone(), vec![row.clone()]);
                    class_updates.push((item[1].clone(), String::new()));
                }
                // map element rows: <ATTR>:<id> <value>...
                other => {
                    let (_, id) = other
                        .split_once(':')
                        .ok_or_else(|| format!("bad object row {row:?}"))?;
                    data_by_id.entry(id.to_string()).or_default().push(row.clone());
                    class_updates.push((id.to_string(), "E".into()));
                }
            }
        }

        // The block is good: stream it to the peers as received.
        self.send_to_others(session, &["LS"]);
        for row in data {
            self.send_to_others(session, &["LS:", row.as_str()]);
        }
        self.send_to_others(session, &ev.fields);

        // Apply index updates and admit one synthetic block per object.
        {
            let mut state = self.state.write();
            for (id, class) in class_updates {
                state.bind_class(&id, &class);
            }
            for (name, id) in name_updates {
                state.bind_name(&name, &id);
            }
            for (obj_id, rows) in data_by_id {
                let mut h = Sha256::new();
                let mut elements = Vec::with_capacity(rows.len() + 1);
                for row in &rows {
                    h.update(row.as_bytes());
                    elements.push(list::encode(&["LS:", row.as_str()]));
                }
                elements.push(format!(
                    "LS. {} {}",
                    rows.len(),
                    STANDARD.encode(h.finalize())
                ));
                let class = state.lookup_class(&obj_id).cloned().unwrap_or_default();
                let mut block = Event::parse("LS", &obj_id, &class)
                    .map_err(|e| format!("internal error packaging object {obj_id}: {e}"))?;
                block.multi_raw_data = elements;
                state.update(block);
            }
        }
        Ok(())
    }

    // OA family: resolve @name targets through the name index, enrich the
    // event with any known class, and (for plain OA) keep the name index in
    // step with NAME changes. Returns false when the command is dropped.
    fn object_attribute_command(
        &self,
        ev: &mut Event,
        session: &Arc<ClientSession>,
        scan_for_name: bool,
    ) -> bool {
        let etype = ev.etype().to_string();
        if ev.fields[1].is_empty() || ev.fields[1] == "@" {
            warn!(client = %session.addr, command = %etype, "rejected empty ID field");
            return false;
        }
        let kvlist = if scan_for_name {
            match list::decode(&ev.fields[2]) {
                Ok(kv) if kv.len() % 2 == 0 => kv,
                Ok(kv) => {
                    warn!(client = %session.addr, len = kv.len(),
                        "OA kvlist has an odd number of elements");
                    return false;
                }
                Err(e) => {
                    warn!(client = %session.addr, err = %e, "cannot parse OA kvlist");
                    return false;
                }
            }
        } else {
            Vec::new()
        };

        let mut target = String::new();
        let mut old_name = String::new();
        if let Some(name_ref) = ev.fields[1].strip_prefix('@') {
            let name = strip_creature_base_name(name_ref).to_string();
            let st = self.state.read();
            match st.lookup_name(&name).cloned() {
                Some(id) => {
                    if let Some(class) = st.lookup_class(&id) {
                        ev.class = class.clone();
                    }
                    ev.id = id.clone();
                    target = id;
                    old_name = name;
                }
                None => {
                    ev.id.clear();
                    info!(client = %session.addr, name = %ev.fields[1],
                        "unknown object name (attempting best try)");
                }
            }
        } else {
            target = ev.fields[1].clone();
            if let Some(class) = self.state.read().lookup_class(&target) {
                ev.class = class.clone();
            }
            ev.id = target.clone();
        }

        if scan_for_name {
            for pair in kvlist.chunks(2) {
                if pair[0] == "NAME" {
                    if !target.is_empty() {
                        let mut st = self.state.write();
                        if !old_name.is_empty() {
                            st.unbind_name(&old_name);
                        }
                        st.bind_name(&pair[1], &target);
                    }
                    break;
                }
            }
        }
        true
    }

    // SYNC replays the state; SYNC CHAT [target] replays the chat suffix,
    // honoring per-message recipient visibility.
    fn sync_command(&self, ev: &Event, session: &Arc<ClientSession>) {
        if ev.fields.len() == 1 {
            self.sync(session);
            return;
        }
        if ev.fields[1] != "CHAT" {
            warn!(client = %session.addr, "SYNC command not understood");
            return;
        }
        let target = if ev.fields.len() > 2 {
            match ev.fields[2].parse::<i64>() {
                Ok(t) => Some(t),
                Err(e) => {
                    warn!(client = %session.addr, err = %e,
                        "SYNC CHAT target value not understood");
                    return;
                }
            }
        } else {
            None
        };
        let username = session.username();
        let messages: Vec<Event> = self
            .state
            .read()
            .chat_suffix(target)
            .iter()
            .filter(|m| m.can_send_to(&username))
            .cloned()
            .collect();
        for message in messages {
            session.send(&message.fields);
        }
    }

    // TO <from> <recipients> <message> [<id>]: the sender field is forced
    // to the authenticated username and the id is always server-assigned.
    fn chat_message_command(&self, mut ev: Event, session: &Arc<ClientSession>) {
        if ev.fields.len() == 4 {
            ev.fields.push(String::new());
        }
        let to_list = match list::decode(&ev.fields[2]) {
            Ok(l) => l,
            Err(e) => {
                self.send_error_to(session, &format!("ERROR: recipient list not understood: {e}"));
                return;
            }
        };
        let to_all = to_list.iter().any(|r| r == "*");
        ev.fields[1] = session.username();
        let stamped = self.state.write().append_chat(ev);

        for peer in self.all_clients() {
            if peer.write_only.load(Ordering::Relaxed)
                || !peer.is_authenticated()
                || peer.addr == session.addr
            {
                continue;
            }
            if !to_all && !to_list.iter().any(|r| *r == peer.username()) {
                continue;
            }
            peer.send(&stamped.fields);
        }
        // the sender always sees their own message with its assigned id
        session.send(&stamped.fields);
    }
}
