//! The shared server core: the client registry, the state store behind its
//! reader-writer lock, and the operations that talk to many sessions at
//! once (roster broadcasts, keep-alive pings, full-state sync, preset
//! pushes).

use std::collections::HashMap;
use std::net::SocketAddr;
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use mapwire::preset::RollPreset;
use mapwire::list;
use parking_lot::RwLock;
use sha2::{Digest, Sha256};
use tracing::{info, warn};

use crate::auth::Passwords;
use crate::persist::Storage;
use crate::session::{now_unix, ClientSession};
use crate::state::MapState;

/// Client commands replayed to every connecting client, parsed from the
/// init file. A bare `SYNC` line is a directive (sync the client right
/// after authentication) rather than preamble text.
#[derive(Debug, Clone, Default)]
pub struct Preamble {
    pub lines: Vec<String>,
    pub sync_on_connect: bool,
}

pub fn load_preamble(path: &Path) -> std::io::Result<Preamble> {
    let mut preamble = Preamble::default();
    for line in std::fs::read_to_string(path)?.lines() {
        if line == "SYNC" {
            preamble.sync_on_connect = true;
        } else if line.starts_with("LOAD") {
            info!(line, "ignoring deprecated init-file directive");
        } else {
            preamble.lines.push(line.to_string());
        }
    }
    Ok(preamble)
}

pub struct Service {
    pub clients: RwLock<HashMap<SocketAddr, Arc<ClientSession>>>,
    pub state: RwLock<MapState>,
    pub presets: RwLock<HashMap<String, Vec<RollPreset>>>,
    pub storage: Option<Storage>,
    pub passwords: Option<Passwords>,
    pub accepting: AtomicBool,
}

impl Service {
    pub fn new(storage: Option<Storage>, passwords: Option<Passwords>) -> Service {
        Service {
            clients: RwLock::new(HashMap::new()),
            state: RwLock::new(MapState::new()),
            presets: RwLock::new(HashMap::new()),
            storage,
            passwords,
            accepting: AtomicBool::new(true),
        }
    }

    /// Snapshot of the registry, so callers iterate without holding the
    /// registry lock.
    pub fn all_clients(&self) -> Vec<Arc<ClientSession>> {
        self.clients.read().values().cloned().collect()
    }

    pub fn add_client(&self, session: Arc<ClientSession>) -> anyhow::Result<()> {
        let count = {
            let mut clients = self.clients.write();
            if clients.contains_key(&session.addr) {
                anyhow::bail!("already tracking a connection for client {}", session.addr);
            }
            clients.insert(session.addr, session.clone());
            clients.len()
        };
        info!(count, "connected client registered");
        self.notify_peer_change(&session.username(), "joined");
        Ok(())
    }

    pub fn remove_client(&self, addr: SocketAddr) {
        let (removed, count) = {
            let mut clients = self.clients.write();
            let removed = clients.remove(&addr);
            (removed, clients.len())
        };
        if let Some(old) = removed {
            info!(count, client = %addr, "connected client removed");
            self.notify_peer_change(&old.username(), "left");
        }
    }

    /// Tell every authenticated client about a roster change, following up
    /// with a fresh roster block so nobody needs to poll.
    pub fn notify_peer_change(&self, username: &str, action: &str) {
        for peer in self.all_clients() {
            if peer.is_authenticated() {
                peer.send(&["//", username, action]);
                self.conn_response(&peer);
            }
        }
    }

    /// Answer `/CONN`: one `CONN:` row per connected client, between a
    /// `CONN` header and a checksummed `CONN.` trailer.
    pub fn conn_response(&self, me: &ClientSession) {
        me.send(&["CONN"]);
        let mut cksum = Sha256::new();
        let now = now_unix();
        let mut peers = self.all_clients();
        peers.sort_by_key(|p| p.addr);

        let mut count = 0usize;
        for peer in peers {
            let who = if peer.addr == me.addr { "you" } else { "peer" };
            let auth = if peer.is_authenticated() { "1" } else { "0" };
            let wo = if peer.write_only.load(Ordering::Relaxed) {
                "1"
            } else {
                "0"
            };
            let active = (now - peer.last_heard.load(Ordering::Relaxed)).to_string();
            let row = [
                count.to_string(),
                who.to_string(),
                peer.addr.to_string(),
                peer.username(),
                peer.client_ident.read().clone(),
                auth.to_string(),
                "0".to_string(),
                wo.to_string(),
                active,
            ];
            cksum.update(list::encode(&row).as_bytes());
            let mut line = vec!["CONN:".to_string()];
            line.extend(row);
            me.send(&line);
            count += 1;
        }
        let count = count.to_string();
        let sum = STANDARD.encode(cksum.finalize());
        me.send(&["CONN.", count.as_str(), sum.as_str()]);
    }

    /// Keep-alive sweep. Unauthenticated clients get a limited number of
    /// pings before being dropped. Returns whether anyone was pinged.
    pub fn ping_all(&self) -> bool {
        let mut pinged = 0usize;
        for client in self.all_clients() {
            if !client.is_authenticated() {
                let pings = client
                    .unauthenticated_pings
                    .fetch_add(1, Ordering::Relaxed)
                    + 1;
                if pings > 2 {
                    warn!(client = %client.addr, "timeout waiting for successful authentication");
                    client.send(&["DENIED", "No successful login made in time."]);
                    client.close();
                }
            }
            client.send(&["MARCO"]);
            pinged += 1;
        }
        if pinged > 0 {
            info!(count = pinged, "pinged clients");
        }
        pinged > 0
    }

    /// Replay the whole tracked game state to one client, bracketed by
    /// comments and a leading full clear so the client starts from zero.
    pub fn sync(&self, session: &ClientSession) {
        let events = self.state.read().snapshot();
        session.send(&["//", "DUMP OF CURRENT GAME STATE FOLLOWS"]);
        session.send(&["CLR", "*"]);
        for ev in &events {
            session.send_event(ev);
        }
        session.send(&["//", "END OF STATE DUMP"]);
    }

    /// Send a user's preset catalog to one of their sessions: `DD=`, the
    /// `DD:` rows, and a checksummed `DD.` trailer.
    pub fn send_presets_to(&self, session: &ClientSession, username: &str) {
        session.send(&["DD="]);
        let mut cksum = Sha256::new();
        let presets = self.presets.read();
        let mine = presets.get(username).map(Vec::as_slice).unwrap_or(&[]);
        for (i, preset) in mine.iter().enumerate() {
            let row = [
                i.to_string(),
                preset.name.clone(),
                preset.description.clone(),
                preset.roll_spec.clone(),
            ];
            cksum.update(list::encode(&row).as_bytes());
            let mut line = vec!["DD:".to_string()];
            line.extend(row);
            session.send(&line);
        }
        let count = mine.len().to_string();
        let sum = STANDARD.encode(cksum.finalize());
        session.send(&["DD.", count.as_str(), sum.as_str()]);
    }

    /// Multi-device preset sync: after a user edits their presets on one
    /// connection, refresh every other connection logged in as them.
    pub fn push_presets_to_other_sessions(&self, origin: &ClientSession, username: &str) {
        for peer in self.all_clients() {
            if peer.addr != origin.addr && peer.username() == username {
                self.send_presets_to(&peer, username);
            }
        }
    }

    /// Persist state and presets if anything changed; failures are logged
    /// and reported, never fatal, and the in-memory state stays
    /// authoritative for the next attempt.
    pub fn save(&self) {
        let Some(storage) = &self.storage else {
            return;
        };
        let needed = self.state.read().save_needed;
        if !needed {
            info!("game state does not need to be saved");
            return;
        }
        let result = {
            let state = self.state.read();
            storage.save_state(&state)
        };
        match result {
            Ok(()) => {
                self.state.write().save_needed = false;
                if let Err(e) = storage.save_presets(&self.presets.read()) {
                    warn!(err = %e, "error saving dice presets");
                }
                info!("game state saved");
            }
            Err(e) => warn!(err = %e, "error saving game state"),
        }
    }
}
