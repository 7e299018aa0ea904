//! One parsed client message plus the server-assigned metadata that the
//! state store needs: a dedup key, an object id/class, a sequence number,
//! and (for block transfers) extra raw payload lines.

use crate::list;
use crate::WireError;

/// Dedup keys identify "the same logical state slot" across successive
/// events: the store keeps at most one event per key, newest wins.
#[derive(Debug, Clone, Default)]
pub struct Event {
    /// Command token plus its fields, in wire order.
    pub fields: Vec<String>,
    /// Extra raw payload lines for block-transfer events (`LS`).
    pub multi_raw_data: Vec<String>,
    /// Admission order in the state store; assigned by the store.
    pub sequence: u64,
    /// Dedup key, or "" for events the store does not track.
    pub key: String,
    /// Object class tag: "P", "M", "E", or "" when unknown.
    pub class: String,
    /// Target object id, or "" when the event has none.
    pub id: String,
}

/// Allowed field counts per command (type excluded; max `-1` = unbounded).
fn arity(etype: &str) -> Option<(usize, i32)> {
    Some(match etype {
        "//" => (0, -1),
        "ACCEPT" => (1, 1),
        "AI" => (2, 2),
        "AI:" => (1, 1),
        "AI." => (1, 2),
        "AI?" => (2, 2),
        "AI@" => (3, 3),
        "AUTH" => (1, 3),
        "AV" => (2, 2),
        "CC" => (0, 3),
        "CLR" => (1, 1),
        "CLR@" => (1, 1),
        "CO" => (1, 1),
        "CS" => (2, 2),
        "D" => (2, 2),
        "DD" => (1, 1),
        "DD+" => (1, 1),
        "DD/" => (1, 1),
        "DR" => (0, 0),
        "DSM" => (3, 3),
        "I" => (2, 2),
        "IL" => (1, 1),
        "L" => (1, 1),
        "LS" => (0, 0),
        "LS:" => (0, 1),
        "LS." => (1, 2),
        "M" => (1, 1),
        "M?" => (1, 1),
        "M@" => (1, 1),
        "MARK" => (2, 2),
        "MARCO" => (0, 0),
        "NO" => (0, 0),
        "NO+" => (0, 0),
        "OA" => (2, 2),
        "OA+" => (3, 3),
        "OA-" => (3, 3),
        "POLO" => (0, 0),
        "PS" => (9, 9),
        "ROLL" => (6, 6),
        "SYNC" => (0, 2),
        "TB" => (1, 1),
        "TO" => (3, 4),
        "/CONN" => (0, 0),
        _ => return None,
    })
}

impl Event {
    /// Parse a raw wire line. `obj_id` and `obj_class` may be supplied by
    /// the caller when the line itself does not carry them (block transfers
    /// and restored state); an id that disagrees with an embedded one is an
    /// error.
    pub fn parse(raw: &str, obj_id: &str, obj_class: &str) -> Result<Event, WireError> {
        let fields = list::decode(raw)?;
        Event::from_fields(fields, obj_id, obj_class)
    }

    pub fn from_fields(
        fields: Vec<String>,
        obj_id: &str,
        obj_class: &str,
    ) -> Result<Event, WireError> {
        let mut ev = Event {
            fields,
            class: obj_class.to_string(),
            id: obj_id.to_string(),
            ..Event::default()
        };
        ev.validate()?;

        match ev.etype() {
            "LS" => {
                // Multi-line payload: the id cannot be scraped from the raw
                // data, so the caller must have supplied it.
                ev.key = format!("LS:{}", ev.id);
            }
            "OA" => {
                ev.take_embedded_id(1)?;
                let kv = list::decode(&ev.fields[2])?;
                let mut keys: Vec<&str> =
                    kv.iter().step_by(2).map(String::as_str).collect();
                keys.sort_unstable();
                ev.key = format!("OA:{}:{}", ev.id, keys.join(":"));
                if ev.class.is_empty() {
                    ev.class = guess_object_class(keys.iter().copied()).to_string();
                }
            }
            "OA+" | "OA-" => {
                let etype = ev.etype().to_string();
                ev.take_embedded_id(1)?;
                let mut values = list::decode(&ev.fields[3])?;
                values.sort_unstable();
                ev.key = format!(
                    "{etype}:{}:{}:{}",
                    ev.id,
                    ev.fields[2],
                    values.join(":")
                );
                if ev.class.is_empty() {
                    ev.class =
                        guess_object_class(std::iter::once(ev.fields[2].as_str())).to_string();
                }
            }
            "CLR" | "CLR@" | "M?" | "M@" => {
                ev.key = format!("{}:{}", ev.etype(), ev.fields[1]);
            }
            "PS" => {
                ev.take_embedded_id(1)?;
                ev.key = format!("PS:{}", ev.id);
                ev.class = match ev.fields[6].as_str() {
                    "player" => "P".to_string(),
                    "monster" => "M".to_string(),
                    other => {
                        return Err(WireError::UnknownType(format!(
                            "PS record for {} has class {other} which is undefined",
                            ev.id
                        )))
                    }
                };
            }
            // Singletons: only the most recent one matters.
            "AV" | "CO" | "CS" | "I" | "IL" | "TB" => {
                ev.key = ev.etype().to_string();
            }
            // Everything else is stateless and never stored.
            _ => {}
        }

        Ok(ev)
    }

    fn validate(&self) -> Result<(), WireError> {
        let etype = self.etype();
        let Some((min, max)) = arity(etype) else {
            return Err(WireError::UnknownType(etype.to_string()));
        };
        let n = self.fields.len() - 1;
        if n < min || (max >= 0 && n > max as usize) {
            return Err(WireError::Arity {
                etype: etype.to_string(),
                got: n,
            });
        }
        Ok(())
    }

    // Adopt fields[idx] as the object id, or verify it against a
    // caller-supplied one.
    fn take_embedded_id(&mut self, idx: usize) -> Result<(), WireError> {
        if self.id.is_empty() {
            self.id = self.fields[idx].clone();
        } else if self.id != self.fields[idx] {
            return Err(WireError::IdConflict {
                etype: self.etype().to_string(),
                embedded: self.fields[idx].clone(),
                applied: self.id.clone(),
            });
        }
        Ok(())
    }

    pub fn etype(&self) -> &str {
        self.fields.first().map(String::as_str).unwrap_or("")
    }

    pub fn raw_text(&self) -> String {
        list::encode(&self.fields)
    }

    pub fn is_chat(&self) -> bool {
        matches!(self.etype(), "CC" | "TO" | "ROLL")
    }

    // Chat events carry their message id at a type-specific position:
    //   CC   <user> <target> <id>
    //   TO   <from> <to> <message> <id>
    //   ROLL <from> <to> <title> <result> <list> <id>
    fn message_id_index(&self) -> Option<usize> {
        match self.etype() {
            "CC" => Some(3),
            "TO" => Some(4),
            "ROLL" => Some(6),
            _ => None,
        }
    }

    pub fn message_id(&self) -> Option<i64> {
        let idx = self.message_id_index()?;
        self.fields.get(idx)?.parse().ok()
    }

    /// Stamp a freshly assigned message id into the event's fields, padding
    /// out any optional fields the client omitted.
    pub fn set_message_id(&mut self, id: i64) {
        if let Some(idx) = self.message_id_index() {
            while self.fields.len() <= idx {
                self.fields.push(String::new());
            }
            self.fields[idx] = id.to_string();
        }
    }

    /// Recipient visibility: non-chat events go to everyone; chat events go
    /// to named recipients, to everyone on `*`, and only to the GM on `%`.
    pub fn can_send_to(&self, recipient: &str) -> bool {
        if !matches!(self.etype(), "TO" | "ROLL") {
            return true;
        }
        let Ok(to_list) = list::decode(&self.fields[2]) else {
            return false;
        };
        let mut to_all = false;
        for person in &to_list {
            match person.as_str() {
                "*" => to_all = true,
                "%" => return recipient == "GM",
                p if p == recipient => return true,
                _ => {}
            }
        }
        to_all
    }
}

/// Infer an object class from the attribute names an event touches. Token
/// attributes could belong to a player or a monster; we guess monster since
/// players are normally classified up front by `PS`. `SIZE` is ambiguous
/// and contributes nothing.
pub fn guess_object_class<'a, I: IntoIterator<Item = &'a str>>(attrs: I) -> &'static str {
    for a in attrs {
        match a {
            "ANCHOR" | "AOESHAPE" | "ARCMODE" | "ARROW" | "DASH" | "EXTENT" | "FILL"
            | "FONT" | "GROUP" | "HIDDEN" | "IMAGE" | "JOIN" | "LAYER" | "LEVEL" | "LINE"
            | "POINTS" | "SPLINE" | "START" | "WIDTH" | "X" | "Y" | "Z" => return "E",
            "AOE" | "AREA" | "COLOR" | "DIM" | "ELEV" | "GX" | "GY" | "HEALTH" | "KILLED"
            | "MOVEMODE" | "NAME" | "NOTE" | "REACH" | "SKIN" | "STATUSLIST" => return "M",
            _ => {}
        }
    }
    ""
}

/// Creature names may arrive as `<image>=<name>`; only the name part keys
/// the name index.
pub fn strip_creature_base_name(name: &str) -> &str {
    match name.find('=') {
        Some(i) => &name[i + 1..],
        None => name,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Case {
        raw: &'static str,
        etype: &'static str,
        key: &'static str,
        cls: &'static str,
        oid: &'static str,
        icls: &'static str,
        err: bool,
    }

    const fn c(raw: &'static str, etype: &'static str, key: &'static str) -> Case {
        Case {
            raw,
            etype,
            key,
            cls: "",
            oid: "",
            icls: "",
            err: false,
        }
    }

    const fn e(raw: &'static str) -> Case {
        Case {
            raw,
            etype: "",
            key: "",
            cls: "",
            oid: "",
            icls: "",
            err: true,
        }
    }

    #[test]
    fn classifies_event_types_and_keys() {
        let mut cases = vec![
            c("// anything at all goes here", "//", ""),
            c("ACCEPT *", "ACCEPT", ""),
            c("D foo bar", "D", ""),
            c("DD foo", "DD", ""),
            e("DD= foo"),
            e("DD: foo"),
            e("DD. foo bar"),
            c("DR", "DR", ""),
            c("L foo", "L", ""),
            c("M foo", "M", ""),
            c("MARCO", "MARCO", ""),
            c("NO", "NO", ""),
            c("NO+", "NO+", ""),
            e("OK foo"),
            e("GRANTED user"),
            c("POLO", "POLO", ""),
            c("SYNC foo", "SYNC", ""),
            c("DSM foo x x", "DSM", ""),
            c("TO foo x x x", "TO", ""),
            c("CLR x", "CLR", "CLR:x"),
            c("CLR@ x", "CLR@", "CLR@:x"),
            c("M? x", "M?", "M?:x"),
            c("M@ x", "M@", "M@:x"),
            c("AV x y", "AV", "AV"),
            c("CO x", "CO", "CO"),
            c("CS x x", "CS", "CS"),
            c("I x i", "I", "I"),
            c("IL x", "IL", "IL"),
            c("TB x", "TB", "TB"),
            e("OA foo {yy 1 xx 2 zz 3} a"),
            e("OA foo {{y}y 1 xx 2 zz 3}"),
            e("OA foo"),
            e("PS id color name area size gremlin x y reach"),
            e("PS id color name area size"),
            e("TOTALLY_UNKNOWN"),
        ];
        cases.push(Case {
            raw: "OA foo {yy 1 xx 2 zz 3}",
            etype: "OA",
            key: "OA:foo:xx:yy:zz",
            cls: "",
            oid: "foo",
            icls: "",
            err: false,
        });
        cases.push(Case {
            raw: "OA foo {yy 1 xx 2 zz 3}",
            etype: "",
            key: "",
            cls: "",
            oid: "bar",
            icls: "",
            err: true,
        });

        for case in &cases {
            let got = Event::parse(case.raw, case.oid, case.icls);
            if case.err {
                assert!(got.is_err(), "{:?} should not have parsed", case.raw);
                continue;
            }
            let ev = got.unwrap_or_else(|e| panic!("{:?} failed: {e}", case.raw));
            assert_eq!(ev.etype(), case.etype, "type of {:?}", case.raw);
            assert_eq!(ev.key, case.key, "key of {:?}", case.raw);
            assert_eq!(ev.class, case.cls, "class of {:?}", case.raw);
        }
    }

    #[test]
    fn sorts_attribute_names_into_keys() {
        let a = Event::parse("OA foo {xx 1 yy 2 zz 3}", "", "").unwrap();
        let b = Event::parse("OA foo {yy 1 xx 2 zz 3}", "", "").unwrap();
        assert_eq!(a.key, "OA:foo:xx:yy:zz");
        assert_eq!(a.key, b.key);
        assert_eq!(a.id, "foo");
    }

    #[test]
    fn guesses_classes_from_attributes() {
        for attr in [
            "ANCHOR", "AOESHAPE", "ARCMODE", "ARROW", "DASH", "EXTENT", "FILL", "FONT",
            "LAYER", "LEVEL", "LINE", "POINTS", "SPLINE", "START", "WIDTH", "X", "Y", "Z",
        ] {
            let ev = Event::parse(&format!("OA foo {{{attr} 1}}"), "", "").unwrap();
            assert_eq!(ev.class, "E", "attr {attr}");
        }
        for attr in [
            "AOE", "AREA", "COLOR", "DIM", "ELEV", "GX", "GY", "HEALTH", "KILLED",
            "MOVEMODE", "NAME", "NOTE", "REACH", "SKIN", "STATUSLIST",
        ] {
            let ev = Event::parse(&format!("OA foo {{{attr} 1}}"), "", "").unwrap();
            assert_eq!(ev.class, "M", "attr {attr}");
        }
        // SIZE is ambiguous
        let ev = Event::parse("OA foo {SIZE 1}", "", "").unwrap();
        assert_eq!(ev.class, "");
        // a caller-supplied class is never overridden by a guess
        let ev = Event::parse("OA foo {STATUSLIST 1}", "", "X").unwrap();
        assert_eq!(ev.class, "X");
    }

    #[test]
    fn keys_value_list_updates() {
        let cases = [
            ("OA+ bar STATUSLIST {a b c}", "OA+:bar:STATUSLIST:a:b:c"),
            ("OA+ bar STATUSLIST {c}", "OA+:bar:STATUSLIST:c"),
            ("OA+ bar STATUSLIST {}", "OA+:bar:STATUSLIST:"),
            ("OA- bar STATUSLIST {a b c}", "OA-:bar:STATUSLIST:a:b:c"),
            ("OA- bar STATUSLIST {}", "OA-:bar:STATUSLIST:"),
        ];
        for (raw, key) in cases {
            let ev = Event::parse(raw, "", "").unwrap();
            assert_eq!(ev.key, key, "{raw}");
        }
        let ev = Event::parse("OA- bar STATUSLIST {}", "", "").unwrap();
        assert_eq!(ev.class, "M");
    }

    #[test]
    fn classifies_creature_placement() {
        let ev = Event::parse("PS id color name area size player x y reach", "", "").unwrap();
        assert_eq!((ev.key.as_str(), ev.class.as_str()), ("PS:id", "P"));
        let ev = Event::parse("PS id color name area size monster x y reach", "", "").unwrap();
        assert_eq!((ev.key.as_str(), ev.class.as_str()), ("PS:id", "M"));
    }

    #[test]
    fn assigns_and_reads_message_ids() {
        let mut ev = Event::parse("TO alice bob {hi there}", "", "").unwrap();
        assert_eq!(ev.message_id(), None);
        ev.set_message_id(42);
        assert_eq!(ev.fields.len(), 5);
        assert_eq!(ev.message_id(), Some(42));

        let mut roll =
            Event::parse("ROLL gm * {attack} 17 {} 0", "", "").unwrap();
        roll.set_message_id(99);
        assert_eq!(roll.message_id(), Some(99));
    }

    #[test]
    fn applies_recipient_visibility() {
        let ev = Event::parse("TO alice {bob carol} {psst} 7", "", "").unwrap();
        assert!(ev.can_send_to("bob"));
        assert!(ev.can_send_to("carol"));
        assert!(!ev.can_send_to("mallory"));

        let all = Event::parse("TO alice * {hello} 8", "", "").unwrap();
        assert!(all.can_send_to("anyone"));

        let gm_only = Event::parse("TO alice {* %} {secret} 9", "", "").unwrap();
        assert!(gm_only.can_send_to("GM"));
        assert!(!gm_only.can_send_to("alice"));

        // non-chat events are visible to all
        let mv = Event::parse("AV 3 4", "", "").unwrap();
        assert!(mv.can_send_to("whoever"));
    }

    #[test]
    fn strips_image_prefix_from_creature_names() {
        assert_eq!(strip_creature_base_name("fighter=Bob"), "Bob");
        assert_eq!(strip_creature_base_name("Bob"), "Bob");
        assert_eq!(strip_creature_base_name("=Bob"), "Bob");
    }
}
