//! Saved die-roll presets: a `(name, description, rollspec)` triple per
//! entry, carried on the wire as a list of three-element lists.

use crate::list;
use crate::WireError;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RollPreset {
    /// Unique name; anything up to a `|` is hidden sort-prefix for clients.
    pub name: String,
    pub description: String,
    pub roll_spec: String,
}

impl RollPreset {
    pub fn from_wire(srep: &str) -> Result<RollPreset, WireError> {
        let fields = list::decode(srep)?;
        if fields.len() != 3 {
            return Err(WireError::MalformedList(
                "die roll preset must have exactly three values",
            ));
        }
        let mut it = fields.into_iter();
        Ok(RollPreset {
            name: it.next().unwrap_or_default(),
            description: it.next().unwrap_or_default(),
            roll_spec: it.next().unwrap_or_default(),
        })
    }

    pub fn to_wire(&self) -> String {
        list::encode(&[&self.name, &self.description, &self.roll_spec])
    }
}

/// Decode a full preset list as carried by the `DD`/`DD+` commands.
pub fn preset_list_from_wire(srep: &str) -> Result<Vec<RollPreset>, WireError> {
    list::decode(srep)?
        .iter()
        .map(|p| RollPreset::from_wire(p))
        .collect()
}

pub fn preset_list_to_wire(presets: &[RollPreset]) -> String {
    let reps: Vec<String> = presets.iter().map(RollPreset::to_wire).collect();
    list::encode(&reps)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn round_trips_preset_lists() {
        let presets = vec![
            RollPreset {
                name: "001|a".into(),
                description: "test".into(),
                roll_spec: "16d20+2|dc12".into(),
            },
            RollPreset {
                name: "002|b".into(),
                description: "****".into(),
                roll_spec: "6d6+2d6 fire".into(),
            },
            RollPreset {
                name: "abc".into(),
                description: String::new(),
                roll_spec: "d%".into(),
            },
        ];
        let wire = preset_list_to_wire(&presets);
        assert_eq!(preset_list_from_wire(&wire).unwrap(), presets);
    }

    #[test]
    fn rejects_short_tuples() {
        assert!(RollPreset::from_wire("{name only}").is_err());
        assert!(preset_list_from_wire("{{a b c}} {{d e}}").is_err());
    }

    #[test]
    fn parses_wire_form() {
        let got = preset_list_from_wire("{{xx} {some dice} {256 d 4}} {yy {} 3d10}").unwrap();
        assert_eq!(
            got,
            vec![
                RollPreset {
                    name: "xx".into(),
                    description: "some dice".into(),
                    roll_spec: "256 d 4".into(),
                },
                RollPreset {
                    name: "yy".into(),
                    description: String::new(),
                    roll_spec: "3d10".into(),
                },
            ]
        );
    }
}
