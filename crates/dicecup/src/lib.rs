//! `dicecup`: random number generation for fantasy role-playing games.
//!
//! Two layers. [`Dice`] models one die-roll expression ("2d6+3"); it knows
//! how to roll itself and describe the outcome as structured fragments.
//! [`DieRoller`] is the recommended interface: it parses a full roll
//! specification with global modifiers ("attack = d20+5|c19+2|repeat 3"),
//! expands permutations, and orchestrates repetition and critical
//! confirmation.
//!
//! Results are not formatted here. Every roll yields a list of
//! [`RollResult`] values whose `details` are tagged fragments a client can
//! render however it likes.

mod expr;
mod roller;

pub use expr::{Detail, Dice, RollResult};
pub use roller::DieRoller;

#[derive(Debug, Clone)]
pub enum DiceError {
    /// The expression or specification text could not be parsed.
    Syntax(String),
    /// The pieces parsed but cannot be combined this way.
    Semantics(String),
    /// A confirmation roll was requested on a roll that did not come from
    /// exactly one die.
    NotConfirmable(String),
}

impl std::fmt::Display for DiceError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            DiceError::Syntax(s) => write!(f, "syntax error: {s}"),
            DiceError::Semantics(s) => write!(f, "{s}"),
            DiceError::NotConfirmable(s) => write!(f, "{s}"),
        }
    }
}

impl std::error::Error for DiceError {}
