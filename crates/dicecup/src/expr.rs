//! One die-roll expression: a chain of components (die sets and constants)
//! joined by arithmetic operators, with optional overall min/max clamps.

use rand::rngs::StdRng;
use rand::Rng;

use crate::DiceError;

/// One tagged fragment of a roll description.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Detail {
    pub kind: &'static str,
    pub value: String,
}

impl Detail {
    pub(crate) fn new(kind: &'static str, value: impl Into<String>) -> Detail {
        Detail {
            kind,
            value: value.into(),
        }
    }
}

/// The total of one roll plus the breakdown of how it was obtained.
#[derive(Debug, Clone)]
pub struct RollResult {
    pub total: i64,
    pub details: Vec<Detail>,
}

// Components contribute to a running total left to right: for accumulated
// value x, a component with operator op and value v yields `x op v`. The
// empty operator means "replace" and is only legal while x is still 0.
fn apply_op(operator: &str, x: i64, y: i64) -> Result<i64, DiceError> {
    match operator {
        "" => {
            if x != 0 {
                return Err(DiceError::Semantics(format!(
                    "applying nil operation to non-nil initial value {x}"
                )));
            }
            Ok(y)
        }
        "+" => Ok(x + y),
        "-" => Ok(x - y),
        "*" | "×" => Ok(x * y),
        "//" | "÷" => {
            if y == 0 {
                return Err(DiceError::Semantics("division by zero".into()));
            }
            Ok(x / y)
        }
        op => Err(DiceError::Semantics(format!(
            "unable to apply unknown operator {op}"
        ))),
    }
}

#[derive(Debug, Clone)]
struct Constant {
    operator: String,
    value: i64,
    label: String,
}

impl Constant {
    fn describe(&self, desc: &mut Vec<Detail>) {
        if !self.operator.is_empty() {
            desc.push(Detail::new("operator", self.operator.clone()));
        }
        desc.push(Detail::new("constant", self.value.to_string()));
        if !self.label.is_empty() {
            desc.push(Detail::new("label", self.label.clone()));
        }
    }
}

#[derive(Debug, Clone)]
struct DieSpec {
    operator: String,
    value: i64,
    numerator: i64,
    denominator: i64,
    sides: i64,
    best_reroll: bool,
    rerolls: i64,
    die_bonus: i64,
    initial_max: bool,
    label: String,
    history: Vec<Vec<i64>>,
    was_maximized: bool,
    natural: i64,
}

impl DieSpec {
    fn roll_one_set(&self, mut rng: Option<&mut StdRng>) -> Vec<i64> {
        let mut this = Vec::with_capacity(self.numerator.max(0) as usize);
        for j in 0..self.numerator {
            let mut v = match rng.as_mut() {
                Some(rng) if !(self.initial_max && j == 0) => {
                    rng.gen_range(1..=self.sides) + self.die_bonus
                }
                _ => self.sides + self.die_bonus,
            };
            if self.denominator > 0 {
                v /= self.denominator;
                if v < 1 {
                    v = 1;
                }
            }
            this.push(v);
        }
        this
    }

    fn evaluate(&mut self, x: i64, rng: &mut StdRng) -> Result<i64, DiceError> {
        self.history.clear();
        self.was_maximized = false;
        for _ in 0..=self.rerolls {
            let set = self.roll_one_set(Some(&mut *rng));
            self.history.push(set);
        }

        let sums: Vec<i64> = self.history.iter().map(|s| s.iter().sum()).collect();
        let pos = if self.rerolls > 0 {
            let pos = if self.best_reroll {
                max_pos(&sums)
            } else {
                min_pos(&sums)
            };
            self.value = sums[pos];
            pos
        } else {
            self.value = sums[0];
            0
        };
        self.natural = if self.numerator == 1 {
            self.history[pos][0] - self.die_bonus
        } else {
            -1
        };

        apply_op(&self.operator, x, self.value)
    }

    // Assume every die came up at its maximum face instead of rolling.
    fn max_value(&mut self, x: i64) -> Result<i64, DiceError> {
        self.was_maximized = true;
        self.history.clear();
        let set = self.roll_one_set(None);
        self.history.push(set);
        self.value = self.history[0].iter().sum();
        apply_op(&self.operator, x, self.value)
    }

    fn is_min_roll(&self) -> bool {
        self.value == 1
    }

    fn is_max_roll(&self) -> bool {
        self.value == self.sides
    }

    fn spec_text(&self) -> String {
        if self.denominator > 0 {
            format!("{}/{}d{}", self.numerator, self.denominator, self.sides)
        } else {
            format!("{}d{}", self.numerator, self.sides)
        }
    }

    fn describe(&self, desc: &mut Vec<Detail>) {
        let roll_kind = if self.was_maximized { "maxroll" } else { "roll" };

        if !self.operator.is_empty() {
            desc.push(Detail::new("operator", self.operator.clone()));
        }
        if self.initial_max {
            desc.push(Detail::new("maximized", ">"));
        }
        desc.push(Detail::new("diespec", self.spec_text()));
        if self.die_bonus > 0 {
            desc.push(Detail::new("diebonus", format!("{:+}", self.die_bonus)));
        }

        if self.rerolls > 0 {
            let sums: Vec<i64> = self.history.iter().map(|s| s.iter().sum()).collect();
            let (tag, choice) = if self.best_reroll {
                ("best", max_pos(&sums))
            } else {
                ("worst", min_pos(&sums))
            };
            desc.push(Detail::new(tag, (self.rerolls + 1).to_string()));
            for (i, set) in self.history.iter().enumerate() {
                let kind = if i == choice { roll_kind } else { "discarded" };
                desc.push(Detail::new(kind, join_ints(set)));
            }
        } else {
            desc.push(Detail::new(roll_kind, join_ints(&self.history[0])));
        }

        if !self.label.is_empty() {
            desc.push(Detail::new("label", self.label.clone()));
        }
    }
}

fn join_ints(v: &[i64]) -> String {
    v.iter()
        .map(|n| n.to_string())
        .collect::<Vec<_>>()
        .join(",")
}

fn max_pos(v: &[i64]) -> usize {
    let mut pos = 0;
    for (i, x) in v.iter().enumerate() {
        if i == 0 || *x > v[pos] {
            pos = i;
        }
    }
    pos
}

fn min_pos(v: &[i64]) -> usize {
    let mut pos = 0;
    for (i, x) in v.iter().enumerate() {
        if i == 0 || *x < v[pos] {
            pos = i;
        }
    }
    pos
}

#[derive(Debug, Clone)]
enum Component {
    Constant(Constant),
    Die(DieSpec),
}

/// A set of dice parsed from an expression such as `2d6+3` or
/// `>3/2d20 best of 2 holy|min 5`.
#[derive(Debug, Clone)]
pub struct Dice {
    min_value: i64,
    max_value: i64,
    components: Vec<Component>,
    natural: i64,
    def_threat: i64,
    only_die: Option<usize>,
    rolled: bool,
    last_value: i64,
}

impl Dice {
    pub fn new(description: &str) -> Result<Dice, DiceError> {
        if contains_confirm_spec(description) {
            return Err(DiceError::Syntax(
                "confirmation specifier (c[threat][±bonus]) is only allowed at the end \
                 of a full roll specification"
                    .into(),
            ));
        }

        let mut d = Dice {
            min_value: 0,
            max_value: 0,
            components: Vec::new(),
            natural: 0,
            def_threat: 0,
            only_die: None,
            rolled: false,
            last_value: 0,
        };

        // Global modifiers after `|` may only be min/max clamps here.
        let mut pieces = description.split('|');
        let expr = pieces.next().unwrap_or("").trim();
        for modifier in pieces {
            if let Some(v) = parse_clamp(modifier, "min") {
                d.min_value = v?;
            } else if let Some(v) = parse_clamp(modifier, "max") {
                d.max_value = v?;
            } else {
                return Err(DiceError::Syntax(format!(
                    "invalid global modifier {modifier}"
                )));
            }
        }

        // Alternating values and operators; `//` is the ASCII spelling of ÷.
        let expr = expr.replace("//", "÷");
        let parts = split_on_operators(&expr);
        if parts.is_empty() {
            return Err(DiceError::Syntax(format!(
                "empty dice expression \"{description}\""
            )));
        }

        let starts_with_op = is_operator(&parts[0]);
        if starts_with_op {
            if parts.len() % 2 != 0 {
                return Err(DiceError::Syntax(format!(
                    "trailing operator in \"{description}\""
                )));
            }
            // implied leading 0 so the first operator has something to act on
            d.components.push(Component::Constant(Constant {
                operator: String::new(),
                value: 0,
                label: String::new(),
            }));
        } else if parts.len() % 2 == 0 {
            return Err(DiceError::Syntax(format!(
                "trailing operator in \"{description}\""
            )));
        }

        let mut dice_count = 0usize;
        let mut op: Option<String> = if starts_with_op {
            None
        } else {
            Some(String::new())
        };
        for part in &parts {
            let Some(operator) = op.take() else {
                // expecting an operator next
                op = Some(part.clone());
                continue;
            };

            match parse_component(part, &operator)? {
                Component::Die(spec) => {
                    d.only_die = Some(d.components.len());
                    dice_count += 1;
                    d.components.push(Component::Die(spec));
                }
                c => d.components.push(c),
            }
            op = None;
        }

        if dice_count != 1 {
            d.only_die = None;
        }
        Ok(d)
    }

    /// Plain set of same-sided dice with a flat bonus.
    pub fn basic(qty: i64, sides: i64, bonus: i64) -> Dice {
        let mut components = vec![Component::Die(DieSpec {
            operator: String::new(),
            value: 0,
            numerator: qty,
            denominator: 0,
            sides,
            best_reroll: false,
            rerolls: 0,
            die_bonus: 0,
            initial_max: false,
            label: String::new(),
            history: Vec::new(),
            was_maximized: false,
            natural: 0,
        })];
        if bonus != 0 {
            components.push(Component::Constant(Constant {
                operator: if bonus < 0 { "-".into() } else { "+".into() },
                value: bonus.abs(),
                label: String::new(),
            }));
        }
        Dice {
            min_value: 0,
            max_value: 0,
            components,
            natural: 0,
            def_threat: 0,
            only_die: Some(0),
            rolled: false,
            last_value: 0,
        }
    }

    pub fn roll(&mut self, rng: &mut StdRng) -> Result<i64, DiceError> {
        self.roll_to_confirm(false, 0, 0, rng)
    }

    /// Assume every die shows its maximum face. Does not arm a subsequent
    /// confirmation roll.
    pub fn max_roll(&mut self) -> Result<i64, DiceError> {
        self.max_roll_to_confirm(0)
    }

    pub fn max_roll_to_confirm(&mut self, bonus: i64) -> Result<i64, DiceError> {
        let mut sum = 0;
        self.natural = 0;
        self.rolled = false;
        for die in &mut self.components {
            sum = match die {
                Component::Constant(c) => apply_op(&c.operator, sum, c.value)?,
                Component::Die(ds) => ds.max_value(sum)?,
            };
        }
        sum += bonus;
        sum = self.clamp(sum);
        self.last_value = sum;
        self.rolled = true;
        Ok(sum)
    }

    /// Roll the expression. With `confirm` set, only re-roll when the
    /// previous natural roll reached the threat range (defaulting to the
    /// die's maximum face); a return of 0 means nothing needed confirming.
    pub fn roll_to_confirm(
        &mut self,
        confirm: bool,
        threat: i64,
        bonus: i64,
        rng: &mut StdRng,
    ) -> Result<i64, DiceError> {
        if confirm {
            if self.natural == 0 {
                return Err(DiceError::NotConfirmable(
                    "roll the dice before confirming a critical".into(),
                ));
            }
            if self.natural < 0 {
                return Err(DiceError::NotConfirmable(
                    "cannot confirm a critical on a roll that does not involve \
                     exactly one die"
                        .into(),
                ));
            }
            let threat = if threat <= 0 { self.def_threat } else { threat };
            if self.natural < threat {
                return Ok(0); // nothing here to confirm
            }
        }

        let mut sum = 0;
        self.natural = 0;
        self.rolled = false;
        for die in &mut self.components {
            sum = match die {
                Component::Constant(c) => apply_op(&c.operator, sum, c.value)?,
                Component::Die(ds) => {
                    let v = ds.evaluate(sum, rng)?;
                    // Note the natural face for a later confirmation roll.
                    // More than one die (or a multi-die set) disqualifies
                    // the whole roll, marked by -1.
                    if ds.natural != 0 {
                        if self.natural == 0 {
                            self.natural = ds.natural;
                            self.def_threat = ds.sides;
                        } else {
                            self.natural = -1;
                            self.def_threat = 0;
                        }
                    }
                    v
                }
            };
        }
        sum += bonus;
        sum = self.clamp(sum);
        self.last_value = sum;
        self.rolled = true;
        Ok(sum)
    }

    fn clamp(&self, mut sum: i64) -> i64 {
        if self.max_value > 0 && sum > self.max_value {
            sum = self.max_value;
        }
        if self.min_value > 0 && sum < self.min_value {
            sum = self.min_value;
        }
        sum
    }

    /// Human-readable form of the specification (not of any result).
    pub fn description(&self) -> String {
        let mut out = String::new();
        for c in &self.components {
            match c {
                Component::Constant(c) => {
                    out.push_str(&c.operator);
                    out.push_str(&c.value.to_string());
                    out.push_str(&c.label);
                }
                Component::Die(d) => {
                    out.push_str(&d.operator);
                    if d.initial_max {
                        out.push('>');
                    }
                    out.push_str(&d.spec_text());
                    if d.die_bonus > 0 {
                        out.push_str(&format!(" ({:+} per die)", d.die_bonus));
                    }
                    if d.rerolls > 0 {
                        let which = if d.best_reroll { "best" } else { "worst" };
                        out.push_str(&format!(" {which} of {}", d.rerolls + 1));
                    }
                    if !d.label.is_empty() {
                        out.push(' ');
                        out.push_str(&d.label);
                    }
                }
            }
        }
        if self.min_value > 0 {
            out.push_str(&format!(" min {}", self.min_value));
        }
        if self.max_value > 0 {
            out.push_str(&format!(" max {}", self.max_value));
        }
        out
    }

    /// Structured description of the most recent roll. `sf_opt` enables
    /// natural-min/max labeling and requires the expression to hold exactly
    /// one single die.
    pub fn structured_describe_roll(
        &self,
        sf_opt: &str,
        success_message: &str,
        failure_message: &str,
        roll_bonus: i64,
    ) -> Result<Vec<Detail>, DiceError> {
        let mut desc = Vec::new();
        if !self.rolled {
            return Ok(desc);
        }
        if !sf_opt.is_empty() {
            let lone = self.only_die.and_then(|i| match &self.components[i] {
                Component::Die(d) if d.numerator == 1 => Some(d),
                _ => None,
            });
            let Some(die) = lone else {
                return Err(DiceError::Semantics(
                    "cannot indicate auto-success/fail (|sf option) because the roll \
                     involves multiple dice"
                        .into(),
                ));
            };
            if die.is_min_roll() {
                desc.push(Detail::new("fail", failure_message));
            } else if die.is_max_roll() {
                desc.push(Detail::new("success", success_message));
            }
        }

        desc.push(Detail::new("result", self.last_value.to_string()));
        desc.push(Detail::new("separator", "="));
        for c in &self.components {
            match c {
                Component::Constant(c) => c.describe(&mut desc),
                Component::Die(d) => d.describe(&mut desc),
            }
        }
        if roll_bonus != 0 {
            desc.push(Detail::new("bonus", format!("{roll_bonus:+}")));
        }
        if self.min_value != 0 {
            desc.push(Detail::new("moddelim", "|"));
            desc.push(Detail::new("min", self.min_value.to_string()));
        }
        if self.max_value != 0 {
            desc.push(Detail::new("moddelim", "|"));
            desc.push(Detail::new("max", self.max_value.to_string()));
        }
        Ok(desc)
    }
}

fn is_operator(s: &str) -> bool {
    matches!(s, "+" | "-" | "*" | "×" | "÷")
}

fn split_on_operators(expr: &str) -> Vec<String> {
    let mut parts = Vec::new();
    let mut cur = String::new();
    for c in expr.chars() {
        if matches!(c, '+' | '-' | '*' | '×' | '÷') {
            if !cur.is_empty() {
                parts.push(std::mem::take(&mut cur));
            }
            parts.push(c.to_string());
        } else {
            cur.push(c);
        }
    }
    if !cur.is_empty() {
        parts.push(cur);
    }
    parts
}

// `|min N` / `|max N`, anchored; returns None when the keyword is absent so
// the caller can report the modifier as a whole.
fn parse_clamp(piece: &str, keyword: &str) -> Option<Result<i64, DiceError>> {
    let t = piece.trim();
    let rest = t.strip_prefix(keyword)?;
    let rest = rest.trim();
    Some(
        rest.parse::<i64>()
            .map_err(|_| DiceError::Syntax(format!("value error in {keyword} clause: {t}"))),
    )
}

fn parse_component(part: &str, operator: &str) -> Result<Component, DiceError> {
    if let Some(spec) = parse_die_spec(part)? {
        if contains_clamp_clause(&spec.label) {
            return Err(DiceError::Syntax(format!(
                "min/max limits must appear after the final operator in \"{part}\", \
                 since they apply to the entire roll"
            )));
        }
        return Ok(Component::Die(DieSpec {
            operator: operator.to_string(),
            ..spec
        }));
    }
    // not die-shaped; accept an integer constant with an optional label
    let t = part.trim();
    let digits: String = t.chars().take_while(|c| c.is_ascii_digit()).collect();
    if digits.is_empty() {
        return Err(DiceError::Syntax(format!(
            "syntax error in die roll subexpression \"{part}\"; expected \
             [<n>[/<d>]] d [<sides>|%] [best|worst of <n>] [label]"
        )));
    }
    let value: i64 = digits
        .parse()
        .map_err(|_| DiceError::Syntax(format!("value error in \"{part}\"")))?;
    let label = t[digits.len()..].trim().to_string();
    Ok(Component::Constant(Constant {
        operator: operator.to_string(),
        value,
        label,
    }))
}

// [>] [<n>] [/<div>] d <sides|%> [best|worst of <m>] [label]
// Returns Ok(None) when the text is not die-shaped at all.
fn parse_die_spec(part: &str) -> Result<Option<DieSpec>, DiceError> {
    let t = part.trim();
    let mut cur = Cursor::new(t);

    let initial_max = cur.eat('>');
    cur.skip_ws();
    let numerator = match cur.digits() {
        Some(d) => d
            .parse::<i64>()
            .map_err(|_| DiceError::Syntax(format!("value error in \"{part}\"")))?,
        None => 1,
    };
    cur.skip_ws();
    let denominator = if cur.eat('/') {
        cur.skip_ws();
        let Some(d) = cur.digits() else {
            return Ok(None);
        };
        d.parse::<i64>()
            .map_err(|_| DiceError::Syntax(format!("value error in \"{part}\"")))?
    } else {
        0
    };
    cur.skip_ws();
    if !(cur.eat('d') || cur.eat('D')) {
        return Ok(None);
    }
    cur.skip_ws();
    let sides = if cur.eat('%') {
        100
    } else {
        let Some(d) = cur.digits() else {
            return Ok(None);
        };
        d.parse::<i64>()
            .map_err(|_| DiceError::Syntax(format!("value error in \"{part}\"")))?
    };
    if sides < 1 {
        return Err(DiceError::Syntax(format!(
            "a die must have at least one side in \"{part}\""
        )));
    }
    if denominator < 0 || numerator < 0 {
        return Err(DiceError::Syntax(format!("value error in \"{part}\"")));
    }

    cur.skip_ws();
    let mut best_reroll = false;
    let mut rerolls = 0i64;
    let saved = cur.pos;
    let word = cur.word();
    if word == "best" || word == "worst" {
        cur.skip_ws();
        if cur.word() == "of" {
            cur.skip_ws();
            if let Some(d) = cur.digits() {
                let n: i64 = d
                    .parse()
                    .map_err(|_| DiceError::Syntax(format!("value error in \"{part}\"")))?;
                if n < 1 {
                    return Err(DiceError::Syntax(format!(
                        "best/worst of <n> requires n >= 1 in \"{part}\""
                    )));
                }
                rerolls = n - 1;
                best_reroll = word == "best";
            } else {
                cur.pos = saved;
            }
        } else {
            cur.pos = saved;
        }
    } else {
        cur.pos = saved;
    }

    let label = cur.rest().trim().to_string();
    if looks_like_die_roll(&label) {
        return Err(DiceError::Syntax(format!(
            "comment following die roll in \"{part}\" looks like another die roll \
             (missing an operator?)"
        )));
    }

    Ok(Some(DieSpec {
        operator: String::new(),
        value: 0,
        numerator,
        denominator,
        sides,
        best_reroll,
        rerolls,
        die_bonus: 0,
        initial_max,
        label,
        history: Vec::new(),
        was_maximized: false,
        natural: 0,
    }))
}

struct Cursor<'a> {
    s: &'a str,
    pos: usize,
}

impl<'a> Cursor<'a> {
    fn new(s: &'a str) -> Cursor<'a> {
        Cursor { s, pos: 0 }
    }

    fn peek(&self) -> Option<char> {
        self.s[self.pos..].chars().next()
    }

    fn eat(&mut self, c: char) -> bool {
        if self.peek() == Some(c) {
            self.pos += c.len_utf8();
            true
        } else {
            false
        }
    }

    fn skip_ws(&mut self) {
        while let Some(c) = self.peek() {
            if !c.is_whitespace() {
                break;
            }
            self.pos += c.len_utf8();
        }
    }

    fn digits(&mut self) -> Option<&'a str> {
        let start = self.pos;
        while let Some(c) = self.peek() {
            if !c.is_ascii_digit() {
                break;
            }
            self.pos += 1;
        }
        if self.pos == start {
            None
        } else {
            Some(&self.s[start..self.pos])
        }
    }

    fn word(&mut self) -> &'a str {
        let start = self.pos;
        while let Some(c) = self.peek() {
            if !c.is_ascii_alphabetic() {
                break;
            }
            self.pos += c.len_utf8();
        }
        &self.s[start..self.pos]
    }

    fn rest(&self) -> &'a str {
        &self.s[self.pos..]
    }
}

// A `c`, `c<threat>`, or `c±<bonus>` word anywhere in the text; this
// belongs only at the end of the full roller specification.
fn contains_confirm_spec(s: &str) -> bool {
    let b = s.as_bytes();
    for (i, &c) in b.iter().enumerate() {
        if c != b'c' {
            continue;
        }
        if i > 0 && (b[i - 1].is_ascii_alphanumeric() || b[i - 1] == b'_') {
            continue; // not at a word boundary
        }
        let mut j = i + 1;
        while j < b.len() && b[j].is_ascii_digit() {
            j += 1;
        }
        if j < b.len() && (b[j] == b'+' || b[j] == b'-') && j + 1 < b.len() && b[j + 1].is_ascii_digit()
        {
            j += 2;
            while j < b.len() && b[j].is_ascii_digit() {
                j += 1;
            }
        }
        if j >= b.len() || !(b[j].is_ascii_alphanumeric() || b[j] == b'_') {
            return true;
        }
    }
    false
}

// `min` or `max` followed by a (possibly signed) number, anywhere.
fn contains_clamp_clause(s: &str) -> bool {
    let b = s.as_bytes();
    for kw in [b"min".as_slice(), b"max".as_slice()] {
        let mut start = 0;
        while let Some(off) = find_at(b, kw, start) {
            start = off + 1;
            if off > 0 && (b[off - 1].is_ascii_alphanumeric() || b[off - 1] == b'_') {
                continue;
            }
            let mut j = off + kw.len();
            while j < b.len() && (b[j] == b' ' || b[j] == b'\t') {
                j += 1;
            }
            if j < b.len() && (b[j] == b'+' || b[j] == b'-') {
                j += 1;
            }
            if j < b.len() && b[j].is_ascii_digit() {
                return true;
            }
        }
    }
    false
}

fn find_at(haystack: &[u8], needle: &[u8], from: usize) -> Option<usize> {
    if haystack.len() < needle.len() {
        return None;
    }
    (from..=haystack.len() - needle.len()).find(|&i| &haystack[i..i + needle.len()] == needle)
}

// `<n>d<m>` shapes that suggest the user forgot an operator.
fn looks_like_die_roll(s: &str) -> bool {
    let b = s.as_bytes();
    let mut i = 0;
    while i < b.len() {
        if b[i].is_ascii_digit() {
            let mut j = i;
            while j < b.len() && b[j].is_ascii_digit() {
                j += 1;
            }
            let mut k = j;
            while k < b.len() && (b[k] == b' ' || b[k] == b'\t') {
                k += 1;
            }
            if k < b.len() && (b[k] == b'd' || b[k] == b'D') && k + 1 < b.len() && b[k + 1].is_ascii_digit() {
                return true;
            }
            i = j;
        } else {
            i += 1;
        }
    }
    false
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::SeedableRng;

    fn rng() -> StdRng {
        StdRng::seed_from_u64(0x5eed)
    }

    #[test]
    fn rolls_basic_expression_within_bounds() {
        let mut d = Dice::new("2d6+3").unwrap();
        let mut r = rng();
        for _ in 0..200 {
            let v = d.roll(&mut r).unwrap();
            assert!((5..=15).contains(&v), "2d6+3 gave {v}");
        }
    }

    #[test]
    fn applies_operators_left_to_right() {
        // all-constant expression is deterministic: ((0+10)-2)*3 = 24
        let mut d = Dice::new("10-2*3").unwrap();
        assert_eq!(d.roll(&mut rng()).unwrap(), 24);

        let mut d = Dice::new("7//2").unwrap();
        assert_eq!(d.roll(&mut rng()).unwrap(), 3);

        let mut d = Dice::new("7÷2+1").unwrap();
        assert_eq!(d.roll(&mut rng()).unwrap(), 4);
    }

    #[test]
    fn supports_leading_operator() {
        let mut d = Dice::new("-2+10").unwrap();
        assert_eq!(d.roll(&mut rng()).unwrap(), 8);
    }

    #[test]
    fn clamps_results() {
        let mut d = Dice::new("1d6|min 10").unwrap();
        assert_eq!(d.roll(&mut rng()).unwrap(), 10);
        let mut d = Dice::new("3d6+20|max 12").unwrap();
        assert_eq!(d.roll(&mut rng()).unwrap(), 12);
    }

    #[test]
    fn maximizes_rolls() {
        let mut d = Dice::new("3d6+2").unwrap();
        assert_eq!(d.max_roll().unwrap(), 20);
        // per-die divisor applies before summing, with a floor of 1
        let mut d = Dice::new("2/2d10").unwrap();
        assert_eq!(d.max_roll().unwrap(), 10);
    }

    #[test]
    fn forces_first_die_with_initial_max() {
        let mut d = Dice::new(">2d8").unwrap();
        let mut r = rng();
        for _ in 0..50 {
            let v = d.roll(&mut r).unwrap();
            assert!((9..=16).contains(&v), ">2d8 gave {v}");
        }
    }

    #[test]
    fn keeps_best_and_worst_sets() {
        let mut r = rng();
        let mut best = Dice::new("1d20 best of 2").unwrap();
        let mut worst = Dice::new("1d20 worst of 2").unwrap();
        for _ in 0..100 {
            let b = best.roll(&mut r).unwrap();
            let w = worst.roll(&mut r).unwrap();
            assert!((1..=20).contains(&b));
            assert!((1..=20).contains(&w));
        }
        let desc = best.structured_describe_roll("", "", "", 0).unwrap();
        assert!(desc.iter().any(|d| d.kind == "best" && d.value == "2"));
        assert!(desc.iter().any(|d| d.kind == "discarded"));
    }

    #[test]
    fn percent_sides_mean_one_hundred() {
        let mut d = Dice::new("d%").unwrap();
        assert_eq!(d.max_roll().unwrap(), 100);
    }

    #[test]
    fn describes_rolls_structurally() {
        let mut d = Dice::new("2d6+3 fire").unwrap();
        d.roll(&mut rng()).unwrap();
        let desc = d.structured_describe_roll("", "", "", 0).unwrap();
        let kinds: Vec<&str> = desc.iter().map(|d| d.kind).collect();
        assert_eq!(
            kinds,
            ["result", "separator", "diespec", "roll", "operator", "constant", "label"]
        );
        assert_eq!(desc[2].value, "2d6");
        assert_eq!(desc[4].value, "+");
        assert_eq!(desc[5].value, "3");
        assert_eq!(desc[6].value, "fire");
        // the roll fragment lists one face per die
        assert_eq!(desc[3].value.split(',').count(), 2);
    }

    #[test]
    fn description_round_trips_the_shape() {
        let d = Dice::new("2d6+3|min 5").unwrap();
        assert_eq!(d.description(), "2d6+3 min 5");
        let d = Dice::new(">3/2d20 best of 2 holy").unwrap();
        assert_eq!(d.description(), ">3/2d20 best of 2 holy");
    }

    #[test]
    fn rejects_bad_expressions() {
        assert!(Dice::new("").is_err());
        assert!(Dice::new("2d6+").is_err());
        assert!(Dice::new("+").is_err());
        assert!(Dice::new("2d6 3d8").is_err()); // label looks like a die roll
        assert!(Dice::new("d6 min 3").is_err()); // clamp buried in a component
        assert!(Dice::new("2d6|float 3").is_err());
        assert!(Dice::new("1d20 c").is_err()); // confirm spec is roller-level
        assert!(Dice::new("d0").is_err());
        assert!(Dice::new("what").is_err());
    }

    #[test]
    fn rejects_division_by_zero() {
        let mut d = Dice::new("10//0").unwrap();
        assert!(d.roll(&mut rng()).is_err());
    }

    #[test]
    fn confirm_needs_a_single_die() {
        let mut r = rng();
        let mut d = Dice::new("2d6").unwrap();
        d.roll(&mut r).unwrap();
        assert!(matches!(
            d.roll_to_confirm(true, 0, 0, &mut r),
            Err(DiceError::NotConfirmable(_))
        ));

        let mut d = Dice::new("1d20+5").unwrap();
        assert!(d.roll_to_confirm(true, 0, 0, &mut r).is_err()); // not rolled yet
        d.roll(&mut r).unwrap();
        // threat of 1 always confirms
        let v = d.roll_to_confirm(true, 1, 2, &mut r).unwrap();
        assert!((8..=27).contains(&v), "confirm gave {v}");
    }

    #[test]
    fn parses_spaced_specs() {
        // "256 d 4" is a single die spec with interior whitespace
        let d = Dice::new("256 d 4").unwrap();
        assert_eq!(d.description(), "256d4");
    }
}
