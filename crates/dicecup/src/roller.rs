//! The high-level roller: parses `[label =] <expression>[|modifier]*`
//! specifications, expands `{a/b/c}` permutation groups, and performs the
//! actual rolls (including repeats, until-loops, and critical
//! confirmation). Each roller owns its own RNG so independent sessions do
//! not roll in lockstep.

use rand::rngs::StdRng;
use rand::SeedableRng;

use crate::expr::{Detail, Dice, RollResult};
use crate::DiceError;

// Runaway guard for `|until N`: never roll more than this many times.
const MAX_UNTIL_ITERATIONS: i64 = 100;

pub struct DieRoller {
    rng: StdRng,
    dice: Option<Dice>,
    label_text: String,
    confirm: bool,
    crit_threat: i64,
    crit_bonus: i64,
    sf_opt: String,
    success_message: String,
    fail_message: String,
    template: String,
    permutations: Vec<Vec<String>>,
    repeat_until: i64,
    repeat_for: i64,
    do_max: bool,
    dc: i64,
    pct_chance: i64,
    pct_label: String,
}

impl DieRoller {
    pub fn new() -> DieRoller {
        DieRoller::with_rng(StdRng::from_entropy())
    }

    /// Deterministic roller for tests and replays.
    pub fn seeded(seed: u64) -> DieRoller {
        DieRoller::with_rng(StdRng::seed_from_u64(seed))
    }

    fn with_rng(rng: StdRng) -> DieRoller {
        DieRoller {
            rng,
            dice: Some(Dice::basic(1, 20, 0)),
            label_text: String::new(),
            confirm: false,
            crit_threat: 0,
            crit_bonus: 0,
            sf_opt: String::new(),
            success_message: String::new(),
            fail_message: String::new(),
            template: String::new(),
            permutations: Vec::new(),
            repeat_until: 0,
            repeat_for: 1,
            do_max: false,
            dc: 0,
            pct_chance: -1,
            pct_label: String::new(),
        }
    }

    /// Roll per the given specification; an empty spec re-rolls the
    /// previous one (initially "1d20"). Returns the user label and one
    /// structured result per roll performed.
    pub fn do_roll(&mut self, spec: &str) -> Result<(String, Vec<RollResult>), DiceError> {
        if !spec.is_empty() {
            self.set_new_specification(spec)?;
        }

        let mut overall: Vec<RollResult> = Vec::new();
        let mut result = 0i64;

        let mut repeat_iter = 0i64;
        let mut repeat_count = 0i64;
        while repeat_iter < self.repeat_for {
            if !self.template.is_empty() {
                // Permuted rolls: one roll per combination of group values,
                // substituted into the template.
                for combo in cartesian(&self.permutations) {
                    let expanded = substitute_template_values(&self.template, &combo);
                    self.dice = Some(Dice::new(&expanded)?);
                    let (r, results) = self.roll_dice(repeat_count)?;
                    result = r;
                    overall.extend(results);
                }
            } else {
                let (r, results) = self.roll_dice(repeat_count)?;
                result = r;
                overall.extend(results);
            }

            if self.repeat_until == 0 || result >= self.repeat_until {
                repeat_iter += 1;
            }
            repeat_count += 1;
            if repeat_count >= MAX_UNTIL_ITERATIONS {
                break;
            }
        }
        if !self.template.is_empty() {
            self.dice = None;
        }

        Ok((self.label_text.clone(), overall))
    }

    fn set_new_specification(&mut self, spec: &str) -> Result<(), DiceError> {
        self.dice = None;
        self.label_text.clear();
        self.confirm = false;
        self.crit_threat = 0;
        self.crit_bonus = 0;
        self.sf_opt.clear();
        self.success_message.clear();
        self.fail_message.clear();
        self.template.clear();
        self.permutations.clear();
        self.repeat_until = 0;
        self.repeat_for = 1;
        self.do_max = false;
        self.dc = 0;
        self.pct_chance = -1;
        self.pct_label.clear();

        // leading "<label> ="
        let mut spec = spec.trim();
        if let Some((label, rest)) = spec.split_once('=') {
            self.label_text = label.trim().to_string();
            spec = rest.trim();
        }

        // the expression, then |-separated global modifiers
        let mut pieces = spec.split('|');
        let mut spec = pieces.next().unwrap_or("").trim().to_string();
        for piece in pieces {
            if is_clamp_modifier(piece) {
                // min/max belong to the expression parser, pass them down
                spec.push('|');
                spec.push_str(piece);
            } else if let Some((threat, bonus)) = parse_confirm_modifier(piece)? {
                self.confirm = true;
                self.crit_threat = threat;
                self.crit_bonus = bonus;
                if self.success_message.is_empty() {
                    self.success_message = "HIT".into();
                }
                if self.fail_message.is_empty() {
                    self.fail_message = "MISS".into();
                }
            } else if let Some(n) = parse_keyword_number(piece, "until", true)? {
                self.repeat_until = n;
            } else if let Some(n) = parse_keyword_number(piece, "repeat", false)? {
                self.repeat_for = n;
            } else if matches!(piece.trim(), "!" | "maximized") {
                self.do_max = true;
            } else if let Some(n) = parse_dc_modifier(piece)? {
                self.dc = n;
            } else if let Some((success, fail)) = parse_sf_modifier(piece) {
                self.sf_opt = piece.trim().to_string();
                match success {
                    Some(success) => {
                        self.fail_message = match fail {
                            Some(f) => f,
                            // guess the failure message from the success one
                            None => match success.to_lowercase().as_str() {
                                "hit" => "MISS".into(),
                                "miss" => "HIT".into(),
                                "success" | "succeed" => "FAIL".into(),
                                "fail" => "SUCCESS".into(),
                                _ => format!("NOT {success}"),
                            },
                        };
                        self.success_message = success;
                    }
                    None => {
                        self.success_message = "SUCCESS".into();
                        self.fail_message = "FAIL".into();
                    }
                }
            } else {
                return Err(DiceError::Syntax(format!(
                    "global modifier option \"{piece}\" not understood; must be !, c, dc, \
                     min, max, maximized, sf, until, or repeat"
                )));
            }
        }

        // {a/b/c} permutation groups become template placeholders {0},{1},...
        let (template, groups) = extract_permutations(&spec)?;
        if !groups.is_empty() {
            self.permutations = groups;
            self.template = template;
        }

        if let Some((chance, label)) = parse_percentile(&spec) {
            // <n>% rolls d100 and succeeds with probability n%.
            if !self.permutations.is_empty() {
                return Err(DiceError::Semantics(
                    "permutations with percentile die rolls are not supported".into(),
                ));
            }
            if spec.contains('|') {
                return Err(DiceError::Semantics(format!(
                    "invalid global modifier for percentile die rolls: \"{spec}\""
                )));
            }
            if self.confirm {
                return Err(DiceError::Semantics(
                    "cannot confirm critical percentile die rolls".into(),
                ));
            }
            if self.dc != 0 {
                return Err(DiceError::Semantics(
                    "cannot have a percentile die roll with a DC".into(),
                ));
            }
            self.dice = Some(Dice::basic(1, 100, 0));
            self.pct_chance = chance;
            self.pct_label = label;
        } else if self.template.is_empty() {
            self.dice = Some(Dice::new(&spec)?);
        }
        Ok(())
    }

    // Perform one roll (two when confirming a critical) with the currently
    // configured specification.
    fn roll_dice(&mut self, repeat_count: i64) -> Result<(i64, Vec<RollResult>), DiceError> {
        let Some(mut dice) = self.dice.take() else {
            return Err(DiceError::Semantics("no defined dice to roll".into()));
        };
        let out = self.roll_taken_dice(&mut dice, repeat_count);
        self.dice = Some(dice);
        out
    }

    fn roll_taken_dice(
        &mut self,
        dice: &mut Dice,
        repeat_count: i64,
    ) -> Result<(i64, Vec<RollResult>), DiceError> {
        let mut results: Vec<RollResult> = Vec::new();

        let sfo = if self.sf_opt.is_empty() && self.confirm {
            "c"
        } else {
            self.sf_opt.as_str()
        };

        if self.do_max {
            // assume every die shows its maximum face
            let result = dice.max_roll()?;
            if self.pct_chance >= 0 {
                results.push(pct_roll_result(
                    self.pct_chance,
                    &self.pct_label,
                    result,
                    true,
                ));
            } else {
                let mut this = dice.structured_describe_roll(
                    sfo,
                    &self.success_message,
                    &self.fail_message,
                    0,
                )?;
                self.push_option_report(&mut this, result, repeat_count);
                this.push(Detail::new("moddelim", "|"));
                this.push(Detail::new("fullmax", "maximized"));
                results.push(RollResult {
                    total: result,
                    details: this,
                });
                if self.confirm {
                    let result2 = dice.max_roll_to_confirm(self.crit_bonus)?;
                    let mut this = vec![Detail::new("critlabel", "Confirm:")];
                    this.extend(dice.structured_describe_roll(
                        sfo,
                        &self.success_message,
                        &self.fail_message,
                        self.crit_bonus,
                    )?);
                    this.push(Detail::new("moddelim", "|"));
                    this.push(Detail::new("fullmax", "maximized"));
                    results.push(RollResult {
                        total: result2,
                        details: this,
                    });
                }
            }
            return Ok((result, results));
        }

        let result = dice.roll(&mut self.rng)?;
        if self.pct_chance >= 0 {
            results.push(pct_roll_result(
                self.pct_chance,
                &self.pct_label,
                result,
                false,
            ));
            return Ok((result, results));
        }

        let mut this =
            dice.structured_describe_roll(sfo, &self.success_message, &self.fail_message, 0)?;
        self.push_option_report(&mut this, result, repeat_count);
        results.push(RollResult {
            total: result,
            details: this,
        });

        if self.confirm {
            let result2 =
                dice.roll_to_confirm(true, self.crit_threat, self.crit_bonus, &mut self.rng)?;
            if result2 != 0 {
                let mut this = vec![Detail::new("critlabel", "Confirm:")];
                this.extend(dice.structured_describe_roll(
                    sfo,
                    &self.success_message,
                    &self.fail_message,
                    self.crit_bonus,
                )?);
                results.push(RollResult {
                    total: result2,
                    details: this,
                });
            }
        }
        Ok((result, results))
    }

    // Report the modifiers in play for this roll as trailing fragments.
    fn push_option_report(&self, this: &mut Vec<Detail>, result: i64, repeat_count: i64) {
        if self.confirm {
            this.push(Detail::new("moddelim", "|"));
            let mut c = String::from("c");
            if self.crit_threat != 0 {
                c.push_str(&self.crit_threat.to_string());
            }
            if self.crit_bonus != 0 {
                c.push_str(&format!("{:+}", self.crit_bonus));
            }
            this.push(Detail::new("critspec", c));
        }
        if self.repeat_for > 1 {
            this.push(Detail::new("moddelim", "|"));
            this.push(Detail::new("repeat", self.repeat_for.to_string()));
            this.push(Detail::new("iteration", (repeat_count + 1).to_string()));
        }
        if self.repeat_until != 0 {
            this.push(Detail::new("moddelim", "|"));
            this.push(Detail::new("until", self.repeat_until.to_string()));
            this.push(Detail::new("iteration", (repeat_count + 1).to_string()));
            this.push(describe_dc_roll(self.repeat_until, result));
        }
        if self.dc != 0 {
            this.push(Detail::new("moddelim", "|"));
            this.push(Detail::new("dc", self.dc.to_string()));
            this.push(describe_dc_roll(self.dc, result));
        }
        if !self.sf_opt.is_empty() {
            this.push(Detail::new("moddelim", "|"));
            this.push(Detail::new("sf", self.sf_opt.clone()));
        }
    }
}

impl Default for DieRoller {
    fn default() -> Self {
        DieRoller::new()
    }
}

// Margin above or below a target value.
fn describe_dc_roll(dc: i64, result: i64) -> Detail {
    if result > dc {
        Detail::new("exceeded", (result - dc).to_string())
    } else if result == dc {
        Detail::new("met", "successful")
    } else {
        Detail::new("short", (dc - result).to_string())
    }
}

// Percentile outcomes are reported in words ("hit"/"miss") rather than as
// a numeric total; the result is 1 for success and 0 for failure.
fn pct_roll_result(chance: i64, label: &str, rolled: i64, maximized: bool) -> RollResult {
    let label = label.trim();
    let (positive, negative) = if label.is_empty() {
        ("success".to_string(), "fail".to_string())
    } else {
        match label.split_once('/') {
            Some((a, b)) => (a.trim().to_string(), b.trim().to_string()),
            None => {
                let positive = label.to_string();
                let negative = match positive.to_lowercase().as_str() {
                    "hit" => "miss".to_string(),
                    "miss" => "hit".to_string(),
                    _ => format!("did not {positive}"),
                };
                (positive, negative)
            }
        }
    };

    let success = rolled <= chance;
    let mut details = vec![if success {
        Detail::new("success", positive)
    } else {
        Detail::new("fail", negative)
    }];
    details.push(Detail::new("separator", "="));
    details.push(Detail::new("diespec", format!("{chance}%")));
    if !label.is_empty() {
        details.push(Detail::new("label", label));
    }
    if maximized {
        details.push(Detail::new("maxroll", rolled.to_string()));
        details.push(Detail::new("moddelim", "|"));
        details.push(Detail::new("fullmax", "maximized"));
    } else {
        details.push(Detail::new("roll", rolled.to_string()));
    }
    RollResult {
        total: if success { 1 } else { 0 },
        details,
    }
}

// modifier parsers ---------------------------------------------------------

fn is_clamp_modifier(piece: &str) -> bool {
    let t = piece.trim_start();
    for kw in ["min", "max"] {
        if let Some(rest) = t.strip_prefix(kw) {
            let rest = rest.trim_start();
            let rest = rest.strip_prefix(['+', '-']).unwrap_or(rest);
            if rest.starts_with(|c: char| c.is_ascii_digit()) {
                return true;
            }
        }
    }
    false
}

// c[threat][±bonus]
fn parse_confirm_modifier(piece: &str) -> Result<Option<(i64, i64)>, DiceError> {
    let t = piece.trim();
    let Some(rest) = t.strip_prefix('c') else {
        return Ok(None);
    };
    let digits: String = rest.chars().take_while(|c| c.is_ascii_digit()).collect();
    let after = &rest[digits.len()..];
    let threat = if digits.is_empty() {
        0
    } else {
        digits
            .parse()
            .map_err(|_| DiceError::Syntax(format!("value error in confirm clause \"{t}\"")))?
    };
    if after.is_empty() {
        return Ok(Some((threat, 0)));
    }
    if !after.starts_with(['+', '-']) {
        return Ok(None); // some other word starting with c
    }
    let bonus: i64 = after
        .parse()
        .map_err(|_| DiceError::Syntax(format!("value error in confirm clause \"{t}\"")))?;
    Ok(Some((threat, bonus)))
}

// "<keyword> <n>", with n possibly negative when allowed
fn parse_keyword_number(
    piece: &str,
    keyword: &str,
    allow_negative: bool,
) -> Result<Option<i64>, DiceError> {
    let t = piece.trim();
    let Some(rest) = t.strip_prefix(keyword) else {
        return Ok(None);
    };
    let rest = rest.trim();
    if rest.is_empty() {
        return Ok(None);
    }
    let valid = if allow_negative {
        rest.strip_prefix('-')
            .unwrap_or(rest)
            .chars()
            .all(|c| c.is_ascii_digit())
    } else {
        rest.chars().all(|c| c.is_ascii_digit())
    };
    if !valid {
        return Ok(None);
    }
    rest.parse()
        .map(Some)
        .map_err(|_| DiceError::Syntax(format!("value error in {keyword} clause \"{t}\"")))
}

// DC <n>, case-insensitive keyword
fn parse_dc_modifier(piece: &str) -> Result<Option<i64>, DiceError> {
    let t = piece.trim();
    let Some(prefix) = t.get(..2) else {
        return Ok(None);
    };
    if !prefix.eq_ignore_ascii_case("dc") {
        return Ok(None);
    }
    let rest = t[2..].trim();
    if rest.is_empty() {
        return Ok(None);
    }
    if !rest
        .strip_prefix('-')
        .unwrap_or(rest)
        .chars()
        .all(|c| c.is_ascii_digit())
    {
        return Ok(None);
    }
    rest.parse()
        .map(Some)
        .map_err(|_| DiceError::Syntax(format!("value error in DC clause \"{t}\"")))
}

// sf [<success>[/<fail>]]
fn parse_sf_modifier(piece: &str) -> Option<(Option<String>, Option<String>)> {
    let t = piece.trim();
    let Some(rest) = t.strip_prefix("sf") else {
        return None;
    };
    if rest.is_empty() {
        return Some((None, None));
    }
    if !rest.starts_with(|c: char| c.is_whitespace()) {
        return None; // some other word starting with sf
    }
    let rest = rest.trim();
    if rest.is_empty() {
        return Some((None, None));
    }
    match rest.split_once('/') {
        Some((s, f)) if !f.trim().is_empty() => Some((
            Some(s.trim().to_string()),
            Some(f.trim().to_string()),
        )),
        _ => Some((Some(rest.to_string()), None)),
    }
}

// <n>%[label]
fn parse_percentile(spec: &str) -> Option<(i64, String)> {
    let t = spec.trim_start();
    let digits: String = t.chars().take_while(|c| c.is_ascii_digit()).collect();
    if digits.is_empty() {
        return None;
    }
    let rest = &t[digits.len()..];
    let rest = rest.strip_prefix('%')?;
    let chance = digits.parse().ok()?;
    Some((chance, rest.to_string()))
}

// Replace each {a/b/...} group with a numbered placeholder and collect the
// value sets; a group with fewer than two values is an error.
fn extract_permutations(spec: &str) -> Result<(String, Vec<Vec<String>>), DiceError> {
    let mut groups: Vec<Vec<String>> = Vec::new();
    let mut template = String::new();
    let mut rest = spec;
    while let Some(open) = rest.find('{') {
        let Some(close_rel) = rest[open..].find('}') else {
            break;
        };
        let close = open + close_rel;
        let inner = &rest[open + 1..close];
        let values: Vec<String> = inner.split('/').map(|s| s.to_string()).collect();
        if values.len() < 2 {
            return Err(DiceError::Syntax(format!(
                "invalid specification \"{{{inner}}}\": values in braces must have more \
                 than one value separated by slashes"
            )));
        }
        template.push_str(&rest[..open]);
        template.push('{');
        template.push_str(&groups.len().to_string());
        template.push('}');
        groups.push(values);
        rest = &rest[close + 1..];
    }
    template.push_str(rest);
    Ok((template, groups))
}

fn substitute_template_values(template: &str, values: &[String]) -> String {
    let mut result = template.to_string();
    for (place, value) in values.iter().enumerate() {
        result = result.replacen(&format!("{{{place}}}"), value, 1);
    }
    result
}

// Cartesian product with the first group cycling fastest, so
// "d20+{15/10/5}+{1/2}" expands to 15+1, 10+1, 5+1, 15+2, 10+2, 5+2.
fn cartesian(groups: &[Vec<String>]) -> Vec<Vec<String>> {
    let total: usize = groups.iter().map(Vec::len).product();
    let mut out = Vec::with_capacity(total);
    for mut n in 0..total {
        let mut combo = Vec::with_capacity(groups.len());
        for group in groups {
            combo.push(group[n % group.len()].clone());
            n /= group.len();
        }
        out.push(combo);
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rolls_a_simple_expression() {
        let mut dr = DieRoller::seeded(17);
        let (label, results) = dr.do_roll("2d6+3").unwrap();
        assert_eq!(label, "");
        assert_eq!(results.len(), 1);
        let r = &results[0];
        assert!((5..=15).contains(&r.total), "total {}", r.total);
        assert!(r
            .details
            .iter()
            .any(|d| d.kind == "diespec" && d.value == "2d6"));
        assert!(r
            .details
            .iter()
            .any(|d| d.kind == "operator" && d.value == "+"));
        assert!(r
            .details
            .iter()
            .any(|d| d.kind == "constant" && d.value == "3"));
        let roll = r.details.iter().find(|d| d.kind == "roll").unwrap();
        assert_eq!(roll.value.split(',').count(), 2);
    }

    #[test]
    fn reuses_previous_spec_on_empty_input() {
        let mut dr = DieRoller::seeded(3);
        dr.do_roll("1d6").unwrap();
        let (_, results) = dr.do_roll("").unwrap();
        assert_eq!(results.len(), 1);
        assert!((1..=6).contains(&results[0].total));
    }

    #[test]
    fn extracts_label_prefix() {
        let mut dr = DieRoller::seeded(9);
        let (label, results) = dr.do_roll("attack = d20+5").unwrap();
        assert_eq!(label, "attack");
        assert!((6..=25).contains(&results[0].total));
    }

    #[test]
    fn maximized_confirm_produces_two_full_results() {
        let mut dr = DieRoller::seeded(1);
        let (_, results) = dr.do_roll("1d20|!|c").unwrap();
        assert_eq!(results.len(), 2);
        for r in &results {
            assert_eq!(r.total, 20);
            assert!(r
                .details
                .iter()
                .any(|d| d.kind == "fullmax" && d.value == "maximized"));
        }
        assert_eq!(results[1].details[0].kind, "critlabel");
        assert_eq!(results[1].details[0].value, "Confirm:");
    }

    #[test]
    fn confirms_only_in_threat_range() {
        // threat 1 always confirms: every roll yields two results
        let mut dr = DieRoller::seeded(12);
        let (_, results) = dr.do_roll("1d20|c1").unwrap();
        assert_eq!(results.len(), 2);
        assert!(results[0]
            .details
            .iter()
            .any(|d| d.kind == "critspec" && d.value == "c1"));

        // threat 21 can never be reached: always a single result
        let (_, results) = dr.do_roll("1d20|c21").unwrap();
        assert_eq!(results.len(), 1);
    }

    #[test]
    fn confirm_bonus_applies_to_confirm_roll_only() {
        let mut dr = DieRoller::seeded(5);
        let (_, results) = dr.do_roll("1d20|!|c+5").unwrap();
        assert_eq!(results.len(), 2);
        assert_eq!(results[0].total, 20);
        assert_eq!(results[1].total, 25);
        assert!(results[1]
            .details
            .iter()
            .any(|d| d.kind == "bonus" && d.value == "+5"));
    }

    #[test]
    fn repeats_rolls() {
        let mut dr = DieRoller::seeded(4);
        let (_, results) = dr.do_roll("1d6|repeat 4").unwrap();
        assert_eq!(results.len(), 4);
        assert!(results[0]
            .details
            .iter()
            .any(|d| d.kind == "repeat" && d.value == "4"));
        assert!(results[3]
            .details
            .iter()
            .any(|d| d.kind == "iteration" && d.value == "4"));
    }

    #[test]
    fn until_stops_at_target_or_cap() {
        let mut dr = DieRoller::seeded(6);
        // target 1 is met on the first roll
        let (_, results) = dr.do_roll("1d6|until 1").unwrap();
        assert_eq!(results.len(), 1);
        // an impossible target stops at the iteration cap
        let (_, results) = dr.do_roll("1d6|until 7").unwrap();
        assert_eq!(results.len(), MAX_UNTIL_ITERATIONS as usize);
        assert!(results[0].details.iter().any(|d| d.kind == "until"));
    }

    #[test]
    fn dc_reports_margin() {
        let mut dr = DieRoller::seeded(2);
        let (_, results) = dr.do_roll("10+5|dc 12").unwrap();
        let d = &results[0].details;
        assert!(d.iter().any(|x| x.kind == "dc" && x.value == "12"));
        assert!(d.iter().any(|x| x.kind == "exceeded" && x.value == "3"));

        let (_, results) = dr.do_roll("10+2|DC 12").unwrap();
        assert!(results[0].details.iter().any(|x| x.kind == "met"));

        let (_, results) = dr.do_roll("10|dc 12").unwrap();
        assert!(results[0]
            .details
            .iter()
            .any(|x| x.kind == "short" && x.value == "2"));
    }

    #[test]
    fn sf_labels_natural_extremes() {
        let mut dr = DieRoller::seeded(0);
        // maximized single die is a guaranteed natural max
        let (_, results) = dr.do_roll("1d20|!|sf").unwrap();
        let d = &results[0].details;
        assert_eq!(d[0].kind, "success");
        assert_eq!(d[0].value, "SUCCESS");
        assert!(d.iter().any(|x| x.kind == "sf" && x.value == "sf"));

        let (_, results) = dr.do_roll("1d20|!|sf save/doom").unwrap();
        assert_eq!(results[0].details[0].value, "save");

        // sf needs a single-die expression
        assert!(dr.do_roll("2d6|sf").is_err());
    }

    #[test]
    fn percentile_rolls_report_words() {
        let mut dr = DieRoller::seeded(11);
        // 100% always succeeds
        let (_, results) = dr.do_roll("100%").unwrap();
        assert_eq!(results[0].total, 1);
        assert_eq!(results[0].details[0].kind, "success");

        // 0%... always fails (d100 rolls at least 1)
        let (_, results) = dr.do_roll("0% sanity").unwrap();
        assert_eq!(results[0].total, 0);
        assert_eq!(results[0].details[0].kind, "fail");
        assert_eq!(results[0].details[0].value, "did not sanity");

        let (_, results) = dr.do_roll("100% hit").unwrap();
        assert_eq!(results[0].details[0].value, "hit");

        // maximized percentile reports the maxed face
        let (_, results) = dr.do_roll("100%|!").unwrap();
        assert!(results[0]
            .details
            .iter()
            .any(|d| d.kind == "maxroll" && d.value == "100"));
    }

    #[test]
    fn percentile_rejects_incompatible_modifiers() {
        let mut dr = DieRoller::seeded(0);
        assert!(dr.do_roll("50%|c").is_err());
        assert!(dr.do_roll("50%|dc 3").is_err());
        assert!(dr.do_roll("50%|min 2").is_err());
        assert!(dr.do_roll("{40/50}%").is_err());
        // repeat composes fine
        let (_, results) = dr.do_roll("50%|repeat 3").unwrap();
        assert_eq!(results.len(), 3);
    }

    #[test]
    fn permutations_roll_the_cartesian_product() {
        let mut dr = DieRoller::seeded(21);
        let (_, results) = dr.do_roll("d20+{15/10/5}+{1/2}").unwrap();
        assert_eq!(results.len(), 6);
        // first combination is 15+1, second 10+1 (first group cycles fastest)
        let consts = |r: &RollResult| -> Vec<String> {
            r.details
                .iter()
                .filter(|d| d.kind == "constant")
                .map(|d| d.value.clone())
                .collect()
        };
        assert_eq!(consts(&results[0]), ["15", "1"]);
        assert_eq!(consts(&results[1]), ["10", "1"]);
        assert_eq!(consts(&results[3]), ["15", "2"]);
    }

    #[test]
    fn rejects_unknown_modifiers_and_bad_groups() {
        let mut dr = DieRoller::seeded(0);
        assert!(dr.do_roll("1d20|frobnicate").is_err());
        assert!(dr.do_roll("d20+{15}").is_err());
    }

    #[test]
    fn independent_rollers_do_not_share_state() {
        let mut a = DieRoller::seeded(1);
        let mut b = DieRoller::seeded(2);
        a.do_roll("label a = 1d6").unwrap();
        let (label, _) = b.do_roll("3d4").unwrap();
        assert_eq!(label, "");
        let (label, _) = a.do_roll("").unwrap();
        assert_eq!(label, "label a");
    }
}
