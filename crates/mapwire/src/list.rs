//! Space-delimited, brace-quoted list codec.
//!
//! An element containing whitespace (or starting with a character that
//! would confuse the parser) is wrapped in `{...}`; an empty element is
//! `{}`. A balanced pair of braces inside a larger element may be left
//! as-is; a lone brace must be backslash-escaped. A double-quoted form is
//! accepted on decode. `decode(encode(l)) == l` for every list `l`, and
//! `encode` emits the minimum quoting needed.

use crate::WireError;

/// Split one wire line into its elements.
pub fn decode(s: &str) -> Result<Vec<String>, WireError> {
    let b = s.as_bytes();
    let mut out = Vec::new();
    let mut i = 0usize;
    // Unescaped braces inside bare words must balance across the line.
    let mut bare_depth: i64 = 0;

    while i < b.len() {
        if b[i].is_ascii_whitespace() {
            i += 1;
            continue;
        }
        match b[i] {
            b'{' => {
                i += 1;
                let mut depth: i64 = 1;
                let mut elem: Vec<u8> = Vec::new();
                loop {
                    if i >= b.len() {
                        return Err(WireError::MalformedList("unterminated brace quoting"));
                    }
                    match b[i] {
                        b'\\' if i + 1 < b.len() && (b[i + 1] == b'{' || b[i + 1] == b'}') => {
                            // escaped brace: literal, does not affect balance
                            elem.push(b[i + 1]);
                            i += 2;
                        }
                        b'{' => {
                            depth += 1;
                            elem.push(b'{');
                            i += 1;
                        }
                        b'}' => {
                            depth -= 1;
                            i += 1;
                            if depth == 0 {
                                break;
                            }
                            elem.push(b'}');
                        }
                        c => {
                            elem.push(c);
                            i += 1;
                        }
                    }
                }
                if i < b.len() && !b[i].is_ascii_whitespace() {
                    return Err(WireError::MalformedList(
                        "extra characters after closing brace",
                    ));
                }
                out.push(String::from_utf8_lossy(&elem).into_owned());
            }
            b'"' => {
                i += 1;
                let mut elem: Vec<u8> = Vec::new();
                loop {
                    if i >= b.len() {
                        return Err(WireError::MalformedList("unterminated quoted string"));
                    }
                    match b[i] {
                        b'\\' if i + 1 < b.len() && b[i + 1] == b'"' => {
                            elem.push(b'"');
                            i += 2;
                        }
                        b'"' => {
                            i += 1;
                            break;
                        }
                        c => {
                            elem.push(c);
                            i += 1;
                        }
                    }
                }
                if i < b.len() && !b[i].is_ascii_whitespace() {
                    return Err(WireError::MalformedList(
                        "extra characters after closing quote",
                    ));
                }
                out.push(String::from_utf8_lossy(&elem).into_owned());
            }
            _ => {
                let mut elem: Vec<u8> = Vec::new();
                while i < b.len() && !b[i].is_ascii_whitespace() {
                    match b[i] {
                        b'\\' => {
                            if i + 1 >= b.len() {
                                return Err(WireError::MalformedList("trailing backslash"));
                            }
                            let c = b[i + 1];
                            if matches!(c, b'{' | b'}' | b'"' | b'\\' | b'#' | b' ' | b'\t') {
                                elem.push(c);
                            } else {
                                // not an escape we recognize; keep both
                                elem.push(b'\\');
                                elem.push(c);
                            }
                            i += 2;
                        }
                        b'{' => {
                            bare_depth += 1;
                            elem.push(b'{');
                            i += 1;
                        }
                        b'}' => {
                            bare_depth -= 1;
                            if bare_depth < 0 {
                                return Err(WireError::MalformedList("unbalanced close brace"));
                            }
                            elem.push(b'}');
                            i += 1;
                        }
                        c => {
                            elem.push(c);
                            i += 1;
                        }
                    }
                }
                out.push(String::from_utf8_lossy(&elem).into_owned());
            }
        }
    }

    if bare_depth != 0 {
        return Err(WireError::MalformedList("unbalanced open brace"));
    }
    Ok(out)
}

/// Join elements into the canonical wire representation.
pub fn encode<S: AsRef<str>>(items: &[S]) -> String {
    let mut out = String::new();
    for (n, item) in items.iter().enumerate() {
        if n > 0 {
            out.push(' ');
        }
        push_element(&mut out, item.as_ref());
    }
    out
}

fn push_element(out: &mut String, elem: &str) {
    if elem.is_empty() {
        out.push_str("{}");
        return;
    }

    let needs_quoting = elem.contains(|c: char| c.is_ascii_whitespace())
        || elem.contains('{')
        || elem.contains('}')
        || elem.starts_with('{')
        || elem.starts_with('"')
        || elem.starts_with('#');

    if !needs_quoting {
        out.push_str(elem);
        return;
    }

    if brace_wrappable(elem) {
        out.push('{');
        out.push_str(elem);
        out.push('}');
        return;
    }

    // Fall back to backslash escaping, character by character.
    for (n, c) in elem.chars().enumerate() {
        match c {
            '{' | '}' | '\\' => {
                out.push('\\');
                out.push(c);
            }
            c if c.is_ascii_whitespace() => {
                out.push('\\');
                out.push(c);
            }
            '"' | '#' if n == 0 => {
                out.push('\\');
                out.push(c);
            }
            c => out.push(c),
        }
    }
}

/// A verbatim `{...}` wrap survives a decode round trip only when the
/// content's braces balance on their own and no backslash sits where the
/// decoder would treat it as a brace escape.
fn brace_wrappable(elem: &str) -> bool {
    let b = elem.as_bytes();
    let mut depth: i64 = 0;
    let mut i = 0usize;
    while i < b.len() {
        match b[i] {
            b'\\' => {
                if i + 1 >= b.len() {
                    return false; // trailing backslash would escape our closing brace
                }
                if b[i + 1] == b'{' || b[i + 1] == b'}' {
                    return false; // decoder would strip the backslash
                }
                i += 2;
            }
            b'{' => {
                depth += 1;
                i += 1;
            }
            b'}' => {
                depth -= 1;
                if depth < 0 {
                    return false;
                }
                i += 1;
            }
            _ => i += 1,
        }
    }
    depth == 0
}
