//! `key=value` side-channel encoding used for the `metaInfo` columns.
//!
//! Pairs are separated by `,`. A value containing `,` is wrapped in `"`.
//! A `"` inside a value becomes `&#034;` and a `=` inside a key becomes `&#061;`.

use std::collections::BTreeMap;

const SEP: char = ',';
const APOS: char = '"';
const ASSIGN: char = '=';
const ESC_APOS: &str = "&#034;";
const ESC_ASSIGN: &str = "&#061;";

pub type MetaInfo = BTreeMap<String, String>;

pub fn map_to_csv(map: &MetaInfo) -> String {
    let mut buf = String::with_capacity(map.len() * 32);
    for (key, value) in map {
        if !buf.is_empty() {
            buf.push(SEP);
        }
        buf.push_str(&key.replace(ASSIGN, ESC_ASSIGN));
        buf.push(ASSIGN);
        let quoted = value.contains(SEP);
        if quoted {
            buf.push(APOS);
        }
        buf.push_str(&value.replace(APOS, ESC_APOS));
        if quoted {
            buf.push(APOS);
        }
    }
    buf
}

/// Inverse of [`map_to_csv`]. A pair without `=` maps to an empty value.
pub fn csv_to_map(csv: &str) -> MetaInfo {
    let mut map = MetaInfo::new();
    if csv.is_empty() {
        return map;
    }

    let mut tokens = Vec::new();
    let mut current = String::new();
    let mut in_quotes = false;
    for c in csv.chars() {
        match c {
            APOS => in_quotes = !in_quotes,
            SEP if !in_quotes => tokens.push(std::mem::take(&mut current)),
            _ => current.push(c),
        }
    }
    tokens.push(current);

    for token in tokens.into_iter().filter(|t| !t.is_empty()) {
        let (key, value) = match token.split_once(ASSIGN) {
            Some((k, v)) => (k.to_string(), v.to_string()),
            None => (token, String::new()),
        };
        map.insert(key.replace(ESC_ASSIGN, "="), value.replace(ESC_APOS, "\""));
    }
    map
}
