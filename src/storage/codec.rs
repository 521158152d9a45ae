//! Line-Record Codec
//!
//! The data file is a list of `key:value` lines. This module works on the
//! whole file content as a string: the storage engine reads the file, runs one
//! of these transforms, and writes the result back.
//!
//! ## Matching Rules
//!
//! A line belongs to key `k` only if it is a well-formed record, i.e. it
//! splits at its first `:` into a key equal to `k` and a value that parses
//! as an `i64`. Anything else (blank lines, lines without `:`, non-numeric
//! values) is never matched and is carried through unchanged.

use std::fmt;

/// Separator between key and value on a line.
pub const SEPARATOR: char = ':';

/// A single `key:value` record.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Record {
    pub key: String,
    pub value: i64,
}

impl Record {
    pub fn new(key: impl Into<String>, value: i64) -> Self {
        Self {
            key: key.into(),
            value,
        }
    }
}

impl fmt::Display for Record {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}{}{}", self.key, SEPARATOR, self.value)
    }
}

/// Parses one line into `(key, value)`, or `None` if it is not a record.
pub fn parse_line(line: &str) -> Option<(&str, i64)> {
    let (key, value) = line.split_once(SEPARATOR)?;
    let value = value.trim_end_matches('\r').parse::<i64>().ok()?;
    Some((key, value))
}

/// Returns `true` if `line` is a record whose key satisfies `pred`.
fn line_matches(line: &str, pred: impl Fn(&str) -> bool) -> bool {
    parse_line(line).is_some_and(|(key, _)| pred(key))
}

/// Looks up the value of the first record for `key`.
pub fn find(content: &str, key: &str) -> Option<i64> {
    content
        .lines()
        .filter_map(parse_line)
        .find(|(k, _)| *k == key)
        .map(|(_, value)| value)
}

/// Removes any record for `key` and appends `key:value`.
pub fn upsert(content: &str, key: &str, value: i64) -> String {
    let (mut out, _) = retain(content, |line| !line_matches(line, |k| k == key));
    out.push_str(&Record::new(key, value).to_string());
    out.push('\n');
    out
}

/// Removes every record whose key is in `keys`.
///
/// Returns the new content and how many lines were dropped. Keys with no
/// record are ignored. Surviving lines keep their order.
pub fn remove<S: AsRef<str>>(content: &str, keys: &[S]) -> (String, usize) {
    retain(content, |line| {
        !line_matches(line, |k| keys.iter().any(|key| key.as_ref() == k))
    })
}

/// Every well-formed record in file order.
pub fn records(content: &str) -> Vec<Record> {
    content
        .lines()
        .filter_map(parse_line)
        .map(|(key, value)| Record::new(key, value))
        .collect()
}

/// Keeps lines for which `keep` is true, newline-terminating each.
fn retain(content: &str, keep: impl Fn(&str) -> bool) -> (String, usize) {
    let mut out = String::with_capacity(content.len() + 16);
    let mut dropped = 0;

    for line in content.lines() {
        if keep(line) {
            out.push_str(line);
            out.push('\n');
        } else {
            dropped += 1;
        }
    }

    (out, dropped)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_line() {
        assert_eq!(parse_line("a:1"), Some(("a", 1)));
        assert_eq!(parse_line("a:-42"), Some(("a", -42)));
        assert_eq!(parse_line("a:1\r"), Some(("a", 1)));
        assert_eq!(parse_line(""), None);
        assert_eq!(parse_line("no-separator"), None);
        assert_eq!(parse_line("a:abc"), None);
        assert_eq!(parse_line("a:1:2"), None);
    }

    #[test]
    fn test_find_exact_key() {
        let content = "ab:1\na:2\nb:3\n";
        assert_eq!(find(content, "a"), Some(2));
        assert_eq!(find(content, "ab"), Some(1));
        assert_eq!(find(content, "b"), Some(3));
        assert_eq!(find(content, "c"), None);
    }

    #[test]
    fn test_find_ignores_blank_and_malformed_lines() {
        let content = "\n\na\na:oops\na:7\n";
        assert_eq!(find(content, "a"), Some(7));
    }

    #[test]
    fn test_find_in_empty_content() {
        assert_eq!(find("", "a"), None);
    }

    #[test]
    fn test_upsert_appends_new_key() {
        assert_eq!(upsert("", "a", 1), "a:1\n");
        assert_eq!(upsert("a:1\n", "b", 2), "a:1\nb:2\n");
    }

    #[test]
    fn test_upsert_replaces_existing_key() {
        let content = upsert("a:1\nb:2\n", "a", 10);
        assert_eq!(content, "b:2\na:10\n");
        assert_eq!(find(&content, "a"), Some(10));
    }

    #[test]
    fn test_upsert_keeps_malformed_lines() {
        let content = upsert("a:broken\nb:2\n", "a", 5);
        assert_eq!(content, "a:broken\nb:2\na:5\n");
    }

    #[test]
    fn test_upsert_terminates_unterminated_content() {
        assert_eq!(upsert("a:1", "b", 2), "a:1\nb:2\n");
    }

    #[test]
    fn test_remove_single_key() {
        let (content, dropped) = remove("a:1\nb:2\n", &["a"]);
        assert_eq!(content, "b:2\n");
        assert_eq!(dropped, 1);
    }

    #[test]
    fn test_remove_missing_key_is_noop() {
        let (content, dropped) = remove("a:1\n", &["z"]);
        assert_eq!(content, "a:1\n");
        assert_eq!(dropped, 0);
    }

    #[test]
    fn test_batch_remove_preserves_order() {
        let (content, dropped) = remove("a:1\nx:9\nc:3\ny:8\nz:7\n", &["a", "b", "c"]);
        assert_eq!(content, "x:9\ny:8\nz:7\n");
        assert_eq!(dropped, 2);
    }

    #[test]
    fn test_remove_never_matches_malformed_lines() {
        let (content, dropped) = remove("a\na:nope\nb:1\n", &["a"]);
        assert_eq!(content, "a\na:nope\nb:1\n");
        assert_eq!(dropped, 0);
    }

    #[test]
    fn test_records_in_file_order() {
        let records = records("b:2\n\njunk\na:1\n");
        assert_eq!(records, vec![Record::new("b", 2), Record::new("a", 1)]);
    }

    #[test]
    fn test_record_display() {
        assert_eq!(Record::new("k", -3).to_string(), "k:-3");
    }
}
