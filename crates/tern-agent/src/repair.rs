//! Best-effort repair of malformed tool-call argument text.
//!
//! Models regularly emit argument payloads that are almost JSON: wrapped in
//! stray `null` tokens, double-escaped, missing quotes around keys, missing a
//! closing brace, and so on. [`repair_arguments`] runs a fixed sequence of
//! conservative rewrites over such text. Every step is a no-op unless its
//! precondition holds, and text that already parses cleanly is returned
//! untouched. The result is not guaranteed to be valid JSON; callers must
//! re-check it with [`is_strict_json`].

use serde_json::Value;

const LEGAL_ESCAPES: [char; 8] = ['"', '\\', '/', 'b', 'f', 'n', 'r', 't'];

/// Rewrites `raw` towards valid JSON. Blank input becomes `{}`.
pub fn repair_arguments(raw: &str) -> String {
    let text = raw.trim();
    if text.is_empty() {
        return "{}".to_string();
    }
    if is_clean_json(text) {
        return text.to_string();
    }

    tracing::debug!(arguments = text, "repairing malformed tool arguments");

    let steps: [(&str, fn(&str) -> String); 8] = [
        ("strip_null_prefix", strip_null_prefix),
        ("strip_null_suffix", strip_null_suffix),
        ("unescape_double_escaped", unescape_double_escaped),
        ("escape_string_values", escape_string_values),
        ("quote_bare_keys", quote_bare_keys),
        ("balance_brackets", balance_brackets),
        ("strip_illegal_escapes", strip_illegal_escapes),
        ("comma_fallback", comma_fallback),
    ];

    let mut current = text.to_string();
    for (name, step) in steps {
        let next = step(&current);
        if next != current {
            tracing::debug!(step = name, before = %current, after = %next, "argument repair step applied");
            current = next;
        }
    }

    if !is_strict_json(&current) && is_strict_json(text) {
        tracing::debug!(arguments = text, "repair broke valid arguments; keeping the original");
        return text.to_string();
    }
    current
}

/// Whether `text` is one complete JSON value with nothing trailing.
pub fn is_strict_json(text: &str) -> bool {
    serde_json::from_str::<Value>(text).is_ok()
}

/// Strict JSON that does not smuggle more JSON inside string values.
fn is_clean_json(text: &str) -> bool {
    let Ok(value) = serde_json::from_str::<Value>(text) else {
        return false;
    };
    match &value {
        Value::String(inner) => {
            let inner = inner.trim();
            !(inner.starts_with('{') || inner.starts_with('['))
        }
        Value::Object(fields) => !fields
            .values()
            .filter_map(Value::as_str)
            .any(|field| is_bracket_wrapped(field.trim())),
        _ => true,
    }
}

fn is_bracket_wrapped(text: &str) -> bool {
    (text.starts_with('{') && text.ends_with('}')) || (text.starts_with('[') && text.ends_with(']'))
}

fn is_quote_wrapped(text: &str) -> bool {
    text.len() > 2 && text.starts_with('"') && text.ends_with('"')
}

fn strip_null_prefix(text: &str) -> String {
    let mut stripped = text.trim();
    while let Some(rest) = stripped.strip_prefix("null") {
        stripped = rest.trim_start();
    }
    if stripped.len() == text.len() {
        return text.to_string();
    }
    let plausible = stripped.starts_with('{')
        || stripped.starts_with('[')
        || (stripped.starts_with('"') && stripped.len() > 2);
    if plausible {
        stripped.to_string()
    } else {
        text.to_string()
    }
}

fn strip_null_suffix(text: &str) -> String {
    let mut stripped = strip_trailing_nulls(text.trim()).to_string();

    if is_quote_wrapped(&stripped) {
        let inner = &stripped[1..stripped.len() - 1];
        if inner.ends_with("null") {
            let mut unwrapped = strip_trailing_nulls(inner);
            while let Some(without_quote) = unwrapped.strip_suffix('"') {
                if !is_bracket_wrapped(without_quote) {
                    break;
                }
                unwrapped = without_quote;
            }
            stripped = unwrapped.to_string();
        }
    }

    if stripped == text {
        return stripped;
    }
    if is_bracket_wrapped(&stripped) || is_quote_wrapped(&stripped) {
        stripped
    } else {
        text.to_string()
    }
}

fn strip_trailing_nulls(text: &str) -> &str {
    let mut stripped = text;
    while let Some(rest) = stripped.strip_suffix("null") {
        stripped = rest.trim_end();
    }
    stripped
}

fn unescape_double_escaped(text: &str) -> String {
    if is_quote_wrapped(text) {
        let unescaped = text[1..text.len() - 1]
            .replace("\\\"", "\"")
            .replace("\\\\", "\\");
        if is_bracket_wrapped(&unescaped) {
            return unescaped;
        }
    }

    if text.contains("\\\"") && !text.starts_with('"') {
        let unescaped = text.replace("\\\"", "\"");
        if is_bracket_wrapped(&unescaped) {
            return unescaped;
        }
    }

    text.to_string()
}

/// Escapes stray quotes inside object values and raw control characters and
/// lone backslashes inside any string. Must run before keys are quoted.
fn escape_string_values(text: &str) -> String {
    if !is_bracket_wrapped(text) {
        return text.to_string();
    }

    let chars: Vec<char> = text.chars().collect();
    let mut output = String::with_capacity(text.len() + 8);
    let mut in_string = false;
    let mut after_colon = false;
    let mut index = 0;

    while index < chars.len() {
        let ch = chars[index];

        if !in_string {
            match ch {
                '"' => in_string = true,
                ':' => after_colon = true,
                ',' | '{' | '[' => after_colon = false,
                _ => {}
            }
            output.push(ch);
            index += 1;
            continue;
        }

        match ch {
            '\\' => match chars.get(index + 1) {
                Some(&next) if LEGAL_ESCAPES.contains(&next) || next == 'u' => {
                    output.push(ch);
                    output.push(next);
                    index += 2;
                    continue;
                }
                _ => output.push_str("\\\\"),
            },
            '"' => {
                let closes = match next_non_space(&chars, index + 1) {
                    Some(next) if after_colon => matches!(next, ',' | '}' | ']'),
                    _ => true,
                };
                if closes {
                    in_string = false;
                    after_colon = false;
                    output.push(ch);
                } else {
                    output.push_str("\\\"");
                }
            }
            '\n' => output.push_str("\\n"),
            '\r' => output.push_str("\\r"),
            '\t' => output.push_str("\\t"),
            _ => output.push(ch),
        }
        index += 1;
    }

    output
}

fn next_non_space(chars: &[char], start: usize) -> Option<char> {
    chars[start.min(chars.len())..]
        .iter()
        .copied()
        .find(|ch| !matches!(ch, ' ' | '\t' | '\n' | '\r'))
}

/// Quotes identifier keys that follow `{` or `,` outside string literals.
fn quote_bare_keys(text: &str) -> String {
    if !text.starts_with('{') {
        return text.to_string();
    }

    let chars: Vec<char> = text.chars().collect();
    let mut output = String::with_capacity(text.len() + 8);
    let mut in_string = false;
    let mut escaped = false;
    let mut key_position = false;
    let mut index = 0;

    while index < chars.len() {
        let ch = chars[index];

        if in_string {
            output.push(ch);
            if escaped {
                escaped = false;
            } else if ch == '\\' {
                escaped = true;
            } else if ch == '"' {
                in_string = false;
            }
            index += 1;
            continue;
        }

        if key_position && (ch.is_ascii_alphabetic() || ch == '_') {
            let end = chars[index..]
                .iter()
                .position(|c| !(c.is_ascii_alphanumeric() || *c == '_'))
                .map_or(chars.len(), |offset| index + offset);
            if next_non_space(&chars, end) == Some(':') {
                output.push('"');
                output.extend(&chars[index..end]);
                output.push('"');
                key_position = false;
                index = end;
                continue;
            }
        }

        match ch {
            '{' | ',' => key_position = true,
            ' ' | '\t' | '\n' | '\r' => {}
            '"' => {
                in_string = true;
                key_position = false;
            }
            _ => key_position = false,
        }
        output.push(ch);
        index += 1;
    }

    output
}

/// Appends closers for unclosed `{`/`[` outside strings (innermost first)
/// and drops closers that have no opener.
fn balance_brackets(text: &str) -> String {
    let mut output = String::with_capacity(text.len() + 4);
    let mut open: Vec<char> = Vec::new();
    let mut quote: Option<char> = None;
    let mut escaped = false;

    for ch in text.chars() {
        if let Some(active) = quote {
            output.push(ch);
            if escaped {
                escaped = false;
            } else if ch == '\\' {
                escaped = true;
            } else if ch == active {
                quote = None;
            }
            continue;
        }

        match ch {
            '"' | '\'' => {
                quote = Some(ch);
                output.push(ch);
            }
            '{' | '[' => {
                open.push(ch);
                output.push(ch);
            }
            '}' | ']' => {
                let opener = if ch == '}' { '{' } else { '[' };
                if open.last() == Some(&opener) {
                    open.pop();
                    output.push(ch);
                } else if let Some(position) = open.iter().rposition(|candidate| *candidate == opener) {
                    // Close the inner brackets the model forgot before this one.
                    for unclosed in open.drain(position + 1..).rev() {
                        output.push(closer_for(unclosed));
                    }
                    open.pop();
                    output.push(ch);
                }
            }
            _ => output.push(ch),
        }
    }

    for unclosed in open.into_iter().rev() {
        output.push(closer_for(unclosed));
    }
    output
}

fn closer_for(opener: char) -> char {
    if opener == '{' { '}' } else { ']' }
}

fn strip_illegal_escapes(text: &str) -> String {
    let chars: Vec<char> = text.chars().collect();
    let mut output = String::with_capacity(text.len());
    let mut in_string = false;
    let mut index = 0;

    while index < chars.len() {
        let ch = chars[index];
        if ch == '"' {
            in_string = !in_string;
            output.push(ch);
            index += 1;
            continue;
        }
        if ch == '\\' && in_string {
            match chars.get(index + 1) {
                Some(&next) if LEGAL_ESCAPES.contains(&next) || next == 'u' => {
                    output.push(ch);
                    output.push(next);
                    index += 2;
                }
                Some(_) => index += 1,
                None => {
                    output.push(ch);
                    index += 1;
                }
            }
            continue;
        }
        output.push(ch);
        index += 1;
    }

    output
}

/// Last resort for text that is not object, array or string shaped: treat it
/// as comma-separated positional values and wrap them in an array. Parts that
/// are JSON values on their own are kept as-is, everything else becomes a
/// JSON string.
fn comma_fallback(text: &str) -> String {
    if text.starts_with('{') || text.starts_with('[') || is_quote_wrapped(text) {
        return text.to_string();
    }

    let values: Vec<Value> = split_top_level_commas(text)
        .into_iter()
        .map(|part| {
            serde_json::from_str::<Value>(&part).unwrap_or_else(|_| Value::String(part))
        })
        .collect();
    if values.is_empty() {
        return text.to_string();
    }

    let wrapped = Value::Array(values).to_string();
    tracing::info!(arguments = text, converted = %wrapped, "converted positional arguments to JSON array");
    wrapped
}

fn split_top_level_commas(text: &str) -> Vec<String> {
    let mut parts = Vec::new();
    let mut current = String::new();
    let mut quote: Option<char> = None;
    let mut escaped = false;

    for ch in text.chars() {
        if escaped {
            current.push(ch);
            escaped = false;
            continue;
        }
        match ch {
            '\\' => {
                current.push(ch);
                escaped = true;
            }
            '"' | '\'' => {
                match quote {
                    None => quote = Some(ch),
                    Some(active) if active == ch => quote = None,
                    Some(_) => {}
                }
                current.push(ch);
            }
            ',' if quote.is_none() => {
                push_part(&mut parts, &current);
                current.clear();
            }
            _ => current.push(ch),
        }
    }
    push_part(&mut parts, &current);
    parts
}

fn push_part(parts: &mut Vec<String>, part: &str) {
    let part = part.trim();
    if !part.is_empty() {
        parts.push(part.to_string());
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn parsed(text: &str) -> Value {
        serde_json::from_str(text).expect("repaired text should be valid JSON")
    }

    #[test]
    fn clean_json_is_returned_unchanged() {
        for input in [
            r#"{"city": "Paris", "days": 3}"#,
            r#"[1, 2, {"nested": [true, null]}]"#,
            r#""plain string""#,
            "42",
            r#"{"path": "C:\\Users\\me", "note": "say \"hi\""}"#,
        ] {
            assert_eq!(repair_arguments(input), input);
        }
    }

    #[test]
    fn blank_input_becomes_empty_object() {
        assert_eq!(repair_arguments(""), "{}");
        assert_eq!(repair_arguments("   \n"), "{}");
    }

    #[test]
    fn strips_null_noise_around_object() {
        assert_eq!(
            repair_arguments(r#"null{"city": "Paris"} null"#),
            r#"{"city": "Paris"}"#
        );
        assert_eq!(repair_arguments(r#"nullnull{"a": 1}"#), r#"{"a": 1}"#);
    }

    #[test]
    fn strips_null_inside_quote_wrapped_payload() {
        let repaired = repair_arguments(r#""{\"a\": 1}null""#);
        assert_eq!(parsed(&repaired), json!({"a": 1}));
    }

    #[test]
    fn unwraps_double_escaped_object() {
        let repaired = repair_arguments(r#""{\"query\": \"rust\", \"limit\": 5}""#);
        assert_eq!(parsed(&repaired), json!({"query": "rust", "limit": 5}));
    }

    #[test]
    fn unescapes_escaped_quotes_without_wrapper() {
        let repaired = repair_arguments(r#"{\"query\": \"rust\"}"#);
        assert_eq!(parsed(&repaired), json!({"query": "rust"}));
    }

    #[test]
    fn escapes_stray_quotes_and_raw_newlines_in_values() {
        let repaired = repair_arguments("{\"text\": \"she said \"hi\" today\nbye\"}");
        assert_eq!(parsed(&repaired), json!({"text": "she said \"hi\" today\nbye"}));
    }

    #[test]
    fn keeps_lone_backslashes_in_values_literal() {
        let repaired = repair_arguments("{\"path\": \"C:\\dir\\x\", \"n\": 1}");
        assert_eq!(parsed(&repaired), json!({"path": "C:\\dir\\x", "n": 1}));
    }

    #[test]
    fn quotes_bare_keys() {
        let repaired = repair_arguments(r#"{city: "Paris", unit_name: "c"}"#);
        assert_eq!(parsed(&repaired), json!({"city": "Paris", "unit_name": "c"}));
    }

    #[test]
    fn key_like_text_inside_strings_is_left_alone() {
        let truncated = repair_arguments(r#"{"msg": "note, x: y""#);
        assert!(is_strict_json(&truncated));
        assert_eq!(parsed(&truncated), json!({"msg": "note, x: y"}));

        let mixed = repair_arguments(r#"{query: "a, limit: 3", limit: 3}"#);
        assert_eq!(parsed(&mixed), json!({"query": "a, limit: 3", "limit": 3}));
    }

    #[test]
    fn valid_json_with_embedded_object_text_survives_the_pipeline() {
        let input = r#"{"cmd": "{a: 1}"}"#;
        assert!(!is_clean_json(input));

        let repaired = repair_arguments(input);

        assert!(is_strict_json(&repaired));
        assert_eq!(repaired, input);
    }

    #[test]
    fn closes_unbalanced_brackets_innermost_first() {
        assert_eq!(parsed(&repair_arguments(r#"{"a": [1, 2"#)), json!({"a": [1, 2]}));
        assert_eq!(parsed(&repair_arguments(r#"{"a": {"b": 1}"#)), json!({"a": {"b": 1}}));
        assert_eq!(parsed(&repair_arguments(r#"{"a": 1}}"#)), json!({"a": 1}));
    }

    #[test]
    fn bracket_counting_ignores_brackets_inside_strings() {
        let repaired = repair_arguments(r#"{"pattern": "[a-z]{2,", "n": 1"#);
        assert_eq!(parsed(&repaired), json!({"pattern": "[a-z]{2,", "n": 1}));
    }

    #[test]
    fn drops_illegal_escapes_outside_value_strings() {
        let repaired = strip_illegal_escapes(r#"["a\qb", "tab\tok"]"#);
        assert_eq!(repaired, r#"["aqb", "tab\tok"]"#);
        assert_eq!(parsed(&repaired), json!(["aqb", "tab\tok"]));
    }

    #[test]
    fn comma_fallback_wraps_positional_arguments() {
        let repaired = repair_arguments(r#""/tmp/readme.md", 1, 100"#);
        assert_eq!(parsed(&repaired), json!(["/tmp/readme.md", 1, 100]));
    }

    #[test]
    fn comma_fallback_encodes_non_json_parts_as_strings() {
        let repaired = repair_arguments(r#"city: "Paris", unit: c"#);
        assert_eq!(repaired, r#"["city: \"Paris\"","unit: c"]"#);
        assert_eq!(parsed(&repaired), json!(["city: \"Paris\"", "unit: c"]));
    }

    #[test]
    fn single_token_is_wrapped_in_array() {
        assert_eq!(repair_arguments("foo"), r#"["foo"]"#);
        assert_eq!(repair_arguments("foo bar"), r#"["foo bar"]"#);
    }

    #[test]
    fn comma_split_respects_quotes() {
        assert_eq!(
            split_top_level_commas(r#"'a, b', "c\", d", e"#),
            vec!["'a, b'".to_string(), r#""c\", d""#.to_string(), "e".to_string()]
        );
    }

    #[test]
    fn embedded_json_string_field_is_not_short_circuited() {
        assert!(!is_clean_json(r#"{"items": "[1, 2]"}"#));
        assert!(!is_clean_json(r#""{\"a\": 1}""#));
        assert!(is_clean_json(r#"{"items": "[1, 2"}"#));
        // Still valid after the pipeline runs; nothing needed changing.
        assert_eq!(repair_arguments(r#"{"items": "[1, 2]"}"#), r#"{"items": "[1, 2]"}"#);
    }

    #[test]
    fn repairing_twice_is_stable_for_repaired_output() {
        let once = repair_arguments(r#"null{city: "Paris", "tags": ["a""#);
        assert_eq!(parsed(&once), json!({"city": "Paris", "tags": ["a"]}));
        assert_eq!(repair_arguments(&once), once);
    }
}
