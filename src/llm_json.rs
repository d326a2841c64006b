//! Parsing JSON objects out of LLM replies.
//!
//! Models like to wrap JSON in prose or Markdown fences, and smaller models
//! sometimes forget to quote keys or simple values. We do just enough repair
//! to cope with the common cases.

use std::sync::LazyLock;

use regex::Regex;
use serde_json::Map;

use crate::prelude::*;

/// A bare key, like `name:`.
static BARE_KEY: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"([a-zA-Z0-9_]+):").expect("built-in regex should be valid")
});

/// A bare scalar value, like `: NA,`.
static BARE_VALUE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r": ([A-Za-z0-9_]+)(,|\})").expect("built-in regex should be valid")
});

/// Keep everything from the first `{` to the last `}`. Returns `None` if there
/// is no such span.
pub fn object_span(raw: &str) -> Option<&str> {
    let start = raw.find('{')?;
    let end = raw.rfind('}')?;
    if end < start {
        return None;
    }
    Some(&raw[start..=end])
}

/// Quote bare keys and bare scalar values.
fn quote_bare_tokens(json: &str) -> String {
    let quoted_keys = BARE_KEY.replace_all(json, "\"$1\":");
    // The key pass leaves `"key":` behind, so we also need to catch values
    // that follow a quoted key.
    BARE_VALUE.replace_all(&quoted_keys, ": \"$1\"$2").into_owned()
}

/// Parse a JSON object from an LLM reply, repairing it if necessary.
pub fn parse_llm_object(raw: &str) -> Result<Map<String, Value>> {
    let span = object_span(raw).ok_or_else(|| anyhow!("no JSON object in LLM output"))?;
    let value = match serde_json::from_str::<Value>(span) {
        Ok(value) => value,
        Err(err) => {
            debug!("LLM output is not valid JSON, trying to repair it: {err}");
            let repaired = quote_bare_tokens(span);
            trace!(%repaired, "Repaired LLM output");
            serde_json::from_str::<Value>(&repaired)
                .context("could not parse LLM output as JSON")?
        }
    };
    match value {
        Value::Object(map) => Ok(map),
        _ => Err(anyhow!("LLM output is not a JSON object")),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn strips_surrounding_prose_and_fences() {
        let raw = "Here you go:\n```json\n{\"name\": \"Smith\"}\n```\nAnything else?";
        let map = parse_llm_object(raw).unwrap();
        assert_eq!(map["name"], json!("Smith"));
    }

    #[test]
    fn valid_json_is_not_rewritten() {
        // A value containing `word:` would be damaged by the repair pass.
        let raw = r#"{"note": "time: 10:30", "n": 3}"#;
        let map = parse_llm_object(raw).unwrap();
        assert_eq!(map["note"], json!("time: 10:30"));
        assert_eq!(map["n"], json!(3));
    }

    #[test]
    fn repairs_bare_keys_and_values() {
        let raw = "{name: \"Smith\", status: NA, nested: {city: Boston}}";
        let map = parse_llm_object(raw).unwrap();
        assert_eq!(map["name"], json!("Smith"));
        assert_eq!(map["status"], json!("NA"));
        assert_eq!(map["nested"], json!({ "city": "Boston" }));
    }

    #[test]
    fn rejects_replies_without_objects() {
        assert!(parse_llm_object("I'm sorry, I can't help with that.").is_err());
        assert!(parse_llm_object("} backwards {").is_err());
        assert!(parse_llm_object("{ this is not json at all }").is_err());
    }

    #[test]
    fn object_span_keeps_outermost_braces() {
        assert_eq!(object_span("x {\"a\": {\"b\": 1}} y"), Some("{\"a\": {\"b\": 1}}"));
        assert_eq!(object_span("no braces"), None);
    }
}
