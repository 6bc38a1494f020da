//! Structural search over untyped directory responses.
//!
//! The directory API reshapes its JSON between versions, so nothing here binds
//! to a schema: callers name the keys they accept and every value reachable
//! under one of those keys is collected, in document order.

use serde::Deserialize;
use serde_json::Value;

/// An object that carries its payload next to a discriminating tag,
/// e.g. `{"type": "replied_to", "id": "123"}` or
/// `{"cursorType": "Bottom", "value": "DAAB..."}`.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct TaggedField {
    pub tag_key: String,
    pub tag_value: String,
    pub value_key: String,
}

impl TaggedField {
    fn new(tag_key: &str, tag_value: &str, value_key: &str) -> Self {
        Self {
            tag_key: tag_key.to_string(),
            tag_value: tag_value.to_string(),
            value_key: value_key.to_string(),
        }
    }
}

/// Accepted key-name variants. New API revisions only need a new entry here.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct FieldVariants {
    /// Preferred stable-id keys, tried in order.
    pub stable_id_keys: Vec<String>,
    /// Generic id keys; only numeric values longer than five digits count.
    pub fallback_id_keys: Vec<String>,
    pub reply_to_keys: Vec<String>,
    pub reply_relations: Vec<TaggedField>,
    pub cursor_keys: Vec<String>,
    pub cursor_relations: Vec<TaggedField>,
    pub author_handle_keys: Vec<String>,
    pub author_id_keys: Vec<String>,
    /// Subtrees naming accounts other than the author: mentions, quoted and
    /// reposted posts. Author matching never descends into them.
    pub foreign_account_keys: Vec<String>,
}

impl Default for FieldVariants {
    fn default() -> Self {
        Self {
            stable_id_keys: strings(&["rest_id"]),
            fallback_id_keys: strings(&["id_str", "id"]),
            reply_to_keys: strings(&[
                "in_reply_to_status_id_str",
                "in_reply_to_status_id",
                "in_reply_to_tweet_id",
                "inReplyToStatusId",
                "in_reply_to_id",
            ]),
            reply_relations: vec![TaggedField::new("type", "replied_to", "id")],
            cursor_keys: strings(&[
                "next_cursor",
                "bottom_cursor",
                "cursor_bottom",
                "next_token",
                "bottom",
            ]),
            cursor_relations: vec![TaggedField::new("cursorType", "Bottom", "value")],
            author_handle_keys: strings(&["screen_name", "username", "userName", "author_handle"]),
            author_id_keys: strings(&["user_id_str", "author_id"]),
            foreign_account_keys: strings(&[
                "entities",
                "user_mentions",
                "mentions",
                "quoted_status",
                "quoted_status_result",
                "retweeted_status",
                "retweeted_status_result",
            ]),
        }
    }
}

fn strings(items: &[&str]) -> Vec<String> {
    items.iter().map(|s| s.to_string()).collect()
}

/// Every scalar reachable under any of `keys`, depth-first in document order.
pub fn collect_values(root: &Value, keys: &[String]) -> Vec<String> {
    collect_values_outside(root, keys, &[])
}

/// Like [`collect_values`], without descending into any object member named in `skip`.
pub fn collect_values_outside(root: &Value, keys: &[String], skip: &[String]) -> Vec<String> {
    let mut out = Vec::new();
    walk_keys(root, keys, skip, &mut out);
    out
}

/// First scalar reachable under any of `keys`.
pub fn first_value(root: &Value, keys: &[String]) -> Option<String> {
    collect_values(root, keys).into_iter().next()
}

fn walk_keys(node: &Value, keys: &[String], skip: &[String], out: &mut Vec<String>) {
    match node {
        Value::Array(items) => {
            for item in items {
                walk_keys(item, keys, skip, out);
            }
        }
        Value::Object(map) => {
            for (key, value) in map {
                if skip.iter().any(|k| k == key) {
                    continue;
                }
                if keys.iter().any(|k| k == key) {
                    if let Some(s) = scalar_string(value) {
                        out.push(s);
                    }
                }
                walk_keys(value, keys, skip, out);
            }
        }
        _ => {}
    }
}

/// Payloads of every object whose tag matches one of `fields`.
pub fn collect_tagged(root: &Value, fields: &[TaggedField]) -> Vec<String> {
    let mut out = Vec::new();
    walk_tagged(root, fields, &mut out);
    out
}

fn walk_tagged(node: &Value, fields: &[TaggedField], out: &mut Vec<String>) {
    match node {
        Value::Array(items) => {
            for item in items {
                walk_tagged(item, fields, out);
            }
        }
        Value::Object(map) => {
            for field in fields {
                let tagged = map
                    .get(&field.tag_key)
                    .and_then(Value::as_str)
                    .is_some_and(|t| t.eq_ignore_ascii_case(&field.tag_value));
                if tagged {
                    if let Some(s) = map.get(&field.value_key).and_then(scalar_string) {
                        out.push(s);
                    }
                }
            }
            for value in map.values() {
                walk_tagged(value, fields, out);
            }
        }
        _ => {}
    }
}

/// Strings and numbers only; empty strings, nulls and containers are skipped.
pub fn scalar_string(value: &Value) -> Option<String> {
    match value {
        Value::String(s) if !s.trim().is_empty() => Some(s.trim().to_string()),
        Value::Number(n) => Some(n.to_string()),
        _ => None,
    }
}

/// A generic `id` only counts as a stable id when it is all digits and longer than five.
pub fn is_plausible_stable_id(raw: &str) -> bool {
    raw.len() > 5 && raw.bytes().all(|b| b.is_ascii_digit())
}

/// Ids of the posts a reply page says were replied to: plain reply keys plus
/// `replied_to` relation objects.
pub fn reply_targets(root: &Value, fields: &FieldVariants) -> Vec<String> {
    let mut ids = collect_values(root, &fields.reply_to_keys);
    ids.extend(collect_tagged(root, &fields.reply_relations));
    ids
}

/// The next-page cursor, if the page carries one.
pub fn next_cursor(root: &Value, fields: &FieldVariants) -> Option<String> {
    first_value(root, &fields.cursor_keys)
        .or_else(|| collect_tagged(root, &fields.cursor_relations).into_iter().next())
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn collect_values_finds_nested_keys_in_document_order() {
        let doc = json!({
            "data": {"items": [
                {"legacy": {"in_reply_to_status_id_str": "111"}},
                {"tweet": {"in_reply_to_status_id": 222}},
                {"in_reply_to_status_id_str": null}
            ]}
        });
        let keys = FieldVariants::default().reply_to_keys;
        assert_eq!(collect_values(&doc, &keys), vec!["111", "222"]);
    }

    #[test]
    fn collect_tagged_reads_relation_objects() {
        let doc = json!({
            "includes": [{"referenced_tweets": [
                {"type": "quoted", "id": "1"},
                {"type": "replied_to", "id": "2"}
            ]}]
        });
        let fields = FieldVariants::default();
        assert_eq!(reply_targets(&doc, &fields), vec!["2"]);
    }

    #[test]
    fn next_cursor_prefers_named_key_then_tagged_entry() {
        let fields = FieldVariants::default();
        let named = json!({"cursor": {"bottom": "abc", "top": "zzz"}});
        assert_eq!(next_cursor(&named, &fields).as_deref(), Some("abc"));

        let tagged = json!({"entries": [
            {"content": {"cursorType": "Top", "value": "t"}},
            {"content": {"cursorType": "Bottom", "value": "b"}}
        ]});
        assert_eq!(next_cursor(&tagged, &fields).as_deref(), Some("b"));

        assert_eq!(next_cursor(&json!({"data": []}), &fields), None);
    }

    #[test]
    fn collect_values_outside_skips_foreign_subtrees() {
        let doc = json!({
            "author": {"screen_name": "writer"},
            "entities": {"user_mentions": [{"screen_name": "mentioned"}]},
            "quoted_status": {"user": {"screen_name": "quoted"}}
        });
        let fields = FieldVariants::default();
        assert_eq!(
            collect_values_outside(&doc, &fields.author_handle_keys, &fields.foreign_account_keys),
            vec!["writer"]
        );
        assert_eq!(collect_values(&doc, &fields.author_handle_keys).len(), 3);
    }

    #[test]
    fn plausible_stable_id_requires_long_digit_string() {
        assert!(is_plausible_stable_id("44196397"));
        assert!(!is_plausible_stable_id("12345"));
        assert!(!is_plausible_stable_id("VXNlcjo0NDE5NjM5Nw=="));
    }

    #[test]
    fn field_variants_deserialize_partial_override() {
        let parsed: FieldVariants =
            toml::from_str("reply_to_keys = [\"replyTo\"]").expect("valid toml");
        assert_eq!(parsed.reply_to_keys, vec!["replyTo"]);
        assert_eq!(parsed.stable_id_keys, vec!["rest_id"]);
    }
}
