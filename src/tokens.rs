// Token data model for the admin API, plus the small pure helpers the
// token jobs share: naming, quota conversion and key normalisation.

use serde::{Deserialize, Deserializer, Serialize};
use serde_json::Value;
use std::collections::HashMap;

/// The admin API stores quota in millionths of a currency unit.
pub const QUOTA_UNIT: f64 = 1_000_000.0;

/// A token record as returned by list/search endpoints. Unknown fields
/// are ignored and `null` strings become empty.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Token {
    #[serde(default, deserialize_with = "null_as_default")]
    pub id: i64,
    #[serde(default, deserialize_with = "null_as_default")]
    pub name: String,
    #[serde(default, deserialize_with = "null_as_default")]
    pub key: String,
    #[serde(default, deserialize_with = "null_as_default")]
    pub remain_quota: i64,
    #[serde(default, deserialize_with = "null_as_default")]
    pub used_quota: i64,
    #[serde(default = "never_expires")]
    pub expired_time: i64,
    #[serde(default, deserialize_with = "null_as_default")]
    pub unlimited_quota: bool,
    #[serde(default, deserialize_with = "null_as_default")]
    pub model_limits_enabled: bool,
    #[serde(default, deserialize_with = "null_as_default")]
    pub model_limits: String,
    #[serde(default, deserialize_with = "null_as_default")]
    pub group: String,
    #[serde(default = "default_mj_mode", deserialize_with = "null_as_default")]
    pub mj_image_mode: String,
    #[serde(default, deserialize_with = "null_as_default")]
    pub mj_custom_proxy: String,
    #[serde(default, deserialize_with = "null_as_default")]
    pub selected_groups: Vec<Value>,
    #[serde(default, deserialize_with = "null_as_default")]
    pub allow_ips: String,
}

fn null_as_default<'de, D, T>(deserializer: D) -> Result<T, D::Error>
where
    D: Deserializer<'de>,
    T: Default + Deserialize<'de>,
{
    Ok(Option::<T>::deserialize(deserializer)?.unwrap_or_default())
}

fn never_expires() -> i64 {
    -1
}

fn default_mj_mode() -> String {
    "default".into()
}

impl Token {
    /// Match by exact name, or by key with or without the `sk-` prefix.
    pub fn matches(&self, name: Option<&str>, key: &str) -> bool {
        if name.is_some_and(|n| self.name == n) {
            return true;
        }
        !self.key.is_empty() && normalize_key(&self.key) == normalize_key(key)
    }

    pub fn balance(&self) -> Balance {
        Balance {
            remaining: self.remain_quota as f64 / QUOTA_UNIT,
            used: self.used_quota as f64 / QUOTA_UNIT,
        }
    }
}

/// Remaining and used quota in currency units.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Balance {
    pub remaining: f64,
    pub used: f64,
}

/// Body of the create (POST) and update (PUT) calls.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TokenPayload {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub id: Option<i64>,
    pub name: String,
    pub remain_quota: i64,
    pub expired_time: i64,
    pub unlimited_quota: bool,
    pub model_limits_enabled: bool,
    pub model_limits: String,
    pub group: String,
    pub mj_image_mode: String,
    pub mj_custom_proxy: String,
    pub selected_groups: Vec<Value>,
    pub allow_ips: String,
}

impl TokenPayload {
    /// A fresh, never-expiring token with a fixed quota.
    pub fn create(name: impl Into<String>, quota: f64, group: impl Into<String>) -> Self {
        Self {
            id: None,
            name: name.into(),
            remain_quota: quota_to_units(quota),
            expired_time: -1,
            unlimited_quota: false,
            model_limits_enabled: false,
            model_limits: String::new(),
            group: group.into(),
            mj_image_mode: default_mj_mode(),
            mj_custom_proxy: String::new(),
            selected_groups: Vec::new(),
            allow_ips: String::new(),
        }
    }

    /// The full existing record with only `group` replaced; the update
    /// endpoint overwrites every field it receives.
    pub fn with_group(token: &Token, group: impl Into<String>) -> Self {
        Self {
            id: Some(token.id),
            name: token.name.clone(),
            remain_quota: token.remain_quota,
            expired_time: token.expired_time,
            unlimited_quota: token.unlimited_quota,
            model_limits_enabled: token.model_limits_enabled,
            model_limits: token.model_limits.clone(),
            group: group.into(),
            mj_image_mode: token.mj_image_mode.clone(),
            mj_custom_proxy: token.mj_custom_proxy.clone(),
            selected_groups: token.selected_groups.clone(),
            allow_ips: token.allow_ips.clone(),
        }
    }
}

/// `data` of a list response: either a bare array or `{ items: [...] }`.
#[derive(Debug, Deserialize)]
#[serde(untagged)]
pub enum TokenList {
    Plain(Vec<Token>),
    Paged {
        #[serde(default)]
        items: Vec<Token>,
    },
}

impl TokenList {
    pub fn into_items(self) -> Vec<Token> {
        match self {
            TokenList::Plain(items) | TokenList::Paged { items } => items,
        }
    }
}

/// Rounds to the nearest unit so that e.g. 0.57 maps to 570000.
pub fn quota_to_units(quota: f64) -> i64 {
    (quota * QUOTA_UNIT).round() as i64
}

/// `{date}_{count}_{quota}rmb_{n+1}`, with the quota's `.` replaced by `_`.
pub fn token_name(date: &str, count: usize, quota: f64, n: usize) -> String {
    let quota_label = format!("{quota:?}").replace('.', "_");
    format!("{date}_{count}_{quota_label}rmb_{}", n + 1)
}

pub fn normalize_key(key: &str) -> &str {
    let key = key.trim();
    key.strip_prefix("sk-").unwrap_or(key)
}

/// First ten and last four characters, for log lines.
pub fn short_key(key: &str) -> String {
    let chars: Vec<char> = key.chars().collect();
    if chars.len() <= 14 {
        return key.to_string();
    }
    let head: String = chars[..10].iter().collect();
    let tail: String = chars[chars.len() - 4..].iter().collect();
    format!("{head}...{tail}")
}

/// Normalised key -> token id, built from full server listings.
#[derive(Debug, Default, Clone)]
pub struct KeyIndex {
    ids: HashMap<String, i64>,
}

impl KeyIndex {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn extend<'a>(&mut self, tokens: impl IntoIterator<Item = &'a Token>) {
        for token in tokens {
            if token.key.is_empty() || token.id == 0 {
                continue;
            }
            self.ids.insert(normalize_key(&token.key).to_string(), token.id);
        }
    }

    pub fn get(&self, key: &str) -> Option<i64> {
        self.ids.get(normalize_key(key)).copied()
    }

    pub fn len(&self) -> usize {
        self.ids.len()
    }

    pub fn is_empty(&self) -> bool {
        self.ids.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn names_follow_date_count_quota_index() {
        assert_eq!(token_name("20251217", 400, 1.75, 0), "20251217_400_1_75rmb_1");
        assert_eq!(token_name("20251217", 5, 2.0, 4), "20251217_5_2_0rmb_5");
    }

    #[test]
    fn quota_conversion_rounds() {
        assert_eq!(quota_to_units(1.75), 1_750_000);
        assert_eq!(quota_to_units(0.57), 570_000);
        assert_eq!(quota_to_units(0.0), 0);
    }

    #[test]
    fn create_payload_shape() {
        let body = serde_json::to_value(TokenPayload::create("t1", 1.75, "vip,default")).unwrap();
        assert_eq!(
            body,
            json!({
                "name": "t1",
                "remain_quota": 1750000,
                "expired_time": -1,
                "unlimited_quota": false,
                "model_limits_enabled": false,
                "model_limits": "",
                "group": "vip,default",
                "mj_image_mode": "default",
                "mj_custom_proxy": "",
                "selected_groups": [],
                "allow_ips": ""
            })
        );
    }

    #[test]
    fn token_tolerates_nulls_and_missing_fields() {
        let token: Token = serde_json::from_value(json!({
            "id": 7,
            "name": "alpha",
            "key": "abc123",
            "remain_quota": 500000,
            "allow_ips": null,
            "selected_groups": null,
            "mj_image_mode": null,
            "status": 1
        }))
        .unwrap();
        assert_eq!(token.allow_ips, "");
        assert!(token.selected_groups.is_empty());
        assert_eq!(token.expired_time, -1);
        assert_eq!(token.balance().remaining, 0.5);
    }

    #[test]
    fn null_id_does_not_sink_the_page() {
        let list: TokenList = serde_json::from_value(json!([
            { "id": null, "key": "orphan" },
            { "id": 4, "key": "sk-kept" }
        ]))
        .unwrap();
        let items = list.into_items();
        assert_eq!(items[0].id, 0);

        let mut index = KeyIndex::new();
        index.extend(&items);
        assert_eq!(index.len(), 1);
        assert_eq!(index.get("kept"), Some(4));
    }

    #[test]
    fn update_payload_keeps_fields_and_swaps_group() {
        let token = Token {
            id: 9,
            name: "n".into(),
            remain_quota: 10,
            group: "old".into(),
            allow_ips: "1.2.3.4".into(),
            ..Default::default()
        };
        let payload = TokenPayload::with_group(&token, "new");
        assert_eq!(payload.id, Some(9));
        assert_eq!(payload.group, "new");
        assert_eq!(payload.allow_ips, "1.2.3.4");
        assert_eq!(payload.remain_quota, 10);
    }

    #[test]
    fn list_accepts_both_shapes() {
        let plain: TokenList = serde_json::from_value(json!([{ "id": 1, "key": "a" }])).unwrap();
        assert_eq!(plain.into_items().len(), 1);
        let paged: TokenList =
            serde_json::from_value(json!({ "items": [{ "id": 1 }, { "id": 2 }], "total": 2 }))
                .unwrap();
        assert_eq!(paged.into_items().len(), 2);
        let empty: TokenList = serde_json::from_value(json!({ "total": 0 })).unwrap();
        assert!(empty.into_items().is_empty());
    }

    #[test]
    fn key_index_ignores_prefix() {
        let tokens = vec![
            Token { id: 1, key: "abc".into(), ..Default::default() },
            Token { id: 2, key: "sk-def".into(), ..Default::default() },
            Token { id: 0, key: "orphan".into(), ..Default::default() },
        ];
        let mut index = KeyIndex::new();
        index.extend(&tokens);
        assert_eq!(index.len(), 2);
        assert_eq!(index.get("sk-abc"), Some(1));
        assert_eq!(index.get("def"), Some(2));
        assert_eq!(index.get("orphan"), None);
    }

    #[test]
    fn matching_by_name_or_key() {
        let token = Token { name: "batch_1".into(), key: "xyz".into(), ..Default::default() };
        assert!(token.matches(Some("batch_1"), "sk-other"));
        assert!(token.matches(None, "sk-xyz"));
        assert!(!token.matches(Some("batch_2"), "sk-nope"));
    }

    #[test]
    fn short_key_keeps_head_and_tail() {
        assert_eq!(short_key("sk-0123456789abcdef"), "sk-0123456...cdef");
        assert_eq!(short_key("sk-short"), "sk-short");
    }
}
