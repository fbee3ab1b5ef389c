//! Canonical Codex credential blob.
//!
//! Two on-disk representations exist: the keychain value (normally already in
//! the canonical `codexAiOauth` shape) and `~/.codex/auth.json` with a `tokens`
//! sub-object. Both go through [`normalize_credentials`] before anything else
//! looks at them. JWT payloads are decoded for display metadata only; nothing
//! here verifies a signature or makes a trust decision from a claim.

use crate::error::{SyncError, SyncResult};
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine;
use chrono::{DateTime, SecondsFormat, Utc};
use serde::{Deserialize, Deserializer, Serialize};
use serde_json::{Map, Value};
use sha2::{Digest, Sha256};

pub const OAUTH_KEY: &str = "codexAiOauth";
const OPENAI_AUTH_CLAIM: &str = "https://api.openai.com/auth";
const OPENAI_PROFILE_CLAIM: &str = "https://api.openai.com/profile";
const UNKNOWN_PLAN: &str = "unknown";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OauthRecord {
    pub access_token: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub refresh_token: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id_token: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub account_id: Option<String>,
    #[serde(default = "unknown_plan")]
    pub subscription_type: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub scopes: Option<Vec<String>>,
    #[serde(
        default,
        skip_serializing_if = "Option::is_none",
        deserialize_with = "deserialize_epoch_seconds"
    )]
    pub expires_at: Option<i64>,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CanonicalBlob {
    #[serde(rename = "codexAiOauth")]
    pub oauth: OauthRecord,
    #[serde(rename = "lastRefresh", default, skip_serializing_if = "Option::is_none")]
    pub last_refresh: Option<String>,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl CanonicalBlob {
    /// Parses a blob already in canonical shape. Partial or malformed blobs
    /// yield `None`; absence of metadata is not an error.
    pub fn parse(blob: &str) -> Option<Self> {
        let parsed = serde_json::from_str::<Self>(blob.trim()).ok()?;
        if parsed.oauth.access_token.trim().is_empty() {
            return None;
        }
        Some(parsed)
    }

    pub fn from_auth_file(root: &Value) -> Option<Self> {
        let tokens = root.get("tokens")?;
        let access_token = get_path_string(tokens, &["access_token"])?;
        let refresh_token = get_path_string(tokens, &["refresh_token"]);
        let id_token = get_path_string(tokens, &["id_token"]);

        let access_claims = decode_jwt_payload(&access_token);
        let id_claims = id_token.as_deref().and_then(decode_jwt_payload);

        let expires_at = access_claims
            .as_ref()
            .and_then(|claims| claims.get("exp"))
            .and_then(epoch_seconds_from_value);
        let scopes = access_claims
            .as_ref()
            .map(scopes_from_claims)
            .filter(|scopes| !scopes.is_empty());
        let account_id = get_path_string(tokens, &["account_id"]).or_else(|| {
            access_claims
                .as_ref()
                .and_then(|claims| get_path_string(claims, &[OPENAI_AUTH_CLAIM, "chatgpt_account_id"]))
        });
        let subscription_type = [access_claims.as_ref(), id_claims.as_ref()]
            .into_iter()
            .flatten()
            .find_map(|claims| get_path_string(claims, &[OPENAI_AUTH_CLAIM, "chatgpt_plan_type"]))
            .or_else(|| get_path_string(root, &["auth_mode"]))
            .unwrap_or_else(unknown_plan);

        Some(Self {
            oauth: OauthRecord {
                access_token,
                refresh_token,
                id_token,
                account_id,
                subscription_type,
                scopes,
                expires_at,
                extra: Map::new(),
            },
            last_refresh: get_path_string(root, &["last_refresh"]),
            extra: Map::new(),
        })
    }

    /// Renders this blob in the `auth.json` layout, keeping any top-level keys
    /// and unknown token keys of `existing`.
    pub fn to_auth_file(&self, existing: Option<&Value>) -> Value {
        let mut root = existing
            .and_then(Value::as_object)
            .cloned()
            .unwrap_or_default();
        let mut tokens = root
            .get("tokens")
            .and_then(Value::as_object)
            .cloned()
            .unwrap_or_default();

        tokens.insert(
            "access_token".to_string(),
            Value::String(self.oauth.access_token.clone()),
        );
        for (key, value) in [
            ("refresh_token", &self.oauth.refresh_token),
            ("id_token", &self.oauth.id_token),
            ("account_id", &self.oauth.account_id),
        ] {
            match value {
                Some(value) => {
                    tokens.insert(key.to_string(), Value::String(value.clone()));
                }
                None => {
                    tokens.remove(key);
                }
            }
        }

        root.insert("tokens".to_string(), Value::Object(tokens));
        root.entry("auth_mode".to_string())
            .or_insert_with(|| Value::String("chatgpt".to_string()));
        let last_refresh = self
            .last_refresh
            .clone()
            .unwrap_or_else(|| Utc::now().to_rfc3339_opts(SecondsFormat::Millis, true));
        root.insert("last_refresh".to_string(), Value::String(last_refresh));
        Value::Object(root)
    }

    pub fn to_json(&self) -> SyncResult<String> {
        serde_json::to_string(self).map_err(|source| SyncError::Encode {
            what: "credential blob",
            source,
        })
    }

    pub fn email(&self) -> Option<String> {
        let direct_paths: [&[&str]; 3] = [&["email"], &["account", "email"], &["profile", "email"]];
        for path in direct_paths {
            let found = get_path_string_in_map(&self.oauth.extra, path)
                .or_else(|| get_path_string_in_map(&self.extra, path))
                .and_then(|value| normalize_email(&value));
            if found.is_some() {
                return found;
            }
        }

        [self.oauth.id_token.as_deref(), Some(self.oauth.access_token.as_str())]
            .into_iter()
            .flatten()
            .filter_map(decode_jwt_payload)
            .find_map(|claims| {
                get_path_string(&claims, &["email"])
                    .or_else(|| get_path_string(&claims, &[OPENAI_PROFILE_CLAIM, "email"]))
                    .and_then(|value| normalize_email(&value))
            })
    }

    pub fn account_id(&self) -> Option<String> {
        self.oauth
            .account_id
            .as_deref()
            .map(str::trim)
            .filter(|value| !value.is_empty())
            .map(str::to_string)
            .or_else(|| {
                decode_jwt_payload(&self.oauth.access_token)
                    .and_then(|claims| get_path_string(&claims, &[OPENAI_AUTH_CLAIM, "chatgpt_account_id"]))
            })
    }

    pub fn expires_at(&self) -> Option<DateTime<Utc>> {
        let seconds = self.oauth.expires_at.or_else(|| {
            decode_jwt_payload(&self.oauth.access_token)
                .and_then(|claims| claims.get("exp").and_then(epoch_seconds_from_value))
        })?;
        DateTime::<Utc>::from_timestamp(seconds, 0)
    }

    pub fn scopes(&self) -> Vec<String> {
        if let Some(scopes) = self.oauth.scopes.as_ref() {
            return scopes.clone();
        }
        decode_jwt_payload(&self.oauth.access_token)
            .map(|claims| scopes_from_claims(&claims))
            .unwrap_or_default()
    }

    /// Has an access token and is not past its expiry (unknown expiry counts
    /// as usable).
    pub fn is_usable_at(&self, now: DateTime<Utc>) -> bool {
        match self.expires_at() {
            Some(expires_at) => expires_at > now,
            None => true,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AccountSummary {
    pub email: Option<String>,
    pub plan_label: String,
    pub plan: String,
    pub scopes: Vec<String>,
    pub account_id: Option<String>,
}

impl AccountSummary {
    pub fn from_blob(blob: &str) -> Option<Self> {
        let parsed = CanonicalBlob::parse(blob)?;
        Some(Self {
            email: parsed.email(),
            plan_label: plan_label(&parsed.oauth.subscription_type),
            plan: parsed.oauth.subscription_type.clone(),
            scopes: parsed.scopes(),
            account_id: parsed.account_id(),
        })
    }
}

pub fn normalize_credentials(raw: &str) -> SyncResult<String> {
    let root: Value = serde_json::from_str(raw.trim())
        .map_err(|err| SyncError::MalformedJson(err.to_string()))?;

    let blob = if root.get(OAUTH_KEY).is_some() {
        let parsed = serde_json::from_value::<CanonicalBlob>(root)
            .map_err(|err| SyncError::MalformedJson(err.to_string()))?;
        if parsed.oauth.access_token.trim().is_empty() {
            return Err(SyncError::MalformedJson(
                "codexAiOauth.accessToken is empty".to_string(),
            ));
        }
        parsed
    } else if root.get("tokens").is_some() {
        CanonicalBlob::from_auth_file(&root).ok_or_else(|| {
            SyncError::MalformedJson("auth file tokens carry no access_token".to_string())
        })?
    } else {
        return Err(SyncError::MalformedJson(
            "credential has neither codexAiOauth nor tokens".to_string(),
        ));
    };

    blob.to_json()
}

pub fn extract_access_token(blob: &str) -> Option<String> {
    CanonicalBlob::parse(blob).map(|parsed| parsed.oauth.access_token)
}

pub fn token_expiry(blob: &str) -> Option<DateTime<Utc>> {
    CanonicalBlob::parse(blob)?.expires_at()
}

pub fn plan_label(raw: &str) -> String {
    let lowered = raw.trim().to_lowercase();
    let label = match lowered.as_str() {
        "free" => "Free",
        "plus" => "Plus",
        "pro" => "Pro",
        "team" => "Team",
        "business" => "Business",
        "enterprise" => "Enterprise",
        "edu" => "Edu",
        "" => "Unknown",
        _ => "",
    };
    if !label.is_empty() {
        return label.to_string();
    }

    let mut chars = lowered.chars();
    match chars.next() {
        Some(first) => first.to_uppercase().chain(chars).collect(),
        None => "Unknown".to_string(),
    }
}

/// Decodes the payload segment of a JWT. Missing base64 padding is tolerated;
/// anything malformed yields `None`.
pub fn decode_jwt_payload(token: &str) -> Option<Value> {
    let mut parts = token.split('.');
    let _header = parts.next()?;
    let payload = parts.next()?;
    if payload.is_empty() {
        return None;
    }

    let payload_data = URL_SAFE_NO_PAD
        .decode(payload.trim_end_matches('=').as_bytes())
        .ok()?;
    let claims = serde_json::from_slice::<Value>(&payload_data).ok()?;
    claims.is_object().then_some(claims)
}

pub fn normalize_email(value: &str) -> Option<String> {
    let trimmed = value.trim().to_lowercase();
    if trimmed.is_empty() || !trimmed.contains('@') {
        None
    } else {
        Some(trimmed)
    }
}

pub fn short_hash_hex(data: &[u8]) -> String {
    let digest = Sha256::digest(data);
    hex::encode(digest)[..16].to_string()
}

pub fn token_fingerprint(token: Option<&str>) -> Option<String> {
    let raw = token?.trim();
    if raw.is_empty() {
        return None;
    }
    Some(short_hash_hex(raw.as_bytes()))
}

fn unknown_plan() -> String {
    UNKNOWN_PLAN.to_string()
}

fn scopes_from_claims(claims: &Value) -> Vec<String> {
    claims
        .get("scp")
        .or_else(|| claims.get("scope"))
        .map(normalize_scope_value)
        .unwrap_or_default()
}

fn deserialize_epoch_seconds<'de, D>(deserializer: D) -> Result<Option<i64>, D::Error>
where
    D: Deserializer<'de>,
{
    let value = Option::<Value>::deserialize(deserializer)?;
    Ok(value.as_ref().and_then(epoch_seconds_from_value))
}

/// Accepts epoch seconds, epoch milliseconds, numeric strings and RFC 3339.
fn epoch_seconds_from_value(value: &Value) -> Option<i64> {
    let timestamp = match value {
        Value::Number(number) => number.as_f64()?,
        Value::String(raw) => match raw.trim().parse::<f64>() {
            Ok(number) => number,
            Err(_) => {
                return DateTime::parse_from_rfc3339(raw.trim())
                    .ok()
                    .map(|date| date.timestamp())
            }
        },
        _ => return None,
    };
    if !timestamp.is_finite() || timestamp <= 0.0 {
        return None;
    }
    if timestamp > 1_000_000_000_000.0 {
        Some((timestamp / 1000.0).round() as i64)
    } else {
        Some(timestamp.round() as i64)
    }
}

fn get_path_value<'a>(root: &'a Value, path: &[&str]) -> Option<&'a Value> {
    let mut current = root;
    for segment in path {
        current = current.get(*segment)?;
    }
    Some(current)
}

fn get_path_string(root: &Value, path: &[&str]) -> Option<String> {
    value_as_string(get_path_value(root, path))
}

fn get_path_string_in_map(map: &Map<String, Value>, path: &[&str]) -> Option<String> {
    let (first, rest) = path.split_first()?;
    let head = map.get(*first)?;
    if rest.is_empty() {
        return value_as_string(Some(head));
    }
    get_path_string(head, rest)
}

fn value_as_string(value: Option<&Value>) -> Option<String> {
    match value {
        Some(Value::String(raw)) => {
            let trimmed = raw.trim();
            if trimmed.is_empty() {
                None
            } else {
                Some(trimmed.to_string())
            }
        }
        _ => None,
    }
}

fn normalize_scope_value(value: &Value) -> Vec<String> {
    match value {
        Value::Array(list) => list
            .iter()
            .filter_map(|item| value_as_string(Some(item)))
            .collect(),
        Value::String(raw) => raw
            .split(' ')
            .map(str::trim)
            .filter(|item| !item.is_empty())
            .map(str::to_string)
            .collect(),
        _ => Vec::new(),
    }
}

#[cfg(test)]
pub(crate) mod test_support {
    use base64::engine::general_purpose::URL_SAFE_NO_PAD;
    use base64::Engine;
    use serde_json::{json, Value};

    pub fn jwt(claims: Value) -> String {
        let header = URL_SAFE_NO_PAD.encode(br#"{"alg":"none"}"#);
        let payload = URL_SAFE_NO_PAD.encode(claims.to_string().as_bytes());
        format!("{}.{}.sig", header, payload)
    }

    pub fn canonical_blob(
        access_token: &str,
        account_id: Option<&str>,
        email: Option<&str>,
        expires_at: Option<i64>,
    ) -> String {
        let mut oauth = json!({
            "accessToken": access_token,
            "refreshToken": format!("rt-{}", access_token),
            "subscriptionType": "plus",
        });
        if let Some(account_id) = account_id {
            oauth["accountId"] = json!(account_id);
        }
        if let Some(email) = email {
            oauth["email"] = json!(email);
        }
        if let Some(expires_at) = expires_at {
            oauth["expiresAt"] = json!(expires_at);
        }
        json!({ "codexAiOauth": oauth }).to_string()
    }

    pub fn auth_file_json(access_token: &str, account_id: Option<&str>) -> String {
        let mut tokens = json!({
            "access_token": access_token,
            "refresh_token": "rt-file",
            "id_token": jwt(json!({ "email": "File@Example.com" })),
        });
        if let Some(account_id) = account_id {
            tokens["account_id"] = json!(account_id);
        }
        json!({
            "OPENAI_API_KEY": null,
            "auth_mode": "chatgpt",
            "tokens": tokens,
            "last_refresh": "2026-10-01T00:00:00.000Z",
        })
        .to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::test_support::{auth_file_json, canonical_blob, jwt};
    use super::*;
    use base64::engine::general_purpose::URL_SAFE;
    use serde_json::json;

    #[test]
    fn normalizes_auth_file_and_derives_jwt_metadata() {
        let access_token = jwt(json!({
            "exp": 1_900_000_000i64,
            "scp": ["openid", "profile", "offline_access"],
            "https://api.openai.com/auth": {
                "chatgpt_plan_type": "pro",
                "chatgpt_account_id": "acct-from-claim"
            }
        }));
        let raw = auth_file_json(&access_token, Some("acct-file"));

        let canonical = normalize_credentials(&raw).expect("normalize");
        let parsed = CanonicalBlob::parse(&canonical).expect("canonical parse");
        assert_eq!(parsed.oauth.access_token, access_token);
        assert_eq!(parsed.oauth.refresh_token.as_deref(), Some("rt-file"));
        assert_eq!(parsed.oauth.account_id.as_deref(), Some("acct-file"));
        assert_eq!(parsed.oauth.subscription_type, "pro");
        assert_eq!(parsed.oauth.expires_at, Some(1_900_000_000));
        assert_eq!(
            parsed.oauth.scopes,
            Some(vec![
                "openid".to_string(),
                "profile".to_string(),
                "offline_access".to_string()
            ])
        );
        assert_eq!(parsed.last_refresh.as_deref(), Some("2026-10-01T00:00:00.000Z"));
        assert_eq!(parsed.email().as_deref(), Some("file@example.com"));
    }

    #[test]
    fn normalization_preserves_access_token_for_opaque_tokens() {
        for token in ["plain-opaque-token", "a.b", "x.not-base64!.y"] {
            let raw = auth_file_json(token, None);
            let canonical = normalize_credentials(&raw).expect("normalize");
            assert_eq!(extract_access_token(&canonical).as_deref(), Some(token));
        }
    }

    #[test]
    fn malformed_jwt_payload_leaves_optional_fields_absent() {
        let raw = auth_file_json("header.%%%%.sig", None);
        let canonical = normalize_credentials(&raw).expect("normalize");
        let parsed = CanonicalBlob::parse(&canonical).expect("parse");
        assert_eq!(parsed.oauth.expires_at, None);
        assert_eq!(parsed.oauth.scopes, None);
        assert_eq!(parsed.oauth.subscription_type, "chatgpt");
    }

    #[test]
    fn jwt_payload_decoding_tolerates_padding() {
        let payload = URL_SAFE.encode(br#"{"email":"pad@example.com","exp":1900000000}"#);
        let token = format!("h.{}.s", payload);
        let claims = decode_jwt_payload(&token).expect("claims");
        assert_eq!(claims["email"], "pad@example.com");
        assert!(decode_jwt_payload("no-dots").is_none());
        assert!(decode_jwt_payload("h..s").is_none());
    }

    #[test]
    fn canonical_input_keeps_unknown_fields() {
        let raw = json!({
            "codexAiOauth": {
                "accessToken": "at-1",
                "subscriptionType": "team",
                "email": "Someone@Example.com",
                "rateLimitTier": "tier-4"
            },
            "lastRefresh": "2026-10-01T00:00:00Z",
            "custom": true
        })
        .to_string();

        let canonical = normalize_credentials(&raw).expect("normalize");
        let value: Value = serde_json::from_str(&canonical).expect("json");
        assert_eq!(value["codexAiOauth"]["rateLimitTier"], "tier-4");
        assert_eq!(value["custom"], true);
        assert!(!canonical.contains('\n'));

        let summary = AccountSummary::from_blob(&canonical).expect("summary");
        assert_eq!(summary.email.as_deref(), Some("someone@example.com"));
        assert_eq!(summary.plan_label, "Team");
        assert_eq!(summary.plan, "team");
    }

    #[test]
    fn expires_at_accepts_milliseconds() {
        let raw = json!({
            "codexAiOauth": {
                "accessToken": "at-ms",
                "subscriptionType": "plus",
                "expiresAt": 1_900_000_000_000i64
            }
        })
        .to_string();
        let expiry = token_expiry(&raw).expect("expiry");
        assert_eq!(expiry.timestamp(), 1_900_000_000);
    }

    #[test]
    fn normalize_rejects_shapes_without_oauth_record() {
        assert!(matches!(
            normalize_credentials("not json"),
            Err(SyncError::MalformedJson(_))
        ));
        assert!(matches!(
            normalize_credentials(r#"{"hello":"world"}"#),
            Err(SyncError::MalformedJson(_))
        ));
        assert!(matches!(
            normalize_credentials(r#"{"tokens":{"refresh_token":"rt"}}"#),
            Err(SyncError::MalformedJson(_))
        ));
    }

    #[test]
    fn summary_is_absent_for_partial_blobs() {
        assert!(AccountSummary::from_blob("{}").is_none());
        assert!(AccountSummary::from_blob(r#"{"codexAiOauth":{}}"#).is_none());
        assert!(AccountSummary::from_blob("garbage").is_none());
    }

    #[test]
    fn summary_recovers_email_and_account_from_access_token() {
        let access_token = jwt(json!({
            "https://api.openai.com/profile": { "email": "Claims@Example.com" },
            "https://api.openai.com/auth": { "chatgpt_account_id": "acct-claim" }
        }));
        let blob = canonical_blob(&access_token, None, None, None);
        let summary = AccountSummary::from_blob(&blob).expect("summary");
        assert_eq!(summary.email.as_deref(), Some("claims@example.com"));
        assert_eq!(summary.account_id.as_deref(), Some("acct-claim"));
        assert_eq!(summary.plan_label, "Plus");
    }

    #[test]
    fn plan_labels_cover_known_and_unknown_plans() {
        assert_eq!(plan_label("plus"), "Plus");
        assert_eq!(plan_label("PRO"), "Pro");
        assert_eq!(plan_label("enterprise"), "Enterprise");
        assert_eq!(plan_label("chatgpt"), "Chatgpt");
        assert_eq!(plan_label("steam"), "Steam");
        assert_eq!(plan_label("professional"), "Professional");
        assert_eq!(plan_label("  "), "Unknown");
    }

    #[test]
    fn auth_file_rendering_keeps_other_keys() {
        let existing: Value = serde_json::from_str(&auth_file_json("at-old", Some("acct-old")))
            .expect("existing");
        let blob = CanonicalBlob::parse(&canonical_blob("at-new", None, None, None)).expect("blob");

        let rendered = blob.to_auth_file(Some(&existing));
        assert_eq!(rendered["tokens"]["access_token"], "at-new");
        assert_eq!(rendered["tokens"]["refresh_token"], "rt-at-new");
        assert!(rendered["tokens"].get("account_id").is_none());
        assert!(rendered["tokens"].get("id_token").is_none());
        assert_eq!(rendered["auth_mode"], "chatgpt");
        assert!(rendered.get("OPENAI_API_KEY").is_some());

        let round_trip = normalize_credentials(&rendered.to_string()).expect("normalize");
        assert_eq!(extract_access_token(&round_trip).as_deref(), Some("at-new"));
    }

    #[test]
    fn usable_respects_expiry() {
        let now = Utc::now();
        let future = canonical_blob("at", None, None, Some(now.timestamp() + 3600));
        let past = canonical_blob("at", None, None, Some(now.timestamp() - 3600));
        let unknown = canonical_blob("at", None, None, None);
        assert!(CanonicalBlob::parse(&future).expect("future").is_usable_at(now));
        assert!(!CanonicalBlob::parse(&past).expect("past").is_usable_at(now));
        assert!(CanonicalBlob::parse(&unknown).expect("unknown").is_usable_at(now));
    }
}
