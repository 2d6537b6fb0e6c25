//! Kiro credential file and token refresh.

use std::path::Path;

use chrono::{DateTime, Duration as ChronoDuration, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};

use crate::error::RelayError;
use crate::provider::credentials::load_credential_file;
use crate::transport::error_chain_message;

/// Tokens are refreshed when they expire within this window.
const EXPIRY_SKEW_MINUTES: i64 = 5;

const REQUIRED_FIELDS: &[&str] = &["refreshToken"];
const OPTIONAL_FIELDS: &[&str] = &[
    "accessToken",
    "profileArn",
    "expiresAt",
    "authMethod",
    "region",
    "clientId",
    "clientSecret",
];

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AuthMethod {
    Social,
    IdC,
}

/// On-disk credential. Fields this crate does not read are kept in `extra`
/// and written back unchanged.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct KiroCredential {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub access_token: Option<String>,
    pub refresh_token: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub profile_arn: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub expires_at: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub auth_method: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub region: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub client_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub client_secret: Option<String>,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl KiroCredential {
    #[must_use]
    pub fn auth_method(&self) -> AuthMethod {
        match self.auth_method.as_deref() {
            Some(method) if method.eq_ignore_ascii_case("idc") => AuthMethod::IdC,
            _ => AuthMethod::Social,
        }
    }

    /// Missing token, unparseable expiry and near expiry all count.
    #[must_use]
    pub fn needs_refresh(&self, now: DateTime<Utc>) -> bool {
        if self.access_token.as_deref().map_or(true, str::is_empty) {
            return true;
        }
        let Some(expires_at) = self.expires_at.as_deref() else {
            return false;
        };
        match DateTime::parse_from_rfc3339(expires_at) {
            Ok(at) => at.with_timezone(&Utc) - now < ChronoDuration::minutes(EXPIRY_SKEW_MINUTES),
            Err(_) => true,
        }
    }
}

/// # Errors
///
/// [`RelayError::NoCredentials`] when the file is missing or unrecoverable.
pub async fn load(path: &Path) -> Result<KiroCredential, RelayError> {
    load_credential_file(path, REQUIRED_FIELDS, OPTIONAL_FIELDS).await
}

/// Persist refreshed tokens. Failures are logged, the in-memory copy stays valid.
pub async fn write_back(path: &Path, credential: &KiroCredential) {
    let text = match serde_json::to_string_pretty(credential) {
        Ok(text) => text,
        Err(err) => {
            tracing::warn!(path = %path.display(), error = %err, "cannot serialize refreshed credential");
            return;
        }
    };
    if let Err(err) = tokio::fs::write(path, text).await {
        tracing::warn!(path = %path.display(), error = %err, "cannot write refreshed credential back");
    }
}

/// Token endpoint for `method`. `base_override` replaces the AWS host, for
/// tests and private deployments.
#[must_use]
pub fn refresh_url(method: AuthMethod, region: &str, base_override: Option<&str>) -> String {
    match (method, base_override) {
        (AuthMethod::Social, Some(base)) => format!("{base}/refreshToken"),
        (AuthMethod::IdC, Some(base)) => format!("{base}/token"),
        (AuthMethod::Social, None) => {
            format!("https://prod.{region}.auth.desktop.kiro.dev/refreshToken")
        }
        (AuthMethod::IdC, None) => format!("https://oidc.{region}.amazonaws.com/token"),
    }
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct RefreshResponse {
    access_token: String,
    #[serde(default)]
    refresh_token: Option<String>,
    #[serde(default)]
    profile_arn: Option<String>,
    #[serde(default)]
    expires_in: Option<i64>,
}

/// Exchange the refresh token for a new access token.
///
/// # Errors
///
/// [`RelayError::Auth`] when the endpoint rejects the refresh token,
/// [`RelayError::Transport`] when it cannot be reached.
pub async fn refresh(
    client: &reqwest::Client,
    credential: &KiroCredential,
    region: &str,
    base_override: Option<&str>,
) -> Result<KiroCredential, RelayError> {
    let method = credential.auth_method();
    let body = match method {
        AuthMethod::Social => json!({"refreshToken": credential.refresh_token}),
        AuthMethod::IdC => json!({
            "refreshToken": credential.refresh_token,
            "clientId": credential.client_id,
            "clientSecret": credential.client_secret,
            "grantType": "refresh_token",
        }),
    };
    let response = client
        .post(refresh_url(method, region, base_override))
        .json(&body)
        .send()
        .await
        .map_err(|err| RelayError::Transport(error_chain_message(&err)))?;
    let status = response.status();
    if !status.is_success() {
        let text = response.text().await.unwrap_or_default();
        return Err(RelayError::Auth(format!("token refresh rejected ({status}): {text}")));
    }
    let refreshed: RefreshResponse = response
        .json()
        .await
        .map_err(|err| RelayError::Auth(format!("token refresh returned an unreadable body: {err}")))?;

    let mut next = credential.clone();
    next.access_token = Some(refreshed.access_token);
    if let Some(token) = refreshed.refresh_token {
        next.refresh_token = token;
    }
    if refreshed.profile_arn.is_some() {
        next.profile_arn = refreshed.profile_arn;
    }
    next.expires_at = refreshed
        .expires_in
        .map(|secs| (Utc::now() + ChronoDuration::seconds(secs)).to_rfc3339());
    Ok(next)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn credential(access: Option<&str>, expires_at: Option<String>) -> KiroCredential {
        KiroCredential {
            access_token: access.map(str::to_owned),
            refresh_token: "rt".into(),
            expires_at,
            ..KiroCredential::default()
        }
    }

    #[test]
    fn refresh_window() {
        let now = Utc::now();
        assert!(credential(None, None).needs_refresh(now));
        assert!(!credential(Some("at"), None).needs_refresh(now));
        assert!(credential(Some("at"), Some((now + ChronoDuration::minutes(2)).to_rfc3339())).needs_refresh(now));
        assert!(!credential(Some("at"), Some((now + ChronoDuration::hours(1)).to_rfc3339())).needs_refresh(now));
        assert!(credential(Some("at"), Some("soon".into())).needs_refresh(now));
    }

    #[tokio::test]
    async fn write_back_keeps_unknown_fields() {
        let path = std::env::temp_dir().join(format!("kiro-cred-{}.json", uuid::Uuid::new_v4().simple()));
        let original = json!({
            "accessToken": "old",
            "refreshToken": "rt",
            "provider": "Github",
            "scopes": ["codewhisperer:completions"],
        });
        tokio::fs::write(&path, original.to_string()).await.unwrap();

        let mut credential = load(&path).await.unwrap();
        assert_eq!(credential.extra["provider"], "Github");
        credential.access_token = Some("new".into());
        write_back(&path, &credential).await;

        let text = tokio::fs::read_to_string(&path).await.unwrap();
        let written: Value = serde_json::from_str(&text).unwrap();
        assert_eq!(written["accessToken"], "new");
        assert_eq!(written["refreshToken"], "rt");
        assert_eq!(written["provider"], "Github");
        assert_eq!(written["scopes"], json!(["codewhisperer:completions"]));
        let _ = tokio::fs::remove_file(&path).await;
    }

    #[test]
    fn endpoints_follow_auth_method() {
        assert_eq!(
            refresh_url(AuthMethod::Social, "us-east-1", None),
            "https://prod.us-east-1.auth.desktop.kiro.dev/refreshToken"
        );
        assert_eq!(
            refresh_url(AuthMethod::IdC, "eu-west-1", None),
            "https://oidc.eu-west-1.amazonaws.com/token"
        );
        assert_eq!(
            refresh_url(AuthMethod::IdC, "x", Some("http://127.0.0.1:9")),
            "http://127.0.0.1:9/token"
        );
        let idc = KiroCredential {
            auth_method: Some("IdC".into()),
            ..KiroCredential::default()
        };
        assert_eq!(idc.auth_method(), AuthMethod::IdC);
    }
}
