/// Integration seams for third-party actions
///
/// The dispatcher never talks to a SaaS API itself. It validates config,
/// resolves and decrypts a credential, then hands off to a `Connector`
/// registered under an `"<app>.<action>"` key.

use anyhow::Result;
use async_trait::async_trait;
use serde_json::Value;
use std::{collections::HashMap, fmt, sync::Arc};

/// Plain key/value credential material after decryption
pub type CredentialPayload = HashMap<String, String>;

/// Static description of one integration action
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ActionSpec {
    /// Connector key, `"<app>.<action>"`
    pub key: &'static str,
    /// Provider a credential must be issued for
    pub provider: &'static str,
    /// Config fields that must be present and non-empty
    pub required: &'static [&'static str],
}

/// Every integration action the dispatcher knows how to validate
pub const ACTIONS: &[ActionSpec] = &[
    ActionSpec { key: "gmail.sendEmail", provider: "google", required: &["to", "subject"] },
    ActionSpec { key: "gsheets.appendRow", provider: "google", required: &["spreadsheetId", "values"] },
    ActionSpec { key: "github.createIssue", provider: "github", required: &["owner", "repo", "title"] },
    ActionSpec { key: "slack.sendMessage", provider: "slack", required: &["channel", "text"] },
    ActionSpec { key: "notion.createPage", provider: "notion", required: &["parentId", "title"] },
    ActionSpec { key: "bannerbear.createImage", provider: "bannerbear", required: &["templateId"] },
    ActionSpec { key: "openai.chat", provider: "openai", required: &["prompt"] },
    ActionSpec { key: "gemini.chat", provider: "gemini", required: &["prompt"] },
];

/// Look up an action by connector key
pub fn action_spec(key: &str) -> Option<&'static ActionSpec> {
    ACTIONS.iter().find(|spec| spec.key == key)
}

/// Decrypts stored credential payloads
#[async_trait]
pub trait Decryptor: Send + Sync {
    async fn decrypt(&self, encrypted_payload: &str) -> Result<CredentialPayload>;
}

/// Development decryptor: the payload is a JSON object stored in the clear
///
/// Non-string values are rendered as JSON text so numeric ids survive.
#[derive(Debug, Default, Clone, Copy)]
pub struct JsonPayloadDecryptor;

#[async_trait]
impl Decryptor for JsonPayloadDecryptor {
    async fn decrypt(&self, encrypted_payload: &str) -> Result<CredentialPayload> {
        let parsed: Value = serde_json::from_str(encrypted_payload)
            .map_err(|e| anyhow::anyhow!("Credential payload is not valid JSON: {}", e))?;
        let Value::Object(map) = parsed else {
            return Err(anyhow::anyhow!("Credential payload must be a JSON object"));
        };
        Ok(map
            .into_iter()
            .map(|(key, value)| {
                let text = match value {
                    Value::String(s) => s,
                    other => other.to_string(),
                };
                (key, text)
            })
            .collect())
    }
}

/// What a connector returns for one call
#[derive(Debug, Clone, PartialEq)]
pub struct ConnectorResponse {
    /// HTTP-like status; anything outside 2xx fails the node
    pub status: u16,
    pub data: Value,
    pub log: String,
}

impl ConnectorResponse {
    pub fn ok(data: Value) -> Self {
        Self {
            status: 200,
            data,
            log: String::new(),
        }
    }

    pub fn is_success(&self) -> bool {
        (200..300).contains(&self.status)
    }
}

/// One concrete third-party action
#[async_trait]
pub trait Connector: Send + Sync {
    async fn execute(&self, config: &Value, credentials: &CredentialPayload) -> Result<ConnectorResponse>;
}

/// Connectors keyed by `"<app>.<action>"`
#[derive(Clone, Default)]
pub struct ConnectorRegistry {
    connectors: HashMap<String, Arc<dyn Connector>>,
}

impl ConnectorRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, key: impl Into<String>, connector: Arc<dyn Connector>) {
        let key = key.into();
        tracing::debug!("🔌 Registered connector: {}", key);
        self.connectors.insert(key, connector);
    }

    /// Builder-style `register`
    pub fn with(mut self, key: impl Into<String>, connector: Arc<dyn Connector>) -> Self {
        self.register(key, connector);
        self
    }

    pub fn get(&self, key: &str) -> Option<Arc<dyn Connector>> {
        self.connectors.get(key).cloned()
    }

    pub fn keys(&self) -> Vec<&str> {
        let mut keys: Vec<&str> = self.connectors.keys().map(String::as_str).collect();
        keys.sort_unstable();
        keys
    }
}

impl fmt::Debug for ConnectorRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConnectorRegistry")
            .field("connectors", &self.keys())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    struct Echo;

    #[async_trait]
    impl Connector for Echo {
        async fn execute(&self, config: &Value, _credentials: &CredentialPayload) -> Result<ConnectorResponse> {
            Ok(ConnectorResponse::ok(config.clone()))
        }
    }

    #[test]
    fn test_action_catalog_lookup() {
        let spec = action_spec("github.createIssue").unwrap();
        assert_eq!(spec.provider, "github");
        assert_eq!(spec.required, &["owner", "repo", "title"]);
        assert!(action_spec("github.deleteRepo").is_none());
    }

    #[tokio::test]
    async fn test_json_payload_decryptor() {
        let payload = JsonPayloadDecryptor
            .decrypt(r#"{"token": "abc", "account": 7}"#)
            .await
            .unwrap();
        assert_eq!(payload["token"], "abc");
        assert_eq!(payload["account"], "7");

        assert!(JsonPayloadDecryptor.decrypt("not json").await.is_err());
        assert!(JsonPayloadDecryptor.decrypt("[1]").await.is_err());
    }

    #[tokio::test]
    async fn test_registry_resolves_connectors() {
        let registry = ConnectorRegistry::new().with("slack.sendMessage", Arc::new(Echo));
        assert_eq!(registry.keys(), vec!["slack.sendMessage"]);

        let connector = registry.get("slack.sendMessage").unwrap();
        let response = connector
            .execute(&json!({"text": "hi"}), &CredentialPayload::new())
            .await
            .unwrap();
        assert!(response.is_success());
        assert_eq!(response.data, json!({"text": "hi"}));
        assert!(registry.get("notion.createPage").is_none());
    }
}
