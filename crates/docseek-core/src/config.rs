//! Service configuration.
//!
//! Loaded from `config.toml` in the data directory, with built-in defaults
//! for anything the file leaves out. A few environment variables override
//! the file so deployments can keep secrets out of it.

use std::path::Path;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

use docseek_auth_bridge::OAuthConfig;
use docseek_graph::GraphConfig;

use crate::intent::IntentConfig;
use crate::knowledge::KnowledgeEntry;

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct DocseekConfig {
    /// Addresses allowed to manage the knowledge base.
    pub hr_admin_emails: Vec<String>,
    pub graph: GraphConfig,
    pub auth: AuthSection,
    pub chat: ChatConfig,
    pub intent: IntentConfig,
    pub knowledge: Vec<KnowledgeEntry>,
}

#[derive(Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AuthSection {
    pub client_id: String,
    pub client_secret: String,
    pub authority: String,
    pub redirect_uri: Option<String>,
    pub scopes: Vec<String>,
}

impl Default for AuthSection {
    fn default() -> Self {
        Self {
            client_id: String::new(),
            client_secret: String::new(),
            authority: "https://login.microsoftonline.com/common".to_string(),
            redirect_uri: None,
            scopes: ["User.Read", "Files.Read.All", "Sites.Read.All", "Mail.Send", "offline_access"]
                .iter()
                .map(|s| s.to_string())
                .collect(),
        }
    }
}

impl std::fmt::Debug for AuthSection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AuthSection")
            .field("client_id", &self.client_id)
            .field("client_secret", &"[REDACTED]")
            .field("authority", &self.authority)
            .field("redirect_uri", &self.redirect_uri)
            .field("scopes", &self.scopes)
            .finish()
    }
}

impl AuthSection {
    pub fn oauth_config(&self) -> OAuthConfig {
        OAuthConfig {
            client_id: self.client_id.clone(),
            client_secret: self.client_secret.clone(),
            authority: self.authority.clone(),
            redirect_uri: self.redirect_uri.clone(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ChatConfig {
    /// Transcript messages older than this are pruned.
    pub retention_days: i64,
    pub greeting: String,
}

impl Default for ChatConfig {
    fn default() -> Self {
        Self {
            retention_days: 3,
            greeting: "Hi there! 👋 What file are you looking for today?".to_string(),
        }
    }
}

impl DocseekConfig {
    /// Read `path` (defaults when it does not exist), then apply environment
    /// overrides.
    pub fn load(path: &Path) -> Result<Self> {
        let mut config = if path.exists() {
            let contents = std::fs::read_to_string(path)
                .with_context(|| format!("Failed to read config file: {}", path.display()))?;
            toml::from_str(&contents)
                .with_context(|| format!("Failed to parse config file: {}", path.display()))?
        } else {
            Self::default()
        };
        config.apply_env(|key| std::env::var(key).ok());
        Ok(config)
    }

    pub fn apply_env<F>(&mut self, lookup: F)
    where
        F: Fn(&str) -> Option<String>,
    {
        let non_empty = |key: &str| lookup(key).filter(|v| !v.trim().is_empty());

        if let Some(v) = non_empty("CLIENT_ID") {
            self.auth.client_id = v;
        }
        if let Some(v) = non_empty("CLIENT_SECRET") {
            self.auth.client_secret = v;
        }
        if let Some(v) = non_empty("AUTHORITY") {
            self.auth.authority = v;
        }
        if let Some(v) = non_empty("REDIRECT_URI") {
            self.auth.redirect_uri = Some(v);
        }
        if let Some(v) = non_empty("SCOPE") {
            self.auth.scopes = v.split_whitespace().map(str::to_string).collect();
        }
        if let Some(v) = non_empty("HR_ADMIN_EMAILS") {
            self.hr_admin_emails = v
                .split(',')
                .map(str::trim)
                .filter(|e| !e.is_empty())
                .map(str::to_string)
                .collect();
        }
    }

    pub fn is_hr_admin(&self, email: &str) -> bool {
        !email.is_empty()
            && self
                .hr_admin_emails
                .iter()
                .any(|allowed| allowed.trim().eq_ignore_ascii_case(email))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    #[test]
    fn test_missing_file_gives_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let config = DocseekConfig::load(&dir.path().join("config.toml")).unwrap();
        assert_eq!(config.graph.base_url, "https://graph.microsoft.com/v1.0");
        assert_eq!(config.graph.top_k, 5);
        assert_eq!(config.chat.retention_days, 3);
        assert!(config.knowledge.is_empty());
    }

    #[test]
    fn test_partial_file_keeps_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.toml");
        std::fs::write(
            &path,
            r#"
hr_admin_emails = ["hr@contoso.com"]

[graph]
max_retries = 4

[chat]
retention_days = 7

[[knowledge]]
keywords = ["leave", "policy"]
answer = "Annual leave is 25 days."
"#,
        )
        .unwrap();

        let config = DocseekConfig::load(&path).unwrap();
        assert_eq!(config.graph.max_retries, 4);
        assert_eq!(config.graph.default_retry_after_secs, 5);
        assert_eq!(config.chat.retention_days, 7);
        assert_eq!(config.knowledge.len(), 1);
        assert_eq!(config.knowledge[0].keywords, vec!["leave", "policy"]);
    }

    #[test]
    fn test_bad_toml_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.toml");
        std::fs::write(&path, "[graph\nmax_retries = ").unwrap();
        assert!(DocseekConfig::load(&path).is_err());
    }

    #[test]
    fn test_env_overrides() {
        let env: HashMap<&str, &str> = HashMap::from([
            ("CLIENT_ID", "app-id"),
            ("SCOPE", "User.Read  Mail.Send"),
            ("REDIRECT_URI", "http://localhost:5000/getAToken"),
            ("HR_ADMIN_EMAILS", " HR@contoso.com , ,boss@contoso.com"),
            ("CLIENT_SECRET", "  "),
        ]);
        let mut config = DocseekConfig::default();
        config.apply_env(|key| env.get(key).map(|v| v.to_string()));

        assert_eq!(config.auth.client_id, "app-id");
        assert_eq!(config.auth.client_secret, "");
        assert_eq!(config.auth.scopes, vec!["User.Read", "Mail.Send"]);
        assert_eq!(
            config.auth.redirect_uri.as_deref(),
            Some("http://localhost:5000/getAToken")
        );
        assert!(config.is_hr_admin("hr@contoso.com"));
        assert!(config.is_hr_admin("Boss@Contoso.com"));
        assert!(!config.is_hr_admin("ada@contoso.com"));
        assert!(!config.is_hr_admin(""));
    }

    #[test]
    fn test_debug_hides_client_secret() {
        let mut config = DocseekConfig::default();
        config.auth.client_secret = "hunter2".to_string();
        assert!(!format!("{:?}", config).contains("hunter2"));
    }
}
