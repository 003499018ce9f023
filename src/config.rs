use crate::bridge::BridgeTimeouts;
use crate::error::{BridgeError, Result};
use crate::model::{Agent, Capability};
use crate::session::SessionSettings;
use secrecy::SecretString;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

#[derive(Debug, Default, Deserialize, Clone, Serialize)]
#[serde(default)]
pub struct AppConfig {
    pub identity: IdentityConfig,
    pub credentials: CredentialsConfig,
    pub atproto: AtprotoConfig,
    pub agora: AgoraConfig,
    pub timeouts: TimeoutsConfig,
    pub server: ServerConfig,
    pub logging: LoggingConfig,
}

#[derive(Debug, Deserialize, Clone, Serialize)]
#[serde(default)]
pub struct IdentityConfig {
    pub domain: String,
    pub agents: Vec<String>,
    pub output_dir: PathBuf,
}

/// Where the AT Protocol app password comes from: `env:NAME` or a file path.
#[derive(Debug, Deserialize, Clone, Serialize)]
#[serde(default)]
pub struct CredentialsConfig {
    pub source: String,
}

#[derive(Debug, Deserialize, Clone, Serialize)]
#[serde(default)]
pub struct AtprotoConfig {
    pub service_url: String,
    pub handle: Option<String>,
    pub refresh_margin_seconds: u64,
    pub default_token_lifetime_seconds: u64,
}

#[derive(Debug, Deserialize, Clone, Serialize)]
#[serde(default)]
pub struct AgoraConfig {
    pub endpoint: String,
    pub did: String,
    pub description: String,
    pub capabilities: Vec<Capability>,
}

#[derive(Debug, Deserialize, Clone, Serialize)]
#[serde(default)]
pub struct TimeoutsConfig {
    pub negotiation_ms: u64,
    pub transport_ms: u64,
    pub auth_ms: u64,
}

#[derive(Debug, Deserialize, Clone, Serialize)]
#[serde(default)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
}

#[derive(Debug, Deserialize, Clone, Serialize)]
#[serde(default)]
pub struct LoggingConfig {
    pub level: String,
    pub format: Option<String>,
}

impl Default for IdentityConfig {
    fn default() -> Self {
        Self {
            domain: "example.com".to_string(),
            agents: vec!["assistant".to_string()],
            output_dir: PathBuf::from("generated_dids"),
        }
    }
}

impl Default for CredentialsConfig {
    fn default() -> Self {
        Self {
            source: "env:ATPROTO_APP_PASSWORD".to_string(),
        }
    }
}

impl Default for AtprotoConfig {
    fn default() -> Self {
        Self {
            service_url: "https://bsky.social".to_string(),
            handle: None,
            refresh_margin_seconds: 60,
            default_token_lifetime_seconds: 7200,
        }
    }
}

impl Default for AgoraConfig {
    fn default() -> Self {
        Self {
            endpoint: "http://localhost:8080".to_string(),
            did: "did:web:assistant.example.com".to_string(),
            description: "Agora agent bridged to the AT Protocol".to_string(),
            capabilities: vec![Capability::ReadPublic, Capability::WritePosts],
        }
    }
}

impl Default for TimeoutsConfig {
    fn default() -> Self {
        Self {
            negotiation_ms: 30_000,
            transport_ms: 15_000,
            auth_ms: 10_000,
        }
    }
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".to_string(),
            port: 8000,
        }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            format: None,
        }
    }
}

impl LoggingConfig {
    /// Install the global `tracing` subscriber. `RUST_LOG` wins over `level`.
    pub fn init(&self) {
        let filter = tracing_subscriber::EnvFilter::try_from_default_env()
            .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(&self.level));
        let builder = tracing_subscriber::fmt().with_env_filter(filter);

        // A subscriber may already be installed, e.g. by a test harness.
        let _ = match self.format.as_deref() {
            Some("json") => builder.json().try_init(),
            _ => builder.try_init(),
        };
    }
}

impl IdentityConfig {
    /// Overlay command-line choices on the configured identity settings.
    pub fn merged(
        mut self,
        domain: Option<String>,
        agents: Vec<String>,
        output_dir: Option<PathBuf>,
    ) -> Self {
        if let Some(domain) = domain {
            self.domain = domain;
        }
        if !agents.is_empty() {
            self.agents = agents;
        }
        if let Some(output_dir) = output_dir {
            self.output_dir = output_dir;
        }
        self
    }

    /// `(agent, domain)` pairs for the identity publisher.
    pub fn agent_pairs(&self) -> Result<Vec<(String, String)>> {
        if self.agents.is_empty() {
            return Err(BridgeError::Config("No agents to generate identities for".to_string()));
        }
        Ok(self
            .agents
            .iter()
            .map(|agent| (agent.clone(), self.domain.clone()))
            .collect())
    }
}

impl CredentialsConfig {
    pub fn resolve(&self) -> Result<SecretString> {
        let secret = match self.source.strip_prefix("env:") {
            Some(var) => std::env::var(var).map_err(|_| {
                BridgeError::Config(format!("credential variable {var} is not set"))
            })?,
            None => std::fs::read_to_string(&self.source).map_err(|e| {
                BridgeError::Config(format!("Failed to read credential file {}: {}", self.source, e))
            })?,
        };

        let secret = secret.trim();
        if secret.is_empty() {
            return Err(BridgeError::Config(format!(
                "credential from {} is empty",
                self.source
            )));
        }
        Ok(SecretString::from(secret.to_string()))
    }
}

impl AppConfig {
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let config_str = std::fs::read_to_string(path)
            .map_err(|e| BridgeError::Config(format!("Failed to read config file: {}", e)))?;

        let config: AppConfig = toml::from_str(&config_str)
            .map_err(|e| BridgeError::Config(format!("Failed to parse config file: {}", e)))?;

        Ok(config)
    }

    pub fn load_with_env_overrides<P: AsRef<Path>>(path: P) -> Result<Self> {
        let mut config = Self::load(path)?;
        config.apply_overrides(|name| std::env::var(name).ok());
        Ok(config)
    }

    pub fn apply_overrides(&mut self, lookup: impl Fn(&str) -> Option<String>) {
        if let Some(domain) = lookup("AGORA_AT_DOMAIN") {
            self.identity.domain = domain;
        }

        if let Some(url) = lookup("ATPROTO_SERVICE_URL") {
            self.atproto.service_url = url;
        }

        if let Some(handle) = lookup("ATPROTO_HANDLE") {
            self.atproto.handle = Some(handle);
        }

        if let Some(endpoint) = lookup("AGORA_ENDPOINT") {
            self.agora.endpoint = endpoint;
        }

        if let Some(log_level) = lookup("RUST_LOG") {
            self.logging.level = log_level;
        }
    }

    pub fn validate(&self) -> Result<()> {
        if self.server.port == 0 {
            return Err(BridgeError::Config("Server port cannot be 0".to_string()));
        }

        crate::did::validate_hostname(&self.identity.domain)
            .map_err(|e| BridgeError::Config(format!("identity.domain: {}", e)))?;
        for agent in &self.identity.agents {
            crate::did::handle_for(agent, &self.identity.domain)
                .map_err(|e| BridgeError::Config(format!("identity.agents: {}", e)))?;
        }

        if self.atproto.service_url.is_empty() {
            return Err(BridgeError::Config("AT Protocol service URL cannot be empty".to_string()));
        }

        if self.agora.endpoint.is_empty() {
            return Err(BridgeError::Config("Agora endpoint cannot be empty".to_string()));
        }

        crate::did::WebDid::parse(&self.agora.did)
            .map_err(|e| BridgeError::Config(format!("agora.did: {}", e)))?;

        let timeouts = &self.timeouts;
        if timeouts.negotiation_ms == 0 || timeouts.transport_ms == 0 || timeouts.auth_ms == 0 {
            return Err(BridgeError::Config("Timeouts must be positive".to_string()));
        }

        if self.atproto.refresh_margin_seconds >= self.atproto.default_token_lifetime_seconds {
            return Err(BridgeError::Config(
                "Refresh margin must be shorter than the token lifetime".to_string(),
            ));
        }

        Ok(())
    }

    pub fn get_server_address(&self) -> String {
        format!("{}:{}", self.server.host, self.server.port)
    }

    /// Identity the bridge acts as.
    pub fn agent(&self) -> Agent {
        let agent = Agent::new(
            self.agora.did.clone(),
            self.agora.endpoint.clone(),
            self.agora.description.clone(),
            self.agora.capabilities.iter().copied(),
        );
        match &self.atproto.handle {
            Some(handle) => agent.with_handle(handle.clone()),
            None => agent,
        }
    }

    pub fn bridge_timeouts(&self) -> BridgeTimeouts {
        BridgeTimeouts {
            negotiation: Duration::from_millis(self.timeouts.negotiation_ms),
            transport: Duration::from_millis(self.timeouts.transport_ms),
            auth: Duration::from_millis(self.timeouts.auth_ms),
        }
    }

    pub fn session_settings(&self) -> SessionSettings {
        SessionSettings {
            auth_timeout: Duration::from_millis(self.timeouts.auth_ms),
            refresh_margin: chrono::Duration::seconds(self.atproto.refresh_margin_seconds as i64),
            default_token_lifetime: chrono::Duration::seconds(
                self.atproto.default_token_lifetime_seconds as i64,
            ),
        }
    }
}

pub fn create_default_config_file<P: AsRef<Path>>(path: P) -> Result<()> {
    let default_config = AppConfig::default();
    let toml_str = toml::to_string_pretty(&default_config)
        .map_err(|e| BridgeError::Config(format!("Failed to serialize default config: {}", e)))?;

    std::fs::write(path, toml_str)
        .map_err(|e| BridgeError::Config(format!("Failed to write default config file: {}", e)))?;

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use secrecy::ExposeSecret;
    use std::collections::HashMap;
    use tempfile::NamedTempFile;

    #[test]
    fn test_default_config() {
        let config = AppConfig::default();
        assert_eq!(config.server.port, 8000);
        assert_eq!(config.atproto.service_url, "https://bsky.social");
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_config_validation() {
        let mut config = AppConfig::default();
        config.server.port = 0;
        assert!(config.validate().is_err());

        let mut config = AppConfig::default();
        config.identity.domain = "not a domain".to_string();
        assert!(matches!(config.validate(), Err(BridgeError::Config(_))));

        let mut config = AppConfig::default();
        config.timeouts.auth_ms = 0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_partial_file_uses_defaults() {
        let config: AppConfig = toml::from_str(
            r#"
            [agora]
            endpoint = "https://agent.example.test"
            capabilities = ["read:public"]

            [timeouts]
            negotiation_ms = 500
            "#,
        )
        .unwrap();

        assert_eq!(config.agora.endpoint, "https://agent.example.test");
        assert_eq!(config.timeouts.negotiation_ms, 500);
        assert_eq!(config.timeouts.transport_ms, 15_000);
        assert!(!config.agent().has_capability(Capability::WritePosts));
    }

    #[test]
    fn test_identity_section_feeds_generation() {
        let config: AppConfig = toml::from_str(
            r#"
            [identity]
            domain = "agents.example.test"
            agents = ["alice", "bob"]
            output_dir = "staging"
            "#,
        )
        .unwrap();
        assert!(config.validate().is_ok());

        let identity = config.identity.clone();
        assert_eq!(identity.output_dir, PathBuf::from("staging"));
        assert_eq!(
            identity.agent_pairs().unwrap(),
            vec![
                ("alice".to_string(), "agents.example.test".to_string()),
                ("bob".to_string(), "agents.example.test".to_string()),
            ]
        );

        let merged = config
            .identity
            .merged(None, vec!["carol".to_string()], Some(PathBuf::from("out")));
        assert_eq!(merged.domain, "agents.example.test");
        assert_eq!(merged.agents, vec!["carol".to_string()]);
        assert_eq!(merged.output_dir, PathBuf::from("out"));
    }

    #[test]
    fn test_identity_agents_validated() {
        let mut config = AppConfig::default();
        config.identity.agents = vec!["not valid!".to_string()];
        assert!(matches!(config.validate(), Err(BridgeError::Config(_))));

        config.identity.agents.clear();
        assert!(matches!(
            config.identity.agent_pairs(),
            Err(BridgeError::Config(_))
        ));
    }

    #[test]
    fn test_unknown_capability_rejected() {
        let parsed = toml::from_str::<AppConfig>(
            r#"
            [agora]
            capabilities = ["root:access"]
            "#,
        );
        assert!(parsed.is_err());
    }

    #[test]
    fn test_env_overrides() {
        let env: HashMap<&str, &str> = [
            ("ATPROTO_HANDLE", "alice.example.test"),
            ("AGORA_ENDPOINT", "http://agora.internal"),
        ]
        .into_iter()
        .collect();

        let mut config = AppConfig::default();
        config.apply_overrides(|name| env.get(name).map(|v| v.to_string()));

        assert_eq!(config.atproto.handle.as_deref(), Some("alice.example.test"));
        assert_eq!(config.agora.endpoint, "http://agora.internal");
        assert_eq!(config.agent().handle.as_deref(), Some("alice.example.test"));
        assert_eq!(config.logging.level, "info");
    }

    #[test]
    fn test_credential_from_file() {
        let file = NamedTempFile::new().unwrap();
        std::fs::write(file.path(), "app-password\n").unwrap();

        let credentials = CredentialsConfig {
            source: file.path().display().to_string(),
        };
        assert_eq!(credentials.resolve().unwrap().expose_secret(), "app-password");

        let missing = CredentialsConfig {
            source: "env:AGORA_AT_TEST_UNSET_VARIABLE".to_string(),
        };
        assert!(matches!(missing.resolve(), Err(BridgeError::Config(_))));
    }

    #[tokio::test]
    async fn test_config_file_creation() {
        let temp_file = NamedTempFile::new().unwrap();
        let path = temp_file.path();

        create_default_config_file(path).unwrap();
        assert!(path.exists());

        let loaded_config = AppConfig::load(path).unwrap();
        assert_eq!(loaded_config.server.port, 8000);
        assert_eq!(loaded_config.agora.capabilities.len(), 2);
    }
}
