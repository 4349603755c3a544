use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;

use helm_link::LinkConfig;
use helm_plan::{ChatCompletionsConfig, EngineConfig};
use helm_relay::RelayTarget;
use serde::{Deserialize, Serialize};

/// `helm.toml`. Every section is optional.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct HelmConfig {
    pub link: LinkSection,
    pub engine: EngineSection,
    pub collaborator: CollaboratorSection,
    pub server: ServerSection,
    #[serde(rename = "relay")]
    pub relays: Vec<RelayTarget>,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct LinkSection {
    pub url: String,
    pub role: String,
    pub reconnect_delay_ms: u64,
    pub dispatch_url: String,
    /// Unset means completions are awaited without a deadline.
    pub completion_timeout_ms: Option<u64>,
}

impl Default for LinkSection {
    fn default() -> Self {
        Self {
            url: "ws://127.0.0.1:3030/ws".to_string(),
            role: "orchestrator".to_string(),
            reconnect_delay_ms: 5_000,
            dispatch_url: "http://127.0.0.1:3030".to_string(),
            completion_timeout_ms: None,
        }
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct EngineSection {
    pub stop_on_failure: bool,
    pub shell_timeout_ms: u64,
    pub working_dir: Option<PathBuf>,
}

impl Default for EngineSection {
    fn default() -> Self {
        Self {
            stop_on_failure: false,
            shell_timeout_ms: 60_000,
            working_dir: None,
        }
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct CollaboratorSection {
    pub base_url: String,
    pub model: String,
    /// Name of the environment variable holding the API key.
    pub api_key_env: String,
    pub timeout_ms: u64,
}

impl Default for CollaboratorSection {
    fn default() -> Self {
        let defaults = ChatCompletionsConfig::default();
        Self {
            base_url: defaults.base_url,
            model: defaults.model,
            api_key_env: "OPENAI_API_KEY".to_string(),
            timeout_ms: defaults.timeout.as_millis() as u64,
        }
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct ServerSection {
    pub bind: String,
}

impl Default for ServerSection {
    fn default() -> Self {
        Self {
            bind: "127.0.0.1:8080".to_string(),
        }
    }
}

impl HelmConfig {
    pub fn from_toml(source: &str) -> Result<Self, String> {
        let config: Self = toml::from_str(source).map_err(|error| error.to_string())?;
        config.validate()?;
        Ok(config)
    }

    /// Reads `path` if given; otherwise the defaults.
    pub fn load(path: Option<&Path>) -> Result<Self, String> {
        let Some(path) = path else {
            return Ok(Self::default());
        };
        let source = std::fs::read_to_string(path)
            .map_err(|error| format!("failed reading config '{}': {error}", path.display()))?;
        Self::from_toml(&source)
            .map_err(|error| format!("invalid config '{}': {error}", path.display()))
    }

    pub fn validate(&self) -> Result<(), String> {
        if self.link.url.trim().is_empty() {
            return Err("link.url must not be empty".to_string());
        }
        if self.link.dispatch_url.trim().is_empty() {
            return Err("link.dispatch_url must not be empty".to_string());
        }
        if self.link.reconnect_delay_ms == 0 {
            return Err("link.reconnect_delay_ms must be positive".to_string());
        }
        if self.engine.shell_timeout_ms == 0 {
            return Err("engine.shell_timeout_ms must be positive".to_string());
        }
        self.bind_addr()?;
        let mut kinds = std::collections::BTreeSet::new();
        for relay in &self.relays {
            if relay.kind.trim().is_empty() {
                return Err("relay.kind must not be empty".to_string());
            }
            if !kinds.insert(relay.kind.as_str()) {
                return Err(format!("duplicate relay kind '{}'", relay.kind));
            }
        }
        Ok(())
    }

    pub fn bind_addr(&self) -> Result<SocketAddr, String> {
        self.server
            .bind
            .parse()
            .map_err(|error| format!("invalid server.bind '{}': {error}", self.server.bind))
    }

    pub fn link_config(&self) -> LinkConfig {
        LinkConfig {
            url: self.link.url.clone(),
            role: self.link.role.clone(),
            reconnect_delay: Duration::from_millis(self.link.reconnect_delay_ms),
            ..LinkConfig::default()
        }
    }

    pub fn completion_timeout(&self) -> Option<Duration> {
        self.link.completion_timeout_ms.map(Duration::from_millis)
    }

    pub fn engine_config(&self) -> EngineConfig {
        EngineConfig {
            stop_on_failure: self.engine.stop_on_failure,
        }
    }

    pub fn shell_timeout(&self) -> Duration {
        Duration::from_millis(self.engine.shell_timeout_ms)
    }

    /// The API key is read from the configured environment variable, if set.
    pub fn collaborator_config(&self) -> ChatCompletionsConfig {
        let api_key = std::env::var(&self.collaborator.api_key_env)
            .ok()
            .filter(|key| !key.trim().is_empty());
        ChatCompletionsConfig {
            base_url: self.collaborator.base_url.clone(),
            model: self.collaborator.model.clone(),
            api_key,
            timeout: Duration::from_millis(self.collaborator.timeout_ms),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn empty_source_yields_defaults() {
        let config = HelmConfig::from_toml("").expect("empty config should parse");
        assert_eq!(config, HelmConfig::default());
        assert_eq!(config.link_config().reconnect_delay, Duration::from_secs(5));
        assert_eq!(config.completion_timeout(), None);
        assert!(!config.engine_config().stop_on_failure);
    }

    #[test]
    fn full_config_parses_every_section() {
        let config = HelmConfig::from_toml(
            r#"
            [link]
            url = "ws://agent:9000/ws"
            role = "planner"
            reconnect_delay_ms = 250
            dispatch_url = "http://agent:9000"
            completion_timeout_ms = 90000

            [engine]
            stop_on_failure = true
            shell_timeout_ms = 5000
            working_dir = "/tmp"

            [collaborator]
            base_url = "http://localhost:11434/v1"
            model = "llama3"
            api_key_env = "HELM_TEST_UNSET_KEY"

            [server]
            bind = "0.0.0.0:9090"

            [[relay]]
            kind = "browser"
            host = "10.0.0.2"
            port = 5900

            [[relay]]
            kind = "desktop"
            host = "10.0.0.3"
            port = 5901
            password = "hunter2"
            "#,
        )
        .expect("config should parse");

        assert_eq!(config.link_config().role, "planner");
        assert_eq!(config.link_config().reconnect_delay, Duration::from_millis(250));
        assert_eq!(config.completion_timeout(), Some(Duration::from_secs(90)));
        assert!(config.engine_config().stop_on_failure);
        assert_eq!(config.shell_timeout(), Duration::from_secs(5));
        assert_eq!(config.bind_addr().expect("bind"), "0.0.0.0:9090".parse().expect("addr"));
        assert_eq!(config.relays.len(), 2);
        assert_eq!(config.relays[1].password.as_deref(), Some("hunter2"));
        let collaborator = config.collaborator_config();
        assert_eq!(collaborator.model, "llama3");
        assert_eq!(collaborator.api_key, None);
    }

    #[test]
    fn unknown_fields_and_duplicate_relays_are_rejected() {
        let error = HelmConfig::from_toml("[link]\nurl_typo = \"x\"\n").expect_err("unknown field");
        assert!(error.contains("url_typo"));

        let error = HelmConfig::from_toml(
            "[[relay]]\nkind = \"browser\"\nhost = \"a\"\nport = 1\n\
             [[relay]]\nkind = \"browser\"\nhost = \"b\"\nport = 2\n",
        )
        .expect_err("duplicate kind");
        assert_eq!(error, "duplicate relay kind 'browser'");

        let error = HelmConfig::from_toml("[server]\nbind = \"nowhere\"\n").expect_err("bad bind");
        assert!(error.starts_with("invalid server.bind"));
    }

    #[test]
    fn load_reads_file_and_reports_path_on_error() {
        let mut file = tempfile::NamedTempFile::new().expect("temp file");
        writeln!(file, "[engine]\nstop_on_failure = true").expect("write config");
        let config = HelmConfig::load(Some(file.path())).expect("load config");
        assert!(config.engine.stop_on_failure);

        let dir = tempfile::tempdir().expect("temp dir");
        let missing = dir.path().join("missing.toml");
        let error = HelmConfig::load(Some(&missing)).expect_err("missing file");
        assert!(error.starts_with("failed reading config"));

        assert_eq!(HelmConfig::load(None).expect("defaults"), HelmConfig::default());
    }
}
