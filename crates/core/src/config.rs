use std::collections::HashMap;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};
use crate::paths::Paths;

/// One configured connector. `type` selects the implementation and defaults
/// to `name`, so two instances of the same transport can coexist.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(rename_all = "kebab-case")]
pub struct ConnectorEntry {
    pub name: String,
    #[serde(rename = "type", default)]
    pub type_name: Option<String>,
    #[serde(default)]
    pub default: bool,
    #[serde(flatten)]
    pub extra: HashMap<String, serde_json::Value>,
}

impl ConnectorEntry {
    pub fn named(name: &str) -> Self {
        Self { name: name.to_string(), ..Default::default() }
    }

    pub fn implementation(&self) -> &str {
        self.type_name.as_deref().unwrap_or(&self.name)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(rename_all = "kebab-case")]
pub struct DatabaseEntry {
    pub name: String,
    #[serde(rename = "type", default)]
    pub type_name: Option<String>,
    #[serde(flatten)]
    pub extra: HashMap<String, serde_json::Value>,
}

impl DatabaseEntry {
    pub fn named(name: &str) -> Self {
        Self { name: name.to_string(), ..Default::default() }
    }

    pub fn implementation(&self) -> &str {
        self.type_name.as_deref().unwrap_or(&self.name)
    }
}

fn default_enabled() -> bool {
    true
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct ParserEntry {
    pub name: String,
    #[serde(rename = "type", default)]
    pub type_name: Option<String>,
    #[serde(default = "default_enabled")]
    pub enabled: bool,
    /// Candidates with confidence strictly below this are discarded.
    #[serde(default)]
    pub min_score: Option<f64>,
    /// Per-call deadline in seconds; falls back to the 10s default.
    #[serde(default)]
    pub timeout: Option<u64>,
    #[serde(flatten)]
    pub extra: HashMap<String, serde_json::Value>,
}

impl ParserEntry {
    pub fn named(name: &str) -> Self {
        Self {
            name: name.to_string(),
            type_name: None,
            enabled: true,
            min_score: None,
            timeout: None,
            extra: HashMap::new(),
        }
    }

    pub fn implementation(&self) -> &str {
        self.type_name.as_deref().unwrap_or(&self.name)
    }
}

/// One configured skill: either a built-in `module` compiled into the binary
/// or a scripted skill loaded from `path`.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(rename_all = "kebab-case")]
pub struct SkillEntry {
    pub name: String,
    #[serde(default)]
    pub path: Option<PathBuf>,
    #[serde(default)]
    pub module: Option<String>,
    #[serde(default)]
    pub config: serde_json::Value,
}

impl SkillEntry {
    pub fn module(name: &str, module: &str) -> Self {
        Self {
            name: name.to_string(),
            path: None,
            module: Some(module.to_string()),
            config: serde_json::Value::Null,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct SslConfig {
    pub cert: PathBuf,
    pub key: PathBuf,
}

fn default_web_host() -> String {
    "0.0.0.0".to_string()
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct WebConfig {
    #[serde(default = "default_web_host")]
    pub host: String,
    /// Defaults to 8080, or 8443 when ssl is configured.
    #[serde(default)]
    pub port: Option<u16>,
    #[serde(default)]
    pub ssl: Option<SslConfig>,
    #[serde(default)]
    pub webhook_token: Option<String>,
    #[serde(default)]
    pub disable_web_index_handler_in_root: bool,
}

impl Default for WebConfig {
    fn default() -> Self {
        Self {
            host: default_web_host(),
            port: None,
            ssl: None,
            webhook_token: None,
            disable_web_index_handler_in_root: false,
        }
    }
}

impl WebConfig {
    pub fn bind_port(&self) -> u16 {
        self.port.unwrap_or(if self.ssl.is_some() { 8443 } else { 8080 })
    }

    pub fn bind_addr(&self) -> String {
        format!("{}:{}", self.host, self.bind_port())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(rename_all = "kebab-case")]
pub struct LogFilter {
    #[serde(default)]
    pub whitelist: Vec<String>,
    #[serde(default)]
    pub blacklist: Vec<String>,
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_log_console() -> bool {
    true
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct LoggingConfig {
    #[serde(default)]
    pub path: Option<PathBuf>,
    /// One of debug, info, warning, error, critical.
    #[serde(default = "default_log_level")]
    pub level: String,
    #[serde(default = "default_log_console")]
    pub console: bool,
    /// Include file/line in log output.
    #[serde(default)]
    pub extended: bool,
    #[serde(default)]
    pub filter: LogFilter,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            path: None,
            level: default_log_level(),
            console: default_log_console(),
            extended: false,
            filter: LogFilter::default(),
        }
    }
}

fn default_timezone() -> String {
    "UTC".to_string()
}

fn default_welcome_message() -> bool {
    true
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct Config {
    #[serde(default)]
    pub connectors: Vec<ConnectorEntry>,
    #[serde(default)]
    pub databases: Vec<DatabaseEntry>,
    #[serde(default)]
    pub parsers: Vec<ParserEntry>,
    #[serde(default)]
    pub skills: Vec<SkillEntry>,
    #[serde(default)]
    pub web: WebConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
    /// Watch skill source paths and reload on change.
    #[serde(default)]
    pub autoreload: bool,
    /// IANA zone; default for crontab matchers. "local" resolves the host zone.
    #[serde(default = "default_timezone")]
    pub timezone: String,
    #[serde(default = "default_welcome_message")]
    pub welcome_message: bool,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            connectors: vec![ConnectorEntry { default: true, ..ConnectorEntry::named("shell") }],
            databases: vec![DatabaseEntry::named("memory")],
            parsers: Vec::new(),
            skills: vec![
                SkillEntry::module("hello", "hello"),
                SkillEntry::module("ping", "ping"),
            ],
            web: WebConfig::default(),
            logging: LoggingConfig::default(),
            autoreload: false,
            timezone: default_timezone(),
            welcome_message: default_welcome_message(),
        }
    }
}

impl Config {
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)?;
        let config: Config = serde_yaml::from_str(&content)?;
        config.validate()?;
        Ok(config)
    }

    pub fn load_or_default(paths: &Paths) -> Result<Self> {
        let config_path = paths.config_file();
        if config_path.exists() {
            Self::load(&config_path)
        } else {
            Ok(Self::default())
        }
    }

    pub fn save(&self, path: &Path) -> Result<()> {
        let content = serde_yaml::to_string(self)?;
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        std::fs::write(path, content)?;
        Ok(())
    }

    /// Structural checks that make a config loadable at all. A config that
    /// passes here can still fail at load time (bad script path, bad schema).
    pub fn validate(&self) -> Result<()> {
        if self.connectors.is_empty() {
            return Err(Error::Config("no connectors configured".to_string()));
        }
        if self.skills.is_empty() {
            return Err(Error::Config("no skills configured".to_string()));
        }
        for skill in &self.skills {
            if skill.path.is_none() && skill.module.is_none() {
                return Err(Error::Config(format!(
                    "skill {:?} needs either a path or a module",
                    skill.name
                )));
            }
        }
        let mut seen = std::collections::HashSet::new();
        for connector in &self.connectors {
            if !seen.insert(connector.name.as_str()) {
                return Err(Error::Config(format!(
                    "duplicate connector name {:?}",
                    connector.name
                )));
            }
        }
        self.tz()?;
        Ok(())
    }

    /// Resolve the configured timezone, mapping "local" to the host zone.
    pub fn tz(&self) -> Result<chrono_tz::Tz> {
        let name = if self.timezone.eq_ignore_ascii_case("local") {
            iana_time_zone::get_timezone()
                .map_err(|e| Error::Config(format!("cannot resolve local timezone: {}", e)))?
        } else {
            self.timezone.clone()
        };
        name.parse()
            .map_err(|_| Error::Config(format!("unknown timezone {:?}", name)))
    }

    /// The connector every unrouted outbound event falls back to: first
    /// declared default, else first registered.
    pub fn default_connector(&self) -> Option<&ConnectorEntry> {
        self.connectors
            .iter()
            .find(|c| c.default)
            .or_else(|| self.connectors.first())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn kebab_case_keys_round_trip() {
        let raw = r#"
connectors:
  - name: shell
    default: true
databases:
  - name: memory
parsers:
  - name: nlu-b
    type: http-intent
    min-score: 0.5
skills:
  - name: greet
    module: hello
web:
  webhook-token: sekrit
  disable-web-index-handler-in-root: true
logging:
  level: debug
  extended: true
timezone: Europe/London
welcome-message: false
"#;
        let cfg: Config = serde_yaml::from_str(raw).unwrap();
        assert_eq!(cfg.connectors[0].name, "shell");
        assert!(cfg.connectors[0].default);
        assert_eq!(cfg.parsers[0].min_score, Some(0.5));
        assert_eq!(cfg.parsers[0].implementation(), "http-intent");
        assert!(cfg.parsers[0].enabled);
        assert_eq!(cfg.web.webhook_token.as_deref(), Some("sekrit"));
        assert!(cfg.web.disable_web_index_handler_in_root);
        assert_eq!(cfg.web.bind_port(), 8080);
        assert!(!cfg.welcome_message);
        assert_eq!(cfg.tz().unwrap(), chrono_tz::Europe::London);
    }

    #[test]
    fn validate_rejects_empty_sections() {
        let cfg = Config { connectors: Vec::new(), ..Config::default() };
        assert!(cfg.validate().is_err());

        let cfg = Config { skills: Vec::new(), ..Config::default() };
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn default_config_is_valid() {
        let cfg = Config::default();
        cfg.validate().unwrap();
        assert_eq!(cfg.default_connector().unwrap().name, "shell");
        assert_eq!(cfg.timezone, "UTC");
    }

    #[test]
    fn ssl_moves_default_port() {
        let cfg: WebConfig = serde_yaml::from_str(
            "ssl:\n  cert: /tmp/cert.pem\n  key: /tmp/key.pem\n",
        )
        .unwrap();
        assert_eq!(cfg.bind_port(), 8443);
    }
}
