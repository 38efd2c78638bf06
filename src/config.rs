//! Configuration loading — YAML with `${VAR}` environment expansion.

use std::collections::BTreeMap;
use std::path::Path;
use std::sync::LazyLock;

use regex::Regex;
use serde::Deserialize;

use crate::error::ConfigError;

/// Application configuration.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct Config {
    pub server: ServerConfig,
    pub smtp: SmtpOutConfig,
    pub database: DatabaseConfig,
    pub llm: LlmConfig,
    pub mcp: McpConfig,
    pub mailboxes: Vec<MailboxConfig>,
}

/// Inbound SMTP server settings.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    pub smtp_host: String,
    pub smtp_port: u16,
    pub tls: TlsConfig,
    pub allowed_domains: Vec<String>,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct TlsConfig {
    pub enabled: bool,
    pub cert_file: String,
    pub key_file: String,
}

/// Outbound email settings.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct SmtpOutConfig {
    /// "resend", "smtp", or empty for none.
    pub provider: String,
    pub resend_key: String,
    pub from_address: String,
    pub from_name: String,
    pub host: String,
    pub port: u16,
    pub username: String,
    pub password: String,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct DatabaseConfig {
    pub path: String,
}

/// LLM provider settings.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct LlmConfig {
    pub provider: String,
    pub api_key: String,
    pub model: String,
    pub base_url: String,
    pub max_tokens: u32,
    pub temperature: f32,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct McpConfig {
    pub servers: Vec<McpServerConfig>,
}

/// A single MCP server launched as a child process.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct McpServerConfig {
    pub name: String,
    pub command: String,
    pub args: Vec<String>,
    pub env: BTreeMap<String, String>,
}

/// A routing rule plus the processor it selects.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct MailboxConfig {
    pub name: String,
    #[serde(rename = "match")]
    pub matcher: MatchConfig,
    pub processor: ProcessorConfig,
}

/// Regex sources matched against envelope fields. Empty means wildcard.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct MatchConfig {
    pub from: String,
    pub to: String,
    pub subject: String,
}

/// How a matched email is handled.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct ProcessorConfig {
    /// "llm", "forward", "webhook", or "noop". Empty defaults to "llm".
    #[serde(rename = "type")]
    pub kind: String,
    pub system_prompt: String,
    pub tools: Vec<String>,
    pub forward_to: String,
    pub webhook_url: String,
}

static ENV_VAR: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\$\{([A-Za-z_][A-Za-z0-9_]*)\}").unwrap());

impl Config {
    /// Read and parse the configuration file, expanding `${VAR}` references
    /// and applying defaults.
    pub fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let raw = std::fs::read_to_string(path)?;
        Self::from_str(&raw)
    }

    /// Parse configuration from a YAML string.
    pub fn from_str(raw: &str) -> Result<Self, ConfigError> {
        let expanded = expand_env_vars(raw);
        let mut cfg: Config = serde_yaml::from_str(&expanded)?;
        cfg.apply_defaults();
        Ok(cfg)
    }

    fn apply_defaults(&mut self) {
        if self.server.smtp_port == 0 {
            self.server.smtp_port = 2525;
        }
        if self.server.smtp_host.is_empty() {
            self.server.smtp_host = "0.0.0.0".into();
        }
        if self.database.path.is_empty() {
            self.database.path = "./emitt.db".into();
        }
        if self.llm.provider.is_empty() {
            self.llm.provider = "openai".into();
        }
        if self.llm.model.is_empty() {
            self.llm.model = "gpt-5.2".into();
        }
        if self.llm.base_url.is_empty() {
            self.llm.base_url = "https://api.openai.com/v1".into();
        }
        if self.llm.max_tokens == 0 {
            self.llm.max_tokens = 4096;
        }
        if self.llm.temperature == 0.0 {
            self.llm.temperature = 0.7;
        }
    }

    /// Look up a mailbox configuration by name (case-insensitive).
    pub fn mailbox_by_name(&self, name: &str) -> Option<&MailboxConfig> {
        self.mailboxes
            .iter()
            .find(|mb| mb.name.eq_ignore_ascii_case(name))
    }
}

/// Expand `${VAR}` references from the process environment.
///
/// Unset variables are left as-is, so a missing secret is visible in the
/// parsed config instead of silently collapsing to an empty string.
fn expand_env_vars(raw: &str) -> String {
    ENV_VAR
        .replace_all(raw, |caps: &regex::Captures<'_>| {
            let key = &caps[1];
            std::env::var(key).unwrap_or_else(|_| format!("${{{key}}}"))
        })
        .into_owned()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_applied_to_empty_config() {
        let cfg = Config::from_str("{}").unwrap();
        assert_eq!(cfg.server.smtp_port, 2525);
        assert_eq!(cfg.server.smtp_host, "0.0.0.0");
        assert_eq!(cfg.database.path, "./emitt.db");
        assert_eq!(cfg.llm.max_tokens, 4096);
        assert!((cfg.llm.temperature - 0.7).abs() < f32::EPSILON);
    }

    #[test]
    fn parses_mailboxes_with_match_and_processor() {
        let yaml = r#"
mailboxes:
  - name: support
    match:
      to: "support@.*"
    processor:
      type: llm
      system_prompt: "Answer support questions."
      tools: [send_email]
  - name: archive
    match: {}
    processor:
      type: noop
"#;
        let cfg = Config::from_str(yaml).unwrap();
        assert_eq!(cfg.mailboxes.len(), 2);
        assert_eq!(cfg.mailboxes[0].name, "support");
        assert_eq!(cfg.mailboxes[0].matcher.to, "support@.*");
        assert_eq!(cfg.mailboxes[0].processor.kind, "llm");
        assert_eq!(cfg.mailboxes[0].processor.tools, vec!["send_email"]);
        assert_eq!(cfg.mailboxes[1].processor.kind, "noop");
    }

    #[test]
    fn expands_set_env_vars() {
        // SAFETY: test runs single-threaded with respect to this variable.
        unsafe { std::env::set_var("EMITT_TEST_KEY", "sekrit") };
        let cfg = Config::from_str("llm:\n  api_key: ${EMITT_TEST_KEY}\n").unwrap();
        assert_eq!(cfg.llm.api_key, "sekrit");
    }

    #[test]
    fn leaves_unset_env_vars_in_place() {
        let expanded = expand_env_vars("key: ${EMITT_DEFINITELY_UNSET_VAR}");
        assert_eq!(expanded, "key: ${EMITT_DEFINITELY_UNSET_VAR}");
    }

    #[test]
    fn mcp_server_config_parses() {
        let yaml = r#"
mcp:
  servers:
    - name: files
      command: mcp-files
      args: ["--root", "/srv"]
      env:
        LOG_LEVEL: debug
"#;
        let cfg = Config::from_str(yaml).unwrap();
        assert_eq!(cfg.mcp.servers.len(), 1);
        assert_eq!(cfg.mcp.servers[0].name, "files");
        assert_eq!(cfg.mcp.servers[0].args, vec!["--root", "/srv"]);
        assert_eq!(cfg.mcp.servers[0].env.get("LOG_LEVEL").unwrap(), "debug");
    }

    #[test]
    fn mailbox_lookup_is_case_insensitive() {
        let yaml = "mailboxes:\n  - name: Support\n";
        let cfg = Config::from_str(yaml).unwrap();
        assert!(cfg.mailbox_by_name("support").is_some());
        assert!(cfg.mailbox_by_name("sales").is_none());
    }
}
