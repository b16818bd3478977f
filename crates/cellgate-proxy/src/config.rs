//! Proxy configuration: TOML file + CLI overrides.

use cellgate_core::{GateError, GateResult};
use serde::Deserialize;
use std::path::{Path, PathBuf};
use tracing::info;

/// Top-level config file structure.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct ConfigFile {
    #[serde(default)]
    pub server: ServerSection,
    #[serde(default)]
    pub gateway: GatewaySection,
    #[serde(default)]
    pub notebooks: NotebooksSection,
}

/// `[server]` section of the config TOML.
#[derive(Debug, Clone, Deserialize)]
pub struct ServerSection {
    #[serde(default = "default_port")]
    pub port: u16,
    #[serde(default = "default_prefix")]
    pub prefix: String,
}

impl Default for ServerSection {
    fn default() -> Self {
        Self {
            port: default_port(),
            prefix: default_prefix(),
        }
    }
}

/// `[gateway]` section: the kernel gateway backend.
#[derive(Debug, Clone, Deserialize)]
pub struct GatewaySection {
    #[serde(default = "default_gateway_url")]
    pub url: String,
    #[serde(default)]
    pub auth_token: Option<String>,
    #[serde(default = "default_retention_secs")]
    pub retention_secs: u64,
    #[serde(default)]
    pub forward_user_auth: bool,
}

impl Default for GatewaySection {
    fn default() -> Self {
        Self {
            url: default_gateway_url(),
            auth_token: None,
            retention_secs: default_retention_secs(),
            forward_user_auth: false,
        }
    }
}

/// `[notebooks]` section: where notebook documents live.
#[derive(Debug, Clone, Deserialize)]
pub struct NotebooksSection {
    #[serde(default = "default_notebook_dir")]
    pub dir: String,
}

impl Default for NotebooksSection {
    fn default() -> Self {
        Self {
            dir: default_notebook_dir(),
        }
    }
}

fn default_port() -> u16 {
    9700
}
fn default_prefix() -> String {
    "/api".to_string()
}
fn default_gateway_url() -> String {
    "http://127.0.0.1:8888".to_string()
}
fn default_retention_secs() -> u64 {
    60
}
fn default_notebook_dir() -> String {
    "./notebooks".to_string()
}

/// Resolved proxy configuration (URL parsed, paths expanded, CLI overrides
/// applied).
#[derive(Debug, Clone)]
pub struct ProxyConfig {
    pub port: u16,
    /// Path prefix stripped from client requests before forwarding.
    pub prefix: String,
    /// Base URL of the kernel gateway backend.
    pub gateway_url: reqwest::Url,
    /// Backend auth token, sent as `Authorization: token <value>`.
    pub auth_token: Option<String>,
    /// Grace period after client disconnect before kernel deletion.
    pub retention_secs: u64,
    /// Forward the caller-identity header to the backend.
    pub forward_user_auth: bool,
    /// Root directory for notebook documents.
    pub notebook_dir: PathBuf,
}

impl ProxyConfig {
    /// Load config from a TOML file, then apply CLI overrides.
    #[allow(clippy::too_many_arguments)]
    pub fn load(
        config_path: Option<&Path>,
        cli_port: Option<u16>,
        cli_prefix: Option<&str>,
        cli_gateway_url: Option<&str>,
        cli_auth_token: Option<&str>,
        cli_retention_secs: Option<u64>,
        cli_notebook_dir: Option<&str>,
    ) -> GateResult<Self> {
        let file_config = if let Some(path) = config_path {
            let expanded = expand_tilde(path);
            if expanded.exists() {
                info!(path = %expanded.display(), "loading config file");
                let content = std::fs::read_to_string(&expanded)?;
                toml::from_str::<ConfigFile>(&content)
                    .map_err(|e| GateError::Config(format!("config parse error: {e}")))?
            } else {
                info!(path = %expanded.display(), "config file not found, using defaults");
                ConfigFile::default()
            }
        } else {
            ConfigFile::default()
        };

        let port = cli_port.unwrap_or(file_config.server.port);
        let prefix = cli_prefix
            .map(|s| s.to_string())
            .unwrap_or(file_config.server.prefix);
        let gateway_str = cli_gateway_url
            .map(|s| s.to_string())
            .unwrap_or(file_config.gateway.url);
        let auth_token = cli_auth_token
            .map(|s| s.to_string())
            .or(file_config.gateway.auth_token);
        let retention_secs = cli_retention_secs.unwrap_or(file_config.gateway.retention_secs);
        let dir_str = cli_notebook_dir
            .map(|s| s.to_string())
            .unwrap_or(file_config.notebooks.dir);

        let gateway_url = reqwest::Url::parse(&gateway_str)
            .map_err(|e| GateError::Config(format!("invalid gateway url {gateway_str:?}: {e}")))?;
        if gateway_url.host_str().is_none() {
            return Err(GateError::Config(format!(
                "gateway url {gateway_str:?} has no host"
            )));
        }

        Ok(Self {
            port,
            prefix: normalize_prefix(&prefix),
            gateway_url,
            auth_token,
            retention_secs,
            forward_user_auth: file_config.gateway.forward_user_auth,
            notebook_dir: expand_tilde_str(&dir_str),
        })
    }

    /// Backend host for raw TCP connections.
    pub fn gateway_host(&self) -> &str {
        // Validated non-empty in `load`.
        self.gateway_url.host_str().unwrap_or("127.0.0.1")
    }

    /// Backend port, falling back to the scheme default.
    pub fn gateway_port(&self) -> u16 {
        self.gateway_url.port_or_known_default().unwrap_or(80)
    }
}

/// Ensure the prefix has a leading slash and no trailing one.
fn normalize_prefix(prefix: &str) -> String {
    let trimmed = prefix.trim_end_matches('/');
    if trimmed.is_empty() {
        String::new()
    } else if trimmed.starts_with('/') {
        trimmed.to_string()
    } else {
        format!("/{trimmed}")
    }
}

/// Expand `~` to the user's home directory.
fn expand_tilde(path: &Path) -> PathBuf {
    let s = path.to_string_lossy();
    expand_tilde_str(&s)
}

fn expand_tilde_str(s: &str) -> PathBuf {
    if let Some(rest) = s.strip_prefix("~/") {
        if let Some(home) = dirs::home_dir() {
            return home.join(rest);
        }
    }
    PathBuf::from(s)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_apply_without_file() {
        let cfg = ProxyConfig::load(None, None, None, None, None, None, None).unwrap();
        assert_eq!(cfg.port, 9700);
        assert_eq!(cfg.prefix, "/api");
        assert_eq!(cfg.gateway_host(), "127.0.0.1");
        assert_eq!(cfg.gateway_port(), 8888);
        assert_eq!(cfg.retention_secs, 60);
        assert!(cfg.auth_token.is_none());
    }

    #[test]
    fn cli_overrides_win() {
        let cfg = ProxyConfig::load(
            None,
            Some(8080),
            Some("proxy/"),
            Some("https://kernels.example.com"),
            Some("sekrit"),
            Some(5),
            Some("/srv/notebooks"),
        )
        .unwrap();
        assert_eq!(cfg.port, 8080);
        assert_eq!(cfg.prefix, "/proxy");
        assert_eq!(cfg.gateway_port(), 443);
        assert_eq!(cfg.auth_token.as_deref(), Some("sekrit"));
        assert_eq!(cfg.retention_secs, 5);
        assert_eq!(cfg.notebook_dir, PathBuf::from("/srv/notebooks"));
    }

    #[test]
    fn bad_gateway_url_is_a_config_error() {
        let err = ProxyConfig::load(None, None, None, Some("not a url"), None, None, None)
            .unwrap_err();
        assert!(matches!(err, GateError::Config(_)));
    }
}
