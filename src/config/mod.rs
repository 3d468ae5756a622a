//! Configuration and the process-wide engine context

use std::fs;
use std::path::{Path, PathBuf};
use std::sync::{Arc, RwLock};

use anyhow::{Context as _, Result};
use directories::ProjectDirs;
use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;

/// Default signaling port.
pub const DEFAULT_SIGNALING_PORT: u16 = 8088;

/// Default UDP port of the peer's primary transport.
pub const DEFAULT_PRIMARY_PORT: u16 = 4433;

/// Default dialplan context for inbound calls.
pub const DEFAULT_CONTEXT: &str = "default";

/// Scalar settings loaded from `config.toml`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Settings {
    /// Host running the signaling server
    pub signaling_host: String,
    /// Signaling WebSocket port
    pub signaling_port: u16,
    /// Dialplan context handed to call-control for inbound calls
    pub context: String,
    /// Peer port for the primary media transport
    pub primary_port: u16,
    /// Identity registered with the signaling server
    pub user_id: Option<String>,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            signaling_host: "127.0.0.1".to_string(),
            signaling_port: DEFAULT_SIGNALING_PORT,
            context: DEFAULT_CONTEXT.to_string(),
            primary_port: DEFAULT_PRIMARY_PORT,
            user_id: None,
        }
    }
}

impl Settings {
    /// Get config directory path
    fn config_dir() -> Result<PathBuf> {
        let proj_dirs = ProjectDirs::from("org", "moq-channel", "moq-channel")
            .context("Could not determine config directory")?;
        Ok(proj_dirs.config_dir().to_path_buf())
    }

    /// Get the default config file path
    pub fn default_path() -> Result<PathBuf> {
        Ok(Self::config_dir()?.join("config.toml"))
    }

    /// Load settings from `path`. A missing file yields the defaults.
    pub fn load(path: &Path) -> Result<Self> {
        if !path.exists() {
            tracing::warn!(
                "Config file {} not found, using defaults",
                path.display()
            );
            return Ok(Self::default());
        }

        let content = fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file {}", path.display()))?;
        Self::from_toml(&content)
            .with_context(|| format!("Config file {} is invalid", path.display()))
    }

    pub fn from_toml(content: &str) -> Result<Self> {
        toml::from_str(content).context("Failed to parse config file")
    }

    /// WebSocket URL of the signaling server.
    pub fn signaling_url(&self) -> String {
        format!("ws://{}:{}", self.signaling_host, self.signaling_port)
    }
}

/// Engine-wide context: settings plus the shutdown token.
///
/// Built once at startup and shared by reference. Settings only change
/// through [`Context::reload`]; shutdown is a one-way transition.
pub struct Context {
    path: Option<PathBuf>,
    settings: RwLock<Settings>,
    shutdown: CancellationToken,
}

impl Context {
    pub fn new(settings: Settings) -> Self {
        Self {
            path: None,
            settings: RwLock::new(settings),
            shutdown: CancellationToken::new(),
        }
    }

    /// Load from `path`, or from the platform config directory.
    pub fn load(path: Option<PathBuf>) -> Result<Arc<Self>> {
        let path = match path {
            Some(p) => p,
            None => Settings::default_path()?,
        };
        let settings = Settings::load(&path)?;
        tracing::debug!("Loaded settings from {}: {:?}", path.display(), settings);

        Ok(Arc::new(Self {
            path: Some(path),
            settings: RwLock::new(settings),
            shutdown: CancellationToken::new(),
        }))
    }

    /// Snapshot of the current settings.
    pub fn settings(&self) -> Settings {
        self.settings
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }

    /// Re-read the config file. On error the previous settings stay.
    pub fn reload(&self) -> Result<()> {
        let Some(ref path) = self.path else {
            return Ok(());
        };
        let settings = Settings::load(path)?;
        tracing::info!("Reloaded settings from {}", path.display());
        *self.settings.write().unwrap_or_else(|e| e.into_inner()) = settings;
        Ok(())
    }

    pub fn shutdown_token(&self) -> &CancellationToken {
        &self.shutdown
    }

    pub fn shutdown(&self) {
        self.shutdown.cancel();
    }

    pub fn is_running(&self) -> bool {
        !self.shutdown.is_cancelled()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn temp_config(name: &str, content: &str) -> PathBuf {
        let path = std::env::temp_dir().join(format!(
            "moq-channel-{}-{}.toml",
            name,
            std::process::id()
        ));
        fs::write(&path, content).unwrap();
        path
    }

    #[test]
    fn test_defaults() {
        let s = Settings::default();
        assert_eq!(s.signaling_port, 8088);
        assert_eq!(s.primary_port, 4433);
        assert_eq!(s.context, "default");
        assert_eq!(s.signaling_url(), "ws://127.0.0.1:8088");
    }

    #[test]
    fn test_partial_toml_keeps_defaults() {
        let s = Settings::from_toml("context = \"from-moq\"\nuser_id = \"alice\"\n").unwrap();
        assert_eq!(s.context, "from-moq");
        assert_eq!(s.user_id.as_deref(), Some("alice"));
        assert_eq!(s.signaling_port, 8088);
        assert_eq!(s.primary_port, 4433);
    }

    #[test]
    fn test_invalid_toml_is_an_error() {
        assert!(Settings::from_toml("signaling_port = \"not a port\"").is_err());
    }

    #[test]
    fn test_missing_file_uses_defaults() {
        let path = std::env::temp_dir().join("moq-channel-does-not-exist.toml");
        assert_eq!(Settings::load(&path).unwrap(), Settings::default());
    }

    #[test]
    fn test_reload_rereads_scalars() {
        let path = temp_config("reload", "signaling_port = 9000\n");
        let ctx = Context::load(Some(path.clone())).unwrap();
        assert_eq!(ctx.settings().signaling_port, 9000);

        fs::write(&path, "signaling_port = 9001\nprimary_port = 5000\n").unwrap();
        ctx.reload().unwrap();
        assert_eq!(ctx.settings().signaling_port, 9001);
        assert_eq!(ctx.settings().primary_port, 5000);

        // A broken file leaves the last good settings in place.
        fs::write(&path, "primary_port = [").unwrap();
        assert!(ctx.reload().is_err());
        assert_eq!(ctx.settings().primary_port, 5000);

        let _ = fs::remove_file(&path);
    }

    #[test]
    fn test_shutdown_is_one_way() {
        let ctx = Context::new(Settings::default());
        assert!(ctx.is_running());
        ctx.shutdown();
        assert!(!ctx.is_running());
        assert!(ctx.shutdown_token().is_cancelled());
    }
}
