use serde::{Deserialize, Serialize};
use std::fs;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;

use tracing::{debug, info, warn};

use crate::agent::{AgentConfig, CALL_TIMEOUT, DEFAULT_EXPIRY_SECS};
use crate::error::{Result, UaError};
use crate::identity::Identity;
use crate::registration::DEFAULT_REGISTRATION_TIMEOUT;
use crate::transport::resolve;

const SETTINGS_FILE: &str = "settings.json";

/// Persisted account and agent settings
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct Settings {
    /// Registrar / outbound proxy, `host` or `host:port`
    pub server: String,
    pub username: String,
    pub domain: String,
    pub password_encrypted: String,
    pub expiry_secs: u32,
    pub call_timeout_secs: u64,
    pub registration_timeout_secs: u64,
    pub bind_addr: SocketAddr,
    pub auto_answer: bool,
    pub user_agent: String,
    /// Code that must be entered before placing a call; empty disables the check
    pub call_passcode: String,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            server: "sip.linphone.org".to_string(),
            username: String::new(),
            domain: "sip.linphone.org".to_string(),
            password_encrypted: String::new(),
            expiry_secs: DEFAULT_EXPIRY_SECS,
            call_timeout_secs: CALL_TIMEOUT.as_secs(),
            registration_timeout_secs: DEFAULT_REGISTRATION_TIMEOUT.as_secs(),
            bind_addr: SocketAddr::from(([0, 0, 0, 0], 0)),
            auto_answer: false,
            user_agent: format!("voip-demo/{}", env!("CARGO_PKG_VERSION")),
            call_passcode: String::new(),
        }
    }
}

const KEY: &[u8] = b"VoipDemoSettingsKey";

/// XOR + hex. Keeps the password from being readable at a glance in the
/// settings file; it is not encryption.
fn obfuscate_password(password: &str) -> String {
    password
        .bytes()
        .enumerate()
        .map(|(i, b)| format!("{:02x}", b ^ KEY[i % KEY.len()]))
        .collect()
}

fn deobfuscate_password(encrypted: &str) -> Result<String> {
    if encrypted.len() % 2 != 0 || !encrypted.is_ascii() {
        return Err(UaError::config("Failed to decode password: malformed hex"));
    }

    let bytes = (0..encrypted.len())
        .step_by(2)
        .map(|i| u8::from_str_radix(&encrypted[i..i + 2], 16))
        .collect::<std::result::Result<Vec<u8>, _>>()
        .map_err(|e| UaError::config(format!("Failed to decode password: {}", e)))?;

    let decrypted: Vec<u8> = bytes
        .iter()
        .enumerate()
        .map(|(i, b)| b ^ KEY[i % KEY.len()])
        .collect();

    String::from_utf8(decrypted).map_err(|e| UaError::config(format!("Invalid UTF-8: {}", e)))
}

impl Settings {
    /// `<config dir>/voip-demo/settings.json`
    pub fn default_path() -> Result<PathBuf> {
        let dir = dirs::config_dir().ok_or_else(|| UaError::config("Failed to get config directory"))?;
        Ok(dir.join("voip-demo").join(SETTINGS_FILE))
    }

    /// Missing file means defaults.
    pub fn load(path: &Path) -> Result<Self> {
        if !path.exists() {
            debug!("No settings at {}, using defaults", path.display());
            return Ok(Self::default());
        }

        let json = fs::read_to_string(path)?;
        let settings: Settings = serde_json::from_str(&json)
            .map_err(|e| UaError::config(format!("Failed to parse settings file: {}", e)))?;

        info!("Loaded settings from: {}", path.display());
        Ok(settings)
    }

    pub fn save(&self, path: &Path) -> Result<()> {
        if let Some(dir) = path.parent() {
            fs::create_dir_all(dir)?;
        }
        let json = serde_json::to_string_pretty(self)
            .map_err(|e| UaError::config(format!("Failed to serialize settings: {}", e)))?;
        fs::write(path, json)?;

        info!("Saved settings to: {}", path.display());
        Ok(())
    }

    pub fn clear(path: &Path) -> Result<()> {
        if path.exists() {
            fs::remove_file(path)?;
            info!("Cleared settings");
        }
        Ok(())
    }

    pub fn password(&self) -> Result<String> {
        if self.password_encrypted.is_empty() {
            return Ok(String::new());
        }
        deobfuscate_password(&self.password_encrypted)
    }

    pub fn set_password(&mut self, password: &str) {
        self.password_encrypted = obfuscate_password(password);
    }

    /// Gate for outbound calls
    pub fn authorize_call(&self, entered: Option<&str>) -> Result<()> {
        if self.call_passcode.is_empty() || entered == Some(self.call_passcode.as_str()) {
            return Ok(());
        }
        warn!("call rejected: incorrect authorization code");
        Err(UaError::Unauthorized)
    }

    pub fn identity(&self) -> Result<Identity> {
        if self.username.is_empty() {
            return Err(UaError::config("No username configured"));
        }
        let domain = if self.domain.is_empty() {
            self.server.split(':').next().unwrap_or_default()
        } else {
            self.domain.as_str()
        };
        Ok(Identity::new(self.username.as_str(), domain, self.password()?))
    }

    /// Resolves the server and builds the agent configuration
    pub async fn agent_config(&self) -> Result<AgentConfig> {
        let registrar = resolve(&self.server).await?;
        let mut config = AgentConfig::new(self.identity()?, registrar);
        config.expiry_secs = self.expiry_secs;
        config.call_timeout = Duration::from_secs(self.call_timeout_secs);
        config.registration_timeout = Duration::from_secs(self.registration_timeout_secs);
        config.user_agent = self.user_agent.clone();
        Ok(config)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_password_obfuscation() {
        let password = "MySecretPassword123!";
        let encrypted = obfuscate_password(password);

        assert_ne!(encrypted, password);
        assert_eq!(deobfuscate_password(&encrypted).unwrap(), password);
    }

    #[test]
    fn test_empty_password() {
        let encrypted = obfuscate_password("");
        assert_eq!(deobfuscate_password(&encrypted).unwrap(), "");
    }

    #[test]
    fn test_malformed_password_is_config_error() {
        assert!(matches!(deobfuscate_password("abc"), Err(UaError::Config { .. })));
        assert!(matches!(deobfuscate_password("zz"), Err(UaError::Config { .. })));
        assert!(matches!(deobfuscate_password("éé"), Err(UaError::Config { .. })));
    }

    #[test]
    fn test_save_load_clear() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join(SETTINGS_FILE);

        assert_eq!(Settings::load(&path).unwrap(), Settings::default());

        let mut settings = Settings {
            username: "mooc_sip".to_string(),
            auto_answer: true,
            ..Settings::default()
        };
        settings.set_password("hunter2");
        settings.save(&path).unwrap();

        let text = fs::read_to_string(&path).unwrap();
        assert!(!text.contains("hunter2"));

        let loaded = Settings::load(&path).unwrap();
        assert_eq!(loaded, settings);
        assert_eq!(loaded.password().unwrap(), "hunter2");

        Settings::clear(&path).unwrap();
        assert!(!path.exists());
    }

    #[test]
    fn test_partial_file_uses_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join(SETTINGS_FILE);
        fs::write(&path, r#"{"username": "alice", "expiry_secs": 600}"#).unwrap();

        let settings = Settings::load(&path).unwrap();
        assert_eq!(settings.username, "alice");
        assert_eq!(settings.expiry_secs, 600);
        assert_eq!(settings.call_timeout_secs, 30);
        assert_eq!(settings.server, "sip.linphone.org");
    }

    #[test]
    fn test_call_passcode_gate() {
        let open = Settings::default();
        assert!(open.authorize_call(None).is_ok());
        assert!(open.authorize_call(Some("anything")).is_ok());

        let gated = Settings {
            call_passcode: "4242".to_string(),
            ..Settings::default()
        };
        assert!(gated.authorize_call(Some("4242")).is_ok());
        assert!(matches!(gated.authorize_call(Some("1234")), Err(UaError::Unauthorized)));
        assert!(matches!(gated.authorize_call(None), Err(UaError::Unauthorized)));
    }

    #[test]
    fn test_identity_requires_username() {
        assert!(matches!(Settings::default().identity(), Err(UaError::Config { .. })));

        let settings = Settings {
            username: "alice".to_string(),
            domain: String::new(),
            server: "127.0.0.1:5070".to_string(),
            ..Settings::default()
        };
        assert_eq!(settings.identity().unwrap().aor(), "sip:alice@127.0.0.1");
    }

    #[tokio::test]
    async fn test_agent_config_from_settings() {
        let settings = Settings {
            server: "127.0.0.1:5070".to_string(),
            username: "alice".to_string(),
            domain: "example.com".to_string(),
            call_timeout_secs: 5,
            ..Settings::default()
        };
        let config = settings.agent_config().await.unwrap();
        assert_eq!(config.registrar, "127.0.0.1:5070".parse::<SocketAddr>().unwrap());
        assert_eq!(config.call_timeout, Duration::from_secs(5));
        assert_eq!(config.identity.aor(), "sip:alice@example.com");
    }
}
