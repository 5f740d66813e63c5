use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use tracing::warn;

use mergemail_core::{SendFlags, xdg_state_dir};
use mergemail_mail::{BrandingConfig, RelayTls, SmtpConfig};

const DEFAULT_RELAY_PORT: u16 = 587;
const DEFAULT_SEND_TIMEOUT_SECS: u64 = 60;

#[derive(Debug, Clone)]
pub(crate) struct AppConfig {
    pub(crate) relay: SmtpConfig,
    pub(crate) db_path: PathBuf,
    pub(crate) activity_log: PathBuf,
    pub(crate) branding: BrandingConfig,
    pub(crate) defaults: SendDefaults,
}

#[derive(Debug, Clone, Copy)]
pub(crate) struct SendDefaults {
    pub(crate) flags: SendFlags,
    pub(crate) use_row_content: bool,
}

impl Default for SendDefaults {
    fn default() -> Self {
        Self {
            flags: SendFlags::default(),
            use_row_content: false,
        }
    }
}

pub(crate) fn load_app_config(explicit: Option<&Path>) -> Result<AppConfig> {
    let content = match explicit {
        Some(path) => Some(
            std::fs::read_to_string(path)
                .with_context(|| format!("failed to read config {}", path.display()))?,
        ),
        None => load_config_text(),
    };
    Ok(parse_app_config(content.as_deref(), |key| {
        std::env::var(key).ok()
    }))
}

/// Builds the configuration from the file contents, then applies relay
/// overrides from the environment. Unparseable values keep their defaults.
pub(crate) fn parse_app_config(
    content: Option<&str>,
    env: impl Fn(&str) -> Option<String>,
) -> AppConfig {
    let value = content.and_then(|text| match toml::from_str::<toml::Value>(text) {
        Ok(value) => Some(value),
        Err(err) => {
            warn!(error = %err, "config is not valid TOML, using defaults");
            None
        }
    });
    let section = |name: &str| value.as_ref().and_then(|v| v.get(name)).cloned();

    let relay = section("relay");
    let get_str = |table: &Option<toml::Value>, key: &str| -> Option<String> {
        table
            .as_ref()
            .and_then(|t| t.get(key))
            .and_then(|v| v.as_str())
            .map(|s| s.trim().to_string())
            .filter(|s| !s.is_empty())
    };
    let env_str = |key: &str| env(key).map(|v| v.trim().to_string()).filter(|v| !v.is_empty());

    let host = env_str("MERGEMAIL_RELAY_HOST")
        .or_else(|| get_str(&relay, "host"))
        .unwrap_or_default();
    let username = env_str("MERGEMAIL_RELAY_USERNAME")
        .or_else(|| get_str(&relay, "username"))
        .unwrap_or_default();
    let password = env("MERGEMAIL_RELAY_PASSWORD")
        .filter(|v| !v.is_empty())
        .or_else(|| {
            relay
                .as_ref()
                .and_then(|t| t.get("password"))
                .and_then(|v| v.as_str())
                .map(|s| s.to_string())
        })
        .unwrap_or_default();
    let from = get_str(&relay, "from").unwrap_or_else(|| username.clone());
    let port = relay
        .as_ref()
        .and_then(|t| t.get("port"))
        .and_then(|v| v.as_integer())
        .and_then(|v| u16::try_from(v).ok())
        .filter(|v| *v != 0)
        .unwrap_or(DEFAULT_RELAY_PORT);
    let skip_tls_verify = relay
        .as_ref()
        .and_then(|t| t.get("skip_tls_verify"))
        .and_then(parse_bool)
        .unwrap_or(false);
    let tls = match get_str(&relay, "tls") {
        Some(raw) => RelayTls::parse(&raw).unwrap_or_else(|| {
            warn!(value = %raw, "unknown relay tls mode, using auto");
            RelayTls::Auto
        }),
        None => RelayTls::Auto,
    };
    let timeout_secs = relay
        .as_ref()
        .and_then(|t| t.get("timeout_secs"))
        .and_then(|v| v.as_integer())
        .filter(|v| *v > 0)
        .map(|v| v as u64)
        .unwrap_or(DEFAULT_SEND_TIMEOUT_SECS);

    let store = section("store");
    let state_dir = xdg_state_dir();
    let db_path = get_str(&store, "db_path")
        .map(PathBuf::from)
        .unwrap_or_else(|| state_dir.join("mergemail.db"));
    let activity_log = get_str(&store, "activity_log")
        .map(PathBuf::from)
        .unwrap_or_else(|| state_dir.join("activity.log"));

    let branding = section("branding");
    let branding = BrandingConfig {
        name: get_str(&branding, "name"),
        tagline: get_str(&branding, "tagline"),
        logo_path: get_str(&branding, "logo_path").map(PathBuf::from),
    };

    let defaults = section("defaults");
    let fallback = SendDefaults::default();
    let flag = |key: &str, default: bool| {
        defaults
            .as_ref()
            .and_then(|t| t.get(key))
            .and_then(parse_bool)
            .unwrap_or(default)
    };
    let defaults = SendDefaults {
        flags: SendFlags {
            skip_duplicates_in_file: flag(
                "skip_duplicates_in_file",
                fallback.flags.skip_duplicates_in_file,
            ),
            respect_global_history: flag(
                "respect_global_history",
                fallback.flags.respect_global_history,
            ),
            mark_status: flag("mark_status", fallback.flags.mark_status),
        },
        use_row_content: flag("use_row_content", fallback.use_row_content),
    };

    AppConfig {
        relay: SmtpConfig {
            host,
            port,
            username,
            password,
            from,
            skip_tls_verify,
            tls,
            timeout_secs,
        },
        db_path,
        activity_log,
        branding,
        defaults,
    }
}

fn parse_bool(value: &toml::Value) -> Option<bool> {
    value.as_bool().or_else(|| {
        value
            .as_str()
            .map(|s| s == "1" || s.eq_ignore_ascii_case("true"))
    })
}

fn config_path_candidates() -> Vec<PathBuf> {
    vec![
        PathBuf::from("mergemail.toml"),
        xdg_config_dir().join("mergemail").join("mergemail.toml"),
    ]
}

fn xdg_config_dir() -> PathBuf {
    std::env::var_os("XDG_CONFIG_HOME")
        .map(PathBuf::from)
        .or_else(|| std::env::var_os("HOME").map(|home| PathBuf::from(home).join(".config")))
        .unwrap_or_else(|| PathBuf::from("/tmp"))
}

fn load_config_text() -> Option<String> {
    for path in config_path_candidates() {
        if let Ok(content) = std::fs::read_to_string(&path) {
            return Some(content);
        }
    }
    None
}

fn default_config_template() -> &'static str {
    r#"# Auto-generated by mergemail on first run.
# Credentials can also come from MERGEMAIL_RELAY_HOST,
# MERGEMAIL_RELAY_USERNAME and MERGEMAIL_RELAY_PASSWORD.

[relay]
host = ""
port = 587
username = ""
password = ""
from = ""
skip_tls_verify = false
# auto (465 implicit, otherwise starttls), implicit, starttls, plain
tls = "auto"
timeout_secs = 60

[store]
# db_path = "/path/to/mergemail.db"
# activity_log = "/path/to/activity.log"

[branding]
# name = ""
# tagline = ""
# logo_path = ""

[defaults]
skip_duplicates_in_file = true
respect_global_history = false
mark_status = false
use_row_content = false
"#
}

pub(crate) fn ensure_default_config_exists() -> Result<()> {
    if load_config_text().is_some() {
        return Ok(());
    }
    let path = xdg_config_dir().join("mergemail").join("mergemail.toml");
    write_text_atomic(&path, default_config_template())
}

fn write_text_atomic(path: &Path, content: &str) -> Result<()> {
    let parent = path.parent().unwrap_or_else(|| Path::new("."));
    std::fs::create_dir_all(parent)?;
    let tmp = path.with_extension("tmp");
    std::fs::write(&tmp, content.as_bytes())?;
    std::fs::rename(&tmp, path)?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;
    use std::path::PathBuf;

    use mergemail_mail::RelayTls;

    use super::{default_config_template, parse_app_config};

    fn no_env(_: &str) -> Option<String> {
        None
    }

    #[test]
    fn defaults_without_file() {
        let config = parse_app_config(None, no_env);
        assert_eq!(config.relay.port, 587);
        assert_eq!(config.relay.timeout_secs, 60);
        assert_eq!(config.relay.tls, RelayTls::Auto);
        assert!(config.relay.host.is_empty());
        assert!(config.defaults.flags.skip_duplicates_in_file);
        assert!(!config.defaults.flags.respect_global_history);
        assert!(!config.defaults.use_row_content);
        assert!(config.db_path.ends_with("mergemail/mergemail.db"));
        assert!(config.branding.logo_path.is_none());
    }

    #[test]
    fn generated_template_parses_to_defaults() {
        let config = parse_app_config(Some(default_config_template()), no_env);
        assert_eq!(config.relay.port, 587);
        assert!(config.relay.username.is_empty());
        assert!(config.branding.name.is_none());
        assert!(config.defaults.flags.skip_duplicates_in_file);
    }

    #[test]
    fn file_values_are_read() {
        let text = r#"
[relay]
host = "smtp.example.com"
port = 465
username = "studio@example.com"
password = "file-secret"
skip_tls_verify = "true"
tls = "implicit"
timeout_secs = 15

[store]
db_path = "/var/lib/mergemail/history.db"

[branding]
name = "Studio"
logo_path = "/srv/logo.png"

[defaults]
skip_duplicates_in_file = false
respect_global_history = true
mark_status = 1
use_row_content = true
"#;
        let config = parse_app_config(Some(text), no_env);
        assert_eq!(config.relay.host, "smtp.example.com");
        assert_eq!(config.relay.port, 465);
        assert_eq!(config.relay.from, "studio@example.com");
        assert!(config.relay.skip_tls_verify);
        assert_eq!(config.relay.tls, RelayTls::Implicit);
        assert_eq!(config.relay.timeout_secs, 15);
        assert_eq!(config.db_path, PathBuf::from("/var/lib/mergemail/history.db"));
        assert_eq!(config.branding.name.as_deref(), Some("Studio"));
        assert_eq!(config.branding.logo_path, Some(PathBuf::from("/srv/logo.png")));
        assert!(!config.defaults.flags.skip_duplicates_in_file);
        assert!(config.defaults.flags.respect_global_history);
        // Integers are not booleans.
        assert!(!config.defaults.flags.mark_status);
        assert!(config.defaults.use_row_content);
    }

    #[test]
    fn environment_overrides_credentials() {
        let text = "[relay]\nhost = \"smtp.file\"\nusername = \"file@x.com\"\npassword = \"pw\"\n";
        let env: HashMap<&str, &str> = HashMap::from([
            ("MERGEMAIL_RELAY_HOST", "smtp.env"),
            ("MERGEMAIL_RELAY_USERNAME", "env@x.com"),
            ("MERGEMAIL_RELAY_PASSWORD", "env-secret"),
        ]);
        let config = parse_app_config(Some(text), |k| env.get(k).map(|v| v.to_string()));
        assert_eq!(config.relay.host, "smtp.env");
        assert_eq!(config.relay.username, "env@x.com");
        assert_eq!(config.relay.password, "env-secret");
        assert_eq!(config.relay.from, "env@x.com");
    }

    #[test]
    fn malformed_file_falls_back_to_defaults() {
        let config = parse_app_config(Some("[relay\nport = "), no_env);
        assert_eq!(config.relay.port, 587);

        let config = parse_app_config(
            Some("[relay]\nport = 70000\ntimeout_secs = -3\ntls = \"sometimes\"\n"),
            no_env,
        );
        assert_eq!(config.relay.port, 587);
        assert_eq!(config.relay.timeout_secs, 60);
        assert_eq!(config.relay.tls, RelayTls::Auto);
    }
}
