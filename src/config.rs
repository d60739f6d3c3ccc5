use anyhow::{Context, Result, anyhow};
use dotenvy::dotenv;
use keyring::Entry;
use serde::{Deserialize, Serialize};
use std::{
    fs,
    path::{Path, PathBuf},
    time::Duration,
};
use url::Url;

pub const KEYRING_SERVICE: &str = "grab-upload-api-token";
pub const KEYRING_USER: &str = "GrabTeacher";
const ENV_PREFIX: &str = "GRAB_";

#[derive(Debug, Serialize, Deserialize, Default)]
pub struct ConfigFile {
    pub base_url: Option<Url>,
    pub default_module: Option<String>,
    pub part_size: Option<u64>,
    pub concurrency: Option<usize>,
    /// humantime duration, e.g. `30s` or `2m`
    pub request_timeout: Option<String>,
}

#[derive(Debug, Deserialize, Default)]
struct ConfigEnv {
    base_url: Option<Url>,
    api_token: Option<String>,
    default_module: Option<String>,
    part_size: Option<u64>,
    concurrency: Option<usize>,
    request_timeout: Option<String>,
}

pub struct Config {
    pub base_url: Url,
    pub api_token: String,
    pub default_module: Option<String>,
    pub part_size: Option<u64>,
    pub concurrency: Option<usize>,
    pub request_timeout: Option<Duration>,
}

fn parse_timeout(value: Option<String>) -> Result<Option<Duration>> {
    value
        .map(|value| {
            humantime::parse_duration(&value)
                .with_context(|| format!("Invalid request timeout '{}'", value))
        })
        .transpose()
}

fn merge_config(
    base: ConfigFile,
    override_config: ConfigEnv,
    keyring_token: impl FnOnce() -> Result<String>,
) -> Result<Config> {
    let base_url = override_config
        .base_url
        .or(base.base_url)
        .ok_or(anyhow!("No API base URL provided"))?;

    let api_token = match override_config.api_token {
        Some(api_token) => api_token,
        None => keyring_token()?,
    };

    Ok(Config {
        base_url,
        api_token,
        default_module: override_config.default_module.or(base.default_module),
        part_size: override_config.part_size.or(base.part_size),
        concurrency: override_config.concurrency.or(base.concurrency),
        request_timeout: parse_timeout(override_config.request_timeout.or(base.request_timeout))?,
    })
}

fn read_keyring_token() -> Result<String> {
    let entry = Entry::new(KEYRING_SERVICE, KEYRING_USER)?;
    let api_token = entry
        .get_secret()
        .context("API token not specified via environment variable nor present in OS keyring")?;
    Ok(String::from_utf8(api_token)?)
}

fn config_file_path() -> Result<PathBuf> {
    let project_dirs = directories::ProjectDirs::from("com", "grabteacher", "grab-upload")
        .ok_or(anyhow!("Unable to determine home directory"))?;
    Ok(project_dirs.config_dir().join("config.toml"))
}

fn read_config_file_at(path: &Path) -> Result<ConfigFile> {
    match fs::read_to_string(path) {
        Ok(config) => toml::from_str(&config).context("Failed to parse config file"),
        Err(_) => Ok(ConfigFile::default()),
    }
}

fn write_config_at(path: &Path, config: &ConfigFile) -> Result<()> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)
            .with_context(|| format!("Failed to create {}", parent.display()))?;
    }
    fs::write(path, toml::to_string_pretty(config)?)
        .with_context(|| format!("Failed to write {}", path.display()))?;
    Ok(())
}

/// Rewrites the config file, leaving settings `update` does not touch as they were.
fn update_config_at(path: &Path, update: impl FnOnce(&mut ConfigFile)) -> Result<()> {
    let mut config = read_config_file_at(path)?;
    update(&mut config);
    write_config_at(path, &config)
}

pub fn read_config_file() -> Result<ConfigFile> {
    read_config_file_at(&config_file_path()?)
}

pub fn read_config() -> Result<Config> {
    let _ = dotenv();
    let env_config = envy::prefixed(ENV_PREFIX)
        .from_env::<ConfigEnv>()
        .unwrap_or_default();

    merge_config(read_config_file()?, env_config, read_keyring_token)
}

pub fn update_config(update: impl FnOnce(&mut ConfigFile)) -> Result<()> {
    update_config_at(&config_file_path()?, update)
}

pub fn set_api_token_keyring(api_token: String) -> Result<()> {
    let entry = Entry::new(KEYRING_SERVICE, KEYRING_USER)?;
    entry.set_secret(api_token.as_bytes())?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn no_keyring() -> Result<String> {
        Err(anyhow!("keyring unavailable"))
    }

    #[test]
    fn test_env_overrides_file() {
        let file = ConfigFile {
            base_url: Some(Url::parse("https://file.example.com/").unwrap()),
            default_module: Some("doc".to_string()),
            part_size: Some(8 * 1024 * 1024),
            concurrency: Some(2),
            request_timeout: Some("30s".to_string()),
        };
        let env = ConfigEnv {
            base_url: Some(Url::parse("https://env.example.com/").unwrap()),
            api_token: Some("env-token".to_string()),
            concurrency: Some(6),
            ..Default::default()
        };

        let config = merge_config(file, env, no_keyring).unwrap();
        assert_eq!(config.base_url.as_str(), "https://env.example.com/");
        assert_eq!(config.api_token, "env-token");
        assert_eq!(config.default_module.as_deref(), Some("doc"));
        assert_eq!(config.part_size, Some(8 * 1024 * 1024));
        assert_eq!(config.concurrency, Some(6));
        assert_eq!(config.request_timeout, Some(Duration::from_secs(30)));
    }

    #[test]
    fn test_token_falls_back_to_keyring() {
        let file = ConfigFile {
            base_url: Some(Url::parse("https://file.example.com/").unwrap()),
            ..Default::default()
        };
        let config = merge_config(file, ConfigEnv::default(), || Ok("stored".to_string())).unwrap();
        assert_eq!(config.api_token, "stored");

        let file = ConfigFile {
            base_url: Some(Url::parse("https://file.example.com/").unwrap()),
            ..Default::default()
        };
        assert!(merge_config(file, ConfigEnv::default(), no_keyring).is_err());
    }

    #[test]
    fn test_missing_base_url() {
        let env = ConfigEnv {
            api_token: Some("t".to_string()),
            ..Default::default()
        };
        assert!(merge_config(ConfigFile::default(), env, no_keyring).is_err());
    }

    #[test]
    fn test_invalid_timeout() {
        let env = ConfigEnv {
            base_url: Some(Url::parse("https://env.example.com/").unwrap()),
            api_token: Some("t".to_string()),
            request_timeout: Some("soon".to_string()),
            ..Default::default()
        };
        assert!(merge_config(ConfigFile::default(), env, no_keyring).is_err());
    }

    #[test]
    fn test_update_keeps_untouched_settings() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("grab-upload").join("config.toml");
        fs::create_dir_all(path.parent().unwrap()).unwrap();
        fs::write(
            &path,
            r#"
base_url = "https://old.example.com/"
default_module = "doc"
part_size = 8388608
concurrency = 8
request_timeout = "45s"
"#,
        )
        .unwrap();

        update_config_at(&path, |config| {
            config.base_url = Some(Url::parse("https://new.example.com/backend/").unwrap());
            config.default_module = None;
        })
        .unwrap();

        let config = read_config_file_at(&path).unwrap();
        assert_eq!(
            config.base_url.unwrap().as_str(),
            "https://new.example.com/backend/"
        );
        assert!(config.default_module.is_none());
        assert_eq!(config.part_size, Some(8 * 1024 * 1024));
        assert_eq!(config.concurrency, Some(8));
        assert_eq!(config.request_timeout.as_deref(), Some("45s"));
    }

    #[test]
    fn test_update_creates_missing_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("config.toml");

        update_config_at(&path, |config| config.concurrency = Some(3)).unwrap();

        let config = read_config_file_at(&path).unwrap();
        assert_eq!(config.concurrency, Some(3));
        assert!(config.base_url.is_none());
    }

    #[test]
    fn test_config_file_round_trips_through_toml() {
        let text = r#"
base_url = "https://api.grabteacher.example/"
default_module = "video"
part_size = 10485760
"#;
        let config: ConfigFile = toml::from_str(text).unwrap();
        assert_eq!(config.default_module.as_deref(), Some("video"));
        assert_eq!(config.part_size, Some(10 * 1024 * 1024));
        assert!(config.concurrency.is_none());
    }
}
