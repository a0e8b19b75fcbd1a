use std::env;
use std::fs;
use std::path::{Path, PathBuf};

use log::debug;
use serde::Deserialize;

use crate::error::{Error, Result};

/// Range reads are cached in blocks of ten FITS records.
pub const DEFAULT_BLOCK_SIZE: u64 = 2880 * 10;

/// Number of URLs whose block caches are kept between calls.
pub const DEFAULT_CACHE_CAPACITY: usize = 100;

/// How many times a missing or unreadable Parquet index is fetched again.
pub const DEFAULT_INDEX_DOWNLOAD_ATTEMPTS: u32 = 2;

/// Name of the credentials dot-file in the home directory.
pub const CREDENTIALS_FILE_NAME: &str = ".desi_http_user";

/// Environment variable pointing at a JSON [`RetrieverConfig`].
pub const CONFIG_ENV_VAR: &str = "DESI_RETRIEVER_CONFIG";

// ---------------------------------------------------------------------------
// Credentials
// ---------------------------------------------------------------------------

/// HTTP basic-auth credentials for the collaboration data server.
#[derive(Clone, PartialEq, Eq)]
pub struct Credentials {
    pub user: String,
    pub password: String,
}

impl std::fmt::Debug for Credentials {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Credentials")
            .field("user", &self.user)
            .field("password", &"<redacted>")
            .finish()
    }
}

impl Credentials {
    /// Load credentials from `$HOME/.desi_http_user`.
    pub fn load() -> Result<Self> {
        let path = default_credentials_path()?;
        Self::from_file(&path)
    }

    /// Load credentials from a `username:password` file.
    pub fn from_file(path: &Path) -> Result<Self> {
        if !path.exists() {
            return Err(Error::MissingCredentials {
                path: path.display().to_string(),
            });
        }
        let text = fs::read_to_string(path)?;
        Self::parse(&text)
    }

    /// Parse the single `username:password` line of the credentials file.
    pub fn parse(text: &str) -> Result<Self> {
        let line = text.trim_end();
        let (user, password) = line
            .split_once(':')
            .ok_or_else(|| Error::Config("credentials must look like username:password".into()))?;
        if user.is_empty() {
            return Err(Error::Config("empty user name in credentials".into()));
        }
        Ok(Self {
            user: user.to_string(),
            password: password.to_string(),
        })
    }
}

fn home_dir() -> Result<PathBuf> {
    env::var_os("HOME")
        .map(PathBuf::from)
        .ok_or_else(|| Error::Config("HOME is not set".into()))
}

fn default_credentials_path() -> Result<PathBuf> {
    Ok(home_dir()?.join(CREDENTIALS_FILE_NAME))
}

fn default_cache_dir() -> PathBuf {
    if let Some(xdg) = env::var_os("XDG_CACHE_HOME") {
        return PathBuf::from(xdg).join("desi-retriever");
    }
    match env::var_os("HOME") {
        Some(home) => PathBuf::from(home).join(".cache").join("desi-retriever"),
        None => env::temp_dir().join("desi-retriever"),
    }
}

// ---------------------------------------------------------------------------
// RetrieverConfig
// ---------------------------------------------------------------------------

/// Runtime configuration of a [`crate::Retriever`].
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct RetrieverConfig {
    /// Size of each cached byte block for range reads.
    pub block_size: u64,
    /// Number of URLs whose block caches are retained.
    pub cache_capacity: usize,
    /// Read from the NERSC filesystem instead of over HTTPS.
    pub nersc: bool,
    /// Directory holding downloaded Parquet index files.
    pub cache_dir: PathBuf,
    /// Explicit credentials file; `$HOME/.desi_http_user` when unset.
    pub credentials_file: Option<PathBuf>,
    /// Attempts at re-downloading an unreadable Parquet index.
    pub index_download_attempts: u32,
    /// Timeout applied to every HTTP request.
    pub timeout_secs: u64,
}

impl Default for RetrieverConfig {
    fn default() -> Self {
        Self {
            block_size: DEFAULT_BLOCK_SIZE,
            cache_capacity: DEFAULT_CACHE_CAPACITY,
            nersc: false,
            cache_dir: default_cache_dir(),
            credentials_file: None,
            index_download_attempts: DEFAULT_INDEX_DOWNLOAD_ATTEMPTS,
            timeout_secs: 60,
        }
    }
}

impl RetrieverConfig {
    /// Read a JSON config file; missing keys keep their defaults.
    pub fn from_file(path: &Path) -> Result<Self> {
        let text = fs::read_to_string(path)?;
        let config: Self = serde_json::from_str(&text)?;
        config.validate()?;
        Ok(config)
    }

    /// Defaults, overlaid with `$DESI_RETRIEVER_CONFIG` and `$DESI_NERSC`.
    pub fn from_env() -> Result<Self> {
        let mut config = match env::var_os(CONFIG_ENV_VAR) {
            Some(path) => {
                debug!("loading config from {:?}", path);
                Self::from_file(Path::new(&path))?
            }
            None => Self::default(),
        };
        if let Ok(flag) = env::var("DESI_NERSC") {
            config.nersc = matches!(flag.as_str(), "1" | "true" | "yes");
        }
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        if self.block_size == 0 {
            return Err(Error::Config("block_size must be > 0".into()));
        }
        if self.cache_capacity == 0 {
            return Err(Error::Config("cache_capacity must be > 0".into()));
        }
        Ok(())
    }

    /// Load credentials from the configured or default location.
    pub fn load_credentials(&self) -> Result<Credentials> {
        match &self.credentials_file {
            Some(path) => Credentials::from_file(path),
            None => Credentials::load(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_user_and_password() {
        let creds = Credentials::parse("desi:s3cr:et\n").unwrap();
        assert_eq!(creds.user, "desi");
        assert_eq!(creds.password, "s3cr:et");
    }

    #[test]
    fn rejects_line_without_separator() {
        assert!(matches!(
            Credentials::parse("nopassword"),
            Err(Error::Config(_))
        ));
    }

    #[test]
    fn missing_file_explains_format() {
        let dir = tempfile::tempdir().unwrap();
        let err = Credentials::from_file(&dir.path().join("absent")).unwrap_err();
        assert!(err.to_string().contains("username:password"));
    }

    #[test]
    fn partial_json_keeps_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.json");
        fs::write(&path, r#"{ "nersc": true, "cache_capacity": 5 }"#).unwrap();
        let config = RetrieverConfig::from_file(&path).unwrap();
        assert!(config.nersc);
        assert_eq!(config.cache_capacity, 5);
        assert_eq!(config.block_size, DEFAULT_BLOCK_SIZE);
    }

    #[test]
    fn zero_block_size_is_invalid() {
        let config = RetrieverConfig {
            block_size: 0,
            ..Default::default()
        };
        assert!(config.validate().is_err());
    }
}
