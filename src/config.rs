use std::fmt;
use std::path::Path;

use anyhow::{Context, Result};
use serde::Deserialize;

/// Longest validity window S3 accepts for a SigV4 presigned URL (7 days).
pub const MAX_PRESIGNED_URL_TTL: u64 = 604_800;

// ---------------------------------------------------------------------------
// Top-level config
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Default, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default)]
    pub auth: AuthConfig,
    #[serde(default)]
    pub storage: StorageConfig,
}

// ---------------------------------------------------------------------------
// Server
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Deserialize)]
pub struct ServerConfig {
    /// Interface to bind (e.g. `0.0.0.0`).
    #[serde(default = "default_host")]
    pub host: String,
    /// TCP port for the HTTP listener.
    #[serde(default = "default_port")]
    pub port: u16,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
        }
    }
}

fn default_host() -> String {
    "0.0.0.0".to_string()
}

fn default_port() -> u16 {
    3000
}

// ---------------------------------------------------------------------------
// Auth
// ---------------------------------------------------------------------------

#[derive(Clone, Default, Deserialize)]
pub struct AuthConfig {
    /// Shared bearer token every cache read and write must present.
    #[serde(default)]
    pub access_token: String,
}

impl fmt::Debug for AuthConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AuthConfig")
            .field("access_token", &redacted(&self.access_token))
            .finish()
    }
}

// ---------------------------------------------------------------------------
// Storage
// ---------------------------------------------------------------------------

/// Which object store implementation backs the cache.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StorageBackend {
    /// Any S3-compatible service (AWS, MinIO, R2, ...).
    #[default]
    S3,
    /// Process-local map. Contents are lost on restart.
    Memory,
}

/// How `GET /v1/cache/{hash}` obtains the artifact bytes.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DownloadMode {
    /// Issue a presigned GET URL and stream its response back.
    #[default]
    Presigned,
    /// Read the object through the store client.
    Direct,
}

#[derive(Clone, Deserialize)]
pub struct StorageConfig {
    #[serde(default)]
    pub backend: StorageBackend,
    #[serde(default = "default_bucket")]
    pub bucket: String,
    #[serde(default = "default_region")]
    pub region: String,
    /// Custom endpoint for S3-compatible services (e.g. `http://minio:9000`).
    #[serde(default)]
    pub endpoint_url: Option<String>,
    /// Static credentials.  When unset the AWS default provider chain is used.
    #[serde(default)]
    pub access_key_id: Option<String>,
    #[serde(default)]
    pub secret_access_key: Option<String>,
    #[serde(default = "bool_true")]
    pub force_path_style: bool,
    /// Validity (seconds) of presigned download URLs.
    #[serde(default = "default_presigned_url_ttl")]
    pub presigned_url_ttl: u64,
    #[serde(default)]
    pub download_mode: DownloadMode,
    /// Make uploads conditional on the key being absent (`If-None-Match: *`),
    /// closing the race between the existence probe and the write.
    #[serde(default)]
    pub conditional_writes: bool,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            backend: StorageBackend::default(),
            bucket: default_bucket(),
            region: default_region(),
            endpoint_url: None,
            access_key_id: None,
            secret_access_key: None,
            force_path_style: true,
            presigned_url_ttl: default_presigned_url_ttl(),
            download_mode: DownloadMode::default(),
            conditional_writes: false,
        }
    }
}

impl fmt::Debug for StorageConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("StorageConfig")
            .field("backend", &self.backend)
            .field("bucket", &self.bucket)
            .field("region", &self.region)
            .field("endpoint_url", &self.endpoint_url)
            .field("access_key_id", &self.access_key_id)
            .field(
                "secret_access_key",
                &self.secret_access_key.as_deref().map(redacted),
            )
            .field("force_path_style", &self.force_path_style)
            .field("presigned_url_ttl", &self.presigned_url_ttl)
            .field("download_mode", &self.download_mode)
            .field("conditional_writes", &self.conditional_writes)
            .finish()
    }
}

fn default_bucket() -> String {
    "nx-cloud".to_string()
}

fn default_region() -> String {
    "us-east-1".to_string()
}

fn bool_true() -> bool {
    true
}

fn default_presigned_url_ttl() -> u64 {
    // 5 hours
    18_000
}

fn redacted(value: &str) -> &'static str {
    if value.is_empty() {
        "<unset>"
    } else {
        "<redacted>"
    }
}

// ---------------------------------------------------------------------------
// Overrides (command line / environment)
// ---------------------------------------------------------------------------

/// Values supplied through flags or environment variables.  Each one that is
/// present and non-empty replaces the corresponding file setting.
#[derive(Default)]
pub struct Overrides {
    pub host: Option<String>,
    pub port: Option<u16>,
    pub access_token: Option<String>,
    pub region: Option<String>,
    pub bucket: Option<String>,
    pub endpoint_url: Option<String>,
    pub access_key_id: Option<String>,
    pub secret_access_key: Option<String>,
}

impl Overrides {
    fn apply(self, config: &mut Config) {
        fn set(target: &mut String, value: Option<String>) {
            if let Some(value) = value.filter(|v| !v.is_empty()) {
                *target = value;
            }
        }

        fn set_opt(target: &mut Option<String>, value: Option<String>) {
            if let Some(value) = value.filter(|v| !v.is_empty()) {
                *target = Some(value);
            }
        }

        set(&mut config.server.host, self.host);
        if let Some(port) = self.port {
            config.server.port = port;
        }
        set(&mut config.auth.access_token, self.access_token);
        set(&mut config.storage.region, self.region);
        set(&mut config.storage.bucket, self.bucket);
        set_opt(&mut config.storage.endpoint_url, self.endpoint_url);
        set_opt(&mut config.storage.access_key_id, self.access_key_id);
        set_opt(&mut config.storage.secret_access_key, self.secret_access_key);
    }
}

// ---------------------------------------------------------------------------
// Loader
// ---------------------------------------------------------------------------

/// Build the effective [`Config`]: the YAML file at `path` (if any) with
/// `overrides` layered on top, then validated.
pub fn load_config(path: Option<&Path>, overrides: Overrides) -> Result<Config> {
    let mut config = match path {
        Some(path) => read_config_file(path)?,
        None => Config::default(),
    };
    overrides.apply(&mut config);
    validate_config(&config)?;
    Ok(config)
}

fn read_config_file(path: &Path) -> Result<Config> {
    let contents = std::fs::read_to_string(path)
        .with_context(|| format!("failed to read config file: {}", path.display()))?;
    serde_yaml::from_str(&contents)
        .with_context(|| format!("failed to parse config file: {}", path.display()))
}

/// Sanity checks that cannot be expressed purely with serde.
fn validate_config(config: &Config) -> Result<()> {
    let token = &config.auth.access_token;
    anyhow::ensure!(
        !token.is_empty(),
        "an access token is required (set NX_CACHE_ACCESS_TOKEN)"
    );
    anyhow::ensure!(
        !token.contains(char::is_whitespace),
        "the access token must not contain whitespace"
    );
    anyhow::ensure!(
        !config.storage.bucket.is_empty(),
        "storage.bucket must not be empty"
    );
    anyhow::ensure!(
        (1..=MAX_PRESIGNED_URL_TTL).contains(&config.storage.presigned_url_ttl),
        "storage.presigned_url_ttl must be between 1 and {MAX_PRESIGNED_URL_TTL} seconds"
    );
    anyhow::ensure!(
        config.storage.access_key_id.is_some() == config.storage.secret_access_key.is_some(),
        "AWS_ACCESS_KEY_ID and AWS_SECRET_ACCESS_KEY must be set together"
    );
    Ok(())
}

#[cfg(test)]
mod tests {
    use std::io::Write;

    use super::*;

    fn with_token() -> Overrides {
        Overrides {
            access_token: Some("s3cret".to_string()),
            ..Overrides::default()
        }
    }

    fn write_yaml(contents: &str) -> tempfile::NamedTempFile {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        file.write_all(contents.as_bytes()).unwrap();
        file
    }

    #[test]
    fn defaults_match_original_service() {
        let config = load_config(None, with_token()).unwrap();
        assert_eq!(config.server.port, 3000);
        assert_eq!(config.server.host, "0.0.0.0");
        assert_eq!(config.storage.bucket, "nx-cloud");
        assert_eq!(config.storage.region, "us-east-1");
        assert_eq!(config.storage.presigned_url_ttl, 18_000);
        assert_eq!(config.storage.backend, StorageBackend::S3);
        assert_eq!(config.storage.download_mode, DownloadMode::Presigned);
        assert!(config.storage.force_path_style);
        assert!(!config.storage.conditional_writes);
    }

    #[test]
    fn missing_token_is_rejected() {
        let err = load_config(None, Overrides::default()).unwrap_err();
        assert!(err.to_string().contains("NX_CACHE_ACCESS_TOKEN"));
    }

    #[test]
    fn empty_override_does_not_count_as_token() {
        let overrides = Overrides {
            access_token: Some(String::new()),
            ..Overrides::default()
        };
        assert!(load_config(None, overrides).is_err());
    }

    #[test]
    fn token_with_space_is_rejected() {
        let overrides = Overrides {
            access_token: Some("two words".to_string()),
            ..Overrides::default()
        };
        assert!(load_config(None, overrides).is_err());
    }

    #[test]
    fn yaml_file_is_parsed() {
        let file = write_yaml(
            r#"
server:
  port: 8080
auth:
  access_token: from-file
storage:
  backend: memory
  bucket: artifacts
  download_mode: direct
  presigned_url_ttl: 60
  conditional_writes: true
"#,
        );
        let config = load_config(Some(file.path()), Overrides::default()).unwrap();
        assert_eq!(config.server.port, 8080);
        assert_eq!(config.server.host, "0.0.0.0");
        assert_eq!(config.auth.access_token, "from-file");
        assert_eq!(config.storage.backend, StorageBackend::Memory);
        assert_eq!(config.storage.bucket, "artifacts");
        assert_eq!(config.storage.download_mode, DownloadMode::Direct);
        assert_eq!(config.storage.presigned_url_ttl, 60);
        assert!(config.storage.conditional_writes);
    }

    #[test]
    fn overrides_take_precedence_over_file() {
        let file = write_yaml(
            r#"
server:
  host: 10.0.0.1
  port: 8080
auth:
  access_token: from-file
storage:
  bucket: artifacts
"#,
        );
        let overrides = Overrides {
            host: Some("127.0.0.1".to_string()),
            port: Some(9000),
            access_token: Some("from-env".to_string()),
            bucket: Some("other".to_string()),
            endpoint_url: Some("http://localhost:9000".to_string()),
            ..Overrides::default()
        };
        let config = load_config(Some(file.path()), overrides).unwrap();
        assert_eq!(config.server.host, "127.0.0.1");
        assert_eq!(config.server.port, 9000);
        assert_eq!(config.auth.access_token, "from-env");
        assert_eq!(config.storage.bucket, "other");
        assert_eq!(
            config.storage.endpoint_url.as_deref(),
            Some("http://localhost:9000")
        );
    }

    #[test]
    fn unreadable_file_reports_path() {
        let err = load_config(Some(Path::new("/nonexistent/nxcache.yaml")), with_token())
            .unwrap_err();
        assert!(format!("{err:#}").contains("/nonexistent/nxcache.yaml"));
    }

    #[test]
    fn unknown_backend_is_a_parse_error() {
        let file = write_yaml("storage:\n  backend: gcs\n");
        assert!(load_config(Some(file.path()), with_token()).is_err());
    }

    #[test]
    fn presigned_ttl_is_bounded() {
        let zero = write_yaml("storage:\n  presigned_url_ttl: 0\n");
        assert!(load_config(Some(zero.path()), with_token()).is_err());

        let too_long = write_yaml("storage:\n  presigned_url_ttl: 604801\n");
        assert!(load_config(Some(too_long.path()), with_token()).is_err());

        let max = write_yaml("storage:\n  presigned_url_ttl: 604800\n");
        assert!(load_config(Some(max.path()), with_token()).is_ok());
    }

    #[test]
    fn credentials_must_come_in_pairs() {
        let overrides = Overrides {
            access_key_id: Some("minio".to_string()),
            ..with_token()
        };
        assert!(load_config(None, overrides).is_err());

        let overrides = Overrides {
            access_key_id: Some("minio".to_string()),
            secret_access_key: Some("minio123".to_string()),
            ..with_token()
        };
        assert!(load_config(None, overrides).is_ok());
    }

    #[test]
    fn debug_output_redacts_secrets() {
        let overrides = Overrides {
            access_key_id: Some("minio".to_string()),
            secret_access_key: Some("minio123".to_string()),
            ..with_token()
        };
        let config = load_config(None, overrides).unwrap();
        let rendered = format!("{config:?}");
        assert!(!rendered.contains("s3cret"));
        assert!(!rendered.contains("minio123"));
        assert!(rendered.contains("<redacted>"));
    }
}
