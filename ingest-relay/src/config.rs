use serde::Deserialize;
use std::fmt;
use std::path::{Component, Path, PathBuf};
use thiserror::Error;
use url::Url;

pub const DEFAULT_UPSTREAM_URL: &str =
    "https://austin2-production.spotmobile.net/open311/v2/requests.json";
pub const DEFAULT_CREDENTIALS_ENV: &str = "OPEN311_STORAGE_CREDENTIALS";
pub const DEFAULT_ARCHIVE_EXTENSION: &str = "csv";

#[derive(Error, Debug)]
pub enum ValidationError {
    #[error("Port cannot be 0")]
    InvalidPort,

    #[error("Upstream URL must use http or https: {0}")]
    UnsupportedScheme(String),

    #[error("Upstream timeout cannot be 0")]
    InvalidTimeout,

    #[error("Archive bucket name is empty")]
    EmptyBucket,

    #[error("Archive base directory is empty")]
    EmptyBaseDir,

    #[error("Archive container name is empty")]
    EmptyContainer,

    #[error("Archive container must be a single directory name: {0:?}")]
    InvalidContainer(String),

    #[error("Archive extension must be non-empty and alphanumeric: {0:?}")]
    InvalidExtension(String),

    #[error("Credentials environment variable name is empty")]
    EmptyCredentialsEnv,
}

/// Relay configuration
#[derive(Clone, Debug, Deserialize, PartialEq)]
pub struct Config {
    /// Listener for relay requests
    #[serde(default = "Listener::relay_default")]
    pub listener: Listener,
    /// Listener for health and readiness probes
    #[serde(default = "Listener::admin_default")]
    pub admin_listener: Listener,
    #[serde(default)]
    pub upstream: UpstreamConfig,
    /// Archival is disabled when this section is absent.
    pub archive: Option<ArchiveConfig>,
}

impl Config {
    pub fn validate(&self) -> Result<(), ValidationError> {
        self.listener.validate()?;
        self.admin_listener.validate()?;
        self.upstream.validate()?;

        if let Some(archive) = &self.archive {
            archive.validate()?;
        }

        Ok(())
    }

    /// Reads the storage credential from the environment variable named in
    /// the archive config. Call once at startup; the relay never touches the
    /// environment itself.
    pub fn load_credentials_from_env(&mut self) {
        if let Some(ArchiveConfig {
            store:
                ArchiveStoreType::Gcs {
                    credentials_env,
                    credentials,
                    ..
                },
            ..
        }) = &mut self.archive
        {
            *credentials = std::env::var(credentials_env.as_str())
                .ok()
                .filter(|value| !value.is_empty())
                .map(StorageCredentials::new);
        }
    }
}

/// Network listener configuration
#[derive(Clone, Debug, Deserialize, PartialEq)]
pub struct Listener {
    pub host: String,
    pub port: u16,
}

impl Listener {
    fn relay_default() -> Self {
        Listener {
            host: "127.0.0.1".into(),
            port: 7071,
        }
    }

    fn admin_default() -> Self {
        Listener {
            host: "127.0.0.1".into(),
            port: 7072,
        }
    }

    pub fn validate(&self) -> Result<(), ValidationError> {
        if self.port == 0 {
            return Err(ValidationError::InvalidPort);
        }
        Ok(())
    }
}

/// The open311 API the relay fetches pages from.
#[derive(Clone, Debug, Deserialize, PartialEq)]
pub struct UpstreamConfig {
    /// Used when a request does not carry its own `url`.
    #[serde(default = "default_upstream_url")]
    pub url: Url,
    /// Applies to the whole upstream request. No timeout when unset.
    pub timeout_secs: Option<u64>,
}

impl UpstreamConfig {
    pub fn validate(&self) -> Result<(), ValidationError> {
        if !matches!(self.url.scheme(), "http" | "https") {
            return Err(ValidationError::UnsupportedScheme(self.url.to_string()));
        }
        if self.timeout_secs == Some(0) {
            return Err(ValidationError::InvalidTimeout);
        }
        Ok(())
    }
}

impl Default for UpstreamConfig {
    fn default() -> Self {
        UpstreamConfig {
            url: default_upstream_url(),
            timeout_secs: None,
        }
    }
}

fn default_upstream_url() -> Url {
    // Parsing a constant absolute URL cannot fail
    Url::parse(DEFAULT_UPSTREAM_URL).expect("default upstream URL is valid")
}

#[derive(Clone, Debug, Deserialize, PartialEq)]
pub struct ArchiveConfig {
    #[serde(flatten)]
    pub store: ArchiveStoreType,
    /// File extension of archived objects. The content is always JSON.
    #[serde(default = "default_extension")]
    pub extension: String,
}

impl ArchiveConfig {
    pub fn validate(&self) -> Result<(), ValidationError> {
        if self.extension.is_empty() || !self.extension.chars().all(|c| c.is_ascii_alphanumeric())
        {
            return Err(ValidationError::InvalidExtension(self.extension.clone()));
        }

        match &self.store {
            ArchiveStoreType::Filesystem {
                base_dir,
                container,
            } => {
                if base_dir.as_os_str().is_empty() {
                    return Err(ValidationError::EmptyBaseDir);
                }
                if container.is_empty() {
                    return Err(ValidationError::EmptyContainer);
                }
                let mut components = Path::new(container).components();
                if !matches!(
                    (components.next(), components.next()),
                    (Some(Component::Normal(_)), None)
                ) {
                    return Err(ValidationError::InvalidContainer(container.clone()));
                }
            }
            ArchiveStoreType::Gcs {
                bucket,
                credentials_env,
                ..
            } => {
                if bucket.is_empty() {
                    return Err(ValidationError::EmptyBucket);
                }
                if credentials_env.is_empty() {
                    return Err(ValidationError::EmptyCredentialsEnv);
                }
            }
        }

        Ok(())
    }
}

fn default_extension() -> String {
    DEFAULT_ARCHIVE_EXTENSION.into()
}

fn default_credentials_env() -> String {
    DEFAULT_CREDENTIALS_ENV.into()
}

#[derive(Clone, Deserialize, Debug, PartialEq)]
#[serde(rename_all = "lowercase")]
#[serde(tag = "type")]
pub enum ArchiveStoreType {
    Filesystem {
        base_dir: PathBuf,
        /// Directory below `base_dir` that holds the archive keys.
        container: String,
    },
    Gcs {
        bucket: String,
        /// Environment variable holding the service account key (JSON).
        #[serde(default = "default_credentials_env")]
        credentials_env: String,
        /// Overrides the storage API endpoint, e.g. for an emulator.
        endpoint: Option<String>,
        #[serde(skip)]
        credentials: Option<StorageCredentials>,
    },
}

/// Storage credential string. Never printed.
#[derive(Clone, PartialEq)]
pub struct StorageCredentials(String);

impl StorageCredentials {
    pub fn new(value: impl Into<String>) -> Self {
        StorageCredentials(value.into())
    }

    pub fn expose(&self) -> &str {
        &self.0
    }
}

impl fmt::Debug for StorageCredentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("StorageCredentials(<redacted>)")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_minimal_config() {
        let config: Config = serde_yaml::from_str("{}").unwrap();
        config.validate().unwrap();

        assert_eq!(config.listener.port, 7071);
        assert_eq!(config.admin_listener.port, 7072);
        assert_eq!(config.upstream.url.as_str(), DEFAULT_UPSTREAM_URL);
        assert_eq!(config.upstream.timeout_secs, None);
        assert!(config.archive.is_none());
    }

    #[test]
    fn test_parse_gcs_archive() {
        let yaml = r#"
listener:
    host: "0.0.0.0"
    port: 8080
admin_listener:
    host: "127.0.0.1"
    port: 8081
upstream:
    url: "http://open311.internal/requests.json"
    timeout_secs: 10
archive:
    type: gcs
    bucket: open311-raw
    endpoint: "http://localhost:4443"
"#;
        let config: Config = serde_yaml::from_str(yaml).unwrap();
        config.validate().unwrap();

        assert_eq!(config.upstream.timeout_secs, Some(10));
        let archive = config.archive.unwrap();
        assert_eq!(archive.extension, "csv");
        assert_eq!(
            archive.store,
            ArchiveStoreType::Gcs {
                bucket: "open311-raw".into(),
                credentials_env: DEFAULT_CREDENTIALS_ENV.into(),
                endpoint: Some("http://localhost:4443".into()),
                credentials: None,
            }
        );
    }

    #[test]
    fn test_parse_filesystem_archive() {
        let yaml = r#"
archive:
    type: filesystem
    base_dir: /var/lib/open311
    container: open311-raw
    extension: json
"#;
        let config: Config = serde_yaml::from_str(yaml).unwrap();
        config.validate().unwrap();

        let archive = config.archive.unwrap();
        assert_eq!(archive.extension, "json");
        assert_eq!(
            archive.store,
            ArchiveStoreType::Filesystem {
                base_dir: "/var/lib/open311".into(),
                container: "open311-raw".into(),
            }
        );
    }

    #[test]
    fn test_validate_rejects_bad_values() {
        let mut config: Config = serde_yaml::from_str("listener: {host: a, port: 0}").unwrap();
        assert!(matches!(
            config.validate(),
            Err(ValidationError::InvalidPort)
        ));

        config.listener.port = 1;
        config.upstream.url = Url::parse("ftp://open311.internal/").unwrap();
        assert!(matches!(
            config.validate(),
            Err(ValidationError::UnsupportedScheme(_))
        ));

        config.upstream = UpstreamConfig::default();
        config.archive = Some(ArchiveConfig {
            store: ArchiveStoreType::Gcs {
                bucket: "".into(),
                credentials_env: DEFAULT_CREDENTIALS_ENV.into(),
                endpoint: None,
                credentials: None,
            },
            extension: "csv".into(),
        });
        assert!(matches!(config.validate(), Err(ValidationError::EmptyBucket)));

        config.archive = Some(ArchiveConfig {
            store: ArchiveStoreType::Filesystem {
                base_dir: "/tmp".into(),
                container: "open311-raw".into(),
            },
            extension: "../csv".into(),
        });
        assert!(matches!(
            config.validate(),
            Err(ValidationError::InvalidExtension(_))
        ));
    }

    #[test]
    fn test_validate_rejects_bad_container() {
        let archive = |container: &str| ArchiveConfig {
            store: ArchiveStoreType::Filesystem {
                base_dir: "/tmp".into(),
                container: container.into(),
            },
            extension: "csv".into(),
        };

        assert!(matches!(
            archive("").validate(),
            Err(ValidationError::EmptyContainer)
        ));
        for container in ["..", "a/b", "/abs"] {
            assert!(matches!(
                archive(container).validate(),
                Err(ValidationError::InvalidContainer(_))
            ));
        }
        archive("open311-raw").validate().unwrap();
    }

    #[test]
    fn test_filesystem_archive_requires_container() {
        let yaml = r#"
archive:
    type: filesystem
    base_dir: /var/lib/open311
"#;
        assert!(serde_yaml::from_str::<Config>(yaml).is_err());
    }

    #[test]
    fn test_credentials_are_redacted() {
        let credentials = StorageCredentials::new("{\"private_key\": \"secret\"}");
        assert!(!format!("{credentials:?}").contains("secret"));
        assert_eq!(credentials.expose(), "{\"private_key\": \"secret\"}");
    }
}
