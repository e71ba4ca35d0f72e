use serde::Deserialize;
use std::time::Duration;

/// Main configuration for the feed engine
#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    /// Feed configuration
    #[serde(default)]
    pub feed: FeedConfig,
    /// Record database configuration
    pub database: DatabaseConfig,
    /// Media storage configuration
    pub media: MediaConfig,
}

/// Feed-level configuration
#[derive(Debug, Clone, Deserialize)]
pub struct FeedConfig {
    /// Collection holding post records
    #[serde(default = "default_collection")]
    pub collection: String,
}

/// Record database configuration
#[derive(Debug, Clone, Deserialize)]
pub struct DatabaseConfig {
    /// PostgreSQL connection URL
    pub url: String,
    /// Maximum number of connections in the pool
    #[serde(default = "default_max_connections")]
    pub max_connections: u32,
    /// Minimum number of connections in the pool
    #[serde(default = "default_min_connections")]
    pub min_connections: u32,
    /// Connection timeout in seconds
    #[serde(default = "default_connect_timeout_secs")]
    pub connect_timeout_secs: u64,
    /// Idle connection timeout in seconds
    #[serde(default = "default_idle_timeout_secs")]
    pub idle_timeout_secs: u64,
    /// Run migrations on startup
    #[serde(default = "default_run_migrations")]
    pub run_migrations: bool,
}

/// Media storage configuration
#[derive(Debug, Clone, Deserialize)]
pub struct MediaConfig {
    /// S3 bucket name for post and profile media
    pub bucket: String,
    /// AWS region
    #[serde(default = "default_region")]
    pub region: String,
    /// Custom endpoint URL (for MinIO, LocalStack, etc.)
    pub endpoint_url: Option<String>,
    /// Force path-style access (required for MinIO)
    #[serde(default)]
    pub force_path_style: bool,
    /// Presigned URL expiration in seconds
    #[serde(default = "default_url_expiry_secs")]
    pub url_expiry_secs: u64,
}

// Default value functions
fn default_collection() -> String {
    "posts".to_string()
}

fn default_max_connections() -> u32 {
    10
}

fn default_min_connections() -> u32 {
    2
}

fn default_connect_timeout_secs() -> u64 {
    30
}

fn default_idle_timeout_secs() -> u64 {
    600
}

fn default_run_migrations() -> bool {
    true
}

fn default_region() -> String {
    "us-east-1".to_string()
}

fn default_url_expiry_secs() -> u64 {
    3600
}

impl Config {
    /// Load configuration from environment and config files
    pub fn load() -> anyhow::Result<Self> {
        let config = config::Config::builder()
            // Start with default values
            .set_default("feed.collection", "posts")?
            // Add config file if present
            .add_source(config::File::with_name("config/feed").required(false))
            .add_source(config::File::with_name("/etc/feed-engine/feed").required(false))
            // Override with environment variables
            // FEED__DATABASE__URL -> database.url
            .add_source(
                config::Environment::with_prefix("FEED")
                    .separator("__")
                    .try_parsing(true),
            )
            .build()?;

        config.try_deserialize().map_err(Into::into)
    }

    /// Get database connection timeout as Duration
    pub fn db_connect_timeout(&self) -> Duration {
        Duration::from_secs(self.database.connect_timeout_secs)
    }

    /// Get database idle timeout as Duration
    pub fn db_idle_timeout(&self) -> Duration {
        Duration::from_secs(self.database.idle_timeout_secs)
    }

    /// Get presigned URL expiry as Duration
    pub fn media_url_expiry(&self) -> Duration {
        Duration::from_secs(self.media.url_expiry_secs)
    }
}

impl Default for FeedConfig {
    fn default() -> Self {
        Self {
            collection: default_collection(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_values() {
        assert_eq!(default_collection(), "posts");
        assert_eq!(default_max_connections(), 10);
        assert_eq!(default_url_expiry_secs(), 3600);
        assert!(default_run_migrations());
    }

    #[test]
    fn test_minimal_config_deserializes_with_defaults() {
        let raw = config::Config::builder()
            .set_override("database.url", "postgres://localhost/feed")
            .unwrap()
            .set_override("media.bucket", "feed-media")
            .unwrap()
            .build()
            .unwrap();

        let config: Config = raw.try_deserialize().unwrap();
        assert_eq!(config.feed.collection, "posts");
        assert_eq!(config.database.max_connections, 10);
        assert_eq!(config.database.connect_timeout_secs, 30);
        assert!(config.database.run_migrations);
        assert_eq!(config.media.region, "us-east-1");
        assert!(config.media.endpoint_url.is_none());
        assert!(!config.media.force_path_style);
        assert_eq!(config.db_connect_timeout(), Duration::from_secs(30));
        assert_eq!(config.db_idle_timeout(), Duration::from_secs(600));
        assert_eq!(config.media_url_expiry(), Duration::from_secs(3600));
    }
}
