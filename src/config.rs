use std::env;
use std::str::FromStr;
use std::time::Duration;

#[derive(Debug, Clone)]
pub struct Config {
    pub server: ServerConfig,
    pub store: StoreConfig,
    pub database: DatabaseConfig,
    pub blob: BlobConfig,
    pub minio: MinioConfig,
    pub jwt: JwtConfig,
    pub messaging: MessagingConfig,
}

#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
    pub environment: String,
    pub max_upload_bytes: usize,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StoreBackend {
    Memory,
    Postgres,
}

#[derive(Debug, Clone)]
pub struct StoreConfig {
    pub backend: StoreBackend,
    /// Upper bound for a single store call before it counts as a transient failure.
    pub timeout: Duration,
    pub max_retries: u32,
    pub backoff: Duration,
}

#[derive(Debug, Clone)]
pub struct DatabaseConfig {
    pub host: String,
    pub port: u16,
    pub user: String,
    pub password: String,
    pub database: String,
    pub ssl_mode: String,
    pub max_connections: u32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BlobBackend {
    Memory,
    Minio,
}

#[derive(Debug, Clone)]
pub struct BlobConfig {
    pub backend: BlobBackend,
}

#[derive(Debug, Clone)]
pub struct MinioConfig {
    pub endpoint: String,
    pub access_key: String,
    pub secret_key: String,
    pub region: String,
    pub avatars_bucket: String,
    pub attachments_bucket: String,
    pub public_url: Option<String>,
}

#[derive(Debug, Clone)]
pub struct JwtConfig {
    pub secret: String,
    pub access_token_ttl: Duration,
    pub issuer: String,
}

#[derive(Debug, Clone)]
pub struct MessagingConfig {
    pub typing_ttl: Duration,
    pub typing_sweep_interval: Duration,
    /// Outbound events buffered per live session before fan-out starts dropping.
    pub session_buffer: usize,
    pub actor_idle_timeout: Duration,
    pub page_size: usize,
}

impl Default for MessagingConfig {
    fn default() -> Self {
        Self {
            typing_ttl: Duration::from_millis(2000),
            typing_sweep_interval: Duration::from_millis(500),
            session_buffer: 256,
            actor_idle_timeout: Duration::from_secs(300),
            page_size: 50,
        }
    }
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            backend: StoreBackend::Memory,
            timeout: Duration::from_millis(5000),
            max_retries: 3,
            backoff: Duration::from_millis(50),
        }
    }
}

fn parsed<T: FromStr>(key: &str, default: T) -> T {
    env::var(key)
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}

fn millis(key: &str, default: u64) -> Duration {
    Duration::from_millis(parsed(key, default))
}

impl Config {
    pub fn load() -> Self {
        dotenvy::dotenv().ok();

        Config {
            server: ServerConfig {
                host: env::var("SERVER_HOST").unwrap_or_else(|_| "0.0.0.0".to_string()),
                port: parsed("SERVER_PORT", 8080),
                environment: env::var("ENVIRONMENT").unwrap_or_else(|_| "development".to_string()),
                max_upload_bytes: parsed("MAX_UPLOAD_BYTES", 25 * 1024 * 1024),
            },
            store: StoreConfig {
                backend: match env::var("STORE_BACKEND").as_deref() {
                    Ok("postgres") => StoreBackend::Postgres,
                    _ => StoreBackend::Memory,
                },
                timeout: millis("STORE_TIMEOUT_MS", 5000),
                max_retries: parsed("STORE_MAX_RETRIES", 3),
                backoff: millis("STORE_BACKOFF_MS", 50),
            },
            database: DatabaseConfig {
                host: env::var("DB_HOST").unwrap_or_else(|_| "localhost".to_string()),
                port: parsed("DB_PORT", 5432),
                user: env::var("DB_USER").unwrap_or_else(|_| "postgres".to_string()),
                password: env::var("DB_PASSWORD").unwrap_or_else(|_| "postgres".to_string()),
                database: env::var("DB_NAME").unwrap_or_else(|_| "chat_core".to_string()),
                ssl_mode: env::var("DB_SSL_MODE").unwrap_or_else(|_| "disable".to_string()),
                max_connections: parsed("DB_MAX_CONNS", 25),
            },
            blob: BlobConfig {
                backend: match env::var("BLOB_BACKEND").as_deref() {
                    Ok("minio") => BlobBackend::Minio,
                    _ => BlobBackend::Memory,
                },
            },
            minio: MinioConfig {
                endpoint: env::var("MINIO_ENDPOINT")
                    .unwrap_or_else(|_| "http://localhost:9000".to_string()),
                access_key: env::var("MINIO_ACCESS_KEY")
                    .unwrap_or_else(|_| "minioadmin".to_string()),
                secret_key: env::var("MINIO_SECRET_KEY")
                    .unwrap_or_else(|_| "minioadmin".to_string()),
                region: env::var("MINIO_REGION").unwrap_or_else(|_| "us-east-1".to_string()),
                avatars_bucket: "avatars".to_string(),
                attachments_bucket: "attachments".to_string(),
                public_url: env::var("MINIO_PUBLIC_URL").ok(),
            },
            jwt: JwtConfig {
                secret: env::var("JWT_SECRET")
                    .unwrap_or_else(|_| "super-secret-jwt-key-change-in-production".to_string()),
                access_token_ttl: Duration::from_secs(parsed("JWT_ACCESS_TOKEN_TTL", 15 * 60)),
                issuer: env::var("JWT_ISSUER").unwrap_or_else(|_| "chat-core".to_string()),
            },
            messaging: MessagingConfig {
                typing_ttl: millis("TYPING_TTL_MS", 2000),
                typing_sweep_interval: millis("TYPING_SWEEP_MS", 500),
                session_buffer: parsed("SESSION_BUFFER", 256),
                actor_idle_timeout: Duration::from_secs(parsed("ACTOR_IDLE_SECS", 300)),
                page_size: parsed("MESSAGE_PAGE_SIZE", 50),
            },
        }
    }

    /// Configuration used by tests and local tooling: in-memory collaborators, fixed secret.
    pub fn for_tests() -> Self {
        Config {
            server: ServerConfig {
                host: "127.0.0.1".to_string(),
                port: 0,
                environment: "test".to_string(),
                max_upload_bytes: 1024 * 1024,
            },
            store: StoreConfig {
                timeout: Duration::from_millis(500),
                backoff: Duration::from_millis(1),
                ..StoreConfig::default()
            },
            database: DatabaseConfig {
                host: "localhost".to_string(),
                port: 5432,
                user: "postgres".to_string(),
                password: "postgres".to_string(),
                database: "chat_core_test".to_string(),
                ssl_mode: "disable".to_string(),
                max_connections: 1,
            },
            blob: BlobConfig {
                backend: BlobBackend::Memory,
            },
            minio: MinioConfig {
                endpoint: "http://localhost:9000".to_string(),
                access_key: "minioadmin".to_string(),
                secret_key: "minioadmin".to_string(),
                region: "us-east-1".to_string(),
                avatars_bucket: "avatars".to_string(),
                attachments_bucket: "attachments".to_string(),
                public_url: None,
            },
            jwt: JwtConfig {
                secret: "test-secret".to_string(),
                access_token_ttl: Duration::from_secs(60 * 60),
                issuer: "chat-core".to_string(),
            },
            messaging: MessagingConfig::default(),
        }
    }

    pub fn database_url(&self) -> String {
        format!(
            "postgres://{}:{}@{}:{}/{}?sslmode={}",
            self.database.user,
            self.database.password,
            self.database.host,
            self.database.port,
            self.database.database,
            self.database.ssl_mode
        )
    }
}
