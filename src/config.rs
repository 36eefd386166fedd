use std::path::PathBuf;

#[derive(Debug, Clone)]
pub struct AppConfig {
    pub host: String,
    pub port: u16,
    pub db_path: PathBuf,
    pub db_pool_size: u32,
    pub data_dir: PathBuf,

    // Storage provider REST endpoint and credentials. OAuth acquisition
    // happens outside this process; we only consume the resulting token.
    pub drive_api_base: String,
    pub drive_api_key: Option<String>,
    pub drive_access_token: Option<String>,

    pub hash_algorithm: String,
    pub hash_worker_count: usize,
    pub hash_max_file_size: i64,
    pub hash_buffer_size: usize,

    pub processing_batch_size: usize,
    pub processing_worker_count: usize,

    pub deletion_batch_size: usize,
    pub deletion_worker_count: usize,
    pub deletion_parallel: bool,

    pub log_level: String,
    pub rate_limit_per_min: u32,
    pub cors_allowed_origins: Vec<String>,

    pub tls_enabled: bool,
    pub tls_cert_path: Option<PathBuf>,
    pub tls_key_path: Option<PathBuf>,
}

fn env_or<T: std::str::FromStr>(key: &str, default: T) -> T {
    std::env::var(key)
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}

impl AppConfig {
    pub fn from_env() -> Self {
        let _ = dotenvy::dotenv();

        let data_dir = PathBuf::from(std::env::var("DATA_DIR").unwrap_or_else(|_| "./data".into()));
        let db_path = std::env::var("DB_PATH")
            .map(PathBuf::from)
            .unwrap_or_else(|_| data_dir.join("dedupe.db"));

        Self {
            host: std::env::var("HOST").unwrap_or_else(|_| "0.0.0.0".into()),
            port: env_or("PORT", 8080),
            db_path,
            db_pool_size: env_or("DB_POOL_SIZE", 8),
            data_dir,
            drive_api_base: std::env::var("DRIVE_API_BASE")
                .unwrap_or_else(|_| "https://www.googleapis.com/drive/v3".into()),
            drive_api_key: std::env::var("DRIVE_API_KEY").ok().filter(|v| !v.is_empty()),
            drive_access_token: std::env::var("DRIVE_ACCESS_TOKEN").ok().filter(|v| !v.is_empty()),
            hash_algorithm: std::env::var("HASH_ALGORITHM").unwrap_or_else(|_| "sha256".into()),
            hash_worker_count: env_or("HASH_WORKER_COUNT", 4),
            hash_max_file_size: env_or("HASH_MAX_FILE_SIZE", 100 * 1024 * 1024),
            hash_buffer_size: env_or("HASH_BUFFER_SIZE", 64 * 1024),
            processing_batch_size: env_or("PROCESSING_BATCH_SIZE", 100),
            processing_worker_count: env_or("PROCESSING_WORKER_COUNT", 4),
            deletion_batch_size: env_or("DELETION_BATCH_SIZE", 50),
            deletion_worker_count: env_or("DELETION_WORKER_COUNT", 5),
            deletion_parallel: env_or("DELETION_PARALLEL", true),
            log_level: std::env::var("LOG_LEVEL").unwrap_or_else(|_| "info".into()),
            rate_limit_per_min: env_or("RATE_LIMIT_PER_MIN", 60),
            cors_allowed_origins: std::env::var("CORS_ALLOWED_ORIGINS")
                .unwrap_or_else(|_| "*".into())
                .split(',')
                .map(|s| s.trim().to_string())
                .filter(|s| !s.is_empty())
                .collect(),
            tls_enabled: env_or("TLS_ENABLED", false),
            tls_cert_path: std::env::var("TLS_CERT_PATH").ok().map(PathBuf::from),
            tls_key_path: std::env::var("TLS_KEY_PATH").ok().map(PathBuf::from),
        }
    }
}
