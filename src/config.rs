use once_cell::sync::Lazy;

fn read_optional_env(key: &str) -> Option<String> {
    std::env::var(key)
        .ok()
        .map(|value| value.trim().to_string())
        .filter(|value| !value.is_empty())
}

fn read_positive<T: std::str::FromStr + PartialOrd + Default>(key: &str, default: T) -> T {
    read_optional_env(key)
        .and_then(|value| value.parse::<T>().ok())
        .filter(|value| *value > T::default())
        .unwrap_or(default)
}

/// Secret used for JWT signing. Must be set via the `JWT_SECRET` env variable.
pub static JWT_SECRET: Lazy<String> =
    Lazy::new(|| std::env::var("JWT_SECRET").expect("JWT_SECRET must be set"));

/// Address the HTTP server should bind to. Defaults to `0.0.0.0`.
pub static BIND_ADDRESS: Lazy<String> =
    Lazy::new(|| std::env::var("BIND_ADDRESS").unwrap_or_else(|_| "0.0.0.0".to_string()));

/// Port the HTTP server should listen on. Defaults to `3000`.
pub static BIND_PORT: Lazy<u16> = Lazy::new(|| {
    std::env::var("BIND_PORT")
        .ok()
        .and_then(|value| value.parse::<u16>().ok())
        .unwrap_or(3000)
});

pub static DATABASE_URL: Lazy<Option<String>> = Lazy::new(|| read_optional_env("DATABASE_URL"));

/// When set to a truthy value, allows the application to continue running even if database
/// migrations fail. Defaults to `false`.
pub static ALLOW_MIGRATION_FAILURE: Lazy<bool> = Lazy::new(|| {
    std::env::var("ALLOW_MIGRATION_FAILURE")
        .ok()
        .map(|value| {
            let normalized = value.trim().to_ascii_lowercase();
            matches!(normalized.as_str(), "1" | "true" | "yes")
        })
        .unwrap_or(false)
});

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StoreBackend {
    Postgres,
    Memory,
}

impl StoreBackend {
    pub fn as_str(&self) -> &'static str {
        match self {
            StoreBackend::Postgres => "postgres",
            StoreBackend::Memory => "memory",
        }
    }
}

fn parse_store_backend() -> StoreBackend {
    match std::env::var("STORE_BACKEND") {
        Ok(raw) => {
            let normalized = raw.trim().to_ascii_lowercase();
            match normalized.as_str() {
                "" | "postgres" => StoreBackend::Postgres,
                "memory" => StoreBackend::Memory,
                other => panic!(
                    "unsupported STORE_BACKEND value '{other}'; expected 'postgres' or 'memory'"
                ),
            }
        }
        Err(_) => StoreBackend::Postgres,
    }
}

/// Persistence backend. `memory` runs against the demo catalog and loses
/// everything on restart.
pub static STORE_BACKEND: Lazy<StoreBackend> = Lazy::new(parse_store_backend);

/// key: provider-config -> external generation API
pub static PROVIDER_API_BASE: Lazy<String> = Lazy::new(|| {
    read_optional_env("PROVIDER_API_BASE")
        .unwrap_or_else(|| "https://api.replicate.com/v1".to_string())
});

pub static PROVIDER_API_TOKEN: Lazy<Option<String>> =
    Lazy::new(|| read_optional_env("PROVIDER_API_TOKEN"));

/// Source label for webhook idempotency keys. Defaults to `replicate`.
pub static PROVIDER_NAME: Lazy<String> =
    Lazy::new(|| read_optional_env("PROVIDER_NAME").unwrap_or_else(|| "replicate".to_string()));

/// Externally reachable base URL of this service. Webhook callbacks are only
/// requested when this resolves to a public host.
pub static PUBLIC_BASE_URL: Lazy<Option<String>> =
    Lazy::new(|| read_optional_env("PUBLIC_BASE_URL"));

/// Shared secret for provider webhook signatures (`whsec_`-prefixed base64 or raw).
pub static WEBHOOK_SIGNING_SECRET: Lazy<Option<String>> =
    Lazy::new(|| read_optional_env("WEBHOOK_SIGNING_SECRET"));

/// key: poll-config -> delay between status polls
pub static POLL_INTERVAL_SECS: Lazy<u64> = Lazy::new(|| read_positive("POLL_INTERVAL_SECS", 5));

/// Delay after a failed status poll.
pub static POLL_RETRY_DELAY_SECS: Lazy<u64> =
    Lazy::new(|| read_positive("POLL_RETRY_DELAY_SECS", 10));

/// Polls before a job is failed for lack of a terminal status.
pub static POLL_MAX_ATTEMPTS: Lazy<u32> = Lazy::new(|| read_positive("POLL_MAX_ATTEMPTS", 360));

/// key: sweeper-config -> scan cadence
pub static SWEEP_INTERVAL_SECS: Lazy<u64> = Lazy::new(|| read_positive("SWEEP_INTERVAL_SECS", 300));

/// Processing jobs older than this are failed and refunded.
pub static STALE_JOB_MAX_AGE_SECS: Lazy<i64> =
    Lazy::new(|| read_positive("STALE_JOB_MAX_AGE_SECS", 1800));

/// Pending jobs that never reached the provider within this window are failed.
pub static PENDING_JOB_MAX_AGE_SECS: Lazy<i64> =
    Lazy::new(|| read_positive("PENDING_JOB_MAX_AGE_SECS", 900));

/// Attempts per outbound provider/storage call.
pub static PROVIDER_MAX_RETRIES: Lazy<u32> = Lazy::new(|| read_positive("PROVIDER_MAX_RETRIES", 3));

/// Submissions allowed per owner per window.
pub static RATE_LIMIT_SUBMISSIONS: Lazy<usize> =
    Lazy::new(|| read_positive("RATE_LIMIT_SUBMISSIONS", 10));

pub static RATE_LIMIT_WINDOW_SECS: Lazy<u64> =
    Lazy::new(|| read_positive("RATE_LIMIT_WINDOW_SECS", 60));

/// key: storage-config -> local object storage
pub static STORAGE_ROOT: Lazy<String> =
    Lazy::new(|| read_optional_env("STORAGE_ROOT").unwrap_or_else(|| "storage".to_string()));

pub static STORAGE_PUBLIC_URL: Lazy<String> = Lazy::new(|| {
    read_optional_env("STORAGE_PUBLIC_URL")
        .unwrap_or_else(|| format!("http://localhost:{}/media", *BIND_PORT))
});

/// Signs output URLs. Falls back to `JWT_SECRET`.
pub static STORAGE_SIGNING_SECRET: Lazy<String> = Lazy::new(|| {
    read_optional_env("STORAGE_SIGNING_SECRET").unwrap_or_else(|| JWT_SECRET.clone())
});

/// Lifetime of signed output URLs handed to clients.
pub static OUTPUT_URL_TTL_SECS: Lazy<i64> =
    Lazy::new(|| read_positive("OUTPUT_URL_TTL_SECS", 3600));
