use crate::derivative::{CANONICAL_WIDTHS, quantize_width};
use crate::storage::AzureBlobConfig;
use anyhow::{Context, Result, anyhow};
use ipnet::IpNet;
use std::env;
use std::net::IpAddr;
use std::path::PathBuf;
use std::time::Duration;
use tracing::warn;

const DEFAULT_WATERMARK_TEXT: &str = "© PREVIEW";

#[derive(Debug, Clone)]
pub struct Config {
    pub host: String,
    pub port: u16,
    pub db_path: PathBuf,
    pub blob_backend: BlobBackend,
    pub photos_container: String,
    pub watermarks_container: String,
    pub blob_timeout: Duration,
    pub sas_ttl: Duration,
    pub sas_cache_capacity: usize,
    pub watermark_text: String,
    pub watermark_font_path: Option<PathBuf>,
    pub watermark_font_family: String,
    pub template_version: u32,
    pub jpeg_quality: u8,
    pub max_source_bytes: u64,
    pub max_decoded_pixels: u64,
    pub compose_timeout: Duration,
    pub max_concurrent_compositions: usize,
    pub cdn_cache_seconds: u64,
    pub stale_while_revalidate_seconds: u64,
    pub debug_query_enabled: bool,
    pub rate_limit_per_minute: u64,
    pub rate_limit_burst: u64,
    pub trusted_proxies: Vec<IpNet>,
    pub max_in_flight_requests: usize,
    pub warmup_queue_capacity: usize,
    pub warmup_workers: usize,
    pub warmup_widths: Vec<u32>,
    pub admin_token: Option<String>,
}

#[derive(Debug, Clone)]
pub enum BlobBackend {
    Local { root: PathBuf },
    Azure(AzureBlobConfig),
    Memory,
}

impl BlobBackend {
    pub fn name(&self) -> &'static str {
        match self {
            Self::Local { .. } => "local",
            Self::Azure(_) => "azure",
            Self::Memory => "memory",
        }
    }
}

impl Config {
    pub fn from_env() -> Result<Self> {
        let host = env::var("HOST").unwrap_or_else(|_| "0.0.0.0".to_string());
        let port = parse_u16("PORT", 8080);
        let db_path = PathBuf::from(
            env::var("DB_PATH").unwrap_or_else(|_| "/var/lib/wm/photos.db".to_string()),
        );
        let blob_backend = parse_blob_backend()?;

        let trusted_proxies = parse_trusted_proxies("TRUSTED_PROXY_CIDRS")?;
        warn_on_broad_proxy_ranges(&trusted_proxies);

        let rate_limit_per_minute = parse_u64("RATE_LIMIT_PER_MINUTE", 0);
        let rate_limit_burst = match parse_u64("RATE_LIMIT_BURST", 0) {
            0 => rate_limit_per_minute,
            burst => burst,
        };

        let admin_token = env::var("ADMIN_TOKEN")
            .ok()
            .map(|value| value.trim().to_string())
            .filter(|value| !value.is_empty());

        let watermark_text = env::var("WATERMARK_TEXT")
            .ok()
            .filter(|value| !value.trim().is_empty())
            .unwrap_or_else(|| DEFAULT_WATERMARK_TEXT.to_string());

        Ok(Self {
            host,
            port,
            db_path,
            blob_backend,
            photos_container: parse_container("PHOTOS_CONTAINER", "photos")?,
            watermarks_container: parse_container("WATERMARKS_CONTAINER", "watermarks")?,
            blob_timeout: Duration::from_secs(parse_u64("BLOB_TIMEOUT_SECONDS", 30).max(1)),
            sas_ttl: Duration::from_secs(parse_u64("SAS_TTL_SECONDS", 900).max(60)),
            sas_cache_capacity: parse_usize("SAS_CACHE_CAPACITY", 4096),
            watermark_text,
            watermark_font_path: env::var("WATERMARK_FONT_PATH")
                .ok()
                .filter(|value| !value.trim().is_empty())
                .map(PathBuf::from),
            watermark_font_family: env::var("WATERMARK_FONT_FAMILY")
                .ok()
                .filter(|value| !value.trim().is_empty())
                .unwrap_or_else(|| "sans-serif".to_string()),
            template_version: parse_u32("WATERMARK_TEMPLATE_VERSION", 1),
            jpeg_quality: parse_u32("JPEG_QUALITY", 86).clamp(1, 100) as u8,
            max_source_bytes: parse_u64("MAX_SOURCE_BYTES", 64 * 1024 * 1024),
            max_decoded_pixels: parse_u64("MAX_DECODED_PIXELS", 80_000_000),
            compose_timeout: Duration::from_secs(parse_u64("COMPOSE_TIMEOUT_SECONDS", 45).max(1)),
            max_concurrent_compositions: parse_usize("MAX_CONCURRENT_COMPOSITIONS", 2).max(1),
            cdn_cache_seconds: parse_u64("CDN_CACHE_SECONDS", 2_592_000),
            stale_while_revalidate_seconds: parse_u64("STALE_WHILE_REVALIDATE_SECONDS", 86_400),
            debug_query_enabled: parse_bool("DEBUG_QUERY_ENABLED", false),
            rate_limit_per_minute,
            rate_limit_burst,
            trusted_proxies,
            max_in_flight_requests: parse_usize("MAX_IN_FLIGHT_REQUESTS", 512).max(1),
            warmup_queue_capacity: parse_usize("WARMUP_QUEUE_CAPACITY", 256).max(1),
            warmup_workers: parse_usize("WARMUP_WORKERS", 1).max(1),
            warmup_widths: parse_warmup_widths("WARMUP_WIDTHS")?,
            admin_token,
        })
    }
}

fn parse_blob_backend() -> Result<BlobBackend> {
    let backend = env::var("BLOB_BACKEND")
        .unwrap_or_else(|_| "local".to_string())
        .trim()
        .to_ascii_lowercase();
    match backend.as_str() {
        "local" => Ok(BlobBackend::Local {
            root: PathBuf::from(
                env::var("BLOB_ROOT").unwrap_or_else(|_| "/var/lib/wm/blobs".to_string()),
            ),
        }),
        "azure" => {
            let account = env::var("AZURE_STORAGE_ACCOUNT")
                .context("AZURE_STORAGE_ACCOUNT is required when BLOB_BACKEND=azure")?;
            let account_key = env::var("AZURE_STORAGE_KEY")
                .context("AZURE_STORAGE_KEY is required when BLOB_BACKEND=azure")?;
            if account.trim().is_empty() || account_key.trim().is_empty() {
                return Err(anyhow!("azure storage credentials must not be empty"));
            }
            Ok(BlobBackend::Azure(AzureBlobConfig {
                account: account.trim().to_string(),
                account_key,
                endpoint: env::var("AZURE_BLOB_ENDPOINT")
                    .ok()
                    .map(|value| value.trim().trim_end_matches('/').to_string())
                    .filter(|value| !value.is_empty()),
            }))
        }
        "memory" => {
            warn!("BLOB_BACKEND=memory keeps photos and derivatives in process memory");
            Ok(BlobBackend::Memory)
        }
        other => Err(anyhow!("unknown BLOB_BACKEND {other}")),
    }
}

fn parse_container(key: &str, default: &str) -> Result<String> {
    let value = env::var(key).unwrap_or_else(|_| default.to_string());
    let value = value.trim();
    let valid = (3..=63).contains(&value.len())
        && value
            .chars()
            .all(|ch| ch.is_ascii_lowercase() || ch.is_ascii_digit() || ch == '-');
    if !valid {
        return Err(anyhow!("{key} must be 3-63 lowercase letters, digits or hyphens"));
    }
    Ok(value.to_string())
}

fn parse_warmup_widths(key: &str) -> Result<Vec<u32>> {
    let values = match parse_list_env(key) {
        Some(values) => values,
        None => return Ok(vec![1024, 2048]),
    };
    let mut widths = Vec::new();
    for value in values {
        let width = value
            .parse::<i64>()
            .with_context(|| format!("invalid width in {key}: {value}"))?;
        let width = quantize_width(width);
        if !widths.contains(&width) {
            widths.push(width);
        }
    }
    widths.sort_unstable();
    debug_assert!(widths.iter().all(|width| CANONICAL_WIDTHS.contains(width)));
    Ok(widths)
}

fn parse_u16(key: &str, default: u16) -> u16 {
    env::var(key)
        .ok()
        .and_then(|value| value.trim().parse().ok())
        .unwrap_or(default)
}

fn parse_u32(key: &str, default: u32) -> u32 {
    env::var(key)
        .ok()
        .and_then(|value| value.trim().parse().ok())
        .unwrap_or(default)
}

fn parse_u64(key: &str, default: u64) -> u64 {
    env::var(key)
        .ok()
        .and_then(|value| value.trim().parse().ok())
        .unwrap_or(default)
}

fn parse_usize(key: &str, default: usize) -> usize {
    env::var(key)
        .ok()
        .and_then(|value| value.trim().parse().ok())
        .unwrap_or(default)
}

fn parse_bool(key: &str, default: bool) -> bool {
    env::var(key)
        .ok()
        .and_then(|value| match value.trim().to_ascii_lowercase().as_str() {
            "1" | "true" | "yes" | "on" => Some(true),
            "0" | "false" | "no" | "off" => Some(false),
            _ => None,
        })
        .unwrap_or(default)
}

fn parse_list_env(key: &str) -> Option<Vec<String>> {
    let raw = env::var(key).ok()?;
    if raw.trim_start().starts_with('[') {
        let values: Vec<serde_json::Value> = serde_json::from_str(&raw).ok()?;
        return Some(
            values
                .into_iter()
                .map(|value| match value {
                    serde_json::Value::String(text) => text,
                    other => other.to_string(),
                })
                .collect(),
        );
    }
    let list = raw
        .split(',')
        .map(|item| item.trim().to_string())
        .filter(|item| !item.is_empty())
        .collect::<Vec<_>>();
    if list.is_empty() { None } else { Some(list) }
}

fn parse_trusted_proxies(key: &str) -> Result<Vec<IpNet>> {
    let values = match parse_list_env(key) {
        Some(values) => values,
        None => return Ok(Vec::new()),
    };
    let mut parsed = Vec::new();
    for value in values {
        if let Ok(net) = value.parse::<IpNet>() {
            parsed.push(net);
            continue;
        }
        if let Ok(addr) = value.parse::<IpAddr>() {
            parsed.push(IpNet::from(addr));
            continue;
        }
        return Err(anyhow!("invalid trusted proxy entry: {value}"));
    }
    Ok(parsed)
}

fn warn_on_broad_proxy_ranges(trusted: &[IpNet]) {
    for net in trusted {
        let broad = if net.addr().is_ipv4() {
            net.prefix_len() <= 8
        } else {
            net.prefix_len() <= 32
        };
        if broad {
            warn!(
                cidr = %net,
                "trusted proxy range is very broad; clients may spoof IPs"
            );
        }
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use std::sync::{Mutex, MutexGuard, OnceLock};

    static ENV_LOCK: OnceLock<Mutex<()>> = OnceLock::new();

    pub(crate) fn env_lock() -> MutexGuard<'static, ()> {
        ENV_LOCK
            .get_or_init(|| Mutex::new(()))
            .lock()
            .unwrap_or_else(|err| err.into_inner())
    }

    /// Config used by unit tests across the crate.
    pub(crate) fn test_config() -> Config {
        Config {
            host: "127.0.0.1".to_string(),
            port: 0,
            db_path: PathBuf::from(":memory:"),
            blob_backend: BlobBackend::Memory,
            photos_container: "photos".to_string(),
            watermarks_container: "watermarks".to_string(),
            blob_timeout: Duration::from_secs(5),
            sas_ttl: Duration::from_secs(900),
            sas_cache_capacity: 16,
            watermark_text: "© TEST".to_string(),
            watermark_font_path: None,
            watermark_font_family: "sans-serif".to_string(),
            template_version: 1,
            jpeg_quality: 86,
            max_source_bytes: 16 * 1024 * 1024,
            max_decoded_pixels: 40_000_000,
            compose_timeout: Duration::from_secs(30),
            max_concurrent_compositions: 2,
            cdn_cache_seconds: 2_592_000,
            stale_while_revalidate_seconds: 86_400,
            debug_query_enabled: false,
            rate_limit_per_minute: 0,
            rate_limit_burst: 0,
            trusted_proxies: Vec::new(),
            max_in_flight_requests: 64,
            warmup_queue_capacity: 8,
            warmup_workers: 1,
            warmup_widths: vec![1024, 2048],
            admin_token: None,
        }
    }

    const TOUCHED: &[&str] = &[
        "BLOB_BACKEND",
        "AZURE_STORAGE_ACCOUNT",
        "AZURE_STORAGE_KEY",
        "AZURE_BLOB_ENDPOINT",
        "JPEG_QUALITY",
        "RATE_LIMIT_PER_MINUTE",
        "RATE_LIMIT_BURST",
        "WARMUP_WIDTHS",
        "TRUSTED_PROXY_CIDRS",
        "PHOTOS_CONTAINER",
        "ADMIN_TOKEN",
        "DEBUG_QUERY_ENABLED",
    ];

    fn clear_env() {
        for key in TOUCHED {
            unsafe { env::remove_var(key) };
        }
    }

    #[test]
    fn parse_list_env_csv() {
        let _guard = env_lock();
        unsafe { env::set_var("WARMUP_WIDTHS", "1024, 2048 , ,512") };
        let list = parse_list_env("WARMUP_WIDTHS").unwrap();
        assert_eq!(list, vec!["1024", "2048", "512"]);
        clear_env();
    }

    #[test]
    fn parse_list_env_json() {
        let _guard = env_lock();
        unsafe { env::set_var("WARMUP_WIDTHS", "[1000, \"3000\"]") };
        assert_eq!(parse_warmup_widths("WARMUP_WIDTHS").unwrap(), vec![1024, 3072]);
        clear_env();
    }

    #[test]
    fn defaults_apply_without_env() {
        let _guard = env_lock();
        clear_env();
        let config = Config::from_env().unwrap();
        assert!(matches!(config.blob_backend, BlobBackend::Local { .. }));
        assert_eq!(config.photos_container, "photos");
        assert_eq!(config.watermarks_container, "watermarks");
        assert_eq!(config.jpeg_quality, 86);
        assert_eq!(config.template_version, 1);
        assert_eq!(config.warmup_widths, vec![1024, 2048]);
        assert!(!config.debug_query_enabled);
        assert!(config.admin_token.is_none());
    }

    #[test]
    fn azure_backend_requires_credentials() {
        let _guard = env_lock();
        clear_env();
        unsafe { env::set_var("BLOB_BACKEND", "azure") };
        assert!(Config::from_env().is_err());

        unsafe { env::set_var("AZURE_STORAGE_ACCOUNT", "acct") };
        unsafe { env::set_var("AZURE_STORAGE_KEY", "c2VjcmV0") };
        unsafe { env::set_var("AZURE_BLOB_ENDPOINT", "http://127.0.0.1:10000/acct/") };
        let config = Config::from_env().unwrap();
        match config.blob_backend {
            BlobBackend::Azure(azure) => {
                assert_eq!(azure.account, "acct");
                assert_eq!(azure.endpoint.as_deref(), Some("http://127.0.0.1:10000/acct"));
            }
            other => panic!("unexpected backend {other:?}"),
        }
        clear_env();
    }

    #[test]
    fn rejects_unknown_backend_and_bad_proxies() {
        let _guard = env_lock();
        clear_env();
        unsafe { env::set_var("BLOB_BACKEND", "s3") };
        assert!(Config::from_env().is_err());
        clear_env();
        unsafe { env::set_var("TRUSTED_PROXY_CIDRS", "10.0.0.0/8,not-an-ip") };
        assert!(Config::from_env().is_err());
        clear_env();
    }

    #[test]
    fn clamps_quality_and_defaults_burst_to_rate() {
        let _guard = env_lock();
        clear_env();
        unsafe { env::set_var("JPEG_QUALITY", "250") };
        unsafe { env::set_var("RATE_LIMIT_PER_MINUTE", "120") };
        unsafe { env::set_var("ADMIN_TOKEN", "  ") };
        let config = Config::from_env().unwrap();
        assert_eq!(config.jpeg_quality, 100);
        assert_eq!(config.rate_limit_burst, 120);
        assert!(config.admin_token.is_none());
        clear_env();
    }

    #[test]
    fn container_names_are_validated() {
        let _guard = env_lock();
        clear_env();
        unsafe { env::set_var("PHOTOS_CONTAINER", "Photos_Bucket") };
        assert!(Config::from_env().is_err());
        clear_env();
    }
}
