use anyhow::{Context, Result};
use base64::Engine;
use base64::engine::general_purpose::STANDARD;
use hmac::{Hmac, Mac};
use sha2::Sha256;
use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use time::OffsetDateTime;
use time::macros::format_description;
use url::form_urlencoded;

const SAS_VERSION: &str = "2022-11-02";
const CLOCK_SKEW: Duration = Duration::from_secs(300);
const MAX_REFRESH_MARGIN: Duration = Duration::from_secs(60);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SasPermission {
    Read,
    Write,
}

impl SasPermission {
    fn as_str(self) -> &'static str {
        match self {
            Self::Read => "r",
            Self::Write => "cw",
        }
    }
}

/// Signs blob-scoped service SAS tokens with the storage account key.
#[derive(Clone)]
pub struct SasSigner {
    account: String,
    key: Arc<Vec<u8>>,
}

impl SasSigner {
    pub fn new(account: &str, account_key: &str) -> Result<Self> {
        let key = STANDARD
            .decode(account_key.trim())
            .context("AZURE_STORAGE_KEY is not valid base64")?;
        Ok(Self {
            account: account.to_string(),
            key: Arc::new(key),
        })
    }

    pub fn account(&self) -> &str {
        &self.account
    }

    /// Query string (without `?`) granting `permission` on one blob.
    pub fn sign(
        &self,
        container: &str,
        blob: &str,
        permission: SasPermission,
        now: OffsetDateTime,
        ttl: Duration,
    ) -> Result<String> {
        let format = format_description!("[year]-[month]-[day]T[hour]:[minute]:[second]Z");
        let start = (now - CLOCK_SKEW).format(format)?;
        let expiry = (now + ttl).format(format)?;
        let resource = format!("/blob/{}/{container}/{blob}", self.account);
        let string_to_sign = [
            permission.as_str(),
            start.as_str(),
            expiry.as_str(),
            resource.as_str(),
            "",
            "",
            "https",
            SAS_VERSION,
            "b",
            "",
            "",
            "",
            "",
            "",
            "",
            "",
        ]
        .join("\n");
        let mut mac = Hmac::<Sha256>::new_from_slice(&self.key)
            .context("storage account key rejected by hmac")?;
        mac.update(string_to_sign.as_bytes());
        let signature = STANDARD.encode(mac.finalize().into_bytes());
        Ok(form_urlencoded::Serializer::new(String::new())
            .append_pair("sv", SAS_VERSION)
            .append_pair("st", &start)
            .append_pair("se", &expiry)
            .append_pair("sr", "b")
            .append_pair("sp", permission.as_str())
            .append_pair("spr", "https")
            .append_pair("sig", &signature)
            .finish())
    }
}

/// Bounded memo of signed tokens. Entries are dropped a little before the
/// token itself expires so callers never receive a token about to lapse.
#[derive(Clone)]
pub struct SasCache {
    signer: SasSigner,
    ttl: Duration,
    capacity: usize,
    inner: Arc<Mutex<SasCacheInner>>,
}

struct SasCacheInner {
    map: HashMap<String, CachedToken>,
    order: VecDeque<String>,
}

struct CachedToken {
    query: String,
    refresh_at: Instant,
}

impl SasCache {
    pub fn new(signer: SasSigner, ttl: Duration, capacity: usize) -> Self {
        Self {
            signer,
            ttl,
            capacity,
            inner: Arc::new(Mutex::new(SasCacheInner {
                map: HashMap::new(),
                order: VecDeque::new(),
            })),
        }
    }

    pub fn account(&self) -> &str {
        self.signer.account()
    }

    pub fn token(&self, container: &str, blob: &str, permission: SasPermission) -> Result<String> {
        let key = format!("{}|{container}/{blob}", permission.as_str());
        let now = Instant::now();
        if self.capacity > 0 {
            let mut inner = self.inner.lock().unwrap_or_else(|err| err.into_inner());
            if let Some(entry) = inner.map.get(&key) {
                if entry.refresh_at > now {
                    return Ok(entry.query.clone());
                }
                inner.map.remove(&key);
                inner.order.retain(|item| item != &key);
            }
        }
        let query = self.signer.sign(
            container,
            blob,
            permission,
            OffsetDateTime::now_utc(),
            self.ttl,
        )?;
        if self.capacity == 0 {
            return Ok(query);
        }
        let margin = (self.ttl / 5).min(MAX_REFRESH_MARGIN);
        let mut inner = self.inner.lock().unwrap_or_else(|err| err.into_inner());
        if inner.map.contains_key(&key) {
            inner.order.retain(|item| item != &key);
        }
        inner.order.push_back(key.clone());
        inner.map.insert(
            key,
            CachedToken {
                query: query.clone(),
                refresh_at: now + self.ttl.saturating_sub(margin),
            },
        );
        while inner.order.len() > self.capacity {
            if let Some(oldest) = inner.order.pop_front() {
                inner.map.remove(&oldest);
            }
        }
        Ok(query)
    }

    #[cfg(test)]
    fn len(&self) -> usize {
        self.inner
            .lock()
            .unwrap_or_else(|err| err.into_inner())
            .map
            .len()
    }
}
