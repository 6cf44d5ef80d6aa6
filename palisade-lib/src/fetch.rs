//! Threat-list download with an integrity-checked disk cache.
//!
//! Every URL gets a stable cache key (SHA-256 of the URL). The cache holds
//! the raw body next to a sidecar with fetch time, ETag, size and checksum.
//! A refresh failure is never fatal: a fresh-enough cached copy wins, and
//! existing set contents stay in place when even that is gone.

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use thiserror::Error;

use std::io;
use std::net::IpAddr;
use std::path::{Path, PathBuf};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use tokio::fs;

/// Total budget for one list download.
pub const FETCH_TIMEOUT: Duration = Duration::from_secs(60);
/// Hard cap on the decoded body.
pub const MAX_BODY_BYTES: u64 = 10 * 1024 * 1024;
/// Cached copies older than this are not served.
pub const CACHE_TTL: Duration = Duration::from_secs(24 * 60 * 60);

#[derive(Debug, Error)]
pub enum Error {
    #[error("HTTP error fetching `{url}`: {cause}")]
    Http { url: String, cause: String },
    #[error("list body exceeds {MAX_BODY_BYTES} bytes")]
    TooLarge,
    #[error("cached copy failed integrity check")]
    CacheIntegrity,
    #[error("no usable cached copy")]
    NoCache,
    #[error("unknown well-known list `{0}`")]
    UnknownList(String),
    #[error("IO error: {0}")]
    IO(#[from] io::Error),
}

/// Sidecar metadata stored next to each cached body.
#[derive(Debug, Serialize, Deserialize)]
struct Sidecar {
    cached_at: u64,
    etag: Option<String>,
    size: u64,
    checksum: String,
}

/// Curated upstream lists addressable by name instead of URL.
const WELL_KNOWN: &[(&str, &str)] = &[
    ("spamhaus-drop", "https://www.spamhaus.org/drop/drop.txt"),
    ("spamhaus-edrop", "https://www.spamhaus.org/drop/edrop.txt"),
    ("firehol-level1", "https://iplists.firehol.org/files/firehol_level1.netset"),
    ("blocklist-de", "https://lists.blocklist.de/lists/all.txt"),
    ("cinsscore-badguys", "https://cinsscore.com/list/ci-badguys.txt"),
];

pub fn well_known_url(name: &str) -> Result<&'static str, Error> {
    WELL_KNOWN
        .iter()
        .find(|(list, _)| *list == name)
        .map(|(_, url)| *url)
        .ok_or_else(|| Error::UnknownList(name.to_string()))
}

pub struct Fetcher {
    client: reqwest::Client,
    cache_dir: PathBuf,
}

impl Fetcher {
    pub fn new(cache_dir: impl Into<PathBuf>) -> Self {
        let client = reqwest::Client::builder()
            .timeout(FETCH_TIMEOUT)
            .gzip(true)
            .build()
            .unwrap_or_default();
        Fetcher {
            client,
            cache_dir: cache_dir.into(),
        }
    }

    /// Fetch a list, preferring the network and falling back to a fresh
    /// cached copy. Returns the validated entries.
    pub async fn fetch(&self, url: &str) -> Result<Vec<String>, Error> {
        url::Url::parse(url).map_err(|e| Error::Http {
            url: url.to_string(),
            cause: e.to_string(),
        })?;
        match self.download(url).await {
            Ok((body, etag)) => {
                let entries = parse_list(&body);
                if let Err(error) = self.store(url, &body, etag).await {
                    tracing::warn!(%url, error = ?error, "failed writing list cache");
                }
                Ok(entries)
            }
            Err(error) => {
                tracing::warn!(%url, error = %error, "list refresh failed, trying cache");
                self.read_cached(url).await.map_err(|_| error)
            }
        }
    }

    /// Serve from cache only; refuses stale or corrupted copies.
    pub async fn read_cached(&self, url: &str) -> Result<Vec<String>, Error> {
        let (body_path, sidecar_path) = self.paths(url);
        let sidecar_raw = fs::read(&sidecar_path).await.map_err(|_| Error::NoCache)?;
        let sidecar: Sidecar = serde_json::from_slice(&sidecar_raw).map_err(|_| Error::NoCache)?;

        let age = now_epoch().saturating_sub(sidecar.cached_at);
        if age > CACHE_TTL.as_secs() {
            return Err(Error::NoCache);
        }

        let body = fs::read(&body_path).await.map_err(|_| Error::NoCache)?;
        if hex_digest(&body) != sidecar.checksum {
            // corrupted entry; drop it so the next refresh starts clean
            let _ = fs::remove_file(&body_path).await;
            let _ = fs::remove_file(&sidecar_path).await;
            return Err(Error::CacheIntegrity);
        }
        Ok(parse_list(&String::from_utf8_lossy(&body)))
    }

    async fn download(&self, url: &str) -> Result<(String, Option<String>), Error> {
        let mut request = self.client.get(url);
        if let Ok(Some(etag)) = self.cached_etag(url).await {
            request = request.header(reqwest::header::IF_NONE_MATCH, etag);
        }
        let response = request.send().await.map_err(|e| Error::Http {
            url: url.to_string(),
            cause: e.to_string(),
        })?;

        if response.status() == reqwest::StatusCode::NOT_MODIFIED {
            if let Ok(body) = self.read_cached_body(url).await {
                let etag = self.cached_etag(url).await.unwrap_or(None);
                return Ok((body, etag));
            }
        }

        let response = response.error_for_status().map_err(|e| Error::Http {
            url: url.to_string(),
            cause: e.to_string(),
        })?;
        if let Some(length) = response.content_length() {
            if length > MAX_BODY_BYTES {
                return Err(Error::TooLarge);
            }
        }
        let etag = response
            .headers()
            .get(reqwest::header::ETAG)
            .and_then(|v| v.to_str().ok())
            .map(str::to_string);
        let body = response.bytes().await.map_err(|e| Error::Http {
            url: url.to_string(),
            cause: e.to_string(),
        })?;
        if body.len() as u64 > MAX_BODY_BYTES {
            return Err(Error::TooLarge);
        }
        Ok((String::from_utf8_lossy(&body).into_owned(), etag))
    }

    async fn store(&self, url: &str, body: &str, etag: Option<String>) -> Result<(), Error> {
        fs::create_dir_all(&self.cache_dir).await?;
        let (body_path, sidecar_path) = self.paths(url);
        fs::write(&body_path, body).await?;
        let sidecar = Sidecar {
            cached_at: now_epoch(),
            etag,
            size: body.len() as u64,
            checksum: hex_digest(body.as_bytes()),
        };
        fs::write(&sidecar_path, serde_json::to_vec(&sidecar).unwrap_or_default()).await?;
        Ok(())
    }

    async fn cached_etag(&self, url: &str) -> Result<Option<String>, Error> {
        let (_, sidecar_path) = self.paths(url);
        let Ok(raw) = fs::read(&sidecar_path).await else {
            return Ok(None);
        };
        let sidecar: Sidecar = serde_json::from_slice(&raw).map_err(|_| Error::NoCache)?;
        Ok(sidecar.etag)
    }

    async fn read_cached_body(&self, url: &str) -> Result<String, Error> {
        let (body_path, _) = self.paths(url);
        Ok(fs::read_to_string(&body_path).await.map_err(|_| Error::NoCache)?)
    }

    fn paths(&self, url: &str) -> (PathBuf, PathBuf) {
        let key = cache_key(url);
        (
            self.cache_dir.join(&key),
            self.cache_dir.join(format!("{key}.meta")),
        )
    }

    pub fn cache_dir(&self) -> &Path {
        &self.cache_dir
    }
}

/// Stable cache key: hex SHA-256 of the URL.
pub fn cache_key(url: &str) -> String {
    hex_digest(url.as_bytes())
}

fn hex_digest(data: &[u8]) -> String {
    let digest = Sha256::digest(data);
    let mut out = String::with_capacity(64);
    for byte in digest {
        out.push_str(&format!("{byte:02x}"));
    }
    out
}

fn now_epoch() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0)
}

/// Parse one list body: `#` and `;` open comments to end of line, blanks
/// are skipped, every entry must be an IP or CIDR. Invalid entries are
/// dropped with a warning rather than failing the whole list.
pub fn parse_list(body: &str) -> Vec<String> {
    let mut entries = Vec::new();
    let mut skipped = 0usize;
    for line in body.lines() {
        let line = match line.find(['#', ';']) {
            Some(idx) => &line[..idx],
            None => line,
        };
        let entry = line.trim();
        if entry.is_empty() {
            continue;
        }
        if entry.parse::<IpAddr>().is_ok() || entry.parse::<cidr::IpCidr>().is_ok() {
            entries.push(entry.to_string());
        } else {
            skipped += 1;
        }
    }
    if skipped > 0 {
        tracing::warn!(skipped, "ignored invalid list entries");
    }
    entries
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_comments_blanks_and_validates() {
        let body = "\
# full line comment
192.0.2.1
198.51.100.0/24 ; trailing comment

not-an-address
2001:db8::/32
10.0.0.1# glued comment
";
        let entries = parse_list(body);
        assert_eq!(
            entries,
            vec!["192.0.2.1", "198.51.100.0/24", "2001:db8::/32", "10.0.0.1"]
        );
    }

    #[test]
    fn cache_key_is_stable_and_distinct() {
        let a = cache_key("https://example.test/list");
        assert_eq!(a, cache_key("https://example.test/list"));
        assert_ne!(a, cache_key("https://example.test/other"));
        assert_eq!(a.len(), 64);
    }

    #[tokio::test]
    async fn cache_round_trip_and_corruption() {
        let tmp = tempfile::tempdir().unwrap();
        let fetcher = Fetcher::new(tmp.path());
        let url = "https://example.test/list";

        fetcher.store(url, "192.0.2.1\n192.0.2.2\n", None).await.unwrap();
        let entries = fetcher.read_cached(url).await.unwrap();
        assert_eq!(entries.len(), 2);

        // flip a byte in the body; the checksum must catch it
        let (body_path, _) = fetcher.paths(url);
        fs::write(&body_path, "192.0.2.9\n").await.unwrap();
        assert!(matches!(fetcher.read_cached(url).await, Err(Error::CacheIntegrity)));
        // the corrupted entry was invalidated
        assert!(matches!(fetcher.read_cached(url).await, Err(Error::NoCache)));
    }

    #[test]
    fn well_known_names_resolve() {
        assert!(well_known_url("firehol-level1").is_ok());
        assert!(matches!(well_known_url("nope"), Err(Error::UnknownList(_))));
    }
}
