//! Generation tag carried as a comment on the managed table.
//!
//! Format: `palisade:v<version>:c=<apply count>:h=<config hash>`. The
//! integrity monitor and the apply counter both read it back from the live
//! ruleset.

use sha2::{Digest, Sha256};
use thiserror::Error;

use crate::BRAND;

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct GenerationTag {
    pub version: String,
    pub apply_count: u64,
    pub config_hash: String,
}

#[derive(Debug, Error)]
pub enum ParseError {
    #[error("not a palisade generation tag")]
    WrongBrand,
    #[error("malformed generation tag: {0}")]
    Malformed(String),
}

impl GenerationTag {
    pub fn new(apply_count: u64, config_hash: impl Into<String>) -> Self {
        GenerationTag {
            version: env!("CARGO_PKG_VERSION").to_string(),
            apply_count,
            config_hash: config_hash.into(),
        }
    }

    pub fn render(&self) -> String {
        format!(
            "{}:v{}:c={}:h={}",
            BRAND, self.version, self.apply_count, self.config_hash
        )
    }

    pub fn parse(comment: &str) -> Result<Self, ParseError> {
        let mut parts = comment.split(':');
        let brand = parts.next().unwrap_or_default();
        if brand != BRAND {
            return Err(ParseError::WrongBrand);
        }
        let version = parts
            .next()
            .and_then(|p| p.strip_prefix('v'))
            .ok_or_else(|| ParseError::Malformed(comment.to_string()))?;
        let count = parts
            .next()
            .and_then(|p| p.strip_prefix("c="))
            .and_then(|c| c.parse::<u64>().ok())
            .ok_or_else(|| ParseError::Malformed(comment.to_string()))?;
        let hash = parts
            .next()
            .and_then(|p| p.strip_prefix("h="))
            .ok_or_else(|| ParseError::Malformed(comment.to_string()))?;
        Ok(GenerationTag {
            version: version.to_string(),
            apply_count: count,
            config_hash: hash.to_string(),
        })
    }
}

/// First 8 hex chars of SHA-256 over the stable string form of the config.
pub fn config_hash(stable_summary: &str) -> String {
    let digest = Sha256::digest(stable_summary.as_bytes());
    let mut out = String::with_capacity(8);
    for byte in digest.iter().take(4) {
        out.push_str(&format!("{:02x}", byte));
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn round_trip() {
        let tag = GenerationTag::new(17, "ab12cd34");
        let parsed = GenerationTag::parse(&tag.render()).unwrap();
        assert_eq!(parsed, tag);
    }

    #[test]
    fn rejects_foreign_comment() {
        assert!(matches!(
            GenerationTag::parse("someone-else:v1:c=0:h=00000000"),
            Err(ParseError::WrongBrand)
        ));
        assert!(GenerationTag::parse("palisade:bogus").is_err());
    }

    #[test]
    fn hash_is_eight_hex_chars() {
        let h = config_hash("zones=lan,wan");
        assert_eq!(h.len(), 8);
        assert!(h.chars().all(|c| c.is_ascii_hexdigit()));
        assert_eq!(h, config_hash("zones=lan,wan"));
    }
}
