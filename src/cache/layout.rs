//! Fingerprint grammar, hashing, and the on-disk fan-out layout.

use std::path::{Path, PathBuf};

use md5::{Digest, Md5};
use once_cell::sync::Lazy;
use regex::Regex;

static CHAPTER_RE: Lazy<Regex> = Lazy::new(|| Regex::new(r"^[0-9a-f]{32}$").unwrap());
static FILENAME_RE: Lazy<Regex> = Lazy::new(|| Regex::new(r"^.+\.(jpg|jpeg|png|gif)$").unwrap());

/// A parsed, shape-validated cache request: `kind`, `chapter`, `filename`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Fingerprint {
    pub kind: String,
    pub chapter: String,
    pub filename: String,
}

impl Fingerprint {
    /// Parses and shape-validates a `kind`/`chapter`/`filename` triple.
    /// Returns `None` if any segment fails the grammar in the data model.
    pub fn parse(kind: &str, chapter: &str, filename: &str) -> Option<Self> {
        if kind != "data" && kind != "data-saver" {
            return None;
        }
        if !CHAPTER_RE.is_match(chapter) {
            return None;
        }
        if !FILENAME_RE.is_match(filename) {
            return None;
        }
        Some(Self {
            kind: kind.to_string(),
            chapter: chapter.to_string(),
            filename: filename.to_string(),
        })
    }

    /// Canonical string form: the cache key.
    pub fn canonical(&self) -> String {
        format!("/{}/{}/{}", self.kind, self.chapter, self.filename)
    }

    /// 128-bit MD5 hash of the canonical form, hex-encoded. Not a security
    /// primitive — used only as an opaque on-disk filename.
    pub fn hash(&self) -> String {
        hash_key(&self.canonical())
    }
}

/// Hashes an arbitrary cache key the same way fingerprints are hashed.
pub fn hash_key(key: &str) -> String {
    let mut hasher = Md5::new();
    hasher.update(key.as_bytes());
    hex::encode(hasher.finalize())
}

/// Returns the directory and full file path derived from a hash, under
/// `<cache_dir>/<h0h1>/<h2h3>/<h4h5>/<hash>`.
pub fn path_from_hash(cache_dir: &Path, hash: &str) -> (PathBuf, PathBuf) {
    let dir = cache_dir
        .join(&hash[0..2])
        .join(&hash[2..4])
        .join(&hash[4..6]);
    let file = dir.join(hash);
    (dir, file)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_valid_fingerprint() {
        let fp = Fingerprint::parse("data", "0123456789abcdef0123456789abcdef", "1.jpg").unwrap();
        assert_eq!(fp.canonical(), "/data/0123456789abcdef0123456789abcdef/1.jpg");
    }

    #[test]
    fn rejects_bad_kind() {
        assert!(Fingerprint::parse("video", "0123456789abcdef0123456789abcdef", "1.jpg").is_none());
    }

    #[test]
    fn rejects_bad_chapter() {
        assert!(Fingerprint::parse("data", "not-hex", "1.jpg").is_none());
    }

    #[test]
    fn rejects_bad_extension() {
        assert!(Fingerprint::parse("data", "0123456789abcdef0123456789abcdef", "1.bmp").is_none());
    }

    #[test]
    fn fan_out_path_uses_first_six_hex_chars() {
        let hash = hash_key("/data/0123456789abcdef0123456789abcdef/1.jpg");
        let (dir, file) = path_from_hash(Path::new("/cache"), &hash);
        assert_eq!(
            dir,
            Path::new("/cache").join(&hash[0..2]).join(&hash[2..4]).join(&hash[4..6])
        );
        assert_eq!(file, dir.join(&hash));
    }
}
