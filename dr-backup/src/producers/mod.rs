//! Artifact producers: database dumps, filestore archive, config archives.
//!
//! Each producer writes its plaintext intermediates into a scratch directory
//! that is removed when the producer returns (on every path), encrypts the
//! result into the session layout and records the artifact in the manifest.

pub mod archive;
pub mod configs;
pub mod database;
pub mod filestore;

use crate::crypto::CryptoEngine;
use crate::session::manifest::{Artifact, ManifestStore};
use crate::session::SessionLayout;
use crate::tools::CommandRunner;
use crate::utils::errors::{DrError, Result};
use sha2::{Digest, Sha256};
use std::path::Path;
use std::time::Duration;

pub use configs::backup_configs;
pub use database::{backup_database, discover_databases, DatabaseTarget};
pub use filestore::backup_filestore;

/// Everything a producer needs for one session.
pub struct ProducerContext<'a> {
    pub layout: &'a SessionLayout,
    pub crypto: &'a CryptoEngine,
    pub store: &'a ManifestStore,
    pub runner: &'a dyn CommandRunner,
    pub tool_timeout: Duration,
    pub compression_level: i32,
}

impl ProducerContext<'_> {
    /// Scratch directory inside the session root, removed on drop.
    pub fn scratch(&self) -> Result<tempfile::TempDir> {
        Ok(tempfile::Builder::new()
            .prefix(".scratch-")
            .tempdir_in(self.layout.root())?)
    }

    /// Session-relative path `<dir>/<name><extension>` for a new artifact.
    ///
    /// `name` is sanitized; when that lands on an artifact already written in
    /// this session, a short hash of the unsanitized name is appended (and a
    /// counter after it if needed), so no earlier artifact is overwritten.
    pub fn artifact_relative(&self, dir: &str, name: &str, extension: &str) -> String {
        let stem = sanitize_name(name);
        let candidate = format!("{}/{}{}", dir, stem, extension);
        if !self.layout.resolve(&candidate).exists() {
            return candidate;
        }

        let digest = hex::encode(&Sha256::digest(name.as_bytes())[..4]);
        let mut relative = format!("{}/{}-{}{}", dir, stem, digest, extension);
        let mut n = 1;
        while self.layout.resolve(&relative).exists() {
            n += 1;
            relative = format!("{}/{}-{}-{}{}", dir, stem, digest, n, extension);
        }
        relative
    }

    /// Encrypt `plain` to `relative` (inside the session) and describe it.
    pub async fn seal(&self, name: &str, plain: &Path, relative: &str) -> Result<Artifact> {
        let crypto = self.crypto.clone();
        let plain = plain.to_path_buf();
        let out = self.layout.resolve(relative);

        let sealed = {
            let out = out.clone();
            tokio::task::spawn_blocking(move || crypto.encrypt_file(&plain, &out))
                .await
                .map_err(|e| DrError::Encryption(format!("encryption task failed: {}", e)))?
        };

        match sealed {
            Ok((size, checksum)) => Ok(Artifact {
                name: name.to_string(),
                file: relative.to_string(),
                size,
                checksum,
            }),
            Err(e) => {
                // never leave a half-written artifact behind
                let _ = std::fs::remove_file(&out);
                Err(e)
            }
        }
    }
}

/// Reduce an arbitrary name to `[A-Za-z0-9_.-]` for use in file names.
pub fn sanitize_name(name: &str) -> String {
    let cleaned: String = name
        .trim_matches('/')
        .chars()
        .map(|c| match c {
            'a'..='z' | 'A'..='Z' | '0'..='9' | '_' | '-' | '.' => c,
            _ => '_',
        })
        .collect();
    let cleaned = cleaned.trim_start_matches('.').to_string();
    if cleaned.is_empty() {
        "unnamed".to_string()
    } else {
        cleaned
    }
}


#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sanitize_name() {
        assert_eq!(sanitize_name("tenant_a"), "tenant_a");
        assert_eq!(sanitize_name("/etc/nginx/conf.d"), "etc_nginx_conf.d");
        assert_eq!(sanitize_name("weird name;rm -rf"), "weird_name_rm_-rf");
        assert_eq!(sanitize_name("../.."), "_..");
        assert_eq!(sanitize_name("///"), "unnamed");
    }
}
