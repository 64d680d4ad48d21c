//! Artifact encryption and checksums.
//!
//! Every artifact is sealed with AES-256-GCM under a per-file key derived by
//! HKDF-SHA256 from the pre-provisioned key file and a random salt. The salt
//! travels in the file header; nothing else about the key is persisted.
//!
//! File layout:
//!
//! ```text
//! magic "DRENC" | version u8 | salt [16] | nonce prefix [8]
//! frame*: len u32 BE | final u8 | ciphertext (len bytes, includes 16-byte tag)
//! ```
//!
//! The nonce of frame `n` is `prefix || n` (u32 BE). The 5-byte frame header
//! is authenticated as associated data. The last frame carries `final = 1`
//! and an empty plaintext, so truncation at a frame boundary is detected.

use crate::utils::errors::{DrError, Result};
use aes_gcm::aead::{Aead, KeyInit, Payload};
use aes_gcm::{Aes256Gcm, Key, Nonce};
use hkdf::Hkdf;
use rand::RngCore;
use sha2::{Digest, Sha256};
use std::fs::File;
use std::io::{BufReader, BufWriter, Read, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;

pub const CIPHER_NAME: &str = "AES-256-GCM";

const MAGIC: &[u8; 5] = b"DRENC";
const FORMAT_VERSION: u8 = 1;
const SALT_LEN: usize = 16;
const NONCE_PREFIX_LEN: usize = 8;
const TAG_LEN: usize = 16;
const HEADER_LEN: usize = MAGIC.len() + 1 + SALT_LEN + NONCE_PREFIX_LEN;
const FRAME_HEADER_LEN: usize = 5;
const FRAME_PLAINTEXT_LEN: usize = 64 * 1024;
const HKDF_INFO: &[u8] = b"dr-backup artifact key v1";

/// Secret loaded from the key file.
#[derive(Clone)]
pub struct KeyMaterial {
    path: PathBuf,
    secret: Arc<Vec<u8>>,
}

impl std::fmt::Debug for KeyMaterial {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("KeyMaterial")
            .field("path", &self.path)
            .field("secret", &"<redacted>")
            .finish()
    }
}

impl KeyMaterial {
    /// Read the key file. The file is opened read-only and never locked.
    pub fn load(path: &Path) -> Result<Self> {
        let secret = std::fs::read(path).map_err(|e| DrError::KeyMissing {
            path: path.to_path_buf(),
            reason: e.to_string(),
        })?;
        if secret.is_empty() {
            return Err(DrError::KeyMissing {
                path: path.to_path_buf(),
                reason: "key file is empty".into(),
            });
        }
        Ok(Self {
            path: path.to_path_buf(),
            secret: Arc::new(secret),
        })
    }

    /// Build key material from raw bytes (restore tooling and tests).
    pub fn from_bytes(reference: impl Into<PathBuf>, secret: Vec<u8>) -> Self {
        Self {
            path: reference.into(),
            secret: Arc::new(secret),
        }
    }

    /// Identifier recorded in manifests instead of the secret.
    pub fn reference(&self) -> String {
        self.path.to_string_lossy().to_string()
    }

    fn derive(&self, salt: &[u8]) -> Result<Aes256Gcm> {
        let hk = Hkdf::<Sha256>::new(Some(salt), &self.secret);
        let mut okm = [0u8; 32];
        hk.expand(HKDF_INFO, &mut okm)
            .map_err(|e| DrError::Encryption(format!("key derivation failed: {}", e)))?;
        Ok(Aes256Gcm::new(Key::<Aes256Gcm>::from_slice(&okm)))
    }
}

/// Encrypts, decrypts and checksums artifact files with one key.
#[derive(Debug, Clone)]
pub struct CryptoEngine {
    key: KeyMaterial,
}

impl CryptoEngine {
    pub fn new(key: KeyMaterial) -> Self {
        Self { key }
    }

    pub fn key_reference(&self) -> String {
        self.key.reference()
    }

    pub fn cipher_name(&self) -> &'static str {
        CIPHER_NAME
    }

    /// Encrypt `raw` into `out`, returning the ciphertext size and checksum.
    pub fn encrypt_file(&self, raw: &Path, out: &Path) -> Result<(u64, String)> {
        let mut reader = BufReader::new(File::open(raw)?);
        let mut writer = BufWriter::new(File::create(out)?);

        let mut salt = [0u8; SALT_LEN];
        let mut prefix = [0u8; NONCE_PREFIX_LEN];
        rand::thread_rng().fill_bytes(&mut salt);
        rand::thread_rng().fill_bytes(&mut prefix);
        let cipher = self.key.derive(&salt)?;

        writer.write_all(MAGIC)?;
        writer.write_all(&[FORMAT_VERSION])?;
        writer.write_all(&salt)?;
        writer.write_all(&prefix)?;

        let mut buf = vec![0u8; FRAME_PLAINTEXT_LEN];
        let mut counter: u32 = 0;
        loop {
            let n = read_full(&mut reader, &mut buf)?;
            if n == 0 {
                break;
            }
            write_frame(&mut writer, &cipher, &prefix, counter, false, &buf[..n])?;
            counter = counter
                .checked_add(1)
                .ok_or_else(|| DrError::Encryption("artifact too large".into()))?;
        }
        write_frame(&mut writer, &cipher, &prefix, counter, true, &[])?;

        let file = writer
            .into_inner()
            .map_err(|e| DrError::Io(e.into_error()))?;
        file.sync_all()?;
        drop(file);

        let size = std::fs::metadata(out)?.len();
        let checksum = checksum_file(out)?;
        Ok((size, checksum))
    }

    /// Decrypt `enc` into `out`. On failure no plaintext is left at `out`.
    pub fn decrypt_file(&self, enc: &Path, out: &Path) -> Result<()> {
        let dir = out.parent().filter(|p| !p.as_os_str().is_empty()).unwrap_or(Path::new("."));
        let mut tmp = tempfile::Builder::new().prefix(".decrypt-").tempfile_in(dir)?;

        {
            let mut writer = BufWriter::new(tmp.as_file_mut());
            self.decrypt_to(enc, &mut writer)?;
            writer.flush()?;
        }

        tmp.persist(out).map_err(|e| e.error)?;
        Ok(())
    }

    /// Decrypt into any writer; used for streaming probes.
    pub fn decrypt_to<W: Write>(&self, enc: &Path, writer: &mut W) -> Result<u64> {
        let mut reader = BufReader::new(File::open(enc)?);

        let mut header = [0u8; HEADER_LEN];
        read_exact_or(&mut reader, &mut header, "file shorter than header")?;
        if &header[..MAGIC.len()] != MAGIC {
            return Err(DrError::Decryption("not an encrypted artifact (bad magic)".into()));
        }
        if header[MAGIC.len()] != FORMAT_VERSION {
            return Err(DrError::Decryption(format!(
                "unsupported format version {}",
                header[MAGIC.len()]
            )));
        }
        let salt = &header[MAGIC.len() + 1..MAGIC.len() + 1 + SALT_LEN];
        let prefix: [u8; NONCE_PREFIX_LEN] = header[MAGIC.len() + 1 + SALT_LEN..]
            .try_into()
            .map_err(|_| DrError::Decryption("malformed header".into()))?;
        let cipher = self.key.derive(salt)?;

        let mut written = 0u64;
        let mut counter: u32 = 0;
        loop {
            let mut frame_header = [0u8; FRAME_HEADER_LEN];
            read_exact_or(&mut reader, &mut frame_header, "truncated artifact (missing final frame)")?;
            let len = u32::from_be_bytes([frame_header[0], frame_header[1], frame_header[2], frame_header[3]]) as usize;
            let is_final = match frame_header[4] {
                0 => false,
                1 => true,
                other => {
                    return Err(DrError::Decryption(format!("invalid frame flag {}", other)));
                }
            };
            if len < TAG_LEN || len > FRAME_PLAINTEXT_LEN + TAG_LEN {
                return Err(DrError::Decryption(format!("invalid frame length {}", len)));
            }

            let mut ciphertext = vec![0u8; len];
            read_exact_or(&mut reader, &mut ciphertext, "truncated frame")?;

            let nonce = frame_nonce(&prefix, counter);
            let plaintext = cipher
                .decrypt(
                    Nonce::from_slice(&nonce),
                    Payload {
                        msg: &ciphertext,
                        aad: &frame_header,
                    },
                )
                .map_err(|_| {
                    DrError::Decryption("authentication failed (wrong key or corrupted data)".into())
                })?;

            writer.write_all(&plaintext)?;
            written += plaintext.len() as u64;

            if is_final {
                break;
            }
            counter = counter
                .checked_add(1)
                .ok_or_else(|| DrError::Decryption("frame counter overflow".into()))?;
        }

        let mut trailing = [0u8; 1];
        if reader.read(&mut trailing)? != 0 {
            return Err(DrError::Decryption("unexpected data after final frame".into()));
        }

        Ok(written)
    }
}

/// Hex SHA-256 of a file's content.
pub fn checksum_file(path: &Path) -> Result<String> {
    let mut reader = BufReader::new(File::open(path)?);
    let mut hasher = Sha256::new();
    let mut buf = vec![0u8; 64 * 1024];
    loop {
        let n = reader.read(&mut buf)?;
        if n == 0 {
            break;
        }
        hasher.update(&buf[..n]);
    }
    Ok(hex::encode(hasher.finalize()))
}

/// Recompute the checksum of `path` and compare it to `expected`.
pub fn verify_checksum(path: &Path, expected: &str) -> Result<()> {
    let actual = checksum_file(path)?;
    if !actual.eq_ignore_ascii_case(expected) {
        return Err(DrError::ChecksumMismatch {
            file: path.display().to_string(),
            expected: expected.to_string(),
            actual,
        });
    }
    Ok(())
}

fn frame_nonce(prefix: &[u8; NONCE_PREFIX_LEN], counter: u32) -> [u8; 12] {
    let mut nonce = [0u8; 12];
    nonce[..NONCE_PREFIX_LEN].copy_from_slice(prefix);
    nonce[NONCE_PREFIX_LEN..].copy_from_slice(&counter.to_be_bytes());
    nonce
}

fn write_frame<W: Write>(
    writer: &mut W,
    cipher: &Aes256Gcm,
    prefix: &[u8; NONCE_PREFIX_LEN],
    counter: u32,
    is_final: bool,
    plaintext: &[u8],
) -> Result<()> {
    let ct_len = (plaintext.len() + TAG_LEN) as u32;
    let mut frame_header = [0u8; FRAME_HEADER_LEN];
    frame_header[..4].copy_from_slice(&ct_len.to_be_bytes());
    frame_header[4] = u8::from(is_final);

    let nonce = frame_nonce(prefix, counter);
    let ciphertext = cipher
        .encrypt(
            Nonce::from_slice(&nonce),
            Payload {
                msg: plaintext,
                aad: &frame_header,
            },
        )
        .map_err(|_| DrError::Encryption("AEAD seal failed".into()))?;

    writer.write_all(&frame_header)?;
    writer.write_all(&ciphertext)?;
    Ok(())
}

/// Fill `buf` as far as the reader allows; returns bytes read (0 = EOF).
fn read_full<R: Read>(reader: &mut R, buf: &mut [u8]) -> std::io::Result<usize> {
    let mut filled = 0;
    while filled < buf.len() {
        match reader.read(&mut buf[filled..]) {
            Ok(0) => break,
            Ok(n) => filled += n,
            Err(e) if e.kind() == std::io::ErrorKind::Interrupted => continue,
            Err(e) => return Err(e),
        }
    }
    Ok(filled)
}

fn read_exact_or<R: Read>(reader: &mut R, buf: &mut [u8], what: &str) -> Result<()> {
    reader.read_exact(buf).map_err(|e| {
        if e.kind() == std::io::ErrorKind::UnexpectedEof {
            DrError::Decryption(what.to_string())
        } else {
            DrError::Io(e)
        }
    })
}
