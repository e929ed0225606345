//! Password-encrypted snapshot container.
//!
//! Layout: `"PLF1" | salt (16) | nonce (12) | ciphertext + tag (16)`.
//! The key is derived with PBKDF2-HMAC-SHA256 over a fresh salt and the
//! payload is sealed with AES-256-GCM under a fresh nonce, so two snapshots
//! of the same database never share bytes.

use aes_gcm::aead::{Aead, KeyInit};
use aes_gcm::{Aes256Gcm, Key, Nonce};
use chrono::Utc;
use rand::RngCore;
use rusqlite::Connection;
use sha2::Sha256;
use std::fs;
use std::path::{Path, PathBuf};
use thiserror::Error;
use zeroize::Zeroizing;

pub const MAGIC: &[u8; 4] = b"PLF1";
pub const SALT_SIZE: usize = 16;
pub const NONCE_SIZE: usize = 12;
pub const TAG_SIZE: usize = 16;
pub const KEY_SIZE: usize = 32;
pub const KDF_ITERATIONS: u32 = 200_000;

/// Bytes preceding the ciphertext.
pub const HEADER_SIZE: usize = MAGIC.len() + SALT_SIZE + NONCE_SIZE;

const SQLITE_HEADER: &[u8] = b"SQLite format 3\0";
const SNAPSHOT_PREFIX: &str = "snapshot_";
const SNAPSHOT_EXT: &str = "plf";

#[derive(Debug, Error)]
pub enum SnapshotError {
    #[error("a password is required")]
    EmptyPassword,

    #[error("not a PLF1 snapshot (bad magic header)")]
    InvalidHeader,

    #[error("snapshot truncated: {len} bytes")]
    Truncated { len: usize },

    /// Wrong password or tampered bytes. No plaintext is ever returned in this case.
    #[error("snapshot decryption failed: wrong password or corrupted data")]
    DecryptionFailed,

    #[error("snapshot encryption failed")]
    EncryptionFailed,

    #[error("decrypted snapshot is not a SQLite database")]
    NotADatabase,

    #[error("refusing to overwrite existing database at {0}")]
    TargetExists(PathBuf),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("database error: {0}")]
    Database(#[from] rusqlite::Error),
}

pub type SnapshotResult<T> = Result<T, SnapshotError>;

type DerivedKey = Zeroizing<[u8; KEY_SIZE]>;

fn derive_key(password: &str, salt: &[u8]) -> SnapshotResult<DerivedKey> {
    if password.is_empty() {
        return Err(SnapshotError::EmptyPassword);
    }
    let mut key = Zeroizing::new([0u8; KEY_SIZE]);
    pbkdf2::pbkdf2_hmac::<Sha256>(password.as_bytes(), salt, KDF_ITERATIONS, &mut key[..]);
    Ok(key)
}

fn seal(key: &DerivedKey, nonce: &[u8; NONCE_SIZE], plaintext: &[u8]) -> SnapshotResult<Vec<u8>> {
    let cipher = Aes256Gcm::new(Key::<Aes256Gcm>::from_slice(&key[..]));
    cipher
        .encrypt(Nonce::from_slice(nonce), plaintext)
        .map_err(|_| SnapshotError::EncryptionFailed)
}

fn open(key: &DerivedKey, nonce: &[u8], ciphertext: &[u8]) -> SnapshotResult<Vec<u8>> {
    let cipher = Aes256Gcm::new(Key::<Aes256Gcm>::from_slice(&key[..]));
    cipher
        .decrypt(Nonce::from_slice(nonce), ciphertext)
        .map_err(|_| SnapshotError::DecryptionFailed)
}

/// Splits a container into `(salt, nonce, ciphertext)` after checking the header.
fn split(container: &[u8]) -> SnapshotResult<(&[u8], &[u8], &[u8])> {
    if container.len() < MAGIC.len() || &container[..MAGIC.len()] != MAGIC {
        return Err(SnapshotError::InvalidHeader);
    }
    if container.len() < HEADER_SIZE + TAG_SIZE {
        return Err(SnapshotError::Truncated {
            len: container.len(),
        });
    }
    let (salt, rest) = container[MAGIC.len()..].split_at(SALT_SIZE);
    let (nonce, ciphertext) = rest.split_at(NONCE_SIZE);
    Ok((salt, nonce, ciphertext))
}

/// Encrypt `plaintext` into a self-contained PLF1 container.
pub fn encrypt(plaintext: &[u8], password: &str) -> SnapshotResult<Vec<u8>> {
    let mut rng = rand::thread_rng();
    let mut salt = [0u8; SALT_SIZE];
    rng.fill_bytes(&mut salt);
    let mut nonce = [0u8; NONCE_SIZE];
    rng.fill_bytes(&mut nonce);

    let key = derive_key(password, &salt)?;
    let ciphertext = seal(&key, &nonce, plaintext)?;

    let mut out = Vec::with_capacity(HEADER_SIZE + ciphertext.len());
    out.extend_from_slice(MAGIC);
    out.extend_from_slice(&salt);
    out.extend_from_slice(&nonce);
    out.extend_from_slice(&ciphertext);
    Ok(out)
}

/// Decrypt a container produced by [`encrypt`].
pub fn decrypt(container: &[u8], password: &str) -> SnapshotResult<Vec<u8>> {
    let (salt, nonce, ciphertext) = split(container)?;
    let key = derive_key(password, salt)?;
    open(&key, nonce, ciphertext)
}

/// Cheap structural check that needs no password. Says nothing about authenticity.
pub fn is_container(bytes: &[u8]) -> bool {
    split(bytes).is_ok()
}

/// Take a consistent copy of the SQLite database at `db_path` and write it to
/// `out_path` as an encrypted container. Returns the container size.
pub fn export_database(db_path: &Path, out_path: &Path, password: &str) -> SnapshotResult<u64> {
    if password.is_empty() {
        return Err(SnapshotError::EmptyPassword);
    }
    let plaintext = read_consistent_copy(db_path)?;
    let container = encrypt(&plaintext, password)?;
    write_atomically(out_path, &container)?;
    tracing::info!(
        source = %db_path.display(),
        target = %out_path.display(),
        bytes = container.len(),
        "exported encrypted snapshot"
    );
    Ok(container.len() as u64)
}

/// Decrypt the container at `container_path` into a SQLite file at `db_path`.
///
/// The target is only replaced after the container authenticates, so a wrong
/// password or corrupted file leaves the filesystem untouched.
pub fn import_database(
    container_path: &Path,
    db_path: &Path,
    password: &str,
    force: bool,
) -> SnapshotResult<u64> {
    let container = fs::read(container_path)?;
    restore_database(&container, db_path, password, force)
}

/// Same as [`import_database`] for a container already held in memory.
pub fn restore_database(
    container: &[u8],
    db_path: &Path,
    password: &str,
    force: bool,
) -> SnapshotResult<u64> {
    if db_path.exists() && !force {
        return Err(SnapshotError::TargetExists(db_path.to_path_buf()));
    }
    let plaintext = Zeroizing::new(decrypt(container, password)?);
    if !plaintext.starts_with(SQLITE_HEADER) {
        return Err(SnapshotError::NotADatabase);
    }
    write_atomically(db_path, &plaintext)?;
    tracing::info!(target = %db_path.display(), bytes = plaintext.len(), "restored snapshot");
    Ok(plaintext.len() as u64)
}

/// Serialise a live database through `VACUUM INTO` so concurrent writers
/// cannot leave a torn image behind.
pub fn read_consistent_copy(db_path: &Path) -> SnapshotResult<Vec<u8>> {
    let conn = Connection::open(db_path)?;
    vacuum_into_bytes(&conn)
}

pub(crate) fn vacuum_into_bytes(conn: &Connection) -> SnapshotResult<Vec<u8>> {
    let scratch = tempfile::tempdir()?;
    let copy_path = scratch.path().join("snapshot.db");
    conn.execute("VACUUM INTO ?1", [copy_path.to_string_lossy().as_ref()])?;
    Ok(fs::read(&copy_path)?)
}

fn write_atomically(path: &Path, bytes: &[u8]) -> SnapshotResult<()> {
    let parent = match path.parent() {
        Some(p) if !p.as_os_str().is_empty() => p.to_path_buf(),
        _ => PathBuf::from("."),
    };
    fs::create_dir_all(&parent)?;
    let mut tmp = tempfile::NamedTempFile::new_in(&parent)?;
    std::io::Write::write_all(&mut tmp, bytes)?;
    tmp.as_file().sync_all()?;
    tmp.persist(path).map_err(|e| SnapshotError::Io(e.error))?;
    Ok(())
}

/// Store `container` in `dir` as `snapshot_<timestamp>.plf`, keeping only the
/// newest `keep` snapshot files.
pub fn write_rotated(dir: &Path, container: &[u8], keep: usize) -> SnapshotResult<PathBuf> {
    fs::create_dir_all(dir)?;
    let name = format!(
        "{SNAPSHOT_PREFIX}{}.{SNAPSHOT_EXT}",
        Utc::now().format("%Y%m%dT%H%M%S%.6fZ")
    );
    let path = dir.join(name);
    write_atomically(&path, container)?;

    let mut existing = list_snapshots(dir)?;
    if existing.len() > keep {
        let excess = existing.len() - keep;
        for old in existing.drain(..excess) {
            if let Err(e) = fs::remove_file(&old) {
                tracing::warn!(path = %old.display(), error = %e, "failed to remove old snapshot");
            }
        }
    }
    Ok(path)
}

/// Snapshot files in `dir`, oldest first.
pub fn list_snapshots(dir: &Path) -> SnapshotResult<Vec<PathBuf>> {
    let mut files = Vec::new();
    if !dir.exists() {
        return Ok(files);
    }
    for entry in fs::read_dir(dir)? {
        let path = entry?.path();
        let is_snapshot = path.is_file()
            && path.extension().is_some_and(|ext| ext == SNAPSHOT_EXT)
            && path
                .file_name()
                .and_then(|n| n.to_str())
                .is_some_and(|n| n.starts_with(SNAPSHOT_PREFIX));
        if is_snapshot {
            files.push(path);
        }
    }
    // Timestamped names sort chronologically.
    files.sort();
    Ok(files)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_round_trip() {
        let plaintext = b"bookings, invoices and equipment".to_vec();
        let container = encrypt(&plaintext, "correct-horse").unwrap();
        assert_eq!(&container[..4], MAGIC);
        assert_eq!(container.len(), HEADER_SIZE + plaintext.len() + TAG_SIZE);
        assert_eq!(decrypt(&container, "correct-horse").unwrap(), plaintext);
    }

    #[test]
    fn test_round_trip_empty_plaintext() {
        let container = encrypt(b"", "pw").unwrap();
        assert_eq!(container.len(), HEADER_SIZE + TAG_SIZE);
        assert!(decrypt(&container, "pw").unwrap().is_empty());
    }

    #[test]
    fn test_wrong_password_fails() {
        let container = encrypt(b"secret data", "correct-horse").unwrap();
        let err = decrypt(&container, "wrong-horse").unwrap_err();
        assert!(matches!(err, SnapshotError::DecryptionFailed));
    }

    #[test]
    fn test_encrypt_is_not_deterministic() {
        let a = encrypt(b"same bytes", "pw").unwrap();
        let b = encrypt(b"same bytes", "pw").unwrap();
        assert_ne!(a, b);
        assert_ne!(a[4..4 + SALT_SIZE], b[4..4 + SALT_SIZE]);
    }

    #[test]
    fn test_every_ciphertext_bit_flip_is_detected() {
        let plaintext = b"0123456789abcdef";
        let container = encrypt(plaintext, "pw").unwrap();
        let (salt, nonce, ciphertext) = split(&container).unwrap();
        // Derive once; the KDF is deliberately slow.
        let key = derive_key("pw", salt).unwrap();

        for byte in 0..ciphertext.len() {
            for bit in 0..8 {
                let mut tampered = ciphertext.to_vec();
                tampered[byte] ^= 1 << bit;
                assert!(
                    matches!(open(&key, nonce, &tampered), Err(SnapshotError::DecryptionFailed)),
                    "flip at byte {byte} bit {bit} was not detected"
                );
            }
        }
    }

    #[test]
    fn test_tampered_container_fails_end_to_end() {
        let container = encrypt(b"payload", "pw").unwrap();

        let mut body_flip = container.clone();
        let last = body_flip.len() - 1;
        body_flip[last] ^= 0x01;
        assert!(matches!(
            decrypt(&body_flip, "pw"),
            Err(SnapshotError::DecryptionFailed)
        ));

        let mut nonce_flip = container.clone();
        nonce_flip[MAGIC.len() + SALT_SIZE] ^= 0x80;
        assert!(matches!(
            decrypt(&nonce_flip, "pw"),
            Err(SnapshotError::DecryptionFailed)
        ));
    }

    #[test]
    fn test_bad_header_and_truncation() {
        let container = encrypt(b"payload", "pw").unwrap();

        let mut bad_magic = container.clone();
        bad_magic[0] = b'X';
        assert!(matches!(
            decrypt(&bad_magic, "pw"),
            Err(SnapshotError::InvalidHeader)
        ));

        assert!(matches!(
            decrypt(&container[..HEADER_SIZE + 3], "pw"),
            Err(SnapshotError::Truncated { .. })
        ));
        assert!(matches!(decrypt(b"PL", "pw"), Err(SnapshotError::InvalidHeader)));
        assert!(is_container(&container));
        assert!(!is_container(&bad_magic));
    }

    #[test]
    fn test_empty_password_rejected() {
        assert!(matches!(encrypt(b"x", ""), Err(SnapshotError::EmptyPassword)));
    }

    #[test]
    fn test_rotation_keeps_newest() {
        let dir = tempfile::tempdir().unwrap();
        let mut written = Vec::new();
        for i in 0..4u8 {
            written.push(write_rotated(dir.path(), &[i], 2).unwrap());
            std::thread::sleep(std::time::Duration::from_millis(2));
        }
        let remaining = list_snapshots(dir.path()).unwrap();
        assert_eq!(remaining, written[2..].to_vec());
    }
}
