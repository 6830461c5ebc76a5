//! Persisted session state
//!
//! A session is one JSON document, `session.json`, committed with a
//! write-temp / fsync / rename sequence so a crash leaves either the old
//! state or the complete new record. The store holds an exclusive lock on
//! `session.lock` for as long as it is open.
//!
//! Older clients wrote one file per field. Those files are still read (all
//! five or none) and can be folded into `session.json` with
//! [`SessionStore::migrate_legacy`].

use std::fs::{self, File, OpenOptions};
use std::io::{self, Write};
use std::path::{Path, PathBuf};

use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use crypto::hashes::fingerprint;
use crypto::ml_kem::{ML_KEM_PUBLIC_KEY_LEN, ML_KEM_SECRET_KEY_LEN, MIN_SHARED_SECRET_LEN};
use crypto::traits::KemKeyPair;
use crypto::MlKemKeyPair;
use fs2::FileExt;
use rand::{rngs::OsRng, RngCore};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};
use zeroize::{Zeroize, Zeroizing};

use crate::error::PersistenceError;
use crate::types::{Identity, KeyPair, SessionRecord};

pub const SESSION_FILE: &str = "session.json";
pub const LOCK_FILE: &str = "session.lock";
const TMP_PREFIX: &str = "session.tmp-";
const RECORD_VERSION: u32 = 1;

const LEGACY_ALIAS: &str = "alias.txt";
const LEGACY_IDC: &str = "idc.txt";
const LEGACY_PUBLIC_KEY: &str = "publicKey.txt";
const LEGACY_PRIVATE_KEY: &str = "privateKey.txt";
const LEGACY_SHARED_SECRET: &str = "decryptedSharedSecret.txt";

/// Per-field files written by older clients
pub const LEGACY_FILES: [&str; 5] = [
    LEGACY_ALIAS,
    LEGACY_IDC,
    LEGACY_PUBLIC_KEY,
    LEGACY_PRIVATE_KEY,
    LEGACY_SHARED_SECRET,
];

type Result<T> = std::result::Result<T, PersistenceError>;

#[derive(Serialize, Deserialize)]
struct StoredSession {
    version: u32,
    alias: String,
    idc: String,
    public_key: String,
    private_key: String,
    shared_secret: String,
}

impl Drop for StoredSession {
    fn drop(&mut self) {
        self.private_key.zeroize();
        self.shared_secret.zeroize();
    }
}

/// What the state directory currently holds
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum SessionPresence {
    Absent,
    Present,
    Corrupted(String),
}

pub struct SessionStore {
    dir: PathBuf,
    lock: File,
}

impl SessionStore {
    /// Open (creating if needed) the state directory and take its lock.
    pub fn open<P: AsRef<Path>>(dir: P) -> Result<Self> {
        let dir = dir.as_ref().to_path_buf();
        fs::create_dir_all(&dir)?;
        let lock_path = dir.join(LOCK_FILE);
        let lock = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(&lock_path)?;
        lock.try_lock_exclusive()
            .map_err(|_| PersistenceError::Locked(lock_path))?;
        let store = Self { dir, lock };
        store.sweep_temp_files();
        Ok(store)
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn session_path(&self) -> PathBuf {
        self.dir.join(SESSION_FILE)
    }

    /// Classify the persisted state without failing.
    pub fn probe(&self) -> SessionPresence {
        if !self.session_path().exists() && self.legacy_present().is_empty() {
            return SessionPresence::Absent;
        }
        match self.load() {
            Ok(_) => SessionPresence::Present,
            Err(PersistenceError::NotFound) => SessionPresence::Absent,
            Err(PersistenceError::Corrupted(reason)) => SessionPresence::Corrupted(reason),
            Err(other) => SessionPresence::Corrupted(other.to_string()),
        }
    }

    /// True only when a complete, consistent record is persisted.
    pub fn exists(&self) -> bool {
        self.probe() == SessionPresence::Present
    }

    pub fn load(&self) -> Result<SessionRecord> {
        let path = self.session_path();
        let record = if path.exists() {
            let bytes = Zeroizing::new(fs::read(&path)?);
            let stored: StoredSession = serde_json::from_slice(&bytes)
                .map_err(|err| PersistenceError::Corrupted(format!("{SESSION_FILE}: {err}")))?;
            if stored.version != RECORD_VERSION {
                return Err(PersistenceError::Corrupted(format!(
                    "unsupported session version {}",
                    stored.version
                )));
            }
            decode(&stored)?
        } else {
            self.load_legacy()?
        };
        check_record(&record)?;
        debug!(
            alias = %record.alias,
            idc = %record.idc,
            public_key = %fingerprint(&record.key_pair.public_key),
            "loaded session record"
        );
        Ok(record)
    }

    /// Commit a new record. Existing records are never overwritten.
    pub fn save(&self, record: &SessionRecord) -> Result<()> {
        let path = self.session_path();
        if path.exists() || !self.legacy_present().is_empty() {
            return Err(PersistenceError::AlreadyExists(path));
        }
        self.commit(record)?;
        info!(
            alias = %record.alias,
            idc = %record.idc,
            path = %path.display(),
            "session record committed"
        );
        Ok(())
    }

    /// Import a complete legacy per-field session into `session.json`.
    ///
    /// Returns `false` when there is nothing to migrate.
    pub fn migrate_legacy(&self) -> Result<bool> {
        if self.session_path().exists() {
            return Ok(false);
        }
        let present = self.legacy_present();
        if present.is_empty() {
            return Ok(false);
        }
        let record = self.load_legacy()?;
        check_record(&record)?;
        self.commit(&record)?;
        for name in present {
            fs::remove_file(self.dir.join(name))?;
        }
        info!(alias = %record.alias, idc = %record.idc, "migrated legacy session files");
        Ok(true)
    }

    /// Delete all persisted session state. Returns `true` if anything was removed.
    pub fn forget(&self) -> Result<bool> {
        let mut removed = false;
        let session = self.session_path();
        if session.exists() {
            fs::remove_file(&session)?;
            removed = true;
        }
        for name in self.legacy_present() {
            fs::remove_file(self.dir.join(name))?;
            removed = true;
        }
        if removed {
            sync_dir(&self.dir)?;
            warn!(dir = %self.dir.display(), "persisted session deleted");
        }
        Ok(removed)
    }

    fn commit(&self, record: &SessionRecord) -> Result<()> {
        check_record(record)?;
        let stored = encode(record);
        let bytes = Zeroizing::new(serde_json::to_vec_pretty(&stored)?);

        let mut tmp_suffix = [0u8; 8];
        OsRng.fill_bytes(&mut tmp_suffix);
        let tmp_id = u64::from_le_bytes(tmp_suffix);
        let tmp = self.dir.join(format!("{TMP_PREFIX}{tmp_id:016x}"));

        let written = (|| -> io::Result<()> {
            let mut options = OpenOptions::new();
            options.write(true).create_new(true);
            // Holds the private key and shared secret: owner read/write only.
            #[cfg(unix)]
            std::os::unix::fs::OpenOptionsExt::mode(&mut options, 0o600);
            let mut file = options.open(&tmp)?;
            file.write_all(&bytes)?;
            file.sync_all()?;
            fs::rename(&tmp, self.session_path())?;
            sync_dir(&self.dir)
        })();
        if let Err(err) = written {
            let _ = fs::remove_file(&tmp);
            return Err(err.into());
        }
        Ok(())
    }

    fn legacy_present(&self) -> Vec<&'static str> {
        LEGACY_FILES
            .iter()
            .copied()
            .filter(|name| self.dir.join(name).exists())
            .collect()
    }

    fn load_legacy(&self) -> Result<SessionRecord> {
        let present = self.legacy_present();
        if present.is_empty() {
            return Err(PersistenceError::NotFound);
        }
        if present.len() != LEGACY_FILES.len() {
            let missing: Vec<&str> = LEGACY_FILES
                .iter()
                .copied()
                .filter(|name| !present.contains(name))
                .collect();
            return Err(PersistenceError::Corrupted(format!(
                "partial legacy session, missing {}",
                missing.join(", ")
            )));
        }
        let read = |name: &str| -> Result<Zeroizing<String>> {
            Ok(Zeroizing::new(fs::read_to_string(self.dir.join(name))?))
        };
        let stored = StoredSession {
            version: RECORD_VERSION,
            alias: read(LEGACY_ALIAS)?.trim().to_string(),
            idc: read(LEGACY_IDC)?.trim().to_string(),
            public_key: read(LEGACY_PUBLIC_KEY)?.trim().to_string(),
            private_key: read(LEGACY_PRIVATE_KEY)?.trim().to_string(),
            shared_secret: read(LEGACY_SHARED_SECRET)?.trim().to_string(),
        };
        decode(&stored)
    }

    fn sweep_temp_files(&self) {
        let Ok(entries) = fs::read_dir(&self.dir) else {
            return;
        };
        for entry in entries.flatten() {
            let name = entry.file_name();
            if name.to_string_lossy().starts_with(TMP_PREFIX) {
                debug!(file = ?name, "removing stale session temp file");
                let _ = fs::remove_file(entry.path());
            }
        }
    }
}

impl Drop for SessionStore {
    fn drop(&mut self) {
        let _ = FileExt::unlock(&self.lock);
    }
}

fn encode(record: &SessionRecord) -> StoredSession {
    StoredSession {
        version: RECORD_VERSION,
        alias: record.alias.as_str().to_string(),
        idc: record.idc.clone(),
        public_key: STANDARD.encode(&record.key_pair.public_key),
        private_key: STANDARD.encode(record.key_pair.private_key.as_slice()),
        shared_secret: STANDARD.encode(record.shared_secret.as_slice()),
    }
}

fn decode(stored: &StoredSession) -> Result<SessionRecord> {
    let field = |name: &str, value: &str| -> Result<Zeroizing<Vec<u8>>> {
        STANDARD
            .decode(value)
            .map(Zeroizing::new)
            .map_err(|err| PersistenceError::Corrupted(format!("{name} is not base64: {err}")))
    };
    let public_key = field("public key", &stored.public_key)?;
    Ok(SessionRecord {
        alias: Identity::new(stored.alias.clone()),
        idc: stored.idc.clone(),
        shared_secret: field("shared secret", &stored.shared_secret)?,
        key_pair: KeyPair {
            public_key: public_key.to_vec(),
            private_key: field("private key", &stored.private_key)?,
        },
    })
}

/// Field presence, decoded lengths, and public/private key agreement.
fn check_record(record: &SessionRecord) -> Result<()> {
    let corrupt = |msg: String| Err(PersistenceError::Corrupted(msg));
    if record.alias.as_str().is_empty() {
        return corrupt("alias is empty".into());
    }
    if record.idc.is_empty() {
        return corrupt("idc is empty".into());
    }
    let public = &record.key_pair.public_key;
    if public.len() != ML_KEM_PUBLIC_KEY_LEN {
        return corrupt(format!(
            "public key is {} bytes, expected {ML_KEM_PUBLIC_KEY_LEN}",
            public.len()
        ));
    }
    let private = &record.key_pair.private_key;
    if private.len() != ML_KEM_SECRET_KEY_LEN {
        return corrupt(format!(
            "private key is {} bytes, expected {ML_KEM_SECRET_KEY_LEN}",
            private.len()
        ));
    }
    if record.shared_secret.len() < MIN_SHARED_SECRET_LEN {
        return corrupt(format!(
            "shared secret is {} bytes, need at least {MIN_SHARED_SECRET_LEN}",
            record.shared_secret.len()
        ));
    }
    MlKemKeyPair::from_parts(public, private)
        .map_err(|err| PersistenceError::Corrupted(format!("key pair: {err}")))?;
    Ok(())
}

#[cfg(unix)]
fn sync_dir(dir: &Path) -> io::Result<()> {
    File::open(dir)?.sync_all()
}

#[cfg(not(unix))]
fn sync_dir(_dir: &Path) -> io::Result<()> {
    Ok(())
}
