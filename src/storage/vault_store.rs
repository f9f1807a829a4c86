//! Encrypted key-value store.
//!
//! File layout: `MAGIC (4) || nonce (12) || ChaCha20-Poly1305(records)`,
//! where records are `u32 len || key || u32 len || value`, little endian.
//! The whole map is rewritten on every save.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use chacha20poly1305::aead::{Aead, KeyInit};
use chacha20poly1305::{ChaCha20Poly1305, Key, Nonce};
use rand_core::{OsRng, RngCore};
use zeroize::Zeroizing;

use super::raw_files::{read_optional, write_atomic};
use super::StorageError;

const MAGIC: &[u8; 4] = b"VCS1";
const NONCE_LEN: usize = 12;
const KEY_LEN: usize = 32;

pub struct EncryptedStore {
    data: BTreeMap<String, Zeroizing<Vec<u8>>>,
    path: Option<PathBuf>,
    key: Zeroizing<[u8; KEY_LEN]>,
}

impl EncryptedStore {
    /// A store that never touches disk.
    pub fn new_memory(key: &[u8]) -> Result<Self, StorageError> {
        Ok(Self { data: BTreeMap::new(), path: None, key: copy_key(key)? })
    }

    /// Opens the store at `path`, or starts empty when the file is absent.
    pub fn open<P: AsRef<Path>>(path: P, key: &[u8]) -> Result<Self, StorageError> {
        let mut store = Self {
            data: BTreeMap::new(),
            path: Some(path.as_ref().to_path_buf()),
            key: copy_key(key)?,
        };
        store.load()?;
        Ok(store)
    }

    /// Like [`open`](Self::open), but a file that no longer decrypts or
    /// parses is moved to `<path>.unreadable` and the store starts empty.
    /// A changed device key makes old files unreadable.
    pub fn open_or_reset<P: AsRef<Path>>(path: P, key: &[u8]) -> Result<Self, StorageError> {
        let path = path.as_ref();
        match Self::open(path, key) {
            Err(e @ (StorageError::Crypto | StorageError::Corruption)) => {
                let aside = unreadable_path(path);
                log::warn!("Encrypted store unreadable ({}), starting empty", e);
                std::fs::rename(path, &aside)?;
                Self::open(path, key)
            }
            other => other,
        }
    }

    pub fn is_persistent(&self) -> bool {
        self.path.is_some()
    }

    pub fn set(&mut self, key: &str, value: &[u8]) {
        self.data.insert(key.to_string(), Zeroizing::new(value.to_vec()));
    }

    pub fn get(&self, key: &str) -> Option<&[u8]> {
        self.data.get(key).map(|v| v.as_slice())
    }

    pub fn remove(&mut self, key: &str) -> bool {
        self.data.remove(key).is_some()
    }

    pub fn keys_with_prefix<'a>(&'a self, prefix: &'a str) -> impl Iterator<Item = &'a str> + 'a {
        self.data
            .range(prefix.to_string()..)
            .map(|(k, _)| k.as_str())
            .take_while(move |k| k.starts_with(prefix))
    }

    pub fn save(&self) -> Result<(), StorageError> {
        let Some(path) = &self.path else {
            return Ok(());
        };

        let mut plaintext = Zeroizing::new(Vec::new());
        for (k, v) in &self.data {
            plaintext.extend_from_slice(&(k.len() as u32).to_le_bytes());
            plaintext.extend_from_slice(k.as_bytes());
            plaintext.extend_from_slice(&(v.len() as u32).to_le_bytes());
            plaintext.extend_from_slice(v);
        }

        let cipher = ChaCha20Poly1305::new(Key::from_slice(self.key.as_slice()));
        let mut nonce_bytes = [0u8; NONCE_LEN];
        OsRng.fill_bytes(&mut nonce_bytes);
        let ciphertext = cipher
            .encrypt(Nonce::from_slice(&nonce_bytes), plaintext.as_slice())
            .map_err(|_| StorageError::Crypto)?;

        let mut file = Vec::with_capacity(MAGIC.len() + NONCE_LEN + ciphertext.len());
        file.extend_from_slice(MAGIC);
        file.extend_from_slice(&nonce_bytes);
        file.extend_from_slice(&ciphertext);
        write_atomic(path, &file)
    }

    fn load(&mut self) -> Result<(), StorageError> {
        let Some(path) = &self.path else {
            return Ok(());
        };
        let content = match read_optional(path)? {
            Some(c) if !c.is_empty() => c,
            _ => return Ok(()),
        };
        if content.len() < MAGIC.len() + NONCE_LEN || &content[..MAGIC.len()] != MAGIC {
            return Err(StorageError::Corruption);
        }

        let (nonce_bytes, ciphertext) = content[MAGIC.len()..].split_at(NONCE_LEN);
        let cipher = ChaCha20Poly1305::new(Key::from_slice(self.key.as_slice()));
        let plaintext = Zeroizing::new(
            cipher
                .decrypt(Nonce::from_slice(nonce_bytes), ciphertext)
                .map_err(|_| StorageError::Crypto)?,
        );

        self.data = decode_records(&plaintext)?;
        log::debug!("Loaded {} records from encrypted store", self.data.len());
        Ok(())
    }
}

fn unreadable_path(path: &Path) -> PathBuf {
    let mut name = path.as_os_str().to_owned();
    name.push(".unreadable");
    PathBuf::from(name)
}

fn copy_key(key: &[u8]) -> Result<Zeroizing<[u8; KEY_LEN]>, StorageError> {
    if key.len() != KEY_LEN {
        return Err(StorageError::InvalidKey(key.len()));
    }
    let mut out = Zeroizing::new([0u8; KEY_LEN]);
    out.copy_from_slice(key);
    Ok(out)
}

fn take<'a>(buf: &'a [u8], cursor: &mut usize, len: usize) -> Result<&'a [u8], StorageError> {
    let end = cursor.checked_add(len).ok_or(StorageError::Corruption)?;
    let slice = buf.get(*cursor..end).ok_or(StorageError::Corruption)?;
    *cursor = end;
    Ok(slice)
}

fn take_len(buf: &[u8], cursor: &mut usize) -> Result<usize, StorageError> {
    let bytes = take(buf, cursor, 4)?;
    let mut len = [0u8; 4];
    len.copy_from_slice(bytes);
    Ok(u32::from_le_bytes(len) as usize)
}

fn decode_records(plaintext: &[u8]) -> Result<BTreeMap<String, Zeroizing<Vec<u8>>>, StorageError> {
    let mut data = BTreeMap::new();
    let mut cursor = 0;
    while cursor < plaintext.len() {
        let k_len = take_len(plaintext, &mut cursor)?;
        let key = std::str::from_utf8(take(plaintext, &mut cursor, k_len)?)
            .map_err(|_| StorageError::Corruption)?
            .to_string();
        let v_len = take_len(plaintext, &mut cursor)?;
        let value = take(plaintext, &mut cursor, v_len)?.to_vec();
        data.insert(key, Zeroizing::new(value));
    }
    Ok(data)
}

#[cfg(test)]
mod tests {
    use super::*;

    const KEY: [u8; 32] = [0x11; 32];

    #[test]
    fn test_memory_store() {
        let mut store = EncryptedStore::new_memory(&KEY).unwrap();
        store.set("cache/a", b"value1");
        assert_eq!(store.get("cache/a"), Some(&b"value1"[..]));
        assert_eq!(store.get("cache/b"), None);
        assert!(store.remove("cache/a"));
        assert!(!store.remove("cache/a"));
        assert!(!store.is_persistent());
        store.save().unwrap();
    }

    #[test]
    fn test_persistence_and_wrong_key() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("vault.db");
        {
            let mut store = EncryptedStore::open(&path, &KEY).unwrap();
            store.set("cache/main", b"{\"v\":1}");
            store.set("prefs/ignored_version", b"7");
            store.save().unwrap();
        }
        {
            let store = EncryptedStore::open(&path, &KEY).unwrap();
            assert_eq!(store.get("cache/main"), Some(&b"{\"v\":1}"[..]));
            assert_eq!(store.get("prefs/ignored_version"), Some(&b"7"[..]));
        }
        assert!(matches!(EncryptedStore::open(&path, &[0x12; 32]), Err(StorageError::Crypto)));
    }

    #[test]
    fn test_unreadable_store_is_set_aside() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("vault.db");
        let mut store = EncryptedStore::open(&path, &KEY).unwrap();
        store.set("prefs/ignored_version", b"7");
        store.save().unwrap();

        let mut reset = EncryptedStore::open_or_reset(&path, &[0x12; 32]).unwrap();
        assert_eq!(reset.get("prefs/ignored_version"), None);
        assert!(dir.path().join("vault.db.unreadable").exists());
        assert!(!path.exists());

        reset.set("prefs/ignored_version", b"8");
        reset.save().unwrap();
        let reopened = EncryptedStore::open(&path, &[0x12; 32]).unwrap();
        assert_eq!(reopened.get("prefs/ignored_version"), Some(&b"8"[..]));
    }

    #[test]
    fn test_open_or_reset_keeps_readable_store() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("vault.db");
        std::fs::write(&path, b"garbage that is long enough").unwrap();
        assert!(EncryptedStore::open_or_reset(&path, &KEY).unwrap().get("x").is_none());

        let mut store = EncryptedStore::open_or_reset(&path, &KEY).unwrap();
        store.set("cache/main", b"1");
        store.save().unwrap();
        let store = EncryptedStore::open_or_reset(&path, &KEY).unwrap();
        assert_eq!(store.get("cache/main"), Some(&b"1"[..]));
    }

    #[test]
    fn test_file_is_not_plaintext() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("vault.db");
        let mut store = EncryptedStore::open(&path, &KEY).unwrap();
        store.set("cache/main", b"enabled=true");
        store.save().unwrap();
        let raw = std::fs::read(&path).unwrap();
        assert!(raw.starts_with(MAGIC));
        assert!(!raw.windows(12).any(|w| w == b"enabled=true"));
    }

    #[test]
    fn test_corrupt_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("vault.db");
        std::fs::write(&path, b"garbage that is long enough").unwrap();
        assert!(matches!(EncryptedStore::open(&path, &KEY), Err(StorageError::Corruption)));
    }

    #[test]
    fn test_prefix_scan() {
        let mut store = EncryptedStore::new_memory(&KEY).unwrap();
        store.set("cache/a", b"1");
        store.set("cache/b", b"2");
        store.set("lkg/a", b"3");
        let keys: Vec<&str> = store.keys_with_prefix("cache/").collect();
        assert_eq!(keys, vec!["cache/a", "cache/b"]);
    }

    #[test]
    fn test_truncated_records_rejected() {
        assert!(matches!(decode_records(&[5, 0, 0, 0, b'a']), Err(StorageError::Corruption)));
        assert!(decode_records(&[]).unwrap().is_empty());
    }

    #[test]
    fn test_rejects_short_key() {
        assert!(matches!(EncryptedStore::new_memory(&[0u8; 16]), Err(StorageError::InvalidKey(16))));
    }
}
