// This file is part of Gear.
//
// Copyright (C) 2025 Gear Technologies Inc.
// SPDX-License-Identifier: GPL-3.0-or-later WITH Classpath-exception-2.0
//
// This program is free software: you can redistribute it and/or modify
// it under the terms of the GNU General Public License as published by
// the Free Software Foundation, either version 3 of the License, or
// (at your option) any later version.
//
// This program is distributed in the hope that it will be useful,
// but WITHOUT ANY WARRANTY; without even the implied warranty of
// MERCHANTABILITY or FITNESS FOR A PARTICULAR PURPOSE. See the
// GNU General Public License for more details.
//
// You should have received a copy of the GNU General Public License
// along with this program. If not, see <https://www.gnu.org/licenses/>.

//! Durable keyshares and their exclusive-use lock.

use parking_lot::RwLock;
use relayer_common::{PeerId, base64_bytes};
use serde::{Deserialize, Serialize, de::DeserializeOwned};
use std::{
    fs, io,
    path::{Path, PathBuf},
    sync::Arc,
};
use thiserror::Error;
use tokio::sync::{Mutex, OwnedMutexGuard};

#[derive(Debug, Error)]
pub enum KeyshareError {
    #[error("no keyshare stored at {0}")]
    NotFound(PathBuf),
    #[error("keyshare at {path} is corrupt: {reason}")]
    Corrupt { path: PathBuf, reason: String },
    #[error("keyshare i/o failed: {0}")]
    Io(#[from] io::Error),
}

/// Private key material plus the metadata every process needs.
pub trait Keyshare: Clone + Send + Sync + Serialize + DeserializeOwned + 'static {
    fn threshold(&self) -> u16;

    /// Shareholders of the key.
    fn peers(&self) -> &[PeerId];
}

/// Opaque share produced by an ECDSA MPC backend.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EcdsaKeyshare {
    #[serde(with = "base64_bytes")]
    pub key: Vec<u8>,
    pub threshold: u16,
    pub peers: Vec<PeerId>,
}

impl Keyshare for EcdsaKeyshare {
    fn threshold(&self) -> u16 {
        self.threshold
    }

    fn peers(&self) -> &[PeerId] {
        &self.peers
    }
}

/// FROST-Taproot share; `public_key` stays stable across resharings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FrostKeyshare {
    #[serde(with = "base64_bytes")]
    pub key: Vec<u8>,
    pub public_key: String,
    pub threshold: u16,
    pub peers: Vec<PeerId>,
}

impl Keyshare for FrostKeyshare {
    fn threshold(&self) -> u16 {
        self.threshold
    }

    fn peers(&self) -> &[PeerId] {
        &self.peers
    }
}

/// Held by a running process; the share is free again once dropped.
#[derive(Debug)]
pub struct KeyshareGuard {
    _guard: OwnedMutexGuard<()>,
}

impl KeyshareGuard {
    pub fn unlock(self) {}
}

/// JSON file store for one curve's keyshare.
///
/// Reads share the cache lock, `store` is exclusive. A separate in-use lock keeps
/// two MPC processes from working on the same share.
#[derive(Debug)]
pub struct KeyshareStore<K> {
    path: PathBuf,
    cache: RwLock<Option<K>>,
    in_use: Arc<Mutex<()>>,
}

impl<K: Keyshare> KeyshareStore<K> {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            cache: RwLock::new(None),
            in_use: Arc::new(Mutex::new(())),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn get(&self) -> Result<K, KeyshareError> {
        if let Some(keyshare) = self.cache.read().as_ref() {
            return Ok(keyshare.clone());
        }

        let mut cache = self.cache.write();
        if let Some(keyshare) = cache.as_ref() {
            return Ok(keyshare.clone());
        }

        let bytes = match fs::read(&self.path) {
            Ok(bytes) => bytes,
            Err(err) if err.kind() == io::ErrorKind::NotFound => {
                return Err(KeyshareError::NotFound(self.path.clone()));
            }
            Err(err) => return Err(err.into()),
        };
        let keyshare: K = serde_json::from_slice(&bytes).map_err(|err| KeyshareError::Corrupt {
            path: self.path.clone(),
            reason: err.to_string(),
        })?;

        *cache = Some(keyshare.clone());
        Ok(keyshare)
    }

    /// Replaces the stored share.
    pub fn store(&self, keyshare: &K) -> Result<(), KeyshareError> {
        let mut cache = self.cache.write();

        let bytes = serde_json::to_vec_pretty(keyshare).map_err(|err| KeyshareError::Corrupt {
            path: self.path.clone(),
            reason: err.to_string(),
        })?;
        if let Some(parent) = self.path.parent() {
            fs::create_dir_all(parent)?;
        }
        let tmp = self.path.with_extension("tmp");
        fs::write(&tmp, bytes)?;
        fs::rename(&tmp, &self.path)?;

        *cache = Some(keyshare.clone());
        tracing::debug!(
            path = %self.path.display(),
            threshold = keyshare.threshold(),
            peers = keyshare.peers().len(),
            "keyshare stored"
        );
        Ok(())
    }

    /// Drops the cached copy so the next [`get`](Self::get) rereads the file.
    pub fn refresh(&self) {
        self.cache.write().take();
    }

    pub async fn lock(&self) -> KeyshareGuard {
        KeyshareGuard {
            _guard: self.in_use.clone().lock_owned().await,
        }
    }

    pub fn try_lock(&self) -> Option<KeyshareGuard> {
        self.in_use
            .clone()
            .try_lock_owned()
            .ok()
            .map(|guard| KeyshareGuard { _guard: guard })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn keyshare() -> EcdsaKeyshare {
        EcdsaKeyshare {
            key: b"share".to_vec(),
            threshold: 1,
            peers: vec![PeerId::random(), PeerId::random(), PeerId::random()],
        }
    }

    #[test]
    fn store_and_get() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("ecdsa.keyshare");
        let store = KeyshareStore::<EcdsaKeyshare>::new(&path);

        assert!(matches!(store.get(), Err(KeyshareError::NotFound(_))));

        let keyshare = keyshare();
        store.store(&keyshare).unwrap();
        assert_eq!(store.get().unwrap(), keyshare);

        // a fresh store reads the same file
        let reopened = KeyshareStore::<EcdsaKeyshare>::new(&path);
        assert_eq!(reopened.get().unwrap(), keyshare);

        let json: serde_json::Value = serde_json::from_slice(&fs::read(&path).unwrap()).unwrap();
        assert_eq!(json["key"], "c2hhcmU=");
        assert_eq!(json["threshold"], 1);
        assert_eq!(json["peers"].as_array().unwrap().len(), 3);
    }

    #[test]
    fn corrupt_file_is_reported() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("frost.keyshare");
        fs::write(&path, b"{\"key\":").unwrap();

        let store = KeyshareStore::<FrostKeyshare>::new(&path);
        assert!(matches!(store.get(), Err(KeyshareError::Corrupt { .. })));
    }

    #[test]
    fn refresh_rereads_the_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("ecdsa.keyshare");
        let store = KeyshareStore::<EcdsaKeyshare>::new(&path);
        let other = KeyshareStore::<EcdsaKeyshare>::new(&path);

        let first = keyshare();
        store.store(&first).unwrap();
        assert_eq!(other.get().unwrap(), first);

        let second = keyshare();
        store.store(&second).unwrap();
        assert_eq!(other.get().unwrap(), first);
        other.refresh();
        assert_eq!(other.get().unwrap(), second);
    }

    #[tokio::test]
    async fn in_use_lock_is_exclusive() {
        let store = KeyshareStore::<EcdsaKeyshare>::new("unused");

        let guard = store.lock().await;
        assert!(store.try_lock().is_none());
        guard.unlock();

        let _guard = store.try_lock().unwrap();
        assert!(store.try_lock().is_none());
    }
}
