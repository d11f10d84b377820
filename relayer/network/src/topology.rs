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

//! Topology loading, persistence and the process-wide shared handle.

use parking_lot::{Mutex, RwLock};
use rand::RngCore;
use relayer_common::{Multiaddr, PeerId, Topology, TopologyError};
use sha3::{Digest, Keccak256};
use std::{
    fs, io,
    path::{Path, PathBuf},
    sync::Arc,
};
use thiserror::Error;

const NONCE_LENGTH: usize = 24;

/// Read-mostly topology handle shared by the gate, the host and sessions.
///
/// Updates replace the whole value; sessions work on a [`snapshot`](Self::snapshot).
#[derive(Debug, Clone)]
pub struct SharedTopology(Arc<RwLock<Topology>>);

impl SharedTopology {
    pub fn new(topology: Topology) -> Self {
        Self(Arc::new(RwLock::new(topology)))
    }

    pub fn is_allowed_peer(&self, peer: &PeerId) -> bool {
        self.0.read().contains(peer)
    }

    pub fn address(&self, peer: &PeerId) -> Option<Multiaddr> {
        self.0.read().address(peer).cloned()
    }

    pub fn snapshot(&self) -> Topology {
        self.0.read().clone()
    }

    /// Replaces the topology and returns the previous one.
    pub fn swap(&self, topology: Topology) -> Topology {
        std::mem::replace(&mut *self.0.write(), topology)
    }
}

#[derive(Debug, Error)]
pub enum TopologyStoreError {
    #[error("topology file i/o failed: {0}")]
    Io(#[from] io::Error),
    #[error("topology file is malformed: {0}")]
    Json(#[from] serde_json::Error),
}

/// Persists the current topology snapshot as JSON.
#[derive(Debug)]
pub struct TopologyStore {
    path: PathBuf,
    lock: Mutex<()>,
}

impl TopologyStore {
    pub const FILE_NAME: &str = "topology.json";

    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            lock: Mutex::new(()),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn topology(&self) -> Result<Topology, TopologyStoreError> {
        let _guard = self.lock.lock();
        let bytes = fs::read(&self.path)?;
        Ok(serde_json::from_slice(&bytes)?)
    }

    pub fn store_topology(&self, topology: &Topology) -> Result<(), TopologyStoreError> {
        let _guard = self.lock.lock();
        if let Some(parent) = self.path.parent() {
            fs::create_dir_all(parent)?;
        }
        fs::write(&self.path, serde_json::to_vec_pretty(topology)?)?;
        Ok(())
    }
}

#[derive(Debug, Error)]
pub enum TopologyProviderError {
    #[error("failed to read encrypted topology: {0}")]
    Io(#[from] io::Error),
    #[error("encrypted topology is shorter than its nonce")]
    Truncated,
    #[error("topology decryption failed: {0}")]
    Decrypt(String),
    #[error("topology hash mismatch: expected {expected}, got {actual}")]
    HashMismatch { expected: String, actual: String },
    #[error("decrypted topology is malformed: {0}")]
    Json(#[from] serde_json::Error),
    #[error(transparent)]
    Invalid(#[from] TopologyError),
}

/// Loads the encrypted roster distributed to relayers.
///
/// The file holds `nonce(24) ∥ secret_box(json)`; the plaintext hash is checked
/// against the value announced out of band when one is configured.
#[derive(Debug, Clone)]
pub struct TopologyProvider {
    path: PathBuf,
    key: [u8; 32],
}

impl TopologyProvider {
    pub fn new(path: impl Into<PathBuf>, key: [u8; 32]) -> Self {
        Self {
            path: path.into(),
            key,
        }
    }

    pub fn network_topology(
        &self,
        expected_hash: Option<[u8; 32]>,
    ) -> Result<Topology, TopologyProviderError> {
        let sealed = fs::read(&self.path)?;
        let plaintext = open(&sealed, &self.key)?;

        let actual: [u8; 32] = Keccak256::digest(&plaintext).into();
        if let Some(expected) = expected_hash
            && expected != actual
        {
            return Err(TopologyProviderError::HashMismatch {
                expected: hex::encode(expected),
                actual: hex::encode(actual),
            });
        }

        let topology: Topology = serde_json::from_slice(&plaintext)?;
        log::debug!(
            "loaded topology with {} peers, threshold {}",
            topology.len(),
            topology.threshold()
        );
        Ok(topology)
    }
}

/// Encrypts a JSON roster into the provider's on-disk format.
pub fn seal(plaintext: &[u8], key: &[u8; 32]) -> Result<Vec<u8>, TopologyProviderError> {
    let mut nonce = [0; NONCE_LENGTH];
    rand::thread_rng().fill_bytes(&mut nonce);

    let ciphertext = nacl::secret_box::pack(plaintext, &nonce, key)
        .map_err(|err| TopologyProviderError::Decrypt(format!("{err:?}")))?;

    Ok([nonce.as_slice(), &ciphertext].concat())
}

fn open(sealed: &[u8], key: &[u8; 32]) -> Result<Vec<u8>, TopologyProviderError> {
    if sealed.len() < NONCE_LENGTH {
        return Err(TopologyProviderError::Truncated);
    }
    let (nonce, ciphertext) = sealed.split_at(NONCE_LENGTH);
    nacl::secret_box::open(ciphertext, nonce, key)
        .map_err(|err| TopologyProviderError::Decrypt(format!("{err:?}")))
}

/// Keccak256 of a plaintext roster, as announced alongside the encrypted file.
pub fn topology_hash(plaintext: &[u8]) -> [u8; 32] {
    Keccak256::digest(plaintext).into()
}

#[cfg(test)]
mod tests {
    use super::*;
    use relayer_common::mock::Mock;

    fn topology(n: usize) -> Topology {
        Topology::mock(((0..n).map(|_| PeerId::random()).collect(), 1))
    }

    #[test]
    fn shared_topology_swaps_whole_value() {
        let first = topology(3);
        let second = topology(2);
        let shared = SharedTopology::new(first.clone());

        let peer = first.peer_ids()[0];
        assert!(shared.is_allowed_peer(&peer));
        assert!(shared.address(&peer).is_some());

        let snapshot = shared.snapshot();
        assert_eq!(shared.swap(second.clone()), first);
        assert!(!shared.is_allowed_peer(&peer));
        assert_eq!(shared.snapshot(), second);
        // snapshots taken earlier are unaffected
        assert_eq!(snapshot, first);
    }

    #[test]
    fn store_round_trips_through_file() {
        let dir = tempfile::tempdir().unwrap();
        let store = TopologyStore::new(dir.path().join("nested").join(TopologyStore::FILE_NAME));

        assert!(matches!(store.topology(), Err(TopologyStoreError::Io(_))));

        let topology = topology(4);
        store.store_topology(&topology).unwrap();
        assert_eq!(store.topology().unwrap(), topology);

        fs::write(store.path(), b"{").unwrap();
        assert!(matches!(store.topology(), Err(TopologyStoreError::Json(_))));
    }

    #[test]
    fn provider_decrypts_and_verifies_hash() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("topology.enc");
        let key = [7; 32];

        let topology = topology(3);
        let plaintext = serde_json::to_vec(&topology).unwrap();
        fs::write(&path, seal(&plaintext, &key).unwrap()).unwrap();

        let provider = TopologyProvider::new(&path, key);
        assert_eq!(provider.network_topology(None).unwrap(), topology);
        assert_eq!(
            provider
                .network_topology(Some(topology_hash(&plaintext)))
                .unwrap(),
            topology
        );

        let err = provider.network_topology(Some([0; 32])).unwrap_err();
        assert!(matches!(err, TopologyProviderError::HashMismatch { .. }));

        let err = TopologyProvider::new(&path, [8; 32])
            .network_topology(None)
            .unwrap_err();
        assert!(matches!(err, TopologyProviderError::Decrypt(_)));

        fs::write(&path, [0; 10]).unwrap();
        let err = provider.network_topology(None).unwrap_err();
        assert!(matches!(err, TopologyProviderError::Truncated));
    }
}
