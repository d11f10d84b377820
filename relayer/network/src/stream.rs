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

//! Bookkeeping of outbound streams per `(session, peer)`.

use crate::error::TransportError;
use parking_lot::Mutex;
use relayer_common::{PeerId, SessionId};
use std::{
    collections::{HashMap, hash_map::Entry},
    fmt,
    hash::Hash,
};
use tokio::sync::oneshot;

/// Sessions without an id park their streams here until [`StreamManager::sweep`].
pub const UNKNOWN_SESSION: &str = "unknown-session";

/// Close handle of a stream: resolves the sender waiting on the write.
pub type Completion = oneshot::Sender<Result<(), TransportError>>;

struct StreamRecord<Id> {
    id: Id,
    completion: Completion,
}

struct Inner<Id> {
    sessions: HashMap<SessionId, HashMap<PeerId, Vec<StreamRecord<Id>>>>,
    index: HashMap<Id, (SessionId, PeerId)>,
}

/// Owns every open outbound stream, indexed by `(session, peer)`.
pub struct StreamManager<Id> {
    inner: Mutex<Inner<Id>>,
}

impl<Id> Default for StreamManager<Id> {
    fn default() -> Self {
        Self {
            inner: Mutex::new(Inner {
                sessions: HashMap::new(),
                index: HashMap::new(),
            }),
        }
    }
}

impl<Id> fmt::Debug for StreamManager<Id> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let inner = self.inner.lock();
        f.debug_struct("StreamManager")
            .field("sessions", &inner.sessions.len())
            .field("streams", &inner.index.len())
            .finish()
    }
}

fn session_key(session_id: &str) -> &str {
    if session_id.is_empty() {
        UNKNOWN_SESSION
    } else {
        session_id
    }
}

impl<Id> StreamManager<Id>
where
    Id: Copy + Eq + Hash + fmt::Debug,
{
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a stream. Returns `false` and drops `completion` if `id` is already tracked.
    pub fn add(&self, session_id: &str, peer: PeerId, id: Id, completion: Completion) -> bool {
        let session_id = session_key(session_id);
        let mut inner = self.inner.lock();

        match inner.index.entry(id) {
            Entry::Occupied(_) => return false,
            Entry::Vacant(entry) => {
                entry.insert((session_id.to_string(), peer));
            }
        }

        inner
            .sessions
            .entry(session_id.to_string())
            .or_default()
            .entry(peer)
            .or_default()
            .push(StreamRecord { id, completion });
        true
    }

    /// Resolves a stream with the transport outcome and forgets it.
    pub fn complete(&self, id: Id, result: Result<(), TransportError>) -> bool {
        let record = {
            let mut inner = self.inner.lock();
            let Some((session_id, peer)) = inner.index.remove(&id) else {
                return false;
            };
            take_record(&mut inner.sessions, &session_id, &peer, id)
        };

        match record {
            Some(record) => {
                if record.completion.send(result).is_err() {
                    log::trace!("stream {id:?} completed after its sender went away");
                }
                true
            }
            None => false,
        }
    }

    /// Closes every stream of the session. Returns how many were released.
    pub fn release(&self, session_id: &str) -> usize {
        let session_id = session_key(session_id);
        let records: Vec<_> = {
            let mut inner = self.inner.lock();
            let Some(peers) = inner.sessions.remove(session_id) else {
                return 0;
            };
            let records: Vec<_> = peers.into_values().flatten().collect();
            for record in &records {
                inner.index.remove(&record.id);
            }
            records
        };

        let released = records.len();
        for record in records {
            if record.completion.send(Err(TransportError::Released)).is_err() {
                log::debug!("failed to close stream {:?}: sender is gone", record.id);
            }
        }
        if released > 0 {
            log::debug!("released {released} streams of session {session_id}");
        }
        released
    }

    /// Releases streams parked under [`UNKNOWN_SESSION`].
    pub fn sweep(&self) -> usize {
        self.release(UNKNOWN_SESSION)
    }

    /// Number of open streams of the session.
    pub fn len(&self, session_id: &str) -> usize {
        self.inner
            .lock()
            .sessions
            .get(session_key(session_id))
            .map(|peers| peers.values().map(Vec::len).sum())
            .unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.inner.lock().index.is_empty()
    }
}

fn take_record<Id: Eq>(
    sessions: &mut HashMap<SessionId, HashMap<PeerId, Vec<StreamRecord<Id>>>>,
    session_id: &str,
    peer: &PeerId,
    id: Id,
) -> Option<StreamRecord<Id>> {
    let peers = sessions.get_mut(session_id)?;
    let records = peers.get_mut(peer)?;
    let position = records.iter().position(|record| record.id == id)?;
    let record = records.swap_remove(position);

    if records.is_empty() {
        peers.remove(peer);
    }
    if peers.is_empty() {
        sessions.remove(session_id);
    }
    Some(record)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn complete_resolves_and_forgets() {
        let manager = StreamManager::new();
        let peer = PeerId::random();
        let (tx, mut rx) = oneshot::channel();

        assert!(manager.add("s", peer, 1u64, tx));
        assert_eq!(manager.len("s"), 1);

        assert!(manager.complete(1, Ok(())));
        assert_eq!(rx.try_recv().unwrap(), Ok(()));
        assert_eq!(manager.len("s"), 0);
        assert!(manager.is_empty());

        // completed exactly once
        assert!(!manager.complete(1, Ok(())));
    }

    #[test]
    fn duplicate_add_is_noop() {
        let manager = StreamManager::new();
        let peer = PeerId::random();
        let (first, mut first_rx) = oneshot::channel();
        let (second, mut second_rx) = oneshot::channel();

        assert!(manager.add("s", peer, 7u64, first));
        assert!(!manager.add("s", peer, 7u64, second));
        assert_eq!(manager.len("s"), 1);

        // the rejected completion was dropped
        assert!(second_rx.try_recv().is_err());

        manager.complete(7, Err(TransportError::Timeout));
        assert_eq!(first_rx.try_recv().unwrap(), Err(TransportError::Timeout));
    }

    #[test]
    fn release_closes_only_that_session() {
        let manager = StreamManager::new();
        let (a, b) = (PeerId::random(), PeerId::random());

        let mut released = vec![];
        for (i, peer) in [a, b, a].into_iter().enumerate() {
            let (tx, rx) = oneshot::channel();
            manager.add("one", peer, i as u64, tx);
            released.push(rx);
        }
        let (tx, mut kept) = oneshot::channel();
        manager.add("two", a, 100, tx);

        assert_eq!(manager.release("one"), 3);
        assert_eq!(manager.release("one"), 0);
        for mut rx in released {
            assert_eq!(rx.try_recv().unwrap(), Err(TransportError::Released));
        }

        assert_eq!(manager.len("two"), 1);
        assert!(kept.try_recv().is_err());
        assert!(!manager.complete(0, Ok(())));
        assert!(manager.complete(100, Ok(())));
    }

    #[test]
    fn unknown_session_is_parked_until_sweep() {
        let manager = StreamManager::new();
        let (tx, mut rx) = oneshot::channel();
        manager.add("", PeerId::random(), 1u64, tx);

        assert_eq!(manager.len(UNKNOWN_SESSION), 1);
        assert_eq!(manager.sweep(), 1);
        assert_eq!(rx.try_recv().unwrap(), Err(TransportError::Released));
    }

    #[test]
    fn release_tolerates_gone_senders() {
        let manager = StreamManager::new();
        let (tx, rx) = oneshot::channel();
        manager.add("s", PeerId::random(), 1u64, tx);
        drop(rx);

        assert_eq!(manager.release("s"), 1);
    }
}
