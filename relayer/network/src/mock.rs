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

//! In-process network for multi-peer tests.

use crate::{
    communication::Communication,
    error::{CommunicationError, TransportError},
    subscription::SubscriptionRegistry,
};
use async_trait::async_trait;
use parking_lot::Mutex;
use relayer_common::{MessageKind, PeerId, SubscriptionId, WrappedMessage};
use std::{
    collections::{HashMap, HashSet},
    sync::Arc,
};
use tokio::sync::mpsc;

#[derive(Default)]
struct Inner {
    nodes: HashMap<PeerId, Arc<SubscriptionRegistry>>,
    offline: HashSet<PeerId>,
}

/// Routes envelopes between joined peers without sockets.
///
/// An offline peer can neither send nor receive; sending to it fails with
/// [`TransportError::DialFailure`].
#[derive(Clone, Default)]
pub struct MockNetwork {
    inner: Arc<Mutex<Inner>>,
}

impl MockNetwork {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn join(&self, peer: PeerId) -> Arc<MockCommunication> {
        let registry = self
            .inner
            .lock()
            .nodes
            .entry(peer)
            .or_insert_with(|| Arc::new(SubscriptionRegistry::new()))
            .clone();

        Arc::new(MockCommunication {
            peer,
            registry,
            network: self.clone(),
        })
    }

    pub fn set_offline(&self, peer: PeerId) {
        self.inner.lock().offline.insert(peer);
    }

    pub fn set_online(&self, peer: PeerId) {
        self.inner.lock().offline.remove(&peer);
    }

    pub fn is_offline(&self, peer: &PeerId) -> bool {
        self.inner.lock().offline.contains(peer)
    }

    fn route(&self, from: PeerId, to: PeerId) -> Result<Arc<SubscriptionRegistry>, TransportError> {
        let inner = self.inner.lock();
        if inner.offline.contains(&from) {
            return Err(TransportError::HostStopped);
        }
        if inner.offline.contains(&to) {
            return Err(TransportError::DialFailure);
        }
        inner
            .nodes
            .get(&to)
            .cloned()
            .ok_or(TransportError::DialFailure)
    }
}

pub struct MockCommunication {
    peer: PeerId,
    registry: Arc<SubscriptionRegistry>,
    network: MockNetwork,
}

impl MockCommunication {
    pub fn network(&self) -> &MockNetwork {
        &self.network
    }

    pub fn registry(&self) -> &Arc<SubscriptionRegistry> {
        &self.registry
    }
}

#[async_trait]
impl Communication for MockCommunication {
    fn local_peer_id(&self) -> PeerId {
        self.peer
    }

    async fn broadcast(
        &self,
        peers: &[PeerId],
        payload: Vec<u8>,
        kind: MessageKind,
        session_id: &str,
    ) -> Result<(), CommunicationError> {
        let mut message = WrappedMessage::new(kind, session_id, payload);
        message.from = Some(self.peer);

        let mut first_error = None;
        for peer in peers.iter().filter(|peer| **peer != self.peer) {
            match self.network.route(self.peer, *peer) {
                Ok(registry) => {
                    registry.deliver(message.clone());
                }
                Err(cause) => {
                    first_error.get_or_insert(CommunicationError::new(*peer, cause));
                }
            }
        }
        tokio::task::yield_now().await;

        match first_error {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }

    fn subscribe(
        &self,
        session_id: &str,
        kind: MessageKind,
        channel: mpsc::Sender<WrappedMessage>,
    ) -> SubscriptionId {
        self.registry.subscribe(session_id, kind, channel)
    }

    fn unsubscribe(&self, id: &SubscriptionId) {
        self.registry.unsubscribe(id);
    }

    fn close_session(&self, session_id: &str) {
        self.registry.release(session_id);
    }
}
