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

//! Session and kind typed broadcast/receive.

use crate::{
    error::{CommunicationError, TransportError},
    host::HostHandle,
    subscription::DEFAULT_CHANNEL_CAPACITY,
};
use async_trait::async_trait;
use futures::future;
use relayer_common::{MessageKind, PeerId, SubscriptionId, WrappedMessage};
use std::sync::Arc;
use tokio::sync::mpsc;

/// Messaging surface used by electors, processes and the executor.
#[async_trait]
pub trait Communication: Send + Sync + 'static {
    fn local_peer_id(&self) -> PeerId;

    /// Sends `payload` to every peer except the local one.
    ///
    /// Completes when every recipient acknowledged the envelope, or fails with the
    /// first error in `peers` order. Deliveries that already succeeded are kept.
    async fn broadcast(
        &self,
        peers: &[PeerId],
        payload: Vec<u8>,
        kind: MessageKind,
        session_id: &str,
    ) -> Result<(), CommunicationError>;

    fn subscribe(
        &self,
        session_id: &str,
        kind: MessageKind,
        channel: mpsc::Sender<WrappedMessage>,
    ) -> SubscriptionId;

    fn unsubscribe(&self, id: &SubscriptionId);

    /// Releases transport resources held for the session.
    fn close_session(&self, session_id: &str);
}

/// [`Communication`] over the libp2p [`Host`](crate::host::Host).
#[derive(Clone)]
pub struct Libp2pCommunication {
    host: HostHandle,
}

impl Libp2pCommunication {
    pub fn new(host: HostHandle) -> Self {
        Self { host }
    }
}

#[async_trait]
impl Communication for Libp2pCommunication {
    fn local_peer_id(&self) -> PeerId {
        self.host.local_peer_id()
    }

    async fn broadcast(
        &self,
        peers: &[PeerId],
        payload: Vec<u8>,
        kind: MessageKind,
        session_id: &str,
    ) -> Result<(), CommunicationError> {
        let local = self.local_peer_id();
        let data = WrappedMessage::new(kind, session_id, payload)
            .to_json()
            .map_err(|err| {
                CommunicationError::new(local, TransportError::Serialization(err.to_string()))
            })?;

        let sends = peers.iter().filter(|peer| **peer != local).map(|peer| {
            let ack = self.host.send(*peer, session_id, data.clone());
            async move {
                let result = ack.await.unwrap_or(Err(TransportError::HostStopped));
                (*peer, result)
            }
        });

        for (peer, result) in future::join_all(sends).await {
            if let Err(cause) = result {
                tracing::debug!(session_id, %peer, ?kind, "broadcast failed: {cause}");
                return Err(CommunicationError::new(peer, cause));
            }
        }
        Ok(())
    }

    fn subscribe(
        &self,
        session_id: &str,
        kind: MessageKind,
        channel: mpsc::Sender<WrappedMessage>,
    ) -> SubscriptionId {
        self.host.registry().subscribe(session_id, kind, channel)
    }

    fn unsubscribe(&self, id: &SubscriptionId) {
        self.host.registry().unsubscribe(id);
    }

    fn close_session(&self, session_id: &str) {
        self.host.close_session(session_id);
    }
}

/// Receiving end of one or more subscriptions sharing a channel.
///
/// Unsubscribes on drop.
pub struct Subscription {
    ids: Vec<SubscriptionId>,
    rx: mpsc::Receiver<WrappedMessage>,
    comm: Arc<dyn Communication>,
}

impl Subscription {
    pub fn new(comm: Arc<dyn Communication>, session_id: &str, kind: MessageKind) -> Self {
        Self::many(comm, session_id, [kind])
    }

    pub fn many(
        comm: Arc<dyn Communication>,
        session_id: &str,
        kinds: impl IntoIterator<Item = MessageKind>,
    ) -> Self {
        let (tx, rx) = mpsc::channel(DEFAULT_CHANNEL_CAPACITY);
        let ids = kinds
            .into_iter()
            .map(|kind| comm.subscribe(session_id, kind, tx.clone()))
            .collect();
        Self { ids, rx, comm }
    }

    pub fn ids(&self) -> &[SubscriptionId] {
        &self.ids
    }

    /// `None` once every subscription was removed.
    pub async fn recv(&mut self) -> Option<WrappedMessage> {
        self.rx.recv().await
    }

    pub fn try_recv(&mut self) -> Option<WrappedMessage> {
        self.rx.try_recv().ok()
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        for id in &self.ids {
            self.comm.unsubscribe(id);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mock::MockNetwork;

    #[tokio::test]
    async fn subscription_guard_unsubscribes_on_drop() {
        let network = MockNetwork::new();
        let alice = network.join(PeerId::random());
        let bob: Arc<dyn Communication> = network.join(PeerId::random());

        let mut sub = Subscription::many(
            bob.clone(),
            "s",
            [MessageKind::TssReady, MessageKind::TssFail],
        );
        assert_eq!(sub.ids().len(), 2);

        let peers = [bob.local_peer_id()];
        alice
            .broadcast(&peers, b"ready".to_vec(), MessageKind::TssReady, "s")
            .await
            .unwrap();
        alice
            .broadcast(&peers, b"fail".to_vec(), MessageKind::TssFail, "s")
            .await
            .unwrap();

        let ready = sub.recv().await.unwrap();
        assert_eq!(ready.message_type, MessageKind::TssReady);
        assert_eq!(ready.from, Some(alice.local_peer_id()));
        assert_eq!(sub.recv().await.unwrap().payload, b"fail");
        drop(sub);

        // parked while nobody listens, replayed to the next subscriber
        alice
            .broadcast(&peers, b"late".to_vec(), MessageKind::TssReady, "s")
            .await
            .unwrap();
        let mut sub = Subscription::new(bob, "s", MessageKind::TssReady);
        assert_eq!(sub.try_recv().unwrap().payload, b"late");
        assert!(sub.try_recv().is_none());
    }
}
