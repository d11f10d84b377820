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

//! `(session, kind)` typed message routing.

use lru::LruCache;
use parking_lot::Mutex;
use relayer_common::{MessageKind, SessionId, SubscriptionId, WrappedMessage};
use std::{
    collections::{HashMap, VecDeque},
    num::NonZeroUsize,
};
use tokio::sync::mpsc::{self, error::TrySendError};

/// Capacity of subscription channels created by the communication helpers.
pub const DEFAULT_CHANNEL_CAPACITY: usize = 256;

/// Maximum number of `(session, kind)` pairs with parked messages.
const MAX_PARKED_KEYS: NonZeroUsize = NonZeroUsize::new(256).unwrap();
/// Maximum number of messages parked per `(session, kind)` pair.
const MAX_PARKED_PER_KEY: usize = 64;

type Channels = HashMap<SubscriptionId, mpsc::Sender<WrappedMessage>>;

struct Inner {
    subscriptions: HashMap<SessionId, HashMap<MessageKind, Channels>>,
    parked: LruCache<(SessionId, MessageKind), VecDeque<WrappedMessage>>,
}

/// Maps `session → kind → id → channel`.
///
/// Messages arriving before anyone subscribed to their `(session, kind)` are parked
/// and replayed to the first subscriber.
pub struct SubscriptionRegistry {
    inner: Mutex<Inner>,
}

impl Default for SubscriptionRegistry {
    fn default() -> Self {
        Self {
            inner: Mutex::new(Inner {
                subscriptions: HashMap::new(),
                parked: LruCache::new(MAX_PARKED_KEYS),
            }),
        }
    }
}

impl SubscriptionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn subscribe(
        &self,
        session_id: &str,
        kind: MessageKind,
        channel: mpsc::Sender<WrappedMessage>,
    ) -> SubscriptionId {
        let mut inner = self.inner.lock();
        let Inner {
            subscriptions,
            parked,
        } = &mut *inner;

        let channels = subscriptions
            .entry(session_id.to_string())
            .or_default()
            .entry(kind)
            .or_default();

        let mut id = SubscriptionId::new(session_id, kind);
        while channels.contains_key(&id) {
            id = id.bump();
        }

        if let Some(backlog) = parked.pop(&(session_id.to_string(), kind)) {
            tracing::trace!(
                session_id,
                ?kind,
                messages = backlog.len(),
                "replaying parked messages"
            );
            for message in backlog {
                if let Err(err) = channel.try_send(message) {
                    tracing::warn!(session_id, ?kind, "dropping parked message: {err}");
                }
            }
        }

        channels.insert(id.clone(), channel);
        id
    }

    /// Removes one subscription. Unknown ids are ignored.
    pub fn unsubscribe(&self, id: &SubscriptionId) -> bool {
        let mut inner = self.inner.lock();

        let Some(kinds) = inner.subscriptions.get_mut(id.session_id()) else {
            return false;
        };
        let Some(channels) = kinds.get_mut(&id.kind()) else {
            return false;
        };
        let removed = channels.remove(id).is_some();

        if channels.is_empty() {
            kinds.remove(&id.kind());
        }
        if kinds.is_empty() {
            inner.subscriptions.remove(id.session_id());
        }
        removed
    }

    /// Snapshot of the channels subscribed to `(session, kind)`.
    pub fn subscribers(
        &self,
        session_id: &str,
        kind: MessageKind,
    ) -> Vec<mpsc::Sender<WrappedMessage>> {
        self.inner
            .lock()
            .subscriptions
            .get(session_id)
            .and_then(|kinds| kinds.get(&kind))
            .map(|channels| channels.values().cloned().collect())
            .unwrap_or_default()
    }

    /// Hands a copy of the message to every subscriber without blocking.
    ///
    /// Returns how many subscribers accepted it.
    pub fn deliver(&self, message: WrappedMessage) -> usize {
        let subscribers = {
            let mut inner = self.inner.lock();
            let subscribers: Vec<_> = inner
                .subscriptions
                .get(&message.session_id)
                .and_then(|kinds| kinds.get(&message.message_type))
                .map(|channels| channels.values().cloned().collect())
                .unwrap_or_default();

            if subscribers.is_empty() {
                if message.message_type != MessageKind::Unknown {
                    park(&mut inner.parked, message);
                }
                return 0;
            }
            subscribers
        };

        let mut delivered = 0;
        for subscriber in subscribers {
            match subscriber.try_send(message.clone()) {
                Ok(()) => delivered += 1,
                Err(TrySendError::Full(message)) => tracing::warn!(
                    session_id = %message.session_id,
                    kind = ?message.message_type,
                    "subscriber channel is full, dropping message"
                ),
                Err(TrySendError::Closed(message)) => tracing::debug!(
                    session_id = %message.session_id,
                    kind = ?message.message_type,
                    "subscriber channel is closed"
                ),
            }
        }
        delivered
    }

    /// Forgets messages parked for the session.
    pub fn release(&self, session_id: &str) {
        let mut inner = self.inner.lock();
        for kind in MessageKind::ALL {
            inner.parked.pop(&(session_id.to_string(), kind));
        }
    }
}

fn park(
    parked: &mut LruCache<(SessionId, MessageKind), VecDeque<WrappedMessage>>,
    message: WrappedMessage,
) {
    let backlog = parked.get_or_insert_mut(
        (message.session_id.clone(), message.message_type),
        VecDeque::new,
    );
    if backlog.len() == MAX_PARKED_PER_KEY {
        backlog.pop_front();
    }
    backlog.push_back(message);
}
