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

//! Bully election over the session's coordinator candidates.
//!
//! A peer challenges every higher ranked candidate with `Election`. Any higher
//! peer that is alive answers `Alive` and runs its own election, so the highest
//! live candidate ends up broadcasting `Select`. Every node returns the highest
//! selected peer once `bully_wait` has passed.

use super::{Elector, ElectorError};
use async_trait::async_trait;
use relayer_common::{
    MessageKind, PeerId, WrappedMessage,
    peer::{is_peer_id_higher, sort_peers_for_session},
};
use relayer_network::{Communication, Subscription};
use std::{collections::BTreeSet, sync::Arc, time::Duration};
use tokio::time::{self, Instant};
use tokio_util::sync::CancellationToken;

#[derive(Debug, Clone)]
pub struct BullyConfig {
    /// How long to wait for `Alive` after challenging, and for `Select` after it.
    pub election_wait: Duration,
    /// Total time an election call takes.
    pub bully_wait: Duration,
    /// Leader liveness probing; disabled when `None`.
    pub ping_interval: Option<Duration>,
}

impl Default for BullyConfig {
    fn default() -> Self {
        Self {
            election_wait: Duration::from_secs(2),
            bully_wait: Duration::from_secs(10),
            ping_interval: None,
        }
    }
}

pub struct BullyElector {
    comm: Arc<dyn Communication>,
    config: BullyConfig,
}

impl BullyElector {
    pub fn new(comm: Arc<dyn Communication>, config: BullyConfig) -> Self {
        Self { comm, config }
    }
}

#[async_trait]
impl Elector for BullyElector {
    async fn coordinator(
        &self,
        cancel: &CancellationToken,
        session_id: &str,
        peers: &[PeerId],
    ) -> Result<PeerId, ElectorError> {
        if peers.is_empty() {
            return Err(ElectorError::NoCandidates);
        }

        let mut subscription =
            Subscription::many(self.comm.clone(), session_id, MessageKind::ELECTION);
        let mut election = Election {
            comm: self.comm.as_ref(),
            local: self.comm.local_peer_id(),
            session_id,
            candidates: peers.iter().copied().collect(),
            dead: BTreeSet::new(),
            coordinator: None,
            phase: Phase::Idle,
            election_wait: self.config.election_wait,
            ping_sent: None,
        };

        let deadline = Instant::now() + self.config.bully_wait;
        let mut ping = time::interval(self.config.ping_interval.unwrap_or(self.config.bully_wait));
        ping.set_missed_tick_behavior(time::MissedTickBehavior::Delay);
        election.start().await;

        loop {
            let phase_deadline = election.phase_deadline().unwrap_or(deadline);
            tokio::select! {
                _ = cancel.cancelled() => return Err(ElectorError::Cancelled),
                _ = time::sleep_until(deadline) => break,
                _ = time::sleep_until(phase_deadline) => election.on_phase_timeout().await,
                _ = ping.tick(), if self.config.ping_interval.is_some() => {
                    election.on_ping_tick(self.config.ping_interval.unwrap_or_default()).await;
                }
                message = subscription.recv() => {
                    let Some(message) = message else {
                        return Err(ElectorError::Cancelled);
                    };
                    election.on_message(message).await;
                }
            }
        }

        let coordinator = election.result();
        tracing::debug!(session_id, %coordinator, "bully election finished");
        Ok(coordinator)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Phase {
    Idle,
    /// Challenged higher peers, waiting for `Alive`.
    Electing(Instant),
    /// A higher peer is alive, waiting for its `Select`.
    AwaitingSelect(Instant),
    Settled,
}

struct Election<'a> {
    comm: &'a dyn Communication,
    local: PeerId,
    session_id: &'a str,
    candidates: BTreeSet<PeerId>,
    dead: BTreeSet<PeerId>,
    coordinator: Option<PeerId>,
    phase: Phase,
    election_wait: Duration,
    ping_sent: Option<Instant>,
}

impl Election<'_> {
    fn higher(&self, peer: &PeerId, other: &PeerId) -> bool {
        is_peer_id_higher(peer, other, self.session_id)
    }

    fn is_candidate(&self) -> bool {
        self.candidates.contains(&self.local) && !self.dead.contains(&self.local)
    }

    fn live(&self) -> Vec<PeerId> {
        self.candidates.difference(&self.dead).copied().collect()
    }

    fn phase_deadline(&self) -> Option<Instant> {
        match self.phase {
            Phase::Electing(until) | Phase::AwaitingSelect(until) => Some(until),
            Phase::Idle | Phase::Settled => None,
        }
    }

    async fn send(&self, peers: &[PeerId], kind: MessageKind) {
        // unreachable peers simply take no part in the election
        if let Err(err) = self.comm.broadcast(peers, vec![], kind, self.session_id).await {
            tracing::trace!(session_id = self.session_id, ?kind, "election message not delivered: {err}");
        }
    }

    async fn start(&mut self) {
        if !self.is_candidate() {
            self.phase = Phase::Idle;
            return;
        }

        let higher: Vec<_> = self
            .live()
            .into_iter()
            .filter(|peer| self.higher(peer, &self.local))
            .collect();
        if higher.is_empty() {
            self.declare().await;
            return;
        }

        self.phase = Phase::Electing(Instant::now() + self.election_wait);
        self.send(&higher, MessageKind::CoordinatorElection).await;
    }

    async fn declare(&mut self) {
        tracing::debug!(session_id = self.session_id, "declaring self coordinator");
        self.coordinator = Some(self.local);
        self.phase = Phase::Settled;
        self.send(&self.live(), MessageKind::CoordinatorSelect).await;
    }

    async fn on_phase_timeout(&mut self) {
        match self.phase {
            Phase::Electing(_) => self.declare().await,
            // the alive peer never selected itself, challenge again
            Phase::AwaitingSelect(_) => self.start().await,
            Phase::Idle | Phase::Settled => {}
        }
    }

    async fn on_message(&mut self, message: WrappedMessage) {
        let Some(from) = message.from else {
            return;
        };
        if !self.candidates.contains(&from) && message.message_type != MessageKind::CoordinatorPing {
            return;
        }

        match message.message_type {
            MessageKind::CoordinatorElection => {
                if !self.is_candidate() || !self.higher(&self.local, &from) {
                    return;
                }
                self.send(&[from], MessageKind::CoordinatorAlive).await;
                match self.phase {
                    Phase::Settled if self.coordinator == Some(self.local) => {
                        self.send(&[from], MessageKind::CoordinatorSelect).await;
                    }
                    Phase::Idle => self.start().await,
                    _ => {}
                }
            }
            MessageKind::CoordinatorAlive => {
                // only a higher peer may silence us
                if self.higher(&from, &self.local) {
                    if let Phase::Electing(_) = self.phase {
                        self.phase = Phase::AwaitingSelect(Instant::now() + self.election_wait);
                    }
                }
            }
            MessageKind::CoordinatorSelect => {
                if self.dead.contains(&from) {
                    return;
                }
                if self.is_candidate() && self.higher(&self.local, &from) {
                    // a lower peer took over, reclaim
                    if !matches!(self.phase, Phase::Electing(_)) {
                        self.start().await;
                    }
                    return;
                }
                let accept = match self.coordinator {
                    Some(current) => current == self.local || self.higher(&from, &current),
                    None => true,
                };
                if accept {
                    tracing::trace!(session_id = self.session_id, %from, "coordinator selected");
                    self.coordinator = Some(from);
                    self.phase = Phase::Settled;
                    self.ping_sent = None;
                }
            }
            MessageKind::CoordinatorPing => {
                self.send(&[from], MessageKind::CoordinatorPingResponse).await;
            }
            MessageKind::CoordinatorPingResponse => {
                if self.coordinator == Some(from) {
                    self.ping_sent = None;
                }
            }
            MessageKind::CoordinatorLeave => self.on_leave(from).await,
            _ => {}
        }
    }

    async fn on_leave(&mut self, peer: PeerId) {
        tracing::debug!(session_id = self.session_id, %peer, "peer left the election");
        self.dead.insert(peer);
        if self.coordinator == Some(peer) {
            self.coordinator = None;
            self.ping_sent = None;
            self.start().await;
        }
    }

    async fn on_ping_tick(&mut self, interval: Duration) {
        let Some(leader) = self.coordinator.filter(|leader| *leader != self.local) else {
            return;
        };
        match self.ping_sent {
            Some(sent) if sent.elapsed() >= interval => self.on_leave(leader).await,
            Some(_) => {}
            None => {
                self.ping_sent = Some(Instant::now());
                self.send(&[leader], MessageKind::CoordinatorPing).await;
            }
        }
    }

    /// Committed coordinator, or the best ranked live candidate if none settled.
    fn result(&self) -> PeerId {
        self.coordinator
            .or_else(|| sort_peers_for_session(&self.live(), self.session_id).first().copied())
            .unwrap_or(self.local)
    }
}
