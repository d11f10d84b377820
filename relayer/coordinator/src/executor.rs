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

//! Session execution: election, the ready/start handshake and retries.

use crate::{elector::Elector, error::SessionError};
use relayer_common::{MessageKind, PeerId, Topology, peer::peers_intersection};
use relayer_network::{Communication, SharedTopology, Subscription};
use relayer_tss::{ResultSink, TssError, TssProcess};
use std::{
    collections::BTreeSet,
    sync::{
        Arc,
        atomic::{AtomicBool, Ordering},
    },
    time::Duration,
};
use tokio::{
    sync::RwLock,
    time::{self, Instant},
};
use tokio_util::sync::CancellationToken;

#[derive(Debug, Clone)]
pub struct CoordinatorConfig {
    /// Deadline of a whole session, retries included.
    pub tss_timeout: Duration,
    /// Attempts after the first one.
    pub retry_count: usize,
    pub initiate_period: Duration,
    /// Silence from the leader a follower tolerates before failing it.
    pub coordinator_grace: Duration,
    /// How long a signer left out of the subset waits for the attempt to fail
    /// before returning `NotInSubset`. Zero returns at once.
    pub subset_standby: Duration,
}

impl Default for CoordinatorConfig {
    fn default() -> Self {
        Self {
            tss_timeout: Duration::from_secs(30 * 60),
            retry_count: 3,
            initiate_period: Duration::from_secs(15),
            coordinator_grace: Duration::from_secs(45),
            subset_standby: Duration::from_secs(10),
        }
    }
}

impl CoordinatorConfig {
    pub fn with_tss_timeout(mut self, tss_timeout: Duration) -> Self {
        self.tss_timeout = tss_timeout;
        self
    }

    pub fn with_retry_count(mut self, retry_count: usize) -> Self {
        self.retry_count = retry_count;
        self
    }

    pub fn with_initiate_period(mut self, initiate_period: Duration) -> Self {
        self.initiate_period = initiate_period;
        self
    }

    pub fn with_coordinator_grace(mut self, coordinator_grace: Duration) -> Self {
        self.coordinator_grace = coordinator_grace;
        self
    }

    pub fn with_subset_standby(mut self, subset_standby: Duration) -> Self {
        self.subset_standby = subset_standby;
        self
    }
}

/// What one attempt of a process works with.
struct Attempt<'a> {
    process: &'a dyn TssProcess,
    topology: &'a Topology,
    excluded: &'a BTreeSet<PeerId>,
    deposed: &'a BTreeSet<PeerId>,
    sink: &'a ResultSink,
}

impl Attempt<'_> {
    fn session_id(&self) -> &str {
        self.process.session_id()
    }
}

/// Drives sessions for the local node.
pub struct Coordinator {
    comm: Arc<dyn Communication>,
    topology: SharedTopology,
    elector: Arc<dyn Elector>,
    config: CoordinatorConfig,
    /// Read-held by running sessions, write-held by shutdown.
    exit: RwLock<()>,
    closed: AtomicBool,
}

impl Coordinator {
    pub fn new(
        comm: Arc<dyn Communication>,
        topology: SharedTopology,
        elector: Arc<dyn Elector>,
        config: CoordinatorConfig,
    ) -> Self {
        Self {
            comm,
            topology,
            elector,
            config,
            exit: RwLock::new(()),
            closed: AtomicBool::new(false),
        }
    }

    /// Runs `processes` one after another as a single session.
    ///
    /// Every process is stopped and its session closed on return, whatever the
    /// outcome.
    pub async fn execute(
        &self,
        cancel: CancellationToken,
        processes: Vec<Box<dyn TssProcess>>,
        result_sink: ResultSink,
    ) -> Result<(), SessionError> {
        if self.closed.load(Ordering::Acquire) {
            return Err(SessionError::ShuttingDown);
        }
        let Ok(_running) = self.exit.try_read() else {
            return Err(SessionError::ShuttingDown);
        };

        let session = cancel.child_token();
        let result = tokio::select! {
            biased;
            _ = cancel.cancelled() => Err(SessionError::Cancelled),
            result = time::timeout(
                self.config.tss_timeout,
                self.execute_all(&session, &processes, &result_sink),
            ) => result.unwrap_or(Err(SessionError::Timeout)),
        };

        session.cancel();
        for process in &processes {
            process.stop();
            self.comm.close_session(process.session_id());
        }

        let session_ids: Vec<_> = processes.iter().map(|p| p.session_id()).collect();
        match &result {
            Ok(()) => tracing::info!(?session_ids, "session finished"),
            Err(err) => tracing::warn!(
                ?session_ids,
                kind = ?err.kind(),
                offending = ?err.offending_peers(),
                "session failed: {err}"
            ),
        }
        result
    }

    /// Refuses new sessions and waits for the running ones to drain.
    pub async fn shutdown(&self) {
        self.closed.store(true, Ordering::Release);
        let _exit = self.exit.write().await;
        tracing::info!("coordinator shut down");
    }

    async fn execute_all(
        &self,
        cancel: &CancellationToken,
        processes: &[Box<dyn TssProcess>],
        sink: &ResultSink,
    ) -> Result<(), SessionError> {
        for process in processes {
            self.execute_process(cancel, process.as_ref(), sink).await?;
        }
        Ok(())
    }

    async fn execute_process(
        &self,
        cancel: &CancellationToken,
        process: &dyn TssProcess,
        sink: &ResultSink,
    ) -> Result<(), SessionError> {
        let session_id = process.session_id();
        let local = self.comm.local_peer_id();
        let topology = self.topology.snapshot();
        let mut excluded = BTreeSet::new();
        let mut deposed = BTreeSet::new();
        let mut retries = 0;
        // kept across attempts so a `Start` queued behind a `Fail` survives the retry
        let mut subscription = Subscription::many(
            self.comm.clone(),
            session_id,
            [
                MessageKind::TssInitiate,
                MessageKind::TssReady,
                MessageKind::TssStart,
                MessageKind::TssFail,
            ],
        );

        loop {
            let valid_coordinators = process.valid_coordinators();
            let valid = peers_intersection(&valid_coordinators, &topology.peer_ids());
            let leader = if valid_coordinators.is_empty() {
                None
            } else {
                let candidates: Vec<_> = valid
                    .into_iter()
                    .filter(|peer| !excluded.contains(peer) && !deposed.contains(peer))
                    .collect();
                Some(
                    self.elector
                        .coordinator(cancel, session_id, &candidates)
                        .await?,
                )
            };
            tracing::debug!(session_id, ?leader, retries, "coordinator elected");

            let attempt = Attempt {
                process,
                topology: &topology,
                excluded: &excluded,
                deposed: &deposed,
                sink,
            };
            let result = match leader {
                Some(leader) if leader == local => {
                    self.lead(cancel, &attempt, &mut subscription).await
                }
                leader => self.follow(cancel, &attempt, &mut subscription, leader).await,
            };
            let err = match result {
                Ok(()) => return Ok(()),
                Err(err) => err,
            };

            if retries >= self.config.retry_count {
                return Err(err);
            }
            match &err {
                SessionError::Coordinator(peer) => {
                    deposed.insert(*peer);
                }
                _ => match err.excludable_peer() {
                    Some(peer) if process.retryable() && peer != local => {
                        excluded.insert(peer);
                    }
                    _ => return Err(err),
                },
            }
            retries += 1;
            tracing::debug!(session_id, ?excluded, ?deposed, "retrying after: {err}");
        }
    }

    async fn lead(
        &self,
        cancel: &CancellationToken,
        attempt: &Attempt<'_>,
        subscription: &mut Subscription,
    ) -> Result<(), SessionError> {
        let session_id = attempt.session_id();
        let local = self.comm.local_peer_id();

        let targets: BTreeSet<_> = attempt
            .topology
            .peer_ids()
            .into_iter()
            .filter(|peer| *peer != local && !attempt.excluded.contains(peer))
            .collect();
        let mut ready = BTreeSet::from([local]);
        let mut initiate = time::interval(self.config.initiate_period);

        while !attempt.process.ready(&ready, attempt.excluded)? {
            tokio::select! {
                _ = cancel.cancelled() => return Err(SessionError::Cancelled),
                _ = initiate.tick() => {
                    let pending: Vec<_> = targets.difference(&ready).copied().collect();
                    if let Err(err) = self
                        .comm
                        .broadcast(&pending, vec![], MessageKind::TssInitiate, session_id)
                        .await
                    {
                        tracing::debug!(session_id, "initiate not delivered: {err}");
                    }
                }
                message = subscription.recv() => {
                    let message = message.ok_or(SessionError::Cancelled)?;
                    let Some(from) = message.from else {
                        continue;
                    };
                    match message.message_type {
                        MessageKind::TssReady if targets.contains(&from) => {
                            if ready.insert(from) {
                                tracing::debug!(session_id, %from, ready = ready.len(), "peer ready");
                            }
                        }
                        MessageKind::TssFail => {
                            if let Some(err) = self.fail_error(attempt, from, &message.payload, Some(local)) {
                                return Err(err);
                            }
                        }
                        _ => {}
                    }
                }
            }
        }

        let params = attempt.process.start_params(&ready)?;
        let followers: Vec<_> = ready.iter().filter(|peer| **peer != local).copied().collect();
        tracing::debug!(session_id, ?followers, "starting");
        self.comm
            .broadcast(&followers, params.clone(), MessageKind::TssStart, session_id)
            .await
            .map_err(TssError::from)?;

        let run = attempt
            .process
            .run(cancel.clone(), true, attempt.sink.clone(), params.clone());
        tokio::pin!(run);
        loop {
            tokio::select! {
                result = &mut run => {
                    let result = result.map_err(SessionError::from);
                    if let Err(err) = &result {
                        self.announce_failure(attempt, err).await;
                    }
                    return result;
                }
                message = subscription.recv() => {
                    let message = message.ok_or(SessionError::Cancelled)?;
                    let Some(from) = message.from else {
                        continue;
                    };
                    match message.message_type {
                        // late peers still learn the parameters and step aside
                        MessageKind::TssReady if targets.contains(&from) && ready.insert(from) => {
                            if let Err(err) = self
                                .comm
                                .broadcast(&[from], params.clone(), MessageKind::TssStart, session_id)
                                .await
                            {
                                tracing::debug!(session_id, %from, "late start not delivered: {err}");
                            }
                        }
                        MessageKind::TssFail => {
                            if let Some(err) = self.fail_error(attempt, from, &message.payload, Some(local)) {
                                return Err(err);
                            }
                        }
                        _ => {}
                    }
                }
            }
        }
    }

    async fn follow(
        &self,
        cancel: &CancellationToken,
        attempt: &Attempt<'_>,
        subscription: &mut Subscription,
        mut leader: Option<PeerId>,
    ) -> Result<(), SessionError> {
        let session_id = attempt.session_id();
        let grace = time::sleep(self.config.coordinator_grace);
        tokio::pin!(grace);

        let params = loop {
            tokio::select! {
                _ = cancel.cancelled() => return Err(SessionError::Cancelled),
                _ = &mut grace, if leader.is_some() => {
                    let Some(leader) = leader else {
                        continue;
                    };
                    tracing::warn!(session_id, %leader, "coordinator is silent, failing it");
                    self.broadcast_fail(attempt, &[leader]).await;
                    return Err(SessionError::Coordinator(leader));
                }
                message = subscription.recv() => {
                    let message = message.ok_or(SessionError::Cancelled)?;
                    let Some(from) = message.from else {
                        continue;
                    };
                    match message.message_type {
                        MessageKind::TssInitiate => {
                            if leader.is_none() && attempt.topology.contains(&from) {
                                tracing::debug!(session_id, %from, "following first initiator");
                                leader = Some(from);
                            }
                            if leader != Some(from) {
                                tracing::debug!(session_id, %from, "ignoring initiate of a non-leader");
                                continue;
                            }
                            grace.as_mut().reset(Instant::now() + self.config.coordinator_grace);
                            if let Err(err) = self
                                .comm
                                .broadcast(&[from], vec![], MessageKind::TssReady, session_id)
                                .await
                            {
                                tracing::debug!(session_id, "ready not delivered: {err}");
                            }
                        }
                        MessageKind::TssStart if leader == Some(from) => break message.payload,
                        MessageKind::TssFail => match self.fail_error(attempt, from, &message.payload, leader) {
                            Some(err @ SessionError::Coordinator(_)) => return Err(err),
                            Some(err) if leader == Some(from) => return Err(err),
                            _ => {}
                        },
                        _ => {}
                    }
                }
            }
        };

        let result = {
            let run = attempt
                .process
                .run(cancel.clone(), false, attempt.sink.clone(), params);
            tokio::pin!(run);
            loop {
                tokio::select! {
                    result = &mut run => {
                        let result = result.map_err(SessionError::from);
                        if let Err(err) = &result {
                            self.announce_failure(attempt, err).await;
                        }
                        break result;
                    }
                    message = subscription.recv() => {
                        let message = message.ok_or(SessionError::Cancelled)?;
                        let Some(from) = message.from else {
                            continue;
                        };
                        if message.message_type == MessageKind::TssFail {
                            if let Some(err) = self.fail_error(attempt, from, &message.payload, leader) {
                                break Err(err);
                            }
                        }
                    }
                }
            }
        };

        match result {
            Err(SessionError::NotInSubset) => {
                // later sessions may lock the share while this one stands by
                attempt.process.release_keyshare();
                if self.config.subset_standby.is_zero() {
                    return Err(SessionError::NotInSubset);
                }
                self.standby(cancel, attempt, subscription, leader).await
            }
            result => result,
        }
    }

    /// Outside the subset: rejoin if the running attempt fails soon, else step aside.
    async fn standby(
        &self,
        cancel: &CancellationToken,
        attempt: &Attempt<'_>,
        subscription: &mut Subscription,
        leader: Option<PeerId>,
    ) -> Result<(), SessionError> {
        let deadline = time::sleep(self.config.subset_standby);
        tokio::pin!(deadline);
        loop {
            tokio::select! {
                _ = cancel.cancelled() => return Err(SessionError::Cancelled),
                _ = &mut deadline => return Err(SessionError::NotInSubset),
                message = subscription.recv() => {
                    let message = message.ok_or(SessionError::Cancelled)?;
                    let Some(from) = message.from else {
                        continue;
                    };
                    if message.message_type == MessageKind::TssFail {
                        if let Some(err) = self.fail_error(attempt, from, &message.payload, leader) {
                            return Err(err);
                        }
                    }
                }
            }
        }
    }

    /// Turns a received `Fail` into the error of this attempt.
    ///
    /// `None` for reports about peers this node already excluded.
    fn fail_error(
        &self,
        attempt: &Attempt<'_>,
        from: PeerId,
        payload: &[u8],
        leader: Option<PeerId>,
    ) -> Option<SessionError> {
        let named: Vec<PeerId> = match serde_json::from_slice(payload) {
            Ok(named) => named,
            Err(err) => {
                tracing::debug!(session_id = attempt.session_id(), %from, "malformed fail: {err}");
                vec![]
            }
        };
        let handled = |peer: &PeerId| attempt.excluded.contains(peer) || attempt.deposed.contains(peer);
        if !named.is_empty() && named.iter().all(handled) {
            tracing::trace!(session_id = attempt.session_id(), %from, "ignoring stale fail");
            return None;
        }

        let blamed = named
            .iter()
            .find(|peer| !handled(*peer))
            .copied()
            .unwrap_or(from);
        tracing::debug!(session_id = attempt.session_id(), %from, %blamed, "fail received");
        if Some(blamed) == leader {
            return Some(SessionError::Coordinator(blamed));
        }
        Some(SessionError::Communication {
            peer: blamed,
            reason: format!("failure reported by {from}"),
        })
    }

    async fn announce_failure(&self, attempt: &Attempt<'_>, err: &SessionError) {
        if let Some(peer) = err.excludable_peer() {
            self.broadcast_fail(attempt, &[peer]).await;
        }
    }

    /// Sends `Fail` naming `blamed` followed by the peers already excluded.
    async fn broadcast_fail(&self, attempt: &Attempt<'_>, blamed: &[PeerId]) {
        let local = self.comm.local_peer_id();
        let mut named = blamed.to_vec();
        named.extend(attempt.excluded.iter().copied());

        let recipients: Vec<_> = attempt
            .topology
            .peer_ids()
            .into_iter()
            .filter(|peer| *peer != local && !named.contains(peer))
            .collect();
        let payload = match serde_json::to_vec(&named) {
            Ok(payload) => payload,
            Err(err) => {
                tracing::warn!(session_id = attempt.session_id(), "failed to encode fail: {err}");
                return;
            }
        };
        if let Err(err) = self
            .comm
            .broadcast(&recipients, payload, MessageKind::TssFail, attempt.session_id())
            .await
        {
            tracing::debug!(session_id = attempt.session_id(), "fail not delivered everywhere: {err}");
        }
    }
}
