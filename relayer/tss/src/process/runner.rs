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

//! Drives one [`MpcProtocol`] over a session subscription.
//!
//! Three tasks run joined: the inbound pump feeds the protocol, the outbound
//! pump broadcasts what it emits one message at a time, and the end watcher
//! hands the final output to the process. The first error cancels the rest.

use crate::{
    error::TssError,
    mpc::{BoxedProtocol, MpcError, MpcProtocol, Outgoing, ProtocolAction},
};
use relayer_common::{MessageKind, PeerId, base64_bytes};
use relayer_network::{Communication, CommunicationError, Subscription, TransportError};
use serde::{Deserialize, Serialize};
use sha3::{Digest, Keccak256};
use std::{
    future::Future,
    panic::{self, AssertUnwindSafe},
    sync::Arc,
    time::Duration,
};
use tokio::{
    sync::{mpsc, oneshot},
    time::{self, Instant},
};
use tokio_util::sync::CancellationToken;

/// Tags MPC traffic with the attempt it belongs to.
#[derive(Serialize, Deserialize)]
struct Envelope {
    attempt: String,
    #[serde(with = "base64_bytes")]
    payload: Vec<u8>,
}

/// `keccak256(session_id ∥ start_params)`, hex encoded.
pub fn attempt_tag(session_id: &str, params: &[u8]) -> String {
    let mut hasher = Keccak256::new();
    hasher.update(session_id.as_bytes());
    hasher.update(params);
    hex::encode(hasher.finalize())
}

pub(crate) struct Runner {
    pub comm: Arc<dyn Communication>,
    pub session_id: String,
    pub kind: MessageKind,
    /// Recipients of broadcast messages.
    pub participants: Vec<PeerId>,
    pub attempt: String,
    /// Fails the run when the protocol keeps waiting on the same peers this long.
    pub watchdog: Option<Duration>,
}

impl Runner {
    pub async fn run<O, F, Fut>(
        self,
        protocol: BoxedProtocol<O>,
        cancel: &CancellationToken,
        stopper: &CancellationToken,
        on_finish: F,
    ) -> Result<(), TssError>
    where
        O: Send + 'static,
        F: FnOnce(O) -> Fut,
        Fut: Future<Output = Result<(), TssError>>,
    {
        // subscribe before the first round goes out
        let subscription = Subscription::new(self.comm.clone(), &self.session_id, self.kind);
        let (out_tx, out_rx) = mpsc::unbounded_channel();
        let (end_tx, end_rx) = oneshot::channel();

        let inbound = self.inbound(protocol, subscription, out_tx, end_tx);
        let outbound = self.outbound(out_rx);
        let end = async {
            let output = end_rx.await.map_err(|_| TssError::Stopped)?;
            on_finish(output).await
        };

        tokio::select! {
            biased;
            _ = cancel.cancelled() => Err(TssError::Stopped),
            _ = stopper.cancelled() => Err(TssError::Stopped),
            result = async { tokio::try_join!(inbound, outbound, end) } => result.map(|_| ()),
        }
    }

    async fn inbound<O: Send + 'static>(
        &self,
        mut protocol: BoxedProtocol<O>,
        mut subscription: Subscription,
        out_tx: mpsc::UnboundedSender<Outgoing>,
        end_tx: oneshot::Sender<O>,
    ) -> Result<(), TssError> {
        let actions = guarded(|| protocol.start())?;
        let mut finished = dispatch(actions, &out_tx);

        let mut waiting = waiting_for(protocol.as_ref());
        let mut since = Instant::now();
        let mut tick = time::interval(watchdog_tick(self.watchdog));

        while finished.is_none() {
            tokio::select! {
                message = subscription.recv() => {
                    let Some(message) = message else {
                        return Err(TssError::Stopped);
                    };
                    let Some(from) = message.from else {
                        continue;
                    };
                    let envelope: Envelope = match serde_json::from_slice(&message.payload) {
                        Ok(envelope) => envelope,
                        Err(err) => {
                            tracing::debug!(session_id = %self.session_id, %from, "dropping malformed mpc envelope: {err}");
                            continue;
                        }
                    };
                    if envelope.attempt != self.attempt {
                        tracing::debug!(session_id = %self.session_id, %from, "dropping message of another attempt");
                        continue;
                    }

                    let handled = guarded(|| protocol.handle(from, &envelope.payload))?;
                    if !handled.accepted {
                        tracing::debug!(session_id = %self.session_id, %from, "protocol rejected message");
                        continue;
                    }
                    finished = dispatch(handled.actions, &out_tx);
                }
                _ = tick.tick(), if self.watchdog.is_some() => {}
            }

            let Some(limit) = self.watchdog else {
                continue;
            };
            let now_waiting = waiting_for(protocol.as_ref());
            if now_waiting != waiting {
                waiting = now_waiting;
                since = Instant::now();
            } else if since.elapsed() >= limit {
                if let Some(stuck) = waiting.first() {
                    tracing::warn!(
                        session_id = %self.session_id,
                        peer = %stuck,
                        "protocol stuck waiting for {} peers",
                        waiting.len()
                    );
                    return Err(CommunicationError::new(*stuck, TransportError::Timeout).into());
                }
            }
        }

        if let Some(output) = finished {
            // the receiver only goes away when a sibling already failed
            let _ = end_tx.send(output);
        }
        Ok(())
    }

    async fn outbound(&self, mut out_rx: mpsc::UnboundedReceiver<Outgoing>) -> Result<(), TssError> {
        while let Some(out) = out_rx.recv().await {
            let envelope = Envelope {
                attempt: self.attempt.clone(),
                payload: out.payload,
            };
            let payload = serde_json::to_vec(&envelope)?;
            let peers = match out.to {
                Some(peer) => vec![peer],
                None => self.participants.clone(),
            };
            self.comm
                .broadcast(&peers, payload, self.kind, &self.session_id)
                .await?;
        }
        Ok(())
    }
}

/// Queues outgoing messages and returns the output once the protocol finishes.
fn dispatch<O>(
    actions: Vec<ProtocolAction<O>>,
    out_tx: &mpsc::UnboundedSender<Outgoing>,
) -> Option<O> {
    let mut output = None;
    for action in actions {
        match action {
            ProtocolAction::Send(out) => {
                // closed only once the outbound pump failed, which ends the run
                let _ = out_tx.send(out);
            }
            ProtocolAction::Finish(result) => output = Some(result),
        }
    }
    output
}

fn waiting_for<O: Send + 'static>(protocol: &dyn MpcProtocol<Output = O>) -> Vec<PeerId> {
    let mut waiting = protocol.waiting_for();
    waiting.sort();
    waiting
}

fn watchdog_tick(watchdog: Option<Duration>) -> Duration {
    watchdog
        .map(|limit| (limit / 4).max(Duration::from_millis(10)))
        .unwrap_or(Duration::from_secs(60))
}

/// Runs a protocol step, turning panics into [`TssError::ProtocolPanic`].
fn guarded<T>(step: impl FnOnce() -> Result<T, MpcError>) -> Result<T, TssError> {
    match panic::catch_unwind(AssertUnwindSafe(step)) {
        Ok(result) => result.map_err(Into::into),
        Err(payload) => {
            let message = payload
                .downcast_ref::<&str>()
                .map(|message| message.to_string())
                .or_else(|| payload.downcast_ref::<String>().cloned())
                .unwrap_or_else(|| "unknown panic".into());
            Err(TssError::ProtocolPanic(message))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mpc::Handled;
    use relayer_network::mock::MockNetwork;

    /// Echo protocol: broadcasts one byte, finishes once every peer sent theirs.
    struct Echo {
        peers: Vec<PeerId>,
        seen: Vec<PeerId>,
        panic_on: Option<u8>,
    }

    impl MpcProtocol for Echo {
        type Output = usize;

        fn start(&mut self) -> Result<Vec<ProtocolAction<usize>>, MpcError> {
            Ok(vec![ProtocolAction::Send(Outgoing::broadcast(vec![1]))])
        }

        fn handle(&mut self, from: PeerId, payload: &[u8]) -> Result<Handled<usize>, MpcError> {
            if Some(payload[0]) == self.panic_on {
                panic!("boom");
            }
            self.seen.push(from);
            let mut actions = vec![];
            if self.waiting_for().is_empty() {
                actions.push(ProtocolAction::Finish(self.seen.len()));
            }
            Ok(Handled::accepted(actions))
        }

        fn waiting_for(&self) -> Vec<PeerId> {
            self.peers
                .iter()
                .filter(|peer| !self.seen.contains(peer))
                .copied()
                .collect()
        }
    }

    fn runner(comm: Arc<dyn Communication>, peers: &[PeerId], attempt: &str) -> Runner {
        Runner {
            comm,
            session_id: "runner".into(),
            kind: MessageKind::TssKeySign,
            participants: peers.to_vec(),
            attempt: attempt.into(),
            watchdog: Some(Duration::from_secs(1)),
        }
    }

    fn echo(local: PeerId, peers: &[PeerId]) -> BoxedProtocol<usize> {
        Box::new(Echo {
            peers: peers.iter().filter(|p| **p != local).copied().collect(),
            seen: vec![],
            panic_on: None,
        })
    }

    #[tokio::test]
    async fn peers_exchange_and_finish() {
        crate::tests::init_logger();

        let network = MockNetwork::new();
        let peers: Vec<_> = (0..3).map(|_| PeerId::random()).collect();
        let cancel = CancellationToken::new();

        let runs = peers.iter().map(|peer| {
            let comm: Arc<dyn Communication> = network.join(*peer);
            let runner = runner(comm, &peers, "a");
            let protocol = echo(*peer, &peers);
            let stopper = CancellationToken::new();
            let cancel = cancel.clone();
            async move {
                let (tx, mut rx) = mpsc::channel(1);
                runner
                    .run(protocol, &cancel, &stopper, |seen| async move {
                        tx.send(seen).await.map_err(|_| TssError::ResultSinkClosed)
                    })
                    .await?;
                Ok::<_, TssError>(rx.recv().await)
            }
        });

        for result in futures::future::join_all(runs).await {
            assert_eq!(result.unwrap(), Some(2));
        }
    }

    #[tokio::test(start_paused = true)]
    async fn other_attempts_are_ignored_and_watchdog_fires() {
        let network = MockNetwork::new();
        let peers: Vec<_> = (0..2).map(|_| PeerId::random()).collect();
        let alice: Arc<dyn Communication> = network.join(peers[0]);
        let bob: Arc<dyn Communication> = network.join(peers[1]);

        // bob speaks for a stale attempt only
        let stale = serde_json::to_vec(&Envelope {
            attempt: "old".into(),
            payload: vec![1],
        })
        .unwrap();
        bob.broadcast(&peers, stale, MessageKind::TssKeySign, "runner")
            .await
            .unwrap();

        let cancel = CancellationToken::new();
        let stopper = CancellationToken::new();
        let err = runner(alice, &peers, "new")
            .run(echo(peers[0], &peers), &cancel, &stopper, |_| async { Ok(()) })
            .await
            .unwrap_err();

        assert_eq!(err.offending_peer(), Some(peers[1]));
        assert!(matches!(
            err,
            TssError::Communication(CommunicationError {
                cause: TransportError::Timeout,
                ..
            })
        ));
    }

    #[tokio::test]
    async fn panics_become_errors() {
        let network = MockNetwork::new();
        let peers: Vec<_> = (0..2).map(|_| PeerId::random()).collect();
        let alice: Arc<dyn Communication> = network.join(peers[0]);
        let bob: Arc<dyn Communication> = network.join(peers[1]);

        let payload = serde_json::to_vec(&Envelope {
            attempt: "a".into(),
            payload: vec![7],
        })
        .unwrap();
        bob.broadcast(&peers, payload, MessageKind::TssKeySign, "runner")
            .await
            .unwrap();

        let protocol = Box::new(Echo {
            peers: vec![peers[1]],
            seen: vec![],
            panic_on: Some(7),
        });
        let cancel = CancellationToken::new();
        let stopper = CancellationToken::new();
        let err = runner(alice, &peers, "a")
            .run(protocol, &cancel, &stopper, |_| async { Ok(()) })
            .await
            .unwrap_err();
        assert!(matches!(err, TssError::ProtocolPanic(message) if message == "boom"));
    }

    #[tokio::test]
    async fn stop_interrupts_the_run() {
        let network = MockNetwork::new();
        let peers: Vec<_> = (0..2).map(|_| PeerId::random()).collect();
        let alice: Arc<dyn Communication> = network.join(peers[0]);

        let cancel = CancellationToken::new();
        let stopper = CancellationToken::new();
        stopper.cancel();
        let err = runner(alice, &peers, "a")
            .run(echo(peers[0], &peers), &cancel, &stopper, |_| async { Ok(()) })
            .await
            .unwrap_err();
        assert!(matches!(err, TssError::Stopped));
    }
}
