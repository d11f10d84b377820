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

//! Process-wide libp2p host carrying relayer envelopes.

use crate::{
    codec::{FrameCodec, MAX_PAYLOAD},
    error::TransportError,
    gate,
    stream::{Completion, StreamManager},
    subscription::SubscriptionRegistry,
    topology::SharedTopology,
};
use anyhow::Context as _;
use futures::StreamExt;
use libp2p::{
    Swarm, SwarmBuilder, Transport,
    core::upgrade,
    identity, noise, plaintext,
    request_response::{self, OutboundRequestId, ProtocolSupport},
    swarm::{NetworkBehaviour, SwarmEvent},
    tcp, yamux,
};
use relayer_common::{Multiaddr, PeerId, Protocol, WrappedMessage};
use std::{sync::Arc, time::Duration};
use tokio::{
    select,
    sync::{mpsc, oneshot},
    time,
};

pub const DEFAULT_LISTEN_PORT: u16 = 9000;
pub const STREAM_PROTOCOL: libp2p::StreamProtocol =
    libp2p::StreamProtocol::new("/relayer/tss/1.0.0");
pub const DEFAULT_REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

const IDLE_CONNECTION_TIMEOUT: Duration = Duration::from_secs(60);
const SWEEP_INTERVAL: Duration = Duration::from_secs(60);

#[derive(Default, Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransportType {
    #[default]
    Tcp,
    Memory,
}

#[derive(Debug, Clone)]
pub struct HostConfig {
    pub listen_addresses: Vec<Multiaddr>,
    pub transport_type: TransportType,
    pub request_timeout: Duration,
}

impl HostConfig {
    pub fn new_local(port: u16) -> Self {
        Self {
            listen_addresses: vec![
                Multiaddr::empty()
                    .with(Protocol::Ip4([0, 0, 0, 0].into()))
                    .with(Protocol::Tcp(port)),
            ],
            transport_type: TransportType::Tcp,
            request_timeout: DEFAULT_REQUEST_TIMEOUT,
        }
    }

    pub fn new_memory(addr: Multiaddr) -> Self {
        Self {
            listen_addresses: vec![addr],
            transport_type: TransportType::Memory,
            request_timeout: DEFAULT_REQUEST_TIMEOUT,
        }
    }

    pub fn with_request_timeout(mut self, timeout: Duration) -> Self {
        self.request_timeout = timeout;
        self
    }
}

impl Default for HostConfig {
    fn default() -> Self {
        Self::new_local(DEFAULT_LISTEN_PORT)
    }
}

#[derive(NetworkBehaviour)]
pub(crate) struct Behaviour {
    // topology gate
    pub gate: gate::Behaviour,
    // one request per envelope, empty response as ack
    pub messaging: request_response::Behaviour<FrameCodec>,
}

impl Behaviour {
    fn new(topology: SharedTopology, request_timeout: Duration) -> Self {
        let config = request_response::Config::default().with_request_timeout(request_timeout);
        Self {
            gate: gate::Behaviour::new(topology),
            messaging: request_response::Behaviour::with_codec(
                FrameCodec,
                [(STREAM_PROTOCOL, ProtocolSupport::Full)],
                config,
            ),
        }
    }
}

#[derive(Debug)]
pub(crate) enum HostCommand {
    Send {
        peer: PeerId,
        session_id: String,
        data: Vec<u8>,
        completion: Completion,
    },
    Shutdown,
}

/// Cheap cloneable access to a running [`Host`].
#[derive(Clone)]
pub struct HostHandle {
    local_peer_id: PeerId,
    commands: mpsc::UnboundedSender<HostCommand>,
    registry: Arc<SubscriptionRegistry>,
    streams: Arc<StreamManager<OutboundRequestId>>,
}

impl HostHandle {
    pub fn local_peer_id(&self) -> PeerId {
        self.local_peer_id
    }

    pub fn registry(&self) -> &Arc<SubscriptionRegistry> {
        &self.registry
    }

    /// Queues one envelope for `peer`; the receiver resolves once the remote acknowledged it.
    pub fn send(
        &self,
        peer: PeerId,
        session_id: &str,
        data: Vec<u8>,
    ) -> oneshot::Receiver<Result<(), TransportError>> {
        let (completion, rx) = oneshot::channel();
        let command = HostCommand::Send {
            peer,
            session_id: session_id.to_string(),
            data,
            completion,
        };
        if let Err(mpsc::error::SendError(HostCommand::Send { completion, .. })) =
            self.commands.send(command)
        {
            let _ = completion.send(Err(TransportError::HostStopped));
        }
        rx
    }

    /// Outbound streams of the session still waiting for an ack.
    pub fn open_streams(&self, session_id: &str) -> usize {
        self.streams.len(session_id)
    }

    /// Closes outbound streams and drops parked inbound messages of the session.
    pub fn close_session(&self, session_id: &str) {
        self.streams.release(session_id);
        self.registry.release(session_id);
    }

    pub fn shutdown(&self) {
        let _ = self.commands.send(HostCommand::Shutdown);
    }
}

/// Owns the swarm; drive it with [`Host::run`].
pub struct Host {
    swarm: Swarm<Behaviour>,
    commands: mpsc::UnboundedReceiver<HostCommand>,
    registry: Arc<SubscriptionRegistry>,
    streams: Arc<StreamManager<OutboundRequestId>>,
    topology: SharedTopology,
}

impl Host {
    pub fn new(
        keypair: identity::Keypair,
        topology: SharedTopology,
        config: HostConfig,
    ) -> anyhow::Result<(Self, HostHandle)> {
        let mut swarm = Self::create_swarm(keypair, topology.clone(), &config)?;

        for addr in &config.listen_addresses {
            swarm
                .listen_on(addr.clone())
                .with_context(|| format!("failed to listen on {addr}"))?;
        }

        let registry = Arc::new(SubscriptionRegistry::new());
        let streams = Arc::new(StreamManager::new());
        let (tx, rx) = mpsc::unbounded_channel();

        let handle = HostHandle {
            local_peer_id: *swarm.local_peer_id(),
            commands: tx,
            registry: registry.clone(),
            streams: streams.clone(),
        };
        let host = Self {
            swarm,
            commands: rx,
            registry,
            streams,
            topology,
        };
        Ok((host, handle))
    }

    fn create_swarm(
        keypair: identity::Keypair,
        topology: SharedTopology,
        config: &HostConfig,
    ) -> anyhow::Result<Swarm<Behaviour>> {
        let behaviour = Behaviour::new(topology, config.request_timeout);

        match config.transport_type {
            TransportType::Tcp => Ok(SwarmBuilder::with_existing_identity(keypair)
                .with_tokio()
                .with_tcp(
                    tcp::Config::default().nodelay(true),
                    noise::Config::new,
                    yamux::Config::default,
                )?
                .with_behaviour(|_| behaviour)?
                .with_swarm_config(|c| c.with_idle_connection_timeout(IDLE_CONNECTION_TIMEOUT))
                .build()),

            TransportType::Memory => {
                let transport = libp2p::core::transport::MemoryTransport::default()
                    .upgrade(upgrade::Version::V1)
                    .authenticate(plaintext::Config::new(&keypair))
                    .multiplex(yamux::Config::default())
                    .boxed();
                let config = libp2p::swarm::Config::with_tokio_executor()
                    .with_idle_connection_timeout(IDLE_CONNECTION_TIMEOUT);

                Ok(Swarm::new(
                    transport,
                    behaviour,
                    keypair.public().to_peer_id(),
                    config,
                ))
            }
        }
    }

    pub fn local_peer_id(&self) -> &PeerId {
        self.swarm.local_peer_id()
    }

    pub async fn run(mut self) {
        let mut sweep = time::interval(SWEEP_INTERVAL);
        sweep.tick().await;

        loop {
            select! {
                event = self.swarm.select_next_some() => self.handle_swarm_event(event),
                command = self.commands.recv() => match command {
                    Some(HostCommand::Send { peer, session_id, data, completion }) => {
                        self.send(peer, &session_id, data, completion);
                    }
                    Some(HostCommand::Shutdown) => {
                        log::info!("shutdown requested, stopping network host...");
                        break;
                    }
                    None => {
                        log::info!("host channel has been disconnected, stopping network host...");
                        break;
                    }
                },
                _ = sweep.tick() => {
                    self.streams.sweep();
                }
            }
        }
    }

    fn send(&mut self, peer: PeerId, session_id: &str, data: Vec<u8>, completion: Completion) {
        if !self.topology.is_allowed_peer(&peer) {
            log::debug!("refusing to send to {peer}: not in topology");
            let _ = completion.send(Err(TransportError::NotAllowed));
            return;
        }
        if data.len() > MAX_PAYLOAD {
            let _ = completion.send(Err(TransportError::PayloadTooLarge(data.len())));
            return;
        }

        let request_id = self.swarm.behaviour_mut().messaging.send_request(&peer, data);
        log::trace!("request {request_id} to {peer} for session {session_id}");
        self.streams.add(session_id, peer, request_id, completion);
    }

    fn handle_swarm_event(&mut self, event: SwarmEvent<BehaviourEvent>) {
        log::trace!("new swarm event: {event:?}");

        match event {
            SwarmEvent::Behaviour(e) => self.handle_behaviour_event(e),
            SwarmEvent::NewListenAddr { address, .. } => {
                log::debug!("listening on {address}");
            }
            SwarmEvent::IncomingConnectionError { error, .. } => {
                log::debug!("incoming connection refused: {error}");
            }
            SwarmEvent::OutgoingConnectionError {
                peer_id: Some(peer),
                error,
                ..
            } => {
                log::debug!("outgoing connection to {peer} failed: {error}");
            }
            _ => {}
        }
    }

    fn handle_behaviour_event(&mut self, event: BehaviourEvent) {
        match event {
            BehaviourEvent::Gate(ev) => match ev {},
            BehaviourEvent::Messaging(ev) => self.handle_messaging_event(ev),
        }
    }

    fn handle_messaging_event(&mut self, event: request_response::Event<Vec<u8>, ()>) {
        match event {
            request_response::Event::Message {
                peer,
                message:
                    request_response::Message::Request {
                        request, channel, ..
                    },
                ..
            } => {
                if !self.topology.is_allowed_peer(&peer) {
                    log::debug!("dropping envelope from {peer}: not in topology");
                    return;
                }

                match WrappedMessage::from_json(&request) {
                    Ok(mut message) => {
                        message.from = Some(peer);
                        log::trace!(
                            "envelope {:?} of session {} from {peer}",
                            message.message_type,
                            message.session_id
                        );
                        self.registry.deliver(message);
                    }
                    Err(err) => {
                        log::debug!("dropping malformed envelope from {peer}: {err}");
                        return;
                    }
                }

                if self
                    .swarm
                    .behaviour_mut()
                    .messaging
                    .send_response(channel, ())
                    .is_err()
                {
                    log::debug!("failed to acknowledge envelope from {peer}: stream closed");
                }
            }
            request_response::Event::Message {
                message: request_response::Message::Response { request_id, .. },
                ..
            } => {
                self.streams.complete(request_id, Ok(()));
            }
            request_response::Event::OutboundFailure {
                peer,
                request_id,
                error,
                ..
            } => {
                log::debug!("request {request_id} to {peer} failed: {error}");
                self.streams.complete(request_id, Err(error.into()));
            }
            request_response::Event::InboundFailure { peer, error, .. } => {
                log::debug!("inbound stream from {peer} failed: {error}");
            }
            request_response::Event::ResponseSent { .. } => {}
        }
    }
}
