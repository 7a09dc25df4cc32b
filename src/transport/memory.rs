#![forbid(unsafe_code)]

// In-process loopback transport - a cooperative matchmaker for tests

use super::{Connection, Connector};
use crate::error::TransportError;
use crate::protocol::{InboundEvent, OutboundEvent, SignalPayload};
use async_trait::async_trait;
use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex};
use tokio::sync::mpsc;

/// How the loopback hub answers its clients.
#[derive(Debug, Clone)]
pub(crate) struct HubBehavior {
    pub refuse_connections: bool,
    /// Reply to `start-search` with `waiting_for_peer`
    pub acknowledge_search: bool,
    /// Pair queued clients into rooms
    pub pair_clients: bool,
    pub answer_debug_state: bool,
}

impl Default for HubBehavior {
    fn default() -> Self {
        Self {
            refuse_connections: false,
            acknowledge_search: true,
            pair_clients: true,
            answer_debug_state: true,
        }
    }
}

#[derive(Default)]
struct HubState {
    behavior: HubBehavior,
    next_client: u64,
    next_room: u64,
    accepted: usize,
    clients: HashMap<u64, mpsc::UnboundedSender<InboundEvent>>,
    queue: VecDeque<u64>,
    peer_of: HashMap<u64, (u64, String)>,
    sent: Vec<(u64, OutboundEvent)>,
}

impl HubState {
    fn deliver(&self, id: u64, event: InboundEvent) {
        if let Some(tx) = self.clients.get(&id) {
            let _ = tx.send(event);
        }
    }

    fn dissolve(&mut self, id: u64, notice: InboundEvent) {
        if let Some((peer, _)) = self.peer_of.remove(&id) {
            self.peer_of.remove(&peer);
            self.deliver(peer, notice);
        }
    }

    fn handle(&mut self, id: u64, event: OutboundEvent) {
        self.sent.push((id, event.clone()));
        match event {
            OutboundEvent::StartSearch => {
                self.queue.retain(|q| *q != id);
                if self.behavior.acknowledge_search {
                    self.deliver(id, InboundEvent::WaitingForPeer);
                }
                if !self.behavior.pair_clients {
                    return;
                }
                match self.queue.pop_front() {
                    Some(first) => {
                        self.next_room += 1;
                        let room = format!("r{}", self.next_room);
                        self.peer_of.insert(first, (id, room.clone()));
                        self.peer_of.insert(id, (first, room.clone()));
                        self.deliver(
                            first,
                            InboundEvent::MatchReady {
                                room_id: room.clone(),
                                is_initiator: true,
                                peer_id: Some(format!("c{id}")),
                            },
                        );
                        self.deliver(
                            id,
                            InboundEvent::MatchReady {
                                room_id: room,
                                is_initiator: false,
                                peer_id: Some(format!("c{first}")),
                            },
                        );
                    }
                    None => self.queue.push_back(id),
                }
            }
            OutboundEvent::StopSearch => self.queue.retain(|q| *q != id),
            OutboundEvent::Skip => self.dissolve(id, InboundEvent::PeerSkipped),
            OutboundEvent::MatchReady { .. } => {}
            OutboundEvent::Signal(payload) => {
                if let Some((peer, room)) = self.peer_of.get(&id) {
                    let forwarded = SignalPayload {
                        room_id: Some(room.clone()),
                        ..payload
                    };
                    self.deliver(*peer, InboundEvent::Signal(forwarded));
                }
            }
            OutboundEvent::DebugState => {
                if self.behavior.answer_debug_state {
                    let queued = self.queue.contains(&id);
                    self.deliver(
                        id,
                        InboundEvent::DebugInfo {
                            state: serde_json::json!({ "queued": queued }),
                        },
                    );
                }
            }
        }
    }

    fn leave(&mut self, id: u64) {
        if self.clients.remove(&id).is_none() {
            return;
        }
        self.queue.retain(|q| *q != id);
        self.dissolve(id, InboundEvent::PeerDisconnected);
    }
}

/// Shared in-process matchmaker. Clone freely; all clones are the same hub.
#[derive(Clone, Default)]
pub(crate) struct MemoryHub {
    inner: Arc<Mutex<HubState>>,
}

impl MemoryHub {
    pub fn new(behavior: HubBehavior) -> Self {
        let hub = Self::default();
        hub.lock().behavior = behavior;
        hub
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, HubState> {
        self.inner.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Connections accepted so far
    pub fn accepted(&self) -> usize {
        self.lock().accepted
    }

    /// Connections currently open
    pub fn open(&self) -> usize {
        self.lock().clients.len()
    }

    /// Every event clients have emitted, with the emitting connection id
    pub fn sent(&self) -> Vec<(u64, OutboundEvent)> {
        self.lock().sent.clone()
    }

    pub fn count_sent(&self, pred: impl Fn(&OutboundEvent) -> bool) -> usize {
        self.lock().sent.iter().filter(|(_, e)| pred(e)).count()
    }

    /// Push an event to a connected client
    pub fn push(&self, id: u64, event: InboundEvent) {
        self.lock().deliver(id, event);
    }

    /// Drop a client's connection from the server side
    pub fn kick(&self, id: u64) {
        self.lock().leave(id);
    }

    /// Open a connection directly, bypassing the connector
    pub fn attach(&self) -> MemoryConnection {
        let (tx, rx) = mpsc::unbounded_channel();
        let mut state = self.lock();
        state.next_client += 1;
        let id = state.next_client;
        state.accepted += 1;
        state.clients.insert(id, tx);
        MemoryConnection {
            id,
            hub: self.clone(),
            rx,
        }
    }
}

#[async_trait]
impl Connector for MemoryHub {
    async fn connect(&self, _url: &str) -> Result<Box<dyn Connection>, TransportError> {
        if self.lock().behavior.refuse_connections {
            return Err(TransportError::Refused("hub refuses connections".into()));
        }
        Ok(Box::new(self.attach()))
    }
}

pub(crate) struct MemoryConnection {
    pub id: u64,
    hub: MemoryHub,
    rx: mpsc::UnboundedReceiver<InboundEvent>,
}

#[async_trait]
impl Connection for MemoryConnection {
    async fn emit(&mut self, event: OutboundEvent) -> Result<(), TransportError> {
        let mut state = self.hub.lock();
        if !state.clients.contains_key(&self.id) {
            return Err(TransportError::Closed);
        }
        state.handle(self.id, event);
        Ok(())
    }

    async fn recv(&mut self) -> Option<InboundEvent> {
        self.rx.recv().await
    }

    async fn close(&mut self) {
        self.hub.lock().leave(self.id);
    }
}

impl Drop for MemoryConnection {
    fn drop(&mut self) {
        self.hub.lock().leave(self.id);
    }
}
