//! Deterministic multi-node harness: every node shares one in-memory network
//! and one virtual clock, and [`TestNet::pump`] runs the whole mesh until
//! nothing is left to deliver.

use super::{ChatNode, NodeChannels, SessionEvent, SessionEventReceiver};
use crate::config::ChatConfig;
use crate::model::PeerId;
use crate::network::memory::{MemoryNetwork, UnknownPeer};
use crate::network::messages::Envelope;
use crate::network::transport::{TransportEvent, TransportEventReceiver};
use crate::sync::clock::ManualClock;
use crate::sync::scheduler::ManualScheduler;
use std::sync::Arc;
use std::time::Duration;

const MAX_PUMP_ROUNDS: usize = 10_000;
const ADVANCE_STEP: Duration = Duration::from_millis(100);

struct TestNode {
    node: ChatNode,
    transport: TransportEventReceiver,
    events: SessionEventReceiver,
    scheduler: ManualScheduler,
}

pub(crate) struct TestNet {
    network: MemoryNetwork,
    clock: ManualClock,
    config: ChatConfig,
    nodes: Vec<TestNode>,
}

impl TestNet {
    pub(crate) fn new() -> Self {
        Self::with_config(ChatConfig::default(), UnknownPeer::Unavailable)
    }

    pub(crate) fn with_unknown_peer(unknown_peer: UnknownPeer) -> Self {
        Self::with_config(ChatConfig::default(), unknown_peer)
    }

    pub(crate) fn with_config(config: ChatConfig, unknown_peer: UnknownPeer) -> Self {
        Self {
            network: MemoryNetwork::with_unknown_peer(unknown_peer),
            clock: ManualClock::default(),
            config,
            nodes: Vec::new(),
        }
    }

    pub(crate) fn network(&self) -> &MemoryNetwork {
        &self.network
    }

    /// A node that has not been started.
    pub(crate) fn add_node(&mut self) -> usize {
        let scheduler = ManualScheduler::new(self.clock.clone());
        let (node, NodeChannels { transport, events }) = ChatNode::new(
            self.config.clone(),
            Arc::new(self.network.clone()),
            Box::new(scheduler.clone()),
            Arc::new(self.clock.clone()),
        );
        self.nodes.push(TestNode {
            node,
            transport,
            events,
            scheduler,
        });
        self.nodes.len() - 1
    }

    /// A started node. Its `Ready` event is consumed.
    pub(crate) fn started(&mut self, display_name: &str) -> usize {
        let i = self.add_node();
        self.node(i)
            .start(display_name)
            .expect("test node failed to start");
        self.take_events(i);
        i
    }

    pub(crate) fn node(&mut self, i: usize) -> &mut ChatNode {
        &mut self.nodes[i].node
    }

    pub(crate) fn id(&self, i: usize) -> PeerId {
        self.nodes[i]
            .node
            .local_id()
            .cloned()
            .expect("test node has no identity")
    }

    pub(crate) fn scheduler(&self, i: usize) -> &ManualScheduler {
        &self.nodes[i].scheduler
    }

    pub(crate) fn take_events(&mut self, i: usize) -> Vec<SessionEvent> {
        let mut out = Vec::new();
        while let Ok(event) = self.nodes[i].events.try_recv() {
            out.push(event);
        }
        out
    }

    /// Deliver every queued transport event and fire every due timer, on all
    /// nodes, until the mesh is quiet.
    pub(crate) fn pump(&mut self) {
        for _ in 0..MAX_PUMP_ROUNDS {
            let mut progressed = false;
            for n in &mut self.nodes {
                while let Ok(event) = n.transport.try_recv() {
                    n.node.handle_transport(event);
                    progressed = true;
                }
                if let Some(timer) = n.scheduler.pop_due() {
                    n.node.handle_timer(timer);
                    progressed = true;
                }
            }
            if !progressed {
                return;
            }
        }
        panic!("test network did not settle after {MAX_PUMP_ROUNDS} rounds");
    }

    /// Move virtual time forward in small steps, pumping after each.
    pub(crate) fn advance(&mut self, by: Duration) {
        self.pump();
        let mut remaining = by;
        while !remaining.is_zero() {
            let step = remaining.min(ADVANCE_STEP);
            self.clock.advance(step);
            self.pump();
            remaining -= step;
        }
    }

    /// Start a host and `members`, create the room and join everyone to it.
    pub(crate) fn room_with_members(&mut self, host: &str, members: &[&str]) -> (usize, Vec<usize>) {
        let h = self.started(host);
        self.node(h).create_room(host);
        self.pump();
        let room = self.id(h);

        let joined = members
            .iter()
            .map(|name| {
                let m = self.started(name);
                self.node(m).join_room(room.as_str());
                self.pump();
                m
            })
            .collect();
        (h, joined)
    }

    /// Drop node `i` off the network without any goodbye.
    pub(crate) fn crash(&mut self, i: usize) {
        let id = self.id(i);
        self.network.crash(&id);
    }

    /// Inject `envelope` on `to`'s existing link with `from`, then pump.
    pub(crate) fn deliver_from(&mut self, from: usize, to: usize, envelope: &Envelope) {
        let peer = self.id(from);
        let link = self
            .node(to)
            .connections()
            .into_iter()
            .find(|info| info.peer == peer)
            .expect("no link between test nodes")
            .link;
        let bytes = envelope.encode().expect("envelope encodes");
        self.node(to)
            .handle_transport(TransportEvent::Data { link, peer, bytes });
        self.pump();
    }
}
