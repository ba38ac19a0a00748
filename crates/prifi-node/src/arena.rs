//! Run arena.
//!
//! A node can host several independent runs at once. Every run gets its own
//! relay, clients and trustees, registered on the shared transport under a
//! fresh [`RunId`]; nothing is shared between runs except the transport and
//! the environment.

use std::{collections::HashMap, sync::Arc};

use prifi_core::{
    CipherRate, Client, ClientEvent, Environment, Peer, ProtocolError, Relay, RelayEvent,
    Trustee,
};
use prifi_proto::{Message, ProtocolParams, Round};
use tokio::{
    sync::{mpsc, watch},
    task::JoinSet,
};
use tracing::info;

use crate::{
    config::NodeConfig,
    error::NodeError,
    roles::{self, Link, RateControl},
    transport::{LocalTransport, RunId, Transport},
};

/// Something a run reports to its owner.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RunOutput {
    /// The relay decoded an upstream cell.
    Upstream {
        /// Round of the cell.
        round: Round,
        /// Cell contents, zero-padded to the upstream cell size.
        data: Vec<u8>,
    },
    /// A client received a downstream payload.
    Downstream {
        /// Receiving client.
        client_id: u32,
        /// Round opened by the payload.
        round: Round,
        /// Payload.
        data: Vec<u8>,
    },
    /// A client measured the round trip of its latency probe.
    Latency {
        /// Measuring client.
        client_id: u32,
        /// Round-trip time.
        millis: u64,
    },
    /// The relay reached its reporting limit.
    Finished {
        /// Rounds completed.
        rounds: u64,
    },
    /// A role hit a fatal error and stopped.
    Halted {
        /// The stopped role.
        peer: Peer,
        /// Why it stopped.
        error: ProtocolError,
    },
}

/// Owner's end of one run.
///
/// Dropping the handle aborts every task of the run.
pub struct RunHandle {
    id: RunId,
    params: ProtocolParams,
    relay: mpsc::UnboundedSender<RelayEvent>,
    clients: Vec<mpsc::UnboundedSender<ClientEvent>>,
    outputs: mpsc::UnboundedReceiver<RunOutput>,
    tasks: JoinSet<()>,
}

impl RunHandle {
    /// Run id.
    pub fn id(&self) -> RunId {
        self.id
    }

    /// Parameters the run started with.
    pub fn params(&self) -> &ProtocolParams {
        &self.params
    }

    /// Queue upstream data on a client.
    pub fn send_upstream(&self, client_id: u32, data: Vec<u8>) -> Result<(), NodeError> {
        let max = self.params.up_cell_size as usize;
        if data.len() > max {
            return Err(ProtocolError::PayloadTooLarge { size: data.len(), max }.into());
        }
        let peer = Peer::Client(client_id);
        self.clients
            .get(client_id as usize)
            .ok_or(NodeError::RoleStopped(peer))?
            .send(ClientEvent::QueueUpstream { data })
            .map_err(|_| NodeError::RoleStopped(peer))
    }

    /// Queue downstream data on the relay.
    pub fn send_downstream(&self, data: Vec<u8>) -> Result<(), NodeError> {
        let max = self.params.down_cell_size as usize;
        if data.len() > max {
            return Err(ProtocolError::PayloadTooLarge { size: data.len(), max }.into());
        }
        self.relay
            .send(RelayEvent::QueueDownstream { data })
            .map_err(|_| NodeError::RoleStopped(Peer::Relay))
    }

    /// Ask the relay to abandon the current setup or run and start over.
    pub fn resync(&self) -> Result<(), NodeError> {
        self.relay.send(RelayEvent::Resync).map_err(|_| NodeError::RoleStopped(Peer::Relay))
    }

    /// Next output of the run. `None` once every role has stopped.
    pub async fn next_output(&mut self) -> Option<RunOutput> {
        self.outputs.recv().await
    }
}

/// Every run a node hosts.
pub struct RunArena<E: Environment> {
    env: E,
    config: NodeConfig,
    transport: LocalTransport,
    runs: HashMap<RunId, RunHandle>,
}

impl<E: Environment> RunArena<E> {
    /// Empty arena.
    ///
    /// # Errors
    ///
    /// [`NodeError::Config`] if `config` is inconsistent.
    pub fn new(env: E, config: NodeConfig) -> Result<Self, NodeError> {
        config.validate().map_err(NodeError::Config)?;
        Ok(Self { env, config, transport: LocalTransport::new(), runs: HashMap::new() })
    }

    /// Start a run with the configured parameters.
    pub fn start_run(&mut self) -> Result<RunId, NodeError> {
        self.start_run_with(self.config.params.clone())
    }

    /// Start a run with its own parameters.
    ///
    /// Spawns every role and hands the parameters to the relay, which then
    /// drives the setup. Must be called within a tokio runtime.
    pub fn start_run_with(&mut self, params: ProtocolParams) -> Result<RunId, NodeError> {
        let params = ProtocolParams { start_now: true, ..params };
        params.validate().map_err(|reason| NodeError::Config(reason.to_string()))?;

        let run = self.fresh_id();
        let (outputs_tx, outputs_rx) = mpsc::unbounded_channel();
        let mut tasks = JoinSet::new();

        let mut rates: HashMap<u32, RateControl> = HashMap::new();
        for trustee_id in 0..params.n_trustees {
            let peer = Peer::Trustee(trustee_id);
            let (control, rate) = watch::channel(CipherRate::Stopped);
            let control = Arc::new(control);
            let (tick_tx, tick_rx) = mpsc::unbounded_channel();

            tasks.spawn(roles::trustee_task(
                Trustee::new(self.env.clone()),
                self.link(run, peer, &outputs_tx),
                self.transport.register(run, peer),
                tick_rx,
                Arc::clone(&control),
            ));
            tasks.spawn(roles::cipher_ticker(self.env.clone(), self.config.clone(), rate, tick_tx));
            rates.insert(trustee_id, control);
        }

        let mut clients = Vec::with_capacity(params.n_clients as usize);
        for client_id in 0..params.n_clients {
            let peer = Peer::Client(client_id);
            let (command_tx, command_rx) = mpsc::unbounded_channel();
            tasks.spawn(roles::client_task(
                Client::new(self.env.clone()),
                self.link(run, peer, &outputs_tx),
                self.transport.register(run, peer),
                command_rx,
            ));
            clients.push(command_tx);
        }

        let (relay_tx, relay_rx) = mpsc::unbounded_channel();
        tasks.spawn(roles::relay_task(
            Relay::new(),
            self.link(run, Peer::Relay, &outputs_tx),
            self.transport.register(run, Peer::Relay),
            relay_rx,
            rates,
        ));
        relay_tx
            .send(RelayEvent::Message {
                from: Peer::Relay,
                message: Message::Parameters(params.clone()),
            })
            .map_err(|_| NodeError::RoleStopped(Peer::Relay))?;

        info!(
            run,
            n_clients = params.n_clients,
            n_trustees = params.n_trustees,
            "run started"
        );
        self.runs.insert(
            run,
            RunHandle { id: run, params, relay: relay_tx, clients, outputs: outputs_rx, tasks },
        );
        Ok(run)
    }

    /// Handle of a run.
    pub fn run_mut(&mut self, run: RunId) -> Result<&mut RunHandle, NodeError> {
        self.runs.get_mut(&run).ok_or(NodeError::UnknownRun(run))
    }

    /// Stop a run and release its transport endpoints.
    pub fn stop_run(&mut self, run: RunId) -> Result<(), NodeError> {
        let mut handle = self.runs.remove(&run).ok_or(NodeError::UnknownRun(run))?;
        handle.tasks.abort_all();
        self.transport.unregister_run(run);
        info!(run, "run stopped");
        Ok(())
    }

    /// Ids of hosted runs.
    pub fn run_ids(&self) -> impl Iterator<Item = RunId> + '_ {
        self.runs.keys().copied()
    }

    /// Number of hosted runs.
    pub fn len(&self) -> usize {
        self.runs.len()
    }

    /// Whether no run is hosted.
    pub fn is_empty(&self) -> bool {
        self.runs.is_empty()
    }

    /// Transport shared by every run.
    pub fn transport(&self) -> &LocalTransport {
        &self.transport
    }

    fn link(
        &self,
        run: RunId,
        peer: Peer,
        outputs: &mpsc::UnboundedSender<RunOutput>,
    ) -> Link {
        let transport: Arc<dyn Transport> = Arc::new(self.transport.clone());
        Link::new(run, peer, transport, outputs.clone())
    }

    fn fresh_id(&self) -> RunId {
        loop {
            let id = u64::from_le_bytes(self.env.random_array());
            if id != 0 && !self.runs.contains_key(&id) {
                return id;
            }
        }
    }
}
