//! Node bootstrap
//!
//! Drives a node through its whole life: claim a slot (or stand by for
//! one), bring the task up, deliver epochs until shutdown, then give the
//! slot back. The bootstrap alone owns the lifecycle state; callbacks only
//! ever see the immutable [`FrameworkHandle`].

use std::sync::Arc;
use tokio::net::TcpListener;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use super::epoch::{EpochCoordinator, EpochCursor};
use super::liveness::{LivenessMonitor, PeerFailure};
use super::neighbor::NeighborWatcher;
use super::slot::SlotAllocator;
use super::state::{NodePhase, PhaseTracker};
use crate::config::NodeConfig;
use crate::dataplane::{self, DataPlaneState, DataRequester};
use crate::error::{Result, TaskGraphError};
use crate::framework::FrameworkHandle;
use crate::metrics::standard;
use crate::runtime::ShutdownSignal;
use crate::store::{CoordinationStore, KeyLayout, WatchGuard};
use crate::task::{Context, Task, TaskBuilder};
use crate::topology::{Role, Topology};

/// Capacity of the peer failure queue
const PEER_FAILURE_BUFFER: usize = 16;

/// Entry point of a node
pub struct Bootstrap {
    config: NodeConfig,
    store: Arc<dyn CoordinationStore>,
    listener: TcpListener,
    builder: Option<Arc<dyn TaskBuilder>>,
    topology: Option<Box<dyn Topology>>,
    shutdown: ShutdownSignal,
    phases: Arc<PhaseTracker>,
}

impl Bootstrap {
    /// `listener` is already bound; its address is advertised to peers
    /// unless the config names another.
    pub fn new(config: NodeConfig, store: Arc<dyn CoordinationStore>, listener: TcpListener) -> Self {
        Self {
            config,
            store,
            listener,
            builder: None,
            topology: None,
            shutdown: ShutdownSignal::new(),
            phases: Arc::new(PhaseTracker::new()),
        }
    }

    pub fn with_task_builder(mut self, builder: Arc<dyn TaskBuilder>) -> Self {
        self.builder = Some(builder);
        self
    }

    pub fn with_topology(mut self, topology: Box<dyn Topology>) -> Self {
        self.topology = Some(topology);
        self
    }

    /// Firing this signal shuts the node down in order
    pub fn shutdown_signal(&self) -> ShutdownSignal {
        self.shutdown.clone()
    }

    pub fn phases(&self) -> watch::Receiver<NodePhase> {
        self.phases.subscribe()
    }

    /// Run the node until shutdown. Returns `Err` on any fatal condition;
    /// the caller decides how to exit.
    pub async fn run(self) -> Result<()> {
        let Bootstrap {
            config,
            store,
            listener,
            builder,
            topology,
            shutdown,
            phases,
        } = self;

        let fail = |e: TaskGraphError| {
            phases.advance(NodePhase::Failed);
            e
        };
        config.validate().map_err(fail)?;
        let builder = builder.ok_or_else(|| fail(invalid("no task builder set")))?;
        let topology = topology.ok_or_else(|| fail(invalid("no topology set")))?;

        let address = match &config.advertise_addr {
            Some(addr) => addr.clone(),
            None => listener
                .local_addr()
                .map_err(|e| TaskGraphError::ListenerFailed {
                    addr: "<unbound>".into(),
                    reason: e.to_string(),
                })
                .map_err(fail)?
                .to_string(),
        };
        let keys = KeyLayout::new(config.job_name.clone());
        let allocator = SlotAllocator::new(store.clone(), keys.clone(), address.clone())
            .with_orphan_grace(config.liveness_ttl);

        info!("Node {} joining job {} via {} store", address, keys.job(), store.name());
        let task_id = match claim_slot(&allocator, &config, &shutdown, &phases).await {
            Ok(Some(id)) => id,
            Ok(None) => {
                phases.advance(NodePhase::ShuttingDown);
                phases.advance(NodePhase::Released);
                return Ok(());
            }
            Err(e) => {
                error!("Job {}: no slot for {}: {}", keys.job(), address, e);
                return Err(fail(e));
            }
        };

        let mut node = NodeRuntime {
            liveness: LivenessMonitor::new(
                store.clone(),
                keys.clone(),
                task_id,
                address,
                config.heartbeat_interval,
                config.liveness_ttl,
            ),
            config,
            store,
            keys,
            task_id,
            allocator,
            phases: phases.clone(),
            shutdown,
            cursor: EpochCursor::default(),
            task: None,
            background: Vec::new(),
            neighbors: Vec::new(),
            server: None,
            server_stop: ShutdownSignal::new(),
        };

        let outcome = match node.initialize(builder, topology, listener).await {
            Ok(wiring) => node.run_loop(wiring).await,
            Err(TaskGraphError::ShutdownInProgress) => Ok(()),
            Err(e) => {
                error!(
                    "Job {} task {}: initialization failed: {}",
                    node.keys.job(),
                    task_id,
                    e
                );
                Err(e)
            }
        };

        node.teardown().await;
        match outcome {
            Ok(()) => {
                phases.advance(NodePhase::Released);
                Ok(())
            }
            Err(e) => Err(fail(e)),
        }
    }
}

fn invalid(reason: &str) -> TaskGraphError {
    TaskGraphError::InvalidConfig {
        reason: reason.to_string(),
    }
}

/// Claim a slot, standing by if none is free. `None` means shutdown was
/// requested while waiting.
async fn claim_slot(
    allocator: &SlotAllocator,
    config: &NodeConfig,
    shutdown: &ShutdownSignal,
    phases: &PhaseTracker,
) -> Result<Option<u64>> {
    phases.advance(NodePhase::Acquiring);
    let task_id = match allocator.acquire().await {
        Ok(id) => id,
        Err(TaskGraphError::NoUnassignedTask { .. }) => {
            phases.advance(NodePhase::Standby);
            let mut stop = shutdown.subscribe();
            match allocator.standby(config.standby_timeout, &mut stop).await {
                Ok(id) => {
                    phases.advance(NodePhase::Acquiring);
                    id
                }
                Err(TaskGraphError::ShutdownInProgress) => return Ok(None),
                Err(e) => return Err(e),
            }
        }
        Err(e) => return Err(e),
    };
    phases.advance(NodePhase::Assigned(task_id));
    Ok(Some(task_id))
}

/// Everything the run loop reads; produced by initialization
struct Wiring {
    task: Arc<dyn Task>,
    topology: Arc<dyn Topology>,
    watcher: NeighborWatcher,
    epochs: mpsc::Receiver<u64>,
    failures: mpsc::Receiver<PeerFailure>,
    initial_epoch: u64,
    parents: Vec<u64>,
    children: Vec<u64>,
}

/// Lifecycle state of a node holding a slot
struct NodeRuntime {
    config: NodeConfig,
    store: Arc<dyn CoordinationStore>,
    keys: KeyLayout,
    task_id: u64,
    allocator: SlotAllocator,
    liveness: LivenessMonitor,
    phases: Arc<PhaseTracker>,
    shutdown: ShutdownSignal,
    cursor: EpochCursor,
    task: Option<Arc<dyn Task>>,
    /// Epoch forwarder, heartbeat, failure detector, response dispatcher
    background: Vec<WatchGuard>,
    neighbors: Vec<WatchGuard>,
    server: Option<JoinHandle<Result<()>>>,
    server_stop: ShutdownSignal,
}

impl NodeRuntime {
    async fn initialize(
        &mut self,
        builder: Arc<dyn TaskBuilder>,
        mut topology: Box<dyn Topology>,
        listener: TcpListener,
    ) -> Result<Wiring> {
        let task_id = self.task_id;
        self.phases.advance(NodePhase::Initializing(task_id));

        // Mark ourselves alive first so a crash from here on frees the slot,
        // and keep the marker fresh through a slow init or epoch wait
        self.liveness.publish().await?;
        self.background.push(self.liveness.start_heartbeat());

        topology.set_task_id(task_id);
        let topology: Arc<dyn Topology> = Arc::from(topology);

        let (responses_tx, responses_rx) = mpsc::channel(self.config.data_response_buffer);
        let requester = DataRequester::new(
            self.store.clone(),
            self.keys.clone(),
            task_id,
            self.config.data_request_retries,
            self.config.data_request_timeout,
            responses_tx,
        )?;
        let handle = FrameworkHandle::new(
            task_id,
            self.keys.clone(),
            self.store.clone(),
            self.cursor.clone(),
            requester,
            self.shutdown.clone(),
        );

        let task = builder.build(task_id);
        self.task = Some(task.clone());
        task.init(task_id, handle);

        // The epoch key may not exist yet; stay interruptible while waiting
        let epochs = EpochCoordinator::new(self.store.clone(), self.keys.clone());
        let mut stop = self.shutdown.subscribe();
        let subscription = tokio::select! {
            sub = epochs.get_and_watch() => sub?,
            _ = stop.recv() => return Err(TaskGraphError::ShutdownInProgress),
        };
        self.background.push(subscription.guard);
        let initial_epoch = subscription.initial;
        self.cursor.advance(initial_epoch);

        let (failures_tx, failures) = mpsc::channel(PEER_FAILURE_BUFFER);
        self.background.push(self.liveness.watch_failures(failures_tx).await?);

        let watcher = NeighborWatcher::new(
            self.store.clone(),
            self.keys.clone(),
            task.clone(),
            task_id,
            self.cursor.clone(),
        );
        let parents = topology.parents(initial_epoch);
        let children = topology.children(initial_epoch);
        self.neighbors.extend(watcher.watch_all(Role::Parent, &parents).await?);
        self.neighbors.extend(watcher.watch_all(Role::Child, &children).await?);

        let state = DataPlaneState {
            task: task.clone(),
            topology: topology.clone(),
            epoch: self.cursor.clone(),
            chunk_buffer: self.config.data_chunk_buffer,
        };
        self.server = Some(tokio::spawn(dataplane::serve(
            listener,
            state,
            self.server_stop.subscribe(),
        )));

        let (dispatch_task, dispatch_topology, cursor) =
            (task.clone(), topology.clone(), self.cursor.clone());
        self.background.push(WatchGuard::spawn("data responses", move |stop| {
            dataplane::dispatch_responses(
                responses_rx,
                dispatch_task,
                dispatch_topology,
                cursor,
                task_id,
                stop,
            )
        }));

        Ok(Wiring {
            task,
            topology,
            watcher,
            epochs: subscription.updates,
            failures,
            initial_epoch,
            parents,
            children,
        })
    }

    async fn run_loop(&mut self, mut wiring: Wiring) -> Result<()> {
        let task_id = self.task_id;
        self.phases.advance(NodePhase::Running(task_id));
        info!("Start the work, job {} task {}", self.keys.job(), task_id);

        self.deliver_epoch(&wiring.task, wiring.initial_epoch);

        let Some(mut server) = self.server.take() else {
            return Err(TaskGraphError::Internal {
                message: "data plane not started".into(),
            });
        };
        let mut server_running = true;
        let mut stop = self.shutdown.subscribe();

        let outcome = loop {
            tokio::select! {
                _ = stop.recv() => break Ok(()),
                epoch = wiring.epochs.recv() => {
                    let Some(epoch) = epoch else {
                        break Err(TaskGraphError::Internal {
                            message: "epoch watch ended".into(),
                        });
                    };
                    self.deliver_epoch(&wiring.task, epoch);
                    if self.config.rewatch_on_epoch {
                        if let Err(e) = self.rewatch(&mut wiring, epoch).await {
                            break Err(e);
                        }
                    }
                }
                Some(failure) = wiring.failures.recv() => {
                    self.recover_peer(failure).await;
                }
                res = &mut server, if server_running => {
                    server_running = false;
                    break match res {
                        Ok(Ok(())) => Err(TaskGraphError::ListenerFailed {
                            addr: self.allocator.address().to_string(),
                            reason: "data plane stopped unexpectedly".into(),
                        }),
                        Ok(Err(e)) => Err(e),
                        Err(e) => Err(TaskGraphError::Internal {
                            message: format!("data plane task failed: {}", e),
                        }),
                    };
                }
            }
        };

        if server_running {
            self.server = Some(server);
        }
        outcome
    }

    fn deliver_epoch(&self, task: &Arc<dyn Task>, epoch: u64) {
        self.cursor.advance(epoch);
        standard::EPOCHS_DELIVERED.inc();
        standard::CURRENT_EPOCH.set(epoch as i64);
        debug!("Task {} entering epoch {}", self.task_id, epoch);
        task.set_epoch(Context::new(self.task_id, epoch), epoch);
    }

    /// Re-establish meta watches if the neighbor sets changed at `epoch`
    async fn rewatch(&mut self, wiring: &mut Wiring, epoch: u64) -> Result<()> {
        let parents = wiring.topology.parents(epoch);
        let children = wiring.topology.children(epoch);
        if parents == wiring.parents && children == wiring.children {
            return Ok(());
        }

        info!(
            "Neighbors of task {} changed at epoch {}: parents {:?}, children {:?}",
            self.task_id, epoch, parents, children
        );
        for guard in self.neighbors.drain(..) {
            guard.stop().await;
        }
        self.neighbors.extend(wiring.watcher.watch_all(Role::Parent, &parents).await?);
        self.neighbors.extend(wiring.watcher.watch_all(Role::Child, &children).await?);
        wiring.parents = parents;
        wiring.children = children;
        Ok(())
    }

    async fn recover_peer(&self, failure: PeerFailure) {
        match self
            .allocator
            .reclaim(failure.task_id, failure.address.as_deref())
            .await
        {
            Ok(true) => info!("Slot {} of job {} is free for takeover", failure.task_id, self.keys.job()),
            Ok(false) => debug!("Slot {} needs no reclaim", failure.task_id),
            Err(e) => warn!("Could not reclaim slot {}: {}", failure.task_id, e),
        }
    }

    /// Cancel everything that was started and give the slot back
    async fn teardown(&mut self) {
        self.phases.advance(NodePhase::ShuttingDown);
        let task_id = self.task_id;

        for guard in self.neighbors.drain(..).chain(self.background.drain(..)) {
            debug!("Stopping {}", guard.name());
            guard.stop().await;
        }

        self.server_stop.shutdown();
        if let Some(server) = self.server.take() {
            let abort = server.abort_handle();
            match tokio::time::timeout(self.config.shutdown_grace, server).await {
                Ok(Ok(Err(e))) => warn!("Data plane stopped with error: {}", e),
                Ok(_) => {}
                Err(_) => {
                    warn!("Data plane still busy after {:?}, aborting", self.config.shutdown_grace);
                    abort.abort();
                }
            }
        }

        if let Some(task) = self.task.take() {
            task.exit();
        }

        if let Err(e) = self.allocator.release(task_id).await {
            warn!("Job {} task {}: failed to release slot: {}", self.keys.job(), task_id, e);
        }
        info!("Task {} of job {} released", task_id, self.keys.job());
    }
}
