//! Replication coordinator
//!
//! Entry point of a node: allocates operation ids, routes each write to its
//! master, fans it out to the replicas, applies it locally in order and
//! compares the outcomes. Inbound tasks from peers arrive through
//! [`Coordinator::handle_remote_task`].

use crate::alignment::AlignmentProtocol;
use crate::config::{ClusterReplicationConfig, CoordinatorConfig, DatabaseConfig, ReplicationConfig};
use crate::conflict::{ConflictDetector, ConflictResolver, LoggingResolver};
use crate::databases::DatabaseRegistry;
use crate::dispatcher::{AsyncResultHandler, ReplicationDispatcher};
use crate::journal::{MemoryJournal, OperationJournal, OperationStatus};
use crate::membership::{ClusterConfiguration, ClusterConfigurationListener, MembershipTracker};
use crate::queue::{LocalExecution, LocalExecutionQueue};
use crate::router::{MasterRouter, MasterStrategy};
use crate::storage::{MemoryStorage, StorageEngine};
use crate::task::{ExecutionContext, OperationId, ReplicationTask, TaskKind, TaskOutput};
use crate::transport::{RemoteFailure, RemoteResult, TaskTransport};
use crate::{ReplicationError, Result};
use async_trait::async_trait;
use meridian_cluster::{
    database_key, ClusterSubstrate, EntryEvent, Member, MembershipEvent, NodeId, NodeStatus,
    SharedMap,
};
use parking_lot::Mutex;
use serde::Serialize;
use std::collections::HashSet;
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::{Arc, Weak};
use tokio::sync::broadcast::{self, error::RecvError};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// Shared map key holding the run id of the cluster
const RUN_ID_KEY: &str = "runId";

/// Replication state of one database on this node
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct DatabaseStatus {
    pub database: String,
    pub hosted: bool,
    pub node_status: NodeStatus,
    pub last_executed: OperationId,
    pub last_committed: OperationId,
    /// Nodes this node still waits for to finish aligning the database
    pub aligning_with: Vec<NodeId>,
}

/// Re-checks asynchronous replica results once the local result is known
struct AsyncConflictCheck {
    detector: Arc<ConflictDetector>,
    local: watch::Receiver<Option<TaskOutput>>,
}

impl AsyncConflictCheck {
    fn new(detector: Arc<ConflictDetector>) -> (Arc<Self>, watch::Sender<Option<TaskOutput>>) {
        let (sender, local) = watch::channel(None);
        (Arc::new(Self { detector, local }), sender)
    }
}

#[async_trait]
impl AsyncResultHandler for AsyncConflictCheck {
    async fn on_result(&self, node: NodeId, task: ReplicationTask, result: RemoteResult) {
        let mut local = self.local.clone();
        let local = match local.wait_for(Option::is_some).await {
            Ok(output) => output.clone().unwrap_or(None),
            Err(_) => {
                debug!(
                    "No local result for {}, skipping the check of node {}",
                    task, node
                );
                return;
            }
        };
        self.detector.check_single(&task, &node, &local, &result);
    }
}

/// Outcome of a write routed to a remote master
enum RemoteOutcome {
    Done(TaskOutput),
    MasterLeft,
}

/// Builder for [`Coordinator`]
pub struct CoordinatorBuilder {
    substrate: Arc<dyn ClusterSubstrate>,
    transport: Arc<dyn TaskTransport>,
    journal: Option<Arc<dyn OperationJournal>>,
    storage: Option<Arc<dyn StorageEngine>>,
    resolver: Option<Arc<dyn ConflictResolver>>,
    config: CoordinatorConfig,
}

impl CoordinatorBuilder {
    pub fn journal(mut self, journal: Arc<dyn OperationJournal>) -> Self {
        self.journal = Some(journal);
        self
    }

    pub fn storage(mut self, storage: Arc<dyn StorageEngine>) -> Self {
        self.storage = Some(storage);
        self
    }

    pub fn resolver(mut self, resolver: Arc<dyn ConflictResolver>) -> Self {
        self.resolver = Some(resolver);
        self
    }

    pub fn config(mut self, config: CoordinatorConfig) -> Self {
        self.config = config;
        self
    }

    pub fn build(self) -> Arc<Coordinator> {
        let config = self.config;
        let local_node = self.substrate.local_member().node_id();
        let map = self.substrate.shared_map(&config.configuration_map);
        let journal = self
            .journal
            .unwrap_or_else(|| Arc::new(MemoryJournal::new()));
        let storage = self
            .storage
            .unwrap_or_else(|| Arc::new(MemoryStorage::new()));
        let resolver = self.resolver.unwrap_or_else(|| Arc::new(LoggingResolver));

        let membership = Arc::new(MembershipTracker::new(
            local_node.clone(),
            config.alias.clone(),
            config.listeners.clone(),
            map.clone(),
            config.map_retry_interval,
        ));
        let databases = Arc::new(DatabaseRegistry::new(map.clone()));
        let queue = Arc::new(LocalExecutionQueue::new(
            journal.clone(),
            storage.clone(),
            config.queue_wait_timeout,
        ));
        let dispatcher = Arc::new(
            ReplicationDispatcher::new(
                self.substrate.clone(),
                self.transport,
                config.execution_timeout,
            )
            .with_membership(membership.clone()),
        );
        let router = MasterRouter::new(
            membership.clone(),
            databases.clone(),
            config.master_poll_interval,
        );
        let detector = Arc::new(ConflictDetector::new(
            resolver,
            config.quorum_policy,
            storage,
            journal.clone(),
        ));
        let alignment = Arc::new(AlignmentProtocol::new(
            membership.clone(),
            journal.clone(),
            dispatcher.clone(),
            databases.clone(),
        ));

        Arc::new(Coordinator {
            local_node,
            config,
            substrate: self.substrate,
            map,
            membership,
            databases,
            journal,
            queue,
            dispatcher,
            router,
            detector,
            alignment,
            run_id: AtomicI64::new(-1),
            time_offset: AtomicI64::new(0),
            shutdown: CancellationToken::new(),
            tasks: Mutex::new(Vec::new()),
        })
    }
}

/// Replication coordinator of one node
pub struct Coordinator {
    local_node: NodeId,
    config: CoordinatorConfig,
    substrate: Arc<dyn ClusterSubstrate>,
    map: Arc<dyn SharedMap>,
    membership: Arc<MembershipTracker>,
    databases: Arc<DatabaseRegistry>,
    journal: Arc<dyn OperationJournal>,
    queue: Arc<LocalExecutionQueue>,
    dispatcher: Arc<ReplicationDispatcher>,
    router: MasterRouter,
    detector: Arc<ConflictDetector>,
    alignment: Arc<AlignmentProtocol>,
    run_id: AtomicI64,
    /// Cluster time minus local time, in milliseconds
    time_offset: AtomicI64,
    shutdown: CancellationToken,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl Coordinator {
    pub fn builder(
        substrate: Arc<dyn ClusterSubstrate>,
        transport: Arc<dyn TaskTransport>,
    ) -> CoordinatorBuilder {
        CoordinatorBuilder {
            substrate,
            transport,
            journal: None,
            storage: None,
            resolver: None,
            config: CoordinatorConfig::default(),
        }
    }

    pub fn local_node_id(&self) -> &str {
        &self.local_node
    }

    pub fn config(&self) -> &CoordinatorConfig {
        &self.config
    }

    /// Host a database on this node
    pub fn register_database(&self, name: impl Into<String>, config: DatabaseConfig) {
        self.databases.register(name, config);
    }

    pub fn register_master_strategy(
        &self,
        name: impl Into<String>,
        strategy: Arc<dyn MasterStrategy>,
    ) -> Result<()> {
        self.router.register_strategy(name, strategy)
    }

    pub fn add_cluster_listener(&self, listener: Arc<dyn ClusterConfigurationListener>) {
        self.membership.add_listener(listener);
    }

    /// Join the cluster and bring the node online
    ///
    /// The node is published as `starting`, adopts the cluster run id,
    /// discovers the nodes that already published themselves and aligns with
    /// them before going `online`.
    pub async fn startup(self: &Arc<Self>) -> Result<()> {
        info!("Starting replication coordinator on node {}", self.local_node);

        self.spawn_listeners();
        self.membership.publish_local().await?;
        self.seed_run_id().await?;

        let members = self.substrate.members().await?;
        self.membership.discover_members(&members).await?;

        self.alignment.start(self.config.alignment_at_startup).await?;
        if let Some(timer) = self
            .alignment
            .spawn_timer(self.config.alignment_interval, self.shutdown.child_token())
        {
            self.tasks.lock().push(timer);
        }

        info!(
            "Node {} is {} with run id {}",
            self.local_node,
            self.status(),
            self.run_id()
        );
        Ok(())
    }

    /// Stop the alignment timer and the event listeners
    pub async fn shutdown(&self) {
        info!("Shutting down replication coordinator on node {}", self.local_node);
        self.shutdown.cancel();

        let tasks = std::mem::take(&mut *self.tasks.lock());
        for task in tasks {
            if let Err(e) = task.await {
                if !e.is_cancelled() {
                    warn!("Background task ended abnormally: {}", e);
                }
            }
        }
    }

    /// Run one alignment round now
    pub async fn align_nodes(&self) -> Result<()> {
        self.alignment.align_nodes().await
    }

    /// Allocate the next operation of `database`
    pub async fn new_task(&self, database: &str, payload: Vec<u8>) -> Result<ReplicationTask> {
        let run_id = self.run_id();
        if run_id < 0 {
            return Err(ReplicationError::configuration(
                "coordinator is not started, no run id",
            ));
        }
        let serial = self.increment_distributed_serial(database).await?;
        Ok(ReplicationTask::replicated(
            database,
            OperationId::new(run_id, serial),
            payload,
        ))
    }

    /// Next value of the cluster-wide serial of `database`, starting at 1
    pub async fn increment_distributed_serial(&self, database: &str) -> Result<i64> {
        Ok(self
            .substrate
            .increment_counter(&database_key(database))
            .await?)
    }

    /// Execute a task with the given replication targets
    ///
    /// Without targets, for coordination tasks and for tasks received from a
    /// peer the task runs locally only. A task this node already executed is
    /// dropped and yields `None`.
    pub async fn execute(
        &self,
        cluster: Option<&str>,
        key: Option<&str>,
        task: ReplicationTask,
        replication: Option<ReplicationConfig>,
        ctx: &ExecutionContext,
    ) -> Result<TaskOutput> {
        let mut replication = match replication {
            Some(replication) if task.kind().is_mutable() && !ctx.is_remote() => replication,
            _ => return self.execute_local(&task, ctx).await,
        };

        if self.queue.is_replay(&task) {
            warn!(
                "Dropping {}: already executed on node {}",
                task, self.local_node
            );
            return Ok(None);
        }

        let database = task.database().to_string();
        let mut reroutes = 0;
        loop {
            let master = match self
                .router
                .wait_until_master_online(
                    &database,
                    cluster,
                    key,
                    replication.master.clone(),
                    ctx.cancellation(),
                )
                .await
            {
                Ok(master) => master,
                Err(e) => {
                    self.abandon(&task, &replication);
                    return Err(e);
                }
            };

            if master != replication.master {
                // The targets were computed for the previous master
                replication = match self.replication_data(&database, cluster, key, &[]).await? {
                    Some(fresh) => ReplicationConfig {
                        master: master.clone(),
                        ..fresh
                    },
                    None => return self.execute_local(&task, ctx).await,
                };
            }

            if master == self.local_node {
                return self.execute_as_master(&task, &replication, ctx).await;
            }

            match self
                .execute_on_remote_master(&task, &replication, &master, ctx)
                .await?
            {
                RemoteOutcome::Done(output) => return Ok(output),
                RemoteOutcome::MasterLeft => {
                    reroutes += 1;
                    if reroutes > self.config.max_reroutes {
                        return Err(ReplicationError::Retryable(format!(
                            "master {} of db={} left while executing {}",
                            master, database, task
                        )));
                    }
                    warn!(
                        "Master {} left while executing {}, rerouting ({}/{})",
                        master, task, reroutes, self.config.max_reroutes
                    );

                    tokio::select! {
                        _ = ctx.cancellation().cancelled() => return Err(ReplicationError::Cancelled),
                        _ = tokio::time::sleep(self.config.master_poll_interval) => {}
                    }
                    replication = match self.replication_data(&database, cluster, key, &[]).await? {
                        Some(replication) => replication,
                        None => return self.execute_local(&task, ctx).await,
                    };
                }
            }
        }
    }

    /// Apply first, then replicate
    async fn execute_as_master(
        &self,
        task: &ReplicationTask,
        replication: &ReplicationConfig,
        ctx: &ExecutionContext,
    ) -> Result<TaskOutput> {
        match self.queue.enqueue_local(task, ctx).await {
            Ok(LocalExecution::Skipped) => Ok(None),
            Ok(LocalExecution::Applied(output)) => {
                let (check, local) = AsyncConflictCheck::new(self.detector.clone());
                local.send_replace(Some(output.clone()));

                let results = self.dispatcher.propagate(task, replication, Some(check)).await?;
                self.detector
                    .check(task, &output, &results, replication.min_successful)
                    .await?;
                Ok(output)
            }
            Err(e) => {
                warn!(
                    "{} failed on master {}: {}, replicating a no-op instead",
                    task, self.local_node, e
                );
                let no_op = task.as_no_op();
                match self.dispatcher.propagate(&no_op, replication, None).await {
                    Ok(results) => {
                        if let Err(quorum) = self
                            .detector
                            .check(&no_op, &None, &results, replication.min_successful)
                            .await
                        {
                            warn!("Replicating {}: {}", no_op, quorum);
                        }
                    }
                    Err(propagate) => error!("Cannot replicate {}: {}", no_op, propagate),
                }
                Err(e)
            }
        }
    }

    /// Replicate through the master first, then apply locally
    async fn execute_on_remote_master(
        &self,
        task: &ReplicationTask,
        replication: &ReplicationConfig,
        master: &str,
        ctx: &ExecutionContext,
    ) -> Result<RemoteOutcome> {
        let mut targets = replication.clone();
        targets.master = master.to_string();
        targets.async_replicas.retain(|node| node != master);
        if !targets.sync_replicas.iter().any(|node| node == master) {
            targets.sync_replicas.insert(0, master.to_string());
        }

        let (check, local) = AsyncConflictCheck::new(self.detector.clone());
        let results = match self.dispatcher.propagate(task, &targets, Some(check)).await {
            Ok(results) => results,
            Err(ReplicationError::NodeNotFound(node)) if node == master => {
                return Ok(RemoteOutcome::MasterLeft)
            }
            Err(e) => {
                self.abandon(task, replication);
                return Err(e);
            }
        };

        let master_result = results
            .get(master)
            .cloned()
            .unwrap_or_else(|| Err(RemoteFailure::node_left(master)));
        if matches!(&master_result, Err(failure) if failure.is_node_left()) {
            return Ok(RemoteOutcome::MasterLeft);
        }

        let output = self.queue.enqueue_local(task, ctx).await?.output();
        local.send_replace(Some(output.clone()));
        self.detector
            .check(task, &output, &results, targets.min_successful)
            .await?;

        match master_result {
            Ok(output) => Ok(RemoteOutcome::Done(output)),
            Err(failure) => Err(failure.into()),
        }
    }

    async fn execute_local(&self, task: &ReplicationTask, ctx: &ExecutionContext) -> Result<TaskOutput> {
        match task.kind() {
            TaskKind::AlignRequest { checkpoint } => {
                let requester = ctx.source().or(task.source()).ok_or_else(|| {
                    ReplicationError::configuration(format!("{} has no requester", task))
                })?;
                Ok(self
                    .alignment
                    .handle_align_request(requester, task.database(), *checkpoint)
                    .await?
                    .to_output())
            }
            _ => Ok(self.queue.enqueue_local(task, ctx).await?.output()),
        }
    }

    /// Replace a write that will never be dispatched with a no-op
    ///
    /// Its serial is already taken, so every node has to consume it.
    fn abandon(&self, task: &ReplicationTask, replication: &ReplicationConfig) {
        warn!("Abandoning {}, replicating a no-op in its place", task);
        let queue = self.queue.clone();
        let dispatcher = self.dispatcher.clone();
        let no_op = task.as_no_op();
        let replication = replication.clone();
        let ctx = ExecutionContext::local().with_cancellation(self.shutdown.child_token());

        tokio::spawn(async move {
            if let Err(e) = queue.enqueue_local(&no_op, &ctx).await {
                warn!("Cannot apply {} locally: {}", no_op, e);
            }
            if let Err(e) = dispatcher.propagate(&no_op, &replication, None).await {
                warn!("Cannot replicate {}: {}", no_op, e);
            }
        });
    }

    /// Inbound task from a peer
    ///
    /// Mutating tasks are applied locally only, alignment requests are
    /// served. Any error is reported to the sender as a rejection.
    pub async fn handle_remote_task(&self, task: ReplicationTask) -> RemoteResult {
        let Some(source) = task.source().map(str::to_string) else {
            return Err(RemoteFailure::rejected(format!("{} has no source", task)));
        };
        debug!("Received {} from node {}", task, source);

        let ctx = ExecutionContext::remote(source).with_cancellation(self.shutdown.child_token());
        self.execute_local(&task, &ctx).await.map_err(|e| {
            warn!("Rejecting {}: {}", task, e);
            RemoteFailure::rejected(e.to_string())
        })
    }

    /// Replication targets of a write, `None` when the database is not
    /// synchronized
    ///
    /// Every live remote node that is still a cluster member is a target,
    /// whatever its status; the configured asynchronous nodes are updated in
    /// the background and the others are awaited.
    pub async fn replication_data(
        &self,
        database: &str,
        cluster: Option<&str>,
        key: Option<&str>,
        exclude: &[&str],
    ) -> Result<Option<ReplicationConfig>> {
        let settings = self.databases.cluster_configuration(database, cluster).await?;
        if !settings.synchronization {
            debug!("db={} is not synchronized", database);
            return Ok(None);
        }

        let master = self.router.resolve_with(&settings, database, cluster, key)?;
        let members: HashSet<NodeId> = self
            .substrate
            .members()
            .await?
            .iter()
            .map(Member::node_id)
            .collect();

        let mut replication = ReplicationConfig::new(master);
        replication.min_successful = settings.min_successful;
        for node in self.membership.remote_nodes_except(exclude) {
            if !members.contains(&node) {
                debug!("Node {} is no longer a member, not replicating to it", node);
                continue;
            }
            if settings.asynchronous.contains(&node) {
                replication.async_replicas.push(node);
            } else {
                replication.sync_replicas.push(node);
            }
        }
        Ok(Some(replication))
    }

    /// Whether this node is the current master of a write
    pub async fn is_local_node_master(
        &self,
        database: &str,
        cluster: Option<&str>,
        key: Option<&str>,
    ) -> Result<bool> {
        Ok(self.router.resolve_master(database, cluster, key).await? == self.local_node)
    }

    pub async fn database_configuration(&self, database: &str) -> Result<DatabaseConfig> {
        self.databases.configuration(database).await
    }

    pub async fn cluster_replication_configuration(
        &self,
        database: &str,
        cluster: Option<&str>,
    ) -> Result<ClusterReplicationConfig> {
        self.databases.cluster_configuration(database, cluster).await
    }

    pub async fn update_database_configuration(
        &self,
        database: &str,
        config: DatabaseConfig,
    ) -> Result<()> {
        self.databases.update_configuration(database, config).await
    }

    pub async fn database_status(&self, database: &str) -> Result<DatabaseStatus> {
        let aligning_with = self
            .alignment
            .pending_alignments()
            .into_iter()
            .filter(|(_, db, _)| db == database)
            .map(|(node, _, _)| node)
            .collect();

        Ok(DatabaseStatus {
            database: database.to_string(),
            hosted: self.databases.is_hosted(database),
            node_status: self.status(),
            last_executed: self.journal.last_executed(database),
            last_committed: self
                .journal
                .last_journaled(database, OperationStatus::Committed)
                .await?,
            aligning_with,
        })
    }

    pub async fn cluster_configuration(&self) -> Result<ClusterConfiguration> {
        self.membership.cluster_configuration().await
    }

    pub fn status(&self) -> NodeStatus {
        self.membership.status()
    }

    /// Live remote nodes, sorted
    pub fn remote_nodes(&self) -> Vec<NodeId> {
        self.membership.remote_nodes()
    }

    /// Cluster run id, negative before startup
    pub fn run_id(&self) -> i64 {
        self.run_id.load(Ordering::SeqCst)
    }

    pub fn time_offset(&self) -> i64 {
        self.time_offset.load(Ordering::SeqCst)
    }

    /// Cluster-wide lock named `name`
    pub fn lock(&self, name: &str) -> Arc<tokio::sync::Mutex<()>> {
        self.substrate.named_lock(name)
    }

    pub fn journal(&self) -> &Arc<dyn OperationJournal> {
        &self.journal
    }

    async fn seed_run_id(&self) -> Result<()> {
        let cluster_time = self.substrate.cluster_time().await?;
        let run_id = match self
            .map
            .put_if_absent(RUN_ID_KEY, serde_json::json!(cluster_time))
            .await?
        {
            Some(existing) => existing.as_i64().ok_or_else(|| {
                ReplicationError::configuration(format!("invalid {} {}", RUN_ID_KEY, existing))
            })?,
            None => {
                info!("Node {} seeded run id {}", self.local_node, cluster_time);
                cluster_time
            }
        };

        self.run_id.store(run_id, Ordering::SeqCst);
        self.time_offset.store(
            cluster_time - chrono::Utc::now().timestamp_millis(),
            Ordering::SeqCst,
        );
        Ok(())
    }

    fn spawn_listeners(self: &Arc<Self>) {
        let entries = self.map.subscribe();
        let members = self.substrate.subscribe_membership();

        let entry_loop = tokio::spawn(Self::entry_loop(
            Arc::downgrade(self),
            entries,
            self.shutdown.child_token(),
        ));
        let membership_loop = tokio::spawn(Self::membership_loop(
            Arc::downgrade(self),
            members,
            self.shutdown.child_token(),
        ));
        self.tasks.lock().extend([entry_loop, membership_loop]);
    }

    async fn entry_loop(
        coordinator: Weak<Self>,
        mut events: broadcast::Receiver<EntryEvent>,
        cancel: CancellationToken,
    ) {
        loop {
            let event = tokio::select! {
                _ = cancel.cancelled() => break,
                event = events.recv() => event,
            };
            let Some(coordinator) = coordinator.upgrade() else {
                break;
            };
            match event {
                Ok(event) => {
                    if let Err(e) = coordinator.membership.on_entry_event(&event).await {
                        warn!("Cannot process change of {}: {}", event.key(), e);
                    }
                }
                Err(RecvError::Lagged(missed)) => {
                    warn!("Missed {} configuration changes", missed);
                }
                Err(RecvError::Closed) => break,
            }
        }
        debug!("Configuration listener stopped");
    }

    async fn membership_loop(
        coordinator: Weak<Self>,
        mut events: broadcast::Receiver<MembershipEvent>,
        cancel: CancellationToken,
    ) {
        loop {
            let event = tokio::select! {
                _ = cancel.cancelled() => break,
                event = events.recv() => event,
            };
            let Some(coordinator) = coordinator.upgrade() else {
                break;
            };
            match event {
                Ok(MembershipEvent::Joined(member)) => coordinator.membership.on_join(&member),
                Ok(MembershipEvent::Left(member)) => coordinator.on_node_left(&member).await,
                Err(RecvError::Lagged(missed)) => {
                    warn!("Missed {} membership changes", missed);
                }
                Err(RecvError::Closed) => break,
            }
        }
        debug!("Membership listener stopped");
    }

    async fn on_node_left(&self, member: &Member) {
        let node_id = member.node_id();
        if node_id == self.local_node {
            return;
        }
        if let Err(e) = self.membership.on_leave(member).await {
            warn!("Cannot process leave of node {}: {}", node_id, e);
        }
        if let Err(e) = self.alignment.drop_node(&node_id).await {
            warn!("Cannot drop alignments of node {}: {}", node_id, e);
        }
    }
}
