//! Catch-up of nodes that fell behind
//!
//! A node aligns by asking every remote node to replay what they journaled
//! after its own last committed operation. Each (node, database) pair stays
//! pending until that node answers `Completed`; a node that is itself
//! catching up answers `Postponed` and is asked again later. The local node
//! is `aligning` while anything is pending and `online` once nothing is.

use crate::config::ReplicationConfig;
use crate::databases::DatabaseRegistry;
use crate::dispatcher::{AsyncResultHandler, ExecutionMode, ReplicationDispatcher};
use crate::journal::{OperationJournal, OperationStatus};
use crate::membership::MembershipTracker;
use crate::task::{OperationId, ReplicationTask, TaskOutput};
use crate::transport::RemoteResult;
use crate::{ReplicationError, Result};
use async_trait::async_trait;
use meridian_cluster::{NodeId, NodeStatus};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeSet, HashMap};
use std::sync::{Arc, Weak};
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// Answer to an alignment request
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "alignment", rename_all = "lowercase")]
pub enum AlignmentReply {
    /// Everything after the checkpoint was replayed
    Completed { replayed: usize },
    /// The node is catching up itself, ask again later
    Postponed,
}

impl AlignmentReply {
    pub fn to_output(&self) -> TaskOutput {
        serde_json::to_value(self).ok()
    }

    pub fn from_output(output: &TaskOutput) -> Option<Self> {
        output
            .as_ref()
            .and_then(|value| serde_json::from_value(value.clone()).ok())
    }
}

/// Routes replies of re-sent requests back to the protocol
struct AlignmentReplies(Weak<AlignmentProtocol>);

#[async_trait]
impl AsyncResultHandler for AlignmentReplies {
    async fn on_result(&self, node: NodeId, task: ReplicationTask, result: RemoteResult) {
        let Some(protocol) = self.0.upgrade() else {
            return;
        };
        if let Err(e) = protocol.handle_reply(&node, task.database(), result).await {
            warn!("Cannot process alignment reply from node {}: {}", node, e);
        }
    }
}

/// Alignment state machine of the local node
pub struct AlignmentProtocol {
    local_node: NodeId,
    /// (node, database) -> postponed
    pending: Mutex<HashMap<(NodeId, String), bool>>,
    membership: Arc<MembershipTracker>,
    journal: Arc<dyn OperationJournal>,
    dispatcher: Arc<ReplicationDispatcher>,
    databases: Arc<DatabaseRegistry>,
    /// One alignment round at a time
    round: tokio::sync::Mutex<()>,
}

impl AlignmentProtocol {
    pub fn new(
        membership: Arc<MembershipTracker>,
        journal: Arc<dyn OperationJournal>,
        dispatcher: Arc<ReplicationDispatcher>,
        databases: Arc<DatabaseRegistry>,
    ) -> Self {
        Self {
            local_node: membership.local_node_id().to_string(),
            pending: Mutex::new(HashMap::new()),
            membership,
            journal,
            dispatcher,
            databases,
            round: tokio::sync::Mutex::new(()),
        }
    }

    /// Bring the node online, aligning first when other nodes run
    pub async fn start(self: &Arc<Self>, alignment_at_startup: bool) -> Result<()> {
        if self.membership.remote_nodes().is_empty() {
            warn!("No other running node detected, node {} goes online", self.local_node);
            return self.membership.set_local_status(NodeStatus::Online).await;
        }
        if !alignment_at_startup {
            info!("Alignment at startup disabled, node {} goes online", self.local_node);
            return self.membership.set_local_status(NodeStatus::Online).await;
        }
        self.align_nodes().await
    }

    /// Re-run [`align_nodes`](Self::align_nodes) every `interval` until cancelled
    pub fn spawn_timer(self: &Arc<Self>, interval: Duration, cancel: CancellationToken) -> Option<JoinHandle<()>> {
        if interval.is_zero() {
            return None;
        }

        let protocol = self.clone();
        Some(tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = tokio::time::sleep(interval) => {
                        if let Err(e) = protocol.align_nodes().await {
                            warn!("Periodic alignment failed: {}", e);
                        }
                    }
                }
            }
            debug!("Alignment timer stopped");
        }))
    }

    /// Ask every remote node to replay what the local node is missing
    pub async fn align_nodes(self: &Arc<Self>) -> Result<()> {
        let _round = self.round.lock().await;

        let remote = self.membership.remote_nodes();
        if remote.is_empty() {
            return self.go_online_if_aligned().await;
        }

        let mut requests = Vec::new();
        for database in self.databases_to_align() {
            match self
                .journal
                .last_journaled(&database, OperationStatus::Committed)
                .await
            {
                Ok(checkpoint) if checkpoint.is_none() => {
                    debug!("Nothing journaled for db={}, skipping its alignment", database);
                }
                Ok(checkpoint) => requests.push((database, checkpoint)),
                Err(e) => warn!("Cannot read the checkpoint of db={}: {}", database, e),
            }
        }
        if requests.is_empty() {
            return self.go_online_if_aligned().await;
        }

        for (database, _) in &requests {
            for node in &remote {
                self.begin_alignment(node, database);
            }
        }
        self.membership.set_local_status(NodeStatus::Aligning).await?;

        for (database, checkpoint) in requests {
            warn!(
                "Sending align request in broadcast for db={} from operation {}",
                database, checkpoint
            );
            let task = ReplicationTask::align_request(database.as_str(), checkpoint);
            let config = ReplicationConfig::synchronous(self.local_node.clone(), remote.clone());

            let results = match self.dispatcher.propagate(&task, &config, None).await {
                Ok(results) => results,
                Err(e) => {
                    warn!("Cannot send align request for db={}: {}", database, e);
                    continue;
                }
            };
            for (node, result) in results {
                self.handle_reply(&node, &database, result).await?;
            }
        }

        self.go_online_if_aligned().await
    }

    /// Record that `node` still has to align `database` with the local node
    pub fn begin_alignment(&self, node: &str, database: &str) {
        info!("Setting node {} in alignment state for db={}", node, database);
        self.pending
            .lock()
            .insert((node.to_string(), database.to_string()), false);
    }

    /// `node` finished replaying `database`
    ///
    /// Goes online when nothing is pending anymore, otherwise asks the
    /// nodes that postponed to try again.
    pub async fn end_alignment(self: &Arc<Self>, node: &str, database: &str) -> Result<()> {
        let (remaining, postponed) = {
            let mut pending = self.pending.lock();
            if pending
                .remove(&(node.to_string(), database.to_string()))
                .is_none()
            {
                error!(
                    "Received alignment completion from node {} for db={} that was not pending",
                    node, database
                );
            }

            let postponed: Vec<(NodeId, String)> = pending
                .iter_mut()
                .filter(|(_, postponed)| **postponed)
                .map(|(key, postponed)| {
                    *postponed = false;
                    key.clone()
                })
                .collect();
            (pending.len(), postponed)
        };

        if remaining == 0 {
            info!("Alignment of node {} completed", self.local_node);
            return self.membership.set_local_status(NodeStatus::Online).await;
        }

        for (node, database) in postponed {
            self.resend(&node, &database).await;
        }
        debug!("{} alignments still pending", remaining);
        Ok(())
    }

    /// `node` is catching up itself and will be asked again
    pub fn postpone_alignment(&self, node: &str, database: &str) {
        let mut pending = self.pending.lock();
        match pending.get_mut(&(node.to_string(), database.to_string())) {
            Some(postponed) => *postponed = true,
            None => {
                error!(
                    "Received alignment postponement from node {} for db={} that was not pending",
                    node, database
                );
                pending.insert((node.to_string(), database.to_string()), true);
            }
        }
        info!("Node {} postponed the alignment of db={}", node, database);
    }

    /// Forget the alignments of a node that left the cluster
    pub async fn drop_node(&self, node: &str) -> Result<()> {
        let (dropped, remaining) = {
            let mut pending = self.pending.lock();
            let before = pending.len();
            pending.retain(|(pending_node, _), _| pending_node != node);
            (before - pending.len(), pending.len())
        };

        if dropped > 0 {
            warn!("Dropped {} pending alignments of node {}", dropped, node);
            if remaining == 0 {
                return self.membership.set_local_status(NodeStatus::Online).await;
            }
        }
        Ok(())
    }

    pub fn is_pending(&self, node: &str, database: &str) -> bool {
        self.pending
            .lock()
            .contains_key(&(node.to_string(), database.to_string()))
    }

    pub fn has_pending(&self, database: &str) -> bool {
        self.pending.lock().keys().any(|(_, db)| db == database)
    }

    /// Pending alignments as (node, database, postponed), sorted
    pub fn pending_alignments(&self) -> Vec<(NodeId, String, bool)> {
        let mut pending: Vec<_> = self
            .pending
            .lock()
            .iter()
            .map(|((node, db), postponed)| (node.clone(), db.clone(), *postponed))
            .collect();
        pending.sort();
        pending
    }

    /// Serve an alignment request of `requester`
    ///
    /// A node that is aligning the same database and knows less than the
    /// requester postpones. Otherwise every finalized entry after the
    /// checkpoint is replayed in order: committed ones as they were,
    /// canceled ones as no-ops.
    pub async fn handle_align_request(
        &self,
        requester: &str,
        database: &str,
        checkpoint: OperationId,
    ) -> Result<AlignmentReply> {
        let local_checkpoint = self
            .journal
            .last_journaled(database, OperationStatus::Committed)
            .await?;
        if self.membership.status() == NodeStatus::Aligning
            && self.has_pending(database)
            && local_checkpoint < checkpoint
        {
            info!(
                "Postponing alignment of node {} for db={}: node {} is still aligning",
                requester, database, self.local_node
            );
            return Ok(AlignmentReply::Postponed);
        }

        let entries = self.journal.replay_after(database, checkpoint).await?;
        if !entries.is_empty() {
            info!(
                "Aligning node {} on db={}: replaying {} operations after {}",
                requester,
                database,
                entries.len(),
                checkpoint
            );
        }

        let mut replayed = 0;
        for entry in entries {
            let task = entry.replay_task(database);
            if let Err(failure) = self.dispatcher.send_and_wait(requester, task).await? {
                warn!(
                    "Alignment of node {} on db={} stopped at operation {}: {}",
                    requester, database, entry.operation, failure
                );
                return Err(ReplicationError::Remote(failure));
            }
            replayed += 1;
        }

        Ok(AlignmentReply::Completed { replayed })
    }

    async fn handle_reply(self: &Arc<Self>, node: &str, database: &str, result: RemoteResult) -> Result<()> {
        match result {
            Ok(output) => match AlignmentReply::from_output(&output) {
                Some(AlignmentReply::Completed { replayed }) => {
                    info!(
                        "Node {} aligned db={} with {} operations",
                        node, database, replayed
                    );
                    self.end_alignment(node, database).await
                }
                Some(AlignmentReply::Postponed) => {
                    self.postpone_alignment(node, database);
                    Ok(())
                }
                None => {
                    warn!("Unexpected alignment reply from node {}: {:?}", node, output);
                    Ok(())
                }
            },
            Err(failure) => {
                warn!(
                    "Align request for db={} to node {} failed, retrying on the next round: {}",
                    database, node, failure
                );
                Ok(())
            }
        }
    }

    async fn resend(self: &Arc<Self>, node: &str, database: &str) {
        let checkpoint = match self
            .journal
            .last_journaled(database, OperationStatus::Committed)
            .await
        {
            Ok(checkpoint) => checkpoint,
            Err(e) => {
                warn!("Cannot read the checkpoint of db={}: {}", database, e);
                return;
            }
        };

        info!(
            "Resending align request to node {} for db={} from operation {}",
            node, database, checkpoint
        );
        let task = ReplicationTask::align_request(database, checkpoint)
            .with_source(self.local_node.clone())
            .for_destination(node);
        let replies: Arc<dyn AsyncResultHandler> = Arc::new(AlignmentReplies(Arc::downgrade(self)));
        if let Err(e) = self
            .dispatcher
            .send_task_to_node(node, task, ExecutionMode::Asynchronous, Some(replies))
            .await
        {
            warn!("Cannot resend align request to node {}: {}", node, e);
        }
    }

    async fn go_online_if_aligned(&self) -> Result<()> {
        if self.pending.lock().is_empty() {
            self.membership.set_local_status(NodeStatus::Online).await
        } else {
            Ok(())
        }
    }

    fn databases_to_align(&self) -> BTreeSet<String> {
        self.databases
            .hosted()
            .into_iter()
            .chain(self.journal.databases())
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::DatabaseConfig;
    use crate::journal::MemoryJournal;
    use crate::task::TaskKind;
    use crate::testing::{member, ScriptedTransport};
    use meridian_cluster::{InMemoryCluster, SharedMap};

    const LOCAL: &str = "127.0.0.1:2424";
    const A: &str = "127.0.0.1:2425";
    const B: &str = "127.0.0.1:2426";

    struct Fixture {
        protocol: Arc<AlignmentProtocol>,
        membership: Arc<MembershipTracker>,
        journal: Arc<MemoryJournal>,
        transport: Arc<ScriptedTransport>,
        map: Arc<dyn SharedMap>,
    }

    fn fixture(remote: &[u16]) -> Fixture {
        let cluster = InMemoryCluster::new();
        let local = Arc::new(cluster.join(member(2424)));
        let mut members = vec![member(2424)];
        for port in remote {
            let m = member(*port);
            cluster.join(m.clone());
            members.push(m);
        }

        let map: Arc<dyn SharedMap> = cluster.map("meridian");
        let membership = Arc::new(MembershipTracker::new(
            LOCAL,
            None,
            Vec::new(),
            map.clone(),
            Duration::from_millis(10),
        ));
        membership.register_members(&members);

        let journal = Arc::new(MemoryJournal::new());
        let transport = Arc::new(ScriptedTransport::default());
        let dispatcher = Arc::new(ReplicationDispatcher::new(
            local,
            transport.clone(),
            Duration::from_secs(1),
        ));
        let databases = Arc::new(DatabaseRegistry::new(map.clone()));
        databases.register("demo", DatabaseConfig::default());

        let protocol = Arc::new(AlignmentProtocol::new(
            membership.clone(),
            journal.clone(),
            dispatcher,
            databases,
        ));
        Fixture {
            protocol,
            membership,
            journal,
            transport,
            map,
        }
    }

    async fn commit(journal: &MemoryJournal, task: ReplicationTask, status: OperationStatus) {
        let offset = journal.append(&task).await.unwrap();
        journal.update_status(task.database(), offset, status).await.unwrap();
        journal.advance_last_executed(task.database(), task.operation(), false);
    }

    fn completed(replayed: usize) -> RemoteResult {
        Ok(AlignmentReply::Completed { replayed }.to_output())
    }

    #[tokio::test]
    async fn test_alone_goes_online_without_aligning() {
        let f = fixture(&[]);
        let mut events = f.map.subscribe();

        f.protocol.start(true).await.unwrap();
        assert_eq!(f.membership.status(), NodeStatus::Online);

        let event = events.recv().await.unwrap();
        assert_eq!(event.value()["status"], "online");
        assert!(events.try_recv().is_err());
        assert_eq!(f.transport.call_count(), 0);
    }

    #[tokio::test]
    async fn test_empty_journal_skips_requests() {
        let f = fixture(&[2425, 2426]);
        f.protocol.start(true).await.unwrap();
        assert_eq!(f.membership.status(), NodeStatus::Online);
        assert_eq!(f.transport.call_count(), 0);
    }

    #[tokio::test]
    async fn test_alignment_completes() {
        let f = fixture(&[2425, 2426]);
        commit(
            &f.journal,
            ReplicationTask::replicated("demo", OperationId::new(3, 1), b"a".to_vec()),
            OperationStatus::Committed,
        )
        .await;
        f.transport.reply(A, completed(0));
        f.transport.reply(B, completed(2));

        f.protocol.start(true).await.unwrap();
        assert_eq!(f.membership.status(), NodeStatus::Online);
        assert!(f.protocol.pending_alignments().is_empty());

        let calls = f.transport.calls();
        assert_eq!(calls.len(), 2);
        for (_, task) in calls {
            assert_eq!(
                task.kind(),
                &TaskKind::AlignRequest {
                    checkpoint: OperationId::new(3, 1)
                }
            );
            assert_eq!(task.source(), Some(LOCAL));
        }
    }

    #[tokio::test]
    async fn test_failed_request_stays_pending() {
        let f = fixture(&[2425]);
        commit(
            &f.journal,
            ReplicationTask::replicated("demo", OperationId::new(3, 1), b"a".to_vec()),
            OperationStatus::Committed,
        )
        .await;
        f.transport
            .reply(A, Err(crate::transport::RemoteFailure::transport("down")));

        f.protocol.align_nodes().await.unwrap();
        assert_eq!(f.membership.status(), NodeStatus::Aligning);
        assert!(f.protocol.is_pending(A, "demo"));

        // The next round succeeds
        f.transport.reply(A, completed(0));
        f.protocol.align_nodes().await.unwrap();
        assert_eq!(f.membership.status(), NodeStatus::Online);
    }

    #[tokio::test]
    async fn test_postponed_is_resent_on_completion_of_another() {
        let f = fixture(&[2425, 2426]);
        commit(
            &f.journal,
            ReplicationTask::replicated("demo", OperationId::new(3, 1), b"a".to_vec()),
            OperationStatus::Committed,
        )
        .await;
        f.membership.set_local_status(NodeStatus::Aligning).await.unwrap();
        f.protocol.begin_alignment(A, "demo");
        f.protocol.begin_alignment(B, "demo");
        f.protocol.postpone_alignment(B, "demo");
        assert_eq!(
            f.protocol.pending_alignments(),
            vec![
                (A.to_string(), "demo".to_string(), false),
                (B.to_string(), "demo".to_string(), true)
            ]
        );

        f.transport.reply(B, completed(1));
        f.protocol.end_alignment(A, "demo").await.unwrap();

        // The resent request is answered asynchronously
        for _ in 0..50 {
            if f.membership.status() == NodeStatus::Online {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert_eq!(f.membership.status(), NodeStatus::Online);
        let calls = f.transport.calls();
        assert_eq!(calls.len(), 1);
        assert_eq!(calls[0].0, B);
        assert_eq!(
            calls[0].1.kind(),
            &TaskKind::AlignRequest {
                checkpoint: OperationId::new(3, 1)
            }
        );
    }

    #[tokio::test]
    async fn test_unknown_completion_is_not_fatal() {
        let f = fixture(&[2425]);
        f.membership.set_local_status(NodeStatus::Aligning).await.unwrap();
        f.protocol.end_alignment(A, "demo").await.unwrap();
        assert_eq!(f.membership.status(), NodeStatus::Online);
    }

    #[tokio::test]
    async fn test_departed_node_alignments_dropped() {
        let f = fixture(&[2425, 2426]);
        f.membership.set_local_status(NodeStatus::Aligning).await.unwrap();
        f.protocol.begin_alignment(A, "demo");
        f.protocol.begin_alignment(A, "other");

        f.protocol.drop_node(B).await.unwrap();
        assert_eq!(f.membership.status(), NodeStatus::Aligning);

        f.protocol.drop_node(A).await.unwrap();
        assert!(!f.protocol.has_pending("demo"));
        assert_eq!(f.membership.status(), NodeStatus::Online);
    }

    #[tokio::test]
    async fn test_serving_replays_in_order() {
        let f = fixture(&[2425]);
        commit(
            &f.journal,
            ReplicationTask::replicated("demo", OperationId::new(5, 1), b"a".to_vec()),
            OperationStatus::Committed,
        )
        .await;
        commit(
            &f.journal,
            ReplicationTask::replicated("demo", OperationId::new(5, 2), b"b".to_vec()),
            OperationStatus::Canceled,
        )
        .await;
        commit(
            &f.journal,
            ReplicationTask::replicated("demo", OperationId::new(5, 3), b"c".to_vec()),
            OperationStatus::Committed,
        )
        .await;

        let reply = f
            .protocol
            .handle_align_request(A, "demo", OperationId::new(5, 1))
            .await
            .unwrap();
        assert_eq!(reply, AlignmentReply::Completed { replayed: 2 });

        let calls = f.transport.calls();
        assert_eq!(calls.len(), 2);
        assert_eq!(calls[0].1.operation(), OperationId::new(5, 2));
        assert_eq!(calls[0].1.kind(), &TaskKind::NoOp);
        assert_eq!(calls[1].1.operation(), OperationId::new(5, 3));
        assert_eq!(
            calls[1].1.kind(),
            &TaskKind::Replicated {
                payload: b"c".to_vec()
            }
        );
        assert_eq!(calls[1].1.source(), Some(LOCAL));
    }

    #[tokio::test]
    async fn test_aligning_node_behind_postpones() {
        let f = fixture(&[2425, 2426]);
        f.membership.set_local_status(NodeStatus::Aligning).await.unwrap();
        f.protocol.begin_alignment(B, "demo");

        let reply = f
            .protocol
            .handle_align_request(A, "demo", OperationId::new(5, 3))
            .await
            .unwrap();
        assert_eq!(reply, AlignmentReply::Postponed);
        assert_eq!(f.transport.call_count(), 0);
    }

    #[test]
    fn test_reply_encoding() {
        let output = AlignmentReply::Completed { replayed: 4 }.to_output();
        assert_eq!(output.as_ref().unwrap()["alignment"], "completed");
        assert_eq!(
            AlignmentReply::from_output(&output),
            Some(AlignmentReply::Completed { replayed: 4 })
        );
        assert_eq!(AlignmentReply::from_output(&Some(serde_json::json!(3))), None);
        assert_eq!(AlignmentReply::from_output(&None), None);
    }

    #[tokio::test]
    async fn test_timer_disabled_with_zero_interval() {
        let f = fixture(&[]);
        assert!(f
            .protocol
            .spawn_timer(Duration::ZERO, CancellationToken::new())
            .is_none());

        let cancel = CancellationToken::new();
        let timer = f
            .protocol
            .spawn_timer(Duration::from_millis(10), cancel.clone())
            .unwrap();
        tokio::time::sleep(Duration::from_millis(30)).await;
        cancel.cancel();
        timer.await.unwrap();
        assert_eq!(f.membership.status(), NodeStatus::Online);
    }
}
