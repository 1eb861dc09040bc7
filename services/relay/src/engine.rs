//! Transfer engine: owns every live transfer and both transfer indices.
//!
//! Creation happens on a content `GET`, pairing on the matching `PUT`;
//! the engine tracks who is interested in which transfer, runs the 1 Hz
//! status ticker while anything is alive, and fans out
//! `transfer-finished` when a transfer reaches a terminal status.
//!
//! All index mutation goes through engine methods.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use serde_json::json;
use tracing::{debug, info};
use uuid::Uuid;

use ferry_protocol::{methods, transfer_finished_params, ByteRange, TransferStatus};

use crate::peers::{Peer, PeerId};
use crate::registry::Source;
use crate::rpc::RpcMux;
use crate::transfer::{Action, PairedResponse, Transfer};

struct Entry {
    transfer: Arc<Transfer>,
    /// Peers indexed for this transfer at creation time.
    peers: Vec<PeerId>,
}

struct Inner {
    by_id: HashMap<String, Entry>,
    by_peer: HashMap<PeerId, Vec<String>>,
    ticker_running: bool,
}

pub struct TransferEngine {
    inner: Mutex<Inner>,
    rpc: Arc<RpcMux>,
    start_timeout: Duration,
    /// Per-pump byte-rate ceiling; 0 = unlimited.
    pace_bytes_per_sec: u64,
}

impl TransferEngine {
    #[must_use]
    pub fn new(rpc: Arc<RpcMux>, start_timeout: Duration, pace_bytes_per_sec: u64) -> Self {
        Self {
            inner: Mutex::new(Inner {
                by_id: HashMap::new(),
                by_peer: HashMap::new(),
                ticker_running: false,
            }),
            rpc,
            start_timeout,
            pace_bytes_per_sec,
        }
    }

    #[must_use]
    pub fn start_timeout(&self) -> Duration {
        self.start_timeout
    }

    #[must_use]
    pub fn pace_bytes_per_sec(&self) -> u64 {
        self.pace_bytes_per_sec
    }

    /// Allocate a transfer for `(source, leecher)` and index it.  Returns
    /// the pairing receiver the leecher side must await.
    pub fn create_transfer(
        self: &Arc<Self>,
        source: Arc<Source>,
        action: Action,
        range: Option<ByteRange>,
        target_peer: Option<&Arc<Peer>>,
    ) -> (Arc<Transfer>, tokio::sync::oneshot::Receiver<PairedResponse>) {
        let id = Uuid::new_v4().simple().to_string();
        let (transfer, pair_rx) = Transfer::new(id, source, action, range, target_peer);

        let mut peers = vec![transfer.source().owner_peer_id()];
        if let Some(target) = transfer.target_peer_id() {
            if !peers.iter().any(|p| p == target) {
                peers.push(target.to_owned());
            }
        }

        let mut inner = self.inner.lock().expect("engine lock poisoned");
        for peer in &peers {
            inner
                .by_peer
                .entry(peer.clone())
                .or_default()
                .push(transfer.id().to_owned());
        }
        inner.by_id.insert(
            transfer.id().to_owned(),
            Entry {
                transfer: Arc::clone(&transfer),
                peers,
            },
        );
        let spawn_ticker = !inner.ticker_running;
        if spawn_ticker {
            inner.ticker_running = true;
        }
        drop(inner);

        if spawn_ticker {
            let engine = Arc::clone(self);
            tokio::spawn(async move { engine.run_ticker().await });
        }

        info!(
            transfer_id = %transfer.id(),
            source_id = %transfer.source().id(),
            "transfer created"
        );
        (transfer, pair_rx)
    }

    #[must_use]
    pub fn lookup(&self, transfer_id: &str) -> Option<Arc<Transfer>> {
        self.inner
            .lock()
            .expect("engine lock poisoned")
            .by_id
            .get(transfer_id)
            .map(|e| Arc::clone(&e.transfer))
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.inner.lock().expect("engine lock poisoned").by_id.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// The start timeout fired before any `PUT` paired.
    pub fn expire_unpaired(self: &Arc<Self>, transfer: &Arc<Transfer>) {
        if transfer.finish(TransferStatus::Error) {
            debug!(transfer_id = %transfer.id(), "no seeder push before start timeout");
            self.finalize(transfer);
        }
    }

    /// The leecher went away (connection dropped) before or during the
    /// transfer; terminal bookkeeping if nothing else got there first.
    pub fn abort_target_gone(self: &Arc<Self>, transfer: &Arc<Transfer>) {
        if transfer.finish(TransferStatus::TargetAborted) {
            transfer.cancel_token().cancel();
            self.finalize(transfer);
        }
    }

    /// Cooperative cancel (protocol `cancelTransfer` or internal);
    /// surfaces as `SOURCE_ABORTED` per the state machine.
    pub fn cancel(self: &Arc<Self>, transfer: &Arc<Transfer>) {
        let finished = transfer.finish(TransferStatus::SourceAborted);
        transfer.cancel_token().cancel();
        if finished {
            self.finalize(transfer);
        }
    }

    /// A pump reached its terminal status; tear the transfer down.
    pub fn pump_finished(self: &Arc<Self>, transfer: &Arc<Transfer>, status: TransferStatus) {
        debug_assert!(status.is_terminal());
        // The pump already performed the status transition.
        self.finalize(transfer);
    }

    /// A signalling peer closed: abort the transfers that named it as
    /// their target.  (Seeder-side loss arrives via source cancellation.)
    pub fn on_peer_closed(self: &Arc<Self>, peer_id: &str) {
        let targeted: Vec<Arc<Transfer>> = {
            let inner = self.inner.lock().expect("engine lock poisoned");
            let Some(ids) = inner.by_peer.get(peer_id) else {
                return;
            };
            ids.iter()
                .filter_map(|id| inner.by_id.get(id))
                .filter(|e| e.transfer.target_peer_id() == Some(peer_id))
                .map(|e| Arc::clone(&e.transfer))
                .collect()
        };
        for transfer in targeted {
            self.abort_target_gone(&transfer);
        }
    }

    /// Remove the transfer from both indices and notify interested peers.
    fn finalize(self: &Arc<Self>, transfer: &Arc<Transfer>) {
        let status = transfer.status();
        debug_assert!(status.is_terminal());

        let entry = {
            let mut inner = self.inner.lock().expect("engine lock poisoned");
            let entry = inner.by_id.remove(transfer.id());
            if let Some(entry) = &entry {
                for peer in &entry.peers {
                    let emptied = match inner.by_peer.get_mut(peer) {
                        Some(ids) => {
                            ids.retain(|id| id != transfer.id());
                            ids.is_empty()
                        }
                        None => false,
                    };
                    if emptied {
                        inner.by_peer.remove(peer);
                    }
                }
            }
            entry
        };
        // Already finalized by a racing path.
        let Some(_entry) = entry else { return };

        info!(transfer_id = %transfer.id(), status = status.as_str(), "transfer removed");

        let rpc = Arc::clone(&self.rpc);
        let transfer = Arc::clone(transfer);
        tokio::spawn(async move {
            let params = transfer_finished_params(transfer.id(), status);
            let mut notified: Vec<PeerId> = Vec::new();
            if let Some(owner) = transfer.source().owner_peer() {
                rpc.notify(&owner, methods::TRANSFER_FINISHED, &params).await;
                notified.push(owner.id().to_owned());
            }
            if let Some(target) = transfer.target_peer() {
                if !notified.iter().any(|p| p == target.id()) {
                    rpc.notify(&target, methods::TRANSFER_FINISHED, &params).await;
                }
            }
        });
    }

    /// One periodic tick reports progress to every peer with at least one
    /// active transfer; the task parks itself when no transfers remain.
    async fn run_ticker(self: Arc<Self>) {
        let mut interval = tokio::time::interval(Duration::from_secs(1));
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        interval.tick().await;

        loop {
            interval.tick().await;

            let mut per_peer: HashMap<PeerId, Vec<Arc<Transfer>>> = HashMap::new();
            {
                let mut inner = self.inner.lock().expect("engine lock poisoned");
                if inner.by_id.is_empty() {
                    inner.ticker_running = false;
                    debug!("status ticker stopped, no transfers remain");
                    return;
                }
                for entry in inner.by_id.values() {
                    for peer in &entry.peers {
                        per_peer
                            .entry(peer.clone())
                            .or_default()
                            .push(Arc::clone(&entry.transfer));
                    }
                }
            }

            for (peer_id, transfers) in per_peer {
                if !transfers
                    .iter()
                    .any(|t| t.status() == TransferStatus::Active)
                {
                    continue;
                }
                let peer = transfers.iter().find_map(|t| {
                    if t.source().owner_peer_id() == peer_id {
                        t.source().owner_peer()
                    } else {
                        t.target_peer()
                    }
                });
                let Some(peer) = peer else { continue };

                let entries: Vec<_> = transfers.iter().map(|t| t.snapshot()).collect();
                // Lossy on purpose: a report missed by a full queue is
                // superseded by the next tick.
                self.rpc
                    .notify_lossy(&peer, methods::TRANSFER_STATUS, &json!(entries));
            }
        }
    }
}

/// Drop-armed cleanup for the pre-pairing window: if the leecher's `GET`
/// future is dropped while waiting for the seeder, the transfer is torn
/// down instead of lingering until the start timeout.
pub struct LeecherGuard {
    engine: Arc<TransferEngine>,
    transfer: Arc<Transfer>,
    armed: bool,
}

impl LeecherGuard {
    #[must_use]
    pub fn new(engine: Arc<TransferEngine>, transfer: Arc<Transfer>) -> Self {
        Self {
            engine,
            transfer,
            armed: true,
        }
    }

    /// The handler regained control; cleanup is its problem again.
    pub fn defuse(mut self) {
        self.armed = false;
    }
}

impl Drop for LeecherGuard {
    fn drop(&mut self) {
        if self.armed {
            self.engine.abort_target_gone(&self.transfer);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::peers::PeerHub;
    use crate::registry::{NewSource, SourceRegistry};
    use ferry_protocol::{Envelope, SourceFlags};
    use serde_json::Value;

    fn engine(rpc: Arc<RpcMux>) -> Arc<TransferEngine> {
        Arc::new(TransferEngine::new(rpc, Duration::from_secs(30), 0))
    }

    fn source_for(hub: &PeerHub) -> (Arc<Source>, Arc<Peer>, tokio::sync::mpsc::Receiver<String>) {
        let (peer, rx) = hub.create_peer();
        let registry = SourceRegistry::new("t", "key", 8);
        let source = registry
            .register(
                &peer,
                NewSource {
                    name: "hi.txt".to_owned(),
                    content_type: "text/plain".to_owned(),
                    size: 5,
                    flags: SourceFlags::NONE,
                    tags: vec![],
                    claim: None,
                },
            )
            .unwrap();
        (source, peer, rx)
    }

    async fn next_notification(rx: &mut tokio::sync::mpsc::Receiver<String>) -> (String, Value) {
        loop {
            let frame = tokio::time::timeout(Duration::from_secs(5), rx.recv())
                .await
                .expect("frame within deadline")
                .expect("peer outbox open");
            if let Ok(Envelope::Notification { method, params }) = Envelope::parse(&frame) {
                return (method, params);
            }
        }
    }

    #[tokio::test]
    async fn expired_transfer_is_removed_and_finished_as_error() {
        let hub = PeerHub::new();
        let rpc = Arc::new(RpcMux::new());
        let engine = engine(Arc::clone(&rpc));
        let (source, _peer, mut peer_rx) = source_for(&hub);

        let (transfer, _pair_rx) =
            engine.create_transfer(source, Action::Download, None, None);
        assert_eq!(engine.len(), 1);
        assert!(engine.lookup(transfer.id()).is_some());

        engine.expire_unpaired(&transfer);
        assert_eq!(transfer.status(), TransferStatus::Error);
        assert!(engine.lookup(transfer.id()).is_none());
        assert!(engine.is_empty());

        let (method, params) = next_notification(&mut peer_rx).await;
        assert_eq!(method, "transfer-finished");
        assert_eq!(params[0], Value::String(transfer.id().to_owned()));
        assert_eq!(params[1], Value::String("ERROR".to_owned()));
    }

    #[tokio::test]
    async fn cancel_drives_source_aborted_and_cancels_the_token() {
        let hub = PeerHub::new();
        let rpc = Arc::new(RpcMux::new());
        let engine = engine(Arc::clone(&rpc));
        let (source, _peer, mut peer_rx) = source_for(&hub);

        let (transfer, _pair_rx) =
            engine.create_transfer(source, Action::Download, None, None);
        engine.cancel(&transfer);

        assert_eq!(transfer.status(), TransferStatus::SourceAborted);
        assert!(transfer.cancel_token().is_cancelled());
        assert!(engine.is_empty());

        let (method, params) = next_notification(&mut peer_rx).await;
        assert_eq!(method, "transfer-finished");
        assert_eq!(params[1], Value::String("SOURCE_ABORTED".to_owned()));
    }

    #[tokio::test]
    async fn target_peer_close_aborts_only_its_transfers() {
        let hub = PeerHub::new();
        let rpc = Arc::new(RpcMux::new());
        let engine = engine(Arc::clone(&rpc));
        let (source, _seeder, _seeder_rx) = source_for(&hub);
        let (target, _target_rx) = hub.create_peer();

        let (targeted, _rx_a) = engine.create_transfer(
            Arc::clone(&source),
            Action::Download,
            None,
            Some(&target),
        );
        let (untargeted, _rx_b) =
            engine.create_transfer(Arc::clone(&source), Action::Download, None, None);

        engine.on_peer_closed(target.id());

        assert_eq!(targeted.status(), TransferStatus::TargetAborted);
        assert_eq!(untargeted.status(), TransferStatus::NotStarted);
        assert!(engine.lookup(targeted.id()).is_none());
        assert!(engine.lookup(untargeted.id()).is_some());
    }

    #[tokio::test]
    async fn dropped_guard_tears_the_transfer_down() {
        let hub = PeerHub::new();
        let rpc = Arc::new(RpcMux::new());
        let engine = engine(Arc::clone(&rpc));
        let (source, _peer, _peer_rx) = source_for(&hub);

        let (transfer, _pair_rx) =
            engine.create_transfer(source, Action::Download, None, None);
        drop(LeecherGuard::new(Arc::clone(&engine), Arc::clone(&transfer)));

        assert_eq!(transfer.status(), TransferStatus::TargetAborted);
        assert!(engine.is_empty());
    }

    #[tokio::test]
    async fn defused_guard_leaves_the_transfer_alone() {
        let hub = PeerHub::new();
        let rpc = Arc::new(RpcMux::new());
        let engine = engine(Arc::clone(&rpc));
        let (source, _peer, _peer_rx) = source_for(&hub);

        let (transfer, _pair_rx) =
            engine.create_transfer(source, Action::Download, None, None);
        LeecherGuard::new(Arc::clone(&engine), Arc::clone(&transfer)).defuse();

        assert_eq!(transfer.status(), TransferStatus::NotStarted);
        assert_eq!(engine.len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn ticker_reports_active_transfers_and_stops_when_idle() {
        let hub = PeerHub::new();
        let rpc = Arc::new(RpcMux::new());
        let engine = engine(Arc::clone(&rpc));
        let (source, _peer, mut peer_rx) = source_for(&hub);

        let (transfer, mut pair_rx) =
            engine.create_transfer(source, Action::Download, None, None);
        let tx = crate::transfer::pair(&transfer, 5).expect("pairing succeeds");
        let _body = pair_rx.try_recv().expect("paired").body;

        let (method, params) = next_notification(&mut peer_rx).await;
        assert_eq!(method, "transfer-status");
        let entries = params.as_array().expect("status array");
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0]["id"], Value::String(transfer.id().to_owned()));
        assert_eq!(entries[0]["status"], Value::String("ACTIVE".to_owned()));

        drop(tx);
        transfer.finish(TransferStatus::Completed);
        engine.pump_finished(&transfer, TransferStatus::Completed);
        assert!(engine.is_empty());
    }
}
