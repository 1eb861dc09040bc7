//! The relay node: wires registry, engine, RPC and peers together.
//!
//! Transports call the `on_peer_*` hooks; the HTTP content handlers go
//! through [`Node::registry`]/[`Node::engine`] and the notification
//! helpers.  The node is also the [`NodeOps`] implementation the
//! dispatcher routes signalling operations into.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tracing::{debug, info, warn};

use ferry_protocol::{methods, update_file_size_params, PushParams, TransferStatus};

use crate::config::RelayConfig;
use crate::dispatcher::{self, NodeOps};
use crate::engine::TransferEngine;
use crate::peers::{Peer, PeerHub};
use crate::registry::{NewSource, RegisterError, SourceRegistry};
use crate::rpc::RpcMux;
use crate::transfer::Transfer;

pub struct Node {
    registry: SourceRegistry,
    engine: Arc<TransferEngine>,
    rpc: Arc<RpcMux>,
    hub: Arc<PeerHub>,
}

impl Node {
    #[must_use]
    pub fn new(config: &RelayConfig) -> Arc<Self> {
        let rpc = Arc::new(RpcMux::new());
        // One coarse per-pump ceiling from the tighter of the two knobs.
        let pace = match (config.node.max_bandwidth_in, config.node.max_bandwidth_out) {
            (0, out) => out,
            (inb, 0) => inb,
            (inb, out) => inb.min(out),
        };
        Arc::new(Self {
            registry: SourceRegistry::new(
                &config.node.id,
                &config.node.key,
                config.node.source_id_start_depth,
            ),
            engine: Arc::new(TransferEngine::new(
                Arc::clone(&rpc),
                Duration::from_secs(config.node.transfer_start_timeout),
                pace,
            )),
            rpc,
            hub: Arc::new(PeerHub::new()),
        })
    }

    #[must_use]
    pub fn registry(&self) -> &SourceRegistry {
        &self.registry
    }

    #[must_use]
    pub fn engine(&self) -> &Arc<TransferEngine> {
        &self.engine
    }

    #[must_use]
    pub fn rpc(&self) -> &Arc<RpcMux> {
        &self.rpc
    }

    #[must_use]
    pub fn hub(&self) -> &Arc<PeerHub> {
        &self.hub
    }

    // -- peer lifecycle ----------------------------------------------------

    pub fn on_peer_open(&self, peer: &Arc<Peer>) {
        info!(peer_id = %peer.id(), "new peer");
    }

    /// One inbound text frame from a transport.  Per-peer FIFO holds
    /// because each transport feeds frames of one peer sequentially.
    pub async fn on_peer_frame(&self, peer: &Arc<Peer>, frame: &str) {
        if let Some(incoming) = self.rpc.handle_frame(peer, frame) {
            dispatcher::dispatch(self, peer, incoming).await;
        }
    }

    /// A peer's transport went away.  Its sources are released (active
    /// transfers see the cancellation) and transfers targeting it abort.
    pub fn on_peer_closed(&self, peer: &Arc<Peer>, graceful: bool) {
        info!(peer_id = %peer.id(), graceful, "peer closed");
        self.rpc.drop_peer(peer.id());
        self.registry.release_peer(peer.id());
        self.engine.on_peer_closed(peer.id());
    }

    // -- notifications -----------------------------------------------------

    /// Ask the seeder to push for a freshly created transfer.
    pub async fn notify_file_transfer_new(&self, transfer: &Transfer) -> bool {
        let Some(owner) = transfer.source().owner_peer() else {
            warn!(
                source_id = %transfer.source().id(),
                "cannot request push, owner peer is gone"
            );
            return false;
        };
        let params = PushParams {
            source_id: transfer.source().id().to_owned(),
            transfer_id: transfer.id().to_owned(),
            range: transfer.requested_range(),
        }
        .to_params();
        self.rpc
            .notify(&owner, methods::FILE_TRANSFER_NEW, &params)
            .await
    }

    /// Tell the target peer that the seeder's push has paired.
    pub async fn notify_transfer_started(&self, transfer: &Transfer) {
        let Some(target) = transfer.target_peer() else {
            return;
        };
        let params = ferry_protocol::transfer_started_params(
            transfer.id(),
            transfer.source().name(),
            transfer.source().size(),
        );
        self.rpc
            .notify(&target, methods::TRANSFER_STARTED, &params)
            .await;
    }

    /// The seeder's `PUT` announced a different length: adopt it and tell
    /// the seeder's own peer.
    pub async fn adopt_size_change(&self, transfer: &Transfer, new_size: u64) {
        let source = transfer.source();
        info!(
            source_id = %source.id(),
            old_size = source.size(),
            new_size,
            "seeder push changed the source size"
        );
        source.set_size(new_size);
        if let Some(owner) = source.owner_peer() {
            self.rpc
                .notify(
                    &owner,
                    methods::UPDATE_FILE_SIZE,
                    &update_file_size_params(source.id(), new_size),
                )
                .await;
        }
    }
}

#[async_trait]
impl NodeOps for Node {
    async fn register_source(
        &self,
        peer: &Arc<Peer>,
        source: NewSource,
    ) -> Result<(String, String), RegisterError> {
        let source = self.registry.register(peer, source)?;
        Ok((source.id().to_owned(), source.signature().to_owned()))
    }

    async fn unregister_source(&self, peer: &Arc<Peer>, id: &str, force: bool) -> bool {
        self.registry.unregister(peer, id, force)
    }

    async fn push_request(&self, peer: &Arc<Peer>, push: PushParams) {
        // The actual pairing happens when the HTTP PUT arrives; this only
        // checks the announcement names a transfer still waiting for one.
        match self.engine.lookup(&push.transfer_id) {
            Some(transfer) if transfer.status() == TransferStatus::NotStarted => {
                debug!(
                    peer_id = %peer.id(),
                    transfer_id = %push.transfer_id,
                    "push announced"
                );
            }
            Some(_) => {
                debug!(transfer_id = %push.transfer_id, "push announced for a started transfer");
            }
            None => {
                debug!(
                    peer_id = %peer.id(),
                    transfer_id = %push.transfer_id,
                    "push announced for unknown transfer"
                );
            }
        }
    }

    async fn cancel_transfer(&self, _peer: &Arc<Peer>, transfer_id: &str) -> bool {
        match self.engine.lookup(transfer_id) {
            Some(transfer) => {
                self.engine.cancel(&transfer);
                true
            }
            None => false,
        }
    }
}
