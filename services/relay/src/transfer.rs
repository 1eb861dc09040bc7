//! A single leecher/seeder byte-pump session.
//!
//! The transfer is one state machine in one place: created by a content
//! `GET`, paired by the matching `PUT`, driven by [`run_pump`] until a
//! terminal status.  Bytes flow from the seeder's request body into a
//! bounded channel drained by the leecher's response body; a full channel
//! suspends the read side, which is the backpressure of the design — at no
//! point is more than a few blocks buffered in the relay.

use std::sync::atomic::{AtomicU64, AtomicU8, Ordering};
use std::sync::{Arc, Mutex, Weak};
use std::time::{Duration, Instant};

use bytes::Bytes;
use futures_util::{Stream, StreamExt};
use tokio::sync::{mpsc, oneshot};
use tokio_util::sync::CancellationToken;
use tracing::debug;

use ferry_protocol::{ByteRange, TransferStatus, TransferStatusEntry};

use crate::peers::{Peer, PeerId};
use crate::registry::Source;

/// Pump block size: reads and writes are re-chunked to at most this many
/// bytes per step.
pub const BLOCK_SIZE: usize = 16 * 1024;

/// Blocks the body channel may hold before the pump stalls.
const BODY_CHANNEL_BLOCKS: usize = 4;

// ---------------------------------------------------------------------------
// Actions
// ---------------------------------------------------------------------------

/// What the leecher asked the browser to do with the bytes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Action {
    Download,
    View,
    Open,
}

impl Action {
    /// Unknown actions fall back to plain download.
    #[must_use]
    pub fn parse(raw: Option<&str>) -> Self {
        match raw {
            Some("view") => Action::View,
            Some("open") => Action::Open,
            _ => Action::Download,
        }
    }

    /// Downloads are served as an attachment; `view`/`open` render inline.
    #[must_use]
    pub fn as_attachment(self) -> bool {
        matches!(self, Action::Download)
    }
}

// ---------------------------------------------------------------------------
// Range resolution
// ---------------------------------------------------------------------------

/// Transfer length and `Content-Range` numbers, computed once the final
/// source size is known (the seeder's `PUT` may still change it).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ResolvedLen {
    pub transfer_len: u64,
    /// `(start, end, total)` when this is a partial response.
    pub content_range: Option<(u64, u64, u64)>,
}

/// Clamp a requested range against the source size.
///
/// An omitted or `-1` end means "to the last byte"; an oversized end is
/// clamped.  Callers must have rejected unsatisfiable starts already.
#[must_use]
pub fn resolve_len(range: Option<ByteRange>, size: u64) -> ResolvedLen {
    match range {
        None => ResolvedLen {
            transfer_len: size,
            content_range: None,
        },
        Some(range) => {
            let last = size.saturating_sub(1);
            let end = range.end.map_or(last, |e| e.min(last));
            let start = range.start.min(end);
            ResolvedLen {
                transfer_len: end - start + 1,
                content_range: Some((start, end, size)),
            }
        }
    }
}

// ---------------------------------------------------------------------------
// Transfer
// ---------------------------------------------------------------------------

/// Error fed into the leecher body stream when a pump dies mid-flight, so
/// the connection is torn down instead of ending cleanly short.
#[derive(Debug, thiserror::Error)]
pub enum PumpError {
    #[error("transfer aborted")]
    Aborted,
    #[error("seeder stream failed: {0}")]
    SourceStream(String),
}

/// Everything the waiting `GET` handler needs once the `PUT` pairs.
pub struct PairedResponse {
    pub resolved: ResolvedLen,
    pub body: mpsc::Receiver<Result<Bytes, PumpError>>,
}

pub struct Transfer {
    id: String,
    source: Arc<Source>,
    action: Action,
    requested_range: Option<ByteRange>,
    target_peer_id: Option<PeerId>,
    target_peer: Mutex<Weak<Peer>>,
    status: AtomicU8,
    transferred: AtomicU64,
    transfer_len: AtomicU64,
    bandwidth: AtomicU64,
    pairing: Mutex<Option<oneshot::Sender<PairedResponse>>>,
    cancel: CancellationToken,
}

impl Transfer {
    /// Create an unpaired transfer and the receiver on which the leecher
    /// side awaits the seeder's `PUT`.
    pub fn new(
        id: String,
        source: Arc<Source>,
        action: Action,
        range: Option<ByteRange>,
        target_peer: Option<&Arc<Peer>>,
    ) -> (Arc<Self>, oneshot::Receiver<PairedResponse>) {
        let (pair_tx, pair_rx) = oneshot::channel();
        let initial_len = resolve_len(range, source.size()).transfer_len;
        let transfer = Arc::new(Self {
            id,
            cancel: source.cancel_token().child_token(),
            source,
            action,
            requested_range: range,
            target_peer_id: target_peer.map(|p| p.id().to_owned()),
            target_peer: Mutex::new(target_peer.map_or_else(Weak::new, Arc::downgrade)),
            status: AtomicU8::new(status_to_u8(TransferStatus::NotStarted)),
            transferred: AtomicU64::new(0),
            transfer_len: AtomicU64::new(initial_len),
            bandwidth: AtomicU64::new(0),
            pairing: Mutex::new(Some(pair_tx)),
        });
        (transfer, pair_rx)
    }

    #[must_use]
    pub fn id(&self) -> &str {
        &self.id
    }

    #[must_use]
    pub fn source(&self) -> &Arc<Source> {
        &self.source
    }

    #[must_use]
    pub fn action(&self) -> Action {
        self.action
    }

    #[must_use]
    pub fn requested_range(&self) -> Option<ByteRange> {
        self.requested_range
    }

    #[must_use]
    pub fn target_peer_id(&self) -> Option<&str> {
        self.target_peer_id.as_deref()
    }

    #[must_use]
    pub fn target_peer(&self) -> Option<Arc<Peer>> {
        self.target_peer
            .lock()
            .expect("target peer lock poisoned")
            .upgrade()
    }

    #[must_use]
    pub fn status(&self) -> TransferStatus {
        u8_to_status(self.status.load(Ordering::Acquire))
    }

    #[must_use]
    pub fn transferred(&self) -> u64 {
        self.transferred.load(Ordering::Acquire)
    }

    #[must_use]
    pub fn transfer_len(&self) -> u64 {
        self.transfer_len.load(Ordering::Acquire)
    }

    #[must_use]
    pub fn bandwidth(&self) -> u64 {
        self.bandwidth.load(Ordering::Acquire)
    }

    #[must_use]
    pub fn cancel_token(&self) -> &CancellationToken {
        &self.cancel
    }

    #[must_use]
    pub fn snapshot(&self) -> TransferStatusEntry {
        TransferStatusEntry {
            id: self.id.clone(),
            status: self.status(),
            transferred: self.transferred(),
            bandwidth: self.bandwidth(),
        }
    }

    /// Take the pairing slot.  The first `PUT` wins; later ones see `None`.
    pub fn take_pairing(&self) -> Option<oneshot::Sender<PairedResponse>> {
        self.pairing.lock().expect("pairing lock poisoned").take()
    }

    /// NOT_STARTED -> ACTIVE, exactly once.
    pub fn activate(&self) -> bool {
        self.status
            .compare_exchange(
                status_to_u8(TransferStatus::NotStarted),
                status_to_u8(TransferStatus::Active),
                Ordering::AcqRel,
                Ordering::Acquire,
            )
            .is_ok()
    }

    /// Move to a terminal status.  The first terminal transition wins;
    /// returns whether this call performed it.
    pub fn finish(&self, status: TransferStatus) -> bool {
        debug_assert!(status.is_terminal());
        let mut current = self.status.load(Ordering::Acquire);
        loop {
            if u8_to_status(current).is_terminal() {
                return false;
            }
            match self.status.compare_exchange(
                current,
                status_to_u8(status),
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                Ok(_) => {
                    debug!(transfer_id = %self.id, status = status.as_str(), "transfer finished");
                    return true;
                }
                Err(actual) => current = actual,
            }
        }
    }

    fn set_transfer_len(&self, len: u64) {
        self.transfer_len.store(len, Ordering::Release);
    }

    fn add_transferred(&self, n: u64) {
        self.transferred.fetch_add(n, Ordering::AcqRel);
    }

    fn set_bandwidth(&self, rate: u64) {
        self.bandwidth.store(rate, Ordering::Release);
    }
}

impl std::fmt::Debug for Transfer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Transfer")
            .field("id", &self.id)
            .field("source", &self.source.id())
            .field("status", &self.status())
            .field("transferred", &self.transferred())
            .field("transfer_len", &self.transfer_len())
            .finish()
    }
}

fn status_to_u8(status: TransferStatus) -> u8 {
    match status {
        TransferStatus::NotStarted => 0,
        TransferStatus::Active => 1,
        TransferStatus::Paused => 2,
        TransferStatus::Completed => 3,
        TransferStatus::SourceAborted => 4,
        TransferStatus::TargetAborted => 5,
        TransferStatus::Error => 6,
        TransferStatus::Cancelled => 7,
    }
}

fn u8_to_status(raw: u8) -> TransferStatus {
    match raw {
        1 => TransferStatus::Active,
        2 => TransferStatus::Paused,
        3 => TransferStatus::Completed,
        4 => TransferStatus::SourceAborted,
        5 => TransferStatus::TargetAborted,
        6 => TransferStatus::Error,
        7 => TransferStatus::Cancelled,
        _ => TransferStatus::NotStarted,
    }
}

// ---------------------------------------------------------------------------
// Pairing
// ---------------------------------------------------------------------------

/// Pair the seeder's `PUT` with the waiting leecher and hand back the
/// channel the pump writes into.  Fails when the transfer was already
/// paired, already terminal, or the leecher went away before pairing.
pub fn pair(
    transfer: &Transfer,
    final_size: u64,
) -> Option<mpsc::Sender<Result<Bytes, PumpError>>> {
    let pairing = transfer.take_pairing()?;
    if transfer.status().is_terminal() {
        return None;
    }

    let resolved = resolve_len(transfer.requested_range(), final_size);
    transfer.set_transfer_len(resolved.transfer_len);

    let (tx, rx) = mpsc::channel(BODY_CHANNEL_BLOCKS);
    if pairing
        .send(PairedResponse {
            resolved,
            body: rx,
        })
        .is_err()
    {
        // The GET handler is gone; nobody will drain the body.
        transfer.finish(TransferStatus::TargetAborted);
        return None;
    }

    transfer.activate().then_some(tx)
}

// ---------------------------------------------------------------------------
// Pump
// ---------------------------------------------------------------------------

/// Drive the byte pump until a terminal status and return it.
///
/// Inputs, per the state machine: seeder body chunks (data, error, EOF),
/// the leecher channel's window (a blocked `send`), and the cancellation
/// token.  The caller owns pairing, timeouts, and the index bookkeeping.
pub async fn run_pump<S, E>(
    transfer: &Transfer,
    mut body: S,
    tx: mpsc::Sender<Result<Bytes, PumpError>>,
    pace_bytes_per_sec: u64,
) -> TransferStatus
where
    S: Stream<Item = Result<Bytes, E>> + Unpin,
    E: std::fmt::Display,
{
    let mut meter = RateMeter::new();
    let mut pacer = Pacer::new(pace_bytes_per_sec);

    while transfer.transferred() < transfer.transfer_len() {
        let chunk = tokio::select! {
            () = transfer.cancel_token().cancelled() => {
                return abort(transfer, &tx, TransferStatus::SourceAborted);
            }
            chunk = body.next() => chunk,
        };

        let mut data = match chunk {
            Some(Ok(data)) => data,
            Some(Err(error)) => {
                debug!(transfer_id = %transfer.id(), %error, "seeder stream error mid-pump");
                transfer.finish(TransferStatus::Error);
                let _ = tx
                    .send(Err(PumpError::SourceStream(error.to_string())))
                    .await;
                return TransferStatus::Error;
            }
            // Seeder hung up before delivering everything it promised.
            None => return abort(transfer, &tx, TransferStatus::SourceAborted),
        };

        let remaining = transfer.transfer_len() - transfer.transferred();
        if data.len() as u64 > remaining {
            data.truncate(usize::try_from(remaining).unwrap_or(usize::MAX));
        }

        while !data.is_empty() {
            let block = data.split_to(data.len().min(BLOCK_SIZE));
            let block_len = block.len() as u64;

            let sent = tokio::select! {
                () = transfer.cancel_token().cancelled() => {
                    return abort(transfer, &tx, TransferStatus::SourceAborted);
                }
                sent = tx.send(Ok(block)) => sent,
            };
            if sent.is_err() {
                // Leecher dropped its connection; nothing to tell it.
                transfer.finish(TransferStatus::TargetAborted);
                return TransferStatus::TargetAborted;
            }

            transfer.add_transferred(block_len);
            transfer.set_bandwidth(meter.record(block_len));
            pacer.pace(block_len).await;
        }
    }

    transfer.finish(TransferStatus::Completed);
    TransferStatus::Completed
}

fn abort(
    transfer: &Transfer,
    tx: &mpsc::Sender<Result<Bytes, PumpError>>,
    status: TransferStatus,
) -> TransferStatus {
    transfer.finish(status);
    // Kill the leecher connection rather than ending its body short.
    let _ = tx.try_send(Err(PumpError::Aborted));
    transfer.status()
}

// ---------------------------------------------------------------------------
// Rate metering and pacing
// ---------------------------------------------------------------------------

/// Samples the incoming byte rate over one-second windows.
struct RateMeter {
    window_start: Instant,
    window_bytes: u64,
    rate: u64,
}

impl RateMeter {
    fn new() -> Self {
        Self {
            window_start: Instant::now(),
            window_bytes: 0,
            rate: 0,
        }
    }

    fn record(&mut self, n: u64) -> u64 {
        self.window_bytes += n;
        let elapsed = self.window_start.elapsed();
        if elapsed >= Duration::from_secs(1) {
            #[allow(clippy::cast_precision_loss, clippy::cast_possible_truncation, clippy::cast_sign_loss)]
            {
                self.rate = (self.window_bytes as f64 / elapsed.as_secs_f64()) as u64;
            }
            self.window_start = Instant::now();
            self.window_bytes = 0;
        }
        self.rate
    }
}

/// Coarse byte-rate ceiling: sleeps just long enough to keep the average
/// at or under the limit.  A limit of 0 disables pacing.
struct Pacer {
    limit: u64,
    start: Instant,
    sent: u64,
}

impl Pacer {
    fn new(limit: u64) -> Self {
        Self {
            limit,
            start: Instant::now(),
            sent: 0,
        }
    }

    async fn pace(&mut self, n: u64) {
        if self.limit == 0 {
            return;
        }
        self.sent += n;
        #[allow(clippy::cast_precision_loss)]
        let target = Duration::from_secs_f64(self.sent as f64 / self.limit as f64);
        let elapsed = self.start.elapsed();
        if target > elapsed {
            tokio::time::sleep(target - elapsed).await;
        }
    }
}
