mod assembly;
mod job;
mod scheduler;

use std::sync::Arc;

use tokio::sync::{mpsc, Mutex as AsyncMutex};

pub(crate) use assembly::{
    new_shared as new_shared_assembly, Assembly, SharedAssembly,
};
pub(crate) use job::{Piece, PieceData};
pub(crate) use scheduler::PieceScheduler;

use crate::error::*;

/// The data sink peer sessions push verified pieces onto.
pub(crate) type DataSender = mpsc::Sender<PieceData>;
pub(crate) type DataReceiver = mpsc::Receiver<PieceData>;

/// Capacity of the data sink; small on purpose so a slow scheduler applies
/// backpressure to sessions rather than letting unbounded memory pile up.
const DATA_CHANNEL_CAPACITY: usize = 16;

/// The work queue. Bounded to `num_pieces`, per the data model: a piece
/// exists in exactly one place at a time, so the channel never needs to hold
/// more than the torrent has pieces.
///
/// Every peer session races the others to pop the next piece off the shared
/// `rx`, so it's wrapped for shared, mutually-exclusive access, exactly like
/// the original split `WorkSender`/`SharedWorkReceiver` pair was. The
/// difference is how closing works: instead of calling `close()` on the
/// locked receiver (which can never acquire the lock a session is idly
/// parked holding, deadlocking completion), the sending side lives behind
/// its own, separate, synchronous mutex and closing just drops it. No
/// session keeps a long-lived sender of its own anymore — `push` clones the
/// canonical sender out, sends, and drops the clone — so once the canonical
/// sender is gone the channel is genuinely senderless and every parked
/// `recv()` resolves to `None` on its own, lock or no lock.
pub(crate) struct WorkQueue {
    tx: std::sync::Mutex<Option<mpsc::Sender<Piece>>>,
    rx: AsyncMutex<mpsc::Receiver<Piece>>,
}

pub(crate) type SharedWorkQueue = Arc<WorkQueue>;

impl WorkQueue {
    /// Pushes a piece onto the queue. Used both for the initial bootstrap and
    /// for requeueing a piece a session couldn't complete.
    pub(crate) async fn push(&self, piece: Piece) -> Result<()> {
        let tx = self.tx.lock().unwrap().clone();
        let mut tx = tx.ok_or(Error::ChannelClosed)?;
        tx.send(piece).await?;
        Ok(())
    }

    /// Pops the next piece, or `None` once the queue is closed and drained,
    /// signaling the caller to stop requesting work and start seeding.
    pub(crate) async fn pop(&self) -> Option<Piece> {
        self.rx.lock().await.recv().await
    }

    /// Closes the queue without touching the receiver lock: drops the
    /// canonical sender, which makes every `recv()` currently parked on
    /// `rx` — however long it's been idly waiting — resolve to `None` on
    /// its own.
    pub(crate) fn close(&self) {
        self.tx.lock().unwrap().take();
    }
}

/// Creates the work queue, sized to the torrent's piece count.
pub(crate) fn work_channel(piece_count: usize) -> SharedWorkQueue {
    let (tx, rx) = mpsc::channel(piece_count.max(1));
    Arc::new(WorkQueue {
        tx: std::sync::Mutex::new(Some(tx)),
        rx: AsyncMutex::new(rx),
    })
}

/// Creates the data sink.
pub(crate) fn data_channel() -> (DataSender, DataReceiver) {
    mpsc::channel(DATA_CHANNEL_CAPACITY)
}
