//! Spawns one task per peer address plus the scheduler, request server, and
//! choking controller, and drives the whole swarm to completion (§4.7, §5).

use std::{
    net::SocketAddr,
    sync::{atomic::AtomicUsize, Arc},
    time::Duration,
};

use tokio::stream::StreamExt as _;

use crate::{
    choke::{ChokingController, SessionCounters},
    conf::TorrentConf,
    error::*,
    peer::{self, Command, CommandSender, TorrentContext},
    piece::{self, PieceScheduler},
    request_server::{request_channel, RequestServer},
    storage_info::StorageInfo,
    Bitfield, PeerId, Sha1Hash,
};

/// A handle onto an already-running swarm, kept around only so the binary
/// can signal seed termination (§10, "seed termination: external signal").
pub(crate) struct Coordinator {
    session_commands: Vec<CommandSender>,
}

impl Coordinator {
    /// Tells every peer session to end, regardless of whether it's still
    /// leeching or seeding. Nothing inside this crate calls this on its own.
    pub fn shutdown(&self) {
        for cmd_tx in &self.session_commands {
            let _ = cmd_tx.send(Command::Shutdown);
        }
    }
}

/// Spawns the full swarm (one task per peer, plus the scheduler, request
/// server, and choking controller) and runs it to completion.
///
/// Returns the torrent's final owned bitfield once every piece has been
/// downloaded, verified, and written to disk. The returned [`Coordinator`]
/// remains usable afterwards purely to shut down the now-seeding sessions.
pub(crate) async fn run(
    client_id: PeerId,
    info_hash: Sha1Hash,
    storage: Arc<StorageInfo>,
    hashes: Arc<Vec<Sha1Hash>>,
    peers: Vec<SocketAddr>,
    conf: Arc<TorrentConf>,
) -> Result<(Bitfield, Coordinator)> {
    if peers.is_empty() {
        return Err(Error::NoPeers);
    }

    let work_queue = piece::work_channel(storage.piece_count);
    let (data_tx, data_rx) = piece::data_channel();
    let (req_tx, req_rx) = request_channel();
    let assembly = piece::new_shared_assembly(
        storage.download_len,
        storage.piece_count,
    );
    let active_sessions = Arc::new(AtomicUsize::new(0));

    let torrent = Arc::new(TorrentContext {
        info_hash,
        piece_count: storage.piece_count,
    });

    let mut session_commands = Vec::with_capacity(peers.len());
    let mut session_counters = Vec::with_capacity(peers.len());

    log::info!("Spawning {} peer sessions", peers.len());
    for addr in peers {
        let counters = Arc::new(SessionCounters::default());
        let (cmd_tx, cmd_rx) = peer::command_channel();
        session_counters.push(Arc::clone(&counters));
        session_commands.push(cmd_tx);

        tokio::spawn(peer::run(
            client_id,
            Arc::clone(&torrent),
            Arc::clone(&conf),
            addr,
            counters,
            Arc::clone(&active_sessions),
            Arc::clone(&work_queue),
            data_tx.clone(),
            req_tx.clone(),
            cmd_rx,
        ));
    }

    let request_server = RequestServer::new(
        Arc::clone(&storage),
        Arc::clone(&assembly),
        req_rx,
    );
    tokio::spawn(request_server.run());

    tokio::spawn(run_choking_controller(
        session_counters,
        conf.choke_interval,
    ));

    let scheduler = PieceScheduler::new(
        Arc::clone(&storage),
        hashes,
        work_queue,
        data_rx,
        assembly,
        active_sessions,
        conf.choke_interval,
    );
    scheduler.bootstrap().await?;
    let owned = scheduler.run().await?;

    Ok((
        owned,
        Coordinator {
            session_commands,
        },
    ))
}

/// Re-ranks peers on its own tick rather than being invoked synchronously
/// from the scheduler's liveness tick, so a slow recompute can never stall
/// piece bookkeeping (the two ticks run as genuinely independent tasks, per
/// the concurrency model's "three additional tasks").
async fn run_choking_controller(
    sessions: Vec<Arc<SessionCounters>>,
    interval: Duration,
) {
    log::info!("Starting choking controller for {} peers", sessions.len());
    let mut controller = ChokingController::new(sessions);
    let mut tick = tokio::time::interval(interval);
    loop {
        tick.next().await;
        let n = controller.tick();
        log::debug!("Choking controller: reciprocating to {} peers", n);
    }
}
