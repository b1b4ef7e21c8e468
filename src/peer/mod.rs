//! One peer session per remote address: owns a single TCP connection and
//! drives it through the full BEP-3 handshake, bitfield exchange,
//! choke/interest negotiation, and block request pipelining.
//!
//! Per-session state (counters, flags) is owned entirely by this task; the
//! choking controller and coordinator only ever read it through the atomics
//! in [`crate::choke::SessionCounters`], never by locking into the session
//! itself (see the design notes on per-peer state ownership).

use std::{
    net::SocketAddr,
    sync::{
        atomic::{AtomicUsize, Ordering},
        Arc,
    },
};

use futures::{SinkExt, StreamExt};
use sha1::{Digest, Sha1};
use tokio::{net::TcpStream, sync::mpsc, time};
use tokio_util::codec::{Framed, FramedParts};

use crate::{
    choke::SessionCounters,
    conf::TorrentConf,
    error::*,
    piece::{DataSender, Piece, PieceData, SharedWorkQueue},
    proto::{Handshake, HandshakeCodec, Message, MessageCodec},
    request_server::{BlockRequest, RequestSender},
    Bitfield, BlockInfo, PeerId, Sha1Hash,
};

/// Capacity of a session's own outbound mailbox (`Q_out`). Small: its only
/// producer besides the session itself is the request server forwarding
/// served blocks, and a slow peer should shed those rather than let them
/// queue up indefinitely (see the request server's back-pressure policy).
const OUT_CHANNEL_CAPACITY: usize = 64;

/// A command sent to a running session from the coordinator, on a channel
/// separate from `Q_out` (seeding termination is an external signal, not
/// part of the wire-message flow).
pub(crate) enum Command {
    /// Ends the session at the next main loop iteration.
    Shutdown,
}

pub(crate) type CommandSender = mpsc::UnboundedSender<Command>;
pub(crate) type CommandReceiver = mpsc::UnboundedReceiver<Command>;

pub(crate) fn command_channel() -> (CommandSender, CommandReceiver) {
    mpsc::unbounded_channel()
}

/// The minimal torrent identity a peer session needs: enough to handshake
/// and to size the peer's bitfield. Everything else (piece lengths, file
/// layout) lives in the `Piece` jobs pulled off the work queue.
pub(crate) struct TorrentContext {
    pub info_hash: Sha1Hash,
    pub piece_count: usize,
}

/// Spawns and drives one outbound peer session to completion.
///
/// Returns only once the session has disconnected for good (either because
/// establishing the connection failed every retry, or because the connected
/// session ended). Increments/decrements `active_sessions` around the
/// connected lifetime so the scheduler's liveness check and the coordinator
/// can observe it without holding a reference to this specific session.
#[allow(clippy::too_many_arguments)]
pub(crate) async fn run(
    client_id: PeerId,
    torrent: Arc<TorrentContext>,
    conf: Arc<TorrentConf>,
    addr: SocketAddr,
    counters: Arc<SessionCounters>,
    active_sessions: Arc<AtomicUsize>,
    work_queue: SharedWorkQueue,
    data_tx: DataSender,
    req_tx: RequestSender,
    cmd_rx: CommandReceiver,
) {
    active_sessions.fetch_add(1, Ordering::SeqCst);

    match run_inner(
        client_id,
        &torrent,
        &conf,
        addr,
        &counters,
        &work_queue,
        &data_tx,
        &req_tx,
        cmd_rx,
    )
    .await
    {
        Ok(()) => log::info!("Peer {} session ended cleanly", addr),
        Err(e) => log::warn!("Peer {} session ended: {}", addr, e),
    }

    counters.active.store(false, Ordering::SeqCst);
    active_sessions.fetch_sub(1, Ordering::SeqCst);
}

#[allow(clippy::too_many_arguments)]
async fn run_inner(
    client_id: PeerId,
    torrent: &Arc<TorrentContext>,
    conf: &Arc<TorrentConf>,
    addr: SocketAddr,
    counters: &Arc<SessionCounters>,
    work_queue: &SharedWorkQueue,
    data_tx: &DataSender,
    req_tx: &RequestSender,
    cmd_rx: CommandReceiver,
) -> Result<()> {
    let mut last_err = None;
    for attempt in 1..=conf.reconnect_attempts {
        let (out_tx, out_rx) = mpsc::channel(OUT_CHANNEL_CAPACITY);
        match establish(client_id, torrent, conf, addr, req_tx, &out_tx).await {
            Ok((framed, _peer_id, mut session)) => {
                session.counters = Arc::clone(counters);
                return session
                    .main_loop(
                        framed,
                        Arc::clone(work_queue),
                        data_tx.clone(),
                        req_tx.clone(),
                        out_rx,
                        out_tx,
                        cmd_rx,
                    )
                    .await;
            }
            Err(e) => {
                log::warn!(
                    "Peer {} establish attempt {}/{} failed: {}",
                    addr,
                    attempt,
                    conf.reconnect_attempts,
                    e
                );
                let is_last = attempt == conf.reconnect_attempts;
                last_err = Some(e);
                if !is_last {
                    time::delay_for(conf.reconnect_backoff).await;
                }
            }
        }
    }
    Err(last_err.unwrap_or(Error::NoPeers))
}

/// Per-peer session state. Not `Clone`: this struct is exclusively owned by
/// its `run` task for its entire lifetime.
struct PeerSession {
    addr: SocketAddr,
    am_choking: bool,
    am_interested: bool,
    peer_choking: bool,
    peer_interested: bool,
    peer_bitfield: Bitfield,
    strikes: u32,
    counters: Arc<SessionCounters>,
    conf: Arc<TorrentConf>,
}

/// Dials, handshakes, and performs the bitfield exchange and
/// interested/unchoke handshake (§4.3 steps 1-4), returning a session ready
/// to enter its main loop.
async fn establish(
    client_id: PeerId,
    torrent: &Arc<TorrentContext>,
    conf: &Arc<TorrentConf>,
    addr: SocketAddr,
    req_tx: &RequestSender,
    out_tx: &mpsc::Sender<Message>,
) -> Result<(Framed<TcpStream, MessageCodec>, PeerId, PeerSession)> {
    log::info!("Dialing peer {}", addr);
    let socket = time::timeout(conf.control_timeout, TcpStream::connect(addr))
        .await
        .map_err(|_| Error::DialTimeout)?
        .map_err(Error::from)?;
    // TCP_NODELAY: block requests and replies are latency sensitive, small
    // messages, so Nagle's algorithm only hurts pipelining throughput here.
    let _ = socket.set_nodelay(true);

    let mut hs_framed = Framed::new(socket, HandshakeCodec);
    hs_framed
        .send(Handshake::new(torrent.info_hash, client_id))
        .await?;

    let reply = time::timeout(conf.control_timeout, hs_framed.next()).await?;
    let reply = match reply {
        Some(msg) => msg?,
        None => {
            return Err(Error::Handshake(
                "connection closed during handshake".into(),
            ))
        }
    };
    if reply.info_hash != torrent.info_hash {
        return Err(Error::Handshake("info hash mismatch".into()));
    }
    let peer_id = reply.peer_id;
    log::info!("Peer {} handshake complete", addr);

    // swap the handshake codec for the steady-state message codec, carrying
    // over any bytes already buffered past the handshake
    let old_parts = hs_framed.into_parts();
    let mut new_parts = FramedParts::new(old_parts.io, MessageCodec);
    new_parts.read_buf = old_parts.read_buf;
    new_parts.write_buf = old_parts.write_buf;
    let mut framed = Framed::from_parts(new_parts);

    let mut session = PeerSession {
        addr,
        am_choking: true,
        am_interested: false,
        peer_choking: true,
        peer_interested: false,
        peer_bitfield: Bitfield::new(torrent.piece_count),
        strikes: 0,
        counters: Arc::new(SessionCounters::default()),
        conf: Arc::clone(conf),
    };

    session
        .build_initial_bitfield(&mut framed, req_tx, out_tx)
        .await?;
    session
        .wait_for_unchoke(&mut framed, req_tx, out_tx)
        .await?;

    Ok((framed, peer_id, session))
}

impl PeerSession {
    /// Reads one message with the control-plane deadline applied.
    async fn read_control(
        &self,
        framed: &mut Framed<TcpStream, MessageCodec>,
    ) -> Result<Message> {
        let frame =
            time::timeout(self.conf.control_timeout, framed.next()).await?;
        match frame {
            Some(msg) => msg,
            None => Err(Error::Io(std::io::Error::new(
                std::io::ErrorKind::UnexpectedEof,
                "peer closed connection",
            ))),
        }
    }

    /// §4.3 step 3: builds the peer's initial bitfield from whatever the
    /// peer sends first, tolerating a premature `Unchoke` and a `Have`
    /// burst.
    async fn build_initial_bitfield(
        &mut self,
        framed: &mut Framed<TcpStream, MessageCodec>,
        req_tx: &RequestSender,
        out_tx: &mpsc::Sender<Message>,
    ) -> Result<()> {
        loop {
            let msg = self.read_control(framed).await?;
            match msg {
                Message::Bitfield(payload) => {
                    let bitfield = Bitfield::from_payload(
                        &payload,
                        self.peer_bitfield.piece_count(),
                    )
                    .ok_or_else(|| {
                        Error::Protocol(
                            "bitfield length mismatch".to_string(),
                        )
                    })?;
                    self.peer_bitfield = bitfield;
                    return Ok(());
                }
                Message::Have { piece_index } => {
                    self.peer_bitfield.set(piece_index);
                    // drain the rest of the burst, then dispatch whatever
                    // follows it through the normal handler so it isn't lost
                    loop {
                        let next = self.read_control(framed).await?;
                        if let Message::Have { piece_index } = next {
                            self.peer_bitfield.set(piece_index);
                        } else {
                            self.handle_message(framed, next, req_tx, out_tx)
                                .await?;
                            break;
                        }
                    }
                    return Ok(());
                }
                Message::Unchoke => {
                    // some peers send Unchoke before their bitfield;
                    // tolerate it and keep waiting for the bitfield proper
                    self.peer_choking = false;
                    continue;
                }
                other => {
                    return Err(Error::Protocol(format!(
                        "unexpected message while building initial bitfield: {:?}",
                        other
                    )));
                }
            }
        }
    }

    /// §4.3 step 4: announce interest and wait for the peer to unchoke us.
    async fn wait_for_unchoke(
        &mut self,
        framed: &mut Framed<TcpStream, MessageCodec>,
        req_tx: &RequestSender,
        out_tx: &mpsc::Sender<Message>,
    ) -> Result<()> {
        framed.send(Message::Interested).await?;
        self.am_interested = true;
        loop {
            let msg = self.read_control(framed).await?;
            if let Message::Unchoke = msg {
                self.peer_choking = false;
                return Ok(());
            }
            self.handle_message(framed, msg, req_tx, out_tx).await?;
        }
    }

    /// The generic message handler (outside piece assembly), §4.3.
    async fn handle_message(
        &mut self,
        framed: &mut Framed<TcpStream, MessageCodec>,
        msg: Message,
        req_tx: &RequestSender,
        out_tx: &mpsc::Sender<Message>,
    ) -> Result<()> {
        match msg {
            Message::KeepAlive => {
                // the read deadline is refreshed implicitly by every
                // `read_control`/`framed.next()` call; no state to update
            }
            Message::Choke => self.peer_choking = true,
            Message::Unchoke => self.peer_choking = false,
            Message::Interested => {
                self.peer_interested = true;
                if self.counters.reciprocate.load(Ordering::Relaxed) {
                    framed.send(Message::Unchoke).await?;
                    self.am_choking = false;
                } else {
                    framed.send(Message::Choke).await?;
                    self.am_choking = true;
                }
            }
            Message::NotInterested => self.peer_interested = false,
            Message::Have { piece_index } => {
                self.peer_bitfield.set(piece_index);
            }
            Message::Bitfield(payload) => {
                let bitfield = Bitfield::from_payload(
                    &payload,
                    self.peer_bitfield.piece_count(),
                )
                .ok_or_else(|| {
                    Error::Protocol("bitfield length mismatch".to_string())
                })?;
                self.peer_bitfield = bitfield;
            }
            Message::Request(block) => {
                self.forward_or_refuse_request(framed, block, req_tx, out_tx)
                    .await?;
            }
            Message::Cancel(_) => {
                log::trace!(
                    "Ignoring cancel message from {} (not implemented)",
                    self.addr
                );
            }
            Message::Piece { piece_index, .. } => {
                log::trace!(
                    "Ignoring unsolicited piece {} from {} outside piece assembly",
                    piece_index,
                    self.addr
                );
            }
        }
        Ok(())
    }

    /// `Request` handling shared between the generic handler and
    /// `download_piece`'s receive loop: forward to the request server when
    /// we've decided to reciprocate to this peer, otherwise choke it.
    async fn forward_or_refuse_request(
        &mut self,
        framed: &mut Framed<TcpStream, MessageCodec>,
        block: BlockInfo,
        req_tx: &RequestSender,
        out_tx: &mpsc::Sender<Message>,
    ) -> Result<()> {
        if self.counters.reciprocate.load(Ordering::Relaxed) {
            let req = BlockRequest {
                peer_out: out_tx.clone(),
                index: block.piece_index,
                offset: block.offset,
                len: block.len,
            };
            if req_tx.try_send(req).is_err() {
                log::trace!(
                    "Dropping request forwarded from {}: request queue full",
                    self.addr
                );
            }
        } else {
            framed.send(Message::Choke).await?;
            self.am_choking = true;
        }
        Ok(())
    }

    /// Pulls work off `q_work`, writes `q_out` frames, and serves inbound
    /// protocol messages until the connection ends or shutdown is signaled.
    #[allow(clippy::too_many_arguments)]
    async fn main_loop(
        mut self,
        mut framed: Framed<TcpStream, MessageCodec>,
        work_queue: SharedWorkQueue,
        data_tx: DataSender,
        req_tx: RequestSender,
        mut out_rx: mpsc::Receiver<Message>,
        out_tx: mpsc::Sender<Message>,
        mut cmd_rx: CommandReceiver,
    ) -> Result<()> {
        // once the work queue closes (torrent complete) we stop polling it
        // and only serve requests / read the socket, i.e. we seed
        let mut seeding = false;

        loop {
            tokio::select! {
                msg = out_rx.recv() => {
                    match msg {
                        Some(msg) => self.write_frame(&mut framed, msg).await?,
                        None => return Err(Error::ChannelClosed),
                    }
                }
                piece = work_queue.pop(), if !seeding => {
                    match piece {
                        Some(piece) => {
                            if !self.peer_bitfield.has(piece.index) {
                                if let Err(e) = work_queue.push(piece).await {
                                    log::warn!(
                                        "Peer {}: failed to requeue piece not held by peer: {}",
                                        self.addr, e
                                    );
                                }
                            } else {
                                self.handle_piece_job(
                                    piece,
                                    &mut framed,
                                    &work_queue,
                                    &data_tx,
                                    &req_tx,
                                    &out_tx,
                                ).await?;
                            }
                        }
                        None => {
                            log::info!("Peer {}: work queue closed, seeding", self.addr);
                            seeding = true;
                        }
                    }
                }
                frame = framed.next() => {
                    match frame {
                        Some(Ok(msg)) => {
                            self.handle_message(&mut framed, msg, &req_tx, &out_tx).await?;
                        }
                        Some(Err(e)) => return Err(e),
                        None => return Ok(()),
                    }
                }
                cmd = cmd_rx.recv() => {
                    match cmd {
                        Some(Command::Shutdown) | None => {
                            log::info!("Peer {}: shutting down", self.addr);
                            return Ok(());
                        }
                    }
                }
            }
        }
    }

    async fn write_frame(
        &mut self,
        framed: &mut Framed<TcpStream, MessageCodec>,
        msg: Message,
    ) -> Result<()> {
        if let Message::Piece { ref data, .. } = msg {
            self.counters
                .bytes_uploaded
                .fetch_add(data.len() as u64, Ordering::Relaxed);
        }
        framed.send(msg).await
    }

    /// Runs one piece job to completion (success, integrity failure, or IO
    /// fault), unconditionally requeueing on any failure, and only
    /// incrementing the strike counter for non-integrity faults.
    async fn handle_piece_job(
        &mut self,
        piece: Piece,
        framed: &mut Framed<TcpStream, MessageCodec>,
        work_queue: &SharedWorkQueue,
        data_tx: &DataSender,
        req_tx: &RequestSender,
        out_tx: &mpsc::Sender<Message>,
    ) -> Result<()> {
        match self.download_piece(piece, framed, req_tx, out_tx).await {
            Ok(bytes) => {
                data_tx
                    .send(PieceData {
                        index: piece.index,
                        bytes,
                    })
                    .await?;
                self.counters
                    .bytes_downloaded
                    .fetch_add(piece.len as u64, Ordering::Relaxed);
                Ok(())
            }
            Err(Error::Integrity { index }) => {
                log::warn!(
                    "Piece {} from peer {} failed integrity check",
                    index,
                    self.addr
                );
                if let Err(e) = work_queue.push(piece).await {
                    log::warn!("Failed to requeue piece {}: {}", index, e);
                }
                Ok(())
            }
            Err(e) => {
                if let Err(send_err) = work_queue.push(piece).await {
                    log::warn!(
                        "Failed to requeue piece {}: {}",
                        piece.index,
                        send_err
                    );
                }
                self.strikes += 1;
                log::warn!(
                    "Peer {} strike {}/{}: {}",
                    self.addr,
                    self.strikes,
                    self.conf.max_strikes,
                    e
                );
                if self.strikes > self.conf.max_strikes {
                    return Err(e);
                }
                Ok(())
            }
        }
    }

    /// §4.3 `download_piece`: pipelines every block request for the piece up
    /// front, then assembles the piece from out-of-order replies until full,
    /// verifying its hash before returning.
    async fn download_piece(
        &mut self,
        piece: Piece,
        framed: &mut Framed<TcpStream, MessageCodec>,
        req_tx: &RequestSender,
        out_tx: &mpsc::Sender<Message>,
    ) -> Result<Vec<u8>> {
        let block_count = crate::block_count(piece.len);
        for index in 0..block_count {
            let offset = index as u32 * crate::BLOCK_LEN;
            let len = crate::block_len(piece.len, index);
            framed
                .send(Message::Request(BlockInfo {
                    piece_index: piece.index,
                    offset,
                    len,
                }))
                .await?;
        }

        let mut data = vec![0u8; piece.len as usize];
        let mut downloaded = 0usize;
        while downloaded < piece.len as usize {
            let frame =
                time::timeout(self.conf.piece_timeout, framed.next()).await?;
            let msg = match frame {
                Some(msg) => msg?,
                None => {
                    return Err(Error::Io(std::io::Error::new(
                        std::io::ErrorKind::UnexpectedEof,
                        "peer closed connection mid-piece",
                    )))
                }
            };

            match msg {
                Message::Piece {
                    piece_index,
                    offset,
                    data: block,
                } => {
                    if piece_index != piece.index {
                        return Err(Error::Protocol(format!(
                            "received piece {} while downloading piece {}",
                            piece_index, piece.index
                        )));
                    }
                    let offset = offset as usize;
                    if offset >= piece.len as usize
                        || offset + block.len() > piece.len as usize
                    {
                        return Err(Error::Protocol(format!(
                            "block at offset {} (len {}) out of bounds for piece {} (len {})",
                            offset, block.len(), piece.index, piece.len
                        )));
                    }
                    data[offset..offset + block.len()]
                        .copy_from_slice(&block);
                    downloaded += block.len();
                }
                Message::Request(block) => {
                    self.forward_or_refuse_request(
                        framed, block, req_tx, out_tx,
                    )
                    .await?;
                }
                other => {
                    self.handle_message(framed, other, req_tx, out_tx)
                        .await?;
                }
            }
        }

        let mut hash = [0u8; 20];
        hash.copy_from_slice(&Sha1::digest(&data));
        if hash != piece.expected_hash {
            return Err(Error::Integrity { index: piece.index });
        }
        Ok(data)
    }
}
