//! The block write stream: packetised upload of the bytes of one block to a
//! DataNode pipeline over an already-negotiated connection.
//!
//! Three actors share the connection. The writer, driven by the caller,
//! carves the incoming bytes into chunk-aligned packets and pushes them on
//! the wire. The acker, a background thread owning the read half, matches
//! incoming acknowledgments against the in-flight packets, in order. The
//! heartbeater, another background thread, keeps the pipeline alive with
//! periodic data-less packets while the stream is quiet.

use std::io::{self, Read, Write};
use std::sync::{Arc, Mutex, OnceLock};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use crossbeam_channel::{Receiver, RecvTimeoutError, Sender};
use tracing::{debug, trace, warn};

use crate::util::io::DfsReadExt;

use super::packet::{self, Packet};
use super::proto::{PipelineAckProto, Status};
use super::{AckError, BlockDescriptor, StreamError, HEARTBEAT_SEQNO, PACKET_MAX_DATA};


/// Tuning of a [`BlockWriteStream`], see [`Default`].
#[derive(Debug, Clone)]
pub struct StreamConfig {
    /// Interval between two keepalive packets. Must be kept shorter than
    /// the read timeout configured on the DataNodes.
    pub heartbeat_interval: Duration,
    /// Capacity of the in-flight queue: how many sent but not yet
    /// acknowledged packets are tolerated before the writer blocks.
    pub inflight_depth: usize,
}

impl Default for StreamConfig {
    fn default() -> Self {
        Self {
            heartbeat_interval: Duration::from_secs(30),
            inflight_depth: 5,
        }
    }
}

/// Record of a sent but not yet acknowledged packet, queued between the
/// writer and the acker.
#[derive(Debug)]
struct Inflight {
    seqno: i64,
}

/// Write side of one block transfer. Bytes given to [`write`] are buffered,
/// carved into checksummed packets and sent to the first DataNode of the
/// pipeline; [`finish`] seals the block with the terminal packet and waits
/// until every packet has been acknowledged.
///
/// The two halves of the connection are taken at construction: the write
/// half is shared between the writer and the heartbeater under a lock, the
/// read half is owned by the acker. Dropping the stream without calling
/// [`finish`] abandons the block: the background threads terminate on their
/// own but no terminal packet is sent.
///
/// [`write`]: Self::write
/// [`finish`]: Self::finish
pub struct BlockWriteStream<W: Write + Send + 'static> {
    /// Write half of the connection. The lock is held for the duration of
    /// one full frame so that data packets and heartbeats never interleave.
    socket: Arc<Mutex<W>>,
    /// First error observed on the ack path, set once by the acker.
    ack_error: Arc<OnceLock<AckError>>,
    /// Bytes accepted from the caller but not yet packetised.
    buffer: Vec<u8>,
    /// Offset within the block of the next byte handed to a packet.
    offset: u64,
    /// Sequence number of the next packet.
    next_seqno: i64,
    /// Set once by `finish`.
    finished: bool,
    /// Sending half of the in-flight queue, dropped on finish so the acker
    /// can observe the drained-and-closed state.
    inflight_tx: Option<Sender<Inflight>>,
    /// Dropped on finish to stop the heartbeater.
    heartbeat_stop: Option<Sender<()>>,
    /// Dropped once the stream has terminated, see [`Self::close_signal`].
    close_tx: Option<Sender<()>>,
    close_rx: Receiver<()>,
    acker: Option<JoinHandle<()>>,
    heartbeater: Option<JoinHandle<()>>,
}

impl<W: Write + Send + 'static> BlockWriteStream<W> {

    /// Start a stream over the given connection halves, with the default
    /// configuration. The connection must already be past the write-block
    /// handshake, ready for packets. The starting offset is 0 for a fresh
    /// block and the current block length for an append.
    pub fn new<R>(
        reader: R,
        writer: W,
        block: &BlockDescriptor,
        start_offset: u64,
    ) -> io::Result<Self>
    where
        R: Read + Send + 'static,
    {
        Self::with_config(reader, writer, block, start_offset, StreamConfig::default())
    }

    /// Same as [`Self::new`] with an explicit configuration.
    pub fn with_config<R>(
        reader: R,
        writer: W,
        block: &BlockDescriptor,
        start_offset: u64,
        config: StreamConfig,
    ) -> io::Result<Self>
    where
        R: Read + Send + 'static,
    {

        debug!(block = %block, start_offset, "starting block write stream");

        let socket = Arc::new(Mutex::new(writer));
        let ack_error = Arc::new(OnceLock::new());

        let (inflight_tx, inflight_rx) = crossbeam_channel::bounded(config.inflight_depth);
        let (stop_tx, stop_rx) = crossbeam_channel::bounded(0);
        let (close_tx, close_rx) = crossbeam_channel::bounded::<()>(0);

        let acker = {
            let ack_error = Arc::clone(&ack_error);
            let pipeline_len = block.pipeline_len();
            thread::Builder::new()
                .name("dfs-block-acker".to_string())
                .spawn(move || run_acker(reader, inflight_rx, ack_error, pipeline_len))?
        };

        let heartbeater = {
            let socket = Arc::clone(&socket);
            let interval = config.heartbeat_interval;
            thread::Builder::new()
                .name("dfs-block-heartbeat".to_string())
                .spawn(move || run_heartbeater(socket, stop_rx, interval))?
        };

        Ok(Self {
            socket,
            ack_error,
            buffer: Vec::new(),
            offset: start_offset,
            next_seqno: 1,
            finished: false,
            inflight_tx: Some(inflight_tx),
            heartbeat_stop: Some(stop_tx),
            close_tx: Some(close_tx),
            close_rx,
            acker: Some(acker),
            heartbeater: Some(heartbeater),
        })

    }

    /// Offset within the block of the next byte to be packetised, which is
    /// the number of bytes already placed into packets.
    #[inline]
    pub fn offset(&self) -> u64 {
        self.offset
    }

    /// Return whether [`Self::finish`] has been called.
    #[inline]
    pub fn is_finished(&self) -> bool {
        self.finished
    }

    /// Return a receiver that never carries a message but disconnects once
    /// the stream has terminated, successfully or not, including when it is
    /// dropped without being finished.
    pub fn close_signal(&self) -> Receiver<()> {
        self.close_rx.clone()
    }

    /// Accept bytes into the stream, sending full packets as the internal
    /// buffer allows. Fails once the stream is finished or once the ack
    /// path has failed, in which case no byte is accepted.
    pub fn write(&mut self, buf: &[u8]) -> Result<usize, StreamError> {

        if self.finished {
            return Err(StreamError::Closed);
        }
        if let Some(e) = self.ack_error.get() {
            return Err(e.clone().into());
        }

        self.buffer.extend_from_slice(buf);
        self.drain(false)?;
        Ok(buf.len())

    }

    /// Force every buffered byte out as packets, even short ones, without
    /// terminating the stream. Note that this only hands the bytes to the
    /// pipeline, it does not wait for their acknowledgment.
    pub fn flush(&mut self) -> Result<(), StreamError> {
        if self.finished {
            return Err(StreamError::Closed);
        }
        self.drain(true)
    }

    /// Terminate the stream: send the remaining buffered bytes, stop the
    /// heartbeater, send the terminal packet and wait until the acker has
    /// processed every acknowledgment. Any error latched on the ack path is
    /// returned. Calling this again after it returned is a no-op.
    pub fn finish(&mut self) -> Result<(), StreamError> {

        if self.finished {
            return Ok(());
        }
        self.finished = true;

        debug!("finishing block write stream");

        let mut result = self.drain(true);

        // The terminal packet must be the last thing on the wire, so the
        // heartbeater is stopped first.
        drop(self.heartbeat_stop.take());
        if let Some(handle) = self.heartbeater.take() {
            let _ = handle.join();
        }

        if result.is_ok() && self.ack_error.get().is_none() {
            let terminal = Packet::terminal(self.next_seqno, self.offset);
            self.next_seqno += 1;
            result = self.send_packet(terminal);
        }

        // Closing the queue lets the acker terminate once it has drained
        // every in-flight packet.
        drop(self.inflight_tx.take());
        if let Some(handle) = self.acker.take() {
            let _ = handle.join();
        }

        drop(self.close_tx.take());

        if let Some(e) = self.ack_error.get() {
            return Err(e.clone().into());
        }
        result

    }

    /// Carve packets out of the buffer and send them: full-size ones as
    /// long as the buffer allows, down to the last byte when forced.
    fn drain(&mut self, force: bool) -> Result<(), StreamError> {

        while !self.buffer.is_empty() && (force || self.buffer.len() >= PACKET_MAX_DATA) {

            if let Some(e) = self.ack_error.get() {
                return Err(e.clone().into());
            }

            let len = packet::next_data_len(self.offset, self.buffer.len());
            let data = self.buffer.drain(..len).collect::<Vec<u8>>();
            let packet = Packet::data(self.next_seqno, self.offset, data);
            self.next_seqno += 1;
            self.offset += len as u64;
            self.send_packet(packet)?;

        }

        Ok(())

    }

    /// Queue one packet as in-flight and write its frame to the socket, in
    /// that order: the packet must be queued before its first byte reaches
    /// the wire, or its ack could be read while it is not tracked yet.
    /// Blocks while the in-flight queue is full.
    fn send_packet(&mut self, packet: Packet) -> Result<(), StreamError> {

        trace!(
            seqno = packet.seqno,
            offset = packet.offset_in_block,
            len = packet.data.len(),
            last = packet.last,
            "sending packet",
        );

        self.inflight_tx.as_ref()
            .and_then(|tx| tx.send(Inflight { seqno: packet.seqno }).ok())
            .ok_or(StreamError::Closed)?;

        // Unwrap because a poisoned socket lock means another thread died
        // and the stream is unusable anyway.
        let mut socket = self.socket.lock().unwrap();
        packet.encode(&mut *socket)?;
        socket.flush()?;
        Ok(())

    }

}

impl<W: Write + Send + 'static> io::Write for BlockWriteStream<W> {

    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        BlockWriteStream::write(self, buf).map_err(Into::into)
    }

    fn flush(&mut self) -> io::Result<()> {
        BlockWriteStream::flush(self).map_err(Into::into)
    }

}

/// Ack processing loop. For each in-flight packet, in order, one matching
/// ack is awaited. On the first failure the error is latched and the queue
/// is only drained from then on, so that the writer can never stay blocked
/// on a full queue. The loop ends when the queue is closed and empty.
fn run_acker<R: Read>(
    mut reader: R,
    inflight: Receiver<Inflight>,
    error: Arc<OnceLock<AckError>>,
    pipeline_len: usize,
) {

    debug!("acker started");

    while let Ok(pending) = inflight.recv() {

        if error.get().is_some() {
            continue;
        }

        match read_matching_ack(&mut reader, pending.seqno, pipeline_len) {
            Ok(()) => trace!(seqno = pending.seqno, "packet acked"),
            Err(e) => {
                warn!(seqno = pending.seqno, "ack failed: {e}");
                let _ = error.set(e);
            }
        }

    }

    debug!("acker terminated");

}

/// Read acks until one for a data packet arrives and check it against the
/// given expected sequence number. Heartbeat acks are acknowledged by the
/// pipeline like any other packet but correspond to no in-flight entry, so
/// they are discarded here; a failed status latches even when it arrives in
/// one of them.
fn read_matching_ack(
    reader: &mut impl Read,
    expected: i64,
    pipeline_len: usize,
) -> Result<(), AckError> {

    loop {

        let ack: PipelineAckProto = reader.read_message()
            .map_err(|e| AckError::Read(Arc::new(e)))?;

        trace!(seqno = ack.seqno, replies = ack.reply.len(), "ack received");
        if ack.reply.len() != pipeline_len {
            warn!(
                seqno = ack.seqno,
                replies = ack.reply.len(),
                pipeline_len,
                "ack reply count does not match the pipeline",
            );
        }

        for (index, status) in ack.statuses().enumerate() {
            if status != Status::Success {
                return Err(AckError::Status { seqno: ack.seqno, index, status });
            }
        }

        if ack.seqno == HEARTBEAT_SEQNO {
            continue;
        }

        if ack.seqno != expected {
            return Err(AckError::InvalidSeqno { expected, actual: ack.seqno });
        }

        return Ok(());

    }

}

/// Heartbeat loop: one keepalive frame per tick until the stream is
/// finished or dropped. A failed heartbeat write is only logged, the writer
/// or the acker will report the actual failure of the connection.
fn run_heartbeater<W: Write>(
    socket: Arc<Mutex<W>>,
    stop: Receiver<()>,
    interval: Duration,
) {

    debug!("heartbeater started");

    loop {
        match stop.recv_timeout(interval) {
            Err(RecvTimeoutError::Timeout) => {
                let mut socket = socket.lock().unwrap();
                let res = packet::encode_heartbeat(&mut *socket)
                    .and_then(|()| socket.flush());
                match res {
                    Ok(()) => trace!("heartbeat sent"),
                    Err(e) => warn!("heartbeat write failed: {e}"),
                }
            }
            Ok(()) | Err(RecvTimeoutError::Disconnected) => break,
        }
    }

    debug!("heartbeater terminated");

}
