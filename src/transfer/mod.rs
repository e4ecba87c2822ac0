//! Client side of the Hadoop data transfer protocol.
//!
//! The central structure is the [`BlockWriteStream`], which carries the
//! bytes of one block to a DataNode pipeline over an already-negotiated
//! connection: it owns the packet framing, the chunk checksums, the
//! acknowledgment accounting and the keepalive heartbeats. Negotiating the
//! connection itself (the `OP_WRITE_BLOCK` handshake, access tokens,
//! encryption) and every NameNode interaction are the caller's business.

use std::io;
use std::fmt;
use std::sync::Arc;

use thiserror::Error;

use self::proto::Status;

pub mod proto;
pub mod packet;
pub mod stream;

pub use packet::Packet;
pub use stream::{BlockWriteStream, StreamConfig};


/// Number of data bytes covered by one checksum.
pub const CHUNK_SIZE: usize = 512;
/// Maximum number of data bytes in one packet.
pub const PACKET_MAX_DATA: usize = 65536;
/// Sequence number reserved for heartbeat packets, never assigned to data
/// packets.
pub const HEARTBEAT_SEQNO: i64 = -1;


/// Identity of the block being written and of the pipeline replicating it.
/// The stream itself only consumes the pipeline length and the identity for
/// diagnostics, everything else is carried for the caller.
#[derive(Debug, Clone)]
pub struct BlockDescriptor {
    /// Identifier of the block pool the block belongs to.
    pub pool_id: String,
    /// Numeric identifier of the block.
    pub block_id: u64,
    /// Generation stamp of the block.
    pub generation_stamp: u64,
    /// Addresses of the DataNodes replicating the block, in pipeline order.
    /// The stream is connected to the first one, which forwards to the next.
    pub datanodes: Vec<String>,
}

impl BlockDescriptor {

    /// Number of replicas in the pipeline. Each ack is expected to carry
    /// one status per replica.
    #[inline]
    pub fn pipeline_len(&self) -> usize {
        self.datanodes.len()
    }

}

impl fmt::Display for BlockDescriptor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:blk_{}_{}", self.pool_id, self.block_id, self.generation_stamp)
    }
}


/// First error observed on the ack path of a stream. It is latched once and
/// then returned by every subsequent operation, so it must be cheap to
/// clone.
#[derive(Debug, Clone, Error)]
pub enum AckError {
    /// A replica of the pipeline replied with a non-success status.
    #[error("replica {index} replied {status:?} to seqno {seqno}")]
    Status {
        /// Sequence number carried by the failing ack.
        seqno: i64,
        /// Pipeline index of the first failing replica.
        index: usize,
        /// The status it reported.
        status: Status,
    },
    /// An ack did not match the sequence number of the oldest unacked
    /// packet.
    #[error("ack for seqno {actual} while expecting {expected}")]
    InvalidSeqno {
        expected: i64,
        actual: i64,
    },
    /// Reading or decoding an ack from the connection failed.
    #[error("ack read failed: {0}")]
    Read(Arc<io::Error>),
}

/// Error returned by block write stream operations.
#[derive(Debug, Error)]
pub enum StreamError {
    /// The stream has already been finished.
    #[error("block write stream is closed")]
    Closed,
    /// The ack path failed; the pipeline is dead and the stream only
    /// terminates.
    #[error(transparent)]
    Ack(#[from] AckError),
    /// Writing to the connection failed.
    #[error("io error: {0}")]
    Io(#[from] io::Error),
}

impl From<StreamError> for io::Error {
    fn from(e: StreamError) -> Self {
        match e {
            StreamError::Closed => io::Error::new(io::ErrorKind::BrokenPipe, e),
            StreamError::Io(e) => e,
            e => io::Error::new(io::ErrorKind::Other, e),
        }
    }
}
