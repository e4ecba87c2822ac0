//! Outbound packet model: chunk checksums, the packetisation length rule
//! and the wire framing shared by data, terminal and heartbeat packets.

use std::io::{self, Read, Write};

use prost::Message;

use crate::util::io::{DfsReadExt, DfsWriteExt};

use super::proto::PacketHeaderProto;
use super::{CHUNK_SIZE, HEARTBEAT_SEQNO, PACKET_MAX_DATA};


/// Size of one chunk checksum on the wire.
pub const CHECKSUM_SIZE: usize = 4;


/// One packet of the block write stream, either a data packet or the
/// terminal packet closing the block.
///
/// The frame layout is, in order: the big-endian `u32` payload length, the
/// big-endian `u16` length of the encoded header, the header protobuf, the
/// chunk checksums and the data bytes. The payload length counts the
/// checksums, the data and the length field itself, and does **not** count
/// the header.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Packet {
    /// Sequence number, starting at 1 for the first packet of a stream.
    pub seqno: i64,
    /// Offset of the first data byte within the block.
    pub offset_in_block: u64,
    /// Whether this is the terminal packet of the block.
    pub last: bool,
    /// One big-endian CRC32 per chunk of data, the final chunk may be
    /// shorter than [`CHUNK_SIZE`].
    pub checksums: Vec<u8>,
    /// Data bytes, at most [`PACKET_MAX_DATA`].
    pub data: Vec<u8>,
}

impl Packet {

    /// Build a data packet from the given bytes, computing one checksum per
    /// chunk.
    pub fn data(seqno: i64, offset_in_block: u64, data: Vec<u8>) -> Self {
        debug_assert!(data.len() <= PACKET_MAX_DATA);
        Self {
            seqno,
            offset_in_block,
            last: false,
            checksums: chunk_checksums(&data),
            data,
        }
    }

    /// Build the terminal packet, closing the block at the given final
    /// offset. It carries no data and no checksums.
    pub fn terminal(seqno: i64, offset_in_block: u64) -> Self {
        Self {
            seqno,
            offset_in_block,
            last: true,
            checksums: Vec::new(),
            data: Vec::new(),
        }
    }

    fn header(&self) -> PacketHeaderProto {
        PacketHeaderProto {
            offset_in_block: self.offset_in_block as i64,
            seqno: self.seqno,
            last_packet_in_block: self.last,
            data_len: self.data.len() as i32,
            sync_block: None,
        }
    }

    /// Encode the full frame of this packet. This performs multiple small
    /// writes, the caller is in charge of serializing them against any
    /// other writer of the same connection.
    pub fn encode(&self, write: &mut impl Write) -> io::Result<()> {
        encode_frame(write, &self.header(), &self.checksums, &self.data)
    }

    /// Decode one full frame, the counterpart of [`Self::encode`].
    pub fn decode(read: &mut impl Read) -> io::Result<Self> {

        let payload_len = read.read_u32_be()? as usize;
        let header_len = read.read_u16_be()? as usize;

        let header_buf = read.read_blob(header_len)?;
        let header = PacketHeaderProto::decode(&header_buf[..])
            .map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))?;

        let data_len = usize::try_from(header.data_len)
            .map_err(|_| io::Error::new(io::ErrorKind::InvalidData, "negative data length"))?;
        let checksums_len = payload_len.checked_sub(data_len + CHECKSUM_SIZE)
            .ok_or_else(|| io::Error::new(io::ErrorKind::InvalidData, "inconsistent payload length"))?;

        Ok(Self {
            seqno: header.seqno,
            offset_in_block: header.offset_in_block as u64,
            last: header.last_packet_in_block,
            checksums: read.read_blob(checksums_len)?,
            data: read.read_blob(data_len)?,
        })

    }

}

/// Encode the heartbeat frame: a header-only packet with the heartbeat
/// sentinel sequence number, keeping the pipeline alive during quiet
/// periods.
pub fn encode_heartbeat(write: &mut impl Write) -> io::Result<()> {
    let header = PacketHeaderProto {
        offset_in_block: 0,
        seqno: HEARTBEAT_SEQNO,
        last_packet_in_block: false,
        data_len: 0,
        sync_block: None,
    };
    encode_frame(write, &header, &[], &[])
}

fn encode_frame(
    write: &mut impl Write,
    header: &PacketHeaderProto,
    checksums: &[u8],
    data: &[u8],
) -> io::Result<()> {
    write.write_u32_be((checksums.len() + data.len() + CHECKSUM_SIZE) as u32)?;
    let header_buf = header.encode_to_vec();
    write.write_u16_be(header_buf.len() as u16)?;
    write.write_all(&header_buf)?;
    write.write_all(checksums)?;
    write.write_all(data)?;
    Ok(())
}

/// Compute the big-endian CRC32 (IEEE polynomial) of every chunk of the
/// given data, the final chunk covering whatever remains.
pub fn chunk_checksums(data: &[u8]) -> Vec<u8> {
    let count = (data.len() + CHUNK_SIZE - 1) / CHUNK_SIZE;
    let mut checksums = Vec::with_capacity(count * CHECKSUM_SIZE);
    for chunk in data.chunks(CHUNK_SIZE) {
        checksums.extend_from_slice(&crc32fast::hash(chunk).to_be_bytes());
    }
    checksums
}

/// Number of data bytes to place in the next packet, given the block offset
/// at which it starts and the number of buffered bytes available.
///
/// When the offset is not chunk-aligned (appending to a block whose last
/// chunk is partial), the packet is capped so that the next one starts on a
/// chunk boundary; once aligned this clause is inert.
pub(super) fn next_data_len(offset: u64, buffered: usize) -> usize {
    let len = buffered.min(PACKET_MAX_DATA);
    let misalignment = (offset % CHUNK_SIZE as u64) as usize;
    if misalignment > 0 {
        len.min(CHUNK_SIZE - misalignment)
    } else {
        len
    }
}
