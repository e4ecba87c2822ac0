//! Protobuf messages exchanged on the data transfer wire, hand-mapped from
//! the `datatransfer.proto` definitions distributed with Hadoop. Only the
//! subset needed by the block write stream is defined.

use prost::{Enumeration, Message};


/// Header of every packet sent to the pipeline, preceding the checksums and
/// the data bytes. On the wire it is prefixed with its big-endian `u16`
/// length, not with the usual varint (see the framing in
/// [`packet`](super::packet)).
#[derive(Clone, PartialEq, Message)]
pub struct PacketHeaderProto {
    /// Offset of the first data byte of this packet within the block.
    #[prost(sfixed64, required, tag = "1")]
    pub offset_in_block: i64,
    /// Sequence number of the packet, `-1` for heartbeats.
    #[prost(sfixed64, required, tag = "2")]
    pub seqno: i64,
    /// Set on the terminal packet of the block, which carries no data.
    #[prost(bool, required, tag = "3")]
    pub last_packet_in_block: bool,
    /// Number of data bytes in the packet.
    #[prost(sfixed32, required, tag = "4")]
    pub data_len: i32,
    /// Request a durable sync of the block on the DataNodes.
    #[prost(bool, optional, tag = "5")]
    pub sync_block: Option<bool>,
}

/// Acknowledgment returned by the first DataNode of the pipeline for one
/// packet, carrying one status per pipeline position. Read from the wire as
/// a varint-prefixed message.
#[derive(Clone, PartialEq, Message)]
pub struct PipelineAckProto {
    /// Sequence number of the acknowledged packet, `-1` for heartbeats.
    #[prost(sint64, required, tag = "1")]
    pub seqno: i64,
    /// Raw statuses, one per replica of the pipeline, in pipeline order.
    #[prost(enumeration = "Status", repeated, packed = "false", tag = "2")]
    pub reply: Vec<i32>,
    /// Time spent waiting for the downstream ack, in nanoseconds.
    #[prost(uint64, optional, tag = "3")]
    pub downstream_ack_time_nanos: Option<u64>,
}

impl PipelineAckProto {

    /// Iterate over the decoded reply statuses, in pipeline order. A raw
    /// value outside of the known range decodes as [`Status::Error`].
    pub fn statuses(&self) -> impl Iterator<Item = Status> + '_ {
        self.reply.iter()
            .map(|&raw| Status::try_from(raw).unwrap_or(Status::Error))
    }

}

/// Status of an operation as reported by a DataNode.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Enumeration)]
#[repr(i32)]
pub enum Status {
    Success = 0,
    Error = 1,
    ErrorChecksum = 2,
    ErrorInvalid = 3,
    ErrorExists = 4,
    ErrorAccessToken = 5,
    ChecksumOk = 6,
    ErrorUnsupported = 7,
}


#[cfg(test)]
mod tests {

    use super::*;

    #[test]
    fn header_fixed_width_fields() {

        let header = PacketHeaderProto {
            offset_in_block: 1024,
            seqno: 3,
            last_packet_in_block: false,
            data_len: 576,
            sync_block: None,
        };

        // Two sfixed64, one bool and one sfixed32, each with a 1-byte key.
        assert_eq!(header.encoded_len(), 9 + 9 + 2 + 5);

        let back = PacketHeaderProto::decode(&header.encode_to_vec()[..]).unwrap();
        assert_eq!(back, header);

    }

    #[test]
    fn ack_statuses() {

        let ack = PipelineAckProto {
            seqno: 7,
            reply: vec![Status::Success as i32, Status::ErrorChecksum as i32, 999],
            downstream_ack_time_nanos: None,
        };

        let statuses = ack.statuses().collect::<Vec<_>>();
        assert_eq!(statuses, [Status::Success, Status::ErrorChecksum, Status::Error]);

    }

}
