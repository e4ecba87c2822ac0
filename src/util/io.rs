//! This module provides extension traits for [`Read`] and [`Write`] for
//! supporting the primitive formats used by the Hadoop data transfer
//! protocol: big-endian fixed integers, protobuf varints and
//! varint-prefixed protobuf messages.

use std::io::{self, Read, Write};

use byteorder::{ReadBytesExt, WriteBytesExt, BE};
use prost::Message;


/// An extension to the [`Read`] trait specifically used to decode the
/// formats used on the data transfer wire.
pub trait DfsReadExt: Read {

    /// Reads an unsigned 8 bit integer from the underlying reader.
    #[inline]
    fn read_u8(&mut self) -> io::Result<u8> {
        ReadBytesExt::read_u8(self)
    }

    /// Reads an unsigned big-endian 16 bit integer from the underlying reader.
    #[inline]
    fn read_u16_be(&mut self) -> io::Result<u16> {
        ReadBytesExt::read_u16::<BE>(self)
    }

    /// Reads an unsigned big-endian 32 bit integer from the underlying reader.
    #[inline]
    fn read_u32_be(&mut self) -> io::Result<u32> {
        ReadBytesExt::read_u32::<BE>(self)
    }

    /// Read a base 128 protobuf varint from the underlying reader.
    fn read_vu64(&mut self) -> io::Result<u64> {
        let mut value = 0u64;
        let mut shift = 0u32;
        loop {
            let byte = DfsReadExt::read_u8(self)?;
            if shift >= 64 || (shift == 63 && byte > 1) {
                return Err(io::Error::new(io::ErrorKind::InvalidData, "varint overflow"));
            }
            value |= u64::from(byte & 0x7F) << shift;
            if byte & 0x80 == 0 {
                return Ok(value);
            }
            shift += 7;
        }
    }

    /// Read a blob of the given length.
    fn read_blob(&mut self, len: usize) -> io::Result<Vec<u8>> {
        let mut buf = vec![0; len];
        self.read_exact(&mut buf[..])?;
        Ok(buf)
    }

    /// Read a protobuf message of a length that is specified with a varint
    /// before the message itself.
    fn read_message<M: Message + Default>(&mut self) -> io::Result<M> {
        let len = self.read_vu64()?;
        let buf = self.read_blob(len as usize)?;
        M::decode(&buf[..])
            .map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))
    }

}

/// An extension to the [`Write`] trait specifically used to encode the
/// formats used on the data transfer wire.
pub trait DfsWriteExt: Write {

    /// Writes an unsigned big-endian 16 bit integer to the underlying writer.
    #[inline]
    fn write_u16_be(&mut self, n: u16) -> io::Result<()> {
        WriteBytesExt::write_u16::<BE>(self, n)
    }

    /// Writes an unsigned big-endian 32 bit integer to the underlying writer.
    #[inline]
    fn write_u32_be(&mut self, n: u32) -> io::Result<()> {
        WriteBytesExt::write_u32::<BE>(self, n)
    }

    /// Write a protobuf message prefixed with its varint-encoded length.
    fn write_message<M: Message>(&mut self, msg: &M) -> io::Result<()> {
        self.write_all(&msg.encode_length_delimited_to_vec())
    }

}

impl<R: Read> DfsReadExt for R {}
impl<W: Write> DfsWriteExt for W {}


#[cfg(test)]
mod tests {

    use std::io::Cursor;

    use super::*;

    #[test]
    fn varint() {

        fn read(raw: &[u8]) -> io::Result<u64> {
            Cursor::new(raw).read_vu64()
        }

        assert_eq!(read(&[0x00]).unwrap(), 0);
        assert_eq!(read(&[0x7F]).unwrap(), 127);
        assert_eq!(read(&[0x80, 0x01]).unwrap(), 128);
        assert_eq!(read(&[0xAC, 0x02]).unwrap(), 300);
        assert_eq!(
            read(&[0xFF, 0xFF, 0xFF, 0xFF, 0xFF, 0xFF, 0xFF, 0xFF, 0xFF, 0x01]).unwrap(),
            u64::MAX,
        );

        assert!(read(&[0x80]).is_err()); // Truncated.
        assert!(read(&[0xFF, 0xFF, 0xFF, 0xFF, 0xFF, 0xFF, 0xFF, 0xFF, 0xFF, 0x7F]).is_err());

    }

    #[test]
    fn message_round_trip() {

        use crate::transfer::proto::PipelineAckProto;

        let ack = PipelineAckProto {
            seqno: 42,
            reply: vec![0, 0, 0],
            downstream_ack_time_nanos: None,
        };

        let mut buf = Vec::new();
        buf.write_message(&ack).unwrap();

        let mut cursor = Cursor::new(&buf[..]);
        let back: PipelineAckProto = cursor.read_message().unwrap();
        assert_eq!(back, ack);
        assert_eq!(cursor.position() as usize, buf.len());

    }

}
