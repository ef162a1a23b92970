//! Length-delimited packet codec for stream transports.
//!
//! Wire format: 4-byte big-endian frame length, then the frame:
//! 4-byte big-endian header length + serde JSON header + raw body.

use bytes::{Buf, BufMut, BytesMut};
use tokio_util::codec::{Decoder, Encoder};

use crate::packet::{Packet, PacketHeader};
use crate::{ProtocolError, MAX_FRAME_BYTES, MAX_HEADER_BYTES};

/// Length prefix size in bytes.
const LENGTH_PREFIX_SIZE: usize = 4;

/// Codec for framing Packet values over a byte stream.
#[derive(Debug, Default, Clone, Copy)]
pub struct PacketCodec;

impl Decoder for PacketCodec {
    type Item = Packet;
    type Error = ProtocolError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        if src.len() < LENGTH_PREFIX_SIZE {
            return Ok(None);
        }

        let length = u32::from_be_bytes([src[0], src[1], src[2], src[3]]) as usize;

        if length > MAX_FRAME_BYTES {
            return Err(ProtocolError::FrameTooLarge {
                size: length,
                max: MAX_FRAME_BYTES,
            });
        }
        if length < LENGTH_PREFIX_SIZE {
            return Err(ProtocolError::HeaderOutOfBounds {
                header: LENGTH_PREFIX_SIZE,
                frame: length,
            });
        }

        let total = LENGTH_PREFIX_SIZE + length;
        if src.len() < total {
            src.reserve(total - src.len());
            return Ok(None);
        }

        src.advance(LENGTH_PREFIX_SIZE);
        let mut frame = src.split_to(length);

        let header_len = frame.get_u32() as usize;
        if header_len > MAX_HEADER_BYTES {
            return Err(ProtocolError::HeaderTooLarge {
                size: header_len,
                max: MAX_HEADER_BYTES,
            });
        }
        if header_len > frame.len() {
            return Err(ProtocolError::HeaderOutOfBounds {
                header: header_len,
                frame: length,
            });
        }

        let header_bytes = frame.split_to(header_len);
        let header: PacketHeader = serde_json::from_slice(&header_bytes)?;

        Ok(Some(Packet {
            header,
            body: frame.freeze(),
        }))
    }
}

impl Encoder<Packet> for PacketCodec {
    type Error = ProtocolError;

    fn encode(&mut self, item: Packet, dst: &mut BytesMut) -> Result<(), Self::Error> {
        let header = serde_json::to_vec(&item.header)?;

        if header.len() > MAX_HEADER_BYTES {
            return Err(ProtocolError::HeaderTooLarge {
                size: header.len(),
                max: MAX_HEADER_BYTES,
            });
        }

        let frame_len = LENGTH_PREFIX_SIZE + header.len() + item.body.len();
        if frame_len > MAX_FRAME_BYTES {
            return Err(ProtocolError::FrameTooLarge {
                size: frame_len,
                max: MAX_FRAME_BYTES,
            });
        }

        dst.reserve(LENGTH_PREFIX_SIZE + frame_len);
        dst.put_u32(frame_len as u32);
        dst.put_u32(header.len() as u32);
        dst.extend_from_slice(&header);
        dst.extend_from_slice(&item.body);

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::packet::{ChunkHeader, NodeHello};
    use bytes::Bytes;
    use proptest::prelude::*;
    use uuid::Uuid;

    fn hello(id: &str) -> Packet {
        Packet::header_only(PacketHeader::NodeHello(NodeHello {
            unique_id: id.into(),
            revision: 1,
        }))
    }

    #[test]
    fn test_encode_decode_roundtrip() {
        let mut codec = PacketCodec;
        let packet = Packet::new(
            PacketHeader::TemplateDeploy(ChunkHeader::data(Uuid::new_v4(), 7)),
            Bytes::from_static(b"template bytes"),
        );

        let mut buf = BytesMut::new();
        codec.encode(packet.clone(), &mut buf).unwrap();
        assert!(buf.len() > 8);

        let decoded = codec.decode(&mut buf).unwrap().unwrap();
        assert_eq!(decoded, packet);
        assert!(buf.is_empty());
    }

    #[test]
    fn test_partial_frame() {
        let mut codec = PacketCodec;
        let mut buf = BytesMut::new();
        codec.encode(hello("Node-1"), &mut buf).unwrap();

        let half = buf.len() / 2;
        let mut partial = buf.split_to(half);

        assert!(codec.decode(&mut partial).unwrap().is_none());
    }

    #[test]
    fn test_multiple_frames() {
        let mut codec = PacketCodec;
        let mut buf = BytesMut::new();

        for i in 0..5 {
            codec.encode(hello(&format!("Node-{i}")), &mut buf).unwrap();
        }

        for i in 0..5 {
            let decoded = codec.decode(&mut buf).unwrap().unwrap();
            match decoded.header {
                PacketHeader::NodeHello(h) => assert_eq!(h.unique_id, format!("Node-{i}")),
                other => panic!("wrong header: {other:?}"),
            }
        }

        assert!(codec.decode(&mut buf).unwrap().is_none());
    }

    #[test]
    fn test_oversized_frame_rejected() {
        let mut codec = PacketCodec;
        let mut buf = BytesMut::new();

        buf.put_u32((MAX_FRAME_BYTES + 1) as u32);
        buf.extend_from_slice(&[0u8; 100]);

        assert!(matches!(
            codec.decode(&mut buf),
            Err(ProtocolError::FrameTooLarge { .. })
        ));
    }

    #[test]
    fn test_header_length_beyond_frame_rejected() {
        let mut codec = PacketCodec;
        let mut buf = BytesMut::new();

        buf.put_u32(8);
        buf.put_u32(100);
        buf.extend_from_slice(&[0u8; 4]);

        assert!(matches!(
            codec.decode(&mut buf),
            Err(ProtocolError::HeaderOutOfBounds { .. })
        ));
    }

    proptest! {
        #[test]
        fn prop_body_survives_framing(body in proptest::collection::vec(any::<u8>(), 0..4096)) {
            let mut codec = PacketCodec;
            let packet = Packet::new(
                PacketHeader::TemplateDeploy(ChunkHeader::data(Uuid::nil(), 1)),
                body.clone(),
            );
            let mut buf = BytesMut::new();
            codec.encode(packet, &mut buf).unwrap();
            let decoded = codec.decode(&mut buf).unwrap().unwrap();
            prop_assert_eq!(decoded.body.as_ref(), body.as_slice());
        }
    }
}
