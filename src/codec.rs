use crate::{
    command::Command,
    config::Config,
    error::{Result, SmuxError},
    frame::{Frame, HEADER_SIZE, UPD_SIZE},
};
use bytes::{Buf, BufMut, BytesMut};
use tokio_util::codec::{Decoder, Encoder};

/// Frame codec for one session.
///
/// The decoder rejects frames whose version differs from the session's,
/// unknown commands, and payloads larger than `max_frame_size`. Payloads of
/// frames for streams that no longer exist are still consumed here, so the
/// byte stream stays aligned on frame boundaries.
#[derive(Debug, Clone)]
pub struct Codec {
    version: u8,
    max_frame_size: usize,
}

impl Codec {
    pub fn new(config: &Config) -> Self {
        Self {
            version: config.version,
            max_frame_size: config.max_frame_size,
        }
    }

    fn peek_header(src: &[u8]) -> (u8, u8, usize, u32) {
        let version = src[0];
        let cmd = src[1];
        let length = u16::from_le_bytes([src[2], src[3]]) as usize;
        let stream_id = u32::from_le_bytes([src[4], src[5], src[6], src[7]]);
        (version, cmd, length, stream_id)
    }

    fn encode_header(dst: &mut BytesMut, version: u8, cmd: Command, stream_id: u32, length: u16) {
        dst.put_u8(version);
        dst.put_u8(cmd.to_byte());
        dst.put_u16_le(length);
        dst.put_u32_le(stream_id);
    }

    fn decode_upd(mut data: &[u8]) -> Result<Command> {
        if data.len() != UPD_SIZE {
            return Err(SmuxError::ProtocolViolation(format!(
                "UPD frame must carry exactly {UPD_SIZE} bytes, got {}",
                data.len()
            )));
        }

        let consumed = data.get_u32_le();
        let window = data.get_u32_le();
        Ok(Command::Upd { consumed, window })
    }
}

impl Decoder for Codec {
    type Item = Frame;
    type Error = SmuxError;

    fn decode(
        &mut self,
        src: &mut BytesMut,
    ) -> std::result::Result<Option<Self::Item>, Self::Error> {
        if src.len() < HEADER_SIZE {
            return Ok(None);
        }

        let (version, cmd_byte, length, stream_id) = Self::peek_header(&src[..HEADER_SIZE]);

        if version != self.version {
            return Err(SmuxError::InvalidProtocol(version));
        }

        let cmd = Command::from_byte(cmd_byte)?;

        if cmd.requires_v2() && self.version < 2 {
            return Err(SmuxError::ProtocolViolation(
                "UPD received on a version 1 session".to_string(),
            ));
        }

        let limit = match cmd {
            Command::Upd { .. } => UPD_SIZE,
            _ => self.max_frame_size,
        };
        if length > limit {
            return Err(SmuxError::MaxReceiveBuffer {
                size: HEADER_SIZE + length,
                max: HEADER_SIZE + limit,
            });
        }

        let total_frame_size = HEADER_SIZE + length;
        if src.len() < total_frame_size {
            src.reserve(total_frame_size - src.len());
            return Ok(None);
        }

        src.advance(HEADER_SIZE);
        let data = src.split_to(length).freeze();

        let frame = match cmd {
            Command::Upd { .. } => {
                let cmd = Self::decode_upd(&data)?;
                Frame::new(version, cmd, stream_id, bytes::Bytes::new())
            }
            _ => Frame::new(version, cmd, stream_id, data),
        };

        Ok(Some(frame))
    }
}

impl Encoder<Frame> for Codec {
    type Error = SmuxError;

    fn encode(&mut self, frame: Frame, dst: &mut BytesMut) -> std::result::Result<(), Self::Error> {
        frame.validate(self.max_frame_size)?;

        let length = u16::try_from(frame.payload_len()).map_err(|_| SmuxError::FrameTooLarge {
            size: frame.payload_len(),
            max: u16::MAX as usize,
        })?;

        dst.reserve(frame.total_size());
        Self::encode_header(dst, frame.version, frame.cmd, frame.stream_id, length);

        match frame.cmd {
            Command::Upd { consumed, window } => {
                dst.put_u32_le(consumed);
                dst.put_u32_le(window);
            }
            _ => dst.put_slice(&frame.data),
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::Bytes;

    fn codec(version: u8) -> Codec {
        Codec::new(&Config {
            version,
            ..Config::default()
        })
    }

    #[test]
    fn test_codec_round_trip() {
        let mut codec = codec(2);
        let frames = [
            Frame::new_syn(2, 3),
            Frame::new_fin(2, 3),
            Frame::new_nop(2),
            Frame::new_psh(2, 3, Bytes::from("hello world")),
            Frame::new_upd(2, 3, 100, 200),
        ];

        let mut buf = BytesMut::new();
        for frame in &frames {
            codec.encode(frame.clone(), &mut buf).unwrap();
        }

        for frame in frames {
            let decoded = codec.decode(&mut buf).unwrap().unwrap();
            assert_eq!(frame, decoded);
        }
        assert!(codec.decode(&mut buf).unwrap().is_none());
    }

    #[test]
    fn test_header_layout() {
        let mut codec = codec(1);
        let mut buf = BytesMut::new();
        codec
            .encode(Frame::new_psh(1, 0x0102_0304, Bytes::from("abc")), &mut buf)
            .unwrap();

        assert_eq!(
            &buf[..],
            &[1, Command::PSH, 3, 0, 0x04, 0x03, 0x02, 0x01, b'a', b'b', b'c']
        );
    }

    #[test]
    fn test_decode_partial_header() {
        let mut codec = codec(1);
        let mut buf = BytesMut::new();
        codec.encode(Frame::new_syn(1, 123), &mut buf).unwrap();

        let mut partial = BytesMut::from(&buf[..4]);
        assert!(codec.decode(&mut partial).unwrap().is_none());
    }

    #[test]
    fn test_decode_partial_data() {
        let mut codec = codec(1);
        let mut buf = BytesMut::new();
        codec
            .encode(Frame::new_psh(1, 123, Bytes::from("hello world")), &mut buf)
            .unwrap();

        let mut partial = BytesMut::from(&buf[..HEADER_SIZE + 5]);
        assert!(codec.decode(&mut partial).unwrap().is_none());

        // Feeding the rest completes the frame.
        partial.extend_from_slice(&buf[HEADER_SIZE + 5..]);
        let frame = codec.decode(&mut partial).unwrap().unwrap();
        assert_eq!(frame.data, Bytes::from("hello world"));
    }

    #[test]
    fn test_encode_oversized_frame() {
        let mut codec = Codec::new(&Config {
            max_frame_size: 100,
            ..Config::default()
        });

        let frame = Frame::new_psh(1, 123, Bytes::from(vec![0u8; 200]));
        let mut buf = BytesMut::new();
        assert!(matches!(
            codec.encode(frame, &mut buf),
            Err(SmuxError::FrameTooLarge { .. })
        ));
    }

    #[test]
    fn test_decode_oversized_frame() {
        let mut codec = Codec::new(&Config {
            max_frame_size: 100,
            ..Config::default()
        });

        let mut buf = BytesMut::new();
        buf.put_u8(1);
        buf.put_u8(Command::PSH);
        buf.put_u16_le(200);
        buf.put_u32_le(123);

        assert!(matches!(
            codec.decode(&mut buf),
            Err(SmuxError::MaxReceiveBuffer { size: 208, max: 108 })
        ));
    }

    #[test]
    fn test_decode_version_mismatch() {
        let mut codec = codec(1);

        let mut buf = BytesMut::new();
        buf.put_u8(2);
        buf.put_u8(Command::SYN);
        buf.put_u16_le(0);
        buf.put_u32_le(123);

        assert!(matches!(
            codec.decode(&mut buf),
            Err(SmuxError::InvalidProtocol(2))
        ));
    }

    #[test]
    fn test_decode_invalid_command() {
        let mut codec = codec(1);

        let mut buf = BytesMut::new();
        buf.put_u8(1);
        buf.put_u8(255);
        buf.put_u16_le(0);
        buf.put_u32_le(123);

        assert!(matches!(
            codec.decode(&mut buf),
            Err(SmuxError::InvalidCommand(255))
        ));
    }

    #[test]
    fn test_upd_frame_encoding() {
        let mut codec = codec(2);
        let mut buf = BytesMut::new();
        codec
            .encode(Frame::new_upd(2, 123, 100, 200), &mut buf)
            .unwrap();

        assert_eq!(buf.len(), HEADER_SIZE + UPD_SIZE);
        assert_eq!(buf[0], 2);
        assert_eq!(buf[1], Command::UPD);
        assert_eq!(u16::from_le_bytes([buf[2], buf[3]]), 8);
        assert_eq!(u32::from_le_bytes([buf[4], buf[5], buf[6], buf[7]]), 123);
        assert_eq!(u32::from_le_bytes([buf[8], buf[9], buf[10], buf[11]]), 100);
        assert_eq!(u32::from_le_bytes([buf[12], buf[13], buf[14], buf[15]]), 200);
    }

    #[test]
    fn test_invalid_upd_data_length() {
        let mut codec = codec(2);

        let mut buf = BytesMut::new();
        buf.put_u8(2);
        buf.put_u8(Command::UPD);
        buf.put_u16_le(4);
        buf.put_u32_le(123);
        buf.put_u32_le(100);

        assert!(codec.decode(&mut buf).is_err());
    }

    #[test]
    fn test_upd_rejected_on_v1() {
        let mut codec = codec(1);

        let mut buf = BytesMut::new();
        buf.put_u8(1);
        buf.put_u8(Command::UPD);
        buf.put_u16_le(8);
        buf.put_u32_le(123);
        buf.put_u64_le(0);

        assert!(matches!(
            codec.decode(&mut buf),
            Err(SmuxError::ProtocolViolation(_))
        ));
    }
}
