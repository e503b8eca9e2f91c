/*
   0                                            15                                              31
   0  1  2  3  4  5  6  7  8  9  0  1  2  3  4  5  6  7  8  9  0  1  2  3  4  5  6  7  8  9  0  1
  +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
  |     version(8)       |     protocol (8)     |                  reserved(16)                 |
  +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
  |                                         src ID(64)                                          |
  +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
  |                                         dest ID(64)                                         |
  +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
  |                                         payload(n)                                          |
  +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
*/

use bytes::{BufMut, BytesMut};
use zvnet_core::{Error, Result};

use protocol_type::ProtocolType;

pub mod probe;
pub mod protocol_type;

pub const VERSION: u8 = 1;
pub const HEAD_LEN: usize = 20;

pub struct NetPacket<B> {
    buffer: B,
}

impl<B: AsRef<[u8]>> NetPacket<B> {
    pub fn new(buffer: B) -> Result<NetPacket<B>> {
        let len = buffer.as_ref().len();
        if len < HEAD_LEN {
            return Err(Error::Truncated {
                len,
                required: HEAD_LEN,
            });
        }
        if buffer.as_ref()[0] != VERSION {
            return Err(Error::InvalidProtocol);
        }
        Ok(Self { buffer })
    }
    pub fn version(&self) -> u8 {
        self.buffer.as_ref()[0]
    }
    pub fn protocol(&self) -> ProtocolType {
        self.buffer.as_ref()[1].into()
    }
    pub fn src_id(&self) -> u64 {
        let mut id = [0u8; 8];
        id.copy_from_slice(&self.buffer.as_ref()[4..12]);
        u64::from_be_bytes(id)
    }
    pub fn dst_id(&self) -> u64 {
        let mut id = [0u8; 8];
        id.copy_from_slice(&self.buffer.as_ref()[12..20]);
        u64::from_be_bytes(id)
    }
    pub fn payload(&self) -> &[u8] {
        &self.buffer.as_ref()[HEAD_LEN..]
    }
    pub fn buffer(&self) -> &[u8] {
        self.buffer.as_ref()
    }
    pub fn into_buffer(self) -> B {
        self.buffer
    }
}

impl NetPacket<BytesMut> {
    pub fn build(protocol: ProtocolType, src_id: u64, dst_id: u64, payload: &[u8]) -> Self {
        let mut buffer = BytesMut::with_capacity(HEAD_LEN + payload.len());
        buffer.put_u8(VERSION);
        buffer.put_u8(protocol.into());
        buffer.put_u16(0);
        buffer.put_u64(src_id);
        buffer.put_u64(dst_id);
        buffer.put_slice(payload);
        Self { buffer }
    }
    /// Wraps a complete datagram for forwarding by the proxy.
    pub fn relay(inner: &[u8], src_id: u64, dst_id: u64) -> Self {
        Self::build(ProtocolType::Relay, src_id, dst_id, inner)
    }
}
