use bytes::{Buf, BufMut, BytesMut};

use crate::error::{Error, Result};

/// `conv | cmd | frg | wnd | ts | sn | una | len`, little-endian.
pub const HEADER_LEN: usize = 24;

#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum Command {
    Push,
    Ack,
    /// Asks the peer to advertise its receive window.
    WindowAsk,
    /// Unsolicited window advertisement.
    WindowTell,
}

impl TryFrom<u8> for Command {
    type Error = Error;

    fn try_from(value: u8) -> Result<Self> {
        match value {
            81 => Ok(Command::Push),
            82 => Ok(Command::Ack),
            83 => Ok(Command::WindowAsk),
            84 => Ok(Command::WindowTell),
            _ => Err(Error::InvalidSegment),
        }
    }
}

impl From<Command> for u8 {
    fn from(value: Command) -> Self {
        match value {
            Command::Push => 81,
            Command::Ack => 82,
            Command::WindowAsk => 83,
            Command::WindowTell => 84,
        }
    }
}

#[derive(Debug, Clone)]
pub(crate) struct Segment {
    pub conv: u32,
    pub cmd: Command,
    pub frg: u8,
    pub wnd: u16,
    pub ts: u32,
    pub sn: u32,
    pub una: u32,
    pub data: BytesMut,

    // sender bookkeeping, never on the wire
    pub resendts: u32,
    pub rto: u32,
    pub fastack: u32,
    pub xmit: u32,
}

impl Segment {
    pub fn new(conv: u32, cmd: Command, data: BytesMut) -> Self {
        Self {
            conv,
            cmd,
            frg: 0,
            wnd: 0,
            ts: 0,
            sn: 0,
            una: 0,
            data,
            resendts: 0,
            rto: 0,
            fastack: 0,
            xmit: 0,
        }
    }
    pub fn encoded_len(&self) -> usize {
        HEADER_LEN + self.data.len()
    }
    pub fn encode(&self, buf: &mut BytesMut) {
        buf.reserve(self.encoded_len());
        buf.put_u32_le(self.conv);
        buf.put_u8(self.cmd.into());
        buf.put_u8(self.frg);
        buf.put_u16_le(self.wnd);
        buf.put_u32_le(self.ts);
        buf.put_u32_le(self.sn);
        buf.put_u32_le(self.una);
        buf.put_u32_le(self.data.len() as u32);
        buf.put_slice(&self.data);
    }
    /// Decodes the segment at the front of `buf` and advances past it.
    pub fn decode(buf: &mut &[u8]) -> Result<Self> {
        if buf.len() < HEADER_LEN {
            return Err(Error::InvalidSegment);
        }
        let conv = buf.get_u32_le();
        let cmd = Command::try_from(buf.get_u8())?;
        let frg = buf.get_u8();
        let wnd = buf.get_u16_le();
        let ts = buf.get_u32_le();
        let sn = buf.get_u32_le();
        let una = buf.get_u32_le();
        let len = buf.get_u32_le() as usize;
        if buf.len() < len {
            return Err(Error::InvalidSegment);
        }
        let data = BytesMut::from(&buf[..len]);
        buf.advance(len);
        let mut segment = Segment::new(conv, cmd, data);
        segment.frg = frg;
        segment.wnd = wnd;
        segment.ts = ts;
        segment.sn = sn;
        segment.una = una;
        Ok(segment)
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn header_layout() {
        let mut segment = Segment::new(0x11223344, Command::Push, BytesMut::from(&b"abc"[..]));
        segment.sn = 9;
        segment.wnd = 128;
        let mut buf = BytesMut::new();
        segment.encode(&mut buf);
        assert_eq!(buf.len(), HEADER_LEN + 3);
        assert_eq!(&buf[..4], &[0x44, 0x33, 0x22, 0x11]);
        assert_eq!(buf[4], 81);

        let mut cursor = &buf[..];
        let decoded = Segment::decode(&mut cursor).unwrap();
        assert!(cursor.is_empty());
        assert_eq!(decoded.sn, 9);
        assert_eq!(decoded.wnd, 128);
        assert_eq!(&decoded.data[..], b"abc");
    }

    #[test]
    fn rejects_short_payload() {
        let mut buf = BytesMut::new();
        Segment::new(1, Command::Push, BytesMut::from(&b"abcdef"[..])).encode(&mut buf);
        let mut cursor = &buf[..buf.len() - 1];
        assert!(matches!(
            Segment::decode(&mut cursor),
            Err(Error::InvalidSegment)
        ));
        buf[4] = 7;
        let mut cursor = &buf[..];
        assert!(Segment::decode(&mut cursor).is_err());
    }
}
