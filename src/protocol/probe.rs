use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};

use bytes::{Buf, BufMut};
use zvnet_core::{Error, Result};

/// `nonce`
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ProbeRequest {
    pub nonce: u64,
}

/// `nonce | mapped | alt_ip | alt_port`
///
/// `mapped` is the source address the proxy observed for the request.
/// `alt_ip` is a probe endpoint on a different ip of the proxy and
/// `alt_port` a second port on the ip the request was sent to, 0 if absent.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ProbeReply {
    pub nonce: u64,
    pub mapped: SocketAddr,
    pub alt_ip: Option<SocketAddr>,
    pub alt_port: u16,
}

impl ProbeRequest {
    pub const LEN: usize = 8;

    pub fn encode<B: BufMut>(&self, buf: &mut B) {
        buf.put_u64(self.nonce);
    }
    pub fn decode(mut buf: &[u8]) -> Result<Self> {
        need(buf, Self::LEN)?;
        Ok(Self {
            nonce: buf.get_u64(),
        })
    }
}

impl ProbeReply {
    pub fn encode<B: BufMut>(&self, buf: &mut B) {
        buf.put_u64(self.nonce);
        put_addr(buf, Some(&self.mapped));
        put_addr(buf, self.alt_ip.as_ref());
        buf.put_u16(self.alt_port);
    }
    pub fn decode(mut buf: &[u8]) -> Result<Self> {
        need(buf, 8)?;
        let nonce = buf.get_u64();
        let mapped = get_addr(&mut buf)?.ok_or(Error::InvalidAddress(0))?;
        let alt_ip = get_addr(&mut buf)?;
        need(buf, 2)?;
        let alt_port = buf.get_u16();
        Ok(Self {
            nonce,
            mapped,
            alt_ip,
            alt_port,
        })
    }
}

fn need(buf: &[u8], required: usize) -> Result<()> {
    if buf.len() < required {
        return Err(Error::Truncated {
            len: buf.len(),
            required,
        });
    }
    Ok(())
}

fn put_addr<B: BufMut>(buf: &mut B, addr: Option<&SocketAddr>) {
    match addr {
        None => buf.put_u8(0),
        Some(SocketAddr::V4(addr)) => {
            buf.put_u8(4);
            buf.put_slice(&addr.ip().octets());
            buf.put_u16(addr.port());
        }
        Some(SocketAddr::V6(addr)) => {
            buf.put_u8(6);
            buf.put_slice(&addr.ip().octets());
            buf.put_u16(addr.port());
        }
    }
}

fn get_addr(buf: &mut &[u8]) -> Result<Option<SocketAddr>> {
    need(buf, 1)?;
    let ip: IpAddr = match buf.get_u8() {
        0 => return Ok(None),
        4 => {
            need(buf, 4 + 2)?;
            let mut octets = [0u8; 4];
            buf.copy_to_slice(&mut octets);
            Ipv4Addr::from(octets).into()
        }
        6 => {
            need(buf, 16 + 2)?;
            let mut octets = [0u8; 16];
            buf.copy_to_slice(&mut octets);
            Ipv6Addr::from(octets).into()
        }
        family => return Err(Error::InvalidAddress(family)),
    };
    Ok(Some(SocketAddr::new(ip, buf.get_u16())))
}
