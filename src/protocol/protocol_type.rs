#[derive(Eq, PartialEq, Copy, Clone, Debug)]
#[repr(u8)]
pub enum ProtocolType {
    /// Initiator's signed login record
    Login = 1,
    /// Acceptor's signed login record
    LoginAck = 2,
    LoginConfirm = 3,
    LoginReject = 4,
    /// ARQ segments
    Data = 5,
    Close = 6,
    Ping = 7,
    Pong = 8,
    /// NAT probe to the proxy
    ProbeRequest = 16,
    ProbeReply = 17,
    /// Datagram forwarded by the proxy
    Relay = 18,
    Unknown = 255,
}

impl From<u8> for ProtocolType {
    fn from(value: u8) -> Self {
        match value {
            1 => ProtocolType::Login,
            2 => ProtocolType::LoginAck,
            3 => ProtocolType::LoginConfirm,
            4 => ProtocolType::LoginReject,
            5 => ProtocolType::Data,
            6 => ProtocolType::Close,
            7 => ProtocolType::Ping,
            8 => ProtocolType::Pong,
            16 => ProtocolType::ProbeRequest,
            17 => ProtocolType::ProbeReply,
            18 => ProtocolType::Relay,
            _ => ProtocolType::Unknown,
        }
    }
}

impl From<ProtocolType> for u8 {
    fn from(value: ProtocolType) -> Self {
        value as u8
    }
}

#[cfg(test)]
mod test {
    use super::ProtocolType;

    #[test]
    fn test_new_protocol() {
        assert_eq!(ProtocolType::from(2), ProtocolType::LoginAck);
        assert_eq!(ProtocolType::from(18), ProtocolType::Relay);
        assert_eq!(ProtocolType::from(9), ProtocolType::Unknown);
        assert_eq!(ProtocolType::from(128), ProtocolType::Unknown);
        assert_eq!(u8::from(ProtocolType::ProbeReply), 17);
    }
}
