use crate::{COOKIE, Error, TransactionId};
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};

pub(crate) const USERNAME: u16 = 0x0006;
pub(crate) const MESSAGE_INTEGRITY: u16 = 0x0008;
pub(crate) const ERROR_CODE: u16 = 0x0009;
pub(crate) const XOR_MAPPED_ADDRESS: u16 = 0x0020;
pub(crate) const PRIORITY: u16 = 0x0024;
pub(crate) const USE_CANDIDATE: u16 = 0x0025;
pub(crate) const FINGERPRINT: u16 = 0x8028;
pub(crate) const ICE_CONTROLLED: u16 = 0x8029;
pub(crate) const ICE_CONTROLLING: u16 = 0x802A;

const FAMILY_V4: u8 = 0x01;
const FAMILY_V6: u8 = 0x02;

/// XOR-MAPPED-ADDRESS attribute value
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct XorMappedAddress(pub SocketAddr);

impl XorMappedAddress {
    pub(crate) fn encode(self, transaction_id: TransactionId, dst: &mut Vec<u8>) {
        let port = self.0.port() ^ (COOKIE >> 16) as u16;

        match self.0.ip() {
            IpAddr::V4(ip) => {
                dst.extend_from_slice(&[0, FAMILY_V4]);
                dst.extend_from_slice(&port.to_be_bytes());

                let bits = u32::from(ip) ^ COOKIE;
                dst.extend_from_slice(&bits.to_be_bytes());
            }
            IpAddr::V6(ip) => {
                dst.extend_from_slice(&[0, FAMILY_V6]);
                dst.extend_from_slice(&port.to_be_bytes());

                let bits = u128::from(ip) ^ xor128(transaction_id);
                dst.extend_from_slice(&bits.to_be_bytes());
            }
        }
    }

    pub(crate) fn decode(
        bytes: &[u8],
        transaction_id: TransactionId,
    ) -> Result<Self, Error> {
        if bytes.len() < 8 {
            return Err(Error::TooShort);
        }

        let family = bytes[1];
        let port = u16::from_be_bytes([bytes[2], bytes[3]]) ^ (COOKIE >> 16) as u16;

        let ip = match family {
            FAMILY_V4 => {
                let bits = u32::from_be_bytes([bytes[4], bytes[5], bytes[6], bytes[7]]) ^ COOKIE;
                IpAddr::V4(Ipv4Addr::from(bits))
            }
            FAMILY_V6 => {
                if bytes.len() < 20 {
                    return Err(Error::TooShort);
                }

                let mut raw = [0u8; 16];
                raw.copy_from_slice(&bytes[4..20]);

                let bits = u128::from_be_bytes(raw) ^ xor128(transaction_id);
                IpAddr::V6(Ipv6Addr::from(bits))
            }
            _ => return Err(Error::InvalidData("unknown address family")),
        };

        Ok(XorMappedAddress(SocketAddr::new(ip, port)))
    }
}

/// IPv6 addresses are xor'ed with cookie + transaction id
fn xor128(transaction_id: TransactionId) -> u128 {
    let mut bytes = [0u8; 16];
    bytes[..4].copy_from_slice(&COOKIE.to_be_bytes());
    bytes[4..].copy_from_slice(&transaction_id.0);

    u128::from_be_bytes(bytes)
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn xor_mapped_roundtrip_v4() {
        let tsx = TransactionId::random();
        let addr = XorMappedAddress("192.0.2.1:32853".parse().unwrap());

        let mut encoded = vec![];
        addr.encode(tsx, &mut encoded);

        assert_eq!(XorMappedAddress::decode(&encoded, tsx).unwrap(), addr);
    }

    #[test]
    fn xor_mapped_roundtrip_v6() {
        let tsx = TransactionId::random();
        let addr = XorMappedAddress("[2001:db8::1]:5000".parse().unwrap());

        let mut encoded = vec![];
        addr.encode(tsx, &mut encoded);

        assert_eq!(XorMappedAddress::decode(&encoded, tsx).unwrap(), addr);
    }
}
