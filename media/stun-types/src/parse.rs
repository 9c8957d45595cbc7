use crate::attributes::{self, XorMappedAddress};
use crate::header::{Class, Method};
use crate::{Error, HEADER_LENGTH, TransactionId, crc32, is_stun_message, padding};
use hmac::{Hmac, Mac};
use sha1::Sha1;
use std::net::SocketAddr;
use std::ops::Range;

/// A parsed STUN message.
///
/// Attribute values are kept as ranges into the original buffer so
/// integrity and fingerprint can be verified over the exact wire bytes.
pub struct Message {
    class: Class,
    method: Method,
    transaction_id: TransactionId,
    attributes: Vec<(u16, Range<usize>)>,
    buffer: Vec<u8>,
}

impl Message {
    pub fn parse(buffer: Vec<u8>) -> Result<Self, Error> {
        if !is_stun_message(&buffer) {
            return Err(Error::InvalidData("not a stun message"));
        }

        let typ = u16::from_be_bytes([buffer[0], buffer[1]]);
        let len = usize::from(u16::from_be_bytes([buffer[2], buffer[3]]));

        if buffer.len() < HEADER_LENGTH + len {
            return Err(Error::TooShort);
        }

        let mut transaction_id = [0u8; 12];
        transaction_id.copy_from_slice(&buffer[8..20]);

        let mut attributes = vec![];
        let mut at = HEADER_LENGTH;
        let end = HEADER_LENGTH + len;

        while at + 4 <= end {
            let attr_typ = u16::from_be_bytes([buffer[at], buffer[at + 1]]);
            let attr_len = usize::from(u16::from_be_bytes([buffer[at + 2], buffer[at + 3]]));

            let value_start = at + 4;
            let value_end = value_start + attr_len;

            if value_end > end {
                return Err(Error::TooShort);
            }

            attributes.push((attr_typ, value_start..value_end));

            at = value_end + padding(attr_len);
        }

        Ok(Message {
            class: Class::from_typ(typ),
            method: Method::from_typ(typ)?,
            transaction_id: TransactionId(transaction_id),
            attributes,
            buffer,
        })
    }

    pub fn class(&self) -> Class {
        self.class
    }

    pub fn method(&self) -> Method {
        self.method
    }

    pub fn transaction_id(&self) -> TransactionId {
        self.transaction_id
    }

    /// Consume the message and return the original wire bytes
    pub fn into_bytes(self) -> Vec<u8> {
        self.buffer
    }

    fn attr_bytes(&self, typ: u16) -> Option<&[u8]> {
        self.attributes
            .iter()
            .find(|(attr_typ, _)| *attr_typ == typ)
            .map(|(_, range)| &self.buffer[range.clone()])
    }

    fn attr_offset(&self, typ: u16) -> Option<usize> {
        self.attributes
            .iter()
            .find(|(attr_typ, _)| *attr_typ == typ)
            .map(|(_, range)| range.start - 4)
    }

    pub fn username(&self) -> Option<&str> {
        std::str::from_utf8(self.attr_bytes(attributes::USERNAME)?).ok()
    }

    pub fn priority(&self) -> Option<u32> {
        let bytes: [u8; 4] = self.attr_bytes(attributes::PRIORITY)?.try_into().ok()?;
        Some(u32::from_be_bytes(bytes))
    }

    pub fn use_candidate(&self) -> bool {
        self.attr_bytes(attributes::USE_CANDIDATE).is_some()
    }

    pub fn ice_controlling(&self) -> Option<u64> {
        let bytes: [u8; 8] = self
            .attr_bytes(attributes::ICE_CONTROLLING)?
            .try_into()
            .ok()?;
        Some(u64::from_be_bytes(bytes))
    }

    pub fn ice_controlled(&self) -> Option<u64> {
        let bytes: [u8; 8] = self
            .attr_bytes(attributes::ICE_CONTROLLED)?
            .try_into()
            .ok()?;
        Some(u64::from_be_bytes(bytes))
    }

    pub fn error_code(&self) -> Option<(u16, &str)> {
        let bytes = self.attr_bytes(attributes::ERROR_CODE)?;

        if bytes.len() < 4 {
            return None;
        }

        let number = u16::from(bytes[2] & 0x07) * 100 + u16::from(bytes[3]);
        let reason = std::str::from_utf8(&bytes[4..]).unwrap_or("");

        Some((number, reason))
    }

    pub fn xor_mapped_address(&self) -> Option<SocketAddr> {
        let bytes = self.attr_bytes(attributes::XOR_MAPPED_ADDRESS)?;

        XorMappedAddress::decode(bytes, self.transaction_id)
            .ok()
            .map(|addr| addr.0)
    }

    /// Verify the FINGERPRINT attribute. Messages without one fail the check.
    pub fn check_fingerprint(&self) -> bool {
        let Some(offset) = self.attr_offset(attributes::FINGERPRINT) else {
            return false;
        };

        let Some(bytes) = self.attr_bytes(attributes::FINGERPRINT) else {
            return false;
        };

        let Ok(expected) = <[u8; 4]>::try_from(bytes) else {
            return false;
        };

        let mut covered = self.buffer[..offset].to_vec();
        patch_len(&mut covered, offset - HEADER_LENGTH + 8);

        crc32(&covered) ^ 0x5354_554E == u32::from_be_bytes(expected)
    }

    /// Verify MESSAGE-INTEGRITY with `key`. Messages without the attribute
    /// fail the check.
    pub fn verify_integrity(&self, key: &[u8]) -> bool {
        let Some(offset) = self.attr_offset(attributes::MESSAGE_INTEGRITY) else {
            return false;
        };

        let Some(expected) = self.attr_bytes(attributes::MESSAGE_INTEGRITY) else {
            return false;
        };

        let mut covered = self.buffer[..offset].to_vec();
        patch_len(&mut covered, offset - HEADER_LENGTH + 24);

        let mut mac = Hmac::<Sha1>::new_from_slice(key).expect("hmac accepts any key length");
        mac.update(&covered);

        mac.verify_slice(expected).is_ok()
    }
}

fn patch_len(buffer: &mut [u8], len: usize) {
    buffer[2..4].copy_from_slice(&(len as u16).to_be_bytes());
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::MessageBuilder;

    #[test]
    fn binding_request_roundtrip() {
        let tsx = TransactionId::random();

        let mut builder = MessageBuilder::new(Class::Request, Method::Binding, tsx);
        builder
            .username("remote:local")
            .priority(12345)
            .ice_controlling(77)
            .use_candidate()
            .message_integrity(b"the-password")
            .fingerprint();
        let bytes = builder.finish();

        let message = Message::parse(bytes).unwrap();

        assert_eq!(message.class(), Class::Request);
        assert_eq!(message.method(), Method::Binding);
        assert_eq!(message.transaction_id(), tsx);
        assert_eq!(message.username(), Some("remote:local"));
        assert_eq!(message.priority(), Some(12345));
        assert_eq!(message.ice_controlling(), Some(77));
        assert!(message.use_candidate());

        assert!(message.check_fingerprint());
        assert!(message.verify_integrity(b"the-password"));
        assert!(!message.verify_integrity(b"wrong-password"));
    }

    #[test]
    fn success_response_roundtrip() {
        let tsx = TransactionId::random();
        let addr: SocketAddr = "203.0.113.7:41000".parse().unwrap();

        let mut builder = MessageBuilder::new(Class::Success, Method::Binding, tsx);
        builder
            .xor_mapped_address(addr)
            .message_integrity(b"pwd")
            .fingerprint();
        let bytes = builder.finish();

        let message = Message::parse(bytes).unwrap();

        assert_eq!(message.class(), Class::Success);
        assert_eq!(message.xor_mapped_address(), Some(addr));
        assert!(message.check_fingerprint());
    }

    #[test]
    fn error_code_roundtrip() {
        let tsx = TransactionId::random();

        let mut builder = MessageBuilder::new(Class::Error, Method::Binding, tsx);
        builder.error_code(487, "Role Conflict").fingerprint();
        let bytes = builder.finish();

        let message = Message::parse(bytes).unwrap();

        assert_eq!(message.error_code(), Some((487, "Role Conflict")));
    }

    #[test]
    fn truncated_message_is_rejected() {
        let tsx = TransactionId::random();

        let mut builder = MessageBuilder::new(Class::Request, Method::Binding, tsx);
        builder.username("a:b");
        let mut bytes = builder.finish();

        bytes.truncate(22);

        assert!(matches!(Message::parse(bytes), Err(Error::TooShort)));
    }
}
