use crate::attributes::{self, XorMappedAddress};
use crate::header::{Class, Method};
use crate::{COOKIE, HEADER_LENGTH, TransactionId, crc32, padding};
use bytes::BufMut;
use hmac::{Hmac, Mac};
use sha1::Sha1;

/// Builder for a STUN message.
///
/// Attributes are appended in call order; MESSAGE-INTEGRITY and FINGERPRINT
/// must come last since they cover everything before them.
pub struct MessageBuilder {
    transaction_id: TransactionId,
    buffer: Vec<u8>,
}

impl MessageBuilder {
    pub fn new(class: Class, method: Method, transaction_id: TransactionId) -> Self {
        let mut buffer = Vec::with_capacity(64);

        buffer.put_u16(class.bits() | method.bits());
        buffer.put_u16(0);
        buffer.put_u32(COOKIE);
        buffer.put_slice(&transaction_id.0);

        Self {
            transaction_id,
            buffer,
        }
    }

    pub fn username(&mut self, username: &str) -> &mut Self {
        self.raw_attr(attributes::USERNAME, username.as_bytes())
    }

    pub fn priority(&mut self, priority: u32) -> &mut Self {
        self.raw_attr(attributes::PRIORITY, &priority.to_be_bytes())
    }

    pub fn use_candidate(&mut self) -> &mut Self {
        self.raw_attr(attributes::USE_CANDIDATE, &[])
    }

    pub fn ice_controlling(&mut self, tie_breaker: u64) -> &mut Self {
        self.raw_attr(attributes::ICE_CONTROLLING, &tie_breaker.to_be_bytes())
    }

    pub fn ice_controlled(&mut self, tie_breaker: u64) -> &mut Self {
        self.raw_attr(attributes::ICE_CONTROLLED, &tie_breaker.to_be_bytes())
    }

    pub fn xor_mapped_address(&mut self, addr: std::net::SocketAddr) -> &mut Self {
        let mut value = vec![];
        XorMappedAddress(addr).encode(self.transaction_id, &mut value);

        self.raw_attr(attributes::XOR_MAPPED_ADDRESS, &value)
    }

    pub fn error_code(&mut self, number: u16, reason: &str) -> &mut Self {
        let mut value = vec![0, 0, (number / 100) as u8, (number % 100) as u8];
        value.extend_from_slice(reason.as_bytes());

        self.raw_attr(attributes::ERROR_CODE, &value)
    }

    /// Append MESSAGE-INTEGRITY computed with `key` (the ICE password for
    /// connectivity checks)
    pub fn message_integrity(&mut self, key: &[u8]) -> &mut Self {
        // the covered length includes the integrity attribute itself
        self.set_len((self.buffer.len() - HEADER_LENGTH + 24) as u16);

        let mut mac = Hmac::<Sha1>::new_from_slice(key).expect("hmac accepts any key length");
        mac.update(&self.buffer);
        let tag = mac.finalize().into_bytes();

        self.raw_attr(attributes::MESSAGE_INTEGRITY, &tag)
    }

    /// Append the FINGERPRINT attribute. Must be the last attribute.
    pub fn fingerprint(&mut self) -> &mut Self {
        self.set_len((self.buffer.len() - HEADER_LENGTH + 8) as u16);

        let checksum = crc32(&self.buffer) ^ 0x5354_554E;

        self.raw_attr(attributes::FINGERPRINT, &checksum.to_be_bytes())
    }

    /// Finish the message and return its bytes
    pub fn finish(&mut self) -> Vec<u8> {
        self.set_len((self.buffer.len() - HEADER_LENGTH) as u16);

        std::mem::take(&mut self.buffer)
    }

    fn raw_attr(&mut self, typ: u16, value: &[u8]) -> &mut Self {
        self.buffer.put_u16(typ);
        self.buffer.put_u16(value.len() as u16);
        self.buffer.put_slice(value);

        for _ in 0..padding(value.len()) {
            self.buffer.put_u8(0);
        }

        self
    }

    fn set_len(&mut self, len: u16) {
        self.buffer[2..4].copy_from_slice(&len.to_be_bytes());
    }
}
