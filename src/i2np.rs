//! I2NP messages as they cross the NTCP2 boundary.
//!
//! The standard I2NP header is 16 bytes: type, message id, an 8-byte
//! millisecond expiration, payload length and a checksum. On NTCP2 the
//! header shrinks to 9 bytes (type, message id, 4-byte second expiration);
//! the block header already carries the length and the AEAD replaces the
//! checksum. `to_ntcp2`/`from_ntcp2` convert between the two forms.

use crate::crypto::sha256;
use crate::error::Error;

pub const I2NP_HEADER_SIZE: usize = 16;
pub const I2NP_NTCP2_HEADER_SIZE: usize = 9;
pub const I2NP_MAX_MESSAGE_SIZE: usize = 62708;

/// Default lifetime of a freshly created message, milliseconds.
pub const I2NP_MESSAGE_EXPIRATION_TIMEOUT: u64 = 8000;

pub const I2NP_DUMMY_MSG: u8 = 0;

/// An I2NP message held in its standard 16-byte-header form.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct I2npMessage {
	buf: Vec<u8>,
}

impl I2npMessage {
	pub fn new(msg_type: u8, msg_id: u32, expiration_ms: u64, payload: &[u8]) -> I2npMessage {
		let mut buf = Vec::with_capacity(I2NP_HEADER_SIZE + payload.len());
		buf.push(msg_type);
		buf.extend_from_slice(&msg_id.to_be_bytes());
		buf.extend_from_slice(&expiration_ms.to_be_bytes());
		buf.extend_from_slice(&(payload.len() as u16).to_be_bytes());
		buf.push(sha256(payload)[0]);
		buf.extend_from_slice(payload);
		I2npMessage { buf }
	}

	/// Wraps an opaque payload (e.g. a received RouterInfo block body) for
	/// handing to NetDb.
	pub fn dummy(payload: &[u8]) -> I2npMessage {
		I2npMessage::new(
			I2NP_DUMMY_MSG,
			0,
			crate::utils::milliseconds_since_epoch() + I2NP_MESSAGE_EXPIRATION_TIMEOUT,
			payload,
		)
	}

	pub fn msg_type(&self) -> u8 {
		self.buf[0]
	}

	pub fn msg_id(&self) -> u32 {
		u32::from_be_bytes([self.buf[1], self.buf[2], self.buf[3], self.buf[4]])
	}

	pub fn expiration_ms(&self) -> u64 {
		let mut bytes = [0u8; 8];
		bytes.copy_from_slice(&self.buf[5..13]);
		u64::from_be_bytes(bytes)
	}

	pub fn payload(&self) -> &[u8] {
		&self.buf[I2NP_HEADER_SIZE..]
	}

	pub fn len(&self) -> usize {
		self.buf.len()
	}

	pub fn is_empty(&self) -> bool {
		self.buf.len() <= I2NP_HEADER_SIZE
	}

	/// Length of the NTCP2 representation: the 7-byte header shrink applied.
	pub fn ntcp2_length(&self) -> usize {
		self.buf.len() - (I2NP_HEADER_SIZE - I2NP_NTCP2_HEADER_SIZE)
	}

	/// The message as carried inside an I2NPMessage block: 9-byte short
	/// header followed by the payload.
	pub fn to_ntcp2(&self) -> Vec<u8> {
		let mut out = Vec::with_capacity(self.ntcp2_length());
		out.push(self.msg_type());
		out.extend_from_slice(&self.buf[1..5]);
		out.extend_from_slice(&((self.expiration_ms() / 1000) as u32).to_be_bytes());
		out.extend_from_slice(self.payload());
		out
	}

	/// Rebuilds the standard form from a received block body.
	pub fn from_ntcp2(data: &[u8]) -> Result<I2npMessage, Error> {
		if data.len() < I2NP_NTCP2_HEADER_SIZE {
			return Err(Error::BlockParsing);
		}
		let msg_type = data[0];
		let msg_id = u32::from_be_bytes([data[1], data[2], data[3], data[4]]);
		let expiration =
			u32::from_be_bytes([data[5], data[6], data[7], data[8]]) as u64 * 1000;
		Ok(I2npMessage::new(msg_type, msg_id, expiration, &data[I2NP_NTCP2_HEADER_SIZE..]))
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn ntcp2_round_trip() {
		let msg = I2npMessage::new(18, 0xDEADBEEF, 1_700_000_000_000, b"tunnel gateway data");
		let wire = msg.to_ntcp2();
		assert_eq!(wire.len(), msg.ntcp2_length());
		assert_eq!(wire[0], 18);

		let back = I2npMessage::from_ntcp2(&wire).unwrap();
		assert_eq!(back.msg_type(), 18);
		assert_eq!(back.msg_id(), 0xDEADBEEF);
		assert_eq!(back.expiration_ms(), 1_700_000_000_000);
		assert_eq!(back.payload(), b"tunnel gateway data");
	}

	#[test]
	fn checksum_covers_the_payload() {
		let a = I2npMessage::new(1, 1, 0, b"aaaa");
		let b = I2npMessage::new(1, 1, 0, b"aaab");
		assert_ne!(a.buf[15], b.buf[15]);
	}

	#[test]
	fn short_block_is_rejected() {
		assert!(I2npMessage::from_ntcp2(&[0u8; 8]).is_err());
	}
}
