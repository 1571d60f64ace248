//! The three-message Noise_XKaesobfse+hs2+hs3_25519_ChaChaPoly_SHA256
//! handshake.
//!
//! SessionRequest and SessionCreated are 64 bytes plus padding: an
//! AES-obfuscated X25519 ephemeral followed by an AEAD-sealed 16-byte
//! options block. SessionConfirmed is two AEAD frames: the initiator's
//! static key under nonce 1, then the RouterInfo payload under nonce 0 with
//! the rotated key. The AES layer is transparent to the Noise transcript:
//! MixHash always takes the unobfuscated ephemerals.
//!
//! The establisher lives only for the handshake; once both sides hold the
//! final chaining key and hash it is dissolved into the data-phase keys.

use rand::Rng;

use crate::crypto::{
	aead_decrypt, aead_encrypt, mix_hash, mix_key, nonce, sha256, AesObfuscator, DataPhaseKeys,
	X25519Keys, PROTOCOL_NAME_HASH, PROTOCOL_NAME_HASH_HASH,
};
use crate::error::Error;
use crate::identity::IdentHash;

/// Maximum tolerated difference between the peer's options timestamp and
/// the local clock, seconds.
pub const NTCP2_CLOCK_SKEW: u64 = 60;

/// SessionRequest and SessionCreated never exceed 287 bytes on the wire.
pub const NTCP2_SESSION_REQUEST_MAX_SIZE: usize = 287;

const MAX_HANDSHAKE_PADDING: u16 = (NTCP2_SESSION_REQUEST_MAX_SIZE - 64) as u16;

const OPTIONS_SIZE: usize = 16;

fn check_clock_skew(remote_ts: u32, now: u64) -> Result<(), Error> {
	let skew = now as i64 - remote_ts as i64;
	if skew.unsigned_abs() > NTCP2_CLOCK_SKEW {
		return Err(Error::ClockSkew(skew));
	}
	Ok(())
}

pub struct Establisher {
	ephemeral_keys: X25519Keys,
	obfuscator: AesObfuscator,
	ck: [u8; 32],
	h: [u8; 32],
	k: [u8; 32],
	remote_static: [u8; 32],
	remote_ephemeral: [u8; 32],
	m3p2_len: u16,
	m1_buf: Vec<u8>,
	m2_buf: Vec<u8>,
	m3_buf: Vec<u8>,
}

impl Establisher {
	fn new(ephemeral_keys: X25519Keys, aes_key: IdentHash, aes_iv: [u8; 16], rs: [u8; 32]) -> Establisher {
		// h = SHA256(SHA256(protocol name hash) || rs)
		let mut init = [0u8; 64];
		init[..32].copy_from_slice(&PROTOCOL_NAME_HASH_HASH);
		init[32..].copy_from_slice(&rs);
		Establisher {
			ephemeral_keys,
			obfuscator: AesObfuscator::new(*aes_key.as_bytes(), aes_iv),
			ck: PROTOCOL_NAME_HASH,
			h: sha256(&init),
			k: [0u8; 32],
			remote_static: rs,
			remote_ephemeral: [0u8; 32],
			m3p2_len: 0,
			m1_buf: Vec::new(),
			m2_buf: Vec::new(),
			m3_buf: Vec::new(),
		}
	}

	/// The initiator knows the responder's static key, identity hash and
	/// published IV from its RouterInfo.
	pub fn alice(
		ephemeral_keys: X25519Keys,
		remote_static: [u8; 32],
		remote_ident_hash: IdentHash,
		remote_iv: [u8; 16],
	) -> Establisher {
		Establisher::new(ephemeral_keys, remote_ident_hash, remote_iv, remote_static)
	}

	/// The responder obfuscates with its own identity hash and published IV
	/// and seeds the transcript with its own static key.
	pub fn bob(
		ephemeral_keys: X25519Keys,
		own_static_pub: [u8; 32],
		own_ident_hash: IdentHash,
		own_iv: [u8; 16],
	) -> Establisher {
		let mut e = Establisher::new(ephemeral_keys, own_ident_hash, own_iv, [0u8; 32]);
		let mut init = [0u8; 64];
		init[..32].copy_from_slice(&PROTOCOL_NAME_HASH_HASH);
		init[32..].copy_from_slice(&own_static_pub);
		e.h = sha256(&init);
		e
	}

	pub fn handshake_hash(&self) -> &[u8; 32] {
		&self.h
	}

	pub fn chaining_key(&self) -> &[u8; 32] {
		&self.ck
	}

	pub fn remote_static(&self) -> [u8; 32] {
		self.remote_static
	}

	/// Total SessionConfirmed size once message 1 has fixed `m3p2_len`.
	pub fn session_confirmed_len(&self) -> usize {
		48 + self.m3p2_len as usize
	}

	pub fn derive_data_phase_keys(&self) -> DataPhaseKeys {
		DataPhaseKeys::derive(&self.ck, &self.h)
	}

	// ---- SessionRequest -------------------------------------------------

	/// Builds message 1 and pre-stages the message 3 part 2 payload (a
	/// RouterInfo block of `router_info`), whose length the options block
	/// must announce.
	pub fn create_session_request(
		&mut self,
		router_info: &[u8],
		net_id: u8,
		ts: u32,
	) -> Result<&[u8], Error> {
		let padding_len = rand::thread_rng().gen_range(0..MAX_HANDSHAKE_PADDING) as usize;
		let mut msg = vec![0u8; 64 + padding_len];
		rand::thread_rng().fill(&mut msg[64..]);

		// X, AES-obfuscated; the IV chains into SessionCreated
		let x = self.obfuscator.encrypt(&self.ephemeral_keys.public_bytes());
		msg[..32].copy_from_slice(&x);

		mix_hash(&mut self.h, &self.ephemeral_keys.public_bytes());
		let shared = self.ephemeral_keys.agree(&self.remote_static);
		mix_key(&mut self.ck, &mut self.k, &shared);

		// RouterInfo block (flag + body) staged for SessionConfirmed part 2
		self.m3p2_len = (router_info.len() + 4 + 16) as u16;
		self.m3_buf = vec![0u8; self.session_confirmed_len()];
		self.m3_buf[48] = crate::block::BLK_ROUTER_INFO;
		self.m3_buf[49..51].copy_from_slice(&((router_info.len() + 1) as u16).to_be_bytes());
		self.m3_buf[51] = 0; // flag
		self.m3_buf[52..52 + router_info.len()].copy_from_slice(router_info);

		let mut options = [0u8; OPTIONS_SIZE];
		options[0] = net_id;
		options[1] = 2; // ver
		options[2..4].copy_from_slice(&(padding_len as u16).to_be_bytes());
		options[4..6].copy_from_slice(&self.m3p2_len.to_be_bytes());
		options[8..12].copy_from_slice(&ts.to_be_bytes());

		let sealed = aead_encrypt(&self.k, &nonce(0), &self.h, &options);
		msg[32..64].copy_from_slice(&sealed);

		self.m1_buf = msg;
		Ok(&self.m1_buf)
	}

	/// Consumes the first 64 bytes of message 1 and returns the announced
	/// padding length, which the caller must read and feed back via
	/// [`Establisher::append_session_request_padding`].
	pub fn process_session_request(
		&mut self,
		msg: &[u8; 64],
		static_keys: &X25519Keys,
		net_id: u8,
		now: u64,
	) -> Result<u16, Error> {
		let mut x_wire = [0u8; 32];
		x_wire.copy_from_slice(&msg[..32]);
		self.remote_ephemeral = self.obfuscator.decrypt(&x_wire);

		mix_hash(&mut self.h, &self.remote_ephemeral);
		let shared = static_keys.agree(&self.remote_ephemeral);
		mix_key(&mut self.ck, &mut self.k, &shared);

		let options = aead_decrypt(&self.k, &nonce(0), &self.h, &msg[32..64])?;
		if options[0] != 0 && options[0] != net_id {
			return Err(Error::NetworkIdMismatch(options[0], net_id));
		}
		if options[1] != 2 {
			return Err(Error::ProtocolVersionMismatch(options[1]));
		}
		let padding_len = u16::from_be_bytes([options[2], options[3]]);
		if padding_len > MAX_HANDSHAKE_PADDING {
			return Err(Error::PaddingTooLong(padding_len));
		}
		self.m3p2_len = u16::from_be_bytes([options[4], options[5]]);
		if self.m3p2_len < 16 {
			return Err(Error::Message3TooShort(self.m3p2_len));
		}
		let ts_a = u32::from_be_bytes([options[8], options[9], options[10], options[11]]);
		check_clock_skew(ts_a, now)?;

		self.m1_buf = msg.to_vec();
		Ok(padding_len)
	}

	pub fn append_session_request_padding(&mut self, padding: &[u8]) {
		self.m1_buf.extend_from_slice(padding);
	}

	// ---- SessionCreated -------------------------------------------------

	pub fn create_session_created(&mut self, ts: u32) -> &[u8] {
		let padding_len = rand::thread_rng().gen_range(0..MAX_HANDSHAKE_PADDING) as usize;
		let mut msg = vec![0u8; 64 + padding_len];
		rand::thread_rng().fill(&mut msg[64..]);

		// Y, keyed like X, IV carried over from SessionRequest
		let y = self.obfuscator.encrypt(&self.ephemeral_keys.public_bytes());
		msg[..32].copy_from_slice(&y);

		let bob_ephemeral = self.ephemeral_keys.public_bytes();
		self.mix_session_request(&bob_ephemeral);

		let mut options = [0u8; OPTIONS_SIZE];
		options[2..4].copy_from_slice(&(padding_len as u16).to_be_bytes());
		options[8..12].copy_from_slice(&ts.to_be_bytes());

		let sealed = aead_encrypt(&self.k, &nonce(0), &self.h, &options);
		msg[32..64].copy_from_slice(&sealed);

		self.m2_buf = msg;
		&self.m2_buf
	}

	pub fn process_session_created(&mut self, msg: &[u8; 64], now: u64) -> Result<u16, Error> {
		let mut y_wire = [0u8; 32];
		y_wire.copy_from_slice(&msg[..32]);
		self.remote_ephemeral = self.obfuscator.decrypt(&y_wire);

		let bob_ephemeral = self.remote_ephemeral;
		self.mix_session_request(&bob_ephemeral);

		let options = aead_decrypt(&self.k, &nonce(0), &self.h, &msg[32..64])?;
		let padding_len = u16::from_be_bytes([options[2], options[3]]);
		if padding_len > MAX_HANDSHAKE_PADDING {
			return Err(Error::PaddingTooLong(padding_len));
		}
		let ts_b = u32::from_be_bytes([options[8], options[9], options[10], options[11]]);
		check_clock_skew(ts_b, now)?;

		self.m2_buf = msg.to_vec();
		Ok(padding_len)
	}

	pub fn append_session_created_padding(&mut self, padding: &[u8]) {
		self.m2_buf.extend_from_slice(padding);
	}

	/// Message 1's sealed options and padding enter the transcript only
	/// here, together with Bob's ephemeral and the ee DH.
	fn mix_session_request(&mut self, bob_ephemeral: &[u8; 32]) {
		let (options_ct, padding) = {
			let buf = &self.m1_buf;
			(buf[32..64].to_vec(), buf[64..].to_vec())
		};
		mix_hash(&mut self.h, &options_ct);
		if !padding.is_empty() {
			mix_hash(&mut self.h, &padding);
		}
		mix_hash(&mut self.h, bob_ephemeral);
		let shared = self.ephemeral_keys.agree(&self.remote_ephemeral);
		mix_key(&mut self.ck, &mut self.k, &shared);
	}

	// ---- SessionConfirmed -----------------------------------------------

	fn mix_session_created(&mut self) {
		let (options_ct, padding) = {
			let buf = &self.m2_buf;
			(buf[32..64].to_vec(), buf[64..].to_vec())
		};
		mix_hash(&mut self.h, &options_ct);
		if !padding.is_empty() {
			mix_hash(&mut self.h, &padding);
		}
	}

	pub fn create_session_confirmed(&mut self, static_keys: &X25519Keys) -> &[u8] {
		self.mix_session_created();

		// part 1: own static key under nonce 1
		let part1 = aead_encrypt(&self.k, &nonce(1), &self.h, &static_keys.public_bytes());
		self.m3_buf[..48].copy_from_slice(&part1);
		let part1_ct = self.m3_buf[..48].to_vec();
		mix_hash(&mut self.h, &part1_ct);

		let shared = static_keys.agree(&self.remote_ephemeral);
		mix_key(&mut self.ck, &mut self.k, &shared);

		// part 2: the staged RouterInfo block under the rotated key
		let payload_len = self.m3p2_len as usize - 16;
		let part2 = aead_encrypt(&self.k, &nonce(0), &self.h, &self.m3_buf[48..48 + payload_len]);
		self.m3_buf[48..].copy_from_slice(&part2);
		let part2_ct = self.m3_buf[48..].to_vec();
		mix_hash(&mut self.h, &part2_ct);

		&self.m3_buf
	}

	/// Verifies both SessionConfirmed frames and returns the decrypted
	/// part 2 payload (the initiator's RouterInfo block stream).
	pub fn process_session_confirmed(&mut self, msg: &[u8]) -> Result<Vec<u8>, Error> {
		self.mix_session_created();

		let s = aead_decrypt(&self.k, &nonce(1), &self.h, &msg[..48])?;
		self.remote_static.copy_from_slice(&s);
		mix_hash(&mut self.h, &msg[..48]);

		let shared = self.ephemeral_keys.agree(&self.remote_static);
		mix_key(&mut self.ck, &mut self.k, &shared);

		let payload = aead_decrypt(&self.k, &nonce(0), &self.h, &msg[48..])?;
		mix_hash(&mut self.h, &msg[48..]);
		Ok(payload)
	}
}
