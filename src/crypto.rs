//! Cryptographic building blocks of the NTCP2 handshake and data phase:
//! the Noise key schedule (MixHash/MixKey over SHA-256 and HKDF), the
//! AES-CBC obfuscation of ephemeral keys, the ChaCha20-Poly1305 AEAD and
//! the SipHash-derived frame length masking.

use std::hash::Hasher;

use aes::cipher::{block_padding::NoPadding, BlockDecryptMut, BlockEncryptMut, KeyIvInit};
use chacha20poly1305::aead::{Aead, KeyInit, Payload};
use chacha20poly1305::{ChaCha20Poly1305, Key, Nonce};
use hkdf::Hkdf;
use rand::rngs::OsRng;
use sha2::{Digest, Sha256};
use siphasher::sip::SipHasher24;
use x25519_dalek::{PublicKey, StaticSecret};

use crate::error::Error;

type Aes256CbcEnc = cbc::Encryptor<aes::Aes256>;
type Aes256CbcDec = cbc::Decryptor<aes::Aes256>;

pub const PROTOCOL_NAME: &str = "Noise_XKaesobfse+hs2+hs3_25519_ChaChaPoly_SHA256";

/// SHA256 (PROTOCOL_NAME)
pub const PROTOCOL_NAME_HASH: [u8; 32] = [
	0x72, 0xe8, 0x42, 0xc5, 0x45, 0xe1, 0x80, 0x80, 0xd3, 0x9c, 0x44, 0x93, 0xbb, 0x91, 0xd7,
	0xed, 0xf2, 0x28, 0x98, 0x17, 0x71, 0x21, 0x8c, 0x1f, 0x62, 0x4e, 0x20, 0x6f, 0x28, 0xd3,
	0x2f, 0x71,
];

/// SHA256 (PROTOCOL_NAME_HASH)
pub const PROTOCOL_NAME_HASH_HASH: [u8; 32] = [
	0x49, 0xff, 0x48, 0x3f, 0xc4, 0x04, 0xb9, 0xb2, 0x6b, 0x11, 0x94, 0x36, 0x72, 0xff, 0x05,
	0xb5, 0x61, 0x27, 0x03, 0x31, 0xba, 0x89, 0xb8, 0xfc, 0x33, 0x15, 0x93, 0x87, 0x57, 0xdd,
	0x3d, 0x1e,
];

pub fn sha256(data: &[u8]) -> [u8; 32] {
	let mut hasher = Sha256::new();
	hasher.update(data);
	hasher.finalize().into()
}

/// h <- SHA256(h || data)
pub fn mix_hash(h: &mut [u8; 32], data: &[u8]) {
	let mut hasher = Sha256::new();
	hasher.update(&h[..]);
	hasher.update(data);
	h.copy_from_slice(&hasher.finalize());
}

/// ck || k <- HKDF-SHA256(salt = ck, ikm, info = "", L = 64)
pub fn mix_key(ck: &mut [u8; 32], k: &mut [u8; 32], ikm: &[u8]) {
	let mut okm = [0u8; 64];
	hkdf(&ck[..], ikm, b"", &mut okm);
	ck.copy_from_slice(&okm[..32]);
	k.copy_from_slice(&okm[32..]);
}

pub fn hkdf(salt: &[u8], ikm: &[u8], info: &[u8], okm: &mut [u8]) {
	let hk = Hkdf::<Sha256>::new(Some(salt), ikm);
	hk.expand(info, okm).expect("okm length is valid for HKDF-SHA256");
}

/// 12-byte AEAD nonce: four zero bytes followed by the sequence number in
/// little-endian.
pub fn nonce(seqn: u64) -> [u8; 12] {
	let mut n = [0u8; 12];
	n[4..].copy_from_slice(&seqn.to_le_bytes());
	n
}

pub fn aead_encrypt(
	key: &[u8; 32],
	nonce_bytes: &[u8; 12],
	ad: &[u8],
	plaintext: &[u8],
) -> Vec<u8> {
	let cipher = ChaCha20Poly1305::new(Key::from_slice(key));
	cipher
		.encrypt(Nonce::from_slice(nonce_bytes), Payload { msg: plaintext, aad: ad })
		.expect("ChaCha20-Poly1305 encryption is infallible for in-memory buffers")
}

pub fn aead_decrypt(
	key: &[u8; 32],
	nonce_bytes: &[u8; 12],
	ad: &[u8],
	ciphertext: &[u8],
) -> Result<Vec<u8>, Error> {
	let cipher = ChaCha20Poly1305::new(Key::from_slice(key));
	cipher
		.decrypt(Nonce::from_slice(nonce_bytes), Payload { msg: ciphertext, aad: ad })
		.map_err(|_| Error::Aead)
}

/// An X25519 keypair. Transport managers keep a pool of these so the random
/// generation cost stays off the handshake path.
#[derive(Clone)]
pub struct X25519Keys {
	secret: StaticSecret,
	public: PublicKey,
}

impl X25519Keys {
	pub fn generate() -> X25519Keys {
		let secret = StaticSecret::random_from_rng(OsRng);
		let public = PublicKey::from(&secret);
		X25519Keys { secret, public }
	}

	pub fn from_private(bytes: [u8; 32]) -> X25519Keys {
		let secret = StaticSecret::from(bytes);
		let public = PublicKey::from(&secret);
		X25519Keys { secret, public }
	}

	pub fn public_bytes(&self) -> [u8; 32] {
		*self.public.as_bytes()
	}

	/// X25519 (private, public) -> shared [32]
	pub fn agree(&self, their_public: &[u8; 32]) -> [u8; 32] {
		let pk = PublicKey::from(*their_public);
		*self.secret.diffie_hellman(&pk).as_bytes()
	}
}

/// AES-256-CBC layer hiding the X25519 ephemerals on the wire. Keyed by the
/// responder's router identity hash; the IV starts at the published value
/// and chains across SessionRequest and SessionCreated.
pub struct AesObfuscator {
	key: [u8; 32],
	iv: [u8; 16],
}

impl AesObfuscator {
	pub fn new(key: [u8; 32], iv: [u8; 16]) -> AesObfuscator {
		AesObfuscator { key, iv }
	}

	pub fn encrypt(&mut self, plaintext: &[u8; 32]) -> [u8; 32] {
		let enc = Aes256CbcEnc::new(&self.key.into(), &self.iv.into());
		let ct = enc.encrypt_padded_vec_mut::<NoPadding>(plaintext);
		// CBC chains: the last ciphertext block is the next message's IV
		self.iv.copy_from_slice(&ct[16..32]);
		let mut out = [0u8; 32];
		out.copy_from_slice(&ct);
		out
	}

	pub fn decrypt(&mut self, ciphertext: &[u8; 32]) -> [u8; 32] {
		let dec = Aes256CbcDec::new(&self.key.into(), &self.iv.into());
		self.iv.copy_from_slice(&ciphertext[16..32]);
		let pt = dec
			.decrypt_padded_vec_mut::<NoPadding>(ciphertext)
			.expect("two full AES blocks never need unpadding");
		let mut out = [0u8; 32];
		out.copy_from_slice(&pt);
		out
	}
}

/// Keyed SipHash-2-4 chain producing a fresh 16-bit mask per frame. The IV
/// advances exactly once per frame; sender and receiver must consume their
/// chains in lockstep or the lengths can never re-synchronise.
pub struct LengthObfuscator {
	k0: u64,
	k1: u64,
	iv: u64,
}

impl LengthObfuscator {
	/// Splits one of the 32-byte `sipkeys` halves from the data-phase KDF:
	/// bytes 0..16 key the hash, bytes 16..24 seed the IV chain.
	pub fn from_sip_keys(sip_keys: &[u8; 32]) -> LengthObfuscator {
		let mut k0 = [0u8; 8];
		let mut k1 = [0u8; 8];
		let mut iv = [0u8; 8];
		k0.copy_from_slice(&sip_keys[0..8]);
		k1.copy_from_slice(&sip_keys[8..16]);
		iv.copy_from_slice(&sip_keys[16..24]);
		LengthObfuscator {
			k0: u64::from_le_bytes(k0),
			k1: u64::from_le_bytes(k1),
			iv: u64::from_le_bytes(iv),
		}
	}

	fn next_mask(&mut self) -> u16 {
		let mut hasher = SipHasher24::new_with_keys(self.k0, self.k1);
		hasher.write(&self.iv.to_le_bytes());
		self.iv = hasher.finish();
		(self.iv & 0xffff) as u16
	}

	/// Frame length as written on the wire, big-endian.
	pub fn obfuscate(&mut self, len: u16) -> [u8; 2] {
		(len ^ self.next_mask()).to_be_bytes()
	}

	pub fn deobfuscate(&mut self, wire: [u8; 2]) -> u16 {
		u16::from_be_bytes(wire) ^ self.next_mask()
	}
}

/// Symmetric material both directions of the data phase are keyed from,
/// derived once from the final chaining key and handshake hash.
pub struct DataPhaseKeys {
	pub k_ab: [u8; 32],
	pub k_ba: [u8; 32],
	pub sip_ab: [u8; 32],
	pub sip_ba: [u8; 32],
}

impl DataPhaseKeys {
	/// k_ab || k_ba = HKDF(ck, zerolen)
	/// ask_master   = HKDF(ck, zerolen, info="ask")
	/// sip_master   = HKDF(ask_master, h || "siphash")
	/// sip_ab || sip_ba = HKDF(sip_master, zerolen)
	pub fn derive(ck: &[u8; 32], h: &[u8; 32]) -> DataPhaseKeys {
		let mut k = [0u8; 64];
		hkdf(ck, b"", b"", &mut k);
		let mut keys = DataPhaseKeys {
			k_ab: [0u8; 32],
			k_ba: [0u8; 32],
			sip_ab: [0u8; 32],
			sip_ba: [0u8; 32],
		};
		keys.k_ab.copy_from_slice(&k[..32]);
		keys.k_ba.copy_from_slice(&k[32..]);

		let mut master = [0u8; 32];
		hkdf(ck, b"", b"ask", &mut master);
		let mut h_sip = [0u8; 39];
		h_sip[..32].copy_from_slice(h);
		h_sip[32..].copy_from_slice(b"siphash");
		let mut sip_master = [0u8; 32];
		hkdf(&master, &h_sip, b"", &mut sip_master);
		hkdf(&sip_master, b"", b"", &mut k);
		keys.sip_ab.copy_from_slice(&k[..32]);
		keys.sip_ba.copy_from_slice(&k[32..]);
		keys
	}
}
