//! Router identities and the signed RouterInfo descriptor.
//!
//! A router identity is the 391-byte keys-and-certificate structure (256-byte
//! crypto key field, 128-byte signing key field with the Ed25519 key
//! right-justified, 7-byte key certificate); its SHA-256 is the identity
//! hash every session and NetDb entry is keyed by. A RouterInfo wraps the
//! identity with a publish timestamp, the address list and an Ed25519
//! signature over everything that precedes it.

use std::fmt;
use std::net::IpAddr;

use data_encoding::{Encoding, Specification};
use ed25519_dalek::{Signature, Signer, SigningKey, Verifier, VerifyingKey};
use lazy_static::lazy_static;
use serde::{Deserialize, Serialize};

use crate::crypto::sha256;
use crate::error::Error;

pub const B32_EXT: &str = ".b32.i2p";

lazy_static! {
	pub static ref BASE32_I2P: Encoding = {
		let mut spec = Specification::new();

		spec.symbols.push_str("abcdefghijklmnopqrstuvwxyz234567");
		spec.padding = None;
		spec.encoding().unwrap()
	};
}

lazy_static! {
	pub static ref BASE64_I2P: Encoding = {
		let mut spec = Specification::new();
		spec.symbols
			.push_str("ABCDEFGHIJKLMNOPQRSTUVWXYZabcdefghijklmnopqrstuvwxyz0123456789-~");
		spec.padding = Some('=');
		spec.encoding().unwrap()
	};
}

pub const ROUTER_IDENTITY_SIZE: usize = 391;
pub const SIGNATURE_SIZE: usize = 64;

/// RouterInfos published longer ago than this are refused during session
/// establishment (90 minutes).
pub const NETDB_MIN_EXPIRATION_TIMEOUT: u64 = 90 * 60;

const CERT_TYPE_KEY: u8 = 5;
const SIG_TYPE_ED25519: u16 = 7;

const SIGNING_KEY_OFFSET: usize = 256 + 128 - 32;
const CERT_OFFSET: usize = 256 + 128;

/// SHA-256 of a router identity buffer. The canonical key for session maps
/// and NetDb lookups.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct IdentHash([u8; 32]);

impl IdentHash {
	pub fn new(bytes: [u8; 32]) -> IdentHash {
		IdentHash(bytes)
	}

	pub fn as_bytes(&self) -> &[u8; 32] {
		&self.0
	}

	pub fn to_base64(&self) -> String {
		BASE64_I2P.encode(&self.0)
	}

	/// The familiar `<b32>.b32.i2p` rendering used in logs and consoles.
	pub fn to_base32(&self) -> String {
		let mut b32 = BASE32_I2P.encode(&self.0);
		b32.push_str(B32_EXT);
		b32
	}
}

impl fmt::Display for IdentHash {
	fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
		write!(f, "{}", self.to_base32())
	}
}

impl fmt::Debug for IdentHash {
	fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
		write!(f, "IdentHash({})", hex::encode(self.0))
	}
}

impl From<[u8; 32]> for IdentHash {
	fn from(bytes: [u8; 32]) -> IdentHash {
		IdentHash(bytes)
	}
}

/// The keys-and-certificate structure identifying a router.
#[derive(Clone)]
pub struct RouterIdentity {
	buffer: Vec<u8>,
	hash: IdentHash,
}

impl RouterIdentity {
	pub fn from_buffer(buf: &[u8]) -> Result<RouterIdentity, Error> {
		if buf.len() < ROUTER_IDENTITY_SIZE {
			return Err(Error::MalformedRouterInfo(format!(
				"identity truncated at {} bytes",
				buf.len()
			)));
		}
		let cert = &buf[CERT_OFFSET..ROUTER_IDENTITY_SIZE];
		if cert[0] != CERT_TYPE_KEY {
			return Err(Error::MalformedRouterInfo(format!(
				"unsupported certificate type {}",
				cert[0]
			)));
		}
		let cert_len = u16::from_be_bytes([cert[1], cert[2]]);
		if cert_len != 4 {
			return Err(Error::MalformedRouterInfo(format!(
				"unsupported certificate length {}",
				cert_len
			)));
		}
		let sig_type = u16::from_be_bytes([cert[3], cert[4]]);
		if sig_type != SIG_TYPE_ED25519 {
			return Err(Error::MalformedRouterInfo(format!(
				"unsupported signature type {}",
				sig_type
			)));
		}
		let buffer = buf[..ROUTER_IDENTITY_SIZE].to_vec();
		let hash = IdentHash(sha256(&buffer));
		Ok(RouterIdentity { buffer, hash })
	}

	pub fn hash(&self) -> &IdentHash {
		&self.hash
	}

	pub fn buffer(&self) -> &[u8] {
		&self.buffer
	}

	/// Ed25519 verifying key, right-justified in the 128-byte signing field.
	pub fn signing_key(&self) -> [u8; 32] {
		let mut key = [0u8; 32];
		key.copy_from_slice(&self.buffer[SIGNING_KEY_OFFSET..SIGNING_KEY_OFFSET + 32]);
		key
	}

	fn verify(&self, message: &[u8], signature: &[u8]) -> bool {
		let key = match VerifyingKey::from_bytes(&self.signing_key()) {
			Ok(key) => key,
			Err(_) => return false,
		};
		let mut sig = [0u8; SIGNATURE_SIZE];
		sig.copy_from_slice(signature);
		key.verify(message, &Signature::from_bytes(&sig)).is_ok()
	}
}

impl fmt::Debug for RouterIdentity {
	fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
		write!(f, "RouterIdentity({})", self.hash)
	}
}

/// The NTCP2 endpoint a router publishes: where to dial it and the static
/// key and IV needed to start a handshake with it.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Ntcp2Address {
	pub host: Option<IpAddr>,
	pub port: u16,
	pub static_key: [u8; 32],
	pub iv: Option<[u8; 16]>,
}

impl Ntcp2Address {
	/// Published addresses are dialable: they carry host, port and the
	/// handshake IV. Unpublished ones only advertise the static key.
	pub fn is_published(&self) -> bool {
		self.host.is_some() && self.port != 0 && self.iv.is_some()
	}
}

/// A parsed, signature-checked RouterInfo. The raw buffer is retained so it
/// can be forwarded to NetDb or republished byte-for-byte.
#[derive(Clone)]
pub struct RouterInfo {
	buffer: Vec<u8>,
	identity: RouterIdentity,
	timestamp: u64,
	addresses: Vec<Ntcp2Address>,
	signature_valid: bool,
}

struct Reader<'a> {
	buf: &'a [u8],
	pos: usize,
}

impl<'a> Reader<'a> {
	fn take(&mut self, n: usize) -> Result<&'a [u8], Error> {
		if self.pos + n > self.buf.len() {
			return Err(Error::MalformedRouterInfo(format!(
				"truncated at offset {}",
				self.pos
			)));
		}
		let out = &self.buf[self.pos..self.pos + n];
		self.pos += n;
		Ok(out)
	}

	fn u8(&mut self) -> Result<u8, Error> {
		Ok(self.take(1)?[0])
	}

	fn u16(&mut self) -> Result<u16, Error> {
		let b = self.take(2)?;
		Ok(u16::from_be_bytes([b[0], b[1]]))
	}

	fn u64(&mut self) -> Result<u64, Error> {
		let b = self.take(8)?;
		let mut bytes = [0u8; 8];
		bytes.copy_from_slice(b);
		Ok(u64::from_be_bytes(bytes))
	}

	fn string(&mut self) -> Result<String, Error> {
		let len = self.u8()? as usize;
		let b = self.take(len)?;
		String::from_utf8(b.to_vec())
			.map_err(|_| Error::MalformedRouterInfo("non-utf8 string".to_string()))
	}
}

fn parse_mapping(data: &[u8]) -> Result<Vec<(String, String)>, Error> {
	let mut r = Reader { buf: data, pos: 0 };
	let mut pairs = Vec::new();
	while r.pos < data.len() {
		let key = r.string()?;
		if r.u8()? != b'=' {
			return Err(Error::MalformedRouterInfo("mapping missing '='".to_string()));
		}
		let val = r.string()?;
		if r.u8()? != b';' {
			return Err(Error::MalformedRouterInfo("mapping missing ';'".to_string()));
		}
		pairs.push((key, val));
	}
	Ok(pairs)
}

fn write_string(out: &mut Vec<u8>, s: &str) {
	out.push(s.len() as u8);
	out.extend_from_slice(s.as_bytes());
}

fn write_mapping(out: &mut Vec<u8>, pairs: &mut Vec<(String, String)>) {
	// mappings are signed, so keys go out in canonical sorted order
	pairs.sort();
	let mut body = Vec::new();
	for (key, val) in pairs.iter() {
		write_string(&mut body, key);
		body.push(b'=');
		write_string(&mut body, val);
		body.push(b';');
	}
	out.extend_from_slice(&(body.len() as u16).to_be_bytes());
	out.extend_from_slice(&body);
}

fn decode_fixed<const N: usize>(val: &str) -> Option<[u8; N]> {
	let bytes = BASE64_I2P.decode(val.as_bytes()).ok()?;
	if bytes.len() != N {
		return None;
	}
	let mut out = [0u8; N];
	out.copy_from_slice(&bytes);
	Some(out)
}

impl RouterInfo {
	pub fn from_buffer(buf: &[u8]) -> Result<RouterInfo, Error> {
		let identity = RouterIdentity::from_buffer(buf)?;
		let mut r = Reader { buf, pos: ROUTER_IDENTITY_SIZE };
		let timestamp = r.u64()?;
		let num_addresses = r.u8()?;
		let mut addresses = Vec::new();
		for _ in 0..num_addresses {
			let _cost = r.u8()?;
			let _expiration = r.u64()?;
			let style = r.string()?;
			let options_len = r.u16()? as usize;
			let options = parse_mapping(r.take(options_len)?)?;
			if style != "NTCP2" {
				continue;
			}
			let mut host = None;
			let mut port = 0u16;
			let mut static_key = None;
			let mut iv = None;
			for (key, val) in &options {
				match key.as_str() {
					"host" => host = val.parse::<IpAddr>().ok(),
					"port" => port = val.parse::<u16>().unwrap_or(0),
					"s" => static_key = decode_fixed::<32>(val),
					"i" => iv = decode_fixed::<16>(val),
					_ => {}
				}
			}
			let static_key = match static_key {
				Some(key) => key,
				None => {
					return Err(Error::MalformedRouterInfo(
						"NTCP2 address without static key".to_string(),
					))
				}
			};
			addresses.push(Ntcp2Address { host, port, static_key, iv });
		}
		let num_peers = r.u8()?;
		for _ in 0..num_peers {
			r.take(32)?;
		}
		let options_len = r.u16()? as usize;
		r.take(options_len)?;
		let signed_len = r.pos;
		let signature = r.take(SIGNATURE_SIZE)?;
		let signature_valid = identity.verify(&buf[..signed_len], signature);

		Ok(RouterInfo {
			buffer: buf[..signed_len + SIGNATURE_SIZE].to_vec(),
			identity,
			timestamp,
			addresses,
			signature_valid,
		})
	}

	pub fn identity(&self) -> &RouterIdentity {
		&self.identity
	}

	pub fn ident_hash(&self) -> &IdentHash {
		self.identity.hash()
	}

	/// Publish timestamp, milliseconds since the epoch.
	pub fn timestamp(&self) -> u64 {
		self.timestamp
	}

	pub fn buffer(&self) -> &[u8] {
		&self.buffer
	}

	/// A failed signature check marks the descriptor unusable.
	pub fn is_unreachable(&self) -> bool {
		!self.signature_valid
	}

	pub fn ntcp2_address(&self, published_only: bool) -> Option<&Ntcp2Address> {
		self.addresses
			.iter()
			.find(|addr| !published_only || addr.is_published())
	}

	pub fn ntcp2_addresses(&self) -> &[Ntcp2Address] {
		&self.addresses
	}
}

impl fmt::Debug for RouterInfo {
	fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
		f.debug_struct("RouterInfo")
			.field("ident", self.ident_hash())
			.field("timestamp", &self.timestamp)
			.field("addresses", &self.addresses)
			.field("signature_valid", &self.signature_valid)
			.finish()
	}
}

/// Assembles and signs a RouterInfo. Used for the local descriptor sent in
/// SessionConfirmed and in spontaneous RouterInfo pushes.
pub struct RouterInfoBuilder {
	signing_key: SigningKey,
	timestamp: u64,
	addresses: Vec<Ntcp2Address>,
}

impl RouterInfoBuilder {
	pub fn new(signing_key: SigningKey) -> RouterInfoBuilder {
		RouterInfoBuilder {
			signing_key,
			timestamp: crate::utils::milliseconds_since_epoch(),
			addresses: Vec::new(),
		}
	}

	pub fn timestamp(mut self, millis: u64) -> RouterInfoBuilder {
		self.timestamp = millis;
		self
	}

	pub fn ntcp2(mut self, address: Ntcp2Address) -> RouterInfoBuilder {
		self.addresses.push(address);
		self
	}

	pub fn build(self) -> RouterInfo {
		let mut identity = vec![0u8; ROUTER_IDENTITY_SIZE];
		rand::Rng::fill(&mut rand::thread_rng(), &mut identity[..CERT_OFFSET]);
		identity[SIGNING_KEY_OFFSET..SIGNING_KEY_OFFSET + 32]
			.copy_from_slice(self.signing_key.verifying_key().as_bytes());
		identity[CERT_OFFSET] = CERT_TYPE_KEY;
		identity[CERT_OFFSET + 1..CERT_OFFSET + 3].copy_from_slice(&4u16.to_be_bytes());
		identity[CERT_OFFSET + 3..CERT_OFFSET + 5]
			.copy_from_slice(&SIG_TYPE_ED25519.to_be_bytes());
		identity[CERT_OFFSET + 5..CERT_OFFSET + 7].copy_from_slice(&0u16.to_be_bytes());

		let mut buf = identity;
		buf.extend_from_slice(&self.timestamp.to_be_bytes());
		buf.push(self.addresses.len() as u8);
		for addr in &self.addresses {
			buf.push(10); // cost
			buf.extend_from_slice(&0u64.to_be_bytes()); // expiration, always zero
			write_string(&mut buf, "NTCP2");
			let mut options = vec![
				("s".to_string(), BASE64_I2P.encode(&addr.static_key)),
				("v".to_string(), "2".to_string()),
			];
			if let Some(host) = addr.host {
				options.push(("host".to_string(), host.to_string()));
			}
			if addr.port != 0 {
				options.push(("port".to_string(), addr.port.to_string()));
			}
			if let Some(iv) = addr.iv {
				options.push(("i".to_string(), BASE64_I2P.encode(&iv)));
			}
			write_mapping(&mut buf, &mut options);
		}
		buf.push(0); // no peers
		let mut options = vec![("netId".to_string(), "2".to_string())];
		write_mapping(&mut buf, &mut options);

		let signature = self.signing_key.sign(&buf);
		buf.extend_from_slice(&signature.to_bytes());

		RouterInfo::from_buffer(&buf).expect("freshly built RouterInfo parses")
	}
}

#[cfg(test)]
mod tests {
	use super::*;
	use std::net::Ipv4Addr;

	fn test_address() -> Ntcp2Address {
		Ntcp2Address {
			host: Some(IpAddr::V4(Ipv4Addr::new(127, 0, 0, 1))),
			port: 9001,
			static_key: [0xAB; 32],
			iv: Some([0xCD; 16]),
		}
	}

	fn build_router_info() -> RouterInfo {
		let signing_key = SigningKey::from_bytes(&[7u8; 32]);
		RouterInfoBuilder::new(signing_key)
			.timestamp(1_700_000_000_000)
			.ntcp2(test_address())
			.build()
	}

	#[test]
	fn build_then_parse_round_trip() {
		let ri = build_router_info();
		let parsed = RouterInfo::from_buffer(ri.buffer()).unwrap();
		assert!(!parsed.is_unreachable());
		assert_eq!(parsed.timestamp(), 1_700_000_000_000);
		assert_eq!(parsed.ident_hash(), ri.ident_hash());
		let addr = parsed.ntcp2_address(true).unwrap();
		assert_eq!(addr, &test_address());
	}

	#[test]
	fn corrupted_signature_is_unreachable() {
		let ri = build_router_info();
		let mut buf = ri.buffer().to_vec();
		let last = buf.len() - 1;
		buf[last] ^= 0x01;
		let parsed = RouterInfo::from_buffer(&buf).unwrap();
		assert!(parsed.is_unreachable());
	}

	#[test]
	fn tampered_static_key_breaks_the_signature() {
		let ri = build_router_info();
		let mut buf = ri.buffer().to_vec();
		// flip a byte inside the signed body
		buf[ROUTER_IDENTITY_SIZE + 20] ^= 0xFF;
		let parsed = RouterInfo::from_buffer(&buf).unwrap();
		assert!(parsed.is_unreachable());
	}

	#[test]
	fn unpublished_address_is_not_dialable() {
		let signing_key = SigningKey::from_bytes(&[8u8; 32]);
		let ri = RouterInfoBuilder::new(signing_key)
			.ntcp2(Ntcp2Address {
				host: None,
				port: 0,
				static_key: [1; 32],
				iv: None,
			})
			.build();
		assert!(ri.ntcp2_address(true).is_none());
		assert!(ri.ntcp2_address(false).is_some());
	}

	#[test]
	fn truncated_identity_is_rejected() {
		assert!(RouterIdentity::from_buffer(&[0u8; 100]).is_err());
	}

	#[test]
	fn ident_hash_renders_as_b32() {
		let hash = IdentHash::new([0u8; 32]);
		let b32 = hash.to_base32();
		assert!(b32.ends_with(B32_EXT));
		assert_eq!(b32.len(), 52 + B32_EXT.len());
	}
}
