//! The local router's view of itself: identity, NTCP2 static keys, the
//! published IV and the signed RouterInfo other routers receive.

use std::net::IpAddr;
use std::sync::Mutex;

use ed25519_dalek::SigningKey;

use crate::crypto::X25519Keys;
use crate::identity::{IdentHash, Ntcp2Address, RouterIdentity, RouterInfo, RouterInfoBuilder};

pub struct RouterContext {
	identity: RouterIdentity,
	static_keys: X25519Keys,
	iv: [u8; 16],
	net_id: u8,
	router_info: Mutex<RouterInfo>,
}

impl RouterContext {
	pub fn new(
		router_info: RouterInfo,
		static_keys: X25519Keys,
		iv: [u8; 16],
		net_id: u8,
	) -> RouterContext {
		RouterContext {
			identity: router_info.identity().clone(),
			static_keys,
			iv,
			net_id,
			router_info: Mutex::new(router_info),
		}
	}

	/// Creates a fresh router: new signing and static keys, a random IV and
	/// a RouterInfo publishing the given NTCP2 endpoint.
	pub fn generate(host: Option<IpAddr>, port: u16, net_id: u8) -> RouterContext {
		let signing_key = SigningKey::from_bytes(&rand::random::<[u8; 32]>());
		let static_keys = X25519Keys::generate();
		let iv = rand::random::<[u8; 16]>();
		let router_info = RouterInfoBuilder::new(signing_key)
			.ntcp2(Ntcp2Address {
				host,
				port,
				static_key: static_keys.public_bytes(),
				iv: Some(iv),
			})
			.build();
		RouterContext::new(router_info, static_keys, iv, net_id)
	}

	pub fn ident_hash(&self) -> &IdentHash {
		self.identity.hash()
	}

	pub fn identity(&self) -> &RouterIdentity {
		&self.identity
	}

	pub fn static_keys(&self) -> &X25519Keys {
		&self.static_keys
	}

	pub fn static_public(&self) -> [u8; 32] {
		self.static_keys.public_bytes()
	}

	pub fn iv(&self) -> [u8; 16] {
		self.iv
	}

	pub fn net_id(&self) -> u8 {
		self.net_id
	}

	pub fn router_info(&self) -> RouterInfo {
		self.router_info.lock().expect("router info lock").clone()
	}

	pub fn router_info_buffer(&self) -> Vec<u8> {
		self.router_info.lock().expect("router info lock").buffer().to_vec()
	}

	/// Swaps in a republished descriptor. The caller is responsible for
	/// pushing it to established sessions.
	pub fn update_router_info(&self, router_info: RouterInfo) {
		*self.router_info.lock().expect("router info lock") = router_info;
	}
}

#[cfg(test)]
mod tests {
	use super::*;
	use std::net::Ipv4Addr;

	#[test]
	fn generated_context_publishes_its_static_key() {
		let ctx = RouterContext::generate(
			Some(IpAddr::V4(Ipv4Addr::LOCALHOST)),
			12345,
			2,
		);
		let ri = ctx.router_info();
		assert!(!ri.is_unreachable());
		let addr = ri.ntcp2_address(true).unwrap();
		assert_eq!(addr.static_key, ctx.static_public());
		assert_eq!(addr.iv, Some(ctx.iv()));
		assert_eq!(ri.ident_hash(), ctx.ident_hash());
	}
}
