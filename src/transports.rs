use crate::crypto::X25519Keys;
use crate::i2np::I2npMessage;
use crate::identity::IdentHash;

/// Callbacks into the transport manager owning this NTCP2 instance.
///
/// The manager keeps a pool of pre-generated X25519 keypairs so ephemeral
/// generation stays off the handshake path; the default implementation
/// generates on demand.
pub trait Transports: Send + Sync {
	fn next_x25519_keys(&self) -> X25519Keys {
		X25519Keys::generate()
	}

	fn peer_connected(&self, ident: &IdentHash);

	/// Every terminal session failure surfaces here, whatever its cause.
	fn peer_disconnected(&self, ident: &IdentHash);
}

/// Consumer of reassembled inbound I2NP messages. `flush` is called once
/// per frame after all its blocks have been delivered.
pub trait I2npHandler: Send + Sync {
	fn put_next_message(&self, msg: I2npMessage);

	fn flush(&self) {}
}
