use crate::i2np::I2npMessage;
use crate::identity::{IdentHash, RouterInfo};

/// The slice of the network database the transport consumes. Received
/// RouterInfo blobs are posted as I2NP messages for NetDb to parse and
/// store; lookups resolve identity hashes to known routers.
pub trait NetDb: Send + Sync {
	fn find_router(&self, ident: &IdentHash) -> Option<RouterInfo>;
	fn post_i2np_msg(&self, msg: I2npMessage);
	fn set_unreachable(&self, ident: &IdentHash, unreachable: bool);
}
