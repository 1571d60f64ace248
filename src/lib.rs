//! NTCP2, the TCP transport of the I2P overlay: a mutually authenticated,
//! forward-secret, length-hidden I2NP message stream between two routers.
//!
//! The handshake is the Noise_XK variant
//! `Noise_XKaesobfse+hs2+hs3_25519_ChaChaPoly_SHA256`: three messages with
//! AES-obfuscated X25519 ephemerals, after which both sides hold symmetric
//! ChaCha20-Poly1305 keys and SipHash length-masking chains. Frames carry a
//! typed block stream (I2NP messages, RouterInfo gossip, padding,
//! termination).
//!
//! [`Ntcp2Server`] owns the acceptors, the dialer and the session table;
//! the embedding router supplies its [`RouterContext`] plus [`NetDb`],
//! [`Transports`] and [`I2npHandler`] implementations.

pub use crate::config::{Ntcp2Config, ProxyType};
pub use crate::context::RouterContext;
pub use crate::crypto::X25519Keys;
pub use crate::error::{Error, TerminationReason};
pub use crate::i2np::I2npMessage;
pub use crate::identity::{IdentHash, Ntcp2Address, RouterIdentity, RouterInfo, RouterInfoBuilder};
pub use crate::netdb::NetDb;
pub use crate::server::Ntcp2Server;
pub use crate::session::{Ntcp2Session, SessionState};
pub use crate::transports::{I2npHandler, Transports};

pub mod block;
pub mod config;
pub mod context;
pub mod crypto;
pub mod error;
pub mod establisher;
pub mod i2np;
pub mod identity;
pub mod netdb;
pub mod proxy;
pub mod server;
pub mod session;
pub mod transports;
mod utils;
