//! NTCP2 transport configuration, sourced from the router's config file or
//! environment by the embedder.

use serde::{Deserialize, Serialize};

/// Outbound connections can be tunnelled through a local proxy.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ProxyType {
	None,
	Socks5,
	Http,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Ntcp2Config {
	pub enabled: bool,
	/// Also bind the published IPv6 address, when one exists.
	pub address_v6: bool,
	pub proxy: ProxyType,
	pub proxy_address: Option<String>,
	pub proxy_port: u16,
	/// Seconds a handshake may take before the session is dropped.
	pub establish_timeout: u64,
	/// Seconds of data-phase inactivity before an idle termination.
	pub termination_timeout: u64,
	/// Seconds between sweeps of idle and stuck sessions.
	pub termination_check_timeout: u64,
	/// Base connect timeout in seconds; dialing waits five times this.
	pub connect_timeout: u64,
}

impl Default for Ntcp2Config {
	fn default() -> Ntcp2Config {
		Ntcp2Config {
			enabled: true,
			address_v6: false,
			proxy: ProxyType::None,
			proxy_address: None,
			proxy_port: 0,
			establish_timeout: crate::server::NTCP2_ESTABLISH_TIMEOUT,
			termination_timeout: crate::server::NTCP2_TERMINATION_TIMEOUT,
			termination_check_timeout: crate::server::NTCP2_TERMINATION_CHECK_TIMEOUT,
			connect_timeout: crate::server::NTCP2_CONNECT_TIMEOUT,
		}
	}
}
