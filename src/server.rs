//! The NTCP2 server: TCP acceptors on the published addresses, the outbound
//! dialer (directly or through a local proxy), the session table and the
//! periodic sweep of idle and stuck sessions.

use std::io;
use std::net::{IpAddr, SocketAddr, TcpListener, TcpStream, ToSocketAddrs};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::Duration;

use anyhow::Context as AnyhowContext;
use dashmap::DashMap;
use log::{debug, error, info, warn};

use crate::config::{Ntcp2Config, ProxyType};
use crate::context::RouterContext;
use crate::error::{Error, TerminationReason};
use crate::identity::{IdentHash, RouterInfo};
use crate::netdb::NetDb;
use crate::proxy;
use crate::session::Ntcp2Session;
use crate::transports::{I2npHandler, Transports};
use crate::utils::seconds_since_epoch;

/// Base TCP connect timeout, seconds; dialing allows five times this.
pub const NTCP2_CONNECT_TIMEOUT: u64 = 10;
/// Seconds a handshake may take end to end.
pub const NTCP2_ESTABLISH_TIMEOUT: u64 = 10;
/// Data-phase idle limit, seconds.
pub const NTCP2_TERMINATION_TIMEOUT: u64 = 600;
/// Sweep period, seconds.
pub const NTCP2_TERMINATION_CHECK_TIMEOUT: u64 = 30;

pub struct Ntcp2Server {
	inner: Arc<ServerInner>,
}

pub(crate) struct ServerInner {
	config: Ntcp2Config,
	context: Arc<RouterContext>,
	netdb: Arc<dyn NetDb>,
	transports: Arc<dyn Transports>,
	i2np: Arc<dyn I2npHandler>,
	sessions: DashMap<IdentHash, Arc<Ntcp2Session>>,
	pending_incoming: Mutex<Vec<Arc<Ntcp2Session>>>,
	listeners: Mutex<Vec<SocketAddr>>,
	running: AtomicBool,
}

enum DialError {
	Timeout(io::Error),
	Proxy(Error),
	Io(io::Error),
}

fn classify_io(e: io::Error) -> DialError {
	match e.kind() {
		io::ErrorKind::TimedOut | io::ErrorKind::WouldBlock => DialError::Timeout(e),
		_ => DialError::Io(e),
	}
}

impl ServerInner {
	pub(crate) fn config(&self) -> &Ntcp2Config {
		&self.config
	}

	pub(crate) fn context(&self) -> &RouterContext {
		&self.context
	}

	pub(crate) fn netdb(&self) -> &dyn NetDb {
		self.netdb.as_ref()
	}

	pub(crate) fn transports(&self) -> &dyn Transports {
		self.transports.as_ref()
	}

	pub(crate) fn i2np_handler(&self) -> &dyn I2npHandler {
		self.i2np.as_ref()
	}

	/// Registers a session under its remote identity hash. An existing
	/// entry gives way to an incoming replacement, but two outgoing
	/// sessions to the same router never coexist: the new one is refused.
	pub(crate) fn add_session(&self, session: &Arc<Ntcp2Session>, incoming: bool) -> bool {
		if incoming {
			let mut pending = self.pending_incoming.lock().unwrap();
			pending.retain(|s| !Arc::ptr_eq(s, session));
		}
		let ident = match session.remote_ident_hash() {
			Some(ident) => ident,
			None => return false,
		};
		let existing = self.sessions.get(&ident).map(|entry| entry.value().clone());
		if let Some(existing) = existing {
			warn!("NTCP2: session to {} already exists", ident.to_base64());
			if incoming || !existing.is_outgoing() {
				existing.terminate();
			} else {
				return false;
			}
		}
		self.sessions.insert(ident, session.clone());
		true
	}

	pub(crate) fn remove_session(&self, session: &Arc<Ntcp2Session>) {
		if let Some(ident) = session.remote_ident_hash() {
			self.sessions.remove_if(&ident, |_, s| Arc::ptr_eq(s, session));
		}
	}

	fn open_stream(
		&self,
		host: IpAddr,
		port: u16,
		timeout: Duration,
	) -> Result<TcpStream, DialError> {
		match self.config.proxy {
			ProxyType::None => {
				TcpStream::connect_timeout(&SocketAddr::new(host, port), timeout)
					.map_err(classify_io)
			}
			proxy_type => {
				let target = format!(
					"{}:{}",
					self.config.proxy_address.clone().unwrap_or_default(),
					self.config.proxy_port
				);
				let proxy_addr = target
					.to_socket_addrs()
					.ok()
					.and_then(|mut addrs| addrs.next())
					.ok_or_else(|| {
						DialError::Proxy(Error::Proxy(format!(
							"failed to resolve proxy {}",
							target
						)))
					})?;
				let mut stream = TcpStream::connect_timeout(&proxy_addr, timeout)
					.map_err(classify_io)?;
				let result = match proxy_type {
					ProxyType::Socks5 => proxy::socks5_connect(&mut stream, host, port),
					ProxyType::Http => proxy::http_connect(&mut stream, host, port),
					ProxyType::None => Ok(()),
				};
				result.map_err(DialError::Proxy)?;
				Ok(stream)
			}
		}
	}

	fn dial(&self, session: Arc<Ntcp2Session>, host: IpAddr, port: u16) {
		let timeout = Duration::from_secs(self.config.connect_timeout * 5);
		match self.open_stream(host, port, timeout) {
			Ok(stream) => {
				debug!("NTCP2: connected to {}:{}", host, port);
				session.run_outgoing(stream);
			}
			Err(DialError::Timeout(e)) => {
				info!("NTCP2: not connected in {} seconds: {}", timeout.as_secs(), e);
				self.mark_unreachable(&session);
				session.terminate();
			}
			Err(DialError::Proxy(e)) => {
				warn!("NTCP2: {}", e);
				self.mark_unreachable(&session);
				session.terminate();
			}
			Err(DialError::Io(e)) => {
				info!("NTCP2: connect error: {}", e);
				session.terminate();
			}
		}
	}

	fn mark_unreachable(&self, session: &Arc<Ntcp2Session>) {
		if let Some(ident) = session.remote_ident_hash() {
			self.netdb.set_unreachable(&ident, true);
		}
	}

	fn sweep(&self) {
		let ts = seconds_since_epoch();
		let expired: Vec<_> = self
			.sessions
			.iter()
			.filter(|entry| entry.value().is_termination_timeout_expired(ts))
			.map(|entry| entry.value().clone())
			.collect();
		for session in expired {
			debug!(
				"NTCP2: no activity for {} seconds",
				session.termination_timeout()
			);
			session.send_termination_and_terminate(TerminationReason::IdleTimeout);
		}
		let dropped: Vec<_> = {
			let mut pending = self.pending_incoming.lock().unwrap();
			let mut keep = Vec::new();
			let mut dropped = Vec::new();
			for session in pending.drain(..) {
				if session.is_terminated() {
					continue;
				}
				if session.is_established() || session.is_termination_timeout_expired(ts) {
					dropped.push(session);
				} else {
					keep.push(session);
				}
			}
			*pending = keep;
			dropped
		};
		for session in dropped {
			session.terminate();
		}
	}
}

fn accept_loop(inner: Arc<ServerInner>, listener: TcpListener) {
	for stream in listener.incoming() {
		if !inner.running.load(Ordering::SeqCst) {
			break;
		}
		match stream {
			Ok(stream) => match stream.peer_addr() {
				Ok(peer) => {
					debug!("NTCP2: connected from {}", peer);
					let session = Ntcp2Session::new_incoming(
						Arc::downgrade(&inner),
						inner.config.establish_timeout,
					);
					inner.pending_incoming.lock().unwrap().push(session.clone());
					thread::spawn(move || session.run_incoming(stream));
				}
				Err(e) => error!("NTCP2: connected from error: {}", e),
			},
			Err(e) => {
				if inner.running.load(Ordering::SeqCst) {
					error!("NTCP2: accept error: {}", e);
				}
			}
		}
	}
}

fn run_sweeper(inner: Arc<ServerInner>) {
	while inner.running.load(Ordering::SeqCst) {
		thread::sleep(Duration::from_secs(inner.config.termination_check_timeout.max(1)));
		if !inner.running.load(Ordering::SeqCst) {
			break;
		}
		inner.sweep();
	}
}

impl Ntcp2Server {
	pub fn new(
		config: Ntcp2Config,
		context: Arc<RouterContext>,
		netdb: Arc<dyn NetDb>,
		transports: Arc<dyn Transports>,
		i2np: Arc<dyn I2npHandler>,
	) -> Ntcp2Server {
		Ntcp2Server {
			inner: Arc::new(ServerInner {
				config,
				context,
				netdb,
				transports,
				i2np,
				sessions: DashMap::new(),
				pending_incoming: Mutex::new(Vec::new()),
				listeners: Mutex::new(Vec::new()),
				running: AtomicBool::new(false),
			}),
		}
	}

	pub fn context(&self) -> &RouterContext {
		&self.inner.context
	}

	pub fn is_running(&self) -> bool {
		self.inner.running.load(Ordering::SeqCst)
	}

	/// Binds acceptors on every published NTCP2 address of the local
	/// RouterInfo (unless a proxy is configured, which makes the transport
	/// outbound-only) and starts the sweeper. A bind failure on a
	/// published address refuses the whole start.
	pub fn start(&self) -> anyhow::Result<()> {
		if !self.inner.config.enabled {
			info!("NTCP2: disabled");
			return Ok(());
		}
		if self.inner.running.swap(true, Ordering::SeqCst) {
			return Ok(());
		}
		if self.inner.config.proxy != ProxyType::None {
			info!("NTCP2: using proxy to connect to peers");
		} else {
			let router_info = self.inner.context.router_info();
			let mut bound = Vec::new();
			for address in router_info.ntcp2_addresses() {
				if !address.is_published() {
					continue;
				}
				let host = match address.host {
					Some(host) => host,
					None => continue,
				};
				if host.is_ipv6() && !self.inner.config.address_v6 {
					continue;
				}
				let listener = match TcpListener::bind(SocketAddr::new(host, address.port))
					.with_context(|| {
						format!("unable to start NTCP2 transport at port {}", address.port)
					}) {
					Ok(listener) => listener,
					Err(e) => {
						self.inner.running.store(false, Ordering::SeqCst);
						return Err(e);
					}
				};
				info!("NTCP2: start listening TCP port {}", address.port);
				bound.push(listener);
			}
			let mut locals = self.inner.listeners.lock().unwrap();
			for listener in bound {
				if let Ok(addr) = listener.local_addr() {
					locals.push(addr);
				}
				let inner = self.inner.clone();
				thread::spawn(move || accept_loop(inner, listener));
			}
		}
		let inner = self.inner.clone();
		thread::spawn(move || run_sweeper(inner));
		Ok(())
	}

	/// Terminates every session and wakes the blocked acceptors so their
	/// threads wind down.
	pub fn stop(&self) {
		if !self.inner.running.swap(false, Ordering::SeqCst) {
			return;
		}
		let sessions: Vec<_> = self
			.inner
			.sessions
			.iter()
			.map(|entry| entry.value().clone())
			.collect();
		for session in sessions {
			session.terminate();
		}
		let pending: Vec<_> = self.inner.pending_incoming.lock().unwrap().drain(..).collect();
		for session in pending {
			session.terminate();
		}
		for addr in self.inner.listeners.lock().unwrap().drain(..) {
			let _ = TcpStream::connect_timeout(&addr, Duration::from_millis(100));
		}
	}

	/// Dials the router's published NTCP2 address. The session enters the
	/// table immediately so concurrent connects to the same router
	/// deduplicate; the handshake then proceeds on its own thread.
	pub fn connect(&self, router: &RouterInfo) -> Result<(), Error> {
		let address = router.ntcp2_address(true).ok_or(Error::NoNtcp2Address)?.clone();
		let host = address.host.ok_or(Error::NoNtcp2Address)?;
		debug!("NTCP2: connecting to {}:{}", host, address.port);
		let session = Ntcp2Session::new_outgoing(
			Arc::downgrade(&self.inner),
			router.identity().clone(),
			address.clone(),
			self.inner.config.establish_timeout,
		);
		if !self.inner.add_session(&session, false) {
			return Err(Error::DuplicateSession);
		}
		let inner = self.inner.clone();
		let port = address.port;
		thread::spawn(move || inner.dial(session, host, port));
		Ok(())
	}

	pub fn find_session(&self, ident: &IdentHash) -> Option<Arc<Ntcp2Session>> {
		self.inner.sessions.get(ident).map(|entry| entry.value().clone())
	}

	pub fn num_sessions(&self) -> usize {
		self.inner.sessions.len()
	}

	/// Swaps in a republished local RouterInfo and pushes it over every
	/// established incoming session (outgoing peers got it in message 3).
	pub fn publish_router_info(&self, router_info: RouterInfo) {
		self.inner.context.update_router_info(router_info);
		for session in self.sessions_snapshot() {
			session.send_local_router_info();
		}
	}

	fn sessions_snapshot(&self) -> Vec<Arc<Ntcp2Session>> {
		self.inner
			.sessions
			.iter()
			.map(|entry| entry.value().clone())
			.collect()
	}
}

#[cfg(test)]
mod tests {
	use super::*;
	use crate::i2np::I2npMessage;
	use crate::utils::milliseconds_since_epoch;
	use std::collections::HashMap;
	use std::io::{Read, Write};
	use std::net::Ipv4Addr;
	use std::time::Instant;

	#[derive(Default)]
	struct MockNetDb {
		routers: Mutex<HashMap<IdentHash, RouterInfo>>,
		posted: Mutex<Vec<I2npMessage>>,
		unreachable: Mutex<Vec<IdentHash>>,
	}

	impl NetDb for MockNetDb {
		fn find_router(&self, ident: &IdentHash) -> Option<RouterInfo> {
			self.routers.lock().unwrap().get(ident).cloned()
		}

		fn post_i2np_msg(&self, msg: I2npMessage) {
			self.posted.lock().unwrap().push(msg);
		}

		fn set_unreachable(&self, ident: &IdentHash, unreachable: bool) {
			if unreachable {
				self.unreachable.lock().unwrap().push(*ident);
			}
		}
	}

	#[derive(Default)]
	struct MockTransports {
		connected: Mutex<Vec<IdentHash>>,
		disconnected: Mutex<Vec<IdentHash>>,
	}

	impl Transports for MockTransports {
		fn peer_connected(&self, ident: &IdentHash) {
			self.connected.lock().unwrap().push(*ident);
		}

		fn peer_disconnected(&self, ident: &IdentHash) {
			self.disconnected.lock().unwrap().push(*ident);
		}
	}

	#[derive(Default)]
	struct MockHandler {
		msgs: Mutex<Vec<I2npMessage>>,
	}

	impl I2npHandler for MockHandler {
		fn put_next_message(&self, msg: I2npMessage) {
			self.msgs.lock().unwrap().push(msg);
		}
	}

	struct TestRouter {
		server: Ntcp2Server,
		netdb: Arc<MockNetDb>,
		transports: Arc<MockTransports>,
		handler: Arc<MockHandler>,
		router_info: RouterInfo,
	}

	fn free_port() -> u16 {
		TcpListener::bind("127.0.0.1:0")
			.unwrap()
			.local_addr()
			.unwrap()
			.port()
	}

	fn test_router(config: Ntcp2Config) -> TestRouter {
		let port = free_port();
		let context = Arc::new(RouterContext::generate(
			Some(IpAddr::V4(Ipv4Addr::LOCALHOST)),
			port,
			2,
		));
		let netdb = Arc::new(MockNetDb::default());
		let transports = Arc::new(MockTransports::default());
		let handler = Arc::new(MockHandler::default());
		let router_info = context.router_info();
		let server = Ntcp2Server::new(
			config,
			context,
			netdb.clone(),
			transports.clone(),
			handler.clone(),
		);
		TestRouter { server, netdb, transports, handler, router_info }
	}

	fn wait_for<F: Fn() -> bool>(cond: F, timeout: Duration) -> bool {
		let start = Instant::now();
		while start.elapsed() < timeout {
			if cond() {
				return true;
			}
			thread::sleep(Duration::from_millis(25));
		}
		false
	}

	#[test]
	fn end_to_end_session_delivers_i2np() {
		let a = test_router(Ntcp2Config::default());
		let b = test_router(Ntcp2Config::default());
		b.server.start().unwrap();
		a.server.start().unwrap();

		let a_ident = *a.router_info.ident_hash();
		let b_ident = *b.router_info.ident_hash();
		a.server.connect(&b.router_info).unwrap();
		assert!(wait_for(
			|| a.transports.connected.lock().unwrap().contains(&b_ident),
			Duration::from_secs(10)
		));
		assert!(wait_for(
			|| b.transports.connected.lock().unwrap().contains(&a_ident),
			Duration::from_secs(10)
		));
		// the responder received the initiator's RouterInfo from message 3
		assert!(!b.netdb.posted.lock().unwrap().is_empty());

		let session = a.server.find_session(&b_ident).unwrap();
		session.post_i2np_messages(vec![I2npMessage::new(
			20,
			42,
			milliseconds_since_epoch() + 8000,
			b"hello overlay",
		)]);
		assert!(wait_for(
			|| !b.handler.msgs.lock().unwrap().is_empty(),
			Duration::from_secs(10)
		));
		let received = b.handler.msgs.lock().unwrap().remove(0);
		assert_eq!(received.msg_type(), 20);
		assert_eq!(received.msg_id(), 42);
		assert_eq!(received.payload(), b"hello overlay");

		a.server.stop();
		assert!(wait_for(
			|| b.transports.disconnected.lock().unwrap().contains(&a_ident),
			Duration::from_secs(10)
		));
		b.server.stop();
	}

	#[test]
	fn idle_sessions_are_swept() {
		let mut config = Ntcp2Config::default();
		config.termination_timeout = 1;
		config.termination_check_timeout = 1;
		let a = test_router(config.clone());
		let b = test_router(config);
		b.server.start().unwrap();
		a.server.start().unwrap();

		let a_ident = *a.router_info.ident_hash();
		let b_ident = *b.router_info.ident_hash();
		a.server.connect(&b.router_info).unwrap();
		assert!(wait_for(
			|| b.transports.connected.lock().unwrap().contains(&a_ident),
			Duration::from_secs(10)
		));
		// no traffic: the sweepers on both ends idle the session out
		assert!(wait_for(
			|| a.transports.disconnected.lock().unwrap().contains(&b_ident)
				&& b.transports.disconnected.lock().unwrap().contains(&a_ident),
			Duration::from_secs(10)
		));
		a.server.stop();
		b.server.stop();
	}

	#[test]
	fn duplicate_outgoing_connect_is_refused() {
		let a = test_router(Ntcp2Config::default());
		let b = test_router(Ntcp2Config::default());
		b.server.start().unwrap();
		a.server.start().unwrap();

		a.server.connect(&b.router_info).unwrap();
		// the session is registered synchronously, so a second dial to the
		// same router is refused at once
		assert_eq!(
			a.server.connect(&b.router_info).unwrap_err(),
			Error::DuplicateSession
		);
		a.server.stop();
		b.server.stop();
	}

	#[test]
	fn bind_conflict_refuses_to_start() {
		let blocker = TcpListener::bind("127.0.0.1:0").unwrap();
		let port = blocker.local_addr().unwrap().port();
		let context = Arc::new(RouterContext::generate(
			Some(IpAddr::V4(Ipv4Addr::LOCALHOST)),
			port,
			2,
		));
		let server = Ntcp2Server::new(
			Ntcp2Config::default(),
			context,
			Arc::new(MockNetDb::default()),
			Arc::new(MockTransports::default()),
			Arc::new(MockHandler::default()),
		);
		assert!(server.start().is_err());
		assert!(!server.is_running());
	}

	#[test]
	fn proxy_rejection_marks_the_peer_unreachable() {
		let proxy_listener = TcpListener::bind("127.0.0.1:0").unwrap();
		let proxy_addr = proxy_listener.local_addr().unwrap();
		thread::spawn(move || {
			if let Ok((mut stream, _)) = proxy_listener.accept() {
				let mut greeting = [0u8; 3];
				let _ = stream.read_exact(&mut greeting);
				let _ = stream.write_all(&[0x05, 0xFF]);
			}
		});

		let mut config = Ntcp2Config::default();
		config.proxy = ProxyType::Socks5;
		config.proxy_address = Some(proxy_addr.ip().to_string());
		config.proxy_port = proxy_addr.port();
		let a = test_router(config);
		let b = test_router(Ntcp2Config::default());
		a.server.start().unwrap();

		let b_ident = *b.router_info.ident_hash();
		a.server.connect(&b.router_info).unwrap();
		assert!(wait_for(
			|| a.netdb.unreachable.lock().unwrap().contains(&b_ident),
			Duration::from_secs(10)
		));
		assert!(wait_for(|| a.server.num_sessions() == 0, Duration::from_secs(10)));
		a.server.stop();
	}
}
