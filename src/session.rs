//! An established NTCP2 session: the framed, length-obfuscated data phase
//! between two routers, plus the blocking handshake drivers that produce it.
//!
//! One thread per session reads frames; a second drains the send queue.
//! The sender half (AEAD key, SipHash length chain, sequence number) lives
//! behind a mutex so queue drains and termination frames never interleave;
//! the receiver half is owned by the reading thread alone.

use std::collections::VecDeque;
use std::io::{Read, Write};
use std::net::{Shutdown, TcpStream};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Condvar, Mutex, Weak};
use std::thread;
use std::time::Duration;

use log::{debug, error, warn};
use rand::Rng;

use crate::block::{self, Block, BLOCK_HEADER_SIZE};
use crate::crypto::{aead_decrypt, aead_encrypt, nonce, DataPhaseKeys, LengthObfuscator};
use crate::error::{Error, TerminationReason};
use crate::establisher::Establisher;
use crate::i2np::{I2npMessage, I2NP_MAX_MESSAGE_SIZE};
use crate::identity::{
	IdentHash, Ntcp2Address, RouterIdentity, RouterInfo, NETDB_MIN_EXPIRATION_TIMEOUT,
};
use crate::server::ServerInner;
use crate::utils::{milliseconds_since_epoch, seconds_since_epoch};

/// Plaintext capacity of one frame: a 16 KiB wire frame minus the 2-byte
/// length and the AEAD tag.
pub const NTCP2_UNENCRYPTED_FRAME_MAX_SIZE: usize = 16384 - 18;

/// Maximum padding relative to the frame payload, percent.
pub const NTCP2_MAX_PADDING_RATIO: usize = 6;

/// A session whose queue grows past this while a write is outstanding is
/// dropped rather than allowed to stall the transport.
pub const NTCP2_MAX_OUTGOING_QUEUE_SIZE: usize = 500;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
	Handshaking,
	Established,
	Terminating,
	Terminated,
}

/// Sender half of the data phase.
pub(crate) struct SendChannel {
	key: [u8; 32],
	length: LengthObfuscator,
	seqn: u64,
	stream: TcpStream,
}

impl SendChannel {
	/// Seals `payload` and writes one `<obfuscated length><ciphertext>`
	/// frame. Returns the number of wire bytes written.
	pub(crate) fn send_frame(&mut self, payload: &[u8]) -> Result<usize, Error> {
		let ciphertext = aead_encrypt(&self.key, &nonce(self.seqn), b"", payload);
		self.seqn += 1;
		let mut frame = Vec::with_capacity(2 + ciphertext.len());
		frame.extend_from_slice(&self.length.obfuscate(ciphertext.len() as u16));
		frame.extend_from_slice(&ciphertext);
		self.stream.write_all(&frame)?;
		Ok(frame.len())
	}
}

/// Receiver half of the data phase.
pub(crate) struct RecvChannel {
	key: [u8; 32],
	length: LengthObfuscator,
	seqn: u64,
	stream: TcpStream,
}

impl RecvChannel {
	pub(crate) fn recv_frame(&mut self) -> Result<Vec<u8>, Error> {
		let mut len_bytes = [0u8; 2];
		self.stream.read_exact(&mut len_bytes)?;
		let len = self.length.deobfuscate(len_bytes);
		debug!("NTCP2: received length {}", len);
		if len < 16 {
			return Err(Error::FrameTooShort(len));
		}
		let mut ciphertext = vec![0u8; len as usize];
		self.stream.read_exact(&mut ciphertext)?;
		let n = nonce(self.seqn);
		self.seqn += 1;
		aead_decrypt(&self.key, &n, b"", &ciphertext)
	}

	pub(crate) fn seqn(&self) -> u64 {
		self.seqn
	}
}

/// Splits the derived material into directional channels. The initiator
/// sends on the ab keys and receives on ba; the responder mirrors.
pub(crate) fn data_phase_channels(
	keys: DataPhaseKeys,
	initiator: bool,
	stream: &TcpStream,
) -> Result<(SendChannel, RecvChannel), Error> {
	let (send_key, send_sip, recv_key, recv_sip) = if initiator {
		(keys.k_ab, keys.sip_ab, keys.k_ba, keys.sip_ba)
	} else {
		(keys.k_ba, keys.sip_ba, keys.k_ab, keys.sip_ab)
	};
	Ok((
		SendChannel {
			key: send_key,
			length: LengthObfuscator::from_sip_keys(&send_sip),
			seqn: 0,
			stream: stream.try_clone()?,
		},
		RecvChannel {
			key: recv_key,
			length: LengthObfuscator::from_sip_keys(&recv_sip),
			seqn: 0,
			stream: stream.try_clone()?,
		},
	))
}

/// Appends the trailing Padding block. `msg_len` is the payload assembled
/// so far, `cap` the room the padding block may occupy (header included).
fn append_padding_block(out: &mut Vec<u8>, msg_len: usize, cap: usize) {
	let cap = cap.min(NTCP2_UNENCRYPTED_FRAME_MAX_SIZE.saturating_sub(out.len()));
	if cap < BLOCK_HEADER_SIZE {
		return;
	}
	let avail = cap - BLOCK_HEADER_SIZE;
	// short messages are padded as if they were 256 bytes, so their padding
	// is not always zero
	let msg_len = msg_len.max(256);
	let mut padding = msg_len * NTCP2_MAX_PADDING_RATIO / 100;
	if msg_len + padding + BLOCK_HEADER_SIZE > NTCP2_UNENCRYPTED_FRAME_MAX_SIZE {
		padding = NTCP2_UNENCRYPTED_FRAME_MAX_SIZE
			.saturating_sub(msg_len)
			.saturating_sub(BLOCK_HEADER_SIZE);
	}
	padding = padding.min(avail);
	if padding > 0 {
		padding = rand::thread_rng().gen_range(0..padding);
	}
	block::write_padding_block(out, padding);
}

/// Validates the RouterInfo block carried in SessionConfirmed part 2.
///
/// `Err(None)` means drop the session silently; `Err(Some(reason))` means a
/// termination frame carrying that reason goes out first. On success the
/// parsed RouterInfo and the `flag || descriptor` bytes for NetDb are
/// returned.
pub(crate) fn check_confirmed_router_info(
	payload: &[u8],
	remote_static: &[u8; 32],
	now_ms: u64,
) -> Result<(RouterInfo, Vec<u8>), Option<TerminationReason>> {
	if payload.len() < 4 || payload[0] != block::BLK_ROUTER_INFO {
		warn!(
			"NTCP2: unexpected block {} in SessionConfirmed",
			payload.first().copied().unwrap_or(0)
		);
		return Err(None);
	}
	let size = u16::from_be_bytes([payload[1], payload[2]]) as usize;
	if size == 0 || size > payload.len() - BLOCK_HEADER_SIZE {
		error!("NTCP2: unexpected RouterInfo size {} in SessionConfirmed", size);
		return Err(None);
	}
	let router_info = match RouterInfo::from_buffer(&payload[4..BLOCK_HEADER_SIZE + size]) {
		Ok(router_info) => router_info,
		Err(e) => {
			error!("NTCP2: bad RouterInfo in SessionConfirmed: {}", e);
			return Err(None);
		}
	};
	if router_info.is_unreachable() {
		error!("NTCP2: signature verification failed in SessionConfirmed");
		return Err(Some(TerminationReason::RouterInfoSignatureVerificationFail));
	}
	if now_ms > router_info.timestamp() + NETDB_MIN_EXPIRATION_TIMEOUT * 1000 {
		error!("NTCP2: RouterInfo is too old in SessionConfirmed");
		return Err(Some(TerminationReason::Message3Error));
	}
	let address = match router_info.ntcp2_address(false) {
		Some(address) => address,
		None => {
			error!("NTCP2: no NTCP2 address found in SessionConfirmed");
			return Err(None);
		}
	};
	if &address.static_key != remote_static {
		error!("NTCP2: static key mismatch in SessionConfirmed");
		return Err(Some(TerminationReason::IncorrectSParameter));
	}
	let netdb_payload = payload[BLOCK_HEADER_SIZE..BLOCK_HEADER_SIZE + size].to_vec();
	Ok((router_info, netdb_payload))
}

struct SendQueue {
	msgs: VecDeque<I2npMessage>,
	is_sending: bool,
}

pub struct Ntcp2Session {
	self_ref: Weak<Ntcp2Session>,
	server: Weak<ServerInner>,
	is_outgoing: bool,
	remote_identity: Mutex<Option<RouterIdentity>>,
	remote_address: Option<Ntcp2Address>,
	socket: Mutex<Option<TcpStream>>,
	state: Mutex<SessionState>,
	terminated: AtomicBool,
	last_activity: AtomicU64,
	termination_timeout: AtomicU64,
	last_received_seqn: AtomicU64,
	num_sent_bytes: AtomicU64,
	num_received_bytes: AtomicU64,
	send: Mutex<Option<SendChannel>>,
	queue: Mutex<SendQueue>,
	queue_cv: Condvar,
}

impl Ntcp2Session {
	fn new(
		server: Weak<ServerInner>,
		is_outgoing: bool,
		remote_identity: Option<RouterIdentity>,
		remote_address: Option<Ntcp2Address>,
		establish_timeout: u64,
	) -> Arc<Ntcp2Session> {
		Arc::new_cyclic(|self_ref| Ntcp2Session {
			self_ref: self_ref.clone(),
			server,
			is_outgoing,
			remote_identity: Mutex::new(remote_identity),
			remote_address,
			socket: Mutex::new(None),
			state: Mutex::new(SessionState::Handshaking),
			terminated: AtomicBool::new(false),
			last_activity: AtomicU64::new(seconds_since_epoch()),
			termination_timeout: AtomicU64::new(establish_timeout),
			last_received_seqn: AtomicU64::new(0),
			num_sent_bytes: AtomicU64::new(0),
			num_received_bytes: AtomicU64::new(0),
			send: Mutex::new(None),
			queue: Mutex::new(SendQueue { msgs: VecDeque::new(), is_sending: false }),
			queue_cv: Condvar::new(),
		})
	}

	pub(crate) fn new_outgoing(
		server: Weak<ServerInner>,
		identity: RouterIdentity,
		address: Ntcp2Address,
		establish_timeout: u64,
	) -> Arc<Ntcp2Session> {
		Ntcp2Session::new(server, true, Some(identity), Some(address), establish_timeout)
	}

	pub(crate) fn new_incoming(
		server: Weak<ServerInner>,
		establish_timeout: u64,
	) -> Arc<Ntcp2Session> {
		Ntcp2Session::new(server, false, None, None, establish_timeout)
	}

	pub fn is_outgoing(&self) -> bool {
		self.is_outgoing
	}

	pub fn state(&self) -> SessionState {
		*self.state.lock().unwrap()
	}

	pub fn is_established(&self) -> bool {
		self.state() == SessionState::Established
	}

	pub fn is_terminated(&self) -> bool {
		self.terminated.load(Ordering::SeqCst)
	}

	pub fn remote_ident_hash(&self) -> Option<IdentHash> {
		self.remote_identity.lock().unwrap().as_ref().map(|id| *id.hash())
	}

	pub fn termination_timeout(&self) -> u64 {
		self.termination_timeout.load(Ordering::Relaxed)
	}

	pub fn num_sent_bytes(&self) -> u64 {
		self.num_sent_bytes.load(Ordering::Relaxed)
	}

	pub fn num_received_bytes(&self) -> u64 {
		self.num_received_bytes.load(Ordering::Relaxed)
	}

	pub(crate) fn is_termination_timeout_expired(&self, ts: u64) -> bool {
		ts > self.last_activity.load(Ordering::Relaxed) + self.termination_timeout()
	}

	fn attach_socket(&self, stream: &TcpStream) -> Result<(), Error> {
		*self.socket.lock().unwrap() = Some(stream.try_clone()?);
		Ok(())
	}

	/// Idempotent: the socket is shut down exactly once, the server map
	/// entry dropped and the transport manager notified.
	pub fn terminate(&self) {
		if self.terminated.swap(true, Ordering::SeqCst) {
			return;
		}
		*self.state.lock().unwrap() = SessionState::Terminated;
		if let Some(socket) = self.socket.lock().unwrap().take() {
			if let Err(e) = socket.shutdown(Shutdown::Both) {
				debug!("NTCP2: couldn't shutdown socket: {}", e);
			}
		}
		self.queue.lock().unwrap().msgs.clear();
		self.queue_cv.notify_all();
		if let Some(server) = self.server.upgrade() {
			if let Some(me) = self.self_ref.upgrade() {
				server.remove_session(&me);
			}
			if let Some(ident) = self.remote_ident_hash() {
				server.transports().peer_disconnected(&ident);
			}
		}
		debug!("NTCP2: session terminated");
	}

	fn install_channels(
		&self,
		keys: DataPhaseKeys,
		stream: &TcpStream,
	) -> Result<RecvChannel, Error> {
		let (send, recv) = data_phase_channels(keys, self.is_outgoing, stream)?;
		*self.send.lock().unwrap() = Some(send);
		Ok(recv)
	}

	fn mark_established(&self) {
		*self.state.lock().unwrap() = SessionState::Established;
		let timeout = match self.server.upgrade() {
			Some(server) => server.config().termination_timeout,
			None => crate::server::NTCP2_TERMINATION_TIMEOUT,
		};
		self.termination_timeout.store(timeout, Ordering::Relaxed);
		self.last_activity.store(seconds_since_epoch(), Ordering::Relaxed);
		if let Some(socket) = self.socket.lock().unwrap().as_ref() {
			let _ = socket.set_read_timeout(None);
		}
		if let Some(server) = self.server.upgrade() {
			if let Some(ident) = self.remote_ident_hash() {
				server.transports().peer_connected(&ident);
			}
		}
		if let Some(session) = self.self_ref.upgrade() {
			thread::spawn(move || session.run_writer());
		}
	}

	// ---- handshake drivers ----------------------------------------------

	/// Drives the initiator handshake on the freshly connected socket, then
	/// becomes the session's receive loop.
	pub(crate) fn run_outgoing(&self, stream: TcpStream) {
		match self.outgoing_handshake(&stream) {
			Ok(mut recv) => self.run_receiver(&mut recv),
			Err(e) => {
				if !self.is_terminated() {
					warn!("NTCP2: outgoing handshake failed: {}", e);
				}
				self.terminate();
			}
		}
	}

	fn outgoing_handshake(&self, stream: &TcpStream) -> Result<RecvChannel, Error> {
		let server = self.server.upgrade().ok_or(Error::Terminated)?;
		self.attach_socket(stream)?;
		stream.set_read_timeout(Some(Duration::from_secs(server.config().establish_timeout)))?;

		let address = self.remote_address.clone().ok_or(Error::NoNtcp2Address)?;
		let iv = address.iv.ok_or(Error::NoNtcp2Address)?;
		let remote_ident = self.remote_ident_hash().ok_or(Error::Terminated)?;
		let mut establisher = Establisher::alice(
			server.transports().next_x25519_keys(),
			address.static_key,
			remote_ident,
			iv,
		);
		let mut socket = stream.try_clone()?;

		let m1 = establisher
			.create_session_request(
				&server.context().router_info_buffer(),
				server.context().net_id(),
				seconds_since_epoch() as u32,
			)?
			.to_vec();
		socket.write_all(&m1)?;

		let mut head = [0u8; 64];
		socket.read_exact(&mut head)?;
		debug!("NTCP2: SessionCreated received");
		let padding_len = establisher.process_session_created(&head, seconds_since_epoch())?;
		if padding_len > 0 {
			let mut padding = vec![0u8; padding_len as usize];
			socket.read_exact(&mut padding)?;
			establisher.append_session_created_padding(&padding);
		}

		let m3 = establisher.create_session_confirmed(server.context().static_keys()).to_vec();
		socket.write_all(&m3)?;
		debug!("NTCP2: SessionConfirmed sent");

		let recv = self.install_channels(establisher.derive_data_phase_keys(), stream)?;
		self.mark_established();
		Ok(recv)
	}

	/// Drives the responder handshake, validates the initiator's RouterInfo
	/// and registers the session, then becomes the receive loop.
	pub(crate) fn run_incoming(&self, stream: TcpStream) {
		match self.incoming_handshake(&stream) {
			Ok(mut recv) => self.run_receiver(&mut recv),
			Err(e) => {
				if !self.is_terminated() {
					warn!("NTCP2: incoming handshake failed: {}", e);
				}
				self.terminate();
			}
		}
	}

	fn incoming_handshake(&self, stream: &TcpStream) -> Result<RecvChannel, Error> {
		let server = self.server.upgrade().ok_or(Error::Terminated)?;
		self.attach_socket(stream)?;
		stream.set_read_timeout(Some(Duration::from_secs(server.config().establish_timeout)))?;

		let context = server.context();
		let mut establisher = Establisher::bob(
			server.transports().next_x25519_keys(),
			context.static_public(),
			*context.ident_hash(),
			context.iv(),
		);
		let mut socket = stream.try_clone()?;

		let mut head = [0u8; 64];
		socket.read_exact(&mut head)?;
		debug!("NTCP2: SessionRequest received");
		let padding_len = establisher.process_session_request(
			&head,
			context.static_keys(),
			context.net_id(),
			seconds_since_epoch(),
		)?;
		if padding_len > 0 {
			let mut padding = vec![0u8; padding_len as usize];
			socket.read_exact(&mut padding)?;
			establisher.append_session_request_padding(&padding);
		}

		let m2 = establisher.create_session_created(seconds_since_epoch() as u32).to_vec();
		socket.write_all(&m2)?;
		debug!("NTCP2: SessionCreated sent");

		let mut m3 = vec![0u8; establisher.session_confirmed_len()];
		socket.read_exact(&mut m3)?;
		debug!("NTCP2: SessionConfirmed received");
		let payload = establisher.process_session_confirmed(&m3)?;

		let remote_static = establisher.remote_static();
		let recv = self.install_channels(establisher.derive_data_phase_keys(), stream)?;

		let (router_info, netdb_payload) =
			match check_confirmed_router_info(&payload, &remote_static, milliseconds_since_epoch())
			{
				Ok(checked) => checked,
				Err(Some(reason)) => {
					self.send_termination_and_terminate(reason);
					return Err(Error::Terminated);
				}
				Err(None) => return Err(Error::Terminated),
			};
		server.netdb().post_i2np_msg(I2npMessage::dummy(&netdb_payload));
		let identity = match server.netdb().find_router(router_info.ident_hash()) {
			Some(known) => known.identity().clone(),
			None => router_info.identity().clone(),
		};
		*self.remote_identity.lock().unwrap() = Some(identity);

		let me = self.self_ref.upgrade().ok_or(Error::Terminated)?;
		if !server.add_session(&me, true) {
			return Err(Error::DuplicateSession);
		}
		self.mark_established();
		Ok(recv)
	}

	// ---- receive path ---------------------------------------------------

	pub(crate) fn run_receiver(&self, recv: &mut RecvChannel) {
		loop {
			if self.is_terminated() {
				return;
			}
			match recv.recv_frame() {
				Ok(frame) => {
					self.last_activity.store(seconds_since_epoch(), Ordering::Relaxed);
					self.num_received_bytes
						.fetch_add(frame.len() as u64 + 18, Ordering::Relaxed);
					self.last_received_seqn.store(recv.seqn(), Ordering::Relaxed);
					if !self.process_frame(&frame) {
						return;
					}
				}
				Err(Error::FrameTooShort(len)) => {
					error!("NTCP2: received length {} is too short", len);
					self.terminate();
					return;
				}
				Err(Error::Aead) => {
					warn!("NTCP2: received AEAD verification failed");
					self.send_termination_and_terminate(TerminationReason::DataPhaseAEADFailure);
					return;
				}
				Err(e) => {
					if !self.is_terminated() {
						warn!("NTCP2: receive read error: {}", e);
					}
					self.terminate();
					return;
				}
			}
		}
	}

	/// Dispatches the blocks of one decrypted frame. Returns false once the
	/// session terminated.
	fn process_frame(&self, frame: &[u8]) -> bool {
		let (blocks, trailing) = block::parse_frame(frame);
		if trailing > 0 {
			error!("NTCP2: unexpected block length, {} trailing bytes dropped", trailing);
		}
		let server = self.server.upgrade();
		for raw in blocks {
			debug!("NTCP2: block type {} of size {}", raw.blk_type, raw.payload.len());
			match Block::from_raw(raw) {
				Ok(Block::DateTime(ts)) => debug!("NTCP2: datetime {}", ts),
				Ok(Block::Options(_)) => debug!("NTCP2: options"),
				Ok(Block::RouterInfo { flag, .. }) => {
					debug!("NTCP2: RouterInfo flag={}", flag);
					if let Some(server) = &server {
						server.netdb().post_i2np_msg(I2npMessage::dummy(raw.payload));
					}
				}
				Ok(Block::I2np(data)) => {
					if data.len() > I2NP_MAX_MESSAGE_SIZE {
						error!("NTCP2: I2NP block is too long {}", data.len());
						continue;
					}
					match I2npMessage::from_ntcp2(data) {
						Ok(msg) => {
							if let Some(server) = &server {
								server.i2np_handler().put_next_message(msg);
							}
						}
						Err(_) => warn!("NTCP2: truncated I2NP block"),
					}
				}
				Ok(Block::Termination { reason, .. }) => {
					debug!("NTCP2: termination, reason={}", reason);
					self.terminate();
					return false;
				}
				Ok(Block::Padding(_)) => debug!("NTCP2: padding"),
				Ok(Block::Unknown { blk_type, .. }) => {
					warn!("NTCP2: unknown block type {}", blk_type)
				}
				Err(_) => warn!("NTCP2: malformed block of type {}", raw.blk_type),
			}
		}
		if let Some(server) = &server {
			server.i2np_handler().flush();
		}
		true
	}

	// ---- send path ------------------------------------------------------

	/// Queues outbound messages. Called from any thread; the writer drains
	/// the queue one frame at a time.
	pub fn post_i2np_messages(&self, msgs: Vec<I2npMessage>) {
		if self.is_terminated() {
			return;
		}
		let overflow = {
			let mut queue = self.queue.lock().unwrap();
			for msg in msgs {
				queue.msgs.push_back(msg);
			}
			queue.is_sending && queue.msgs.len() > NTCP2_MAX_OUTGOING_QUEUE_SIZE
		};
		if overflow {
			warn!(
				"NTCP2: outgoing messages queue size to {} exceeds {}",
				self.remote_ident_hash().map(|i| i.to_base64()).unwrap_or_default(),
				NTCP2_MAX_OUTGOING_QUEUE_SIZE
			);
			self.terminate();
		} else {
			self.queue_cv.notify_one();
		}
	}

	fn run_writer(&self) {
		loop {
			let batch = {
				let mut queue = self.queue.lock().unwrap();
				loop {
					if self.is_terminated() {
						return;
					}
					if !queue.msgs.is_empty() {
						break;
					}
					queue = self.queue_cv.wait(queue).unwrap();
				}
				queue.is_sending = true;
				let mut batch = Vec::new();
				let mut assembled = 0;
				while let Some(msg) = queue.msgs.front() {
					let len = msg.ntcp2_length() + BLOCK_HEADER_SIZE;
					if assembled + len <= NTCP2_UNENCRYPTED_FRAME_MAX_SIZE {
						assembled += len;
						batch.push(queue.msgs.pop_front().unwrap());
					} else if len > NTCP2_UNENCRYPTED_FRAME_MAX_SIZE {
						error!(
							"NTCP2: I2NP message of size {} can't be sent. Dropped",
							msg.ntcp2_length()
						);
						queue.msgs.pop_front();
					} else {
						break;
					}
				}
				batch
			};
			if !batch.is_empty() {
				if let Err(e) = self.send_i2np_frame(&batch) {
					if !self.is_terminated() {
						warn!("NTCP2: couldn't send frame: {}", e);
					}
					self.terminate();
					return;
				}
			}
			self.queue.lock().unwrap().is_sending = false;
		}
	}

	fn send_i2np_frame(&self, msgs: &[I2npMessage]) -> Result<(), Error> {
		let mut payload = Vec::new();
		for msg in msgs {
			block::write_i2np_block(&mut payload, &msg.to_ntcp2());
		}
		let msg_len = payload.len();
		append_padding_block(
			&mut payload,
			msg_len,
			NTCP2_UNENCRYPTED_FRAME_MAX_SIZE.saturating_sub(msg_len),
		);
		self.send_frame(&payload)
	}

	fn send_frame(&self, payload: &[u8]) -> Result<(), Error> {
		let mut guard = self.send.lock().unwrap();
		let channel = guard.as_mut().ok_or(Error::Terminated)?;
		let sent = channel.send_frame(payload)?;
		self.num_sent_bytes.fetch_add(sent as u64, Ordering::Relaxed);
		self.last_activity.store(seconds_since_epoch(), Ordering::Relaxed);
		Ok(())
	}

	/// Pushes the local RouterInfo over an established incoming session.
	/// Outgoing sessions already delivered it inside SessionConfirmed.
	pub fn send_local_router_info(&self) {
		if self.is_outgoing() || !self.is_established() {
			return;
		}
		let server = match self.server.upgrade() {
			Some(server) => server,
			None => return,
		};
		let router_info = server.context().router_info_buffer();
		let mut payload = Vec::new();
		block::write_router_info_block(&mut payload, 0, &router_info);
		let msg_len = payload.len();
		append_padding_block(&mut payload, msg_len, 64);
		if let Err(e) = self.send_frame(&payload) {
			warn!("NTCP2: couldn't send RouterInfo: {}", e);
			self.terminate();
		}
	}

	fn send_termination(&self, reason: TerminationReason) -> Result<(), Error> {
		let mut payload = Vec::new();
		block::write_termination_block(
			&mut payload,
			self.last_received_seqn.load(Ordering::Relaxed),
			reason as u8,
		);
		let msg_len = payload.len();
		append_padding_block(&mut payload, msg_len, 19);
		self.send_frame(&payload)
	}

	/// Sends a Termination block carrying `reason`, then closes. Used for
	/// every post-establishment policy failure and the idle sweep.
	pub fn send_termination_and_terminate(&self, reason: TerminationReason) {
		{
			let mut state = self.state.lock().unwrap();
			if *state == SessionState::Established {
				*state = SessionState::Terminating;
			}
		}
		if let Err(e) = self.send_termination(reason) {
			debug!("NTCP2: couldn't send termination: {}", e);
		}
		self.terminate();
	}
}

#[cfg(test)]
mod tests {
	use super::*;
	use crate::identity::RouterInfoBuilder;
	use ed25519_dalek::SigningKey;
	use std::net::{IpAddr, Ipv4Addr, TcpListener};

	fn socket_pair() -> (TcpStream, TcpStream) {
		let listener = TcpListener::bind("127.0.0.1:0").unwrap();
		let addr = listener.local_addr().unwrap();
		let client = TcpStream::connect(addr).unwrap();
		let (server, _) = listener.accept().unwrap();
		(client, server)
	}

	fn established_pair() -> (Arc<Ntcp2Session>, SendChannel, RecvChannel, RecvChannel) {
		let (alice_stream, bob_stream) = socket_pair();
		let keys = DataPhaseKeys::derive(&[1u8; 32], &[2u8; 32]);
		let bob_keys = DataPhaseKeys::derive(&[1u8; 32], &[2u8; 32]);

		let session = Ntcp2Session::new_incoming(Weak::new(), 10);
		session.attach_socket(&alice_stream).unwrap();
		let alice_recv = session.install_channels(keys, &alice_stream).unwrap();
		session.mark_established();

		let (bob_send, bob_recv) = data_phase_channels(bob_keys, true, &bob_stream).unwrap();
		(session, bob_send, bob_recv, alice_recv)
	}

	#[test]
	fn frames_round_trip_with_padding() {
		let (session, _bob_send, mut bob_recv, _alice_recv) = established_pair();

		let msg = I2npMessage::new(20, 7, 1_700_000_000_000, b"payload one");
		session.post_i2np_messages(vec![msg]);

		let frame = bob_recv.recv_frame().unwrap();
		let (blocks, trailing) = block::parse_frame(&frame);
		assert_eq!(trailing, 0);
		assert_eq!(blocks[0].blk_type, block::BLK_I2NP_MESSAGE);
		let received = I2npMessage::from_ntcp2(blocks[0].payload).unwrap();
		assert_eq!(received.msg_type(), 20);
		assert_eq!(received.msg_id(), 7);
		assert_eq!(received.payload(), b"payload one");
		// a trailing padding block follows the message
		assert_eq!(blocks.last().unwrap().blk_type, block::BLK_PADDING);

		session.terminate();
	}

	#[test]
	fn several_messages_pack_into_one_frame() {
		let (session, _bob_send, mut bob_recv, _alice_recv) = established_pair();

		let msgs: Vec<_> = (0..3)
			.map(|i| I2npMessage::new(20, i, 1_700_000_000_000, b"multi"))
			.collect();
		session.post_i2np_messages(msgs);

		let frame = bob_recv.recv_frame().unwrap();
		let (blocks, _) = block::parse_frame(&frame);
		let i2np: Vec<_> = blocks
			.iter()
			.filter(|b| b.blk_type == block::BLK_I2NP_MESSAGE)
			.collect();
		assert_eq!(i2np.len(), 3);

		session.terminate();
	}

	#[test]
	fn oversize_message_is_dropped_and_session_stays_up() {
		let (session, _bob_send, _bob_recv, _alice_recv) = established_pair();

		let oversize = I2npMessage::new(20, 1, 0, &vec![0u8; 60000]);
		session.post_i2np_messages(vec![oversize]);
		thread::sleep(Duration::from_millis(200));

		assert_eq!(session.state(), SessionState::Established);
		assert!(!session.is_terminated());
		assert_eq!(session.num_sent_bytes(), 0);

		session.terminate();
	}

	#[test]
	fn queue_overflow_terminates_the_session() {
		let (session, _bob_send, _bob_recv, _alice_recv) = established_pair();

		session.queue.lock().unwrap().is_sending = true;
		let msgs: Vec<_> = (0..501)
			.map(|i| I2npMessage::new(20, i, 0, b"x"))
			.collect();
		session.post_i2np_messages(msgs);

		assert!(session.is_terminated());
		assert_eq!(session.state(), SessionState::Terminated);
	}

	#[test]
	fn termination_frame_carries_the_reason() {
		let (session, _bob_send, mut bob_recv, _alice_recv) = established_pair();

		session.send_termination_and_terminate(TerminationReason::IdleTimeout);
		let frame = bob_recv.recv_frame().unwrap();
		let (blocks, _) = block::parse_frame(&frame);
		match Block::from_raw(blocks[0]).unwrap() {
			Block::Termination { reason, last_received_seqn } => {
				assert_eq!(reason, TerminationReason::IdleTimeout as u8);
				assert_eq!(last_received_seqn, 0);
			}
			other => panic!("unexpected block {:?}", other),
		}
		assert!(session.is_terminated());
	}

	#[test]
	fn sequence_numbers_advance_per_frame() {
		let (session, _bob_send, mut bob_recv, _alice_recv) = established_pair();

		for i in 0..3 {
			session.post_i2np_messages(vec![I2npMessage::new(20, i, 0, b"seq")]);
			bob_recv.recv_frame().unwrap();
		}
		assert_eq!(bob_recv.seqn(), 3);

		session.terminate();
	}

	fn confirmed_payload(router_info: &RouterInfo) -> Vec<u8> {
		let mut payload = Vec::new();
		block::write_router_info_block(&mut payload, 0, router_info.buffer());
		payload
	}

	#[test]
	fn mismatched_static_key_yields_incorrect_s_parameter() {
		let router_info = RouterInfoBuilder::new(SigningKey::from_bytes(&[1u8; 32]))
			.timestamp(milliseconds_since_epoch())
			.ntcp2(Ntcp2Address {
				host: Some(IpAddr::V4(Ipv4Addr::LOCALHOST)),
				port: 9001,
				static_key: [0xAA; 32],
				iv: Some([0; 16]),
			})
			.build();
		let err = check_confirmed_router_info(
			&confirmed_payload(&router_info),
			&[0xBB; 32],
			milliseconds_since_epoch(),
		)
		.unwrap_err();
		assert_eq!(err, Some(TerminationReason::IncorrectSParameter));
	}

	#[test]
	fn stale_router_info_yields_message3_error() {
		let router_info = RouterInfoBuilder::new(SigningKey::from_bytes(&[2u8; 32]))
			.timestamp(1_000)
			.ntcp2(Ntcp2Address {
				host: None,
				port: 0,
				static_key: [0xAA; 32],
				iv: None,
			})
			.build();
		let err = check_confirmed_router_info(
			&confirmed_payload(&router_info),
			&[0xAA; 32],
			milliseconds_since_epoch(),
		)
		.unwrap_err();
		assert_eq!(err, Some(TerminationReason::Message3Error));
	}

	#[test]
	fn forged_signature_yields_signature_failure() {
		let router_info = RouterInfoBuilder::new(SigningKey::from_bytes(&[3u8; 32]))
			.timestamp(milliseconds_since_epoch())
			.ntcp2(Ntcp2Address {
				host: None,
				port: 0,
				static_key: [0xAA; 32],
				iv: None,
			})
			.build();
		let mut buf = router_info.buffer().to_vec();
		let last = buf.len() - 1;
		buf[last] ^= 1;
		let mut payload = Vec::new();
		block::write_router_info_block(&mut payload, 0, &buf);
		let err =
			check_confirmed_router_info(&payload, &[0xAA; 32], milliseconds_since_epoch())
				.unwrap_err();
		assert_eq!(err, Some(TerminationReason::RouterInfoSignatureVerificationFail));
	}

	#[test]
	fn valid_router_info_passes_the_checks() {
		let router_info = RouterInfoBuilder::new(SigningKey::from_bytes(&[4u8; 32]))
			.timestamp(milliseconds_since_epoch())
			.ntcp2(Ntcp2Address {
				host: Some(IpAddr::V4(Ipv4Addr::LOCALHOST)),
				port: 9002,
				static_key: [0xCC; 32],
				iv: Some([0; 16]),
			})
			.build();
		let (checked, netdb_payload) = check_confirmed_router_info(
			&confirmed_payload(&router_info),
			&[0xCC; 32],
			milliseconds_since_epoch(),
		)
		.unwrap();
		assert_eq!(checked.ident_hash(), router_info.ident_hash());
		// flag byte plus the descriptor, as posted to NetDb
		assert_eq!(netdb_payload[0], 0);
		assert_eq!(&netdb_payload[1..], router_info.buffer());
	}

	#[test]
	fn padding_respects_the_ratio() {
		for _ in 0..32 {
			let mut out = vec![0u8; 1000];
			append_padding_block(&mut out, 1000, NTCP2_UNENCRYPTED_FRAME_MAX_SIZE);
			let padding = out.len() - 1000 - BLOCK_HEADER_SIZE;
			assert!(padding <= 1000 * NTCP2_MAX_PADDING_RATIO / 100);
		}
	}

	#[test]
	fn short_messages_use_the_256_byte_padding_floor() {
		let mut saw_nonzero = false;
		for _ in 0..64 {
			let mut out = vec![0u8; 12];
			append_padding_block(&mut out, 12, 19);
			let padding = out.len() - 12 - BLOCK_HEADER_SIZE;
			assert!(padding <= 19 - BLOCK_HEADER_SIZE);
			if padding > 0 {
				saw_nonzero = true;
			}
		}
		assert!(saw_nonzero);
	}
}
