use std::io;
use thiserror::Error as ThisError;

/// Kinds of NTCP2 transport errors
#[derive(Clone, Eq, PartialEq, Debug, ThisError)]
pub enum Error {
	/// Wraps io errors
	#[error("IO error occurred: {0}")]
	Io(String),
	/// Wraps nom parser errors
	#[error("Failed to parse a block stream")]
	BlockParsing,
	#[error("AEAD verification failed")]
	Aead,
	#[error("Network ID mismatch: got {0}, expected {1}")]
	NetworkIdMismatch(u8, u8),
	#[error("Unsupported protocol version: {0}")]
	ProtocolVersionMismatch(u8),
	#[error("Clock skew of {0} seconds exceeds the allowed window")]
	ClockSkew(i64),
	#[error("SessionConfirmed part 2 length {0} is too short")]
	Message3TooShort(u16),
	#[error("Handshake padding length {0} is too long")]
	PaddingTooLong(u16),
	#[error("Malformed RouterInfo: {0}")]
	MalformedRouterInfo(String),
	#[error("RouterInfo signature verification failed")]
	RouterInfoSignature,
	#[error("RouterInfo is too old")]
	RouterInfoExpired,
	#[error("Static key in RouterInfo differs from the handshake key")]
	StaticKeyMismatch,
	#[error("Peer has no published NTCP2 address")]
	NoNtcp2Address,
	#[error("Received frame length {0} is too short")]
	FrameTooShort(u16),
	#[error("Session already exists and is outgoing")]
	DuplicateSession,
	#[error("Session is terminated")]
	Terminated,
	#[error("Proxy handshake failed: {0}")]
	Proxy(String),
}

impl From<io::Error> for Error {
	fn from(err: io::Error) -> Error {
		Self::Io(err.to_string())
	}
}

impl<E> From<nom::Err<E>> for Error {
	fn from(_err: nom::Err<E>) -> Error {
		Self::BlockParsing
	}
}

impl From<chacha20poly1305::aead::Error> for Error {
	fn from(_err: chacha20poly1305::aead::Error) -> Error {
		Self::Aead
	}
}

/// Reason codes carried in a Termination block. The numeric values are part
/// of the wire protocol and must not be reordered.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum TerminationReason {
	NormalClose = 0,
	TerminationReceived = 1,
	IdleTimeout = 2,
	RouterInfoSignatureVerificationFail = 3,
	IncorrectSParameter = 4,
	Message3Error = 5,
	DataPhaseAEADFailure = 6,
}

impl TerminationReason {
	pub fn from_u8(value: u8) -> Option<TerminationReason> {
		use TerminationReason::*;
		match value {
			0 => Some(NormalClose),
			1 => Some(TerminationReceived),
			2 => Some(IdleTimeout),
			3 => Some(RouterInfoSignatureVerificationFail),
			4 => Some(IncorrectSParameter),
			5 => Some(Message3Error),
			6 => Some(DataPhaseAEADFailure),
			_ => None,
		}
	}
}

#[cfg(test)]
mod tests {
	use super::TerminationReason;

	#[test]
	fn reason_codes_are_stable() {
		assert_eq!(TerminationReason::NormalClose as u8, 0);
		assert_eq!(TerminationReason::IdleTimeout as u8, 2);
		assert_eq!(TerminationReason::IncorrectSParameter as u8, 4);
		assert_eq!(TerminationReason::DataPhaseAEADFailure as u8, 6);
		assert_eq!(
			TerminationReason::from_u8(4),
			Some(TerminationReason::IncorrectSParameter)
		);
		assert_eq!(TerminationReason::from_u8(200), None);
	}
}
