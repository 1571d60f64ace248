//! The block stream carried inside data-phase frames.
//!
//! Every block is `<type:1><size:2 big-endian><payload>`. A frame holds one
//! or more blocks back to back; a Padding block, when present, comes last.

use nom::number::complete::{be_u16, be_u8};
use nom::{complete, do_parse, length_data, many0, named};

use crate::error::Error;

pub const BLK_DATETIME: u8 = 0;
pub const BLK_OPTIONS: u8 = 1;
pub const BLK_ROUTER_INFO: u8 = 2;
pub const BLK_I2NP_MESSAGE: u8 = 3;
pub const BLK_TERMINATION: u8 = 224;
pub const BLK_PADDING: u8 = 254;

pub const BLOCK_HEADER_SIZE: usize = 3;

/// A block as found on the wire, payload unexamined.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RawBlock<'a> {
	pub blk_type: u8,
	pub payload: &'a [u8],
}

named!(block<&[u8], RawBlock>,
	do_parse!(
		blk_type: be_u8                >>
		payload:  length_data!(be_u16) >>
		(RawBlock { blk_type, payload })
	)
);

named!(block_stream<&[u8], Vec<RawBlock>>, many0!(complete!(block)));

/// Splits a decrypted frame into its blocks. A block whose declared size
/// overruns the frame stops the scan; whatever parsed before it is returned
/// together with the number of bytes left unconsumed.
pub fn parse_frame(frame: &[u8]) -> (Vec<RawBlock>, usize) {
	match block_stream(frame) {
		Ok((rest, blocks)) => (blocks, rest.len()),
		Err(_) => (Vec::new(), frame.len()),
	}
}

/// A block with its payload layout decoded.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Block<'a> {
	DateTime(u32),
	Options(&'a [u8]),
	RouterInfo { flag: u8, data: &'a [u8] },
	I2np(&'a [u8]),
	Termination { last_received_seqn: u64, reason: u8 },
	Padding(&'a [u8]),
	Unknown { blk_type: u8, payload: &'a [u8] },
}

impl<'a> Block<'a> {
	pub fn from_raw(raw: RawBlock<'a>) -> Result<Block<'a>, Error> {
		let payload = raw.payload;
		match raw.blk_type {
			BLK_DATETIME => {
				if payload.len() != 4 {
					return Err(Error::BlockParsing);
				}
				Ok(Block::DateTime(u32::from_be_bytes([
					payload[0], payload[1], payload[2], payload[3],
				])))
			}
			BLK_OPTIONS => Ok(Block::Options(payload)),
			BLK_ROUTER_INFO => {
				if payload.is_empty() {
					return Err(Error::BlockParsing);
				}
				Ok(Block::RouterInfo { flag: payload[0], data: &payload[1..] })
			}
			BLK_I2NP_MESSAGE => Ok(Block::I2np(payload)),
			BLK_TERMINATION => {
				if payload.len() < 9 {
					return Err(Error::BlockParsing);
				}
				let mut seqn = [0u8; 8];
				seqn.copy_from_slice(&payload[..8]);
				Ok(Block::Termination {
					last_received_seqn: u64::from_be_bytes(seqn),
					reason: payload[8],
				})
			}
			BLK_PADDING => Ok(Block::Padding(payload)),
			blk_type => Ok(Block::Unknown { blk_type, payload }),
		}
	}
}

pub fn write_block(out: &mut Vec<u8>, blk_type: u8, payload: &[u8]) {
	out.push(blk_type);
	out.extend_from_slice(&(payload.len() as u16).to_be_bytes());
	out.extend_from_slice(payload);
}

/// Padding payload is all zero; it is integrity-protected, not secret.
pub fn write_padding_block(out: &mut Vec<u8>, len: usize) {
	out.push(BLK_PADDING);
	out.extend_from_slice(&(len as u16).to_be_bytes());
	out.resize(out.len() + len, 0);
}

pub fn write_termination_block(out: &mut Vec<u8>, last_received_seqn: u64, reason: u8) {
	out.push(BLK_TERMINATION);
	out.extend_from_slice(&9u16.to_be_bytes());
	out.extend_from_slice(&last_received_seqn.to_be_bytes());
	out.push(reason);
}

pub fn write_router_info_block(out: &mut Vec<u8>, flag: u8, router_info: &[u8]) {
	out.push(BLK_ROUTER_INFO);
	out.extend_from_slice(&((router_info.len() + 1) as u16).to_be_bytes());
	out.push(flag);
	out.extend_from_slice(router_info);
}

pub fn write_i2np_block(out: &mut Vec<u8>, ntcp2_msg: &[u8]) {
	write_block(out, BLK_I2NP_MESSAGE, ntcp2_msg);
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn parses_a_multi_block_frame() {
		let mut frame = Vec::new();
		write_i2np_block(&mut frame, b"\x03\x00\x00\x00\x01\x00\x00\x00\x00body");
		write_padding_block(&mut frame, 5);

		let (blocks, trailing) = parse_frame(&frame);
		assert_eq!(trailing, 0);
		assert_eq!(blocks.len(), 2);
		assert_eq!(blocks[0].blk_type, BLK_I2NP_MESSAGE);
		assert_eq!(blocks[1].blk_type, BLK_PADDING);
		assert_eq!(blocks[1].payload, &[0u8; 5][..]);
	}

	#[test]
	fn oversized_block_stops_the_scan() {
		let mut frame = Vec::new();
		write_block(&mut frame, BLK_OPTIONS, b"ok");
		// declares 100 payload bytes but provides 3
		frame.extend_from_slice(&[BLK_I2NP_MESSAGE, 0x00, 100, 1, 2, 3]);

		let (blocks, trailing) = parse_frame(&frame);
		assert_eq!(blocks.len(), 1);
		assert_eq!(trailing, 6);
	}

	#[test]
	fn termination_block_round_trip() {
		let mut frame = Vec::new();
		write_termination_block(&mut frame, 42, 2);
		let (blocks, _) = parse_frame(&frame);
		match Block::from_raw(blocks[0]).unwrap() {
			Block::Termination { last_received_seqn, reason } => {
				assert_eq!(last_received_seqn, 42);
				assert_eq!(reason, 2);
			}
			other => panic!("unexpected block {:?}", other),
		}
	}

	#[test]
	fn short_termination_is_invalid() {
		let raw = RawBlock { blk_type: BLK_TERMINATION, payload: &[0u8; 8] };
		assert!(Block::from_raw(raw).is_err());
	}

	#[test]
	fn router_info_block_keeps_flag_and_body() {
		let mut frame = Vec::new();
		write_router_info_block(&mut frame, 0, b"descriptor");
		let (blocks, _) = parse_frame(&frame);
		match Block::from_raw(blocks[0]).unwrap() {
			Block::RouterInfo { flag, data } => {
				assert_eq!(flag, 0);
				assert_eq!(data, b"descriptor");
			}
			other => panic!("unexpected block {:?}", other),
		}
	}

	#[test]
	fn decode_encode_decode_is_stable() {
		let mut frame = Vec::new();
		write_block(&mut frame, BLK_DATETIME, &1_700_000_000u32.to_be_bytes());
		write_i2np_block(&mut frame, b"\x00\x00\x00\x00\x01\x00\x00\x00\x00x");
		write_padding_block(&mut frame, 3);

		let (blocks, trailing) = parse_frame(&frame);
		assert_eq!(trailing, 0);
		let mut reencoded = Vec::new();
		for raw in &blocks {
			write_block(&mut reencoded, raw.blk_type, raw.payload);
		}
		assert_eq!(reencoded, frame);
		let (again, _) = parse_frame(&reencoded);
		assert_eq!(again, blocks);
	}
}
