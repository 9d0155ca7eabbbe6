//! Wire header for the Multiplexer (C8). Every block sent across the network
//! is preceded by this fixed, little-endian header; `size == 0` signals close
//! on the `(stream_id, sender_rank)` substream.
//!
//! Worker-per-rank simplification: this implementation gives every compute
//! worker its own `Group` rank (so `workers_per_host` hosts sharing one
//! physical connection, as the wire format's `*_local_worker` fields allow
//! for, collapses to one worker per rank here) — see DESIGN.md.

use crate::err::{Error, Result};

/// One-byte prefix on every transport datagram, ahead of anything else on the
/// wire, so a Group's single raw-receive loop per peer can route each
/// arrival to its own collectives or to stream dispatch without either
/// side racing the other for the same inbound message.
pub const TAG_COLLECTIVE: u8 = 0;
pub const TAG_STREAM: u8 = 1;

pub const MAGIC_CAT: u8 = 1;
pub const MAGIC_MIX: u8 = 2;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum StreamOrder {
	Cat,
	Mix,
}

impl StreamOrder {
	fn magic(self) -> u8 {
		match self {
			StreamOrder::Cat => MAGIC_CAT,
			StreamOrder::Mix => MAGIC_MIX,
		}
	}

	fn from_magic(magic: u8) -> Result<Self> {
		match magic {
			MAGIC_CAT => Ok(StreamOrder::Cat),
			MAGIC_MIX => Ok(StreamOrder::Mix),
			other => Err(Error::UnknownMagic(other)),
		}
	}
}

#[derive(Clone, Copy, Debug)]
pub struct BlockHeader {
	pub order: StreamOrder,
	pub size: u64,
	pub first_item: u64,
	pub num_items: u64,
	pub stream_id: u64,
	pub sender_rank: u64,
	pub receiver_local_worker: u64,
	pub sender_local_worker: u64,
}

impl BlockHeader {
	pub const ENCODED_LEN: usize = 1 + 8 * 7;

	pub fn close(order: StreamOrder, stream_id: u64, sender_rank: u64) -> Self {
		Self {
			order,
			size: 0,
			first_item: 0,
			num_items: 0,
			stream_id,
			sender_rank,
			receiver_local_worker: 0,
			sender_local_worker: 0,
		}
	}

	pub fn is_close(&self) -> bool {
		self.size == 0
	}

	pub fn encode(&self, out: &mut Vec<u8>) {
		out.push(self.order.magic());
		out.extend_from_slice(&self.size.to_le_bytes());
		out.extend_from_slice(&self.first_item.to_le_bytes());
		out.extend_from_slice(&self.num_items.to_le_bytes());
		out.extend_from_slice(&self.stream_id.to_le_bytes());
		out.extend_from_slice(&self.sender_rank.to_le_bytes());
		out.extend_from_slice(&self.receiver_local_worker.to_le_bytes());
		out.extend_from_slice(&self.sender_local_worker.to_le_bytes());
	}

	pub fn decode(input: &[u8]) -> Result<Self> {
		if input.len() < Self::ENCODED_LEN {
			return Err(Error::TruncatedHeader {
				expected: Self::ENCODED_LEN,
				actual: input.len(),
			});
		}
		let order = StreamOrder::from_magic(input[0])?;
		let mut u64_at = |offset: usize| -> u64 {
			let mut buf = [0u8; 8];
			buf.copy_from_slice(&input[offset..offset + 8]);
			u64::from_le_bytes(buf)
		};
		Ok(Self {
			order,
			size: u64_at(1),
			first_item: u64_at(9),
			num_items: u64_at(17),
			stream_id: u64_at(25),
			sender_rank: u64_at(33),
			receiver_local_worker: u64_at(41),
			sender_local_worker: u64_at(49),
		})
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn encode_decode_round_trips_every_field() {
		let header = BlockHeader {
			order: StreamOrder::Mix,
			size: 128,
			first_item: 7,
			num_items: 3,
			stream_id: 99,
			sender_rank: 2,
			receiver_local_worker: 0,
			sender_local_worker: 0,
		};
		let mut bytes = Vec::new();
		header.encode(&mut bytes);
		assert_eq!(bytes.len(), BlockHeader::ENCODED_LEN);
		let decoded = BlockHeader::decode(&bytes).unwrap();
		assert_eq!(decoded.order, StreamOrder::Mix);
		assert_eq!(decoded.size, 128);
		assert_eq!(decoded.first_item, 7);
		assert_eq!(decoded.num_items, 3);
		assert_eq!(decoded.stream_id, 99);
		assert_eq!(decoded.sender_rank, 2);
		assert!(!decoded.is_close());
	}

	#[test]
	fn close_header_decodes_with_zero_size() {
		let header = BlockHeader::close(StreamOrder::Cat, 5, 1);
		assert!(header.is_close());
		let mut bytes = Vec::new();
		header.encode(&mut bytes);
		let decoded = BlockHeader::decode(&bytes).unwrap();
		assert!(decoded.is_close());
		assert_eq!(decoded.order, StreamOrder::Cat);
		assert_eq!(decoded.stream_id, 5);
		assert_eq!(decoded.sender_rank, 1);
	}

	#[test]
	fn decode_rejects_a_truncated_header() {
		let header = BlockHeader::close(StreamOrder::Mix, 1, 0);
		let mut bytes = Vec::new();
		header.encode(&mut bytes);
		bytes.truncate(BlockHeader::ENCODED_LEN - 1);
		let err = BlockHeader::decode(&bytes).unwrap_err();
		match err {
			Error::TruncatedHeader { expected, actual } => {
				assert_eq!(expected, BlockHeader::ENCODED_LEN);
				assert_eq!(actual, BlockHeader::ENCODED_LEN - 1);
			}
			other => panic!("expected TruncatedHeader, got {other:?}"),
		}
	}

	#[test]
	fn decode_rejects_an_unknown_magic_byte() {
		let mut bytes = vec![0xffu8];
		bytes.extend_from_slice(&[0u8; BlockHeader::ENCODED_LEN - 1]);
		let err = BlockHeader::decode(&bytes).unwrap_err();
		assert!(matches!(err, Error::UnknownMagic(0xff)));
	}
}
