//! Per-part delete markers: a sorted block-id → row-mask map

use std::path::Path;
use std::sync::Arc;

use lumber_util::encoding::{marshal_u64, marshal_varu64, unmarshal_u64, unmarshal_varu64};
use lumber_util::fs::must_write_atomic;

use crate::bool_rle::BoolRle;
use crate::error::Error;
use crate::partition::PartWrapper;

pub const ROW_DELETE_FILENAME: &str = "row_delete.dat";

/// Keeps the per-block delete markers of one part
#[derive(Clone, Debug, Default, PartialEq)]
pub struct DeleteMarker {
	/// Sorted block sequence numbers that have marker data
	block_ids: Vec<u64>,
	/// Same length and order as block_ids
	rows: Vec<BoolRle>,
}

impl DeleteMarker {
	pub fn new() -> Self {
		Default::default()
	}

	pub fn is_empty(&self) -> bool {
		self.block_ids.is_empty()
	}

	pub fn len(&self) -> usize {
		self.block_ids.len()
	}

	pub fn block_ids(&self) -> &[u64] {
		&self.block_ids
	}

	/// Returns the marked rows of the given block sequence number
	pub fn get_marked_rows(&self, block_id: u64) -> Option<&BoolRle> {
		match self.block_ids.binary_search(&block_id) {
			Ok(idx) => Some(&self.rows[idx]),
			Err(_) => None,
		}
	}

	/// Add a block with its row mask. If the block already has a mask the
	/// two are unioned, so no previously marked row is ever lost.
	pub fn add_block(&mut self, block_id: u64, rle: BoolRle) {
		match self.block_ids.binary_search(&block_id) {
			Ok(idx) => {
				self.rows[idx] = self.rows[idx].union(&rle);
			}
			Err(idx) => {
				self.block_ids.insert(idx, block_id);
				self.rows.insert(idx, rle);
			}
		}
	}

	/// Merge another marker into this one. Both block-id lists are sorted,
	/// so this is a plain two-pointer merge; masks of blocks present on
	/// both sides are unioned.
	pub fn merge(&mut self, other: &DeleteMarker) {
		if other.block_ids.is_empty() {
			return;
		}
		if self.block_ids.is_empty() {
			self.block_ids = other.block_ids.clone();
			self.rows = other.rows.clone();
			return;
		}

		let mut merged_ids = Vec::with_capacity(self.block_ids.len() + other.block_ids.len());
		let mut merged_rows = Vec::with_capacity(self.rows.len() + other.rows.len());

		let mut i = 0;
		let mut j = 0;
		while i < self.block_ids.len() && j < other.block_ids.len() {
			let id_a = self.block_ids[i];
			let id_b = other.block_ids[j];
			if id_a == id_b {
				merged_ids.push(id_a);
				merged_rows.push(self.rows[i].union(&other.rows[j]));
				i += 1;
				j += 1;
			} else if id_a < id_b {
				merged_ids.push(id_a);
				merged_rows.push(self.rows[i].clone());
				i += 1;
			} else {
				merged_ids.push(id_b);
				merged_rows.push(other.rows[j].clone());
				j += 1;
			}
		}
		merged_ids.extend_from_slice(&self.block_ids[i..]);
		merged_rows.extend_from_slice(&self.rows[i..]);
		merged_ids.extend_from_slice(&other.block_ids[j..]);
		merged_rows.extend_from_slice(&other.rows[j..]);

		self.block_ids = merged_ids;
		self.rows = merged_rows;
	}

	/// Serializes the marker to `dst`.
	/// Format: [num_blocks: varint] followed, for each block, by
	/// [block_id: u64 little-endian][rle_len: varint][rle_data: bytes]
	pub fn marshal(&self, dst: &mut Vec<u8>) {
		marshal_varu64(dst, self.block_ids.len() as u64);

		for (block_id, rle) in self.block_ids.iter().zip(self.rows.iter()) {
			marshal_u64(dst, *block_id);

			let rle_data = rle.as_bytes();
			marshal_varu64(dst, rle_data.len() as u64);
			dst.extend_from_slice(rle_data);
		}
	}

	/// Parses marker data. Corrupt input (truncation anywhere, an absurd
	/// block count, trailing bytes) yields a typed error.
	pub fn unmarshal(data: &[u8]) -> Result<DeleteMarker, Error> {
		let mut res = DeleteMarker::new();
		if data.is_empty() {
			return Ok(res);
		}

		let (num_blocks, n) =
			unmarshal_varu64(data).ok_or(Error::TruncatedMarker("block count", 0))?;
		let mut pos = n;

		// sanity guard against corrupt data
		if num_blocks > 1 << 31 {
			return Err(Error::TooManyMarkerBlocks(num_blocks));
		}

		for i in 0..num_blocks {
			let block_id =
				unmarshal_u64(&data[pos..]).ok_or(Error::TruncatedMarker("block_id", i))?;
			pos += 8;

			let (rle_len, n) =
				unmarshal_varu64(&data[pos..]).ok_or(Error::TruncatedMarker("rle_len", i))?;
			pos += n;

			let end = pos
				.checked_add(rle_len as usize)
				.filter(|end| *end <= data.len())
				.ok_or(Error::TruncatedMarker("rle_data", i))?;
			res.block_ids.push(block_id);
			res.rows.push(BoolRle::from_bytes(data[pos..end].to_vec()));
			pos = end;
		}

		if pos != data.len() {
			return Err(Error::TrailingMarkerBytes(data.len() - pos));
		}
		Ok(res)
	}
}

/// Write `additions` into the part's delete marker and persist the result.
/// The new snapshot is published for readers before the file write: a crash
/// in between loses the additions on disk only, which is fine because the
/// part's task_seq is advanced after the write, so a restarted worker
/// re-applies them.
///
/// The single task worker serializes writers; readers access the snapshot
/// lock-free through the part's atomic pointer.
pub async fn flush_delete_marker(pw: &PartWrapper, additions: &DeleteMarker, seq: u64) {
	if additions.is_empty() {
		return;
	}

	// Copy-on-write: the current snapshot is never mutated in place
	let current = pw.part.delete_marker();
	let mut merged = (*current).clone();
	merged.merge(additions);
	let merged = Arc::new(merged);

	// Publish the new snapshot for readers
	pw.part.store_delete_marker(merged.clone());

	// Persist. In-memory parts have no directory; their markers live in
	// the snapshot only and are rebuilt by the worker after a restart.
	if let Some(dir) = pw.part.path.as_ref() {
		let mut buf = vec![];
		merged.marshal(&mut buf);
		must_write_atomic(&dir.join(ROW_DELETE_FILENAME), &buf).await;
	}

	pw.store_task_seq(seq);
}

/// Read a part's delete marker back from its directory. A missing file is
/// an empty marker; an unreadable or corrupt file aborts the process, since
/// serving reads with a partial delete set would resurrect deleted rows.
pub fn load_delete_marker(part_dir: &Path) -> DeleteMarker {
	let path = part_dir.join(ROW_DELETE_FILENAME);
	let data = match std::fs::read(&path) {
		Ok(data) => data,
		Err(e) if e.kind() == std::io::ErrorKind::NotFound => return DeleteMarker::new(),
		Err(e) => {
			error!("FATAL: {}: cannot read delete marker data: {}", path.display(), e);
			std::process::abort();
		}
	};
	match DeleteMarker::unmarshal(&data) {
		Ok(dm) => dm,
		Err(e) => {
			error!(
				"FATAL: {}: cannot unmarshal delete marker data: {}",
				path.display(),
				e
			);
			std::process::abort();
		}
	}
}

#[cfg(test)]
mod tests {
	use super::*;
	use crate::bool_rle::BoolRle;

	fn mask(rows: u64, marked: &[u64]) -> BoolRle {
		BoolRle::from_marked_rows(rows, marked)
	}

	#[test]
	fn test_add_block_sorted_insert() {
		let mut dm = DeleteMarker::new();
		dm.add_block(7, mask(4, &[0]));
		dm.add_block(2, mask(4, &[1]));
		dm.add_block(5, mask(4, &[2]));
		assert_eq!(dm.block_ids(), &[2, 5, 7]);
		assert!(dm.get_marked_rows(5).unwrap().is_marked(2));
		assert!(dm.get_marked_rows(3).is_none());
	}

	#[test]
	fn test_add_block_unions_existing() {
		let mut dm = DeleteMarker::new();
		dm.add_block(1, mask(5, &[0, 2]));
		dm.add_block(1, mask(5, &[2, 4]));
		assert_eq!(dm.len(), 1);
		let rows = dm.get_marked_rows(1).unwrap();
		assert_eq!(rows, &mask(5, &[0, 2, 4]));

		// Adding the same mask twice changes nothing
		let before = dm.clone();
		dm.add_block(1, mask(5, &[2, 4]));
		assert_eq!(dm, before);
	}

	#[test]
	fn test_merge() {
		let mut a = DeleteMarker::new();
		a.add_block(1, mask(3, &[0]));
		a.add_block(4, mask(3, &[1]));
		let mut b = DeleteMarker::new();
		b.add_block(2, mask(3, &[2]));
		b.add_block(4, mask(3, &[2]));

		let mut ab = a.clone();
		ab.merge(&b);
		assert_eq!(ab.block_ids(), &[1, 2, 4]);
		assert_eq!(ab.get_marked_rows(4).unwrap(), &mask(3, &[1, 2]));

		// Commutative on block-id sets and row unions
		let mut ba = b.clone();
		ba.merge(&a);
		assert_eq!(ab, ba);

		// Associative
		let mut c = DeleteMarker::new();
		c.add_block(1, mask(3, &[2]));
		let mut ab_c = ab.clone();
		ab_c.merge(&c);
		let mut bc = b.clone();
		bc.merge(&c);
		let mut a_bc = a.clone();
		a_bc.merge(&bc);
		assert_eq!(ab_c, a_bc);
	}

	#[test]
	fn test_merge_empty() {
		let mut a = DeleteMarker::new();
		a.add_block(1, mask(2, &[1]));
		let orig = a.clone();
		a.merge(&DeleteMarker::new());
		assert_eq!(a, orig);

		let mut empty = DeleteMarker::new();
		empty.merge(&orig);
		assert_eq!(empty, orig);
	}

	#[test]
	fn test_marshal_roundtrip() {
		let mut dm = DeleteMarker::new();
		dm.add_block(1, mask(3, &[1]));
		dm.add_block(100, mask(8192, &[0, 8191]));
		dm.add_block(u64::MAX, mask(1, &[0]));

		let mut buf = vec![];
		dm.marshal(&mut buf);
		let back = DeleteMarker::unmarshal(&buf).unwrap();
		assert_eq!(back, dm);
	}

	#[test]
	fn test_marshal_roundtrip_empty() {
		let dm = DeleteMarker::new();
		let mut buf = vec![];
		dm.marshal(&mut buf);
		let back = DeleteMarker::unmarshal(&buf).unwrap();
		assert!(back.is_empty());

		// An empty byte slice is also an empty marker
		assert!(DeleteMarker::unmarshal(&[]).unwrap().is_empty());
	}

	#[test]
	fn test_unmarshal_too_many_blocks() {
		let mut buf = vec![];
		lumber_util::encoding::marshal_varu64(&mut buf, (1 << 31) + 1);
		match DeleteMarker::unmarshal(&buf) {
			Err(Error::TooManyMarkerBlocks(n)) => assert_eq!(n, (1 << 31) + 1),
			other => panic!("unexpected result: {:?}", other),
		}
	}

	#[test]
	fn test_unmarshal_truncated() {
		let mut dm = DeleteMarker::new();
		dm.add_block(3, mask(4, &[1, 2]));
		dm.add_block(9, mask(4, &[0]));
		let mut buf = vec![];
		dm.marshal(&mut buf);

		// Any proper prefix of a non-empty marshalled marker is an error
		for cut in 1..buf.len() {
			assert!(
				DeleteMarker::unmarshal(&buf[..cut]).is_err(),
				"prefix of len {} was accepted",
				cut
			);
		}
	}

	#[test]
	fn test_unmarshal_trailing_bytes() {
		let mut dm = DeleteMarker::new();
		dm.add_block(1, mask(2, &[0]));
		let mut buf = vec![];
		dm.marshal(&mut buf);
		buf.push(0x55);
		match DeleteMarker::unmarshal(&buf) {
			Err(Error::TrailingMarkerBytes(n)) => assert_eq!(n, 1),
			other => panic!("unexpected result: {:?}", other),
		}
	}
}
