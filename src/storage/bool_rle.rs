//! Run-length encoded boolean vectors, the row masks of delete markers

use lumber_util::encoding::{marshal_varu64, unmarshal_varu64};

/// A boolean vector over the rows of one block, stored as alternating
/// varint run lengths. The first run holds `false` values and may have
/// length zero; `true` marks a deleted row.
#[derive(Clone, Default, PartialEq, Eq)]
pub struct BoolRle(Vec<u8>);

impl BoolRle {
	pub fn new() -> Self {
		Self(Vec::new())
	}

	/// Wrap raw RLE bytes, e.g. read back from a delete marker file.
	/// The bytes are opaque to the marker layer and are not validated.
	pub fn from_bytes(data: Vec<u8>) -> Self {
		Self(data)
	}

	pub fn as_bytes(&self) -> &[u8] {
		&self.0
	}

	pub fn is_empty(&self) -> bool {
		self.0.is_empty()
	}

	/// Build a mask of `row_count` rows with the given rows marked.
	/// `marked` must be sorted and within bounds.
	pub fn from_marked_rows(row_count: u64, marked: &[u64]) -> Self {
		let mut b = RleBuilder::default();
		let mut pos = 0u64;
		for &row in marked {
			debug_assert!(row >= pos && row < row_count);
			if row > pos {
				b.push(false, row - pos);
			}
			b.push(true, 1);
			pos = row + 1;
		}
		if pos < row_count {
			b.push(false, row_count - pos);
		}
		b.finish()
	}

	/// Number of rows covered by this mask
	pub fn len(&self) -> u64 {
		self.runs().map(|(_, n)| n).sum()
	}

	/// Number of marked rows
	pub fn marked_count(&self) -> u64 {
		self.runs().filter(|&(v, _)| v).map(|(_, n)| n).sum()
	}

	/// Whether the given row is marked; rows beyond the mask read as false
	pub fn is_marked(&self, row: u64) -> bool {
		let mut pos = 0u64;
		for (v, n) in self.runs() {
			pos += n;
			if row < pos {
				return v;
			}
		}
		false
	}

	/// Iterator over (value, run length) pairs
	pub fn runs(&self) -> Runs<'_> {
		Runs {
			data: &self.0,
			next_value: false,
		}
	}

	/// Positionwise OR of two masks. The result covers the longer of the
	/// two inputs; positions absent from the shorter one read as false.
	pub fn union(&self, other: &BoolRle) -> BoolRle {
		let mut b = RleBuilder::default();
		let mut a_runs = self.runs();
		let mut o_runs = other.runs();
		let (mut av, mut an) = (false, 0u64);
		let (mut ov, mut on) = (false, 0u64);

		loop {
			if an == 0 {
				while let Some((v, n)) = a_runs.next() {
					if n > 0 {
						av = v;
						an = n;
						break;
					}
				}
			}
			if on == 0 {
				while let Some((v, n)) = o_runs.next() {
					if n > 0 {
						ov = v;
						on = n;
						break;
					}
				}
			}

			match (an > 0, on > 0) {
				(true, true) => {
					let step = an.min(on);
					b.push(av || ov, step);
					an -= step;
					on -= step;
				}
				(true, false) => {
					b.push(av, an);
					an = 0;
				}
				(false, true) => {
					b.push(ov, on);
					on = 0;
				}
				(false, false) => break,
			}
		}

		b.finish()
	}
}

impl std::fmt::Debug for BoolRle {
	fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
		write!(f, "BoolRle[")?;
		for (i, (v, n)) in self.runs().enumerate() {
			if i > 0 {
				write!(f, " ")?;
			}
			write!(f, "{}x{}", if v { "t" } else { "f" }, n)?;
		}
		write!(f, "]")
	}
}

pub struct Runs<'a> {
	data: &'a [u8],
	next_value: bool,
}

impl<'a> Iterator for Runs<'a> {
	type Item = (bool, u64);

	fn next(&mut self) -> Option<(bool, u64)> {
		let (n, sz) = unmarshal_varu64(self.data)?;
		self.data = &self.data[sz..];
		let v = self.next_value;
		self.next_value = !v;
		Some((v, n))
	}
}

/// Accumulates runs, coalescing adjacent runs of equal value, and emits
/// the canonical encoding (so that equal masks have equal bytes).
#[derive(Default)]
struct RleBuilder {
	runs: Vec<(bool, u64)>,
}

impl RleBuilder {
	fn push(&mut self, v: bool, n: u64) {
		if n == 0 {
			return;
		}
		if let Some(last) = self.runs.last_mut() {
			if last.0 == v {
				last.1 += n;
				return;
			}
		}
		self.runs.push((v, n));
	}

	fn finish(self) -> BoolRle {
		let mut data = vec![];
		let mut expect = false;
		for (v, n) in self.runs {
			if v != expect {
				// The encoding starts with a false run: emit an empty one
				marshal_varu64(&mut data, 0);
				expect = !expect;
			}
			marshal_varu64(&mut data, n);
			expect = !expect;
		}
		BoolRle(data)
	}
}
