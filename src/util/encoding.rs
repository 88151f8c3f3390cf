//! Variable-length and fixed-length integer encodings used by the on-disk
//! file formats

/// Appends `v` to `dst` as a base-128 varint (7 bits per byte, low bits
/// first, high bit set on all bytes but the last).
pub fn marshal_varu64(dst: &mut Vec<u8>, mut v: u64) {
	while v >= 0x80 {
		dst.push((v as u8) | 0x80);
		v >>= 7;
	}
	dst.push(v as u8);
}

/// Decodes a varint from the beginning of `data`.
/// Returns the value and the number of bytes consumed, or None if `data`
/// ends in the middle of a varint or the varint does not fit in 64 bits.
pub fn unmarshal_varu64(data: &[u8]) -> Option<(u64, usize)> {
	let mut v = 0u64;
	for (i, &b) in data.iter().enumerate() {
		if i >= 10 || (i == 9 && b > 1) {
			return None;
		}
		v |= ((b & 0x7f) as u64) << (7 * i as u32);
		if b < 0x80 {
			return Some((v, i + 1));
		}
	}
	None
}

/// Appends `v` to `dst` as 8 little-endian bytes.
pub fn marshal_u64(dst: &mut Vec<u8>, v: u64) {
	dst.extend_from_slice(&v.to_le_bytes());
}

/// Decodes 8 little-endian bytes from the beginning of `data`.
pub fn unmarshal_u64(data: &[u8]) -> Option<u64> {
	if data.len() < 8 {
		return None;
	}
	let mut buf = [0u8; 8];
	buf.copy_from_slice(&data[..8]);
	Some(u64::from_le_bytes(buf))
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn test_varu64_roundtrip() {
		let values = [
			0u64,
			1,
			0x7f,
			0x80,
			0x3fff,
			0x4000,
			12345678,
			u64::from(u32::MAX),
			u64::MAX,
		];
		for &v in values.iter() {
			let mut buf = vec![];
			marshal_varu64(&mut buf, v);
			assert_eq!(unmarshal_varu64(&buf), Some((v, buf.len())));
		}
	}

	#[test]
	fn test_varu64_consumes_prefix_only() {
		let mut buf = vec![];
		marshal_varu64(&mut buf, 300);
		let tail_at = buf.len();
		buf.extend_from_slice(b"tail");
		assert_eq!(unmarshal_varu64(&buf), Some((300, tail_at)));
	}

	#[test]
	fn test_varu64_truncated() {
		let mut buf = vec![];
		marshal_varu64(&mut buf, u64::MAX);
		for cut in 0..buf.len() {
			assert_eq!(unmarshal_varu64(&buf[..cut]), None);
		}
	}

	#[test]
	fn test_varu64_overlong() {
		// 11 continuation bytes never form a valid 64-bit varint
		let buf = [0x80u8; 11];
		assert_eq!(unmarshal_varu64(&buf), None);
	}

	#[test]
	fn test_u64_le() {
		let mut buf = vec![];
		marshal_u64(&mut buf, 0x0102030405060708);
		assert_eq!(buf, vec![8, 7, 6, 5, 4, 3, 2, 1]);
		assert_eq!(unmarshal_u64(&buf), Some(0x0102030405060708));
		assert_eq!(unmarshal_u64(&buf[..7]), None);
	}
}
