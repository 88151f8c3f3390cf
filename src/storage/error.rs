//! Error type of the storage crate

use err_derive::Error;

/// Errors of this crate
#[derive(Debug, Error)]
pub enum Error {
	#[error(display = "delete marker: too many blocks: {}", _0)]
	TooManyMarkerBlocks(u64),

	#[error(display = "delete marker: truncated data: cannot read {} of block {}", _0, _1)]
	TruncatedMarker(&'static str, u64),

	#[error(display = "delete marker: unexpected {} trailing bytes", _0)]
	TrailingMarkerBytes(usize),

	#[error(display = "cannot parse filter {:?}: {}", _0, _1)]
	BadFilter(String, String),

	#[error(display = "IO error: {}", _0)]
	Io(#[error(source)] std::io::Error),

	#[error(display = "JSON error: {}", _0)]
	Json(#[error(source)] serde_json::Error),

	#[error(display = "{}", _0)]
	Message(String),
}
