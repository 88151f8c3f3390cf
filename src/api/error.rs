//! Error type of the internal API, with its HTTP status mapping

use err_derive::Error;
use hyper::StatusCode;

use lumber_util::error::Error as LumberError;

/// Errors of this crate
#[derive(Debug, Error)]
pub enum Error {
	// Category: internal error
	/// Error internal to lumber
	#[error(display = "Internal error: {}", _0)]
	InternalError(#[error(source)] LumberError),

	// Category: bad request
	/// The request is malformed: bad parameter, bad filter, protocol
	/// version mismatch. Nothing changed on the node.
	#[error(display = "Bad request: {}", _0)]
	BadRequest(String),
}

impl Error {
	/// Get the HTTP status code that best represents the meaning of the
	/// error for the client
	pub fn http_status_code(&self) -> StatusCode {
		match self {
			Error::BadRequest(_) => StatusCode::BAD_REQUEST,
			Error::InternalError(_) => StatusCode::INTERNAL_SERVER_ERROR,
		}
	}
}
