use opentelemetry::{global, metrics::*};

/// InternalApiMetrics references all counters used by the internal API
pub struct InternalApiMetrics {
	pub(crate) request_counter: Counter<u64>,
	pub(crate) error_counter: Counter<u64>,
	pub(crate) request_duration: Histogram<f64>,
	pub(crate) gate_wait_duration: Histogram<f64>,
}

impl InternalApiMetrics {
	pub fn new() -> Self {
		let meter = global::meter("lumber_api/internal");
		Self {
			request_counter: meter
				.u64_counter("api.internal_requests")
				.with_description("Number of requests served on /internal/* endpoints")
				.init(),
			error_counter: meter
				.u64_counter("api.internal_request_errors")
				.with_description("Number of /internal/* requests that returned an error")
				.init(),
			request_duration: meter
				.f64_histogram("api.internal_request_duration")
				.with_description("Duration of /internal/* requests")
				.init(),
			gate_wait_duration: meter
				.f64_histogram("api.internal_gate_wait_duration")
				.with_description(
					"Wait duration of requests that spent more than 100 ms in the concurrency gate",
				)
				.init(),
		}
	}
}

impl Default for InternalApiMetrics {
	fn default() -> Self {
		Self::new()
	}
}
