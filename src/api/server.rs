use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::{Duration, Instant};

use futures::future::Future;
use hyper::service::{make_service_fn, service_fn};
use hyper::{Body, Request, Response, Server, StatusCode};
use opentelemetry::{Context, KeyValue};
use serde::Serialize;
use tokio::sync::Semaphore;

use lumber_select::{protocol, StorageNodesClient};
use lumber_storage::delete::Filter;
use lumber_storage::partition::Storage;
use lumber_storage::task::parse_tenant_ids_json;
use lumber_storage::task_info::AsyncTaskInfoWithSource;

use crate::error::*;
use crate::metrics::InternalApiMetrics;

/// Requests that wait longer than this on the concurrency gate are
/// recorded in the wait-duration metric
const GATE_WAIT_RECORD_THRESHOLD: Duration = Duration::from_millis(100);

/// HTTP server for the node-internal endpoints: delete task control,
/// task listings, and (on a front-end) the cross-node aggregation
pub struct InternalApiServer {
	storage: Arc<Storage>,
	/// Set on cluster front-ends; when present, /select/async_tasks
	/// aggregates the remote nodes instead of the local storage
	nodes: Option<StorageNodesClient>,
	gate: Semaphore,
	metrics: InternalApiMetrics,
}

impl InternalApiServer {
	pub fn new(
		storage: Arc<Storage>,
		nodes: Option<StorageNodesClient>,
		max_concurrent_requests: usize,
	) -> Arc<Self> {
		Arc::new(Self {
			storage,
			nodes,
			gate: Semaphore::new(max_concurrent_requests),
			metrics: InternalApiMetrics::new(),
		})
	}

	/// Run the server until `shutdown_signal` completes
	pub async fn run(
		self: Arc<Self>,
		bind_addr: SocketAddr,
		shutdown_signal: impl Future<Output = ()>,
	) -> Result<(), lumber_util::error::Error> {
		let this = self.clone();
		let service = make_service_fn(move |_conn| {
			let this = this.clone();
			async move {
				Ok::<_, std::convert::Infallible>(service_fn(move |req| {
					let this = this.clone();
					async move { this.handle_request(req).await }
				}))
			}
		});

		let server = Server::bind(&bind_addr).serve(service);
		info!("Internal API server listening on http://{}", bind_addr);
		server.with_graceful_shutdown(shutdown_signal).await?;

		Ok(())
	}

	async fn handle_request(
		self: Arc<Self>,
		req: Request<Body>,
	) -> Result<Response<Body>, std::convert::Infallible> {
		let start_time = Instant::now();

		// Concurrency gate: requests above the configured limit wait for a
		// free slot. A client that goes away while waiting drops this
		// future, and its wait ends with it.
		let _permit = self
			.gate
			.acquire()
			.await
			.expect("the concurrency gate semaphore is never closed");
		let waited = start_time.elapsed();
		if waited > GATE_WAIT_RECORD_THRESHOLD {
			self.metrics
				.gate_wait_duration
				.record(&Context::current(), waited.as_secs_f64(), &[]);
		}

		let path = req.uri().path().to_string();
		self.metrics.request_counter.add(
			&Context::current(),
			1,
			&[KeyValue::new("path", path.clone())],
		);

		let resp = match self.process(req).await {
			Ok(resp) => {
				debug!("{} {}", resp.status(), path);
				resp
			}
			Err(e) => {
				self.metrics.error_counter.add(
					&Context::current(),
					1,
					&[KeyValue::new("path", path.clone())],
				);
				warn!("Response: error {}, {}", e.http_status_code(), e);
				let mut http_error = Response::new(Body::from(format!("{}\n", e)));
				*http_error.status_mut() = e.http_status_code();
				http_error
			}
		};

		self.metrics.request_duration.record(
			&Context::current(),
			start_time.elapsed().as_secs_f64(),
			&[KeyValue::new("path", path)],
		);
		Ok(resp)
	}

	async fn process(&self, req: Request<Body>) -> Result<Response<Body>, Error> {
		let path = req.uri().path().to_string();
		let params = request_params(req).await?;

		match path.as_str() {
			"/internal/delete/run_task" => self.handle_run_task(&params).await,
			"/internal/delete/stop_task" => self.handle_stop_task(&params).await,
			"/internal/delete/active_tasks" => self.handle_active_tasks(&params),
			"/internal/async_tasks" => self.handle_async_tasks(&params),
			"/select/async_tasks" => self.handle_select_async_tasks().await,
			_ => Err(Error::BadRequest(format!(
				"unsupported endpoint requested: {}",
				path
			))),
		}
	}

	async fn handle_run_task(&self, params: &Params) -> Result<Response<Body>, Error> {
		check_protocol_version(params, protocol::DELETE_RUN_TASK_PROTOCOL_VERSION)?;

		let task_id = params.required("task_id")?;
		let timestamp = params.required_i64("timestamp")?;

		let tenant_ids_str = params.get("tenant_ids");
		let tenant_ids = parse_tenant_ids_json(tenant_ids_str).map_err(|e| {
			Error::BadRequest(format!(
				"cannot parse tenant_ids={:?}: {}",
				tenant_ids_str, e
			))
		})?;

		let filter = Filter::parse(params.get("filter"))
			.map_err(|e| Error::BadRequest(e.to_string()))?;

		self.storage
			.run_delete_task(task_id, timestamp, &tenant_ids, &filter)
			.await
			.map_err(|e| Error::BadRequest(e.to_string()))?;

		Ok(empty_ok())
	}

	async fn handle_stop_task(&self, params: &Params) -> Result<Response<Body>, Error> {
		check_protocol_version(params, protocol::DELETE_STOP_TASK_PROTOCOL_VERSION)?;

		let task_id = params.required("task_id")?;
		self.storage
			.stop_delete_task(task_id)
			.await
			.map_err(|e| Error::BadRequest(e.to_string()))?;

		Ok(empty_ok())
	}

	fn handle_active_tasks(&self, params: &Params) -> Result<Response<Body>, Error> {
		check_protocol_version(params, protocol::DELETE_ACTIVE_TASKS_PROTOCOL_VERSION)?;
		json_response(&self.storage.active_delete_tasks())
	}

	fn handle_async_tasks(&self, params: &Params) -> Result<Response<Body>, Error> {
		check_protocol_version(params, protocol::ASYNC_TASKS_PROTOCOL_VERSION)?;

		let tasks: Vec<AsyncTaskInfoWithSource> = self
			.storage
			.list_async_tasks()
			.into_iter()
			.map(|info| AsyncTaskInfoWithSource {
				info,
				storage: String::new(),
			})
			.collect();
		json_response(&tasks)
	}

	/// The outward-facing task list: on a front-end this aggregates every
	/// configured storage node (all-or-nothing), on a plain storage node
	/// it serves the local tasks
	async fn handle_select_async_tasks(&self) -> Result<Response<Body>, Error> {
		let tasks = match &self.nodes {
			Some(nodes) => nodes
				.list_async_tasks()
				.await
				.map_err(Error::InternalError)?,
			None => self
				.storage
				.list_async_tasks()
				.into_iter()
				.map(|info| AsyncTaskInfoWithSource {
					info,
					storage: String::new(),
				})
				.collect(),
		};
		json_response(&tasks)
	}
}

/// Decoded request parameters, merged from the query string and (for
/// form-encoded requests) the body, the later taking precedence
struct Params(HashMap<String, String>);

impl Params {
	fn get(&self, name: &str) -> &str {
		self.0.get(name).map(String::as_str).unwrap_or("")
	}

	fn required(&self, name: &str) -> Result<&str, Error> {
		match self.get(name) {
			"" => Err(Error::BadRequest(format!("missing {} arg", name))),
			value => Ok(value),
		}
	}

	fn required_i64(&self, name: &str) -> Result<i64, Error> {
		let value = self.required(name)?;
		value.parse().map_err(|_| {
			Error::BadRequest(format!("cannot parse {}={:?} as integer", name, value))
		})
	}
}

async fn request_params(req: Request<Body>) -> Result<Params, Error> {
	let mut map = HashMap::new();

	if let Some(query) = req.uri().query() {
		for (k, v) in form_urlencoded::parse(query.as_bytes()) {
			map.insert(k.into_owned(), v.into_owned());
		}
	}

	let is_form = req
		.headers()
		.get(http::header::CONTENT_TYPE)
		.and_then(|v| v.to_str().ok())
		.map(|v| v.starts_with("application/x-www-form-urlencoded"))
		.unwrap_or(false);
	if is_form {
		let body = hyper::body::to_bytes(req.into_body())
			.await
			.map_err(|e| Error::InternalError(e.into()))?;
		for (k, v) in form_urlencoded::parse(&body) {
			map.insert(k.into_owned(), v.into_owned());
		}
	}

	Ok(Params(map))
}

fn check_protocol_version(params: &Params, expected: &str) -> Result<(), Error> {
	let version = params.get("version");
	if version != expected {
		return Err(Error::BadRequest(format!(
			"unexpected protocol version={:?}; want {:?}; the most likely cause of this error is different versions of lumber cluster components; make sure all components run the same release version",
			version, expected
		)));
	}
	Ok(())
}

fn empty_ok() -> Response<Body> {
	Response::new(Body::empty())
}

fn json_response<T: Serialize>(value: &T) -> Result<Response<Body>, Error> {
	let data = serde_json::to_vec(value).map_err(|e| Error::InternalError(e.into()))?;
	Response::builder()
		.status(StatusCode::OK)
		.header(http::header::CONTENT_TYPE, "application/json")
		.body(Body::from(data))
		.map_err(|e| Error::InternalError(e.into()))
}

#[cfg(test)]
mod tests {
	use super::*;

	use lumber_storage::delete::NoopDeleteEngine;
	use lumber_storage::task::TaskStatus;

	fn test_server() -> (mktemp::Temp, Arc<InternalApiServer>, Arc<Storage>) {
		let dir = mktemp::Temp::new_dir().unwrap();
		let storage = Storage::open(dir.to_path_buf(), Arc::new(NoopDeleteEngine)).unwrap();
		storage.create_partition("20240101").unwrap();
		let server = InternalApiServer::new(storage.clone(), None, 100);
		(dir, server, storage)
	}

	fn get(uri: &str) -> Request<Body> {
		Request::builder()
			.method("GET")
			.uri(uri)
			.body(Body::empty())
			.unwrap()
	}

	#[tokio::test]
	async fn test_run_task_roundtrip() {
		let (_dir, server, storage) = test_server();

		let uri = format!(
			"/internal/delete/run_task?version={}&task_id=t1&timestamp=123&filter=app%3Afoo",
			protocol::DELETE_RUN_TASK_PROTOCOL_VERSION
		);
		let resp = server.process(get(&uri)).await.unwrap();
		assert_eq!(resp.status(), StatusCode::OK);

		let ptws = storage.partitions_snapshot();
		let tasks = ptws[0].tasks.snapshot();
		assert_eq!(tasks.len(), 1);
		assert_eq!(tasks[0].status, TaskStatus::Pending);
		assert_eq!(tasks[0].payload.query, "app:foo");
	}

	#[tokio::test]
	async fn test_protocol_version_mismatch() {
		let (_dir, server, _storage) = test_server();

		let err = server
			.process(get(
				"/internal/delete/run_task?version=v0&task_id=t1&timestamp=1&filter=x",
			))
			.await
			.unwrap_err();
		assert_eq!(err.http_status_code(), StatusCode::BAD_REQUEST);
		assert!(err.to_string().contains("protocol version"));
	}

	#[tokio::test]
	async fn test_missing_and_malformed_args() {
		let (_dir, server, storage) = test_server();

		let uri = format!(
			"/internal/delete/run_task?version={}&timestamp=1&filter=x",
			protocol::DELETE_RUN_TASK_PROTOCOL_VERSION
		);
		let err = server.process(get(&uri)).await.unwrap_err();
		assert!(err.to_string().contains("missing task_id arg"));

		let uri = format!(
			"/internal/delete/run_task?version={}&task_id=t1&timestamp=nope&filter=x",
			protocol::DELETE_RUN_TASK_PROTOCOL_VERSION
		);
		let err = server.process(get(&uri)).await.unwrap_err();
		assert!(err.to_string().contains("timestamp"));

		let uri = format!(
			"/internal/delete/run_task?version={}&task_id=t1&timestamp=1&filter=x&tenant_ids=oops",
			protocol::DELETE_RUN_TASK_PROTOCOL_VERSION
		);
		let err = server.process(get(&uri)).await.unwrap_err();
		assert!(err.to_string().contains("tenant_ids"));

		// Malformed input changed nothing on the node
		let ptws = storage.partitions_snapshot();
		assert!(ptws[0].tasks.snapshot().is_empty());
	}

	#[tokio::test]
	async fn test_stop_then_listings() {
		let (_dir, server, _storage) = test_server();

		let uri = format!(
			"/internal/delete/run_task?version={}&task_id=t1&timestamp=1&filter=x",
			protocol::DELETE_RUN_TASK_PROTOCOL_VERSION
		);
		server.process(get(&uri)).await.unwrap();

		let uri = format!(
			"/internal/delete/active_tasks?version={}",
			protocol::DELETE_ACTIVE_TASKS_PROTOCOL_VERSION
		);
		let resp = server.process(get(&uri)).await.unwrap();
		let body = hyper::body::to_bytes(resp.into_body()).await.unwrap();
		let active: serde_json::Value = serde_json::from_slice(&body).unwrap();
		assert_eq!(active[0]["taskID"], "t1");

		let uri = format!(
			"/internal/delete/stop_task?version={}&task_id=t1",
			protocol::DELETE_STOP_TASK_PROTOCOL_VERSION
		);
		let resp = server.process(get(&uri)).await.unwrap();
		assert_eq!(resp.status(), StatusCode::OK);

		// Stopping an unknown task is a client error
		let uri = format!(
			"/internal/delete/stop_task?version={}&task_id=unknown",
			protocol::DELETE_STOP_TASK_PROTOCOL_VERSION
		);
		let err = server.process(get(&uri)).await.unwrap_err();
		assert_eq!(err.http_status_code(), StatusCode::BAD_REQUEST);

		let uri = format!(
			"/internal/async_tasks?version={}",
			protocol::ASYNC_TASKS_PROTOCOL_VERSION
		);
		let resp = server.process(get(&uri)).await.unwrap();
		let body = hyper::body::to_bytes(resp.into_body()).await.unwrap();
		let tasks: serde_json::Value = serde_json::from_slice(&body).unwrap();
		assert_eq!(tasks[0]["status"], "error");
		assert_eq!(tasks[0]["error"], "stopped");
	}

	#[tokio::test]
	async fn test_unknown_endpoint() {
		let (_dir, server, _storage) = test_server();
		let err = server.process(get("/internal/nope")).await.unwrap_err();
		assert!(err.to_string().contains("unsupported endpoint"));
	}
}
