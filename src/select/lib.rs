//! Cluster front-end client for lumber storage nodes
#[macro_use]
extern crate tracing;

pub mod protocol;

use futures::stream::{FuturesUnordered, StreamExt};
use hyper::{Body, Client, Request, StatusCode};

use lumber_storage::task_info::AsyncTaskInfoWithSource;
use lumber_util::error::Error;

/// A remote storage node the front-end aggregates
struct StorageNode {
	addr: String,
	client: Client<hyper::client::HttpConnector>,
}

/// Client for the set of storage nodes behind a cluster front-end
pub struct StorageNodesClient {
	nodes: Vec<StorageNode>,
}

impl StorageNodesClient {
	/// `addrs` are base URLs such as `http://10.0.0.1:9428`
	pub fn new(addrs: &[String]) -> Self {
		let nodes = addrs
			.iter()
			.map(|addr| StorageNode {
				addr: addr.trim_end_matches('/').to_string(),
				client: Client::new(),
			})
			.collect();
		Self { nodes }
	}

	pub fn is_empty(&self) -> bool {
		self.nodes.is_empty()
	}

	/// Gather the async tasks of every storage node. The nodes are queried
	/// concurrently; the first error aborts the whole call and drops the
	/// outstanding request futures, which cancels them. Partial results
	/// are never returned.
	pub async fn list_async_tasks(&self) -> Result<Vec<AsyncTaskInfoWithSource>, Error> {
		// Fast path for a mis-configured front-end
		if self.nodes.is_empty() {
			return Ok(vec![]);
		}

		let mut requests = self
			.nodes
			.iter()
			.map(|node| node.get_async_tasks())
			.collect::<FuturesUnordered<_>>();

		let mut result = vec![];
		while let Some(tasks) = requests.next().await {
			match tasks {
				Ok(tasks) => result.extend(tasks),
				Err(e) => {
					debug!("async task aggregation aborted: {}", e);
					return Err(e);
				}
			}
		}
		Ok(result)
	}
}

impl StorageNode {
	async fn get_async_tasks(&self) -> Result<Vec<AsyncTaskInfoWithSource>, Error> {
		let uri = format!(
			"{}/internal/async_tasks?version={}",
			self.addr,
			protocol::ASYNC_TASKS_PROTOCOL_VERSION
		);
		let req = Request::builder()
			.method("GET")
			.uri(&uri)
			.body(Body::empty())?;

		let resp = self.client.request(req).await?;
		let status = resp.status();
		let body = hyper::body::to_bytes(resp.into_body()).await?;

		if status != StatusCode::OK {
			return Err(Error::Message(format!(
				"unexpected status code for {:?}: {}; response: {:?}",
				uri,
				status,
				String::from_utf8_lossy(&body)
			)));
		}

		let mut tasks: Vec<AsyncTaskInfoWithSource> =
			serde_json::from_slice(&body).map_err(|e| {
				Error::Message(format!(
					"cannot decode async tasks response from {:?}: {}",
					uri, e
				))
			})?;

		// Attach the origin address when the node did not set one
		for t in tasks.iter_mut() {
			if t.storage.is_empty() {
				t.storage = self.addr.clone();
			}
		}
		Ok(tasks)
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	use std::convert::Infallible;
	use std::net::SocketAddr;
	use std::time::{Duration, Instant};

	use hyper::service::{make_service_fn, service_fn};
	use hyper::{Response, Server};

	/// Spawn a one-endpoint node answering every request with the given
	/// status and body, after an optional delay
	async fn spawn_node(status: u16, body: &'static str, delay: Duration) -> String {
		let make_svc = make_service_fn(move |_conn| async move {
			Ok::<_, Infallible>(service_fn(move |_req| async move {
				tokio::time::sleep(delay).await;
				Ok::<_, Infallible>(
					Response::builder()
						.status(status)
						.body(Body::from(body))
						.unwrap(),
				)
			}))
		});
		let server = Server::bind(&SocketAddr::from(([127, 0, 0, 1], 0))).serve(make_svc);
		let addr = server.local_addr();
		tokio::spawn(server);
		format!("http://{}", addr)
	}

	#[tokio::test]
	async fn test_aggregates_and_tags_origin() {
		let n1 = spawn_node(
			200,
			r#"[{"seq":1,"type":"delete","status":"pending","tenant":"*","payload":{"query":"q1"}}]"#,
			Duration::from_millis(0),
		)
		.await;
		let n2 = spawn_node(
			200,
			r#"[{"seq":2,"type":"delete","status":"success","tenant":"1-2","payload":{"query":"q2"},"storage":"custom-name"}]"#,
			Duration::from_millis(0),
		)
		.await;

		let client = StorageNodesClient::new(&[n1.clone(), n2]);
		let mut tasks = client.list_async_tasks().await.unwrap();
		tasks.sort_by_key(|t| t.info.seq);

		assert_eq!(tasks.len(), 2);
		// Tasks without an origin get the node address; a set origin is
		// kept as-is
		assert_eq!(tasks[0].storage, n1);
		assert_eq!(tasks[1].storage, "custom-name");
		assert_eq!(tasks[0].info.payload.query, "q1");
	}

	#[tokio::test]
	async fn test_empty_node_set() {
		let client = StorageNodesClient::new(&[]);
		assert!(client.is_empty());
		assert!(client.list_async_tasks().await.unwrap().is_empty());
	}

	#[tokio::test]
	async fn test_first_error_aborts_without_partial_result() {
		// Two slow healthy nodes and one immediately failing node
		let slow = Duration::from_secs(30);
		let n1 = spawn_node(200, "[]", slow).await;
		let n2 = spawn_node(500, "kaboom", Duration::from_millis(0)).await;
		let n3 = spawn_node(200, "[]", slow).await;

		let client = StorageNodesClient::new(&[n1, n2, n3]);
		let started = Instant::now();
		let res = client.list_async_tasks().await;

		// The failing node ends the call long before the slow nodes
		// answer: no partial result, siblings cancelled by drop
		assert!(res.is_err());
		assert!(started.elapsed() < Duration::from_secs(5));
		let msg = res.unwrap_err().to_string();
		assert!(msg.contains("500"), "unexpected error: {}", msg);
	}

	#[tokio::test]
	async fn test_bad_body_is_an_error() {
		let n1 = spawn_node(200, "not json", Duration::from_millis(0)).await;
		let client = StorageNodesClient::new(&[n1]);
		let res = client.list_async_tasks().await;
		assert!(res.is_err());
	}
}
