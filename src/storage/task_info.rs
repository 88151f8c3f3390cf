//! Brief task information for monitoring endpoints

use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};

use crate::partition::Storage;
use crate::task::{DeletePayload, TenantId};

/// Brief information about one background async task, as exposed on
/// monitoring endpoints
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct AsyncTaskInfo {
	pub seq: u64,
	#[serde(rename = "type")]
	pub kind: String,
	pub status: String,
	pub tenant: String,
	pub payload: DeletePayload,

	#[serde(rename = "createdTime", default, skip_serializing_if = "is_zero")]
	pub created_time: i64,
	#[serde(rename = "doneTime", default, skip_serializing_if = "is_zero")]
	pub done_time: i64,
	#[serde(default, skip_serializing_if = "String::is_empty")]
	pub error: String,
}

fn is_zero(v: &i64) -> bool {
	*v == 0
}

/// AsyncTaskInfo plus the address of the storage node it came from
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct AsyncTaskInfoWithSource {
	#[serde(flatten)]
	pub info: AsyncTaskInfo,
	#[serde(default, skip_serializing_if = "String::is_empty")]
	pub storage: String,
}

/// Cached result of list_async_tasks, refreshed at most every `ttl`
pub(crate) struct TaskListCache {
	pub ttl: Duration,
	pub fetched: Option<Instant>,
	pub data: Vec<AsyncTaskInfo>,
}

impl TaskListCache {
	pub fn new() -> Self {
		Self {
			ttl: Duration::from_secs(5),
			fetched: None,
			data: vec![],
		}
	}
}

impl Storage {
	/// Gather information about all async tasks known to this node. The
	/// returned list isn't sorted. The result is cached for a few seconds:
	/// dashboards poll this endpoint and every uncached call snapshots
	/// every partition's task log.
	pub fn list_async_tasks(&self) -> Vec<AsyncTaskInfo> {
		{
			let cache = self.list_cache.lock().unwrap();
			if let Some(at) = cache.fetched {
				if at.elapsed() < cache.ttl {
					return cache.data.clone();
				}
			}
		}

		let mut out = vec![];
		for pt in self.partitions_snapshot() {
			for t in pt.tasks.snapshot() {
				out.push(AsyncTaskInfo {
					seq: t.seq,
					kind: t.kind.as_info_str().to_string(),
					status: t.status.as_info_str().to_string(),
					tenant: render_tenants(&t.tenant_ids),
					payload: t.payload,
					created_time: t.created_time,
					done_time: t.done_time,
					error: t.error_msg,
				});
			}
		}

		let mut cache = self.list_cache.lock().unwrap();
		cache.fetched = Some(Instant::now());
		cache.data = out.clone();
		out
	}
}

/// Tenants render as comma-joined account-project pairs; an empty list is
/// the wildcard
fn render_tenants(tenant_ids: &[TenantId]) -> String {
	if tenant_ids.is_empty() {
		return "*".to_string();
	}
	tenant_ids
		.iter()
		.map(|t| t.to_string())
		.collect::<Vec<_>>()
		.join(",")
}
