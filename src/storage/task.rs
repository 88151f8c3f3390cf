//! The per-partition log of asynchronous tasks

use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;

use serde::{Deserialize, Serialize};

use lumber_util::fs::must_write_atomic;
use lumber_util::time::now_nsecs;

use crate::error::Error;

pub const TASKS_FILENAME: &str = "tasks.json";

/// Identifies one tenant of the storage node. Tenants scope task
/// visibility and filter evaluation.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct TenantId {
	#[serde(rename = "accountID")]
	pub account_id: u32,
	#[serde(rename = "projectID")]
	pub project_id: u32,
}

impl std::fmt::Display for TenantId {
	fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
		write!(f, "{}-{}", self.account_id, self.project_id)
	}
}

/// Parse the JSON list of tenant ids sent by the RPC layer. An empty
/// string stands for "all tenants".
pub fn parse_tenant_ids_json(data: &str) -> Result<Vec<TenantId>, Error> {
	if data.is_empty() {
		return Ok(vec![]);
	}
	Ok(serde_json::from_str(data)?)
}

/// The type of a background task attached to a partition. More types can
/// be added in the future (compaction, ttl, schema changes).
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum TaskKind {
	#[serde(rename = "")]
	None,
	#[serde(rename = "delete")]
	Delete,
}

impl TaskKind {
	/// Rendering used on monitoring endpoints
	pub fn as_info_str(self) -> &'static str {
		match self {
			TaskKind::Delete => "delete",
			TaskKind::None => "none",
		}
	}
}

/// Tracks the outcome of a task
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum TaskStatus {
	#[serde(rename = "pending")]
	Pending,
	#[serde(rename = "success")]
	Success,
	#[serde(rename = "error")]
	Error,
}

impl TaskStatus {
	pub fn as_info_str(self) -> &'static str {
		match self {
			TaskStatus::Pending => "pending",
			TaskStatus::Success => "success",
			TaskStatus::Error => "error",
		}
	}
}

/// Arguments of delete tasks
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct DeletePayload {
	#[serde(default, skip_serializing_if = "String::is_empty")]
	pub query: String,
}

/// One asynchronous task, as persisted in a partition's task log
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct AsyncTask {
	#[serde(rename = "type")]
	pub kind: TaskKind,
	#[serde(rename = "tenantIDs", default, skip_serializing_if = "Vec::is_empty")]
	pub tenant_ids: Vec<TenantId>,
	pub payload: DeletePayload,
	#[serde(default, skip_serializing_if = "is_zero_u64")]
	pub seq: u64,
	pub status: TaskStatus,
	#[serde(rename = "createdTime", default, skip_serializing_if = "is_zero_i64")]
	pub created_time: i64,
	#[serde(rename = "doneTime", default, skip_serializing_if = "is_zero_i64")]
	pub done_time: i64,
	#[serde(rename = "error", default, skip_serializing_if = "String::is_empty")]
	pub error_msg: String,
}

fn is_zero_u64(v: &u64) -> bool {
	*v == 0
}

fn is_zero_i64(v: &i64) -> bool {
	*v == 0
}

/// The on-disk list of pending/resolved async tasks of one partition.
/// Entries keep strictly increasing sequences (they come from the node's
/// global counter) and resolved entries are retained as history.
pub struct TaskLog {
	dir: PathBuf,

	tasks: Mutex<Vec<AsyncTask>>,
	/// Sequence currently being worked on, for observability
	current_seq: AtomicU64,
}

impl TaskLog {
	/// Load the task log of a partition directory; a missing tasks.json is
	/// an empty log.
	pub fn load(dir: PathBuf) -> Result<Self, Error> {
		let path = dir.join(TASKS_FILENAME);
		let tasks = match std::fs::read(&path) {
			Ok(data) if data.is_empty() => vec![],
			Ok(data) => serde_json::from_slice(&data)?,
			Err(e) if e.kind() == std::io::ErrorKind::NotFound => vec![],
			Err(e) => return Err(e.into()),
		};
		Ok(Self {
			dir,
			tasks: Mutex::new(tasks),
			current_seq: AtomicU64::new(0),
		})
	}

	/// Append a pending delete task and persist the log. The mutex is
	/// released before the slow filesystem write.
	pub async fn add_delete_task(&self, tenant_ids: &[TenantId], query: &str, seq: u64) -> u64 {
		let task = AsyncTask {
			kind: TaskKind::Delete,
			tenant_ids: tenant_ids.to_vec(),
			payload: DeletePayload {
				query: query.to_string(),
			},
			seq,
			status: TaskStatus::Pending,
			created_time: now_nsecs(),
			done_time: 0,
			error_msg: String::new(),
		};

		self.tasks.lock().unwrap().push(task);

		self.must_save().await;
		seq
	}

	/// The first pending task in insertion order, if any. Its sequence is
	/// also recorded as the one currently being worked on.
	pub fn next_pending_task(&self) -> Option<AsyncTask> {
		let result = self
			.tasks
			.lock()
			.unwrap()
			.iter()
			.find(|t| t.status == TaskStatus::Pending)
			.cloned();

		self.current_seq.store(
			result.as_ref().map(|t| t.seq).unwrap_or(0),
			Ordering::Relaxed,
		);
		result
	}

	pub fn current_seq(&self) -> u64 {
		self.current_seq.load(Ordering::Relaxed)
	}

	/// Resolve the first pending task if its sequence matches, exactly
	/// once: repeated calls for the same sequence, or calls for a sequence
	/// this log has already resolved, change nothing.
	pub async fn resolve(&self, seq: u64, err: Option<&Error>) {
		let (status, err_msg) = match err {
			Some(e) => (TaskStatus::Error, e.to_string()),
			None => (TaskStatus::Success, String::new()),
		};

		{
			let mut tasks = self.tasks.lock().unwrap();
			let mut resolved = false;
			for t in tasks.iter_mut() {
				if t.seq < seq {
					continue;
				}
				if t.seq > seq || t.status != TaskStatus::Pending {
					// no matching pending task
					return;
				}
				t.status = status;
				t.done_time = now_nsecs();
				t.error_msg = err_msg.clone();
				resolved = true;
				break;
			}
			if !resolved {
				return;
			}
		}

		self.must_save().await;
	}

	/// Copy of all tasks, for listings
	pub fn snapshot(&self) -> Vec<AsyncTask> {
		self.tasks.lock().unwrap().clone()
	}

	async fn must_save(&self) {
		// Serialize under the lock, write after releasing it: the log
		// mutex is never held across a filesystem write.
		let data = {
			let tasks = self.tasks.lock().unwrap();
			serde_json::to_vec(&*tasks).expect("task log serialization cannot fail")
		};
		must_write_atomic(&self.dir.join(TASKS_FILENAME), &data).await;
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	fn tmp_log() -> (mktemp::Temp, TaskLog) {
		let dir = mktemp::Temp::new_dir().unwrap();
		let log = TaskLog::load(dir.to_path_buf()).unwrap();
		(dir, log)
	}

	#[test]
	fn test_task_json_field_names() {
		let task = AsyncTask {
			kind: TaskKind::Delete,
			tenant_ids: vec![TenantId {
				account_id: 12,
				project_id: 456,
			}],
			payload: DeletePayload {
				query: "app:foo".to_string(),
			},
			seq: 42,
			status: TaskStatus::Pending,
			created_time: 1000,
			done_time: 0,
			error_msg: String::new(),
		};
		let json = serde_json::to_value(&task).unwrap();
		assert_eq!(json["type"], "delete");
		assert_eq!(json["status"], "pending");
		assert_eq!(json["seq"], 42);
		assert_eq!(json["tenantIDs"][0]["accountID"], 12);
		assert_eq!(json["tenantIDs"][0]["projectID"], 456);
		assert_eq!(json["payload"]["query"], "app:foo");
		assert_eq!(json["createdTime"], 1000);
		// zero/empty fields are omitted
		assert!(json.get("doneTime").is_none());
		assert!(json.get("error").is_none());

		let back: AsyncTask = serde_json::from_value(json).unwrap();
		assert_eq!(back, task);
	}

	#[test]
	fn test_parse_tenant_ids_json() {
		assert_eq!(parse_tenant_ids_json("").unwrap(), vec![]);
		let tids =
			parse_tenant_ids_json(r#"[{"accountID":1,"projectID":2},{"accountID":0,"projectID":0}]"#)
				.unwrap();
		assert_eq!(
			tids,
			vec![
				TenantId {
					account_id: 1,
					project_id: 2
				},
				TenantId::default()
			]
		);
		assert!(parse_tenant_ids_json("not json").is_err());
	}

	#[tokio::test]
	async fn test_next_pending_and_resolve() {
		let (_dir, log) = tmp_log();
		log.add_delete_task(&[], "q1", 10).await;
		log.add_delete_task(&[], "q2", 11).await;

		let t = log.next_pending_task().unwrap();
		assert_eq!(t.seq, 10);
		assert_eq!(log.current_seq(), 10);

		log.resolve(10, None).await;
		let t = log.next_pending_task().unwrap();
		assert_eq!(t.seq, 11);

		log.resolve(11, Some(&Error::Message("boom".into()))).await;
		assert!(log.next_pending_task().is_none());
		assert_eq!(log.current_seq(), 0);

		let tasks = log.snapshot();
		assert_eq!(tasks[0].status, TaskStatus::Success);
		assert!(tasks[0].done_time > 0);
		assert_eq!(tasks[1].status, TaskStatus::Error);
		assert_eq!(tasks[1].error_msg, "boom");
	}

	#[tokio::test]
	async fn test_resolve_is_idempotent() {
		let (_dir, log) = tmp_log();
		log.add_delete_task(&[], "q", 5).await;

		log.resolve(5, None).await;
		let after_first = log.snapshot();

		// Resolving again, with or without an error, changes nothing
		log.resolve(5, Some(&Error::Message("late".into()))).await;
		log.resolve(5, None).await;
		assert_eq!(log.snapshot(), after_first);

		// Resolving an unknown sequence changes nothing either
		log.resolve(999, None).await;
		assert_eq!(log.snapshot(), after_first);
	}

	#[tokio::test]
	async fn test_resolve_skips_resolved_prefix() {
		let (_dir, log) = tmp_log();
		log.add_delete_task(&[], "a", 1).await;
		log.add_delete_task(&[], "b", 2).await;
		log.resolve(1, None).await;

		// Sequence 2 is now the first pending task and can be resolved
		// even though an older resolved entry precedes it
		log.resolve(2, None).await;
		assert!(log.snapshot().iter().all(|t| t.status == TaskStatus::Success));
	}

	#[tokio::test]
	async fn test_log_persistence_roundtrip() {
		let dir = mktemp::Temp::new_dir().unwrap();
		{
			let log = TaskLog::load(dir.to_path_buf()).unwrap();
			log.add_delete_task(
				&[TenantId {
					account_id: 3,
					project_id: 4,
				}],
				"q",
				77,
			)
			.await;
			log.resolve(77, Some(&Error::Message("stopped".into()))).await;
		}

		let log = TaskLog::load(dir.to_path_buf()).unwrap();
		let tasks = log.snapshot();
		assert_eq!(tasks.len(), 1);
		assert_eq!(tasks[0].seq, 77);
		assert_eq!(tasks[0].status, TaskStatus::Error);
		assert_eq!(tasks[0].error_msg, "stopped");
		assert!(log.next_pending_task().is_none());
	}
}
