//! Delete tasks: filter parsing, submission, dispatch over lagging parts,
//! stop and listing

use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::sync::{mpsc, watch};

use crate::bool_rle::BoolRle;
use crate::error::Error;
use crate::marker::{flush_delete_marker, DeleteMarker};
use crate::partition::{PartWrapper, Storage, TimeRange};
use crate::task::{AsyncTask, TenantId};

/// A parsed filter expression. The expression language belongs to the
/// query engine; this layer only understands the optional leading
/// `_time:<min>..<max>` token (inclusive nanosecond bounds), which scopes
/// the filter to a time range for partition selection and part admission.
#[derive(Clone, Debug, PartialEq)]
pub struct Filter {
	raw: String,
	expr: String,
	time_range: TimeRange,
}

impl Filter {
	pub fn parse(s: &str) -> Result<Filter, Error> {
		let raw = s.trim();
		if raw.is_empty() {
			return Err(Error::BadFilter(s.to_string(), "empty filter".to_string()));
		}
		if raw.matches('"').count() % 2 != 0 {
			return Err(Error::BadFilter(
				s.to_string(),
				"unbalanced quotes".to_string(),
			));
		}

		let (time_range, expr) = match raw.strip_prefix("_time:") {
			Some(rest) => {
				let (range_str, expr) = match rest.find(char::is_whitespace) {
					Some(at) => (&rest[..at], rest[at..].trim()),
					None => (rest, ""),
				};
				let parts = range_str
					.split_once("..")
					.ok_or_else(|| bad_time_token(s, range_str))?;
				let min_ts: i64 = parts.0.parse().map_err(|_| bad_time_token(s, range_str))?;
				let max_ts: i64 = parts.1.parse().map_err(|_| bad_time_token(s, range_str))?;
				if min_ts > max_ts {
					return Err(bad_time_token(s, range_str));
				}
				(TimeRange { min_ts, max_ts }, expr.to_string())
			}
			None => (TimeRange::all(), raw.to_string()),
		};

		Ok(Filter {
			raw: raw.to_string(),
			expr,
			time_range,
		})
	}

	/// The raw string form, as recorded in task payloads
	pub fn raw(&self) -> &str {
		&self.raw
	}

	/// The expression with the time token stripped, for the query engine
	pub fn expr(&self) -> &str {
		&self.expr
	}

	pub fn time_range(&self) -> TimeRange {
		self.time_range
	}
}

fn bad_time_token(filter: &str, token: &str) -> Error {
	Error::BadFilter(
		filter.to_string(),
		format!("expected _time:<min>..<max>, got _time:{}", token),
	)
}

/// One streamed match from the query engine: marked rows of one block of
/// one of the dispatched parts
pub struct DeleteMatch {
	/// Index into the part list the engine was given
	pub part_index: usize,
	pub block_id: u64,
	pub rows: BoolRle,
}

/// Execution context of one delete dispatch
pub struct QueryContext {
	pub tenant_ids: Vec<TenantId>,
	pub filter: Filter,
	/// Fires when the node is shutting down; the engine must abort
	pub must_exit: watch::Receiver<bool>,
}

/// Interface to the query engine, which is a separate component: the
/// deletion core only needs it to stream back the rows matching a filter
/// within a restricted set of parts. Errors (parse, I/O, timeouts)
/// propagate to the task worker unchanged.
#[async_trait]
pub trait DeleteEngine: Send + Sync {
	async fn run_delete(
		&self,
		ctx: &QueryContext,
		parts: &[Arc<PartWrapper>],
		matches: mpsc::Sender<DeleteMatch>,
	) -> Result<(), Error>;
}

/// Engine used when the node runs without a select pipeline: every
/// dispatch completes with no matching rows
pub struct NoopDeleteEngine;

#[async_trait]
impl DeleteEngine for NoopDeleteEngine {
	async fn run_delete(
		&self,
		_ctx: &QueryContext,
		_parts: &[Arc<PartWrapper>],
		_matches: mpsc::Sender<DeleteMatch>,
	) -> Result<(), Error> {
		Ok(())
	}
}

/// A submitted delete operation, as tracked in the node's active-task
/// registry and exposed on /internal/delete/active_tasks
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct DeleteTask {
	#[serde(rename = "taskID")]
	pub task_id: String,
	#[serde(rename = "tenantIDs", default, skip_serializing_if = "Vec::is_empty")]
	pub tenant_ids: Vec<TenantId>,
	pub filter: String,
	#[serde(rename = "startTime")]
	pub start_time: i64,
	pub seq: u64,

	#[serde(skip)]
	pub(crate) time_range: TimeRange,
}

impl Storage {
	/// Submit a delete task: allocate a global sequence, record the task
	/// in the active registry, and append it to the log of every partition
	/// the filter's time range touches. `timestamp` is stamped by the
	/// caller so that every storage node records the same submission time.
	pub async fn run_delete_task(
		&self,
		task_id: &str,
		timestamp: i64,
		tenant_ids: &[TenantId],
		filter: &Filter,
	) -> Result<u64, Error> {
		if task_id.is_empty() {
			return Err(Error::Message("missing task id".to_string()));
		}

		let seq = self.next_seq();

		{
			let mut active = self.active_tasks.lock().unwrap();
			if active.iter().any(|t| t.task_id == task_id) {
				return Err(Error::Message(format!(
					"delete task {:?} already exists",
					task_id
				)));
			}
			active.push(DeleteTask {
				task_id: task_id.to_string(),
				tenant_ids: tenant_ids.to_vec(),
				filter: filter.raw().to_string(),
				start_time: timestamp,
				seq,
				time_range: filter.time_range(),
			});
		}

		let ptws: Vec<_> = self
			.partitions_snapshot()
			.into_iter()
			.filter(|pt| pt.time_range.intersects(&filter.time_range()))
			.collect();

		for pt in &ptws {
			pt.tasks.add_delete_task(tenant_ids, filter.raw(), seq).await;
		}
		info!(
			"delete task {:?} (seq {}) appended to {} partition(s)",
			task_id,
			seq,
			ptws.len()
		);

		if ptws.is_empty() {
			// No partition will ever resolve this sequence; drop it from
			// the registry right away
			self.active_tasks.lock().unwrap().retain(|t| t.seq != seq);
		}

		Ok(seq)
	}

	/// Stop an active delete task: resolve it as error ("stopped") in
	/// every partition and advance every part past its sequence, so the
	/// worker never selects it again.
	pub async fn stop_delete_task(&self, task_id: &str) -> Result<(), Error> {
		let seq = {
			let active = self.active_tasks.lock().unwrap();
			active.iter().find(|t| t.task_id == task_id).map(|t| t.seq)
		};
		let seq = match seq {
			Some(seq) => seq,
			None => {
				return Err(Error::Message(format!(
					"active delete task {:?} not found",
					task_id
				)))
			}
		};

		let ptws = self.partitions_snapshot();
		self.set_task_complete(&ptws, seq, true, Some(&Error::Message("stopped".to_string())))
			.await;
		info!("delete task {:?} (seq {}) stopped", task_id, seq);
		Ok(())
	}

	/// Delete tasks still unresolved on this node
	pub fn active_delete_tasks(&self) -> Vec<DeleteTask> {
		self.active_tasks.lock().unwrap().clone()
	}

	/// Dispatch one delete task over the given lagging parts: run the
	/// query engine restricted to exactly those parts, accumulate per-part
	/// marker additions, and flush them. Parts with no matches are not
	/// flushed; the worker advances their watermark after this returns.
	pub(crate) async fn dispatch_delete(
		&self,
		task: &AsyncTask,
		lagging: &[Arc<PartWrapper>],
		must_exit: &watch::Receiver<bool>,
	) -> Result<(), Error> {
		let filter = Filter::parse(&task.payload.query)?;
		let ctx = QueryContext {
			tenant_ids: task.tenant_ids.clone(),
			filter,
			must_exit: must_exit.clone(),
		};

		let (tx, mut rx) = mpsc::channel(256);
		let run = self.engine().run_delete(&ctx, lagging, tx);

		let collect = async {
			let mut additions = vec![DeleteMarker::new(); lagging.len()];
			while let Some(m) = rx.recv().await {
				match additions.get_mut(m.part_index) {
					Some(dm) => dm.add_block(m.block_id, m.rows),
					None => warn!(
						"query engine returned a match for unknown part index {}",
						m.part_index
					),
				}
			}
			additions
		};

		let (res, additions) = futures::join!(run, collect);
		res?;

		for (pw, dm) in lagging.iter().zip(additions.iter()) {
			flush_delete_marker(pw, dm, task.seq).await;
		}
		Ok(())
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn test_parse_filter_plain() {
		let f = Filter::parse("app:foo AND level:error").unwrap();
		assert_eq!(f.expr(), "app:foo AND level:error");
		assert_eq!(f.time_range(), TimeRange::all());
		assert_eq!(f.raw(), "app:foo AND level:error");
	}

	#[test]
	fn test_parse_filter_with_time_token() {
		let f = Filter::parse("_time:1000..2000 app:foo").unwrap();
		assert_eq!(f.expr(), "app:foo");
		assert_eq!(
			f.time_range(),
			TimeRange {
				min_ts: 1000,
				max_ts: 2000
			}
		);
		// The raw form keeps the token: it is what task payloads record
		assert_eq!(f.raw(), "_time:1000..2000 app:foo");
	}

	#[test]
	fn test_parse_filter_rejects_malformed() {
		assert!(Filter::parse("").is_err());
		assert!(Filter::parse("   ").is_err());
		assert!(Filter::parse("msg:\"unbalanced").is_err());
		assert!(Filter::parse("_time:12 app:foo").is_err());
		assert!(Filter::parse("_time:9..1 app:foo").is_err());
		assert!(Filter::parse("_time:a..b app:foo").is_err());
	}
}
