//! The background worker that applies async tasks to lagging parts

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::watch;

use lumber_util::background::worker::{Worker, WorkerStatus};

use crate::error::Error;
use crate::partition::{Partition, Storage};
use crate::task::{AsyncTask, TaskKind};

/// Interval between two passes of the task worker. A pass only starts
/// once the previous one has fully completed, so passes never overlap.
pub const TASK_WORKER_INTERVAL: Duration = Duration::from_secs(5);

/// Number of consecutive failed passes on the same sequence after which
/// the task is resolved as error and never retried
pub const MAX_TASK_FAILURES: u32 = 3;

/// The single background worker driving async tasks for one storage node.
/// Failure accounting lives here, in the loop's local state, and is scoped
/// to one sequence so that a flaky task cannot fail an unrelated one.
pub struct TaskWorker {
	storage: Arc<Storage>,

	fail_seq: u64,
	fail_count: u32,
}

impl TaskWorker {
	pub fn new(storage: Arc<Storage>) -> Self {
		Self {
			storage,
			fail_seq: 0,
			fail_count: 0,
		}
	}
}

#[async_trait]
impl Worker for TaskWorker {
	fn name(&self) -> String {
		"Async task worker".into()
	}

	async fn work(
		&mut self,
		must_exit: &mut watch::Receiver<bool>,
	) -> Result<WorkerStatus, lumber_util::error::Error> {
		if self.storage.tasks_paused() {
			return Ok(WorkerStatus::Idle);
		}

		let (seq, res) = self.storage.run_task_pass(must_exit).await;
		match res {
			Ok(()) => {
				self.fail_count = 0;
			}
			Err(e) => {
				error!("async task worker: {}", e);
				if seq != self.fail_seq {
					self.fail_seq = seq;
					self.fail_count = 0;
				}
				self.fail_count += 1;
				if self.fail_count > MAX_TASK_FAILURES {
					self.storage.fail_task(seq, &e).await;
					self.fail_count = 0;
				}
			}
		}

		Ok(WorkerStatus::Idle)
	}

	async fn wait_for_work(&mut self, _must_exit: &watch::Receiver<bool>) -> WorkerStatus {
		tokio::time::sleep(TASK_WORKER_INTERVAL).await;
		WorkerStatus::Busy
	}
}

impl Storage {
	/// One pass of the task worker: pick the smallest pending sequence
	/// across all partitions, apply it to every lagging part, and resolve
	/// it once nothing remains. Returns the sequence worked on (0 when
	/// idle) along with the outcome, so the caller can account failures
	/// against that sequence.
	pub async fn run_task_pass(
		&self,
		must_exit: &watch::Receiver<bool>,
	) -> (u64, Result<(), Error>) {
		let ptws = self.partitions_snapshot();

		let (targets, task) = self.find_next_task(&ptws);
		let task = match task {
			Some(task) => task,
			None => return (0, Ok(())),
		};
		let seq = task.seq;

		// Gather the lagging parts of the target partitions. Parts being
		// merged are deferred but keep the task pending; parts being
		// dropped are skipped outright.
		let mut lagging = vec![];
		let mut pending = 0;
		for pt in &targets {
			pt.with_parts(|parts| {
				for pw in parts.all() {
					if pw.task_seq() >= seq {
						continue;
					}
					if pw.must_drop() {
						continue;
					}
					if pw.in_merge() {
						pending += 1;
						continue;
					}
					lagging.push(pw.clone());
				}
			});
		}

		if lagging.is_empty() {
			if pending > 0 {
				// Some merge still owns the remaining parts; revisit on a
				// later pass
				return (seq, Ok(()));
			}
			self.set_task_complete(&targets, seq, false, None).await;
			return (seq, Ok(()));
		}

		if task.kind == TaskKind::Delete {
			if let Err(e) = self.dispatch_delete(&task, &lagging, must_exit).await {
				return (seq, Err(e));
			}
		}

		// Every dispatched part is now caught up, including those the
		// query matched no rows in
		for pw in &lagging {
			pw.store_task_seq(seq);
		}

		if pending == 0 {
			self.set_task_complete(&targets, seq, false, None).await;
		}

		(seq, Ok(()))
	}

	/// The pending task with the smallest sequence across all partitions,
	/// together with every partition carrying it: a logical task is
	/// appended with the same sequence to each partition it touches, so
	/// equal sequences mean the same task.
	fn find_next_task(
		&self,
		ptws: &[Arc<Partition>],
	) -> (Vec<Arc<Partition>>, Option<AsyncTask>) {
		let mut result: Option<AsyncTask> = None;
		let mut result_ptws = vec![];

		for pt in ptws {
			let task = match pt.tasks.next_pending_task() {
				Some(task) => task,
				None => continue,
			};
			match &result {
				Some(cur) if task.seq > cur.seq => continue,
				Some(cur) if task.seq == cur.seq => {
					result_ptws.push(pt.clone());
				}
				_ => {
					result = Some(task);
					result_ptws.clear();
					result_ptws.push(pt.clone());
				}
			}
		}

		self.store_current_task_seq(result.as_ref().map(|t| t.seq).unwrap_or(0));
		(result_ptws, result)
	}

	/// Resolve a task in the given partitions. When include_parts is set,
	/// every part's watermark is raised first, so the sequence can never
	/// be selected again.
	pub(crate) async fn set_task_complete(
		&self,
		ptws: &[Arc<Partition>],
		seq: u64,
		include_parts: bool,
		err: Option<&Error>,
	) {
		for pt in ptws {
			if include_parts {
				pt.with_parts(|parts| {
					for pw in parts.all() {
						pw.raise_task_seq(seq);
					}
				});
			}
			pt.tasks.resolve(seq, err).await;
		}

		// The task is no longer active anywhere
		self.active_tasks.lock().unwrap().retain(|t| t.seq != seq);
	}

	/// Resolve a task as permanently failed, in every partition, advancing
	/// every part past it
	pub(crate) async fn fail_task(&self, seq: u64, err: &Error) {
		if seq == 0 {
			return;
		}
		let ptws = self.partitions_snapshot();
		self.set_task_complete(&ptws, seq, true, Some(err)).await;
	}
}
