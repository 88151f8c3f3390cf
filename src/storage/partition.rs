//! Partitions, parts, and the storage node that owns them

use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use arc_swap::ArcSwap;
use chrono::NaiveDate;

use lumber_util::time::now_nsecs;

use crate::delete::{DeleteEngine, DeleteTask};
use crate::error::Error;
use crate::marker::{load_delete_marker, DeleteMarker};
use crate::task::TaskLog;
use crate::task_info::TaskListCache;

const NSECS_PER_DAY: i64 = 24 * 3600 * 1_000_000_000;

/// Inclusive range of row timestamps, in nanoseconds since the Unix epoch
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct TimeRange {
	pub min_ts: i64,
	pub max_ts: i64,
}

impl TimeRange {
	pub fn all() -> Self {
		Self {
			min_ts: i64::MIN,
			max_ts: i64::MAX,
		}
	}

	pub fn intersects(&self, other: &TimeRange) -> bool {
		self.min_ts <= other.max_ts && other.min_ts <= self.max_ts
	}
}

impl Default for TimeRange {
	fn default() -> Self {
		Self::all()
	}
}

/// Metadata of one block of a part
#[derive(Clone, Copy, Debug)]
pub struct BlockMeta {
	pub block_id: u64,
	pub row_count: u64,
}

/// Immutable metadata of a part
#[derive(Clone, Debug)]
pub struct PartMeta {
	pub name: String,
	pub time_range: TimeRange,
	pub blocks: Vec<BlockMeta>,
}

/// One immutable segment of a partition, organised as blocks
pub struct Part {
	pub meta: PartMeta,
	/// Directory of the part; None for parts that only exist in memory
	pub path: Option<PathBuf>,

	delete_marker: ArcSwap<DeleteMarker>,
}

impl Part {
	/// An in-memory part that has not been flushed to disk yet
	pub fn new_inmemory(meta: PartMeta) -> Self {
		Self {
			meta,
			path: None,
			delete_marker: ArcSwap::from_pointee(DeleteMarker::new()),
		}
	}

	/// A part backed by a directory. Its delete marker is reloaded from
	/// `row_delete.dat`; corrupt marker data aborts the process.
	pub fn open(meta: PartMeta, dir: PathBuf) -> Self {
		let dm = load_delete_marker(&dir);
		Self {
			meta,
			path: Some(dir),
			delete_marker: ArcSwap::from_pointee(dm),
		}
	}

	/// Lock-free snapshot of the delete marker. The snapshot is never
	/// mutated; writers publish a new one through the parts lock.
	pub fn delete_marker(&self) -> Arc<DeleteMarker> {
		self.delete_marker.load_full()
	}

	pub(crate) fn store_delete_marker(&self, dm: Arc<DeleteMarker>) {
		self.delete_marker.store(dm);
	}
}

/// A part plus the mutable runtime state the task worker and the merge
/// path need
pub struct PartWrapper {
	pub part: Arc<Part>,

	/// Highest task sequence fully applied to this part. Not persisted:
	/// after a restart the worker re-applies pending tasks from scratch.
	task_seq: AtomicU64,
	/// The part is being removed; skip it
	must_drop: AtomicBool,
	/// The part is the source of a running merge; deferred, not
	/// dispatched. Only toggled under the partition's parts lock.
	in_merge: AtomicBool,
}

impl PartWrapper {
	pub fn new(part: Part) -> Arc<Self> {
		Arc::new(Self {
			part: Arc::new(part),
			task_seq: AtomicU64::new(0),
			must_drop: AtomicBool::new(false),
			in_merge: AtomicBool::new(false),
		})
	}

	pub fn task_seq(&self) -> u64 {
		self.task_seq.load(Ordering::Acquire)
	}

	pub(crate) fn store_task_seq(&self, seq: u64) {
		self.task_seq.store(seq, Ordering::Release);
	}

	/// Move the watermark forward, never backward
	pub(crate) fn raise_task_seq(&self, seq: u64) {
		self.task_seq.fetch_max(seq, Ordering::AcqRel);
	}

	pub fn must_drop(&self) -> bool {
		self.must_drop.load(Ordering::Acquire)
	}

	pub fn set_must_drop(&self) {
		self.must_drop.store(true, Ordering::Release);
	}

	pub fn in_merge(&self) -> bool {
		self.in_merge.load(Ordering::Acquire)
	}
}

/// The three classes of parts of a partition
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum PartClass {
	Inmemory,
	Small,
	Big,
}

#[derive(Default)]
pub(crate) struct PartLists {
	pub inmemory: Vec<Arc<PartWrapper>>,
	pub small: Vec<Arc<PartWrapper>>,
	pub big: Vec<Arc<PartWrapper>>,
}

impl PartLists {
	pub fn all(&self) -> impl Iterator<Item = &Arc<PartWrapper>> {
		self.inmemory
			.iter()
			.chain(self.small.iter())
			.chain(self.big.iter())
	}
}

/// A set of parts covering one time window, plus its task log
pub struct Partition {
	pub name: String,
	pub time_range: TimeRange,
	pub path: PathBuf,
	pub tasks: TaskLog,

	parts: Mutex<PartLists>,
}

impl Partition {
	fn open(name: String, path: PathBuf) -> Result<Arc<Self>, Error> {
		let time_range = day_range(&name)
			.ok_or_else(|| Error::Message(format!("invalid partition name {:?}", name)))?;
		let tasks = TaskLog::load(path.clone())?;
		Ok(Arc::new(Self {
			name,
			time_range,
			path,
			tasks,
			parts: Mutex::new(Default::default()),
		}))
	}

	/// Snapshot of all parts across the three classes. The returned Arcs
	/// keep each part alive beyond the lock's scope.
	pub fn parts_snapshot(&self) -> Vec<Arc<PartWrapper>> {
		let parts = self.parts.lock().unwrap();
		parts.all().cloned().collect()
	}

	/// Run `f` under the parts lock, on the raw part lists
	pub(crate) fn with_parts<R>(&self, f: impl FnOnce(&PartLists) -> R) -> R {
		let parts = self.parts.lock().unwrap();
		f(&parts)
	}

	/// Mark a part as participating (or not) in a merge. The flag is only
	/// toggled under the parts lock, so the task worker's scan sees a
	/// consistent view. The merge path owns the task sequences of the
	/// parts it consumes: the destination part inherits their markers.
	pub fn set_in_merge(&self, pw: &Arc<PartWrapper>, in_merge: bool) {
		let _parts = self.parts.lock().unwrap();
		pw.in_merge.store(in_merge, Ordering::Release);
	}

	fn add_part(&self, pw: Arc<PartWrapper>, class: PartClass) {
		let mut parts = self.parts.lock().unwrap();
		match class {
			PartClass::Inmemory => parts.inmemory.push(pw),
			PartClass::Small => parts.small.push(pw),
			PartClass::Big => parts.big.push(pw),
		}
	}
}

/// Partition directories are named after the UTC day they cover (YYYYMMDD)
fn day_range(name: &str) -> Option<TimeRange> {
	let date = NaiveDate::parse_from_str(name, "%Y%m%d").ok()?;
	let min_ts = date.and_hms_opt(0, 0, 0)?.timestamp() * 1_000_000_000;
	Some(TimeRange {
		min_ts,
		max_ts: min_ts + NSECS_PER_DAY - 1,
	})
}

/// A storage node: the partition set, the async-task machinery and the
/// pluggable delete query engine
pub struct Storage {
	pub path: PathBuf,

	partitions: Mutex<Vec<Arc<Partition>>>,

	/// Generator for task sequence numbers. Seeded with the wall clock in
	/// nanoseconds so that new sequences never collide with the ones
	/// already recorded in task logs by previous runs.
	next_seq: AtomicU64,
	/// Sequence the worker is currently applying, for observability
	current_task_seq: AtomicU64,
	/// When set, the task worker skips its ticks
	paused: AtomicBool,

	engine: Arc<dyn DeleteEngine>,

	pub(crate) active_tasks: Mutex<Vec<DeleteTask>>,
	pub(crate) list_cache: Mutex<TaskListCache>,
}

impl Storage {
	/// Open a storage directory, reloading every partition's task log.
	/// Parts are admitted afterwards by the ingestion path (admit_part).
	pub fn open(path: PathBuf, engine: Arc<dyn DeleteEngine>) -> Result<Arc<Self>, Error> {
		let partitions_dir = path.join("partitions");
		std::fs::create_dir_all(&partitions_dir)?;

		let mut partitions = vec![];
		for ent in std::fs::read_dir(&partitions_dir)? {
			let ent = ent?;
			if !ent.file_type()?.is_dir() {
				continue;
			}
			let name = match ent.file_name().into_string() {
				Ok(name) => name,
				Err(_) => continue,
			};
			partitions.push(Partition::open(name, ent.path())?);
		}
		partitions.sort_by(|a, b| a.name.cmp(&b.name));
		info!(
			"Opened storage at {} with {} partition(s)",
			path.display(),
			partitions.len()
		);

		Ok(Arc::new(Self {
			path,
			partitions: Mutex::new(partitions),
			next_seq: AtomicU64::new(now_nsecs() as u64),
			current_task_seq: AtomicU64::new(0),
			paused: AtomicBool::new(false),
			engine,
			active_tasks: Mutex::new(vec![]),
			list_cache: Mutex::new(TaskListCache::new()),
		}))
	}

	/// Allocate the next global task sequence
	pub(crate) fn next_seq(&self) -> u64 {
		self.next_seq.fetch_add(1, Ordering::SeqCst)
	}

	/// Create the partition covering the given day, or return the
	/// existing one
	pub fn create_partition(&self, name: &str) -> Result<Arc<Partition>, Error> {
		let mut partitions = self.partitions.lock().unwrap();
		if let Some(pt) = partitions.iter().find(|pt| pt.name == name) {
			return Ok(pt.clone());
		}
		let dir = self.path.join("partitions").join(name);
		std::fs::create_dir_all(&dir)?;
		let pt = Partition::open(name.to_string(), dir)?;
		partitions.push(pt.clone());
		partitions.sort_by(|a, b| a.name.cmp(&b.name));
		Ok(pt)
	}

	/// Snapshot of the partition list. The returned Arcs are the refcount
	/// window inside which partitions may be dereferenced.
	pub fn partitions_snapshot(&self) -> Vec<Arc<Partition>> {
		self.partitions.lock().unwrap().clone()
	}

	pub fn set_tasks_paused(&self, paused: bool) {
		self.paused.store(paused, Ordering::Release);
	}

	pub(crate) fn tasks_paused(&self) -> bool {
		self.paused.load(Ordering::Acquire)
	}

	pub(crate) fn store_current_task_seq(&self, seq: u64) {
		self.current_task_seq.store(seq, Ordering::Relaxed);
	}

	/// Sequence the task worker is currently applying (0 when idle)
	pub fn current_task_seq(&self) -> u64 {
		self.current_task_seq.load(Ordering::Relaxed)
	}

	pub(crate) fn engine(&self) -> &Arc<dyn DeleteEngine> {
		&self.engine
	}

	/// Ingestion-side hook: admit a freshly published part into a
	/// partition. The part starts at the highest task sequence it can
	/// safely skip: the longest prefix of active tasks whose filters
	/// cannot match it. A part published while an intersecting delete is
	/// pending starts at 0, so the worker catches it up on its next pass.
	pub fn admit_part(&self, pt: &Arc<Partition>, part: Part, class: PartClass) -> Arc<PartWrapper> {
		let pw = PartWrapper::new(part);
		pw.store_task_seq(self.admission_task_seq(&pw.part.meta));
		pt.add_part(pw.clone(), class);
		pw
	}

	fn admission_task_seq(&self, meta: &PartMeta) -> u64 {
		let mut active = self.active_tasks.lock().unwrap().clone();
		active.sort_by_key(|t| t.seq);

		let mut seq = 0;
		for t in &active {
			// The first task that may touch the part stops the scan:
			// sequences are applied in order, so nothing past it can be
			// skipped either.
			if t.time_range.intersects(&meta.time_range) {
				break;
			}
			seq = t.seq;
		}
		seq
	}
}
