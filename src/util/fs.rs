//! Filesystem helpers with durability guarantees

use std::path::{Path, PathBuf};

use rand::prelude::*;
use tokio::fs;
use tokio::io::AsyncWriteExt;

use crate::error::*;

/// Write `data` to `path` atomically: the bytes go to a temporary file in the
/// same directory first and are fsync'ed there, the temporary file is renamed
/// over `path`, and the containing directory is fsync'ed so that the rename
/// itself is durable. See:
/// http://thedjbway.b0llix.net/qmail/syncdir.html
pub async fn write_atomic(path: &Path, data: &[u8]) -> Result<(), Error> {
	let directory = path
		.parent()
		.ok_or_message("cannot write to a path without a parent directory")?
		.to_path_buf();

	let mut path_tmp = path.to_path_buf();
	let tmp_extension = format!("tmp{}", hex::encode(thread_rng().gen::<[u8; 4]>()));
	path_tmp.set_extension(tmp_extension);

	let mut delete_on_drop = DeleteOnDrop(Some(path_tmp.clone()));

	let mut f = fs::File::create(&path_tmp).await?;
	f.write_all(data).await?;
	f.sync_all().await?;
	drop(f);

	fs::rename(&path_tmp, path).await?;

	delete_on_drop.cancel();

	let dir = fs::File::open(&directory).await?;
	dir.sync_all().await?;
	drop(dir);

	Ok(())
}

/// Same as `write_atomic`, except that a write failure aborts the process.
/// Callers use this for state that is not allowed to silently diverge from
/// what is on disk (task logs, delete markers).
pub async fn must_write_atomic(path: &Path, data: &[u8]) {
	if let Err(e) = write_atomic(path, data).await {
		error!("FATAL: cannot write {}: {}", path.display(), e);
		std::process::abort();
	}
}

struct DeleteOnDrop(Option<PathBuf>);

impl DeleteOnDrop {
	fn cancel(&mut self) {
		drop(self.0.take());
	}
}

impl Drop for DeleteOnDrop {
	fn drop(&mut self) {
		if let Some(path) = self.0.take() {
			tokio::spawn(async move {
				if let Err(e) = fs::remove_file(&path).await {
					debug!("DeleteOnDrop failed for {}: {}", path.display(), e);
				}
			});
		}
	}
}
