use std::path::PathBuf;
use std::sync::Arc;

use tokio::sync::watch;

use lumber_util::background::BackgroundRunner;
use lumber_util::config::*;
use lumber_util::error::Error;

use lumber_api::InternalApiServer;
use lumber_select::StorageNodesClient;
use lumber_storage::delete::NoopDeleteEngine;
use lumber_storage::partition::Storage;
use lumber_storage::worker::TaskWorker;

async fn wait_from(mut chan: watch::Receiver<bool>) {
	while !*chan.borrow() {
		if chan.changed().await.is_err() {
			return;
		}
	}
}

pub async fn run_server(config_file: PathBuf) -> Result<(), Error> {
	info!("Loading configuration...");
	let config = read_config(config_file)?;

	info!("Opening storage...");
	// The select pipeline ships as a separate component; a bare node
	// answers delete dispatches with no matching rows.
	let storage = Storage::open(config.data_dir.clone(), Arc::new(NoopDeleteEngine))
		.map_err(|e| Error::Message(e.to_string()))?;

	info!("Initializing background runner...");
	let watch_cancel = watch_shutdown_signal();
	let (background, await_background_done) = BackgroundRunner::new(watch_cancel.clone());

	info!("Spawning the async task worker...");
	background.spawn_worker(TaskWorker::new(storage.clone()));

	let nodes = if config.storage_nodes.is_empty() {
		None
	} else {
		info!(
			"Aggregating {} storage node(s) on list requests",
			config.storage_nodes.len()
		);
		Some(StorageNodesClient::new(&config.storage_nodes))
	};

	info!("Initializing internal API server...");
	let api_server = InternalApiServer::new(storage.clone(), nodes, config.max_concurrent_requests);

	info!("Launching internal API server...");
	let api_handle = tokio::spawn(api_server.run(
		config.internal_api_bind_addr,
		wait_from(watch_cancel.clone()),
	));

	if let Err(e) = api_handle.await? {
		error!("Internal API server exited with error: {}", e);
	} else {
		info!("Internal API server exited without error.");
	}

	// Drop all references so that stuff can terminate properly
	drop(storage);

	// Await for all background tasks to end
	await_background_done.await?;

	info!("Cleaning up...");

	Ok(())
}

#[cfg(unix)]
fn watch_shutdown_signal() -> watch::Receiver<bool> {
	use tokio::signal::unix::*;

	let (send_cancel, watch_cancel) = watch::channel(false);
	tokio::spawn(async move {
		let mut sigint = signal(SignalKind::interrupt()).expect("Failed to install SIGINT handler");
		let mut sigterm =
			signal(SignalKind::terminate()).expect("Failed to install SIGTERM handler");
		let mut sighup = signal(SignalKind::hangup()).expect("Failed to install SIGHUP handler");
		tokio::select! {
			_ = sigint.recv() => info!("Received SIGINT, shutting down."),
			_ = sigterm.recv() => info!("Received SIGTERM, shutting down."),
			_ = sighup.recv() => info!("Received SIGHUP, shutting down."),
		}
		send_cancel.send(true).unwrap();
	});
	watch_cancel
}

#[cfg(windows)]
fn watch_shutdown_signal() -> watch::Receiver<bool> {
	use tokio::signal::windows::*;

	let (send_cancel, watch_cancel) = watch::channel(false);
	tokio::spawn(async move {
		let mut sigint = ctrl_c().expect("Failed to install Ctrl-C handler");
		let mut sigclose = ctrl_close().expect("Failed to install Ctrl-Close handler");
		tokio::select! {
			_ = sigint.recv() => info!("Received Ctrl-C, shutting down."),
			_ = sigclose.recv() => info!("Received Ctrl-Close, shutting down."),
		}
		send_cancel.send(true).unwrap();
	});
	watch_cancel
}
