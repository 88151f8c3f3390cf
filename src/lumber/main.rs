//! Lumber CLI entrypoint
#[macro_use]
extern crate tracing;

mod server;

use std::path::PathBuf;

use structopt::StructOpt;

#[derive(StructOpt, Debug)]
#[structopt(name = "lumber", about = "lumber log-storage node")]
struct Opt {
	/// Configuration file location
	#[structopt(short = "c", long = "config", default_value = "./lumber.toml")]
	config_file: PathBuf,

	#[structopt(subcommand)]
	cmd: Command,
}

#[derive(StructOpt, Debug)]
enum Command {
	/// Run the storage node
	#[structopt(name = "server")]
	Server,
}

#[tokio::main]
async fn main() {
	if std::env::var("RUST_LOG").is_err() {
		std::env::set_var("RUST_LOG", "lumber=info")
	}
	tracing_subscriber::fmt()
		.with_writer(std::io::stderr)
		.with_env_filter(tracing_subscriber::filter::EnvFilter::from_default_env())
		.init();

	let opt = Opt::from_args();

	let res = match opt.cmd {
		Command::Server => server::run_server(opt.config_file).await,
	};
	if let Err(e) = res {
		error!("{}", e);
		std::process::exit(1);
	}
}
