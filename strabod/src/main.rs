#[macro_use]
extern crate log;

use structopt::StructOpt;

use strabo::filesystem::FilesystemManager;
use strabo::node::{Environment, Node};
use strabo::reactor::Reactor;
use strabo::topology::NetworkTopology;

use std::net::TcpListener;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

fn main() {
    // initialize logger
    env_logger::init();

    // parse arguments
    let opt = Opt::from_args();
    let status = StatusFile::new(opt.status_file.clone());
    status.write("Starting");

    // resolve the local hostname; HOSTNAME overrides detection
    let hostname = match &opt.hostname {
        Some(hostname) => hostname.clone(),
        None => match std::env::var("HOSTNAME") {
            Ok(hostname) if !hostname.is_empty() => hostname,
            _ => hostname::get()
                .map(|x| x.to_string_lossy().to_string())
                .unwrap_or_else(|_| "localhost".to_string()),
        },
    };

    // load cluster topology
    status.write("LoadingTopology");
    let topology = match NetworkTopology::load(&opt.topology) {
        Ok(topology) => Arc::new(topology),
        Err(e) => {
            status.write(&format!(
                "failed to load topology: {}", e));
            panic!("failed to load topology '{:?}': {}",
                opt.topology, e);
        },
    };

    if !topology.contains_host(&hostname) {
        status.write(&format!(
            "host '{}' not in topology", hostname));
        panic!("host '{}' is not part of the cluster topology",
            hostname);
    }

    // restore filesystem registry
    status.write("RestoringFilesystems");
    if let Err(e) = std::fs::create_dir_all(&opt.directory) {
        status.write(&format!(
            "failed to create storage directory: {}", e));
        panic!("failed to create storage directory '{:?}': {}",
            opt.directory, e);
    }

    let filesystems = match FilesystemManager::open(&opt.directory) {
        Ok(filesystems) => filesystems,
        Err(e) => {
            status.write(&format!(
                "failed to restore filesystems: {}", e));
            panic!("failed to restore filesystems from '{:?}': {}",
                opt.directory, e);
        },
    };
    info!("restored {} filesystems", filesystems.len());

    // bind the listener
    status.write("Binding");
    let listener = match TcpListener::bind(
            format!("0.0.0.0:{}", opt.port)) {
        Ok(listener) => listener,
        Err(e) => {
            status.write(&format!(
                "failed to bind port {}: {}", opt.port, e));
            panic!("failed to bind port {}: {}", opt.port, e);
        },
    };

    // write pid file
    if let Some(path) = &opt.pid_file {
        if let Err(e) = std::fs::write(path,
                format!("{}\n", std::process::id())) {
            status.write(&format!(
                "failed to write pid file: {}", e));
            panic!("failed to write pid file '{:?}': {}", path, e);
        }
    }

    // assemble the node on the dispatch loop
    let mut reactor = Reactor::new();
    let _ = reactor.listen(listener);
    let _ = reactor.spawn_ticker(Duration::from_millis(100));

    let environment = Environment {
        hostname: hostname.clone(),
        port: opt.port,
        query_timeout: Duration::from_secs(opt.query_timeout),
        worker_threads: opt.worker_threads,
    };
    let mut node = Node::new(environment, topology,
        filesystems, reactor.sender());

    info!("node '{}' online on port {}", hostname, opt.port);
    status.write("Online");
    reactor.run(&mut node);

    // graceful shutdown
    status.write("ShuttingDown");
    if let Some(path) = &opt.pid_file {
        if let Err(e) = std::fs::remove_file(path) {
            warn!("failed to remove pid file '{:?}': {}", path, e);
        }
    }

    info!("node '{}' stopped", hostname);
}

// single line, rewritten on every coarse state change
struct StatusFile {
    path: Option<PathBuf>,
}

impl StatusFile {
    fn new(path: Option<PathBuf>) -> StatusFile {
        StatusFile {
            path: path,
        }
    }

    fn write(&self, state: &str) {
        if let Some(path) = &self.path {
            if let Err(e) = std::fs::write(path,
                    format!("{}\n", state)) {
                warn!("failed to write status file '{:?}': {}",
                    path, e);
            }
        }
    }
}

#[derive(Debug, StructOpt)]
#[structopt(name = "strabod",
    about="Storage node in the strabo fabric.")]
struct Opt {
    #[structopt(short="d", long="directory",
        help="block storage directory.")]
    directory: PathBuf,

    #[structopt(short="t", long="topology",
        help="cluster descriptor directory.")]
    topology: PathBuf,

    #[structopt(short="n", long="hostname",
        help="local hostname override.")]
    hostname: Option<String>,

    #[structopt(short="p", long="port",
        help="listen port.", default_value="15606")]
    port: u16,

    #[structopt(short="s", long="status-file",
        help="coarse node status file.")]
    status_file: Option<PathBuf>,

    #[structopt(long="pid-file",
        help="pid file written at startup, removed at shutdown.")]
    pid_file: Option<PathBuf>,

    #[structopt(short="q", long="query-timeout",
        help="query deadline in seconds.", default_value="30")]
    query_timeout: u64,

    #[structopt(short="w", long="worker-threads",
        help="scan worker threads.", default_value="4")]
    worker_threads: usize,
}
