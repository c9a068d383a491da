use std::path::PathBuf;

use clap::Parser;
use ycsb_db::verify::{LoadPattern, OpPath};

#[derive(Parser, Debug)]
#[command(term_width = 0)]
pub struct Args {
    /// The database backend to run against (see --list)
    #[arg(short, long, default_value = "memory")]
    pub database: String,

    /// List registered backends and their capabilities, then exit
    #[arg(long)]
    pub list: bool,

    /// JSON file with backend parameters: {"params": {"key": "value"}}
    #[arg(long)]
    pub config: Option<PathBuf>,

    /// Backend parameter override, may be repeated (e.g. -p rocksdb.dir=/tmp/db)
    #[arg(short = 'p', long = "property")]
    pub properties: Vec<String>,

    /// Table name used for every record
    #[arg(long, default_value = "usertable")]
    pub table: String,

    /// Number of records to load
    #[arg(long, default_value = "1000")]
    pub record_count: u64,

    /// Number of concurrent workers
    #[arg(long, default_value = "1")]
    pub num_clients: usize,

    /// Operations used to drive the backend; falls back to single if unsupported
    #[arg(long, default_value = "single")]
    pub path: OpPath,

    /// Records per transaction or batch call
    #[arg(long, default_value = "100")]
    pub chunk_size: usize,

    /// Pattern for loading initial data (sequential or random)
    #[arg(long, default_value = "sequential")]
    pub load_pattern: LoadPattern,

    /// Abort the run after this many seconds
    #[arg(long)]
    pub timeout_secs: Option<u64>,

    /// Number of tokio worker threads (defaults to the CPU count)
    #[arg(long)]
    pub worker_threads: Option<usize>,

    /// Stack size for tokio worker threads
    #[arg(long)]
    pub thread_stack_size: Option<usize>,

    /// Maximum number of tokio blocking threads
    #[arg(long)]
    pub max_blocking_threads: Option<usize>,
}
