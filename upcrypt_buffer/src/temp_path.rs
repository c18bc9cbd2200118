use std::{
    path::{Path, PathBuf},
    sync::{
        atomic::{AtomicU64, Ordering},
        OnceLock,
    },
};

/// Random token picked once per process.
static PROCESS_TOKEN: OnceLock<String> = OnceLock::new();

/// Never reset, so ids within a process never repeat.
static COUNTER: AtomicU64 = AtomicU64::new(0);

fn process_token() -> &'static str {
    PROCESS_TOKEN.get_or_init(|| format!("{:032x}", rand::random::<u128>()))
}

/// Zero-padded to 8 digits. Past 100 million ids they simply get longer.
fn unique_id() -> String {
    format!("{:08}", COUNTER.fetch_add(1, Ordering::Relaxed))
}

/// Returns a file path in `repository` (or the system temp directory)
/// that no other buffer in any process will use.
pub fn unique_temp_path(repository: Option<&Path>) -> PathBuf {
    let dir = repository.map_or_else(std::env::temp_dir, Path::to_path_buf);
    dir.join(format!("upload_{}_{}.tmp", process_token(), unique_id()))
}
