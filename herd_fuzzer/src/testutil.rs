//! Fake engine, tracer and builder scripts for the tests.

use crate::config::Config;
use std::{
    fs::{create_dir_all, set_permissions, write, Permissions},
    os::unix::fs::PermissionsExt,
    path::{Path, PathBuf},
    sync::{Mutex, MutexGuard},
    thread::sleep,
    time::{Duration, Instant},
};
use tempfile::TempDir;

static SPAWN_LOCK: Mutex<()> = Mutex::new(());

/// Held by every test that writes an executable or spawns a process.
///
/// A fork from another test thread can inherit a write handle of a freshly
/// written script, and exec of that script then fails with ETXTBSY.
pub fn spawn_lock() -> MutexGuard<'static, ()> {
    SPAWN_LOCK.lock().unwrap_or_else(|e| e.into_inner())
}

pub fn write_script(path: &Path, body: &str) {
    if let Some(parent) = path.parent() {
        create_dir_all(parent).unwrap();
    }
    write(path, format!("#!/bin/sh\n{}", body)).unwrap();
    set_permissions(path, Permissions::from_mode(0o755)).unwrap();
}

/// Prints its environment and arguments to the worker log, writes a status
/// file under `<out>/<name>/` and idles until terminated.
pub const FAKE_ENGINE: &str = r#"printf 'AFL_PATH=%s\n' "$AFL_PATH"
printf '%s\n' "$@"
out=""
name=""
while [ $# -gt 0 ]; do
  case "$1" in
    -o) out="$2"; shift 2 ;;
    -M|-S) name="$2"; shift 2 ;;
    --) break ;;
    *) shift ;;
  esac
done
mkdir -p "$out/$name"
printf 'start_time        : 0\nfuzzer_pid        : %s\nunique_crashes    : 0\n' "$$" > "$out/$name/fuzzer_stats"
exec sleep 30
"#;

pub const CLEAN_TRACER: &str = "cat > /dev/null\nexit 0\n";
pub const FAULTING_TRACER: &str = "kill -SEGV $$\n";
pub const DICT_BUILDER: &str = "printf 'tok_0=\"fuzz\"\\n' > \"$2\"\n";

pub const ARCH: &str = "x86_64";

pub struct Toolbox {
    pub root: TempDir,
    pub bin: PathBuf,
    pub target: PathBuf,
}

impl Toolbox {
    pub fn new(tracer: &str) -> Self {
        let root = tempfile::tempdir().unwrap();
        let bin = root.path().join("bin");
        let config = Config {
            bin_dir: bin.clone(),
            ..Config::default()
        };
        write_script(&config.afl_fuzz(), FAKE_ENGINE);
        write_script(&config.qemu_trace(ARCH), tracer);
        write_script(&config.create_dict(), DICT_BUILDER);
        let target = root.path().join("targets").join("cgc_echo");
        write_script(&target, "exit 0\n");
        Self { root, bin, target }
    }

    pub fn config(&self, job: usize) -> Config {
        Config {
            target: self.target.clone(),
            work_dir: self.root.path().join("work"),
            bin_dir: self.bin.clone(),
            tracer_arch: Some(ARCH.to_string()),
            job,
            ..Config::default()
        }
    }
}

pub fn wait_for(timeout: Duration, mut cond: impl FnMut() -> bool) -> bool {
    let deadline = Instant::now() + timeout;
    while Instant::now() < deadline {
        if cond() {
            return true;
        }
        sleep(Duration::from_millis(20));
    }
    cond()
}
