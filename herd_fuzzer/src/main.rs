use anyhow::Context;
use env_logger::{Env, TimestampPrecision};
use herd_fuzzer::{
    boot,
    config::{AssistPolicy, Config, ExecMode, DEFAULT_DICT_MEM_LIMIT, DEFAULT_SEED},
    corpus::load_seed_dir,
};
use std::{path::PathBuf, time::Duration};
use structopt::StructOpt;

#[derive(Debug, StructOpt)]
#[structopt(name = "herd", about = "Run a pool of AFL workers against one target.")]
struct Settings {
    /// Target binary to fuzz.
    target: PathBuf,
    /// Arguments of the target, after `--`.
    #[structopt(last = true)]
    target_args: Vec<String>,
    /// Parallel fuzzing workers.
    #[structopt(long, short = "j", default_value = "1")]
    job: usize,
    /// Directory holding the job directories.
    #[structopt(long, short = "w", default_value = "work")]
    work_dir: PathBuf,
    /// Directory holding afl/ and create_dict.py.
    #[structopt(long, short = "b", default_value = "bin")]
    bin_dir: PathBuf,
    /// Seed input, may be repeated.
    #[structopt(long, short = "s", number_of_values = 1)]
    seed: Vec<String>,
    /// Directory whose files are used as seeds.
    #[structopt(long, short = "i")]
    seed_dir: Option<PathBuf>,
    /// Extra argument passed to every worker, may be repeated.
    #[structopt(long = "afl-arg", number_of_values = 1, allow_hyphen_values = true)]
    afl_args: Vec<String>,
    /// Build a dictionary from the target's strings.
    #[structopt(long)]
    create_dict: bool,
    /// Memory ceiling of each worker.
    #[structopt(long, short = "m", default_value = "8G")]
    memory: String,
    /// Execution mode: qemu or native.
    #[structopt(long, default_value = "qemu")]
    mode: ExecMode,
    /// QEMU tracer arch, detected from the target if absent.
    #[structopt(long)]
    arch: Option<String>,
    /// Memory ceiling of the dictionary builder in megabytes, 0 for none.
    #[structopt(long)]
    dict_mem: Option<u64>,
    /// Seconds the dictionary builder may run.
    #[structopt(long, default_value = "300")]
    dict_timeout: u64,
    /// Role of the second worker: reserve or none.
    #[structopt(long, default_value = "reserve")]
    assist: AssistPolicy,
    /// Stop after this many seconds.
    #[structopt(long, short = "t")]
    run_time: Option<u64>,
    /// Seconds between two status reports.
    #[structopt(long, default_value = "10")]
    report_interval: u64,
    /// Stop as soon as a worker reports a crash.
    #[structopt(long)]
    stop_on_crash: bool,
    /// Directory to export distinct crashes to, `<job dir>/crashes` by default.
    #[structopt(long, short = "c")]
    crash_dir: Option<PathBuf>,
}

fn main() -> anyhow::Result<()> {
    let settings = Settings::from_args();

    let log_env = Env::new()
        .filter_or("HERD_LOG", "info")
        .default_write_style_or("auto");
    env_logger::Builder::from_env(log_env)
        .format_timestamp(Some(TimestampPrecision::Seconds))
        .init();

    let mut seeds = Vec::new();
    if let Some(dir) = settings.seed_dir.as_ref() {
        seeds = load_seed_dir(dir).context("failed to load seeds")?;
        log::info!("seeds loaded: {}", seeds.len());
    }
    seeds.extend(settings.seed.into_iter().map(String::into_bytes));
    if seeds.is_empty() {
        seeds.push(DEFAULT_SEED.to_vec());
    }

    let dict_mem_limit = match settings.dict_mem {
        Some(0) => None,
        Some(m) => Some(m),
        None => Some(DEFAULT_DICT_MEM_LIMIT),
    };

    let config = Config {
        target: settings.target,
        target_args: settings.target_args,
        work_dir: settings.work_dir,
        job: settings.job,
        seeds,
        extra_args: settings.afl_args,
        create_dictionary: settings.create_dict,
        memory: settings.memory,
        exec_mode: settings.mode,
        tracer_arch: settings.arch,
        bin_dir: settings.bin_dir,
        dict_mem_limit,
        dict_timeout: Duration::from_secs(settings.dict_timeout),
        assist: settings.assist,
        run_time: settings.run_time.map(Duration::from_secs),
        report_interval: Duration::from_secs(settings.report_interval),
        stop_on_crash: settings.stop_on_crash,
        crash_dir: settings.crash_dir,
    };

    boot(config)
}
