use anyhow::Context;
use std::{
    fmt,
    fs::{canonicalize, create_dir_all},
    path::PathBuf,
    str::FromStr,
    time::Duration,
};

/// Memory ceiling handed to every worker unless configured otherwise.
pub const DEFAULT_MEMORY: &str = "8G";
/// Seed used when the caller provides none.
pub const DEFAULT_SEED: &[u8] = b"fuzz";
/// Address-space ceiling of the dictionary builder, in megabytes.
pub const DEFAULT_DICT_MEM_LIMIT: u64 = 4096;
/// Wall-clock limit of the dictionary builder.
pub const DEFAULT_DICT_TIMEOUT: Duration = Duration::from_secs(300);

/// Flags the orchestrator sets itself; extra worker arguments must not repeat them.
const OWNED_FLAGS: [&str; 6] = ["-i", "-o", "-M", "-S", "-m", "-Q"];

/// How workers execute the target.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExecMode {
    /// Uninstrumented binary run under the QEMU tracer (`-Q`).
    Qemu,
    /// Binary built with compile-time instrumentation.
    Native,
}

impl FromStr for ExecMode {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "qemu" => Ok(ExecMode::Qemu),
            "native" => Ok(ExecMode::Native),
            _ => Err(format!("unknown exec mode '{}', expected qemu or native", s)),
        }
    }
}

impl fmt::Display for ExecMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ExecMode::Qemu => f.write_str("qemu"),
            ExecMode::Native => f.write_str("native"),
        }
    }
}

/// What the second worker of a multi-worker start is for.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AssistPolicy {
    /// Mark the second worker as the one to pair with a concolic helper.
    Reserve,
    /// Second worker is a plain secondary.
    None,
}

impl FromStr for AssistPolicy {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "reserve" => Ok(AssistPolicy::Reserve),
            "none" => Ok(AssistPolicy::None),
            _ => Err(format!(
                "unknown assist policy '{}', expected reserve or none",
                s
            )),
        }
    }
}

#[derive(Debug, Clone)]
pub struct Config {
    /// Binary under test.
    pub target: PathBuf,
    /// Arguments of the target itself, after `--`.
    pub target_args: Vec<String>,
    /// Parent of the job directory.
    pub work_dir: PathBuf,
    /// Number of workers `start` launches.
    pub job: usize,
    pub seeds: Vec<Vec<u8>>,
    /// Forwarded verbatim to every worker.
    pub extra_args: Vec<String>,
    pub create_dictionary: bool,
    /// Worker memory ceiling, in the engine's `-m` syntax.
    pub memory: String,
    pub exec_mode: ExecMode,
    /// Skip binary introspection and use this tracer arch.
    pub tracer_arch: Option<String>,
    /// Holds `afl/afl-fuzz`, `afl/tracers/<arch>/` and `create_dict.py`.
    pub bin_dir: PathBuf,
    pub dict_mem_limit: Option<u64>,
    pub dict_timeout: Duration,
    pub assist: AssistPolicy,

    pub run_time: Option<Duration>,
    pub report_interval: Duration,
    pub stop_on_crash: bool,
    /// Where `boot` exports harvested crashes, defaults to `<job>/crashes`.
    pub crash_dir: Option<PathBuf>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            target: PathBuf::from("./target"),
            target_args: Vec::new(),
            work_dir: PathBuf::from("./work"),
            job: 1,
            seeds: vec![DEFAULT_SEED.to_vec()],
            extra_args: Vec::new(),
            create_dictionary: false,
            memory: DEFAULT_MEMORY.to_string(),
            exec_mode: ExecMode::Qemu,
            tracer_arch: None,
            bin_dir: PathBuf::from("./bin"),
            dict_mem_limit: Some(DEFAULT_DICT_MEM_LIMIT),
            dict_timeout: DEFAULT_DICT_TIMEOUT,
            assist: AssistPolicy::Reserve,

            run_time: None,
            report_interval: Duration::from_secs(10),
            stop_on_crash: false,
            crash_dir: None,
        }
    }
}

impl Config {
    pub fn check(&self) -> anyhow::Result<()> {
        if !self.target.is_file() {
            anyhow::bail!("bad target binary: {}", self.target.display());
        }
        if self.target_id().is_none() {
            anyhow::bail!("target has no file name: {}", self.target.display());
        }
        if self.job == 0 {
            anyhow::bail!("worker count should be at least 1");
        }
        check_mem_spec(&self.memory)
            .map_err(anyhow::Error::msg)
            .context("bad worker memory ceiling")?;
        check_extra_args(&self.extra_args)
            .map_err(anyhow::Error::msg)
            .context("bad extra worker args")?;
        if self.work_dir.exists() && !self.work_dir.is_dir() {
            anyhow::bail!("work dir is not a directory: {}", self.work_dir.display());
        }
        let afl_fuzz = self.afl_fuzz();
        if !afl_fuzz.is_file() {
            anyhow::bail!("fuzzing engine not found: {}", afl_fuzz.display());
        }
        if self.create_dictionary {
            let create_dict = self.create_dict();
            if !create_dict.is_file() {
                anyhow::bail!("dictionary builder not found: {}", create_dict.display());
            }
        }
        if let Some(arch) = self.tracer_arch.as_ref() {
            if arch.is_empty() || arch.contains('/') {
                anyhow::bail!("bad tracer arch: '{}'", arch);
            }
            if self.exec_mode == ExecMode::Qemu {
                let trace = self.qemu_trace(arch);
                if !trace.is_file() {
                    anyhow::bail!("qemu tracer not found: {}", trace.display());
                }
            }
        }
        if self.dict_mem_limit == Some(0) {
            anyhow::bail!("dictionary builder memory ceiling should be positive");
        }
        if self.dict_timeout.as_millis() == 0 {
            anyhow::bail!("dictionary builder timeout should be positive");
        }
        if self.report_interval.as_millis() == 0 {
            anyhow::bail!("report interval should be positive");
        }
        Ok(())
    }

    pub fn fixup(&mut self) -> anyhow::Result<()> {
        if !self.work_dir.exists() {
            create_dir_all(&self.work_dir).with_context(|| {
                format!("failed to create work dir: {}", self.work_dir.display())
            })?;
        }
        self.work_dir = canonicalize(&self.work_dir)
            .with_context(|| format!("failed to resolve {}", self.work_dir.display()))?;
        self.target = canonicalize(&self.target)
            .with_context(|| format!("failed to resolve {}", self.target.display()))?;
        self.bin_dir = canonicalize(&self.bin_dir)
            .with_context(|| format!("failed to resolve {}", self.bin_dir.display()))?;
        Ok(())
    }

    /// Stable name of the campaign, the file name of the target.
    pub fn target_id(&self) -> Option<String> {
        self.target
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
    }

    pub fn afl_fuzz(&self) -> PathBuf {
        self.bin_dir.join("afl").join("afl-fuzz")
    }

    /// Directory of the tracer helpers for `arch`, exported to workers as `AFL_PATH`.
    pub fn tracer_dir(&self, arch: &str) -> PathBuf {
        self.bin_dir.join("afl").join("tracers").join(arch)
    }

    pub fn qemu_trace(&self, arch: &str) -> PathBuf {
        self.tracer_dir(arch).join("afl-qemu-trace")
    }

    pub fn create_dict(&self) -> PathBuf {
        self.bin_dir.join("create_dict.py")
    }
}

/// Validate a memory ceiling written the way the engine's `-m` accepts it.
pub fn check_mem_spec(spec: &str) -> Result<(), String> {
    if spec == "none" {
        return Ok(());
    }
    let digits_end = spec
        .find(|c: char| !c.is_ascii_digit())
        .unwrap_or_else(|| spec.len());
    let (digits, suffix) = spec.split_at(digits_end);
    let value: u64 = digits
        .parse()
        .map_err(|_| format!("'{}' is not a memory size", spec))?;
    let megabytes = match suffix {
        "" | "M" => Some(value),
        "k" => Some(value / 1024),
        "G" => value.checked_mul(1024),
        "T" => value.checked_mul(1024 * 1024),
        _ => return Err(format!("unknown memory suffix '{}' in '{}'", suffix, spec)),
    };
    match megabytes {
        None => Err(format!("memory size '{}' overflows", spec)),
        Some(m) if m < 5 => Err(format!("memory size '{}' is dangerously low", spec)),
        Some(_) => Ok(()),
    }
}

/// Reject extra worker arguments that would clash with the generated command line.
pub fn check_extra_args(args: &[String]) -> Result<(), String> {
    for arg in args {
        if arg.is_empty() {
            return Err("empty argument".to_string());
        }
        if arg == "--" {
            return Err("'--' would end the worker options early".to_string());
        }
        for flag in OWNED_FLAGS.iter() {
            if arg.starts_with(*flag) {
                return Err(format!(
                    "'{}' repeats {}, which is set for every worker",
                    arg, flag
                ));
            }
        }
    }
    Ok(())
}
