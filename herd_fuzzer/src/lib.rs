//! Herd: supervise a pool of AFL-style fuzzing workers against one target.

#[macro_use]
pub mod job_log;
pub mod arch;
pub mod campaign;
pub mod config;
pub mod corpus;
pub mod crash;
pub mod dict;
pub mod preflight;
pub mod stats;
pub mod util;
pub mod worker;

#[cfg(test)]
mod testutil;

use crate::{
    campaign::Campaign,
    config::Config,
    stats::CampaignStats,
    util::{stop_req, stop_signal, stop_soon},
};
use anyhow::Context;
use serde_derive::Serialize;
use std::{
    fs::write,
    os::raw::c_int,
    path::PathBuf,
    thread::sleep,
    time::{Duration, Instant},
};

pub const SUMMARY_FILE: &str = "herd_summary.json";

const NAP: Duration = Duration::from_millis(100);

#[derive(Debug, Serialize)]
struct WorkerSummary {
    name: String,
    primary: bool,
    pid: u32,
    assist: bool,
    log: PathBuf,
}

#[derive(Debug, Serialize)]
struct Summary {
    target_id: String,
    run_secs: u64,
    stop_reason: String,
    workers: Vec<WorkerSummary>,
    unique_crashes: u64,
    exported_crashes: usize,
    crash_dir: PathBuf,
    stats: CampaignStats,
}

pub fn boot(mut config: Config) -> anyhow::Result<()> {
    config.check().context("config error")?;
    config.fixup().context("failed to fixup config")?;
    let run_time = config.run_time;
    let report_interval = config.report_interval;
    let stop_on_crash = config.stop_on_crash;
    let crash_dir = config.crash_dir.clone();

    let mut campaign = Campaign::new(config).context("failed to set up campaign")?;
    let id = campaign.target_id().to_string();
    if campaign.is_resuming() {
        job_info!(id, "resuming from {}", campaign.job_dir().display());
    }
    setup_signal_handler().context("failed to setup signal handler")?;

    campaign
        .start()
        .context("failed to start campaign")?
        .into_result()
        .context("target rejected by preflight check")?;

    let started = Instant::now();
    let stop_reason = loop {
        if let Some(reason) = nap(report_interval) {
            break reason;
        }
        let stats = campaign.stats();
        job_info!(
            id,
            "workers: {}/{}, exec: {}, paths: {}, uniq crashes: {}, run: {}s",
            campaign.running_workers(),
            campaign.workers().len(),
            stats.execs_done(),
            stats.paths_total(),
            stats.unique_crashes(),
            started.elapsed().as_secs()
        );
        job_debug!(id, "reported pids: {:?}", stats.reported_pids());

        if run_time.map_or(false, |t| started.elapsed() >= t) {
            break "run time reached".to_string();
        }
        if !campaign.alive() {
            job_warn!(id, "all workers exited");
            break "all workers exited".to_string();
        }
        if stop_on_crash && stats.found_crash() {
            break "crash found".to_string();
        }
    };
    job_info!(id, "stopping: {}", stop_reason);

    campaign.kill();
    let crashes = campaign.crashes();
    let crash_dir = crash_dir.unwrap_or_else(|| campaign.job_dir().join("crashes"));
    let mut exported = 0;
    if !crashes.is_empty() {
        exported = crash::export(&crashes, &crash_dir)
            .with_context(|| format!("failed to export crashes to {}", crash_dir.display()))?;
        job_info!(
            id,
            "{} unique crash(es), {} new in {}",
            crashes.len(),
            exported,
            crash_dir.display()
        );
    }

    let stats = campaign.stats();
    let summary = Summary {
        target_id: id.clone(),
        run_secs: campaign.elapsed().unwrap_or_default().as_secs(),
        stop_reason,
        workers: campaign
            .workers()
            .iter()
            .map(|w| WorkerSummary {
                name: w.role().name(),
                primary: w.role().is_primary(),
                pid: w.pid(),
                assist: w.is_assist(),
                log: w.log_path().to_path_buf(),
            })
            .collect(),
        unique_crashes: stats.unique_crashes(),
        exported_crashes: exported,
        crash_dir,
        stats,
    };
    let summary_file = campaign.job_dir().join(SUMMARY_FILE);
    let content = serde_json::to_string_pretty(&summary).context("failed to dump summary")?;
    write(&summary_file, content)
        .with_context(|| format!("failed to write {}", summary_file.display()))?;
    job_info!(id, "summary written to {}", summary_file.display());
    Ok(())
}

/// Sleep for `d` in short steps, returning early with a reason once a stop is requested.
fn nap(d: Duration) -> Option<String> {
    let deadline = Instant::now() + d;
    loop {
        if stop_soon() {
            let reason = match stop_signal() {
                Some(sig) => format!("{} received", named_signal(sig)),
                None => "stop requested".to_string(),
            };
            return Some(reason);
        }
        let now = Instant::now();
        if now >= deadline {
            return None;
        }
        sleep(NAP.min(deadline - now));
    }
}

fn named_signal(sig: c_int) -> String {
    signal_hook::low_level::signal_name(sig)
        .map(|n| format!("{}({})", n, sig))
        .unwrap_or_else(|| sig.to_string())
}

fn setup_signal_handler() -> anyhow::Result<()> {
    use signal_hook::consts::TERM_SIGNALS;
    use signal_hook::iterator::exfiltrator::WithOrigin;
    use signal_hook::iterator::SignalsInfo;

    let mut signals = SignalsInfo::<WithOrigin>::new(TERM_SIGNALS)?;
    std::thread::spawn(move || {
        if let Some(info) = signals.into_iter().next() {
            let from = if let Some(p) = info.process {
                format!("(pid: {}, uid: {})", p.pid, p.uid)
            } else {
                "unknown".to_string()
            };
            log::info!(
                "{} recved, from: {}, cause: {:?}",
                named_signal(info.signal),
                from,
                info.cause
            );
            println!("please waiting workers to exit...");
            stop_req(info.signal);
        }
    });
    Ok(())
}
