//! Launch and supervise independent child processes.

use nix::{
    errno::Errno,
    sys::signal::{kill, Signal},
    unistd::{setsid, Pid},
};
use std::{
    convert::TryFrom,
    io,
    os::unix::process::{CommandExt, ExitStatusExt},
    process::{Child, Command, ExitStatus},
    thread::sleep,
    time::{Duration, Instant},
};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ProcError {
    #[error("failed to spawn {cmd}: {source}")]
    Spawn { cmd: String, source: io::Error },
    #[error("failed to send {sig} to pid {pid}: {source}")]
    Signal { pid: u32, sig: Signal, source: Errno },
    #[error("failed to wait pid {pid}: {source}")]
    Wait { pid: u32, source: io::Error },
}

/// Run the child in its own session, so terminal signals aimed at us do not reach it.
pub fn detach(cmd: &mut Command) -> &mut Command {
    unsafe {
        cmd.pre_exec(|| {
            let _ = setsid();
            Ok(())
        });
    }
    cmd
}

/// Cap the address space of the child to `megabytes`.
pub fn limit_memory(cmd: &mut Command, megabytes: u64) -> &mut Command {
    use nix::libc;

    let bytes = megabytes.saturating_mul(1024 * 1024) as libc::rlim_t;
    unsafe {
        cmd.pre_exec(move || {
            let lim = libc::rlimit {
                rlim_cur: bytes,
                rlim_max: bytes,
            };
            if libc::setrlimit(libc::RLIMIT_AS, &lim) != 0 {
                return Err(io::Error::last_os_error());
            }
            Ok(())
        });
    }
    cmd
}

/// Spawn `cmd`, keeping its program name around for the error.
pub fn spawn(cmd: &mut Command) -> Result<Child, ProcError> {
    cmd.spawn().map_err(|source| ProcError::Spawn {
        cmd: cmd.get_program().to_string_lossy().into_owned(),
        source,
    })
}

/// Signal-zero probe: does a process with this pid currently exist?
///
/// A process owned by another user still counts as existing.
pub fn is_alive(pid: u32) -> bool {
    if pid == 0 || pid > i32::MAX as u32 {
        return false;
    }
    match kill(Pid::from_raw(pid as i32), None) {
        Ok(()) => true,
        Err(Errno::EPERM) => true,
        Err(_) => false,
    }
}

/// True while `child` has not exited. Reaps it if it has.
pub fn running(child: &mut Child) -> bool {
    matches!(child.try_wait(), Ok(None))
}

const POLL: Duration = Duration::from_millis(20);

fn send(pid: u32, sig: Signal) -> Result<(), ProcError> {
    log::debug!("sending {} to {}", sig, pid);
    match kill(Pid::from_raw(pid as i32), sig) {
        Ok(()) | Err(Errno::ESRCH) => Ok(()),
        Err(source) => Err(ProcError::Signal { pid, sig, source }),
    }
}

/// Ask `child` to exit with SIGTERM and wait until it did.
pub fn terminate(child: &mut Child) -> Result<ExitStatus, ProcError> {
    let pid = child.id();
    if let Ok(Some(status)) = child.try_wait() {
        return Ok(status);
    }
    send(pid, Signal::SIGTERM)?;
    child.wait().map_err(|source| ProcError::Wait { pid, source })
}

/// Wait at most `timeout` for `child` to exit. `None` if it is still running.
pub fn wait_timeout(child: &mut Child, timeout: Duration) -> Result<Option<ExitStatus>, ProcError> {
    let pid = child.id();
    let deadline = Instant::now() + timeout;
    loop {
        match child.try_wait() {
            Ok(Some(status)) => return Ok(Some(status)),
            Ok(None) => (),
            Err(source) => return Err(ProcError::Wait { pid, source }),
        }
        let now = Instant::now();
        if now >= deadline {
            return Ok(None);
        }
        sleep(POLL.min(deadline - now));
    }
}

/// SIGTERM, SIGKILL once `grace` passed, then reap.
pub fn kill_within(child: &mut Child, grace: Duration) -> Result<ExitStatus, ProcError> {
    let pid = child.id();
    if let Ok(Some(status)) = child.try_wait() {
        return Ok(status);
    }
    send(pid, Signal::SIGTERM)?;
    if let Some(status) = wait_timeout(child, grace)? {
        return Ok(status);
    }
    send(pid, Signal::SIGKILL)?;
    child.wait().map_err(|source| ProcError::Wait { pid, source })
}

/// Signal that terminated the process, if it did not exit on its own.
pub fn fault_signal(status: &ExitStatus) -> Option<i32> {
    status.signal()
}

pub fn describe(status: &ExitStatus) -> String {
    if let Some(code) = status.code() {
        format!("exited with code {}", code)
    } else if let Some(sig) = status.signal() {
        match Signal::try_from(sig) {
            Ok(s) => format!("terminated by {}({})", s, sig),
            Err(_) => format!("terminated by signal {}", sig),
        }
    } else {
        "exited abnormally".to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::process::Stdio;

    fn sleeper() -> Command {
        let mut cmd = Command::new("sleep");
        cmd.arg("30").stdout(Stdio::null()).stderr(Stdio::null());
        cmd
    }

    #[test]
    fn terminate_stops_a_live_child() {
        let mut child = spawn(detach(&mut sleeper())).unwrap();
        let pid = child.id();
        assert!(is_alive(pid));
        assert!(running(&mut child));

        let status = terminate(&mut child).unwrap();
        assert_eq!(fault_signal(&status), Some(Signal::SIGTERM as i32));
        assert!(!is_alive(pid));
        assert!(!running(&mut child));
    }

    #[test]
    fn terminate_after_exit_is_harmless() {
        let mut child = spawn(Command::new("true").stdout(Stdio::null())).unwrap();
        child.wait().unwrap();
        let status = terminate(&mut child).unwrap();
        assert!(status.success());
    }

    #[test]
    fn wait_timeout_returns_on_exit_or_deadline() {
        let mut quick = spawn(Command::new("true").stdout(Stdio::null())).unwrap();
        let status = wait_timeout(&mut quick, Duration::from_secs(5)).unwrap();
        assert!(status.map_or(false, |s| s.success()));

        let mut slow = spawn(&mut sleeper()).unwrap();
        let begin = Instant::now();
        assert!(wait_timeout(&mut slow, Duration::from_millis(100)).unwrap().is_none());
        assert!(begin.elapsed() < Duration::from_secs(5));
        assert!(running(&mut slow));
        terminate(&mut slow).unwrap();
    }

    #[test]
    fn kill_within_escalates_past_ignored_term() {
        let mut cmd = Command::new("sh");
        cmd.args(&["-c", "trap '' TERM; while :; do sleep 1; done"])
            .stdout(Stdio::null())
            .stderr(Stdio::null());
        let mut child = spawn(&mut cmd).unwrap();
        let pid = child.id();
        // let the shell install its trap
        sleep(Duration::from_millis(200));

        let status = kill_within(&mut child, Duration::from_millis(200)).unwrap();
        assert_eq!(fault_signal(&status), Some(Signal::SIGKILL as i32));
        assert!(!is_alive(pid));
    }

    #[test]
    fn memory_ceiling_still_runs_small_programs() {
        let mut cmd = Command::new("true");
        limit_memory(&mut cmd, 512);
        let status = spawn(&mut cmd).unwrap().wait().unwrap();
        assert!(status.success());
    }

    #[test]
    fn missing_program_is_a_spawn_error() {
        let err = spawn(&mut Command::new("/nonexistent/herd-no-such-tool")).unwrap_err();
        assert!(matches!(err, ProcError::Spawn { .. }));
        assert!(err.to_string().contains("herd-no-such-tool"));
    }

    #[test]
    fn bogus_pids_are_dead() {
        assert!(!is_alive(0));
        assert!(!is_alive(u32::MAX));
    }

    #[test]
    fn describe_exit_and_signal() {
        let status = Command::new("sh").args(&["-c", "exit 3"]).status().unwrap();
        assert_eq!(describe(&status), "exited with code 3");
        let status = Command::new("sh")
            .args(&["-c", "kill -SEGV $$"])
            .status()
            .unwrap();
        assert_eq!(fault_signal(&status), Some(11));
        assert!(describe(&status).contains("SIGSEGV"));
    }
}
