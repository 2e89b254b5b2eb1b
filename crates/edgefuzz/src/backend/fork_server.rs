//! Fork-server backend: spawns one persistent instrumented runner that forks
//! a fresh child per execution on request, amortizing target process setup.

use std::ffi::OsString;
use std::fs::{File, OpenOptions};
use std::io::{Read, Write};
use std::os::unix::io::{AsRawFd, BorrowedFd, FromRawFd, RawFd};
use std::os::unix::process::CommandExt;
use std::path::{Path, PathBuf};
use std::process::{Child, Command, Stdio};
use std::time::{Duration, Instant};

use nix::fcntl::{open, OFlag};
use nix::sys::select::{pselect, FdSet};
use nix::sys::signal::{self, SigSet, Signal};
use nix::sys::stat::Mode;
use nix::sys::time::TimeSpec;
use nix::unistd::{self, Pid};
use tempfile::TempDir;
use tracing::{debug, warn};

use super::Outcome;
use crate::coverage::{SharedMap, Trace};
use crate::error::{EdgeFuzzError, Result};

const FORKSRV_FD: RawFd = 198;
const FORKSRV_FD_OUT: RawFd = FORKSRV_FD + 1;
/// Wall-clock budget for the startup handshake, independent of the
/// per-execution timeout the caller configures.
const HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(5);

#[derive(Debug)]
pub struct ForkServerConfig {
    pub target: PathBuf,
    pub args: Vec<OsString>,
    pub kill_signal: Signal,
}

impl ForkServerConfig {
    pub fn new(target: PathBuf, args: Vec<OsString>) -> Self {
        Self {
            target,
            args,
            kill_signal: Signal::SIGKILL,
        }
    }
}

#[derive(Debug)]
pub struct ForkServerBackend {
    runner: Child,
    to_runner: File,
    from_runner: File,
    input_file: File,
    shared_map: SharedMap,
    // Never read directly; kept alive so its `Drop` removes the scratch
    // directory (fifos + input file) when the backend is torn down.
    #[allow(dead_code)]
    working_dir: TempDir,
    kill_signal: Signal,
    child_pid: Option<Pid>,
}

impl ForkServerBackend {
    pub fn new(config: ForkServerConfig) -> Result<Self> {
        let working_dir = tempfile::tempdir()?;
        let forksrv_in = working_dir.path().join("forksrv_in");
        let forksrv_out = working_dir.path().join("forksrv_out");
        let input_path = working_dir.path().join("__input_file");

        unistd::mkfifo(&forksrv_in, Mode::S_IRUSR | Mode::S_IWUSR)?;
        unistd::mkfifo(&forksrv_out, Mode::S_IRUSR | Mode::S_IWUSR)?;

        // Opened O_RDWR so the open itself never blocks on a FIFO peer; the
        // runner's simplex opens (O_RDONLY / O_WRONLY) then complete instantly.
        let to_runner = open_rdwr(&forksrv_in)?;
        let from_runner = open_rdwr(&forksrv_out)?;
        let input_file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(true)
            .open(&input_path)?;

        let shared_map = SharedMap::new()?;

        let runner = spawn_runner(
            &config,
            &forksrv_in,
            &forksrv_out,
            &input_path,
            &shared_map,
            to_runner.as_raw_fd(),
            from_runner.as_raw_fd(),
        )?;

        let mut backend = Self {
            runner,
            to_runner,
            from_runner,
            input_file,
            shared_map,
            working_dir,
            kill_signal: config.kill_signal,
            child_pid: None,
        };
        backend.handshake()?;
        Ok(backend)
    }

    fn handshake(&mut self) -> Result<()> {
        let deadline = Instant::now() + HANDSHAKE_TIMEOUT;
        loop {
            if let Some(status) = self.runner.try_wait()? {
                return Err(EdgeFuzzError::PrematureForkServerExit(format!(
                    "runner exited during handshake: {status}"
                )));
            }
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                return Err(EdgeFuzzError::PrematureForkServerExit(
                    "handshake timed out waiting for runner".to_string(),
                ));
            }
            if wait_readable(&self.from_runner, remaining.min(Duration::from_millis(200)))? {
                let mut buf = [0u8; 4];
                self.from_runner.read_exact(&mut buf)?;
                debug!("fork server handshake complete");
                return Ok(());
            }
        }
    }

    pub fn run(&mut self, payload: &[u8], timeout: Duration) -> Result<Outcome> {
        self.shared_map.zero();
        write_input_file(&mut self.input_file, payload)?;

        // Content is ignored; the write itself is the fork request.
        self.to_runner.write_all(&0u32.to_le_bytes())?;

        let mut pid_buf = [0u8; 4];
        self.from_runner.read_exact(&mut pid_buf)?;
        let pid_raw = i32::from_le_bytes(pid_buf);
        if pid_raw <= 0 {
            return Err(EdgeFuzzError::Protocol(format!(
                "fork server reported invalid pid {pid_raw}"
            )));
        }
        let pid = Pid::from_raw(pid_raw);
        self.child_pid = Some(pid);

        let start = Instant::now();
        let hung = if timeout.is_zero() {
            false
        } else {
            !wait_readable(&self.from_runner, timeout)?
        };

        if hung {
            match signal::kill(pid, self.kill_signal) {
                Ok(()) | Err(nix::errno::Errno::ESRCH) => {}
                Err(errno) => warn!(%errno, "failed to kill hung child"),
            }
            let mut status_buf = [0u8; 4];
            self.from_runner.read_exact(&mut status_buf)?;
            self.child_pid = None;
            return Ok(Outcome::Hanged);
        }

        let mut status_buf = [0u8; 4];
        self.from_runner.read_exact(&mut status_buf)?;
        self.child_pid = None;
        let status = u32::from_le_bytes(status_buf);

        let exit_signal = (status & 0x7F) as u8;
        let did_crash = exit_signal != 0;
        let exit_code = ((status >> 8) & 0xFF) as u8;

        let snapshot = self.shared_map.snapshot();
        let trace = Trace::new(snapshot, did_crash, exit_signal, exit_code, start.elapsed());
        Ok(Outcome::Completed(trace))
    }

    pub fn cleanup(&mut self) {
        if let Some(pid) = self.child_pid.take() {
            match signal::kill(pid, self.kill_signal) {
                Ok(()) | Err(nix::errno::Errno::ESRCH) => {}
                Err(errno) => warn!(%errno, "failed to kill child during cleanup"),
            }
        }
        if let Err(err) = self.runner.kill() {
            if err.kind() != std::io::ErrorKind::InvalidInput {
                warn!(%err, "failed to kill fork server runner");
            }
        }
        let _ = self.runner.wait();
    }
}

impl Drop for ForkServerBackend {
    fn drop(&mut self) {
        self.cleanup();
    }
}

fn open_rdwr(path: &Path) -> Result<File> {
    let fd = open(path, OFlag::O_RDWR, Mode::empty())?;
    // SAFETY: `open` just returned a freshly owned, otherwise-unused fd.
    Ok(unsafe { File::from_raw_fd(fd) })
}

fn wait_readable(file: &File, timeout: Duration) -> Result<bool> {
    let raw = file.as_raw_fd();
    // SAFETY: `raw` is valid for the duration of this call; `file` outlives it.
    let borrowed = unsafe { BorrowedFd::borrow_raw(raw) };
    let mut read_fds = FdSet::new();
    read_fds.insert(borrowed);

    let mut sigset = SigSet::empty();
    sigset.add(Signal::SIGINT);

    let ts = TimeSpec::new(
        timeout.as_secs() as i64,
        i64::from(timeout.subsec_nanos()),
    );
    let ready = pselect(None, &mut read_fds, None, None, Some(&ts), Some(&sigset))?;
    Ok(ready > 0)
}

fn write_input_file(file: &mut File, payload: &[u8]) -> Result<()> {
    use std::io::{Seek, SeekFrom};
    file.seek(SeekFrom::Start(0))?;
    file.write_all(payload)?;
    file.set_len(payload.len() as u64)?;
    file.seek(SeekFrom::Start(0))?;
    Ok(())
}

fn spawn_runner(
    config: &ForkServerConfig,
    forksrv_in: &Path,
    forksrv_out: &Path,
    input_path: &Path,
    shared_map: &SharedMap,
    to_runner_fd: RawFd,
    from_runner_fd: RawFd,
) -> Result<Child> {
    let forksrv_in = forksrv_in.to_path_buf();
    let forksrv_out = forksrv_out.to_path_buf();
    let input_path = input_path.to_path_buf();

    let mut command = Command::new(&config.target);
    command
        .args(&config.args)
        .env(crate::coverage::map::SHM_ID_ENV, shared_map.id_string())
        .stdout(Stdio::null())
        .stderr(Stdio::inherit());

    // SAFETY: only async-signal-safe syscalls (open/dup2/close) run between
    // fork and exec here.
    unsafe {
        command.pre_exec(move || {
            let in_fd = open(&forksrv_in, OFlag::O_RDONLY, Mode::empty())
                .map_err(std::io::Error::from)?;
            let out_fd = open(&forksrv_out, OFlag::O_WRONLY, Mode::empty())
                .map_err(std::io::Error::from)?;
            let stdin_fd = open(
                &input_path,
                OFlag::O_RDONLY,
                Mode::empty(),
            )
            .map_err(std::io::Error::from)?;

            unistd::dup2(in_fd, FORKSRV_FD).map_err(std::io::Error::from)?;
            unistd::dup2(out_fd, FORKSRV_FD_OUT).map_err(std::io::Error::from)?;
            unistd::dup2(stdin_fd, 0).map_err(std::io::Error::from)?;
            unistd::close(in_fd).map_err(std::io::Error::from)?;
            unistd::close(out_fd).map_err(std::io::Error::from)?;
            unistd::close(stdin_fd).map_err(std::io::Error::from)?;
            // Close the backend's own fifo handles so the runner (and the
            // target it forks) doesn't inherit a second set of live ends.
            unistd::close(to_runner_fd).map_err(std::io::Error::from)?;
            unistd::close(from_runner_fd).map_err(std::io::Error::from)?;
            Ok(())
        });
    }

    Ok(command.spawn()?)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn wait_status_decoding_matches_the_wire_layout() {
        // exit_signal = status & 0x7F; exit_code = (status >> 8) & 0xFF.
        let status: u32 = (42u32 << 8) | 11;
        let exit_signal = (status & 0x7F) as u8;
        let exit_code = ((status >> 8) & 0xFF) as u8;
        assert_eq!(exit_signal, 11);
        assert_eq!(exit_code, 42);
        assert!(exit_signal != 0);
    }

    #[test]
    fn clean_exit_has_zero_signal() {
        let status: u32 = 0u32 << 8;
        let exit_signal = (status & 0x7F) as u8;
        assert_eq!(exit_signal, 0);
    }
}
