use std::collections::HashMap;
use std::fmt::Display;
use std::io;
use std::path::Path;
use std::process::{Child, Command as ProcessCommand, Stdio};
use std::sync::{Arc, Mutex};

use tracing::{debug, warn};

#[cfg(unix)]
use std::os::unix::process::CommandExt;

/// Positional arguments plus keyword-style flags for one get_iplayer
/// invocation. Single-letter flags render as `-x value`, multi-letter as
/// `--name=value`, and an empty value makes a bare switch.
#[derive(Debug, Clone, Default)]
pub(crate) struct CallArgs {
    positionals: Vec<String>,
    flags: Vec<(String, String)>,
}

impl CallArgs {
    pub(crate) fn new() -> Self {
        CallArgs::default()
    }

    pub(crate) fn positional(mut self, value: impl Display) -> Self {
        self.positionals.push(value.to_string());
        self
    }

    pub(crate) fn flag(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.flags.push((name.into(), value.into()));
        self
    }

    pub(crate) fn switch(self, name: impl Into<String>) -> Self {
        self.flag(name, "")
    }

    /// Renders the final argument vector. Stock flags ride along on every
    /// invocation but a call flag with the same name wins.
    pub(crate) fn render(&self, stock_flags: &[(String, String)]) -> Vec<String> {
        let mut argv = self.positionals.clone();
        let stock = stock_flags
            .iter()
            .filter(|(name, _)| !self.flags.iter().any(|(own, _)| own == name));
        for (name, value) in stock.chain(self.flags.iter()) {
            if name.len() == 1 {
                argv.push(format!("-{name}"));
                if !value.is_empty() {
                    argv.push(value.clone());
                }
            } else if value.is_empty() {
                argv.push(format!("--{name}"));
            } else {
                argv.push(format!("--{name}={value}"));
            }
        }
        argv
    }
}

/// True for output lines that report a real failure. The new-release notice
/// matches the warning shape but is pure noise, so it stays out of the
/// error channel.
pub(crate) fn is_error_line(line: &str) -> bool {
    if line.starts_with("WARNING: New version") {
        return false;
    }
    line.starts_with("ERROR:") || line.starts_with("WARNING:")
}

/// Everything read back from a finished invocation: the raw stdout for the
/// parsers, and the accumulated error lines (classified stdout lines plus
/// anything on stderr).
pub(crate) struct Collected {
    pub(crate) stdout: String,
    pub(crate) errors: Vec<String>,
}

/// One spawned get_iplayer invocation, running in its own process group so
/// the whole tree can be killed atomically.
#[derive(Clone)]
pub(crate) struct SpawnedProcess {
    pid: u32,
    pgid: i32,
    child: Arc<Mutex<Option<Child>>>,
}

impl SpawnedProcess {
    pub(crate) fn pid(&self) -> u32 {
        self.pid
    }

    pub(crate) fn pgid(&self) -> i32 {
        self.pgid
    }

    /// Non-blocking exit probe. While output collection is in flight the
    /// child is checked out of the slot and this reports false; the caller
    /// tracks completion separately.
    pub(crate) fn is_finished(&self) -> bool {
        let mut slot = match self.child.lock() {
            Ok(slot) => slot,
            Err(poisoned) => poisoned.into_inner(),
        };
        match slot.as_mut() {
            Some(child) => !matches!(child.try_wait(), Ok(None)),
            None => false,
        }
    }

    /// Waits for exit and drains captured output. Callable once; a second
    /// call reports the collection as already done.
    pub(crate) fn collect(&self) -> Collected {
        let child = {
            let mut slot = match self.child.lock() {
                Ok(slot) => slot,
                Err(poisoned) => poisoned.into_inner(),
            };
            slot.take()
        };
        let Some(child) = child else {
            return Collected {
                stdout: String::new(),
                errors: vec!["ERROR: get_iplayer output was already collected".to_string()],
            };
        };
        match child.wait_with_output() {
            Ok(output) => {
                let stdout = String::from_utf8_lossy(&output.stdout).into_owned();
                let stderr = String::from_utf8_lossy(&output.stderr);
                let mut errors: Vec<String> = stdout
                    .lines()
                    .filter(|line| is_error_line(line))
                    .map(str::to_string)
                    .collect();
                errors.extend(
                    stderr
                        .lines()
                        .filter(|line| !line.trim().is_empty())
                        .map(str::to_string),
                );
                if !output.status.success() && errors.is_empty() {
                    errors.push(format!("ERROR: get_iplayer exited with {}", output.status));
                }
                Collected { stdout, errors }
            }
            Err(err) => Collected {
                stdout: String::new(),
                errors: vec![format!("ERROR: failed waiting for get_iplayer: {err}")],
            },
        }
    }
}

/// Spawns with stdout and stderr captured for later collection.
pub(crate) fn spawn_buffered(bin: &Path, argv: &[String]) -> io::Result<SpawnedProcess> {
    spawn(bin, argv, Stdio::piped())
}

/// Spawns with stdout wired to a caller-supplied destination, typically the
/// write end of a pipe consumed live by a player. stderr is still captured.
pub(crate) fn spawn_streaming(
    bin: &Path,
    argv: &[String],
    stdout: Stdio,
) -> io::Result<SpawnedProcess> {
    spawn(bin, argv, stdout)
}

fn spawn(bin: &Path, argv: &[String], stdout: Stdio) -> io::Result<SpawnedProcess> {
    debug!(bin = %bin.display(), ?argv, "spawning get_iplayer");
    let mut cmd = ProcessCommand::new(bin);
    cmd.args(argv)
        .stdin(Stdio::null())
        .stdout(stdout)
        .stderr(Stdio::piped());
    put_in_own_process_group(&mut cmd);
    let child = cmd.spawn()?;
    let pid = child.id();
    Ok(SpawnedProcess {
        pid,
        pgid: pid as i32,
        child: Arc::new(Mutex::new(Some(child))),
    })
}

#[cfg(unix)]
fn put_in_own_process_group(cmd: &mut ProcessCommand) {
    unsafe {
        cmd.pre_exec(|| {
            if libc::setpgid(0, 0) != 0 {
                return Err(io::Error::last_os_error());
            }
            Ok(())
        });
    }
}

#[cfg(not(unix))]
fn put_in_own_process_group(_cmd: &mut ProcessCommand) {}

/// Terminates a whole process group. Behind a trait so limiter and registry
/// teardown can be exercised without live processes.
pub(crate) trait GroupTerminator: Send + Sync {
    fn terminate(&self, pgid: i32) -> io::Result<()>;
}

pub(crate) struct SignalTerminator;

#[cfg(unix)]
impl GroupTerminator for SignalTerminator {
    fn terminate(&self, pgid: i32) -> io::Result<()> {
        if unsafe { libc::killpg(pgid, libc::SIGTERM) } != 0 {
            let err = io::Error::last_os_error();
            // A group that already exited counts as terminated.
            if err.raw_os_error() == Some(libc::ESRCH) {
                return Ok(());
            }
            return Err(err);
        }
        Ok(())
    }
}

#[cfg(not(unix))]
impl GroupTerminator for SignalTerminator {
    fn terminate(&self, _pgid: i32) -> io::Result<()> {
        Ok(())
    }
}

/// Every invocation in flight, pid to process group id. Entries leave as
/// soon as the wrapping result resolves; whatever is left at teardown gets
/// terminated.
pub(crate) struct ProcessRegistry {
    live: Mutex<HashMap<u32, i32>>,
}

impl ProcessRegistry {
    pub(crate) fn new() -> Self {
        ProcessRegistry {
            live: Mutex::new(HashMap::new()),
        }
    }

    pub(crate) fn register(&self, pid: u32, pgid: i32) {
        let mut live = match self.live.lock() {
            Ok(live) => live,
            Err(poisoned) => poisoned.into_inner(),
        };
        live.insert(pid, pgid);
    }

    pub(crate) fn deregister(&self, pid: u32) {
        let mut live = match self.live.lock() {
            Ok(live) => live,
            Err(poisoned) => poisoned.into_inner(),
        };
        live.remove(&pid);
    }

    #[cfg(test)]
    pub(crate) fn live_count(&self) -> usize {
        match self.live.lock() {
            Ok(live) => live.len(),
            Err(poisoned) => poisoned.into_inner().len(),
        }
    }

    /// Best-effort termination of every live invocation.
    pub(crate) fn terminate_all(&self, terminator: &dyn GroupTerminator) {
        let drained: Vec<(u32, i32)> = {
            let mut live = match self.live.lock() {
                Ok(live) => live,
                Err(poisoned) => poisoned.into_inner(),
            };
            live.drain().collect()
        };
        for (pid, pgid) in drained {
            if let Err(err) = terminator.terminate(pgid) {
                warn!(pid, pgid, "failed to terminate get_iplayer process: {err}");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn render_places_positionals_before_flags() {
        let args = CallArgs::new()
            .positional(12345)
            .flag("modes", "best")
            .switch("get")
            .flag("q", "");
        assert_eq!(args.render(&[]), vec!["12345", "--modes=best", "--get", "-q"]);
    }

    #[test]
    fn render_single_letter_flag_takes_separate_value() {
        let args = CallArgs::new().flag("o", "/tmp/out");
        assert_eq!(args.render(&[]), vec!["-o", "/tmp/out"]);
    }

    #[test]
    fn render_call_flags_override_stock_flags() {
        let stock = vec![("ffmpeg".to_string(), "/usr/bin/ffmpeg".to_string())];
        let args = CallArgs::new().flag("ffmpeg", "/opt/ffmpeg");
        assert_eq!(args.render(&stock), vec!["--ffmpeg=/opt/ffmpeg"]);
        let plain = CallArgs::new().switch("stream");
        assert_eq!(
            plain.render(&stock),
            vec!["--ffmpeg=/usr/bin/ffmpeg", "--stream"]
        );
    }

    #[test]
    fn error_lines_cover_errors_and_warnings_but_not_release_notice() {
        assert!(is_error_line("ERROR: Failed to get media stream"));
        assert!(is_error_line("WARNING: Failed to parse XML"));
        assert!(!is_error_line("WARNING: New version 3.35 available"));
        assert!(!is_error_line("INFO: 3 Matching Programmes"));
        assert!(!is_error_line("Doctor Who (12)"));
    }
}
