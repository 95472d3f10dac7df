//! Child process execution.
//!
//! Two entry points: [`execute`] runs a shell command line while draining
//! stdout and stderr concurrently (optionally teeing to a capture file), and
//! [`Cmd`] is a small builder for plain argv invocations of host tools.
//!
//! `execute` installs a SIGINT handler for the duration of the call so an
//! interrupted build can be detected and cleaned up; the previous handler is
//! restored when the call returns, on every path.

use std::ffi::{OsStr, OsString};
use std::fs;
use std::io::{BufRead, BufReader, BufWriter, Read, Write};
use std::path::Path;
use std::process::{Command, ExitStatus, Stdio};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::thread;

use anyhow::{bail, Context, Result};
use nix::sys::signal::{sigaction, SaFlags, SigAction, SigHandler, SigSet, Signal};
use thiserror::Error;

/// Failures that prevent a command from producing an exit status.
///
/// A command that runs to completion with a non-zero status is not an error
/// here; [`execute`] reports that as `Ok(false)` and the caller decides.
#[derive(Debug, Error)]
pub enum ExecError {
    #[error("command '{command}' could not be run: {source}")]
    Launch {
        command: String,
        #[source]
        source: std::io::Error,
    },
    /// SIGINT arrived while the child was running. Carries the child pid so
    /// the caller can tear down whatever the child left behind.
    #[error("command '{command}' was interrupted (child pid {pid})")]
    Interrupted { command: String, pid: i32 },
}

static INTERRUPTED: AtomicBool = AtomicBool::new(false);

extern "C" fn on_sigint(_: libc::c_int) {
    INTERRUPTED.store(true, Ordering::SeqCst);
    // println! is not async-signal-safe; write(2) is.
    const NOTICE: &[u8] = b"\ncaught SIGINT, shutting down\n";
    unsafe {
        let _ = libc::write(libc::STDERR_FILENO, NOTICE.as_ptr().cast(), NOTICE.len());
    }
}

/// Scoped SIGINT disposition: installs [`on_sigint`] and restores the
/// previous handler on drop.
struct SigintGuard {
    previous: SigAction,
}

impl SigintGuard {
    fn install() -> nix::Result<Self> {
        let action = SigAction::new(
            SigHandler::Handler(on_sigint),
            SaFlags::empty(),
            SigSet::empty(),
        );
        // SAFETY: the handler only touches an atomic and calls write(2).
        let previous = unsafe { sigaction(Signal::SIGINT, &action)? };
        Ok(Self { previous })
    }
}

impl Drop for SigintGuard {
    fn drop(&mut self) {
        // SAFETY: restores the disposition saved by `install`.
        unsafe {
            let _ = sigaction(Signal::SIGINT, &self.previous);
        }
    }
}

/// Number of lines the capture sink buffers before forcing a flush.
const FLUSH_THRESHOLD: u32 = 10;

/// Line-oriented capture sink with a fixed flush cadence.
///
/// The first flush lands after line 11, then after every further 10 lines,
/// with one final flush when the sink is finished.
struct LineSink<W: Write> {
    sink: W,
    pending: u32,
}

impl<W: Write> LineSink<W> {
    fn new(sink: W) -> Self {
        Self { sink, pending: 0 }
    }

    fn write_line(&mut self, line: &str) -> std::io::Result<()> {
        self.sink.write_all(line.as_bytes())?;
        self.sink.write_all(b"\n")?;
        self.pending += 1;
        if self.pending > FLUSH_THRESHOLD {
            self.sink.flush()?;
            self.pending = 1;
        }
        Ok(())
    }

    fn finish(mut self) -> std::io::Result<()> {
        self.sink.flush()
    }
}

type SharedSink = Arc<Mutex<Option<LineSink<BufWriter<fs::File>>>>>;

fn drain_stream<R: Read + Send + 'static>(
    stream: R,
    echo: bool,
    sink: SharedSink,
) -> thread::JoinHandle<()> {
    thread::spawn(move || {
        let reader = BufReader::new(stream);
        for line in reader.lines().map_while(std::result::Result::ok) {
            if let Ok(mut guard) = sink.lock() {
                if let Some(capture) = guard.as_mut() {
                    let _ = capture.write_line(&line);
                }
            }
            if echo {
                println!("{line}");
            }
        }
    })
}

fn failure_notice(command: &str, status: &ExitStatus) -> String {
    format!("\nCommand '{command}' failed with {status}")
}

fn launch_error(command: &str, source: std::io::Error) -> ExecError {
    ExecError::Launch {
        command: command.to_string(),
        source,
    }
}

/// Run `command` through the shell, draining stdout and stderr concurrently.
///
/// Each output line is appended to `capture` (if given; the parent directory
/// is created first when missing) and echoed to the console when `echo` is
/// set. Returns `Ok(true)` iff the command exited with status 0; termination
/// by signal counts as an ordinary non-zero exit. The call blocks until the
/// child and both drain threads have finished.
pub fn execute(command: &str, capture: Option<&Path>, echo: bool) -> Result<bool, ExecError> {
    let _guard = SigintGuard::install()
        .map_err(|errno| launch_error(command, std::io::Error::from_raw_os_error(errno as i32)))?;

    let mut sink = None;
    if let Some(path) = capture {
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() && !parent.exists() {
                fs::create_dir_all(parent).map_err(|e| launch_error(command, e))?;
            }
        }
        let file = fs::File::create(path).map_err(|e| launch_error(command, e))?;
        sink = Some(LineSink::new(BufWriter::new(file)));
    }
    let sink: SharedSink = Arc::new(Mutex::new(sink));

    INTERRUPTED.store(false, Ordering::SeqCst);

    let mut child = Command::new("sh")
        .arg("-c")
        .arg(command)
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .spawn()
        .map_err(|e| launch_error(command, e))?;
    let pid = child.id() as i32;

    let stdout = child.stdout.take().ok_or_else(|| {
        launch_error(
            command,
            std::io::Error::other("child stdout pipe was not set up"),
        )
    })?;
    let stderr = child.stderr.take().ok_or_else(|| {
        launch_error(
            command,
            std::io::Error::other("child stderr pipe was not set up"),
        )
    })?;

    let out_reader = drain_stream(stdout, echo, Arc::clone(&sink));
    let err_reader = drain_stream(stderr, echo, Arc::clone(&sink));
    let _ = out_reader.join();
    let _ = err_reader.join();

    let status = child.wait().map_err(|e| launch_error(command, e))?;

    // Final flush and close of the capture file, success or not.
    if let Ok(mut guard) = sink.lock() {
        if let Some(capture) = guard.take() {
            let _ = capture.finish();
        }
    }

    if INTERRUPTED.load(Ordering::SeqCst) {
        return Err(ExecError::Interrupted {
            command: command.to_string(),
            pid,
        });
    }

    let success = status.success();
    if !success && echo {
        println!("{}", failure_notice(command, &status));
    }
    Ok(success)
}

/// Builder for plain argv invocations of host tools.
///
/// Inherits the parent's stdio; suited for short-lived tools whose output
/// should land on the console as-is.
pub struct Cmd {
    program: String,
    args: Vec<OsString>,
    error_msg: Option<String>,
    allow_fail: bool,
}

impl Cmd {
    pub fn new(program: &str) -> Self {
        Self {
            program: program.to_string(),
            args: Vec::new(),
            error_msg: None,
            allow_fail: false,
        }
    }

    pub fn arg(mut self, arg: &str) -> Self {
        self.args.push(arg.into());
        self
    }

    pub fn args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<OsStr>,
    {
        self.args
            .extend(args.into_iter().map(|a| a.as_ref().to_os_string()));
        self
    }

    pub fn arg_path(mut self, path: &Path) -> Self {
        self.args.push(path.as_os_str().to_os_string());
        self
    }

    /// Message to fail with when the tool exits non-zero.
    pub fn error_msg(mut self, msg: &str) -> Self {
        self.error_msg = Some(msg.to_string());
        self
    }

    /// Treat a non-zero exit as an ordinary outcome instead of an error.
    pub fn allow_fail(mut self) -> Self {
        self.allow_fail = true;
        self
    }

    pub fn run(self) -> Result<ExitStatus> {
        let status = Command::new(&self.program)
            .args(&self.args)
            .status()
            .with_context(|| format!("running '{}'", self.program))?;

        if !status.success() && !self.allow_fail {
            match self.error_msg {
                Some(msg) => bail!("{msg}"),
                None => bail!("'{}' failed with {}", self.program, status),
            }
        }
        Ok(status)
    }
}
