use std::collections::BTreeMap;
use std::fs::File;
use std::io::{self, BufRead, BufReader, Read, Write};
use std::path::{Path, PathBuf};
use std::process::{Child, ChildStdout, Command, ExitStatus, Stdio};
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use tracing::{debug, info, warn};

use super::{IoNiceSettings, NiceSettings, PipeCommand};
use crate::cancel::CancelToken;
use crate::error::{Error, Result};

const POLL_INTERVAL: Duration = Duration::from_millis(50);
const MAX_LOG_CHARS: usize = 4096;
/// Time children get to exit after SIGTERM before the group is SIGKILLed.
const TERM_GRACE: Duration = Duration::from_secs(2);

/// Where the main command's stdout goes.
#[derive(Debug, Clone, Default)]
pub enum StdoutSink {
    #[default]
    Capture,
    File(PathBuf),
    Pipe(Vec<PipeCommand>),
}

/// A single external command, optionally fed by a producer pipeline.
#[derive(Debug, Clone, Default)]
pub struct Invocation {
    pub program: String,
    pub args: Vec<String>,
    pub env: BTreeMap<String, String>,
    pub stdin: Vec<PipeCommand>,
    pub stdout: StdoutSink,
    pub nice: Option<NiceSettings>,
    pub ionice: Option<IoNiceSettings>,
    /// Stream output lines at info instead of debug.
    pub verbose: bool,
}

impl Invocation {
    pub fn new(program: impl Into<String>, args: Vec<String>) -> Self {
        Self {
            program: program.into(),
            args,
            ..Self::default()
        }
    }

    /// Short label used in logs and errors, e.g. `restic backup`.
    pub fn describe(&self) -> String {
        let prog = Path::new(&self.program)
            .file_name()
            .map(|s| s.to_string_lossy().to_string())
            .unwrap_or_else(|| self.program.clone());
        match self.args.iter().find(|a| !a.starts_with('-')) {
            Some(sub) => format!("{prog} {sub}"),
            None => prog,
        }
    }

    fn argv(&self) -> (String, Vec<String>) {
        let mut argv = Vec::<String>::new();
        if let Some(io) = self.ionice {
            argv.extend(["ionice".into(), "-c".into(), io.class.to_string()]);
            if let Some(d) = io.class_data {
                argv.extend(["-n".into(), d.to_string()]);
            }
        }
        if let Some(n) = self.nice {
            argv.extend(["nice".into(), "-n".into(), n.adjustment.to_string()]);
        }
        argv.push(self.program.clone());
        argv.extend(self.args.iter().cloned());
        let program = argv.remove(0);
        (program, argv)
    }
}

#[derive(Debug)]
pub struct CmdOutput {
    pub status: ExitStatus,
    pub stdout: Vec<u8>,
    pub stderr: Vec<u8>,
}

impl CmdOutput {
    pub fn success(&self) -> bool {
        self.status.success()
    }

    pub fn summary(&self) -> String {
        command_summary(&self.stdout, &self.stderr, self.status)
    }
}

/// Run `inv` to completion. A non-zero exit becomes a process error carrying
/// the tool's diagnostics.
pub fn run(inv: &Invocation, cancel: &CancelToken) -> Result<CmdOutput> {
    let out = run_unchecked(inv, cancel)?;
    if !out.success() {
        return Err(Error::process(format!(
            "{} failed: {}",
            inv.describe(),
            out.summary()
        )));
    }
    Ok(out)
}

/// Like [`run`] but hands back the output of a failed main command so the
/// caller can inspect it. Pipeline failures are still errors.
pub fn run_unchecked(inv: &Invocation, cancel: &CancelToken) -> Result<CmdOutput> {
    cancel.check()?;
    let what = inv.describe();
    let mut group = ProcessGroup::default();

    let mut producers = Vec::<Stage>::new();
    let mut upstream: Option<ChildStdout> = None;
    for pc in &inv.stdin {
        let mut child = spawn_stage(pc, upstream.take(), &mut group)?;
        upstream = child.stdout.take();
        let stderr = drain(child.stderr.take(), pc.name.clone(), true, inv.verbose);
        producers.push(Stage {
            name: pc.name.clone(),
            child,
            stderr,
        });
    }

    let sink_file = match &inv.stdout {
        StdoutSink::File(path) => Some(File::create(path).map_err(|e| {
            Error::process(format!("failed to create {}: {e}", path.display()))
        })?),
        _ => None,
    };

    let (program, args) = inv.argv();
    debug!(command = %what, program = %program, args = ?args, "starting command");
    let mut child = {
        let mut cmd = Command::new(&program);
        cmd.args(&args)
            .envs(&inv.env)
            .stdin(stdin_from(upstream.take()))
            .stdout(Stdio::piped())
            .stderr(Stdio::piped());
        group
            .spawn(&mut cmd)
            .map_err(|e| Error::process(format!("failed to start {what}: {e}")))?
    };
    let stderr = drain(child.stderr.take(), what.clone(), true, inv.verbose);

    let mut stdout = None;
    let mut copier: Option<JoinHandle<Result<u64>>> = None;
    let mut consumers = Vec::<Stage>::new();
    let mut tail = None;
    match &inv.stdout {
        StdoutSink::Capture => {
            stdout = drain(child.stdout.take(), what.clone(), true, inv.verbose);
        }
        StdoutSink::File(_) => {
            if let (Some(out), Some(file)) = (child.stdout.take(), sink_file) {
                copier = Some(std::thread::spawn(move || {
                    copy_then_close(out, file, |f| f.sync_all())
                }));
            }
        }
        StdoutSink::Pipe(cmds) => {
            let mut up = child.stdout.take();
            for pc in cmds {
                let mut c = spawn_stage(pc, up.take(), &mut group)?;
                up = c.stdout.take();
                let stderr = drain(c.stderr.take(), pc.name.clone(), true, inv.verbose);
                consumers.push(Stage {
                    name: pc.name.clone(),
                    child: c,
                    stderr,
                });
            }
            tail = drain(up, "pipe".to_string(), false, inv.verbose);
        }
    }

    let status = loop {
        if let Some(status) = child
            .try_wait()
            .map_err(|e| Error::process(format!("wait failed for {what}: {e}")))?
        {
            break status;
        }
        if let Some(err) = cancel.err() {
            warn!(command = %what, reason = %err, "terminating process group");
            group.terminate(|| {
                let mut done = !matches!(child.try_wait(), Ok(None));
                for s in producers.iter_mut().chain(consumers.iter_mut()) {
                    done &= !matches!(s.child.try_wait(), Ok(None));
                }
                done
            });
            let _ = child.wait();
            for s in producers.iter_mut().chain(consumers.iter_mut()) {
                let _ = s.child.wait();
            }
            return Err(err.context(&what));
        }
        std::thread::sleep(POLL_INTERVAL);
    };

    let mut pipeline_err = None;
    if let Some(h) = copier {
        let res = h
            .join()
            .unwrap_or_else(|_| Err(Error::process("stdout copy thread panicked")));
        if let Err(e) = res {
            pipeline_err.get_or_insert(e.context(&what));
        }
    }
    for stage in producers.into_iter().chain(consumers) {
        if let Err(e) = stage.finish() {
            pipeline_err.get_or_insert(e);
        }
    }
    let _ = collect(tail);
    group.disarm();

    let out = CmdOutput {
        status,
        stdout: collect(stdout),
        stderr: collect(stderr),
    };
    debug!(command = %what, status = %out.status, "command finished");
    if let Some(e) = pipeline_err {
        // The main command's own diagnostics explain a broken pipeline better.
        if !out.success() {
            return Err(Error::process(format!("{what} failed: {}", out.summary())));
        }
        return Err(e);
    }
    Ok(out)
}

struct Stage {
    name: String,
    child: Child,
    stderr: Option<JoinHandle<Vec<u8>>>,
}

impl Stage {
    fn finish(mut self) -> Result<()> {
        let status = self
            .child
            .wait()
            .map_err(|e| Error::process(format!("wait failed for '{}': {e}", self.name)))?;
        let stderr = collect(self.stderr);
        if status.success() {
            return Ok(());
        }
        Err(Error::process(format!(
            "pipe command '{}' failed: {}",
            self.name,
            command_summary(&[], &stderr, status)
        )))
    }
}

fn stdin_from(upstream: Option<ChildStdout>) -> Stdio {
    // Children run in their own process group; a terminal stdin would stop them with SIGTTIN.
    match upstream {
        Some(out) => Stdio::from(out),
        None => Stdio::null(),
    }
}

fn spawn_stage(
    pc: &PipeCommand,
    upstream: Option<ChildStdout>,
    group: &mut ProcessGroup,
) -> Result<Child> {
    if pc.name.trim().is_empty() {
        return Err(Error::config("pipe command has an empty name"));
    }
    let mut cmd = Command::new(&pc.name);
    cmd.args(&pc.args)
        .stdin(stdin_from(upstream))
        .stdout(Stdio::piped())
        .stderr(Stdio::piped());
    group
        .spawn(&mut cmd)
        .map_err(|e| Error::process(format!("failed to start pipe command '{}': {e}", pc.name)))
}

fn drain<R: Read + Send + 'static>(
    stream: Option<R>,
    label: String,
    keep: bool,
    verbose: bool,
) -> Option<JoinHandle<Vec<u8>>> {
    let stream = stream?;
    Some(std::thread::spawn(move || {
        let mut reader = BufReader::new(stream);
        let mut kept = Vec::new();
        let mut line = Vec::new();
        loop {
            line.clear();
            match reader.read_until(b'\n', &mut line) {
                Ok(0) | Err(_) => break,
                Ok(_) => {}
            }
            if keep {
                kept.extend_from_slice(&line);
            }
            let text = sanitize_line(&String::from_utf8_lossy(&line));
            if text.is_empty() {
                continue;
            }
            if verbose {
                info!(command = %label, "{text}");
            } else {
                debug!(command = %label, "{text}");
            }
        }
        kept
    }))
}

fn collect(h: Option<JoinHandle<Vec<u8>>>) -> Vec<u8> {
    h.and_then(|h| h.join().ok()).unwrap_or_default()
}

/// Copy `r` into `w`, then close `w`. When both steps fail the write error is
/// reported first and the close error is kept alongside it.
pub fn copy_then_close<R, W, C>(mut r: R, mut w: W, close: C) -> Result<u64>
where
    R: Read,
    W: Write,
    C: FnOnce(W) -> io::Result<()>,
{
    let copied = io::copy(&mut r, &mut w).and_then(|n| w.flush().map(|()| n));
    let closed = close(w);
    match (copied, closed) {
        (Ok(n), Ok(())) => Ok(n),
        (Err(we), Ok(())) => Err(Error::process(format!("write failed: {we}"))),
        (Ok(_), Err(ce)) => Err(Error::process(format!("close failed: {ce}"))),
        (Err(we), Err(ce)) => Err(Error::process(format!(
            "write failed: {we}; close failed: {ce}"
        ))),
    }
}

/// Tracks the process groups started for one invocation. Every child leads
/// its own group so restic's helpers go down with it. Groups still armed when
/// this is dropped (an early error return) are SIGKILLed.
#[derive(Default)]
struct ProcessGroup {
    pgids: Vec<u32>,
    armed: bool,
}

impl ProcessGroup {
    fn spawn(&mut self, cmd: &mut Command) -> io::Result<Child> {
        #[cfg(unix)]
        std::os::unix::process::CommandExt::process_group(cmd, 0);
        let child = cmd.spawn()?;
        self.pgids.push(child.id());
        self.armed = true;
        Ok(child)
    }

    /// SIGTERM every group and poll `exited` until it reports the children
    /// gone or the grace period ends, then SIGKILL what is left.
    fn terminate(&mut self, mut exited: impl FnMut() -> bool) {
        self.signal(Signal::Term);
        let until = Instant::now() + TERM_GRACE;
        while !exited() && Instant::now() < until {
            std::thread::sleep(POLL_INTERVAL);
        }
        self.signal(Signal::Kill);
        self.armed = false;
    }

    fn signal(&self, sig: Signal) {
        for &pgid in &self.pgids {
            sig.send_to_group(pgid);
        }
    }

    fn disarm(&mut self) {
        self.armed = false;
    }
}

impl Drop for ProcessGroup {
    fn drop(&mut self) {
        if self.armed {
            self.signal(Signal::Kill);
        }
    }
}

#[derive(Debug, Clone, Copy)]
enum Signal {
    Term,
    Kill,
}

impl Signal {
    #[cfg(unix)]
    fn send_to_group(self, pgid: u32) {
        let sig = match self {
            Signal::Term => libc::SIGTERM,
            Signal::Kill => libc::SIGKILL,
        };
        let Ok(pid) = libc::pid_t::try_from(pgid) else {
            return;
        };
        // SAFETY: kill(2) on a negative pid only delivers a signal to that group.
        if unsafe { libc::kill(-pid, sig) } != 0 {
            let err = io::Error::last_os_error();
            // ESRCH: the group already exited.
            if err.raw_os_error() != Some(libc::ESRCH) {
                debug!(pgid, signal = ?self, error = %err, "failed to signal process group");
            }
        }
    }

    #[cfg(not(unix))]
    fn send_to_group(self, _pgid: u32) {}
}

pub fn command_summary(stdout: &[u8], stderr: &[u8], status: ExitStatus) -> String {
    let stderr = String::from_utf8_lossy(stderr).trim().to_string();
    if !stderr.is_empty() {
        return stderr;
    }
    let stdout = String::from_utf8_lossy(stdout).trim().to_string();
    if !stdout.is_empty() {
        return stdout;
    }
    format!("status {status}")
}

/// Strip terminal escape sequences and control characters from one output line.
pub fn sanitize_line(raw: &str) -> String {
    let mut out = String::with_capacity(raw.len().min(MAX_LOG_CHARS));
    let mut count = 0usize;
    let mut chars = raw.chars();
    while let Some(c) = chars.next() {
        if c == '\x1b' {
            match chars.next() {
                Some('[') => {
                    for c in chars.by_ref() {
                        if ('@'..='~').contains(&c) {
                            break;
                        }
                    }
                }
                Some(']') => {
                    while let Some(c) = chars.next() {
                        if c == '\x07' {
                            break;
                        }
                        if c == '\x1b' {
                            chars.next();
                            break;
                        }
                    }
                }
                _ => {}
            }
            continue;
        }
        if c == '\t' {
            out.push(' ');
        } else if c.is_control() {
            continue;
        } else {
            out.push(c);
        }
        count += 1;
        if count >= MAX_LOG_CHARS {
            out.push_str(" ...[truncated]");
            break;
        }
    }
    out
}
