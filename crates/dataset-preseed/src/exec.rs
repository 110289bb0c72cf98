use std::io::{BufRead, BufReader, Read};
use std::process::{Child, Command, ExitStatus, Stdio};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use crate::error::{Error, ErrorKind, Result};
use crate::signal;

const POLL_INTERVAL: Duration = Duration::from_millis(100);
const TERM_GRACE: Duration = Duration::from_secs(3);
const MAX_LOG_CHARS: usize = 4096;
const STDERR_TAIL: usize = 5;

/// Runs restore subprocesses. Every child gets its own process group so a
/// deadline or a shutdown signal takes down the whole pipeline
/// (`ssh ... zfs send | zfs receive`).
#[derive(Debug, Clone)]
pub struct RunCtx {
    cancel: Arc<AtomicBool>,
    deadline: Option<Instant>,
    timeout: Option<Duration>,
}

impl Default for RunCtx {
    fn default() -> Self {
        Self::new(Arc::new(AtomicBool::new(false)))
    }
}

impl RunCtx {
    pub fn new(cancel: Arc<AtomicBool>) -> Self {
        Self {
            cancel,
            deadline: None,
            timeout: None,
        }
    }

    /// Same cancellation flag, fresh deadline `timeout` from now.
    pub fn with_timeout(&self, timeout: Duration) -> Self {
        Self {
            cancel: self.cancel.clone(),
            deadline: Some(Instant::now() + timeout),
            timeout: Some(timeout),
        }
    }

    pub fn cancelled(&self) -> bool {
        self.cancel.load(Ordering::Relaxed) || signal::shutdown_requested()
    }

    pub fn request_cancel(&self) {
        self.cancel.store(true, Ordering::Relaxed);
    }

    /// Fails with `Cancelled` or `Timeout` when the attempt must stop.
    pub fn check(&self) -> Result<()> {
        if self.cancelled() {
            return Err(Error::new(ErrorKind::Cancelled, "cancelled by shutdown request"));
        }
        if let Some(deadline) = self.deadline
            && Instant::now() >= deadline
        {
            return Err(self.timeout_error());
        }
        Ok(())
    }

    fn timeout_error(&self) -> Error {
        let secs = self.timeout.map(|t| t.as_secs()).unwrap_or_default();
        Error::new(ErrorKind::Timeout, format!("timed out after {secs}s"))
    }

    /// Runs `cmd` and returns its stdout.
    pub fn output(&self, mut cmd: Command) -> Result<String> {
        self.check()?;
        let label = describe(&cmd);
        tracing::debug!(cmd = %label, "exec");
        let mut proc = Running::spawn(&mut cmd, label, Stdio::null(), Stdio::piped())?;
        let stdout = proc.child.stdout.take().map(|out| {
            std::thread::spawn(move || {
                let mut buf = Vec::new();
                let mut out = out;
                let _ = out.read_to_end(&mut buf);
                buf
            })
        });
        let mut procs = [proc];
        self.wait_all(&mut procs)?;
        let bytes = stdout
            .and_then(|h| h.join().ok())
            .unwrap_or_default();
        Ok(String::from_utf8_lossy(&bytes).into_owned())
    }

    pub fn run(&self, cmd: Command) -> Result<()> {
        self.output(cmd).map(|_| ())
    }

    /// `producer | consumer`, both bounded by the same deadline.
    pub fn pipe(&self, mut producer: Command, mut consumer: Command) -> Result<()> {
        self.check()?;
        let plabel = describe(&producer);
        let clabel = describe(&consumer);
        tracing::debug!(producer = %plabel, consumer = %clabel, "exec pipeline");

        let mut first = Running::spawn(&mut producer, plabel, Stdio::null(), Stdio::piped())?;
        let Some(stream) = first.child.stdout.take() else {
            first.kill();
            return Err(Error::msg("producer stdout not captured"));
        };
        let second = match Running::spawn(&mut consumer, clabel, Stdio::from(stream), Stdio::null())
        {
            Ok(p) => p,
            Err(e) => {
                first.kill();
                return Err(e);
            }
        };
        // The commands still hold their pipe ends; release them so EOF propagates.
        drop(producer);
        drop(consumer);
        let mut procs = [first, second];
        self.wait_all(&mut procs)
    }

    fn wait_all(&self, procs: &mut [Running]) -> Result<()> {
        loop {
            let mut failed = false;
            for p in procs.iter_mut() {
                if p.status.is_none()
                    && let Some(st) = p
                        .child
                        .try_wait()
                        .map_err(|e| Error::msg(format!("wait failed for {}: {e}", p.label)))?
                {
                    p.status = Some(st);
                    failed |= !st.success();
                }
            }
            if procs.iter().all(|p| p.status.is_some()) {
                break;
            }
            if failed {
                // One side of a pipeline died; the other would block forever.
                procs.iter_mut().for_each(Running::kill);
                break;
            }
            if let Err(e) = self.check() {
                procs.iter_mut().for_each(Running::kill);
                return Err(e);
            }
            std::thread::sleep(POLL_INTERVAL);
        }

        let mut errors = Vec::new();
        for p in procs.iter_mut() {
            let tail = p.stderr_tail();
            match p.status {
                Some(st) if st.success() => {}
                Some(st) => errors.push(format!("{} exited with {st}{}", p.label, tail)),
                None => errors.push(format!("{} was killed{}", p.label, tail)),
            }
        }
        if errors.is_empty() {
            Ok(())
        } else {
            Err(Error::msg(errors.join("; ")))
        }
    }
}

struct Running {
    label: String,
    child: Child,
    stderr: Option<JoinHandle<Vec<String>>>,
    status: Option<ExitStatus>,
}

impl Running {
    fn spawn(cmd: &mut Command, label: String, stdin: Stdio, stdout: Stdio) -> Result<Self> {
        #[cfg(unix)]
        {
            use std::os::unix::process::CommandExt;
            unsafe {
                cmd.pre_exec(|| {
                    if libc::setpgid(0, 0) != 0 {
                        return Err(std::io::Error::last_os_error());
                    }
                    Ok(())
                });
            }
        }

        let mut child = cmd
            .stdin(stdin)
            .stdout(stdout)
            .stderr(Stdio::piped())
            .spawn()
            .map_err(|e| Error::msg(format!("failed to spawn {label}: {e}")))?;

        let stderr = child.stderr.take().map(|err| {
            let label = label.clone();
            std::thread::spawn(move || {
                let mut tail = Vec::new();
                for line in BufReader::new(err).lines().map_while(std::result::Result::ok) {
                    let line = sanitize_log_line(&line);
                    if line.is_empty() {
                        continue;
                    }
                    tracing::debug!(cmd = %label, "{line}");
                    tail.push(line);
                    if tail.len() > STDERR_TAIL {
                        tail.remove(0);
                    }
                }
                tail
            })
        });

        Ok(Self {
            label,
            child,
            stderr,
            status: None,
        })
    }

    fn kill(&mut self) {
        if self.status.is_some() {
            return;
        }
        let pgid = self.child.id();
        kill_pgroup(pgid, false);
        let grace = Instant::now() + TERM_GRACE;
        while Instant::now() < grace {
            if let Ok(Some(st)) = self.child.try_wait() {
                self.status = Some(st);
                return;
            }
            std::thread::sleep(POLL_INTERVAL);
        }
        kill_pgroup(pgid, true);
        let _ = self.child.kill();
        self.status = self.child.wait().ok();
    }

    fn stderr_tail(&mut self) -> String {
        let lines = self
            .stderr
            .take()
            .and_then(|h| h.join().ok())
            .unwrap_or_default();
        if lines.is_empty() {
            return String::new();
        }
        format!(": {}", lines.join(" | "))
    }
}

fn kill_pgroup(pgid: u32, force: bool) {
    #[cfg(unix)]
    {
        let sig = if force { libc::SIGKILL } else { libc::SIGTERM };
        // Negative pid addresses the whole group.
        let _ = unsafe { libc::kill(-(pgid as i32), sig) };
    }
    #[cfg(not(unix))]
    {
        let _ = (pgid, force);
    }
}

/// Program and arguments, shell-ish, for logs and error messages.
pub fn describe(cmd: &Command) -> String {
    let mut out = cmd.get_program().to_string_lossy().into_owned();
    for arg in cmd.get_args() {
        out.push(' ');
        out.push_str(&arg.to_string_lossy());
    }
    out
}

/// Strips terminal escape sequences and control characters, caps length.
pub fn sanitize_log_line(input: &str) -> String {
    let mut out = String::with_capacity(input.len().min(MAX_LOG_CHARS));
    let mut chars = input.chars().peekable();
    let mut count = 0usize;
    while let Some(c) = chars.next() {
        if c == '\x1b' {
            match chars.next() {
                // CSI: parameters until a final byte in '@'..='~'.
                Some('[') => {
                    for n in chars.by_ref() {
                        if ('@'..='~').contains(&n) {
                            break;
                        }
                    }
                }
                // OSC: until BEL or ST (ESC \).
                Some(']') => {
                    while let Some(n) = chars.next() {
                        if n == '\x07' {
                            break;
                        }
                        if n == '\x1b' && chars.peek() == Some(&'\\') {
                            chars.next();
                            break;
                        }
                    }
                }
                _ => {}
            }
            continue;
        }
        let c = if c == '\t' { ' ' } else { c };
        if c.is_control() || is_bidi_control(c) {
            continue;
        }
        out.push(c);
        count += 1;
        if count >= MAX_LOG_CHARS {
            out.push_str(" ...[truncated]");
            break;
        }
    }
    out
}

fn is_bidi_control(c: char) -> bool {
    matches!(c, '\u{061C}' | '\u{200E}' | '\u{200F}')
        || ('\u{202A}'..='\u{202E}').contains(&c)
        || ('\u{2066}'..='\u{2069}').contains(&c)
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;

    fn sh(script: &str) -> Command {
        let mut cmd = Command::new("sh");
        cmd.arg("-c").arg(script);
        cmd
    }

    #[test]
    fn output_captures_stdout() {
        let ctx = RunCtx::default().with_timeout(Duration::from_secs(10));
        let out = ctx.output(sh("echo hello; echo warn >&2")).expect("run");
        assert_eq!(out.trim(), "hello");
    }

    #[test]
    fn failure_includes_stderr_tail() {
        let ctx = RunCtx::default().with_timeout(Duration::from_secs(10));
        let err = ctx.run(sh("echo 'dataset does not exist' >&2; exit 3")).unwrap_err();
        let msg = err.to_string();
        assert!(msg.contains("dataset does not exist"), "{msg}");
        assert_eq!(err.kind(), ErrorKind::Other);
    }

    #[test]
    fn deadline_kills_slow_child() {
        let ctx = RunCtx::default().with_timeout(Duration::from_millis(300));
        let start = Instant::now();
        let err = ctx.run(sh("sleep 30")).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Timeout);
        assert!(start.elapsed() < Duration::from_secs(10));
    }

    #[test]
    fn cancel_flag_stops_before_spawn() {
        let ctx = RunCtx::default();
        ctx.request_cancel();
        let err = ctx.run(sh("true")).unwrap_err();
        assert!(err.is_cancelled());
    }

    fn cancel_after(ctx: &RunCtx, delay: Duration) -> std::thread::JoinHandle<()> {
        let ctx = ctx.clone();
        std::thread::spawn(move || {
            std::thread::sleep(delay);
            ctx.request_cancel();
        })
    }

    #[test]
    fn cancel_kills_running_child_group() {
        let ctx = RunCtx::default().with_timeout(Duration::from_secs(60));
        let canceller = cancel_after(&ctx, Duration::from_millis(300));
        let start = Instant::now();
        let err = ctx.run(sh("sleep 30 & wait")).unwrap_err();
        canceller.join().unwrap();
        assert_eq!(err.kind(), ErrorKind::Cancelled);
        assert!(start.elapsed() < Duration::from_secs(10), "{:?}", start.elapsed());
    }

    #[test]
    fn cancel_kills_running_pipeline() {
        let ctx = RunCtx::default().with_timeout(Duration::from_secs(60));
        let canceller = cancel_after(&ctx, Duration::from_millis(300));
        let start = Instant::now();
        let err = ctx
            .pipe(sh("sleep 30 & wait"), sh("cat > /dev/null"))
            .unwrap_err();
        canceller.join().unwrap();
        assert_eq!(err.kind(), ErrorKind::Cancelled);
        assert!(start.elapsed() < Duration::from_secs(10), "{:?}", start.elapsed());
    }

    #[test]
    fn pipe_connects_stdout_to_stdin() {
        let tmp = tempfile::tempdir().expect("tempdir");
        let out = tmp.path().join("received");
        let ctx = RunCtx::default().with_timeout(Duration::from_secs(10));
        ctx.pipe(
            sh("printf 'snapshot-stream'"),
            sh(&format!("cat > '{}'", out.display())),
        )
        .expect("pipe");
        assert_eq!(std::fs::read_to_string(out).unwrap(), "snapshot-stream");
    }

    #[test]
    fn pipe_reports_consumer_failure() {
        let ctx = RunCtx::default().with_timeout(Duration::from_secs(10));
        let err = ctx
            .pipe(sh("yes | head -c 100000"), sh("echo 'cannot receive' >&2; exit 1"))
            .unwrap_err();
        assert!(err.to_string().contains("cannot receive"), "{err}");
    }

    #[test]
    fn sanitize_strips_escapes_and_controls() {
        assert_eq!(
            sanitize_log_line("ok \u{1b}[31mred\u{1b}[0m \u{1b}]0;title\u{7} done"),
            "ok red  done"
        );
        assert_eq!(sanitize_log_line("a\tb\r\u{202e}c"), "a bc");
    }

    #[test]
    fn describe_joins_program_and_args() {
        let mut cmd = Command::new("zfs");
        cmd.arg("list").arg("-H");
        assert_eq!(describe(&cmd), "zfs list -H");
    }
}
