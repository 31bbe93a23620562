//! CGI/1.1 script execution.
//!
//! [`resolve`] decides whether a request names a script and prepares a
//! [`CgiLaunch`]; [`CgiProcess`] owns the running child and its two
//! non-blocking pipes. Streaming the output to the client is done by the
//! server's event loop.

pub mod env;
pub mod parser;

use crate::error::{Error, GatewayFailure, Result};
use crate::handlers::Context;
use crate::http::request::Request;
use crate::router::resolve_disk_path;
use log::{debug, warn};
use mio::unix::pipe;
use mio::{Interest, Registry, Token};
use std::fs;
use std::io::{self, Read, Write};
use std::os::unix::fs::PermissionsExt;
use std::os::unix::process::CommandExt;
use std::path::PathBuf;
use std::process::{Child, Command, ExitStatus, Stdio};
use std::time::{Duration, Instant};

/// CPU seconds a script may burn before the kernel stops it.
const CPU_LIMIT_SECS: libc::rlim_t = 30;

/// Everything needed to start one script.
#[derive(Debug)]
pub struct CgiLaunch {
    pub script: PathBuf,
    pub interpreter: Option<PathBuf>,
    pub working_dir: PathBuf,
    pub env: Vec<(String, String)>,
    pub input: Vec<u8>,
}

/// Returns a launch description when the request path names a CGI script
/// of `ctx.location`, `None` when it does not.
///
/// The request body moves into the launch.
pub fn resolve(ctx: &Context<'_>, request: &mut Request) -> Result<Option<CgiLaunch>> {
    let location = ctx.location;
    if location.cgi.is_empty() {
        return Ok(None);
    }
    let Some(script) = env::split_script(&request.path, |seg| location.cgi_for(seg).is_some())
    else {
        return Ok(None);
    };

    let file_name = script.script_name.rsplit('/').next().unwrap_or_default();
    let Some(mapping) = location.cgi_for(file_name) else {
        return Ok(None);
    };

    let filename = resolve_disk_path(location, script.script_name)?;
    let meta = fs::metadata(&filename).map_err(Error::from_fs)?;
    if meta.is_dir() {
        // A directory named like a script is served as a directory.
        return Ok(None);
    }
    if !meta.is_file() {
        return Err(Error::Forbidden);
    }
    if mapping.interpreter.is_none() && meta.permissions().mode() & 0o111 == 0 {
        return Err(Error::Forbidden);
    }

    let script_path = fs::canonicalize(&filename).map_err(Error::from_fs)?;
    let working_dir = script_path
        .parent()
        .map(PathBuf::from)
        .unwrap_or_else(|| PathBuf::from("/"));
    let env = env::build(ctx, request, &script, &script_path);

    Ok(Some(CgiLaunch {
        script: script_path,
        interpreter: mapping.interpreter.clone(),
        working_dir,
        env,
        input: std::mem::take(&mut request.body),
    }))
}

/// A running script. Dropping it kills the process group and reaps the child.
pub struct CgiProcess {
    child: Child,
    stdin: Option<pipe::Sender>,
    stdout: Option<pipe::Receiver>,
    input: Vec<u8>,
    input_written: usize,
    timeout: Duration,
    deadline: Instant,
    reaped: bool,
}

impl CgiProcess {
    pub fn spawn(launch: CgiLaunch, timeout: Duration) -> Result<CgiProcess> {
        let mut command = match &launch.interpreter {
            Some(interpreter) => {
                let mut cmd = Command::new(interpreter);
                cmd.arg(&launch.script);
                cmd
            }
            None => Command::new(&launch.script),
        };
        command
            .current_dir(&launch.working_dir)
            .env_clear()
            .envs(launch.env.iter().map(|(k, v)| (k.as_str(), v.as_str())))
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::inherit())
            .process_group(0);
        // SAFETY: `limit_cpu` only calls async-signal-safe `setrlimit`.
        unsafe {
            command.pre_exec(limit_cpu);
        }

        let child = command.spawn().map_err(GatewayFailure::Spawn)?;
        debug!("[CGI] spawned pid {} for {:?}", child.id(), launch.script);

        // From here on `Drop` cleans up whatever fails below.
        let mut process = CgiProcess {
            child,
            stdin: None,
            stdout: None,
            input: launch.input,
            input_written: 0,
            timeout,
            deadline: Instant::now() + timeout,
            reaped: false,
        };

        if let Some(stdout) = process.child.stdout.take() {
            let receiver = pipe::Receiver::from(stdout);
            receiver.set_nonblocking(true).map_err(GatewayFailure::Io)?;
            process.stdout = Some(receiver);
        }
        if let Some(stdin) = process.child.stdin.take() {
            // No body: dropping the pipe gives the script EOF at once.
            if !process.input.is_empty() {
                let sender = pipe::Sender::from(stdin);
                sender.set_nonblocking(true).map_err(GatewayFailure::Io)?;
                process.stdin = Some(sender);
            }
        }
        Ok(process)
    }

    pub fn pid(&self) -> u32 {
        self.child.id()
    }

    pub fn has_pending_input(&self) -> bool {
        self.stdin.is_some()
    }

    pub fn register(
        &mut self,
        registry: &Registry,
        output: Token,
        input: Option<Token>,
    ) -> io::Result<()> {
        if let Some(stdout) = self.stdout.as_mut() {
            registry.register(stdout, output, Interest::READABLE)?;
        }
        if let (Some(stdin), Some(token)) = (self.stdin.as_mut(), input) {
            registry.register(stdin, token, Interest::WRITABLE)?;
        }
        Ok(())
    }

    pub fn deregister(&mut self, registry: &Registry) {
        if let Some(stdout) = self.stdout.as_mut() {
            let _ = registry.deregister(stdout);
        }
        self.close_input(registry);
    }

    /// Writes as much of the request body as the pipe accepts. Returns
    /// `true` once nothing is left to write.
    pub fn write_input(&mut self) -> std::result::Result<bool, GatewayFailure> {
        let Some(stdin) = self.stdin.as_mut() else {
            return Ok(true);
        };
        while self.input_written < self.input.len() {
            match stdin.write(&self.input[self.input_written..]) {
                Ok(0) => break,
                Ok(n) => self.input_written += n,
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => return Ok(false),
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                // The script stopped reading its input; its output still counts.
                Err(e) if e.kind() == io::ErrorKind::BrokenPipe => {
                    debug!("[CGI] pid {} closed stdin early", self.child.id());
                    break;
                }
                Err(e) => return Err(GatewayFailure::Io(e)),
            }
        }
        Ok(true)
    }

    /// Closes the script's stdin.
    pub fn close_input(&mut self, registry: &Registry) {
        if let Some(mut stdin) = self.stdin.take() {
            let _ = registry.deregister(&mut stdin);
        }
        self.input = Vec::new();
    }

    /// One non-blocking read from the script's stdout. `Ok(0)` is EOF.
    pub fn read_output(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        match self.stdout.as_mut() {
            Some(stdout) => stdout.read(buf),
            None => Ok(0),
        }
    }

    /// Restarts the inactivity deadline.
    pub fn touch(&mut self) {
        self.deadline = Instant::now() + self.timeout;
    }

    pub fn is_expired(&self, now: Instant) -> bool {
        now >= self.deadline
    }

    /// Kills the process group unless the child already exited, then reaps.
    pub fn terminate(&mut self) -> Option<ExitStatus> {
        if self.reaped {
            return None;
        }
        self.stdin = None;
        self.stdout = None;

        match self.child.try_wait() {
            Ok(Some(status)) => {
                self.reaped = true;
                return Some(status);
            }
            Ok(None) => {}
            Err(e) => warn!("[CGI] try_wait on pid {} failed: {}", self.child.id(), e),
        }

        let pgid = self.child.id() as libc::pid_t;
        // SAFETY: plain syscall; the child is unreaped so its group id is ours.
        if unsafe { libc::kill(-pgid, libc::SIGKILL) } != 0 {
            let _ = self.child.kill();
        }
        match self.child.wait() {
            Ok(status) => {
                self.reaped = true;
                Some(status)
            }
            Err(e) => {
                warn!("[CGI] failed to reap pid {}: {}", self.child.id(), e);
                None
            }
        }
    }
}

impl Drop for CgiProcess {
    fn drop(&mut self) {
        self.terminate();
    }
}

fn limit_cpu() -> io::Result<()> {
    let limit = libc::rlimit {
        rlim_cur: CPU_LIMIT_SECS,
        rlim_max: CPU_LIMIT_SECS,
    };
    // SAFETY: `limit` is a valid rlimit for the duration of the call.
    if unsafe { libc::setrlimit(libc::RLIMIT_CPU, &limit) } != 0 {
        return Err(io::Error::last_os_error());
    }
    Ok(())
}
