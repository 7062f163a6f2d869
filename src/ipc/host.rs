//! Where a running endpoint lives
//!
//! The accept loop runs either on a dedicated thread or in a forked child.
//! Both are stopped through one end of a socket pair; the child also stops
//! when the registering process exits and the pair is closed.

use std::io::{self, Read, Write};
use std::os::fd::{AsRawFd, RawFd};
use std::os::unix::net::{UnixListener, UnixStream};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use crate::config::Isolation;
use crate::error::Result;
use crate::ipc::pool::wait_until;
use crate::ipc::server::{STARTED, ServeContext, serve};

/// Time allowed past the grace period before a host is given up on
const STOP_MARGIN: Duration = Duration::from_millis(500);
const REAP_INTERVAL: Duration = Duration::from_millis(10);
/// Upper bound on how long a host may take to report its setup
const SETUP_TIMEOUT: Duration = Duration::from_secs(10);

/// A launched accept loop
pub(crate) enum Host {
    Thread {
        handle: JoinHandle<io::Result<()>>,
        trigger: UnixStream,
    },
    Process {
        pid: libc::pid_t,
        trigger: UnixStream,
    },
}

impl Host {
    /// Start serving `listener` with the given isolation
    ///
    /// Returns once the accept loop reported that its setup finished, with
    /// the setup error if it did not.
    pub fn launch(
        listener: UnixListener,
        ctx: ServeContext,
        isolation: Isolation,
    ) -> Result<Self> {
        let (trigger, signal) = UnixStream::pair()?;

        let host = match isolation {
            Isolation::Thread => {
                let handle = thread::Builder::new()
                    .name(format!("lipc-{}", ctx.service.name()))
                    .spawn(move || serve(listener, signal, ctx))?;
                Host::Thread { handle, trigger }
            }
            Isolation::Process => spawn_process(listener, signal, trigger, ctx)?,
        };

        match host.await_setup() {
            Ok(()) => Ok(host),
            Err(e) => Err(host.abandon(e).into()),
        }
    }

    fn trigger(&self) -> &UnixStream {
        match self {
            Host::Thread { trigger, .. } | Host::Process { trigger, .. } => trigger,
        }
    }

    fn await_setup(&self) -> io::Result<()> {
        let mut trigger = self.trigger();
        trigger.set_read_timeout(Some(SETUP_TIMEOUT))?;
        let mut status = [0u8; 1];
        let read = trigger.read_exact(&mut status);
        trigger.set_read_timeout(None)?;

        match read {
            Ok(()) if status[0] == STARTED => Ok(()),
            Ok(()) => Err(io::Error::other("endpoint setup failed")),
            Err(e) if e.kind() == io::ErrorKind::UnexpectedEof => {
                Err(io::Error::other("endpoint exited during setup"))
            }
            Err(e) => Err(e),
        }
    }

    /// Stop a host whose setup failed, preferring its own error over `fallback`
    fn abandon(self, fallback: io::Error) -> io::Error {
        match self {
            Host::Thread { handle, mut trigger } => {
                signal(&mut trigger);
                let deadline = Instant::now() + STOP_MARGIN;
                if wait_until(deadline, || handle.is_finished()) {
                    if let Ok(Err(cause)) = handle.join() {
                        return cause;
                    }
                }
                fallback
            }
            Host::Process { pid, mut trigger } => {
                signal(&mut trigger);
                drop(trigger);
                reap(pid, Instant::now() + STOP_MARGIN);
                fallback
            }
        }
    }

    /// Signal the accept loop and wait for it to wind down
    ///
    /// A child process that outlives `grace` plus a margin is killed.
    pub fn stop(self, grace: Duration) {
        let deadline = Instant::now() + grace + STOP_MARGIN;

        match self {
            Host::Thread { handle, mut trigger } => {
                signal(&mut trigger);
                if !wait_until(deadline, || handle.is_finished()) {
                    tracing::warn!("accept loop did not stop in time, detaching");
                    return;
                }
                match handle.join() {
                    Ok(Ok(())) => {}
                    Ok(Err(e)) => tracing::warn!(error = %e, "accept loop failed"),
                    Err(_) => tracing::error!("accept loop panicked"),
                }
            }
            Host::Process { pid, mut trigger } => {
                signal(&mut trigger);
                drop(trigger);
                reap(pid, deadline);
            }
        }
    }
}

fn signal(trigger: &mut UnixStream) {
    if let Err(e) = trigger.write_all(&[1]) {
        tracing::debug!(error = %e, "shutdown signal not delivered");
    }
}

fn spawn_process(
    listener: UnixListener,
    signal: UnixStream,
    trigger: UnixStream,
    ctx: ServeContext,
) -> Result<Host> {
    // SAFETY: the child only runs the accept loop and leaves through _exit
    match unsafe { libc::fork() } {
        -1 => Err(io::Error::last_os_error().into()),
        0 => {
            drop(trigger);
            close_inherited_fds(&[listener.as_raw_fd(), signal.as_raw_fd()]);
            let code = match serve(listener, signal, ctx) {
                Ok(()) => 0,
                Err(e) => {
                    tracing::error!(error = %e, "endpoint process failed");
                    1
                }
            };
            unsafe { libc::_exit(code) }
        }
        pid => {
            drop(listener);
            drop(signal);
            tracing::debug!(pid, "endpoint process started");
            Ok(Host::Process { pid, trigger })
        }
    }
}

/// Close every descriptor above stdio except `keep`
///
/// Without this the child would hold other endpoints' listeners open and keep
/// their addresses connectable after they terminate.
fn close_inherited_fds(keep: &[RawFd]) {
    let max = match unsafe { libc::sysconf(libc::_SC_OPEN_MAX) } {
        n if n > 0 => n.min(65536) as RawFd,
        _ => 1024,
    };
    for fd in 3..max {
        if !keep.contains(&fd) {
            unsafe {
                libc::close(fd);
            }
        }
    }
}

/// Wait for the child to exit, killing it once `deadline` passes
fn reap(pid: libc::pid_t, deadline: Instant) {
    let mut status = 0;

    loop {
        match unsafe { libc::waitpid(pid, &mut status, libc::WNOHANG) } {
            0 => {}
            -1 => {
                let err = io::Error::last_os_error();
                if err.kind() == io::ErrorKind::Interrupted {
                    continue;
                }
                tracing::debug!(pid, error = %err, "endpoint process already reaped");
                return;
            }
            _ => {
                tracing::debug!(pid, status, "endpoint process exited");
                return;
            }
        }

        if Instant::now() >= deadline {
            tracing::warn!(pid, "endpoint process did not stop in time, killing");
            unsafe {
                libc::kill(pid, libc::SIGKILL);
                libc::waitpid(pid, &mut status, 0);
            }
            return;
        }
        thread::sleep(REAP_INTERVAL);
    }
}
