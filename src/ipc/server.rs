//! Endpoint server
//!
//! Binds the endpoint address, runs the accept loop and speaks the
//! request/response protocol on each accepted connection.

use std::io::{self, Write};
use std::os::fd::AsRawFd;
use std::os::unix::net::{UnixListener, UnixStream};
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use polling::{Event, Events, Poller};

use crate::config::EndpointOptions;
use crate::error::{Error, Result};
use crate::ipc::pool::WorkerPool;
use crate::ipc::protocol::{ErrorKind, Request, Response, read_frame, write_frame};
use crate::ipc::service::Service;
use crate::logging;

const LISTENER_KEY: usize = 0;
const SHUTDOWN_KEY: usize = 1;

const BUSY_WRITE_TIMEOUT: Duration = Duration::from_millis(100);
const ACCEPT_RETRY_DELAY: Duration = Duration::from_millis(10);

/// Everything the accept loop of one endpoint needs
pub(crate) struct ServeContext {
    pub service: Arc<Service>,
    pub options: EndpointOptions,
}

/// Bind a listener at `address`, clearing a stale socket file first
///
/// A socket file that still accepts connections belongs to a live endpoint
/// and is left alone.
pub(crate) fn bind(address: &Path, backlog: i32) -> Result<UnixListener> {
    clear_stale(address)?;

    let listener = UnixListener::bind(address)?;
    // Listening again on a bound socket only adjusts the queue length
    if unsafe { libc::listen(listener.as_raw_fd(), backlog) } != 0 {
        let err = io::Error::last_os_error();
        drop(listener);
        remove_address(address);
        return Err(err.into());
    }

    tracing::debug!(path = %address.display(), backlog, "bound endpoint address");
    Ok(listener)
}

fn clear_stale(address: &Path) -> Result<()> {
    match UnixStream::connect(address) {
        Ok(_) => return Err(Error::AddressInUse(address.to_path_buf())),
        Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(()),
        Err(e) => {
            tracing::debug!(
                path = %address.display(),
                error = %e,
                "address not accepting connections"
            );
        }
    }

    match std::fs::remove_file(address) {
        Ok(()) => {
            tracing::info!(path = %address.display(), "removed stale socket file");
            Ok(())
        }
        Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
        Err(e) => Err(e.into()),
    }
}

/// Remove the socket file at `address`, if any
pub(crate) fn remove_address(address: &Path) {
    match std::fs::remove_file(address) {
        Ok(()) => {}
        Err(e) if e.kind() == io::ErrorKind::NotFound => {}
        Err(e) => {
            tracing::warn!(path = %address.display(), error = %e, "failed to remove socket file");
        }
    }
}

/// Byte written on `shutdown` once the accept loop is ready
pub(crate) const STARTED: u8 = 0;
/// Byte written on `shutdown` when setup failed
pub(crate) const FAILED: u8 = 1;

/// Run the accept loop until `shutdown` becomes readable
///
/// Accepted connections are handed to a worker pool. Once the loop ends the
/// listener is closed and in-flight calls get the configured grace period.
/// The endpoint log file is opened here so a forked host owns its own.
///
/// Whether setup succeeded is reported back over `shutdown` as a single
/// [`STARTED`] or [`FAILED`] byte before any connection is accepted.
pub(crate) fn serve(
    listener: UnixListener,
    shutdown: UnixStream,
    ctx: ServeContext,
) -> io::Result<()> {
    let name = ctx.service.name().to_string();

    let log = match logging::endpoint_dispatch(&name, &ctx.options) {
        Ok(log) => log,
        Err(e) => {
            report_setup(&shutdown, FAILED);
            return Err(e);
        }
    };
    let _log = log.as_ref().map(tracing::dispatcher::set_default);

    let (mut pool, poller) = match prepare(&name, &listener, &shutdown, &ctx, log) {
        Ok(prepared) => prepared,
        Err(e) => {
            tracing::error!(function = %name, error = %e, "endpoint setup failed");
            report_setup(&shutdown, FAILED);
            return Err(e);
        }
    };
    report_setup(&shutdown, STARTED);

    tracing::info!(function = %name, workers = pool.size(), "endpoint serving");
    let result = accept_loop(&listener, &poller, &pool);

    let _ = poller.delete(&listener);
    let _ = poller.delete(&shutdown);
    drop(listener);

    pool.shutdown(ctx.options.grace_period());
    tracing::info!(function = %name, "endpoint stopped");
    result
}

fn prepare(
    name: &str,
    listener: &UnixListener,
    shutdown: &UnixStream,
    ctx: &ServeContext,
    log: Option<tracing::Dispatch>,
) -> io::Result<(WorkerPool, Poller)> {
    listener.set_nonblocking(true)?;
    shutdown.set_nonblocking(true)?;

    let service = Arc::clone(&ctx.service);
    let io_timeout = ctx.options.io_timeout();
    let pool = WorkerPool::new(
        name,
        ctx.options.max_workers(),
        ctx.options.max_pending(),
        Arc::new(move |stream| handle_connection(stream, &service, io_timeout)),
        log,
    )?;

    let poller = Poller::new()?;
    // SAFETY: both sources are deleted from the poller before they are dropped
    unsafe {
        poller.add(listener, Event::readable(LISTENER_KEY))?;
        if let Err(e) = poller.add(shutdown, Event::readable(SHUTDOWN_KEY)) {
            let _ = poller.delete(listener);
            return Err(e);
        }
    }

    Ok((pool, poller))
}

fn report_setup(shutdown: &UnixStream, status: u8) {
    let mut stream = shutdown;
    if let Err(e) = stream.write_all(&[status]) {
        tracing::debug!(error = %e, "setup status not delivered");
    }
}

fn accept_loop(listener: &UnixListener, poller: &Poller, pool: &WorkerPool) -> io::Result<()> {
    let mut events = Events::new();

    loop {
        events.clear();
        match poller.wait(&mut events, None) {
            Ok(_) => {}
            Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(e) => {
                tracing::error!(error = %e, "poll failed");
                return Err(e);
            }
        }

        let mut readable = false;
        for event in events.iter() {
            match event.key {
                SHUTDOWN_KEY => {
                    tracing::debug!("shutdown requested");
                    return Ok(());
                }
                LISTENER_KEY => readable = true,
                _ => {}
            }
        }

        if readable {
            accept_pending(listener, pool);
            poller.modify(listener, Event::readable(LISTENER_KEY))?;
        }
    }
}

fn accept_pending(listener: &UnixListener, pool: &WorkerPool) {
    loop {
        match listener.accept() {
            Ok((stream, _)) => {
                if let Err(e) = stream.set_nonblocking(false) {
                    tracing::warn!(error = %e, "failed to configure connection");
                    continue;
                }
                if let Err(stream) = pool.dispatch(stream) {
                    reject_busy(stream, pool.size());
                }
            }
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => return,
            Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(e) => {
                tracing::warn!(error = %e, "failed to accept connection");
                std::thread::sleep(ACCEPT_RETRY_DELAY);
                return;
            }
        }
    }
}

/// Answer a connection that no worker can take and close it
fn reject_busy(mut stream: UnixStream, workers: usize) {
    tracing::warn!(workers, "all workers busy, rejecting connection");

    let response = Response::error(ErrorKind::Busy, "endpoint busy");
    let written = response.to_bytes().map_err(io::Error::other).and_then(|framed| {
        stream.set_write_timeout(Some(BUSY_WRITE_TIMEOUT))?;
        write_frame(&mut stream, &framed)
    });
    if let Err(e) = written {
        tracing::debug!(error = %e, "failed to send busy response");
    }
}

/// Serve exactly one request on `stream`
///
/// Undecodable requests close the connection without a response. A peer
/// that disappears before the response is written only costs a warning.
pub(crate) fn handle_connection(
    mut stream: UnixStream,
    service: &Service,
    io_timeout: Option<Duration>,
) {
    let function = service.name();

    if let Err(e) = stream
        .set_read_timeout(io_timeout)
        .and_then(|()| stream.set_write_timeout(io_timeout))
    {
        tracing::warn!(function, error = %e, "failed to set connection timeouts");
        return;
    }

    let body = match read_frame(&mut stream) {
        Ok(body) => body,
        Err(e) if e.kind() == io::ErrorKind::UnexpectedEof => {
            tracing::debug!(function, "connection closed without a request");
            return;
        }
        Err(e) => {
            tracing::warn!(function, error = %e, "failed to read request");
            return;
        }
    };

    let request = match Request::from_bytes(&body) {
        Ok(request) => request,
        Err(e) => {
            tracing::warn!(function, error = %e, "dropping connection with undecodable request");
            return;
        }
    };
    tracing::trace!(function, kind = request.kind.as_str(), "handling request");

    let response = service.handle(&request);
    let framed = match response.to_bytes() {
        Ok(framed) => framed,
        Err(e) => {
            tracing::error!(function, error = %e, "failed to encode response");
            match Response::error(ErrorKind::Execution, format!("failed to encode result: {e}"))
                .to_bytes()
            {
                Ok(framed) => framed,
                Err(_) => return,
            }
        }
    };

    if let Err(e) = write_frame(&mut stream, &framed) {
        tracing::warn!(function, error = %e, "client went away before the response was sent");
    }
}
