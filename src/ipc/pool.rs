//! Bounded pool of connection workers

use std::collections::HashMap;
use std::io;
use std::net::Shutdown;
use std::os::unix::net::UnixStream;
use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::mpsc::{self, Receiver, SyncSender, TrySendError};
use std::sync::{Arc, Mutex, MutexGuard};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use tracing::Dispatch;

/// Extra time granted to workers after their connections were forced closed
const FORCE_CLOSE_WAIT: Duration = Duration::from_millis(200);
const POLL_INTERVAL: Duration = Duration::from_millis(10);

type Handler = Arc<dyn Fn(UnixStream) + Send + Sync>;

/// Connections currently owned by a worker, keyed by a per-pool id
#[derive(Default)]
struct InFlight {
    next_id: AtomicU64,
    streams: Mutex<HashMap<u64, UnixStream>>,
}

impl InFlight {
    fn lock(&self) -> MutexGuard<'_, HashMap<u64, UnixStream>> {
        self.streams.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn track(&self, stream: &UnixStream) -> Option<u64> {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        match stream.try_clone() {
            Ok(clone) => {
                self.lock().insert(id, clone);
                Some(id)
            }
            Err(e) => {
                tracing::debug!(error = %e, "connection cannot be force-closed");
                None
            }
        }
    }

    fn release(&self, id: u64) {
        self.lock().remove(&id);
    }

    fn close_all(&self) -> usize {
        let streams: Vec<UnixStream> = self.lock().drain().map(|(_, s)| s).collect();
        for stream in &streams {
            let _ = stream.shutdown(Shutdown::Both);
        }
        streams.len()
    }
}

/// Fixed set of worker threads fed through a bounded queue
pub(crate) struct WorkerPool {
    sender: Option<SyncSender<UnixStream>>,
    workers: Vec<JoinHandle<()>>,
    in_flight: Arc<InFlight>,
    stopping: Arc<AtomicBool>,
}

impl WorkerPool {
    /// Spawn `size` workers; at most `pending` accepted connections may wait
    pub fn new(
        name: &str,
        size: usize,
        pending: usize,
        handler: Handler,
        log: Option<Dispatch>,
    ) -> io::Result<Self> {
        let (sender, receiver) = mpsc::sync_channel(pending);
        let receiver = Arc::new(Mutex::new(receiver));
        let in_flight = Arc::new(InFlight::default());
        let stopping = Arc::new(AtomicBool::new(false));

        let mut pool = Self {
            sender: Some(sender),
            workers: Vec::with_capacity(size),
            in_flight,
            stopping,
        };

        for index in 0..size {
            let worker = Worker {
                receiver: Arc::clone(&receiver),
                handler: Arc::clone(&handler),
                in_flight: Arc::clone(&pool.in_flight),
                stopping: Arc::clone(&pool.stopping),
                log: log.clone(),
            };
            let spawned = thread::Builder::new()
                .name(format!("lipc-{name}-{index}"))
                .spawn(move || worker.run());
            match spawned {
                Ok(handle) => pool.workers.push(handle),
                Err(e) => {
                    // Stop the workers that did start before giving up
                    pool.shutdown(Duration::ZERO);
                    return Err(e);
                }
            }
        }

        Ok(pool)
    }

    pub fn size(&self) -> usize {
        self.workers.len()
    }

    /// Queue a connection, handing it back when the queue is full
    pub fn dispatch(&self, stream: UnixStream) -> Result<(), UnixStream> {
        let Some(sender) = &self.sender else {
            return Err(stream);
        };
        match sender.try_send(stream) {
            Ok(()) => Ok(()),
            Err(TrySendError::Full(stream)) | Err(TrySendError::Disconnected(stream)) => {
                Err(stream)
            }
        }
    }

    /// Stop accepting work and wait up to `grace` for in-flight connections
    ///
    /// Connections still open afterwards are shut down at the socket level.
    /// Workers stuck inside a function call are left to finish on their own.
    pub fn shutdown(&mut self, grace: Duration) {
        // Workers exit once the queue is drained and the sender is gone
        self.sender.take();

        if !wait_until(Instant::now() + grace, || self.all_finished()) {
            self.stopping.store(true, Ordering::SeqCst);
            let closed = self.in_flight.close_all();
            tracing::warn!(closed, "grace period elapsed, forcing connections closed");
            wait_until(Instant::now() + FORCE_CLOSE_WAIT, || self.all_finished());
        }

        let mut detached = 0;
        for handle in self.workers.drain(..) {
            if handle.is_finished() {
                if handle.join().is_err() {
                    tracing::error!("worker thread panicked");
                }
            } else {
                detached += 1;
            }
        }
        if detached > 0 {
            tracing::warn!(detached, "workers still busy in function calls, detaching");
        }
    }

    fn all_finished(&self) -> bool {
        self.workers.iter().all(JoinHandle::is_finished)
    }
}

impl Drop for WorkerPool {
    fn drop(&mut self) {
        if !self.workers.is_empty() {
            self.shutdown(Duration::ZERO);
        }
    }
}

struct Worker {
    receiver: Arc<Mutex<Receiver<UnixStream>>>,
    handler: Handler,
    in_flight: Arc<InFlight>,
    stopping: Arc<AtomicBool>,
    log: Option<Dispatch>,
}

impl Worker {
    fn run(self) {
        let _log = self.log.as_ref().map(tracing::dispatcher::set_default);

        loop {
            let next = {
                let receiver = self.receiver.lock().unwrap_or_else(|e| e.into_inner());
                receiver.recv()
            };
            let Ok(stream) = next else {
                break;
            };

            if self.stopping.load(Ordering::SeqCst) {
                tracing::debug!("dropping queued connection during shutdown");
                continue;
            }

            let id = self.in_flight.track(&stream);
            let handler = &self.handler;
            if catch_unwind(AssertUnwindSafe(|| handler(stream))).is_err() {
                tracing::error!("connection handler panicked");
            }
            if let Some(id) = id {
                self.in_flight.release(id);
            }
        }
    }
}

/// Poll `done` until it holds or `deadline` passes
pub(crate) fn wait_until(deadline: Instant, mut done: impl FnMut() -> bool) -> bool {
    loop {
        if done() {
            return true;
        }
        if Instant::now() >= deadline {
            return false;
        }
        thread::sleep(POLL_INTERVAL);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::{Read, Write};
    use std::sync::atomic::AtomicUsize;

    fn echo_handler(handled: Arc<AtomicUsize>) -> Handler {
        Arc::new(move |mut stream: UnixStream| {
            let mut buf = [0u8; 1];
            if stream.read_exact(&mut buf).is_ok() {
                let _ = stream.write_all(&buf);
            }
            handled.fetch_add(1, Ordering::SeqCst);
        })
    }

    #[test]
    fn test_workers_handle_dispatched_connections() {
        let handled = Arc::new(AtomicUsize::new(0));
        let mut pool = WorkerPool::new("echo", 2, 4, echo_handler(handled.clone()), None).unwrap();
        assert_eq!(pool.size(), 2);

        let mut clients = Vec::new();
        for byte in 0..3u8 {
            let (mut client, server) = UnixStream::pair().unwrap();
            client.write_all(&[byte]).unwrap();
            assert!(pool.dispatch(server).is_ok());
            clients.push((byte, client));
        }
        for (byte, mut client) in clients {
            let mut buf = [0u8; 1];
            client.read_exact(&mut buf).unwrap();
            assert_eq!(buf[0], byte);
        }

        pool.shutdown(Duration::from_secs(1));
        assert_eq!(handled.load(Ordering::SeqCst), 3);
    }

    #[test]
    fn test_full_queue_hands_connection_back() {
        let handled = Arc::new(AtomicUsize::new(0));
        let mut pool = WorkerPool::new("full", 1, 1, echo_handler(handled), None).unwrap();

        // Neither connection ever sends, so the worker stays blocked on the first
        let (_c1, s1) = UnixStream::pair().unwrap();
        let (_c2, s2) = UnixStream::pair().unwrap();
        let (_c3, s3) = UnixStream::pair().unwrap();
        assert!(pool.dispatch(s1).is_ok());
        assert!(wait_until(Instant::now() + Duration::from_secs(1), || {
            pool.in_flight.lock().len() == 1
        }));
        assert!(pool.dispatch(s2).is_ok());
        assert!(pool.dispatch(s3).is_err());

        pool.shutdown(Duration::from_millis(50));
    }

    #[test]
    fn test_shutdown_forces_stuck_connections_closed() {
        let handled = Arc::new(AtomicUsize::new(0));
        let mut pool =
            WorkerPool::new("stuck", 1, 1, echo_handler(handled.clone()), None).unwrap();

        let (_client, server) = UnixStream::pair().unwrap();
        assert!(pool.dispatch(server).is_ok());

        let start = Instant::now();
        pool.shutdown(Duration::from_millis(100));
        assert!(start.elapsed() < Duration::from_secs(2));
        assert_eq!(handled.load(Ordering::SeqCst), 1);
    }
}
