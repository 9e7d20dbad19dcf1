use std::{
    io,
    sync::{Arc, Mutex, MutexGuard, PoisonError, Weak},
    time::Duration,
};

use log::debug;
use tokio::{
    io::{AsyncReadExt, AsyncWriteExt},
    net::TcpStream,
    task::JoinHandle,
    time::{interval, timeout, timeout_at, Instant, MissedTickBehavior},
};
use tokio_util::sync::CancellationToken;

use super::error::{Result, TunnelError};

pub const RECLAIM_INTERVAL: Duration = Duration::from_secs(3);
const CLOSE_DEADLINE: Duration = Duration::from_millis(100);
const READ_CHUNK: usize = 8 * 1024;

/// Ready sockets supplied by one tunnel client, each consumed by a single
/// proxied request.
///
/// Every state change goes through one lock. An acquired socket is moved out of
/// its entry into the returned [`ForwardConnection`], so the entry keeps only
/// its flags while a request is in flight.
#[derive(Clone, Default)]
pub struct ForwardConnectionPool {
    inner: Arc<Mutex<PoolInner>>,
}

#[derive(Default)]
struct PoolInner {
    next_id: u64,
    closed: bool,
    entries: Vec<Entry>,
}

struct Entry {
    id: u64,
    stream: Option<TcpStream>,
    in_use: bool,
    alive: bool,
}

impl PoolInner {
    fn entry_mut(&mut self, id: u64) -> Option<&mut Entry> {
        self.entries.iter_mut().find(|e| e.id == id)
    }
}

impl ForwardConnectionPool {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, PoolInner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Tracks a freshly accepted socket. Returns `None` and drops the socket
    /// once the pool has been closed.
    pub fn append(&self, stream: TcpStream) -> Option<u64> {
        let mut inner = self.lock();
        if inner.closed {
            return None;
        }

        let id = inner.next_id;
        inner.next_id += 1;
        inner.entries.push(Entry {
            id,
            stream: Some(stream),
            in_use: false,
            alive: true,
        });

        Some(id)
    }

    /// Hands out the first idle live socket, or `None` without waiting.
    pub fn acquire(&self) -> Option<ForwardConnection> {
        let mut inner = self.lock();

        let entry = inner.entries.iter_mut().find(|e| !e.in_use && e.alive)?;
        let stream = entry.stream.take()?;
        entry.in_use = true;

        Some(ForwardConnection {
            id: entry.id,
            stream: Some(stream),
            pool: Arc::downgrade(&self.inner),
            used: false,
        })
    }

    /// Returns a socket to its entry and clears `in_use`. A socket that has
    /// carried a request, or whose pool was closed in the meantime, is closed
    /// and its entry marked dead in the same critical section, so it can never
    /// be acquired again.
    pub fn release(&self, mut conn: ForwardConnection) {
        let Some(stream) = conn.stream.take() else {
            return;
        };

        let mut inner = self.lock();
        let closed = inner.closed;

        match inner.entry_mut(conn.id) {
            Some(entry) if !closed && entry.alive && !conn.used => {
                entry.stream = Some(stream);
                entry.in_use = false;
            }
            Some(entry) => {
                entry.in_use = false;
                entry.alive = false;
            }
            None => {}
        }
    }

    /// Closes an idle entry's socket and marks it dead. Entries held by an
    /// in-flight request are left alone; returns whether the entry is dead.
    pub async fn close_entry(&self, id: u64) -> bool {
        let stream = {
            let mut inner = self.lock();
            let Some(entry) = inner.entry_mut(id) else {
                return true;
            };

            if entry.in_use {
                return false;
            }

            entry.alive = false;
            entry.stream.take()
        };

        if let Some(stream) = stream {
            shutdown(stream).await;
        }

        true
    }

    /// Number of tracked entries, dead ones included until reclaimed.
    pub fn size(&self) -> usize {
        self.lock().entries.len()
    }

    /// Closes every idle socket and refuses new ones. Sockets held by in-flight
    /// requests are closed when they are released.
    pub async fn close_all(&self) {
        let streams: Vec<TcpStream> = {
            let mut inner = self.lock();
            inner.closed = true;

            inner
                .entries
                .iter_mut()
                .filter(|e| !e.in_use)
                .filter_map(|e| {
                    e.alive = false;
                    e.stream.take()
                })
                .collect()
        };

        for stream in streams {
            shutdown(stream).await;
        }
    }

    /// Drops dead entries that no request holds.
    pub fn reclaim(&self) -> usize {
        let mut inner = self.lock();
        let before = inner.entries.len();
        inner.entries.retain(|e| e.in_use || e.alive);
        before - inner.entries.len()
    }

    pub fn spawn_reclaimer(&self, shutdown: CancellationToken) -> JoinHandle<()> {
        let pool = self.clone();

        tokio::spawn(async move {
            let mut ticker = interval(RECLAIM_INTERVAL);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            ticker.tick().await;

            loop {
                tokio::select! {
                    _ = shutdown.cancelled() => break,
                    _ = ticker.tick() => {
                        let dropped = pool.reclaim();
                        if dropped > 0 {
                            debug!("reclaimed {dropped} dead forward connections");
                        }
                    }
                }
            }
        })
    }

    #[cfg(test)]
    pub(crate) fn alive_count(&self) -> usize {
        self.lock().entries.iter().filter(|e| e.alive).count()
    }
}

async fn shutdown(mut stream: TcpStream) {
    let _ = timeout(CLOSE_DEADLINE, stream.shutdown()).await;
}

/// A socket leased from a [`ForwardConnectionPool`].
///
/// Dropping a lease without handing it back (e.g. when the request future is
/// cancelled) closes the socket and marks its entry dead.
pub struct ForwardConnection {
    id: u64,
    stream: Option<TcpStream>,
    pool: Weak<Mutex<PoolInner>>,
    used: bool,
}

impl ForwardConnection {
    pub fn id(&self) -> u64 {
        self.id
    }

    fn stream_mut(&mut self) -> io::Result<&mut TcpStream> {
        self.stream
            .as_mut()
            .ok_or_else(|| io::Error::new(io::ErrorKind::NotConnected, "connection released"))
    }

    pub async fn write(&mut self, data: &[u8], deadline: Duration) -> Result<()> {
        self.used = true;
        let stream = self.stream_mut()?;

        match timeout(deadline, stream.write_all(data)).await {
            Ok(result) => Ok(result?),
            Err(_) => Err(io::Error::new(io::ErrorKind::TimedOut, "write deadline exceeded").into()),
        }
    }

    /// Reads until EOF or until `deadline` elapses. A deadline hit after some
    /// bytes arrived ends the response; with nothing read it is an error.
    pub async fn read(&mut self, deadline: Duration) -> Result<Vec<u8>> {
        let stream = self.stream_mut()?;
        let deadline = Instant::now() + deadline;

        let mut data = Vec::new();
        let mut buf = vec![0; READ_CHUNK];

        loop {
            match timeout_at(deadline, stream.read(&mut buf)).await {
                Ok(Ok(0)) => break,
                Ok(Ok(n)) => data.extend_from_slice(&buf[..n]),
                Ok(Err(e)) => return Err(e.into()),
                Err(_) if data.is_empty() => return Err(TunnelError::ResponseTimeout),
                Err(_) => break,
            }
        }

        Ok(data)
    }
}

impl Drop for ForwardConnection {
    fn drop(&mut self) {
        if self.stream.take().is_none() {
            return;
        }

        if let Some(pool) = self.pool.upgrade() {
            let mut inner = pool.lock().unwrap_or_else(PoisonError::into_inner);
            if let Some(entry) = inner.entry_mut(self.id) {
                entry.in_use = false;
                entry.alive = false;
            }
        }
    }
}
