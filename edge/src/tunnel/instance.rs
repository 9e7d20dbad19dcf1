use std::{
    net::{IpAddr, Ipv4Addr, SocketAddr},
    sync::{Arc, Mutex, MutexGuard, PoisonError},
    time::Duration,
};

use log::{debug, error, info, warn};
use tokio::{
    net::TcpListener,
    select,
    sync::oneshot,
    task::JoinHandle,
    time::{sleep, Instant},
};
use tokio_util::sync::CancellationToken;

use crate::config::TunnelConfig;

use super::{
    error::{Result, TunnelError},
    origin::OriginMeta,
    pool::{ForwardConnection, ForwardConnectionPool},
};

pub const INACTIVITY_CHECK_INTERVAL: Duration = Duration::from_secs(30 * 60);
const ACQUIRE_RETRIES: usize = 5;
const ACQUIRE_RETRY_DELAY: Duration = Duration::from_millis(200);
const ACCEPT_ERROR_BACKOFF: Duration = Duration::from_millis(100);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TunnelState {
    Listening,
    ClosePending,
    Closed,
}

/// Verdict of the accept loop for one inbound tunnel socket.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Admission {
    Accepted,
    OriginMismatch,
    PoolFull,
}

struct Lifecycle {
    state: TunnelState,
    subscribers: Vec<oneshot::Sender<()>>,
}

/// One public tunnel: a listener on its own port, the pool of sockets the
/// tunnel client dialled into it, and the tasks that police and expire it.
pub struct TunnelInstance {
    id: String,
    addr: SocketAddr,
    cfg: Arc<TunnelConfig>,
    origin: OriginMeta,
    pool: ForwardConnectionPool,
    last_active: Mutex<Instant>,
    close: CancellationToken,
    lifecycle: Mutex<Lifecycle>,
}

impl TunnelInstance {
    /// Binds the tunnel port and starts the accept loop, both watchdogs, the
    /// pool reclaimer and the close handler. A bind failure is returned to the
    /// caller and leaves nothing running.
    pub async fn start(
        id: String,
        port: u16,
        cfg: Arc<TunnelConfig>,
        origin: OriginMeta,
    ) -> Result<Arc<Self>> {
        let bind_addr = SocketAddr::new(IpAddr::V4(Ipv4Addr::UNSPECIFIED), port);
        let listener = TcpListener::bind(bind_addr)
            .await
            .map_err(|source| TunnelError::ListenerBind { port, source })?;
        let addr = listener.local_addr()?;

        let instance = Arc::new(Self {
            id,
            addr,
            cfg,
            origin,
            pool: ForwardConnectionPool::new(),
            last_active: Mutex::new(Instant::now()),
            close: CancellationToken::new(),
            lifecycle: Mutex::new(Lifecycle {
                state: TunnelState::Listening,
                subscribers: vec![],
            }),
        });

        info!(
            "tunnel {} listening on {} (max_conns={})",
            instance.id,
            instance.addr,
            instance.max_conns()
        );

        let accept = tokio::spawn(instance.clone().accept_loop(listener));
        let reclaimer = instance.pool.spawn_reclaimer(instance.close.clone());
        tokio::spawn(instance.clone().watch_inactivity());
        tokio::spawn(instance.clone().watch_idle_pool());
        tokio::spawn(instance.clone().handle_close(accept, reclaimer));

        Ok(instance)
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn port(&self) -> u16 {
        self.addr.port()
    }

    pub fn addr(&self) -> SocketAddr {
        self.addr
    }

    pub fn origin(&self) -> &OriginMeta {
        &self.origin
    }

    pub fn max_conns(&self) -> usize {
        self.cfg.max_conns_per_client
    }

    pub fn connections(&self) -> usize {
        self.pool.size()
    }

    pub fn state(&self) -> TunnelState {
        self.lifecycle().state
    }

    /// Public URL: `scheme://<id>.<domain>`, with `base_domain` taking
    /// precedence over the host the tunnel was created through.
    pub fn url(&self) -> String {
        let domain = if self.cfg.base_domain.is_empty() {
            self.origin.host()
        } else {
            self.cfg.base_domain.as_str()
        };

        format!("{}://{}.{}", self.origin.scheme(), self.id, domain)
    }

    /// Relays one raw request to a pooled socket and returns the raw response.
    /// The socket is closed afterwards whatever the outcome.
    pub async fn proxy(&self, request: &[u8]) -> Result<Vec<u8>> {
        self.touch();

        let mut conn = self.acquire().await?;
        let id = conn.id();
        let deadline = self.cfg.proxy_io_timeout();

        let result = match conn.write(request, deadline).await {
            Ok(()) => conn.read(deadline).await,
            Err(e) => Err(e),
        };

        self.pool.release(conn);
        self.pool.close_entry(id).await;

        result
    }

    /// Signals the close handler. Repeated or concurrent calls coalesce.
    pub fn request_close(&self) {
        {
            let mut lifecycle = self.lifecycle();
            if lifecycle.state == TunnelState::Listening {
                lifecycle.state = TunnelState::ClosePending;
            }
        }

        self.close.cancel();
    }

    /// Resolves once the tunnel reaches `Closed`, immediately if it already has.
    pub fn subscribe_on_close(&self) -> oneshot::Receiver<()> {
        let (tx, rx) = oneshot::channel();

        let mut lifecycle = self.lifecycle();
        if lifecycle.state == TunnelState::Closed {
            let _ = tx.send(());
        } else {
            lifecycle.subscribers.push(tx);
        }

        rx
    }

    fn lifecycle(&self) -> MutexGuard<'_, Lifecycle> {
        self.lifecycle.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn touch(&self) {
        let now = Instant::now();
        let mut last_active = self
            .last_active
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        if now > *last_active {
            *last_active = now;
        }
    }

    fn idle_for(&self) -> Duration {
        self.last_active
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .elapsed()
    }

    async fn acquire(&self) -> Result<ForwardConnection> {
        let mut attempt = 0;

        loop {
            if let Some(conn) = self.pool.acquire() {
                return Ok(conn);
            }

            if attempt >= ACQUIRE_RETRIES || self.close.is_cancelled() {
                return Err(TunnelError::NoAvailableConnection);
            }

            sleep(ACQUIRE_RETRY_DELAY).await;
            attempt += 1;
        }
    }

    fn admit(&self, peer: IpAddr) -> Admission {
        if !self.origin.allows(peer) {
            Admission::OriginMismatch
        } else if self.pool.size() >= self.max_conns() {
            Admission::PoolFull
        } else {
            Admission::Accepted
        }
    }

    async fn accept_loop(self: Arc<Self>, listener: TcpListener) {
        loop {
            let (socket, peer) = select! {
                _ = self.close.cancelled() => break,

                accepted = listener.accept() => match accepted {
                    Ok(accepted) => accepted,
                    Err(e) => {
                        error!("tunnel {}: failed to accept connection: {e}", self.id);
                        sleep(ACCEPT_ERROR_BACKOFF).await;
                        continue;
                    }
                },
            };

            self.touch();

            match self.admit(peer.ip()) {
                Admission::Accepted => {
                    if self.pool.append(socket).is_some() {
                        debug!("tunnel {}: new connection from {peer}", self.id);
                    }
                }
                Admission::OriginMismatch => {
                    warn!(
                        "tunnel {}: closing connection from {peer}, ip does not match origin",
                        self.id
                    );
                    drop(socket);
                }
                Admission::PoolFull => {
                    debug!(
                        "tunnel {}: closing connection from {peer}, {} connections already open",
                        self.id,
                        self.max_conns()
                    );
                    drop(socket);
                }
            }
        }

        debug!("tunnel {}: listener on {} closed", self.id, self.addr);
    }

    async fn watch_inactivity(self: Arc<Self>) {
        let timeout = self.cfg.inactive_timeout();

        loop {
            select! {
                _ = self.close.cancelled() => return,
                _ = sleep(INACTIVITY_CHECK_INTERVAL) => {}
            }

            if self.idle_for() > timeout {
                info!("tunnel {}: no traffic for {timeout:?}, closing", self.id);
                self.request_close();
                return;
            }
        }
    }

    async fn watch_idle_pool(self: Arc<Self>) {
        let mut counter = IdleCounter::new(
            self.cfg.no_active_sockets_checks,
            self.cfg.reset_idle_checks_on_activity,
        );
        let period = self.cfg.idle_check_interval();

        loop {
            select! {
                _ = self.close.cancelled() => return,
                _ = sleep(period) => {}
            }

            if counter.observe(self.pool.size()) {
                info!(
                    "tunnel {}: no client connections for {} checks, closing",
                    self.id, counter.threshold
                );
                self.request_close();
                return;
            }
        }
    }

    async fn handle_close(self: Arc<Self>, accept: JoinHandle<()>, reclaimer: JoinHandle<()>) {
        self.close.cancelled().await;

        if let Err(e) = accept.await {
            error!("tunnel {}: accept loop ended abnormally: {e}", self.id);
        }
        let _ = reclaimer.await;

        self.pool.close_all().await;

        let subscribers = {
            let mut lifecycle = self.lifecycle();
            lifecycle.state = TunnelState::Closed;
            std::mem::take(&mut lifecycle.subscribers)
        };

        for subscriber in subscribers {
            let _ = subscriber.send(());
        }

        info!("tunnel {} on port {} closed", self.id, self.port());
    }
}

/// Counts empty-pool observations until `threshold` is reached.
///
/// Without `reset_on_activity` the count is sticky: a non-empty observation
/// does not undo earlier empty ones.
#[derive(Debug)]
struct IdleCounter {
    threshold: u32,
    reset_on_activity: bool,
    count: u32,
}

impl IdleCounter {
    fn new(threshold: u32, reset_on_activity: bool) -> Self {
        Self {
            threshold,
            reset_on_activity,
            count: 0,
        }
    }

    /// Returns true once the tunnel should be closed.
    fn observe(&mut self, pool_size: usize) -> bool {
        if pool_size == 0 {
            self.count += 1;
        } else if self.reset_on_activity {
            self.count = 0;
        }

        self.count >= self.threshold
    }
}

#[cfg(test)]
mod tests {
    use tokio::{
        io::{AsyncReadExt, AsyncWriteExt},
        net::TcpStream,
    };

    use super::*;

    fn config() -> TunnelConfig {
        TunnelConfig {
            base_domain: "example.com".to_string(),
            ..Default::default()
        }
    }

    fn local_origin() -> OriginMeta {
        OriginMeta::new("http", "localhost:3000", Some(IpAddr::V4(Ipv4Addr::LOCALHOST)))
    }

    async fn start(id: &str, cfg: TunnelConfig, origin: OriginMeta) -> Arc<TunnelInstance> {
        TunnelInstance::start(id.to_string(), 0, Arc::new(cfg), origin)
            .await
            .unwrap()
    }

    async fn dial(instance: &TunnelInstance) -> TcpStream {
        TcpStream::connect(("127.0.0.1", instance.port())).await.unwrap()
    }

    async fn wait_for_connections(instance: &TunnelInstance, n: usize) {
        for _ in 0..100 {
            if instance.connections() == n {
                return;
            }
            sleep(Duration::from_millis(10)).await;
        }
        panic!("expected {n} connections, got {}", instance.connections());
    }

    /// Reads until the peer closes; a reset also counts as closed.
    async fn assert_closed_by_peer(stream: &mut TcpStream) {
        let mut buf = [0; 16];
        let read = tokio::time::timeout(Duration::from_secs(2), stream.read(&mut buf))
            .await
            .expect("connection was not closed");
        assert!(matches!(read, Ok(0) | Err(_)));
    }

    fn spawn_echo(mut stream: TcpStream) -> JoinHandle<()> {
        tokio::spawn(async move {
            let mut buf = vec![0; 1024];
            while let Ok(n) = stream.read(&mut buf).await {
                if n == 0 || stream.write_all(&buf[..n]).await.is_err() {
                    break;
                }
            }
        })
    }

    #[test]
    fn sticky_idle_counter_ignores_activity() {
        let mut counter = IdleCounter::new(3, false);
        assert!(!counter.observe(0));
        assert!(!counter.observe(2));
        assert!(!counter.observe(0));
        assert!(counter.observe(0));
    }

    #[test]
    fn resetting_idle_counter_restarts_on_activity() {
        let mut counter = IdleCounter::new(3, true);
        assert!(!counter.observe(0));
        assert!(!counter.observe(0));
        assert!(!counter.observe(1));
        assert!(!counter.observe(0));
        assert!(!counter.observe(0));
        assert!(counter.observe(0));
    }

    #[tokio::test]
    async fn url_prefers_base_domain() {
        let tunnel = start("demo", config(), local_origin()).await;
        assert_eq!(tunnel.url(), "http://demo.example.com");

        let tunnel = start("demo2", TunnelConfig::default(), local_origin()).await;
        assert_eq!(tunnel.url(), "http://demo2.localhost");
    }

    #[tokio::test]
    async fn bind_failure_is_returned() {
        let taken = TcpListener::bind("0.0.0.0:0").await.unwrap();
        let port = taken.local_addr().unwrap().port();

        let err = TunnelInstance::start("busy".to_string(), port, Arc::new(config()), local_origin())
            .await
            .err()
            .unwrap();
        assert!(matches!(err, TunnelError::ListenerBind { port: p, .. } if p == port));
    }

    #[tokio::test]
    async fn rejects_connections_from_other_ips() {
        let origin = OriginMeta::new("http", "example.com", Some("203.0.113.9".parse().unwrap()));
        let tunnel = start("foreign", config(), origin).await;

        let mut stream = dial(&tunnel).await;
        assert_closed_by_peer(&mut stream).await;
        assert_eq!(tunnel.connections(), 0);
    }

    #[tokio::test]
    async fn enforces_max_conns_per_client() {
        let cfg = TunnelConfig {
            max_conns_per_client: 1,
            ..config()
        };
        let tunnel = start("capped", cfg, local_origin()).await;

        let _first = dial(&tunnel).await;
        wait_for_connections(&tunnel, 1).await;

        let mut second = dial(&tunnel).await;
        assert_closed_by_peer(&mut second).await;
        assert_eq!(tunnel.connections(), 1);
    }

    #[tokio::test]
    async fn proxies_through_echo_sockets() {
        let tunnel = start("echo", config(), local_origin()).await;

        let first = spawn_echo(dial(&tunnel).await);
        let second = spawn_echo(dial(&tunnel).await);
        wait_for_connections(&tunnel, 2).await;

        let request = b"GET / HTTP/1.1\r\nHost: echo.example.com\r\n\r\n";
        let a = tunnel.proxy(request).await.unwrap();
        let b = tunnel.proxy(request).await.unwrap();

        assert_eq!(a, request);
        assert_eq!(a, b);

        // Each socket serves one request and is closed afterwards.
        first.await.unwrap();
        second.await.unwrap();
        assert!(tunnel.pool.acquire().is_none());
    }

    #[tokio::test]
    async fn proxy_fails_without_connections() {
        let tunnel = start("empty", config(), local_origin()).await;
        tokio::time::pause();

        let started = Instant::now();
        let err = tunnel.proxy(b"GET / HTTP/1.1\r\n\r\n").await.unwrap_err();

        assert!(matches!(err, TunnelError::NoAvailableConnection));
        assert!(started.elapsed() >= ACQUIRE_RETRY_DELAY * ACQUIRE_RETRIES as u32);
    }

    #[tokio::test]
    async fn concurrent_close_requests_notify_once() {
        let tunnel = start("closing", config(), local_origin()).await;
        let port = tunnel.port();
        let _client = dial(&tunnel).await;
        wait_for_connections(&tunnel, 1).await;

        let subscribers: Vec<_> = (0..3).map(|_| tunnel.subscribe_on_close()).collect();

        let requests: Vec<_> = (0..8)
            .map(|_| {
                let tunnel = tunnel.clone();
                tokio::spawn(async move { tunnel.request_close() })
            })
            .collect();
        for request in requests {
            request.await.unwrap();
        }

        for subscriber in subscribers {
            subscriber.await.unwrap();
        }
        assert_eq!(tunnel.state(), TunnelState::Closed);
        assert_eq!(tunnel.pool.alive_count(), 0);

        tunnel.request_close();
        tunnel.subscribe_on_close().await.unwrap();

        // The port is released before subscribers hear about it.
        TcpListener::bind(("0.0.0.0", port)).await.unwrap();
    }

    #[tokio::test]
    async fn idle_pool_watchdog_closes_tunnel() {
        let cfg = TunnelConfig {
            no_active_sockets_minutes_timeout: 1,
            no_active_sockets_checks: 3,
            ..config()
        };
        let started = Instant::now();
        let tunnel = start("idle", cfg, local_origin()).await;
        let closed = tunnel.subscribe_on_close();

        tokio::time::pause();
        closed.await.unwrap();

        assert_eq!(tunnel.state(), TunnelState::Closed);
        assert!(started.elapsed() >= Duration::from_secs(3 * 60));
    }

    #[tokio::test]
    async fn inactivity_watchdog_closes_tunnel() {
        let cfg = TunnelConfig {
            inactive_hours_timeout: 1,
            no_active_sockets_checks: u32::MAX,
            ..config()
        };
        let started = Instant::now();
        let tunnel = start("inactive", cfg, local_origin()).await;
        let closed = tunnel.subscribe_on_close();

        tokio::time::pause();
        closed.await.unwrap();

        // closed at the first check past one idle hour, one check late at most
        let elapsed = started.elapsed();
        assert!(elapsed > Duration::from_secs(60 * 60));
        assert!(elapsed <= Duration::from_secs(91 * 60));
    }
}
