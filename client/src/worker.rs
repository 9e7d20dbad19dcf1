use std::{
    sync::{
        atomic::{AtomicBool, AtomicUsize, Ordering},
        Arc,
    },
    time::Duration,
};

use anyhow::Result;
use log::{debug, error, info};
use tokio::{
    io::{copy_bidirectional, AsyncReadExt, AsyncWriteExt},
    net::TcpStream,
    sync::oneshot::Receiver,
    time::sleep,
};

const READ_BUFFER: usize = 16 * 1024;
const RECONNECT_BACKOFF: Duration = Duration::from_secs(1);

#[derive(Debug, PartialEq, Eq)]
enum Outcome {
    Proxied,
    ClosedIdle,
}

/// Keeps `count` sockets parked on the tunnel port, each relaying one
/// request to `target` before being redialled.
pub fn start_workers(edge_ip: &str, port: u16, target: &str, count: usize, close: Receiver<()>) {
    let closed = Arc::new(AtomicBool::new(false));

    {
        let closed = closed.clone();
        tokio::spawn(async move {
            let _ = close.await;
            closed.store(true, Ordering::Relaxed);
        });
    }

    let worker_id = Arc::new(AtomicUsize::new(0));

    for _ in 0..count {
        let ip = edge_ip.to_string();
        let target = target.to_string();

        let closed = closed.clone();
        let worker_id = worker_id.clone();
        tokio::spawn(async move {
            loop {
                if closed.load(Ordering::Relaxed) {
                    break;
                }

                let id = worker_id.fetch_add(1, Ordering::Relaxed);

                debug!("starting worker #{id}...");
                match run_worker(id, &ip, port, &target).await {
                    Ok(Outcome::Proxied) => {}
                    Ok(Outcome::ClosedIdle) => sleep(RECONNECT_BACKOFF).await,
                    Err(e) => {
                        if !closed.load(Ordering::Relaxed) {
                            error!("worker #{id} failed: {e}");
                        }
                        sleep(RECONNECT_BACKOFF).await;
                    }
                }
            }
        });
    }
}

async fn run_worker(id: usize, ip: &str, port: u16, target: &str) -> Result<Outcome> {
    let mut stream = TcpStream::connect((ip, port)).await?;

    // Park until the edge forwards a request
    let mut buf = vec![0; READ_BUFFER];
    let n = stream.read(&mut buf).await?;
    if n == 0 {
        return Ok(Outcome::ClosedIdle);
    }

    info!("worker #{id} is being used to proxy to {target}");

    let mut server = TcpStream::connect(target).await?;
    server.write_all(&buf[..n]).await?;

    copy_bidirectional(&mut stream, &mut server).await?;

    Ok(Outcome::Proxied)
}

#[cfg(test)]
mod tests {
    use tokio::net::TcpListener;

    use super::*;

    #[tokio::test]
    async fn relays_first_request_to_target() {
        let edge = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let edge_port = edge.local_addr().unwrap().port();
        let service = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let target = service.local_addr().unwrap().to_string();

        tokio::spawn(async move {
            let (mut conn, _) = service.accept().await.unwrap();
            let mut buf = [0; 4];
            conn.read_exact(&mut buf).await.unwrap();
            assert_eq!(&buf, b"ping");
            conn.write_all(b"pong").await.unwrap();
        });

        let worker = tokio::spawn(async move { run_worker(0, "127.0.0.1", edge_port, &target).await });

        let (mut parked, _) = edge.accept().await.unwrap();
        parked.write_all(b"ping").await.unwrap();

        let mut response = Vec::new();
        parked.read_to_end(&mut response).await.unwrap();
        assert_eq!(response, b"pong");

        drop(parked);
        assert_eq!(worker.await.unwrap().unwrap(), Outcome::Proxied);
    }

    #[tokio::test]
    async fn edge_closing_an_idle_socket_is_reported() {
        let edge = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let edge_port = edge.local_addr().unwrap().port();

        let worker =
            tokio::spawn(async move { run_worker(0, "127.0.0.1", edge_port, "127.0.0.1:1").await });

        let (parked, _) = edge.accept().await.unwrap();
        drop(parked);

        assert_eq!(worker.await.unwrap().unwrap(), Outcome::ClosedIdle);
    }
}
