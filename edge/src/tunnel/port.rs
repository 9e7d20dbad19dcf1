use std::{collections::HashMap, time::Duration};

use log::debug;
use rand::Rng;
use tokio::{net::TcpStream, time::timeout};

use super::error::{Result, TunnelError};

const PROBE_TIMEOUT: Duration = Duration::from_secs(1);

/// Random sampling gives up after this many candidates per port in range.
const ATTEMPTS_PER_PORT: usize = 8;

/// Picks a random port in `[min, max)` that is neither claimed by an active
/// tunnel nor accepting connections on localhost.
///
/// Callers hold the registry lock across this call and the subsequent bind so
/// no other tunnel can claim the same port in between.
pub async fn allocate<R, V>(
    min: u16,
    max: u16,
    claimed: &HashMap<u16, V>,
    rng: &mut R,
) -> Result<u16>
where
    R: Rng + ?Sized,
{
    let range = usize::from(max.saturating_sub(min));
    if range == 0 || claimed.len() >= range {
        return Err(TunnelError::PortAllocationFailed { min, max });
    }

    for _ in 0..range * ATTEMPTS_PER_PORT {
        let port = rng.gen_range(min..max);

        if claimed.contains_key(&port) {
            continue;
        }

        if is_port_taken(port).await {
            debug!("port {port} is bound by another process, resampling");
            continue;
        }

        return Ok(port);
    }

    Err(TunnelError::PortAllocationFailed { min, max })
}

pub async fn is_port_taken(port: u16) -> bool {
    matches!(
        timeout(PROBE_TIMEOUT, TcpStream::connect(("localhost", port))).await,
        Ok(Ok(_))
    )
}
