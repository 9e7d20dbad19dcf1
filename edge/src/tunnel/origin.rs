use std::net::IpAddr;

/// Who created a tunnel and through which public scheme/host.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OriginMeta {
    scheme: String,
    host: String,
    ip: Option<IpAddr>,
}

impl OriginMeta {
    /// `host` may carry a port (`host.com:443`, `[::1]:80`); it is stripped.
    pub fn new(scheme: impl Into<String>, host: &str, ip: Option<IpAddr>) -> Self {
        Self {
            scheme: scheme.into(),
            host: strip_port(host).to_string(),
            ip: ip.map(|ip| ip.to_canonical()),
        }
    }

    pub fn scheme(&self) -> &str {
        &self.scheme
    }

    pub fn host(&self) -> &str {
        &self.host
    }

    pub fn ip(&self) -> Option<IpAddr> {
        self.ip
    }

    /// A tunnel with no recorded creator accepts any peer.
    pub fn allows(&self, peer: IpAddr) -> bool {
        match self.ip {
            Some(ip) => ip == peer.to_canonical(),
            None => true,
        }
    }
}

pub(crate) fn strip_port(host: &str) -> &str {
    if let Some(rest) = host.strip_prefix('[') {
        return rest.split_once(']').map_or(rest, |(addr, _)| addr);
    }

    match host.split_once(':') {
        Some((name, _)) => name,
        None => host,
    }
}
