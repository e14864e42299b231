//! Connection admission: ban list and per-IP limits.

use crate::config::SecurityConfig;
use dashmap::{DashMap, DashSet};
use serde::{Deserialize, Serialize};
use std::net::IpAddr;
use std::sync::atomic::{AtomicU64, Ordering};

/// Decides whether a new socket may become a connection.
#[derive(Debug)]
pub struct AdmissionControl {
    banned: DashSet<IpAddr>,
    per_ip: DashMap<IpAddr, u32>,
    max_per_ip: u32,
    refused: AtomicU64,
}

impl AdmissionControl {
    pub fn new(config: &SecurityConfig) -> Self {
        let banned = DashSet::new();
        for ip in &config.banned_ips {
            banned.insert(*ip);
        }
        Self {
            banned,
            per_ip: DashMap::new(),
            max_per_ip: config.max_connections_per_ip,
            refused: AtomicU64::new(0),
        }
    }

    /// Admits one connection from `ip`, counting it against the per-IP limit.
    pub fn admit(&self, ip: IpAddr) -> Result<(), SecurityError> {
        if self.banned.contains(&ip) {
            self.refused.fetch_add(1, Ordering::Relaxed);
            return Err(SecurityError::BannedIp(ip));
        }

        let mut count = self.per_ip.entry(ip).or_insert(0);
        if self.max_per_ip > 0 && *count >= self.max_per_ip {
            self.refused.fetch_add(1, Ordering::Relaxed);
            return Err(SecurityError::TooManyConnections(ip));
        }
        *count += 1;
        Ok(())
    }

    /// Releases a slot taken by [`admit`](Self::admit).
    pub fn release(&self, ip: IpAddr) {
        self.per_ip.remove_if_mut(&ip, |_, count| {
            *count = count.saturating_sub(1);
            *count == 0
        });
    }

    pub fn ban(&self, ip: IpAddr) -> bool {
        self.banned.insert(ip)
    }

    pub fn unban(&self, ip: IpAddr) -> bool {
        self.banned.remove(&ip).is_some()
    }

    pub fn is_banned(&self, ip: IpAddr) -> bool {
        self.banned.contains(&ip)
    }

    pub fn stats(&self) -> SecurityStats {
        SecurityStats {
            tracked_ips: self.per_ip.len(),
            refused_connections: self.refused.load(Ordering::Relaxed),
            banned_ips: self.banned.len(),
        }
    }
}

/// Security-related statistics
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SecurityStats {
    pub tracked_ips: usize,
    pub refused_connections: u64,
    pub banned_ips: usize,
}

/// Security-related errors
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum SecurityError {
    #[error("IP address {0} is banned")]
    BannedIp(IpAddr),

    #[error("Too many connections from IP {0}")]
    TooManyConnections(IpAddr),

    #[error("Server is full ({0} connections)")]
    ServerFull(usize),
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ip(last: u8) -> IpAddr {
        IpAddr::from([10, 0, 0, last])
    }

    #[test]
    fn test_banned_ip_is_refused() {
        let control = AdmissionControl::new(&SecurityConfig {
            banned_ips: vec![ip(1)],
            max_connections_per_ip: 10,
        });
        assert_eq!(control.admit(ip(1)), Err(SecurityError::BannedIp(ip(1))));
        assert!(control.admit(ip(2)).is_ok());

        control.ban(ip(2));
        assert!(control.admit(ip(2)).is_err());
        control.unban(ip(2));
        assert!(control.admit(ip(2)).is_ok());
        assert_eq!(control.stats().refused_connections, 2);
    }

    #[test]
    fn test_per_ip_limit_and_release() {
        let control = AdmissionControl::new(&SecurityConfig {
            banned_ips: Vec::new(),
            max_connections_per_ip: 2,
        });
        assert!(control.admit(ip(3)).is_ok());
        assert!(control.admit(ip(3)).is_ok());
        assert_eq!(control.admit(ip(3)), Err(SecurityError::TooManyConnections(ip(3))));

        control.release(ip(3));
        assert!(control.admit(ip(3)).is_ok());

        control.release(ip(3));
        control.release(ip(3));
        assert_eq!(control.stats().tracked_ips, 0);
    }
}
