use std::collections::VecDeque;
use std::fmt;
use std::net::{SocketAddr, ToSocketAddrs};
use std::path::PathBuf;
use std::sync::{Mutex, MutexGuard};
use std::time::{Duration, Instant};

use anyhow::{anyhow, Context};
use rand::seq::SliceRandom;
use serde::{Deserialize, Serialize};

use crate::net::SocketAddress;

/// Wire protocol spoken by an upstream.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ProtocolKind {
    /// clamd, `SCAN`/`STREAM`
    Clamd,
    /// legacy single-metric `SPAMC/1.2`
    Spamc,
    /// multi-metric `RSPAMC/1.2`
    Rspamc,
}

impl fmt::Display for ProtocolKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ProtocolKind::Clamd => "clamd",
            ProtocolKind::Spamc => "spamc",
            ProtocolKind::Rspamc => "rspamc",
        };
        f.write_str(name)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct HealthConfig {
    /// Failures older than this many seconds no longer count.
    pub error_time: u64,
    /// Seconds an upstream stays dead after its first trip.
    pub dead_time: u64,
    /// Upper bound in seconds for repeated trips.
    pub max_dead_time: u64,
    /// Failures tolerated within `error_time` before the upstream trips.
    pub max_errors: usize,
}

impl Default for HealthConfig {
    fn default() -> Self {
        HealthConfig {
            error_time: 10,
            dead_time: 60,
            max_dead_time: 1200,
            max_errors: 5,
        }
    }
}

#[derive(Debug, Clone)]
pub struct Upstream {
    pub name: String,
    pub address: SocketAddress,
    pub protocol: ProtocolKind,
    index: usize,
}

#[derive(Debug, Default, Clone)]
struct Health {
    failures: VecDeque<Instant>,
    dead_until: Option<Instant>,
    trips: u32,
}

impl Health {
    fn is_dead(&self, now: Instant) -> bool {
        matches!(self.dead_until, Some(until) if now < until)
    }
}

/// A set of interchangeable daemons. Dead marking is advisory and time
/// bounded. Health state for the whole pool sits behind one lock.
#[derive(Debug)]
pub struct UpstreamPool {
    upstreams: Vec<Upstream>,
    health: Mutex<Vec<Health>>,
    config: HealthConfig,
}

impl UpstreamPool {
    pub fn new(
        members: impl IntoIterator<Item = (String, SocketAddress, ProtocolKind)>,
        config: HealthConfig,
    ) -> Self {
        let upstreams: Vec<Upstream> = members
            .into_iter()
            .enumerate()
            .map(|(index, (name, address, protocol))| Upstream {
                name,
                address,
                protocol,
                index,
            })
            .collect();
        let health = Mutex::new(vec![Health::default(); upstreams.len()]);
        UpstreamPool {
            upstreams,
            health,
            config,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.upstreams.is_empty()
    }

    pub fn len(&self) -> usize {
        self.upstreams.len()
    }

    pub fn upstreams(&self) -> &[Upstream] {
        &self.upstreams
    }

    /// Picks a random upstream, preferring those not currently dead. When
    /// every upstream is dead any of them may be returned.
    pub fn select(&self, now: Instant) -> Option<&Upstream> {
        if self.upstreams.is_empty() {
            return None;
        }

        let alive: Vec<&Upstream> = {
            let health = self.lock();
            self.upstreams
                .iter()
                .filter(|u| !health[u.index].is_dead(now))
                .collect()
        };

        let mut rng = rand::thread_rng();
        if alive.is_empty() {
            log::debug!("all upstreams are marked dead, selecting among all of them");
            self.upstreams.choose(&mut rng)
        } else {
            alive.choose(&mut rng).copied()
        }
    }

    pub fn record_success(&self, upstream: &Upstream, _now: Instant) {
        let mut health = self.lock();
        let h = &mut health[upstream.index];
        h.failures.clear();
        h.trips = 0;
    }

    pub fn record_failure(&self, upstream: &Upstream, now: Instant) {
        let horizon = Duration::from_secs(self.config.error_time);
        let mut health = self.lock();
        let h = &mut health[upstream.index];

        h.failures.push_back(now);
        while let Some(&oldest) = h.failures.front() {
            if now.saturating_duration_since(oldest) > horizon {
                h.failures.pop_front();
            } else {
                break;
            }
        }

        if h.failures.len() > self.config.max_errors {
            h.trips = h.trips.saturating_add(1);
            let dead_for = Duration::from_secs(
                self.config
                    .dead_time
                    .saturating_mul(u64::from(h.trips))
                    .min(self.config.max_dead_time),
            );
            log::warn!(
                "marking upstream {} as dead for {}s after {} errors within {}s",
                upstream.name,
                dead_for.as_secs(),
                h.failures.len(),
                self.config.error_time
            );
            h.dead_until = Some(now + dead_for);
            h.failures.clear();
        }
    }

    pub fn is_dead(&self, upstream: &Upstream, now: Instant) -> bool {
        self.lock()[upstream.index].is_dead(now)
    }

    pub fn dead_until(&self, upstream: &Upstream) -> Option<Instant> {
        self.lock()[upstream.index].dead_until
    }

    fn lock(&self) -> MutexGuard<'_, Vec<Health>> {
        self.health.lock().unwrap_or_else(|e| e.into_inner())
    }
}

/// Parses a configured address: an absolute path is a Unix socket, anything
/// else is `host:port` resolved to its first IPv4 address.
pub fn parse_address(value: &str) -> anyhow::Result<SocketAddress> {
    let value = value.trim();
    if value.starts_with('/') {
        return Ok(SocketAddress::Unix(PathBuf::from(value)));
    }

    let addrs = value
        .to_socket_addrs()
        .with_context(|| format!("cannot resolve upstream address '{value}'"))?;
    addrs
        .into_iter()
        .find_map(|a| match a {
            SocketAddr::V4(v4) => Some(SocketAddress::Inet(v4)),
            SocketAddr::V6(_) => None,
        })
        .ok_or_else(|| anyhow!("upstream address '{value}' has no IPv4 address"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::{Ipv4Addr, SocketAddrV4};
    use std::sync::Arc;

    fn pool(n: usize, config: HealthConfig) -> UpstreamPool {
        UpstreamPool::new(
            (0..n).map(|i| {
                (
                    format!("spamd{i}"),
                    SocketAddress::Inet(SocketAddrV4::new(Ipv4Addr::LOCALHOST, 11333 + i as u16)),
                    ProtocolKind::Rspamc,
                )
            }),
            config,
        )
    }

    fn config() -> HealthConfig {
        HealthConfig {
            error_time: 10,
            dead_time: 60,
            max_dead_time: 150,
            max_errors: 2,
        }
    }

    #[test]
    fn test_empty_pool_selects_nothing() {
        let pool = pool(0, config());
        assert!(pool.is_empty());
        assert!(pool.select(Instant::now()).is_none());
    }

    #[test]
    fn test_trip_marks_dead_but_still_selectable() {
        let pool = pool(1, config());
        let now = Instant::now();
        let up = pool.select(now).unwrap().clone();

        pool.record_failure(&up, now);
        pool.record_failure(&up, now);
        assert!(!pool.is_dead(&up, now));

        pool.record_failure(&up, now);
        assert!(pool.is_dead(&up, now));
        assert_eq!(pool.dead_until(&up), Some(now + Duration::from_secs(60)));

        // Dead is advisory: the only upstream is still handed out.
        assert_eq!(pool.select(now).unwrap().name, up.name);

        // Eligible again once the dead period has passed.
        assert!(!pool.is_dead(&up, now + Duration::from_secs(61)));
    }

    #[test]
    fn test_repeated_trips_are_capped() {
        let pool = pool(1, config());
        let up = pool.upstreams()[0].clone();
        let start = Instant::now();

        let mut expected = Vec::new();
        for round in 0..3u64 {
            let now = start + Duration::from_secs(round * 1000);
            for _ in 0..3 {
                pool.record_failure(&up, now);
            }
            expected.push(pool.dead_until(&up).unwrap() - now);
        }
        assert_eq!(
            expected,
            vec![
                Duration::from_secs(60),
                Duration::from_secs(120),
                Duration::from_secs(150)
            ]
        );

        // Success resets the escalation.
        let now = start + Duration::from_secs(5000);
        pool.record_success(&up, now);
        for _ in 0..3 {
            pool.record_failure(&up, now);
        }
        assert_eq!(pool.dead_until(&up), Some(now + Duration::from_secs(60)));
    }

    #[test]
    fn test_old_failures_leave_the_window() {
        let pool = pool(1, config());
        let up = pool.upstreams()[0].clone();
        let start = Instant::now();

        pool.record_failure(&up, start);
        pool.record_failure(&up, start + Duration::from_secs(5));
        // The first failure is now older than the 10 second horizon.
        pool.record_failure(&up, start + Duration::from_secs(12));
        assert!(!pool.is_dead(&up, start + Duration::from_secs(12)));
    }

    #[test]
    fn test_success_clears_window() {
        let pool = pool(1, config());
        let up = pool.upstreams()[0].clone();
        let now = Instant::now();

        pool.record_failure(&up, now);
        pool.record_failure(&up, now);
        pool.record_success(&up, now);
        pool.record_failure(&up, now);
        assert!(!pool.is_dead(&up, now));
    }

    #[test]
    fn test_selection_prefers_alive_upstreams() {
        let pool = pool(2, config());
        let now = Instant::now();
        let dead = pool.upstreams()[0].clone();
        for _ in 0..3 {
            pool.record_failure(&dead, now);
        }

        for _ in 0..50 {
            assert_eq!(pool.select(now).unwrap().name, "spamd1");
        }
    }

    #[test]
    fn test_concurrent_failures() {
        let pool = Arc::new(pool(1, HealthConfig {
            max_errors: 800,
            ..config()
        }));
        let now = Instant::now();

        let handles: Vec<_> = (0..8)
            .map(|_| {
                let pool = pool.clone();
                std::thread::spawn(move || {
                    let up = pool.upstreams()[0].clone();
                    for _ in 0..100 {
                        pool.record_failure(&up, now);
                    }
                })
            })
            .collect();
        for h in handles {
            h.join().unwrap();
        }
        let up = pool.upstreams()[0].clone();
        assert!(!pool.is_dead(&up, now));
        pool.record_failure(&up, now);
        assert!(pool.is_dead(&up, now));
    }

    #[test]
    fn test_parse_address() {
        assert_eq!(
            parse_address("/var/run/clamav/clamd.sock").unwrap(),
            SocketAddress::Unix(PathBuf::from("/var/run/clamav/clamd.sock"))
        );
        assert_eq!(
            parse_address("127.0.0.1:3310").unwrap(),
            SocketAddress::Inet(SocketAddrV4::new(Ipv4Addr::LOCALHOST, 3310))
        );
        assert!(parse_address("127.0.0.1").is_err());
    }
}
