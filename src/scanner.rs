use std::path::{Path, PathBuf};

use serde::Serialize;

use crate::clamav::{self, AvVerdict, ClamavTimeouts};
use crate::config::Config;
use crate::failover::{self, RetryPolicy, ScanOutcome};
use crate::spamd::{self, SpamdTimeouts};
use crate::upstream::UpstreamPool;
use crate::verdict::{self, ScanContext, ScanVerdict, SpamPool, VerdictSettings};

/// Everything the daemons are told about one spooled message.
#[derive(Debug, Clone, Default)]
pub struct ScanRequest {
    pub path: PathBuf,
    pub from: Option<String>,
    pub rcpts: Vec<String>,
    pub helo: Option<String>,
    pub ip: Option<String>,
    pub user: Option<String>,
    pub queue_id: String,
    /// Use the extra spam pool instead of the primary one.
    pub extra: bool,
}

/// Serializable summary of one failover sequence.
#[derive(Debug, Clone, Serialize)]
pub struct PoolReport<T> {
    pub server: Option<String>,
    pub elapsed_secs: f64,
    pub attempts: usize,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub verdict: Option<T>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl<T> PoolReport<T> {
    pub fn is_failure(&self) -> bool {
        self.error.is_some()
    }
}

impl<T> From<ScanOutcome<T>> for PoolReport<T> {
    fn from(outcome: ScanOutcome<T>) -> Self {
        let (verdict, error) = match outcome.result {
            Ok(v) => (Some(v), None),
            Err(e) => (None, Some(e.to_string())),
        };
        PoolReport {
            server: outcome.upstream,
            elapsed_secs: outcome.elapsed.as_secs_f64(),
            attempts: outcome.attempts,
            verdict,
            error,
        }
    }
}

/// Results for one message. Pools without servers are not consulted and
/// stay `None`, as do the spam pools once the antivirus pool found a virus.
#[derive(Debug, Clone, Default, Serialize)]
pub struct MessageReport {
    pub queue_id: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub antivirus: Option<PoolReport<AvVerdict>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub spam: Option<PoolReport<ScanVerdict>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub extra_spam: Option<PoolReport<ScanVerdict>>,
}

impl MessageReport {
    pub fn infected(&self) -> Option<&str> {
        match self.antivirus.as_ref()?.verdict.as_ref()? {
            AvVerdict::Infected(signature) => Some(signature.as_str()),
            AvVerdict::Clean => None,
        }
    }

    /// Whether any consulted pool failed to produce a verdict.
    pub fn has_failures(&self) -> bool {
        self.antivirus.as_ref().is_some_and(PoolReport::is_failure)
            || self.spam.as_ref().is_some_and(PoolReport::is_failure)
            || self.extra_spam.as_ref().is_some_and(PoolReport::is_failure)
    }

    /// Successful spam verdicts, primary pool first.
    pub fn spam_verdicts(&self) -> impl Iterator<Item = &ScanVerdict> {
        [&self.spam, &self.extra_spam]
            .into_iter()
            .filter_map(|r| r.as_ref()?.verdict.as_ref())
    }
}

/// Scans messages across the antivirus pool and both spam pools.
#[derive(Debug)]
pub struct Scanner {
    clamav: UpstreamPool,
    spamd: UpstreamPool,
    extra: UpstreamPool,
    clamav_timeouts: ClamavTimeouts,
    spamd_timeouts: SpamdTimeouts,
    retry: RetryPolicy,
    settings: VerdictSettings,
}

impl Scanner {
    pub fn new(config: &Config) -> anyhow::Result<Self> {
        Ok(Scanner {
            clamav: config.clamav_pool()?,
            spamd: config.spam_pool(false)?,
            extra: config.spam_pool(true)?,
            clamav_timeouts: config.clamav_timeouts(),
            spamd_timeouts: config.spamd_timeouts(),
            retry: config.retry_policy(),
            settings: config.verdict_settings(),
        })
    }

    pub fn antivirus(&self, path: &Path) -> ScanOutcome<AvVerdict> {
        let outcome = failover::run(&self.clamav, &self.retry, |upstream| {
            clamav::scan(upstream, path, &self.clamav_timeouts)
        });
        match &outcome.result {
            Ok(verdict) => log::info!(
                "clamdscan: {:.6}, {}, {}, {}",
                outcome.elapsed.as_secs_f64(),
                outcome.server(),
                match verdict {
                    AvVerdict::Clean => "clean",
                    AvVerdict::Infected(signature) => signature.as_str(),
                },
                path.display()
            ),
            Err(e) => log::error!("clamdscan: scan of {} failed: {e}", path.display()),
        }
        outcome
    }

    /// Scans with the primary or the extra spam pool, per `request.extra`.
    pub fn spam(&self, request: &ScanRequest) -> ScanOutcome<ScanVerdict> {
        let (pool, kind) = if request.extra {
            (&self.extra, SpamPool::Extra)
        } else {
            (&self.spamd, SpamPool::Primary)
        };
        let ScanOutcome {
            result,
            upstream,
            elapsed,
            attempts,
        } = failover::run(pool, &self.retry, |u| {
            spamd::scan(u, request, &self.spamd_timeouts)
        });

        let result = result.map(|reply| {
            let ctx = ScanContext {
                pool: kind,
                queue_id: &request.queue_id,
                server: upstream.as_deref().unwrap_or("none"),
                elapsed,
            };
            let verdict = verdict::aggregate(reply, &ctx, &self.settings);
            for line in &verdict.trace {
                log::info!("spamdscan: {line}");
            }
            log::info!(
                "spamdscan: {:.6}, {}, {}, {}",
                elapsed.as_secs_f64(),
                ctx.server,
                verdict.action,
                request.path.display()
            );
            verdict
        });
        if let Err(e) = &result {
            log::error!(
                "spamdscan: scan of {} failed: {e}",
                request.path.display()
            );
        }

        ScanOutcome {
            result,
            upstream,
            elapsed,
            attempts,
        }
    }

    /// Antivirus first, then the primary and extra spam pools.
    pub fn scan_message(&self, request: &ScanRequest) -> MessageReport {
        let mut report = MessageReport {
            queue_id: request.queue_id.clone(),
            ..Default::default()
        };

        if !self.clamav.is_empty() {
            report.antivirus = Some(self.antivirus(&request.path).into());
            if report.infected().is_some() {
                return report;
            }
        }

        if !self.spamd.is_empty() {
            let primary = ScanRequest {
                extra: false,
                ..request.clone()
            };
            report.spam = Some(self.spam(&primary).into());
        }
        if !self.extra.is_empty() {
            let extra = ScanRequest {
                extra: true,
                ..request.clone()
            };
            report.extra_spam = Some(self.spam(&extra).into());
        }
        report
    }
}
