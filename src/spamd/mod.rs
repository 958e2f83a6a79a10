pub mod cursor;
pub mod rspamc;
pub mod spamc;

use std::fmt;
use std::fs::File;
use std::io::{self, Write};
use std::net::Shutdown;
use std::path::Path;
use std::time::Duration;

use serde::Serialize;

use crate::error::{ScanError, ScanResult};
use crate::net;
use crate::scanner::ScanRequest;
use crate::upstream::{ProtocolKind, Upstream};

/// Action requested by a metric. Variants are declared in the order used to
/// pick the dominant action, so the derived `Ord` is that ordering.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum MetricAction {
    #[default]
    NoAction,
    Greylist,
    AddHeader,
    RewriteSubject,
    Reject,
}

impl MetricAction {
    /// Maps an `Action:` value; unknown values mean no action.
    pub fn from_reply(value: &[u8]) -> Self {
        if value.starts_with(b"reject") {
            MetricAction::Reject
        } else if value.starts_with(b"greylist") {
            MetricAction::Greylist
        } else if value.starts_with(b"add header") {
            MetricAction::AddHeader
        } else if value.starts_with(b"rewrite subject") {
            MetricAction::RewriteSubject
        } else {
            MetricAction::NoAction
        }
    }
}

impl fmt::Display for MetricAction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            MetricAction::NoAction => "no action",
            MetricAction::Greylist => "greylist",
            MetricAction::AddHeader => "add header",
            MetricAction::RewriteSubject => "rewrite subject",
            MetricAction::Reject => "reject",
        };
        f.write_str(name)
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct MetricResult {
    /// `None` for the implicit default metric.
    pub name: Option<String>,
    pub verdict: String,
    pub score: f64,
    pub required_score: f64,
    pub action: MetricAction,
    pub subject: Option<String>,
    /// Most recently reported symbol first.
    pub symbols: Vec<String>,
}

impl MetricResult {
    pub fn display_name(&self) -> &str {
        self.name.as_deref().unwrap_or("default")
    }

    pub fn is_spam(&self) -> bool {
        self.score > self.required_score
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct SpamReply {
    /// Metrics in reverse order of appearance in the reply.
    pub metrics: Vec<MetricResult>,
    pub message_id: Option<String>,
}

#[derive(Debug, Clone, Copy)]
pub struct SpamdTimeouts {
    pub connect: Duration,
    pub results: Duration,
}

impl Default for SpamdTimeouts {
    fn default() -> Self {
        SpamdTimeouts {
            connect: Duration::from_millis(1000),
            results: Duration::from_millis(20000),
        }
    }
}

/// Submits the request to one spam daemon using the upstream's protocol.
pub fn scan(
    upstream: &Upstream,
    request: &ScanRequest,
    timeouts: &SpamdTimeouts,
) -> ScanResult<SpamReply> {
    match upstream.protocol {
        ProtocolKind::Rspamc => rspamc::scan(upstream, request, timeouts),
        ProtocolKind::Spamc => spamc::scan(upstream, &request.path, timeouts),
        ProtocolKind::Clamd => Err(ScanError::Protocol(format!(
            "upstream {} speaks {}, not a spam protocol",
            upstream.name, upstream.protocol
        ))),
    }
}

fn open_message(path: &Path) -> ScanResult<(File, u64)> {
    let file = File::open(path).map_err(|e| ScanError::transport("opening message", e))?;
    let len = file
        .metadata()
        .map_err(|e| ScanError::transport("stat on message", e))?
        .len();
    Ok((file, len))
}

/// Connects, sends `header` followed by the message, half-closes and reads
/// at most `capacity` bytes of reply.
fn exchange(
    upstream: &Upstream,
    header: &[u8],
    mut message: File,
    timeouts: &SpamdTimeouts,
    capacity: usize,
) -> ScanResult<Vec<u8>> {
    let mut stream = net::connect_with_timeout(&upstream.address, timeouts.connect)
        .map_err(|e| ScanError::net("connecting", e))?;

    match net::wait_writable(&stream, timeouts.connect) {
        Ok(0) => return Err(ScanError::Timeout("waiting for writing")),
        Ok(_) => {}
        Err(e) => return Err(ScanError::net("waiting for writing", e)),
    }
    stream
        .set_io_timeout(timeouts.results)
        .map_err(|e| ScanError::transport("configuring socket", e))?;

    stream
        .write_all(header)
        .map_err(|e| ScanError::transport("sending request", e))?;
    io::copy(&mut message, &mut stream)
        .map_err(|e| ScanError::transport("sending message", e))?;
    drop(message);
    stream
        .shutdown(Shutdown::Write)
        .map_err(|e| ScanError::transport("half-closing", e))?;

    net::read_reply(&mut stream, timeouts.results, capacity)
        .map_err(|e| ScanError::net("waiting for results", e))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_action_ordering() {
        assert!(MetricAction::NoAction < MetricAction::Greylist);
        assert!(MetricAction::Greylist < MetricAction::AddHeader);
        assert!(MetricAction::AddHeader < MetricAction::RewriteSubject);
        assert!(MetricAction::RewriteSubject < MetricAction::Reject);
    }

    #[test]
    fn test_action_from_reply() {
        assert_eq!(MetricAction::from_reply(b"reject\r\n"), MetricAction::Reject);
        assert_eq!(MetricAction::from_reply(b"greylist"), MetricAction::Greylist);
        assert_eq!(MetricAction::from_reply(b"add header"), MetricAction::AddHeader);
        assert_eq!(
            MetricAction::from_reply(b"rewrite subject"),
            MetricAction::RewriteSubject
        );
        assert_eq!(MetricAction::from_reply(b"no action"), MetricAction::NoAction);
        assert_eq!(MetricAction::from_reply(b"Reject"), MetricAction::NoAction);
    }

    #[test]
    fn test_default_metric_name() {
        let metric = MetricResult {
            score: 3.0,
            required_score: 0.0,
            ..Default::default()
        };
        assert_eq!(metric.display_name(), "default");
        assert!(metric.is_spam());
    }
}
