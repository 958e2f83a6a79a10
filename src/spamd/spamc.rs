use std::path::Path;

use super::cursor::{self, Cursor};
use super::{MetricAction, MetricResult, SpamReply, SpamdTimeouts};
use crate::error::{ScanError, ScanResult};
use crate::upstream::Upstream;

const REPLY_CAPACITY: usize = 4096 + 10;

/// Legacy single-metric scan (`SYMBOLS SPAMC/1.2`).
pub fn scan(upstream: &Upstream, file: &Path, timeouts: &SpamdTimeouts) -> ScanResult<SpamReply> {
    let result = scan_inner(upstream, file, timeouts);
    match &result {
        Ok(_) => {}
        Err(ScanError::UnexpectedReply(reply)) => log::warn!(
            "spamd: unexpected result from {} on file {}: {reply}",
            upstream.name,
            file.display()
        ),
        Err(e) => log::warn!("spamd: {} ({}): {e}", upstream.name, upstream.address),
    }
    result
}

fn scan_inner(upstream: &Upstream, file: &Path, timeouts: &SpamdTimeouts) -> ScanResult<SpamReply> {
    let (message, len) = super::open_message(file)?;
    let header = format!("SYMBOLS SPAMC/1.2\r\nContent-length: {len}\r\n\r\n");
    let reply = super::exchange(upstream, header.as_bytes(), message, timeouts, REPLY_CAPACITY)?;
    let metric = parse_reply(&reply)?;
    Ok(SpamReply {
        metrics: vec![metric],
        message_id: None,
    })
}

/// Extracts the single metric from a reply containing
/// `Spam: <bool> ; <score> / <threshold>` and an optional symbol line.
pub fn parse_reply(reply: &[u8]) -> ScanResult<MetricResult> {
    let unexpected = |what: &str| {
        ScanError::UnexpectedReply(format!(
            "{what} in '{}'",
            String::from_utf8_lossy(reply).trim_end()
        ))
    };

    let start = cursor::find(reply, b"Spam: ").ok_or_else(|| unexpected("no Spam: line"))?;
    let mut cur = Cursor::new(&reply[start + b"Spam: ".len()..]);

    let flag = cur.take_until(b" \t;\r\n");
    cur.take_until(b";\r\n");
    if !cur.eat(b";") {
        return Err(unexpected("no score"));
    }
    cur.skip_blanks();
    let score = cur
        .take_decimal("score")
        .map_err(|_| unexpected("malformed score"))?;
    cur.skip_blanks();
    if !cur.eat(b"/") {
        return Err(unexpected("no threshold"));
    }
    cur.skip_blanks();
    let required_score = cur
        .take_decimal("threshold")
        .map_err(|_| unexpected("malformed threshold"))?;

    cur.skip_to_eol();
    cur.skip_while(|b| b == b'\r' || b == b'\n');
    let symbol = String::from_utf8_lossy(cur.take_until(b"\r\n"))
        .trim()
        .to_string();

    Ok(MetricResult {
        name: None,
        verdict: String::from_utf8_lossy(flag).into_owned(),
        score,
        required_score,
        action: if flag == b"True" {
            MetricAction::Reject
        } else {
            MetricAction::NoAction
        },
        subject: None,
        symbols: if symbol.is_empty() {
            Vec::new()
        } else {
            vec![symbol]
        },
    })
}
