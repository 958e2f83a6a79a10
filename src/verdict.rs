use std::time::Duration;

use serde::Serialize;

use crate::spamd::{MetricAction, MetricResult, SpamReply};

/// Which spam pool produced a reply.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum SpamPool {
    Primary,
    Extra,
}

impl SpamPool {
    fn result_header(self) -> &'static str {
        match self {
            SpamPool::Primary => "X-Spamd-Result",
            SpamPool::Extra => "X-Spamd-Extra-Result",
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct VerdictSettings {
    pub extended_headers: bool,
    pub trace_symbol: Option<String>,
    pub trace_addr: Option<String>,
}

/// Where and how fast a reply was obtained.
#[derive(Debug, Clone)]
pub struct ScanContext<'a> {
    pub pool: SpamPool,
    pub queue_id: &'a str,
    pub server: &'a str,
    pub elapsed: Duration,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ScanVerdict {
    pub pool: SpamPool,
    pub action: MetricAction,
    /// Set only when the dominant action rewrites the subject.
    pub subject: Option<String>,
    pub headers: Vec<(String, String)>,
    pub add_recipients: Vec<String>,
    #[serde(skip)]
    pub trace: Vec<String>,
    pub metrics: Vec<MetricResult>,
}

/// Index of the metric with the greatest action; ties keep the earliest.
pub fn dominant(metrics: &[MetricResult]) -> Option<usize> {
    let mut best: Option<usize> = None;
    for (i, metric) in metrics.iter().enumerate() {
        match best {
            Some(b) if metrics[b].action >= metric.action => {}
            _ => best = Some(i),
        }
    }
    best
}

/// Reduces parsed metrics to one action plus the headers and trace lines
/// that go with it.
pub fn aggregate(reply: SpamReply, ctx: &ScanContext<'_>, settings: &VerdictSettings) -> ScanVerdict {
    let message_id = reply.message_id.as_deref().unwrap_or("undef");
    let mut trace = Vec::with_capacity(reply.metrics.len());
    let mut headers = Vec::new();
    let mut traced = false;

    for metric in &reply.metrics {
        trace.push(trace_line(metric, ctx, message_id));
        if settings.extended_headers {
            headers.push((ctx.pool.result_header().to_string(), result_header(metric)));
        }
        if let Some(wanted) = settings.trace_symbol.as_deref() {
            traced |= metric.symbols.iter().any(|s| symbol_name(s) == wanted);
        }
    }

    if settings.extended_headers {
        let scan_time = format!("{:.2}", ctx.elapsed.as_secs_f64());
        match ctx.pool {
            SpamPool::Primary => {
                headers.push(("X-Spamd-Server".to_string(), ctx.server.to_string()));
                headers.push(("X-Spamd-Scan-Time".to_string(), scan_time));
                headers.push(("X-Spamd-Queue-ID".to_string(), ctx.queue_id.to_string()));
            }
            SpamPool::Extra => {
                headers.push(("X-Spamd-Extra-Server".to_string(), ctx.server.to_string()));
                headers.push(("X-Spamd-Extra-Scan-Time".to_string(), scan_time));
            }
        }
    }

    let mut add_recipients = Vec::new();
    if traced && ctx.pool == SpamPool::Primary {
        if let Some(addr) = &settings.trace_addr {
            add_recipients.push(addr.clone());
        }
    }

    let (action, subject) = match dominant(&reply.metrics).map(|i| &reply.metrics[i]) {
        Some(m) if m.action == MetricAction::RewriteSubject => (m.action, m.subject.clone()),
        Some(m) => (m.action, None),
        None => (MetricAction::NoAction, None),
    };

    ScanVerdict {
        pool: ctx.pool,
        action,
        subject,
        headers,
        add_recipients,
        trace,
        metrics: reply.metrics,
    }
}

/// `name: True [12.10 / 10.00]` followed by one folded line per symbol.
pub fn result_header(metric: &MetricResult) -> String {
    let mut value = format!(
        "{}: {} [{:.2} / {:.2}]",
        metric.display_name(),
        if metric.is_spam() { "True" } else { "False" },
        metric.score,
        metric.required_score
    );
    if metric.symbols.is_empty() {
        value.push(' ');
    } else {
        for symbol in &metric.symbols {
            value.push('\n');
            value.push(' ');
            value.push_str(symbol);
        }
    }
    value
}

fn trace_line(metric: &MetricResult, ctx: &ScanContext<'_>, message_id: &str) -> String {
    let symbols = if metric.symbols.is_empty() {
        "no symbols".to_string()
    } else {
        metric.symbols.join(", ")
    };
    format!(
        "scan qid: <{}>, mid: <{}>, {:.6}, {}, metric: {}: {} [{:.6} / {:.6}], symbols: {}",
        ctx.queue_id,
        message_id,
        ctx.elapsed.as_secs_f64(),
        ctx.server,
        metric.display_name(),
        metric.verdict,
        metric.score,
        metric.required_score,
        symbols
    )
}

/// Symbol name without its `(...)` argument.
fn symbol_name(symbol: &str) -> &str {
    symbol.split('(').next().unwrap_or(symbol)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn metric(name: &str, action: MetricAction, symbols: &[&str]) -> MetricResult {
        MetricResult {
            name: Some(name.to_string()),
            verdict: "True".to_string(),
            score: 12.1,
            required_score: 10.0,
            action,
            subject: Some(format!("[{name}] subject")),
            symbols: symbols.iter().map(|s| s.to_string()).collect(),
        }
    }

    fn ctx(pool: SpamPool) -> ScanContext<'static> {
        ScanContext {
            pool,
            queue_id: "4F2A1C",
            server: "rspamd1",
            elapsed: Duration::from_millis(1250),
        }
    }

    fn reply(metrics: Vec<MetricResult>) -> SpamReply {
        SpamReply {
            metrics,
            message_id: Some("abc@example.com".to_string()),
        }
    }

    #[test]
    fn test_dominant_action() {
        let metrics = vec![
            metric("a", MetricAction::AddHeader, &[]),
            metric("b", MetricAction::Reject, &[]),
            metric("c", MetricAction::Greylist, &[]),
        ];
        assert_eq!(dominant(&metrics), Some(1));

        let metrics = vec![
            metric("first", MetricAction::Reject, &[]),
            metric("second", MetricAction::Reject, &[]),
        ];
        assert_eq!(dominant(&metrics), Some(0));
        assert_eq!(dominant(&[]), None);
    }

    #[test]
    fn test_subject_only_for_rewrite() {
        let settings = VerdictSettings::default();
        let verdict = aggregate(
            reply(vec![
                metric("a", MetricAction::RewriteSubject, &[]),
                metric("b", MetricAction::Reject, &[]),
            ]),
            &ctx(SpamPool::Primary),
            &settings,
        );
        assert_eq!(verdict.action, MetricAction::Reject);
        assert_eq!(verdict.subject, None);

        let verdict = aggregate(
            reply(vec![
                metric("a", MetricAction::AddHeader, &[]),
                metric("b", MetricAction::RewriteSubject, &[]),
            ]),
            &ctx(SpamPool::Primary),
            &settings,
        );
        assert_eq!(verdict.action, MetricAction::RewriteSubject);
        assert_eq!(verdict.subject.as_deref(), Some("[b] subject"));
    }

    #[test]
    fn test_empty_reply_is_no_action() {
        let verdict = aggregate(reply(vec![]), &ctx(SpamPool::Primary), &VerdictSettings::default());
        assert_eq!(verdict.action, MetricAction::NoAction);
        assert!(verdict.headers.is_empty());
        assert!(verdict.trace.is_empty());
    }

    #[test]
    fn test_result_header_format() {
        let m = metric("default", MetricAction::Reject, &["R_DKIM_REJECT", "BAYES_SPAM(0.99)"]);
        assert_eq!(
            result_header(&m),
            "default: True [12.10 / 10.00]\n R_DKIM_REJECT\n BAYES_SPAM(0.99)"
        );

        let mut m = metric("phishing", MetricAction::NoAction, &[]);
        m.name = None;
        m.score = 0.0;
        assert_eq!(result_header(&m), "default: False [0.00 / 10.00] ");
    }

    #[test]
    fn test_extended_headers() {
        let settings = VerdictSettings {
            extended_headers: true,
            ..Default::default()
        };
        let verdict = aggregate(
            reply(vec![metric("default", MetricAction::AddHeader, &["A"])]),
            &ctx(SpamPool::Primary),
            &settings,
        );
        let names: Vec<_> = verdict.headers.iter().map(|(n, _)| n.as_str()).collect();
        assert_eq!(
            names,
            vec!["X-Spamd-Result", "X-Spamd-Server", "X-Spamd-Scan-Time", "X-Spamd-Queue-ID"]
        );
        assert_eq!(verdict.headers[2].1, "1.25");
        assert_eq!(verdict.headers[3].1, "4F2A1C");

        let verdict = aggregate(
            reply(vec![metric("default", MetricAction::AddHeader, &["A"])]),
            &ctx(SpamPool::Extra),
            &settings,
        );
        let names: Vec<_> = verdict.headers.iter().map(|(n, _)| n.as_str()).collect();
        assert_eq!(
            names,
            vec!["X-Spamd-Extra-Result", "X-Spamd-Extra-Server", "X-Spamd-Extra-Scan-Time"]
        );
    }

    #[test]
    fn test_trace_lines() {
        let verdict = aggregate(
            reply(vec![
                metric("default", MetricAction::Reject, &["B", "A"]),
                metric("empty", MetricAction::NoAction, &[]),
            ]),
            &ctx(SpamPool::Primary),
            &VerdictSettings::default(),
        );
        assert_eq!(
            verdict.trace[0],
            "scan qid: <4F2A1C>, mid: <abc@example.com>, 1.250000, rspamd1, \
metric: default: True [12.100000 / 10.000000], symbols: B, A"
        );
        assert!(verdict.trace[1].ends_with("symbols: no symbols"));
    }

    #[test]
    fn test_trace_recipient() {
        let settings = VerdictSettings {
            extended_headers: false,
            trace_symbol: Some("SPAM_TRAP".to_string()),
            trace_addr: Some("trace@example.org".to_string()),
        };
        let hit = reply(vec![metric("default", MetricAction::Reject, &["SPAM_TRAP(1.00)"])]);

        let verdict = aggregate(hit.clone(), &ctx(SpamPool::Primary), &settings);
        assert_eq!(verdict.add_recipients, vec!["trace@example.org"]);

        let verdict = aggregate(hit, &ctx(SpamPool::Extra), &settings);
        assert!(verdict.add_recipients.is_empty());

        let miss = reply(vec![metric("default", MetricAction::Reject, &["SPAM_TRAPPED"])]);
        let verdict = aggregate(miss, &ctx(SpamPool::Primary), &settings);
        assert!(verdict.add_recipients.is_empty());
    }
}
