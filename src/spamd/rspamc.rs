use super::cursor::{Cursor, ParseError};
use super::{MetricAction, MetricResult, SpamReply, SpamdTimeouts};
use crate::error::{ScanError, ScanResult};
use crate::scanner::ScanRequest;
use crate::upstream::Upstream;

/// Size of both the request header buffer and the reply buffer.
pub const BUFFER_SIZE: usize = 16384;

pub fn scan(
    upstream: &Upstream,
    request: &ScanRequest,
    timeouts: &SpamdTimeouts,
) -> ScanResult<SpamReply> {
    let result = scan_inner(upstream, request, timeouts);
    if let Err(e) = &result {
        log::warn!("rspamd: {} ({}): {e}", upstream.name, upstream.address);
    }
    result
}

fn scan_inner(
    upstream: &Upstream,
    request: &ScanRequest,
    timeouts: &SpamdTimeouts,
) -> ScanResult<SpamReply> {
    let (message, len) = super::open_message(&request.path)?;
    let header = build_request(request, len)?;
    let reply = super::exchange(upstream, &header, message, timeouts, BUFFER_SIZE)?;
    parse_reply(&reply).map_err(|e| {
        ScanError::Protocol(format!("invalid reply from server {}: {e}", upstream.name))
    })
}

/// Fixed-capacity request header; a line that does not fit is refused
/// rather than truncated.
struct RequestHeader {
    buf: Vec<u8>,
}

impl RequestHeader {
    fn new() -> Self {
        RequestHeader {
            buf: Vec::with_capacity(BUFFER_SIZE),
        }
    }

    fn push(&mut self, line: String, what: &'static str) -> ScanResult<()> {
        if line.len() > BUFFER_SIZE - self.buf.len() {
            log::warn!("rspamd: buffer overflow while filling {what} line");
            return Err(ScanError::BufferOverflow(what));
        }
        self.buf.extend_from_slice(line.as_bytes());
        Ok(())
    }
}

pub fn build_request(request: &ScanRequest, content_length: u64) -> ScanResult<Vec<u8>> {
    let mut header = RequestHeader::new();
    header.push(
        format!("SYMBOLS RSPAMC/1.2\r\nContent-length: {content_length}\r\n"),
        "command",
    )?;
    for rcpt in &request.rcpts {
        header.push(format!("Rcpt: {rcpt}\r\n"), "Rcpt")?;
    }
    let optional = [
        ("From", &request.from),
        ("Helo", &request.helo),
        ("IP", &request.ip),
        ("User", &request.user),
    ];
    for (name, value) in optional {
        if let Some(value) = value.as_deref().filter(|v| !v.is_empty()) {
            header.push(format!("{name}: {value}\r\n"), name)?;
        }
    }
    header.push(format!("Queue-ID: {}\r\n\r\n", request.queue_id), "Queue-ID")?;
    Ok(header.buf)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum State {
    StatusLine,
    SkipWhitespace,
    Dispatch,
    MetricValue,
    SymbolValue,
    ActionValue,
    MessageIdValue,
    SubjectValue,
}

struct ReplyParser<'a> {
    cur: Cursor<'a>,
    state: State,
    open: Option<MetricResult>,
    done: Vec<MetricResult>,
    message_id: Option<String>,
}

/// Parses a complete (or truncated) reply buffer. The reply is a status line
/// followed by line records:
///
/// ```text
/// RSPAMD/1.3 0 EX_OK
/// Metric: default; True; 12.10 / 10.00 / 0.00
/// Symbol: BAYES_SPAM(0.99); 5.10
/// Action: reject
/// Message-ID: <id@example.com>
/// ```
pub fn parse_reply(buf: &[u8]) -> Result<SpamReply, ParseError> {
    ReplyParser {
        cur: Cursor::new(buf),
        state: State::StatusLine,
        open: None,
        done: Vec::new(),
        message_id: None,
    }
    .run()
}

impl<'a> ReplyParser<'a> {
    fn run(mut self) -> Result<SpamReply, ParseError> {
        while !self.cur.is_at_end() {
            self.state = match self.state {
                State::StatusLine => self.status_line()?,
                State::SkipWhitespace => {
                    self.cur.skip_whitespace();
                    State::Dispatch
                }
                State::Dispatch => self.dispatch()?,
                State::MetricValue => self.metric_value()?,
                State::SymbolValue => self.symbol_value()?,
                State::ActionValue => {
                    let action = MetricAction::from_reply(self.cur.take_until(b"\r\n"));
                    self.open_metric()?.action = action;
                    State::SkipWhitespace
                }
                State::MessageIdValue => {
                    self.message_id = Some(self.line_value());
                    State::SkipWhitespace
                }
                State::SubjectValue => {
                    let subject = self.line_value();
                    if let Some(metric) = self.open.as_mut() {
                        metric.subject = Some(subject);
                    }
                    State::SkipWhitespace
                }
            };
        }

        if let Some(metric) = self.open.take() {
            self.finish(metric);
        }
        self.done.reverse();
        Ok(SpamReply {
            metrics: self.done,
            message_id: self.message_id,
        })
    }

    /// `RSPAMD/<version> <code> <description>`; only codes starting with
    /// `0` mean success.
    fn status_line(&mut self) -> Result<State, ParseError> {
        self.cur.expect(b"RSPAMD/", "RSPAMD/ signature")?;
        self.cur.take_token(b" \t\r\n", "protocol version")?;
        if self.cur.skip_blanks() == 0 {
            return Err(self.cur.error("space after protocol version"));
        }
        if self.cur.peek() != Some(b'0') {
            return Err(self.cur.error("success status code"));
        }
        self.cur.skip_line("end of status line")?;
        Ok(State::SkipWhitespace)
    }

    fn dispatch(&mut self) -> Result<State, ParseError> {
        let next = if self.cur.eat(b"Metric:") {
            if let Some(metric) = self.open.take() {
                self.finish(metric);
            }
            State::MetricValue
        } else if self.cur.eat(b"Symbol:") {
            self.open_metric()?;
            State::SymbolValue
        } else if self.cur.eat(b"Action:") {
            self.open_metric()?;
            State::ActionValue
        } else if self.cur.eat(b"Message-ID:") {
            State::MessageIdValue
        } else if self.cur.eat(b"Subject:") {
            State::SubjectValue
        } else {
            // Unknown record, ignore the whole line.
            self.cur.skip_to_eol();
            return Ok(State::SkipWhitespace);
        };
        self.cur.skip_blanks();
        Ok(next)
    }

    /// `name ; verdict ; score / required [/ extra]`
    fn metric_value(&mut self) -> Result<State, ParseError> {
        let name = lossy_trim(self.cur.take_field(b';', b"\r\n", "metric name")?);
        let verdict = lossy_trim(self.cur.take_field(b';', b"\r\n", "metric result")?);

        self.cur.skip_blanks();
        let score = self.cur.take_decimal("metric score")?;
        if !matches!(self.cur.peek(), None | Some(b' ' | b'\t' | b'/' | b'\r' | b'\n')) {
            return Err(self.cur.error("separator after metric score"));
        }
        self.cur.skip_while(|b| b == b' ' || b == b'\t' || b == b'/');
        let required_score = self.cur.take_decimal("required score")?;
        if !matches!(self.cur.peek(), None | Some(b' ' | b'\t' | b'/' | b'\r' | b'\n')) {
            return Err(self.cur.error("separator after required score"));
        }
        self.cur.skip_to_eol();

        self.open = Some(MetricResult {
            name: (!name.is_empty()).then_some(name),
            verdict,
            score,
            required_score,
            ..Default::default()
        });
        Ok(State::SkipWhitespace)
    }

    fn symbol_value(&mut self) -> Result<State, ParseError> {
        let symbol = self.cur.take_token(b";\r\n", "symbol name")?;
        let symbol = String::from_utf8_lossy(symbol).into_owned();
        self.open_metric()?.symbols.push(symbol);
        self.cur.skip_to_eol();
        Ok(State::SkipWhitespace)
    }

    fn line_value(&mut self) -> String {
        lossy_trim(self.cur.take_until(b"\r\n"))
    }

    fn open_metric(&mut self) -> Result<&mut MetricResult, ParseError> {
        match self.open.as_mut() {
            Some(metric) => Ok(metric),
            None => Err(ParseError {
                offset: self.cur.offset(),
                expected: "Metric: record first",
            }),
        }
    }

    fn finish(&mut self, mut metric: MetricResult) {
        // Newest symbol first.
        metric.symbols.reverse();
        self.done.push(metric);
    }
}

fn lossy_trim(bytes: &[u8]) -> String {
    String::from_utf8_lossy(bytes).trim().to_string()
}
