use thiserror::Error;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("expected {expected} at offset {offset}")]
pub struct ParseError {
    pub offset: usize,
    pub expected: &'static str,
}

/// Bounds-checked cursor over a daemon reply buffer.
#[derive(Debug, Clone)]
pub struct Cursor<'a> {
    buf: &'a [u8],
    pos: usize,
}

impl<'a> Cursor<'a> {
    pub fn new(buf: &'a [u8]) -> Self {
        Cursor { buf, pos: 0 }
    }

    pub fn offset(&self) -> usize {
        self.pos
    }

    pub fn remaining(&self) -> &'a [u8] {
        &self.buf[self.pos..]
    }

    pub fn is_at_end(&self) -> bool {
        self.pos >= self.buf.len()
    }

    pub fn peek(&self) -> Option<u8> {
        self.buf.get(self.pos).copied()
    }

    pub fn error(&self, expected: &'static str) -> ParseError {
        ParseError {
            offset: self.pos,
            expected,
        }
    }

    pub fn starts_with(&self, literal: &[u8]) -> bool {
        self.remaining().starts_with(literal)
    }

    /// Consumes `literal` if the input continues with it.
    pub fn eat(&mut self, literal: &[u8]) -> bool {
        if self.starts_with(literal) {
            self.pos += literal.len();
            true
        } else {
            false
        }
    }

    pub fn expect(&mut self, literal: &[u8], expected: &'static str) -> Result<(), ParseError> {
        if self.eat(literal) {
            Ok(())
        } else {
            Err(self.error(expected))
        }
    }

    /// Takes everything up to (not including) the first byte in `delims`,
    /// or up to the end of input.
    pub fn take_until(&mut self, delims: &[u8]) -> &'a [u8] {
        let rest = self.remaining();
        let len = rest
            .iter()
            .position(|b| delims.contains(b))
            .unwrap_or(rest.len());
        self.pos += len;
        &rest[..len]
    }

    /// Like [`take_until`](Self::take_until) but refuses an empty token.
    pub fn take_token(
        &mut self,
        delims: &[u8],
        expected: &'static str,
    ) -> Result<&'a [u8], ParseError> {
        let start = self.pos;
        let token = self.take_until(delims);
        if token.is_empty() {
            self.pos = start;
            return Err(self.error(expected));
        }
        Ok(token)
    }

    /// Takes a field terminated by `terminator`, consuming the terminator.
    /// Hitting one of `stops` or the end of input first is an error.
    pub fn take_field(
        &mut self,
        terminator: u8,
        stops: &[u8],
        expected: &'static str,
    ) -> Result<&'a [u8], ParseError> {
        let rest = self.remaining();
        match rest
            .iter()
            .position(|b| *b == terminator || stops.contains(b))
        {
            Some(len) if rest[len] == terminator => {
                self.pos += len + 1;
                Ok(&rest[..len])
            }
            Some(len) => Err(ParseError {
                offset: self.pos + len,
                expected,
            }),
            None => Err(ParseError {
                offset: self.buf.len(),
                expected,
            }),
        }
    }

    pub fn skip_while<F: Fn(u8) -> bool>(&mut self, pred: F) -> usize {
        let len = self
            .remaining()
            .iter()
            .position(|b| !pred(*b))
            .unwrap_or(self.buf.len() - self.pos);
        self.pos += len;
        len
    }

    pub fn skip_whitespace(&mut self) -> usize {
        self.skip_while(|b| b.is_ascii_whitespace())
    }

    /// Skips spaces and tabs without leaving the current line.
    pub fn skip_blanks(&mut self) -> usize {
        self.skip_while(|b| b == b' ' || b == b'\t')
    }

    /// Moves to the line terminator (CR or LF) without consuming it.
    pub fn skip_to_eol(&mut self) {
        self.take_until(b"\r\n");
    }

    /// Consumes the rest of the line including its LF.
    pub fn skip_line(&mut self, expected: &'static str) -> Result<(), ParseError> {
        self.take_until(b"\n");
        self.expect(b"\n", expected)
    }

    /// Parses a leading decimal number (`-1.5`, `12`, `3.0e2`).
    pub fn take_decimal(&mut self, expected: &'static str) -> Result<f64, ParseError> {
        let rest = self.remaining();
        let mut len = 0;
        if matches!(rest.first(), Some(b'-') | Some(b'+')) {
            len += 1;
        }
        let int_digits = count_digits(&rest[len..]);
        len += int_digits;
        let mut frac_digits = 0;
        if rest.get(len) == Some(&b'.') {
            frac_digits = count_digits(&rest[len + 1..]);
            len += 1 + frac_digits;
        }
        if int_digits + frac_digits == 0 {
            return Err(self.error(expected));
        }
        if matches!(rest.get(len), Some(b'e') | Some(b'E')) {
            let mut exp_len = 1;
            if matches!(rest.get(len + 1), Some(b'-') | Some(b'+')) {
                exp_len += 1;
            }
            let exp_digits = count_digits(&rest[(len + exp_len).min(rest.len())..]);
            if exp_digits > 0 {
                len += exp_len + exp_digits;
            }
        }

        let value = std::str::from_utf8(&rest[..len])
            .ok()
            .and_then(|s| s.parse::<f64>().ok())
            .ok_or_else(|| self.error(expected))?;
        self.pos += len;
        Ok(value)
    }
}

fn count_digits(buf: &[u8]) -> usize {
    buf.iter().take_while(|b| b.is_ascii_digit()).count()
}

/// Finds the first occurrence of `needle` in `haystack`.
pub fn find(haystack: &[u8], needle: &[u8]) -> Option<usize> {
    if needle.is_empty() {
        return Some(0);
    }
    haystack.windows(needle.len()).position(|w| w == needle)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_literals() {
        let mut cur = Cursor::new(b"RSPAMD/1.3 0 EX_OK\r\n");
        assert!(!cur.eat(b"SPAMD/"));
        cur.expect(b"RSPAMD/", "signature").unwrap();
        assert_eq!(cur.offset(), 7);
        assert_eq!(
            cur.expect(b"2.0", "version"),
            Err(ParseError {
                offset: 7,
                expected: "version"
            })
        );
    }

    #[test]
    fn test_tokens_and_fields() {
        let mut cur = Cursor::new(b"BAYES_SPAM(0.9); 5.1\r\nnext");
        assert_eq!(cur.take_token(b";\r\n", "symbol").unwrap(), b"BAYES_SPAM(0.9)");
        assert_eq!(cur.peek(), Some(b';'));
        cur.skip_to_eol();
        assert!(cur.take_token(b";\r\n", "symbol").is_err());
        cur.skip_line("line end").unwrap();
        assert_eq!(cur.remaining(), b"next");
        assert!(cur.skip_line("line end").is_err());

        let mut cur = Cursor::new(b"default; True; 1\r\nx;");
        assert_eq!(cur.take_field(b';', b"\r\n", "name").unwrap(), b"default");
        assert_eq!(cur.take_field(b';', b"\r\n", "verdict").unwrap(), b" True");
        // The next ';' is on another line.
        assert!(cur.take_field(b';', b"\r\n", "score").is_err());
    }

    #[test]
    fn test_decimals() {
        let mut cur = Cursor::new(b"12.5 / 5");
        assert_eq!(cur.take_decimal("score").unwrap(), 12.5);
        cur.skip_while(|b| b == b' ' || b == b'/');
        assert_eq!(cur.take_decimal("score").unwrap(), 5.0);
        assert!(cur.is_at_end());

        for (input, value) in [("-0.50", -0.5), (".5x", 0.5), ("3.", 3.0), ("1e2 ", 100.0)] {
            let mut cur = Cursor::new(input.as_bytes());
            assert_eq!(cur.take_decimal("score").unwrap(), value, "{input}");
        }
        for input in ["", "abc", "-", ".", "/5"] {
            let mut cur = Cursor::new(input.as_bytes());
            assert!(cur.take_decimal("score").is_err(), "{input}");
            assert_eq!(cur.offset(), 0);
        }
    }

    #[test]
    fn test_find() {
        assert_eq!(find(b"xxSpam: True", b"Spam: "), Some(2));
        assert_eq!(find(b"Spa", b"Spam: "), None);
    }
}
