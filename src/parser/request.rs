// Copyright 2022 Ryan Seipp
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

//! Incremental request parser.
//!
//! The parser runs over the connection's fixed read buffer and never owns
//! the bytes it scans; it keeps cursor positions between calls so a request
//! arriving across multiple TCP segments resumes where the previous call
//! stopped. Three states mirror the request structure: the request line,
//! the header block, and (for POST) a body of `Content-Length` bytes
//! buffered in place.

use std::str;

use super::{LineStatus, Method};

/// Major parser state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ParseState {
    /// Expecting `METHOD target HTTP/1.1`.
    RequestLine,
    /// Accumulating header fields until the blank line.
    Header,
    /// Consuming `Content-Length` bytes of POST body.
    Body,
}

/// Outcome of a parse pass over the currently buffered bytes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ParseStatus {
    /// More bytes are required before a verdict is possible.
    Open,
    /// A complete, well-formed request has been consumed.
    Done,
    /// The request is malformed; respond `400` and stop reading.
    Bad,
}

/// Resumable request parser state plus the extracted request fields.
#[derive(Debug)]
pub struct RequestParser {
    state: ParseState,
    /// Position of the next unexamined byte.
    checked: usize,
    /// Start of the line currently being scanned.
    line_start: usize,
    /// Request method; meaningful once the request line has parsed.
    pub method: Method,
    /// Request target, always beginning with `/`.
    pub url: String,
    /// Protocol version as sent; only `HTTP/1.1` is accepted.
    pub version: String,
    /// Value of the `Host` header, if present.
    pub host: String,
    /// Value of the `Content-Length` header; zero when absent.
    pub content_length: usize,
    /// Whether the client asked for `Connection: keep-alive`.
    pub keep_alive: bool,
    /// POST body bytes, captured once `Content-Length` of them arrived.
    pub body: String,
}

impl RequestParser {
    /// Creates a parser positioned at the start of an empty buffer.
    pub fn new() -> Self {
        Self {
            state: ParseState::RequestLine,
            checked: 0,
            line_start: 0,
            method: Method::Get,
            url: String::new(),
            version: String::new(),
            host: String::new(),
            content_length: 0,
            keep_alive: false,
            body: String::new(),
        }
    }

    /// Returns the parser to its initial state for the next request on a
    /// kept-alive connection.
    pub fn reset(&mut self) {
        *self = Self::new();
    }

    /// Current major state.
    pub fn state(&self) -> ParseState {
        self.state
    }

    /// Drives the state machine over `buf[..filled]`.
    ///
    /// Call again with the same buffer and a larger `filled` after each
    /// successful read; positions are retained between calls.
    pub fn parse(&mut self, buf: &[u8], filled: usize) -> ParseStatus {
        loop {
            if self.state == ParseState::Body {
                if filled < self.checked + self.content_length {
                    return ParseStatus::Open;
                }
                let end = self.checked + self.content_length;
                self.body = String::from_utf8_lossy(&buf[self.checked..end]).into_owned();
                self.checked = end;
                return ParseStatus::Done;
            }

            let (start, end) = match self.next_line(buf, filled) {
                (LineStatus::Ok, range) => range,
                (LineStatus::Open, _) => return ParseStatus::Open,
                (LineStatus::Bad, _) => return ParseStatus::Bad,
            };
            let line = &buf[start..end];

            if self.state == ParseState::RequestLine {
                if self.parse_request_line(line).is_err() {
                    return ParseStatus::Bad;
                }
            } else if line.is_empty() {
                if self.content_length > 0 && self.method == Method::Post {
                    self.state = ParseState::Body;
                    continue;
                }
                return ParseStatus::Done;
            } else if self.parse_header(line).is_err() {
                return ParseStatus::Bad;
            }
        }
    }

    /// Scans for the next `\r\n` terminator, returning the line's byte range
    /// (terminator excluded) on success.
    fn next_line(&mut self, buf: &[u8], filled: usize) -> (LineStatus, (usize, usize)) {
        while self.checked < filled {
            match buf[self.checked] {
                b'\r' => {
                    if self.checked + 1 == filled {
                        return (LineStatus::Open, (0, 0));
                    }
                    if buf[self.checked + 1] == b'\n' {
                        let range = (self.line_start, self.checked);
                        self.checked += 2;
                        self.line_start = self.checked;
                        return (LineStatus::Ok, range);
                    }
                    return (LineStatus::Bad, (0, 0));
                }
                b'\n' => {
                    // the \r may have ended the previous segment
                    if self.checked > self.line_start && buf[self.checked - 1] == b'\r' {
                        let range = (self.line_start, self.checked - 1);
                        self.checked += 1;
                        self.line_start = self.checked;
                        return (LineStatus::Ok, range);
                    }
                    return (LineStatus::Bad, (0, 0));
                }
                _ => self.checked += 1,
            }
        }
        (LineStatus::Open, (0, 0))
    }

    fn parse_request_line(&mut self, line: &[u8]) -> Result<(), ()> {
        let text = str::from_utf8(line).map_err(|_| ())?;
        let mut parts = text.split_ascii_whitespace();

        self.method = match parts.next() {
            Some("GET") => Method::Get,
            Some("POST") => Method::Post,
            _ => return Err(()),
        };

        let mut url = parts.next().ok_or(())?;
        let version = parts.next().ok_or(())?;
        if !version.eq_ignore_ascii_case("HTTP/1.1") {
            return Err(());
        }

        if let Some(rest) = url.strip_prefix("http://") {
            url = rest.find('/').map(|i| &rest[i..]).ok_or(())?;
        }
        if !url.starts_with('/') {
            return Err(());
        }

        self.url = url.to_owned();
        self.version = version.to_owned();
        self.state = ParseState::Header;
        Ok(())
    }

    fn parse_header(&mut self, line: &[u8]) -> Result<(), ()> {
        let text = str::from_utf8(line).map_err(|_| ())?;
        let Some((name, value)) = text.split_once(':') else {
            // tolerated, as are unrecognized fields
            return Ok(());
        };
        let value = value.trim_start();

        if name.eq_ignore_ascii_case("Connection") {
            self.keep_alive = value.eq_ignore_ascii_case("keep-alive");
        } else if name.eq_ignore_ascii_case("Content-Length") {
            self.content_length = value.parse().map_err(|_| ())?;
        } else if name.eq_ignore_ascii_case("Host") {
            self.host = value.to_owned();
        }
        Ok(())
    }
}

impl Default for RequestParser {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod test {
    use super::{Method, ParseStatus, RequestParser};

    fn parse_all(input: &[u8]) -> (RequestParser, ParseStatus) {
        let mut parser = RequestParser::new();
        let status = parser.parse(input, input.len());
        (parser, status)
    }

    #[test]
    fn parses_simple_get() {
        let (parser, status) = parse_all(b"GET /index.html HTTP/1.1\r\nHost: x\r\n\r\n");
        assert_eq!(ParseStatus::Done, status);
        assert_eq!(Method::Get, parser.method);
        assert_eq!("/index.html", parser.url);
        assert_eq!("HTTP/1.1", parser.version);
        assert_eq!("x", parser.host);
        assert!(!parser.keep_alive);
    }

    #[test]
    fn recognizes_keep_alive() {
        let (parser, status) =
            parse_all(b"GET / HTTP/1.1\r\nConnection: keep-alive\r\nHost: a.example\r\n\r\n");
        assert_eq!(ParseStatus::Done, status);
        assert!(parser.keep_alive);
    }

    #[test]
    fn strips_absolute_form_target() {
        let (parser, status) = parse_all(b"GET http://a.example/img.html HTTP/1.1\r\n\r\n");
        assert_eq!(ParseStatus::Done, status);
        assert_eq!("/img.html", parser.url);
    }

    #[test]
    fn rejects_http_1_0() {
        let (_, status) = parse_all(b"GET / HTTP/1.0\r\n\r\n");
        assert_eq!(ParseStatus::Bad, status);
    }

    #[test]
    fn rejects_unknown_method() {
        let (_, status) = parse_all(b"BREW /pot HTTP/1.1\r\n\r\n");
        assert_eq!(ParseStatus::Bad, status);
    }

    #[test]
    fn rejects_target_without_slash() {
        let (_, status) = parse_all(b"GET index.html HTTP/1.1\r\n\r\n");
        assert_eq!(ParseStatus::Bad, status);
    }

    #[test]
    fn rejects_bare_carriage_return_in_line() {
        let (_, status) = parse_all(b"GET / HTTP/1.1\rX\n\r\n");
        assert_eq!(ParseStatus::Bad, status);
    }

    #[test]
    fn resumes_across_segment_boundaries() {
        let full = b"POST /login HTTP/1.1\r\nContent-Length: 26\r\n\r\nuser=alice&password=secret";
        let mut parser = RequestParser::new();

        // feed one byte at a time; every prefix must stay Open
        for filled in 1..full.len() {
            assert_eq!(
                ParseStatus::Open,
                parser.parse(full, filled),
                "prefix of {filled} bytes should be incomplete"
            );
        }
        assert_eq!(ParseStatus::Done, parser.parse(full, full.len()));
        assert_eq!(Method::Post, parser.method);
        assert_eq!(26, parser.content_length);
        assert_eq!("user=alice&password=secret", parser.body);
    }

    #[test]
    fn split_terminator_is_handled() {
        let mut parser = RequestParser::new();
        let full = b"GET / HTTP/1.1\r\n\r\n";
        // stop right after the first \r
        assert_eq!(ParseStatus::Open, parser.parse(full, 15));
        assert_eq!(super::ParseState::RequestLine, parser.state());
        assert_eq!(ParseStatus::Done, parser.parse(full, full.len()));
    }

    #[test]
    fn post_body_is_captured() {
        let (parser, status) = parse_all(
            b"POST /register HTTP/1.1\r\nContent-Length: 26\r\n\r\nuser=bob&password=hunter42",
        );
        assert_eq!(ParseStatus::Done, status);
        assert_eq!("user=bob&password=hunter42", parser.body);
    }

    #[test]
    fn post_without_length_completes_at_blank_line() {
        let (parser, status) = parse_all(b"POST /login HTTP/1.1\r\n\r\n");
        assert_eq!(ParseStatus::Done, status);
        assert_eq!("", parser.body);
    }

    #[test]
    fn reset_clears_state_for_next_request() {
        let (mut parser, status) = parse_all(b"GET /a HTTP/1.1\r\nConnection: keep-alive\r\n\r\n");
        assert_eq!(ParseStatus::Done, status);
        parser.reset();
        let second = b"GET /b HTTP/1.1\r\n\r\n";
        assert_eq!(ParseStatus::Done, parser.parse(second, second.len()));
        assert_eq!("/b", parser.url);
        assert!(!parser.keep_alive);
    }

    #[test]
    fn parse_serialize_parse_is_stable() {
        let (first, status) = parse_all(
            b"POST /login HTTP/1.1\r\nHost: a.example\r\nConnection: keep-alive\r\nContent-Length: 9\r\n\r\nuser=x&p=",
        );
        assert_eq!(ParseStatus::Done, status);

        let serialized = format!(
            "{} {} {}\r\nHost: {}\r\nConnection: {}\r\nContent-Length: {}\r\n\r\n{}",
            first.method,
            first.url,
            first.version,
            first.host,
            if first.keep_alive { "keep-alive" } else { "close" },
            first.content_length,
            first.body,
        );
        let (second, status) = parse_all(serialized.as_bytes());
        assert_eq!(ParseStatus::Done, status);
        assert_eq!(first.method, second.method);
        assert_eq!(first.url, second.url);
        assert_eq!(first.version, second.version);
        assert_eq!(first.host, second.host);
        assert_eq!(first.keep_alive, second.keep_alive);
        assert_eq!(first.content_length, second.content_length);
        assert_eq!(first.body, second.body);
    }
}
