//! Incremental HTTP message parser.
//!
//! [`parse`] consumes as many bytes as it can from the receive buffer's
//! cursor and advances the message state machine. Bytes it cannot decide
//! on yet are left unconsumed, so they survive the buffer compaction
//! between reads and the result is independent of how the input was
//! chunked.

use crate::{
    errors::Outcome,
    http::{
        message::{Message, ParseState},
        types::Version,
    },
    limits::{MAX_CHUNKS_CONTENT, MAX_CHUNKS_URI},
    mem::buffer::ChunkBuffer,
};
use memchr::memchr;

/// Drives the parse state machine over the unconsumed bytes of `data`.
///
/// - [`Outcome::Success`]: message complete, surplus bytes left in `data`.
/// - [`Outcome::Continue`]: a content packet is available, more declared
///   bytes are still expected.
/// - [`Outcome::Incomplete`]: not enough bytes to decide; read more.
/// - [`Outcome::Reject`]: malformed; the message result is already set.
pub(crate) fn parse(msg: &mut Message, data: &mut ChunkBuffer) -> Outcome {
    loop {
        let state = msg.state.parse;
        let next = match state {
            ParseState::Init => parse_init(msg, data),
            ParseState::Uri => parse_uri(msg, data),
            ParseState::UriFragment => parse_fragment(msg, data),
            ParseState::Query => parse_query(msg, data),
            ParseState::Version => parse_version(msg, data),
            ParseState::Status => parse_status(msg, data),
            ParseState::PreHeader => parse_preheader(msg),
            ParseState::Header => parse_header(msg, data),
            ParseState::PostHeader => parse_postheader(msg, data),
            ParseState::PreContent => parse_precontent(msg),
            ParseState::Content => parse_content(msg, data),
            ParseState::PostContent => parse_postcontent(msg, data),
            ParseState::End => {
                return if msg.result == 200 {
                    Outcome::Success
                } else {
                    Outcome::Reject
                };
            }
        };
        if next == state {
            // no transition: content hands a packet to the caller, every
            // earlier phase is starved for bytes
            return if state == ParseState::Content {
                Outcome::Continue
            } else {
                Outcome::Incomplete
            };
        }
        msg.state.parse = next;
    }
}

#[inline]
fn reject(msg: &mut Message, result: u16) -> ParseState {
    msg.result = result;
    ParseState::End
}

fn parse_init(msg: &mut Message, data: &mut ChunkBuffer) -> ParseState {
    let avail = data.remaining();
    let mut undecided = false;

    let methods = msg.methods.clone();
    for (index, method) in methods.iter().enumerate() {
        let name = method.name.as_bytes();
        if avail.len() <= name.len() {
            // a prefix match may still complete with more bytes
            if name[..avail.len()].eq_ignore_ascii_case(avail) {
                undecided = true;
            }
            continue;
        }
        if avail[..name.len()].eq_ignore_ascii_case(name) && avail[name.len()] == b' ' {
            msg.method = Some(index);
            // requests without a Content-Length have no body
            msg.content_length = Some(0);
            msg.content_remaining = Some(0);
            data.advance(name.len() + 1);
            return ParseState::Uri;
        }
    }
    if undecided {
        return ParseState::Init;
    }
    tracing::warn!("message: reject method");
    reject(msg, 405)
}

/// Lookahead needed before `b` can be consumed in the URI phase.
#[inline(always)]
const fn uri_lookahead(b: u8) -> usize {
    match b {
        b'%' => 3,
        b'.' | b'/' | b'\r' => 2,
        _ => 1,
    }
}

fn parse_uri(msg: &mut Message, data: &mut ChunkBuffer) -> ParseState {
    if !msg.uri_open {
        let Some(&first) = data.remaining().first() else {
            return ParseState::Uri;
        };
        if !matches!(first, b'/' | b' ' | b'%' | b'\r' | b'\n') {
            tracing::warn!("message: reject URI bad formatting");
            return reject(msg, 400);
        }
        msg.uri_open = true;
    }

    loop {
        let rem = data.remaining();
        let Some(&b) = rem.first() else {
            return ParseState::Uri;
        };
        if rem.len() < uri_lookahead(b) {
            return ParseState::Uri;
        }
        match b {
            b'.' if rem[1] == b'.' => {
                // one rewind drops the current segment, the second drops
                // the separator; failing the first means the path tries
                // to escape the root
                if !msg.uri.rewind_to(b'/') {
                    tracing::warn!("message: reject dangerous uri");
                    return reject(msg, 400);
                }
                if !msg.uri.rewind_to(b'/') {
                    tracing::warn!("message: reject dangerous uri");
                    return reject(msg, 400);
                }
                data.advance(2);
            }
            b'%' => {
                let (hi, lo) = (hex_value(rem[1]), hex_value(rem[2]));
                let (Some(hi), Some(lo)) = (hi, lo) else {
                    tracing::warn!("message: reject uri mal formatted");
                    return reject(msg, 400);
                };
                let decoded = hi << 4 | lo;
                // decoded separators would smuggle segments past the
                // dot-dot collapse above
                if decoded < 0x20 || decoded == b'.' || decoded == b'/' {
                    tracing::warn!("message: reject dangerous uri");
                    return reject(msg, 400);
                }
                if msg.uri.append(&[decoded]).is_none() {
                    return reject(msg, 414);
                }
                data.advance(3);
            }
            b'/' => {
                if msg.uri.append(b"/").is_none() {
                    tracing::warn!("message: reject uri too long");
                    return reject(msg, 414);
                }
                data.advance(1);
                // collapse duplicate slashes in the path part only
                while data.remaining().first() == Some(&b'/') {
                    data.advance(1);
                }
            }
            b'?' => {
                data.advance(1);
                return ParseState::Query;
            }
            b'#' => {
                data.advance(1);
                return ParseState::UriFragment;
            }
            b' ' => {
                data.advance(1);
                return ParseState::Version;
            }
            b'\r' | b'\n' => {
                // request line ends with no version token: HTTP/0.9
                data.advance(1);
                if b == b'\r' && data.remaining().first() == Some(&b'\n') {
                    data.advance(1);
                }
                msg.version = Version::Http09;
                return ParseState::PreHeader;
            }
            b if b < 0x20 => {
                tracing::warn!("message: reject bad character in uri");
                return reject(msg, 400);
            }
            b => {
                if msg.uri.append(&[b]).is_none() {
                    tracing::warn!("message: reject uri too long");
                    return reject(msg, 414);
                }
                data.advance(1);
            }
        }
    }
}

#[inline(always)]
const fn hex_value(b: u8) -> Option<u8> {
    match b {
        b'0'..=b'9' => Some(b - b'0'),
        b'a'..=b'f' => Some(b - b'a' + 10),
        b'A'..=b'F' => Some(b - b'A' + 10),
        _ => None,
    }
}

fn parse_fragment(msg: &mut Message, data: &mut ChunkBuffer) -> ParseState {
    loop {
        let rem = data.remaining();
        let Some(&b) = rem.first() else {
            return ParseState::UriFragment;
        };
        match b {
            b'?' => {
                data.advance(1);
                return ParseState::Query;
            }
            b' ' => {
                data.advance(1);
                return ParseState::Version;
            }
            b'\r' | b'\n' => {
                if b == b'\r' && rem.len() < 2 {
                    return ParseState::UriFragment;
                }
                data.advance(1);
                if b == b'\r' && data.remaining().first() == Some(&b'\n') {
                    data.advance(1);
                }
                msg.version = Version::Http09;
                return ParseState::PreHeader;
            }
            _ => data.advance(1),
        }
    }
}

fn parse_query(msg: &mut Message, data: &mut ChunkBuffer) -> ParseState {
    if msg.query_storage.is_none() {
        msg.query_storage = Some(ChunkBuffer::new(
            "query",
            MAX_CHUNKS_URI,
            msg.chunk_size,
        ));
    }

    loop {
        let rem = data.remaining();
        let Some(&b) = rem.first() else {
            return ParseState::Query;
        };
        match b {
            b' ' => {
                data.advance(1);
                return ParseState::Version;
            }
            b'\r' | b'\n' => {
                if b == b'\r' && rem.len() < 2 {
                    return ParseState::Query;
                }
                data.advance(1);
                if b == b'\r' && data.remaining().first() == Some(&b'\n') {
                    data.advance(1);
                }
                msg.version = Version::Http09;
                return ParseState::PreHeader;
            }
            b => {
                let storage = msg.query_storage.as_mut().unwrap();
                if storage.append(&[b]).is_none() {
                    tracing::warn!("message: reject query too long");
                    return reject(msg, 400);
                }
                data.advance(1);
            }
        }
    }
}

fn parse_version(msg: &mut Message, data: &mut ChunkBuffer) -> ParseState {
    let rem = data.remaining();

    for version in Version::ALL {
        let token = version.wire().as_bytes();
        if rem.len() < token.len() {
            if token.starts_with(rem) {
                return ParseState::Version;
            }
            continue;
        }
        if &rem[..token.len()] != token {
            continue;
        }
        // token matched; a line break must follow
        let mut at = token.len();
        if rem.get(at) == Some(&b'\r') {
            at += 1;
        }
        match rem.get(at) {
            Some(&b'\n') => {
                msg.version = version;
                data.advance(at + 1);
                return ParseState::PreHeader;
            }
            Some(_) => {
                tracing::warn!("message: bad request line termination");
                return reject(msg, 400);
            }
            None => return ParseState::Version,
        }
    }

    if rem.len() < 8 {
        return ParseState::Version;
    }
    tracing::warn!("message: bad protocol version");
    reject(msg, 400)
}

/// Response status line, used when this side initiated the request.
fn parse_status(msg: &mut Message, data: &mut ChunkBuffer) -> ParseState {
    let rem = data.remaining();
    let Some(eol) = memchr(b'\n', rem) else {
        return ParseState::Status;
    };
    let line = &rem[..eol];

    let mut at = 0;
    for version in Version::ALL {
        let token = version.wire().as_bytes();
        if line.starts_with(token) {
            msg.version = version;
            at = token.len();
            break;
        }
    }
    if at == 0 {
        // tolerated: CGI-style responses may omit the version
        tracing::warn!("message: protocol version not supported");
    }
    while line.get(at) == Some(&b' ') {
        at += 1;
    }
    let mut result = 0u16;
    while let Some(d) = line.get(at).copied().filter(u8::is_ascii_digit) {
        result = result * 10 + (d - b'0') as u16;
        at += 1;
    }
    if result > 0 {
        msg.result = result;
    }
    data.advance(eol + 1);
    ParseState::Header
}

fn parse_preheader(msg: &mut Message) -> ParseState {
    if msg.uri.len() == 0 {
        tracing::warn!("message: reject URI bad formatting");
        return reject(msg, 400);
    }
    tracing::info!(
        method = msg.method().unwrap_or("-"),
        uri = %String::from_utf8_lossy(msg.uri.as_slice()),
        "new request"
    );
    if msg.version == Version::Http09 {
        // no headers follow a 0.9 request line
        return ParseState::End;
    }
    ParseState::Header
}

fn parse_header(msg: &mut Message, data: &mut ChunkBuffer) -> ParseState {
    loop {
        let rem = data.remaining();
        let Some(eol) = memchr(b'\n', rem) else {
            // partial line: leave it unconsumed until the rest arrives
            return ParseState::Header;
        };
        let mut line = &rem[..eol];
        if line.last() == Some(&b'\r') {
            line = &line[..line.len() - 1];
        }
        if line.is_empty() {
            data.advance(eol + 1);
            return ParseState::PostHeader;
        }
        if msg.headers_storage.append(line).is_none()
            || msg.headers_storage.append(b"\n").is_none()
        {
            tracing::warn!("message: header block too long");
            return reject(msg, 400);
        }
        data.advance(eol + 1);
    }
}

fn parse_postheader(msg: &mut Message, data: &mut ChunkBuffer) -> ParseState {
    msg.headers.fill(&msg.headers_storage, b':', b'\n');

    // explicit Keep-Alive only counts on HTTP/1.1; Upgrade locks the
    // socket for whatever protocol the handler installs
    if let Some(connection) = msg.headers.get(&msg.headers_storage, b"Connection") {
        if msg.version == Version::Http11 && contains_ignore_case(connection, b"keep-alive") {
            msg.keepalive = true;
        }
        if contains_ignore_case(connection, b"upgrade") {
            tracing::warn!("connection upgrading");
            msg.locked = true;
        }
    }

    if let Some(value) = msg.headers.get(&msg.headers_storage, b"Content-Length") {
        if let Some(length) = parse_decimal(value) {
            msg.content_length = Some(length);
            msg.content_remaining = Some(length);
        }
    }

    if let Some(cookie) = msg.headers.get(&msg.headers_storage, b"Cookie") {
        let chunk = msg.chunk_size;
        let chunks = cookie.len().div_ceil(chunk) + 1;
        let mut storage = ChunkBuffer::new("cookie", chunks, chunk);
        let _ = storage.append(cookie);
        let cookie_storage = msg.cookie_storage.insert(storage);
        msg.cookies.fill(cookie_storage, b'=', b';');
    }

    if let Some(query) = msg.query_storage.as_ref() {
        msg.queries.fill(query, b'=', b'&');
    }

    // the header bytes are consumed for good
    data.shrink();
    msg.state.parse_continue = false;
    ParseState::PreContent
}

fn parse_precontent(msg: &mut Message) -> ParseState {
    msg.content_packet = 0;

    let mut content_type = msg
        .headers
        .get(&msg.headers_storage, b"Content-Type")
        .unwrap_or(b"");
    if let Some(end) = memchr(b';', content_type) {
        content_type = &content_type[..end];
    }

    let form = msg.method_def().is_some_and(|m| m.allows_content())
        && content_type.eq_ignore_ascii_case(b"application/x-www-form-urlencoded");
    if form {
        // the body extends the query dictionary
        match msg.query_storage.as_mut() {
            Some(storage) => {
                let _ = storage.append(b"&");
            }
            None => {
                msg.query_storage = Some(ChunkBuffer::new(
                    "query",
                    MAX_CHUNKS_URI,
                    msg.chunk_size,
                ));
            }
        }
        return ParseState::PostContent;
    }
    if msg.content_remaining == Some(0) {
        tracing::debug!("no content inside request");
        return ParseState::End;
    }
    ParseState::Content
}

fn parse_content(msg: &mut Message, data: &mut ChunkBuffer) -> ParseState {
    if msg.content_remaining == Some(0) {
        return ParseState::End;
    }
    let avail = data.remaining().len();
    if avail == 0 {
        return ParseState::Content;
    }

    // one packet per call, bounded by the declared length (bytes past it
    // belong to the next request) and the packet buffer budget
    let mut take = match msg.content_remaining {
        Some(remaining) => avail.min(remaining as usize),
        None => avail,
    };
    take = take.min(MAX_CHUNKS_CONTENT * msg.chunk_size);

    msg.content.reset(0);
    let _ = msg.content.append(data.slice(data.cursor(), take));
    msg.content_packet = take;
    data.advance(take);

    match msg.content_remaining.as_mut() {
        Some(remaining) => {
            *remaining -= take as u64;
            if *remaining == 0 {
                ParseState::End
            } else {
                ParseState::Content
            }
        }
        None => ParseState::Content,
    }
}

fn parse_postcontent(msg: &mut Message, data: &mut ChunkBuffer) -> ParseState {
    let avail = data.remaining().len();
    if avail == 0 {
        return ParseState::PostContent;
    }
    let remaining = msg.content_remaining.unwrap_or(avail as u64);
    let take = avail.min(remaining as usize);

    let storage = msg.query_storage.as_mut().expect("opened in precontent");
    if storage.append(data.slice(data.cursor(), take)).is_none() {
        tracing::warn!("message: reject query too long");
        return reject(msg, 400);
    }
    data.advance(take);

    let remaining = remaining - take as u64;
    msg.content_remaining = Some(remaining);
    if remaining == 0 {
        let storage = msg.query_storage.as_ref().unwrap();
        msg.content_packet = 0;
        msg.content_length = Some(storage.len() as u64);
        msg.queries.fill(storage, b'=', b'&');
        return ParseState::End;
    }
    ParseState::PostContent
}

fn parse_decimal(bytes: &[u8]) -> Option<u64> {
    if bytes.is_empty() {
        return None;
    }
    let mut value = 0u64;
    for &b in bytes {
        if !b.is_ascii_digit() {
            return None;
        }
        value = value.checked_mul(10)?.checked_add((b - b'0') as u64)?;
    }
    Some(value)
}

pub(crate) fn contains_ignore_case(haystack: &[u8], needle: &[u8]) -> bool {
    if needle.is_empty() || haystack.len() < needle.len() {
        return false;
    }
    haystack
        .windows(needle.len())
        .any(|w| w.eq_ignore_ascii_case(needle))
}

#[cfg(test)]
mod parser_tests {
    use super::*;
    use crate::http::types::default_methods;
    use crate::limits::DEFAULT_CHUNK_SIZE;
    use std::sync::Arc;

    fn request() -> Message {
        Message::request(Arc::new(default_methods()), DEFAULT_CHUNK_SIZE)
    }

    fn sockdata() -> ChunkBuffer {
        ChunkBuffer::unbounded("sockdata", DEFAULT_CHUNK_SIZE)
    }

    /// Feeds `input` split at every position in `splits`, compacting the
    /// buffer between chunks the way the client driver does. Returns the
    /// final outcome and the body packets concatenated in arrival order.
    fn feed(msg: &mut Message, input: &[u8], splits: &[usize]) -> (Outcome, Vec<u8>) {
        let mut data = sockdata();
        let mut last = Outcome::Incomplete;
        let mut body = Vec::new();
        let mut previous = 0;
        for &split in splits.iter().chain(std::iter::once(&input.len())) {
            data.shrink();
            data.append(&input[previous..split]).unwrap();
            previous = split;
            loop {
                last = parse(msg, &mut data);
                if last != Outcome::Continue {
                    break;
                }
                body.extend_from_slice(msg.content().unwrap_or(b""));
                if data.is_drained() {
                    break;
                }
            }
        }
        if last == Outcome::Success {
            body.extend_from_slice(msg.content().unwrap_or(b""));
        }
        (last, body)
    }

    fn parse_one(input: &[u8]) -> (Message, Outcome) {
        let mut msg = request();
        let (outcome, _) = feed(&mut msg, input, &[]);
        (msg, outcome)
    }

    #[test]
    fn minimal_get() {
        let (msg, outcome) = parse_one(b"GET / HTTP/1.0\r\nHost: x\r\n\r\n");
        assert_eq!(outcome, Outcome::Success);
        assert_eq!(msg.method(), Some("GET"));
        assert_eq!(msg.uri.as_slice(), b"/");
        assert_eq!(msg.version(), Version::Http10);
        assert_eq!(msg.header(b"host"), Some(b"x" as &[u8]));
        assert!(!msg.keepalive);
    }

    #[test]
    fn chunking_is_transparent() {
        let input = b"POST /a/b?k=v HTTP/1.1\r\nHost: h\r\nContent-Length: 4\r\n\r\nbody";
        let (whole, whole_body) = {
            let mut msg = request();
            let (outcome, body) = feed(&mut msg, input, &[]);
            assert_eq!(outcome, Outcome::Success);
            (msg, body)
        };
        assert_eq!(whole_body, b"body");

        for split in 1..input.len() {
            let mut msg = request();
            let (outcome, body) = feed(&mut msg, input, &[split]);
            assert_eq!(outcome, Outcome::Success, "split at {split}");
            assert_eq!(msg.method(), whole.method());
            assert_eq!(msg.uri.as_slice(), whole.uri.as_slice());
            assert_eq!(msg.version(), whole.version());
            assert_eq!(msg.header(b"host"), whole.header(b"host"));
            assert_eq!(msg.content_length(), whole.content_length());
            assert_eq!(body, whole_body, "split at {split}");
        }
    }

    #[test]
    fn uri_normalization() {
        #[rustfmt::skip]
        let cases: &[(&[u8], Result<&[u8], u16>)] = &[
            (b"GET /a/b HTTP/1.1\r\n\r\n",      Ok(b"/a/b")),
            (b"GET //a///b HTTP/1.1\r\n\r\n",   Ok(b"/a/b")),
            (b"GET /a/../b HTTP/1.1\r\n\r\n",   Ok(b"/b")),
            (b"GET /a/b/.. HTTP/1.1\r\n\r\n",   Ok(b"/a")),
            (b"GET /%41%7a HTTP/1.1\r\n\r\n",   Ok(b"/Az")),
            (b"GET /a%20b HTTP/1.1\r\n\r\n",    Ok(b"/a b")),

            (b"GET /.. HTTP/1.1\r\n\r\n",       Err(400)),
            (b"GET /x/%2e%2e/y HTTP/1.1\r\n\r\n", Err(400)),
            (b"GET /%2fetc HTTP/1.1\r\n\r\n",   Err(400)),
            (b"GET /%zz HTTP/1.1\r\n\r\n",      Err(400)),
            (b"GET /%0a HTTP/1.1\r\n\r\n",      Err(400)),
            (b"GET abc HTTP/1.1\r\n\r\n",       Err(400)),
        ];

        for (input, expected) in cases {
            let (msg, outcome) = parse_one(input);
            match expected {
                Ok(uri) => {
                    assert_eq!(outcome, Outcome::Success, "input {:?}", input);
                    assert_eq!(msg.uri.as_slice(), *uri, "input {:?}", input);
                }
                Err(result) => {
                    assert_eq!(outcome, Outcome::Reject, "input {:?}", input);
                    assert_eq!(msg.result(), *result, "input {:?}", input);
                }
            }
        }
    }

    #[test]
    fn collapsed_uri_never_contains_dotdot() {
        // every prefix of a dot-dot path either collapses or rejects
        let inputs: &[&[u8]] = &[
            b"GET /a/../../b HTTP/1.1\r\n\r\n",
            b"GET /a/b/../.. HTTP/1.1\r\n\r\n",
            b"GET /../a HTTP/1.1\r\n\r\n",
        ];
        for input in inputs {
            let (msg, outcome) = parse_one(input);
            if outcome == Outcome::Success {
                let uri = msg.uri.as_slice();
                assert!(
                    !uri.windows(2).any(|w| w == b".."),
                    "uri {:?} from {:?}",
                    uri,
                    input
                );
            } else {
                assert_eq!(msg.result(), 400);
            }
        }
    }

    #[test]
    fn method_table_rejections() {
        let (msg, outcome) = parse_one(b"BREW /pot HTTP/1.1\r\n\r\n");
        assert_eq!(outcome, Outcome::Reject);
        assert_eq!(msg.result(), 405);
    }

    #[test]
    fn version_tokens() {
        #[rustfmt::skip]
        let cases: &[(&[u8], Result<Version, u16>)] = &[
            (b"GET / HTTP/1.1\r\n\r\n", Ok(Version::Http11)),
            (b"GET / HTTP/1.0\r\n\r\n", Ok(Version::Http10)),
            (b"GET / HTTP/1.1\n\n",     Ok(Version::Http11)),
            (b"GET / HTTP/2\r\n\r\n",   Ok(Version::Http2)),
            (b"GET /\r\n",              Ok(Version::Http09)),

            (b"GET / HTTP/1.2\r\n\r\n", Err(400)),
            (b"GET / http/1.1\r\n\r\n", Err(400)),
            (b"GET / HTTP/1.1 \r\n\r\n", Err(400)),
        ];

        for (input, expected) in cases {
            let (msg, outcome) = parse_one(input);
            match expected {
                Ok(version) => {
                    assert_eq!(outcome, Outcome::Success, "input {:?}", input);
                    assert_eq!(msg.version(), *version, "input {:?}", input);
                }
                Err(result) => {
                    assert_eq!(outcome, Outcome::Reject, "input {:?}", input);
                    assert_eq!(msg.result(), *result, "input {:?}", input);
                }
            }
        }
    }

    #[test]
    fn uri_too_long_is_414() {
        let mut input = b"GET /".to_vec();
        input.extend_from_slice(&[b'a'; 10_000]);
        input.extend_from_slice(b" HTTP/1.1\r\n\r\n");
        let (msg, outcome) = parse_one(&input);
        assert_eq!(outcome, Outcome::Reject);
        assert_eq!(msg.result(), 414);
    }

    #[test]
    fn header_block_too_long_is_400() {
        let mut input = b"GET / HTTP/1.1\r\n".to_vec();
        for i in 0..64 {
            input.extend_from_slice(format!("X-Filler-{i}: {}\r\n", "v".repeat(32)).as_bytes());
        }
        input.extend_from_slice(b"\r\n");
        let (msg, outcome) = parse_one(&input);
        assert_eq!(outcome, Outcome::Reject);
        assert_eq!(msg.result(), 400);
    }

    #[test]
    fn connection_flags() {
        let (msg, _) = parse_one(b"GET / HTTP/1.1\r\nConnection: Keep-Alive\r\n\r\n");
        assert!(msg.keepalive);
        assert!(!msg.locked);

        // keep-alive is only honoured on 1.1
        let (msg, _) = parse_one(b"GET / HTTP/1.0\r\nConnection: Keep-Alive\r\n\r\n");
        assert!(!msg.keepalive);

        let (msg, _) = parse_one(b"GET / HTTP/1.1\r\nConnection: Upgrade\r\n\r\n");
        assert!(msg.locked);

        let (msg, _) = parse_one(b"GET / HTTP/1.1\r\nConnection: keep-alive, Upgrade\r\n\r\n");
        assert!(msg.keepalive);
        assert!(msg.locked);
    }

    #[test]
    fn body_stops_at_declared_length() {
        let input = b"POST /u HTTP/1.1\r\nContent-Length: 4\r\n\r\nbodyGET /next";
        let mut msg = request();
        let mut data = sockdata();
        data.append(input).unwrap();

        assert_eq!(parse(&mut msg, &mut data), Outcome::Success);
        assert_eq!(msg.content(), Some(b"body" as &[u8]));
        // surplus bytes stay for the next request
        assert_eq!(data.remaining(), b"GET /next");
    }

    #[test]
    fn urlencoded_body_feeds_parameters() {
        let input =
            b"POST /f?x=0 HTTP/1.1\r\nContent-Type: application/x-www-form-urlencoded\r\nContent-Length: 7\r\n\r\na=1&b=2";
        for splits in [&[] as &[usize], &[20], &[50], &[63]] {
            let mut msg = request();
            assert_eq!(feed(&mut msg, input, splits).0, Outcome::Success);
            assert_eq!(msg.parameter(b"x"), Some(b"0" as &[u8]));
            assert_eq!(msg.parameter(b"a"), Some(b"1" as &[u8]));
            assert_eq!(msg.parameter(b"b"), Some(b"2" as &[u8]));
        }
    }

    #[test]
    fn cookies_are_parsed() {
        let (msg, outcome) = parse_one(b"GET / HTTP/1.1\r\nCookie: sid=abc; theme=dark\r\n\r\n");
        assert_eq!(outcome, Outcome::Success);
        assert_eq!(msg.cookie(b"sid"), Some(b"abc" as &[u8]));
        assert_eq!(msg.cookie(b"theme"), Some(b"dark" as &[u8]));
        assert_eq!(msg.cookie(b"missing"), None);
    }

    #[test]
    fn empty_uri_is_rejected() {
        let (msg, outcome) = parse_one(b"GET  HTTP/1.1\r\n\r\n");
        assert_eq!(outcome, Outcome::Reject);
        assert_eq!(msg.result(), 400);
    }

    #[test]
    fn content_arrives_in_packets() {
        let declared = 300usize; // larger than the packet buffer budget
        let mut input = format!("POST /u HTTP/1.1\r\nContent-Length: {declared}\r\n\r\n")
            .into_bytes();
        input.extend_from_slice(&vec![b'x'; declared]);

        let mut msg = request();
        let mut data = sockdata();
        let mut received = 0usize;
        let mut fed = 0usize;
        loop {
            if fed < input.len() {
                data.shrink();
                let room = 128.min(input.len() - fed);
                data.append(&input[fed..fed + room]).unwrap();
                fed += room;
            }
            match parse(&mut msg, &mut data) {
                Outcome::Continue => received += msg.content_packet,
                Outcome::Success => {
                    received += msg.content_packet;
                    break;
                }
                Outcome::Incomplete => continue,
                other => panic!("unexpected {other:?}"),
            }
        }
        assert_eq!(received, declared);
    }

    #[test]
    fn status_line_parse_for_client_mode() {
        let mut msg = request();
        msg.state.parse = ParseState::Status;
        msg.content_length = None;
        msg.content_remaining = None;

        let mut data = sockdata();
        data.append(b"HTTP/1.1 404 Not Found\r\nContent-Length: 2\r\n\r\nno")
            .unwrap();
        let outcome = parse(&mut msg, &mut data);
        assert_eq!(outcome, Outcome::Success);
        assert_eq!(msg.result(), 404);
        assert_eq!(msg.version(), Version::Http11);
        assert_eq!(msg.content(), Some(b"no" as &[u8]));
    }

    #[test]
    fn contains_ignore_case_scan() {
        assert!(contains_ignore_case(b"Keep-Alive, Upgrade", b"upgrade"));
        assert!(contains_ignore_case(b"KEEP-ALIVE", b"keep-alive"));
        assert!(!contains_ignore_case(b"close", b"keep-alive"));
        assert!(!contains_ignore_case(b"", b"x"));
    }
}
