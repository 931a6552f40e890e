//! Incremental TLS ClientHello parser.
//!
//! [`try_extract_sni`] is called repeatedly against the growing byte
//! buffer of one direction of a flow. It distinguishes "not yet enough
//! bytes" from "this is definitely not a ClientHello carrying SNI", so the
//! caller knows whether to wait for more data or give up on the stream.
//!
//! All integers are unsigned big-endian. Nothing here indexes past the
//! buffer; every read goes through [`Cursor`].

const CONTENT_TYPE_HANDSHAKE: u8 = 0x16;
const MIN_RECORD_VERSION: u16 = 0x0301;
const HANDSHAKE_CLIENT_HELLO: u8 = 0x01;
const EXT_SERVER_NAME: u16 = 0x0000;
const NAME_TYPE_HOST_NAME: u8 = 0x00;

/// Handshake length (3) + client version (2) + random (32).
const HELLO_FIXED_PREFIX: usize = 3 + 2 + 32;

/// Result of one parse attempt.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SniOutcome {
    /// The first host_name entry of the server_name extension.
    Found(String),
    /// The buffer ends before a definitive answer; retry with more bytes.
    NeedMoreData,
    /// Not a TLS ClientHello, or a ClientHello without SNI. Stop trying.
    NotApplicable,
}

/// Why a parse attempt stopped short of a hostname.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Stop {
    NeedMore,
    Reject,
}

/// Parses a TLS record from the start of `data` and extracts the SNI
/// host_name of a ClientHello.
///
/// Structural mismatches (content type, record version, handshake type)
/// are reported as [`SniOutcome::NotApplicable`] as soon as the relevant
/// byte is available. Running off the end of the buffer while the record
/// is still incomplete is [`SniOutcome::NeedMoreData`]; running off the
/// end of a complete record is [`SniOutcome::NotApplicable`].
pub fn try_extract_sni(data: &[u8]) -> SniOutcome {
    match parse_client_hello(data) {
        Ok(Some(host)) => SniOutcome::Found(host),
        Ok(None) | Err(Stop::Reject) => SniOutcome::NotApplicable,
        Err(Stop::NeedMore) => SniOutcome::NeedMoreData,
    }
}

fn parse_client_hello(data: &[u8]) -> Result<Option<String>, Stop> {
    let mut cur = Cursor::new(data);

    // ── Record header ────────────────────────────────────────────────────────
    if cur.u8()? != CONTENT_TYPE_HANDSHAKE {
        return Err(Stop::Reject);
    }
    if cur.u16()? < MIN_RECORD_VERSION {
        return Err(Stop::Reject);
    }
    let record_len = cur.u16()? as usize;
    cur.limit(record_len);

    // ── Handshake header ─────────────────────────────────────────────────────
    if cur.u8()? != HANDSHAKE_CLIENT_HELLO {
        return Err(Stop::Reject);
    }
    cur.skip(HELLO_FIXED_PREFIX)?;

    let session_id_len = cur.u8()? as usize;
    cur.skip(session_id_len)?;

    let cipher_suites_len = cur.u16()? as usize;
    cur.skip(cipher_suites_len)?;

    let compression_len = cur.u8()? as usize;
    cur.skip(compression_len)?;

    if cur.remaining() == 0 {
        // No extensions block at all.
        return Err(cur.short());
    }

    // ── Extensions ───────────────────────────────────────────────────────────
    let mut remaining = cur.u16()? as usize;
    while remaining > 0 {
        let ext_type = cur.u16()?;
        let ext_len = cur.u16()? as usize;
        remaining = remaining.saturating_sub(4 + ext_len);

        if ext_type == EXT_SERVER_NAME {
            let mut body = cur.take(ext_len)?;
            if let Some(host) = first_host_name(&mut body)? {
                return Ok(Some(host));
            }
        } else {
            cur.skip(ext_len)?;
        }
    }

    Ok(None)
}

/// Walks a server_name extension body and returns the first host_name.
fn first_host_name(body: &mut Cursor<'_>) -> Result<Option<String>, Stop> {
    let list_len = body.u16()? as usize;
    let mut list = body.take(list_len)?;

    while list.remaining() > 0 {
        let name_type = list.u8()?;
        let name_len = list.u16()? as usize;
        let name = list.bytes(name_len)?;
        if name_type == NAME_TYPE_HOST_NAME {
            // Passed through as-is; odd bytes are the sink's problem.
            return Ok(Some(String::from_utf8_lossy(name).into_owned()));
        }
    }

    Ok(None)
}

/// Bounded reader over the buffered bytes of one parse attempt.
///
/// `end` is the effective bound: the declared record end when the whole
/// record is buffered, otherwise the end of the available bytes. Reading
/// past it yields `NeedMore` in the second case and `Reject` in the first.
struct Cursor<'a> {
    buf:       &'a [u8],
    pos:       usize,
    end:       usize,
    truncated: bool,
}

impl<'a> Cursor<'a> {
    fn new(buf: &'a [u8]) -> Self {
        Self { buf, pos: 0, end: buf.len(), truncated: true }
    }

    fn limit(&mut self, len: usize) {
        let declared_end = self.pos + len;
        if declared_end <= self.buf.len() {
            self.end = declared_end;
            self.truncated = false;
        } else {
            self.end = self.buf.len();
            self.truncated = true;
        }
    }

    fn remaining(&self) -> usize {
        self.end - self.pos
    }

    fn short(&self) -> Stop {
        if self.truncated { Stop::NeedMore } else { Stop::Reject }
    }

    fn bytes(&mut self, n: usize) -> Result<&'a [u8], Stop> {
        if n > self.remaining() {
            return Err(self.short());
        }
        let slice = &self.buf[self.pos..self.pos + n];
        self.pos += n;
        Ok(slice)
    }

    fn skip(&mut self, n: usize) -> Result<(), Stop> {
        self.bytes(n).map(|_| ())
    }

    fn u8(&mut self) -> Result<u8, Stop> {
        Ok(self.bytes(1)?[0])
    }

    fn u16(&mut self) -> Result<u16, Stop> {
        let b = self.bytes(2)?;
        Ok(u16::from_be_bytes([b[0], b[1]]))
    }

    /// Splits off the next `n` bytes as a complete sub-structure.
    fn take(&mut self, n: usize) -> Result<Cursor<'a>, Stop> {
        let buf = self.bytes(n)?;
        Ok(Cursor { buf, pos: 0, end: buf.len(), truncated: false })
    }
}
