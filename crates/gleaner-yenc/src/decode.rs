use std::collections::HashMap;

use crc32fast::Hasher;

use gleaner_core::{ArticleSink, GrabError};

use crate::error::DecodeError;

/// How many bytes we read before giving up on receiving a yEnc header.
const MAX_HEADER_BUFFER: usize = 1024;

/// A parsed `=ybegin` line.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Header {
    pub name: String,
    pub line: u64,
    pub size: u64,
    pub multipart: bool,
    pub part: u64,
    pub total: u64,
}

/// A parsed `=ypart` line: the 1-based inclusive byte range this part
/// occupies within the whole file.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PartHeader {
    pub begin: u64,
    pub end: u64,
}

/// A parsed `=yend` line.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Trailer {
    pub size: u64,
    pub crc32: Option<String>,
    pub pcrc32: Option<String>,
}

/// Wraps an [`ArticleSink`], decoding yEnc as raw article bytes are
/// written to it. A decoder handles exactly one yEnc file (or one part of
/// a multipart file); once the trailer has been seen and verified, further
/// writes are no-ops.
pub struct Decoder {
    inner: Box<dyn ArticleSink>,
    buf: Vec<u8>,
    header: Option<Header>,
    part_header: Option<PartHeader>,
    trailer: Option<Trailer>,
    crc: Hasher,
    next_byte_is_critical: bool,
    bytes_before_header: usize,
    finished: bool,
    failed: Option<DecodeError>,
    decode_map: [u8; 256],
    critical_decode_map: [u8; 256],
    line_out: Vec<u8>,
}

impl Decoder {
    pub fn new(inner: Box<dyn ArticleSink>) -> Self {
        let mut decode_map = [0u8; 256];
        let mut critical_decode_map = [0u8; 256];
        for i in 0..256 {
            decode_map[i] = (i as u8).wrapping_sub(42);
            critical_decode_map[i] = decode_map[i].wrapping_sub(64);
        }
        Self {
            inner,
            buf: Vec::new(),
            header: None,
            part_header: None,
            trailer: None,
            crc: Hasher::new(),
            next_byte_is_critical: false,
            bytes_before_header: 0,
            finished: false,
            failed: None,
            decode_map,
            critical_decode_map,
            line_out: Vec::new(),
        }
    }

    /// The filename announced by the header, once one has been parsed.
    pub fn filename(&self) -> Option<&str> {
        self.header.as_ref().map(|h| h.name.as_str())
    }

    pub fn header(&self) -> Option<&Header> {
        self.header.as_ref()
    }

    pub fn part_header(&self) -> Option<&PartHeader> {
        self.part_header.as_ref()
    }

    pub fn trailer(&self) -> Option<&Trailer> {
        self.trailer.as_ref()
    }

    fn take_line(&mut self) -> Option<Vec<u8>> {
        let pos = self.buf.iter().position(|&b| b == b'\n')?;
        let rest = self.buf.split_off(pos + 1);
        let line = std::mem::replace(&mut self.buf, rest);
        Some(line)
    }

    async fn run(&mut self) -> Result<(), DecodeError> {
        while let Some(line) = self.take_line() {
            if self.finished {
                return Ok(());
            }
            let awaiting_part = self
                .header
                .as_ref()
                .is_some_and(|h| h.multipart && self.part_header.is_none());

            if self.header.is_none() {
                if self.bytes_before_header >= MAX_HEADER_BUFFER {
                    return Err(DecodeError(format!(
                        "no yEnc header found in first {MAX_HEADER_BUFFER} bytes"
                    )));
                }
                if !line.starts_with(b"=ybegin ") {
                    self.bytes_before_header += line.len();
                    continue;
                }
                self.header = Some(parse_header(trim_crlf(&line))?);
            } else if awaiting_part {
                if !line.starts_with(b"=ypart ") {
                    return Err(DecodeError(
                        "no yEnc part header immediately followed multipart header".into(),
                    ));
                }
                self.part_header = Some(parse_part_header(trim_crlf(&line))?);
            } else {
                let line = trim_crlf(&line);
                if line.starts_with(b"=yend ") {
                    let trailer = parse_trailer(line)?;
                    let verdict = self.verify_crc32s(&trailer);
                    self.trailer = Some(trailer);
                    self.finished = true;
                    return verdict;
                }
                self.decode_line(line).await?;
            }
        }
        Ok(())
    }

    /// Decode a single line of yEnc data, forwarding it to the inner sink
    /// and the running CRC32.
    async fn decode_line(&mut self, line: &[u8]) -> Result<(), DecodeError> {
        self.line_out.clear();
        for &b in line {
            if self.next_byte_is_critical {
                self.line_out.push(self.critical_decode_map[b as usize]);
                self.next_byte_is_critical = false;
            } else if b == b'=' {
                self.next_byte_is_critical = true;
            } else {
                self.line_out.push(self.decode_map[b as usize]);
            }
        }
        self.crc.update(&self.line_out);
        let out = std::mem::take(&mut self.line_out);
        self.inner
            .write(&out)
            .await
            .map_err(|e| DecodeError(e.to_string()))?;
        Ok(())
    }

    /// Verify any CRC32s in the trailer. If a pcrc32 (the CRC of this
    /// part) is present, the whole-file crc32 is ignored: a part decoder
    /// has no business with the file's larger context.
    fn verify_crc32s(&self, trailer: &Trailer) -> Result<(), DecodeError> {
        let sum = self.crc.clone().finalize();
        if let Some(pcrc32) = &trailer.pcrc32 {
            if !crc_matches(sum, pcrc32) {
                return Err(DecodeError(format!(
                    "invalid part checksum {pcrc32} - wanted {sum:x}"
                )));
            }
        } else if let Some(crc32) = &trailer.crc32
            && !crc_matches(sum, crc32)
        {
            return Err(DecodeError(format!(
                "invalid checksum {crc32} - wanted {sum:x}"
            )));
        }
        Ok(())
    }
}

#[async_trait::async_trait]
impl ArticleSink for Decoder {
    async fn write(&mut self, buf: &[u8]) -> Result<(), GrabError> {
        if self.finished {
            return Ok(());
        }
        if let Some(err) = &self.failed {
            return Err(err.clone().into());
        }
        self.buf.extend_from_slice(buf);
        if let Err(err) = self.run().await {
            self.failed = Some(err.clone());
            return Err(err.into());
        }
        Ok(())
    }

    async fn close(&mut self) -> Result<(), GrabError> {
        self.inner.close().await
    }
}

fn trim_crlf(line: &[u8]) -> &[u8] {
    let mut end = line.len();
    while end > 0 && (line[end - 1] == b'\n' || line[end - 1] == b'\r') {
        end -= 1;
    }
    &line[..end]
}

/// yEnc is terribad and doesn't specify how the trailer presents a CRC32:
/// accept upper or lower case, zero padded or not.
fn crc_matches(sum: u32, digest: &str) -> bool {
    let digest = digest.trim();
    digest.eq_ignore_ascii_case(&format!("{sum:x}")) || digest.eq_ignore_ascii_case(&format!("{sum:08x}"))
}

/// Convert a yEnc header (or trailer) line to a map of key/value pairs.
fn header_to_map(line: &[u8], kind: &str) -> Result<HashMap<String, String>, DecodeError> {
    let malformed = || DecodeError(format!("malformed yEnc {kind}: {}", String::from_utf8_lossy(line)));

    if !line.contains(&b' ') {
        return Err(malformed());
    }

    let mut map = HashMap::new();
    for token in line.split(|&b| b == b' ') {
        if token.is_empty() {
            continue;
        }
        if !token.contains(&b'=') {
            return Err(malformed());
        }
        let text = String::from_utf8_lossy(token);
        if let Some((key, value)) = text.split_once('=')
            && !key.is_empty()
        {
            map.insert(key.to_string(), value.to_string());
        }
        // Tokens with no left-hand name (=ybegin, =ypart, =yend) are the
        // line introducer, not a field.
    }
    Ok(map)
}

fn required_u64(
    map: &HashMap<String, String>,
    key: &str,
    line: &[u8],
    kind: &str,
) -> Result<u64, DecodeError> {
    map.get(key)
        .and_then(|v| v.parse().ok())
        .ok_or_else(|| DecodeError(format!("malformed yEnc {kind}: {}", String::from_utf8_lossy(line))))
}

fn parse_header(line: &[u8]) -> Result<Header, DecodeError> {
    let map = header_to_map(line, "header")?;
    let mut header = Header {
        name: map.get("name").cloned().unwrap_or_default(),
        line: required_u64(&map, "line", line, "header")?,
        size: required_u64(&map, "size", line, "header")?,
        multipart: false,
        part: 0,
        total: 0,
    };

    // Nothing more to do for a single-part header.
    match map.get("part") {
        None => return Ok(header),
        Some(_) => {
            header.part = required_u64(&map, "part", line, "header")?;
            header.multipart = true;
        }
    }

    // total is not required by yEnc 1.1.
    if map.contains_key("total") {
        header.total = required_u64(&map, "total", line, "header")?;
    }
    Ok(header)
}

fn parse_part_header(line: &[u8]) -> Result<PartHeader, DecodeError> {
    let map = header_to_map(line, "part header")?;
    Ok(PartHeader {
        begin: required_u64(&map, "begin", line, "part header")?,
        end: required_u64(&map, "end", line, "part header")?,
    })
}

fn parse_trailer(line: &[u8]) -> Result<Trailer, DecodeError> {
    let map = header_to_map(line, "part trailer")?;
    Ok(Trailer {
        size: required_u64(&map, "size", line, "part trailer")?,
        crc32: map.get("crc32").cloned(),
        pcrc32: map.get("pcrc32").cloned(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use gleaner_core::sink::BufferSink;

    /// Encode plaintext the way a posting client would, escaping the
    /// critical bytes NUL, LF, CR and '='.
    fn encode(plain: &[u8]) -> Vec<u8> {
        let mut out = Vec::new();
        for &b in plain {
            let e = b.wrapping_add(42);
            match e {
                0x00 | b'\n' | b'\r' | b'=' => {
                    out.push(b'=');
                    out.push(e.wrapping_add(64));
                }
                _ => out.push(e),
            }
        }
        out
    }

    fn single_part_payload(plain: &[u8]) -> Vec<u8> {
        let crc = crc32fast::hash(plain);
        let mut payload = Vec::new();
        payload.extend_from_slice(
            format!("=ybegin line=128 size={} name=test.bin\r\n", plain.len()).as_bytes(),
        );
        payload.extend_from_slice(&encode(plain));
        payload.extend_from_slice(b"\r\n");
        payload.extend_from_slice(format!("=yend size={} pcrc32={:08x}\r\n", plain.len(), crc).as_bytes());
        payload
    }

    async fn feed(decoder: &mut Decoder, payload: &[u8], chunk: usize) -> Result<(), GrabError> {
        for piece in payload.chunks(chunk.max(1)) {
            decoder.write(piece).await?;
        }
        Ok(())
    }

    #[tokio::test]
    async fn decodes_single_part_payload() {
        let sink = BufferSink::new();
        let mut decoder = Decoder::new(Box::new(sink.clone()));

        feed(&mut decoder, &single_part_payload(b"hello yenc"), 4096)
            .await
            .unwrap();

        assert_eq!(sink.contents(), b"hello yenc");
        assert_eq!(decoder.filename(), Some("test.bin"));
    }

    #[tokio::test]
    async fn round_trips_at_arbitrary_chunk_boundaries() {
        let plain: Vec<u8> = (0u16..2048).map(|i| (i % 251) as u8).collect();
        let payload = single_part_payload(&plain);

        for chunk in [1, 2, 3, 7, 64, 1000, payload.len()] {
            let sink = BufferSink::new();
            let mut decoder = Decoder::new(Box::new(sink.clone()));
            feed(&mut decoder, &payload, chunk).await.unwrap();
            assert_eq!(sink.contents(), plain, "chunk size {chunk}");
        }
    }

    #[tokio::test]
    async fn decodes_multipart_payload() {
        let plain = b"part two of something much larger";
        let crc = crc32fast::hash(plain);
        let mut payload = Vec::new();
        payload.extend_from_slice(b"=ybegin part=2 total=3 line=128 size=99 name=big.rar\r\n");
        payload.extend_from_slice(format!("=ypart begin=34 end={}\r\n", 33 + plain.len()).as_bytes());
        payload.extend_from_slice(&encode(plain));
        payload.extend_from_slice(b"\r\n");
        payload.extend_from_slice(
            format!("=yend size={} pcrc32={:08x}\r\n", plain.len(), crc).as_bytes(),
        );

        let sink = BufferSink::new();
        let mut decoder = Decoder::new(Box::new(sink.clone()));
        feed(&mut decoder, &payload, 17).await.unwrap();
        assert_eq!(sink.contents(), plain);
    }

    #[tokio::test]
    async fn multipart_without_part_header_fails() {
        let sink = BufferSink::new();
        let mut decoder = Decoder::new(Box::new(sink));
        let payload = b"=ybegin part=1 line=128 size=3 name=a\r\nabc\r\n";

        let err = decoder.write(payload).await.unwrap_err();
        assert_eq!(
            err,
            GrabError::Decode("no yEnc part header immediately followed multipart header".into())
        );
    }

    #[tokio::test]
    async fn header_budget_is_1024_bytes() {
        let sink = BufferSink::new();
        let mut decoder = Decoder::new(Box::new(sink));

        let filler = vec![b'x'; 80];
        let mut payload = Vec::new();
        for _ in 0..14 {
            payload.extend_from_slice(&filler);
            payload.extend_from_slice(b"\r\n");
        }

        let err = decoder.write(&payload).await.unwrap_err();
        assert_eq!(
            err,
            GrabError::Decode("no yEnc header found in first 1024 bytes".into())
        );
    }

    #[tokio::test]
    async fn junk_before_header_is_tolerated_within_budget() {
        let plain = b"tolerant";
        let mut payload = Vec::new();
        payload.extend_from_slice(b"X-Header: article metadata\r\n\r\n");
        payload.extend_from_slice(&single_part_payload(plain));

        let sink = BufferSink::new();
        let mut decoder = Decoder::new(Box::new(sink.clone()));
        feed(&mut decoder, &payload, 9).await.unwrap();
        assert_eq!(sink.contents(), plain);
    }

    #[tokio::test]
    async fn pcrc32_takes_precedence_over_crc32() {
        let plain = b"precedence";
        let crc = crc32fast::hash(plain);
        let mut payload = Vec::new();
        payload.extend_from_slice(
            format!("=ybegin line=128 size={} name=p.bin\r\n", plain.len()).as_bytes(),
        );
        payload.extend_from_slice(&encode(plain));
        payload.extend_from_slice(b"\r\n");
        // The whole-file crc32 is deliberately wrong; only pcrc32 counts.
        payload.extend_from_slice(
            format!(
                "=yend size={} crc32=deadbeef pcrc32={:08x}\r\n",
                plain.len(),
                crc
            )
            .as_bytes(),
        );

        let sink = BufferSink::new();
        let mut decoder = Decoder::new(Box::new(sink.clone()));
        decoder.write(&payload).await.unwrap();
        assert_eq!(sink.contents(), plain);
    }

    #[tokio::test]
    async fn crc_mismatch_reports_both_digests() {
        let plain = b"checksummed";
        let computed = crc32fast::hash(plain);
        let mut payload = Vec::new();
        payload.extend_from_slice(
            format!("=ybegin line=128 size={} name=c.bin\r\n", plain.len()).as_bytes(),
        );
        payload.extend_from_slice(&encode(plain));
        payload.extend_from_slice(b"\r\n");
        payload.extend_from_slice(format!("=yend size={} pcrc32=00000001\r\n", plain.len()).as_bytes());

        let sink = BufferSink::new();
        let mut decoder = Decoder::new(Box::new(sink.clone()));
        let err = feed(&mut decoder, &payload, 5).await.unwrap_err();

        let message = err.to_string();
        assert!(message.contains("00000001"), "{message}");
        assert!(message.contains(&format!("{computed:x}")), "{message}");
        // The sink received the full decoded bytes before the error was
        // raised.
        assert_eq!(sink.contents(), plain);
    }

    #[tokio::test]
    async fn crc_matching_accepts_all_presentations() {
        assert!(crc_matches(0x352441c2, "352441c2"));
        assert!(crc_matches(0x352441c2, "352441C2"));
        assert!(crc_matches(0x00ab_cdef, "abcdef"));
        assert!(crc_matches(0x00ab_cdef, "00abcdef"));
        assert!(crc_matches(0x00ab_cdef, "00ABCDEF"));
        assert!(!crc_matches(0x00ab_cdef, "00abcde0"));
    }

    #[tokio::test]
    async fn missing_crcs_are_accepted() {
        let plain = b"no checksum at all";
        let mut payload = Vec::new();
        payload.extend_from_slice(
            format!("=ybegin line=128 size={} name=n.bin\r\n", plain.len()).as_bytes(),
        );
        payload.extend_from_slice(&encode(plain));
        payload.extend_from_slice(b"\r\n");
        payload.extend_from_slice(format!("=yend size={}\r\n", plain.len()).as_bytes());

        let sink = BufferSink::new();
        let mut decoder = Decoder::new(Box::new(sink.clone()));
        decoder.write(&payload).await.unwrap();
        assert_eq!(sink.contents(), plain);
    }

    #[tokio::test]
    async fn malformed_header_reports_offending_line() {
        let sink = BufferSink::new();
        let mut decoder = Decoder::new(Box::new(sink));

        let err = decoder
            .write(b"=ybegin line=abc size=3 name=x\r\n")
            .await
            .unwrap_err();
        let message = err.to_string();
        assert!(message.starts_with("malformed yEnc header:"), "{message}");
        assert!(message.contains("line=abc"), "{message}");
    }

    #[tokio::test]
    async fn writes_after_trailer_are_ignored() {
        let plain = b"done";
        let sink = BufferSink::new();
        let mut decoder = Decoder::new(Box::new(sink.clone()));

        decoder.write(&single_part_payload(plain)).await.unwrap();
        decoder.write(b"trailing garbage\r\n").await.unwrap();

        assert_eq!(sink.contents(), plain);
    }

    #[tokio::test]
    async fn lf_only_line_endings_are_tolerated() {
        let plain = b"unix endings";
        let crc = crc32fast::hash(plain);
        let mut payload = Vec::new();
        payload.extend_from_slice(
            format!("=ybegin line=128 size={} name=u.bin\n", plain.len()).as_bytes(),
        );
        payload.extend_from_slice(&encode(plain));
        payload.push(b'\n');
        payload.extend_from_slice(format!("=yend size={} pcrc32={:x}\n", plain.len(), crc).as_bytes());

        let sink = BufferSink::new();
        let mut decoder = Decoder::new(Box::new(sink.clone()));
        decoder.write(&payload).await.unwrap();
        assert_eq!(sink.contents(), plain);
    }
}
