use std::io::BufRead;
use std::path::Path;

use quick_xml::Reader;
use quick_xml::events::{BytesStart, Event};

use crate::error::NzbError;
use crate::model::{File, Metadata, Nzb, Segment};

#[derive(Debug)]
enum ParseState {
    Initial,
    InNzb,
    InHead,
    InMeta(String),
    InFile,
    InGroups,
    InGroup,
    InSegments,
    InSegment { bytes: u64, number: u32 },
}

/// Streaming NZB parser.
///
/// Deliberately tolerant: files with no groups or no segments parse fine
/// (the download engine treats them as uninteresting), unknown elements
/// are skipped, and missing attributes default rather than fail. Only
/// broken XML and a missing `<nzb>` root are rejected.
#[derive(Debug)]
pub struct NzbParser {
    state: ParseState,
    nzb: Nzb,
    current_file: Option<File>,
    current_text: String,
}

impl NzbParser {
    pub fn new() -> Self {
        Self {
            state: ParseState::Initial,
            nzb: Nzb::default(),
            current_file: None,
            current_text: String::new(),
        }
    }

    pub fn parse<R: BufRead>(mut self, input: R) -> Result<Nzb, NzbError> {
        let mut reader = Reader::from_reader(input);
        reader.config_mut().trim_text(true);
        let mut buf = Vec::with_capacity(4096);
        let mut saw_nzb = false;

        loop {
            match reader.read_event_into(&mut buf) {
                Ok(Event::Start(ref e)) => {
                    if e.name().as_ref() == b"nzb" {
                        saw_nzb = true;
                    }
                    self.handle_start(e)?;
                }
                Ok(Event::End(ref e)) => self.handle_end(e.name().as_ref()),
                Ok(Event::Empty(ref e)) => {
                    if e.name().as_ref() == b"nzb" {
                        saw_nzb = true;
                    }
                    self.handle_start(e)?;
                    let name = e.name().as_ref().to_vec();
                    self.handle_end(&name);
                }
                Ok(Event::Text(ref e)) => {
                    self.current_text
                        .push_str(&e.unescape().map_err(|e| NzbError::Xml(e.to_string()))?);
                }
                Ok(Event::Eof) => break,
                Ok(_) => {}
                Err(e) => return Err(NzbError::Xml(e.to_string())),
            }
            buf.clear();
        }

        if !saw_nzb {
            return Err(NzbError::Malformed("missing nzb root element".into()));
        }

        Ok(self.nzb)
    }

    /// Parse `path`, recording its basename on the result.
    pub fn parse_file(path: impl AsRef<Path>) -> Result<Nzb, NzbError> {
        let path = path.as_ref();
        let file = std::fs::File::open(path)?;
        let mut nzb = Self::new().parse(std::io::BufReader::new(file))?;
        nzb.filename = path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default();
        Ok(nzb)
    }

    fn handle_start(&mut self, e: &BytesStart) -> Result<(), NzbError> {
        let tag = e.name();
        self.current_text.clear();

        self.state = match (&self.state, tag.as_ref()) {
            (ParseState::Initial, b"nzb") => ParseState::InNzb,
            (ParseState::InNzb, b"head") => ParseState::InHead,
            (ParseState::InHead, b"meta") => {
                let kind = attr(e, b"type")?.unwrap_or_default();
                ParseState::InMeta(kind)
            }
            (ParseState::InNzb, b"file") => {
                self.current_file = Some(File {
                    poster: attr(e, b"poster")?.unwrap_or_default(),
                    date: attr(e, b"date")?
                        .and_then(|s| s.parse().ok())
                        .unwrap_or(0),
                    subject: attr(e, b"subject")?.unwrap_or_default(),
                    groups: Vec::new(),
                    segments: Vec::new(),
                });
                ParseState::InFile
            }
            (ParseState::InFile, b"groups") => ParseState::InGroups,
            (ParseState::InGroups, b"group") => ParseState::InGroup,
            (ParseState::InFile, b"segments") => ParseState::InSegments,
            (ParseState::InSegments, b"segment") => ParseState::InSegment {
                bytes: attr(e, b"bytes")?.and_then(|s| s.parse().ok()).unwrap_or(0),
                number: attr(e, b"number")?
                    .and_then(|s| s.parse().ok())
                    .unwrap_or(0),
            },
            _ => return Ok(()),
        };
        Ok(())
    }

    fn handle_end(&mut self, tag: &[u8]) {
        self.state = match (&self.state, tag) {
            (ParseState::InMeta(kind), b"meta") => {
                self.nzb.metadata.push(Metadata {
                    kind: kind.clone(),
                    value: std::mem::take(&mut self.current_text),
                });
                ParseState::InHead
            }
            (ParseState::InHead, b"head") => ParseState::InNzb,
            (ParseState::InGroup, b"group") => {
                if let Some(f) = &mut self.current_file {
                    f.groups.push(std::mem::take(&mut self.current_text));
                }
                ParseState::InGroups
            }
            (ParseState::InGroups, b"groups") => ParseState::InFile,
            (ParseState::InSegment { bytes, number }, b"segment") => {
                let article_id = std::mem::take(&mut self.current_text);
                if let Some(f) = &mut self.current_file
                    && !article_id.is_empty()
                {
                    f.segments.push(Segment {
                        bytes: *bytes,
                        number: *number,
                        article_id,
                    });
                }
                ParseState::InSegments
            }
            (ParseState::InSegments, b"segments") => ParseState::InFile,
            (ParseState::InFile, b"file") => {
                if let Some(file) = self.current_file.take() {
                    self.nzb.files.push(file);
                }
                ParseState::InNzb
            }
            (ParseState::InNzb, b"nzb") => ParseState::Initial,
            _ => return,
        };
    }
}

impl Default for NzbParser {
    fn default() -> Self {
        Self::new()
    }
}

fn attr(e: &BytesStart, name: &[u8]) -> Result<Option<String>, NzbError> {
    for attr in e.attributes().flatten() {
        if attr.key.as_ref() == name {
            return Ok(Some(
                attr.unescape_value()
                    .map_err(|e| NzbError::Xml(e.to_string()))?
                    .into_owned(),
            ));
        }
    }
    Ok(None)
}

#[cfg(test)]
mod tests {
    use super::*;

    const SAMPLE: &str = r#"<?xml version="1.0" encoding="UTF-8"?>
<!DOCTYPE nzb PUBLIC "-//newzbin//DTD NZB 1.1//EN"
  "http://www.newzbin.com/DTD/nzb/nzb-1.1.dtd">
<nzb xmlns="http://www.newzbin.com/DTD/2003/nzb">
  <head>
    <meta type="title">My.Linux.Distro.x64</meta>
    <meta type="password">secret123</meta>
  </head>
  <file poster="user@example.com (User)"
        date="1706140800"
        subject='My.Linux.Distro.x64 [01/15] - "distro.part01.rar" yEnc (1/2)'>
    <groups>
      <group>alt.binaries.linux</group>
      <group>alt.binaries.misc</group>
    </groups>
    <segments>
      <segment bytes="739811" number="1">part1of2.abc123@news.example.com</segment>
      <segment bytes="739811" number="2">part2of2.abc123@news.example.com</segment>
    </segments>
  </file>
</nzb>
"#;

    #[test]
    fn parses_metadata_and_files() {
        let nzb = NzbParser::new()
            .parse(std::io::Cursor::new(SAMPLE))
            .expect("parse sample");

        assert_eq!(nzb.metadata.len(), 2);
        assert_eq!(nzb.metadata[0].kind, "title");
        assert_eq!(nzb.metadata[0].value, "My.Linux.Distro.x64");

        assert_eq!(nzb.files.len(), 1);
        let file = &nzb.files[0];
        assert_eq!(file.poster, "user@example.com (User)");
        assert_eq!(file.date, 1706140800);
        assert_eq!(file.groups.len(), 2);
        assert_eq!(file.segments.len(), 2);
        assert_eq!(file.segments[0].article_id, "part1of2.abc123@news.example.com");
        assert_eq!(file.segments[0].bytes, 739811);
        assert_eq!(file.segments[0].number, 1);
    }

    #[test]
    fn tolerates_files_without_groups_or_segments() {
        let xml = r#"<?xml version="1.0"?>
<nzb xmlns="http://www.newzbin.com/DTD/2003/nzb">
  <file poster="p" date="1" subject="empty but valid"/>
</nzb>
"#;
        let nzb = NzbParser::new()
            .parse(std::io::Cursor::new(xml))
            .expect("parse");
        assert_eq!(nzb.files.len(), 1);
        assert!(nzb.files[0].groups.is_empty());
        assert!(nzb.files[0].segments.is_empty());
    }

    #[test]
    fn rejects_documents_without_nzb_root() {
        let err = NzbParser::new()
            .parse(std::io::Cursor::new("<xml><file/></xml>"))
            .expect_err("should fail");
        match err {
            NzbError::Malformed(message) => assert!(message.contains("nzb root")),
            other => panic!("unexpected error: {other:?}"),
        }
    }

    #[test]
    fn rejects_broken_xml() {
        let err = NzbParser::new()
            .parse(std::io::Cursor::new("<nzb><file></nzb>"))
            .expect_err("should fail");
        assert!(matches!(err, NzbError::Xml(_)));
    }
}
