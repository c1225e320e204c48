use std::collections::BTreeMap;

use serde::{ Deserialize, Serialize };
use thiserror::Error;

use super::mime::{ parse_header, parse_media_type, Header };

#[derive(Debug, Error)]
pub enum SectionError {
    #[error("no such section: {0}")]
    NoSuchSection(String),

    #[error("invalid length {length} for section {path}")]
    InvalidLength {
        path: String,
        length: i64,
    },

    #[error("section {0} lies outside the message")]
    OutOfRange(String),

    #[error("malformed message: {0}")]
    Malformed(String),

    #[error("body structure encoding failed: {0}")]
    Codec(#[from] bincode::Error),
}

/// Offsets of one MIME part inside the literal it was parsed from.
///
/// `size` covers header and body, `bsize` the body alone, so the body
/// starts at `start + size - bsize`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SectionInfo {
    pub header: Header,
    pub start: usize,
    pub size: usize,
    pub bsize: usize,
    pub lines: usize,
}

impl SectionInfo {
    fn header_len(&self) -> usize {
        self.size - self.bsize
    }

    fn media_type(&self) -> (String, BTreeMap<String, String>) {
        let value = self.header.get("Content-Type").unwrap_or("text/plain; charset=us-ascii");
        let (media, params) = parse_media_type(value);
        if media.is_empty() {
            return parse_media_type("text/plain; charset=us-ascii");
        }
        (media, params)
    }
}

/// Section tree of one literal, keyed by dotted path. The root is the
/// empty path.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct BodyStructure {
    sections: BTreeMap<String, SectionInfo>,
}

/// IMAP view of a section, ready to be rendered as BODY/BODYSTRUCTURE.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ImapBodyStructure {
    pub mime_type: String,
    pub mime_subtype: String,
    pub params: BTreeMap<String, String>,
    pub id: Option<String>,
    pub description: Option<String>,
    pub encoding: Option<String>,
    pub size: usize,
    pub lines: usize,
    pub disposition: Option<(String, BTreeMap<String, String>)>,
    pub parts: Vec<ImapBodyStructure>,
}

/// Deepest multipart nesting that is split into sections.
pub const MAX_DEPTH: usize = 64;

pub fn path_key(path: &[usize]) -> String {
    path.iter()
        .map(|n| n.to_string())
        .collect::<Vec<_>>()
        .join(".")
}

impl BodyStructure {
    /// Indexes every MIME part of `literal` in a single pass.
    pub fn parse(literal: &[u8]) -> Result<Self, SectionError> {
        let mut structure = BodyStructure::default();
        structure.parse_part(literal, &[], 0)?;
        Ok(structure)
    }

    fn parse_part(&mut self, data: &[u8], path: &[usize], start: usize) -> Result<(), SectionError> {
        let (header, body_offset) = parse_header(data);
        let body = &data[body_offset..];

        let info = SectionInfo {
            header,
            start,
            size: data.len(),
            bsize: body.len(),
            lines: body.iter().filter(|&&b| b == b'\n').count(),
        };

        let (media, params) = info.media_type();
        let nested = media.starts_with("multipart/") || media == "message/rfc822";
        self.sections.insert(path_key(path), info);

        // Parts nested deeper than the limit are indexed as opaque leaves.
        if !nested || path.len() >= MAX_DEPTH {
            return Ok(());
        }
        let Some(boundary) = params.get("boundary") else {
            return Ok(());
        };
        if boundary.is_empty() {
            return Err(SectionError::Malformed(format!("empty boundary in section {}", path_key(path))));
        }

        let mut reader = BoundaryReader::new(body, boundary.as_bytes());
        if !reader.skip_preamble() {
            return Ok(());
        }

        let mut offset = start + body_offset;
        let mut number = 1;
        loop {
            offset += reader.skipped;
            let Some(part) = reader.next_part() else {
                break;
            };

            let mut child_path = path.to_vec();
            child_path.push(number);
            self.parse_part(part, &child_path, offset)?;
            number += 1;
        }

        Ok(())
    }

    fn info(&self, path: &[usize]) -> Result<&SectionInfo, SectionError> {
        let key = path_key(path);
        if let Some(info) = self.sections.get(&key) {
            return Ok(info);
        }

        // A single-part message is its own part 1.
        if path == &[1][..] && self.sections.len() == 1 {
            if let Some(root) = self.sections.get("") {
                return Ok(root);
            }
        }

        Err(SectionError::NoSuchSection(key))
    }

    fn slice<'a>(
        literal: &'a [u8],
        path: &[usize],
        from: usize,
        length: usize
    ) -> Result<&'a [u8], SectionError> {
        if length == 0 {
            return Err(SectionError::InvalidLength { path: path_key(path), length: 0 });
        }
        let end = from.checked_add(length).ok_or_else(|| SectionError::OutOfRange(path_key(path)))?;
        literal.get(from..end).ok_or_else(|| SectionError::OutOfRange(path_key(path)))
    }

    /// Header and body of the section.
    pub fn get_section<'a>(&self, literal: &'a [u8], path: &[usize]) -> Result<&'a [u8], SectionError> {
        let info = self.info(path)?;
        Self::slice(literal, path, info.start, info.size)
    }

    /// Body of the section without its header.
    pub fn get_section_content<'a>(&self, literal: &'a [u8], path: &[usize]) -> Result<&'a [u8], SectionError> {
        let info = self.info(path)?;
        Self::slice(literal, path, info.start + info.header_len(), info.bsize)
    }

    pub fn get_section_header(&self, path: &[usize]) -> Result<&Header, SectionError> {
        Ok(&self.info(path)?.header)
    }

    /// Raw header bytes of the section, separator line included.
    pub fn get_section_header_bytes<'a>(&self, literal: &'a [u8], path: &[usize]) -> Result<&'a [u8], SectionError> {
        let info = self.info(path)?;
        Self::slice(literal, path, info.start, info.header_len())
    }

    pub fn get_mail_header_bytes<'a>(&self, literal: &'a [u8]) -> Result<&'a [u8], SectionError> {
        self.get_section_header_bytes(literal, &[])
    }

    /// Every indexed path in document order.
    pub fn paths(&self) -> Vec<Vec<usize>> {
        let mut paths: Vec<Vec<usize>> = self.sections
            .keys()
            .map(|key| {
                key.split('.')
                    .filter(|p| !p.is_empty())
                    .filter_map(|p| p.parse().ok())
                    .collect()
            })
            .collect();
        paths.sort();
        paths
    }

    /// Paths without children, in document order.
    pub fn leaf_paths(&self) -> Vec<Vec<usize>> {
        let paths = self.paths();
        paths
            .iter()
            .filter(|path| {
                let mut child = (*path).clone();
                child.push(1);
                !self.sections.contains_key(&path_key(&child))
            })
            .cloned()
            .collect()
    }

    pub fn imap_body_structure(&self, path: &[usize]) -> Result<ImapBodyStructure, SectionError> {
        let info = self.info(path)?;
        let (media, params) = info.media_type();
        let (mime_type, mime_subtype) = match media.split_once('/') {
            Some((t, s)) => (t.to_string(), s.to_string()),
            None => (media.clone(), String::new()),
        };

        let mut parts = Vec::new();
        let mut number = 1;
        while path.len() < MAX_DEPTH {
            let mut child = path.to_vec();
            child.push(number);
            if !self.sections.contains_key(&path_key(&child)) {
                break;
            }
            parts.push(self.imap_body_structure(&child)?);
            number += 1;
        }

        let disposition = info.header.get("Content-Disposition").map(|value| {
            let (kind, params) = parse_media_type(value);
            (kind, params)
        });

        Ok(ImapBodyStructure {
            mime_type,
            mime_subtype,
            params,
            id: info.header.get("Content-Id").map(str::to_string),
            description: info.header.get("Content-Description").map(str::to_string),
            encoding: info.header.get("Content-Transfer-Encoding").map(str::to_string),
            size: info.bsize,
            lines: info.lines,
            disposition,
            parts,
        })
    }

    pub fn encode(&self) -> Result<Vec<u8>, SectionError> {
        Ok(bincode::serialize(self)?)
    }

    pub fn decode(bytes: &[u8]) -> Result<Self, SectionError> {
        Ok(bincode::deserialize(bytes)?)
    }
}

/// Walks the body of a multipart section boundary line by boundary line.
struct BoundaryReader<'a> {
    data: &'a [u8],
    pos: usize,
    nl: &'static [u8],
    dash_boundary: Vec<u8>,
    first: bool,
    closed: bool,
    /// Bytes consumed by the last skip/next_part call, boundary line included.
    skipped: usize,
}

enum Line<'a> {
    Full(&'a [u8]),
    Last(&'a [u8]),
}

impl<'a> BoundaryReader<'a> {
    fn new(data: &'a [u8], boundary: &[u8]) -> Self {
        let mut dash_boundary = b"--".to_vec();
        dash_boundary.extend_from_slice(boundary);
        Self {
            data,
            pos: 0,
            nl: b"\r\n",
            dash_boundary,
            first: true,
            closed: false,
            skipped: 0,
        }
    }

    fn next_line(&mut self) -> Option<Line<'a>> {
        if self.pos >= self.data.len() {
            return None;
        }
        let rest = &self.data[self.pos..];
        match rest.iter().position(|&b| b == b'\n') {
            Some(i) => {
                self.pos += i + 1;
                Some(Line::Full(&rest[..=i]))
            }
            None => {
                self.pos = self.data.len();
                Some(Line::Last(rest))
            }
        }
    }

    fn is_delimiter(&mut self, line: &[u8]) -> bool {
        let Some(rest) = line.strip_prefix(self.dash_boundary.as_slice()) else {
            return false;
        };
        let rest = skip_lwsp(rest);

        // The first boundary decides whether the body uses bare LF.
        if self.first && rest == b"\n" {
            self.nl = b"\n";
        }
        rest == self.nl
    }

    fn is_final(&self, line: &[u8]) -> bool {
        let Some(rest) = line.strip_prefix(self.dash_boundary.as_slice()) else {
            return false;
        };
        let Some(rest) = rest.strip_prefix(b"--") else {
            return false;
        };
        let rest = skip_lwsp(rest);
        rest.is_empty() || rest == self.nl
    }

    /// Consumes the preamble and the first boundary line. Returns false if
    /// the body holds no boundary at all.
    fn skip_preamble(&mut self) -> bool {
        matches!(self.read_part(), Some(_))
    }

    fn next_part(&mut self) -> Option<&'a [u8]> {
        self.read_part()
    }

    /// Reads up to the next boundary line and returns what came before it.
    /// `None` means the data ran out before another boundary.
    fn read_part(&mut self) -> Option<&'a [u8]> {
        self.skipped = 0;
        if self.closed {
            return None;
        }

        let part_start = self.pos;
        loop {
            let line_start = self.pos;
            let line = self.next_line()?;

            match line {
                Line::Full(line) => {
                    self.skipped += line.len();
                    if self.is_delimiter(line) {
                        self.first = false;
                        return Some(&self.data[part_start..line_start]);
                    }
                    if self.is_final(line) {
                        self.closed = true;
                        return Some(&self.data[part_start..line_start]);
                    }
                }
                Line::Last(line) => {
                    self.skipped += line.len();
                    if self.is_final(line) {
                        self.closed = true;
                        return Some(&self.data[part_start..line_start]);
                    }
                    return None;
                }
            }
        }
    }
}

fn skip_lwsp(mut data: &[u8]) -> &[u8] {
    while let Some((&first, rest)) = data.split_first() {
        if first != b' ' && first != b'\t' {
            break;
        }
        data = rest;
    }
    data
}

#[cfg(test)]
mod tests {
    use super::*;

    const NESTED: &str = concat!(
        "Subject: nested\r\n",
        "Content-Type: multipart/mixed; boundary=\"outer\"\r\n",
        "\r\n",
        "This is the preamble.\r\n",
        "--outer\r\n",
        "Content-Type: text/plain; charset=utf-8\r\n",
        "\r\n",
        "Hello plain\r\n",
        "--outer\r\n",
        "Content-Type: multipart/alternative; boundary=inner\r\n",
        "\r\n",
        "--inner\r\n",
        "Content-Type: text/plain\r\n",
        "\r\n",
        "alt text\r\n",
        "--inner\r\n",
        "Content-Type: text/html\r\n",
        "Content-Transfer-Encoding: quoted-printable\r\n",
        "\r\n",
        "<p>alt html</p>\r\n",
        "--inner--\r\n",
        "\r\n",
        "--outer\r\n",
        "Content-Type: application/pdf; name=doc.pdf\r\n",
        "Content-Disposition: attachment; filename=doc.pdf\r\n",
        "Content-Id: <doc@id>\r\n",
        "\r\n",
        "JVBERi0=\r\n",
        "--outer--\r\n",
        "epilogue\r\n"
    );

    #[test]
    fn test_paths_are_numbered_from_one() {
        let structure = BodyStructure::parse(NESTED.as_bytes()).unwrap();
        assert_eq!(
            structure.paths(),
            vec![vec![], vec![1], vec![2], vec![2, 1], vec![2, 2], vec![3]]
        );
        assert_eq!(structure.leaf_paths(), vec![vec![1], vec![2, 1], vec![2, 2], vec![3]]);
    }

    #[test]
    fn test_section_content_and_headers() {
        let literal = NESTED.as_bytes();
        let structure = BodyStructure::parse(literal).unwrap();

        assert_eq!(structure.get_section_content(literal, &[1]).unwrap(), b"Hello plain\r\n");
        assert_eq!(structure.get_section_content(literal, &[2, 2]).unwrap(), b"<p>alt html</p>\r\n");
        assert_eq!(
            structure.get_section(literal, &[2, 1]).unwrap(),
            b"Content-Type: text/plain\r\n\r\nalt text\r\n"
        );
        assert_eq!(
            structure.get_section_header(&[3]).unwrap().get("content-id"),
            Some("<doc@id>")
        );
        assert!(
            structure.get_mail_header_bytes(literal).unwrap().starts_with(b"Subject: nested\r\n")
        );
        assert!(structure.get_mail_header_bytes(literal).unwrap().ends_with(b"\r\n\r\n"));
    }

    #[test]
    fn test_body_offset_invariant() {
        let literal = NESTED.as_bytes();
        let structure = BodyStructure::parse(literal).unwrap();

        for path in structure.paths() {
            let whole = structure.get_section(literal, &path).unwrap();
            let content = structure.get_section_content(literal, &path).unwrap();
            assert!(whole.ends_with(content), "path {:?}", path);
        }
    }

    #[test]
    fn test_leaves_reassemble_original_region() {
        let literal = NESTED.as_bytes();
        let structure = BodyStructure::parse(literal).unwrap();

        // Each leaf sits in the literal exactly where the search finds it.
        let mut cursor = 0;
        for path in structure.leaf_paths() {
            let section = structure.get_section(literal, &path).unwrap();
            let info = structure.info(&path).unwrap();
            assert!(info.start >= cursor);
            assert_eq!(&literal[info.start..info.start + section.len()], section);
            cursor = info.start + section.len();
        }

        let first = structure.info(&[1]).unwrap().start;
        let last = structure.info(&[2]).unwrap();
        assert_eq!(&literal[first..last.start], b"Content-Type: text/plain; charset=utf-8\r\n\r\nHello plain\r\n--outer\r\n");
    }

    #[test]
    fn test_single_part_aliases_root() {
        let literal = b"Subject: hi\r\nContent-Type: text/plain\r\n\r\njust text\r\n";
        let structure = BodyStructure::parse(literal).unwrap();

        assert_eq!(structure.paths(), vec![Vec::<usize>::new()]);
        assert_eq!(structure.get_section_content(literal, &[1]).unwrap(), b"just text\r\n");
        assert_eq!(structure.get_section_content(literal, &[]).unwrap(), b"just text\r\n");
        assert!(matches!(structure.get_section(literal, &[2]), Err(SectionError::NoSuchSection(p)) if p == "2"));
    }

    #[test]
    fn test_empty_body_is_an_error() {
        let literal = b"Subject: empty\r\n\r\n";
        let structure = BodyStructure::parse(literal).unwrap();
        assert!(matches!(
            structure.get_section_content(literal, &[]),
            Err(SectionError::InvalidLength { length: 0, .. })
        ));
    }

    #[test]
    fn test_bare_lf_boundaries() {
        let literal = b"Content-Type: multipart/mixed; boundary=b\n\n--b\nContent-Type: text/plain\n\none\n--b\n\ntwo\n--b--\n";
        let structure = BodyStructure::parse(literal).unwrap();
        assert_eq!(structure.get_section_content(literal, &[1]).unwrap(), b"one\n");
        assert_eq!(structure.get_section_content(literal, &[2]).unwrap(), b"two\n");
    }

    #[test]
    fn test_multipart_without_boundaries_is_a_leaf() {
        let literal = b"Content-Type: multipart/mixed; boundary=zz\r\n\r\nno parts here\r\n";
        let structure = BodyStructure::parse(literal).unwrap();
        assert_eq!(structure.paths().len(), 1);
    }

    #[test]
    fn test_binary_codec_round_trip() {
        let structure = BodyStructure::parse(NESTED.as_bytes()).unwrap();
        let encoded = structure.encode().unwrap();
        assert_eq!(BodyStructure::decode(&encoded).unwrap(), structure);
        assert!(BodyStructure::decode(b"\x01garbage").is_err());
    }

    #[test]
    fn test_imap_body_structure() {
        let structure = BodyStructure::parse(NESTED.as_bytes()).unwrap();
        let root = structure.imap_body_structure(&[]).unwrap();

        assert_eq!(root.mime_type, "multipart");
        assert_eq!(root.mime_subtype, "mixed");
        assert_eq!(root.parts.len(), 3);
        assert_eq!(root.parts[1].parts.len(), 2);
        assert_eq!(root.parts[1].parts[1].encoding.as_deref(), Some("quoted-printable"));

        let pdf = &root.parts[2];
        assert_eq!(pdf.size, 10);
        assert_eq!(pdf.id.as_deref(), Some("<doc@id>"));
        let (kind, params) = pdf.disposition.clone().unwrap();
        assert_eq!(kind, "attachment");
        assert_eq!(params.get("filename").map(String::as_str), Some("doc.pdf"));
    }

    fn nested_literal(depth: usize) -> Vec<u8> {
        let mut literal = Vec::new();
        for level in 0..depth {
            literal.extend_from_slice(
                format!("Content-Type: multipart/mixed; boundary=\"b{level}\"\r\n\r\n--b{level}\r\n").as_bytes()
            );
        }
        literal.extend_from_slice(b"Content-Type: text/plain\r\n\r\ndeep\r\n");
        for level in (0..depth).rev() {
            literal.extend_from_slice(format!("\r\n--b{level}--\r\n").as_bytes());
        }
        literal
    }

    #[test]
    fn test_deep_nesting_stops_at_depth_limit() {
        let literal = nested_literal(5_000);
        let structure = BodyStructure::parse(&literal).unwrap();

        let paths = structure.paths();
        assert_eq!(paths.len(), MAX_DEPTH + 1);

        let deepest = vec![1; MAX_DEPTH];
        assert_eq!(structure.leaf_paths(), vec![deepest.clone()]);
        let content = structure.get_section_content(&literal, &deepest).unwrap();
        assert!(content.starts_with(format!("--b{}\r\n", MAX_DEPTH).as_bytes()));

        let root = structure.imap_body_structure(&[]).unwrap();
        let mut node = &root;
        let mut depth = 0;
        while let Some(child) = node.parts.first() {
            node = child;
            depth += 1;
        }
        assert_eq!(depth, MAX_DEPTH);
    }

    #[test]
    fn test_shallow_nesting_reaches_innermost_part() {
        let literal = nested_literal(10);
        let structure = BodyStructure::parse(&literal).unwrap();
        assert_eq!(structure.get_section_content(&literal, &[1; 10]).unwrap(), b"deep\r\n\r\n");
        assert_eq!(
            structure.get_section_header(&[1; 10]).unwrap().get("Content-Type"),
            Some("text/plain")
        );
    }

    #[test]
    fn test_many_siblings_index_in_linear_time() {
        const PARTS: usize = 50_000;
        let mut literal = b"Content-Type: multipart/mixed; boundary=b\r\n\r\n".to_vec();
        for n in 0..PARTS {
            literal.extend_from_slice(format!("--b\r\n\r\npart {n}\r\n").as_bytes());
        }
        literal.extend_from_slice(b"--b--\r\n");

        let started = std::time::Instant::now();
        let structure = BodyStructure::parse(&literal).unwrap();
        assert!(started.elapsed() < std::time::Duration::from_secs(10), "took {:?}", started.elapsed());

        assert_eq!(structure.paths().len(), PARTS + 1);
        assert_eq!(structure.get_section_content(&literal, &[1]).unwrap(), b"part 0\r\n");
        assert_eq!(
            structure.get_section_content(&literal, &[PARTS]).unwrap(),
            format!("part {}\r\n", PARTS - 1).as_bytes()
        );
    }

    #[test]
    fn test_unterminated_multipart_drops_trailing_part() {
        let literal = b"Content-Type: multipart/mixed; boundary=b\r\n\r\n--b\r\n\r\none\r\n--b\r\n\r\ntwo\r\n";
        let structure = BodyStructure::parse(literal).unwrap();

        assert_eq!(structure.paths(), vec![vec![], vec![1]]);
        assert_eq!(structure.get_section_content(literal, &[1]).unwrap(), b"one\r\n");
        assert!(matches!(structure.get_section(literal, &[2]), Err(SectionError::NoSuchSection(_))));
    }
}
