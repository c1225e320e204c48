use std::collections::BTreeMap;

use mail_builder::headers::address::Address as MailAddress;
use mail_builder::headers::text::Text;
use mail_builder::headers::Header as MailHeader;
use serde::{ Deserialize, Serialize };

/// An ordered MIME header block. Names keep their original spelling,
/// lookups are case-insensitive.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Header {
    fields: Vec<(String, String)>,
}

impl Header {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, name: &str) -> Option<&str> {
        self.fields
            .iter()
            .find(|(key, _)| key.eq_ignore_ascii_case(name))
            .map(|(_, value)| value.as_str())
    }

    pub fn get_all<'a>(&'a self, name: &'a str) -> impl Iterator<Item = &'a str> + 'a {
        self.fields
            .iter()
            .filter(move |(key, _)| key.eq_ignore_ascii_case(name))
            .map(|(_, value)| value.as_str())
    }

    pub fn has(&self, name: &str) -> bool {
        self.get(name).is_some()
    }

    /// Replaces every field called `name` with a single one, keeping the
    /// position of the first occurrence.
    pub fn set(&mut self, name: &str, value: &str) {
        match self.fields.iter().position(|(key, _)| key.eq_ignore_ascii_case(name)) {
            Some(pos) => {
                self.fields[pos].1 = value.to_string();
                let mut index = 0;
                self.fields.retain(|(key, _)| {
                    let keep = index <= pos || !key.eq_ignore_ascii_case(name);
                    index += 1;
                    keep
                });
            }
            None => self.fields.push((name.to_string(), value.to_string())),
        }
    }

    pub fn add(&mut self, name: &str, value: &str) {
        self.fields.push((name.to_string(), value.to_string()));
    }

    pub fn del(&mut self, name: &str) {
        self.fields.retain(|(key, _)| !key.eq_ignore_ascii_case(name));
    }

    pub fn is_empty(&self) -> bool {
        self.fields.is_empty()
    }

    pub fn len(&self) -> usize {
        self.fields.len()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.fields.iter().map(|(k, v)| (k.as_str(), v.as_str()))
    }

    /// Header fields followed by the empty separator line.
    pub fn write_to(&self, out: &mut Vec<u8>) {
        for (name, value) in &self.fields {
            out.extend_from_slice(name.as_bytes());
            out.extend_from_slice(b": ");
            out.extend_from_slice(value.as_bytes());
            out.extend_from_slice(b"\r\n");
        }
        out.extend_from_slice(b"\r\n");
    }

    pub fn to_bytes(&self) -> Vec<u8> {
        let mut out = Vec::new();
        self.write_to(&mut out);
        out
    }
}

/// Splits a header block off the front of `data`.
///
/// Returns the parsed fields and the offset where the body starts. Folded
/// lines are joined. A line that is neither a field nor a continuation ends
/// the block without being consumed; a block that runs to the end of the
/// input leaves an empty body.
pub fn parse_header(data: &[u8]) -> (Header, usize) {
    let mut header = Header::new();
    let mut pos = 0;

    while pos < data.len() {
        let end = data[pos..]
            .iter()
            .position(|&b| b == b'\n')
            .map(|i| pos + i + 1)
            .unwrap_or(data.len());
        let line = trim_eol(&data[pos..end]);

        if line.is_empty() {
            return (header, end);
        }

        if line[0] == b' ' || line[0] == b'\t' {
            if let Some(last) = header.fields.last_mut() {
                last.1.push(' ');
                last.1.push_str(String::from_utf8_lossy(line).trim());
                pos = end;
                continue;
            }
            return (header, pos);
        }

        match line.iter().position(|&b| b == b':') {
            Some(colon) if colon > 0 && !line[..colon].contains(&b' ') => {
                let name = String::from_utf8_lossy(&line[..colon]).to_string();
                let value = String::from_utf8_lossy(&line[colon + 1..]).trim().to_string();
                header.fields.push((name, value));
            }
            _ => {
                return (header, pos);
            }
        }
        pos = end;
    }

    (header, data.len())
}

fn trim_eol(line: &[u8]) -> &[u8] {
    let line = line.strip_suffix(b"\n").unwrap_or(line);
    line.strip_suffix(b"\r").unwrap_or(line)
}

/// Parses a `Content-Type`-style value into a lower-cased media type and
/// its parameters (lower-cased names, unquoted values).
pub fn parse_media_type(value: &str) -> (String, BTreeMap<String, String>) {
    let mut parts = split_params(value).into_iter();
    let media_type = parts.next().unwrap_or_default().trim().to_ascii_lowercase();

    let mut params = BTreeMap::new();
    for part in parts {
        if let Some((name, value)) = part.split_once('=') {
            let name = name.trim().to_ascii_lowercase();
            if name.is_empty() {
                continue;
            }
            params.insert(name, unquote(value.trim()));
        }
    }

    (media_type, params)
}

fn split_params(value: &str) -> Vec<String> {
    let mut parts = Vec::new();
    let mut current = String::new();
    let mut quoted = false;
    let mut escaped = false;

    for c in value.chars() {
        if escaped {
            current.push(c);
            escaped = false;
            continue;
        }
        match c {
            '\\' if quoted => {
                current.push(c);
                escaped = true;
            }
            '"' => {
                quoted = !quoted;
                current.push(c);
            }
            ';' if !quoted => parts.push(std::mem::take(&mut current)),
            _ => current.push(c),
        }
    }
    parts.push(current);
    parts
}

fn unquote(value: &str) -> String {
    match value.strip_prefix('"').and_then(|v| v.strip_suffix('"')) {
        Some(inner) => inner.replace("\\\"", "\"").replace("\\\\", "\\"),
        None => value.to_string(),
    }
}

/// RFC 2047 encoded word for non-ASCII header text.
pub fn encode_word(text: &str) -> String {
    if text.is_ascii() {
        return text.to_string();
    }
    render_value(&Text::new(text))
}

/// `"Name" <address>` or `<address>` when there is no name.
pub fn format_address(name: &str, address: &str) -> String {
    let name = (!name.is_empty()).then_some(name);
    render_value(&MailAddress::new_address(name, address))
}

/// A header value as mail-builder writes it, unfolded onto one line.
fn render_value(value: &impl MailHeader) -> String {
    let mut out = Vec::new();
    match value.write_header(&mut out, 0) {
        Ok(_) => String::from_utf8_lossy(&out).replace("\r\n", "").trim().to_string(),
        Err(_) => String::new(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_header_folds_and_finds_body() {
        let raw = b"Subject: hello\r\n  world\r\nFrom: a@b.c\r\n\r\nbody\r\n";
        let (header, offset) = parse_header(raw);
        assert_eq!(header.get("subject"), Some("hello world"));
        assert_eq!(header.get("FROM"), Some("a@b.c"));
        assert_eq!(&raw[offset..], b"body\r\n");
    }

    #[test]
    fn test_parse_header_without_separator() {
        let (header, offset) = parse_header(b"Content-Type: text/plain\r\n");
        assert_eq!(header.len(), 1);
        assert_eq!(offset, 26);

        let raw = b"not a header line\r\nmore\r\n";
        let (header, offset) = parse_header(raw);
        assert!(header.is_empty());
        assert_eq!(offset, 0);
    }

    #[test]
    fn test_set_replaces_all_occurrences() {
        let mut header = Header::new();
        header.add("Received", "one");
        header.add("Subject", "x");
        header.add("received", "two");
        header.set("Received", "three");
        assert_eq!(header.get_all("received").collect::<Vec<_>>(), vec!["three"]);
        assert_eq!(header.iter().next(), Some(("Received", "three")));
        header.del("RECEIVED");
        assert_eq!(header.len(), 1);
    }

    #[test]
    fn test_parse_media_type() {
        let (media, params) = parse_media_type(
            "Multipart/Mixed; boundary=\"a;b\"; charset=UTF-8"
        );
        assert_eq!(media, "multipart/mixed");
        assert_eq!(params.get("boundary").map(String::as_str), Some("a;b"));
        assert_eq!(params.get("charset").map(String::as_str), Some("UTF-8"));
    }

    #[test]
    fn test_format_address() {
        assert_eq!(format_address("", "a@b.c"), "<a@b.c>");
        let named = format_address("Ann", "a@b.c");
        assert!(named.starts_with("\"Ann\"") || named.starts_with("Ann"), "{}", named);
        assert!(named.ends_with(" <a@b.c>"));

        let encoded = format_address("Zoë", "z@b.c");
        assert!(encoded.to_ascii_lowercase().starts_with("=?utf-8?"), "{}", encoded);
        assert!(encoded.ends_with("<z@b.c>"));
    }

    #[test]
    fn test_encode_word() {
        assert_eq!(encode_word("Report"), "Report");
        let encoded = encode_word("Grüße aus Köln");
        assert!(encoded.is_ascii());
        assert!(encoded.to_ascii_lowercase().starts_with("=?utf-8?"), "{}", encoded);
        assert!(!encoded.contains("\r\n"));
    }
}
