use base64::Engine;
use base64::engine::general_purpose::STANDARD;
use mail_parser::MessageParser;
use thiserror::Error;

use super::mime::{ parse_header, parse_media_type, Header };
use crate::store::KeyRing;

#[derive(Debug, Error)]
pub enum CryptoError {
    #[error("no key matches the message")]
    IncorrectKey,

    #[error("malformed PGP data: {0}")]
    Malformed(String),

    #[error("{0}")]
    Other(String),
}

pub const ARMOR_VERSION: &str = "lightbridge";

/// ASCII armor around `data` with the given armor headers.
pub fn armor(kind: &str, headers: &[(&str, &str)], data: &[u8]) -> String {
    let mut out = format!("-----BEGIN PGP {}-----\n", kind);
    for (name, value) in headers {
        out.push_str(&format!("{}: {}\n", name, value));
    }
    out.push('\n');
    let encoded = STANDARD.encode(data);
    for chunk in encoded.as_bytes().chunks(64) {
        out.push_str(&String::from_utf8_lossy(chunk));
        out.push('\n');
    }
    out.push_str(&format!("-----END PGP {}-----\n", kind));
    out
}

/// Splits armored text into its armor headers and decoded payload.
pub fn dearmor(text: &str) -> Result<(Vec<(String, String)>, Vec<u8>), CryptoError> {
    let mut lines = text.lines().map(str::trim_end);

    let begin = lines.by_ref().find(|line| line.starts_with("-----BEGIN PGP "));
    if begin.is_none() {
        return Err(CryptoError::Malformed("missing armor header line".to_string()));
    }

    let mut headers = Vec::new();
    for line in lines.by_ref() {
        if line.is_empty() {
            break;
        }
        match line.split_once(": ") {
            Some((name, value)) => headers.push((name.to_string(), value.to_string())),
            None => return Err(CryptoError::Malformed(format!("bad armor header {:?}", line))),
        }
    }

    let mut payload = String::new();
    let mut closed = false;
    for line in lines {
        if line.starts_with("-----END PGP ") {
            closed = true;
            break;
        }
        // Checksum line.
        if line.starts_with('=') {
            continue;
        }
        payload.push_str(line);
    }
    if !closed {
        return Err(CryptoError::Malformed("missing armor tail line".to_string()));
    }

    let data = STANDARD.decode(payload.as_bytes()).map_err(|e| CryptoError::Malformed(e.to_string()))?;
    Ok((headers, data))
}

/// Adds `Version` and `Comment` armor headers to armored text, or armors it
/// afresh if it is not armored at all.
pub fn armor_with_comment(kind: &str, text: &str, comment: &str) -> String {
    match dearmor(text) {
        Ok((mut headers, data)) => {
            headers.retain(|(name, _)| name != "Version" && name != "Comment");
            let mut all = vec![("Version", ARMOR_VERSION), ("Comment", comment)];
            all.extend(headers.iter().map(|(n, v)| (n.as_str(), v.as_str())));
            armor(kind, &all, &data)
        }
        Err(_) => armor(kind, &[("Version", ARMOR_VERSION), ("Comment", comment)], text.as_bytes()),
    }
}

/// Appended literal prepared for import: the plain header stays readable
/// for the store, the content is encrypted.
#[derive(Debug, Clone)]
pub struct EncryptedLiteral {
    pub header: Header,
    pub mime_type: String,
    pub body: String,
}

/// Encrypts the content of an RFC822 literal.
///
/// Plain text and HTML messages keep only their decoded text, so they can be
/// rebuilt as simple messages. Anything else keeps its whole MIME entity,
/// which is rebuilt by merging the message header back into it.
pub fn encrypt_rfc822(key_ring: &dyn KeyRing, literal: &[u8]) -> Result<EncryptedLiteral, CryptoError> {
    let (mut header, body_offset) = parse_header(literal);
    let (media, _) = parse_media_type(header.get("Content-Type").unwrap_or("text/plain"));

    let text = match media.as_str() {
        "" | "text/plain" | "text/html" => {
            let parsed = MessageParser::default()
                .parse(literal)
                .ok_or_else(|| CryptoError::Malformed("cannot parse appended message".to_string()))?;
            let decoded = if media == "text/html" { parsed.body_html(0) } else { parsed.body_text(0) };
            Some(decoded.map(|t| t.into_owned()).unwrap_or_default())
        }
        _ => None,
    };

    let (mime_type, plain) = match text {
        Some(text) => {
            header.del("Content-Type");
            header.del("Content-Transfer-Encoding");
            let mime_type = if media.is_empty() { "text/plain".to_string() } else { media };
            (mime_type, text.into_bytes())
        }
        None => {
            let mut entity = Header::new();
            let content_fields: Vec<(String, String)> = header
                .iter()
                .filter(|(name, _)| name.to_ascii_lowercase().starts_with("content-"))
                .map(|(n, v)| (n.to_string(), v.to_string()))
                .collect();
            for (name, value) in &content_fields {
                entity.add(name, value);
                header.del(name);
            }

            let mut plain = entity.to_bytes();
            plain.extend_from_slice(&literal[body_offset..]);
            ("multipart/mixed".to_string(), plain)
        }
    };

    Ok(EncryptedLiteral {
        header,
        mime_type,
        body: key_ring.encrypt(&plain)?,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::memory::MemoryKeyRing;

    #[test]
    fn test_armor_round_trip() {
        let text = armor("MESSAGE", &[("Version", "x")], b"secret bytes");
        assert!(text.starts_with("-----BEGIN PGP MESSAGE-----\nVersion: x\n\n"));
        let (headers, data) = dearmor(&text).unwrap();
        assert_eq!(headers, vec![("Version".to_string(), "x".to_string())]);
        assert_eq!(data, b"secret bytes");
        assert!(matches!(dearmor("plain text"), Err(CryptoError::Malformed(_))));
    }

    #[test]
    fn test_armor_with_comment_keeps_payload() {
        let original = armor("MESSAGE", &[("Key-Id", "7")], b"cipher");
        let commented = armor_with_comment("MESSAGE", &original, "could not decrypt");
        let (headers, data) = dearmor(&commented).unwrap();
        assert_eq!(data, b"cipher");
        assert!(headers.contains(&("Comment".to_string(), "could not decrypt".to_string())));
        assert!(headers.contains(&("Key-Id".to_string(), "7".to_string())));
    }

    #[test]
    fn test_encrypt_plain_text_literal() {
        let kr = MemoryKeyRing::new(3);
        let literal = b"Subject: hi\r\nContent-Type: text/plain; charset=utf-8\r\nContent-Transfer-Encoding: quoted-printable\r\n\r\nna=C3=AFve\r\n";
        let encrypted = encrypt_rfc822(&kr, literal).unwrap();

        assert_eq!(encrypted.mime_type, "text/plain");
        assert_eq!(encrypted.header.get("Subject"), Some("hi"));
        assert!(!encrypted.header.has("Content-Type"));
        let plain = String::from_utf8(kr.decrypt_message(&encrypted.body).unwrap()).unwrap();
        assert!(plain.starts_with("naïve"));
    }

    #[test]
    fn test_encrypt_multipart_literal_keeps_entity() {
        let kr = MemoryKeyRing::new(3);
        let literal = b"Subject: parts\r\nContent-Type: multipart/mixed; boundary=b\r\n\r\n--b\r\n\r\none\r\n--b--\r\n";
        let encrypted = encrypt_rfc822(&kr, literal).unwrap();

        assert_eq!(encrypted.mime_type, "multipart/mixed");
        assert!(!encrypted.header.has("Content-Type"));
        let plain = kr.decrypt_message(&encrypted.body).unwrap();
        assert!(plain.starts_with(b"Content-Type: multipart/mixed; boundary=b\r\n\r\n--b\r\n"));
    }
}
