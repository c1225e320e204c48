use std::borrow::Cow;
use std::collections::HashMap;

use base64::Engine;
use base64::engine::general_purpose::STANDARD;
use mail_builder::headers::content_type::ContentType;
use mail_builder::headers::raw::Raw;
use mail_builder::headers::HeaderType;
use mail_builder::mime::{ BodyPart, MimePart };
use mail_builder::MessageBuilder;
use thiserror::Error;
use tracing::{ debug, warn };

use super::encrypt::{ armor, armor_with_comment, CryptoError, ARMOR_VERSION };
use super::header::{ message_header, JobOptions };
use super::mime::{ parse_header, Header };
use crate::store::{ Attachment, KeyRing, Message };

#[derive(Debug, Error)]
pub enum BuildError {
    #[error("message {id} could not be decrypted: {source}")]
    DecryptionFailed {
        id: String,
        #[source]
        source: CryptoError,
    },

    #[error("no such message: {0}")]
    NoSuchMessage(String),

    #[error("build pipeline is shut down")]
    PipelineClosed,

    #[error("message could not be written: {0}")]
    Write(#[from] std::io::Error),

    #[error(transparent)]
    Store(#[from] anyhow::Error),
}

fn decryption_failed(message: &Message, source: CryptoError) -> BuildError {
    BuildError::DecryptionFailed { id: message.id.clone(), source }
}

type Field = (Cow<'static, str>, HeaderType<'static>);

fn field(name: &str, value: impl Into<HeaderType<'static>>) -> Field {
    (Cow::Owned(name.to_string()), value.into())
}

fn raw(value: &str) -> Raw<'static> {
    Raw::from(value.to_string())
}

fn media(media_type: &str) -> ContentType<'static> {
    ContentType::new(media_type.to_string())
}

fn multipart(content_type: ContentType<'static>, parts: Vec<MimePart<'static>>) -> MimePart<'static> {
    MimePart { headers: vec![field("Content-Type", content_type)], contents: BodyPart::Multipart(parts) }
}

/// Transfer encoding for content written as it is.
fn identity_encoding(data: &[u8]) -> &'static str {
    if data.is_ascii() { "7bit" } else { "8bit" }
}

fn is_content_field(name: &str) -> bool {
    ["Content-Type", "Content-Transfer-Encoding", "Content-Disposition"]
        .iter()
        .any(|known| known.eq_ignore_ascii_case(name))
}

/// Spelling mail-builder looks for before adding a field of its own.
fn canonical_name(name: &str) -> String {
    ["Date", "Message-ID", "MIME-Version"]
        .iter()
        .find(|known| known.eq_ignore_ascii_case(name))
        .map_or_else(|| name.to_string(), |known| known.to_string())
}

/// Writes the top-level header followed by `body`. Content fields of the
/// header give way to the ones of the body part.
fn write_message(header: &Header, body: MimePart<'static>) -> Result<Vec<u8>, BuildError> {
    let mut builder = MessageBuilder::new();
    for (name, value) in header.iter().filter(|(name, _)| !is_content_field(name)) {
        builder = builder.header(canonical_name(name), raw(value));
    }
    builder.body = Some(body);

    let mut out = Vec::new();
    builder.write_to(&mut out)?;
    Ok(out)
}

/// Assembles the RFC822 literal of a decrypted message.
///
/// `attachments` holds the encrypted data packet of every attachment by id.
pub fn build_rfc822(
    key_ring: &dyn KeyRing,
    message: &Message,
    attachments: &HashMap<String, Vec<u8>>,
    opts: &JobOptions
) -> Result<Vec<u8>, BuildError> {
    if !message.attachments.is_empty() {
        return build_multipart(key_ring, message, attachments, opts);
    }
    if message.mime_type.eq_ignore_ascii_case("multipart/mixed") {
        return build_pgp(key_ring, message, opts);
    }
    build_simple(key_ring, message, opts)
}

fn build_simple(key_ring: &dyn KeyRing, message: &Message, opts: &JobOptions) -> Result<Vec<u8>, BuildError> {
    let decrypted = match key_ring.decrypt_message(&message.body) {
        Ok(decrypted) => decrypted,
        Err(err) if opts.ignore_decryption_errors => {
            warn!(msg_id = %message.id, error = %err, "Building message with undecryptable body");
            return build_multipart(key_ring, message, &HashMap::new(), opts);
        }
        Err(err) => {
            return Err(decryption_failed(message, err));
        }
    };

    write_message(&message_header(message, opts), text_body(decrypted, &message.mime_type))
}

fn build_multipart(
    key_ring: &dyn KeyRing,
    message: &Message,
    attachment_data: &HashMap<String, Vec<u8>>,
    opts: &JobOptions
) -> Result<Vec<u8>, BuildError> {
    let (inlines, attachments): (Vec<&Attachment>, Vec<&Attachment>) = message.attachments
        .iter()
        .partition(|a| a.disposition.eq_ignore_ascii_case("inline"));

    let mut parts = Vec::with_capacity(attachments.len() + 1);
    if inlines.is_empty() {
        parts.push(text_part(key_ring, message, opts)?);
    } else {
        let mut related = vec![text_part(key_ring, message, opts)?];
        for attachment in inlines {
            related.push(attachment_part(key_ring, attachment, attachment_data, opts)?);
        }
        parts.push(multipart(media("multipart/related"), related));
    }

    for attachment in attachments {
        parts.push(attachment_part(key_ring, attachment, attachment_data, opts)?);
    }

    write_message(&message_header(message, opts), multipart(media("multipart/mixed"), parts))
}

/// Decrypted text with a UTF-8 charset when it is valid UTF-8. The transfer
/// encoding is left to the writer.
fn text_body(decrypted: Vec<u8>, mime_type: &str) -> MimePart<'static> {
    let mime_type = if mime_type.is_empty() { "text/plain" } else { mime_type };
    match String::from_utf8(decrypted) {
        Ok(text) => {
            MimePart {
                headers: vec![field("Content-Type", media(mime_type).attribute("charset", "utf-8"))],
                contents: BodyPart::Text(text.into()),
            }
        }
        Err(err) => {
            MimePart {
                headers: vec![field("Content-Type", media(mime_type))],
                contents: BodyPart::Binary(err.into_bytes().into()),
            }
        }
    }
}

fn text_part(key_ring: &dyn KeyRing, message: &Message, opts: &JobOptions) -> Result<MimePart<'static>, BuildError> {
    match key_ring.decrypt_message(&message.body) {
        Ok(decrypted) => Ok(text_body(decrypted, &message.mime_type)),
        Err(err) if opts.ignore_decryption_errors => {
            let comment = format!("This message could not be decrypted: {}", err);
            Ok(MimePart {
                headers: vec![field("Content-Type", media("text/plain"))],
                contents: BodyPart::Text(armor_with_comment("MESSAGE", &message.body, &comment).into()),
            })
        }
        Err(err) => Err(decryption_failed(message, err)),
    }
}

fn attachment_part(
    key_ring: &dyn KeyRing,
    attachment: &Attachment,
    attachment_data: &HashMap<String, Vec<u8>>,
    opts: &JobOptions
) -> Result<MimePart<'static>, BuildError> {
    let data = attachment_data
        .get(&attachment.id)
        .ok_or_else(|| anyhow::anyhow!("attachment {} was not fetched", attachment.id))?;

    let decrypted = STANDARD.decode(attachment.key_packets.as_bytes())
        .map_err(|e| CryptoError::Malformed(e.to_string()))
        .and_then(|packets| key_ring.decrypt_attachment(&packets, data));

    match decrypted {
        Ok(decrypted) => Ok(decrypted_attachment(attachment, decrypted)),
        Err(err) if opts.ignore_decryption_errors => {
            warn!(att_id = %attachment.id, error = %err, "Attachment could not be decrypted");
            let mut payload = STANDARD.decode(attachment.key_packets.as_bytes()).unwrap_or_default();
            payload.extend_from_slice(data);

            let comment = format!("This attachment could not be decrypted: {}", err);
            let armored = armor("MESSAGE", &[("Version", ARMOR_VERSION), ("Comment", &comment)], &payload);

            let name = format!("{}.pgp", attachment.name);
            Ok(MimePart {
                headers: vec![
                    field("Content-Type", media("application/pgp-encrypted").attribute("name", name.clone())),
                    field("Content-Disposition", media("attachment").attribute("filename", name))
                ],
                contents: BodyPart::Text(armored.into()),
            })
        }
        Err(err) => Err(BuildError::DecryptionFailed { id: attachment.message_id.clone(), source: err }),
    }
}

/// Attachment part carrying the stored header fields. Embedded messages are
/// written unencoded, everything else is left to the writer.
fn decrypted_attachment(attachment: &Attachment, decrypted: Vec<u8>) -> MimePart<'static> {
    let mime_type = if attachment.mime_type.is_empty() { "application/octet-stream" } else { &attachment.mime_type };
    let disposition = if attachment.disposition.is_empty() { "attachment" } else { &attachment.disposition };

    let mut headers: Vec<Field> = attachment.header
        .iter()
        .filter(|(name, _)| !is_content_field(name))
        .map(|(name, value)| field(name, raw(value)))
        .collect();
    headers.push(field("Content-Type", media(mime_type).attribute("name", attachment.name.clone())));
    headers.push(field("Content-Disposition", media(disposition).attribute("filename", attachment.name.clone())));

    if mime_type.eq_ignore_ascii_case("message/rfc822") {
        headers.push(field("Content-Transfer-Encoding", raw(identity_encoding(&decrypted))));
    }

    MimePart { headers, contents: BodyPart::Binary(decrypted.into()) }
}

fn build_pgp(key_ring: &dyn KeyRing, message: &Message, opts: &JobOptions) -> Result<Vec<u8>, BuildError> {
    let decrypted = match key_ring.decrypt_message(&message.body) {
        Ok(decrypted) => decrypted,
        Err(err) if opts.ignore_decryption_errors => {
            warn!(msg_id = %message.id, error = %err, "PGP/MIME message could not be decrypted");
            return build_pgp_fallback(message, opts, &err);
        }
        Err(err) => {
            return Err(decryption_failed(message, err));
        }
    };

    let signatures = match key_ring.extract_signatures(message) {
        Ok(signatures) => signatures,
        Err(err) => {
            warn!(msg_id = %message.id, error = %err, "Could not extract signatures");
            Vec::new()
        }
    };

    match signatures.first() {
        Some(signature) => build_pgp_signed(message, opts, &decrypted, &signature.hash, &signature.data),
        None => Ok(build_pgp_entity(message, opts, &decrypted)),
    }
}

fn build_pgp_signed(
    message: &Message,
    opts: &JobOptions,
    decrypted: &[u8],
    hash: &str,
    signature: &[u8]
) -> Result<Vec<u8>, BuildError> {
    debug!(msg_id = %message.id, "Building multipart/signed message");

    // The signed entity goes out as it is, so it always names its encoding.
    let (body_header, body_offset) = parse_header(decrypted);
    let body = &decrypted[body_offset..];
    let mut signed_headers: Vec<Field> = body_header
        .iter()
        .map(|(name, value)| field(name, raw(value)))
        .collect();
    if !body_header.has("Content-Transfer-Encoding") {
        signed_headers.push(field("Content-Transfer-Encoding", raw(identity_encoding(body))));
    }
    let signed = MimePart { headers: signed_headers, contents: BodyPart::Binary(body.to_vec().into()) };

    let signature = MimePart {
        headers: vec![
            field("Content-Type", media("application/pgp-signature").attribute("name", "OpenPGP_signature.asc")),
            field("Content-Description", raw("OpenPGP digital signature")),
            field("Content-Disposition", media("attachment").attribute("filename", "OpenPGP_signature.asc"))
        ],
        contents: BodyPart::Text(armor("SIGNATURE", &[("Version", ARMOR_VERSION)], signature).into()),
    };

    let content_type = media("multipart/signed")
        .attribute("micalg", format!("pgp-{}", hash.to_ascii_lowercase()))
        .attribute("protocol", "application/pgp-signature");
    write_message(&message_header(message, opts), multipart(content_type, vec![signed, signature]))
}

/// The decrypted body is itself a MIME entity: its content fields move
/// into the message header.
fn build_pgp_entity(message: &Message, opts: &JobOptions, decrypted: &[u8]) -> Vec<u8> {
    let (body_header, body_offset) = parse_header(decrypted);
    let mut header = message_header(message, opts);

    if body_header.is_empty() {
        header.del("Content-Type");
    }
    for (name, value) in body_header.iter() {
        header.set(name, value);
    }

    let mut out = header.to_bytes();
    out.extend_from_slice(&decrypted[body_offset..]);
    out
}

fn build_pgp_fallback(message: &Message, opts: &JobOptions, err: &CryptoError) -> Result<Vec<u8>, BuildError> {
    let version = MimePart {
        headers: vec![
            field("Content-Type", media("application/pgp-encrypted")),
            field("Content-Description", raw("PGP/MIME version identification"))
        ],
        contents: BodyPart::Text("Version: 1".into()),
    };

    let comment = format!("This message could not be decrypted: {}", err);
    let data = MimePart {
        headers: vec![
            field("Content-Type", media("application/octet-stream").attribute("name", "encrypted.asc")),
            field("Content-Description", raw("OpenPGP encrypted message")),
            field("Content-Disposition", media("inline").attribute("filename", "encrypted.asc"))
        ],
        contents: BodyPart::Text(armor_with_comment("MESSAGE", &message.body, &comment).into()),
    };

    let content_type = media("multipart/encrypted").attribute("protocol", "application/pgp-encrypted");
    write_message(&message_header(message, opts), multipart(content_type, vec![version, data]))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::message::mime::parse_media_type;
    use crate::message::section::BodyStructure;
    use crate::store::{ memory::MemoryKeyRing, Address, Signature, FLAG_RECEIVED };
    use mail_parser::{ MessageParser, MimeHeaders };

    fn message(kr: &MemoryKeyRing, body: &[u8], mime_type: &str) -> Message {
        Message {
            id: "msg-7".to_string(),
            subject: "Report".to_string(),
            sender: Address::new("Bob", "bob@example.com"),
            flags: FLAG_RECEIVED,
            time: 1_650_000_000,
            mime_type: mime_type.to_string(),
            body: kr.encrypt(body).unwrap(),
            ..Message::default()
        }
    }

    fn with_attachment(
        kr: &MemoryKeyRing,
        message: &mut Message,
        name: &str,
        mime_type: &str,
        disposition: &str,
        data: &[u8]
    ) -> (String, Vec<u8>) {
        let (packets, encrypted) = kr.encrypt_attachment(data);
        let id = format!("att-{}", message.attachments.len() + 1);
        message.attachments.push(Attachment {
            id: id.clone(),
            message_id: message.id.clone(),
            name: name.to_string(),
            mime_type: mime_type.to_string(),
            disposition: disposition.to_string(),
            key_packets: packets,
            ..Attachment::default()
        });
        (id, encrypted)
    }

    fn trimmed(data: &[u8]) -> &[u8] {
        let end = data.iter().rposition(|b| !b.is_ascii_whitespace()).map_or(0, |i| i + 1);
        &data[..end]
    }

    #[test]
    fn test_simple_message() {
        let kr = MemoryKeyRing::new(1);
        let literal = build_rfc822(&kr, &message(&kr, b"Hi there", "text/plain"), &HashMap::new(), &JobOptions::imap()).unwrap();
        let structure = BodyStructure::parse(&literal).unwrap();

        let header = structure.get_section_header(&[]).unwrap();
        let (media_type, params) = parse_media_type(header.get("Content-Type").unwrap());
        assert_eq!(media_type, "text/plain");
        assert_eq!(params.get("charset").map(String::as_str), Some("utf-8"));
        assert!(header.has("Content-Transfer-Encoding"));
        assert_eq!(header.get("Subject"), Some("Report"));
        assert_eq!(header.get_all("Message-Id").count(), 1);
        assert_eq!(header.get_all("Mime-Version").count(), 1);
        assert_eq!(header.get_all("Content-Type").count(), 1);

        let parsed = MessageParser::default().parse(&literal).unwrap();
        assert_eq!(parsed.body_text(0).unwrap().trim_end(), "Hi there");
    }

    #[test]
    fn test_non_ascii_text_survives_encoding() {
        let kr = MemoryKeyRing::new(1);
        let text = "Grüße aus Köln\r\n".repeat(20);
        let literal = build_rfc822(&kr, &message(&kr, text.as_bytes(), "text/plain"), &HashMap::new(), &JobOptions::imap()).unwrap();

        assert!(literal.is_ascii());
        let parsed = MessageParser::default().parse(&literal).unwrap();
        assert_eq!(parsed.body_text(0).unwrap().trim_end(), text.trim_end());
    }

    #[test]
    fn test_attachments_make_multipart_mixed() {
        let kr = MemoryKeyRing::new(1);
        let mut msg = message(&kr, b"<p>see attached</p>", "text/html");
        let mut data = HashMap::new();
        let (id, encrypted) = with_attachment(&kr, &mut msg, "a.pdf", "application/pdf", "attachment", b"%PDF-1.4");
        data.insert(id, encrypted);

        let literal = build_rfc822(&kr, &msg, &data, &JobOptions::imap()).unwrap();
        let structure = BodyStructure::parse(&literal).unwrap();
        let root = structure.imap_body_structure(&[]).unwrap();

        assert_eq!(root.mime_subtype, "mixed");
        assert_eq!(root.parts.len(), 2);
        assert_eq!(root.parts[0].mime_subtype, "html");
        assert_eq!(root.parts[1].params.get("name").map(String::as_str), Some("a.pdf"));
        assert_eq!(root.parts[1].encoding.as_deref().map(str::to_ascii_lowercase).as_deref(), Some("base64"));
        assert_eq!(trimmed(structure.get_section_content(&literal, &[2]).unwrap()), b"JVBERi0xLjQ=");

        let parsed = MessageParser::default().parse(&literal).unwrap();
        assert_eq!(parsed.attachment(0).unwrap().contents(), b"%PDF-1.4");
    }

    #[test]
    fn test_non_ascii_attachment_name() {
        let kr = MemoryKeyRing::new(1);
        let mut msg = message(&kr, b"body", "text/plain");
        let (id, encrypted) = with_attachment(&kr, &mut msg, "Bericht für Köln.pdf", "application/pdf", "attachment", b"pdf");
        let data = HashMap::from([(id, encrypted)]);

        let literal = build_rfc822(&kr, &msg, &data, &JobOptions::imap()).unwrap();
        assert!(literal.is_ascii());
        let parsed = MessageParser::default().parse(&literal).unwrap();
        assert_eq!(parsed.attachment(0).unwrap().attachment_name(), Some("Bericht für Köln.pdf"));
    }

    #[test]
    fn test_embedded_message_is_not_encoded() {
        let kr = MemoryKeyRing::new(1);
        let mut msg = message(&kr, b"forwarded", "text/plain");
        let inner = b"Subject: inner\r\nContent-Type: text/plain\r\n\r\ninner body\r\n";
        let (id, encrypted) = with_attachment(&kr, &mut msg, "fwd.eml", "message/rfc822", "attachment", inner);
        let data = HashMap::from([(id, encrypted)]);

        let literal = build_rfc822(&kr, &msg, &data, &JobOptions::imap()).unwrap();
        let structure = BodyStructure::parse(&literal).unwrap();
        let part = structure.get_section_header(&[2]).unwrap();
        assert_eq!(part.get("Content-Transfer-Encoding"), Some("7bit"));
        assert!(structure.get_section_content(&literal, &[2]).unwrap().starts_with(inner));
    }

    #[test]
    fn test_inline_attachments_are_related() {
        let kr = MemoryKeyRing::new(1);
        let mut msg = message(&kr, b"<img src=cid:x>", "text/html");
        let mut data = HashMap::new();
        let (id1, enc1) = with_attachment(&kr, &mut msg, "logo.png", "image/png", "inline", b"png");
        let (id2, enc2) = with_attachment(&kr, &mut msg, "doc.pdf", "application/pdf", "attachment", b"pdf");
        data.insert(id1, enc1);
        data.insert(id2, enc2);

        let literal = build_rfc822(&kr, &msg, &data, &JobOptions::imap()).unwrap();
        let root = BodyStructure::parse(&literal).unwrap().imap_body_structure(&[]).unwrap();

        assert_eq!(root.parts.len(), 2);
        assert_eq!(root.parts[0].mime_subtype, "related");
        assert_eq!(root.parts[0].parts.len(), 2);
        assert_eq!(root.parts[1].params.get("name").map(String::as_str), Some("doc.pdf"));
    }

    #[test]
    fn test_undecryptable_body_tolerant_and_strict() {
        let kr = MemoryKeyRing::new(1);
        let msg = message(&MemoryKeyRing::new(9), b"secret", "text/plain");

        let literal = build_rfc822(&kr, &msg, &HashMap::new(), &JobOptions::imap()).unwrap();
        let text = String::from_utf8_lossy(&literal);
        assert!(text.contains("multipart/mixed"));
        assert!(text.contains("Comment: This message could not be decrypted"));

        let strict = build_rfc822(&kr, &msg, &HashMap::new(), &JobOptions::default());
        assert!(matches!(strict, Err(BuildError::DecryptionFailed { .. })));
    }

    #[test]
    fn test_undecryptable_attachment_placeholder() {
        let kr = MemoryKeyRing::new(1);
        let mut msg = message(&kr, b"body", "text/plain");
        let other = MemoryKeyRing::new(4);
        let (id, encrypted) = with_attachment(&other, &mut msg, "x.pdf", "application/pdf", "attachment", b"data");
        let data = HashMap::from([(id, encrypted)]);

        let literal = build_rfc822(&kr, &msg, &data, &JobOptions::imap()).unwrap();
        let structure = BodyStructure::parse(&literal).unwrap();
        let part = structure.imap_body_structure(&[2]).unwrap();
        assert_eq!(part.mime_subtype, "pgp-encrypted");
        assert_eq!(part.params.get("name").map(String::as_str), Some("x.pdf.pgp"));
        assert!(String::from_utf8_lossy(&literal).contains("This attachment could not be decrypted"));
    }

    #[test]
    fn test_pgp_entity_merges_header() {
        let kr = MemoryKeyRing::new(1);
        let entity = b"Content-Type: multipart/alternative; boundary=q\r\n\r\n--q\r\nContent-Type: text/plain\r\n\r\nplain\r\n--q--\r\n";
        let literal = build_rfc822(&kr, &message(&kr, entity, "multipart/mixed"), &HashMap::new(), &JobOptions::imap()).unwrap();
        let structure = BodyStructure::parse(&literal).unwrap();

        assert_eq!(
            structure.get_section_header(&[]).unwrap().get("Content-Type"),
            Some("multipart/alternative; boundary=q")
        );
        assert_eq!(structure.get_section_content(&literal, &[1]).unwrap(), b"plain\r\n");
    }

    #[test]
    fn test_pgp_signed() {
        let kr = MemoryKeyRing::new(1);
        let mut msg = message(&kr, b"Content-Type: text/plain\r\n\r\nsigned text", "multipart/mixed");
        msg.body = kr.encrypt_signed(
            b"Content-Type: text/plain\r\n\r\nsigned text",
            &Signature { hash: "SHA256".to_string(), data: b"sig".to_vec() }
        );

        let literal = build_rfc822(&kr, &msg, &HashMap::new(), &JobOptions::imap()).unwrap();
        let structure = BodyStructure::parse(&literal).unwrap();
        let root = structure.imap_body_structure(&[]).unwrap();
        assert_eq!(root.mime_subtype, "signed");
        assert_eq!(root.params.get("micalg").map(String::as_str), Some("pgp-sha256"));
        assert_eq!(root.parts[1].mime_subtype, "pgp-signature");

        // The signed entity is passed through, not re-encoded.
        assert_eq!(trimmed(structure.get_section_content(&literal, &[1]).unwrap()), b"signed text");
        assert_eq!(structure.get_section_header(&[1]).unwrap().get("Content-Transfer-Encoding"), Some("7bit"));
    }

    #[test]
    fn test_pgp_fallback_when_undecryptable() {
        let kr = MemoryKeyRing::new(1);
        let msg = message(&MemoryKeyRing::new(2), b"entity", "multipart/mixed");
        let literal = build_rfc822(&kr, &msg, &HashMap::new(), &JobOptions::imap()).unwrap();
        let structure = BodyStructure::parse(&literal).unwrap();

        let root = structure.imap_body_structure(&[]).unwrap();
        assert_eq!(root.mime_subtype, "encrypted");
        assert_eq!(root.params.get("protocol").map(String::as_str), Some("application/pgp-encrypted"));
        assert_eq!(trimmed(structure.get_section_content(&literal, &[1]).unwrap()), b"Version: 1");
    }
}
