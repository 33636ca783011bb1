//! Turns the raw bytes accumulated during DATA into a [`NormalizedMessage`].
//!
//! The raw buffer is parsed as an RFC822 message with `mailparse`; the
//! `From`/`To` headers are resolved into display strings, and the body is
//! decoded down to plain text. Only `text/plain` content is kept: for
//! `multipart/*` messages the first `text/plain` part (one level deep) is
//! used and everything else is ignored.

use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use log::debug;
use mailparse::{addrparse, body::Body, MailAddr, MailHeaderMap, ParsedMail, SingleInfo};
use serde::{Serialize, Serializer};

use super::address::Address;
use super::error::{DecodeError, MessageRejected};

/// Header fields in first-seen order, each with every value it carried.
///
/// Names are matched case-insensitively; the first spelling seen is kept.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Headers(Vec<(String, Vec<String>)>);

impl Headers {
    pub fn append(&mut self, name: String, value: String) {
        match self.0.iter_mut().find(|(key, _)| key.eq_ignore_ascii_case(&name)) {
            Some((_, values)) => values.push(value),
            None => self.0.push((name, vec![value])),
        }
    }

    pub fn get_all(&self, name: &str) -> &[String] {
        self.0
            .iter()
            .find(|(key, _)| key.eq_ignore_ascii_case(name))
            .map(|(_, values)| values.as_slice())
            .unwrap_or(&[])
    }

    pub fn get_first(&self, name: &str) -> Option<&str> {
        self.get_all(name).first().map(String::as_str)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &[String])> {
        self.0.iter().map(|(key, values)| (key.as_str(), values.as_slice()))
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl Serialize for Headers {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_map(self.0.iter().map(|(key, values)| (key, values)))
    }
}

/// A fully accepted message, built once per completed DATA phase.
#[derive(Debug, Clone)]
pub struct NormalizedMessage {
    pub envelope_from: Address,
    pub envelope_to: Address,
    /// `From` header as a formatted mailbox, or its raw text if unparsable.
    pub from: String,
    /// `To` header mailboxes, or the envelope recipient if unparsable.
    pub to: Vec<String>,
    pub delivered_to: String,
    pub subject: String,
    pub headers: Headers,
    /// Decoded `text/plain` body.
    pub body: String,
    pub raw: Vec<u8>,
}

/// A namespace struct for message normalization.
pub struct EmailParser;

impl EmailParser {
    /// Parses and validates `raw`, consuming it into the resulting message.
    ///
    /// Fails when the buffer is not an RFC822 message, when `From` or
    /// `Subject` is missing or blank, or when the selected body part cannot
    /// be transfer-decoded.
    pub fn normalize(
        raw: Vec<u8>,
        envelope_from: &Address,
        envelope_to: &Address,
    ) -> Result<NormalizedMessage, MessageRejected> {
        let delivered_to = envelope_to.to_string();

        let (from, to, subject, headers, body) = {
            let parsed = mailparse::parse_mail(&raw).map_err(MessageRejected::Unparsable)?;
            if let Some(bad) = parsed.headers.iter().map(|h| h.get_key()).find(|k| !is_field_name(k)) {
                return Err(MessageRejected::MalformedHeader(bad));
            }
            let header_map = parsed.get_headers();

            let from_header = non_blank(header_map.get_first_value("From"));
            let subject = non_blank(header_map.get_first_value("Subject"));
            let (Some(from_header), Some(subject)) = (from_header, subject) else {
                return Err(MessageRejected::MissingHeaders);
            };

            let mut headers = Headers::default();
            for header in &parsed.headers {
                headers.append(header.get_key(), header.get_value());
            }

            let from = display_from(&from_header);
            let to = display_to(header_map.get_first_value("To"), &delivered_to);
            let body = decode_body(&parsed)?;
            (from, to, subject, headers, body)
        };

        debug!("Normalized message from {} to {:?} ({} header fields)", from, to, headers.len());

        Ok(NormalizedMessage {
            envelope_from: envelope_from.clone(),
            envelope_to: envelope_to.clone(),
            from,
            to,
            delivered_to,
            subject,
            headers,
            body,
            raw,
        })
    }
}

fn non_blank(value: Option<String>) -> Option<String> {
    value
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty())
}

fn format_mailbox(info: &SingleInfo) -> String {
    match &info.display_name {
        Some(name) => format!("\"{}\" <{}>", name, info.addr),
        None => info.addr.clone(),
    }
}

fn display_from(raw: &str) -> String {
    match addrparse(raw) {
        Ok(list) => match list.as_slice() {
            [MailAddr::Single(info)] => format_mailbox(info),
            _ => raw.to_string(),
        },
        Err(e) => {
            debug!("From header {:?} is not a mailbox: {}", raw, e);
            raw.to_string()
        }
    }
}

fn display_to(raw: Option<String>, delivered_to: &str) -> Vec<String> {
    let mailboxes: Vec<String> = raw
        .and_then(|raw| addrparse(&raw).ok())
        .map(|list| {
            list.iter()
                .flat_map(|addr| match addr {
                    MailAddr::Single(info) => vec![format_mailbox(info)],
                    MailAddr::Group(group) => group.addrs.iter().map(format_mailbox).collect(),
                })
                .collect()
        })
        .unwrap_or_default();

    if mailboxes.is_empty() {
        vec![delivered_to.to_string()]
    } else {
        mailboxes
    }
}

// RFC 5322 field-name: one or more printable ASCII characters except ':'.
fn is_field_name(name: &str) -> bool {
    !name.is_empty() && name.bytes().all(|b| (33..=126).contains(&b) && b != b':')
}

fn is_plain_text(part: &ParsedMail) -> bool {
    let mimetype = part.ctype.mimetype.as_str();
    mimetype.is_empty() || mimetype.eq_ignore_ascii_case("text/plain")
}

fn decode_body(parsed: &ParsedMail) -> Result<String, DecodeError> {
    if is_plain_text(parsed) {
        return decode_part(parsed);
    }

    if parsed.ctype.mimetype.to_ascii_lowercase().starts_with("multipart/") {
        if !parsed.ctype.params.contains_key("boundary") {
            return Err(DecodeError::MissingBoundary(parsed.ctype.mimetype.clone()));
        }
        match parsed.subparts.iter().find(|part| is_plain_text(part)) {
            Some(part) => return decode_part(part),
            None => debug!("Multipart message has no text/plain part"),
        }
    } else {
        debug!("Ignoring body of type {}", parsed.ctype.mimetype);
    }

    Ok(String::new())
}

fn decode_part(part: &ParsedMail) -> Result<String, DecodeError> {
    let encoding = part
        .get_headers()
        .get_first_value("Content-Transfer-Encoding")
        .map(|e| e.trim().to_ascii_lowercase());

    let bytes = match encoding.as_deref() {
        None | Some("") | Some("7bit") => raw_body(part),
        Some("base64") => decode_base64(&raw_body(part))?,
        Some("quoted-printable") => part.get_body_raw()?,
        Some(other) => {
            debug!("Passing through unhandled transfer encoding {:?}", other);
            raw_body(part)
        }
    };

    Ok(String::from_utf8_lossy(&bytes).into_owned())
}

// Undecoded body bytes, whatever transfer encoding mailparse detected.
fn raw_body(part: &ParsedMail) -> Vec<u8> {
    match part.get_body_encoded() {
        Body::Base64(body) | Body::QuotedPrintable(body) => body.get_raw().to_vec(),
        Body::SevenBit(body) | Body::EightBit(body) => body.get_raw().to_vec(),
        Body::Binary(body) => body.get_raw().to_vec(),
    }
}

/// Decodes a base64 payload, ignoring the line breaks and other whitespace
/// used to wrap it.
pub fn decode_base64(raw: &[u8]) -> Result<Vec<u8>, base64::DecodeError> {
    let compact: Vec<u8> = raw
        .iter()
        .copied()
        .filter(|b| !b.is_ascii_whitespace())
        .collect();
    STANDARD.decode(compact)
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn envelope() -> (Address, Address) {
        (
            Address { user: "a".into(), host: "b.com".into() },
            Address { user: "u".into(), host: "ictrek.nl".into() },
        )
    }

    fn normalize(raw: &str) -> Result<NormalizedMessage, MessageRejected> {
        let (from, to) = envelope();
        EmailParser::normalize(raw.as_bytes().to_vec(), &from, &to)
    }

    fn wrap_base64(data: &[u8]) -> String {
        let encoded = STANDARD.encode(data);
        encoded
            .as_bytes()
            .chunks(76)
            .map(|chunk| String::from_utf8_lossy(chunk).into_owned())
            .collect::<Vec<_>>()
            .join("\r\n")
    }

    #[test]
    fn plain_message() {
        let message = normalize("From: a@b.com\r\nSubject: hi\r\n\r\nhello\r\n").unwrap();
        assert_eq!(message.from, "a@b.com");
        assert_eq!(message.subject, "hi");
        assert_eq!(message.body, "hello\r\n");
        assert_eq!(message.to, vec!["u@ictrek.nl"]);
        assert_eq!(message.delivered_to, "u@ictrek.nl");
        assert_eq!(message.raw, b"From: a@b.com\r\nSubject: hi\r\n\r\nhello\r\n");
    }

    #[test]
    fn missing_subject_is_rejected() {
        let result = normalize("From: a@b.com\r\n\r\nhello\r\n");
        assert!(matches!(result, Err(MessageRejected::MissingHeaders)));
    }

    #[test]
    fn header_line_without_colon_is_unparsable() {
        let result = normalize("From: a@b.com\r\nSubject: hi\r\nthis line has no colon\r\n\r\nbody\r\n");
        assert!(matches!(result, Err(MessageRejected::MalformedHeader(_))));
        assert_eq!(result.unwrap_err().reply().code, 541);
    }

    #[test]
    fn field_names() {
        assert!(is_field_name("X-Custom_Id"));
        assert!(!is_field_name(""));
        assert!(!is_field_name("two words"));
        assert!(!is_field_name("tab\there"));
        assert!(!is_field_name("caf\u{e9}"));
    }

    #[test]
    fn blank_from_is_rejected() {
        let result = normalize("From:   \r\nSubject: hi\r\n\r\nhello\r\n");
        assert!(matches!(result, Err(MessageRejected::MissingHeaders)));
    }

    #[test]
    fn display_name_is_kept() {
        let message =
            normalize("From: Alice <alice@example.com>\r\nSubject: hi\r\n\r\nbody\r\n").unwrap();
        assert_eq!(message.from, "\"Alice\" <alice@example.com>");
    }

    #[test]
    fn to_header_lists_every_mailbox() {
        let message = normalize(
            "From: a@b.com\r\nTo: x@a.com, Yvonne <y@b.com>\r\nSubject: hi\r\n\r\nbody\r\n",
        )
        .unwrap();
        assert_eq!(message.to, vec!["x@a.com", "\"Yvonne\" <y@b.com>"]);
    }

    #[test]
    fn headers_keep_all_values_and_first_spelling() {
        let message = normalize(
            "Received: from one\r\nFrom: a@b.com\r\nreceived: from two\r\nSubject: hi\r\n\r\nbody\r\n",
        )
        .unwrap();
        assert_eq!(message.headers.get_all("Received"), ["from one", "from two"]);
        let names: Vec<&str> = message.headers.iter().map(|(name, _)| name).collect();
        assert_eq!(names, vec!["Received", "From", "Subject"]);
    }

    #[test]
    fn headers_serialize_as_map_of_lists() {
        let mut headers = Headers::default();
        headers.append("Subject".into(), "hi".into());
        headers.append("X-Tag".into(), "one".into());
        headers.append("x-tag".into(), "two".into());
        let json = serde_json::to_value(&headers).unwrap();
        assert_eq!(json["Subject"], serde_json::json!(["hi"]));
        assert_eq!(json["X-Tag"], serde_json::json!(["one", "two"]));
    }

    #[test]
    fn base64_body_is_decoded() {
        let raw = format!(
            "From: a@b.com\r\nSubject: hi\r\nContent-Transfer-Encoding: base64\r\n\r\n{}\r\n",
            wrap_base64("hello world".as_bytes())
        );
        assert_eq!(normalize(&raw).unwrap().body, "hello world");
    }

    #[test]
    fn malformed_base64_is_a_rejection() {
        let raw = "From: a@b.com\r\nSubject: hi\r\nContent-Transfer-Encoding: base64\r\n\r\n!!!not base64!!!\r\n";
        assert!(matches!(
            normalize(raw),
            Err(MessageRejected::Decode(DecodeError::Base64(_)))
        ));
    }

    #[test]
    fn quoted_printable_body_is_decoded() {
        let raw = "From: a@b.com\r\nSubject: hi\r\nContent-Transfer-Encoding: quoted-printable\r\n\r\ncaf=C3=A9\r\n";
        assert_eq!(normalize(raw).unwrap().body.trim_end(), "café");
    }

    #[test]
    fn html_only_message_has_empty_body() {
        let raw = "From: a@b.com\r\nSubject: hi\r\nContent-Type: text/html\r\n\r\n<p>hi</p>\r\n";
        assert_eq!(normalize(raw).unwrap().body, "");
    }

    #[test]
    fn multipart_takes_plain_part_after_html() {
        let raw = "From: a@b.com\r\n\
                   Subject: hi\r\n\
                   Content-Type: multipart/alternative; boundary=\"sep\"\r\n\
                   \r\n\
                   --sep\r\n\
                   Content-Type: text/html\r\n\
                   \r\n\
                   <p>html version</p>\r\n\
                   --sep\r\n\
                   Content-Type: text/plain\r\n\
                   \r\n\
                   plain version\r\n\
                   --sep--\r\n";
        let message = normalize(raw).unwrap();
        assert_eq!(message.body.trim_end(), "plain version");
        assert!(!message.body.contains("html"));
    }

    #[test]
    fn multipart_takes_first_plain_part_only() {
        let raw = "From: a@b.com\r\n\
                   Subject: hi\r\n\
                   Content-Type: multipart/mixed; boundary=\"sep\"\r\n\
                   \r\n\
                   --sep\r\n\
                   Content-Type: text/plain\r\n\
                   \r\n\
                   first\r\n\
                   --sep\r\n\
                   Content-Type: text/plain\r\n\
                   \r\n\
                   second\r\n\
                   --sep--\r\n";
        assert_eq!(normalize(raw).unwrap().body.trim_end(), "first");
    }

    #[test]
    fn multipart_part_uses_its_own_transfer_encoding() {
        let raw = format!(
            "From: a@b.com\r\n\
             Subject: hi\r\n\
             Content-Type: multipart/mixed; boundary=\"sep\"\r\n\
             \r\n\
             --sep\r\n\
             Content-Type: text/plain\r\n\
             Content-Transfer-Encoding: base64\r\n\
             \r\n\
             {}\r\n\
             --sep\r\n\
             Content-Type: application/octet-stream\r\n\
             \r\n\
             attachment\r\n\
             --sep--\r\n",
            wrap_base64("decoded part".as_bytes())
        );
        assert_eq!(normalize(&raw).unwrap().body, "decoded part");
    }

    #[test]
    fn multipart_without_plain_part_has_empty_body() {
        let raw = "From: a@b.com\r\n\
                   Subject: hi\r\n\
                   Content-Type: multipart/alternative; boundary=\"sep\"\r\n\
                   \r\n\
                   --sep\r\n\
                   Content-Type: text/html\r\n\
                   \r\n\
                   <p>only html</p>\r\n\
                   --sep--\r\n";
        assert_eq!(normalize(raw).unwrap().body, "");
    }

    #[test]
    fn multipart_without_boundary_is_a_rejection() {
        let raw = "From: a@b.com\r\n\
                   Subject: hi\r\n\
                   Content-Type: multipart/mixed\r\n\
                   \r\n\
                   --sep\r\n\
                   Content-Type: text/plain\r\n\
                   \r\n\
                   hidden\r\n\
                   --sep--\r\n";
        assert!(matches!(
            normalize(raw),
            Err(MessageRejected::Decode(DecodeError::MissingBoundary(_)))
        ));
    }

    proptest! {
        #[test]
        fn base64_round_trip(data in proptest::collection::vec(any::<u8>(), 0..512)) {
            let wrapped = wrap_base64(&data);
            prop_assert_eq!(decode_base64(wrapped.as_bytes()).unwrap(), data);
        }

        #[test]
        fn base64_text_body_round_trip(text in "[ -~]{1,300}") {
            let raw = format!(
                "From: a@b.com\r\nSubject: hi\r\nContent-Transfer-Encoding: base64\r\n\r\n{}\r\n",
                wrap_base64(text.as_bytes())
            );
            prop_assert_eq!(normalize(&raw).unwrap().body, text);
        }
    }
}
