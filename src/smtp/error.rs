//! Error types for the SMTP front end.
//!
//! Protocol-level failures never end a session: each one maps onto a reply
//! and the connection stays open. Only transport failures (carried as
//! `anyhow::Error` by the connection handler) end the task.

use thiserror::Error;

use super::reply::Reply;

/// Failure to extract an address from `MAIL FROM:` / `RCPT TO:` arguments.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum AddressError {
    #[error("no address arguments")]
    NoArguments,

    #[error("too many address arguments ({0})")]
    TooManyArguments(usize),

    #[error("expected {expected}: keyword")]
    WrongKeyword { expected: &'static str },

    #[error("malformed address: {0:?}")]
    Malformed(String),
}

/// Content-Transfer-Encoding or MIME structure that could not be decoded.
#[derive(Debug, Error)]
pub enum DecodeError {
    #[error("invalid base64 payload: {0}")]
    Base64(#[from] base64::DecodeError),

    #[error("invalid MIME content: {0}")]
    Mime(#[from] mailparse::MailParseError),

    #[error("{0} content has no boundary parameter")]
    MissingBoundary(String),
}

/// Reasons a finished DATA phase is refused.
#[derive(Debug, Error)]
pub enum MessageRejected {
    #[error("message is not a parsable RFC822 message: {0}")]
    Unparsable(mailparse::MailParseError),

    #[error("malformed header field {0:?}")]
    MalformedHeader(String),

    #[error("message lacks a From or Subject header")]
    MissingHeaders,

    #[error("message content could not be decoded: {0}")]
    Decode(#[from] DecodeError),
}

impl MessageRejected {
    /// All rejections share the non-standard 541 code.
    pub fn reply(&self) -> Reply {
        let text = match self {
            MessageRejected::Unparsable(_) | MessageRejected::MalformedHeader(_) => {
                "Could not parse your message, rejected to reduce spam"
            }
            MessageRejected::MissingHeaders => {
                "Please supply From and Subject headers, rejected to reduce spam"
            }
            MessageRejected::Decode(_) => "Could not decode your message, rejected",
        };
        Reply::new(541, text)
    }
}
