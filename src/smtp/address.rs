//! Envelope address grammar for `MAIL FROM:` and `RCPT TO:`, and the
//! recipient domain allow-list check.

use std::fmt;

use super::error::AddressError;

/// A `user@host` pair taken from the SMTP envelope.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct Address {
    pub user: String,
    pub host: String,
}

impl fmt::Display for Address {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}@{}", self.user, self.host)
    }
}

/// Which envelope keyword the arguments must carry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    From,
    To,
}

impl Direction {
    fn keyword(self) -> &'static str {
        match self {
            Direction::From => "FROM",
            Direction::To => "TO",
        }
    }
}

/// Parses the argument tokens of a MAIL or RCPT command.
///
/// Accepts `KEYWORD:<user@host>` as one token, or `KEYWORD:` and
/// `<user@host>` as two. The keyword must be upper case.
pub fn parse_address(args: &[String], direction: Direction) -> Result<Address, AddressError> {
    let expected = direction.keyword();
    let wrong_keyword = AddressError::WrongKeyword { expected };

    match args {
        [] => Err(AddressError::NoArguments),
        [single] => {
            let (keyword, rest) = single.split_once(':').ok_or(wrong_keyword.clone())?;
            if keyword != expected {
                return Err(wrong_keyword);
            }
            parse_bracketed(rest)
        }
        [keyword, bracketed] => {
            let keyword = keyword.strip_suffix(':').ok_or(wrong_keyword.clone())?;
            if keyword != expected {
                return Err(wrong_keyword);
            }
            parse_bracketed(bracketed)
        }
        _ => Err(AddressError::TooManyArguments(args.len())),
    }
}

// `<` optional-space local `@` domain optional-space `>`; the local part
// runs up to the last `@`.
fn parse_bracketed(text: &str) -> Result<Address, AddressError> {
    let malformed = || AddressError::Malformed(text.to_string());

    let inner = text
        .strip_prefix('<')
        .and_then(|s| s.strip_suffix('>'))
        .ok_or_else(malformed)?;
    let (user, host) = inner.trim().rsplit_once('@').ok_or_else(malformed)?;

    let invalid = |part: &str| {
        part.is_empty() || part.contains(|c: char| c.is_whitespace() || c == '<' || c == '>')
    };
    if invalid(user) || invalid(host) {
        return Err(malformed());
    }

    Ok(Address {
        user: user.to_string(),
        host: host.to_string(),
    })
}

/// Exact, case-sensitive membership test against the allow-list.
pub fn is_accepted_domain(host: &str, accepted: &[String]) -> bool {
    accepted.iter().any(|domain| domain == host)
}
