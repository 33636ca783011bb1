//! Tokenizes a protocol line into a verb and its argument tokens.

use std::fmt;

/// The command verbs understood by the session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Verb {
    Noop,
    Ehlo,
    Helo,
    Help,
    Quit,
    Mail,
    Rcpt,
    Data,
    Rset,
    Unknown,
}

impl fmt::Display for Verb {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Verb::Noop => "NOOP",
            Verb::Ehlo => "EHLO",
            Verb::Helo => "HELO",
            Verb::Help => "HELP",
            Verb::Quit => "QUIT",
            Verb::Mail => "MAIL",
            Verb::Rcpt => "RCPT",
            Verb::Data => "DATA",
            Verb::Rset => "RSET",
            Verb::Unknown => "",
        };
        f.write_str(name)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Command {
    pub verb: Verb,
    pub args: Vec<String>,
}

impl Command {
    /// Parses one line, already stripped of its CRLF.
    ///
    /// The line is split on single spaces, so consecutive spaces yield empty
    /// argument tokens. Unrecognized verbs produce `Verb::Unknown` with no
    /// arguments; this never fails.
    pub fn parse(line: &str) -> Command {
        let mut tokens = line.trim().split(' ');
        let verb = match tokens.next().unwrap_or("").to_ascii_uppercase().as_str() {
            "NOOP" => Verb::Noop,
            "EHLO" => Verb::Ehlo,
            "HELO" => Verb::Helo,
            "HELP" => Verb::Help,
            "QUIT" => Verb::Quit,
            "MAIL" => Verb::Mail,
            "RCPT" => Verb::Rcpt,
            "DATA" => Verb::Data,
            "RSET" => Verb::Rset,
            _ => {
                return Command {
                    verb: Verb::Unknown,
                    args: Vec::new(),
                }
            }
        };
        Command {
            verb,
            args: tokens.map(str::to_string).collect(),
        }
    }
}
