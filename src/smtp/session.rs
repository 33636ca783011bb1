//! Per-connection SMTP state machine.
//!
//! A [`Session`] is owned by exactly one connection task. It consumes one
//! input line at a time and answers with a [`Step`] telling the caller what
//! to write, whether to close, and whether a finished message must be
//! dispatched first. No I/O happens here, which keeps every transition
//! testable without a socket.

use std::mem;
use std::net::SocketAddr;
use std::sync::Arc;

use tracing::{debug, warn};

use super::address::{parse_address, Address, Direction};
use super::command::{Command, Verb};
use super::email_parser::{EmailParser, NormalizedMessage};
use super::error::MessageRejected;
use super::reply::Reply;
use crate::config::Settings;

/// Column at which the synthesized `Received:` line is wrapped.
const RECEIVED_WIDTH: usize = 78;
const CONTINUATION_INDENT: &str = "        ";

/// Protocol state of one session.
#[derive(Debug, PartialEq, Eq, Clone, Copy)]
pub enum SessionState {
    /// Connected, no HELO/EHLO yet.
    Initial,
    /// Client identified itself; a mail transaction may start.
    Identified,
    /// Sender accepted, waiting for the recipient.
    MailFrom,
    /// Recipient accepted, waiting for DATA.
    RcptTo,
    /// Collecting message lines until the lone `.` terminator.
    Data,
    /// Reserved for STARTTLS. No transition leads here.
    TlsNegotiation,
}

/// What the connection handler has to do after a line was consumed.
#[derive(Debug)]
pub enum Step {
    /// Write the reply and keep reading.
    Reply(Reply),
    /// Write the reply, then close the connection.
    Close(Reply),
    /// A DATA line was buffered; nothing to write.
    Absorb,
    /// Dispatch `message`, and only then write `reply`.
    Deliver {
        message: Box<NormalizedMessage>,
        reply: Reply,
    },
    /// The finished DATA phase was refused; write `reply`.
    Rejected {
        reason: MessageRejected,
        reply: Reply,
    },
}

pub struct Session {
    settings: Arc<Settings>,
    state: SessionState,
    peer: SocketAddr,
    client_host: String,
    identity: Option<String>,
    from: Option<Address>,
    to: Option<Address>,
    buffer: Vec<u8>,
}

impl Session {
    pub fn new(settings: Arc<Settings>, peer: SocketAddr, client_host: String) -> Self {
        Session {
            settings,
            state: SessionState::Initial,
            peer,
            client_host,
            identity: None,
            from: None,
            to: None,
            buffer: Vec::new(),
        }
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    pub fn peer(&self) -> SocketAddr {
        self.peer
    }

    pub fn identity(&self) -> Option<&str> {
        self.identity.as_deref()
    }

    pub fn envelope(&self) -> (Option<&Address>, Option<&Address>) {
        (self.from.as_ref(), self.to.as_ref())
    }

    /// Raw message bytes accumulated so far in the current DATA phase.
    pub fn buffer(&self) -> &[u8] {
        &self.buffer
    }

    pub fn greeting(&self) -> Reply {
        Reply::new(
            220,
            format!("{} Running {}", self.settings.hostname, env!("CARGO_PKG_NAME")),
        )
    }

    pub fn idle_timeout_reply(&self) -> Reply {
        Reply::new(
            421,
            format!("{} idle timeout, closing connection", self.settings.hostname),
        )
    }

    /// Consumes one line, stripped of its line terminator.
    pub fn handle_line(&mut self, line: &[u8]) -> Step {
        if self.state == SessionState::Data {
            return self.handle_data_line(line);
        }

        let text = String::from_utf8_lossy(line);
        let command = Command::parse(&text);
        debug!("Session({:?}): {:?}", self.state, command.verb);

        // Verbs accepted in every command state.
        match command.verb {
            Verb::Quit => {
                return Step::Close(Reply::new(
                    221,
                    format!("{} closing connection", self.settings.hostname),
                ))
            }
            Verb::Rset => {
                self.reset();
                return Step::Reply(Reply::new(250, "Reset state"));
            }
            Verb::Noop => return Step::Reply(Reply::ok()),
            Verb::Help => return Step::Reply(help(&command.args)),
            Verb::Helo | Verb::Ehlo => return Step::Reply(self.handshake(&command)),
            Verb::Unknown => return Step::Reply(Reply::new(500, "Unrecognized command.")),
            _ => {}
        }

        let reply = match (self.state, command.verb) {
            (SessionState::Initial, _) => Reply::new(503, "EHLO/HELO first."),
            (SessionState::Identified, Verb::Mail) => self.mail(&command.args),
            (SessionState::Identified, verb) => {
                Reply::new(503, format!("Need MAIL before {verb}"))
            }
            (SessionState::MailFrom, Verb::Mail) | (SessionState::RcptTo, Verb::Mail) => {
                Reply::new(503, "Sender already specified")
            }
            (SessionState::MailFrom, Verb::Rcpt) => self.rcpt(&command.args),
            (SessionState::MailFrom, verb) => Reply::new(503, format!("Need RCPT before {verb}")),
            (SessionState::RcptTo, Verb::Rcpt) => Reply::new(503, "Recipient already specified"),
            (SessionState::RcptTo, Verb::Data) => self.start_data(),
            (SessionState::TlsNegotiation, _) => Reply::new(503, "TLS negotiation not available"),
            (state, verb) => {
                warn!("Unexpected {} in state {:?}", verb, state);
                Reply::new(503, "Bad sequence of commands")
            }
        };
        Step::Reply(reply)
    }

    fn reset(&mut self) {
        self.state = SessionState::Initial;
        self.identity = None;
        self.clear_transaction();
    }

    fn clear_transaction(&mut self) {
        self.from = None;
        self.to = None;
        self.buffer.clear();
    }

    fn handshake(&mut self, command: &Command) -> Reply {
        let Some(identity) = command.args.first() else {
            return Reply::new(501, format!("{} requires domain address", command.verb));
        };

        self.identity = Some(identity.clone());
        self.clear_transaction();
        self.state = SessionState::Identified;

        let hostname = &self.settings.hostname;
        if command.verb == Verb::Ehlo {
            Reply::multiline(
                250,
                [
                    format!(
                        "{} here, welcome {} [{}], pleased to meet you",
                        hostname, self.client_host, self.peer
                    ),
                    "HELP".to_string(),
                ],
            )
        } else {
            Reply::new(250, format!("{hostname} at your service"))
        }
    }

    fn mail(&mut self, args: &[String]) -> Reply {
        match parse_address(args, Direction::From) {
            Ok(address) => {
                let reply = Reply::new(250, format!("<{address}> sender OK"));
                self.from = Some(address);
                self.state = SessionState::MailFrom;
                reply
            }
            Err(e) => {
                debug!("MAIL rejected: {}", e);
                Reply::new(501, "Invalid parameters")
            }
        }
    }

    fn rcpt(&mut self, args: &[String]) -> Reply {
        let address = match parse_address(args, Direction::To) {
            Ok(address) => address,
            Err(e) => {
                debug!("RCPT rejected: {}", e);
                return Reply::new(501, "Invalid parameters");
            }
        };

        if !self.settings.accepts_domain(&address.host) {
            return Reply::new(550, format!("No such user: {address}"));
        }

        let reply = Reply::new(250, format!("<{address}> recipient OK"));
        self.to = Some(address);
        self.state = SessionState::RcptTo;
        reply
    }

    fn start_data(&mut self) -> Reply {
        self.buffer.clear();
        let received = format!(
            "Received: from {} ({}) by {} with {}; {}",
            self.client_host,
            self.peer,
            self.settings.hostname,
            env!("CARGO_PKG_NAME"),
            chrono::Local::now().to_rfc2822()
        );
        self.buffer
            .extend_from_slice(word_wrap(&received, RECEIVED_WIDTH).as_bytes());
        self.buffer.extend_from_slice(b"\r\n");
        self.state = SessionState::Data;
        Reply::new(354, "Go ahead, end your message with a single \".\"")
    }

    // Lines starting with ".." are kept as-is: no dot-unstuffing.
    fn handle_data_line(&mut self, line: &[u8]) -> Step {
        if line != b"." {
            self.buffer.extend_from_slice(line);
            self.buffer.extend_from_slice(b"\r\n");
            return Step::Absorb;
        }

        self.state = SessionState::Identified;
        let raw = mem::take(&mut self.buffer);
        let from = self.from.take().unwrap_or_default();
        let to = self.to.take().unwrap_or_default();

        match EmailParser::normalize(raw, &from, &to) {
            Ok(message) => Step::Deliver {
                message: Box::new(message),
                reply: Reply::new(250, "Message accepted for delivery"),
            },
            Err(reason) => {
                let reply = reason.reply();
                Step::Rejected { reason, reply }
            }
        }
    }
}

fn help(args: &[String]) -> Reply {
    if let Some(topic) = args.first() {
        return Reply::new(501, format!("No info available for {topic}"));
    }
    Reply::multiline(
        214,
        [
            format!("This is {} version {}", env!("CARGO_PKG_NAME"), env!("CARGO_PKG_VERSION")),
            "HELP topics:".to_string(),
            "\tHELO\tEHLO\tMAIL\tRCPT\tDATA".to_string(),
            "\tRSET\tNOOP\tQUIT\tHELP".to_string(),
            "For more info use \"HELP <topic>\".".to_string(),
            "For local information send email to Postmaster at your site.".to_string(),
            "End of HELP info".to_string(),
        ],
    )
}

/// Greedy word wrap; continuation lines start with eight spaces.
fn word_wrap(text: &str, width: usize) -> String {
    let mut words = text.split_whitespace();
    let Some(first) = words.next() else {
        return text.to_string();
    };

    let mut wrapped = first.to_string();
    let mut space_left = width.saturating_sub(first.len());
    for word in words {
        if word.len() + 1 > space_left {
            wrapped.push_str("\r\n");
            wrapped.push_str(CONTINUATION_INDENT);
            wrapped.push_str(word);
            space_left = width.saturating_sub(word.len());
        } else {
            wrapped.push(' ');
            wrapped.push_str(word);
            space_left -= 1 + word.len();
        }
    }
    wrapped
}
