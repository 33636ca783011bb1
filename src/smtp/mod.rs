pub mod address;
pub mod command;
pub mod email_parser;
pub mod error;
pub mod reply;
pub mod resolver;
pub mod session;
pub mod smtp_protocol;

pub use address::{is_accepted_domain, parse_address, Address, Direction};
pub use command::{Command, Verb};
pub use email_parser::{EmailParser, Headers, NormalizedMessage};
pub use error::{AddressError, DecodeError, MessageRejected};
pub use reply::Reply;
pub use resolver::{DnsReverseResolver, NoReverseLookup, ReverseResolver};
pub use session::{Session, SessionState, Step};

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use tokio::io::{AsyncRead, AsyncWrite, BufReader, BufWriter};
use tokio::net::TcpListener;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info};

use crate::config::Settings;
use crate::logging::{TraceEvent, TraceSender};
use resolver::{lookup_client_host, LOOKUP_TIMEOUT, UNKNOWN_HOST};
use smtp_protocol::SmtpProtocol;

pub type DispatchSender = mpsc::Sender<NormalizedMessage>;
pub type DispatchReceiver = mpsc::Receiver<NormalizedMessage>;

/// Everything a connection task needs, cloned once per accepted socket.
#[derive(Clone)]
pub struct ConnectionContext {
    pub settings: Arc<Settings>,
    pub resolver: Arc<dyn ReverseResolver>,
    pub trace: TraceSender,
    pub dispatch: DispatchSender,
}

impl ConnectionContext {
    async fn trace(&self, event: TraceEvent) {
        if self.trace.send(event).await.is_err() {
            debug!("Trace channel closed, dropping event");
        }
    }
}

/// Bounded channel between sessions and the delivery consumer.
pub fn dispatch_channel(capacity: usize) -> (DispatchSender, DispatchReceiver) {
    mpsc::channel(capacity)
}

pub async fn bind(settings: &Settings) -> Result<TcpListener> {
    let addr = format!("{}:{}", settings.bind_address, settings.port);
    let listener = TcpListener::bind(&addr)
        .await
        .with_context(|| format!("Failed to bind SMTP listener on {}", addr))?;
    info!("SMTP server listening on {}", addr);
    Ok(listener)
}

/// Accepts connections until `cancel` fires, one task per connection.
///
/// Sessions already running are not interrupted by cancellation.
pub async fn serve(listener: TcpListener, ctx: ConnectionContext, cancel: CancellationToken) {
    loop {
        tokio::select! {
            result = listener.accept() => {
                match result {
                    Ok((stream, peer)) => {
                        let ctx = ctx.clone();
                        tokio::spawn(async move {
                            if let Err(e) = handle_connection(stream, peer, ctx).await {
                                error!("Error handling SMTP connection from {}: {:#}", peer, e);
                            }
                        });
                    }
                    Err(e) => error!("Error accepting connection: {:?}", e),
                }
            }
            _ = cancel.cancelled() => {
                info!("SMTP listener shutting down gracefully");
                break;
            }
        }
    }
}

/// Drives one session over `stream` until QUIT, EOF, idle timeout or an I/O error.
pub async fn handle_connection<S>(stream: S, peer: SocketAddr, ctx: ConnectionContext) -> Result<()>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let client_host = match lookup_client_host(ctx.resolver.as_ref(), peer.ip(), LOOKUP_TIMEOUT).await {
        Ok(name) => name,
        Err(e) => {
            ctx.trace(TraceEvent::ResolveFailed { ip: peer.ip(), reason: e.to_string() })
                .await;
            UNKNOWN_HOST.to_string()
        }
    };
    ctx.trace(TraceEvent::Accepted { peer }).await;

    let (read_half, write_half) = tokio::io::split(stream);
    let mut protocol = SmtpProtocol::new(BufReader::new(read_half), BufWriter::new(write_half));
    let mut session = Session::new(Arc::clone(&ctx.settings), peer, client_host);
    let idle = Duration::from_secs(ctx.settings.idle_timeout_secs);

    let result = run_session(&mut protocol, &mut session, &ctx, idle).await;
    ctx.trace(TraceEvent::Closed { peer }).await;
    result
}

async fn run_session<R, W>(
    protocol: &mut SmtpProtocol<R, W>,
    session: &mut Session,
    ctx: &ConnectionContext,
    idle: Duration,
) -> Result<()>
where
    R: tokio::io::AsyncBufReadExt + Unpin,
    W: tokio::io::AsyncWriteExt + Unpin,
{
    let peer = session.peer();
    protocol.write_reply(&session.greeting()).await?;

    loop {
        let line = match tokio::time::timeout(idle, protocol.read_line()).await {
            Ok(line) => line?,
            Err(_) => {
                ctx.trace(TraceEvent::IdleTimeout { peer }).await;
                if let Err(e) = protocol.write_reply(&session.idle_timeout_reply()).await {
                    debug!("Could not send idle timeout reply to {}: {:#}", peer, e);
                }
                return Ok(());
            }
        };
        let Some(line) = line else {
            debug!("Connection closed by client (EOF). State: {:?}", session.state());
            return Ok(());
        };

        ctx.trace(TraceEvent::Line { peer, line: String::from_utf8_lossy(&line).into_owned() })
            .await;

        match session.handle_line(&line) {
            Step::Absorb => {}
            Step::Reply(reply) => protocol.write_reply(&reply).await?,
            Step::Close(reply) => {
                protocol.write_reply(&reply).await?;
                return Ok(());
            }
            Step::Deliver { message, reply } => {
                let event = TraceEvent::MessageAccepted {
                    peer,
                    from: message.envelope_from.to_string(),
                    to: message.envelope_to.to_string(),
                    subject: message.subject.clone(),
                };
                if ctx.dispatch.send(*message).await.is_err() {
                    error!("Dispatch channel closed, cannot deliver message from {}", peer);
                    protocol
                        .write_reply(&Reply::new(451, "Local error in processing, try again later"))
                        .await?;
                    continue;
                }
                ctx.trace(event).await;
                protocol.write_reply(&reply).await?;
            }
            Step::Rejected { reason, reply } => {
                ctx.trace(TraceEvent::MessageRejected { peer, reason: reason.to_string() })
                    .await;
                protocol.write_reply(&reply).await?;
            }
        }
    }
}
