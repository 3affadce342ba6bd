//! Per-connection handler
//!
//! Each accepted stream is driven through greeting, name negotiation, the
//! active read loop and finally teardown. Outbound lines go through a bounded
//! queue drained by a writer task; once the client is registered the
//! [`Session`](super::registry::Session) in the registry owns the only sender
//! for that queue.

use std::io;
use std::sync::Arc;
use std::time::Duration;

use chrono::Local;
use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt, BufWriter};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_stream::StreamExt;
use tokio_util::codec::{FramedRead, LinesCodec, LinesCodecError};
use tokio_util::sync::CancellationToken;

use super::dispatcher::Dispatcher;
use super::presence;
use super::registry::{ConnId, SharedRegistry};
use crate::config::ServerConfig;
use crate::protocol;

/// How long a closing connection gets to flush queued lines.
const WRITE_LINGER: Duration = Duration::from_secs(5);

/// Sent together once a name is accepted.
const WELCOME: [&str; 2] = [protocol::ACCEPTED, protocol::EXIT_HINT];

type LineReader<R> = FramedRead<R, LinesCodec>;

/// Why the active read loop ended
#[derive(Debug)]
enum Exit {
    Quit,
    Eof,
    /// I/O failure, or a line longer than the configured maximum.
    ReadError(LinesCodecError),
    /// The writer stopped on a write error.
    WriterGone,
    /// The session left the registry under us, e.g. dropped as stalled.
    HungUp,
}

impl Exit {
    fn departure(&self) -> Departure {
        match self {
            Exit::Quit | Exit::Eof | Exit::ReadError(_) => Departure::Left,
            Exit::WriterGone | Exit::HungUp => Departure::Lost,
        }
    }
}

/// How the remaining clients hear about a closed session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Departure {
    /// Quit, end of stream or a read failure.
    Left,
    /// The server could no longer write to the client.
    Lost,
}

impl Departure {
    fn notice(self, name: &str) -> String {
        match self {
            Departure::Left => protocol::departure_notice(name),
            Departure::Lost => protocol::failure_notice(name),
        }
    }
}

pub struct Connection {
    id: ConnId,
    peer: String,
    registry: SharedRegistry,
    dispatcher: Dispatcher,
    timestamps: bool,
    outbound_buffer: usize,
    max_line_length: usize,
}

impl Connection {
    pub fn new(
        id: ConnId,
        peer: impl Into<String>,
        registry: SharedRegistry,
        dispatcher: Dispatcher,
        config: &ServerConfig,
    ) -> Self {
        Self {
            id,
            peer: peer.into(),
            registry,
            dispatcher,
            timestamps: config.timestamps,
            // the welcome is queued in one go
            outbound_buffer: config.outbound_buffer.max(WELCOME.len()),
            max_line_length: config.max_line_length,
        }
    }

    /// Serve one client until it quits or the stream fails.
    pub async fn run<S>(self, stream: S)
    where
        S: AsyncRead + AsyncWrite + Send + 'static,
    {
        let (reader, writer) = tokio::io::split(stream);
        let (tx, rx) = mpsc::channel::<Arc<str>>(self.outbound_buffer);
        let mut pump = tokio::spawn(write_pump(writer, rx, self.id));
        let codec = LinesCodec::new_with_max_length(self.max_line_length);
        let mut lines = FramedRead::new(reader, codec);

        tx.send(Arc::from(protocol::GREETING)).await.ok();

        let (name, hangup) = match self.negotiate_name(&mut lines, &tx, &mut pump).await {
            Ok(accepted) => accepted,
            Err(exit) => {
                drop(tx);
                drop(lines);
                if !matches!(exit, Exit::WriterGone) {
                    linger(pump).await;
                }
                tracing::debug!(conn = %self.id, peer = %self.peer, exit = ?exit, "left during handshake");
                return;
            }
        };
        // From here on the registered session holds the only sender.
        drop(tx);

        let active = ActiveSession {
            id: self.id,
            registry: self.registry.clone(),
            dispatcher: self.dispatcher.clone(),
            closed: false,
        };

        self.dispatcher.broadcast(protocol::join_notice(&name)).await;
        presence::announce(&self.dispatcher).await;

        let exit = self.read_loop(&name, &mut lines, &mut pump, &hangup).await;
        match &exit {
            Exit::ReadError(e) => {
                tracing::debug!(conn = %self.id, name = %name, error = %e, "read failed")
            }
            other => tracing::debug!(conn = %self.id, name = %name, exit = ?other, "closing"),
        }

        active.close(exit.departure()).await;
        drop(lines);
        match exit {
            Exit::WriterGone => {}
            // Whatever is still queued won't be read.
            Exit::HungUp => pump.abort(),
            Exit::Quit | Exit::Eof | Exit::ReadError(_) => linger(pump).await,
        }
        tracing::info!(conn = %self.id, peer = %self.peer, name = %name, "connection closed");
    }

    /// Ask for a display name until one is accepted or the client goes away.
    async fn negotiate_name<R>(
        &self,
        lines: &mut LineReader<R>,
        tx: &mpsc::Sender<Arc<str>>,
        pump: &mut JoinHandle<()>,
    ) -> Result<(String, CancellationToken), Exit>
    where
        R: AsyncRead + Unpin,
    {
        loop {
            let line = tokio::select! {
                line = lines.next() => line,
                _ = &mut *pump => return Err(Exit::WriterGone),
            };
            let line = match line {
                Some(Ok(line)) => line,
                None => return Err(Exit::Eof),
                Some(Err(e)) => return Err(Exit::ReadError(e)),
            };

            // Claimed before the lock so the welcome can neither be dropped
            // nor overtaken by a broadcast.
            let welcome = tx
                .reserve_many(WELCOME.len())
                .await
                .map_err(|_| Exit::WriterGone)?;

            let accepted = {
                let mut registry = self.registry.lock().await;
                match registry.register(self.id, &line, tx) {
                    Ok(session) => {
                        let accepted = (session.name().to_string(), session.hangup());
                        for (permit, text) in welcome.zip(WELCOME) {
                            permit.send(Arc::from(text));
                        }
                        tracing::info!(
                            conn = %self.id,
                            peer = %self.peer,
                            name = %accepted.0,
                            total = registry.len(),
                            "session registered"
                        );
                        Ok(accepted)
                    }
                    Err(e) => {
                        drop(welcome);
                        Err(e)
                    }
                }
            };

            match accepted {
                Ok(accepted) => return Ok(accepted),
                Err(e) => {
                    tracing::debug!(conn = %self.id, reason = %e, "name rejected");
                    tx.send(Arc::from(protocol::rejection(&e))).await.ok();
                }
            }
        }
    }

    async fn read_loop<R>(
        &self,
        name: &str,
        lines: &mut LineReader<R>,
        pump: &mut JoinHandle<()>,
        hangup: &CancellationToken,
    ) -> Exit
    where
        R: AsyncRead + Unpin,
    {
        loop {
            // A dropped session must not relay anything it sent afterwards.
            let line = tokio::select! {
                biased;
                _ = hangup.cancelled() => return Exit::HungUp,
                _ = &mut *pump => return Exit::WriterGone,
                line = lines.next() => line,
            };
            match line {
                Some(Ok(line)) => {
                    if protocol::is_exit_command(&line) {
                        return Exit::Quit;
                    }
                    let at = self.timestamps.then(Local::now);
                    self.dispatcher
                        .broadcast(protocol::format_chat(name, &line, at))
                        .await;
                }
                None => return Exit::Eof,
                Some(Err(e)) => return Exit::ReadError(e),
            }
        }
    }
}

/// A registered session from the handler's side. Teardown runs exactly once:
/// explicitly through [`close`](Self::close), or from `Drop` if the handler
/// task is cancelled first.
struct ActiveSession {
    id: ConnId,
    registry: SharedRegistry,
    dispatcher: Dispatcher,
    closed: bool,
}

impl ActiveSession {
    async fn close(mut self, departure: Departure) {
        self.closed = true;
        teardown(self.registry.clone(), self.dispatcher.clone(), self.id, departure).await;
    }
}

impl Drop for ActiveSession {
    fn drop(&mut self) {
        if self.closed {
            return;
        }
        if let Ok(handle) = tokio::runtime::Handle::try_current() {
            handle.spawn(teardown(
                self.registry.clone(),
                self.dispatcher.clone(),
                self.id,
                Departure::Lost,
            ));
        }
    }
}

/// Remove the session and announce the departure. A session already removed
/// by the dispatcher was announced there, so nothing is sent twice.
async fn teardown(
    registry: SharedRegistry,
    dispatcher: Dispatcher,
    id: ConnId,
    departure: Departure,
) -> bool {
    let (removed, total) = {
        let mut registry = registry.lock().await;
        let removed = registry.remove(id);
        (removed, registry.len())
    };
    let Some(session) = removed else {
        return false;
    };
    let name = session.name().to_string();
    drop(session);
    tracing::info!(conn = %id, name = %name, total, ?departure, "session removed");

    dispatcher.broadcast(departure.notice(&name)).await;
    presence::announce(&dispatcher).await;
    true
}

/// Drain the outbound queue onto the stream, one line per message.
async fn write_pump<W>(writer: W, mut rx: mpsc::Receiver<Arc<str>>, id: ConnId)
where
    W: AsyncWrite + Unpin,
{
    let mut writer = BufWriter::new(writer);
    while let Some(line) = rx.recv().await {
        let mut result = write_line(&mut writer, &line).await;
        // Batch whatever is already queued into one flush.
        while result.is_ok() {
            match rx.try_recv() {
                Ok(line) => result = write_line(&mut writer, &line).await,
                Err(_) => break,
            }
        }
        let result = match result {
            Ok(()) => writer.flush().await,
            Err(e) => Err(e),
        };
        if let Err(e) = result {
            tracing::debug!(conn = %id, error = %e, "write failed");
            return;
        }
    }
    writer.shutdown().await.ok();
}

async fn write_line<W>(writer: &mut W, line: &str) -> io::Result<()>
where
    W: AsyncWrite + Unpin,
{
    writer.write_all(line.as_bytes()).await?;
    writer.write_all(b"\n").await
}

/// Give the writer a bounded amount of time to flush, then stop it.
async fn linger(mut pump: JoinHandle<()>) {
    if tokio::time::timeout(WRITE_LINGER, &mut pump).await.is_err() {
        pump.abort();
    }
}
