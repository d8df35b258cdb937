//! The host session: newline delimited JSON in both directions
//!
//! Every line the host writes is a [`Request`]. Every line the daemon writes
//! is a [`HostMessage`], either the response to one of those requests or an
//! upcall pushed on the daemon's own initiative. Requests run concurrently,
//! so responses may come back in a different order than the requests went
//! out; the host matches them by `seqno`.

use fastn_helper_core::{Dispatcher, ErrorReply, HostMessage, Request, Response, UpcallReceiver};
use futures_util::StreamExt;
use std::path::Path;
use std::sync::Arc;
use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt};
use tokio::net::UnixListener;
use tokio::sync::{Mutex, mpsc};
use tokio_util::codec::{FramedRead, LinesCodec};
use tokio_util::sync::CancellationToken;

pub const SOCKET_FILE: &str = "helper.sock";

/// Longest request line accepted. Stream payloads ride inside as base64.
pub const MAX_REQUEST_LEN: usize = 16 * 1024 * 1024;

const RESPONSE_BUFFER: usize = 64;

/// Serves one host until it closes its side.
///
/// Upcalls not yet written when the host leaves stay queued in `upcalls`
/// for whoever attaches next.
pub async fn serve_host<R, W>(
    reader: R,
    mut writer: W,
    dispatcher: Dispatcher,
    upcalls: &mut UpcallReceiver,
) -> eyre::Result<()>
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    let mut lines = FramedRead::new(reader, LinesCodec::new_with_max_length(MAX_REQUEST_LEN));
    let (response_tx, mut response_rx) = mpsc::channel::<Response>(RESPONSE_BUFFER);
    // dropped when the host stops writing, so `response_rx` ends once the
    // last running request has answered
    let mut response_tx = Some(response_tx);

    loop {
        tokio::select! {
            line = lines.next(), if response_tx.is_some() => match line {
                Some(Ok(line)) => {
                    if let Some(tx) = &response_tx {
                        handle_line(&line, &dispatcher, tx);
                    }
                }
                Some(Err(e)) => {
                    tracing::warn!("host input unreadable, ending session: {e}");
                    response_tx = None;
                }
                None => {
                    tracing::debug!("host closed its input");
                    response_tx = None;
                }
            },
            response = response_rx.recv() => match response {
                Some(response) => write_message(&mut writer, &HostMessage::Response(response)).await?,
                None => break,
            },
            Some(upcall) = upcalls.recv() => {
                write_message(&mut writer, &HostMessage::Push(upcall)).await?;
            }
        }
    }

    writer.flush().await?;
    Ok(())
}

/// Starts answering one request line. Never waits: the session loop that
/// calls this is also the only reader of `responses`.
fn handle_line(line: &str, dispatcher: &Dispatcher, responses: &mpsc::Sender<Response>) {
    if line.trim().is_empty() {
        return;
    }

    let answer = match serde_json::from_str::<Request>(line) {
        Ok(request) => Answer::Dispatch(request),
        Err(e) => {
            // answerable only if the seqno can still be found
            let seqno = serde_json::from_str::<serde_json::Value>(line)
                .ok()
                .and_then(|value| value.get("seqno")?.as_u64());
            let Some(seqno) = seqno else {
                tracing::warn!("dropping request without a seqno: {e}");
                return;
            };
            tracing::warn!(seqno, "invalid request: {e}");
            Answer::Invalid(Response {
                seqno,
                result: Err(ErrorReply::invalid_request(e.to_string())),
            })
        }
    };

    let dispatcher = dispatcher.clone();
    let responses = responses.clone();
    tokio::spawn(async move {
        let response = match answer {
            Answer::Dispatch(request) => dispatcher.dispatch(request).await,
            Answer::Invalid(response) => response,
        };
        let seqno = response.seqno;
        if responses.send(response).await.is_err() {
            tracing::warn!(seqno, "session ended before the response was written");
        }
    });
}

enum Answer {
    Dispatch(Request),
    Invalid(Response),
}

async fn write_message<W: AsyncWrite + Unpin>(
    writer: &mut W,
    message: &HostMessage,
) -> eyre::Result<()> {
    let mut line = serde_json::to_string(message)?;
    line.push('\n');
    writer.write_all(line.as_bytes()).await?;
    writer.flush().await?;
    Ok(())
}

/// Serves the host over the daemon's own stdin and stdout.
pub async fn run_stdio(dispatcher: Dispatcher, mut upcalls: UpcallReceiver) -> eyre::Result<()> {
    eprintln!("🎧 Serving host on stdin/stdout");
    serve_host(
        tokio::io::stdin(),
        tokio::io::stdout(),
        dispatcher,
        &mut upcalls,
    )
    .await
}

/// Accepts hosts on `FASTN_HOME/helper.sock`, one at a time, until `cancel`.
///
/// A second host that connects while one is attached is turned away.
pub async fn run_socket(
    fastn_home: &Path,
    dispatcher: Dispatcher,
    upcalls: UpcallReceiver,
    cancel: CancellationToken,
) -> eyre::Result<()> {
    let socket_path = fastn_home.join(SOCKET_FILE);

    // Remove existing socket if it exists
    if socket_path.exists() {
        tokio::fs::remove_file(&socket_path).await?;
    }

    let listener = UnixListener::bind(&socket_path)?;
    eprintln!("🎧 Control socket listening on: {}", socket_path.display());

    let upcalls = Arc::new(Mutex::new(upcalls));
    loop {
        let stream = tokio::select! {
            _ = cancel.cancelled() => break,
            accepted = listener.accept() => match accepted {
                Ok((stream, _addr)) => stream,
                Err(e) => {
                    tracing::warn!("error accepting host connection: {e}");
                    continue;
                }
            },
        };

        let Ok(mut session) = upcalls.clone().try_lock_owned() else {
            tracing::warn!("a host is already attached, refusing connection");
            continue;
        };

        let dispatcher = dispatcher.clone();
        tokio::spawn(async move {
            eprintln!("📨 Host attached");
            let (reader, writer) = stream.into_split();
            if let Err(e) = serve_host(reader, writer, dispatcher, &mut session).await {
                tracing::warn!("host session failed: {e}");
            }
            eprintln!("📤 Host detached");
        });
    }

    if let Err(e) = tokio::fs::remove_file(&socket_path).await {
        tracing::debug!("could not remove {}: {e}", socket_path.display());
    }
    Ok(())
}
