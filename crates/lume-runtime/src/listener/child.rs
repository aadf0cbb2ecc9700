//! Listener process side of the link.
//!
//! A listener program hands its protocol library's transport factory to
//! [`serve_listener_stdio`]:
//!
//! ```no_run
//! use lume_runtime::listener::serve_listener_stdio;
//! use lume_runtime::transport::LocalHub;
//! use std::sync::Arc;
//!
//! fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     serve_listener_stdio(Arc::new(LocalHub::new()))?;
//!     Ok(())
//! }
//! ```
//!
//! The child rebuilds the registry from the start frame and runs the same
//! listener loop as an in-process context. Accepted changes travel to the
//! supervisor, which stamps them with update queue sequence numbers, so
//! stale-echo suppression behaves as it does in-process.

use super::context::{run_listener, ListenerSpec};
use super::error::ListenerFault;
use super::link::{self, HostFrame, ListenerFrame, StartFrame};
use crate::queue::{publish_queue, ChangeSink, Closed};
use crate::registry::VariableRegistry;
use crate::transport::TransportFactory;
use async_trait::async_trait;
use lume_types::{ErrorCode, Protocol, PvValue};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;
use thiserror::Error;
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncWrite, AsyncWriteExt, BufReader, Lines};
use tokio::sync::{mpsc, oneshot, watch};
use tracing::{debug, info, warn};

/// A listener process could not serve its link.
#[derive(Debug, Error)]
pub enum ListenerProcessError {
    #[error("listener handshake failed: {0}")]
    Handshake(String),

    #[error("listener process runtime could not be built: {0}")]
    Runtime(String),

    #[error(transparent)]
    Fault(#[from] ListenerFault),
}

impl ErrorCode for ListenerProcessError {
    fn code(&self) -> &'static str {
        match self {
            Self::Handshake(_) => "LISTENER_PROCESS_HANDSHAKE",
            Self::Runtime(_) => "LISTENER_PROCESS_RUNTIME",
            Self::Fault(fault) => fault.code(),
        }
    }

    fn is_recoverable(&self) -> bool {
        match self {
            Self::Fault(fault) => fault.is_recoverable(),
            Self::Handshake(_) | Self::Runtime(_) => false,
        }
    }
}

/// Serves the link on this process's stdin and stdout until the
/// supervisor asks the listener to stop or closes stdin.
///
/// # Errors
///
/// Returns the handshake failure or the fault that ended the listener.
pub fn serve_listener_stdio(factory: Arc<dyn TransportFactory>) -> Result<(), ListenerProcessError> {
    let runtime = tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
        .map_err(|e| ListenerProcessError::Runtime(e.to_string()))?;
    let result = runtime.block_on(serve_listener(
        factory,
        tokio::io::stdin(),
        tokio::io::stdout(),
    ));
    // stdin reads park a blocking thread that never returns on its own.
    runtime.shutdown_background();
    result
}

/// Serves the link over `input` and `output`.
///
/// Returns `Ok` when the input ends before a start frame arrives.
///
/// # Errors
///
/// Returns [`ListenerProcessError::Handshake`] when the start frame is
/// malformed or describes an invalid registry, and the listener's fault
/// when its transport failed.
pub async fn serve_listener<R, W>(
    factory: Arc<dyn TransportFactory>,
    input: R,
    output: W,
) -> Result<(), ListenerProcessError>
where
    R: AsyncRead + Unpin + Send + 'static,
    W: AsyncWrite + Unpin + Send + 'static,
{
    let (frames, frame_rx) = mpsc::unbounded_channel();
    let writer = tokio::spawn(write_frames(output, frame_rx));
    let mut lines = BufReader::new(input).lines();

    let start = match read_start(&mut lines).await {
        Ok(Some(start)) => start,
        Ok(None) => {
            debug!("input closed before start");
            drop(frames);
            let _ = writer.await;
            return Ok(());
        }
        Err(message) => return fail(frames, writer, message).await,
    };
    let protocol = start.protocol;

    let snapshot = match VariableRegistry::build(&start.variables, &start.epics) {
        Ok(mut registry) => match registry.restore(start.values) {
            Ok(()) => registry.snapshot(),
            Err(e) => return fail(frames, writer, format!("restoring values: {e}")).await,
        },
        Err(e) => return fail(frames, writer, format!("building registry: {e}")).await,
    };
    info!(%protocol, "listener process starting");

    let (publisher, publications) = publish_queue();
    let (shutdown_tx, shutdown) = watch::channel(false);
    let acks = Arc::new(Mutex::new(Acks::default()));

    let reader = tokio::spawn({
        let frames = frames.clone();
        let acks = Arc::clone(&acks);
        async move {
            while let Ok(Some(line)) = lines.next_line().await {
                match link::decode::<HostFrame>(&line) {
                    None => {}
                    Some(Ok(HostFrame::Publish { batch })) => {
                        if publisher.send_batch(batch).is_err() {
                            break;
                        }
                    }
                    Some(Ok(HostFrame::Enqueued { id, seq })) => acks.lock().settle(id, Some(seq)),
                    Some(Ok(HostFrame::Refused { id })) => acks.lock().settle(id, None),
                    Some(Ok(HostFrame::Shutdown)) => break,
                    Some(Ok(HostFrame::Start(_))) => warn!("ignoring second start frame"),
                    Some(Err(e)) => {
                        let _ = frames.send(ListenerFrame::Failed {
                            message: format!("malformed frame: {e}"),
                        });
                        break;
                    }
                }
            }
            shutdown_tx.send_replace(true);
            acks.lock().close();
        }
    });

    let (ready, ready_rx) = oneshot::channel();
    let announce = tokio::spawn({
        let frames = frames.clone();
        async move {
            if let Ok(Ok(())) = ready_rx.await {
                let _ = frames.send(ListenerFrame::Ready);
            }
        }
    });

    let outcome = run_listener(ListenerSpec {
        protocol,
        factory,
        env: start.env,
        snapshot,
        updates: Box::new(HostSink {
            frames: frames.clone(),
            acks,
        }),
        publications,
        shutdown,
        ready,
    })
    .await;

    let error = match &outcome {
        Err(ListenerFault::Transport { source, .. }) => Some(source.clone()),
        _ => None,
    };
    let _ = frames.send(ListenerFrame::Exit { error });
    reader.abort();
    let _ = reader.await;
    let _ = announce.await;
    drop(frames);
    let _ = writer.await;
    info!(%protocol, "listener process finished");
    outcome.map_err(Into::into)
}

/// Reads until the start frame. `Ok(None)` on end of input.
async fn read_start<R>(lines: &mut Lines<BufReader<R>>) -> Result<Option<StartFrame>, String>
where
    R: AsyncRead + Unpin,
{
    loop {
        let Some(line) = lines.next_line().await.map_err(|e| e.to_string())? else {
            return Ok(None);
        };
        match link::decode::<HostFrame>(&line) {
            None => {}
            Some(Ok(HostFrame::Start(start))) => return Ok(Some(start)),
            Some(Ok(HostFrame::Shutdown)) => return Ok(None),
            Some(Ok(other)) => return Err(format!("expected start, got {other:?}")),
            Some(Err(e)) => return Err(format!("malformed start frame: {e}")),
        }
    }
}

async fn fail(
    frames: mpsc::UnboundedSender<ListenerFrame>,
    writer: tokio::task::JoinHandle<()>,
    message: String,
) -> Result<(), ListenerProcessError> {
    warn!("listener handshake failed: {message}");
    let _ = frames.send(ListenerFrame::Failed {
        message: message.clone(),
    });
    drop(frames);
    let _ = writer.await;
    Err(ListenerProcessError::Handshake(message))
}

async fn write_frames<W>(mut output: W, mut frames: mpsc::UnboundedReceiver<ListenerFrame>)
where
    W: AsyncWrite + Unpin,
{
    while let Some(frame) = frames.recv().await {
        let line = match link::encode(&frame) {
            Ok(line) => line,
            Err(e) => {
                warn!("frame not encodable: {e}");
                continue;
            }
        };
        let written = match output.write_all(line.as_bytes()).await {
            Ok(()) => output.flush().await,
            Err(e) => Err(e),
        };
        if let Err(e) = written {
            debug!("supervisor pipe closed: {e}");
            break;
        }
    }
}

/// Changes sent to the supervisor and waiting for their sequence number.
#[derive(Default)]
struct Acks {
    next_id: u64,
    pending: HashMap<u64, oneshot::Sender<Option<u64>>>,
    /// The supervisor is gone; nothing will be acknowledged any more.
    closed: bool,
}

impl Acks {
    fn settle(&mut self, id: u64, seq: Option<u64>) {
        match self.pending.remove(&id) {
            Some(waiter) => {
                let _ = waiter.send(seq);
            }
            None => debug!(id, "acknowledgement for unknown changes"),
        }
    }

    fn close(&mut self) {
        self.closed = true;
        self.pending.clear();
    }
}

/// Forwards accepted changes to the supervisor.
struct HostSink {
    frames: mpsc::UnboundedSender<ListenerFrame>,
    acks: Arc<Mutex<Acks>>,
}

#[async_trait]
impl ChangeSink for HostSink {
    async fn push(&self, changes: Vec<(String, PvValue)>, _origin: Protocol) -> Result<u64, Closed> {
        let (waiter, acked) = oneshot::channel();
        let id = {
            let mut acks = self.acks.lock();
            if acks.closed {
                return Err(Closed);
            }
            let id = acks.next_id;
            acks.next_id += 1;
            acks.pending.insert(id, waiter);
            id
        };
        self.frames
            .send(ListenerFrame::Changes { id, changes })
            .map_err(|_| Closed)?;
        acked.await.ok().flatten().ok_or(Closed)
    }
}
