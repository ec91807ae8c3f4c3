//! Message framed duplex transport for the session websocket.
//!
//! A [`Gateway`] wraps the two halves of an upgraded connection and exposes
//! typed JSON reads and writes bound to a [`Context`]. The gateway has its
//! own context, derived from the caller's, that ends when either side closes
//! the connection. When it ends for any reason other than a graceful
//! [`Gateway::finish`], the cause is sent to the peer as a [`ControlClose`]
//! frame before the connection is shut down.

use std::fmt::Display;
use std::pin::Pin;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use futures::{Sink, SinkExt, Stream, StreamExt};
use serde::Serialize;
use serde::de::DeserializeOwned;
use thiserror::Error;
use tokio::sync::{Mutex, mpsc};
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use crate::context::{CancelHandle, Cancelled, Context};
use crate::protocol::ControlClose;

/// Cause recorded when the peer hangs up without a control frame.
pub const CONNECTION_CLOSED: &str = "Websocket connection closed";

const INCOMING_BUFFER: usize = 16;

#[derive(Debug, Error)]
pub enum GatewayError {
    #[error(transparent)]
    Cancelled(#[from] Cancelled),

    #[error("Failed to write message: {0}")]
    Write(String),

    #[error("Failed to decode message: {0}")]
    Decode(#[from] serde_json::Error),
}

pub type Result<T> = std::result::Result<T, GatewayError>;

type BoxSink = Pin<Box<dyn Sink<String, Error = GatewayError> + Send>>;

struct Writer {
    sink: BoxSink,
    closed: bool,
}

pub struct Gateway {
    ctx: Context,
    cancel: CancelHandle,
    incoming: Mutex<mpsc::Receiver<String>>,
    writer: Arc<Mutex<Writer>>,
    graceful: Arc<AtomicBool>,
    closer: Mutex<Option<JoinHandle<()>>>,
}

impl Gateway {
    /// Wrap a connection. `sink` receives outgoing text frames and `stream`
    /// yields incoming ones.
    pub fn new<S, R, E>(parent: &Context, sink: S, stream: R) -> Self
    where
        S: Sink<String> + Send + 'static,
        S::Error: Display,
        R: Stream<Item = std::result::Result<String, E>> + Send + 'static,
        E: Display + Send + 'static,
    {
        let (ctx, cancel) = parent.with_cancel();
        let (tx, rx) = mpsc::channel(INCOMING_BUFFER);

        let sink: BoxSink = Box::pin(sink.sink_map_err(|e| GatewayError::Write(e.to_string())));
        let writer = Arc::new(Mutex::new(Writer {
            sink,
            closed: false,
        }));
        let graceful = Arc::new(AtomicBool::new(false));

        tokio::spawn(read_loop(ctx.clone(), cancel.clone(), stream, tx));

        let closer = tokio::spawn(close_on_cancel(
            ctx.clone(),
            writer.clone(),
            graceful.clone(),
        ));

        Self {
            ctx,
            cancel,
            incoming: Mutex::new(rx),
            writer,
            graceful,
            closer: Mutex::new(Some(closer)),
        }
    }

    /// The gateway's own context. Ends when the connection does.
    pub fn context(&self) -> &Context {
        &self.ctx
    }

    /// Next raw text frame, or the cause of whichever context ends first.
    pub async fn receive(&self, ctx: &Context) -> Result<String> {
        let mut incoming = self.incoming.lock().await;

        tokio::select! {
            biased;
            frame = incoming.recv() => match frame {
                Some(frame) => Ok(frame),
                None => Err(self.ctx.cancelled_cause().await.into()),
            },
            cause = self.ctx.cancelled_cause() => Err(cause.into()),
            cause = ctx.cancelled_cause() => Err(cause.into()),
        }
    }

    /// Next frame decoded as `T`.
    pub async fn receive_json<T: DeserializeOwned>(&self, ctx: &Context) -> Result<T> {
        let frame = self.receive(ctx).await?;
        Ok(serde_json::from_str(&frame)?)
    }

    /// Write `value` as one JSON text frame.
    pub async fn write<T: Serialize>(&self, value: &T) -> Result<()> {
        if let Some(cause) = self.ctx.cause() {
            return Err(cause.into());
        }

        let frame = serde_json::to_string(value)?;
        let mut writer = self.writer.lock().await;
        if writer.closed {
            return Err(GatewayError::Write("connection closed".to_string()));
        }

        writer.sink.send(frame).await
    }

    /// Send `cause` to the peer as a control close frame and shut down.
    pub async fn close(&self, cause: impl Display) {
        self.cancel.cancel_with(cause.to_string());
        self.wait_closed().await;
    }

    /// Shut down without reporting an error to the peer.
    pub async fn finish(&self) {
        self.graceful.store(true, Ordering::SeqCst);
        self.cancel.cancel_with(CONNECTION_CLOSED);
        self.wait_closed().await;
    }

    async fn wait_closed(&self) {
        let closer = self.closer.lock().await.take();
        if let Some(closer) = closer {
            if let Err(e) = closer.await {
                warn!("Websocket closer task failed: {}", e);
            }
        }
    }
}

impl Drop for Gateway {
    fn drop(&mut self) {
        self.cancel.cancel_with(CONNECTION_CLOSED);
    }
}

async fn read_loop<R, E>(
    ctx: Context,
    cancel: CancelHandle,
    stream: R,
    tx: mpsc::Sender<String>,
) where
    R: Stream<Item = std::result::Result<String, E>>,
    E: Display + Send,
{
    futures::pin_mut!(stream);

    loop {
        let frame = tokio::select! {
            frame = stream.next() => frame,
            _ = ctx.cancelled() => return,
        };

        match frame {
            Some(Ok(text)) => {
                if let Some(control) = ControlClose::from_json(&text) {
                    debug!(cause = %control.control_message, "Received control close");
                    cancel.cancel_with(control.control_message);
                    return;
                }

                if tx.send(text).await.is_err() {
                    return;
                }
            }
            Some(Err(e)) => {
                debug!("Websocket read failed: {}", e);
                cancel.cancel_with(CONNECTION_CLOSED);
                return;
            }
            None => {
                cancel.cancel_with(CONNECTION_CLOSED);
                return;
            }
        }
    }
}

async fn close_on_cancel(ctx: Context, writer: Arc<Mutex<Writer>>, graceful: Arc<AtomicBool>) {
    let cause = ctx.cancelled_cause().await;
    let mut writer = writer.lock().await;
    if writer.closed {
        return;
    }

    if !graceful.load(Ordering::SeqCst) && cause.message() != CONNECTION_CLOSED {
        let frame = ControlClose::new(cause.message()).to_json();
        if let Err(e) = writer.sink.send(frame).await {
            debug!("Failed to write control close: {}", e);
        }
    }

    if let Err(e) = writer.sink.close().await {
        debug!("Failed to close websocket: {}", e);
    }
    writer.closed = true;
}
