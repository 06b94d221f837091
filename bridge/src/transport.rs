//! Framed duplex channel to one worker process.
//!
//! A [`Transport`] owns a reader task and a writer task. The reader decodes
//! frames into [`TransportEvent`]s; the writer drains an outgoing queue. When
//! either side fails, a single [`TransportEvent::Closed`] is reported and the
//! transport is dead. A new worker always gets a new transport.

use std::time::Duration;

use serde_json::Value;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::process::Child;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use crate::codec::{FrameReader, FrameWriter};
use crate::error::BridgeError;
use crate::protocol::{self, Incoming};

const WRITER_CHANNEL_CAPACITY: usize = 64;

/// Byte streams to a freshly spawned worker, plus the child process if there is one.
pub struct Connection {
    reader: Box<dyn AsyncRead + Send + Unpin>,
    writer: Box<dyn AsyncWrite + Send + Unpin>,
    child: Option<Child>,
}

impl Connection {
    pub fn new<R, W>(reader: R, writer: W) -> Self
    where
        R: AsyncRead + Send + Unpin + 'static,
        W: AsyncWrite + Send + Unpin + 'static,
    {
        Self {
            reader: Box::new(reader),
            writer: Box::new(writer),
            child: None,
        }
    }

    /// Tie the worker's process to this connection so stopping it reaps the child.
    #[must_use]
    pub fn with_child(mut self, child: Child) -> Self {
        self.child = Some(child);
        self
    }
}

impl std::fmt::Debug for Connection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Connection")
            .field("child", &self.child.as_ref().and_then(Child::id))
            .finish_non_exhaustive()
    }
}

enum WriterCommand {
    Send(Value),
    Shutdown,
}

#[derive(Debug)]
pub(crate) enum TransportEvent {
    Frame(Incoming),
    /// The channel is gone. Carries a human-readable reason.
    Closed(String),
}

pub(crate) struct Transport {
    writer_tx: mpsc::Sender<WriterCommand>,
    events: mpsc::UnboundedReceiver<TransportEvent>,
    child: Option<Child>,
    reader_handle: JoinHandle<()>,
    writer_handle: JoinHandle<()>,
}

impl Transport {
    pub fn open(connection: Connection) -> Self {
        let Connection {
            reader,
            writer,
            child,
        } = connection;
        let (event_tx, events) = mpsc::unbounded_channel();

        let (writer_tx, mut writer_rx) = mpsc::channel::<WriterCommand>(WRITER_CHANNEL_CAPACITY);
        let writer_event_tx = event_tx.clone();
        let writer_handle = tokio::spawn(async move {
            let mut writer = FrameWriter::new(writer);
            while let Some(cmd) = writer_rx.recv().await {
                match cmd {
                    WriterCommand::Send(frame) => {
                        if let Err(e) = writer.write_frame(&frame).await {
                            tracing::warn!("Worker write error: {e}");
                            let _ = writer_event_tx.send(TransportEvent::Closed(e.to_string()));
                            return;
                        }
                    }
                    WriterCommand::Shutdown => break,
                }
            }
            let _ = writer.shutdown().await;
        });

        let reader_handle = tokio::spawn(async move {
            let mut reader = FrameReader::new(reader);
            loop {
                match reader.read_frame().await {
                    Ok(Some(body)) => {
                        tracing::trace!(bytes = body.len(), "Frame from worker");
                        let incoming = protocol::decode_response(&body);
                        if event_tx.send(TransportEvent::Frame(incoming)).is_err() {
                            break;
                        }
                    }
                    Ok(None) => {
                        tracing::info!("Worker closed its output");
                        let _ = event_tx.send(TransportEvent::Closed(
                            "worker closed the channel".to_string(),
                        ));
                        break;
                    }
                    Err(e) => {
                        tracing::warn!("Worker framing lost: {e}");
                        let _ = event_tx.send(TransportEvent::Closed(format!(
                            "unsynchronized framing: {e}"
                        )));
                        break;
                    }
                }
            }
        });

        Self {
            writer_tx,
            events,
            child,
            reader_handle,
            writer_handle,
        }
    }

    /// Queue one frame for the writer task.
    pub async fn send(&mut self, frame: Value) -> Result<(), BridgeError> {
        self.writer_tx
            .send(WriterCommand::Send(frame))
            .await
            .map_err(|_| BridgeError::ProcessCrashed("writer channel closed".to_string()))
    }

    /// Next event from the worker. A transport whose tasks are gone reports `Closed`.
    pub async fn next_event(&mut self) -> TransportEvent {
        self.events
            .recv()
            .await
            .unwrap_or_else(|| TransportEvent::Closed("transport tasks ended".to_string()))
    }

    /// Close our side and give the process `grace` to exit before killing it.
    pub async fn shutdown(mut self, grace: Duration) {
        let _ = self.writer_tx.send(WriterCommand::Shutdown).await;

        if let Some(mut child) = self.child.take() {
            if tokio::time::timeout(grace, child.wait()).await.is_err() {
                tracing::debug!("Worker didn't exit in time, killing");
                let _ = child.kill().await;
            }
        } else {
            let _ = tokio::time::timeout(grace, &mut self.writer_handle).await;
        }
        self.reader_handle.abort();
        self.writer_handle.abort();
    }
}

impl Drop for Transport {
    fn drop(&mut self) {
        self.reader_handle.abort();
        self.writer_handle.abort();
        if let Some(child) = self.child.as_mut() {
            let _ = child.start_kill();
        }
    }
}
