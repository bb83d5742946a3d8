//! Newline-delimited JSON channel to a sandboxed worker.

use std::io;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use palisade_core::{PalisadeError, Result};
use palisade_plugin::protocol::{self, Request, Status};
use serde_json::Value;
use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncRead, AsyncWrite, AsyncWriteExt, BufReader};
use tokio::sync::Mutex;
use tracing::debug;

type Reader = BufReader<Box<dyn AsyncRead + Send + Unpin>>;
type Writer = Box<dyn AsyncWrite + Send + Unpin>;

struct Pipes {
    reader: Reader,
    writer: Writer,
}

/// Request/response channel. One request is outstanding at a time.
pub struct IpcChannel {
    plugin: String,
    pipes: Mutex<Pipes>,
    max_response_bytes: usize,
    poisoned: AtomicBool,
}

enum LineRead {
    Line(Vec<u8>),
    TooLarge,
    Eof,
}

impl IpcChannel {
    pub fn new<R, W>(plugin: impl Into<String>, reader: R, writer: W, max_response_bytes: usize) -> Self
    where
        R: AsyncRead + Send + Unpin + 'static,
        W: AsyncWrite + Send + Unpin + 'static,
    {
        Self {
            plugin: plugin.into(),
            pipes: Mutex::new(Pipes {
                reader: BufReader::new(Box::new(reader)),
                writer: Box::new(writer),
            }),
            max_response_bytes,
            poisoned: AtomicBool::new(false),
        }
    }

    /// Whether an earlier timeout left the channel unusable.
    pub fn is_poisoned(&self) -> bool {
        self.poisoned.load(Ordering::Acquire)
    }

    /// Sends one request and waits up to `timeout` for its response.
    ///
    /// Returns the response object, whatever its status.
    pub async fn call(&self, action: &str, payload: Value, timeout: Duration) -> Result<Value> {
        let mut line = serde_json::to_vec(&Request::new(action, payload))?;
        line.push(b'\n');

        let mut pipes = self.pipes.lock().await;
        if self.is_poisoned() {
            return Err(self.dead("channel poisoned by an earlier timeout"));
        }

        debug!(plugin = %self.plugin, action, "ipc request");
        let exchange = async {
            pipes
                .writer
                .write_all(&line)
                .await
                .map_err(|e| self.io_dead(e))?;
            pipes.writer.flush().await.map_err(|e| self.io_dead(e))?;

            let read = read_bounded_line(&mut pipes.reader, self.max_response_bytes)
                .await
                .map_err(|e| self.io_dead(e))?;
            Ok::<_, PalisadeError>(read)
        };

        let read = match tokio::time::timeout(timeout, exchange).await {
            Ok(read) => read?,
            Err(_) => {
                self.poisoned.store(true, Ordering::Release);
                return Err(PalisadeError::IpcTimeout {
                    plugin: self.plugin.clone(),
                    timeout,
                });
            }
        };

        match read {
            LineRead::Eof => Err(self.dead("worker closed its stdout")),
            LineRead::TooLarge => Err(PalisadeError::ResponseTooLarge {
                plugin: self.plugin.clone(),
                limit: self.max_response_bytes,
            }),
            LineRead::Line(bytes) => {
                let response: Value =
                    serde_json::from_slice(&bytes).map_err(|e| PalisadeError::IpcProtocol {
                        plugin: self.plugin.clone(),
                        message: format!("invalid JSON response: {e}"),
                    })?;
                protocol::response_status(&response).map_err(|message| {
                    PalisadeError::IpcProtocol {
                        plugin: self.plugin.clone(),
                        message,
                    }
                })?;
                debug!(plugin = %self.plugin, action, status = %response["status"], "ipc response");
                Ok(response)
            }
        }
    }

    /// Sends a ping and requires an `ok` answer.
    pub async fn ping(&self, timeout: Duration) -> Result<()> {
        let response = self
            .call(protocol::PING_ACTION, Value::Object(Default::default()), timeout)
            .await?;
        match protocol::response_status(&response) {
            Ok(Status::Ok) => Ok(()),
            _ => Err(PalisadeError::IpcProtocol {
                plugin: self.plugin.clone(),
                message: format!("ping answered with {response}"),
            }),
        }
    }

    fn dead(&self, reason: &str) -> PalisadeError {
        PalisadeError::IpcProcessDead {
            plugin: self.plugin.clone(),
            reason: reason.to_string(),
        }
    }

    fn io_dead(&self, err: io::Error) -> PalisadeError {
        PalisadeError::IpcProcessDead {
            plugin: self.plugin.clone(),
            reason: err.to_string(),
        }
    }
}

/// Reads one line, keeping at most `limit` bytes. The remainder of an
/// oversized line is drained so the next read starts on a fresh line.
async fn read_bounded_line<R>(reader: &mut R, limit: usize) -> io::Result<LineRead>
where
    R: AsyncBufRead + Unpin,
{
    let mut line = Vec::new();
    let mut oversized = false;

    loop {
        let available = reader.fill_buf().await?;
        if available.is_empty() {
            return Ok(LineRead::Eof);
        }

        let newline = available.iter().position(|b| *b == b'\n');
        let chunk = match newline {
            Some(i) => &available[..i],
            None => available,
        };
        if !oversized {
            if line.len() + chunk.len() > limit {
                oversized = true;
                line = Vec::new();
            } else {
                line.extend_from_slice(chunk);
            }
        }

        let consumed = newline.map_or(available.len(), |i| i + 1);
        reader.consume(consumed);

        if newline.is_some() {
            return Ok(if oversized {
                LineRead::TooLarge
            } else {
                LineRead::Line(line)
            });
        }
    }
}
