//! Byte pump between a PTY master and its caller
//!
//! A background task drains the master into a bounded [`OutputBuffer`] as soon
//! as the kernel reports it readable, so the child never stalls on a full PTY
//! while the caller is between polls. Writes go straight to the non-blocking
//! master and count every byte the kernel accepts, so an abandoned write can
//! be resumed without resending a prefix.

use crate::buffer::OutputBuffer;
use crate::session::SessionId;
use bytes::Bytes;
use std::fs::File;
use std::io::{self, Read, Write};
use std::sync::Arc;
use tokio::io::unix::AsyncFd;
use tokio::sync::{watch, Mutex};
use tokio::task::JoinHandle;
use tracing::{debug, trace, warn};

const READ_CHUNK: usize = 8192;

/// Upper bound on reads during the final drain, in case the child keeps
/// writing while being torn down.
const MAX_DRAIN_READS: usize = 64;

/// Output collected since the previous poll
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct OutputChunk {
    pub data: Bytes,
    /// Bytes dropped by the buffer cap since the previous poll
    pub dropped: u64,
}

impl OutputChunk {
    pub fn is_empty(&self) -> bool {
        self.data.is_empty() && self.dropped == 0
    }
}

/// Reader task plus write path for one session's PTY master
pub struct IoBridge {
    session: SessionId,
    master: Arc<AsyncFd<File>>,
    output: Arc<Mutex<OutputBuffer>>,
    stop: watch::Sender<bool>,
    reader: Option<JoinHandle<()>>,
}

impl IoBridge {
    /// Start pumping `master` into a buffer of `capacity` bytes.
    ///
    /// Must be called from within a tokio runtime.
    pub fn start(session: SessionId, master: Arc<AsyncFd<File>>, capacity: usize) -> Self {
        let output = Arc::new(Mutex::new(OutputBuffer::new(capacity)));
        let (stop, stop_rx) = watch::channel(false);

        let reader = tokio::spawn(pump_output(
            session,
            master.clone(),
            output.clone(),
            stop_rx,
        ));

        Self {
            session,
            master,
            output,
            stop,
            reader: Some(reader),
        }
    }

    /// Shared handle to the output buffer
    pub fn output(&self) -> &Arc<Mutex<OutputBuffer>> {
        &self.output
    }

    /// Write `data[*written..]` to the PTY, advancing `written` as the kernel
    /// accepts bytes.
    ///
    /// `written` is exact even if the future is dropped part way, so the
    /// caller knows which prefix reached the child.
    pub async fn write(&self, data: &[u8], written: &mut usize) -> io::Result<()> {
        while *written < data.len() {
            let mut guard = self.master.writable().await?;
            match guard.try_io(|inner| (&*inner.get_ref()).write(&data[*written..])) {
                Ok(Ok(0)) => return Err(io::ErrorKind::WriteZero.into()),
                Ok(Ok(n)) => *written += n,
                Ok(Err(e)) if e.kind() == io::ErrorKind::Interrupted => {}
                Ok(Err(e)) => return Err(e),
                Err(_would_block) => {}
            }
        }
        trace!(session = %self.session, bytes = data.len(), "wrote to PTY");
        Ok(())
    }

    /// Stop the reader task and pull whatever is still queued in the PTY into
    /// the buffer.
    pub async fn shutdown(&mut self) {
        let _ = self.stop.send(true);
        if let Some(reader) = self.reader.take() {
            if let Err(e) = reader.await {
                warn!(session = %self.session, "output reader task failed: {e}");
            }
        }

        let mut output = self.output.lock().await;
        if output.is_eof() {
            return;
        }

        let mut buf = [0u8; READ_CHUNK];
        for _ in 0..MAX_DRAIN_READS {
            match (&*self.master.get_ref()).read(&mut buf) {
                Ok(0) => break,
                Ok(n) => record_output(self.session, &mut output, &buf[..n]),
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(_) => break,
            }
        }
        output.mark_eof();
    }
}

impl Drop for IoBridge {
    fn drop(&mut self) {
        let _ = self.stop.send(true);
        if let Some(reader) = self.reader.take() {
            reader.abort();
        }
    }
}

async fn pump_output(
    session: SessionId,
    master: Arc<AsyncFd<File>>,
    output: Arc<Mutex<OutputBuffer>>,
    mut stop: watch::Receiver<bool>,
) {
    let mut buf = vec![0u8; READ_CHUNK];

    loop {
        tokio::select! {
            biased;

            _ = stopped(&mut stop) => {
                debug!(session = %session, "output reader stopped");
                return;
            }

            ready = master.readable() => {
                let mut guard = match ready {
                    Ok(guard) => guard,
                    Err(e) => {
                        warn!(session = %session, "PTY readiness error: {e}");
                        break;
                    }
                };

                match guard.try_io(|inner| (&*inner.get_ref()).read(&mut buf)) {
                    Ok(Ok(0)) => {
                        debug!(session = %session, "PTY reached end of file");
                        break;
                    }
                    Ok(Ok(n)) => {
                        let mut output = output.lock().await;
                        record_output(session, &mut output, &buf[..n]);
                    }
                    Ok(Err(e)) if e.kind() == io::ErrorKind::Interrupted => {}
                    // Linux reports a closed slave side as EIO
                    Ok(Err(e)) if e.raw_os_error() == Some(libc::EIO) => {
                        debug!(session = %session, "PTY slave closed");
                        break;
                    }
                    Ok(Err(e)) => {
                        warn!(session = %session, "PTY read error: {e}");
                        break;
                    }
                    Err(_would_block) => {}
                }
            }
        }
    }

    output.lock().await.mark_eof();
}

async fn stopped(stop: &mut watch::Receiver<bool>) {
    // A dropped sender also ends the wait
    let _ = stop.wait_for(|stopped| *stopped).await;
}

fn record_output(session: SessionId, output: &mut OutputBuffer, chunk: &[u8]) {
    let overflows = output.stats().overflows;
    let dropped = output.push(chunk);
    if output.stats().overflows > overflows {
        warn!(
            session = %session,
            capacity = output.capacity(),
            dropped,
            "output buffer full, dropping oldest bytes"
        );
    }
}
