//! Storage backends an archive is read from or written to.

use std::collections::BTreeMap;
use std::io::{self, Read, Write};

use anyhow::{bail, format_err, Error};
use tokio::sync::{mpsc, oneshot};

use ostar_tools::io::WriteClose;
use ostar_tools::sync::ChannelWriter;

use crate::locator::Reference;

pub mod local;
pub mod memory;
pub mod s3;

pub use local::LocalBackend;
pub use memory::MemoryStore;
pub use s3::S3Backend;

/// User metadata attached to a stored object.
pub type ObjectMetadata = BTreeMap<String, String>;

/// Number of in-flight chunks between a writer and its upload task.
const PIPE_CAPACITY: usize = 16;

/// Access to archives and members of one kind of storage.
pub trait Backend: Send + Sync {
    /// Size of the referenced file or object.
    fn stat(&self, reference: &Reference) -> Result<u64, Error>;

    /// Open for streaming reads, with the size when it is known up front.
    fn open_read(&self, reference: &Reference) -> Result<(Box<dyn Read + Send>, Option<u64>), Error>;

    /// Open a streaming writer. Data is only guaranteed to be stored once the writer was closed
    /// successfully.
    fn open_write(
        &self,
        reference: &Reference,
        metadata: &ObjectMetadata,
    ) -> Result<Box<dyn WriteClose>, Error>;

    /// Store everything `source` yields.
    fn upload_stream(
        &self,
        reference: &Reference,
        source: &mut dyn Read,
        metadata: &ObjectMetadata,
    ) -> Result<(), Error> {
        let mut writer = self.open_write(reference, metadata)?;
        // dropping an unclosed writer aborts the upload, a failed consumer reports through the
        // write error
        io::copy(source, &mut writer)
            .map_err(|err| format_err!("failed to upload {} - {}", reference, err))?;
        writer.close()
    }
}

/// Create a writer whose data is consumed by a separate (upload) task.
///
/// The consuming side reports its final result through [`PipeReader::complete`], which is
/// what [`PipeWriter::close`] returns.
pub fn pipe() -> (PipeWriter, PipeReader) {
    let (tx, rx) = mpsc::channel(PIPE_CAPACITY);
    let (done_tx, done_rx) = oneshot::channel();
    (
        PipeWriter {
            writer: ChannelWriter::new(tx),
            done: Some(done_rx),
            failed: None,
        },
        PipeReader {
            receiver: rx,
            done: done_tx,
        },
    )
}

pub struct PipeWriter {
    writer: ChannelWriter<String>,
    done: Option<oneshot::Receiver<Result<(), Error>>>,
    /// Consumer error picked up by a failed write, returned again on close.
    failed: Option<Error>,
}

impl PipeWriter {
    /// The consumer hung up. Fetch its result so the write fails with the real cause.
    fn consumer_error(&mut self, err: io::Error) -> io::Error {
        if let Some(failed) = &self.failed {
            return io::Error::new(io::ErrorKind::BrokenPipe, format!("{:#}", failed));
        }
        let done = match self.done.take() {
            Some(done) => done,
            None => return err,
        };
        match done.blocking_recv() {
            Ok(Err(failed)) => {
                let err = io::Error::new(io::ErrorKind::BrokenPipe, format!("{:#}", failed));
                self.failed = Some(failed);
                err
            }
            Ok(Ok(())) => {
                self.failed = Some(format_err!("upload finished before all data was written"));
                err
            }
            Err(_) => {
                self.failed = Some(format_err!("upload task vanished without a result"));
                err
            }
        }
    }
}

impl Write for PipeWriter {
    fn write(&mut self, buf: &[u8]) -> Result<usize, io::Error> {
        match self.writer.write(buf) {
            Ok(written) => Ok(written),
            Err(err) => Err(self.consumer_error(err)),
        }
    }

    fn flush(&mut self) -> Result<(), io::Error> {
        self.writer.flush()
    }
}

impl WriteClose for PipeWriter {
    fn close(&mut self) -> Result<(), Error> {
        if let Some(failed) = self.failed.take() {
            self.writer.finish();
            return Err(failed);
        }
        let done = match self.done.take() {
            Some(done) => done,
            None => return Ok(()),
        };
        self.writer.finish();
        match done.blocking_recv() {
            Ok(result) => result,
            Err(_) => bail!("upload task vanished without a result"),
        }
    }
}

impl Drop for PipeWriter {
    fn drop(&mut self) {
        if !self.writer.is_finished() {
            self.writer.abort("writer dropped before close".to_string());
        }
    }
}

pub struct PipeReader {
    receiver: mpsc::Receiver<Result<Vec<u8>, String>>,
    done: oneshot::Sender<Result<(), Error>>,
}

impl PipeReader {
    /// Next chunk of data, `None` once the writer was closed.
    pub async fn next_chunk(&mut self) -> Result<Option<Vec<u8>>, Error> {
        match self.receiver.recv().await {
            None => Ok(None),
            Some(Ok(chunk)) => Ok(Some(chunk)),
            Some(Err(msg)) => bail!("{}", msg),
        }
    }

    /// Like [`next_chunk`](Self::next_chunk), for consumers running on a plain thread.
    pub fn blocking_next_chunk(&mut self) -> Result<Option<Vec<u8>>, Error> {
        match self.receiver.blocking_recv() {
            None => Ok(None),
            Some(Ok(chunk)) => Ok(Some(chunk)),
            Some(Err(msg)) => bail!("{}", msg),
        }
    }

    /// Report the outcome to the writer.
    pub fn complete(self, result: Result<(), Error>) {
        let _ = self.done.send(result);
    }
}
