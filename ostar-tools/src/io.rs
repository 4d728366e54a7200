//! Writers with an explicit, fallible close step.

use std::io::Write;

use anyhow::Error;

/// A byte sink which must be closed to complete.
///
/// Dropping a sink without calling [`close`](WriteClose::close) may discard buffered or
/// in-flight data (an object upload gets aborted, for instance). Closing twice is a no-op.
pub trait WriteClose: Write + Send {
    fn close(&mut self) -> Result<(), Error>;
}

impl<T: WriteClose + ?Sized> WriteClose for Box<T> {
    fn close(&mut self) -> Result<(), Error> {
        (**self).close()
    }
}

impl WriteClose for std::fs::File {
    fn close(&mut self) -> Result<(), Error> {
        self.flush()?;
        Ok(())
    }
}

impl WriteClose for Vec<u8> {
    fn close(&mut self) -> Result<(), Error> {
        Ok(())
    }
}

/// Wraps a standard stream so that closing only flushes it.
pub struct NoClose<W>(W);

impl<W> NoClose<W> {
    pub fn new(inner: W) -> Self {
        Self(inner)
    }
}

impl<W: Write> Write for NoClose<W> {
    fn write(&mut self, buf: &[u8]) -> Result<usize, std::io::Error> {
        self.0.write(buf)
    }

    fn flush(&mut self) -> Result<(), std::io::Error> {
        self.0.flush()
    }
}

impl<W: Write + Send> WriteClose for NoClose<W> {
    fn close(&mut self) -> Result<(), Error> {
        self.0.flush()?;
        Ok(())
    }
}
