use std::io::Write;

use tokio::sync::mpsc::Sender;

/// Wrapper around a bounded tokio `Sender`, which implements Write
///
/// Each write is translated into a blocking `send(Vec<u8>)`, so a slow receiver stalls the
/// writer. Must not be used from within an async context.
pub struct ChannelWriter<E> {
    sender: Option<Sender<Result<Vec<u8>, E>>>,
}

impl<E> ChannelWriter<E> {
    pub fn new(sender: Sender<Result<Vec<u8>, E>>) -> Self {
        Self {
            sender: Some(sender),
        }
    }

    /// Hand an error to the receiving side and hang up.
    pub fn abort(&mut self, err: E) {
        if let Some(sender) = self.sender.take() {
            let _ = sender.blocking_send(Err(err));
        }
    }

    /// Hang up, signalling the end of the stream to the receiver.
    pub fn finish(&mut self) {
        self.sender = None;
    }

    pub fn is_finished(&self) -> bool {
        self.sender.is_none()
    }
}

impl<E> Write for ChannelWriter<E> {
    fn write(&mut self, buf: &[u8]) -> Result<usize, std::io::Error> {
        let sender = self.sender.as_ref().ok_or_else(|| {
            std::io::Error::new(std::io::ErrorKind::BrokenPipe, "channel writer finished")
        })?;
        sender
            .blocking_send(Ok(buf.to_vec()))
            .map_err(|_| std::io::Error::new(std::io::ErrorKind::BrokenPipe, "receiver hung up"))
            .and(Ok(buf.len()))
    }

    fn flush(&mut self) -> Result<(), std::io::Error> {
        Ok(())
    }
}
