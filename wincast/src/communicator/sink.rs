//! Destinations for remote command output.

use std::{
    io,
    pin::Pin,
    sync::{Arc, Mutex, PoisonError},
    task::{Context, Poll},
};
use tokio::io::AsyncWrite;

use crate::ui::Ui;

/// An in-memory sink that can be read back after it was handed to a command.
#[derive(Clone, Debug, Default)]
pub struct SharedBuffer(Arc<Mutex<Vec<u8>>>);

impl SharedBuffer {
    pub fn contents(&self) -> Vec<u8> {
        self.0.lock().unwrap_or_else(PoisonError::into_inner).clone()
    }

    pub fn to_string_lossy(&self) -> String {
        String::from_utf8_lossy(&self.contents()).into_owned()
    }
}

impl AsyncWrite for SharedBuffer {
    fn poll_write(self: Pin<&mut Self>, _: &mut Context<'_>, buf: &[u8]) -> Poll<io::Result<usize>> {
        self.0
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .extend_from_slice(buf);
        Poll::Ready(Ok(buf.len()))
    }

    fn poll_flush(self: Pin<&mut Self>, _: &mut Context<'_>) -> Poll<io::Result<()>> {
        Poll::Ready(Ok(()))
    }

    fn poll_shutdown(self: Pin<&mut Self>, _: &mut Context<'_>) -> Poll<io::Result<()>> {
        Poll::Ready(Ok(()))
    }
}

/// Forwards complete lines to the build's [`Ui`].
pub struct UiSink {
    ui: Arc<dyn Ui>,
    pending: Vec<u8>,
}

impl UiSink {
    pub fn new(ui: Arc<dyn Ui>) -> Self {
        Self {
            ui,
            pending: Vec::new(),
        }
    }

    fn emit(&self, line: &[u8]) {
        let line = String::from_utf8_lossy(line);
        self.ui.message(line.trim_end_matches(['\r', '\n']));
    }
}

impl AsyncWrite for UiSink {
    fn poll_write(self: Pin<&mut Self>, _: &mut Context<'_>, buf: &[u8]) -> Poll<io::Result<usize>> {
        let this = self.get_mut();
        this.pending.extend_from_slice(buf);
        while let Some(end) = this.pending.iter().position(|b| *b == b'\n') {
            let line: Vec<u8> = this.pending.drain(..=end).collect();
            this.emit(&line);
        }
        Poll::Ready(Ok(buf.len()))
    }

    fn poll_flush(self: Pin<&mut Self>, _: &mut Context<'_>) -> Poll<io::Result<()>> {
        let this = self.get_mut();
        if !this.pending.is_empty() {
            let line = std::mem::take(&mut this.pending);
            this.emit(&line);
        }
        Poll::Ready(Ok(()))
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        self.poll_flush(cx)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ui::recording::RecordingUi;
    use tokio::io::AsyncWriteExt;

    #[tokio::test]
    async fn test_ui_sink_splits_lines() {
        let ui = Arc::new(RecordingUi::default());
        let mut sink = UiSink::new(ui.clone());

        sink.write_all(b"first\r\nsec").await.unwrap();
        sink.write_all(b"ond\nthi").await.unwrap();
        assert_eq!(ui.lines(), vec!["message: first", "message: second"]);

        sink.flush().await.unwrap();
        assert_eq!(ui.lines().last().unwrap(), "message: thi");
    }

    #[tokio::test]
    async fn test_shared_buffer() {
        let buffer = SharedBuffer::default();
        let mut writer = buffer.clone();
        writer.write_all(b"hello").await.unwrap();

        assert_eq!(buffer.to_string_lossy(), "hello");
    }
}
