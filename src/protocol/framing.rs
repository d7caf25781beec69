//! Line framing layer
//!
//! Both ldb channels carry newline-terminated text lines. This wrapper turns
//! the raw chunks of a transport into whole lines and terminates outgoing
//! messages.
//!
//! Framing format:
//! `<text>\n` (a trailing `\r` before the newline is stripped)

use crate::io::transport::Transport;
use async_trait::async_trait;
use std::collections::VecDeque;
use tracing::trace;

/// Error types for line framing
#[derive(Debug, thiserror::Error)]
pub enum LineFramingError<T: std::error::Error + Send + Sync + 'static> {
    #[error("Transport error: {0}")]
    Transport(T),

    #[error("Invalid line format: {0}")]
    InvalidFormat(String),

    #[error("Line too long: {size} bytes (max: {max})")]
    LineTooLong { size: usize, max: usize },
}

/// Maximum buffered line size to prevent memory exhaustion
const MAX_LINE_SIZE: usize = 4 * 1024 * 1024; // 4MB

/// Line framing wrapper
///
/// Wraps any transport so that `receive` yields exactly one line per call.
/// When the peer closes the connection with an unterminated line pending
/// (ldb sends `syntaxerror` this way), that remainder is returned once as a
/// final line before the transport error is reported.
pub struct LineFraming<T: Transport> {
    /// Underlying transport
    transport: T,

    /// Buffer for accumulating partial lines
    receive_buffer: String,

    /// Queue of complete lines ready to be returned
    line_queue: VecDeque<String>,
}

impl<T: Transport> LineFraming<T> {
    /// Create a new line framing wrapper around a transport
    pub fn new(transport: T) -> Self {
        Self {
            transport,
            receive_buffer: String::new(),
            line_queue: VecDeque::new(),
        }
    }

    /// Get a reference to the underlying transport
    pub fn transport(&self) -> &T {
        &self.transport
    }

    /// Unwrap and return the underlying transport
    pub fn into_transport(self) -> T {
        self.transport
    }

    /// Move every complete line of the receive buffer into the queue
    fn extract_lines(&mut self) {
        while let Some(end) = self.receive_buffer.find('\n') {
            let mut line: String = self.receive_buffer.drain(..=end).collect();
            line.pop();
            if line.ends_with('\r') {
                line.pop();
            }
            trace!("LineFraming: Parsed complete line ({} bytes)", line.len());
            self.line_queue.push_back(line);
        }
    }

    /// Read one chunk from the transport and split it into lines
    async fn process_transport_data(&mut self) -> Result<(), LineFramingError<T::Error>> {
        let new_data = match self.transport.receive().await {
            Ok(data) => data,
            Err(e) => {
                if self.receive_buffer.is_empty() {
                    return Err(LineFramingError::Transport(e));
                }
                let remainder = std::mem::take(&mut self.receive_buffer);
                trace!(
                    "LineFraming: Flushing unterminated line at end of stream ({} bytes)",
                    remainder.len()
                );
                self.line_queue
                    .push_back(remainder.trim_end_matches('\r').to_string());
                return Ok(());
            }
        };

        self.receive_buffer.push_str(&new_data);
        self.extract_lines();

        if self.receive_buffer.len() > MAX_LINE_SIZE {
            let size = self.receive_buffer.len();
            self.receive_buffer.clear();
            return Err(LineFramingError::LineTooLong {
                size,
                max: MAX_LINE_SIZE,
            });
        }

        Ok(())
    }
}

#[async_trait]
impl<T: Transport> Transport for LineFraming<T> {
    type Error = LineFramingError<T::Error>;

    async fn send(&mut self, message: &str) -> Result<(), Self::Error> {
        let body = message.strip_suffix('\n').unwrap_or(message);
        if body.contains('\n') {
            return Err(LineFramingError::InvalidFormat(format!(
                "embedded newline in {body:?}"
            )));
        }

        trace!("LineFraming: Sending line ({} bytes)", body.len());

        self.transport
            .send(&format!("{body}\n"))
            .await
            .map_err(LineFramingError::Transport)
    }

    async fn receive(&mut self) -> Result<String, Self::Error> {
        loop {
            if let Some(line) = self.line_queue.pop_front() {
                return Ok(line);
            }
            self.process_transport_data().await?;
        }
    }

    async fn close(&mut self) -> Result<(), Self::Error> {
        self.transport
            .close()
            .await
            .map_err(LineFramingError::Transport)
    }

    fn is_connected(&self) -> bool {
        self.transport.is_connected()
    }
}
