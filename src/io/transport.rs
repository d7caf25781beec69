//! Transport layer - Pure I/O abstraction for message exchange
//!
//! This module provides the core transport abstraction that handles
//! bidirectional exchange of raw text with the debuggee without knowledge
//! of line framing or of the ldb command vocabulary.

use async_trait::async_trait;
use std::collections::VecDeque;
use std::io;
use std::net::SocketAddr;
use std::sync::{Arc, Mutex};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{error, trace};

// ============================================================================
// Constants
// ============================================================================

/// Size of the read buffer for socket reading operations
const READ_BUFFER_SIZE: usize = 4096;

/// Default capacity for UTF-8 accumulation buffer
const UTF8_ACCUMULATION_BUFFER_CAPACITY: usize = 8192;

/// Core transport trait for bidirectional message exchange
#[async_trait]
pub trait Transport: Send + Sync {
    type Error: std::error::Error + Send + Sync + 'static;

    /// Send a message (raw string)
    async fn send(&mut self, message: &str) -> Result<(), Self::Error>;

    /// Receive the next chunk of text
    async fn receive(&mut self) -> Result<String, Self::Error>;

    /// Close the transport
    async fn close(&mut self) -> Result<(), Self::Error>;

    /// Check if transport is still active
    fn is_connected(&self) -> bool;
}

// ============================================================================
// TCP Transport Implementation
// ============================================================================

/// Error types for TCP transport
#[derive(Debug, thiserror::Error)]
pub enum TcpTransportError {
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    #[error("Transport is disconnected")]
    Disconnected,

    #[error("Channel error: {0}")]
    Channel(String),
}

/// Transport implementation over one TCP connection to the debuggee
#[derive(Debug)]
pub struct TcpTransport {
    /// Remote address, kept for diagnostics
    peer: Option<SocketAddr>,

    /// Channel for sending messages to the socket writer
    write_sender: Option<mpsc::UnboundedSender<String>>,

    /// Channel for receiving text from the socket reader
    read_receiver: Option<mpsc::UnboundedReceiver<String>>,

    /// Background reader task, aborted on close
    reader_task: Option<JoinHandle<()>>,

    /// Connection status
    connected: bool,
}

/// Internal state for the socket reader task that handles byte accumulation
struct SocketReaderState {
    /// Buffer for accumulating raw bytes before UTF-8 conversion
    byte_buffer: Vec<u8>,

    /// Buffer capacity to avoid frequent reallocations
    buffer_capacity: usize,
}

impl SocketReaderState {
    fn new() -> Self {
        Self {
            byte_buffer: Vec::with_capacity(UTF8_ACCUMULATION_BUFFER_CAPACITY),
            buffer_capacity: UTF8_ACCUMULATION_BUFFER_CAPACITY,
        }
    }

    fn add_bytes(&mut self, bytes: &[u8]) {
        self.byte_buffer.extend_from_slice(bytes);
    }

    /// Find the longest valid UTF-8 prefix in the buffer
    ///
    /// Lua strings are raw bytes, so an invalid sequence that can never
    /// become valid is replaced lossily instead of stalling the reader.
    fn extract_valid_utf8(&mut self) -> Option<String> {
        if self.byte_buffer.is_empty() {
            return None;
        }

        match std::str::from_utf8(&self.byte_buffer) {
            Ok(_) => {
                let bytes: Vec<u8> = self.byte_buffer.drain(..).collect();
                Some(String::from_utf8_lossy(&bytes).into_owned())
            }
            Err(e) => {
                let valid_end = e.valid_up_to();
                match e.error_len() {
                    // Incomplete trailing sequence: wait for more data
                    None if valid_end == 0 => None,
                    None => {
                        let bytes: Vec<u8> = self.byte_buffer.drain(..valid_end).collect();
                        Some(String::from_utf8_lossy(&bytes).into_owned())
                    }
                    // Invalid sequence in the middle of the data
                    Some(invalid_len) => {
                        let bytes: Vec<u8> =
                            self.byte_buffer.drain(..valid_end + invalid_len).collect();
                        Some(String::from_utf8_lossy(&bytes).into_owned())
                    }
                }
            }
        }
    }

    fn compact(&mut self) {
        if self.byte_buffer.capacity() > self.buffer_capacity * 2 {
            self.byte_buffer.shrink_to(self.buffer_capacity);
        }
    }
}

impl TcpTransport {
    /// Create a new TcpTransport from a connected stream
    pub fn new(stream: TcpStream) -> Self {
        let peer = stream.peer_addr().ok();
        let (read_half, write_half) = stream.into_split();

        let (write_sender, write_receiver) = mpsc::unbounded_channel();
        let (read_sender, read_receiver) = mpsc::unbounded_channel();

        tokio::spawn(Self::writer_task(write_half, write_receiver));
        let reader_task = tokio::spawn(Self::reader_task(read_half, read_sender));

        Self {
            peer,
            write_sender: Some(write_sender),
            read_receiver: Some(read_receiver),
            reader_task: Some(reader_task),
            connected: true,
        }
    }

    /// Connect to `addr` and wrap the stream
    pub async fn connect(addr: SocketAddr) -> Result<Self, TcpTransportError> {
        let stream = TcpStream::connect(addr).await?;
        stream.set_nodelay(true)?;
        Ok(Self::new(stream))
    }

    /// Remote address of the connection, if known
    pub fn peer(&self) -> Option<SocketAddr> {
        self.peer
    }

    /// Background task that writes messages to the socket
    async fn writer_task(
        mut write_half: OwnedWriteHalf,
        mut receiver: mpsc::UnboundedReceiver<String>,
    ) {
        while let Some(message) = receiver.recv().await {
            trace!("TcpTransport: Writing message (length: {})", message.len());

            if let Err(e) = write_half.write_all(message.as_bytes()).await {
                error!("Failed to write to socket: {}", e);
                break;
            }

            if let Err(e) = write_half.flush().await {
                error!("Failed to flush socket: {}", e);
                break;
            }
        }

        let _ = write_half.shutdown().await;
        trace!("TcpTransport: writer task finished");
    }

    /// Background task that reads from the socket with byte-safe UTF-8 handling
    async fn reader_task(mut read_half: OwnedReadHalf, sender: mpsc::UnboundedSender<String>) {
        let mut state = SocketReaderState::new();
        let mut read_buffer = Box::new([0u8; READ_BUFFER_SIZE]);

        loop {
            match read_half.read(read_buffer.as_mut()).await {
                Ok(0) => {
                    Self::handle_eof(&mut state, &sender);
                    break;
                }
                Ok(n) => {
                    state.add_bytes(&read_buffer[..n]);

                    while let Some(data) = state.extract_valid_utf8() {
                        if sender.send(data).is_err() {
                            trace!("TcpTransport: receiver dropped, stopping reader");
                            return;
                        }
                    }

                    state.compact();
                }
                Err(e) => {
                    error!("Failed to read from socket: {}", e);
                    break;
                }
            }
        }

        trace!("TcpTransport: reader task finished");
    }

    /// Forward whatever bytes are left when the peer closes the connection
    fn handle_eof(state: &mut SocketReaderState, sender: &mpsc::UnboundedSender<String>) {
        trace!("TcpTransport: reader reached EOF");

        if !state.byte_buffer.is_empty() {
            let remaining: Vec<u8> = state.byte_buffer.drain(..).collect();
            let final_string = String::from_utf8_lossy(&remaining).into_owned();
            if !final_string.is_empty() && sender.send(final_string).is_err() {
                trace!("TcpTransport: receiver dropped during EOF processing");
            }
        }
    }
}

#[async_trait]
impl Transport for TcpTransport {
    type Error = TcpTransportError;

    async fn send(&mut self, message: &str) -> Result<(), Self::Error> {
        if !self.connected {
            return Err(TcpTransportError::Disconnected);
        }

        let sender = self
            .write_sender
            .as_ref()
            .ok_or(TcpTransportError::Disconnected)?;

        sender
            .send(message.to_string())
            .map_err(|e| TcpTransportError::Channel(e.to_string()))?;

        Ok(())
    }

    async fn receive(&mut self) -> Result<String, Self::Error> {
        if !self.connected {
            return Err(TcpTransportError::Disconnected);
        }

        let receiver = self
            .read_receiver
            .as_mut()
            .ok_or(TcpTransportError::Disconnected)?;

        match receiver.recv().await {
            Some(data) => Ok(data),
            None => {
                self.connected = false;
                Err(TcpTransportError::Disconnected)
            }
        }
    }

    async fn close(&mut self) -> Result<(), Self::Error> {
        self.connected = false;
        self.write_sender.take();
        self.read_receiver.take();
        if let Some(task) = self.reader_task.take() {
            task.abort();
        }
        Ok(())
    }

    fn is_connected(&self) -> bool {
        self.connected
    }
}

impl Drop for TcpTransport {
    fn drop(&mut self) {
        if let Some(task) = self.reader_task.take() {
            task.abort();
        }
    }
}

// ============================================================================
// Mock Transport Implementation
// ============================================================================

/// Error type for mock transport
#[derive(Debug, thiserror::Error)]
pub enum MockTransportError {
    #[error("Transport is disconnected")]
    Disconnected,
    #[error("No more responses available")]
    NoMoreResponses,
}

/// Mock transport for testing - allows controlling sent/received messages
#[derive(Debug, Clone)]
pub struct MockTransport {
    /// Messages that were sent via this transport
    sent_messages: Arc<Mutex<Vec<String>>>,

    /// Predefined responses to return when receive() is called
    responses: Arc<Mutex<VecDeque<String>>>,

    /// Connection status
    connected: bool,
}

impl MockTransport {
    /// Create a new mock transport
    pub fn new() -> Self {
        Self {
            sent_messages: Arc::new(Mutex::new(Vec::new())),
            responses: Arc::new(Mutex::new(VecDeque::new())),
            connected: true,
        }
    }

    /// Create a mock transport with predefined responses
    pub fn with_responses<I, S>(responses: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let transport = Self::new();
        for response in responses {
            transport.add_response(response);
        }
        transport
    }

    /// Add a response that will be returned by a later receive() call
    ///
    /// Clones share their queues, so a test can keep one handle and feed
    /// responses after the transport has been moved into a channel.
    pub fn add_response(&self, response: impl Into<String>) {
        // Intentional .unwrap() - poisoned mutex indicates serious bug, panic is appropriate
        self.responses.lock().unwrap().push_back(response.into());
    }

    /// Get all messages that were sent via this transport
    pub fn sent_messages(&self) -> Vec<String> {
        self.sent_messages.lock().unwrap().clone()
    }

    /// Check if there are more responses available
    pub fn has_responses(&self) -> bool {
        !self.responses.lock().unwrap().is_empty()
    }
}

impl Default for MockTransport {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Transport for MockTransport {
    type Error = MockTransportError;

    async fn send(&mut self, message: &str) -> Result<(), Self::Error> {
        if !self.connected {
            return Err(MockTransportError::Disconnected);
        }

        self.sent_messages.lock().unwrap().push(message.to_string());
        Ok(())
    }

    async fn receive(&mut self) -> Result<String, Self::Error> {
        if !self.connected {
            return Err(MockTransportError::Disconnected);
        }

        let mut responses = self.responses.lock().unwrap();
        responses
            .pop_front()
            .ok_or(MockTransportError::NoMoreResponses)
    }

    async fn close(&mut self) -> Result<(), Self::Error> {
        self.connected = false;
        Ok(())
    }

    fn is_connected(&self) -> bool {
        self.connected
    }
}

// ============================================================================
// Tests
// ============================================================================
