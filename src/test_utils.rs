//! Test utilities and global setup
//!
//! Provides centralized test logging configuration, a scripted command
//! sender and an in-process fake of the ldb debuggee.

/// Test logging utilities
#[cfg(all(test, feature = "test-logging"))]
pub mod logging {
    use std::sync::Once;
    use tracing_subscriber::{EnvFilter, fmt};

    static INIT: Once = Once::new();

    /// Initialize test logging globally - safe to call multiple times
    ///
    /// Respects `RUST_LOG`, defaulting to debug for this crate and info for
    /// tokio. Output goes through the test writer so it is captured per test.
    ///
    /// ```bash
    /// RUST_LOG=ldb_client::protocol=trace cargo test --features test-logging
    /// ```
    pub fn init() {
        INIT.call_once(|| {
            let env_filter = EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new("debug,tokio=info"));

            fmt()
                .with_env_filter(env_filter)
                .with_test_writer()
                .with_target(true)
                .with_thread_ids(true)
                .compact()
                .try_init()
                .ok(); // Ignore errors if already initialized by another test
        });
    }
}

/// Get the ldb path for integration tests
///
/// Checks `LDB_PATH` and falls back to `ldb` on the `PATH`.
#[cfg(all(test, feature = "ldb-integration-tests"))]
pub fn get_test_ldb_path() -> String {
    std::env::var("LDB_PATH").unwrap_or_else(|_| "ldb".to_string())
}

pub use scripted::ScriptedSender;

mod scripted {
    use async_trait::async_trait;
    use std::collections::VecDeque;
    use std::sync::Mutex;
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
    use std::time::Duration;

    use crate::protocol::codec::Command;
    use crate::protocol::command::{CommandError, CommandSender};

    /// [`CommandSender`] answering from a reply script
    ///
    /// Replies are consumed in order, one per request. Running out of replies
    /// behaves like a closed channel. Replies starting with `ERROR` are
    /// rejected the way the live channel rejects them.
    #[derive(Default)]
    pub struct ScriptedSender {
        replies: Mutex<VecDeque<String>>,
        sent: Mutex<Vec<String>>,
        round_trips: AtomicUsize,
        closed: AtomicBool,
    }

    impl ScriptedSender {
        pub fn new() -> Self {
            Self::default()
        }

        pub fn with_replies<I, S>(replies: I) -> Self
        where
            I: IntoIterator<Item = S>,
            S: Into<String>,
        {
            let sender = Self::new();
            for reply in replies {
                sender.push_reply(reply);
            }
            sender
        }

        pub fn push_reply(&self, reply: impl Into<String>) {
            self.replies.lock().unwrap().push_back(reply.into());
        }

        /// Command lines sent so far, without terminators
        pub fn sent_lines(&self) -> Vec<String> {
            self.sent.lock().unwrap().clone()
        }

        pub fn round_trips(&self) -> usize {
            self.round_trips.load(Ordering::SeqCst)
        }

        pub fn is_closed(&self) -> bool {
            self.closed.load(Ordering::SeqCst)
        }
    }

    #[async_trait]
    impl CommandSender for ScriptedSender {
        async fn request(&self, command: &Command) -> Result<String, CommandError> {
            self.request_with_timeout(command, None).await
        }

        async fn request_with_timeout(
            &self,
            command: &Command,
            _timeout: Option<Duration>,
        ) -> Result<String, CommandError> {
            if self.is_closed() {
                return Err(CommandError::Closed);
            }

            let line = command.to_string();
            self.sent.lock().unwrap().push(line.clone());
            self.round_trips.fetch_add(1, Ordering::SeqCst);

            let reply = self
                .replies
                .lock()
                .unwrap()
                .pop_front()
                .ok_or(CommandError::Closed)?;

            if reply.starts_with("ERROR") {
                return Err(CommandError::Rejected {
                    command: line,
                    reply,
                });
            }
            Ok(reply)
        }

        async fn close(&self) {
            self.closed.store(true, Ordering::SeqCst);
        }
    }
}

/// In-process fake of the ldb debuggee
#[cfg(test)]
pub mod fake_ldb {
    use std::net::{IpAddr, Ipv4Addr};
    use std::sync::{Arc, Mutex};
    use std::time::Duration;
    use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
    use tokio::net::TcpListener;
    use tokio::sync::mpsc;
    use tokio::task::JoinHandle;

    use crate::io::ports::PortPair;

    type Handler = dyn Fn(&str) -> String + Send + Sync;

    enum EventMessage {
        Line(String),
        Raw(String),
        Close,
    }

    /// TCP server speaking the ldb protocol on two ephemeral ports
    ///
    /// Accepts the command connection first and the event connection
    /// second, answering each command line with `handler(line)`.
    pub struct FakeLdb {
        ports: PortPair,
        commands: Arc<Mutex<Vec<String>>>,
        events: mpsc::UnboundedSender<EventMessage>,
        task: JoinHandle<()>,
    }

    impl FakeLdb {
        pub async fn start<H>(handler: H) -> Self
        where
            H: Fn(&str) -> String + Send + Sync + 'static,
        {
            let command_listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
            let event_listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
            let ports = PortPair {
                command: command_listener.local_addr().unwrap().port(),
                event: event_listener.local_addr().unwrap().port(),
            };

            let commands = Arc::new(Mutex::new(Vec::new()));
            let (events, event_receiver) = mpsc::unbounded_channel();
            let task = tokio::spawn(serve(
                command_listener,
                event_listener,
                Arc::new(handler),
                Arc::clone(&commands),
                event_receiver,
            ));

            Self {
                ports,
                commands,
                events,
                task,
            }
        }

        pub fn ports(&self) -> PortPair {
            self.ports
        }

        pub fn host(&self) -> IpAddr {
            IpAddr::V4(Ipv4Addr::LOCALHOST)
        }

        /// Push one newline-terminated event line
        pub fn push_event(&self, line: &str) {
            let _ = self.events.send(EventMessage::Line(line.to_string()));
        }

        /// Push text without a terminator
        pub fn push_raw_event(&self, text: &str) {
            let _ = self.events.send(EventMessage::Raw(text.to_string()));
        }

        /// Close the event socket, as the debuggee does when it exits
        pub fn close_events(&self) {
            let _ = self.events.send(EventMessage::Close);
        }

        /// Command lines received so far
        pub fn commands(&self) -> Vec<String> {
            self.commands.lock().unwrap().clone()
        }

        /// Wait until at least `count` commands have been received
        pub async fn wait_for_commands(&self, count: usize) -> Vec<String> {
            for _ in 0..200 {
                let commands = self.commands();
                if commands.len() >= count {
                    return commands;
                }
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
            panic!(
                "Expected {count} commands, received: {:?}",
                self.commands()
            );
        }

        pub async fn stop(self) {
            self.task.abort();
            let _ = self.task.await;
        }
    }

    async fn serve(
        command_listener: TcpListener,
        event_listener: TcpListener,
        handler: Arc<Handler>,
        commands: Arc<Mutex<Vec<String>>>,
        mut event_receiver: mpsc::UnboundedReceiver<EventMessage>,
    ) {
        let Ok((command_stream, _)) = command_listener.accept().await else {
            return;
        };
        let Ok((event_stream, _)) = event_listener.accept().await else {
            return;
        };

        let (command_read, mut command_write) = command_stream.into_split();
        let mut command_lines = BufReader::new(command_read).lines();
        let (_event_read, mut event_write) = event_stream.into_split();
        let mut events_open = true;

        loop {
            tokio::select! {
                line = command_lines.next_line() => {
                    let Ok(Some(line)) = line else { break };
                    commands.lock().unwrap().push(line.clone());
                    let reply = format!("{}\n", handler(&line));
                    if command_write.write_all(reply.as_bytes()).await.is_err() {
                        break;
                    }
                }
                message = event_receiver.recv(), if events_open => {
                    let text = match message {
                        Some(EventMessage::Line(line)) => format!("{line}\n"),
                        Some(EventMessage::Raw(text)) => text,
                        Some(EventMessage::Close) | None => {
                            let _ = event_write.shutdown().await;
                            events_open = false;
                            continue;
                        }
                    };
                    if event_write.write_all(text.as_bytes()).await.is_err() {
                        events_open = false;
                    }
                }
            }
        }

        let _ = event_write.shutdown().await;
    }
}

#[cfg(test)]
pub use fake_ldb::FakeLdb;
