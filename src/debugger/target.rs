//! Debug target
//!
//! Owns the command channel and the event listener of one debuggee and
//! drives the run state machine. Events are consumed on a dedicated task in
//! arrival order; every suspension rebuilds the stack snapshot before it is
//! announced to subscribers.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use tokio::sync::{broadcast, mpsc};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, trace, warn};

use crate::debugger::config::SessionConfig;
use crate::debugger::error::DebugError;
use crate::debugger::state::RunState;
use crate::io::transport::Transport;
use crate::model::{StackFrame, StackSnapshot, ThreadId, Value, Variable};
use crate::protocol::codec::{self, Command, StepKind};
use crate::protocol::command::{CommandChannel, CommandSender, SharedCommandChannel};
use crate::protocol::event::{DebugEvent, EventChannel, LdbEventParser, SuspendReason};

/// Notification delivered to session subscribers
#[derive(Debug, Clone)]
pub enum DebugNotification {
    /// Run state changed
    StateChanged { state: RunState },

    /// Debuggee stopped; the snapshot holds the rebuilt call stack
    Suspended {
        reason: SuspendReason,
        snapshot: Arc<StackSnapshot>,
    },

    /// A `setvar` was accepted for this local
    ValueChanged { frame: usize, name: String },

    /// Script failed to load
    SyntaxError { file: String, message: String },

    /// Something went wrong that did not end the session
    Error { message: String },
}

/// State shared between the public handle and the event loop
struct Inner {
    sender: Arc<dyn CommandSender>,
    state: Mutex<RunState>,
    snapshot: Mutex<Option<Arc<StackSnapshot>>>,
    generation: AtomicU64,
    notifications: broadcast::Sender<DebugNotification>,
    cancel: CancellationToken,
    config: SessionConfig,
}

/// One attached debuggee
pub struct DebugTarget {
    inner: Arc<Inner>,
    events: tokio::sync::Mutex<Option<EventChannel>>,
    listener_cancel: Option<CancellationToken>,
    event_loop: Mutex<Option<JoinHandle<()>>>,
}

impl DebugTarget {
    /// Attach to a debuggee whose command and event sockets are connected
    pub fn attach<C, E>(command_transport: C, event_transport: E, config: SessionConfig) -> Self
    where
        C: Transport + 'static,
        E: Transport + 'static,
    {
        let channel = CommandChannel::new(command_transport, config.request_timeout);
        let sender: Arc<dyn CommandSender> = Arc::new(SharedCommandChannel::new(channel));

        let (event_sender, event_receiver) = mpsc::unbounded_channel();
        let listener =
            EventChannel::spawn(event_transport, LdbEventParser::default(), event_sender);

        let mut target = Self::new(sender, event_receiver, config);
        target.listener_cancel = Some(listener.cancel_token());
        target.events = tokio::sync::Mutex::new(Some(listener));
        target
    }

    /// Build a target over any command sender and event queue
    ///
    /// The target stays in `Connecting` until the debuggee's first event.
    pub fn new(
        sender: Arc<dyn CommandSender>,
        events: mpsc::UnboundedReceiver<DebugEvent>,
        config: SessionConfig,
    ) -> Self {
        let (notifications, _) = broadcast::channel(config.notification_capacity.max(1));
        let inner = Arc::new(Inner {
            sender,
            state: Mutex::new(RunState::Connecting),
            snapshot: Mutex::new(None),
            generation: AtomicU64::new(0),
            notifications,
            cancel: CancellationToken::new(),
            config,
        });

        let event_loop = tokio::spawn(run_event_loop(Arc::clone(&inner), events));

        Self {
            inner,
            events: tokio::sync::Mutex::new(None),
            listener_cancel: None,
            event_loop: Mutex::new(Some(event_loop)),
        }
    }

    // ------------------------------------------------------------------------
    // State
    // ------------------------------------------------------------------------

    pub fn state(&self) -> RunState {
        self.inner.state()
    }

    pub fn suspend_reason(&self) -> Option<SuspendReason> {
        self.inner.state().suspend_reason().cloned()
    }

    pub fn is_terminated(&self) -> bool {
        self.inner.state().is_terminated()
    }

    pub fn can_resume(&self) -> bool {
        self.inner.state().can_resume()
    }

    pub fn can_step(&self) -> bool {
        self.inner.state().can_step()
    }

    pub fn can_suspend(&self) -> bool {
        self.inner.state().can_suspend()
    }

    pub fn can_terminate(&self) -> bool {
        self.inner.state().can_terminate()
    }

    pub fn config(&self) -> &SessionConfig {
        &self.inner.config
    }

    /// Receive state changes, suspensions and value changes
    pub fn subscribe(&self) -> broadcast::Receiver<DebugNotification> {
        self.inner.notifications.subscribe()
    }

    // ------------------------------------------------------------------------
    // Run control
    // ------------------------------------------------------------------------

    pub async fn resume(&self) -> Result<(), DebugError> {
        self.continue_with("resume", Command::Resume).await
    }

    pub async fn step_into(&self) -> Result<(), DebugError> {
        self.continue_with("step into", Command::Step(StepKind::Into)).await
    }

    pub async fn step_over(&self) -> Result<(), DebugError> {
        self.continue_with("step over", Command::Step(StepKind::Over)).await
    }

    pub async fn step_return(&self) -> Result<(), DebugError> {
        self.continue_with("step return", Command::Step(StepKind::Return)).await
    }

    /// Ask a running debuggee to stop; the state changes when it reports back
    pub async fn suspend(&self) -> Result<(), DebugError> {
        self.inner.check("suspend", RunState::can_suspend)?;
        self.request(&Command::Suspend).await.map(drop)
    }

    /// End the session
    ///
    /// The `terminate` command is best effort: ldb does not implement it and
    /// answers with an error, which is only logged. The event listener is
    /// stopped and both sockets are closed afterwards.
    pub async fn terminate(&self) -> Result<(), DebugError> {
        self.inner.check("terminate", RunState::can_terminate)?;
        info!("Terminating debug session");

        let timeout = Some(self.inner.config.terminate_timeout);
        match self
            .inner
            .sender
            .request_with_timeout(&Command::Terminate, timeout)
            .await
        {
            Ok(reply) => debug!(%reply, "Debuggee acknowledged terminate"),
            Err(e) => debug!(error = %e, "Terminate command not honoured"),
        }

        self.inner.mark_terminated();

        if let Some(listener) = self.events.lock().await.take() {
            listener.shutdown().await;
        }
        self.inner.sender.close().await;

        let event_loop = self.event_loop.lock().unwrap().take();
        if let Some(handle) = event_loop
            && let Err(e) = handle.await
            && !e.is_cancelled()
        {
            warn!("Event loop task failed: {}", e);
        }

        info!("Debug session terminated");
        Ok(())
    }

    async fn continue_with(
        &self,
        operation: &'static str,
        command: Command,
    ) -> Result<(), DebugError> {
        self.inner.begin_running(operation)?;
        self.request(&command).await.map(drop)
    }

    // ------------------------------------------------------------------------
    // Stack and variables
    // ------------------------------------------------------------------------

    /// Snapshot of the current suspension, if one has been built
    pub fn snapshot(&self) -> Option<Arc<StackSnapshot>> {
        self.inner.snapshot.lock().unwrap().clone()
    }

    /// Frames of the current suspension, innermost first
    pub fn stack_frames(&self) -> Vec<StackFrame> {
        self.snapshot()
            .map(|snapshot| snapshot.frames().to_vec())
            .unwrap_or_default()
    }

    pub fn thread(&self) -> ThreadId {
        ThreadId::MAIN
    }

    pub fn frame(&self, id: usize) -> Result<StackFrame, DebugError> {
        self.snapshot()
            .and_then(|snapshot| snapshot.frame(id).cloned())
            .ok_or(DebugError::UnknownFrame { id })
    }

    /// Variable list of a frame, decorated per the session's label setting
    pub fn variables(&self, frame: usize) -> Result<Vec<Variable>, DebugError> {
        Ok(self.frame(frame)?.variables(self.inner.config.global_labels))
    }

    /// Read a variable's value; only plain locals cost a round trip
    pub async fn variable_value(&self, variable: &Variable) -> Result<Value, DebugError> {
        if variable.requires_round_trip() {
            self.inner.check("read variables", RunState::can_inspect)?;
        }
        variable
            .value(self.inner.sender.as_ref())
            .await
            .map_err(|e| self.inner.fail(e.into()))
    }

    /// Assign `expression` to a local; subscribers get `ValueChanged`
    ///
    /// The write is not verified; the next read issues a fresh `var`.
    pub async fn set_variable(
        &self,
        frame: usize,
        name: &str,
        expression: &str,
    ) -> Result<(), DebugError> {
        self.inner.check("set variables", RunState::can_inspect)?;
        validate_assignment(name, expression)?;

        self.request(&Command::SetVar {
            frame,
            name: name.to_string(),
            expression: expression.to_string(),
        })
        .await?;

        self.inner.notify(DebugNotification::ValueChanged {
            frame,
            name: name.to_string(),
        });
        Ok(())
    }

    /// Lua value stack of the debuggee, bottom first
    pub async fn data_stack(&self) -> Result<Vec<String>, DebugError> {
        self.inner.check("read the data stack", RunState::can_inspect)?;
        let reply = self.request(&Command::Data).await?;
        Ok(codec::decode_fields(&reply)
            .into_iter()
            .map(str::to_string)
            .collect())
    }

    /// Returns ldb's confirmation line
    pub async fn set_breakpoint(&self, line: u32) -> Result<String, DebugError> {
        self.inner.check("set breakpoints", RunState::can_inspect)?;
        self.request(&Command::Break { line }).await
    }

    pub async fn clear_breakpoint(&self, line: u32) -> Result<String, DebugError> {
        self.inner.check("clear breakpoints", RunState::can_inspect)?;
        self.request(&Command::Clear { line }).await
    }

    async fn request(&self, command: &Command) -> Result<String, DebugError> {
        self.inner
            .sender
            .request(command)
            .await
            .map_err(|e| self.inner.fail(e.into()))
    }
}

impl Drop for DebugTarget {
    fn drop(&mut self) {
        self.inner.cancel.cancel();
        if let Some(token) = &self.listener_cancel {
            token.cancel();
        }
    }
}

// ============================================================================
// Shared state
// ============================================================================

impl Inner {
    fn state(&self) -> RunState {
        self.state.lock().unwrap().clone()
    }

    fn notify(&self, notification: DebugNotification) {
        // No subscribers is fine
        let _ = self.notifications.send(notification);
    }

    /// Fail with `InvalidState` unless `allowed` holds for the current state
    fn check(
        &self,
        operation: &'static str,
        allowed: fn(&RunState) -> bool,
    ) -> Result<(), DebugError> {
        let state = self.state.lock().unwrap();
        guard(&state, operation, allowed)
    }

    /// Move from `Suspended` to `Running` before the command is sent
    fn begin_running(&self, operation: &'static str) -> Result<(), DebugError> {
        {
            let mut state = self.state.lock().unwrap();
            guard(&state, operation, RunState::can_step)?;
            *state = RunState::Running;
        }
        self.snapshot.lock().unwrap().take();
        debug!(operation, "Running");
        self.notify(DebugNotification::StateChanged {
            state: RunState::Running,
        });
        Ok(())
    }

    /// Apply an event to the state machine, returning the new state if it changed
    fn apply(&self, event: &DebugEvent) -> Option<RunState> {
        let mut state = self.state.lock().unwrap();
        let next = state.on_event(event)?;
        *state = next.clone();
        Some(next)
    }

    fn mark_terminated(&self) {
        {
            let mut state = self.state.lock().unwrap();
            if state.is_terminated() {
                return;
            }
            *state = RunState::Terminated;
        }
        self.snapshot.lock().unwrap().take();
        self.cancel.cancel();
        self.notify(DebugNotification::StateChanged {
            state: RunState::Terminated,
        });
    }

    /// Terminate the session when `error` leaves the channel unusable
    fn fail(&self, error: DebugError) -> DebugError {
        if error.is_fatal() {
            warn!(error = %error, "Command channel failed, terminating session");
            self.mark_terminated();
        }
        error
    }

    async fn handle_event(&self, event: DebugEvent) {
        match &event {
            DebugEvent::SyntaxError { file, message } => {
                warn!(%file, %message, "Debuggee reported a syntax error");
                self.notify(DebugNotification::SyntaxError {
                    file: file.clone(),
                    message: message.clone(),
                });
            }
            DebugEvent::Unknown(line) => debug!(%line, "Ignoring unrecognized event"),
            _ => {}
        }

        let Some(next) = self.apply(&event) else {
            trace!(?event, "Event left state unchanged");
            return;
        };
        debug!(state = %next, "State changed");

        match next {
            RunState::Suspended { reason } => self.rebuild_stack(reason).await,
            RunState::Terminated => {
                self.snapshot.lock().unwrap().take();
                self.cancel.cancel();
                self.sender.close().await;
                info!("Debuggee terminated");
                self.notify(DebugNotification::StateChanged {
                    state: RunState::Terminated,
                });
            }
            state => {
                self.snapshot.lock().unwrap().take();
                self.notify(DebugNotification::StateChanged { state });
            }
        }
    }

    async fn rebuild_stack(&self, reason: SuspendReason) {
        let generation = self.generation.fetch_add(1, Ordering::SeqCst) + 1;
        self.snapshot.lock().unwrap().take();

        let fetched = StackSnapshot::fetch(self.sender.as_ref(), ThreadId::MAIN, generation).await;
        let snapshot = match fetched {
            Ok(snapshot) => snapshot,
            Err(e) => {
                let error = self.fail(e.into());
                if error.is_fatal() {
                    return;
                }
                warn!(error = %error, "Could not read the call stack");
                self.notify(DebugNotification::Error {
                    message: format!("Could not read the call stack: {error}"),
                });
                StackSnapshot::empty(ThreadId::MAIN, generation)
            }
        };
        let snapshot = Arc::new(snapshot);

        {
            // A resume issued while the stack was being read makes it stale
            let state = self.state.lock().unwrap();
            if !state.is_suspended() || self.generation.load(Ordering::SeqCst) != generation {
                debug!(generation, "Dropping stale stack snapshot");
                return;
            }
            *self.snapshot.lock().unwrap() = Some(Arc::clone(&snapshot));
        }

        info!(%reason, frames = snapshot.len(), "Debuggee suspended");
        self.notify(DebugNotification::StateChanged {
            state: RunState::Suspended {
                reason: reason.clone(),
            },
        });
        self.notify(DebugNotification::Suspended { reason, snapshot });
    }
}

/// ldb splits `setvar` at whitespace and reads one line per command
fn validate_assignment(name: &str, expression: &str) -> Result<(), DebugError> {
    if name.is_empty() || name.contains(char::is_whitespace) {
        return Err(DebugError::InvalidArgument {
            reason: format!("{name:?} is not a variable name"),
        });
    }
    if expression.trim().is_empty() || expression.contains(['\n', '\r']) {
        return Err(DebugError::InvalidArgument {
            reason: format!("{expression:?} is not a single-line expression"),
        });
    }
    Ok(())
}

fn guard(
    state: &RunState,
    operation: &'static str,
    allowed: fn(&RunState) -> bool,
) -> Result<(), DebugError> {
    if allowed(state) {
        return Ok(());
    }
    if state.is_terminated() {
        return Err(DebugError::Terminated);
    }
    Err(DebugError::InvalidState {
        operation,
        state: state.to_string(),
    })
}

async fn run_event_loop(inner: Arc<Inner>, mut events: mpsc::UnboundedReceiver<DebugEvent>) {
    debug!("Session event loop started");

    loop {
        tokio::select! {
            biased;

            _ = inner.cancel.cancelled() => break,

            event = events.recv() => match event {
                Some(event) => inner.handle_event(event).await,
                None => {
                    debug!("Event queue closed");
                    inner.mark_terminated();
                    break;
                }
            },
        }
    }

    debug!("Session event loop stopped");
}
