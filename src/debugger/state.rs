//! Session run state machine
//!
//! `Connecting -> Running <-> Suspended -> Terminated`, with `Terminated`
//! absorbing and reachable from every state.

use std::fmt;

use crate::protocol::event::{DebugEvent, SuspendReason};

#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub enum RunState {
    #[default]
    Connecting,
    Running,
    Suspended {
        reason: SuspendReason,
    },
    Terminated,
}

impl RunState {
    pub fn name(&self) -> &'static str {
        match self {
            RunState::Connecting => "connecting",
            RunState::Running => "running",
            RunState::Suspended { .. } => "suspended",
            RunState::Terminated => "terminated",
        }
    }

    pub fn is_running(&self) -> bool {
        matches!(self, RunState::Running)
    }

    pub fn is_suspended(&self) -> bool {
        matches!(self, RunState::Suspended { .. })
    }

    pub fn is_terminated(&self) -> bool {
        matches!(self, RunState::Terminated)
    }

    pub fn suspend_reason(&self) -> Option<&SuspendReason> {
        match self {
            RunState::Suspended { reason } => Some(reason),
            _ => None,
        }
    }

    pub fn can_resume(&self) -> bool {
        self.is_suspended()
    }

    pub fn can_step(&self) -> bool {
        self.is_suspended()
    }

    pub fn can_suspend(&self) -> bool {
        self.is_running()
    }

    pub fn can_terminate(&self) -> bool {
        !self.is_terminated()
    }

    /// Variables, globals and breakpoints can only be touched while stopped
    pub fn can_inspect(&self) -> bool {
        self.is_suspended()
    }

    /// State after `event`, or `None` when the event does not change it
    ///
    /// Suspensions always produce a new state.
    pub fn on_event(&self, event: &DebugEvent) -> Option<RunState> {
        if self.is_terminated() {
            return None;
        }

        let next = match event {
            DebugEvent::Suspended(reason) => {
                return Some(RunState::Suspended {
                    reason: reason.clone(),
                });
            }
            DebugEvent::Resumed(_) | DebugEvent::Started => RunState::Running,
            DebugEvent::Terminated | DebugEvent::Disconnected { .. } => RunState::Terminated,
            DebugEvent::SyntaxError { .. } | DebugEvent::Unknown(_) => return None,
        };

        (next != *self).then_some(next)
    }
}

impl fmt::Display for RunState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RunState::Suspended { reason } => write!(f, "suspended ({reason})"),
            other => f.write_str(other.name()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::event::ResumeReason;

    fn suspended(reason: SuspendReason) -> RunState {
        RunState::Suspended { reason }
    }

    #[test]
    fn test_guards() {
        let running = RunState::Running;
        assert!(running.can_suspend() && running.can_terminate());
        assert!(!running.can_resume() && !running.can_step() && !running.can_inspect());

        let stopped = suspended(SuspendReason::Step);
        assert!(stopped.can_resume() && stopped.can_step() && stopped.can_inspect());
        assert!(!stopped.can_suspend());

        let terminated = RunState::Terminated;
        assert!(!terminated.can_terminate());
        assert!(!terminated.can_resume() && !terminated.can_suspend() && !terminated.can_step());

        assert!(!RunState::Connecting.can_step());
        assert!(RunState::Connecting.can_terminate());
    }

    #[test]
    fn test_transitions() {
        let running = RunState::Running;
        let breakpoint = DebugEvent::Suspended(SuspendReason::Breakpoint { line: 9 });

        let stopped = running.on_event(&breakpoint).unwrap();
        assert_eq!(stopped.suspend_reason(), Some(&SuspendReason::Breakpoint { line: 9 }));

        assert_eq!(
            stopped.on_event(&DebugEvent::Resumed(ResumeReason::Step)),
            Some(RunState::Running)
        );
        assert_eq!(
            stopped.on_event(&DebugEvent::Disconnected {
                reason: "eof".to_string()
            }),
            Some(RunState::Terminated)
        );
    }

    #[test]
    fn test_events_without_effect() {
        let running = RunState::Running;
        assert_eq!(running.on_event(&DebugEvent::Resumed(ResumeReason::Client)), None);
        assert_eq!(running.on_event(&DebugEvent::Unknown("x".to_string())), None);
        assert_eq!(
            running.on_event(&DebugEvent::SyntaxError {
                file: "a.lua".to_string(),
                message: "oops".to_string()
            }),
            None
        );
    }

    #[test]
    fn test_every_suspension_is_a_change() {
        let stopped = suspended(SuspendReason::Step);
        assert_eq!(
            stopped.on_event(&DebugEvent::Suspended(SuspendReason::Client)),
            Some(suspended(SuspendReason::Client))
        );
        assert_eq!(
            stopped.on_event(&DebugEvent::Suspended(SuspendReason::Step)),
            Some(suspended(SuspendReason::Step))
        );
    }

    #[test]
    fn test_terminated_is_absorbing() {
        let terminated = RunState::Terminated;
        for event in [
            DebugEvent::Started,
            DebugEvent::Suspended(SuspendReason::Step),
            DebugEvent::Resumed(ResumeReason::Client),
            DebugEvent::Terminated,
        ] {
            assert_eq!(terminated.on_event(&event), None);
        }
    }

    #[test]
    fn test_display() {
        assert_eq!(RunState::Running.to_string(), "running");
        assert_eq!(
            suspended(SuspendReason::Breakpoint { line: 4 }).to_string(),
            "suspended (breakpoint at line 4)"
        );
    }
}
