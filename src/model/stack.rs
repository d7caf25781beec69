//! Call stack of one suspension

use std::time::Instant;
use tracing::{Level, debug, warn};

use crate::log_timing;
use crate::model::error::ModelError;
use crate::model::frame::{StackFrame, ThreadId};
use crate::protocol::codec::{self, Command};
use crate::protocol::command::CommandSender;

/// Frames captured for one suspension, innermost first
#[derive(Debug, Clone)]
pub struct StackSnapshot {
    generation: u64,
    thread: ThreadId,
    frames: Vec<StackFrame>,
}

impl StackSnapshot {
    /// Snapshot without frames, used when the stack could not be read
    pub fn empty(thread: ThreadId, generation: u64) -> Self {
        Self {
            generation,
            thread,
            frames: Vec::new(),
        }
    }

    /// Fetch the call stack and build every frame
    ///
    /// One `stack` request returns all frames; each frame then costs one
    /// `getglobals` request. Frames whose data cannot be decoded are skipped
    /// and logged.
    pub async fn fetch<S>(sender: &S, thread: ThreadId, generation: u64) -> Result<Self, ModelError>
    where
        S: CommandSender + ?Sized,
    {
        let started = Instant::now();
        let blob = sender.request(&Command::Stack).await?;
        let frame_data = codec::split_stack(&blob);

        // The blob lists the outermost frame first
        let depth = frame_data.len();
        let mut frames = Vec::with_capacity(depth);
        for (position, data) in frame_data.into_iter().enumerate().rev() {
            let id = depth - 1 - position;
            match StackFrame::build(sender, thread, id, data).await {
                Ok(frame) => frames.push(frame),
                Err(ModelError::Protocol(e)) => {
                    warn!(frame = id, error = %e, data, "Skipping malformed stack frame");
                }
                Err(e) => return Err(e),
            }
        }

        debug!(generation, depth, built = frames.len(), "Stack snapshot built");
        log_timing!(Level::DEBUG, "stack_snapshot", started.elapsed());

        Ok(Self {
            generation,
            thread,
            frames,
        })
    }

    /// Suspension counter this snapshot belongs to
    pub fn generation(&self) -> u64 {
        self.generation
    }

    pub fn thread(&self) -> ThreadId {
        self.thread
    }

    /// Frames ordered innermost first
    pub fn frames(&self) -> &[StackFrame] {
        &self.frames
    }

    pub fn frame(&self, id: usize) -> Option<&StackFrame> {
        self.frames.iter().find(|frame| frame.id() == id)
    }

    /// Innermost frame, where the debuggee is stopped
    pub fn top(&self) -> Option<&StackFrame> {
        self.frames.first()
    }

    pub fn len(&self) -> usize {
        self.frames.len()
    }

    pub fn is_empty(&self) -> bool {
        self.frames.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_utils::ScriptedSender;

    #[tokio::test]
    async fn test_frames_innermost_first() {
        let sender = ScriptedSender::with_replies([
            "@sort.lua|20|main|list|#@sort.lua|11|sort|a|n|#@sort.lua|4|swap|a|i|j|#",
            "g=1",
            "g=1",
            "g=1",
        ]);

        let snapshot = StackSnapshot::fetch(&sender, ThreadId::MAIN, 1).await.unwrap();

        let summary: Vec<(usize, &str, u32)> = snapshot
            .frames()
            .iter()
            .map(|f| (f.id(), f.name(), f.line()))
            .collect();
        assert_eq!(summary, vec![(0, "swap", 4), (1, "sort", 11), (2, "main", 20)]);
        assert_eq!(snapshot.top().map(StackFrame::name), Some("swap"));
        assert_eq!(snapshot.frame(2).map(StackFrame::name), Some("main"));

        // one stack request plus one getglobals per frame
        assert_eq!(sender.round_trips(), 4);
    }

    #[tokio::test]
    async fn test_ordinals_restart_for_each_suspension() {
        let sender = ScriptedSender::with_replies([
            "a.lua|1|main|#a.lua|5|f|#a.lua|9|g|#",
            "",
            "",
            "",
            "a.lua|2|main|#",
            "",
        ]);

        let first = StackSnapshot::fetch(&sender, ThreadId::MAIN, 1).await.unwrap();
        let second = StackSnapshot::fetch(&sender, ThreadId::MAIN, 2).await.unwrap();

        assert_eq!(first.len(), 3);
        assert_eq!(second.len(), 1);
        assert_eq!(second.frames()[0].id(), 0);
        assert_eq!(second.frames()[0].line(), 2);
        assert_eq!(second.generation(), 2);
    }

    #[tokio::test]
    async fn test_malformed_frame_skipped() {
        let sender = ScriptedSender::with_replies(["a.lua|1|main|#a.lua|oops|f|#", ""]);

        let snapshot = StackSnapshot::fetch(&sender, ThreadId::MAIN, 1).await.unwrap();

        assert_eq!(snapshot.len(), 1);
        assert_eq!(snapshot.frames()[0].id(), 1);
        assert_eq!(snapshot.frames()[0].name(), "main");
    }

    #[tokio::test]
    async fn test_empty_stack() {
        let sender = ScriptedSender::with_replies([""]);

        let snapshot = StackSnapshot::fetch(&sender, ThreadId::MAIN, 1).await.unwrap();

        assert!(snapshot.is_empty());
        assert!(snapshot.top().is_none());
    }

    #[tokio::test]
    async fn test_stack_request_failure_propagates() {
        let sender = ScriptedSender::new();

        let result = StackSnapshot::fetch(&sender, ThreadId::MAIN, 1).await;
        assert!(matches!(result, Err(ModelError::Command(_))));
    }
}
