//! Stack frames

use std::hash::{Hash, Hasher};
use tracing::warn;

use crate::model::error::ModelError;
use crate::model::variable::Variable;
use crate::protocol::codec::{self, Command, FrameRecord};
use crate::protocol::command::CommandSender;

/// Identifier of a debuggee thread
///
/// ldb runs a single Lua thread, so every frame belongs to [`ThreadId::MAIN`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ThreadId(pub u32);

impl ThreadId {
    pub const MAIN: ThreadId = ThreadId(1);
}

/// Whether the two header entries are placed between locals and globals
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum GlobalLabels {
    #[default]
    Include,
    Omit,
}

/// Blank spacer followed by the `GLOBAL VARIABLES` header
pub const GLOBAL_LABELS: [Variable; 2] = [
    Variable::Label {
        name: "",
        value: "",
    },
    Variable::Label {
        name: "GLOBAL",
        value: "VARIABLES",
    },
];

/// One activation record of a suspension
///
/// Frames are rebuilt on every suspension and never change afterwards.
/// Equality uses the thread, source name and ordinal; hashing uses the
/// source name and ordinal.
#[derive(Debug, Clone)]
pub struct StackFrame {
    thread: ThreadId,
    id: usize,
    source_path: String,
    source_name: String,
    line: u32,
    name: String,
    locals: Vec<Variable>,
    globals: Vec<Variable>,
}

impl StackFrame {
    /// Assemble a frame from decoded frame data and decoded globals
    pub fn new(
        thread: ThreadId,
        id: usize,
        record: FrameRecord,
        globals: impl IntoIterator<Item = Variable>,
    ) -> Self {
        let locals = record
            .locals
            .into_iter()
            .map(|local| Variable::Local {
                frame: id,
                name: local.name,
                listed: local.value,
            })
            .collect();

        Self {
            thread,
            id,
            source_name: source_name(&record.file),
            source_path: record.file,
            line: record.line,
            name: record.function,
            locals,
            globals: globals.into_iter().collect(),
        }
    }

    /// Build a frame from its `stack` data, issuing one `getglobals` request
    ///
    /// A malformed header fails the build. A `getglobals` reply that cannot
    /// be decoded, or a non-fatal command error, leaves the frame without
    /// globals and is logged.
    pub async fn build<S>(
        sender: &S,
        thread: ThreadId,
        id: usize,
        data: &str,
    ) -> Result<Self, ModelError>
    where
        S: CommandSender + ?Sized,
    {
        let record = codec::decode_frame(data)?;

        let globals = match sender.request(&Command::GetGlobals).await {
            Ok(reply) => match codec::decode_globals(&reply) {
                Ok(entries) => entries.into_iter().map(Variable::from).collect(),
                Err(e) => {
                    warn!(frame = id, error = %e, "Malformed getglobals reply, globals omitted");
                    Vec::new()
                }
            },
            Err(e) if e.is_fatal() => return Err(e.into()),
            Err(e) => {
                warn!(frame = id, error = %e, "getglobals failed, globals omitted");
                Vec::new()
            }
        };

        Ok(Self::new(thread, id, record, globals))
    }

    pub fn thread(&self) -> ThreadId {
        self.thread
    }

    /// Ordinal of this frame, 0 being the innermost
    pub fn id(&self) -> usize {
        self.id
    }

    /// File as reported by the debuggee, e.g. `@scripts/sort.lua`
    pub fn source_path(&self) -> &str {
        &self.source_path
    }

    /// Last path segment of the file, e.g. `sort.lua`
    pub fn source_name(&self) -> &str {
        &self.source_name
    }

    pub fn line(&self) -> u32 {
        self.line
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn locals(&self) -> &[Variable] {
        &self.locals
    }

    pub fn globals(&self) -> &[Variable] {
        &self.globals
    }

    pub fn local(&self, name: &str) -> Option<&Variable> {
        self.locals.iter().find(|local| local.name() == name)
    }

    /// Locals, then the optional labels, then globals, in that order
    pub fn variables(&self, labels: GlobalLabels) -> Vec<Variable> {
        let mut variables = Vec::with_capacity(self.locals.len() + 2 + self.globals.len());
        variables.extend(self.locals.iter().cloned());
        if labels == GlobalLabels::Include {
            variables.extend(GLOBAL_LABELS);
        }
        variables.extend(self.globals.iter().cloned());
        variables
    }

    pub fn has_variables(&self) -> bool {
        !self.locals.is_empty() || !self.globals.is_empty()
    }
}

impl PartialEq for StackFrame {
    fn eq(&self, other: &Self) -> bool {
        self.thread == other.thread && self.source_name == other.source_name && self.id == other.id
    }
}

impl Eq for StackFrame {}

impl Hash for StackFrame {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.source_name.hash(state);
        self.id.hash(state);
    }
}

/// Strip Lua's `@` chunk prefix and keep the last path segment
fn source_name(file: &str) -> String {
    let file = file.strip_prefix('@').unwrap_or(file);
    file.rsplit(['/', '\\'])
        .find(|segment| !segment.is_empty())
        .unwrap_or(file)
        .to_string()
}
