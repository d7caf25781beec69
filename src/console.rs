//! Line-oriented debugger console
//!
//! Reads commands from stdin and prints session notifications as they
//! arrive. Ends on `quit`, end of input, or when the debuggee terminates.

use std::fmt::Write as _;
use tokio::io::{AsyncBufRead, AsyncBufReadExt};
use tokio::sync::broadcast::{self, error::RecvError};
use tracing::warn;

use ldb_client::model::{Value, Variable};
use ldb_client::{DebugError, DebugNotification, DebugTarget};

const HELP: &str = "\
commands:
  continue | c              resume execution
  step | s                  step into
  over | n                  step over
  return | r                step out of the current function
  suspend                   stop a running script
  stack | bt                list frames, innermost first
  vars [frame]              list the variables of a frame (default 0)
  print <frame> <name>      read one variable
  set <frame> <name> <expr> assign a local
  break <line>              set a breakpoint
  clear <line>              clear a breakpoint
  data                      show the Lua value stack
  quit | q                  end the session";

/// One parsed console line
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConsoleCommand {
    Continue,
    StepInto,
    StepOver,
    StepReturn,
    Suspend,
    Stack,
    Vars { frame: usize },
    Print { frame: usize, name: String },
    Set { frame: usize, name: String, expression: String },
    Break { line: u32 },
    Clear { line: u32 },
    Data,
    Help,
    Quit,
}

impl ConsoleCommand {
    /// Parse a console line; `Ok(None)` for a blank line
    pub fn parse(line: &str) -> Result<Option<Self>, String> {
        let mut words = line.split_whitespace();
        let Some(keyword) = words.next() else {
            return Ok(None);
        };

        let command = match keyword {
            "continue" | "c" => ConsoleCommand::Continue,
            "step" | "s" => ConsoleCommand::StepInto,
            "over" | "n" => ConsoleCommand::StepOver,
            "return" | "r" => ConsoleCommand::StepReturn,
            "suspend" => ConsoleCommand::Suspend,
            "stack" | "bt" => ConsoleCommand::Stack,
            "vars" => ConsoleCommand::Vars {
                frame: words.next().map(parse_number::<usize>).transpose()?.unwrap_or(0),
            },
            "print" | "p" => ConsoleCommand::Print {
                frame: parse_number(required(words.next(), "frame")?)?,
                name: required(words.next(), "name")?.to_string(),
            },
            "set" => {
                // The expression keeps its own spacing, e.g. inside string literals
                let (_, rest) = split_word(line).unwrap_or_default();
                let (frame, rest) = split_word(rest).ok_or_else(|| "missing frame".to_string())?;
                let (name, rest) = split_word(rest).ok_or_else(|| "missing name".to_string())?;
                let expression = rest.trim();
                if expression.is_empty() {
                    return Err("usage: set <frame> <name> <expr>".to_string());
                }
                ConsoleCommand::Set {
                    frame: parse_number(frame)?,
                    name: name.to_string(),
                    expression: expression.to_string(),
                }
            }
            "break" | "b" => ConsoleCommand::Break {
                line: parse_number(required(words.next(), "line")?)?,
            },
            "clear" => ConsoleCommand::Clear {
                line: parse_number(required(words.next(), "line")?)?,
            },
            "data" => ConsoleCommand::Data,
            "help" | "h" | "?" => ConsoleCommand::Help,
            "quit" | "q" | "exit" => ConsoleCommand::Quit,
            other => return Err(format!("unknown command {other:?}, try help")),
        };

        Ok(Some(command))
    }
}

/// First word of `text` and the unparsed remainder after it
fn split_word(text: &str) -> Option<(&str, &str)> {
    let text = text.trim_start();
    if text.is_empty() {
        return None;
    }
    let end = text.find(char::is_whitespace).unwrap_or(text.len());
    Some(text.split_at(end))
}

fn required<'a>(word: Option<&'a str>, what: &str) -> Result<&'a str, String> {
    word.ok_or_else(|| format!("missing {what}"))
}

fn parse_number<N: std::str::FromStr>(word: &str) -> Result<N, String> {
    word.parse()
        .map_err(|_| format!("{word:?} is not a valid number"))
}

/// Run the console until quit, end of input or termination
pub async fn run<R>(target: &DebugTarget, input: R)
where
    R: AsyncBufRead + Unpin,
{
    let mut lines = input.lines();
    let mut notifications = target.subscribe();

    loop {
        tokio::select! {
            notification = notifications.recv() => match notification {
                Ok(notification) => {
                    println!("{}", describe(&notification));
                    if let DebugNotification::StateChanged { state } = &notification
                        && state.is_terminated()
                    {
                        break;
                    }
                }
                Err(RecvError::Lagged(missed)) => warn!(missed, "Console missed notifications"),
                Err(RecvError::Closed) => break,
            },

            line = lines.next_line() => {
                let line = match line {
                    Ok(Some(line)) => line,
                    Ok(None) => break,
                    Err(e) => {
                        warn!("Error reading console input: {}", e);
                        break;
                    }
                };

                match ConsoleCommand::parse(&line) {
                    Ok(Some(ConsoleCommand::Quit)) => break,
                    Ok(Some(command)) => match execute(target, command).await {
                        Ok(output) if !output.is_empty() => println!("{output}"),
                        Ok(_) => {}
                        Err(e) if e.is_fatal() => {
                            println!("error: {e}");
                            break;
                        }
                        Err(e) => println!("error: {e}"),
                    },
                    Ok(None) => {}
                    Err(message) => println!("{message}"),
                }
            }
        }
    }

    drain(&mut notifications);
}

fn drain(notifications: &mut broadcast::Receiver<DebugNotification>) {
    while let Ok(notification) = notifications.try_recv() {
        println!("{}", describe(&notification));
    }
}

async fn execute(target: &DebugTarget, command: ConsoleCommand) -> Result<String, DebugError> {
    match command {
        ConsoleCommand::Continue => target.resume().await.map(|_| String::new()),
        ConsoleCommand::StepInto => target.step_into().await.map(|_| String::new()),
        ConsoleCommand::StepOver => target.step_over().await.map(|_| String::new()),
        ConsoleCommand::StepReturn => target.step_return().await.map(|_| String::new()),
        ConsoleCommand::Suspend => target.suspend().await.map(|_| String::new()),
        ConsoleCommand::Stack => Ok(format_stack(target)),
        ConsoleCommand::Vars { frame } => {
            let variables = target.variables(frame)?;
            let mut out = String::new();
            for variable in &variables {
                format_variable(&mut out, variable, 0);
            }
            Ok(out.trim_end().to_string())
        }
        ConsoleCommand::Print { frame, name } => {
            let frame = target.frame(frame)?;
            let Some(variable) = frame
                .local(&name)
                .or_else(|| frame.globals().iter().find(|g| g.name() == name))
            else {
                return Ok(format!("no variable {name:?} in frame {}", frame.id()));
            };
            let value = target.variable_value(variable).await?;
            Ok(format_value(&name, &value))
        }
        ConsoleCommand::Set {
            frame,
            name,
            expression,
        } => target
            .set_variable(frame, &name, &expression)
            .await
            .map(|_| format!("{name} = {expression}")),
        ConsoleCommand::Break { line } => target.set_breakpoint(line).await,
        ConsoleCommand::Clear { line } => target.clear_breakpoint(line).await,
        ConsoleCommand::Data => Ok(target.data_stack().await?.join("\n")),
        ConsoleCommand::Help => Ok(HELP.to_string()),
        ConsoleCommand::Quit => Ok(String::new()),
    }
}

fn format_stack(target: &DebugTarget) -> String {
    let frames = target.stack_frames();
    if frames.is_empty() {
        return format!("no stack ({})", target.state());
    }
    frames
        .iter()
        .map(|frame| {
            format!(
                "#{} {} at {}:{}",
                frame.id(),
                frame.name(),
                frame.source_name(),
                frame.line()
            )
        })
        .collect::<Vec<_>>()
        .join("\n")
}

fn format_variable(out: &mut String, variable: &Variable, depth: usize) {
    let indent = "  ".repeat(depth);
    let _ = writeln!(out, "{indent}{variable}");
    if let Variable::GlobalTable { elements, .. } = variable {
        for element in elements {
            format_variable(out, element, depth + 1);
        }
    }
}

fn format_value(name: &str, value: &Value) -> String {
    let mut out = format!("{name} = {value} ({})", value.reference_type_name());
    for element in value.variables() {
        let _ = write!(out, "\n  {element}");
    }
    out
}

fn describe(notification: &DebugNotification) -> String {
    match notification {
        DebugNotification::StateChanged { state } => format!("[{state}]"),
        DebugNotification::Suspended { snapshot, .. } => match snapshot.top() {
            Some(frame) => format!(
                "  in {} at {}:{}",
                frame.name(),
                frame.source_name(),
                frame.line()
            ),
            None => "  (no stack)".to_string(),
        },
        DebugNotification::ValueChanged { frame, name } => {
            format!("  {name} changed in frame {frame}")
        }
        DebugNotification::SyntaxError { file, message } => {
            format!("syntax error in {file}: {message}")
        }
        DebugNotification::Error { message } => format!("error: {message}"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_run_control() {
        assert_eq!(ConsoleCommand::parse("c"), Ok(Some(ConsoleCommand::Continue)));
        assert_eq!(ConsoleCommand::parse("over"), Ok(Some(ConsoleCommand::StepOver)));
        assert_eq!(ConsoleCommand::parse("  r "), Ok(Some(ConsoleCommand::StepReturn)));
        assert_eq!(ConsoleCommand::parse(""), Ok(None));
    }

    #[test]
    fn test_parse_arguments() {
        assert_eq!(
            ConsoleCommand::parse("vars"),
            Ok(Some(ConsoleCommand::Vars { frame: 0 }))
        );
        assert_eq!(
            ConsoleCommand::parse("print 1 list"),
            Ok(Some(ConsoleCommand::Print {
                frame: 1,
                name: "list".to_string()
            }))
        );
        assert_eq!(
            ConsoleCommand::parse("set 0 x y + 1"),
            Ok(Some(ConsoleCommand::Set {
                frame: 0,
                name: "x".to_string(),
                expression: "y + 1".to_string()
            }))
        );
        assert_eq!(
            ConsoleCommand::parse("set 0 s \"a  b\"  "),
            Ok(Some(ConsoleCommand::Set {
                frame: 0,
                name: "s".to_string(),
                expression: "\"a  b\"".to_string()
            }))
        );
        assert_eq!(
            ConsoleCommand::parse("break 12"),
            Ok(Some(ConsoleCommand::Break { line: 12 }))
        );
    }

    #[test]
    fn test_parse_errors() {
        assert!(ConsoleCommand::parse("break").is_err());
        assert!(ConsoleCommand::parse("break twelve").is_err());
        assert!(ConsoleCommand::parse("set 0 x").is_err());
        assert!(ConsoleCommand::parse("frobnicate").is_err());
    }

    #[test]
    fn test_format_value_lists_table_elements() {
        let value = Value::Table {
            kind: ldb_client::model::TableKind::Local,
            elements: vec![
                Variable::Table {
                    name: "a[1]".to_string(),
                    value: "3".to_string(),
                },
                Variable::Table {
                    name: "a[2]".to_string(),
                    value: "1".to_string(),
                },
            ],
        };
        assert_eq!(format_value("a", &value), "a = table (text)\n  a[1]=3\n  a[2]=1");
        assert_eq!(format_value("n", &Value::scalar("7")), "n = 7 (integer)");
    }
}
