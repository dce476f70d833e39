//! Line-oriented console driving a [`CollectionSession`] over stdio.
//!
//! Reads one command per line from stdin and writes results to stdout. While
//! waiting for input it also echoes new push-channel log entries and status
//! changes as they happen.
//!
//! | Command         | Effect                                               |
//! |-----------------|------------------------------------------------------|
//! | `open <name>`   | Make `<name>` the active collection                  |
//! | `close`         | Close the active collection                          |
//! | `list`          | List collections on the backend                      |
//! | `show`          | Print the current document                           |
//! | `edit <text>`   | Replace the document with a single line              |
//! | `edit`          | Replace the document with following lines up to `.` |
//! | `save` / `run`  | Save or run the active collection                    |
//! | `status`        | Print the current status                             |
//! | `log`           | Print the whole push-channel log                     |
//! | `help`          | Print this table                                     |
//! | `quit`          | Exit                                                 |

use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncWrite, AsyncWriteExt, BufReader};
use tracing::warn;

use crate::session::CollectionSession;

const HELP: &str = "\
commands:
  open <name>    activate a collection
  close          deactivate the current collection
  list           list collections on the backend
  show           print the document
  edit <text>    replace the document with one line
  edit           replace the document with the following lines, end with '.'
  save           save the document
  run            run the collection
  status         print the status
  log            print the push-channel log
  quit           exit";

/// A parsed console command.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Command {
    Open(String),
    Close,
    List,
    Show,
    Edit(Option<String>),
    Save,
    Run,
    Status,
    Log,
    Help,
    Quit,
}

/// Parse one input line. Blank lines yield `Ok(None)`.
pub fn parse_command(line: &str) -> Result<Option<Command>, String> {
    let line = line.trim();
    if line.is_empty() {
        return Ok(None);
    }
    let (word, rest) = match line.split_once(char::is_whitespace) {
        Some((word, rest)) => (word, rest.trim()),
        None => (line, ""),
    };

    let command = match (word, rest) {
        ("open", "") => return Err("usage: open <name>".to_string()),
        ("open", name) => Command::Open(name.to_string()),
        ("edit", "") => Command::Edit(None),
        ("edit", text) => Command::Edit(Some(text.to_string())),
        ("close", "") => Command::Close,
        ("list", "") => Command::List,
        ("show", "") => Command::Show,
        ("save", "") => Command::Save,
        ("run", "") => Command::Run,
        ("status", "") => Command::Status,
        ("log", "") => Command::Log,
        ("help" | "?", "") => Command::Help,
        ("quit" | "exit", "") => Command::Quit,
        (word, _) => return Err(format!("unknown command: {word} (try 'help')")),
    };
    Ok(Some(command))
}

/// Tracks what has already been echoed so only new output is printed.
#[derive(Debug, Default)]
struct Echo {
    key: Option<String>,
    log_seen: usize,
    status: Option<String>,
}

impl Echo {
    /// Lines describing what changed since the last call.
    fn changes(&mut self, session: &CollectionSession) -> Vec<String> {
        let view = session.snapshot();
        let mut lines = Vec::new();

        if view.key != self.key {
            self.key = view.key.clone();
            self.log_seen = 0;
            self.status = None;
        }
        for entry in view.log.iter().skip(self.log_seen) {
            lines.push(format!("log: {entry}"));
        }
        self.log_seen = view.log.len();

        if view.status != self.status {
            if let Some(status) = &view.status {
                lines.push(format!("status: {status}"));
            }
            self.status = view.status;
        }
        lines
    }
}

/// Run the console on stdio until `quit` or EOF.
pub async fn run_stdio(session: CollectionSession) {
    let stdin = BufReader::new(tokio::io::stdin());
    let stdout = tokio::io::stdout();
    run(session, stdin, stdout).await;
}

/// Console loop over arbitrary reader/writer halves.
pub async fn run<R, W>(mut session: CollectionSession, input: R, mut out: W)
where
    R: AsyncBufRead + Unpin,
    W: AsyncWrite + Unpin,
{
    let changed = session.changed();
    let mut lines = input.lines();
    let mut echo = Echo::default();
    // Multi-line edit buffer, active between `edit` and a lone `.`.
    let mut editing: Option<Vec<String>> = None;

    if let Some(key) = session.key() {
        write_line(&mut out, &format!("opened {key}")).await;
    }

    loop {
        tokio::select! {
            () = changed.notified() => {
                for line in echo.changes(&session) {
                    write_line(&mut out, &line).await;
                }
            }
            line = lines.next_line() => {
                let line = match line {
                    Ok(Some(line)) => line,
                    Ok(None) => break, // EOF
                    Err(e) => {
                        warn!("stdin read error: {e}");
                        break;
                    }
                };

                if let Some(buffer) = editing.as_mut() {
                    if line.trim_end() == "." {
                        let text = buffer.join("\n");
                        editing = None;
                        session.edit(text);
                        write_line(&mut out, "document updated").await;
                    } else {
                        buffer.push(line);
                    }
                    continue;
                }

                let command = match parse_command(&line) {
                    Ok(Some(command)) => command,
                    Ok(None) => continue,
                    Err(e) => {
                        write_line(&mut out, &e).await;
                        continue;
                    }
                };
                if command == Command::Quit {
                    break;
                }
                if command == Command::Edit(None) {
                    if session.key().is_some() {
                        editing = Some(Vec::new());
                        write_line(&mut out, "enter document, end with '.'").await;
                    } else {
                        write_line(&mut out, "no collection open").await;
                    }
                    continue;
                }
                let reply = execute(&mut session, command).await;
                if !reply.is_empty() {
                    write_line(&mut out, &reply).await;
                }
            }
        }
    }

    session.deactivate();
    let _ = out.flush().await;
}

/// Apply one command to the session and return the text to print.
async fn execute(session: &mut CollectionSession, command: Command) -> String {
    let needs_collection = matches!(
        command,
        Command::Show | Command::Edit(_) | Command::Save | Command::Run | Command::Close
    );
    if needs_collection && session.key().is_none() {
        return "no collection open".to_string();
    }

    match command {
        Command::Open(name) => {
            session.activate(Some(&name));
            format!("opened {name}")
        }
        Command::Close => {
            session.deactivate();
            "closed".to_string()
        }
        Command::List => match session.list_collections().await {
            Ok(names) if names.is_empty() => "no collections".to_string(),
            Ok(names) => names.join("\n"),
            Err(e) => format!("list failed: {e}"),
        },
        Command::Show => session.document(),
        Command::Edit(text) => {
            session.edit(text.unwrap_or_default());
            "document updated".to_string()
        }
        // Outcomes arrive through the status echo.
        Command::Save => {
            drop(session.save());
            String::new()
        }
        Command::Run => {
            drop(session.run());
            String::new()
        }
        Command::Status => session
            .status()
            .unwrap_or_else(|| "(no status)".to_string()),
        Command::Log => session.log().join("\n"),
        Command::Help => HELP.to_string(),
        Command::Quit => String::new(),
    }
}

async fn write_line<W: AsyncWrite + Unpin>(out: &mut W, line: &str) {
    let mut buf = line.as_bytes().to_vec();
    buf.push(b'\n');
    if let Err(e) = out.write_all(&buf).await {
        warn!("stdout write error: {e}");
        return;
    }
    let _ = out.flush().await;
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::channel::ChannelManager;
    use crate::testing::{test_client, MockBackend, Route};
    use serde_json::json;
    use std::time::Duration;

    #[test]
    fn parses_commands() {
        assert_eq!(
            parse_command("open my demo").unwrap(),
            Some(Command::Open("my demo".into()))
        );
        assert_eq!(parse_command("  run  ").unwrap(), Some(Command::Run));
        assert_eq!(parse_command("edit").unwrap(), Some(Command::Edit(None)));
        assert_eq!(
            parse_command("edit {\"a\": 2}").unwrap(),
            Some(Command::Edit(Some("{\"a\": 2}".into())))
        );
        assert_eq!(parse_command("exit").unwrap(), Some(Command::Quit));
        assert_eq!(parse_command("").unwrap(), None);
    }

    #[test]
    fn rejects_bad_commands() {
        assert!(parse_command("open").is_err());
        assert!(parse_command("save now").is_err());
        assert!(parse_command("frobnicate")
            .unwrap_err()
            .contains("unknown command: frobnicate"));
    }

    #[tokio::test]
    async fn scripted_console_session() {
        let backend = MockBackend::start().await;
        backend.insert("demo", json!({ "a": 1 }));
        backend.delay(Route::Get, Duration::from_millis(20));
        let session = CollectionSession::new(
            ChannelManager::new(backend.address()),
            test_client(backend.address()),
        );

        let (mut feed, input) = tokio::io::duplex(4096);
        let (output, mut reader) = tokio::io::duplex(64 * 1024);
        let console = tokio::spawn(run(session, BufReader::new(input), output));

        feed.write_all(b"show\nopen demo\n").await.unwrap();
        crate::testing::eventually("load", || backend.joined() == ["demo"]).await;
        tokio::time::sleep(Duration::from_millis(100)).await;
        feed.write_all(b"edit\n{\"a\": 2}\n.\nsave\n").await.unwrap();
        crate::testing::eventually("save", || backend.saves().len() == 1).await;
        feed.write_all(b"show\nquit\n").await.unwrap();
        console.await.unwrap();

        let mut transcript = String::new();
        tokio::io::AsyncReadExt::read_to_string(&mut reader, &mut transcript)
            .await
            .unwrap();
        assert!(transcript.contains("no collection open"), "{transcript}");
        assert!(transcript.contains("opened demo"), "{transcript}");
        assert!(transcript.contains("log: [ws] connected"), "{transcript}");
        assert!(transcript.contains("{\"a\": 2}"), "{transcript}");
        assert_eq!(
            backend.saves(),
            vec![json!({ "name": "demo", "content": "{\"a\": 2}" })]
        );
    }
}
