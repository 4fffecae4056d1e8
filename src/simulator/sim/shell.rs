use rustyline::error::ReadlineError;
use rustyline::DefaultEditor;
use std::io::{self, Result};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Command {
  Step(u32), // Run N scenario ops
  Acc(usize, usize),
  Quit,
  Continue,
}

const USAGE: &str = "Use Enter to step, 'si 100' to step N ops, 'c' to continue, 'acc R C' to dump a cell, or 'q' to quit";

/// Parse one shell line
pub fn parse_command(line: &str) -> std::result::Result<Command, String> {
  let trimmed = line.trim();

  // Empty input: step once
  if trimmed.is_empty() {
    return Ok(Command::Step(1));
  }

  if let Some(rest) = trimmed.strip_prefix("si") {
    let num_str = rest.trim();
    if num_str.is_empty() {
      return Err("'si' requires a number, e.g., 'si 100'".to_string());
    }
    return match num_str.parse::<u32>() {
      Ok(n) if n > 0 => Ok(Command::Step(n)),
      Ok(_) => Err("step count must be greater than 0".to_string()),
      Err(e) => Err(format!("invalid number '{}': {}", num_str, e)),
    };
  }

  if let Some(rest) = trimmed.strip_prefix("acc") {
    let parts: Vec<&str> = rest.split_whitespace().collect();
    return match parts.as_slice() {
      [r, c] => match (r.parse::<usize>(), c.parse::<usize>()) {
        (Ok(r), Ok(c)) => Ok(Command::Acc(r, c)),
        _ => Err(format!("invalid cell '{} {}'", r, c)),
      },
      _ => Err("'acc' takes a row and a column, e.g., 'acc 0 3'".to_string()),
    };
  }

  match trimmed {
    "q" => Ok(Command::Quit),
    "c" => Ok(Command::Continue),
    other => Err(format!("Unknown command: '{}'. {}", other, USAGE)),
  }
}

/// Line editor with history for step mode
pub struct Shell {
  editor: DefaultEditor,
}

impl Shell {
  pub fn new() -> Result<Self> {
    let editor = DefaultEditor::new().map_err(|e| io::Error::new(io::ErrorKind::Other, e))?;
    Ok(Self { editor })
  }

  pub fn read_command(&mut self) -> Result<Command> {
    loop {
      match self.editor.readline("(hmx) ") {
        Ok(line) => {
          let trimmed = line.trim();
          if !trimmed.is_empty() {
            let _ = self.editor.add_history_entry(trimmed);
          }
          match parse_command(trimmed) {
            Ok(cmd) => return Ok(cmd),
            Err(msg) => eprintln!("Error: {}", msg),
          }
        },
        // Ctrl-C or Ctrl-D: quit
        Err(ReadlineError::Interrupted) | Err(ReadlineError::Eof) => return Ok(Command::Quit),
        Err(err) => return Err(io::Error::new(io::ErrorKind::Other, err)),
      }
    }
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  /// Enter steps once and si steps N times
  #[test]
  fn test_parse_step() {
    assert_eq!(parse_command(""), Ok(Command::Step(1)));
    assert_eq!(parse_command("si 12"), Ok(Command::Step(12)));
    assert!(parse_command("si").is_err());
    assert!(parse_command("si 0").is_err());
    assert!(parse_command("si x").is_err());
  }

  #[test]
  fn test_parse_other_commands() {
    assert_eq!(parse_command(" q "), Ok(Command::Quit));
    assert_eq!(parse_command("c"), Ok(Command::Continue));
    assert_eq!(parse_command("acc 3 17"), Ok(Command::Acc(3, 17)));
    assert!(parse_command("acc 3").is_err());
    assert!(parse_command("run").is_err());
  }
}
