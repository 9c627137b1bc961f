//! Operator command parser for `sockconsole serve`.
//!
//! One command per stdin line:
//!
//! ```text
//! list
//! echo <key> <text>
//! prompt <key> <seconds> <text>
//! broadcast <text>
//! clean
//! quit
//! ```

use std::net::SocketAddr;
use std::time::Duration;

/// Parsed operator command.
#[derive(Debug, Clone, PartialEq)]
pub enum Command {
    /// Print the keys of all connected peers.
    List,
    /// Echo text to one peer.
    Echo { key: SocketAddr, text: String },
    /// Ask one peer a question and wait for the answer.
    Prompt {
        key: SocketAddr,
        wait: Duration,
        text: String,
    },
    /// Echo text to every peer.
    Broadcast(String),
    /// Sweep dead connections now.
    Clean,
    /// Shut the server down.
    Quit,
}

/// Parse error.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ParseError {
    Empty,
    UnknownCommand(String),
    MissingArgument(&'static str),
    InvalidKey(String),
    InvalidWait(String),
}

impl std::fmt::Display for ParseError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ParseError::Empty => write!(f, "empty command"),
            ParseError::UnknownCommand(cmd) => write!(f, "unknown command '{cmd}'"),
            ParseError::MissingArgument(arg) => write!(f, "missing argument <{arg}>"),
            ParseError::InvalidKey(key) => write!(f, "invalid key '{key}', expected host:port"),
            ParseError::InvalidWait(wait) => write!(f, "invalid wait '{wait}', expected seconds"),
        }
    }
}

/// Parse one operator line.
pub fn parse(line: &str) -> Result<Command, ParseError> {
    let line = line.trim();
    let (cmd, rest) = split_word(line);

    match cmd.to_ascii_lowercase().as_str() {
        "" => Err(ParseError::Empty),
        "list" | "ls" => Ok(Command::List),
        "clean" => Ok(Command::Clean),
        "quit" | "exit" => Ok(Command::Quit),
        "broadcast" => Ok(Command::Broadcast(rest.to_string())),
        "echo" => {
            let (key, text) = split_word(rest);
            Ok(Command::Echo {
                key: parse_key(key)?,
                text: text.to_string(),
            })
        }
        "prompt" => {
            let (key, rest) = split_word(rest);
            let key = parse_key(key)?;
            let (wait, text) = split_word(rest);
            if wait.is_empty() {
                return Err(ParseError::MissingArgument("seconds"));
            }
            let wait = wait
                .parse::<f64>()
                .ok()
                .and_then(|secs| Duration::try_from_secs_f64(secs).ok())
                .ok_or_else(|| ParseError::InvalidWait(wait.to_string()))?;
            Ok(Command::Prompt {
                key,
                wait,
                text: text.to_string(),
            })
        }
        _ => Err(ParseError::UnknownCommand(cmd.to_string())),
    }
}

fn parse_key(key: &str) -> Result<SocketAddr, ParseError> {
    if key.is_empty() {
        return Err(ParseError::MissingArgument("key"));
    }
    key.parse().map_err(|_| ParseError::InvalidKey(key.to_string()))
}

/// Split off the first whitespace-delimited word.
fn split_word(input: &str) -> (&str, &str) {
    match input.split_once(char::is_whitespace) {
        Some((word, rest)) => (word, rest.trim_start()),
        None => (input, ""),
    }
}
