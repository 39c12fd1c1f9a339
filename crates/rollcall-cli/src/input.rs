//! Line-based operator input.
//!
//! A reader thread forwards stdin lines into a channel so capture loops can
//! poll for keys between frames. Terminals are line-buffered, so each key is
//! followed by Return: SPACE+Return captures, a bare Return confirms, and
//! ESC+Return (or `x`) cancels.

use rollcall_core::RegistrationInput;
use std::io::BufRead;
use std::sync::mpsc::{self, Receiver, TryRecvError};

/// What a poll between frames produced.
#[derive(Debug, PartialEq, Eq)]
pub enum Poll {
    Line(String),
    Empty,
    Closed,
}

pub struct Keys {
    rx: Receiver<String>,
}

impl Keys {
    /// Start forwarding stdin. The reader thread ends at EOF.
    pub fn stdin() -> Self {
        let (tx, rx) = mpsc::channel();
        std::thread::Builder::new()
            .name("rollcall-stdin".into())
            .spawn(move || {
                for line in std::io::stdin().lock().lines() {
                    let Ok(line) = line else { break };
                    if tx.send(line).is_err() {
                        break;
                    }
                }
            })
            .ok();
        Self { rx }
    }

    pub fn from_receiver(rx: Receiver<String>) -> Self {
        Self { rx }
    }

    /// Non-blocking check for a pending line.
    pub fn poll(&self) -> Poll {
        match self.rx.try_recv() {
            Ok(line) => Poll::Line(strip_eol(line)),
            Err(TryRecvError::Empty) => Poll::Empty,
            Err(TryRecvError::Disconnected) => Poll::Closed,
        }
    }

    /// Print `prompt` and block for the next line. `None` once stdin is closed.
    pub fn prompt(&self, prompt: &str) -> Option<String> {
        print!("{prompt}");
        let _ = std::io::Write::flush(&mut std::io::stdout());
        self.rx.recv().ok().map(strip_eol)
    }
}

fn strip_eol(mut line: String) -> String {
    while line.ends_with('\n') || line.ends_with('\r') {
        line.pop();
    }
    line
}

/// Map a capture-loop line to a registration input.
pub fn registration_key(line: &str) -> Option<RegistrationInput> {
    match line {
        "" => Some(RegistrationInput::Confirm),
        "\u{1b}" | "x" | "X" => Some(RegistrationInput::Cancel),
        l if !l.is_empty() && l.chars().all(|c| c == ' ') => Some(RegistrationInput::Capture),
        _ => None,
    }
}
