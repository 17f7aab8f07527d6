use std::fmt;
use std::io::{self, BufRead, Write};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::{self, Receiver, RecvTimeoutError, TrySendError};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use tracing::{debug, warn};

/// Operator command typed on the console
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Command {
    Detect,
    Classify,
    Stop,
    /// `quit` or `exit`
    Quit,
    Unknown(String),
}

impl Command {
    /// Case-insensitive, surrounding whitespace ignored. Blank lines are `None`.
    pub fn parse(line: &str) -> Option<Command> {
        let word = line.trim().to_lowercase();
        let command = match word.as_str() {
            "" => return None,
            "detect" => Command::Detect,
            "cls" => Command::Classify,
            "stop" => Command::Stop,
            "quit" | "exit" => Command::Quit,
            _ => Command::Unknown(word),
        };
        Some(command)
    }

    /// Ends a running capture mode
    pub fn is_abort(&self) -> bool {
        matches!(self, Command::Stop | Command::Quit)
    }
}

impl fmt::Display for Command {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Command::Detect => f.write_str("detect"),
            Command::Classify => f.write_str("cls"),
            Command::Stop => f.write_str("stop"),
            Command::Quit => f.write_str("quit"),
            Command::Unknown(word) => f.write_str(word),
        }
    }
}

/// Non-blocking source of interrupt commands, sampled between capture steps
pub trait CommandSource {
    /// Never blocks; `None` when nothing is pending
    fn poll_command(&mut self) -> Option<Command>;

    /// Sample once and keep only commands that end a mode
    fn poll_abort(&mut self) -> Option<Command> {
        match self.poll_command()? {
            command if command.is_abort() => Some(command),
            other => {
                debug!("ignoring '{}' while a mode is running", other);
                None
            }
        }
    }
}

/// Stdin reader feeding a single-slot channel.
///
/// At most one line is pending at any time; lines typed while one is still
/// unread are dropped.
pub struct Console {
    receiver: Receiver<String>,
    running: Arc<AtomicBool>,
}

impl Console {
    pub fn spawn(running: Arc<AtomicBool>) -> Self {
        let (sender, receiver) = mpsc::sync_channel::<String>(1);

        thread::spawn(move || {
            let stdin = io::stdin();
            for line in stdin.lock().lines() {
                let Ok(line) = line else { break };
                match sender.try_send(line) {
                    Ok(()) => {}
                    Err(TrySendError::Full(line)) => {
                        warn!("Dropping console input '{}': a command is already pending", line.trim());
                    }
                    Err(TrySendError::Disconnected(_)) => break,
                }
            }
        });

        Console { receiver, running }
    }

    /// Block until a line arrives. `None` once shutdown was requested or
    /// stdin closed.
    pub fn read_line(&mut self) -> Option<String> {
        while self.running.load(Ordering::Relaxed) {
            match self.receiver.recv_timeout(Duration::from_millis(100)) {
                Ok(line) => return Some(line),
                Err(RecvTimeoutError::Timeout) => continue,
                Err(RecvTimeoutError::Disconnected) => return None,
            }
        }
        None
    }

    /// Ask until the operator enters an integer subject id
    pub fn prompt_subject_id(&mut self) -> Option<i64> {
        loop {
            print!("person_id (int): ");
            io::stdout().flush().ok();

            let line = self.read_line()?;
            match parse_subject_id(&line) {
                Some(id) => return Some(id),
                None => println!("Invalid person_id. Please enter an integer."),
            }
        }
    }
}

/// Any signed integer; surrounding whitespace ignored
pub fn parse_subject_id(line: &str) -> Option<i64> {
    line.trim().parse().ok()
}

impl CommandSource for Console {
    fn poll_command(&mut self) -> Option<Command> {
        if !self.running.load(Ordering::Relaxed) {
            return Some(Command::Quit);
        }
        self.receiver
            .try_recv()
            .ok()
            .and_then(|line| Command::parse(&line))
    }
}
