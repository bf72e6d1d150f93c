// src/core/supervisor/handle.rs

//! The in-memory handle to one running child process.

use parking_lot::Mutex;
use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Instant;
use tokio::io::AsyncWriteExt;
use tokio::process::ChildStdin;
use tokio::sync::watch;

/// Lines of recent console output retained per instance for late-joining
/// subscribers.
pub const CONSOLE_WINDOW: usize = 200;

/// The runtime state of a spawned instance. Exists strictly between a
/// successful spawn and the observed exit; the exit reaper drops it from the
/// process table.
#[derive(Debug)]
pub struct RuntimeHandle {
    pub pid: u32,
    pub started_at: Instant,
    stdin: Arc<tokio::sync::Mutex<ChildStdin>>,
    console: Mutex<VecDeque<String>>,
    exit_rx: watch::Receiver<Option<i32>>,
}

impl RuntimeHandle {
    pub fn new(pid: u32, stdin: ChildStdin, exit_rx: watch::Receiver<Option<i32>>) -> Self {
        Self {
            pid,
            started_at: Instant::now(),
            stdin: Arc::new(tokio::sync::Mutex::new(stdin)),
            console: Mutex::new(VecDeque::with_capacity(CONSOLE_WINDOW)),
            exit_rx,
        }
    }

    /// Appends a line to the rolling console window, evicting the oldest.
    pub fn record_line(&self, line: &str) {
        let mut console = self.console.lock();
        if console.len() == CONSOLE_WINDOW {
            console.pop_front();
        }
        console.push_back(line.to_string());
    }

    /// The retained console window, oldest line first.
    pub fn console_window(&self) -> Vec<String> {
        self.console.lock().iter().cloned().collect()
    }

    /// Writes one command line (newline appended) to the child's stdin.
    pub async fn write_line(&self, line: &str) -> std::io::Result<()> {
        let mut stdin = self.stdin.lock().await;
        stdin.write_all(line.as_bytes()).await?;
        stdin.write_all(b"\n").await?;
        stdin.flush().await
    }

    /// A receiver resolving to the exit code once the child is reaped.
    pub fn exit_receiver(&self) -> watch::Receiver<Option<i32>> {
        self.exit_rx.clone()
    }
}
