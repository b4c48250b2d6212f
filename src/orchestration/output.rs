//! Child process output following
//!
//! Build and pull commands print progress on both pipes. Each pipe gets its
//! own reader task; lines are handed to the progress callback in arrival
//! order and only the last few are kept for error messages.

use crate::orchestration::runtime::ProgressFn;
use std::collections::VecDeque;
use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tokio::process::Child;
use tokio::sync::mpsc;

/// Lines kept for the error message of a failed build or pull
const TAIL_LINES: usize = 50;

/// The most recent lines a command printed
#[derive(Debug, Clone)]
pub(crate) struct OutputTail {
    lines: VecDeque<String>,
    capacity: usize,
}

impl OutputTail {
    pub(crate) fn with_capacity(capacity: usize) -> Self {
        Self {
            lines: VecDeque::with_capacity(capacity),
            capacity: capacity.max(1),
        }
    }

    pub(crate) fn push(&mut self, line: String) {
        if self.lines.len() == self.capacity {
            self.lines.pop_front();
        }
        self.lines.push_back(line);
    }

    /// Whether any kept line mentions `needle`, ignoring ASCII case
    pub(crate) fn mentions(&self, needle: &str) -> bool {
        let needle = needle.to_ascii_lowercase();
        self.lines
            .iter()
            .any(|line| line.to_ascii_lowercase().contains(&needle))
    }

    pub(crate) fn render(&self) -> String {
        self.lines.iter().map(String::as_str).collect::<Vec<_>>().join("\n")
    }
}

/// Forward every stdout and stderr line of `child` to `on_output` until both
/// pipes close, returning the tail
pub(crate) async fn follow(child: &mut Child, on_output: ProgressFn<'_>) -> OutputTail {
    let (tx, mut rx) = mpsc::unbounded_channel();
    if let Some(stdout) = child.stdout.take() {
        read_lines(stdout, tx.clone());
    }
    if let Some(stderr) = child.stderr.take() {
        read_lines(stderr, tx.clone());
    }
    drop(tx);

    let mut tail = OutputTail::with_capacity(TAIL_LINES);
    while let Some(line) = rx.recv().await {
        on_output(line.clone());
        tail.push(line);
    }
    tail
}

fn read_lines<R>(pipe: R, tx: mpsc::UnboundedSender<String>)
where
    R: AsyncRead + Unpin + Send + 'static,
{
    tokio::spawn(async move {
        let mut lines = BufReader::new(pipe).lines();
        while let Ok(Some(line)) = lines.next_line().await {
            if tx.send(line).is_err() {
                break;
            }
        }
    });
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::process::Stdio;
    use std::sync::Mutex;
    use tokio::process::Command;

    #[test]
    fn tail_keeps_latest_lines() {
        let mut tail = OutputTail::with_capacity(3);
        for i in 0..10 {
            tail.push(format!("step {}", i));
        }
        assert_eq!(tail.render(), "step 7\nstep 8\nstep 9");
        assert!(tail.mentions("STEP 9"));
        assert!(!tail.mentions("step 2"));
    }

    #[tokio::test]
    async fn follows_both_pipes() {
        let mut child = Command::new("sh")
            .args(["-c", "echo pulling; echo 'manifest unknown' 1>&2"])
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn()
            .unwrap();

        let seen = Mutex::new(Vec::new());
        let on_output = |line: String| seen.lock().unwrap().push(line);
        let tail = follow(&mut child, &on_output).await;
        child.wait().await.unwrap();

        let mut seen = seen.into_inner().unwrap();
        seen.sort();
        assert_eq!(seen, vec!["manifest unknown", "pulling"]);
        assert!(tail.mentions("manifest unknown"));
    }
}
