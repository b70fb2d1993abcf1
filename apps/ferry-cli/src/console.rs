//! Interactive control and progress output for a running transfer.

use std::io::BufRead;
use std::str::FromStr;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use ferry_engine::{CommandOutcome, Subscription, TransferManager};
use ferry_transfer::{SpeedCalculator, TaskId, TaskSnapshot, TransferError};
use tokio::sync::mpsc;

/// A command typed on stdin while a transfer runs.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Command {
    Pause,
    Resume,
    Cancel,
    Status,
}

impl FromStr for Command {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "pause" | "p" => Ok(Self::Pause),
            "resume" | "r" => Ok(Self::Resume),
            "cancel" | "c" => Ok(Self::Cancel),
            "status" | "s" => Ok(Self::Status),
            other => Err(format!(
                "unknown command {other:?} (pause|p, resume|r, cancel|c, status|s)"
            )),
        }
    }
}

/// Runs `command` against the task and describes the outcome.
pub fn apply(manager: &TransferManager, id: TaskId, command: Command) -> String {
    let result = match command {
        Command::Pause => manager.pause(id).map(|o| outcome("paused", o)),
        Command::Resume => manager.resume(id).map(|o| outcome("resumed", o)),
        Command::Cancel => manager.cancel(id).map(|o| outcome("cancelled", o)),
        Command::Status => manager.get_status(id).map(|s| status_line(&s)),
    };
    result.unwrap_or_else(|e| format!("error: {e}"))
}

fn outcome(verb: &str, outcome: CommandOutcome) -> String {
    match outcome {
        CommandOutcome::Applied => verb.to_string(),
        CommandOutcome::Unchanged => format!("already {verb}"),
    }
}

/// Forwards stdin lines from a detached thread.
///
/// The thread is never joined; a pending read ends with the process.
pub fn spawn_stdin_reader() -> std::io::Result<mpsc::UnboundedReceiver<String>> {
    let (tx, rx) = mpsc::unbounded_channel();
    std::thread::Builder::new()
        .name("ferry-stdin".into())
        .spawn(move || {
            for line in std::io::stdin().lock().lines() {
                let Ok(line) = line else { break };
                if tx.send(line).is_err() {
                    break;
                }
            }
        })?;
    Ok(rx)
}

/// Applies commands until the sending side closes.
pub async fn run_commands(
    manager: &TransferManager,
    id: TaskId,
    commands: &mut mpsc::UnboundedReceiver<String>,
) {
    while let Some(line) = commands.recv().await {
        if line.trim().is_empty() {
            continue;
        }
        let reply = match line.parse::<Command>() {
            Ok(command) => apply(manager, id, command),
            Err(e) => e,
        };
        eprintln!("{reply}");
    }
}

/// Waits for the task to finish while applying commands as they arrive.
///
/// Returns as soon as the task is terminal, even if no more input comes.
pub async fn supervise(
    manager: &TransferManager,
    id: TaskId,
    commands: &mut mpsc::UnboundedReceiver<String>,
) -> Result<TaskSnapshot, TransferError> {
    tokio::select! {
        snapshot = manager.wait(id) => snapshot,
        () = run_commands(manager, id, commands) => {
            // Input closed; keep waiting without interactive control.
            manager.wait(id).await
        }
    }
}

/// Prints a progress line per completed chunk.
pub fn progress_subscription() -> Subscription {
    let speed = Arc::new(SpeedCalculator::default());
    let last = Arc::new(AtomicU64::new(0));
    Subscription::new()
        .on_progress(move |done, total| {
            let previous = last.swap(done, Ordering::Relaxed);
            speed.add_sample(done.saturating_sub(previous));
            let eta = speed.eta(total.saturating_sub(done));
            eprintln!("{}", progress_line(done, total, speed.bytes_per_second(), eta));
        })
        .on_error(|e| eprintln!("error: {e}"))
        .on_cancelled(|| eprintln!("cancelled"))
}

pub fn progress_line(
    done: u64,
    total: u64,
    bytes_per_second: f64,
    eta: Option<Duration>,
) -> String {
    let percent = if total == 0 {
        100.0
    } else {
        done as f64 / total as f64 * 100.0
    };
    let mut line = format!(
        "{:>5.1}%  {} / {}",
        percent,
        format_bytes(done),
        format_bytes(total)
    );
    if bytes_per_second > 0.0 {
        line.push_str(&format!("  {}/s", format_bytes(bytes_per_second as u64)));
    }
    if let Some(eta) = eta {
        line.push_str(&format!("  eta {}", format_duration(eta)));
    }
    line
}

pub fn status_line(snapshot: &TaskSnapshot) -> String {
    let total = snapshot
        .total_bytes
        .map(format_bytes)
        .unwrap_or_else(|| "?".into());
    let mut line = format!(
        "{} {} {}: {} / {} ({:.1}%)",
        snapshot.id,
        snapshot.direction,
        snapshot.state,
        format_bytes(snapshot.bytes_transferred),
        total,
        snapshot.percentage()
    );
    if let Some(error) = &snapshot.error {
        line.push_str(&format!(" - {error}"));
    }
    line
}

pub fn format_bytes(bytes: u64) -> String {
    const UNITS: &[&str] = &["B", "KiB", "MiB", "GiB", "TiB"];
    if bytes < 1024 {
        return format!("{bytes} B");
    }
    let mut size = bytes as f64;
    let mut unit = 0;
    while size >= 1024.0 && unit < UNITS.len() - 1 {
        size /= 1024.0;
        unit += 1;
    }
    format!("{size:.2} {}", UNITS[unit])
}

fn format_duration(d: Duration) -> String {
    let secs = d.as_secs();
    let (h, m, s) = (secs / 3600, (secs % 3600) / 60, secs % 60);
    if h > 0 {
        format!("{h}h {m}m {s}s")
    } else if m > 0 {
        format!("{m}m {s}s")
    } else {
        format!("{s}s")
    }
}
