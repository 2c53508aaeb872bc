use std::path::PathBuf;

use chrono::Utc;
use serde::Serialize;
use tokio::io::AsyncWriteExt;
use tokio::sync::broadcast;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info};

use sopflow_core::types::{RunEvent, RunId};

/// JSONL run journal.
///
/// Listens on the EventBus and appends one JSON object per line for a
/// single run. Lines already written stay intact if the process dies.
pub struct RunLogger {
    log_dir: PathBuf,
    level: u8,
}

/// A single line of the journal.
#[derive(Serialize)]
struct LogEntry {
    timestamp: String,
    run_id: String,
    event_type: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    step_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    detail: Option<serde_json::Value>,
}

impl RunLogger {
    /// Logs go to `{log_dir}/{run_id}/{timestamp}.jsonl`.
    /// `level`: 1=run lifecycle, 2=step outcomes and approvals, 3=every attempt.
    pub fn new(log_dir: PathBuf, level: u8) -> Self {
        Self { log_dir, level }
    }

    /// Write events for `run_id` until the run finishes or pauses, or until
    /// cancellation. A resumed run gets a new file in the same directory.
    ///
    /// Subscribe `rx` before the run starts: the id of a new run is only
    /// known once it exists, and buffered events are not lost.
    pub async fn run(
        self,
        mut rx: broadcast::Receiver<RunEvent>,
        run_id: RunId,
        cancel: CancellationToken,
    ) {
        let run_dir = self.log_dir.join(run_id.as_str());
        if let Err(e) = tokio::fs::create_dir_all(&run_dir).await {
            error!(error = %e, "Failed to create log directory");
            return;
        }

        let timestamp = Utc::now().format("%Y%m%d_%H%M%S%3f").to_string();
        let log_path = run_dir.join(format!("{}.jsonl", timestamp));

        let file = match tokio::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&log_path)
            .await
        {
            Ok(f) => f,
            Err(e) => {
                error!(error = %e, path = %log_path.display(), "Failed to open log file");
                return;
            }
        };

        info!(path = %log_path.display(), "RunLogger started");

        let mut writer = tokio::io::BufWriter::new(file);

        loop {
            tokio::select! {
                _ = cancel.cancelled() => {
                    debug!("RunLogger cancelled");
                    break;
                }
                result = rx.recv() => {
                    match result {
                        Ok(event) => {
                            if event.run_id() != &run_id {
                                continue;
                            }
                            if let Some(entry) = self.event_to_entry(&event) {
                                if let Ok(json) = serde_json::to_string(&entry) {
                                    let line = format!("{}\n", json);
                                    if let Err(e) = writer.write_all(line.as_bytes()).await {
                                        error!(error = %e, "Failed to write log entry");
                                        break;
                                    }
                                    if let Err(e) = writer.flush().await {
                                        error!(error = %e, "Failed to flush log");
                                    }
                                }
                            }

                            if matches!(
                                event,
                                RunEvent::RunFinished { .. } | RunEvent::ApprovalRequested { .. }
                            ) {
                                break;
                            }
                        }
                        Err(broadcast::error::RecvError::Lagged(n)) => {
                            debug!(skipped = n, "RunLogger lagged, skipped events");
                        }
                        Err(broadcast::error::RecvError::Closed) => {
                            debug!("EventBus closed, RunLogger stopping");
                            break;
                        }
                    }
                }
            }
        }

        writer.flush().await.ok();
        debug!(path = %log_path.display(), "RunLogger finished");
    }

    /// Convert an event to a journal line, or `None` if filtered by level.
    fn event_to_entry(&self, event: &RunEvent) -> Option<LogEntry> {
        let entry = |event_type: &str, step_id: Option<&str>, detail: Option<serde_json::Value>| {
            Some(LogEntry {
                timestamp: Utc::now().to_rfc3339(),
                run_id: event.run_id().to_string(),
                event_type: event_type.to_string(),
                step_id: step_id.map(String::from),
                detail,
            })
        };

        match event {
            // L1: run lifecycle
            RunEvent::RunStarted { steps, .. } => {
                entry("run_started", None, Some(serde_json::json!({ "steps": steps })))
            }
            RunEvent::RunFinished { status, .. } => entry(
                "run_finished",
                None,
                Some(serde_json::json!({ "status": status.as_str() })),
            ),
            RunEvent::ApprovalRequested { request } => entry(
                "approval_requested",
                Some(request.step_id.as_str()),
                Some(serde_json::json!({
                    "tool": request.tool,
                    "args": truncate_json(&serde_json::Value::Object(request.args.clone()), 500),
                })),
            ),

            // L2: step outcomes and decisions
            RunEvent::StepSucceeded {
                step_id, attempts, ..
            } if self.level >= 2 => entry(
                "step_succeeded",
                Some(step_id.as_str()),
                Some(serde_json::json!({ "attempts": attempts })),
            ),
            RunEvent::StepFailed {
                step_id,
                kind,
                attempts,
                ..
            } if self.level >= 2 => entry(
                "step_failed",
                Some(step_id.as_str()),
                Some(serde_json::json!({ "kind": kind.as_str(), "attempts": attempts })),
            ),
            RunEvent::StepSkipped { step_id, .. } if self.level >= 2 => {
                entry("step_skipped", Some(step_id.as_str()), None)
            }
            RunEvent::ApprovalResolved {
                step_id, verdict, ..
            } if self.level >= 2 => entry(
                "approval_resolved",
                Some(step_id.as_str()),
                Some(serde_json::json!({ "verdict": verdict.to_string() })),
            ),
            RunEvent::StaleApproval { step_id, .. } if self.level >= 2 => {
                entry("stale_approval", Some(step_id.as_str()), None)
            }

            // L3: every attempt
            RunEvent::StepStarted { step_id, tool, .. } if self.level >= 3 => entry(
                "step_started",
                Some(step_id.as_str()),
                Some(serde_json::json!({ "tool": tool })),
            ),
            RunEvent::AttemptFailed {
                step_id,
                attempt,
                kind,
                message,
                ..
            } if self.level >= 3 => entry(
                "attempt_failed",
                Some(step_id.as_str()),
                Some(serde_json::json!({
                    "attempt": attempt,
                    "kind": kind.as_str(),
                    "message": truncate_str(message, 200),
                })),
            ),

            _ => None,
        }
    }
}

fn truncate_json(value: &serde_json::Value, max_len: usize) -> String {
    let s = value.to_string();
    if s.len() <= max_len {
        s
    } else {
        format!("{}...", truncate_str(&s, max_len))
    }
}

fn truncate_str(s: &str, max_len: usize) -> &str {
    if s.len() <= max_len {
        return s;
    }
    let mut end = max_len;
    while !s.is_char_boundary(end) {
        end -= 1;
    }
    &s[..end]
}

#[cfg(test)]
mod tests {
    use super::*;
    use sopflow_core::error::FailureKind;
    use sopflow_core::event::EventBus;
    use sopflow_core::types::RunStatus;

    fn attempt_failed(run_id: &RunId) -> RunEvent {
        RunEvent::AttemptFailed {
            run_id: run_id.clone(),
            step_id: "area".into(),
            attempt: 1,
            kind: FailureKind::ToolIo,
            message: "disk full".into(),
        }
    }

    #[test]
    fn entry_skips_empty_fields() {
        let logger = RunLogger::new(PathBuf::from("/tmp"), 1);
        let entry = logger
            .event_to_entry(&RunEvent::RunFinished {
                run_id: RunId::from_str("r1"),
                status: RunStatus::Succeeded,
            })
            .unwrap();
        let json = serde_json::to_string(&entry).unwrap();
        assert!(json.contains("\"run_finished\""));
        assert!(json.contains("\"succeeded\""));
        assert!(!json.contains("step_id"));
    }

    #[test]
    fn level_filters_events() {
        let run_id = RunId::from_str("r1");
        let skipped = RunEvent::StepSkipped {
            run_id: run_id.clone(),
            step_id: "s".into(),
        };

        let l1 = RunLogger::new(PathBuf::from("/tmp"), 1);
        assert!(l1.event_to_entry(&skipped).is_none());
        assert!(l1.event_to_entry(&attempt_failed(&run_id)).is_none());

        let l2 = RunLogger::new(PathBuf::from("/tmp"), 2);
        assert!(l2.event_to_entry(&skipped).is_some());
        assert!(l2.event_to_entry(&attempt_failed(&run_id)).is_none());

        let l3 = RunLogger::new(PathBuf::from("/tmp"), 3);
        assert!(l3.event_to_entry(&attempt_failed(&run_id)).is_some());
    }

    #[test]
    fn truncation_respects_char_boundaries() {
        assert_eq!(truncate_str("héllo", 2), "h");
        let long = serde_json::json!({"key": "a very long string that should be truncated"});
        assert!(truncate_json(&long, 20).ends_with("..."));
    }

    #[tokio::test]
    async fn writes_only_its_run() {
        let dir = tempfile::tempdir().unwrap();
        let bus = EventBus::default();
        let run_id = RunId::from_str("mine");
        let rx = bus.subscribe();

        bus.publish(attempt_failed(&RunId::from_str("other")));
        bus.publish(attempt_failed(&run_id));
        bus.publish(RunEvent::RunFinished {
            run_id: run_id.clone(),
            status: RunStatus::Failed,
        });

        let logger = RunLogger::new(dir.path().to_path_buf(), 3);
        logger.run(rx, run_id, CancellationToken::new()).await;

        let mut files = std::fs::read_dir(dir.path().join("mine")).unwrap();
        let path = files.next().unwrap().unwrap().path();
        let content = std::fs::read_to_string(path).unwrap();
        let lines: Vec<&str> = content.lines().collect();
        assert_eq!(lines.len(), 2);
        assert!(lines[0].contains("attempt_failed"));
        assert!(lines[1].contains("run_finished"));
        assert!(!dir.path().join("other").exists());
    }
}
