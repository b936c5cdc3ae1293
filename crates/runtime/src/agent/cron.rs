//! Per-runtime recurring jobs
//!
//! Each runtime owns a small table of cron jobs installed by the
//! `ScheduleCron` directive. A job is one timer task: it computes the next
//! fire time from the cron expression in the job's timezone and sends the
//! embedded message back into the runtime's inbox. Re-registering a job id
//! cancels the prior timer before starting the new one; all jobs are
//! cancelled when the runtime stops.

use std::collections::HashMap;
use std::str::FromStr;
use std::time::Duration;

use chrono::Utc;
use cron::Schedule;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use crate::types::{AgentError, AgentEvent};

use super::{fresh_event, Inbox};

pub(crate) struct CronJobs {
    jobs: HashMap<String, JoinHandle<()>>,
}

impl CronJobs {
    pub(crate) fn new() -> Self {
        Self {
            jobs: HashMap::new(),
        }
    }

    /// Install or replace a job. Expression and timezone are validated
    /// before the old timer is cancelled, so a bad replacement leaves the
    /// existing job running.
    pub(crate) fn install(
        &mut self,
        runtime_id: &str,
        job_id: &str,
        expression: &str,
        timezone: Option<&str>,
        message: AgentEvent,
        sender: mpsc::WeakUnboundedSender<Inbox>,
    ) -> Result<(), AgentError> {
        let schedule = parse_schedule(expression)?;
        let tz = parse_timezone(timezone.unwrap_or("UTC"))?;

        if let Some(previous) = self.jobs.remove(job_id) {
            previous.abort();
            tracing::debug!(
                "Runtime {}: replacing cron job {}",
                runtime_id,
                job_id
            );
        }

        let runtime_id = runtime_id.to_string();
        let job_label = job_id.to_string();
        let task = tokio::spawn(async move {
            loop {
                let now = Utc::now().with_timezone(&tz);
                let next = match schedule.after(&now).next() {
                    Some(next) => next.with_timezone(&Utc),
                    None => {
                        tracing::debug!(
                            "Runtime {}: cron job {} has no future fire times",
                            runtime_id,
                            job_label
                        );
                        break;
                    }
                };
                let delay = (next - Utc::now()).to_std().unwrap_or(Duration::ZERO);
                tokio::time::sleep(delay).await;

                let sender = match sender.upgrade() {
                    Some(sender) => sender,
                    None => break,
                };
                if sender
                    .send(Inbox::Event(fresh_event(message.clone())))
                    .is_err()
                {
                    break;
                }
            }
        });
        self.jobs.insert(job_id.to_string(), task);
        Ok(())
    }

    /// Cancel one job; returns whether it existed.
    pub(crate) fn cancel(&mut self, job_id: &str) -> bool {
        match self.jobs.remove(job_id) {
            Some(task) => {
                task.abort();
                true
            }
            None => false,
        }
    }

    /// Cancel every job.
    pub(crate) fn clear(&mut self) {
        for (_, task) in self.jobs.drain() {
            task.abort();
        }
    }
}

fn parse_schedule(expression: &str) -> Result<Schedule, AgentError> {
    Schedule::from_str(expression)
        .map_err(|e| AgentError::InvalidCron(format!("{}: {}", expression, e)))
}

fn parse_timezone(timezone: &str) -> Result<chrono_tz::Tz, AgentError> {
    timezone
        .parse::<chrono_tz::Tz>()
        .map_err(|_| AgentError::InvalidTimezone(timezone.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn parse_valid_expressions() {
        assert!(parse_schedule("* * * * * *").is_ok());
        assert!(parse_schedule("0 */5 * * * *").is_ok());
        assert!(parse_schedule("0 0 9 * * Mon-Fri").is_ok());
    }

    #[test]
    fn reject_invalid_expression() {
        assert!(matches!(
            parse_schedule("not a cron"),
            Err(AgentError::InvalidCron(_))
        ));
    }

    #[test]
    fn reject_invalid_timezone() {
        assert!(parse_timezone("UTC").is_ok());
        assert!(parse_timezone("America/New_York").is_ok());
        assert!(matches!(
            parse_timezone("Mars/Olympus"),
            Err(AgentError::InvalidTimezone(_))
        ));
    }

    #[tokio::test]
    async fn job_fires_into_inbox() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let mut jobs = CronJobs::new();
        jobs.install(
            "rt-1",
            "tick",
            "* * * * * *", // every second
            None,
            AgentEvent::new("cron_tick", json!({})),
            tx.downgrade(),
        )
        .unwrap();

        let received = tokio::time::timeout(Duration::from_millis(1500), rx.recv())
            .await
            .expect("cron job should fire within its period")
            .expect("channel open");
        match received {
            Inbox::Event(event) => assert_eq!(event.kind, "cron_tick"),
            _ => panic!("expected an event"),
        }
        jobs.clear();
    }

    #[tokio::test]
    async fn fires_carry_fresh_event_ids() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let mut jobs = CronJobs::new();
        jobs.install(
            "rt-1",
            "tick",
            "* * * * * *",
            Some("UTC"),
            AgentEvent::new("cron_tick", json!({})),
            tx.downgrade(),
        )
        .unwrap();

        let mut ids = Vec::new();
        for _ in 0..2 {
            let message = tokio::time::timeout(Duration::from_millis(2500), rx.recv())
                .await
                .expect("fire")
                .expect("open");
            if let Inbox::Event(event) = message {
                ids.push(event.id);
            }
        }
        assert_ne!(ids[0], ids[1]);
        jobs.clear();
    }

    #[tokio::test]
    async fn reinstall_replaces_and_cancel_removes() {
        let (tx, _rx) = mpsc::unbounded_channel();
        let mut jobs = CronJobs::new();
        jobs.install(
            "rt-1",
            "job",
            "0 0 0 1 1 *",
            None,
            AgentEvent::new("a", json!({})),
            tx.downgrade(),
        )
        .unwrap();
        jobs.install(
            "rt-1",
            "job",
            "0 0 0 1 1 *",
            None,
            AgentEvent::new("b", json!({})),
            tx.downgrade(),
        )
        .unwrap();
        assert_eq!(jobs.jobs.len(), 1);

        assert!(jobs.cancel("job"));
        assert!(!jobs.cancel("job"));
    }

    #[tokio::test]
    async fn bad_replacement_keeps_existing_job() {
        let (tx, _rx) = mpsc::unbounded_channel();
        let mut jobs = CronJobs::new();
        jobs.install(
            "rt-1",
            "job",
            "* * * * * *",
            None,
            AgentEvent::new("a", json!({})),
            tx.downgrade(),
        )
        .unwrap();

        let err = jobs.install(
            "rt-1",
            "job",
            "garbage",
            None,
            AgentEvent::new("b", json!({})),
            tx.downgrade(),
        );
        assert!(err.is_err());
        assert!(jobs.jobs.contains_key("job"));
        jobs.clear();
    }
}
