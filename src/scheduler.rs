//! Poll scheduler
//!
//! One periodic timer drives pull passes against the configured backend.
//! A tick that lands while a pass is still running is skipped via a
//! single-slot `AtomicBool` guard; there is never more than one pass in
//! flight. Commands arrive over an mpsc channel, observers subscribe to a
//! broadcast event stream, and Unix builds drain SIGTERM/SIGINT for a clean
//! shutdown.

use crate::orchestrator::Orchestrator;
use crate::Result;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, mpsc};
use tokio::time::interval;
use tracing::{debug, error, info, warn};

/// Default pull interval: 30 minutes
pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_secs(1800);

/// Control commands accepted by a running scheduler
#[derive(Debug, Clone)]
pub enum SchedulerCommand {
    /// Run a pull pass now, outside the timer
    SyncNow,
    /// Change the tick interval
    SetInterval(Duration),
    /// Stop the loop
    Shutdown,
}

/// Events broadcast to observers
#[derive(Debug, Clone)]
pub enum SchedulerEvent {
    PullStarted { backend: String },
    PullCompleted { backend: String, issues: usize, changes: usize },
    TicketUpdated { ticket_id: i64 },
    Error { message: String },
}

/// Handle for a spawned scheduler
pub struct SchedulerHandle {
    commands: mpsc::Sender<SchedulerCommand>,
    events: broadcast::Sender<SchedulerEvent>,
}

impl SchedulerHandle {
    pub async fn send(&self, command: SchedulerCommand) -> Result<()> {
        self.commands
            .send(command)
            .await
            .map_err(|_| crate::BridgeError::Other("scheduler is gone".to_string()))
    }

    pub fn subscribe(&self) -> broadcast::Receiver<SchedulerEvent> {
        self.events.subscribe()
    }
}

pub struct Scheduler {
    orchestrator: Arc<Orchestrator>,
    poll_interval: Duration,
    in_flight: Arc<AtomicBool>,
    events: broadcast::Sender<SchedulerEvent>,
}

impl Scheduler {
    pub fn new(orchestrator: Arc<Orchestrator>, poll_interval: Duration) -> Self {
        let (events, _) = broadcast::channel(64);
        Self {
            orchestrator,
            poll_interval,
            in_flight: Arc::new(AtomicBool::new(false)),
            events,
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<SchedulerEvent> {
        self.events.subscribe()
    }

    /// Spawn the scheduler loop, returning its control handle
    pub fn spawn(self) -> SchedulerHandle {
        let (tx, rx) = mpsc::channel(16);
        let handle = SchedulerHandle {
            commands: tx,
            events: self.events.clone(),
        };
        tokio::spawn(async move {
            self.run(rx).await;
        });
        handle
    }

    /// The daemon loop; returns when shut down
    pub async fn run(mut self, mut commands: mpsc::Receiver<SchedulerCommand>) {
        info!(
            backend = self.orchestrator.backend_name(),
            interval_secs = self.poll_interval.as_secs(),
            "Scheduler starting"
        );
        crate::metrics::set_health_status(true);

        let mut ticker = interval(self.poll_interval);
        // The first interval tick fires immediately; that is the startup pull

        #[cfg(unix)]
        let (mut sigterm, mut sigint) = match signals() {
            Ok(pair) => pair,
            Err(err) => {
                error!(error = %err, "Failed to install signal handlers");
                return;
            }
        };

        loop {
            #[cfg(unix)]
            tokio::select! {
                _ = ticker.tick() => self.tick().await,
                command = commands.recv() => {
                    match command {
                        Some(SchedulerCommand::SyncNow) => {
                            debug!("Manual sync requested");
                            self.tick().await;
                        }
                        Some(SchedulerCommand::SetInterval(duration)) => {
                            info!(interval_secs = duration.as_secs(), "Poll interval changed");
                            self.poll_interval = duration;
                            ticker = interval(duration);
                            ticker.reset();
                        }
                        Some(SchedulerCommand::Shutdown) | None => break,
                    }
                }
                _ = sigterm.recv() => {
                    info!("SIGTERM received, shutting down");
                    break;
                }
                _ = sigint.recv() => {
                    info!("SIGINT received, shutting down");
                    break;
                }
            }

            #[cfg(not(unix))]
            tokio::select! {
                _ = ticker.tick() => self.tick().await,
                command = commands.recv() => {
                    match command {
                        Some(SchedulerCommand::SyncNow) => {
                            debug!("Manual sync requested");
                            self.tick().await;
                        }
                        Some(SchedulerCommand::SetInterval(duration)) => {
                            info!(interval_secs = duration.as_secs(), "Poll interval changed");
                            self.poll_interval = duration;
                            ticker = interval(duration);
                            ticker.reset();
                        }
                        Some(SchedulerCommand::Shutdown) | None => break,
                    }
                }
            }
        }

        crate::metrics::set_health_status(false);
        info!("Scheduler stopped");
    }

    /// One tick: run a pull pass unless one is already in flight
    async fn tick(&self) {
        // Single-slot guard; a tick landing mid-pass is dropped, not queued
        if self
            .in_flight
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            warn!("Pull pass still in flight, skipping tick");
            return;
        }

        let backend = self.orchestrator.backend_name().to_string();
        let _ = self.events.send(SchedulerEvent::PullStarted {
            backend: backend.clone(),
        });

        match self.orchestrator.pull_cycle().await {
            Ok(stats) => {
                let _ = self.events.send(SchedulerEvent::PullCompleted {
                    backend,
                    issues: stats.issues_seen,
                    changes: stats.changes,
                });
            }
            Err(err) => {
                error!(backend = %backend, error = %err, "Pull pass failed");
                let _ = self.events.send(SchedulerEvent::Error {
                    message: err.to_string(),
                });
            }
        }

        // Cleared on success and failure alike
        self.in_flight.store(false, Ordering::SeqCst);
    }
}

#[cfg(unix)]
fn signals() -> std::io::Result<(
    tokio::signal::unix::Signal,
    tokio::signal::unix::Signal,
)> {
    use tokio::signal::unix::{signal, SignalKind};
    Ok((
        signal(SignalKind::terminate())?,
        signal(SignalKind::interrupt())?,
    ))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::{
        AttachmentPayload, BugTracker, EscalationReceipt, EscalationRequest, FetchOutcome,
        PullPage,
    };
    use crate::collab::{LogNotifier, MemoryObjectStore, StaticDirectory};
    use crate::model::{Comment, RemoteId, TicketStatus};
    use crate::store::TicketStore;
    use async_trait::async_trait;
    use chrono::{DateTime, Utc};
    use std::sync::atomic::AtomicUsize;
    use tokio::sync::Mutex;

    struct CountingTracker {
        pulls: AtomicUsize,
    }

    #[async_trait]
    impl BugTracker for CountingTracker {
        fn name(&self) -> &'static str {
            "counting"
        }
        fn stable_attachment_ids(&self) -> bool {
            true
        }
        fn map_remote_status(&self, _token: &str) -> TicketStatus {
            TicketStatus::Opened
        }
        async fn escalate(&self, _request: &EscalationRequest) -> Result<EscalationReceipt> {
            Ok(EscalationReceipt::Pending)
        }
        async fn fetch_issue(&self, _remote_id: &RemoteId) -> Result<FetchOutcome> {
            Ok(FetchOutcome::Unsupported)
        }
        async fn comment_issue(&self, _remote_id: &RemoteId, _comment: &Comment) -> Result<()> {
            Ok(())
        }
        async fn sync_attachments(
            &self,
            _ticket_id: i64,
            remote_id: &RemoteId,
            _locals: &[AttachmentPayload],
        ) -> Result<RemoteId> {
            Ok(remote_id.clone())
        }
        async fn pull(&self, _since: DateTime<Utc>) -> Result<PullPage> {
            self.pulls.fetch_add(1, Ordering::SeqCst);
            Ok(PullPage {
                issues: Vec::new(),
                has_more: false,
            })
        }
        async fn download_attachment(&self, _remote_id: &str) -> Result<Vec<u8>> {
            Ok(Vec::new())
        }
    }

    fn scheduler() -> Scheduler {
        let store = Arc::new(Mutex::new(TicketStore::open_in_memory().unwrap()));
        let orchestrator = Arc::new(Orchestrator::new(
            store,
            Arc::new(CountingTracker {
                pulls: AtomicUsize::new(0),
            }),
            Arc::new(MemoryObjectStore::new()),
            Arc::new(StaticDirectory::new()),
            Arc::new(LogNotifier::new()),
        ));
        Scheduler::new(orchestrator, Duration::from_secs(3600))
    }

    #[tokio::test]
    async fn test_sync_now_and_shutdown() {
        let sched = scheduler();
        let mut events = sched.subscribe();
        let handle = sched.spawn();

        handle.send(SchedulerCommand::SyncNow).await.unwrap();
        handle.send(SchedulerCommand::Shutdown).await.unwrap();

        // First event may be the startup tick; look for at least one
        // completed pull before the channel closes
        let mut completed = 0;
        while let Ok(event) = events.recv().await {
            if matches!(event, SchedulerEvent::PullCompleted { .. }) {
                completed += 1;
            }
            if completed >= 1 {
                break;
            }
        }
        assert!(completed >= 1);
    }

    #[tokio::test]
    async fn test_in_flight_guard_skips_overlap() {
        let sched = scheduler();
        sched.in_flight.store(true, Ordering::SeqCst);
        // A tick under an occupied slot must return without pulling
        sched.tick().await;
        assert!(sched.in_flight.load(Ordering::SeqCst));
    }
}
