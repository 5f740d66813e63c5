use std::collections::HashSet;
use std::path::PathBuf;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use lettre::message::Mailbox;
use serde::Serialize;
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TrySendError;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use mergemail_content::{Candidate, DuplicateGates, Record, SourceTable, render_row, resolve};
use mergemail_core::{
    ActivityLog, Counters, MergeError, MergeStore, RecoveryCheckpoint, Result, RowResult,
    SendFlags, SendOutcome, SkipReason, Template,
};

use crate::message::{BrandingConfig, MessageComposer};
use crate::relay::Relay;

const SESSION_EVENT_QUEUE_CAPACITY: usize = 256;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionState {
    Idle,
    Connecting,
    Sending,
    Completed,
    Aborted,
}

#[derive(Debug, Clone, Serialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum SendEvent {
    State {
        state: SessionState,
    },
    Loaded {
        rows: usize,
        resume_index: usize,
    },
    Outcome {
        outcome: SendOutcome,
        counters: Counters,
    },
    Warning {
        message: String,
    },
}

/// What to send: everything a recovery checkpoint captures plus the row to
/// start from.
#[derive(Debug, Clone, Default)]
pub struct SessionConfig {
    pub source_path: Option<PathBuf>,
    pub template: Template,
    pub inline_images: Vec<PathBuf>,
    pub attachments: Vec<PathBuf>,
    pub flags: SendFlags,
    pub resume_index: usize,
}

impl SessionConfig {
    pub fn resume(checkpoint: RecoveryCheckpoint) -> Self {
        Self {
            source_path: Some(checkpoint.source_path),
            template: checkpoint.template,
            inline_images: checkpoint.inline_images,
            attachments: checkpoint.attachments,
            flags: checkpoint.flags,
            resume_index: checkpoint.next_row_index,
        }
    }

    pub fn validate(&self) -> Result<()> {
        match &self.source_path {
            Some(path) if !path.as_os_str().is_empty() => {}
            _ => return Err(MergeError::Config("no source file selected".into())),
        }
        // Per-row mode is checked again once the source columns are known.
        if !self.template.use_row_content && self.template.is_blank() {
            return Err(MergeError::Config("subject and body are required".into()));
        }
        Ok(())
    }

    fn checkpoint(&self, source_path: PathBuf, next_row_index: usize) -> RecoveryCheckpoint {
        RecoveryCheckpoint {
            source_path,
            next_row_index,
            template: self.template.clone(),
            inline_images: self.inline_images.clone(),
            attachments: self.attachments.clone(),
            flags: self.flags,
        }
    }
}

/// How to send: sender identity, per-message deadline and branding.
#[derive(Debug, Clone)]
pub struct DeliverySettings {
    pub from: Mailbox,
    pub send_timeout: Duration,
    pub branding: BrandingConfig,
}

#[derive(Debug, Clone, Serialize)]
pub struct SessionReport {
    pub state: SessionState,
    pub counters: Counters,
    pub rows: usize,
    pub next_row_index: usize,
    pub stopped: bool,
    pub results: Vec<RowResult>,
    pub status_export: Option<PathBuf>,
    pub error: Option<String>,
}

#[derive(Debug, Clone, Default)]
pub struct StopSignal(Arc<AtomicBool>);

impl StopSignal {
    pub fn stop(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_stopped(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

pub struct SessionHandle {
    stop: StopSignal,
    task: JoinHandle<SessionReport>,
}

impl SessionHandle {
    pub fn stop(&self) {
        self.stop.stop();
    }

    pub fn stop_signal(&self) -> StopSignal {
        self.stop.clone()
    }

    pub async fn join(self) -> SessionReport {
        match self.task.await {
            Ok(report) => report,
            Err(err) => SessionReport {
                state: SessionState::Aborted,
                counters: Counters::default(),
                rows: 0,
                next_row_index: 0,
                stopped: false,
                results: Vec::new(),
                status_export: None,
                error: Some(format!("session worker failed: {}", err)),
            },
        }
    }
}

pub struct SendSession {
    config: SessionConfig,
    settings: DeliverySettings,
    store: Arc<dyn MergeStore>,
    relay: Arc<dyn Relay>,
    activity: Arc<ActivityLog>,
}

impl SendSession {
    pub fn new(
        config: SessionConfig,
        settings: DeliverySettings,
        store: Arc<dyn MergeStore>,
        relay: Arc<dyn Relay>,
        activity: Arc<ActivityLog>,
    ) -> Self {
        Self {
            config,
            settings,
            store,
            relay,
            activity,
        }
    }

    /// Validates the configuration and spawns the delivery worker. A rejected
    /// configuration never leaves `Idle`.
    pub fn start(self) -> Result<(SessionHandle, mpsc::Receiver<SendEvent>)> {
        self.config.validate()?;
        let (evt_tx, evt_rx) = mpsc::channel::<SendEvent>(SESSION_EVENT_QUEUE_CAPACITY);
        let stop = StopSignal::default();
        let next_row_index = self.config.resume_index;
        let worker = Worker {
            config: self.config,
            settings: self.settings,
            store: self.store,
            relay: self.relay,
            activity: self.activity,
            events: evt_tx,
            stop: stop.clone(),
            state: SessionState::Idle,
            counters: Counters::default(),
            rows: 0,
            next_row_index,
            stopped: false,
            results: Vec::new(),
            status_export: None,
        };
        let task = tokio::spawn(worker.run());
        Ok((SessionHandle { stop, task }, evt_rx))
    }
}

struct Worker {
    config: SessionConfig,
    settings: DeliverySettings,
    store: Arc<dyn MergeStore>,
    relay: Arc<dyn Relay>,
    activity: Arc<ActivityLog>,
    events: mpsc::Sender<SendEvent>,
    stop: StopSignal,
    state: SessionState,
    counters: Counters,
    rows: usize,
    next_row_index: usize,
    stopped: bool,
    results: Vec<RowResult>,
    status_export: Option<PathBuf>,
}

impl Worker {
    async fn run(mut self) -> SessionReport {
        let error = match self.drive().await {
            Ok(()) => None,
            Err(err) => {
                warn!(error = %err, "send session aborted");
                self.activity.record(&format!("Aborted: {}", err));
                self.transition(SessionState::Aborted);
                Some(err.to_string())
            }
        };
        SessionReport {
            state: self.state,
            counters: self.counters,
            rows: self.rows,
            next_row_index: self.next_row_index,
            stopped: self.stopped,
            results: self.results,
            status_export: self.status_export,
            error,
        }
    }

    async fn drive(&mut self) -> Result<()> {
        self.transition(SessionState::Connecting);

        let source_path = self
            .config
            .source_path
            .clone()
            .ok_or_else(|| MergeError::Config("no source file selected".into()))?;
        let table = {
            let path = source_path.clone();
            tokio::task::spawn_blocking(move || SourceTable::load(&path))
                .await
                .map_err(|e| MergeError::source_read(&source_path, e))??
        };
        self.rows = table.len();

        let template = &self.config.template;
        if template.use_row_content {
            let roles = table.roles();
            if roles.subject.is_none() && roles.body.is_none() {
                if template.is_blank() {
                    return Err(MergeError::Config(
                        "source has no subject/body columns and no template was given".into(),
                    ));
                }
                self.warn("source has no subject/body columns; using the global template");
            }
        }
        self.emit(SendEvent::Loaded {
            rows: table.len(),
            resume_index: self.config.resume_index,
        });

        let (composer, asset_errors) = MessageComposer::new(
            self.settings.from.clone(),
            &self.settings.branding,
            &self.config.inline_images,
            &self.config.attachments,
        );
        for err in asset_errors {
            self.warn(&err.to_string());
        }

        let history = if self.config.flags.respect_global_history {
            self.store.load_global_history().await?
        } else {
            HashSet::new()
        };
        let mut gates = DuplicateGates::new(&self.config.flags, history);

        self.relay.connect().await?;
        self.transition(SessionState::Sending);
        info!(
            source = %source_path.display(),
            rows = table.len(),
            start = self.config.resume_index,
            "sending"
        );
        self.activity.record(&format!(
            "Sending {} from row {} ({} rows)",
            source_path.display(),
            self.config.resume_index,
            table.len()
        ));

        for index in self.config.resume_index..table.len() {
            if self.stop.is_stopped() {
                self.stopped = true;
                break;
            }
            self.save_checkpoint(&source_path, index).await;
            let Some(record) = table.record(index) else {
                break;
            };
            self.process_row(index, &record, &composer, &mut gates).await;
            self.save_checkpoint(&source_path, index + 1).await;
        }

        if !self.stopped {
            if let Err(err) = self.store.clear_checkpoint().await {
                warn!(error = %err, "failed to clear recovery checkpoint");
            }
        }

        if self.config.flags.mark_status {
            let rows = std::mem::take(&mut self.results);
            match table.write_status_export(&rows) {
                Ok(path) => {
                    info!(path = %path.display(), "status export written");
                    self.status_export = Some(path);
                }
                Err(err) => self.warn(&err.to_string()),
            }
            self.results = rows;
        }

        self.activity.record(&format!(
            "{}: {} sent, {} failed, {} skipped",
            if self.stopped { "Stopped" } else { "Completed" },
            self.counters.sent,
            self.counters.failed,
            self.counters.skipped
        ));
        self.transition(SessionState::Completed);
        Ok(())
    }

    async fn process_row(
        &mut self,
        index: usize,
        record: &Record,
        composer: &MessageComposer,
        gates: &mut DuplicateGates,
    ) {
        let candidates = resolve(record.email_cell());
        if candidates.is_empty() {
            self.record_outcome(SendOutcome::Skipped {
                row_index: index,
                recipient: None,
                reason: SkipReason::NoRecipients,
            });
            return;
        }

        let content = render_row(&self.config.template, record, index, composer.image_count());
        for candidate in candidates {
            let address = match candidate {
                Candidate::Valid(address) => address,
                Candidate::Invalid(address) => {
                    self.skip(index, address, SkipReason::InvalidAddress);
                    continue;
                }
            };
            if let Some(reason) = gates.check(&address) {
                self.skip(index, address, reason);
                continue;
            }

            let message = match composer.build(&address, &content) {
                Ok(message) => message,
                Err(MergeError::RecipientInvalid(_)) => {
                    self.skip(index, address, SkipReason::InvalidAddress);
                    continue;
                }
                Err(err) => {
                    self.fail(index, address, err);
                    continue;
                }
            };

            let deadline = self.settings.send_timeout;
            let delivery = tokio::time::timeout(deadline, self.relay.send(message)).await;
            match delivery {
                Ok(Ok(())) => {
                    gates.mark_sent(&address);
                    if let Err(err) = self.store.record_sent(&address).await {
                        warn!(error = %err, "failed to record sent address");
                    }
                    self.results.push(RowResult {
                        row_index: index,
                        name: record.name().to_string(),
                        email: address.clone(),
                    });
                    self.record_outcome(SendOutcome::Sent {
                        row_index: index,
                        recipient: address,
                    });
                }
                Ok(Err(err)) => self.fail(index, address, err),
                Err(_) => self.fail(index, address, MergeError::DeliveryTimeout(deadline)),
            }
        }
    }

    fn skip(&mut self, row_index: usize, recipient: String, reason: SkipReason) {
        self.record_outcome(SendOutcome::Skipped {
            row_index,
            recipient: Some(recipient),
            reason,
        });
    }

    fn fail(&mut self, row_index: usize, recipient: String, err: MergeError) {
        self.record_outcome(SendOutcome::Failed {
            row_index,
            recipient,
            error: err.to_string(),
        });
    }

    fn record_outcome(&mut self, outcome: SendOutcome) {
        self.counters.record(&outcome);
        let line = match &outcome {
            SendOutcome::Sent { recipient, .. } => format!("SENT -> {}", recipient),
            SendOutcome::Failed {
                recipient, error, ..
            } => format!("FAILED -> {} ({})", recipient, error),
            SendOutcome::Skipped {
                row_index,
                recipient,
                reason,
            } => format!(
                "SKIPPED -> {} ({})",
                recipient
                    .clone()
                    .unwrap_or_else(|| format!("row {}", row_index)),
                reason.as_str()
            ),
        };
        self.activity.record(&line);
        let counters = self.counters;
        self.emit(SendEvent::Outcome { outcome, counters });
    }

    async fn save_checkpoint(&mut self, source_path: &std::path::Path, next_row_index: usize) {
        self.next_row_index = next_row_index;
        let checkpoint = self
            .config
            .checkpoint(source_path.to_path_buf(), next_row_index);
        if let Err(err) = self.store.save_checkpoint(&checkpoint).await {
            warn!(error = %err, "failed to save recovery checkpoint");
        }
    }

    fn transition(&mut self, state: SessionState) {
        self.state = state;
        self.emit(SendEvent::State { state });
    }

    fn warn(&self, message: &str) {
        warn!("{}", message);
        self.emit(SendEvent::Warning {
            message: message.to_string(),
        });
    }

    /// Never waits on the receiver. Events past a full queue are dropped; the
    /// report returned by `join` carries the authoritative totals.
    fn emit(&self, event: SendEvent) {
        match self.events.try_send(event) {
            Ok(()) | Err(TrySendError::Closed(_)) => {}
            Err(TrySendError::Full(event)) => {
                debug!(?event, "event queue full, dropping event");
            }
        }
    }
}
