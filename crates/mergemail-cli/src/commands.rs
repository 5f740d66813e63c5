use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use serde_json::json;
use tracing::info;

use mergemail_content::{SourceFormat, SourceTable};
use mergemail_core::{ActivityLog, MergeStore, SendFlags, SqliteMergeStore, Template};
use mergemail_mail::{DeliverySettings, SendSession, SessionConfig, SessionState, SmtpRelay};

use crate::cli::{CliCommand, HistoryCommand, RecoveryCommand, SendCmd};
use crate::config::AppConfig;
use crate::output::{output_error, output_event, output_ok};

pub(crate) fn run_cli(
    rt: &tokio::runtime::Runtime,
    command: CliCommand,
    config: &AppConfig,
) -> Result<()> {
    rt.block_on(async {
        match command {
            CliCommand::Send(cmd) => run_send(cmd, config).await,
            CliCommand::Resume => run_resume(config).await,
            CliCommand::Recovery(cmd) => {
                let store = open_store(config).await?;
                match cmd.command {
                    RecoveryCommand::Show => {
                        let checkpoint = store.load_checkpoint().await?;
                        output_ok(json!({ "checkpoint": serde_json::to_value(&checkpoint)? }))
                    }
                    RecoveryCommand::Clear => {
                        store.clear_checkpoint().await?;
                        output_ok(json!({ "cleared": true }))
                    }
                }
            }
            CliCommand::History(cmd) => {
                let store = open_store(config).await?;
                match cmd.command {
                    HistoryCommand::List(list) => {
                        let entries = store.list_history(list.limit).await?;
                        output_ok(json!({ "count": entries.len(), "entries": entries }))
                    }
                    HistoryCommand::Clear => {
                        store.clear_all_history().await?;
                        output_ok(json!({ "cleared": true }))
                    }
                }
            }
            CliCommand::Columns(cmd) => {
                let table = SourceTable::load(&cmd.file)?;
                let roles = table.roles();
                output_ok(json!({
                    "file": table.path().display().to_string(),
                    "format": match table.format() {
                        SourceFormat::Csv => "csv",
                        SourceFormat::Workbook => "workbook",
                    },
                    "headers": table.headers(),
                    "rows": table.len(),
                    "email": roles.email,
                    "name": roles.name,
                    "subject": roles.subject,
                    "body": roles.body,
                    "status_export": table.status_export_path().display().to_string(),
                }))
            }
        }
    })
}

async fn open_store(config: &AppConfig) -> Result<Arc<SqliteMergeStore>> {
    if let Some(parent) = config.db_path.parent() {
        if !parent.as_os_str().is_empty() {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("failed to create {}", parent.display()))?;
        }
    }
    let store = SqliteMergeStore::connect(&config.db_path.to_string_lossy()).await?;
    store.init().await?;
    Ok(Arc::new(store))
}

async fn run_send(cmd: SendCmd, config: &AppConfig) -> Result<()> {
    let store = open_store(config).await?;
    if let Some(previous) = store.load_checkpoint().await? {
        output_event(&json!({
            "event": "warning",
            "message": format!(
                "unfinished run of {} stopped at row {}; this run replaces it",
                previous.source_path.display(),
                previous.next_row_index
            ),
        }))?;
    }

    let body = match (&cmd.body, &cmd.body_file) {
        (Some(body), _) => body.clone(),
        (None, Some(path)) => std::fs::read_to_string(path)
            .with_context(|| format!("failed to read body file {}", path.display()))?,
        (None, None) => String::new(),
    };
    let defaults = config.defaults;
    let session_config = SessionConfig {
        source_path: Some(cmd.file.clone()),
        template: Template {
            subject: cmd.subject.clone().unwrap_or_default(),
            body,
            use_row_content: cmd.per_row || defaults.use_row_content,
        },
        inline_images: cmd.images.clone(),
        attachments: cmd.attachments.clone(),
        flags: SendFlags {
            skip_duplicates_in_file: cmd.skip_duplicates(defaults.flags.skip_duplicates_in_file),
            respect_global_history: cmd.global_history || defaults.flags.respect_global_history,
            mark_status: cmd.mark_status || defaults.flags.mark_status,
        },
        resume_index: 0,
    };
    run_session(session_config, config, store).await
}

async fn run_resume(config: &AppConfig) -> Result<()> {
    let store = open_store(config).await?;
    let Some(checkpoint) = store.load_checkpoint().await? else {
        return output_error("no unfinished run to resume");
    };
    if !checkpoint.source_path.exists() {
        return output_error(&format!(
            "source file {} no longer exists",
            checkpoint.source_path.display()
        ));
    }
    info!(
        source = %checkpoint.source_path.display(),
        row = checkpoint.next_row_index,
        "resuming"
    );
    run_session(SessionConfig::resume(checkpoint), config, store).await
}

async fn run_session(
    session_config: SessionConfig,
    config: &AppConfig,
    store: Arc<SqliteMergeStore>,
) -> Result<()> {
    session_config.validate()?;
    let settings = DeliverySettings {
        from: config.relay.from_mailbox()?,
        send_timeout: Duration::from_secs(config.relay.timeout_secs),
        branding: config.branding.clone(),
    };
    let relay = Arc::new(SmtpRelay::new(&config.relay)?);
    let activity = Arc::new(ActivityLog::open(&config.activity_log));

    let (handle, mut events) =
        SendSession::new(session_config, settings, store, relay, activity).start()?;
    let stop = handle.stop_signal();
    let ctrl_c = tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            info!("stop requested, finishing the current row");
            stop.stop();
        }
    });

    while let Some(event) = events.recv().await {
        output_event(&event)?;
    }
    let report = handle.join().await;
    ctrl_c.abort();

    if report.state == SessionState::Aborted {
        return output_error(report.error.as_deref().unwrap_or("send session aborted"));
    }
    output_ok(serde_json::to_value(&report)?)
}
