use std::path::PathBuf;

use clap::{Args, Parser, Subcommand};

#[derive(Parser, Debug)]
#[command(name = "mergemail", version, about = "Personalised bulk mail from a spreadsheet")]
pub(crate) struct Cli {
    /// Config file to use instead of the default lookup.
    #[arg(short = 'c', long = "config", global = true)]
    pub(crate) config: Option<PathBuf>,
    #[command(subcommand)]
    pub(crate) command: CliCommand,
}

#[derive(Subcommand, Debug)]
pub(crate) enum CliCommand {
    /// Start a fresh run over a recipient file.
    Send(SendCmd),
    /// Continue the run recorded in the recovery checkpoint.
    Resume,
    Recovery(RecoveryCmd),
    History(HistoryCmd),
    /// Show how the columns of a recipient file are interpreted.
    Columns(ColumnsCmd),
}

#[derive(Args, Debug)]
pub(crate) struct SendCmd {
    #[arg(long)]
    pub(crate) file: PathBuf,
    #[arg(long)]
    pub(crate) subject: Option<String>,
    #[arg(long, conflicts_with = "body_file")]
    pub(crate) body: Option<String>,
    #[arg(long)]
    pub(crate) body_file: Option<PathBuf>,
    /// Inline image, referenced from the body as {Image1}, {Image2}, ...
    #[arg(long = "image")]
    pub(crate) images: Vec<PathBuf>,
    #[arg(long = "attach")]
    pub(crate) attachments: Vec<PathBuf>,
    #[arg(long, overrides_with = "no_skip_duplicates")]
    pub(crate) skip_duplicates: bool,
    #[arg(long, overrides_with = "skip_duplicates")]
    pub(crate) no_skip_duplicates: bool,
    /// Skip addresses already present in the sent history.
    #[arg(long)]
    pub(crate) global_history: bool,
    /// Write a copy of the source with a status column once the run ends.
    #[arg(long)]
    pub(crate) mark_status: bool,
    /// Prefer subject/body columns of each row over the global template.
    #[arg(long)]
    pub(crate) per_row: bool,
}

impl SendCmd {
    pub(crate) fn skip_duplicates(&self, default: bool) -> bool {
        if self.no_skip_duplicates {
            false
        } else if self.skip_duplicates {
            true
        } else {
            default
        }
    }
}

#[derive(Args, Debug)]
pub(crate) struct RecoveryCmd {
    #[command(subcommand)]
    pub(crate) command: RecoveryCommand,
}

#[derive(Subcommand, Debug)]
pub(crate) enum RecoveryCommand {
    Show,
    Clear,
}

#[derive(Args, Debug)]
pub(crate) struct HistoryCmd {
    #[command(subcommand)]
    pub(crate) command: HistoryCommand,
}

#[derive(Subcommand, Debug)]
pub(crate) enum HistoryCommand {
    List(HistoryList),
    Clear,
}

#[derive(Args, Debug)]
pub(crate) struct HistoryList {
    #[arg(long)]
    pub(crate) limit: Option<usize>,
}

#[derive(Args, Debug)]
pub(crate) struct ColumnsCmd {
    #[arg(long)]
    pub(crate) file: PathBuf,
}
