//! Row sources, placeholder filling, recipient parsing and body rendering.

use mergemail_core::Template;

pub mod html;
pub mod placeholder;
pub mod recipients;
pub mod source;

pub use html::{Branding, InlineRef, LOGO_CID, RenderedBody, render_body, wrap_document};
pub use placeholder::fill;
pub use recipients::{Candidate, DuplicateGates, is_valid_address, resolve, split};
pub use source::{ColumnRoles, Record, SourceFormat, SourceTable};

#[derive(Debug, Clone)]
pub struct RowContent {
    pub subject: String,
    pub body: RenderedBody,
}

/// Picks the row's own subject/body when per-row content is on and the cell
/// is non-empty, otherwise the global template, then fills and renders it.
pub fn render_row(
    template: &Template,
    record: &Record,
    row_index: usize,
    image_count: usize,
) -> RowContent {
    let pick = |row_value: Option<&str>, global: &str| -> String {
        if template.use_row_content {
            if let Some(value) = row_value.filter(|v| !v.trim().is_empty()) {
                return value.trim().to_string();
            }
        }
        global.to_string()
    };
    let subject = pick(record.subject(), &template.subject);
    let body = pick(record.body(), &template.body);

    let subject = fill(&subject, record).replace(['\r', '\n'], " ");
    let body = fill(&body, record);
    RowContent {
        subject,
        body: render_body(&body, row_index, image_count),
    }
}
