use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use calamine::{Data, Reader, open_workbook_auto};
use rust_xlsxwriter::Workbook;
use tracing::debug;

use mergemail_core::{MergeError, Result, RowResult};

pub const NAME_ALIASES: &[&str] = &["name", "names", "full name", "customer name", "student name"];
pub const EMAIL_ALIASES: &[&str] = &[
    "email", "emails", "e-mail", "mail", "mail id", "email id", "gmail",
];
pub const SUBJECT_ALIASES: &[&str] = &["subject", "heading", "title"];
pub const BODY_ALIASES: &[&str] = &["body", "message", "content", "description"];

pub const STATUS_COLUMN: &str = "Mailer_Status";
const STATUS_SENT: &str = "sent";

pub fn normalize_header(raw: &str) -> String {
    raw.trim().to_lowercase()
}

/// First header (in column order) whose normalized form is in `aliases`.
pub fn find_column(headers: &[String], aliases: &[&str]) -> Option<usize> {
    headers
        .iter()
        .position(|h| aliases.contains(&normalize_header(h).as_str()))
}

/// Normalized keys of the columns playing each role.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ColumnRoles {
    pub email: String,
    pub name: Option<String>,
    pub subject: Option<String>,
    pub body: Option<String>,
}

impl ColumnRoles {
    pub fn resolve(headers: &[String]) -> Option<Self> {
        let key = |idx: usize| normalize_header(&headers[idx]);
        let email = find_column(headers, EMAIL_ALIASES).map(key)?;
        Some(Self {
            email,
            name: find_column(headers, NAME_ALIASES).map(key),
            subject: find_column(headers, SUBJECT_ALIASES).map(key),
            body: find_column(headers, BODY_ALIASES).map(key),
        })
    }
}

/// One row, keyed by normalized column name. Missing cells are "".
#[derive(Debug, Clone)]
pub struct Record {
    fields: HashMap<String, String>,
    roles: Arc<ColumnRoles>,
}

impl Record {
    pub fn new(headers: &[String], values: &[String], roles: Arc<ColumnRoles>) -> Self {
        let mut fields = HashMap::with_capacity(headers.len());
        for (idx, header) in headers.iter().enumerate() {
            let value = values.get(idx).cloned().unwrap_or_default();
            fields.entry(normalize_header(header)).or_insert(value);
        }
        Self { fields, roles }
    }

    pub fn get(&self, key: &str) -> Option<&str> {
        self.fields.get(&normalize_header(key)).map(String::as_str)
    }

    pub fn email_cell(&self) -> &str {
        self.get(&self.roles.email).unwrap_or("")
    }

    pub fn name_field(&self) -> Option<&str> {
        self.roles.name.as_deref().and_then(|k| self.get(k))
    }

    pub fn name(&self) -> &str {
        self.name_field().map(str::trim).unwrap_or("")
    }

    pub fn subject(&self) -> Option<&str> {
        self.roles.subject.as_deref().and_then(|k| self.get(k))
    }

    pub fn body(&self) -> Option<&str> {
        self.roles.body.as_deref().and_then(|k| self.get(k))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SourceFormat {
    Csv,
    Workbook,
}

impl SourceFormat {
    pub fn from_path(path: &Path) -> Result<Self> {
        let ext = path
            .extension()
            .and_then(|e| e.to_str())
            .map(|e| e.to_ascii_lowercase())
            .unwrap_or_default();
        match ext.as_str() {
            "csv" => Ok(SourceFormat::Csv),
            "xlsx" | "xlsm" | "xls" | "xlsb" | "ods" => Ok(SourceFormat::Workbook),
            other => Err(MergeError::source_read(
                path,
                format!("unsupported file extension {:?}", other),
            )),
        }
    }

    fn status_extension(&self) -> &'static str {
        match self {
            SourceFormat::Csv => "csv",
            SourceFormat::Workbook => "xlsx",
        }
    }
}

#[derive(Debug, Clone)]
pub struct SourceTable {
    path: PathBuf,
    format: SourceFormat,
    headers: Vec<String>,
    rows: Vec<Vec<String>>,
    roles: Arc<ColumnRoles>,
}

impl SourceTable {
    pub fn load(path: &Path) -> Result<Self> {
        let format = SourceFormat::from_path(path)?;
        let (headers, rows) = match format {
            SourceFormat::Csv => read_csv(path)?,
            SourceFormat::Workbook => read_workbook(path)?,
        };
        debug!(path = %path.display(), rows = rows.len(), "source loaded");
        Self::from_rows(path, format, headers, rows)
    }

    pub fn from_rows(
        path: &Path,
        format: SourceFormat,
        headers: Vec<String>,
        rows: Vec<Vec<String>>,
    ) -> Result<Self> {
        let roles = ColumnRoles::resolve(&headers)
            .ok_or_else(|| MergeError::MissingColumn(path.to_path_buf()))?;
        Ok(Self {
            path: path.to_path_buf(),
            format,
            headers,
            rows,
            roles: Arc::new(roles),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn format(&self) -> SourceFormat {
        self.format
    }

    pub fn headers(&self) -> &[String] {
        &self.headers
    }

    pub fn roles(&self) -> &ColumnRoles {
        &self.roles
    }

    pub fn len(&self) -> usize {
        self.rows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }

    pub fn record(&self, index: usize) -> Option<Record> {
        self.rows
            .get(index)
            .map(|values| Record::new(&self.headers, values, self.roles.clone()))
    }

    pub fn status_export_path(&self) -> PathBuf {
        let stem = self
            .path
            .file_stem()
            .map(|s| s.to_string_lossy().to_string())
            .unwrap_or_else(|| "source".to_string());
        self.path.with_file_name(format!(
            "{}_status.{}",
            stem,
            self.format.status_extension()
        ))
    }

    /// Writes the table plus a status column next to the source file. The
    /// source itself is never touched.
    pub fn write_status_export(&self, results: &[RowResult]) -> Result<PathBuf> {
        let sent_rows: HashSet<usize> = results.iter().map(|r| r.row_index).collect();
        let mut header = self.headers.clone();
        header.push(STATUS_COLUMN.to_string());
        let mut table = Vec::with_capacity(self.rows.len() + 1);
        table.push(header);
        for (idx, row) in self.rows.iter().enumerate() {
            let mut out = row.clone();
            out.resize(self.headers.len(), String::new());
            let status = if sent_rows.contains(&idx) {
                STATUS_SENT
            } else {
                ""
            };
            out.push(status.to_string());
            table.push(out);
        }

        let out_path = self.status_export_path();
        match self.format {
            SourceFormat::Csv => write_csv(&out_path, &table)?,
            SourceFormat::Workbook => write_workbook(&out_path, &table)?,
        }
        Ok(out_path)
    }
}

fn read_csv(path: &Path) -> Result<(Vec<String>, Vec<Vec<String>>)> {
    let mut reader = csv::ReaderBuilder::new()
        .has_headers(true)
        .flexible(true)
        .from_path(path)
        .map_err(|e| MergeError::source_read(path, e))?;
    let headers = reader
        .headers()
        .map_err(|e| MergeError::source_read(path, e))?
        .iter()
        .map(|h| h.to_string())
        .collect::<Vec<_>>();
    let mut rows = Vec::new();
    for (idx, result) in reader.records().enumerate() {
        let record =
            result.map_err(|e| MergeError::source_read(path, format!("row {}: {}", idx + 1, e)))?;
        rows.push(record.iter().map(|v| v.to_string()).collect());
    }
    Ok((headers, rows))
}

fn read_workbook(path: &Path) -> Result<(Vec<String>, Vec<Vec<String>>)> {
    let mut workbook = open_workbook_auto(path).map_err(|e| MergeError::source_read(path, e))?;
    let range = workbook
        .worksheet_range_at(0)
        .ok_or_else(|| MergeError::source_read(path, "workbook has no sheets"))?
        .map_err(|e| MergeError::source_read(path, e))?;
    let mut rows = range.rows();
    let headers = rows
        .next()
        .map(|row| row.iter().map(cell_to_string).collect())
        .unwrap_or_default();
    let rows = rows
        .map(|row| row.iter().map(cell_to_string).collect())
        .collect();
    Ok((headers, rows))
}

fn cell_to_string(cell: &Data) -> String {
    match cell {
        Data::Empty | Data::Error(_) => String::new(),
        Data::String(s) => s.clone(),
        Data::Int(v) => v.to_string(),
        Data::Float(v) if v.is_nan() => String::new(),
        Data::Float(v) if v.fract() == 0.0 && v.abs() < 1e15 => format!("{}", *v as i64),
        Data::Float(v) => v.to_string(),
        Data::Bool(v) => v.to_string(),
        other => other.to_string(),
    }
}

fn write_csv(path: &Path, table: &[Vec<String>]) -> Result<()> {
    let mut writer = csv::Writer::from_path(path).map_err(|e| MergeError::Export(e.to_string()))?;
    for row in table {
        writer
            .write_record(row)
            .map_err(|e| MergeError::Export(e.to_string()))?;
    }
    writer.flush().map_err(|e| MergeError::Export(e.to_string()))?;
    Ok(())
}

fn write_workbook(path: &Path, table: &[Vec<String>]) -> Result<()> {
    let mut workbook = Workbook::new();
    let sheet = workbook.add_worksheet();
    for (r, row) in table.iter().enumerate() {
        for (c, value) in row.iter().enumerate() {
            if value.is_empty() {
                continue;
            }
            sheet
                .write_string(r as u32, c as u16, value.as_str())
                .map_err(|e| MergeError::Export(e.to_string()))?;
        }
    }
    workbook
        .save(path)
        .map_err(|e| MergeError::Export(e.to_string()))?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use std::path::{Path, PathBuf};
    use std::time::{SystemTime, UNIX_EPOCH};

    use mergemail_core::{MergeError, RowResult};
    use rust_xlsxwriter::Workbook;

    use super::{ColumnRoles, SourceFormat, SourceTable, find_column};

    fn temp_path(name: &str) -> PathBuf {
        let ts = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_nanos())
            .unwrap_or(0);
        let dir = std::env::temp_dir().join(format!(
            "mergemail-content-{}-{}",
            std::process::id(),
            ts
        ));
        std::fs::create_dir_all(&dir).unwrap();
        dir.join(name)
    }

    fn temp_file(name: &str, content: &str) -> PathBuf {
        let path = temp_path(name);
        std::fs::write(&path, content).unwrap();
        path
    }

    fn headers(list: &[&str]) -> Vec<String> {
        list.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn column_match_ignores_case_whitespace_and_position() {
        let hs = headers(&["Id", "  Full Name ", " E-Mail", "Notes"]);
        assert_eq!(find_column(&hs, super::EMAIL_ALIASES), Some(2));
        assert_eq!(find_column(&hs, super::NAME_ALIASES), Some(1));
        assert_eq!(find_column(&hs, super::BODY_ALIASES), None);
    }

    #[test]
    fn first_qualifying_column_wins() {
        let hs = headers(&["Gmail", "Email"]);
        let roles = ColumnRoles::resolve(&hs).unwrap();
        assert_eq!(roles.email, "gmail");
    }

    #[test]
    fn missing_email_column_is_reported() {
        let err = SourceTable::from_rows(
            Path::new("people.csv"),
            SourceFormat::Csv,
            headers(&["Name", "Phone"]),
            Vec::new(),
        )
        .unwrap_err();
        assert!(matches!(err, MergeError::MissingColumn(_)));
    }

    #[test]
    fn csv_loads_records_with_roles() {
        let path = temp_file(
            "people.csv",
            "Name,EMAIL ,Title,Message\nAnn,ann@x.com,Hi,Body A\nBob,\"bob@x.com, bob2@x.com\",,\n",
        );
        let table = SourceTable::load(&path).unwrap();
        assert_eq!(table.len(), 2);
        assert_eq!(table.roles().email, "email");
        assert_eq!(table.roles().subject.as_deref(), Some("title"));
        assert_eq!(table.roles().body.as_deref(), Some("message"));

        let bob = table.record(1).unwrap();
        assert_eq!(bob.name(), "Bob");
        assert_eq!(bob.email_cell(), "bob@x.com, bob2@x.com");
        assert_eq!(bob.subject(), Some(""));
        assert_eq!(bob.get("NAME"), Some("Bob"));
        assert!(table.record(2).is_none());
    }

    #[test]
    fn short_csv_rows_read_as_empty_cells() {
        let path = temp_file("short.csv", "email,name\nann@x.com\n");
        let table = SourceTable::load(&path).unwrap();
        let ann = table.record(0).unwrap();
        assert_eq!(ann.name(), "");
        assert_eq!(ann.email_cell(), "ann@x.com");
    }

    #[test]
    fn unsupported_or_broken_files_are_read_errors() {
        let err = SourceTable::load(Path::new("people.txt")).unwrap_err();
        assert!(matches!(err, MergeError::SourceRead { .. }));

        let broken = temp_file("broken.xlsx", "this is not a zip archive");
        let err = SourceTable::load(&broken).unwrap_err();
        assert!(matches!(err, MergeError::SourceRead { .. }));

        let err = SourceTable::load(Path::new("/nonexistent/mergemail/people.csv")).unwrap_err();
        assert!(matches!(err, MergeError::SourceRead { .. }));
    }

    #[test]
    fn status_export_marks_sent_rows_next_to_source() {
        let path = temp_file("list.csv", "name,email\nAnn,ann@x.com\nBob,bob@x.com\n");
        let table = SourceTable::load(&path).unwrap();
        let out = table
            .write_status_export(&[RowResult {
                row_index: 1,
                name: "Bob".into(),
                email: "bob@x.com".into(),
            }])
            .unwrap();
        assert_eq!(out, path.with_file_name("list_status.csv"));

        let written = std::fs::read_to_string(&out).unwrap();
        let lines: Vec<&str> = written.lines().collect();
        assert_eq!(lines[0], "name,email,Mailer_Status");
        assert_eq!(lines[1], "Ann,ann@x.com,");
        assert_eq!(lines[2], "Bob,bob@x.com,sent");

        let original = std::fs::read_to_string(&path).unwrap();
        assert!(!original.contains("Mailer_Status"));
    }

    #[test]
    fn workbook_sources_export_xlsx() {
        let table = SourceTable::from_rows(
            Path::new("/data/list.xlsx"),
            SourceFormat::Workbook,
            headers(&["email"]),
            vec![vec!["a@x.com".into()]],
        )
        .unwrap();
        assert_eq!(
            table.status_export_path(),
            PathBuf::from("/data/list_status.xlsx")
        );
    }

    #[test]
    fn workbook_cells_load_and_status_export_reloads() {
        let path = temp_path("guests.xlsx");
        let mut workbook = Workbook::new();
        let sheet = workbook.add_worksheet();
        sheet.write_string(0, 0, "Name").unwrap();
        sheet.write_string(0, 1, " E-Mail ").unwrap();
        sheet.write_string(0, 2, "Phone").unwrap();
        sheet.write_string(1, 0, "Ann").unwrap();
        sheet.write_string(1, 1, "ann@x.com").unwrap();
        sheet.write_number(1, 2, 5551234.0).unwrap();
        sheet.write_string(2, 0, "Bob").unwrap();
        sheet.write_string(2, 1, "bob@x.com").unwrap();
        workbook.save(&path).unwrap();

        let table = SourceTable::load(&path).unwrap();
        assert_eq!(table.format(), SourceFormat::Workbook);
        assert_eq!(table.roles().email, "e-mail");
        assert_eq!(table.len(), 2);
        let ann = table.record(0).unwrap();
        assert_eq!(ann.email_cell(), "ann@x.com");
        assert_eq!(ann.get("phone"), Some("5551234"));
        let bob = table.record(1).unwrap();
        assert_eq!(bob.name(), "Bob");
        assert_eq!(bob.get("phone"), Some(""));

        let out = table
            .write_status_export(&[RowResult {
                row_index: 0,
                name: "Ann".into(),
                email: "ann@x.com".into(),
            }])
            .unwrap();
        assert_eq!(out, path.with_file_name("guests_status.xlsx"));

        let exported = SourceTable::load(&out).unwrap();
        assert_eq!(exported.len(), 2);
        let ann = exported.record(0).unwrap();
        assert_eq!(ann.get("mailer_status"), Some("sent"));
        assert_eq!(ann.get("phone"), Some("5551234"));
        assert_eq!(exported.record(1).unwrap().get("mailer_status"), Some(""));
    }
}
