use std::sync::OnceLock;

use regex::{Captures, Regex};

use crate::source::Record;

const NAME_KEYS: &[&str] = &["name", "names"];
const EMAIL_KEYS: &[&str] = &["email", "mail"];

fn placeholder_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"\{([^}]+)\}").expect("placeholder pattern"))
}

/// Replaces `{key}` tokens with values from `record`. Keys are matched
/// case-insensitively; `{name}`/`{email}` fall back to the columns resolved
/// for those roles. Tokens that resolve to nothing stay as written.
pub fn fill(template: &str, record: &Record) -> String {
    if template.is_empty() {
        return String::new();
    }
    placeholder_re()
        .replace_all(template, |caps: &Captures| {
            let key = caps[1].trim().to_lowercase();
            match resolve(&key, record) {
                Some(value) => value.to_string(),
                None => caps[0].to_string(),
            }
        })
        .into_owned()
}

fn resolve<'a>(key: &str, record: &'a Record) -> Option<&'a str> {
    if let Some(value) = record.get(key) {
        return Some(value);
    }
    if NAME_KEYS.contains(&key) {
        return record.name_field();
    }
    if EMAIL_KEYS.contains(&key) {
        return Some(record.email_cell());
    }
    None
}
