use std::collections::HashSet;
use std::sync::OnceLock;

use regex::Regex;

use mergemail_core::{SendFlags, SkipReason, normalize_address};

fn separator_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"[,;\s]+").expect("separator pattern"))
}

fn email_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"^[^@]+@[^@]+\.[^@]+$").expect("email pattern"))
}

/// Splits a cell on runs of commas, semicolons and whitespace, keeping order.
pub fn split(raw: &str) -> Vec<String> {
    separator_re()
        .split(raw.trim())
        .map(str::trim)
        .filter(|part| !part.is_empty())
        .map(str::to_string)
        .collect()
}

pub fn is_valid_address(address: &str) -> bool {
    email_re().is_match(address)
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Candidate {
    Valid(String),
    Invalid(String),
}

/// Splits and normalizes a cell. Duplicate gating happens later, at send time.
pub fn resolve(raw: &str) -> Vec<Candidate> {
    split(raw)
        .into_iter()
        .map(|part| {
            let address = normalize_address(&part);
            if is_valid_address(&address) {
                Candidate::Valid(address)
            } else {
                Candidate::Invalid(address)
            }
        })
        .collect()
}

/// The two independent duplicate policies: addresses already delivered in
/// this run, and addresses present in the persisted history.
#[derive(Debug, Clone, Default)]
pub struct DuplicateGates {
    in_file: bool,
    global: bool,
    seen_in_run: HashSet<String>,
    history: HashSet<String>,
}

impl DuplicateGates {
    pub fn new(flags: &SendFlags, history: HashSet<String>) -> Self {
        Self {
            in_file: flags.skip_duplicates_in_file,
            global: flags.respect_global_history,
            seen_in_run: HashSet::new(),
            history,
        }
    }

    pub fn check(&self, address: &str) -> Option<SkipReason> {
        if self.in_file && self.seen_in_run.contains(address) {
            return Some(SkipReason::DuplicateInFile);
        }
        if self.global && self.history.contains(address) {
            return Some(SkipReason::AlreadySent);
        }
        None
    }

    pub fn mark_sent(&mut self, address: &str) {
        self.seen_in_run.insert(address.to_string());
        self.history.insert(address.to_string());
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashSet;

    use mergemail_core::{SendFlags, SkipReason};

    use super::{Candidate, DuplicateGates, is_valid_address, resolve, split};

    #[test]
    fn split_keeps_order_and_drops_separators() {
        assert_eq!(
            split("a@x.com, b@y.com;  c@z.com"),
            vec!["a@x.com", "b@y.com", "c@z.com"]
        );
        assert_eq!(split(" ;, \n a@x.com\tb@y.com,,"), vec!["a@x.com", "b@y.com"]);
        assert!(split("   ").is_empty());
        assert!(split("").is_empty());
    }

    #[test]
    fn address_shape_is_permissive() {
        assert!(is_valid_address("ann@x.com"));
        assert!(is_valid_address("first.last+tag@mail.example.co.uk"));
        assert!(!is_valid_address("ann@localhost"));
        assert!(!is_valid_address("ann.x.com"));
        assert!(!is_valid_address("a@b@c.com"));
    }

    #[test]
    fn resolve_normalizes_and_classifies() {
        assert_eq!(
            resolve("Ann@X.com; not-an-address"),
            vec![
                Candidate::Valid("ann@x.com".into()),
                Candidate::Invalid("not-an-address".into()),
            ]
        );
    }

    #[test]
    fn in_file_gate_only_blocks_repeats_within_run() {
        let flags = SendFlags {
            skip_duplicates_in_file: true,
            respect_global_history: false,
            mark_status: false,
        };
        let mut gates = DuplicateGates::new(&flags, HashSet::from(["old@x.com".to_string()]));
        assert_eq!(gates.check("old@x.com"), None);
        assert_eq!(gates.check("ann@x.com"), None);
        gates.mark_sent("ann@x.com");
        assert_eq!(gates.check("ann@x.com"), Some(SkipReason::DuplicateInFile));

        let fresh = DuplicateGates::new(&flags, HashSet::new());
        assert_eq!(fresh.check("ann@x.com"), None);
    }

    #[test]
    fn global_gate_blocks_history_on_first_occurrence() {
        let flags = SendFlags {
            skip_duplicates_in_file: false,
            respect_global_history: true,
            mark_status: false,
        };
        let gates = DuplicateGates::new(&flags, HashSet::from(["bob@x.com".to_string()]));
        assert_eq!(gates.check("bob@x.com"), Some(SkipReason::AlreadySent));
        assert_eq!(gates.check("ann@x.com"), None);
    }

    #[test]
    fn disabled_gates_allow_resending() {
        let flags = SendFlags {
            skip_duplicates_in_file: false,
            respect_global_history: false,
            mark_status: false,
        };
        let mut gates = DuplicateGates::new(&flags, HashSet::from(["bob@x.com".to_string()]));
        gates.mark_sent("ann@x.com");
        assert_eq!(gates.check("ann@x.com"), None);
        assert_eq!(gates.check("bob@x.com"), None);
    }
}
