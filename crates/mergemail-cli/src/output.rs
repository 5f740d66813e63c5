use anyhow::Result;
use serde::Serialize;
use serde_json::{Value as JsonValue, json};

pub(crate) const CLI_SCHEMA_VERSION: &str = "mergemail.cli.v1";

pub(crate) fn output_ok(value: JsonValue) -> Result<()> {
    println!(
        "{}",
        serde_json::to_string(&json!({
            "schema": CLI_SCHEMA_VERSION,
            "ok": true,
            "result": value
        }))?
    );
    Ok(())
}

pub(crate) fn output_error(message: &str) -> Result<()> {
    println!(
        "{}",
        serde_json::to_string(&json!({
            "schema": CLI_SCHEMA_VERSION,
            "ok": false,
            "error": message
        }))?
    );
    Ok(())
}

/// One progress line per event, ahead of the final envelope.
pub(crate) fn output_event<T: Serialize>(event: &T) -> Result<()> {
    println!("{}", serde_json::to_string(event)?);
    Ok(())
}
