//! `fencepost errno`: error code lookup.

use std::fmt::Write as _;

use fencepost_core::{ErrorCode, strerror};
use serde::Serialize;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct CodeRow {
    pub code: u32,
    pub kind: ErrorCode,
    pub message: &'static str,
}

/// Message line for one raw code, known or not.
#[must_use]
pub fn describe(code: u32) -> String {
    format!("errno value '{code}' = '{}'", strerror(code))
}

#[must_use]
pub fn rows() -> Vec<CodeRow> {
    ErrorCode::ALL
        .iter()
        .map(|kind| CodeRow {
            code: kind.code(),
            kind: *kind,
            message: kind.message(),
        })
        .collect()
}

/// Aligned table of every code.
#[must_use]
pub fn table() -> String {
    let mut out = String::new();
    for row in rows() {
        let _ = writeln!(out, "{:>4}  {}", row.code, row.message);
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn known_and_unknown_codes() {
        assert_eq!(describe(30), "errno value '30' = 'failed under fence-post check'");
        assert_eq!(describe(7), "errno value '7' = 'errno value is not valid'");
    }

    #[test]
    fn table_lists_every_code_once() {
        let text = table();
        assert_eq!(text.lines().count(), ErrorCode::ALL.len());
        assert!(text.contains("  20  pointer not found"));
        let json = serde_json::to_string(&rows()[5]).unwrap();
        assert_eq!(
            json,
            r#"{"code":20,"kind":"not-found","message":"pointer not found"}"#
        );
    }
}
