//! Negotiation payload filtering and dial-string validation

use once_cell::sync::Lazy;
use regex::Regex;

use crate::error::{RealtimeError, RealtimeResult};

/// Candidate lines removed from locally generated descriptions
static CANDIDATE_LINE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"^a=candidate:\d+ \d+ \w+ \d+ [0-9a-fA-F:]+ .*").expect("valid candidate pattern")
});

const LINE_BREAK: &str = "\r\n";

/// Strip matching ICE candidate lines from a session description
///
/// Pure; lines are split on CRLF and rejoined with CRLF.
pub fn filter_negotiation_payload(raw: &str) -> String {
    raw.split(LINE_BREAK)
        .filter(|line| !CANDIDATE_LINE.is_match(line))
        .collect::<Vec<_>>()
        .join(LINE_BREAK)
}

/// Check that `number` is all digits with a length in `min..=max`
pub fn validate_number(number: &str, min: usize, max: usize) -> RealtimeResult<()> {
    let digits = number.len();
    if digits < min || digits > max || !number.bytes().all(|b| b.is_ascii_digit()) {
        return Err(RealtimeError::invalid_number(number));
    }
    Ok(())
}
