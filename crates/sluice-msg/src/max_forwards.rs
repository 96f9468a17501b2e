// sluice-rs - The Sluice SIP Proxy Engine
// Copyright (C) 2025 James Ferris <ferrous.communications@gmail.com>
// SPDX-License-Identifier: Apache-2.0 OR MIT

use crate::Headers;

const DEFAULT_MAX_FORWARDS: u32 = 70;

/// Errors returned when attempting to adjust Max-Forwards.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MaxForwardsError {
    /// Max-Forwards has reached zero and cannot be decremented further
    Exhausted,
    /// Max-Forwards value is not a valid number
    Invalid,
}

impl std::fmt::Display for MaxForwardsError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Exhausted => write!(f, "Max-Forwards exhausted (reached 0)"),
            Self::Invalid => write!(f, "Invalid Max-Forwards value"),
        }
    }
}

impl std::error::Error for MaxForwardsError {}

/// Decrements Max-Forwards per RFC 3261 §16.6 step 3.
///
/// If no Max-Forwards header is present, one is inserted with the default
/// value of 70 and then decremented. A zero value means the request must not
/// be forwarded (respond 483 Too Many Hops).
pub fn decrement_max_forwards(headers: &mut Headers) -> Result<u32, MaxForwardsError> {
    let current = match headers.get("Max-Forwards") {
        Some(value) => value
            .trim()
            .parse::<u32>()
            .map_err(|_| MaxForwardsError::Invalid)?,
        None => DEFAULT_MAX_FORWARDS,
    };

    if current == 0 {
        return Err(MaxForwardsError::Exhausted);
    }

    let remaining = current - 1;
    headers.set_or_push("Max-Forwards", remaining.to_string());
    Ok(remaining)
}
