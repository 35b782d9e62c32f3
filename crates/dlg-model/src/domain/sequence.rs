use std::{fmt, str::FromStr};

use serde::{Deserialize, Serialize};

use crate::ModelError;

const TOKEN_MARKER: &str = "[TOKEN]";
const SEQ_MARKER: &str = "[SEQ]";

/// Identity that lets a restarted delegate re-register as the same record.
///
/// Persisted as `[TOKEN]<token>[SEQ]<sequence>`; the sequence is empty until
/// the manager hands one out.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SequenceToken {
    pub token: String,
    pub sequence: Option<String>,
}

impl SequenceToken {
    pub fn new(token: impl Into<String>, sequence: Option<String>) -> Self {
        Self {
            token: token.into(),
            sequence: sequence.filter(|s| is_present(s)),
        }
    }

    /// Build from values the manager sent; `None` if either is missing.
    pub fn from_parts(token: Option<&str>, sequence: Option<&str>) -> Option<Self> {
        match (token, sequence) {
            (Some(t), Some(s)) if is_present(t) && is_present(s) => {
                Some(Self::new(t, Some(s.to_string())))
            }
            _ => None,
        }
    }
}

/// Blank strings and the literal `null` count as absent.
fn is_present(value: &str) -> bool {
    let v = value.trim();
    !v.is_empty() && !v.eq_ignore_ascii_case("null")
}

impl fmt::Display for SequenceToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{TOKEN_MARKER}{}{SEQ_MARKER}{}",
            self.token,
            self.sequence.as_deref().unwrap_or("")
        )
    }
}

impl FromStr for SequenceToken {
    type Err = ModelError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let body = s
            .trim()
            .strip_prefix(TOKEN_MARKER)
            .ok_or(ModelError::MissingMarker(TOKEN_MARKER))?;
        let (token, seq) = body
            .rsplit_once(SEQ_MARKER)
            .ok_or(ModelError::MissingMarker(SEQ_MARKER))?;
        if !is_present(token) {
            return Err(ModelError::BlankToken);
        }
        Ok(Self::new(token.trim(), Some(seq.trim().to_string())))
    }
}
