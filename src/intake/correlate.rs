//! Session / conversation identifier resolution.
//!
//! Caller-supplied identifiers are reused verbatim.  They only key logs and
//! stored rows and are never used for authorization, so nothing beyond
//! non-emptiness is checked; whitespace counts as a value.

use uuid::Uuid;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Correlation {
    pub session_id: String,
    pub conversation_id: String,
}

#[derive(Debug, Clone, Copy, Default)]
pub struct Correlator;

impl Correlator {
    pub fn resolve(
        &self,
        header_session_id: Option<&str>,
        body_conversation_id: Option<&str>,
    ) -> Correlation {
        Correlation {
            session_id: reuse_or_mint(header_session_id),
            conversation_id: reuse_or_mint(body_conversation_id),
        }
    }
}

fn reuse_or_mint(supplied: Option<&str>) -> String {
    match supplied.filter(|s| !s.is_empty()) {
        Some(id) => id.to_owned(),
        None => Uuid::new_v4().to_string(),
    }
}
