//! Scrape pipeline error taxonomy.
//!
//! Store, config, and collaborator plumbing return `anyhow::Result`. A scrape
//! cycle classifies what went wrong with [`ScrapeError`] so callers can count
//! errors and decide whether a cycle processed anything at all.

use std::time::Duration;

use hack_timeline_core::models::RecordKind;

#[derive(Debug, thiserror::Error)]
pub enum ScrapeError {
    /// A channel fetch failed; the whole cycle is abandoned.
    #[error("fetch from channel '{channel}' failed: {source:#}")]
    Fetch {
        channel: String,
        #[source]
        source: anyhow::Error,
    },

    /// Extraction failed for one post; it stays in the retry queue.
    #[error("extraction of {channel}#{message_id} failed: {source:#}")]
    Extraction {
        channel: String,
        message_id: i64,
        #[source]
        source: anyhow::Error,
    },

    /// Storing the extracted record failed; it stays in the retry queue.
    #[error("storing {channel}#{message_id} failed: {source:#}")]
    Store {
        channel: String,
        message_id: i64,
        #[source]
        source: anyhow::Error,
    },

    /// The cycle did not finish within its deadline.
    #[error("{kind} scrape cycle timed out after {after:?}")]
    Timeout { kind: RecordKind, after: Duration },
}

impl ScrapeError {
    /// Message id of the post this error belongs to, if any.
    pub fn message_id(&self) -> Option<i64> {
        match self {
            ScrapeError::Extraction { message_id, .. } | ScrapeError::Store { message_id, .. } => {
                Some(*message_id)
            }
            _ => None,
        }
    }

    pub fn is_fetch(&self) -> bool {
        matches!(self, ScrapeError::Fetch { .. })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn display_includes_channel_and_cause() {
        let err = ScrapeError::Extraction {
            channel: "defimon".into(),
            message_id: 102,
            source: anyhow::anyhow!("model returned nothing"),
        };
        let text = err.to_string();
        assert!(text.contains("defimon#102"));
        assert!(text.contains("model returned nothing"));
        assert_eq!(err.message_id(), Some(102));
        assert!(!err.is_fetch());
    }
}
