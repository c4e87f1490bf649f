//! Correlation resolution — deriving the reduction key from an event.
//!
//! All events fanned out from a common ancestor carry that ancestor's chain
//! identifier; the reduction key is derived from it and names the
//! aggregation the siblings fold into. Resolution is a pure function of the
//! envelope: no storage reads, no side effects.

use weir_core::ReductionKey;

use crate::error::{Error, Result};
use crate::event::MemberEvent;

/// Derives reduction keys from member event metadata.
#[derive(Debug, Clone, Copy, Default)]
pub struct CorrelationResolver;

impl CorrelationResolver {
    /// Resolves the reduction key for an event.
    ///
    /// # Errors
    ///
    /// Returns [`Error::MissingCorrelation`] if the event carries no chain id
    /// (or a blank one) — a non-retryable rejection — and an invalid-id error
    /// if the chain id fails key validation.
    pub fn resolve(event: &MemberEvent) -> Result<ReductionKey> {
        let chain_id = event
            .chain_id
            .as_deref()
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .ok_or(Error::MissingCorrelation { event_id: event.id })?;

        ReductionKey::new(chain_id).map_err(Error::from)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::event::DocumentRef;
    use weir_core::MemberId;

    fn event_with_chain(chain_id: Option<&str>) -> MemberEvent {
        let mut event = MemberEvent::document_created(
            "placeholder",
            MemberId::new_unchecked("etag-a"),
            DocumentRef::new("s3://bucket/a.txt", "text/plain", "etag-a"),
        );
        event.chain_id = chain_id.map(String::from);
        event
    }

    #[test]
    fn resolves_chain_id() {
        let event = event_with_chain(Some("chain-42"));
        let key = CorrelationResolver::resolve(&event).unwrap();
        assert_eq!(key.as_str(), "chain-42");
    }

    #[test]
    fn trims_surrounding_whitespace() {
        let event = event_with_chain(Some("  chain-42  "));
        let key = CorrelationResolver::resolve(&event).unwrap();
        assert_eq!(key.as_str(), "chain-42");
    }

    #[test]
    fn missing_chain_id_is_rejected() {
        let event = event_with_chain(None);
        let err = CorrelationResolver::resolve(&event).unwrap_err();
        assert!(matches!(err, Error::MissingCorrelation { .. }));
        assert!(err.is_non_retryable());
    }

    #[test]
    fn blank_chain_id_is_rejected() {
        let event = event_with_chain(Some("   "));
        assert!(matches!(
            CorrelationResolver::resolve(&event),
            Err(Error::MissingCorrelation { .. })
        ));
    }

    #[test]
    fn resolution_is_deterministic() {
        let event = event_with_chain(Some("chain-42"));
        assert_eq!(
            CorrelationResolver::resolve(&event).unwrap(),
            CorrelationResolver::resolve(&event).unwrap()
        );
    }
}
