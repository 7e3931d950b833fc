use engram_core::VectorMatch;
use serde_json::Value;

use crate::fingerprint::Scope;

/// A qualifying candidate together with its stored payload.
#[derive(Debug, Clone)]
pub(crate) struct CacheHit {
    pub(crate) id: String,
    pub(crate) payload: Value,
}

/// What a lookup produced. The embedding is handed back so the write path
/// never re-embeds; it is absent only when embedding itself failed under
/// fail-open.
pub(crate) struct LookupOutcome {
    pub(crate) embedding: Option<Vec<f32>>,
    pub(crate) hit: Option<CacheHit>,
}

/// Pick the first candidate that clears the similarity threshold and whose
/// metadata carries exactly the request scope. Candidates arrive sorted by
/// descending score.
pub(crate) fn select_candidate<'a>(
    candidates: &'a [VectorMatch],
    threshold: f32,
    scope: &Scope,
) -> Option<&'a VectorMatch> {
    candidates.iter().find(|candidate| {
        candidate.score >= threshold
            && candidate
                .metadata
                .as_ref()
                .is_some_and(|metadata| scope.matches_metadata(metadata))
    })
}

#[cfg(test)]
mod tests {
    use engram_core::CallOptions;
    use serde_json::Value;

    use super::*;

    fn scope() -> Scope {
        Scope::of(&CallOptions::new("gpt-4o").with_temperature(0.2))
    }

    fn candidate(id: &str, score: f32, metadata: Option<Value>) -> VectorMatch {
        VectorMatch {
            id: id.to_string(),
            score,
            metadata,
        }
    }

    fn matching_metadata() -> Value {
        Value::Object(scope().metadata_fields())
    }

    #[test]
    fn below_threshold_is_rejected() {
        let candidates = vec![candidate("a", 0.80, Some(matching_metadata()))];
        assert!(select_candidate(&candidates, 0.92, &scope()).is_none());
    }

    #[test]
    fn null_metadata_is_rejected() {
        let candidates = vec![candidate("a", 0.99, None)];
        assert!(select_candidate(&candidates, 0.92, &scope()).is_none());
    }

    #[test]
    fn scope_mismatch_is_rejected_even_at_high_score() {
        let other = Scope::of(&CallOptions::new("gpt-4o").with_temperature(0.7));
        let candidates = vec![candidate("a", 0.99, Some(Value::Object(other.metadata_fields())))];
        assert!(select_candidate(&candidates, 0.92, &scope()).is_none());
    }

    #[test]
    fn first_qualifying_candidate_wins() {
        let candidates = vec![
            candidate("low", 0.50, Some(matching_metadata())),
            candidate("wrong-scope", 0.99, None),
            candidate("good", 0.95, Some(matching_metadata())),
            candidate("also-good", 0.94, Some(matching_metadata())),
        ];
        let selected = select_candidate(&candidates, 0.92, &scope()).unwrap();
        assert_eq!(selected.id, "good");
    }

    #[test]
    fn score_exactly_at_threshold_qualifies() {
        let candidates = vec![candidate("edge", 0.92, Some(matching_metadata()))];
        assert!(select_candidate(&candidates, 0.92, &scope()).is_some());
    }
}
