use engram_core::{StepCallback, StepEvent};

/// Fans step events out to the configured callback and, in debug mode, to
/// the tracing subscriber.
#[derive(Clone)]
pub(crate) struct StepEmitter {
    callback: Option<StepCallback>,
    debug: bool,
}

impl StepEmitter {
    pub(crate) fn new(callback: Option<StepCallback>, debug: bool) -> Self {
        Self { callback, debug }
    }

    pub(crate) fn emit(&self, event: StepEvent) {
        if self.debug {
            tracing::debug!(
                step = ?event.step,
                cache_score = ?event.cache_score,
                error = ?event.error,
                "cache step"
            );
        }
        if let Some(callback) = &self.callback {
            callback(event);
        }
    }
}
