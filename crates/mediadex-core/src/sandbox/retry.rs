/// What the sandbox does with a batch whose worker died mid-request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CrashAction {
    /// Restart the worker and send each path of the batch on its own.
    ResubmitIndividually,
    /// Give up on the batch; its paths get no result.
    Skip,
}

pub trait CrashStrategy: Send + Sync {
    fn on_crash(&self, batch_len: usize) -> CrashAction;
}

/// Split crashed batches so a single bad file only costs its own result.
/// A crash on a one-path request is final for that path.
#[derive(Debug, Default, Clone, Copy)]
pub struct IsolateOffender;

impl CrashStrategy for IsolateOffender {
    fn on_crash(&self, batch_len: usize) -> CrashAction {
        if batch_len > 1 {
            CrashAction::ResubmitIndividually
        } else {
            CrashAction::Skip
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_isolate_offender() {
        assert_eq!(IsolateOffender.on_crash(5), CrashAction::ResubmitIndividually);
        assert_eq!(IsolateOffender.on_crash(1), CrashAction::Skip);
    }
}
