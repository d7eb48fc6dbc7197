#![forbid(unsafe_code)]

use tracing::Span;

/// Identity of one automation run: the account being processed plus the span
/// every core call logs under. Passed explicitly instead of living in a
/// per-account global logger.
#[derive(Debug, Clone)]
pub struct RunContext {
    account: String,
    run_id: String,
    span: Span,
}

impl RunContext {
    pub fn new(account: impl Into<String>, run_id: impl Into<String>) -> Self {
        let account = account.into();
        let run_id = run_id.into();
        let span = tracing::info_span!("media_run", account = %account, run_id = %run_id);
        Self {
            account,
            run_id,
            span,
        }
    }

    pub fn account(&self) -> &str {
        &self.account
    }

    pub fn run_id(&self) -> &str {
        &self.run_id
    }

    pub fn span(&self) -> &Span {
        &self.span
    }
}
