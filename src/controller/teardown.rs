//! Best-effort teardown
//!
//! Runs every step even when earlier ones fail, then reports all failures
//! together. Not-found counts as success: the object is already gone.

use futures::future::BoxFuture;
use tracing::{debug, warn};

use crate::controller::error::{Error, Result};

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct TeardownFailure {
    pub step: String,
    pub error: String,
}

/// Outcome of a [`Teardown`] run
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct TeardownReport {
    pub completed: Vec<String>,
    pub failures: Vec<TeardownFailure>,
}

impl TeardownReport {
    pub fn is_clean(&self) -> bool {
        self.failures.is_empty()
    }

    /// Collapse failures into one retryable error
    pub fn into_result(self) -> Result<()> {
        if self.failures.is_empty() {
            return Ok(());
        }
        let summary: Vec<String> = self
            .failures
            .iter()
            .map(|f| format!("{}: {}", f.step, f.error))
            .collect();
        Err(Error::TransientError(format!(
            "{} teardown step(s) failed: {}",
            self.failures.len(),
            summary.join("; ")
        )))
    }
}

/// Ordered sequence of independent teardown steps
#[derive(Default)]
pub struct Teardown<'a> {
    steps: Vec<(String, BoxFuture<'a, Result<()>>)>,
}

impl<'a> Teardown<'a> {
    pub fn new() -> Self {
        Self { steps: Vec::new() }
    }

    pub fn step(mut self, name: impl Into<String>, fut: BoxFuture<'a, Result<()>>) -> Self {
        self.steps.push((name.into(), fut));
        self
    }

    pub fn len(&self) -> usize {
        self.steps.len()
    }

    pub fn is_empty(&self) -> bool {
        self.steps.is_empty()
    }

    pub async fn run(self) -> TeardownReport {
        let mut report = TeardownReport::default();
        for (name, fut) in self.steps {
            match fut.await {
                Ok(()) => {
                    debug!(step = %name, "teardown step completed");
                    report.completed.push(name);
                }
                Err(e) if e.is_not_found() => {
                    debug!(step = %name, "teardown step target already gone");
                    report.completed.push(name);
                }
                Err(e) => {
                    warn!(step = %name, error = %e, "teardown step failed, continuing");
                    report.failures.push(TeardownFailure {
                        step: name,
                        error: e.to_string(),
                    });
                }
            }
        }
        report
    }
}
