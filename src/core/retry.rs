//! Purpose: Bounded fixed-interval retries for filesystem metadata operations.
//! Exports: `RetryPolicy`, `DEFAULT_TRANSIENT_EXCEPTIONS`.
//! Role: Hides transient cluster states (standby NameNode, server-requested retry) from callers.
//! Invariants: Total attempts never exceed budget/interval + 1.
//! Invariants: Failures outside the transient vocabulary return on the first attempt, unslept.
use std::time::Duration;

use crate::core::error::Error;

pub const DEFAULT_BUDGET: Duration = Duration::from_secs(10);
pub const DEFAULT_INTERVAL: Duration = Duration::from_millis(100);

pub const DEFAULT_TRANSIENT_EXCEPTIONS: [&str; 2] = [
    "org.apache.hadoop.ipc.StandbyException",
    "org.apache.hadoop.ipc.RetriableException",
];

#[derive(Clone, Debug, Eq, PartialEq)]
pub struct RetryPolicy {
    budget: Duration,
    interval: Duration,
    transient_exceptions: Vec<String>,
}

impl RetryPolicy {
    pub fn new(budget: Duration, interval: Duration) -> Self {
        Self {
            budget,
            interval,
            transient_exceptions: DEFAULT_TRANSIENT_EXCEPTIONS
                .iter()
                .map(|name| name.to_string())
                .collect(),
        }
    }

    /// Replaces the exception vocabulary considered transient.
    ///
    /// Entries are matched against `Error::exception()`: a fully qualified entry must match
    /// exactly, an entry without a package also matches the simple class name.
    pub fn with_transient_exceptions<I, S>(mut self, names: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.transient_exceptions = names.into_iter().map(Into::into).collect();
        self
    }

    pub fn budget(&self) -> Duration {
        self.budget
    }

    pub fn interval(&self) -> Duration {
        self.interval
    }

    pub fn transient_exceptions(&self) -> &[String] {
        &self.transient_exceptions
    }

    /// Extra attempts allowed after the first one.
    pub fn max_retries(&self) -> u32 {
        let retries = self
            .budget
            .as_nanos()
            .checked_div(self.interval.as_nanos())
            .unwrap_or(0);
        u32::try_from(retries).unwrap_or(u32::MAX)
    }

    pub fn is_transient(&self, err: &Error) -> bool {
        let Some(exception) = err.exception() else {
            return false;
        };
        let simple = exception.rsplit('.').next().unwrap_or(exception);
        self.transient_exceptions.iter().any(|name| {
            name == exception || (!name.contains('.') && name == simple)
        })
    }

    pub fn run<T, F>(&self, op: &str, mut f: F) -> Result<T, Error>
    where
        F: FnMut() -> Result<T, Error>,
    {
        let max_retries = self.max_retries();
        let mut attempts = 0u32;
        let mut waited = Duration::ZERO;
        loop {
            attempts += 1;
            match f() {
                Ok(value) => return Ok(value),
                Err(err) => {
                    if !self.is_transient(&err) {
                        return Err(err);
                    }
                    if attempts > max_retries {
                        tracing::warn!(
                            op,
                            attempts,
                            waited_ms = waited.as_millis() as u64,
                            error = %err,
                            "retry budget exhausted"
                        );
                        return Err(add_retry_hint(err, attempts, waited));
                    }
                    tracing::debug!(op, attempt = attempts, error = %err, "transient failure, retrying");
                    std::thread::sleep(self.interval);
                    waited += self.interval;
                }
            }
        }
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::new(DEFAULT_BUDGET, DEFAULT_INTERVAL)
    }
}

fn add_retry_hint(err: Error, attempts: u32, waited: Duration) -> Error {
    let info = format!(
        "Retry attempts: {attempts} (waited {}ms).",
        waited.as_millis()
    );
    if let Some(hint) = err.hint().map(|hint| hint.to_string()) {
        err.with_hint(format!("{hint} {info}"))
    } else {
        err.with_hint(info)
    }
}
