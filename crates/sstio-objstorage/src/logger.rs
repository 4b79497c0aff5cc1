//! Provider logging hooks
//!
//! Routine events are logged with `tracing` directly. The `Logger` trait
//! carries the few messages an embedder may want to intercept, most
//! importantly fatal corruption reports.

use std::fmt;
use tracing::{error, info};

/// Sink for provider lifecycle messages
pub trait Logger: Send + Sync + fmt::Debug {
    fn info(&self, msg: &str);

    fn error(&self, msg: &str);

    /// Report unrecoverable corruption; never returns
    fn fatal(&self, msg: &str) -> !;
}

/// Logger writing to `tracing`; `fatal` aborts the process
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingLogger;

impl Logger for TracingLogger {
    fn info(&self, msg: &str) {
        info!("{}", msg);
    }

    fn error(&self, msg: &str) {
        error!("{}", msg);
    }

    fn fatal(&self, msg: &str) -> ! {
        error!("FATAL: {}", msg);
        std::process::abort()
    }
}

#[cfg(test)]
pub(crate) mod testutil {
    use super::Logger;

    /// Logger that panics on fatal errors, for `#[should_panic]` tests
    #[derive(Debug, Default)]
    pub struct PanicLogger;

    impl Logger for PanicLogger {
        fn info(&self, _msg: &str) {}

        fn error(&self, _msg: &str) {}

        fn fatal(&self, msg: &str) -> ! {
            panic!("fatal: {msg}")
        }
    }
}
