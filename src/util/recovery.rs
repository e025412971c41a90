//! Panic containment for user task code.
//!
//! A panic inside `process`/`window` must not skip the container's shutdown
//! sequence: every started subsystem still has to receive its stop. The
//! wrapper converts panics into ordinary task errors that unwind the run
//! loop the normal way.

use std::future::Future;
use std::panic::AssertUnwindSafe;

use futures::FutureExt;

use crate::types::{Error, Result};

/// Run a task-code future, converting a panic into `Error::Process`.
pub async fn with_recovery_async<F, T>(future: F, operation: &str) -> Result<T>
where
    F: Future<Output = Result<T>>,
{
    match AssertUnwindSafe(future).catch_unwind().await {
        Ok(result) => result,
        Err(payload) => {
            let message = extract_panic_message(&payload);
            tracing::error!(operation, panic = %message, "panic recovered from task code");
            Err(Error::process(format!(
                "panic in {}: {}",
                operation, message
            )))
        }
    }
}

fn extract_panic_message(payload: &Box<dyn std::any::Any + Send>) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        s.to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic (no message)".to_string()
    }
}
