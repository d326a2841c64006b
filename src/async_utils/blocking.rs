//! Running CPU-intensive or blocking code without stalling the executor.
//!
//! PDF parsing and writing with `lopdf` is synchronous and may take a while for
//! large forms, so we push it onto Tokio's blocking pool.

use std::panic;

/// Wrapper around [`tokio::task::spawn_blocking`] that propagates panics from
/// the background task.
pub async fn spawn_blocking_propagating_panics<F, T>(f: F) -> T
where
    F: FnOnce() -> T + Send + 'static,
    T: Send + 'static,
{
    match tokio::task::spawn_blocking(f).await {
        Ok(value) => value,
        Err(err) if err.is_panic() => panic::resume_unwind(err.into_panic()),
        // We never abort blocking tasks, so cancellation means the runtime is
        // shutting down underneath us.
        Err(err) => panic!("blocking task was cancelled: {err}"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn returns_value_from_blocking_task() {
        let value = spawn_blocking_propagating_panics(|| 6 * 7).await;
        assert_eq!(value, 42);
    }

    #[tokio::test]
    #[should_panic(expected = "boom")]
    async fn propagates_panics() {
        let _: i32 = spawn_blocking_propagating_panics(|| -> i32 { panic!("boom") }).await;
    }
}
