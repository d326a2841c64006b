//! Tools for limiting the number of concurrent CPU-bound tasks.

use std::sync::LazyLock;

use tokio::sync::Semaphore;

use crate::prelude::*;

/// Semaphore used to limit the number of concurrent `pdftotext`, `pdftoppm`
/// and `tesseract` processes.
static CPU_SEMAPHORE: LazyLock<Semaphore> =
    LazyLock::new(|| Semaphore::new(num_cpus::get()));

/// Call an async function while holding a permit from the CPU semaphore.
///
/// We do this to limit the number of external processes that are each trying
/// to use 100% of a CPU core. The extraction pool may run more files than we
/// have cores, but only this many tools run at once.
///
/// You don't need to do this for in-process CPU-bound tasks, as long as you're
/// using [`crate::async_utils::blocking::spawn_blocking_propagating_panics`].
#[instrument(level = "trace", skip_all)]
pub async fn with_cpu_semaphore<Func, Fut, R>(f: Func) -> Result<R>
where
    Func: FnOnce() -> Fut,
    Fut: Future<Output = Result<R>>,
{
    let permit = CPU_SEMAPHORE
        .acquire()
        .await
        .context("Could not acquire CPU permit")?;
    let result = f().await;
    drop(permit);
    result
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn passes_through_results() {
        let value = with_cpu_semaphore(|| async { Ok(3) }).await.unwrap();
        assert_eq!(value, 3);
        let err = with_cpu_semaphore(|| async { Err::<(), _>(anyhow!("nope")) })
            .await
            .unwrap_err();
        assert_eq!(err.to_string(), "nope");
    }
}
