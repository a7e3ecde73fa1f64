pub mod client;
pub mod node;
pub mod stream;
pub mod workload;

use std::future::Future;
use std::time::Duration;

/// How long any single step may take before a test fails.
pub const WAIT: Duration = Duration::from_secs(10);

/// Await `fut`, panicking with `what` if it takes longer than [`WAIT`].
pub async fn within<T>(what: &str, fut: impl Future<Output = T>) -> T {
    match tokio::time::timeout(WAIT, fut).await {
        Ok(value) => value,
        Err(_) => panic!("timed out waiting for {what}"),
    }
}

/// Initialize tracing for tests (only once per process).
pub fn init_tracing() {
    use std::sync::Once;
    static INIT: Once = Once::new();
    INIT.call_once(|| {
        tracing_subscriber::fmt()
            .with_env_filter("confnode_daemon=debug,confnode_job=debug")
            .with_test_writer()
            .try_init()
            .ok();
    });
}
