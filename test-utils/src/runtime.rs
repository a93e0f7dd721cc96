//! A `tokio::Runtime` wrapper that collects spawned task handles and awaits
//! them at teardown, so a panic inside a spawned task fails the test instead
//! of vanishing silently.

use std::future::Future;
use std::pin::Pin;

use futures::FutureExt;
use tokio::runtime::{self, Runtime};
use tokio::task::{self, JoinError};

pub fn create_runtime() -> Runtime {
    tokio::runtime::Builder::new_multi_thread()
        .worker_threads(4)
        .enable_all()
        .build()
        .expect("could not create test runtime")
}

/// Create a runtime, run `f` against it, then drain and await every task `f`
/// spawned via `TestRuntime::spawn` so a panic inside one surfaces here.
pub fn test_async<F>(f: F)
where F: FnOnce(&mut TestRuntime) {
    let mut rt = TestRuntime::from(create_runtime());
    f(&mut rt);
    let handles = rt.handles.drain(..).collect::<Vec<_>>();
    for h in handles {
        rt.block_on(h).unwrap();
    }
}

pub struct TestRuntime {
    inner: Runtime,
    handles: Vec<Pin<Box<dyn Future<Output = Result<(), JoinError>>>>>,
}

impl TestRuntime {
    pub fn block_on<F: Future>(&mut self, future: F) -> F::Output {
        self.inner.block_on(future)
    }

    pub fn spawn<F>(&mut self, future: F)
    where
        F: Future + Send + 'static,
        F::Output: Send + 'static,
    {
        let handle = self.inner.spawn(future);
        self.handles.push(handle.map(|result| result.map(|_| ())).boxed());
    }

    pub fn spawn_unchecked<F>(&mut self, future: F) -> task::JoinHandle<F::Output>
    where
        F: Future + Send + 'static,
        F::Output: Send + 'static,
    {
        self.inner.spawn(future)
    }

    pub fn handle(&self) -> &runtime::Handle {
        self.inner.handle()
    }
}

impl From<Runtime> for TestRuntime {
    fn from(rt: Runtime) -> Self {
        Self { inner: rt, handles: Vec::new() }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn spawned_tasks_are_awaited_at_teardown() {
        use std::sync::atomic::{AtomicBool, Ordering};
        use std::sync::Arc;
        let ran = Arc::new(AtomicBool::new(false));
        let r = ran.clone();
        test_async(move |rt| {
            rt.spawn(async move {
                r.store(true, Ordering::SeqCst);
            });
        });
        assert!(ran.load(Ordering::SeqCst));
    }
}
