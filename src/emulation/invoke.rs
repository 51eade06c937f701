//! Invoking lookup routines with an optional time bound.

use std::{
    sync::{
        mpsc::{self, RecvTimeoutError},
        Arc,
    },
    thread::{self, ThreadId},
    time::Duration,
};

use log::warn;

use crate::{
    emulation::host::{LiveArtifact, RuntimeMethod, Value},
    Error, Result,
};

/// Invoke `method` on `artifact`, bounded by `timeout`.
///
/// `prepare` runs before the call with the id of the thread the call will run on, and whatever
/// it returns is held until the call completes or times out. Method recovery uses it to arm the
/// [`crate::emulation::Interceptor`] for the right thread.
///
/// Without a timeout the call runs on the current thread. With one, it runs on a dedicated worker
/// which is abandoned if it does not answer in time.
///
/// # Errors
/// Returns [`Error::Timeout`] if the bound is exceeded, [`Error::Host`] if the worker dies, and
/// whatever `prepare` or the invocation itself return.
pub fn invoke_bounded<G, F>(
    artifact: &Arc<dyn LiveArtifact>,
    method: &RuntimeMethod,
    instance: Option<Value>,
    args: Vec<Value>,
    timeout: Option<Duration>,
    prepare: F,
) -> Result<Value>
where
    F: FnOnce(ThreadId) -> Result<G>,
{
    let Some(limit) = timeout else {
        let _held = prepare(thread::current().id())?;
        return artifact.invoke(method, instance.as_ref(), &args);
    };

    let (start_tx, start_rx) = mpsc::channel::<()>();
    let (result_tx, result_rx) = mpsc::channel();
    let worker_artifact = Arc::clone(artifact);
    let worker_method = method.clone();

    let worker = thread::Builder::new()
        .name(format!("lookup-{}", method.name))
        .spawn(move || {
            if start_rx.recv().is_err() {
                return;
            }
            let result = worker_artifact.invoke(&worker_method, instance.as_ref(), &args);
            // The receiver is gone once the caller timed out
            let _ = result_tx.send(result);
        })?;

    let held = prepare(worker.thread().id())?;
    start_tx
        .send(())
        .map_err(|_| Error::Host("lookup worker exited before starting".to_string()))?;

    let outcome = result_rx.recv_timeout(limit);
    drop(held);

    match outcome {
        Ok(result) => {
            let _ = worker.join();
            result
        }
        Err(RecvTimeoutError::Timeout) => {
            warn!("Lookup {} did not return within {:?}", method.name, limit);
            Err(Error::Timeout(limit))
        }
        Err(RecvTimeoutError::Disconnected) => {
            Err(Error::Host(format!("lookup {} panicked", method.name)))
        }
    }
}
