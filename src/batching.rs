use std::future::Future;

use anyhow::{Result, anyhow, ensure};
use async_trait::async_trait;
use tokio::sync::{mpsc, oneshot};
use tokio::time::{Instant, timeout_at};
use tokio_util::task::AbortOnDropHandle;
use tracing::{debug, error};

use crate::args::{ArgColumns, CallArgs};
use crate::error::ResidualError;
use crate::options::BatchingOptions;

/// A batch handler: processes a whole batch of calls in one invocation.
///
/// In place of each scalar argument of a single call, the handler receives a
/// column of values, one per batch member and in batch order. It must return
/// exactly one output per batch member, in the same order.
#[async_trait]
pub trait Runner: Send + Sync {
    type Value: Send + 'static;
    type Output: Send + 'static;

    async fn run(&self, batch: ArgColumns<Self::Value>) -> Result<Vec<Self::Output>>;
}

pub(crate) struct PendingCall<V, S> {
    pub(crate) args: CallArgs<V>,
    pub(crate) sink: S,
}

type ResultSink<O> = oneshot::Sender<Result<O>>;

/// Aggregates concurrent single-input calls into batches for a [`Runner`].
///
/// Callers invoke [`run`](Self::run) one input at a time; the coordinator
/// queues requests, forms batches under the size + timer policy of
/// [`BatchingOptions`], dispatches the runner once per batch, and routes each
/// output back to the caller that supplied the matching input. Batches are
/// dispatched strictly sequentially; parallelism comes from running multiple
/// batchers.
///
/// Dropping the `Batcher` tears the coordinator loop down; callers still
/// waiting observe an error.
pub struct Batcher<R: Runner + 'static> {
    call_tx: mpsc::UnboundedSender<PendingCall<R::Value, ResultSink<R::Output>>>,
    _loop_task: AbortOnDropHandle<()>,
}

impl<R: Runner + 'static> std::fmt::Debug for Batcher<R> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Batcher")
            .field("call_tx", &self.call_tx)
            .field("_loop_task", &self._loop_task)
            .finish()
    }
}

impl<R: Runner + 'static> Batcher<R> {
    pub fn new(runner: R, options: BatchingOptions) -> Result<Self> {
        options.validate()?;
        let (call_tx, call_rx) = mpsc::unbounded_channel();
        let loop_task = tokio::spawn(batch_loop(runner, options, call_rx));
        Ok(Self {
            call_tx,
            _loop_task: AbortOnDropHandle::new(loop_task),
        })
    }

    /// Submits one call and resolves to its result once the batch it lands in
    /// has been dispatched.
    ///
    /// The request is enqueued before this returns; the returned future only
    /// waits for the result, so it does not borrow the batcher.
    pub fn run(
        &self,
        args: CallArgs<R::Value>,
    ) -> impl Future<Output = Result<R::Output>> + use<R> {
        let (sink, result_rx) = oneshot::channel();
        let enqueued = self.call_tx.send(PendingCall { args, sink }).is_ok();
        async move {
            ensure!(enqueued, "batcher is shut down");
            result_rx
                .await
                .map_err(|_| anyhow!("batcher was torn down before the call completed"))?
        }
    }
}

/// Takes one batch off the queue: the first arrival fixes the deadline, then
/// the batch fills until `max_batch_size` or the deadline, whichever first.
/// Already-queued requests are taken immediately, so a zero timeout still
/// drains the available prefix. Returns `None` once all senders are gone.
pub(crate) async fn collect_batch<T>(
    call_rx: &mut mpsc::UnboundedReceiver<T>,
    options: &BatchingOptions,
) -> Option<Vec<T>> {
    let first = call_rx.recv().await?;
    let mut batch = vec![first];
    if options.max_batch_size > 1 {
        let deadline = Instant::now() + options.batch_wait_timeout;
        while batch.len() < options.max_batch_size {
            match timeout_at(deadline, call_rx.recv()).await {
                Ok(Some(call)) => batch.push(call),
                Ok(None) | Err(_) => break,
            }
        }
    }
    Some(batch)
}

async fn batch_loop<R: Runner>(
    runner: R,
    options: BatchingOptions,
    mut call_rx: mpsc::UnboundedReceiver<PendingCall<R::Value, ResultSink<R::Output>>>,
) {
    while let Some(batch) = collect_batch(&mut call_rx, &options).await {
        run_batch(&runner, batch).await;
    }
}

async fn run_batch<R: Runner>(
    runner: &R,
    calls: Vec<PendingCall<R::Value, ResultSink<R::Output>>>,
) {
    let batch_size = calls.len();
    let (args, mut sinks): (Vec<_>, Vec<_>) =
        calls.into_iter().map(|call| (call.args, call.sink)).unzip();

    let columns = match ArgColumns::pack(args) {
        Ok(columns) => columns,
        Err(err) => {
            error!("{err:#}");
            fail_all(sinks, err);
            return;
        }
    };

    let outputs = tokio::select! {
        outputs = runner.run(columns) => outputs,
        _ = all_sinks_closed(&mut sinks) => {
            debug!("every caller in the batch went away; dropping the batch");
            return;
        }
    };

    match outputs {
        Ok(outputs) => {
            if outputs.len() != batch_size {
                let message = format!(
                    "batched call returned {} outputs for {batch_size} inputs",
                    outputs.len()
                );
                error!("{message}");
                for sink in sinks {
                    sink.send(Err(anyhow!("{message}"))).ok();
                }
                return;
            }
            for (output, sink) in outputs.into_iter().zip(sinks) {
                sink.send(Ok(output)).ok();
            }
        }
        Err(err) => fail_all(sinks, err),
    }
}

async fn all_sinks_closed<O>(sinks: &mut [ResultSink<O>]) {
    for sink in sinks {
        sink.closed().await;
    }
}

fn fail_all<O>(sinks: Vec<ResultSink<O>>, err: anyhow::Error) {
    let mut sinks = sinks.into_iter();
    if let Some(first) = sinks.next() {
        if sinks.len() > 0 {
            let residual = ResidualError::new(&err);
            for sink in sinks {
                sink.send(Err(residual.clone().into())).ok();
            }
        }
        first.send(Err(err)).ok();
    }
}
