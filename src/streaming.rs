use std::pin::Pin;
use std::task::{Context, Poll};

use anyhow::{Result, anyhow};
use futures::stream::{BoxStream, Stream, StreamExt};
use tokio::sync::mpsc;
use tokio_stream::wrappers::UnboundedReceiverStream;
use tokio_util::task::AbortOnDropHandle;
use tracing::{debug, error};

use crate::args::{ArgColumns, CallArgs};
use crate::batching::{PendingCall, collect_batch};
use crate::error::ResidualError;
use crate::options::BatchingOptions;

/// A streaming batch handler: produces a lazy, finite sequence of rows, each
/// holding exactly one output per batch member, in batch order.
///
/// The coordinator consumes the sequence row by row and routes element *i* of
/// every row to caller *i*'s stream.
pub trait StreamRunner: Send + Sync {
    type Value: Send + 'static;
    type Output: Send + 'static;

    fn run(&self, batch: ArgColumns<Self::Value>) -> BoxStream<'_, Result<Vec<Self::Output>>>;
}

enum RowEvent<O> {
    Item(Result<O>),
    End,
}

type RowSink<O> = mpsc::UnboundedSender<RowEvent<O>>;

/// Streaming counterpart of [`Batcher`](crate::Batcher): the same queueing
/// and batch-formation policy, but each caller receives a [`ResultStream`]
/// instead of a single result.
pub struct StreamBatcher<R: StreamRunner + 'static> {
    call_tx: mpsc::UnboundedSender<PendingCall<R::Value, RowSink<R::Output>>>,
    _loop_task: AbortOnDropHandle<()>,
}

impl<R: StreamRunner + 'static> StreamBatcher<R> {
    pub fn new(runner: R, options: BatchingOptions) -> Result<Self> {
        options.validate()?;
        let (call_tx, call_rx) = mpsc::unbounded_channel();
        let loop_task = tokio::spawn(batch_loop(runner, options, call_rx));
        Ok(Self {
            call_tx,
            _loop_task: AbortOnDropHandle::new(loop_task),
        })
    }

    /// Submits one call. The request is enqueued before this returns; the
    /// stream then yields this caller's element of every row the handler
    /// produces for the batch.
    pub fn run(&self, args: CallArgs<R::Value>) -> ResultStream<R::Output> {
        let (sink, row_rx) = mpsc::unbounded_channel();
        if let Err(mpsc::error::SendError(call)) = self.call_tx.send(PendingCall { args, sink }) {
            call.sink
                .send(RowEvent::Item(Err(anyhow!("batcher is shut down"))))
                .ok();
        }
        ResultStream {
            rows: UnboundedReceiverStream::new(row_rx),
            done: false,
        }
    }
}

/// One caller's lazy result sequence.
///
/// Yields `Ok` items in row order, ends after the handler's sequence ends,
/// and yields at most one `Err` as its final item: the batch's failure, or a
/// teardown error if the batcher was dropped mid-stream.
pub struct ResultStream<O> {
    rows: UnboundedReceiverStream<RowEvent<O>>,
    done: bool,
}

impl<O> Stream for ResultStream<O> {
    type Item = Result<O>;

    fn poll_next(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        let this = self.get_mut();
        if this.done {
            return Poll::Ready(None);
        }
        match Pin::new(&mut this.rows).poll_next(cx) {
            Poll::Pending => Poll::Pending,
            Poll::Ready(Some(RowEvent::Item(item))) => {
                if item.is_err() {
                    this.done = true;
                }
                Poll::Ready(Some(item))
            }
            Poll::Ready(Some(RowEvent::End)) => {
                this.done = true;
                Poll::Ready(None)
            }
            // The sink was dropped without an end marker: the coordinator is
            // gone, not finished.
            Poll::Ready(None) => {
                this.done = true;
                Poll::Ready(Some(Err(anyhow!(
                    "batcher was torn down before the stream completed"
                ))))
            }
        }
    }
}

async fn batch_loop<R: StreamRunner>(
    runner: R,
    options: BatchingOptions,
    mut call_rx: mpsc::UnboundedReceiver<PendingCall<R::Value, RowSink<R::Output>>>,
) {
    while let Some(batch) = collect_batch(&mut call_rx, &options).await {
        run_batch(&runner, batch).await;
    }
}

async fn run_batch<R: StreamRunner>(
    runner: &R,
    calls: Vec<PendingCall<R::Value, RowSink<R::Output>>>,
) {
    let batch_size = calls.len();
    let (args, sinks): (Vec<_>, Vec<_>) =
        calls.into_iter().map(|call| (call.args, call.sink)).unzip();

    let columns = match ArgColumns::pack(args) {
        Ok(columns) => columns,
        Err(err) => {
            error!("{err:#}");
            fail_all(&sinks, err);
            return;
        }
    };

    let mut rows = runner.run(columns);
    while let Some(row) = rows.next().await {
        let row = match row {
            Ok(row) => row,
            Err(err) => {
                fail_all(&sinks, err);
                return;
            }
        };
        if row.len() != batch_size {
            let message = format!(
                "batched stream yielded {} outputs for {batch_size} inputs",
                row.len()
            );
            error!("{message}");
            for sink in &sinks {
                sink.send(RowEvent::Item(Err(anyhow!("{message}")))).ok();
            }
            return;
        }

        let mut any_listening = false;
        for (output, sink) in row.into_iter().zip(&sinks) {
            if sink.send(RowEvent::Item(Ok(output))).is_ok() {
                any_listening = true;
            }
        }
        if !any_listening {
            debug!("every caller in the batch dropped its stream; abandoning the batch");
            return;
        }
    }

    for sink in &sinks {
        sink.send(RowEvent::End).ok();
    }
}

fn fail_all<O>(sinks: &[RowSink<O>], err: anyhow::Error) {
    if let Some((first, rest)) = sinks.split_first() {
        if !rest.is_empty() {
            let residual = ResidualError::new(&err);
            for sink in rest {
                sink.send(RowEvent::Item(Err(residual.clone().into()))).ok();
            }
        }
        first.send(RowEvent::Item(Err(err))).ok();
    }
}
