//! Commit-or-rollback driver shared by every backend.

use std::any::Any;
use std::future::Future;
use std::panic::AssertUnwindSafe;

use futures::FutureExt;
use tracing::{debug, warn};

use crate::{Context, Tx, TxError};

/// Run `work` against an open transaction and resolve it exactly once.
///
/// - `Ok` from `work` commits; a failed commit comes back as
///   [`TxError::Commit`].
/// - `Err` from `work` rolls back and returns the error unchanged, or as
///   [`TxError::Rollback`] when the rollback fails too.
/// - A panic in `work` rolls back and resumes the panic.  If the rollback
///   fails the panic is re-raised with the rollback failure in its message.
pub async fn run<F, Fut>(ctx: &Context, tx: &dyn Tx, work: F) -> Result<(), TxError>
where
    F: FnOnce(Context) -> Fut,
    Fut: Future<Output = Result<(), TxError>>,
{
    let work_ctx = ctx.clone();
    let outcome = AssertUnwindSafe(async move { work(work_ctx).await })
        .catch_unwind()
        .await;

    match outcome {
        Ok(Ok(())) => {
            tx.commit(ctx)
                .await
                .map_err(|err| TxError::Commit(Box::new(err)))?;
            debug!("transaction committed");
            Ok(())
        }
        Ok(Err(err)) => {
            debug!(error = %err, "unit of work failed; rolling back");
            match tx.rollback(ctx).await {
                Ok(()) => Err(err),
                Err(rollback) => Err(TxError::Rollback {
                    cause: Box::new(err),
                    rollback: Box::new(rollback),
                }),
            }
        }
        Err(payload) => {
            warn!("unit of work panicked; rolling back");
            if let Err(rollback) = tx.rollback(ctx).await {
                panic!(
                    "panic: {}; failed to rollback transaction: {rollback}",
                    panic_message(payload.as_ref())
                );
            }
            std::panic::resume_unwind(payload)
        }
    }
}

fn panic_message(payload: &(dyn Any + Send)) -> &str {
    if let Some(msg) = payload.downcast_ref::<&'static str>() {
        msg
    } else if let Some(msg) = payload.downcast_ref::<String>() {
        msg.as_str()
    } else {
        "Box<dyn Any>"
    }
}
