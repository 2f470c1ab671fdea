use tokio::sync::{mpsc, watch};

use super::{Nursery, wait_stopped};
use crate::boltz::SwapStatusResponse;

enum Flow {
    Continue,
    Done,
}

/// Streams the status of one swap until it is final or `stop` fires, reconnecting by
/// polling whenever the stream breaks.
pub(super) async fn run(nursery: Nursery, swap_id: String, mut stop: watch::Receiver<bool>) {
    tracing::info!(swap_id = %swap_id, "listening to swap events");
    let retry_interval = nursery.config().retry_interval();

    loop {
        let (events, mut received) = mpsc::channel(16);
        let stream = nursery
            .inner
            .boltz
            .stream_swap_status(&swap_id, events, stop.clone());
        tokio::pin!(stream);

        let result = loop {
            tokio::select! {
                result = &mut stream => break result,
                Some(update) = received.recv() => {
                    if let Flow::Done = process(&nursery, &swap_id, update).await {
                        return;
                    }
                }
                _ = wait_stopped(&mut stop) => {
                    tracing::info!(swap_id = %swap_id, "stopping swap listener");
                    return;
                }
            }
        };
        while let Ok(update) = received.try_recv() {
            if let Flow::Done = process(&nursery, &swap_id, update).await {
                return;
            }
        }

        match result {
            Ok(()) if *stop.borrow() => return,
            Ok(()) => tracing::warn!(swap_id = %swap_id, "status stream closed"),
            Err(err) => {
                tracing::error!(swap_id = %swap_id, error = %format!("{err:#}"), "could not listen to swap events")
            }
        }

        loop {
            tracing::info!(swap_id = %swap_id, retry_in = ?retry_interval, "retrying swap status");
            tokio::select! {
                _ = tokio::time::sleep(retry_interval) => {}
                _ = wait_stopped(&mut stop) => {
                    tracing::info!(swap_id = %swap_id, "stopping reconnection loop");
                    return;
                }
            }

            match nursery.inner.boltz.swap_status(&swap_id).await {
                Ok(latest) => {
                    tracing::info!(swap_id = %swap_id, "reconnected to swap status");
                    if let Flow::Done = process(&nursery, &swap_id, latest).await {
                        return;
                    }
                    break;
                }
                Err(err) => {
                    tracing::warn!(swap_id = %swap_id, error = %format!("{err:#}"), "could not fetch swap status")
                }
            }
        }
    }
}

async fn process(nursery: &Nursery, swap_id: &str, update: SwapStatusResponse) -> Flow {
    if update.id != swap_id {
        tracing::warn!(swap_id = %swap_id, other = %update.id, "dropping update for another swap");
        return Flow::Continue;
    }
    if let Err(err) = nursery.handle_status(&update).await {
        tracing::error!(swap_id = %swap_id, error = %format!("{err:#}"), "could not handle swap status");
    }

    match nursery.db_get(swap_id).await {
        Ok(Some(record)) if record.state.is_final() => {
            tracing::info!(swap_id = %swap_id, state = %record.state, "swap finished");
            Flow::Done
        }
        Ok(Some(_)) => Flow::Continue,
        Ok(None) => Flow::Done,
        Err(err) => {
            tracing::warn!(swap_id = %swap_id, error = %format!("{err:#}"), "could not reload swap");
            Flow::Continue
        }
    }
}
