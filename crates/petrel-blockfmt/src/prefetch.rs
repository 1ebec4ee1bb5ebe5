use std::collections::VecDeque;
use std::io::Read;

use tokio::sync::mpsc;
use tracing::debug;

use crate::convert::Queued;

type WakeHandle = tokio::task::JoinHandle<Box<dyn Read + Send>>;

/// Insert a prefetch stage between the feeder and the dispatch channel.
///
/// For each arriving input the reader is taken out of its slot, a
/// zero-byte wake read is issued in the background, and the input is
/// forwarded (reader restored) once older prefetches have made room
/// under the inflight byte budget. The look-ahead window and the budget
/// bound how much data can be warming concurrently; exact policy here is
/// a latency-hiding heuristic, not a contract.
pub(crate) fn spawn(
    dst: mpsc::Sender<Queued>,
    max_ahead: usize,
    budget: u64,
) -> mpsc::Sender<Queued> {
    let (tx, mut rx) = mpsc::channel::<Queued>(max_ahead.max(1));
    tokio::spawn(async move {
        let mut pending: VecDeque<(Queued, Option<WakeHandle>)> = VecDeque::new();
        let mut inflight = 0u64;
        while let Some(mut queued) = rx.recv().await {
            while !pending.is_empty()
                && (inflight + queued.input.size > budget || pending.len() >= max_ahead)
            {
                if !forward_oldest(&mut pending, &dst, &mut inflight).await {
                    close_all(pending, &mut rx).await;
                    return;
                }
            }
            let handle = queued
                .input
                .reader
                .take()
                .map(|reader| tokio::task::spawn_blocking(move || wake(reader)));
            inflight += queued.input.size;
            pending.push_back((queued, handle));
        }
        debug!(pending = pending.len(), "prefetch feeder drained");
        while !pending.is_empty() {
            if !forward_oldest(&mut pending, &dst, &mut inflight).await {
                close_all(pending, &mut rx).await;
                return;
            }
        }
    });
    tx
}

async fn forward_oldest(
    pending: &mut VecDeque<(Queued, Option<WakeHandle>)>,
    dst: &mpsc::Sender<Queued>,
    inflight: &mut u64,
) -> bool {
    let (mut queued, handle) = pending.pop_front().expect("forward on empty queue");
    if let Some(handle) = handle {
        if let Ok(reader) = handle.await {
            queued.input.reader = Some(reader);
        }
    }
    *inflight = inflight.saturating_sub(queued.input.size);
    dst.send(queued).await.is_ok()
}

/// Dispatch is gone (every lane exited); close whatever we hold so no
/// stream leaks.
async fn close_all(
    pending: VecDeque<(Queued, Option<WakeHandle>)>,
    rx: &mut mpsc::Receiver<Queued>,
) {
    for (mut queued, handle) in pending {
        if let Some(handle) = handle {
            let _ = handle.await;
        }
        queued.input.reader = None;
    }
    while let Some(mut queued) = rx.recv().await {
        queued.input.reader = None;
    }
}

fn wake(mut reader: Box<dyn Read + Send>) -> Box<dyn Read + Send> {
    let _ = reader.read(&mut []);
    reader
}
