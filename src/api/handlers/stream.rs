//! Live job output streaming (SSE)
//!
//! On connect the client receives the output history as default `message`
//! events, then the current progress if non-zero, then either an immediate
//! terminal `done` event or a live stream of `message` / `progress` /
//! `status` events. The job closing its subscriber channels is what
//! produces the final `done` event.

use std::convert::Infallible;
use std::sync::Arc;
use std::time::Duration;

use axum::{
    extract::{Path, State},
    response::sse::{Event, KeepAlive, KeepAliveStream, Sse},
};
use futures::stream::{self, BoxStream, StreamExt};
use tokio::sync::mpsc;

use crate::api::AppState;
use crate::error::{AppError, AppResult};
use crate::models::{Job, JobEvent};

enum LiveState {
    Open {
        job: Arc<Job>,
        rx: mpsc::Receiver<JobEvent>,
    },
    Closed,
}

/// Stream a job's output as server-sent events
pub async fn stream(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> AppResult<Sse<KeepAliveStream<BoxStream<'static, Result<Event, Infallible>>>>> {
    let job = state
        .manager
        .get(&id)
        .ok_or_else(|| AppError::NotFound("job not found".to_string()))?;

    // Subscribe before reading the status so no line can slip between the
    // snapshot and the registration.
    let (snapshot, rx) = job.subscribe();
    let summary = job.summary();

    let mut intro: Vec<Result<Event, Infallible>> = snapshot
        .into_iter()
        .map(|line| Ok(Event::default().data(line)))
        .collect();

    if summary.progress > 0.0 {
        intro.push(Ok(Event::default()
            .event("progress")
            .data(format!("{:.1}", summary.progress))));
    }

    let events = if summary.status.is_terminal() {
        // Terminal jobs emit nothing further; drop the registration we just
        // made and finish with the status.
        drop(rx);
        job.prune_subscribers();
        intro.push(Ok(Event::default()
            .event("done")
            .data(summary.status.to_string())));
        stream::iter(intro).boxed()
    } else {
        let live = stream::unfold(LiveState::Open { job, rx }, |state| async move {
            match state {
                LiveState::Open { job, mut rx } => match rx.recv().await {
                    Some(event) => Some((Ok(sse_event(event)), LiveState::Open { job, rx })),
                    // Channel closed: the job reached a terminal state (or
                    // was deleted); report the final status and finish.
                    None => {
                        let done = Event::default().event("done").data(job.status().to_string());
                        Some((Ok(done), LiveState::Closed))
                    }
                },
                LiveState::Closed => None,
            }
        });
        stream::iter(intro).chain(live).boxed()
    };

    Ok(Sse::new(events).keep_alive(
        KeepAlive::new()
            .interval(Duration::from_secs(15))
            .text("ping"),
    ))
}

fn sse_event(event: JobEvent) -> Event {
    match event {
        JobEvent::Message(line) => Event::default().data(line),
        JobEvent::Progress(raw) => Event::default().event("progress").data(raw),
        JobEvent::Status(status) => Event::default().event("status").data(status.to_string()),
    }
}
