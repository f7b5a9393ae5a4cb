//! Server-sent event stream of pipeline events plus a periodic status push.

use super::AppState;
use crate::error::ApiError;
use crate::pipeline::{EventKind, PipelineEvent};
use axum::{
    extract::{Path, State},
    response::sse::{Event, KeepAlive, Sse},
};
use futures::stream::{self, Stream};
use std::convert::Infallible;
use tokio::sync::broadcast::error::RecvError;
use tokio::time::MissedTickBehavior;
use tracing::debug;

fn to_sse(event: &PipelineEvent) -> Event {
    Event::default()
        .event(event.kind.as_str())
        .json_data(event)
        .unwrap_or_else(|_| Event::default().event(event.kind.as_str()))
}

/// Push events as they are published and the current status on every tick.
///
/// The first tick fires immediately, so a late subscriber starts from the
/// current state. Dropping the stream drops the receiver, which unsubscribes.
pub async fn pipeline_stream(
    State(state): State<AppState>,
    Path(id): Path<i64>,
) -> Result<Sse<impl Stream<Item = Result<Event, Infallible>>>, ApiError> {
    state.orchestrator.get(id)?;

    let rx = state.orchestrator.subscribe(id);
    let mut ticker = tokio::time::interval(state.status_interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    let orchestrator = state.orchestrator.clone();

    let events = stream::unfold((rx, ticker, orchestrator), move |(mut rx, mut ticker, orchestrator)| async move {
        let event = loop {
            tokio::select! {
                received = rx.recv() => match received {
                    Ok(event) => break to_sse(&event),
                    Err(RecvError::Lagged(skipped)) => {
                        debug!(pipeline_id = id, skipped, "Stream subscriber lagged");
                        continue;
                    }
                    Err(RecvError::Closed) => return None,
                },
                _ = ticker.tick() => match orchestrator.get(id) {
                    Ok(pipeline) => {
                        break to_sse(&PipelineEvent::new(EventKind::Status, &pipeline, pipeline.current_phase));
                    }
                    Err(_) => return None,
                },
            }
        };
        Some((Ok(event), (rx, ticker, orchestrator)))
    });

    Ok(Sse::new(events).keep_alive(KeepAlive::default()))
}
