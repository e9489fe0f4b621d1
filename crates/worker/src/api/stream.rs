//! `GET /api/stream/events` - the SSE surface.
//!
//! Subscribes the client to the worker's broadcast channel. Slow clients
//! that lag behind get a warning frame instead of silently losing events.

use axum::extract::State;
use axum::response::sse::{Event, KeepAlive, Sse};
use axum::response::IntoResponse;
use futures_util::Stream;

use crate::runtime::events::WorkerEvent;
use crate::state::AppState;

pub async fn events(State(state): State<AppState>) -> impl IntoResponse {
    let rx = state.runtime.events.subscribe();
    tracing::debug!("SSE client connected");
    Sse::new(event_stream(rx)).keep_alive(KeepAlive::default())
}

fn event_stream(
    mut rx: tokio::sync::broadcast::Receiver<WorkerEvent>,
) -> impl Stream<Item = Result<Event, std::convert::Infallible>> {
    async_stream::stream! {
        loop {
            match rx.recv().await {
                Ok(event) => {
                    let data = serde_json::to_string(&event).unwrap_or_default();
                    yield Ok(Event::default().event(event.event_name()).data(data));
                }
                Err(tokio::sync::broadcast::error::RecvError::Lagged(n)) => {
                    let message = format!("{{\"warning\":\"missed {n} events\"}}");
                    yield Ok(Event::default().event("warning").data(message));
                }
                Err(tokio::sync::broadcast::error::RecvError::Closed) => {
                    break;
                }
            }
        }
    }
}
