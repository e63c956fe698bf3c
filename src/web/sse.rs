//! Server-Sent Events for live inference results

use axum::response::sse::{Event, KeepAlive, Sse};
use futures::stream::Stream;
use std::convert::Infallible;
use std::sync::Arc;
use std::time::Duration;
use tokio_stream::wrappers::BroadcastStream;
use tokio_stream::StreamExt;

use crate::{AppState, ProbabilityUpdate};

/// Create an SSE stream of `probability` events
pub fn create_probability_stream(
    app_state: Arc<AppState>,
) -> Sse<impl Stream<Item = Result<Event, Infallible>>> {
    let rx = app_state.subscribe_probability();

    let stream = BroadcastStream::new(rx).filter_map(|result| match result {
        Ok(update) => Some(Ok(update_to_event(&update))),
        Err(_) => None, // Skip lagged messages
    });

    Sse::new(stream).keep_alive(
        KeepAlive::new()
            .interval(Duration::from_secs(15))
            .text("keep-alive"),
    )
}

fn update_to_event(update: &ProbabilityUpdate) -> Event {
    let data = serde_json::to_string(update).unwrap_or_else(|_| "{}".to_string());
    Event::default().event("probability").data(data)
}
