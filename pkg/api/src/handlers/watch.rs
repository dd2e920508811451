use axum::{
    extract::{Query, State},
    response::sse::{Event, KeepAlive, Sse},
};
use pkg_state::{EventType, WatchEvent};
use pkg_types::{ControlError, Kind};
use serde::Deserialize;
use std::convert::Infallible;
use tokio_stream::{Stream, StreamExt, StreamMap};
use tracing::info;

use crate::AppState;
use crate::error::ApiError;

#[derive(Debug, Deserialize)]
pub struct WatchQuery {
    #[serde(default)]
    pub kind: Option<String>,
}

fn event_name(event: &WatchEvent) -> &'static str {
    match event.event_type {
        EventType::Added => "added",
        EventType::Modified => "modified",
        EventType::Deleted => "deleted",
    }
}

/// GET /api/v1/watch?kind=pods: SSE stream of store events. Without `kind`
/// both kinds are streamed. Events start at subscription time.
pub async fn watch_events(
    State(state): State<AppState>,
    Query(query): Query<WatchQuery>,
) -> Result<Sse<impl Stream<Item = Result<Event, Infallible>>>, ApiError> {
    let kinds: Vec<Kind> = match query.kind.as_deref() {
        Some(kind) => vec![kind.parse().map_err(ControlError::Validation)?],
        None => Kind::ALL.to_vec(),
    };
    info!("Watch subscription: kinds={:?}", kinds);

    let mut streams = StreamMap::new();
    for kind in kinds {
        streams.insert(kind, state.store.watch(kind).await?.into_stream());
    }

    let events = streams.filter_map(|(_, event)| {
        serde_json::to_string(&event)
            .ok()
            .map(|data| Ok(Event::default().event(event_name(&event)).data(data)))
    });

    Ok(Sse::new(events).keep_alive(KeepAlive::default()))
}
