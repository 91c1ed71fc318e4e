//! SSE stream mux for generative table execution
//!
//! Converts the executor's `(row_id, column_id, ...)` event stream into a
//! single ordered SSE response. A column's references event precedes its
//! first content chunk; a usage-only tail chunk closes each column; the
//! stream always ends with `data: [DONE]`.

use axum::response::sse::{Event, KeepAlive, Sse};
use futures::stream::Stream;
use futures::StreamExt;
use jamai_table::CellEvent;
use serde_json::json;
use std::convert::Infallible;
use tokio::sync::mpsc;
use tokio_stream::wrappers::ReceiverStream;

/// Render one executor event as its wire object, or `None` for events with
/// no wire representation.
fn render(event: CellEvent) -> Option<String> {
    let value = match event {
        CellEvent::References {
            row_id,
            column_id,
            references,
        } => json!({
            "object": "gen_table.references",
            "row_id": row_id,
            "output_column_name": column_id,
            "chunks": references.chunks,
            "search_query": references.search_query,
        }),
        CellEvent::Chunk {
            row_id,
            column_id,
            text,
        } => json!({
            "object": "gen_table.completion.chunk",
            "row_id": row_id,
            "output_column_name": column_id,
            "choices": [{
                "index": 0,
                "delta": {"content": text},
                "finish_reason": null,
            }],
        }),
        CellEvent::Usage {
            row_id,
            column_id,
            usage,
            finish_reason,
        } => json!({
            "object": "gen_table.completion.chunk",
            "row_id": row_id,
            "output_column_name": column_id,
            "choices": [{
                "index": 0,
                "delta": {},
                "finish_reason": finish_reason,
            }],
            "usage": usage,
        }),
        CellEvent::RowDone { .. } => return None,
    };
    serde_json::to_string(&value).ok()
}

/// Wrap an executor event receiver as an SSE response. Dropping the
/// response drops the receiver, which cancels the outstanding row
/// executors through their send failures.
pub fn cell_event_sse(
    rx: mpsc::Receiver<CellEvent>,
) -> Sse<impl Stream<Item = Result<Event, Infallible>>> {
    let events = ReceiverStream::new(rx)
        .filter_map(|event| {
            futures::future::ready(render(event).map(|data| Ok(Event::default().data(data))))
        })
        .chain(futures::stream::once(futures::future::ready(Ok(
            Event::default().data("[DONE]"),
        ))));
    Sse::new(events).keep_alive(KeepAlive::default())
}
