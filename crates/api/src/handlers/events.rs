use axum::{
    extract::{Path, State},
    response::sse::{Event, KeepAlive, Sse},
};
use futures::{stream, Stream};
use tracing::debug;

use crate::routes::AppState;

/// 以 SSE 推送某个用户的任务与配额事件
pub async fn subscribe_events(
    State(state): State<AppState>,
    Path(user_id): Path<i64>,
) -> Sse<impl Stream<Item = Result<Event, axum::Error>>> {
    let subscription = state.events.subscribe_user(user_id);
    debug!("用户 {} 订阅事件推送", user_id);

    let events = stream::unfold(subscription, |mut subscription| async move {
        let event = subscription.recv().await?;
        let frame = Event::default()
            .id(event.id.to_string())
            .event(event.event.event_type())
            .json_data(&event);
        Some((frame, subscription))
    });

    Sse::new(events).keep_alive(KeepAlive::default())
}
