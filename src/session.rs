use std::future::Future;

use futures::StreamExt;
use serde_json::{Value, json};

use crate::client::NewsClient;
use crate::error::{ClientResult, StreamError};
use crate::protocol::ChatEvent;
use crate::state::ChatState;
use crate::stream::ChatStream;

/// What a chat turn asks the backend to do.
#[derive(Debug, Clone, PartialEq)]
pub enum Turn {
    Ask { query: String },
    Analyze { article_id: i64 },
    Highlights { query: String },
}

impl Turn {
    /// The user-side entry recorded for this turn.
    pub fn user_entry(&self) -> (String, Value) {
        match self {
            Turn::Ask { query } => (query.clone(), Value::Null),
            Turn::Analyze { article_id } => (
                "Analyze above Article".to_string(),
                json!({ "type": "article", "article_id": article_id }),
            ),
            Turn::Highlights { query } => (
                format!("Search Highlights: {}", query),
                json!({ "type": "search_highlights", "query": query }),
            ),
        }
    }

    pub async fn open(
        &self,
        client: &NewsClient,
        session_id: &str,
        new_session: bool,
    ) -> ClientResult<ChatStream> {
        match self {
            Turn::Ask { query } => client.ask(query, session_id, new_session).await,
            Turn::Analyze { article_id } => client.analyze(*article_id, session_id).await,
            Turn::Highlights { query } => client.highlights(query, session_id).await,
        }
    }
}

/// Feeds every event to `on_event` until the stream ends, is aborted, or fails.
pub async fn forward_stream<F, Fut>(mut stream: ChatStream, mut on_event: F) -> Result<(), StreamError>
where
    F: FnMut(ChatEvent) -> Fut,
    Fut: Future<Output = ()>,
{
    while let Some(item) = stream.next().await {
        on_event(item?).await;
    }
    Ok(())
}

/// Runs one turn to completion against `state`, calling `observe` after
/// every applied event.
///
/// Returns `Ok(false)` when the input was blank and nothing was sent.
pub async fn run_turn<F>(
    client: &NewsClient,
    state: &mut ChatState,
    turn: &Turn,
    mut observe: F,
) -> ClientResult<bool>
where
    F: FnMut(&ChatState, &ChatEvent),
{
    let (text, data) = turn.user_entry();
    let new_session = state.is_new_session;
    if state.submit_with_data(&text, data).is_none() {
        return Ok(false);
    }

    let stream = match turn.open(client, &state.session_id, new_session).await {
        Ok(stream) => stream,
        Err(err) => {
            state.finish_stream();
            return Err(err);
        }
    };

    state.begin_stream();
    let result = forward_stream(stream, |event| {
        state.apply(&event);
        observe(&*state, &event);
        async {}
    })
    .await;
    state.finish_stream();

    if let Err(err) = result {
        tracing::warn!(session_id = %state.session_id, error = %err, "chat turn ended early");
        return Err(err.into());
    }

    Ok(true)
}
