//! Chat state and the reducer that folds stream events into it.
//!
//! The UI owns a [`ChatState`]; everything that changes it goes through the
//! methods here, so the whole chat flow can be exercised without a terminal.

use serde_json::json;

use crate::protocol::{ChatEvent, ChatMessage, Sender, ToolEvent, ToolStatus, UNTITLED, error_text};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ActiveTool {
    pub tool_call_id: String,
    pub message: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChatSession {
    pub session_id: String,
    pub session_name: Option<String>,
}

impl ChatSession {
    pub fn unnamed(session_id: impl Into<String>) -> Self {
        Self {
            session_id: session_id.into(),
            session_name: None,
        }
    }
}

/// How far back a session's stored history has been loaded.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct HistoryCursor {
    pub pages_loaded: u32,
    pub has_more: bool,
    pub in_flight: bool,
}

impl HistoryCursor {
    /// Claims the next older page, unless none is left or one is on its way.
    pub fn next_page(&mut self) -> Option<u32> {
        if !self.has_more || self.in_flight {
            return None;
        }
        self.in_flight = true;
        Some(self.pages_loaded + 1)
    }

    pub fn page_failed(&mut self) {
        self.in_flight = false;
    }
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct ChatState {
    pub session_id: String,
    pub is_new_session: bool,
    pub messages: Vec<ChatMessage>,
    /// Tools currently running, in arrival order.
    pub active_tools: Vec<ActiveTool>,
    pub sessions: Vec<ChatSession>,
    pub is_loading: bool,
    pub history: HistoryCursor,
}

/// Pure form of [`ChatState::apply`].
pub fn reduce(mut state: ChatState, event: &ChatEvent) -> ChatState {
    state.apply(event);
    state
}

impl ChatState {
    pub fn new(session_id: impl Into<String>, is_new_session: bool) -> Self {
        Self {
            session_id: session_id.into(),
            is_new_session,
            ..Self::default()
        }
    }

    pub fn apply(&mut self, event: &ChatEvent) {
        match event {
            ChatEvent::Tool(tool) => self.apply_tool(tool),
            ChatEvent::Model { message } => {
                self.active_tools.clear();
                self.is_loading = false;
                self.append_model_text(message);
            }
            ChatEvent::Title { message } => {
                let title = message
                    .as_ref()
                    .and_then(|payload| payload.title.as_deref())
                    .unwrap_or(UNTITLED);
                self.rename_session(title);
            }
            ChatEvent::Error { message } => self.apply_error(error_text(message)),
            ChatEvent::Unknown => {
                tracing::warn!(session_id = %self.session_id, "ignoring unknown chat event");
            }
        }
    }

    fn apply_tool(&mut self, tool: &ToolEvent) {
        let id = tool.tool_call_id.as_deref().filter(|id| !id.is_empty());
        let (Some(id), Some(status)) = (id, tool.tool_status) else {
            tracing::debug!(?tool, "tool event without id or status");
            return;
        };

        match status {
            ToolStatus::Started => {
                let entry = ActiveTool {
                    tool_call_id: id.to_string(),
                    message: tool.message.clone(),
                };
                match self.active_tools.iter_mut().find(|t| t.tool_call_id == id) {
                    Some(existing) => *existing = entry,
                    None => self.active_tools.push(entry),
                }
            }
            ToolStatus::Ended => self.active_tools.retain(|t| t.tool_call_id != id),
            ToolStatus::Other => {
                tracing::debug!(tool_call_id = id, "ignoring tool event with unknown status");
            }
        }
    }

    fn append_model_text(&mut self, text: &str) {
        if text.is_empty() {
            return;
        }
        if let Some(last) = self.messages.last_mut() {
            if last.sender == Sender::Ai {
                last.message.push_str(text);
            }
        }
    }

    fn rename_session(&mut self, title: &str) {
        if let Some(session) = self
            .sessions
            .iter_mut()
            .find(|s| s.session_id == self.session_id)
        {
            session.session_name = Some(title.to_string());
        }
    }

    fn apply_error(&mut self, text: String) {
        let entry = ChatMessage::ai(text).with_data(json!({ "type": "error" }));
        match self.messages.last_mut() {
            Some(last)
                if last.sender == Sender::Ai && last.message.is_empty() && last.has_no_data() =>
            {
                *last = entry;
            }
            _ => self.messages.push(entry),
        }
    }

    /// Records a user turn. Returns the trimmed text, or `None` when blank.
    pub fn submit_user_message(&mut self, raw: &str) -> Option<String> {
        self.submit_with_data(raw, serde_json::Value::Null)
    }

    pub fn submit_with_data(&mut self, raw: &str, data: serde_json::Value) -> Option<String> {
        let text = raw.trim();
        if text.is_empty() {
            return None;
        }

        self.messages.push(ChatMessage::user(text).with_data(data));
        self.is_loading = true;
        self.active_tools.clear();

        if self.is_new_session {
            let id = self.session_id.clone();
            self.sessions.retain(|s| s.session_id != id);
            self.sessions.insert(0, ChatSession::unnamed(id));
        }

        Some(text.to_string())
    }

    /// Adds the empty AI entry that model fragments accumulate into.
    pub fn begin_stream(&mut self) {
        self.messages.push(ChatMessage::ai(""));
        self.is_new_session = false;
    }

    /// Clears progress indicators once the stream is over, however it ended.
    pub fn finish_stream(&mut self) {
        self.active_tools.clear();
        self.is_loading = false;
    }

    /// Puts an older page (chronological order) in front of the loaded messages.
    pub fn prepend_history(&mut self, page: Vec<ChatMessage>) {
        let mut merged = page;
        merged.append(&mut self.messages);
        self.messages = merged;
    }

    /// Prepends history page `page` unless it was already loaded. Returns
    /// how many messages were added.
    pub fn prepend_page(&mut self, page: u32, messages: Vec<ChatMessage>, has_more: bool) -> usize {
        self.history.in_flight = false;
        if page <= self.history.pages_loaded {
            tracing::debug!(page, "history page already loaded");
            return 0;
        }

        let added = messages.len();
        self.prepend_history(messages);
        self.history.pages_loaded = page;
        self.history.has_more = has_more;
        added
    }

    /// Drops a deleted session from the list. Returns true when it was the
    /// session currently open.
    pub fn remove_session(&mut self, session_id: &str) -> bool {
        self.sessions.retain(|s| s.session_id != session_id);
        self.session_id == session_id
    }

    pub fn clear_sessions(&mut self) {
        self.sessions.clear();
    }

    /// Switches to another session, keeping the session list.
    pub fn reset_for_session(&mut self, session_id: impl Into<String>, is_new_session: bool) {
        let sessions = std::mem::take(&mut self.sessions);
        *self = ChatState::new(session_id, is_new_session);
        self.sessions = sessions;
    }

    pub fn session_name(&self) -> Option<&str> {
        self.sessions
            .iter()
            .find(|s| s.session_id == self.session_id)
            .and_then(|s| s.session_name.as_deref())
    }

    pub fn last_message(&self) -> Option<&ChatMessage> {
        self.messages.last()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::TitlePayload;
    use serde_json::Value;

    fn tool_ids(state: &ChatState) -> Vec<&str> {
        state
            .active_tools
            .iter()
            .map(|t| t.tool_call_id.as_str())
            .collect()
    }

    #[test]
    fn ended_tool_is_removed_from_active_set() {
        let state = [
            ChatEvent::tool_started("a", None),
            ChatEvent::tool_started("b", None),
            ChatEvent::tool_ended("a"),
        ]
        .iter()
        .fold(ChatState::new("s1", false), reduce);

        assert_eq!(tool_ids(&state), vec!["b"]);
    }

    #[test]
    fn duplicate_started_event_replaces_message() {
        let mut state = ChatState::new("s1", false);
        state.apply(&ChatEvent::tool_started("a", Some("Searching")));
        state.apply(&ChatEvent::tool_started("a", Some("Scraping")));

        assert_eq!(
            state.active_tools,
            vec![ActiveTool {
                tool_call_id: "a".to_string(),
                message: Some("Scraping".to_string()),
            }]
        );
    }

    #[test]
    fn ending_unknown_tool_is_a_no_op() {
        let mut state = ChatState::new("s1", false);
        state.apply(&ChatEvent::tool_started("a", None));
        state.apply(&ChatEvent::tool_ended("zzz"));
        assert_eq!(tool_ids(&state), vec!["a"]);
    }

    #[test]
    fn tool_event_without_id_is_ignored() {
        let mut state = ChatState::new("s1", false);
        state.apply(&ChatEvent::Tool(ToolEvent {
            tool_call_id: None,
            tool_status: Some(ToolStatus::Started),
            message: None,
        }));
        assert!(state.active_tools.is_empty());
    }

    #[test]
    fn tool_event_with_empty_id_is_ignored() {
        let mut state = ChatState::new("s1", false);
        state.apply(&ChatEvent::tool_started("", Some("Searching")));
        assert!(state.active_tools.is_empty());
    }

    #[test]
    fn model_fragments_accumulate_on_ai_placeholder() {
        let mut state = ChatState::new("s1", false);
        state.messages.push(ChatMessage::ai(""));
        state.apply(&ChatEvent::model("Hello"));
        state.apply(&ChatEvent::model(" world"));

        assert_eq!(state.last_message(), Some(&ChatMessage::ai("Hello world")));
    }

    #[test]
    fn model_fragment_clears_tools_and_loading() {
        let mut state = ChatState::new("s1", false);
        state.submit_user_message("hi");
        state.begin_stream();
        state.apply(&ChatEvent::tool_started("1", None));
        assert!(state.is_loading);

        state.apply(&ChatEvent::model("ok"));
        assert!(state.active_tools.is_empty());
        assert!(!state.is_loading);
    }

    #[test]
    fn model_fragment_does_not_touch_user_message() {
        let mut state = ChatState::new("s1", false);
        state.messages.push(ChatMessage::user("question"));
        state.apply(&ChatEvent::model("answer"));
        assert_eq!(state.messages, vec![ChatMessage::user("question")]);
    }

    #[test]
    fn model_fragment_on_empty_list_is_a_no_op() {
        let mut state = ChatState::new("s1", false);
        state.apply(&ChatEvent::model("orphan"));
        assert!(state.messages.is_empty());
    }

    #[test]
    fn title_renames_only_current_session() {
        let mut state = ChatState::new("s1", false);
        state.sessions = vec![
            ChatSession::unnamed("s0"),
            ChatSession::unnamed("s1"),
            ChatSession {
                session_id: "s2".to_string(),
                session_name: Some("Older".to_string()),
            },
        ];
        state.apply(&ChatEvent::title("Foo"));

        assert_eq!(state.sessions[0].session_name, None);
        assert_eq!(state.sessions[1].session_name.as_deref(), Some("Foo"));
        assert_eq!(state.sessions[2].session_name.as_deref(), Some("Older"));
        assert_eq!(state.session_name(), Some("Foo"));
    }

    #[test]
    fn title_without_match_is_silent() {
        let mut state = ChatState::new("missing", false);
        state.sessions = vec![ChatSession::unnamed("s1")];
        state.apply(&ChatEvent::title("Foo"));
        assert_eq!(state.sessions, vec![ChatSession::unnamed("s1")]);
    }

    #[test]
    fn title_without_payload_defaults_to_untitled() {
        let mut state = ChatState::new("s1", false);
        state.sessions = vec![ChatSession::unnamed("s1")];
        state.apply(&ChatEvent::Title {
            message: Some(TitlePayload { title: None }),
        });
        assert_eq!(state.session_name(), Some(UNTITLED));
    }

    #[test]
    fn title_line_without_object_payload_defaults_to_untitled() {
        let mut state = ChatState::new("s1", false);
        state.sessions = vec![ChatSession::unnamed("s1")];
        let event = ChatEvent::from_line(r#"{"type":"title","message":"Foo"}"#).unwrap();
        state.apply(&event);
        assert_eq!(state.session_name(), Some(UNTITLED));
    }

    #[test]
    fn error_fills_empty_placeholder() {
        let mut state = ChatState::new("s1", false);
        state.submit_user_message("hi");
        state.begin_stream();
        state.apply(&ChatEvent::Error {
            message: Value::String("quota exceeded".to_string()),
        });

        assert_eq!(state.messages.len(), 2);
        let last = state.last_message().unwrap();
        assert_eq!(last.message, "quota exceeded");
        assert_eq!(last.message_data, json!({"type": "error"}));
    }

    #[test]
    fn error_after_partial_answer_is_appended() {
        let mut state = ChatState::new("s1", false);
        state.begin_stream();
        state.apply(&ChatEvent::model("partial"));
        state.apply(&ChatEvent::Error {
            message: Value::Null,
        });

        assert_eq!(state.messages.len(), 2);
        assert_eq!(state.messages[0].message, "partial");
        assert_eq!(
            state.messages[1].message,
            crate::protocol::UNEXPECTED_ERROR
        );
    }

    #[test]
    fn unknown_event_changes_nothing() {
        let mut state = ChatState::new("s1", false);
        state.messages.push(ChatMessage::ai("x"));
        let before = state.clone();
        state.apply(&ChatEvent::Unknown);
        assert_eq!(state, before);
    }

    #[test]
    fn submit_in_new_session_prepends_session_once() {
        let mut state = ChatState::new("s2", true);
        state.sessions = vec![ChatSession::unnamed("s1"), ChatSession::unnamed("s2")];

        assert_eq!(state.submit_user_message("  what's new?  ").as_deref(), Some("what's new?"));
        assert_eq!(
            state.sessions,
            vec![ChatSession::unnamed("s2"), ChatSession::unnamed("s1")]
        );
        assert!(state.is_loading);

        state.begin_stream();
        assert!(!state.is_new_session);
    }

    #[test]
    fn blank_submit_is_rejected() {
        let mut state = ChatState::new("s1", true);
        assert_eq!(state.submit_user_message("   \n"), None);
        assert!(state.messages.is_empty());
        assert!(state.sessions.is_empty());
        assert!(!state.is_loading);
    }

    #[test]
    fn finish_stream_clears_indicators() {
        let mut state = ChatState::new("s1", false);
        state.submit_user_message("hi");
        state.apply(&ChatEvent::tool_started("1", None));
        state.finish_stream();
        assert!(state.active_tools.is_empty());
        assert!(!state.is_loading);
    }

    #[test]
    fn prepend_history_keeps_chronological_order() {
        let mut state = ChatState::new("s1", false);
        state.messages = vec![ChatMessage::user("c"), ChatMessage::ai("d")];
        state.prepend_history(vec![ChatMessage::user("a"), ChatMessage::ai("b")]);

        let texts: Vec<_> = state.messages.iter().map(|m| m.message.as_str()).collect();
        assert_eq!(texts, vec!["a", "b", "c", "d"]);
    }

    #[test]
    fn reset_keeps_session_list() {
        let mut state = ChatState::new("s1", false);
        state.sessions = vec![ChatSession::unnamed("s1")];
        state.messages.push(ChatMessage::user("hi"));
        state.reset_for_session("s2", true);

        assert_eq!(state.session_id, "s2");
        assert!(state.is_new_session);
        assert!(state.messages.is_empty());
        assert_eq!(state.sessions, vec![ChatSession::unnamed("s1")]);
    }

    #[test]
    fn history_pages_are_claimed_once_and_in_order() {
        let mut state = ChatState::new("s1", false);
        assert_eq!(state.history.next_page(), None);

        let added = state.prepend_page(1, vec![ChatMessage::user("newest")], true);
        assert_eq!(added, 1);
        assert_eq!(state.history.pages_loaded, 1);

        assert_eq!(state.history.next_page(), Some(2));
        assert_eq!(state.history.next_page(), None, "page 2 is already in flight");

        state.prepend_page(2, vec![ChatMessage::user("older")], false);
        assert_eq!(
            state.messages,
            vec![ChatMessage::user("older"), ChatMessage::user("newest")]
        );
        assert!(!state.history.has_more);
        assert_eq!(state.history.next_page(), None);
    }

    #[test]
    fn repeated_history_page_is_ignored() {
        let mut state = ChatState::new("s1", false);
        state.prepend_page(1, vec![ChatMessage::user("a")], true);
        assert_eq!(state.prepend_page(1, vec![ChatMessage::user("a")], true), 0);
        assert_eq!(state.messages.len(), 1);
    }

    #[test]
    fn failed_history_page_can_be_retried() {
        let mut state = ChatState::new("s1", false);
        state.prepend_page(1, Vec::new(), true);
        assert_eq!(state.history.next_page(), Some(2));
        state.history.page_failed();
        assert_eq!(state.history.next_page(), Some(2));
    }

    #[test]
    fn reset_starts_history_afresh() {
        let mut state = ChatState::new("s1", false);
        state.prepend_page(1, vec![ChatMessage::user("a")], true);
        state.reset_for_session("s2", true);
        assert_eq!(state.history, HistoryCursor::default());
    }

    #[test]
    fn removing_sessions() {
        let mut state = ChatState::new("s1", false);
        state.sessions = vec![ChatSession::unnamed("s0"), ChatSession::unnamed("s1")];

        assert!(!state.remove_session("s0"));
        assert_eq!(state.sessions, vec![ChatSession::unnamed("s1")]);
        assert!(state.remove_session("s1"));
        assert!(state.sessions.is_empty());

        state.sessions = vec![ChatSession::unnamed("s2")];
        state.clear_sessions();
        assert!(state.sessions.is_empty());
    }
}
