use crate::client::{HistoryPage, NewsClient};
use crate::prompts::{self, DEFAULT_SUGGESTION_COUNT};
use crate::protocol::{ChatEvent, ChatMessage, Sender};
use crate::session::{Turn, forward_stream};
use crate::state::ChatState;
use crossterm::cursor::MoveTo;
use crossterm::event::{self, Event, KeyCode, KeyModifiers};
use crossterm::execute;
use crossterm::terminal::{disable_raw_mode, enable_raw_mode, size};
use futures::stream::AbortHandle;
use ratatui::backend::CrosstermBackend;
use ratatui::layout::{Constraint, Layout};
use ratatui::style::{Color, Modifier, Style};
use ratatui::text::{Line, Span, Text};
use ratatui::widgets::{Block, Borders, Paragraph, Widget, Wrap};
use ratatui::{Frame, Terminal, TerminalOptions, Viewport};
use std::io;
use std::io::Write;
use std::time::Duration;
use tokio::sync::mpsc;

type TuiTerminal = Terminal<CrosstermBackend<io::Stdout>>;
type UiResult<T> = Result<T, Box<dyn std::error::Error + Send + Sync>>;

const INPUT_HEIGHT: u16 = 6;
const LIVE_HEIGHT: u16 = 8;

// Restores terminal settings even if the loop exits early.
struct TerminalGuard;

impl Drop for TerminalGuard {
    fn drop(&mut self) {
        let _ = disable_raw_mode();
        let _ = io::stdout().flush();
    }
}

/// Something printed into the scrollback above the viewport.
#[derive(Debug, Clone)]
enum Entry {
    Chat(ChatMessage),
    Info(String),
}

#[derive(Debug, Clone)]
struct LineSpec {
    text: String,
    style: Style,
}

impl LineSpec {
    fn new(text: impl Into<String>, style: Style) -> Self {
        Self {
            text: text.into(),
            style,
        }
    }
}

fn is_error(message: &ChatMessage) -> bool {
    message.message_data.get("type").and_then(|t| t.as_str()) == Some("error")
}

impl Entry {
    fn line_specs(&self) -> Vec<LineSpec> {
        match self {
            Entry::Chat(message) => {
                let (label, color) = match message.sender {
                    Sender::User => ("You:", Color::Blue),
                    Sender::Ai if is_error(message) => ("Assistant (error):", Color::Red),
                    Sender::Ai => ("Assistant:", Color::Yellow),
                };
                let header_style = Style::default().fg(color).add_modifier(Modifier::BOLD);
                let body_style = Style::default().fg(color);
                let mut lines = vec![LineSpec::new(label, header_style)];
                for line in message.message.lines() {
                    lines.push(LineSpec::new(format!("  {}", line), body_style));
                }
                lines
            }
            Entry::Info(msg) => msg
                .lines()
                .map(|line| {
                    LineSpec::new(
                        format!("ℹ {}", line),
                        Style::default()
                            .fg(Color::Gray)
                            .add_modifier(Modifier::ITALIC),
                    )
                })
                .collect(),
        }
    }

    fn to_text(&self) -> Text<'static> {
        let lines = self
            .line_specs()
            .into_iter()
            .map(|spec| Line::from(Span::styled(spec.text, spec.style)))
            .collect::<Vec<_>>();
        Text::from(lines)
    }

    fn rendered_height(&self, width: u16) -> u16 {
        let lines = self
            .line_specs()
            .into_iter()
            .map(|spec| spec.text)
            .collect::<Vec<_>>();
        wrapped_height(&lines, width)
    }
}

fn wrapped_height(lines: &[String], width: u16) -> u16 {
    let width = width.max(1) as usize;
    let mut total = 0usize;
    for line in lines {
        let len = line.chars().count().max(1);
        total += len.div_ceil(width);
    }
    total.min(u16::MAX as usize) as u16
}

#[derive(Debug)]
pub enum UiEvent {
    StreamOpened(AbortHandle),
    Stream(ChatEvent),
    StreamEnded,
    StreamFailed(String),
    HistoryLoaded {
        session_id: String,
        page: u32,
        history: HistoryPage,
    },
    HistoryFailed {
        session_id: String,
        error: String,
    },
    SessionDeleted(String),
    DeleteFailed(String),
}

struct InputBuffer {
    lines: Vec<String>,
    cursor_x: usize,
    cursor_y: usize,
}

impl InputBuffer {
    fn new() -> Self {
        Self {
            lines: vec![String::new()],
            cursor_x: 0,
            cursor_y: 0,
        }
    }

    fn clear(&mut self) {
        self.lines = vec![String::new()];
        self.cursor_x = 0;
        self.cursor_y = 0;
    }

    fn set(&mut self, text: &str) {
        self.lines = text.split('\n').map(str::to_string).collect();
        self.cursor_y = self.lines.len() - 1;
        self.cursor_x = self.lines[self.cursor_y].chars().count();
    }

    fn byte_index(line: &str, char_idx: usize) -> usize {
        line.char_indices()
            .nth(char_idx)
            .map(|(idx, _)| idx)
            .unwrap_or(line.len())
    }

    fn line_len(&self) -> usize {
        self.lines[self.cursor_y].chars().count()
    }

    fn insert_char(&mut self, c: char) {
        let line = &mut self.lines[self.cursor_y];
        let idx = Self::byte_index(line, self.cursor_x);
        line.insert(idx, c);
        self.cursor_x += 1;
    }

    fn delete_char(&mut self) {
        if self.cursor_x > 0 {
            let line = &mut self.lines[self.cursor_y];
            let idx = Self::byte_index(line, self.cursor_x - 1);
            line.remove(idx);
            self.cursor_x -= 1;
        } else if self.cursor_y > 0 {
            let removed = self.lines.remove(self.cursor_y);
            self.cursor_y -= 1;
            self.cursor_x = self.line_len();
            self.lines[self.cursor_y].push_str(&removed);
        }
    }

    fn new_line(&mut self) {
        let line = &self.lines[self.cursor_y];
        let remaining: String = line.chars().skip(self.cursor_x).collect();
        self.lines[self.cursor_y] = line.chars().take(self.cursor_x).collect();
        self.lines.insert(self.cursor_y + 1, remaining);
        self.cursor_y += 1;
        self.cursor_x = 0;
    }

    fn move_left(&mut self) {
        if self.cursor_x > 0 {
            self.cursor_x -= 1;
        } else if self.cursor_y > 0 {
            self.cursor_y -= 1;
            self.cursor_x = self.line_len();
        }
    }

    fn move_right(&mut self) {
        if self.cursor_x < self.line_len() {
            self.cursor_x += 1;
        } else if self.cursor_y < self.lines.len() - 1 {
            self.cursor_y += 1;
            self.cursor_x = 0;
        }
    }

    fn move_up(&mut self) {
        if self.cursor_y > 0 {
            self.cursor_y -= 1;
            self.cursor_x = self.cursor_x.min(self.line_len());
        }
    }

    fn move_down(&mut self) {
        if self.cursor_y < self.lines.len() - 1 {
            self.cursor_y += 1;
            self.cursor_x = self.cursor_x.min(self.line_len());
        }
    }

    fn text(&self) -> String {
        self.lines.join("\n")
    }

    fn is_empty(&self) -> bool {
        self.lines.iter().all(|l| l.is_empty())
    }

    fn render(&self) -> Text<'static> {
        if self.is_empty() {
            return Text::from(Span::styled(
                "Ask Anything... (Tab for a suggestion)",
                Style::default().fg(Color::DarkGray),
            ));
        }
        Text::from(
            self.lines
                .iter()
                .map(|l| Line::from(l.clone()))
                .collect::<Vec<_>>(),
        )
    }
}

pub struct App {
    state: ChatState,
    input: InputBuffer,
    should_quit: bool,
    sender: mpsc::Sender<UiEvent>,
    receiver: mpsc::Receiver<UiEvent>,
    client: NewsClient,
    /// Messages already printed into the scrollback.
    flushed: usize,
    pending_info: Vec<String>,
    /// Older messages fetched with PageUp, waiting to be printed.
    pending_history: Vec<ChatMessage>,
    confirm_delete: bool,
    streaming: bool,
    abort: Option<AbortHandle>,
    stopped_by_user: bool,
    suggestions: Vec<&'static str>,
    next_suggestion: usize,
}

impl App {
    pub fn new(client: NewsClient, state: ChatState) -> Self {
        let (sender, receiver) = mpsc::channel(256);

        let mut app = Self {
            state,
            input: InputBuffer::new(),
            should_quit: false,
            sender,
            receiver,
            client,
            flushed: 0,
            pending_info: Vec::new(),
            pending_history: Vec::new(),
            confirm_delete: false,
            streaming: false,
            abort: None,
            stopped_by_user: false,
            suggestions: Vec::new(),
            next_suggestion: 0,
        };
        if app.state.is_new_session {
            app.greet();
        }
        app
    }

    fn greet(&mut self) {
        self.suggestions = prompts::query_suggestions(DEFAULT_SUGGESTION_COUNT);
        self.next_suggestion = 0;
        let mut intro = prompts::random_intro().to_string();
        for suggestion in &self.suggestions {
            intro.push_str(&format!("\n  • {}", suggestion));
        }
        self.pending_info.push(intro);
    }

    fn title(&self) -> String {
        match (self.state.session_name(), self.state.is_new_session) {
            (Some(name), _) => format!(" {} ", name),
            (None, true) => " New chat ".to_string(),
            (None, false) => format!(" Session {} ", self.state.session_id),
        }
    }

    fn status_line(&self) -> Line<'static> {
        if !self.state.is_loading {
            return Line::default();
        }
        let text = if self.state.active_tools.is_empty() {
            "⟳ Thinking...".to_string()
        } else {
            self.state
                .active_tools
                .iter()
                .map(|tool| format!("⟳ {}", tool.message.as_deref().unwrap_or("Working...")))
                .collect::<Vec<_>>()
                .join("  ")
        };
        Line::from(Span::styled(text, Style::default().fg(Color::Cyan)))
    }

    fn draw(&mut self, f: &mut Frame) {
        let area = f.area();
        let chunks =
            Layout::vertical([Constraint::Min(0), Constraint::Length(INPUT_HEIGHT)]).split(area);
        let (live_area, input_area) = (chunks[0], chunks[1]);

        let mut live = vec![self.status_line()];
        if let Some(message) = self.live_message() {
            live.extend(
                message
                    .message
                    .lines()
                    .map(|l| Line::from(Span::styled(l.to_string(), Style::default().fg(Color::Yellow)))),
            );
        }
        let inner_width = live_area.width.saturating_sub(2);
        let inner_height = live_area.height.saturating_sub(2);
        let plain: Vec<String> = live.iter().map(|l| l.to_string()).collect();
        let overflow = wrapped_height(&plain, inner_width).saturating_sub(inner_height);
        let live_paragraph = Paragraph::new(Text::from(live))
            .block(
                Block::default()
                    .borders(Borders::ALL)
                    .title(self.title())
                    .border_style(Style::default().fg(Color::DarkGray)),
            )
            .wrap(Wrap { trim: false })
            .scroll((overflow, 0));
        f.render_widget(live_paragraph, live_area);

        let hint = if self.streaming {
            " Esc to stop, Ctrl+C to quit "
        } else {
            " Enter to send, PgUp older, Ctrl+N new, Ctrl+D delete, Esc to quit "
        };
        let input_paragraph = Paragraph::new(self.input.render())
            .block(
                Block::default()
                    .borders(Borders::ALL)
                    .title(hint)
                    .border_style(Style::default().fg(Color::DarkGray)),
            )
            .wrap(Wrap { trim: false });
        f.render_widget(input_paragraph, input_area);

        let cursor_x = (self.input.cursor_x + 1) as u16;
        let cursor_y = self.input.cursor_y as u16;
        let x = (input_area.x + cursor_x).min(input_area.x + input_area.width.saturating_sub(2));
        let y = (input_area.y + 1 + cursor_y).min(input_area.y + input_area.height.saturating_sub(2));
        f.set_cursor_position((x, y));
    }

    /// The AI entry still being streamed, which stays out of the scrollback.
    fn live_message(&self) -> Option<&ChatMessage> {
        if !self.streaming {
            return None;
        }
        self.state
            .messages
            .last()
            .filter(|m| m.sender == Sender::Ai && self.state.messages.len() > self.flushed)
    }

    fn print_entry(&self, terminal: &mut TuiTerminal, entry: Entry) -> UiResult<()> {
        let width = terminal.size()?.width;
        let height = entry.rendered_height(width).saturating_add(1);
        let mut text = entry.to_text();
        text.extend(Text::raw("\n"));
        // Insert above the inline viewport so the log stays in scrollback.
        terminal.insert_before(height, |buf| {
            let paragraph = Paragraph::new(text).wrap(Wrap { trim: false });
            paragraph.render(buf.area, buf);
        })?;
        Ok(())
    }

    fn flush(&mut self, terminal: &mut TuiTerminal) -> UiResult<()> {
        let older = std::mem::take(&mut self.pending_history);
        if !older.is_empty() {
            self.print_entry(terminal, Entry::Info("Earlier messages:".to_string()))?;
            for message in older {
                self.print_entry(terminal, Entry::Chat(message))?;
            }
        }

        let mut limit = self.state.messages.len();
        if self.live_message().is_some() {
            limit -= 1;
        }
        while self.flushed < limit {
            let message = self.state.messages[self.flushed].clone();
            self.flushed += 1;
            if message.sender == Sender::Ai && message.message.is_empty() {
                continue;
            }
            self.print_entry(terminal, Entry::Chat(message))?;
        }
        for info in std::mem::take(&mut self.pending_info) {
            self.print_entry(terminal, Entry::Info(info))?;
        }
        Ok(())
    }

    fn handle_ui_event(&mut self, event: UiEvent) {
        match event {
            UiEvent::StreamOpened(handle) => {
                self.state.begin_stream();
                self.abort = Some(handle);
            }
            UiEvent::Stream(event) => self.state.apply(&event),
            UiEvent::StreamEnded => {
                self.end_turn();
                if std::mem::take(&mut self.stopped_by_user) {
                    self.pending_info.push("Stopped.".to_string());
                }
            }
            UiEvent::StreamFailed(err) => {
                self.end_turn();
                self.pending_info.push(format!("Error: {}", err));
            }
            UiEvent::HistoryLoaded {
                session_id,
                page,
                history,
            } => {
                if session_id != self.state.session_id {
                    return;
                }
                let older = history.messages.clone();
                let added = self.state.prepend_page(page, history.messages, history.has_more);
                if added == 0 {
                    self.pending_info.push("No older messages.".to_string());
                    return;
                }
                // The prepended page sits before everything already printed.
                self.flushed += added;
                self.pending_history.extend(older);
            }
            UiEvent::HistoryFailed { session_id, error } => {
                if session_id == self.state.session_id {
                    self.state.history.page_failed();
                    self.pending_info.push(format!("Error: {}", error));
                }
            }
            UiEvent::SessionDeleted(session_id) => {
                if self.state.remove_session(&session_id) {
                    self.open_new_chat("Chat deleted.");
                }
            }
            UiEvent::DeleteFailed(err) => {
                self.pending_info.push(format!("Error: {}", err));
            }
        }
    }

    fn end_turn(&mut self) {
        self.state.finish_stream();
        self.streaming = false;
        self.abort = None;
    }

    fn start_turn(&mut self, turn: Turn) {
        if self.streaming {
            return;
        }
        let (text, data) = turn.user_entry();
        let new_session = self.state.is_new_session;
        if self.state.submit_with_data(&text, data).is_none() {
            return;
        }
        self.streaming = true;

        let client = self.client.clone();
        let sender = self.sender.clone();
        let session_id = self.state.session_id.clone();
        tokio::spawn(async move {
            let stream = match turn.open(&client, &session_id, new_session).await {
                Ok(stream) => stream,
                Err(err) => {
                    tracing::warn!(session_id = %session_id, error = %err, "could not open chat stream");
                    let _ = sender.send(UiEvent::StreamFailed(err.to_string())).await;
                    return;
                }
            };

            let _ = sender.send(UiEvent::StreamOpened(stream.abort_handle())).await;
            let result = forward_stream(stream, |event| {
                let sender = sender.clone();
                async move {
                    let _ = sender.send(UiEvent::Stream(event)).await;
                }
            })
            .await;

            let done = match result {
                Ok(()) => UiEvent::StreamEnded,
                Err(err) => UiEvent::StreamFailed(err.to_string()),
            };
            let _ = sender.send(done).await;
        });
    }

    fn new_chat(&mut self) {
        if self.streaming || self.state.is_new_session {
            return;
        }
        self.open_new_chat("Started a new chat.");
    }

    fn open_new_chat(&mut self, note: &str) {
        self.state
            .reset_for_session(prompts::new_session_id(), true);
        self.flushed = 0;
        self.pending_history.clear();
        self.pending_info.push(note.to_string());
        self.greet();
    }

    fn load_older(&mut self) {
        let Some(page) = self.state.history.next_page() else {
            if !self.state.history.has_more {
                self.pending_info.push("No older messages.".to_string());
            }
            return;
        };

        let client = self.client.clone();
        let sender = self.sender.clone();
        let session_id = self.state.session_id.clone();
        tokio::spawn(async move {
            let result = client.chat_messages(&session_id, page).await;
            let event = match result {
                Ok(history) => UiEvent::HistoryLoaded {
                    session_id,
                    page,
                    history,
                },
                Err(err) => {
                    tracing::warn!(session_id = %session_id, page, error = %err, "could not load history");
                    UiEvent::HistoryFailed {
                        session_id,
                        error: err.to_string(),
                    }
                }
            };
            let _ = sender.send(event).await;
        });
    }

    /// First press asks for confirmation, the second deletes.
    fn delete_chat(&mut self) {
        if self.streaming || self.state.is_new_session {
            self.pending_info.push("Nothing to delete yet.".to_string());
            return;
        }
        if !std::mem::take(&mut self.confirm_delete) {
            self.confirm_delete = true;
            self.pending_info
                .push("Delete this chat and its messages? Press Ctrl+D again to confirm.".to_string());
            return;
        }

        let client = self.client.clone();
        let sender = self.sender.clone();
        let session_id = self.state.session_id.clone();
        tokio::spawn(async move {
            let result = client.delete_session(&session_id).await;
            let event = match result {
                Ok(()) => UiEvent::SessionDeleted(session_id),
                Err(err) => UiEvent::DeleteFailed(err.to_string()),
            };
            let _ = sender.send(event).await;
        });
    }

    fn stop_or_quit(&mut self) {
        match self.abort.take() {
            Some(handle) => {
                handle.abort();
                self.stopped_by_user = true;
            }
            None if !self.streaming => self.should_quit = true,
            None => {}
        }
    }

    fn handle_events(&mut self, terminal: &mut TuiTerminal) -> UiResult<bool> {
        while let Ok(event) = self.receiver.try_recv() {
            self.handle_ui_event(event);
        }
        self.flush(terminal)?;

        if event::poll(Duration::from_millis(50))? {
            if let Event::Key(key) = event::read()? {
                let deleting = key.modifiers.contains(KeyModifiers::CONTROL)
                    && key.code == KeyCode::Char('d');
                if !deleting {
                    self.confirm_delete = false;
                }

                if key.modifiers.contains(KeyModifiers::CONTROL) {
                    match key.code {
                        KeyCode::Char('c') => {
                            if let Some(handle) = self.abort.take() {
                                handle.abort();
                            }
                            self.should_quit = true;
                            return Ok(false);
                        }
                        KeyCode::Char('n') => {
                            self.new_chat();
                            return Ok(true);
                        }
                        KeyCode::Char('d') => {
                            self.delete_chat();
                            return Ok(true);
                        }
                        _ => {}
                    }
                }

                match key.code {
                    KeyCode::Esc => {
                        self.stop_or_quit();
                        if self.should_quit {
                            return Ok(false);
                        }
                    }
                    KeyCode::Enter => {
                        if key.modifiers.contains(KeyModifiers::SHIFT) {
                            self.input.new_line();
                        } else if !self.streaming && !self.input.is_empty() {
                            let query = self.input.text();
                            if !query.trim().is_empty() {
                                self.input.clear();
                                self.start_turn(Turn::Ask { query });
                            }
                        }
                    }
                    KeyCode::Tab => {
                        if self.state.is_new_session && !self.suggestions.is_empty() {
                            let pick = self.suggestions[self.next_suggestion % self.suggestions.len()];
                            self.next_suggestion += 1;
                            self.input.set(pick);
                        }
                    }
                    KeyCode::Char(c) => self.input.insert_char(c),
                    KeyCode::Backspace => self.input.delete_char(),
                    KeyCode::Left => self.input.move_left(),
                    KeyCode::Right => self.input.move_right(),
                    KeyCode::Up => self.input.move_up(),
                    KeyCode::Down => self.input.move_down(),
                    KeyCode::PageUp => self.load_older(),
                    KeyCode::Home => self.input.cursor_x = 0,
                    KeyCode::End => self.input.cursor_x = self.input.line_len(),
                    _ => {}
                }
            }
        }

        Ok(true)
    }
}

pub fn run_tui(client: NewsClient, state: ChatState) -> UiResult<()> {
    enable_raw_mode()?;
    let _guard = TerminalGuard;
    let mut stdout = io::stdout();
    let (_, rows) = size()?;
    if rows > 0 {
        // Push existing screen content into scrollback without clearing it.
        for _ in 0..rows {
            writeln!(stdout)?;
        }
        stdout.flush()?;
    }
    execute!(stdout, MoveTo(0, 0))?;
    let backend = CrosstermBackend::new(stdout);
    let mut terminal = Terminal::with_options(
        backend,
        TerminalOptions {
            viewport: Viewport::Inline(INPUT_HEIGHT + LIVE_HEIGHT),
        },
    )?;

    let mut app = App::new(client, state);

    app.flush(&mut terminal)?;
    terminal.draw(|f| app.draw(f))?;

    while !app.should_quit {
        if !app.handle_events(&mut terminal)? {
            break;
        }

        terminal.draw(|f| app.draw(f))?;

        std::thread::sleep(Duration::from_millis(10));
    }

    disable_raw_mode()?;
    io::stdout().flush()?;

    Ok(())
}
