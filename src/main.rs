use std::io::{self, BufRead, Write};

use clap::Parser;
use newsdigest::auth::{AuthStore, remove_token_files, write_refresh_token_file, write_token_file};
use newsdigest::config::{Cli, Command, init_logging};
use newsdigest::protocol::{ChatEvent, Sender, ToolStatus, error_text};
use newsdigest::session::{Turn, run_turn};
use newsdigest::state::{ChatSession, ChatState};
use newsdigest::{ClientError, NewsClient, prompts, ui};

type MainResult<T> = Result<T, Box<dyn std::error::Error + Send + Sync>>;

#[tokio::main]
async fn main() -> MainResult<()> {
    dotenvy::dotenv().ok();

    let cli = Cli::parse();
    init_logging(cli.log_target().as_deref())?;

    let auth = cli.auth_store();
    let client = NewsClient::new(cli.client_config(), auth.clone())?;
    tracing::debug!(base_url = client.base_url(), "client ready");

    match cli.command() {
        Command::Login { username, password } => {
            let password = match password {
                Some(password) => password,
                None => prompt_line("Password: ")?,
            };
            let tokens = client.login(&username, &password).await?;
            let path = write_token_file(&tokens.access_token)?;
            if let Some(refresh) = &tokens.refresh_token {
                write_refresh_token_file(refresh)?;
            }
            println!("Logged in; token saved to {}", path.display());
        }
        Command::Logout => {
            if let Err(err) = client.logout().await {
                tracing::warn!(error = %err, "logout request failed");
            }
            remove_token_files()?;
            println!("Logged out.");
        }
        Command::Chat { session } => {
            require_auth(&auth).await?;
            let state = match session {
                Some(id) => resume_session(&client, id).await?,
                None => ChatState::new(prompts::new_session_id(), true),
            };
            ui::run_tui(client, state)?;
        }
        Command::Ask { query, session } => {
            require_auth(&auth).await?;
            let turn = Turn::Ask {
                query: query.join(" "),
            };
            print_turn(&client, session, turn).await?;
        }
        Command::Analyze { article_id } => {
            require_auth(&auth).await?;
            print_turn(&client, None, Turn::Analyze { article_id }).await?;
        }
        Command::Highlights { query } => {
            require_auth(&auth).await?;
            let turn = Turn::Highlights {
                query: query.join(" "),
            };
            print_turn(&client, None, turn).await?;
        }
        Command::History { session_id, page } => {
            require_auth(&auth).await?;
            let history = client.chat_messages(&session_id, page).await?;
            for message in &history.messages {
                let label = match message.sender {
                    Sender::User => "You",
                    Sender::Ai => "Assistant",
                };
                println!("{}:\n{}\n", label, message.message);
            }
            if history.has_more {
                eprintln!("older messages: --page {}", page + 1);
            }
        }
        Command::DeleteChat { session_id } => {
            require_auth(&auth).await?;
            client.delete_session(&session_id).await?;
            println!("Deleted chat {}.", session_id);
        }
        Command::DeleteHistory { yes } => {
            require_auth(&auth).await?;
            if !yes {
                let answer = prompt_line("Delete your entire chat history? This cannot be undone. [y/N] ")?;
                if !answer.trim().eq_ignore_ascii_case("y") {
                    println!("Cancelled.");
                    return Ok(());
                }
            }
            client.delete_history().await?;
            println!("Deleted all chats.");
        }
        Command::Feed { topic, page } => {
            let feed = client.feed(&topic, page).await;
            for article in &feed.articles {
                println!("{}", article);
            }
            if !feed.has_more {
                eprintln!("No more articles.");
            }
        }
    }

    Ok(())
}

async fn require_auth(auth: &AuthStore) -> Result<(), ClientError> {
    if auth.token().await.is_none() && !auth.can_refresh().await {
        return Err(ClientError::MissingToken);
    }
    Ok(())
}

async fn resume_session(client: &NewsClient, session_id: String) -> MainResult<ChatState> {
    let mut state = ChatState::new(session_id.clone(), false);
    state.sessions.push(ChatSession::unnamed(session_id.clone()));
    let history = client.chat_messages(&session_id, 1).await?;
    state.prepend_page(1, history.messages, history.has_more);
    Ok(state)
}

/// Runs one turn, streaming the answer to stdout and progress to stderr.
async fn print_turn(client: &NewsClient, session: Option<String>, turn: Turn) -> MainResult<()> {
    let mut state = match session {
        Some(id) => {
            let mut state = ChatState::new(id.clone(), false);
            state.sessions.push(ChatSession::unnamed(id));
            state
        }
        None => ChatState::new(prompts::new_session_id(), true),
    };

    let mut stdout = io::stdout();
    let sent = run_turn(client, &mut state, &turn, |_, event| match event {
        ChatEvent::Model { message } => {
            print!("{}", message);
            let _ = stdout.flush();
        }
        ChatEvent::Tool(tool) if tool.tool_status == Some(ToolStatus::Started) => {
            eprintln!("… {}", tool.message.as_deref().unwrap_or("Working..."));
        }
        ChatEvent::Error { message } => eprintln!("error: {}", error_text(message)),
        _ => {}
    })
    .await?;

    if !sent {
        eprintln!("Nothing to send.");
        return Ok(());
    }

    println!();
    match state.session_name() {
        Some(name) => eprintln!("session {} ({})", state.session_id, name),
        None => eprintln!("session {}", state.session_id),
    }
    Ok(())
}

fn prompt_line(prompt: &str) -> io::Result<String> {
    eprint!("{}", prompt);
    io::stderr().flush()?;
    let mut line = String::new();
    io::stdin().lock().read_line(&mut line)?;
    Ok(line.trim_end_matches(['\r', '\n']).to_string())
}
