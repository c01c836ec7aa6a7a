#![deny(dead_code)]
use anyhow::Result;
use clap::Parser;
use log::{error, info, warn, LevelFilter};
use std::env;
use std::path::PathBuf;
use tokio::io::{AsyncBufReadExt, BufReader};

mod utils;

use chatline::channel::Framing;
use chatline::config::ClientConfig;
use chatline::timeline::Timeline;
use chatline::{ChatClient, ChatController, ChatError, DeliveryStatus, Message, ViewUpdate};

/// Command line arguments for chatline
#[derive(Parser, Debug)]
#[command(
    author,
    version,
    about = "chatline: a terminal client for the chat backend.",
    long_about = "chatline logs in to the chat backend, keeps a realtime connection open and lets you \
    chat from the terminal.\n\n\
    Commands once logged in:\n\
    /contacts          list contacts\n\
    /open <id>         open a conversation\n\
    /retry <temp-id>   re-send a failed message\n\
    /logout            log out and forget the stored session\n\
    /quit              exit, keeping the session"
)]
struct Args {
    /// Base URL of the REST backend
    #[arg(long, value_name = "URL")]
    api_url: Option<String>,

    /// URL of the realtime WebSocket endpoint
    #[arg(long, value_name = "URL")]
    realtime_url: Option<String>,

    /// Realtime framing: socketio or json
    #[arg(long, value_name = "FRAMING")]
    realtime_framing: Option<Framing>,

    /// Directory for the persisted session
    #[arg(long, value_name = "PATH")]
    data_dir: Option<PathBuf>,

    /// Log file; logs go to stderr when omitted
    #[arg(long, value_name = "PATH")]
    log_file: Option<PathBuf>,

    #[arg(long, default_value = "info")]
    log_level: LevelFilter,
}

enum Command {
    Contacts,
    Open(String),
    Retry(String),
    Logout,
    Quit,
    Say(String),
}

impl Command {
    fn parse(line: &str) -> Option<Command> {
        let trimmed = line.trim();
        let (head, rest) = match trimmed.split_once(char::is_whitespace) {
            Some((head, rest)) => (head, rest.trim()),
            None => (trimmed, ""),
        };
        match head {
            "/contacts" => Some(Command::Contacts),
            "/open" if !rest.is_empty() => Some(Command::Open(rest.to_string())),
            "/retry" if !rest.is_empty() => Some(Command::Retry(rest.to_string())),
            "/logout" => Some(Command::Logout),
            "/quit" => Some(Command::Quit),
            _ if head.starts_with('/') => None,
            _ => Some(Command::Say(line.to_string())),
        }
    }
}

/// Prompts the user for login credentials or uses environment variables
fn prompt_credentials() -> (String, String) {
    let email = env::var("CHATLINE_EMAIL").unwrap_or_else(|_| {
        eprintln!("Email:");
        utils::read_line().unwrap_or_default()
    });

    let password = env::var("CHATLINE_PASSWORD").unwrap_or_else(|_| {
        eprintln!("Password:");
        utils::read_line().unwrap_or_default()
    });

    (email, password)
}

fn format_message(message: &Message, self_id: &str) -> String {
    let who = if message.sender_id == self_id { "me" } else { message.sender_id.as_str() };
    let status = match message.delivery_status {
        DeliveryStatus::Pending => " (sending)".to_string(),
        DeliveryStatus::Sent => String::new(),
        DeliveryStatus::Failed => format!(" (failed, /retry {})", message.id.as_str()),
    };
    format!(
        "[{}] {}: {}{}",
        message.timestamp.format("%H:%M"),
        who,
        message.summary(),
        status
    )
}

fn print_timeline(timeline: &Timeline, self_id: &str) {
    println!("--- conversation with {} ---", timeline.contact_id());
    for message in timeline.messages() {
        println!("{}", format_message(message, self_id));
    }
}

fn print_contacts(controller: &ChatController) {
    controller.with_state(|state| {
        for contact in state.contacts.list() {
            let preview = contact.last_message.as_ref().map(|m| m.text.as_str()).unwrap_or("");
            let unread = if contact.unread_count > 0 {
                format!(" ({} unread)", contact.unread_count)
            } else {
                String::new()
            };
            println!("{:>6}  {}{}  {}", contact.id, contact.name, unread, preview);
        }
    });
}

fn render(controller: &ChatController, update: ViewUpdate, self_id: &str) {
    match update {
        ViewUpdate::TimelineChanged(contact_id) => {
            if controller.open_contact().as_deref() != Some(contact_id.as_str()) {
                return;
            }
            // Confirmations and failures change entries in place, so redraw the whole conversation.
            if let Some(timeline) = controller.timeline(&contact_id) {
                print_timeline(&timeline, self_id);
            }
        }
        ViewUpdate::ContactsChanged => {}
        ViewUpdate::SendFailed { contact_id, temp_id } => {
            println!("! message to {} not sent, /retry {}", contact_id, temp_id);
        }
        ViewUpdate::Blocked { reason, .. } => println!("! message blocked: {}", reason),
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();
    utils::setup_logging(args.log_file.as_deref(), args.log_level)?;
    info!("chatline starting on {} {}", env::consts::OS, env::consts::ARCH);

    let mut config = ClientConfig::from_env();
    if let Some(url) = args.api_url {
        config.api_url = url;
    }
    if let Some(url) = args.realtime_url {
        config.realtime_url = url;
    }
    if let Some(framing) = args.realtime_framing {
        config.realtime_framing = framing;
    }
    if let Some(dir) = args.data_dir {
        config.data_dir = Some(dir);
    }

    let mut client = ChatClient::new(&config)?;
    let user = match client.restore().await? {
        Some(user) => user,
        None => {
            let (email, password) = prompt_credentials();
            match client.login(&email, &password).await {
                Ok(user) => user,
                Err(e) => {
                    error!("Login failed: {}", e);
                    eprintln!("Login failed: {}", e);
                    return Err(e.into());
                }
            }
        }
    };
    println!("Logged in as {} ({} credits)", user.username, user.credits);

    if let Err(e) = client.refresh_contacts().await {
        warn!("Could not load contacts: {}", e);
        eprintln!("Could not load contacts: {}", e);
    }
    let (controller, mut updates) = client.controller()?;
    print_contacts(&controller);

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    loop {
        tokio::select! {
            line = lines.next_line() => {
                let Some(line) = line? else { break };
                match Command::parse(&line) {
                    Some(Command::Contacts) => {
                        if let Err(e) = client.refresh_contacts().await {
                            eprintln!("Could not load contacts: {}", e);
                        }
                        print_contacts(&controller);
                    }
                    Some(Command::Open(contact_id)) => match controller.open(&contact_id).await {
                        Ok(()) => {
                            if let Some(timeline) = controller.timeline(&contact_id) {
                                print_timeline(&timeline, &user.id);
                            }
                        }
                        Err(e) => eprintln!("Could not load conversation: {}", e),
                    },
                    Some(Command::Retry(temp_id)) => {
                        if let Err(e) = controller.retry(&temp_id) {
                            eprintln!("Retry failed: {}", e);
                        }
                    }
                    Some(Command::Logout) => {
                        controller.close();
                        client.logout()?;
                        println!("Logged out");
                        break;
                    }
                    Some(Command::Quit) => break,
                    Some(Command::Say(text)) => {
                        match controller.submit(&text) {
                            Err(ChatError::NoOpenConversation) => eprintln!("Open a conversation first: /open <id>"),
                            // Send failures are reported through the update stream
                            Err(e) => info!("Submit did not go through: {}", e),
                            Ok(_) => {}
                        }
                    }
                    None => eprintln!("Unknown command: {}", line.trim()),
                }
            }
            Some(update) = updates.recv() => render(&controller, update, &user.id),
        }
    }

    controller.close();
    info!("chatline shutting down");
    Ok(())
}
