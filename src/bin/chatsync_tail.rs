use anyhow::{Context, Result};
use clap::Parser;
use std::path::PathBuf;

use chatsync::{ChatSync, ChatSyncConfig, Conversation, Credential, UserId};

/// Follows one conversation on a chat gateway and logs what arrives
#[derive(Parser, Debug)]
#[clap(author, version, about)]
struct Args {
    /// User the session runs as
    #[clap(long, value_name = "ID")]
    user_id: String,

    /// Channel to follow
    #[clap(long, value_name = "ID", conflicts_with = "dm", required_unless_present = "dm")]
    channel: Option<String>,

    /// Direct conversation to follow
    #[clap(long, value_name = "ID")]
    dm: Option<String>,

    /// Directory for logs, overriding CHATSYNC_LOGS_DIR
    #[clap(long, value_name = "PATH")]
    logs_dir: Option<PathBuf>,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    let mut config = ChatSyncConfig::from_env().context("failed to load configuration")?;
    if let Some(logs_dir) = &args.logs_dir {
        config = config.with_logs_dir(logs_dir);
    }
    let token = std::env::var("CHATSYNC_TOKEN").context("CHATSYNC_TOKEN is not set")?;

    let conversation = match (args.channel, args.dm) {
        (Some(channel), _) => Conversation::channel(channel),
        (None, Some(dm)) => Conversation::direct(dm),
        (None, None) => anyhow::bail!("either --channel or --dm is required"),
    };

    let user_id = UserId::from(args.user_id);
    let session = match ChatSync::start(config, user_id, Credential::new(token)) {
        Ok(session) => session,
        Err(err) => {
            eprintln!("Failed to start chat session: {}", err);
            std::process::exit(1);
        }
    };

    let mut view = session.open_conversation();
    view.on_new_message(|message| {
        println!("[{}] {}: {}", message.created_at, message.author_id, message.content);
    });
    view.on_message_updated(|message| {
        println!("[edited] {}: {}", message.id, message.content);
    });
    view.on_message_deleted(|deletion| {
        println!("[deleted] {}", deletion.id);
    });
    view.switch_to(conversation);

    let mut state = session.subscribe_connection_state();
    let mut unread = session.unread().subscribe_total();
    let mut notices = session.notices();

    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => break,
            Ok(()) = state.changed() => {
                println!("connection: {}", *state.borrow_and_update());
            }
            Ok(()) = unread.changed() => {
                println!("unread total: {}", *unread.borrow_and_update());
            }
            Ok(notice) = notices.recv() => {
                println!("notice: {}", notice.message);
            }
        }
    }

    view.close();
    session.shutdown().await;
    Ok(())
}
