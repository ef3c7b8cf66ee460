//! Line-oriented chat console for a clawlink gateway.
//!
//! Run with: cargo run -p console-chat-demo
//!
//! Environment:
//! - `CLAWLINK_GATEWAY_URL` - gateway endpoint (default `wss://localhost`)
//! - `CLAWLINK_PASSWORD`    - credential; stored for future runs
//!
//! Commands: `/agents`, `/switch <id>`, `/sessions`, `/open <key>`,
//! `/status`, `/quit`; anything else is sent to the selected agent.

use std::sync::Arc;

use anyhow::Result;
use clawlink_chat::{ChatController, ChatUpdate};
use clawlink_core::{ChatMessage, Role};
use clawlink_gateway::{
    ConnectionState, CredentialStore, GatewayClient, GatewayConfig, WsConnector,
};
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::sync::mpsc;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::registry()
        .with(tracing_subscriber::fmt::layer())
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "warn".into()),
        )
        .init();

    let url =
        std::env::var("CLAWLINK_GATEWAY_URL").unwrap_or_else(|_| "wss://localhost".to_string());

    let store = CredentialStore::open_default()?;
    let credential = match std::env::var("CLAWLINK_PASSWORD") {
        Ok(password) if !password.is_empty() => {
            store.store(&password)?;
            Some(password)
        }
        _ => store.load()?,
    };
    let Some(credential) = credential else {
        anyhow::bail!("no stored credential; set CLAWLINK_PASSWORD once to log in");
    };

    let (client, gateway_events) =
        GatewayClient::new(GatewayConfig::new(url), Arc::new(WsConnector));
    client.set_credential(Some(credential));

    let (controller, updates) = ChatController::new(Arc::clone(&client));
    tokio::spawn(Arc::clone(&controller).run(gateway_events));

    // Connection badge.
    let mut state_rx = client.state();
    tokio::spawn(async move {
        while state_rx.changed().await.is_ok() {
            let state = *state_rx.borrow();
            match state {
                ConnectionState::Connecting => eprintln!("* connecting..."),
                ConnectionState::Connected => eprintln!("* connected"),
                ConnectionState::Disconnected => eprintln!("* disconnected"),
            }
        }
    });
    tokio::spawn(render(updates));

    tracing::info!("connecting to gateway");
    client.start();

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    while let Some(line) = lines.next_line().await? {
        let line = line.trim();
        if line.is_empty() {
            continue;
        }
        match line.split_once(' ').map_or((line, ""), |(a, b)| (a, b)) {
            ("/quit", _) => break,
            ("/agents", _) => {
                let roster = controller.roster().await;
                let selected = controller.selected_agent().await;
                for agent in roster.agents() {
                    let marker = if selected.as_deref() == Some(agent.id.as_str()) {
                        "*"
                    } else {
                        " "
                    };
                    println!("{marker} {} ({})", roster.display_name(&agent.id), agent.id);
                }
            }
            ("/switch", agent_id) if !agent_id.is_empty() => {
                let agent_id = agent_id.trim();
                if controller.roster().await.contains(agent_id) {
                    controller.select_agent(agent_id).await;
                } else {
                    println!("unknown agent: {agent_id} (see /agents)");
                }
            }
            ("/switch", _) => println!("usage: /switch <agent-id>"),
            ("/sessions", _) => match controller.sessions().await {
                Ok(sessions) => {
                    for session in sessions {
                        println!(
                            "  {} [{}] {} msgs",
                            session.display_label(),
                            session.agent_id.as_deref().unwrap_or("?"),
                            session
                                .message_count()
                                .map_or_else(|| "?".to_string(), |n| n.to_string()),
                        );
                    }
                }
                Err(e) => println!("! sessions: {e}"),
            },
            ("/open", key) if !key.is_empty() => match controller.sessions().await {
                Ok(sessions) => match sessions.iter().find(|s| s.key == key.trim()) {
                    Some(session) => controller.open_session(session).await,
                    None => println!("unknown session: {key} (see /sessions)"),
                },
                Err(e) => println!("! open: {e}"),
            },
            ("/open", _) => println!("usage: /open <session-key>"),
            ("/status", _) => match controller.status().await {
                Ok(status) => {
                    println!(
                        "  gateway {} | uptime {} | {} agents",
                        status.gateway_version.as_deref().unwrap_or("unknown"),
                        status
                            .uptime_ms
                            .map_or_else(|| "n/a".to_string(), format_duration),
                        status.agent_count,
                    );
                }
                Err(e) => println!("! status: {e}"),
            },
            _ => {
                if let Err(e) = controller.send_message(line).await {
                    println!("! send: {e}");
                }
            }
        }
    }

    client.shutdown().await;
    Ok(())
}

async fn render(mut updates: mpsc::UnboundedReceiver<ChatUpdate>) {
    while let Some(update) = updates.recv().await {
        match update {
            ChatUpdate::Thread(messages) => {
                println!("--- conversation ---");
                for message in &messages {
                    print_message(message);
                }
            }
            ChatUpdate::Message(message) => print_message(&message),
            ChatUpdate::Draft(text) => {
                // Line-oriented stand-in for an in-place streaming bubble.
                println!("... {}", last_line(&text));
            }
            ChatUpdate::DraftEnded => {}
            ChatUpdate::HistoryLoading => println!("(loading...)"),
            ChatUpdate::Agents(roster) => {
                let names: Vec<&str> = roster
                    .agents()
                    .iter()
                    .map(|a| roster.display_name(&a.id))
                    .collect();
                eprintln!("* agents: {}", names.join(", "));
            }
            ChatUpdate::ConnectionRejected(reason) => {
                eprintln!("* login rejected: {reason} (update CLAWLINK_PASSWORD and restart)");
            }
        }
    }
}

fn print_message(message: &ChatMessage) {
    let text = message.display_text().unwrap_or_default();
    match message.role {
        Role::User => println!("you> {text}"),
        Role::Assistant => println!("bot> {text}"),
        Role::System => println!("sys> {text}"),
    }
}

fn last_line(text: &str) -> &str {
    text.lines().last().unwrap_or("")
}

fn format_duration(ms: u64) -> String {
    let secs = ms / 1000;
    let hours = secs / 3600;
    let mins = (secs % 3600) / 60;
    if hours > 0 {
        format!("{hours}h {mins}m")
    } else {
        format!("{mins}m")
    }
}
