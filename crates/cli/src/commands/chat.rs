//! `llamachat chat`: Interactive or single-message chat mode.

use llamachat_chat::{ChatOrchestrator, TurnOutcome};
use llamachat_core::event::ChatEvent;
use llamachat_core::session::SessionId;
use std::io::Write;
use std::sync::Arc;
use tokio::io::{self, AsyncBufReadExt, BufReader};
use tokio::sync::broadcast::error::TryRecvError;

pub async fn run(model: Option<String>, message: Option<String>) -> Result<(), Box<dyn std::error::Error>> {
    let orchestrator = Arc::new(super::build(model).await?);

    if let Some(msg) = message {
        // Single message mode
        turn(&orchestrator, msg).await;
        return Ok(());
    }

    let status = orchestrator.engine_status();
    println!();
    println!("  llamachat: interactive mode");
    println!();
    match &status.model_path {
        Some(path) => println!("  Model:     {}", path.display()),
        None => println!("  Model:     none loaded (set --model or LLAMACHAT_MODEL)"),
    }
    println!("  Sessions:  {}", orchestrator.snapshot().sessions.len());
    println!();
    println!("  Commands: /clear /new /sessions /switch <id> /bench /quit");
    println!("  Ctrl+C stops a reply in progress.");
    println!();

    let mut lines = BufReader::new(io::stdin()).lines();
    loop {
        print!("  You > ");
        std::io::stdout().flush()?;

        let Some(line) = lines.next_line().await? else {
            break;
        };
        let line = line.trim();
        if line.is_empty() {
            continue;
        }

        match line.split_once(' ').unwrap_or((line, "")) {
            ("/quit" | "/exit" | ":q", _) => break,
            ("/clear", _) => match orchestrator.clear().await {
                Ok(()) => println!("  Conversation cleared."),
                Err(e) => eprintln!("  [Error] {e}"),
            },
            ("/new", name) => {
                let name = (!name.trim().is_empty()).then(|| name.trim());
                let id = orchestrator.new_session(name).await;
                println!("  Started session {id}");
            }
            ("/sessions", _) => super::sessions::print(&orchestrator.snapshot()),
            ("/switch", id) => match orchestrator.switch_session(&SessionId::from(id.trim())).await {
                Ok(()) => println!("  Switched to {}", id.trim()),
                Err(e) => eprintln!("  [Error] {e}"),
            },
            ("/bench", _) => super::bench::report(&orchestrator, 8, 4, 1, 1).await,
            _ => turn(&orchestrator, line.to_string()).await,
        }
        println!();
    }

    println!();
    println!("  Goodbye!");
    println!();
    Ok(())
}

/// Send one message and print the reply as it streams in.
async fn turn(orchestrator: &Arc<ChatOrchestrator>, text: String) {
    let mut events = orchestrator.events().subscribe();
    let mut task = tokio::spawn({
        let orchestrator = orchestrator.clone();
        async move { orchestrator.send(&text).await }
    });

    print!("  Assistant > ");
    let _ = std::io::stdout().flush();

    let mut shown = String::new();
    let result = loop {
        tokio::select! {
            result = &mut task => break result,
            event = events.recv() => {
                if let Ok(event) = event {
                    show_fragment(&event, &mut shown);
                }
            }
            _ = tokio::signal::ctrl_c() => orchestrator.cancel(),
        }
    };

    // Fragments published in the last poll round are still queued
    loop {
        match events.try_recv() {
            Ok(event) => show_fragment(&event, &mut shown),
            Err(TryRecvError::Lagged(_)) => continue,
            Err(_) => break,
        }
    }

    match result {
        Ok(Ok(TurnOutcome::Cached(reply))) => println!("{}", reply.text),
        Ok(Ok(TurnOutcome::Generated(reply))) => match unprinted(&shown, &reply.text) {
            Some(tail) => println!("{tail}"),
            None => {
                println!();
                println!("  Assistant > {}", reply.text);
            }
        },
        Ok(Ok(TurnOutcome::Cancelled)) => println!(" [stopped]"),
        Ok(Ok(TurnOutcome::Skipped)) => println!(),
        Ok(Err(e)) => {
            println!();
            eprintln!("  [Error] {e}");
        }
        Err(e) => {
            println!();
            eprintln!("  [Error] turn task failed: {e}");
        }
    }
}

fn show_fragment(event: &ChatEvent, shown: &mut String) {
    if let ChatEvent::Fragment { text, .. } = event {
        print!("{text}");
        let _ = std::io::stdout().flush();
        shown.push_str(text);
    }
}

/// The part of the final `reply` the streamed fragments have not shown yet.
/// `None` when what was shown is not a prefix of the reply, which happens
/// when the reply was cut at a turn marker or events were lost.
fn unprinted<'a>(shown: &str, reply: &'a str) -> Option<&'a str> {
    let shown = shown.trim_start();
    reply
        .strip_prefix(shown)
        .or_else(|| reply.strip_prefix(shown.trim_end()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unprinted_returns_missing_tail() {
        assert_eq!(unprinted("Hello ", "Hello world"), Some("world"));
        assert_eq!(unprinted("", "Hello world"), Some("Hello world"));
        assert_eq!(unprinted("  Hello world  ", "Hello world"), Some(""));
    }

    #[test]
    fn unprinted_requests_rerender_when_reply_was_cut() {
        assert_eq!(unprinted("Hi there\nUser: next", "Hi there"), None);
        assert_eq!(unprinted("something else", "Hi"), None);
    }
}
