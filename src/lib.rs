pub mod api;
pub mod cli;
pub mod decoder;
pub mod error;
pub mod merge;
pub mod models;
pub mod navigation;
pub mod session;
pub mod store;
pub mod websocket;

use api::{ AgentBackend, ApiClient };
use cli::Args;
use error::ClientError;
use log::{ error, info, warn };
use models::chat::{ Message, ROOT_ID };
use session::ChatSession;
use std::error::Error;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{ AsyncBufReadExt, BufReader };
use url::Url;

/// Line-oriented console shell around the client core. This is the host
/// layer: it owns the reload-on-failure policy, renders the visible slice,
/// and maps user gestures to the session's discrete attach/detach events.
pub async fn run(args: Args) -> Result<(), Box<dyn Error + Send + Sync>> {
    info!("--- Client Configuration ---");
    info!("Backend URL: {}", args.backend_url);
    info!("Agent: {}", if args.agent.is_empty() {
        "(first listed)"
    } else {
        args.agent.as_str()
    });
    info!("Show seed messages: {}", args.show_initial);
    info!("Reload delay: {}s", args.reload_delay_secs);
    info!("----------------------------");

    let base = Url::parse(&args.backend_url).map_err(ClientError::from)?;
    let api = Arc::new(ApiClient::new(base, args.token.clone())?);

    // host-shell policy: if the backend was never reachable, wait out the
    // grace period and reload instead of giving up. Bad credentials are not
    // a connectivity problem and fail immediately.
    let agents = loop {
        match api.agents().await {
            Ok(agents) => {
                break agents;
            }
            Err(e @ ClientError::Unauthorized(_)) => {
                return Err(e.into());
            }
            Err(e) => {
                warn!("Backend not reachable ({}); reloading in {}s", e, args.reload_delay_secs);
                tokio::time::sleep(Duration::from_secs(args.reload_delay_secs)).await;
            }
        }
    };
    if agents.is_empty() {
        return Err("backend lists no agents".into());
    }
    info!("Agents: {}", agents.join(", "));
    let agent = if args.agent.is_empty() { agents[0].clone() } else { args.agent.clone() };

    let mut session = ChatSession::new(api, agent);
    session.set_show_initial(args.show_initial);
    session.open(ROOT_ID).await?;
    render(&session);

    // one stimulus per turn of the loop, resolved before the session is
    // touched again (the select arms may not hold borrows into it)
    enum Stimulus {
        Line(Option<String>),
        Event(Option<decoder::StreamEvent>),
    }

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    loop {
        let stimulus = tokio::select! {
            line = lines.next_line() => Stimulus::Line(line?),
            event = session.next_event() => Stimulus::Event(event),
        };
        match stimulus {
            Stimulus::Line(Some(line)) => {
                if !handle_input(&mut session, line.trim()).await {
                    break;
                }
                render(&session);
            }
            Stimulus::Line(None) => {
                break;
            }
            Stimulus::Event(Some(event)) => {
                if session.apply(event) {
                    render(&session);
                }
            }
            Stimulus::Event(None) => {
                warn!("Live updates ended for this view ({:?})", session.connection_status());
            }
        }
    }
    info!("Bye");
    Ok(())
}

/// Returns false when the user asked to quit. Action failures are
/// transient: reported, never retried, never fatal to the shell.
async fn handle_input(session: &mut ChatSession, line: &str) -> bool {
    if line.is_empty() {
        return true;
    }
    if !line.starts_with('/') {
        report(session.send(line).await.map(|_| ()));
        return true;
    }
    let mut parts = line.splitn(3, ' ');
    let command = parts.next().unwrap_or_default();
    let arg = parts.next().unwrap_or_default();
    let rest = parts.next().unwrap_or_default();
    match command {
        "/quit" | "/exit" => {
            return false;
        }
        "/help" => print_help(),
        "/root" => report(session.open(ROOT_ID).await),
        "/open" if arg.is_empty() => error!("Usage: /open <conversation-id>"),
        "/open" => report(session.open(arg).await),
        "/enter" if arg.is_empty() => error!("Usage: /enter <conversation-id>"),
        "/enter" => session.enter(arg),
        "/back" => session.back(),
        "/up" => session.jump_to_parent(),
        "/attach" => session.attach(),
        // the console's stand-in for scrolling away from the bottom
        "/detach" => session.on_user_scroll_away(),
        "/cancel" => report(session.cancel().await),
        "/fork" if arg.is_empty() => error!("Usage: /fork <message-id>"),
        "/fork" => report(session.fork(arg).await.map(|_| ())),
        "/rate" =>
            match rest.parse::<i8>() {
                Ok(rating) if (-1..=1).contains(&rating) => {
                    report(session.rate(arg, rating).await);
                }
                _ => error!("Usage: /rate <message-id> <-1|0|1>"),
            }
        "/delete" if arg.is_empty() => error!("Usage: /delete <message-id>"),
        "/delete" => report(session.delete(arg).await),
        "/run" => {
            if rest.is_empty() {
                error!("Usage: /run <message-id> <code>");
            } else {
                report(session.run_cell(arg, rest).await);
            }
        }
        "/cell" => {
            if rest.is_empty() {
                error!("Usage: /cell <message-id> <code>");
            } else {
                report(session.create_cell(arg, rest).await);
            }
        }
        "/share" =>
            match session.share().await {
                Ok(token) => println!("Share token: {}", token),
                Err(e) => report(Err(e)),
            }
        "/status" =>
            println!(
                "Connection: {:?} | attached: {}",
                session.connection_status(),
                session.is_attached()
            ),
        other => error!("Unknown command: {} (try /help)", other),
    }
    true
}

fn report(result: Result<(), ClientError>) {
    match result {
        Ok(()) => {}
        Err(ClientError::Unauthorized(message)) => error!("Not authorized: {}", message),
        Err(e) => error!("{}", e),
    }
}

fn render(session: &ChatSession) {
    let mode = if session.is_attached() { "following" } else { "detached" };
    println!();
    println!(
        "== {} [{}] ({:?})",
        session.position().join(" > "),
        mode,
        session.connection_status()
    );
    for message in session.visible_messages() {
        render_message(session, &message);
    }
}

fn render_message(session: &ChatSession, message: &Message) {
    let role = message.chat.role
        .map(|r| r.to_string())
        .unwrap_or_else(|| "...".to_string());
    let header = match message.chat.name.as_deref() {
        Some(name) if !name.is_empty() => format!("{} {} ({})", role, name, message.id()),
        _ => format!("{} ({})", role, message.id()),
    };
    let streaming = if message.meta.duration.is_none() { " ..." } else { "" };
    println!("[{}]{}", header, streaming);
    if let Some(function_call) = &message.chat.function_call {
        if !function_call.is_empty() {
            println!("  -> {}({})", function_call.name, function_call.arguments);
        }
    }
    match message.chat.content_text() {
        Some(text) if !text.is_empty() => println!("  {}", text.replace('\n', "\n  ")),
        Some(_) => {}
        None if message.chat.content.is_null() => {}
        None => println!("  {}", message.chat.content),
    }
    for child in session.store().children_of(message.id()) {
        println!("  +- sub-conversation {} (use /enter {})", child, child);
    }
}

fn print_help() {
    println!("Anything not starting with / is sent to the agent.");
    println!("/open <conversation>   load a conversation as the active view");
    println!("/enter <conversation>  step into a sub-conversation");
    println!("/back                  step back out");
    println!("/up                    jump to the parent conversation");
    println!("/root                  back to the conversation list");
    println!("/attach | /detach      toggle auto-follow of new content");
    println!("/cancel                interrupt the running turn");
    println!("/fork <message>        clone the conversation from a message");
    println!("/rate <message> <n>    rate -1, 0 or 1");
    println!("/delete <message>      delete (logically) a message");
    println!("/run <message> <code>  execute code after a message");
    println!("/cell <message> <code> add a code cell after a message");
    println!("/share                 mint a view-only share token");
    println!("/status                connection and follow state");
    println!("/quit                  leave");
}
