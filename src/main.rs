//! Cliente de terminal: lee consultas de stdin, muestra la respuesta en
//! streaming y expone el directorio de sesiones y documentos.

use std::io::Write;
use std::path::PathBuf;

use anyhow::Result;
use miras_client::{
    ingest_stream::IngestUpdate,
    models::{Message, MessageKind, Severity},
    query_stream::QueryUpdate,
    reconciler::{render_citations, render_validation},
    ClientConfig, ClientError, SessionChoice, Workspace,
};
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::sync::mpsc;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

const HELP: &str = "\
Commands:
  <text>                       ask a question (continues the current session)
  /new                         start a new conversation
  /sessions                    list sessions
  /load <id>                   load a past session
  /delete-session <id>         delete a session
  /docs                        list documents
  /delete-doc <id>             delete a document
  /ingest <path>... [-- text]  upload files or folders, with optional instructions
  /history                     print the current conversation
  /quit                        exit";

#[tokio::main]
async fn main() -> Result<()> {
    // 1. Cargar .env e inicializar logging (a stderr, para no mezclarlo con las respuestas)
    dotenvy::dotenv().ok();
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_writer(std::io::stderr)
        .init();

    // 2. Cargar configuración
    let cfg = ClientConfig::from_env()?;

    // 3. Conectar con el backend
    let (updates_tx, mut updates_rx) = mpsc::unbounded_channel();
    let mut workspace = Workspace::connect(&cfg)?.with_query_observer(updates_tx);
    match workspace.health().await {
        Ok(()) => info!("Backend disponible en {}", cfg.api_url),
        Err(e) => warn!("El backend no responde en {}: {e}", cfg.api_url),
    }
    for notice in workspace.refresh_directory().await {
        println!("! {notice}");
    }

    println!("Miras client. Type /help for commands.");
    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    let mut renderer = Renderer::default();

    loop {
        prompt()?;
        let Some(line) = lines.next_line().await? else {
            break;
        };
        let line = line.trim();
        if line.is_empty() {
            continue;
        }

        let (command, rest) = line.split_once(' ').unwrap_or((line, ""));
        let rest = rest.trim();
        match command {
            "/quit" | "/exit" => break,
            "/help" => println!("{HELP}"),
            "/new" => {
                workspace.new_conversation();
                println!("New conversation.");
            }
            "/sessions" => list_sessions(&workspace).await,
            "/load" if !rest.is_empty() => match workspace.open_session(rest).await {
                Ok(_) => print_history(&workspace.conversation().snapshot()),
                Err(e) => notice("Could not load session", &e),
            },
            "/delete-session" if !rest.is_empty() => match workspace.delete_session(rest).await {
                Ok(()) => println!("Session deleted."),
                Err(e) => notice("Could not delete session", &e),
            },
            "/docs" => list_documents(&workspace).await,
            "/delete-doc" if !rest.is_empty() => match workspace.delete_document(rest).await {
                Ok(()) => println!("Document deleted."),
                Err(e) => notice("Could not delete document", &e),
            },
            "/ingest" if !rest.is_empty() => ingest(&workspace, rest).await,
            "/history" => print_history(&workspace.conversation().snapshot()),
            _ if command.starts_with('/') => println!("Unknown command. {HELP}"),
            _ => {
                let finished = {
                    let ask = workspace.ask(line, SessionChoice::Remembered);
                    tokio::pin!(ask);
                    loop {
                        tokio::select! {
                            _ = &mut ask => break true,
                            Some(update) = updates_rx.recv() => renderer.handle(update),
                            _ = tokio::signal::ctrl_c() => break false,
                        }
                    }
                };
                while let Ok(update) = updates_rx.try_recv() {
                    renderer.handle(update);
                }
                if !finished {
                    workspace.query_mut().cancel();
                    println!("\n(cancelled)");
                }
                renderer.reset();
            }
        }
    }

    info!("Cliente cerrado");
    Ok(())
}

fn prompt() -> Result<()> {
    print!("\n> ");
    std::io::stdout().flush()?;
    Ok(())
}

/// Aviso de una operación fallida; los fallos de transporte se señalan aparte.
fn notice(action: &str, e: &ClientError) {
    if e.is_transport() {
        println!("! {action}: backend unreachable ({e})");
    } else {
        println!("! {action}: {e}");
    }
}

fn marker(severity: Severity) -> &'static str {
    match severity {
        Severity::Info => "·",
        Severity::Success => "✓",
        Severity::Error => "✗",
    }
}

/// Pinta los updates de una consulta según llegan.
#[derive(Default)]
struct Renderer {
    printed: usize,
}

impl Renderer {
    fn handle(&mut self, update: QueryUpdate) {
        match update {
            QueryUpdate::Status(Some(status)) if self.printed == 0 => println!("  {status}"),
            QueryUpdate::EnhancedQuery(enhanced) => println!("  (searching for: {enhanced})"),
            QueryUpdate::Answer(buffer) => {
                let delta = buffer.get(self.printed..).unwrap_or(&buffer);
                print!("{delta}");
                let _ = std::io::stdout().flush();
                self.printed = buffer.len();
            }
            QueryUpdate::Citations(citations) => println!("\n\n{}", render_citations(&citations)),
            QueryUpdate::Validation(result) => {
                let severity = if result.query_answered {
                    Severity::Success
                } else {
                    Severity::Info
                };
                println!("\n{} {}", marker(severity), render_validation(&result));
                if let Some(score) = result.accuracy_score {
                    println!(
                        "  {}/{} facts verified, accuracy {score:.0}%",
                        result.verified_count(),
                        result.total_facts.unwrap_or(result.facts_checked.len() as u32)
                    );
                }
            }
            QueryUpdate::Failed(message) => println!("\n{} {message}", marker(Severity::Error)),
            QueryUpdate::Completed => println!(),
            QueryUpdate::Status(_) | QueryUpdate::SessionBound(_) | QueryUpdate::Thinking(_) => {}
        }
    }

    fn reset(&mut self) {
        self.printed = 0;
    }
}

async fn ingest(workspace: &Workspace, args: &str) {
    let (paths, instructions) = match args.split_once(" -- ") {
        Some((paths, text)) => (paths, Some(text.trim().to_string())),
        None => (args, None),
    };
    let paths: Vec<PathBuf> = paths.split_whitespace().map(PathBuf::from).collect();

    let (tx, mut rx) = mpsc::unbounded_channel();
    let printer = tokio::spawn(async move {
        while let Some(update) = rx.recv().await {
            match update {
                IngestUpdate::Progress(text) => println!("{} {text}", marker(Severity::Info)),
                IngestUpdate::FileComplete { message, .. } => {
                    println!("{} {message}", marker(Severity::Success))
                }
                IngestUpdate::FileFailed { message, .. } | IngestUpdate::Failed(message) => {
                    println!("{} {message}", marker(Severity::Error))
                }
                IngestUpdate::Summary { filename, summary } => println!(
                    "\n{}\n{summary}\n",
                    filename.as_deref().unwrap_or("Summary")
                ),
                IngestUpdate::BatchComplete => println!("Batch complete."),
            }
        }
    });

    match workspace.ingest(&paths, instructions, Some(tx)).await {
        Ok(report) => println!(
            "{} processed, {} failed.",
            report.processed.len(),
            report.failed.len()
        ),
        Err(e) => notice("Upload not started", &e),
    }
    let _ = printer.await;
}

async fn list_sessions(workspace: &Workspace) {
    if let Err(e) = workspace.directory().refresh_sessions().await {
        notice("Could not load sessions", &e);
    }
    let current = workspace.current_session();
    let sessions = workspace.directory().sessions();
    if sessions.is_empty() {
        println!("No sessions.");
    }
    for session in sessions {
        let mark = if current.as_deref() == Some(session.id.as_str()) {
            "*"
        } else {
            " "
        };
        println!(
            "{mark} {}  {}  ({} messages, last {})",
            session.id, session.title, session.message_count, session.last_message_at
        );
    }
}

async fn list_documents(workspace: &Workspace) {
    if let Err(e) = workspace.directory().refresh_documents().await {
        notice("Could not load documents", &e);
    }
    let listing = workspace.directory().snapshot();
    if listing.documents.is_empty() {
        println!("No documents.");
    }
    for doc in &listing.documents {
        println!(
            "{}  {}  {}  {}",
            doc.id, doc.name, doc.size_formatted, doc.status
        );
    }
    let pending = workspace.directory().pending_documents();
    if pending > 0 {
        println!("{pending} document(s) still processing.");
    }
}

fn print_history(messages: &[Message]) {
    for message in messages {
        match message.kind {
            MessageKind::User => {
                println!("\n> {}", message.content);
                if let Some(enhanced) = &message.enhanced_query {
                    println!("  (searching for: {enhanced})");
                }
            }
            MessageKind::Assistant => println!("{}", message.content),
            MessageKind::System => println!("{} {}", marker(message.severity), message.content),
        }
    }
}
