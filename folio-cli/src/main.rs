//! Folio CLI — headless client for a collaborative notebook room.
//!
//! Connects a [`Session`] to a room and prints what happens in it, which is
//! handy for checking a deployment without an editor attached.
//!
//! ```bash
//! FOLIO_TOKEN=... folio --room team-a notebooks
//! FOLIO_TOKEN=... folio --room team-a watch <NOTEBOOK_ID>
//! ```

use clap::{Parser, Subcommand};
use log::{info, warn};
use uuid::Uuid;

use folio_collab::{CollabConfig, CollabError, MemoryEngine, NewBlock, Session, SessionEvent};

/// Headless client for a collaborative notebook room.
#[derive(Parser)]
#[command(name = "folio", version)]
#[command(about = "Headless client for a collaborative notebook room", long_about = None)]
struct Cli {
    /// Room to connect to
    #[arg(short, long, env = "FOLIO_ROOM")]
    room: String,

    /// Bearer token for the realtime and REST endpoints
    #[arg(long, env = "FOLIO_TOKEN", hide_env_values = true)]
    token: String,

    /// Realtime endpoint, overriding FOLIO_WS_URL
    #[arg(long)]
    ws_url: Option<String>,

    /// REST base URL, overriding FOLIO_API_URL
    #[arg(long)]
    api_url: Option<String>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// List the room's notebooks.
    Notebooks,

    /// Create a notebook.
    CreateNotebook {
        name: String,
    },

    /// Append a code block to a notebook.
    AddBlock {
        notebook: Uuid,
        /// Block language
        #[arg(short, long, default_value = "python")]
        language: String,
    },

    /// Join the room, open a notebook and log its activity until Ctrl-C.
    Watch {
        notebook: Uuid,
    },
}

#[tokio::main]
async fn main() {
    env_logger::init();
    let cli = Cli::parse();

    if let Err(e) = run(cli).await {
        eprintln!("error: {e}");
        std::process::exit(1);
    }
}

async fn run(cli: Cli) -> Result<(), CollabError> {
    let mut config = CollabConfig::from_env()?;
    if let Some(url) = cli.ws_url {
        config.ws_url = url;
    }
    if let Some(url) = cli.api_url {
        config.api_url = url;
    }

    let mut session = Session::with_websocket(config, &cli.token)?;
    session.attach_engine(Box::new(MemoryEngine::new()));

    match cli.command {
        Commands::Notebooks => {
            for notebook in session.list_notebooks(&cli.room).await? {
                println!("{}  {}", notebook.id, notebook.name);
            }
        }
        Commands::CreateNotebook { name } => {
            let notebook = session.create_notebook(&cli.room, &name).await?;
            println!("{}", notebook.id);
        }
        Commands::AddBlock { notebook, language } => {
            session.open_notebook(notebook).await?;
            let block = session
                .create_block(notebook, NewBlock::code(language))
                .await?;
            println!("{} (position {})", block.id, block.position);
        }
        Commands::Watch { notebook } => watch(&mut session, &cli.room, &cli.token, notebook).await?,
    }

    session.close().await;
    Ok(())
}

async fn watch(
    session: &mut Session,
    room: &str,
    token: &str,
    notebook: Uuid,
) -> Result<(), CollabError> {
    let signal = session.connect_and_join(room, token).await?;
    info!("Joined room {room} ({signal:?})");

    let blocks = session.open_notebook(notebook).await?;
    info!("Notebook {notebook} has {} blocks", blocks.len());

    loop {
        tokio::select! {
            event = session.next_event() => match event {
                Some(SessionEvent::Document(_)) => {
                    for block in session.blocks(notebook) {
                        let text = session.block_text(notebook, block.id).unwrap_or_default();
                        info!("[{}] {} chars", block.id, text.chars().count());
                    }
                }
                Some(SessionEvent::Error(e)) => warn!("{:?}: {}", e.kind, e.message),
                Some(event) => info!("{event:?}"),
                None => break,
            },
            _ = tokio::signal::ctrl_c() => {
                info!("Interrupted");
                break;
            }
        }
    }
    Ok(())
}
