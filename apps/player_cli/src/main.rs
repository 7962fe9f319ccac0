use std::process::ExitCode;

use anyhow::{bail, Result};
use case_client::{load_settings, CaseClient, ClientError, GenerationJob, Topology};
use clap::{Args, Parser, Subcommand};
use shared::{
    domain::{DraftId, GenerationStatus, PublicId, TemplateId},
    protocol::{Session, SourceSelection},
};
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
struct Cli {
    /// Overrides `server_url` from client.toml / APP__SERVER_URL.
    #[arg(long)]
    server_url: Option<String>,
    #[arg(long, env = "CASE_ACCESS_TOKEN")]
    access_token: Option<String>,
    #[command(subcommand)]
    command: Command,
}

#[derive(Args, Debug)]
#[group(required = true, multiple = false)]
struct SourceArgs {
    #[arg(long)]
    template_id: Option<i64>,
    #[arg(long)]
    draft_id: Option<i64>,
    #[arg(long)]
    prompt: Option<String>,
}

impl SourceArgs {
    fn into_selection(self) -> Result<SourceSelection> {
        Ok(match (self.template_id, self.draft_id, self.prompt) {
            (Some(id), None, None) => SourceSelection::Template {
                template_id: TemplateId(id),
            },
            (None, Some(id), None) => SourceSelection::Draft {
                draft_id: DraftId(id),
            },
            (None, None, Some(prompt)) => SourceSelection::Prompt { prompt },
            _ => bail!("pick exactly one of --template-id, --draft-id or --prompt"),
        })
    }
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Request a new case from the generator and follow it to completion.
    Generate {
        #[command(flatten)]
        source: SourceArgs,
    },
    /// Re-attach to a generation job started earlier.
    ResumeGeneration {
        #[arg(long)]
        public_id: String,
    },
    /// Create a session synchronously.
    Start {
        #[command(flatten)]
        source: SourceArgs,
    },
    Show {
        #[arg(long)]
        public_id: String,
    },
    Ask {
        #[arg(long)]
        public_id: String,
        #[arg(long)]
        suspect: String,
        #[arg(long)]
        question: String,
    },
    Move {
        #[arg(long)]
        public_id: String,
        #[arg(long)]
        location: String,
    },
    Investigate {
        #[arg(long)]
        public_id: String,
    },
    Accuse {
        #[arg(long)]
        public_id: String,
        #[arg(long)]
        suspect: String,
    },
}

#[tokio::main]
async fn main() -> ExitCode {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();
    let cli = Cli::parse();

    match execute(cli).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(err) => {
            eprintln!("{}", failure_message(&err));
            ExitCode::FAILURE
        }
    }
}

async fn execute(cli: Cli) -> Result<()> {
    let mut settings = load_settings();
    if let Some(server_url) = cli.server_url {
        settings.server_url = server_url;
    }
    if cli.access_token.is_some() {
        settings.access_token = cli.access_token;
    }
    tracing::debug!(server_url = %settings.server_url, "player_cli: settings loaded");
    let client = CaseClient::from_settings(settings)?;

    let outcome = run(&client, cli.command).await;
    client.shutdown().await;
    outcome
}

/// Typed client errors carry text meant for the player; anything else is
/// shown with its full cause chain.
fn failure_message(err: &anyhow::Error) -> String {
    match err.downcast_ref::<ClientError>() {
        Some(client_err) => client_err.user_message(),
        None => format!("error: {err:#}"),
    }
}

async fn run(client: &CaseClient, command: Command) -> Result<()> {
    let session = client.session();
    match command {
        Command::Generate { source } => {
            let job = client.generation().start(source.into_selection()?).await;
            return follow_generation(client, job).await;
        }
        Command::ResumeGeneration { public_id } => {
            let job = client.generation().restore(PublicId::new(public_id)).await;
            return follow_generation(client, job).await;
        }
        Command::Start { source } => {
            session.start(source.into_selection()?).await?;
        }
        Command::Show { public_id } => {
            session.load(&PublicId::new(public_id)).await?;
        }
        Command::Ask {
            public_id,
            suspect,
            question,
        } => {
            let public_id = PublicId::new(public_id);
            session.load(&public_id).await?;
            let updated = session.ask(&public_id, &question, &suspect).await?;
            if let Some(reply) = updated.messages.last() {
                println!("{suspect}: {}", reply.content);
            }
        }
        Command::Move {
            public_id,
            location,
        } => {
            let public_id = PublicId::new(public_id);
            session.load(&public_id).await?;
            let result = session.move_to(&public_id, &location).await?;
            if let Some(message) = result.message {
                println!("{message}");
            }
        }
        Command::Investigate { public_id } => {
            let public_id = PublicId::new(public_id);
            session.load(&public_id).await?;
            let found = session.investigate(&public_id).await?;
            if found.is_empty() {
                println!("nothing new here");
            }
            for item in found {
                println!("found [{}] {}: {}", item.id, item.title, item.detail);
            }
        }
        Command::Accuse { public_id, suspect } => {
            let public_id = PublicId::new(public_id);
            session.load(&public_id).await?;
            let verdict = session.accuse(&public_id, &suspect).await?;
            let outcome = if verdict.correct { "correct" } else { "wrong" };
            println!("{outcome}: the killer was {}", verdict.actual_killer);
            println!("{}", verdict.explanation);
            if !verdict.key_clues.is_empty() {
                println!("key clues: {}", verdict.key_clues.join(", "));
            }
        }
    }

    if let Some(current) = session.snapshot().await {
        print_summary(&current, &session.topology().await);
    }
    Ok(())
}

async fn follow_generation(client: &CaseClient, mut job: GenerationJob) -> Result<()> {
    let mut updates = client.generation().subscribe();
    loop {
        match job.status {
            GenerationStatus::Complete => {
                if let Some(public_id) = &job.job_id {
                    println!("case ready: {public_id}");
                }
                return Ok(());
            }
            GenerationStatus::Failed => {
                bail!(job.error_message.unwrap_or_default());
            }
            GenerationStatus::Idle => bail!("generation was not started"),
            status => match &job.progress_message {
                Some(message) => println!("[{status}] {message}"),
                None => println!("[{status}]"),
            },
        }
        updates.changed().await?;
        job = updates.borrow_and_update().clone();
    }
}

fn print_summary(session: &Session, topology: &Topology) {
    println!(
        "{} [{}] {}",
        session.public_id,
        session.status,
        session.title.as_deref().unwrap_or("(untitled)")
    );
    println!(
        "time {} ({} min left), questions left {}",
        session.clock.current_time(),
        session.clock.remaining_minutes(),
        session.question_budget.remaining()
    );
    if let Some(location) = &session.current_location {
        println!("location: {location}");
    }
    let here = topology.suspects_at(session.current_location.as_deref());
    if !here.is_empty() {
        println!("present here: {}", here.join(", "));
    }
    if !topology.locations.is_empty() {
        let locations: Vec<_> = topology.locations.iter().cloned().collect();
        println!("locations: {}", locations.join(", "));
    }
    println!("evidence collected: {}", session.evidence.len());
    for item in &session.evidence {
        println!("  - {}", item.title);
    }
}
