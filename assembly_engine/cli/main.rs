//! for CLI
//!
//! Local tooling around the assembly engine: identity keys, proof checks,
//! ballot inspection and an in-process harvest simulation.

use std::path::PathBuf;
use std::time::Duration;

use anyhow::{Context, Result, bail};
use assembly_engine::assembly::{Notification, Status};
use assembly_engine::ballot::{Ballot, BallotKind};
use assembly_engine::config::AssemblyConfig;
use assembly_engine::identity::{IdentityProof, Me, MeRecord};
use assembly_engine::logging::init_logging;
use assembly_engine::membership::{AssemblyDescriptor, Membership};
use assembly_engine::relay::LocalRelay;
use assembly_engine::session::Session;
use assembly_engine::types::Question;
use clap::{Parser, Subcommand, ValueEnum};
use tokio::sync::broadcast::error::RecvError;
use tracing::info;

#[derive(Parser)]
#[command(name = "assembly", version = "0.1", about = "Anonymous assembly harvest CLI")]
struct Cli {
    /// TOML config; defaults apply when omitted
    #[arg(long)]
    config: Option<PathBuf>,
    #[arg(long, default_value = "logs")]
    log_dir: String,
    /// Write the log file as JSON instead of logfmt
    #[arg(long)]
    json_logs: bool,
    #[command(subcommand)]
    command: Commands,
}

#[derive(Clone, Copy, ValueEnum)]
enum Kind {
    Question,
    Closed,
    Open,
}

#[derive(Subcommand)]
enum Commands {
    /// Generate a member identity and print its public proof
    Keygen {
        #[arg(short, long)]
        nickname: String,
        /// Where to write the private key record
        #[arg(short, long)]
        out: Option<PathBuf>,
    },
    /// Check an identity proof read from a JSON file
    VerifyProof {
        #[arg(short, long)]
        file: PathBuf,
    },
    /// Build a padded ballot and print its size and commitment
    Ballot {
        #[arg(short, long, value_enum)]
        kind: Kind,
        /// Answer text, `yes`/`no` for closed ballots; omit to propose nothing
        #[arg(short, long)]
        answer: Option<String>,
    },
    /// Run a full harvest between in-process members
    Simulate {
        #[arg(short, long, default_value_t = 3)]
        members: usize,
        /// Fewest present members that may start the harvest; defaults to everyone
        #[arg(long)]
        min: Option<usize>,
        #[arg(short, long)]
        question: String,
        /// Treat the question as open instead of yes/no
        #[arg(long)]
        open: bool,
        /// One answer per member, in order
        #[arg(short, long, num_args = 1..)]
        answers: Vec<String>,
    },
}

fn parse_closed(answer: &str) -> Result<bool> {
    match answer.to_ascii_lowercase().as_str() {
        "yes" | "y" | "true" => Ok(true),
        "no" | "n" | "false" => Ok(false),
        other => bail!("closed answers are yes or no, got {other:?}"),
    }
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    // keep the guard alive until exit so the file writer flushes
    let _guard = init_logging(&cli.log_dir, cli.json_logs);

    let config = match &cli.config {
        Some(path) => AssemblyConfig::load(path)?,
        None => AssemblyConfig::default(),
    };

    match cli.command {
        Commands::Keygen { nickname, out } => {
            let me = Me::generate(&nickname)?;
            if let Some(path) = out {
                let record = serde_json::to_vec_pretty(&me.to_record())?;
                std::fs::write(&path, record).with_context(|| format!("writing {}", path.display()))?;
                println!("saved private key record: {}", path.display());
            }
            println!("{}", serde_json::to_string_pretty(&me.identity_proof())?);
        }

        Commands::VerifyProof { file: path } => {
            let raw = std::fs::read(&path).with_context(|| format!("reading {}", path.display()))?;
            // accept either a proof or a private record, from which the proof is derived
            let proof = match serde_json::from_slice::<IdentityProof>(&raw) {
                Ok(proof) => proof,
                Err(_) => Me::from_record(&serde_json::from_slice::<MeRecord>(&raw)?)?.identity_proof(),
            };
            proof.is_valid()?;
            println!("valid proof for {} ({})", proof.nickname, proof.fingerprint);
        }

        Commands::Ballot { kind, answer } => {
            let ballot = match kind {
                Kind::Question => Ballot::question(answer.map(Question::open), &config.ballot)?,
                Kind::Closed => {
                    let answer = answer.context("closed ballots need --answer")?;
                    Ballot::closed(parse_closed(&answer)?, &config.ballot)?
                }
                Kind::Open => Ballot::open(answer.unwrap_or_default(), &config.ballot)?,
            };
            println!("kind:   {:?}", ballot.kind());
            println!("length: {} bytes", ballot.to_bytes()?.len());
            println!("hash:   {}", ballot.hash()?);
        }

        Commands::Simulate { members, min, question, open, answers } => {
            let question = if open { Question::open(question) } else { Question::closed(question) };
            let config = AssemblyConfig { min_participants: min.unwrap_or(members), ..config };
            config.validate()?;
            let runtime = tokio::runtime::Runtime::new()?;
            runtime.block_on(simulate(config, members, question, answers))?;
        }
    }
    Ok(())
}

async fn simulate(config: AssemblyConfig, count: usize, question: Question, answers: Vec<String>) -> Result<()> {
    if answers.len() != count {
        bail!("{count} members need {count} answers, got {}", answers.len());
    }
    let config = AssemblyConfig { auto_accept: true, ..config };
    let assembly = AssemblyDescriptor {
        id: "simulated".into(),
        secret: "simulated-secret".into(),
        name: "Simulated assembly".into(),
    };
    let relay = LocalRelay::new(assembly.clone(), config.min_participants, vec![question.clone()]);

    let mut sessions = Vec::with_capacity(count);
    for i in 0..count {
        let membership = Membership::create(assembly.clone(), &format!("member-{}", i + 1))?;
        let session = Session::new(membership, config.clone(), relay.connector())?;
        session.start().await;
        sessions.push(session);
    }

    // Step 1: wait for everyone to see everyone
    for session in &sessions {
        tokio::time::timeout(Duration::from_secs(10), async {
            loop {
                if matches!(session.status().await, Status::Waiting { readiness, .. } if readiness.len() == count) {
                    break;
                }
                tokio::time::sleep(Duration::from_millis(20)).await;
            }
        })
        .await
        .context("members never saw each other")?;
    }

    // Step 2: everyone answers
    let mut notifications = sessions[0].subscribe();
    for (session, answer) in sessions.iter().zip(&answers) {
        let ballot = match BallotKind::expected_for(Some(&question)) {
            BallotKind::ClosedAnswer => Ballot::closed(parse_closed(answer)?, &config.ballot)?,
            _ => Ballot::open(answer.clone(), &config.ballot)?,
        };
        session.choose(ballot).await?;
    }

    // Step 3: wait for the verified result
    let outcome = tokio::time::timeout(Duration::from_secs(30), async {
        loop {
            match notifications.recv().await {
                Ok(Notification::HarvestCompleted { harvest, result }) => return Ok((harvest, result)),
                Ok(Notification::HarvestFailed { reason }) | Ok(Notification::Fatal { reason }) => {
                    return Err(anyhow::anyhow!(reason));
                }
                Ok(_) | Err(RecvError::Lagged(_)) => continue,
                Err(e) => return Err(anyhow::anyhow!("notification stream ended: {e}")),
            }
        }
    })
    .await
    .context("harvest did not finish")??;

    let (harvest, result) = outcome;
    info!(harvest = %harvest.id, participants = harvest.participants.len(), "Simulation finished");
    println!("{}", serde_json::to_string_pretty(&result)?);

    for session in &sessions {
        session.stop().await;
    }
    Ok(())
}
