use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use indicatif::{ProgressBar, ProgressStyle};
use std::path::PathBuf;
use tracing_subscriber::EnvFilter;

use memory_crystal::backend::{self, MemoryBackend};
use memory_crystal::config::{ConfigOverrides, CrystalConfig};
use memory_crystal::crypto;
use memory_crystal::memory::search::SearchFilter;
use memory_crystal::memory::types::{CandidateChunk, MemoryCategory, Role};
use memory_crystal::memory::{capture, ingest};
use memory_crystal::relay::client::RelayClient;
use memory_crystal::relay::server::DeadDropConfig;
use memory_crystal::relay::{mirror, poller};
use memory_crystal::{db, embedding, private, sources, watermark};

#[derive(Parser)]
#[command(name = "crystal", version, about = "Local-first memory substrate for AI agents")]
struct Cli {
    /// Data directory override (default: probed per config rules)
    #[arg(long, global = true)]
    data_dir: Option<PathBuf>,

    /// Agent id override
    #[arg(long, global = true)]
    agent: Option<String>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Run the dead drop relay server
    Serve,
    /// Poll the conversations channel into the local store
    Poll {
        /// Run one pass and exit
        #[arg(long)]
        once: bool,
        /// Seconds between passes
        #[arg(long, default_value_t = 60)]
        interval: u64,
    },
    /// Sync a source collection from disk
    Sync {
        /// Collection name
        collection: String,
        /// Compute counts without embedding or writing
        #[arg(long)]
        dry_run: bool,
    },
    /// Manage source collections
    Collections {
        #[command(subcommand)]
        action: CollectionsAction,
    },
    /// Hybrid search over the corpus
    Search {
        query: String,
        #[arg(long, default_value_t = 5)]
        limit: usize,
        /// Filter by agent id
        #[arg(long)]
        from_agent: Option<String>,
        /// Filter by source type (conversation, file, manual)
        #[arg(long)]
        source_type: Option<String>,
        /// Emit JSON instead of a table
        #[arg(long)]
        json: bool,
    },
    /// Store an explicit fact
    Remember {
        text: String,
        #[arg(long, default_value = "fact")]
        category: String,
    },
    /// Deprecate an explicit fact
    Forget { id: i64 },
    /// Show store counters
    Status {
        /// Include an integrity health check
        #[arg(long)]
        deep: bool,
    },
    /// Push or pull full-store mirrors
    Mirror {
        #[command(subcommand)]
        action: MirrorAction,
    },
    /// Control the capture gate
    Private {
        #[command(subcommand)]
        action: PrivateAction,
    },
    /// Capture the unprocessed tail of a transcript file
    Capture {
        /// Path to a line-delimited JSON transcript
        transcript: PathBuf,
        /// Session id for the capture watermark
        #[arg(long)]
        session: Option<String>,
    },
}

#[derive(Subcommand)]
enum CollectionsAction {
    /// Register a directory for indexing
    Add {
        name: String,
        root: PathBuf,
        /// Include patterns, e.g. **/*.md (default: everything)
        #[arg(long = "include")]
        include: Vec<String>,
        /// Ignore patterns, e.g. **/node_modules/**
        #[arg(long = "ignore")]
        ignore: Vec<String>,
    },
    /// List registered collections
    List,
}

#[derive(Subcommand)]
enum MirrorAction {
    /// Seal the local store and drop it on the mirror channel
    Push,
    /// Fetch, verify, and atomically apply the latest snapshot
    Pull {
        /// Apply even when the hash matches the last applied snapshot
        #[arg(long)]
        force: bool,
    },
}

#[derive(Subcommand)]
enum PrivateAction {
    /// Disable capture (enter private mode)
    On,
    /// Re-enable capture
    Off,
    /// Show the current gate state
    Status,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    // Log to stderr so stdout stays clean for JSON output
    let filter = EnvFilter::try_from_env("CRYSTAL_LOG").unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();

    let config = CrystalConfig::load_with(ConfigOverrides {
        data_dir: cli.data_dir,
        agent_id: cli.agent,
        provider: None,
    })?;

    match cli.command {
        Command::Serve => {
            if config.relay.agents.is_empty() {
                anyhow::bail!("no agents configured — set CRYSTAL_RELAY_AGENTS=token:name,...");
            }
            memory_crystal::relay::server::serve(DeadDropConfig {
                bind: config.relay.bind.clone(),
                blob_dir: config.data_dir.join("dead-drop"),
                agents: config.relay.agents.clone(),
            })
            .await?;
        }

        Command::Poll { once, interval } => {
            let mut conn = db::open_database(config.db_path())?;
            let embedder = embedding::create_client(&config.embedding)?;
            let (relay, key) = relay_client(&config)?;

            if once {
                let outcome =
                    poller::poll_once(&mut conn, &*embedder, &relay, &key, &config.data_dir)
                        .await?;
                println!(
                    "{} blobs, {} chunks ingested, {} poisoned",
                    outcome.blobs, outcome.ingested, outcome.poisoned
                );
            } else {
                poller::run(&mut conn, &*embedder, &relay, &key, &config.data_dir, interval)
                    .await?;
            }
        }

        Command::Sync { collection, dry_run } => {
            let mut conn = db::open_database(config.db_path())?;
            let embedder = embedding::create_client(&config.embedding)?;

            let spinner = ProgressBar::new_spinner();
            spinner.set_style(
                ProgressStyle::default_spinner()
                    .template("{spinner} {msg}")
                    .expect("valid template"),
            );
            spinner.set_message(format!("syncing {collection}"));
            spinner.enable_steady_tick(std::time::Duration::from_millis(120));

            let report =
                sources::sync_collection(&mut conn, &*embedder, &collection, dry_run).await?;
            spinner.finish_and_clear();

            let prefix = if report.dry_run { "would " } else { "" };
            println!(
                "{prefix}add {} / update {} / remove {} ({} unchanged, {} chunks indexed)",
                report.added, report.updated, report.removed, report.unchanged, report.chunks_indexed
            );
        }

        Command::Collections { action } => {
            let conn = db::open_database(config.db_path())?;
            match action {
                CollectionsAction::Add {
                    name,
                    root,
                    include,
                    mut ignore,
                } => {
                    if ignore.is_empty() {
                        ignore = vec!["**/node_modules/**".into(), "**/target/**".into()];
                    }
                    let root = std::fs::canonicalize(&root)
                        .with_context(|| format!("cannot resolve {}", root.display()))?;
                    let id = sources::add_collection(&conn, &name, &root, &include, &ignore)?;
                    println!("collection {name} registered (id {id})");
                }
                CollectionsAction::List => {
                    for c in sources::list_collections(&conn)? {
                        println!(
                            "{}  {}  {} files, {} chunks, last sync {}",
                            c.name,
                            c.root_path,
                            c.file_count,
                            c.chunk_count,
                            c.last_sync.as_deref().unwrap_or("never")
                        );
                    }
                }
            }
        }

        Command::Search {
            query,
            limit,
            from_agent,
            source_type,
            json,
        } => {
            let backend = backend::create_backend(&config)?;
            let filter = SearchFilter {
                agent_id: from_agent,
                source_type,
            };
            let hits = backend.search(&query, limit, &filter).await?;

            if json {
                println!("{}", serde_json::to_string_pretty(&hits)?);
            } else if hits.is_empty() {
                println!("no results");
            } else {
                for hit in &hits {
                    println!(
                        "[{:.2}] ({}) {} — {}",
                        hit.score,
                        hit.freshness,
                        hit.created_at,
                        preview(&hit.text, 120)
                    );
                }
            }
        }

        Command::Remember { text, category } => {
            let category: MemoryCategory = category
                .parse()
                .map_err(|e: String| anyhow::anyhow!(e))?;
            let backend = backend::create_backend(&config)?;
            match backend.remember(&text, category).await? {
                Some(id) => println!("remembered as memory {id}"),
                None => println!("capture is disabled — nothing stored"),
            }
        }

        Command::Forget { id } => {
            let backend = backend::create_backend(&config)?;
            if backend.forget(id).await? {
                println!("memory {id} deprecated");
            } else {
                println!("memory {id} not found or not active");
            }
        }

        Command::Status { deep } => {
            let backend = backend::create_backend(&config)?;
            let snapshot = backend.status().await?;
            println!("data dir:          {}", snapshot.data_dir);
            println!("provider:          {}", snapshot.embedding_provider);
            println!("chunks:            {}", snapshot.chunk_count);
            println!("active memories:   {}", snapshot.active_memories);
            println!("source files:      {}", snapshot.source_files);
            println!("agents:            {}", snapshot.agents.join(", "));
            println!(
                "chunk time range:  {} .. {}",
                snapshot.oldest_chunk.as_deref().unwrap_or("-"),
                snapshot.newest_chunk.as_deref().unwrap_or("-")
            );
            println!("captured sessions: {}", snapshot.captured_sessions);
            println!(
                "last capture:      {}",
                snapshot.last_capture.as_deref().unwrap_or("-")
            );

            if deep {
                let conn = db::open_database(config.db_path())?;
                let health = db::check_database_health(&conn)?;
                println!("schema version:    {}", health.schema_version);
                println!("sqlite-vec:        {}", health.sqlite_vec_version);
                println!(
                    "vector dim:        {}",
                    health
                        .vector_dim
                        .map(|d| d.to_string())
                        .unwrap_or_else(|| "unset".into())
                );
                println!(
                    "integrity:         {}",
                    if health.integrity_ok {
                        "ok"
                    } else {
                        health.integrity_details.as_str()
                    }
                );
            }
        }

        Command::Mirror { action } => {
            let (relay, key) = relay_client(&config)?;
            match action {
                MirrorAction::Push => {
                    let receipt = mirror::push(&relay, &key, &config.db_path()).await?;
                    println!("mirror pushed as blob {} ({} bytes)", receipt.id, receipt.size);
                }
                MirrorAction::Pull { force } => {
                    let state_path = config.data_dir.join("mirror_state.json");
                    let outcome =
                        mirror::pull(&relay, &key, &config.db_path(), &state_path, force).await?;
                    if outcome.applied {
                        println!(
                            "mirror applied ({})",
                            outcome.hash.as_deref().unwrap_or("unknown hash")
                        );
                    } else {
                        println!("mirror already current");
                    }
                }
            }
        }

        Command::Private { action } => match action {
            PrivateAction::On => {
                private::set_capture_enabled(&config.data_dir, false)?;
                println!("private mode on — capture paused");
            }
            PrivateAction::Off => {
                private::set_capture_enabled(&config.data_dir, true)?;
                println!("private mode off — capture resumed");
            }
            PrivateAction::Status => {
                if private::capture_enabled(&config.data_dir) {
                    println!("capture enabled");
                } else {
                    println!("private mode on — capture paused");
                }
            }
        },

        Command::Capture { transcript, session } => {
            if !private::capture_enabled(&config.data_dir) {
                println!("capture is disabled — nothing captured");
                return Ok(());
            }

            let transcript = std::fs::canonicalize(&transcript)
                .with_context(|| format!("cannot resolve {}", transcript.display()))?;
            let mut marks =
                watermark::WatermarkStore::load(config.data_dir.join("watermarks.json"));
            let tail = marks.read_tail(&transcript)?;

            if tail.first_sight {
                println!("first sight of {} — history skipped", transcript.display());
                return Ok(());
            }
            if tail.suppressed {
                println!(
                    "tail below {} tokens — waiting for more",
                    watermark::MIN_CAPTURE_TOKENS
                );
                return Ok(());
            }
            if tail.messages.is_empty() {
                println!("nothing new");
                return Ok(());
            }

            let session_id = session.unwrap_or_else(|| transcript.display().to_string());
            let candidates: Vec<CandidateChunk> = tail
                .messages
                .iter()
                .filter_map(|m| {
                    let text = m.get("text").and_then(|t| t.as_str())?;
                    let role: Role = m
                        .get("role")
                        .and_then(|r| r.as_str())
                        .and_then(|r| r.parse().ok())
                        .unwrap_or(Role::User);
                    Some(CandidateChunk {
                        text: text.to_string(),
                        role,
                        source_type: "conversation".into(),
                        source_id: Some(format!("session:{session_id}")),
                        agent_id: Some(config.agent_id.clone()),
                        created_at: m
                            .get("timestamp")
                            .and_then(|t| t.as_str())
                            .map(str::to_string),
                    })
                })
                .collect();

            let mut conn = db::open_database(config.db_path())?;
            let embedder = embedding::create_client(&config.embedding)?;
            let observed = candidates.len() as i64;
            let outcome = ingest::ingest_with_retry(&mut conn, &*embedder, candidates).await?;
            capture::record_capture(&conn, &config.agent_id, &session_id, observed)?;

            println!(
                "{} chunks ingested ({} duplicates skipped)",
                outcome.inserted, outcome.deduplicated
            );
        }
    }

    Ok(())
}

fn relay_client(config: &CrystalConfig) -> Result<(RelayClient, [u8; crypto::KEY_LEN])> {
    let url = config
        .relay
        .url
        .as_deref()
        .context("CRYSTAL_RELAY_URL not set")?;
    let token = config
        .relay
        .token
        .as_deref()
        .context("CRYSTAL_RELAY_TOKEN not set")?;
    let key = crypto::load_key(&config.relay.key_path)?;
    Ok((RelayClient::new(url, token)?, key))
}

fn preview(text: &str, max_chars: usize) -> String {
    let mut out: String = text.chars().take(max_chars).collect();
    if out.len() < text.len() {
        out.push_str("...");
    }
    out.replace('\n', " ")
}
