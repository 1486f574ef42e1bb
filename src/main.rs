use anyhow::Result;
use clap::{Args, Parser, Subcommand};
use composable_frontends::{
    CompositionGraph, EventEnvelope, FileFetcher, HOST_OWNER, Manifest, ModuleRegistry,
    RegistryConfig, StaticManifestSource, load_manifests, validate_with,
};
use rustyline::Editor;
use rustyline::error::ReadlineError;
use rustyline::history::DefaultHistory;
use std::path::PathBuf;
use std::sync::Arc;
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "composable-frontends")]
#[command(about = "A composition runtime for independently built UI modules")]
struct Cli {
    #[command(flatten)]
    mode: ModeArgs,

    /// Registry configuration file (.toml)
    #[arg(long, short)]
    config: Option<PathBuf>,

    /// Module manifest files (.toml or .json)
    #[arg(required = true)]
    manifests: Vec<PathBuf>,
}

#[derive(Args)]
#[group(required = true, multiple = false)]
struct ModeArgs {
    /// Perform a dry run, printing the validated manifests and resolution plan without loading
    #[arg(long, short)]
    dry_run: bool,

    /// Export the planned composition graph to DOT file (graph.dot)
    #[arg(long, short)]
    export: bool,

    /// Start interactive session for loading modules and publishing events
    #[arg(long, short)]
    interactive: bool,
}

#[derive(Subcommand)]
enum Commands {
    /// List registered modules
    List,
    /// Show details for a module
    Status { id: String },
    /// Load a module
    Load { id: String },
    /// Unload a module
    Unload { id: String },
    /// Print events published on a topic
    Subscribe { topic: String },
    /// Publish a text event
    Publish { topic: String, payload: String },
    /// Show dependency buckets
    Buckets,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let cli = Cli::parse();
    let config = match &cli.config {
        Some(path) => RegistryConfig::from_file(path)?,
        None => RegistryConfig::default(),
    };

    println!("Loading manifests from: {:?}...", cli.manifests);
    let raw_manifests = load_manifests(&cli.manifests)?;

    if cli.mode.dry_run || cli.mode.export {
        let policy = config.validation_policy();
        let manifests = raw_manifests
            .iter()
            .map(|raw| {
                validate_with(raw, &policy)
                    .map_err(|e| anyhow::anyhow!("Manifest '{}' is invalid: {e}", raw.id))
            })
            .collect::<Result<Vec<Manifest>>>()?;
        let graph = CompositionGraph::plan(
            &manifests,
            config.singleton_dependencies.iter().cloned().collect(),
        );

        if cli.mode.dry_run {
            println!("--- Composition Plan (Dry Run) ---");
            println!("{graph:#?}");
            println!("----------------------------------");
        } else {
            let filename = "graph.dot";
            graph.write_dot_file(filename)?;
            println!("Graph exported to {filename}");
        }
    } else if cli.mode.interactive {
        let registry = ModuleRegistry::builder()
            .with_config(config)
            .with_fetcher(Arc::new(FileFetcher::new()))
            .build()?;
        registry
            .register_from(&StaticManifestSource::new(raw_manifests))
            .await?;
        run_interactive_session(&registry).await?;
        registry.shutdown().await;
    }

    Ok(())
}

async fn run_interactive_session(registry: &ModuleRegistry) -> Result<()> {
    println!(
        "Registered {} modules. Type 'help' for commands.",
        registry.list().len()
    );

    let mut rl = Editor::<(), DefaultHistory>::new()?;
    loop {
        let readline = rl.readline("> ");
        match readline {
            Ok(line) => {
                let _ = rl.add_history_entry(line.as_str());
                if handle_command(line, registry).await.is_err() {
                    break;
                }
            }
            Err(ReadlineError::Interrupted) => {
                println!("CTRL-C");
                break;
            }
            Err(ReadlineError::Eof) => {
                println!("CTRL-D");
                break;
            }
            Err(err) => {
                eprintln!("Error: {err:?}");
                break;
            }
        }
    }

    Ok(())
}

fn require_arg(parts: &[String], usage: &str) -> Option<String> {
    let arg = parts.get(1).cloned();
    if arg.is_none() {
        eprintln!("Usage: {usage}");
    }
    arg
}

async fn handle_command(line: String, registry: &ModuleRegistry) -> Result<(), ()> {
    let parts = parse_quoted_args(&line);
    let Some(command_str) = parts.first() else {
        return Ok(());
    };

    let command = match command_str.as_str() {
        "list" => Some(Commands::List),
        "buckets" => Some(Commands::Buckets),
        "status" => require_arg(&parts, "status <id>").map(|id| Commands::Status { id }),
        "load" => require_arg(&parts, "load <id>").map(|id| Commands::Load { id }),
        "unload" => require_arg(&parts, "unload <id>").map(|id| Commands::Unload { id }),
        "subscribe" => {
            require_arg(&parts, "subscribe <topic>").map(|topic| Commands::Subscribe { topic })
        }
        "publish" => match (parts.get(1), parts.get(2)) {
            (Some(topic), Some(_)) => Some(Commands::Publish {
                topic: topic.clone(),
                payload: parts[2..].join(" "),
            }),
            _ => {
                eprintln!("Usage: publish <topic> <payload>");
                None
            }
        },
        "help" => {
            println!("Available commands:");
            println!("  list                            - List registered modules");
            println!("  status <id>                     - Show details for a module");
            println!("  load <id>                       - Load a module");
            println!("  unload <id>                     - Unload a module");
            println!("  subscribe <topic>               - Print events published on a topic");
            println!("  publish <topic> <payload>       - Publish a text event");
            println!("  buckets                         - Show dependency buckets");
            println!("  help                            - Show this help message");
            println!("  exit, quit                      - Exit the interactive session");
            None
        }
        "exit" | "quit" => return Err(()),
        _ => {
            eprintln!("Unknown command. Type 'help' for a list of commands.");
            None
        }
    };

    let Some(command) = command else {
        return Ok(());
    };
    match command {
        Commands::List => {
            for status in registry.list() {
                println!("- {} {} [{}]", status.id, status.version, status.state);
            }
        }
        Commands::Status { id } => match registry.get_status(&id) {
            Ok(status) => {
                println!("Module: {} {}", status.id, status.version);
                println!("Entry: {}", status.entry);
                println!("State: {}", status.state);
                if let Some(error) = &status.error {
                    println!("Error: {error}");
                }
                if status.bindings.is_empty() {
                    println!("Bindings: (none)");
                } else {
                    println!("Bindings:");
                    for (dependency, bucket) in &status.bindings {
                        println!("- {dependency} -> bucket {bucket}");
                    }
                }
            }
            Err(e) => eprintln!("Error: {e}"),
        },
        Commands::Load { id } => match registry.load(&id).await {
            Ok(_) => println!("Loaded {id}"),
            Err(e) => eprintln!("Error: {e}"),
        },
        Commands::Unload { id } => match registry.unload(&id).await {
            Ok(outcome) => println!("Unloaded {id} ({outcome:?})"),
            Err(e) => eprintln!("Error: {e}"),
        },
        Commands::Subscribe { topic } => {
            let subscription = registry.event_bus().subscribe(&topic, HOST_OWNER, print_event);
            println!("Subscribed to '{}' ({})", subscription.topic, subscription.id);
        }
        Commands::Publish { topic, payload } => {
            let envelope = registry.event_bus().publish(&topic, payload, HOST_OWNER);
            println!("Published #{} on '{topic}'", envelope.sequence);
        }
        Commands::Buckets => {
            let buckets = registry.dependency_buckets();
            if buckets.is_empty() {
                println!("(no buckets)");
            }
            for bucket in buckets {
                let kind = if bucket.private { "isolated" } else { "shared" };
                println!(
                    "- {}#{} {} [{kind}] members: {}",
                    bucket.dependency,
                    bucket.id,
                    bucket.range,
                    bucket.members.join(", ")
                );
            }
        }
    }
    Ok(())
}

fn print_event(envelope: &EventEnvelope) -> Result<()> {
    match envelope.payload::<String>() {
        Some(text) => println!(
            "[{} #{} from {}] {text}",
            envelope.topic, envelope.sequence, envelope.source
        ),
        None => println!(
            "[{} #{} from {}] <non-text payload>",
            envelope.topic, envelope.sequence, envelope.source
        ),
    }
    Ok(())
}

fn parse_quoted_args(line: &str) -> Vec<String> {
    let mut parts = Vec::new();
    let mut current = String::new();
    let mut quote_char: Option<char> = None;

    for ch in line.trim().chars() {
        match (ch, quote_char) {
            ('"', None) | ('\'', None) => {
                // Starting a quoted string
                quote_char = Some(ch);
            }
            (ch, Some(open_char)) if ch == open_char => {
                // Closing a quoted string
                quote_char = None;
            }
            (' ', None) => {
                if !current.is_empty() {
                    parts.push(current);
                    current = String::new();
                }
            }
            (ch, _) => {
                current.push(ch);
            }
        }
    }
    if !current.is_empty() {
        parts.push(current);
    }
    parts
}

