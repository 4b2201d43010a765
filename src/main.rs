use clap::{Parser, Subcommand, ValueEnum};
use stackrig::cli;
use stackrig::config::parse_duration;
use stackrig::docker::compose::RemoveImages;
use std::path::PathBuf;
use std::time::Duration;

#[derive(Parser)]
#[command(name = "rig")]
#[command(about = "Docker test fixtures: Compose stacks and Kafka clusters", long_about = None)]
#[command(version)]
struct Cli {
    /// Config file (defaults to .stackrig.yml found upward from the current directory)
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// Increase log verbosity (-v info, -vv debug, -vvv trace)
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    verbose: u8,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Check Docker and Compose availability
    Doctor,
    /// Manage Compose stacks
    Compose {
        #[command(subcommand)]
        command: ComposeCommands,
    },
    /// Run Kafka clusters
    Kafka {
        #[command(subcommand)]
        command: KafkaCommands,
    },
    /// Inspect local images
    Image {
        #[command(subcommand)]
        command: ImageCommands,
    },
}

#[derive(clap::Args)]
struct StackArgs {
    /// Compose file
    #[arg(short, long)]
    file: Option<PathBuf>,
    /// Compose project name (random when omitted)
    #[arg(short, long)]
    project: Option<String>,
    /// Build images before starting
    #[arg(long)]
    build: bool,
    /// Remove images when the stack is brought down
    #[arg(long, value_enum)]
    rmi: Option<RmiMode>,
    /// Wait for a service port to be published, as service:port
    #[arg(long = "expose")]
    expose: Vec<String>,
}

#[derive(Clone, Copy, ValueEnum)]
enum RmiMode {
    Local,
    All,
}

impl From<RmiMode> for RemoveImages {
    fn from(mode: RmiMode) -> Self {
        match mode {
            RmiMode::Local => RemoveImages::Local,
            RmiMode::All => RemoveImages::All,
        }
    }
}

impl From<StackArgs> for cli::compose::StackOptions {
    fn from(args: StackArgs) -> Self {
        Self {
            file: args.file,
            project: args.project,
            build: args.build,
            remove_images: args.rmi.map(Into::into),
            expose: args.expose,
        }
    }
}

#[derive(Subcommand)]
enum ComposeCommands {
    /// Start a stack and leave it running
    Up(StackArgs),
    /// Tear down a running stack
    Down(StackArgs),
    /// Start a stack, run a command, tear the stack down
    Run {
        #[command(flatten)]
        stack: StackArgs,
        /// Command to run while the stack is up
        #[arg(last = true, required = true)]
        command: Vec<String>,
    },
}

#[derive(Subcommand)]
enum KafkaCommands {
    /// Start a cluster, run a command with KAFKA_BOOTSTRAP_SERVERS set, stop the cluster
    Run {
        /// Confluent platform version
        #[arg(long = "confluent-version")]
        version: Option<String>,
        /// Number of brokers
        #[arg(long)]
        brokers: Option<usize>,
        /// Replication factor for internal topics
        #[arg(long)]
        rf: Option<usize>,
        /// Command to run while the cluster is up
        #[arg(last = true, required = true)]
        command: Vec<String>,
    },
}

#[derive(Subcommand)]
enum ImageCommands {
    /// Exit 0 when an image is present locally
    Present {
        /// Image reference, e.g. redis:7-alpine
        reference: String,
        /// Wait until the image is present ("present") or gone ("absent")
        #[arg(long, value_parser = ["present", "absent"])]
        expect: Option<String>,
        /// How long to wait with --expect (e.g. 10s)
        #[arg(long, value_parser = parse_timeout)]
        timeout: Option<Duration>,
    },
}

fn parse_timeout(value: &str) -> Result<Duration, String> {
    parse_duration(value).map_err(|e| e.to_string())
}

fn run(cli: Cli) -> anyhow::Result<i32> {
    let config = cli::load_config(cli.config.as_deref())?;

    let code = match cli.command {
        Commands::Doctor => cli::doctor::run(&config)?,
        Commands::Compose { command } => match command {
            ComposeCommands::Up(args) => cli::compose::up(&config, args.into())?,
            ComposeCommands::Down(args) => cli::compose::down(&config, args.into())?,
            ComposeCommands::Run { stack, command } => {
                cli::compose::run(&config, stack.into(), command)?
            }
        },
        Commands::Kafka { command } => match command {
            KafkaCommands::Run {
                version,
                brokers,
                rf,
                command,
            } => cli::kafka::run(
                &config,
                cli::kafka::ClusterOptions {
                    version,
                    brokers,
                    internal_topics_rf: rf,
                },
                command,
            )?,
        },
        Commands::Image { command } => match command {
            ImageCommands::Present {
                reference,
                expect,
                timeout,
            } => cli::image::present(
                &config,
                &reference,
                expect.map(|e| e == "present"),
                timeout,
            )?,
        },
    };

    Ok(code)
}

fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    stackrig::logging::init(cli.verbose);

    // Fixtures are dropped inside `run`, before the process exits
    let code = run(cli)?;
    std::process::exit(code);
}
