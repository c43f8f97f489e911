use std::process::ExitCode;
use std::time::Duration;

use clap::{Parser, ValueEnum};
use tracing_subscriber::EnvFilter;

use mace_consensus::config::{ClusterConfig, FaultConfig};
use mace_consensus::driver::{run_scenario, ClusterDriver, ScenarioConfig, ScenarioReport};
use mace_consensus::shutdown::install_shutdown_handler;

#[derive(Parser, Debug)]
#[command(name = "mace-consensus")]
#[command(version)]
#[command(about = "Leader election and quorum-ratified truth proposals on an in-process cluster")]
#[command(propagate_version = true)]
struct Args {
    #[command(subcommand)]
    command: Commands,
}

#[derive(clap::Subcommand, Debug)]
enum Commands {
    /// Run a scripted scenario and exit non-zero if an invariant broke
    Simulate(SimulateArgs),

    /// Run a live cluster until SIGINT/SIGTERM
    Run(RunArgs),
}

// =============================================================================
// Arguments
// =============================================================================

#[derive(Parser, Debug)]
struct ClusterArgs {
    /// Number of members
    #[arg(long, short = 'n', default_value = "5")]
    members: usize,

    /// Probability that a message between members is lost (0.0 - 1.0)
    #[arg(long, default_value = "0.0")]
    drop_rate: f64,

    /// Probability that a request between members is delivered twice
    #[arg(long, default_value = "0.0")]
    duplicate_rate: f64,

    /// Upper bound of random delivery delay between members
    #[arg(long, default_value = "0")]
    max_delay_ms: u64,

    /// Seed for fault injection, random when omitted
    #[arg(long)]
    seed: Option<u64>,

    /// Output format
    #[arg(long, short = 'o', default_value = "table")]
    output: OutputFormat,
}

impl ClusterArgs {
    fn cluster_config(&self) -> ClusterConfig {
        ClusterConfig::new(self.members).with_faults(FaultConfig {
            drop_rate: self.drop_rate,
            duplicate_rate: self.duplicate_rate,
            max_delay_ms: self.max_delay_ms,
            seed: self.seed,
        })
    }
}

#[derive(Parser, Debug)]
struct SimulateArgs {
    #[command(flatten)]
    cluster: ClusterArgs,

    /// Election wait and final settle time
    #[arg(long, default_value = "2000")]
    duration_ms: u64,

    /// Number of proposals to inject
    #[arg(long, short = 'k', default_value = "3")]
    proposals: usize,

    /// Timeout for each proposal
    #[arg(long, default_value = "500")]
    proposal_timeout_ms: u64,

    /// Cut the leader off from its peers halfway through the proposals
    #[arg(long)]
    isolate_leader: bool,
}

#[derive(Parser, Debug)]
struct RunArgs {
    #[command(flatten)]
    cluster: ClusterArgs,

    /// Interval between proposals
    #[arg(long, default_value = "1000")]
    propose_every_ms: u64,

    /// Timeout for each proposal
    #[arg(long, default_value = "500")]
    proposal_timeout_ms: u64,
}

#[derive(Debug, Clone, ValueEnum)]
enum OutputFormat {
    Table,
    Json,
}

// =============================================================================
// Commands
// =============================================================================

async fn simulate(args: SimulateArgs) -> Result<ScenarioReport, Box<dyn std::error::Error>> {
    let config = ScenarioConfig {
        cluster: args.cluster.cluster_config(),
        duration: Duration::from_millis(args.duration_ms),
        proposals: args.proposals,
        proposal_timeout: Duration::from_millis(args.proposal_timeout_ms),
        isolate_leader: args.isolate_leader,
    };
    Ok(run_scenario(config).await?)
}

async fn run_live(args: RunArgs) -> Result<ScenarioReport, Box<dyn std::error::Error>> {
    let shutdown = install_shutdown_handler();
    let mut driver = ClusterDriver::start(args.cluster.cluster_config()).await?;
    let first_leader = driver
        .wait_for_leader(Duration::from_secs(5))
        .await
        .map(|s| s.id);

    let timeout = Duration::from_millis(args.proposal_timeout_ms);
    let mut interval = tokio::time::interval(Duration::from_millis(args.propose_every_ms));
    let mut proposals = Vec::new();

    loop {
        tokio::select! {
            _ = shutdown.cancelled() => break,
            _ = interval.tick() => {
                let payload = format!("truth-{}", proposals.len());
                let result = driver.propose(payload.into_bytes(), timeout).await;
                tracing::info!(
                    committed = result.committed,
                    term = result.term,
                    reason = %result.reason,
                    "Proposal finished"
                );
                proposals.push(result);
            }
        }
    }

    let violations = driver.check_invariants();
    let report = ScenarioReport {
        members: driver.config().members,
        first_leader,
        isolated: None,
        final_leader: driver.leader().map(|s| s.id),
        final_term: driver.max_term(),
        statuses: driver.statuses(),
        committed: proposals.iter().filter(|r| r.committed).count(),
        proposals,
        violations,
    };
    driver.shutdown().await;
    Ok(report)
}

// =============================================================================
// Output
// =============================================================================

fn print_report(report: &ScenarioReport, output: &OutputFormat) -> Result<(), Box<dyn std::error::Error>> {
    match output {
        OutputFormat::Json => {
            println!("{}", serde_json::to_string_pretty(report)?);
        }
        OutputFormat::Table => {
            let leader = |id: Option<u64>| id.map(|id| format!("Node {id}")).unwrap_or_else(|| "none".to_string());

            println!("Cluster Report");
            println!("{}", "=".repeat(40));
            println!("Members:      {}", report.members);
            println!("First leader: {}", leader(report.first_leader));
            if let Some(id) = report.isolated {
                println!("Isolated:     Node {id}");
            }
            println!("Final leader: {}", leader(report.final_leader));
            println!("Final term:   {}", report.final_term);
            println!();
            println!("{:<8} {:<10} {:<6} VOTED FOR", "ID", "ROLE", "TERM");
            println!("{}", "-".repeat(40));
            for status in &report.statuses {
                let voted_for = status.voted_for.map(|v| v.to_string()).unwrap_or_else(|| "-".to_string());
                println!("{:<8} {:<10} {:<6} {}", status.id, status.role.to_string(), status.term, voted_for);
            }
            println!();
            println!("Proposals: {}/{} committed", report.committed, report.proposals.len());
            for (i, result) in report.proposals.iter().enumerate() {
                let outcome = if result.committed { "committed" } else { result.reason.as_str() };
                println!("  #{:<4} term {:<4} {}", i, result.term, outcome);
            }
            println!();
            if report.passed() {
                println!("Invariants: [+] hold");
            } else {
                println!("Invariants: [-] {} violation(s)", report.violations.len());
                for violation in &report.violations {
                    println!("  {violation}");
                }
            }
        }
    }
    Ok(())
}

// =============================================================================
// Main Entry Point
// =============================================================================

#[tokio::main]
async fn main() -> Result<ExitCode, Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let args = Args::parse();

    let (report, output) = match args.command {
        Commands::Simulate(sim_args) => {
            let output = sim_args.cluster.output.clone();
            (simulate(sim_args).await?, output)
        }
        Commands::Run(run_args) => {
            let output = run_args.cluster.output.clone();
            (run_live(run_args).await?, output)
        }
    };

    print_report(&report, &output)?;

    Ok(if report.passed() {
        ExitCode::SUCCESS
    } else {
        ExitCode::FAILURE
    })
}
