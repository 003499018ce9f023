use agora_at::{
    config::LoggingConfig,
    validator::{CheckReport, IdentityValidator},
};
use anyhow::Context;
use clap::Parser;
use std::path::PathBuf;

#[derive(Parser)]
#[command(name = "did-validator")]
#[command(about = "Validate generated agent identities and their published DID documents")]
struct Args {
    /// Directory holding the `<agent>_config.json` records
    #[arg(short, long, default_value = "generated_dids/private")]
    config_dir: PathBuf,

    /// Validate a single agent
    #[arg(short, long)]
    agent: Option<String>,

    /// Skip fetching the published documents
    #[arg(long)]
    local_only: bool,

    /// Fetch documents over plain HTTP
    #[arg(long)]
    http: bool,

    /// Fetch documents from `<mirror>/<handle>/.well-known/did.json`
    #[arg(long)]
    mirror: Option<String>,
}

fn print_report(title: &str, report: &CheckReport) {
    println!("  {title}: {}", if report.valid { "VALID" } else { "INVALID" });
    for message in &report.messages {
        println!("    {message}");
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    LoggingConfig::default().init();

    let args = Args::parse();

    let mut validator = IdentityValidator::load(&args.config_dir)
        .with_context(|| format!("failed to read {}", args.config_dir.display()))?
        .use_https(!args.http);
    if let Some(mirror) = args.mirror {
        validator = validator.mirror(mirror);
    }

    let agents: Vec<String> = match &args.agent {
        Some(agent) => vec![agent.to_lowercase()],
        None => validator.agents().map(str::to_string).collect(),
    };
    if agents.is_empty() {
        println!("No identity records found in {}", args.config_dir.display());
        std::process::exit(1);
    }

    let mut all_valid = true;
    for agent in &agents {
        println!("\nAgent: {agent}");
        let local = validator.validate_local(agent);
        print_report("Local", &local);
        all_valid &= local.valid;

        if !args.local_only {
            let remote = validator.validate_remote(agent).await;
            print_report("Remote", &remote);
            all_valid &= remote.valid;
        }
    }

    println!("\nOverall: {}", if all_valid { "VALID" } else { "INVALID" });
    if !all_valid {
        std::process::exit(1);
    }
    Ok(())
}
