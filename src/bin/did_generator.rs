use agora_at::{
    config::{AppConfig, IdentityConfig, LoggingConfig},
    publisher::{self, IdentityPublisher, PRIVATE_DIR},
};
use anyhow::{bail, Context};
use clap::Parser;
use std::path::{Path, PathBuf};

#[derive(Parser)]
#[command(name = "did-generator")]
#[command(about = "Generate did:web identities for AT Protocol agents")]
struct Args {
    /// Domain the agent handles live under, e.g. example.com
    domain: Option<String>,

    #[arg(short, long, num_args = 1..)]
    agents: Vec<String>,

    #[arg(short, long)]
    output: Option<PathBuf>,

    /// Read `[identity]` settings from this file; arguments take precedence
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Replace existing identities with freshly generated keys
    #[arg(long)]
    force: bool,
}

fn has_identities(output: &Path) -> bool {
    std::fs::read_dir(output.join(PRIVATE_DIR))
        .map(|mut entries| entries.next().is_some())
        .unwrap_or(false)
}

fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    let config = match &args.config {
        Some(path) => Some(
            AppConfig::load_with_env_overrides(path)
                .with_context(|| format!("failed to load {}", path.display()))?,
        ),
        None => None,
    };
    match &config {
        Some(config) => config.logging.init(),
        None => LoggingConfig::default().init(),
    }

    let base = match config {
        Some(config) => config.identity,
        None => IdentityConfig {
            domain: String::new(),
            agents: Vec::new(),
            ..IdentityConfig::default()
        },
    };
    let identity = base.merged(args.domain, args.agents, args.output);
    let agents = identity
        .agent_pairs()
        .context("pass --agents or list them under [identity] in --config")?;
    let output = identity.output_dir;

    if has_identities(&output) && !args.force {
        bail!(
            "{} already holds agent identities; rerun with --force to replace their keys",
            output.display()
        );
    }

    let staged = IdentityPublisher::new()
        .stage(&agents, &output)
        .context("failed to generate identities")?;
    let guide = publisher::write_deployment_guide(&staged, &output)
        .context("failed to write deployment guide")?;

    for (name, identity) in &staged {
        println!("{name}");
        println!("  DID:      {}", identity.did);
        println!("  Document: {}", identity.did_document.display());
        println!("  Key:      {}", identity.private_key.display());
    }
    println!("\nDeployment guide: {}", guide.display());
    println!("Keep {} private.", output.join(PRIVATE_DIR).display());

    Ok(())
}
