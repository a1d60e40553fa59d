use std::io::{self, Write};
use std::path::{Path, PathBuf};

use clap::{ArgAction, Args, Parser, Subcommand};
use kubengine_cli_core::cluster::{cluster_file_path, load_cluster, validate_deploy_src};
use kubengine_cli_core::config::{ensure_home_dir, load_settings};
use kubengine_cli_core::credentials::{resolve_credentials, CredentialArgs};
use kubengine_cli_core::{audit, logging, render, state, CliError, EXIT_CONFIG};
use kubengine_executor::{CancellationToken, Orchestrator};
use kubengine_ssh::ProcessSshClient;

#[derive(Parser)]
#[command(name = "kubengine")]
#[command(about = "Offline Kubernetes cluster bootstrap over SSH", long_about = None)]
struct KubengineCli {
    /// Working directory for settings, state and logs.
    #[arg(long, global = true)]
    home: Option<PathBuf>,
    /// Cluster description file (defaults to <home>/cluster.yaml).
    #[arg(long, global = true)]
    config: Option<PathBuf>,
    #[arg(short, long, action = ArgAction::Count, global = true)]
    verbose: u8,
    #[command(subcommand)]
    command: KubengineCommand,
}

#[derive(Subcommand)]
enum KubengineCommand {
    Deploy(DeployCommand),
    Config(ConfigCommand),
    ResetState(ResetStateCommand),
}

#[derive(Args)]
struct DeployCommand {
    /// Offline bundle root on the master.
    #[arg(long)]
    deploy_src: Option<String>,
    /// Print the resolved cluster and step plan, then exit.
    #[arg(long)]
    show_config: bool,
    /// Re-run steps already recorded as successful.
    #[arg(long)]
    force: bool,
    #[arg(long)]
    yes: bool,
    #[arg(long)]
    json: bool,
    #[arg(long)]
    user: Option<String>,
    #[arg(long)]
    port: Option<u16>,
    #[arg(long)]
    identity_file: Option<String>,
    /// Environment variable holding the SSH password.
    #[arg(long)]
    password_env: Option<String>,
}

#[derive(Args)]
struct ConfigCommand {
    #[arg(long, conflicts_with = "validate")]
    show: bool,
    #[arg(long)]
    validate: bool,
}

#[derive(Args)]
struct ResetStateCommand {
    #[arg(long)]
    force: bool,
    #[arg(long)]
    node: Option<String>,
    #[arg(long, requires = "node")]
    step: Option<String>,
}

fn main() {
    match run() {
        Ok(code) => std::process::exit(code),
        Err(err) => {
            eprintln!("error: {err}");
            if let Some(hint) = err.hint() {
                eprintln!("hint: {hint}");
            }
            std::process::exit(err.exit_code());
        }
    }
}

fn run() -> Result<i32, CliError> {
    let cli = KubengineCli::parse();
    logging::init_logging(cli.verbose);
    let home = ensure_home_dir(cli.home.as_deref())?;
    let cluster_path = cluster_file_path(&home, cli.config.as_deref());
    match cli.command {
        KubengineCommand::Deploy(cmd) => handle_deploy(&home, &cluster_path, cmd),
        KubengineCommand::Config(cmd) => handle_config(&cluster_path, cmd).map(|_| 0),
        KubengineCommand::ResetState(cmd) => handle_reset_state(&home, cmd),
    }
}

fn handle_deploy(home: &Path, cluster_path: &Path, cmd: DeployCommand) -> Result<i32, CliError> {
    let settings = load_settings(home)?;
    let loaded = load_cluster(cluster_path)?;
    let deploy_src = validate_deploy_src(cmd.deploy_src.as_deref().unwrap_or(&settings.deploy_src))?;

    if cmd.show_config {
        print!("{}", render::render_config(&loaded.config, &loaded.registry)?);
        return Ok(0);
    }

    let credentials = resolve_credentials(
        &settings,
        &CredentialArgs {
            user: cmd.user,
            port: cmd.port,
            identity_file: cmd.identity_file,
            password_env: cmd.password_env,
        },
    )?;

    if !cmd.yes {
        let label = format!(
            "Deploy {} step(s) to {} node(s) from {}? [y/N] ",
            loaded.registry.len(),
            loaded.config.nodes.len(),
            loaded.path.display()
        );
        if !prompt_yes_no(&label)? {
            println!("aborted");
            return Ok(EXIT_CONFIG);
        }
    }

    let cancel = CancellationToken::new();
    let handler_token = cancel.clone();
    if let Err(err) = ctrlc::set_handler(move || {
        eprintln!("interrupt received, finishing in-flight steps");
        handler_token.cancel();
    }) {
        tracing::warn!(error = %err, "failed to install interrupt handler");
    }

    let client = ProcessSshClient::with_config(settings.ssh_config()).with_stop_flag(cancel.flag());
    let store = state::open_state_store(home);
    let history = state::open_history(home);

    let json = cmd.json;
    let mut orchestrator = Orchestrator::new(
        &loaded.config,
        &loaded.registry,
        &client,
        &store,
        credentials,
        settings.deploy_options(&deploy_src, cmd.force),
    )
    .with_history(&history)
    .with_cancellation(cancel);
    if !json {
        orchestrator =
            orchestrator.with_progress_callback(|entry| println!("{}", render::render_progress(entry)));
    }

    audit::audit(
        home,
        &format!(
            "deploy start config={} nodes={} force={}",
            loaded.path.display(),
            loaded.config.nodes.len(),
            cmd.force
        ),
    );
    let report = orchestrator.deploy()?;
    let summary = report.summary();
    audit::audit(
        home,
        &format!(
            "deploy finish success={} succeeded={} skipped={} failed={} pending={} cancelled={}",
            report.is_success(),
            summary.success,
            summary.skipped,
            summary.failed,
            summary.pending,
            report.cancelled
        ),
    );

    if json {
        println!("{}", render::render_report_json(&report)?);
    } else {
        print!("{}", render::render_report(&report, &loaded.config));
    }
    Ok(report.exit_code())
}

fn handle_config(cluster_path: &Path, cmd: ConfigCommand) -> Result<(), CliError> {
    let loaded = load_cluster(cluster_path)?;
    if cmd.validate && !cmd.show {
        let groups = loaded.registry.resolve()?.len();
        println!(
            "{} is valid: {} node(s), {} step(s) in {} group(s)",
            loaded.path.display(),
            loaded.config.nodes.len(),
            loaded.registry.len(),
            groups
        );
        return Ok(());
    }
    print!("{}", render::render_config(&loaded.config, &loaded.registry)?);
    Ok(())
}

fn handle_reset_state(home: &Path, cmd: ResetStateCommand) -> Result<i32, CliError> {
    let scope = state::reset_scope(cmd.node.as_deref(), cmd.step.as_deref())?;
    if !cmd.force {
        let label = format!("Reset deployment state ({scope})? Completed steps will run again. [y/N] ");
        if !prompt_yes_no(&label)? {
            println!("aborted");
            return Ok(EXIT_CONFIG);
        }
    }
    let removed = state::reset_state(home, &scope)?;
    audit::audit(home, &format!("reset-state scope={scope} removed={removed}"));
    println!("removed {removed} recorded step result(s)");
    Ok(0)
}

fn prompt_yes_no(label: &str) -> Result<bool, CliError> {
    let mut input = String::new();
    print!("{label}");
    io::stdout().flush()?;
    io::stdin().read_line(&mut input)?;
    let value = input.trim().to_lowercase();
    Ok(matches!(value.as_str(), "y" | "yes"))
}
