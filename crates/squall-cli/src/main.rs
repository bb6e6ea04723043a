use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use squall_vm::{ConsoleLevel, ScriptManager, Vm, VmConfig, set_console_handler};
use std::path::PathBuf;
use tracing::info;
use tracing_subscriber::filter::EnvFilter;

#[derive(Parser)]
#[command(name = "squall", version, about = "Embedded JavaScript VM")]
struct Cli {
    /// Base directory for `require`
    #[arg(long, global = true, default_value = ".")]
    modules_path: PathBuf,

    /// Strip TypeScript syntax from sources that fail to parse
    #[arg(long, global = true)]
    typescript: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run every *.js file of a directory, in name order
    Run {
        dir: PathBuf,
        /// Keep the VM running after the scripts finish, until Ctrl-C
        #[arg(long)]
        wait: bool,
    },
    /// Evaluate an expression and print its settled value as JSON
    Eval { expr: String },
}

#[tokio::main]
async fn main() -> Result<()> {
    set_console_handler(|level, message| match level {
        ConsoleLevel::Warn | ConsoleLevel::Error => eprintln!("{}", message),
        _ => println!("{}", message),
    });

    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env().add_directive("warn".parse()?))
        .init();

    let cli = Cli::parse();

    let mut builder = Vm::builder().config(VmConfig::default().modules_path(&cli.modules_path));
    if cli.typescript {
        builder = builder.typescript();
    }
    let vm = builder.build();
    vm.start().context("failed to start VM")?;

    let outcome = match cli.command {
        Commands::Run { dir, wait } => run_dir(&vm, dir, wait).await,
        Commands::Eval { expr } => eval(&vm, &expr).await,
    };

    let stopper = vm.clone();
    tokio::task::spawn_blocking(move || stopper.shutdown())
        .await?
        .context("failed to stop VM")?;

    outcome
}

async fn run_dir(vm: &Vm, dir: PathBuf, wait: bool) -> Result<()> {
    let manager = ScriptManager::new(&dir);
    manager
        .run_all(vm)
        .await
        .with_context(|| format!("running scripts in {}", dir.display()))?;

    if wait {
        info!("Scripts finished, waiting for Ctrl-C");
        tokio::signal::ctrl_c().await?;
    }
    Ok(())
}

async fn eval(vm: &Vm, expr: &str) -> Result<()> {
    let value = vm.run_string(expr).resolved().await?;
    println!("{}", serde_json::to_string_pretty(&value)?);
    Ok(())
}
