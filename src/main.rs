use std::collections::HashMap;
use std::path::PathBuf;
use std::time::Duration;

use clap::{Args, Parser, Subcommand};
use tokio::io::{AsyncBufReadExt, BufReader};
use tracing_subscriber::EnvFilter;

use doppio_recipes::config::{load_config, load_config_from, EngineConfig};
use doppio_recipes::error::AppError;
use doppio_recipes::recipe::{
  load_recipe, validate_recipe, Collaborators, InteractiveEvent, InteractiveStatus, PrepareRequest,
  RecipeLogEntry, RecipeLogStream, RecipeRunner, RecipeStore, LOCAL_TARGET,
};

#[derive(Debug, Parser)]
#[command(name = "doppio-recipe", about = "Validate and run trainsh-Doppio recipes")]
struct Cli {
  /// Engine config (JSON); defaults to the doppio data dir
  #[arg(long, global = true)]
  config: Option<PathBuf>,
  /// Log engine internals (repeat for more)
  #[arg(short, long, action = clap::ArgAction::Count, global = true)]
  verbose: u8,
  #[command(subcommand)]
  command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
  /// Check a recipe file and print errors and warnings
  Validate { path: PathBuf },
  /// List recipes in the recipe store
  List,
  /// Run a recipe interactively; prompts are answered from stdin
  Run(RunArgs),
  /// List recorded executions
  Executions,
  /// Print the log of an execution
  Logs {
    execution_id: String,
    #[arg(long, default_value_t = 200)]
    tail: usize,
  },
}

#[derive(Debug, Args)]
struct RunArgs {
  path: PathBuf,
  #[arg(long, default_value = LOCAL_TARGET)]
  host: String,
  /// Variable override, `name=value`
  #[arg(long = "var", value_parser = parse_var)]
  vars: Vec<(String, String)>,
  /// Skip every step ordered before this one
  #[arg(long)]
  from: Option<String>,
}

fn parse_var(raw: &str) -> Result<(String, String), String> {
  raw
    .split_once('=')
    .map(|(k, v)| (k.trim().to_string(), v.to_string()))
    .filter(|(k, _)| !k.is_empty())
    .ok_or_else(|| format!("expected name=value, got {raw:?}"))
}

fn init_tracing(verbose: u8) {
  let default = match verbose {
    0 => "warn",
    1 => "doppio_recipes=info",
    _ => "doppio_recipes=debug",
  };
  let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default));
  tracing_subscriber::fmt()
    .with_env_filter(filter)
    .with_writer(std::io::stderr)
    .init();
}

fn print_entry(entry: &RecipeLogEntry) {
  let step = entry.step_id.as_deref().unwrap_or("-");
  match entry.stream {
    RecipeLogStream::Stdout => println!("[{step}] {}", entry.message),
    RecipeLogStream::Stderr => eprintln!("[{step}] {}", entry.message),
    RecipeLogStream::Progress => println!("[{step}] .. {}", entry.message),
    RecipeLogStream::System => println!("[{step}] == {}", entry.message),
  }
}

async fn run(cli: Cli) -> Result<bool, AppError> {
  let config: EngineConfig = match &cli.config {
    Some(path) => load_config_from(path).await?,
    None => load_config().await?,
  };

  match cli.command {
    Command::Validate { path } => {
      let recipe = load_recipe(&path).await?;
      let result = validate_recipe(&recipe);
      for e in &result.errors {
        println!("error   [{}] {}", e.step_id.as_deref().unwrap_or("-"), e.message);
      }
      for w in &result.warnings {
        println!("warning [{}] {}", w.step_id.as_deref().unwrap_or("-"), w.message);
      }
      if result.valid {
        println!("{}: ok ({} steps)", recipe.name, recipe.steps.len());
      }
      Ok(result.valid)
    }

    Command::List => {
      let store = RecipeStore::new(config.recipes_dir());
      for summary in store.list().await? {
        println!("{:<32} {:>3} steps  {}", summary.name, summary.step_count, summary.path);
      }
      Ok(true)
    }

    Command::Executions => {
      let runner = RecipeRunner::new(config, Collaborators::local());
      for e in runner.list().await? {
        println!("{}  {:<18} {:<24} {}", e.id, e.status.as_str(), e.recipe_name, e.created_at);
      }
      Ok(true)
    }

    Command::Logs { execution_id, tail } => {
      let runner = RecipeRunner::new(config, Collaborators::local());
      for entry in runner.log_tail(&execution_id, tail).await? {
        print_entry(&entry);
      }
      Ok(true)
    }

    Command::Run(args) => run_interactive(config, args).await,
  }
}

async fn run_interactive(config: EngineConfig, args: RunArgs) -> Result<bool, AppError> {
  let runner = RecipeRunner::new(config, Collaborators::local());
  let request = PrepareRequest {
    recipe_path: args.path.to_string_lossy().to_string(),
    host_id: args.host,
    variables: args.vars.into_iter().collect::<HashMap<_, _>>(),
    start_step_id: args.from,
  };
  let exec = runner.prepare_from_path(&args.path, request).await?;
  let id = exec.id.clone();
  eprintln!("execution {id}");

  let mut logs = runner.subscribe_logs(&id).await?;
  let mut events = runner.subscribe_events(&id)?;
  runner.start(&id).await?;

  let printer = tokio::spawn(async move {
    while let Ok(appended) = logs.recv().await {
      for entry in &appended.entries {
        print_entry(entry);
      }
    }
  });

  let input_runner = runner.clone();
  let input_id = id.clone();
  let stdin_task = tokio::spawn(async move {
    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    while let Ok(Some(line)) = lines.next_line().await {
      if let Err(e) = input_runner.send_input(&input_id, &line).await {
        eprintln!("input not delivered: {}", e.message);
      }
    }
  });

  loop {
    match events.recv().await {
      Ok(InteractiveEvent::WaitingForConfirmation { prompt, is_password, .. }) => {
        let hint = if is_password { " (input is not echoed to the log)" } else { "" };
        eprintln!(">> {prompt}{hint}");
      }
      Ok(event) if event.is_terminal() => break,
      Ok(_) => {}
      Err(tokio::sync::broadcast::error::RecvError::Lagged(n)) => {
        tracing::debug!("skipped {n} events");
      }
      Err(_) => break,
    }
  }

  let exec = runner.wait(&id).await?;
  stdin_task.abort();
  // Let the printer catch up with the closing entries.
  let _ = tokio::time::timeout(Duration::from_millis(200), printer).await;

  match exec.status {
    InteractiveStatus::Completed => {
      eprintln!("completed");
      Ok(true)
    }
    status => {
      let step = exec.failed_step.as_deref().unwrap_or("-");
      let error = exec.error.as_deref().unwrap_or("");
      eprintln!("{} (step {step}) {error}", status.as_str());
      Ok(false)
    }
  }
}

#[tokio::main]
async fn main() {
  let cli = Cli::parse();
  init_tracing(cli.verbose);

  let code = match run(cli).await {
    Ok(true) => 0,
    Ok(false) => 1,
    Err(e) => {
      eprintln!("error ({}): {}", e.code, e.message);
      1
    }
  };
  // A pending stdin read would otherwise hold up runtime shutdown.
  std::process::exit(code);
}
