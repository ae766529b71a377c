use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result, anyhow, bail};
use clap::{Arg, ArgAction, ArgMatches, Command};
use rowpilot_engine::{
    InjectedFailure, InlineRowResolver, LoopbackSurface, Orchestrator, OrchestratorConfig, ResumeMode, RunNotice, WorkflowExpander,
    build_handler_repository, compute_unified_pattern, handler_regex, load_workflow_library, normalize_text,
    validate_pattern_against_texts,
};
use rowpilot_types::{DataRow, MatchMode, ParamBinding, ParamBindings, RunOptions, SurfaceEvent, Workflow};
use rowpilot_util::{JsonStateStore, RunnerConfig, StateStore, default_config_path};
use tokio::sync::mpsc::{UnboundedReceiver, unbounded_channel};
use tracing::{info, warn};

#[tokio::main]
async fn main() -> Result<()> {
    init_tracing();
    let matches = build_cli().get_matches();

    match matches.subcommand() {
        Some(("expand", sub)) => expand_cmd(sub),
        Some(("normalize", sub)) => normalize_cmd(sub),
        Some(("unify", sub)) => unify_cmd(sub),
        Some(("handlers", sub)) => handlers_cmd(sub),
        Some(("run", sub)) => run_cmd(sub).await,
        Some(("resume", sub)) => resume_cmd(sub).await,
        Some(("config", sub)) => config_cmd(sub),
        Some((other, _)) => bail!("unknown command: {other}"),
        None => bail!("a subcommand is required"),
    }
}

fn init_tracing() {
    let filter = std::env::var("RUST_LOG").unwrap_or_else(|_| "info".into());
    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .try_init();
}

fn build_cli() -> Command {
    let library = || {
        Arg::new("library")
            .long("library")
            .short('l')
            .action(ArgAction::Set)
            .required(true)
            .help("Workflow library file (YAML or JSON)")
    };
    let config_file = || {
        Arg::new("config")
            .long("config")
            .action(ArgAction::Set)
            .help("Runner configuration file")
    };
    let execution = |command: Command| {
        command
            .arg(
                Arg::new("rows")
                    .long("rows")
                    .action(ArgAction::Set)
                    .help("JSON file holding an array of data rows"),
            )
            .arg(
                Arg::new("fail-at")
                    .long("fail-at")
                    .action(ArgAction::Set)
                    .help("Inject a failure at ROW:STEP"),
            )
            .arg(
                Arg::new("step-delay-ms")
                    .long("step-delay-ms")
                    .action(ArgAction::Set)
                    .value_parser(clap::value_parser!(u64))
                    .default_value("0"),
            )
            .arg(
                Arg::new("sample")
                    .long("sample")
                    .action(ArgAction::Set)
                    .value_parser(clap::value_parser!(usize))
                    .help("Run a random sample of at most N rows"),
            )
            .arg(
                Arg::new("seed")
                    .long("seed")
                    .action(ArgAction::Set)
                    .value_parser(clap::value_parser!(u64))
                    .requires("sample")
                    .help("Seed for reproducible row sampling"),
            )
            .arg(config_file())
    };

    Command::new("rowpilot")
        .about("Expand, generalize, and run recorded browser workflows")
        .subcommand_required(true)
        .arg_required_else_help(true)
        .subcommand(
            Command::new("expand")
                .about("Print a workflow with its subworkflows inlined")
                .arg(library())
                .arg(Arg::new("workflow").required(true).help("Workflow id"))
                .arg(
                    Arg::new("param")
                        .long("param")
                        .short('p')
                        .action(ArgAction::Append)
                        .help("Bind a root parameter as NAME=VALUE"),
                ),
        )
        .subcommand(
            Command::new("normalize")
                .about("Print the canonical form of an interruption text")
                .arg(Arg::new("text").required(true)),
        )
        .subcommand(
            Command::new("unify")
                .about("Generalize interruption texts into one pattern")
                .arg(Arg::new("texts").required(true).num_args(1..))
                .arg(
                    Arg::new("check")
                        .long("check")
                        .action(ArgAction::Append)
                        .help("Additional text to validate against the pattern"),
                )
                .arg(
                    Arg::new("mode")
                        .long("mode")
                        .action(ArgAction::Set)
                        .value_parser(["contains", "regex"])
                        .help("Match mode used for validation (regex when the pattern has placeholders)"),
                ),
        )
        .subcommand(
            Command::new("handlers")
                .about("Print the deduplicated interruption handler repository")
                .arg(library()),
        )
        .subcommand(execution(
            Command::new("run")
                .about("Run workflows on the in-process surface; several ids start a configuration run")
                .arg(library())
                .arg(Arg::new("workflows").required(true).num_args(1..))
                .arg(
                    Arg::new("skip")
                        .long("skip")
                        .action(ArgAction::Set)
                        .value_parser(clap::value_parser!(usize))
                        .default_value("0")
                        .help("Rows to skip; without --skip or --limit a workflow restarts at its last failed row"),
                )
                .arg(
                    Arg::new("limit")
                        .long("limit")
                        .action(ArgAction::Set)
                        .value_parser(clap::value_parser!(usize)),
                ),
        ))
        .subcommand(execution(
            Command::new("resume")
                .about("Resume the last failed run")
                .arg(library())
                .arg(
                    Arg::new("mode")
                        .long("mode")
                        .action(ArgAction::Set)
                        .value_parser(["next", "retry"])
                        .default_value("next"),
                ),
        ))
        .subcommand(
            Command::new("config")
                .about("Print the effective runner configuration")
                .arg(config_file())
                .arg(
                    Arg::new("init")
                        .long("init")
                        .action(ArgAction::SetTrue)
                        .help("Write the configuration file with defaults when it does not exist"),
                ),
        )
}

fn load_library(matches: &ArgMatches) -> Result<Vec<Workflow>> {
    let path = matches
        .get_one::<String>("library")
        .context("--library is required")?;
    load_workflow_library(path)
}

fn find_workflow<'a>(library: &'a [Workflow], id: &str) -> Result<&'a Workflow> {
    library
        .iter()
        .find(|workflow| workflow.id == id)
        .ok_or_else(|| anyhow!("workflow '{}' not found in library", id))
}

fn expand_cmd(matches: &ArgMatches) -> Result<()> {
    let library = load_library(matches)?;
    let id = matches.get_one::<String>("workflow").context("workflow id is required")?;
    let config = RunnerConfig::load()?;

    let bindings = matches
        .get_many::<String>("param")
        .into_iter()
        .flatten()
        .map(|param| parse_param(param.as_str()))
        .collect::<Result<ParamBindings>>()?;

    let output = WorkflowExpander::new(&library)
        .with_max_depth(config.max_expansion_depth)
        .expand_with_bindings(find_workflow(&library, id)?, &bindings)?;
    for warning in &output.warnings {
        warn!("{warning}");
    }
    println!("{}", serde_json::to_string_pretty(&output.workflow)?);
    Ok(())
}

fn parse_param(param: &str) -> Result<(String, ParamBinding)> {
    let (name, value) = param
        .split_once('=')
        .ok_or_else(|| anyhow!("expected NAME=VALUE, got '{}'", param))?;
    if name.trim().is_empty() {
        bail!("parameter name is empty in '{param}'");
    }
    Ok((name.to_string(), ParamBinding::static_value(value)))
}

fn normalize_cmd(matches: &ArgMatches) -> Result<()> {
    let text = matches.get_one::<String>("text").context("text is required")?;
    println!("{}", normalize_text(text));
    Ok(())
}

fn unify_cmd(matches: &ArgMatches) -> Result<()> {
    let texts: Vec<&String> = matches.get_many::<String>("texts").context("texts are required")?.collect();
    let pattern = compute_unified_pattern(&texts);
    let regex = handler_regex(&pattern);

    let mut checked: Vec<&String> = texts.clone();
    if let Some(extra) = matches.get_many::<String>("check") {
        checked.extend(extra);
    }
    let mode = match matches.get_one::<String>("mode").map(String::as_str) {
        Some("contains") => MatchMode::Contains,
        Some(_) => MatchMode::Regex,
        None if regex.is_some() => MatchMode::Regex,
        None => MatchMode::Contains,
    };
    let validation = validate_pattern_against_texts(&pattern, &checked, mode);

    let out = serde_json::json!({
        "pattern": pattern,
        "regex": regex,
        "validation": validation,
    });
    println!("{}", serde_json::to_string_pretty(&out)?);
    Ok(())
}

fn handlers_cmd(matches: &ArgMatches) -> Result<()> {
    let library = load_library(matches)?;
    let repository = build_handler_repository(&library);
    println!("{}", serde_json::to_string_pretty(&repository)?);
    Ok(())
}

struct Session {
    orchestrator: Orchestrator,
    events: UnboundedReceiver<SurfaceEvent>,
    notices: UnboundedReceiver<RunNotice>,
}

fn config_path(matches: &ArgMatches) -> PathBuf {
    matches
        .get_one::<String>("config")
        .map(PathBuf::from)
        .unwrap_or_else(default_config_path)
}

fn config_cmd(matches: &ArgMatches) -> Result<()> {
    let path = config_path(matches);
    let config = RunnerConfig::load_from(&path)?;
    if matches.get_flag("init") && !path.exists() {
        config
            .save_to(&path)
            .with_context(|| format!("failed to write config: {}", path.display()))?;
        info!(path = %path.display(), "wrote default runner configuration");
    }
    let out = serde_json::json!({
        "path": path.display().to_string(),
        "config": config,
    });
    println!("{}", serde_json::to_string_pretty(&out)?);
    Ok(())
}

fn open_session(matches: &ArgMatches) -> Result<Session> {
    let config = RunnerConfig::load_from(&config_path(matches))?;
    let store: Arc<dyn StateStore> = Arc::new(JsonStateStore::new(config.state_path())?);

    let mut rows = match matches.get_one::<String>("rows") {
        Some(path) => InlineRowResolver::new(read_rows(Path::new(path))?),
        None => InlineRowResolver::single_pass(),
    };
    if let Some(cap) = matches.get_one::<usize>("sample").copied() {
        rows = rows.with_sample_cap(cap);
    }
    if let Some(seed) = matches.get_one::<u64>("seed").copied() {
        rows = rows.with_seed(seed);
    }

    let (mut surface, events) = LoopbackSurface::new();
    if let Some(spec) = matches.get_one::<String>("fail-at") {
        surface = surface.with_failure(parse_failure(spec)?);
    }
    if let Some(delay) = matches.get_one::<u64>("step-delay-ms").copied().filter(|delay| *delay > 0) {
        surface = surface.with_step_delay(Duration::from_millis(delay));
    }

    let (notice_tx, notices) = unbounded_channel();
    let mut orchestrator = Orchestrator::new(OrchestratorConfig::from(&config), Arc::new(surface), Arc::new(rows), store)
        .with_notices(notice_tx);
    orchestrator.restore()?;
    orchestrator.set_workflows(load_library(matches)?)?;

    Ok(Session {
        orchestrator,
        events,
        notices,
    })
}

fn read_rows(path: &Path) -> Result<Vec<DataRow>> {
    let content = std::fs::read_to_string(path).with_context(|| format!("failed to read rows file: {}", path.display()))?;
    serde_json::from_str(&content).with_context(|| format!("rows file must hold an array of objects: {}", path.display()))
}

fn parse_failure(spec: &str) -> Result<InjectedFailure> {
    let (row, step) = spec
        .split_once(':')
        .ok_or_else(|| anyhow!("expected ROW:STEP, got '{}'", spec))?;
    Ok(InjectedFailure {
        row: row.trim().parse().with_context(|| format!("invalid row in '{spec}'"))?,
        step: step.trim().parse().with_context(|| format!("invalid step in '{spec}'"))?,
    })
}

async fn run_cmd(matches: &ArgMatches) -> Result<()> {
    let mut session = open_session(matches)?;
    let ids: Vec<&String> = matches.get_many::<String>("workflows").context("workflow ids are required")?.collect();
    let selected = ids
        .iter()
        .map(|id| find_workflow(session.orchestrator.workflows(), id).cloned())
        .collect::<Result<Vec<_>>>()?;
    let options = RunOptions {
        skip_rows: matches.get_one::<usize>("skip").copied().unwrap_or_default(),
        limit_rows: matches.get_one::<usize>("limit").copied(),
        ..RunOptions::default()
    };

    let run_id = match selected.as_slice() {
        [single] => session.orchestrator.start(single.clone(), options).await?,
        _ => session.orchestrator.start_configuration_run(&selected, options).await?,
    };
    info!(run_id = %run_id, "run dispatched");
    finish_session(session).await
}

async fn resume_cmd(matches: &ArgMatches) -> Result<()> {
    let mut session = open_session(matches)?;
    let mode = match matches.get_one::<String>("mode").map(String::as_str) {
        Some("retry") => ResumeMode::Retry,
        _ => ResumeMode::Next,
    };
    let run_id = session.orchestrator.resume_from_failure(mode).await?;
    info!(run_id = %run_id, mode = ?mode, "run resumed");
    finish_session(session).await
}

async fn finish_session(mut session: Session) -> Result<()> {
    session.orchestrator.run_until_idle(&mut session.events).await;
    while let Ok(notice) = session.notices.try_recv() {
        println!("{}", describe(&notice));
    }
    Ok(())
}

fn describe(notice: &RunNotice) -> String {
    match notice {
        RunNotice::Started { workflow_id, run_id } => format!("started {workflow_id} ({run_id})"),
        RunNotice::Paused { workflow_id } => format!("paused {workflow_id}"),
        RunNotice::Resumed { workflow_id } => format!("resumed {workflow_id}"),
        RunNotice::Completed { workflow_id } => format!("completed {workflow_id}"),
        RunNotice::Stopped { workflow_id } => format!("stopped {}", workflow_id.as_deref().unwrap_or("-")),
        RunNotice::ResumeAvailable(failure) => format!(
            "failed {} at row {}: {} (resume with `rowpilot resume`)",
            failure.workflow_id, failure.row_index, failure.message
        ),
        RunNotice::NoMoreRows { workflow_id } => format!("no rows left to resume for {workflow_id}"),
        RunNotice::ConfigurationAdvanced {
            configuration_run_id,
            completed,
            total,
        } => format!("{configuration_run_id}: {completed}/{total} workflows done"),
        RunNotice::ConfigurationFinished { configuration_run_id } => format!("{configuration_run_id}: finished"),
    }
}
