mod output;

use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{Context, Result, bail};
use console::style;
use tokio_util::sync::CancellationToken;
use tracing::{Level, info, warn};

use crate::core::autosave;
use crate::core::collections::CollectionPopulator;
use crate::core::config::Config;
use crate::core::dispatch::{DispatchOutcome, Dispatcher};
use crate::core::graph::{Graph, GraphStore};
use crate::core::handoff::{HandoffSink, ResolveBridge};
use crate::core::orchestrator::{
    BatchPlanner, ContinuousExecutor, EventBus, GenerationPlan, RunSummary,
};
use crate::core::provider::{HttpTransport, ModelProfile};
use crate::core::readiness::{LabelHeuristic, ReadinessAnalyzer};
use crate::core::terminal::{self, GuideSection, print_error};
use crate::logging;
use output::OutputMode;

fn print_help() {
    terminal::print_banner();

    GuideSection::new("Inspect")
        .command("analyze <doc>", "Show depth, status and blockers of every node")
        .command("handoff-status", "Check the connection to the editing bridge")
        .print();

    GuideSection::new("Generate")
        .command("run <doc>", "Generate every ready node until nothing more can run")
        .command("batch <doc> <plan.json>", "Run a four-phase generation plan")
        .command("retry <doc> <node-id>", "Clear a node's error and generate it once")
        .print();

    GuideSection::new("Edit")
        .command("populate <doc>", "Refresh collection items from their sources")
        .command("reset <doc>", "Drop generated media and collection items")
        .print();

    GuideSection::new("Options")
        .command("--config <path>", "Configuration file (default: mediaflow.toml)")
        .command("--test-mode", "Use the cheaper test model profile")
        .command("--json", "Print events as JSON lines")
        .command("--verbose, -v", "Debug logging")
        .command("--quiet, -q", "Warnings and errors only")
        .command("--log-file <path>", "Append logs to a file instead of stderr")
        .print();

    println!(
        "\n {} {} <command> [options]\n",
        style("Usage:").bold(),
        style("mediaflow").green()
    );
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub(crate) struct CliArgs {
    pub positionals: Vec<String>,
    pub config: Option<PathBuf>,
    pub log_file: Option<PathBuf>,
    pub verbose: bool,
    pub quiet: bool,
    pub test_mode: bool,
    pub json: bool,
}

pub(crate) fn parse_cli_flags(args: &[String], start: usize) -> CliArgs {
    let mut parsed = CliArgs::default();
    let mut i = start;
    while i < args.len() {
        match args[i].as_str() {
            "--config" | "-c" => {
                if i + 1 < args.len() {
                    parsed.config = Some(PathBuf::from(&args[i + 1]));
                    i += 2;
                } else {
                    i += 1;
                }
            }
            "--log-file" => {
                if i + 1 < args.len() {
                    parsed.log_file = Some(PathBuf::from(&args[i + 1]));
                    i += 2;
                } else {
                    i += 1;
                }
            }
            "--verbose" | "-v" => {
                parsed.verbose = true;
                i += 1;
            }
            "--quiet" | "-q" => {
                parsed.quiet = true;
                i += 1;
            }
            "--test-mode" => {
                parsed.test_mode = true;
                i += 1;
            }
            "--json" => {
                parsed.json = true;
                i += 1;
            }
            other => {
                parsed.positionals.push(other.to_string());
                i += 1;
            }
        }
    }
    parsed
}

impl CliArgs {
    fn positional(&self, index: usize, name: &str) -> Result<&str> {
        self.positionals
            .get(index)
            .map(String::as_str)
            .with_context(|| format!("missing <{}> argument", name))
    }

    fn doc(&self) -> Result<PathBuf> {
        self.positional(0, "doc").map(PathBuf::from)
    }

    fn output_mode(&self) -> OutputMode {
        if self.json {
            OutputMode::Json
        } else {
            OutputMode::Human
        }
    }

    /// `--verbose` and `--quiet` win over the configured level.
    fn log_level(&self, config: &Config) -> Level {
        if self.verbose {
            return Level::DEBUG;
        }
        if self.quiet {
            return Level::WARN;
        }
        config
            .log_level
            .as_deref()
            .and_then(logging::parse_level)
            .unwrap_or(Level::INFO)
    }
}

/// Everything a command needs to work on one graph document.
struct Session {
    config: Config,
    path: PathBuf,
    store: GraphStore,
    bus: EventBus,
    dispatcher: Dispatcher,
    handoff: Option<Arc<dyn HandoffSink>>,
}

impl Session {
    async fn open(config: Config, path: &Path, test_mode: bool) -> Result<Self> {
        let graph = Graph::load(path).await?;
        info!("Loaded {} node(s) from {}", graph.len(), path.display());
        let store = GraphStore::new(graph);
        let transport = HttpTransport::from_config(&config.provider)?;
        let profile = if test_mode {
            ModelProfile::Test
        } else {
            ModelProfile::Normal
        };
        let dispatcher = Dispatcher::new(store.clone(), Arc::new(transport))
            .with_models(config.models.clone())
            .with_profile(profile)
            .with_defaults(config.defaults.clone())
            .with_location_terms(LabelHeuristic::new(config.executor.location_terms.clone()))
            .with_timeout(config.provider.timeout());
        let handoff = ResolveBridge::from_config(&config.handoff)
            .map(|bridge| Arc::new(bridge) as Arc<dyn HandoffSink>);
        Ok(Self {
            config,
            path: path.to_path_buf(),
            store,
            bus: EventBus::new(),
            dispatcher,
            handoff,
        })
    }

    fn analyzer(&self) -> ReadinessAnalyzer {
        ReadinessAnalyzer::new(Arc::new(LabelHeuristic::new(
            self.config.executor.location_terms.clone(),
        )))
    }

    fn populator(&self) -> CollectionPopulator {
        CollectionPopulator::new(self.config.executor.disabled_view_types.clone())
    }

    fn executor(&self) -> ContinuousExecutor {
        let mut executor = ContinuousExecutor::new(self.dispatcher.clone(), self.bus.clone())
            .with_analyzer(self.analyzer())
            .with_populator(self.populator())
            .with_poll_interval(self.config.executor.poll_interval());
        if let Some(sink) = &self.handoff {
            executor = executor.with_handoff(sink.clone());
        }
        executor
    }

    fn planner(&self) -> BatchPlanner {
        let mut planner = BatchPlanner::new(self.dispatcher.clone(), self.bus.clone())
            .with_populator(self.populator())
            .with_video_concurrency(self.config.batch.video_concurrency);
        if let Some(sink) = &self.handoff {
            planner = planner.with_handoff(sink.clone());
        }
        planner
    }

    async fn save(&self) -> Result<()> {
        autosave::save_document(&self.path, &self.store.snapshot().await).await
    }

    /// Saves in the background while `work` runs, then flushes once more.
    async fn with_autosave<F, T>(&self, work: F) -> Result<T>
    where
        F: Future<Output = Result<T>>,
    {
        let stop = CancellationToken::new();
        let saver = autosave::spawn(
            self.store.clone(),
            self.path.clone(),
            self.config.autosave.debounce(),
            stop.clone(),
        );
        let result = work.await;
        stop.cancel();
        match saver.await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => warn!("Auto-save failed: {:#}", e),
            Err(e) => warn!("Auto-save task stopped: {}", e),
        }
        self.save().await?;
        result
    }
}

/// Calls `on_interrupt` on the first Ctrl-C. Abort the handle once the
/// guarded work is over.
fn on_ctrl_c<F>(on_interrupt: F) -> tokio::task::JoinHandle<()>
where
    F: FnOnce() + Send + 'static,
{
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            info!("Interrupted, letting running jobs finish");
            on_interrupt();
        }
    })
}

fn report(summary: &RunSummary) {
    info!(
        "Run {}: {} generated, {} failed, {} blocked",
        summary.run_id,
        summary.success,
        summary.failure,
        summary.blocked.len()
    );
}

pub async fn run_main() -> Result<()> {
    let args: Vec<String> = std::env::args().collect();
    let Some(cmd) = args.get(1).map(String::as_str) else {
        print_help();
        return Ok(());
    };
    if matches!(cmd, "help" | "--help" | "-h") {
        print_help();
        return Ok(());
    }

    let flags = parse_cli_flags(&args, 2);
    let config = Config::load(flags.config.as_deref()).await?;
    logging::init(flags.log_level(&config), flags.log_file.as_deref())?;

    match cmd {
        "analyze" => {
            let session = Session::open(config, &flags.doc()?, flags.test_mode).await?;
            session.populator().populate(&session.store).await;
            let views = session.analyzer().analyze(&session.store.snapshot().await);
            match flags.output_mode() {
                OutputMode::Json => println!("{}", serde_json::to_string_pretty(&views)?),
                OutputMode::Human => output::print_analysis(&views),
            }
        }
        "populate" => {
            let session = Session::open(config, &flags.doc()?, flags.test_mode).await?;
            let report = session.populator().populate(&session.store).await;
            session.save().await?;
            if report.is_empty() {
                terminal::print_info("Collections already up to date");
            } else {
                for (id, count) in &report.changed {
                    terminal::print_success(&format!("{}: {} item(s)", id, count));
                }
            }
        }
        "run" => {
            let session = Session::open(config, &flags.doc()?, flags.test_mode).await?;
            let executor = Arc::new(session.executor());
            let printer = output::spawn_printer(session.bus.subscribe(), flags.output_mode());
            let interrupt = on_ctrl_c({
                let executor = executor.clone();
                move || executor.cancel()
            });

            let summary = session
                .with_autosave(async {
                    executor.enter().await;
                    executor.start().await
                })
                .await;
            interrupt.abort();
            let summary = summary?;
            printer.await.ok();
            report(&summary);
        }
        "batch" => {
            let doc = flags.doc()?;
            let plan = GenerationPlan::load(Path::new(flags.positional(1, "plan.json")?)).await?;
            let session = Session::open(config, &doc, flags.test_mode).await?;
            let planner = session.planner();
            let printer = output::spawn_printer(session.bus.subscribe(), flags.output_mode());
            let token = planner.cancel_token();
            let interrupt = on_ctrl_c(move || token.cancel());

            let summary = session
                .with_autosave(async { Ok(planner.run(&plan).await) })
                .await;
            interrupt.abort();
            let summary = summary?;
            printer.await.ok();
            report(&summary);
        }
        "reset" => {
            let session = Session::open(config, &flags.doc()?, flags.test_mode).await?;
            let cleared = session.executor().reset().await?;
            session.save().await?;
            terminal::print_success(&format!("Reset {} node(s)", cleared));
        }
        "retry" => {
            let doc = flags.doc()?;
            let node_id = flags.positional(1, "node-id")?.to_string();
            let session = Session::open(config, &doc, flags.test_mode).await?;
            let outcome = session.executor().retry_node(&node_id).await?;
            session.save().await?;
            match outcome {
                DispatchOutcome::Generated(content) => {
                    terminal::print_success(&format!("{} generated: {}", node_id, content.url));
                }
                DispatchOutcome::Failed(err) => {
                    bail!("{} failed again: {}", node_id, err);
                }
                DispatchOutcome::Skipped(err) => {
                    terminal::print_warn(&format!("{} not ready: {}", node_id, err));
                }
            }
        }
        "handoff-status" => {
            let Some(bridge) = ResolveBridge::from_config(&config.handoff) else {
                terminal::print_warn("Hand-off is not configured (see [handoff] in mediaflow.toml)");
                return Ok(());
            };
            let status = bridge.status().await?;
            let section = GuideSection::new("Editing bridge")
                .command("connected", if status.connected { "yes" } else { "no" })
                .command("project", status.project.as_deref().unwrap_or("-"))
                .command("folder", status.media_pool_folder.as_deref().unwrap_or("-"));
            match &status.error {
                Some(error) => section.blank().text(error).print(),
                None => section.print(),
            }
            println!();
        }
        _ => {
            print_error(&format!("Unknown command: {}", cmd));
            print_help();
        }
    }
    Ok(())
}
