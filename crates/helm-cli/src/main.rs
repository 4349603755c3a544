mod api;
mod app;
mod config;

use api::{ApiState, api_router};
use app::Services;
use clap::{ArgAction, Parser, Subcommand};
use config::HelmConfig;
use helm_plan::{
    EngineEvent, EngineEventKind, EngineEventSink, PlanEvent, PlanRunResult, RunStatus,
    StepEvent, engine_event_channel,
};
use helm_relay::relay_router;
use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;

#[derive(Parser, Debug)]
#[command(name = "helm")]
#[command(about = "Plans operator requests onto remote agents and relays their desktops")]
struct Cli {
    /// TOML configuration file.
    #[arg(long, global = true, env = "HELM_CONFIG")]
    config: Option<PathBuf>,
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Serve the chat API and the relay endpoints.
    Serve(ServeArgs),
    /// Run a single request and print the result.
    Run(RunArgs),
    CheckConfig(CheckConfigArgs),
}

#[derive(clap::Args, Debug)]
struct ServeArgs {
    #[arg(long)]
    bind: Option<String>,
    #[arg(long, env = "HELM_LINK_URL")]
    link_url: Option<String>,
}

#[derive(clap::Args, Debug)]
struct RunArgs {
    request: String,
    #[arg(long, default_value = "cli")]
    session: String,
    #[arg(long, env = "HELM_LINK_URL")]
    link_url: Option<String>,
    /// How long to wait for the agent link before running.
    #[arg(long, default_value_t = 2_000)]
    link_wait_ms: u64,
    #[arg(long = "no-stream-events", action = ArgAction::SetTrue)]
    no_stream_events: bool,
    #[arg(long, action = ArgAction::SetTrue)]
    event_json: bool,
}

#[derive(clap::Args, Debug)]
struct CheckConfigArgs {
    #[arg(long, action = ArgAction::SetTrue)]
    json: bool,
}

#[tokio::main(flavor = "current_thread")]
async fn main() -> ExitCode {
    let _ = dotenvy::dotenv();
    let cli = Cli::parse();
    let result = match cli.command {
        Commands::Serve(args) => serve_command(cli.config, args).await,
        Commands::Run(args) => run_command(cli.config, args).await,
        Commands::CheckConfig(args) => check_config_command(cli.config, args),
    };

    match result {
        Ok(code) => code,
        Err(error) => {
            eprintln!("error: {error}");
            ExitCode::from(1)
        }
    }
}

fn init_tracing() {
    let _ = tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .try_init();
}

async fn serve_command(config_path: Option<PathBuf>, args: ServeArgs) -> Result<ExitCode, String> {
    let mut config = HelmConfig::load(config_path.as_deref())?;
    if let Some(bind) = args.bind {
        config.server.bind = bind;
    }
    if let Some(url) = args.link_url {
        config.link.url = url;
    }
    config.validate()?;
    init_tracing();

    let events = EngineEventSink::with_observer(Arc::new(|event: &EngineEvent| {
        debug!(
            session_id = %event.session_id,
            sequence_no = event.sequence_no,
            event = %event_label(&event.kind),
            "engine event"
        );
    }));
    let mut services = Services::from_config(&config, events)?;
    services.start();

    let state = ApiState {
        engine: services.engine.clone(),
        store: services.store.clone(),
        link: services.link.clone(),
        synchronizer: services.synchronizer.clone(),
    };
    let router = api_router(state).merge(relay_router(services.relays.clone()));

    let addr = config.bind_addr()?;
    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .map_err(|error| format!("failed binding {addr}: {error}"))?;
    info!(
        %addr,
        relays = ?services.relays.kinds().collect::<Vec<_>>(),
        "helm listening"
    );
    axum::serve(listener, router)
        .with_graceful_shutdown(async {
            if let Err(error) = tokio::signal::ctrl_c().await {
                warn!(error = %error, "failed to listen for ctrl-c");
                std::future::pending::<()>().await;
            }
        })
        .await
        .map_err(|error| error.to_string())?;

    services.shutdown();
    info!("helm stopped");
    Ok(ExitCode::SUCCESS)
}

async fn run_command(config_path: Option<PathBuf>, args: RunArgs) -> Result<ExitCode, String> {
    let mut config = HelmConfig::load(config_path.as_deref())?;
    if let Some(url) = args.link_url {
        config.link.url = url;
    }
    config.validate()?;
    init_tracing();

    let (events, event_task) = event_stream(!args.no_stream_events, args.event_json);
    let mut services = Services::from_config(&config, events)?;
    services.start();
    wait_for_link(&services, Duration::from_millis(args.link_wait_ms)).await;

    let result = services
        .engine
        .handle_request(&args.session, &args.request)
        .await
        .map_err(|error| error.to_string());
    drop(services);

    if let Some(task) = event_task {
        task.await.map_err(|error| error.to_string())?;
    }

    let result = result?;
    print_run_summary(&result);
    Ok(exit_code_for_status(result.status))
}

fn check_config_command(
    config_path: Option<PathBuf>,
    args: CheckConfigArgs,
) -> Result<ExitCode, String> {
    let config = HelmConfig::load(config_path.as_deref())?;
    if args.json {
        let json = serde_json::to_string_pretty(&config).map_err(|e| e.to_string())?;
        println!("{json}");
        return Ok(ExitCode::SUCCESS);
    }

    match config_path.as_deref() {
        Some(path) => println!("config: {}", path.display()),
        None => println!("config: <defaults>"),
    }
    println!("link.url: {}", config.link.url);
    println!("link.role: {}", config.link.role);
    println!("link.dispatch_url: {}", config.link.dispatch_url);
    println!(
        "link.completion_timeout_ms: {}",
        config
            .link
            .completion_timeout_ms
            .map(|ms| ms.to_string())
            .unwrap_or_else(|| "<none>".to_string())
    );
    println!("engine.stop_on_failure: {}", config.engine.stop_on_failure);
    println!("collaborator.model: {}", config.collaborator.model);
    println!(
        "collaborator.api_key: {}",
        if config.collaborator_config().api_key.is_some() {
            "set"
        } else {
            "unset"
        }
    );
    println!("server.bind: {}", config.server.bind);
    for relay in &config.relays {
        println!("relay.{}: {}:{}", relay.kind, relay.host, relay.port);
    }
    Ok(ExitCode::SUCCESS)
}

async fn wait_for_link(services: &Services, limit: Duration) {
    let deadline = tokio::time::Instant::now() + limit;
    while !services.link.is_connected() {
        if tokio::time::Instant::now() >= deadline {
            warn!("agent link not connected; browser steps will fail");
            return;
        }
        tokio::time::sleep(Duration::from_millis(50)).await;
    }
}

fn event_stream(
    stream_events: bool,
    event_json: bool,
) -> (EngineEventSink, Option<tokio::task::JoinHandle<()>>) {
    if !stream_events {
        return (EngineEventSink::default(), None);
    }

    let (tx, mut rx) = engine_event_channel();
    let task = tokio::spawn(async move {
        while let Some(event) = rx.recv().await {
            if event_json {
                match serde_json::to_string(&event) {
                    Ok(line) => println!("{line}"),
                    Err(_) => print_event_text(&event),
                }
            } else {
                print_event_text(&event);
            }
        }
    });
    (EngineEventSink::with_sender(tx), Some(task))
}

fn print_event_text(event: &EngineEvent) {
    println!(
        "[event seq={}] {} {}",
        event.sequence_no,
        event.timestamp,
        event_label(&event.kind)
    );
}

fn event_label(kind: &EngineEventKind) -> String {
    match kind {
        EngineEventKind::Plan(PlanEvent::Started { .. }) => "plan started".to_string(),
        EngineEventKind::Plan(PlanEvent::Parsed { step_count }) => {
            format!("plan parsed ({step_count} steps)")
        }
        EngineEventKind::Plan(PlanEvent::Completed {
            step_count,
            failure_count,
        }) => format!("plan completed ({failure_count}/{step_count} failed)"),
        EngineEventKind::Plan(PlanEvent::Failed { reason }) => format!("plan failed: {reason}"),
        EngineEventKind::Step(StepEvent::Started {
            index, total, tool, ..
        }) => format!("step {}/{total} started [{tool}]", index + 1),
        EngineEventKind::Step(StepEvent::Completed {
            index,
            total,
            success,
            ..
        }) => format!(
            "step {}/{total} {}",
            index + 1,
            if *success { "ok" } else { "failed" }
        ),
    }
}

fn print_run_summary(result: &PlanRunResult) {
    println!("session_id: {}", result.session_id);
    println!(
        "status: {}",
        match result.status {
            RunStatus::Completed => "completed",
            RunStatus::PlanningFailed => "planning_failed",
            RunStatus::Aborted => "aborted",
        }
    );
    let failed = result.steps.iter().filter(|step| !step.success).count();
    println!("steps: {} ({failed} failed)", result.steps.len());
    println!("response: {}", result.response);
}

fn exit_code_for_status(status: RunStatus) -> ExitCode {
    match status {
        RunStatus::Completed => ExitCode::SUCCESS,
        RunStatus::PlanningFailed | RunStatus::Aborted => ExitCode::from(2),
    }
}
