use std::path::PathBuf;
use std::process;

use anyhow::Context;

use codegen_bridge::{Logger, Session, SessionConfig, exit_code};

mod logging;
mod manifest;

use manifest::ManifestGenerator;

#[derive(Debug, PartialEq, Eq)]
struct Options {
    port: u16,
    configuration: Option<String>,
    project: Option<PathBuf>,
    changes: Option<PathBuf>,
    simulation_mode: bool,
    /// Build options accepted for compatibility and otherwise ignored.
    ignored: Vec<String>,
}

fn main() {
    let args: Vec<String> = std::env::args().collect();

    let options = match parse_args(&args) {
        Ok(v) => v,
        Err(msg) => {
            if !msg.is_empty() {
                eprintln!("error: {msg}");
                eprintln!();
            }
            eprintln!("Usage: codegen-worker --port-number <port> [options]");
            eprintln!();
            eprintln!("Options:");
            eprintln!("  --port-number <port>        Loopback port the host listens on (required)");
            eprintln!("  -c, --configuration <name>  Configuration passed to the generator");
            eprintln!("  -p, --project <path>        Project path [default: current directory]");
            eprintln!("  --changes <file>            JSON manifest of changes to report");
            eprintln!("  --simulation-mode           Mark reported changes as simulated");
            eprintln!("  -tfm, -b, --no-build, --no-dispatch  Accepted and ignored");
            process::exit(exit_code::USAGE);
        }
    };

    let logger = logging::build_logger();
    logger.in_scope(|| tracing::trace!(command_line = %args.join(" "), "Command line"));

    match run(options, logger.clone()) {
        Ok(code) => process::exit(code),
        Err(e) => {
            logger.in_scope(|| tracing::error!(error = %format!("{e:#}"), "Worker failed to start"));
            eprintln!("error: {e:#}");
            process::exit(1);
        }
    }
}

fn parse_args(args: &[String]) -> Result<Options, String> {
    let mut port: Option<u16> = None;
    let mut configuration = None;
    let mut project = None;
    let mut changes = None;
    let mut simulation_mode = false;
    let mut ignored = Vec::new();

    let mut i = 1; // skip argv[0]
    while i < args.len() {
        match args[i].as_str() {
            "--port-number" => {
                i += 1;
                let value = args.get(i).ok_or("--port-number requires a value")?;
                port = Some(
                    value
                        .parse()
                        .map_err(|_| format!("invalid port number '{value}'"))?,
                );
            }
            "-c" | "--configuration" => {
                i += 1;
                configuration = Some(args.get(i).ok_or("--configuration requires a value")?.clone());
            }
            "-p" | "--project" => {
                i += 1;
                project = Some(PathBuf::from(args.get(i).ok_or("--project requires a value")?));
            }
            "--changes" => {
                i += 1;
                changes = Some(PathBuf::from(args.get(i).ok_or("--changes requires a value")?));
            }
            "--simulation-mode" => simulation_mode = true,
            flag @ ("-tfm" | "--target-framework" | "-b" | "--build-base-path") => {
                i += 1;
                let value = args
                    .get(i)
                    .ok_or_else(|| format!("{flag} requires a value"))?;
                ignored.push(format!("{flag} {value}"));
            }
            flag @ ("--no-build" | "--no-dispatch") => ignored.push(flag.to_string()),
            "--help" | "-h" => return Err(String::new()),
            arg => return Err(format!("unexpected argument: {arg}")),
        }
        i += 1;
    }

    let port = port.ok_or("missing required option: --port-number")?;
    Ok(Options {
        port,
        configuration,
        project,
        changes,
        simulation_mode,
        ignored,
    })
}

fn run(options: Options, logger: Logger) -> anyhow::Result<i32> {
    let project = match options.project.clone() {
        Some(path) => std::path::absolute(&path)
            .with_context(|| format!("invalid project path {}", path.display()))?,
        None => std::env::current_dir().context("failed to resolve current directory")?,
    };

    let runtime = tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
        .context("failed to build async runtime")?;

    Ok(runtime.block_on(logger.scope(serve(options, project, logger.clone()))))
}

async fn serve(options: Options, project: PathBuf, logger: Logger) -> i32 {
    tracing::info!("codegen-worker {}", codegen_bridge::VERSION);
    tracing::info!(
        port = options.port,
        project = %project.display(),
        simulation_mode = options.simulation_mode,
        "Starting code generation session"
    );
    if !options.ignored.is_empty() {
        tracing::debug!(options = ?options.ignored, "Ignoring build options");
    }

    let generator = ManifestGenerator::new(options.changes)
        .with_simulation_mode(options.simulation_mode)
        .with_expected_project(project);

    let mut config = SessionConfig::new(options.port);
    if let Some(configuration) = options.configuration {
        config = config.with_configuration(configuration);
    }

    let mut session = Session::new(config, logger);
    match session.run(&generator).await {
        Ok(report) => {
            tracing::info!(
                session = %report.session_id,
                changes = report.changes_sent,
                "Code generation completed"
            );
            exit_code::SUCCESS
        }
        Err(e) => {
            let code = e.exit_code();
            tracing::error!(session = %session.id(), exit_code = code, error = %e, "Code generation failed");
            code
        }
    }
}
