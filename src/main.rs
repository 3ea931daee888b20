use std::path::PathBuf;

use imgpop_backend_core::api::server::serve;
use imgpop_backend_core::bridge::OperationBridge;
use imgpop_backend_core::config::{default_app_root, load_dispatch_settings};
use serde_json::{json, Value};
use tracing::level_filters::LevelFilter;
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    init_tracing();

    let cli_args = std::env::args().skip(1).collect::<Vec<_>>();
    match cli_args.first().map(String::as_str) {
        Some("run-operation") => {
            run_operation_cli(cli_args.into_iter().skip(1).collect::<Vec<_>>()).await
        }
        Some("serve") => run_serve_cli(cli_args.into_iter().skip(1).collect::<Vec<_>>()).await,
        Some("-h" | "--help") => {
            print_usage();
            Ok(())
        }
        _ => run_serve_cli(cli_args).await,
    }
}

fn init_tracing() {
    let env_filter = EnvFilter::builder()
        .with_default_directive(LevelFilter::INFO.into())
        .from_env_lossy();

    let _ = tracing_subscriber::fmt()
        .with_env_filter(env_filter)
        .with_writer(std::io::stderr)
        .try_init();
}

#[derive(Debug, Clone, PartialEq, Eq)]
struct SettingsCliArgs {
    app_root: PathBuf,
    settings_path: Option<String>,
}

#[derive(Debug, Clone, PartialEq)]
struct RunOperationCliArgs {
    settings: SettingsCliArgs,
    operation: String,
    params: Value,
}

fn parse_serve_cli_args(args: &[String]) -> Result<SettingsCliArgs, Box<dyn std::error::Error>> {
    let mut app_root = default_app_root();
    let mut settings_path = None::<String>;
    let mut i = 0usize;
    while i < args.len() {
        let flag = args[i].as_str();
        let needs_value = |idx: usize| -> Result<String, Box<dyn std::error::Error>> {
            let Some(value) = args.get(idx + 1) else {
                return Err(std::io::Error::other(format!("Missing value for {flag}")).into());
            };
            Ok(value.clone())
        };

        match flag {
            "--app-root" => {
                app_root = PathBuf::from(needs_value(i)?);
                i += 2;
            }
            "--settings" => {
                settings_path = Some(needs_value(i)?);
                i += 2;
            }
            unknown => {
                return Err(std::io::Error::other(format!(
                    "Unknown argument: {unknown}\n\nUse --help for usage."
                ))
                .into());
            }
        }
    }
    Ok(SettingsCliArgs {
        app_root,
        settings_path,
    })
}

fn parse_run_operation_cli_args(
    args: &[String],
) -> Result<RunOperationCliArgs, Box<dyn std::error::Error>> {
    let mut app_root = default_app_root();
    let mut settings_path = None::<String>;
    let mut operation = None::<String>;
    let mut params = None::<String>;
    let mut i = 0usize;
    while i < args.len() {
        let flag = args[i].as_str();
        let needs_value = |idx: usize| -> Result<String, Box<dyn std::error::Error>> {
            let Some(value) = args.get(idx + 1) else {
                return Err(std::io::Error::other(format!("Missing value for {flag}")).into());
            };
            Ok(value.clone())
        };

        match flag {
            "--app-root" => {
                app_root = PathBuf::from(needs_value(i)?);
                i += 2;
            }
            "--settings" => {
                settings_path = Some(needs_value(i)?);
                i += 2;
            }
            "--operation" => {
                operation = Some(needs_value(i)?);
                i += 2;
            }
            "--params" => {
                params = Some(needs_value(i)?);
                i += 2;
            }
            unknown => {
                return Err(std::io::Error::other(format!(
                    "Unknown argument: {unknown}\n\nUse --help for usage."
                ))
                .into());
            }
        }
    }

    let operation = operation
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty())
        .ok_or_else(|| std::io::Error::other("Missing required --operation"))?;
    let params = match params {
        Some(raw) => serde_json::from_str::<Value>(raw.as_str())
            .map_err(|e| std::io::Error::other(format!("--params is not valid JSON: {e}")))?,
        None => json!({}),
    };
    Ok(RunOperationCliArgs {
        settings: SettingsCliArgs {
            app_root,
            settings_path,
        },
        operation,
        params,
    })
}

async fn run_serve_cli(args: Vec<String>) -> Result<(), Box<dyn std::error::Error>> {
    if args
        .iter()
        .any(|arg| matches!(arg.as_str(), "-h" | "--help"))
    {
        print_usage();
        return Ok(());
    }
    let parsed = parse_serve_cli_args(args.as_slice())?;
    let settings =
        load_dispatch_settings(parsed.app_root.as_path(), parsed.settings_path.as_deref())?;
    serve(settings).await
}

async fn run_operation_cli(args: Vec<String>) -> Result<(), Box<dyn std::error::Error>> {
    if args
        .iter()
        .any(|arg| matches!(arg.as_str(), "-h" | "--help"))
    {
        print_run_operation_usage();
        return Ok(());
    }
    let parsed = parse_run_operation_cli_args(args.as_slice())?;
    let settings = load_dispatch_settings(
        parsed.settings.app_root.as_path(),
        parsed.settings.settings_path.as_deref(),
    )?;
    let bridge = OperationBridge::from_settings(&settings)?;

    let result = bridge
        .invoke(parsed.operation.as_str(), parsed.params)
        .await?;
    println!("{}", serde_json::to_string_pretty(&result)?);
    Ok(())
}

fn print_usage() {
    eprintln!(
        concat!(
            "Usage:\n",
            "  imgpop-backend-core [serve] [--app-root PATH] [--settings PATH]\n",
            "  imgpop-backend-core run-operation --operation <name> [--params <json>] ",
            "[--app-root PATH] [--settings PATH]\n\n",
            "Defaults:\n",
            "  --app-root defaults to IMGPOP_APP_ROOT, then the current directory\n",
            "  settings default: <app-root>/config/dispatch.settings.toml (optional)\n",
            "  env overrides: IMGPOP_REMOTE_BASE_URL, IMGPOP_REMOTE_TIMEOUT_SECS, ",
            "IMGPOP_PYTHON_BIN, IMGPOP_TOOLS_DIR, IMGPOP_BACKEND_BIND\n"
        )
    );
}

fn print_run_operation_usage() {
    eprintln!(
        concat!(
            "Usage:\n",
            "  imgpop-backend-core run-operation --operation <name> [--params <json>]\n\n",
            "Operations: resizeImage, generativeFill, removeBg, cleanup, upscale, extractText\n",
            "Example:\n",
            "  imgpop-backend-core run-operation --operation resizeImage ",
            "--params '{{\"imagePath\":\"in.png\",\"width\":640,\"height\":480}}'\n"
        )
    );
}
