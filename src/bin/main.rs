use std::path::PathBuf;
use std::process::ExitCode;

use tracing::error;
use tracing_subscriber::EnvFilter;

use taskmaster::cli::{Cli, Commands, parse_args};
use taskmaster::client;
use taskmaster::constants::{EXIT_BIND_ERROR, EXIT_CONFIG_ERROR, EXIT_OK};
use taskmaster::supervisor::{Supervisor, SupervisorError};

fn main() -> ExitCode {
    let args = parse_args();
    init_logging(&args);

    let code = match args.command {
        Commands::Daemon { config } => run_daemon(PathBuf::from(config)),
        Commands::Start { name } => run_client("start", Some(name)),
        Commands::Stop { name } => run_client("stop", Some(name)),
        Commands::Restart { name } => run_client("restart", Some(name)),
        Commands::Status { json } => run_status(json),
        Commands::Reload => run_client("reload", None),
        Commands::Attach { name } => run_attach(name),
        Commands::Quit => run_client("quit", None),
    };

    ExitCode::from(code as u8)
}

fn init_logging(args: &Cli) {
    let filter = match &args.log_level {
        Some(level) => EnvFilter::new(level.as_str()),
        None => EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
    };
    tracing_subscriber::fmt().with_env_filter(filter).init();
}

fn run_daemon(config_path: PathBuf) -> i32 {
    let supervisor = match Supervisor::bootstrap(config_path) {
        Ok(supervisor) => supervisor,
        Err(err) => {
            error!("failed to start taskmasterd: {err}");
            return match err {
                SupervisorError::Config(_) => EXIT_CONFIG_ERROR,
                SupervisorError::Bind(_) => EXIT_BIND_ERROR,
                _ => EXIT_CONFIG_ERROR,
            };
        }
    };

    match supervisor.run() {
        Ok(()) => EXIT_OK,
        Err(SupervisorError::Bind(_)) => EXIT_BIND_ERROR,
        Err(_) => EXIT_CONFIG_ERROR,
    }
}

fn run_client(cmd: &str, target: Option<String>) -> i32 {
    match client::send(cmd, target) {
        Ok(reply) => {
            println!("{}", reply.message);
            if reply.ok { EXIT_OK } else { 1 }
        }
        Err(err) => {
            eprintln!("error: {err}");
            1
        }
    }
}

fn run_status(json: bool) -> i32 {
    match client::send("status", None) {
        Ok(reply) if reply.ok => {
            let data = reply.data.unwrap_or(serde_json::Value::Array(Vec::new()));
            if json {
                println!("{}", serde_json::to_string_pretty(&data).unwrap_or_default());
            } else {
                print_status_table(&data);
            }
            EXIT_OK
        }
        Ok(reply) => {
            eprintln!("error: {}", reply.message);
            1
        }
        Err(err) => {
            eprintln!("error: {err}");
            1
        }
    }
}

fn print_status_table(data: &serde_json::Value) {
    let Some(entries) = data.as_array() else {
        println!("{data}");
        return;
    };
    if entries.is_empty() {
        println!("no programs registered");
        return;
    }
    println!("{:<20}{:<12}{:<8}{:<10}{}", "NAME", "STATUS", "PID", "ATTACHED", "CMD");
    for entry in entries {
        let name = entry.get("name").and_then(|v| v.as_str()).unwrap_or("-");
        let status = entry.get("status").and_then(|v| v.as_str()).unwrap_or("-");
        let pid = entry
            .get("pid")
            .and_then(|v| v.as_u64())
            .map(|pid| pid.to_string())
            .unwrap_or_else(|| "-".to_string());
        let attached = entry
            .get("attached")
            .and_then(|v| v.as_bool())
            .unwrap_or(false);
        let cmd = entry.get("cmd").and_then(|v| v.as_str()).unwrap_or("-");
        println!(
            "{:<20}{:<12}{:<8}{:<10}{}",
            name,
            status,
            pid,
            attached,
            cmd
        );
    }
}

fn run_attach(name: String) -> i32 {
    match client::run_attach(&name) {
        Ok(()) => EXIT_OK,
        Err(err) => {
            eprintln!("error: {err}");
            1
        }
    }
}
