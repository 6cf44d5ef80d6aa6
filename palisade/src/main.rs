use std::process;

use palisade_lib::logging;

mod api_child;
mod cli;
mod lock;
mod sandbox;
mod supervisor;

// Avoid musl's default allocator due to degraded performance
#[cfg(target_os = "linux")]
#[global_allocator]
static GLOBAL: mimalloc::MiMalloc = mimalloc::MiMalloc;

#[tokio::main]
async fn main() {
    let mut args = cli::parse();
    let role = args.role.take();

    let reload_handle = match setup_logging(&args) {
        Ok(handle) => handle,
        Err(code) => process::exit(code),
    };

    tracing::info!(
        version = env!("CARGO_PKG_VERSION"),
        "starting {}",
        env!("CARGO_PKG_NAME")
    );

    let result = match role {
        Some(cli::Role::ApiChild { listen, jail, user }) => api_child::run(&listen, &jail, &user).await,
        Some(cli::Role::TakeOver { handoff_socket }) => {
            match supervisor::take_over(&args, &handoff_socket).await {
                Ok(inherited) => supervisor::run(args, reload_handle, inherited).await,
                Err(code) => Err(code),
            }
        }
        None => supervisor::run(args, reload_handle, None).await,
    };

    match result {
        Ok(()) => {}
        Err(code) if code == exitcode::OK => {}
        Err(code) => {
            tracing::warn!(code, "abnormal exit");
            process::exit(code);
        }
    }
}

fn setup_logging(args: &cli::Cli) -> Result<Option<logging::LogReloadHandle>, exitcode::ExitCode> {
    match &args.log_file {
        Some(log_path) => {
            let layer = logging::make_file_fmt_layer(log_path).map_err(|err| {
                eprintln!("Failed to open log file {}: {}", log_path.display(), err);
                exitcode::IOERR
            })?;
            Ok(Some(logging::setup_log_file(layer)))
        }
        None => {
            logging::setup_stdout();
            Ok(None)
        }
    }
}
