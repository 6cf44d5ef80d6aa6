use std::process;

use palisade_lib::command::Response;
use palisade_lib::socket;

mod cli;

fn main() {
    let args = cli::parse();

    let cmd = match args.command.into_command() {
        Ok(cmd) => cmd,
        Err(message) => {
            eprintln!("{message}");
            process::exit(exitcode::USAGE);
        }
    };

    let client = socket::ControlClient::new(&args.socket_path);
    let resp = match client.send(&cmd) {
        Ok(resp) => resp,
        Err(palisade_lib::Error::NotInitialized) => {
            eprintln!("palisade is not running (no control socket at {})", args.socket_path.display());
            process::exit(exitcode::UNAVAILABLE);
        }
        Err(e) => {
            eprintln!("Error talking to palisade: {e}");
            process::exit(exitcode::UNAVAILABLE);
        }
    };

    if args.json {
        json_print(&resp)
    } else {
        pretty_print(&resp)
    };

    process::exit(determine_exitcode(&resp));
}

fn json_print(resp: &Response) {
    match serde_json::to_string_pretty(resp) {
        Ok(s) => println!("{s}"),
        Err(e) => eprintln!("Error serializing response to JSON: {e}"),
    }
}

fn pretty_print(resp: &Response) {
    match resp {
        Response::Ok { message } => println!("{message}"),
        Response::Pending {
            id,
            rollback_at_epoch,
            backup_version,
        } => {
            println!("Pending apply {id}");
            println!("Auto-rollback at epoch {rollback_at_epoch} unless confirmed");
            if let Some(version) = backup_version {
                println!("Configuration backup version: {version}");
            }
            println!("Confirm with: palisade-ctl confirm {id}");
        }
        Response::Status {
            safe_mode,
            pending,
            last_rollback_cause,
            generation,
        } => {
            println!("Safe mode: {}", if *safe_mode { "ACTIVE" } else { "off" });
            match generation {
                Some(generation) => println!("Ruleset generation: {generation}"),
                None => println!("Ruleset generation: not yet applied"),
            }
            match pending {
                Some(p) => {
                    println!("Pending apply: {} (from {})", p.id, p.client_ip);
                    println!("  rollback at epoch {}", p.rollback_at_epoch);
                    println!("  backup version {}", p.backup_version);
                }
                None => println!("Pending apply: none"),
            }
            if let Some(cause) = last_rollback_cause {
                println!("Last rollback: {cause}");
            }
        }
        Response::Error { message } => eprintln!("Error: {message}"),
    }
}

fn determine_exitcode(resp: &Response) -> exitcode::ExitCode {
    match resp {
        Response::Error { .. } => 1,
        _ => exitcode::OK,
    }
}
