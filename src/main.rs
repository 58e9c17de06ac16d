use std::process::exit;

use clap::error::ErrorKind;
use clap::Parser;

use muster::config::Cli;
use muster::error::E_ARGS;
use muster::scheduler::Scheduler;
use muster::transport::{self, ProcessCluster};

#[tokio::main]
async fn main() {
    let cli = match Cli::try_parse() {
        Ok(cli) => cli,
        Err(e) => {
            let code = match e.kind() {
                ErrorKind::DisplayHelp | ErrorKind::DisplayVersion => 0,
                _ => E_ARGS,
            };
            let _ = e.print();
            exit(code);
        }
    };

    if cli.kill {
        match transport::kill_stray_workers() {
            Ok(n) => {
                eprintln!("[muster] killed {} stray worker processes", n);
                exit(0);
            }
            Err(e) => {
                eprintln!("[muster] could not scan for stray workers: {}", e);
                exit(1);
            }
        }
    }

    let settings = match cli.into_settings() {
        Ok(settings) => settings,
        Err(e) => {
            eprintln!("[muster] ERROR - {}", e);
            exit(e.exit_code());
        }
    };

    println!("muster v{}", env!("CARGO_PKG_VERSION"));
    let invocation: Vec<String> = std::env::args().collect();
    println!("System call: {}\n", invocation.join(" "));

    let mut cluster = match ProcessCluster::new(&settings.out_dir) {
        Ok(cluster) => cluster,
        Err(e) => {
            eprintln!("[muster] ERROR - {}", e);
            exit(e.exit_code());
        }
    };

    if let Err(e) = Scheduler::new(settings).run(&mut cluster).await {
        eprintln!("[muster] ERROR - {}", e);
        exit(e.exit_code());
    }
}
