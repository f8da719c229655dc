use std::process;

use log::error;
use tokio::runtime::Builder;

use pg_turnstile::app::{args, logger, server};
use pg_turnstile::config;

fn main() {
    let args = args::parse();

    if let Err(err) = config::parse(&args.config_file) {
        eprintln!("Config error: {err}");
        process::exit(exitcode::CONFIG);
    }
    if args.test_config {
        println!("Config {} is OK", args.config_file);
        process::exit(exitcode::OK);
    }

    let general = config::get_config().general;
    logger::init_logging(&args, general.syslog_prog_name.clone());

    let runtime = match Builder::new_multi_thread()
        .worker_threads(general.worker_threads)
        .enable_all()
        .thread_name("worker-pg-turnstile")
        .build()
    {
        Ok(runtime) => runtime,
        Err(err) => {
            eprintln!("Could not build runtime: {err}");
            process::exit(exitcode::OSERR);
        }
    };

    if let Err(err) = runtime.block_on(server::run()) {
        error!("{err}");
        process::exit(exitcode::SOFTWARE);
    }

    process::exit(exitcode::OK);
}
