use log::LevelFilter;
use std::process;
use syslog::{BasicLogger, Facility, Formatter3164};
use tracing_subscriber::EnvFilter;

use super::args::{Args, LogFormat};
use crate::config::VERSION;

pub fn init_logging(args: &Args, syslog_prog_name: Option<String>) {
    init(args, syslog_prog_name);
    log::info!("Welcome to pg_turnstile! (Version {VERSION})");
}

fn init(args: &Args, syslog_name: Option<String>) {
    if let Some(syslog_name) = syslog_name {
        let formatter = Formatter3164 {
            facility: Facility::LOG_USER,
            hostname: None,
            process: syslog_name,
            pid: process::id(),
        };
        match syslog::unix(formatter) {
            Ok(syslog_logger) => {
                // max level in syslog mode is INFO (performance penalty for DEBUG).
                let _ = log::set_boxed_logger(Box::new(BasicLogger::new(syslog_logger)))
                    .map(|()| log::set_max_level(LevelFilter::Info));
            }
            Err(err) => {
                eprintln!("Could not connect to syslog: {err}");
                process::exit(exitcode::OSERR);
            }
        }
    } else {
        let filter = EnvFilter::from_default_env().add_directive(args.log_level.into());

        let trace_sub = tracing_subscriber::fmt()
            .with_env_filter(filter)
            .with_ansi(!args.no_color);

        match args.log_format {
            LogFormat::Structured => trace_sub.json().init(),
            LogFormat::Debug => trace_sub.pretty().init(),
            LogFormat::Text => trace_sub.init(),
        };
    }
}
