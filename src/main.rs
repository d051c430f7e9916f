use std::io::Write;
use std::path::Path;

use clap::{App, AppSettings, Arg, ArgMatches, SubCommand};
use colored::Colorize;
use log::error;

use livepatch::errors::{Error, Result};
use livepatch::patch;

fn setup_logger(level: u64, output: Option<&str>) -> Result<()> {
    let filter = match level {
        0 => log::LevelFilter::Warn,
        1 => log::LevelFilter::Info,
        2 => log::LevelFilter::Debug,
        _ => log::LevelFilter::Trace,
    };

    let dispatch = fern::Dispatch::new()
        .format(|out, message, record| {
            let level = match record.level() {
                log::Level::Error => "ERROR".red(),
                log::Level::Warn => "WARN".yellow(),
                log::Level::Info => "INFO".green(),
                log::Level::Debug => "DEBUG".cyan(),
                log::Level::Trace => "TRACE".magenta(),
            };
            out.finish(format_args!(
                "[{} {:<5}] {}",
                chrono::Local::now().format("%H:%M:%S%.3f"),
                level,
                message
            ))
        })
        .level(filter);

    let dispatch = match output {
        None | Some("stderr") => dispatch.chain(std::io::stderr()),
        Some("stdout") => dispatch.chain(std::io::stdout()),
        Some(file) => {
            let f = std::fs::OpenOptions::new()
                .write(true)
                .truncate(true)
                .create(true)
                .open(file)?;
            dispatch.chain(f)
        }
    };

    dispatch
        .apply()
        .map_err(|e| Error::Patch(format!("can't install logger: {}", e)))
}

fn target_args<'a>(matches: &'a ArgMatches<'a>) -> Result<(libc::pid_t, &'a Path)> {
    let pid = matches
        .value_of("PID")
        .unwrap_or_default()
        .parse::<libc::pid_t>()
        .map_err(|_| {
            Error::Patch(format!(
                "PID must be a process id, got {:?}",
                matches.value_of("PID").unwrap_or_default()
            ))
        })?;
    let patchfile = Path::new(matches.value_of("PATCHFILE").unwrap_or_default());
    Ok((pid, patchfile))
}

fn run(matches: &ArgMatches) -> Result<()> {
    match matches.subcommand() {
        ("patch", Some(sub)) => {
            let (pid, patchfile) = target_args(sub)?;
            patch::patch_process(pid, patchfile)
        }
        ("check", Some(sub)) => {
            let (pid, patchfile) = target_args(sub)?;
            patch::check_process(pid, patchfile)
        }
        _ => Err(Error::Patch(String::from("no command given"))),
    }
}

fn main() {
    let matches = App::new("livepatch")
        .version("0.1.0")
        .about("apply binary patches to running processes")
        .setting(AppSettings::SubcommandRequiredElseHelp)
        .arg(
            Arg::with_name("debug")
                .short("d")
                .long("debug")
                .value_name("LEVEL")
                .help("log verbosity [0..3]")
                .takes_value(true),
        )
        .arg(
            Arg::with_name("log")
                .long("log")
                .value_name("OUTPUT")
                .help("log destination: stderr|stdout|FILE, default is stderr")
                .takes_value(true),
        )
        .subcommand(
            SubCommand::with_name("patch")
                .about("apply a patch to a running process")
                .arg(Arg::with_name("PID").required(true))
                .arg(Arg::with_name("PATCHFILE").required(true)),
        )
        .subcommand(
            SubCommand::with_name("check")
                .about("report whether a patch could be applied safely, without mutating the target")
                .arg(Arg::with_name("PID").required(true))
                .arg(Arg::with_name("PATCHFILE").required(true)),
        )
        .get_matches();

    let level = matches
        .value_of("debug")
        .and_then(|s| s.parse::<u64>().ok())
        .unwrap_or(1);
    if let Err(err) = setup_logger(level, matches.value_of("log")) {
        let _ = writeln!(std::io::stderr(), "livepatch: {}", err);
        std::process::exit(libc::EINVAL);
    }

    match run(&matches) {
        Ok(()) => std::process::exit(0),
        Err(err) => {
            error!("{}", err);
            std::process::exit(err.exit_code());
        }
    }
}
