#[macro_use]
extern crate error_chain;
extern crate clap;
extern crate stderrlog;
extern crate limits;

use std::fs::File;
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use error_chain::ChainedError;

use limits::{FilterSet, LimitVector, ScriptEmitter, SearchEngine, Spawner};


error_chain! {
    types {
        Error, ErrorKind, ResultExt, Result;
    }

    links {
        Limits(::limits::Error, ::limits::ErrorKind);
    }

    foreign_links {
        Io(::std::io::Error);
    }
}


struct ApplicationConfig {
    pub command: Vec<String>,
    pub timeout: Duration,
    pub filter_file: Option<PathBuf>,
    pub script_file: Option<PathBuf>,
    pub stdin_file: PathBuf,
    pub verbosity: usize,
}

fn get_app_config() -> Result<ApplicationConfig> {
    let matches = clap::App::new("limits")
        .version("0.1.0")
        .about("Search for resource limit values that change a command's observable behavior")
        .setting(clap::AppSettings::TrailingVarArg)
        .arg(clap::Arg::with_name("timeout")
            .short("t")
            .long("timeout")
            .takes_value(true)
            .value_name("TIMEOUT")
            .default_value("1")
            .help("wall clock budget for a single spawn, in seconds"))
        .arg(clap::Arg::with_name("filter_file")
            .short("b")
            .long("filters")
            .takes_value(true)
            .value_name("FILTER_FILE")
            .help("file of regex patterns erased from child output before comparison"))
        .arg(clap::Arg::with_name("script_file")
            .short("o")
            .long("output")
            .takes_value(true)
            .value_name("SCRIPT_FILE")
            .help("shell script receiving one replay line per discovered behavior"))
        .arg(clap::Arg::with_name("stdin_file")
            .short("i")
            .long("stdin")
            .takes_value(true)
            .value_name("STDIN_FILE")
            .default_value("/dev/null")
            .help("file connected to the child's standard input"))
        .arg(clap::Arg::with_name("verbosity")
            .short("v")
            .multiple(true)
            .help("increase the logging verbosity"))
        .arg(clap::Arg::with_name("command")
            .value_name("COMMAND")
            .takes_value(true)
            .multiple(true)
            .required(true)
            .help("the command to search, along with its arguments"))
        .get_matches();

    let timeout = matches.value_of("timeout").unwrap();
    let timeout = u64::from_str(timeout)
        .chain_err(|| Error::from(format!("invalid timeout value: {}", timeout)))
        ?;

    Ok(ApplicationConfig {
        command: matches.values_of("command").unwrap()
            .map(|arg| arg.to_owned())
            .collect(),
        timeout: Duration::from_secs(timeout),
        filter_file: matches.value_of("filter_file").map(PathBuf::from),
        script_file: matches.value_of("script_file").map(PathBuf::from),
        stdin_file: PathBuf::from(matches.value_of("stdin_file").unwrap()),
        verbosity: matches.occurrences_of("verbosity") as usize,
    })
}

/// Build the environment every child runs under: the operator's own environment, plus
/// `MALLOC_CHECK_=2` so that glibc reports heap corruption on the spot.
fn build_child_environment() -> Vec<String> {
    let mut envs = std::env::vars()
        .filter(|(name, _)| name != "MALLOC_CHECK_")
        .map(|(name, value)| format!("{}={}", name, value))
        .collect::<Vec<String>>();
    envs.push("MALLOC_CHECK_=2".to_owned());
    envs
}

fn do_main() -> Result<()> {
    let config = get_app_config()?;

    stderrlog::new()
        .module(module_path!())
        .module("limits")
        .verbosity(config.verbosity + 2)
        .init()
        .unwrap();

    let filters = match &config.filter_file {
        Some(path) => FilterSet::load(path)?,
        None => FilterSet::empty()
    };

    let stdin = File::open(&config.stdin_file)
        .chain_err(|| Error::from(format!("cannot open stdin file: {}",
            config.stdin_file.display())))
        ?;

    let spawner = Spawner::new(&config.command, build_child_environment(), stdin,
        config.timeout)?;

    let influential = limits::probe::probe_environment(
        &spawner, &LimitVector::from_current(), &filters)?;
    println!("{} environment variables influence the output", influential.len());
    for name in &influential {
        println!("\t{}", name);
    }

    let emitter = match &config.script_file {
        Some(path) => Some(ScriptEmitter::create(path, &config.command,
            &config.stdin_file)?),
        None => None
    };

    let mut engine = SearchEngine::new(&spawner, &filters, emitter);
    engine.run()?;

    if config.script_file.is_none() && engine.new_keys() > 0 {
        println!("{} new behaviors found; rerun with -o FILE to record replay commands",
            engine.new_keys());
    }

    Ok(())
}

fn main() -> Result<()> {
    match do_main() {
        Ok(()) => Ok(()),
        Err(e) => {
            eprintln!("error: {}", e.display_chain().to_string());
            Err(e)
        }
    }
}
