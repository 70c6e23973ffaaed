use anyhow::{Context, Result};
use clap::{App, AppSettings, Arg, SubCommand};

use std::fs;
use std::path::{Path, PathBuf};
use std::process;

use noptrace::disasm::Strategy;
use noptrace::meta;
use noptrace::obfuscate::{self, Filler};
use noptrace::runtime::Supervisor;

fn app<'a, 'b>() -> App<'a, 'b> {
    App::new(env!("CARGO_PKG_NAME"))
        .version(env!("CARGO_PKG_VERSION"))
        .about(env!("CARGO_PKG_DESCRIPTION"))
        .setting(AppSettings::SubcommandRequiredElseHelp)
        .subcommand(
            SubCommand::with_name("obfuscate")
                .about("Erase the control-transfer instructions of an ELF executable")
                .arg(
                    Arg::with_name("strategy")
                        .help("The disassembly strategy to use")
                        .short("s")
                        .long("strategy")
                        .takes_value(true)
                        .possible_values(&["linear", "recursive"])
                        .default_value("linear"),
                )
                .arg(
                    Arg::with_name("filler")
                        .help("The filler written over erased instructions")
                        .short("f")
                        .long("filler")
                        .takes_value(true)
                        .possible_values(&["nop", "random"])
                        .default_value("nop"),
                )
                .arg(
                    Arg::with_name("input")
                        .help("The ELF executable to obfuscate")
                        .required(true)
                        .index(1),
                ),
        )
        .subcommand(
            SubCommand::with_name("run")
                .about("Run a stripped binary under the branch-emulating supervisor")
                .arg(
                    Arg::with_name("metadata")
                        .help("The metadata table emitted next to the stripped binary")
                        .short("m")
                        .long("metadata")
                        .takes_value(true),
                )
                .arg(
                    Arg::with_name("binary")
                        .help("The stripped binary to supervise")
                        .required(true)
                        .index(1),
                )
                .arg(
                    Arg::with_name("args")
                        .help("The command-line arguments to execute the tracee with")
                        .raw(true),
                ),
        )
}

fn suffixed(path: &Path, suffix: &str) -> PathBuf {
    let mut name = path.as_os_str().to_os_string();
    name.push(suffix);
    PathBuf::from(name)
}

fn obfuscate_main(matches: &clap::ArgMatches) -> Result<i32> {
    let input = Path::new(matches.value_of("input").unwrap());
    let strategy = match matches.value_of("strategy").unwrap() {
        "linear" => Strategy::Linear,
        "recursive" => Strategy::Recursive,
        _ => unreachable!(),
    };
    let filler = match matches.value_of("filler").unwrap() {
        "nop" => Filler::Nop,
        "random" => Filler::Random,
        _ => unreachable!(),
    };

    let (stripped, records) = obfuscate::obfuscate(input, strategy, filler)?;

    let obf_path = suffixed(input, ".obf");
    fs::write(&obf_path, &stripped)
        .with_context(|| format!("writing {}", obf_path.display()))?;

    let meta_path = suffixed(input, ".obf.meta");
    fs::write(&meta_path, meta::serialize(&records)?)
        .with_context(|| format!("writing {}", meta_path.display()))?;

    Ok(0)
}

fn run_main(matches: &clap::ArgMatches) -> Result<i32> {
    let binary = matches.value_of("binary").unwrap();
    let metadata = matches
        .value_of("metadata")
        .map(PathBuf::from)
        .unwrap_or_else(|| suffixed(Path::new(binary), ".meta"));
    let args: Vec<String> = matches
        .values_of("args")
        .map(|values| values.map(String::from).collect())
        .unwrap_or_else(Vec::new);

    let supervisor = Supervisor::prepare(binary, &metadata, &args)?;
    supervisor.run()
}

fn run() -> Result<i32> {
    let matches = app().get_matches();

    match matches.subcommand() {
        ("obfuscate", Some(matches)) => obfuscate_main(matches),
        ("run", Some(matches)) => run_main(matches),
        _ => unreachable!(),
    }
}

fn main() {
    env_logger::init();

    process::exit(match run() {
        Ok(status) => status,
        Err(e) => {
            eprintln!("Fatal: {:#}", e);
            1
        }
    });
}
