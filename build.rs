// build.rs

use clap::{Arg, ArgAction, Command};
use clap_mangen::Man;
use std::env;
use std::fs;
use std::path::PathBuf;

fn confirm_arg() -> Arg {
    Arg::new("confirm")
        .long("confirm")
        .value_name("NAME")
        .help("Repeat the command name to confirm")
}

fn build_cli() -> Command {
    Command::new("autobuild")
        .version(env!("CARGO_PKG_VERSION"))
        .author("Autobuild Contributors")
        .about("Autobuilder and package repository manager")
        .arg(
            Arg::new("config")
                .short('c')
                .long("config")
                .global(true)
                .default_value("/etc/autobuild/autobuild.toml")
                .help("Configuration file"),
        )
        .arg(
            Arg::new("verbose")
                .short('v')
                .long("verbose")
                .global(true)
                .action(ArgAction::SetTrue)
                .help("Log at debug level (RUST_LOG overrides)"),
        )
        .subcommand(Command::new("init").about("Create the database and instance directories"))
        .subcommand(Command::new("check-config").about("Load and validate the configuration"))
        .subcommand(Command::new("status").about("List managed resources with their status"))
        .subcommand(
            Command::new("resource")
                .about("Run a status operation on a managed resource")
                .arg(Arg::new("operation").required(true))
                .arg(Arg::new("kind").required(true))
                .arg(Arg::new("key").required(true)),
        )
        .subcommand(
            Command::new("submit")
                .about("Build and install a source package")
                .arg(Arg::new("dsc").required(true).help("Path to the .dsc file"))
                .arg(Arg::new("package").long("package").required(true))
                .arg(Arg::new("version").long("version").required(true))
                .arg(Arg::new("distribution").short('d').long("distribution").required(true))
                .arg(Arg::new("arch").short('a').long("arch").default_value("any"))
                .arg(Arg::new("component").long("component").default_value("main"))
                .arg(
                    Arg::new("option")
                        .short('o')
                        .long("option")
                        .action(ArgAction::Append)
                        .help("Upload option, key[alt]=value"),
                ),
        )
        .subcommand(
            Command::new("history")
                .about("Show recent submissions")
                .arg(Arg::new("limit").short('l').long("limit").default_value("20")),
        )
        .subcommand(
            Command::new("report")
                .about("Show the per-architecture report of a submission")
                .arg(Arg::new("package").required(true))
                .arg(Arg::new("version").required(true)),
        )
        .subcommand(
            Command::new("migrate")
                .about("Migrate a package to the next suite, or restore it from -rollbackN")
                .arg(Arg::new("package").required(true))
                .arg(Arg::new("distribution").required(true))
                .arg(confirm_arg()),
        )
        .subcommand(
            Command::new("remove")
                .about("Remove a package from a distribution")
                .arg(Arg::new("package").required(true))
                .arg(Arg::new("distribution").required(true))
                .arg(confirm_arg()),
        )
        .subcommand(
            Command::new("port")
                .about("Rebuild the active version of a package for other distributions")
                .arg(Arg::new("package").required(true))
                .arg(Arg::new("from").required(true))
                .arg(Arg::new("to").required(true).num_args(1..))
                .arg(confirm_arg()),
        )
        .subcommand(Command::new("auto-migrate").about("Run automatic migrations that are due"))
        .subcommand(
            Command::new("cancel")
                .about("Stop a building submission in the running daemon")
                .arg(Arg::new("key").required(true).help("Submission key, <package>_<version>")),
        )
        .subcommand(
            Command::new("show")
                .about("Show the versions of a package in every distribution, with rollbacks")
                .arg(Arg::new("package").required(true)),
        )
        .subcommand(
            Command::new("retry")
                .about("Submit a failed or rejected submission again")
                .arg(Arg::new("key").required(true).help("Submission key, <package>_<version>"))
                .arg(confirm_arg()),
        )
        .subcommand(
            Command::new("serve")
                .about("Run the daemon: recovery, housekeeping and the peer endpoint")
                .arg(Arg::new("interval").long("interval").default_value("300")),
        )
}

fn main() {
    println!("cargo:rerun-if-changed=build.rs");

    let out_dir = match env::var("OUT_DIR") {
        Ok(dir) => PathBuf::from(dir),
        Err(e) => {
            println!("cargo:warning=OUT_DIR not set: {}", e);
            return;
        }
    };
    let man_dir = out_dir.join("man");
    if let Err(e) = fs::create_dir_all(&man_dir) {
        println!("cargo:warning=Failed to create man directory: {}", e);
        return;
    }

    let mut buffer = Vec::new();
    if let Err(e) = Man::new(build_cli()).render(&mut buffer) {
        println!("cargo:warning=Failed to render man page: {}", e);
        return;
    }
    if let Err(e) = fs::write(man_dir.join("autobuild.1"), buffer) {
        println!("cargo:warning=Failed to write man page: {}", e);
    }
}
