// build.rs

use clap::{Arg, ArgAction, Command};
use clap_mangen::Man;
use std::env;
use std::fs;
use std::path::PathBuf;

/// Common argument: scope namespace
fn namespace_arg() -> Arg {
    Arg::new("namespace")
        .short('n')
        .long("namespace")
        .help("Namespace scope")
}

/// Common argument: scope environment
fn environment_arg() -> Arg {
    Arg::new("environment")
        .short('e')
        .long("environment")
        .requires("namespace")
        .help("Environment scope")
}

fn build_cli() -> Command {
    Command::new("envstore")
        .version(env!("CARGO_PKG_VERSION"))
        .author("Envstore Contributors")
        .about("Build and serve reproducible conda environments")
        .arg(
            Arg::new("config")
                .short('c')
                .long("config")
                .global(true)
                .help("Configuration file (TOML); built-in defaults when omitted"),
        )
        .subcommand_required(true)
        .subcommand(Command::new("init").about("Create the database, store directory and token signing key"))
        .subcommand(Command::new("server").about("Run the HTTP API server"))
        .subcommand(
            Command::new("worker")
                .about("Run a worker pool that executes queued tasks")
                .arg(
                    Arg::new("drain")
                        .long("drain")
                        .action(ArgAction::SetTrue)
                        .help("Execute every due task once and exit"),
                ),
        )
        .subcommand(
            Command::new("token")
                .about("Mint a token with the server's signing key")
                .arg(
                    Arg::new("primary_namespace")
                        .short('p')
                        .long("primary-namespace")
                        .required(true)
                        .help("Namespace the token holder administers"),
                )
                .arg(
                    Arg::new("role_bindings")
                        .short('r')
                        .long("role-binding")
                        .action(ArgAction::Append)
                        .value_name("PATTERN=ROLE")
                        .help("Extra binding, e.g. team/*=developer (repeatable)"),
                )
                .arg(
                    Arg::new("expiration")
                        .short('e')
                        .long("expiration")
                        .help("Lifetime (e.g., 30d)"),
                ),
        )
        .subcommand(
            Command::new("settings")
                .about("Read or write settings")
                .subcommand_required(true)
                .subcommand(
                    Command::new("get")
                        .about("Print the resolved settings for a scope as JSON")
                        .arg(namespace_arg())
                        .arg(environment_arg()),
                )
                .subcommand(
                    Command::new("set")
                        .about("Store overrides at a scope")
                        .arg(
                            Arg::new("values")
                                .required(true)
                                .num_args(1..)
                                .value_name("KEY=VALUE")
                                .help("key=value pairs; values are JSON, bare words are strings"),
                        )
                        .arg(namespace_arg())
                        .arg(environment_arg()),
                ),
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

    let man = Man::new(build_cli());
    let mut buffer = Vec::new();
    if let Err(e) = man.render(&mut buffer) {
        println!("cargo:warning=Failed to render man page: {}", e);
        return;
    }

    let man_path = out_dir.join("envstore.1");
    if let Err(e) = fs::write(&man_path, buffer) {
        println!("cargo:warning=Failed to write man page: {}", e);
    }
}
