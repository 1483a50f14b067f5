// Copyright 2024 Logan Wemyss
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

use std::io::Write as _;
use std::path::{Path, PathBuf};
use std::process::ExitCode;
use std::time::Instant;

use clap::{Parser, Subcommand, ValueEnum};

use dcp_check::dcp::Dcp;
use dcp_check::probe::CommandProber;
use dcp_check::profile::{load_profile, Profile};
use dcp_check::util::human_size;

#[derive(Parser)]
#[command(name = "dcp-check", version, about = "Digital Cinema Package validator")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Validate a package and print the check report.
    Check {
        /// Package directory.
        path: PathBuf,

        /// JSON check profile.
        #[arg(long)]
        profile: Option<PathBuf>,

        /// Original Version package directory, for VF packages.
        #[arg(long)]
        ov: Option<PathBuf>,

        /// Out-of-package KDM file.
        #[arg(long)]
        kdm: Option<PathBuf>,

        /// KDM recipient RSA private key (PEM).
        #[arg(long)]
        key: Option<PathBuf>,

        /// Also dump the structured report as JSON.
        #[arg(long)]
        json: bool,
    },

    /// Extract package metadata without validating.
    Probe {
        /// Package directory.
        path: PathBuf,

        #[arg(long, value_enum, default_value_t = ProbeFormat::Json)]
        format: ProbeFormat,
    },
}

#[derive(Clone, Copy, ValueEnum)]
enum ProbeFormat {
    Json,
    Debug,
}

/// Console progress meter for the hashing phase.
fn hash_progress(path: &Path, done: u64, total: u64, elapsed: f64) {
    let name = path
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default();

    if done == total {
        let rate = if elapsed > 0.0 {
            (total as f64 / 1e6) / elapsed
        } else {
            0.0
        };
        eprintln!("{name}: {} in {elapsed:.2} sec (at {rate:.2} MBytes/s)", human_size(total));
    } else {
        let percent = if total > 0 {
            done as f64 / total as f64 * 100.0
        } else {
            0.0
        };
        eprint!("{name}: {percent:.2}%\r");
        let _ = std::io::stderr().flush();
    }
}

fn run_check(
    path: &Path,
    profile: Option<&Path>,
    ov: Option<&Path>,
    kdm: Option<&Path>,
    key: Option<&Path>,
    json: bool,
) -> Result<bool, dcp_check::Error> {
    let profile = match profile {
        Some(path) => load_profile(path)?,
        None => Profile::default(),
    };

    let mut dcp = Dcp::new(path)?;
    if let Some(kdm) = kdm {
        dcp = dcp.with_kdm(kdm);
    }
    if let Some(key) = key {
        dcp = dcp.with_private_key(key);
    }

    let prober = CommandProber::new();
    let (valid, report) = dcp.check(&prober, &profile, ov, Some(&hash_progress))?;

    println!("{}", report.pretty_str());
    if json {
        println!("{}", serde_json::to_string_pretty(&report.to_dict()).unwrap_or_default());
    }

    Ok(valid)
}

fn run_probe(path: &Path, format: ProbeFormat) -> Result<(), dcp_check::Error> {
    let mut dcp = Dcp::new(path)?;
    let prober = CommandProber::new();
    dcp.parse(&prober, true)?;

    let metadata = dcp.metadata();
    match format {
        ProbeFormat::Json => println!(
            "{}",
            serde_json::to_string_pretty(&metadata).unwrap_or_default()
        ),
        ProbeFormat::Debug => println!("{metadata:#?}"),
    }
    Ok(())
}

fn main() -> ExitCode {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let cli = Cli::parse();
    let start = Instant::now();

    let outcome = match cli.command {
        Command::Check {
            path,
            profile,
            ov,
            kdm,
            key,
            json,
        } => run_check(
            &path,
            profile.as_deref(),
            ov.as_deref(),
            kdm.as_deref(),
            key.as_deref(),
            json,
        ),
        Command::Probe { path, format } => run_probe(&path, format).map(|()| true),
    };

    log::info!("Total time : {:.2} seconds", start.elapsed().as_secs_f64());

    match outcome {
        Ok(true) => ExitCode::SUCCESS,
        Ok(false) => ExitCode::FAILURE,
        Err(e) => {
            eprintln!("Error : {e}");
            ExitCode::FAILURE
        }
    }
}
