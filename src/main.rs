use std::time::Duration;

use anyhow::Context;
use log::{debug, error, info, warn};

use extract::{extract_subnet_map, extract_vms, load_snapshot};
use probe::{ProbeConfig, Prober};
use remote::GcloudSsh;
use scenario::{find_scenario, ScenarioContext, ScenarioReport, Verdict};

mod extract;
mod probe;
mod remote;
mod scenario;
mod types;
mod validate;

const APP_NAME: &str = "cloudcheck";

fn cli() -> clap::Command {
    clap::Command::new(APP_NAME)
        .version(clap::crate_version!())
        .about("Check a terraform-managed GCP network against a lab module and test VM connectivity")
        .arg(
            clap::Arg::new("MODULE")
                .required(true)
                .help("Check module to run: mod2, mod3, or a scenario name from --scenario-file"),
        )
        .arg(
            clap::Arg::new("SNAPSHOT")
                .required(true)
                .help("JSON file produced by `terraform show --json`"),
        )
        .arg(
            clap::Arg::new("SCENARIO-FILE")
                .long("scenario-file")
                .help("YAML file with scenario definitions used instead of the built-in modules"),
        )
        .arg(
            clap::Arg::new("SETTLE-SECS")
                .long("settle-secs")
                .default_value("3")
                .value_parser(clap::value_parser!(u64))
                .help("Seconds to wait for the remote listener before connecting"),
        )
        .arg(
            clap::Arg::new("ATTEMPTS")
                .long("attempts")
                .default_value("3")
                .value_parser(clap::value_parser!(u32).range(1..))
                .help("Connect attempts while the listener refuses connections"),
        )
        .arg(
            clap::Arg::new("VERBOSE")
                .long("verbose")
                .action(clap::ArgAction::SetTrue)
                .help("Enables DEBUG log level"),
        )
}

fn main() {
    // Usage errors exit 1; --help and --version exit 0.
    let matches = cli().try_get_matches().unwrap_or_else(|err| {
        if err.use_stderr() {
            err.print().ok();
            std::process::exit(1)
        }
        err.exit()
    });

    let module = matches
        .get_one::<String>("MODULE")
        .expect("MODULE is required");
    let snapshot = matches
        .get_one::<String>("SNAPSHOT")
        .expect("SNAPSHOT is required");
    let scenario_file = matches.get_one::<String>("SCENARIO-FILE");

    let config = ProbeConfig {
        settle: Duration::from_secs(*matches.get_one::<u64>("SETTLE-SECS").expect("has default")),
        attempts: *matches.get_one::<u32>("ATTEMPTS").expect("has default"),
        ..Default::default()
    };

    setup_logger(&matches);

    match check(module, snapshot, scenario_file.map(String::as_str), config) {
        Ok(report) => {
            summarize(&report);
            info!("Done.");
        }
        Err(err) => {
            error!("Running checks failed: {err:#}");
            std::process::exit(1)
        }
    }
}

fn check(
    module: &str,
    snapshot_path: &str,
    scenario_file: Option<&str>,
    config: ProbeConfig,
) -> Result<ScenarioReport, anyhow::Error> {
    let scenario = find_scenario(module, scenario_file)?;

    let snapshot = load_snapshot(snapshot_path)?;
    let subnets = extract_subnet_map(&snapshot).context("Extracting subnets")?;
    debug!("Subnet to VPC map: {subnets:?}");
    let vms = extract_vms(&snapshot, &subnets).context("Extracting VMs")?;
    debug!("Extracted {} VMs", vms.len());

    let transport = GcloudSsh::default();
    let prober = Prober::new(&transport, config);
    let ctx = ScenarioContext {
        vms: &vms,
        prober: &prober,
    };

    Ok(scenario::run(&scenario, &ctx))
}

// The exit status stays 0 whatever the verdicts; results are reported only.
fn summarize(report: &ScenarioReport) {
    for a in &report.assertions {
        let line = format!(
            "{} -> {} port {} ({}): {:?}",
            a.assertion.from, a.assertion.to, a.assertion.port, a.assertion.address, a.verdict
        );
        match a.verdict {
            Verdict::Passed => info!("{line}"),
            _ => warn!("{line} {}", a.detail.trim_end()),
        }
    }

    if report.passed() {
        info!("All checks for {} passed", report.name);
    } else {
        warn!("Checks for {} reported failures", report.name);
    }
}

fn setup_logger(matches: &clap::ArgMatches) {
    let verbose_arg = "VERBOSE";

    let mut log_builder = env_logger::Builder::new();
    if matches
        .try_get_one::<bool>(verbose_arg)
        .is_ok_and(|arg| arg.is_some_and(|&value| value))
    {
        log_builder.filter(None, log::LevelFilter::Debug);
    } else {
        log_builder.filter(None, log::LevelFilter::Info);
    }
    log_builder.init();
}
