use std::fs;
use std::path::Path;

use anyhow::{anyhow, Context};
use log::{info, warn};
use serde::Deserialize;

use crate::probe::{AddressKind, Prober};
use crate::types::{ConnectivityOutcome, ExpectedEntry, OutcomeKind, VmTable};
use crate::validate::{check_structure, StructureReport};

#[derive(Deserialize, Debug, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum Expectation {
    Succeed,
    Fail,
}

/// A connectivity check: `from` connects to `to` on `port`.
#[derive(Deserialize, Debug, Clone)]
#[cfg_attr(test, derive(PartialEq))]
pub struct Assertion {
    pub(crate) from: String,
    pub(crate) to: String,
    pub(crate) port: u16,
    pub(crate) address: AddressKind,
    pub(crate) expect: Expectation,
}

#[derive(Deserialize, Debug, Clone)]
#[cfg_attr(test, derive(PartialEq))]
pub struct Scenario {
    pub(crate) name: String,
    pub(crate) expected: Vec<ExpectedEntry>,
    #[serde(default)]
    pub(crate) assertions: Vec<Assertion>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Verdict {
    Passed,
    Mismatch,
    /// The probe could not produce a verdict (transport failure, unknown VM).
    Inconclusive,
}

#[derive(Debug)]
pub struct AssertionReport {
    pub(crate) assertion: Assertion,
    pub(crate) verdict: Verdict,
    pub(crate) detail: String,
}

#[derive(Debug)]
pub struct ScenarioReport {
    pub(crate) name: String,
    pub(crate) structure: StructureReport,
    pub(crate) assertions: Vec<AssertionReport>,
}

impl ScenarioReport {
    pub(crate) fn passed(&self) -> bool {
        !self.structure.failed && self.assertions.iter().all(|a| a.verdict == Verdict::Passed)
    }
}

/// Read-only inputs shared by every check of a scenario run.
pub struct ScenarioContext<'a> {
    pub(crate) vms: &'a VmTable,
    pub(crate) prober: &'a Prober<'a>,
}

fn assertion(from: &str, to: &str, port: u16, address: AddressKind, expect: Expectation) -> Assertion {
    Assertion {
        from: from.to_string(),
        to: to.to_string(),
        port,
        address,
        expect,
    }
}

fn mod2() -> Scenario {
    Scenario {
        name: "mod2".to_string(),
        expected: vec![
            ExpectedEntry::new("tf-mod2-lab1-vm1", "tf-mod2-lab1-sub1", "tf-mod2-lab1-vpc1"),
            ExpectedEntry::new("tf-mod2-lab1-vm2", "tf-mod2-lab1-sub2", "tf-mod2-lab1-vpc2"),
            ExpectedEntry::new("tf-mod2-lab1-vm3", "tf-mod2-lab1-sub2", "tf-mod2-lab1-vpc2"),
            ExpectedEntry::new("tf-mod2-lab1-vm4", "tf-mod2-lab1-sub3", "tf-mod2-lab1-vpc2"),
        ],
        // vm3 and vm4 have no external address, so they cannot install nc.
        assertions: vec![
            assertion("tf-mod2-lab1-vm1", "tf-mod2-lab1-vm2", 1234, AddressKind::External, Expectation::Succeed),
            assertion("tf-mod2-lab1-vm1", "tf-mod2-lab1-vm2", 1234, AddressKind::Internal, Expectation::Fail),
        ],
    }
}

fn mod3() -> Scenario {
    Scenario {
        name: "mod3".to_string(),
        expected: vec![
            ExpectedEntry::new("tf-mod3-lab1-vm1", "tf-mod3-lab1-sub1", "tf-mod3-lab1-vpc1"),
            ExpectedEntry::new("tf-mod3-lab1-vm2", "tf-mod3-lab1-sub2", "tf-mod3-lab1-vpc1"),
            ExpectedEntry::new("tf-mod3-lab1-vm3", "tf-mod3-lab1-sub3", "tf-mod3-lab1-vpc2"),
        ],
        assertions: vec![
            assertion("tf-mod3-lab1-vm1", "tf-mod3-lab1-vm2", 1234, AddressKind::Internal, Expectation::Succeed),
            assertion("tf-mod3-lab1-vm2", "tf-mod3-lab1-vm1", 1234, AddressKind::Internal, Expectation::Succeed),
            assertion("tf-mod3-lab1-vm1", "tf-mod3-lab1-vm3", 1234, AddressKind::Internal, Expectation::Fail),
            assertion("tf-mod3-lab1-vm1", "tf-mod3-lab1-vm3", 1234, AddressKind::External, Expectation::Succeed),
        ],
    }
}

pub(crate) fn builtin(name: &str) -> Option<Scenario> {
    match name {
        "mod2" => Some(mod2()),
        "mod3" => Some(mod3()),
        _ => None,
    }
}

fn load_scenarios(path: &str) -> Result<Vec<Scenario>, anyhow::Error> {
    let file = fs::File::open(Path::new(path)).with_context(|| format!("Opening {path}"))?;
    let scenarios = serde_yaml::from_reader(file).context("Parsing scenarios")?;

    Ok(scenarios)
}

/// Look up a scenario by name, in `scenario_file` when given, otherwise among the built-ins.
pub(crate) fn find_scenario(
    name: &str,
    scenario_file: Option<&str>,
) -> Result<Scenario, anyhow::Error> {
    match scenario_file {
        Some(path) => load_scenarios(path)?
            .into_iter()
            .find(|s| s.name == name)
            .ok_or_else(|| anyhow!("Scenario '{name}' not found in {path}")),
        None => builtin(name).ok_or_else(|| anyhow!("Unsupported module: {name}")),
    }
}

fn verdict(expect: Expectation, outcome: &ConnectivityOutcome) -> Verdict {
    if outcome.kind == OutcomeKind::Transport {
        return Verdict::Inconclusive;
    }

    match (expect, outcome.failed) {
        (Expectation::Succeed, false) | (Expectation::Fail, true) => Verdict::Passed,
        _ => Verdict::Mismatch,
    }
}

fn run_assertion(assertion: &Assertion, ctx: &ScenarioContext) -> AssertionReport {
    let endpoints = ctx.vms.get(&assertion.from).zip(ctx.vms.get(&assertion.to));
    let Some((from, to)) = endpoints else {
        warn!(
            "Skipping connection test {} -> {}: VM not found in infrastructure",
            assertion.from, assertion.to
        );
        return AssertionReport {
            assertion: assertion.clone(),
            verdict: Verdict::Inconclusive,
            detail: "VM not found in infrastructure".to_string(),
        };
    };

    info!(
        "Testing connection from {} to {} ({} address, port {}), expected to {:?}",
        from.name, to.name, assertion.address, assertion.port, assertion.expect
    );

    let outcome = match assertion.address {
        AddressKind::Internal => ctx.prober.probe_internal(from, to, assertion.port),
        AddressKind::External => ctx.prober.probe_external(from, to, assertion.port),
    };
    let verdict = verdict(assertion.expect, &outcome);

    match (verdict, assertion.expect) {
        (Verdict::Passed, Expectation::Succeed) => info!("Test connection SUCCEEDED (correctly)"),
        (Verdict::Passed, Expectation::Fail) => info!("Test connection FAILED (correctly)"),
        (Verdict::Mismatch, Expectation::Succeed) => {
            warn!("Test connection FAILED, but it shouldn't have: {}", outcome.detail.trim_end())
        }
        (Verdict::Mismatch, Expectation::Fail) => {
            warn!("Test connection SUCCEEDED, but it shouldn't have")
        }
        (Verdict::Inconclusive, _) => {
            warn!("Test connection inconclusive: {}", outcome.detail.trim_end())
        }
    }

    AssertionReport {
        assertion: assertion.clone(),
        verdict,
        detail: outcome.detail,
    }
}

/// Check the structure, then run every connectivity assertion in order.
pub(crate) fn run(scenario: &Scenario, ctx: &ScenarioContext) -> ScenarioReport {
    info!("Running checks for {}", scenario.name);

    let structure = check_structure(ctx.vms, &scenario.expected);
    if structure.failed {
        structure.report.lines().for_each(|line| warn!("{line}"));
    } else {
        info!("Check structure succeeded");
    }

    let assertions = scenario
        .assertions
        .iter()
        .map(|a| run_assertion(a, ctx))
        .collect();

    ScenarioReport {
        name: scenario.name.clone(),
        structure,
        assertions,
    }
}

#[cfg(test)]
mod tests {
    use crate::extract::{extract_subnet_map, extract_vms, load_snapshot};
    use crate::probe::tests::{fast_config, FakeTransport};
    use crate::probe::{AddressKind, Prober};
    use crate::scenario::{
        builtin, find_scenario, load_scenarios, run, verdict, Assertion, Expectation, Scenario,
        ScenarioContext, Verdict,
    };
    use crate::types::{ConnectivityOutcome, ExpectedEntry, OutcomeKind, VmTable};

    fn mod2_vms() -> Result<VmTable, anyhow::Error> {
        let snapshot = load_snapshot("testdata/snapshot.json")?;
        let subnets = extract_subnet_map(&snapshot)?;
        Ok(extract_vms(&snapshot, &subnets)?)
    }

    #[test]
    fn builtin_scenarios() {
        assert_eq!(builtin("mod2").unwrap().expected.len(), 4);
        assert_eq!(builtin("mod3").unwrap().assertions.len(), 4);
        assert!(builtin("mod9").is_none());
    }

    #[test]
    fn load_scenarios_successfully() -> Result<(), anyhow::Error> {
        let scenarios = load_scenarios("testdata/scenarios.yaml")?;

        assert_eq!(scenarios.len(), 2);
        assert_eq!(scenarios[0].name, "lab-internal");
        assert_eq!(
            scenarios[0].expected,
            vec![ExpectedEntry::new("tf-mod2-lab1-vm2", "tf-mod2-lab1-sub2", "tf-mod2-lab1-vpc2")]
        );
        assert_eq!(
            scenarios[0].assertions,
            vec![Assertion {
                from: "tf-mod2-lab1-vm2".to_string(),
                to: "tf-mod2-lab1-vm3".to_string(),
                port: 8080,
                address: AddressKind::Internal,
                expect: Expectation::Succeed,
            }]
        );
        assert!(scenarios[1].assertions.is_empty());

        Ok(())
    }

    #[test]
    fn load_scenarios_fails_due_to_unknown_address_kind() {
        let scenarios: Result<Vec<Scenario>, _> = serde_yaml::from_str(
            r#"---
        - name: bad
          expected: []
          assertions:
            - { from: a, to: b, port: 1, address: public, expect: succeed }
        "#,
        );

        assert!(scenarios.unwrap_err().to_string().contains("unknown variant `public`"));
    }

    #[test]
    fn find_scenario_fails_due_to_unknown_name() {
        let err = find_scenario("mod9", None).unwrap_err();
        assert!(err.to_string().contains("Unsupported module: mod9"));

        let err = find_scenario("mod2", Some("testdata/scenarios.yaml")).unwrap_err();
        assert!(err.to_string().contains("Scenario 'mod2' not found"));
    }

    #[test]
    fn find_scenario_fails_due_to_missing_file() {
        let err = find_scenario("mod2", Some("<missing>")).unwrap_err();
        assert!(format!("{err:#}").contains("No such file or directory"));
    }

    #[test]
    fn verdict_table() {
        let connected = ConnectivityOutcome::new(OutcomeKind::Connected, String::new());
        let refused = ConnectivityOutcome::new(OutcomeKind::Refused, String::new());
        let unreachable = ConnectivityOutcome::new(OutcomeKind::Unreachable, String::new());
        let transport = ConnectivityOutcome::new(OutcomeKind::Transport, String::new());

        assert_eq!(verdict(Expectation::Succeed, &connected), Verdict::Passed);
        assert_eq!(verdict(Expectation::Fail, &refused), Verdict::Passed);
        assert_eq!(verdict(Expectation::Fail, &unreachable), Verdict::Passed);
        assert_eq!(verdict(Expectation::Fail, &connected), Verdict::Mismatch);
        assert_eq!(verdict(Expectation::Succeed, &refused), Verdict::Mismatch);
        assert_eq!(verdict(Expectation::Fail, &transport), Verdict::Inconclusive);
    }

    #[test]
    fn run_mod2_successfully() -> Result<(), anyhow::Error> {
        let vms = mod2_vms()?;
        let transport = FakeTransport::replying(&[
            &["Ncat: Connected to 35.196.20.22:1234."],
            &["Ncat: TIMEOUT."],
        ]);
        let prober = Prober::new(&transport, fast_config());
        let ctx = ScenarioContext {
            vms: &vms,
            prober: &prober,
        };

        let report = run(&builtin("mod2").unwrap(), &ctx);

        assert!(!report.structure.failed);
        assert_eq!(report.assertions.len(), 2);
        assert!(report.assertions.iter().all(|a| a.verdict == Verdict::Passed));
        assert!(report.passed());
        assert_eq!(*transport.terminated.borrow(), 2);

        Ok(())
    }

    #[test]
    fn run_reports_mismatch_and_continues() -> Result<(), anyhow::Error> {
        let vms = mod2_vms()?;
        let transport = FakeTransport::replying(&[
            &["Ncat: Connection refused."],
            &["Ncat: Connection refused."],
            &["Ncat: Connection refused."],
            &["Ncat: Connected to 10.0.2.2:1234."],
        ]);
        let prober = Prober::new(&transport, fast_config());
        let ctx = ScenarioContext {
            vms: &vms,
            prober: &prober,
        };

        let report = run(&builtin("mod2").unwrap(), &ctx);

        assert_eq!(report.assertions[0].verdict, Verdict::Mismatch);
        assert!(report.assertions[0].detail.contains("refused"));
        assert_eq!(report.assertions[1].verdict, Verdict::Mismatch);
        assert!(!report.passed());

        Ok(())
    }

    #[test]
    fn run_with_missing_vms() {
        let vms = VmTable::new();
        let transport = FakeTransport::default();
        let prober = Prober::new(&transport, fast_config());
        let ctx = ScenarioContext {
            vms: &vms,
            prober: &prober,
        };

        let report = run(&builtin("mod3").unwrap(), &ctx);

        assert!(report.structure.failed);
        assert_eq!(report.structure.report.lines().count(), 3);
        assert!(report
            .assertions
            .iter()
            .all(|a| a.verdict == Verdict::Inconclusive));
        assert!(transport.commands.borrow().is_empty());
    }
}
