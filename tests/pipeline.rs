use std::path::PathBuf;

use pdelab::problem::Forcing;
use pdelab::solver::DivergenceCause;
use pdelab::time::AdaptiveConfig;
use pdelab::{
    CancelToken, Field, Operator, Problem, Scheme, SolverStatus, TimeConfig, TimeIntegrator, run,
};

fn shipped(name: &str) -> Problem {
    let path = PathBuf::from(env!("CARGO_MANIFEST_DIR"))
        .join("problems")
        .join(name);
    Problem::load(&path).unwrap()
}

fn heat_2d(cells: usize) -> Problem {
    Problem::from_json(&format!(
        r#"{{
            "name": "heat",
            "pde": "diffusion",
            "axes": [{{"cells": {cells}}}, {{"cells": {cells}}}],
            "solution": {{"kind": "sine-product"}},
            "time": {{"final_time": 0.2, "scheme": "crank-nicolson", "steps": 20}}
        }}"#
    ))
    .unwrap()
}

#[test]
fn steady_shipped_problems_converge() {
    // Bounds follow the leading truncation term at each file's resolution.
    for (name, bound) in [
        ("poisson-2d.json", 2e-3),
        ("variable-diffusion-2d.json", 1e-2),
        ("advection-diffusion-2d.json", 1e-1),
        ("periodic-channel-2d.json", 3e-2),
        ("limited-advection-2d.json", 5e-2),
        ("poisson-2d-multigrid.json", 3e-3),
    ] {
        let outcome = run(&shipped(name), &CancelToken::new()).unwrap();
        assert!(outcome.succeeded(), "{name}: {}", outcome.status);
        assert!(outcome.errors.linf < bound, "{name}: linf={}", outcome.errors.linf);
        assert!(outcome.relative_residual < 1e-8, "{name}");
    }
}

#[test]
fn neumann_heat_follows_the_exact_decay() {
    let outcome = run(&shipped("neumann-heat-1d.json"), &CancelToken::new()).unwrap();
    assert!(outcome.succeeded());
    assert!((outcome.time - 0.2).abs() < 1e-14);
    assert!(outcome.errors.relative_l2 < 2e-2, "rel={}", outcome.errors.relative_l2);
    let steps: Vec<usize> = outcome.samples.iter().map(|s| s.step).collect();
    assert_eq!(steps, vec![0, 5, 10, 15, 20, 25, 30, 35, 40]);
}

#[test]
fn result_record_serialises_with_status_and_history() {
    let outcome = run(&heat_2d(6), &CancelToken::new()).unwrap();
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("result.json");
    std::fs::write(&path, serde_json::to_string_pretty(&outcome).unwrap()).unwrap();

    let text = std::fs::read_to_string(&path).unwrap();
    let value: serde_json::Value = serde_json::from_str(&text).unwrap();
    assert_eq!(value["status"]["status"], "converged");
    assert_eq!(value["pde"], "diffusion");
    assert_eq!(value["steps"].as_array().unwrap().len(), 20);
    assert_eq!(value["samples"].as_array().unwrap().len(), 21);
    assert_eq!(value["integration"]["steps"], 20);
    assert!(value.get("failed_step").is_none());
}

#[test]
fn cancelled_steady_run_reports_cancellation() {
    let cancel = CancelToken::new();
    cancel.cancel();
    let outcome = run(&shipped("poisson-2d.json"), &cancel).unwrap();
    assert_eq!(outcome.status, SolverStatus::Diverged(DivergenceCause::Cancelled));
    assert!(!outcome.succeeded());
}

#[test]
fn cancelled_transient_run_stops_at_the_first_step() {
    let cancel = CancelToken::new();
    cancel.cancel();
    let outcome = run(&heat_2d(6), &cancel).unwrap();
    assert_eq!(outcome.status, SolverStatus::Diverged(DivergenceCause::Cancelled));
    assert_eq!(outcome.failed_step, Some(1));
    assert_eq!(outcome.samples.len(), 1);
    assert_eq!(outcome.time, 0.0);
}

#[test]
fn adaptive_run_reaches_final_time() {
    let mut problem = heat_2d(8);
    if let Some(time) = problem.time.as_mut() {
        time.adaptive = Some(AdaptiveConfig {
            initial_dt: 0.05,
            tolerance: 1e-4,
            min_dt: 1e-8,
        });
    }
    problem.validate().unwrap();
    let outcome = run(&problem, &CancelToken::new()).unwrap();
    assert!(outcome.succeeded());
    assert!((outcome.time - 0.2).abs() < 1e-12);
    let accepted: Vec<_> = outcome.steps.iter().filter(|s| s.accepted).collect();
    assert_eq!(accepted.len(), outcome.integration.unwrap().steps);
    assert!(accepted.iter().all(|s| s.error_estimate.is_some()));
    let total: f64 = accepted.iter().map(|s| s.dt).sum();
    assert!((total - 0.2).abs() < 1e-10);
}

#[test]
fn snapshots_are_a_single_pass_sequence() {
    let problem = heat_2d(6);
    let grid = problem.grid().unwrap();
    let kind = problem.kind().unwrap();
    let operator = Operator::build(&grid, kind, &problem.coefficients()).unwrap();
    let forcing = problem.manufactured(&grid);
    let initial = Field::from_fn(&grid, |x| forcing.dirichlet(x, 0.0));
    let config = TimeConfig {
        sample_every: 7,
        ..TimeConfig::new(0.2, Scheme::BackwardEuler, 20)
    };
    let mut integrator = TimeIntegrator::new(
        &operator,
        &forcing,
        initial,
        &config,
        problem.solver,
        CancelToken::new(),
    )
    .unwrap();

    let steps: Vec<usize> = integrator
        .snapshots()
        .map(|s| s.unwrap().step)
        .collect();
    assert_eq!(steps, vec![0, 7, 14, 20]);
    assert!(integrator.is_finished());
    assert_eq!(integrator.snapshots().count(), 0);
}

#[test]
fn explicit_scheme_respects_its_stability_limit() {
    let mut problem = heat_2d(8);
    let grid = problem.grid().unwrap();
    let kind = problem.kind().unwrap();
    let operator = Operator::build(&grid, kind, &problem.coefficients()).unwrap();
    // 1 / (2 * (64 + 64)) = 1/256
    let limit = operator.explicit_step_limit();
    assert!((limit - 1.0 / 256.0).abs() < 1e-15);

    problem.time = Some(TimeConfig::new(64.0 * limit, Scheme::ForwardEuler, 64));
    let outcome = run(&problem, &CancelToken::new()).unwrap();
    assert!(outcome.succeeded());

    problem.time = Some(TimeConfig::new(64.0 * limit, Scheme::ForwardEuler, 63));
    let err = run(&problem, &CancelToken::new()).unwrap_err();
    assert!(err.is_configuration(), "{err}");
}
