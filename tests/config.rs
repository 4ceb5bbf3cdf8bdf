use std::path::PathBuf;

use pdelab::{PdeError, PdeKind, Problem};

fn problems_dir() -> PathBuf {
    PathBuf::from(env!("CARGO_MANIFEST_DIR")).join("problems")
}

fn parse_err(json: &str) -> PdeError {
    Problem::from_json(json).unwrap_err()
}

#[test]
fn shipped_problems_load_and_validate() {
    let mut count = 0;
    for entry in std::fs::read_dir(problems_dir()).unwrap() {
        let path = entry.unwrap().path();
        if path.extension().and_then(|e| e.to_str()) != Some("json") {
            continue;
        }
        let problem = Problem::load(&path).unwrap_or_else(|e| panic!("{}: {e}", path.display()));
        assert!(!problem.name.is_empty());
        assert!(PdeKind::ALL.contains(&problem.kind().unwrap()));
        count += 1;
    }
    assert!(count >= 5);
}

#[test]
fn effective_problem_round_trips_through_json() {
    let problem = Problem::load(&problems_dir().join("heat-2d-crank-nicolson.json")).unwrap();
    let text = problem.to_json_pretty().unwrap();
    let again = Problem::from_json(&text).unwrap();
    assert_eq!(problem, again);
}

#[test]
fn unknown_operator_is_unsupported() {
    let err = parse_err(
        r#"{"name": "x", "pde": "wave", "axes": [{"cells": 4}], "solution": {"kind": "linear"}}"#,
    );
    assert!(matches!(err, PdeError::UnsupportedOperator(ref tag) if tag == "wave"));
    assert!(err.is_configuration());
}

#[test]
fn invalid_descriptions_are_configuration_errors() {
    let cases = [
        // too few cells
        r#"{"name": "x", "pde": "diffusion", "axes": [{"cells": 1}], "solution": {"kind": "linear"}}"#,
        // no axes
        r#"{"name": "x", "pde": "diffusion", "axes": [], "solution": {"kind": "linear"}}"#,
        // four axes
        r#"{"name": "x", "pde": "diffusion", "axes": [{"cells": 2}, {"cells": 2}, {"cells": 2}, {"cells": 2}], "solution": {"kind": "linear"}}"#,
        // periodic on one face only
        r#"{"name": "x", "pde": "diffusion", "axes": [{"cells": 4, "low": "periodic"}], "solution": {"kind": "linear"}}"#,
        // negative length
        r#"{"name": "x", "pde": "diffusion", "axes": [{"cells": 4, "length": -1.0}], "solution": {"kind": "linear"}}"#,
        // steady with no Dirichlet face
        r#"{"name": "x", "pde": "diffusion", "axes": [{"cells": 4, "low": "neumann", "high": "neumann"}], "solution": {"kind": "linear"}}"#,
        // velocity on a pure diffusion operator
        r#"{"name": "x", "pde": "diffusion", "velocity": [1.0], "axes": [{"cells": 4}], "solution": {"kind": "linear"}}"#,
        // velocity arity above dimension
        r#"{"name": "x", "pde": "advection-diffusion", "velocity": [1.0, 1.0], "axes": [{"cells": 4}], "solution": {"kind": "linear"}}"#,
        // non-positive diffusivity
        r#"{"name": "x", "pde": "diffusion", "diffusivity": {"constant": 0.0}, "axes": [{"cells": 4}], "solution": {"kind": "linear"}}"#,
        // zero iteration budget
        r#"{"name": "x", "pde": "diffusion", "axes": [{"cells": 4}], "solution": {"kind": "linear"}, "solver": {"max_iterations": 0}}"#,
        // non-positive tolerance
        r#"{"name": "x", "pde": "diffusion", "axes": [{"cells": 4}], "solution": {"kind": "linear"}, "solver": {"tolerance": 0.0}}"#,
        // zero steps
        r#"{"name": "x", "pde": "diffusion", "axes": [{"cells": 4}], "solution": {"kind": "linear"}, "time": {"final_time": 1.0, "steps": 0}}"#,
        // non-positive final time
        r#"{"name": "x", "pde": "diffusion", "axes": [{"cells": 4}], "solution": {"kind": "linear"}, "time": {"final_time": 0.0}}"#,
    ];
    for json in cases {
        let err = parse_err(json);
        assert!(
            matches!(err, PdeError::Configuration(_)),
            "expected configuration error for {json}, got {err}"
        );
    }
}

#[test]
fn malformed_json_is_a_configuration_error() {
    let err = parse_err(r#"{"name": "x", "pde": "diffusion", "axes": [{"cells": "many"}]}"#);
    assert!(matches!(err, PdeError::Json(_)));
    assert!(err.is_configuration());
}

#[test]
fn missing_file_is_an_io_error() {
    let dir = tempfile::tempdir().unwrap();
    let err = Problem::load(&dir.path().join("absent.json")).unwrap_err();
    assert!(matches!(err, PdeError::Io { .. }));
    assert!(!err.is_configuration());
}
