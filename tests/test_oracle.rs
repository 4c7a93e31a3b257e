mod common;

use std::sync::Arc;

use common::{
    local_scenario, mock_driver, placeholder_artifact, reference_driver, reference_model, Fault,
    MockFactory,
};
use mlpot_parity::core::tolerances::{Tolerance, FD_STEP};
use mlpot_parity::engine::evaluator::ExecutionStrategy;
use mlpot_parity::error::HarnessError;
use mlpot_parity::harness::checker::CheckSet;
use mlpot_parity::harness::oracle::{finite_difference_forces, round_trip, rounding_bound};

#[test]
fn test_oracle_matches_analytic_forces_of_reference_model() {
    let dir = tempfile::tempdir().unwrap();
    let model = reference_model(dir.path());
    let driver = reference_driver(dir.path());

    for name in ["h2o_triplet", "h2o_zbl_triplet"] {
        let scenario = local_scenario(name, &model);
        let tolerance = scenario.expectations.forces.unwrap().tolerance;

        let mut session = driver.open(&scenario, ExecutionStrategy::Default).unwrap();
        session.evaluate().unwrap();
        let analytic = session.forces().unwrap();
        let report = finite_difference_forces(&mut session, FD_STEP).unwrap();

        assert_eq!(report.forces.len(), 3);
        assert_eq!(report.evaluations, 27);
        assert_eq!(report.restore_violations, 0);

        let mut checks = CheckSet::new();
        assert!(
            checks.check_oracle(&analytic, &report, tolerance),
            "{}: {}",
            name,
            checks.checks[0]
        );
    }
}

#[test]
fn test_oracle_leaves_the_configuration_restored() {
    let dir = tempfile::tempdir().unwrap();
    let model = reference_model(dir.path());
    let driver = reference_driver(dir.path());
    let scenario = local_scenario("h2o_triplet", &model);

    let mut session = driver.open(&scenario, ExecutionStrategy::NoDomainDecomposition).unwrap();
    session.evaluate().unwrap();
    let before = session.positions().unwrap();
    let energy = session.energy().unwrap();

    let report = finite_difference_forces(&mut session, FD_STEP).unwrap();

    let after = session.positions().unwrap();
    for (a, b) in before.iter().zip(&after) {
        for axis in 0..3 {
            assert!((a[axis] - b[axis]).abs() <= rounding_bound(a[axis], FD_STEP));
        }
    }
    assert!(report.max_restore_residual <= 4.0 * f64::EPSILON * 2.0);
    // The trailing evaluation left the evaluator consistent with the restored state.
    assert!(Tolerance::approx().accepts(session.energy().unwrap(), energy));
}

#[test]
fn test_oracle_is_exact_on_a_quadratic_surface() {
    let dir = tempfile::tempdir().unwrap();
    let artifact = placeholder_artifact(dir.path());
    let driver = mock_driver(dir.path(), Arc::new(MockFactory::new(Fault::None)));
    let scenario = local_scenario("water_box", &artifact);

    let mut session = driver.open(&scenario, ExecutionStrategy::Default).unwrap();
    session.evaluate().unwrap();
    let analytic = session.forces().unwrap();
    let report = finite_difference_forces(&mut session, FD_STEP).unwrap();

    let mut checks = CheckSet::new();
    assert!(checks.check_oracle(&analytic, &report, Tolerance::allclose(1e-7, 1e-7)));
}

#[test]
fn test_oracle_detects_wrong_forces() {
    let dir = tempfile::tempdir().unwrap();
    let artifact = placeholder_artifact(dir.path());
    let driver = mock_driver(dir.path(), Arc::new(MockFactory::new(Fault::ForceScale(1.01))));
    let scenario = local_scenario("h2o_triplet", &artifact);

    let mut session = driver.open(&scenario, ExecutionStrategy::Default).unwrap();
    session.evaluate().unwrap();
    let analytic = session.forces().unwrap();
    let report = finite_difference_forces(&mut session, FD_STEP).unwrap();

    let mut checks = CheckSet::new();
    assert!(!checks.check_oracle(&analytic, &report, Tolerance::allclose_atol(1e-5)));
    assert!(checks.checks[0].worst_index.is_some());
}

#[test]
fn test_invalid_step_is_rejected_before_any_probe() {
    let dir = tempfile::tempdir().unwrap();
    let artifact = placeholder_artifact(dir.path());
    let driver = mock_driver(dir.path(), Arc::new(MockFactory::new(Fault::None)));
    let scenario = local_scenario("h2o_triplet", &artifact);

    let mut session = driver.open(&scenario, ExecutionStrategy::Default).unwrap();
    for h in [0.0, -1e-4, f64::INFINITY] {
        let err = finite_difference_forces(&mut session, h).unwrap_err();
        assert!(matches!(err, HarnessError::InvalidConfiguration(_)));
    }
}

#[test]
fn test_round_trip_neutrality_over_catalogue_coordinates() {
    for scenario in mlpot_parity::core::scenarios::catalogue().unwrap() {
        for p in scenario.configuration.positions() {
            for axis in 0..3 {
                let x = p[axis];
                let y = round_trip(x, FD_STEP);
                assert!((y - x).abs() <= rounding_bound(x, FD_STEP), "{} -> {}", x, y);
            }
        }
    }
}
