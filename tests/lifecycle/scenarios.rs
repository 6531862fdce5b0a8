//! BDD scenarios for the operation lifecycle.

use rstest_bdd_macros::scenario;

use super::test_helpers::{LifecycleContext, lifecycle_context};

#[scenario(
    path = "tests/features/lifecycle.feature",
    name = "Create a replicated volume"
)]
fn scenario_create_replicated_volume(lifecycle_context: LifecycleContext) {
    let _ = lifecycle_context;
}

#[scenario(
    path = "tests/features/lifecycle.feature",
    name = "Purge an abandoned volume create"
)]
fn scenario_purge_abandoned_create(lifecycle_context: LifecycleContext) {
    let _ = lifecycle_context;
}

#[scenario(
    path = "tests/features/lifecycle.feature",
    name = "Clean up an abandoned expansion"
)]
fn scenario_clean_abandoned_expansion(lifecycle_context: LifecycleContext) {
    let _ = lifecycle_context;
}

#[scenario(
    path = "tests/features/lifecycle.feature",
    name = "A saturated tracker holds back the cleaner"
)]
fn scenario_saturated_tracker(lifecycle_context: LifecycleContext) {
    let _ = lifecycle_context;
}
