//! Selection of Assemblies superseded by a newer deploy of the same plan.

use slipway_common::{Assembly, AssemblyStatus, Stage};

/// Assemblies on `current`'s plan that sort strictly before it by
/// (created_at, id) and are settled: `DEPLOYMENT_COMPLETE`, or `BUILT` with
/// no deploy stage still to come.
pub fn superseded(assemblies: Vec<Assembly>, current: &Assembly) -> Vec<Assembly> {
    let key = (current.created_at, current.id);
    assemblies
        .into_iter()
        .filter(|a| a.plan_id == current.plan_id && a.id != current.id)
        .filter(|a| (a.created_at, a.id) < key)
        .filter(|a| match a.status {
            AssemblyStatus::DeploymentComplete => true,
            AssemblyStatus::Built => !a.workflow.contains(Stage::Deploy),
            _ => false,
        })
        .collect()
}
