//! Three-way merge planning: diff pristine vs. incoming ("theirs"), compare
//! against the current graph ("ours") at each changed path, and classify
//! each path as applicable, a conflict, or already settled.
//!
//! This module only *plans* the merge — it never mutates the graph. The
//! facade applies a plan's actions through the normal `set`/`delete`
//! methods so merged changes are recorded and dispatched exactly like any
//! other mutation, matching "apply theirs through the wrapper (recorded
//! normally)".

use crate::graph;
use crate::options::Options;
use crate::snapshot::diff;
use crate::value::{deep_eq, Value};
use chronicle_path::Path;
use std::collections::HashMap;

#[derive(Clone, Debug)]
pub enum Resolution {
    Ours,
    Theirs,
    Custom(Value),
}

#[derive(Clone, Debug)]
pub struct Conflict {
    pub path: Path,
    pub base: Option<Value>,
    pub ours: Option<Value>,
    pub theirs: Option<Value>,
}

/// A planned write (`Some(value)`) or delete (`None`) at a path, split by how
/// the facade must apply it: `theirs` changes go through the normal
/// `set`/`delete` path (recorded and dispatched like any other mutation, per
/// "apply theirs through the wrapper"), while `resolved` conflict
/// resolutions are written straight to the raw graph ("apply it directly to
/// the raw graph") and never appear in the change log.
#[derive(Debug, Default)]
pub struct MergePlan {
    pub theirs: Vec<(Path, Option<Value>)>,
    pub resolved: Vec<(Path, Option<Value>)>,
    pub conflicts: Vec<Conflict>,
}

fn optional_eq(a: &Option<Value>, b: &Option<Value>) -> bool {
    match (a, b) {
        (None, None) => true,
        (Some(x), Some(y)) => deep_eq(x, y),
        _ => false,
    }
}

/// Plans merging `incoming` into `current`, whose common ancestor is
/// `pristine`. `resolutions` supplies a strategy for specific conflicting
/// paths; any conflicting path with no entry is reported unresolved.
pub fn plan_merge(
    current: &Value,
    pristine: &Value,
    incoming: &Value,
    resolutions: &HashMap<Path, Resolution>,
    options: &Options,
) -> MergePlan {
    let theirs_changes = diff(pristine, incoming, options);
    let mut plan = MergePlan::default();

    for change in theirs_changes {
        let base_value = change.old_value;
        let theirs_value = change.new_value;
        let ours_value = graph::get_at(current, &change.path).cloned();

        if optional_eq(&base_value, &ours_value) {
            plan.theirs.push((change.path, theirs_value));
            continue;
        }

        if optional_eq(&ours_value, &theirs_value) {
            continue;
        }

        match resolutions.get(&change.path) {
            Some(Resolution::Ours) => {}
            Some(Resolution::Theirs) => plan.resolved.push((change.path, theirs_value)),
            Some(Resolution::Custom(v)) => plan.resolved.push((change.path, Some(v.clone()))),
            None => plan.conflicts.push(Conflict { path: change.path, base: base_value, ours: ours_value, theirs: theirs_value }),
        }
    }

    plan
}

#[cfg(test)]
mod tests {
    use super::*;
    use indexmap::IndexMap;

    fn record(fields: &[(&str, f64)]) -> Value {
        let mut m = IndexMap::new();
        for (k, v) in fields {
            m.insert(k.to_string(), Value::Number(*v));
        }
        Value::Record(m)
    }

    #[test]
    fn conflicting_path_reported_when_unresolved() {
        let options = Options::default();
        let pristine = record(&[("a", 1.0), ("b", 2.0), ("c", 3.0)]);
        let current = record(&[("a", 10.0), ("b", 2.0), ("c", 3.0)]);
        let incoming = record(&[("a", 100.0), ("b", 20.0), ("c", 30.0)]);

        let plan = plan_merge(&current, &pristine, &incoming, &HashMap::new(), &options);
        assert_eq!(plan.conflicts.len(), 1);
        assert_eq!(plan.theirs.len(), 2);
    }

    #[test]
    fn resolution_plans_custom_value() {
        let options = Options::default();
        let pristine = record(&[("a", 1.0)]);
        let current = record(&[("a", 10.0)]);
        let incoming = record(&[("a", 100.0)]);

        let mut resolutions = HashMap::new();
        let path = Path::root().child(chronicle_path::Segment::Key("a".into()));
        resolutions.insert(path.clone(), Resolution::Custom(Value::Number(7.0)));

        let plan = plan_merge(&current, &pristine, &incoming, &resolutions, &options);
        assert!(plan.conflicts.is_empty());
        assert_eq!(plan.resolved, vec![(path, Some(Value::Number(7.0)))]);
    }
}
