//! Applies the store's named, ordered migration steps to a loaded
//! record exactly once each. The applied-name list only becomes durable
//! with the first post-load save, so a crash between migration and save
//! reruns the pending steps on the next load.

use crate::{config::MigrationStep, Error};
use serde_json::Value;
use std::panic::AssertUnwindSafe;

#[derive(Debug)]
pub(crate) struct Outcome {
    pub data: Value,
    pub applied: Vec<String>,
    /// True if any step ran, i.e. the record needs a save.
    pub changed: bool,
}

/// Run every configured step not yet named in `applied`, in configured
/// order. A record naming a step this store does not know refuses to
/// load with UnknownMigration.
pub(crate) fn run(
    key: &str,
    data: Value,
    applied: &[String],
    steps: &[MigrationStep],
) -> Result<Outcome, Error> {
    for name in applied {
        if !steps.iter().any(|step| step.name == *name) {
            return Err(Error::UnknownMigration {
                key: key.to_string(),
                name: name.clone(),
            });
        }
    }

    let mut out = Outcome {
        data,
        applied: applied.to_vec(),
        changed: false,
    };

    for step in steps {
        if out.applied.iter().any(|name| *name == step.name) {
            continue;
        }
        // Each step transforms a deep copy, so a failing step cannot
        // leave a half-applied record behind.
        let input = out.data.clone();
        let result = std::panic::catch_unwind(AssertUnwindSafe(|| (step.apply)(input)));

        let next = match result {
            Ok(Ok(next)) => next,
            Ok(Err(err)) => {
                return Err(Error::MigrationFailed {
                    key: key.to_string(),
                    name: step.name.clone(),
                    source: err,
                })
            }
            Err(_panic) => {
                return Err(Error::MigrationFailed {
                    key: key.to_string(),
                    name: step.name.clone(),
                    source: anyhow::anyhow!("migration step panicked"),
                })
            }
        };

        tracing::debug!(key, step = %step.name, "applied migration step");
        out.data = next;
        out.applied.push(step.name.clone());
        out.changed = true;
    }

    Ok(out)
}

#[cfg(test)]
mod test {
    use super::*;
    use serde_json::json;

    fn steps() -> Vec<MigrationStep> {
        vec![
            MigrationStep::new("add-coins", |mut data: Value| {
                data["coins"] = json!(0);
                Ok(data)
            }),
            MigrationStep::new("add-inventory", |mut data: Value| {
                data["inventory"] = json!([]);
                Ok(data)
            }),
        ]
    }

    #[test]
    fn applies_pending_steps_in_order() {
        let out = run("k", json!({}), &[], &steps()).unwrap();
        assert_eq!(out.data, json!({"coins": 0, "inventory": []}));
        assert_eq!(out.applied, vec!["add-coins", "add-inventory"]);
        assert!(out.changed);
    }

    #[test]
    fn rerun_is_idempotent() {
        let first = run("k", json!({}), &[], &steps()).unwrap();
        let second = run("k", first.data.clone(), &first.applied, &steps()).unwrap();
        assert_eq!(second.data, first.data);
        assert_eq!(second.applied, first.applied);
        assert!(!second.changed);
    }

    #[test]
    fn partially_migrated_records_resume() {
        let out = run(
            "k",
            json!({"coins": 7}),
            &["add-coins".to_string()],
            &steps(),
        )
        .unwrap();
        assert_eq!(out.data, json!({"coins": 7, "inventory": []}));
    }

    #[test]
    fn unknown_applied_step_refuses_to_load() {
        let err = run("k", json!({}), &["from-the-future".to_string()], &steps()).unwrap_err();
        assert!(matches!(err, Error::UnknownMigration { .. }));
    }

    #[test]
    fn failing_step_aborts_whole_migration() {
        let mut steps = steps();
        steps.insert(
            1,
            MigrationStep::new("explode", |_| anyhow::bail!("nope")),
        );
        let err = run("k", json!({}), &[], &steps).unwrap_err();
        assert!(matches!(err, Error::MigrationFailed { ref name, .. } if name == "explode"));
    }

    #[test]
    fn panicking_step_is_contained() {
        let steps = vec![MigrationStep::new("explode", |_| panic!("boom"))];
        let err = run("k", json!({}), &[], &steps).unwrap_err();
        assert!(matches!(err, Error::MigrationFailed { .. }));
    }
}
