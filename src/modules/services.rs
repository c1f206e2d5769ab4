//! Data-driven component start ordering.
//!
//! Components and their prerequisites are declared as plain data at the
//! composition root; startup resolves a topological order once instead of
//! each component announcing dependencies through virtual dispatch. A
//! cycle or a reference to an undeclared component is a composition bug
//! and fails startup.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum ServiceGraphError {
    #[error("component {0} declared more than once")]
    DuplicateComponent(&'static str),

    #[error("component {component} depends on unknown component {dependency}")]
    UnknownDependency {
        component: &'static str,
        dependency: &'static str,
    },

    #[error("dependency cycle involving: {0:?}")]
    DependencyCycle(Vec<&'static str>),
}

/// One component and the components that must start before it.
#[derive(Debug, Clone, Copy)]
pub struct ComponentSpec {
    pub name: &'static str,
    pub depends_on: &'static [&'static str],
}

/// Resolve a start order satisfying every declared dependency.
///
/// Deterministic: among components whose prerequisites are met, declaration
/// order wins.
pub fn start_order(specs: &[ComponentSpec]) -> Result<Vec<&'static str>, ServiceGraphError> {
    for (i, spec) in specs.iter().enumerate() {
        if specs[..i].iter().any(|other| other.name == spec.name) {
            return Err(ServiceGraphError::DuplicateComponent(spec.name));
        }
        for dep in spec.depends_on {
            if !specs.iter().any(|other| other.name == *dep) {
                return Err(ServiceGraphError::UnknownDependency {
                    component: spec.name,
                    dependency: dep,
                });
            }
        }
    }

    let mut order = Vec::with_capacity(specs.len());
    let mut started = vec![false; specs.len()];

    while order.len() < specs.len() {
        let mut progressed = false;
        for (i, spec) in specs.iter().enumerate() {
            if started[i] {
                continue;
            }
            let ready = spec
                .depends_on
                .iter()
                .all(|dep| specs.iter().position(|s| s.name == *dep).is_some_and(|j| started[j]));
            if ready {
                started[i] = true;
                order.push(spec.name);
                progressed = true;
            }
        }
        if !progressed {
            let remaining = specs
                .iter()
                .enumerate()
                .filter(|(i, _)| !started[*i])
                .map(|(_, s)| s.name)
                .collect();
            return Err(ServiceGraphError::DependencyCycle(remaining));
        }
    }
    Ok(order)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_start_order_respects_dependencies() {
        let specs = [
            ComponentSpec {
                name: "http",
                depends_on: &["session-registry", "keyring"],
            },
            ComponentSpec {
                name: "reconciler",
                depends_on: &["payment", "session-registry"],
            },
            ComponentSpec {
                name: "session-registry",
                depends_on: &[],
            },
            ComponentSpec {
                name: "payment",
                depends_on: &[],
            },
            ComponentSpec {
                name: "keyring",
                depends_on: &[],
            },
        ];

        let order = start_order(&specs).unwrap();
        assert_eq!(order.len(), 5);
        let pos = |name: &str| order.iter().position(|n| *n == name).unwrap();
        assert!(pos("session-registry") < pos("http"));
        assert!(pos("keyring") < pos("http"));
        assert!(pos("payment") < pos("reconciler"));
        assert!(pos("session-registry") < pos("reconciler"));
    }

    #[test]
    fn test_cycle_is_rejected() {
        let specs = [
            ComponentSpec {
                name: "a",
                depends_on: &["b"],
            },
            ComponentSpec {
                name: "b",
                depends_on: &["a"],
            },
        ];
        assert!(matches!(
            start_order(&specs),
            Err(ServiceGraphError::DependencyCycle(_))
        ));
    }

    #[test]
    fn test_unknown_dependency_is_rejected() {
        let specs = [ComponentSpec {
            name: "a",
            depends_on: &["ghost"],
        }];
        assert!(matches!(
            start_order(&specs),
            Err(ServiceGraphError::UnknownDependency {
                component: "a",
                dependency: "ghost"
            })
        ));
    }

    #[test]
    fn test_duplicate_component_is_rejected() {
        let specs = [
            ComponentSpec {
                name: "a",
                depends_on: &[],
            },
            ComponentSpec {
                name: "a",
                depends_on: &[],
            },
        ];
        assert!(matches!(
            start_order(&specs),
            Err(ServiceGraphError::DuplicateComponent("a"))
        ));
    }
}
