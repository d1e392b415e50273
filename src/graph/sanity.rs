//! Dependency sanity checks run before a file joins the graph

use std::collections::HashSet;

use crate::error::{DependencyFault, GripError, Result};
use crate::record::ContextFile;
use crate::store::GraphTx;

/// Validate the dependency list of `file` against the stored graph.
///
/// Checks run in order and stop at the first fault: self reference,
/// duplicate dependency, dependency loop, then the rule that a file with
/// no dependencies must be a snapshot.
pub fn check(tx: &dyn GraphTx, file: &ContextFile) -> Result<()> {
    let reject = |fault| GripError::DependencyProblem {
        data_dep_dig: *file.data_dep_dig(),
        fault,
    };
    let me = file.data_dep_dig();

    if file.does_depend_on(me) {
        return Err(reject(DependencyFault::SelfReference));
    }

    let mut seen = HashSet::with_capacity(file.depends_on().len());
    for dep in file.depends_on() {
        if !seen.insert(*dep) {
            return Err(reject(DependencyFault::DuplicateDependency(*dep)));
        }
    }

    // Walk stored dependencies; reaching `me` again means a loop. A loop
    // needs a stored file that already depends on `me`.
    let mut visited = HashSet::new();
    let starts = if tx.dependents_of(file.context(), me)?.is_empty() {
        &[][..]
    } else {
        file.depends_on()
    };
    for start in starts {
        let mut stack = vec![*start];
        while let Some(dig) = stack.pop() {
            if !visited.insert(dig) {
                continue;
            }
            let Some(stored) = tx.context_file(&dig)? else {
                continue;
            };
            if stored.file.context() != file.context() {
                continue;
            }
            for next in stored.file.depends_on() {
                if next == me {
                    return Err(reject(DependencyFault::Cycle(*start)));
                }
                stack.push(*next);
            }
        }
    }

    if file.depends_on().is_empty() && !file.is_snapshot() {
        return Err(reject(DependencyFault::RootNotSnapshot));
    }

    Ok(())
}
