//! Flush-dependency graph
//!
//! A dependency edge (parent, child) states that the parent may not be
//! written while the child is dirty and unflushed. The graph is a DAG, not
//! a tree: a parent may have many children and a child many parents. Edges
//! are stored asymmetrically — each entry keeps the handles of its parents
//! plus counters of its children and *dirty* children — which makes edge
//! insert/remove and dirty propagation O(parents).
//!
//! Cycles would deadlock every flush pass, so edge creation actively
//! rejects them with a reachability walk instead of assuming the caller
//! got it right.

use crate::entry::EntryId;
use crate::index::EntryIndex;
use tessera_common::{Error, Result};

/// Create a flush dependency between two resident entries
///
/// # Errors
/// Rejects self-edges, duplicate edges, and any edge that would close a
/// cycle through existing parent links.
pub fn create_dependency(index: &mut EntryIndex, parent: EntryId, child: EntryId) -> Result<()> {
    if parent == child {
        return Err(Error::invariant(
            "flush dependency of an entry on itself",
        ));
    }
    if index.entry(child)?.flush_dep_parents.contains(&parent) {
        return Err(Error::invariant(format!(
            "duplicate flush dependency on {}",
            index.entry(child)?.addr
        )));
    }

    // Edge parent -> child closes a cycle exactly when the child is already
    // an ancestor of the parent.
    if is_ancestor(index, child, parent)? {
        return Err(Error::invariant(format!(
            "flush dependency cycle through {}",
            index.entry(child)?.addr
        )));
    }

    let child_dirty = index.entry(child)?.dirty;
    index.entry_mut(child)?.flush_dep_parents.push(parent);

    let parent_entry = index.entry_mut(parent)?;
    parent_entry.flush_dep_nchildren += 1;
    if child_dirty {
        parent_entry.flush_dep_ndirty_children += 1;
    }
    Ok(())
}

/// Destroy a flush dependency between two resident entries
pub fn destroy_dependency(index: &mut EntryIndex, parent: EntryId, child: EntryId) -> Result<()> {
    let child_entry = index.entry_mut(child)?;
    let Some(pos) = child_entry.flush_dep_parents.iter().position(|&p| p == parent) else {
        return Err(Error::invariant(
            "destroy of a flush dependency that does not exist",
        ));
    };
    child_entry.flush_dep_parents.swap_remove(pos);
    let child_dirty = child_entry.dirty;

    let parent_entry = index.entry_mut(parent)?;
    if parent_entry.flush_dep_nchildren == 0 {
        return Err(Error::invariant("dependency child count underflow"));
    }
    parent_entry.flush_dep_nchildren -= 1;
    if child_dirty {
        if parent_entry.flush_dep_ndirty_children == 0 {
            return Err(Error::invariant("dirty dependency child count underflow"));
        }
        parent_entry.flush_dep_ndirty_children -= 1;
    }
    Ok(())
}

/// Whether `ancestor` is reachable from `entry` through parent links
fn is_ancestor(index: &EntryIndex, ancestor: EntryId, entry: EntryId) -> Result<bool> {
    let mut worklist = vec![entry];
    let mut seen = std::collections::HashSet::new();
    while let Some(id) = worklist.pop() {
        if id == ancestor {
            return Ok(true);
        }
        if !seen.insert(id) {
            continue;
        }
        worklist.extend(index.entry(id)?.flush_dep_parents.iter().copied());
    }
    Ok(false)
}

/// Propagate a clean-to-dirty transition to the entry's dependency parents
///
/// Returns the parent handles so the caller can deliver child-dirtied
/// notifications after the counters settle.
pub fn propagate_dirtied(index: &mut EntryIndex, id: EntryId) -> Result<Vec<EntryId>> {
    let parents = index.entry(id)?.flush_dep_parents.clone();
    for &parent in &parents {
        index.entry_mut(parent)?.flush_dep_ndirty_children += 1;
    }
    Ok(parents)
}

/// Propagate a dirty-to-clean transition to the entry's dependency parents
pub fn propagate_cleaned(index: &mut EntryIndex, id: EntryId) -> Result<Vec<EntryId>> {
    let parents = index.entry(id)?.flush_dep_parents.clone();
    for &parent in &parents {
        let parent_entry = index.entry_mut(parent)?;
        if parent_entry.flush_dep_ndirty_children == 0 {
            return Err(Error::invariant("dirty dependency child count underflow"));
        }
        parent_entry.flush_dep_ndirty_children -= 1;
    }
    Ok(parents)
}

/// Whether an entry participates in any dependency edge
pub fn has_dependencies(index: &EntryIndex, id: EntryId) -> Result<bool> {
    let entry = index.entry(id)?;
    Ok(entry.flush_dep_nchildren > 0 || !entry.flush_dep_parents.is_empty())
}

/// Compute dependency heights over a closed subgraph
///
/// `parents[i]` lists the indices of node `i`'s dependency parents within
/// the subgraph. Height is the longest path from a dependency sink:
/// `height(parent) = max over children (height(child) + 1)`, 0 for nodes
/// with no children. Iterative worklist, no recursion; a height exceeding
/// the node count means the subgraph has a cycle, which is reported rather
/// than looped on.
pub fn compute_heights(parents: &[Vec<usize>]) -> Result<Vec<u32>> {
    let n = parents.len();
    let mut heights = vec![0u32; n];
    let mut worklist: Vec<usize> = (0..n).collect();

    while let Some(node) = worklist.pop() {
        let candidate = heights[node] + 1;
        if candidate as usize > n {
            return Err(Error::invariant("cycle in flush dependency heights"));
        }
        for &parent in &parents[node] {
            if heights[parent] < candidate {
                heights[parent] = candidate;
                worklist.push(parent);
            }
        }
    }
    Ok(heights)
}
