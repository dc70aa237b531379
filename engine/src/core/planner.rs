//! Dependency ordering for plan tasks.
//!
//! Edges run dependency -> dependent. Validation happens in a fixed order:
//! duplicate ids, undefined dependencies, cycles, and only then sorting, so a
//! malformed graph never yields a partial order.

use std::collections::{BTreeMap, BTreeSet, HashMap, HashSet};

use crate::core::types::Task;
use crate::error::PlannerError;

/// Return `tasks` in an order where every task follows all of its dependencies.
///
/// Independent tasks currently come out in lexicographic id order, but callers
/// must not rely on any particular tie-break.
pub fn topological_sort(tasks: &[Task]) -> Result<Vec<&Task>, PlannerError> {
    let mut by_id: BTreeMap<&str, &Task> = BTreeMap::new();
    for task in tasks {
        if by_id.insert(task.task_id.as_str(), task).is_some() {
            return Err(PlannerError::DuplicateTask(task.task_id.clone()));
        }
    }

    let mut dependents: BTreeMap<&str, Vec<&str>> =
        by_id.keys().map(|id| (*id, Vec::new())).collect();
    let mut indegree: BTreeMap<&str, usize> = BTreeMap::new();
    for task in tasks {
        let deps: BTreeSet<&str> = task.dependencies.iter().map(String::as_str).collect();
        for dep in &deps {
            if !by_id.contains_key(dep) {
                return Err(PlannerError::UndefinedDependency {
                    task_id: task.task_id.clone(),
                    dependency: (*dep).to_string(),
                });
            }
            if let Some(children) = dependents.get_mut(dep) {
                children.push(task.task_id.as_str());
            }
        }
        indegree.insert(task.task_id.as_str(), deps.len());
    }

    let members = cycle_members(&dependents);
    if !members.is_empty() {
        return Err(PlannerError::Cycle {
            tasks: members.into_iter().collect(),
        });
    }

    let mut ready: BTreeSet<&str> = indegree
        .iter()
        .filter(|(_, degree)| **degree == 0)
        .map(|(id, _)| *id)
        .collect();
    let mut order = Vec::with_capacity(tasks.len());
    while let Some(id) = ready.pop_first() {
        order.push(by_id[id]);
        for child in &dependents[id] {
            if let Some(degree) = indegree.get_mut(child) {
                *degree -= 1;
                if *degree == 0 {
                    ready.insert(*child);
                }
            }
        }
    }
    debug_assert_eq!(order.len(), tasks.len());
    Ok(order)
}

/// Every node that sits in a strongly connected component of size > 1, or has
/// an edge to itself.
fn cycle_members(edges: &BTreeMap<&str, Vec<&str>>) -> BTreeSet<String> {
    let mut tarjan = Tarjan {
        edges,
        next_index: 0,
        index: HashMap::new(),
        lowlink: HashMap::new(),
        stack: Vec::new(),
        on_stack: HashSet::new(),
        members: BTreeSet::new(),
    };
    for node in edges.keys() {
        if !tarjan.index.contains_key(node) {
            tarjan.visit(*node);
        }
    }
    tarjan.members
}

/// Tarjan's SCC walk. Depth is tracked on the heap so long dependency chains
/// cannot exhaust the thread stack.
struct Tarjan<'g, 'a> {
    edges: &'g BTreeMap<&'a str, Vec<&'a str>>,
    next_index: usize,
    index: HashMap<&'a str, usize>,
    lowlink: HashMap<&'a str, usize>,
    stack: Vec<&'a str>,
    on_stack: HashSet<&'a str>,
    members: BTreeSet<String>,
}

impl<'g, 'a> Tarjan<'g, 'a> {
    fn successors(&self, node: &str) -> &'g [&'a str] {
        let edges = self.edges;
        edges.get(node).map(Vec::as_slice).unwrap_or_default()
    }

    fn open(&mut self, node: &'a str) {
        self.index.insert(node, self.next_index);
        self.lowlink.insert(node, self.next_index);
        self.next_index += 1;
        self.stack.push(node);
        self.on_stack.insert(node);
    }

    fn lower(&mut self, node: &'a str, candidate: usize) {
        if candidate < self.lowlink[node] {
            self.lowlink.insert(node, candidate);
        }
    }

    fn visit(&mut self, root: &'a str) {
        // (node, next successor to look at)
        let mut frames: Vec<(&'a str, usize)> = vec![(root, 0)];
        self.open(root);

        while let Some(&(node, cursor)) = frames.last() {
            if let Some(&next) = self.successors(node).get(cursor) {
                if let Some(frame) = frames.last_mut() {
                    frame.1 += 1;
                }
                if !self.index.contains_key(next) {
                    self.open(next);
                    frames.push((next, 0));
                } else if self.on_stack.contains(next) {
                    self.lower(node, self.index[next]);
                }
                continue;
            }

            frames.pop();
            if let Some(&(parent, _)) = frames.last() {
                self.lower(parent, self.lowlink[node]);
            }
            if self.lowlink[node] == self.index[node] {
                self.close_component(node);
            }
        }
    }

    fn close_component(&mut self, root: &'a str) {
        let mut component = Vec::new();
        while let Some(top) = self.stack.pop() {
            self.on_stack.remove(top);
            component.push(top);
            if top == root {
                break;
            }
        }
        let self_loop = self.successors(root).contains(&root);
        if component.len() > 1 || self_loop {
            self.members
                .extend(component.into_iter().map(str::to_string));
        }
    }
}
