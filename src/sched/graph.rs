//! Dependency graph over stories.
//!
//! Built once at startup from the manifest's `depends_on` lists and used for
//! topological validation. Cycles are a fatal configuration error; the error
//! message traces one concrete cycle path so the manifest author can see
//! exactly which stories to fix.

use anyhow::{bail, Result};
use std::collections::{HashMap, HashSet, VecDeque};

/// Index into the story list.
pub type StoryIndex = usize;

/// A directed acyclic graph of story dependencies.
#[derive(Debug)]
pub struct StoryGraph {
    ids: Vec<String>,
    index_map: HashMap<String, StoryIndex>,
    /// index -> stories that depend on it
    dependents: Vec<Vec<StoryIndex>>,
    /// index -> stories it depends on
    dependencies: Vec<Vec<StoryIndex>>,
}

impl StoryGraph {
    /// Build and validate a graph from `(story_id, depends_on)` pairs.
    ///
    /// Validates that every dependency references an existing story and that
    /// no cycle exists, enumerating the cycle path on failure.
    pub fn build(stories: &[(String, Vec<String>)]) -> Result<Self> {
        let mut index_map = HashMap::new();
        for (i, (id, _)) in stories.iter().enumerate() {
            if index_map.insert(id.clone(), i).is_some() {
                bail!("Duplicate story id: {id}");
            }
        }

        let mut dependents: Vec<Vec<StoryIndex>> = vec![Vec::new(); stories.len()];
        let mut dependencies: Vec<Vec<StoryIndex>> = vec![Vec::new(); stories.len()];

        for (to_idx, (id, deps)) in stories.iter().enumerate() {
            for dep in deps {
                let Some(&from_idx) = index_map.get(dep) else {
                    bail!("Story '{id}' depends on '{dep}' which does not exist");
                };
                dependents[from_idx].push(to_idx);
                dependencies[to_idx].push(from_idx);
            }
        }

        let graph = Self {
            ids: stories.iter().map(|(id, _)| id.clone()).collect(),
            index_map,
            dependents,
            dependencies,
        };
        graph.validate_no_cycles()?;
        Ok(graph)
    }

    pub fn len(&self) -> usize {
        self.ids.len()
    }

    pub fn is_empty(&self) -> bool {
        self.ids.is_empty()
    }

    pub fn dependents_of(&self, id: &str) -> Vec<&str> {
        self.index_map
            .get(id)
            .map(|&i| {
                self.dependents[i]
                    .iter()
                    .map(|&j| self.ids[j].as_str())
                    .collect()
            })
            .unwrap_or_default()
    }

    /// Validate acyclicity with Kahn's algorithm; on failure, trace one
    /// concrete cycle for the error message.
    fn validate_no_cycles(&self) -> Result<()> {
        let mut in_degree: Vec<usize> = self.dependencies.iter().map(Vec::len).collect();
        let mut queue: VecDeque<StoryIndex> = in_degree
            .iter()
            .enumerate()
            .filter(|&(_, deg)| *deg == 0)
            .map(|(i, _)| i)
            .collect();

        let mut visited = 0;
        while let Some(node) = queue.pop_front() {
            visited += 1;
            for &dependent in &self.dependents[node] {
                in_degree[dependent] -= 1;
                if in_degree[dependent] == 0 {
                    queue.push_back(dependent);
                }
            }
        }

        if visited == self.len() {
            return Ok(());
        }

        let members: Vec<StoryIndex> = in_degree
            .iter()
            .enumerate()
            .filter(|&(_, deg)| *deg > 0)
            .map(|(i, _)| i)
            .collect();
        let cycle = self.trace_cycle(&members);
        bail!("Circular dependency detected: {}", cycle.join(" -> "));
    }

    /// Walk dependency edges inside the cycle set until a node repeats.
    fn trace_cycle(&self, members: &[StoryIndex]) -> Vec<String> {
        let member_set: HashSet<StoryIndex> = members.iter().copied().collect();
        let Some(&start) = members.first() else {
            return Vec::new();
        };

        let mut visited: HashSet<StoryIndex> = HashSet::new();
        let mut path: Vec<StoryIndex> = vec![start];
        let mut current = start;

        loop {
            let next = self.dependencies[current]
                .iter()
                .copied()
                .find(|dep| member_set.contains(dep));
            let Some(next) = next else { break };

            if let Some(pos) = path.iter().position(|&n| n == next) {
                let mut cycle: Vec<String> =
                    path[pos..].iter().map(|&i| self.ids[i].clone()).collect();
                cycle.push(self.ids[next].clone());
                return cycle;
            }
            if !visited.insert(next) {
                break;
            }
            path.push(next);
            current = next;
        }

        // Fallback: report the members with the first repeated.
        let mut cycle: Vec<String> = members.iter().map(|&i| self.ids[i].clone()).collect();
        if let Some(first) = cycle.first().cloned() {
            cycle.push(first);
        }
        cycle
    }
}
