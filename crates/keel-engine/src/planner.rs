//! Resource graph planner - dependency-ordered plan from a declarative step set.
//!
//! Kahn's algorithm with a lexicographic ready set, so the same step set
//! always plans to the same order. Pure: no I/O.

use keel_core::{Error, Result, Step, StepId, StepSpec};
use std::collections::{BTreeMap, BTreeSet, HashMap};

/// An ordered, validated sequence of steps for one run.
#[derive(Clone, Debug)]
pub struct Plan {
    steps: Vec<Step>,
    index: HashMap<StepId, usize>,
}

impl Plan {
    pub fn build(specs: &BTreeMap<String, StepSpec>) -> Result<Self> {
        // Every dependency must resolve before ordering is attempted.
        for (id, spec) in specs {
            if let Some(dep) = spec.depends_on.iter().find(|d| !specs.contains_key(d.as_str())) {
                return Err(Error::UnknownDependency {
                    step: id.clone(),
                    dependency: dep.clone(),
                });
            }
        }

        let deps: BTreeMap<&str, BTreeSet<&str>> = specs
            .iter()
            .map(|(id, spec)| {
                (id.as_str(), spec.depends_on.iter().map(String::as_str).collect())
            })
            .collect();

        let mut dependents: BTreeMap<&str, Vec<&str>> = BTreeMap::new();
        let mut in_degree: BTreeMap<&str, usize> = BTreeMap::new();
        for (&id, ds) in &deps {
            in_degree.insert(id, ds.len());
            for &d in ds {
                dependents.entry(d).or_default().push(id);
            }
        }

        let mut ready: BTreeSet<&str> = in_degree
            .iter()
            .filter(|(_, &n)| n == 0)
            .map(|(&id, _)| id)
            .collect();
        let mut order: Vec<&str> = Vec::with_capacity(specs.len());

        while let Some(id) = ready.pop_first() {
            order.push(id);
            for &next in dependents.get(id).map(Vec::as_slice).unwrap_or_default() {
                if let Some(n) = in_degree.get_mut(next) {
                    *n -= 1;
                    if *n == 0 {
                        ready.insert(next);
                    }
                }
            }
        }

        if order.len() < specs.len() {
            let emitted: BTreeSet<&str> = order.iter().copied().collect();
            let remaining: BTreeSet<&str> =
                deps.keys().copied().filter(|id| !emitted.contains(id)).collect();
            let ids = cycle_members(&deps, &remaining);
            tracing::debug!(?ids, "plan rejected: dependency cycle");
            return Err(Error::CycleDetected { ids });
        }

        let steps: Vec<Step> = order
            .iter()
            .map(|id| Step::from_spec(id, &specs[*id]))
            .collect();
        let index = steps
            .iter()
            .enumerate()
            .map(|(i, s)| (s.id.clone(), i))
            .collect();
        tracing::debug!(order = ?order, "plan built");
        Ok(Self { steps, index })
    }

    pub fn steps(&self) -> &[Step] {
        &self.steps
    }

    pub fn get(&self, id: &str) -> Option<&Step> {
        self.index.get(&StepId::from(id)).map(|&i| &self.steps[i])
    }

    pub fn position(&self, id: &str) -> Option<usize> {
        self.index.get(&StepId::from(id)).copied()
    }

    pub fn order(&self) -> Vec<&str> {
        self.steps.iter().map(|s| s.id.as_str()).collect()
    }

    pub fn reversed(&self) -> impl Iterator<Item = &Step> {
        self.steps.iter().rev()
    }

    pub fn len(&self) -> usize {
        self.steps.len()
    }

    pub fn is_empty(&self) -> bool {
        self.steps.is_empty()
    }
}

/// Ids that lie on a cycle: members of a strongly connected component of
/// size > 1, or steps depending on themselves. Nodes merely downstream of a
/// cycle are left out.
fn cycle_members<'a>(
    deps: &BTreeMap<&'a str, BTreeSet<&'a str>>,
    remaining: &BTreeSet<&'a str>,
) -> Vec<String> {
    struct Tarjan<'a, 'g> {
        deps: &'g BTreeMap<&'a str, BTreeSet<&'a str>>,
        remaining: &'g BTreeSet<&'a str>,
        index: HashMap<&'a str, usize>,
        low: HashMap<&'a str, usize>,
        stack: Vec<&'a str>,
        on_stack: BTreeSet<&'a str>,
        next: usize,
        members: BTreeSet<&'a str>,
    }

    impl<'a, 'g> Tarjan<'a, 'g> {
        fn visit(&mut self, v: &'a str) {
            self.index.insert(v, self.next);
            self.low.insert(v, self.next);
            self.next += 1;
            self.stack.push(v);
            self.on_stack.insert(v);

            let edges: Vec<&'a str> = self.deps[v]
                .iter()
                .copied()
                .filter(|w| self.remaining.contains(w))
                .collect();
            for w in edges {
                if !self.index.contains_key(w) {
                    self.visit(w);
                    let lw = self.low[w];
                    if let Some(lv) = self.low.get_mut(v) {
                        *lv = (*lv).min(lw);
                    }
                } else if self.on_stack.contains(w) {
                    let iw = self.index[w];
                    if let Some(lv) = self.low.get_mut(v) {
                        *lv = (*lv).min(iw);
                    }
                }
            }

            if self.low[v] == self.index[v] {
                let mut component = Vec::new();
                while let Some(w) = self.stack.pop() {
                    self.on_stack.remove(w);
                    component.push(w);
                    if w == v {
                        break;
                    }
                }
                let self_loop = self.deps[v].contains(v);
                if component.len() > 1 || self_loop {
                    self.members.extend(component);
                }
            }
        }
    }

    let mut t = Tarjan {
        deps,
        remaining,
        index: HashMap::new(),
        low: HashMap::new(),
        stack: Vec::new(),
        on_stack: BTreeSet::new(),
        next: 0,
        members: BTreeSet::new(),
    };
    for &v in remaining {
        if !t.index.contains_key(v) {
            t.visit(v);
        }
    }
    t.members.into_iter().map(String::from).collect()
}
