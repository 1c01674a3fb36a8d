use std::collections::{HashMap, HashSet};

/// Generates globally unique tensor/node names. Counters are monotonic per
/// base name, so a rebuilt graph with identical inputs yields identical names
/// on every rank.
#[derive(Debug, Default, Clone)]
pub struct NameGenerator {
    taken: HashSet<String>,
    counters: HashMap<String, usize>,
}

impl NameGenerator {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record a name that already exists in the graph.
    pub fn reserve(&mut self, name: &str) {
        self.taken.insert(name.to_string());
    }

    /// Return `base` if free, otherwise `base_<n>` for the smallest unused n.
    pub fn unique(&mut self, base: &str) -> String {
        if self.taken.insert(base.to_string()) {
            return base.to_string();
        }
        loop {
            let counter = self.counters.entry(base.to_string()).or_insert(0);
            let candidate = format!("{}_{}", base, counter);
            *counter += 1;
            if self.taken.insert(candidate.clone()) {
                return candidate;
            }
        }
    }

    /// Gradient tensor name for a forward tensor.
    pub fn grad_name(&mut self, tensor: &str) -> String {
        self.unique(&format!("{}_grad", tensor))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn collisions_get_monotonic_suffixes() {
        let mut names = NameGenerator::new();
        assert_eq!(names.unique("W_grad"), "W_grad");
        assert_eq!(names.unique("W_grad"), "W_grad_0");
        assert_eq!(names.unique("W_grad"), "W_grad_1");
    }

    #[test]
    fn reserved_names_are_avoided() {
        let mut names = NameGenerator::new();
        names.reserve("loss");
        assert_eq!(names.unique("loss"), "loss_0");
    }
}
