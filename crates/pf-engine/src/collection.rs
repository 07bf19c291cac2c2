// Append-only store of completed phase results

use std::collections::HashMap;
use std::sync::Arc;

use pf_types::{FitResult, PfResult, ResultsError};

/// Completed phase results in completion order, indexed by phase name.
///
/// Results are shared behind `Arc` so link hooks and worker tasks can hold
/// a snapshot without copying models around. Entries are never removed or
/// replaced.
#[derive(Debug, Clone, Default)]
pub struct ResultsCollection {
    entries: Vec<(String, Arc<FitResult>)>,
    index: HashMap<String, usize>,
}

impl ResultsCollection {
    pub fn new() -> Self {
        Self::default()
    }

    /// Store `result` under `name`.
    pub fn append(&mut self, name: impl Into<String>, result: FitResult) -> PfResult<()> {
        let name = name.into();
        if self.index.contains_key(&name) {
            return Err(ResultsError::DuplicateName { name }.into());
        }
        self.index.insert(name.clone(), self.entries.len());
        self.entries.push((name, Arc::new(result)));
        Ok(())
    }

    /// Result of the phase called `name`.
    pub fn from_phase(&self, name: &str) -> PfResult<&FitResult> {
        self.index
            .get(name)
            .map(|&i| self.entries[i].1.as_ref())
            .ok_or_else(|| {
                ResultsError::NotFound {
                    name: name.to_string(),
                }
                .into()
            })
    }

    /// Most recently appended result and its phase name.
    pub fn last(&self) -> PfResult<(&str, &FitResult)> {
        self.entries
            .last()
            .map(|(name, result)| (name.as_str(), result.as_ref()))
            .ok_or_else(|| ResultsError::Empty.into())
    }

    pub fn contains(&self, name: &str) -> bool {
        self.index.contains_key(name)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn names(&self) -> Vec<&str> {
        self.entries.iter().map(|(name, _)| name.as_str()).collect()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &FitResult)> {
        self.entries
            .iter()
            .map(|(name, result)| (name.as_str(), result.as_ref()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pf_types::{ErrorKind, Model, Prior};

    fn result(evidence: f64) -> FitResult {
        let variable = Model::builder()
            .component("lens", "sie")
            .param("einstein_radius", Prior::gaussian(1.0, 0.1))
            .build()
            .unwrap();
        FitResult::new(variable.fixed_at(|_, p| p.centre()), variable, evidence)
    }

    #[test]
    fn test_lookup_before_and_after_append() {
        let mut results = ResultsCollection::new();
        let err = results.from_phase("phase_1").unwrap_err();
        assert_eq!(err.kind(), ErrorKind::NotFound);

        results.append("phase_1", result(-3.0)).unwrap();
        assert_eq!(results.from_phase("phase_1").unwrap().evidence, -3.0);
        assert!(results.contains("phase_1"));
    }

    #[test]
    fn test_duplicate_names_rejected() {
        let mut results = ResultsCollection::new();
        results.append("phase_1", result(-3.0)).unwrap();
        let err = results.append("phase_1", result(-1.0)).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::DuplicateName);
        // The first entry is untouched.
        assert_eq!(results.from_phase("phase_1").unwrap().evidence, -3.0);
        assert_eq!(results.len(), 1);
    }

    #[test]
    fn test_last_and_order() {
        let mut results = ResultsCollection::new();
        assert_eq!(results.last().unwrap_err().kind(), ErrorKind::Empty);

        results.append("phase_1", result(-3.0)).unwrap();
        results.append("phase_2", result(-2.0)).unwrap();
        let (name, last) = results.last().unwrap();
        assert_eq!(name, "phase_2");
        assert_eq!(last.evidence, -2.0);
        assert_eq!(results.names(), vec!["phase_1", "phase_2"]);
        assert_eq!(results.iter().count(), 2);
    }

    #[test]
    fn test_clones_are_snapshots() {
        let mut results = ResultsCollection::new();
        results.append("phase_1", result(-3.0)).unwrap();
        let snapshot = results.clone();
        results.append("phase_2", result(-2.0)).unwrap();
        assert_eq!(snapshot.len(), 1);
        assert!(!snapshot.is_empty());
        assert_eq!(results.len(), 2);
    }
}
