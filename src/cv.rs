//! Leave-one-subject-out fold assignment.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Fold {
    pub held_out: String,
    pub train: Vec<usize>,
    pub test: Vec<usize>,
}

/// One fold per distinct subject, ordered by subject id. `subjects[i]` is the
/// subject of sample `i`; fold indices refer to sample positions.
pub fn leave_one_subject_out<S: AsRef<str>>(subjects: &[S]) -> Vec<Fold> {
    let names: Vec<&str> = subjects.iter().map(AsRef::as_ref).collect();
    let mut groups: BTreeMap<&str, Vec<usize>> = BTreeMap::new();
    for (idx, subject) in names.iter().enumerate() {
        groups.entry(*subject).or_default().push(idx);
    }

    groups
        .iter()
        .map(|(held_out, test)| {
            let train = names
                .iter()
                .enumerate()
                .filter(|(_, subject)| *subject != held_out)
                .map(|(idx, _)| idx)
                .collect();
            Fold {
                held_out: (*held_out).to_string(),
                train,
                test: test.clone(),
            }
        })
        .collect()
}
