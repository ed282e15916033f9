use std::collections::BTreeMap;
use std::fmt;

use serde::Serialize;
use serde_json::Value;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ProblemKind {
    FreeText,
    Cloze,
    Programming,
    MultipleChoice,
}

const KINDS: [(u32, ProblemKind); 4] = [
    (1, ProblemKind::FreeText),
    (2, ProblemKind::Cloze),
    (3, ProblemKind::Programming),
    (4, ProblemKind::MultipleChoice),
];

impl ProblemKind {
    pub fn from_type_id(type_id: u32) -> Option<Self> {
        KINDS
            .iter()
            .find(|(id, _)| *id == type_id)
            .map(|(_, kind)| *kind)
    }

    pub fn type_id(&self) -> u32 {
        KINDS
            .iter()
            .find(|(_, kind)| kind == self)
            .map(|(id, _)| *id)
            .unwrap_or_default()
    }

    pub fn label(&self) -> &'static str {
        match self {
            Self::FreeText => "free text",
            Self::Cloze => "cloze",
            Self::Programming => "programming",
            Self::MultipleChoice => "multiple choice",
        }
    }
}

impl fmt::Display for ProblemKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.label())
    }
}

/// Problem counts by kind found in a generated payload.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct PayloadSummary {
    pub by_kind: BTreeMap<ProblemKind, usize>,
    /// Entries with a missing or unrecognised `problemType`.
    pub unknown: usize,
}

impl PayloadSummary {
    pub fn total(&self) -> usize {
        self.by_kind.values().sum::<usize>() + self.unknown
    }
}

impl fmt::Display for PayloadSummary {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut parts: Vec<String> = self
            .by_kind
            .iter()
            .map(|(kind, count)| format!("{} {}", count, kind))
            .collect();
        if self.unknown > 0 {
            parts.push(format!("{} unknown", self.unknown));
        }
        if parts.is_empty() {
            f.write_str("no problems")
        } else {
            f.write_str(&parts.join(", "))
        }
    }
}

/// Count problems in `payload.problems`. Returns `None` when the payload
/// has no problem list.
pub fn summarize_payload(payload: &Value) -> Option<PayloadSummary> {
    let problems = payload.get("problems")?.as_array()?;
    let mut summary = PayloadSummary::default();
    for problem in problems {
        let kind = problem
            .get("problemType")
            .and_then(Value::as_u64)
            .and_then(|id| u32::try_from(id).ok())
            .and_then(ProblemKind::from_type_id);
        match kind {
            Some(kind) => *summary.by_kind.entry(kind).or_default() += 1,
            None => summary.unknown += 1,
        }
    }
    Some(summary)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_lookup_table() {
        assert_eq!(ProblemKind::from_type_id(1), Some(ProblemKind::FreeText));
        assert_eq!(ProblemKind::from_type_id(4), Some(ProblemKind::MultipleChoice));
        assert_eq!(ProblemKind::from_type_id(0), None);
        assert_eq!(ProblemKind::from_type_id(99), None);
        for (id, kind) in KINDS {
            assert_eq!(kind.type_id(), id);
        }
    }

    #[test]
    fn test_summarize_payload() {
        let payload = json!({
            "problems": [
                { "problemType": 1, "body": "Explain TCP slow start." },
                { "problemType": 4, "choices": ["a", "b"] },
                { "problemType": 4, "choices": ["c", "d"] },
                { "problemType": 42 },
                { "body": "no type" }
            ]
        });
        let summary = summarize_payload(&payload).unwrap();
        assert_eq!(summary.by_kind.get(&ProblemKind::FreeText), Some(&1));
        assert_eq!(summary.by_kind.get(&ProblemKind::MultipleChoice), Some(&2));
        assert_eq!(summary.unknown, 2);
        assert_eq!(summary.total(), 5);
        assert_eq!(summary.to_string(), "1 free text, 2 multiple choice, 2 unknown");
    }

    #[test]
    fn test_payload_without_problems() {
        assert_eq!(summarize_payload(&json!({ "structure": {} })), None);
        assert_eq!(summarize_payload(&json!(null)), None);
        assert_eq!(
            summarize_payload(&json!({ "problems": [] })).unwrap().to_string(),
            "no problems"
        );
    }
}
