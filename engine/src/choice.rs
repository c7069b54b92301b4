//! Content integrity guard for generated choice sets.
//!
//! A story segment carries a `choices` field produced by a generation
//! backend. Generated output is not trusted: it may arrive with the wrong
//! number of entries, as bare single words, or as filler such as "follow the
//! path". The guard validates a candidate set against a contract and decides
//! whether it may replace the cached one.
//!
//! The merge is atomic per field. The resulting value is always either the
//! incoming set (when it satisfies the contract) or the existing value,
//! untouched. An invalid array is never written, whatever its length.
//!
//! Heuristics are pluggable: [`ChoiceRule`] checks one entry and
//! [`EntityExtractor`] pulls names out of the story text so that a generic
//! term is allowed when the story actually uses it as a name.

use crate::record::Provenance;
use crate::RecordId;
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::sync::LazyLock;

/// Number of entries a choice set must have.
pub const CHOICE_COUNT: usize = 3;

/// Terms that read as filler unless the story names them.
pub const FORBIDDEN_TERMS: [&str; 4] = ["path", "way", "clue", "guide"];

static CHARACTER_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\b[A-Z][a-z]{2,}\b").expect("character pattern is valid"));

static OBJECT_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?i)\b(?:the|a|an)\s+").expect("object pattern is valid"));

static LOCATION_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(
        r"(?i)\b(?:in|at|by|into|inside|near|toward|towards|through|across|along|under|beyond|behind|to|from)\s+(?:the\s+|a\s+|an\s+)?",
    )
    .expect("location pattern is valid")
});

/// Longest noun phrase taken after an article or place preposition.
const PHRASE_WORDS: usize = 3;

/// Function words that end a noun phrase.
const PHRASE_STOPS: &[&str] = &[
    "the", "a", "an", "and", "or", "but", "of", "in", "at", "by", "into", "to", "from", "with",
    "on", "for", "while", "as", "near", "under", "is", "was", "were", "are", "that", "which",
];

static GENERIC_PHRASE_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(
        r"(?i)\b(?:follow|find|take|choose|seek|search\s+for|look\s+for|trust|use)\s+(?:the\s+|a\s+|an\s+|this\s+|that\s+)?(?:[a-z]+\s+)?(?:path|way|clue|guide)s?\b",
    )
    .expect("generic phrase pattern is valid")
});

static FORBIDDEN_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)\b(path|way|clue|guide)s?\b").expect("forbidden term pattern is valid")
});

/// Capitalized words that start sentences rather than name characters.
const NON_NAMES: &[&str] = &[
    "the", "and", "but", "then", "when", "where", "what", "who", "why", "how", "this", "that",
    "these", "those", "there", "here", "his", "her", "hers", "their", "they", "she", "you",
    "your", "our", "its", "with", "from", "into", "for", "after", "before", "suddenly",
    "finally", "still", "now", "once", "while", "as", "not", "all", "some", "every",
];

/// Names pulled out of a story's text.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StoryEntities {
    pub characters: BTreeSet<String>,
    pub objects: BTreeSet<String>,
    pub locations: BTreeSet<String>,
}

impl StoryEntities {
    /// Whether `term` (case-insensitive, singular or plural) names anything.
    pub fn names(&self, term: &str) -> bool {
        let term = term.to_lowercase();
        let plural = format!("{term}s");
        [&self.characters, &self.objects, &self.locations]
            .iter()
            .any(|set| set.contains(&term) || set.contains(&plural))
    }
}

/// Extracts entity names from story text.
pub trait EntityExtractor: Send + Sync {
    fn extract(&self, story_text: &str) -> StoryEntities;
}

/// Regex heuristics: capitalized words are character candidates, the
/// phrase after "the/a/an" gives object candidates, and the phrase after a
/// place preposition gives location candidates.
#[derive(Debug, Clone, Copy, Default)]
pub struct HeuristicExtractor;

impl EntityExtractor for HeuristicExtractor {
    fn extract(&self, story_text: &str) -> StoryEntities {
        let characters = CHARACTER_RE
            .find_iter(story_text)
            .map(|m| m.as_str().to_lowercase())
            .filter(|word| !NON_NAMES.contains(&word.as_str()))
            .collect();

        let phrases = |re: &Regex| -> BTreeSet<String> {
            re.find_iter(story_text)
                .flat_map(|m| noun_phrase(&story_text[m.end()..]))
                .collect()
        };

        StoryEntities {
            characters,
            objects: phrases(&OBJECT_RE),
            locations: phrases(&LOCATION_RE),
        }
    }
}

/// Lowercased words opening `text`, up to punctuation or a function word.
///
/// Every word of "the old stone mill" is kept, so the head noun counts
/// even when adjectives precede it.
fn noun_phrase(text: &str) -> Vec<String> {
    let mut words = Vec::new();
    for token in text.split_whitespace().take(PHRASE_WORDS) {
        let word = token.trim_end_matches(|c: char| !c.is_alphanumeric());
        let lower = word.to_lowercase();
        let is_word = !lower.is_empty()
            && lower
                .chars()
                .all(|c| c.is_ascii_alphabetic() || c == '\'' || c == '-');
        if !is_word || PHRASE_STOPS.contains(&lower.as_str()) {
            break;
        }
        words.push(lower);
        if word.len() != token.len() {
            break;
        }
    }
    words
}

/// A check applied to every entry of a choice set.
pub trait ChoiceRule: Send + Sync {
    /// Stable rule name used in reports.
    fn name(&self) -> &'static str;

    /// Return a message when `choice` breaks the rule.
    fn check(&self, choice: &str, entities: &StoryEntities) -> Option<String>;
}

/// Rejects empty entries and bare single words.
#[derive(Debug, Clone, Copy, Default)]
pub struct NotSingleWord;

impl ChoiceRule for NotSingleWord {
    fn name(&self) -> &'static str {
        "not_single_word"
    }

    fn check(&self, choice: &str, _entities: &StoryEntities) -> Option<String> {
        match choice.split_whitespace().count() {
            0 => Some("choice is empty".to_string()),
            1 => Some(format!("'{}' is a single word", choice.trim())),
            _ => None,
        }
    }
}

/// Rejects generic verb phrases such as "follow the path".
#[derive(Debug, Clone, Copy, Default)]
pub struct NoGenericVerbPhrase;

impl ChoiceRule for NoGenericVerbPhrase {
    fn name(&self) -> &'static str {
        "no_generic_verb_phrase"
    }

    fn check(&self, choice: &str, _entities: &StoryEntities) -> Option<String> {
        GENERIC_PHRASE_RE
            .find(choice)
            .map(|m| format!("'{}' is a generic phrase", m.as_str()))
    }
}

/// Rejects forbidden generic terms unless the story names them.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoForbiddenTerm;

impl ChoiceRule for NoForbiddenTerm {
    fn name(&self) -> &'static str {
        "no_forbidden_term"
    }

    fn check(&self, choice: &str, entities: &StoryEntities) -> Option<String> {
        FORBIDDEN_RE
            .captures_iter(choice)
            .filter_map(|c| c.get(1))
            .map(|m| m.as_str().to_lowercase())
            .find(|term| !entities.names(term))
            .map(|term| format!("'{term}' is not named in the story"))
    }
}

/// One broken rule.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Violation {
    /// Rule that failed
    pub rule: String,
    /// Entry index, `None` for whole-set problems
    #[serde(skip_serializing_if = "Option::is_none")]
    pub index: Option<usize>,
    pub message: String,
}

/// Outcome of validating a candidate set.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ContractReport {
    pub valid: bool,
    pub violations: Vec<Violation>,
}

impl ContractReport {
    fn from_violations(violations: Vec<Violation>) -> Self {
        Self {
            valid: violations.is_empty(),
            violations,
        }
    }

    fn shape(message: impl Into<String>) -> Self {
        Self::from_violations(vec![Violation {
            rule: "shape".into(),
            index: None,
            message: message.into(),
        }])
    }

    /// One-line summary of the violations.
    pub fn summary(&self) -> String {
        if self.valid {
            return "valid".to_string();
        }
        self.violations
            .iter()
            .map(|v| match v.index {
                Some(i) => format!("[{i}] {}", v.message),
                None => v.message.clone(),
            })
            .collect::<Vec<_>>()
            .join("; ")
    }
}

/// Validated view of a segment's `choices` field.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChoiceSet {
    pub segment_id: RecordId,
    pub choices: Vec<String>,
    pub provenance: Provenance,
    pub valid: bool,
}

/// How a choice merge was decided.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum MergeDecision {
    /// The incoming set is valid and replaces the existing one
    AcceptedIncoming,
    /// The incoming set is invalid; the valid existing set is kept
    KeptExisting,
    /// Both are invalid; the existing value is kept to avoid churn
    KeptExistingBothInvalid,
}

impl MergeDecision {
    /// Whether the incoming value was turned away.
    pub fn rejected(&self) -> bool {
        !matches!(self, MergeDecision::AcceptedIncoming)
    }
}

/// Result of merging an incoming choice value over an existing one.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChoiceMerge {
    pub decision: MergeDecision,
    /// Field value after the merge, `None` when the field stays absent
    pub value: Option<serde_json::Value>,
    /// The resulting validated view
    pub choice_set: ChoiceSet,
    pub incoming: ContractReport,
    pub existing: ContractReport,
    pub reason: String,
}

/// The choice set contract: entry count plus per-entry rules.
pub struct ChoiceContract {
    expected_count: usize,
    rules: Vec<Box<dyn ChoiceRule>>,
    extractor: Box<dyn EntityExtractor>,
}

impl Default for ChoiceContract {
    fn default() -> Self {
        Self::new(
            vec![
                Box::new(NotSingleWord),
                Box::new(NoGenericVerbPhrase),
                Box::new(NoForbiddenTerm),
            ],
            Box::new(HeuristicExtractor),
        )
    }
}

impl std::fmt::Debug for ChoiceContract {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ChoiceContract")
            .field("expected_count", &self.expected_count)
            .field(
                "rules",
                &self.rules.iter().map(|r| r.name()).collect::<Vec<_>>(),
            )
            .finish()
    }
}

impl ChoiceContract {
    /// Build a contract from rules and an extractor.
    pub fn new(rules: Vec<Box<dyn ChoiceRule>>, extractor: Box<dyn EntityExtractor>) -> Self {
        Self {
            expected_count: CHOICE_COUNT,
            rules,
            extractor,
        }
    }

    /// Add a rule.
    pub fn with_rule(mut self, rule: Box<dyn ChoiceRule>) -> Self {
        self.rules.push(rule);
        self
    }

    /// Validate a raw field value against the contract.
    ///
    /// Anything but an array of exactly three strings fails on shape.
    pub fn validate(&self, story_text: &str, value: Option<&serde_json::Value>) -> ContractReport {
        let Some(value) = value else {
            return ContractReport::shape("choices are missing");
        };
        match as_choices(value) {
            Some(choices) => self.validate_choices(story_text, &choices),
            None => ContractReport::shape(format!(
                "choices must be an array of strings, got {}",
                type_name(value)
            )),
        }
    }

    /// Validate already-parsed entries against the contract.
    pub fn validate_choices(&self, story_text: &str, choices: &[String]) -> ContractReport {
        if choices.len() != self.expected_count {
            return ContractReport::from_violations(vec![Violation {
                rule: "count".into(),
                index: None,
                message: format!(
                    "expected {} choices, got {}",
                    self.expected_count,
                    choices.len()
                ),
            }]);
        }

        let entities = self.extractor.extract(story_text);
        let violations = choices
            .iter()
            .enumerate()
            .flat_map(|(index, choice)| {
                let entities = &entities;
                self.rules.iter().filter_map(move |rule| {
                    rule.check(choice, entities).map(|message| Violation {
                        rule: rule.name().to_string(),
                        index: Some(index),
                        message,
                    })
                })
            })
            .collect();

        ContractReport::from_violations(violations)
    }

    /// Decide whether `incoming` may replace `existing` for a segment.
    pub fn merge(
        &self,
        segment_id: &str,
        story_text: &str,
        existing: Option<&serde_json::Value>,
        existing_provenance: Provenance,
        incoming: &serde_json::Value,
    ) -> ChoiceMerge {
        let incoming_report = self.validate(story_text, Some(incoming));
        let existing_report = self.validate(story_text, existing);

        let (decision, value, provenance, valid, reason) = if incoming_report.valid {
            (
                MergeDecision::AcceptedIncoming,
                Some(incoming.clone()),
                Provenance::Remote,
                true,
                "incoming choices satisfy the contract".to_string(),
            )
        } else if existing_report.valid {
            (
                MergeDecision::KeptExisting,
                existing.cloned(),
                existing_provenance,
                true,
                format!("incoming rejected: {}", incoming_report.summary()),
            )
        } else {
            (
                MergeDecision::KeptExistingBothInvalid,
                existing.cloned(),
                existing_provenance,
                false,
                format!(
                    "incoming rejected: {}; existing also invalid: {}",
                    incoming_report.summary(),
                    existing_report.summary()
                ),
            )
        };

        let choices = value.as_ref().and_then(as_choices).unwrap_or_default();

        ChoiceMerge {
            decision,
            value,
            choice_set: ChoiceSet {
                segment_id: segment_id.to_string(),
                choices,
                provenance,
                valid,
            },
            incoming: incoming_report,
            existing: existing_report,
            reason,
        }
    }
}

static DEFAULT_CONTRACT: LazyLock<ChoiceContract> = LazyLock::new(ChoiceContract::default);

/// Validate a choice field with the default contract.
pub fn validate_choice_set_contract(story_text: &str, choices: &serde_json::Value) -> bool {
    DEFAULT_CONTRACT.validate(story_text, Some(choices)).valid
}

/// Merge an incoming choice field with the default contract.
pub fn merge_choices(
    segment_id: &str,
    story_text: &str,
    existing: Option<&serde_json::Value>,
    existing_provenance: Provenance,
    incoming: &serde_json::Value,
) -> ChoiceMerge {
    DEFAULT_CONTRACT.merge(segment_id, story_text, existing, existing_provenance, incoming)
}

/// Default contract shared by callers that do not customize rules.
pub fn default_contract() -> &'static ChoiceContract {
    &DEFAULT_CONTRACT
}

fn as_choices(value: &serde_json::Value) -> Option<Vec<String>> {
    value
        .as_array()?
        .iter()
        .map(|v| v.as_str().map(str::to_string))
        .collect()
}

fn type_name(value: &serde_json::Value) -> &'static str {
    match value {
        serde_json::Value::Null => "null",
        serde_json::Value::Bool(_) => "bool",
        serde_json::Value::Number(_) => "number",
        serde_json::Value::String(_) => "string",
        serde_json::Value::Array(_) => "array with non-string entries",
        serde_json::Value::Object(_) => "object",
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    const STORY: &str = "Mara stood at the gate of the old mill. A lantern flickered \
                         in the window while the Guide waited by the river.";

    fn valid_choices() -> serde_json::Value {
        json!(["Open the door", "Call for help", "Wait quietly"])
    }

    #[test]
    fn extractor_finds_candidates() {
        let entities = HeuristicExtractor.extract(STORY);

        assert!(entities.characters.contains("mara"));
        assert!(entities.characters.contains("guide"));
        assert!(!entities.characters.contains("the"));
        assert!(entities.objects.contains("gate"));
        assert!(entities.objects.contains("lantern"));
        assert!(entities.locations.contains("window"));
        assert!(entities.locations.contains("river"));
    }

    #[test]
    fn adjective_led_objects_keep_their_head_noun() {
        let story = "She crossed the old stone path, then waited at the narrow way.";
        let entities = HeuristicExtractor.extract(story);

        assert!(entities.objects.contains("path"));
        assert!(entities.objects.contains("stone"));
        assert!(entities.locations.contains("way"));
        assert!(!entities.objects.contains("then"));

        assert!(validate_choice_set_contract(
            story,
            &json!(["Cross the path again", "Wade into the river", "Call out for help"]),
        ));
    }

    #[test]
    fn valid_set_passes() {
        assert!(validate_choice_set_contract(STORY, &valid_choices()));
    }

    #[test]
    fn wrong_count_fails() {
        let report =
            default_contract().validate(STORY, Some(&json!(["Open the door", "Call for help"])));
        assert!(!report.valid);
        assert_eq!(report.violations[0].rule, "count");
        assert!(!validate_choice_set_contract(STORY, &json!([])));
    }

    #[test]
    fn wrong_shape_fails() {
        assert!(!validate_choice_set_contract(STORY, &json!("go")));
        assert!(!validate_choice_set_contract(STORY, &json!(null)));
        assert!(!validate_choice_set_contract(
            STORY,
            &json!(["Open the door", 2, "Wait quietly"])
        ));
        let report = default_contract().validate(STORY, None);
        assert_eq!(report.violations[0].rule, "shape");
    }

    #[test]
    fn single_word_fails() {
        let report = default_contract().validate(
            STORY,
            Some(&json!(["Run", "Call for help", "Wait quietly"])),
        );
        assert!(!report.valid);
        assert_eq!(report.violations[0].rule, "not_single_word");
        assert_eq!(report.violations[0].index, Some(0));
    }

    #[test]
    fn generic_phrase_fails_even_when_named() {
        // "guide" is a character in the story, the phrase is still filler
        let report = default_contract().validate(
            STORY,
            Some(&json!(["Follow the guide", "Call for help", "Wait quietly"])),
        );
        assert!(!report.valid);
        assert!(report
            .violations
            .iter()
            .any(|v| v.rule == "no_generic_verb_phrase"));
    }

    #[test]
    fn forbidden_term_allowed_only_when_named() {
        let named = json!(["Ask the Guide about Mara", "Call for help", "Wait quietly"]);
        assert!(validate_choice_set_contract(STORY, &named));

        let unnamed = json!(["Look for another way out", "Call for help", "Wait quietly"]);
        let report = default_contract().validate(STORY, Some(&unnamed));
        assert!(!report.valid);
        assert!(report
            .violations
            .iter()
            .any(|v| v.rule == "no_forbidden_term"));
    }

    #[test]
    fn plural_terms_are_caught() {
        let choices = json!(["Search the clues carefully", "Call for help", "Wait quietly"]);
        assert!(!validate_choice_set_contract(STORY, &choices));
    }

    #[test]
    fn merge_accepts_valid_incoming() {
        let existing = json!(["Run to the mill", "Hide in the reeds", "Shout for Mara"]);
        let merge = default_contract().merge(
            "seg-1",
            STORY,
            Some(&existing),
            Provenance::Local,
            &valid_choices(),
        );

        assert_eq!(merge.decision, MergeDecision::AcceptedIncoming);
        assert_eq!(merge.value, Some(valid_choices()));
        assert_eq!(merge.choice_set.provenance, Provenance::Remote);
        assert!(merge.choice_set.valid);
    }

    #[test]
    fn merge_keeps_valid_existing() {
        let merge = default_contract().merge(
            "seg-1",
            STORY,
            Some(&valid_choices()),
            Provenance::Local,
            &json!(["go"]),
        );

        assert_eq!(merge.decision, MergeDecision::KeptExisting);
        assert!(merge.decision.rejected());
        assert_eq!(merge.value, Some(valid_choices()));
        assert_eq!(merge.choice_set.provenance, Provenance::Local);
        assert_eq!(merge.choice_set.choices.len(), 3);
        assert!(merge.reason.contains("expected 3 choices, got 1"));
    }

    #[test]
    fn merge_keeps_invalid_existing_when_both_invalid() {
        let existing = json!(["a", "b"]);
        let merge = default_contract().merge(
            "seg-1",
            STORY,
            Some(&existing),
            Provenance::Remote,
            &json!(["Follow the path", "Find a clue", "x"]),
        );

        assert_eq!(merge.decision, MergeDecision::KeptExistingBothInvalid);
        assert_eq!(merge.value, Some(existing));
        assert!(!merge.choice_set.valid);
    }

    #[test]
    fn merge_leaves_absent_field_absent() {
        let merge = default_contract().merge("seg-1", STORY, None, Provenance::Remote, &json!(5));
        assert_eq!(merge.value, None);
        assert!(merge.choice_set.choices.is_empty());
    }

    #[test]
    fn custom_rules_plug_in() {
        struct NoShouting;
        impl ChoiceRule for NoShouting {
            fn name(&self) -> &'static str {
                "no_shouting"
            }
            fn check(&self, choice: &str, _: &StoryEntities) -> Option<String> {
                choice
                    .contains('!')
                    .then(|| "exclamation marks are not allowed".to_string())
            }
        }

        let contract = ChoiceContract::default().with_rule(Box::new(NoShouting));
        let report = contract.validate(
            STORY,
            Some(&json!(["Open the door!", "Call for help", "Wait quietly"])),
        );
        assert_eq!(report.violations.len(), 1);
        assert_eq!(report.violations[0].rule, "no_shouting");
    }

    mod property_tests {
        use super::*;
        use proptest::prelude::*;

        fn arb_choice_value() -> impl Strategy<Value = serde_json::Value> {
            prop_oneof![
                Just(json!(null)),
                Just(json!("go")),
                Just(json!(["Open the door", "Call for help", "Wait quietly"])),
                Just(json!(["Run to the mill", "Hide in the reeds", "Shout for Mara"])),
                prop::collection::vec(
                    prop_oneof![
                        Just("go".to_string()),
                        Just("Follow the path".to_string()),
                        Just("Climb the tower".to_string()),
                        Just("Find another way".to_string()),
                        Just("Listen at the door".to_string()),
                    ],
                    0..6
                )
                .prop_map(|v| json!(v)),
            ]
        }

        proptest! {
            #[test]
            fn prop_merge_is_valid_or_unchanged(
                existing in proptest::option::of(arb_choice_value()),
                incoming in arb_choice_value(),
            ) {
                let contract = default_contract();
                let merge = contract.merge(
                    "seg-1",
                    STORY,
                    existing.as_ref(),
                    Provenance::Local,
                    &incoming,
                );

                let result_valid = contract.validate(STORY, merge.value.as_ref()).valid;
                prop_assert!(result_valid || merge.value == existing);
            }
        }
    }
}
