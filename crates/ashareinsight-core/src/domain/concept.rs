//! Business concepts: the unit of master-data fusion and vector retrieval.

use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};

/// `concept_category` per spec §3 — the extractor is assumed to produce one
/// of these three; unrecognized values are a `ValidationError` at the
/// archival boundary, not a silent default.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConceptCategory {
    Core,
    Emerging,
    Strategic,
}

/// One entry in a concept's accrued event history (`timeline.recent_event`
/// fusion rule: append with today's date, never overwritten or truncated).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TimelineEvent {
    pub date: NaiveDate,
    pub event: String,
}

/// `timeline` sub-structure: `established` is kept from the first document
/// that set it (historical fact, immutable once recorded); `events` accrues
/// across every fusion that contributes a `recent_event`.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Timeline {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub established: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub events: Vec<TimelineEvent>,
}

/// `relations` sub-structure: each field is a cumulative, de-duplicated set
/// (spec §4.6 field table), never shrunk by fusion.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Relations {
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub customers: Vec<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub partners: Vec<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub subsidiaries: Vec<String>,
}

impl Relations {
    /// Set-union, de-duplicated, insertion order preserved — used by fusion
    /// for all three relation kinds.
    fn union_into(existing: &mut Vec<String>, incoming: &[String]) {
        for item in incoming {
            if !existing.iter().any(|e| e == item) {
                existing.push(item.clone());
            }
        }
    }

    pub fn merge(&mut self, incoming: &Relations) {
        Self::union_into(&mut self.customers, &incoming.customers);
        Self::union_into(&mut self.partners, &incoming.partners);
        Self::union_into(&mut self.subsidiaries, &incoming.subsidiaries);
    }
}

/// Maximum retained `source_sentences`, newest-first (spec §4.6: "cap at
/// M=20 newest").
pub const MAX_SOURCE_SENTENCES: usize = 20;

/// Deep, report-specific detail for a concept, re-architected per the
/// tagged-variant design note: fusion only ever reads/writes through this
/// typed struct, never through raw JSON. Persisted as a single JSON1 column.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ConceptDetails {
    #[serde(default)]
    pub timeline: Timeline,
    /// Point-in-time metrics snapshot (revenue, growth, margin, ...),
    /// overwritten as a whole on every fusion per spec §4.6 — kept as
    /// opaque JSON since its shape varies by industry/report.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub metrics: Option<serde_json::Value>,
    #[serde(default)]
    pub relations: Relations,
    /// Newest-first, capped at [`MAX_SOURCE_SENTENCES`].
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub source_sentences: Vec<String>,
}

impl ConceptDetails {
    /// Applies the set-union / append / cap rules for the nested fields,
    /// leaving scalar fields (`metrics`) to the caller (straight overwrite).
    ///
    /// `already_applied` is `true` when the incoming document has already
    /// been fused into this concept before (i.e. it is a replay of the same
    /// `doc_id`, not a new document) — in that case the one unconditionally
    /// cumulative field, `timeline.events`, must NOT append a second time,
    /// or replaying a document would grow the event log without bound and
    /// break fusion's idempotence-on-replay property (spec §8). The other
    /// cumulative fields (relations, source_sentences) are content-keyed
    /// set-unions and are already naturally idempotent on replay.
    pub fn merge_cumulative_fields(&mut self, incoming: &ConceptDetails, today: NaiveDate, already_applied: bool) {
        if self.timeline.established.is_none() {
            self.timeline.established = incoming.timeline.established.clone();
        }
        if !already_applied {
            if let Some(event) = incoming.timeline.events.first() {
                self.timeline.events.push(TimelineEvent {
                    date: today,
                    event: event.event.clone(),
                });
            }
        }

        self.relations.merge(&incoming.relations);

        for sentence in &incoming.source_sentences {
            if !self.source_sentences.iter().any(|s| s == sentence) {
                self.source_sentences.insert(0, sentence.clone());
            }
        }
        self.source_sentences.truncate(MAX_SOURCE_SENTENCES);
    }
}

/// A business concept extracted for a company, the central fusion target.
///
/// `version` is the optimistic-lock token: every update must supply the
/// version it read and increments it by one on success (spec §9 mandates
/// optimistic, not pessimistic, locking). `is_active` is the soft-delete
/// flag; concepts are never hard-deleted, only deactivated.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub struct BusinessConcept {
    pub concept_id: uuid::Uuid,
    pub company_id: uuid::Uuid,
    pub concept_name: String,
    pub concept_category: ConceptCategory,
    pub description: String,
    /// Hash of the whitespace-collapsed `description`, used to decide
    /// whether fusion needs to null the embedding (Open Question #1).
    pub description_hash: u64,
    pub development_stage: String,
    pub details: ConceptDetails,
    pub importance_score: f32,
    /// `None` means "needs (re)vectorization" — the vectorization
    /// scheduling flag doubles as the nullability of this column.
    pub embedding: Option<Vec<f32>>,
    pub last_updated_from_doc_id: uuid::Uuid,
    pub version: i64,
    pub is_active: bool,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl BusinessConcept {
    /// Text handed to the embedding client, per the fixed formula in spec §4.7:
    /// `"{concept_name}: {description}"`, whitespace collapsed, capped at
    /// `max_chars` (pre-tokenization character cap, default 8192).
    pub fn vectorization_text(&self, max_chars: usize) -> String {
        let collapsed_name: String = self.concept_name.split_whitespace().collect::<Vec<_>>().join(" ");
        let collapsed_desc: String = self.description.split_whitespace().collect::<Vec<_>>().join(" ");
        let full = format!("{collapsed_name}: {collapsed_desc}");
        full.chars().take(max_chars).collect()
    }

    pub fn needs_vectorization(&self) -> bool {
        self.embedding.is_none()
    }
}

/// A directed relation between a concept and an external entity (company,
/// person, product), for the optional knowledge-graph view (spec §3).
/// Append-only: never mutated or deleted by fusion.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub struct ConceptRelation {
    pub relation_id: uuid::Uuid,
    pub source_concept_id: uuid::Uuid,
    pub target_entity_type: String,
    pub target_entity_name: String,
    pub created_at: DateTime<Utc>,
}

/// Collapse whitespace and hash the result — the canonical form compared to
/// decide whether a description has meaningfully changed.
pub fn hash_description(description: &str) -> u64 {
    use std::hash::{Hash, Hasher};
    let collapsed: String = description.split_whitespace().collect::<Vec<_>>().join(" ");
    let mut hasher = std::collections::hash_map::DefaultHasher::new();
    collapsed.hash(&mut hasher);
    hasher.finish()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn concept() -> BusinessConcept {
        BusinessConcept {
            concept_id: uuid::Uuid::new_v4(),
            company_id: uuid::Uuid::new_v4(),
            concept_name: "白酒".into(),
            concept_category: ConceptCategory::Core,
            description: "高端白酒生产与销售".into(),
            description_hash: hash_description("高端白酒生产与销售"),
            development_stage: "成熟期".into(),
            details: ConceptDetails::default(),
            importance_score: 0.8,
            embedding: None,
            last_updated_from_doc_id: uuid::Uuid::new_v4(),
            version: 1,
            is_active: true,
            created_at: Utc::now(),
            updated_at: Utc::now(),
        }
    }

    #[test]
    fn vectorization_text_uses_fixed_formula() {
        let c = concept();
        assert_eq!(c.vectorization_text(8192), "白酒: 高端白酒生产与销售");
    }

    #[test]
    fn vectorization_text_caps_at_max_chars() {
        let mut c = concept();
        c.description = "a".repeat(100);
        assert_eq!(c.vectorization_text(5).chars().count(), 5);
    }

    #[test]
    fn needs_vectorization_reflects_embedding_presence() {
        let mut c = concept();
        assert!(c.needs_vectorization());
        c.embedding = Some(vec![0.1, 0.2]);
        assert!(!c.needs_vectorization());
    }

    #[test]
    fn hash_description_ignores_whitespace_differences() {
        assert_eq!(hash_description("a  b\tc"), hash_description("a b c"));
        assert_ne!(hash_description("a b c"), hash_description("a b d"));
    }

    #[test]
    fn relations_merge_is_set_union_deduped() {
        let mut r = Relations {
            customers: vec!["山东电厂".into()],
            ..Default::default()
        };
        r.merge(&Relations {
            customers: vec!["山东电厂".into(), "华能".into()],
            partners: vec!["博世".into()],
            subsidiaries: vec![],
        });
        assert_eq!(r.customers, vec!["山东电厂".to_string(), "华能".to_string()]);
        assert_eq!(r.partners, vec!["博世".to_string()]);
    }

    #[test]
    fn source_sentences_cap_at_twenty_newest_first() {
        let mut details = ConceptDetails::default();
        for i in 0..25 {
            details.merge_cumulative_fields(
                &ConceptDetails {
                    source_sentences: vec![format!("s{i}")],
                    ..Default::default()
                },
                "2026-01-01".parse().unwrap(),
                false,
            );
        }
        assert_eq!(details.source_sentences.len(), MAX_SOURCE_SENTENCES);
        assert_eq!(details.source_sentences[0], "s24");
    }

    #[test]
    fn timeline_established_kept_once_set() {
        let mut details = ConceptDetails {
            timeline: Timeline { established: Some("2001".into()), events: vec![] },
            ..Default::default()
        };
        details.merge_cumulative_fields(
            &ConceptDetails {
                timeline: Timeline { established: Some("1999".into()), events: vec![] },
                ..Default::default()
            },
            "2026-01-01".parse().unwrap(),
            false,
        );
        assert_eq!(details.timeline.established, Some("2001".to_string()));
    }

    #[test]
    fn replaying_the_same_document_does_not_duplicate_timeline_events() {
        let mut details = ConceptDetails::default();
        let incoming = ConceptDetails {
            timeline: Timeline {
                established: None,
                events: vec![TimelineEvent { date: "2020-01-01".parse().unwrap(), event: "IPO".into() }],
            },
            ..Default::default()
        };
        details.merge_cumulative_fields(&incoming, "2026-01-01".parse().unwrap(), false);
        assert_eq!(details.timeline.events.len(), 1);

        // Replaying the same doc_id must not push a second entry.
        details.merge_cumulative_fields(&incoming, "2026-01-01".parse().unwrap(), true);
        assert_eq!(details.timeline.events.len(), 1);
    }
}
