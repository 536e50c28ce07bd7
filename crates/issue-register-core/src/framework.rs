//! Issue body frameworks.
//!
//! The body is a tagged variant over framework kind. Matching, classification and
//! reconciliation only talk to a body through [`IssueFramework`], so adding another
//! framework means adding a variant and an implementation, not touching callers.

use serde::{Deserialize, Serialize};

use crate::error::RegisterError;
use crate::model::{CandidateStatement, ScrFacet, SourceSpan};

/// Capability surface every issue framework provides.
pub trait IssueFramework {
    fn framework(&self) -> &'static str;

    /// Fold one candidate's evidence into the body without replacing existing text.
    fn merge_evidence(&mut self, candidate: &CandidateStatement) -> MergeEffect;

    /// Fold every entry of `other` into `self`, keeping provenance.
    fn absorb(&mut self, other: &Self)
    where
        Self: Sized;

    fn summarize_for_agenda(&self) -> AgendaSummary;

    /// Provenance for every text block, addressed by field path.
    fn provenance(&self) -> Vec<FieldProvenance>;

    /// Concatenated body text used for similarity scoring.
    fn match_text(&self) -> String;
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq)]
#[serde(rename_all = "snake_case")]
pub enum MergeEffect {
    /// A new entry was appended.
    Appended,
    /// An identical entry gained a new provenance span.
    Corroborated,
    /// An identical entry already cites this exact span.
    AlreadyCited,
}

#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq)]
pub struct AgendaSummary {
    pub framing_questions: Vec<String>,
    pub unresolved_hypotheses: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq)]
pub struct FieldProvenance {
    pub field: String,
    pub text: String,
    pub resolved: bool,
    pub provenance: Vec<SourceSpan>,
}

/// Addresses one entry of a body for split operations.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq, Ord, PartialOrd)]
pub struct EntrySelector {
    pub facet: ScrFacet,
    pub index: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq)]
#[serde(tag = "framework", rename_all = "snake_case")]
pub enum IssueBody {
    Scr(ScrBody),
}

impl IssueBody {
    #[must_use]
    pub fn seeded_scr(candidate: &CandidateStatement) -> Self {
        Self::Scr(ScrBody::seeded(candidate))
    }

    /// Fold another body into this one.
    ///
    /// # Errors
    /// Returns [`RegisterError::Validation`] when the frameworks differ.
    pub fn absorb_body(&mut self, other: &Self) -> Result<(), RegisterError> {
        match (self, other) {
            (Self::Scr(left), Self::Scr(right)) => {
                left.absorb(right);
                Ok(())
            }
        }
    }

    /// Remove the selected entries and return them as a new body of the same framework.
    ///
    /// # Errors
    /// Returns [`RegisterError::Validation`] when a selector is out of range or repeated.
    pub fn take_entries(&mut self, selectors: &[EntrySelector]) -> Result<Self, RegisterError> {
        match self {
            Self::Scr(body) => body.take_entries(selectors).map(Self::Scr),
        }
    }

    fn inner(&self) -> &dyn IssueFramework {
        match self {
            Self::Scr(body) => body,
        }
    }

    pub fn merge_evidence(&mut self, candidate: &CandidateStatement) -> MergeEffect {
        match self {
            Self::Scr(body) => body.merge_evidence(candidate),
        }
    }

    #[must_use]
    pub fn framework(&self) -> &'static str {
        self.inner().framework()
    }

    #[must_use]
    pub fn summarize_for_agenda(&self) -> AgendaSummary {
        self.inner().summarize_for_agenda()
    }

    #[must_use]
    pub fn provenance(&self) -> Vec<FieldProvenance> {
        self.inner().provenance()
    }

    #[must_use]
    pub fn match_text(&self) -> String {
        self.inner().match_text()
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq)]
pub struct ScrEntry {
    pub text: String,
    #[serde(default)]
    pub provenance: Vec<SourceSpan>,
    #[serde(default)]
    pub resolved: bool,
}

impl ScrEntry {
    fn from_candidate(candidate: &CandidateStatement) -> Self {
        Self {
            text: candidate.text.trim().to_string(),
            provenance: vec![candidate.source_span()],
            resolved: false,
        }
    }
}

/// Situation, Complication, Resolution.
#[derive(Debug, Clone, Default, Serialize, Deserialize, Eq, PartialEq)]
#[serde(default)]
pub struct ScrBody {
    pub situation: Vec<ScrEntry>,
    pub complication: Vec<ScrEntry>,
    pub resolutions: Vec<ScrEntry>,
}

impl ScrBody {
    #[must_use]
    pub fn seeded(candidate: &CandidateStatement) -> Self {
        let mut body = Self::default();
        body.facet_mut(candidate.facet).push(ScrEntry::from_candidate(candidate));
        body
    }

    fn facet_mut(&mut self, facet: ScrFacet) -> &mut Vec<ScrEntry> {
        match facet {
            ScrFacet::Situation => &mut self.situation,
            ScrFacet::Complication => &mut self.complication,
            ScrFacet::Resolution => &mut self.resolutions,
        }
    }

    fn facets(&self) -> [(ScrFacet, &'static str, &Vec<ScrEntry>); 3] {
        [
            (ScrFacet::Situation, "situation", &self.situation),
            (ScrFacet::Complication, "complication", &self.complication),
            (ScrFacet::Resolution, "resolutions", &self.resolutions),
        ]
    }

    fn merge_entry(entries: &mut Vec<ScrEntry>, incoming: &ScrEntry) -> MergeEffect {
        let key = normalize(&incoming.text);
        let Some(existing) = entries.iter_mut().find(|entry| normalize(&entry.text) == key) else {
            entries.push(incoming.clone());
            return MergeEffect::Appended;
        };
        let mut effect = MergeEffect::AlreadyCited;
        for span in &incoming.provenance {
            if !existing.provenance.contains(span) {
                existing.provenance.push(span.clone());
                effect = MergeEffect::Corroborated;
            }
        }
        effect
    }

    fn take_entries(&mut self, selectors: &[EntrySelector]) -> Result<Self, RegisterError> {
        let mut sorted = selectors.to_vec();
        sorted.sort_unstable();
        sorted.dedup();
        if sorted.len() != selectors.len() {
            return Err(RegisterError::Validation("split selectors MUST be distinct".to_string()));
        }
        for selector in &sorted {
            if selector.index >= self.facet_mut(selector.facet).len() {
                return Err(RegisterError::Validation(format!(
                    "split selector {:?}[{}] is out of range",
                    selector.facet, selector.index
                )));
            }
        }

        let mut taken = Self::default();
        for selector in sorted.iter().rev() {
            let entry = self.facet_mut(selector.facet).remove(selector.index);
            taken.facet_mut(selector.facet).insert(0, entry);
        }
        Ok(taken)
    }
}

impl IssueFramework for ScrBody {
    fn framework(&self) -> &'static str {
        "scr"
    }

    fn merge_evidence(&mut self, candidate: &CandidateStatement) -> MergeEffect {
        let incoming = ScrEntry::from_candidate(candidate);
        Self::merge_entry(self.facet_mut(candidate.facet), &incoming)
    }

    fn absorb(&mut self, other: &Self) {
        for (facet, _, entries) in other.facets() {
            for entry in entries {
                Self::merge_entry(self.facet_mut(facet), entry);
            }
        }
    }

    fn summarize_for_agenda(&self) -> AgendaSummary {
        let framing_questions = self
            .complication
            .iter()
            .filter(|entry| !entry.resolved)
            .map(|entry| {
                let text = entry
                    .text
                    .trim_end_matches(|c: char| matches!(c, '.' | '?' | '!') || c.is_whitespace());
                format!("What would it take to resolve: {text}?")
            })
            .collect();
        let unresolved_hypotheses = self.resolutions.iter().filter(|entry| !entry.resolved).count();
        AgendaSummary { framing_questions, unresolved_hypotheses }
    }

    fn provenance(&self) -> Vec<FieldProvenance> {
        self.facets()
            .into_iter()
            .flat_map(|(_, name, entries)| {
                entries.iter().enumerate().map(move |(index, entry)| FieldProvenance {
                    field: format!("{name}[{index}]"),
                    text: entry.text.clone(),
                    resolved: entry.resolved,
                    provenance: entry.provenance.clone(),
                })
            })
            .collect()
    }

    fn match_text(&self) -> String {
        self.facets()
            .into_iter()
            .flat_map(|(_, _, entries)| entries.iter().map(|entry| entry.text.as_str()))
            .collect::<Vec<_>>()
            .join("\n")
    }
}

pub(crate) fn normalize(text: &str) -> String {
    text.split_whitespace().map(str::to_lowercase).collect::<Vec<_>>().join(" ")
}
