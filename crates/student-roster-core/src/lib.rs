use std::cmp::Ordering;
use std::collections::{BTreeMap, BTreeSet};
use std::fmt::{Display, Formatter};
use std::sync::OnceLock;

use regex::Regex;
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use serde_json::Value;
use time::{Date, Month, OffsetDateTime, UtcOffset};
use tracing::{debug, info, warn};

/// Storage key the record collection lives under unless configured otherwise.
pub const DEFAULT_NAMESPACE: &str = "students_v1_alif";
pub const DEFAULT_ID_PREFIX: &str = "ST-";
pub const DEFAULT_ID_WIDTH: usize = 3;
pub const CONTACT_DIGITS: usize = 11;
pub const NAME_MIN_CHARS: usize = 2;

pub const SUBMIT_LABEL_CREATE: &str = "Add / Save Student";
pub const SUBMIT_LABEL_UPDATE: &str = "Update Student";

#[derive(Debug, Clone, thiserror::Error, Eq, PartialEq)]
pub enum RosterError {
    #[error("validation error: {0}")]
    Validation(ValidationFailure),
    #[error("persistence error: {0}")]
    Persistence(String),
    #[error("configuration error: {0}")]
    Configuration(String),
}

impl RosterError {
    /// User-facing reason for a rejected submission, if this is one.
    #[must_use]
    pub fn validation_failure(&self) -> Option<ValidationFailure> {
        match self {
            Self::Validation(failure) => Some(*failure),
            _ => None,
        }
    }
}

/// The first validation rule a draft violated.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq, Ord, PartialOrd, Hash)]
#[serde(rename_all = "snake_case")]
pub enum ValidationFailure {
    NameTooShort,
    NameInvalidCharacters,
    ContactInvalid,
    SectionMissing,
    SalaryMissing,
    SalaryInvalid,
    JoinDateMissing,
}

impl ValidationFailure {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::NameTooShort => "name_too_short",
            Self::NameInvalidCharacters => "name_invalid_characters",
            Self::ContactInvalid => "contact_invalid",
            Self::SectionMissing => "section_missing",
            Self::SalaryMissing => "salary_missing",
            Self::SalaryInvalid => "salary_invalid",
            Self::JoinDateMissing => "join_date_missing",
        }
    }

    #[must_use]
    pub fn field(self) -> &'static str {
        match self {
            Self::NameTooShort | Self::NameInvalidCharacters => "name",
            Self::ContactInvalid => "contact",
            Self::SectionMissing => "section",
            Self::SalaryMissing | Self::SalaryInvalid => "salary",
            Self::JoinDateMissing => "joinDate",
        }
    }

    #[must_use]
    pub fn message(self) -> &'static str {
        match self {
            Self::NameTooShort => "Name must be at least 2 characters.",
            Self::NameInvalidCharacters => "Name may only contain letters and spaces.",
            Self::ContactInvalid => "Contact must be exactly 11 digits (digits only).",
            Self::SectionMissing => "Section must not be empty.",
            Self::SalaryMissing => "Salary is required.",
            Self::SalaryInvalid => "Salary must be a number greater than or equal to 0.",
            Self::JoinDateMissing => "Joining date is required.",
        }
    }
}

impl Display for ValidationFailure {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.message())
    }
}

#[derive(Debug, Clone, Serialize, Eq, PartialEq, Ord, PartialOrd, Hash)]
#[serde(transparent)]
pub struct RecordId(pub String);

/// Accepts string identifiers and the bare numeric identifiers written by
/// older clients.
impl<'de> Deserialize<'de> for RecordId {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        match Value::deserialize(deserializer)? {
            Value::String(text) => Ok(Self(text)),
            Value::Number(number) => Ok(Self(number.to_string())),
            other => Err(serde::de::Error::custom(format!(
                "record id must be a string or a number, got {other}"
            ))),
        }
    }
}

impl RecordId {
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Display for RecordId {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for RecordId {
    fn from(value: &str) -> Self {
        Self(value.to_string())
    }
}

/// One persisted student entry.
///
/// Stored records are not re-validated on load, so string fields default to
/// empty and `salary` is `None` when the stored value is missing or not a
/// number.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase", from = "StoredRecord")]
pub struct Record {
    pub id: RecordId,
    pub name: String,
    pub contact: String,
    pub section: String,
    #[serde(serialize_with = "serialize_salary")]
    pub salary: Option<f64>,
    pub join_date: String,
}

/// Stored layout as written by every client generation. `joiningDate` is
/// the older name of `joinDate`; when both are present `joinDate` wins.
#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct StoredRecord {
    id: RecordId,
    #[serde(default)]
    name: String,
    #[serde(default)]
    contact: String,
    #[serde(default)]
    section: String,
    #[serde(default, deserialize_with = "deserialize_salary")]
    salary: Option<f64>,
    #[serde(default)]
    join_date: Option<String>,
    #[serde(default)]
    joining_date: Option<String>,
}

impl From<StoredRecord> for Record {
    fn from(stored: StoredRecord) -> Self {
        Self {
            id: stored.id,
            name: stored.name,
            contact: stored.contact,
            section: stored.section,
            salary: stored.salary,
            join_date: stored
                .join_date
                .or(stored.joining_date)
                .unwrap_or_default(),
        }
    }
}

impl Record {
    fn from_draft(id: RecordId, draft: &RecordDraft) -> Self {
        Self {
            id,
            name: draft.name.clone(),
            contact: draft.contact.clone(),
            section: draft.section.clone(),
            salary: draft.salary_value(),
            join_date: draft.join_date.clone(),
        }
    }

    fn apply(&mut self, draft: &RecordDraft) {
        self.name.clone_from(&draft.name);
        self.contact.clone_from(&draft.contact);
        self.section.clone_from(&draft.section);
        self.salary = draft.salary_value();
        self.join_date.clone_from(&draft.join_date);
    }
}

static NAME_RE: OnceLock<Regex> = OnceLock::new();

fn name_regex() -> &'static Regex {
    NAME_RE.get_or_init(|| {
        // Letters in the Unicode general-category sense, not the wider
        // Alphabetic property.
        Regex::new(r"^[\p{L} ]+$")
            .unwrap_or_else(|error| panic!("name regex failed to compile: {error}"))
    })
}

/// Raw form values for a create or update submission.
#[derive(Debug, Clone, Default, Serialize, Deserialize, Eq, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct RecordDraft {
    pub name: String,
    pub contact: String,
    pub section: String,
    pub salary: String,
    pub join_date: String,
}

impl RecordDraft {
    /// Trims the free-text inputs the way the entry form does before
    /// validation. Salary and join date are left as entered.
    #[must_use]
    pub fn normalized(&self) -> Self {
        Self {
            name: self.name.trim().to_string(),
            contact: self.contact.trim().to_string(),
            section: self.section.trim().to_string(),
            salary: self.salary.clone(),
            join_date: self.join_date.clone(),
        }
    }

    /// Checks the draft against the entry rules, in order, stopping at the
    /// first rule that fails.
    ///
    /// # Errors
    /// Returns [`RosterError::Validation`] naming the first violated rule.
    pub fn validate(&self) -> Result<(), RosterError> {
        let name = self.name.trim();
        if name.chars().count() < NAME_MIN_CHARS {
            return Err(RosterError::Validation(ValidationFailure::NameTooShort));
        }

        if !name_regex().is_match(name) {
            return Err(RosterError::Validation(
                ValidationFailure::NameInvalidCharacters,
            ));
        }

        if self.contact.len() != CONTACT_DIGITS
            || !self.contact.bytes().all(|byte| byte.is_ascii_digit())
        {
            return Err(RosterError::Validation(ValidationFailure::ContactInvalid));
        }

        if self.section.trim().is_empty() {
            return Err(RosterError::Validation(ValidationFailure::SectionMissing));
        }

        if self.salary.trim().is_empty() {
            return Err(RosterError::Validation(ValidationFailure::SalaryMissing));
        }

        match parse_salary(&self.salary) {
            Some(value) if value >= 0.0 => {}
            _ => return Err(RosterError::Validation(ValidationFailure::SalaryInvalid)),
        }

        if self.join_date.trim().is_empty() {
            return Err(RosterError::Validation(ValidationFailure::JoinDateMissing));
        }

        Ok(())
    }

    fn salary_value(&self) -> Option<f64> {
        parse_salary(&self.salary)
    }
}

impl From<&Record> for RecordDraft {
    fn from(record: &Record) -> Self {
        Self {
            name: record.name.clone(),
            contact: record.contact.clone(),
            section: record.section.clone(),
            salary: record.salary.map(|value| value.to_string()).unwrap_or_default(),
            join_date: record.join_date.clone(),
        }
    }
}

/// Parses a salary string, accepting only finite numbers.
#[must_use]
pub fn parse_salary(raw: &str) -> Option<f64> {
    let trimmed = raw.trim();
    if trimmed.is_empty() {
        return None;
    }

    trimmed
        .parse::<f64>()
        .ok()
        .filter(|value| value.is_finite())
}

#[allow(
    clippy::ref_option,
    clippy::float_cmp,
    clippy::cast_possible_truncation
)]
fn serialize_salary<S: Serializer>(salary: &Option<f64>, serializer: S) -> Result<S::Ok, S::Error> {
    // Whole amounts are written as JSON integers so the stored text matches
    // what browser clients produced.
    const MAX_EXACT_INTEGER: f64 = 9_007_199_254_740_992.0;
    match *salary {
        Some(value) if value.fract() == 0.0 && value.abs() < MAX_EXACT_INTEGER => {
            serializer.serialize_i64(value as i64)
        }
        Some(value) => serializer.serialize_f64(value),
        None => serializer.serialize_none(),
    }
}

fn deserialize_salary<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Option<f64>, D::Error> {
    let raw = Value::deserialize(deserializer)?;
    Ok(match raw {
        Value::Number(number) => number.as_f64(),
        Value::String(text) => parse_salary(&text),
        _ => None,
    })
}

/// Identifier format: a fixed prefix followed by a zero-padded counter.
#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq)]
pub struct IdScheme {
    pub prefix: String,
    pub width: usize,
}

impl Default for IdScheme {
    fn default() -> Self {
        Self {
            prefix: DEFAULT_ID_PREFIX.to_string(),
            width: DEFAULT_ID_WIDTH,
        }
    }
}

impl IdScheme {
    /// Builds a validated scheme.
    ///
    /// # Errors
    /// Returns [`RosterError::Configuration`] when the prefix is empty or ends
    /// in a digit, or the width is zero.
    pub fn new(prefix: impl Into<String>, width: usize) -> Result<Self, RosterError> {
        let scheme = Self {
            prefix: prefix.into(),
            width,
        };
        scheme.validate()?;
        Ok(scheme)
    }

    /// # Errors
    /// Returns [`RosterError::Configuration`] when the prefix is empty or ends
    /// in a digit, or the width is zero.
    pub fn validate(&self) -> Result<(), RosterError> {
        if self.prefix.is_empty() {
            return Err(RosterError::Configuration(
                "identifier prefix MUST NOT be empty".to_string(),
            ));
        }

        if self
            .prefix
            .chars()
            .last()
            .is_some_and(|ch| ch.is_ascii_digit())
        {
            return Err(RosterError::Configuration(
                "identifier prefix MUST NOT end with a digit".to_string(),
            ));
        }

        if self.width == 0 {
            return Err(RosterError::Configuration(
                "identifier width MUST be >= 1".to_string(),
            ));
        }

        Ok(())
    }

    /// Returns the decimal counter of an identifier that follows this scheme,
    /// with leading zeros stripped. The counter may exceed any machine
    /// integer.
    #[must_use]
    pub fn parse_suffix<'a>(&self, id: &'a str) -> Option<&'a str> {
        let digits = id.strip_prefix(self.prefix.as_str())?;
        if digits.is_empty() || !digits.bytes().all(|byte| byte.is_ascii_digit()) {
            return None;
        }

        let significant = digits.trim_start_matches('0');
        Some(if significant.is_empty() { "0" } else { significant })
    }

    #[must_use]
    pub fn format(&self, counter: u64) -> RecordId {
        self.format_digits(&counter.to_string())
    }

    fn format_digits(&self, digits: &str) -> RecordId {
        RecordId(format!(
            "{}{:0>width$}",
            self.prefix,
            digits,
            width = self.width
        ))
    }

    #[must_use]
    pub fn first(&self) -> RecordId {
        self.format(1)
    }

    /// Derives the next identifier from the identifiers currently in use.
    ///
    /// Identifiers that do not follow the scheme are ignored; when none do,
    /// the first identifier of the sequence is returned. The result is never
    /// one of `existing`.
    #[must_use]
    pub fn next<'a>(&self, existing: impl IntoIterator<Item = &'a RecordId>) -> RecordId {
        let existing: BTreeSet<&str> = existing.into_iter().map(RecordId::as_str).collect();
        let max = existing
            .iter()
            .filter_map(|id| self.parse_suffix(id))
            .max_by(|left, right| compare_decimal(left, right));

        let mut counter = max.map_or_else(|| "1".to_string(), increment_decimal);
        loop {
            let candidate = self.format_digits(&counter);
            if !existing.contains(candidate.as_str()) {
                return candidate;
            }
            counter = increment_decimal(&counter);
        }
    }
}

/// Orders two digit strings without leading zeros by numeric value.
fn compare_decimal(left: &str, right: &str) -> Ordering {
    left.len().cmp(&right.len()).then_with(|| left.cmp(right))
}

/// Adds one to a string of ASCII decimal digits.
fn increment_decimal(digits: &str) -> String {
    let mut bytes = digits.as_bytes().to_vec();
    for byte in bytes.iter_mut().rev() {
        if *byte == b'9' {
            *byte = b'0';
        } else {
            *byte += 1;
            return String::from_utf8_lossy(&bytes).into_owned();
        }
    }

    let mut carried = String::with_capacity(bytes.len() + 1);
    carried.push('1');
    carried.push_str(&String::from_utf8_lossy(&bytes));
    carried
}

/// Durable string storage addressed by key.
pub trait KeyValueStore {
    /// # Errors
    /// Returns [`RosterError::Persistence`] when the backing store fails.
    fn get(&self, key: &str) -> Result<Option<String>, RosterError>;

    /// # Errors
    /// Returns [`RosterError::Persistence`] when the backing store fails.
    fn set(&mut self, key: &str, value: &str) -> Result<(), RosterError>;
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MemoryKeyValueStore {
    entries: BTreeMap<String, String>,
}

impl MemoryKeyValueStore {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn with_entry(key: &str, value: &str) -> Self {
        let mut entries = BTreeMap::new();
        entries.insert(key.to_string(), value.to_string());
        Self { entries }
    }
}

impl KeyValueStore for MemoryKeyValueStore {
    fn get(&self, key: &str) -> Result<Option<String>, RosterError> {
        Ok(self.entries.get(key).cloned())
    }

    fn set(&mut self, key: &str, value: &str) -> Result<(), RosterError> {
        self.entries.insert(key.to_string(), value.to_string());
        Ok(())
    }
}

/// Load/save contract between the record store and durable storage.
pub trait RecordPersistence {
    /// Loads the stored collection. Absent or unreadable data yields an
    /// empty collection.
    fn load(&self) -> Vec<Record>;

    /// Replaces the stored collection.
    ///
    /// # Errors
    /// Returns [`RosterError::Persistence`] when encoding or writing fails.
    fn save(&mut self, records: &[Record]) -> Result<(), RosterError>;
}

/// Stores the whole collection as one JSON array under a namespace key.
#[derive(Debug, Clone)]
pub struct JsonRecordAdapter<K> {
    store: K,
    namespace: String,
}

impl<K: KeyValueStore> JsonRecordAdapter<K> {
    pub fn new(store: K, namespace: impl Into<String>) -> Self {
        Self {
            store,
            namespace: namespace.into(),
        }
    }

    #[must_use]
    pub fn namespace(&self) -> &str {
        &self.namespace
    }

    #[must_use]
    pub fn store(&self) -> &K {
        &self.store
    }
}

impl<K: KeyValueStore> RecordPersistence for JsonRecordAdapter<K> {
    fn load(&self) -> Vec<Record> {
        let raw = match self.store.get(&self.namespace) {
            Ok(Some(raw)) => raw,
            Ok(None) => return Vec::new(),
            Err(err) => {
                warn!(namespace = %self.namespace, error = %err, "record storage unreadable, starting empty");
                return Vec::new();
            }
        };

        match decode_records(&raw) {
            Ok(records) => records,
            Err(err) => {
                warn!(namespace = %self.namespace, error = %err, "discarding corrupt record collection");
                Vec::new()
            }
        }
    }

    fn save(&mut self, records: &[Record]) -> Result<(), RosterError> {
        let payload = encode_records(records)?;
        self.store.set(&self.namespace, &payload)
    }
}

/// Serializes a collection to the persisted JSON array layout.
///
/// # Errors
/// Returns [`RosterError::Persistence`] when serialization fails.
pub fn encode_records(records: &[Record]) -> Result<String, RosterError> {
    serde_json::to_string(records)
        .map_err(|err| RosterError::Persistence(format!("failed to encode records: {err}")))
}

/// Parses the persisted JSON array layout.
///
/// # Errors
/// Returns [`RosterError::Persistence`] when the text is not a JSON array of
/// records.
pub fn decode_records(raw: &str) -> Result<Vec<Record>, RosterError> {
    serde_json::from_str(raw)
        .map_err(|err| RosterError::Persistence(format!("invalid stored record collection: {err}")))
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum SubmitOutcome {
    Created { record: Record },
    Updated { record: Record },
    /// The record being edited no longer exists; edit mode was cleared and
    /// nothing was written.
    EditTargetMissing { id: RecordId },
}

impl SubmitOutcome {
    #[must_use]
    pub fn record(&self) -> Option<&Record> {
        match self {
            Self::Created { record } | Self::Updated { record } => Some(record),
            Self::EditTargetMissing { .. } => None,
        }
    }
}

/// Owns the authoritative record collection and the edit-mode flag.
///
/// Every mutation builds the next collection, persists it, and only then
/// replaces the in-memory state, so memory and storage move together.
#[derive(Debug)]
pub struct RecordStore<P> {
    records: Vec<Record>,
    editing: Option<RecordId>,
    scheme: IdScheme,
    persistence: P,
}

impl<P: RecordPersistence> RecordStore<P> {
    /// Loads the collection from `persistence`. Later duplicates of an
    /// identifier are dropped so identifiers stay unique.
    pub fn open(persistence: P, scheme: IdScheme) -> Self {
        let loaded = persistence.load();
        let loaded_count = loaded.len();

        let mut seen = BTreeSet::new();
        let records: Vec<Record> = loaded
            .into_iter()
            .filter(|record| seen.insert(record.id.clone()))
            .collect();

        if records.len() != loaded_count {
            warn!(
                dropped = loaded_count - records.len(),
                "dropped stored records with duplicate identifiers"
            );
        }
        debug!(records = records.len(), "record store opened");

        Self {
            records,
            editing: None,
            scheme,
            persistence,
        }
    }

    #[must_use]
    pub fn records(&self) -> &[Record] {
        &self.records
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.records.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    #[must_use]
    pub fn get(&self, id: &str) -> Option<&Record> {
        self.records.iter().find(|record| record.id.as_str() == id)
    }

    #[must_use]
    pub fn editing(&self) -> Option<&RecordId> {
        self.editing.as_ref()
    }

    #[must_use]
    pub fn scheme(&self) -> &IdScheme {
        &self.scheme
    }

    #[must_use]
    pub fn persistence(&self) -> &P {
        &self.persistence
    }

    #[must_use]
    pub fn next_identifier(&self) -> RecordId {
        self.scheme.next(self.records.iter().map(|record| &record.id))
    }

    /// Creates a record, or updates the record being edited when edit mode
    /// is active.
    ///
    /// # Errors
    /// Returns [`RosterError::Validation`] when the draft breaks a rule, and
    /// [`RosterError::Persistence`] when the write-through fails. Neither
    /// changes the collection or the edit mode.
    pub fn submit(&mut self, draft: &RecordDraft) -> Result<SubmitOutcome, RosterError> {
        let draft = draft.normalized();
        draft.validate()?;

        let Some(target) = self.editing.clone() else {
            let record = Record::from_draft(self.next_identifier(), &draft);
            let mut next = self.records.clone();
            next.push(record.clone());
            self.commit(next)?;
            info!(id = %record.id, "created record");
            return Ok(SubmitOutcome::Created { record });
        };

        let mut next = self.records.clone();
        let Some(existing) = next.iter_mut().find(|record| record.id == target) else {
            self.editing = None;
            debug!(id = %target, "edit target no longer exists");
            return Ok(SubmitOutcome::EditTargetMissing { id: target });
        };

        existing.apply(&draft);
        let record = existing.clone();
        self.commit(next)?;
        self.editing = None;
        info!(id = %record.id, "updated record");
        Ok(SubmitOutcome::Updated { record })
    }

    /// Deletes the record with `id`. Confirmation is the caller's job.
    ///
    /// # Errors
    /// Returns [`RosterError::Persistence`] when the write-through fails.
    pub fn remove(&mut self, id: &str) -> Result<Option<Record>, RosterError> {
        let Some(position) = self.records.iter().position(|record| record.id.as_str() == id)
        else {
            debug!(id, "remove target not found");
            return Ok(None);
        };

        let mut next = self.records.clone();
        let removed = next.remove(position);
        self.commit(next)?;
        if self.editing.as_ref() == Some(&removed.id) {
            self.editing = None;
        }
        info!(id = %removed.id, "removed record");
        Ok(Some(removed))
    }

    /// Enters edit mode for `id` and returns its current values for the form.
    pub fn begin_edit(&mut self, id: &str) -> Option<RecordDraft> {
        let Some(record) = self.get(id) else {
            debug!(id, "edit target not found");
            return None;
        };

        let draft = RecordDraft::from(record);
        self.editing = Some(record.id.clone());
        Some(draft)
    }

    pub fn cancel_edit(&mut self) {
        self.editing = None;
    }

    #[must_use]
    pub fn project(&self, filter: &ViewFilter) -> Projection {
        project(&self.records, filter)
    }

    fn commit(&mut self, next: Vec<Record>) -> Result<(), RosterError> {
        self.persistence.save(&next)?;
        self.records = next;
        Ok(())
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, Eq, PartialEq)]
pub struct ViewFilter {
    pub search_text: String,
    pub section: String,
}

impl ViewFilter {
    pub fn new(search_text: impl Into<String>, section: impl Into<String>) -> Self {
        Self {
            search_text: search_text.into(),
            section: section.into(),
        }
    }

    #[must_use]
    pub fn matches(&self, record: &Record) -> bool {
        let needle = self.search_text.trim().to_lowercase();
        let text_match = needle.is_empty()
            || record.name.to_lowercase().contains(&needle)
            || record.contact.to_lowercase().contains(&needle);
        let section_match = self.section.is_empty() || record.section == self.section;
        text_match && section_match
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq)]
pub struct Summary {
    pub count: usize,
    pub total_salary: f64,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Projection {
    pub rows: Vec<Record>,
    pub summary: Summary,
    pub distinct_sections: Vec<String>,
    /// The requested section filter, kept only while some record still has
    /// that section.
    pub selected_section: Option<String>,
}

/// Filters `records` and aggregates the matches.
#[must_use]
pub fn project(records: &[Record], filter: &ViewFilter) -> Projection {
    let rows: Vec<Record> = records
        .iter()
        .filter(|record| filter.matches(record))
        .cloned()
        .collect();

    let summary = Summary {
        count: rows.len(),
        total_salary: rows.iter().map(|record| record.salary.unwrap_or(0.0)).sum(),
    };

    let distinct_sections: Vec<String> = records
        .iter()
        .map(|record| record.section.as_str())
        .filter(|section| !section.is_empty())
        .collect::<BTreeSet<_>>()
        .into_iter()
        .map(str::to_string)
        .collect();

    let selected_section = if filter.section.is_empty() {
        None
    } else {
        distinct_sections
            .iter()
            .find(|section| **section == filter.section)
            .cloned()
    };

    debug!(
        rows = summary.count,
        sections = distinct_sections.len(),
        "projected records"
    );

    Projection {
        rows,
        summary,
        distinct_sections,
        selected_section,
    }
}

#[derive(Debug, Clone, Copy, Eq, PartialEq)]
pub enum Confirmation {
    Confirmed,
    Declined,
}

impl From<bool> for Confirmation {
    fn from(value: bool) -> Self {
        if value {
            Self::Confirmed
        } else {
            Self::Declined
        }
    }
}

/// Presentation-side state around a [`RecordStore`]: the active filter and
/// the single error message shown next to the form.
#[derive(Debug)]
pub struct RosterSession<P> {
    store: RecordStore<P>,
    filter: ViewFilter,
    error_message: Option<String>,
}

impl<P: RecordPersistence> RosterSession<P> {
    pub fn new(store: RecordStore<P>) -> Self {
        Self {
            store,
            filter: ViewFilter::default(),
            error_message: None,
        }
    }

    #[must_use]
    pub fn store(&self) -> &RecordStore<P> {
        &self.store
    }

    #[must_use]
    pub fn filter(&self) -> &ViewFilter {
        &self.filter
    }

    #[must_use]
    pub fn error_message(&self) -> Option<&str> {
        self.error_message.as_deref()
    }

    #[must_use]
    pub fn submit_label(&self) -> &'static str {
        if self.store.editing().is_some() {
            SUBMIT_LABEL_UPDATE
        } else {
            SUBMIT_LABEL_CREATE
        }
    }

    /// Submits the form. The previous error message is replaced by this
    /// attempt's outcome.
    ///
    /// # Errors
    /// Propagates [`RecordStore::submit`] errors after recording their
    /// message.
    pub fn submit(&mut self, draft: &RecordDraft) -> Result<SubmitOutcome, RosterError> {
        self.error_message = None;
        match self.store.submit(draft) {
            Ok(outcome) => Ok(outcome),
            Err(err) => {
                self.error_message = Some(match &err {
                    RosterError::Validation(failure) => failure.message().to_string(),
                    other => other.to_string(),
                });
                Err(err)
            }
        }
    }

    pub fn begin_edit(&mut self, id: &str) -> Option<RecordDraft> {
        self.store.begin_edit(id)
    }

    /// Clears the form: leaves edit mode and drops the error message.
    pub fn cancel(&mut self) {
        self.store.cancel_edit();
        self.error_message = None;
    }

    /// # Errors
    /// Returns [`RosterError::Persistence`] when the write-through fails.
    pub fn remove(
        &mut self,
        id: &str,
        confirmation: Confirmation,
    ) -> Result<Option<Record>, RosterError> {
        match confirmation {
            Confirmation::Confirmed => self.store.remove(id),
            Confirmation::Declined => Ok(None),
        }
    }

    pub fn set_search(&mut self, text: impl Into<String>) {
        self.filter.search_text = text.into();
    }

    pub fn set_section_filter(&mut self, section: impl Into<String>) {
        self.filter.section = section.into();
    }

    pub fn reset_filters(&mut self) {
        self.filter = ViewFilter::default();
    }

    /// Projects the store through the current filter. A section filter that
    /// no longer matches any section is cleared for subsequent views.
    pub fn view(&mut self) -> Projection {
        let projection = self.store.project(&self.filter);
        if projection.selected_section.is_none() {
            self.filter.section.clear();
        }
        projection
    }
}

/// Renders a join date as `YYYY-MM-DD` when it starts with a calendar date,
/// and verbatim otherwise.
#[must_use]
pub fn display_join_date(raw: &str) -> String {
    match parse_join_date(raw) {
        Some(date) => format!(
            "{:04}-{:02}-{:02}",
            date.year(),
            u8::from(date.month()),
            date.day()
        ),
        None => raw.to_string(),
    }
}

/// Parses the calendar-date part of a join date (`YYYY-MM-DD`, optionally
/// followed by `T` or a space and a time).
#[must_use]
pub fn parse_join_date(raw: &str) -> Option<Date> {
    let date_part = raw.trim().split(['T', ' ']).next()?;
    let mut parts = date_part.split('-');
    let year: i32 = parts.next()?.parse().ok()?;
    let month: u8 = parts.next()?.parse().ok()?;
    let day: u8 = parts.next()?.parse().ok()?;
    if parts.next().is_some() {
        return None;
    }

    let month = Month::try_from(month).ok()?;
    Date::from_calendar_date(year, month, day).ok()
}

#[must_use]
pub fn now_utc() -> OffsetDateTime {
    OffsetDateTime::now_utc().to_offset(UtcOffset::UTC)
}

/// Formats a timestamp as RFC3339 after normalizing to UTC.
///
/// # Errors
/// Returns [`RosterError::Persistence`] when formatting fails.
pub fn format_rfc3339(value: OffsetDateTime) -> Result<String, RosterError> {
    value
        .to_offset(UtcOffset::UTC)
        .format(&time::format_description::well_known::Rfc3339)
        .map_err(|err| RosterError::Persistence(format!("failed to format RFC3339 timestamp: {err}")))
}
