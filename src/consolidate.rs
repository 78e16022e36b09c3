//! Contact identity consolidation engine.
//!
//! Classifies an incoming (email, phone) submission against stored contacts,
//! creates records where the submission carries new information, and merges
//! identity groups when the two matched records turn out to belong to the
//! same real-world entity.
//!
//! Groups are kept as flat stars: one primary, every secondary pointing
//! directly at it. Merging is union-by-age — the primary that was created
//! earliest survives, and the newer group is repointed at it in a single
//! predicate-based update. Structurally this is union-find with full
//! flattening on every union.
//!
//! Every submit runs as one atomic unit against the store; a lost race
//! against a concurrent writer is retried from classification with bounded
//! backoff.

use std::thread;
use std::time::Duration;

use serde::Serialize;

use crate::clog;
use crate::logging;
use crate::store::{ContactId, ContactRecord, ContactStore, NewContact, StoreError};

/// Attempts per submit before a persistent conflict is reported.
const MAX_ATTEMPTS: u32 = 4;

/// Backoff before the first retry; doubles on each subsequent one.
const RETRY_BASE_DELAY: Duration = Duration::from_millis(25);

// ---------------------------------------------------------------------------
// Error types
// ---------------------------------------------------------------------------

#[derive(Debug)]
pub enum ConsolidateError {
    /// Neither email nor phone supplied. Surfaced to the caller, not retried.
    Validation(String),
    /// A referenced record is missing or linkage is corrupt — an invariant
    /// violation, surfaced as an internal error.
    NotFound(String),
    /// The transactional race was lost repeatedly; transient.
    Conflict(String),
    /// The persistence layer failed; transient.
    Unavailable(String),
}

impl std::fmt::Display for ConsolidateError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ConsolidateError::Validation(msg) => write!(f, "validation error: {msg}"),
            ConsolidateError::NotFound(msg) => write!(f, "consistency error: {msg}"),
            ConsolidateError::Conflict(msg) => write!(f, "conflict: {msg}"),
            ConsolidateError::Unavailable(msg) => write!(f, "store unavailable: {msg}"),
        }
    }
}

impl std::error::Error for ConsolidateError {}

impl From<StoreError> for ConsolidateError {
    fn from(e: StoreError) -> Self {
        match e {
            StoreError::NotFound(msg) => ConsolidateError::NotFound(msg),
            StoreError::Busy => {
                ConsolidateError::Conflict("conflicting submissions in progress".into())
            }
            StoreError::Sqlite(e) => ConsolidateError::Unavailable(e.to_string()),
        }
    }
}

// ---------------------------------------------------------------------------
// Request and view types
// ---------------------------------------------------------------------------

/// A normalized identify request. At least one field must be present.
#[derive(Debug, Clone)]
pub struct Submission {
    pub email: Option<String>,
    pub phone_number: Option<String>,
}

impl Submission {
    /// Build a submission, treating empty or whitespace-only strings as
    /// absent.
    pub fn new(email: Option<String>, phone_number: Option<String>) -> Self {
        let normalize = |v: Option<String>| {
            v.map(|s| s.trim().to_string())
                .filter(|s| !s.is_empty())
        };
        Self {
            email: normalize(email),
            phone_number: normalize(phone_number),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.email.is_none() && self.phone_number.is_none()
    }
}

/// The consolidated identity a submit resolves to.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ConsolidatedView {
    pub primary_contact_id: ContactId,
    pub emails: Vec<String>,
    pub phone_numbers: Vec<String>,
    pub secondary_contact_ids: Vec<ContactId>,
}

// ---------------------------------------------------------------------------
// Match classification
// ---------------------------------------------------------------------------

/// How the submission relates to stored contacts: no record matched, one
/// record matched (possibly via both fields), or the email and phone matched
/// two distinct records.
#[derive(Debug, Clone)]
enum MatchOutcome {
    NoMatch,
    Single(ContactRecord),
    Dual(ContactRecord, ContactRecord),
}

/// Sub-classification of a dual match by the matched records' precedence.
/// `SameGroup` covers every case where both sides already resolve to the
/// same primary, including a secondary matched alongside its own primary.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum DualKind {
    MergePrimaries,
    MergeOneSecondary,
    MergeSecondaries,
    SameGroup,
}

fn classify<S: ContactStore>(
    store: &S,
    submission: &Submission,
) -> Result<MatchOutcome, StoreError> {
    let by_email = match &submission.email {
        Some(email) => store.find_by_email(email)?,
        None => None,
    };
    let by_phone = match &submission.phone_number {
        Some(phone) => store.find_by_phone(phone)?,
        None => None,
    };

    Ok(match (by_email, by_phone) {
        (None, None) => MatchOutcome::NoMatch,
        (Some(record), None) | (None, Some(record)) => MatchOutcome::Single(record),
        (Some(a), Some(b)) if a.id == b.id => MatchOutcome::Single(a),
        (Some(a), Some(b)) => MatchOutcome::Dual(a, b),
    })
}

fn dual_kind(a: &ContactRecord, b: &ContactRecord, same_group: bool) -> DualKind {
    if same_group {
        return DualKind::SameGroup;
    }
    match (a.is_primary(), b.is_primary()) {
        (true, true) => DualKind::MergePrimaries,
        (false, false) => DualKind::MergeSecondaries,
        _ => DualKind::MergeOneSecondary,
    }
}

// ---------------------------------------------------------------------------
// Group resolution
// ---------------------------------------------------------------------------

/// Resolve the primary of `record`'s group.
///
/// A primary resolves to itself; a secondary follows its link one hop. A
/// secondary pointing at another secondary can only come from legacy or
/// corrupt data — it is tolerated by exactly one additional hop, and
/// anything deeper fails as an invariant violation.
fn resolve_primary<S: ContactStore>(
    store: &S,
    record: &ContactRecord,
) -> Result<ContactRecord, StoreError> {
    if record.is_primary() {
        return Ok(record.clone());
    }
    let parent = store.find_by_id(linked_id_of(record)?)?;
    if parent.is_primary() {
        return Ok(parent);
    }

    clog!(
        "resolve: contact {} links to secondary {}, following one extra hop",
        logging::contact_id(record.id),
        logging::contact_id(parent.id)
    );
    let grandparent = store.find_by_id(linked_id_of(&parent)?)?;
    if grandparent.is_primary() {
        Ok(grandparent)
    } else {
        Err(StoreError::NotFound(format!(
            "contact {} sits on a linkage chain deeper than one hop",
            record.id
        )))
    }
}

fn linked_id_of(record: &ContactRecord) -> Result<ContactId, StoreError> {
    record.linked_id.ok_or_else(|| {
        StoreError::NotFound(format!(
            "secondary contact {} has no linked id",
            record.id
        ))
    })
}

/// Orders two primaries by age: earliest `created_at` wins, ties break by
/// lowest id.
fn ordered_by_age(a: ContactRecord, b: ContactRecord) -> (ContactRecord, ContactRecord) {
    if (a.created_at, a.id) <= (b.created_at, b.id) {
        (a, b)
    } else {
        (b, a)
    }
}

// ---------------------------------------------------------------------------
// Consolidator
// ---------------------------------------------------------------------------

/// The consolidation orchestrator: the single entry point the rest of the
/// system calls. Owns its store handle; each worker gets its own
/// `Consolidator` over its own store handle.
pub struct Consolidator<S: ContactStore> {
    store: S,
}

impl<S: ContactStore> Consolidator<S> {
    pub fn new(store: S) -> Self {
        Self { store }
    }

    /// Borrow the underlying store.
    pub fn store(&self) -> &S {
        &self.store
    }

    /// Resolve a submission to its consolidated identity, creating or
    /// merging records as needed.
    ///
    /// The whole read-decide-write sequence runs inside one atomic unit. On
    /// a lost race ([`ConsolidateError::Conflict`]) the unit is re-run from
    /// classification — a classification computed before a conflicting
    /// commit is stale — with doubling backoff, up to [`MAX_ATTEMPTS`].
    pub fn submit(&self, submission: &Submission) -> Result<ConsolidatedView, ConsolidateError> {
        if submission.is_empty() {
            return Err(ConsolidateError::Validation(
                "either email or phoneNumber is required".into(),
            ));
        }
        clog!(
            "submit: email={} phone={}",
            submission.email.as_deref().map(logging::email).unwrap_or_else(|| "-".into()),
            submission.phone_number.as_deref().map(logging::phone).unwrap_or_else(|| "-".into())
        );

        let mut attempt = 1;
        loop {
            match self.store.run_atomic(|s| Self::submit_tx(s, submission)) {
                Err(StoreError::Busy) if attempt < MAX_ATTEMPTS => {
                    let delay = RETRY_BASE_DELAY * 2u32.pow(attempt - 1);
                    clog!(
                        "submit: lost write race, retrying in {:?} (attempt {attempt}/{MAX_ATTEMPTS})",
                        delay
                    );
                    thread::sleep(delay);
                    attempt += 1;
                }
                Err(e) => return Err(e.into()),
                Ok(view) => return Ok(view),
            }
        }
    }

    /// One transactional submit attempt. Runs entirely inside `run_atomic`.
    fn submit_tx(store: &S, submission: &Submission) -> Result<ConsolidatedView, StoreError> {
        match classify(store, submission)? {
            MatchOutcome::NoMatch => {
                let created = store.insert(NewContact::primary(
                    submission.email.clone(),
                    submission.phone_number.clone(),
                ))?;
                clog!(
                    "submit: no match, created primary {}",
                    logging::contact_id(created.id)
                );
                build_view(store, &created, &[], submission)
            }
            MatchOutcome::Single(matched) => {
                let primary = resolve_primary(store, &matched)?;
                if introduces_new_info(store, &primary, submission)? {
                    let created = store.insert(NewContact::secondary(
                        submission.email.clone(),
                        submission.phone_number.clone(),
                        primary.id,
                    ))?;
                    clog!(
                        "submit: single match on {}, created secondary {} under {}",
                        logging::contact_id(matched.id),
                        logging::contact_id(created.id),
                        logging::contact_id(primary.id)
                    );
                } else {
                    clog!(
                        "submit: exact duplicate of group {}, no write",
                        logging::contact_id(primary.id)
                    );
                }
                build_view(store, &primary, &[], submission)
            }
            MatchOutcome::Dual(a, b) => {
                let primary_a = resolve_primary(store, &a)?;
                let primary_b = resolve_primary(store, &b)?;
                let kind = dual_kind(&a, &b, primary_a.id == primary_b.id);

                let primary = if kind == DualKind::SameGroup {
                    clog!(
                        "submit: dual match within group {}, no restructuring",
                        logging::contact_id(primary_a.id)
                    );
                    primary_a
                } else {
                    merge_groups(store, kind, primary_a, primary_b)?
                };
                build_view(store, &primary, &[&a, &b], submission)
            }
        }
    }
}

// ---------------------------------------------------------------------------
// Merge engine
// ---------------------------------------------------------------------------

/// Unify two distinct groups, identified by their resolved primaries.
///
/// Groups are ordered by their primaries' age — never by raw linked ids,
/// which can misorder partially migrated data. The newer group (its former
/// primary and all its secondaries) is repointed at the older primary in one
/// predicate update, which both demotes the newer primary and re-parents its
/// secondaries, keeping the star flat.
fn merge_groups<S: ContactStore>(
    store: &S,
    kind: DualKind,
    primary_a: ContactRecord,
    primary_b: ContactRecord,
) -> Result<ContactRecord, StoreError> {
    let (older, newer) = ordered_by_age(primary_a, primary_b);
    let moved = store.relink_group(newer.id, older.id)?;
    clog!(
        "merge: {kind:?} repointed {moved} record(s) from group {} at {}",
        logging::contact_id(newer.id),
        logging::contact_id(older.id)
    );
    Ok(older)
}

/// Whether the submission carries an email or phone not yet stored anywhere
/// in the group. Checking the primary alone is not enough: the matched value
/// may live on a secondary, and a repeated submission must stay idempotent.
fn introduces_new_info<S: ContactStore>(
    store: &S,
    primary: &ContactRecord,
    submission: &Submission,
) -> Result<bool, StoreError> {
    let mut emails = Vec::new();
    let mut phones = Vec::new();
    push_value(&mut emails, primary.email.as_ref());
    push_value(&mut phones, primary.phone_number.as_ref());
    for id in store.secondaries_of(primary.id)? {
        let member = store.find_by_id(id)?;
        push_value(&mut emails, member.email.as_ref());
        push_value(&mut phones, member.phone_number.as_ref());
    }

    let new_email = submission
        .email
        .as_ref()
        .is_some_and(|e| !emails.contains(e));
    let new_phone = submission
        .phone_number
        .as_ref()
        .is_some_and(|p| !phones.contains(p));
    Ok(new_email || new_phone)
}

// ---------------------------------------------------------------------------
// View assembly
// ---------------------------------------------------------------------------

/// Build the consolidated view for a group: the primary's own values first,
/// then any matched records' values, then the request's, deduplicated in
/// first-seen order; secondary ids ascending.
fn build_view<S: ContactStore>(
    store: &S,
    primary: &ContactRecord,
    matched: &[&ContactRecord],
    submission: &Submission,
) -> Result<ConsolidatedView, StoreError> {
    let mut emails = Vec::new();
    let mut phone_numbers = Vec::new();

    push_value(&mut emails, primary.email.as_ref());
    push_value(&mut phone_numbers, primary.phone_number.as_ref());
    for record in matched {
        push_value(&mut emails, record.email.as_ref());
        push_value(&mut phone_numbers, record.phone_number.as_ref());
    }
    push_value(&mut emails, submission.email.as_ref());
    push_value(&mut phone_numbers, submission.phone_number.as_ref());

    Ok(ConsolidatedView {
        primary_contact_id: primary.id,
        emails,
        phone_numbers,
        secondary_contact_ids: store.secondaries_of(primary.id)?,
    })
}

fn push_value(values: &mut Vec<String>, value: Option<&String>) {
    if let Some(v) = value {
        if !values.contains(v) {
            values.push(v.clone());
        }
    }
}
