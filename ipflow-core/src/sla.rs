//! Stage deadlines.
//!
//! Pure calculations over stage instances: due dates from policy, days
//! remaining, classification, extension and sweep decisions. Persistence of
//! instances lives in the server crate.

use std::collections::BTreeMap;

use chrono::{DateTime, Datelike, Duration, Utc, Weekday};
use serde::{Deserialize, Serialize};

use crate::error::WorkflowError;
use crate::state_machine::state::{StageName, SubmissionId, UnknownVariant, UserId};

const MILLIS_PER_DAY: i64 = 24 * 60 * 60 * 1000;

/// Days remaining at or below which an open stage counts as due soon.
pub const DUE_SOON_DAYS: i64 = 2;

/// Minimum gap between two overdue notifications for the same instance.
pub const NOTIFY_INTERVAL_HOURS: i64 = 24;

/// Upper bound for any day count in a policy. Keeps deadline arithmetic
/// inside chrono's range however the policy file is written.
pub const MAX_POLICY_DAYS: u32 = 3650;

/// Upper bound for `max_extensions`.
pub const MAX_EXTENSIONS: u32 = 100;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum StageInstanceStatus {
    Open,
    Overdue,
    Expired,
    Completed,
}

impl StageInstanceStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Open => "OPEN",
            Self::Overdue => "OVERDUE",
            Self::Expired => "EXPIRED",
            Self::Completed => "COMPLETED",
        }
    }

    pub fn is_open(&self) -> bool {
        matches!(self, Self::Open | Self::Overdue)
    }
}

impl std::str::FromStr for StageInstanceStatus {
    type Err = UnknownVariant;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "OPEN" => Ok(Self::Open),
            "OVERDUE" => Ok(Self::Overdue),
            "EXPIRED" => Ok(Self::Expired),
            "COMPLETED" => Ok(Self::Completed),
            other => Err(UnknownVariant {
                kind: "stage instance status",
                value: other.to_string(),
            }),
        }
    }
}

/// How a stage instance was closed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum CloseStatus {
    Completed,
    Expired,
}

impl CloseStatus {
    pub fn instance_status(&self) -> StageInstanceStatus {
        match self {
            Self::Completed => StageInstanceStatus::Completed,
            Self::Expired => StageInstanceStatus::Expired,
        }
    }
}

/// One tracking record per (submission, stage) activation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StageInstance {
    /// Assigned by the repository on insert.
    pub id: i64,
    pub submission_id: SubmissionId,
    pub stage: StageName,
    pub assigned_user_id: Option<UserId>,
    pub created_at: DateTime<Utc>,
    pub due_at: DateTime<Utc>,
    pub extended_until: Option<DateTime<Utc>>,
    pub extensions_used: u32,
    pub status: StageInstanceStatus,
    pub closed_at: Option<DateTime<Utc>>,
    pub notified_at: Option<DateTime<Utc>>,
}

impl StageInstance {
    /// A fresh `OPEN` instance due according to `policy`.
    pub fn open(
        submission_id: SubmissionId,
        stage: StageName,
        assigned_user_id: Option<UserId>,
        policy: &StagePolicy,
        now: DateTime<Utc>,
    ) -> Self {
        Self {
            id: 0,
            submission_id,
            stage,
            assigned_user_id,
            created_at: now,
            due_at: compute_due(now, policy),
            extended_until: None,
            extensions_used: 0,
            status: StageInstanceStatus::Open,
            closed_at: None,
            notified_at: None,
        }
    }

    /// `extended_until` supersedes `due_at`.
    pub fn effective_due(&self) -> DateTime<Utc> {
        self.extended_until.unwrap_or(self.due_at)
    }

    pub fn is_open(&self) -> bool {
        self.status.is_open()
    }

    pub fn close(&mut self, close_status: CloseStatus, now: DateTime<Utc>) {
        self.status = close_status.instance_status();
        self.closed_at = Some(now);
    }
}

/// Derived deadline classification.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum SlaStatus {
    OnTrack,
    DueSoon,
    Overdue,
    Expired,
}

impl SlaStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::OnTrack => "on-track",
            Self::DueSoon => "due-soon",
            Self::Overdue => "overdue",
            Self::Expired => "expired",
        }
    }
}

/// What `get_sla_status` returns for the submission's latest stage.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SlaSnapshot {
    pub stage: StageName,
    pub status: SlaStatus,
    pub due_date: DateTime<Utc>,
    pub days_remaining: i64,
}

impl SlaSnapshot {
    pub fn of(instance: &StageInstance, now: DateTime<Utc>) -> Self {
        let measured_at = match instance.status {
            StageInstanceStatus::Completed | StageInstanceStatus::Expired => {
                instance.closed_at.unwrap_or(now)
            }
            _ => now,
        };
        Self {
            stage: instance.stage,
            status: classify(instance, now),
            due_date: instance.effective_due(),
            days_remaining: days_remaining(instance.effective_due(), measured_at),
        }
    }
}

/// Per-stage turnaround policy.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StagePolicy {
    pub stage: StageName,
    pub duration_days: u32,
    #[serde(default)]
    pub grace_days: u32,
    /// Count only Monday-Friday when computing due dates.
    #[serde(default)]
    pub business_days: bool,
    #[serde(default)]
    pub allow_extensions: bool,
    #[serde(default)]
    pub max_extensions: u32,
    #[serde(default)]
    pub extension_days: u32,
}

impl StagePolicy {
    fn calendar(stage: StageName, duration_days: u32, grace_days: u32) -> Self {
        Self {
            stage,
            duration_days,
            grace_days,
            business_days: false,
            allow_extensions: false,
            max_extensions: 0,
            extension_days: 0,
        }
    }

    fn with_extensions(mut self, max_extensions: u32, extension_days: u32) -> Self {
        self.allow_extensions = true;
        self.max_extensions = max_extensions;
        self.extension_days = extension_days;
        self
    }

    pub fn default_for(stage: StageName) -> Self {
        match stage {
            StageName::SupervisorReview => Self::calendar(stage, 7, 2).with_extensions(2, 3),
            StageName::Evaluation => Self::calendar(stage, 10, 2).with_extensions(2, 5),
            StageName::RevisionRequested => Self::calendar(stage, 14, 3).with_extensions(1, 7),
            StageName::AcademicPresentationMaterials => Self {
                business_days: true,
                ..Self::calendar(stage, 10, 3).with_extensions(1, 5)
            },
            StageName::CertificateIssued => Self::calendar(stage, 5, 0),
        }
    }

    pub fn validate(&self) -> Result<(), WorkflowError> {
        if self.duration_days < 1 {
            return Err(WorkflowError::validation(format!(
                "{}: duration must be at least 1 day",
                self.stage
            )));
        }
        for (what, days) in [
            ("duration", self.duration_days),
            ("grace period", self.grace_days),
            ("extension", self.extension_days),
        ] {
            if days > MAX_POLICY_DAYS {
                return Err(WorkflowError::validation(format!(
                    "{}: {} must be at most {} days",
                    self.stage, what, MAX_POLICY_DAYS
                )));
            }
        }
        if self.max_extensions > MAX_EXTENSIONS {
            return Err(WorkflowError::validation(format!(
                "{}: at most {} extensions are allowed",
                self.stage, MAX_EXTENSIONS
            )));
        }
        if self.allow_extensions {
            if self.max_extensions < 1 {
                return Err(WorkflowError::validation(format!(
                    "{}: max extensions must be at least 1 when extensions are allowed",
                    self.stage
                )));
            }
            if self.extension_days < 1 {
                return Err(WorkflowError::validation(format!(
                    "{}: extension must be at least 1 day when extensions are allowed",
                    self.stage
                )));
            }
        }
        Ok(())
    }
}

/// Policies for every stage. Missing stages fall back to the defaults.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SlaPolicies {
    policies: BTreeMap<StageName, StagePolicy>,
}

impl Default for SlaPolicies {
    fn default() -> Self {
        Self {
            policies: StageName::ALL
                .iter()
                .map(|stage| (*stage, StagePolicy::default_for(*stage)))
                .collect(),
        }
    }
}

impl SlaPolicies {
    /// Overlay `overrides` on the defaults, validating each.
    pub fn with_overrides(
        overrides: impl IntoIterator<Item = StagePolicy>,
    ) -> Result<Self, WorkflowError> {
        let mut policies = Self::default();
        for policy in overrides {
            policy.validate()?;
            policies.policies.insert(policy.stage, policy);
        }
        Ok(policies)
    }

    /// Parse a JSON array of stage policies.
    pub fn from_json(json: &str) -> Result<Self, WorkflowError> {
        let overrides: Vec<StagePolicy> = serde_json::from_str(json)
            .map_err(|e| WorkflowError::validation(format!("invalid SLA policy file: {}", e)))?;
        Self::with_overrides(overrides)
    }

    pub fn get(&self, stage: StageName) -> StagePolicy {
        self.policies
            .get(&stage)
            .cloned()
            .unwrap_or_else(|| StagePolicy::default_for(stage))
    }

    pub fn iter(&self) -> impl Iterator<Item = &StagePolicy> {
        self.policies.values()
    }
}

fn is_weekend(at: DateTime<Utc>) -> bool {
    matches!(at.weekday(), Weekday::Sat | Weekday::Sun)
}

/// Move `days` days forward, skipping weekends when `business` is set.
pub fn add_days(start: DateTime<Utc>, days: u32, business: bool) -> DateTime<Utc> {
    if !business {
        return start + Duration::days(i64::from(days));
    }
    let mut at = start;
    let mut counted = 0;
    while counted < days {
        at += Duration::days(1);
        if !is_weekend(at) {
            counted += 1;
        }
    }
    at
}

pub fn compute_due(start: DateTime<Utc>, policy: &StagePolicy) -> DateTime<Utc> {
    add_days(start, policy.duration_days, policy.business_days)
}

/// Whole days until `due`, rounded up. Zero or negative once due has passed.
pub fn days_remaining(due: DateTime<Utc>, now: DateTime<Utc>) -> i64 {
    let millis = (due - now).num_milliseconds();
    let whole = millis.div_euclid(MILLIS_PER_DAY);
    if millis.rem_euclid(MILLIS_PER_DAY) > 0 {
        whole + 1
    } else {
        whole
    }
}

fn classify_days(days: i64) -> SlaStatus {
    if days > DUE_SOON_DAYS {
        SlaStatus::OnTrack
    } else if days > 0 {
        SlaStatus::DueSoon
    } else {
        SlaStatus::Overdue
    }
}

/// Classify an instance at `now`.
///
/// Completed instances are judged at the moment they closed, so a stage that
/// finished on time stays on-track forever.
pub fn classify(instance: &StageInstance, now: DateTime<Utc>) -> SlaStatus {
    match instance.status {
        StageInstanceStatus::Expired => SlaStatus::Expired,
        StageInstanceStatus::Completed => {
            let closed = instance.closed_at.unwrap_or(now);
            classify_days(days_remaining(instance.effective_due(), closed))
        }
        StageInstanceStatus::Open | StageInstanceStatus::Overdue => {
            classify_days(days_remaining(instance.effective_due(), now))
        }
    }
}

/// New deadline after one extension, or why none is possible.
pub fn extended_due(
    instance: &StageInstance,
    policy: &StagePolicy,
) -> Result<DateTime<Utc>, WorkflowError> {
    if !instance.is_open() {
        return Err(WorkflowError::validation(format!(
            "{} stage is already closed",
            instance.stage
        )));
    }
    if !policy.allow_extensions {
        return Err(WorkflowError::validation(format!(
            "extensions are not allowed for the {} stage",
            instance.stage
        )));
    }
    if instance.extensions_used >= policy.max_extensions {
        return Err(WorkflowError::validation(format!(
            "the {} stage has used all {} extension(s)",
            instance.stage, policy.max_extensions
        )));
    }
    Ok(add_days(
        instance.effective_due(),
        policy.extension_days,
        policy.business_days,
    ))
}

/// Apply one extension in place. An overdue instance pushed past `now` reopens.
pub fn extend(
    instance: &mut StageInstance,
    policy: &StagePolicy,
    now: DateTime<Utc>,
) -> Result<(), WorkflowError> {
    let until = extended_due(instance, policy)?;
    instance.extended_until = Some(until);
    instance.extensions_used += 1;
    if instance.status == StageInstanceStatus::Overdue && until > now {
        instance.status = StageInstanceStatus::Open;
    }
    Ok(())
}

/// What the overdue sweep should do with an instance.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SweepAction {
    /// Open and past due: mark `OVERDUE`.
    MarkOverdue,
    /// Already `OVERDUE`, not yet expired: only a reminder may be due.
    StillOverdue,
    /// Applicant stage past due plus grace: close as `EXPIRED`.
    Expire,
}

pub fn sweep_action(
    instance: &StageInstance,
    policy: &StagePolicy,
    now: DateTime<Utc>,
) -> Option<SweepAction> {
    if !instance.is_open() || now <= instance.effective_due() {
        return None;
    }
    let grace_deadline = instance.effective_due() + Duration::days(i64::from(policy.grace_days));
    if instance.stage.is_applicant_stage() && now > grace_deadline {
        return Some(SweepAction::Expire);
    }
    match instance.status {
        StageInstanceStatus::Open => Some(SweepAction::MarkOverdue),
        _ => Some(SweepAction::StillOverdue),
    }
}

/// Rate limit: at most one overdue notification per instance per day.
pub fn should_notify(notified_at: Option<DateTime<Utc>>, now: DateTime<Utc>) -> bool {
    match notified_at {
        None => true,
        Some(at) => at + Duration::hours(NOTIFY_INTERVAL_HOURS) < now,
    }
}

/// Whole days past the effective due, rounded up.
pub fn days_overdue(instance: &StageInstance, now: DateTime<Utc>) -> i64 {
    -days_remaining(instance.effective_due(), now)
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use proptest::prelude::*;

    fn monday() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2025, 3, 3, 9, 0, 0).unwrap()
    }

    fn instance(stage: StageName, now: DateTime<Utc>) -> StageInstance {
        StageInstance::open(
            SubmissionId::from("sub-1"),
            stage,
            Some(UserId::from("user-1")),
            &StagePolicy::default_for(stage),
            now,
        )
    }

    #[test]
    fn test_default_policies_validate() {
        for policy in SlaPolicies::default().iter() {
            assert!(policy.validate().is_ok(), "{:?}", policy);
        }
        assert!(!StagePolicy::default_for(StageName::CertificateIssued).allow_extensions);
    }

    #[test]
    fn test_policy_validation() {
        let mut policy = StagePolicy::default_for(StageName::Evaluation);
        policy.duration_days = 0;
        assert!(policy.validate().is_err());

        let mut policy = StagePolicy::default_for(StageName::Evaluation);
        policy.max_extensions = 0;
        assert!(policy.validate().is_err());

        let mut policy = StagePolicy::default_for(StageName::Evaluation);
        policy.allow_extensions = false;
        policy.max_extensions = 0;
        policy.extension_days = 0;
        assert!(policy.validate().is_ok());
    }

    #[test]
    fn test_policy_overrides_from_json() {
        let policies = SlaPolicies::from_json(
            r#"[{"stage": "evaluation", "duration_days": 3, "grace_days": 1}]"#,
        )
        .unwrap();
        assert_eq!(policies.get(StageName::Evaluation).duration_days, 3);
        assert_eq!(policies.get(StageName::SupervisorReview).duration_days, 7);

        assert!(SlaPolicies::from_json(r#"[{"stage": "evaluation", "duration_days": 0}]"#).is_err());
        assert!(SlaPolicies::from_json("not json").is_err());
    }

    #[test]
    fn test_policy_day_counts_are_bounded() {
        let mut policy = StagePolicy::default_for(StageName::Evaluation);
        policy.duration_days = MAX_POLICY_DAYS;
        assert!(policy.validate().is_ok());
        policy.duration_days = u32::MAX;
        assert!(policy.validate().is_err());

        let mut policy = StagePolicy::default_for(StageName::RevisionRequested);
        policy.grace_days = MAX_POLICY_DAYS + 1;
        assert!(policy.validate().is_err());

        let mut policy = StagePolicy::default_for(StageName::SupervisorReview);
        policy.extension_days = u32::MAX;
        assert!(policy.validate().is_err());

        let mut policy = StagePolicy::default_for(StageName::SupervisorReview);
        policy.max_extensions = u32::MAX;
        assert!(policy.validate().is_err());

        assert!(SlaPolicies::from_json(
            r#"[{"stage": "evaluation", "duration_days": 4294967295}]"#
        )
        .is_err());
    }

    #[test]
    fn test_business_days_skip_weekend() {
        // Monday + 10 business days = Monday two weeks later.
        let due = add_days(monday(), 10, true);
        assert_eq!(due, monday() + Duration::days(14));

        let friday = monday() + Duration::days(4);
        assert_eq!(add_days(friday, 1, true), monday() + Duration::days(7));
    }

    #[test]
    fn test_days_remaining_rounds_up() {
        let now = monday();
        assert_eq!(days_remaining(now + Duration::hours(1), now), 1);
        assert_eq!(days_remaining(now + Duration::days(2), now), 2);
        assert_eq!(days_remaining(now, now), 0);
        assert_eq!(days_remaining(now - Duration::hours(1), now), 0);
        assert_eq!(days_remaining(now - Duration::hours(25), now), -1);
    }

    #[test]
    fn test_classification_boundaries() {
        let start = monday();
        let inst = instance(StageName::SupervisorReview, start);
        assert_eq!(inst.due_at, start + Duration::days(7));

        assert_eq!(classify(&inst, start), SlaStatus::OnTrack);
        assert_eq!(classify(&inst, start + Duration::days(5)), SlaStatus::DueSoon);
        assert_eq!(
            classify(&inst, start + Duration::days(5) - Duration::minutes(1)),
            SlaStatus::OnTrack
        );
        assert_eq!(classify(&inst, start + Duration::days(7)), SlaStatus::Overdue);
    }

    #[test]
    fn test_extension_supersedes_due() {
        let start = monday();
        let mut inst = instance(StageName::SupervisorReview, start);
        let policy = StagePolicy::default_for(StageName::SupervisorReview);

        extend(&mut inst, &policy, start).unwrap();
        assert_eq!(inst.effective_due(), start + Duration::days(10));
        assert_eq!(inst.extensions_used, 1);

        extend(&mut inst, &policy, start).unwrap();
        let err = extend(&mut inst, &policy, start).unwrap_err();
        assert!(err.to_string().contains("used all 2"));
    }

    #[test]
    fn test_extension_reopens_overdue_instance() {
        let start = monday();
        let mut inst = instance(StageName::Evaluation, start);
        let policy = StagePolicy::default_for(StageName::Evaluation);
        let late = start + Duration::days(11);
        inst.status = StageInstanceStatus::Overdue;

        extend(&mut inst, &policy, late).unwrap();
        assert_eq!(inst.status, StageInstanceStatus::Open);
    }

    #[test]
    fn test_certificate_stage_cannot_be_extended() {
        let mut inst = instance(StageName::CertificateIssued, monday());
        let policy = StagePolicy::default_for(StageName::CertificateIssued);
        assert!(extend(&mut inst, &policy, monday()).is_err());
    }

    #[test]
    fn test_sweep_marks_reviewer_stage_overdue_never_expired() {
        let start = monday();
        let inst = instance(StageName::SupervisorReview, start);
        let policy = StagePolicy::default_for(StageName::SupervisorReview);

        assert_eq!(sweep_action(&inst, &policy, inst.due_at), None);
        assert_eq!(
            sweep_action(&inst, &policy, start + Duration::days(100)),
            Some(SweepAction::MarkOverdue)
        );
    }

    #[test]
    fn test_sweep_expires_applicant_stage_after_grace() {
        let start = monday();
        let mut inst = instance(StageName::RevisionRequested, start);
        let policy = StagePolicy::default_for(StageName::RevisionRequested);
        let due = inst.due_at;

        assert_eq!(
            sweep_action(&inst, &policy, due + Duration::days(1)),
            Some(SweepAction::MarkOverdue)
        );
        inst.status = StageInstanceStatus::Overdue;
        assert_eq!(
            sweep_action(&inst, &policy, due + Duration::days(3)),
            Some(SweepAction::StillOverdue)
        );
        assert_eq!(
            sweep_action(&inst, &policy, due + Duration::days(3) + Duration::seconds(1)),
            Some(SweepAction::Expire)
        );
    }

    #[test]
    fn test_notify_rate_limit() {
        let now = monday();
        assert!(should_notify(None, now));
        assert!(!should_notify(Some(now - Duration::hours(24)), now));
        assert!(should_notify(Some(now - Duration::hours(25)), now));
    }

    #[test]
    fn test_completed_instance_judged_at_close() {
        let start = monday();
        let mut inst = instance(StageName::SupervisorReview, start);
        inst.close(CloseStatus::Completed, start + Duration::days(1));
        assert_eq!(classify(&inst, start + Duration::days(60)), SlaStatus::OnTrack);

        let snapshot = SlaSnapshot::of(&inst, start + Duration::days(60));
        assert_eq!(snapshot.days_remaining, 6);
    }

    #[test]
    fn test_expired_is_terminal_classification() {
        let mut inst = instance(StageName::RevisionRequested, monday());
        inst.close(CloseStatus::Expired, monday() + Duration::days(30));
        assert_eq!(classify(&inst, monday()), SlaStatus::Expired);
        assert!(!inst.is_open());
    }

    proptest! {
        #[test]
        fn classification_is_monotonic_in_time(
            stage_idx in 0usize..5,
            offsets in proptest::collection::vec(0i64..60 * 24 * 60, 2..20),
        ) {
            let stage = StageName::ALL[stage_idx];
            let start = monday();
            let inst = instance(stage, start);
            let mut sorted = offsets;
            sorted.sort_unstable();

            let statuses: Vec<SlaStatus> = sorted
                .iter()
                .map(|m| classify(&inst, start + Duration::minutes(*m)))
                .collect();
            for pair in statuses.windows(2) {
                prop_assert!(pair[0] <= pair[1], "{:?} then {:?}", pair[0], pair[1]);
            }
        }

        #[test]
        fn days_remaining_is_non_increasing(a in -100_000i64..100_000, b in -100_000i64..100_000) {
            let due = monday();
            let (early, late) = if a <= b { (a, b) } else { (b, a) };
            prop_assert!(
                days_remaining(due, due + Duration::minutes(early))
                    >= days_remaining(due, due + Duration::minutes(late))
            );
        }
    }
}
