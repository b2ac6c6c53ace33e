//! Evaluator scoring.
//!
//! Four criteria scored 0-10; the overall score is the sum as a percentage of
//! 40. The grade is derived from that percentage unless the evaluator
//! overrides it.

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::WorkflowError;
use crate::state_machine::state::{SubmissionId, UnknownVariant, UserId};

pub const MAX_CRITERION_SCORE: u8 = 10;
const MAX_TOTAL: u32 = 4 * MAX_CRITERION_SCORE as u32;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Scores {
    pub innovation: u8,
    pub feasibility: u8,
    pub market_potential: u8,
    pub technical_merit: u8,
}

impl Scores {
    pub fn validate(&self) -> Result<(), WorkflowError> {
        for (name, value) in [
            ("innovation", self.innovation),
            ("feasibility", self.feasibility),
            ("market potential", self.market_potential),
            ("technical merit", self.technical_merit),
        ] {
            if value > MAX_CRITERION_SCORE {
                return Err(WorkflowError::validation(format!(
                    "{} score must be between 0 and {}, got {}",
                    name, MAX_CRITERION_SCORE, value
                )));
            }
        }
        Ok(())
    }

    pub fn total(&self) -> u32 {
        u32::from(self.innovation)
            + u32::from(self.feasibility)
            + u32::from(self.market_potential)
            + u32::from(self.technical_merit)
    }

    /// Overall score as a percentage, rounded to one decimal place.
    pub fn overall_percent(&self) -> f64 {
        let raw = f64::from(self.total()) / f64::from(MAX_TOTAL) * 100.0;
        (raw * 10.0).round() / 10.0
    }

    pub fn grade(&self) -> Grade {
        Grade::from_percent(self.overall_percent())
    }
}

/// Letter grade bands.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Grade {
    #[serde(rename = "A+")]
    APlus,
    #[serde(rename = "A")]
    A,
    #[serde(rename = "A-")]
    AMinus,
    #[serde(rename = "B+")]
    BPlus,
    #[serde(rename = "B")]
    B,
    #[serde(rename = "B-")]
    BMinus,
    #[serde(rename = "C+")]
    CPlus,
    #[serde(rename = "C")]
    C,
    #[serde(rename = "C-")]
    CMinus,
    #[serde(rename = "F")]
    F,
}

impl Grade {
    const BANDS: [(f64, Grade); 9] = [
        (90.0, Grade::APlus),
        (85.0, Grade::A),
        (80.0, Grade::AMinus),
        (75.0, Grade::BPlus),
        (70.0, Grade::B),
        (65.0, Grade::BMinus),
        (60.0, Grade::CPlus),
        (55.0, Grade::C),
        (50.0, Grade::CMinus),
    ];

    pub fn from_percent(percent: f64) -> Self {
        Self::BANDS
            .iter()
            .find(|(floor, _)| percent >= *floor)
            .map(|(_, grade)| *grade)
            .unwrap_or(Grade::F)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::APlus => "A+",
            Self::A => "A",
            Self::AMinus => "A-",
            Self::BPlus => "B+",
            Self::B => "B",
            Self::BMinus => "B-",
            Self::CPlus => "C+",
            Self::C => "C",
            Self::CMinus => "C-",
            Self::F => "F",
        }
    }
}

impl fmt::Display for Grade {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Grade {
    type Err = UnknownVariant;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::BANDS
            .iter()
            .map(|(_, g)| *g)
            .chain(std::iter::once(Grade::F))
            .find(|g| g.as_str() == s)
            .ok_or_else(|| UnknownVariant {
                kind: "grade",
                value: s.to_string(),
            })
    }
}

/// What the evaluator decided.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EvaluationDecision {
    Approved,
    Revision,
    Rejected,
}

impl EvaluationDecision {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Approved => "approved",
            Self::Revision => "revision",
            Self::Rejected => "rejected",
        }
    }
}

impl FromStr for EvaluationDecision {
    type Err = UnknownVariant;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "approved" => Ok(Self::Approved),
            "revision" => Ok(Self::Revision),
            "rejected" => Ok(Self::Rejected),
            other => Err(UnknownVariant {
                kind: "evaluation decision",
                value: other.to_string(),
            }),
        }
    }
}

/// Scores as submitted with an evaluator decision.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ScoreSheet {
    pub scores: Scores,
    #[serde(default)]
    pub grade_override: Option<Grade>,
}

impl ScoreSheet {
    pub fn grade(&self) -> Grade {
        self.grade_override.unwrap_or_else(|| self.scores.grade())
    }
}

/// A recorded evaluation. Several may exist per submission (one per round).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Evaluation {
    pub submission_id: SubmissionId,
    pub evaluator_id: UserId,
    pub scores: Scores,
    pub grade: Grade,
    pub remarks: Option<String>,
    pub decision: EvaluationDecision,
    pub created_at: DateTime<Utc>,
}

impl Evaluation {
    pub fn overall_percent(&self) -> f64 {
        self.scores.overall_percent()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn scores(a: u8, b: u8, c: u8, d: u8) -> Scores {
        Scores {
            innovation: a,
            feasibility: b,
            market_potential: c,
            technical_merit: d,
        }
    }

    #[test]
    fn test_overall_percent() {
        assert_eq!(scores(10, 10, 10, 10).overall_percent(), 100.0);
        assert_eq!(scores(8, 7, 9, 6).overall_percent(), 75.0);
        assert_eq!(scores(0, 0, 0, 0).overall_percent(), 0.0);
        assert_eq!(scores(7, 7, 7, 6).overall_percent(), 67.5);
    }

    #[test]
    fn test_grade_bands() {
        assert_eq!(Grade::from_percent(100.0), Grade::APlus);
        assert_eq!(Grade::from_percent(90.0), Grade::APlus);
        assert_eq!(Grade::from_percent(89.9), Grade::A);
        assert_eq!(Grade::from_percent(75.0), Grade::BPlus);
        assert_eq!(Grade::from_percent(50.0), Grade::CMinus);
        assert_eq!(Grade::from_percent(49.9), Grade::F);
    }

    #[test]
    fn test_out_of_range_score_rejected() {
        let err = scores(11, 0, 0, 0).validate().unwrap_err();
        assert!(err.to_string().contains("innovation"));
    }

    #[test]
    fn test_grade_override_wins() {
        let sheet = ScoreSheet {
            scores: scores(2, 2, 2, 2),
            grade_override: Some(Grade::B),
        };
        assert_eq!(sheet.grade(), Grade::B);
    }

    #[test]
    fn test_grade_serde_uses_letters() {
        assert_eq!(serde_json::to_string(&Grade::AMinus).unwrap(), "\"A-\"");
        assert_eq!("C+".parse::<Grade>(), Ok(Grade::CPlus));
        assert_eq!("F".parse::<Grade>(), Ok(Grade::F));
    }

    proptest! {
        #[test]
        fn grade_is_monotonic_in_total(
            a in 0u8..=10, b in 0u8..=10, c in 0u8..=10, d in 0u8..=10,
        ) {
            let s = scores(a, b, c, d);
            prop_assert!(s.validate().is_ok());
            let percent = s.overall_percent();
            prop_assert!((0.0..=100.0).contains(&percent));
            // Bands are ordered best-first, so a higher percentage never yields a worse grade.
            let higher = Grade::from_percent((percent + 5.0).min(100.0));
            let rank = |g: Grade| Grade::BANDS.iter().position(|(_, x)| *x == g).unwrap_or(9);
            prop_assert!(rank(higher) <= rank(s.grade()));
        }
    }
}
