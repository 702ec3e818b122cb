use serde::ser::SerializeStruct;
use serde::{Deserialize, Serialize, Serializer};
use thiserror::Error;

/// Qualitative achievement band. Variant order is the achievement order,
/// so `Band::AI < Band::AA`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum Band {
    AI,
    AF,
    AS,
    AA,
}

impl Band {
    pub const ALL: [Band; 4] = [Band::AA, Band::AS, Band::AF, Band::AI];

    pub fn as_str(self) -> &'static str {
        match self {
            Band::AA => "AA",
            Band::AS => "AS",
            Band::AF => "AF",
            Band::AI => "AI",
        }
    }

    pub fn description(self) -> &'static str {
        match self {
            Band::AA => "Aprendizaje Avanzado",
            Band::AS => "Aprendizaje Satisfactorio",
            Band::AF => "Aprendizaje Fundamental",
            Band::AI => "Aprendizaje Inicial",
        }
    }

    pub fn parse(s: &str) -> Option<Band> {
        match s.trim().to_ascii_uppercase().as_str() {
            "AA" => Some(Band::AA),
            "AS" => Some(Band::AS),
            "AF" => Some(Band::AF),
            "AI" => Some(Band::AI),
            _ => None,
        }
    }
}

/// Placeholder shown wherever no qualitative grade exists yet.
pub const NO_GRADE: &str = "-";

#[derive(Debug, Clone, Serialize)]
pub struct CalcError {
    pub code: String,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub details: Option<serde_json::Value>,
}

impl CalcError {
    pub fn new(code: &str, message: impl Into<String>) -> Self {
        Self {
            code: code.to_string(),
            message: message.into(),
            details: None,
        }
    }

    pub fn with_details(mut self, details: serde_json::Value) -> Self {
        self.details = Some(details);
        self
    }
}

/// Rejections raised by the validating write path. The rollup functions
/// themselves never validate.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum ScoreError {
    #[error("score must be a finite number")]
    NotFinite,
    #[error("score {value} is outside the 0..=100 range")]
    OutOfRange { value: f64 },
}

impl From<ScoreError> for CalcError {
    fn from(e: ScoreError) -> Self {
        let details = match &e {
            ScoreError::NotFinite => None,
            ScoreError::OutOfRange { value } => Some(serde_json::json!({ "value": value })),
        };
        CalcError {
            code: "bad_params".to_string(),
            message: e.to_string(),
            details,
        }
    }
}

pub fn validate_score(value: f64) -> Result<f64, ScoreError> {
    if !value.is_finite() {
        return Err(ScoreError::NotFinite);
    }
    if !(0.0..=100.0).contains(&value) {
        return Err(ScoreError::OutOfRange { value });
    }
    Ok(value)
}

/// `Math.round` semantics: halves go up.
pub fn round_half_up(x: f64) -> f64 {
    // `x + 0.5` can itself round up, e.g. for the f64 just below 0.5.
    let floor = x.floor();
    if x - floor >= 0.5 {
        floor + 1.0
    } else {
        floor
    }
}

/// 1-decimal rounding with halves going up: `Int(10*x + 0.5) / 10`
pub fn round_off_1_decimal(x: f64) -> f64 {
    ((10.0 * x) + 0.5).floor() / 10.0
}

/// Renders a value the way `toFixed(1)` prints it on the certificate.
pub fn format_one_decimal(x: f64) -> String {
    format!("{:.1}", round_off_1_decimal(x))
}

/// One evaluation result for a period. `quantitative: None` means the
/// period has not been graded; an explicit `Some(0.0)` is a real zero.
#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct PeriodScore {
    pub qualitative: Option<Band>,
    pub quantitative: Option<f64>,
}

impl PeriodScore {
    pub const UNGRADED: PeriodScore = PeriodScore {
        qualitative: None,
        quantitative: None,
    };

    pub fn new(quantitative: f64, qualitative: Band) -> Self {
        Self {
            qualitative: Some(qualitative),
            quantitative: Some(quantitative),
        }
    }

    /// Graded score banded with the canonical thresholds.
    pub fn graded(quantitative: f64) -> Self {
        BandScheme::CANONICAL.score(quantitative)
    }

    /// Decodes the backend representation, where an absent or zero
    /// quantitative value stands for "not graded yet". A missing or `-`
    /// qualitative label on a graded value is derived from `scheme`.
    pub fn from_wire(qualitative: Option<&str>, quantitative: Option<f64>, scheme: &BandScheme) -> Self {
        let label = qualitative.and_then(Band::parse);
        match quantitative {
            Some(q) if q != 0.0 => PeriodScore {
                qualitative: Some(label.unwrap_or_else(|| scheme.band(q))),
                quantitative: Some(q),
            },
            _ => PeriodScore {
                qualitative: label,
                quantitative: None,
            },
        }
    }

    pub fn is_graded(&self) -> bool {
        self.quantitative.is_some()
    }

    pub fn label(&self) -> &'static str {
        match (self.quantitative, self.qualitative) {
            (Some(_), Some(b)) => b.as_str(),
            _ => NO_GRADE,
        }
    }
}

impl Serialize for PeriodScore {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        let mut st = serializer.serialize_struct("PeriodScore", 2)?;
        st.serialize_field("qualitative", self.label())?;
        st.serialize_field("quantitative", &self.quantitative)?;
        st.end()
    }
}

/// An average that always carries a number, used by the certificate path.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Rollup {
    pub quantitative: f64,
    pub qualitative: Band,
}

impl Rollup {
    pub fn display(&self) -> String {
        format_one_decimal(self.quantitative)
    }
}

/// Lower bounds of the AA, AS and AF bands. Anything below `af_min`
/// (negative and NaN included) is AI.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BandScheme {
    pub aa_min: f64,
    pub as_min: f64,
    pub af_min: f64,
}

impl Default for BandScheme {
    fn default() -> Self {
        Self::CANONICAL
    }
}

impl BandScheme {
    pub const CANONICAL: BandScheme = BandScheme {
        aa_min: 90.0,
        as_min: 76.0,
        af_min: 60.0,
    };

    pub fn validate(&self) -> Result<(), CalcError> {
        let all_finite = [self.aa_min, self.as_min, self.af_min]
            .iter()
            .all(|v| v.is_finite());
        if !all_finite || !(self.aa_min > self.as_min && self.as_min > self.af_min) {
            return Err(CalcError::new(
                "bad_params",
                "band thresholds must satisfy aaMin > asMin > afMin",
            )
            .with_details(serde_json::json!(self)));
        }
        Ok(())
    }

    pub fn band(&self, quantitative: f64) -> Band {
        if quantitative >= self.aa_min {
            Band::AA
        } else if quantitative >= self.as_min {
            Band::AS
        } else if quantitative >= self.af_min {
            Band::AF
        } else {
            Band::AI
        }
    }

    pub fn score(&self, quantitative: f64) -> PeriodScore {
        PeriodScore::new(quantitative, self.band(quantitative))
    }

    fn rollup(&self, quantitative: f64) -> Rollup {
        Rollup {
            quantitative,
            qualitative: self.band(quantitative),
        }
    }

    fn pair_average(&self, a: Option<PeriodScore>, b: Option<PeriodScore>) -> PeriodScore {
        let a = a.and_then(|s| s.quantitative);
        let b = b.and_then(|s| s.quantitative);
        match (a, b) {
            (Some(a), Some(b)) => self.score(round_half_up((a + b) / 2.0)),
            _ => PeriodScore::UNGRADED,
        }
    }

    /// Final grade from the two semesters: both must be graded, the mean is
    /// rounded half-up to an integer.
    pub fn final_from_semesters(&self, s1: Option<PeriodScore>, s2: Option<PeriodScore>) -> PeriodScore {
        self.pair_average(s1, s2)
    }

    /// Semester grade from its two bimesters, gated and rounded like the final.
    pub fn semester_from_bimesters(&self, b1: Option<PeriodScore>, b2: Option<PeriodScore>) -> PeriodScore {
        self.pair_average(b1, b2)
    }

    /// Certificate average. Missing bimesters count as 0 and the mean is not rounded.
    pub fn final_from_bimesters(&self, bimesters: [Option<f64>; 4]) -> Rollup {
        let sum: f64 = bimesters.iter().map(|b| b.unwrap_or(0.0)).sum();
        self.rollup(sum / 4.0)
    }

    pub fn class_average(&self, subject_averages: &[f64]) -> Rollup {
        if subject_averages.is_empty() {
            return self.rollup(0.0);
        }
        let sum: f64 = subject_averages.iter().sum();
        self.rollup(sum / subject_averages.len() as f64)
    }

    /// Certificate-wide average over the subjects that have at least one
    /// non-zero bimester.
    pub fn student_certificate_average<'a, I>(&self, records: I) -> Rollup
    where
        I: IntoIterator<Item = &'a SubjectGradeRecord>,
    {
        let averages: Vec<f64> = records
            .into_iter()
            .filter(|r| subject_counts_toward_average(&r.bimester_values()))
            .map(|r| self.final_from_bimesters(r.bimester_values()).quantitative)
            .collect();
        self.class_average(&averages)
    }

    /// Row average on the sábana: mean of the graded subject finals rounded
    /// half-up, or ungraded when no final exists yet.
    pub fn promedio_from_finals<I>(&self, finals: I) -> PeriodScore
    where
        I: IntoIterator<Item = PeriodScore>,
    {
        let mut sum = 0.0_f64;
        let mut count = 0usize;
        for v in finals.into_iter().filter_map(|f| f.quantitative) {
            sum += v;
            count += 1;
        }
        if count == 0 {
            return PeriodScore::UNGRADED;
        }
        self.score(round_half_up(sum / count as f64))
    }
}

pub fn qualitative_band(quantitative: f64) -> Band {
    BandScheme::CANONICAL.band(quantitative)
}

pub fn final_from_semesters(s1: Option<PeriodScore>, s2: Option<PeriodScore>) -> PeriodScore {
    BandScheme::CANONICAL.final_from_semesters(s1, s2)
}

pub fn final_from_bimesters(b1: Option<f64>, b2: Option<f64>, b3: Option<f64>, b4: Option<f64>) -> Rollup {
    BandScheme::CANONICAL.final_from_bimesters([b1, b2, b3, b4])
}

pub fn class_average(subject_averages: &[f64]) -> Rollup {
    BandScheme::CANONICAL.class_average(subject_averages)
}

pub fn subject_counts_toward_average(bimesters: &[Option<f64>; 4]) -> bool {
    bimesters.iter().any(|b| matches!(b, Some(v) if *v != 0.0))
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Period {
    Bimestre1,
    Bimestre2,
    Bimestre3,
    Bimestre4,
    Semestre1,
    Semestre2,
}

impl Period {
    pub const ALL: [Period; 6] = [
        Period::Bimestre1,
        Period::Bimestre2,
        Period::Bimestre3,
        Period::Bimestre4,
        Period::Semestre1,
        Period::Semestre2,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            Period::Bimestre1 => "bimestre_1",
            Period::Bimestre2 => "bimestre_2",
            Period::Bimestre3 => "bimestre_3",
            Period::Bimestre4 => "bimestre_4",
            Period::Semestre1 => "semestre_1",
            Period::Semestre2 => "semestre_2",
        }
    }

    pub fn parse(s: &str) -> Option<Period> {
        Period::ALL
            .iter()
            .copied()
            .find(|p| p.as_str().eq_ignore_ascii_case(s.trim()))
    }
}

/// Per student, per subject grades as stored or fetched. Semesters may be
/// absent and derived later.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize)]
pub struct SubjectGradeRecord {
    pub bimestre_1: Option<PeriodScore>,
    pub bimestre_2: Option<PeriodScore>,
    pub bimestre_3: Option<PeriodScore>,
    pub bimestre_4: Option<PeriodScore>,
    pub semestre_1: Option<PeriodScore>,
    pub semestre_2: Option<PeriodScore>,
}

impl SubjectGradeRecord {
    pub fn get(&self, period: Period) -> Option<PeriodScore> {
        match period {
            Period::Bimestre1 => self.bimestre_1,
            Period::Bimestre2 => self.bimestre_2,
            Period::Bimestre3 => self.bimestre_3,
            Period::Bimestre4 => self.bimestre_4,
            Period::Semestre1 => self.semestre_1,
            Period::Semestre2 => self.semestre_2,
        }
    }

    pub fn set(&mut self, period: Period, score: Option<PeriodScore>) {
        let slot = match period {
            Period::Bimestre1 => &mut self.bimestre_1,
            Period::Bimestre2 => &mut self.bimestre_2,
            Period::Bimestre3 => &mut self.bimestre_3,
            Period::Bimestre4 => &mut self.bimestre_4,
            Period::Semestre1 => &mut self.semestre_1,
            Period::Semestre2 => &mut self.semestre_2,
        };
        *slot = score;
    }

    pub fn bimester_values(&self) -> [Option<f64>; 4] {
        [
            self.bimestre_1.and_then(|s| s.quantitative),
            self.bimestre_2.and_then(|s| s.quantitative),
            self.bimestre_3.and_then(|s| s.quantitative),
            self.bimestre_4.and_then(|s| s.quantitative),
        ]
    }

    /// Fills in semesters and the final. A graded stored semester wins over
    /// the derived one.
    pub fn resolve(&self, scheme: &BandScheme) -> ResolvedSubjectGrades {
        let resolve_semester = |stored: Option<PeriodScore>, a, b| match stored {
            Some(s) if s.is_graded() => (s, false),
            _ => (scheme.semester_from_bimesters(a, b), true),
        };
        let (semestre_1, s1_derived) =
            resolve_semester(self.semestre_1, self.bimestre_1, self.bimestre_2);
        let (semestre_2, s2_derived) =
            resolve_semester(self.semestre_2, self.bimestre_3, self.bimestre_4);
        ResolvedSubjectGrades {
            bimestre_1: self.bimestre_1.unwrap_or_default(),
            bimestre_2: self.bimestre_2.unwrap_or_default(),
            bimestre_3: self.bimestre_3.unwrap_or_default(),
            bimestre_4: self.bimestre_4.unwrap_or_default(),
            semestre_1,
            semestre_2,
            final_grade: scheme.final_from_semesters(Some(semestre_1), Some(semestre_2)),
            derived_semesters: [s1_derived, s2_derived],
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct ResolvedSubjectGrades {
    pub bimestre_1: PeriodScore,
    pub bimestre_2: PeriodScore,
    pub bimestre_3: PeriodScore,
    pub bimestre_4: PeriodScore,
    pub semestre_1: PeriodScore,
    pub semestre_2: PeriodScore,
    #[serde(rename = "final")]
    pub final_grade: PeriodScore,
    #[serde(rename = "derivedSemesters")]
    pub derived_semesters: [bool; 2],
}

#[cfg(test)]
mod tests {
    use super::*;

    fn wire(q: f64) -> Option<PeriodScore> {
        Some(PeriodScore::from_wire(None, Some(q), &BandScheme::CANONICAL))
    }

    #[test]
    fn band_boundaries_are_exact() {
        assert_eq!(qualitative_band(90.0), Band::AA);
        assert_eq!(qualitative_band(89.99), Band::AS);
        assert_eq!(qualitative_band(76.0), Band::AS);
        assert_eq!(qualitative_band(75.99), Band::AF);
        assert_eq!(qualitative_band(60.0), Band::AF);
        assert_eq!(qualitative_band(59.99), Band::AI);
    }

    #[test]
    fn banding_is_total_over_garbage() {
        assert_eq!(qualitative_band(-5.0), Band::AI);
        assert_eq!(qualitative_band(0.0), Band::AI);
        assert_eq!(qualitative_band(250.0), Band::AA);
        assert_eq!(qualitative_band(f64::NAN), Band::AI);
    }

    #[test]
    fn banding_is_monotonic() {
        let mut prev = qualitative_band(0.0);
        for step in 1..=10_000 {
            let q = step as f64 / 100.0;
            let b = qualitative_band(q);
            assert!(b >= prev, "band dropped at {}", q);
            prev = b;
        }
    }

    #[test]
    fn zero_semester_blocks_final() {
        let out = final_from_semesters(wire(0.0), wire(85.0));
        assert_eq!(out, PeriodScore::UNGRADED);
        assert_eq!(out.label(), "-");
        assert_eq!(final_from_semesters(None, wire(85.0)), PeriodScore::UNGRADED);
    }

    #[test]
    fn explicit_zero_semester_is_a_real_grade() {
        let out = final_from_semesters(Some(PeriodScore::graded(0.0)), wire(85.0));
        assert_eq!(out.quantitative, Some(43.0));
        assert_eq!(out.qualitative, Some(Band::AI));
    }

    #[test]
    fn final_from_semesters_rounds_half_up() {
        let out = final_from_semesters(wire(80.0), wire(90.0));
        assert_eq!(out, PeriodScore::new(85.0, Band::AS));

        let out = final_from_semesters(wire(75.0), wire(76.0));
        assert_eq!(out.quantitative, Some(76.0));
        assert_eq!(out.qualitative, Some(Band::AS));
    }

    #[test]
    fn four_bimester_average_stays_unrounded() {
        let r = final_from_bimesters(Some(100.0), Some(80.0), Some(60.0), Some(40.0));
        assert_eq!(r.quantitative, 70.0);
        assert_eq!(r.qualitative, Band::AF);

        let r = final_from_bimesters(Some(90.0), Some(90.0), Some(90.0), Some(89.0));
        assert_eq!(r.quantitative, 89.75);
        assert_eq!(r.qualitative, Band::AS);
        assert_eq!(r.display(), "89.8");

        let r = final_from_bimesters(Some(80.0), None, None, None);
        assert_eq!(r.quantitative, 20.0);
    }

    #[test]
    fn class_average_excludes_all_zero_subjects() {
        let mut empty = SubjectGradeRecord::default();
        empty.set(Period::Bimestre1, wire(0.0));
        let mut a = SubjectGradeRecord::default();
        for p in [Period::Bimestre1, Period::Bimestre2, Period::Bimestre3, Period::Bimestre4] {
            a.set(p, Some(PeriodScore::graded(80.0)));
        }
        let mut b = SubjectGradeRecord::default();
        for p in [Period::Bimestre1, Period::Bimestre2, Period::Bimestre3, Period::Bimestre4] {
            b.set(p, Some(PeriodScore::graded(90.0)));
        }

        assert!(!subject_counts_toward_average(&empty.bimester_values()));
        let avg = BandScheme::CANONICAL.student_certificate_average([&empty, &a, &b]);
        assert_eq!(avg.quantitative, 85.0);
        assert_eq!(avg.qualitative, Band::AS);

        assert_eq!(class_average(&[80.0, 90.0]).quantitative, 85.0);
    }

    #[test]
    fn class_average_of_nothing_is_zero() {
        let r = class_average(&[]);
        assert_eq!(r.quantitative, 0.0);
        assert_eq!(r.qualitative, Band::AI);
    }

    #[test]
    fn rollups_are_idempotent() {
        let s1 = wire(81.0);
        let s2 = wire(94.0);
        assert_eq!(final_from_semesters(s1, s2), final_from_semesters(s1, s2));
        let b = [Some(71.0), Some(88.0), None, Some(93.5)];
        assert_eq!(
            BandScheme::CANONICAL.final_from_bimesters(b),
            BandScheme::CANONICAL.final_from_bimesters(b)
        );
        assert_eq!(class_average(&[70.5, 99.0]), class_average(&[70.5, 99.0]));
        assert_eq!(qualitative_band(75.5), qualitative_band(75.5));
    }

    #[test]
    fn resolve_prefers_stored_semester() {
        let mut rec = SubjectGradeRecord::default();
        rec.set(Period::Bimestre1, wire(70.0));
        rec.set(Period::Bimestre2, wire(81.0));
        rec.set(Period::Bimestre3, wire(90.0));
        rec.set(Period::Bimestre4, wire(92.0));
        rec.set(Period::Semestre2, wire(95.0));

        let r = rec.resolve(&BandScheme::CANONICAL);
        assert_eq!(r.semestre_1.quantitative, Some(76.0));
        assert_eq!(r.semestre_2.quantitative, Some(95.0));
        assert_eq!(r.derived_semesters, [true, false]);
        assert_eq!(r.final_grade, PeriodScore::new(86.0, Band::AS));
    }

    #[test]
    fn resolve_without_second_semester_has_no_final() {
        let mut rec = SubjectGradeRecord::default();
        rec.set(Period::Bimestre1, wire(70.0));
        rec.set(Period::Bimestre2, wire(81.0));
        let r = rec.resolve(&BandScheme::CANONICAL);
        assert!(r.semestre_1.is_graded());
        assert!(!r.semestre_2.is_graded());
        assert_eq!(r.final_grade, PeriodScore::UNGRADED);
    }

    #[test]
    fn custom_scheme_moves_the_as_boundary() {
        let scheme = BandScheme {
            as_min: 75.0,
            ..BandScheme::CANONICAL
        };
        assert!(scheme.validate().is_ok());
        assert_eq!(scheme.band(75.0), Band::AS);
        assert_eq!(qualitative_band(75.0), Band::AF);

        let broken = BandScheme {
            aa_min: 70.0,
            ..BandScheme::CANONICAL
        };
        assert_eq!(broken.validate().unwrap_err().code, "bad_params");
    }

    #[test]
    fn from_wire_treats_zero_as_ungraded() {
        let s = PeriodScore::from_wire(Some("-"), Some(0.0), &BandScheme::CANONICAL);
        assert!(!s.is_graded());
        let s = PeriodScore::from_wire(Some("as"), Some(77.0), &BandScheme::CANONICAL);
        assert_eq!(s, PeriodScore::new(77.0, Band::AS));
        let s = PeriodScore::from_wire(None, Some(91.0), &BandScheme::CANONICAL);
        assert_eq!(s.qualitative, Some(Band::AA));
    }

    #[test]
    fn validate_score_rejects_out_of_range() {
        assert_eq!(validate_score(100.0), Ok(100.0));
        assert_eq!(
            validate_score(100.5),
            Err(ScoreError::OutOfRange { value: 100.5 })
        );
        assert_eq!(validate_score(f64::NAN), Err(ScoreError::NotFinite));
        let e: CalcError = ScoreError::OutOfRange { value: -1.0 }.into();
        assert_eq!(e.code, "bad_params");
    }

    #[test]
    fn one_decimal_display_rounds_halves_up() {
        assert_eq!(format_one_decimal(70.25), "70.3");
        assert_eq!(format_one_decimal(70.0), "70.0");
        assert_eq!(round_half_up(84.5), 85.0);
    }

    #[test]
    fn round_half_up_matches_math_round_at_the_edges() {
        assert_eq!(round_half_up(0.49999999999999994), 0.0);
        assert_eq!(round_half_up(-2.5), -2.0);
        assert_eq!(round_half_up(-2.6), -3.0);
        assert_eq!(round_half_up(89.5), 90.0);
        assert_eq!(round_half_up(89.49), 89.0);
    }

    #[test]
    fn period_score_serializes_dash_for_ungraded() {
        let v = serde_json::to_value(PeriodScore::UNGRADED).expect("serialize");
        assert_eq!(v, serde_json::json!({ "qualitative": "-", "quantitative": null }));
        let v = serde_json::to_value(PeriodScore::graded(91.0)).expect("serialize");
        assert_eq!(v, serde_json::json!({ "qualitative": "AA", "quantitative": 91.0 }));
    }
}
