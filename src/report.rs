use crate::calc::{
    Band, BandScheme, CalcError, Period, PeriodScore, ResolvedSubjectGrades, Rollup,
    SubjectGradeRecord, NO_GRADE,
};
use crate::db;
use rusqlite::{Connection, OptionalExtension};
use serde::Serialize;
use std::collections::{BTreeMap, HashMap};

pub const BANDS_SETTING_KEY: &str = "calc.bands";

fn db_err(e: impl ToString) -> CalcError {
    CalcError::new("db_query_failed", e.to_string())
}

pub fn load_band_scheme(conn: &Connection) -> Result<BandScheme, CalcError> {
    let raw = db::settings_get_json(conn, BANDS_SETTING_KEY).map_err(db_err)?;
    let Some(raw) = raw else {
        return Ok(BandScheme::CANONICAL);
    };
    let scheme: BandScheme = serde_json::from_value(raw)
        .map_err(|e| CalcError::new("bad_config", format!("stored band thresholds: {}", e)))?;
    scheme.validate()?;
    Ok(scheme)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum StudentScope {
    #[default]
    All,
    Active,
}

impl StudentScope {
    pub fn as_str(self) -> &'static str {
        match self {
            StudentScope::All => "all",
            StudentScope::Active => "active",
        }
    }
}

#[derive(Debug, Clone, Default, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RosterFilters {
    pub genero: Option<String>,
    #[serde(serialize_with = "serialize_scope")]
    pub student_scope: StudentScope,
}

fn serialize_scope<S: serde::Serializer>(scope: &StudentScope, s: S) -> Result<S::Ok, S::Error> {
    s.serialize_str(scope.as_str())
}

/// Accepts `{ genero?: string | "ALL", studentScope?: "all" | "active" }`.
pub fn parse_roster_filters(raw: Option<&serde_json::Value>) -> Result<RosterFilters, CalcError> {
    let Some(raw) = raw else {
        return Ok(RosterFilters::default());
    };
    let Some(obj) = raw.as_object() else {
        return Err(CalcError::new("bad_params", "filters must be an object"));
    };

    let genero = match obj.get("genero") {
        None => None,
        Some(v) if v.is_null() => None,
        Some(v) => {
            let Some(s) = v.as_str() else {
                return Err(CalcError::new(
                    "bad_params",
                    "filters.genero must be string or null",
                ));
            };
            let t = s.trim();
            if t.is_empty() || t.eq_ignore_ascii_case("ALL") {
                None
            } else {
                Some(t.to_ascii_uppercase())
            }
        }
    };

    let student_scope = match obj
        .get("studentScope")
        .and_then(|v| v.as_str())
        .map(|s| s.to_ascii_lowercase())
        .as_deref()
    {
        None | Some("all") => StudentScope::All,
        Some("active") => StudentScope::Active,
        Some(other) => {
            return Err(CalcError::new(
                "bad_params",
                "filters.studentScope must be one of: all, active",
            )
            .with_details(serde_json::json!({ "studentScope": other })))
        }
    };

    Ok(RosterFilters {
        genero,
        student_scope,
    })
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SectionSummary {
    pub id: String,
    pub grade_name: String,
    pub section_name: String,
    pub school_name: Option<String>,
    pub school_year: Option<i64>,
    pub shift: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SubjectSummary {
    pub id: String,
    pub name: String,
    pub sort_order: i64,
    pub external_id: Option<String>,
}

#[derive(Debug, Clone)]
pub struct RosterStudent {
    pub id: String,
    pub full_name: String,
    pub codigo_mined: Option<String>,
    pub genero: Option<String>,
    pub active: bool,
    pub grades: HashMap<String, SubjectGradeRecord>,
    pub promedio: Option<PeriodScore>,
}

#[derive(Debug, Clone)]
pub struct Roster {
    pub section: SectionSummary,
    pub subjects: Vec<SubjectSummary>,
    pub students: Vec<RosterStudent>,
}

pub fn load_section(conn: &Connection, section_id: &str) -> Result<SectionSummary, CalcError> {
    conn.query_row(
        "SELECT id, grade_name, section_name, school_name, school_year, shift
         FROM sections WHERE id = ?",
        [section_id],
        |r| {
            Ok(SectionSummary {
                id: r.get(0)?,
                grade_name: r.get(1)?,
                section_name: r.get(2)?,
                school_name: r.get(3)?,
                school_year: r.get(4)?,
                shift: r.get(5)?,
            })
        },
    )
    .optional()
    .map_err(db_err)?
    .ok_or_else(|| CalcError::new("not_found", "section not found"))
}

pub fn load_subjects(conn: &Connection, section_id: &str) -> Result<Vec<SubjectSummary>, CalcError> {
    let mut stmt = conn
        .prepare(
            "SELECT id, name, sort_order, external_id
             FROM subjects
             WHERE section_id = ?
             ORDER BY sort_order, name",
        )
        .map_err(db_err)?;
    let subjects = stmt
        .query_map([section_id], |r| {
            Ok(SubjectSummary {
                id: r.get(0)?,
                name: r.get(1)?,
                sort_order: r.get(2)?,
                external_id: r.get(3)?,
            })
        })
        .and_then(|it| it.collect::<Result<Vec<_>, _>>())
        .map_err(db_err)?;
    Ok(subjects)
}

/// Rebuilds a stored period row. Graded rows without a label get one from `scheme`.
pub fn score_from_row(
    quantitative: Option<f64>,
    qualitative: Option<&str>,
    status: &str,
    scheme: &BandScheme,
) -> PeriodScore {
    let label = qualitative.and_then(Band::parse);
    match (status, quantitative) {
        ("graded", Some(q)) => PeriodScore {
            qualitative: Some(label.unwrap_or_else(|| scheme.band(q))),
            quantitative: Some(q),
        },
        _ => PeriodScore {
            qualitative: label,
            quantitative: None,
        },
    }
}

pub fn load_roster(
    conn: &Connection,
    section_id: &str,
    filters: &RosterFilters,
    scheme: &BandScheme,
) -> Result<Roster, CalcError> {
    let section = load_section(conn, section_id)?;
    let subjects = load_subjects(conn, section_id)?;

    let mut students_stmt = conn
        .prepare(
            "SELECT id, full_name, codigo_mined, genero, active
             FROM students
             WHERE section_id = ?
             ORDER BY sort_order",
        )
        .map_err(db_err)?;
    let mut students: Vec<RosterStudent> = students_stmt
        .query_map([section_id], |r| {
            Ok(RosterStudent {
                id: r.get(0)?,
                full_name: r.get(1)?,
                codigo_mined: r.get(2)?,
                genero: r.get(3)?,
                active: r.get::<_, i64>(4)? != 0,
                grades: HashMap::new(),
                promedio: None,
            })
        })
        .and_then(|it| it.collect::<Result<Vec<_>, _>>())
        .map_err(db_err)?;

    students.retain(|s| {
        let scope_ok = filters.student_scope == StudentScope::All || s.active;
        let genero_ok = filters
            .genero
            .as_ref()
            .map(|g| {
                s.genero
                    .as_deref()
                    .map(|v| v.trim().eq_ignore_ascii_case(g))
                    .unwrap_or(false)
            })
            .unwrap_or(true);
        scope_ok && genero_ok
    });

    let index_by_id: HashMap<String, usize> = students
        .iter()
        .enumerate()
        .map(|(i, s)| (s.id.clone(), i))
        .collect();

    let mut scores_stmt = conn
        .prepare(
            "SELECT ps.student_id, ps.subject_id, ps.period, ps.quantitative, ps.qualitative, ps.status
             FROM period_scores ps
             JOIN students s ON s.id = ps.student_id
             WHERE s.section_id = ?",
        )
        .map_err(db_err)?;
    let rows = scores_stmt
        .query_map([section_id], |r| {
            let student_id: String = r.get(0)?;
            let subject_id: String = r.get(1)?;
            let period: String = r.get(2)?;
            let quantitative: Option<f64> = r.get(3)?;
            let qualitative: Option<String> = r.get(4)?;
            let status: String = r.get(5)?;
            Ok((student_id, subject_id, period, quantitative, qualitative, status))
        })
        .map_err(db_err)?;
    for row in rows {
        let (student_id, subject_id, period, quantitative, qualitative, status) =
            row.map_err(db_err)?;
        let Some(&idx) = index_by_id.get(&student_id) else {
            continue;
        };
        let Some(period) = Period::parse(&period) else {
            tracing::warn!(period = %period, student_id = %student_id, "skipping unknown period");
            continue;
        };
        let score = score_from_row(quantitative, qualitative.as_deref(), &status, scheme);
        students[idx]
            .grades
            .entry(subject_id)
            .or_default()
            .set(period, Some(score));
    }

    let mut promedio_stmt = conn
        .prepare(
            "SELECT sp.student_id, sp.quantitative, sp.qualitative
             FROM student_promedios sp
             JOIN students s ON s.id = sp.student_id
             WHERE s.section_id = ?",
        )
        .map_err(db_err)?;
    let promedios = promedio_stmt
        .query_map([section_id], |r| {
            Ok((
                r.get::<_, String>(0)?,
                r.get::<_, Option<f64>>(1)?,
                r.get::<_, Option<String>>(2)?,
            ))
        })
        .and_then(|it| it.collect::<Result<Vec<_>, _>>())
        .map_err(db_err)?;
    for (student_id, quantitative, qualitative) in promedios {
        if let Some(&idx) = index_by_id.get(&student_id) {
            students[idx].promedio = Some(PeriodScore::from_wire(
                qualitative.as_deref(),
                quantitative,
                scheme,
            ));
        }
    }

    Ok(Roster {
        section,
        subjects,
        students,
    })
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct StudentReportRow {
    pub student_id: String,
    pub full_name: String,
    pub codigo_mined: Option<String>,
    pub genero: Option<String>,
    pub grades: BTreeMap<String, ResolvedSubjectGrades>,
    pub promedio: PeriodScore,
    pub promedio_derived: bool,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SubjectBandCounts {
    pub subject_id: String,
    pub counts: BTreeMap<&'static str, usize>,
    pub final_average: Option<f64>,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SabanaModel {
    pub section: SectionSummary,
    pub filters: RosterFilters,
    pub bands: BandScheme,
    pub subjects: Vec<SubjectSummary>,
    pub rows: Vec<StudentReportRow>,
    pub per_subject: Vec<SubjectBandCounts>,
}

pub fn build_sabana(roster: &Roster, filters: &RosterFilters, scheme: &BandScheme) -> SabanaModel {
    let mut rows: Vec<StudentReportRow> = Vec::with_capacity(roster.students.len());
    for s in &roster.students {
        let grades: BTreeMap<String, ResolvedSubjectGrades> = roster
            .subjects
            .iter()
            .map(|subj| {
                let rec = s.grades.get(&subj.id).copied().unwrap_or_default();
                (subj.id.clone(), rec.resolve(scheme))
            })
            .collect();

        let (promedio, promedio_derived) = match s.promedio {
            Some(p) if p.is_graded() => (p, false),
            _ => (
                scheme.promedio_from_finals(grades.values().map(|g| g.final_grade)),
                true,
            ),
        };

        rows.push(StudentReportRow {
            student_id: s.id.clone(),
            full_name: s.full_name.clone(),
            codigo_mined: s.codigo_mined.clone(),
            genero: s.genero.clone(),
            grades,
            promedio,
            promedio_derived,
        });
    }

    let per_subject = roster
        .subjects
        .iter()
        .map(|subj| {
            let mut counts: BTreeMap<&'static str, usize> = BTreeMap::new();
            for b in Band::ALL {
                counts.insert(b.as_str(), 0);
            }
            counts.insert(NO_GRADE, 0);
            let mut sum = 0.0_f64;
            let mut graded = 0usize;
            for row in &rows {
                let Some(g) = row.grades.get(&subj.id) else {
                    continue;
                };
                *counts.entry(g.final_grade.label()).or_insert(0) += 1;
                if let Some(q) = g.final_grade.quantitative {
                    sum += q;
                    graded += 1;
                }
            }
            SubjectBandCounts {
                subject_id: subj.id.clone(),
                counts,
                final_average: if graded > 0 {
                    Some(crate::calc::round_off_1_decimal(sum / graded as f64))
                } else {
                    None
                },
            }
        })
        .collect();

    SabanaModel {
        section: roster.section.clone(),
        filters: filters.clone(),
        bands: *scheme,
        subjects: roster.subjects.clone(),
        rows,
        per_subject,
    }
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CertificateStudent {
    pub id: String,
    pub full_name: String,
    pub codigo_mined: Option<String>,
    pub genero: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CertificateSubjectRow {
    pub subject_id: String,
    pub name: String,
    pub bimesters: [PeriodScore; 4],
    #[serde(rename = "final")]
    pub final_grade: Rollup,
    pub final_display: String,
    pub counts_toward_average: bool,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CertificateModel {
    pub section: SectionSummary,
    pub student: CertificateStudent,
    pub bands: BandScheme,
    pub subjects: Vec<CertificateSubjectRow>,
    pub average: Rollup,
    pub average_display: String,
    pub counted_subjects: usize,
}

pub fn build_certificate(
    roster: &Roster,
    student_id: &str,
    scheme: &BandScheme,
) -> Result<CertificateModel, CalcError> {
    let Some(student) = roster.students.iter().find(|s| s.id == student_id) else {
        return Err(CalcError::new("not_found", "student not found in section")
            .with_details(serde_json::json!({ "studentId": student_id })));
    };

    let records: Vec<(&SubjectSummary, SubjectGradeRecord)> = roster
        .subjects
        .iter()
        .map(|subj| (subj, student.grades.get(&subj.id).copied().unwrap_or_default()))
        .collect();

    let subjects: Vec<CertificateSubjectRow> = records
        .iter()
        .map(|(subj, rec)| {
            let final_grade = scheme.final_from_bimesters(rec.bimester_values());
            CertificateSubjectRow {
                subject_id: subj.id.clone(),
                name: subj.name.clone(),
                bimesters: [
                    rec.bimestre_1.unwrap_or_default(),
                    rec.bimestre_2.unwrap_or_default(),
                    rec.bimestre_3.unwrap_or_default(),
                    rec.bimestre_4.unwrap_or_default(),
                ],
                final_grade,
                final_display: final_grade.display(),
                counts_toward_average: crate::calc::subject_counts_toward_average(
                    &rec.bimester_values(),
                ),
            }
        })
        .collect();

    let average = scheme.student_certificate_average(records.iter().map(|(_, rec)| rec));
    let counted_subjects = subjects.iter().filter(|s| s.counts_toward_average).count();

    Ok(CertificateModel {
        section: roster.section.clone(),
        student: CertificateStudent {
            id: student.id.clone(),
            full_name: student.full_name.clone(),
            codigo_mined: student.codigo_mined.clone(),
            genero: student.genero.clone(),
        },
        bands: *scheme,
        subjects,
        average,
        average_display: average.display(),
        counted_subjects,
    })
}

pub fn csv_quote(s: &str) -> String {
    if s.contains(',') || s.contains('"') || s.contains('\n') || s.contains('\r') {
        format!("\"{}\"", s.replace('"', "\"\""))
    } else {
        s.to_string()
    }
}

fn score_cell(score: &PeriodScore) -> String {
    match score.quantitative {
        Some(q) => format!("{} {}", q, score.label()),
        None => NO_GRADE.to_string(),
    }
}

fn csv_line(fields: &[String]) -> String {
    let mut line = fields
        .iter()
        .map(|f| csv_quote(f))
        .collect::<Vec<_>>()
        .join(",");
    line.push('\n');
    line
}

const SABANA_PERIOD_COLUMNS: [&str; 7] = ["IB", "IIB", "IS", "IIIB", "IVB", "IIS", "NF"];

pub fn sabana_csv(model: &SabanaModel) -> String {
    let mut header: Vec<String> = vec![
        "No.".to_string(),
        "Codigo MINED".to_string(),
        "Nombre completo".to_string(),
    ];
    for subj in &model.subjects {
        for col in SABANA_PERIOD_COLUMNS {
            header.push(format!("{} {}", subj.name, col));
        }
    }
    header.push("Promedio".to_string());

    let mut out = csv_line(&header);
    for (i, row) in model.rows.iter().enumerate() {
        let mut fields: Vec<String> = vec![
            (i + 1).to_string(),
            row.codigo_mined.clone().unwrap_or_default(),
            row.full_name.clone(),
        ];
        for subj in &model.subjects {
            match row.grades.get(&subj.id) {
                Some(g) => {
                    for score in [
                        &g.bimestre_1,
                        &g.bimestre_2,
                        &g.semestre_1,
                        &g.bimestre_3,
                        &g.bimestre_4,
                        &g.semestre_2,
                        &g.final_grade,
                    ] {
                        fields.push(score_cell(score));
                    }
                }
                None => fields.extend(std::iter::repeat(NO_GRADE.to_string()).take(7)),
            }
        }
        fields.push(score_cell(&row.promedio));
        out.push_str(&csv_line(&fields));
    }
    out
}

pub fn certificate_csv(model: &CertificateModel) -> String {
    let mut out = String::new();
    out.push_str(&csv_line(&["Estudiante".to_string(), model.student.full_name.clone()]));
    out.push_str(&csv_line(&[
        "Codigo MINED".to_string(),
        model.student.codigo_mined.clone().unwrap_or_default(),
    ]));
    out.push_str(&csv_line(&[
        "Grado".to_string(),
        format!("{} {}", model.section.grade_name, model.section.section_name),
    ]));
    out.push('\n');
    out.push_str(&csv_line(
        &[
            "Asignatura",
            "I Bimestre",
            "II Bimestre",
            "III Bimestre",
            "IV Bimestre",
            "Nota final",
            "Cualitativa",
        ]
        .map(String::from),
    ));
    for row in &model.subjects {
        let mut fields = vec![row.name.clone()];
        for b in &row.bimesters {
            fields.push(
                b.quantitative
                    .map(|q| q.to_string())
                    .unwrap_or_else(|| NO_GRADE.to_string()),
            );
        }
        fields.push(row.final_display.clone());
        fields.push(row.final_grade.qualitative.as_str().to_string());
        out.push_str(&csv_line(&fields));
    }
    out.push_str(&csv_line(&[
        "Promedio".to_string(),
        String::new(),
        String::new(),
        String::new(),
        String::new(),
        model.average_display.clone(),
        model.average.qualitative.as_str().to_string(),
    ]));
    out
}
