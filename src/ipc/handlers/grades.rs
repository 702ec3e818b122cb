use crate::calc::{self, Band, BandScheme, Period, PeriodScore, SubjectGradeRecord, NO_GRADE};
use crate::db;
use crate::ipc::helpers::{
    db_conn, db_query_err, db_write_err, optional_f64, optional_str, required_str, respond,
    section_exists, HandlerErr,
};
use crate::ipc::types::{AppState, Request};
use crate::report;
use rusqlite::{Connection, OptionalExtension};
use serde_json::json;
use std::collections::BTreeMap;

const GRADES_BULK_SET_MAX_EDITS: usize = 5000;

struct ScoreEdit {
    student_id: String,
    subject_id: String,
    period: Period,
    score: PeriodScore,
    /// Label sent by the caller. Derived labels are not persisted so they
    /// follow the workspace thresholds at read time.
    explicit_label: Option<Band>,
}

fn parse_qualitative(raw: Option<&serde_json::Value>) -> Result<Option<Band>, HandlerErr> {
    match raw {
        None => Ok(None),
        Some(v) if v.is_null() => Ok(None),
        Some(v) => {
            let Some(s) = v.as_str() else {
                return Err(HandlerErr::new("bad_params", "qualitative must be a string"));
            };
            if s.trim() == NO_GRADE || s.trim().is_empty() {
                return Ok(None);
            }
            Band::parse(s).map(Some).ok_or_else(|| {
                HandlerErr::new("bad_params", "qualitative must be one of: AA, AS, AF, AI, -")
                    .with_details(json!({ "qualitative": s }))
            })
        }
    }
}

/// Resolves a single edit. Without an explicit `state`, a missing or zero
/// value clears the grade (the backend convention); `state: "zero"` records
/// a real zero.
fn parse_edit(raw: &serde_json::Value, scheme: &BandScheme) -> Result<ScoreEdit, HandlerErr> {
    let Some(obj) = raw.as_object() else {
        return Err(HandlerErr::new("bad_params", "edit must be an object"));
    };
    let text = |key: &str| -> Result<String, HandlerErr> {
        obj.get(key)
            .and_then(|v| v.as_str())
            .map(|s| s.trim().to_string())
            .filter(|s| !s.is_empty())
            .ok_or_else(|| HandlerErr::new("bad_params", format!("missing {}", key)))
    };
    let student_id = text("studentId")?;
    let subject_id = text("subjectId")?;
    let period_raw = text("period")?;
    let period = Period::parse(&period_raw).ok_or_else(|| {
        HandlerErr::new("bad_params", "unknown period")
            .with_details(json!({ "period": period_raw }))
    })?;

    let value = optional_f64(obj.get("quantitative"), "quantitative")?;
    if let Some(v) = value {
        calc::validate_score(v).map_err(calc::CalcError::from)?;
    }
    let label = parse_qualitative(obj.get("qualitative"))?;

    let state = obj
        .get("state")
        .and_then(|v| v.as_str())
        .map(|s| s.to_ascii_lowercase());
    let score = match state.as_deref() {
        Some("ungraded") => PeriodScore {
            qualitative: label,
            quantitative: None,
        },
        Some("zero") => PeriodScore::new(0.0, label.unwrap_or_else(|| scheme.band(0.0))),
        Some("graded") => {
            let Some(v) = value else {
                return Err(HandlerErr::new(
                    "bad_params",
                    "graded state requires a quantitative value",
                ));
            };
            PeriodScore::new(v, label.unwrap_or_else(|| scheme.band(v)))
        }
        Some(other) => {
            return Err(HandlerErr::new(
                "bad_params",
                "state must be one of: graded, zero, ungraded",
            )
            .with_details(json!({ "state": other })))
        }
        None => match value {
            Some(v) if v != 0.0 => PeriodScore::new(v, label.unwrap_or_else(|| scheme.band(v))),
            _ => PeriodScore {
                qualitative: label,
                quantitative: None,
            },
        },
    };

    Ok(ScoreEdit {
        student_id,
        subject_id,
        period,
        score,
        explicit_label: label,
    })
}

fn check_same_section(conn: &Connection, student_id: &str, subject_id: &str) -> Result<(), HandlerErr> {
    let row: Option<(String, Option<String>)> = conn
        .query_row(
            "SELECT s.section_id,
                    (SELECT m.section_id FROM subjects m WHERE m.id = ?2)
             FROM students s WHERE s.id = ?1",
            (student_id, subject_id),
            |r| Ok((r.get(0)?, r.get(1)?)),
        )
        .optional()
        .map_err(db_query_err)?;
    match row {
        None => Err(HandlerErr::new("not_found", "student not found")
            .with_details(json!({ "studentId": student_id }))),
        Some((_, None)) => Err(HandlerErr::new("not_found", "subject not found")
            .with_details(json!({ "subjectId": subject_id }))),
        Some((a, Some(b))) if a != b => Err(HandlerErr::new(
            "bad_params",
            "student and subject belong to different sections",
        )),
        Some(_) => Ok(()),
    }
}

fn store_edit(conn: &Connection, edit: &ScoreEdit) -> Result<(), HandlerErr> {
    check_same_section(conn, &edit.student_id, &edit.subject_id)?;
    let status = if edit.score.is_graded() { "graded" } else { "ungraded" };
    conn.execute(
        "INSERT INTO period_scores(student_id, subject_id, period, quantitative, qualitative, status, updated_at)
         VALUES(?, ?, ?, ?, ?, ?, ?)
         ON CONFLICT(student_id, subject_id, period) DO UPDATE SET
           quantitative = excluded.quantitative,
           qualitative = excluded.qualitative,
           status = excluded.status,
           updated_at = excluded.updated_at",
        (
            &edit.student_id,
            &edit.subject_id,
            edit.period.as_str(),
            edit.score.quantitative,
            edit.explicit_label.map(|b| b.as_str()),
            status,
            db::now_stamp(),
        ),
    )
    .map_err(db_write_err("period_scores"))?;
    Ok(())
}

fn load_subject_record(
    conn: &Connection,
    student_id: &str,
    subject_id: &str,
    scheme: &BandScheme,
) -> Result<SubjectGradeRecord, HandlerErr> {
    let mut stmt = conn
        .prepare(
            "SELECT period, quantitative, qualitative, status
             FROM period_scores
             WHERE student_id = ? AND subject_id = ?",
        )
        .map_err(db_query_err)?;
    let rows = stmt
        .query_map((student_id, subject_id), |r| {
            Ok((
                r.get::<_, String>(0)?,
                r.get::<_, Option<f64>>(1)?,
                r.get::<_, Option<String>>(2)?,
                r.get::<_, String>(3)?,
            ))
        })
        .and_then(|it| it.collect::<Result<Vec<_>, _>>())
        .map_err(db_query_err)?;

    let mut rec = SubjectGradeRecord::default();
    for (period, quantitative, qualitative, status) in rows {
        if let Some(p) = Period::parse(&period) {
            rec.set(
                p,
                Some(report::score_from_row(
                    quantitative,
                    qualitative.as_deref(),
                    &status,
                    scheme,
                )),
            );
        }
    }
    Ok(rec)
}

fn handle_grades_get(state: &mut AppState, req: &Request) -> Result<serde_json::Value, HandlerErr> {
    let conn = db_conn(state)?;
    let section_id = required_str(req, "sectionId")?;
    let only_student = optional_str(req, "studentId");
    let scheme = report::load_band_scheme(conn)?;
    let filters = report::parse_roster_filters(req.params.get("filters"))?;
    let roster = report::load_roster(conn, &section_id, &filters, &scheme)?;

    let students: Vec<serde_json::Value> = roster
        .students
        .iter()
        .filter(|s| only_student.as_ref().map(|id| *id == s.id).unwrap_or(true))
        .map(|s| {
            let grades: BTreeMap<&str, SubjectGradeRecord> = roster
                .subjects
                .iter()
                .map(|subj| {
                    (
                        subj.id.as_str(),
                        s.grades.get(&subj.id).copied().unwrap_or_default(),
                    )
                })
                .collect();
            json!({
                "studentId": s.id,
                "fullName": s.full_name,
                "grades": grades,
            })
        })
        .collect();

    if let Some(id) = only_student {
        if students.is_empty() {
            return Err(HandlerErr::new("not_found", "student not found in section")
                .with_details(json!({ "studentId": id })));
        }
    }

    Ok(json!({
        "subjects": roster.subjects,
        "students": students,
    }))
}

fn handle_grades_set(state: &mut AppState, req: &Request) -> Result<serde_json::Value, HandlerErr> {
    let conn = db_conn(state)?;
    let scheme = report::load_band_scheme(conn)?;
    let edit = parse_edit(&req.params, &scheme)?;
    store_edit(conn, &edit)?;

    let rec = load_subject_record(conn, &edit.student_id, &edit.subject_id, &scheme)?;
    Ok(json!({
        "score": edit.score,
        "resolved": rec.resolve(&scheme),
    }))
}

fn handle_grades_bulk_set(state: &mut AppState, req: &Request) -> Result<serde_json::Value, HandlerErr> {
    let conn = db_conn(state)?;
    if let Some(section_id) = optional_str(req, "sectionId") {
        section_exists(conn, &section_id)?;
    }
    let Some(raw_edits) = req.params.get("edits").and_then(|v| v.as_array()) else {
        return Err(HandlerErr::new("bad_params", "missing edits array"));
    };
    if raw_edits.len() > GRADES_BULK_SET_MAX_EDITS {
        return Err(HandlerErr::new("bad_params", "too many edits in one call")
            .with_details(json!({ "max": GRADES_BULK_SET_MAX_EDITS, "got": raw_edits.len() })));
    }

    let scheme = report::load_band_scheme(conn)?;
    let mut edits: Vec<ScoreEdit> = Vec::with_capacity(raw_edits.len());
    for (i, raw) in raw_edits.iter().enumerate() {
        let edit = parse_edit(raw, &scheme).map_err(|mut e| {
            let mut details = e.details.take().unwrap_or_else(|| json!({}));
            details["index"] = json!(i);
            e.with_details(details)
        })?;
        edits.push(edit);
    }

    let tx = conn
        .unchecked_transaction()
        .map_err(|e| HandlerErr::new("db_tx_failed", e.to_string()))?;
    for (i, edit) in edits.iter().enumerate() {
        store_edit(&tx, edit).map_err(|mut e| {
            let mut details = e.details.take().unwrap_or_else(|| json!({}));
            details["index"] = json!(i);
            e.with_details(details)
        })?;
    }
    tx.commit()
        .map_err(|e| HandlerErr::new("db_commit_failed", e.to_string()))?;

    let graded = edits.iter().filter(|e| e.score.is_graded()).count();
    tracing::info!(updated = edits.len(), graded, "bulk grade update applied");
    Ok(json!({
        "updated": edits.len(),
        "graded": graded,
        "ungraded": edits.len() - graded,
    }))
}

pub fn try_handle(state: &mut AppState, req: &Request) -> Option<serde_json::Value> {
    let result = match req.method.as_str() {
        "grades.get" => handle_grades_get(state, req),
        "grades.set" => handle_grades_set(state, req),
        "grades.bulkSet" => handle_grades_bulk_set(state, req),
        _ => return None,
    };
    Some(respond(req, result))
}
