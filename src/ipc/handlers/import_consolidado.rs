use crate::consolidado::{self, WireSubject};
use crate::db;
use crate::ipc::helpers::{
    db_conn, db_query_err, db_write_err, required_str, respond, section_exists, HandlerErr,
};
use crate::ipc::types::{AppState, Request};
use crate::report;
use rusqlite::{Connection, OptionalExtension};
use serde::Serialize;
use serde_json::json;
use std::collections::HashMap;
use uuid::Uuid;

#[derive(Debug, Default, Serialize)]
#[serde(rename_all = "camelCase")]
struct ImportSummary {
    students_created: usize,
    students_updated: usize,
    subjects_created: usize,
    scores_written: usize,
    promedios_written: usize,
}

fn next_sort_order(conn: &Connection, table: &str, section_id: &str) -> Result<i64, HandlerErr> {
    let sql = format!(
        "SELECT COALESCE(MAX(sort_order) + 1, 0) FROM {} WHERE section_id = ?",
        table
    );
    conn.query_row(&sql, [section_id], |r| r.get(0))
        .map_err(db_query_err)
}

fn upsert_subject(
    conn: &Connection,
    section_id: &str,
    subject: &WireSubject,
    summary: &mut ImportSummary,
) -> Result<String, HandlerErr> {
    let existing: Option<String> = conn
        .query_row(
            "SELECT id FROM subjects WHERE section_id = ? AND external_id = ?",
            (section_id, &subject.id_materia),
            |r| r.get(0),
        )
        .optional()
        .map_err(db_query_err)?;
    if let Some(id) = existing {
        conn.execute(
            "UPDATE subjects SET name = ? WHERE id = ?",
            (&subject.nombre, &id),
        )
        .map_err(db_write_err("subjects"))?;
        return Ok(id);
    }

    let id = Uuid::new_v4().to_string();
    let sort_order = match subject.orden {
        Some(o) => o,
        None => next_sort_order(conn, "subjects", section_id)?,
    };
    conn.execute(
        "INSERT INTO subjects(id, section_id, name, sort_order, external_id) VALUES(?, ?, ?, ?, ?)",
        (&id, section_id, &subject.nombre, sort_order, &subject.id_materia),
    )
    .map_err(db_write_err("subjects"))?;
    summary.subjects_created += 1;
    Ok(id)
}

fn upsert_student(
    conn: &Connection,
    section_id: &str,
    student: &consolidado::WireStudent,
    summary: &mut ImportSummary,
) -> Result<String, HandlerErr> {
    let existing: Option<String> = conn
        .query_row(
            "SELECT id FROM students WHERE section_id = ? AND external_id = ?",
            (section_id, &student.id_estudiante),
            |r| r.get(0),
        )
        .optional()
        .map_err(db_query_err)?;
    let genero = student.genero.as_ref().map(|g| g.to_ascii_uppercase());

    if let Some(id) = existing {
        conn.execute(
            "UPDATE students
             SET full_name = ?,
                 codigo_mined = COALESCE(?, codigo_mined),
                 genero = COALESCE(?, genero),
                 updated_at = ?
             WHERE id = ?",
            (
                &student.nombre_completo,
                &student.codigo_mined,
                &genero,
                db::now_stamp(),
                &id,
            ),
        )
        .map_err(db_write_err("students"))?;
        summary.students_updated += 1;
        return Ok(id);
    }

    let id = Uuid::new_v4().to_string();
    let sort_order = next_sort_order(conn, "students", section_id)?;
    conn.execute(
        "INSERT INTO students(id, section_id, full_name, codigo_mined, genero, active, sort_order, external_id, updated_at)
         VALUES(?, ?, ?, ?, ?, 1, ?, ?, ?)",
        (
            &id,
            section_id,
            &student.nombre_completo,
            &student.codigo_mined,
            &genero,
            sort_order,
            &student.id_estudiante,
            db::now_stamp(),
        ),
    )
    .map_err(db_write_err("students"))?;
    summary.students_created += 1;
    Ok(id)
}

fn import_into(
    conn: &Connection,
    section_id: &str,
    parsed: &consolidado::Consolidado,
) -> Result<ImportSummary, HandlerErr> {
    let scheme = report::load_band_scheme(conn)?;
    let mut summary = ImportSummary::default();

    let mut subject_ids: HashMap<String, String> = HashMap::new();
    for subject in &parsed.subjects {
        let id = upsert_subject(conn, section_id, subject, &mut summary)?;
        subject_ids.insert(subject.id_materia.clone(), id);
    }

    for student in &parsed.students {
        let student_id = upsert_student(conn, section_id, student, &mut summary)?;

        for (external_subject, grades) in &student.calificaciones {
            let subject_id = match subject_ids.get(external_subject) {
                Some(id) => id.clone(),
                None => {
                    // Grades for a subject missing from the catalog.
                    let placeholder = WireSubject {
                        id_materia: external_subject.clone(),
                        nombre: external_subject.clone(),
                        orden: None,
                    };
                    let id = upsert_subject(conn, section_id, &placeholder, &mut summary)?;
                    subject_ids.insert(external_subject.clone(), id.clone());
                    id
                }
            };

            for (period, wire) in grades.periods() {
                let score = wire.to_period_score(&scheme);
                let status = if score.is_graded() { "graded" } else { "ungraded" };
                conn.execute(
                    "INSERT INTO period_scores(student_id, subject_id, period, quantitative, qualitative, status, updated_at)
                     VALUES(?, ?, ?, ?, ?, ?, ?)
                     ON CONFLICT(student_id, subject_id, period) DO UPDATE SET
                       quantitative = excluded.quantitative,
                       qualitative = excluded.qualitative,
                       status = excluded.status,
                       updated_at = excluded.updated_at",
                    (
                        &student_id,
                        &subject_id,
                        period.as_str(),
                        score.quantitative,
                        wire.label().map(|b| b.as_str()),
                        status,
                        db::now_stamp(),
                    ),
                )
                .map_err(db_write_err("period_scores"))?;
                summary.scores_written += 1;
            }
        }

        if let Some(promedio) = &student.promedio {
            let score = promedio.to_period_score(&scheme);
            conn.execute(
                "INSERT INTO student_promedios(student_id, quantitative, qualitative) VALUES(?, ?, ?)
                 ON CONFLICT(student_id) DO UPDATE SET
                   quantitative = excluded.quantitative,
                   qualitative = excluded.qualitative",
                (
                    &student_id,
                    score.quantitative,
                    promedio.label().map(|b| b.as_str()),
                ),
            )
            .map_err(db_write_err("student_promedios"))?;
            summary.promedios_written += 1;
        }
    }

    Ok(summary)
}

fn handle_import_consolidado(state: &mut AppState, req: &Request) -> Result<serde_json::Value, HandlerErr> {
    let conn = db_conn(state)?;
    let section_id = required_str(req, "sectionId")?;
    section_exists(conn, &section_id)?;
    let Some(payload) = req.params.get("payload") else {
        return Err(HandlerErr::new("bad_params", "missing payload"));
    };

    let parsed = consolidado::parse_consolidado(payload)
        .map_err(|e| HandlerErr::new("consolidado_parse_failed", format!("{e:#}")))?;

    let tx = conn
        .unchecked_transaction()
        .map_err(|e| HandlerErr::new("db_tx_failed", e.to_string()))?;
    let summary = import_into(&tx, &section_id, &parsed)?;
    tx.commit()
        .map_err(|e| HandlerErr::new("db_commit_failed", e.to_string()))?;

    tracing::info!(
        section_id = %section_id,
        students_created = summary.students_created,
        students_updated = summary.students_updated,
        scores = summary.scores_written,
        "consolidado imported"
    );
    Ok(json!(summary))
}

pub fn try_handle(state: &mut AppState, req: &Request) -> Option<serde_json::Value> {
    match req.method.as_str() {
        "grades.importConsolidado" => Some(respond(req, handle_import_consolidado(state, req))),
        _ => None,
    }
}
