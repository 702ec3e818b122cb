use crate::db;
use crate::ipc::helpers::{
    db_conn, db_query_err, db_write_err, optional_str, required_str, respond, section_exists,
    HandlerErr,
};
use crate::ipc::types::{AppState, Request};
use crate::report;
use rusqlite::types::Value;
use rusqlite::{params_from_iter, Connection, OptionalExtension};
use serde_json::json;
use uuid::Uuid;

fn normalize_genero(raw: Option<&serde_json::Value>) -> Result<Option<String>, HandlerErr> {
    match raw {
        None => Ok(None),
        Some(v) if v.is_null() => Ok(None),
        Some(v) => match v.as_str().map(|s| s.trim().to_ascii_uppercase()) {
            Some(s) if s.is_empty() => Ok(None),
            Some(s) if s == "F" || s == "M" => Ok(Some(s)),
            _ => Err(HandlerErr::new("bad_params", "genero must be F, M or null")
                .with_details(json!({ "genero": v }))),
        },
    }
}

fn student_section(conn: &Connection, student_id: &str) -> Result<String, HandlerErr> {
    conn.query_row(
        "SELECT section_id FROM students WHERE id = ?",
        [student_id],
        |r| r.get(0),
    )
    .optional()
    .map_err(db_query_err)?
    .ok_or_else(|| {
        HandlerErr::new("not_found", "student not found")
            .with_details(json!({ "studentId": student_id }))
    })
}

fn handle_students_list(state: &mut AppState, req: &Request) -> Result<serde_json::Value, HandlerErr> {
    let conn = db_conn(state)?;
    let section_id = required_str(req, "sectionId")?;
    section_exists(conn, &section_id)?;
    let filters = report::parse_roster_filters(req.params.get("filters"))?;

    let mut stmt = conn
        .prepare(
            "SELECT id, full_name, codigo_mined, genero, active, sort_order, external_id, updated_at
             FROM students
             WHERE section_id = ?
             ORDER BY sort_order",
        )
        .map_err(db_query_err)?;
    let rows = stmt
        .query_map([&section_id], |r| {
            Ok((
                r.get::<_, String>(0)?,
                r.get::<_, String>(1)?,
                r.get::<_, Option<String>>(2)?,
                r.get::<_, Option<String>>(3)?,
                r.get::<_, i64>(4)? != 0,
                r.get::<_, i64>(5)?,
                r.get::<_, Option<String>>(6)?,
                r.get::<_, Option<String>>(7)?,
            ))
        })
        .and_then(|it| it.collect::<Result<Vec<_>, _>>())
        .map_err(db_query_err)?;

    let students: Vec<serde_json::Value> = rows
        .into_iter()
        .filter(|(_, _, _, genero, active, _, _, _)| {
            let scope_ok = filters.student_scope == report::StudentScope::All || *active;
            let genero_ok = match (&filters.genero, genero) {
                (None, _) => true,
                (Some(want), Some(have)) => want.eq_ignore_ascii_case(have),
                (Some(_), None) => false,
            };
            scope_ok && genero_ok
        })
        .map(
            |(id, full_name, codigo_mined, genero, active, sort_order, external_id, updated_at)| {
                json!({
                    "id": id,
                    "fullName": full_name,
                    "codigoMined": codigo_mined,
                    "genero": genero,
                    "active": active,
                    "sortOrder": sort_order,
                    "externalId": external_id,
                    "updatedAt": updated_at,
                })
            },
        )
        .collect();
    Ok(json!({ "students": students }))
}

fn handle_students_create(state: &mut AppState, req: &Request) -> Result<serde_json::Value, HandlerErr> {
    let conn = db_conn(state)?;
    let section_id = required_str(req, "sectionId")?;
    let full_name = required_str(req, "fullName")?;
    let genero = normalize_genero(req.params.get("genero"))?;
    let active = req
        .params
        .get("active")
        .and_then(|v| v.as_bool())
        .unwrap_or(true);
    section_exists(conn, &section_id)?;

    let next_sort: i64 = conn
        .query_row(
            "SELECT COALESCE(MAX(sort_order) + 1, 0) FROM students WHERE section_id = ?",
            [&section_id],
            |r| r.get(0),
        )
        .map_err(db_query_err)?;

    let student_id = Uuid::new_v4().to_string();
    conn.execute(
        "INSERT INTO students(id, section_id, full_name, codigo_mined, genero, active, sort_order, external_id, updated_at)
         VALUES(?, ?, ?, ?, ?, ?, ?, ?, ?)",
        (
            &student_id,
            &section_id,
            &full_name,
            optional_str(req, "codigoMined"),
            genero,
            active as i64,
            next_sort,
            optional_str(req, "externalId"),
            db::now_stamp(),
        ),
    )
    .map_err(db_write_err("students"))?;

    Ok(json!({ "studentId": student_id, "sortOrder": next_sort }))
}

fn handle_students_update(state: &mut AppState, req: &Request) -> Result<serde_json::Value, HandlerErr> {
    let conn = db_conn(state)?;
    let student_id = required_str(req, "studentId")?;
    student_section(conn, &student_id)?;

    let Some(patch) = req.params.get("patch").and_then(|v| v.as_object()) else {
        return Err(HandlerErr::new("bad_params", "missing patch object"));
    };

    let mut sets: Vec<&'static str> = Vec::new();
    let mut values: Vec<Value> = Vec::new();
    if let Some(v) = patch.get("fullName") {
        match v.as_str().map(|s| s.trim()) {
            Some(s) if !s.is_empty() => values.push(Value::Text(s.to_string())),
            _ => return Err(HandlerErr::new("bad_params", "patch.fullName must be a non-empty string")),
        }
        sets.push("full_name = ?");
    }
    if let Some(v) = patch.get("codigoMined") {
        match v.as_str().map(|s| s.trim()) {
            Some(s) if !s.is_empty() => values.push(Value::Text(s.to_string())),
            _ if v.is_null() => values.push(Value::Null),
            _ => return Err(HandlerErr::new("bad_params", "patch.codigoMined must be string or null")),
        }
        sets.push("codigo_mined = ?");
    }
    if patch.contains_key("genero") {
        let genero = normalize_genero(patch.get("genero"))?;
        values.push(genero.map(Value::Text).unwrap_or(Value::Null));
        sets.push("genero = ?");
    }
    if let Some(v) = patch.get("active") {
        let Some(b) = v.as_bool() else {
            return Err(HandlerErr::new("bad_params", "patch.active must be boolean"));
        };
        values.push(Value::Integer(b as i64));
        sets.push("active = ?");
    }
    if sets.is_empty() {
        return Ok(json!({ "updated": false }));
    }

    sets.push("updated_at = ?");
    values.push(Value::Text(db::now_stamp()));
    values.push(Value::Text(student_id));
    let sql = format!("UPDATE students SET {} WHERE id = ?", sets.join(", "));
    conn.execute(&sql, params_from_iter(values))
        .map_err(db_write_err("students"))?;
    Ok(json!({ "updated": true }))
}

fn handle_students_delete(state: &mut AppState, req: &Request) -> Result<serde_json::Value, HandlerErr> {
    let conn = db_conn(state)?;
    let student_id = required_str(req, "studentId")?;
    let section_id = student_section(conn, &student_id)?;

    let tx = conn
        .unchecked_transaction()
        .map_err(|e| HandlerErr::new("db_tx_failed", e.to_string()))?;
    // No ON DELETE CASCADE: children first.
    tx.execute("DELETE FROM period_scores WHERE student_id = ?", [&student_id])
        .map_err(db_write_err("period_scores"))?;
    tx.execute("DELETE FROM student_promedios WHERE student_id = ?", [&student_id])
        .map_err(db_write_err("student_promedios"))?;
    tx.execute("DELETE FROM students WHERE id = ?", [&student_id])
        .map_err(db_write_err("students"))?;

    // Keep sort_order dense so roster numbering stays 1..n.
    let remaining: Vec<String> = {
        let mut stmt = tx
            .prepare("SELECT id FROM students WHERE section_id = ? ORDER BY sort_order")
            .map_err(db_query_err)?;
        let ids = stmt
            .query_map([&section_id], |r| r.get(0))
            .and_then(|it| it.collect::<Result<Vec<_>, _>>())
            .map_err(db_query_err)?;
        ids
    };
    for (i, id) in remaining.iter().enumerate() {
        tx.execute(
            "UPDATE students SET sort_order = ? WHERE id = ?",
            (i as i64, id),
        )
        .map_err(db_write_err("students"))?;
    }
    tx.commit()
        .map_err(|e| HandlerErr::new("db_commit_failed", e.to_string()))?;
    Ok(json!({ "deleted": true }))
}

pub fn try_handle(state: &mut AppState, req: &Request) -> Option<serde_json::Value> {
    let result = match req.method.as_str() {
        "students.list" => handle_students_list(state, req),
        "students.create" => handle_students_create(state, req),
        "students.update" => handle_students_update(state, req),
        "students.delete" => handle_students_delete(state, req),
        _ => return None,
    };
    Some(respond(req, result))
}
