use crate::ipc::helpers::{
    db_conn, db_query_err, db_write_err, optional_str, required_str, respond, section_exists,
    HandlerErr,
};
use crate::ipc::types::{AppState, Request};
use crate::report;
use rusqlite::types::Value;
use rusqlite::params_from_iter;
use serde_json::json;
use std::collections::HashSet;
use uuid::Uuid;

fn handle_sections_list(state: &mut AppState, _req: &Request) -> Result<serde_json::Value, HandlerErr> {
    let Some(conn) = state.db.as_ref() else {
        return Ok(json!({ "sections": [] }));
    };

    let mut stmt = conn
        .prepare(
            "SELECT
               sec.id,
               sec.grade_name,
               sec.section_name,
               sec.school_name,
               sec.school_year,
               sec.shift,
               (SELECT COUNT(*) FROM students s WHERE s.section_id = sec.id) AS student_count,
               (SELECT COUNT(*) FROM subjects m WHERE m.section_id = sec.id) AS subject_count
             FROM sections sec
             ORDER BY sec.grade_name, sec.section_name",
        )
        .map_err(db_query_err)?;
    let sections = stmt
        .query_map([], |r| {
            Ok(json!({
                "id": r.get::<_, String>(0)?,
                "gradeName": r.get::<_, String>(1)?,
                "sectionName": r.get::<_, String>(2)?,
                "schoolName": r.get::<_, Option<String>>(3)?,
                "schoolYear": r.get::<_, Option<i64>>(4)?,
                "shift": r.get::<_, Option<String>>(5)?,
                "studentCount": r.get::<_, i64>(6)?,
                "subjectCount": r.get::<_, i64>(7)?,
            }))
        })
        .and_then(|it| it.collect::<Result<Vec<_>, _>>())
        .map_err(db_query_err)?;
    Ok(json!({ "sections": sections }))
}

fn handle_sections_create(state: &mut AppState, req: &Request) -> Result<serde_json::Value, HandlerErr> {
    let conn = db_conn(state)?;
    let grade_name = required_str(req, "gradeName")?;
    let section_name = required_str(req, "sectionName")?;
    let school_year = req.params.get("schoolYear").and_then(|v| v.as_i64());

    let section_id = Uuid::new_v4().to_string();
    conn.execute(
        "INSERT INTO sections(id, grade_name, section_name, school_name, school_year, shift, external_id)
         VALUES(?, ?, ?, ?, ?, ?, ?)",
        (
            &section_id,
            &grade_name,
            &section_name,
            optional_str(req, "schoolName"),
            school_year,
            optional_str(req, "shift"),
            optional_str(req, "externalId"),
        ),
    )
    .map_err(db_write_err("sections"))?;

    Ok(json!({ "sectionId": section_id }))
}

fn handle_sections_update(state: &mut AppState, req: &Request) -> Result<serde_json::Value, HandlerErr> {
    let conn = db_conn(state)?;
    let section_id = required_str(req, "sectionId")?;
    section_exists(conn, &section_id)?;

    let Some(patch) = req.params.get("patch").and_then(|v| v.as_object()) else {
        return Err(HandlerErr::new("bad_params", "missing patch object"));
    };

    let mut sets: Vec<&'static str> = Vec::new();
    let mut values: Vec<Value> = Vec::new();
    for (key, column) in [
        ("gradeName", "grade_name = ?"),
        ("sectionName", "section_name = ?"),
        ("schoolName", "school_name = ?"),
        ("shift", "shift = ?"),
    ] {
        let Some(v) = patch.get(key) else {
            continue;
        };
        let text = v.as_str().map(|s| s.trim().to_string());
        let required = key == "gradeName" || key == "sectionName";
        match text {
            Some(t) if !t.is_empty() => values.push(Value::Text(t)),
            _ if v.is_null() && !required => values.push(Value::Null),
            _ => {
                return Err(HandlerErr::new("bad_params", format!("patch.{} is invalid", key)))
            }
        }
        sets.push(column);
    }
    if let Some(v) = patch.get("schoolYear") {
        match v.as_i64() {
            Some(y) => values.push(Value::Integer(y)),
            None if v.is_null() => values.push(Value::Null),
            None => return Err(HandlerErr::new("bad_params", "patch.schoolYear must be integer")),
        }
        sets.push("school_year = ?");
    }
    if sets.is_empty() {
        return Ok(json!({ "updated": false }));
    }

    values.push(Value::Text(section_id));
    let sql = format!("UPDATE sections SET {} WHERE id = ?", sets.join(", "));
    conn.execute(&sql, params_from_iter(values))
        .map_err(db_write_err("sections"))?;
    Ok(json!({ "updated": true }))
}

fn handle_subjects_list(state: &mut AppState, req: &Request) -> Result<serde_json::Value, HandlerErr> {
    let conn = db_conn(state)?;
    let section_id = required_str(req, "sectionId")?;
    section_exists(conn, &section_id)?;
    let subjects = report::load_subjects(conn, &section_id)?;
    Ok(json!({ "subjects": subjects }))
}

fn handle_subjects_create(state: &mut AppState, req: &Request) -> Result<serde_json::Value, HandlerErr> {
    let conn = db_conn(state)?;
    let section_id = required_str(req, "sectionId")?;
    let name = required_str(req, "name")?;
    section_exists(conn, &section_id)?;

    let next_sort: i64 = conn
        .query_row(
            "SELECT COALESCE(MAX(sort_order) + 1, 0) FROM subjects WHERE section_id = ?",
            [&section_id],
            |r| r.get(0),
        )
        .map_err(db_query_err)?;
    let subject_id = Uuid::new_v4().to_string();
    conn.execute(
        "INSERT INTO subjects(id, section_id, name, sort_order, external_id) VALUES(?, ?, ?, ?, ?)",
        (
            &subject_id,
            &section_id,
            &name,
            next_sort,
            optional_str(req, "externalId"),
        ),
    )
    .map_err(db_write_err("subjects"))?;
    Ok(json!({ "subjectId": subject_id, "sortOrder": next_sort }))
}

fn handle_subjects_reorder(state: &mut AppState, req: &Request) -> Result<serde_json::Value, HandlerErr> {
    let conn = db_conn(state)?;
    let section_id = required_str(req, "sectionId")?;
    section_exists(conn, &section_id)?;

    let Some(ordered) = req.params.get("subjectIds").and_then(|v| v.as_array()) else {
        return Err(HandlerErr::new("bad_params", "missing subjectIds array"));
    };
    let ordered: Vec<String> = ordered
        .iter()
        .map(|v| v.as_str().map(|s| s.to_string()))
        .collect::<Option<Vec<_>>>()
        .ok_or_else(|| HandlerErr::new("bad_params", "subjectIds must be strings"))?;

    let existing: HashSet<String> = report::load_subjects(conn, &section_id)?
        .into_iter()
        .map(|s| s.id)
        .collect();
    let requested: HashSet<String> = ordered.iter().cloned().collect();
    if requested.len() != ordered.len() || requested != existing {
        return Err(HandlerErr::new(
            "bad_params",
            "subjectIds must list every subject of the section exactly once",
        )
        .with_details(json!({ "expected": existing.len(), "got": ordered.len() })));
    }

    let tx = conn
        .unchecked_transaction()
        .map_err(|e| HandlerErr::new("db_tx_failed", e.to_string()))?;
    for (i, id) in ordered.iter().enumerate() {
        tx.execute(
            "UPDATE subjects SET sort_order = ? WHERE id = ? AND section_id = ?",
            (i as i64, id, &section_id),
        )
        .map_err(db_write_err("subjects"))?;
    }
    tx.commit()
        .map_err(|e| HandlerErr::new("db_commit_failed", e.to_string()))?;
    Ok(json!({ "reordered": ordered.len() }))
}

pub fn try_handle(state: &mut AppState, req: &Request) -> Option<serde_json::Value> {
    let result = match req.method.as_str() {
        "sections.list" => handle_sections_list(state, req),
        "sections.create" => handle_sections_create(state, req),
        "sections.update" => handle_sections_update(state, req),
        "subjects.list" => handle_subjects_list(state, req),
        "subjects.create" => handle_subjects_create(state, req),
        "subjects.reorder" => handle_subjects_reorder(state, req),
        _ => return None,
    };
    Some(respond(req, result))
}
