mod test_support;

use serde_json::json;
use test_support::{request_err, request_ok, spawn_sidecar, str_field, temp_dir};

#[test]
fn pure_calc_methods_follow_rollup_rules() {
    let (_child, mut stdin, mut reader) = spawn_sidecar();

    let out = request_ok(
        &mut stdin,
        &mut reader,
        "1",
        "calc.finalFromSemesters",
        json!({ "semestre1": 75, "semestre2": 76 }),
    );
    assert_eq!(out["final"], json!({ "qualitative": "AS", "quantitative": 76.0 }));

    let out = request_ok(
        &mut stdin,
        &mut reader,
        "2",
        "calc.finalFromSemesters",
        json!({ "semestre1": { "qualitative": "-", "quantitative": 0 }, "semestre2": 85 }),
    );
    assert_eq!(out["final"], json!({ "qualitative": "-", "quantitative": null }));

    let out = request_ok(
        &mut stdin,
        &mut reader,
        "3",
        "calc.finalFromBimesters",
        json!({ "bimesters": [100, 80, null, 40] }),
    );
    assert_eq!(out["final"], json!({ "quantitative": 55.0, "qualitative": "AI" }));
    assert_eq!(out["display"], json!("55.0"));

    let code = request_err(
        &mut stdin,
        &mut reader,
        "4",
        "calc.finalFromBimesters",
        json!({ "bimesters": [100, 80, 60] }),
    );
    assert_eq!(code, "bad_params");

    let out = request_ok(
        &mut stdin,
        &mut reader,
        "5",
        "calc.classAverage",
        json!({ "subjectAverages": [] }),
    );
    assert_eq!(out["average"], json!({ "quantitative": 0.0, "qualitative": "AI" }));

    let out = request_ok(
        &mut stdin,
        &mut reader,
        "6",
        "calc.classAverage",
        json!({ "subjectAverages": [70.0, 89.75] }),
    );
    assert_eq!(out["display"], json!("79.9"));

    let code = request_err(&mut stdin, &mut reader, "7", "calc.band", json!({ "quantitative": "90" }));
    assert_eq!(code, "bad_params");

    let config = request_ok(&mut stdin, &mut reader, "8", "calc.config.get", json!({}));
    assert_eq!(config["canonical"], json!(true));
    let code = request_err(
        &mut stdin,
        &mut reader,
        "9",
        "calc.config.update",
        json!({ "bands": { "asMin": 75 } }),
    );
    assert_eq!(code, "no_workspace");
}

#[test]
fn workspace_band_override_applies_until_reset() {
    let workspace = temp_dir("notasd-calc-config");
    let (_child, mut stdin, mut reader) = spawn_sidecar();
    let _ = request_ok(
        &mut stdin,
        &mut reader,
        "1",
        "workspace.select",
        json!({ "path": workspace.to_string_lossy() }),
    );

    let band = request_ok(&mut stdin, &mut reader, "2", "calc.band", json!({ "quantitative": 75 }));
    assert_eq!(band["qualitative"], json!("AF"));

    let updated = request_ok(
        &mut stdin,
        &mut reader,
        "3",
        "calc.config.update",
        json!({ "bands": { "asMin": 75 } }),
    );
    assert_eq!(updated["bands"], json!({ "aaMin": 90.0, "asMin": 75.0, "afMin": 60.0 }));
    assert_eq!(updated["canonical"], json!(false));

    let band = request_ok(&mut stdin, &mut reader, "4", "calc.band", json!({ "quantitative": 75 }));
    assert_eq!(band["qualitative"], json!("AS"));

    // Unlabelled writes are banded with the active scheme.
    let section = request_ok(
        &mut stdin,
        &mut reader,
        "5",
        "sections.create",
        json!({ "gradeName": "7mo", "sectionName": "A" }),
    );
    let section_id = str_field(&section, "sectionId");
    let subject = request_ok(
        &mut stdin,
        &mut reader,
        "6",
        "subjects.create",
        json!({ "sectionId": section_id, "name": "Ciencias" }),
    );
    let student = request_ok(
        &mut stdin,
        &mut reader,
        "7",
        "students.create",
        json!({ "sectionId": section_id, "fullName": "Elena Soto" }),
    );
    let set = request_ok(
        &mut stdin,
        &mut reader,
        "8",
        "grades.set",
        json!({
            "studentId": str_field(&student, "studentId"),
            "subjectId": str_field(&subject, "subjectId"),
            "period": "bimestre_1",
            "quantitative": 75
        }),
    );
    assert_eq!(set["score"]["qualitative"], json!("AS"));

    let code = request_err(
        &mut stdin,
        &mut reader,
        "9",
        "calc.config.update",
        json!({ "bands": { "aaMin": 70 } }),
    );
    assert_eq!(code, "bad_params");

    let reset = request_ok(&mut stdin, &mut reader, "10", "calc.config.reset", json!({}));
    assert_eq!(reset["canonical"], json!(true));
    let band = request_ok(&mut stdin, &mut reader, "11", "calc.band", json!({ "quantitative": 75 }));
    assert_eq!(band["qualitative"], json!("AF"));

    let _ = std::fs::remove_dir_all(workspace);
}

#[test]
fn derived_labels_follow_thresholds_after_reset() {
    let workspace = temp_dir("notasd-calc-config-relabel");
    let (_child, mut stdin, mut reader) = spawn_sidecar();
    let _ = request_ok(
        &mut stdin,
        &mut reader,
        "1",
        "workspace.select",
        json!({ "path": workspace.to_string_lossy() }),
    );
    let section = request_ok(
        &mut stdin,
        &mut reader,
        "2",
        "sections.create",
        json!({ "gradeName": "8vo", "sectionName": "A" }),
    );
    let section_id = str_field(&section, "sectionId");
    let subject = request_ok(
        &mut stdin,
        &mut reader,
        "3",
        "subjects.create",
        json!({ "sectionId": section_id, "name": "Sociales" }),
    );
    let subject_id = str_field(&subject, "subjectId");
    let student = request_ok(
        &mut stdin,
        &mut reader,
        "4",
        "students.create",
        json!({ "sectionId": section_id, "fullName": "Rosa Díaz" }),
    );
    let student_id = str_field(&student, "studentId");

    let _ = request_ok(
        &mut stdin,
        &mut reader,
        "5",
        "calc.config.update",
        json!({ "bands": { "asMin": 75 } }),
    );
    let _ = request_ok(
        &mut stdin,
        &mut reader,
        "6",
        "grades.bulkSet",
        json!({
            "edits": [
                { "studentId": student_id, "subjectId": subject_id, "period": "bimestre_1", "quantitative": 75 },
                { "studentId": student_id, "subjectId": subject_id, "period": "bimestre_2", "quantitative": 75, "qualitative": "AS" }
            ]
        }),
    );
    let _ = request_ok(
        &mut stdin,
        &mut reader,
        "7",
        "grades.importConsolidado",
        json!({
            "sectionId": section_id,
            "payload": [{
                "id_estudiante": 900,
                "nombre_completo": "Tomás Vega",
                "calificaciones": { "sociales-ext": { "bimestre_1": { "cuantitativa": 75 } } }
            }]
        }),
    );

    let _ = request_ok(&mut stdin, &mut reader, "8", "calc.config.reset", json!({}));
    let model = request_ok(
        &mut stdin,
        &mut reader,
        "9",
        "reports.sabanaModel",
        json!({ "sectionId": section_id }),
    );
    assert_eq!(model["bands"]["asMin"], json!(76.0));

    let rows = model["rows"].as_array().expect("rows");
    let rosa = rows
        .iter()
        .find(|r| r["studentId"] == json!(student_id))
        .expect("rosa row");
    // The unlabelled 75 is re-banded with the canonical thresholds.
    assert_eq!(
        rosa["grades"][&subject_id]["bimestre_1"],
        json!({ "qualitative": "AF", "quantitative": 75.0 })
    );
    // An explicit label is kept as sent.
    assert_eq!(
        rosa["grades"][&subject_id]["bimestre_2"],
        json!({ "qualitative": "AS", "quantitative": 75.0 })
    );

    let tomas = rows
        .iter()
        .find(|r| r["fullName"] == json!("Tomás Vega"))
        .expect("imported row");
    let imported_cell = tomas["grades"]
        .as_object()
        .and_then(|g| g.values().find(|v| v["bimestre_1"]["quantitative"] == json!(75.0)))
        .expect("imported subject");
    assert_eq!(imported_cell["bimestre_1"]["qualitative"], json!("AF"));

    let _ = std::fs::remove_dir_all(workspace);
}
