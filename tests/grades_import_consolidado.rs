mod test_support;

use serde_json::json;
use test_support::{request_err, request_ok, spawn_sidecar, str_field, temp_dir};

fn payload() -> serde_json::Value {
    json!({
        "materias": [
            { "id_materia": 12, "nombre": "Lengua", "orden": 2 },
            { "id_materia": 11, "nombre": "Matemática", "orden": 1 }
        ],
        "estudiantes": [
            {
                "id_estudiante": 501,
                "nombre_completo": "Sofía Rivas",
                "codigo_mined": 20240501,
                "genero": "f",
                "calificaciones": {
                    "11": {
                        "bimestre_1": { "cualitativa": "AS", "cuantitativa": "80" },
                        "bimestre_2": { "cualitativa": "AA", "cuantitativa": 90 },
                        "bimestre_3": { "cualitativa": "-", "cuantitativa": 0 },
                        "semestre_2": { "cualitativa": "AF", "cuantitativa": 70 }
                    },
                    "99": {
                        "bimestre_1": { "cuantitativa": 65 }
                    }
                },
                "promedio": { "cualitativa": "AA", "cuantitativa": 95 }
            },
            {
                "id_estudiante": "502",
                "nombre_completo": "Mario Cruz",
                "genero": "M"
            }
        ]
    })
}

#[test]
fn import_upserts_roster_and_scores() {
    let workspace = temp_dir("notasd-import-consolidado");
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
        json!({ "gradeName": "7mo", "sectionName": "A" }),
    );
    let section_id = str_field(&section, "sectionId");

    let summary = request_ok(
        &mut stdin,
        &mut reader,
        "3",
        "grades.importConsolidado",
        json!({ "sectionId": section_id, "payload": payload() }),
    );
    assert_eq!(summary["studentsCreated"], json!(2));
    assert_eq!(summary["studentsUpdated"], json!(0));
    // Two catalog subjects plus a placeholder for the unknown key "99".
    assert_eq!(summary["subjectsCreated"], json!(3));
    assert_eq!(summary["scoresWritten"], json!(5));
    assert_eq!(summary["promediosWritten"], json!(1));

    let subjects = request_ok(
        &mut stdin,
        &mut reader,
        "4",
        "subjects.list",
        json!({ "sectionId": section_id }),
    );
    let names: Vec<&str> = subjects["subjects"]
        .as_array()
        .expect("subjects")
        .iter()
        .filter_map(|s| s["name"].as_str())
        .collect();
    assert_eq!(&names[..2], &["Matemática", "Lengua"]);
    assert!(names.contains(&"99"));

    let students = request_ok(
        &mut stdin,
        &mut reader,
        "5",
        "students.list",
        json!({ "sectionId": section_id }),
    );
    let sofia = &students["students"][0];
    assert_eq!(sofia["fullName"], json!("Sofía Rivas"));
    assert_eq!(sofia["codigoMined"], json!("20240501"));
    assert_eq!(sofia["genero"], json!("F"));
    assert_eq!(sofia["externalId"], json!("501"));
    let sofia_id = str_field(sofia, "id");

    let model = request_ok(
        &mut stdin,
        &mut reader,
        "6",
        "reports.sabanaModel",
        json!({ "sectionId": section_id }),
    );
    let matematica_id = subjects["subjects"][0]["id"].as_str().expect("subject id").to_string();
    let row = model["rows"]
        .as_array()
        .and_then(|rows| rows.iter().find(|r| r["studentId"] == json!(sofia_id)))
        .expect("sofia row");
    let mat = &row["grades"][&matematica_id];
    assert_eq!(mat["bimestre_1"], json!({ "qualitative": "AS", "quantitative": 80.0 }));
    assert_eq!(mat["bimestre_3"]["qualitative"], json!("-"));
    assert_eq!(mat["semestre_1"]["quantitative"], json!(85.0));
    assert_eq!(mat["final"], json!({ "qualitative": "AS", "quantitative": 78.0 }));
    // Stored promedio wins over the derived one.
    assert_eq!(row["promedio"], json!({ "qualitative": "AA", "quantitative": 95.0 }));
    assert_eq!(row["promedioDerived"], json!(false));

    // Re-import updates the same students instead of duplicating them.
    let again = request_ok(
        &mut stdin,
        &mut reader,
        "7",
        "grades.importConsolidado",
        json!({ "sectionId": section_id, "payload": payload() }),
    );
    assert_eq!(again["studentsCreated"], json!(0));
    assert_eq!(again["studentsUpdated"], json!(2));
    assert_eq!(again["subjectsCreated"], json!(0));

    let _ = std::fs::remove_dir_all(workspace);
}

#[test]
fn import_rejects_malformed_payloads() {
    let workspace = temp_dir("notasd-import-bad");
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
        json!({ "gradeName": "7mo", "sectionName": "A" }),
    );
    let section_id = str_field(&section, "sectionId");

    let code = request_err(
        &mut stdin,
        &mut reader,
        "3",
        "grades.importConsolidado",
        json!({
            "sectionId": section_id,
            "payload": [
                { "id_estudiante": 1, "nombre_completo": "A" },
                { "id_estudiante": 1, "nombre_completo": "B" }
            ]
        }),
    );
    assert_eq!(code, "consolidado_parse_failed");

    let code = request_err(
        &mut stdin,
        &mut reader,
        "4",
        "grades.importConsolidado",
        json!({ "sectionId": "missing", "payload": [] }),
    );
    assert_eq!(code, "not_found");

    let students = request_ok(
        &mut stdin,
        &mut reader,
        "5",
        "students.list",
        json!({ "sectionId": section_id }),
    );
    assert_eq!(students["students"].as_array().map(|a| a.len()), Some(0));

    let _ = std::fs::remove_dir_all(workspace);
}
