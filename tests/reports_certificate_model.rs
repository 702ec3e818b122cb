mod test_support;

use serde_json::json;
use test_support::{request_err, request_ok, spawn_sidecar, str_field, temp_dir};

#[test]
fn certificate_averages_bimesters_and_skips_empty_subjects() {
    let workspace = temp_dir("notasd-certificate");
    let csv_out = workspace.join("certificado.csv");
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
        json!({ "gradeName": "9no", "sectionName": "A" }),
    );
    let section_id = str_field(&section, "sectionId");
    let mut subject_ids = Vec::new();
    for (i, name) in ["Matemática", "Lengua", "Ciencias"].iter().enumerate() {
        let subj = request_ok(
            &mut stdin,
            &mut reader,
            &format!("subj-{}", i),
            "subjects.create",
            json!({ "sectionId": section_id, "name": name }),
        );
        subject_ids.push(str_field(&subj, "subjectId"));
    }
    let student = request_ok(
        &mut stdin,
        &mut reader,
        "3",
        "students.create",
        json!({ "sectionId": section_id, "fullName": "Carla Méndez", "codigoMined": "5521" }),
    );
    let student_id = str_field(&student, "studentId");

    let mut edits = Vec::new();
    let periods = ["bimestre_1", "bimestre_2", "bimestre_3", "bimestre_4"];
    for (period, q) in periods.iter().zip([100.0, 80.0, 60.0, 40.0]) {
        edits.push(json!({
            "studentId": student_id, "subjectId": subject_ids[0], "period": period, "quantitative": q
        }));
    }
    for (period, q) in periods.iter().zip([90.0, 90.0, 90.0, 89.0]) {
        edits.push(json!({
            "studentId": student_id, "subjectId": subject_ids[2], "period": period, "quantitative": q
        }));
    }
    let _ = request_ok(&mut stdin, &mut reader, "4", "grades.bulkSet", json!({ "edits": edits }));

    let model = request_ok(
        &mut stdin,
        &mut reader,
        "5",
        "reports.certificateModel",
        json!({ "sectionId": section_id, "studentId": student_id }),
    );
    assert_eq!(model["student"]["fullName"], json!("Carla Méndez"));
    let subjects = model["subjects"].as_array().expect("subjects");
    assert_eq!(subjects.len(), 3);

    assert_eq!(subjects[0]["final"], json!({ "quantitative": 70.0, "qualitative": "AF" }));
    assert_eq!(subjects[0]["finalDisplay"], json!("70.0"));
    assert_eq!(subjects[0]["countsTowardAverage"], json!(true));

    assert_eq!(subjects[1]["final"], json!({ "quantitative": 0.0, "qualitative": "AI" }));
    assert_eq!(subjects[1]["countsTowardAverage"], json!(false));
    assert_eq!(subjects[1]["bimesters"][0], json!({ "qualitative": "-", "quantitative": null }));

    // Unrounded mean, so 89.75 stays below the AA threshold.
    assert_eq!(subjects[2]["final"], json!({ "quantitative": 89.75, "qualitative": "AS" }));
    assert_eq!(subjects[2]["finalDisplay"], json!("89.8"));

    assert_eq!(model["average"], json!({ "quantitative": 79.875, "qualitative": "AS" }));
    assert_eq!(model["averageDisplay"], json!("79.9"));
    assert_eq!(model["countedSubjects"], json!(2));

    let code = request_err(
        &mut stdin,
        &mut reader,
        "6",
        "reports.certificateModel",
        json!({ "sectionId": section_id, "studentId": "nobody" }),
    );
    assert_eq!(code, "not_found");

    let export = request_ok(
        &mut stdin,
        &mut reader,
        "7",
        "reports.exportCertificateCsv",
        json!({
            "sectionId": section_id,
            "studentId": student_id,
            "outPath": csv_out.to_string_lossy()
        }),
    );
    assert_eq!(export["subjectsExported"], json!(3));
    let csv = std::fs::read_to_string(&csv_out).expect("read certificate csv");
    assert!(csv.contains("Estudiante,Carla Méndez\n"));
    assert!(csv.contains("Matemática,100,80,60,40,70.0,AF\n"));
    assert!(csv.contains("Lengua,-,-,-,-,0.0,AI\n"));
    assert!(csv.lines().any(|l| l.starts_with("Promedio,") && l.contains("79.9")));

    let _ = std::fs::remove_dir_all(workspace);
}

#[test]
fn certificate_with_no_graded_subject_averages_to_zero() {
    let workspace = temp_dir("notasd-certificate-empty");
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
        json!({ "gradeName": "8vo", "sectionName": "C" }),
    );
    let section_id = str_field(&section, "sectionId");
    let _ = request_ok(
        &mut stdin,
        &mut reader,
        "3",
        "subjects.create",
        json!({ "sectionId": section_id, "name": "Inglés" }),
    );
    let student = request_ok(
        &mut stdin,
        &mut reader,
        "4",
        "students.create",
        json!({ "sectionId": section_id, "fullName": "Pedro Alas" }),
    );

    let model = request_ok(
        &mut stdin,
        &mut reader,
        "5",
        "reports.certificateModel",
        json!({ "sectionId": section_id, "studentId": str_field(&student, "studentId") }),
    );
    assert_eq!(model["average"], json!({ "quantitative": 0.0, "qualitative": "AI" }));
    assert_eq!(model["countedSubjects"], json!(0));

    let _ = std::fs::remove_dir_all(workspace);
}
