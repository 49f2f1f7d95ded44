use fleetsync_core::LineRejection;
use fleetsync_extract::{decode_extract, ExtractLayout, TextEncoding};

fn sample_bytes() -> Vec<u8> {
    let root = std::path::Path::new(env!("CARGO_MANIFEST_DIR")).join("../..");
    std::fs::read(root.join("fixtures/extract/sample.txt")).expect("sample extract fixture")
}

#[test]
fn sample_extract_parses_line_by_line() {
    let decoded = decode_extract(&sample_bytes()).expect("decodes");
    assert_eq!(decoded.encoding, TextEncoding::Latin1);
    assert_eq!(decoded.line_count(), 4);

    let layout = ExtractLayout::default();
    let results: Vec<_> = decoded
        .lines()
        .map(|(number, raw)| layout.parse_line(number, raw))
        .collect();

    let first = results[0].as_ref().expect("line 1 is valid");
    assert_eq!(first.vehicle_id, 51773);
    assert_eq!(first.driver_ref, Some(1234));

    let second = results[1].as_ref().expect("line 2 is valid");
    assert_eq!(second.driver.name, "MARIA S\u{c3}O PEDRO");
    assert_eq!(second.driver_ref, None);
    assert_eq!(second.driver.national_id, None);

    assert!(matches!(
        results[2],
        Err(LineRejection::Layout { found: 4, .. })
    ));
    assert!(matches!(
        results[3],
        Err(LineRejection::IdentityField { ref value }) if value == "6000X"
    ));
}

#[test]
fn check_counts_sample_without_database() {
    let decoded = decode_extract(&sample_bytes()).expect("decodes");
    let report = ExtractLayout::default().check(&decoded);

    assert_eq!(report.total_lines, 4);
    assert_eq!(report.parsed, 2);
    assert_eq!(report.without_national_id, 1);
    assert_eq!(report.placeholder_drivers, 0);
    let rejected_lines: Vec<usize> = report.rejected.iter().map(|(line, _)| *line).collect();
    assert_eq!(rejected_lines, vec![3, 4]);
}
