use std::path::{Path, PathBuf};

use lmo_adapters::{parse_document, STARSHIP_TEST_PAYLOAD};
use lmo_core::{SchemaFamily, Vehicle};

fn fixture(family: &str) -> String {
    let path: PathBuf = Path::new(env!("CARGO_MANIFEST_DIR"))
        .join("../../fixtures")
        .join(family)
        .join("sample.html");
    std::fs::read_to_string(&path).unwrap_or_else(|e| panic!("reading {}: {e}", path.display()))
}

#[test]
fn falcon_fixture_parses_every_dated_launch_row() {
    let parsed = parse_document(&fixture("falcon"), SchemaFamily::Falcon).expect("parse");

    assert_eq!(parsed.stats.rows_seen, 10);
    assert_eq!(parsed.stats.accepted, 6);
    assert_eq!(parsed.stats.skipped_shape, 3);
    assert_eq!(parsed.stats.skipped_no_date, 1);

    let summary = parsed
        .records
        .iter()
        .map(|r| (r.year, r.payload_mass_kg, r.vehicle))
        .collect::<Vec<_>>();
    assert_eq!(
        summary,
        vec![
            (2010, 0, Vehicle::Falcon9),
            (2015, 0, Vehicle::Falcon9),
            (2015, 2034, Vehicle::Falcon9),
            (2018, 5500, Vehicle::Falcon9),
            (2018, 1250, Vehicle::FalconHeavy),
            (2019, 15600, Vehicle::Falcon9),
        ]
    );

    let first = &parsed.records[0];
    assert_eq!(first.timestamp.to_string(), "2010-06-04 18:45:00");
    assert_eq!(first.raw_orbit, "LEO");
    assert_eq!(first.payload, "Dragon Spacecraft Qualification Unit");

    let roadster = &parsed.records[4];
    assert_eq!(
        roadster.raw_orbit,
        "Heliocentric0.99-1.67 AU[251](close to Mars transfer orbit)"
    );
}

#[test]
fn starship_fixture_uses_its_own_column_map() {
    let parsed = parse_document(&fixture("starship"), SchemaFamily::Starship).expect("parse");

    assert_eq!(parsed.stats.accepted, 3);
    assert_eq!(parsed.stats.skipped_shape, 3);
    assert_eq!(parsed.stats.skipped_no_date, 0);

    let flights = &parsed.records;
    assert_eq!(flights[0].payload, STARSHIP_TEST_PAYLOAD);
    assert_eq!(flights[0].vehicle, Vehicle::Starship { block: Some(1) });
    assert_eq!(flights[0].payload_mass_kg, 0);

    assert_eq!(flights[1].timestamp.to_string(), "2024-06-06 12:50:00");
    assert_eq!(flights[1].payload, STARSHIP_TEST_PAYLOAD);
    assert_eq!(flights[1].vehicle, Vehicle::Starship { block: None });

    assert_eq!(flights[2].payload_mass_kg, 16000);
    assert_eq!(flights[2].vehicle, Vehicle::Starship { block: Some(2) });
    assert!(flights.iter().all(|f| f.raw_orbit == "Transatmospheric"));
}

#[test]
fn falcon_layout_accepts_rows_by_width_only() {
    // Starship rows are 11 wide, which the Falcon family also accepts.
    let parsed = parse_document(&fixture("starship"), SchemaFamily::Falcon).expect("parse");
    assert_eq!(parsed.stats.accepted, 3);
    assert_eq!(parsed.stats.skipped_shape, 2);
}
