//! Core domain model and orbit normalization for LMO.

use std::fmt;
use std::sync::LazyLock;

use chrono::NaiveDateTime;
use regex::Regex;
use serde::{Deserialize, Serialize};
use tracing::debug;

pub const CRATE_NAME: &str = "lmo-core";

/// Column layout family of a launch-list document.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SchemaFamily {
    Falcon,
    Starship,
}

/// Cell indices of the fields a parser reads from one table row.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ColumnMap {
    pub date: usize,
    pub vehicle: usize,
    pub payload: usize,
    pub mass: usize,
    pub orbit: usize,
    pub outcome: usize,
}

const FALCON_COLUMNS: ColumnMap = ColumnMap {
    date: 0,
    vehicle: 1,
    payload: 3,
    mass: 4,
    orbit: 5,
    outcome: 7,
};

const STARSHIP_COLUMNS: ColumnMap = ColumnMap {
    date: 0,
    vehicle: 2,
    payload: 4,
    mass: 5,
    orbit: 6,
    outcome: 8,
};

impl SchemaFamily {
    pub fn column_map(self) -> ColumnMap {
        match self {
            SchemaFamily::Falcon => FALCON_COLUMNS,
            SchemaFamily::Starship => STARSHIP_COLUMNS,
        }
    }

    /// `td` counts of data rows; anything else is a header, footer or note row.
    pub fn accepted_cell_counts(self) -> &'static [usize] {
        match self {
            SchemaFamily::Falcon => &[9, 11],
            SchemaFamily::Starship => &[11],
        }
    }

    pub fn accepts_cell_count(self, count: usize) -> bool {
        self.accepted_cell_counts().contains(&count)
    }
}

impl fmt::Display for SchemaFamily {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SchemaFamily::Falcon => f.write_str("falcon"),
            SchemaFamily::Starship => f.write_str("starship"),
        }
    }
}

/// One upstream launch-list document.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Source {
    pub id: String,
    pub url: String,
    pub family: SchemaFamily,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum Vehicle {
    Falcon9,
    FalconHeavy,
    Starship { block: Option<u32> },
}

impl fmt::Display for Vehicle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Vehicle::Falcon9 => f.write_str("Falcon 9"),
            Vehicle::FalconHeavy => f.write_str("Falcon Heavy"),
            Vehicle::Starship { block: Some(n) } => write!(f, "Block {n} Starship"),
            Vehicle::Starship { block: None } => f.write_str("Starship"),
        }
    }
}

/// One accepted table row. `payload_mass_kg` is zero unless the launch succeeded.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LaunchRecord {
    pub year: i32,
    pub raw_orbit: String,
    pub payload: String,
    pub payload_mass_kg: u64,
    pub timestamp: NaiveDateTime,
    pub vehicle: Vehicle,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum OrbitCategory {
    #[serde(rename = "LEO (Starlink)")]
    LeoStarlink,
    #[serde(rename = "LEO (Other)")]
    LeoOther,
    #[serde(rename = "SSO (Starlink)")]
    SsoStarlink,
    #[serde(rename = "SSO (Other)")]
    SsoOther,
    #[serde(rename = "MEO")]
    Meo,
    #[serde(rename = "GTO/GEO")]
    GtoGeo,
    #[serde(rename = "BLT")]
    Blt,
    Heliocentric,
    Transatmospheric,
    Other,
}

impl OrbitCategory {
    /// Legend order. Downstream charts stack and colour columns in this order.
    pub const ALL: [OrbitCategory; 10] = [
        OrbitCategory::LeoStarlink,
        OrbitCategory::LeoOther,
        OrbitCategory::SsoStarlink,
        OrbitCategory::SsoOther,
        OrbitCategory::Meo,
        OrbitCategory::GtoGeo,
        OrbitCategory::Blt,
        OrbitCategory::Heliocentric,
        OrbitCategory::Transatmospheric,
        OrbitCategory::Other,
    ];

    pub fn label(self) -> &'static str {
        match self {
            OrbitCategory::LeoStarlink => "LEO (Starlink)",
            OrbitCategory::LeoOther => "LEO (Other)",
            OrbitCategory::SsoStarlink => "SSO (Starlink)",
            OrbitCategory::SsoOther => "SSO (Other)",
            OrbitCategory::Meo => "MEO",
            OrbitCategory::GtoGeo => "GTO/GEO",
            OrbitCategory::Blt => "BLT",
            OrbitCategory::Heliocentric => "Heliocentric",
            OrbitCategory::Transatmospheric => "Transatmospheric",
            OrbitCategory::Other => "Other",
        }
    }

    /// Position in [`OrbitCategory::ALL`].
    pub fn legend_index(self) -> usize {
        self as usize
    }
}

impl fmt::Display for OrbitCategory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.label())
    }
}

const STARLINK_MARKER: &str = "Starlink";

static FOOTNOTE_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\[.*?\]").expect("footnote pattern is valid"));

/// Known raw orbit labels after footnote stripping.
const ORBIT_TABLE: &[(&str, OrbitCategory)] = &[
    ("Ballistic lunar transfer (BLT)", OrbitCategory::Blt),
    ("GEO", OrbitCategory::GtoGeo),
    ("GTO", OrbitCategory::GtoGeo),
    ("HEO for P/2 orbit", OrbitCategory::Other),
    ("Heliocentric", OrbitCategory::Heliocentric),
    (
        "Heliocentric0.99-1.67 AU(close to Mars transfer orbit)",
        OrbitCategory::Heliocentric,
    ),
    ("LEO", OrbitCategory::LeoOther),
    ("LEO (ISS)", OrbitCategory::LeoOther),
    ("LEO (Starlink)", OrbitCategory::LeoStarlink),
    ("LEO / MEO", OrbitCategory::Other),
    ("MEO", OrbitCategory::Meo),
    ("Polar LEO", OrbitCategory::LeoOther),
    ("Polar orbit LEO", OrbitCategory::LeoOther),
    ("Retrograde LEO", OrbitCategory::LeoOther),
    ("SSO", OrbitCategory::SsoOther),
    ("SSO (Starlink)", OrbitCategory::SsoStarlink),
    ("Sun-Earth L1 insertion", OrbitCategory::Other),
    ("Sun-Earth L2 injection", OrbitCategory::Other),
    ("Transatmospheric", OrbitCategory::Transatmospheric),
    // Starship test flights list the orbit as a dash.
    ("—", OrbitCategory::Transatmospheric),
];

/// Appends the Starlink qualifier when the payload names a Starlink batch.
pub fn qualify_starlink(payload: &str, raw_orbit: &str) -> String {
    if payload.contains(STARLINK_MARKER) {
        format!("{raw_orbit} ({STARLINK_MARKER})")
    } else {
        raw_orbit.to_string()
    }
}

/// Maps an orbit label to its canonical category. Unknown labels are `Other`.
pub fn classify_orbit_label(label: &str) -> OrbitCategory {
    let cleaned = FOOTNOTE_RE.replace_all(label, "");
    let cleaned = cleaned.trim();
    match ORBIT_TABLE.iter().find(|(known, _)| *known == cleaned) {
        Some((_, category)) => *category,
        None => {
            debug!(orbit = cleaned, "unmapped orbit label, classifying as Other");
            OrbitCategory::Other
        }
    }
}

/// A launch record with its Starlink-qualified orbit label and category.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClassifiedLaunch {
    pub record: LaunchRecord,
    pub qualified_orbit: String,
    pub category: OrbitCategory,
}

impl ClassifiedLaunch {
    pub fn classify(record: LaunchRecord) -> Self {
        let qualified_orbit = qualify_starlink(&record.payload, &record.raw_orbit);
        let category = classify_orbit_label(&qualified_orbit);
        Self {
            record,
            qualified_orbit,
            category,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SeriesPoint {
    pub day_of_year: u32,
    pub timestamp: NaiveDateTime,
    pub cumulative_mass_kg: u64,
    /// Anchor inserted at a year boundary rather than backed by a launch.
    pub synthetic: bool,
}

/// Cumulative delivered mass over one calendar year. Values never decrease.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct YearSeries {
    pub year: i32,
    pub points: Vec<SeriesPoint>,
}

impl YearSeries {
    pub fn final_mass_kg(&self) -> u64 {
        self.points.last().map(|p| p.cumulative_mass_kg).unwrap_or(0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::NaiveDate;

    fn record(payload: &str, orbit: &str) -> LaunchRecord {
        LaunchRecord {
            year: 2021,
            raw_orbit: orbit.to_string(),
            payload: payload.to_string(),
            payload_mass_kg: 15_600,
            timestamp: NaiveDate::from_ymd_opt(2021, 3, 4)
                .and_then(|d| d.and_hms_opt(8, 24, 0))
                .unwrap(),
            vehicle: Vehicle::Falcon9,
        }
    }

    #[test]
    fn footnote_markers_are_stripped_before_lookup() {
        assert_eq!(classify_orbit_label("GTO[338]"), OrbitCategory::GtoGeo);
        assert_eq!(classify_orbit_label(" LEO[172] "), OrbitCategory::LeoOther);
        assert_eq!(
            classify_orbit_label("Heliocentric0.99-1.67 AU[251](close to Mars transfer orbit)"),
            OrbitCategory::Heliocentric
        );
    }

    #[test]
    fn unknown_labels_fall_back_to_other() {
        for label in ["Polar retrograde orbit XYZ", "", "[1]", "GTO (Starlink)", "leo"] {
            let category = classify_orbit_label(label);
            assert_eq!(category, OrbitCategory::Other, "label {label:?}");
            assert!(OrbitCategory::ALL.contains(&category));
        }
    }

    #[test]
    fn starlink_payload_qualifies_the_orbit() {
        let launch =
            ClassifiedLaunch::classify(record("Starlink Group 1-6 (60 satellites)", "LEO"));
        assert_eq!(launch.qualified_orbit, "LEO (Starlink)");
        assert_eq!(launch.category, OrbitCategory::LeoStarlink);
        assert_eq!(launch.record.raw_orbit, "LEO");

        let sso = ClassifiedLaunch::classify(record("Starlink Group 3-1", "SSO[12]"));
        assert_eq!(sso.qualified_orbit, "SSO[12] (Starlink)");
        assert_eq!(sso.category, OrbitCategory::SsoStarlink);
    }

    #[test]
    fn starlink_qualifier_on_other_bases_is_unmapped() {
        let launch = ClassifiedLaunch::classify(record("Starlink-1", "GTO"));
        assert_eq!(launch.qualified_orbit, "GTO (Starlink)");
        assert_eq!(launch.category, OrbitCategory::Other);
    }

    #[test]
    fn legend_order_matches_index() {
        for (idx, category) in OrbitCategory::ALL.iter().enumerate() {
            assert_eq!(category.legend_index(), idx);
        }
        assert_eq!(OrbitCategory::GtoGeo.to_string(), "GTO/GEO");
    }

    #[test]
    fn schema_families_accept_their_row_widths() {
        assert!(SchemaFamily::Falcon.accepts_cell_count(9));
        assert!(SchemaFamily::Falcon.accepts_cell_count(11));
        assert!(!SchemaFamily::Falcon.accepts_cell_count(10));
        assert!(SchemaFamily::Starship.accepts_cell_count(11));
        assert!(!SchemaFamily::Starship.accepts_cell_count(9));
        assert_eq!(SchemaFamily::Starship.column_map().payload, 4);
    }

    #[test]
    fn vehicle_tags_render_like_the_source_tables() {
        assert_eq!(Vehicle::FalconHeavy.to_string(), "Falcon Heavy");
        assert_eq!(Vehicle::Starship { block: Some(2) }.to_string(), "Block 2 Starship");
        assert_eq!(Vehicle::Starship { block: None }.to_string(), "Starship");
    }
}
