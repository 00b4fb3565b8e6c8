//! Launch-table extraction and row parsing for the Falcon and Starship layouts.

use std::sync::LazyLock;

use chrono::{Datelike, NaiveDate, NaiveDateTime};
use lmo_core::{LaunchRecord, SchemaFamily, Vehicle};
use regex::Regex;
use scraper::{ElementRef, Html, Selector};
use serde::Serialize;
use thiserror::Error;
use tracing::debug;

pub const CRATE_NAME: &str = "lmo-adapters";

pub const LAUNCH_TABLE_SELECTOR: &str = "table.wikitable";

/// Payload label for Starship flights that carried nothing named.
pub const STARSHIP_TEST_PAYLOAD: &str = "Starship Test";

const MONTHS: [&str; 12] = [
    "jan", "feb", "mar", "apr", "may", "jun", "jul", "aug", "sep", "oct", "nov", "dec",
];

static DAY_MONTH_YEAR_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"([0-9]{1,2})\s+(\w+)\s*([0-9]{4})").expect("date pattern is valid")
});
static MONTH_DAY_YEAR_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(\w+)\s+([0-9]{1,2}),?\s*([0-9]{4})").expect("date pattern is valid")
});
static CLOCK_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"([0-9]{2}):([0-9]{2})").expect("clock pattern is valid"));
static MASS_RANGE_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)([0-9][0-9,]*)\s*(?:-|to)\s*([0-9][0-9,]*)").expect("range pattern is valid")
});
static FIRST_INT_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"[0-9][0-9,]*").expect("integer pattern is valid"));
static APPROX_KG_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"~?([0-9,]+)\s*kg").expect("kg pattern is valid"));
static BLOCK_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"Block\s+([0-9]+)").expect("block pattern is valid"));

/// Failures that mean the upstream layout drifted; they abort the run.
#[derive(Debug, Error)]
pub enum ParseError {
    #[error("unrecognised month {month:?} in date cell {cell:?}")]
    UnknownMonth { month: String, cell: String },
    #[error("impossible calendar date in cell {cell:?}")]
    InvalidDate { cell: String },
    #[error("impossible clock time in cell {cell:?}")]
    InvalidTime { cell: String },
    #[error("row has {width} cells, column {index} is missing")]
    MissingCell { index: usize, width: usize },
    #[error("invalid selector: {0}")]
    Selector(String),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RawCell {
    /// Concatenated text content, trimmed.
    pub text: String,
    /// Text nodes trimmed individually and joined with one space.
    pub spaced: String,
}

impl RawCell {
    fn from_element(cell: ElementRef<'_>) -> Self {
        let text = cell.text().collect::<String>().trim().to_string();
        let spaced = cell
            .text()
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .collect::<Vec<_>>()
            .join(" ");
        Self { text, spaced }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RawRow {
    pub cells: Vec<RawCell>,
}

impl RawRow {
    pub fn cell(&self, index: usize) -> Result<&RawCell, ParseError> {
        self.cells.get(index).ok_or(ParseError::MissingCell {
            index,
            width: self.cells.len(),
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SkipReason {
    /// `td` count outside the family's accepted widths.
    CellCount(usize),
    /// Date cell matched neither date pattern.
    NoDate,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RowOutcome {
    Accepted(LaunchRecord),
    Skipped(SkipReason),
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct ParseStats {
    pub rows_seen: usize,
    pub accepted: usize,
    pub skipped_shape: usize,
    pub skipped_no_date: usize,
}

impl ParseStats {
    pub fn record(&mut self, outcome: &RowOutcome) {
        self.rows_seen += 1;
        match outcome {
            RowOutcome::Accepted(_) => self.accepted += 1,
            RowOutcome::Skipped(SkipReason::CellCount(_)) => self.skipped_shape += 1,
            RowOutcome::Skipped(SkipReason::NoDate) => self.skipped_no_date += 1,
        }
    }

    pub fn absorb(&mut self, other: &ParseStats) {
        self.rows_seen += other.rows_seen;
        self.accepted += other.accepted;
        self.skipped_shape += other.skipped_shape;
        self.skipped_no_date += other.skipped_no_date;
    }

    pub fn skipped(&self) -> usize {
        self.skipped_shape + self.skipped_no_date
    }
}

#[derive(Debug, Clone, Default)]
pub struct DocumentParse {
    pub records: Vec<LaunchRecord>,
    pub stats: ParseStats,
}

fn selector(css: &str) -> Result<Selector, ParseError> {
    Selector::parse(css).map_err(|e| ParseError::Selector(e.to_string()))
}

/// Walks every launch table row, returning accepted rows or the shape that was rejected.
pub fn extract_rows(
    html: &str,
    family: SchemaFamily,
) -> Result<Vec<Result<RawRow, SkipReason>>, ParseError> {
    let document = Html::parse_document(html);
    let table_sel = selector(LAUNCH_TABLE_SELECTOR)?;
    let row_sel = selector("tr")?;
    let cell_sel = selector("td")?;

    let mut rows = Vec::new();
    for table in document.select(&table_sel) {
        for row in table.select(&row_sel) {
            let cells = row
                .select(&cell_sel)
                .map(RawCell::from_element)
                .collect::<Vec<_>>();
            if family.accepts_cell_count(cells.len()) {
                rows.push(Ok(RawRow { cells }));
            } else {
                rows.push(Err(SkipReason::CellCount(cells.len())));
            }
        }
    }
    Ok(rows)
}

/// Extracts and parses every launch row of one document.
pub fn parse_document(html: &str, family: SchemaFamily) -> Result<DocumentParse, ParseError> {
    let mut parsed = DocumentParse::default();
    for row in extract_rows(html, family)? {
        let outcome = match row {
            Ok(row) => parse_row(&row, family)?,
            Err(reason) => RowOutcome::Skipped(reason),
        };
        parsed.stats.record(&outcome);
        match outcome {
            RowOutcome::Accepted(record) => parsed.records.push(record),
            RowOutcome::Skipped(reason) => debug!(%family, ?reason, "skipping table row"),
        }
    }
    Ok(parsed)
}

pub fn parse_row(row: &RawRow, family: SchemaFamily) -> Result<RowOutcome, ParseError> {
    let columns = family.column_map();
    let date_cell = row.cell(columns.date)?;
    let Some(timestamp) = parse_launch_timestamp(&date_cell.spaced)? else {
        return Ok(RowOutcome::Skipped(SkipReason::NoDate));
    };

    let vehicle_text = &row.cell(columns.vehicle)?.text;
    let payload = row.cell(columns.payload)?.text.clone();
    let mass_text = &row.cell(columns.mass)?.text;
    let raw_orbit = row.cell(columns.orbit)?.text.clone();
    let succeeded = outcome_is_success(&row.cell(columns.outcome)?.text);

    let record = match family {
        SchemaFamily::Falcon => LaunchRecord {
            year: timestamp.year(),
            raw_orbit,
            payload,
            payload_mass_kg: if succeeded {
                parse_falcon_mass(mass_text)
            } else {
                0
            },
            timestamp,
            vehicle: falcon_vehicle(vehicle_text),
        },
        SchemaFamily::Starship => LaunchRecord {
            year: timestamp.year(),
            raw_orbit,
            payload: if payload.is_empty() || payload == "—" {
                STARSHIP_TEST_PAYLOAD.to_string()
            } else {
                payload
            },
            payload_mass_kg: if succeeded {
                parse_starship_mass(mass_text)
            } else {
                0
            },
            timestamp,
            vehicle: starship_vehicle(vehicle_text),
        },
    };
    Ok(RowOutcome::Accepted(record))
}

fn outcome_is_success(outcome: &str) -> bool {
    outcome.to_lowercase().contains("success")
}

fn month_number(name: &str, cell: &str) -> Result<u32, ParseError> {
    let prefix = name.chars().take(3).collect::<String>().to_lowercase();
    MONTHS
        .iter()
        .position(|m| *m == prefix)
        .map(|idx| idx as u32 + 1)
        .ok_or_else(|| ParseError::UnknownMonth {
            month: name.to_string(),
            cell: cell.to_string(),
        })
}

/// `D Month YYYY[ HH:MM]`, else `Month D, YYYY`. `Ok(None)` when neither matches.
pub fn parse_launch_timestamp(cell: &str) -> Result<Option<NaiveDateTime>, ParseError> {
    let (day, month_name, year) = if let Some(caps) = DAY_MONTH_YEAR_RE.captures(cell) {
        (caps[1].to_string(), caps[2].to_string(), caps[3].to_string())
    } else if let Some(caps) = MONTH_DAY_YEAR_RE.captures(cell) {
        (caps[2].to_string(), caps[1].to_string(), caps[3].to_string())
    } else {
        return Ok(None);
    };

    let month = month_number(&month_name, cell)?;
    let invalid_date = || ParseError::InvalidDate {
        cell: cell.to_string(),
    };
    let day: u32 = day.parse().map_err(|_| invalid_date())?;
    let year: i32 = year.parse().map_err(|_| invalid_date())?;
    let date = NaiveDate::from_ymd_opt(year, month, day).ok_or_else(invalid_date)?;

    let timestamp = match CLOCK_RE.captures(cell) {
        Some(caps) => {
            let hour: u32 = caps[1].parse().unwrap_or(u32::MAX);
            let minute: u32 = caps[2].parse().unwrap_or(u32::MAX);
            date.and_hms_opt(hour, minute, 0)
                .ok_or_else(|| ParseError::InvalidTime {
                    cell: cell.to_string(),
                })?
        }
        None => date.and_hms_opt(0, 0, 0).ok_or_else(invalid_date)?,
    };

    Ok(Some(timestamp))
}

fn parse_grouped_int(digits: &str) -> Option<u64> {
    digits.replace(',', "").parse().ok()
}

/// Rounds `(a + b) / 2` half-to-even.
fn midpoint(a: u64, b: u64) -> u64 {
    let sum = a.saturating_add(b);
    let half = sum / 2;
    if sum % 2 == 1 && half % 2 == 1 {
        half + 1
    } else {
        half
    }
}

/// Falcon mass cell: range midpoint, else first integer, else 0.
pub fn parse_falcon_mass(text: &str) -> u64 {
    let normalized = text.trim().replace(['\u{2013}', '\u{2014}'], "-");

    if let Some(caps) = MASS_RANGE_RE.captures(&normalized) {
        if let (Some(a), Some(b)) = (parse_grouped_int(&caps[1]), parse_grouped_int(&caps[2])) {
            return midpoint(a, b);
        }
    }

    FIRST_INT_RE
        .find(&normalized)
        .and_then(|m| parse_grouped_int(m.as_str()))
        .unwrap_or(0)
}

/// Starship mass cell: the `~NNN kg` figure, else 0.
pub fn parse_starship_mass(text: &str) -> u64 {
    APPROX_KG_RE
        .captures(text)
        .and_then(|caps| parse_grouped_int(&caps[1]))
        .unwrap_or(0)
}

fn falcon_vehicle(booster: &str) -> Vehicle {
    if booster.contains("Heavy") || booster.contains("FH") {
        Vehicle::FalconHeavy
    } else {
        Vehicle::Falcon9
    }
}

fn starship_vehicle(ship_version: &str) -> Vehicle {
    let block = BLOCK_RE
        .captures(ship_version)
        .and_then(|caps| caps[1].parse().ok());
    Vehicle::Starship { block }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn cell(text: &str) -> RawCell {
        RawCell {
            text: text.to_string(),
            spaced: text.to_string(),
        }
    }

    fn falcon_row(
        date: &str,
        booster: &str,
        payload: &str,
        mass: &str,
        orbit: &str,
        outcome: &str,
    ) -> RawRow {
        RawRow {
            cells: vec![
                cell(date),
                cell(booster),
                cell("CCSFS, SLC-40"),
                cell(payload),
                cell(mass),
                cell(orbit),
                cell("SpaceX"),
                cell(outcome),
                cell("Success (drone ship)"),
            ],
        }
    }

    fn starship_row(date: &str, ship: &str, payload: &str, mass: &str, outcome: &str) -> RawRow {
        RawRow {
            cells: vec![
                cell(date),
                cell("1"),
                cell(ship),
                cell("Starbase"),
                cell(payload),
                cell(mass),
                cell("Transatmospheric"),
                cell("SpaceX"),
                cell(outcome),
                cell("Precautionary"),
                cell("Precautionary"),
            ],
        }
    }

    fn accepted(outcome: RowOutcome) -> LaunchRecord {
        match outcome {
            RowOutcome::Accepted(record) => record,
            RowOutcome::Skipped(reason) => panic!("row skipped: {reason:?}"),
        }
    }

    #[test]
    fn falcon_mass_handles_ranges_and_approximations() {
        assert_eq!(parse_falcon_mass("5,000–6,000 kg"), 5500);
        assert_eq!(parse_falcon_mass("5000-6000 kg"), 5500);
        assert_eq!(parse_falcon_mass("3,000 to 4,001 kg"), 3500);
        assert_eq!(parse_falcon_mass("~16,000 kg"), 16000);
        assert_eq!(parse_falcon_mass("13,260 kg (29,230 lb)[7]"), 13260);
        assert_eq!(parse_falcon_mass("—"), 0);
        assert_eq!(parse_falcon_mass("Classified"), 0);
        assert_eq!(parse_falcon_mass(""), 0);
    }

    #[test]
    fn range_midpoint_rounds_half_to_even() {
        assert_eq!(midpoint(1001, 1002), 1002);
        assert_eq!(midpoint(1000, 1001), 1000);
        assert_eq!(midpoint(4, 4), 4);
    }

    #[test]
    fn starship_mass_reads_kilogram_figure() {
        assert_eq!(parse_starship_mass("~16,000 kg (35,000 lb)[54]"), 16000);
        assert_eq!(parse_starship_mass("100 t"), 0);
        assert_eq!(parse_starship_mass("—"), 0);
    }

    #[test]
    fn dates_accept_both_layouts() {
        let dmy = parse_launch_timestamp("4 June 2010 18:45").unwrap().unwrap();
        assert_eq!(dmy.to_string(), "2010-06-04 18:45:00");

        let mdy = parse_launch_timestamp("December 21, 2015 01:29[12]").unwrap().unwrap();
        assert_eq!(mdy.to_string(), "2015-12-21 01:29:00");

        let no_time = parse_launch_timestamp("7 Jan 2018").unwrap().unwrap();
        assert_eq!(no_time.to_string(), "2018-01-07 00:00:00");

        assert_eq!(parse_launch_timestamp("Late 2026").unwrap(), None);
        assert_eq!(parse_launch_timestamp("").unwrap(), None);
    }

    #[test]
    fn unknown_month_is_fatal() {
        let err = parse_launch_timestamp("4 Brumaire 2010").unwrap_err();
        assert!(matches!(err, ParseError::UnknownMonth { .. }));

        let err = parse_launch_timestamp("31 February 2021").unwrap_err();
        assert!(matches!(err, ParseError::InvalidDate { .. }));
    }

    #[test]
    fn failed_outcome_forces_zero_mass() {
        let row = falcon_row(
            "28 June 2015 14:21",
            "F9 v1.1",
            "SpaceX CRS-7",
            "1,952 kg",
            "LEO (ISS)",
            "Failure",
        );
        let record = accepted(parse_row(&row, SchemaFamily::Falcon).unwrap());
        assert_eq!(record.payload_mass_kg, 0);
        assert_eq!(record.year, 2015);
    }

    #[test]
    fn falcon_rows_classify_heavy_boosters() {
        let row = falcon_row(
            "6 February 2018 20:45",
            "Falcon Heavy B1033",
            "Elon Musk's Tesla Roadster",
            "1,250 kg",
            "Heliocentric",
            "Success",
        );
        let record = accepted(parse_row(&row, SchemaFamily::Falcon).unwrap());
        assert_eq!(record.vehicle, Vehicle::FalconHeavy);
        assert_eq!(record.payload_mass_kg, 1250);

        let fh = falcon_row(
            "25 June 2019 06:30",
            "FH B1057",
            "STP-2",
            "3,700 kg",
            "MEO",
            "Success",
        );
        assert_eq!(
            accepted(parse_row(&fh, SchemaFamily::Falcon).unwrap()).vehicle,
            Vehicle::FalconHeavy
        );
    }

    #[test]
    fn starship_rows_use_block_tag_and_test_payload() {
        let row = starship_row("20 April 2023 13:33", "Ship 24 (Block 1)", "—", "—", "Failure");
        let record = accepted(parse_row(&row, SchemaFamily::Starship).unwrap());
        assert_eq!(record.payload, STARSHIP_TEST_PAYLOAD);
        assert_eq!(record.vehicle, Vehicle::Starship { block: Some(1) });
        assert_eq!(record.payload_mass_kg, 0);

        let row = starship_row(
            "26 August 2025 23:30",
            "S37",
            "Mass simulators",
            "~16,000 kg",
            "Success",
        );
        let record = accepted(parse_row(&row, SchemaFamily::Starship).unwrap());
        assert_eq!(record.vehicle, Vehicle::Starship { block: None });
        assert_eq!(record.payload_mass_kg, 16000);
    }

    #[test]
    fn undated_rows_are_skipped_not_failed() {
        let row = falcon_row("Late 2026", "F9 B5", "TBA", "—", "LEO", "Planned");
        assert_eq!(
            parse_row(&row, SchemaFamily::Falcon).unwrap(),
            RowOutcome::Skipped(SkipReason::NoDate)
        );
    }

    #[test]
    fn extractor_filters_rows_by_cell_count() {
        let html = r#"
            <table class="wikitable">
              <tr><th>Date</th><th>Booster</th></tr>
              <tr><th>1</th><td>4 June 2010<br>18:45</td><td>F9 v1.0</td><td>CCAFS</td>
                  <td>Dragon</td><td>—</td><td>LEO</td><td>SpaceX</td><td>Success</td><td>Failure</td></tr>
              <tr><td colspan="9">Maiden flight.</td></tr>
            </table>
            <table class="infobox"><tr><td>1</td><td>2</td><td>3</td><td>4</td><td>5</td>
              <td>6</td><td>7</td><td>8</td><td>9</td></tr></table>
        "#;
        let rows = extract_rows(html, SchemaFamily::Falcon).unwrap();
        assert_eq!(rows.len(), 3);
        assert_eq!(rows[0], Err(SkipReason::CellCount(0)));
        assert_eq!(rows[2], Err(SkipReason::CellCount(1)));
        let row = rows[1].as_ref().unwrap();
        assert_eq!(row.cells[0].spaced, "4 June 2010 18:45");
        assert_eq!(row.cells[0].text, "4 June 201018:45");

        let parsed = parse_document(html, SchemaFamily::Falcon).unwrap();
        assert_eq!(parsed.records.len(), 1);
        assert_eq!(parsed.stats.skipped_shape, 2);
        assert_eq!(parsed.stats.rows_seen, 3);
    }
}
