// Report layouts, shared by the text, spreadsheet and parquet writers.

use arrow::datatypes::{DataType, Field, Schema};
use clap::ValueEnum;

use crate::aggregate::{AggregationMode, ReportRow};

#[derive(Copy, Clone, Debug, PartialEq, Eq, PartialOrd, Ord, ValueEnum)]
pub enum OutputFormat {
    Infer,
    Csv,
    CsvGz,
    Parquet,
    Xlsx,
}

pub const SHEET_NAME: &str = "Cell Count Analysis";

pub const GROUP_KEY_COLUMN: &str = "Folder Pair";
pub const PARENT_FOLDER_COLUMN: &str = "Parent Folder";
pub const FILE_PATH_COLUMN: &str = "File Path";
pub const TOTAL_CELLS_COLUMN: &str = "Total Cells";
pub const TOTAL_AREA_COLUMN: &str = "Total Area (µm²)";
pub const DENSITY_COLUMN: &str = "Cell Density (cells/µm²)";

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ReportLayout {
    pub identity_columns: Vec<String>,
    pub area_decimals: usize,
    pub density_decimals: usize,
}

impl ReportLayout {
    pub fn new(mode: AggregationMode, columns: Option<&[String]>) -> ReportLayout {
        match (mode, columns) {
            (AggregationMode::Grouped, _) => ReportLayout {
                identity_columns: vec![GROUP_KEY_COLUMN.to_string()],
                area_decimals: 2,
                density_decimals: 4,
            },
            (AggregationMode::PerFile, Some(columns)) => ReportLayout {
                identity_columns: columns.to_vec(),
                area_decimals: 2,
                density_decimals: 6,
            },
            (AggregationMode::PerFile, None) => ReportLayout {
                identity_columns: vec![
                    PARENT_FOLDER_COLUMN.to_string(),
                    FILE_PATH_COLUMN.to_string(),
                ],
                area_decimals: 2,
                density_decimals: 6,
            },
        }
    }

    pub fn header(&self) -> Vec<String> {
        let mut header = self.identity_columns.clone();
        header.extend(
            [TOTAL_CELLS_COLUMN, TOTAL_AREA_COLUMN, DENSITY_COLUMN]
                .iter()
                .map(|s| s.to_string()),
        );
        header
    }

    pub fn identity_value<'a>(&self, row: &'a ReportRow, i: usize) -> &'a str {
        row.identity.get(i).map(String::as_str).unwrap_or("")
    }

    pub fn format_row(&self, row: &ReportRow) -> Vec<String> {
        let mut record: Vec<String> = (0..self.identity_columns.len())
            .map(|i| self.identity_value(row, i).to_string())
            .collect();
        record.push(row.cells.to_string());
        record.push(format!("{:.*}", self.area_decimals, row.area_um2));
        record.push(format!("{:.*}", self.density_decimals, row.density));
        record
    }

    // Spreadsheets keep full precision and display the same rounding as csv.
    pub fn area_format(&self) -> String {
        excel_number_format(self.area_decimals)
    }

    pub fn density_format(&self) -> String {
        excel_number_format(self.density_decimals)
    }

    // Parquet output keeps the numbers unrounded.
    pub fn schema(&self) -> Schema {
        let mut fields: Vec<Field> = self
            .identity_columns
            .iter()
            .map(|name| Field::new(name, DataType::Utf8, false))
            .collect();
        fields.push(Field::new(TOTAL_CELLS_COLUMN, DataType::UInt64, false));
        fields.push(Field::new(TOTAL_AREA_COLUMN, DataType::Float64, false));
        fields.push(Field::new(DENSITY_COLUMN, DataType::Float64, false));
        Schema::new(fields)
    }
}

fn excel_number_format(decimals: usize) -> String {
    if decimals == 0 {
        "0".to_string()
    } else {
        format!("0.{}", "0".repeat(decimals))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn row(identity: &[&str]) -> ReportRow {
        ReportRow {
            identity: identity.iter().map(|s| s.to_string()).collect(),
            cells: 11,
            area_um2: 1000.0,
            density: 0.011,
        }
    }

    #[test]
    fn test_grouped_layout() {
        let layout = ReportLayout::new(AggregationMode::Grouped, None);
        assert_eq!(
            layout.header(),
            vec![
                "Folder Pair",
                "Total Cells",
                "Total Area (µm²)",
                "Cell Density (cells/µm²)"
            ]
        );
        assert_eq!(
            layout.format_row(&row(&["pair1"])),
            vec!["pair1", "11", "1000.00", "0.0110"]
        );
        assert_eq!(layout.area_format(), "0.00");
        assert_eq!(layout.density_format(), "0.0000");
    }

    #[test]
    fn test_grouped_layout_ignores_columns() {
        let columns = vec!["gene".to_string()];
        let layout = ReportLayout::new(AggregationMode::Grouped, Some(&columns));
        assert_eq!(layout.identity_columns, vec!["Folder Pair".to_string()]);
    }

    #[test]
    fn test_per_file_layouts() {
        let columns = vec!["gene".to_string(), "mouse".to_string()];
        let layout = ReportLayout::new(AggregationMode::PerFile, Some(&columns));
        assert_eq!(layout.header()[..2], ["gene", "mouse"]);
        assert_eq!(
            layout.format_row(&row(&["A", "B"])),
            vec!["A", "B", "11", "1000.00", "0.011000"]
        );

        let layout = ReportLayout::new(AggregationMode::PerFile, None);
        assert_eq!(layout.header()[..2], ["Parent Folder", "File Path"]);
        assert_eq!(layout.density_format(), "0.000000");
        assert_eq!(excel_number_format(0), "0");
        assert_eq!(layout.schema().fields().len(), 5);
    }
}
