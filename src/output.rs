// Write the final report as csv, gzipped csv, parquet or an excel workbook.
//
// The report is written to a temporary file next to the target and renamed
// into place once complete, so a failed write never leaves a partial report.

use arrow::array::{ArrayRef, Float64Array, RecordBatch, StringArray, UInt64Array};
use flate2::write::GzEncoder;
use flate2::Compression;
use parquet::arrow::ArrowWriter;
use parquet::basic::{Compression::ZSTD, ZstdLevel};
use parquet::file::properties::WriterProperties;
use rust_xlsxwriter::{Format, Workbook, XlsxError};
use std::fs::create_dir_all;
use std::io::Write;
use std::path::Path;
use std::sync::Arc;
use tempfile::NamedTempFile;

use crate::aggregate::ReportRow;
use crate::errors::{ConfigError, ReportError};
use crate::schemas::{OutputFormat, ReportLayout, SHEET_NAME};

pub fn determine_format(filename: &str, fmt: OutputFormat) -> Result<OutputFormat, ConfigError> {
    if fmt != OutputFormat::Infer {
        return Ok(fmt);
    }

    if filename.ends_with(".csv.gz") {
        Ok(OutputFormat::CsvGz)
    } else if filename.ends_with(".csv") {
        Ok(OutputFormat::Csv)
    } else if filename.ends_with(".parquet") {
        Ok(OutputFormat::Parquet)
    } else if filename.ends_with(".xlsx") {
        Ok(OutputFormat::Xlsx)
    } else {
        Err(ConfigError::UnknownOutputFormat(filename.to_string()))
    }
}

pub fn write_report(
    path: &Path,
    fmt: OutputFormat,
    layout: &ReportLayout,
    rows: &[ReportRow],
) -> Result<(), ReportError> {
    let dir = match path.parent() {
        Some(parent) if !parent.as_os_str().is_empty() => parent,
        _ => Path::new("."),
    };
    create_dir_all(dir)?;

    // removed on drop unless persisted
    let tmp = tempfile::Builder::new()
        .prefix(".cellcount-")
        .tempfile_in(dir)?;
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        tmp.as_file()
            .set_permissions(std::fs::Permissions::from_mode(0o644))?;
    }

    let tmp = match fmt {
        OutputFormat::Csv | OutputFormat::Infer => {
            let mut tmp = write_report_csv(tmp, layout, rows)?;
            tmp.flush()?;
            tmp
        }
        OutputFormat::CsvGz => {
            let encoder = GzEncoder::new(tmp, Compression::default());
            write_report_csv(encoder, layout, rows)?.finish()?
        }
        OutputFormat::Parquet => write_report_parquet(tmp, layout, rows)?,
        OutputFormat::Xlsx => write_report_xlsx(tmp, layout, rows)?,
    };

    tmp.persist(path).map_err(|err| ReportError::Io(err.error))?;

    Ok(())
}

fn write_report_csv<W: Write>(
    output: W,
    layout: &ReportLayout,
    rows: &[ReportRow],
) -> Result<W, ReportError> {
    let mut writer = csv::Writer::from_writer(output);
    writer.write_record(layout.header())?;
    for row in rows {
        writer.write_record(layout.format_row(row))?;
    }
    writer
        .into_inner()
        .map_err(|err| ReportError::Io(err.into_error()))
}

fn write_report_parquet<W: Write + Send>(
    output: W,
    layout: &ReportLayout,
    rows: &[ReportRow],
) -> Result<W, ReportError> {
    let schema = Arc::new(layout.schema());

    let mut columns: Vec<ArrayRef> = (0..layout.identity_columns.len())
        .map(|i| {
            Arc::new(
                rows.iter()
                    .map(|row| Some(layout.identity_value(row, i)))
                    .collect::<StringArray>(),
            ) as ArrayRef
        })
        .collect();
    columns.push(Arc::new(UInt64Array::from(
        rows.iter().map(|row| row.cells).collect::<Vec<u64>>(),
    )));
    columns.push(Arc::new(
        rows.iter().map(|row| Some(row.area_um2)).collect::<Float64Array>(),
    ));
    columns.push(Arc::new(
        rows.iter().map(|row| Some(row.density)).collect::<Float64Array>(),
    ));

    let batch = RecordBatch::try_new(schema.clone(), columns)?;

    let props = WriterProperties::builder()
        .set_compression(ZSTD(ZstdLevel::default()))
        .build();
    let mut writer = ArrowWriter::try_new(output, schema, Some(props))?;
    writer.write(&batch)?;

    Ok(writer.into_inner()?)
}

fn write_report_xlsx<W: Write>(
    mut output: W,
    layout: &ReportLayout,
    rows: &[ReportRow],
) -> Result<W, ReportError> {
    let header_format = Format::new().set_bold();
    let area_format = Format::new().set_num_format(layout.area_format());
    let density_format = Format::new().set_num_format(layout.density_format());

    let mut workbook = Workbook::new();
    let sheet = workbook.add_worksheet();
    sheet.set_name(SHEET_NAME)?;

    for (col, name) in layout.header().into_iter().enumerate() {
        sheet.write_string_with_format(0, excel_col(col)?, name, &header_format)?;
    }

    let nidentity = layout.identity_columns.len();
    for (i, row) in rows.iter().enumerate() {
        let r = u32::try_from(i + 1).map_err(|_| XlsxError::RowColumnLimitError)?;
        for col in 0..nidentity {
            sheet.write_string(r, excel_col(col)?, layout.identity_value(row, col))?;
        }
        sheet.write_number(r, excel_col(nidentity)?, row.cells as f64)?;
        sheet.write_number_with_format(r, excel_col(nidentity + 1)?, row.area_um2, &area_format)?;
        sheet.write_number_with_format(
            r,
            excel_col(nidentity + 2)?,
            row.density,
            &density_format,
        )?;
    }
    sheet.autofit();

    output.write_all(&workbook.save_to_buffer()?)?;
    output.flush()?;
    Ok(output)
}

fn excel_col(col: usize) -> Result<u16, XlsxError> {
    u16::try_from(col).map_err(|_| XlsxError::RowColumnLimitError)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::aggregate::AggregationMode;
    use flate2::read::GzDecoder;
    use parquet::arrow::arrow_reader::ParquetRecordBatchReaderBuilder;
    use std::fs::File;
    use std::io::Read;

    fn rows() -> Vec<ReportRow> {
        vec![
            ReportRow {
                identity: vec!["pair1".to_string()],
                cells: 11,
                area_um2: 1000.0,
                density: 0.011,
            },
            ReportRow {
                identity: vec!["pair2".to_string()],
                cells: 0,
                area_um2: 0.0,
                density: 0.0,
            },
        ]
    }

    const EXPECTED_CSV: &str = "Folder Pair,Total Cells,Total Area (µm²),Cell Density (cells/µm²)\n\
                                pair1,11,1000.00,0.0110\n\
                                pair2,0,0.00,0.0000\n";

    #[test]
    fn test_determine_format() {
        assert_eq!(determine_format("out.csv", OutputFormat::Infer).unwrap(), OutputFormat::Csv);
        assert_eq!(determine_format("out.csv.gz", OutputFormat::Infer).unwrap(), OutputFormat::CsvGz);
        assert_eq!(
            determine_format("out.parquet", OutputFormat::Infer).unwrap(),
            OutputFormat::Parquet
        );
        assert_eq!(determine_format("out.txt", OutputFormat::Csv).unwrap(), OutputFormat::Csv);
        assert_eq!(determine_format("out.xlsx", OutputFormat::Infer).unwrap(), OutputFormat::Xlsx);
        assert!(determine_format("out.xls", OutputFormat::Infer).is_err());
    }

    #[test]
    fn test_write_csv() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested/report.csv");
        let layout = ReportLayout::new(AggregationMode::Grouped, None);
        write_report(&path, OutputFormat::Csv, &layout, &rows()).unwrap();
        assert_eq!(std::fs::read_to_string(&path).unwrap(), EXPECTED_CSV);
    }

    #[test]
    fn test_write_csv_gz() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("report.csv.gz");
        let layout = ReportLayout::new(AggregationMode::Grouped, None);
        write_report(&path, OutputFormat::CsvGz, &layout, &rows()).unwrap();

        let mut content = String::new();
        GzDecoder::new(File::open(&path).unwrap())
            .read_to_string(&mut content)
            .unwrap();
        assert_eq!(content, EXPECTED_CSV);
    }

    #[test]
    fn test_write_parquet() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("report.parquet");
        let layout = ReportLayout::new(AggregationMode::Grouped, None);
        write_report(&path, OutputFormat::Parquet, &layout, &rows()).unwrap();

        let reader = ParquetRecordBatchReaderBuilder::try_new(File::open(&path).unwrap())
            .unwrap()
            .build()
            .unwrap();
        let nrows: usize = reader.map(|batch| batch.unwrap().num_rows()).sum();
        assert_eq!(nrows, 2);
    }

    #[test]
    fn test_write_xlsx() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("cell_count_results.xlsx");
        let layout = ReportLayout::new(AggregationMode::Grouped, None);
        write_report(&path, OutputFormat::Xlsx, &layout, &rows()).unwrap();

        // a workbook is a zip archive
        let bytes = std::fs::read(&path).unwrap();
        assert!(bytes.starts_with(b"PK\x03\x04"));
        assert_eq!(dir_entries(dir.path()), vec!["cell_count_results.xlsx".to_string()]);
    }

    fn dir_entries(dir: &Path) -> Vec<String> {
        let mut names: Vec<String> = std::fs::read_dir(dir)
            .unwrap()
            .map(|entry| entry.unwrap().file_name().to_string_lossy().into_owned())
            .collect();
        names.sort();
        names
    }

    #[test]
    fn test_unwritable_path() {
        let dir = tempfile::tempdir().unwrap();
        let blocker = dir.path().join("blocker");
        std::fs::write(&blocker, b"").unwrap();
        let layout = ReportLayout::new(AggregationMode::Grouped, None);
        let result = write_report(&blocker.join("report.csv"), OutputFormat::Csv, &layout, &rows());
        assert!(matches!(result, Err(ReportError::Io(_))));
    }

    #[test]
    fn test_failed_write_leaves_no_file() {
        // the target is a directory, so the final rename fails after the
        // report has been fully written
        let dir = tempfile::tempdir().unwrap();
        let target = dir.path().join("report.csv");
        std::fs::create_dir(&target).unwrap();
        let layout = ReportLayout::new(AggregationMode::Grouped, None);

        for fmt in [OutputFormat::Csv, OutputFormat::CsvGz, OutputFormat::Parquet, OutputFormat::Xlsx] {
            let result = write_report(&target, fmt, &layout, &rows());
            assert!(matches!(result, Err(ReportError::Io(_))));
            assert_eq!(dir_entries(dir.path()), vec!["report.csv".to_string()]);
            assert!(target.is_dir());
        }
    }

    #[test]
    fn test_overwrites_existing_report() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("report.csv");
        std::fs::write(&path, b"stale").unwrap();
        let layout = ReportLayout::new(AggregationMode::Grouped, None);
        write_report(&path, OutputFormat::Csv, &layout, &rows()).unwrap();
        assert_eq!(std::fs::read_to_string(&path).unwrap(), EXPECTED_CSV);
        assert_eq!(dir_entries(dir.path()), vec!["report.csv".to_string()]);
    }
}
