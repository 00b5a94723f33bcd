//! # Data Loading and Validation Module
//!
//! This module is the only entry point for user-provided measurements. It
//! reads the first worksheet of the respirometry workbook (or a delimited
//! export of it), repairs the header row, validates the columns the model needs and hands back an
//! immutable [`Observations`] set.
//!
//! - Strict schema: the analysis needs exactly the columns `animal`, `exact`,
//!   `oxygen_cons`, `percentdailytotal`, `age`, `sex`, `pool_temp` and `kcal`
//!   (after header repair).
//! - Categorical grouping: `animal` and `sex` always become [`Factor`]s, even
//!   when the file stores numeric subject codes.
//! - No numeric transformation happens here. Values are read as they are.

use ndarray::{Array1, ArrayView1};
use polars::prelude::*;
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use std::fmt;
use std::fs::File;
use std::path::Path;
use thiserror::Error;

/// Continuous covariates that can enter the model as smooth terms or `by`
/// variables.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Covariate {
    /// Elapsed time since feeding, in minutes (`exact`).
    Time,
    /// Proportion of the daily caloric intake (`percentdailytotal`).
    Proportion,
    Age,
    /// Pool temperature (`pool_temp`).
    PoolTemp,
}

impl Covariate {
    /// Column name of the covariate in the repaired input header.
    pub fn column_name(self) -> &'static str {
        match self {
            Covariate::Time => "exact",
            Covariate::Proportion => "percentdailytotal",
            Covariate::Age => "age",
            Covariate::PoolTemp => "pool_temp",
        }
    }
}

impl fmt::Display for Covariate {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.column_name())
    }
}

/// A categorical variable stored as integer codes into a sorted level list.
///
/// Levels are ordered naturally (`"2"` sorts before `"10"`), and the first
/// level acts as the reference level for treatment contrasts.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Factor {
    levels: Vec<String>,
    codes: Vec<usize>,
}

impl Factor {
    pub fn from_labels<I, S>(labels: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let labels: Vec<String> = labels.into_iter().map(Into::into).collect();
        let mut levels: Vec<String> = labels
            .iter()
            .cloned()
            .collect::<HashSet<_>>()
            .into_iter()
            .collect();
        // natord treats labels differing only in whitespace as equal.
        levels.sort_by(|a, b| natord::compare(a, b).then_with(|| a.cmp(b)));

        let positions: HashMap<&str, usize> = levels
            .iter()
            .enumerate()
            .map(|(i, level)| (level.as_str(), i))
            .collect();
        let codes: Vec<usize> = labels
            .iter()
            .map(|label| positions[label.as_str()])
            .collect();

        Self { levels, codes }
    }

    pub fn levels(&self) -> &[String] {
        &self.levels
    }

    pub fn codes(&self) -> &[usize] {
        &self.codes
    }

    pub fn len(&self) -> usize {
        self.codes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.codes.is_empty()
    }

    pub fn num_levels(&self) -> usize {
        self.levels.len()
    }

    /// The level label of observation `row`.
    pub fn label(&self, row: usize) -> &str {
        &self.levels[self.codes[row]]
    }

    pub fn position(&self, level: &str) -> Option<usize> {
        self.levels.iter().position(|l| l == level)
    }

    /// Number of observations per level, in level order.
    pub fn counts(&self) -> Vec<usize> {
        let mut counts = vec![0; self.levels.len()];
        for &code in &self.codes {
            counts[code] += 1;
        }
        counts
    }

    /// Observed relative frequency of each level, in level order.
    pub fn frequencies(&self) -> Vec<f64> {
        let n = self.codes.len().max(1) as f64;
        self.counts().into_iter().map(|c| c as f64 / n).collect()
    }

    /// The most frequent level. Ties resolve to the earliest level.
    pub fn modal_level(&self) -> Option<&str> {
        let counts = self.counts();
        let mut best: Option<(usize, usize)> = None;
        for (idx, &count) in counts.iter().enumerate() {
            match best {
                Some((_, best_count)) if best_count >= count => {}
                _ => best = Some((idx, count)),
            }
        }
        best.map(|(idx, _)| self.levels[idx].as_str())
    }
}

/// The validated observation set. One entry per measurement event.
#[derive(Debug, Clone, PartialEq)]
pub struct Observations {
    /// Subject identifier, always categorical.
    pub animal: Factor,
    /// Minutes since feeding.
    pub exact: Array1<f64>,
    /// Oxygen consumption, the response.
    pub oxygen_cons: Array1<f64>,
    /// Proportion of the daily caloric intake fed in the session.
    pub percent_daily_total: Array1<f64>,
    pub age: Array1<f64>,
    pub sex: Factor,
    pub pool_temp: Array1<f64>,
    /// Absolute caloric intake, only used to colour plots.
    pub kcal: Vec<Option<f64>>,
}

impl Observations {
    /// Assembles an observation set from already validated columns.
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        animal: Factor,
        exact: Array1<f64>,
        oxygen_cons: Array1<f64>,
        percent_daily_total: Array1<f64>,
        age: Array1<f64>,
        sex: Factor,
        pool_temp: Array1<f64>,
        kcal: Vec<Option<f64>>,
    ) -> Result<Self, LoadError> {
        let n = oxygen_cons.len();
        let lengths = [
            ("animal", animal.len()),
            ("exact", exact.len()),
            ("percentdailytotal", percent_daily_total.len()),
            ("age", age.len()),
            ("sex", sex.len()),
            ("pool_temp", pool_temp.len()),
            ("kcal", kcal.len()),
        ];
        for (column, len) in lengths {
            if len != n {
                return Err(LoadError::LengthMismatch {
                    column: column.to_string(),
                    found: len,
                    expected: n,
                });
            }
        }
        Ok(Self {
            animal,
            exact,
            oxygen_cons,
            percent_daily_total,
            age,
            sex,
            pool_temp,
            kcal,
        })
    }

    pub fn len(&self) -> usize {
        self.oxygen_cons.len()
    }

    pub fn is_empty(&self) -> bool {
        self.oxygen_cons.is_empty()
    }

    pub fn covariate(&self, covariate: Covariate) -> ArrayView1<'_, f64> {
        match covariate {
            Covariate::Time => self.exact.view(),
            Covariate::Proportion => self.percent_daily_total.view(),
            Covariate::Age => self.age.view(),
            Covariate::PoolTemp => self.pool_temp.view(),
        }
    }
}

/// A comprehensive error type for all data loading and validation failures.
#[derive(Error, Debug)]
pub enum LoadError {
    #[error("Error from the underlying Polars DataFrame library: {0}")]
    PolarsError(#[from] PolarsError),
    #[error("IO error: {0}")]
    IoError(#[from] std::io::Error),
    #[error("Failed to read the header row: {0}")]
    HeaderError(#[from] csv::Error),
    #[error("Failed to read the workbook: {0}")]
    WorkbookError(#[from] calamine::Error),
    #[error("The workbook '{0}' contains no worksheets.")]
    EmptyWorkbook(String),
    #[error(
        "The required column '{0}' was not found in the input file (after header repair). Please check spelling."
    )]
    ColumnNotFound(String),
    #[error(
        "The required column '{column_name}' could not be converted to the expected type '{expected_type}'. (Found type: {found_type})"
    )]
    ColumnWrongType {
        column_name: String,
        expected_type: &'static str,
        found_type: String,
    },
    #[error("Missing values were found in the required column '{0}'.")]
    MissingValuesFound(String),
    #[error("Non-finite values (NaN or Infinity) were found in the required column '{0}'.")]
    NonFiniteValuesFound(String),
    #[error("Input file contains only {found} data rows, but at least {required} are required.")]
    InsufficientRows { found: usize, required: usize },
    #[error("Column '{column}' has {found} entries but the response has {expected}.")]
    LengthMismatch {
        column: String,
        found: usize,
        expected: usize,
    },
}

/// Loads and validates the observation set from a workbook or a delimited
/// text file.
///
/// Workbooks (`.xlsx`, `.xlsm`, `.xlsb`, `.xls`, `.ods`) are read from their
/// first worksheet. Other files are comma separated unless the extension is
/// `.tsv`, `.tab` or `.txt`, in which case tabs are used. `NA` and empty
/// cells are read as missing.
pub fn load_observations(path: &Path) -> Result<Observations, LoadError> {
    internal::load(path)
}

/// Repairs a raw header row so that every name is well formed and unique.
///
/// Names are trimmed and lower-cased; runs of characters other than ASCII
/// letters and digits collapse into a single `_`; leading and trailing `_`
/// are dropped. Empty names become `x`, names starting with a digit get an
/// `x` prefix, and repeated names receive `_2`, `_3`, ... suffixes.
pub fn repair_column_names<S: AsRef<str>>(raw: &[S]) -> Vec<String> {
    let mut seen: HashSet<String> = HashSet::with_capacity(raw.len());
    let mut repaired = Vec::with_capacity(raw.len());

    for name in raw {
        let mut cleaned = String::with_capacity(name.as_ref().len());
        let mut pending_separator = false;
        for ch in name.as_ref().trim().chars() {
            if ch.is_ascii_alphanumeric() {
                if pending_separator && !cleaned.is_empty() {
                    cleaned.push('_');
                }
                pending_separator = false;
                cleaned.push(ch.to_ascii_lowercase());
            } else {
                pending_separator = true;
            }
        }
        if cleaned.is_empty() {
            cleaned.push('x');
        } else if cleaned.starts_with(|c: char| c.is_ascii_digit()) {
            cleaned.insert(0, 'x');
        }

        let mut candidate = cleaned.clone();
        let mut suffix = 2;
        while seen.contains(&candidate) {
            candidate = format!("{cleaned}_{suffix}");
            suffix += 1;
        }
        seen.insert(candidate.clone());
        repaired.push(candidate);
    }

    repaired
}

/// Internal module for the loading logic.
mod internal {
    use super::*;
    use calamine::{Data, Reader, open_workbook_auto};

    const MINIMUM_ROWS: usize = 10;

    const NUMERIC_COLUMNS: [&str; 5] = [
        "exact",
        "oxygen_cons",
        "percentdailytotal",
        "age",
        "pool_temp",
    ];
    const CATEGORICAL_COLUMNS: [&str; 2] = ["animal", "sex"];
    const OPTIONAL_VALUE_COLUMNS: [&str; 1] = ["kcal"];

    const MISSING_MARKER: &str = "NA";

    enum SourceFormat {
        Delimited(u8),
        Workbook,
    }

    fn format_for(path: &Path) -> SourceFormat {
        let extension = path
            .extension()
            .and_then(|e| e.to_str())
            .map(str::to_ascii_lowercase)
            .unwrap_or_default();
        match extension.as_str() {
            "xlsx" | "xlsm" | "xlsb" | "xls" | "ods" => SourceFormat::Workbook,
            "tsv" | "tab" | "txt" => SourceFormat::Delimited(b'\t'),
            _ => SourceFormat::Delimited(b','),
        }
    }

    fn log_repair(raw_names: &[String], names: &[String]) {
        if names != raw_names {
            log::info!("Repaired header {raw_names:?} -> {names:?}");
        }
    }

    fn read_delimited(path: &Path, separator: u8) -> Result<DataFrame, LoadError> {
        // The header is repaired before Polars sees any names.
        let mut header_reader = csv::ReaderBuilder::new()
            .delimiter(separator)
            .has_headers(true)
            .from_reader(File::open(path)?);
        let raw_names: Vec<String> = header_reader
            .headers()?
            .iter()
            .map(str::to_string)
            .collect();
        let names = repair_column_names(&raw_names);
        log_repair(&raw_names, &names);

        let mut df = CsvReader::new(File::open(path)?)
            .with_options(
                CsvReadOptions::default()
                    .with_has_header(true)
                    .with_parse_options(
                        CsvParseOptions::default()
                            .with_separator(separator)
                            .with_null_values(Some(NullValues::AllColumnsSingle(
                                MISSING_MARKER.into(),
                            ))),
                    ),
            )
            .finish()?;
        df.set_column_names(names.iter().map(String::as_str))?;
        Ok(df)
    }

    /// A non-missing worksheet cell.
    enum SheetCell {
        Number(f64),
        Text(String),
    }

    impl SheetCell {
        fn from_data(data: &Data) -> Option<Self> {
            match data {
                Data::Empty | Data::Error(_) => None,
                Data::Int(v) => Some(SheetCell::Number(*v as f64)),
                Data::Float(v) => Some(SheetCell::Number(*v)),
                Data::DateTime(v) => Some(SheetCell::Number(v.as_f64())),
                Data::String(text) => {
                    let trimmed = text.trim();
                    if trimmed.is_empty() || trimmed == MISSING_MARKER {
                        None
                    } else {
                        Some(SheetCell::Text(text.clone()))
                    }
                }
                other => Some(SheetCell::Text(other.to_string())),
            }
        }

        fn into_text(self) -> String {
            match self {
                SheetCell::Number(v) => v.to_string(),
                SheetCell::Text(text) => text,
            }
        }
    }

    /// Builds one column, numeric when every present cell is a number.
    fn worksheet_column(name: &str, cells: Vec<Option<SheetCell>>) -> Column {
        let all_numeric = cells
            .iter()
            .flatten()
            .all(|cell| matches!(cell, SheetCell::Number(_)));
        if all_numeric {
            let values: Vec<Option<f64>> = cells
                .into_iter()
                .map(|cell| match cell {
                    Some(SheetCell::Number(v)) => Some(v),
                    _ => None,
                })
                .collect();
            Column::new(name.into(), values)
        } else {
            let values: Vec<Option<String>> = cells
                .into_iter()
                .map(|cell| cell.map(SheetCell::into_text))
                .collect();
            Column::new(name.into(), values)
        }
    }

    fn read_workbook(path: &Path) -> Result<DataFrame, LoadError> {
        if !path.exists() {
            return Err(LoadError::IoError(std::io::Error::new(
                std::io::ErrorKind::NotFound,
                format!("'{}' does not exist", path.display()),
            )));
        }
        let mut workbook = open_workbook_auto(path)?;
        let range = workbook
            .worksheet_range_at(0)
            .ok_or_else(|| LoadError::EmptyWorkbook(path.display().to_string()))??;

        let mut rows = range.rows();
        let raw_names: Vec<String> = rows
            .next()
            .map(|header| {
                header
                    .iter()
                    .map(|data| {
                        SheetCell::from_data(data)
                            .map(SheetCell::into_text)
                            .unwrap_or_default()
                    })
                    .collect()
            })
            .unwrap_or_default();
        let names = repair_column_names(&raw_names);
        log_repair(&raw_names, &names);

        let mut cells: Vec<Vec<Option<SheetCell>>> =
            names.iter().map(|_| Vec::with_capacity(range.height())).collect();
        for row in rows {
            let parsed: Vec<Option<SheetCell>> = row.iter().map(SheetCell::from_data).collect();
            // Blank rows below the data are not observations.
            if parsed.iter().all(Option::is_none) {
                continue;
            }
            for (column, cell) in cells.iter_mut().zip(parsed) {
                column.push(cell);
            }
        }

        let columns: Vec<Column> = names
            .iter()
            .zip(cells)
            .map(|(name, column)| worksheet_column(name, column))
            .collect();
        Ok(DataFrame::new(columns)?)
    }

    fn validate_is_finite(values: &[f64], column_name: &str) -> Result<(), LoadError> {
        if values.iter().any(|v| !v.is_finite()) {
            return Err(LoadError::NonFiniteValuesFound(column_name.to_string()));
        }
        Ok(())
    }

    fn cast_to_f64(df: &DataFrame, column_name: &str) -> Result<Column, LoadError> {
        let column = df.column(column_name)?;
        let casted = column
            .cast(&DataType::Float64)
            .map_err(|_| LoadError::ColumnWrongType {
                column_name: column_name.to_string(),
                expected_type: "f64 (numeric)",
                found_type: format!("{:?}", column.dtype()),
            })?;
        // A strict cast failure shows up as fresh nulls.
        if casted.null_count() > column.null_count() {
            return Err(LoadError::ColumnWrongType {
                column_name: column_name.to_string(),
                expected_type: "f64 (numeric)",
                found_type: format!("{:?}", column.dtype()),
            });
        }
        Ok(casted)
    }

    fn extract_numeric_column(df: &DataFrame, column_name: &str) -> Result<Vec<f64>, LoadError> {
        if df.column(column_name)?.null_count() > 0 {
            return Err(LoadError::MissingValuesFound(column_name.to_string()));
        }
        let casted = cast_to_f64(df, column_name)?;
        let values: Vec<f64> = casted.f64()?.rechunk().into_no_null_iter().collect();
        validate_is_finite(&values, column_name)?;
        Ok(values)
    }

    fn extract_optional_column(
        df: &DataFrame,
        column_name: &str,
    ) -> Result<Vec<Option<f64>>, LoadError> {
        let casted = cast_to_f64(df, column_name)?;
        let values: Vec<Option<f64>> = casted.f64()?.rechunk().into_iter().collect();
        if values.iter().flatten().any(|v| !v.is_finite()) {
            return Err(LoadError::NonFiniteValuesFound(column_name.to_string()));
        }
        Ok(values)
    }

    fn extract_categorical_column(df: &DataFrame, column_name: &str) -> Result<Factor, LoadError> {
        let column = df.column(column_name)?;
        if column.null_count() > 0 {
            return Err(LoadError::MissingValuesFound(column_name.to_string()));
        }
        let casted = column.cast(&DataType::String)?;
        let labels: Vec<String> = casted
            .str()?
            .into_no_null_iter()
            .map(|label| label.trim().to_string())
            .collect();
        if labels.iter().any(String::is_empty) {
            return Err(LoadError::MissingValuesFound(column_name.to_string()));
        }
        Ok(Factor::from_labels(labels))
    }

    pub(super) fn load(path: &Path) -> Result<Observations, LoadError> {
        log::info!("Loading observations from '{}'", path.display());
        let df = match format_for(path) {
            SourceFormat::Workbook => read_workbook(path)?,
            SourceFormat::Delimited(separator) => read_delimited(path, separator)?,
        };

        if df.height() < MINIMUM_ROWS {
            return Err(LoadError::InsufficientRows {
                found: df.height(),
                required: MINIMUM_ROWS,
            });
        }

        for required in CATEGORICAL_COLUMNS
            .iter()
            .chain(NUMERIC_COLUMNS.iter())
            .chain(OPTIONAL_VALUE_COLUMNS.iter())
        {
            if df.get_column_index(required).is_none() {
                return Err(LoadError::ColumnNotFound(required.to_string()));
            }
        }

        let animal = extract_categorical_column(&df, "animal")?;
        let sex = extract_categorical_column(&df, "sex")?;
        let exact = Array1::from_vec(extract_numeric_column(&df, "exact")?);
        let oxygen_cons = Array1::from_vec(extract_numeric_column(&df, "oxygen_cons")?);
        let percent_daily_total =
            Array1::from_vec(extract_numeric_column(&df, "percentdailytotal")?);
        let age = Array1::from_vec(extract_numeric_column(&df, "age")?);
        let pool_temp = Array1::from_vec(extract_numeric_column(&df, "pool_temp")?);
        let kcal = extract_optional_column(&df, "kcal")?;

        log::info!(
            "Loaded {} observations from {} animals ({} sex levels).",
            oxygen_cons.len(),
            animal.num_levels(),
            sex.num_levels()
        );

        Observations::new(
            animal,
            exact,
            oxygen_cons,
            percent_daily_total,
            age,
            sex,
            pool_temp,
            kcal,
        )
    }
}

// --- Unit Tests ---
#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_abs_diff_eq;
    use std::io::{self, Write};
    use tempfile::NamedTempFile;

    fn create_test_file(content: &str, suffix: &str) -> io::Result<NamedTempFile> {
        let mut file = tempfile::Builder::new().suffix(suffix).tempfile()?;
        writeln!(file, "{}", content)?;
        file.flush()?;
        Ok(file)
    }

    fn generate_rows(header: &str, num_rows: usize, row: impl Fn(usize) -> String) -> String {
        let mut lines = Vec::with_capacity(num_rows + 1);
        lines.push(header.to_string());
        lines.extend((0..num_rows).map(row));
        lines.join("\n")
    }

    const HEADER: &str = "animal,exact,oxygen_cons,percentdailytotal,age,sex,pool_temp,kcal";

    fn valid_row(i: usize) -> String {
        format!(
            "{},{},{:.2},{:.2},{:.1},{},{:.1},{}",
            i % 3 + 1,
            i * 10,
            1.0 + i as f64 / 10.0,
            0.1 + (i % 4) as f64 * 0.05,
            20.0 + (i % 3) as f64,
            if i % 4 == 0 { "M" } else { "F" },
            22.0 + (i % 5) as f64 * 0.2,
            if i == 2 { "NA".to_string() } else { format!("{}", 1000 + i) }
        )
    }

    #[test]
    fn test_load_observations_success() {
        let content = generate_rows(HEADER, 12, valid_row);
        let file = create_test_file(&content, ".csv").unwrap();
        let obs = load_observations(file.path()).unwrap();

        assert_eq!(obs.len(), 12);
        assert_abs_diff_eq!(obs.exact[3], 30.0, epsilon = 1e-12);
        assert_abs_diff_eq!(obs.oxygen_cons[5], 1.5, epsilon = 1e-12);
        assert_abs_diff_eq!(obs.pool_temp[4], 22.8, epsilon = 1e-12);
        assert_eq!(obs.kcal[2], None);
        assert_eq!(obs.kcal[3], Some(1003.0));

        // Numeric subject codes become categorical labels.
        assert_eq!(obs.animal.levels(), &["1", "2", "3"]);
        assert_eq!(obs.animal.label(4), "2");
        assert_eq!(obs.sex.levels(), &["F", "M"]);
        assert_eq!(obs.sex.modal_level(), Some("F"));
    }

    #[test]
    fn test_tab_separated_input_and_header_repair() {
        let header = "Animal\tExact\tOxygen Cons\tPercentDailyTotal\tAge\tSex\tPool Temp\tkcal\tkcal";
        let content = generate_rows(header, 10, |i| {
            format!("a{}\t{}\t1.0\t0.2\t20\tF\t23\t900\t{}", i % 2, i, i)
        });
        let file = create_test_file(&content, ".tsv").unwrap();
        let obs = load_observations(file.path()).unwrap();
        assert_eq!(obs.len(), 10);
        assert_eq!(obs.animal.num_levels(), 2);
        assert_eq!(obs.kcal[0], Some(900.0));
    }

    #[test]
    fn test_repair_column_names_makes_unique_well_formed_names() {
        let repaired = repair_column_names(&["Pool Temp", "pool_temp", "", "2nd", " Oxygen  (cons) "]);
        assert_eq!(
            repaired,
            vec!["pool_temp", "pool_temp_2", "x", "x2nd", "oxygen_cons"]
        );
    }

    #[test]
    fn test_error_column_not_found() {
        let header = "animal,exact,oxygen_cons,percentdailytotal,age,sex,kcal";
        let content = generate_rows(header, 12, |i| format!("1,{i},1.0,0.2,20,F,900"));
        let file = create_test_file(&content, ".csv").unwrap();
        match load_observations(file.path()).unwrap_err() {
            LoadError::ColumnNotFound(col) => assert_eq!(col, "pool_temp"),
            other => panic!("Expected ColumnNotFound(pool_temp), got {:?}", other),
        }
    }

    #[test]
    fn test_error_missing_values() {
        let content = generate_rows(HEADER, 12, |i| {
            if i == 7 {
                "1,70,,0.2,20,F,23,900".to_string()
            } else {
                valid_row(i)
            }
        });
        let file = create_test_file(&content, ".csv").unwrap();
        match load_observations(file.path()) {
            Err(LoadError::MissingValuesFound(col)) => assert_eq!(col, "oxygen_cons"),
            other => panic!("Expected MissingValuesFound(oxygen_cons), got {:?}", other),
        }
    }

    #[test]
    fn test_error_wrong_type() {
        let content = generate_rows(HEADER, 12, |i| {
            format!("1,{i},1.0,0.2,not_a_number,F,23,900")
        });
        let file = create_test_file(&content, ".csv").unwrap();
        match load_observations(file.path()) {
            Err(LoadError::ColumnWrongType { column_name, .. }) => assert_eq!(column_name, "age"),
            other => panic!("Expected ColumnWrongType for 'age', got {:?}", other),
        }
    }

    #[test]
    fn test_error_insufficient_rows() {
        let content = generate_rows(HEADER, 4, valid_row);
        let file = create_test_file(&content, ".csv").unwrap();
        match load_observations(file.path()).unwrap_err() {
            LoadError::InsufficientRows { found, required } => {
                assert_eq!(found, 4);
                assert_eq!(required, 10);
            }
            other => panic!("Expected InsufficientRows, got {:?}", other),
        }
    }

    #[test]
    fn test_error_missing_file_and_workbook() {
        let missing = Path::new("/definitely/not/here/observations.csv");
        assert!(matches!(
            load_observations(missing),
            Err(LoadError::IoError(_))
        ));

        let workbook = Path::new("/definitely/not/here/respirometry.xlsx");
        assert!(matches!(
            load_observations(workbook),
            Err(LoadError::IoError(_))
        ));
    }

    #[test]
    fn test_load_first_worksheet_of_workbook() -> Result<(), Box<dyn std::error::Error>> {
        let dir = tempfile::tempdir()?;
        let path = dir.path().join("respirometry.xlsx");

        let mut workbook = rust_xlsxwriter::Workbook::new();
        let sheet = workbook.add_worksheet();
        let header = [
            "Animal",
            "Exact",
            "Oxygen Cons",
            "PercentDailyTotal",
            "Age",
            "Sex",
            "Pool Temp",
            "kcal",
        ];
        for (col, name) in header.iter().enumerate() {
            sheet.write_string(0, col as u16, *name)?;
        }
        for i in 0..12u32 {
            let row = i + 1;
            let f = i as f64;
            sheet.write_number(row, 0, (i % 3 + 1) as f64)?;
            sheet.write_number(row, 1, f * 10.0)?;
            sheet.write_number(row, 2, 1.0 + f / 10.0)?;
            sheet.write_number(row, 3, 0.2)?;
            sheet.write_number(row, 4, 20.0 + (i % 3) as f64)?;
            sheet.write_string(row, 5, if i % 4 == 0 { "M" } else { "F" })?;
            sheet.write_number(row, 6, 22.5)?;
            // Row 2 leaves kcal blank, row 3 marks it NA.
            match i {
                2 => {}
                3 => {
                    sheet.write_string(row, 7, "NA")?;
                }
                _ => {
                    sheet.write_number(row, 7, 1000.0 + f)?;
                }
            }
        }
        let notes = workbook.add_worksheet();
        notes.write_string(0, 0, "not observations")?;
        workbook.save(&path)?;

        let obs = load_observations(&path)?;
        assert_eq!(obs.len(), 12);
        assert_abs_diff_eq!(obs.exact[3], 30.0, epsilon = 1e-12);
        assert_abs_diff_eq!(obs.oxygen_cons[5], 1.5, epsilon = 1e-12);
        assert_eq!(obs.kcal[2], None);
        assert_eq!(obs.kcal[3], None);
        assert_eq!(obs.kcal[4], Some(1004.0));
        assert_eq!(obs.animal.levels(), &["1", "2", "3"]);
        assert_eq!(obs.sex.levels(), &["F", "M"]);
        Ok(())
    }

    #[test]
    fn test_workbook_text_in_numeric_column_is_wrong_type()
    -> Result<(), Box<dyn std::error::Error>> {
        let dir = tempfile::tempdir()?;
        let path = dir.path().join("respirometry.xlsx");

        let mut workbook = rust_xlsxwriter::Workbook::new();
        let sheet = workbook.add_worksheet();
        for (col, name) in HEADER.split(',').enumerate() {
            sheet.write_string(0, col as u16, name)?;
        }
        for i in 0..10u32 {
            let row = i + 1;
            sheet.write_number(row, 0, 1.0)?;
            sheet.write_number(row, 1, i as f64)?;
            sheet.write_number(row, 2, 1.0)?;
            sheet.write_number(row, 3, 0.2)?;
            if i == 6 {
                sheet.write_string(row, 4, "adult")?;
            } else {
                sheet.write_number(row, 4, 20.0)?;
            }
            sheet.write_string(row, 5, "F")?;
            sheet.write_number(row, 6, 23.0)?;
            sheet.write_number(row, 7, 900.0)?;
        }
        workbook.save(&path)?;

        match load_observations(&path) {
            Err(LoadError::ColumnWrongType { column_name, .. }) => assert_eq!(column_name, "age"),
            other => panic!("Expected ColumnWrongType for 'age', got {:?}", other),
        }
        Ok(())
    }

    #[test]
    fn test_factor_natural_ordering_and_frequencies() {
        let factor = Factor::from_labels(["10", "2", "2", "1", "10", "10"]);
        assert_eq!(factor.levels(), &["1", "2", "10"]);
        assert_eq!(factor.counts(), vec![1, 2, 3]);
        assert_eq!(factor.modal_level(), Some("10"));
        assert_abs_diff_eq!(factor.frequencies()[1], 2.0 / 6.0, epsilon = 1e-12);
        assert_eq!(factor.label(0), "10");
    }

    #[test]
    fn test_factor_keeps_whitespace_variants_apart() {
        let factor = Factor::from_labels(["Dolphin1", "Dolphin 1", "Dolphin1"]);
        assert_eq!(factor.levels(), &["Dolphin 1", "Dolphin1"]);
        assert_eq!(factor.codes(), &[1, 0, 1]);
        assert_eq!(factor.counts(), vec![1, 2]);
        assert_eq!(factor.label(1), "Dolphin 1");
    }
}
