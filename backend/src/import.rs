//! Spreadsheet imports: base64 encoded CSV exports with one transaction per
//! row, auto-categorized on the way in.

use std::str::FromStr;

use axum::{extract::State, Extension, Json};
use base64::{engine::general_purpose::STANDARD, Engine as _};
use chrono::{Days, NaiveDate};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use uuid::Uuid;

use crate::auth::AuthUser;
use crate::categorizer;
use crate::error::{AppError, AppResult};
use crate::extract::ApiJson;
use crate::routes::AppState;
use crate::transactions::{
    insert_transaction, money_amount, NewTransaction, TxType, MAX_DESCRIPTION_LEN,
};

/// Spreadsheet day 0; serial 25569 is 1970-01-01.
const SERIAL_EPOCH: (i32, u32, u32) = (1899, 12, 30);
const MAX_SERIAL: u64 = 2_958_465; // 9999-12-31

/// One usable data row from an upload.
#[derive(Debug, Clone, PartialEq)]
pub struct ImportRow {
    pub date: NaiveDate,
    pub description: String,
    pub amount: Decimal, // signed, as found in the sheet
    pub reference: Option<String>,
}

#[derive(Debug, Default)]
pub struct ParsedSheet {
    pub rows: Vec<ImportRow>,
    pub skipped: usize,
}

/// Accepts `YYYY-MM-DD` (optionally followed by a time), `YYYY/MM/DD`,
/// `MM/DD/YYYY` or a spreadsheet serial day number.
pub fn parse_date(raw: &str) -> Option<NaiveDate> {
    let raw = raw.trim();
    if raw.is_empty() {
        return None;
    }
    if let Ok(serial) = raw.parse::<f64>() {
        return from_serial(serial);
    }
    let date_part = raw.split(['T', ' ']).next().unwrap_or(raw);
    ["%Y-%m-%d", "%Y/%m/%d", "%m/%d/%Y"]
        .iter()
        .find_map(|fmt| NaiveDate::parse_from_str(date_part, fmt).ok())
}

fn from_serial(serial: f64) -> Option<NaiveDate> {
    if !serial.is_finite() || serial < 1.0 {
        return None;
    }
    let days = serial.floor() as u64;
    if days > MAX_SERIAL {
        return None;
    }
    let (y, m, d) = SERIAL_EPOCH;
    NaiveDate::from_ymd_opt(y, m, d)?.checked_add_days(Days::new(days))
}

/// Parses a signed amount, tolerating currency symbols, thousands separators
/// and accounting-style parentheses for negatives.
pub fn parse_amount(raw: &str) -> Option<Decimal> {
    let mut s = raw.trim();
    let mut negative = false;
    if let Some(inner) = s.strip_prefix('(').and_then(|x| x.strip_suffix(')')) {
        negative = true;
        s = inner.trim();
    }
    let cleaned: String = s
        .chars()
        .filter(|c| !matches!(c, '$' | '€' | '£' | ',' | ' '))
        .collect();
    if cleaned.is_empty() {
        return None;
    }
    let value = Decimal::from_str(&cleaned)
        .or_else(|_| Decimal::from_scientific(&cleaned))
        .ok()?;
    Some(if negative { -value.abs() } else { value })
}

/// Reads the sheet: the first row is a header, then columns are
/// date, description, amount and an optional reference.
pub fn parse_sheet(bytes: &[u8]) -> AppResult<ParsedSheet> {
    let bytes = bytes.strip_prefix(b"\xEF\xBB\xBF").unwrap_or(bytes);
    let mut reader = csv::ReaderBuilder::new()
        .has_headers(true)
        .flexible(true)
        .trim(csv::Trim::All)
        .from_reader(bytes);

    let mut sheet = ParsedSheet::default();
    let mut data_rows = 0usize;
    for (i, record) in reader.byte_records().enumerate() {
        let record =
            record.map_err(|e| AppError::validation(format!("Error processing file: {e}")))?;
        data_rows += 1;
        // A row that is not UTF-8 is skipped like any other unusable row.
        let parsed = csv::StringRecord::from_byte_record(record)
            .ok()
            .and_then(|r| parse_record(&r));
        match parsed {
            Some(row) => sheet.rows.push(row),
            None => {
                tracing::warn!(row = i + 2, "skipping unusable import row");
                sheet.skipped += 1;
            }
        }
    }

    if data_rows == 0 {
        return Err(AppError::validation(
            "File must contain at least a header row and one data row",
        ));
    }
    Ok(sheet)
}

fn parse_record(record: &csv::StringRecord) -> Option<ImportRow> {
    if record.len() < 3 {
        return None;
    }
    let raw_date = record.get(0).unwrap_or("");
    let description = record.get(1).unwrap_or("").trim();
    let raw_amount = record.get(2).unwrap_or("");
    if raw_date.is_empty() || description.is_empty() {
        return None;
    }

    let date = parse_date(raw_date)?;
    let amount = parse_amount(raw_amount).and_then(money_amount)?;
    let description: String = description.chars().take(MAX_DESCRIPTION_LEN).collect();
    let reference = record
        .get(3)
        .map(str::trim)
        .filter(|r| !r.is_empty())
        .map(str::to_string);

    Some(ImportRow {
        date,
        description,
        amount,
        reference,
    })
}

/// Decodes the uploaded payload, accepting an optional `data:` URL prefix.
fn decode_payload(file: &str) -> AppResult<Vec<u8>> {
    let encoded = match file.split_once(";base64,") {
        Some((prefix, rest)) if prefix.starts_with("data:") => rest,
        _ => file,
    };
    let compact: String = encoded.chars().filter(|c| !c.is_whitespace()).collect();
    STANDARD
        .decode(compact)
        .map_err(|_| AppError::validation("File is not valid base64"))
}

fn check_filename(filename: Option<&str>) -> AppResult<()> {
    let name = filename.unwrap_or("").trim().to_ascii_lowercase();
    if name.ends_with(".csv") {
        return Ok(());
    }
    if name.ends_with(".xlsx") || name.ends_with(".xls") {
        return Err(AppError::validation(
            "Binary Excel workbooks are not supported; export the sheet as CSV and upload the .csv file",
        ));
    }
    Err(AppError::validation(
        "Please upload a valid spreadsheet export (.csv)",
    ))
}

pub async fn upload_handler(
    State(state): State<AppState>,
    Extension(user): Extension<AuthUser>,
    ApiJson(req): ApiJson<UploadReq>,
) -> AppResult<Json<UploadResp>> {
    let file = req
        .file
        .as_deref()
        .filter(|f| !f.trim().is_empty())
        .ok_or_else(|| AppError::validation("Please select a file to upload"))?;
    check_filename(req.filename.as_deref())?;

    let bytes = decode_payload(file)?;
    let sheet = parse_sheet(&bytes)?;

    let mut tx = state.pool.begin().await?;
    let mut imported = Vec::with_capacity(sheet.rows.len());
    for row in sheet.rows {
        let category_id =
            categorizer::resolve_category(&mut tx, user.user_id, &row.description).await?;
        let new_tx = NewTransaction {
            occurred_on: row.date,
            description: row.description,
            amount: row.amount.abs(),
            tx_type: TxType::from_signed_amount(row.amount),
            category_id,
            reference: row.reference,
        };
        let id = insert_transaction(&mut *tx, user.user_id, &new_tx).await?;
        imported.push(ImportedTx {
            id,
            date: new_tx.occurred_on,
            description: new_tx.description,
            amount: new_tx.amount,
            tx_type: new_tx.tx_type,
            reference: new_tx.reference,
            category_id,
        });
    }
    tx.commit().await?;

    tracing::info!(
        user_id = %user.user_id,
        imported = imported.len(),
        skipped = sheet.skipped,
        filename = req.filename.as_deref().unwrap_or(""),
        "spreadsheet imported"
    );
    Ok(Json(UploadResp {
        success: true,
        message: "File uploaded and processed successfully".to_string(),
        transactions_processed: imported.len(),
        rows_skipped: sheet.skipped,
        transactions: imported,
    }))
}

pub async fn sample_format_handler() -> Json<Value> {
    Json(json!({
        "expectedFormat": {
            "Column A": "Date (YYYY-MM-DD, MM/DD/YYYY or spreadsheet serial date)",
            "Column B": "Description (Transaction description)",
            "Column C": "Amount (Positive for income, negative for expenses)",
            "Column D": "Reference (Optional - transaction reference)",
        },
        "notes": [
            "First row should contain headers",
            "Upload the sheet exported as CSV, base64 encoded",
            "Amount should be numeric (positive for income, negative for expenses)",
            "Description will be used for automatic categorization",
        ],
    }))
}

#[derive(Deserialize)]
pub struct UploadReq {
    pub file: Option<String>,
    pub filename: Option<String>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ImportedTx {
    pub id: Uuid,
    pub date: NaiveDate,
    pub description: String,
    pub amount: Decimal,
    #[serde(rename = "type")]
    pub tx_type: TxType,
    pub reference: Option<String>,
    pub category_id: Option<i64>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct UploadResp {
    pub success: bool,
    pub message: String,
    pub transactions_processed: usize,
    pub rows_skipped: usize,
    pub transactions: Vec<ImportedTx>,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn d(y: i32, m: u32, day: u32) -> NaiveDate {
        NaiveDate::from_ymd_opt(y, m, day).unwrap()
    }

    #[test]
    fn dates_in_common_layouts() {
        assert_eq!(parse_date("2024-03-15"), Some(d(2024, 3, 15)));
        assert_eq!(parse_date("2024-03-15T10:22:00Z"), Some(d(2024, 3, 15)));
        assert_eq!(parse_date("2024/03/15"), Some(d(2024, 3, 15)));
        assert_eq!(parse_date("03/15/2024"), Some(d(2024, 3, 15)));
        assert_eq!(parse_date("15.03.2024"), None);
        assert_eq!(parse_date(""), None);
    }

    #[test]
    fn spreadsheet_serial_dates() {
        assert_eq!(parse_date("25569"), Some(d(1970, 1, 1)));
        assert_eq!(parse_date("45366"), Some(d(2024, 3, 15)));
        assert_eq!(parse_date("45366.75"), Some(d(2024, 3, 15)));
        assert_eq!(parse_date("0"), None);
        assert_eq!(parse_date("-4"), None);
    }

    #[test]
    fn amounts_with_formatting() {
        assert_eq!(parse_amount("-12.50"), Some(Decimal::new(-1250, 2)));
        assert_eq!(parse_amount("$1,234.56"), Some(Decimal::new(123456, 2)));
        assert_eq!(parse_amount("(45.00)"), Some(Decimal::new(-4500, 2)));
        assert_eq!(parse_amount("abc"), None);
        assert_eq!(parse_amount(""), None);
    }

    #[test]
    fn sheet_rows_are_parsed_and_bad_rows_skipped() {
        let csv = "\u{feff}Date,Description,Amount,Reference\n\
                   2024-01-05,Salary January,3000,PAY-1\n\
                   2024-01-06,Starbucks,-4.75,\n\
                   not-a-date,Broken,-1,\n\
                   2024-01-07,,-3,\n\
                   2024-01-08,Too short\n\
                   45300,Uber ride,-18.20,R-9\n";
        let sheet = parse_sheet(csv.as_bytes()).unwrap();
        assert_eq!(sheet.rows.len(), 3);
        assert_eq!(sheet.skipped, 3);

        let salary = &sheet.rows[0];
        assert_eq!(salary.description, "Salary January");
        assert_eq!(salary.reference.as_deref(), Some("PAY-1"));
        assert_eq!(TxType::from_signed_amount(salary.amount), TxType::Income);

        let coffee = &sheet.rows[1];
        assert_eq!(coffee.reference, None);
        assert_eq!(TxType::from_signed_amount(coffee.amount), TxType::Expense);

        assert_eq!(sheet.rows[2].date, d(2024, 1, 9));
    }

    #[test]
    fn rows_that_are_not_utf8_are_skipped() {
        let bytes: &[u8] = b"Date,Description,Amount\n\
                             2024-01-05,Salary,3000\n\
                             2024-01-06,Caf\xE9 Paris,-4.75\n";
        let sheet = parse_sheet(bytes).unwrap();
        assert_eq!(sheet.rows.len(), 1);
        assert_eq!(sheet.skipped, 1);
        assert_eq!(sheet.rows[0].description, "Salary");
    }

    #[test]
    fn oversized_amounts_are_skipped_and_cents_rounded() {
        let csv = "Date,Description,Amount\n\
                   2024-01-05,Lottery,1e20\n\
                   2024-01-06,Huge,\"-1,000,000,000,000.00\"\n\
                   2024-01-07,Gum,-1.005\n";
        let sheet = parse_sheet(csv.as_bytes()).unwrap();
        assert_eq!(sheet.skipped, 2);
        assert_eq!(sheet.rows.len(), 1);
        assert_eq!(sheet.rows[0].amount, Decimal::new(-101, 2));
    }

    #[test]
    fn header_only_sheet_is_rejected() {
        let err = parse_sheet(b"Date,Description,Amount\n").unwrap_err();
        assert!(err.to_string().contains("at least a header row"));
    }

    #[test]
    fn payload_decoding() {
        let encoded = STANDARD.encode("a,b,c\n1,2,3\n");
        assert_eq!(decode_payload(&encoded).unwrap(), b"a,b,c\n1,2,3\n");
        let data_url = format!("data:text/csv;base64,{encoded}");
        assert_eq!(decode_payload(&data_url).unwrap(), b"a,b,c\n1,2,3\n");
        assert!(decode_payload("%%%").is_err());
    }

    #[test]
    fn only_csv_exports_are_accepted() {
        assert!(check_filename(Some("bank.CSV")).is_ok());
        let err = check_filename(Some("bank.xlsx")).unwrap_err();
        assert!(err.to_string().contains("CSV"));
        assert!(check_filename(Some("bank.pdf")).is_err());
        assert!(check_filename(None).is_err());
    }
}
