//! Bulk file ingestion
//!
//! Expected headers:
//! counterparty_name,kind,trade_date,voucher_no,amount,cost_amount,memo

use std::io::BufRead;

use crate::reconciliation::row::RawRow;
use crate::types::{EngineError, EngineResult};

/// Parse a tabular import file into candidate rows.
///
/// All-or-nothing: a structurally malformed file fails the whole parse; there
/// is no partial ingest. Row-level *semantic* problems (bad dates, non-numeric
/// amounts) are not detected here; they surface as `error` classifications.
pub fn parse_rows<R: BufRead>(reader: R) -> EngineResult<Vec<RawRow>> {
    let mut csv_reader = csv::ReaderBuilder::new()
        .trim(csv::Trim::All)
        .from_reader(reader);

    let mut rows = Vec::new();
    for (line, record) in csv_reader.deserialize::<RawRow>().enumerate() {
        let row = record.map_err(|e| EngineError::Parse(format!("row {}: {e}", line + 1)))?;
        rows.push(row);
    }
    Ok(rows)
}

#[cfg(test)]
mod tests {
    use super::*;

    const HEADER: &str = "counterparty_name,kind,trade_date,voucher_no,amount,cost_amount,memo\n";

    #[test]
    fn parses_a_well_formed_file() {
        let input = format!(
            "{HEADER}Acme,sales,2024-01-01,V-1,500,,\nAcme, purchase ,2024-01-02,V-2,300,250,memo text\n"
        );
        let rows = parse_rows(input.as_bytes()).unwrap();
        assert_eq!(rows.len(), 2);
        assert_eq!(rows[0].counterparty_name, "Acme");
        assert_eq!(rows[0].cost_amount, None);
        assert_eq!(rows[1].kind, "purchase");
        assert_eq!(rows[1].cost_amount.as_deref(), Some("250"));
        assert_eq!(rows[1].memo.as_deref(), Some("memo text"));
    }

    #[test]
    fn malformed_input_fails_the_whole_parse() {
        // second record is missing fields
        let input = format!("{HEADER}Acme,sales,2024-01-01,V-1,500,,\nAcme,sales\n");
        let err = parse_rows(input.as_bytes()).unwrap_err();
        assert!(matches!(err, EngineError::Parse(_)));
    }

    #[test]
    fn empty_file_parses_to_no_rows() {
        let rows = parse_rows(HEADER.as_bytes()).unwrap();
        assert!(rows.is_empty());
    }

    #[test]
    fn semantically_bad_fields_still_parse() {
        // the classifier, not the parser, rejects these
        let input = format!("{HEADER}Acme,sales,not-a-date,V-1,lots,,\n");
        let rows = parse_rows(input.as_bytes()).unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].amount, "lots");
    }
}
