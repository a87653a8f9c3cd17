use common::Record;
use serde_json::Value;
use std::collections::HashSet;
use std::path::Path;
use crate::error::PrintError;

/// Distinct field names in order of first appearance across all records.
pub fn collect_fieldnames(records: &[Record]) -> Vec<String> {
    let mut seen = HashSet::new();
    let mut order = Vec::new();
    for record in records {
        for key in record.keys() {
            if seen.insert(key.as_str()) {
                order.push(key.clone());
            }
        }
    }
    order
}

/// Write `records` as CSV to `target` (header row first) and return the
/// column order used. Missing fields become empty cells; fields outside the
/// column order are dropped.
pub fn export_csv(
    records: &[Record],
    target: &Path,
    field_order: Option<&[String]>,
) -> Result<Vec<String>, PrintError> {
    if records.is_empty() {
        return Err(PrintError::EmptyInput);
    }

    let fieldnames = match field_order {
        Some(order) if !order.is_empty() => order.to_vec(),
        _ => collect_fieldnames(records),
    };
    log::debug!("Writing CSV {}, fields={:?}", target.display(), fieldnames);

    let mut writer = csv::Writer::from_path(target)?;
    writer.write_record(&fieldnames)?;
    for record in records {
        writer.write_record(fieldnames.iter().map(|name| cell(record.get(name))))?;
    }
    writer.flush()?;

    Ok(fieldnames)
}

fn cell(value: Option<&Value>) -> String {
    match value {
        None | Some(Value::Null) => String::new(),
        Some(Value::String(s)) => s.clone(),
        Some(Value::Bool(b)) => b.to_string(),
        Some(Value::Number(n)) => n.to_string(),
        Some(other) => other.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn records(value: Value) -> Vec<Record> {
        serde_json::from_value(value).unwrap()
    }

    #[test]
    fn test_sparse_records_fill_missing_cells() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("labels.csv");

        let fields = export_csv(&records(json!([{"X": 1}, {"Y": 2}])), &path, None).unwrap();
        assert_eq!(fields, ["X", "Y"]);

        let content = std::fs::read_to_string(&path).unwrap();
        assert_eq!(content, "X,Y\n1,\n,2\n");
    }

    #[test]
    fn test_explicit_order_drops_unknown_fields() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("labels.csv");
        let order = vec!["CODE".to_string(), "ITEM".to_string()];

        export_csv(
            &records(json!([{"ITEM": "A001", "CODE": "X123", "EXTRA": true}])),
            &path,
            Some(&order),
        )
        .unwrap();

        let content = std::fs::read_to_string(&path).unwrap();
        assert_eq!(content, "CODE,ITEM\nX123,A001\n");
    }

    #[test]
    fn test_scalar_rendering_and_quoting() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("labels.csv");

        export_csv(
            &records(json!([{"name": "Widget, large", "ok": false, "note": null, "qty": 2.5}])),
            &path,
            None,
        )
        .unwrap();

        let content = std::fs::read_to_string(&path).unwrap();
        assert_eq!(content, "name,ok,note,qty\n\"Widget, large\",false,,2.5\n");
    }

    #[test]
    fn test_nested_values_and_booleans_use_json_text() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("labels.csv");

        export_csv(
            &records(json!([{"tags": ["a", "b"], "dims": {"w": 1}, "ok": true}])),
            &path,
            None,
        )
        .unwrap();

        let content = std::fs::read_to_string(&path).unwrap();
        assert_eq!(content, "tags,dims,ok\n\"[\"\"a\"\",\"\"b\"\"]\",\"{\"\"w\"\":1}\",true\n");
    }

    #[test]
    fn test_empty_input_writes_nothing() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("labels.csv");

        let err = export_csv(&[], &path, None).unwrap_err();
        assert!(matches!(err, PrintError::EmptyInput));
        assert!(!path.exists());
    }

    #[test]
    fn test_overwrites_existing_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("labels.csv");
        std::fs::write(&path, "stale contents that are longer than the export\n").unwrap();

        export_csv(&records(json!([{"A": "1"}])), &path, None).unwrap();
        assert_eq!(std::fs::read_to_string(&path).unwrap(), "A\n1\n");
    }
}
