use crate::{ChartDataError, ErrorCode, ErrorContext};
use datafusion::error::DataFusionError;

impl From<DataFusionError> for ChartDataError {
    fn from(err: DataFusionError) -> Self {
        match &err {
            DataFusionError::SchemaError(schema_err, _) => match schema_err {
                datafusion::common::SchemaError::FieldNotFound {
                    field,
                    valid_fields,
                } => {
                    let available: Vec<String> =
                        valid_fields.iter().map(|f| f.name.clone()).collect();

                    let hint = find_closest_match(&field.name, &available);

                    let mut error = ChartDataError::new(
                        ErrorCode::QueryFailed,
                        format!("Column '{}' does not exist", field.name),
                    )
                    .with_context(ErrorContext::FieldNotFound {
                        field: field.name.clone(),
                        available_fields: available,
                    });

                    if let Some(closest) = hint {
                        error = error.with_hint(format!("Did you mean '{}'?", closest));
                    }
                    error
                }
                _ => ChartDataError::new(ErrorCode::QueryFailed, schema_err.to_string()),
            },
            DataFusionError::Plan(msg) => ChartDataError::new(ErrorCode::QueryFailed, msg.clone()),
            _ => ChartDataError::new(ErrorCode::QueryFailed, err.to_string()),
        }
    }
}

impl From<arrow::error::ArrowError> for ChartDataError {
    fn from(err: arrow::error::ArrowError) -> Self {
        ChartDataError::new(ErrorCode::QueryFailed, err.to_string())
    }
}

impl From<std::io::Error> for ChartDataError {
    fn from(err: std::io::Error) -> Self {
        ChartDataError::new(ErrorCode::Internal, err.to_string())
    }
}

impl From<serde_json::Error> for ChartDataError {
    fn from(err: serde_json::Error) -> Self {
        ChartDataError::new(ErrorCode::SerializationFailed, err.to_string())
    }
}

impl From<serde_yaml::Error> for ChartDataError {
    fn from(err: serde_yaml::Error) -> Self {
        ChartDataError::new(ErrorCode::SerializationFailed, err.to_string())
    }
}

fn find_closest_match(target: &str, options: &[String]) -> Option<String> {
    let mut best_match: Option<&str> = None;
    let mut min_distance = usize::MAX;

    for option in options {
        let distance = levenshtein(target, option);
        if distance < min_distance && distance <= 3 {
            min_distance = distance;
            best_match = Some(option.as_str());
        }
    }

    best_match.map(|s| s.to_string())
}

fn levenshtein(a: &str, b: &str) -> usize {
    let a: Vec<char> = a.chars().collect();
    let b: Vec<char> = b.chars().collect();
    let mut prev: Vec<usize> = (0..=b.len()).collect();
    let mut curr = vec![0; b.len() + 1];

    for (i, ca) in a.iter().enumerate() {
        curr[0] = i + 1;
        for (j, cb) in b.iter().enumerate() {
            let cost = usize::from(ca != cb);
            curr[j + 1] = (prev[j + 1] + 1).min(curr[j] + 1).min(prev[j] + cost);
        }
        std::mem::swap(&mut prev, &mut curr);
    }

    prev[b.len()]
}
