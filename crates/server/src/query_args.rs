//! Parsing of the `q` query string argument.
//!
//! `q` carries a list of chart ids, either as a rison list (`!(1,2,3)`) or as
//! a JSON array (`[1,2,3]`).

use serde::Deserialize;

use chartdata_error::{ChartDataError, ErrorCode, Result};

#[derive(Debug, Default, Deserialize)]
pub struct QArg {
    pub q: Option<String>,
}

impl QArg {
    /// Ids in `q`. A missing argument is an error.
    pub fn ids(&self) -> Result<Vec<i64>> {
        match self.q.as_deref() {
            Some(q) => parse_id_list(q),
            None => Err(invalid("Missing argument q")),
        }
    }
}

fn invalid(message: impl Into<String>) -> ChartDataError {
    ChartDataError::new(ErrorCode::InvalidArgument, message)
}

pub fn parse_id_list(q: &str) -> Result<Vec<i64>> {
    let q = q.trim();

    if q.starts_with('[') {
        return serde_json::from_str::<Vec<i64>>(q)
            .map_err(|e| invalid(format!("Invalid JSON list in q: {}", e)));
    }

    let inner = q
        .strip_prefix("!(")
        .and_then(|rest| rest.strip_suffix(')'))
        .ok_or_else(|| invalid(format!("Not a rison list: {}", q)))?;

    if inner.trim().is_empty() {
        return Ok(vec![]);
    }
    inner
        .split(',')
        .map(|item| {
            item.trim()
                .parse::<i64>()
                .map_err(|_| invalid(format!("Not an integer id: {}", item.trim())))
        })
        .collect()
}

/// Parse a `"width,height"` pair.
pub fn parse_size(value: &str) -> Result<(u32, u32)> {
    let parse = |s: &str| s.trim().parse::<u32>().ok().filter(|n| *n > 0);
    value
        .split_once(',')
        .and_then(|(w, h)| Some((parse(w)?, parse(h)?)))
        .ok_or_else(|| invalid(format!("Invalid size {}, expected width,height", value)))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_rison_list() {
        assert_eq!(parse_id_list("!(1,2,3)").unwrap(), vec![1, 2, 3]);
        assert_eq!(parse_id_list("!( 4 , 5 )").unwrap(), vec![4, 5]);
        assert!(parse_id_list("!()").unwrap().is_empty());
    }

    #[test]
    fn test_json_list() {
        assert_eq!(parse_id_list("[7, 8]").unwrap(), vec![7, 8]);
    }

    #[test]
    fn test_rejects_garbage() {
        for q in ["1,2", "!(a)", "(1,2)", "[1,"] {
            let err = parse_id_list(q).unwrap_err();
            assert_eq!(err.code, ErrorCode::InvalidArgument, "{}", q);
        }
        assert!(QArg::default().ids().is_err());
    }

    #[test]
    fn test_size() {
        assert_eq!(parse_size("800,600").unwrap(), (800, 600));
        assert!(parse_size("800").is_err());
        assert!(parse_size("0,600").is_err());
    }
}
