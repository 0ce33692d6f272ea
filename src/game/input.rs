//! Move Input
//!
//! Strongly typed move payload decoded at the session boundary.
//! Range checks stay with the board so out-of-range moves report
//! `OutOfRange` like any other illegal placement.

use serde::{Serialize, Deserialize};

/// Body of a move message: `{"row": int, "col": int}`.
///
/// `x`/`y` are accepted as aliases for older clients.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct MoveRequest {
    /// Target row (0 = top).
    #[serde(alias = "x")]
    pub row: i64,
    /// Target column (0 = left).
    #[serde(alias = "y")]
    pub col: i64,
}

impl MoveRequest {
    /// Create a move request.
    pub const fn new(row: i64, col: i64) -> Self {
        Self { row, col }
    }

    /// Decode from an already-parsed JSON body.
    pub fn from_value(value: serde_json::Value) -> Result<Self, serde_json::Error> {
        serde_json::from_value(value)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_decode_row_col() {
        let req = MoveRequest::from_value(json!({"row": 2, "col": 0})).unwrap();
        assert_eq!(req, MoveRequest::new(2, 0));
    }

    #[test]
    fn test_decode_legacy_aliases() {
        let req = MoveRequest::from_value(json!({"x": 1, "y": 2})).unwrap();
        assert_eq!(req, MoveRequest::new(1, 2));
    }

    #[test]
    fn test_out_of_range_values_still_decode() {
        let req = MoveRequest::from_value(json!({"row": -1, "col": 7})).unwrap();
        assert_eq!(req, MoveRequest::new(-1, 7));
    }

    #[test]
    fn test_malformed_payloads_rejected() {
        assert!(MoveRequest::from_value(json!({"row": 1})).is_err());
        assert!(MoveRequest::from_value(json!({"row": "1", "col": 1})).is_err());
        assert!(MoveRequest::from_value(json!({"row": 1.5, "col": 1})).is_err());
        assert!(MoveRequest::from_value(json!(null)).is_err());
        assert!(MoveRequest::from_value(json!("not json")).is_err());
    }
}
