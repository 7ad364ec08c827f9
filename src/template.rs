//! Explicit tree form of candidate descriptions.
//!
//! A candidate is a list of objects. Each object is a tree whose leaves are
//! bounded parameters `{"min": .., "max": .., "result": ..}`. Everything that
//! is not a bounded parameter is kept opaque and written back untouched.

use serde_json::{Map, Value};

use crate::error::SchemaError;

const MIN: &str = "min";
const MAX: &str = "max";
const RESULT: &str = "result";

/// A node of a candidate tree.
#[derive(Clone, Debug, PartialEq)]
pub enum Node {
  /// A bounded parameter. `fields` holds the original json object, including
  /// `min`, `max` and `result`, so unknown keys survive a round trip.
  Leaf {
    min: f64,
    max: f64,
    fields: Map<String, Value>,
  },
  /// A json object or array of nodes. Array children are keyed by index.
  Group {
    array: bool,
    children: Vec<(String, Node)>,
  },
  /// Anything else.
  Opaque(Value),
}

impl Node {
  /// Parses a json value. `path` only decorates errors.
  pub fn parse(value: &Value, path: &str) -> Result<Self, SchemaError> {
    match value {
      Value::Object(map) if map.contains_key(MIN) || map.contains_key(MAX) => {
        let number = |key: &'static str| {
          map
            .get(key)
            .and_then(Value::as_f64)
            .ok_or_else(|| SchemaError::NotANumber {
              path: path.to_string(),
              key,
            })
        };
        let (min, max) = (number(MIN)?, number(MAX)?);
        if min > max {
          return Err(SchemaError::InvertedBounds {
            path: path.to_string(),
            min,
            max,
          });
        }
        Ok(Node::Leaf {
          min,
          max,
          fields: map.clone(),
        })
      }
      Value::Object(map) => Ok(Node::Group {
        array: false,
        children: map
          .iter()
          .map(|(key, child)| {
            Ok((key.clone(), Node::parse(child, &join(path, key))?))
          })
          .collect::<Result<_, SchemaError>>()?,
      }),
      Value::Array(items) => Ok(Node::Group {
        array: true,
        children: items
          .iter()
          .enumerate()
          .map(|(idx, child)| {
            let key = idx.to_string();
            let node = Node::parse(child, &join(path, &key))?;
            Ok((key, node))
          })
          .collect::<Result<_, SchemaError>>()?,
      }),
      other => Ok(Node::Opaque(other.clone())),
    }
  }

  /// Whether a leaf's bounds pin it to a constant.
  pub fn is_fixed(&self) -> bool {
    matches!(self, Node::Leaf { min, max, .. } if min == max)
  }

  /// Current `result` of a leaf, if it is a number.
  pub fn result(&self) -> Option<f64> {
    match self {
      Node::Leaf { fields, .. } => fields.get(RESULT).and_then(Value::as_f64),
      _ => None,
    }
  }

  /// Overwrites the `result` of a leaf. No-op for other nodes.
  pub fn set_result(&mut self, value: Value) {
    if let Node::Leaf { fields, .. } = self {
      fields.insert(RESULT.to_string(), value);
    }
  }

  /// Pins a fixed leaf's `result` to its `min`, exactly as written.
  pub(crate) fn pin(&mut self) {
    if let Node::Leaf { fields, .. } = self {
      let min = fields.get(MIN).cloned().unwrap_or(Value::Null);
      fields.insert(RESULT.to_string(), min);
    }
  }

  pub fn children(&self) -> &[(String, Node)] {
    match self {
      Node::Group { children, .. } => children,
      _ => &[],
    }
  }

  /// Child at position `idx` of a group.
  pub fn child_mut(&mut self, idx: usize) -> Option<&mut Node> {
    match self {
      Node::Group { children, .. } => children.get_mut(idx).map(|(_, n)| n),
      _ => None,
    }
  }

  /// Value of a direct child of an object group.
  pub fn get(&self, key: &str) -> Option<&Node> {
    self.children().iter().find(|(k, _)| k == key).map(|(_, n)| n)
  }

  pub fn to_value(&self) -> Value {
    match self {
      Node::Leaf { fields, .. } => Value::Object(fields.clone()),
      Node::Group {
        array: true,
        children,
      } => Value::Array(children.iter().map(|(_, n)| n.to_value()).collect()),
      Node::Group {
        array: false,
        children,
      } => Value::Object(
        children
          .iter()
          .map(|(k, n)| (k.clone(), n.to_value()))
          .collect(),
      ),
      Node::Opaque(value) => value.clone(),
    }
  }
}

/// Renders an object id the way it appears in variable paths.
pub fn id_string(id: &Value) -> String {
  match id {
    Value::String(s) => s.clone(),
    other => other.to_string(),
  }
}

pub(crate) fn join(path: &str, key: &str) -> String {
  if path.is_empty() {
    key.to_string()
  } else {
    format!("{path}.{key}")
  }
}

#[cfg(test)]
mod tests {
  use serde_json::json;

  use super::*;

  #[test]
  fn test_round_trip_keeps_unknown_keys() {
    let value = json!({
      "id": 7,
      "type": "wel",
      "position": {"row": {"min": 0, "max": 10, "result": 3}},
      "flux": [{"min": 1.5, "max": 1.5}],
      "note": null,
    });
    let node = Node::parse(&value, "").unwrap();
    assert_eq!(node.to_value(), value);
    assert!(matches!(node.get("flux"), Some(Node::Group { array: true, .. })));
    assert_eq!(
      node.get("position").and_then(|p| p.get("row")).unwrap().result(),
      Some(3.0)
    );
  }

  #[test]
  fn test_inverted_bounds() {
    let value = json!({"flux": {"0": {"min": 5, "max": 1}}});
    let err = Node::parse(&value, "obj").unwrap_err();
    assert!(
      matches!(err, SchemaError::InvertedBounds { ref path, .. } if path == "obj.flux.0")
    );
  }

  #[test]
  fn test_non_numeric_bound() {
    let value = json!({"min": "a", "max": 1});
    assert!(matches!(
      Node::parse(&value, "x"),
      Err(SchemaError::NotANumber { key: "min", .. })
    ));
  }

  #[test]
  fn test_pin_copies_min_verbatim() {
    let mut node = Node::parse(&json!({"min": 4, "max": 4}), "").unwrap();
    assert!(node.is_fixed());
    node.pin();
    assert_eq!(node.to_value(), json!({"min": 4, "max": 4, "result": 4}));
  }
}
