//! Mapping between candidate descriptions and flat decision vectors.
//!
//! [`Encoding::encode`] walks every object of a template in order and turns
//! each free leaf (`min != max`) into one decision variable. Fixed leaves are
//! pinned to their constant and never exposed. [`Encoding::decode`] fills a
//! fresh copy of the template from a decision vector.

use serde_json::Value;

use crate::{
  error::SchemaError,
  template::{id_string, join, Node},
};

/// Parameter whose leaves are grid coordinates and therefore integers.
const POSITION: &str = "position";
/// Parameter whose leaves are nested `period -> component`.
const CONCENTRATION: &str = "concentration";

/// Bounds of one decision variable.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct BoundSpec {
  pub index: usize,
  pub lower: f64,
  pub upper: f64,
  /// Whether the variable takes integer values only.
  pub integer: bool,
}

/// Location of one decision variable in the template.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Variable {
  pub object_id: String,
  /// Keys from the object root down to the leaf, e.g. `["position", "row"]`.
  pub path: Vec<String>,
  /// Object index followed by child positions, for direct access.
  address: Vec<usize>,
}

impl Variable {
  /// Dotted form, e.g. `3.concentration.0.1`.
  pub fn dotted(&self) -> String {
    self.path.iter().fold(self.object_id.clone(), |acc, k| join(&acc, k))
  }
}

/// A template together with its variable layout.
#[derive(Clone, Debug)]
pub struct Encoding {
  template: Vec<Node>,
  variables: Vec<Variable>,
  bounds: Vec<BoundSpec>,
  initial_values: Vec<f64>,
}

impl Encoding {
  /// Builds the variable layout of `objects`.
  pub fn encode(objects: &[Value]) -> Result<Self, SchemaError> {
    let mut encoding = Encoding {
      template: Vec::with_capacity(objects.len()),
      variables: Vec::new(),
      bounds: Vec::new(),
      initial_values: Vec::new(),
    };

    for (obj_idx, object) in objects.iter().enumerate() {
      let Value::Object(map) = object else {
        return Err(SchemaError::NotAnObject(obj_idx));
      };
      let object_id = map
        .get("id")
        .map(id_string)
        .ok_or(SchemaError::MissingId(obj_idx))?;
      let mut node = Node::parse(object, &object_id)?;
      if let Some(concentration) = node.get(CONCENTRATION) {
        check_periods(concentration, &join(&object_id, CONCENTRATION))?;
      }

      let mut walk = Walk {
        object_id: &object_id,
        keys: Vec::new(),
        address: vec![obj_idx],
        encoding: &mut encoding,
      };
      walk.visit(&mut node);
      encoding.template.push(node);
    }

    Ok(encoding)
  }

  pub fn len(&self) -> usize {
    self.bounds.len()
  }

  pub fn is_empty(&self) -> bool {
    self.bounds.is_empty()
  }

  pub fn bounds(&self) -> &[BoundSpec] {
    &self.bounds
  }

  pub fn variables(&self) -> &[Variable] {
    &self.variables
  }

  /// Starting point: each leaf's `result` if given, else its midpoint.
  pub fn initial_values(&self) -> &[f64] {
    &self.initial_values
  }

  /// The template with fixed leaves pinned and free leaves cleared.
  pub fn template(&self) -> Vec<Value> {
    self.template.iter().map(Node::to_value).collect()
  }

  /// Writes `values` into a fresh copy of the template. Integer variables
  /// are truncated towards zero.
  pub fn decode(&self, values: &[f64]) -> Result<Vec<Value>, SchemaError> {
    if values.len() != self.len() {
      return Err(SchemaError::LengthMismatch {
        expected: self.len(),
        found: values.len(),
      });
    }

    let mut objects = self.template.clone();
    for ((variable, bound), &value) in
      self.variables.iter().zip(&self.bounds).zip(values)
    {
      let Some((first, rest)) = variable.address.split_first() else {
        continue;
      };
      let leaf = rest
        .iter()
        .try_fold(&mut objects[*first], |node, &idx| node.child_mut(idx));
      if let Some(leaf) = leaf {
        leaf.set_result(number(value, bound.integer));
      }
    }

    Ok(objects.iter().map(Node::to_value).collect())
  }
}

struct Walk<'a> {
  object_id: &'a str,
  keys: Vec<String>,
  address: Vec<usize>,
  encoding: &'a mut Encoding,
}

impl Walk<'_> {
  fn visit(&mut self, node: &mut Node) {
    if let Node::Group { children, .. } = node {
      for (idx, (key, child)) in children.iter_mut().enumerate() {
        self.keys.push(key.clone());
        self.address.push(idx);
        self.visit(child);
        self.address.pop();
        self.keys.pop();
      }
      return;
    }
    let (lower, upper) = match node {
      Node::Leaf { min, max, .. } => (*min, *max),
      _ => return,
    };
    if lower == upper {
      node.pin();
      return;
    }

    let integer = self.keys.first().is_some_and(|k| k == POSITION);
    let initial = match node.result() {
      Some(result) => result,
      None if integer => ((lower + upper) / 2.0).trunc(),
      None => (lower + upper) / 2.0,
    };
    node.set_result(Value::Null);

    let encoding = &mut *self.encoding;
    encoding.bounds.push(BoundSpec {
      index: encoding.bounds.len(),
      lower,
      upper,
      integer,
    });
    encoding.variables.push(Variable {
      object_id: self.object_id.to_string(),
      path: self.keys.clone(),
      address: self.address.clone(),
    });
    encoding.initial_values.push(initial);
  }
}

/// Every period under `concentration` must be a group, and all periods must
/// hold the same number of components.
fn check_periods(node: &Node, path: &str) -> Result<(), SchemaError> {
  let mut expected = None;
  for (key, period) in node.children() {
    let Node::Group { children, .. } = period else {
      return Err(SchemaError::MissingPeriod {
        path: join(path, key),
      });
    };
    let Some(expected) = expected else {
      expected = Some(children.len());
      continue;
    };
    if expected != children.len() {
      return Err(SchemaError::RaggedShape {
        path: join(path, key),
        expected,
        found: children.len(),
      });
    }
  }
  Ok(())
}

fn number(value: f64, integer: bool) -> Value {
  if integer {
    Value::from(value.trunc() as i64)
  } else {
    Value::from(value)
  }
}
