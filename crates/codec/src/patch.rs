use super::ptr::{escape, Pointer, Token};
use super::Error;
use itertools::{
    EitherOrBoth::{Both, Left, Right},
    Itertools,
};
use serde_json::Value;

/// PatchOp is one ordered JSON-patch operation. `add` creates, `remove`
/// and `replace` require their path to exist.
#[derive(Debug, Clone, PartialEq, serde::Serialize, serde::Deserialize)]
#[serde(tag = "op", rename_all = "lowercase")]
pub enum PatchOp {
    Add { path: String, value: Value },
    Remove { path: String },
    Replace { path: String, value: Value },
}

impl PatchOp {
    pub fn path(&self) -> &str {
        match self {
            PatchOp::Add { path, .. } | PatchOp::Remove { path } | PatchOp::Replace { path, .. } => {
                path
            }
        }
    }
}

/// Patch is an ordered operation list transforming one document into
/// another via [`apply`].
#[derive(Debug, Clone, PartialEq, Default, serde::Serialize, serde::Deserialize)]
#[serde(transparent)]
pub struct Patch(pub Vec<PatchOp>);

impl Patch {
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }
}

/// Compute the minimal ordered patch transforming `a` into `b`.
///
/// Operations are emitted in document order, depth-first, visiting map
/// keys in sorted order, so identical inputs always yield byte-identical
/// patches. Array tails are removed in descending index order so that
/// earlier indices remain valid while the patch is applied.
pub fn diff(a: &Value, b: &Value) -> Patch {
    let mut ops = Vec::new();
    diff_inner(a, b, "", &mut ops);
    Patch(ops)
}

fn diff_inner(a: &Value, b: &Value, path: &str, ops: &mut Vec<PatchOp>) {
    if a == b {
        return;
    }
    match (a, b) {
        (Value::Object(a), Value::Object(b)) => {
            // serde_json maps iterate in sorted key order.
            for eob in a
                .iter()
                .merge_join_by(b.iter(), |(ka, _), (kb, _)| ka.cmp(kb))
            {
                match eob {
                    Left((key, _)) => ops.push(PatchOp::Remove {
                        path: format!("{path}/{}", escape(key)),
                    }),
                    Right((key, value)) => ops.push(PatchOp::Add {
                        path: format!("{path}/{}", escape(key)),
                        value: value.clone(),
                    }),
                    Both((key, va), (_, vb)) => {
                        diff_inner(va, vb, &format!("{path}/{}", escape(key)), ops)
                    }
                }
            }
        }
        (Value::Array(a), Value::Array(b)) => {
            for (index, (va, vb)) in a.iter().zip(b.iter()).enumerate() {
                diff_inner(va, vb, &format!("{path}/{index}"), ops);
            }
            for (index, value) in b.iter().enumerate().skip(a.len()) {
                ops.push(PatchOp::Add {
                    path: format!("{path}/{index}"),
                    value: value.clone(),
                });
            }
            for index in (b.len()..a.len()).rev() {
                ops.push(PatchOp::Remove {
                    path: format!("{path}/{index}"),
                });
            }
        }
        // Scalar change, or a change of type: replace the whole location.
        _ => ops.push(PatchOp::Replace {
            path: if path.is_empty() {
                "/".to_string()
            } else {
                path.to_string()
            },
            value: b.clone(),
        }),
    }
}

/// Apply `patch` to `base`, producing the patched document.
pub fn apply(base: &Value, patch: &Patch) -> Result<Value, Error> {
    let mut doc = base.clone();
    for op in &patch.0 {
        apply_op(&mut doc, op)?;
    }
    Ok(doc)
}

fn apply_op(doc: &mut Value, op: &PatchOp) -> Result<(), Error> {
    let pointer = Pointer::parse(op.path());

    if pointer.is_root() {
        return match op {
            PatchOp::Add { value, .. } | PatchOp::Replace { value, .. } => {
                *doc = value.clone();
                Ok(())
            }
            PatchOp::Remove { path } => Err(Error::Patch {
                op: "remove",
                path: path.clone(),
                reason: "cannot remove the document root".to_string(),
            }),
        };
    }

    let (last, parents) = pointer.0.split_last().expect("pointer is not root");
    let fail = |op_name: &'static str, reason: &str| Error::Patch {
        op: op_name,
        path: op.path().to_string(),
        reason: reason.to_string(),
    };

    let mut node = doc;
    for token in parents {
        node = match (node, token) {
            (Value::Object(map), token) => map
                .get_mut(token.as_property().as_ref())
                .ok_or_else(|| fail(op_kind(op), "missing intermediate property"))?,
            (Value::Array(items), Token::Index(index)) => items
                .get_mut(*index)
                .ok_or_else(|| fail(op_kind(op), "array index out of bounds"))?,
            _ => return Err(fail(op_kind(op), "path does not traverse a container")),
        };
    }

    match (node, last, op) {
        (Value::Object(map), token, PatchOp::Add { value, .. }) => {
            map.insert(token.as_property().into_owned(), value.clone());
            Ok(())
        }
        (Value::Object(map), token, PatchOp::Replace { value, .. }) => {
            match map.get_mut(token.as_property().as_ref()) {
                Some(slot) => {
                    *slot = value.clone();
                    Ok(())
                }
                None => Err(fail("replace", "missing property")),
            }
        }
        (Value::Object(map), token, PatchOp::Remove { .. }) => {
            match map.remove(token.as_property().as_ref()) {
                Some(_) => Ok(()),
                None => Err(fail("remove", "missing property")),
            }
        }
        (Value::Array(items), Token::Index(index), PatchOp::Add { value, .. }) => {
            if *index < items.len() {
                items.insert(*index, value.clone());
                Ok(())
            } else if *index == items.len() {
                items.push(value.clone());
                Ok(())
            } else {
                Err(fail("add", "array index out of bounds"))
            }
        }
        (Value::Array(items), Token::Index(index), PatchOp::Replace { value, .. }) => {
            match items.get_mut(*index) {
                Some(slot) => {
                    *slot = value.clone();
                    Ok(())
                }
                None => Err(fail("replace", "array index out of bounds")),
            }
        }
        (Value::Array(items), Token::Index(index), PatchOp::Remove { .. }) => {
            if *index < items.len() {
                items.remove(*index);
                Ok(())
            } else {
                Err(fail("remove", "array index out of bounds"))
            }
        }
        (Value::Array(_), Token::Property(_), op) => {
            Err(fail(op_kind(op), "property path into an array"))
        }
        (_, _, op) => Err(fail(op_kind(op), "path does not address a container")),
    }
}

fn op_kind(op: &PatchOp) -> &'static str {
    match op {
        PatchOp::Add { .. } => "add",
        PatchOp::Remove { .. } => "remove",
        PatchOp::Replace { .. } => "replace",
    }
}
