//! # Declarative Message Schemas
//!
//! Incoming queries are validated against static tables of [`KeyDesc`]
//! entries rather than hand-written parsing code. One generic routine,
//! [`verify_message`], walks a table and either returns the matched values in
//! table order or names the first offending key.
//!
//! ## Flags
//!
//! | Flag | Meaning |
//! |------|---------|
//! | [`OPTIONAL`] | key may be absent |
//! | [`PARSE_CHILDREN`] | value is a dictionary; following entries describe its keys |
//! | [`LAST_CHILD`] | closes the innermost nested dictionary |
//! | [`SIZE_DIVISIBLE`] | byte length must be a multiple of `size` instead of equal to it |
//!
//! A value of the wrong type is treated as absent. When an optional
//! dictionary is absent, all of its child entries are skipped and come back
//! as `None`.

use thiserror::Error;

use crate::messages::{Dict, Value, ValueKind};

pub const OPTIONAL: u8 = 1;
pub const PARSE_CHILDREN: u8 = 2;
pub const LAST_CHILD: u8 = 4;
pub const SIZE_DIVISIBLE: u8 = 8;

/// One expected key of a message dictionary.
#[derive(Clone, Copy, Debug)]
pub struct KeyDesc {
    pub name: &'static str,
    pub kind: ValueKind,
    /// Required byte length for byte strings; 0 means unchecked.
    pub size: usize,
    pub flags: u8,
}

impl KeyDesc {
    const fn new(name: &'static str, kind: ValueKind, size: usize, flags: u8) -> Self {
        Self {
            name,
            kind,
            size,
            flags,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum SchemaError {
    #[error("missing '{0}' key")]
    Missing(&'static str),
    #[error("invalid value for '{0}'")]
    InvalidSize(&'static str),
}

/// Check `dict` against `desc`, returning one slot per table entry.
pub fn verify_message<'a>(
    dict: &'a Dict,
    desc: &[KeyDesc],
) -> Result<Vec<Option<&'a Value>>, SchemaError> {
    let mut out: Vec<Option<&'a Value>> = vec![None; desc.len()];
    let mut stack: Vec<&'a Dict> = Vec::new();
    let mut current = dict;

    let mut i = 0;
    while i < desc.len() {
        let key = &desc[i];
        let entry = current.get(key.name).filter(|v| v.kind() == key.kind);

        let Some(value) = entry else {
            if key.flags & OPTIONAL == 0 {
                return Err(SchemaError::Missing(key.name));
            }
            if key.flags & PARSE_CHILDREN != 0 {
                // Skip the absent dictionary's children, including the closing entry.
                i += 1;
                while i < desc.len() && desc[i].flags & LAST_CHILD == 0 {
                    i += 1;
                }
            } else if key.flags & LAST_CHILD != 0
                && let Some(parent) = stack.pop()
            {
                current = parent;
            }
            i += 1;
            continue;
        };

        if key.size > 0
            && let Value::Bytes(bytes) = value
        {
            let ok = if key.flags & SIZE_DIVISIBLE != 0 {
                bytes.len() % key.size == 0
            } else {
                bytes.len() == key.size
            };
            if !ok {
                return Err(SchemaError::InvalidSize(key.name));
            }
        }

        out[i] = Some(value);

        if key.flags & PARSE_CHILDREN != 0
            && let Value::Dict(child) = value
        {
            stack.push(current);
            current = child;
        } else if key.flags & LAST_CHILD != 0
            && let Some(parent) = stack.pop()
        {
            current = parent;
        }
        i += 1;
    }

    Ok(out)
}

use ValueKind::{Bytes, Dict as DictKind, Int};

pub const PING: &[KeyDesc] = &[KeyDesc::new("id", Bytes, 20, 0)];

pub const FIND_NODE: &[KeyDesc] = &[
    KeyDesc::new("id", Bytes, 20, 0),
    KeyDesc::new("target", Bytes, 20, 0),
];

pub const GET_PEERS: &[KeyDesc] = &[
    KeyDesc::new("id", Bytes, 20, 0),
    KeyDesc::new("info_hash", Bytes, 20, 0),
    KeyDesc::new("noseed", Int, 0, OPTIONAL),
    KeyDesc::new("scrape", Int, 0, OPTIONAL),
];

pub const ANNOUNCE_PEER: &[KeyDesc] = &[
    KeyDesc::new("id", Bytes, 20, 0),
    KeyDesc::new("info_hash", Bytes, 20, 0),
    KeyDesc::new("port", Int, 0, 0),
    KeyDesc::new("token", Bytes, 0, 0),
    KeyDesc::new("seed", Int, 0, OPTIONAL),
    KeyDesc::new("implied_port", Int, 0, OPTIONAL),
    KeyDesc::new("n", Bytes, 0, OPTIONAL),
];

pub const GET: &[KeyDesc] = &[
    KeyDesc::new("id", Bytes, 20, 0),
    KeyDesc::new("target", Bytes, 20, 0),
];

pub const PUT: &[KeyDesc] = &[
    KeyDesc::new("id", Bytes, 20, 0),
    KeyDesc::new("token", Bytes, 0, 0),
    KeyDesc::new("v", Bytes, 0, OPTIONAL),
    KeyDesc::new("k", Bytes, 32, OPTIONAL),
    KeyDesc::new("sig", Bytes, 64, OPTIONAL),
    KeyDesc::new("seq", Int, 0, OPTIONAL),
    KeyDesc::new("salt", Bytes, 0, OPTIONAL),
    KeyDesc::new("d", DictKind, 0, OPTIONAL | PARSE_CHILDREN),
    KeyDesc::new("p", Bytes, 0, 0),
    KeyDesc::new("sig_p", Bytes, 64, 0),
    KeyDesc::new("sig_user", Bytes, 0, LAST_CHILD),
];

/// Shape of any reply a traversal consumes.
pub const REPLY: &[KeyDesc] = &[
    KeyDesc::new("id", Bytes, 20, 0),
    KeyDesc::new("nodes", Bytes, 26, OPTIONAL | SIZE_DIVISIBLE),
    KeyDesc::new("nodes6", Bytes, 38, OPTIONAL | SIZE_DIVISIBLE),
    KeyDesc::new("token", Bytes, 0, OPTIONAL),
];

/// One element of the `values` list in a signed-storage `get` reply.
pub const SIGNED_ITEM: &[KeyDesc] = &[
    KeyDesc::new("p", Bytes, 0, 0),
    KeyDesc::new("sig_p", Bytes, 64, 0),
    KeyDesc::new("sig_user", Bytes, 0, 0),
];

#[cfg(test)]
mod tests {
    use super::*;

    fn dict(entries: &[(&str, Value)]) -> Dict {
        entries
            .iter()
            .map(|(k, v)| (k.to_string(), v.clone()))
            .collect()
    }

    #[test]
    fn missing_required_key_is_named() {
        let msg = dict(&[("id", Value::Bytes(vec![0; 20]))]);
        assert_eq!(
            verify_message(&msg, FIND_NODE),
            Err(SchemaError::Missing("target"))
        );
    }

    #[test]
    fn wrong_size_is_rejected() {
        let msg = dict(&[
            ("id", Value::Bytes(vec![0; 20])),
            ("target", Value::Bytes(vec![0; 19])),
        ]);
        assert_eq!(
            verify_message(&msg, FIND_NODE),
            Err(SchemaError::InvalidSize("target"))
        );
    }

    #[test]
    fn wrong_type_counts_as_missing() {
        let msg = dict(&[("id", Value::Int(7))]);
        assert_eq!(verify_message(&msg, PING), Err(SchemaError::Missing("id")));
    }

    #[test]
    fn size_divisible_accepts_whole_entries_only() {
        let ok = dict(&[
            ("id", Value::Bytes(vec![1; 20])),
            ("nodes", Value::Bytes(vec![0; 52])),
        ]);
        let parsed = verify_message(&ok, REPLY).unwrap();
        assert!(parsed[1].is_some());
        assert!(parsed[2].is_none());

        let bad = dict(&[
            ("id", Value::Bytes(vec![1; 20])),
            ("nodes", Value::Bytes(vec![0; 27])),
        ]);
        assert_eq!(
            verify_message(&bad, REPLY),
            Err(SchemaError::InvalidSize("nodes"))
        );
    }

    #[test]
    fn absent_optional_dict_skips_children() {
        let msg = dict(&[
            ("id", Value::Bytes(vec![1; 20])),
            ("token", Value::Bytes(vec![9; 8])),
            ("v", Value::Bytes(b"hello".to_vec())),
        ]);
        let parsed = verify_message(&msg, PUT).unwrap();
        assert_eq!(parsed.len(), PUT.len());
        assert!(parsed[2].is_some());
        assert!(parsed[7..].iter().all(Option::is_none));
    }

    #[test]
    fn nested_dict_children_are_checked() {
        let inner = dict(&[
            ("p", Value::Bytes(b"payload".to_vec())),
            ("sig_p", Value::Bytes(vec![0; 64])),
            ("sig_user", Value::Bytes(b"alice".to_vec())),
        ]);
        let msg = dict(&[
            ("id", Value::Bytes(vec![1; 20])),
            ("token", Value::Bytes(vec![9; 8])),
            ("d", Value::Dict(inner.clone())),
        ]);
        let parsed = verify_message(&msg, PUT).unwrap();
        assert_eq!(parsed[8].and_then(Value::as_bytes), Some(&b"payload"[..]));
        assert_eq!(parsed[10].and_then(Value::as_bytes), Some(&b"alice"[..]));

        let mut broken = inner;
        broken.remove("sig_p");
        let msg = dict(&[
            ("id", Value::Bytes(vec![1; 20])),
            ("token", Value::Bytes(vec![9; 8])),
            ("d", Value::Dict(broken)),
        ]);
        assert_eq!(
            verify_message(&msg, PUT),
            Err(SchemaError::Missing("sig_p"))
        );
    }
}
