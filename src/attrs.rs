//! The message-attribute codec (§6) is out of scope; this module only
//! models its consumer-facing surface: a parsed-attribute table keyed by
//! well-known tag ids, plus the request flags every command reads.

use std::collections::BTreeMap;

bitflags::bitflags! {
    /// Request flags carried on `NewFilter`/`NewChain` messages.
    #[derive(Default)]
    pub struct Flags: u32 {
        const CREATE = 0b001;
        const EXCL   = 0b010;
        const ECHO   = 0b100;
    }
}

/// Well-known attribute tags (§6).
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum Tag {
    Kind,
    Chain,
    Handle,
    Prio,
    Protocol,
    Parent,
    Ifindex,
    BlockIndex,
    Options,
}

#[derive(Clone, Debug)]
pub enum Value {
    U32(u32),
    Str(String),
    /// Opaque payload forwarded verbatim to classifier ops (`OPTIONS`,
    /// classifier-private tags).
    Opaque(Vec<u8>),
}

impl Value {
    pub fn as_u32(&self) -> Option<u32> {
        match self {
            Value::U32(v) => Some(*v),
            _ => None,
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            Value::Str(v) => Some(v.as_str()),
            _ => None,
        }
    }
}

/// A parsed-attribute table, as handed to every control-plane command.
#[derive(Clone, Debug, Default)]
pub struct AttributeTable(BTreeMap<Tag, Value>);

impl AttributeTable {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, tag: Tag, value: Value) -> &mut Self {
        self.0.insert(tag, value);
        self
    }

    pub fn get(&self, tag: Tag) -> Option<&Value> {
        self.0.get(&tag)
    }

    pub fn get_u32(&self, tag: Tag) -> Option<u32> {
        self.get(tag).and_then(Value::as_u32)
    }

    pub fn get_str(&self, tag: Tag) -> Option<&str> {
        self.get(tag).and_then(Value::as_str)
    }
}
