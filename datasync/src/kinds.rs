use crate::errors::StoreError;
use crate::model::{FeatureFlag, Segment, StoreItem};
use serde::Deserialize;
use serde_json::Value;
use std::fmt;
use std::sync::Arc;

/// Namespace of stored items.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum DataKind {
    Features,
    Segments,
}

impl DataKind {
    /// Every kind, in bulk initialization order.
    pub const ALL: [DataKind; 2] = [DataKind::Segments, DataKind::Features];

    pub const fn name(&self) -> &'static str {
        match self {
            DataKind::Features => "features",
            DataKind::Segments => "segments",
        }
    }

    /// Whether items of this kind can reference other items of the same kind,
    /// so that a bulk write has to order them.
    pub fn supports_dependency_ordering(&self) -> bool {
        matches!(self, DataKind::Features)
    }

    /// Sort key for bulk initialization: segments, then features, then any
    /// other kind by name.
    pub(crate) fn init_priority(&self) -> (u8, &'static str) {
        match self {
            DataKind::Segments => (0, self.name()),
            DataKind::Features => (1, self.name()),
        }
    }

    /// Builds a descriptor from a JSON item of this kind. Items carrying
    /// `"deleted": true` become tombstones.
    pub fn parse_item(&self, value: Value) -> Result<ItemDescriptor, serde_json::Error> {
        match self {
            DataKind::Features => {
                let flag: FeatureFlag = serde_json::from_value(value)?;
                Ok(ItemDescriptor::from_flag(flag))
            }
            DataKind::Segments => {
                let segment: Segment = serde_json::from_value(value)?;
                Ok(ItemDescriptor::from_segment(segment))
            }
        }
    }

    /// Encodes an item for a persistent store.
    pub fn serialize(&self, key: &str, item: &ItemDescriptor) -> Result<SerializedItem, StoreError> {
        let encoded = match item.item.as_deref() {
            None => serde_json::to_vec(&serde_json::json!({
                "key": key,
                "version": item.version,
                "deleted": true,
            })),
            Some(StoreItem::Flag(flag)) if *self == DataKind::Features => serde_json::to_vec(flag),
            Some(StoreItem::Segment(segment)) if *self == DataKind::Segments => {
                serde_json::to_vec(segment)
            }
            Some(_) => {
                return Err(StoreError::Serialize {
                    kind: *self,
                    key: key.to_string(),
                    message: "item does not belong to this kind".into(),
                });
            }
        };
        let bytes = encoded.map_err(|e| StoreError::Serialize {
            kind: *self,
            key: key.to_string(),
            message: e.to_string(),
        })?;
        Ok(SerializedItem {
            version: item.version,
            deleted: item.is_tombstone(),
            bytes,
        })
    }

    /// Decodes bytes written by [`DataKind::serialize`].
    pub fn deserialize(&self, item: &SerializedItem) -> Result<ItemDescriptor, StoreError> {
        if item.deleted {
            return Ok(ItemDescriptor::tombstone(item.version));
        }
        let value: Value = serde_json::from_slice(&item.bytes).map_err(|e| {
            StoreError::Deserialize {
                kind: *self,
                message: e.to_string(),
            }
        })?;
        if let Ok(marker) = DeletedMarker::deserialize(&value)
            && marker.deleted
        {
            return Ok(ItemDescriptor::tombstone(marker.version.max(item.version)));
        }
        self.parse_item(value).map_err(|e| StoreError::Deserialize {
            kind: *self,
            message: e.to_string(),
        })
    }
}

impl fmt::Display for DataKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

#[derive(Deserialize)]
struct DeletedMarker {
    #[serde(default)]
    version: i64,
    #[serde(default)]
    deleted: bool,
}

/// A versioned item, or a tombstone when `item` is `None`.
#[derive(Clone, Debug, PartialEq)]
pub struct ItemDescriptor {
    pub version: i64,
    pub item: Option<Arc<StoreItem>>,
}

impl ItemDescriptor {
    pub fn new(version: i64, item: StoreItem) -> Self {
        ItemDescriptor {
            version,
            item: Some(Arc::new(item)),
        }
    }

    pub fn tombstone(version: i64) -> Self {
        ItemDescriptor {
            version,
            item: None,
        }
    }

    pub fn from_flag(flag: FeatureFlag) -> Self {
        if flag.deleted {
            ItemDescriptor::tombstone(flag.version)
        } else {
            ItemDescriptor::new(flag.version, StoreItem::Flag(flag))
        }
    }

    pub fn from_segment(segment: Segment) -> Self {
        if segment.deleted {
            ItemDescriptor::tombstone(segment.version)
        } else {
            ItemDescriptor::new(segment.version, StoreItem::Segment(segment))
        }
    }

    pub fn is_tombstone(&self) -> bool {
        self.item.is_none()
    }

    pub fn as_flag(&self) -> Option<&FeatureFlag> {
        self.item.as_deref().and_then(StoreItem::as_flag)
    }
}

#[derive(Clone, Debug, PartialEq)]
pub struct KeyedItem {
    pub key: String,
    pub item: ItemDescriptor,
}

impl KeyedItem {
    pub fn new<K: Into<String>>(key: K, item: ItemDescriptor) -> Self {
        KeyedItem {
            key: key.into(),
            item,
        }
    }
}

/// Every item of one kind; the unit of a full replace.
#[derive(Clone, Debug, PartialEq)]
pub struct Collection {
    pub kind: DataKind,
    pub items: Vec<KeyedItem>,
}

impl Collection {
    pub fn new(kind: DataKind, items: Vec<KeyedItem>) -> Self {
        Collection { kind, items }
    }
}

/// The persistent-store representation of an item.
#[derive(Clone, Debug, PartialEq)]
pub struct SerializedItem {
    pub version: i64,
    pub deleted: bool,
    pub bytes: Vec<u8>,
}

#[derive(Clone, Debug, PartialEq)]
pub struct KeyedSerializedItem {
    pub key: String,
    pub item: SerializedItem,
}

#[derive(Clone, Debug, PartialEq)]
pub struct SerializedCollection {
    pub kind: DataKind,
    pub items: Vec<KeyedSerializedItem>,
}
