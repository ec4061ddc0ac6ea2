//! Payloads of the upstream change feed.

use crate::errors::ProtocolError;
use crate::kinds::{Collection, DataKind, ItemDescriptor, KeyedItem};
use serde::Deserialize;
use serde_json::Value;
use std::collections::HashMap;

pub const PUT_EVENT: &str = "put";
pub const PATCH_EVENT: &str = "patch";
pub const DELETE_EVENT: &str = "delete";
pub(crate) const POLL_RESPONSE: &str = "poll";

/// A full data set, as sent in a `put` event or a poll response.
#[derive(Debug, Default, Deserialize)]
pub struct AllData {
    #[serde(default)]
    pub flags: HashMap<String, Value>,
    #[serde(default)]
    pub segments: HashMap<String, Value>,
}

impl AllData {
    pub fn into_collections(self, event: &'static str) -> Result<Vec<Collection>, ProtocolError> {
        Ok(vec![
            parse_collection(event, DataKind::Features, self.flags)?,
            parse_collection(event, DataKind::Segments, self.segments)?,
        ])
    }
}

fn parse_collection(
    event: &'static str,
    kind: DataKind,
    items: HashMap<String, Value>,
) -> Result<Collection, ProtocolError> {
    let items = items
        .into_iter()
        .map(|(key, value)| match kind.parse_item(value) {
            Ok(item) => Ok(KeyedItem::new(key, item)),
            Err(source) => Err(ProtocolError::Item {
                event,
                kind,
                key,
                source,
            }),
        })
        .collect::<Result<Vec<_>, _>>()?;
    Ok(Collection::new(kind, items))
}

/// A single-item change from a `patch` or `delete` event.
#[derive(Clone, Debug, PartialEq)]
pub struct ItemUpdate {
    pub kind: DataKind,
    pub key: String,
    pub item: ItemDescriptor,
}

#[derive(Deserialize)]
struct PutData {
    #[serde(default)]
    data: AllData,
}

#[derive(Deserialize)]
struct PatchData {
    path: Option<String>,
    data: Value,
}

#[derive(Deserialize)]
struct DeleteData {
    path: Option<String>,
    version: i64,
}

/// Maps `/flags/<key>` and `/segments/<key>` to a kind and key.
pub fn parse_path(path: &str) -> Option<(DataKind, &str)> {
    if let Some(key) = path.strip_prefix("/flags/") {
        return Some((DataKind::Features, key));
    }
    path.strip_prefix("/segments/")
        .map(|key| (DataKind::Segments, key))
}

pub fn parse_put(data: &str) -> Result<Vec<Collection>, ProtocolError> {
    let put: PutData = serde_json::from_str(data).map_err(|source| ProtocolError::Json {
        event: PUT_EVENT,
        source,
    })?;
    put.data.into_collections(PUT_EVENT)
}

/// Returns `None` when the path names a kind this relay does not store.
pub fn parse_patch(data: &str) -> Result<Option<ItemUpdate>, ProtocolError> {
    let patch: PatchData = serde_json::from_str(data).map_err(|source| ProtocolError::Json {
        event: PATCH_EVENT,
        source,
    })?;
    let path = patch.path.ok_or(ProtocolError::MissingPath { event: PATCH_EVENT })?;
    let Some((kind, key)) = parse_path(&path) else {
        return Ok(None);
    };
    let item = kind
        .parse_item(patch.data)
        .map_err(|source| ProtocolError::Item {
            event: PATCH_EVENT,
            kind,
            key: key.to_string(),
            source,
        })?;
    Ok(Some(ItemUpdate {
        kind,
        key: key.to_string(),
        item,
    }))
}

/// Returns `None` when the path names a kind this relay does not store.
pub fn parse_delete(data: &str) -> Result<Option<ItemUpdate>, ProtocolError> {
    let delete: DeleteData = serde_json::from_str(data).map_err(|source| ProtocolError::Json {
        event: DELETE_EVENT,
        source,
    })?;
    let path = delete.path.ok_or(ProtocolError::MissingPath { event: DELETE_EVENT })?;
    Ok(parse_path(&path).map(|(kind, key)| ItemUpdate {
        kind,
        key: key.to_string(),
        item: ItemDescriptor::tombstone(delete.version),
    }))
}
