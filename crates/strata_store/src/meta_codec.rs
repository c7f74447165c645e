//! Meta-table row codec.
//!
//! The meta table is an ordinary sorted KV table with three record kinds,
//! distinguished by key shape so that a full scan yields table records first,
//! then tablet records grouped per table in range order, then user records:
//!
//! - table record:  `@<table_name>`                (`'@'` sorts before ASCII names)
//! - tablet record: `<table_name>\x00<start_key>`
//! - user record:   `~<user_name>`                 (`'~'` sorts after ASCII names)
//!
//! Values are JSON documents of the corresponding meta type.

use anyhow::Context;

use crate::meta::{TableMeta, TabletMeta, UserMeta};

pub const TABLE_KEY_PREFIX: u8 = b'@';
pub const USER_KEY_PREFIX: u8 = b'~';
const TABLET_KEY_SEPARATOR: u8 = 0x00;

/// A decoded meta-table key.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MetaKey {
    Table(String),
    Tablet { table: String, start: Vec<u8> },
    User(String),
}

pub fn encode_table_key(table: &str) -> Vec<u8> {
    let mut key = Vec::with_capacity(table.len() + 1);
    key.push(TABLE_KEY_PREFIX);
    key.extend_from_slice(table.as_bytes());
    key
}

pub fn encode_tablet_key(table: &str, start: &[u8]) -> Vec<u8> {
    let mut key = Vec::with_capacity(table.len() + 1 + start.len());
    key.extend_from_slice(table.as_bytes());
    key.push(TABLET_KEY_SEPARATOR);
    key.extend_from_slice(start);
    key
}

pub fn encode_user_key(user: &str) -> Vec<u8> {
    let mut key = Vec::with_capacity(user.len() + 1);
    key.push(USER_KEY_PREFIX);
    key.extend_from_slice(user.as_bytes());
    key
}

pub fn decode_meta_key(key: &[u8]) -> anyhow::Result<MetaKey> {
    anyhow::ensure!(!key.is_empty(), "empty meta key");
    match key[0] {
        TABLE_KEY_PREFIX => Ok(MetaKey::Table(
            String::from_utf8(key[1..].to_vec()).context("table key not utf8")?,
        )),
        USER_KEY_PREFIX => Ok(MetaKey::User(
            String::from_utf8(key[1..].to_vec()).context("user key not utf8")?,
        )),
        _ => {
            let sep = key
                .iter()
                .position(|&b| b == TABLET_KEY_SEPARATOR)
                .context("tablet key missing separator")?;
            Ok(MetaKey::Tablet {
                table: String::from_utf8(key[..sep].to_vec()).context("table name not utf8")?,
                start: key[sep + 1..].to_vec(),
            })
        }
    }
}

pub fn encode_table_value(meta: &TableMeta) -> anyhow::Result<Vec<u8>> {
    serde_json::to_vec(meta).context("serialize table meta")
}

pub fn decode_table_value(value: &[u8]) -> anyhow::Result<TableMeta> {
    serde_json::from_slice(value).context("deserialize table meta")
}

pub fn encode_tablet_value(meta: &TabletMeta) -> anyhow::Result<Vec<u8>> {
    serde_json::to_vec(meta).context("serialize tablet meta")
}

pub fn decode_tablet_value(value: &[u8]) -> anyhow::Result<TabletMeta> {
    serde_json::from_slice(value).context("deserialize tablet meta")
}

pub fn encode_user_value(meta: &UserMeta) -> anyhow::Result<Vec<u8>> {
    serde_json::to_vec(meta).context("serialize user meta")
}

pub fn decode_user_value(value: &[u8]) -> anyhow::Result<UserMeta> {
    serde_json::from_slice(value).context("deserialize user meta")
}

/// A fully packed meta record, ready for a batched meta write.
#[derive(Debug, Clone)]
pub struct MetaRecord {
    pub key: Vec<u8>,
    pub value: Vec<u8>,
    pub is_delete: bool,
}

impl MetaRecord {
    pub fn put(key: Vec<u8>, value: Vec<u8>) -> Self {
        Self {
            key,
            value,
            is_delete: false,
        }
    }

    pub fn delete(key: Vec<u8>) -> Self {
        Self {
            key,
            value: Vec::new(),
            is_delete: true,
        }
    }

    pub fn for_table(meta: &TableMeta) -> anyhow::Result<Self> {
        Ok(Self::put(encode_table_key(&meta.name), encode_table_value(meta)?))
    }

    pub fn for_tablet(meta: &TabletMeta) -> anyhow::Result<Self> {
        Ok(Self::put(
            encode_tablet_key(&meta.table_name, &meta.key_range.start),
            encode_tablet_value(meta)?,
        ))
    }

    pub fn for_user(meta: &UserMeta) -> anyhow::Result<Self> {
        Ok(Self::put(encode_user_key(&meta.name), encode_user_value(meta)?))
    }
}

/// Meta-table scan bounds covering the tablet records of `table` whose user
/// key ranges intersect [start, end). The start bound rounds down so the
/// tablet containing `start` is included.
pub fn meta_scan_range(table: &str, start: &[u8], end: &[u8]) -> (Vec<u8>, Vec<u8>) {
    let scan_start = encode_tablet_key(table, start);
    let scan_end = if end.is_empty() {
        // One past every tablet key of this table: bump the separator.
        let mut key = table.as_bytes().to_vec();
        key.push(TABLET_KEY_SEPARATOR + 1);
        key
    } else {
        encode_tablet_key(table, end)
    };
    (scan_start, scan_end)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::meta::{KeyRange, TableSchema, TabletStatus};

    #[test]
    fn key_kinds_sort_in_scan_order() {
        let table_key = encode_table_key("orders");
        let first_tablet = encode_tablet_key("orders", b"");
        let later_tablet = encode_tablet_key("orders", b"row9");
        let user_key = encode_user_key("alice");

        assert!(table_key < first_tablet);
        assert!(first_tablet < later_tablet);
        assert!(later_tablet < user_key);
    }

    #[test]
    fn meta_key_round_trip() {
        let cases = vec![
            MetaKey::Table("orders".into()),
            MetaKey::Tablet {
                table: "orders".into(),
                start: b"row\x01key".to_vec(),
            },
            MetaKey::User("alice".into()),
        ];
        for case in cases {
            let encoded = match &case {
                MetaKey::Table(t) => encode_table_key(t),
                MetaKey::Tablet { table, start } => encode_tablet_key(table, start),
                MetaKey::User(u) => encode_user_key(u),
            };
            assert_eq!(decode_meta_key(&encoded).unwrap(), case);
        }
    }

    #[test]
    fn table_and_tablet_values_round_trip() {
        let table = TableMeta::new(TableSchema::kv("orders"), 123);
        let encoded = encode_table_value(&table).unwrap();
        assert_eq!(decode_table_value(&encoded).unwrap(), table);

        let tablet = TabletMeta {
            table_name: "orders".into(),
            path: "orders/tablet00000001".into(),
            key_range: KeyRange::new(&b"a"[..], &b"m"[..]),
            server_addr: "ts1".into(),
            status: TabletStatus::Ready,
            data_size: 4096,
            lg_size: vec![4096],
            parents: vec![7],
            ..Default::default()
        };
        let encoded = encode_tablet_value(&tablet).unwrap();
        assert_eq!(decode_tablet_value(&encoded).unwrap(), tablet);
    }

    #[test]
    fn scan_range_covers_tail_of_table() {
        let (start, end) = meta_scan_range("orders", b"k", b"");
        assert!(start < end);
        assert!(encode_tablet_key("orders", b"zzzz") < end);
        // The next table's records are outside the bound.
        assert!(encode_tablet_key("orders2", b"") > end);
    }
}
