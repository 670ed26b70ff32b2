// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Parameter metadata, current values and device mappings.
//!
//! Writes are validated against metadata (read/write flag, numeric
//! min/max) before anything touches a device or the value table. Reads
//! resolve the *effective value*: current value if set, else the metadata
//! default, else `"0"`.
//!
//! Domain rejections are values, not errors: operations that can refuse a
//! write return a [`Verdict`] so every refusal maps onto exactly one
//! `NAK_*` reply tag. A `Result::Err` here always means the backing store
//! itself failed.

use crate::protocol::NakKind;
use crate::store::{now_ts, Db};
use anyhow::Result;
use rusqlite::{params, OptionalExtension, Row};
use serde::{Deserialize, Serialize};

/// Outcome of a validated mutation.
#[derive(Debug, Clone, PartialEq)]
pub enum Verdict {
    Accepted,
    Rejected(NakKind),
}

impl Verdict {
    #[must_use]
    pub fn is_accepted(&self) -> bool {
        matches!(self, Self::Accepted)
    }
}

/// Static description of one parameter.
#[derive(Debug, Clone, PartialEq, Serialize, Default)]
pub struct ParamMeta {
    pub pkey: String,
    pub ptype: String,
    pub pid: String,
    pub min: Option<f64>,
    pub max: Option<f64>,
    pub default: Option<String>,
    pub unit: Option<String>,
    pub rw: Option<String>,
    pub dtype: Option<String>,
    pub name: Option<String>,
    pub message: Option<String>,
}

impl ParamMeta {
    fn from_row(row: &Row) -> rusqlite::Result<Self> {
        Ok(Self {
            pkey: row.get(0)?,
            ptype: row.get(1)?,
            pid: row.get(2)?,
            min: row.get(3)?,
            max: row.get(4)?,
            default: row.get(5)?,
            unit: row.get(6)?,
            rw: row.get(7)?,
            dtype: row.get(8)?,
            name: row.get(9)?,
            message: row.get(10)?,
        })
    }
}

const META_COLUMNS: &str = "pkey, ptype, pid, min_v, max_v, default_v, unit, rw, dtype, name, message";

/// How a parameter maps onto its device's wire protocol.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct DeviceMap {
    /// Key override for the line-protocol PLC; the pkey itself when unset.
    pub line_key: Option<String>,
    /// ZBC message id; 0x500A when unset.
    pub zbc_message_id: Option<u16>,
    /// ZBC command id; reads and writes fail with `NAK_MappingMissing`
    /// without one.
    pub zbc_command_id: Option<u16>,
    pub zbc_codec: Option<String>,
    pub zbc_scale: Option<f64>,
    pub zbc_offset: Option<f64>,
    pub ult_set_cmd: Option<String>,
    pub ult_get_cmd: Option<String>,
    pub ult_var: Option<String>,
}

impl DeviceMap {
    fn from_row(row: &Row) -> rusqlite::Result<Self> {
        Ok(Self {
            line_key: row.get(0)?,
            zbc_message_id: row.get::<_, Option<i64>>(1)?.map(|v| v as u16),
            zbc_command_id: row.get::<_, Option<i64>>(2)?.map(|v| v as u16),
            zbc_codec: row.get(3)?,
            zbc_scale: row.get(4)?,
            zbc_offset: row.get(5)?,
            ult_set_cmd: row.get(6)?,
            ult_get_cmd: row.get(7)?,
            ult_var: row.get(8)?,
        })
    }
}

/// Partial metadata edit; unset fields keep their stored value.
#[derive(Debug, Clone, Default)]
pub struct MetaPatch {
    pub default: Option<String>,
    pub min: Option<f64>,
    pub max: Option<f64>,
    pub rw: Option<String>,
}

/// One row of the admin listing: metadata plus resolved values.
#[derive(Debug, Clone, Serialize)]
pub struct ParamListing {
    #[serde(flatten)]
    pub meta: ParamMeta,
    pub current: Option<String>,
    pub effective: String,
}

/// Parameter table access.
#[derive(Debug, Clone)]
pub struct ParamStore {
    db: Db,
}

impl ParamStore {
    #[must_use]
    pub fn new(db: Db) -> Self {
        Self { db }
    }

    /// Insert or replace a parameter's metadata.
    pub fn upsert_meta(&self, meta: &ParamMeta) -> Result<()> {
        let conn = self.db.conn()?;
        conn.execute(
            "INSERT INTO params (pkey, ptype, pid, min_v, max_v, default_v, unit, rw, dtype, name, message, updated_ts)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12)
             ON CONFLICT(pkey) DO UPDATE SET
               ptype = excluded.ptype,
               pid = excluded.pid,
               min_v = excluded.min_v,
               max_v = excluded.max_v,
               default_v = excluded.default_v,
               unit = excluded.unit,
               rw = excluded.rw,
               dtype = excluded.dtype,
               name = excluded.name,
               message = excluded.message,
               updated_ts = excluded.updated_ts",
            params![
                meta.pkey,
                meta.ptype,
                meta.pid,
                meta.min,
                meta.max,
                meta.default,
                meta.unit,
                meta.rw.as_deref().map(normalize_rw_lossy),
                meta.dtype,
                meta.name,
                meta.message,
                now_ts(),
            ],
        )?;
        Ok(())
    }

    /// Insert or replace a parameter's device mapping.
    pub fn set_device_map(&self, pkey: &str, map: &DeviceMap) -> Result<()> {
        let conn = self.db.conn()?;
        conn.execute(
            "INSERT INTO param_device_map
               (pkey, line_key, zbc_message_id, zbc_command_id, zbc_codec, zbc_scale, zbc_offset,
                ult_set_cmd, ult_get_cmd, ult_var)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)
             ON CONFLICT(pkey) DO UPDATE SET
               line_key = excluded.line_key,
               zbc_message_id = excluded.zbc_message_id,
               zbc_command_id = excluded.zbc_command_id,
               zbc_codec = excluded.zbc_codec,
               zbc_scale = excluded.zbc_scale,
               zbc_offset = excluded.zbc_offset,
               ult_set_cmd = excluded.ult_set_cmd,
               ult_get_cmd = excluded.ult_get_cmd,
               ult_var = excluded.ult_var",
            params![
                pkey,
                map.line_key,
                map.zbc_message_id.map(i64::from),
                map.zbc_command_id.map(i64::from),
                map.zbc_codec,
                map.zbc_scale,
                map.zbc_offset,
                map.ult_set_cmd,
                map.ult_get_cmd,
                map.ult_var,
            ],
        )?;
        Ok(())
    }

    pub fn get_meta(&self, pkey: &str) -> Result<Option<ParamMeta>> {
        let conn = self.db.conn()?;
        let meta = conn
            .query_row(
                &format!("SELECT {META_COLUMNS} FROM params WHERE pkey = ?1"),
                params![pkey],
                ParamMeta::from_row,
            )
            .optional()?;
        Ok(meta)
    }

    /// Device mapping for a pkey; defaults when no row exists.
    pub fn get_device_map(&self, pkey: &str) -> Result<DeviceMap> {
        let conn = self.db.conn()?;
        let map = conn
            .query_row(
                "SELECT line_key, zbc_message_id, zbc_command_id, zbc_codec, zbc_scale, zbc_offset,
                        ult_set_cmd, ult_get_cmd, ult_var
                 FROM param_device_map WHERE pkey = ?1",
                params![pkey],
                DeviceMap::from_row,
            )
            .optional()?;
        Ok(map.unwrap_or_default())
    }

    pub fn get_value(&self, pkey: &str) -> Result<Option<String>> {
        let conn = self.db.conn()?;
        let value = conn
            .query_row(
                "SELECT value FROM param_values WHERE pkey = ?1",
                params![pkey],
                |row| row.get(0),
            )
            .optional()?;
        Ok(value)
    }

    /// Current value if present, else the metadata default, else `"0"`.
    pub fn get_effective_value(&self, pkey: &str) -> Result<String> {
        if let Some(value) = self.get_value(pkey)? {
            return Ok(value);
        }
        let default = self.get_meta(pkey)?.and_then(|m| m.default);
        Ok(default.unwrap_or_else(|| "0".to_string()))
    }

    /// Run the write checks without touching anything.
    pub fn validate_write(&self, pkey: &str, value: &str) -> Result<Verdict> {
        let Some(meta) = self.get_meta(pkey)? else {
            return Ok(Verdict::Rejected(NakKind::UnknownParam));
        };
        Ok(check_write(&meta, value))
    }

    /// Validated write from the peer side.
    ///
    /// On success the new value is also written into the metadata default,
    /// so a later restart resolves the same effective value without a device
    /// round-trip.
    pub fn set_value(&self, pkey: &str, value: &str) -> Result<Verdict> {
        let Some(meta) = self.get_meta(pkey)? else {
            return Ok(Verdict::Rejected(NakKind::UnknownParam));
        };
        let verdict = check_write(&meta, value);
        if !verdict.is_accepted() {
            return Ok(verdict);
        }

        let ts = now_ts();
        let conn = self.db.conn()?;
        conn.execute(
            "INSERT INTO param_values (pkey, value, updated_ts) VALUES (?1, ?2, ?3)
             ON CONFLICT(pkey) DO UPDATE SET value = excluded.value, updated_ts = excluded.updated_ts",
            params![pkey, value, ts],
        )?;
        conn.execute(
            "UPDATE params SET default_v = ?1, updated_ts = ?2 WHERE pkey = ?3",
            params![value, ts, pkey],
        )?;
        Ok(Verdict::Accepted)
    }

    /// Record a value reported by a device.
    ///
    /// Skips the read/write check: the R flag only guards peer writes, not
    /// incoming status from the device itself.
    pub fn apply_device_value(&self, pkey: &str, value: &str) -> Result<Verdict> {
        if self.get_meta(pkey)?.is_none() {
            return Ok(Verdict::Rejected(NakKind::UnknownParam));
        }

        let conn = self.db.conn()?;
        conn.execute(
            "INSERT INTO param_values (pkey, value, updated_ts) VALUES (?1, ?2, ?3)
             ON CONFLICT(pkey) DO UPDATE SET value = excluded.value, updated_ts = excluded.updated_ts",
            params![pkey, value, now_ts()],
        )?;
        Ok(Verdict::Accepted)
    }

    /// Partial metadata edit with consistency checks.
    pub fn update_meta(&self, pkey: &str, patch: &MetaPatch) -> Result<Verdict> {
        let Some(meta) = self.get_meta(pkey)? else {
            return Ok(Verdict::Rejected(NakKind::UnknownParam));
        };

        let new_min = patch.min.or(meta.min);
        let new_max = patch.max.or(meta.max);
        let new_default = patch.default.clone().or(meta.default);

        let new_rw = match &patch.rw {
            None => meta.rw,
            Some(raw) => match normalize_rw(raw) {
                Ok(rw) => rw,
                Err(()) => return Ok(Verdict::Rejected(NakKind::BadRw)),
            },
        };

        if let (Some(min), Some(max)) = (new_min, new_max) {
            if min > max {
                return Ok(Verdict::Rejected(NakKind::MinGreaterThanMax));
            }
        }

        if let Some(default) = new_default.as_deref() {
            if let Ok(v) = default.trim().parse::<f64>() {
                if new_min.is_some_and(|min| v < min) || new_max.is_some_and(|max| v > max) {
                    return Ok(Verdict::Rejected(NakKind::DefaultOutOfRange));
                }
            }
        }

        let conn = self.db.conn()?;
        conn.execute(
            "UPDATE params SET default_v = ?1, min_v = ?2, max_v = ?3, rw = ?4, updated_ts = ?5
             WHERE pkey = ?6",
            params![new_default, new_min, new_max, new_rw, now_ts(), pkey],
        )?;
        Ok(Verdict::Accepted)
    }

    /// Listing for the admin API: metadata joined with resolved values.
    pub fn list(
        &self,
        ptype: Option<&str>,
        query: Option<&str>,
        limit: u32,
        offset: u32,
    ) -> Result<Vec<ParamListing>> {
        let limit = limit.clamp(1, 1000);
        let conn = self.db.conn()?;

        let mut sql = format!("SELECT {META_COLUMNS} FROM params");
        let mut clauses = Vec::new();
        let mut args: Vec<Box<dyn rusqlite::ToSql>> = Vec::new();
        if let Some(ptype) = ptype {
            clauses.push("ptype = ?");
            args.push(Box::new(ptype.to_string()));
        }
        if let Some(q) = query {
            clauses.push("(pkey LIKE ? OR name LIKE ? OR message LIKE ?)");
            let like = format!("%{}%", q);
            args.push(Box::new(like.clone()));
            args.push(Box::new(like.clone()));
            args.push(Box::new(like));
        }
        if !clauses.is_empty() {
            sql.push_str(" WHERE ");
            sql.push_str(&clauses.join(" AND "));
        }
        sql.push_str(" ORDER BY ptype ASC, pid ASC LIMIT ? OFFSET ?");
        args.push(Box::new(limit));
        args.push(Box::new(offset));

        let mut stmt = conn.prepare(&sql)?;
        let metas = stmt
            .query_map(
                rusqlite::params_from_iter(args.iter().map(|a| a.as_ref())),
                ParamMeta::from_row,
            )?
            .collect::<rusqlite::Result<Vec<_>>>()?;

        let mut out = Vec::with_capacity(metas.len());
        for meta in metas {
            let current = self.get_value(&meta.pkey)?;
            let effective = current
                .clone()
                .or_else(|| meta.default.clone())
                .unwrap_or_else(|| "0".to_string());
            out.push(ParamListing {
                meta,
                current,
                effective,
            });
        }
        Ok(out)
    }
}

/// Write checks shared by `set_value` and `validate_write`: read-only flag,
/// then numeric range when the value parses as a number.
fn check_write(meta: &ParamMeta, value: &str) -> Verdict {
    let rw = meta.rw.as_deref().unwrap_or("").trim().to_ascii_uppercase();
    if rw == "R" {
        return Verdict::Rejected(NakKind::ReadOnly);
    }

    if let Ok(v) = value.trim().parse::<f64>() {
        if meta.min.is_some_and(|min| v < min) || meta.max.is_some_and(|max| v > max) {
            return Verdict::Rejected(NakKind::OutOfRange);
        }
    }

    Verdict::Accepted
}

/// Canonicalize a read/write flag; `Err` on anything outside {R, W, R/W, ""}.
fn normalize_rw(raw: &str) -> Result<Option<String>, ()> {
    let upper = raw.trim().to_ascii_uppercase();
    match upper.as_str() {
        "" => Ok(None),
        "R" | "W" => Ok(Some(upper)),
        "R/W" | "RW" | "R_W" => Ok(Some("R/W".to_string())),
        _ => Err(()),
    }
}

/// Canonicalize where rejection is not an option (bulk metadata import);
/// unknown flags are stored as-is, uppercased.
fn normalize_rw_lossy(raw: &str) -> String {
    normalize_rw(raw)
        .ok()
        .flatten()
        .unwrap_or_else(|| raw.trim().to_ascii_uppercase())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::testutil::temp_db;

    fn meta(pkey: &str, ptype: &str, pid: &str) -> ParamMeta {
        ParamMeta {
            pkey: pkey.to_string(),
            ptype: ptype.to_string(),
            pid: pid.to_string(),
            ..Default::default()
        }
    }

    fn seeded() -> (tempfile::TempDir, ParamStore) {
        let (dir, db) = temp_db();
        let store = ParamStore::new(db);
        store
            .upsert_meta(&ParamMeta {
                min: Some(0.0),
                max: Some(1000.0),
                default: Some("0".to_string()),
                rw: Some("R/W".to_string()),
                ..meta("MAP0001", "MAP", "0001")
            })
            .expect("seed MAP0001");
        store
            .upsert_meta(&ParamMeta {
                default: Some("75".to_string()),
                rw: Some("R/W".to_string()),
                ..meta("TTP00002", "TTP", "00002")
            })
            .expect("seed TTP00002");
        store
            .upsert_meta(&ParamMeta {
                rw: Some("R".to_string()),
                ..meta("TTE0004", "TTE", "0004")
            })
            .expect("seed TTE0004");
        (dir, store)
    }

    #[test]
    fn test_effective_value_resolution() {
        let (_dir, store) = seeded();

        // default when no current value
        assert_eq!(store.get_effective_value("TTP00002").expect("eff"), "75");
        // "0" when neither exists
        assert_eq!(store.get_effective_value("TTE0004").expect("eff"), "0");

        store.set_value("TTP00002", "80").expect("set");
        assert_eq!(store.get_effective_value("TTP00002").expect("eff"), "80");
    }

    #[test]
    fn test_set_value_unknown_param() {
        let (_dir, store) = seeded();
        assert_eq!(
            store.set_value("ZZZ0001", "1").expect("set"),
            Verdict::Rejected(NakKind::UnknownParam)
        );
    }

    #[test]
    fn test_set_value_readonly() {
        let (_dir, store) = seeded();
        assert_eq!(
            store.set_value("TTE0004", "1").expect("set"),
            Verdict::Rejected(NakKind::ReadOnly)
        );
        assert!(store.get_value("TTE0004").expect("get").is_none());
    }

    #[test]
    fn test_set_value_range() {
        let (_dir, store) = seeded();

        // boundary values are accepted
        assert!(store.set_value("MAP0001", "0").expect("set").is_accepted());
        assert!(store.set_value("MAP0001", "1000").expect("set").is_accepted());

        assert_eq!(
            store.set_value("MAP0001", "1001").expect("set"),
            Verdict::Rejected(NakKind::OutOfRange)
        );
        assert_eq!(
            store.set_value("MAP0001", "-1").expect("set"),
            Verdict::Rejected(NakKind::OutOfRange)
        );
        // the rejected write left the last accepted value in place
        assert_eq!(store.get_value("MAP0001").expect("get").as_deref(), Some("1000"));
    }

    #[test]
    fn test_set_value_non_numeric_skips_range() {
        let (_dir, store) = seeded();
        assert!(store.set_value("MAP0001", "auto").expect("set").is_accepted());
    }

    #[test]
    fn test_set_value_updates_default() {
        let (_dir, store) = seeded();
        store.set_value("MAP0001", "500").expect("set");
        let meta = store.get_meta("MAP0001").expect("meta").expect("present");
        assert_eq!(meta.default.as_deref(), Some("500"));
    }

    #[test]
    fn test_apply_device_value_bypasses_rw() {
        let (_dir, store) = seeded();
        assert!(store
            .apply_device_value("TTE0004", "ERR_7")
            .expect("apply")
            .is_accepted());
        assert_eq!(store.get_value("TTE0004").expect("get").as_deref(), Some("ERR_7"));

        assert_eq!(
            store.apply_device_value("ZZZ0001", "1").expect("apply"),
            Verdict::Rejected(NakKind::UnknownParam)
        );
    }

    #[test]
    fn test_update_meta_checks() {
        let (_dir, store) = seeded();

        assert_eq!(
            store
                .update_meta("MAP0001", &MetaPatch { rw: Some("X".into()), ..Default::default() })
                .expect("update"),
            Verdict::Rejected(NakKind::BadRw)
        );
        assert_eq!(
            store
                .update_meta(
                    "MAP0001",
                    &MetaPatch { min: Some(10.0), max: Some(5.0), ..Default::default() }
                )
                .expect("update"),
            Verdict::Rejected(NakKind::MinGreaterThanMax)
        );
        assert_eq!(
            store
                .update_meta(
                    "MAP0001",
                    &MetaPatch { default: Some("2000".into()), ..Default::default() }
                )
                .expect("update"),
            Verdict::Rejected(NakKind::DefaultOutOfRange)
        );

        assert!(store
            .update_meta(
                "MAP0001",
                &MetaPatch {
                    min: Some(0.0),
                    max: Some(400.0),
                    rw: Some("rw".into()),
                    ..Default::default()
                }
            )
            .expect("update")
            .is_accepted());

        let meta = store.get_meta("MAP0001").expect("meta").expect("present");
        assert_eq!(meta.max, Some(400.0));
        assert_eq!(meta.rw.as_deref(), Some("R/W"));
    }

    #[test]
    fn test_device_map_roundtrip_and_default() {
        let (_dir, store) = seeded();

        // no row yet: defaults
        let map = store.get_device_map("TTP00002").expect("map");
        assert_eq!(map, DeviceMap::default());

        store
            .set_device_map(
                "TTP00002",
                &DeviceMap {
                    zbc_command_id: Some(0x0042),
                    zbc_codec: Some("u16le".to_string()),
                    zbc_scale: Some(0.1),
                    ..Default::default()
                },
            )
            .expect("set map");

        let map = store.get_device_map("TTP00002").expect("map");
        assert_eq!(map.zbc_command_id, Some(0x0042));
        assert_eq!(map.zbc_scale, Some(0.1));
        assert!(map.line_key.is_none());
    }

    #[test]
    fn test_list_filters() {
        let (_dir, store) = seeded();

        let all = store.list(None, None, 100, 0).expect("list");
        assert_eq!(all.len(), 3);

        let maps = store.list(Some("MAP"), None, 100, 0).expect("list");
        assert_eq!(maps.len(), 1);
        assert_eq!(maps[0].meta.pkey, "MAP0001");
        assert_eq!(maps[0].effective, "0");

        let hits = store.list(None, Some("TTP0000"), 100, 0).expect("list");
        assert_eq!(hits.len(), 1);
        assert_eq!(hits[0].meta.pkey, "TTP00002");
    }
}
