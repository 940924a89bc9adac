//! Volume Settings
//!
//! [`Volume`] holds every setting a volume may carry. Each field is either
//! unset or explicitly set; the accessors return the documented default for
//! unset fields.

use super::quantity::parse_quantity;
use super::{
    Origin, Persistency, CACHE_SIZE, EPHEMERAL, ERASE_AFTER, NAME, PERSISTENCY_MODEL,
    POD_INFO_PREFIX, PROVISIONER_ID, SIZE, VOLUME_ID,
};
use crate::error::{Error, Result};
use std::collections::BTreeMap;

/// String map representation of a [`Volume`], as stored in the volume
/// context and in the node volume list
pub type VolumeContext = BTreeMap<String, String>;

/// All settings for a volume
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Volume {
    pub cache_size: Option<u32>,
    pub erase_after: Option<bool>,
    pub name: Option<String>,
    pub persistency: Option<Persistency>,
    pub size: Option<i64>,
    pub volume_id: Option<String>,
}

impl Volume {
    /// Number of nodes for a cache volume, 1 if unset
    pub fn cache_size(&self) -> u32 {
        self.cache_size.unwrap_or(1)
    }

    /// Whether the device gets erased on delete, `true` if unset
    pub fn erase_after(&self) -> bool {
        self.erase_after.unwrap_or(true)
    }

    pub fn name(&self) -> &str {
        self.name.as_deref().unwrap_or_default()
    }

    /// Persistency model, [`Persistency::Normal`] if unset
    pub fn persistency(&self) -> Persistency {
        self.persistency.unwrap_or_default()
    }

    /// Size in bytes, 0 if unset
    pub fn size(&self) -> i64 {
        self.size.unwrap_or_default()
    }

    pub fn volume_id(&self) -> &str {
        self.volume_id.as_deref().unwrap_or_default()
    }

    /// Serialize the explicitly set fields back into a string map.
    ///
    /// The volume ID is never included; it is tracked separately wherever
    /// the context is persisted.
    pub fn to_context(&self) -> VolumeContext {
        let mut context = VolumeContext::new();

        if let Some(cache_size) = self.cache_size {
            context.insert(CACHE_SIZE.to_string(), cache_size.to_string());
        }
        if let Some(erase_after) = self.erase_after {
            context.insert(ERASE_AFTER.to_string(), erase_after.to_string());
        }
        if let Some(name) = &self.name {
            context.insert(NAME.to_string(), name.clone());
        }
        if let Some(persistency) = self.persistency {
            context.insert(PERSISTENCY_MODEL.to_string(), persistency.to_string());
        }
        if let Some(size) = self.size {
            context.insert(SIZE.to_string(), size.to_string());
        }

        context
    }
}

// =============================================================================
// Parsing
// =============================================================================

/// Parse a parameter map of the given origin into a [`Volume`].
///
/// Keys are processed in sorted order, so the first reported error does not
/// depend on map iteration order. When both the ephemeral flag and an
/// explicit `persistencyModel` are present, the explicit key wins.
pub fn parse(origin: Origin, params: &BTreeMap<String, String>) -> Result<Volume> {
    let mut volume = Volume::default();
    let mut explicit_persistency = None;
    let mut ephemeral_flag = false;

    for (key, value) in params {
        if !origin.allows(key) {
            return Err(Error::ParameterNotAllowed { key: key.clone() });
        }

        match key.as_str() {
            NAME => volume.name = Some(value.clone()),
            // Provided by the master controller, needed for cache volumes
            VOLUME_ID => volume.volume_id = Some(value.clone()),
            PERSISTENCY_MODEL => {
                explicit_persistency = Some(parse_persistency(origin, key, value)?);
            }
            CACHE_SIZE => volume.cache_size = Some(parse_cache_size(key, value)?),
            SIZE => {
                let size = parse_quantity(value).map_err(|e| invalid_value(key, value, e))?;
                volume.size = Some(size);
            }
            ERASE_AFTER => volume.erase_after = Some(parse_bool(key, value)?),
            EPHEMERAL => ephemeral_flag = parse_bool(key, value)?,
            PROVISIONER_ID => {}
            _ => {
                if !key.starts_with(POD_INFO_PREFIX) {
                    return Err(Error::UnknownParameter { key: key.clone() });
                }
            }
        }
    }

    volume.persistency = explicit_persistency.or(ephemeral_flag.then_some(Persistency::Ephemeral));

    if volume.cache_size.is_some() && volume.persistency() != Persistency::Cache {
        return Err(Error::ParameterConflict {
            key: CACHE_SIZE.to_string(),
            other_key: PERSISTENCY_MODEL.to_string(),
            other_value: volume.persistency().to_string(),
        });
    }
    if origin == Origin::EphemeralVolume && volume.size.is_none() {
        return Err(Error::MissingParameter {
            key: SIZE.to_string(),
        });
    }

    Ok(volume)
}

fn invalid_value(key: &str, value: &str, reason: impl std::fmt::Display) -> Error {
    Error::InvalidParameterValue {
        key: key.to_string(),
        value: value.to_string(),
        reason: reason.to_string(),
    }
}

fn parse_persistency(origin: Origin, key: &str, value: &str) -> Result<Persistency> {
    match value {
        "normal" => Ok(Persistency::Normal),
        "cache" => Ok(Persistency::Cache),
        // Legacy alias from releases <= 0.5
        "none" => Ok(Persistency::Normal),
        "ephemeral" if origin == Origin::NodeVolume => Ok(Persistency::Ephemeral),
        "ephemeral" => Err(invalid_value(key, value, "value invalid in this context")),
        _ => Err(invalid_value(key, value, "unknown value")),
    }
}

fn parse_cache_size(key: &str, value: &str) -> Result<u32> {
    if !value.starts_with(|c: char| c.is_ascii_digit()) {
        return Err(invalid_value(key, value, "failed to parse as uint"));
    }
    value
        .parse::<u32>()
        .map_err(|e| invalid_value(key, value, format!("failed to parse as uint: {e}")))
}

/// Accepts the same spellings as Go's `strconv.ParseBool`, which is what
/// existing volume contexts were written with.
fn parse_bool(key: &str, value: &str) -> Result<bool> {
    match value {
        "1" | "t" | "T" | "true" | "TRUE" | "True" => Ok(true),
        "0" | "f" | "F" | "false" | "FALSE" | "False" => Ok(false),
        _ => Err(invalid_value(key, value, "failed to parse as boolean")),
    }
}
