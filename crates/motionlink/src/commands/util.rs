//! Shared command helpers.

use motionlink_core::{DeviceId, DeviceMap};

use crate::error::CliError;

/// Resolve a user-supplied device reference against the mirror.
///
/// An exact id wins; otherwise a case-insensitive display name must match
/// exactly one device.
pub fn resolve_device(devices: &DeviceMap, query: &str) -> Result<DeviceId, CliError> {
    let id = DeviceId::new(query);
    if devices.contains_key(&id) {
        return Ok(id);
    }

    let mut by_name = devices
        .values()
        .filter(|d| d.display_name.eq_ignore_ascii_case(query));
    match (by_name.next(), by_name.next()) {
        (Some(device), None) => Ok(device.id.clone()),
        (Some(_), Some(_)) => Err(CliError::Validation {
            field: "device".into(),
            reason: format!("'{query}' matches more than one device name; use the id"),
        }),
        (None, _) => Err(CliError::NotFound {
            resource_type: "device".into(),
            identifier: query.into(),
            list_command: "devices list".into(),
        }),
    }
}
